//! Core library for the Kinect Dump capture tool.
//!
//! A [`FrameSource`] subscribes to the readers of a motion sensor and hands
//! every acquired frame to the handler registered for its stream. The
//! provided handlers convert image frames to pixel buffers and write them as
//! PNG sequences or YUV4MPEG2 video, and write skeleton data as CSV.
//! Per-stream frame rates are tracked with [`RateWatch`] and published by
//! the [`report`] module.

pub mod body;
pub mod config;
pub mod convert;
pub mod dump;
pub mod error;
pub mod rate;
pub mod record;
pub mod report;
pub mod sensor;
pub mod source;
pub mod stream;

pub use body::{Body, Joint, JointType, TrackingState};
pub use config::{AppConfig, CaptureConfig, OutputConfig};
pub use convert::{Conversion, FrameConverter, PixelBuffer, PixelFormat};
pub use dump::{BodyDumper, StreamDumper};
pub use error::{DumpError, Result};
pub use rate::RateWatch;
pub use record::{FrameNamer, PngSequenceWriter, Recorder, RecordingSettings, StillSink, VideoSink};
pub use report::{format_status, RateBoard, StatusReporter, StreamReport};
pub use sensor::{RawFrame, Sensor, SimulatedSensor, SimulationSettings};
pub use source::{FrameHandler, FrameSource, SessionState};
pub use stream::{FrameDescription, ReliableRange, StreamKind, SyncMode};
