mod simulated;

use std::{sync::Arc, time::Duration};

use crate::{body::Body, FrameDescription, ReliableRange, Result, StreamKind};

pub use simulated::{DriverHandle, SimulatedSensor, SimulationSettings};

/// Borrowed view of one frame. Valid only while its [`FrameLock`] lives.
#[derive(Debug, Clone, Copy)]
pub struct RawFrame<'a> {
    pub kind: StreamKind,
    pub description: FrameDescription,
    /// Capture time relative to the device clock.
    pub relative_time: Duration,
    pub payload: FramePayload<'a>,
}

#[derive(Debug, Clone, Copy)]
pub enum FramePayload<'a> {
    /// Raw little-endian samples, plus the reliable range for depth and
    /// infrared frames.
    Samples {
        data: &'a [u8],
        reliable: Option<ReliableRange>,
    },
    /// Skeleton records for body frames.
    Bodies(&'a [Body]),
}

impl<'a> RawFrame<'a> {
    pub fn samples(&self) -> Option<&'a [u8]> {
        match self.payload {
            FramePayload::Samples { data, .. } => Some(data),
            FramePayload::Bodies(_) => None,
        }
    }

    pub fn bodies(&self) -> Option<&'a [Body]> {
        match self.payload {
            FramePayload::Bodies(bodies) => Some(bodies),
            FramePayload::Samples { .. } => None,
        }
    }
}

/// Scoped hold on a hardware frame buffer. Dropping it releases the buffer.
pub trait FrameLock {
    fn frame(&self) -> RawFrame<'_>;
}

/// One frame-ready notification.
pub trait FrameArrival {
    /// Acquires the sub-frame of `kind`. `Ok(None)` means no frame is ready
    /// for that kind on this notification.
    fn acquire(&self, kind: StreamKind) -> Result<Option<Box<dyn FrameLock + '_>>>;
}

/// Callback invoked by the driver for every notification of a reader.
pub type FrameCallback = Arc<dyn Fn(&dyn FrameArrival) + Send + Sync>;

/// An open hardware reader.
pub trait FrameReader: Send {
    /// The kinds this reader delivers.
    fn kinds(&self) -> &[StreamKind];

    fn subscribe(&mut self, callback: FrameCallback) -> Result<()>;

    /// Detaches the callback. No new notification is delivered afterwards.
    fn unsubscribe(&mut self);

    /// Releases the reader handle. Safe to call more than once.
    fn dispose(&mut self);
}

/// A motion-sensing device.
pub trait Sensor: Send + Sync {
    fn frame_description(&self, kind: StreamKind) -> Option<FrameDescription>;

    /// Opens a reader delivering one kind at its native rate.
    fn open_reader(&self, kind: StreamKind) -> Result<Box<dyn FrameReader>>;

    /// Opens a reader delivering all `kinds` as one correlated notification.
    fn open_multi_reader(&self, kinds: &[StreamKind]) -> Result<Box<dyn FrameReader>>;

    /// Starts the device. Idempotent.
    fn open(&self) -> Result<()>;

    /// Stops the device. Idempotent.
    fn close(&self);

    fn is_open(&self) -> bool;
}
