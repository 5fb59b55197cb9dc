use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use tracing::{debug, info, warn};

use crate::{
    body::tracked_count,
    config::OutputConfig,
    convert::{Conversion, FrameConverter, PixelFormat},
    record::{PngSequenceWriter, Recorder, RecordingSettings, StillSink, VideoLayout, VideoSink},
    sensor::RawFrame,
    source::FrameHandler,
    DumpError, FrameDescription, Result, StreamKind,
};

/// Converts the frames of one image stream and hands the result to a still
/// sink, a video sink, or both.
///
/// When a frame is dropped by validation the last good image is written
/// again so the video keeps its cadence. A sink failure closes the dumper
/// and surfaces as [`DumpError::WriteFailure`].
pub struct StreamDumper {
    converter: FrameConverter,
    stills: Option<Box<dyn StillSink>>,
    video: Option<Box<dyn VideoSink>>,
    has_image: bool,
    closed: bool,
}

impl StreamDumper {
    pub fn new(
        kind: StreamKind,
        stills: Option<Box<dyn StillSink>>,
        video: Option<Box<dyn VideoSink>>,
    ) -> Result<Self> {
        let converter = FrameConverter::new(kind, video.is_some()).ok_or_else(|| {
            DumpError::Configuration(format!("{kind} frames carry no image to dump"))
        })?;
        Ok(Self {
            converter,
            stills,
            video,
            has_image: false,
            closed: false,
        })
    }

    /// Builds the dumper described by `output`: a PNG sequence under
    /// `output_<kind>` and, when enabled, a video stream named after the
    /// configured prefix. A known `description` fixes the video resolution
    /// when the stream opens.
    pub fn from_config(
        kind: StreamKind,
        output: &OutputConfig,
        description: Option<FrameDescription>,
    ) -> Result<Self> {
        let stills = output
            .stills
            .then(|| Box::new(PngSequenceWriter::new(output.still_directory(kind))) as Box<dyn StillSink>);
        if !output.video {
            return Self::new(kind, stills, None);
        }

        let layout = match (description, PixelFormat::for_kind(kind)) {
            (Some(description), Some(format)) => Some(VideoLayout {
                width: description.width,
                height: description.height,
                format,
            }),
            _ => None,
        };
        let mut recorder = Recorder::new(RecordingSettings {
            output_path: output.video_path(kind),
            fps: output.video_fps,
            layout,
        });
        recorder.start()?;
        let mut dumper = Self::new(kind, stills, Some(Box::new(recorder)))?;
        if let Some(layout) = layout {
            dumper.converter.set_resolution(layout.width, layout.height);
        }
        Ok(dumper)
    }

    pub fn kind(&self) -> StreamKind {
        self.converter.kind()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn write(&mut self) -> Result<()> {
        let Some(image) = self.converter.buffer() else {
            return Ok(());
        };
        if let Some(stills) = self.stills.as_mut() {
            let path = stills.write_still(image)?;
            debug!(kind = %self.converter.kind(), path = %path.display(), "still written");
        }
        if let Some(video) = self.video.as_mut() {
            video.write_frame(image)?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        self.stills = None;
        match self.video.take() {
            Some(mut video) => video.finish(),
            None => Ok(()),
        }
    }
}

impl FrameHandler for StreamDumper {
    fn handle(&mut self, frame: &RawFrame<'_>) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        if let Conversion::Converted = self.converter.convert(frame) {
            self.has_image = true;
        }
        if !self.has_image {
            return Ok(());
        }

        if let Err(err) = self.write() {
            let kind = self.converter.kind();
            if let Err(close_err) = self.close() {
                warn!(%kind, error = %close_err, "failed to close output after write failure");
            }
            return Err(DumpError::write_failure(kind, err.to_string()));
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        let dropped = self.converter.dropped();
        info!(kind = %self.converter.kind(), dropped, "stream dump finished");
        self.close()
    }
}

/// Column layout of the skeleton CSV.
pub const BODY_CSV_HEADER: &str = "relative_time_ms,tracking_id,joint,state,x,y,z";

/// Writes every joint of every tracked body as one CSV row and publishes
/// the number of tracked bodies of the latest frame.
pub struct BodyDumper<W: Write + Send = BufWriter<File>> {
    writer: Option<W>,
    tracked: Arc<AtomicUsize>,
    rows: u64,
}

impl BodyDumper {
    /// Creates the CSV file at `path`, including missing parent directories.
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = File::create(path)?;
        info!(path = %path.display(), "writing skeleton data");
        Self::with_writer(BufWriter::new(file))
    }

    pub fn from_config(output: &OutputConfig) -> Result<Self> {
        Self::create(&output.body_csv_path())
    }
}

impl<W: Write + Send> BodyDumper<W> {
    pub fn with_writer(mut writer: W) -> Result<Self> {
        writeln!(writer, "{BODY_CSV_HEADER}")?;
        Ok(Self {
            writer: Some(writer),
            tracked: Arc::new(AtomicUsize::new(0)),
            rows: 0,
        })
    }

    /// Shared view of the tracked body count, readable from other threads.
    pub fn tracked_bodies(&self) -> Arc<AtomicUsize> {
        self.tracked.clone()
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    fn write_rows(&mut self, frame: &RawFrame<'_>) -> std::io::Result<()> {
        let Some(writer) = self.writer.as_mut() else {
            return Ok(());
        };
        let Some(bodies) = frame.bodies() else {
            return Ok(());
        };
        let millis = frame.relative_time.as_secs_f64() * 1_000.0;
        for body in bodies.iter().filter(|body| body.is_tracked) {
            for joint in &body.joints {
                let p = joint.position;
                writeln!(
                    writer,
                    "{millis:.3},{},{},{},{:.4},{:.4},{:.4}",
                    body.tracking_id, joint.joint_type, joint.tracking_state, p.x, p.y, p.z
                )?;
                self.rows += 1;
            }
        }
        Ok(())
    }

    /// Consumes the dumper and returns the underlying writer.
    pub fn into_inner(mut self) -> Option<W> {
        self.writer.take()
    }
}

impl<W: Write + Send> FrameHandler for BodyDumper<W> {
    fn handle(&mut self, frame: &RawFrame<'_>) -> Result<()> {
        let Some(bodies) = frame.bodies() else {
            return Err(DumpError::frame_process(
                frame.kind,
                "frame carries no skeleton data",
            ));
        };
        self.tracked.store(tracked_count(bodies), Ordering::Release);

        if let Err(err) = self.write_rows(frame) {
            self.writer = None;
            return Err(DumpError::write_failure(StreamKind::Body, err.to_string()));
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
            info!(rows = self.rows, "skeleton dump finished");
        }
        Ok(())
    }
}

/// Paths written by a dump session, for the final summary.
pub fn output_paths(kinds: &[StreamKind], output: &OutputConfig) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    for &kind in kinds {
        if kind == StreamKind::Body {
            paths.push(output.body_csv_path());
            continue;
        }
        if output.stills {
            paths.push(output.still_directory(kind));
        }
        if output.video {
            paths.push(output.video_path(kind));
        }
    }
    paths
}

#[cfg(test)]
mod tests {
    use std::{
        sync::Mutex,
        time::Duration,
    };

    use super::*;
    use crate::{
        body::{Body, CameraSpacePoint, Joint, JointType, TrackingState},
        convert::PixelBuffer,
        record::FrameNamer,
        sensor::{FramePayload, SimulatedSensor, SimulationSettings},
        FrameSource, ReliableRange, SyncMode,
    };

    type Captured = Arc<Mutex<Vec<(String, Vec<u8>)>>>;

    struct CapturingStills {
        namer: FrameNamer,
        seen: Captured,
    }

    impl StillSink for CapturingStills {
        fn write_still(&mut self, image: &PixelBuffer) -> Result<PathBuf> {
            let name = self.namer.next_name();
            let bytes = image.bytes().unwrap_or_default().to_vec();
            self.seen.lock().unwrap().push((name.clone(), bytes));
            Ok(PathBuf::from(name))
        }
    }

    struct FailingVideo;

    impl VideoSink for FailingVideo {
        fn write_frame(&mut self, _: &PixelBuffer) -> Result<()> {
            Err(DumpError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "no space left on device",
            )))
        }

        fn finish(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn capturing() -> (Box<dyn StillSink>, Captured) {
        let seen: Captured = Arc::default();
        let sink = CapturingStills {
            namer: FrameNamer::new(),
            seen: seen.clone(),
        };
        (Box::new(sink), seen)
    }

    fn depth_frame(data: &[u8], width: u32, height: u32) -> RawFrame<'_> {
        RawFrame {
            kind: StreamKind::Depth,
            description: FrameDescription::new(width, height, 2),
            relative_time: Duration::ZERO,
            payload: FramePayload::Samples {
                data,
                reliable: Some(ReliableRange::new(500, 4500)),
            },
        }
    }

    #[test]
    fn body_streams_need_the_body_dumper() {
        assert!(matches!(
            StreamDumper::new(StreamKind::Body, None, None),
            Err(DumpError::Configuration(_))
        ));
    }

    #[test]
    fn independent_depth_session_dumps_every_frame() {
        let sensor = SimulatedSensor::new(SimulationSettings {
            reliable_range: ReliableRange::new(500, u16::MAX),
            ..Default::default()
        });
        let description = StreamKind::Depth.native_description().unwrap();
        let samples: Vec<u8> = std::iter::repeat(1000u16.to_le_bytes())
            .take(description.pixel_count())
            .flatten()
            .collect();
        sensor.set_samples(StreamKind::Depth, samples);

        let (stills, seen) = capturing();
        let source = FrameSource::new(Arc::new(sensor.clone()), SyncMode::Independent);
        source
            .register_handler(
                StreamKind::Depth,
                StreamDumper::new(StreamKind::Depth, Some(stills), None).unwrap(),
            )
            .unwrap();
        source.start().unwrap();
        for _ in 0..5 {
            sensor.pump();
        }
        source.close();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 5);
        for (_, bytes) in seen.iter() {
            assert_eq!(bytes.len(), 512 * 424);
            assert!(bytes.iter().all(|&b| b == 32));
        }
        assert!(seen.windows(2).all(|pair| pair[0].0 < pair[1].0));
        assert_eq!(sensor.frames_acquired(), sensor.frames_released());
    }

    #[test]
    fn dropped_frames_repeat_the_last_good_image() {
        let (stills, seen) = capturing();
        let mut dumper = StreamDumper::new(StreamKind::Depth, Some(stills), None).unwrap();

        let good: Vec<u8> = [992u16, 1984].iter().flat_map(|d| d.to_le_bytes()).collect();
        dumper.handle(&depth_frame(&good, 2, 1)).unwrap();
        // short buffer: dropped by validation
        dumper.handle(&depth_frame(&good[..3], 2, 1)).unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].1, vec![32, 64]);
        assert_eq!(seen[1].1, vec![32, 64]);
    }

    #[test]
    fn nothing_is_written_before_the_first_good_frame() {
        let (stills, seen) = capturing();
        let mut dumper = StreamDumper::new(StreamKind::Depth, Some(stills), None).unwrap();
        dumper.handle(&depth_frame(&[0u8; 3], 2, 1)).unwrap();
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn sink_failure_closes_the_dumper() {
        let (stills, seen) = capturing();
        let mut dumper =
            StreamDumper::new(StreamKind::Depth, Some(stills), Some(Box::new(FailingVideo)))
                .unwrap();
        let good: Vec<u8> = [992u16, 1984].iter().flat_map(|d| d.to_le_bytes()).collect();

        let err = dumper.handle(&depth_frame(&good, 2, 1)).unwrap_err();
        assert!(matches!(
            err,
            DumpError::WriteFailure {
                kind: StreamKind::Depth,
                ..
            }
        ));
        assert!(dumper.is_closed());

        dumper.handle(&depth_frame(&good, 2, 1)).unwrap();
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn config_dumper_writes_pngs_and_video() {
        let dir = tempfile::tempdir().unwrap();
        let output = OutputConfig {
            directory: dir.path().to_path_buf(),
            video: true,
            ..Default::default()
        };
        let mut dumper = StreamDumper::from_config(StreamKind::Depth, &output, None).unwrap();
        let good: Vec<u8> = [992u16, 1984].iter().flat_map(|d| d.to_le_bytes()).collect();
        dumper.handle(&depth_frame(&good, 2, 1)).unwrap();
        dumper.handle(&depth_frame(&good, 2, 1)).unwrap();
        dumper.finish().unwrap();

        let pngs = fs::read_dir(output.still_directory(StreamKind::Depth))
            .unwrap()
            .count();
        assert_eq!(pngs, 2);
        let video = fs::read(output.video_path(StreamKind::Depth)).unwrap();
        assert!(video.starts_with(b"YUV4MPEG2 W2 H1 F30:1"));
    }

    #[test]
    fn video_resolution_is_fixed_by_the_stream_description() {
        let dir = tempfile::tempdir().unwrap();
        let output = OutputConfig {
            directory: dir.path().to_path_buf(),
            video: true,
            stills: false,
            ..Default::default()
        };
        let mut dumper = StreamDumper::from_config(
            StreamKind::Depth,
            &output,
            Some(FrameDescription::new(2, 1, 2)),
        )
        .unwrap();

        // a 1x1 first frame does not get to pick the resolution
        dumper.handle(&depth_frame(&992u16.to_le_bytes(), 1, 1)).unwrap();
        let good: Vec<u8> = [992u16, 1984].iter().flat_map(|d| d.to_le_bytes()).collect();
        dumper.handle(&depth_frame(&good, 2, 1)).unwrap();
        dumper.finish().unwrap();

        let mut expected = b"YUV4MPEG2 W2 H1 F30:1 Ip A1:1 Cmono\nFRAME\n".to_vec();
        expected.extend_from_slice(&[32, 64]);
        assert_eq!(fs::read(output.video_path(StreamKind::Depth)).unwrap(), expected);
    }

    fn body(tracking_id: u64) -> Body {
        Body {
            tracking_id,
            is_tracked: true,
            joints: vec![Joint {
                joint_type: JointType::Head,
                position: CameraSpacePoint {
                    x: 0.5,
                    y: -0.25,
                    z: 2.0,
                },
                tracking_state: TrackingState::Tracked,
            }],
        }
    }

    #[test]
    fn body_dumper_writes_tracked_joints() {
        let mut dumper = BodyDumper::with_writer(Vec::new()).unwrap();
        let tracked = dumper.tracked_bodies();
        let bodies = vec![body(7), Body::untracked(), body(9)];
        let frame = RawFrame {
            kind: StreamKind::Body,
            description: FrameDescription::new(0, 0, 0),
            relative_time: Duration::from_millis(1500),
            payload: FramePayload::Bodies(&bodies),
        };

        dumper.handle(&frame).unwrap();

        assert_eq!(tracked.load(Ordering::Acquire), 2);
        assert_eq!(dumper.rows(), 2);
        let csv = String::from_utf8(dumper.into_inner().unwrap()).unwrap();
        assert_eq!(
            csv,
            "relative_time_ms,tracking_id,joint,state,x,y,z\n\
             1500.000,7,Head,Tracked,0.5000,-0.2500,2.0000\n\
             1500.000,9,Head,Tracked,0.5000,-0.2500,2.0000\n"
        );
    }

    #[test]
    fn body_dumper_rejects_image_frames() {
        let mut dumper = BodyDumper::with_writer(Vec::new()).unwrap();
        let err = dumper.handle(&depth_frame(&[0, 0], 1, 1)).unwrap_err();
        assert!(matches!(err, DumpError::FrameProcess { .. }));
    }

    #[test]
    fn simulated_bodies_reach_the_csv() {
        let dir = tempfile::tempdir().unwrap();
        let output = OutputConfig {
            directory: dir.path().to_path_buf(),
            ..Default::default()
        };
        let sensor = SimulatedSensor::default();
        let source = FrameSource::new(Arc::new(sensor.clone()), SyncMode::Multiplexed);
        let dumper = BodyDumper::from_config(&output).unwrap();
        let tracked = dumper.tracked_bodies();
        source.register_handler(StreamKind::Body, dumper).unwrap();
        source.start().unwrap();
        sensor.pump();
        sensor.pump();
        source.close();

        assert_eq!(tracked.load(Ordering::Acquire), 1);
        let csv = fs::read_to_string(output.body_csv_path()).unwrap();
        // header plus 25 joints for each of the two frames
        assert_eq!(csv.lines().count(), 1 + 2 * 25);
    }

    #[test]
    fn output_paths_follow_the_configuration() {
        let output = OutputConfig {
            directory: PathBuf::from("captures"),
            video: true,
            stills: false,
            ..Default::default()
        };
        let paths = output_paths(&[StreamKind::Body, StreamKind::Color], &output);
        assert_eq!(
            paths,
            vec![
                PathBuf::from("captures/output_body.csv"),
                PathBuf::from("captures/output_color.y4m"),
            ]
        );
    }
}
