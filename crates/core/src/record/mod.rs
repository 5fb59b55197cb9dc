use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use chrono::{Local, NaiveDateTime, Timelike};
use image::{GrayImage, ImageBuffer, ImageFormat, Luma, RgbImage};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    convert::{PixelBuffer, PixelFormat},
    DumpError, Result,
};

/// Timestamp layout of still image names: date, time and microseconds.
pub const FRAME_NAME_FORMAT: &str = "%Y%m%d%H%M%S%6f";

/// Destination for individual still images.
pub trait StillSink: Send {
    /// Persists one image and returns where it was written.
    fn write_still(&mut self, image: &PixelBuffer) -> Result<PathBuf>;
}

/// Destination for a fixed-resolution video stream.
pub trait VideoSink: Send {
    fn write_frame(&mut self, image: &PixelBuffer) -> Result<()>;

    /// Flushes and closes the stream. Further frames are rejected.
    fn finish(&mut self) -> Result<()>;
}

/// Produces file names from the local wall clock, strictly increasing even
/// when two frames land on the same microsecond.
#[derive(Debug, Default)]
pub struct FrameNamer {
    last: Option<NaiveDateTime>,
}

impl FrameNamer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_name(&mut self) -> String {
        self.next_at(Local::now().naive_local())
    }

    /// Name for a frame stored at `now`.
    pub fn next_at(&mut self, now: NaiveDateTime) -> String {
        let now = now
            .with_nanosecond(now.nanosecond() / 1_000 * 1_000)
            .unwrap_or(now);
        let stamp = match self.last {
            Some(last) if now <= last => last + chrono::Duration::microseconds(1),
            _ => now,
        };
        self.last = Some(stamp);
        stamp.format(FRAME_NAME_FORMAT).to_string()
    }
}

/// Writes every image as a PNG file named by a [`FrameNamer`].
#[derive(Debug)]
pub struct PngSequenceWriter {
    directory: PathBuf,
    namer: FrameNamer,
    created: bool,
    written: u64,
}

impl PngSequenceWriter {
    /// The directory is created on the first write.
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            namer: FrameNamer::new(),
            created: false,
            written: 0,
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn written(&self) -> u64 {
        self.written
    }
}

impl StillSink for PngSequenceWriter {
    fn write_still(&mut self, image: &PixelBuffer) -> Result<PathBuf> {
        if !self.created {
            fs::create_dir_all(&self.directory)?;
            self.created = true;
        }
        let path = self
            .directory
            .join(format!("{}.png", self.namer.next_name()));
        save_png(image, &path)?;
        self.written += 1;
        Ok(path)
    }
}

fn save_png(image: &PixelBuffer, path: &Path) -> Result<()> {
    let (width, height) = (image.width(), image.height());
    let invalid = || DumpError::msg(format!("{width}x{height} buffer does not match its samples"));

    match (image.format(), image.bytes(), image.floats()) {
        (PixelFormat::Bgr32, Some(bytes), _) => {
            let rgb: Vec<u8> = bytes
                .chunks_exact(4)
                .flat_map(|bgrx| [bgrx[2], bgrx[1], bgrx[0]])
                .collect();
            RgbImage::from_raw(width, height, rgb)
                .ok_or_else(invalid)?
                .save_with_format(path, ImageFormat::Png)?;
        }
        (PixelFormat::Gray8, Some(bytes), _) => {
            GrayImage::from_raw(width, height, bytes.to_vec())
                .ok_or_else(invalid)?
                .save_with_format(path, ImageFormat::Png)?;
        }
        (PixelFormat::Gray32Float, _, Some(floats)) => {
            let samples: Vec<u16> = floats.iter().map(|&v| unit_to_u16(v)).collect();
            ImageBuffer::<Luma<u16>, _>::from_raw(width, height, samples)
                .ok_or_else(invalid)?
                .save_with_format(path, ImageFormat::Png)?;
        }
        _ => return Err(invalid()),
    }
    Ok(())
}

fn unit_to_u16(value: f32) -> u16 {
    (value.clamp(0.0, 1.0) * f32::from(u16::MAX)).round() as u16
}

fn unit_to_u8(value: f32) -> u8 {
    (value.clamp(0.0, 1.0) * 255.0).round() as u8
}

/// Configuration options for a video recording.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingSettings {
    pub output_path: PathBuf,
    pub fps: u32,
    /// Stream geometry. When absent, the first frame decides it.
    #[serde(default)]
    pub layout: Option<VideoLayout>,
}

impl Default for RecordingSettings {
    fn default() -> Self {
        Self {
            output_path: PathBuf::from("output.y4m"),
            fps: 30,
            layout: None,
        }
    }
}

/// Resolution and sample format of a video stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoLayout {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

/// Appends frames to an uncompressed YUV4MPEG2 stream.
///
/// Gray buffers are stored as a single luma plane, `Bgr32` buffers as
/// full-resolution BT.601 YCbCr. The resolution is fixed when the stream
/// opens, or by the first frame when the settings carry no layout.
#[derive(Debug)]
pub struct Recorder {
    settings: RecordingSettings,
    writer: Option<BufWriter<File>>,
    layout: Option<VideoLayout>,
    frames: u64,
    scratch: Vec<u8>,
}

impl Recorder {
    pub fn new(settings: RecordingSettings) -> Self {
        Self {
            settings,
            writer: None,
            layout: None,
            frames: 0,
            scratch: Vec::new(),
        }
    }

    pub fn settings(&self) -> &RecordingSettings {
        &self.settings
    }

    /// Creates the output file and writes the stream header when the
    /// layout is known.
    pub fn start(&mut self) -> Result<()> {
        if self.writer.is_some() {
            return Ok(());
        }
        if let Some(parent) = self.settings.output_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut writer = BufWriter::new(File::create(&self.settings.output_path)?);
        if let Some(layout) = self.settings.layout {
            writer.write_all(self.header(layout).as_bytes())?;
            self.layout = Some(layout);
        }
        self.writer = Some(writer);
        info!(path = %self.settings.output_path.display(), fps = self.settings.fps, "recording started");
        Ok(())
    }

    pub fn stop(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
            info!(
                path = %self.settings.output_path.display(),
                frames = self.frames,
                "recording stopped"
            );
        }
        Ok(())
    }

    pub fn is_recording(&self) -> bool {
        self.writer.is_some()
    }

    pub fn frames_written(&self) -> u64 {
        self.frames
    }

    fn header(&self, layout: VideoLayout) -> String {
        let colorspace = match layout.format {
            PixelFormat::Bgr32 => "C444",
            PixelFormat::Gray8 | PixelFormat::Gray32Float => "Cmono",
        };
        format!(
            "YUV4MPEG2 W{} H{} F{}:1 Ip A1:1 {}\n",
            layout.width,
            layout.height,
            self.settings.fps.max(1),
            colorspace
        )
    }
}

impl VideoSink for Recorder {
    fn write_frame(&mut self, image: &PixelBuffer) -> Result<()> {
        let frame_layout = VideoLayout {
            width: image.width(),
            height: image.height(),
            format: image.format(),
        };
        let header = match self.layout {
            None => Some(self.header(frame_layout)),
            Some(layout) if layout == frame_layout => None,
            Some(layout) => {
                return Err(DumpError::msg(format!(
                    "video stream is {}x{}, got a {}x{} frame",
                    layout.width, layout.height, frame_layout.width, frame_layout.height
                )))
            }
        };

        let mut scratch = std::mem::take(&mut self.scratch);
        encode_planes(image, &mut scratch);
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| DumpError::msg("recorder is not recording"))?;
        if let Some(header) = header {
            writer.write_all(header.as_bytes())?;
            self.layout = Some(frame_layout);
            debug!(path = %self.settings.output_path.display(), header = header.trim_end(), "video stream opened");
        }
        writer.write_all(b"FRAME\n")?;
        writer.write_all(&scratch)?;
        self.scratch = scratch;
        self.frames += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.stop()
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

/// Writes the planar YUV representation of `image` into `out`.
fn encode_planes(image: &PixelBuffer, out: &mut Vec<u8>) {
    out.clear();
    match (image.format(), image.bytes(), image.floats()) {
        (PixelFormat::Gray8, Some(bytes), _) => out.extend_from_slice(bytes),
        (PixelFormat::Gray32Float, _, Some(floats)) => {
            out.extend(floats.iter().map(|&v| unit_to_u8(v)))
        }
        (PixelFormat::Bgr32, Some(bytes), _) => {
            let pixels = bytes.len() / 4;
            out.resize(pixels * 3, 0);
            let (luma, chroma) = out.split_at_mut(pixels);
            let (cb, cr) = chroma.split_at_mut(pixels);
            for (index, bgrx) in bytes.chunks_exact(4).enumerate() {
                let [y, u, v] = bt601(bgrx[2], bgrx[1], bgrx[0]);
                luma[index] = y;
                cb[index] = u;
                cr[index] = v;
            }
        }
        _ => {}
    }
}

/// Studio-swing BT.601 conversion.
fn bt601(r: u8, g: u8, b: u8) -> [u8; 3] {
    let (r, g, b) = (i32::from(r), i32::from(g), i32::from(b));
    let y = ((66 * r + 129 * g + 25 * b + 128) >> 8) + 16;
    let u = ((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128;
    let v = ((112 * r - 94 * g - 18 * b + 128) >> 8) + 128;
    [y, u, v].map(|c| c.clamp(0, 255) as u8)
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;
    use crate::convert::{convert_body_index, convert_depth, convert_infrared};
    use crate::ReliableRange;

    fn at(micros: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 9)
            .unwrap()
            .and_hms_micro_opt(14, 5, 7, micros)
            .unwrap()
    }

    #[test]
    fn frame_names_use_microsecond_timestamps() {
        let mut namer = FrameNamer::new();
        assert_eq!(namer.next_at(at(123_456)), "20240309140507123456");
    }

    #[test]
    fn frame_names_are_strictly_increasing() {
        let mut namer = FrameNamer::new();
        let names: Vec<String> = [at(10), at(10), at(10), at(5), at(20)]
            .into_iter()
            .map(|now| namer.next_at(now))
            .collect();

        assert_eq!(
            names,
            [
                "20240309140507000010",
                "20240309140507000011",
                "20240309140507000012",
                "20240309140507000013",
                "20240309140507000020",
            ]
        );
    }

    #[test]
    fn png_sequence_writes_one_file_per_frame() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = PngSequenceWriter::new(dir.path().join("output_depth"));
        let raw: Vec<u8> = [620u16, 3100, 0, 7905]
            .iter()
            .flat_map(|d| d.to_le_bytes())
            .collect();
        let mut depth = PixelBuffer::new(2, 2, PixelFormat::Gray8);
        convert_depth(&raw, 2, 2, ReliableRange::new(500, 4500), &mut depth);

        let first = writer.write_still(&depth).unwrap();
        let second = writer.write_still(&depth).unwrap();

        assert_ne!(first, second);
        assert_eq!(writer.written(), 2);
        assert_eq!(first.extension().unwrap(), "png");
        let decoded = image::open(&first).unwrap().into_luma8();
        assert_eq!(decoded.dimensions(), (2, 2));
        assert_eq!(decoded.as_raw(), &vec![20, 100, 0, 255]);
    }

    #[test]
    fn png_keeps_color_channels_and_float_precision() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = PngSequenceWriter::new(dir.path());

        let mut index = PixelBuffer::new(2, 1, PixelFormat::Bgr32);
        convert_body_index(&[1, 0xFF], 2, 1, &mut index);
        let path = writer.write_still(&index).unwrap();
        let rgb = image::open(&path).unwrap().into_rgb8();
        // slot 1 is 0x00FF0000: bytes 00 00 FF 00 in B, G, R order
        assert_eq!(rgb.get_pixel(0, 0).0, [0xFF, 0x00, 0x00]);
        assert_eq!(rgb.get_pixel(1, 0).0, [0, 0, 0]);

        let mut ir = PixelBuffer::new(1, 1, PixelFormat::Gray32Float);
        convert_infrared(&u16::MAX.to_le_bytes(), 1, 1, &mut ir);
        let path = writer.write_still(&ir).unwrap();
        let luma = image::open(&path).unwrap().into_luma16();
        let expected = unit_to_u16(ir.floats().unwrap()[0]);
        assert_eq!(luma.get_pixel(0, 0).0, [expected]);
    }

    #[test]
    fn recorder_writes_mono_y4m_stream() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("output_depth.y4m");
        let mut recorder = Recorder::new(RecordingSettings {
            output_path: path.clone(),
            fps: 30,
            ..Default::default()
        });
        let mut depth = PixelBuffer::new(2, 1, PixelFormat::Gray8);
        let raw: Vec<u8> = [992u16, 1984].iter().flat_map(|d| d.to_le_bytes()).collect();
        convert_depth(&raw, 2, 1, ReliableRange::new(500, 4500), &mut depth);

        recorder.start().unwrap();
        recorder.write_frame(&depth).unwrap();
        recorder.write_frame(&depth).unwrap();
        recorder.finish().unwrap();

        let mut expected = b"YUV4MPEG2 W2 H1 F30:1 Ip A1:1 Cmono\n".to_vec();
        for _ in 0..2 {
            expected.extend_from_slice(b"FRAME\n");
            expected.extend_from_slice(&[32, 64]);
        }
        assert_eq!(fs::read(&path).unwrap(), expected);
        assert_eq!(recorder.frames_written(), 2);
        assert!(!recorder.is_recording());
    }

    #[test]
    fn recorder_stores_color_as_planar_444() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("output_color.y4m");
        let mut recorder = Recorder::new(RecordingSettings {
            output_path: path.clone(),
            fps: 30,
            ..Default::default()
        });
        let mut color = PixelBuffer::new(2, 1, PixelFormat::Bgr32);
        crate::convert::convert_color(&[0xFF, 0xFF, 0xFF, 0xFF, 0, 0, 0, 0xFF], 2, 1, &mut color);

        recorder.start().unwrap();
        recorder.write_frame(&color).unwrap();
        recorder.stop().unwrap();

        let data = fs::read(&path).unwrap();
        let header = b"YUV4MPEG2 W2 H1 F30:1 Ip A1:1 C444\nFRAME\n";
        assert_eq!(&data[..header.len()], header);
        // Y plane (white, black), then Cb and Cr at neutral chroma
        assert_eq!(&data[header.len()..], &[235, 16, 128, 128, 128, 128]);
    }

    #[test]
    fn recorder_rejects_frames_of_another_size() {
        let dir = tempfile::tempdir().unwrap();
        let mut recorder = Recorder::new(RecordingSettings {
            output_path: dir.path().join("output_infrared.y4m"),
            fps: 30,
            ..Default::default()
        });
        recorder.start().unwrap();
        recorder
            .write_frame(&PixelBuffer::new(4, 4, PixelFormat::Gray32Float))
            .unwrap();

        assert!(recorder
            .write_frame(&PixelBuffer::new(8, 8, PixelFormat::Gray32Float))
            .is_err());
        assert_eq!(recorder.frames_written(), 1);
    }

    #[test]
    fn preset_layout_fixes_the_stream_at_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("output_bodyIndex.y4m");
        let mut recorder = Recorder::new(RecordingSettings {
            output_path: path.clone(),
            fps: 30,
            layout: Some(VideoLayout {
                width: 512,
                height: 424,
                format: PixelFormat::Bgr32,
            }),
        });

        recorder.start().unwrap();
        assert!(recorder
            .write_frame(&PixelBuffer::new(2, 2, PixelFormat::Bgr32))
            .is_err());
        recorder.stop().unwrap();

        assert_eq!(
            fs::read(&path).unwrap(),
            b"YUV4MPEG2 W512 H424 F30:1 Ip A1:1 C444\n".to_vec()
        );
        assert_eq!(recorder.frames_written(), 0);
    }

    #[test]
    fn recorder_requires_start() {
        let dir = tempfile::tempdir().unwrap();
        let mut recorder = Recorder::new(RecordingSettings {
            output_path: dir.path().join("never.y4m"),
            fps: 30,
            ..Default::default()
        });
        assert!(recorder
            .write_frame(&PixelBuffer::new(1, 1, PixelFormat::Gray8))
            .is_err());
    }
}
