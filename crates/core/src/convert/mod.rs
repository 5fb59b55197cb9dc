use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    sensor::{FramePayload, RawFrame},
    FrameDescription, ReliableRange, StreamKind,
};

/// Maps a depth value in millimeters onto the byte range.
pub const MAP_DEPTH_TO_BYTE: u16 = 8000 / 256;

/// Upper depth bound used instead of the sensor-reported reliable maximum so
/// the less reliable far field remains visible.
pub const DEPTH_WIDENED_MAX: u16 = u16::MAX;

const INFRARED_SOURCE_VALUE_MAXIMUM: f32 = u16::MAX as f32;
const INFRARED_SOURCE_SCALE: f32 = 0.75;
const INFRARED_OUTPUT_VALUE_MINIMUM: f32 = 0.01;
const INFRARED_OUTPUT_VALUE_MAXIMUM: f32 = 1.0;

/// Colors used to display body index data, indexed by body slot.
pub const BODY_COLORS: [u32; 6] = [
    0x0000FF00, 0x00FF0000, 0xFFFF4000, 0x40FFFF00, 0xFF40FF00, 0xFF808000,
];

/// Sample layout of a [`PixelBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    /// Four bytes per pixel in B, G, R order; the fourth byte is ignored.
    Bgr32,
    Gray8,
    /// One normalized `f32` per pixel in `[0, 1]`.
    Gray32Float,
}

impl PixelFormat {
    /// Output format produced for an image stream.
    pub fn for_kind(kind: StreamKind) -> Option<Self> {
        match kind {
            StreamKind::Body => None,
            StreamKind::Color | StreamKind::BodyIndex => Some(PixelFormat::Bgr32),
            StreamKind::Depth => Some(PixelFormat::Gray8),
            StreamKind::Infrared => Some(PixelFormat::Gray32Float),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum PixelData {
    Bytes(Vec<u8>),
    Floats(Vec<f32>),
}

/// Core-owned converted image, reused across frames of the same size.
#[derive(Debug, Clone, PartialEq)]
pub struct PixelBuffer {
    width: u32,
    height: u32,
    format: PixelFormat,
    data: PixelData,
}

impl PixelBuffer {
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        let pixels = width as usize * height as usize;
        let data = match format {
            PixelFormat::Bgr32 => PixelData::Bytes(vec![0; pixels * 4]),
            PixelFormat::Gray8 => PixelData::Bytes(vec![0; pixels]),
            PixelFormat::Gray32Float => PixelData::Floats(vec![0.0; pixels]),
        };
        Self {
            width,
            height,
            format,
            data,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn matches(&self, width: u32, height: u32) -> bool {
        self.width == width && self.height == height
    }

    /// Byte samples for `Bgr32` and `Gray8` buffers.
    pub fn bytes(&self) -> Option<&[u8]> {
        match &self.data {
            PixelData::Bytes(bytes) => Some(bytes),
            PixelData::Floats(_) => None,
        }
    }

    /// Float samples for `Gray32Float` buffers.
    pub fn floats(&self) -> Option<&[f32]> {
        match &self.data {
            PixelData::Floats(floats) => Some(floats),
            PixelData::Bytes(_) => None,
        }
    }

    fn bytes_mut(&mut self) -> Option<&mut [u8]> {
        match &mut self.data {
            PixelData::Bytes(bytes) => Some(bytes),
            PixelData::Floats(_) => None,
        }
    }

    fn floats_mut(&mut self) -> Option<&mut [f32]> {
        match &mut self.data {
            PixelData::Floats(floats) => Some(floats),
            PixelData::Bytes(_) => None,
        }
    }
}

/// Outcome of a single conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conversion {
    Converted,
    Dropped(DropReason),
}

impl Conversion {
    pub fn is_converted(&self) -> bool {
        matches!(self, Conversion::Converted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// `width * height * bytes_per_sample` differs from the raw buffer length.
    SampleCount { expected: usize, actual: usize },
    /// The destination buffer was sized for another resolution.
    Dimensions {
        frame: (u32, u32),
        buffer: (u32, u32),
    },
    /// The destination buffer or frame payload has the wrong layout.
    Format,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropReason::SampleCount { expected, actual } => {
                write!(f, "expected {expected} raw bytes, got {actual}")
            }
            DropReason::Dimensions { frame, buffer } => write!(
                f,
                "frame is {}x{} but buffer is {}x{}",
                frame.0, frame.1, buffer.0, buffer.1
            ),
            DropReason::Format => f.write_str("unexpected sample format"),
        }
    }
}

fn validate(
    raw: &[u8],
    width: u32,
    height: u32,
    bytes_per_sample: usize,
    dst: &PixelBuffer,
    format: PixelFormat,
) -> Option<DropReason> {
    let expected = width as usize * height as usize * bytes_per_sample;
    if raw.len() != expected {
        return Some(DropReason::SampleCount {
            expected,
            actual: raw.len(),
        });
    }
    if !dst.matches(width, height) {
        return Some(DropReason::Dimensions {
            frame: (width, height),
            buffer: (dst.width, dst.height),
        });
    }
    if dst.format != format {
        return Some(DropReason::Format);
    }
    None
}

fn samples_u16(raw: &[u8]) -> impl Iterator<Item = u16> + '_ {
    raw.chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
}

/// Maps one body index byte to its display color.
pub fn body_index_color(index: u8) -> u32 {
    BODY_COLORS
        .get(index as usize)
        .copied()
        .unwrap_or(0x0000_0000)
}

/// Maps one depth sample to a gray level.
pub fn depth_to_byte(depth: u16, min_reliable: u16) -> u8 {
    if (min_reliable..=DEPTH_WIDENED_MAX).contains(&depth) {
        (depth / MAP_DEPTH_TO_BYTE).min(u16::from(u8::MAX)) as u8
    } else {
        0
    }
}

/// Normalizes one infrared sample into `[0.01, 1.0]`.
pub fn infrared_intensity(value: u16) -> f32 {
    let scaled = value as f32 / INFRARED_SOURCE_VALUE_MAXIMUM * INFRARED_SOURCE_SCALE;
    INFRARED_OUTPUT_VALUE_MAXIMUM
        .min(scaled * (1.0 - INFRARED_OUTPUT_VALUE_MINIMUM) + INFRARED_OUTPUT_VALUE_MINIMUM)
}

/// One byte per pixel in, palette color (BGRX) out.
pub fn convert_body_index(raw: &[u8], width: u32, height: u32, dst: &mut PixelBuffer) -> Conversion {
    if let Some(reason) = validate(raw, width, height, 1, dst, PixelFormat::Bgr32) {
        return Conversion::Dropped(reason);
    }
    let Some(out) = dst.bytes_mut() else {
        return Conversion::Dropped(DropReason::Format);
    };
    for (pixel, &index) in out.chunks_exact_mut(4).zip(raw) {
        pixel.copy_from_slice(&body_index_color(index).to_le_bytes());
    }
    Conversion::Converted
}

/// Two bytes per pixel in, gray byte out. Only the lower bound of `range`
/// is honored; the upper bound is [`DEPTH_WIDENED_MAX`].
pub fn convert_depth(
    raw: &[u8],
    width: u32,
    height: u32,
    range: ReliableRange,
    dst: &mut PixelBuffer,
) -> Conversion {
    if let Some(reason) = validate(raw, width, height, 2, dst, PixelFormat::Gray8) {
        return Conversion::Dropped(reason);
    }
    let Some(out) = dst.bytes_mut() else {
        return Conversion::Dropped(DropReason::Format);
    };
    for (pixel, depth) in out.iter_mut().zip(samples_u16(raw)) {
        *pixel = depth_to_byte(depth, range.min);
    }
    Conversion::Converted
}

/// Two bytes per pixel in, normalized float out.
pub fn convert_infrared(raw: &[u8], width: u32, height: u32, dst: &mut PixelBuffer) -> Conversion {
    if let Some(reason) = validate(raw, width, height, 2, dst, PixelFormat::Gray32Float) {
        return Conversion::Dropped(reason);
    }
    let Some(out) = dst.floats_mut() else {
        return Conversion::Dropped(DropReason::Format);
    };
    for (pixel, value) in out.iter_mut().zip(samples_u16(raw)) {
        *pixel = infrared_intensity(value);
    }
    Conversion::Converted
}

/// BGRA bytes in, copied as-is.
pub fn convert_color(raw: &[u8], width: u32, height: u32, dst: &mut PixelBuffer) -> Conversion {
    if let Some(reason) = validate(raw, width, height, 4, dst, PixelFormat::Bgr32) {
        return Conversion::Dropped(reason);
    }
    let Some(out) = dst.bytes_mut() else {
        return Conversion::Dropped(DropReason::Format);
    };
    out.copy_from_slice(raw);
    Conversion::Converted
}

/// Runs the conversion matching the frame's stream kind.
pub fn convert_frame(frame: &RawFrame<'_>, dst: &mut PixelBuffer) -> Conversion {
    let FramePayload::Samples { data, reliable } = frame.payload else {
        return Conversion::Dropped(DropReason::Format);
    };
    let FrameDescription { width, height, .. } = frame.description;
    match frame.kind {
        StreamKind::Body => Conversion::Dropped(DropReason::Format),
        StreamKind::Color => convert_color(data, width, height, dst),
        StreamKind::Depth => {
            let range = reliable.unwrap_or(ReliableRange::new(0, DEPTH_WIDENED_MAX));
            convert_depth(data, width, height, range, dst)
        }
        StreamKind::Infrared => convert_infrared(data, width, height, dst),
        StreamKind::BodyIndex => convert_body_index(data, width, height, dst),
    }
}

/// Per-stream converter owning the lazily allocated working buffer.
#[derive(Debug)]
pub struct FrameConverter {
    kind: StreamKind,
    format: PixelFormat,
    buffer: Option<PixelBuffer>,
    fixed_size: bool,
    resolution: Option<(u32, u32)>,
    dropped: u64,
}

impl FrameConverter {
    /// Creates a converter for an image stream. Returns `None` for body
    /// frames, which carry no pixels.
    ///
    /// With `fixed_size` set, the buffer keeps the resolution of the first
    /// good frame and later frames of another size are dropped. Otherwise
    /// the buffer is replaced whenever a frame of another size converts.
    pub fn new(kind: StreamKind, fixed_size: bool) -> Option<Self> {
        Some(Self {
            kind,
            format: PixelFormat::for_kind(kind)?,
            buffer: None,
            fixed_size,
            resolution: None,
            dropped: 0,
        })
    }

    /// Only accepts frames of `width` x `height`.
    pub fn set_resolution(&mut self, width: u32, height: u32) {
        self.fixed_size = true;
        self.resolution = Some((width, height));
        if self.buffer.as_ref().is_some_and(|buffer| !buffer.matches(width, height)) {
            self.buffer = None;
        }
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    /// The last good image, if any frame was converted yet.
    pub fn buffer(&self) -> Option<&PixelBuffer> {
        self.buffer.as_ref()
    }

    /// Number of frames dropped by validation so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn convert(&mut self, frame: &RawFrame<'_>) -> Conversion {
        let FrameDescription { width, height, .. } = frame.description;
        let outcome = match self.resolution {
            Some(expected) if expected != (width, height) => {
                Conversion::Dropped(DropReason::Dimensions {
                    frame: (width, height),
                    buffer: expected,
                })
            }
            _ => self.convert_into_buffer(frame, width, height),
        };
        if let Conversion::Dropped(reason) = outcome {
            self.dropped += 1;
            debug!(kind = %self.kind, %reason, dropped = self.dropped, "dropped frame");
        }
        outcome
    }

    fn convert_into_buffer(&mut self, frame: &RawFrame<'_>, width: u32, height: u32) -> Conversion {
        let fixed_size = self.fixed_size;
        let reuse = self
            .buffer
            .as_ref()
            .is_some_and(|buffer| fixed_size || buffer.matches(width, height));
        if reuse {
            return match self.buffer.as_mut() {
                Some(buffer) => convert_frame(frame, buffer),
                None => Conversion::Dropped(DropReason::Format),
            };
        }

        // the previous image stays in place until a frame of the new size converts
        let mut resized = PixelBuffer::new(width, height, self.format);
        let outcome = convert_frame(frame, &mut resized);
        if outcome.is_converted() {
            self.buffer = Some(resized);
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn depth_bytes(samples: &[u16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    #[test]
    fn depth_maps_reliable_values_to_bytes() {
        let samples = [0u16, 499, 500, 1000, 4500, 7999, 8000, 65535];
        let raw = depth_bytes(&samples);
        let mut dst = PixelBuffer::new(8, 1, PixelFormat::Gray8);

        let outcome = convert_depth(&raw, 8, 1, ReliableRange::new(500, 4500), &mut dst);

        assert_eq!(outcome, Conversion::Converted);
        // values above the reported max are kept because the bound is widened
        assert_eq!(dst.bytes().unwrap(), &[0, 0, 16, 32, 145, 255, 255, 255]);
    }

    #[test]
    fn depth_matches_integer_division_by_31() {
        for depth in (0u16..=65535).step_by(97) {
            let expected = if depth >= 300 { (depth / 31).min(255) as u8 } else { 0 };
            assert_eq!(depth_to_byte(depth, 300), expected, "depth {depth}");
        }
    }

    #[test]
    fn infrared_follows_normalization_formula() {
        let mut previous = 0.0f32;
        for value in (0u16..=65535).step_by(257) {
            let expected =
                (1.0f32).min((value as f32 / 65535.0 * 0.75) * (1.0 - 0.01) + 0.01);
            let actual = infrared_intensity(value);
            assert_eq!(actual, expected);
            assert!(actual >= previous);
            previous = actual;
        }
        assert!((infrared_intensity(0) - 0.01).abs() < f32::EPSILON);
        assert!(infrared_intensity(u16::MAX) <= 1.0);
    }

    #[test]
    fn infrared_fills_float_buffer() {
        let raw = depth_bytes(&[0, 65535]);
        let mut dst = PixelBuffer::new(2, 1, PixelFormat::Gray32Float);

        assert!(convert_infrared(&raw, 2, 1, &mut dst).is_converted());
        let floats = dst.floats().unwrap();
        assert_eq!(floats[0], infrared_intensity(0));
        assert_eq!(floats[1], infrared_intensity(65535));
    }

    #[test]
    fn body_index_uses_palette_or_black() {
        let raw: Vec<u8> = (0u8..8).chain([255]).collect();
        let mut dst = PixelBuffer::new(9, 1, PixelFormat::Bgr32);

        assert!(convert_body_index(&raw, 9, 1, &mut dst).is_converted());
        let pixels: Vec<u32> = dst
            .bytes()
            .unwrap()
            .chunks_exact(4)
            .map(|p| u32::from_le_bytes([p[0], p[1], p[2], p[3]]))
            .collect();
        assert_eq!(&pixels[..6], &BODY_COLORS);
        assert!(pixels[6..].iter().all(|&p| p == 0));
    }

    #[test]
    fn color_is_copied_verbatim() {
        let raw: Vec<u8> = (0u8..16).collect();
        let mut dst = PixelBuffer::new(2, 2, PixelFormat::Bgr32);

        assert!(convert_color(&raw, 2, 2, &mut dst).is_converted());
        assert_eq!(dst.bytes().unwrap(), raw.as_slice());
    }

    #[test]
    fn length_mismatch_leaves_destination_untouched() {
        let mut dst = PixelBuffer::new(2, 2, PixelFormat::Gray8);
        let good = depth_bytes(&[1000; 4]);
        convert_depth(&good, 2, 2, ReliableRange::new(500, 4500), &mut dst);
        let before = dst.clone();

        let short = depth_bytes(&[2000; 3]);
        let outcome = convert_depth(&short, 2, 2, ReliableRange::new(500, 4500), &mut dst);

        assert_eq!(
            outcome,
            Conversion::Dropped(DropReason::SampleCount {
                expected: 8,
                actual: 6
            })
        );
        assert_eq!(dst, before);
    }

    #[test]
    fn dimension_mismatch_is_a_silent_drop() {
        let mut dst = PixelBuffer::new(4, 4, PixelFormat::Bgr32);
        let raw = vec![1u8; 2 * 2];

        let outcome = convert_body_index(&raw, 2, 2, &mut dst);

        assert!(matches!(
            outcome,
            Conversion::Dropped(DropReason::Dimensions { .. })
        ));
        assert!(dst.bytes().unwrap().iter().all(|&b| b == 0));
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
    fn converter_allocates_lazily_and_reuses_buffer() {
        let mut converter = FrameConverter::new(StreamKind::Depth, true).unwrap();
        assert!(converter.buffer().is_none());

        let raw = depth_bytes(&[1000; 4]);
        assert!(converter.convert(&depth_frame(&raw, 2, 2)).is_converted());
        assert_eq!(converter.buffer().unwrap().bytes().unwrap(), &[32; 4]);

        let other = depth_bytes(&[1000; 6]);
        let outcome = converter.convert(&depth_frame(&other, 3, 2));
        assert!(!outcome.is_converted());
        assert_eq!(converter.dropped(), 1);
        assert!(converter.buffer().unwrap().matches(2, 2));
    }

    #[test]
    fn converter_reallocates_when_size_is_not_fixed() {
        let mut converter = FrameConverter::new(StreamKind::Depth, false).unwrap();
        let raw = depth_bytes(&[1000; 4]);
        converter.convert(&depth_frame(&raw, 2, 2));

        let other = depth_bytes(&[2000; 6]);
        assert!(converter.convert(&depth_frame(&other, 3, 2)).is_converted());
        let buffer = converter.buffer().unwrap();
        assert!(buffer.matches(3, 2));
        assert_eq!(buffer.bytes().unwrap(), &[64; 6]);
    }

    #[test]
    fn malformed_frame_of_new_size_keeps_last_good_image() {
        let mut converter = FrameConverter::new(StreamKind::Depth, false).unwrap();
        let raw = depth_bytes(&[1000; 4]);
        assert!(converter.convert(&depth_frame(&raw, 2, 2)).is_converted());

        // 3x2 frame carrying only four samples
        let outcome = converter.convert(&depth_frame(&raw, 3, 2));

        assert_eq!(
            outcome,
            Conversion::Dropped(DropReason::SampleCount {
                expected: 12,
                actual: 8
            })
        );
        let buffer = converter.buffer().unwrap();
        assert!(buffer.matches(2, 2));
        assert_eq!(buffer.bytes().unwrap(), &[32; 4]);
    }

    #[test]
    fn malformed_first_frame_allocates_nothing() {
        let mut converter = FrameConverter::new(StreamKind::Depth, true).unwrap();
        let short = depth_bytes(&[1000; 3]);
        assert!(!converter.convert(&depth_frame(&short, 2, 2)).is_converted());
        assert!(converter.buffer().is_none());

        let raw = depth_bytes(&[1000; 6]);
        assert!(converter.convert(&depth_frame(&raw, 3, 2)).is_converted());
        assert!(converter.buffer().unwrap().matches(3, 2));
    }

    #[test]
    fn preset_resolution_drops_other_sizes() {
        let mut converter = FrameConverter::new(StreamKind::Depth, false).unwrap();
        converter.set_resolution(3, 2);

        let raw = depth_bytes(&[1000; 4]);
        assert_eq!(
            converter.convert(&depth_frame(&raw, 2, 2)),
            Conversion::Dropped(DropReason::Dimensions {
                frame: (2, 2),
                buffer: (3, 2)
            })
        );
        assert!(converter.buffer().is_none());

        let raw = depth_bytes(&[1000; 6]);
        assert!(converter.convert(&depth_frame(&raw, 3, 2)).is_converted());
    }

    #[test]
    fn body_stream_has_no_converter() {
        assert!(FrameConverter::new(StreamKind::Body, true).is_none());
    }
}
