use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::DumpError;

/// One of the five sensor output categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StreamKind {
    Body,
    Color,
    Depth,
    Infrared,
    BodyIndex,
}

impl StreamKind {
    pub const ALL: [StreamKind; 5] = [
        StreamKind::Body,
        StreamKind::Color,
        StreamKind::Depth,
        StreamKind::Infrared,
        StreamKind::BodyIndex,
    ];

    /// Tag used in output file and directory names.
    pub fn tag(self) -> &'static str {
        match self {
            StreamKind::Body => "body",
            StreamKind::Color => "color",
            StreamKind::Depth => "depth",
            StreamKind::Infrared => "infrared",
            StreamKind::BodyIndex => "bodyIndex",
        }
    }

    /// Native image layout of the stream. Body frames carry skeleton records
    /// rather than pixels and have no image description.
    pub fn native_description(self) -> Option<FrameDescription> {
        match self {
            StreamKind::Body => None,
            StreamKind::Color => Some(FrameDescription::new(1920, 1080, 4)),
            StreamKind::Depth | StreamKind::Infrared => Some(FrameDescription::new(512, 424, 2)),
            StreamKind::BodyIndex => Some(FrameDescription::new(512, 424, 1)),
        }
    }

    pub fn is_image(self) -> bool {
        self.native_description().is_some()
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for StreamKind {
    type Err = DumpError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "body" | "skeleton" => Ok(StreamKind::Body),
            "color" | "colour" => Ok(StreamKind::Color),
            "depth" => Ok(StreamKind::Depth),
            "infrared" | "ir" => Ok(StreamKind::Infrared),
            "bodyindex" | "body-index" | "body_index" => Ok(StreamKind::BodyIndex),
            other => Err(DumpError::Configuration(format!(
                "unknown stream kind `{other}`"
            ))),
        }
    }
}

/// How readers are opened for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncMode {
    /// One reader delivering every enabled kind as a single correlated event.
    Multiplexed,
    /// One reader per kind, each at its own native rate.
    #[default]
    Independent,
}

/// Width, height and bytes per sample of an image stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameDescription {
    pub width: u32,
    pub height: u32,
    pub bytes_per_pixel: u32,
}

impl FrameDescription {
    pub const fn new(width: u32, height: u32, bytes_per_pixel: u32) -> Self {
        Self {
            width,
            height,
            bytes_per_pixel,
        }
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn byte_len(&self) -> usize {
        self.pixel_count() * self.bytes_per_pixel as usize
    }
}

/// Sensor-reported range of trustworthy sample values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReliableRange {
    pub min: u16,
    pub max: u16,
}

impl ReliableRange {
    pub const fn new(min: u16, max: u16) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, value: u16) -> bool {
        value >= self.min && value <= self.max
    }
}
