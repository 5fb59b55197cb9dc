use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{Result, StreamKind, SyncMode};

/// Top-level configuration structure for the application.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub capture: CaptureConfig,
    pub output: OutputConfig,
}

impl AppConfig {
    /// Loads a configuration file. Missing fields keep their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Which streams are captured and how sessions are arranged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub sync_mode: SyncMode,
    pub streams: Vec<StreamKind>,
    /// One session per stream on a shared sensor, instead of a single
    /// session covering every stream.
    pub session_per_stream: bool,
    pub rate_window_ms: u64,
    pub report_interval_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sync_mode: SyncMode::Independent,
            streams: StreamKind::ALL.to_vec(),
            session_per_stream: true,
            rate_window_ms: 1_000,
            report_interval_ms: 1_000,
        }
    }
}

impl CaptureConfig {
    pub fn rate_window(&self) -> Duration {
        Duration::from_millis(self.rate_window_ms.max(1))
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_millis(self.report_interval_ms.max(1))
    }
}

/// Where and how captured frames are written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// File name prefix of video and skeleton outputs.
    pub prefix: String,
    pub directory: PathBuf,
    pub video: bool,
    pub stills: bool,
    pub video_fps: u32,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            prefix: "output".into(),
            directory: PathBuf::from("."),
            video: false,
            stills: true,
            video_fps: 30,
        }
    }
}

impl OutputConfig {
    /// `<directory>/output_<kind>`
    pub fn still_directory(&self, kind: StreamKind) -> PathBuf {
        self.directory.join(format!("output_{}", kind.tag()))
    }

    /// `<directory>/<prefix>_<kind>.y4m`
    pub fn video_path(&self, kind: StreamKind) -> PathBuf {
        self.directory
            .join(format!("{}_{}.y4m", self.prefix, kind.tag()))
    }

    pub fn body_csv_path(&self) -> PathBuf {
        self.directory.join(format!("{}_body.csv", self.prefix))
    }
}
