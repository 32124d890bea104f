pub mod capture;
pub mod error;
pub mod pipeline;
pub mod stats;
pub mod supervisor;
pub mod transport;
pub mod utils;

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use capture::driver::{ColorMethod, PanoramicSettings};
use capture::simulator::SimulatorConfig;
use transport::LinkMode;

pub use capture::{CameraDriver, FrameSource, RawFrame};
pub use error::{Error, Result};
pub use pipeline::encoder::{ImageEncoder, JpegCompressor};
pub use stats::{PipelineStats, StatsSnapshot};
pub use supervisor::{Collaborators, Supervisor, SupervisorHandle, SupervisorState};
pub use transport::envelope::{CompressedImage, OutboundEnvelope};
pub use transport::{TcpPublisher, TcpSubscriber};

/// Prefix for environment overrides, e.g. `PANOSTREAM__TRANSPORT__ENDPOINT`
const ENV_PREFIX: &str = "PANOSTREAM";

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub pipeline: PipelineConfig,
    pub transport: TransportConfig,
    pub supervisor: SupervisorConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureMode {
    /// One JPEG per lens
    Lenses,
    /// One stitched panorama per capture
    Panoramic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub mode: CaptureMode,
    pub lens_count: usize,
    pub color_method: ColorMethod,
    pub panoramic: PanoramicSettings,
    pub init_retries: u32,
    pub init_backoff_ms: u64,
    pub probe_retries: u32,
    pub grab_retries: u32,
    pub grab_backoff_ms: u64,
    pub grab_backoff_max_ms: u64,
    pub simulator: SimulatorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Defaults to one worker per lens
    pub workers: Option<usize>,
    pub jpeg_quality: u8,
    pub ready_wait_ms: u64,
    pub pin_workers: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub endpoint: String,
    pub mode: LinkMode,
    pub high_water_mark: usize,
    pub reconnect_ms: u64,
    pub device_name: String,
    pub camera_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub restart_delay_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            mode: CaptureMode::Lenses,
            lens_count: 6,
            color_method: ColorMethod::Downsample4,
            panoramic: PanoramicSettings::default(),
            init_retries: 10,
            init_backoff_ms: 2500,
            probe_retries: 10,
            grab_retries: 10,
            grab_backoff_ms: 10,
            grab_backoff_max_ms: 500,
            simulator: SimulatorConfig::default(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: None,
            jpeg_quality: 85,
            ready_wait_ms: 1000,
            pin_workers: false,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            endpoint: "tcp://127.0.0.1:28882".into(),
            mode: LinkMode::Bind,
            high_water_mark: 6,
            reconnect_ms: 1000,
            device_name: "windows".into(),
            camera_name: "ladybug5".into(),
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            restart_delay_ms: 500,
        }
    }
}

impl CaptureConfig {
    /// Number of images every frame carries in this mode
    pub fn frame_lens_count(&self) -> usize {
        match self.mode {
            CaptureMode::Lenses => self.lens_count,
            CaptureMode::Panoramic => 1,
        }
    }

    pub fn init_backoff(&self) -> Duration {
        Duration::from_millis(self.init_backoff_ms)
    }
}

impl PipelineConfig {
    pub fn worker_count(&self, lens_count: usize) -> usize {
        self.workers.unwrap_or(lens_count).max(1)
    }

    pub fn ready_wait(&self) -> Duration {
        Duration::from_millis(self.ready_wait_ms)
    }
}

impl TransportConfig {
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_ms)
    }
}

impl SupervisorConfig {
    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }
}

impl Config {
    /// Layer an optional TOML file and `PANOSTREAM__*` environment variables
    /// over the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let config: Config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(Error::Config(config::ConfigError::Message(msg)));

        if !(1..=capture::frame::LensTag::LENSES.len()).contains(&self.capture.lens_count) {
            return invalid(format!(
                "capture.lens_count must be between 1 and 6, got {}",
                self.capture.lens_count
            ));
        }
        if !(1..=100).contains(&self.pipeline.jpeg_quality) {
            return invalid(format!(
                "pipeline.jpeg_quality must be between 1 and 100, got {}",
                self.pipeline.jpeg_quality
            ));
        }
        if self.pipeline.workers == Some(0) {
            return invalid("pipeline.workers must be at least 1".into());
        }
        if self.transport.high_water_mark == 0 {
            return invalid("transport.high_water_mark must be at least 1".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn defaults_match_rig() {
        let config = Config::default();
        assert_eq!(config.capture.frame_lens_count(), 6);
        assert_eq!(config.pipeline.worker_count(6), 6);
        assert_eq!(config.pipeline.jpeg_quality, 85);
        assert_eq!(config.transport.high_water_mark, 6);
        assert_eq!(config.supervisor.restart_delay(), Duration::from_millis(500));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn panoramic_mode_carries_one_image() {
        let mut config = Config::default();
        config.capture.mode = CaptureMode::Panoramic;
        assert_eq!(config.capture.frame_lens_count(), 1);
        assert_eq!(config.pipeline.worker_count(1), 1);
    }

    #[test]
    fn load_merges_file_over_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[pipeline]
jpeg_quality = 70
workers = 3

[transport]
endpoint = "tcp://10.0.0.5:28882"
mode = "connect"
"#
        )
        .unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.pipeline.jpeg_quality, 70);
        assert_eq!(config.pipeline.workers, Some(3));
        assert_eq!(config.transport.endpoint, "tcp://10.0.0.5:28882");
        assert_eq!(config.transport.mode, LinkMode::Connect);
        // Untouched sections keep their defaults
        assert_eq!(config.capture.lens_count, 6);
        assert_eq!(config.transport.high_water_mark, 6);
    }

    #[test]
    fn validate_rejects_out_of_range_values() {
        let mut config = Config::default();
        config.capture.lens_count = 7;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.pipeline.jpeg_quality = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.transport.high_water_mark = 0;
        assert!(config.validate().is_err());
    }
}
