use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::encoder::DtsPolicy;
use crate::error::{PipelineError, Result};
use crate::hw::HwDeviceType;
use crate::queue::DEFAULT_QUEUE_CAPACITY;
use crate::registry::Platform;
use crate::stream::{CodecId, PixelFormat, Rational};

pub const DEFAULT_POOL_SIZE: usize = 20;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub queue_capacity: usize,
    /// First wait after a busy or pool-exhausted backend; doubles per retry.
    pub retry_backoff_ms: u64,
    pub retry_backoff_max_ms: u64,
    pub demuxer: DemuxerConfig,
    pub decoder: DecoderConfig,
    pub encoder: EncoderConfig,
    pub mapper: MapperConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            retry_backoff_ms: 2,
            retry_backoff_max_ms: 32,
            demuxer: DemuxerConfig::default(),
            decoder: DecoderConfig::default(),
            encoder: EncoderConfig::default(),
            mapper: MapperConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn from_json_str(s: &str) -> anyhow::Result<Self> {
        let config: Self = serde_json::from_str(s).context("parse pipeline config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        Self::from_json_str(&text).with_context(|| format!("load config {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(PipelineError::Config("queue_capacity must be > 0".into()));
        }
        if self.retry_backoff_ms == 0 || self.retry_backoff_ms > self.retry_backoff_max_ms {
            return Err(PipelineError::Config(format!(
                "retry backoff {}..{} ms is not a valid range",
                self.retry_backoff_ms, self.retry_backoff_max_ms
            )));
        }
        if self.decoder.pool_size == 0 || self.encoder.pool_size == 0 {
            return Err(PipelineError::Config("pool_size must be > 0".into()));
        }
        let rate = self.encoder.frame_rate;
        if rate.num <= 0 || rate.den <= 0 {
            return Err(PipelineError::Config(format!("invalid frame_rate {rate}")));
        }
        let tb = self.encoder.time_base;
        if tb.num <= 0 || tb.den <= 0 {
            return Err(PipelineError::Config(format!("invalid time_base {tb}")));
        }
        Ok(())
    }

    pub fn tuning(&self) -> Tuning {
        Tuning {
            queue_capacity: self.queue_capacity,
            backoff: Backoff {
                initial: Duration::from_millis(self.retry_backoff_ms),
                max: Duration::from_millis(self.retry_backoff_max_ms),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DemuxerConfig {
    /// File path, URL, or `synthetic` for the built-in test source.
    pub source: String,
    pub synthetic_frames: u32,
    pub synthetic_audio: bool,
}

impl Default for DemuxerConfig {
    fn default() -> Self {
        Self {
            source: "synthetic".to_string(),
            synthetic_frames: 300,
            synthetic_audio: true,
        }
    }
}

impl DemuxerConfig {
    /// URL handed to the container registry.
    pub fn url(&self) -> String {
        if self.source == "synthetic" {
            format!(
                "synthetic://config?packets={}&audio={}",
                self.synthetic_frames, self.synthetic_audio
            )
        } else {
            self.source.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DecoderConfig {
    /// Overrides the detected platform for backend selection.
    pub platform: Option<Platform>,
    pub pool_size: usize,
    /// Overrides the backend's preferred accelerator.
    pub hw_device: Option<HwDeviceType>,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            platform: None,
            pool_size: DEFAULT_POOL_SIZE,
            hw_device: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EncoderConfig {
    pub codec: CodecId,
    pub bitrate: u64,
    pub gop: u32,
    pub time_base: Rational,
    pub frame_rate: Rational,
    /// None adopts the format of the first frame.
    pub pixel_format: Option<PixelFormat>,
    pub platform: Option<Platform>,
    pub pool_size: usize,
    pub dts_policy: DtsPolicy,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            codec: CodecId::H264,
            bitrate: 4_000_000,
            gop: 30,
            time_base: Rational::new(1, 1_000_000),
            frame_rate: Rational::new(30, 1),
            pixel_format: None,
            platform: None,
            pool_size: DEFAULT_POOL_SIZE,
            dts_policy: DtsPolicy::LegacyOffset,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MapperConfig {
    pub enabled: bool,
    /// Skip the zero-copy import and always take the CPU path.
    pub force_fallback: bool,
}

impl Default for MapperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            force_fallback: false,
        }
    }
}

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn next(&self, current: Duration) -> Duration {
        (current * 2).min(self.max)
    }
}

/// Settings every queued component shares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tuning {
    pub queue_capacity: usize,
    pub backoff: Backoff,
}

impl Default for Tuning {
    fn default() -> Self {
        PipelineConfig::default().tuning()
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod config_test;
