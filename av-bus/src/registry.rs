//! Backend catalog.
//!
//! The registry is an ordinary value built once at startup and handed to
//! every component that needs a backend. Lookups are pure functions of
//! `(platform, codec, format)`; the first registered match wins. Components
//! resolve once, when they open, never per packet.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::backend::{ContainerSource, DecoderBackend, EncoderBackend};
use crate::error::{PipelineError, Result};
use crate::mock;
use crate::stream::{CodecId, MediaFormat};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Linux,
    Windows,
    MacOs,
    Android,
    /// Matches every platform.
    Any,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(target_os = "android") {
            Platform::Android
        } else if cfg!(target_os = "linux") {
            Platform::Linux
        } else if cfg!(target_os = "windows") {
            Platform::Windows
        } else if cfg!(target_os = "macos") {
            Platform::MacOs
        } else {
            Platform::Any
        }
    }

    fn matches(&self, requested: Platform) -> bool {
        *self == Platform::Any || requested == Platform::Any || *self == requested
    }
}

pub type DecoderCtor = Arc<dyn Fn() -> Box<dyn DecoderBackend> + Send + Sync>;
pub type EncoderCtor = Arc<dyn Fn() -> Box<dyn EncoderBackend> + Send + Sync>;
pub type ContainerCtor = Arc<dyn Fn(&str) -> Result<Box<dyn ContainerSource>> + Send + Sync>;

#[derive(Clone)]
pub struct DecoderDescriptor {
    pub name: &'static str,
    pub platform: Platform,
    pub codecs: &'static [CodecId],
    /// Accepted input formats; empty accepts any.
    pub formats: &'static [MediaFormat],
    pub construct: DecoderCtor,
}

#[derive(Clone)]
pub struct EncoderDescriptor {
    pub name: &'static str,
    pub platform: Platform,
    pub codecs: &'static [CodecId],
    pub formats: &'static [MediaFormat],
    pub construct: EncoderCtor,
}

#[derive(Clone)]
pub struct ContainerDescriptor {
    pub name: &'static str,
    pub accepts: fn(&str) -> bool,
    pub open: ContainerCtor,
}

fn supports(
    platform: Platform,
    codecs: &[CodecId],
    formats: &[MediaFormat],
    want_platform: Platform,
    codec: CodecId,
    format: MediaFormat,
) -> bool {
    platform.matches(want_platform)
        && codecs.contains(&codec)
        && (formats.is_empty() || formats.contains(&format))
}

#[derive(Clone, Default)]
pub struct BackendRegistry {
    decoders: Vec<DecoderDescriptor>,
    encoders: Vec<EncoderDescriptor>,
    containers: Vec<ContainerDescriptor>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Synthetic backends only.
    pub fn mock() -> Self {
        let mut r = Self::new();
        mock::register(&mut r);
        r
    }

    /// Every real backend compiled in, plus the synthetic container. Mock
    /// codecs are never part of it; see [`Self::with_mocks`].
    pub fn with_defaults() -> Self {
        let mut r = Self::new();
        #[cfg(feature = "ffmpeg")]
        crate::ffmpeg::register(&mut r);
        mock::register_synthetic(&mut r);
        r
    }

    /// Appends the mock decoder and encoder. They only serve codecs no
    /// earlier registration handles.
    pub fn with_mocks(mut self) -> Self {
        log::warn!("mock codecs registered, decoded output is synthetic");
        mock::register_codecs(&mut self);
        self
    }

    pub fn register_decoder(&mut self, d: DecoderDescriptor) -> &mut Self {
        self.decoders.push(d);
        self
    }

    pub fn register_encoder(&mut self, d: EncoderDescriptor) -> &mut Self {
        self.encoders.push(d);
        self
    }

    pub fn register_container(&mut self, d: ContainerDescriptor) -> &mut Self {
        self.containers.push(d);
        self
    }

    pub fn decoder_descriptor(
        &self,
        platform: Platform,
        codec: CodecId,
        format: MediaFormat,
    ) -> Option<&DecoderDescriptor> {
        self.decoders
            .iter()
            .find(|d| supports(d.platform, d.codecs, d.formats, platform, codec, format))
    }

    pub fn encoder_descriptor(
        &self,
        platform: Platform,
        codec: CodecId,
        format: MediaFormat,
    ) -> Option<&EncoderDescriptor> {
        self.encoders
            .iter()
            .find(|d| supports(d.platform, d.codecs, d.formats, platform, codec, format))
    }

    pub fn resolve_decoder(
        &self,
        platform: Platform,
        codec: CodecId,
        format: MediaFormat,
    ) -> Result<Box<dyn DecoderBackend>> {
        let d = self
            .decoder_descriptor(platform, codec, format)
            .ok_or(PipelineError::NoBackend {
                kind: "decoder",
                platform,
                codec,
                format,
            })?;
        log::info!("decoder backend {} for {codec} {format:?}", d.name);
        Ok((d.construct)())
    }

    pub fn resolve_encoder(
        &self,
        platform: Platform,
        codec: CodecId,
        format: MediaFormat,
    ) -> Result<Box<dyn EncoderBackend>> {
        let d = self
            .encoder_descriptor(platform, codec, format)
            .ok_or(PipelineError::NoBackend {
                kind: "encoder",
                platform,
                codec,
                format,
            })?;
        log::info!("encoder backend {} for {codec} {format:?}", d.name);
        Ok((d.construct)())
    }

    pub fn open_container(&self, url: &str) -> Result<Box<dyn ContainerSource>> {
        let c = self
            .containers
            .iter()
            .find(|c| (c.accepts)(url))
            .ok_or_else(|| PipelineError::NoSource(url.to_string()))?;
        log::info!("container {} for {url}", c.name);
        (c.open)(url)
    }
}

/// Hardware decoder implementations for `codec`, most preferred first.
pub fn hw_decoder_names(codec: CodecId) -> &'static [&'static str] {
    match codec {
        CodecId::H264 => &["h264_cuvid", "h264_qsv", "h264_v4l2m2m"],
        CodecId::Hevc => &["hevc_cuvid", "hevc_qsv", "hevc_v4l2m2m"],
        CodecId::Vp8 => &["vp8_cuvid", "vp8_qsv", "vp8_v4l2m2m"],
        CodecId::Vp9 => &["vp9_cuvid", "vp9_qsv", "vp9_v4l2m2m"],
        CodecId::Av1 => &["av1_cuvid", "av1_qsv"],
        CodecId::Mpeg2 => &["mpeg2_cuvid", "mpeg2_qsv", "mpeg2_v4l2m2m"],
        CodecId::Mpeg4 => &["mpeg4_cuvid", "mpeg4_v4l2m2m"],
        _ => &[],
    }
}

/// Hardware encoder implementations for `codec`, most preferred first.
pub fn hw_encoder_names(codec: CodecId) -> &'static [&'static str] {
    match codec {
        CodecId::H264 => &["h264_nvenc", "h264_vaapi", "h264_qsv", "h264_v4l2m2m"],
        CodecId::Hevc => &["hevc_nvenc", "hevc_vaapi", "hevc_qsv", "hevc_v4l2m2m"],
        CodecId::Vp9 => &["vp9_vaapi", "vp9_qsv"],
        CodecId::Av1 => &["av1_nvenc", "av1_vaapi", "av1_qsv"],
        _ => &[],
    }
}

/// Whether an implementation name refers to a hardware codec.
pub fn is_hw_codec_name(name: &str) -> bool {
    ["nvenc", "vaapi", "qsv", "v4l2m2m", "cuvid"]
        .iter()
        .any(|hw| name.contains(hw))
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = |v: Vec<&'static str>| v.join(",");
        f.debug_struct("BackendRegistry")
            .field("decoders", &names(self.decoders.iter().map(|d| d.name).collect()))
            .field("encoders", &names(self.encoders.iter().map(|d| d.name).collect()))
            .field("containers", &names(self.containers.iter().map(|d| d.name).collect()))
            .finish()
    }
}

#[cfg(test)]
#[path = "registry_test.rs"]
mod registry_test;
