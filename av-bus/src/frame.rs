use bytes::Bytes;

use crate::hw::{HwFramesContext, HwSurface};
use crate::stream::{MediaFormat, MediaKind, PixelFormat, SampleFormat};

#[derive(Clone, Debug, PartialEq)]
pub struct CpuPlane {
    pub data: Bytes,
    pub stride: usize,
}

impl CpuPlane {
    pub fn new(data: impl Into<Bytes>, stride: usize) -> Self {
        Self {
            data: data.into(),
            stride,
        }
    }
}

#[derive(Clone, Debug)]
pub enum FrameStorage {
    Cpu(Vec<CpuPlane>),
    Hardware(HwSurface),
}

/// Dimensions and format a video encoder or mapper has to be configured for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameShape {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
}

/// A decoded picture or block of audio samples.
///
/// Video frames are either CPU resident or a reference to a hardware surface;
/// the surface carries the frames context that allocated it.
#[derive(Clone, Debug)]
pub struct Frame {
    kind: MediaKind,
    format: MediaFormat,
    width: u32,
    height: u32,
    sample_rate: u32,
    channels: u16,
    samples: usize,
    pts: Option<i64>,
    duration: i64,
    storage: FrameStorage,
}

impl Frame {
    pub fn video_cpu(format: PixelFormat, width: u32, height: u32, planes: Vec<CpuPlane>) -> Self {
        Self {
            kind: MediaKind::Video,
            format: MediaFormat::Pixel(format),
            width,
            height,
            sample_rate: 0,
            channels: 0,
            samples: 0,
            pts: None,
            duration: 0,
            storage: FrameStorage::Cpu(planes),
        }
    }

    pub fn video_hw(surface: HwSurface) -> Self {
        Self {
            kind: MediaKind::Video,
            format: MediaFormat::Pixel(surface.format()),
            width: surface.width(),
            height: surface.height(),
            sample_rate: 0,
            channels: 0,
            samples: 0,
            pts: None,
            duration: 0,
            storage: FrameStorage::Hardware(surface),
        }
    }

    pub fn audio(
        format: SampleFormat,
        sample_rate: u32,
        channels: u16,
        samples: usize,
        planes: Vec<CpuPlane>,
    ) -> Self {
        Self {
            kind: MediaKind::Audio,
            format: MediaFormat::Sample(format),
            width: 0,
            height: 0,
            sample_rate,
            channels,
            samples,
            pts: None,
            duration: 0,
            storage: FrameStorage::Cpu(planes),
        }
    }

    pub fn with_pts(mut self, pts: Option<i64>) -> Self {
        self.pts = pts;
        self
    }

    pub fn with_duration(mut self, duration: i64) -> Self {
        self.duration = duration;
        self
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn format(&self) -> MediaFormat {
        self.format
    }

    pub fn pixel_format(&self) -> Option<PixelFormat> {
        self.format.pixel()
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn samples(&self) -> usize {
        self.samples
    }

    pub fn pts(&self) -> Option<i64> {
        self.pts
    }

    pub fn duration(&self) -> i64 {
        self.duration
    }

    pub fn storage(&self) -> &FrameStorage {
        &self.storage
    }

    pub fn is_hardware(&self) -> bool {
        matches!(self.storage, FrameStorage::Hardware(_))
    }

    pub fn surface(&self) -> Option<&HwSurface> {
        match &self.storage {
            FrameStorage::Hardware(s) => Some(s),
            FrameStorage::Cpu(_) => None,
        }
    }

    pub fn planes(&self) -> &[CpuPlane] {
        match &self.storage {
            FrameStorage::Cpu(p) => p,
            FrameStorage::Hardware(_) => &[],
        }
    }

    pub fn frames_context(&self) -> Option<&HwFramesContext> {
        self.surface().map(|s| s.frames_context())
    }

    /// Shape a consumer has to be configured for. Hardware frames report the
    /// software layout of their surface.
    pub fn shape(&self) -> Option<FrameShape> {
        let format = match &self.storage {
            FrameStorage::Hardware(s) => s.sw_format(),
            FrameStorage::Cpu(_) => self.format.pixel()?,
        };
        Some(FrameShape {
            format,
            width: self.width,
            height: self.height,
        })
    }
}
