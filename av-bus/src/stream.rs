use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Exact fraction used for time bases and frame rates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rational {
    pub num: i32,
    pub den: i32,
}

impl Rational {
    pub const fn new(num: i32, den: i32) -> Self {
        Self { num, den }
    }

    pub fn numerator(&self) -> i32 {
        self.num
    }

    pub fn denominator(&self) -> i32 {
        self.den
    }

    pub fn invert(&self) -> Self {
        Self::new(self.den, self.num)
    }

    pub fn is_valid(&self) -> bool {
        self.num != 0 && self.den != 0
    }

    pub fn as_f64(&self) -> f64 {
        if self.den == 0 {
            return 0.0;
        }
        self.num as f64 / self.den as f64
    }
}

impl fmt::Display for Rational {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

/// Every packet and frame timestamp downstream of the demuxer is in microseconds.
pub const PIPELINE_TIME_BASE: Rational = Rational::new(1, 1_000_000);

/// Rescales `value` from one time base to another, rounding half away from zero.
pub fn rescale(value: i64, from: Rational, to: Rational) -> i64 {
    if !from.is_valid() || !to.is_valid() || from == to {
        return value;
    }
    let num = value as i128 * from.num as i128 * to.den as i128;
    let den = from.den as i128 * to.num as i128;
    let (num, den) = if den < 0 { (-num, -den) } else { (num, den) };
    let q = if num >= 0 {
        (num + den / 2) / den
    } else {
        (num - den / 2) / den
    };
    q.clamp(i64::MIN as i128, i64::MAX as i128) as i64
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Video,
    Audio,
    Subtitle,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodecId {
    H264,
    Hevc,
    Vp8,
    Vp9,
    Av1,
    Mpeg2,
    Mpeg4,
    RawVideo,
    Aac,
    Opus,
    Mp3,
    Pcm,
    Subrip,
    Unknown,
}

impl CodecId {
    pub fn kind(&self) -> MediaKind {
        match self {
            Self::Aac | Self::Opus | Self::Mp3 | Self::Pcm => MediaKind::Audio,
            Self::Subrip => MediaKind::Subtitle,
            _ => MediaKind::Video,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::H264 => "h264",
            Self::Hevc => "hevc",
            Self::Vp8 => "vp8",
            Self::Vp9 => "vp9",
            Self::Av1 => "av1",
            Self::Mpeg2 => "mpeg2video",
            Self::Mpeg4 => "mpeg4",
            Self::RawVideo => "rawvideo",
            Self::Aac => "aac",
            Self::Opus => "opus",
            Self::Mp3 => "mp3",
            Self::Pcm => "pcm_s16le",
            Self::Subrip => "subrip",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for CodecId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    Yuv420p,
    Nv12,
    P010,
    Rgba,
    Bgra,
    Rgb24,
    // Opaque hardware surfaces.
    Vaapi,
    Cuda,
    Qsv,
    VideoToolbox,
    D3d11,
    DrmPrime,
    MockSurface,
}

impl PixelFormat {
    pub fn is_hardware(&self) -> bool {
        matches!(
            self,
            Self::Vaapi
                | Self::Cuda
                | Self::Qsv
                | Self::VideoToolbox
                | Self::D3d11
                | Self::DrmPrime
                | Self::MockSurface
        )
    }

    /// Number of memory planes of a CPU-layout format; 0 for hardware formats.
    pub fn plane_count(&self) -> usize {
        match self {
            Self::Yuv420p => 3,
            Self::Nv12 | Self::P010 => 2,
            Self::Rgba | Self::Bgra | Self::Rgb24 => 1,
            _ => 0,
        }
    }

    pub fn is_packed(&self) -> bool {
        self.plane_count() == 1
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleFormat {
    S16,
    S16p,
    S32,
    F32,
    F32p,
}

impl SampleFormat {
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            Self::S16 | Self::S16p => 2,
            Self::S32 | Self::F32 | Self::F32p => 4,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaFormat {
    None,
    Pixel(PixelFormat),
    Sample(SampleFormat),
}

impl MediaFormat {
    pub fn pixel(&self) -> Option<PixelFormat> {
        match self {
            Self::Pixel(p) => Some(*p),
            _ => None,
        }
    }

    pub fn sample(&self) -> Option<SampleFormat> {
        match self {
            Self::Sample(s) => Some(*s),
            _ => None,
        }
    }
}

/// Description of one elementary stream as produced by the demuxer.
///
/// Fields are private: a descriptor is immutable once produced. A decoder that
/// needs to specialize it works on its own clone through the `with_*` builders.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamDescriptor {
    index: usize,
    codec: CodecId,
    kind: MediaKind,
    format: MediaFormat,
    width: u32,
    height: u32,
    sample_rate: u32,
    channels: u16,
    bit_rate: u64,
    frame_rate: Rational,
    time_base: Rational,
    extradata: Bytes,
}

impl StreamDescriptor {
    pub fn video(index: usize, codec: CodecId, width: u32, height: u32) -> Self {
        Self {
            index,
            codec,
            kind: MediaKind::Video,
            format: MediaFormat::Pixel(PixelFormat::Yuv420p),
            width,
            height,
            sample_rate: 0,
            channels: 0,
            bit_rate: 0,
            frame_rate: Rational::new(30, 1),
            time_base: Rational::new(1, 90_000),
            extradata: Bytes::new(),
        }
    }

    pub fn audio(index: usize, codec: CodecId, sample_rate: u32, channels: u16) -> Self {
        Self {
            index,
            codec,
            kind: MediaKind::Audio,
            format: MediaFormat::Sample(SampleFormat::F32p),
            width: 0,
            height: 0,
            sample_rate,
            channels,
            bit_rate: 0,
            frame_rate: Rational::new(0, 1),
            time_base: Rational::new(1, sample_rate.max(1) as i32),
            extradata: Bytes::new(),
        }
    }

    pub fn subtitle(index: usize, codec: CodecId) -> Self {
        Self {
            index,
            codec,
            kind: MediaKind::Subtitle,
            format: MediaFormat::None,
            width: 0,
            height: 0,
            sample_rate: 0,
            channels: 0,
            bit_rate: 0,
            frame_rate: Rational::new(0, 1),
            time_base: Rational::new(1, 1000),
            extradata: Bytes::new(),
        }
    }

    /// Descriptor of the packet stream an encoder emits for frames shaped like `input`.
    pub fn for_encoder_output(input: &StreamDescriptor, codec: CodecId, bit_rate: u64) -> Self {
        Self {
            index: 0,
            codec,
            kind: codec.kind(),
            bit_rate,
            time_base: PIPELINE_TIME_BASE,
            extradata: Bytes::new(),
            ..input.clone()
        }
    }

    pub fn with_index(mut self, index: usize) -> Self {
        self.index = index;
        self
    }

    pub fn with_format(mut self, format: MediaFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_dimensions(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_bit_rate(mut self, bit_rate: u64) -> Self {
        self.bit_rate = bit_rate;
        self
    }

    pub fn with_frame_rate(mut self, frame_rate: Rational) -> Self {
        self.frame_rate = frame_rate;
        self
    }

    pub fn with_time_base(mut self, time_base: Rational) -> Self {
        self.time_base = time_base;
        self
    }

    pub fn with_extradata(mut self, extradata: impl Into<Bytes>) -> Self {
        self.extradata = extradata.into();
        self
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn codec(&self) -> CodecId {
        self.codec
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn format(&self) -> MediaFormat {
        self.format
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

    pub fn bit_rate(&self) -> u64 {
        self.bit_rate
    }

    pub fn frame_rate(&self) -> Rational {
        self.frame_rate
    }

    /// Native time base of the container stream.
    pub fn time_base(&self) -> Rational {
        self.time_base
    }

    pub fn extradata(&self) -> &Bytes {
        &self.extradata
    }

    pub fn is_video(&self) -> bool {
        self.kind == MediaKind::Video
    }

    pub fn is_audio(&self) -> bool {
        self.kind == MediaKind::Audio
    }

    /// Duration of one frame in microseconds, if the frame rate is known.
    pub fn frame_duration_us(&self) -> Option<i64> {
        if self.frame_rate.num <= 0 || self.frame_rate.den <= 0 {
            return None;
        }
        Some(rescale(1, self.frame_rate.invert(), PIPELINE_TIME_BASE))
    }
}

impl fmt::Display for StreamDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            MediaKind::Video => write!(
                f,
                "#{} {} {}x{} {:?} @ {} tb={}",
                self.index,
                self.codec,
                self.width,
                self.height,
                self.format,
                self.frame_rate,
                self.time_base
            ),
            MediaKind::Audio => write!(
                f,
                "#{} {} {}Hz {}ch {:?} tb={}",
                self.index, self.codec, self.sample_rate, self.channels, self.format, self.time_base
            ),
            MediaKind::Subtitle => write!(f, "#{} {} subtitle", self.index, self.codec),
        }
    }
}

#[cfg(test)]
#[path = "stream_test.rs"]
mod stream_test;
