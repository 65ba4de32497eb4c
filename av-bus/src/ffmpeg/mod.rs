//! Backends over libav* (`ffmpeg-next`): container input, decoding on a
//! hardware device when one can be opened, encoding with a hardware encoder
//! when one is compiled in, and DRM PRIME export of decoded surfaces.

mod decode;
mod drm;
mod encode;
mod hw;
mod input;

use std::sync::{Arc, Once};

use ffmpeg_next::codec::Id;
use ffmpeg_next::format::{Pixel, Sample};

pub use decode::AvDecoderBackend;
pub use drm::DrmExporter;
pub use encode::AvEncoderBackend;
pub use hw::{AvHwDevice, AvHwFrames, AvSurface, cpu_frame, transfer_to_cpu};
pub use input::AvContainer;

use crate::backend::ContainerSource;
use crate::mapper::{ContextToken, DmaBufHeap, GpuBinding, SoftwareGpu};
use crate::mock::SYNTHETIC_SCHEME;
use crate::registry::{
    BackendRegistry, ContainerDescriptor, DecoderDescriptor, EncoderDescriptor, Platform,
};
use crate::stream::{CodecId, PixelFormat, Rational, SampleFormat};

static INIT: Once = Once::new();

pub fn init() {
    INIT.call_once(|| {
        if let Err(e) = ffmpeg_next::init() {
            log::error!("ffmpeg_next init: {e}");
        }
        ffmpeg_next::log::set_level(ffmpeg_next::log::Level::Warning);
    });
}

const DECODE_CODECS: &[CodecId] = &[
    CodecId::H264,
    CodecId::Hevc,
    CodecId::Vp8,
    CodecId::Vp9,
    CodecId::Av1,
    CodecId::Mpeg2,
    CodecId::Mpeg4,
];

const ENCODE_CODECS: &[CodecId] = &[CodecId::H264, CodecId::Hevc, CodecId::Vp9, CodecId::Av1];

pub fn register(r: &mut BackendRegistry) {
    init();
    r.register_container(ContainerDescriptor {
        name: "libavformat",
        accepts: |url| !url.starts_with(SYNTHETIC_SCHEME),
        open: Arc::new(|url| Ok(Box::new(AvContainer::open(url)?) as Box<dyn ContainerSource>)),
    });
    r.register_decoder(DecoderDescriptor {
        name: "libavcodec",
        platform: Platform::Any,
        codecs: DECODE_CODECS,
        formats: &[],
        construct: Arc::new(|| Box::new(AvDecoderBackend::new())),
    });
    r.register_encoder(EncoderDescriptor {
        name: "libavcodec",
        platform: Platform::Any,
        codecs: ENCODE_CODECS,
        formats: &[],
        construct: Arc::new(|| Box::new(AvEncoderBackend::new())),
    });
}

/// Headless rendering over libav surfaces. The software context cannot
/// import DRM objects, so frames reach it through the download path.
pub fn gpu_binding() -> GpuBinding {
    GpuBinding::new(
        ContextToken::new(Box::new(SoftwareGpu::new(DmaBufHeap::new()))),
        Box::new(DrmExporter::new()),
    )
}

pub(crate) fn codec_from_av(id: Id) -> CodecId {
    match id {
        Id::H264 => CodecId::H264,
        Id::HEVC => CodecId::Hevc,
        Id::VP8 => CodecId::Vp8,
        Id::VP9 => CodecId::Vp9,
        Id::AV1 => CodecId::Av1,
        Id::MPEG2VIDEO => CodecId::Mpeg2,
        Id::MPEG4 => CodecId::Mpeg4,
        Id::RAWVIDEO => CodecId::RawVideo,
        Id::AAC => CodecId::Aac,
        Id::OPUS => CodecId::Opus,
        Id::MP3 => CodecId::Mp3,
        Id::PCM_S16LE => CodecId::Pcm,
        Id::SUBRIP => CodecId::Subrip,
        _ => CodecId::Unknown,
    }
}

pub(crate) fn codec_to_av(codec: CodecId) -> Id {
    match codec {
        CodecId::H264 => Id::H264,
        CodecId::Hevc => Id::HEVC,
        CodecId::Vp8 => Id::VP8,
        CodecId::Vp9 => Id::VP9,
        CodecId::Av1 => Id::AV1,
        CodecId::Mpeg2 => Id::MPEG2VIDEO,
        CodecId::Mpeg4 => Id::MPEG4,
        CodecId::RawVideo => Id::RAWVIDEO,
        CodecId::Aac => Id::AAC,
        CodecId::Opus => Id::OPUS,
        CodecId::Mp3 => Id::MP3,
        CodecId::Pcm => Id::PCM_S16LE,
        CodecId::Subrip => Id::SUBRIP,
        CodecId::Unknown => Id::None,
    }
}

pub(crate) fn pixel_from_av(format: Pixel) -> Option<PixelFormat> {
    Some(match format {
        Pixel::YUV420P | Pixel::YUVJ420P => PixelFormat::Yuv420p,
        Pixel::NV12 => PixelFormat::Nv12,
        Pixel::P010LE => PixelFormat::P010,
        Pixel::RGBA => PixelFormat::Rgba,
        Pixel::BGRA => PixelFormat::Bgra,
        Pixel::RGB24 => PixelFormat::Rgb24,
        Pixel::VAAPI => PixelFormat::Vaapi,
        Pixel::CUDA => PixelFormat::Cuda,
        Pixel::QSV => PixelFormat::Qsv,
        Pixel::VIDEOTOOLBOX => PixelFormat::VideoToolbox,
        Pixel::D3D11 => PixelFormat::D3d11,
        Pixel::DRM_PRIME => PixelFormat::DrmPrime,
        _ => return None,
    })
}

pub(crate) fn pixel_to_av(format: PixelFormat) -> Pixel {
    match format {
        PixelFormat::Yuv420p => Pixel::YUV420P,
        PixelFormat::Nv12 => Pixel::NV12,
        PixelFormat::P010 => Pixel::P010LE,
        PixelFormat::Rgba => Pixel::RGBA,
        PixelFormat::Bgra => Pixel::BGRA,
        PixelFormat::Rgb24 => Pixel::RGB24,
        PixelFormat::Vaapi => Pixel::VAAPI,
        PixelFormat::Cuda => Pixel::CUDA,
        PixelFormat::Qsv => Pixel::QSV,
        PixelFormat::VideoToolbox => Pixel::VIDEOTOOLBOX,
        PixelFormat::D3d11 => Pixel::D3D11,
        PixelFormat::DrmPrime => Pixel::DRM_PRIME,
        PixelFormat::MockSurface => Pixel::None,
    }
}

pub(crate) fn sample_from_av(format: Sample) -> SampleFormat {
    use ffmpeg_next::format::sample::Type;
    match format {
        Sample::I16(Type::Packed) => SampleFormat::S16,
        Sample::I16(Type::Planar) => SampleFormat::S16p,
        Sample::I32(_) => SampleFormat::S32,
        Sample::F32(Type::Packed) => SampleFormat::F32,
        _ => SampleFormat::F32p,
    }
}

pub(crate) fn rational_from_av(r: ffmpeg_next::Rational) -> Rational {
    Rational::new(r.numerator(), r.denominator())
}

pub(crate) fn rational_to_av(r: Rational) -> ffmpeg_next::Rational {
    ffmpeg_next::Rational::new(r.num, r.den)
}

/// Whether `err` is libav's "try again".
pub(crate) fn is_again(err: &ffmpeg_next::Error) -> bool {
    matches!(err, ffmpeg_next::Error::Other { errno } if *errno == ffmpeg_next::util::error::EAGAIN)
}
