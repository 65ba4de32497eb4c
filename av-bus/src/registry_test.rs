use std::sync::Arc;

use super::*;
use crate::mock::{MockDecoderBackend, MockDecoderConfig};
use crate::stream::PixelFormat;

#[test]
fn resolves_first_matching_decoder() {
    let r = BackendRegistry::mock();
    let d = r
        .decoder_descriptor(
            Platform::current(),
            CodecId::H264,
            MediaFormat::Pixel(PixelFormat::Yuv420p),
        )
        .unwrap();
    assert_eq!(d.name, "mock-decoder");
    assert!(r
        .resolve_decoder(Platform::Linux, CodecId::Aac, MediaFormat::None)
        .is_ok());
}

#[test]
fn unknown_codec_is_a_typed_error() {
    let r = BackendRegistry::mock();
    let err = r
        .resolve_decoder(Platform::Linux, CodecId::Subrip, MediaFormat::None)
        .err()
        .unwrap();
    assert_eq!(err.code(), 200);
    assert!(matches!(err, PipelineError::NoBackend { kind: "decoder", .. }));
}

#[test]
fn platform_and_format_filter_candidates() {
    let mut r = BackendRegistry::new();
    r.register_decoder(DecoderDescriptor {
        name: "windows-only",
        platform: Platform::Windows,
        codecs: &[CodecId::H264],
        formats: &[],
        construct: Arc::new(|| Box::new(MockDecoderBackend::new(MockDecoderConfig::default()))),
    });
    r.register_decoder(DecoderDescriptor {
        name: "nv12-only",
        platform: Platform::Any,
        codecs: &[CodecId::H264],
        formats: &[MediaFormat::Pixel(PixelFormat::Nv12)],
        construct: Arc::new(|| Box::new(MockDecoderBackend::new(MockDecoderConfig::default()))),
    });

    let pick = |p, f| r.decoder_descriptor(p, CodecId::H264, f).map(|d| d.name);
    assert_eq!(
        pick(Platform::Windows, MediaFormat::Pixel(PixelFormat::Yuv420p)),
        Some("windows-only")
    );
    assert_eq!(
        pick(Platform::Linux, MediaFormat::Pixel(PixelFormat::Nv12)),
        Some("nv12-only")
    );
    assert_eq!(
        pick(Platform::Linux, MediaFormat::Pixel(PixelFormat::Yuv420p)),
        None
    );
}

#[test]
fn containers_are_matched_by_url() {
    let r = BackendRegistry::mock();
    let src = r.open_container("synthetic://clip?packets=3").unwrap();
    assert_eq!(src.streams().len(), 2);

    let err = r.open_container("/no/such/file.mp4").err().unwrap();
    assert_eq!(err.code(), 205);
}

#[test]
fn hardware_names_prefer_dedicated_engines() {
    assert_eq!(hw_decoder_names(CodecId::H264)[0], "h264_cuvid");
    assert_eq!(hw_encoder_names(CodecId::Hevc)[0], "hevc_nvenc");
    assert!(hw_encoder_names(CodecId::Vp8).is_empty());
    assert!(hw_decoder_names(CodecId::Aac).is_empty());
    assert!(
        hw_decoder_names(CodecId::Vp9)
            .iter()
            .chain(hw_encoder_names(CodecId::Av1))
            .all(|n| is_hw_codec_name(n))
    );
    assert!(!is_hw_codec_name("libx264"));
}

#[test]
fn defaults_register_mock_codecs_only_on_request() {
    let r = BackendRegistry::with_defaults();
    let mock_decoder = |r: &BackendRegistry| {
        r.decoder_descriptor(Platform::current(), CodecId::H264, MediaFormat::None)
            .is_some_and(|d| d.name == "mock-decoder")
    };
    let mock_encoder = |r: &BackendRegistry| {
        r.encoder_descriptor(Platform::current(), CodecId::H264, MediaFormat::None)
            .is_some_and(|d| d.name == "mock-encoder")
    };
    assert!(!mock_decoder(&r));
    assert!(!mock_encoder(&r));
    assert!(r.open_container("synthetic://clip?packets=1&audio=false").is_ok());

    let r = r.with_mocks();
    assert!(r.open_container("synthetic://clip?packets=1&audio=false").is_ok());
    assert!(
        r.decoder_descriptor(Platform::current(), CodecId::Aac, MediaFormat::None)
            .is_some()
    );
    if cfg!(not(feature = "ffmpeg")) {
        assert!(mock_decoder(&r));
        assert!(mock_encoder(&r));
    }
}
