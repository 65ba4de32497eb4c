use std::sync::Arc;
use std::thread;
use std::time::Instant;

use super::*;
use crate::hw::HwDeviceType;
use crate::mapper::Framebuffer;
use crate::mock::{MessageRecorder, MockSurfaceData, synthetic_nv12};
use crate::stream::{CodecId, Rational};

const WAIT: Duration = Duration::from_secs(5);

struct Rig {
    graph: Arc<PadGraph>,
    source: PadId,
    encoder: Encoder,
    recorder: Arc<MessageRecorder>,
}

fn rig_with(config: PipelineConfig) -> Rig {
    let graph = PadGraph::new();
    let encoder = Encoder::new(graph.clone(), Arc::new(BackendRegistry::mock()), &config);
    encoder.init().unwrap();
    let source = graph.create_output_pad("src", None);
    graph.connect(source, encoder.frame_input().unwrap()).unwrap();
    let recorder = MessageRecorder::new();
    let consumer: Arc<dyn MessageConsumer> = recorder.clone();
    let sink = graph.create_input_pad("sink", None, Arc::downgrade(&consumer));
    graph.connect(encoder.packet_output(0).unwrap(), sink).unwrap();
    encoder.open().unwrap();
    Rig {
        graph,
        source,
        encoder,
        recorder,
    }
}

fn rig() -> Rig {
    rig_with(PipelineConfig::default())
}

fn rgba(width: u32, height: u32) -> Frame {
    Frame::video_cpu(
        PixelFormat::Rgba,
        width,
        height,
        vec![CpuPlane::new(
            vec![0x80u8; (width * height * 4) as usize],
            width as usize * 4,
        )],
    )
}

fn packets(recorder: &MessageRecorder) -> Vec<Packet> {
    recorder
        .messages()
        .into_iter()
        .filter_map(|(_, m)| m.into_packet())
        .collect()
}

#[test]
fn legacy_dts_trails_pts_and_never_goes_negative() {
    let p = DtsPolicy::LegacyOffset;
    assert_eq!(p.dts(0, 33_333, 0), 0);
    assert_eq!(p.dts(1, 33_333, 33_333), 29_999);
    assert_eq!(p.dts(3, 33_333, 99_999), 96_665);
    // Never after pts, even for packets the backend delivers early.
    assert_eq!(p.dts(5, 33_333, 10), 10);
    assert_eq!(DtsPolicy::EqualsPts.dts(7, 33_333, 1234), 1234);
    assert_eq!(DtsPolicy::default(), DtsPolicy::LegacyOffset);
}

#[test]
fn encoder_surface_formats() {
    assert_eq!(pixel_format_for_encoder(PixelFormat::Rgba, true), PixelFormat::Nv12);
    assert_eq!(pixel_format_for_encoder(PixelFormat::Bgra, false), PixelFormat::Yuv420p);
    assert_eq!(pixel_format_for_encoder(PixelFormat::Yuv420p, true), PixelFormat::Nv12);
    assert_eq!(pixel_format_for_encoder(PixelFormat::Yuv420p, false), PixelFormat::Yuv420p);
    assert_eq!(pixel_format_for_encoder(PixelFormat::P010, true), PixelFormat::P010);
    assert_eq!(pixel_format_for_encoder(PixelFormat::Nv12, true), PixelFormat::Nv12);
}

#[test]
fn configuration_waits_for_the_first_frame() {
    let r = rig();
    assert!(r.encoder.configured_shape().is_none());
    assert!(r.encoder.frames_context().is_none());
    let out = r.encoder.packet_output(0).unwrap();
    let before = r.graph.params(out).unwrap();
    assert_eq!(before.as_packet().unwrap().stream.width(), 0);

    r.encoder.start().unwrap();
    for _ in 0..5 {
        r.graph.produce(r.source, Message::data_frame(rgba(32, 16)));
    }
    r.graph.produce(r.source, Message::stop(true));
    assert!(r.recorder.wait_for(Action::Stop, 1, WAIT));

    let shape = r.encoder.configured_shape().unwrap();
    assert_eq!((shape.width, shape.height), (32, 16));
    let pool = r.encoder.frames_context().unwrap();
    assert_eq!(pool.device().device_type(), HwDeviceType::Mock);
    assert_eq!(pool.config().sw_format, PixelFormat::Nv12);

    let actions = r.recorder.actions();
    let init = actions.iter().position(|a| *a == Action::Init).unwrap();
    let data = actions.iter().position(|a| *a == Action::Data).unwrap();
    assert!(init < data);
    let announced = r
        .recorder
        .messages()
        .into_iter()
        .find_map(|(_, m)| m.params().cloned())
        .unwrap();
    let stream = &announced.as_packet().unwrap().stream;
    assert_eq!((stream.width(), stream.height()), (32, 16));
    assert_eq!(stream.codec(), CodecId::H264);
    assert_eq!(r.graph.params(out), Some(announced.clone()));
}

#[test]
fn timestamps_follow_the_frame_counter() {
    let r = rig();
    r.encoder.start().unwrap();
    for i in 0..4 {
        // Input timestamps are ignored.
        let frame = rgba(16, 16).with_pts(Some(1_000_000 + i));
        r.graph.produce(r.source, Message::data_frame(frame));
    }
    r.graph.produce(r.source, Message::stop(true));
    assert!(r.recorder.wait_for(Action::Stop, 1, WAIT));

    let out = packets(&r.recorder);
    let pts: Vec<_> = out.iter().map(|p| p.pts()).collect();
    assert_eq!(pts, vec![Some(0), Some(33_333), Some(66_666), Some(99_999)]);
    let dts: Vec<_> = out.iter().map(|p| p.dts()).collect();
    assert_eq!(dts, vec![Some(0), Some(29_999), Some(63_332), Some(96_665)]);
    assert!(out.iter().all(|p| p.dts() <= p.pts()));
    assert!(out[0].is_key());
    assert_eq!(out[1].duration(), 33_333);
}

#[test]
fn packets_are_rescaled_from_the_encoder_time_base() {
    let mut config = PipelineConfig::default();
    config.encoder.time_base = Rational::new(1, 90_000);
    config.encoder.dts_policy = DtsPolicy::EqualsPts;
    let r = rig_with(config);
    r.encoder.start().unwrap();
    for _ in 0..3 {
        r.graph.produce(r.source, Message::data_frame(rgba(16, 16)));
    }
    r.graph.produce(r.source, Message::stop(true));
    assert!(r.recorder.wait_for(Action::Stop, 1, WAIT));

    let out = packets(&r.recorder);
    let pts: Vec<_> = out.iter().map(|p| p.pts()).collect();
    assert_eq!(pts, vec![Some(0), Some(33_333), Some(66_667)]);
    assert!(out.iter().all(|p| p.dts() == p.pts()));
    assert_eq!(
        r.encoder.output_descriptor().unwrap().time_base(),
        Rational::new(1, 90_000)
    );
}

#[test]
fn frames_of_another_shape_are_dropped() {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let graph = PadGraph::new();
    let encoder = Encoder::new(
        graph.clone(),
        Arc::new(BackendRegistry::mock()),
        &PipelineConfig::default(),
    )
    .with_events(tx);
    encoder.init().unwrap();
    let source = graph.create_output_pad("src", None);
    graph.connect(source, encoder.frame_input().unwrap()).unwrap();
    let recorder = MessageRecorder::new();
    let consumer: Arc<dyn MessageConsumer> = recorder.clone();
    let sink = graph.create_input_pad("sink", None, Arc::downgrade(&consumer));
    graph.connect(encoder.packet_output(0).unwrap(), sink).unwrap();
    encoder.open().unwrap();
    encoder.start().unwrap();

    for frame in [rgba(32, 16), rgba(32, 16), rgba(16, 16), rgba(32, 16)] {
        graph.produce(source, Message::data_frame(frame));
    }
    graph.produce(source, Message::stop(true));
    assert!(recorder.wait_for(Action::Stop, 1, WAIT));
    assert_eq!(packets(&recorder).len(), 3);
    assert_eq!(encoder.phase(), Phase::Running);
    let deadline = Instant::now() + WAIT;
    let event = loop {
        match rx.try_recv() {
            Ok(ev) => break ev,
            Err(_) if Instant::now() < deadline => thread::sleep(Duration::from_millis(5)),
            Err(e) => panic!("no event: {e}"),
        }
    };
    assert_eq!(
        event,
        ComponentEvent::EndOfStream {
            component: "encoder".to_string()
        }
    );
    assert!(rx.try_recv().is_err());
    encoder.stop().unwrap();
}

#[test]
fn hardware_frames_reuse_the_decoder_pool() {
    let r = rig();
    let device = HwDeviceContext::new(HwDeviceType::Mock);
    let pool = HwFramesContext::new(
        &device,
        FramesPoolConfig {
            sw_format: PixelFormat::Nv12,
            width: 16,
            height: 8,
            pool_size: 4,
        },
    )
    .unwrap();
    let surface = pool
        .acquire_with(Arc::new(MockSurfaceData {
            nv12: synthetic_nv12(16, 8, 0),
            frame_number: 0,
        }))
        .unwrap();
    let frame = Frame::video_hw(surface);

    assert_eq!(r.encoder.encode(&frame), BackendStatus::Ok);
    assert!(r.encoder.frames_context().unwrap().same_pool(&pool));
    assert_eq!(r.encoder.frames_submitted(), 1);
    // The configured shape is the surface's software layout.
    assert_eq!(
        r.encoder.configured_shape().unwrap().format,
        PixelFormat::Nv12
    );
}

#[test]
fn read_back_framebuffers_are_encoded() {
    let r = rig();
    r.encoder.start().unwrap();
    for i in 0..2u64 {
        let fb = TimedFramebuffer {
            timestamp: i as i64 * 33_333,
            framebuffer: Framebuffer {
                id: i,
                width: 8,
                height: 8,
                contents: Some(vec![0u8; 8 * 8 * 4].into()),
            },
            zero_copy: true,
        };
        r.graph.produce(r.source, Message::data_framebuffer(fb));
    }
    // Without contents there is nothing to encode.
    let empty = TimedFramebuffer {
        timestamp: 0,
        framebuffer: Framebuffer {
            id: 9,
            width: 8,
            height: 8,
            contents: None,
        },
        zero_copy: true,
    };
    r.graph.produce(r.source, Message::data_framebuffer(empty));
    r.graph.produce(r.source, Message::stop(true));
    assert!(r.recorder.wait_for(Action::Stop, 1, WAIT));
    assert_eq!(packets(&r.recorder).len(), 2);
    assert_eq!(
        r.encoder.configured_shape().unwrap().format,
        PixelFormat::Rgba
    );
}

#[test]
fn direct_encode_reports_rejections() {
    let graph = PadGraph::new();
    let encoder = Encoder::new(
        graph,
        Arc::new(BackendRegistry::mock()),
        &PipelineConfig::default(),
    );
    assert!(matches!(encoder.encode(&rgba(8, 8)), BackendStatus::Fatal(_)));
    encoder.init().unwrap();
    encoder.open().unwrap();

    let audio = Frame::audio(crate::stream::SampleFormat::F32, 48_000, 2, 0, vec![]);
    assert!(matches!(encoder.encode(&audio), BackendStatus::Fatal(_)));
    assert_eq!(encoder.encode(&rgba(8, 8)), BackendStatus::Ok);
    let BackendStatus::Fatal(reason) = encoder.encode(&rgba(16, 8)) else {
        panic!("shape change accepted");
    };
    assert!(reason.contains("reset required"));
}

#[test]
fn reset_forgets_the_first_frame() {
    let r = rig();
    assert_eq!(r.encoder.encode(&rgba(8, 8)), BackendStatus::Ok);
    assert!(r.encoder.configured_shape().is_some());
    r.encoder.reset().unwrap();
    assert_eq!(r.encoder.phase(), Phase::Opened);
    assert!(r.encoder.configured_shape().is_none());
    assert_eq!(r.encoder.frames_submitted(), 0);
    assert_eq!(r.encoder.encode(&rgba(16, 8)), BackendStatus::Ok);
}

#[test]
fn unsupported_codec_fails_open() {
    let mut config = PipelineConfig::default();
    config.encoder.codec = CodecId::Vp9;
    let graph = PadGraph::new();
    let encoder = Encoder::new(graph, Arc::new(BackendRegistry::mock()), &config);
    encoder.init().unwrap();
    assert_eq!(encoder.open().unwrap_err().code(), 200);
    assert_eq!(encoder.phase(), Phase::Initialized);
    encoder.close().unwrap();
}

#[test]
fn stop_while_paused_discards_queued_frames() {
    let r = rig();
    r.encoder.start().unwrap();
    r.encoder.pause(true).unwrap();
    for _ in 0..6 {
        r.graph.produce(r.source, Message::data_frame(rgba(8, 8)));
    }
    assert_eq!(r.encoder.queued(), 6);
    let started = Instant::now();
    r.encoder.stop().unwrap();
    assert!(started.elapsed() < WAIT);
    assert_eq!(r.encoder.queued(), 0);
    assert!(packets(&r.recorder).is_empty());
    let actions = r.recorder.actions();
    assert_eq!(&actions[actions.len() - 2..], &[Action::Stop, Action::Cleanup]);
    assert_eq!(r.encoder.phase(), Phase::Stopped);
}
