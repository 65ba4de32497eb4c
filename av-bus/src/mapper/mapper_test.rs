use std::time::Duration;

use super::*;
use crate::frame::CpuPlane;
use crate::hw::{FramesPoolConfig, HwDeviceContext, HwDeviceType, HwFramesContext};
use crate::mock::{ExporterStats, MessageRecorder, MockExporter, MockSurfaceData, synthetic_nv12};

const WAIT: Duration = Duration::from_secs(5);

struct Rig {
    graph: Arc<PadGraph>,
    source: PadId,
    mapper: FrameMapper,
    recorder: Arc<MessageRecorder>,
    heap: DmaBufHeap,
    stats: Arc<ExporterStats>,
    fail_export: Arc<AtomicBool>,
    pool: HwFramesContext,
}

fn rig_with(config: PipelineConfig) -> Rig {
    let heap = DmaBufHeap::new();
    let exporter = MockExporter::new(heap.clone());
    let stats = exporter.stats();
    let fail_export = exporter.export_failure();
    let binding = GpuBinding::new(
        ContextToken::new(Box::new(SoftwareGpu::new(heap.clone()))),
        Box::new(exporter),
    );

    let graph = PadGraph::new();
    let mapper = FrameMapper::new(graph.clone(), binding, &config);
    mapper.init().unwrap();
    let source = graph.create_output_pad("decoder", None);
    graph.connect(source, mapper.frame_input().unwrap()).unwrap();
    let recorder = MessageRecorder::new();
    let consumer: Arc<dyn MessageConsumer> = recorder.clone();
    let sink = graph.create_input_pad("sink", None, Arc::downgrade(&consumer));
    graph.connect(mapper.framebuffer_output().unwrap(), sink).unwrap();
    mapper.open().unwrap();

    let device = HwDeviceContext::new(HwDeviceType::Mock);
    let pool = HwFramesContext::new(
        &device,
        FramesPoolConfig {
            sw_format: PixelFormat::Nv12,
            width: 16,
            height: 8,
            pool_size: 8,
        },
    )
    .unwrap();
    Rig {
        graph,
        source,
        mapper,
        recorder,
        heap,
        stats,
        fail_export,
        pool,
    }
}

fn rig() -> Rig {
    rig_with(PipelineConfig::default())
}

fn hw_frame(pool: &HwFramesContext, n: u32) -> Frame {
    let c = pool.config();
    let surface = pool
        .acquire_with(Arc::new(MockSurfaceData {
            nv12: synthetic_nv12(c.width, c.height, n),
            frame_number: n,
        }))
        .unwrap();
    Frame::video_hw(surface).with_pts(Some(n as i64 * 33_333))
}

fn cpu_frame(width: u32, height: u32, n: u32) -> Frame {
    let nv12 = synthetic_nv12(width, height, n);
    let luma = (width * height) as usize;
    Frame::video_cpu(
        PixelFormat::Nv12,
        width,
        height,
        vec![
            CpuPlane::new(nv12.slice(..luma), width as usize),
            CpuPlane::new(nv12.slice(luma..), width as usize),
        ],
    )
    .with_pts(Some(n as i64 * 33_333))
}

fn framebuffers(recorder: &MessageRecorder) -> Vec<TimedFramebuffer> {
    recorder
        .messages()
        .into_iter()
        .filter_map(|(_, m)| m.into_framebuffer())
        .collect()
}

#[test]
fn hardware_frames_map_without_copy() {
    let r = rig();
    r.mapper.start().unwrap();
    for n in 0..5 {
        r.graph.produce(r.source, Message::data_frame(hw_frame(&r.pool, n)));
    }
    r.graph.produce(r.source, Message::stop(true));
    assert!(r.recorder.wait_for(Action::Stop, 1, WAIT));

    let out = framebuffers(&r.recorder);
    let ts: Vec<i64> = out.iter().map(|f| f.timestamp).collect();
    assert_eq!(ts, vec![0, 33_333, 66_666, 99_999, 133_332]);
    assert!(out.iter().all(|f| f.zero_copy));
    assert!(out.iter().all(|f| (f.framebuffer.width, f.framebuffer.height) == (16, 8)));

    let stats = r.mapper.stats();
    assert_eq!(stats.total_frames, 5);
    assert_eq!(stats.zero_copy_frames, 5);
    assert_eq!(stats.zero_copy_percentage(), 100.0);
    // Every exported descriptor was closed after binding.
    assert_eq!(r.heap.total_allocated(), 5);
    assert_eq!(r.heap.open_count(), 0);
    // No import without a sync first.
    assert_eq!(r.stats.syncs.load(Ordering::Relaxed), 5);
    assert_eq!(r.stats.exports.load(Ordering::Relaxed), 5);

    let actions = r.recorder.actions();
    let init = actions.iter().position(|a| *a == Action::Init).unwrap();
    let data = actions.iter().position(|a| *a == Action::Data).unwrap();
    assert!(init < data);
    let params = r.graph.params(r.mapper.framebuffer_output().unwrap()).unwrap();
    assert_eq!(params.as_video().unwrap().format, PixelFormat::Rgba);
    assert_eq!(*actions.last().unwrap(), Action::Stop);
}

#[test]
fn failed_export_falls_back_without_loss() {
    let r = rig();
    r.fail_export.store(true, Ordering::Relaxed);
    r.mapper.start().unwrap();
    for n in 0..6 {
        r.graph.produce(r.source, Message::data_frame(hw_frame(&r.pool, n)));
    }
    r.graph.produce(r.source, Message::stop(true));
    assert!(r.recorder.wait_for(Action::Stop, 1, WAIT));

    let out = framebuffers(&r.recorder);
    assert_eq!(out.len(), 6);
    assert!(out.iter().all(|f| !f.zero_copy));
    assert!(out.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    let stats = r.mapper.stats();
    assert_eq!(stats.fallback_frames, 6);
    assert_eq!(stats.zero_copy_percentage(), 0.0);
    assert_eq!(r.stats.failed_exports.load(Ordering::Relaxed), 6);
    assert_eq!(r.stats.downloads.load(Ordering::Relaxed), 6);
    assert_eq!(r.heap.open_count(), 0);

    let expected = convert::frame_to_rgba(&cpu_frame(16, 8, 3)).unwrap();
    assert_eq!(out[3].framebuffer.contents.as_deref(), Some(&expected[..]));
}

#[test]
fn both_paths_render_the_same_picture() {
    let r = rig();
    r.mapper.start().unwrap();
    r.graph.produce(r.source, Message::data_frame(hw_frame(&r.pool, 7)));
    assert!(r.recorder.wait_for(Action::Data, 1, WAIT));
    r.fail_export.store(true, Ordering::Relaxed);
    r.graph.produce(r.source, Message::data_frame(hw_frame(&r.pool, 7)));
    assert!(r.recorder.wait_for(Action::Data, 2, WAIT));

    let out = framebuffers(&r.recorder);
    assert!(out[0].zero_copy);
    assert!(!out[1].zero_copy);
    assert_eq!(out[0].framebuffer.contents, out[1].framebuffer.contents);
    r.mapper.stop().unwrap();
}

#[test]
fn forced_fallback_never_touches_the_exporter() {
    let mut config = PipelineConfig::default();
    config.mapper.force_fallback = true;
    let r = rig_with(config);
    r.mapper.start().unwrap();
    for n in 0..3 {
        r.graph.produce(r.source, Message::data_frame(hw_frame(&r.pool, n)));
    }
    r.graph.produce(r.source, Message::stop(true));
    assert!(r.recorder.wait_for(Action::Stop, 1, WAIT));
    assert_eq!(framebuffers(&r.recorder).len(), 3);
    assert_eq!(r.stats.syncs.load(Ordering::Relaxed), 0);
    assert_eq!(r.stats.downloads.load(Ordering::Relaxed), 3);
}

#[test]
fn cpu_frames_are_uploaded() {
    let r = rig();
    r.mapper.start().unwrap();
    for n in 0..2 {
        r.graph.produce(r.source, Message::data_frame(cpu_frame(8, 4, n)));
    }
    assert!(r.recorder.wait_for(Action::Data, 2, WAIT));
    let out = framebuffers(&r.recorder);
    assert!(out.iter().all(|f| !f.zero_copy));
    let expected = convert::frame_to_rgba(&cpu_frame(8, 4, 1)).unwrap();
    assert_eq!(out[1].framebuffer.contents.as_deref(), Some(&expected[..]));
    assert_eq!(r.stats.downloads.load(Ordering::Relaxed), 0);
    r.mapper.stop().unwrap();
}

#[test]
fn new_frame_shape_reallocates_and_reannounces() {
    let r = rig();
    r.mapper.start().unwrap();
    r.graph.produce(r.source, Message::data_frame(cpu_frame(8, 4, 0)));
    r.graph.produce(r.source, Message::data_frame(hw_frame(&r.pool, 1)));
    assert!(r.recorder.wait_for(Action::Data, 2, WAIT));

    let inits: Vec<(u32, u32)> = r
        .recorder
        .messages()
        .iter()
        .filter_map(|(_, m)| m.params().and_then(|p| p.as_video()))
        .map(|v| (v.width, v.height))
        .collect();
    assert_eq!(inits, vec![(8, 4), (16, 8)]);
    let out = framebuffers(&r.recorder);
    assert_eq!((out[1].framebuffer.width, out[1].framebuffer.height), (16, 8));
    assert!(out[1].zero_copy);
    r.mapper.stop().unwrap();
}

#[test]
fn end_of_stream_is_reported_after_the_last_frame() {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let r = rig();
    let mapper = r.mapper.with_events(tx);
    mapper.start().unwrap();
    r.graph.produce(r.source, Message::data_frame(hw_frame(&r.pool, 0)));
    r.graph.produce(r.source, Message::stop(true));
    assert!(r.recorder.wait_for(Action::Stop, 1, WAIT));
    mapper.stop().unwrap();
    assert_eq!(
        rx.try_recv().unwrap(),
        ComponentEvent::EndOfStream {
            component: "mapper".to_string()
        }
    );
    let actions = r.recorder.actions();
    let data = actions.iter().rposition(|a| *a == Action::Data).unwrap();
    let stop = actions.iter().position(|a| *a == Action::Stop).unwrap();
    assert!(data < stop);
    assert_eq!(r.recorder.count(Action::Stop), 1);
    assert_eq!(*actions.last().unwrap(), Action::Cleanup);
}

#[test]
fn reset_keeps_the_context_and_pads() {
    let r = rig();
    let (input, output) = (r.mapper.frame_input(), r.mapper.framebuffer_output());
    r.mapper.start().unwrap();
    r.graph.produce(r.source, Message::data_frame(hw_frame(&r.pool, 0)));
    assert!(r.recorder.wait_for(Action::Data, 1, WAIT));

    r.mapper.reset().unwrap();
    assert_eq!(r.mapper.phase(), Phase::Running);
    assert_eq!(r.mapper.frame_input(), input);
    assert_eq!(r.mapper.framebuffer_output(), output);
    r.graph.produce(r.source, Message::data_frame(hw_frame(&r.pool, 1)));
    assert!(r.recorder.wait_for(Action::Data, 2, WAIT));
    r.mapper.stop().unwrap();
    r.mapper.close().unwrap();
    assert_eq!(r.mapper.phase(), Phase::Closed);
}

#[test]
fn paused_mapper_withholds_frames() {
    let r = rig();
    r.mapper.start().unwrap();
    r.mapper.pause(true).unwrap();
    for n in 0..3 {
        r.graph.produce(r.source, Message::data_frame(hw_frame(&r.pool, n)));
    }
    std::thread::sleep(Duration::from_millis(30));
    assert!(framebuffers(&r.recorder).is_empty());
    assert_eq!(r.mapper.queued(), 3);
    r.mapper.pause(false).unwrap();
    assert!(r.recorder.wait_for(Action::Data, 3, WAIT));
    r.mapper.stop().unwrap();
}

#[test]
fn zero_copy_percentage_of_mixed_runs() {
    let stats = MapperStats {
        total_frames: 4,
        zero_copy_frames: 3,
        fallback_frames: 1,
    };
    assert_eq!(stats.zero_copy_percentage(), 75.0);
    assert_eq!(MapperStats::default().zero_copy_percentage(), 0.0);
}

#[test]
fn nv12_surfaces_use_two_textures() {
    assert_eq!(zero_copy_variant(PixelFormat::Nv12), Some(ShaderVariant::Nv12));
    assert_eq!(zero_copy_variant(PixelFormat::Rgba), Some(ShaderVariant::Packed));
    assert_eq!(zero_copy_variant(PixelFormat::P010), None);
    let layout = plane_layout(ShaderVariant::Nv12, 6, 4);
    assert_eq!(
        layout,
        vec![(TextureFormat::R8, 6, 4), (TextureFormat::Rg8, 3, 2)]
    );
}
