use std::sync::Arc;
use std::time::Duration;

use av_bus::component::{
    Component, FrameConsumer, FrameProducer, FramebufferProducer, PacketConsumer, PacketProducer,
    Phase, link,
};
use av_bus::decoder::Decoder;
use av_bus::demuxer::Demuxer;
use av_bus::encoder::Encoder;
use av_bus::mapper::{ContextToken, DmaBufHeap, FrameMapper, GpuBinding, SoftwareGpu};
use av_bus::message::{Action, Message, keys};
use av_bus::mock::{MessageRecorder, MockExporter};
use av_bus::pad::{MessageConsumer, PadGraph, PadId};
use av_bus::{BackendRegistry, Bus, OutputEvent, OutputKind, PipelineConfig};
use futures::StreamExt;

const WAIT: Duration = Duration::from_secs(10);

fn sink(graph: &PadGraph, recorder: &Arc<MessageRecorder>, output: Option<PadId>) -> PadId {
    let consumer: Arc<dyn MessageConsumer> = recorder.clone();
    let input = graph.create_input_pad("sink", None, Arc::downgrade(&consumer));
    link(graph, output, Some(input)).unwrap();
    input
}

fn actions(messages: &[Message]) -> Vec<Action> {
    messages.iter().map(|m| m.action()).collect()
}

fn on_pad(recorder: &MessageRecorder, pad: PadId) -> Vec<Message> {
    recorder
        .messages()
        .into_iter()
        .filter(|(p, _)| *p == pad)
        .map(|(_, m)| m)
        .collect()
}

#[test]
fn decode_map_and_encode_every_frame() {
    let _ = env_logger::builder().is_test(true).try_init();
    let graph = PadGraph::new();
    let registry = Arc::new(BackendRegistry::mock());
    let config = PipelineConfig::default();

    let demuxer = Demuxer::new(
        graph.clone(),
        registry.clone(),
        "synthetic://e2e?packets=30&audio=true",
    );
    demuxer.init().unwrap();
    let video = demuxer
        .streams()
        .into_iter()
        .find(|s| s.is_video())
        .unwrap();

    let decoder = Decoder::new(graph.clone(), registry.clone(), &config);
    decoder.init().unwrap();
    link(&graph, demuxer.packet_output(video.index()), decoder.packet_input()).unwrap();
    decoder.set_stream(video.clone());

    let mapper = FrameMapper::new(graph.clone(), av_bus::mock::software_binding(), &config);
    mapper.init().unwrap();
    link(&graph, decoder.frame_output(), mapper.frame_input()).unwrap();

    let encoder = Encoder::new(graph.clone(), registry.clone(), &config);
    encoder.init().unwrap();
    link(&graph, decoder.frame_output(), encoder.frame_input()).unwrap();

    let recorder = MessageRecorder::new();
    let screen = sink(&graph, &recorder, mapper.framebuffer_output());
    let muxer = sink(&graph, &recorder, encoder.packet_output(0));

    let stages: [&dyn Component; 4] = [&demuxer, &decoder, &mapper, &encoder];
    for c in stages {
        c.open().unwrap();
    }
    for c in stages.iter().rev() {
        c.start().unwrap();
    }
    assert!(recorder.wait_for(Action::Stop, 2, WAIT));

    let shown = on_pad(&recorder, screen);
    let fbs: Vec<_> = shown.iter().filter_map(|m| m.framebuffer()).collect();
    assert_eq!(fbs.len(), 30);
    assert!(fbs.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    assert!(fbs.iter().all(|f| f.zero_copy));
    let seen = actions(&shown);
    let init = seen.iter().position(|a| *a == Action::Init).unwrap();
    let data = seen.iter().position(|a| *a == Action::Data).unwrap();
    assert!(init < data);
    assert_eq!(seen.iter().filter(|a| **a == Action::Init).count(), 1);

    let encoded = on_pad(&recorder, muxer);
    let packets: Vec<_> = encoded.iter().filter_map(|m| m.packet()).collect();
    assert_eq!(packets.len(), 30);
    assert!(packets[0].is_key());
    for p in &packets {
        assert!(p.dts().unwrap() <= p.pts().unwrap());
    }
    let stop = encoded.iter().find(|m| m.action() == Action::Stop).unwrap();
    assert!(stop.flag(keys::EOS));

    for c in stages {
        c.stop().unwrap();
        assert_eq!(c.phase(), Phase::Stopped);
    }
    for c in stages {
        c.close().unwrap();
    }
}

#[tokio::test]
async fn failed_exports_still_deliver_every_frame() -> anyhow::Result<()> {
    let factory = Arc::new(|| {
        let heap = DmaBufHeap::new();
        let exporter = MockExporter::new(heap.clone());
        exporter
            .export_failure()
            .store(true, std::sync::atomic::Ordering::Relaxed);
        GpuBinding::new(
            ContextToken::new(Box::new(SoftwareGpu::new(heap))),
            Box::new(exporter),
        )
    });
    let bus = Bus::with_gpu(
        "fallback",
        Arc::new(BackendRegistry::mock()),
        PipelineConfig::default(),
        factory,
    );
    bus.add_input("synthetic://e2e?packets=20&audio=false").await?;
    let mut frames = bus.add_output(OutputKind::Frames).await?;
    bus.start().await?;

    let mut count = 0;
    tokio::time::timeout(WAIT, async {
        while let Some(event) = frames.next().await {
            match event {
                OutputEvent::Framebuffer(fb) => {
                    assert!(!fb.zero_copy);
                    assert!(fb.framebuffer.contents.is_some());
                    count += 1;
                }
                OutputEvent::EndOfStream => break,
                OutputEvent::Failed { component, error } => panic!("{component}: {error}"),
                OutputEvent::Packet(_) => {}
            }
        }
    })
    .await?;
    assert_eq!(count, 20);
    bus.close().await?;
    Ok(())
}

#[tokio::test]
async fn opened_input_closes_without_running() -> anyhow::Result<()> {
    let bus = Bus::new(
        "idle",
        Arc::new(BackendRegistry::mock()),
        PipelineConfig::default(),
    );
    let streams = bus.add_input("synthetic://e2e?packets=5&audio=true").await?;
    assert_eq!(streams.len(), 2);
    assert_eq!(bus.phases().await?.len(), 1);
    bus.close().await?;
    assert!(bus.phases().await?.is_empty());
    Ok(())
}
