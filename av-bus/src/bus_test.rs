use std::time::Duration;

use futures::StreamExt;

use super::*;
use crate::mock::{MockDecoderBackend, MockDecoderConfig};
use crate::registry::{DecoderDescriptor, Platform};
use crate::stream::CodecId;

const WAIT: Duration = Duration::from_secs(10);
const CLIP: &str = "synthetic://clip?packets=12&audio=true";

fn mock_bus(config: PipelineConfig) -> Bus {
    Bus::new("test", Arc::new(BackendRegistry::mock()), config)
}

/// Events up to, not including, end of stream.
async fn until_end(stream: &mut OutputStream) -> Vec<OutputEvent> {
    let mut out = Vec::new();
    tokio::time::timeout(WAIT, async {
        while let Some(event) = stream.next().await {
            if matches!(event, OutputEvent::EndOfStream) {
                return;
            }
            out.push(event);
        }
        panic!("stream ended without end of stream");
    })
    .await
    .expect("end of stream");
    out
}

fn framebuffers(events: &[OutputEvent]) -> Vec<&TimedFramebuffer> {
    events
        .iter()
        .filter_map(|e| match e {
            OutputEvent::Framebuffer(fb) => Some(fb),
            _ => None,
        })
        .collect()
}

fn packets(events: &[OutputEvent]) -> Vec<&Packet> {
    events
        .iter()
        .filter_map(|e| match e {
            OutputEvent::Packet(p) => Some(p),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn frames_output_maps_every_video_packet() -> anyhow::Result<()> {
    let bus = mock_bus(PipelineConfig::default());
    let streams = bus.add_input(CLIP).await?;
    assert_eq!(streams.len(), 2);

    let mut frames = bus.add_output(OutputKind::Frames).await?;
    bus.start().await?;
    let events = until_end(&mut frames).await;

    let fbs = framebuffers(&events);
    assert_eq!(fbs.len(), 12);
    assert_eq!(fbs[0].timestamp, 0);
    assert!(fbs.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    assert!(fbs.iter().all(|f| f.zero_copy));

    bus.close().await?;
    assert!(bus.phases().await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn encoded_output_yields_one_packet_per_frame() -> anyhow::Result<()> {
    let bus = mock_bus(PipelineConfig::default());
    bus.add_input(CLIP).await?;
    let mut encoded = bus.add_output(OutputKind::Encoded).await?;
    bus.start().await?;

    let events = until_end(&mut encoded).await;
    let pkts = packets(&events);
    assert_eq!(pkts.len(), 12);
    for p in &pkts {
        let (pts, dts) = (p.pts().unwrap(), p.dts().unwrap());
        assert!(dts <= pts, "dts {dts} after pts {pts}");
    }
    assert!(pkts[0].is_key());
    Ok(())
}

#[tokio::test]
async fn both_outputs_share_one_decoder() -> anyhow::Result<()> {
    let bus = mock_bus(PipelineConfig::default());
    bus.add_input(CLIP).await?;
    let mut frames = bus.add_output(OutputKind::Frames).await?;
    let mut encoded = bus.add_output(OutputKind::Encoded).await?;
    let mut frames_again = bus.add_output(OutputKind::Frames).await?;

    let phases = bus.phases().await?;
    let refs: Vec<ComponentRef> = phases.iter().map(|(r, _)| *r).collect();
    assert_eq!(refs, ComponentRef::ALL.to_vec());
    assert!(phases.iter().all(|(_, p)| *p == Phase::Opened));

    bus.start().await?;
    assert_eq!(framebuffers(&until_end(&mut frames).await).len(), 12);
    assert_eq!(framebuffers(&until_end(&mut frames_again).await).len(), 12);
    assert_eq!(packets(&until_end(&mut encoded).await).len(), 12);
    Ok(())
}

#[tokio::test]
async fn graph_is_assembled_in_order() {
    let bus = mock_bus(PipelineConfig::default());
    assert!(bus.add_output(OutputKind::Frames).await.is_err());
    assert!(bus.start().await.is_err());

    bus.add_input(CLIP).await.unwrap();
    assert!(bus.add_input(CLIP).await.is_err());
    assert!(bus.start().await.is_err());

    let _frames = bus.add_output(OutputKind::Frames).await.unwrap();
    bus.start().await.unwrap();
    assert!(bus.add_output(OutputKind::Encoded).await.is_err());
    bus.stop().await.unwrap();
}

#[tokio::test]
async fn missing_input_is_reported() {
    let bus = mock_bus(PipelineConfig::default());
    let err = bus.add_input("/no/such/file.mp4").await.unwrap_err();
    assert!(format!("{err:#}").contains("/no/such/file.mp4"));
    assert!(bus.phases().await.unwrap().is_empty());
}

#[tokio::test]
async fn disabled_mapper_refuses_frame_outputs() -> anyhow::Result<()> {
    let mut config = PipelineConfig::default();
    config.mapper.enabled = false;
    let bus = mock_bus(config);
    bus.add_input(CLIP).await?;
    assert!(bus.add_output(OutputKind::Frames).await.is_err());
    let mut encoded = bus.add_output(OutputKind::Encoded).await?;
    bus.start().await?;
    assert_eq!(packets(&until_end(&mut encoded).await).len(), 12);
    Ok(())
}

#[tokio::test]
async fn pause_and_resume_lose_nothing() -> anyhow::Result<()> {
    let bus = mock_bus(PipelineConfig::default());
    bus.add_input("synthetic://clip?packets=120&audio=false").await?;
    let mut frames = bus.add_output(OutputKind::Frames).await?;
    bus.start().await?;
    bus.pause(true).await?;
    assert!(
        bus.phases()
            .await?
            .iter()
            .all(|(_, p)| *p == Phase::Paused)
    );
    tokio::time::sleep(Duration::from_millis(20)).await;
    bus.pause(false).await?;

    let fbs = until_end(&mut frames).await;
    assert_eq!(framebuffers(&fbs).len(), 120);
    Ok(())
}

#[tokio::test]
async fn slow_subscriber_receives_every_framebuffer() -> anyhow::Result<()> {
    let bus = mock_bus(PipelineConfig::default());
    bus.add_input("synthetic://clip?packets=300&audio=false").await?;
    let mut frames = bus.add_output(OutputKind::Frames).await?;
    bus.start().await?;

    let mut received = 0;
    tokio::time::timeout(WAIT, async {
        while let Some(event) = frames.next().await {
            match event {
                OutputEvent::Framebuffer(_) => received += 1,
                OutputEvent::EndOfStream => break,
                other => panic!("unexpected {other:?}"),
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await?;
    assert_eq!(received, 300);
    bus.close().await?;
    Ok(())
}

#[tokio::test]
async fn reset_reopens_a_single_component() -> anyhow::Result<()> {
    let bus = mock_bus(PipelineConfig::default());
    bus.add_input(CLIP).await?;
    let mut frames = bus.add_output(OutputKind::Frames).await?;
    bus.reset(ComponentRef::Decoder).await?;
    bus.reset(ComponentRef::Decoder).await?;
    assert!(bus.reset(ComponentRef::Encoder).await.is_err());

    bus.start().await?;
    assert_eq!(framebuffers(&until_end(&mut frames).await).len(), 12);
    Ok(())
}

#[tokio::test]
async fn close_ends_output_streams() -> anyhow::Result<()> {
    let bus = mock_bus(PipelineConfig::default());
    bus.add_input("synthetic://clip?packets=100000&audio=false").await?;
    let mut frames = bus.add_output(OutputKind::Frames).await?;
    bus.start().await?;
    bus.close().await?;

    let ended = tokio::time::timeout(WAIT, async {
        while frames.next().await.is_some() {}
    })
    .await;
    assert!(ended.is_ok());
    Ok(())
}

#[tokio::test]
async fn failed_component_is_stopped_and_reported() -> anyhow::Result<()> {
    let mut registry = BackendRegistry::new();
    registry.register_decoder(DecoderDescriptor {
        name: "flaky",
        platform: Platform::Any,
        codecs: &[CodecId::H264],
        formats: &[],
        construct: Arc::new(|| {
            Box::new(MockDecoderBackend::new(MockDecoderConfig {
                fail_after: Some(3),
                hw: false,
                ..Default::default()
            }))
        }),
    });
    mock::register(&mut registry);
    let bus = Bus::new("flaky", Arc::new(registry), PipelineConfig::default());
    bus.add_input("synthetic://clip?packets=50&audio=false").await?;
    let mut frames = bus.add_output(OutputKind::Frames).await?;
    bus.start().await?;

    let failure = tokio::time::timeout(WAIT, async {
        while let Some(event) = frames.next().await {
            if let OutputEvent::Failed { component, error } = event {
                return Some((component, error));
            }
        }
        None
    })
    .await?;
    let (component, error) = failure.expect("failure event");
    assert_eq!(component, "decoder");
    assert!(error.contains("device lost"));

    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let phases = bus.phases().await?;
        if phases.contains(&(ComponentRef::Decoder, Phase::Stopped)) {
            assert!(phases.contains(&(ComponentRef::Mapper, Phase::Running)));
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "decoder never stopped");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    Ok(())
}

#[tokio::test]
async fn dropping_the_bus_shuts_it_down() -> anyhow::Result<()> {
    let bus = mock_bus(PipelineConfig::default());
    bus.add_input("synthetic://clip?packets=100000&audio=false").await?;
    let mut frames = bus.add_output(OutputKind::Frames).await?;
    bus.start().await?;
    drop(bus);

    let ended = tokio::time::timeout(WAIT, async {
        while frames.next().await.is_some() {}
    })
    .await;
    assert!(ended.is_ok());
    Ok(())
}
