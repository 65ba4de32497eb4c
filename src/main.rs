use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use av_bus::bus::BindingFactory;
use av_bus::clock::{PresentQueue, RenderClock};
use av_bus::{BackendRegistry, Bus, OutputEvent, OutputKind, OutputStream, PipelineConfig};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

const LOOKAHEAD: usize = 3;

fn init_logging() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .filter_module("av_bus", log::LevelFilter::Debug)
        .init();
}

/// Reads the pipeline settings from the JSON file named on the command line,
/// or falls back to the synthetic defaults.
fn load_config() -> anyhow::Result<PipelineConfig> {
    let config = match std::env::args().nth(1) {
        Some(path) => PipelineConfig::from_json_file(&path)
            .with_context(|| format!("loading config {path}"))?,
        None => PipelineConfig::default(),
    };
    config.validate().context("invalid config")?;
    Ok(config)
}

/// Synthetic sources run on the mock codecs; anything else gets the real
/// backends only.
fn registry_for(config: &PipelineConfig) -> BackendRegistry {
    if config.demuxer.source == "synthetic" {
        log::warn!("synthetic source, decoding on mock codecs");
        BackendRegistry::mock()
    } else {
        BackendRegistry::with_defaults()
    }
}

#[cfg(feature = "ffmpeg")]
fn gpu_for(config: &PipelineConfig) -> BindingFactory {
    if config.demuxer.source == "synthetic" {
        Arc::new(av_bus::mock::software_binding)
    } else {
        Arc::new(av_bus::ffmpeg::gpu_binding)
    }
}

#[cfg(not(feature = "ffmpeg"))]
fn gpu_for(_config: &PipelineConfig) -> BindingFactory {
    Arc::new(av_bus::mock::software_binding)
}

/// Paces framebuffers against a render clock until the stream ends.
async fn present(mut frames: OutputStream, cancel: CancellationToken) -> anyhow::Result<()> {
    let clock = RenderClock::new();
    let mut queue = PresentQueue::new(LOOKAHEAD);
    let mut ended = false;
    clock.start();
    loop {
        if let Some(fb) = queue.poll(&clock) {
            log::debug!(
                "present {}x{} ts={} at {}",
                fb.framebuffer.width,
                fb.framebuffer.height,
                fb.timestamp,
                clock.timestamp()
            );
        }
        if ended && queue.is_empty() {
            break;
        }
        let wait = queue.next_due(&clock).unwrap_or(Duration::from_millis(5));
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = frames.next(), if !ended && !queue.is_full() => match event {
                Some(OutputEvent::Framebuffer(fb)) => {
                    if let Err(fb) = queue.push(fb) {
                        log::warn!("lookahead full, frame {} dropped", fb.timestamp);
                    }
                }
                Some(OutputEvent::Failed { component, error }) => {
                    anyhow::bail!("{component} failed: {error}");
                }
                Some(OutputEvent::EndOfStream) | None => ended = true,
                Some(OutputEvent::Packet(_)) => {}
            },
            _ = tokio::time::sleep(wait) => {}
        }
    }
    log::info!(
        "presented {} frames, {} dropped late",
        queue.presented(),
        queue.dropped()
    );
    Ok(())
}

async fn count_packets(mut packets: OutputStream, cancel: CancellationToken) -> anyhow::Result<()> {
    let (mut count, mut bytes) = (0u64, 0u64);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = packets.next() => match event {
                Some(OutputEvent::Packet(p)) => {
                    count += 1;
                    bytes += p.size() as u64;
                }
                Some(OutputEvent::Failed { component, error }) => {
                    anyhow::bail!("{component} failed: {error}");
                }
                Some(OutputEvent::EndOfStream) | None => break,
                Some(OutputEvent::Framebuffer(_)) => {}
            },
        }
    }
    log::info!("encoded {count} packets, {bytes} bytes");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let config = load_config()?;
    let registry = Arc::new(registry_for(&config));
    log::debug!("{registry:?}");

    let bus = Bus::with_gpu("main", registry, config.clone(), gpu_for(&config));
    for stream in bus.add_input(config.demuxer.url()).await? {
        log::info!("input {stream}");
    }
    let frames = if config.mapper.enabled {
        Some(bus.add_output(OutputKind::Frames).await?)
    } else {
        None
    };
    let packets = bus.add_output(OutputKind::Encoded).await?;
    bus.start().await?;

    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("interrupted");
            cancel_clone.cancel();
        }
    });

    let presenter = frames.map(|f| tokio::spawn(present(f, cancel.clone())));
    let encoded = count_packets(packets, cancel.clone()).await;
    let presented = match presenter {
        Some(task) => task.await.context("presenter task")?,
        None => Ok(()),
    };

    bus.close().await?;
    encoded?;
    presented
}
