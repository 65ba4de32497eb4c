//! Async façade over one pipeline graph.
//!
//! A bus owns a demuxer, one decoder for the first video stream and the
//! stages subscribed to it. All graph mutation happens on the bus task;
//! callers talk to it through commands and get outputs back as streams.

use std::pin::Pin;
use std::sync::Arc;

use anyhow::{Context, anyhow, bail};
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::component::{
    Component, ComponentEvent, EventReceiver, EventSender, FrameConsumer, FrameProducer,
    FramebufferProducer, PacketConsumer, PacketProducer, Phase, link,
};
use crate::config::PipelineConfig;
use crate::decoder::Decoder;
use crate::demuxer::Demuxer;
use crate::encoder::Encoder;
use crate::mapper::{FrameMapper, GpuBinding, TimedFramebuffer};
use crate::message::{Action, Message, keys};
use crate::mock;
use crate::packet::Packet;
use crate::pad::{MessageConsumer, PadGraph, PadId};
use crate::registry::BackendRegistry;
use crate::stream::StreamDescriptor;

/// Events buffered per subscriber before the producing stage waits on it.
const OUTPUT_CAPACITY: usize = 64;

/// Builds the rendering context for a new frame mapper.
pub type BindingFactory = Arc<dyn Fn() -> GpuBinding + Send + Sync>;

#[derive(Clone, Debug)]
pub enum OutputEvent {
    Framebuffer(TimedFramebuffer),
    Packet(Packet),
    EndOfStream,
    /// A stage feeding this output failed; nothing more will arrive.
    Failed { component: String, error: String },
}

pub type OutputStream = Pin<Box<dyn Stream<Item = OutputEvent> + Send>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OutputKind {
    /// Presentable framebuffers from the frame mapper.
    Frames,
    /// Compressed packets from the encoder.
    Encoded,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ComponentRef {
    Demuxer,
    Decoder,
    Mapper,
    Encoder,
}

impl ComponentRef {
    /// Data-flow order.
    pub const ALL: [ComponentRef; 4] = [
        ComponentRef::Demuxer,
        ComponentRef::Decoder,
        ComponentRef::Mapper,
        ComponentRef::Encoder,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Demuxer => "demuxer",
            Self::Decoder => "decoder",
            Self::Mapper => "mapper",
            Self::Encoder => "encoder",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|r| r.name() == name)
    }
}

type Reply<T> = oneshot::Sender<anyhow::Result<T>>;

pub enum BusCommand {
    AddInput {
        url: String,
        result: Reply<Vec<StreamDescriptor>>,
    },
    AddOutput {
        kind: OutputKind,
        result: Reply<OutputStream>,
    },
    Start {
        result: Reply<()>,
    },
    Pause {
        paused: bool,
        result: Reply<()>,
    },
    Reset {
        component: ComponentRef,
        result: Reply<()>,
    },
    Stop {
        result: Reply<()>,
    },
    Close {
        result: Reply<()>,
    },
    Phases {
        result: Reply<Vec<(ComponentRef, Phase)>>,
    },
}

pub struct Bus {
    id: String,
    cancel: CancellationToken,
    tx: mpsc::Sender<BusCommand>,
}

impl Bus {
    /// Bus rendering through the headless software GPU.
    pub fn new(id: &str, registry: Arc<BackendRegistry>, config: PipelineConfig) -> Self {
        Self::with_gpu(id, registry, config, Arc::new(mock::software_binding))
    }

    pub fn with_gpu(
        id: &str,
        registry: Arc<BackendRegistry>,
        config: PipelineConfig,
        gpu: BindingFactory,
    ) -> Self {
        let id = id.to_string();
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(64);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let state = BusState {
            id: id.clone(),
            graph: PadGraph::new(),
            registry,
            config,
            gpu,
            events: events_tx,
            demuxer: None,
            decoder: None,
            mapper: None,
            encoder: None,
            video: None,
            frames_tap: None,
            packets_tap: None,
        };

        let cancel_clone = cancel.clone();
        tokio::spawn(async move { Self::inner_loop(cancel_clone, rx, events_rx, state).await });
        Self { id, cancel, tx }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    async fn inner_loop(
        cancel: CancellationToken,
        mut rx: mpsc::Receiver<BusCommand>,
        mut events: EventReceiver,
        mut state: BusState,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                cmd = rx.recv() => match cmd {
                    Some(cmd) => {
                        if let Err(e) = Self::inner_command_handler(&mut state, cmd).await {
                            log::error!("bus {}: {e:#}", state.id);
                        }
                    }
                    None => break,
                },
                Some(event) = events.recv() => state.on_event(event).await,
            }
        }
        if let Err(e) = state.close().await {
            log::warn!("bus {} shutdown: {e:#}", state.id);
        }
        log::info!("bus {} finished", state.id);
    }

    async fn inner_command_handler(state: &mut BusState, cmd: BusCommand) -> anyhow::Result<()> {
        let sent = match cmd {
            BusCommand::AddInput { url, result } => result.send(state.add_input(url).await).is_ok(),
            BusCommand::AddOutput { kind, result } => {
                result.send(state.add_output(kind).await).is_ok()
            }
            BusCommand::Start { result } => result.send(state.start().await).is_ok(),
            BusCommand::Pause { paused, result } => {
                result.send(state.pause(paused).await).is_ok()
            }
            BusCommand::Reset { component, result } => {
                result.send(state.reset(component).await).is_ok()
            }
            BusCommand::Stop { result } => result.send(state.stop().await).is_ok(),
            BusCommand::Close { result } => result.send(state.close().await).is_ok(),
            BusCommand::Phases { result } => result.send(Ok(state.phases())).is_ok(),
        };
        if !sent {
            return Err(anyhow!("send result error: receiver dropped"));
        }
        Ok(())
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> BusCommand) -> anyhow::Result<T> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(make(tx))
            .await
            .map_err(|_| anyhow!("bus {} is shut down", self.id))?;
        rx.await?
    }

    /// Opens the container at `url` and returns its streams.
    pub async fn add_input(&self, url: impl Into<String>) -> anyhow::Result<Vec<StreamDescriptor>> {
        let url = url.into();
        self.request(|result| BusCommand::AddInput { url, result })
            .await
    }

    pub async fn add_output(&self, kind: OutputKind) -> anyhow::Result<OutputStream> {
        self.request(|result| BusCommand::AddOutput { kind, result })
            .await
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        self.request(|result| BusCommand::Start { result }).await
    }

    pub async fn pause(&self, paused: bool) -> anyhow::Result<()> {
        self.request(|result| BusCommand::Pause { paused, result })
            .await
    }

    pub async fn reset(&self, component: ComponentRef) -> anyhow::Result<()> {
        self.request(|result| BusCommand::Reset { component, result })
            .await
    }

    pub async fn stop(&self) -> anyhow::Result<()> {
        self.request(|result| BusCommand::Stop { result }).await
    }

    /// Stops and releases every component. Output streams end.
    pub async fn close(&self) -> anyhow::Result<()> {
        self.request(|result| BusCommand::Close { result }).await
    }

    pub async fn phases(&self) -> anyhow::Result<Vec<(ComponentRef, Phase)>> {
        self.request(|result| BusCommand::Phases { result }).await
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for Bus {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Runs a lifecycle transition off the async executor; stopping joins threads.
async fn blocking<F>(component: Arc<dyn Component>, op: F) -> anyhow::Result<()>
where
    F: FnOnce(&dyn Component) -> crate::error::Result<()> + Send + 'static,
{
    let name = component.name().to_string();
    tokio::task::spawn_blocking(move || op(component.as_ref()))
        .await
        .with_context(|| format!("{name} task"))?
        .with_context(|| name.clone())?;
    Ok(())
}

/// Input pad feeding the subscribers of one output.
///
/// Every subscriber has its own bounded channel. A full channel blocks the
/// stage producing into the tap until the subscriber catches up or the stage
/// is stopped.
struct OutputTap {
    name: &'static str,
    pad: Mutex<Option<PadId>>,
    subscribers: Mutex<Vec<mpsc::Sender<OutputEvent>>>,
    interrupted: Mutex<CancellationToken>,
}

impl OutputTap {
    fn attach(graph: &PadGraph, name: &'static str, output: Option<PadId>) -> anyhow::Result<Arc<Self>> {
        let tap = Arc::new(Self {
            name,
            pad: Mutex::new(None),
            subscribers: Mutex::new(Vec::new()),
            interrupted: Mutex::new(CancellationToken::new()),
        });
        let consumer: Arc<dyn MessageConsumer> = tap.clone();
        let pad = graph.create_input_pad(name, None, Arc::downgrade(&consumer));
        *tap.pad.lock() = Some(pad);
        if let Err(e) = link(graph, output, Some(pad)) {
            graph.destroy_pad(pad);
            return Err(e).context(format!("attach {name} output"));
        }
        Ok(tap)
    }

    fn subscribe(&self) -> OutputStream {
        let (tx, rx) = mpsc::channel(OUTPUT_CAPACITY);
        self.subscribers.lock().push(tx);
        ReceiverStream::new(rx).boxed()
    }

    /// Hands `event` to every subscriber, waiting for room in each channel.
    /// Called from pipeline threads, never from the bus task.
    fn deliver(&self, event: OutputEvent) {
        let interrupted = self.interrupted.lock().clone();
        let subscribers = self.subscribers.lock().clone();
        if subscribers.is_empty() {
            log::trace!("{}: no subscribers", self.name);
            return;
        }
        let mut closed = false;
        for tx in subscribers {
            let event = event.clone();
            let sent = futures::executor::block_on(async {
                tokio::select! {
                    biased;
                    sent = tx.send(event) => Some(sent.is_ok()),
                    _ = interrupted.cancelled() => None,
                }
            });
            match sent {
                Some(true) => {}
                Some(false) => closed = true,
                None => log::trace!("{}: delivery interrupted, event dropped", self.name),
            }
        }
        if closed {
            self.subscribers.lock().retain(|tx| !tx.is_closed());
        }
    }

    /// Sends without waiting; used from the bus task.
    fn notify(&self, event: OutputEvent) {
        for tx in self.subscribers.lock().iter() {
            if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(event.clone()) {
                log::warn!("{}: subscriber full, event lost", self.name);
            }
        }
    }

    fn detach(&self, graph: &PadGraph) {
        if let Some(pad) = self.pad.lock().take() {
            graph.destroy_pad(pad);
        }
        self.subscribers.lock().clear();
    }
}

impl MessageConsumer for OutputTap {
    fn consume(&self, _pad: PadId, message: Message) {
        let event = match message.action() {
            Action::Data if message.framebuffer().is_some() => {
                message.into_framebuffer().map(OutputEvent::Framebuffer)
            }
            Action::Data => message.into_packet().map(OutputEvent::Packet),
            Action::Stop if message.flag(keys::EOS) => Some(OutputEvent::EndOfStream),
            Action::Start => {
                let mut interrupted = self.interrupted.lock();
                if interrupted.is_cancelled() {
                    *interrupted = CancellationToken::new();
                }
                None
            }
            _ => None,
        };
        if let Some(event) = event {
            self.deliver(event);
        }
    }

    fn interrupt(&self, _pad: PadId) {
        self.interrupted.lock().cancel();
    }
}

/// Everything the bus task owns. Components are declared in data-flow
/// order so they are dropped in it.
struct BusState {
    id: String,
    graph: Arc<PadGraph>,
    registry: Arc<BackendRegistry>,
    config: PipelineConfig,
    gpu: BindingFactory,
    events: EventSender,

    demuxer: Option<Arc<Demuxer>>,
    decoder: Option<Arc<Decoder>>,
    mapper: Option<Arc<FrameMapper>>,
    encoder: Option<Arc<Encoder>>,

    video: Option<StreamDescriptor>,
    frames_tap: Option<Arc<OutputTap>>,
    packets_tap: Option<Arc<OutputTap>>,
}

impl BusState {
    fn component(&self, r: ComponentRef) -> Option<Arc<dyn Component>> {
        match r {
            ComponentRef::Demuxer => self.demuxer.clone().map(|c| c as Arc<dyn Component>),
            ComponentRef::Decoder => self.decoder.clone().map(|c| c as Arc<dyn Component>),
            ComponentRef::Mapper => self.mapper.clone().map(|c| c as Arc<dyn Component>),
            ComponentRef::Encoder => self.encoder.clone().map(|c| c as Arc<dyn Component>),
        }
    }

    /// Existing components in data-flow order.
    fn components(&self) -> Vec<(ComponentRef, Arc<dyn Component>)> {
        ComponentRef::ALL
            .into_iter()
            .filter_map(|r| self.component(r).map(|c| (r, c)))
            .collect()
    }

    fn phases(&self) -> Vec<(ComponentRef, Phase)> {
        self.components()
            .into_iter()
            .map(|(r, c)| (r, c.phase()))
            .collect()
    }

    fn taps(&self) -> impl Iterator<Item = &Arc<OutputTap>> {
        self.frames_tap.iter().chain(self.packets_tap.iter())
    }

    async fn add_input(&mut self, url: String) -> anyhow::Result<Vec<StreamDescriptor>> {
        if self.demuxer.is_some() {
            bail!("input already exists");
        }
        let demuxer = Arc::new(
            Demuxer::new(self.graph.clone(), self.registry.clone(), url.as_str())
                .with_events(self.events.clone()),
        );
        blocking(demuxer.clone(), |c| c.init()).await?;
        blocking(demuxer.clone(), |c| c.open())
            .await
            .with_context(|| format!("open input {url}"))?;

        let streams = demuxer.streams();
        for s in &streams {
            log::info!(
                "bus {}: stream {} {} {:?}",
                self.id,
                s.index(),
                s.codec(),
                s.kind()
            );
        }
        self.video = streams.iter().find(|s| s.is_video()).cloned();
        if self.video.is_none() {
            log::warn!("bus {}: {url} has no video stream", self.id);
        }
        self.demuxer = Some(demuxer);
        Ok(streams)
    }

    async fn ensure_decoder(&mut self) -> anyhow::Result<Arc<Decoder>> {
        if let Some(decoder) = &self.decoder {
            return Ok(decoder.clone());
        }
        let (Some(demuxer), Some(video)) = (&self.demuxer, &self.video) else {
            bail!("no video input to decode");
        };
        let decoder = Arc::new(
            Decoder::new(self.graph.clone(), self.registry.clone(), &self.config)
                .with_events(self.events.clone()),
        );
        decoder.init()?;
        link(
            &self.graph,
            demuxer.packet_output(video.index()),
            decoder.packet_input(),
        )?;
        decoder.set_stream(video.clone());
        blocking(decoder.clone(), |c| c.open()).await?;
        self.decoder = Some(decoder.clone());
        Ok(decoder)
    }

    async fn frames_tap(&mut self, decoder: &Decoder) -> anyhow::Result<Arc<OutputTap>> {
        if let Some(tap) = &self.frames_tap {
            return Ok(tap.clone());
        }
        if !self.config.mapper.enabled {
            bail!("frame output needs the mapper, which is disabled");
        }
        let mapper = Arc::new(
            FrameMapper::new(self.graph.clone(), (self.gpu)(), &self.config)
                .with_events(self.events.clone()),
        );
        mapper.init()?;
        link(&self.graph, decoder.frame_output(), mapper.frame_input())?;
        blocking(mapper.clone(), |c| c.open()).await?;
        let tap = OutputTap::attach(&self.graph, "frames", mapper.framebuffer_output())?;
        self.mapper = Some(mapper);
        self.frames_tap = Some(tap.clone());
        Ok(tap)
    }

    async fn packets_tap(&mut self, decoder: &Decoder) -> anyhow::Result<Arc<OutputTap>> {
        if let Some(tap) = &self.packets_tap {
            return Ok(tap.clone());
        }
        let encoder = Arc::new(
            Encoder::new(self.graph.clone(), self.registry.clone(), &self.config)
                .with_events(self.events.clone()),
        );
        encoder.init()?;
        link(&self.graph, decoder.frame_output(), encoder.frame_input())?;
        blocking(encoder.clone(), |c| c.open()).await?;
        let tap = OutputTap::attach(&self.graph, "packets", encoder.packet_output(0))?;
        self.encoder = Some(encoder);
        self.packets_tap = Some(tap.clone());
        Ok(tap)
    }

    async fn add_output(&mut self, kind: OutputKind) -> anyhow::Result<OutputStream> {
        if self.components().iter().any(|(_, c)| c.phase().has_worker()) {
            bail!("outputs must be added before start");
        }
        let decoder = self.ensure_decoder().await?;
        let tap = match kind {
            OutputKind::Frames => self.frames_tap(&decoder).await?,
            OutputKind::Encoded => self.packets_tap(&decoder).await?,
        };
        log::info!("bus {}: {kind:?} output added", self.id);
        Ok(tap.subscribe())
    }

    async fn start(&mut self) -> anyhow::Result<()> {
        if self.demuxer.is_none() {
            bail!("no input");
        }
        if self.decoder.is_none() {
            bail!("no outputs");
        }
        // Consumers first, so nothing produced finds a stopped stage.
        for (r, c) in self.components().into_iter().rev() {
            if c.phase() == Phase::Opened {
                blocking(c, |c| c.start())
                    .await
                    .with_context(|| format!("start {}", r.name()))?;
            }
        }
        log::info!("bus {}: started", self.id);
        Ok(())
    }

    async fn pause(&mut self, paused: bool) -> anyhow::Result<()> {
        let from = if paused { Phase::Running } else { Phase::Paused };
        for (r, c) in self.components() {
            if c.phase() == from {
                blocking(c, move |c| c.pause(paused))
                    .await
                    .with_context(|| format!("pause {}", r.name()))?;
            }
        }
        Ok(())
    }

    async fn reset(&mut self, r: ComponentRef) -> anyhow::Result<()> {
        let c = self
            .component(r)
            .ok_or_else(|| anyhow!("no {} on bus {}", r.name(), self.id))?;
        blocking(c, |c| c.reset()).await
    }

    async fn stop(&mut self) -> anyhow::Result<()> {
        let mut first_error = None;
        for (r, c) in self.components() {
            if !matches!(c.phase(), Phase::Opened | Phase::Running | Phase::Paused) {
                continue;
            }
            if let Err(e) = blocking(c, |c| c.stop()).await {
                log::warn!("bus {}: stop {}: {e:#}", self.id, r.name());
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        let stopped = self.stop().await;
        for (r, c) in self.components() {
            if c.phase() == Phase::Closed {
                continue;
            }
            if let Err(e) = blocking(c, |c| c.close()).await {
                log::warn!("bus {}: close {}: {e:#}", self.id, r.name());
            }
        }
        for tap in self.taps() {
            tap.detach(&self.graph);
        }
        self.frames_tap = None;
        self.packets_tap = None;
        self.demuxer = None;
        self.decoder = None;
        self.mapper = None;
        self.encoder = None;
        self.video = None;
        stopped
    }

    async fn on_event(&mut self, event: ComponentEvent) {
        match event {
            ComponentEvent::Failed { component, error } => {
                log::error!("bus {}: {component} failed: {error}", self.id);
                for tap in self.taps() {
                    tap.notify(OutputEvent::Failed {
                        component: component.clone(),
                        error: error.clone(),
                    });
                }
                let Some(c) = ComponentRef::from_name(&component).and_then(|r| self.component(r))
                else {
                    return;
                };
                if c.phase().has_worker() {
                    if let Err(e) = blocking(c, |c| c.stop()).await {
                        log::warn!("bus {}: stop failed {component}: {e:#}", self.id);
                    }
                }
            }
            ComponentEvent::EndOfStream { component } => {
                log::info!("bus {}: {component} reached end of stream", self.id);
            }
        }
    }
}

#[cfg(test)]
#[path = "bus_test.rs"]
mod bus_test;
