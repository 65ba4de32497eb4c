//! Container demultiplexer.
//!
//! `init` opens the container and creates one output pad per elementary
//! stream. The read loop runs on its own thread: every packet is rescaled to
//! the pipeline time base and produced on the pad of its stream, preceded by
//! exactly one INIT per pad. At end of stream every pad receives
//! `STOP{eos=true}` so downstream stages flush.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::backend::{ContainerSource, Fetch};
use crate::component::{
    Component, ComponentEvent, EventSender, Lifecycle, OutputGate, PacketProducer, Phase, Signal,
    Worker, notify,
};
use crate::error::{PipelineError, Result};
use crate::message::{Action, Message};
use crate::pad::{PadGraph, PadId, PadParams};
use crate::registry::BackendRegistry;
use crate::stream::{PIPELINE_TIME_BASE, Rational, StreamDescriptor};

const IDLE_WAIT: Duration = Duration::from_millis(5);
const PAUSE_WAIT: Duration = Duration::from_millis(50);

#[derive(Clone, Copy)]
struct Route {
    pad: PadId,
    time_base: Rational,
}

struct Shared {
    lifecycle: Lifecycle,
    graph: Arc<PadGraph>,
    routes: Mutex<HashMap<usize, Route>>,
    // Output pads in stream order.
    pads: Mutex<Vec<PadId>>,
    init_sent: Mutex<Vec<PadId>>,
    paused: AtomicBool,
    wake: Signal,
    stop_sent: AtomicBool,
    gate: OutputGate,
}

impl Shared {
    fn pads(&self) -> Vec<PadId> {
        self.pads.lock().clone()
    }

    fn broadcast(&self, make: impl Fn() -> Message) {
        for pad in self.pads() {
            self.graph.produce(pad, make());
        }
    }

    /// Sends STOP downstream once per run. The read loop goes through the
    /// gate; `stop` calls this after shutting it.
    fn send_stop(&self, eos: bool) {
        if !self.stop_sent.swap(true, Ordering::AcqRel) {
            self.broadcast(|| Message::stop(eos));
        }
    }

    fn send_final_stop(&self, eos: bool) {
        if let Some(_delivery) = self.gate.enter() {
            self.send_stop(eos);
        }
    }

    fn send_init_once(&self, pad: PadId) {
        let Some(_delivery) = self.gate.enter() else {
            return;
        };
        {
            let mut sent = self.init_sent.lock();
            if sent.contains(&pad) {
                return;
            }
            sent.push(pad);
        }
        if let Some(params) = self.graph.params(pad) {
            self.graph.produce(pad, Message::init(params));
        }
    }
}

enum Origin {
    Url {
        registry: Arc<BackendRegistry>,
        url: String,
    },
    Preset,
}

pub struct Demuxer {
    shared: Arc<Shared>,
    origin: Origin,
    source: Mutex<Option<Box<dyn ContainerSource>>>,
    streams: Mutex<Vec<StreamDescriptor>>,
    worker: Mutex<Option<Worker<Box<dyn ContainerSource>>>>,
    cancel: Mutex<CancellationToken>,
    events: Option<EventSender>,
}

impl Demuxer {
    /// Demuxer over whatever container source in `registry` accepts `url`.
    pub fn new(graph: Arc<PadGraph>, registry: Arc<BackendRegistry>, url: impl Into<String>) -> Self {
        Self::build(
            graph,
            Origin::Url {
                registry,
                url: url.into(),
            },
            None,
        )
    }

    /// Demuxer over an already opened source. Such a demuxer cannot be reset.
    pub fn from_source(graph: Arc<PadGraph>, source: Box<dyn ContainerSource>) -> Self {
        Self::build(graph, Origin::Preset, Some(source))
    }

    fn build(
        graph: Arc<PadGraph>,
        origin: Origin,
        source: Option<Box<dyn ContainerSource>>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                lifecycle: Lifecycle::new("demuxer"),
                graph,
                routes: Mutex::new(HashMap::new()),
                pads: Mutex::new(Vec::new()),
                init_sent: Mutex::new(Vec::new()),
                paused: AtomicBool::new(false),
                wake: Signal::new(),
                stop_sent: AtomicBool::new(false),
                gate: OutputGate::new(),
            }),
            origin,
            source: Mutex::new(source),
            streams: Mutex::new(Vec::new()),
            worker: Mutex::new(None),
            cancel: Mutex::new(CancellationToken::new()),
            events: None,
        }
    }

    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = Some(events);
        self
    }

    pub fn streams(&self) -> Vec<StreamDescriptor> {
        self.streams.lock().clone()
    }

    pub fn output_pads(&self) -> Vec<PadId> {
        self.shared.pads()
    }

    fn open_source(&self) -> Result<Box<dyn ContainerSource>> {
        match &self.origin {
            Origin::Url { registry, url } => registry.open_container(url),
            Origin::Preset => Err(PipelineError::open(
                self.name(),
                "preset source cannot be reopened",
            )),
        }
    }

    fn spawn_worker(&self, source: Box<dyn ContainerSource>) -> Result<()> {
        let token = CancellationToken::new();
        *self.cancel.lock() = token.clone();
        let shared = self.shared.clone();
        let events = self.events.clone();
        let worker = Worker::spawn("demuxer", move || read_loop(shared, source, token, events))?;
        *self.worker.lock() = Some(worker);
        Ok(())
    }

    /// Cancels and joins the read loop, returning the source it owned.
    fn halt_worker(&self) -> Option<Box<dyn ContainerSource>> {
        self.cancel.lock().cancel();
        self.shared.wake.notify();
        let worker = self.worker.lock().take()?;
        worker.join()
    }
}

fn read_loop(
    shared: Arc<Shared>,
    mut source: Box<dyn ContainerSource>,
    cancel: CancellationToken,
    events: Option<EventSender>,
) -> Box<dyn ContainerSource> {
    for pad in shared.pads() {
        shared.send_init_once(pad);
    }
    let mut packets = 0u64;
    loop {
        if cancel.is_cancelled() {
            break;
        }
        if shared.paused.load(Ordering::Acquire) {
            let seen = shared.wake.current();
            if shared.paused.load(Ordering::Acquire) {
                shared.wake.wait_past(seen, PAUSE_WAIT);
            }
            continue;
        }
        match source.read_packet() {
            Fetch::Ready(mut packet) => {
                let route = shared.routes.lock().get(&packet.index()).copied();
                let Some(route) = route else {
                    log::trace!("demuxer: packet for unrouted stream {}", packet.index());
                    continue;
                };
                packet.rescale_ts(route.time_base, PIPELINE_TIME_BASE);
                shared.send_init_once(route.pad);
                if !shared.gate.produce(&shared.graph, route.pad, Message::data_packet(packet)) {
                    break;
                }
                packets += 1;
            }
            Fetch::Pending => {
                let seen = shared.wake.current();
                shared.wake.wait_past(seen, IDLE_WAIT);
            }
            Fetch::EndOfStream => {
                log::info!("demuxer: end of stream after {packets} packets");
                shared.send_final_stop(true);
                notify(
                    &events,
                    ComponentEvent::EndOfStream {
                        component: shared.lifecycle.name().to_string(),
                    },
                );
                break;
            }
            Fetch::Fatal(reason) => {
                shared.lifecycle.record_error(format!("read failed: {reason}"));
                shared.send_final_stop(true);
                notify(
                    &events,
                    ComponentEvent::Failed {
                        component: shared.lifecycle.name().to_string(),
                        error: reason,
                    },
                );
                break;
            }
        }
    }
    source
}

impl Component for Demuxer {
    fn name(&self) -> &str {
        self.shared.lifecycle.name()
    }

    fn phase(&self) -> Phase {
        self.shared.lifecycle.phase()
    }

    fn init(&self) -> Result<()> {
        let t = self.shared.lifecycle.begin(&[Phase::Uninitialized], Phase::Initialized)?;
        let mut source = self.source.lock();
        if source.is_none() {
            let opened = self.open_source();
            *source = Some(opened.inspect_err(|e| self.shared.lifecycle.record_error(e))?);
        }
        let streams = source.as_ref().map(|s| s.streams()).unwrap_or_default();
        let mut pads = Vec::with_capacity(streams.len());
        let mut routes = HashMap::new();
        for stream in &streams {
            let pad = self
                .shared
                .graph
                .create_output_pad(self.name(), Some(PadParams::packet(stream.clone())));
            log::info!("demuxer: {stream} -> {pad}");
            routes.insert(
                stream.index(),
                Route {
                    pad,
                    time_base: stream.time_base(),
                },
            );
            pads.push(pad);
        }
        *self.shared.pads.lock() = pads;
        *self.shared.routes.lock() = routes;
        *self.streams.lock() = streams;
        t.commit();
        Ok(())
    }

    fn open(&self) -> Result<()> {
        let t = self.shared.lifecycle.begin(&[Phase::Initialized], Phase::Opened)?;
        let mut source = self.source.lock();
        if source.is_none() {
            let opened = self.open_source();
            *source = Some(opened.inspect_err(|e| self.shared.lifecycle.record_error(e))?);
        }
        self.shared.lifecycle.clear_error();
        t.commit();
        Ok(())
    }

    fn start(&self) -> Result<()> {
        let t = self.shared.lifecycle.begin(&[Phase::Opened], Phase::Running)?;
        let source = self
            .source
            .lock()
            .take()
            .ok_or_else(|| PipelineError::open(self.name(), "container not open"))?;
        self.shared.paused.store(false, Ordering::Release);
        self.shared.stop_sent.store(false, Ordering::Release);
        self.shared.gate.open();
        self.shared.broadcast(|| Message::control(Action::Start));
        self.spawn_worker_checked(source)?;
        t.commit();
        Ok(())
    }

    fn pause(&self, paused: bool) -> Result<()> {
        let t = if paused {
            self.shared.lifecycle.begin(&[Phase::Running], Phase::Paused)?
        } else {
            self.shared.lifecycle.begin(&[Phase::Paused], Phase::Running)?
        };
        self.shared.paused.store(paused, Ordering::Release);
        self.shared.wake.notify();
        t.commit();
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        let t = self
            .shared
            .lifecycle
            .begin(&[Phase::Opened, Phase::Running, Phase::Paused], Phase::Stopped)?;
        self.cancel.lock().cancel();
        self.shared.paused.store(false, Ordering::Release);
        self.shared.wake.notify();
        // Whatever the read loop is delivering lands before STOP.
        self.shared.gate.shut(&self.shared.graph, &self.shared.pads());
        self.shared.send_stop(false);
        if let Some(source) = self.halt_worker() {
            *self.source.lock() = Some(source);
        }
        self.shared.broadcast(|| Message::control(Action::Cleanup));
        t.commit();
        Ok(())
    }

    fn close(&self) -> Result<()> {
        if self.phase().has_worker() {
            self.stop()?;
        }
        let t = self.shared.lifecycle.begin(
            &[
                Phase::Uninitialized,
                Phase::Initialized,
                Phase::Opened,
                Phase::Stopped,
            ],
            Phase::Closed,
        )?;
        if let Some(mut source) = self.source.lock().take() {
            source.close();
        }
        for pad in self.shared.pads.lock().drain(..) {
            self.shared.graph.destroy_pad(pad);
        }
        self.shared.routes.lock().clear();
        t.commit();
        Ok(())
    }

    fn reset(&self) -> Result<()> {
        let from = self.phase();
        let t = self
            .shared
            .lifecycle
            .begin(&[Phase::Opened, Phase::Running], from)?;
        let old = self.halt_worker().or_else(|| self.source.lock().take());
        if let Some(mut old) = old {
            old.close();
        }
        let reopened = self.open_source().and_then(|source| {
            if source.streams() != *self.streams.lock() {
                return Err(PipelineError::UnsupportedFormat(
                    "stream layout changed on reopen".to_string(),
                ));
            }
            Ok(source)
        });
        let source = match reopened {
            Ok(s) => s,
            Err(e) => {
                self.shared.lifecycle.record_error(&e);
                t.commit_as(Phase::Initialized);
                return Err(e);
            }
        };
        if from == Phase::Running {
            self.shared.stop_sent.store(false, Ordering::Release);
            if let Err(e) = self.spawn_worker_checked(source) {
                t.commit_as(Phase::Initialized);
                return Err(e);
            }
        } else {
            *self.source.lock() = Some(source);
        }
        log::info!("demuxer: reset");
        t.commit();
        Ok(())
    }

    fn last_error(&self) -> Option<String> {
        self.shared.lifecycle.last_error()
    }
}

impl Demuxer {
    fn spawn_worker_checked(&self, source: Box<dyn ContainerSource>) -> Result<()> {
        self.spawn_worker(source)
            .inspect_err(|e| self.shared.lifecycle.record_error(e))
    }
}

impl PacketProducer for Demuxer {
    fn packet_output(&self, stream_index: usize) -> Option<PadId> {
        self.shared
            .routes
            .lock()
            .get(&stream_index)
            .map(|r| r.pad)
    }
}

impl Drop for Demuxer {
    fn drop(&mut self) {
        if self.phase() != Phase::Closed {
            let _ = self.close();
        }
    }
}

#[cfg(test)]
#[path = "demuxer_test.rs"]
mod demuxer_test;
