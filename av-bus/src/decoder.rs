//! Hardware decoder component.
//!
//! Packets arriving on the input pad go through a bounded queue to the
//! submit worker. Hardware decoders are pipelined, so completed frames are
//! pulled by a separate fetcher thread and produced on the output pad as
//! soon as the backend releases them, independent of submission.
//!
//! ```text
//! consume -> queue -> worker --submit--> backend --receive--> fetcher -> produce
//! ```
//!
//! A busy backend or an empty surface pool makes the worker hold the packet
//! and retry it after the fetcher drains something, with bounded backoff.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::backend::{DecoderBackend, Fetch};
use crate::component::{
    Component, ComponentEvent, EventSender, FrameProducer, Lifecycle, OutputGate, PacketConsumer,
    Phase, Signal, Worker, notify,
};
use crate::config::{DecoderConfig, PipelineConfig, Tuning};
use crate::error::{BackendStatus, PipelineError, Result};
use crate::hw::{FramesPoolConfig, HwDeviceContext, HwFramesContext};
use crate::message::{Action, Message, keys};
use crate::packet::Packet;
use crate::pad::{AudioPadParams, MessageConsumer, PadGraph, PadId, PadParams, VideoPadParams};
use crate::queue::{BoundedQueue, PopError};
use crate::registry::{BackendRegistry, Platform};
use crate::stream::{MediaFormat, PixelFormat, SampleFormat, StreamDescriptor};

const FETCH_WAIT: Duration = Duration::from_millis(10);

enum Item {
    Packet(Packet),
    EndOfStream,
}

/// CPU layout of the surfaces a hardware decoder writes for `format`.
pub fn surface_sw_format(format: Option<PixelFormat>) -> PixelFormat {
    match format {
        Some(PixelFormat::P010) => PixelFormat::P010,
        Some(f @ (PixelFormat::Rgba | PixelFormat::Bgra | PixelFormat::Rgb24)) => f,
        _ => PixelFormat::Nv12,
    }
}

struct Threads {
    worker: Worker<()>,
    fetcher: Worker<()>,
}

struct DecoderInner {
    lifecycle: Lifecycle,
    self_ref: Weak<DecoderInner>,
    graph: Arc<PadGraph>,
    registry: Arc<BackendRegistry>,
    config: DecoderConfig,
    tuning: Tuning,

    input: Mutex<Option<PadId>>,
    output: Mutex<Option<PadId>>,
    stream: Mutex<Option<StreamDescriptor>>,

    backend: Mutex<Option<Box<dyn DecoderBackend>>>,
    device: Mutex<Option<HwDeviceContext>>,
    frames: Mutex<Option<HwFramesContext>>,

    queue: BoundedQueue<Item>,
    threads: Mutex<Option<Threads>>,
    cancel: Mutex<CancellationToken>,
    // Worker -> fetcher: something was submitted.
    submitted: Signal,
    // Fetcher -> worker: a frame left the backend.
    drained: Signal,
    input_stopped: AtomicBool,
    stop_forwarded: AtomicBool,
    gate: OutputGate,
    events: Mutex<Option<EventSender>>,
}

pub struct Decoder {
    inner: Arc<DecoderInner>,
}

impl Decoder {
    pub fn new(
        graph: Arc<PadGraph>,
        registry: Arc<BackendRegistry>,
        config: &PipelineConfig,
    ) -> Self {
        Self::named("decoder", graph, registry, config)
    }

    pub fn named(
        name: impl Into<String>,
        graph: Arc<PadGraph>,
        registry: Arc<BackendRegistry>,
        config: &PipelineConfig,
    ) -> Self {
        let tuning = config.tuning();
        let inner = Arc::new_cyclic(|self_ref| DecoderInner {
            lifecycle: Lifecycle::new(name),
            self_ref: self_ref.clone(),
            graph,
            registry,
            config: config.decoder.clone(),
            tuning,
            input: Mutex::new(None),
            output: Mutex::new(None),
            stream: Mutex::new(None),
            backend: Mutex::new(None),
            device: Mutex::new(None),
            frames: Mutex::new(None),
            queue: BoundedQueue::new(tuning.queue_capacity),
            threads: Mutex::new(None),
            cancel: Mutex::new(CancellationToken::new()),
            submitted: Signal::new(),
            drained: Signal::new(),
            input_stopped: AtomicBool::new(false),
            stop_forwarded: AtomicBool::new(false),
            gate: OutputGate::new(),
            events: Mutex::new(None),
        });
        inner.queue.close();
        Self { inner }
    }

    pub fn with_events(self, events: EventSender) -> Self {
        *self.inner.events.lock() = Some(events);
        self
    }

    /// Descriptor `open` will use. Normally delivered by INIT on the input pad.
    pub fn set_stream(&self, stream: StreamDescriptor) {
        *self.inner.stream.lock() = Some(stream);
    }

    pub fn stream(&self) -> Option<StreamDescriptor> {
        self.inner.stream.lock().clone()
    }

    /// Opens the backend for `stream`.
    pub fn open_stream(&self, stream: &StreamDescriptor) -> Result<()> {
        self.set_stream(stream.clone());
        self.open()
    }

    /// Submits one packet directly to the backend, bypassing the queue.
    pub fn decode(&self, packet: &Packet) -> BackendStatus {
        let status = match self.inner.backend.lock().as_mut() {
            Some(b) => b.submit(packet),
            None => BackendStatus::Fatal("decoder not open".to_string()),
        };
        if status.is_ok() {
            self.inner.submitted.notify();
        }
        status
    }

    pub fn frames_context(&self) -> Option<HwFramesContext> {
        self.inner.frames.lock().clone()
    }

    pub fn backend_name(&self) -> Option<String> {
        self.inner
            .backend
            .lock()
            .as_ref()
            .map(|b| b.name().to_string())
    }

    pub fn queued(&self) -> usize {
        self.inner.queue.len()
    }
}

impl DecoderInner {
    fn name(&self) -> &str {
        self.lifecycle.name()
    }

    fn output(&self) -> Option<PadId> {
        *self.output.lock()
    }

    fn produce(&self, message: Message) {
        if let Some(pad) = self.output() {
            self.graph.produce(pad, message);
        }
    }

    fn forward_stop(&self, eos: bool) {
        if !self.stop_forwarded.swap(true, Ordering::AcqRel) {
            self.produce(Message::stop(eos));
        }
    }

    /// Produces a decoded frame unless `stop` has shut the output.
    fn produce_frame(&self, message: Message) -> bool {
        match self.output() {
            Some(pad) => self.gate.produce(&self.graph, pad, message),
            None => true,
        }
    }

    fn forward_drained(&self) {
        if let Some(_delivery) = self.gate.enter() {
            self.forward_stop(true);
        }
    }

    fn shut_output(&self) {
        let pads: Vec<PadId> = self.output().into_iter().collect();
        self.gate.shut(&self.graph, &pads);
    }

    fn emit(&self, event: ComponentEvent) {
        notify(&self.events.lock(), event);
    }

    /// Runtime failure seen by one of the threads.
    fn fail(&self, reason: String) {
        self.lifecycle.record_error(format!("backend failure: {reason}"));
        self.cancel.lock().cancel();
        self.queue.close();
        self.submitted.notify();
        self.drained.notify();
        self.emit(ComponentEvent::Failed {
            component: self.name().to_string(),
            error: reason,
        });
    }

    fn open_backend(&self, stream: &StreamDescriptor) -> Result<()> {
        let platform = self.config.platform.unwrap_or_else(Platform::current);
        let mut backend = self
            .registry
            .resolve_decoder(platform, stream.codec(), stream.format())?;

        let mut opened = stream.clone();
        let mut pool = None;
        let hw_kind = backend
            .hw_device_type()
            .map(|k| self.config.hw_device.unwrap_or(k));
        if let (true, Some(kind)) = (stream.is_video(), hw_kind) {
            let device = backend.create_device(kind)?;
            let sw_format = surface_sw_format(stream.format().pixel());
            let frames = backend.create_frames(
                &device,
                FramesPoolConfig {
                    sw_format,
                    width: stream.width(),
                    height: stream.height(),
                    pool_size: self.config.pool_size,
                },
            )?;
            opened = opened.with_format(MediaFormat::Pixel(sw_format));
            pool = Some((device, frames));
        }

        backend
            .open(&opened, pool.as_ref().map(|(_, f)| f))
            .map_err(|e| PipelineError::open(self.name(), e.to_string()))?;

        let params = if stream.is_video() {
            PadParams::Video(VideoPadParams {
                format: pool
                    .as_ref()
                    .map(|(_, f)| f.surface_format())
                    .or(opened.format().pixel())
                    .unwrap_or(PixelFormat::Yuv420p),
                width: stream.width(),
                height: stream.height(),
                hw_device: pool.as_ref().map(|(d, _)| d.device_type()),
            })
        } else {
            PadParams::Audio(AudioPadParams {
                format: stream.format().sample().unwrap_or(SampleFormat::F32p),
                sample_rate: stream.sample_rate(),
                channels: stream.channels(),
            })
        };
        if let Some(out) = self.output() {
            self.graph.set_params(out, Some(params))?;
        }
        log::info!(
            "{}: opened {} with {}{}",
            self.name(),
            stream,
            backend.name(),
            pool.as_ref()
                .map(|(d, _)| format!(" on {}", d.device_type()))
                .unwrap_or_default()
        );

        let (device, frames) = match pool {
            Some((d, f)) => (Some(d), Some(f)),
            None => (None, None),
        };
        *self.backend.lock() = Some(backend);
        *self.device.lock() = device;
        *self.frames.lock() = frames;
        Ok(())
    }

    fn release_backend(&self) {
        if let Some(mut backend) = self.backend.lock().take() {
            backend.close();
        }
        self.frames.lock().take();
        self.device.lock().take();
    }

    fn spawn_threads(&self) -> Result<()> {
        let Some(me) = self.self_ref.upgrade() else {
            return Err(PipelineError::backend(self.name(), "decoder dropped"));
        };
        let token = CancellationToken::new();
        *self.cancel.lock() = token.clone();
        self.queue.reopen();

        let (w, wt) = (me.clone(), token.clone());
        let worker = Worker::spawn(format!("{}-submit", self.name()), move || {
            w.submit_loop(wt)
        })?;
        let fetcher = match Worker::spawn(format!("{}-fetch", self.name()), move || {
            me.fetch_loop(token)
        }) {
            Ok(f) => f,
            Err(e) => {
                self.cancel.lock().cancel();
                self.queue.close();
                worker.join();
                return Err(e);
            }
        };
        *self.threads.lock() = Some(Threads { worker, fetcher });
        Ok(())
    }

    fn halt_threads(&self) {
        self.cancel.lock().cancel();
        self.queue.close();
        self.submitted.notify();
        self.drained.notify();
        if let Some(t) = self.threads.lock().take() {
            t.worker.join();
            t.fetcher.join();
        }
    }

    fn submit_loop(&self, cancel: CancellationToken) {
        let backoff = self.tuning.backoff;
        loop {
            let item = match self.queue.pop() {
                Ok(item) => item,
                Err(PopError::Closed) | Err(PopError::Timeout) => break,
            };
            let packet = match item {
                Item::Packet(p) => p,
                Item::EndOfStream => {
                    let status = match self.backend.lock().as_mut() {
                        Some(b) => b.submit_eos(),
                        None => BackendStatus::Fatal("backend closed".to_string()),
                    };
                    if let BackendStatus::Fatal(reason) = status {
                        self.fail(reason);
                        return;
                    }
                    log::debug!("{}: end of stream submitted", self.name());
                    self.submitted.notify();
                    continue;
                }
            };
            let mut wait = backoff.initial;
            loop {
                if cancel.is_cancelled() {
                    return;
                }
                let seen = self.drained.current();
                let status = match self.backend.lock().as_mut() {
                    Some(b) => b.submit(&packet),
                    None => BackendStatus::Fatal("backend closed".to_string()),
                };
                match status {
                    BackendStatus::Ok => {
                        self.submitted.notify();
                        break;
                    }
                    BackendStatus::Retry => {
                        self.submitted.notify();
                        self.drained.wait_past(seen, wait);
                        wait = backoff.next(wait);
                    }
                    BackendStatus::EndOfStream => {
                        log::debug!("{}: packet after end of stream dropped", self.name());
                        break;
                    }
                    BackendStatus::Fatal(reason) => {
                        self.fail(reason);
                        return;
                    }
                }
            }
        }
    }

    fn fetch_loop(&self, cancel: CancellationToken) {
        let mut frames = 0u64;
        loop {
            if cancel.is_cancelled() {
                break;
            }
            let seen = self.submitted.current();
            let fetched = match self.backend.lock().as_mut() {
                Some(b) => b.receive(),
                None => Fetch::Fatal("backend closed".to_string()),
            };
            match fetched {
                Fetch::Ready(frame) => {
                    self.drained.notify();
                    if !self.produce_frame(Message::data_frame(frame)) {
                        break;
                    }
                    frames += 1;
                }
                Fetch::Pending => {
                    self.submitted.wait_past(seen, FETCH_WAIT);
                }
                Fetch::EndOfStream => {
                    log::info!("{}: drained after {frames} frames", self.name());
                    self.forward_drained();
                    self.emit(ComponentEvent::EndOfStream {
                        component: self.name().to_string(),
                    });
                    break;
                }
                Fetch::Fatal(reason) => {
                    if !cancel.is_cancelled() {
                        self.fail(reason);
                    }
                    break;
                }
            }
        }
    }
}

impl MessageConsumer for DecoderInner {
    fn consume(&self, _pad: PadId, message: Message) {
        match message.action() {
            Action::Data => {
                if !self.lifecycle.phase().has_worker()
                    || self.input_stopped.load(Ordering::Acquire)
                {
                    log::trace!("{}: DATA dropped", self.name());
                    return;
                }
                let Some(packet) = message.into_packet() else {
                    log::warn!("{}: DATA without packet", self.name());
                    return;
                };
                if let Err(e) = self.queue.push(Item::Packet(packet)) {
                    log::trace!("{}: packet dropped ({e:?})", self.name());
                }
            }
            Action::Init => {
                let stream = message
                    .params()
                    .and_then(|p| p.as_packet())
                    .map(|p| p.stream.clone());
                let Some(stream) = stream else {
                    log::warn!("{}: INIT without packet params", self.name());
                    return;
                };
                let mut current = self.stream.lock();
                let adopt = match current.as_ref() {
                    None => true,
                    Some(s) if *s == stream => false,
                    Some(s) if self.lifecycle.phase() != Phase::Initialized => {
                        log::warn!(
                            "{}: stream changed from {s} to {stream}; reset required",
                            self.name()
                        );
                        false
                    }
                    Some(_) => true,
                };
                if adopt {
                    *current = Some(stream);
                }
            }
            Action::Stop => {
                if message.flag(keys::EOS) {
                    if self.lifecycle.phase().has_worker()
                        && self.queue.push(Item::EndOfStream).is_err()
                    {
                        log::trace!("{}: queue closed before end of stream", self.name());
                    }
                } else {
                    self.input_stopped.store(true, Ordering::Release);
                    let purged = self.queue.purge();
                    log::debug!("{}: upstream stopped, {purged} packets discarded", self.name());
                }
            }
            Action::Start => self.input_stopped.store(false, Ordering::Release),
            _ => log::trace!("{}: {} ignored", self.name(), message.action()),
        }
    }

    fn interrupt(&self, _pad: PadId) {
        self.queue.interrupt_pushes();
    }
}

impl Component for Decoder {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn phase(&self) -> Phase {
        self.inner.lifecycle.phase()
    }

    fn init(&self) -> Result<()> {
        let inner = &self.inner;
        let t = inner
            .lifecycle
            .begin(&[Phase::Uninitialized], Phase::Initialized)?;
        let consumer: Weak<dyn MessageConsumer> = inner.self_ref.clone();
        *inner.input.lock() = Some(inner.graph.create_input_pad(inner.name(), None, consumer));
        *inner.output.lock() = Some(inner.graph.create_output_pad(inner.name(), None));
        t.commit();
        Ok(())
    }

    fn open(&self) -> Result<()> {
        let inner = &self.inner;
        let t = inner.lifecycle.begin(&[Phase::Initialized], Phase::Opened)?;
        let Some(stream) = inner.stream.lock().clone() else {
            let e = PipelineError::open(inner.name(), "no stream descriptor");
            inner.lifecycle.record_error(&e);
            return Err(e);
        };
        if let Err(e) = inner.open_backend(&stream) {
            inner.lifecycle.record_error(&e);
            return Err(e);
        }
        inner.lifecycle.clear_error();
        t.commit();
        Ok(())
    }

    fn start(&self) -> Result<()> {
        let inner = &self.inner;
        let t = inner.lifecycle.begin(&[Phase::Opened], Phase::Running)?;
        inner.input_stopped.store(false, Ordering::Release);
        inner.stop_forwarded.store(false, Ordering::Release);
        inner.gate.open();
        inner.produce(Message::control(Action::Start));
        if let Some(params) = inner.output().and_then(|o| inner.graph.params(o)) {
            inner.produce(Message::init(params));
        }
        inner.spawn_threads().inspect_err(|e| inner.lifecycle.record_error(e))?;
        t.commit();
        Ok(())
    }

    fn pause(&self, paused: bool) -> Result<()> {
        let inner = &self.inner;
        let t = if paused {
            inner.lifecycle.begin(&[Phase::Running], Phase::Paused)?
        } else {
            inner.lifecycle.begin(&[Phase::Paused], Phase::Running)?
        };
        inner.queue.set_paused(paused);
        t.commit();
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        let inner = &self.inner;
        let t = inner.lifecycle.begin(
            &[Phase::Opened, Phase::Running, Phase::Paused],
            Phase::Stopped,
        )?;
        inner.cancel.lock().cancel();
        // Frames the fetcher is delivering land before STOP.
        inner.shut_output();
        inner.forward_stop(false);
        inner.halt_threads();
        let purged = inner.queue.purge();
        if purged > 0 {
            log::debug!("{}: {purged} queued packets discarded", inner.name());
        }
        if let Some(b) = inner.backend.lock().as_mut() {
            b.flush();
        }
        inner.produce(Message::control(Action::Cleanup));
        t.commit();
        Ok(())
    }

    fn close(&self) -> Result<()> {
        if self.phase().has_worker() {
            self.stop()?;
        }
        let inner = &self.inner;
        let t = inner.lifecycle.begin(
            &[
                Phase::Uninitialized,
                Phase::Initialized,
                Phase::Opened,
                Phase::Stopped,
            ],
            Phase::Closed,
        )?;
        inner.halt_threads();
        inner.release_backend();
        for pad in [inner.input.lock().take(), inner.output.lock().take()]
            .into_iter()
            .flatten()
        {
            inner.graph.destroy_pad(pad);
        }
        t.commit();
        Ok(())
    }

    fn reset(&self) -> Result<()> {
        let inner = &self.inner;
        let from = self.phase();
        let t = inner.lifecycle.begin(&[Phase::Opened, Phase::Running], from)?;
        inner.halt_threads();
        inner.queue.purge();
        inner.release_backend();

        let stream = inner.stream.lock().clone();
        let reopened = match stream {
            Some(s) => inner.open_backend(&s),
            None => Err(PipelineError::open(inner.name(), "no stream descriptor")),
        };
        if let Err(e) = reopened {
            inner.lifecycle.record_error(&e);
            t.commit_as(Phase::Initialized);
            return Err(e);
        }
        if from == Phase::Running {
            if let Err(e) = inner.spawn_threads() {
                inner.lifecycle.record_error(&e);
                inner.release_backend();
                t.commit_as(Phase::Initialized);
                return Err(e);
            }
        }
        log::info!("{}: reset", inner.name());
        t.commit();
        Ok(())
    }

    fn last_error(&self) -> Option<String> {
        self.inner.lifecycle.last_error()
    }
}

impl PacketConsumer for Decoder {
    fn packet_input(&self) -> Option<PadId> {
        *self.inner.input.lock()
    }
}

impl FrameProducer for Decoder {
    fn frame_output(&self) -> Option<PadId> {
        self.inner.output()
    }
}

impl Drop for Decoder {
    fn drop(&mut self) {
        if self.phase() != Phase::Closed {
            let _ = self.close();
        }
    }
}

#[cfg(test)]
#[path = "decoder_test.rs"]
mod decoder_test;
