//! Hardware encoder component.
//!
//! Works like [`crate::decoder`] in reverse: frames go through the bounded
//! queue to a submit worker and finished packets are pulled by a fetcher
//! thread. Hardware surfaces are configured from the first frame submitted,
//! so the encoder adopts that frame's dimensions and format. Later frames
//! must match; a different shape needs a reset.
//!
//! Presentation timestamps are assigned from a frame counter, not taken from
//! the input frames.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::backend::{EncoderBackend, Fetch};
use crate::component::{
    Component, ComponentEvent, EventSender, FrameConsumer, Lifecycle, OutputGate, PacketProducer,
    Phase, Signal, Worker, notify,
};
use crate::config::{EncoderConfig, PipelineConfig, Tuning};
use crate::error::{BackendStatus, PipelineError, Result};
use crate::frame::{CpuPlane, Frame, FrameShape};
use crate::hw::{FramesPoolConfig, HwDeviceContext, HwFramesContext};
use crate::mapper::TimedFramebuffer;
use crate::message::{Action, Message, keys};
use crate::packet::Packet;
use crate::pad::{MessageConsumer, PadGraph, PadId, PadParams};
use crate::queue::{BoundedQueue, PopError};
use crate::registry::{BackendRegistry, Platform};
use crate::stream::{MediaFormat, PIPELINE_TIME_BASE, PixelFormat, StreamDescriptor, rescale};

const FETCH_WAIT: Duration = Duration::from_millis(10);

/// How decoding timestamps are derived for packets the backend leaves without one.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DtsPolicy {
    /// `duration * (n - 0.1)`, truncated and clamped to `0..=pts`.
    #[default]
    LegacyOffset,
    EqualsPts,
}

impl DtsPolicy {
    /// Decoding timestamp of the `n`th packet.
    pub fn dts(&self, n: u64, duration: i64, pts: i64) -> i64 {
        match self {
            Self::LegacyOffset => {
                let dts = (duration as f64 * (n as f64 - 0.1)) as i64;
                dts.clamp(0, pts.max(0))
            }
            Self::EqualsPts => pts,
        }
    }
}

/// Surface layout an encoder is fed with for frames in `source` format.
pub fn pixel_format_for_encoder(source: PixelFormat, hardware: bool) -> PixelFormat {
    match source {
        PixelFormat::P010 if hardware => PixelFormat::P010,
        f if f.is_packed() || f.is_hardware() => {
            if hardware {
                PixelFormat::Nv12
            } else {
                PixelFormat::Yuv420p
            }
        }
        PixelFormat::Yuv420p if hardware => PixelFormat::Nv12,
        f => f,
    }
}

enum Item {
    Frame(Frame),
    EndOfStream,
}

/// Encoder configuration adopted from the first frame.
struct Prepared {
    shape: FrameShape,
    _device: Option<HwDeviceContext>,
    frames: Option<HwFramesContext>,
}

enum Offer {
    Status(BackendStatus),
    /// The frame cannot be encoded by the current configuration.
    Rejected(String),
}

struct Threads {
    worker: Worker<()>,
    fetcher: Worker<()>,
}

struct EncoderInner {
    lifecycle: Lifecycle,
    self_ref: Weak<EncoderInner>,
    graph: Arc<PadGraph>,
    registry: Arc<BackendRegistry>,
    config: EncoderConfig,
    tuning: Tuning,

    input: Mutex<Option<PadId>>,
    output: Mutex<Option<PadId>>,
    descriptor: Mutex<Option<StreamDescriptor>>,
    input_params: Mutex<Option<PadParams>>,

    backend: Mutex<Option<Box<dyn EncoderBackend>>>,
    prepared: Mutex<Option<Prepared>>,
    frames_in: AtomicU64,
    packets_out: AtomicU64,

    queue: BoundedQueue<Item>,
    threads: Mutex<Option<Threads>>,
    cancel: Mutex<CancellationToken>,
    submitted: Signal,
    drained: Signal,
    input_stopped: AtomicBool,
    stop_forwarded: AtomicBool,
    gate: OutputGate,
    events: Mutex<Option<EventSender>>,
}

pub struct Encoder {
    inner: Arc<EncoderInner>,
}

impl Encoder {
    pub fn new(
        graph: Arc<PadGraph>,
        registry: Arc<BackendRegistry>,
        config: &PipelineConfig,
    ) -> Self {
        Self::named("encoder", graph, registry, config)
    }

    pub fn named(
        name: impl Into<String>,
        graph: Arc<PadGraph>,
        registry: Arc<BackendRegistry>,
        config: &PipelineConfig,
    ) -> Self {
        let tuning = config.tuning();
        let inner = Arc::new_cyclic(|self_ref| EncoderInner {
            lifecycle: Lifecycle::new(name),
            self_ref: self_ref.clone(),
            graph,
            registry,
            config: config.encoder.clone(),
            tuning,
            input: Mutex::new(None),
            output: Mutex::new(None),
            descriptor: Mutex::new(None),
            input_params: Mutex::new(None),
            backend: Mutex::new(None),
            prepared: Mutex::new(None),
            frames_in: AtomicU64::new(0),
            packets_out: AtomicU64::new(0),
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

    /// Submits one frame directly to the backend, bypassing the queue.
    pub fn encode(&self, frame: &Frame) -> BackendStatus {
        match self.inner.offer(frame) {
            Offer::Status(s) => s,
            Offer::Rejected(reason) => BackendStatus::Fatal(reason),
        }
    }

    /// Descriptor of the packets this encoder emits.
    pub fn output_descriptor(&self) -> Option<StreamDescriptor> {
        self.inner.descriptor.lock().clone()
    }

    /// Frame shape the encoder was configured with, once the first frame arrived.
    pub fn configured_shape(&self) -> Option<FrameShape> {
        self.inner.prepared.lock().as_ref().map(|p| p.shape)
    }

    pub fn frames_context(&self) -> Option<HwFramesContext> {
        self.inner
            .prepared
            .lock()
            .as_ref()
            .and_then(|p| p.frames.clone())
    }

    pub fn backend_name(&self) -> Option<String> {
        self.inner
            .backend
            .lock()
            .as_ref()
            .map(|b| b.name().to_string())
    }

    /// Params of the last INIT received from upstream.
    pub fn input_params(&self) -> Option<PadParams> {
        self.inner.input_params.lock().clone()
    }

    pub fn frames_submitted(&self) -> u64 {
        self.inner.frames_in.load(Ordering::Acquire)
    }

    pub fn queued(&self) -> usize {
        self.inner.queue.len()
    }
}

/// Frame for a framebuffer whose pixels were read back.
fn framebuffer_frame(timed: TimedFramebuffer) -> Option<Frame> {
    let fb = timed.framebuffer;
    let contents = fb.contents?;
    Some(
        Frame::video_cpu(
            PixelFormat::Rgba,
            fb.width,
            fb.height,
            vec![CpuPlane::new(contents, fb.width as usize * 4)],
        )
        .with_pts(Some(timed.timestamp)),
    )
}

impl EncoderInner {
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

    /// Produces from a worker thread unless `stop` has shut the output.
    fn produce_gated(&self, message: Message) -> bool {
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

    /// Duration of one frame in the encoder time base.
    fn frame_duration(&self) -> i64 {
        rescale(1, self.config.frame_rate.invert(), self.config.time_base).max(1)
    }

    fn open_backend(&self) -> Result<()> {
        let platform = self.config.platform.unwrap_or_else(Platform::current);
        let format = self
            .config
            .pixel_format
            .map(MediaFormat::Pixel)
            .unwrap_or(MediaFormat::None);
        let mut backend = self
            .registry
            .resolve_encoder(platform, self.config.codec, format)?;

        let mut descriptor = StreamDescriptor::video(0, self.config.codec, 0, 0)
            .with_time_base(self.config.time_base)
            .with_frame_rate(self.config.frame_rate)
            .with_bit_rate(self.config.bitrate);
        if format != MediaFormat::None {
            descriptor = descriptor.with_format(format);
        }
        backend
            .open(&descriptor, self.config.gop)
            .map_err(|e| PipelineError::open(self.name(), e.to_string()))?;
        if let Some(out) = self.output() {
            self.graph
                .set_params(out, Some(PadParams::packet(descriptor.clone())))?;
        }
        log::info!(
            "{}: opened {} with {}, gop {}",
            self.name(),
            descriptor,
            backend.name(),
            self.config.gop
        );

        *self.backend.lock() = Some(backend);
        *self.descriptor.lock() = Some(descriptor);
        self.prepared.lock().take();
        self.frames_in.store(0, Ordering::Release);
        self.packets_out.store(0, Ordering::Release);
        Ok(())
    }

    fn release_backend(&self) {
        if let Some(mut backend) = self.backend.lock().take() {
            backend.close();
        }
        self.prepared.lock().take();
    }

    fn prepare(
        &self,
        backend: &mut dyn EncoderBackend,
        frame: &Frame,
        shape: FrameShape,
    ) -> Result<Prepared> {
        let mut device = None;
        let mut frames = None;
        if let Some(kind) = backend.hw_device_type() {
            match frame.frames_context() {
                // Encode straight from the decoder's surfaces.
                Some(pool) if pool.device().device_type() == kind => {
                    device = Some(pool.device().clone());
                    frames = Some(pool.clone());
                }
                _ => {
                    let d = backend.create_device(kind)?;
                    let f = backend.create_frames(
                        &d,
                        FramesPoolConfig {
                            sw_format: pixel_format_for_encoder(shape.format, true),
                            width: shape.width,
                            height: shape.height,
                            pool_size: self.config.pool_size,
                        },
                    )?;
                    device = Some(d);
                    frames = Some(f);
                }
            }
        }
        backend.prepare(&shape, frames.as_ref())?;
        Ok(Prepared {
            shape,
            _device: device,
            frames,
        })
    }

    /// Configures the backend from `frame` if needed, returning the new output
    /// params to announce.
    fn ensure_prepared(&self, frame: &Frame) -> std::result::Result<Option<PadParams>, String> {
        let Some(shape) = frame.shape() else {
            return Err("encoder accepts video frames only".to_string());
        };
        let mut backend = self.backend.lock();
        let Some(b) = backend.as_mut() else {
            return Err("encoder not open".to_string());
        };
        let mut prepared = self.prepared.lock();
        if let Some(p) = prepared.as_ref() {
            if p.shape != shape {
                return Err(format!(
                    "frame {:?} {}x{} does not match configured {:?} {}x{}; reset required",
                    shape.format, shape.width, shape.height, p.shape.format, p.shape.width,
                    p.shape.height
                ));
            }
            return Ok(None);
        }
        let p = self
            .prepare(b.as_mut(), frame, shape)
            .map_err(|e| e.to_string())?;
        let surface = pixel_format_for_encoder(shape.format, p.frames.is_some());
        log::info!(
            "{}: configured for {}x{} {:?}{}",
            self.name(),
            shape.width,
            shape.height,
            shape.format,
            p.frames
                .as_ref()
                .map(|f| format!(" on {}", f.device().device_type()))
                .unwrap_or_default()
        );
        *prepared = Some(p);

        let mut descriptor = self.descriptor.lock();
        let updated = descriptor.take().map(|d| {
            d.with_dimensions(shape.width, shape.height)
                .with_format(MediaFormat::Pixel(surface))
        });
        *descriptor = updated.clone();
        Ok(updated.map(PadParams::packet))
    }

    fn offer(&self, frame: &Frame) -> Offer {
        let announce = match self.ensure_prepared(frame) {
            Ok(a) => a,
            Err(reason) => return Offer::Rejected(reason),
        };
        if let (Some(params), Some(out)) = (announce, self.output()) {
            if let Err(e) = self.graph.set_params(out, Some(params.clone())) {
                log::warn!("{}: {e}", self.name());
            }
            self.gate.produce(&self.graph, out, Message::init(params));
        }

        let n = self.frames_in.load(Ordering::Acquire);
        let pts = n as i64 * self.frame_duration();
        let status = match self.backend.lock().as_mut() {
            Some(b) => b.submit(frame, pts),
            None => BackendStatus::Fatal("encoder not open".to_string()),
        };
        if status.is_ok() {
            self.frames_in.fetch_add(1, Ordering::AcqRel);
            self.submitted.notify();
        }
        Offer::Status(status)
    }

    /// Fills in the decoding timestamp and moves the packet to the pipeline time base.
    fn finish_packet(&self, mut packet: Packet) -> Packet {
        let n = self.packets_out.fetch_add(1, Ordering::AcqRel);
        if packet.dts().is_none() {
            if let Some(pts) = packet.pts() {
                let duration = if packet.duration() > 0 {
                    packet.duration()
                } else {
                    self.frame_duration()
                };
                let dts = self.config.dts_policy.dts(n, duration, pts);
                packet = packet.with_dts(Some(dts));
            }
        }
        packet.rescale_ts(self.config.time_base, PIPELINE_TIME_BASE);
        packet
    }

    fn spawn_threads(&self) -> Result<()> {
        let Some(me) = self.self_ref.upgrade() else {
            return Err(PipelineError::backend(self.name(), "encoder dropped"));
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
            let frame = match self.queue.pop() {
                Ok(Item::Frame(f)) => f,
                Ok(Item::EndOfStream) => {
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
                Err(PopError::Closed) | Err(PopError::Timeout) => break,
            };
            let mut wait = backoff.initial;
            loop {
                if cancel.is_cancelled() {
                    return;
                }
                let seen = self.drained.current();
                match self.offer(&frame) {
                    Offer::Status(BackendStatus::Ok) => break,
                    Offer::Status(BackendStatus::Retry) => {
                        self.submitted.notify();
                        self.drained.wait_past(seen, wait);
                        wait = backoff.next(wait);
                    }
                    Offer::Status(BackendStatus::EndOfStream) => {
                        log::debug!("{}: frame after end of stream dropped", self.name());
                        break;
                    }
                    Offer::Status(BackendStatus::Fatal(reason)) => {
                        self.fail(reason);
                        return;
                    }
                    Offer::Rejected(reason) => {
                        log::warn!("{}: frame dropped: {reason}", self.name());
                        break;
                    }
                }
            }
        }
    }

    fn fetch_loop(&self, cancel: CancellationToken) {
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
                Fetch::Ready(packet) => {
                    self.drained.notify();
                    let packet = self.finish_packet(packet);
                    if !self.produce_gated(Message::data_packet(packet)) {
                        break;
                    }
                }
                Fetch::Pending => {
                    self.submitted.wait_past(seen, FETCH_WAIT);
                }
                Fetch::EndOfStream => {
                    log::info!(
                        "{}: drained after {} packets",
                        self.name(),
                        self.packets_out.load(Ordering::Acquire)
                    );
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

impl MessageConsumer for EncoderInner {
    fn consume(&self, _pad: PadId, message: Message) {
        match message.action() {
            Action::Data => {
                if !self.lifecycle.phase().has_worker()
                    || self.input_stopped.load(Ordering::Acquire)
                {
                    log::trace!("{}: DATA dropped", self.name());
                    return;
                }
                let frame = if message.framebuffer().is_some() {
                    message.into_framebuffer().and_then(framebuffer_frame)
                } else {
                    message.into_frame()
                };
                let Some(frame) = frame else {
                    log::warn!("{}: DATA without an encodable frame", self.name());
                    return;
                };
                if let Err(e) = self.queue.push(Item::Frame(frame)) {
                    log::trace!("{}: frame dropped ({e:?})", self.name());
                }
            }
            Action::Init => {
                let Some(params) = message.params().cloned() else {
                    return;
                };
                if let (Some(v), Some(p)) = (params.as_video(), self.prepared.lock().as_ref()) {
                    if (v.width, v.height) != (p.shape.width, p.shape.height) {
                        log::warn!(
                            "{}: input changed to {}x{}; reset required",
                            self.name(),
                            v.width,
                            v.height
                        );
                    }
                }
                *self.input_params.lock() = Some(params);
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
                    log::debug!("{}: upstream stopped, {purged} frames discarded", self.name());
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

impl Component for Encoder {
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
        if let Err(e) = inner.open_backend() {
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
        // Packets the fetcher is delivering land before STOP.
        inner.shut_output();
        inner.forward_stop(false);
        inner.halt_threads();
        let purged = inner.queue.purge();
        if purged > 0 {
            log::debug!("{}: {purged} queued frames discarded", inner.name());
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
        if let Err(e) = inner.open_backend() {
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

impl FrameConsumer for Encoder {
    fn frame_input(&self) -> Option<PadId> {
        *self.inner.input.lock()
    }
}

impl PacketProducer for Encoder {
    fn packet_output(&self, _stream_index: usize) -> Option<PadId> {
        self.inner.output()
    }
}

impl Drop for Encoder {
    fn drop(&mut self) {
        if self.phase() != Phase::Closed {
            let _ = self.close();
        }
    }
}

#[cfg(test)]
#[path = "encoder_test.rs"]
mod encoder_test;
