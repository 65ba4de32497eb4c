//! Zero-copy frame mapper.
//!
//! Turns decoded frames into presentable framebuffers on a dedicated worker
//! that owns the rendering context. Hardware surfaces are exported, imported
//! as images and bound directly to pre-allocated textures; when that is not
//! possible the surface is downloaded, converted to RGBA and uploaded
//! instead. Zero-copy failures never stop the stream.

pub mod convert;
pub mod dmabuf;
pub mod gpu;
pub mod software;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

pub use dmabuf::{
    BufferHandle, ExportedPlane, ExportedSurface, FourCc, SurfaceExporter, SurfaceSync, SyncKind,
    ZeroCopyError,
};
pub use gpu::{
    ContextToken, Framebuffer, GpuContext, ImageDesc, ShaderVariant, TextureFormat, TextureId,
    TimedFramebuffer,
};
pub use software::{DmaBufHeap, SoftwareGpu};

use crate::component::{
    Component, ComponentEvent, EventSender, FrameConsumer, FramebufferProducer, Lifecycle,
    OutputGate, Phase, Worker, notify,
};
use crate::config::{MapperConfig, PipelineConfig};
use crate::error::{PipelineError, Result};
use crate::frame::Frame;
use crate::hw::HwSurface;
use crate::message::{Action, Message, keys};
use crate::pad::{MessageConsumer, PadGraph, PadId, PadParams, VideoPadParams};
use crate::queue::BoundedQueue;
use crate::stream::PixelFormat;

type GpuResult<T> = std::result::Result<T, ZeroCopyError>;

/// Rendering context plus the driver hook that exports its surfaces.
pub struct GpuBinding {
    pub context: ContextToken,
    pub exporter: Box<dyn SurfaceExporter>,
}

impl GpuBinding {
    pub fn new(context: ContextToken, exporter: Box<dyn SurfaceExporter>) -> Self {
        Self { context, exporter }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MapperStats {
    pub total_frames: u64,
    pub zero_copy_frames: u64,
    pub fallback_frames: u64,
}

impl MapperStats {
    pub fn zero_copy_percentage(&self) -> f64 {
        if self.total_frames == 0 {
            return 0.0;
        }
        self.zero_copy_frames as f64 * 100.0 / self.total_frames as f64
    }
}

#[derive(Default)]
struct Counters {
    total: AtomicU64,
    zero_copy: AtomicU64,
    fallback: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> MapperStats {
        MapperStats {
            total_frames: self.total.load(Ordering::Relaxed),
            zero_copy_frames: self.zero_copy.load(Ordering::Relaxed),
            fallback_frames: self.fallback.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        self.total.store(0, Ordering::Relaxed);
        self.zero_copy.store(0, Ordering::Relaxed);
        self.fallback.store(0, Ordering::Relaxed);
    }
}

/// Shader variant that samples surfaces of `format` without conversion.
pub fn zero_copy_variant(format: PixelFormat) -> Option<ShaderVariant> {
    match format {
        PixelFormat::Nv12 => Some(ShaderVariant::Nv12),
        PixelFormat::Rgba => Some(ShaderVariant::Packed),
        _ => None,
    }
}

fn plane_layout(variant: ShaderVariant, width: u32, height: u32) -> Vec<(TextureFormat, u32, u32)> {
    match variant {
        ShaderVariant::Packed => vec![(TextureFormat::Rgba8, width, height)],
        ShaderVariant::Nv12 => vec![
            (TextureFormat::R8, width, height),
            (TextureFormat::Rg8, width.div_ceil(2), height.div_ceil(2)),
        ],
    }
}

/// Textures allocated for one frame shape.
struct Targets {
    width: u32,
    height: u32,
    format: PixelFormat,
    /// Zero-copy textures, one per plane.
    planes: Option<(ShaderVariant, Vec<TextureId>)>,
    /// RGBA texture of the fallback path, created on first use.
    packed: Option<TextureId>,
}

impl Targets {
    fn create(gpu: &mut dyn GpuContext, frame: &Frame, format: PixelFormat) -> GpuResult<Self> {
        let (width, height) = (frame.width(), frame.height());
        let planes = match zero_copy_variant(format).filter(|_| frame.is_hardware()) {
            Some(variant) => {
                let mut textures = Vec::new();
                for (f, w, h) in plane_layout(variant, width, height) {
                    match gpu.create_texture(f, w, h) {
                        Ok(t) => textures.push(t),
                        Err(e) => {
                            textures.into_iter().for_each(|t| gpu.destroy_texture(t));
                            return Err(e);
                        }
                    }
                }
                Some((variant, textures))
            }
            None => None,
        };
        Ok(Self {
            width,
            height,
            format,
            planes,
            packed: None,
        })
    }

    fn fits(&self, frame: &Frame, format: PixelFormat) -> bool {
        (self.width, self.height, self.format) == (frame.width(), frame.height(), format)
    }

    fn packed(&mut self, gpu: &mut dyn GpuContext) -> GpuResult<TextureId> {
        if let Some(t) = self.packed {
            return Ok(t);
        }
        let t = gpu.create_texture(TextureFormat::Rgba8, self.width, self.height)?;
        self.packed = Some(t);
        Ok(t)
    }

    fn release(self, gpu: &mut dyn GpuContext) {
        let planes = self.planes.map(|(_, t)| t).unwrap_or_default();
        for t in planes.into_iter().chain(self.packed) {
            gpu.destroy_texture(t);
        }
    }
}

/// Exports `surface` and binds each plane to its texture.
fn map_surface(
    gpu: &mut dyn GpuContext,
    exporter: &mut dyn SurfaceExporter,
    surface: &HwSurface,
    textures: &[TextureId],
) -> GpuResult<()> {
    let sync = exporter.sync_surface(surface)?;
    let exported = exporter.export(surface, sync)?;
    if exported.planes.len() != textures.len() {
        return Err(ZeroCopyError::FormatMismatch(format!(
            "{} exported planes for {} textures",
            exported.planes.len(),
            textures.len()
        )));
    }
    for (plane, texture) in exported.planes.iter().zip(textures) {
        let fd = exported.plane_fd(plane).ok_or_else(|| {
            ZeroCopyError::Export(format!("plane refers to missing object {}", plane.object))
        })?;
        let image = gpu.import_image(&ImageDesc {
            width: plane.width,
            height: plane.height,
            fourcc: plane.fourcc,
            fd,
            offset: plane.offset,
            pitch: plane.pitch,
            modifier: exported.modifier,
        })?;
        gpu.bind_image(*texture, image)?;
    }
    // The textures own the storage now.
    exported.close();
    Ok(())
}

/// Everything the render thread owns. Handed back when the thread is joined.
struct RenderState {
    binding: GpuBinding,
    targets: Option<Targets>,
    fallback_reported: bool,
}

impl RenderState {
    fn release(&mut self) {
        let Some(targets) = self.targets.take() else {
            return;
        };
        match self.binding.context.make_current() {
            Ok(mut gpu) => targets.release(&mut *gpu),
            Err(e) => log::warn!("textures leaked, context unavailable: {e}"),
        }
    }
}

enum Item {
    Frame(Frame),
    EndOfStream,
}

struct MapperInner {
    lifecycle: Lifecycle,
    self_ref: Weak<MapperInner>,
    graph: Arc<PadGraph>,
    config: MapperConfig,

    input: Mutex<Option<PadId>>,
    output: Mutex<Option<PadId>>,
    input_params: Mutex<Option<VideoPadParams>>,

    state: Mutex<Option<RenderState>>,
    counters: Counters,

    queue: BoundedQueue<Item>,
    worker: Mutex<Option<Worker<RenderState>>>,
    cancel: Mutex<CancellationToken>,
    input_stopped: AtomicBool,
    stop_forwarded: AtomicBool,
    gate: OutputGate,
    events: Mutex<Option<EventSender>>,
}

pub struct FrameMapper {
    inner: Arc<MapperInner>,
}

impl FrameMapper {
    pub fn new(graph: Arc<PadGraph>, binding: GpuBinding, config: &PipelineConfig) -> Self {
        let inner = Arc::new_cyclic(|self_ref| MapperInner {
            lifecycle: Lifecycle::new("mapper"),
            self_ref: self_ref.clone(),
            graph,
            config: config.mapper.clone(),
            input: Mutex::new(None),
            output: Mutex::new(None),
            input_params: Mutex::new(None),
            state: Mutex::new(Some(RenderState {
                binding,
                targets: None,
                fallback_reported: false,
            })),
            counters: Counters::default(),
            queue: BoundedQueue::new(config.queue_capacity),
            worker: Mutex::new(None),
            cancel: Mutex::new(CancellationToken::new()),
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

    pub fn stats(&self) -> MapperStats {
        self.inner.counters.snapshot()
    }

    pub fn queued(&self) -> usize {
        self.inner.queue.len()
    }
}

impl MapperInner {
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

    /// Produces from the render thread unless `stop` has shut the output.
    fn produce_gated(&self, message: Message) -> bool {
        match self.output() {
            Some(pad) => self.gate.produce(&self.graph, pad, message),
            None => true,
        }
    }

    fn emit(&self, event: ComponentEvent) {
        notify(&self.events.lock(), event);
    }

    fn fail(&self, reason: String) {
        self.lifecycle.record_error(format!("render failure: {reason}"));
        self.cancel.lock().cancel();
        self.queue.close();
        self.emit(ComponentEvent::Failed {
            component: self.name().to_string(),
            error: reason,
        });
    }

    fn announce(&self, width: u32, height: u32) {
        let params = PadParams::Video(VideoPadParams {
            format: PixelFormat::Rgba,
            width,
            height,
            hw_device: None,
        });
        if let Some(out) = self.output() {
            if let Err(e) = self.graph.set_params(out, Some(params.clone())) {
                log::warn!("{}: {e}", self.name());
            }
        }
        self.produce_gated(Message::init(params));
    }

    fn spawn_worker(&self) -> Result<()> {
        let Some(me) = self.self_ref.upgrade() else {
            return Err(PipelineError::backend(self.name(), "mapper dropped"));
        };
        let Some(state) = self.state.lock().take() else {
            return Err(PipelineError::open(self.name(), "rendering context in use"));
        };
        let token = CancellationToken::new();
        *self.cancel.lock() = token.clone();
        self.queue.reopen();
        // The context travels with the thread and comes back on join.
        let worker = Worker::spawn(format!("{}-render", self.name()), move || {
            me.render_loop(state, token)
        });
        match worker {
            Ok(w) => {
                *self.worker.lock() = Some(w);
                Ok(())
            }
            Err(e) => {
                log::error!("{}: rendering context lost with its thread", self.name());
                Err(e)
            }
        }
    }

    fn halt_worker(&self) {
        self.cancel.lock().cancel();
        self.queue.close();
        let Some(worker) = self.worker.lock().take() else {
            return;
        };
        match worker.join() {
            Some(state) => *self.state.lock() = Some(state),
            None => log::error!("{}: render thread panicked, context lost", self.name()),
        }
    }

    fn render_loop(&self, mut state: RenderState, cancel: CancellationToken) -> RenderState {
        while let Ok(item) = self.queue.pop() {
            if cancel.is_cancelled() {
                break;
            }
            match item {
                Item::Frame(frame) => match self.render(&mut state, &frame) {
                    Ok(Some(fb)) => {
                        if !self.produce_gated(Message::data_framebuffer(fb)) {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        self.fail(e.to_string());
                        break;
                    }
                },
                Item::EndOfStream => {
                    log::info!(
                        "{}: end of stream, {} frames mapped",
                        self.name(),
                        self.counters.total.load(Ordering::Relaxed)
                    );
                    if let Some(_delivery) = self.gate.enter() {
                        self.forward_stop(true);
                    }
                    self.emit(ComponentEvent::EndOfStream {
                        component: self.name().to_string(),
                    });
                    break;
                }
            }
        }
        state
    }

    /// Renders one frame. `Err` means the rendering context itself is unusable.
    fn render(
        &self,
        state: &mut RenderState,
        frame: &Frame,
    ) -> GpuResult<Option<TimedFramebuffer>> {
        let Some(shape) = frame.shape() else {
            log::trace!("{}: non-video frame ignored", self.name());
            return Ok(None);
        };
        let RenderState {
            binding,
            targets,
            fallback_reported,
        } = state;
        let mut gpu = binding.context.make_current()?;

        if !targets.as_ref().is_some_and(|t| t.fits(frame, shape.format)) {
            if let Some(old) = targets.take() {
                log::info!(
                    "{}: input changed to {}x{} {:?}",
                    self.name(),
                    shape.width,
                    shape.height,
                    shape.format
                );
                old.release(&mut *gpu);
            }
            let created = Targets::create(&mut *gpu, frame, shape.format)?;
            gpu.create_quad()?;
            *targets = Some(created);
            self.announce(shape.width, shape.height);
        }
        let Some(t) = targets.as_mut() else {
            return Ok(None);
        };

        let mut zero_copy_error = None;
        if !self.config.force_fallback {
            if let (Some(surface), Some((variant, textures))) = (frame.surface(), &t.planes) {
                match map_surface(&mut *gpu, binding.exporter.as_mut(), surface, textures)
                    .and_then(|()| gpu.draw(*variant, textures, t.width, t.height))
                {
                    Ok(fb) => {
                        self.counters.total.fetch_add(1, Ordering::Relaxed);
                        self.counters.zero_copy.fetch_add(1, Ordering::Relaxed);
                        return Ok(Some(TimedFramebuffer {
                            timestamp: frame.pts().unwrap_or_default(),
                            framebuffer: fb,
                            zero_copy: true,
                        }));
                    }
                    Err(e) => zero_copy_error = Some(e),
                }
            }
        }

        if let Some(e) = zero_copy_error {
            if *fallback_reported {
                log::debug!("{}: zero-copy failed: {e}", self.name());
            } else {
                log::warn!("{}: zero-copy failed, using CPU copy: {e}", self.name());
                *fallback_reported = true;
            }
        }

        let rendered = (|| {
            let cpu;
            let source = match frame.surface() {
                Some(surface) => {
                    cpu = binding.exporter.download(surface)?;
                    &cpu
                }
                None => frame,
            };
            let rgba = convert::frame_to_rgba(source)?;
            let texture = t.packed(&mut *gpu)?;
            gpu.upload(texture, &rgba, t.width as usize * 4)?;
            gpu.draw(ShaderVariant::Packed, &[texture], t.width, t.height)
        })();
        match rendered {
            Ok(fb) => {
                self.counters.total.fetch_add(1, Ordering::Relaxed);
                self.counters.fallback.fetch_add(1, Ordering::Relaxed);
                Ok(Some(TimedFramebuffer {
                    timestamp: frame.pts().unwrap_or_default(),
                    framebuffer: fb,
                    zero_copy: false,
                }))
            }
            Err(e) => {
                log::error!(
                    "{}: frame at {:?} dropped: {e}",
                    self.name(),
                    frame.pts()
                );
                Ok(None)
            }
        }
    }
}

impl MessageConsumer for MapperInner {
    fn consume(&self, _pad: PadId, message: Message) {
        match message.action() {
            Action::Data => {
                if !self.lifecycle.phase().has_worker()
                    || self.input_stopped.load(Ordering::Acquire)
                {
                    log::trace!("{}: DATA dropped", self.name());
                    return;
                }
                let Some(frame) = message.into_frame() else {
                    log::warn!("{}: DATA without frame", self.name());
                    return;
                };
                if let Err(e) = self.queue.push(Item::Frame(frame)) {
                    log::trace!("{}: frame dropped ({e:?})", self.name());
                }
            }
            Action::Init => {
                if let Some(v) = message.params().and_then(|p| p.as_video()) {
                    *self.input_params.lock() = Some(v.clone());
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

impl Component for FrameMapper {
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
        let checked = match inner.state.lock().as_mut() {
            Some(state) => state
                .binding
                .context
                .make_current()
                .map(|_| ())
                .map_err(|e| PipelineError::open(inner.name(), e.to_string())),
            None => Err(PipelineError::open(inner.name(), "no rendering context")),
        };
        if let Err(e) = checked {
            inner.lifecycle.record_error(&e);
            return Err(e);
        }
        let input = inner.input_params.lock().clone();
        if let (Some(v), Some(out)) = (input, inner.output()) {
            inner.graph.set_params(
                out,
                Some(PadParams::Video(VideoPadParams {
                    format: PixelFormat::Rgba,
                    hw_device: None,
                    ..v
                })),
            )?;
        }
        inner.counters.reset();
        if inner.config.force_fallback {
            log::info!("{}: zero-copy disabled by configuration", inner.name());
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
        inner.spawn_worker().inspect_err(|e| inner.lifecycle.record_error(e))?;
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
        // Framebuffers the render thread is delivering land before STOP.
        let pads: Vec<PadId> = inner.output().into_iter().collect();
        inner.gate.shut(&inner.graph, &pads);
        inner.forward_stop(false);
        inner.halt_worker();
        let purged = inner.queue.purge();
        if purged > 0 {
            log::debug!("{}: {purged} queued frames discarded", inner.name());
        }
        inner.produce(Message::control(Action::Cleanup));
        let stats = inner.counters.snapshot();
        log::info!(
            "{}: stopped after {} frames, {:.1}% zero-copy",
            inner.name(),
            stats.total_frames,
            stats.zero_copy_percentage()
        );
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
        inner.halt_worker();
        if let Some(state) = inner.state.lock().as_mut() {
            state.release();
        }
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
        inner.halt_worker();
        inner.queue.purge();
        match inner.state.lock().as_mut() {
            Some(state) => {
                state.release();
                state.fallback_reported = false;
            }
            None => {
                let e = PipelineError::open(inner.name(), "rendering context lost");
                inner.lifecycle.record_error(&e);
                t.commit_as(Phase::Initialized);
                return Err(e);
            }
        }
        if from == Phase::Running {
            if let Err(e) = inner.spawn_worker() {
                inner.lifecycle.record_error(&e);
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

impl FrameConsumer for FrameMapper {
    fn frame_input(&self) -> Option<PadId> {
        *self.inner.input.lock()
    }
}

impl FramebufferProducer for FrameMapper {
    fn framebuffer_output(&self) -> Option<PadId> {
        self.inner.output()
    }
}

impl Drop for FrameMapper {
    fn drop(&mut self) {
        if self.phase() != Phase::Closed {
            let _ = self.close();
        }
    }
}

#[cfg(test)]
#[path = "mapper_test.rs"]
mod mapper_test;
