//! Synthetic backends.
//!
//! Everything here runs without media files, drivers or a GPU: the container
//! generates packets, the decoder turns them into pooled surfaces carrying a
//! generated NV12 picture, the encoder produces one packet per frame and the
//! exporter hands surfaces out through a [`DmaBufHeap`].

use std::any::Any;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};

use crate::backend::{ContainerSource, DecoderBackend, EncoderBackend, Fetch};
use crate::error::{BackendStatus, PipelineError, Result};
use crate::frame::{CpuPlane, Frame, FrameShape};
use crate::hw::{HwDeviceType, HwFramesContext, HwSurface, NativeHandle};
use crate::mapper::dmabuf::{
    BufferHandle, DRM_FORMAT_MOD_LINEAR, ExportedPlane, ExportedSurface, FourCc, SurfaceExporter,
    SurfaceSync, SyncKind, ZeroCopyError,
};
use crate::mapper::software::{DmaBufHeap, SoftwareGpu};
use crate::mapper::{ContextToken, GpuBinding};
use crate::message::{Action, Message};
use crate::packet::Packet;
use crate::pad::{MessageConsumer, PadId};
use crate::registry::{
    BackendRegistry, ContainerDescriptor, DecoderDescriptor, EncoderDescriptor, Platform,
};
use crate::stream::{
    CodecId, PIPELINE_TIME_BASE, PixelFormat, Rational, SampleFormat, StreamDescriptor, rescale,
};

pub const SYNTHETIC_SCHEME: &str = "synthetic://";

const AUDIO_FRAME_SAMPLES: i64 = 1024;

/// The synthetic container and the mock codecs.
pub fn register(r: &mut BackendRegistry) {
    register_synthetic(r);
    register_codecs(r);
}

pub fn register_synthetic(r: &mut BackendRegistry) {
    r.register_container(ContainerDescriptor {
        name: "synthetic",
        accepts: |url| url.starts_with(SYNTHETIC_SCHEME),
        open: Arc::new(|url| {
            Ok(Box::new(SyntheticContainer::open(url)?) as Box<dyn ContainerSource>)
        }),
    });
}

pub fn register_codecs(r: &mut BackendRegistry) {
    r.register_decoder(DecoderDescriptor {
        name: "mock-decoder",
        platform: Platform::Any,
        codecs: &[
            CodecId::H264,
            CodecId::Hevc,
            CodecId::Vp8,
            CodecId::Vp9,
            CodecId::Av1,
            CodecId::Mpeg2,
            CodecId::Mpeg4,
            CodecId::Aac,
            CodecId::Opus,
            CodecId::Mp3,
        ],
        formats: &[],
        construct: Arc::new(|| Box::new(MockDecoderBackend::new(MockDecoderConfig::default()))),
    });
    r.register_encoder(EncoderDescriptor {
        name: "mock-encoder",
        platform: Platform::Any,
        codecs: &[CodecId::H264, CodecId::Hevc, CodecId::Av1],
        formats: &[],
        construct: Arc::new(|| Box::new(MockEncoderBackend::new(MockEncoderConfig::default()))),
    });
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticOptions {
    pub packets: u32,
    pub audio: bool,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl Default for SyntheticOptions {
    fn default() -> Self {
        Self {
            packets: 30,
            audio: true,
            width: 64,
            height: 48,
            fps: 30,
        }
    }
}

impl SyntheticOptions {
    /// Parses `synthetic://<name>?packets=N&audio=B&width=W&height=H&fps=F`.
    pub fn parse(url: &str) -> Result<Self> {
        let rest = url
            .strip_prefix(SYNTHETIC_SCHEME)
            .ok_or_else(|| PipelineError::NoSource(url.to_string()))?;
        let mut opts = Self::default();
        let Some((_, query)) = rest.split_once('?') else {
            return Ok(opts);
        };
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            let bad = || PipelineError::Config(format!("synthetic source: bad value {pair:?}"));
            match k {
                "packets" => opts.packets = v.parse().map_err(|_| bad())?,
                "audio" => opts.audio = v.parse().map_err(|_| bad())?,
                "width" => opts.width = v.parse().map_err(|_| bad())?,
                "height" => opts.height = v.parse().map_err(|_| bad())?,
                "fps" => opts.fps = v.parse().map_err(|_| bad())?,
                _ => log::warn!("synthetic source: unknown option {k:?}"),
            }
        }
        if opts.width == 0 || opts.height == 0 || opts.width % 2 != 0 || opts.height % 2 != 0 {
            return Err(PipelineError::UnsupportedFormat(format!(
                "synthetic source {}x{}",
                opts.width, opts.height
            )));
        }
        if opts.fps == 0 {
            return Err(PipelineError::Config("synthetic source: fps must be > 0".into()));
        }
        Ok(opts)
    }
}

/// Container producing one H.264 video stream and an optional AAC stream.
///
/// Video packets use a 1/90000 time base, audio packets 1/48000. Audio and
/// video packets alternate. Each payload starts with the little-endian
/// frame number.
pub struct SyntheticContainer {
    opts: SyntheticOptions,
    streams: Vec<StreamDescriptor>,
    next: u32,
    audio_pending: bool,
}

impl SyntheticContainer {
    pub fn open(url: &str) -> Result<Self> {
        Ok(Self::with_options(SyntheticOptions::parse(url)?))
    }

    pub fn with_options(opts: SyntheticOptions) -> Self {
        let mut streams = vec![
            StreamDescriptor::video(0, CodecId::H264, opts.width, opts.height)
                .with_frame_rate(Rational::new(opts.fps as i32, 1))
                .with_time_base(Rational::new(1, 90_000)),
        ];
        if opts.audio {
            streams.push(StreamDescriptor::audio(1, CodecId::Aac, 48_000, 2));
        }
        log::debug!("synthetic container: {} packets, {} streams", opts.packets, streams.len());
        Self {
            opts,
            streams,
            next: 0,
            audio_pending: false,
        }
    }

    fn video_ticks(&self) -> i64 {
        90_000 / self.opts.fps as i64
    }
}

impl ContainerSource for SyntheticContainer {
    fn streams(&self) -> Vec<StreamDescriptor> {
        self.streams.clone()
    }

    fn read_packet(&mut self) -> Fetch<Packet> {
        if self.audio_pending {
            self.audio_pending = false;
            let n = self.next - 1;
            let pts = n as i64 * AUDIO_FRAME_SAMPLES;
            return Fetch::Ready(
                Packet::new(1, Bytes::copy_from_slice(&n.to_le_bytes()))
                    .with_pts(Some(pts))
                    .with_dts(Some(pts))
                    .with_duration(AUDIO_FRAME_SAMPLES)
                    .with_key(true),
            );
        }
        if self.next >= self.opts.packets {
            return Fetch::EndOfStream;
        }
        let n = self.next;
        self.next += 1;
        self.audio_pending = self.opts.audio;
        let ticks = self.video_ticks();
        let pts = n as i64 * ticks;
        Fetch::Ready(
            Packet::new(0, Bytes::copy_from_slice(&n.to_le_bytes()))
                .with_pts(Some(pts))
                .with_dts(Some(pts))
                .with_duration(ticks)
                .with_key(n % 30 == 0),
        )
    }
}

/// Backend object attached to every surface of the mock decoder.
pub struct MockSurfaceData {
    /// NV12 picture, luma rows followed by interleaved chroma, pitch = width.
    pub nv12: Bytes,
    pub frame_number: u32,
}

impl NativeHandle for MockSurfaceData {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Generates a flat NV12 picture whose luma encodes the frame number.
pub fn synthetic_nv12(width: u32, height: u32, frame_number: u32) -> Bytes {
    let luma = width as usize * height as usize;
    let mut buf = vec![128u8; luma + luma / 2];
    let y = 16 + (frame_number.wrapping_mul(7) % 220) as u8;
    buf[..luma].fill(y);
    Bytes::from(buf)
}

fn frame_number(packet: &Packet) -> u32 {
    let mut le = [0u8; 4];
    let data = packet.data();
    let n = data.len().min(4);
    le[..n].copy_from_slice(&data[..n]);
    u32::from_le_bytes(le)
}

#[derive(Debug, Clone)]
pub struct MockDecoderConfig {
    /// Frames held back before the first one is released.
    pub latency: usize,
    /// Frames the backend holds at most; beyond it `submit` returns `Retry`.
    pub depth: usize,
    /// Fail with a fatal status after this many packets.
    pub fail_after: Option<u64>,
    /// Decode into pooled surfaces instead of CPU frames.
    pub hw: bool,
}

impl Default for MockDecoderConfig {
    fn default() -> Self {
        Self {
            latency: 2,
            depth: 4,
            fail_after: None,
            hw: true,
        }
    }
}

pub struct MockDecoderBackend {
    cfg: MockDecoderConfig,
    stream: Option<StreamDescriptor>,
    frames: Option<HwFramesContext>,
    pipeline: VecDeque<Frame>,
    submitted: u64,
    eos: bool,
}

impl MockDecoderBackend {
    pub fn new(mut cfg: MockDecoderConfig) -> Self {
        cfg.depth = cfg.depth.max(cfg.latency + 1);
        Self {
            cfg,
            stream: None,
            frames: None,
            pipeline: VecDeque::new(),
            submitted: 0,
            eos: false,
        }
    }

    fn decode_video(&self, stream: &StreamDescriptor, packet: &Packet) -> Option<Frame> {
        let n = frame_number(packet);
        let (w, h) = (stream.width(), stream.height());
        let nv12 = synthetic_nv12(w, h, n);
        let frame = match &self.frames {
            Some(pool) => {
                let surface = pool.acquire_with(Arc::new(MockSurfaceData {
                    nv12,
                    frame_number: n,
                }))?;
                Frame::video_hw(surface)
            }
            None => {
                let luma = w as usize * h as usize;
                Frame::video_cpu(
                    PixelFormat::Nv12,
                    w,
                    h,
                    vec![
                        CpuPlane::new(nv12.slice(..luma), w as usize),
                        CpuPlane::new(nv12.slice(luma..), w as usize),
                    ],
                )
            }
        };
        Some(frame)
    }

    fn decode_audio(stream: &StreamDescriptor) -> Frame {
        let format = stream.format().sample().unwrap_or(SampleFormat::F32p);
        let bytes = AUDIO_FRAME_SAMPLES as usize * format.bytes_per_sample();
        let planes = (0..stream.channels())
            .map(|_| CpuPlane::new(vec![0u8; bytes], bytes))
            .collect();
        Frame::audio(
            format,
            stream.sample_rate(),
            stream.channels(),
            AUDIO_FRAME_SAMPLES as usize,
            planes,
        )
    }
}

impl DecoderBackend for MockDecoderBackend {
    fn name(&self) -> &str {
        "mock-decoder"
    }

    fn hw_device_type(&self) -> Option<HwDeviceType> {
        self.cfg.hw.then_some(HwDeviceType::Mock)
    }

    fn open(&mut self, stream: &StreamDescriptor, frames: Option<&HwFramesContext>) -> Result<()> {
        if stream.is_video() && self.cfg.hw && frames.is_none() {
            return Err(PipelineError::open("mock-decoder", "no frames context attached"));
        }
        self.stream = Some(stream.clone());
        self.frames = frames.cloned();
        self.pipeline.clear();
        self.eos = false;
        Ok(())
    }

    fn submit(&mut self, packet: &Packet) -> BackendStatus {
        let Some(stream) = self.stream.clone() else {
            return BackendStatus::Fatal("decoder not open".into());
        };
        if self.eos {
            return BackendStatus::EndOfStream;
        }
        if self.cfg.fail_after.is_some_and(|n| self.submitted >= n) {
            return BackendStatus::Fatal("device lost".into());
        }
        if self.pipeline.len() >= self.cfg.depth {
            return BackendStatus::Retry;
        }
        let frame = if stream.is_video() {
            match self.decode_video(&stream, packet) {
                Some(f) => f,
                // Surface pool exhausted until downstream releases a frame.
                None => return BackendStatus::Retry,
            }
        } else {
            Self::decode_audio(&stream)
        };
        self.pipeline
            .push_back(frame.with_pts(packet.pts()).with_duration(packet.duration()));
        self.submitted += 1;
        BackendStatus::Ok
    }

    fn submit_eos(&mut self) -> BackendStatus {
        self.eos = true;
        BackendStatus::Ok
    }

    fn receive(&mut self) -> Fetch<Frame> {
        if self.pipeline.len() > self.cfg.latency || (self.eos && !self.pipeline.is_empty()) {
            return match self.pipeline.pop_front() {
                Some(f) => Fetch::Ready(f),
                None => Fetch::Pending,
            };
        }
        if self.eos {
            Fetch::EndOfStream
        } else {
            Fetch::Pending
        }
    }

    fn flush(&mut self) {
        self.pipeline.clear();
        self.eos = false;
    }

    fn close(&mut self) {
        self.pipeline.clear();
        self.frames = None;
        self.stream = None;
    }
}

#[derive(Debug, Clone)]
pub struct MockEncoderConfig {
    pub latency: usize,
    pub depth: usize,
    pub hw: bool,
}

impl Default for MockEncoderConfig {
    fn default() -> Self {
        Self {
            latency: 1,
            depth: 4,
            hw: true,
        }
    }
}

pub struct MockEncoderBackend {
    cfg: MockEncoderConfig,
    output: Option<StreamDescriptor>,
    gop: u32,
    shape: Option<FrameShape>,
    pipeline: VecDeque<Packet>,
    count: u64,
    eos: bool,
}

impl MockEncoderBackend {
    pub fn new(mut cfg: MockEncoderConfig) -> Self {
        cfg.depth = cfg.depth.max(cfg.latency + 1);
        Self {
            cfg,
            output: None,
            gop: 30,
            shape: None,
            pipeline: VecDeque::new(),
            count: 0,
            eos: false,
        }
    }
}

impl EncoderBackend for MockEncoderBackend {
    fn name(&self) -> &str {
        "mock-encoder"
    }

    fn hw_device_type(&self) -> Option<HwDeviceType> {
        self.cfg.hw.then_some(HwDeviceType::Mock)
    }

    fn open(&mut self, output: &StreamDescriptor, gop: u32) -> Result<()> {
        self.output = Some(output.clone());
        self.gop = gop.max(1);
        self.shape = None;
        self.pipeline.clear();
        self.count = 0;
        self.eos = false;
        Ok(())
    }

    fn prepare(&mut self, shape: &FrameShape, frames: Option<&HwFramesContext>) -> Result<()> {
        if self.cfg.hw && frames.is_none() {
            return Err(PipelineError::open("mock-encoder", "no frames context attached"));
        }
        if let Some(pool) = frames {
            let c = pool.config();
            if (c.width, c.height) != (shape.width, shape.height) {
                return Err(PipelineError::UnsupportedFormat(format!(
                    "frames pool {}x{} for {}x{} input",
                    c.width, c.height, shape.width, shape.height
                )));
            }
        }
        self.shape = Some(*shape);
        Ok(())
    }

    fn submit(&mut self, frame: &Frame, pts: i64) -> BackendStatus {
        let (Some(output), Some(shape)) = (&self.output, &self.shape) else {
            return BackendStatus::Fatal("encoder not prepared".into());
        };
        if (frame.width(), frame.height()) != (shape.width, shape.height) {
            return BackendStatus::Fatal(format!(
                "frame {}x{} does not match {}x{}",
                frame.width(),
                frame.height(),
                shape.width,
                shape.height
            ));
        }
        if self.eos {
            return BackendStatus::EndOfStream;
        }
        if self.pipeline.len() >= self.cfg.depth {
            return BackendStatus::Retry;
        }
        let n = self.count;
        let duration = output
            .frame_duration_us()
            .map(|d| rescale(d, PIPELINE_TIME_BASE, output.time_base()))
            .unwrap_or(0);
        let mut data = Vec::with_capacity(16);
        data.extend_from_slice(&(n as u32).to_le_bytes());
        data.extend_from_slice(&shape.width.to_le_bytes());
        data.extend_from_slice(&shape.height.to_le_bytes());
        self.pipeline.push_back(
            Packet::new(0, data)
                .with_pts(Some(pts))
                .with_duration(duration)
                .with_key(n % self.gop as u64 == 0),
        );
        self.count += 1;
        BackendStatus::Ok
    }

    fn submit_eos(&mut self) -> BackendStatus {
        self.eos = true;
        BackendStatus::Ok
    }

    fn receive(&mut self) -> Fetch<Packet> {
        if self.pipeline.len() > self.cfg.latency || (self.eos && !self.pipeline.is_empty()) {
            return match self.pipeline.pop_front() {
                Some(p) => Fetch::Ready(p),
                None => Fetch::Pending,
            };
        }
        if self.eos {
            Fetch::EndOfStream
        } else {
            Fetch::Pending
        }
    }

    fn close(&mut self) {
        self.pipeline.clear();
        self.output = None;
        self.shape = None;
    }
}

#[derive(Debug, Default)]
pub struct ExporterStats {
    pub syncs: AtomicU64,
    pub exports: AtomicU64,
    pub failed_exports: AtomicU64,
    pub downloads: AtomicU64,
}

/// Exports mock surfaces as one buffer with an R8 luma plane and a GR88
/// chroma plane.
pub struct MockExporter {
    heap: DmaBufHeap,
    fail_export: Arc<AtomicBool>,
    stats: Arc<ExporterStats>,
}

impl MockExporter {
    pub fn new(heap: DmaBufHeap) -> Self {
        Self {
            heap,
            fail_export: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(ExporterStats::default()),
        }
    }

    /// Switch that makes every export fail while set.
    pub fn export_failure(&self) -> Arc<AtomicBool> {
        self.fail_export.clone()
    }

    pub fn stats(&self) -> Arc<ExporterStats> {
        self.stats.clone()
    }

    fn data(surface: &HwSurface) -> std::result::Result<&MockSurfaceData, ZeroCopyError> {
        surface.native::<MockSurfaceData>().ok_or_else(|| {
            ZeroCopyError::NotAvailable(format!("{:?} is not a mock surface", surface.format()))
        })
    }
}

impl SurfaceExporter for MockExporter {
    fn name(&self) -> &str {
        "mock-exporter"
    }

    fn sync_surface(
        &mut self,
        surface: &HwSurface,
    ) -> std::result::Result<SurfaceSync, ZeroCopyError> {
        Self::data(surface)?;
        self.stats.syncs.fetch_add(1, Ordering::Relaxed);
        Ok(SurfaceSync::new(surface, SyncKind::Fence))
    }

    fn export(
        &mut self,
        surface: &HwSurface,
        sync: SurfaceSync,
    ) -> std::result::Result<ExportedSurface, ZeroCopyError> {
        if !sync.covers(surface) {
            return Err(ZeroCopyError::Export("sync proof issued for another surface".into()));
        }
        if self.fail_export.load(Ordering::Relaxed) {
            self.stats.failed_exports.fetch_add(1, Ordering::Relaxed);
            return Err(ZeroCopyError::Export("export disabled".into()));
        }
        let data = Self::data(surface)?;
        if surface.sw_format() != PixelFormat::Nv12 {
            return Err(ZeroCopyError::FormatMismatch(format!(
                "cannot export {:?} surfaces",
                surface.sw_format()
            )));
        }
        let (w, h) = (surface.width(), surface.height());
        let heap = self.heap.clone();
        let fd = heap.allocate(data.nv12.clone());
        let object = BufferHandle::new(fd, data.nv12.len(), move |fd| heap.close(fd));
        self.stats.exports.fetch_add(1, Ordering::Relaxed);
        Ok(ExportedSurface {
            objects: vec![object],
            planes: vec![
                ExportedPlane {
                    object: 0,
                    fourcc: FourCc::R8,
                    width: w,
                    height: h,
                    offset: 0,
                    pitch: w,
                },
                ExportedPlane {
                    object: 0,
                    fourcc: FourCc::GR88,
                    width: w / 2,
                    height: h / 2,
                    offset: w * h,
                    pitch: w,
                },
            ],
            modifier: DRM_FORMAT_MOD_LINEAR,
            sync: sync.kind(),
        })
    }

    fn download(&mut self, surface: &HwSurface) -> std::result::Result<Frame, ZeroCopyError> {
        let data = Self::data(surface).map_err(|e| ZeroCopyError::Download(e.to_string()))?;
        let (w, h) = (surface.width(), surface.height());
        let luma = w as usize * h as usize;
        if data.nv12.len() < luma + luma / 2 {
            return Err(ZeroCopyError::Download("surface shorter than its shape".into()));
        }
        self.stats.downloads.fetch_add(1, Ordering::Relaxed);
        Ok(Frame::video_cpu(
            PixelFormat::Nv12,
            w,
            h,
            vec![
                CpuPlane::new(data.nv12.slice(..luma), w as usize),
                CpuPlane::new(data.nv12.slice(luma..), w as usize),
            ],
        ))
    }
}

/// Headless rendering: the software GPU importing from the same heap the mock
/// exporter allocates into.
pub fn software_binding() -> GpuBinding {
    let heap = DmaBufHeap::new();
    GpuBinding::new(
        ContextToken::new(Box::new(SoftwareGpu::new(heap.clone()))),
        Box::new(MockExporter::new(heap)),
    )
}

/// Input-pad consumer that records every message it receives.
#[derive(Default)]
pub struct MessageRecorder {
    messages: Mutex<Vec<(PadId, Message)>>,
    cv: Condvar,
}

impl MessageRecorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn messages(&self) -> Vec<(PadId, Message)> {
        self.messages.lock().clone()
    }

    pub fn actions(&self) -> Vec<Action> {
        self.messages.lock().iter().map(|(_, m)| m.action()).collect()
    }

    pub fn count(&self, action: Action) -> usize {
        self.messages
            .lock()
            .iter()
            .filter(|(_, m)| m.action() == action)
            .count()
    }

    /// Waits until `pred` holds over the recorded messages. Returns whether it did.
    pub fn wait_until<F>(&self, timeout: Duration, pred: F) -> bool
    where
        F: Fn(&[(PadId, Message)]) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut messages = self.messages.lock();
        while !pred(&messages) {
            if self.cv.wait_until(&mut messages, deadline).timed_out() {
                return pred(&messages);
            }
        }
        true
    }

    pub fn wait_for(&self, action: Action, n: usize, timeout: Duration) -> bool {
        self.wait_until(timeout, |m| {
            m.iter().filter(|(_, m)| m.action() == action).count() >= n
        })
    }

    pub fn clear(&self) {
        self.messages.lock().clear();
    }
}

impl MessageConsumer for MessageRecorder {
    fn consume(&self, pad: PadId, message: Message) {
        self.messages.lock().push((pad, message));
        self.cv.notify_all();
    }
}

#[cfg(test)]
#[path = "mock_test.rs"]
mod mock_test;
