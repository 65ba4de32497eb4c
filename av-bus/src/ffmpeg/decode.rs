use std::ffi::c_void;
use std::ptr;
use std::sync::Arc;

use ffmpeg_next::codec::context::Context;
use ffmpeg_next::{ffi, frame};

use super::hw::{AvHwDevice, AvHwFrames, AvSurface, cpu_frame, probe_order};
use super::{codec_to_av, is_again, pixel_from_av, pixel_to_av, rational_to_av};
use crate::backend::{DecoderBackend, Fetch};
use crate::error::{BackendStatus, PipelineError, Result};
use crate::frame::Frame;
use crate::hw::{FramesPoolConfig, HwDeviceContext, HwDeviceType, HwFramesContext};
use crate::packet::Packet;
use crate::registry::{Platform, hw_decoder_names};
use crate::stream::{CodecId, PIPELINE_TIME_BASE, StreamDescriptor};

const NAME: &str = "libavcodec";

/// Named hardware decoder for `codec`, if one is compiled into libavcodec.
fn find_hw_decoder(codec: CodecId) -> Option<ffmpeg_next::Codec> {
    hw_decoder_names(codec).iter().find_map(|name| {
        let found = ffmpeg_next::decoder::find_by_name(name);
        if found.is_some() {
            log::info!("found hardware decoder: {name}");
        }
        found
    })
}

/// Picks the device's surface format when libav offers it, else lets libav
/// choose a software format.
unsafe extern "C" fn pick_hw_format(
    ctx: *mut ffi::AVCodecContext,
    formats: *const ffi::AVPixelFormat,
) -> ffi::AVPixelFormat {
    unsafe {
        let want = (*ctx).opaque as isize as i32;
        let mut p = formats;
        while *p != ffi::AVPixelFormat::AV_PIX_FMT_NONE {
            if *p as i32 == want {
                return *p;
            }
            p = p.add(1);
        }
        log::warn!("hardware surface format not offered; decoding to system memory");
        ffi::avcodec_default_get_format(ctx, formats)
    }
}

unsafe fn set_extradata(ctx: *mut ffi::AVCodecContext, data: &[u8]) -> Result<()> {
    let padded = data.len() + ffi::AV_INPUT_BUFFER_PADDING_SIZE as usize;
    unsafe {
        let buf = ffi::av_mallocz(padded) as *mut u8;
        if buf.is_null() {
            return Err(PipelineError::open(NAME, "extradata allocation failed"));
        }
        ptr::copy_nonoverlapping(data.as_ptr(), buf, data.len());
        (*ctx).extradata = buf;
        (*ctx).extradata_size = data.len() as i32;
    }
    Ok(())
}

fn open_decoder(
    codec: ffmpeg_next::Codec,
    stream: &StreamDescriptor,
    device: Option<&AvHwDevice>,
    frames: Option<&AvHwFrames>,
) -> Result<ffmpeg_next::decoder::Video> {
    let mut ctx = Context::new_with_codec(codec);
    unsafe {
        let raw = ctx.as_mut_ptr();
        (*raw).width = stream.width() as i32;
        (*raw).height = stream.height() as i32;
        (*raw).pkt_timebase = rational_to_av(PIPELINE_TIME_BASE).into();
        if !stream.extradata().is_empty() {
            set_extradata(raw, stream.extradata())?;
        }
        if let Some(dev) = device {
            let surface = ffi::AVPixelFormat::from(pixel_to_av(dev.kind().surface_format()));
            (*raw).hw_device_ctx = dev.new_ref();
            if let Some(frames) = frames {
                (*raw).hw_frames_ctx = frames.new_ref();
            }
            (*raw).opaque = surface as i32 as isize as *mut c_void;
            (*raw).get_format = Some(pick_hw_format);
        }
    }
    ctx.decoder()
        .open_as(codec)
        .and_then(|opened| opened.video())
        .map_err(|e| PipelineError::open(NAME, e.to_string()))
}

/// Video decoder over libavcodec. Decodes on the first hardware device that
/// opens on this platform, otherwise on a named hardware decoder or in
/// software.
pub struct AvDecoderBackend {
    name: String,
    probed: Option<AvHwDevice>,
    frames: Option<HwFramesContext>,
    decoder: Option<ffmpeg_next::decoder::Video>,
    /// Decoded frame waiting for a free surface slot.
    pending: Option<frame::Video>,
}

// The codec context is only touched under the owning component's lock.
unsafe impl Send for AvDecoderBackend {}

impl AvDecoderBackend {
    pub fn new() -> Self {
        let probed = probe_order(Platform::current())
            .iter()
            .find_map(|kind| match AvHwDevice::open(*kind) {
                Ok(device) => Some(device),
                Err(e) => {
                    log::debug!("{kind} device unavailable: {e}");
                    None
                }
            });
        Self {
            name: NAME.to_string(),
            probed,
            frames: None,
            decoder: None,
            pending: None,
        }
    }

    fn wrap_hw(&mut self, frame: frame::Video) -> Fetch<Frame> {
        let Some(pool) = self.frames.as_ref() else {
            return Fetch::Fatal("hardware frame without a frames context".to_string());
        };
        if pool.available() == 0 {
            self.pending = Some(frame);
            return Fetch::Pending;
        }
        let pts = frame.timestamp();
        let native = Arc::new(AvSurface::new(frame));
        match pool.acquire_with(native.clone()) {
            Some(surface) => Fetch::Ready(Frame::video_hw(surface).with_pts(pts)),
            None => {
                self.pending = Arc::try_unwrap(native).ok().map(AvSurface::into_frame);
                Fetch::Pending
            }
        }
    }
}

impl Default for AvDecoderBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DecoderBackend for AvDecoderBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn hw_device_type(&self) -> Option<HwDeviceType> {
        self.probed.as_ref().map(|d| d.kind())
    }

    fn create_device(&mut self, kind: HwDeviceType) -> Result<HwDeviceContext> {
        let device = match self.probed.take() {
            Some(d) if d.kind() == kind => d,
            other => {
                self.probed = other;
                AvHwDevice::open(kind)
                    .map_err(|e| PipelineError::DeviceLost(format!("{kind}: {e}")))?
            }
        };
        Ok(HwDeviceContext::with_native(kind, Box::new(device)))
    }

    fn create_frames(
        &mut self,
        device: &HwDeviceContext,
        config: FramesPoolConfig,
    ) -> Result<HwFramesContext> {
        let Some(av_device) = device.native::<AvHwDevice>() else {
            return HwFramesContext::new(device, config);
        };
        let frames = AvHwFrames::alloc(av_device, &config).map_err(|e| {
            PipelineError::open(NAME, format!("{} frames context: {e}", device.device_type()))
        })?;
        HwFramesContext::with_native(device, config, Box::new(frames))
    }

    fn open(&mut self, stream: &StreamDescriptor, frames: Option<&HwFramesContext>) -> Result<()> {
        let id = codec_to_av(stream.codec());
        let device = frames.and_then(|f| f.device().native::<AvHwDevice>());
        let av_frames = frames.and_then(|f| f.native::<AvHwFrames>());
        let mut codecs = Vec::new();
        if device.is_none() {
            codecs.extend(find_hw_decoder(stream.codec()));
        }
        codecs.extend(ffmpeg_next::decoder::find(id));
        if codecs.is_empty() {
            return Err(PipelineError::open(
                NAME,
                format!("no decoder for {}", stream.codec()),
            ));
        }

        let mut last = String::new();
        for codec in codecs {
            match open_decoder(codec, stream, device, av_frames) {
                Ok(decoder) => {
                    log::info!("decoder opened: {}", codec.name());
                    self.name = codec.name().to_string();
                    self.decoder = Some(decoder);
                    self.frames = frames.cloned();
                    self.pending = None;
                    return Ok(());
                }
                Err(e) => {
                    log::warn!("decoder {} failed: {e}, trying next", codec.name());
                    last = format!("{}: {e}", codec.name());
                }
            }
        }
        Err(PipelineError::open(NAME, last))
    }

    fn submit(&mut self, packet: &Packet) -> BackendStatus {
        let Some(decoder) = self.decoder.as_mut() else {
            return BackendStatus::Fatal("decoder not open".to_string());
        };
        let mut av = ffmpeg_next::Packet::copy(packet.data());
        av.set_pts(packet.pts());
        av.set_dts(packet.dts());
        av.set_duration(packet.duration());
        if packet.is_key() {
            av.set_flags(ffmpeg_next::packet::Flags::KEY);
        }
        match decoder.send_packet(&av) {
            Ok(()) => BackendStatus::Ok,
            Err(e) if is_again(&e) => BackendStatus::Retry,
            Err(ffmpeg_next::Error::Eof) => BackendStatus::EndOfStream,
            Err(ffmpeg_next::Error::InvalidData) => {
                log::warn!("{}: corrupt packet skipped", self.name);
                BackendStatus::Ok
            }
            Err(e) => BackendStatus::Fatal(format!("{}: {e}", self.name)),
        }
    }

    fn submit_eos(&mut self) -> BackendStatus {
        let Some(decoder) = self.decoder.as_mut() else {
            return BackendStatus::Fatal("decoder not open".to_string());
        };
        match decoder.send_eof() {
            Ok(()) | Err(ffmpeg_next::Error::Eof) => BackendStatus::Ok,
            Err(e) if is_again(&e) => BackendStatus::Retry,
            Err(e) => BackendStatus::Fatal(format!("{}: {e}", self.name)),
        }
    }

    fn receive(&mut self) -> Fetch<Frame> {
        let frame = match self.pending.take() {
            Some(frame) => frame,
            None => {
                let Some(decoder) = self.decoder.as_mut() else {
                    return Fetch::Fatal("decoder not open".to_string());
                };
                let mut frame = frame::Video::empty();
                match decoder.receive_frame(&mut frame) {
                    Ok(()) => frame,
                    Err(e) if is_again(&e) => return Fetch::Pending,
                    Err(ffmpeg_next::Error::Eof) => return Fetch::EndOfStream,
                    Err(e) => return Fetch::Fatal(format!("{}: {e}", self.name)),
                }
            }
        };
        if pixel_from_av(frame.format()).is_some_and(|f| f.is_hardware()) {
            return self.wrap_hw(frame);
        }
        match cpu_frame(&frame) {
            Some(f) => Fetch::Ready(f),
            None => Fetch::Fatal(format!("unsupported frame format {:?}", frame.format())),
        }
    }

    fn flush(&mut self) {
        self.pending = None;
        if let Some(decoder) = self.decoder.as_mut() {
            decoder.flush();
        }
    }

    fn close(&mut self) {
        self.pending = None;
        self.decoder = None;
        self.frames = None;
    }
}
