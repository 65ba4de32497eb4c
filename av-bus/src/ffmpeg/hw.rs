use std::any::Any;
use std::ptr;

use bytes::Bytes;
use ffmpeg_next::ffi;
use ffmpeg_next::frame;
use parking_lot::Mutex;

use super::{pixel_from_av, pixel_to_av};
use crate::frame::{CpuPlane, Frame};
use crate::hw::{FramesPoolConfig, HwDeviceType, NativeHandle};
use crate::mapper::ZeroCopyError;
use crate::registry::Platform;

fn av_device_type(kind: HwDeviceType) -> Option<ffi::AVHWDeviceType> {
    use ffi::AVHWDeviceType::*;
    Some(match kind {
        HwDeviceType::Vaapi => AV_HWDEVICE_TYPE_VAAPI,
        HwDeviceType::Cuda => AV_HWDEVICE_TYPE_CUDA,
        HwDeviceType::Qsv => AV_HWDEVICE_TYPE_QSV,
        HwDeviceType::VideoToolbox => AV_HWDEVICE_TYPE_VIDEOTOOLBOX,
        HwDeviceType::D3d11va => AV_HWDEVICE_TYPE_D3D11VA,
        HwDeviceType::Mock => return None,
    })
}

/// Device types worth probing on `platform`, most preferred first.
pub(crate) fn probe_order(platform: Platform) -> &'static [HwDeviceType] {
    match platform {
        Platform::Linux | Platform::Android => {
            &[HwDeviceType::Vaapi, HwDeviceType::Cuda, HwDeviceType::Qsv]
        }
        Platform::Windows => &[HwDeviceType::D3d11va, HwDeviceType::Cuda, HwDeviceType::Qsv],
        Platform::MacOs => &[HwDeviceType::VideoToolbox],
        Platform::Any => &[],
    }
}

/// Owned reference to an `AVHWDeviceContext`.
pub struct AvHwDevice {
    kind: HwDeviceType,
    buf: *mut ffi::AVBufferRef,
}

// The device context is reference counted and internally locked by libav.
unsafe impl Send for AvHwDevice {}
unsafe impl Sync for AvHwDevice {}

impl AvHwDevice {
    pub fn open(kind: HwDeviceType) -> Result<Self, ffmpeg_next::Error> {
        let av_kind = av_device_type(kind).ok_or(ffmpeg_next::Error::InvalidData)?;
        let mut buf = ptr::null_mut();
        let ret = unsafe {
            ffi::av_hwdevice_ctx_create(&mut buf, av_kind, ptr::null(), ptr::null_mut(), 0)
        };
        if ret < 0 {
            return Err(ffmpeg_next::Error::from(ret));
        }
        log::info!("opened {kind} device");
        Ok(Self { kind, buf })
    }

    pub fn kind(&self) -> HwDeviceType {
        self.kind
    }

    /// New reference for a codec context to own.
    pub(crate) fn new_ref(&self) -> *mut ffi::AVBufferRef {
        unsafe { ffi::av_buffer_ref(self.buf) }
    }
}

impl Drop for AvHwDevice {
    fn drop(&mut self) {
        unsafe { ffi::av_buffer_unref(&mut self.buf) };
    }
}

impl NativeHandle for AvHwDevice {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Surfaces libav keeps for reference frames on top of the ones handed
/// downstream.
const REFERENCE_SURFACES: usize = 20;

/// Owned reference to an `AVHWFramesContext` allocated on an [`AvHwDevice`].
pub struct AvHwFrames {
    buf: *mut ffi::AVBufferRef,
}

// Frames contexts are reference counted and immutable once initialised.
unsafe impl Send for AvHwFrames {}
unsafe impl Sync for AvHwFrames {}

impl AvHwFrames {
    /// Allocates and initialises a fixed pool of `config.pool_size` surfaces,
    /// plus the decoder's reference headroom.
    pub fn alloc(device: &AvHwDevice, config: &FramesPoolConfig) -> Result<Self, ffmpeg_next::Error> {
        let buf = unsafe { ffi::av_hwframe_ctx_alloc(device.buf) };
        if buf.is_null() {
            return Err(ffmpeg_next::Error::Other {
                errno: ffmpeg_next::util::error::ENOMEM,
            });
        }
        // Owning `buf` from here on releases it on every error path.
        let frames = Self { buf };
        let ret = unsafe {
            let ctx = (*frames.buf).data as *mut ffi::AVHWFramesContext;
            (*ctx).format = pixel_to_av(device.kind().surface_format()).into();
            (*ctx).sw_format = pixel_to_av(config.sw_format).into();
            (*ctx).width = config.width as i32;
            (*ctx).height = config.height as i32;
            (*ctx).initial_pool_size = (config.pool_size + REFERENCE_SURFACES) as i32;
            ffi::av_hwframe_ctx_init(frames.buf)
        };
        if ret < 0 {
            return Err(ffmpeg_next::Error::from(ret));
        }
        log::debug!(
            "{} frames context: {:?} {}x{}",
            device.kind(),
            config.sw_format,
            config.width,
            config.height
        );
        Ok(frames)
    }

    /// New reference for a codec context to own.
    pub(crate) fn new_ref(&self) -> *mut ffi::AVBufferRef {
        unsafe { ffi::av_buffer_ref(self.buf) }
    }
}

impl Drop for AvHwFrames {
    fn drop(&mut self) {
        unsafe { ffi::av_buffer_unref(&mut self.buf) };
    }
}

impl NativeHandle for AvHwFrames {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Decoded hardware frame attached to an [`crate::hw::HwSurface`]. The frame
/// holds libav's reference on the underlying surface until dropped.
pub struct AvSurface {
    frame: Mutex<frame::Video>,
}

impl AvSurface {
    pub fn new(frame: frame::Video) -> Self {
        Self {
            frame: Mutex::new(frame),
        }
    }

    pub fn into_frame(self) -> frame::Video {
        self.frame.into_inner()
    }

    pub fn with_frame<R>(&self, f: impl FnOnce(&frame::Video) -> R) -> R {
        f(&self.frame.lock())
    }
}

impl NativeHandle for AvSurface {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Copies a software frame into a CPU [`Frame`]. `None` for hardware or
/// unmapped pixel formats.
pub fn cpu_frame(src: &frame::Video) -> Option<Frame> {
    let format = pixel_from_av(src.format()).filter(|f| !f.is_hardware())?;
    let planes = (0..src.planes())
        .map(|i| CpuPlane::new(Bytes::copy_from_slice(src.data(i)), src.stride(i)))
        .collect();
    Some(Frame::video_cpu(format, src.width(), src.height(), planes).with_pts(src.timestamp()))
}

/// Copies a hardware frame into a system-memory libav frame.
pub(crate) fn download(src: &frame::Video) -> Result<frame::Video, ffmpeg_next::Error> {
    let mut dst = frame::Video::empty();
    let ret = unsafe { ffi::av_hwframe_transfer_data(dst.as_mut_ptr(), src.as_ptr(), 0) };
    if ret < 0 {
        return Err(ffmpeg_next::Error::from(ret));
    }
    unsafe { ffi::av_frame_copy_props(dst.as_mut_ptr(), src.as_ptr()) };
    Ok(dst)
}

/// Downloads a hardware frame into a CPU [`Frame`].
pub fn transfer_to_cpu(src: &frame::Video) -> Result<Frame, ZeroCopyError> {
    let dst = download(src).map_err(|e| ZeroCopyError::Download(e.to_string()))?;
    cpu_frame(&dst).ok_or_else(|| {
        ZeroCopyError::Download(format!("unsupported download format {:?}", dst.format()))
    })
}
