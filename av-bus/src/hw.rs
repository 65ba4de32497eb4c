//! Hardware device and frames contexts.
//!
//! Both are reference-counted handles. Components that address the same
//! accelerator clone the handle instead of creating a second context; the
//! underlying resources are released when the last clone drops. A frames
//! context is a fixed pool: its format, size and surface count never change
//! after creation. Reconfiguring means closing every holder and creating a new
//! one.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::stream::PixelFormat;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HwDeviceType {
    Vaapi,
    Cuda,
    Qsv,
    VideoToolbox,
    D3d11va,
    Mock,
}

impl HwDeviceType {
    /// Opaque pixel format of surfaces allocated on this device type.
    pub fn surface_format(&self) -> PixelFormat {
        match self {
            Self::Vaapi => PixelFormat::Vaapi,
            Self::Cuda => PixelFormat::Cuda,
            Self::Qsv => PixelFormat::Qsv,
            Self::VideoToolbox => PixelFormat::VideoToolbox,
            Self::D3d11va => PixelFormat::D3d11,
            Self::Mock => PixelFormat::MockSurface,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Vaapi => "vaapi",
            Self::Cuda => "cuda",
            Self::Qsv => "qsv",
            Self::VideoToolbox => "videotoolbox",
            Self::D3d11va => "d3d11va",
            Self::Mock => "mock",
        }
    }
}

impl fmt::Display for HwDeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Backend-specific object attached to a context or surface.
pub trait NativeHandle: Send + Sync + 'static {
    fn as_any(&self) -> &dyn Any;
}

struct DeviceInner {
    kind: HwDeviceType,
    native: Option<Box<dyn NativeHandle>>,
}

#[derive(Clone)]
pub struct HwDeviceContext {
    inner: Arc<DeviceInner>,
}

impl HwDeviceContext {
    pub fn new(kind: HwDeviceType) -> Self {
        Self {
            inner: Arc::new(DeviceInner { kind, native: None }),
        }
    }

    pub fn with_native(kind: HwDeviceType, native: Box<dyn NativeHandle>) -> Self {
        Self {
            inner: Arc::new(DeviceInner {
                kind,
                native: Some(native),
            }),
        }
    }

    pub fn device_type(&self) -> HwDeviceType {
        self.inner.kind
    }

    pub fn native<T: 'static>(&self) -> Option<&T> {
        self.inner
            .native
            .as_deref()
            .and_then(|n| n.as_any().downcast_ref::<T>())
    }

    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    pub fn same_device(&self, other: &HwDeviceContext) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for HwDeviceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HwDeviceContext")
            .field("kind", &self.inner.kind)
            .field("refs", &self.ref_count())
            .finish()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FramesPoolConfig {
    /// CPU-side layout of the surface contents.
    pub sw_format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub pool_size: usize,
}

struct FramesInner {
    device: HwDeviceContext,
    config: FramesPoolConfig,
    free: Mutex<Vec<u32>>,
    native: Option<Box<dyn NativeHandle>>,
}

#[derive(Clone)]
pub struct HwFramesContext {
    inner: Arc<FramesInner>,
}

const EXTERNAL_SLOT: u32 = u32::MAX;

impl HwFramesContext {
    pub fn new(device: &HwDeviceContext, config: FramesPoolConfig) -> Result<Self> {
        Self::build(device, config, None)
    }

    pub fn with_native(
        device: &HwDeviceContext,
        config: FramesPoolConfig,
        native: Box<dyn NativeHandle>,
    ) -> Result<Self> {
        Self::build(device, config, Some(native))
    }

    fn build(
        device: &HwDeviceContext,
        config: FramesPoolConfig,
        native: Option<Box<dyn NativeHandle>>,
    ) -> Result<Self> {
        if config.width == 0 || config.height == 0 || config.pool_size == 0 {
            return Err(PipelineError::UnsupportedFormat(format!(
                "frames pool {}x{} x{}",
                config.width, config.height, config.pool_size
            )));
        }
        if config.sw_format.is_hardware() {
            return Err(PipelineError::UnsupportedFormat(format!(
                "frames pool sw_format {:?}",
                config.sw_format
            )));
        }
        // Slots are handed out from the back; keep index 0 first.
        let free = (0..config.pool_size as u32).rev().collect();
        log::debug!(
            "frames context on {}: {:?} {}x{} pool={}",
            device.device_type(),
            config.sw_format,
            config.width,
            config.height,
            config.pool_size
        );
        Ok(Self {
            inner: Arc::new(FramesInner {
                device: device.clone(),
                config,
                free: Mutex::new(free),
                native,
            }),
        })
    }

    pub fn device(&self) -> &HwDeviceContext {
        &self.inner.device
    }

    pub fn config(&self) -> &FramesPoolConfig {
        &self.inner.config
    }

    pub fn surface_format(&self) -> PixelFormat {
        self.inner.device.device_type().surface_format()
    }

    pub fn native<T: 'static>(&self) -> Option<&T> {
        self.inner
            .native
            .as_deref()
            .and_then(|n| n.as_any().downcast_ref::<T>())
    }

    pub fn available(&self) -> usize {
        self.inner.free.lock().len()
    }

    pub fn pool_size(&self) -> usize {
        self.inner.config.pool_size
    }

    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    pub fn same_pool(&self, other: &HwFramesContext) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Rebuilds the pool with a new layout. Only the sole holder may do this:
    /// any other clone or live surface makes it fail.
    pub fn reinit(&mut self, config: FramesPoolConfig) -> Result<()> {
        let native = match Arc::get_mut(&mut self.inner) {
            Some(inner) => inner.native.take(),
            None => {
                return Err(PipelineError::Backend {
                    component: "frames".to_string(),
                    reason: format!("reinit while shared by {} holders", self.ref_count()),
                });
            }
        };
        let device = self.inner.device.clone();
        *self = Self::build(&device, config, native)?;
        Ok(())
    }

    /// Takes a free slot from the pool, or `None` when every surface is in use.
    pub fn acquire(&self) -> Option<HwSurface> {
        self.take_slot(None)
    }

    pub fn acquire_with(&self, native: Arc<dyn NativeHandle>) -> Option<HwSurface> {
        self.take_slot(Some(native))
    }

    /// Wraps a surface the driver allocated outside the pool.
    pub fn wrap_external(&self, native: Arc<dyn NativeHandle>) -> HwSurface {
        HwSurface {
            inner: Arc::new(SurfaceInner {
                pool: self.clone(),
                slot: EXTERNAL_SLOT,
                native: Some(native),
            }),
        }
    }

    fn take_slot(&self, native: Option<Arc<dyn NativeHandle>>) -> Option<HwSurface> {
        let slot = self.inner.free.lock().pop()?;
        Some(HwSurface {
            inner: Arc::new(SurfaceInner {
                pool: self.clone(),
                slot,
                native,
            }),
        })
    }
}

impl fmt::Debug for HwFramesContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HwFramesContext")
            .field("device", &self.inner.device.device_type())
            .field("config", &self.inner.config)
            .field("available", &self.available())
            .finish()
    }
}

struct SurfaceInner {
    pool: HwFramesContext,
    slot: u32,
    native: Option<Arc<dyn NativeHandle>>,
}

impl Drop for SurfaceInner {
    fn drop(&mut self) {
        if self.slot != EXTERNAL_SLOT {
            self.pool.inner.free.lock().push(self.slot);
        }
    }
}

/// A reference to one decoded surface. Clones share the slot; it returns to
/// the pool when the last clone drops.
#[derive(Clone)]
pub struct HwSurface {
    inner: Arc<SurfaceInner>,
}

impl HwSurface {
    pub fn frames_context(&self) -> &HwFramesContext {
        &self.inner.pool
    }

    pub fn slot(&self) -> Option<u32> {
        (self.inner.slot != EXTERNAL_SLOT).then_some(self.inner.slot)
    }

    pub fn format(&self) -> PixelFormat {
        self.inner.pool.surface_format()
    }

    pub fn sw_format(&self) -> PixelFormat {
        self.inner.pool.config().sw_format
    }

    pub fn width(&self) -> u32 {
        self.inner.pool.config().width
    }

    pub fn height(&self) -> u32 {
        self.inner.pool.config().height
    }

    pub fn native<T: 'static>(&self) -> Option<&T> {
        self.inner
            .native
            .as_deref()
            .and_then(|n| n.as_any().downcast_ref::<T>())
    }
}

impl fmt::Debug for HwSurface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HwSurface")
            .field("format", &self.format())
            .field("sw_format", &self.sw_format())
            .field("slot", &self.slot())
            .finish()
    }
}

#[cfg(test)]
#[path = "hw_test.rs"]
mod hw_test;
