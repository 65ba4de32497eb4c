//! Exported surface model.
//!
//! A hardware surface is exported as one or more memory objects (DRM PRIME
//! file descriptors on Linux) plus a per-plane layout. The GPU side imports
//! each plane as an image over `(object, offset, pitch)`.

use std::fmt;

use crate::frame::Frame;
use crate::hw::HwSurface;

#[derive(Debug, thiserror::Error)]
pub enum ZeroCopyError {
    #[error("zero-copy not available: {0}")]
    NotAvailable(String),
    #[error("surface sync failed: {0}")]
    Sync(String),
    #[error("surface export failed: {0}")]
    Export(String),
    #[error("image import failed: {0}")]
    Import(String),
    #[error("texture bind failed: {0}")]
    Bind(String),
    #[error("format mismatch: {0}")]
    FormatMismatch(String),
    #[error("surface download failed: {0}")]
    Download(String),
    #[error("gpu: {0}")]
    Gpu(String),
}

/// DRM fourcc code.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCc(pub [u8; 4]);

impl FourCc {
    /// 8-bit single channel, used for luma planes.
    pub const R8: FourCc = FourCc(*b"R8  ");
    /// 8-bit two channel, used for interleaved chroma planes.
    pub const GR88: FourCc = FourCc(*b"GR88");
    pub const ABGR8888: FourCc = FourCc(*b"AB24");
    pub const ARGB8888: FourCc = FourCc(*b"AR24");
    pub const NV12: FourCc = FourCc(*b"NV12");

    pub fn code(&self) -> u32 {
        u32::from_le_bytes(self.0)
    }

    pub fn from_code(code: u32) -> Self {
        FourCc(code.to_le_bytes())
    }

    /// Bytes per pixel of a single-plane layer format.
    pub fn bytes_per_pixel(&self) -> Option<usize> {
        match *self {
            FourCc::R8 => Some(1),
            FourCc::GR88 => Some(2),
            FourCc::ABGR8888 | FourCc::ARGB8888 => Some(4),
            _ => None,
        }
    }
}

impl fmt::Debug for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0).trim_end())
    }
}

impl fmt::Display for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

pub const DRM_FORMAT_MOD_LINEAR: u64 = 0;

type Release = Box<dyn FnOnce(i32) + Send>;

/// An exported memory object. The release hook runs exactly once, on
/// `close` or drop.
pub struct BufferHandle {
    fd: i32,
    size: usize,
    release: Option<Release>,
}

impl BufferHandle {
    pub fn new(fd: i32, size: usize, release: impl FnOnce(i32) + Send + 'static) -> Self {
        Self {
            fd,
            size,
            release: Some(Box::new(release)),
        }
    }

    pub fn fd(&self) -> i32 {
        self.fd
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn close(mut self) {
        self.release_now();
    }

    fn release_now(&mut self) {
        if let Some(release) = self.release.take() {
            release(self.fd);
        }
    }
}

impl Drop for BufferHandle {
    fn drop(&mut self) {
        self.release_now();
    }
}

impl fmt::Debug for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferHandle")
            .field("fd", &self.fd)
            .field("size", &self.size)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportedPlane {
    /// Index into [`ExportedSurface::objects`].
    pub object: usize,
    pub fourcc: FourCc,
    pub width: u32,
    pub height: u32,
    pub offset: u32,
    pub pitch: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncKind {
    /// The driver's surface sync completed; visibility to the GPU import
    /// relies on implicit synchronisation of the shared buffer.
    Implicit,
    /// An explicit fence was waited on.
    Fence,
}

/// Proof that decoding into a surface has completed.
///
/// Only the exporters in this crate create one, from
/// [`SurfaceExporter::sync_surface`]. [`SurfaceExporter::export`] consumes
/// it, so a surface cannot be exported for import without going through the
/// sync first.
///
/// ```compile_fail
/// use av_bus::hw::HwSurface;
/// use av_bus::mapper::{SurfaceSync, SyncKind};
///
/// fn unsynced(surface: &HwSurface) -> SurfaceSync {
///     SurfaceSync::new(surface, SyncKind::Fence)
/// }
/// ```
#[derive(Debug)]
pub struct SurfaceSync {
    kind: SyncKind,
    slot: Option<u32>,
}

impl SurfaceSync {
    pub(crate) fn new(surface: &HwSurface, kind: SyncKind) -> Self {
        Self {
            kind,
            slot: surface.slot(),
        }
    }

    pub fn kind(&self) -> SyncKind {
        self.kind
    }

    /// Whether this proof was issued for `surface`.
    pub fn covers(&self, surface: &HwSurface) -> bool {
        self.slot == surface.slot()
    }
}

#[derive(Debug)]
pub struct ExportedSurface {
    pub objects: Vec<BufferHandle>,
    pub planes: Vec<ExportedPlane>,
    pub modifier: u64,
    pub sync: SyncKind,
}

impl ExportedSurface {
    pub fn plane_fd(&self, plane: &ExportedPlane) -> Option<i32> {
        self.objects.get(plane.object).map(|o| o.fd())
    }

    /// Closes every exported object.
    pub fn close(self) {
        for o in self.objects {
            o.close();
        }
    }
}

/// Driver side of the zero-copy handoff.
pub trait SurfaceExporter: Send {
    fn name(&self) -> &str;

    /// Waits until decoding into `surface` has completed.
    fn sync_surface(&mut self, surface: &HwSurface) -> Result<SurfaceSync, ZeroCopyError>;

    fn export(
        &mut self,
        surface: &HwSurface,
        sync: SurfaceSync,
    ) -> Result<ExportedSurface, ZeroCopyError>;

    /// Copies the surface contents into a CPU frame.
    fn download(&mut self, surface: &HwSurface) -> Result<Frame, ZeroCopyError>;
}
