use std::sync::Arc;

use ffmpeg_next::{ffi, frame};

use super::hw::{AvSurface, transfer_to_cpu};
use crate::frame::Frame;
use crate::hw::HwSurface;
use crate::mapper::{
    BufferHandle, ExportedPlane, ExportedSurface, FourCc, SurfaceExporter, SurfaceSync, SyncKind,
    ZeroCopyError,
};

const MAX_PLANES: usize = 4;
const AV_HWFRAME_MAP_READ: i32 = 1;

// Layout of libavutil's AVDRMFrameDescriptor (hwcontext_drm.h).
#[repr(C)]
struct DrmObject {
    fd: i32,
    size: usize,
    format_modifier: u64,
}

#[repr(C)]
struct DrmPlane {
    object_index: i32,
    offset: isize,
    pitch: isize,
}

#[repr(C)]
struct DrmLayer {
    format: u32,
    nb_planes: i32,
    planes: [DrmPlane; MAX_PLANES],
}

#[repr(C)]
struct DrmFrameDescriptor {
    nb_objects: i32,
    objects: [DrmObject; MAX_PLANES],
    nb_layers: i32,
    layers: [DrmLayer; MAX_PLANES],
}

struct MappedFrame(frame::Video);

// Holds only the mapping reference; never read after construction.
unsafe impl Send for MappedFrame {}
unsafe impl Sync for MappedFrame {}

fn surface_frame(surface: &HwSurface) -> Result<&AvSurface, ZeroCopyError> {
    surface.native::<AvSurface>().ok_or_else(|| {
        ZeroCopyError::NotAvailable(format!("{:?} is not a libav surface", surface.format()))
    })
}

/// Exports decoded libav surfaces as DRM PRIME objects.
#[derive(Debug, Default)]
pub struct DrmExporter;

impl DrmExporter {
    pub fn new() -> Self {
        Self
    }

    fn map(src: &frame::Video) -> Result<frame::Video, ZeroCopyError> {
        let mut dst = frame::Video::empty();
        let ret = unsafe {
            (*dst.as_mut_ptr()).format = ffi::AVPixelFormat::AV_PIX_FMT_DRM_PRIME as i32;
            ffi::av_hwframe_map(dst.as_mut_ptr(), src.as_ptr(), AV_HWFRAME_MAP_READ)
        };
        if ret < 0 {
            return Err(ZeroCopyError::Export(format!(
                "av_hwframe_map: {}",
                ffmpeg_next::Error::from(ret)
            )));
        }
        Ok(dst)
    }
}

impl SurfaceExporter for DrmExporter {
    fn name(&self) -> &str {
        "drm-prime"
    }

    fn sync_surface(&mut self, surface: &HwSurface) -> Result<SurfaceSync, ZeroCopyError> {
        // Mapping waits for the decode into the surface to complete.
        surface_frame(surface)?;
        Ok(SurfaceSync::new(surface, SyncKind::Implicit))
    }

    fn export(
        &mut self,
        surface: &HwSurface,
        sync: SurfaceSync,
    ) -> Result<ExportedSurface, ZeroCopyError> {
        if !sync.covers(surface) {
            return Err(ZeroCopyError::Export("sync proof issued for another surface".into()));
        }
        let mapped = surface_frame(surface)?.with_frame(Self::map)?;
        let desc = unsafe {
            let data = (*mapped.as_ptr()).data[0] as *const DrmFrameDescriptor;
            if data.is_null() {
                return Err(ZeroCopyError::Export("mapped frame has no descriptor".into()));
            }
            &*data
        };

        let nb_objects = (desc.nb_objects.max(0) as usize).min(MAX_PLANES);
        let nb_layers = (desc.nb_layers.max(0) as usize).min(MAX_PLANES);
        let modifier = desc.objects.first().map(|o| o.format_modifier).unwrap_or(0);
        let (width, height) = (surface.width(), surface.height());

        let mut planes = Vec::new();
        for (n, layer) in desc.layers[..nb_layers].iter().enumerate() {
            let fourcc = FourCc::from_code(layer.format);
            // Chroma layers of planar YUV are subsampled.
            let (w, h) = if n == 0 { (width, height) } else { (width / 2, height / 2) };
            let nb_planes = (layer.nb_planes.max(0) as usize).min(MAX_PLANES);
            for plane in &layer.planes[..nb_planes] {
                planes.push(ExportedPlane {
                    object: plane.object_index.max(0) as usize,
                    fourcc,
                    width: w,
                    height: h,
                    offset: plane.offset as u32,
                    pitch: plane.pitch as u32,
                });
            }
        }
        let objects_meta: Vec<(i32, usize)> = desc.objects[..nb_objects]
            .iter()
            .map(|o| (o.fd, o.size))
            .collect();

        // The descriptor's fds live as long as the mapping; every handle keeps it alive.
        let keep = Arc::new(MappedFrame(mapped));
        let objects = objects_meta
            .into_iter()
            .map(|(fd, size)| {
                let keep = keep.clone();
                BufferHandle::new(fd, size, move |_| drop(keep))
            })
            .collect();
        Ok(ExportedSurface {
            objects,
            planes,
            modifier,
            sync: sync.kind(),
        })
    }

    fn download(&mut self, surface: &HwSurface) -> Result<Frame, ZeroCopyError> {
        let frame = surface_frame(surface)?.with_frame(transfer_to_cpu)?;
        Ok(frame)
    }
}
