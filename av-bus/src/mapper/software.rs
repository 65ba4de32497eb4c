//! Reference GPU implementation running on the CPU.
//!
//! Exported buffers live in a [`DmaBufHeap`] keyed by fake descriptors, so
//! the import/bind/close sequence can be exercised and accounted for without
//! a driver. Rendering produces real RGBA contents using the same colour
//! conversion as the fallback path.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::thread::{self, ThreadId};

use bytes::Bytes;
use parking_lot::Mutex;

use super::convert::nv12_to_rgba;
use super::dmabuf::ZeroCopyError;
use super::gpu::{
    Framebuffer, GpuContext, ImageDesc, ImageId, ShaderVariant, TextureFormat, TextureId,
};

#[derive(Default)]
struct HeapInner {
    buffers: Mutex<HashMap<i32, Bytes>>,
    next_fd: AtomicI32,
    opened: AtomicU64,
    closed: AtomicU64,
}

/// Shared table of fake buffer descriptors.
#[derive(Clone, Default)]
pub struct DmaBufHeap {
    inner: Arc<HeapInner>,
}

impl DmaBufHeap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&self, data: Bytes) -> i32 {
        let fd = self.inner.next_fd.fetch_add(1, Ordering::Relaxed) + 100;
        self.inner.buffers.lock().insert(fd, data);
        self.inner.opened.fetch_add(1, Ordering::Relaxed);
        fd
    }

    pub fn read(&self, fd: i32) -> Option<Bytes> {
        self.inner.buffers.lock().get(&fd).cloned()
    }

    pub fn close(&self, fd: i32) {
        if self.inner.buffers.lock().remove(&fd).is_some() {
            self.inner.closed.fetch_add(1, Ordering::Relaxed);
        } else {
            log::warn!("close of unknown buffer fd {fd}");
        }
    }

    /// Descriptors allocated and not yet closed.
    pub fn open_count(&self) -> usize {
        self.inner.buffers.lock().len()
    }

    pub fn total_allocated(&self) -> u64 {
        self.inner.opened.load(Ordering::Relaxed)
    }

    pub fn total_closed(&self) -> u64 {
        self.inner.closed.load(Ordering::Relaxed)
    }
}

struct Texture {
    format: TextureFormat,
    width: u32,
    height: u32,
    // Tightly packed rows.
    data: Bytes,
    image: Option<ImageId>,
}

struct Image {
    format: TextureFormat,
    width: u32,
    height: u32,
    data: Bytes,
}

pub struct SoftwareGpu {
    heap: DmaBufHeap,
    current: Option<ThreadId>,
    textures: HashMap<u32, Texture>,
    images: HashMap<u32, Image>,
    next_id: u32,
    quad: bool,
    framebuffers: u64,
}

impl SoftwareGpu {
    pub fn new(heap: DmaBufHeap) -> Self {
        Self {
            heap,
            current: None,
            textures: HashMap::new(),
            images: HashMap::new(),
            next_id: 1,
            quad: false,
            framebuffers: 0,
        }
    }

    pub fn heap(&self) -> &DmaBufHeap {
        &self.heap
    }

    fn check_current(&self) -> Result<(), ZeroCopyError> {
        if self.current != Some(thread::current().id()) {
            return Err(ZeroCopyError::Gpu("context is not current on this thread".into()));
        }
        Ok(())
    }

    fn next(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn texture(&self, id: TextureId) -> Result<&Texture, ZeroCopyError> {
        self.textures
            .get(&id.0)
            .ok_or_else(|| ZeroCopyError::Gpu(format!("unknown texture {}", id.0)))
    }
}

fn pack_rows(
    src: &[u8],
    offset: usize,
    pitch: usize,
    row_bytes: usize,
    rows: usize,
) -> Option<Vec<u8>> {
    if pitch < row_bytes {
        return None;
    }
    let mut out = Vec::with_capacity(row_bytes * rows);
    for r in 0..rows {
        let start = offset + r * pitch;
        out.extend_from_slice(src.get(start..start + row_bytes)?);
    }
    Some(out)
}

impl GpuContext for SoftwareGpu {
    fn name(&self) -> &str {
        "software"
    }

    fn make_current(&mut self) -> Result<(), ZeroCopyError> {
        let me = thread::current().id();
        match self.current {
            Some(owner) if owner != me => Err(ZeroCopyError::Gpu(
                "context is current on another thread".into(),
            )),
            _ => {
                self.current = Some(me);
                Ok(())
            }
        }
    }

    fn release_current(&mut self) {
        self.current = None;
    }

    fn create_texture(
        &mut self,
        format: TextureFormat,
        width: u32,
        height: u32,
    ) -> Result<TextureId, ZeroCopyError> {
        self.check_current()?;
        let id = self.next();
        let len = width as usize * height as usize * format.bytes_per_pixel();
        self.textures.insert(
            id,
            Texture {
                format,
                width,
                height,
                data: Bytes::from(vec![0u8; len]),
                image: None,
            },
        );
        Ok(TextureId(id))
    }

    fn destroy_texture(&mut self, texture: TextureId) {
        if let Some(t) = self.textures.remove(&texture.0) {
            if let Some(image) = t.image {
                self.images.remove(&image.0);
            }
        }
    }

    fn create_quad(&mut self) -> Result<(), ZeroCopyError> {
        self.check_current()?;
        self.quad = true;
        Ok(())
    }

    fn import_image(&mut self, desc: &ImageDesc) -> Result<ImageId, ZeroCopyError> {
        self.check_current()?;
        let format = TextureFormat::for_fourcc(desc.fourcc)
            .ok_or_else(|| ZeroCopyError::Import(format!("unsupported fourcc {}", desc.fourcc)))?;
        let buffer = self
            .heap
            .read(desc.fd)
            .ok_or_else(|| ZeroCopyError::Import(format!("bad fd {}", desc.fd)))?;
        let row_bytes = desc.width as usize * format.bytes_per_pixel();
        let data = pack_rows(
            &buffer,
            desc.offset as usize,
            desc.pitch as usize,
            row_bytes,
            desc.height as usize,
        )
        .ok_or_else(|| {
            ZeroCopyError::Import(format!(
                "plane {}x{} at {}+{} exceeds buffer of {}",
                desc.width,
                desc.height,
                desc.offset,
                desc.pitch,
                buffer.len()
            ))
        })?;
        let id = self.next();
        self.images.insert(
            id,
            Image {
                format,
                width: desc.width,
                height: desc.height,
                data: Bytes::from(data),
            },
        );
        Ok(ImageId(id))
    }

    fn bind_image(&mut self, texture: TextureId, image: ImageId) -> Result<(), ZeroCopyError> {
        self.check_current()?;
        let img = self
            .images
            .get(&image.0)
            .ok_or_else(|| ZeroCopyError::Bind(format!("unknown image {}", image.0)))?;
        let tex = self
            .textures
            .get(&texture.0)
            .ok_or_else(|| ZeroCopyError::Bind(format!("unknown texture {}", texture.0)))?;
        if tex.format != img.format || tex.width != img.width || tex.height != img.height {
            return Err(ZeroCopyError::Bind(format!(
                "image {:?} {}x{} does not fit texture {:?} {}x{}",
                img.format, img.width, img.height, tex.format, tex.width, tex.height
            )));
        }
        let data = img.data.clone();
        let previous = self.textures.get_mut(&texture.0).and_then(|t| {
            t.data = data;
            t.image.replace(image)
        });
        if let Some(old) = previous {
            self.images.remove(&old.0);
        }
        Ok(())
    }

    fn upload(
        &mut self,
        texture: TextureId,
        data: &[u8],
        stride: usize,
    ) -> Result<(), ZeroCopyError> {
        self.check_current()?;
        let tex = self.texture(texture)?;
        let row_bytes = tex.width as usize * tex.format.bytes_per_pixel();
        let packed = pack_rows(data, 0, stride, row_bytes, tex.height as usize)
            .ok_or_else(|| ZeroCopyError::Gpu("upload smaller than texture".into()))?;
        if let Some(t) = self.textures.get_mut(&texture.0) {
            t.data = Bytes::from(packed);
            if let Some(old) = t.image.take() {
                self.images.remove(&old.0);
            }
        }
        Ok(())
    }

    fn draw(
        &mut self,
        variant: ShaderVariant,
        textures: &[TextureId],
        width: u32,
        height: u32,
    ) -> Result<Framebuffer, ZeroCopyError> {
        self.check_current()?;
        if !self.quad {
            return Err(ZeroCopyError::Gpu("quad geometry not allocated".into()));
        }
        let formats = variant.texture_formats();
        if textures.len() != formats.len() {
            return Err(ZeroCopyError::Gpu(format!(
                "{variant:?} needs {} textures, got {}",
                formats.len(),
                textures.len()
            )));
        }
        let (w, h) = (width as usize, height as usize);
        let contents = match variant {
            ShaderVariant::Packed => {
                let t = self.texture(textures[0])?;
                if (t.width, t.height) != (width, height) {
                    return Err(ZeroCopyError::Gpu("texture size differs from target".into()));
                }
                t.data.clone()
            }
            ShaderVariant::Nv12 => {
                let y = self.texture(textures[0])?;
                let uv = self.texture(textures[1])?;
                let rgba = nv12_to_rgba(
                    &y.data,
                    y.width as usize,
                    &uv.data,
                    uv.width as usize * 2,
                    w,
                    h,
                )?;
                Bytes::from(rgba)
            }
        };
        self.framebuffers += 1;
        Ok(Framebuffer {
            id: self.framebuffers,
            width,
            height,
            contents: Some(contents),
        })
    }
}

#[cfg(test)]
#[path = "software_test.rs"]
mod software_test;
