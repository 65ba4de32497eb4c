//! Rendering context ownership.
//!
//! A [`GpuContext`] is wrapped in a [`ContextToken`], a single-owner value
//! that can be moved to another thread but not shared. Calls into the
//! context go through [`CurrentContext`], obtained from the token on the
//! thread that will use it. The guard is `!Send` and releases the context
//! when dropped, so the context is never current on two threads.

use std::fmt;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};

use bytes::Bytes;

use super::dmabuf::{FourCc, ZeroCopyError};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TextureId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ImageId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TextureFormat {
    R8,
    Rg8,
    Rgba8,
}

impl TextureFormat {
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            Self::R8 => 1,
            Self::Rg8 => 2,
            Self::Rgba8 => 4,
        }
    }

    pub fn for_fourcc(fourcc: FourCc) -> Option<Self> {
        match fourcc {
            FourCc::R8 => Some(Self::R8),
            FourCc::GR88 => Some(Self::Rg8),
            FourCc::ABGR8888 => Some(Self::Rgba8),
            _ => None,
        }
    }
}

/// Fragment shader input layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShaderVariant {
    /// One RGBA texture.
    Packed,
    /// Luma texture plus interleaved chroma texture.
    Nv12,
}

impl ShaderVariant {
    pub fn texture_formats(&self) -> &'static [TextureFormat] {
        match self {
            Self::Packed => &[TextureFormat::Rgba8],
            Self::Nv12 => &[TextureFormat::R8, TextureFormat::Rg8],
        }
    }
}

/// Parameters of one imported plane.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageDesc {
    pub width: u32,
    pub height: u32,
    pub fourcc: FourCc,
    pub fd: i32,
    pub offset: u32,
    pub pitch: u32,
    pub modifier: u64,
}

/// Offscreen render target holding one presentable picture.
#[derive(Clone, PartialEq)]
pub struct Framebuffer {
    pub id: u64,
    pub width: u32,
    pub height: u32,
    /// RGBA pixels, when the context can read them back.
    pub contents: Option<Bytes>,
}

impl fmt::Debug for Framebuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Framebuffer")
            .field("id", &self.id)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("contents", &self.contents.as_ref().map(|c| c.len()))
            .finish()
    }
}

/// A framebuffer paired with the presentation timestamp of its frame, in µs.
#[derive(Clone, Debug, PartialEq)]
pub struct TimedFramebuffer {
    pub timestamp: i64,
    pub framebuffer: Framebuffer,
    pub zero_copy: bool,
}

pub trait GpuContext: Send {
    fn name(&self) -> &str;

    fn make_current(&mut self) -> Result<(), ZeroCopyError>;
    fn release_current(&mut self);

    fn create_texture(
        &mut self,
        format: TextureFormat,
        width: u32,
        height: u32,
    ) -> Result<TextureId, ZeroCopyError>;
    fn destroy_texture(&mut self, texture: TextureId);

    /// Allocates the vertex and index buffers of a full-screen quad.
    fn create_quad(&mut self) -> Result<(), ZeroCopyError>;

    /// Creates an image object over an exported buffer.
    fn import_image(&mut self, desc: &ImageDesc) -> Result<ImageId, ZeroCopyError>;

    /// Binds `image` as the storage of `texture`, replacing the previous binding.
    fn bind_image(&mut self, texture: TextureId, image: ImageId) -> Result<(), ZeroCopyError>;

    /// Regular texture update from CPU memory.
    fn upload(
        &mut self,
        texture: TextureId,
        data: &[u8],
        stride: usize,
    ) -> Result<(), ZeroCopyError>;

    /// Draws the quad with `variant` sampling `textures` into a new framebuffer.
    fn draw(
        &mut self,
        variant: ShaderVariant,
        textures: &[TextureId],
        width: u32,
        height: u32,
    ) -> Result<Framebuffer, ZeroCopyError>;
}

/// Exclusive ownership of a rendering context.
pub struct ContextToken {
    context: Box<dyn GpuContext>,
}

impl ContextToken {
    pub fn new(context: Box<dyn GpuContext>) -> Self {
        Self { context }
    }

    pub fn name(&self) -> &str {
        self.context.name()
    }

    /// Makes the context current on the calling thread.
    pub fn make_current(&mut self) -> Result<CurrentContext<'_>, ZeroCopyError> {
        self.context.make_current()?;
        Ok(CurrentContext {
            token: self,
            _not_send: PhantomData,
        })
    }
}

impl fmt::Debug for ContextToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextToken")
            .field("context", &self.context.name())
            .finish()
    }
}

pub struct CurrentContext<'a> {
    token: &'a mut ContextToken,
    _not_send: PhantomData<*const ()>,
}

impl Deref for CurrentContext<'_> {
    type Target = dyn GpuContext;

    fn deref(&self) -> &Self::Target {
        self.token.context.as_ref()
    }
}

impl DerefMut for CurrentContext<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.token.context.as_mut()
    }
}

impl Drop for CurrentContext<'_> {
    fn drop(&mut self) {
        self.token.context.release_current();
    }
}
