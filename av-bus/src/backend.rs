//! Narrow interfaces the components drive. A concrete backend implements
//! exactly one of them; selection happens in [`crate::registry`].

use crate::error::{BackendStatus, Result};
use crate::frame::{Frame, FrameShape};
use crate::hw::{FramesPoolConfig, HwDeviceContext, HwDeviceType, HwFramesContext};
use crate::packet::Packet;
use crate::stream::StreamDescriptor;

/// Result of polling a backend for finished work.
#[derive(Debug)]
pub enum Fetch<T> {
    Ready(T),
    /// Nothing finished yet; poll again after more input.
    Pending,
    /// Fully drained after an end-of-stream submission.
    EndOfStream,
    Fatal(String),
}

/// Container demultiplexer.
pub trait ContainerSource: Send {
    fn streams(&self) -> Vec<StreamDescriptor>;
    /// Next packet with timestamps in its stream's native time base.
    fn read_packet(&mut self) -> Fetch<Packet>;
    fn close(&mut self) {}
}

/// Hardware decoder. `submit` and `receive` are called from different
/// threads, serialized by the owning component.
pub trait DecoderBackend: Send {
    fn name(&self) -> &str;

    /// Accelerator this backend decodes on; `None` for CPU decoders.
    fn hw_device_type(&self) -> Option<HwDeviceType>;

    fn create_device(&mut self, kind: HwDeviceType) -> Result<HwDeviceContext> {
        Ok(HwDeviceContext::new(kind))
    }

    fn create_frames(
        &mut self,
        device: &HwDeviceContext,
        config: FramesPoolConfig,
    ) -> Result<HwFramesContext> {
        HwFramesContext::new(device, config)
    }

    /// Opens the codec. `frames` is attached when the backend decodes on hardware.
    fn open(&mut self, stream: &StreamDescriptor, frames: Option<&HwFramesContext>) -> Result<()>;
    fn submit(&mut self, packet: &Packet) -> BackendStatus;
    fn submit_eos(&mut self) -> BackendStatus;
    fn receive(&mut self) -> Fetch<Frame>;
    /// Drops everything in flight without producing output.
    fn flush(&mut self) {}
    fn close(&mut self);
}

/// Hardware encoder. Surfaces are configured lazily by `prepare` from the
/// first frame submitted.
pub trait EncoderBackend: Send {
    fn name(&self) -> &str;
    fn hw_device_type(&self) -> Option<HwDeviceType>;

    fn create_device(&mut self, kind: HwDeviceType) -> Result<HwDeviceContext> {
        Ok(HwDeviceContext::new(kind))
    }

    fn create_frames(
        &mut self,
        device: &HwDeviceContext,
        config: FramesPoolConfig,
    ) -> Result<HwFramesContext> {
        HwFramesContext::new(device, config)
    }

    /// `gop` is the distance between key frames, in frames.
    fn open(&mut self, output: &StreamDescriptor, gop: u32) -> Result<()>;

    /// Configures the encoder for frames of `shape`. `frames` is the pool the
    /// encoder reads surfaces from, when it encodes on hardware.
    fn prepare(&mut self, shape: &FrameShape, frames: Option<&HwFramesContext>) -> Result<()>;

    /// Submits `frame` with an encoder-assigned presentation timestamp.
    fn submit(&mut self, frame: &Frame, pts: i64) -> BackendStatus;
    fn submit_eos(&mut self) -> BackendStatus;
    /// Next finished packet. Timestamps are in the output descriptor's time base.
    fn receive(&mut self) -> Fetch<Packet>;
    fn close(&mut self);
}
