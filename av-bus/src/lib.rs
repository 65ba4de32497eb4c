//! Hardware-accelerated audio/video pipeline engine.
//!
//! Components (demuxer, decoder, frame mapper, encoder) exchange messages
//! over pads; each runs its own worker thread behind a bounded queue. The
//! [`bus::Bus`] wires them into a graph and exposes the results as streams.

pub mod backend;
pub mod bus;
pub mod clock;
pub mod component;
pub mod config;
pub mod decoder;
pub mod demuxer;
pub mod encoder;
pub mod error;
#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;
pub mod frame;
pub mod hw;
pub mod mapper;
pub mod message;
pub mod mock;
pub mod packet;
pub mod pad;
pub mod queue;
pub mod registry;
pub mod stream;

pub use bus::{Bus, ComponentRef, OutputEvent, OutputKind, OutputStream};
pub use config::PipelineConfig;
pub use error::{BackendStatus, PipelineError};
pub use registry::BackendRegistry;
