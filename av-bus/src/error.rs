//! Error taxonomy shared by every pipeline component.
//!
//! Backend-local conditions (busy, pool empty, end of stream) travel as
//! [`BackendStatus`] and are resolved where they occur. Anything a component
//! cannot resolve itself surfaces as a [`PipelineError`] from the lifecycle
//! transition that hit it.

use crate::component::Phase;
use crate::mapper::ZeroCopyError;
use crate::pad::PadId;
use crate::registry::Platform;
use crate::stream::{CodecId, MediaFormat};

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("{component}: invalid transition {from} -> {to}")]
    InvalidTransition {
        component: String,
        from: Phase,
        to: Phase,
    },

    #[error("no {kind} backend for platform={platform:?} codec={codec:?} format={format:?}")]
    NoBackend {
        kind: &'static str,
        platform: Platform,
        codec: CodecId,
        format: MediaFormat,
    },

    #[error("{component}: open failed: {reason}")]
    BackendOpen { component: String, reason: String },

    #[error("{component}: backend failure: {reason}")]
    Backend { component: String, reason: String },

    #[error("hardware device lost: {0}")]
    DeviceLost(String),

    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("hardware surface pool exhausted")]
    PoolExhausted,

    #[error("pad {0:?} not found")]
    PadNotFound(PadId),

    #[error("pad link rejected: {0}")]
    PadLink(String),

    #[error("queue closed")]
    QueueClosed,

    #[error("no container source accepts {0:?}")]
    NoSource(String),

    #[error(transparent)]
    ZeroCopy(#[from] ZeroCopyError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Stable numeric code, grouped by category:
    /// 1xx lifecycle, 2xx backend/driver, 3xx resources, 4xx graph, 5xx mapping, 6xx setup.
    pub fn code(&self) -> u32 {
        match self {
            Self::InvalidTransition { .. } => 100,
            Self::NoBackend { .. } => 200,
            Self::BackendOpen { .. } => 201,
            Self::Backend { .. } => 202,
            Self::DeviceLost(_) => 203,
            Self::UnsupportedFormat(_) => 204,
            Self::NoSource(_) => 205,
            Self::PoolExhausted => 300,
            Self::QueueClosed => 301,
            Self::PadNotFound(_) => 400,
            Self::PadLink(_) => 401,
            Self::ZeroCopy(_) => 500,
            Self::Config(_) => 600,
            Self::Io(_) => 601,
        }
    }

    /// Transient conditions that a worker retries in place.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::PoolExhausted)
    }

    pub(crate) fn backend(component: &str, reason: impl Into<String>) -> Self {
        Self::Backend {
            component: component.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn open(component: &str, reason: impl Into<String>) -> Self {
        Self::BackendOpen {
            component: component.to_string(),
            reason: reason.into(),
        }
    }
}

/// Outcome of handing one unit of work to a codec backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendStatus {
    /// The unit was consumed.
    Ok,
    /// The backend is transiently busy; the same unit must be offered again.
    Retry,
    /// The backend has been flushed and accepts no more input.
    EndOfStream,
    /// Device or driver failure; the owning component stops.
    Fatal(String),
}

impl BackendStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}
