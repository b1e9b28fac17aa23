//! Error taxonomy for the bridge
//!
//! Each layer owns a small error enum; everything converts into
//! [`BridgeError`] so host entry points can use `?` throughout.

use crate::config::ConfigError;
use crate::engine::EngineError;
use crate::entity::EntityKind;
use crate::host::HostError;
use thiserror::Error;

/// Failure of a cross-thread submission.
///
/// Always reported synchronously to the submitting thread. The bridge never
/// retries; the caller decides whether this is a drop or backpressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error("executor queue is full")]
    QueueFull,

    #[error("executor has been released")]
    Released,

    #[error("platform is shut down")]
    ShutDown,
}

/// Crate-wide error type.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("host error: {0}")]
    Host(#[from] HostError),

    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("submission rejected: {0}")]
    Submit(#[from] SubmitError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("object is not a live {0:?} wrapper")]
    InvalidObject(EntityKind),

    #[error("{0:?} wrapper is not attached to a native object")]
    Detached(EntityKind),

    #[error("unknown UDP socket handle")]
    UnknownSocket,

    #[error("platform is not running")]
    NotRunning,
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, BridgeError>;
