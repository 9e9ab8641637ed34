//! Error types for the ventilation bridge.
//!
//! None of these are fatal: transport and publish failures are logged and the
//! next cycle tries again, link failures only suppress publishing, and
//! validation failures leave state unchanged.

use thiserror::Error;

/// A failed Modbus transaction.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,

    #[error("transport failure: {0}")]
    Io(String),

    #[error("exception response: {0}")]
    Exception(String),

    #[error("empty response")]
    EmptyResponse,
}

/// Network link or broker session is unavailable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("network link down: {0}")]
    Link(String),

    #[error("broker session down: {0}")]
    Session(String),
}

/// Rejected operator input.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("fan mode {0} out of range (0-3 only)")]
    FanMode(u16),

    #[error("interval {0}s out of range (5-300)")]
    Interval(i64),
}

/// Failure to hand a message to the broker.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("failed to serialize payload: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to publish to {topic}: {message}")]
    Transport { topic: String, message: String },
}

/// Failure of a fan-mode write.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}
