//! Error types for each layer of the core.
//!
//! Webhook delivery failures are deliberately absent: they are recorded on the
//! delivery log entry and never surface to the caller.

use crate::types::TicketStatus;
use thiserror::Error;

/// SLA policy configuration errors. Only raised when policies are written.
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("{field} must be a positive number of hours, got {value}")]
    InvalidHours { field: &'static str, value: f64 },

    #[error("SLA policy name already exists: {0}")]
    DuplicateName(String),

    #[error("SLA policy name must not be empty")]
    EmptyName,

    #[error("SLA policy not found: {0}")]
    NotFound(String),

    #[error("cannot delete SLA policy {0}: it is in use by tickets")]
    InUse(String),
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid webhook url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("webhook must subscribe to at least one event")]
    NoEvents,

    #[error("webhook not found: {0}")]
    NotFound(String),
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("illegal status transition: {from} -> {to}")]
    IllegalTransition {
        from: TicketStatus,
        to: TicketStatus,
    },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("store serialization failed: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("ticket not found: {0}")]
    TicketNotFound(String),

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration error: {0}")]
    Figment(#[from] figment::Error),

    #[error("invalid configuration value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

