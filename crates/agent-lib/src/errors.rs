//! Error types surfaced across the agent

use thiserror::Error;

/// Configuration validation failure. Fatal before any I/O happens.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config validation error: {field} {message}")]
    Validation { field: String, message: String },
}

impl ConfigError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Machine registration failure against the control plane.
#[derive(Error, Debug)]
pub enum RegistrationError {
    #[error("registration failed: connection failed to {gateway}: {reason} (is the SSH tunnel running?)")]
    Connection { gateway: String, reason: String },

    #[error("registration failed (status 403): invalid token - ensure the token came from 'machine create'")]
    InvalidToken,

    #[error("registration failed (status 400): bad request: {body}")]
    BadRequest { body: String },

    #[error("registration failed (status {status}): unexpected response: {body}")]
    Unexpected { status: u16, body: String },
}

/// Keepalive failure. Non-fatal per tick; the orchestrator watchdog turns
/// a sustained run of failures into a terminal error.
#[derive(Error, Debug)]
pub enum KeepaliveError {
    #[error("keepalive failed (status {status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("keepalive failed: too many consecutive failures")]
    Unhealthy,
}

/// Inference subsystem failure.
#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("inference daemon not started")]
    NotStarted,

    #[error("inference daemon unavailable: {0}")]
    Unavailable(String),

    #[error("model {model} failed to load: {message}")]
    Model { model: String, message: String },

    #[error("inference rejected (status {status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("inference request has neither messages nor input")]
    NoInput,

    #[error("inference request failed: {0}")]
    Http(#[from] reqwest::Error),
}
