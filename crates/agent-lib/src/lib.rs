//! Core library for the b9agent worker-side agent
//!
//! This crate provides:
//! - Shared agent state with snapshot reads
//! - Machine registration and the keepalive loop
//! - Workload pod watching
//! - Inference daemon supervision
//! - The local control API and terminal dashboard

pub mod agent;
pub mod config;
pub mod config_file;
pub mod control;
pub mod errors;
pub mod hostinfo;
pub mod inference;
pub mod keepalive;
pub mod observability;
pub mod pods;
pub mod registration;
pub mod state;
pub mod tui;

pub use agent::Agent;
pub use config::{generate_machine_id, AgentConfig};
pub use config_file::ConfigFile;
pub use errors::{ConfigError, InferenceError, KeepaliveError, RegistrationError};
pub use state::{AgentState, AgentStatus, JobInfo, JobStatus, StateSnapshot};
