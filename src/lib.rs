//! Specter-Pool: a headless-browser cluster for web-application scanning
//!
//! This crate drives a pool of supervised headless browser processes to render
//! JavaScript-driven pages, enumerate their reachable DOM states, and capture
//! each state as a structured page for downstream analysis.

pub mod browser;
pub mod cluster;
pub mod config;
pub mod job;
pub mod page;
pub mod proxy;
pub mod queue;
pub mod scope;
pub mod skipstate;

use job::JobId;
use thiserror::Error;

/// Main error type for Specter-Pool operations
#[derive(Debug, Error)]
pub enum SpecterError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Queue error: {0}")]
    Queue(#[from] queue::QueueError),

    #[error("Browser error: {0}")]
    Browser(#[from] browser::BrowserError),

    #[error("Driver error: {0}")]
    Driver(#[from] browser::DriverError),

    #[error("Proxy error: {0}")]
    Proxy(#[from] proxy::ProxyError),

    #[error("Cluster already shut down")]
    AlreadyShutdown,

    #[error("Job {id} already completed")]
    AlreadyDone { id: JobId },

    #[error("Job {id} is not pending")]
    JobNotFound { id: JobId },

    #[error("No callback resolvable for job {id}")]
    CallbackRequired { id: JobId },

    #[error("Cannot load resource: {0}")]
    Load(String),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid domain pattern: {0}")]
    InvalidPattern(String),
}
