//! Configuration module for Specter-Pool
//!
//! This module handles loading, parsing, and validating TOML configuration files.
//!
//! # Example
//!
//! ```no_run
//! use specter_pool::config::load_config;
//! use std::path::Path;
//!
//! let config = load_config(Path::new("config.toml")).unwrap();
//! println!("Cluster will use {} browsers", config.cluster.pool_size);
//! ```

mod parser;
mod types;
mod validation;

// Re-export types
pub use types::{
    BrowserConfig, ClusterConfig, Config, ScopeConfig, WaitForElementEntry,
};

// Re-export parser functions
pub use parser::load_config;
