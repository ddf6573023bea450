use crate::config::types::{BrowserConfig, ClusterConfig, Config, ScopeConfig};
use crate::ConfigError;

/// Validates the entire configuration
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    validate_cluster_config(&config.cluster)?;
    validate_browser_config(&config.browser)?;
    validate_scope_config(&config.scope)?;
    Ok(())
}

/// Validates cluster configuration
fn validate_cluster_config(config: &ClusterConfig) -> Result<(), ConfigError> {
    if config.pool_size < 1 || config.pool_size > 64 {
        return Err(ConfigError::Validation(format!(
            "pool_size must be between 1 and 64, got {}",
            config.pool_size
        )));
    }

    if config.job_timeout_ms < 100 {
        return Err(ConfigError::Validation(format!(
            "job_timeout_ms must be >= 100ms, got {}ms",
            config.job_timeout_ms
        )));
    }

    if config.queue_buffer_size < 1 {
        return Err(ConfigError::Validation(format!(
            "queue_buffer_size must be >= 1, got {}",
            config.queue_buffer_size
        )));
    }

    if config.spill_path.is_empty() {
        return Err(ConfigError::Validation(
            "spill_path cannot be empty".to_string(),
        ));
    }

    Ok(())
}

/// Validates browser configuration
fn validate_browser_config(config: &BrowserConfig) -> Result<(), ConfigError> {
    if config.spawn_retries < 1 {
        return Err(ConfigError::Validation(format!(
            "spawn_retries must be >= 1, got {}",
            config.spawn_retries
        )));
    }

    if config.spawn_timeout_ms < 10 {
        return Err(ConfigError::Validation(format!(
            "spawn_timeout_ms must be >= 10ms, got {}ms",
            config.spawn_timeout_ms
        )));
    }

    if config.request_timeout_ms < 10 {
        return Err(ConfigError::Validation(format!(
            "request_timeout_ms must be >= 10ms, got {}ms",
            config.request_timeout_ms
        )));
    }

    if let Some(path) = &config.executable_path {
        if path.is_empty() {
            return Err(ConfigError::Validation(
                "executable_path cannot be empty when present".to_string(),
            ));
        }
    }

    for entry in &config.wait_for_elements {
        if entry.url_pattern.is_empty() {
            return Err(ConfigError::Validation(
                "wait-for-elements url-pattern cannot be empty".to_string(),
            ));
        }
        if entry.selectors.is_empty() {
            return Err(ConfigError::Validation(format!(
                "wait-for-elements entry for '{}' has no selectors",
                entry.url_pattern
            )));
        }
    }

    Ok(())
}

/// Validates scope configuration
fn validate_scope_config(config: &ScopeConfig) -> Result<(), ConfigError> {
    if config.domains.is_empty() {
        return Err(ConfigError::Validation(
            "scope must declare at least one domain".to_string(),
        ));
    }

    for pattern in config
        .domains
        .iter()
        .chain(config.asset_domains.iter())
    {
        validate_domain_pattern(pattern)?;
    }

    Ok(())
}

/// Validates a domain pattern (exact or "*." wildcard)
fn validate_domain_pattern(pattern: &str) -> Result<(), ConfigError> {
    let base = pattern.strip_prefix("*.").unwrap_or(pattern);

    if base.is_empty() {
        return Err(ConfigError::InvalidPattern(pattern.to_string()));
    }

    // Hostnames and IPv4 literals; anything else is a config mistake
    let valid = base
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == ':');

    if !valid || base.starts_with('.') || base.ends_with('.') {
        return Err(ConfigError::InvalidPattern(pattern.to_string()));
    }

    Ok(())
}
