use serde::Deserialize;
use std::time::Duration;

/// Main configuration structure for Specter-Pool
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub cluster: ClusterConfig,
    pub browser: BrowserConfig,
    pub scope: ScopeConfig,
}

/// Cluster and scheduling configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    /// Number of browser workers in the pool
    #[serde(rename = "pool-size")]
    pub pool_size: u32,

    /// Upper bound on a single job's execution time (milliseconds)
    #[serde(rename = "job-timeout-ms")]
    pub job_timeout_ms: u64,

    /// In-memory job buffer size before the queue spills to disk
    #[serde(rename = "queue-buffer-size")]
    pub queue_buffer_size: u32,

    /// Event budget shared by all workers cooperating on one job
    #[serde(rename = "max-events-per-job")]
    pub max_events_per_job: u32,

    /// Path of the SQLite database backing queue overflow
    #[serde(rename = "spill-path")]
    pub spill_path: String,
}

impl ClusterConfig {
    /// Job timeout as a `Duration`
    pub fn job_timeout(&self) -> Duration {
        Duration::from_millis(self.job_timeout_ms)
    }
}

/// Browser process and driver configuration
#[derive(Debug, Clone, Deserialize)]
pub struct BrowserConfig {
    /// Explicit path to the headless browser executable.
    /// When absent, well-known install locations are probed.
    #[serde(rename = "executable-path")]
    pub executable_path: Option<String>,

    /// Time allowed for one spawn attempt to report readiness (milliseconds)
    #[serde(rename = "spawn-timeout-ms", default = "default_spawn_timeout_ms")]
    pub spawn_timeout_ms: u64,

    /// Number of spawn attempts before a worker slot fails permanently
    #[serde(rename = "spawn-retries", default = "default_spawn_retries")]
    pub spawn_retries: u32,

    /// Timeout applied to individual browser/network operations (milliseconds)
    #[serde(rename = "request-timeout-ms", default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Browser window width
    #[serde(default = "default_width")]
    pub width: u32,

    /// Browser window height
    #[serde(default = "default_height")]
    pub height: u32,

    /// Per-URL CSS selectors to wait for after navigation
    #[serde(rename = "wait-for-elements", default)]
    pub wait_for_elements: Vec<WaitForElementEntry>,
}

impl BrowserConfig {
    /// Spawn timeout as a `Duration`
    pub fn spawn_timeout(&self) -> Duration {
        Duration::from_millis(self.spawn_timeout_ms)
    }

    /// Request timeout as a `Duration`
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// A URL pattern paired with CSS selectors that must appear after navigation
#[derive(Debug, Clone, Deserialize)]
pub struct WaitForElementEntry {
    /// Substring matched against the navigated URL
    #[serde(rename = "url-pattern")]
    pub url_pattern: String,

    /// CSS selectors to wait for
    pub selectors: Vec<String>,
}

/// Scan scope configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ScopeConfig {
    /// Domain patterns considered in scope ("example.com" or "*.example.com")
    pub domains: Vec<String>,

    /// URL substrings that exclude a URL from scope
    #[serde(rename = "exclude-patterns", default)]
    pub exclude_patterns: Vec<String>,

    /// When non-empty, a URL must contain one of these substrings
    #[serde(rename = "include-patterns", default)]
    pub include_patterns: Vec<String>,

    /// Path substrings marking redundant resources (calendars, pagination, ...)
    #[serde(rename = "redundant-path-patterns", default)]
    pub redundant_path_patterns: Vec<String>,

    /// Maximum crawl depth; None means unbounded
    #[serde(rename = "max-depth")]
    pub max_depth: Option<u32>,

    /// Only https:// URLs are in scope when set
    #[serde(rename = "https-only", default)]
    pub https_only: bool,

    /// Asset/CDN hosts allowed even when nominally out of scope
    #[serde(rename = "asset-domains", default)]
    pub asset_domains: Vec<String>,
}

fn default_spawn_timeout_ms() -> u64 {
    60_000
}

fn default_spawn_retries() -> u32 {
    10
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_width() -> u32 {
    1600
}

fn default_height() -> u32 {
    1200
}
