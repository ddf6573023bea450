//! Scan scope classification
//!
//! Decides which URLs the proxy may let a browser touch, combining protocol,
//! domain patterns, include/exclude/redundant pattern checks, and crawl depth,
//! with an explicit allow-list override for known asset/CDN hosts that is
//! extended at runtime as captured response bodies reveal new asset hosts.

use crate::config::ScopeConfig;
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};
use url::Url;

/// Checks if a domain matches a wildcard pattern
///
/// Two pattern forms are supported:
/// 1. Exact match: "example.com" matches only "example.com"
/// 2. Wildcard match: "*.example.com" matches the bare domain and any
///    (nested) subdomain
pub fn matches_wildcard(pattern: &str, candidate: &str) -> bool {
    if let Some(base) = pattern.strip_prefix("*.") {
        candidate == base || candidate.ends_with(&format!(".{}", base))
    } else {
        candidate == pattern
    }
}

/// Why a URL fell out of scope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Protocol,
    Domain,
    Excluded,
    NotIncluded,
    Redundant,
    DepthExceeded,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Self::Protocol => "protocol",
            Self::Domain => "domain",
            Self::Excluded => "excluded",
            Self::NotIncluded => "not-included",
            Self::Redundant => "redundant",
            Self::DepthExceeded => "depth-exceeded",
        };
        write!(f, "{}", reason)
    }
}

/// Outcome of classifying a URL against the scope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeDecision {
    /// Ordinary in-scope traffic, captured and analyzed
    InScope,

    /// Allow-listed asset/CDN traffic, allowed but not analyzed
    Asset,

    /// Disallowed traffic
    OutOfScope(SkipReason),
}

impl ScopeDecision {
    /// Whether the request may proceed at all
    pub fn is_allowed(&self) -> bool {
        !matches!(self, Self::OutOfScope(_))
    }
}

/// Runtime-extensible set of asset/CDN hosts, shared across proxies
#[derive(Debug, Default)]
pub struct AssetDomains {
    hosts: Mutex<HashSet<String>>,
}

impl AssetDomains {
    pub fn new(seed: &[String]) -> Self {
        let hosts = seed.iter().map(|host| host.to_lowercase()).collect();
        Self {
            hosts: Mutex::new(hosts),
        }
    }

    /// Adds a host; returns true when it was new
    pub fn add(&self, host: &str) -> bool {
        self.hosts.lock().unwrap().insert(host.to_lowercase())
    }

    pub fn contains(&self, host: &str) -> bool {
        let hosts = self.hosts.lock().unwrap();
        hosts
            .iter()
            .any(|pattern| matches_wildcard(pattern, &host.to_lowercase()))
    }

    pub fn len(&self) -> usize {
        self.hosts.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.lock().unwrap().is_empty()
    }
}

/// Scope classifier built from [`ScopeConfig`]
#[derive(Debug, Clone)]
pub struct Scope {
    config: ScopeConfig,
    assets: Arc<AssetDomains>,
}

impl Scope {
    pub fn new(config: ScopeConfig) -> Self {
        let assets = Arc::new(AssetDomains::new(&config.asset_domains));
        Self { config, assets }
    }

    /// The shared asset allow-list (extended by proxies at runtime)
    pub fn assets(&self) -> Arc<AssetDomains> {
        Arc::clone(&self.assets)
    }

    /// Classifies a URL observed at the given crawl depth
    pub fn classify(&self, url: &Url, depth: u32) -> ScopeDecision {
        let host = match url.host_str() {
            Some(host) => host.to_lowercase(),
            None => return ScopeDecision::OutOfScope(SkipReason::Domain),
        };

        // The asset allow-list overrides every other rule
        if self.assets.contains(&host) {
            return ScopeDecision::Asset;
        }

        match url.scheme() {
            "https" => {}
            "http" if !self.config.https_only => {}
            _ => return ScopeDecision::OutOfScope(SkipReason::Protocol),
        }

        if !self
            .config
            .domains
            .iter()
            .any(|pattern| matches_wildcard(pattern, &host))
        {
            return ScopeDecision::OutOfScope(SkipReason::Domain);
        }

        let url_str = url.as_str();

        if self
            .config
            .exclude_patterns
            .iter()
            .any(|pattern| url_str.contains(pattern.as_str()))
        {
            return ScopeDecision::OutOfScope(SkipReason::Excluded);
        }

        if !self.config.include_patterns.is_empty()
            && !self
                .config
                .include_patterns
                .iter()
                .any(|pattern| url_str.contains(pattern.as_str()))
        {
            return ScopeDecision::OutOfScope(SkipReason::NotIncluded);
        }

        if self
            .config
            .redundant_path_patterns
            .iter()
            .any(|pattern| url.path().contains(pattern.as_str()))
        {
            return ScopeDecision::OutOfScope(SkipReason::Redundant);
        }

        if let Some(max_depth) = self.config.max_depth {
            if depth > max_depth {
                return ScopeDecision::OutOfScope(SkipReason::DepthExceeded);
            }
        }

        ScopeDecision::InScope
    }

    /// Shorthand for "may this request proceed"
    pub fn allows(&self, url: &Url, depth: u32) -> bool {
        self.classify(url, depth).is_allowed()
    }
}

/// File extensions the proxy treats as assets when deciding what to store
const ASSET_EXTENSIONS: &[&str] = &[
    "css", "js", "png", "jpg", "jpeg", "gif", "webp", "svg", "ico", "woff", "woff2", "ttf", "eot",
    "mp4", "webm", "mp3",
];

/// Heuristic: does this URL point at a static asset?
pub fn is_asset_url(url: &Url) -> bool {
    let path = url.path();
    match path.rsplit_once('.') {
        Some((_, extension)) => ASSET_EXTENSIONS
            .iter()
            .any(|known| extension.eq_ignore_ascii_case(known)),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope_config() -> ScopeConfig {
        ScopeConfig {
            domains: vec!["*.example.com".to_string()],
            exclude_patterns: vec!["/logout".to_string()],
            include_patterns: vec![],
            redundant_path_patterns: vec!["/calendar/".to_string()],
            max_depth: Some(3),
            https_only: false,
            asset_domains: vec!["cdn.assets.net".to_string()],
        }
    }

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_exact_match() {
        assert!(matches_wildcard("example.com", "example.com"));
        assert!(!matches_wildcard("example.com", "blog.example.com"));
    }

    #[test]
    fn test_wildcard_matches_bare_and_nested() {
        assert!(matches_wildcard("*.example.com", "example.com"));
        assert!(matches_wildcard("*.example.com", "blog.example.com"));
        assert!(matches_wildcard("*.example.com", "api.v2.example.com"));
        assert!(!matches_wildcard("*.example.com", "notexample.com"));
        assert!(!matches_wildcard("*.example.com", "example.org"));
    }

    #[test]
    fn test_in_scope_domain() {
        let scope = Scope::new(scope_config());
        assert_eq!(
            scope.classify(&url("https://app.example.com/home"), 0),
            ScopeDecision::InScope
        );
    }

    #[test]
    fn test_out_of_scope_domain_disallowed() {
        let scope = Scope::new(scope_config());
        assert_eq!(
            scope.classify(&url("https://evil.org/"), 0),
            ScopeDecision::OutOfScope(SkipReason::Domain)
        );
        assert!(!scope.allows(&url("https://evil.org/"), 0));
    }

    #[test]
    fn test_asset_allow_list_overrides_scope_rules() {
        let scope = Scope::new(scope_config());

        // Not an in-scope domain, but allow-listed as an asset host
        assert_eq!(
            scope.classify(&url("https://cdn.assets.net/app.js"), 99),
            ScopeDecision::Asset
        );
        assert!(scope.allows(&url("https://cdn.assets.net/app.js"), 99));
    }

    #[test]
    fn test_runtime_extended_asset_host() {
        let scope = Scope::new(scope_config());
        let target = url("https://fonts.provider.io/face.woff2");

        assert!(!scope.allows(&target, 0));
        scope.assets().add("fonts.provider.io");
        assert_eq!(scope.classify(&target, 0), ScopeDecision::Asset);
    }

    #[test]
    fn test_exclude_pattern() {
        let scope = Scope::new(scope_config());
        assert_eq!(
            scope.classify(&url("https://example.com/logout?next=/"), 0),
            ScopeDecision::OutOfScope(SkipReason::Excluded)
        );
    }

    #[test]
    fn test_include_patterns_required_when_present() {
        let mut config = scope_config();
        config.include_patterns = vec!["/shop/".to_string()];
        let scope = Scope::new(config);

        assert_eq!(
            scope.classify(&url("https://example.com/shop/cart"), 0),
            ScopeDecision::InScope
        );
        assert_eq!(
            scope.classify(&url("https://example.com/about"), 0),
            ScopeDecision::OutOfScope(SkipReason::NotIncluded)
        );
    }

    #[test]
    fn test_redundant_path_pattern() {
        let scope = Scope::new(scope_config());
        assert_eq!(
            scope.classify(&url("https://example.com/calendar/2026/08"), 0),
            ScopeDecision::OutOfScope(SkipReason::Redundant)
        );
    }

    #[test]
    fn test_depth_bound() {
        let scope = Scope::new(scope_config());
        let target = url("https://example.com/deep");

        assert_eq!(scope.classify(&target, 3), ScopeDecision::InScope);
        assert_eq!(
            scope.classify(&target, 4),
            ScopeDecision::OutOfScope(SkipReason::DepthExceeded)
        );
    }

    #[test]
    fn test_https_only() {
        let mut config = scope_config();
        config.https_only = true;
        let scope = Scope::new(config);

        assert_eq!(
            scope.classify(&url("http://example.com/"), 0),
            ScopeDecision::OutOfScope(SkipReason::Protocol)
        );
    }

    #[test]
    fn test_is_asset_url() {
        assert!(is_asset_url(&url("https://example.com/app.JS")));
        assert!(is_asset_url(&url("https://example.com/logo.png")));
        assert!(!is_asset_url(&url("https://example.com/index.html")));
        assert!(!is_asset_url(&url("https://example.com/api")));
    }
}
