//! Skip-state registry
//!
//! A [`SkipStateSet`] is a monotonically growing, merge-only set of opaque
//! signatures marking (URL, element, event) combinations or whole page states
//! as already explored. Workers cooperating on one job share a partition so
//! concurrent exploration does not re-trigger identical states.

use crate::page::{sha256_hex, ElementLocator, PageEvent, Transition};
use std::collections::HashSet;
use url::Url;

/// A mergeable set of opaque state signatures
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SkipStateSet {
    states: HashSet<String>,
}

impl SkipStateSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, signature: &str) -> bool {
        self.states.contains(signature)
    }

    /// Inserts a signature, returning true when it was not present before
    pub fn insert(&mut self, signature: impl Into<String>) -> bool {
        self.states.insert(signature.into())
    }

    /// Merge-only union with another set
    pub fn merge(&mut self, other: &SkipStateSet) {
        for signature in &other.states {
            self.states.insert(signature.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

/// Signature for one (element, events) combination on a page.
///
/// Folds `url : tag : attributes : sorted event names` so the same element
/// reached through a different path still deduplicates.
pub fn element_signature(url: &Url, locator: &ElementLocator, events: &[PageEvent]) -> String {
    let mut names: Vec<&str> = events.iter().map(PageEvent::name).collect();
    names.sort_unstable();
    names.dedup();

    sha256_hex(&format!(
        "{}:{}:{}",
        url,
        locator.signature_fragment(),
        names.join(",")
    ))
}

/// Signature for a whole page state: `url : ordered transition hashes`
pub fn page_signature(url: &Url, transitions: &[Transition]) -> String {
    let hashes: Vec<String> = transitions
        .iter()
        .map(Transition::content_hash)
        .collect();
    sha256_hex(&format!("{}:{}", url, hashes.join(":")))
}
