//! Job data model
//!
//! A [`Job`] is plain, serializable data: it owns no callbacks and no open
//! handles, so the queue can spill it to disk. Callbacks live in a side-table
//! owned by the cluster, keyed by [`JobId`].

use crate::page::{CapturedResponse, Cookie, DomState, Page};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use url::Url;

/// Opaque job identifier.
///
/// The pending counter is keyed by id rather than by job object, so the same
/// logical job can be dispatched to several workers while still converging to
/// a single completion event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// A fresh random id
    pub fn random() -> Self {
        let raw: u128 = rand::thread_rng().gen();
        Self(format!("{:032x}", raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for JobId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// The browser-side protocol a job asks a worker to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    /// Navigate and enumerate reachable DOM states
    Explore,

    /// Replay a state and collect taint-flow observations
    TraceTaint,

    /// Produce an empty result; the registered callback gets the browser time
    RunCallback,
}

/// The resource a job operates on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Resource {
    /// Navigate to a URL from scratch
    Url(Url),

    /// Preload a captured response, then navigate to its URL
    Response(CapturedResponse),

    /// Merge the page's cookies, then load its DOM
    Page(Box<Page>),

    /// Replay a DOM state's transition path
    Dom(Box<DomState>),
}

impl Resource {
    /// The URL this resource ultimately points at
    pub fn url(&self) -> &Url {
        match self {
            Self::Url(url) => url,
            Self::Response(response) => &response.url,
            Self::Page(page) => &page.url,
            Self::Dom(dom) => &dom.url,
        }
    }
}

/// Per-job overrides and extras
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct JobOptions {
    /// Overrides the configured per-job event budget
    pub max_events: Option<u32>,

    /// Bounds `explore_and_flush` rounds
    pub max_depth: Option<u32>,

    /// Cookies installed into the browser before the job runs
    pub cookies: Vec<Cookie>,
}

/// A unit of browser work submitted to the cluster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    pub resource: Resource,
    #[serde(default)]
    pub options: JobOptions,

    /// Free-form data handed back to the callback untouched
    #[serde(default)]
    pub args: Value,

    /// Exempt from completion: callback and skip-states are retained
    #[serde(default)]
    pub never_ending: bool,
}

impl Job {
    pub fn new(kind: JobKind, resource: Resource) -> Self {
        Self {
            id: JobId::random(),
            kind,
            resource,
            options: JobOptions::default(),
            args: Value::Null,
            never_ending: false,
        }
    }

    pub fn with_id(mut self, id: impl Into<JobId>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_options(mut self, options: JobOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_args(mut self, args: Value) -> Self {
        self.args = args;
        self
    }

    pub fn never_ending(mut self, never_ending: bool) -> Self {
        self.never_ending = never_ending;
        self
    }
}

impl From<String> for JobId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// What a worker produced for one dispatch of a job
#[derive(Debug, Clone)]
pub struct JobResult {
    pub job: Job,
    pub pages: Vec<Page>,
    pub error: Option<String>,
}

impl JobResult {
    pub fn new(job: Job) -> Self {
        Self {
            job,
            pages: Vec::new(),
            error: None,
        }
    }

    pub fn with_pages(mut self, pages: Vec<Page>) -> Self {
        self.pages = pages;
        self
    }

    pub fn failed(job: Job, error: impl Into<String>) -> Self {
        Self {
            job,
            pages: Vec::new(),
            error: Some(error.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn explore_job() -> Job {
        let url = Url::parse("https://example.com/login").unwrap();
        Job::new(JobKind::Explore, Resource::Url(url)).with_id("job-1")
    }

    #[test]
    fn test_random_ids_are_unique() {
        assert_ne!(JobId::random(), JobId::random());
    }

    #[test]
    fn test_resource_url_for_all_variants() {
        let url = Url::parse("https://example.com/a").unwrap();

        let from_url = Resource::Url(url.clone());
        let from_response =
            Resource::Response(CapturedResponse::new(url.clone(), 200, "<html></html>"));
        let from_page = Resource::Page(Box::new(Page::new(url.clone(), "")));
        let from_dom = Resource::Dom(Box::new(DomState::new(url.clone())));

        for resource in [from_url, from_response, from_page, from_dom] {
            assert_eq!(resource.url(), &url);
        }
    }

    #[test]
    fn test_job_survives_serialization() {
        let job = explore_job()
            .with_args(serde_json::json!({"check": "xss"}))
            .never_ending(true);

        let encoded = serde_json::to_string(&job).unwrap();
        let decoded: Job = serde_json::from_str(&encoded).unwrap();

        assert_eq!(decoded, job);
        assert!(decoded.never_ending);
        assert_eq!(decoded.args["check"], "xss");
    }

    #[test]
    fn test_job_result_error_state() {
        let ok = JobResult::new(explore_job());
        assert!(ok.is_ok());

        let failed = JobResult::failed(explore_job(), "browser died");
        assert!(!failed.is_ok());
        assert_eq!(failed.error.as_deref(), Some("browser died"));
    }
}
