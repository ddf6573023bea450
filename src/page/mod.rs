//! Page snapshots and the transitions that produce them
//!
//! A [`Page`] is one captured DOM state. Its ordered [`Transition`] list is a
//! replay recipe: replaying it against a fresh browser deterministically
//! reconstructs the state. Snapshots are deduplicated by a digest folding the
//! transition list and the body hash.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use url::Url;

/// One recorded navigation or DOM interaction event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PageEvent {
    /// Fresh navigation to a URL
    Load,

    /// A request observed by the intercepting proxy
    Request,

    Click,
    Submit,
    Input,
    Change,
    Focus,
    Blur,
    Select,
    Hover,
    KeyUp,
    KeyDown,
}

impl PageEvent {
    /// DOM event name as dispatched in the browser
    pub fn name(&self) -> &'static str {
        match self {
            Self::Load => "load",
            Self::Request => "request",
            Self::Click => "click",
            Self::Submit => "submit",
            Self::Input => "input",
            Self::Change => "change",
            Self::Focus => "focus",
            Self::Blur => "blur",
            Self::Select => "select",
            Self::Hover => "mouseover",
            Self::KeyUp => "keyup",
            Self::KeyDown => "keydown",
        }
    }

    /// Parses an event from a DOM handler attribute name like `onclick`
    pub fn from_attribute(attribute: &str) -> Option<Self> {
        let name = attribute.strip_prefix("on").unwrap_or(attribute);
        match name {
            "click" => Some(Self::Click),
            "submit" => Some(Self::Submit),
            "input" => Some(Self::Input),
            "change" => Some(Self::Change),
            "focus" => Some(Self::Focus),
            "blur" => Some(Self::Blur),
            "select" => Some(Self::Select),
            "mouseover" => Some(Self::Hover),
            "keyup" => Some(Self::KeyUp),
            "keydown" => Some(Self::KeyDown),
            _ => None,
        }
    }

    /// Events that inject a value before firing
    pub fn is_input_family(&self) -> bool {
        matches!(
            self,
            Self::Input | Self::Change | Self::Focus | Self::Blur | Self::Select
        )
    }
}

impl fmt::Display for PageEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Locates a DOM element by tag name and attributes.
///
/// Attributes are kept in a `BTreeMap` so locator rendering and signatures
/// are deterministic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementLocator {
    pub tag_name: String,
    pub attributes: BTreeMap<String, String>,
}

impl ElementLocator {
    pub fn new(tag_name: impl Into<String>) -> Self {
        Self {
            tag_name: tag_name.into().to_lowercase(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    /// Builds a CSS selector for this element, preferring stable attributes
    pub fn css_selector(&self) -> String {
        if let Some(id) = self.attributes.get("id") {
            return format!("{}[id=\"{}\"]", self.tag_name, id);
        }
        if let Some(name) = self.attributes.get("name") {
            return format!("{}[name=\"{}\"]", self.tag_name, name);
        }

        let mut selector = self.tag_name.clone();
        for (name, value) in &self.attributes {
            // Event handler attributes contain arbitrary script text
            if name.starts_with("on") {
                continue;
            }
            selector.push_str(&format!("[{}=\"{}\"]", name, value.replace('"', "\\\"")));
        }
        selector
    }

    /// Canonical text form used in signatures
    pub fn signature_fragment(&self) -> String {
        let attributes: Vec<String> = self
            .attributes
            .iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect();
        format!("{}:{}", self.tag_name, attributes.join(","))
    }
}

impl fmt::Display for ElementLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}", self.tag_name)?;
        for (name, value) in &self.attributes {
            write!(f, " {}=\"{}\"", name, value)?;
        }
        write!(f, ">")
    }
}

/// What a transition acted on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransitionTarget {
    /// A located DOM element
    Element(ElementLocator),

    /// A URL (navigations and observed requests)
    Url(Url),

    /// The page itself (document-level events)
    Page,
}

/// Options applied while performing a transition
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionOptions {
    /// Values injected into named inputs before firing
    #[serde(default)]
    pub inputs: BTreeMap<String, String>,
}

/// An ordered, append-only record of one navigation or DOM interaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub target: TransitionTarget,
    pub event: PageEvent,
    pub options: TransitionOptions,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Transition {
    /// Starts a transition; `complete` stamps the end time
    pub fn start(target: TransitionTarget, event: PageEvent, options: TransitionOptions) -> Self {
        Self {
            target,
            event,
            options,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn complete(&mut self) {
        self.completed_at = Some(Utc::now());
    }

    pub fn is_complete(&self) -> bool {
        self.completed_at.is_some()
    }

    /// Time spent performing the transition, if completed
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.completed_at.map(|end| end - self.started_at)
    }

    /// Stable content hash of the transition (timing excluded)
    pub fn content_hash(&self) -> String {
        let target = match &self.target {
            TransitionTarget::Element(locator) => locator.signature_fragment(),
            TransitionTarget::Url(url) => url.to_string(),
            TransitionTarget::Page => ":page".to_string(),
        };
        let inputs: Vec<String> = self
            .options
            .inputs
            .iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect();
        sha256_hex(&format!("{}|{}|{}", target, self.event, inputs.join("&")))
    }
}

/// A browser cookie as observed through the driver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cookie {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub http_only: bool,
}

impl Cookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            domain: None,
            path: None,
            secure: false,
            http_only: false,
        }
    }

    /// Renders a `Set-Cookie`-style string accepted by a cookie jar
    pub fn to_set_cookie(&self) -> String {
        let mut rendered = format!("{}={}", self.name, self.value);
        if let Some(domain) = &self.domain {
            rendered.push_str(&format!("; Domain={}", domain));
        }
        if let Some(path) = &self.path {
            rendered.push_str(&format!("; Path={}", path));
        }
        if self.secure {
            rendered.push_str("; Secure");
        }
        if self.http_only {
            rendered.push_str("; HttpOnly");
        }
        rendered
    }
}

/// Merges browser-observed cookies into a process-wide cookie jar
pub fn merge_into_jar(jar: &reqwest::cookie::Jar, cookies: &[Cookie], url: &Url) {
    use reqwest::cookie::CookieStore;

    for cookie in cookies {
        jar.add_cookie_str(&cookie.to_set_cookie(), url);
    }
    // Touch the store so misconfigured domains surface in logs early
    if jar.cookies(url).is_none() && !cookies.is_empty() {
        tracing::debug!("No cookies applicable to {} after merge", url);
    }
}

/// An HTTP response captured by the proxy (or preloaded into it)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedResponse {
    pub url: Url,
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl CapturedResponse {
    pub fn new(url: Url, status: u16, body: impl Into<String>) -> Self {
        Self {
            url,
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(header, _)| header.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }

    pub fn is_html(&self) -> bool {
        self.content_type()
            .map(|value| value.contains("text/html"))
            .unwrap_or(false)
    }
}

/// A replayable DOM state: a URL plus the ordered path that produced it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomState {
    pub url: Url,
    pub transitions: Vec<Transition>,
}

impl DomState {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            transitions: Vec::new(),
        }
    }

    /// Digest over the ordered transition hashes
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.url.as_str().as_bytes());
        for transition in &self.transitions {
            hasher.update(transition.content_hash().as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

/// One captured DOM state with everything downstream checks need
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page {
    pub url: Url,
    pub body: String,
    pub cookies: Vec<Cookie>,
    pub dom: DomState,

    /// Taint-flow observations reported by the page instrumentation
    #[serde(default)]
    pub data_flow_sinks: Vec<Value>,

    /// Execution-flow observations reported by the page instrumentation
    #[serde(default)]
    pub execution_flow_sinks: Vec<Value>,
}

impl Page {
    pub fn new(url: Url, body: impl Into<String>) -> Self {
        let dom = DomState::new(url.clone());
        Self {
            url,
            body: body.into(),
            cookies: Vec::new(),
            dom,
            data_flow_sinks: Vec::new(),
            execution_flow_sinks: Vec::new(),
        }
    }

    /// Snapshot digest folding the transition path and the body hash
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.dom.digest().as_bytes());
        hasher.update(sha256_hex(&self.body).as_bytes());
        hex::encode(hasher.finalize())
    }
}

pub(crate) fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn locator() -> ElementLocator {
        ElementLocator::new("a")
            .with_attribute("href", "/next")
            .with_attribute("id", "go")
    }

    #[test]
    fn test_event_from_attribute() {
        assert_eq!(PageEvent::from_attribute("onclick"), Some(PageEvent::Click));
        assert_eq!(PageEvent::from_attribute("onblur"), Some(PageEvent::Blur));
        assert_eq!(
            PageEvent::from_attribute("mouseover"),
            Some(PageEvent::Hover)
        );
        assert_eq!(PageEvent::from_attribute("onunknown"), None);
    }

    #[test]
    fn test_locator_display_renders_opening_tag() {
        assert_eq!(format!("{}", locator()), "<a href=\"/next\" id=\"go\">");
    }

    #[test]
    fn test_locator_css_selector_prefers_id() {
        assert_eq!(locator().css_selector(), "a[id=\"go\"]");

        let plain = ElementLocator::new("input").with_attribute("type", "text");
        assert_eq!(plain.css_selector(), "input[type=\"text\"]");
    }

    #[test]
    fn test_transition_completion_and_duration() {
        let mut transition = Transition::start(
            TransitionTarget::Page,
            PageEvent::Click,
            TransitionOptions::default(),
        );
        assert!(!transition.is_complete());
        assert!(transition.duration().is_none());

        transition.complete();
        assert!(transition.is_complete());
        assert!(transition.duration().is_some());
    }

    #[test]
    fn test_transition_hash_ignores_timing() {
        let url = Url::parse("https://example.com/").unwrap();
        let a = Transition::start(
            TransitionTarget::Url(url.clone()),
            PageEvent::Load,
            TransitionOptions::default(),
        );
        let mut b = Transition::start(
            TransitionTarget::Url(url),
            PageEvent::Load,
            TransitionOptions::default(),
        );
        b.complete();

        assert_eq!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn test_page_digest_deterministic_for_same_path() {
        let url = Url::parse("https://example.com/app").unwrap();
        let build = || {
            let mut page = Page::new(url.clone(), "<html><body>state</body></html>");
            page.dom.transitions.push(Transition::start(
                TransitionTarget::Url(url.clone()),
                PageEvent::Load,
                TransitionOptions::default(),
            ));
            page.dom.transitions.push(Transition::start(
                TransitionTarget::Element(locator()),
                PageEvent::Click,
                TransitionOptions::default(),
            ));
            page
        };

        assert_eq!(build().digest(), build().digest());
    }

    #[test]
    fn test_page_digest_sensitive_to_body_and_path() {
        let url = Url::parse("https://example.com/app").unwrap();
        let base = Page::new(url.clone(), "<html>a</html>");

        let different_body = Page::new(url.clone(), "<html>b</html>");
        assert_ne!(base.digest(), different_body.digest());

        let mut different_path = Page::new(url.clone(), "<html>a</html>");
        different_path.dom.transitions.push(Transition::start(
            TransitionTarget::Url(url),
            PageEvent::Load,
            TransitionOptions::default(),
        ));
        assert_ne!(base.digest(), different_path.digest());
    }

    #[test]
    fn test_cookie_set_cookie_rendering() {
        let mut cookie = Cookie::new("session", "abc123");
        cookie.domain = Some("example.com".to_string());
        cookie.path = Some("/".to_string());
        cookie.http_only = true;

        assert_eq!(
            cookie.to_set_cookie(),
            "session=abc123; Domain=example.com; Path=/; HttpOnly"
        );
    }

    #[test]
    fn test_captured_response_header_lookup() {
        let url = Url::parse("https://example.com/").unwrap();
        let mut response = CapturedResponse::new(url, 200, "<html></html>");
        response
            .headers
            .push(("Content-Type".to_string(), "text/html".to_string()));

        assert_eq!(response.content_type(), Some("text/html"));
        assert!(response.is_html());
    }
}
