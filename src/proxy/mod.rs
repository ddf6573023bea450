//! Intercepting proxy
//!
//! Each browser gets its own local HTTP proxy. The proxy authenticates
//! traffic with a per-browser token, classifies every request against the
//! scan scope, short-circuits preloaded responses, forwards the rest
//! upstream, and captures what came back for the controller to turn into
//! page snapshots.

use crate::browser::instrumentation::{INSTRUMENTATION_PATH, INSTRUMENTATION_SOURCE};
use crate::page::{
    CapturedResponse, ElementLocator, PageEvent, Transition, TransitionOptions, TransitionTarget,
};
use crate::scope::{is_asset_url, Scope, ScopeDecision};
use crate::skipstate::{element_signature, SkipStateSet};
use rand::Rng;
use reqwest::header::{HeaderName, HeaderValue};
use reqwest::redirect::Policy;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::AbortHandle;
use url::Url;

/// Header carrying the per-browser auth token
pub const AUTH_HEADER: &str = "x-specter-auth";

/// Marker header on responses the proxy manufactured itself
pub const SYNTHESIZED_HEADER: &str = "x-specter-synthesized";

/// Interval between pending-connection polls
const PENDING_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Proxy-specific errors
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Upstream error: {0}")]
    Upstream(#[from] reqwest::Error),

    #[error("Malformed request: {0}")]
    Malformed(String),
}

/// State shared between the public handle and connection tasks
struct ProxyShared {
    auth_token: String,
    scope: Arc<Scope>,
    client: reqwest::Client,
    request_timeout: Duration,

    root_url: Mutex<Option<Url>>,

    /// url -> canned response; consumed exactly once
    preloads: Mutex<HashMap<String, CapturedResponse>>,

    /// url -> last stored response, for snapshot bodies
    responses: Mutex<HashMap<String, CapturedResponse>>,

    /// Request transitions awaiting their response
    pending_transitions: Mutex<Vec<Transition>>,

    /// Completed request transitions
    transitions: Mutex<Vec<Transition>>,

    /// Synthetic input elements harvested from request parameters
    captured_inputs: Mutex<Vec<ElementLocator>>,
    seen_inputs: Mutex<SkipStateSet>,

    pending: AtomicUsize,
    next_connection_id: AtomicU64,
    connections: Mutex<HashMap<u64, AbortHandle>>,
}

/// Decrements the pending-connection gauge when a connection ends,
/// including when its task is aborted.
struct PendingGuard {
    shared: Arc<ProxyShared>,
}

impl PendingGuard {
    fn new(shared: Arc<ProxyShared>) -> Self {
        shared.pending.fetch_add(1, Ordering::SeqCst);
        Self { shared }
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.shared.pending.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A running intercepting proxy bound to a loopback port
pub struct InterceptProxy {
    address: SocketAddr,
    shared: Arc<ProxyShared>,
    shutdown: watch::Sender<bool>,
}

impl InterceptProxy {
    /// Binds an ephemeral loopback port and starts the accept loop
    pub async fn start(scope: Arc<Scope>, request_timeout: Duration) -> Result<Self, ProxyError> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let address = listener.local_addr()?;

        let auth_token = format!("{:032x}", rand::thread_rng().gen::<u128>());

        // Redirects pass through untouched so the browser sees them
        let client = reqwest::Client::builder()
            .redirect(Policy::none())
            .timeout(request_timeout)
            .build()?;

        let shared = Arc::new(ProxyShared {
            auth_token,
            scope,
            client,
            request_timeout,
            root_url: Mutex::new(None),
            preloads: Mutex::new(HashMap::new()),
            responses: Mutex::new(HashMap::new()),
            pending_transitions: Mutex::new(Vec::new()),
            transitions: Mutex::new(Vec::new()),
            captured_inputs: Mutex::new(Vec::new()),
            seen_inputs: Mutex::new(SkipStateSet::new()),
            pending: AtomicUsize::new(0),
            next_connection_id: AtomicU64::new(0),
            connections: Mutex::new(HashMap::new()),
        });

        let (shutdown, mut shutdown_rx) = watch::channel(false);

        let accept_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    accepted = listener.accept() => {
                        let (stream, peer) = match accepted {
                            Ok(accepted) => accepted,
                            Err(error) => {
                                tracing::warn!("Proxy accept failed: {}", error);
                                continue;
                            }
                        };
                        tracing::trace!("Proxy connection from {}", peer);

                        let shared = Arc::clone(&accept_shared);
                        let id = shared.next_connection_id.fetch_add(1, Ordering::SeqCst);
                        let task_shared = Arc::clone(&shared);
                        let handle = tokio::spawn(async move {
                            let guard = PendingGuard::new(Arc::clone(&task_shared));
                            if let Err(error) =
                                handle_connection(stream, Arc::clone(&task_shared)).await
                            {
                                tracing::debug!("Proxy connection error: {}", error);
                            }
                            drop(guard);
                            task_shared.connections.lock().unwrap().remove(&id);
                        });
                        shared
                            .connections
                            .lock()
                            .unwrap()
                            .insert(id, handle.abort_handle());
                    }
                }
            }
            tracing::debug!("Proxy accept loop stopped");
        });

        Ok(Self {
            address,
            shared,
            shutdown,
        })
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Proxy URL in the form browsers expect
    pub fn url(&self) -> String {
        format!("http://{}", self.address)
    }

    pub fn auth_token(&self) -> &str {
        &self.shared.auth_token
    }

    /// Sets the URL whose responses get cache/CSP scrubbing
    pub fn set_root_url(&self, url: Url) {
        *self.shared.root_url.lock().unwrap() = Some(url);
    }

    /// Registers a canned response; it services at most one request
    pub fn preload(&self, response: CapturedResponse) {
        self.shared
            .preloads
            .lock()
            .unwrap()
            .insert(response.url.as_str().to_string(), response);
    }

    pub fn has_preload(&self, url: &Url) -> bool {
        self.shared
            .preloads
            .lock()
            .unwrap()
            .contains_key(url.as_str())
    }

    /// The last stored response for a URL, if any
    pub fn response_for(&self, url: &Url) -> Option<CapturedResponse> {
        self.shared
            .responses
            .lock()
            .unwrap()
            .get(url.as_str())
            .cloned()
    }

    /// Drains completed request transitions
    pub fn drain_transitions(&self) -> Vec<Transition> {
        std::mem::take(&mut *self.shared.transitions.lock().unwrap())
    }

    /// Drains synthetic input elements harvested from traffic
    pub fn drain_captured_inputs(&self) -> Vec<ElementLocator> {
        std::mem::take(&mut *self.shared.captured_inputs.lock().unwrap())
    }

    /// Number of connections currently open
    pub fn pending_connections(&self) -> usize {
        self.shared.pending.load(Ordering::SeqCst)
    }

    /// Waits for quiescence, force-closing stragglers at the deadline.
    ///
    /// Browsers sometimes open connections they never close on malformed
    /// responses; proceeding beats hanging forever.
    pub async fn wait_for_pending_requests(&self, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if self.pending_connections() == 0 {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                let stragglers = self.pending_connections();
                tracing::warn!(
                    "Force-closing {} proxy connection(s) still open after {:?}",
                    stragglers,
                    timeout
                );
                let handles: Vec<AbortHandle> = {
                    let mut connections = self.shared.connections.lock().unwrap();
                    connections.drain().map(|(_, handle)| handle).collect()
                };
                for handle in handles {
                    handle.abort();
                }
                // Give aborted tasks a moment to release the gauge
                tokio::time::sleep(PENDING_POLL_INTERVAL).await;
                return;
            }
            tokio::time::sleep(PENDING_POLL_INTERVAL).await;
        }
    }

    /// Stops the accept loop. Idempotent; already-stopped is tolerated.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

impl Drop for InterceptProxy {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A parsed proxy request
struct ParsedRequest {
    method: String,
    target: String,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl ParsedRequest {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(header, _)| header.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

async fn handle_connection(stream: TcpStream, shared: Arc<ProxyShared>) -> Result<(), ProxyError> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let request = parse_request(&mut reader).await?;

    if request.method.eq_ignore_ascii_case("CONNECT") {
        // TLS interception is handled by terminating https upstream, not
        // by tunnelling; refuse the tunnel so the browser falls back.
        write_simple(&mut write_half, 501, "text/plain", b"tunnelling unsupported").await?;
        return Ok(());
    }

    let url = resolve_url(&request)?;

    // Foreign traffic: anything without our token is ignored outright
    if !is_authenticated(&request, &shared.auth_token) {
        tracing::debug!("Rejecting unauthenticated proxy request for {}", url);
        write_simple(&mut write_half, 407, "text/plain", b"proxy auth required").await?;
        return Ok(());
    }

    // Framework traffic: the instrumentation script is served directly
    if url.path() == INSTRUMENTATION_PATH {
        write_simple(
            &mut write_half,
            200,
            "application/javascript",
            INSTRUMENTATION_SOURCE.as_bytes(),
        )
        .await?;
        return Ok(());
    }

    let decision = shared.scope.classify(&url, 0);

    if let ScopeDecision::OutOfScope(reason) = decision {
        // Manufactured response with a synthesized 200 so the browser can
        // still build a page out of it.
        tracing::debug!("Out-of-scope request for {} ({})", url, reason);
        let mut response = CapturedResponse::new(url.clone(), 200, "<html><body></body></html>");
        response
            .headers
            .push(("content-type".to_string(), "text/html".to_string()));
        response
            .headers
            .push((SYNTHESIZED_HEADER.to_string(), reason.to_string()));
        write_captured(&mut write_half, &response).await?;
        return Ok(());
    }

    let in_scope = matches!(decision, ScopeDecision::InScope);

    if in_scope {
        record_request_transition(&shared, &url);
        capture_request_inputs(&shared, &request, &url);
    }

    // A preload services exactly one request, then disappears
    let preloaded = shared
        .preloads
        .lock()
        .unwrap()
        .remove(url.as_str());

    let response = match preloaded {
        Some(canned) => {
            tracing::debug!("Serving preloaded response for {}", url);
            handle_response(&shared, canned, decision)
        }
        None => {
            let upstream = forward_upstream(&shared, &request, &url).await;
            handle_response(&shared, upstream, decision)
        }
    };

    write_captured(&mut write_half, &response).await?;
    Ok(())
}

async fn parse_request<R>(reader: &mut BufReader<R>) -> Result<ParsedRequest, ProxyError>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut request_line = String::new();
    reader.read_line(&mut request_line).await?;

    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| ProxyError::Malformed("empty request line".to_string()))?
        .to_string();
    let target = parts
        .next()
        .ok_or_else(|| ProxyError::Malformed("missing request target".to_string()))?
        .to_string();

    let mut headers = Vec::new();
    loop {
        let mut line = String::new();
        let read = reader.read_line(&mut line).await?;
        let line = line.trim_end();
        if read == 0 || line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_lowercase(), value.trim().to_string()));
        }
    }

    let content_length = headers
        .iter()
        .find(|(name, _)| name == "content-length")
        .and_then(|(_, value)| value.parse::<usize>().ok())
        .unwrap_or(0);

    let mut body = vec![0u8; content_length];
    if content_length > 0 {
        reader.read_exact(&mut body).await?;
    }

    Ok(ParsedRequest {
        method,
        target,
        headers,
        body,
    })
}

fn resolve_url(request: &ParsedRequest) -> Result<Url, ProxyError> {
    if request.target.starts_with("http://") || request.target.starts_with("https://") {
        return Url::parse(&request.target)
            .map_err(|error| ProxyError::Malformed(error.to_string()));
    }

    // Origin-form request: reconstruct from the Host header
    let host = request
        .header("host")
        .ok_or_else(|| ProxyError::Malformed("origin-form request without Host".to_string()))?;
    Url::parse(&format!("http://{}{}", host, request.target))
        .map_err(|error| ProxyError::Malformed(error.to_string()))
}

fn is_authenticated(request: &ParsedRequest, token: &str) -> bool {
    if request.header(AUTH_HEADER) == Some(token) {
        return true;
    }
    // Browsers configured with proxy credentials send them here instead
    request
        .header("proxy-authorization")
        .map(|value| value.contains(token))
        .unwrap_or(false)
}

fn record_request_transition(shared: &ProxyShared, url: &Url) {
    let transition = Transition::start(
        TransitionTarget::Url(url.clone()),
        PageEvent::Request,
        TransitionOptions::default(),
    );
    shared
        .pending_transitions
        .lock()
        .unwrap()
        .push(transition);
}

/// Captures GET/POST parameters and JSON/XML body names as synthetic
/// inputs, deduplicated against the proxy's element filter
fn capture_request_inputs(shared: &ProxyShared, request: &ParsedRequest, url: &Url) {
    let mut names: Vec<String> = url.query_pairs().map(|(name, _)| name.into_owned()).collect();

    let content_type = request.header("content-type").unwrap_or("");
    if content_type.contains("application/x-www-form-urlencoded") {
        names.extend(
            url::form_urlencoded::parse(&request.body).map(|(name, _)| name.into_owned()),
        );
    } else if content_type.contains("json") {
        if let Ok(serde_json::Value::Object(object)) =
            serde_json::from_slice::<serde_json::Value>(&request.body)
        {
            names.extend(object.keys().cloned());
        }
    } else if content_type.contains("xml") {
        names.extend(xml_input_names(&request.body));
    }

    if names.is_empty() {
        return;
    }

    let mut seen = shared.seen_inputs.lock().unwrap();
    let mut captured = shared.captured_inputs.lock().unwrap();
    for name in names {
        let locator = ElementLocator::new("input")
            .with_attribute("name", name.clone())
            .with_attribute("data-origin", "traffic");
        let signature = element_signature(url, &locator, &[PageEvent::Input]);
        if seen.insert(signature) {
            captured.push(locator);
        }
    }
}

/// Element and attribute names of an XML body, in document order. The
/// names mirror the JSON treatment: each becomes a candidate input.
fn xml_input_names(body: &[u8]) -> Vec<String> {
    let text = String::from_utf8_lossy(body);
    let fragment = scraper::Html::parse_fragment(&text);

    let mut names = Vec::new();
    for node in fragment.tree.nodes() {
        if let Some(element) = node.value().as_element() {
            // parse_fragment wraps its input in a synthetic <html> root
            if element.name() == "html" {
                continue;
            }
            names.push(element.name().to_string());
            names.extend(element.attrs().map(|(name, _)| name.to_string()));
        }
    }
    names
}

async fn forward_upstream(
    shared: &ProxyShared,
    request: &ParsedRequest,
    url: &Url,
) -> CapturedResponse {
    let is_root = is_root_url(shared, url);

    let method = match reqwest::Method::from_bytes(request.method.as_bytes()) {
        Ok(method) => method,
        Err(_) => {
            return synthesized_error(url, 405, "unsupported method");
        }
    };

    let mut builder = shared
        .client
        .request(method, url.clone())
        .timeout(shared.request_timeout);

    for (name, value) in &request.headers {
        if is_hop_by_hop(name) || name == AUTH_HEADER {
            continue;
        }
        // Conditional headers on the root URL would yield 304s; analysis
        // needs full bodies.
        if is_root && (name == "if-modified-since" || name == "if-none-match") {
            continue;
        }
        if let (Ok(header), Ok(header_value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            builder = builder.header(header, header_value);
        }
    }

    if !request.body.is_empty() {
        builder = builder.body(request.body.clone());
    }

    let response = match builder.send().await {
        Ok(response) => response,
        Err(error) => {
            tracing::warn!("Upstream request for {} failed: {}", url, error);
            return synthesized_error(url, 502, &error.to_string());
        }
    };

    let status = response.status().as_u16();
    let mut headers = Vec::new();
    for (name, value) in response.headers() {
        if let Ok(value) = value.to_str() {
            headers.push((name.as_str().to_lowercase(), value.to_string()));
        }
    }

    let body = match response.bytes().await {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(error) => {
            tracing::warn!("Failed reading upstream body for {}: {}", url, error);
            return synthesized_error(url, 502, &error.to_string());
        }
    };

    let mut captured = CapturedResponse::new(url.clone(), status, body);
    captured.headers = headers;
    captured
}

fn synthesized_error(url: &Url, status: u16, message: &str) -> CapturedResponse {
    let mut response = CapturedResponse::new(url.clone(), status, message.to_string());
    response
        .headers
        .push(("content-type".to_string(), "text/plain".to_string()));
    response
        .headers
        .push((SYNTHESIZED_HEADER.to_string(), "upstream-error".to_string()));
    response
}

/// Response-side policy applied to real and preloaded traffic alike
fn handle_response(
    shared: &ProxyShared,
    mut response: CapturedResponse,
    decision: ScopeDecision,
) -> CapturedResponse {
    let is_root = is_root_url(shared, &response.url);

    if is_root {
        // Caching headers would starve analysis of bodies; CSP would block
        // the injected instrumentation.
        response.headers.retain(|(name, _)| {
            !matches!(
                name.as_str(),
                "cache-control"
                    | "expires"
                    | "pragma"
                    | "etag"
                    | "last-modified"
                    | "content-security-policy"
                    | "content-security-policy-report-only"
            )
        });
    }

    complete_request_transition(shared, &response.url);

    if should_store(&response, decision) {
        harvest_asset_hosts(shared, &response);
        shared
            .responses
            .lock()
            .unwrap()
            .insert(response.url.as_str().to_string(), response.clone());
    }

    response
}

fn complete_request_transition(shared: &ProxyShared, url: &Url) {
    let mut pending = shared.pending_transitions.lock().unwrap();
    if let Some(position) = pending.iter().position(|transition| {
        matches!(&transition.target, TransitionTarget::Url(pending_url) if pending_url == url)
    }) {
        let mut transition = pending.remove(position);
        transition.complete();
        shared.transitions.lock().unwrap().push(transition);
    }
}

fn should_store(response: &CapturedResponse, decision: ScopeDecision) -> bool {
    if !matches!(decision, ScopeDecision::InScope) {
        return false;
    }
    if is_asset_url(&response.url) {
        return false;
    }

    let content_type = response.content_type().unwrap_or("text/html");
    let textual = content_type.contains("html")
        || content_type.contains("json")
        || content_type.contains("xml")
        || content_type.contains("text/plain");
    textual
}

/// Scans an HTML body for linked asset hosts outside the scan scope and
/// extends the shared allow-list with them
fn harvest_asset_hosts(shared: &ProxyShared, response: &CapturedResponse) {
    if !response.is_html() {
        return;
    }

    let document = scraper::Html::parse_document(&response.body);
    let selector = match scraper::Selector::parse("script[src], link[href], img[src]") {
        Ok(selector) => selector,
        Err(_) => return,
    };

    let assets = shared.scope.assets();
    for element in document.select(&selector) {
        let reference = element
            .value()
            .attr("src")
            .or_else(|| element.value().attr("href"));
        let reference = match reference {
            Some(reference) => reference,
            None => continue,
        };
        let resolved = match response.url.join(reference) {
            Ok(resolved) => resolved,
            Err(_) => continue,
        };
        if !is_asset_url(&resolved) {
            continue;
        }
        if let Some(host) = resolved.host_str() {
            if !shared.scope.allows(&resolved, 0) && assets.add(host) {
                tracing::debug!("Allow-listing asset host {}", host);
            }
        }
    }
}

fn is_root_url(shared: &ProxyShared, url: &Url) -> bool {
    shared
        .root_url
        .lock()
        .unwrap()
        .as_ref()
        .map(|root| root == url)
        .unwrap_or(false)
}

fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name,
        "connection"
            | "proxy-connection"
            | "proxy-authorization"
            | "keep-alive"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
            | "host"
            | "content-length"
            | "accept-encoding"
    )
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        404 => "Not Found",
        405 => "Method Not Allowed",
        407 => "Proxy Authentication Required",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        _ => "Status",
    }
}

async fn write_captured(
    writer: &mut OwnedWriteHalf,
    response: &CapturedResponse,
) -> Result<(), ProxyError> {
    let mut head = format!(
        "HTTP/1.1 {} {}\r\n",
        response.status,
        reason_phrase(response.status)
    );
    for (name, value) in &response.headers {
        if matches!(
            name.as_str(),
            "content-length" | "transfer-encoding" | "content-encoding" | "connection"
        ) {
            continue;
        }
        head.push_str(&format!("{}: {}\r\n", name, value));
    }
    head.push_str(&format!("content-length: {}\r\n", response.body.len()));
    head.push_str("connection: close\r\n\r\n");

    writer.write_all(head.as_bytes()).await?;
    writer.write_all(response.body.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

async fn write_simple(
    writer: &mut OwnedWriteHalf,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<(), ProxyError> {
    let head = format!(
        "HTTP/1.1 {} {}\r\ncontent-type: {}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
        status,
        reason_phrase(status),
        content_type,
        body.len()
    );
    writer.write_all(head.as_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}
