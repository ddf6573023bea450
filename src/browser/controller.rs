//! Browser controller
//!
//! Drives one supervised browser through its driver endpoint: navigation,
//! cookie sync, DOM event enumeration and firing, quiescence waiting, and
//! snapshot capture. Each controller owns exactly one process and one proxy
//! for its whole lifetime.

use crate::browser::driver::{Driver, DriverError, ElementRef};
use crate::browser::instrumentation::{
    CHECK_INSTRUMENTED_SCRIPT, DATA_FLOW_SINKS_SCRIPT, ELEMENT_SCAN_SCRIPT,
    EXECUTION_FLOW_SINKS_SCRIPT, INSTRUMENTATION_SOURCE, PENDING_TIMERS_SCRIPT,
};
use crate::browser::process::{BrowserError, BrowserProcess};
use crate::config::BrowserConfig;
use crate::job::Resource;
use crate::page::{
    merge_into_jar, Cookie, DomState, ElementLocator, Page, PageEvent, Transition,
    TransitionOptions, TransitionTarget,
};
use crate::proxy::InterceptProxy;
use crate::scope::Scope;
use crate::skipstate::{element_signature, SkipStateSet};
use crate::SpecterError;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use url::Url;

/// Value injected into inputs when a job supplies none
const SAMPLE_INPUT_VALUE: &str = "specter-1";

/// Interval between timer-drain polls
const TIMER_POLL_INTERVAL: Duration = Duration::from_millis(100);

type NewPageObserver = Box<dyn Fn(&Page) + Send + Sync>;
type FireEventObserver = Box<dyn Fn(&ElementLocator, PageEvent) + Send + Sync>;

/// One event-carrying element as reported by the in-page scan
#[derive(Debug, Clone)]
pub struct EventElement {
    pub locator: ElementLocator,
    pub events: Vec<PageEvent>,
}

/// One headless browser plus its proxy and supervised process
pub struct Browser {
    config: BrowserConfig,
    scope: Arc<Scope>,
    process: BrowserProcess,
    proxy: InterceptProxy,
    driver: Driver,
    job_timeout: Duration,

    transitions: Vec<Transition>,
    snapshots: Vec<Page>,
    seen_digests: HashSet<String>,

    skip_states: Arc<Mutex<SkipStateSet>>,
    event_budget: u32,
    events_fired: u32,
    crawl_depth: u32,

    cookie_jar: Arc<reqwest::cookie::Jar>,

    on_new_page: Vec<NewPageObserver>,
    on_fire_event: Vec<FireEventObserver>,

    shut_down: bool,
}

impl Browser {
    /// Launches a browser: a fresh proxy and supervised process per spawn
    /// attempt, then a driver session routing all traffic through the proxy
    pub async fn launch(
        config: BrowserConfig,
        scope: Arc<Scope>,
        job_timeout: Duration,
        event_budget: u32,
    ) -> Result<Self, SpecterError> {
        let attempts = config.spawn_retries.max(1);
        let mut proxy = InterceptProxy::start(Arc::clone(&scope), config.request_timeout()).await?;
        let mut process = None;

        for attempt in 1..=attempts {
            match BrowserProcess::spawn_once(&config).await {
                Ok(spawned) => {
                    process = Some(spawned);
                    break;
                }
                Err(BrowserError::ExecutableNotFound) => {
                    // No point retrying a missing binary
                    proxy.shutdown();
                    return Err(BrowserError::ExecutableNotFound.into());
                }
                Err(error) => {
                    tracing::warn!("Spawn attempt {}/{} failed: {}", attempt, attempts, error);
                    if attempt < attempts {
                        // Nothing from the failed attempt may leak into the
                        // next browser: port and proxy are both replaced.
                        proxy.shutdown();
                        proxy = InterceptProxy::start(Arc::clone(&scope), config.request_timeout())
                            .await?;
                    }
                }
            }
        }

        let process = match process {
            Some(process) => process,
            None => {
                proxy.shutdown();
                return Err(BrowserError::SpawnFailed { attempts }.into());
            }
        };

        let mut driver = Driver::connect(process.port(), config.request_timeout())?;
        driver.new_session(capabilities(&proxy, &config)).await?;
        driver.set_window_size(config.width, config.height).await?;

        Ok(Self {
            config,
            scope,
            process,
            proxy,
            driver,
            job_timeout,
            transitions: Vec::new(),
            snapshots: Vec::new(),
            seen_digests: HashSet::new(),
            skip_states: Arc::new(Mutex::new(SkipStateSet::new())),
            event_budget,
            events_fired: 0,
            crawl_depth: 0,
            cookie_jar: Arc::new(reqwest::cookie::Jar::default()),
            on_new_page: Vec::new(),
            on_fire_event: Vec::new(),
            shut_down: false,
        })
    }

    /// Replaces the skip-state partition; workers cooperating on one job
    /// share a partition handed out by the cluster
    pub fn set_skip_states(&mut self, skip_states: Arc<Mutex<SkipStateSet>>) {
        self.skip_states = skip_states;
    }

    /// Resets the per-job event counter, budget, and crawl depth
    pub fn begin_job(&mut self, event_budget: u32) {
        self.event_budget = event_budget;
        self.events_fired = 0;
        self.crawl_depth = 0;
    }

    pub fn on_new_page(&mut self, observer: impl Fn(&Page) + Send + Sync + 'static) {
        self.on_new_page.push(Box::new(observer));
    }

    pub fn on_fire_event(
        &mut self,
        observer: impl Fn(&ElementLocator, PageEvent) + Send + Sync + 'static,
    ) {
        self.on_fire_event.push(Box::new(observer));
    }

    /// The process-wide cookie jar synchronized from browser cookies
    pub fn cookie_jar(&self) -> Arc<reqwest::cookie::Jar> {
        Arc::clone(&self.cookie_jar)
    }

    /// Whether the supervised process still exists
    pub fn alive(&mut self) -> bool {
        self.process.alive()
    }

    /// Loads a job resource, dispatching on its variant
    pub async fn load(&mut self, resource: &Resource) -> Result<(), SpecterError> {
        match resource {
            Resource::Url(url) => {
                self.transitions.clear();
                let _ = self.proxy.drain_transitions();
                self.goto_with(url, TransitionOptions::default(), true, true)
                    .await
            }
            Resource::Response(response) => {
                self.proxy.preload(response.clone());
                self.transitions.clear();
                let _ = self.proxy.drain_transitions();
                self.goto_with(&response.url, TransitionOptions::default(), true, true)
                    .await
            }
            Resource::Page(page) => {
                self.install_cookies(&page.cookies, &page.url).await;
                self.restore(&page.dom).await
            }
            Resource::Dom(dom) => self.restore(dom).await,
        }
    }

    /// Navigates to a URL, recording the transition and capturing a snapshot
    pub async fn goto(&mut self, url: &Url, options: TransitionOptions) -> Result<(), SpecterError> {
        self.goto_with(url, options, true, true).await
    }

    async fn goto_with(
        &mut self,
        url: &Url,
        options: TransitionOptions,
        record: bool,
        capture: bool,
    ) -> Result<(), SpecterError> {
        tracing::debug!("Navigating to {}", url);
        let mut transition =
            Transition::start(TransitionTarget::Url(url.clone()), PageEvent::Load, options);

        self.proxy.set_root_url(url.clone());
        self.driver.navigate_to(url.as_str()).await?;
        self.wait_for_ready(url).await?;

        transition.complete();
        if record {
            self.transitions.push(transition);
        }
        if capture {
            self.capture_snapshot().await?;
        }
        Ok(())
    }

    /// Replays a DOM state's transition path without re-recording it.
    ///
    /// Observed-request transitions are skipped; they replay themselves as a
    /// side effect of the navigations and events around them.
    pub async fn restore(&mut self, dom: &DomState) -> Result<(), SpecterError> {
        self.transitions.clear();

        for transition in &dom.transitions {
            match (&transition.target, transition.event) {
                (_, PageEvent::Request) => continue,
                (TransitionTarget::Url(url), PageEvent::Load) => {
                    self.goto_with(url, transition.options.clone(), false, false)
                        .await?;
                }
                (TransitionTarget::Element(locator), event) => {
                    self.perform_event(locator, event, transition.options.clone(), false)
                        .await?;
                }
                (target, event) => {
                    return Err(SpecterError::Load(format!(
                        "cannot replay {} against {:?}",
                        event, target
                    )));
                }
            }
        }

        // The replayed path becomes this page's history verbatim, so a
        // re-captured snapshot digests identically.
        self.transitions = dom.transitions.clone();
        let _ = self.proxy.drain_transitions();
        Ok(())
    }

    /// Merges cookies into the shared jar and, best effort, into the browser
    pub async fn install_cookies(&mut self, cookies: &[Cookie], url: &Url) {
        merge_into_jar(&self.cookie_jar, cookies, url);
        for cookie in cookies {
            if let Err(error) = self.driver.add_cookie(cookie).await {
                tracing::debug!("Could not install cookie {}: {}", cookie.name, error);
            }
        }
    }

    /// Enumerates visible elements carrying events, skipping elements whose
    /// navigation target is out of scope
    pub async fn collect_event_elements(&self) -> Result<Vec<EventElement>, SpecterError> {
        let current = self.current_url().await?;
        let scan = self
            .driver
            .execute_script(ELEMENT_SCAN_SCRIPT, json!([]))
            .await?;

        let mut elements = parse_scan_results(&scan);
        elements.retain(|element| {
            anchor_in_scope(&self.scope, &current, element, self.crawl_depth)
        });
        Ok(elements)
    }

    /// Fires every unseen (element, event) pair on the current page.
    ///
    /// Each pair is marked in the skip-state partition before firing, so a
    /// slow or failed fire can never cause a re-trigger. Stops early when the
    /// shared per-job event budget is spent.
    pub async fn trigger_events(&mut self) -> Result<(), SpecterError> {
        let current = self.current_url().await?;
        let elements = self.collect_event_elements().await?;

        for element in elements {
            for event in element.events.clone() {
                if self.events_fired >= self.event_budget {
                    tracing::debug!(
                        "Event budget of {} spent; stopping exploration of {}",
                        self.event_budget,
                        current
                    );
                    return Ok(());
                }

                let signature = element_signature(&current, &element.locator, &[event]);
                {
                    let mut skip_states = self.skip_states.lock().unwrap();
                    if !skip_states.insert(signature) {
                        continue;
                    }
                }

                self.events_fired += 1;
                let options = default_options_for(&element.locator, event);
                self.perform_event(&element.locator, event, options, true)
                    .await?;
                self.restore_current(&current).await?;
            }
        }
        Ok(())
    }

    // After an event may have navigated away, return to the page under
    // exploration so the remaining pairs see the same DOM.
    async fn restore_current(&mut self, url: &Url) -> Result<(), SpecterError> {
        let now = self.current_url().await?;
        if &now != url {
            self.goto_with(url, TransitionOptions::default(), false, false)
                .await?;
        }
        Ok(())
    }

    /// Fires one event against one element.
    ///
    /// Driver-level failures are logged and reported as "no transition";
    /// exploration continues.
    pub async fn fire_event(
        &mut self,
        locator: &ElementLocator,
        event: PageEvent,
        options: TransitionOptions,
    ) -> Result<Option<Transition>, SpecterError> {
        self.perform_event(locator, event, options, true).await
    }

    async fn perform_event(
        &mut self,
        locator: &ElementLocator,
        event: PageEvent,
        options: TransitionOptions,
        record: bool,
    ) -> Result<Option<Transition>, SpecterError> {
        let mut transition =
            Transition::start(TransitionTarget::Element(locator.clone()), event, options);

        for observer in &self.on_fire_event {
            observer(locator, event);
        }

        let outcome = self.dispatch_event(locator, event, &transition.options).await;
        if let Err(error) = outcome {
            tracing::debug!("Firing {} on {} failed: {}", event, locator, error);
            return Ok(None);
        }

        self.wait_for_timers().await;
        transition.complete();

        if record {
            self.transitions.push(transition.clone());
            self.capture_snapshot().await?;
        }
        Ok(Some(transition))
    }

    async fn dispatch_event(
        &self,
        locator: &ElementLocator,
        event: PageEvent,
        options: &TransitionOptions,
    ) -> Result<(), DriverError> {
        let selector = locator.css_selector();

        match event {
            PageEvent::Submit if locator.tag_name == "form" => {
                self.fill_form(&selector, options).await?;
                self.submit_form(&selector).await
            }
            PageEvent::Click => {
                let element = self.locate(&selector).await?;
                self.driver.click(&element).await
            }
            event if event.is_input_family() => {
                let element = self.locate(&selector).await?;
                let value = input_value_for(locator, options);
                self.driver.clear(&element).await?;
                self.driver.send_keys(&element, &value).await?;
                // Browsers do not reliably dispatch these from synthetic
                // input, so they are forced explicitly.
                for forced in ["focus", "change", "blur"] {
                    self.dispatch_dom_event(&selector, forced).await?;
                }
                if event == PageEvent::Select {
                    self.dispatch_dom_event(&selector, "select").await?;
                }
                Ok(())
            }
            event => self.dispatch_dom_event(&selector, event.name()).await,
        }
    }

    async fn fill_form(
        &self,
        form_selector: &str,
        options: &TransitionOptions,
    ) -> Result<(), DriverError> {
        for (name, value) in &options.inputs {
            let selector = format!("{} [name=\"{}\"]", form_selector, name);
            match self.locate(&selector).await {
                Ok(element) => {
                    self.driver.clear(&element).await?;
                    self.driver.send_keys(&element, value).await?;
                }
                Err(error) => {
                    tracing::debug!("Form input {} not found: {}", selector, error);
                }
            }
        }
        Ok(())
    }

    /// Native submit control first, synthesized submit event as fallback
    async fn submit_form(&self, form_selector: &str) -> Result<(), DriverError> {
        let submit_selector = format!(
            "{} [type=\"submit\"], {} button:not([type])",
            form_selector, form_selector
        );
        if let Some(control) = self.driver.find_elements(&submit_selector).await?.first() {
            return self.driver.click(control).await;
        }
        self.dispatch_dom_event(form_selector, "submit").await
    }

    async fn dispatch_dom_event(&self, selector: &str, event: &str) -> Result<(), DriverError> {
        let script = "var el = document.querySelector(arguments[0]); \
                      if (el) { el.dispatchEvent(new Event(arguments[1], \
                      { bubbles: true, cancelable: true })); }";
        self.driver
            .execute_script(script, json!([selector, event]))
            .await?;
        Ok(())
    }

    async fn locate(&self, selector: &str) -> Result<ElementRef, DriverError> {
        self.driver
            .find_elements(selector)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| DriverError::Protocol {
                error: "no such element".to_string(),
                message: selector.to_string(),
            })
    }

    /// Blocks until the page is ready: instrumentation present, client-side
    /// timers drained, proxy quiescent, and configured selectors visible
    async fn wait_for_ready(&mut self, url: &Url) -> Result<(), SpecterError> {
        self.ensure_instrumented().await?;
        self.wait_for_timers().await;
        self.proxy.wait_for_pending_requests(self.job_timeout).await;
        self.wait_for_configured_elements(url).await;
        Ok(())
    }

    async fn ensure_instrumented(&self) -> Result<(), SpecterError> {
        let installed = self
            .driver
            .execute_script(CHECK_INSTRUMENTED_SCRIPT, json!([]))
            .await?
            .as_bool()
            .unwrap_or(false);

        if !installed {
            self.driver
                .execute_script(INSTRUMENTATION_SOURCE, json!([]))
                .await?;
        }
        Ok(())
    }

    /// Polls the instrumentation's pending-timer count until it drains,
    /// bounded by the request timeout
    async fn wait_for_timers(&self) {
        let deadline = tokio::time::Instant::now() + self.config.request_timeout();

        loop {
            let pending = self
                .driver
                .execute_script(PENDING_TIMERS_SCRIPT, json!([]))
                .await
                .ok()
                .and_then(|value| value.as_i64())
                .unwrap_or(0);

            if pending <= 0 {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::debug!("{} client-side timer(s) still pending; proceeding", pending);
                return;
            }
            tokio::time::sleep(TIMER_POLL_INTERVAL).await;
        }
    }

    /// Waits for configured per-URL selectors; a miss is logged, not fatal
    async fn wait_for_configured_elements(&self, url: &Url) {
        let selectors: Vec<String> = self
            .config
            .wait_for_elements
            .iter()
            .filter(|entry| url.as_str().contains(&entry.url_pattern))
            .flat_map(|entry| entry.selectors.iter().cloned())
            .collect();

        for selector in selectors {
            let deadline = tokio::time::Instant::now() + self.job_timeout;
            loop {
                match self.driver.find_elements(&selector).await {
                    Ok(found) if !found.is_empty() => break,
                    Ok(_) | Err(_) => {}
                }
                if tokio::time::Instant::now() >= deadline {
                    tracing::warn!("Selector {} never appeared on {}", selector, url);
                    break;
                }
                tokio::time::sleep(TIMER_POLL_INTERVAL).await;
            }
        }
    }

    /// Captures the current DOM state, deduplicated by digest.
    ///
    /// Returns the new snapshot, or None when this state was seen before.
    pub async fn capture_snapshot(&mut self) -> Result<Option<Page>, SpecterError> {
        self.transitions.extend(self.proxy.drain_transitions());

        let url = Url::parse(&self.driver.current_url().await?)?;
        let body = self.driver.page_source().await?;

        let mut page = Page::new(url.clone(), body);
        page.dom.transitions = self.transitions.clone();

        match self.driver.cookies().await {
            Ok(cookies) => {
                merge_into_jar(&self.cookie_jar, &cookies, &url);
                page.cookies = cookies;
            }
            Err(error) => tracing::debug!("Cookie read failed for {}: {}", url, error),
        }

        page.data_flow_sinks = self.drain_sinks(DATA_FLOW_SINKS_SCRIPT).await;
        page.execution_flow_sinks = self.drain_sinks(EXECUTION_FLOW_SINKS_SCRIPT).await;

        let digest = page.digest();
        if !self.seen_digests.insert(digest) {
            return Ok(None);
        }

        for observer in &self.on_new_page {
            observer(&page);
        }
        self.snapshots.push(page.clone());
        Ok(Some(page))
    }

    async fn drain_sinks(&self, script: &str) -> Vec<Value> {
        match self.driver.execute_script(script, json!([])).await {
            Ok(Value::Array(sinks)) => sinks,
            Ok(_) => Vec::new(),
            Err(error) => {
                tracing::debug!("Sink drain failed: {}", error);
                Vec::new()
            }
        }
    }

    /// Takes all snapshots captured since the last flush
    pub fn flush_snapshots(&mut self) -> Vec<Page> {
        std::mem::take(&mut self.snapshots)
    }

    /// Fixed-point exploration: trigger events on every known page until no
    /// new snapshots appear or the depth bound is hit
    pub async fn explore_and_flush(
        &mut self,
        max_depth: Option<u32>,
    ) -> Result<Vec<Page>, SpecterError> {
        self.crawl_depth = 0;
        self.trigger_events().await?;
        let mut collected = self.flush_snapshots();
        let mut frontier = collected.clone();
        let mut depth: u32 = 0;

        while !frontier.is_empty() {
            depth += 1;
            if let Some(bound) = max_depth {
                if depth > bound {
                    tracing::debug!("Exploration depth bound {} reached", bound);
                    break;
                }
            }
            // Anchors found this round sit one hop further from the root
            self.crawl_depth = depth;

            let mut discovered = Vec::new();
            for page in &frontier {
                self.restore(&page.dom).await?;
                self.trigger_events().await?;
                discovered.extend(self.flush_snapshots());
            }

            tracing::debug!("Exploration round {} found {} new page(s)", depth, discovered.len());
            collected.extend(discovered.iter().cloned());
            frontier = discovered;
        }

        Ok(collected)
    }

    /// Synthetic input elements the proxy harvested from observed traffic
    pub fn captured_inputs(&self) -> Vec<ElementLocator> {
        self.proxy.drain_captured_inputs()
    }

    async fn current_url(&self) -> Result<Url, SpecterError> {
        Ok(Url::parse(&self.driver.current_url().await?)?)
    }

    /// Tears down the driver session, the proxy, and the process. Idempotent.
    pub async fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;

        if let Err(error) = self.driver.quit().await {
            tracing::debug!("Driver session teardown failed: {}", error);
        }
        self.proxy.shutdown();
        self.process.shutdown().await;
    }
}

/// WebDriver capabilities routing all browser traffic through the proxy
fn capabilities(proxy: &InterceptProxy, config: &BrowserConfig) -> Value {
    let proxy_host = proxy.address().to_string();
    json!({
        "browserName": "chrome",
        "proxy": {
            "proxyType": "manual",
            "httpProxy": proxy_host,
            "sslProxy": proxy_host
        },
        "goog:chromeOptions": {
            "args": [
                "--headless=new",
                "--disable-gpu",
                "--ignore-certificate-errors",
                format!("--window-size={},{}", config.width, config.height),
                format!("--proxy-server={}", proxy.url())
            ]
        },
        "specter:authToken": proxy.auth_token()
    })
}

/// Decodes the in-page element scan into locators plus their events.
///
/// Anchors, forms, and image inputs get their implicit click/submit events
/// synthesized here even when they carry no handler attributes.
fn parse_scan_results(scan: &Value) -> Vec<EventElement> {
    let entries = match scan.as_array() {
        Some(entries) => entries,
        None => return Vec::new(),
    };

    let mut elements = Vec::new();
    for entry in entries {
        let tag = match entry.get("tag").and_then(Value::as_str) {
            Some(tag) => tag,
            None => continue,
        };

        let mut attributes = BTreeMap::new();
        if let Some(Value::Object(raw)) = entry.get("attributes") {
            for (name, value) in raw {
                if let Some(value) = value.as_str() {
                    attributes.insert(name.clone(), value.to_string());
                }
            }
        }

        let mut events: Vec<PageEvent> = entry
            .get("events")
            .and_then(Value::as_array)
            .map(|names| {
                names
                    .iter()
                    .filter_map(Value::as_str)
                    .filter_map(PageEvent::from_attribute)
                    .collect()
            })
            .unwrap_or_default();

        let implicit = match tag {
            "a" => Some(PageEvent::Click),
            "form" => Some(PageEvent::Submit),
            "input" if attributes.get("type").map(String::as_str) == Some("image") => {
                Some(PageEvent::Click)
            }
            _ => None,
        };
        if let Some(event) = implicit {
            if !events.contains(&event) {
                events.push(event);
            }
        }

        if events.is_empty() {
            continue;
        }

        let locator = EventElement {
            locator: ElementLocator {
                tag_name: tag.to_lowercase(),
                attributes,
            },
            events,
        };
        elements.push(locator);
    }
    elements
}

/// Default transition options for an event: input-family events carry a
/// sample value keyed by the element's name
fn default_options_for(locator: &ElementLocator, event: PageEvent) -> TransitionOptions {
    let mut options = TransitionOptions::default();
    if event.is_input_family() || event == PageEvent::Submit {
        if let Some(name) = locator.attributes.get("name") {
            options
                .inputs
                .insert(name.clone(), SAMPLE_INPUT_VALUE.to_string());
        }
    }
    options
}

/// Whether an anchor's navigation target stays in scope one hop deeper
/// than the page it sits on. Non-anchors always pass.
fn anchor_in_scope(scope: &Scope, current: &Url, element: &EventElement, depth: u32) -> bool {
    if element.locator.tag_name != "a" {
        return true;
    }
    let href = match element.locator.attributes.get("href") {
        Some(href) => href,
        None => return true,
    };
    match current.join(href) {
        Ok(target) => scope.allows(&target, depth.saturating_add(1)),
        Err(_) => false,
    }
}

fn input_value_for(locator: &ElementLocator, options: &TransitionOptions) -> String {
    locator
        .attributes
        .get("name")
        .and_then(|name| options.inputs.get(name))
        .cloned()
        .unwrap_or_else(|| SAMPLE_INPUT_VALUE.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScopeConfig;

    fn test_scope() -> Arc<Scope> {
        Arc::new(Scope::new(ScopeConfig {
            domains: vec!["127.0.0.1".to_string()],
            exclude_patterns: vec![],
            include_patterns: vec![],
            redundant_path_patterns: vec![],
            max_depth: None,
            https_only: false,
            asset_domains: vec![],
        }))
    }

    #[tokio::test]
    async fn test_launch_spawn_attempts_are_bounded() {
        // /bin/true never prints a readiness marker; every attempt fails
        // fast on stream EOF, each behind a fresh proxy.
        let config = BrowserConfig {
            executable_path: Some("/bin/true".to_string()),
            spawn_timeout_ms: 200,
            spawn_retries: 3,
            request_timeout_ms: 1_000,
            width: 1600,
            height: 1200,
            wait_for_elements: vec![],
        };

        let started = std::time::Instant::now();
        let result = Browser::launch(config, test_scope(), Duration::from_secs(1), 10).await;

        match result {
            Err(SpecterError::Browser(BrowserError::SpawnFailed { attempts })) => {
                assert_eq!(attempts, 3)
            }
            _ => panic!("expected a bounded spawn failure"),
        }
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_parse_scan_results_decodes_handlers() {
        let scan = json!([
            {
                "tag": "button",
                "attributes": { "id": "save", "onclick": "save()" },
                "events": ["onclick"]
            }
        ]);

        let elements = parse_scan_results(&scan);
        assert_eq!(elements.len(), 1);
        assert_eq!(elements[0].locator.tag_name, "button");
        assert_eq!(elements[0].events, vec![PageEvent::Click]);
    }

    #[test]
    fn test_parse_scan_results_synthesizes_implicit_events() {
        let scan = json!([
            { "tag": "a", "attributes": { "href": "/next" }, "events": [] },
            { "tag": "form", "attributes": { "action": "/post" }, "events": [] },
            { "tag": "input", "attributes": { "type": "image" }, "events": [] },
            { "tag": "span", "attributes": {}, "events": [] }
        ]);

        let elements = parse_scan_results(&scan);
        assert_eq!(elements.len(), 3);
        assert_eq!(elements[0].events, vec![PageEvent::Click]);
        assert_eq!(elements[1].events, vec![PageEvent::Submit]);
        assert_eq!(elements[2].events, vec![PageEvent::Click]);
    }

    #[test]
    fn test_parse_scan_results_deduplicates_implicit_click() {
        let scan = json!([
            { "tag": "a", "attributes": { "href": "/x", "onclick": "go()" },
              "events": ["onclick"] }
        ]);

        let elements = parse_scan_results(&scan);
        assert_eq!(elements[0].events, vec![PageEvent::Click]);
    }

    #[test]
    fn test_anchor_filtering_honors_crawl_depth() {
        let scope = Scope::new(ScopeConfig {
            domains: vec!["target.test".to_string()],
            exclude_patterns: vec![],
            include_patterns: vec![],
            redundant_path_patterns: vec![],
            max_depth: Some(1),
            https_only: false,
            asset_domains: vec![],
        });
        let current = Url::parse("http://target.test/").unwrap();
        let anchor = EventElement {
            locator: ElementLocator::new("a").with_attribute("href", "/next"),
            events: vec![PageEvent::Click],
        };

        // One hop from the root is within the bound; two hops is not
        assert!(anchor_in_scope(&scope, &current, &anchor, 0));
        assert!(!anchor_in_scope(&scope, &current, &anchor, 1));

        // Non-anchors are never depth-filtered
        let button = EventElement {
            locator: ElementLocator::new("button").with_attribute("onclick", "go()"),
            events: vec![PageEvent::Click],
        };
        assert!(anchor_in_scope(&scope, &current, &button, 5));
    }

    #[test]
    fn test_default_options_inject_sample_values() {
        let input = ElementLocator::new("input").with_attribute("name", "q");
        let options = default_options_for(&input, PageEvent::Input);
        assert_eq!(options.inputs.get("q").map(String::as_str), Some(SAMPLE_INPUT_VALUE));

        let button = ElementLocator::new("button").with_attribute("id", "go");
        assert!(default_options_for(&button, PageEvent::Click).inputs.is_empty());
    }

    #[test]
    fn test_input_value_prefers_job_supplied() {
        let input = ElementLocator::new("input").with_attribute("name", "user");
        let mut options = TransitionOptions::default();
        options.inputs.insert("user".to_string(), "alice".to_string());

        assert_eq!(input_value_for(&input, &options), "alice");
        assert_eq!(
            input_value_for(&input, &TransitionOptions::default()),
            SAMPLE_INPUT_VALUE
        );
    }
}
