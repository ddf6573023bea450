//! Remote browser-automation client
//!
//! A thin JSON-over-HTTP client for the WebDriver endpoint the supervised
//! driver process exposes. Commands return the decoded `value` payload;
//! protocol-level failures surface as [`DriverError::Protocol`] with the
//! driver's own error code and message.

use crate::page::Cookie;
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;

/// W3C WebDriver element reference key
pub const ELEMENT_KEY: &str = "element-6066-11e4-a52e-4f735466cecf";

/// Driver protocol errors
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("Driver transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Driver protocol error {error}: {message}")]
    Protocol { error: String, message: String },

    #[error("Driver payload error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("No active driver session")]
    NoSession,
}

/// Opaque reference to a located DOM element
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementRef(String);

impl ElementRef {
    pub fn id(&self) -> &str {
        &self.0
    }
}

/// One WebDriver session against a local driver process
pub struct Driver {
    client: reqwest::Client,
    base_url: String,
    session_id: Option<String>,
}

impl Driver {
    /// Builds a client for the driver listening on the given local port
    pub fn connect(port: u16, request_timeout: Duration) -> Result<Self, DriverError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: format!("http://127.0.0.1:{}", port),
            session_id: None,
        })
    }

    /// Opens a session with the given capabilities
    pub async fn new_session(&mut self, capabilities: Value) -> Result<(), DriverError> {
        let value = self
            .raw_command(
                reqwest::Method::POST,
                "/session",
                Some(json!({ "capabilities": { "alwaysMatch": capabilities } })),
            )
            .await?;

        let session_id = value
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| DriverError::Protocol {
                error: "session not created".to_string(),
                message: "driver response carried no sessionId".to_string(),
            })?;
        self.session_id = Some(session_id.to_string());
        Ok(())
    }

    pub fn has_session(&self) -> bool {
        self.session_id.is_some()
    }

    pub async fn navigate_to(&self, url: &str) -> Result<(), DriverError> {
        self.session_command(reqwest::Method::POST, "url", Some(json!({ "url": url })))
            .await?;
        Ok(())
    }

    pub async fn current_url(&self) -> Result<String, DriverError> {
        let value = self
            .session_command(reqwest::Method::GET, "url", None)
            .await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    pub async fn page_source(&self) -> Result<String, DriverError> {
        let value = self
            .session_command(reqwest::Method::GET, "source", None)
            .await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    /// Executes a synchronous script, returning its JSON result
    pub async fn execute_script(&self, script: &str, args: Value) -> Result<Value, DriverError> {
        self.session_command(
            reqwest::Method::POST,
            "execute/sync",
            Some(json!({ "script": script, "args": args })),
        )
        .await
    }

    /// Finds all elements matching a CSS selector
    pub async fn find_elements(&self, selector: &str) -> Result<Vec<ElementRef>, DriverError> {
        let value = self
            .session_command(
                reqwest::Method::POST,
                "elements",
                Some(json!({ "using": "css selector", "value": selector })),
            )
            .await?;

        let refs = value
            .as_array()
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|entry| entry.get(ELEMENT_KEY))
                    .filter_map(Value::as_str)
                    .map(|id| ElementRef(id.to_string()))
                    .collect()
            })
            .unwrap_or_default();
        Ok(refs)
    }

    pub async fn click(&self, element: &ElementRef) -> Result<(), DriverError> {
        self.session_command(
            reqwest::Method::POST,
            &format!("element/{}/click", element.id()),
            Some(json!({})),
        )
        .await?;
        Ok(())
    }

    pub async fn send_keys(&self, element: &ElementRef, text: &str) -> Result<(), DriverError> {
        self.session_command(
            reqwest::Method::POST,
            &format!("element/{}/value", element.id()),
            Some(json!({ "text": text })),
        )
        .await?;
        Ok(())
    }

    pub async fn clear(&self, element: &ElementRef) -> Result<(), DriverError> {
        self.session_command(
            reqwest::Method::POST,
            &format!("element/{}/clear", element.id()),
            Some(json!({})),
        )
        .await?;
        Ok(())
    }

    pub async fn window_handles(&self) -> Result<Vec<String>, DriverError> {
        let value = self
            .session_command(reqwest::Method::GET, "window/handles", None)
            .await?;
        let handles = value
            .as_array()
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Ok(handles)
    }

    pub async fn set_window_size(&self, width: u32, height: u32) -> Result<(), DriverError> {
        self.session_command(
            reqwest::Method::POST,
            "window/rect",
            Some(json!({ "width": width, "height": height })),
        )
        .await?;
        Ok(())
    }

    pub async fn cookies(&self) -> Result<Vec<Cookie>, DriverError> {
        let value = self
            .session_command(reqwest::Method::GET, "cookie", None)
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn add_cookie(&self, cookie: &Cookie) -> Result<(), DriverError> {
        self.session_command(
            reqwest::Method::POST,
            "cookie",
            Some(json!({ "cookie": serde_json::to_value(cookie)? })),
        )
        .await?;
        Ok(())
    }

    pub async fn delete_cookies(&self) -> Result<(), DriverError> {
        self.session_command(reqwest::Method::DELETE, "cookie", None)
            .await?;
        Ok(())
    }

    /// Ends the session. Idempotent; without a session it is a no-op.
    pub async fn quit(&mut self) -> Result<(), DriverError> {
        let session_id = match self.session_id.take() {
            Some(session_id) => session_id,
            None => return Ok(()),
        };
        self.raw_command(
            reqwest::Method::DELETE,
            &format!("/session/{}", session_id),
            None,
        )
        .await?;
        Ok(())
    }

    async fn session_command(
        &self,
        method: reqwest::Method,
        suffix: &str,
        body: Option<Value>,
    ) -> Result<Value, DriverError> {
        let session_id = self.session_id.as_ref().ok_or(DriverError::NoSession)?;
        let path = format!("/session/{}/{}", session_id, suffix);
        self.raw_command(method, &path, body).await
    }

    async fn raw_command(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value, DriverError> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.client.request(method, &url);
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await?;
        let status = response.status();
        let payload: Value = response.json().await?;
        let value = payload.get("value").cloned().unwrap_or(Value::Null);

        if !status.is_success() {
            return Err(DriverError::Protocol {
                error: value
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string(),
                message: value
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            });
        }

        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn driver_for(server: &MockServer) -> Driver {
        let port = server.address().port();
        Driver::connect(port, Duration::from_secs(2)).unwrap()
    }

    #[tokio::test]
    async fn test_new_session_extracts_session_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/session"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "value": { "sessionId": "abc-123", "capabilities": {} }
            })))
            .mount(&server)
            .await;

        let mut driver = driver_for(&server).await;
        driver.new_session(serde_json::json!({})).await.unwrap();
        assert!(driver.has_session());
    }

    #[tokio::test]
    async fn test_commands_require_session() {
        let server = MockServer::start().await;
        let driver = driver_for(&server).await;

        assert!(matches!(
            driver.navigate_to("https://example.com/").await,
            Err(DriverError::NoSession)
        ));
    }

    #[tokio::test]
    async fn test_protocol_error_decoding() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/session"))
            .respond_with(ResponseTemplate::new(500).set_body_json(serde_json::json!({
                "value": { "error": "session not created", "message": "no browser" }
            })))
            .mount(&server)
            .await;

        let mut driver = driver_for(&server).await;
        let result = driver.new_session(serde_json::json!({})).await;
        match result {
            Err(DriverError::Protocol { error, message }) => {
                assert_eq!(error, "session not created");
                assert_eq!(message, "no browser");
            }
            other => panic!("expected protocol error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_find_elements_unwraps_element_key() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/session"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "value": { "sessionId": "s-1" }
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/session/s-1/elements"))
            .and(body_partial_json(
                serde_json::json!({ "using": "css selector" }),
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "value": [
                    { (ELEMENT_KEY): "el-1" },
                    { (ELEMENT_KEY): "el-2" }
                ]
            })))
            .mount(&server)
            .await;

        let mut driver = driver_for(&server).await;
        driver.new_session(serde_json::json!({})).await.unwrap();

        let elements = driver.find_elements("a[href]").await.unwrap();
        assert_eq!(elements.len(), 2);
        assert_eq!(elements[0].id(), "el-1");
    }

    #[tokio::test]
    async fn test_quit_without_session_is_noop() {
        let server = MockServer::start().await;
        let mut driver = driver_for(&server).await;
        driver.quit().await.unwrap();
    }
}
