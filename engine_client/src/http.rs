//! Plain HTTP calls for non-realtime operations.
//!
//! `GET` succeeds on 200 and 304, `POST`/`DELETE` on 200 only. Any other
//! status is an `ApiError::Status` carrying the server's `message`, or the
//! raw body when it is not the JSON error shape.

use std::time::Duration;

use engine_shared::{config::EngineConfig, net::ErrorBody};
use reqwest::{Method, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{message} (status {status})")]
    Status { status: u16, message: String },
    #[error("transport: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("decode: {0}")]
    Decode(#[from] serde_json::Error),
}

impl ApiError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            auth_token: None,
        })
    }

    pub fn from_config(config: &EngineConfig) -> Result<Self, ApiError> {
        let timeout = config.call_timeout().unwrap_or(Duration::from_secs(30));
        let mut client = Self::new(config.http_base_url(), timeout)?;
        client.auth_token = config.auth_token.clone();
        Ok(client)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn get(&self, path: &str) -> Result<Value, ApiError> {
        self.call(Method::GET, path, None::<&()>).await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        Ok(serde_json::from_value(self.get(path).await?)?)
    }

    pub async fn post(&self, path: &str, body: &impl Serialize) -> Result<Value, ApiError> {
        self.call(Method::POST, path, Some(body)).await
    }

    pub async fn delete(&self, path: &str) -> Result<Value, ApiError> {
        self.call(Method::DELETE, path, None::<&()>).await
    }

    async fn call<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<Value, ApiError> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.http.request(method.clone(), url);
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;
        debug!(method = %method, path, status = status.as_u16(), "HTTP call");

        if !accepts(&method, status) {
            return Err(ApiError::Status {
                status: status.as_u16(),
                message: error_message(&text),
            });
        }
        Ok(parse_body(&text))
    }
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("base_url", &self.base_url)
            .finish()
    }
}

fn accepts(method: &Method, status: StatusCode) -> bool {
    status == StatusCode::OK || (*method == Method::GET && status == StatusCode::NOT_MODIFIED)
}

/// Empty bodies read as `null`; non-JSON bodies as a string.
fn parse_body(text: &str) -> Value {
    if text.trim().is_empty() {
        return Value::Null;
    }
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}

fn error_message(text: &str) -> String {
    serde_json::from_str::<ErrorBody>(text)
        .map(|body| body.message)
        .unwrap_or_else(|_| text.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_get_accepts_not_modified() {
        assert!(accepts(&Method::GET, StatusCode::OK));
        assert!(accepts(&Method::GET, StatusCode::NOT_MODIFIED));
        assert!(!accepts(&Method::POST, StatusCode::NOT_MODIFIED));
        assert!(!accepts(&Method::DELETE, StatusCode::NO_CONTENT));
        assert!(!accepts(&Method::POST, StatusCode::CREATED));
    }

    #[test]
    fn error_message_prefers_message_field() {
        assert_eq!(error_message(r#"{"message":"nope"}"#), "nope");
        assert_eq!(error_message("gateway timeout"), "gateway timeout");
        assert_eq!(error_message(r#"{"error":"x"}"#), r#"{"error":"x"}"#);
    }

    #[test]
    fn body_parsing() {
        assert_eq!(parse_body(""), Value::Null);
        assert_eq!(parse_body(r#"{"a":1}"#), serde_json::json!({"a": 1}));
        assert_eq!(parse_body("plain"), Value::String("plain".into()));
    }

    #[test]
    fn client_uses_http_base_url() {
        let client = ApiClient::from_config(&EngineConfig::local("127.0.0.1", 8080)).unwrap();
        assert_eq!(client.base_url(), "http://127.0.0.1:8080");
    }
}
