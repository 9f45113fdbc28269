//! Outbound request description.
//!
//! # Responsibilities
//! - Describe one outbound HTTP call independently of the transport
//! - Derive the circuit breaker key (logical service name or host)
//! - Carry the per-attempt timeout

use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Default per-attempt timeout.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Error)]
pub enum RequestSpecError {
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("URL '{0}' has no host")]
    MissingHost(String),

    #[error("unsupported method '{0}'")]
    Method(String),
}

/// An outbound HTTP request that can be sent repeatedly.
#[derive(Debug, Clone)]
pub struct RequestSpec {
    pub method: Method,
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    /// Per-attempt timeout.
    pub timeout: Duration,
    /// Logical service name; overrides the host as breaker key.
    pub service: Option<String>,
}

impl RequestSpec {
    pub fn new(method: Method, url: &str) -> Result<Self, RequestSpecError> {
        let url = Url::parse(url)?;
        if url.host_str().is_none() {
            return Err(RequestSpecError::MissingHost(url.to_string()));
        }
        Ok(Self {
            method,
            url,
            headers: Vec::new(),
            body: None,
            timeout: DEFAULT_TIMEOUT,
            service: None,
        })
    }

    pub fn get(url: &str) -> Result<Self, RequestSpecError> {
        Self::new(Method::GET, url)
    }

    /// POST with a JSON body.
    pub fn post_json(url: &str, body: &serde_json::Value) -> Result<Self, RequestSpecError> {
        let mut spec = Self::new(Method::POST, url)?;
        spec.body = Some(body.to_string().into_bytes());
        spec.headers
            .push(("content-type".to_string(), "application/json".to_string()));
        Ok(spec)
    }

    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Breaker key: the service name if set, else `host[:port]`.
    pub fn target_key(&self) -> String {
        if let Some(service) = &self.service {
            return service.clone();
        }
        let host = self.url.host_str().unwrap_or_default();
        match self.url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        }
    }
}

/// Serializable form used by the admin API to submit deliveries.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RequestTemplate {
    #[serde(default = "default_method")]
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default)]
    pub body: Option<serde_json::Value>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub service: Option<String>,
}

fn default_method() -> String {
    "POST".to_string()
}

impl TryFrom<RequestTemplate> for RequestSpec {
    type Error = RequestSpecError;

    fn try_from(template: RequestTemplate) -> Result<Self, Self::Error> {
        let method = Method::from_bytes(template.method.to_uppercase().as_bytes())
            .map_err(|_| RequestSpecError::Method(template.method.clone()))?;
        let mut spec = RequestSpec::new(method, &template.url)?;
        spec.headers = template.headers;
        if let Some(body) = template.body {
            spec.body = Some(body.to_string().into_bytes());
            spec.headers
                .push(("content-type".to_string(), "application/json".to_string()));
        }
        if let Some(ms) = template.timeout_ms {
            spec.timeout = Duration::from_millis(ms);
        }
        spec.service = template.service;
        Ok(spec)
    }
}
