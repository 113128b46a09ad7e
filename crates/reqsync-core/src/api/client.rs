//! API client for communicating with the console's REST backend.
//!
//! `ApiClient` owns a `Transport` (reqwest in production) and an
//! `InterceptorChain`. Every call, whatever its method, is executed through
//! `ApiClient::execute` so that registered interceptors observe it.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::future::BoxFuture;
use reqwest::{header, Client, Method, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::Config;

use super::intercept::{CallOutcome, Interceptor, InterceptorChain};
use super::ApiError;

// ============================================================================
// Constants
// ============================================================================

/// Maximum number of retries for rate-limited (429) GET requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

/// Header Django reads the CSRF token from.
const CSRF_HEADER: &str = "X-CSRFToken";

/// A request as seen by transports and interceptors.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    /// Path relative to the base URL, optionally with a query string.
    pub path: String,
    pub body: Option<Value>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
        }
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// The path without any query string.
    pub fn route(&self) -> &str {
        self.path.split('?').next().unwrap_or(&self.path)
    }
}

#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub body: String,
}

impl ApiResponse {
    pub fn new(status: StatusCode, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }
}

/// Moves one request over the wire.
pub trait Transport: Send + Sync {
    fn send<'a>(&'a self, request: &'a ApiRequest) -> BoxFuture<'a, Result<ApiResponse>>;
}

/// Production transport backed by `reqwest`.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: Client,
    base_url: String,
    session_id: Option<String>,
    csrf_token: Option<String>,
}

impl ReqwestTransport {
    pub fn new(config: &Config) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            session_id: config.session_id.clone(),
            csrf_token: config.csrf_token.clone(),
        })
    }

    fn headers(&self, method: &Method) -> Result<header::HeaderMap> {
        let mut headers = header::HeaderMap::new();
        headers.insert(header::ACCEPT, header::HeaderValue::from_static("application/json"));
        headers.insert(header::CACHE_CONTROL, header::HeaderValue::from_static("no-cache"));

        let mut cookies = Vec::new();
        if let Some(ref session_id) = self.session_id {
            cookies.push(format!("sessionid={}", session_id));
        }
        if let Some(ref csrf) = self.csrf_token {
            cookies.push(format!("csrftoken={}", csrf));
            if *method != Method::GET {
                headers.insert(
                    header::HeaderName::from_static("x-csrftoken"),
                    header::HeaderValue::from_str(csrf).with_context(|| format!("Invalid {} value", CSRF_HEADER))?,
                );
            }
        }
        if !cookies.is_empty() {
            headers.insert(
                header::COOKIE,
                header::HeaderValue::from_str(&cookies.join("; ")).context("Invalid session cookie")?,
            );
        }
        Ok(headers)
    }
}

impl Transport for ReqwestTransport {
    fn send<'a>(&'a self, request: &'a ApiRequest) -> BoxFuture<'a, Result<ApiResponse>> {
        Box::pin(async move {
            let url = format!("{}{}", self.base_url, request.path);
            let mut builder = self
                .client
                .request(request.method.clone(), &url)
                .headers(self.headers(&request.method)?);
            if let Some(ref body) = request.body {
                builder = builder.json(body);
            }

            let response = builder
                .send()
                .await
                .map_err(ApiError::from)
                .with_context(|| format!("Failed to send {} request to {}", request.method, url))?;

            let status = response.status();
            let body = response
                .text()
                .await
                .map_err(ApiError::from)
                .with_context(|| format!("Failed to read response body from {}", url))?;

            Ok(ApiResponse { status, body })
        })
    }
}

/// API client for the console backend.
/// Clones share the transport and the interceptor chain.
#[derive(Clone)]
pub struct ApiClient {
    transport: Arc<dyn Transport>,
    interceptors: Arc<InterceptorChain>,
}

impl ApiClient {
    /// Create a client talking to the configured backend over HTTP
    pub fn new(config: &Config) -> Result<Self> {
        let transport = ReqwestTransport::new(config)?;
        Ok(Self::with_transport(Arc::new(transport)))
    }

    pub fn with_transport(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            interceptors: Arc::new(InterceptorChain::new()),
        }
    }

    /// Register an interceptor on this client and all of its clones.
    /// Installing a second interceptor under the same name is a no-op.
    pub fn install_interceptor(&self, interceptor: Arc<dyn Interceptor>) -> bool {
        self.interceptors.install(interceptor)
    }

    pub fn remove_interceptor(&self, name: &str) -> bool {
        self.interceptors.remove(name)
    }

    pub fn interceptors(&self) -> &InterceptorChain {
        &self.interceptors
    }

    /// Execute a request and let interceptors observe it.
    ///
    /// The transport's result is returned unchanged, whatever the
    /// interceptors do. Non-2xx responses are not errors at this level.
    pub async fn execute(&self, request: ApiRequest) -> Result<ApiResponse> {
        debug!(method = %request.method, path = %request.path, "Executing request");
        let result = self.transport.send(&request).await;

        match &result {
            Ok(response) => self.interceptors.notify(&request, &CallOutcome::Completed(response.status)),
            Err(e) => self.interceptors.notify(&request, &CallOutcome::Failed(e)),
        }

        result
    }

    /// Check if response is successful, returning an error with body if not.
    fn check_response(response: ApiResponse) -> Result<ApiResponse> {
        if response.status.is_success() {
            Ok(response)
        } else {
            Err(ApiError::from_status(response.status, &response.body).into())
        }
    }

    fn parse<T: DeserializeOwned>(response: &ApiResponse, path: &str) -> Result<T> {
        serde_json::from_str(&response.body)
            .with_context(|| format!("Failed to parse JSON response from {}", path))
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let mut retries = 0;
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            let response = self.execute(ApiRequest::new(Method::GET, path)).await?;

            if response.status == StatusCode::TOO_MANY_REQUESTS {
                retries += 1;
                if retries > MAX_RATE_LIMIT_RETRIES {
                    return Err(ApiError::RateLimited.into());
                }
                warn!(path = path, retry = retries, backoff_ms = backoff_ms, "Rate limited, backing off");
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                backoff_ms *= 2; // Exponential backoff
                continue;
            }

            let response = Self::check_response(response)?;
            return Self::parse(&response, path);
        }
    }

    async fn send_json<T: DeserializeOwned, B: Serialize>(&self, method: Method, path: &str, body: &B) -> Result<T> {
        let body = serde_json::to_value(body).context("Failed to serialize request body")?;
        let response = self.execute(ApiRequest::new(method, path).with_body(body)).await?;
        let response = Self::check_response(response)?;
        Self::parse(&response, path)
    }

    pub async fn post_json<T: DeserializeOwned, B: Serialize>(&self, path: &str, body: &B) -> Result<T> {
        self.send_json(Method::POST, path, body).await
    }

    pub async fn patch_json<T: DeserializeOwned, B: Serialize>(&self, path: &str, body: &B) -> Result<T> {
        self.send_json(Method::PATCH, path, body).await
    }

    pub async fn put_json<T: DeserializeOwned, B: Serialize>(&self, path: &str, body: &B) -> Result<T> {
        self.send_json(Method::PUT, path, body).await
    }

    pub async fn delete(&self, path: &str) -> Result<()> {
        let response = self.execute(ApiRequest::new(Method::DELETE, path)).await?;
        Self::check_response(response)?;
        Ok(())
    }
}
