//! CameraProxy - Allowlisted Camera Gateway
//!
//! ## Responsibilities
//!
//! - Fetch camera streams, snapshots and web-UI pages for the browser
//! - Enforce scheme and host allowlist before any outbound request
//! - Inject HTTP Basic credentials server-side
//! - Rewrite camera web-UI asset references back through the proxy
//! - Map upstream failures to stable local statuses
//!
//! Stateless per request. The stream controller and the camera detection
//! source go through `send()` as well, so the allowlist holds for every
//! outbound camera request this process makes.

mod rewrite;
mod types;

pub use rewrite::{content_type_for_path, rewrite_asset_refs, rewrite_playlist};
pub use types::*;

use crate::models::Credentials;
use crate::state::ProxyConfig;
use bytes::Bytes;
use reqwest::{header, Method, Url};
use std::collections::HashSet;
use std::time::Duration;

const CONNECTION_TEST_TIMEOUT: Duration = Duration::from_secs(5);

const SENSITIVE_QUERY_KEYS: &[&str] = &[
    "user", "username", "pass", "password", "pwd", "token", "auth", "key",
];

/// URL with userinfo and credential-like query values masked, for logs
pub fn redact_url(raw: &str) -> String {
    let Ok(mut url) = Url::parse(raw) else {
        return "<invalid url>".to_string();
    };
    if !url.username().is_empty() {
        let _ = url.set_username("***");
    }
    if url.password().is_some() {
        let _ = url.set_password(None);
    }

    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| {
            let masked = SENSITIVE_QUERY_KEYS.contains(&k.to_ascii_lowercase().as_str());
            let value = if masked { "***".to_string() } else { v.into_owned() };
            (k.into_owned(), value)
        })
        .collect();
    if !pairs.is_empty() {
        url.query_pairs_mut().clear().extend_pairs(pairs);
    }

    url.to_string()
}

fn normalize_host(host: &str) -> String {
    host.trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_ascii_lowercase()
}

/// CameraProxy instance
pub struct CameraProxy {
    client: reqwest::Client,
    allowlist: HashSet<String>,
    config: ProxyConfig,
}

impl CameraProxy {
    /// Create new CameraProxy
    pub fn new(config: ProxyConfig) -> Self {
        // Redirects are not followed.
        let client = reqwest::Client::builder()
            .connect_timeout(config.timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .expect("Failed to create HTTP client");

        let allowlist = config.allowlist.iter().map(|h| normalize_host(h)).collect();

        Self {
            client,
            allowlist,
            config,
        }
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn default_credentials(&self) -> &Credentials {
        &self.config.default_credentials
    }

    pub fn is_allowed(&self, host: &str) -> bool {
        self.allowlist.contains(&normalize_host(host))
    }

    /// Scheme and allowlist check on an already-parsed URL
    pub fn check_url(&self, url: &Url) -> Result<(), ProxyError> {
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ProxyError::InvalidScheme);
        }
        let host = url.host_str().ok_or(ProxyError::InvalidUrl)?;
        if !self.is_allowed(host) {
            return Err(ProxyError::HostNotAllowed);
        }
        Ok(())
    }

    /// Parse and validate a caller-supplied target URL
    pub fn parse_target(&self, raw: Option<&str>) -> Result<Url, ProxyError> {
        let raw = raw
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(ProxyError::MissingUrl)?;
        let url = Url::parse(raw).map_err(|_| ProxyError::InvalidUrl)?;
        self.check_url(&url)?;
        Ok(url)
    }

    /// Resolve an optional sub-resource against the page URL
    pub fn resolve_asset(&self, page: &Url, asset: Option<&str>) -> Result<Url, ProxyError> {
        let Some(asset) = asset.map(str::trim).filter(|a| !a.is_empty()) else {
            return Ok(page.clone());
        };
        let url = page.join(asset).map_err(|_| ProxyError::InvalidUrl)?;
        self.check_url(&url)?;
        Ok(url)
    }

    /// Authenticated upstream request with bounded header wait.
    ///
    /// Returns the response only for 2xx; everything else is mapped.
    pub async fn send(
        &self,
        method: Method,
        url: &Url,
        credentials: &Credentials,
    ) -> Result<reqwest::Response, ProxyError> {
        self.send_with_timeout(method, url, credentials, self.config.timeout)
            .await
    }

    async fn send_with_timeout(
        &self,
        method: Method,
        url: &Url,
        credentials: &Credentials,
        limit: Duration,
    ) -> Result<reqwest::Response, ProxyError> {
        self.check_url(url)?;

        let mut request = self.client.request(method, url.clone());
        if !credentials.username.is_empty() {
            request = request.header(header::AUTHORIZATION, credentials.basic_auth_header());
        }

        let response = match tokio::time::timeout(limit, request.send()).await {
            Err(_) => return Err(ProxyError::Timeout),
            Ok(Err(e)) if e.is_timeout() => return Err(ProxyError::Timeout),
            Ok(Err(e)) => return Err(ProxyError::Upstream(e.without_url().to_string())),
            Ok(Ok(response)) => response,
        };

        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            Err(ProxyError::from_upstream_status(status))
        }
    }

    /// GET and buffer the whole body within the proxy timeout
    pub async fn get_bytes(
        &self,
        url: &Url,
        credentials: &Credentials,
    ) -> Result<(Option<String>, Bytes), ProxyError> {
        let response = self.send(Method::GET, url, credentials).await?;
        let content_type = upstream_content_type(&response);
        let body = self.read_body(response).await?;
        Ok((content_type, body))
    }

    async fn read_body(&self, response: reqwest::Response) -> Result<Bytes, ProxyError> {
        match tokio::time::timeout(self.config.timeout, response.bytes()).await {
            Err(_) => Err(ProxyError::Timeout),
            Ok(Err(e)) => Err(ProxyError::Upstream(e.without_url().to_string())),
            Ok(Ok(body)) => Ok(body),
        }
    }

    /// Serve one browser proxy request
    pub async fn fetch(&self, request: ProxyRequest) -> Result<ProxyResponse, ProxyError> {
        let result = self.fetch_inner(&request).await;
        if let Err(e) = &result {
            let target = request.url.as_deref().map(redact_url).unwrap_or_default();
            if e.is_configuration_error() {
                tracing::warn!(url = %target, error = %e, "Camera proxy request rejected");
            } else {
                tracing::error!(url = %target, error = %e, "Camera proxy upstream failure");
            }
        }
        result
    }

    async fn fetch_inner(&self, request: &ProxyRequest) -> Result<ProxyResponse, ProxyError> {
        let page = self.parse_target(request.url.as_deref())?;
        let target = self.resolve_asset(&page, request.asset.as_deref())?;
        let credentials = self
            .config
            .default_credentials
            .overridden_by(request.username.as_deref(), request.password.as_deref());

        let response = self.send(Method::GET, &target, &credentials).await?;
        let upstream_type = upstream_content_type(&response);
        let category = request.category.unwrap_or_else(|| {
            ContentCategory::infer(request.asset.is_some(), upstream_type.as_deref())
        });

        tracing::debug!(
            url = %redact_url(target.as_str()),
            category = category.as_str(),
            "Camera proxy relaying"
        );

        let content_type = match category {
            ContentCategory::Page => content_type_for_path(target.path())
                .map(str::to_string)
                .or(upstream_type)
                .unwrap_or_else(|| "application/octet-stream".to_string()),
            ContentCategory::Snapshot => {
                upstream_type.unwrap_or_else(|| "image/jpeg".to_string())
            }
            ContentCategory::Stream => {
                upstream_type.unwrap_or_else(|| "application/octet-stream".to_string())
            }
        };

        if rewrite::is_playlist(&content_type, target.path()) {
            let body = self.read_body(response).await?;
            let text = String::from_utf8_lossy(&body);
            let rewritten = rewrite_playlist(&text, target.as_str(), &self.config.public_path);
            return Ok(ProxyResponse {
                category,
                content_type,
                body: ProxyBody::Bytes(Bytes::from(rewritten)),
            });
        }

        match category {
            ContentCategory::Stream => Ok(ProxyResponse {
                category,
                content_type,
                body: ProxyBody::Stream(response),
            }),
            ContentCategory::Snapshot => {
                let body = self.read_body(response).await?;
                Ok(ProxyResponse {
                    category,
                    content_type,
                    body: ProxyBody::Bytes(body),
                })
            }
            ContentCategory::Page => {
                let body = self.read_body(response).await?;
                let body = if rewrite::is_rewritable_markup(&content_type) {
                    let text = String::from_utf8_lossy(&body);
                    Bytes::from(rewrite_asset_refs(
                        &text,
                        target.as_str(),
                        &self.config.public_path,
                    ))
                } else {
                    body
                };
                Ok(ProxyResponse {
                    category,
                    content_type,
                    body: ProxyBody::Bytes(body),
                })
            }
        }
    }

    /// Authenticated HEAD probe with a short timeout
    pub async fn test_connection(&self, url: &str, credentials: &Credentials) -> ConnectionTest {
        let target = match self.parse_target(Some(url)) {
            Ok(target) => target,
            Err(e) => {
                return ConnectionTest {
                    success: false,
                    status: Some(e.status().as_u16()),
                    message: e.to_string(),
                }
            }
        };

        let result = self
            .send_with_timeout(Method::HEAD, &target, credentials, CONNECTION_TEST_TIMEOUT)
            .await;

        match result {
            Ok(response) => ConnectionTest {
                success: true,
                status: Some(response.status().as_u16()),
                message: "Camera reachable".to_string(),
            },
            Err(e) => {
                tracing::warn!(url = %redact_url(url), error = %e, "Camera connection test failed");
                ConnectionTest {
                    success: false,
                    status: Some(e.status().as_u16()),
                    message: e.to_string(),
                }
            }
        }
    }
}

fn upstream_content_type(response: &reqwest::Response) -> Option<String> {
    response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}
