//! Upstream image fetching with bounded retry and post-fetch validation.
//!
//! A response is accepted as soon as it is `2xx` or carries a non-retryable
//! status: 403/404 mean the resource is gone, not transient, and
//! short-circuit immediately.  429 and 5xx are retried with exponential
//! backoff plus jitter; network and timeout errors retry until the final
//! attempt.  After a response is obtained the *final* (post-redirect) URL is
//! validated against the allowlist again and the content type must be
//! `image/*` before the bytes are usable.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rand::Rng;
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::StatusCode;
use tracing::debug;

use crate::config::UpstreamConfig;
use crate::validate::{CanonicalUrl, DenyReason, ValidationPolicy};

/// Fixed header profile mimicking a browser session; several CDNs refuse
/// requests without a plausible User-Agent/Referer pair.
const USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";
const REFERER: &str = "https://www.instagram.com/";
const ORIGIN: &str = "https://www.instagram.com";
const ACCEPT: &str = "image/avif,image/webp,image/apng,image/*,*/*;q=0.8";

// ---------------------------------------------------------------------------
// Outcome types
// ---------------------------------------------------------------------------

/// A successfully fetched and validated image.
#[derive(Debug, Clone)]
pub struct FetchedImage {
    pub bytes: Bytes,
    pub content_type: String,
    pub status: u16,
    pub attempts: u32,
    /// Hostname of the final (post-redirect) URL.
    pub final_host: String,
}

/// Why an upstream fetch did not produce usable image bytes.
#[derive(Debug)]
pub enum FetchError {
    /// The final post-redirect URL failed allowlist validation.
    Denied { reason: DenyReason, attempts: u32 },
    /// Upstream answered with a non-success status on the last attempt.
    Status { status: u16, attempts: u32 },
    /// Upstream answered 2xx but the body is not an image.
    NotImage {
        content_type: String,
        attempts: u32,
    },
    /// Network or timeout error on the final attempt.
    Network {
        source: reqwest::Error,
        attempts: u32,
    },
}

impl FetchError {
    pub fn attempts(&self) -> u32 {
        match self {
            FetchError::Denied { attempts, .. }
            | FetchError::Status { attempts, .. }
            | FetchError::NotImage { attempts, .. }
            | FetchError::Network { attempts, .. } => *attempts,
        }
    }

    /// Reason code surfaced in the `x-thumb-reason` header.
    pub fn reason_code(&self) -> &'static str {
        match self {
            FetchError::Denied { reason, .. } => reason.as_str(),
            FetchError::Status { .. } => "upstream_status",
            FetchError::NotImage { .. } => "not_image",
            FetchError::Network { .. } => "upstream_unreachable",
        }
    }

    /// Whether the failure was an allowlist denial (reported as
    /// `x-thumb-allowed: 0`) rather than an upstream fault.
    pub fn is_denied(&self) -> bool {
        matches!(self, FetchError::Denied { .. })
    }
}

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchError::Denied { reason, .. } => {
                write!(f, "final URL denied: {}", reason.as_str())
            }
            FetchError::Status { status, attempts } => {
                write!(f, "upstream status {status} after {attempts} attempt(s)")
            }
            FetchError::NotImage { content_type, .. } => {
                write!(f, "upstream returned non-image content type {content_type:?}")
            }
            FetchError::Network { source, attempts } => {
                write!(f, "upstream unreachable after {attempts} attempt(s): {source}")
            }
        }
    }
}

impl std::error::Error for FetchError {}

// ---------------------------------------------------------------------------
// Fetcher
// ---------------------------------------------------------------------------

/// Shared upstream fetcher: HTTP client, allowlist policy, retry settings.
#[derive(Clone)]
pub struct Fetcher {
    client: reqwest::Client,
    policy: Arc<ValidationPolicy>,
    config: UpstreamConfig,
}

impl Fetcher {
    pub fn new(
        client: reqwest::Client,
        policy: Arc<ValidationPolicy>,
        config: UpstreamConfig,
    ) -> Self {
        Self {
            client,
            policy,
            config,
        }
    }

    pub fn policy(&self) -> &ValidationPolicy {
        &self.policy
    }

    /// Fetch image bytes for an already-validated URL.
    ///
    /// Redirects are followed by the HTTP client; the final destination is
    /// re-validated before the body is accepted.
    pub async fn fetch(&self, canon: &CanonicalUrl) -> Result<FetchedImage, FetchError> {
        let mut attempts: u32 = 0;

        let response = loop {
            if attempts > 0 {
                let delay = backoff_delay(
                    attempts,
                    self.config.backoff_base_ms,
                    self.config.backoff_cap_ms,
                );
                debug!(url = %canon.canonical, attempts, delay_ms = delay.as_millis() as u64, "retrying upstream fetch");
                tokio::time::sleep(delay).await;
            }
            attempts += 1;

            let result = self
                .client
                .get(canon.url.clone())
                .headers(browser_headers())
                .timeout(Duration::from_millis(self.config.timeout_ms))
                .send()
                .await;

            match result {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        break resp;
                    }
                    if !is_retryable_status(status) || attempts >= self.config.max_attempts {
                        return Err(FetchError::Status {
                            status: status.as_u16(),
                            attempts,
                        });
                    }
                }
                Err(source) => {
                    if attempts >= self.config.max_attempts {
                        return Err(FetchError::Network { source, attempts });
                    }
                }
            }
        };

        // Redirects can land anywhere; validate the final destination with
        // the same policy applied to the original request.
        let final_url = response.url().clone();
        if let Err(reason) = self.policy.check(&final_url) {
            return Err(FetchError::Denied { reason, attempts });
        }

        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_ascii_lowercase();
        if !content_type.starts_with("image/") {
            return Err(FetchError::NotImage {
                content_type,
                attempts,
            });
        }

        let status = response.status().as_u16();
        let final_host = final_url.host_str().unwrap_or_default().to_string();
        let bytes = response
            .bytes()
            .await
            .map_err(|source| FetchError::Network { source, attempts })?;

        Ok(FetchedImage {
            bytes,
            content_type,
            status,
            attempts,
            final_host,
        })
    }
}

/// 429 and 5xx are transient; everything else is final.
fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// Delay before retry `n` (1-based): `min(base * 2^(n-1), cap)` plus up to
/// half the base as jitter, so a fleet of retries does not synchronize.
fn backoff_delay(retry: u32, base_ms: u64, cap_ms: u64) -> Duration {
    let exp = base_ms.saturating_mul(1u64 << (retry.saturating_sub(1)).min(16));
    let capped = exp.min(cap_ms);
    let jitter = if base_ms > 1 {
        rand::thread_rng().gen_range(0..=base_ms / 2)
    } else {
        0
    };
    Duration::from_millis(capped + jitter)
}

fn browser_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(header::USER_AGENT, HeaderValue::from_static(USER_AGENT));
    headers.insert(header::REFERER, HeaderValue::from_static(REFERER));
    headers.insert(header::ORIGIN, HeaderValue::from_static(ORIGIN));
    headers.insert(header::ACCEPT, HeaderValue::from_static(ACCEPT));
    headers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AllowlistConfig;
    use crate::validate::canonicalize;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_fetcher(max_attempts: u32) -> Fetcher {
        let allowlist = AllowlistConfig {
            cdn_suffixes: vec!["127.0.0.1".to_string()],
            allow_private_hosts: true,
            ..AllowlistConfig::default()
        };
        let config = UpstreamConfig {
            timeout_ms: 2_000,
            max_attempts,
            backoff_base_ms: 2,
            backoff_cap_ms: 10,
            ..UpstreamConfig::default()
        };
        Fetcher::new(
            reqwest::Client::new(),
            Arc::new(ValidationPolicy::new(&allowlist)),
            config,
        )
    }

    #[test]
    fn backoff_grows_and_caps() {
        let d1 = backoff_delay(1, 100, 1_000).as_millis() as u64;
        let d2 = backoff_delay(2, 100, 1_000).as_millis() as u64;
        let d5 = backoff_delay(5, 100, 1_000).as_millis() as u64;
        assert!((100..=150).contains(&d1), "d1 = {d1}");
        assert!((200..=250).contains(&d2), "d2 = {d2}");
        // 100 * 2^4 = 1600, capped at 1000 (+ jitter).
        assert!((1_000..=1_050).contains(&d5), "d5 = {d5}");
    }

    #[test]
    fn retryable_statuses() {
        assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(is_retryable_status(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(!is_retryable_status(StatusCode::FORBIDDEN));
        assert!(!is_retryable_status(StatusCode::NOT_FOUND));
        assert!(!is_retryable_status(StatusCode::BAD_REQUEST));
    }

    #[tokio::test]
    async fn recovers_after_transient_503() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/img.jpg"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/img.jpg"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "image/jpeg")
                    .set_body_bytes(b"jpegbytes".to_vec()),
            )
            .expect(1)
            .mount(&server)
            .await;

        let canon = canonicalize(&format!("{}/img.jpg", server.uri())).unwrap();
        let image = test_fetcher(4).fetch(&canon).await.unwrap();
        assert_eq!(image.attempts, 3);
        assert_eq!(image.bytes.as_ref(), b"jpegbytes");
        assert_eq!(image.content_type, "image/jpeg");
    }

    #[tokio::test]
    async fn not_found_is_never_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gone.jpg"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let canon = canonicalize(&format!("{}/gone.jpg", server.uri())).unwrap();
        let err = test_fetcher(4).fetch(&canon).await.unwrap_err();
        match err {
            FetchError::Status { status, attempts } => {
                assert_eq!(status, 404);
                assert_eq!(attempts, 1);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn forbidden_short_circuits() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/locked.jpg"))
            .respond_with(ResponseTemplate::new(403))
            .expect(1)
            .mount(&server)
            .await;

        let canon = canonicalize(&format!("{}/locked.jpg", server.uri())).unwrap();
        let err = test_fetcher(4).fetch(&canon).await.unwrap_err();
        assert_eq!(err.attempts(), 1);
        assert_eq!(err.reason_code(), "upstream_status");
    }

    #[tokio::test]
    async fn non_image_body_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/page.html"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/html")
                    .set_body_string("<html></html>"),
            )
            .mount(&server)
            .await;

        let canon = canonicalize(&format!("{}/page.html", server.uri())).unwrap();
        let err = test_fetcher(2).fetch(&canon).await.unwrap_err();
        assert_eq!(err.reason_code(), "not_image");
    }

    #[tokio::test]
    async fn exhausted_retries_surface_last_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/flaky.jpg"))
            .respond_with(ResponseTemplate::new(503))
            .expect(2)
            .mount(&server)
            .await;

        let canon = canonicalize(&format!("{}/flaky.jpg", server.uri())).unwrap();
        let err = test_fetcher(2).fetch(&canon).await.unwrap_err();
        match err {
            FetchError::Status { status, attempts } => {
                assert_eq!(status, 503);
                assert_eq!(attempts, 2);
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
