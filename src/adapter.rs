//! HTTP adapter for the rate limiter.
//!
//! Wraps a [`RateLimiter`] for hosts built on the `http` crate types: it
//! derives the caller key from a request, attaches rate limit headers to
//! responses, turns denials into rejection responses and reports the
//! outcome of admitted requests so refund rules can apply.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use http::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, RETRY_AFTER};
use http::{Request, Response, StatusCode};
use thiserror::Error;
use tracing::{debug, trace};

use crate::ratelimit::{
    Clock, LimiterStore, MemoryStore, RateLimitInfo, RateLimiter, SystemClock,
};

/// Maximum requests per window.
pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
/// Admissions left in the current window.
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
/// Epoch seconds at which the quota is restored.
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Errors raised while adapting a request.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("Cannot derive rate limit key: {0}")]
    MissingKey(String),
}

/// Derives the rate limit key for a request.
pub trait KeyExtractor<B>: Send + Sync {
    fn extract(&self, request: &Request<B>) -> Result<String, AdapterError>;
}

impl<B, F> KeyExtractor<B> for F
where
    F: Fn(&Request<B>) -> Result<String, AdapterError> + Send + Sync,
{
    fn extract(&self, request: &Request<B>) -> Result<String, AdapterError> {
        self(request)
    }
}

/// Keys requests by client IP address.
///
/// Uses a [`SocketAddr`] request extension when the host provides one, then
/// the first `X-Forwarded-For` hop, then `X-Real-IP`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientIp;

impl<B> KeyExtractor<B> for ClientIp {
    fn extract(&self, request: &Request<B>) -> Result<String, AdapterError> {
        extract_client_ip(request)
            .map(|ip| ip.to_string())
            .ok_or_else(|| AdapterError::MissingKey("client address unavailable".to_string()))
    }
}

/// Extract client IP address from request.
fn extract_client_ip<B>(request: &Request<B>) -> Option<IpAddr> {
    // Direct connection
    if let Some(addr) = request.extensions().get::<SocketAddr>() {
        return Some(addr.ip());
    }

    // Proxied requests: take the first IP in the chain
    if let Some(forwarded_for) = request.headers().get("x-forwarded-for") {
        let value = forwarded_for.to_str().ok()?;
        let ip_str = value.split(',').next()?;

        return ip_str.trim().parse::<IpAddr>().ok();
    }

    let ip_str = request.headers().get("x-real-ip")?.to_str().ok()?;

    ip_str.trim().parse::<IpAddr>().ok()
}

/// Keys requests by the value of a header, such as an API key.
#[derive(Debug, Clone)]
pub struct HeaderKey {
    name: HeaderName,
}

impl HeaderKey {
    pub fn new(name: HeaderName) -> Self {
        Self { name }
    }
}

impl<B> KeyExtractor<B> for HeaderKey {
    fn extract(&self, request: &Request<B>) -> Result<String, AdapterError> {
        request
            .headers()
            .get(&self.name)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_owned)
            .ok_or_else(|| AdapterError::MissingKey(format!("missing {} header", self.name)))
    }
}

/// Builds the response sent for a denied request.
pub trait RejectHandler: Send + Sync {
    fn reject(&self, key: &str, info: &RateLimitInfo) -> Response<String>;
}

impl<F> RejectHandler for F
where
    F: Fn(&str, &RateLimitInfo) -> Response<String> + Send + Sync,
{
    fn reject(&self, key: &str, info: &RateLimitInfo) -> Response<String> {
        self(key, info)
    }
}

/// Default rejection: `429 Too Many Requests` with a JSON body and `Retry-After`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TooManyRequests;

impl RejectHandler for TooManyRequests {
    fn reject(&self, _key: &str, info: &RateLimitInfo) -> Response<String> {
        let retry_after_secs = info.retry_after_secs();
        let body = serde_json::json!({
            "error": {
                "code": "RATE_LIMIT_EXCEEDED",
                "message": "Too many requests, please try again later.",
                "retry_after_secs": retry_after_secs,
            }
        });

        let mut response = Response::new(body.to_string());
        *response.status_mut() = StatusCode::TOO_MANY_REQUESTS;

        let headers = response.headers_mut();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(RETRY_AFTER, HeaderValue::from(retry_after_secs));
        response
    }
}

/// Write the `X-RateLimit-*` headers for `info`.
pub fn apply_headers(headers: &mut HeaderMap, info: &RateLimitInfo) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(info.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(info.remaining));
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(info.reset_time_secs()));
}

/// An admitted request, to be handed back to [`RateLimitGuard::finish`].
#[derive(Debug, Clone)]
pub struct Permit {
    key: String,
    info: RateLimitInfo,
}

impl Permit {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn info(&self) -> &RateLimitInfo {
        &self.info
    }
}

/// What the host should do with a request.
#[derive(Debug)]
pub enum Admission {
    /// Run the guarded work, then call [`RateLimitGuard::finish`]
    Proceed(Permit),
    /// Send this response instead of running the work
    Rejected(Response<String>),
}

/// Admission gate for `http` requests.
pub struct RateLimitGuard<K, H = TooManyRequests, S = MemoryStore, C = SystemClock> {
    limiter: Arc<RateLimiter<S, C>>,
    key_extractor: K,
    reject_handler: H,
}

impl<K, S: LimiterStore, C: Clock> RateLimitGuard<K, TooManyRequests, S, C> {
    /// Create a guard that rejects with [`TooManyRequests`].
    pub fn new(limiter: Arc<RateLimiter<S, C>>, key_extractor: K) -> Self {
        Self {
            limiter,
            key_extractor,
            reject_handler: TooManyRequests,
        }
    }
}

impl<K, H: RejectHandler, S: LimiterStore, C: Clock> RateLimitGuard<K, H, S, C> {
    /// Replace the rejection handler.
    pub fn with_reject_handler<R: RejectHandler>(self, reject_handler: R) -> RateLimitGuard<K, R, S, C> {
        RateLimitGuard {
            limiter: self.limiter,
            key_extractor: self.key_extractor,
            reject_handler,
        }
    }

    /// Evaluate `request`.
    ///
    /// Fails only when no key can be derived; denials come back as
    /// [`Admission::Rejected`] with rate limit headers applied.
    pub fn check<B>(&self, request: &Request<B>) -> Result<Admission, AdapterError>
    where
        K: KeyExtractor<B>,
    {
        let key = self.key_extractor.extract(request)?;
        let decision = self.limiter.evaluate(&key);

        if decision.is_allowed() {
            trace!(key = %key, remaining = decision.info.remaining, "Request admitted");
            return Ok(Admission::Proceed(Permit {
                key,
                info: decision.info,
            }));
        }

        debug!(key = %key, uri = %request.uri(), "Request rejected");
        let mut response = self.reject_handler.reject(&key, &decision.info);
        apply_headers(response.headers_mut(), &decision.info);
        Ok(Admission::Rejected(response))
    }

    /// Attach rate limit headers to the response of an admitted request and
    /// report its outcome. Statuses below 400 count as success.
    pub fn finish<B>(&self, permit: Permit, response: &mut Response<B>) {
        apply_headers(response.headers_mut(), &permit.info);

        let succeeded = response.status().as_u16() < 400;
        self.limiter.report_outcome(&permit.key, succeeded);
    }

    pub fn limiter(&self) -> &Arc<RateLimiter<S, C>> {
        &self.limiter
    }
}
