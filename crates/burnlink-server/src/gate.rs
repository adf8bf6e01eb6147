//! Request gates run before any handler: origin verification on every route,
//! bot verification on routes that change state.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    extract::{ConnectInfo, Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use constant_time_eq::constant_time_eq;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

pub const ORIGIN_HEADER: &str = "x-origin-verify";
pub const RECAPTCHA_HEADER: &str = "x-recaptcha-token";
pub const RECAPTCHA_VERIFY_URL: &str = "https://www.google.com/recaptcha/api/siteverify";
pub const DEFAULT_MIN_SCORE: f64 = 0.3;

/// Gate configuration shared by the middleware.
#[derive(Clone, Default)]
pub struct Gates {
    /// Expected `X-Origin-Verify` value. `None` disables the check.
    pub origin_secret: Option<String>,
    /// `None` disables bot verification.
    pub recaptcha: Option<RecaptchaVerifier>,
}

/// True when no secret is configured or `presented` matches it.
pub fn origin_allowed(secret: Option<&str>, presented: Option<&str>) -> bool {
    match secret {
        None => true,
        Some(expected) => {
            presented.is_some_and(|p| constant_time_eq(p.as_bytes(), expected.as_bytes()))
        }
    }
}

/// Axum middleware rejecting requests that bypassed the fronting proxy.
pub async fn require_origin(State(gates): State<Arc<Gates>>, request: Request, next: Next) -> Response {
    let presented = request
        .headers()
        .get(ORIGIN_HEADER)
        .and_then(|v| v.to_str().ok());

    if origin_allowed(gates.origin_secret.as_deref(), presented) {
        next.run(request).await
    } else {
        let peer = peer_ip(&request);
        warn!(peer = peer.as_deref().unwrap_or("unknown"), "origin verification failed");
        forbidden("direct API access not allowed")
    }
}

/// Axum middleware requiring a passing reCAPTCHA token on state-changing routes.
pub async fn require_human(State(gates): State<Arc<Gates>>, request: Request, next: Next) -> Response {
    let Some(verifier) = gates.recaptcha.as_ref() else {
        return next.run(request).await;
    };

    let token = request
        .headers()
        .get(RECAPTCHA_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_owned();
    let peer = peer_ip(&request);

    match verifier.verify(&token, peer.as_deref()).await {
        Ok(()) => next.run(request).await,
        Err(reason) => {
            warn!(
                peer = peer.as_deref().unwrap_or("unknown"),
                reason = %reason,
                "bot verification failed"
            );
            forbidden(reason.message())
        }
    }
}

fn peer_ip(request: &Request) -> Option<String> {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
}

fn forbidden(message: &str) -> Response {
    (
        StatusCode::FORBIDDEN,
        Json(json!({"error": message, "code": "forbidden"})),
    )
        .into_response()
}

// ── reCAPTCHA ────────────────────────────────────────────────────────────────

/// Siteverify response body.
#[derive(Debug, Deserialize)]
struct SiteVerifyResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    score: f64,
    #[serde(default, rename = "error-codes")]
    error_codes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Rejection {
    MissingToken,
    Failed,
    LowScore(f64),
    Unreachable,
}

impl Rejection {
    pub fn message(&self) -> &'static str {
        match self {
            Self::MissingToken => "reCAPTCHA token is required",
            Self::Failed => "reCAPTCHA verification failed",
            Self::LowScore(_) => "bot activity detected",
            Self::Unreachable => "failed to verify reCAPTCHA",
        }
    }
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LowScore(score) => write!(f, "{} (score {score})", self.message()),
            other => f.write_str(other.message()),
        }
    }
}

/// reCAPTCHA v3 token verifier.
#[derive(Clone)]
pub struct RecaptchaVerifier {
    client: reqwest::Client,
    secret: String,
    verify_url: String,
    min_score: f64,
}

impl RecaptchaVerifier {
    pub fn new(secret: String, verify_url: String, min_score: f64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .context("build reCAPTCHA client")?;
        Ok(Self {
            client,
            secret,
            verify_url,
            min_score,
        })
    }

    /// Succeeds when Google accepts the token with at least the configured score.
    pub async fn verify(&self, token: &str, remote_ip: Option<&str>) -> Result<(), Rejection> {
        if token.is_empty() {
            return Err(Rejection::MissingToken);
        }

        let mut form = vec![("secret", self.secret.as_str()), ("response", token)];
        if let Some(ip) = remote_ip {
            form.push(("remoteip", ip));
        }

        let resp: SiteVerifyResponse = match self.request(&form).await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "reCAPTCHA verification request failed");
                return Err(Rejection::Unreachable);
            }
        };
        debug!(success = resp.success, score = resp.score, "reCAPTCHA verification");

        if !resp.success {
            debug!(error_codes = ?resp.error_codes, "reCAPTCHA rejected token");
            return Err(Rejection::Failed);
        }
        if resp.score < self.min_score {
            return Err(Rejection::LowScore(resp.score));
        }
        Ok(())
    }

    async fn request(&self, form: &[(&str, &str)]) -> Result<SiteVerifyResponse, reqwest::Error> {
        self.client
            .post(&self.verify_url)
            .form(form)
            .send()
            .await?
            .json()
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn verifier_for(mock: &MockServer) -> RecaptchaVerifier {
        RecaptchaVerifier::new(
            "test-secret".into(),
            format!("{}/recaptcha/api/siteverify", mock.uri()),
            DEFAULT_MIN_SCORE,
        )
        .unwrap()
    }

    async fn mount(mock: &MockServer, body: serde_json::Value) {
        Mock::given(method("POST"))
            .and(path("/recaptcha/api/siteverify"))
            .and(body_string_contains("secret=test-secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(mock)
            .await;
    }

    #[test]
    fn origin_check() {
        assert!(origin_allowed(None, None));
        assert!(origin_allowed(None, Some("anything")));
        assert!(origin_allowed(Some("s3cret"), Some("s3cret")));
        assert!(!origin_allowed(Some("s3cret"), Some("s3cre")));
        assert!(!origin_allowed(Some("s3cret"), None));
    }

    #[tokio::test]
    async fn accepts_good_score() {
        let mock = MockServer::start().await;
        mount(&mock, json!({"success": true, "score": 0.9})).await;
        let v = verifier_for(&mock);
        assert_eq!(v.verify("tok", Some("203.0.113.7")).await, Ok(()));
    }

    #[tokio::test]
    async fn rejects_low_score() {
        let mock = MockServer::start().await;
        mount(&mock, json!({"success": true, "score": 0.1})).await;
        let v = verifier_for(&mock);
        assert_eq!(v.verify("tok", None).await, Err(Rejection::LowScore(0.1)));
    }

    #[tokio::test]
    async fn missing_score_counts_as_zero() {
        let mock = MockServer::start().await;
        mount(&mock, json!({"success": true})).await;
        let v = verifier_for(&mock);
        assert!(matches!(v.verify("tok", None).await, Err(Rejection::LowScore(_))));
    }

    #[tokio::test]
    async fn rejects_unsuccessful_token() {
        let mock = MockServer::start().await;
        mount(
            &mock,
            json!({"success": false, "error-codes": ["invalid-input-response"]}),
        )
        .await;
        let v = verifier_for(&mock);
        assert_eq!(v.verify("tok", None).await, Err(Rejection::Failed));
    }

    #[tokio::test]
    async fn empty_token_never_hits_network() {
        let mock = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&mock)
            .await;
        let v = verifier_for(&mock);
        assert_eq!(v.verify("", None).await, Err(Rejection::MissingToken));
    }

    #[tokio::test]
    async fn unreachable_endpoint_rejects() {
        let mock = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("oops"))
            .mount(&mock)
            .await;
        let v = verifier_for(&mock);
        assert_eq!(v.verify("tok", None).await, Err(Rejection::Unreachable));
    }
}
