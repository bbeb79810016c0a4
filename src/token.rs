//! Identity tokens for service-to-service calls. Each backend needs a
//! short-lived token whose audience is the backend's own URL; production
//! mints them from the ambient metadata service and callers see only the
//! [`TokenSource`] capability.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::redact::sanitize_for_log;

pub const METADATA_BASE: &str = "http://metadata.google.internal";
const IDENTITY_PATH: &str = "/computeMetadata/v1/instance/service-accounts/default/identity";
const METADATA_FLAVOR: (&str, &str) = ("Metadata-Flavor", "Google");

const FETCH_TIMEOUT: Duration = Duration::from_secs(5);
// Stop serving a cached token well before its actual expiry.
const EXPIRY_MARGIN: Duration = Duration::from_secs(300);
const MIN_TTL: Duration = Duration::from_secs(60);
// Applied when the token carries no readable `exp` claim.
const FALLBACK_TTL: Duration = Duration::from_secs(300);
const SWEEP_INTERVAL: Duration = Duration::from_secs(600);

#[derive(Error, Debug)]
pub enum TokenError {
	#[error("metadata request for audience {audience} failed: {source}")]
	Request {
		audience: String,
		#[source]
		source: reqwest::Error,
	},
	#[error("metadata server returned {status} for audience {audience}")]
	Status { audience: String, status: u16 },
	#[error("token for audience {audience} is not a compact JWS")]
	InvalidFormat { audience: String },
	#[error("no token available for audience {audience}")]
	Unavailable { audience: String },
}

/// An audience-bound bearer credential and when it stops being usable.
#[derive(Clone, Debug)]
pub struct IdentityToken {
	secret: SecretString,
	expires_at: Instant,
}

impl IdentityToken {
	pub fn new(value: &str, expires_at: Instant) -> Self {
		Self {
			secret: SecretString::from(value.to_string()),
			expires_at,
		}
	}

	/// The raw token, for embedding into the production config only.
	pub fn reveal(&self) -> &str {
		self.secret.expose_secret()
	}

	pub fn expires_at(&self) -> Instant {
		self.expires_at
	}
}

#[async_trait]
pub trait TokenSource: Send + Sync {
	async fn get_token(&self, audience: &str) -> Result<IdentityToken, TokenError>;
}

struct TokenCache {
	entries: HashMap<String, IdentityToken>,
	last_sweep: Instant,
}

impl TokenCache {
	fn new() -> Self {
		Self {
			entries: HashMap::new(),
			last_sweep: Instant::now(),
		}
	}

	fn get(&mut self, audience: &str) -> Option<IdentityToken> {
		let now = Instant::now();
		if now.duration_since(self.last_sweep) >= SWEEP_INTERVAL {
			self.entries.retain(|_, t| t.expires_at > now);
			self.last_sweep = now;
		}
		self
			.entries
			.get(audience)
			.filter(|t| t.expires_at > now)
			.cloned()
	}

	fn insert(&mut self, audience: &str, token: IdentityToken) {
		self.entries.insert(audience.to_string(), token);
	}
}

/// Mints identity tokens from the GCE/Cloud Run metadata service, with a
/// per-audience cache. Tokens are minted lazily; there is no background
/// refresh, so a caller may observe one stale token right at an expiry
/// boundary.
pub struct MetadataTokenSource {
	http: reqwest::Client,
	base_url: String,
	cache: Mutex<TokenCache>,
}

impl Default for MetadataTokenSource {
	fn default() -> Self {
		Self::new()
	}
}

impl MetadataTokenSource {
	pub fn new() -> Self {
		Self::for_endpoint(METADATA_BASE)
	}

	/// Point at a different metadata endpoint; used by tests.
	pub fn for_endpoint(base_url: impl Into<String>) -> Self {
		Self {
			http: reqwest::Client::builder()
				.timeout(FETCH_TIMEOUT)
				.build()
				.expect("failed to build http client"),
			base_url: base_url.into(),
			cache: Mutex::new(TokenCache::new()),
		}
	}

	async fn mint(&self, audience: &str) -> Result<IdentityToken, TokenError> {
		let redacted_audience = || sanitize_for_log(audience, 100);

		let response = self
			.http
			.get(format!("{}{}", self.base_url, IDENTITY_PATH))
			.query(&[("audience", audience)])
			.header(METADATA_FLAVOR.0, METADATA_FLAVOR.1)
			.send()
			.await
			.map_err(|source| TokenError::Request {
				audience: redacted_audience(),
				source,
			})?;

		let status = response.status();
		if !status.is_success() {
			return Err(TokenError::Status {
				audience: redacted_audience(),
				status: status.as_u16(),
			});
		}

		let body = response.text().await.map_err(|source| TokenError::Request {
			audience: redacted_audience(),
			source,
		})?;
		let token = body.trim();
		if !token.starts_with("eyJ") {
			return Err(TokenError::InvalidFormat {
				audience: redacted_audience(),
			});
		}

		let ttl = match token_expiry(token) {
			Some(exp) => {
				let now = SystemTime::now()
					.duration_since(UNIX_EPOCH)
					.unwrap_or_default()
					.as_secs();
				let remaining = exp.saturating_sub(now);
				Duration::from_secs(remaining)
					.saturating_sub(EXPIRY_MARGIN)
					.max(MIN_TTL)
			},
			None => {
				debug!(
					audience = %redacted_audience(),
					"token has no readable exp claim, using fallback ttl"
				);
				FALLBACK_TTL
			},
		};
		Ok(IdentityToken::new(token, Instant::now() + ttl))
	}
}

#[async_trait]
impl TokenSource for MetadataTokenSource {
	async fn get_token(&self, audience: &str) -> Result<IdentityToken, TokenError> {
		if let Some(token) = self.cache.lock().unwrap().get(audience) {
			trace!(audience = %sanitize_for_log(audience, 100), "token cache hit");
			return Ok(token);
		}

		let token = self.mint(audience).await.inspect_err(|e| {
			warn!(error = %e, "identity token mint failed");
		})?;
		self.cache.lock().unwrap().insert(audience, token.clone());
		Ok(token)
	}
}

/// Read the `exp` claim out of a compact JWS without validating it. The
/// token is opaque to us; only its lifetime matters for caching.
fn token_expiry(token: &str) -> Option<u64> {
	let payload = token.split('.').nth(1)?;
	let bytes = URL_SAFE_NO_PAD.decode(payload).ok()?;
	let claims: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
	claims.get("exp")?.as_u64()
}

/// Test double: fixed tokens, scripted failures.
pub struct StaticTokenSource {
	tokens: HashMap<String, Option<String>>,
}

impl StaticTokenSource {
	pub fn new() -> Self {
		Self {
			tokens: HashMap::new(),
		}
	}

	pub fn with_token(mut self, audience: &str, token: &str) -> Self {
		self.tokens.insert(audience.to_string(), Some(token.to_string()));
		self
	}

	pub fn with_failure(mut self, audience: &str) -> Self {
		self.tokens.insert(audience.to_string(), None);
		self
	}
}

impl Default for StaticTokenSource {
	fn default() -> Self {
		Self::new()
	}
}

#[async_trait]
impl TokenSource for StaticTokenSource {
	async fn get_token(&self, audience: &str) -> Result<IdentityToken, TokenError> {
		match self.tokens.get(audience) {
			Some(Some(token)) => Ok(IdentityToken::new(token, Instant::now() + FALLBACK_TTL)),
			_ => Err(TokenError::Unavailable {
				audience: sanitize_for_log(audience, 100),
			}),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use wiremock::matchers::{header, method, path, query_param};
	use wiremock::{Mock, MockServer, ResponseTemplate};

	fn jws_with_exp(exp: u64) -> String {
		let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256","typ":"JWT"}"#);
		let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"exp":{exp}}}"#));
		format!("{header}.{payload}.sig")
	}

	#[tokio::test]
	async fn mints_with_metadata_header_and_audience() {
		let server = MockServer::start().await;
		let token = jws_with_exp(far_future());
		Mock::given(method("GET"))
			.and(path(IDENTITY_PATH))
			.and(header("Metadata-Flavor", "Google"))
			.and(query_param("audience", "https://svc.run.app"))
			.respond_with(ResponseTemplate::new(200).set_body_string(token.clone()))
			.mount(&server)
			.await;

		let source = MetadataTokenSource::for_endpoint(server.uri());
		let minted = source.get_token("https://svc.run.app").await.unwrap();
		assert_eq!(minted.reveal(), token);
	}

	#[tokio::test]
	async fn second_call_is_served_from_cache() {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.and(path(IDENTITY_PATH))
			.respond_with(ResponseTemplate::new(200).set_body_string(jws_with_exp(far_future())))
			.expect(1)
			.mount(&server)
			.await;

		let source = MetadataTokenSource::for_endpoint(server.uri());
		let first = source.get_token("https://svc.run.app").await.unwrap();
		let second = source.get_token("https://svc.run.app").await.unwrap();
		assert_eq!(first.reveal(), second.reveal());
	}

	#[tokio::test]
	async fn audiences_are_cached_independently() {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.and(query_param("audience", "https://a.run.app"))
			.respond_with(ResponseTemplate::new(200).set_body_string(jws_with_exp(far_future())))
			.expect(1)
			.mount(&server)
			.await;
		Mock::given(method("GET"))
			.and(query_param("audience", "https://b.run.app"))
			.respond_with(ResponseTemplate::new(200).set_body_string(jws_with_exp(far_future())))
			.expect(1)
			.mount(&server)
			.await;

		let source = MetadataTokenSource::for_endpoint(server.uri());
		source.get_token("https://a.run.app").await.unwrap();
		source.get_token("https://b.run.app").await.unwrap();
		source.get_token("https://a.run.app").await.unwrap();
	}

	#[tokio::test]
	async fn non_jws_body_is_rejected() {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.respond_with(ResponseTemplate::new(200).set_body_string("<html>login required</html>"))
			.mount(&server)
			.await;

		let source = MetadataTokenSource::for_endpoint(server.uri());
		let err = source.get_token("https://svc.run.app").await.unwrap_err();
		assert!(matches!(err, TokenError::InvalidFormat { .. }));
	}

	#[tokio::test]
	async fn non_200_is_an_error() {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.respond_with(ResponseTemplate::new(404))
			.mount(&server)
			.await;

		let source = MetadataTokenSource::for_endpoint(server.uri());
		let err = source.get_token("https://svc.run.app").await.unwrap_err();
		assert!(matches!(err, TokenError::Status { status: 404, .. }));
	}

	#[tokio::test]
	async fn error_display_never_contains_token_bytes() {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.respond_with(ResponseTemplate::new(500))
			.mount(&server)
			.await;

		let source = MetadataTokenSource::for_endpoint(server.uri());
		let err = source.get_token("https://some-very-long-audience-url.example.com/with/path").await.unwrap_err();
		let msg = err.to_string();
		assert!(!msg.contains("eyJ"));
		assert!(msg.contains("audience"));
	}

	#[test]
	fn expiry_claim_parsing() {
		assert_eq!(token_expiry(&jws_with_exp(1234)), Some(1234));
		assert_eq!(token_expiry("eyJ.not-base64!.sig"), None);
		assert_eq!(token_expiry("eyJonly-one-segment"), None);
	}

	#[test]
	fn expired_entries_are_not_served() {
		let mut cache = TokenCache::new();
		cache.insert(
			"https://a.run.app",
			IdentityToken::new("eyJ.a.b", Instant::now() - Duration::from_secs(1)),
		);
		assert!(cache.get("https://a.run.app").is_none());
	}

	#[tokio::test]
	async fn static_source_scripts_success_and_failure() {
		let source = StaticTokenSource::new()
			.with_token("https://ok.run.app", "eyJ.aa.bb")
			.with_failure("https://bad.run.app");
		assert_eq!(source.get_token("https://ok.run.app").await.unwrap().reveal(), "eyJ.aa.bb");
		assert!(source.get_token("https://bad.run.app").await.is_err());
		assert!(source.get_token("https://unknown.run.app").await.is_err());
	}

	fn far_future() -> u64 {
		SystemTime::now()
			.duration_since(UNIX_EPOCH)
			.unwrap()
			.as_secs() + 3600
	}
}
