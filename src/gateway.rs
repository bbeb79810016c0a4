//! The Traefik dynamic configuration model and the assembly of backends
//! into it. Maps are BTreeMaps so emission is stable across cycles and the
//! "first non-empty service name" choice does not depend on hash order.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::labels::DEFAULT_ENTRY_POINT;
use crate::redact::sanitize_headers_for_logging;

/// Header used for service-to-service identity. Cloud Run accepts the
/// identity token in either `Authorization` or `X-Serverless-Authorization`
/// and only checks the latter when both are present, which leaves the
/// client's own `Authorization` header untouched.
pub const AUTH_HEADER: &str = "X-Serverless-Authorization";

/// Externally-defined middleware that soaks cold-start latency.
pub const RETRY_MIDDLEWARE: &str = "retry-cold-start@file";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DynamicConfig {
	pub http: HttpConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
	pub routers: BTreeMap<String, RouterConfig>,
	pub services: BTreeMap<String, ServiceConfig>,
	pub middlewares: BTreeMap<String, MiddlewareConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouterConfig {
	pub rule: String,
	pub service: String,
	pub priority: i32,
	// Must be the plural spelling; Traefik silently ignores `entryPoint`.
	#[serde(rename = "entryPoints")]
	pub entry_points: Vec<String>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub middlewares: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
	#[serde(rename = "loadBalancer")]
	pub load_balancer: LoadBalancerConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadBalancerConfig {
	pub servers: Vec<ServerConfig>,
	// The backend must see its own hostname: the service URL doubles as the
	// identity-token audience and Cloud Run rejects mismatches.
	#[serde(rename = "passHostHeader")]
	pub pass_host_header: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
	pub url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MiddlewareConfig {
	pub headers: HeadersConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeadersConfig {
	#[serde(rename = "customRequestHeaders", default)]
	pub custom_request_headers: BTreeMap<String, String>,
}

impl ServiceConfig {
	/// A single-origin binding for a backend URL.
	pub fn single(url: &str) -> Self {
		Self {
			load_balancer: LoadBalancerConfig {
				servers: vec![ServerConfig { url: url.to_string() }],
				pass_host_header: false,
			},
		}
	}
}

impl DynamicConfig {
	pub fn new() -> Self {
		Self::default()
	}

	/// Routers for Traefik's own API and dashboard, always present so the
	/// control plane stays reachable even when discovery comes up empty.
	pub fn add_internal_routers(&mut self) {
		self.http.routers.insert(
			"traefik-api".to_string(),
			RouterConfig {
				rule: "PathPrefix(`/api/http`) || PathPrefix(`/api/rawdata`) || PathPrefix(`/api/overview`) || Path(`/api/version`)".to_string(),
				service: "api@internal".to_string(),
				priority: 1000,
				entry_points: vec![DEFAULT_ENTRY_POINT.to_string()],
				middlewares: Vec::new(),
			},
		);
		self.http.routers.insert(
			"traefik-dashboard".to_string(),
			RouterConfig {
				rule: "PathPrefix(`/dashboard`)".to_string(),
				service: "api@internal".to_string(),
				priority: 1000,
				entry_points: vec![DEFAULT_ENTRY_POINT.to_string()],
				middlewares: Vec::new(),
			},
		);
	}

	/// Merge one backend's routers into the config. Returns the canonical
	/// service name the backend was filed under.
	///
	/// Every router gets the backend's auth middleware and the cold-start
	/// retry middleware appended. The service binding and the auth
	/// middleware definition are added on first sight of the service name;
	/// when no token is available the middleware definition is omitted
	/// entirely so requests fail closed at the backend instead of carrying
	/// a placeholder credential.
	pub fn merge_backend(
		&mut self,
		backend_name: &str,
		url: &str,
		routers: BTreeMap<String, RouterConfig>,
		token: Option<&str>,
	) -> String {
		let service_name = routers
			.values()
			.find(|r| !r.service.is_empty())
			.map(|r| r.service.clone())
			.unwrap_or_else(|| backend_name.to_string());
		let auth_name = format!("{service_name}-auth");
		let auth_name_file = format!("{auth_name}@file");

		for (name, mut router) in routers {
			if router.service.is_empty() {
				router.service = service_name.clone();
			}
			if !router
				.middlewares
				.iter()
				.any(|m| *m == auth_name || *m == auth_name_file)
			{
				router.middlewares.push(auth_name.clone());
			}
			if !router.middlewares.iter().any(|m| m == RETRY_MIDDLEWARE) {
				router.middlewares.push(RETRY_MIDDLEWARE.to_string());
			}
			self.http.routers.insert(name, router);
		}

		if !self.http.services.contains_key(&service_name) {
			self.http
				.services
				.insert(service_name.clone(), ServiceConfig::single(url));
			if let Some(token) = token {
				self.add_auth_middleware(&auth_name, token);
			}
		}

		service_name
	}

	pub fn add_auth_middleware(&mut self, name: &str, token: &str) {
		if token.is_empty() {
			warn!(middleware = name, "refusing to create auth middleware without a token");
			return;
		}
		let mut headers = BTreeMap::new();
		headers.insert(AUTH_HEADER.to_string(), format!("Bearer {token}"));
		self.http.middlewares.insert(
			name.to_string(),
			MiddlewareConfig {
				headers: HeadersConfig {
					custom_request_headers: headers,
				},
			},
		);
	}

	/// A copy with credential-bearing header values redacted. This is the
	/// only form that may be serialized into logs; the production config
	/// keeps real tokens.
	pub fn redacted(&self) -> DynamicConfig {
		let mut copy = self.clone();
		for mw in copy.http.middlewares.values_mut() {
			mw.headers.custom_request_headers =
				sanitize_headers_for_logging(&mw.headers.custom_request_headers);
		}
		copy
	}

	pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
		serde_yaml::to_string(self)
	}

	pub fn to_redacted_yaml(&self) -> Result<String, serde_yaml::Error> {
		self.redacted().to_yaml()
	}
}
