//! Discovery of Cloud Run backends. Talks to the Cloud Run Admin API
//! (Knative serving surface), keeps only services that opted in via the
//! `traefik_enable` label, and resolves the URL the proxy should target.

use std::collections::HashMap;
use std::time::Duration;

use google_cloud_auth::credentials::{self, CacheableResource};
use google_cloud_auth::errors::CredentialsError;
use http::HeaderMap;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::labels::ENABLE_LABEL;

pub const DEFAULT_API_BASE: &str = "https://run.googleapis.com";
const URLS_ANNOTATION: &str = "run.googleapis.com/urls";
const LIST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Error, Debug)]
pub enum DiscoveryError {
	#[error("credentials unavailable: {0}")]
	Credentials(#[from] CredentialsError),
	#[error("credentials could not be built: {0}")]
	Build(#[from] google_cloud_auth::build_errors::Error),
	#[error("failed to list services in {project}/{region}: {source}")]
	Request {
		project: String,
		region: String,
		#[source]
		source: reqwest::Error,
	},
	#[error("listing services in {project}/{region} returned {status}")]
	Status {
		project: String,
		region: String,
		status: u16,
	},
}

/// A backend discovered this cycle. Re-derived from the platform every
/// cycle and never persisted.
#[derive(Debug, Clone)]
pub struct Backend {
	pub name: String,
	pub project: String,
	pub region: String,
	pub url: String,
	pub labels: HashMap<String, String>,
}

// The Knative envelope, reduced to the fields we read.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct KnativeService {
	pub metadata: ObjectMeta,
	pub spec: ServiceSpec,
	pub status: ServiceStatus,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ObjectMeta {
	pub name: String,
	pub labels: HashMap<String, String>,
	pub annotations: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServiceSpec {
	pub template: RevisionTemplate,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RevisionTemplate {
	pub metadata: ObjectMeta,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServiceStatus {
	pub url: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ListServicesResponse {
	items: Vec<KnativeService>,
	metadata: ListMeta,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ListMeta {
	#[serde(rename = "continue")]
	continue_token: String,
}

/// Pick the URL the proxy should use for a service. Cloud Run advertises
/// two forms; the hash-based `*.a.run.app` one can 404 on `GET /` through
/// the Google front end, so the project-number form is preferred when the
/// `run.googleapis.com/urls` annotation offers one.
pub fn preferred_url(svc: &KnativeService) -> String {
	let Some(raw) = svc.metadata.annotations.get(URLS_ANNOTATION) else {
		return svc.status.url.clone();
	};
	let Ok(urls) = serde_json::from_str::<Vec<String>>(raw) else {
		return svc.status.url.clone();
	};
	for candidate in &urls {
		if let Ok(parsed) = reqwest::Url::parse(candidate) {
			if parsed
				.host_str()
				.is_some_and(|host| !host.ends_with(".a.run.app"))
			{
				return candidate.clone();
			}
		}
	}
	svc.status.url.clone()
}

/// The label bag that carries the opt-in marker, if any. Service-level
/// labels (set with `gcloud run deploy --labels`) win over the revision
/// template's; whichever bag carried the marker is also the source of
/// routing intent, so the enable signal and the routes always agree.
fn enabled_labels(svc: &KnativeService) -> Option<&HashMap<String, String>> {
	for bag in [&svc.metadata.labels, &svc.spec.template.metadata.labels] {
		if bag.get(ENABLE_LABEL).map(String::as_str) == Some("true") {
			return Some(bag);
		}
	}
	None
}

pub struct InventoryClient {
	http: reqwest::Client,
	base_url: String,
	credentials: Option<credentials::Credentials>,
}

impl InventoryClient {
	/// Production client using Application Default Credentials.
	pub fn new() -> Result<Self, DiscoveryError> {
		let credentials = credentials::Builder::default().build()?;
		Ok(Self {
			http: Self::http_client(),
			base_url: DEFAULT_API_BASE.to_string(),
			credentials: Some(credentials),
		})
	}

	/// Unauthenticated client against an alternate endpoint; used by tests
	/// and local emulators.
	pub fn for_endpoint(base_url: impl Into<String>) -> Self {
		Self {
			http: Self::http_client(),
			base_url: base_url.into(),
			credentials: None,
		}
	}

	fn http_client() -> reqwest::Client {
		reqwest::Client::builder()
			.timeout(LIST_TIMEOUT)
			.build()
			.expect("failed to build http client")
	}

	async fn auth_headers(&self) -> Result<Option<HeaderMap>, DiscoveryError> {
		let Some(credentials) = &self.credentials else {
			return Ok(None);
		};
		match credentials.headers(http::Extensions::new()).await? {
			CacheableResource::New { data, .. } => Ok(Some(data)),
			CacheableResource::NotModified => Err(DiscoveryError::Credentials(
				CredentialsError::from_msg(false, "expected credential headers to be present"),
			)),
		}
	}

	/// List every enabled backend in one project and region, following
	/// pagination until the continuation token runs out.
	pub async fn list_enabled(
		&self,
		project: &str,
		region: &str,
	) -> Result<Vec<Backend>, DiscoveryError> {
		let url = format!(
			"{}/apis/serving.knative.dev/v1/projects/{}/locations/{}/services",
			self.base_url, project, region
		);
		let headers = self.auth_headers().await?;

		let mut backends = Vec::new();
		let mut page_token = String::new();
		loop {
			let mut request = self.http.get(&url);
			if let Some(headers) = &headers {
				request = request.headers(headers.clone());
			}
			if !page_token.is_empty() {
				request = request.query(&[("continue", page_token.as_str())]);
			}

			let response = request.send().await.map_err(|source| DiscoveryError::Request {
				project: project.to_string(),
				region: region.to_string(),
				source,
			})?;
			let status = response.status();
			if !status.is_success() {
				return Err(DiscoveryError::Status {
					project: project.to_string(),
					region: region.to_string(),
					status: status.as_u16(),
				});
			}
			let page: ListServicesResponse =
				response.json().await.map_err(|source| DiscoveryError::Request {
					project: project.to_string(),
					region: region.to_string(),
					source,
				})?;

			for svc in &page.items {
				let Some(labels) = enabled_labels(svc) else {
					debug!(service = %svc.metadata.name, "service not enabled, skipping");
					continue;
				};
				backends.push(Backend {
					name: svc.metadata.name.clone(),
					project: project.to_string(),
					region: region.to_string(),
					url: preferred_url(svc),
					labels: labels.clone(),
				});
			}

			page_token = page.metadata.continue_token;
			if page_token.is_empty() {
				break;
			}
		}
		Ok(backends)
	}
}
