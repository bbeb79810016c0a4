//! The generation cycle: discover backends across projects, translate their
//! labels, mint identity tokens, assemble the dynamic config and publish it.
//! One cycle is one complete re-derivation from the platform; nothing is
//! carried over between cycles except the previously published config, which
//! stays active whenever a cycle fails.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::discovery::{Backend, InventoryClient};
use crate::emit::{ConfigPublisher, EmitError};
use crate::gateway::DynamicConfig;
use crate::labels::parse_router_labels;
use crate::metrics::{Metrics, TokenFailure};
use crate::token::TokenSource;

#[derive(Error, Debug)]
pub enum CycleError {
	#[error(transparent)]
	Emit(#[from] EmitError),
}

/// A qualifying backend carried no usable router labels. Recoverable; the
/// backend is skipped for this cycle.
#[derive(Error, Debug)]
#[error("no router labels found")]
pub struct NoRouterLabels;

#[derive(Debug, Default, Clone)]
pub struct CycleSummary {
	pub projects_queried: usize,
	pub projects_failed: usize,
	pub backends_processed: usize,
	pub backends_skipped: usize,
	pub routers_emitted: usize,
	pub tokens_minted: usize,
	pub token_failures: usize,
	pub services: BTreeSet<String>,
}

impl fmt::Display for CycleSummary {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		writeln!(f, "generation summary:")?;
		writeln!(
			f,
			"  projects queried: {} ({} failed)",
			self.projects_queried, self.projects_failed
		)?;
		writeln!(
			f,
			"  backends processed: {} ({} skipped)",
			self.backends_processed, self.backends_skipped
		)?;
		writeln!(f, "  routers emitted: {}", self.routers_emitted)?;
		writeln!(
			f,
			"  tokens minted: {} ({} failed)",
			self.tokens_minted, self.token_failures
		)?;
		write!(
			f,
			"  services: {}",
			self
				.services
				.iter()
				.cloned()
				.collect::<Vec<_>>()
				.join(", ")
		)
	}
}

struct BackendOutcome {
	service: String,
	token_ok: bool,
}

pub struct Provider {
	settings: Settings,
	inventory: Arc<InventoryClient>,
	tokens: Arc<dyn TokenSource>,
	metrics: Arc<Metrics>,
}

impl Provider {
	pub fn new(
		settings: Settings,
		inventory: InventoryClient,
		tokens: Arc<dyn TokenSource>,
		metrics: Arc<Metrics>,
	) -> Self {
		Self {
			settings,
			inventory: Arc::new(inventory),
			tokens,
			metrics,
		}
	}

	/// Run one full generation cycle and publish the result. Per-project and
	/// per-backend failures are recorded in the summary and do not fail the
	/// cycle; a publish failure does.
	pub async fn run_cycle(
		&self,
		publisher: &dyn ConfigPublisher,
	) -> Result<CycleSummary, CycleError> {
		let mut summary = CycleSummary::default();

		let mut discovery = JoinSet::new();
		for project in &self.settings.projects {
			let inventory = self.inventory.clone();
			let project = project.clone();
			let region = self.settings.region.clone();
			discovery.spawn(async move {
				let found = inventory.list_enabled(&project, &region).await;
				(project, found)
			});
		}

		let mut backends: Vec<Backend> = Vec::new();
		while let Some(joined) = discovery.join_next().await {
			summary.projects_queried += 1;
			match joined {
				Ok((project, Ok(found))) => {
					info!(project = %project, backends = found.len(), "discovered services");
					backends.extend(found);
				},
				Ok((project, Err(e))) => {
					warn!(project = %project, error = %e, "discovery failed, continuing with remaining projects");
					summary.projects_failed += 1;
				},
				Err(e) => {
					warn!(error = %e, "discovery task failed");
					summary.projects_failed += 1;
				},
			}
		}
		self.metrics.backends_discovered.inc_by(backends.len() as u64);

		let config = Arc::new(Mutex::new(DynamicConfig::new()));
		config.lock().unwrap().add_internal_routers();

		let semaphore = Arc::new(Semaphore::new(self.settings.concurrency));
		let mut workers = JoinSet::new();
		for backend in backends {
			let semaphore = semaphore.clone();
			let tokens = self.tokens.clone();
			let config = config.clone();
			workers.spawn(async move {
				let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
				let name = backend.name.clone();
				(name, process_backend(tokens, backend, config).await)
			});
		}
		while let Some(joined) = workers.join_next().await {
			match joined {
				Ok((_, Ok(outcome))) => {
					summary.backends_processed += 1;
					self.metrics.backends_processed.inc();
					if outcome.token_ok {
						summary.tokens_minted += 1;
					} else {
						summary.token_failures += 1;
						self
							.metrics
							.token_failures
							.get_or_create(&TokenFailure {
								service: outcome.service,
							})
							.inc();
					}
				},
				Ok((name, Err(e))) => {
					warn!(service = %name, "{e}, skipping backend");
					summary.backends_skipped += 1;
				},
				Err(e) => {
					warn!(error = %e, "backend task failed");
					summary.backends_skipped += 1;
				},
			}
		}

		let config = config.lock().unwrap().clone();
		summary.routers_emitted = config.http.routers.len();
		summary.services = config.http.services.keys().cloned().collect();

		publisher.publish(&config).await?;
		if let Ok(yaml) = config.to_redacted_yaml() {
			debug!("published config:\n{yaml}");
		}
		Ok(summary)
	}

	/// Periodic mode: re-run the cycle on a jittered interval until shutdown
	/// is requested. An in-flight cycle always completes (or hits the cycle
	/// deadline) before the loop exits.
	pub async fn run(&self, publisher: &dyn ConfigPublisher, shutdown: CancellationToken) {
		let mut previous: BTreeSet<String> = BTreeSet::new();
		loop {
			match tokio::time::timeout(self.settings.cycle_timeout, self.run_cycle(publisher)).await {
				Ok(Ok(summary)) => {
					self.metrics.cycles.inc();
					let added: Vec<&String> = summary.services.difference(&previous).collect();
					let removed: Vec<&String> = previous.difference(&summary.services).collect();
					if !added.is_empty() || !removed.is_empty() {
						info!(?added, ?removed, "service set changed");
					}
					info!(
						backends = summary.backends_processed,
						routers = summary.routers_emitted,
						tokens_minted = summary.tokens_minted,
						token_failures = summary.token_failures,
						"cycle complete"
					);
					previous = summary.services;
				},
				Ok(Err(e)) => {
					self.metrics.cycle_failures.inc();
					warn!(error = %e, "cycle failed, previously published config remains active");
				},
				Err(_) => {
					self.metrics.cycle_failures.inc();
					warn!(
						deadline = ?self.settings.cycle_timeout,
						"cycle exceeded deadline, previously published config remains active"
					);
				},
			}

			let delay = jittered(self.settings.poll_interval);
			tokio::select! {
				_ = shutdown.cancelled() => {
					info!("shutdown requested, stopping provider");
					return;
				}
				_ = tokio::time::sleep(delay) => {}
			}
		}
	}
}

async fn process_backend(
	tokens: Arc<dyn TokenSource>,
	backend: Backend,
	config: Arc<Mutex<DynamicConfig>>,
) -> Result<BackendOutcome, NoRouterLabels> {
	let routers = parse_router_labels(&backend.labels);
	if routers.is_empty() {
		return Err(NoRouterLabels);
	}
	debug!(service = %backend.name, routers = routers.len(), "parsed router labels");

	// Audience-bound to the same URL the service binding will carry; the
	// backend rejects tokens minted for any other audience.
	let token = match tokens.get_token(&backend.url).await {
		Ok(token) => Some(token),
		Err(e) => {
			warn!(service = %backend.name, error = %e, "token mint failed, auth middleware will be omitted");
			None
		},
	};

	let mut config = config.lock().unwrap();
	let service = config.merge_backend(
		&backend.name,
		&backend.url,
		routers,
		token.as_ref().map(|t| t.reveal()),
	);
	Ok(BackendOutcome {
		service,
		token_ok: token.is_some(),
	})
}

fn jittered(interval: Duration) -> Duration {
	interval + interval.mul_f64(rand::rng().random_range(0.0..0.1))
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::emit::ChannelEmitter;
	use crate::token::StaticTokenSource;
	use prometheus_client::registry::Registry;
	use serde_json::json;
	use wiremock::matchers::{method, path};
	use wiremock::{Mock, MockServer, ResponseTemplate};

	fn settings(projects: &[&str]) -> Settings {
		Settings {
			environment: "stg".to_string(),
			projects: projects.iter().map(|p| p.to_string()).collect(),
			region: "us-central1".to_string(),
			poll_interval: Duration::from_secs(30),
			concurrency: 8,
			cycle_timeout: Duration::from_secs(60),
		}
	}

	fn provider(server: &MockServer, projects: &[&str], tokens: StaticTokenSource) -> Provider {
		let mut registry = Registry::default();
		let metrics = Arc::new(Metrics::new(&mut registry));
		Provider::new(
			settings(projects),
			InventoryClient::for_endpoint(server.uri()),
			Arc::new(tokens),
			metrics,
		)
	}

	fn list_path(project: &str) -> String {
		format!("/apis/serving.knative.dev/v1/projects/{project}/locations/us-central1/services")
	}

	fn home_index_item() -> serde_json::Value {
		json!({
			"metadata": {
				"name": "home-index",
				"labels": {
					"traefik_enable": "true",
					"traefik_http_routers_home_rule": "PathPrefix(`/`)",
					"traefik_http_routers_home_service": "home-index"
				},
				"annotations": {}
			},
			"spec": { "template": { "metadata": { "labels": {} } } },
			"status": { "url": "https://home-index-abc.run.app" }
		})
	}

	#[tokio::test]
	async fn minimal_single_backend_cycle() {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.and(path(list_path("p1")))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({
				"items": [home_index_item()],
				"metadata": {}
			})))
			.mount(&server)
			.await;

		let tokens = StaticTokenSource::new().with_token("https://home-index-abc.run.app", "eyJ.aa.bb");
		let provider = provider(&server, &["p1"], tokens);
		let (emitter, rx) = ChannelEmitter::new();

		let summary = provider.run_cycle(&emitter).await.unwrap();
		assert_eq!(summary.backends_processed, 1);
		assert_eq!(summary.tokens_minted, 1);
		assert_eq!(summary.token_failures, 0);
		// home plus the two internal routers
		assert_eq!(summary.routers_emitted, 3);

		let config = rx.borrow().clone();
		let home = &config.http.routers["home"];
		assert_eq!(home.rule, "PathPrefix(`/`)");
		assert_eq!(home.service, "home-index");
		assert_eq!(home.priority, 200);
		assert_eq!(home.entry_points, vec!["web"]);
		assert_eq!(home.middlewares, vec!["home-index-auth", "retry-cold-start@file"]);
		assert_eq!(
			config.http.services["home-index"].load_balancer.servers[0].url,
			"https://home-index-abc.run.app"
		);
		assert_eq!(
			config.http.middlewares["home-index-auth"]
				.headers
				.custom_request_headers["X-Serverless-Authorization"],
			"Bearer eyJ.aa.bb"
		);
	}

	#[tokio::test]
	async fn token_failure_keeps_router_but_omits_middleware() {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.and(path(list_path("p1")))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({
				"items": [home_index_item()],
				"metadata": {}
			})))
			.mount(&server)
			.await;

		let tokens = StaticTokenSource::new().with_failure("https://home-index-abc.run.app");
		let provider = provider(&server, &["p1"], tokens);
		let (emitter, rx) = ChannelEmitter::new();

		let summary = provider.run_cycle(&emitter).await.unwrap();
		assert_eq!(summary.token_failures, 1);
		assert_eq!(summary.tokens_minted, 0);

		let config = rx.borrow().clone();
		assert!(config.http.routers["home"]
			.middlewares
			.contains(&"home-index-auth".to_string()));
		assert!(!config.http.middlewares.contains_key("home-index-auth"));
	}

	#[tokio::test]
	async fn one_failed_project_does_not_abort_the_other() {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.and(path(list_path("p1")))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({
				"items": [home_index_item()],
				"metadata": {}
			})))
			.mount(&server)
			.await;
		Mock::given(method("GET"))
			.and(path(list_path("p2")))
			.respond_with(ResponseTemplate::new(500))
			.mount(&server)
			.await;

		let tokens = StaticTokenSource::new().with_token("https://home-index-abc.run.app", "eyJ.aa.bb");
		let provider = provider(&server, &["p1", "p2"], tokens);
		let (emitter, rx) = ChannelEmitter::new();

		let summary = provider.run_cycle(&emitter).await.unwrap();
		assert_eq!(summary.projects_queried, 2);
		assert_eq!(summary.projects_failed, 1);
		assert_eq!(summary.backends_processed, 1);
		assert!(rx.borrow().http.routers.contains_key("home"));
	}

	#[tokio::test]
	async fn backend_without_router_labels_is_skipped() {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.and(path(list_path("p1")))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({
				"items": [{
					"metadata": {
						"name": "quiet-svc",
						"labels": { "traefik_enable": "true" },
						"annotations": {}
					},
					"spec": { "template": { "metadata": { "labels": {} } } },
					"status": { "url": "https://quiet.run.app" }
				}],
				"metadata": {}
			})))
			.mount(&server)
			.await;

		let provider = provider(&server, &["p1"], StaticTokenSource::new());
		let (emitter, rx) = ChannelEmitter::new();

		let summary = provider.run_cycle(&emitter).await.unwrap();
		assert_eq!(summary.backends_skipped, 1);
		assert_eq!(summary.backends_processed, 0);
		// Only the internal routers survive.
		assert_eq!(rx.borrow().http.routers.len(), 2);
		assert!(rx.borrow().http.services.is_empty());
	}

	#[test]
	fn summary_display_lists_counts() {
		let mut summary = CycleSummary::default();
		summary.projects_queried = 2;
		summary.projects_failed = 1;
		summary.backends_processed = 3;
		summary.routers_emitted = 7;
		summary.tokens_minted = 2;
		summary.token_failures = 1;
		summary.services.insert("home-index".to_string());

		let text = summary.to_string();
		assert!(text.contains("projects queried: 2 (1 failed)"));
		assert!(text.contains("routers emitted: 7"));
		assert!(text.contains("tokens minted: 2 (1 failed)"));
		assert!(text.contains("services: home-index"));
	}

	#[test]
	fn jitter_stays_within_ten_percent() {
		let interval = Duration::from_secs(30);
		for _ in 0..100 {
			let d = jittered(interval);
			assert!(d >= interval);
			assert!(d <= interval + Duration::from_secs(3));
		}
	}
}
