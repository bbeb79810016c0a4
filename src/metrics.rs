use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;

pub struct Metrics {
	pub cycles: Counter,
	pub cycle_failures: Counter,
	pub backends_discovered: Counter,
	pub backends_processed: Counter,
	pub token_failures: Family<TokenFailure, Counter>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct TokenFailure {
	pub service: String,
}

impl Metrics {
	pub fn new(registry: &mut Registry) -> Self {
		let cycles = Counter::default();
		registry.register(
			"generation_cycles",
			"The total number of completed generation cycles",
			cycles.clone(),
		);

		let cycle_failures = Counter::default();
		registry.register(
			"generation_cycle_failures",
			"The total number of generation cycles that failed or timed out",
			cycle_failures.clone(),
		);

		let backends_discovered = Counter::default();
		registry.register(
			"backends_discovered",
			"The total number of backends returned by discovery",
			backends_discovered.clone(),
		);

		let backends_processed = Counter::default();
		registry.register(
			"backends_processed",
			"The total number of backends merged into the dynamic config",
			backends_processed.clone(),
		);

		let token_failures = Family::default();
		registry.register(
			"token_fetch_failures",
			"The total number of identity token mint failures by service",
			token_failures.clone(),
		);

		Self {
			cycles,
			cycle_failures,
			backends_discovered,
			backends_processed,
			token_failures,
		}
	}
}

#[derive(Clone)]
pub struct App {
	registry: Arc<Registry>,
}

impl App {
	pub fn new(registry: Arc<Registry>) -> Self {
		Self { registry }
	}
	pub fn router(&self) -> Router {
		Router::new()
			.route("/metrics", get(metrics_handler))
			.with_state(self.clone())
	}
}

async fn metrics_handler(State(app): State<App>) -> Result<String, StatusCode> {
	let mut buffer = String::new();
	encode(&mut buffer, &app.registry).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
	Ok(buffer)
}
