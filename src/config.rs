//! Control-plane settings, resolved from the environment with
//! installation-specific defaults.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

pub const DEFAULT_OUTPUT: &str = "/etc/traefik/dynamic/routes.yml";
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_CONCURRENCY: usize = 8;
pub const DEFAULT_CYCLE_TIMEOUT: Duration = Duration::from_secs(60);

const DEFAULT_ENVIRONMENT: &str = "stg";
const DEFAULT_REGION: &str = "us-central1";

/// Startup misconfiguration. These refuse the process rather than degrade.
#[derive(Error, Debug)]
pub enum ConfigError {
	#[error("at least one project ID must be configured")]
	NoProjects,
	#[error("region must not be empty")]
	EmptyRegion,
}

#[derive(Debug, Clone, Serialize)]
pub struct Settings {
	pub environment: String,
	pub projects: Vec<String>,
	pub region: String,
	#[serde(skip)]
	pub poll_interval: Duration,
	pub concurrency: usize,
	#[serde(skip)]
	pub cycle_timeout: Duration,
}

impl Settings {
	/// Resolve settings from the environment. Project IDs default to the
	/// conventional `labs-<env>` / `labs-home-<env>` pair.
	pub fn from_env() -> Result<Self, ConfigError> {
		let environment = env_or("ENVIRONMENT", DEFAULT_ENVIRONMENT);
		let labs_project = env_or("LABS_PROJECT_ID", &format!("labs-{environment}"));
		let home_project = env_or("HOME_PROJECT_ID", &format!("labs-home-{environment}"));
		let region = env_or("REGION", DEFAULT_REGION);

		Settings {
			environment,
			projects: vec![labs_project, home_project],
			region,
			poll_interval: DEFAULT_POLL_INTERVAL,
			concurrency: DEFAULT_CONCURRENCY,
			cycle_timeout: DEFAULT_CYCLE_TIMEOUT,
		}
		.validated()
	}

	pub fn validated(mut self) -> Result<Self, ConfigError> {
		self.projects.retain(|p| !p.is_empty());
		if self.projects.is_empty() {
			return Err(ConfigError::NoProjects);
		}
		if self.region.is_empty() {
			return Err(ConfigError::EmptyRegion);
		}
		Ok(self)
	}
}

fn env_or(key: &str, default: &str) -> String {
	match std::env::var(key) {
		Ok(v) if !v.is_empty() => v,
		_ => default.to_string(),
	}
}
