//! Publishing the assembled dynamic configuration: either a YAML file
//! consumed by Traefik's file provider, or a live channel consumed by an
//! embedding proxy runtime.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use thiserror::Error;
use tokio::sync::watch;
use tracing::info;

use crate::gateway::DynamicConfig;

#[derive(Error, Debug)]
pub enum EmitError {
	#[error("failed to write {}: {source}", path.display())]
	Io {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},
	#[error("failed to serialize dynamic config: {0}")]
	Serialize(#[from] serde_yaml::Error),
	#[error("config channel closed by consumer")]
	ChannelClosed,
}

#[async_trait]
pub trait ConfigPublisher: Send + Sync {
	async fn publish(&self, config: &DynamicConfig) -> Result<(), EmitError>;
}

/// Writes the config as YAML to a path, atomically (write to a sibling temp
/// file, then rename over the target).
pub struct FileEmitter {
	path: PathBuf,
	environment: String,
}

impl FileEmitter {
	pub fn new(path: impl Into<PathBuf>, environment: impl Into<String>) -> Self {
		Self {
			path: path.into(),
			environment: environment.into(),
		}
	}

	fn header(&self) -> String {
		format!(
			"# Auto-generated Traefik routes from Cloud Run service labels\n\
			 # Generated at: {}\n\
			 # Environment: {}\n\
			 #\n\
			 # Labels follow the docker-compose provider format.\n\n",
			Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
			self.environment,
		)
	}

	fn temp_path(&self) -> PathBuf {
		let file_name = self
			.path
			.file_name()
			.map(|n| n.to_string_lossy().into_owned())
			.unwrap_or_else(|| "routes.yml".to_string());
		self.path.with_file_name(format!("{file_name}.tmp"))
	}
}

#[async_trait]
impl ConfigPublisher for FileEmitter {
	async fn publish(&self, config: &DynamicConfig) -> Result<(), EmitError> {
		let io_err = |path: &Path| {
			let path = path.to_path_buf();
			move |source| EmitError::Io { path, source }
		};

		if let Some(parent) = self.path.parent() {
			if !parent.as_os_str().is_empty() {
				tokio::fs::create_dir_all(parent)
					.await
					.map_err(io_err(parent))?;
			}
		}

		let body = format!("{}{}", self.header(), config.to_yaml()?);
		let temp = self.temp_path();
		tokio::fs::write(&temp, body).await.map_err(io_err(&temp))?;
		tokio::fs::rename(&temp, &self.path)
			.await
			.map_err(io_err(&self.path))?;

		info!(
			path = %self.path.display(),
			routers = config.http.routers.len(),
			services = config.http.services.len(),
			"wrote dynamic config"
		);
		Ok(())
	}
}

/// Hands the config to an in-process consumer over a watch channel. The
/// channel holds a single slot: publishing replaces any value the consumer
/// has not picked up yet, so a slow consumer only ever sees the newest
/// config and never wedges the control plane.
pub struct ChannelEmitter {
	tx: watch::Sender<DynamicConfig>,
}

impl ChannelEmitter {
	pub fn new() -> (Self, watch::Receiver<DynamicConfig>) {
		let (tx, rx) = watch::channel(DynamicConfig::new());
		(Self { tx }, rx)
	}
}

#[async_trait]
impl ConfigPublisher for ChannelEmitter {
	async fn publish(&self, config: &DynamicConfig) -> Result<(), EmitError> {
		self
			.tx
			.send(config.clone())
			.map_err(|_| EmitError::ChannelClosed)
	}
}
