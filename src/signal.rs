// Originally derived from https://github.com/istio/ztunnel (Apache 2.0 licensed)

pub struct Shutdown {}

impl Shutdown {
	pub fn new() -> Self {
		Shutdown {}
	}

	/// Wait completes when a shutdown signal arrives
	pub async fn wait(self) {
		imp::shutdown().await
	}
}

impl Default for Shutdown {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(unix)]
mod imp {
	use std::process;

	use tokio::signal::unix::{signal, SignalKind};
	use tracing::info;

	pub(super) async fn shutdown() {
		tokio::select! {
			_ = watch_signal(SignalKind::interrupt(), "SIGINT") => {
				tokio::spawn(async move {
					watch_signal(SignalKind::interrupt(), "SIGINT").await;
					info!("Double Ctrl+C, exit immediately");
					process::exit(0);
				});
			}
			_ = watch_signal(SignalKind::terminate(), "SIGTERM") => {}
		};
	}

	async fn watch_signal(kind: SignalKind, name: &'static str) {
		signal(kind)
			.expect("Failed to register signal handler")
			.recv()
			.await;
		info!("received signal {}, starting shutdown", name);
	}
}

#[cfg(not(unix))]
mod imp {
	use tracing::info;

	pub(super) async fn shutdown() {
		tokio::signal::ctrl_c()
			.await
			.expect("Failed to register signal handler");
		info!("received signal, starting shutdown");
	}
}
