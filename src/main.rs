use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use prometheus_client::registry::Registry;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use cloudrun_gateway::config::{self, Settings};
use cloudrun_gateway::discovery::InventoryClient;
use cloudrun_gateway::emit::FileEmitter;
use cloudrun_gateway::metrics::{App as MetricsApp, Metrics};
use cloudrun_gateway::provider::Provider;
use cloudrun_gateway::signal;
use cloudrun_gateway::token::{MetadataTokenSource, TokenSource};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
	/// Output path for the generated dynamic configuration
	#[arg(value_name = "OUTPUT", default_value = config::DEFAULT_OUTPUT)]
	output: PathBuf,

	/// Keep running and regenerate the configuration on an interval
	#[arg(long)]
	watch: bool,

	/// Poll interval in seconds for watch mode
	#[arg(long, value_name = "SECS", default_value_t = 30)]
	poll_interval: u64,

	/// Maximum number of backends processed concurrently
	#[arg(long, value_name = "N", default_value_t = config::DEFAULT_CONCURRENCY)]
	concurrency: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
		.with_writer(std::io::stderr)
		.with_ansi(false)
		.init();

	let args = Args::parse();
	let mut settings = Settings::from_env()?;
	settings.poll_interval = Duration::from_secs(args.poll_interval);
	settings.concurrency = args.concurrency;

	info!(
		environment = %settings.environment,
		projects = ?settings.projects,
		region = %settings.region,
		output = %args.output.display(),
		"generating Traefik routes from Cloud Run service labels"
	);

	let mut registry = Registry::default();
	let metrics = Arc::new(Metrics::new(&mut registry));
	let inventory = InventoryClient::new()?;
	let tokens: Arc<dyn TokenSource> = Arc::new(MetadataTokenSource::new());
	let cycle_timeout = settings.cycle_timeout;
	let environment = settings.environment.clone();
	let provider = Provider::new(settings, inventory, tokens, metrics);
	let emitter = FileEmitter::new(args.output, environment);

	if args.watch {
		let shutdown = CancellationToken::new();
		let signal_shutdown = shutdown.clone();
		tokio::spawn(async move {
			signal::Shutdown::new().wait().await;
			signal_shutdown.cancel();
		});

		let metrics_shutdown = shutdown.clone();
		tokio::spawn(async move {
			if let Err(e) = serve_metrics(Arc::new(registry), metrics_shutdown).await {
				error!(error = %e, "metrics listener failed");
			}
		});

		provider.run(&emitter, shutdown).await;
	} else {
		let summary = tokio::time::timeout(cycle_timeout, provider.run_cycle(&emitter))
			.await
			.map_err(|_| anyhow::anyhow!("generation cycle exceeded {cycle_timeout:?} deadline"))??;
		eprintln!("{summary}");
	}

	Ok(())
}

async fn serve_metrics(
	registry: Arc<Registry>,
	shutdown: CancellationToken,
) -> Result<(), std::io::Error> {
	let listener = tokio::net::TcpListener::bind("127.0.0.1:9091").await?;
	let app = MetricsApp::new(registry);
	axum::serve(listener, app.router())
		.with_graceful_shutdown(async move { shutdown.cancelled().await })
		.await
}
