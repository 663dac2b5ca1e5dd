use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use prometheus_client::registry::Registry;
use tokio::task::JoinSet;
use tracing_subscriber::EnvFilter;

use clusterproxy::admin::App as AdminApp;
use clusterproxy::bootstrap::serve_proxier;
use clusterproxy::config::Args;
use clusterproxy::metrics::{self, App as MetricsApp, ProxyGauges};

#[tokio::main]
async fn main() -> Result<()> {
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
		.with_writer(std::io::stderr)
		.with_ansi(false)
		.init();

	let args = Args::parse();
	let config = args.load().await?;
	let admin_addr = config.admin_addr.clone();

	let handle = serve_proxier(config).await?;
	let manager = Arc::clone(&handle.manager);

	let mut registry = Registry::default();
	let gauges = ProxyGauges::register(metrics::sub_registry(&mut registry));
	let registry = Arc::new(registry);

	let admin_router = AdminApp::new(Arc::clone(&manager)).router();
	let metrics_router =
		MetricsApp::with_proxy_sampler(registry, Arc::clone(&manager), gauges).router();
	let admin_app = admin_router.merge(metrics_router);

	let mut run_set = JoinSet::new();
	let listener = tokio::net::TcpListener::bind(&admin_addr).await?;
	run_set.spawn(async move { axum::serve(listener, admin_app).await.map_err(anyhow::Error::from) });

	tokio::select! {
		_ = tokio::signal::ctrl_c() => {
			tracing::info!("received ctrl-c, shutting down");
		}
		Some(result) = run_set.join_next() => {
			result??;
		}
	}

	handle.shutdown().await;
	Ok(())
}
