use std::sync::Arc;
use std::time::Duration;

use tonic::transport::Server;

use crate::config::ProxyConfig;
use crate::datapath::DataProxy;
use crate::driver::DriverProxy;
use crate::launcher::{detect_fate_sharing_support, CmdlineInspector, Launcher, ProcCmdlineInspector, ProcessLauncher};
use crate::logstream::LogProxy;
use crate::manager::ProxyManager;
use crate::proto::backend::v1::data_stream_server::DataStreamServer;
use crate::proto::backend::v1::driver_server::DriverServer;
use crate::proto::backend::v1::log_stream_server::LogStreamServer;

/// Assembles the three servicers behind one listening endpoint and owns the
/// manager they all share. Dropping (or calling [`ProxyHandle::shutdown`])
/// tears down the reaper and kills any live children.
pub struct ProxyHandle {
	pub manager: Arc<ProxyManager>,
	serve: tokio::task::JoinHandle<Result<(), tonic::transport::Error>>,
}

impl ProxyHandle {
	pub async fn shutdown(self) {
		self.manager.shutdown().await;
		self.serve.abort();
	}
}

/// Wires a [`ProxyManager`] using the default OS-process [`Launcher`] and
/// `/proc`-based [`CmdlineInspector`], starts its reaper, and serves
/// `Driver`, `DataStream`, and `LogStream` on `config.connection_str`.
pub async fn serve_proxier(config: ProxyConfig) -> anyhow::Result<ProxyHandle> {
	let launcher: Box<dyn Launcher> = Box::new(ProcessLauncher::new(config.backend_exe.clone()));
	let inspector: Box<dyn CmdlineInspector> = Box::new(ProcCmdlineInspector);

	let fate_share = config.fate_share && detect_fate_sharing_support();
	let manager = ProxyManager::new(
		config.redis_address.clone(),
		config.port_range.0..config.port_range.1,
		fate_share,
		launcher,
		inspector,
		config.session_dir.clone(),
		Duration::from_secs(config.check_process_interval_secs),
	);
	manager.spawn_reaper();

	let addr = config.connection_str.parse()?;
	let driver = DriverServer::new(DriverProxy::new(Arc::clone(&manager)));
	let data = DataStreamServer::new(DataProxy::new(Arc::clone(&manager)));
	let logs = LogStreamServer::new(LogProxy::new(Arc::clone(&manager)));

	let serve = tokio::spawn(
		Server::builder()
			.add_service(driver)
			.add_service(data)
			.add_service(logs)
			.serve(addr),
	);

	Ok(ProxyHandle { manager, serve })
}
