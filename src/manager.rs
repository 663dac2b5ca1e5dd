use std::collections::HashMap;
use std::ops::Range;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tower::Service;
use tracing::{info, instrument, warn};

use crate::backend::{BackendRecord, LaunchedProcess};
use crate::error::ManagerError;
use crate::launcher::{CmdlineInspector, Launcher};
use crate::ports::PortPool;

const CHANNEL_READY_TIMEOUT: Duration = Duration::from_secs(10);
const STARTUP_POLL_INTERVAL: Duration = Duration::from_millis(500);
const STARTUP_POLL_BUDGET: Duration = Duration::from_secs(30);
const SHUTDOWN_KILL_BUDGET: Duration = Duration::from_millis(100);

/// Tracks one backend process per client_id and brokers access to its gRPC
/// channel. This is the proxy's central piece of mutable state.
///
/// The original design this is translated from used one reentrant lock
/// shared by the port allocator and the records map, since a single thread
/// could need both while starting a backend. Rust's `std::sync::Mutex` isn't
/// reentrant, so the two pieces of state get their own independent,
/// non-reentrant locks instead (`PortPool`'s internal lock, and `records`
/// here); no code path ever needs to hold both at once.
pub struct ProxyManager {
	records: Mutex<HashMap<String, Arc<BackendRecord>>>,
	ports: PortPool,
	launcher: Box<dyn Launcher>,
	inspector: Box<dyn CmdlineInspector>,
	redis_address: String,
	fate_share: bool,
	session_dir: OnceCell<String>,
	reap_interval: Duration,
	shutdown: CancellationToken,
}

impl ProxyManager {
	/// `session_dir` pre-seeds the memoized probe when the config carries a
	/// preset value; `reap_interval` is the reaper sweep period.
	pub fn new(
		redis_address: String,
		port_range: Range<u16>,
		fate_share: bool,
		launcher: Box<dyn Launcher>,
		inspector: Box<dyn CmdlineInspector>,
		session_dir: Option<String>,
		reap_interval: Duration,
	) -> Arc<Self> {
		Arc::new(Self {
			records: Mutex::new(HashMap::new()),
			ports: PortPool::new(port_range),
			launcher,
			inspector,
			redis_address,
			fate_share,
			session_dir: OnceCell::new_with(session_dir),
			reap_interval,
			shutdown: CancellationToken::new(),
		})
	}

	/// Spawns the background reaper task. The returned handle is detached;
	/// shutdown is driven by the manager's own `CancellationToken`.
	pub fn spawn_reaper(self: &Arc<Self>) {
		let this = Arc::clone(self);
        tokio::spawn(async move {
			this.reap_loop().await;
		});
	}

	async fn reap_loop(&self) {
		let mut tick = tokio::time::interval(self.reap_interval);
		loop {
			tokio::select! {
				_ = self.shutdown.cancelled() => {
					info!("reaper shutting down");
					return;
				}
				_ = tick.tick() => {
					self.reap_once().await;
				}
			}
		}
	}

	/// One reaper pass: drop records whose child has exited, returning their
	/// port to the pool. Uses `peek` rather than `await_ready` so a backend
	/// still starting up is never mistaken for a dead one.
	async fn reap_once(&self) {
		let candidates: Vec<(String, Arc<BackendRecord>)> = {
			let records = self.records.lock().unwrap();
			records.iter().map(|(k, v)| (k.clone(), Arc::clone(v))).collect()
		};

		for (client_id, record) in candidates {
			let Some(process) = record.peek() else {
				continue;
			};
			let exited = {
				let mut child = process.child.lock().await;
				matches!(child.try_wait(), Ok(Some(_)))
			};
			if exited {
				info!(client_id = %client_id, port = process.port, "reaping exited backend");
				self.records.lock().unwrap().remove(&client_id);
				self.ports.release(process.port);
			}
		}
	}

	/// Always starts a fresh backend for `client_id`, replacing any prior
	/// record, and waits for it to cross the startup fence. Failures here are
	/// spawn failures and surface as `Aborted`; they leave no dangling record
	/// (the reaper would find it dead on the next sweep regardless).
	#[instrument(skip(self, serialized_runtime_env), fields(client_id = %client_id))]
	pub async fn start_backend(
		self: &Arc<Self>,
		client_id: &str,
		server_type: &str,
		serialized_runtime_env: &[u8],
	) -> Result<(), ManagerError> {
		let record = self.get_or_start(client_id, server_type, serialized_runtime_env).await?;
		record.await_ready(STARTUP_POLL_BUDGET).await?;
		Ok(())
	}

	/// Looks up the already-started backend for `client_id` and returns a
	/// channel to it, bounded by the same readiness timeout the original
	/// used for `grpc.channel_ready_future(...).result(timeout=10)`. Does
	/// *not* start a backend that doesn't exist yet.
	#[instrument(skip(self), fields(client_id = %client_id))]
	pub async fn get_channel(&self, client_id: &str) -> Result<Channel, ManagerError> {
		let record = self
			.records
			.lock()
			.unwrap()
			.get(client_id)
			.cloned()
			.ok_or(ManagerError::NoBackend)?;
		let process = record.await_ready(STARTUP_POLL_BUDGET).await.map_err(|_| ManagerError::NoBackend)?;

		let mut channel = process.channel.clone();
		match tokio::time::timeout(CHANNEL_READY_TIMEOUT, Service::ready(&mut channel)).await {
			Ok(Ok(_)) => Ok(process.channel.clone()),
			Ok(Err(_)) | Err(_) => Err(ManagerError::NoBackend),
		}
	}

	/// A prior record for `client_id`, if any, is unconditionally overwritten:
	/// callers must not invoke this twice concurrently for the same id
	/// (`DataProxy` serializes start_backend per stream), so there is no
	/// dedup race to guard against here. A record left behind by a backend
	/// that died but hasn't been reaped yet must never be handed back to a
	/// reconnecting client — it would just time out waiting on a dead
	/// channel instead of getting a real backend.
	async fn get_or_start(
		self: &Arc<Self>,
		client_id: &str,
		server_type: &str,
		serialized_runtime_env: &[u8],
	) -> Result<Arc<BackendRecord>, ManagerError> {
		let (record, _rx) = BackendRecord::new(client_id.to_string());
		let previous = self.records.lock().unwrap().insert(client_id.to_string(), Arc::clone(&record));
		if let Some(previous) = previous {
			self.retire(previous);
		}

		let session_dir = match self.session_dir(&self.redis_address).await {
			Ok(dir) => dir,
			Err(err) => {
				self.records.lock().unwrap().remove(client_id);
				return Err(err);
			}
		};
		let port = match self.ports.acquire() {
			Ok(port) => port,
			Err(err) => {
				self.records.lock().unwrap().remove(client_id);
				return Err(err);
			}
		};

		let launch_result = self
			.launcher
			.launch(
				&self.redis_address,
				port,
				self.fate_share,
				server_type,
				serialized_runtime_env,
				&session_dir,
			)
			.await;

		let mut child = match launch_result {
			Ok(child) => child,
			Err(err) => {
				warn!(client_id = %client_id, %err, "backend spawn failed");
				self.ports.release(port);
				self.records.lock().unwrap().remove(client_id);
				return Err(ManagerError::BackendStartupFailed);
			}
		};

		let pid = match child.id() {
			Some(pid) => pid,
			None => {
				self.ports.release(port);
				self.records.lock().unwrap().remove(client_id);
				return Err(ManagerError::BackendStartupFailed);
			}
		};

		if !self.wait_for_startup_fence(pid, &mut child).await {
			let _ = child.start_kill();
			self.ports.release(port);
			self.records.lock().unwrap().remove(client_id);
			return Err(ManagerError::BackendStartupFailed);
		}

		let channel = Channel::from_shared(format!("http://127.0.0.1:{port}"))
			.map_err(|_| ManagerError::BackendStartupFailed)?
			.connect_lazy();

		let process = Arc::new(LaunchedProcess {
			child: tokio::sync::Mutex::new(child),
			channel,
			port,
			pid,
			started_at: std::time::Instant::now(),
		});
		record.resolve(process);
		Ok(record)
	}

	/// Reclaims the port and kills the process of a record just displaced by
	/// an overwrite. Once it's out of the map the reaper will never see it
	/// again, so this is the only chance to reclaim it — including when the
	/// displaced record is still mid-spawn, in which case this waits for it
	/// to resolve before cleaning up. Runs detached so an overwrite never
	/// blocks on a slow-starting previous backend.
	fn retire(self: &Arc<Self>, record: Arc<BackendRecord>) {
		let this = Arc::clone(self);
		tokio::spawn(async move {
			if let Ok(process) = record.await_ready(STARTUP_POLL_BUDGET).await {
				let mut child = process.child.lock().await;
				let _ = child.start_kill();
				this.ports.release(process.port);
			}
		});
	}

	/// Polls the child's cmdline until it looks like the real backend
	/// executable rather than a launcher shim, or until the child exits, or
	/// until the startup budget elapses.
	async fn wait_for_startup_fence(&self, pid: u32, child: &mut tokio::process::Child) -> bool {
		let deadline = tokio::time::Instant::now() + STARTUP_POLL_BUDGET;
		loop {
			if let Ok(Some(_)) = child.try_wait() {
				return false;
			}
			if let Some(cmdline) = self.inspector.cmdline(pid) {
				if cmdline.is_empty() {
					// platform without /proc: treat "still alive" as ready.
					return true;
				}
				if cmdline.iter().any(|arg| arg.contains("--mode")) {
					return true;
				}
			} else {
				return true;
			}
			if tokio::time::Instant::now() >= deadline {
				return false;
			}
			tokio::time::sleep(STARTUP_POLL_INTERVAL).await;
		}
	}

	/// Memoized probe of the cluster session directory; resolved once per
	/// manager lifetime and shared by every client.
	async fn session_dir(&self, redis_address: &str) -> Result<String, ManagerError> {
		self.session_dir
			.get_or_try_init(|| async { self.launcher.probe_session_dir(redis_address).await })
			.await
			.map(|s| s.clone())
			.map_err(|_| ManagerError::BackendStartupFailed)
	}

	pub fn backend_count(&self) -> usize {
		self.records.lock().unwrap().len()
	}

	pub fn free_ports(&self) -> usize {
		self.ports.free_count()
	}

	pub fn total_ports(&self) -> usize {
		self.ports.total()
	}

	pub fn list_client_ids(&self) -> Vec<String> {
		self.records.lock().unwrap().keys().cloned().collect()
	}

	/// Orderly shutdown: stop the reaper, then kill every live child with a
	/// short budget rather than waiting indefinitely on a possibly-wedged
	/// backend.
	pub async fn shutdown(&self) {
		self.shutdown.cancel();
		let processes: Vec<Arc<LaunchedProcess>> = {
			let records = self.records.lock().unwrap();
			records.values().filter_map(|r| r.peek()).collect()
		};
		for process in processes {
			let mut child = process.child.lock().await;
			let _ = child.start_kill();
			let _ = tokio::time::timeout(SHUTDOWN_KILL_BUDGET, child.wait()).await;
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use async_trait::async_trait;
	use std::io;
	use std::sync::atomic::{AtomicUsize, Ordering};

	struct FakeLauncher {
		launches: AtomicUsize,
	}

	#[async_trait]
	impl Launcher for FakeLauncher {
		async fn launch(
			&self,
			_redis_address: &str,
			_port: u16,
			_fate_share: bool,
			_server_type: &str,
			_serialized_runtime_env: &[u8],
			_session_dir: &str,
		) -> io::Result<tokio::process::Child> {
			self.launches.fetch_add(1, Ordering::SeqCst);
			tokio::process::Command::new("sleep").arg("5").spawn()
		}
	}

	struct AlwaysReadyInspector;
	impl CmdlineInspector for AlwaysReadyInspector {
		fn cmdline(&self, _pid: u32) -> Option<Vec<String>> {
			Some(vec!["backend".to_string(), "--mode".to_string()])
		}
	}

	fn test_manager() -> Arc<ProxyManager> {
		ProxyManager::new(
			"127.0.0.1:6379".to_string(),
			23100..23110,
			false,
			Box::new(FakeLauncher {
				launches: AtomicUsize::new(0),
			}),
			Box::new(AlwaysReadyInspector),
			None,
			Duration::from_secs(30),
		)
	}

	#[tokio::test]
	async fn repeated_start_for_same_client_replaces_the_prior_record() {
		let manager = test_manager();
		let first = manager.get_or_start("client-x", "worker", b"").await.unwrap();
		let first_port = first.peek().unwrap().port;

		let second = manager.get_or_start("client-x", "worker", b"").await.unwrap();
		let second_port = second.peek().unwrap().port;

		assert!(
			!Arc::ptr_eq(&first, &second),
			"a fresh start must install a new record, not hand back the old one"
		);
		assert_ne!(first_port, second_port, "the old backend's port must be reclaimed, not stuck to the dead record");
		assert_eq!(manager.backend_count(), 1, "the stale record is replaced, not kept alongside the new one");

		// Retirement of the displaced record runs detached (so an overwrite
		// never blocks on a slow-starting previous backend), so give it a
		// moment to finish before checking the pool settles back to one port
		// in use.
		tokio::time::sleep(Duration::from_millis(50)).await;
		assert_eq!(manager.free_ports(), manager.total_ports() - 1, "exactly one port is in use; the retired one came back");
	}

	#[tokio::test]
	async fn port_exhaustion_does_not_leave_a_dangling_record() {
		let manager = ProxyManager::new(
			"127.0.0.1:6379".to_string(),
			23120..23120, // empty range
			false,
			Box::new(FakeLauncher {
				launches: AtomicUsize::new(0),
			}),
			Box::new(AlwaysReadyInspector),
			None,
			Duration::from_secs(30),
		);
		let err = manager.get_or_start("client-z", "worker", b"").await.unwrap_err();
		assert!(matches!(err, ManagerError::PortExhausted));
		assert_eq!(manager.backend_count(), 0, "a client that never got a port must not occupy a map slot");

		// A retry for the same client_id must be able to start fresh rather
		// than being wedged behind a permanently-unresolved placeholder.
		let err = manager.get_or_start("client-z", "worker", b"").await.unwrap_err();
		assert!(matches!(err, ManagerError::PortExhausted));
		assert_eq!(manager.backend_count(), 0);
	}

	#[tokio::test]
	async fn shutdown_kills_live_children() {
		let manager = test_manager();
		manager.get_or_start("client-y", "worker", b"").await.unwrap();
		assert_eq!(manager.free_ports(), manager.total_ports() - 1);
		manager.shutdown().await;
	}
}
