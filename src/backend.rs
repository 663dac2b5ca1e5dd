use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::process::Child;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tonic::transport::Channel;
use tracing::warn;

use crate::error::ManagerError;

/// The outcome of a completed backend launch: the child's pid (for the
/// startup fence and the reaper), a lazily-connecting channel to it, and the
/// port it was bound to so it can be returned to the pool on exit.
pub struct LaunchedProcess {
	pub child: AsyncMutex<Child>,
	pub channel: Channel,
	pub port: u16,
	pub pid: u32,
	pub started_at: Instant,
}

/// One client's backend: a single-assignment future over a `LaunchedProcess`,
/// modeled with `watch` rather than `oneshot` because both the RPC path and
/// the reaper need to observe the current value repeatedly without consuming
/// it.
pub struct BackendRecord {
	pub client_id: String,
	state: watch::Sender<Option<Arc<LaunchedProcess>>>,
}

impl BackendRecord {
	pub fn new(client_id: String) -> (Arc<Self>, watch::Receiver<Option<Arc<LaunchedProcess>>>) {
		let (tx, rx) = watch::channel(None);
		(
			Arc::new(Self {
				client_id,
				state: tx,
			}),
			rx,
		)
	}

	/// Resolves the record's future. Must be called at most once; a second
	/// call indicates the manager started the same client twice concurrently
	/// without holding its record lock, which is a bug in the caller.
	pub fn resolve(&self, process: Arc<LaunchedProcess>) {
		if self.state.send(Some(process)).is_err() {
			warn!(client_id = %self.client_id, "no receivers left for resolved backend");
		}
	}

	/// Non-blocking peek at the current value, used by the reaper so it never
	/// blocks on a backend that is still starting.
	pub fn peek(&self) -> Option<Arc<LaunchedProcess>> {
		self.state.borrow().clone()
	}

	/// Waits for the launch to resolve, bounded by `timeout`. Mirrors the
	/// Python proxy's `grpc.channel_ready_future(...).result(timeout=10)`
	/// pattern but waits on the launch itself rather than channel readiness.
	pub async fn await_ready(&self, timeout: Duration) -> Result<Arc<LaunchedProcess>, ManagerError> {
		let mut rx = self.state.subscribe();
		if let Some(p) = rx.borrow().clone() {
			return Ok(p);
		}
		let wait = async {
			loop {
				if rx.changed().await.is_err() {
					return Err(ManagerError::BackendStartupFailed);
				}
				if let Some(p) = rx.borrow().clone() {
					return Ok(p);
				}
			}
		};
		match tokio::time::timeout(timeout, wait).await {
			Ok(result) => result,
			Err(_) => Err(ManagerError::BackendStartupFailed),
		}
	}
}
