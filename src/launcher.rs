use std::io;
use std::process::Stdio;

use tokio::process::{Child, Command};

/// External collaborator: launches a child process bound to a given port with
/// a serialized job configuration. The real backend executable and its wire
/// protocol are outside this proxy's concern; this trait is the seam the spec
/// names as "a handler to launch a child".
#[async_trait::async_trait]
pub trait Launcher: Send + Sync {
	async fn launch(
		&self,
		redis_address: &str,
		port: u16,
		fate_share: bool,
		server_type: &str,
		serialized_runtime_env: &[u8],
		session_dir: &str,
	) -> io::Result<Child>;

	/// One-shot probe of the cluster's session directory. Out of scope per
	/// the spec ("cluster bootstrap"); the default implementation derives a
	/// deterministic path instead of actually contacting a cluster.
	async fn probe_session_dir(&self, redis_address: &str) -> anyhow::Result<String> {
		Ok(format!("/tmp/clusterproxy/session-{}", redis_address.replace([':', '/'], "_")))
	}
}

/// External collaborator: introspects another process's command line. Used
/// to detect the shim-to-real-executable exec boundary (the startup fence).
pub trait CmdlineInspector: Send + Sync {
	fn cmdline(&self, pid: u32) -> Option<Vec<String>>;
}

/// Spawns the configured backend executable via `tokio::process::Command`.
/// Fate sharing is requested with `kill_on_drop` plus, on Linux, a
/// `PR_SET_PDEATHSIG` hook so the child dies if the proxy is killed
/// ungracefully.
pub struct ProcessLauncher {
	pub backend_exe: String,
}

impl ProcessLauncher {
	pub fn new(backend_exe: impl Into<String>) -> Self {
		Self {
			backend_exe: backend_exe.into(),
		}
	}
}

#[async_trait::async_trait]
impl Launcher for ProcessLauncher {
	async fn launch(
		&self,
		redis_address: &str,
		port: u16,
		fate_share: bool,
		server_type: &str,
		serialized_runtime_env: &[u8],
		session_dir: &str,
	) -> io::Result<Child> {
		use base64::Engine as _;
		let runtime_env = base64::engine::general_purpose::STANDARD.encode(serialized_runtime_env);

		let mut cmd = Command::new(&self.backend_exe);
		cmd.arg("--redis-address")
			.arg(redis_address)
			.arg("--port")
			.arg(port.to_string())
			.arg("--mode")
			.arg(server_type)
			.arg("--runtime-env")
			.arg(runtime_env)
			.arg("--session-dir")
			.arg(session_dir)
			.stdin(Stdio::null())
			.stdout(Stdio::null())
			.stderr(Stdio::null())
			.kill_on_drop(true);

		if fate_share {
			apply_fate_sharing(&mut cmd);
		}

		cmd.spawn()
	}
}

#[cfg(target_os = "linux")]
fn apply_fate_sharing(cmd: &mut Command) {
	use std::os::unix::process::CommandExt;
	// SAFETY: prctl(PR_SET_PDEATHSIG) only affects this process's own
	// death-signal delivery and is safe to call between fork and exec.
	unsafe {
		cmd.pre_exec(|| {
			let ret = libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL);
			if ret != 0 {
				return Err(io::Error::last_os_error());
			}
			Ok(())
		});
	}
}

#[cfg(not(target_os = "linux"))]
fn apply_fate_sharing(_cmd: &mut Command) {}

/// Probes whether `PR_SET_PDEATHSIG` is available on this platform. Only
/// meaningful on Linux; everywhere else fate sharing falls back to the
/// shutdown hook killing children on orderly exit.
pub fn detect_fate_sharing_support() -> bool {
	cfg!(target_os = "linux")
}

/// Reads `/proc/<pid>/cmdline` on Linux. Other platforms have no portable
/// equivalent, so the startup fence degenerates to "process is alive" there,
/// per the spec's explicit fallback.
pub struct ProcCmdlineInspector;

impl CmdlineInspector for ProcCmdlineInspector {
	#[cfg(target_os = "linux")]
	fn cmdline(&self, pid: u32) -> Option<Vec<String>> {
		let raw = std::fs::read(format!("/proc/{pid}/cmdline")).ok()?;
		let args = raw
			.split(|b| *b == 0)
			.filter(|s| !s.is_empty())
			.map(|s| String::from_utf8_lossy(s).into_owned())
			.collect::<Vec<_>>();
		Some(args)
	}

	#[cfg(not(target_os = "linux"))]
	fn cmdline(&self, _pid: u32) -> Option<Vec<String>> {
		None
	}
}
