use serde::{Deserialize, Serialize};

fn default_port_range() -> (u16, u16) {
	(23000, 24000)
}

fn default_check_process_interval_secs() -> u64 {
	30
}

fn default_admin_addr() -> String {
	"0.0.0.0:19000".to_string()
}

/// Proxy-wide configuration. Loaded from a JSON file or inline JSON via
/// `clap`'s `Args`, matching every field the original exposed as `serve_proxier`
/// parameters plus the admin/metrics listen address this build adds.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfig {
	/// Address the proxy's own RPC server listens on, e.g. `0.0.0.0:10001`.
	pub connection_str: String,

	/// Address forwarded to every spawned backend so it can reach the cluster.
	pub redis_address: String,

	/// Preset session directory. When absent, the manager probes it lazily
	/// on first use and memoizes the result.
	#[serde(default)]
	pub session_dir: Option<String>,

	/// Admin/metrics HTTP listen address.
	#[serde(default = "default_admin_addr")]
	pub admin_addr: String,

	/// Half-open `[min, max)` ephemeral port range handed out to backends.
	#[serde(default = "default_port_range")]
	pub port_range: (u16, u16),

	/// Reaper sweep interval.
	#[serde(default = "default_check_process_interval_secs")]
	pub check_process_interval_secs: u64,

	/// Path to the backend executable the launcher spawns.
	pub backend_exe: String,

	/// Whether to request OS-level fate sharing for spawned children.
	#[serde(default)]
	pub fate_share: bool,
}

#[derive(clap::Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
	/// Inline JSON configuration.
	#[arg(short, long, value_name = "config")]
	pub config: Option<bytes::Bytes>,

	/// Path to a JSON configuration file.
	#[arg(short, long, value_name = "file")]
	pub file: Option<std::path::PathBuf>,
}

impl Args {
	pub async fn load(self) -> anyhow::Result<ProxyConfig> {
		match (self.file, self.config) {
			(Some(path), None) => {
				let contents = tokio::fs::read_to_string(path).await?;
				Ok(serde_json::from_str(&contents)?)
			}
			(None, Some(config)) => {
				let text = std::str::from_utf8(&config)?;
				Ok(serde_json::from_str(text)?)
			}
			(Some(_), Some(_)) => anyhow::bail!("both --file and --config cannot be provided"),
			(None, None) => anyhow::bail!("either --file or --config must be provided"),
		}
	}
}
