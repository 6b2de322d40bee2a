//! Contains type and functions related to shoal configuration file
use std::net::SocketAddr;
use std::path::PathBuf;

use serde::Deserialize;

use crate::error::Error;

/// Configuration of one shoal node, read from a TOML file and optionally
/// overridden by command-line flags.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
	/// Address the HTTP API listens on
	#[serde(default = "default_http_bind_addr")]
	pub http_bind_addr: SocketAddr,

	/// Address the intra-cluster RPC listener binds to
	#[serde(default = "default_rpc_bind_addr")]
	pub rpc_bind_addr: SocketAddr,
	/// Address other cluster members reach this node at. This is the node's
	/// ring identity; autodetected from the first non-loopback interface
	/// when unset.
	pub rpc_public_addr: Option<String>,
	/// Shared secret authenticating intra-cluster connections (32 bytes, hex)
	pub rpc_secret: Option<String>,
	/// Timeout for intra-cluster RPC calls, in milliseconds
	pub rpc_timeout_msec: Option<u64>,
	/// Ping timeout of the peering layer, in milliseconds
	pub rpc_ping_timeout_msec: Option<u64>,

	/// Peers to connect to on boot, in `<pubkey>@host:port` form
	#[serde(default)]
	pub bootstrap_peers: Vec<String>,
	/// Label of this node in status outputs (defaults to the hostname)
	pub node_name: Option<String>,

	/// Directory where database files and the node key are kept
	#[serde(default = "default_data_dir")]
	pub data_dir: PathBuf,

	/// BasicAuth username required by the HTTP API
	pub username: Option<String>,
	/// BasicAuth password required by the HTTP API
	pub password: Option<String>,
}

impl Default for Config {
	fn default() -> Self {
		Self {
			http_bind_addr: default_http_bind_addr(),
			rpc_bind_addr: default_rpc_bind_addr(),
			rpc_public_addr: None,
			rpc_secret: None,
			rpc_timeout_msec: None,
			rpc_ping_timeout_msec: None,
			bootstrap_peers: vec![],
			node_name: None,
			data_dir: default_data_dir(),
			username: None,
			password: None,
		}
	}
}

fn default_http_bind_addr() -> SocketAddr {
	SocketAddr::from(([0, 0, 0, 0], 7000))
}

fn default_rpc_bind_addr() -> SocketAddr {
	SocketAddr::from(([0, 0, 0, 0], 7070))
}

fn default_data_dir() -> PathBuf {
	std::env::var_os("XDG_DATA_HOME")
		.map(PathBuf::from)
		.or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".local/share")))
		.unwrap_or_else(|| PathBuf::from("."))
		.join("shoal")
}

/// Read and parse the configuration file
pub fn read_config(config_file: PathBuf) -> Result<Config, Error> {
	let config = std::fs::read_to_string(config_file)?;
	Ok(toml::from_str(&config)?)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_parse_config() {
		let config: Config = toml::from_str(
			r#"
			rpc_bind_addr = "0.0.0.0:3901"
			rpc_public_addr = "10.0.0.1:3901"
			rpc_secret = "1799bccfd7411eddcf9ebd316bc1f5287ad12a68094e1c6ac6abde7e6feae1ec"
			bootstrap_peers = []
			data_dir = "/tmp/shoal-data"
			username = "admin"
			password = "hunter2"
			"#,
		)
		.unwrap();
		assert_eq!(config.rpc_bind_addr.port(), 3901);
		assert_eq!(config.http_bind_addr.port(), 7000);
		assert_eq!(config.username.as_deref(), Some("admin"));
	}

	#[test]
	fn test_unknown_fields_are_rejected() {
		assert!(toml::from_str::<Config>("not_a_field = 1").is_err());
	}
}
