use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use structopt::StructOpt;

use netapp::util::parse_and_resolve_peer_addr;
use netapp::{NetApp, NetworkKey};

use shoal_rpc::system::*;
use shoal_rpc::*;

use shoal_util::config::read_config;
use shoal_util::error::*;

#[derive(StructOpt, Debug)]
pub enum Command {
	/// Run the shoal node daemon
	#[structopt(name = "server")]
	Server(ServerOpt),

	/// Print this node's id, in the format expected by --join and
	/// bootstrap_peers
	#[structopt(name = "node-id")]
	NodeId(NodeIdOpt),

	/// Show the status of the cluster this node belongs to
	#[structopt(name = "status")]
	Status,

	/// Ask a running node to connect to a peer
	#[structopt(name = "connect")]
	Connect(ConnectOpt),
}

#[derive(StructOpt, Debug)]
pub struct ServerOpt {
	/// Address the HTTP API listens on
	#[structopt(long = "http-address")]
	pub http_address: Option<SocketAddr>,

	/// Address the RPC listener binds to; also advertised to the cluster
	/// when --rpc-public-address is not given
	#[structopt(long = "rpc-address")]
	pub rpc_address: Option<SocketAddr>,

	/// Address other cluster members reach this node at; this is the node's
	/// ring identity
	#[structopt(long = "rpc-public-address")]
	pub rpc_public_address: Option<String>,

	/// Peer to connect to on boot, in <pubkey>@host:port format; may be
	/// given multiple times
	#[structopt(long = "join")]
	pub join: Vec<String>,

	/// Label of this node in status outputs (defaults to the hostname)
	#[structopt(long = "name")]
	pub name: Option<String>,

	/// Directory where database files and the node key are kept
	#[structopt(long = "data-dir")]
	pub data_dir: Option<PathBuf>,

	/// Username required by the HTTP API (BasicAuth)
	#[structopt(long = "username", env = "SHOAL_USERNAME")]
	pub username: Option<String>,

	/// Password required by the HTTP API (BasicAuth)
	#[structopt(long = "password", env = "SHOAL_PASSWORD", hide_env_values = true)]
	pub password: Option<String>,
}

#[derive(StructOpt, Debug)]
pub struct NodeIdOpt {
	/// Print only the node id instead of the full <id>@<addr> string
	#[structopt(short = "q", long = "quiet")]
	pub quiet: bool,
}

#[derive(StructOpt, Debug)]
pub struct ConnectOpt {
	/// Peer to connect to, in <pubkey>@host:port format
	pub node: String,
}

pub fn node_id_command(config_file: PathBuf, quiet: bool) -> Result<(), Error> {
	let config = read_config(config_file.clone()).err_context(format!(
		"Unable to read configuration file {}",
		config_file.to_string_lossy(),
	))?;

	let node_id = read_node_id(&config.data_dir)?;

	let idstr = if let Some(addr) = &config.rpc_public_addr {
		let idstr = format!("{}@{}", hex::encode(&node_id), addr);
		println!("{}", idstr);
		idstr
	} else {
		let idstr = hex::encode(&node_id);
		println!("{}", idstr);
		if !quiet {
			eprintln!("WARNING: I don't know the public address to reach this node.");
			eprintln!("In all of the instructions below, replace 127.0.0.1:7070 by the appropriate address and port.");
		}
		format!("{}@127.0.0.1:7070", idstr)
	};

	if !quiet {
		eprintln!();
		eprintln!("To join the cluster this node is in, start the other nodes with:");
		eprintln!("    shoal server --join {}", idstr);
		eprintln!("or add this string to their bootstrap_peers configuration list.");
	}

	Ok(())
}

pub async fn cli_command(opt: crate::Opt) -> Result<(), Error> {
	let config = if opt.rpc_secret.is_none() || opt.rpc_host.is_none() {
		Some(read_config(opt.config_file.clone()).err_context(format!(
			"Unable to read configuration file {}. Configuration file is needed because -h or -s is not provided on the command line.",
			opt.config_file.to_string_lossy(),
		))?)
	} else {
		None
	};

	// Find and parse network RPC secret
	let net_key_hex_str = opt
		.rpc_secret
		.as_ref()
		.or_else(|| config.as_ref().and_then(|c| c.rpc_secret.as_ref()))
		.ok_or("No RPC secret provided")?;
	let network_key = NetworkKey::from_slice(
		&hex::decode(net_key_hex_str).err_context("Invalid RPC secret key (bad hex)")?[..],
	)
	.ok_or("Invalid RPC secret provided (wrong length)")?;

	// Generate a temporary keypair for our RPC client
	let (_pk, sk) = sodiumoxide::crypto::sign::ed25519::gen_keypair();

	let netapp = NetApp::new(SHOAL_VERSION_TAG, network_key, sk);

	// Find and parse the address of the target host
	let (id, addr) = if let Some(h) = opt.rpc_host {
		let (id, addrs) = parse_and_resolve_peer_addr(&h).ok_or_else(|| format!("Invalid RPC remote node identifier: {}. Expected format is <pubkey>@<IP or hostname>:<port>.", h))?;
		(id, addrs[0])
	} else {
		let config = config
			.as_ref()
			.ok_or_message("No configuration file available")?;
		let node_id = read_node_id(&config.data_dir)?;
		let addr = match &config.rpc_public_addr {
			Some(a) => {
				use std::net::ToSocketAddrs;
				a.to_socket_addrs()
					.ok_or_message("unable to resolve rpc_public_addr specified in config file")?
					.next()
					.ok_or_message("unable to resolve rpc_public_addr specified in config file")?
			}
			None => SocketAddr::from(([127, 0, 0, 1], config.rpc_bind_addr.port())),
		};
		(node_id, addr)
	};

	// Connect to target host
	netapp.clone().try_connect(addr, id).await.err_context(
		"Unable to connect to destination RPC host. Check that you are using the same value of rpc_secret as it does.",
	)?;

	let system_rpc_endpoint = netapp.endpoint::<SystemRpc, ()>(SYSTEM_RPC_PATH.into());
	match opt.cmd {
		Command::Status => cmd_status(&system_rpc_endpoint, id).await,
		Command::Connect(connect_opt) => {
			cmd_connect(&system_rpc_endpoint, id, connect_opt).await
		}
		_ => unreachable!(),
	}
}

pub async fn cmd_status(rpc_cli: &Endpoint<SystemRpc, ()>, rpc_host: NodeID) -> Result<(), Error> {
	let nodes = match rpc_cli
		.call(&rpc_host, SystemRpc::GetKnownNodes, PRIO_NORMAL)
		.await??
	{
		SystemRpc::ReturnKnownNodes(nodes) => nodes,
		resp => return Err(Error::unexpected_rpc_message(resp)),
	};

	println!("==== HEALTHY NODES ====");
	let mut healthy_nodes = vec!["ID\tHostname\tAddress\tMember".to_string()];
	for adv in nodes.iter().filter(|adv| adv.is_up) {
		healthy_nodes.push(format!(
			"{:?}\t{}\t{}\t{}",
			adv.id, adv.status.hostname, adv.addr, adv.status.rpc_public_addr,
		));
	}
	format_table(healthy_nodes);

	let failed: Vec<_> = nodes.iter().filter(|adv| !adv.is_up).collect();
	if !failed.is_empty() {
		println!();
		println!("==== FAILED NODES ====");
		let mut failed_nodes =
			vec!["ID\tHostname\tAddress\tMember\tLast seen".to_string()];
		let tf = timeago::Formatter::new();
		for adv in failed {
			let last_seen = adv
				.last_seen_secs_ago
				.map(|s| tf.convert(Duration::from_secs(s)))
				.unwrap_or_else(|| "never seen".to_string());
			failed_nodes.push(format!(
				"{:?}\t{}\t{}\t{}\t{}",
				adv.id, adv.status.hostname, adv.addr, adv.status.rpc_public_addr, last_seen,
			));
		}
		format_table(failed_nodes);
	}

	Ok(())
}

pub async fn cmd_connect(
	rpc_cli: &Endpoint<SystemRpc, ()>,
	rpc_host: NodeID,
	args: ConnectOpt,
) -> Result<(), Error> {
	match rpc_cli
		.call(&rpc_host, SystemRpc::Connect(args.node), PRIO_NORMAL)
		.await??
	{
		SystemRpc::Ok => {
			println!("Success.");
			Ok(())
		}
		m => Err(Error::unexpected_rpc_message(m)),
	}
}

/// Align tab-separated lines into columns
fn format_table(lines: Vec<String>) {
	let rows: Vec<Vec<&str>> = lines.iter().map(|l| l.split('\t').collect()).collect();
	let columns = rows.iter().map(|r| r.len()).max().unwrap_or(0);
	let mut widths = vec![0; columns];
	for row in rows.iter() {
		for (i, cell) in row.iter().enumerate() {
			widths[i] = widths[i].max(cell.chars().count());
		}
	}
	for row in rows.iter() {
		let mut line = String::new();
		for (i, cell) in row.iter().enumerate() {
			line.push_str(cell);
			if i + 1 < row.len() {
				for _ in 0..(widths[i] - cell.chars().count() + 2) {
					line.push(' ');
				}
			}
		}
		println!("{}", line.trim_end());
	}
}
