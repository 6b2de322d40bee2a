#![recursion_limit = "1024"]
//! Shoal daemon and CLI, used to run a node of the sharded SQL store and to
//! inspect a running cluster

#[macro_use]
extern crate tracing;

mod cli;
mod server;

use std::path::PathBuf;

use structopt::StructOpt;

use cli::*;

#[derive(StructOpt, Debug)]
#[structopt(
	name = "shoal",
	about = "Horizontally-sharded SQL store built on single-file SQLite databases"
)]
struct Opt {
	/// Host to connect to for admin operations, in the format:
	/// <public-key>@<ip>:<port>
	#[structopt(short = "h", long = "rpc-host", env = "SHOAL_RPC_HOST")]
	pub rpc_host: Option<String>,

	/// RPC secret network key, used to replace rpc_secret in config.toml
	/// when running the daemon or doing admin operations
	#[structopt(
		short = "s",
		long = "rpc-secret",
		env = "SHOAL_RPC_SECRET",
		hide_env_values = true
	)]
	pub rpc_secret: Option<String>,

	/// Path to configuration file
	#[structopt(
		short = "c",
		long = "config",
		env = "SHOAL_CONFIG_FILE",
		default_value = "/etc/shoal.toml"
	)]
	pub config_file: PathBuf,

	#[structopt(subcommand)]
	cmd: Command,
}

#[tokio::main]
async fn main() {
	// Initialize panic handler that aborts on panic and shows a nice message.
	// By default, Tokio continues running normally when a task panics. We want
	// to avoid this behavior in shoal as this would risk putting the process
	// in an unknown/uncontrollable state. We prefer to exit the process and
	// restart it from scratch, so that it boots back into a fresh, known state.
	std::panic::set_hook(Box::new(move |panic_info| {
		eprintln!("======== PANIC (internal shoal error) ========");
		eprintln!("{}", panic_info);
		eprintln!();
		eprintln!("BACKTRACE:");
		eprintln!("{:?}", backtrace::Backtrace::new());
		std::process::abort();
	}));

	// Parse arguments and dispatch command line
	let opt = Opt::from_args();

	// Initialize logging as well as other libraries used in shoal
	if std::env::var("RUST_LOG").is_err() {
		let default_log = match &opt.cmd {
			Command::Server(_) => "info,netapp=info",
			_ => "warn,netapp=warn",
		};
		std::env::set_var("RUST_LOG", default_log)
	}
	tracing_subscriber::fmt()
		.with_writer(std::io::stderr)
		.with_env_filter(tracing_subscriber::filter::EnvFilter::from_default_env())
		.init();
	sodiumoxide::init().expect("Unable to init sodiumoxide");

	let res = match opt.cmd {
		Command::Server(server_opt) => {
			server::run_server(opt.config_file, opt.rpc_secret, server_opt).await
		}
		Command::NodeId(node_id_opt) => node_id_command(opt.config_file, node_id_opt.quiet),
		_ => cli_command(opt).await,
	};

	if let Err(e) = res {
		eprintln!("Error: {}", e);
		std::process::exit(1);
	}
}
