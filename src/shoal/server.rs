use std::path::PathBuf;
use std::time::Duration;

use tokio::select;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;

use shoal_api::api_server::ApiServer;
use shoal_model::shoal::Shoal;
use shoal_util::config::*;
use shoal_util::error::*;

use crate::cli::ServerOpt;

pub async fn run_server(
	config_file: PathBuf,
	rpc_secret: Option<String>,
	opt: ServerOpt,
) -> Result<(), Error> {
	info!("Loading configuration...");
	let config = if config_file.exists() {
		read_config(config_file.clone()).err_context(format!(
			"Unable to read configuration file {}",
			config_file.to_string_lossy(),
		))?
	} else {
		info!(
			"No configuration file at {}, using defaults and command-line flags",
			config_file.to_string_lossy()
		);
		Config::default()
	};
	let config = fill_config(config, rpc_secret, opt)?;

	info!("Initializing node...");
	let shoal = Shoal::new(config)?;

	let (send_shutdown, watch_shutdown) = watch::channel(false);

	info!("Starting RPC listener and membership system...");
	let system_task = tokio::spawn(shoal.system.clone().run(watch_shutdown.clone()));

	info!("Bootstrapping cluster membership...");
	shoal.system.bootstrap().await?;

	info!("Starting HTTP API server...");
	let http_bind_addr = shoal.config.http_bind_addr;
	let mut api_task = tokio::spawn(ApiServer::run(
		shoal.clone(),
		http_bind_addr,
		watch_shutdown.clone(),
	));

	let res = select! {
		res = &mut api_task => {
			// The HTTP server stopped on its own: bind failure or fatal error
			let _ = send_shutdown.send(true);
			res.map_err(|e| Error::Message(format!("HTTP server task aborted: {}", e)))?
		}
		res = shutdown_signal() => {
			res?;
			let _ = send_shutdown.send(true);
			// drain in-flight requests before tearing the rest down
			api_task
				.await
				.map_err(|e| Error::Message(format!("HTTP server task aborted: {}", e)))?
		}
	};

	// Bounded wait for the membership system to close its connections
	if tokio::time::timeout(Duration::from_secs(5), system_task)
		.await
		.is_err()
	{
		warn!("Membership system did not shut down in time, exiting anyway");
	}

	info!("Shutdown complete");
	res
}

async fn shutdown_signal() -> Result<(), Error> {
	let mut sigint = signal(SignalKind::interrupt())?;
	let mut sigterm = signal(SignalKind::terminate())?;
	select! {
		_ = sigint.recv() => info!("Received SIGINT, shutting down."),
		_ = sigterm.recv() => info!("Received SIGTERM, shutting down."),
	}
	Ok(())
}

fn fill_config(
	mut config: Config,
	rpc_secret: Option<String>,
	opt: ServerOpt,
) -> Result<Config, Error> {
	if rpc_secret.is_some() {
		config.rpc_secret = rpc_secret;
	}
	if let Some(addr) = opt.http_address {
		config.http_bind_addr = addr;
	}
	if let Some(addr) = opt.rpc_address {
		config.rpc_bind_addr = addr;
	}
	if opt.rpc_public_address.is_some() {
		config.rpc_public_addr = opt.rpc_public_address;
	}
	if !opt.join.is_empty() {
		config.bootstrap_peers.extend(opt.join);
	}
	if opt.name.is_some() {
		config.node_name = opt.name;
	}
	if let Some(data_dir) = opt.data_dir {
		config.data_dir = data_dir;
	}
	if opt.username.is_some() {
		config.username = opt.username;
	}
	if opt.password.is_some() {
		config.password = opt.password;
	}

	if config.username.is_none() || config.password.is_none() {
		return Err(Error::Message(
			"API credentials are required: set username and password in the configuration file or pass --username/--password".to_string(),
		));
	}

	Ok(config)
}
