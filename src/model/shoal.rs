use std::sync::Arc;

use shoal_rpc::system::System;
use shoal_util::config::Config;
use shoal_util::error::*;

use crate::manager::DatabaseManager;

/// An entire shoal node: the cluster membership system plus the local shard
/// of databases
pub struct Shoal {
	/// The parsed configuration this node is running
	pub config: Config,

	/// The membership manager
	pub system: Arc<System>,
	/// The database manager
	pub manager: Arc<DatabaseManager>,
}

impl Shoal {
	/// Create the node context from its configuration
	pub fn new(config: Config) -> Result<Arc<Self>, Error> {
		std::fs::create_dir_all(&config.data_dir)
			.err_context("Unable to create data directory")?;

		info!("Initialize membership management system...");
		let system = System::new(&config)?;

		info!("Initialize database manager...");
		let manager = DatabaseManager::new(config.data_dir.clone(), system.clone());

		Ok(Arc::new(Self {
			config,
			system,
			manager,
		}))
	}
}
