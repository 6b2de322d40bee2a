use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use netapp::endpoint::{Endpoint, EndpointHandler};
use netapp::message::*;
use netapp::NodeID;

use shoal_db::{check_name, Argument, Store};
use shoal_rpc::rpc_helper::*;
use shoal_rpc::system::System;
use shoal_util::data::Uuid;
use shoal_util::error::*;

/// RPC endpoint served by every node for database operations
pub const MANAGER_RPC_PATH: &str = "shoal_model/manager.rs/DatabaseRpc";

/// RPC messages used to run database operations on their owning node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DatabaseRpc {
	/// Create a database, optionally running a DDL migration in the same
	/// transaction
	Create {
		name: String,
		migration: Option<String>,
	},
	/// Remove a database; removing an absent database is a no-op
	Drop { name: String },
	/// Check that a database exists
	Get { name: String },
	/// Run a read query with positional arguments
	Query {
		name: String,
		query: String,
		args: Vec<Argument>,
	},
	/// Run a write statement with positional arguments
	Exec {
		name: String,
		query: String,
		args: Vec<Argument>,
	},
	/// List the databases stored on the answering node
	ListDatabases,

	/// Response to a DDL operation
	Msg(String),
	/// Response to Query: the fully materialized JSON array of rows
	QueryResult(#[serde(with = "serde_bytes")] Vec<u8>),
	/// Response to Exec: number of rows affected
	ExecResult(i64),
	/// Response to ListDatabases
	DatabaseList(Vec<String>),
}

impl Message for DatabaseRpc {
	type Response = Result<DatabaseRpc, Error>;
}

/// Where the owner of a database lives, relative to this node
enum Owner {
	Local,
	Remote(Uuid),
}

/// The database manager: runs operations against the local shard, and
/// forwards the others to the node the ring designates as their owner.
/// Stateless across requests, so it can serve any number of them
/// concurrently.
pub struct DatabaseManager {
	store: Store,
	system: Arc<System>,
	endpoint: Arc<Endpoint<DatabaseRpc, Self>>,

	// Node-scoped lock serializing create and drop: concurrent calls on the
	// same name must not interleave between the existence check and the
	// file creation or removal.
	mutation_lock: Mutex<()>,
}

impl DatabaseManager {
	pub fn new(data_dir: PathBuf, system: Arc<System>) -> Arc<Self> {
		let endpoint = system.netapp.endpoint(MANAGER_RPC_PATH.into());
		let manager = Arc::new(Self {
			store: Store::new(data_dir),
			system,
			endpoint,
			mutation_lock: Mutex::new(()),
		});
		manager.endpoint.set_handler(manager.clone());
		manager
	}

	// ---- Public interface: every operation is dispatched to the owner of
	//      the database it targets ----

	pub async fn create(&self, name: &str, migration: Option<String>) -> Result<String, Error> {
		match self.locate_owner(name)? {
			Owner::Local => self.create_local(name.to_string(), migration).await,
			Owner::Remote(node) => {
				let rpc = DatabaseRpc::Create {
					name: name.to_string(),
					migration,
				};
				match self.remote(node, rpc).await? {
					DatabaseRpc::Msg(msg) => Ok(msg),
					resp => Err(Error::unexpected_rpc_message(resp)),
				}
			}
		}
	}

	pub async fn drop(&self, name: &str) -> Result<String, Error> {
		match self.locate_owner(name)? {
			Owner::Local => self.drop_local(name.to_string()).await,
			Owner::Remote(node) => {
				let rpc = DatabaseRpc::Drop {
					name: name.to_string(),
				};
				match self.remote(node, rpc).await? {
					DatabaseRpc::Msg(msg) => Ok(msg),
					resp => Err(Error::unexpected_rpc_message(resp)),
				}
			}
		}
	}

	pub async fn get(&self, name: &str) -> Result<String, Error> {
		match self.locate_owner(name)? {
			Owner::Local => self.get_local(name.to_string()).await,
			Owner::Remote(node) => {
				let rpc = DatabaseRpc::Get {
					name: name.to_string(),
				};
				match self.remote(node, rpc).await? {
					DatabaseRpc::Msg(msg) => Ok(msg),
					resp => Err(Error::unexpected_rpc_message(resp)),
				}
			}
		}
	}

	pub async fn query(
		&self,
		name: &str,
		query: &str,
		args: Vec<Argument>,
	) -> Result<Vec<u8>, Error> {
		match self.locate_owner(name)? {
			Owner::Local => {
				self.query_local(name.to_string(), query.to_string(), args)
					.await
			}
			Owner::Remote(node) => {
				let rpc = DatabaseRpc::Query {
					name: name.to_string(),
					query: query.to_string(),
					args,
				};
				match self.remote(node, rpc).await? {
					DatabaseRpc::QueryResult(result) => Ok(result),
					resp => Err(Error::unexpected_rpc_message(resp)),
				}
			}
		}
	}

	pub async fn exec(&self, name: &str, query: &str, args: Vec<Argument>) -> Result<i64, Error> {
		match self.locate_owner(name)? {
			Owner::Local => {
				self.exec_local(name.to_string(), query.to_string(), args)
					.await
			}
			Owner::Remote(node) => {
				let rpc = DatabaseRpc::Exec {
					name: name.to_string(),
					query: query.to_string(),
					args,
				};
				match self.remote(node, rpc).await? {
					DatabaseRpc::ExecResult(n) => Ok(n),
					resp => Err(Error::unexpected_rpc_message(resp)),
				}
			}
		}
	}

	/// List databases across the whole cluster. Members that cannot be
	/// reached are skipped: listing is best-effort by nature.
	pub async fn list_all(&self) -> Result<Vec<String>, Error> {
		let members: Vec<String> = self
			.system
			.ring
			.borrow()
			.members()
			.iter()
			.cloned()
			.collect();
		let local_member = self.system.local_member();
		let mut names = vec![];
		for member in members {
			if member == local_member {
				names.extend(self.list_local().await?);
				continue;
			}
			let node = match self.system.node_id_for_member(&member) {
				Some(node) => node,
				None => continue,
			};
			match self.remote(node, DatabaseRpc::ListDatabases).await {
				Ok(DatabaseRpc::DatabaseList(list)) => names.extend(list),
				Ok(resp) => warn!("Unexpected answer to ListDatabases: {:?}", resp),
				Err(e) => warn!("Could not list databases of {}: {}", member, e),
			}
		}
		names.sort();
		names.dedup();
		Ok(names)
	}

	// ---- Owner lookup ----

	fn locate_owner(&self, name: &str) -> Result<Owner, Error> {
		check_name(name)?;
		let ring = self.system.ring.borrow().clone();
		let owner = ring.locate(name.as_bytes())?.to_string();
		if owner == self.system.local_member() {
			Ok(Owner::Local)
		} else {
			// No retry and no failover here: each database has exactly one
			// owner, a dead owner means the request fails.
			let node = self
				.system
				.node_id_for_member(&owner)
				.ok_or(Error::UnknownMember(owner))?;
			Ok(Owner::Remote(node))
		}
	}

	async fn remote(&self, node: Uuid, rpc: DatabaseRpc) -> Result<DatabaseRpc, Error> {
		self.system
			.rpc
			.call(
				&self.endpoint,
				node,
				rpc,
				RequestStrategy::with_priority(PRIO_NORMAL),
			)
			.await
	}

	// ---- Local operations ----
	// SQLite work is synchronous: it runs on the blocking pool.

	async fn create_local(&self, name: String, migration: Option<String>) -> Result<String, Error> {
		let _lock = self.mutation_lock.lock().await;
		let store = self.store.clone();
		run_blocking(move || store.create(&name, migration.as_deref())).await?;
		Ok("success".to_string())
	}

	async fn drop_local(&self, name: String) -> Result<String, Error> {
		let _lock = self.mutation_lock.lock().await;
		let store = self.store.clone();
		run_blocking(move || store.drop(&name)).await?;
		Ok("success".to_string())
	}

	async fn get_local(&self, name: String) -> Result<String, Error> {
		let store = self.store.clone();
		run_blocking(move || store.get(&name)).await?;
		Ok("success".to_string())
	}

	async fn query_local(
		&self,
		name: String,
		query: String,
		args: Vec<Argument>,
	) -> Result<Vec<u8>, Error> {
		let store = self.store.clone();
		run_blocking(move || store.query(&name, &query, &args)).await
	}

	async fn exec_local(
		&self,
		name: String,
		query: String,
		args: Vec<Argument>,
	) -> Result<i64, Error> {
		let store = self.store.clone();
		run_blocking(move || store.exec(&name, &query, &args)).await
	}

	async fn list_local(&self) -> Result<Vec<String>, Error> {
		let store = self.store.clone();
		run_blocking(move || store.list()).await
	}
}

async fn run_blocking<T, F>(f: F) -> Result<T, Error>
where
	F: FnOnce() -> Result<T, shoal_db::Error> + Send + 'static,
	T: Send + 'static,
{
	tokio::task::spawn_blocking(f)
		.await
		.map_err(|e| Error::Message(format!("Blocking task aborted: {}", e)))?
		.map_err(Error::from)
}

#[async_trait]
impl EndpointHandler<DatabaseRpc> for DatabaseManager {
	async fn handle(
		self: &Arc<Self>,
		msg: &DatabaseRpc,
		_from: NodeID,
	) -> Result<DatabaseRpc, Error> {
		match msg {
			DatabaseRpc::Create { name, migration } => self
				.create_local(name.clone(), migration.clone())
				.await
				.map(DatabaseRpc::Msg),
			DatabaseRpc::Drop { name } => {
				self.drop_local(name.clone()).await.map(DatabaseRpc::Msg)
			}
			DatabaseRpc::Get { name } => self.get_local(name.clone()).await.map(DatabaseRpc::Msg),
			DatabaseRpc::Query { name, query, args } => self
				.query_local(name.clone(), query.clone(), args.clone())
				.await
				.map(DatabaseRpc::QueryResult),
			DatabaseRpc::Exec { name, query, args } => self
				.exec_local(name.clone(), query.clone(), args.clone())
				.await
				.map(DatabaseRpc::ExecResult),
			DatabaseRpc::ListDatabases => {
				self.list_local().await.map(DatabaseRpc::DatabaseList)
			}
			m => Err(Error::unexpected_rpc_message(m)),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	use std::net::SocketAddr;
	use std::path::Path;

	use mktemp::Temp;

	use shoal_rpc::system::{NodeStatus, SystemRpc};
	use shoal_util::config::Config;

	fn test_manager(data_dir: &Path) -> Arc<DatabaseManager> {
		let _ = sodiumoxide::init();
		let config = Config {
			rpc_bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
			rpc_public_addr: Some("127.0.0.1:3901".to_string()),
			rpc_secret: Some("00".repeat(32)),
			data_dir: data_dir.to_path_buf(),
			..Default::default()
		};
		std::fs::create_dir_all(&config.data_dir).unwrap();
		let system = System::new(&config).expect("could not create system");
		DatabaseManager::new(config.data_dir, system)
	}

	fn json(bytes: &[u8]) -> serde_json::Value {
		serde_json::from_slice(bytes).unwrap()
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn test_single_node_lifecycle() {
		let dir = Temp::new_dir().unwrap();
		let manager = test_manager(&dir.to_path_buf());

		// the ring only has one member, so everything executes locally
		let msg = manager
			.create(
				"users",
				Some("CREATE TABLE t(x INT); INSERT INTO t(x) VALUES(1),(2);".to_string()),
			)
			.await
			.unwrap();
		assert_eq!(msg, "success");

		let rows = manager
			.query("users", "SELECT x FROM t ORDER BY x", vec![])
			.await
			.unwrap();
		assert_eq!(json(&rows), serde_json::json!([{"x": 1}, {"x": 2}]));

		let n = manager
			.exec(
				"users",
				"INSERT INTO t(x) VALUES(?)",
				vec![Argument::Double(7.0)],
			)
			.await
			.unwrap();
		assert_eq!(n, 1);

		let rows = manager
			.query("users", "SELECT count(*) AS n FROM t", vec![])
			.await
			.unwrap();
		assert_eq!(json(&rows), serde_json::json!([{"n": 3}]));

		manager.get("users").await.unwrap();
		assert_eq!(manager.list_all().await.unwrap(), vec!["users".to_string()]);

		manager.drop("users").await.unwrap();
		manager.drop("users").await.unwrap();
		assert!(matches!(
			manager.get("users").await,
			Err(Error::Db(shoal_db::Error::NotFound(_)))
		));
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn test_duplicate_create_is_surfaced() {
		let dir = Temp::new_dir().unwrap();
		let manager = test_manager(&dir.to_path_buf());

		manager.create("users", None).await.unwrap();
		let err = manager.create("users", None).await.unwrap_err();
		assert!(err.to_string().contains("exist"));
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn test_query_missing_database() {
		let dir = Temp::new_dir().unwrap();
		let manager = test_manager(&dir.to_path_buf());

		assert!(matches!(
			manager.query("missing", "SELECT 1", vec![]).await,
			Err(Error::Db(shoal_db::Error::NotFound(_)))
		));
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn test_invalid_name_is_rejected_before_dispatch() {
		let dir = Temp::new_dir().unwrap();
		let manager = test_manager(&dir.to_path_buf());

		assert!(matches!(
			manager.get("../evil").await,
			Err(Error::Db(shoal_db::Error::InvalidName(_)))
		));
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn test_remote_dispatch_error_is_surfaced() {
		let dir = Temp::new_dir().unwrap();
		let manager = test_manager(&dir.to_path_buf());

		// Make the ring see a second member that was never connected: calls
		// routed to it must fail with a routing or transport error, without
		// any failover to the local store.
		let (peer_key, _) = sodiumoxide::crypto::sign::ed25519::gen_keypair();
		let adv = SystemRpc::AdvertiseStatus(NodeStatus {
			hostname: "peer".to_string(),
			rpc_public_addr: "127.0.0.1:39999".to_string(),
		});
		EndpointHandler::handle(&manager.system, &adv, peer_key)
			.await
			.unwrap();

		// find a name the remote member owns
		let ring = manager.system.ring.borrow().clone();
		let remote_name = (0..1000)
			.map(|i| format!("db{}", i))
			.find(|name| ring.locate(name.as_bytes()).unwrap() == "127.0.0.1:39999")
			.expect("no name maps to the remote member");

		assert!(manager.get(&remote_name).await.is_err());
		// and nothing was created locally
		assert_eq!(manager.list_all().await.unwrap(), Vec::<String>::new());
	}
}
