//! Module containing structs related to membership management
use std::collections::{BTreeSet, HashMap};
use std::io::{Read, Write};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use futures::join;
use serde::{Deserialize, Serialize};
use sodiumoxide::crypto::sign::ed25519;
use tokio::select;
use tokio::sync::watch;
use tokio::sync::Mutex;

use netapp::endpoint::{Endpoint, EndpointHandler};
use netapp::message::*;
use netapp::peering::fullmesh::FullMeshPeeringStrategy;
use netapp::util::parse_and_resolve_peer_addr_async;
use netapp::{NetApp, NetworkKey, NodeID, NodeKey};

use shoal_util::config::Config;
use shoal_util::data::*;
use shoal_util::error::*;
use shoal_util::time::*;

use crate::ring::*;
use crate::rpc_helper::*;

/// How often unreachable bootstrap peers are re-tried
const DISCOVERY_INTERVAL: Duration = Duration::from_secs(60);

/// How often the local status is advertised to every peer
const STATUS_EXCHANGE_INTERVAL: Duration = Duration::from_secs(10);

/// A peer whose connection is down and whose last advertisement is older
/// than this is evicted from the ring
const STATUS_EXPIRY: Duration = Duration::from_secs(40);

/// Version tag used for version check upon netapp connection.
/// Cluster nodes with different version tags are deemed
/// incompatible and will refuse to connect.
pub const SHOAL_VERSION_TAG: u64 = 0x73686f616c000001; // shoal 0x0001

/// RPC endpoint used for calls related to membership
pub const SYSTEM_RPC_PATH: &str = "shoal_rpc/system.rs/SystemRpc";

/// RPC messages related to membership
#[derive(Debug, Serialize, Deserialize, Clone)]
pub enum SystemRpc {
	/// Response to successful advertisements
	Ok,
	/// Request to connect to a specific node (in <pubkey>@<host>:<port> format)
	Connect(String),
	/// Advertise this node's status. Exchanged with every node on a regular
	/// basis; carries the RPC address under which the node wants to be
	/// routed to.
	AdvertiseStatus(NodeStatus),
	/// Get known nodes states
	GetKnownNodes,
	/// Return known nodes
	ReturnKnownNodes(Vec<KnownNodeInfo>),
}

impl Message for SystemRpc {
	type Response = Result<SystemRpc, Error>;
}

/// This node's membership manager
pub struct System {
	/// The id of this node
	pub id: Uuid,

	local_status: ArcSwap<NodeStatus>,
	node_status: RwLock<HashMap<Uuid, (u64, NodeStatus)>>,

	pub netapp: Arc<NetApp>,
	fullmesh: Arc<FullMeshPeeringStrategy>,
	pub rpc: RpcHelper,

	system_endpoint: Arc<Endpoint<SystemRpc, System>>,

	rpc_listen_addr: SocketAddr,
	bootstrap_peers: Vec<String>,

	/// The ring, mapping database names to their owning member. Shared with
	/// everything that needs to locate a database.
	pub ring: watch::Receiver<Arc<Ring>>,
	update_ring: Mutex<watch::Sender<Arc<Ring>>>,
}

/// Status periodically advertised by every node to the rest of the cluster.
/// The RPC address it carries is the node's ring identity; the gossip
/// identity (the transport key) is deliberately not used for routing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatus {
	/// Label of the node in status outputs (defaults to its hostname)
	pub hostname: String,
	/// Publicly reachable RPC address: the canonical member string
	pub rpc_public_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnownNodeInfo {
	pub id: Uuid,
	pub addr: SocketAddr,
	pub is_up: bool,
	pub last_seen_secs_ago: Option<u64>,
	pub status: NodeStatus,
}

pub fn read_node_id(data_dir: &Path) -> Result<NodeID, Error> {
	let mut pubkey_file = data_dir.to_path_buf();
	pubkey_file.push("node_key.pub");

	let mut f = std::fs::File::open(pubkey_file.as_path())?;
	let mut d = vec![];
	f.read_to_end(&mut d)?;
	if d.len() != 32 {
		return Err(Error::Message("Corrupt node_key.pub file".to_string()));
	}

	let mut key = [0u8; 32];
	key.copy_from_slice(&d[..]);
	NodeID::from_slice(&key[..]).ok_or_message("Invalid node_key.pub file")
}

pub fn gen_node_key(data_dir: &Path) -> Result<NodeKey, Error> {
	let mut key_file = data_dir.to_path_buf();
	key_file.push("node_key");
	if key_file.as_path().exists() {
		let mut f = std::fs::File::open(key_file.as_path())?;
		let mut d = vec![];
		f.read_to_end(&mut d)?;
		if d.len() != 64 {
			return Err(Error::Message("Corrupt node_key file".to_string()));
		}

		let mut key = [0u8; 64];
		key.copy_from_slice(&d[..]);
		NodeKey::from_slice(&key[..]).ok_or_message("Invalid node_key file")
	} else {
		if !data_dir.exists() {
			info!("Data directory does not exist, creating it.");
			std::fs::create_dir_all(data_dir)?;
		}

		info!("Generating new node key pair.");
		let (pubkey, key) = ed25519::gen_keypair();

		{
			use std::os::unix::fs::PermissionsExt;
			let mut f = std::fs::File::create(key_file.as_path())?;
			let mut perm = f.metadata()?.permissions();
			perm.set_mode(0o600);
			std::fs::set_permissions(key_file.as_path(), perm)?;
			f.write_all(&key[..])?;
		}

		{
			let mut pubkey_file = data_dir.to_path_buf();
			pubkey_file.push("node_key.pub");
			let mut f2 = std::fs::File::create(pubkey_file.as_path())?;
			f2.write_all(&pubkey[..])?;
		}

		Ok(key)
	}
}

impl System {
	/// Create this node's membership manager
	pub fn new(config: &Config) -> Result<Arc<Self>, Error> {
		let node_key = gen_node_key(&config.data_dir)?;
		info!(
			"Node ID of this node: {}",
			hex::encode(&node_key.public_key()[..8])
		);

		let network_key_hex = config.rpc_secret.as_ref().ok_or_message(
			"rpc_secret value is missing, not present in config file or in environment",
		)?;
		let network_key = hex::decode(network_key_hex)
			.ok()
			.and_then(|x| NetworkKey::from_slice(&x))
			.ok_or_message("Invalid RPC secret key")?;

		let rpc_public_addr = match &config.rpc_public_addr {
			Some(a_str) => {
				use std::net::ToSocketAddrs;
				match a_str.to_socket_addrs() {
					Err(e) => {
						error!(
							"Cannot resolve rpc_public_addr {} from config file: {}.",
							a_str, e
						);
						None
					}
					Ok(a) => {
						let a = a.collect::<Vec<_>>();
						if a.is_empty() {
							error!("rpc_public_addr {} resolve to no known IP address", a_str);
						}
						if a.len() > 1 {
							warn!("Multiple possible resolutions for rpc_public_addr: {:?}. Taking the first one.", a);
						}
						a.into_iter().next()
					}
				}
			}
			None => {
				let addr =
					get_default_ip().map(|ip| SocketAddr::new(ip, config.rpc_bind_addr.port()));
				if let Some(a) = addr {
					warn!("Using autodetected rpc_public_addr: {}. Consider specifying it explicitly in configuration file if possible.", a);
				}
				addr
			}
		};
		let rpc_public_addr = rpc_public_addr.ok_or_message(
			"This node does not know its publicly reachable RPC address; intra-cluster routing cannot work. Set rpc_public_addr in the configuration.",
		)?;

		let local_status = NodeStatus {
			hostname: config.node_name.clone().unwrap_or_else(|| {
				gethostname::gethostname()
					.into_string()
					.unwrap_or_else(|_| "<invalid utf-8>".to_string())
			}),
			rpc_public_addr: rpc_public_addr.to_string(),
		};

		// The ring must contain this node before any traffic is accepted
		let mut ring = Ring::new(RingConfig::default());
		ring.add(&local_status.rpc_public_addr);
		let (update_ring, ring) = watch::channel(Arc::new(ring));

		let netapp = NetApp::new(SHOAL_VERSION_TAG, network_key, node_key);
		let fullmesh =
			FullMeshPeeringStrategy::new(netapp.clone(), vec![], Some(rpc_public_addr));
		if let Some(ping_timeout) = config.rpc_ping_timeout_msec {
			fullmesh.set_ping_timeout_millis(ping_timeout);
		}

		let system_endpoint = netapp.endpoint(SYSTEM_RPC_PATH.into());

		let sys = Arc::new(System {
			id: netapp.id.into(),
			local_status: ArcSwap::new(Arc::new(local_status)),
			node_status: RwLock::new(HashMap::new()),
			netapp: netapp.clone(),
			fullmesh: fullmesh.clone(),
			rpc: RpcHelper::new(
				netapp.id.into(),
				fullmesh,
				config.rpc_timeout_msec.map(Duration::from_millis),
			),
			system_endpoint,
			rpc_listen_addr: config.rpc_bind_addr,
			bootstrap_peers: config.bootstrap_peers.clone(),
			ring,
			update_ring: Mutex::new(update_ring),
		});
		sys.system_endpoint.set_handler(sys.clone());
		Ok(sys)
	}

	/// Listen on the RPC socket and run the peering and gossip loops
	pub async fn run(self: Arc<Self>, must_exit: watch::Receiver<bool>) {
		join!(
			self.netapp
				.clone()
				.listen(self.rpc_listen_addr, None, must_exit.clone()),
			self.fullmesh.clone().run(must_exit.clone()),
			self.discovery_loop(must_exit.clone()),
			self.status_exchange_loop(must_exit.clone()),
		);
	}

	/// Join the cluster: try every configured bootstrap peer, then import
	/// the first reachable peer's view of the membership so that routing
	/// works before the first status exchange round.
	pub async fn bootstrap(self: &Arc<Self>) -> Result<(), Error> {
		if self.bootstrap_peers.is_empty() {
			return Ok(());
		}

		let mut first_contact = None;
		for peer in self.bootstrap_peers.iter() {
			let (pubkey, addrs) = match parse_and_resolve_peer_addr_async(peer).await {
				Some(x) => x,
				None => {
					warn!("Unable to parse and/or resolve bootstrap peer {}", peer);
					continue;
				}
			};
			for addr in addrs {
				match self.netapp.clone().try_connect(addr, pubkey).await {
					Ok(()) => {
						if first_contact.is_none() {
							first_contact = Some(pubkey);
						}
						break;
					}
					Err(e) => warn!("{}", connect_error_message(addr, pubkey, e)),
				}
			}
		}
		let first_contact =
			first_contact.ok_or_message("Could not join any of the configured bootstrap peers")?;

		// Snapshot of the remote cluster view: remember every node the
		// contact point knows about and try to reach them too.
		match self
			.rpc
			.call(
				&self.system_endpoint,
				first_contact.into(),
				SystemRpc::GetKnownNodes,
				RequestStrategy::with_priority(PRIO_HIGH),
			)
			.await
		{
			Ok(SystemRpc::ReturnKnownNodes(known_nodes)) => {
				for node in known_nodes {
					if node.id == self.id || node.status.rpc_public_addr == "?" {
						continue;
					}
					let (id, addr) = (node.id, node.addr);
					self.node_status
						.write()
						.unwrap()
						.insert(id, (now_msec(), node.status));
					let self2 = self.clone();
					tokio::spawn(async move {
						if let Err(e) = self2.netapp.clone().try_connect(addr, id.into()).await {
							error!("{}", connect_error_message(addr, id.into(), e));
						}
					});
				}
			}
			Ok(resp) => warn!("Unexpected answer to GetKnownNodes: {:?}", resp),
			Err(e) => warn!("Could not import cluster view from first contact: {}", e),
		}
		self.update_ring_members().await;

		// Announce ourselves right away so the rest of the cluster routes to
		// us without waiting for the next status exchange round.
		self.rpc
			.broadcast(
				&self.system_endpoint,
				SystemRpc::AdvertiseStatus(self.local_status.load().as_ref().clone()),
				RequestStrategy::with_priority(PRIO_HIGH),
			)
			.await;
		Ok(())
	}

	// ---- Administrative operations (directly available and
	//      also available through RPC) ----

	pub fn get_known_nodes(&self) -> Vec<KnownNodeInfo> {
		let node_status = self.node_status.read().unwrap();
		let local_status = self.local_status.load_full();
		self.fullmesh
			.get_peer_list()
			.iter()
			.map(|n| KnownNodeInfo {
				id: n.id.into(),
				addr: n.addr,
				is_up: n.is_up(),
				last_seen_secs_ago: n
					.last_seen
					.map(|t| (Instant::now().saturating_duration_since(t)).as_secs()),
				status: if n.id == self.netapp.id {
					local_status.as_ref().clone()
				} else {
					node_status
						.get(&n.id.into())
						.cloned()
						.map(|(_, st)| st)
						.unwrap_or_else(NodeStatus::unknown)
				},
			})
			.collect::<Vec<_>>()
	}

	/// The member string under which this node appears in the ring
	pub fn local_member(&self) -> String {
		self.local_status.load().rpc_public_addr.clone()
	}

	/// Id of the node currently advertising the given member string
	pub fn node_id_for_member(&self, member: &str) -> Option<Uuid> {
		self.node_status
			.read()
			.unwrap()
			.iter()
			.find(|(_, (_, status))| status.rpc_public_addr == member)
			.map(|(id, _)| *id)
	}

	pub async fn connect(&self, node: &str) -> Result<(), Error> {
		let (pubkey, addrs) = parse_and_resolve_peer_addr_async(node)
			.await
			.ok_or_else(|| {
				Error::Message(format!(
					"Unable to parse or resolve node specification: {}",
					node
				))
			})?;
		let mut errors = vec![];
		for addr in addrs.iter() {
			match self.netapp.clone().try_connect(*addr, pubkey).await {
				Ok(()) => return Ok(()),
				Err(e) => {
					errors.push((
						*addr,
						Error::Message(connect_error_message(*addr, pubkey, e)),
					));
				}
			}
		}
		if errors.len() == 1 {
			Err(Error::Message(errors[0].1.to_string()))
		} else {
			Err(Error::Message(format!("{:?}", errors)))
		}
	}

	// ---- INTERNALS ----

	/// Recompute the ring from the advertised statuses of the nodes we
	/// currently believe in. The set is diffed against the current ring so
	/// that untouched members keep their partitions.
	async fn update_ring_members(&self) {
		let mut desired: BTreeSet<String> = BTreeSet::new();
		desired.insert(self.local_member());
		{
			let node_status = self.node_status.read().unwrap();
			for (_, (_, status)) in node_status.iter() {
				desired.insert(status.rpc_public_addr.clone());
			}
		}

		let update_ring = self.update_ring.lock().await;
		let ring: Arc<Ring> = self.ring.borrow().clone();
		if *ring.members() == desired {
			return;
		}

		let removed: Vec<String> = ring.members().difference(&desired).cloned().collect();
		let added: Vec<String> = desired.difference(ring.members()).cloned().collect();
		let mut new_ring = ring.as_ref().clone();
		for member in removed {
			info!("Removing {} from the ring", member);
			new_ring.remove(&member);
		}
		for member in added {
			info!("Adding {} to the ring", member);
			new_ring.add(&member);
		}
		if update_ring.send(Arc::new(new_ring)).is_err() {
			warn!("Could not publish new ring: watch channel closed");
		}
	}

	/// Forget nodes that are neither connected nor recently advertised, so
	/// that requests for their databases surface a routing error instead of
	/// hanging on a dead connection.
	fn prune_dead_nodes(&self) {
		let up: HashMap<Uuid, bool> = self
			.fullmesh
			.get_peer_list()
			.iter()
			.map(|peer| (peer.id.into(), peer.is_up()))
			.collect();
		let now = now_msec();
		let expiry = STATUS_EXPIRY.as_millis() as u64;
		self.node_status.write().unwrap().retain(|id, (t, _)| {
			up.get(id).copied().unwrap_or(false) || now.saturating_sub(*t) < expiry
		});
	}

	// --- RPC HANDLERS ---

	async fn handle_connect(&self, node: &str) -> Result<SystemRpc, Error> {
		self.connect(node).await?;
		Ok(SystemRpc::Ok)
	}

	fn handle_get_known_nodes(&self) -> SystemRpc {
		SystemRpc::ReturnKnownNodes(self.get_known_nodes())
	}

	async fn handle_advertise_status(
		self: &Arc<Self>,
		from: Uuid,
		info: &NodeStatus,
	) -> Result<SystemRpc, Error> {
		if from != self.id {
			self.node_status
				.write()
				.unwrap()
				.insert(from, (now_msec(), info.clone()));
			self.update_ring_members().await;
		}
		Ok(SystemRpc::Ok)
	}

	async fn status_exchange_loop(&self, mut stop_signal: watch::Receiver<bool>) {
		while !*stop_signal.borrow() {
			let restart_at = Instant::now() + STATUS_EXCHANGE_INTERVAL;

			let local_status: NodeStatus = self.local_status.load().as_ref().clone();
			self.rpc
				.broadcast(
					&self.system_endpoint,
					SystemRpc::AdvertiseStatus(local_status),
					RequestStrategy::with_priority(PRIO_HIGH)
						.with_custom_timeout(STATUS_EXCHANGE_INTERVAL),
				)
				.await;

			self.prune_dead_nodes();
			self.update_ring_members().await;

			select! {
				_ = tokio::time::sleep_until(restart_at.into()) => {},
				_ = stop_signal.changed() => {},
			}
		}
	}

	async fn discovery_loop(self: &Arc<Self>, mut stop_signal: watch::Receiver<bool>) {
		while !*stop_signal.borrow() {
			let connected: Vec<NodeID> = self
				.fullmesh
				.get_peer_list()
				.iter()
				.filter(|peer| peer.is_up())
				.map(|peer| peer.id)
				.collect();
			for peer in self.bootstrap_peers.iter() {
				if let Some((pubkey, addrs)) = parse_and_resolve_peer_addr_async(peer).await {
					if pubkey == self.netapp.id || connected.contains(&pubkey) {
						continue;
					}
					for addr in addrs {
						let self2 = self.clone();
						tokio::spawn(async move {
							if let Err(e) = self2.netapp.clone().try_connect(addr, pubkey).await {
								debug!("{}", connect_error_message(addr, pubkey, e));
							}
						});
					}
				}
			}

			select! {
				_ = tokio::time::sleep(DISCOVERY_INTERVAL) => {},
				_ = stop_signal.changed() => {},
			}
		}
	}
}

#[async_trait]
impl EndpointHandler<SystemRpc> for System {
	async fn handle(self: &Arc<Self>, msg: &SystemRpc, from: NodeID) -> Result<SystemRpc, Error> {
		match msg {
			SystemRpc::Connect(node) => self.handle_connect(node).await,
			SystemRpc::AdvertiseStatus(adv) => {
				self.handle_advertise_status(from.into(), adv).await
			}
			SystemRpc::GetKnownNodes => Ok(self.handle_get_known_nodes()),
			m => Err(Error::unexpected_rpc_message(m)),
		}
	}
}

impl NodeStatus {
	fn unknown() -> Self {
		NodeStatus {
			hostname: "?".to_string(),
			rpc_public_addr: "?".to_string(),
		}
	}
}

fn get_default_ip() -> Option<IpAddr> {
	pnet_datalink::interfaces()
		.iter()
		.find(|e| e.is_up() && !e.is_loopback() && !e.ips.is_empty())
		.and_then(|e| e.ips.first())
		.map(|a| a.ip())
}

fn connect_error_message(
	addr: SocketAddr,
	pubkey: ed25519::PublicKey,
	e: netapp::error::Error,
) -> String {
	format!("Error establishing RPC connection to remote node: {}@{}.\nThis can happen if the remote node is not reachable on the network, but also if the two nodes are not configured with the same rpc_secret.\n{}", hex::encode(pubkey), addr, e)
}
