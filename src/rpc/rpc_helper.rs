//! Contain structs related to making RPCs
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;

pub use netapp::endpoint::{Endpoint, EndpointHandler};
pub use netapp::message::*;
use netapp::peering::fullmesh::FullMeshPeeringStrategy;
pub use netapp::NodeID;

use shoal_util::data::Uuid;
use shoal_util::error::Error;

/// Timeout applied to RPC calls that do not ask for a custom one
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Strategy to apply when making RPC
#[derive(Copy, Clone)]
pub struct RequestStrategy {
	/// Priority of the request, forwarded to the transport
	rs_priority: RequestPriority,
	/// Deadline of the request, overriding the helper's default
	rs_timeout: Option<Duration>,
}

impl RequestStrategy {
	/// Create a RequestStrategy with a given priority
	pub fn with_priority(prio: RequestPriority) -> Self {
		RequestStrategy {
			rs_priority: prio,
			rs_timeout: None,
		}
	}

	/// Set a custom timeout for this request
	pub fn with_custom_timeout(mut self, timeout: Duration) -> Self {
		self.rs_timeout = Some(timeout);
		self
	}
}

/// Helper for making RPCs to the other nodes of the mesh
#[derive(Clone)]
pub struct RpcHelper(Arc<RpcHelperInner>);

struct RpcHelperInner {
	our_node_id: Uuid,
	fullmesh: Arc<FullMeshPeeringStrategy>,
	rpc_timeout: Duration,
}

impl RpcHelper {
	pub(crate) fn new(
		our_node_id: Uuid,
		fullmesh: Arc<FullMeshPeeringStrategy>,
		rpc_timeout: Option<Duration>,
	) -> Self {
		Self(Arc::new(RpcHelperInner {
			our_node_id,
			fullmesh,
			rpc_timeout: rpc_timeout.unwrap_or(DEFAULT_TIMEOUT),
		}))
	}

	/// Call one node, unwrapping both the transport result and the remote
	/// handler's result
	pub async fn call<M, H, S>(
		&self,
		endpoint: &Endpoint<M, H>,
		to: Uuid,
		msg: M,
		strat: RequestStrategy,
	) -> Result<S, Error>
	where
		M: Message<Response = Result<S, Error>>,
		H: EndpointHandler<M>,
	{
		let timeout = strat.rs_timeout.unwrap_or(self.0.rpc_timeout);
		let node_id: NodeID = to.into();
		match tokio::time::timeout(timeout, endpoint.call(&node_id, msg, strat.rs_priority)).await {
			Err(_) => Err(Error::Timeout),
			Ok(Err(e)) => Err(e.into()),
			Ok(Ok(resp)) => resp,
		}
	}

	/// Send a message to every connected peer. Individual failures are
	/// logged and swallowed: gossip does not need every send to succeed.
	pub async fn broadcast<M, H, S>(
		&self,
		endpoint: &Endpoint<M, H>,
		msg: M,
		strat: RequestStrategy,
	) where
		M: Message<Response = Result<S, Error>> + Clone,
		H: EndpointHandler<M>,
	{
		let peers: Vec<Uuid> = self
			.0
			.fullmesh
			.get_peer_list()
			.iter()
			.filter(|peer| peer.is_up())
			.map(|peer| peer.id.into())
			.filter(|id| *id != self.0.our_node_id)
			.collect();
		let calls = peers
			.iter()
			.map(|to| self.call(endpoint, *to, msg.clone(), strat));
		for (to, res) in peers.iter().zip(join_all(calls).await) {
			if let Err(e) = res {
				warn!("Broadcast to {:?} failed: {}", to, e);
			}
		}
	}
}
