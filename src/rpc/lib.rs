//! Crate containing the consistent-hash ring, cluster membership management
//! and RPC machinery of the shoal sharded SQL store
#[macro_use]
extern crate tracing;

pub mod ring;
pub mod rpc_helper;
pub mod system;

pub use rpc_helper::*;
