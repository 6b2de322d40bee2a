//! Crate containing the database manager (local execution and forwarding)
//! and the cluster context of the shoal sharded SQL store
#[macro_use]
extern crate tracing;

pub mod manager;
pub mod shoal;
