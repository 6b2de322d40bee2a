//! HTTP frontend of the shoal sharded SQL store
#[macro_use]
extern crate tracing;

pub mod api_server;
pub mod error;
mod helpers;
