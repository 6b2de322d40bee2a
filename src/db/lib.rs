//! Storage layer of the shoal sharded SQL store: a directory of single-file
//! SQLite databases, with one file per database name.
#[macro_use]
extern crate tracing;

pub mod error;
pub mod store;
pub mod value;

pub use error::Error;
pub use store::{check_name, Store, DB_EXT};
pub use value::Argument;
