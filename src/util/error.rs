//! Module containing error types used in shoal
use std::fmt;
use std::io;

use err_derive::Error;
use serde::{de::Visitor, Deserialize, Deserializer, Serialize, Serializer};

/// Regroup all errors that can happen while operating a shoal node
#[derive(Debug, Error)]
pub enum Error {
	#[error(display = "IO error: {}", _0)]
	Io(
		#[error(source)]
		#[error(from)]
		io::Error,
	),

	#[error(display = "Netapp error: {}", _0)]
	Netapp(
		#[error(source)]
		#[error(from)]
		netapp::error::Error,
	),

	#[error(display = "Database error: {}", _0)]
	Db(
		#[error(source)]
		#[error(from)]
		shoal_db::Error,
	),

	#[error(display = "JSON error: {}", _0)]
	Json(
		#[error(source)]
		#[error(from)]
		serde_json::Error,
	),

	#[error(display = "TOML decode error: {}", _0)]
	TomlDecode(
		#[error(source)]
		#[error(from)]
		toml::de::Error,
	),

	#[error(display = "Timeout")]
	Timeout,

	#[error(display = "No cluster member to route the request to (ring is empty)")]
	RingEmpty,

	#[error(display = "Owner {:?} of this database is not a live cluster member", _0)]
	UnknownMember(String),

	#[error(display = "Bad request: {}", _0)]
	BadRequest(String),

	#[error(display = "Remote error: {}", _0)]
	RemoteError(String),

	#[error(display = "{}", _0)]
	Message(String),
}

impl Error {
	pub fn unexpected_rpc_message<T: fmt::Debug>(v: T) -> Self {
		Error::Message(format!("Unexpected RPC message: {:?}", v))
	}
}

impl From<&str> for Error {
	fn from(v: &str) -> Error {
		Error::Message(v.to_string())
	}
}

impl From<String> for Error {
	fn from(v: String) -> Error {
		Error::Message(v)
	}
}

// Errors that cross the RPC boundary are flattened into their message: the
// calling node only needs something printable to forward to its client.
impl Serialize for Error {
	fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.serialize_str(&format!("{}", self))
	}
}

impl<'de> Deserialize<'de> for Error {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: Deserializer<'de>,
	{
		deserializer
			.deserialize_string(StringVisitor)
			.map(Error::RemoteError)
	}
}

struct StringVisitor;

impl<'de> Visitor<'de> for StringVisitor {
	type Value = String;

	fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
		write!(formatter, "a string that represents an error value")
	}

	fn visit_str<E: serde::de::Error>(self, error_msg: &str) -> Result<Self::Value, E> {
		Ok(error_msg.to_string())
	}

	fn visit_string<E: serde::de::Error>(self, error_msg: String) -> Result<Self::Value, E> {
		Ok(error_msg)
	}
}

/// Trait to map any error type to `Error::Message`, with context
pub trait ErrorContext<T, E> {
	fn err_context<C: std::borrow::Borrow<str>>(self, ctx: C) -> Result<T, Error>;
}

impl<T, E: fmt::Display> ErrorContext<T, E> for Result<T, E> {
	#[inline]
	fn err_context<C: std::borrow::Borrow<str>>(self, ctx: C) -> Result<T, Error> {
		self.map_err(|e| Error::Message(format!("{}\n{}", ctx.borrow(), e)))
	}
}

/// Trait to map `Option::None` and any error to `Error::Message`
pub trait OkOrMessage {
	type S;
	fn ok_or_message<M: Into<String>>(self, message: M) -> Result<Self::S, Error>;
}

impl<T> OkOrMessage for Option<T> {
	type S = T;
	fn ok_or_message<M: Into<String>>(self, message: M) -> Result<T, Error> {
		self.ok_or_else(|| Error::Message(message.into()))
	}
}

impl<T, E: fmt::Display> OkOrMessage for Result<T, E> {
	type S = T;
	fn ok_or_message<M: Into<String>>(self, message: M) -> Result<T, Error> {
		self.map_err(|e| Error::Message(format!("{}: {}", message.into(), e)))
	}
}
