//! Contains fixed-size identifiers and the hash function used for ring placement
use std::fmt;
use std::str::FromStr;

use serde::de::Visitor;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, OkOrMessage};

/// An array of 32 bytes
#[derive(Default, PartialOrd, Ord, Clone, Hash, PartialEq, Eq, Copy)]
pub struct FixedBytes32([u8; 32]);

/// Node identifier: the transport public key of a node
pub type Uuid = FixedBytes32;

impl From<[u8; 32]> for FixedBytes32 {
	fn from(x: [u8; 32]) -> Self {
		Self(x)
	}
}

impl FixedBytes32 {
	/// Access the content as a slice
	pub fn as_slice(&self) -> &[u8] {
		&self.0
	}
}

impl fmt::Display for FixedBytes32 {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", hex::encode(&self.0))
	}
}

impl fmt::Debug for FixedBytes32 {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", hex::encode(&self.0[..8]))
	}
}

impl FromStr for FixedBytes32 {
	type Err = Error;

	fn from_str(s: &str) -> Result<Self, Error> {
		let bytes = hex::decode(s).ok_or_message("Invalid hex string")?;
		if bytes.len() != 32 {
			return Err(Error::Message(format!(
				"Invalid 32-byte identifier: {}",
				s
			)));
		}
		let mut buf = [0u8; 32];
		buf.copy_from_slice(&bytes);
		Ok(Self(buf))
	}
}

impl Serialize for FixedBytes32 {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_bytes(&self.0)
	}
}

impl<'de> Deserialize<'de> for FixedBytes32 {
	fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		deserializer.deserialize_bytes(FixedBytes32Visitor)
	}
}

struct FixedBytes32Visitor;

impl<'de> Visitor<'de> for FixedBytes32Visitor {
	type Value = FixedBytes32;

	fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
		write!(formatter, "a byte slice of size 32")
	}

	fn visit_bytes<E: serde::de::Error>(self, value: &[u8]) -> Result<Self::Value, E> {
		if value.len() == 32 {
			let mut res = [0u8; 32];
			res.copy_from_slice(value);
			Ok(res.into())
		} else {
			Err(E::custom(format!(
				"byte slice has incorrect length {}, expected 32",
				value.len()
			)))
		}
	}

	fn visit_byte_buf<E: serde::de::Error>(self, value: Vec<u8>) -> Result<Self::Value, E> {
		self.visit_bytes(&value)
	}
}

impl From<netapp::NodeID> for FixedBytes32 {
	fn from(node_id: netapp::NodeID) -> Self {
		let mut buf = [0u8; 32];
		buf.copy_from_slice(node_id.as_ref());
		Self(buf)
	}
}

impl From<FixedBytes32> for netapp::NodeID {
	fn from(bytes: FixedBytes32) -> Self {
		netapp::NodeID::from_slice(bytes.as_slice()).expect("32-byte node id")
	}
}

/// Compute the 64-bit xxhash of a slice of bytes. Not cryptographic. Stable
/// across nodes and releases: every node of a cluster must place ring
/// partitions identically.
pub fn fasthash(data: &[u8]) -> u64 {
	xxhash_rust::xxh64::xxh64(data, 0)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_fixed_bytes_hex_round_trip() {
		let id = FixedBytes32::from([42u8; 32]);
		let parsed: FixedBytes32 = id.to_string().parse().unwrap();
		assert_eq!(id, parsed);
	}

	#[test]
	fn test_fasthash_is_stable() {
		assert_eq!(fasthash(b"users"), fasthash(b"users"));
		assert_ne!(fasthash(b"a"), fasthash(b"b"));
	}
}
