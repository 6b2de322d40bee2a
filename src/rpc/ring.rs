//! Module containing the consistent-hash ring that maps database names to
//! their owning cluster member
use std::collections::{BTreeMap, BTreeSet, HashMap};

use shoal_util::data::fasthash;
use shoal_util::error::Error;

/// Number of virtual partitions on the ring. Prime, so that partition ids
/// spread well under the modulo in [`Ring::locate`].
pub const DEFAULT_PARTITION_COUNT: usize = 7;

/// Number of points each member gets on the ring
pub const DEFAULT_REPLICATION_FACTOR: usize = 20;

/// Upper bound on `owned partitions / average` for any single member
pub const DEFAULT_LOAD_FACTOR: f64 = 1.25;

/// Parameters of the ring. Every node of a cluster must run with the same
/// values for routing to converge.
#[derive(Debug, Clone, Copy)]
pub struct RingConfig {
	pub partition_count: usize,
	pub replication_factor: usize,
	pub load_factor: f64,
}

impl Default for RingConfig {
	fn default() -> Self {
		Self {
			partition_count: DEFAULT_PARTITION_COUNT,
			replication_factor: DEFAULT_REPLICATION_FACTOR,
			load_factor: DEFAULT_LOAD_FACTOR,
		}
	}
}

/// Consistent-hash ring with bounded loads, mapping byte keys to exactly one
/// owning member.
///
/// A member is an opaque string, canonically a peer's advertised RPC
/// address. The partition table is rebuilt from the sorted member set on
/// every mutation, so for a given member set the assignment never depends on
/// the order in which members were added or removed.
#[derive(Clone)]
pub struct Ring {
	config: RingConfig,
	members: BTreeSet<String>,
	points: BTreeMap<u64, String>,
	partitions: Vec<String>,
}

impl Ring {
	pub fn new(config: RingConfig) -> Self {
		Self {
			config,
			members: BTreeSet::new(),
			points: BTreeMap::new(),
			partitions: Vec::new(),
		}
	}

	/// Insert a member. Idempotent.
	pub fn add(&mut self, member: &str) {
		if self.members.insert(member.to_string()) {
			self.rebuild();
		}
	}

	/// Remove a member. Removing an unknown member is a no-op.
	pub fn remove(&mut self, member: &str) {
		if self.members.remove(member) {
			self.rebuild();
		}
	}

	/// The current member set
	pub fn members(&self) -> &BTreeSet<String> {
		&self.members
	}

	/// Owner of the given key; `Error::RingEmpty` when no member was added
	pub fn locate(&self, key: &[u8]) -> Result<&str, Error> {
		if self.partitions.is_empty() {
			return Err(Error::RingEmpty);
		}
		let partition = (fasthash(key) % self.config.partition_count as u64) as usize;
		Ok(&self.partitions[partition])
	}

	/// Owner of one virtual partition, for inspection
	pub fn partition_owner(&self, partition: usize) -> Option<&str> {
		self.partitions.get(partition).map(|m| m.as_str())
	}

	fn max_load(&self) -> usize {
		let avg = self.config.partition_count as f64 / self.members.len() as f64;
		(avg * self.config.load_factor).ceil() as usize
	}

	fn rebuild(&mut self) {
		self.points.clear();
		self.partitions.clear();
		if self.members.is_empty() {
			return;
		}

		for member in self.members.iter() {
			for vnode in 0..self.config.replication_factor {
				let h = fasthash(format!("{}{}", member, vnode).as_bytes());
				// On a point collision the smaller member string wins, so
				// the outcome stays independent of insertion order.
				match self.points.get(&h) {
					Some(existing) if existing.as_str() <= member.as_str() => (),
					_ => {
						self.points.insert(h, member.clone());
					}
				}
			}
		}

		let max_load = self.max_load();
		let mut loads: HashMap<&str, usize> = HashMap::new();
		let mut partitions = Vec::with_capacity(self.config.partition_count);
		for partition in 0..self.config.partition_count {
			let h = fasthash(partition.to_string().as_bytes());
			// Walk clockwise from the partition's point, skipping members
			// that already carry the maximum bounded load.
			let owner = self
				.points
				.range(h..)
				.chain(self.points.range(..h))
				.map(|(_, member)| member)
				.find(|member| loads.get(member.as_str()).copied().unwrap_or(0) < max_load)
				// members.len() * max_load >= partition_count, and one full
				// walk visits every member, so an owner always exists
				.expect("ring has capacity for every partition");
			*loads.entry(owner.as_str()).or_insert(0) += 1;
			partitions.push(owner.clone());
		}
		self.partitions = partitions;
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn members(n: usize) -> Vec<String> {
		(0..n).map(|i| format!("10.0.0.{}:7070", i)).collect()
	}

	fn ring_of(config: RingConfig, members: &[String]) -> Ring {
		let mut ring = Ring::new(config);
		for m in members {
			ring.add(m);
		}
		ring
	}

	fn owners(ring: &Ring) -> Vec<String> {
		(0..ring.config.partition_count)
			.map(|p| ring.partition_owner(p).unwrap().to_string())
			.collect()
	}

	#[test]
	fn test_empty_ring() {
		let ring = Ring::new(RingConfig::default());
		assert!(matches!(ring.locate(b"users"), Err(Error::RingEmpty)));
	}

	#[test]
	fn test_single_member_owns_everything() {
		let ring = ring_of(RingConfig::default(), &members(1));
		for key in ["users", "posts", "metrics", ""] {
			assert_eq!(ring.locate(key.as_bytes()).unwrap(), "10.0.0.0:7070");
		}
	}

	#[test]
	fn test_locate_is_deterministic() {
		let ring = ring_of(RingConfig::default(), &members(5));
		for key in ["users", "posts", "metrics"] {
			assert_eq!(
				ring.locate(key.as_bytes()).unwrap(),
				ring.locate(key.as_bytes()).unwrap()
			);
		}
	}

	#[test]
	fn test_insertion_order_does_not_matter() {
		let names = members(6);
		let forward = ring_of(RingConfig::default(), &names);
		let mut reversed: Vec<String> = names.clone();
		reversed.reverse();
		let backward = ring_of(RingConfig::default(), &reversed);
		assert_eq!(owners(&forward), owners(&backward));
	}

	#[test]
	fn test_completeness_and_load_bound() {
		for n in 1..=8 {
			let names = members(n);
			let ring = ring_of(RingConfig::default(), &names);
			let owners = owners(&ring);
			assert_eq!(owners.len(), DEFAULT_PARTITION_COUNT);

			let mut loads: HashMap<&str, usize> = HashMap::new();
			for owner in owners.iter() {
				assert!(names.contains(owner));
				*loads.entry(owner.as_str()).or_insert(0) += 1;
			}
			let max_allowed =
				(DEFAULT_PARTITION_COUNT as f64 / n as f64 * DEFAULT_LOAD_FACTOR).ceil() as usize;
			for (_, load) in loads {
				assert!(load <= max_allowed);
			}
		}
	}

	#[test]
	fn test_add_remove_idempotent() {
		let mut ring = ring_of(RingConfig::default(), &members(3));
		let before = owners(&ring);

		ring.add("10.0.0.1:7070");
		assert_eq!(owners(&ring), before);

		ring.remove("10.9.9.9:7070");
		assert_eq!(owners(&ring), before);

		for m in members(3) {
			ring.remove(&m);
		}
		assert!(matches!(ring.locate(b"users"), Err(Error::RingEmpty)));
	}

	#[test]
	fn test_remove_restores_previous_assignment() {
		let mut ring = ring_of(RingConfig::default(), &members(4));
		let before = owners(&ring);
		ring.add("10.0.0.99:7070");
		ring.remove("10.0.0.99:7070");
		assert_eq!(owners(&ring), before);
	}

	#[test]
	fn test_stability_on_member_join() {
		// A bigger (still prime) partition count makes the relocation
		// fraction measurable.
		let config = RingConfig {
			partition_count: 271,
			replication_factor: DEFAULT_REPLICATION_FACTOR,
			load_factor: DEFAULT_LOAD_FACTOR,
		};
		let mut ring = ring_of(config, &members(8));
		let before = owners(&ring);
		ring.add("10.0.0.99:7070");
		let after = owners(&ring);

		let moved = before
			.iter()
			.zip(after.iter())
			.filter(|(a, b)| a != b)
			.count();
		assert!(moved > 0);
		// On average a ninth member should take over ~1/9 of the
		// partitions; anything above a quarter means churn went wild.
		assert!(moved <= 271 / 4, "{} partitions moved", moved);
	}
}
