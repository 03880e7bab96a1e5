//! The partitioned cache proper: routes a [`Key`] to one of `N` independently-locked shards
//! (§4.2). There is no global lock anywhere in the read or write path.

mod partition;

pub use partition::Partition;

use crate::config::Config;
use crate::key::Key;
use crate::record::Record;
use crate::stats::Stats;

pub struct PartitionedCache {
	partitions: Vec<Partition>,
}

impl PartitionedCache {
	pub fn new(config: &Config) -> Self {
		let partitions =
			(0..config.partitions.max(1)).map(|_| Partition::new(config.partition_byte_budget, config.partition_item_budget)).collect();
		Self { partitions }
	}

	fn partition_for(&self, key: &Key) -> &Partition {
		&self.partitions[key.partition(self.partitions.len())]
	}

	pub fn get(&self, key: &Key) -> Option<Record> {
		self.partition_for(key).get(key.fold())
	}

	pub fn put(&self, key: &Key, record: Record, now: i64, stats: &Stats) {
		self.partition_for(key).put(key.fold(), record, now, stats);
	}

	pub fn erase(&self, key: &Key) -> bool {
		self.partition_for(key).erase(key.fold())
	}

	/// Inserts by raw fold value, bypassing [`Key`] reconstruction — used by snapshot
	/// restore, which only has the fold value on disk.
	pub fn put_raw(&self, fold: u64, record: Record, now: i64, stats: &Stats) {
		let idx = (fold as usize) % self.partitions.len();
		self.partitions[idx].put(fold, record, now, stats);
	}

	pub fn partitions(&self) -> &[Partition] {
		&self.partitions
	}

	/// Runs periodic grace-window eviction across every partition; called from the
	/// background tick, never from a request path.
	pub fn tick(&self, now: i64, grace: u32, stats: &Stats) {
		for partition in &self.partitions {
			partition.evict_expired(now, grace, stats);
		}
	}

	pub fn iter_all(&self) -> Vec<Record> {
		self.partitions.iter().flat_map(Partition::iter).collect()
	}

	pub fn total_bytes(&self) -> usize {
		self.partitions.iter().map(Partition::bytes).sum()
	}

	pub fn total_items(&self) -> usize {
		self.partitions.iter().map(Partition::len).sum()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::record::Family;

	#[test]
	fn routes_different_keys_to_partitions_independently() {
		let mut config = Config::default();
		config.partitions = 4;
		let cache = PartitionedCache::new(&config);
		let stats = Stats::default();

		let key = Key::for_name("a.test", 0, crate::key::Mark::Ipv4, None);
		let record = Record::build_addr(key.fold(), Family::V4, "a.test", &["1.1.1.1".parse().unwrap()], 30, 0);

		assert!(cache.get(&key).is_none());
		cache.put(&key, record, 0, &stats);
		assert!(cache.get(&key).is_some());
		assert_eq!(cache.total_items(), 1);
	}
}
