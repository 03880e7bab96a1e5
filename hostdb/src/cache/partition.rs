//! A single cache shard: a dict of fold-keys to slab slots, guarded by one `RwLock` (§4.2).
//!
//! The dict-over-slab split mirrors the hashtable-plus-arena pattern used elsewhere in this
//! codebase for compact, relocation-free storage; here the "hashtable" is an `AHashMap`
//! keyed by the already-hashed fold value rather than the raw key, since [`crate::key::Key`]
//! has already done the hashing work.

use ahash::AHashMap;
use slab::Slab;

use parking_lot::RwLock;

use crate::record::Record;
use crate::stats::Stats;

struct Entry {
	fold: u64,
	record: Record,
}

struct Inner {
	dict: AHashMap<u64, usize>,
	slab: Slab<Entry>,
	bytes: usize,
}

pub struct Partition {
	inner: RwLock<Inner>,
	byte_budget: usize,
	item_budget: usize,
}

fn past_grace(record: &Record, now: i64, grace: u32) -> bool {
	now >= record.response_time() + record.ttl() as i64 + grace as i64
}

impl Partition {
	pub fn new(byte_budget: usize, item_budget: usize) -> Self {
		Self { inner: RwLock::new(Inner { dict: AHashMap::new(), slab: Slab::new(), bytes: 0 }), byte_budget, item_budget }
	}

	pub fn get(&self, fold: u64) -> Option<Record> {
		let inner = self.inner.read();
		inner.dict.get(&fold).map(|&idx| inner.slab[idx].record.clone())
	}

	/// Inserts `record` under `fold`. If the partition is over its byte or item budget after
	/// the insert, expired entries are evicted to make room (§4.2); unexpired entries are never
	/// evicted, so if eviction alone can't make room the just-inserted record is itself dropped
	/// and `stats.failed_inserts` is incremented — the insert is rejected, not any live entry.
	pub fn put(&self, fold: u64, record: Record, now: i64, stats: &Stats) {
		let size = record.marshal().len();
		let mut inner = self.inner.write();

		let ttl = record.ttl();

		if let Some(&idx) = inner.dict.get(&fold) {
			let old_size = inner.slab[idx].record.marshal().len();
			inner.slab[idx].record = record;
			inner.bytes = inner.bytes + size - old_size;
		} else {
			let idx = inner.slab.insert(Entry { fold, record });
			inner.dict.insert(fold, idx);
			inner.bytes += size;
		}

		if !self.make_space(&mut inner, now, stats) {
			if let Some(idx) = inner.dict.remove(&fold) {
				let entry = inner.slab.remove(idx);
				inner.bytes -= entry.record.marshal().len();
			}
			Stats::incr(&stats.failed_inserts);
		} else {
			Stats::incr(&stats.total_inserts);
			Stats::incr_by(&stats.ttl, ttl as u64);
		}
	}

	pub fn erase(&self, fold: u64) -> bool {
		let mut inner = self.inner.write();
		if let Some(idx) = inner.dict.remove(&fold) {
			let entry = inner.slab.remove(idx);
			inner.bytes -= entry.record.marshal().len();
			true
		} else {
			false
		}
	}

	/// Drops entries that have fallen past their stale-while-revalidate grace window
	/// entirely; called from the background tick, not from the hot read/write path.
	pub fn evict_expired(&self, now: i64, grace: u32, stats: &Stats) {
		let mut inner = self.inner.write();
		let doomed: Vec<u64> =
			inner.dict.iter().filter(|&(_, &idx)| past_grace(&inner.slab[idx].record, now, grace)).map(|(&fold, _)| fold).collect();

		for fold in doomed {
			if let Some(idx) = inner.dict.remove(&fold) {
				let entry = inner.slab.remove(idx);
				inner.bytes -= entry.record.marshal().len();
				Stats::incr(&stats.evictions);
			}
		}
	}

	/// Evicts already-expired entries until the partition is back within budget. Returns
	/// `false` if budget is still exceeded once no expired entry remains to evict — the caller
	/// must then reject the insert that triggered this call rather than evict a live entry.
	fn make_space(&self, inner: &mut Inner, now: i64, stats: &Stats) -> bool {
		while inner.bytes > self.byte_budget || inner.slab.len() > self.item_budget {
			let expired = inner.dict.iter().find(|&(_, &idx)| inner.slab[idx].record.is_expired(now)).map(|(&fold, _)| fold);

			let Some(fold) = expired else { return false };
			let idx = inner.dict.remove(&fold).expect("just observed in the dict");
			let entry = inner.slab.remove(idx);
			inner.bytes -= entry.record.marshal().len();
			Stats::incr(&stats.evictions);
		}
		true
	}

	pub fn len(&self) -> usize {
		self.inner.read().slab.len()
	}

	pub fn bytes(&self) -> usize {
		self.inner.read().bytes
	}

	pub fn iter(&self) -> Vec<Record> {
		self.inner.read().slab.iter().map(|(_, entry)| entry.record.clone()).collect()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::record::{Family, Record};

	fn rec(key: u64, ttl: u32, response_time: i64) -> Record {
		Record::build_addr(key, Family::V4, "p.test", &["1.1.1.1".parse().unwrap()], ttl, response_time)
	}

	#[test]
	fn get_put_erase_round_trip() {
		let stats = Stats::default();
		let p = Partition::new(1 << 20, 1024);

		assert!(p.get(1).is_none());
		p.put(1, rec(1, 30, 0), 0, &stats);
		assert!(p.get(1).is_some());
		assert!(p.erase(1));
		assert!(p.get(1).is_none());
	}

	#[test]
	fn item_budget_evicts_only_an_expired_entry() {
		let stats = Stats::default();
		let p = Partition::new(1 << 20, 1);

		p.put(1, rec(1, 10, 0), 0, &stats);
		p.put(2, rec(2, 30, 0), 20, &stats);

		assert!(p.get(1).is_none(), "entry 1 had already expired by the time entry 2 was inserted");
		assert!(p.get(2).is_some());
		assert_eq!(stats.evictions.load(std::sync::atomic::Ordering::Relaxed), 1);
	}

	#[test]
	fn insert_is_rejected_rather_than_evicting_a_live_entry() {
		let stats = Stats::default();
		let p = Partition::new(1 << 20, 1);

		p.put(1, rec(1, 30, 0), 0, &stats);
		p.put(2, rec(2, 30, 0), 5, &stats);

		assert!(p.get(1).is_some(), "the live entry must survive");
		assert!(p.get(2).is_none(), "the new insert is the one rejected");
		assert_eq!(stats.failed_inserts.load(std::sync::atomic::Ordering::Relaxed), 1);
	}

	#[test]
	fn successful_inserts_accumulate_total_inserts_and_ttl_sum() {
		let stats = Stats::default();
		let p = Partition::new(1 << 20, 1024);

		p.put(1, rec(1, 30, 0), 0, &stats);
		p.put(2, rec(2, 60, 0), 0, &stats);

		assert_eq!(stats.total_inserts.load(std::sync::atomic::Ordering::Relaxed), 2);
		assert_eq!(stats.ttl.load(std::sync::atomic::Ordering::Relaxed), 90);
	}

	#[test]
	fn evict_expired_drops_past_grace_only() {
		let stats = Stats::default();
		let p = Partition::new(1 << 20, 1024);
		p.put(1, rec(1, 10, 0), 0, &stats);

		p.evict_expired(15, 30, &stats);
		assert!(p.get(1).is_some(), "still inside the grace window");

		p.evict_expired(100, 30, &stats);
		assert!(p.get(1).is_none(), "grace window has fully elapsed");
	}
}
