//! Process-wide counters exposed for monitoring (§6, §8).

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct Stats {
	pub total_lookups: AtomicU64,
	pub total_hits: AtomicU64,
	pub total_misses: AtomicU64,
	pub coalesced_waiters: AtomicU64,
	pub stale_served: AtomicU64,
	pub family_fallbacks: AtomicU64,
	pub dns_errors: AtomicU64,
	pub evictions: AtomicU64,
	pub failed_inserts: AtomicU64,
	pub zombie_reservations: AtomicU64,
	pub hostfile_reloads: AtomicU64,
	pub snapshot_writes: AtomicU64,
	pub snapshot_restores: AtomicU64,
	/// How many lookups found a cached record whose TTL had already elapsed, whether or not
	/// it was then served stale.
	pub ttl_expires: AtomicU64,
	/// Sum of every accepted record's TTL, for computing a running average TTL.
	pub ttl: AtomicU64,
	pub total_inserts: AtomicU64,
}

impl Stats {
	pub fn snapshot(&self) -> StatsSnapshot {
		StatsSnapshot {
			total_lookups: self.total_lookups.load(Ordering::Relaxed),
			total_hits: self.total_hits.load(Ordering::Relaxed),
			total_misses: self.total_misses.load(Ordering::Relaxed),
			coalesced_waiters: self.coalesced_waiters.load(Ordering::Relaxed),
			stale_served: self.stale_served.load(Ordering::Relaxed),
			family_fallbacks: self.family_fallbacks.load(Ordering::Relaxed),
			dns_errors: self.dns_errors.load(Ordering::Relaxed),
			evictions: self.evictions.load(Ordering::Relaxed),
			failed_inserts: self.failed_inserts.load(Ordering::Relaxed),
			zombie_reservations: self.zombie_reservations.load(Ordering::Relaxed),
			hostfile_reloads: self.hostfile_reloads.load(Ordering::Relaxed),
			snapshot_writes: self.snapshot_writes.load(Ordering::Relaxed),
			snapshot_restores: self.snapshot_restores.load(Ordering::Relaxed),
			ttl_expires: self.ttl_expires.load(Ordering::Relaxed),
			ttl: self.ttl.load(Ordering::Relaxed),
			total_inserts: self.total_inserts.load(Ordering::Relaxed),
		}
	}

	pub(crate) fn incr_by(counter: &AtomicU64, n: u64) {
		counter.fetch_add(n, Ordering::Relaxed);
	}

	pub(crate) fn incr(counter: &AtomicU64) {
		counter.fetch_add(1, Ordering::Relaxed);
	}
}

/// A point-in-time copy of [`Stats`], cheap to hand to a metrics exporter.
#[derive(Clone, Copy, Debug, Default)]
pub struct StatsSnapshot {
	pub total_lookups: u64,
	pub total_hits: u64,
	pub total_misses: u64,
	pub coalesced_waiters: u64,
	pub stale_served: u64,
	pub family_fallbacks: u64,
	pub dns_errors: u64,
	pub evictions: u64,
	pub failed_inserts: u64,
	pub zombie_reservations: u64,
	pub hostfile_reloads: u64,
	pub snapshot_writes: u64,
	pub snapshot_restores: u64,
	pub ttl_expires: u64,
	pub ttl: u64,
	pub total_inserts: u64,
}
