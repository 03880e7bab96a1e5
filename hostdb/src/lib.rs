//! An in-process, multi-threaded, partitioned host-resolution cache.
//!
//! [`HostDb`] fronts DNS and a hosts-file shadow for a proxy that needs to turn names (or
//! addresses, for reverse lookups) into a small, pre-sorted array of targets it can hand
//! straight to a connection attempt, with coalesced misses, stale-while-revalidate, address
//! family fallback, and several target-selection policies layered on top of one partitioned,
//! lock-sharded cache.
//!
//! ```no_run
//! use std::sync::Arc;
//! use hostdb::config::Config;
//! use hostdb::dns::mock::MockDnsClient;
//! use hostdb::HostDb;
//!
//! let db = HostDb::new(Config::default(), Arc::new(MockDnsClient::new()));
//! let record = db.resolve_by_name("example.com");
//! let _ = db.stats();
//! ```

pub mod cache;
pub mod config;
pub mod dns;
pub mod hostfile;
pub mod key;
pub mod record;
pub mod selector;
pub mod snapshot;
pub mod stats;

mod resolve;
mod tick;

use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;

use runtime::Clock;

use cache::PartitionedCache;
use config::{Config, FamilyPolicy, SelectionPolicy};
use dns::DnsClient;
use hostfile::HostFileShadow;
use record::{Family, Record};
use resolve::PendingTable;
use stats::{Stats, StatsSnapshot};

pub(crate) struct Inner {
	config: Config,
	cache: PartitionedCache,
	pending: PendingTable,
	dns: Arc<dyn DnsClient>,
	stats: Stats,
	clock: Clock,
	hostfile: Option<HostFileShadow>,
}

/// A handle to one host database. Cheap to clone — every clone shares the same partitions,
/// pending-request table, and background tick thread.
#[derive(Clone)]
pub struct HostDb {
	inner: Arc<Inner>,
}

/// The file a `snapshot_dir` is expected to hold; startup restore and the periodic
/// background writer both target this same path.
pub(crate) fn snapshot_path(dir: &str) -> PathBuf {
	Path::new(dir).join("hostdb.snapshot")
}

impl HostDb {
	/// Builds a database, restoring from `config.snapshot_dir` (if set and a snapshot exists
	/// there) before returning. The background tick then takes over periodic writes.
	pub fn new(config: Config, dns: Arc<dyn DnsClient>) -> Self {
		let hostfile = config.hosts_file.as_ref().map(HostFileShadow::new);
		let cache = PartitionedCache::new(&config);
		let pending = PendingTable::new(config.partitions.max(1));
		let clock = Clock::new();
		let stats = Stats::default();

		if let Some(dir) = &config.snapshot_dir {
			let path = snapshot_path(dir);
			match snapshot::restore(&path, &cache, clock.now(), config.stale_grace, &stats) {
				Ok(restored) => log::info!("restored {restored} hostdb entries from {:?}", path),
				Err(err) if err.kind() == io::ErrorKind::NotFound => {}
				Err(err) => log::warn!("failed to restore hostdb snapshot from {:?}: {err}", path),
			}
		}

		let inner = Arc::new(Inner { config, cache, pending, dns, stats, clock, hostfile });

		tick::spawn(&inner);

		Self { inner }
	}

	/// Spawns the background tick explicitly and returns its handle, for callers that want
	/// to join it on shutdown. [`HostDb::new`] already starts one; this is for tests or
	/// embedders that tore theirs down and want a fresh one.
	pub fn spawn_tick(&self) -> JoinHandle<()> {
		tick::spawn(&self.inner)
	}

	pub fn resolve_by_name(&self, name: &str) -> Record {
		self.resolve_by_name_port(name, 0)
	}

	/// Resolves `name` (optionally qualified by `port`, which only affects the cache key —
	/// it's not part of the DNS query) to an address record, honoring the configured
	/// literal-IP fast path, hosts-file shadow, and family fallback policy, in that order.
	pub fn resolve_by_name_port(&self, name: &str, port: u16) -> Record {
		if let Ok(addr) = name.parse::<IpAddr>() {
			return Record::synth_literal(name, addr);
		}

		let lowered = name.to_lowercase();
		let (primary, fallback) = match self.inner.config.family_policy {
			FamilyPolicy::Ipv4Only => (Family::V4, None),
			FamilyPolicy::Ipv6Only => (Family::V6, None),
			FamilyPolicy::Ipv4Preferred => (Family::V4, Some(Family::V6)),
			FamilyPolicy::Ipv6Preferred => (Family::V6, Some(Family::V4)),
		};

		if let Some(shadow) = &self.inner.hostfile {
			let table = shadow.current();
			for family in [Some(primary), fallback].into_iter().flatten() {
				if let Some(addrs) = table.lookup_forward_family(&lowered, family) {
					let now = self.inner.clock.now();
					return Record::build_addr(0, family, name, &addrs, self.inner.config.hosts_file_poll.as_secs() as u32, now);
				}
			}
		}

		let primary_record = self.inner.resolve_family(name, port, primary);
		if !primary_record.failed() {
			return primary_record;
		}

		match fallback {
			Some(fallback_family) => {
				Stats::incr(&self.inner.stats.family_fallbacks);
				self.inner.resolve_family(name, port, fallback_family)
			}
			None => primary_record,
		}
	}

	pub fn resolve_srv(&self, name: &str) -> Record {
		self.inner.resolve_srv(name)
	}

	/// Reverse lookup, also shadowed by the hosts file before falling through to DNS.
	pub fn resolve_by_addr(&self, addr: IpAddr) -> Record {
		if let Some(shadow) = &self.inner.hostfile {
			if let Some(name) = shadow.current().lookup_reverse(addr) {
				let now = self.inner.clock.now();
				return Record::build_host(0, name, self.inner.config.hosts_file_poll.as_secs() as u32, now);
			}
		}

		self.inner.resolve_reverse(addr)
	}

	/// Picks one target out of `record` using the configured selection policy. `client_ip` is
	/// only consulted under [`SelectionPolicy::ClientAffinity`].
	pub fn select<'a>(&self, record: &'a Record, client_ip: Option<IpAddr>) -> Option<(usize, &'a record::Target)> {
		let now = self.inner.clock.now();
		let mut rng = rand::thread_rng();
		selector::select(
			record,
			self.inner.config.selection_policy,
			self.inner.config.rr_period,
			client_ip,
			now,
			self.inner.config.target_fail_window,
			&mut rng,
			&self.inner.stats,
		)
	}

	/// Snapshots every cached entry across all partitions.
	pub fn iterate(&self) -> Vec<Record> {
		self.inner.cache.iter_all()
	}

	pub fn stats(&self) -> StatsSnapshot {
		self.inner.stats.snapshot()
	}

	pub fn save_snapshot(&self, path: impl AsRef<Path>) -> io::Result<()> {
		let now = self.inner.clock.now();
		snapshot::write(path, &self.inner.cache, now, self.inner.config.snapshot_interval, &self.inner.stats)
	}

	pub fn load_snapshot(&self, path: impl AsRef<Path>) -> io::Result<usize> {
		let now = self.inner.clock.now();
		snapshot::restore(path, &self.inner.cache, now, self.inner.config.stale_grace, &self.inner.stats)
	}

	pub fn config(&self) -> &Config {
		&self.inner.config
	}

	pub fn selection_policy(&self) -> SelectionPolicy {
		self.inner.config.selection_policy
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use dns::mock::MockDnsClient;
	use dns::DnsAnswer;

	fn harness() -> (HostDb, Arc<MockDnsClient>) {
		let dns = Arc::new(MockDnsClient::new());
		let db = HostDb::new(Config::default(), dns.clone());
		(db, dns)
	}

	#[test]
	fn hostfile_entry_shadows_dns_in_both_directions() {
		let path = std::env::temp_dir().join(format!("hostdb-lib-hosts-{}", std::process::id()));
		std::fs::write(&path, "10.0.0.7 local.example\n").unwrap();

		let dns = Arc::new(MockDnsClient::new());
		let config = Config { hosts_file: Some(path.to_string_lossy().into_owned()), ..Config::default() };
		let db = HostDb::new(config, dns.clone());
		db.inner.hostfile.as_ref().unwrap().reload_if_changed();

		let forward = db.resolve_by_name("local.example");
		assert!(!forward.failed());
		assert_eq!(forward.targets()[0].addr(Family::V4), "10.0.0.7".parse::<IpAddr>().unwrap());
		assert_eq!(db.stats().total_lookups, 0, "a hostfile hit never touches the DNS-backed resolution path");

		let reverse = db.resolve_by_addr("10.0.0.7".parse().unwrap());
		assert_eq!(reverse.query_name(), "local.example");

		std::fs::remove_file(&path).ok();
	}

	#[test]
	fn literal_address_bypasses_cache_and_dns() {
		let (db, _dns) = harness();
		let record = db.resolve_by_name("10.1.2.3");
		assert_eq!(record.targets()[0].addr(Family::V4), "10.1.2.3".parse::<IpAddr>().unwrap());
		assert_eq!(db.stats().total_lookups, 0);
	}

	#[test]
	fn cache_miss_then_hit() {
		let (db, dns) = harness();
		dns.set_forward("svc.internal", Family::V4, DnsAnswer::Addrs { addrs: vec!["1.2.3.4".parse().unwrap()], ttl: 30 });

		let first = db.resolve_by_name("svc.internal");
		assert!(!first.failed());
		assert_eq!(db.stats().total_misses, 1);

		let second = db.resolve_by_name("svc.internal");
		assert!(!second.failed());
		assert_eq!(db.stats().total_hits, 1);
	}

	#[test]
	fn failed_primary_family_falls_back() {
		let (db, dns) = harness();
		dns.set_forward("v6only.internal", Family::V6, DnsAnswer::Addrs { addrs: vec!["::1".parse().unwrap()], ttl: 30 });

		let record = db.resolve_by_name("v6only.internal");
		assert!(!record.failed());
		assert_eq!(record.family(), Some(Family::V6));
		assert_eq!(db.stats().family_fallbacks, 1);
	}

	#[test]
	fn unresolvable_name_yields_negative_record() {
		let (db, _dns) = harness();
		let record = db.resolve_by_name("nowhere.invalid");
		assert!(record.failed());
		assert_eq!(db.stats().dns_errors, 2, "both the primary and fallback family attempts fail");
	}

	#[test]
	fn concurrent_resolves_coalesce_onto_one_dns_call() {
		use std::sync::atomic::{AtomicUsize, Ordering};
		use std::sync::Barrier;

		struct CountingClient {
			calls: AtomicUsize,
		}

		impl DnsClient for CountingClient {
			fn gethostbyname(&self, _name: &str, _family: Family, ret: dns::Ret<DnsAnswer>) -> dns::ActionHandle {
				self.calls.fetch_add(1, Ordering::SeqCst);
				std::thread::sleep(std::time::Duration::from_millis(20));
				ret(DnsAnswer::Addrs { addrs: vec!["5.5.5.5".parse().unwrap()], ttl: 30 });
				dns::ActionHandle::next()
			}
			fn getsrvbyname(&self, _name: &str, ret: dns::Ret<DnsAnswer>) -> dns::ActionHandle {
				ret(DnsAnswer::Failed);
				dns::ActionHandle::next()
			}
			fn gethostbyaddr(&self, _addr: IpAddr, ret: dns::Ret<DnsAnswer>) -> dns::ActionHandle {
				ret(DnsAnswer::Failed);
				dns::ActionHandle::next()
			}
			fn cancel(&self, _handle: dns::ActionHandle) {}
		}

		let dns = Arc::new(CountingClient { calls: AtomicUsize::new(0) });
		let db = HostDb::new(Config { family_policy: FamilyPolicy::Ipv4Only, ..Config::default() }, dns.clone());

		let threads = 16;
		let barrier = Arc::new(Barrier::new(threads));
		let mut handles = Vec::new();

		for _ in 0..threads {
			let db = db.clone();
			let barrier = barrier.clone();
			handles.push(std::thread::spawn(move || {
				barrier.wait();
				db.resolve_by_name("coalesced.internal")
			}));
		}

		for h in handles {
			let record = h.join().unwrap();
			assert!(!record.failed());
		}

		assert_eq!(dns.calls.load(Ordering::SeqCst), 1, "all concurrent misses should coalesce onto a single DNS call");
	}

	#[test]
	fn a_failed_refresh_keeps_serving_the_stale_predecessor() {
		use crate::key::{Key, Mark};

		let config = Config { family_policy: FamilyPolicy::Ipv4Only, stale_grace: 30, ..Config::default() };
		let dns = Arc::new(MockDnsClient::new());
		let db = HostDb::new(config, dns.clone());

		let key = Key::for_name("flaky.internal", 0, Mark::Ipv4, None);
		let now = db.inner.clock.now();
		let stale = Record::build_addr(key.fold(), Family::V4, "flaky.internal", &["9.9.9.9".parse().unwrap()], 5, now - 10);
		db.inner.cache.put(&key, stale, now, &db.inner.stats);

		dns.set_forward("flaky.internal", Family::V4, DnsAnswer::Failed);

		let record = db.resolve_by_name("flaky.internal");
		assert!(!record.failed(), "the stale predecessor should still be handed back, not a fresh failed record");
		assert_eq!(record.targets()[0].addr(Family::V4), "9.9.9.9".parse::<IpAddr>().unwrap());

		assert_eq!(db.stats().ttl_expires, 1);
		assert_eq!(db.stats().stale_served, 1);

		std::thread::sleep(std::time::Duration::from_millis(50));
		let after = db.inner.cache.get(&key).unwrap();
		assert_eq!(after.targets()[0].addr(Family::V4), "9.9.9.9".parse::<IpAddr>().unwrap(), "the stale record must not be overwritten with a failed one");
	}
}
