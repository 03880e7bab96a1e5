//! The resolution state machine (§4.4): cache hit, stale-while-revalidate, coalesced miss,
//! family fallback, and negative caching all live here. The state machine itself is
//! expressed as plain control flow rather than an explicit enum of states — each branch
//! below corresponds to one transition out of `NEW` in the spec's state diagram, and the
//! DNS continuation closures correspond to the `DNS_DONE_OK`/`DNS_DONE_FAIL` transitions.

use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::dns::{ActionHandle, DnsAnswer};
use crate::key::{Key, Mark};
use crate::record::{migrate_liveness, Family, Record, RecordType, SrvEntry};
use crate::stats::Stats;
use crate::Inner;

type Waiter = Box<dyn FnOnce(Record) + Send>;

/// Per-partition map from in-flight fold value to the waiters blocked on it. A caller that
/// finds an existing entry joins it (and is woken by the leader); a caller that creates the
/// entry becomes the leader responsible for firing the DNS request.
///
/// Waiters are removed under the same lock a join registers under, which is what prevents
/// the race between a stale-while-revalidate completing and a brand new waiter joining a
/// group that's already been drained: either the new caller observes the group still present
/// (and joins it) or observes it gone (and starts a fresh one), never a group that's present
/// but will never be drained.
pub(crate) struct PendingTable {
	shards: Vec<Mutex<HashMap<u64, Vec<Waiter>>>>,
}

impl PendingTable {
	pub(crate) fn new(shard_count: usize) -> Self {
		Self { shards: (0..shard_count.max(1)).map(|_| Mutex::new(HashMap::new())).collect() }
	}

	fn shard(&self, fold: u64) -> &Mutex<HashMap<u64, Vec<Waiter>>> {
		&self.shards[(fold as usize) % self.shards.len()]
	}

	/// Registers `waiter` for `fold`. Returns `true` if the caller is now responsible for
	/// kicking off the DNS request (it was the first to join).
	fn join_or_lead(&self, fold: u64, waiter: Waiter) -> bool {
		let mut shard = self.shard(fold).lock();
		match shard.get_mut(&fold) {
			Some(waiters) => {
				waiters.push(waiter);
				false
			}
			None => {
				shard.insert(fold, vec![waiter]);
				true
			}
		}
	}

	fn take(&self, fold: u64) -> Vec<Waiter> {
		self.shard(fold).lock().remove(&fold).unwrap_or_default()
	}
}

fn mark_for(family: Family) -> Mark {
	match family {
		Family::V4 => Mark::Ipv4,
		Family::V6 => Mark::Ipv6,
	}
}

impl Inner {
	/// Forward lookup for one address family: cache hit, stale-while-revalidate, or a
	/// coalesced blocking resolve. Always returns a record — DNS failure becomes a
	/// short-TTL negative (`failed`) record rather than `None`, so callers and the cache
	/// never have to special-case "no answer yet".
	pub(crate) fn resolve_family(self: &Arc<Self>, name: &str, port: u16, family: Family) -> Record {
		let key = Key::for_name(name, port, mark_for(family), self.config.split_dns_tag.as_deref());
		Stats::incr(&self.stats.total_lookups);
		let now = self.clock.now();

		if let Some(cached) = self.cache.get(&key) {
			if !cached.is_expired(now) {
				Stats::incr(&self.stats.total_hits);
				return cached;
			}

			Stats::incr(&self.stats.ttl_expires);

			if cached.serve_stale_allowed(now, self.config.stale_grace) {
				Stats::incr(&self.stats.stale_served);
				self.trigger_background_refresh_addr(key, name.to_string(), family);
				return cached;
			}
		}

		Stats::incr(&self.stats.total_misses);
		self.blocking_resolve(key, move |inner, ret| {
			inner.fire_dns_addr(key, name.to_string(), family, ret);
		})
	}

	/// SRV lookup; same coalescing/stale machinery as [`Inner::resolve_family`], without the
	/// family-fallback wrapper since SRV has no address-family concept.
	pub(crate) fn resolve_srv(self: &Arc<Self>, name: &str) -> Record {
		let key = Key::for_name(name, 0, Mark::Srv, self.config.split_dns_tag.as_deref());
		Stats::incr(&self.stats.total_lookups);
		let now = self.clock.now();

		if let Some(cached) = self.cache.get(&key) {
			if !cached.is_expired(now) {
				Stats::incr(&self.stats.total_hits);
				return cached;
			}

			Stats::incr(&self.stats.ttl_expires);

			if cached.serve_stale_allowed(now, self.config.stale_grace) {
				Stats::incr(&self.stats.stale_served);
				self.trigger_background_refresh_srv(key, name.to_string());
				return cached;
			}
		}

		Stats::incr(&self.stats.total_misses);
		self.blocking_resolve(key, move |inner, ret| {
			inner.fire_dns_srv(key, name.to_string(), ret);
		})
	}

	/// Reverse lookup: address to canonical name.
	pub(crate) fn resolve_reverse(self: &Arc<Self>, addr: std::net::IpAddr) -> Record {
		let key = Key::for_addr(addr);
		Stats::incr(&self.stats.total_lookups);
		let now = self.clock.now();

		if let Some(cached) = self.cache.get(&key) {
			if !cached.is_expired(now) {
				Stats::incr(&self.stats.total_hits);
				return cached;
			}

			Stats::incr(&self.stats.ttl_expires);

			if cached.serve_stale_allowed(now, self.config.stale_grace) {
				Stats::incr(&self.stats.stale_served);
				self.trigger_background_refresh_reverse(key, addr);
				return cached;
			}
		}

		Stats::incr(&self.stats.total_misses);
		self.blocking_resolve(key, move |inner, ret| {
			inner.fire_dns_reverse(key, addr, ret);
		})
	}

	fn blocking_resolve(self: &Arc<Self>, key: Key, fire: impl FnOnce(&Arc<Self>, crate::dns::Ret<Record>)) -> Record {
		let (tx, rx) = mpsc::channel();
		let fold = key.fold();
		let waiter: Waiter = Box::new(move |record| {
			let _ = tx.send(record);
		});

		let leader = self.pending.join_or_lead(fold, waiter);

		if leader {
			let this = Arc::clone(self);
			fire(&this, Box::new(move |record| {
				for waiter in this.pending.take(fold) {
					waiter(record.clone());
				}
			}));
		} else {
			Stats::incr(&self.stats.coalesced_waiters);
		}

		rx.recv().expect("the leader for this pending group always publishes a record")
	}

	fn fire_dns_addr(self: &Arc<Self>, key: Key, name: String, family: Family, ret: crate::dns::Ret<Record>) {
		let this = Arc::clone(self);
		let old = self.cache.get(&key);
		let fold = key.fold();

		let completion: crate::dns::Ret<DnsAnswer> = Box::new(move |answer| {
			let now = runtime::unix_now();

			let record = match answer {
				DnsAnswer::Addrs { addrs, ttl } if !addrs.is_empty() => {
					Record::build_addr(fold, family, &name, &addrs, this.config.reconcile_ttl(ttl), now)
				}
				_ => {
					log::debug!("gethostbyname({name}, {family:?}) returned no usable address");
					Stats::incr(&this.stats.dns_errors);

					if let Some(old) = &old {
						if old.serve_stale_allowed(now, this.config.stale_grace) {
							ret(old.clone());
							return;
						}
					}

					Record::build_failed(fold, RecordType::Addr, Some(family), &name, this.config.fail_ttl, now)
				}
			};

			if let Some(old) = &old {
				migrate_liveness(old, &record);
			}

			this.cache.put(&key, record.clone(), now, &this.stats);
			ret(record);
		});

		self.dns.gethostbyname(&name, family, completion);
	}

	fn fire_dns_srv(self: &Arc<Self>, key: Key, name: String, ret: crate::dns::Ret<Record>) {
		let this = Arc::clone(self);
		let old = self.cache.get(&key);
		let fold = key.fold();

		let completion: crate::dns::Ret<DnsAnswer> = Box::new(move |answer| {
			let now = runtime::unix_now();

			let record = match answer {
				DnsAnswer::Srv { entries, ttl } if !entries.is_empty() => {
					let srv_entries: Vec<SrvEntry> =
						entries.into_iter().map(|e| SrvEntry { priority: e.priority, weight: e.weight, port: e.port, name: e.name }).collect();
					let mut rng = rand::thread_rng();
					Record::build_srv(fold, &name, &srv_entries, this.config.reconcile_ttl(ttl), now, &mut rng)
				}
				_ => {
					log::debug!("getsrvbyname({name}) returned no usable target");
					Stats::incr(&this.stats.dns_errors);

					if let Some(old) = &old {
						if old.serve_stale_allowed(now, this.config.stale_grace) {
							ret(old.clone());
							return;
						}
					}

					Record::build_failed(fold, RecordType::Srv, None, &name, this.config.fail_ttl, now)
				}
			};

			if let Some(old) = &old {
				migrate_liveness(old, &record);
			}

			this.cache.put(&key, record.clone(), now, &this.stats);
			ret(record);
		});

		self.dns.getsrvbyname(&name, completion);
	}

	fn fire_dns_reverse(self: &Arc<Self>, key: Key, addr: std::net::IpAddr, ret: crate::dns::Ret<Record>) {
		let this = Arc::clone(self);
		let old = self.cache.get(&key);
		let fold = key.fold();

		let completion: crate::dns::Ret<DnsAnswer> = Box::new(move |answer| {
			let now = runtime::unix_now();

			let record = match answer {
				DnsAnswer::Name { name, ttl } => Record::build_host(fold, &name, this.config.reconcile_ttl(ttl), now),
				_ => {
					log::debug!("gethostbyaddr({addr}) returned no canonical name");
					Stats::incr(&this.stats.dns_errors);

					if let Some(old) = &old {
						if old.serve_stale_allowed(now, this.config.stale_grace) {
							ret(old.clone());
							return;
						}
					}

					Record::build_failed(fold, RecordType::Host, None, &addr.to_string(), this.config.fail_ttl, now)
				}
			};

			this.cache.put(&key, record.clone(), now, &this.stats);
			ret(record);
		});

		self.dns.gethostbyaddr(addr, completion);
	}

	/// Kicks off a non-blocking refresh behind a stale-served answer, without making any
	/// caller wait on it. Coalesces with a concurrent miss on the same key the same way a
	/// blocking resolve would, via `join_or_lead`, so a refresh never duplicates an
	/// in-flight DNS request another caller already started.
	fn trigger_background_refresh_addr(self: &Arc<Self>, key: Key, name: String, family: Family) {
		let fold = key.fold();
		if !self.pending.join_or_lead(fold, Box::new(|_| {})) {
			return;
		}
		let this = Arc::clone(self);
		this.fire_dns_addr(key, name, family, Box::new(move |record| {
			for waiter in this.pending.take(fold) {
				waiter(record.clone());
			}
		}));
	}

	fn trigger_background_refresh_srv(self: &Arc<Self>, key: Key, name: String) {
		let fold = key.fold();
		if !self.pending.join_or_lead(fold, Box::new(|_| {})) {
			return;
		}
		let this = Arc::clone(self);
		this.fire_dns_srv(key, name, Box::new(move |record| {
			for waiter in this.pending.take(fold) {
				waiter(record.clone());
			}
		}));
	}

	fn trigger_background_refresh_reverse(self: &Arc<Self>, key: Key, addr: std::net::IpAddr) {
		let fold = key.fold();
		if !self.pending.join_or_lead(fold, Box::new(|_| {})) {
			return;
		}
		let this = Arc::clone(self);
		this.fire_dns_reverse(key, addr, Box::new(move |record| {
			for waiter in this.pending.take(fold) {
				waiter(record.clone());
			}
		}));
	}
}

#[allow(unused)]
pub(crate) type DnsActionHandle = ActionHandle;
