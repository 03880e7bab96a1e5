//! The cached record value (§4.1).
//!
//! A [`Record`] wraps a single reference-counted allocation ([`collections::bytes::rc::Alloc`])
//! holding, back to back: a fixed header, the null-terminated query name padded up to the
//! target array's alignment, the target array itself, and (for SRV records) a blob of
//! null-terminated target names addressed by byte offset from the start of the allocation.
//! Cloning a `Record` bumps the allocation's refcount; it never copies the payload.
//!
//! The header and target structs are laid out by hand with raw pointer arithmetic, the same
//! technique `Alloc` itself uses for its `Meta` prefix, rather than through the derive-based
//! `Cast` marshaling used for the on-disk snapshot format: that framework is built around
//! packed, alignment-1 wire fields, which is the wrong shape for structs that embed atomics
//! the CPU needs to access at their natural alignment.

use std::mem::{align_of, size_of};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::ptr;
use std::slice;
use std::str;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU8, Ordering};

use collections::bytes::rc::Alloc;
use rand::seq::SliceRandom;
use rand::Rng;

fn align_up(n: usize, align: usize) -> usize {
	(n + align - 1) / align * align
}

/// What kind of answer a [`Record`] represents.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum RecordType {
	/// Forward A/AAAA-style answer: a list of addresses.
	Addr = 1,
	/// Forward SRV answer: a list of (priority, weight, port, name) targets.
	Srv = 2,
	/// Reverse answer: a single canonical hostname, no targets.
	Host = 3,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum Family {
	V4 = 0,
	V6 = 1,
}

#[repr(C)]
struct Header {
	key: u64,
	response_time: i64,
	rr_rotation_time: AtomicI64,
	ttl: u32,
	target_count: u32,
	name_len: u32,
	srv_blob_len: u32,
	rr_cursor: AtomicU32,
	record_type: u8,
	family: u8,
	failed: u8,
	_reserved: u8,
}

/// One resolved address or SRV tuple, plus the liveness bookkeeping the selectors mutate.
#[repr(C)]
pub struct Target {
	last_failure: AtomicI64,
	failure_count: AtomicU32,
	http_version: AtomicU8,
	addr: [u8; 16],
	srv_priority: u16,
	srv_weight: u16,
	srv_port: u16,
	srv_name_offset: u32,
	_reserved: u8,
}

impl Target {
	pub fn addr(&self, family: Family) -> IpAddr {
		match family {
			Family::V4 => IpAddr::V4(Ipv4Addr::new(self.addr[0], self.addr[1], self.addr[2], self.addr[3])),
			Family::V6 => IpAddr::V6(Ipv6Addr::from(self.addr)),
		}
	}

	pub fn srv_priority(&self) -> u16 {
		self.srv_priority
	}

	pub fn srv_weight(&self) -> u16 {
		self.srv_weight
	}

	pub fn srv_port(&self) -> u16 {
		self.srv_port
	}

	pub fn failure_count(&self) -> u32 {
		self.failure_count.load(Ordering::Relaxed)
	}

	pub fn http_version(&self) -> u8 {
		self.http_version.load(Ordering::Relaxed)
	}

	pub fn set_http_version(&self, version: u8) {
		self.http_version.store(version, Ordering::Relaxed);
	}

	fn last_failure(&self) -> i64 {
		self.last_failure.load(Ordering::SeqCst)
	}

	/// True if this target has never failed, or its blackout window has lapsed and it has
	/// not yet been handed out as a zombie probe.
	pub fn is_alive(&self) -> bool {
		self.last_failure() == 0
	}

	/// True if this target failed recently enough that it is still in blackout.
	pub fn is_dead(&self, now: i64, fail_window: i64) -> bool {
		let lf = self.last_failure();
		lf != 0 && lf + fail_window >= now
	}

	/// True if this target failed, but its blackout window has elapsed: it is eligible to be
	/// handed out once more as a probe, per the zombie-reservation race in §4.6.
	pub fn is_zombie(&self, now: i64, fail_window: i64) -> bool {
		let lf = self.last_failure();
		lf != 0 && lf + fail_window < now
	}

	/// Attempts to claim this target for use: always succeeds if alive, and succeeds for
	/// exactly one concurrent caller if zombie (the others lose the compare-exchange and must
	/// move on to the next candidate).
	pub fn select(&self, now: i64, fail_window: i64) -> bool {
		let lf = self.last_failure();

		if lf == 0 {
			return true;
		}

		if lf + fail_window >= now {
			return false;
		}

		self.last_failure.compare_exchange(lf, now, Ordering::SeqCst, Ordering::SeqCst).is_ok()
	}

	pub fn mark_down(&self, now: i64) {
		self.last_failure.store(now, Ordering::SeqCst);
		self.failure_count.fetch_add(1, Ordering::Relaxed);
	}

	pub fn mark_up(&self) {
		self.last_failure.store(0, Ordering::SeqCst);
	}
}

fn ip_bytes(ip: IpAddr) -> [u8; 16] {
	match ip {
		IpAddr::V4(v4) => {
			let mut buf = [0u8; 16];
			buf[..4].copy_from_slice(&v4.octets());
			buf
		}
		IpAddr::V6(v6) => v6.octets(),
	}
}

enum TargetInit {
	Addr(IpAddr),
	Srv { priority: u16, weight: u16, port: u16 },
}

/// One SRV candidate as supplied by a resolver, prior to layout.
pub struct SrvEntry {
	pub priority: u16,
	pub weight: u16,
	pub port: u16,
	pub name: String,
}

/// A reference-counted, immutable-except-for-liveness cache entry.
///
/// Cloning is a refcount bump (see [`Alloc::clone`]); every clone observes the same target
/// array, including concurrent liveness updates through the atomic fields.
#[derive(Clone)]
pub struct Record {
	alloc: Alloc,
}

impl Record {
	fn header(&self) -> &Header {
		unsafe { &*self.alloc.base_ptr().as_ptr().cast::<Header>() }
	}

	fn targets_start(&self) -> usize {
		let header_len = size_of::<Header>();
		let name_region = align_up(header_len + self.header().name_len as usize + 1, align_of::<Target>()) - header_len;
		header_len + name_region
	}

	pub fn key(&self) -> u64 {
		self.header().key
	}

	pub fn record_type(&self) -> RecordType {
		match self.header().record_type {
			1 => RecordType::Addr,
			2 => RecordType::Srv,
			_ => RecordType::Host,
		}
	}

	pub fn family(&self) -> Option<Family> {
		match self.header().family {
			0 => Some(Family::V4),
			1 => Some(Family::V6),
			_ => None,
		}
	}

	pub fn ttl(&self) -> u32 {
		self.header().ttl
	}

	pub fn response_time(&self) -> i64 {
		self.header().response_time
	}

	pub fn failed(&self) -> bool {
		self.header().failed != 0
	}

	pub fn is_expired(&self, now: i64) -> bool {
		now >= self.response_time() + self.ttl() as i64
	}

	/// True if `now` still falls inside the stale-while-revalidate grace window.
	pub fn serve_stale_allowed(&self, now: i64, grace_seconds: u32) -> bool {
		grace_seconds != 0 && now < self.response_time() + self.ttl() as i64 + grace_seconds as i64
	}

	pub fn rr_rotation_time(&self) -> i64 {
		self.header().rr_rotation_time.load(Ordering::Relaxed)
	}

	/// Compare-exchange on the timed round-robin rotation timestamp; callers that lose the
	/// race simply use the cursor value the winner installed.
	pub fn try_advance_rotation(&self, observed: i64, new: i64) -> bool {
		self.header()
			.rr_rotation_time
			.compare_exchange(observed, new, Ordering::SeqCst, Ordering::SeqCst)
			.is_ok()
	}

	/// Advances and returns the next round-robin cursor position, modulo the target count.
	pub fn rr_next(&self) -> usize {
		let n = self.targets().len().max(1);
		(self.header().rr_cursor.fetch_add(1, Ordering::Relaxed) as usize) % n
	}

	pub fn rr_cursor(&self) -> usize {
		let n = self.targets().len().max(1);
		(self.header().rr_cursor.load(Ordering::Relaxed) as usize) % n
	}

	pub fn query_name(&self) -> &str {
		let header_len = size_of::<Header>();
		unsafe {
			let ptr = self.alloc.base_ptr().as_ptr().add(header_len);
			let bytes = slice::from_raw_parts(ptr, self.header().name_len as usize);
			str::from_utf8_unchecked(bytes)
		}
	}

	pub fn targets(&self) -> &[Target] {
		let start = self.targets_start();
		unsafe {
			let ptr = self.alloc.base_ptr().as_ptr().add(start).cast::<Target>();
			slice::from_raw_parts(ptr, self.header().target_count as usize)
		}
	}

	/// Resolves a SRV target's name from its stored byte offset.
	pub fn srv_name(&self, target: &Target) -> &str {
		let base = self.alloc.base_ptr().as_ptr();
		let start = target.srv_name_offset as usize;

		unsafe {
			let mut end = start;
			while *base.add(end) != 0 {
				end += 1;
			}
			str::from_utf8_unchecked(slice::from_raw_parts(base.add(start), end - start))
		}
	}

	pub fn find_target(&self, addr: IpAddr) -> Option<&Target> {
		let family = self.family()?;
		self.targets().iter().find(|t| t.addr(family) == addr)
	}

	/// The raw bytes backing this record, suitable for writing verbatim into a snapshot
	/// payload. No pointer fix-ups are needed on restore: every internal reference is a
	/// byte offset relative to the start of this same slice.
	pub fn marshal(&self) -> &[u8] {
		unsafe { slice::from_raw_parts(self.alloc.base_ptr().as_ptr(), self.alloc.len()) }
	}

	/// Rebuilds a record from bytes previously produced by [`Record::marshal`]. Rejects
	/// inputs whose header-declared lengths don't add up to the buffer size, which is the
	/// only validation a memcpy-based restore path can meaningfully perform.
	pub fn unmarshal(bytes: &[u8]) -> Result<Record, ()> {
		if bytes.len() < size_of::<Header>() {
			return Err(());
		}

		let alloc = Alloc::uninit(bytes.len());
		unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), alloc.base_ptr().as_ptr(), bytes.len()) };
		let record = Record { alloc };

		let header_len = size_of::<Header>();
		let h = record.header();
		let name_region = align_up(header_len + h.name_len as usize + 1, align_of::<Target>()) - header_len;
		let targets_total = h.target_count as usize * size_of::<Target>();
		let expected = header_len + name_region + targets_total + h.srv_blob_len as usize;

		if expected != bytes.len() {
			return Err(());
		}

		Ok(record)
	}

	fn build(
		key: u64,
		record_type: RecordType,
		family: Option<Family>,
		query_name: &str,
		targets: &[TargetInit],
		srv_names: &[&str],
		ttl: u32,
		response_time: i64,
		failed: bool,
	) -> Record {
		let header_len = size_of::<Header>();
		let name_bytes = query_name.as_bytes();
		let name_region = align_up(header_len + name_bytes.len() + 1, align_of::<Target>()) - header_len;
		let targets_start = header_len + name_region;
		let targets_total = targets.len() * size_of::<Target>();
		let srv_blob_start = targets_start + targets_total;

		let mut srv_blob = Vec::new();
		let mut srv_offsets = Vec::with_capacity(srv_names.len());
		for name in srv_names {
			srv_offsets.push(srv_blob_start + srv_blob.len());
			srv_blob.extend_from_slice(name.as_bytes());
			srv_blob.push(0);
		}

		let total = srv_blob_start + srv_blob.len();
		let alloc = Alloc::zeroed(total);
		let base = alloc.base_ptr().as_ptr();

		unsafe {
			base.cast::<Header>().write(Header {
				key,
				response_time,
				rr_rotation_time: AtomicI64::new(0),
				ttl,
				target_count: targets.len() as u32,
				name_len: name_bytes.len() as u32,
				srv_blob_len: srv_blob.len() as u32,
				rr_cursor: AtomicU32::new(0),
				record_type: record_type as u8,
				family: family.map(|f| f as u8).unwrap_or(0xFF),
				failed: failed as u8,
				_reserved: 0,
			});

			let name_ptr = base.add(header_len);
			ptr::copy_nonoverlapping(name_bytes.as_ptr(), name_ptr, name_bytes.len());
			*name_ptr.add(name_bytes.len()) = 0;

			let targets_ptr = base.add(targets_start).cast::<Target>();
			for (i, t) in targets.iter().enumerate() {
				let (addr, priority, weight, port, name_offset) = match *t {
					TargetInit::Addr(ip) => (ip_bytes(ip), 0, 0, 0, 0),
					TargetInit::Srv { priority, weight, port } => ([0u8; 16], priority, weight, port, srv_offsets[i] as u32),
				};

				targets_ptr.add(i).write(Target {
					last_failure: AtomicI64::new(0),
					failure_count: AtomicU32::new(0),
					http_version: AtomicU8::new(0),
					addr,
					srv_priority: priority,
					srv_weight: weight,
					srv_port: port,
					srv_name_offset: name_offset,
					_reserved: 0,
				});
			}

			if !srv_blob.is_empty() {
				ptr::copy_nonoverlapping(srv_blob.as_ptr(), base.add(srv_blob_start), srv_blob.len());
			}
		}

		Record { alloc }
	}

	pub fn build_addr(key: u64, family: Family, query_name: &str, addrs: &[IpAddr], ttl: u32, response_time: i64) -> Record {
		let targets: Vec<TargetInit> = addrs.iter().map(|a| TargetInit::Addr(*a)).collect();
		Self::build(key, RecordType::Addr, Some(family), query_name, &targets, &[], ttl, response_time, false)
	}

	/// Sorts by priority ascending with a randomized tie-break, decided once at construction
	/// time so rotation within a priority tier still has weighted-random flavor (§4.6).
	pub fn build_srv(
		key: u64,
		query_name: &str,
		entries: &[SrvEntry],
		ttl: u32,
		response_time: i64,
		rng: &mut impl Rng,
	) -> Record {
		let mut order: Vec<usize> = (0..entries.len()).collect();
		order.shuffle(rng);
		order.sort_by_key(|&i| entries[i].priority);

		let targets: Vec<TargetInit> = order
			.iter()
			.map(|&i| TargetInit::Srv { priority: entries[i].priority, weight: entries[i].weight, port: entries[i].port })
			.collect();
		let names: Vec<&str> = order.iter().map(|&i| entries[i].name.as_str()).collect();

		Self::build(key, RecordType::Srv, None, query_name, &targets, &names, ttl, response_time, false)
	}

	pub fn build_host(key: u64, query_name: &str, ttl: u32, response_time: i64) -> Record {
		Self::build(key, RecordType::Host, None, query_name, &[], &[], ttl, response_time, false)
	}

	pub fn build_failed(
		key: u64,
		record_type: RecordType,
		family: Option<Family>,
		query_name: &str,
		fail_ttl: u32,
		response_time: i64,
	) -> Record {
		Self::build(key, record_type, family, query_name, &[], &[], fail_ttl, response_time, true)
	}

	/// A one-off record for a literal address query: never inserted into the cache, never
	/// expires (§4.4 `SYNTH_LITERAL`).
	pub fn synth_literal(query_name: &str, addr: IpAddr) -> Record {
		let family = match addr {
			IpAddr::V4(_) => Family::V4,
			IpAddr::V6(_) => Family::V6,
		};
		Self::build(0, RecordType::Addr, Some(family), query_name, &[TargetInit::Addr(addr)], &[], u32::MAX, 0, false)
	}
}

/// Copies liveness state (last-failure timestamp, failure count, HTTP version hint) from a
/// predecessor record's targets onto the matching targets of a freshly resolved one, so a
/// routine re-resolution doesn't forget that a target was recently misbehaving (§4.4).
pub fn migrate_liveness(old: &Record, new: &Record) {
	match (old.record_type(), new.record_type()) {
		(RecordType::Addr, RecordType::Addr) => {
			let Some(family) = new.family() else { return };
			for new_target in new.targets() {
				let addr = new_target.addr(family);
				if let Some(old_target) = old.find_target(addr) {
					carry_over(old_target, new_target);
				}
			}
		}
		(RecordType::Srv, RecordType::Srv) => {
			for new_target in new.targets() {
				let matched = old.targets().iter().find(|t| {
					t.srv_priority() == new_target.srv_priority()
						&& t.srv_weight() == new_target.srv_weight()
						&& t.srv_port() == new_target.srv_port()
						&& old.srv_name(t) == new.srv_name(new_target)
				});
				if let Some(old_target) = matched {
					carry_over(old_target, new_target);
				}
			}
		}
		_ => {}
	}
}

fn carry_over(old: &Target, new: &Target) {
	let lf = old.last_failure();
	if lf != 0 {
		new.last_failure.store(lf, Ordering::SeqCst);
		new.failure_count.store(old.failure_count(), Ordering::Relaxed);
	}
	new.set_http_version(old.http_version());
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn addr_round_trip() {
		let addrs: Vec<IpAddr> = vec!["10.0.0.1".parse().unwrap(), "10.0.0.2".parse().unwrap()];
		let record = Record::build_addr(42, Family::V4, "host.example", &addrs, 60, 1000);

		assert_eq!(record.key(), 42);
		assert_eq!(record.ttl(), 60);
		assert_eq!(record.query_name(), "host.example");
		assert_eq!(record.targets().len(), 2);
		assert_eq!(record.targets()[0].addr(Family::V4), addrs[0]);
		assert!(!record.is_expired(1000));
		assert!(record.is_expired(1061));
	}

	#[test]
	fn marshal_unmarshal_round_trip() {
		let addrs: Vec<IpAddr> = vec!["192.168.1.1".parse().unwrap()];
		let record = Record::build_addr(7, Family::V4, "x.test", &addrs, 30, 500);
		let bytes = record.marshal().to_vec();

		let restored = Record::unmarshal(&bytes).expect("well-formed marshal output unmarshals");
		assert_eq!(restored.key(), 7);
		assert_eq!(restored.query_name(), "x.test");
		assert_eq!(restored.targets()[0].addr(Family::V4), addrs[0]);
	}

	#[test]
	fn unmarshal_rejects_truncated_input() {
		let record = Record::build_addr(1, Family::V4, "y.test", &["1.2.3.4".parse().unwrap()], 30, 0);
		let bytes = record.marshal();
		assert!(Record::unmarshal(&bytes[..bytes.len() - 1]).is_err());
	}

	#[test]
	fn srv_ordering_and_names() {
		let entries = vec![
			SrvEntry { priority: 10, weight: 1, port: 443, name: "b.example".into() },
			SrvEntry { priority: 0, weight: 1, port: 443, name: "a.example".into() },
		];
		let mut rng = rand::thread_rng();
		let record = Record::build_srv(1, "_svc._tcp.example", &entries, 60, 0, &mut rng);

		assert_eq!(record.targets()[0].srv_priority(), 0);
		assert_eq!(record.srv_name(&record.targets()[0]), "a.example");
		assert_eq!(record.targets()[1].srv_priority(), 10);
	}

	#[test]
	fn select_reserves_a_zombie_for_exactly_one_caller() {
		let record = Record::build_addr(1, Family::V4, "z.test", &["1.1.1.1".parse().unwrap()], 30, 0);
		let target = &record.targets()[0];

		target.mark_down(100);
		assert!(!target.select(110, 30), "still inside the blackout window");
		assert!(target.select(200, 30), "blackout has lapsed, target is a zombie");
		assert!(!target.select(200, 30), "a second caller must lose the race");
	}

	#[test]
	fn liveness_migrates_across_re_resolution() {
		let old = Record::build_addr(1, Family::V4, "m.test", &["1.1.1.1".parse().unwrap()], 30, 0);
		old.targets()[0].mark_down(100);

		let fresh = Record::build_addr(1, Family::V4, "m.test", &["1.1.1.1".parse().unwrap()], 30, 200);
		migrate_liveness(&old, &fresh);

		assert!(fresh.targets()[0].is_dead(110, 30));
	}
}
