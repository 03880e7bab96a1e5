//! Target-selection algorithms over a record's target array (§4.6).
//!
//! Every algorithm here composes with [`Target::select`], which is what actually enforces
//! liveness and the zombie-reservation race; the algorithms only decide *which* target to
//! offer `select` first, and what to try next if it's rejected.

use std::net::IpAddr;
use std::time::Duration;

use rand::Rng;

use crate::config::SelectionPolicy;
use crate::record::{Family, Record, Target};
use crate::stats::Stats;

/// Mirrors the original's byte-wise XOR mixing hash between a client address and a target
/// address, keeping only the top 16 bits. Addresses of differing families hash to the
/// maximum value uniformly, matching the original's behavior for that mismatched case.
fn client_ip_hash(client: IpAddr, target: IpAddr) -> u32 {
	match (client, target) {
		(IpAddr::V4(c), IpAddr::V4(t)) => {
			let ip1 = u32::from_be_bytes(c.octets());
			let ip2 = u32::from_be_bytes(t.octets());
			((ip1 >> 16) ^ ip1 ^ ip2 ^ (ip2 >> 16)) & 0xFFFF
		}
		(IpAddr::V6(c), IpAddr::V6(t)) => {
			let c_octets = c.octets();
			let t_octets = t.octets();
			let mut zret = !0u32;
			for i in 0..4 {
				let ip1 = u32::from_be_bytes(c_octets[i * 4..i * 4 + 4].try_into().unwrap());
				let ip2 = u32::from_be_bytes(t_octets[i * 4..i * 4 + 4].try_into().unwrap());
				zret ^= (ip1 >> 16) ^ ip1 ^ ip2 ^ (ip2 >> 16);
			}
			zret & 0xFFFF
		}
		_ => 0xFFFF,
	}
}

/// Walks the target array starting at `start`, accepting the first target that wins
/// [`Target::select`]. Used by both round-robin variants and client affinity, which differ
/// only in how `start` is chosen.
fn select_from(record: &Record, start: usize, now: i64, fail_window: i64, stats: &Stats) -> Option<(usize, &Target)> {
	let targets = record.targets();
	let n = targets.len();
	if n == 0 {
		return None;
	}

	for step in 0..n {
		let idx = (start + step) % n;
		let was_zombie = targets[idx].is_zombie(now, fail_window);
		if targets[idx].select(now, fail_window) {
			if was_zombie {
				Stats::incr(&stats.zombie_reservations);
			}
			return Some((idx, &targets[idx]));
		}
	}

	None
}

fn strict_round_robin(record: &Record, now: i64, fail_window: i64, stats: &Stats) -> Option<(usize, &Target)> {
	select_from(record, record.rr_next(), now, fail_window, stats)
}

/// Only advances the shared cursor once per `period`; callers who land between rotations
/// share the previous winner, then fall through the same failure walk as strict RR.
fn timed_round_robin(record: &Record, period: Duration, now: i64, fail_window: i64, stats: &Stats) -> Option<(usize, &Target)> {
	let period_secs = period.as_secs() as i64;
	let rotation_time = record.rr_rotation_time();

	if period_secs <= 0 || now >= rotation_time + period_secs {
		let _ = record.try_advance_rotation(rotation_time, now);
		return select_from(record, record.rr_next(), now, fail_window, stats);
	}

	select_from(record, record.rr_cursor(), now, fail_window, stats)
}

/// Hashes the client IP against every target's IP and picks the target with the maximum
/// hash (ties going to the lower index); only moves off it when that target is unavailable.
fn client_affinity(record: &Record, client_ip: IpAddr, now: i64, fail_window: i64, stats: &Stats) -> Option<(usize, &Target)> {
	let targets = record.targets();
	if targets.is_empty() {
		return None;
	}
	let family = record.family().unwrap_or(Family::V4);

	let mut best_idx = 0;
	let mut best_hash = client_ip_hash(client_ip, targets[0].addr(family));
	for (idx, target) in targets.iter().enumerate().skip(1) {
		let h = client_ip_hash(client_ip, target.addr(family));
		if h > best_hash {
			best_hash = h;
			best_idx = idx;
		}
	}

	select_from(record, best_idx, now, fail_window, stats)
}

/// RFC 2782-style priority/weight selection. Targets are assumed sorted ascending by
/// priority, as [`Record::build_srv`] lays them out. Tries the lowest surviving priority
/// tier first; within a tier, a target's chance of being picked is proportional to its
/// weight among the tier's currently eligible (alive or zombie) targets.
fn srv_weighted(record: &Record, now: i64, fail_window: i64, rng: &mut impl Rng, stats: &Stats) -> Option<(usize, &Target)> {
	let targets = record.targets();
	if targets.is_empty() {
		return None;
	}

	let mut i = 0;
	while i < targets.len() {
		let priority = targets[i].srv_priority();
		let mut j = i;
		while j < targets.len() && targets[j].srv_priority() == priority {
			j += 1;
		}

		let tier = &targets[i..j];
		let eligible: Vec<usize> = (i..j).filter(|&k| !targets[k].is_dead(now, fail_window)).collect();

		if !eligible.is_empty() {
			let total_weight: u32 = eligible.iter().map(|&k| targets[k].srv_weight() as u32 + 1).sum();
			let mut pick = rng.gen_range(0..total_weight);

			for &k in &eligible {
				let w = targets[k].srv_weight() as u32 + 1;
				if pick < w {
					let was_zombie = targets[k].is_zombie(now, fail_window);
					if targets[k].select(now, fail_window) {
						if was_zombie {
							Stats::incr(&stats.zombie_reservations);
						}
						return Some((k, &targets[k]));
					}
					// Lost the zombie-reservation race; fall through to a plain scan of the
					// rest of the tier so this lookup still resolves.
					return select_from_range(record, i, j, now, fail_window, stats);
				}
				pick -= w;
			}
		}

		let _ = tier;
		i = j;
	}

	None
}

fn select_from_range(record: &Record, start: usize, end: usize, now: i64, fail_window: i64, stats: &Stats) -> Option<(usize, &Target)> {
	let targets = record.targets();
	for idx in start..end {
		let was_zombie = targets[idx].is_zombie(now, fail_window);
		if targets[idx].select(now, fail_window) {
			if was_zombie {
				Stats::incr(&stats.zombie_reservations);
			}
			return Some((idx, &targets[idx]));
		}
	}
	None
}

/// Picks one target out of `record` according to `policy`. Returns `None` if every target is
/// currently dead (still within its failure blackout window).
pub fn select<'a>(
	record: &'a Record,
	policy: SelectionPolicy,
	rr_period: Duration,
	client_ip: Option<IpAddr>,
	now: i64,
	fail_window: i64,
	rng: &mut impl Rng,
	stats: &Stats,
) -> Option<(usize, &'a Target)> {
	match policy {
		SelectionPolicy::StrictRoundRobin => strict_round_robin(record, now, fail_window, stats),
		SelectionPolicy::TimedRoundRobin => timed_round_robin(record, rr_period, now, fail_window, stats),
		SelectionPolicy::ClientAffinity => {
			client_affinity(record, client_ip.unwrap_or(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED)), now, fail_window, stats)
		}
		SelectionPolicy::SrvWeighted => srv_weighted(record, now, fail_window, rng, stats),
	}
}

#[cfg(test)]
mod tests {
	use std::net::IpAddr;

	use super::*;
	use crate::record::{Family, SrvEntry};

	#[test]
	fn strict_round_robin_advances_every_call() {
		let addrs: Vec<IpAddr> = vec!["1.1.1.1".parse().unwrap(), "1.1.1.2".parse().unwrap(), "1.1.1.3".parse().unwrap()];
		let record = Record::build_addr(1, Family::V4, "rr.test", &addrs, 30, 0);
		let mut rng = rand::thread_rng();

		let stats = Stats::default();
		let mut seen = Vec::new();
		for _ in 0..3 {
			let (idx, _) = select(&record, SelectionPolicy::StrictRoundRobin, Duration::from_secs(1), None, 0, 10, &mut rng, &stats).unwrap();
			seen.push(idx);
		}
		assert_eq!(seen, vec![0, 1, 2]);
	}

	#[test]
	fn dead_target_is_skipped() {
		let addrs: Vec<IpAddr> = vec!["1.1.1.1".parse().unwrap(), "1.1.1.2".parse().unwrap()];
		let record = Record::build_addr(1, Family::V4, "rr2.test", &addrs, 30, 0);
		record.targets()[0].mark_down(0);
		let mut rng = rand::thread_rng();
		let stats = Stats::default();

		let (idx, _) = select(&record, SelectionPolicy::StrictRoundRobin, Duration::from_secs(1), None, 5, 10, &mut rng, &stats).unwrap();
		assert_eq!(idx, 1);
	}

	#[test]
	fn affinity_picks_the_target_with_the_highest_client_ip_hash() {
		let addrs: Vec<IpAddr> = vec!["1.1.1.1".parse().unwrap(), "1.1.1.2".parse().unwrap()];
		let record = Record::build_addr(1, Family::V4, "aff.test", &addrs, 30, 0);
		let mut rng = rand::thread_rng();
		let stats = Stats::default();
		let client: IpAddr = "0.0.0.0".parse().unwrap();

		let (idx, _) =
			select(&record, SelectionPolicy::ClientAffinity, Duration::from_secs(1), Some(client), 0, 10, &mut rng, &stats).unwrap();
		assert_eq!(idx, 1, "1.1.1.2 hashes higher against 0.0.0.0 than 1.1.1.1 does");
	}

	#[test]
	fn affinity_is_sticky_until_failure() {
		let addrs: Vec<IpAddr> = vec!["1.1.1.1".parse().unwrap(), "1.1.1.2".parse().unwrap(), "1.1.1.3".parse().unwrap()];
		let record = Record::build_addr(1, Family::V4, "aff2.test", &addrs, 30, 0);
		let mut rng = rand::thread_rng();
		let stats = Stats::default();
		let client: IpAddr = "203.0.113.7".parse().unwrap();

		let (first, _) =
			select(&record, SelectionPolicy::ClientAffinity, Duration::from_secs(1), Some(client), 0, 10, &mut rng, &stats).unwrap();
		let (second, _) =
			select(&record, SelectionPolicy::ClientAffinity, Duration::from_secs(1), Some(client), 0, 10, &mut rng, &stats).unwrap();
		assert_eq!(first, second);
	}

	#[test]
	fn srv_weighted_prefers_lowest_priority_tier() {
		let entries = vec![
			SrvEntry { priority: 0, weight: 1, port: 80, name: "a.test".into() },
			SrvEntry { priority: 10, weight: 1, port: 80, name: "b.test".into() },
		];
		let mut rng = rand::thread_rng();
		let record = Record::build_srv(1, "_s._tcp.test", &entries, 30, 0, &mut rng);
		let stats = Stats::default();

		let (idx, _) = select(&record, SelectionPolicy::SrvWeighted, Duration::from_secs(1), None, 0, 10, &mut rng, &stats).unwrap();
		assert_eq!(record.targets()[idx].srv_priority(), 0);
	}

	#[test]
	fn reserving_a_zombie_target_counts_as_a_zombie_reservation() {
		let addrs: Vec<IpAddr> = vec!["1.1.1.1".parse().unwrap()];
		let record = Record::build_addr(1, Family::V4, "zombie.test", &addrs, 30, 0);
		record.targets()[0].mark_down(0);
		let mut rng = rand::thread_rng();
		let stats = Stats::default();

		// Past the fail window the target is a zombie: eligible for one probing reservation.
		let result = select(&record, SelectionPolicy::StrictRoundRobin, Duration::from_secs(1), None, 100, 10, &mut rng, &stats);
		assert!(result.is_some());
		assert_eq!(stats.zombie_reservations.load(std::sync::atomic::Ordering::Relaxed), 1);
	}
}
