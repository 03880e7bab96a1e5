//! On-disk snapshot format (§4.7): a warm-start optimization, not a source of truth. All
//! integers are little-endian; a record's payload is its [`Record::marshal`] output written
//! back verbatim, so restore is a straight `memcpy` plus a size-bucket sanity check — the
//! same validation [`Record::unmarshal`] already performs.
//!
//! Writes go to `<path>.syncing`, get `fsync`'d, then are atomically renamed over `<path>`,
//! so a reader (including a concurrent restore in another process) never observes a
//! partially-written file.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::thread;
use std::time::Duration;

use crate::cache::PartitionedCache;
use crate::stats::Stats;

const MAGIC: &[u8; 8] = b"HOSTDB01";
const VERSION: u32 = 1;

fn write_u32(out: &mut impl Write, v: u32) -> io::Result<()> {
	out.write_all(&v.to_le_bytes())
}

fn write_u64(out: &mut impl Write, v: u64) -> io::Result<()> {
	out.write_all(&v.to_le_bytes())
}

fn write_i64(out: &mut impl Write, v: i64) -> io::Result<()> {
	out.write_all(&v.to_le_bytes())
}

fn read_u32(input: &mut impl Read) -> io::Result<u32> {
	let mut buf = [0u8; 4];
	input.read_exact(&mut buf)?;
	Ok(u32::from_le_bytes(buf))
}

fn read_u64(input: &mut impl Read) -> io::Result<u64> {
	let mut buf = [0u8; 8];
	input.read_exact(&mut buf)?;
	Ok(u64::from_le_bytes(buf))
}

fn read_i64(input: &mut impl Read) -> io::Result<i64> {
	let mut buf = [0u8; 8];
	input.read_exact(&mut buf)?;
	Ok(i64::from_le_bytes(buf))
}

/// Writes every partition of `cache` to `path` via a temp-file-plus-rename swap, paced to take
/// roughly `sync_period` in total (§4.7/§9: a partition's worth of sleep between each write, so
/// a large cache's snapshot write doesn't starve the rest of the process of CPU in one burst).
/// On any write error the partial temp file is unlinked and the previous snapshot at `path` is
/// left intact, per the write protocol's error semantics.
pub fn write(path: impl AsRef<Path>, cache: &PartitionedCache, now: i64, sync_period: Duration, stats: &Stats) -> io::Result<()> {
	let path = path.as_ref();
	let tmp_path = path.with_extension("syncing");

	if let Err(err) = write_body(&tmp_path, cache, now, sync_period) {
		log::warn!("hostdb snapshot write to {:?} failed: {err}", tmp_path);
		fs::remove_file(&tmp_path).ok();
		return Err(err);
	}

	fs::rename(&tmp_path, path)?;
	Stats::incr(&stats.snapshot_writes);
	Ok(())
}

fn write_body(tmp_path: &Path, cache: &PartitionedCache, now: i64, sync_period: Duration) -> io::Result<()> {
	let file = File::create(tmp_path)?;
	let mut out = BufWriter::new(file);

	let partitions = cache.partitions();
	let pace = if partitions.is_empty() { Duration::ZERO } else { sync_period / partitions.len() as u32 };

	out.write_all(MAGIC)?;
	write_u32(&mut out, VERSION)?;
	write_u32(&mut out, partitions.len() as u32)?;
	write_i64(&mut out, now)?;

	for (index, partition) in partitions.iter().enumerate() {
		let records = partition.iter();

		write_u32(&mut out, index as u32)?;
		write_u32(&mut out, records.len() as u32)?;

		for record in &records {
			let payload = record.marshal();

			write_u64(&mut out, record.key())?;
			write_i64(&mut out, record.response_time())?;
			write_u32(&mut out, record.ttl())?;
			write_u32(&mut out, payload.len() as u32)?;
			out.write_all(payload)?;
		}

		if index + 1 < partitions.len() && !pace.is_zero() {
			thread::sleep(pace);
		}
	}

	out.flush()?;
	out.get_ref().sync_all()
}

/// Restores `cache` from a snapshot previously written by [`write`]. Entries that have
/// already fallen past their stale-while-revalidate grace window by `now` are dropped rather
/// than restored — there's no value in warming the cache with dead weight.
pub fn restore(path: impl AsRef<Path>, cache: &PartitionedCache, now: i64, grace: u32, stats: &Stats) -> io::Result<usize> {
	let file = File::open(path.as_ref())?;
	let mut input = BufReader::new(file);

	let mut magic = [0u8; 8];
	input.read_exact(&mut magic)?;
	if &magic != MAGIC {
		log::warn!("hostdb snapshot at {:?} has an unrecognized header, loading empty cache", path.as_ref());
		return Err(io::Error::new(io::ErrorKind::InvalidData, "not a hostdb snapshot"));
	}

	let version = read_u32(&mut input)?;
	if version != VERSION {
		log::warn!("hostdb snapshot at {:?} is version {version}, this build expects {VERSION}", path.as_ref());
		return Err(io::Error::new(io::ErrorKind::InvalidData, "unsupported snapshot version"));
	}

	let partitions = read_u32(&mut input)? as usize;
	let _created_at = read_i64(&mut input)?;

	let mut restored = 0usize;

	for _ in 0..partitions {
		let _index = read_u32(&mut input)?;
		let entry_count = read_u32(&mut input)?;

		for _ in 0..entry_count {
			let fold = read_u64(&mut input)?;
			let response_time = read_i64(&mut input)?;
			let ttl = read_u32(&mut input)?;
			let payload_size = read_u32(&mut input)? as usize;

			let mut payload = vec![0u8; payload_size];
			input.read_exact(&mut payload)?;

			if now >= response_time + ttl as i64 + grace as i64 {
				continue;
			}

			let Ok(record) = crate::record::Record::unmarshal(&payload) else { continue };
			cache.put_raw(fold, record, now, stats);
			restored += 1;
		}
	}

	Stats::incr(&stats.snapshot_restores);
	Ok(restored)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::Config;
	use crate::key::{Key, Mark};
	use crate::record::{Family, Record};

	#[test]
	fn round_trips_through_a_temp_file() {
		let config = Config::default();
		let cache = PartitionedCache::new(&config);
		let stats = Stats::default();

		let key = Key::for_name("snap.test", 0, Mark::Ipv4, None);
		let record = Record::build_addr(key.fold(), Family::V4, "snap.test", &["2.2.2.2".parse().unwrap()], 60, 1_000);
		cache.put(&key, record, 1_000, &stats);

		let path = std::env::temp_dir().join(format!("hostdb-snapshot-test-{}", std::process::id()));
		write(&path, &cache, 1_010, Duration::ZERO, &stats).unwrap();

		let fresh_cache = PartitionedCache::new(&config);
		let restored = restore(&path, &fresh_cache, 1_020, 30, &stats).unwrap();

		assert_eq!(restored, 1);
		assert!(fresh_cache.get(&key).is_some());

		std::fs::remove_file(&path).ok();
	}

	#[test]
	fn drops_entries_already_past_grace() {
		let config = Config::default();
		let cache = PartitionedCache::new(&config);
		let stats = Stats::default();

		let key = Key::for_name("stale.test", 0, Mark::Ipv4, None);
		let record = Record::build_addr(key.fold(), Family::V4, "stale.test", &["3.3.3.3".parse().unwrap()], 10, 0);
		cache.put(&key, record, 0, &stats);

		let path = std::env::temp_dir().join(format!("hostdb-snapshot-stale-{}", std::process::id()));
		write(&path, &cache, 5, Duration::ZERO, &stats).unwrap();

		let fresh_cache = PartitionedCache::new(&config);
		let restored = restore(&path, &fresh_cache, 10_000, 30, &stats).unwrap();

		assert_eq!(restored, 0);
		std::fs::remove_file(&path).ok();
	}
}
