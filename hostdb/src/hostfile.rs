//! Hosts-file shadowing: static forward/reverse entries that take priority over DNS (§4.5).
//!
//! The parsed table is published behind a single `RwLock<Arc<HostFile>>`. A reload builds an
//! entirely new [`HostFile`] off the lock and then swaps the `Arc` in one write-lock
//! acquisition, so readers never observe a half-updated table and never block on a file
//! parse in progress.

use std::collections::HashMap;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::RwLock;

/// One parsed snapshot of a hosts file.
#[derive(Default)]
pub struct HostFile {
	forward: HashMap<String, Vec<IpAddr>>,
	reverse: HashMap<IpAddr, String>,
}

impl HostFile {
	pub fn lookup_forward(&self, name: &str) -> Option<&[IpAddr]> {
		self.forward.get(name).map(Vec::as_slice)
	}

	/// Forward lookup restricted to one address family, mirroring a hosts-file table that
	/// keeps separate IPv4/IPv6 record handles per name rather than one mixed list. Returns
	/// `None` if the name is present but has no entry of the requested family.
	pub fn lookup_forward_family(&self, name: &str, family: crate::record::Family) -> Option<Vec<IpAddr>> {
		let addrs = self.forward.get(name)?;
		let matching: Vec<IpAddr> = addrs
			.iter()
			.copied()
			.filter(|addr| matches!((addr, family), (IpAddr::V4(_), crate::record::Family::V4) | (IpAddr::V6(_), crate::record::Family::V6)))
			.collect();
		if matching.is_empty() {
			None
		} else {
			Some(matching)
		}
	}

	pub fn lookup_reverse(&self, addr: IpAddr) -> Option<&str> {
		self.reverse.get(&addr).map(String::as_str)
	}

	/// Parses a standard `/etc/hosts`-style file: whitespace-separated `ip name [alias...]`
	/// per line, `#` starts a line comment, blank lines ignored. The first name encountered
	/// for an address becomes its reverse (PTR-equivalent) name, matching typical resolver
	/// behavior when multiple names alias one address.
	fn parse(contents: &str) -> Self {
		let mut forward: HashMap<String, Vec<IpAddr>> = HashMap::new();
		let mut reverse: HashMap<IpAddr, String> = HashMap::new();

		for line in contents.lines() {
			let line = match line.split_once('#') {
				Some((before, _)) => before,
				None => line,
			};

			let mut fields = line.split_whitespace();
			let Some(addr_str) = fields.next() else { continue };
			let Ok(addr) = addr_str.parse::<IpAddr>() else { continue };

			reverse.entry(addr).or_insert_with(|| fields.clone().next().unwrap_or_default().to_lowercase());

			for name in fields {
				forward.entry(name.to_lowercase()).or_default().push(addr);
			}
		}

		Self { forward, reverse }
	}
}

/// Owns the reload policy for a hosts file: where it lives, how often to check its mtime,
/// and the currently-published [`HostFile`].
pub struct HostFileShadow {
	path: PathBuf,
	table: RwLock<Arc<HostFile>>,
	last_mtime: RwLock<Option<SystemTime>>,
}

impl HostFileShadow {
	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self { path: path.into(), table: RwLock::new(Arc::new(HostFile::default())), last_mtime: RwLock::new(None) }
	}

	pub fn current(&self) -> Arc<HostFile> {
		self.table.read().clone()
	}

	/// Re-parses the file if its mtime has moved on since the last successful load.
	/// Returns `true` if a reload happened.
	pub fn reload_if_changed(&self) -> bool {
		let mtime = match fs::metadata(&self.path).and_then(|m| m.modified()) {
			Ok(mtime) => mtime,
			Err(_) => return false,
		};

		if *self.last_mtime.read() == Some(mtime) {
			return false;
		}

		let contents = match fs::read_to_string(&self.path) {
			Ok(contents) => contents,
			Err(err) => {
				log::warn!("failed to read hosts file {:?}: {err}", self.path);
				return false;
			}
		};
		let parsed = Arc::new(HostFile::parse(&contents));

		*self.table.write() = parsed;
		*self.last_mtime.write() = Some(mtime);
		true
	}

	pub fn path(&self) -> &Path {
		&self.path
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_forward_and_reverse_entries() {
		let table = HostFile::parse("127.0.0.1 localhost\n10.0.0.5 db.internal db\n# comment\n\n");

		assert_eq!(table.lookup_forward("localhost"), Some(&["127.0.0.1".parse().unwrap()][..]));
		assert_eq!(table.lookup_reverse("10.0.0.5".parse().unwrap()), Some("db.internal"));
		assert_eq!(table.lookup_forward("db"), Some(&["10.0.0.5".parse().unwrap()][..]));
	}

	#[test]
	fn reload_picks_up_mtime_changes() {
		let dir = std::env::temp_dir().join(format!("hostdb-test-hosts-{}", std::process::id()));
		fs::write(&dir, "127.0.0.1 first\n").unwrap();

		let shadow = HostFileShadow::new(&dir);
		assert!(shadow.reload_if_changed());
		assert!(shadow.current().lookup_forward("first").is_some());
		assert!(!shadow.reload_if_changed(), "mtime unchanged, no reload expected");

		fs::remove_file(&dir).ok();
	}
}
