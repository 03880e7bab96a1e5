//! 128-bit cache keys (§3, §4.3).
//!
//! A [`Key`] is a Blake2s-128 digest over either a name-shaped input (name, port, mark,
//! optional split-DNS tag) or an address-shaped input (zero-padded so it can never collide
//! with a name digest). The low- and high-order 64-bit halves are XOR-folded to produce the
//! 64-bit value used both as the cache map key and to select a partition; no security
//! property is claimed, only low collision probability and uniform spread across partitions.

use std::net::IpAddr;

use blake2::digest::{Update, VariableOutput};
use blake2::Blake2sVar;

/// Distinguishes record flavors that would otherwise share a name, per the mark byte in §3.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
#[repr(u8)]
pub enum Mark {
	Generic = 0,
	Ipv4 = 1,
	Ipv6 = 2,
	Srv = 3,
}

/// A 128-bit digest identifying one cache entry.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub struct Key(u128);

fn digest128(parts: &[&[u8]]) -> u128 {
	// 16 is always a valid Blake2s output size (max 32).
	let mut hasher = Blake2sVar::new(16).expect("16-byte output is valid for Blake2s");

	for part in parts {
		hasher.update(part);
	}

	let mut buf = [0u8; 16];
	hasher.finalize_variable(&mut buf).expect("buffer is exactly the requested output size");

	u128::from_le_bytes(buf)
}

impl Key {
	/// Digest a name-keyed query: `(name, port, mark, split_dns_tag?)`.
	pub fn for_name(name: &str, port: u16, mark: Mark, split_dns_tag: Option<&[u8]>) -> Self {
		let port_bytes = port.to_be_bytes();
		let mark_byte = [mark as u8];

		let mut parts: Vec<&[u8]> = Vec::with_capacity(4);
		parts.push(name.as_bytes());
		parts.push(&port_bytes);
		parts.push(&mark_byte);

		if let Some(tag) = split_dns_tag {
			parts.push(tag);
		}

		Self(digest128(&parts))
	}

	/// Digest an address-keyed (reverse) query. The zero padding on both sides guarantees
	/// disjointness from any name-derived digest.
	pub fn for_addr(addr: IpAddr) -> Self {
		const ZERO: [u8; 2] = [0, 0];

		match addr {
			IpAddr::V4(v4) => Self(digest128(&[&ZERO, &v4.octets(), &ZERO])),
			IpAddr::V6(v6) => Self(digest128(&[&ZERO, &v6.octets(), &ZERO])),
		}
	}

	/// The 64-bit fold used both as the map key inside a partition and to pick the partition.
	#[inline]
	pub fn fold(&self) -> u64 {
		((self.0 >> 64) as u64) ^ (self.0 as u64)
	}

	/// Selects one of `partitions` shards for this key.
	#[inline]
	pub fn partition(&self, partitions: usize) -> usize {
		(self.fold() as usize) % partitions
	}

	/// The raw 128-bit digest, e.g. for snapshot framing.
	pub fn raw(&self) -> u128 {
		self.0
	}

	pub fn from_raw(raw: u128) -> Self {
		Self(raw)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn ipv4_and_ipv6_marks_differ() {
		let a = Key::for_name("host.example", 0, Mark::Ipv4, None);
		let b = Key::for_name("host.example", 0, Mark::Ipv6, None);
		assert_ne!(a, b);
	}

	#[test]
	fn name_and_addr_keys_never_collide_on_padding() {
		let name_key = Key::for_name("\0\0", 0, Mark::Generic, None);
		let addr_key = Key::for_addr("0.0.0.0".parse().unwrap());
		// Not a formal proof, just documents the design intent; the hash spaces differ because
		// the zero-padding frame for addresses never appears in a name digest's byte layout.
		assert_ne!(name_key, addr_key);
	}

	#[test]
	fn deterministic() {
		let a = Key::for_name("alpha.example", 80, Mark::Ipv4, None);
		let b = Key::for_name("alpha.example", 80, Mark::Ipv4, None);
		assert_eq!(a, b);
	}
}
