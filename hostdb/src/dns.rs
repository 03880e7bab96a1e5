//! The upstream DNS client interface this crate consumes (§6). Resolution itself — wire
//! format, transport, retries against a real resolver — is out of scope; only the shape of
//! the continuation-passing interface matters here, plus a scripted mock to drive tests.

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::record::Family;

/// Identifies one in-flight DNS request; passed back to [`DnsClient::cancel`] if the asker
/// gives up before the continuation fires (e.g. record evicted mid-resolve).
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub struct ActionHandle(u64);

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

impl ActionHandle {
	pub fn next() -> Self {
		Self(NEXT_HANDLE.fetch_add(1, Ordering::Relaxed))
	}
}

/// A one-shot continuation, called from whatever thread the DNS client's transport happens
/// to complete on.
pub type Ret<T> = Box<dyn FnOnce(T) + Send>;

#[derive(Clone, Debug)]
pub struct SrvAnswerEntry {
	pub priority: u16,
	pub weight: u16,
	pub port: u16,
	pub name: String,
}

#[derive(Clone, Debug)]
pub enum DnsAnswer {
	Addrs { addrs: Vec<IpAddr>, ttl: u32 },
	Srv { entries: Vec<SrvAnswerEntry>, ttl: u32 },
	Name { name: String, ttl: u32 },
	/// Upstream returned NXDOMAIN, SERVFAIL, or timed out; the caller synthesizes a
	/// negative-cached record with the configured fail TTL.
	Failed,
}

/// The upstream name-resolution backend. Every method is fire-and-forget: it returns an
/// [`ActionHandle`] immediately and invokes `ret` exactly once, synchronously or from
/// another thread, unless cancelled first.
pub trait DnsClient: Send + Sync {
	fn gethostbyname(&self, name: &str, family: Family, ret: Ret<DnsAnswer>) -> ActionHandle;
	fn getsrvbyname(&self, name: &str, ret: Ret<DnsAnswer>) -> ActionHandle;
	fn gethostbyaddr(&self, addr: IpAddr, ret: Ret<DnsAnswer>) -> ActionHandle;

	/// Best-effort cancellation; a client that can't interrupt in-flight I/O is free to let
	/// the continuation fire anyway, since callers must already tolerate a stale answer.
	fn cancel(&self, handle: ActionHandle);
}

#[cfg(any(test, feature = "mock-dns"))]
pub mod mock {
	use std::collections::HashMap;
	use std::sync::Mutex;

	use super::*;

	/// A scripted [`DnsClient`] for tests: answers are registered up front and served
	/// synchronously from whatever thread calls the `gethostby*` method.
	#[derive(Default)]
	pub struct MockDnsClient {
		forward: Mutex<HashMap<(String, u8), DnsAnswer>>,
		srv: Mutex<HashMap<String, DnsAnswer>>,
		reverse: Mutex<HashMap<IpAddr, DnsAnswer>>,
	}

	impl MockDnsClient {
		pub fn new() -> Self {
			Self::default()
		}

		pub fn set_forward(&self, name: &str, family: Family, answer: DnsAnswer) {
			self.forward.lock().unwrap().insert((name.to_string(), family as u8), answer);
		}

		pub fn set_srv(&self, name: &str, answer: DnsAnswer) {
			self.srv.lock().unwrap().insert(name.to_string(), answer);
		}

		pub fn set_reverse(&self, addr: IpAddr, answer: DnsAnswer) {
			self.reverse.lock().unwrap().insert(addr, answer);
		}
	}

	impl DnsClient for MockDnsClient {
		fn gethostbyname(&self, name: &str, family: Family, ret: Ret<DnsAnswer>) -> ActionHandle {
			let answer = self.forward.lock().unwrap().get(&(name.to_string(), family as u8)).cloned().unwrap_or(DnsAnswer::Failed);
			ret(answer);
			ActionHandle::next()
		}

		fn getsrvbyname(&self, name: &str, ret: Ret<DnsAnswer>) -> ActionHandle {
			let answer = self.srv.lock().unwrap().get(name).cloned().unwrap_or(DnsAnswer::Failed);
			ret(answer);
			ActionHandle::next()
		}

		fn gethostbyaddr(&self, addr: IpAddr, ret: Ret<DnsAnswer>) -> ActionHandle {
			let answer = self.reverse.lock().unwrap().get(&addr).cloned().unwrap_or(DnsAnswer::Failed);
			ret(answer);
			ActionHandle::next()
		}

		fn cancel(&self, _handle: ActionHandle) {}
	}
}
