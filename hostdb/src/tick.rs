//! The background tick (§4.8): a single thread that advances the cached clock, evicts
//! entries past their stale grace window, polls the hosts-file shadow for changes, and
//! (if `snapshot_dir` is configured) periodically writes the cache to disk. Nothing on
//! the request path waits on this thread; it only does cleanup and persistence that
//! could otherwise be done lazily but is cheaper to batch once a second.

use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use crate::snapshot;
use crate::snapshot_path;
use crate::stats::Stats;
use crate::Inner;

const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Spawns the tick thread. Holds only a [`Weak`] reference to `inner` so the background
/// thread doesn't keep the database alive after every [`crate::HostDb`] handle is dropped;
/// the thread notices and exits on the next tick.
pub(crate) fn spawn(inner: &Arc<Inner>) -> thread::JoinHandle<()> {
	let weak: Weak<Inner> = Arc::downgrade(inner);
	let mut since_last_snapshot = Duration::ZERO;

	thread::spawn(move || loop {
		thread::sleep(TICK_INTERVAL);

		let Some(inner) = weak.upgrade() else { break };

		inner.clock.refresh();
		let now = inner.clock.now();

		inner.cache.tick(now, inner.config.stale_grace, &inner.stats);

		if let Some(shadow) = &inner.hostfile {
			if shadow.reload_if_changed() {
				Stats::incr(&inner.stats.hostfile_reloads);
			}
		}

		if let Some(dir) = &inner.config.snapshot_dir {
			since_last_snapshot += TICK_INTERVAL;
			if since_last_snapshot >= inner.config.snapshot_interval {
				since_last_snapshot = Duration::ZERO;
				let path = snapshot_path(dir);
				let sync_period = inner.config.snapshot_interval;
				if let Err(err) = snapshot::write(&path, &inner.cache, now, sync_period, &inner.stats) {
					log::warn!("background hostdb snapshot write to {:?} failed: {err}", path);
				}
			}
		}
	})
}
