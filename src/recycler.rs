//! Log recycling.
//!
//! One pass:
//!
//! 1. Every registered log switches to a fresh generation and the epoch
//!    flips ([`LogPool::switch_generations`]).
//! 2. Every bottom node is visited under its lock; cached writes still
//!    tagged with the old epoch bit are appended to the recycler's own log
//!    and re-tagged.
//! 3. The previous generations are returned to the free list.
//!
//! After step 2 nothing in the old generations is needed: every write in
//! them is either in a leaf or re-logged in the new generation. A pass that
//! fails in step 2 keeps the switch and resumes there next time.
//!
//! [`LogPool::switch_generations`]: crate::log::LogPool::switch_generations

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use crate::bottom::{BottomGuard, BottomNode, CachedEntry};
use crate::error::TreeError;
use crate::tracing_helpers::{debug_log, info_log, warn_log};
use crate::tree::TreeCore;

/// What one recycle pass did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecycleReport {
    /// Epoch the pass ran under.
    pub epoch: u64,
    /// Cached writes appended to the new generation.
    pub relogged: usize,
    /// Chunks returned to the free list.
    pub chunks_freed: usize,
}

/// Run one pass on the calling thread. Passes are serialized.
pub(crate) fn recycle_pass(core: &TreeCore) -> Result<RecycleReport, TreeError> {
    let _pass = core.pass_lock.lock();

    let epoch: u64 = if core.pending_retire.load(Ordering::Acquire) {
        core.logs.epoch()
    } else {
        core.logs.switch_generations()
    };
    core.pending_retire.store(true, Ordering::Release);
    let bit: u8 = u8::from(epoch & 1 == 1);
    debug_log!(epoch, "recycle pass started");

    let mut relogged: usize = 0;
    let mut failed: Option<TreeError> = None;
    let mut cached: Vec<CachedEntry> = Vec::new();
    core.index.for_each_bottom(|node: &BottomNode| {
        if failed.is_some() {
            return;
        }
        let guard: BottomGuard<'_> = node.lock();
        cached.clear();
        node.cached_entries(&mut cached);
        for (slot, entry) in cached.iter().enumerate() {
            if entry.tag == bit {
                continue;
            }
            match core
                .recycle_log
                .append(&core.logs, entry.key, entry.value, entry.tombstone)
            {
                Ok(appended) => {
                    guard.retag(slot, appended.epoch);
                    relogged += 1;
                }
                Err(err) => {
                    failed = Some(err);
                    return;
                }
            }
        }
    });
    if let Some(err) = failed {
        warn_log!(epoch, relogged, error = %err, "recycle pass stopped");
        return Err(err);
    }

    let chunks_freed: usize = core.logs.retire_previous_generations();
    core.pending_retire.store(false, Ordering::Release);
    core.logs.clear_recycle_request();
    core.counters.recycles.fetch_add(1, Ordering::Relaxed);
    info_log!(epoch, relogged, chunks_freed, "recycle pass complete");

    Ok(RecycleReport {
        epoch,
        relogged,
        chunks_freed,
    })
}

/// Background thread running [`recycle_pass`] whenever a recycle is
/// requested.
#[derive(Debug)]
pub(crate) struct Recycler {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Recycler {
    /// Spawn the thread. Returns `None` if the OS refuses; the tree then
    /// recycles only through explicit passes.
    pub(crate) fn start(core: Arc<TreeCore>) -> Option<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let spawned = thread::Builder::new()
            .name("ccl-recycler".into())
            .spawn(move || run(&core, &flag));
        match spawned {
            Ok(handle) => Some(Self {
                stop,
                handle: Some(handle),
            }),
            Err(_) => {
                warn_log!("recycler thread not started");
                None
            }
        }
    }

    pub(crate) fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = &self.handle {
            handle.thread().unpark();
        }
    }

    pub(crate) fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn_log!("recycler thread panicked");
            }
        }
    }

    pub(crate) fn shutdown(self) {
        self.stop();
        self.join();
    }
}

impl Drop for Recycler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(core: &TreeCore, stop: &AtomicBool) {
    core.logs.set_waker(Some(thread::current()));
    info_log!("recycler started");
    while !stop.load(Ordering::Acquire) {
        if core.logs.recycle_requested() {
            // A failed pass keeps the request raised and is retried.
            if recycle_pass(core).is_err() {
                debug_log!("recycle pass will be retried");
            }
        }
        thread::park_timeout(core.config.recycle_poll);
    }
    core.logs.set_waker(None);
    info_log!("recycler stopped");
}
