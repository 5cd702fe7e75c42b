//! Per-aggregate mailbox: serializes delivery for one aggregate id and
//! holds streams that arrived ahead of their predecessor.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::ProcessingEventStream;

/// Critical sections below never panic, so a poisoned lock still holds
/// consistent data.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(super) struct Mailbox {
    pub(super) aggregate_id: String,
    queue: Mutex<VecDeque<ProcessingEventStream>>,
    running: AtomicBool,
    waiting: Mutex<BTreeMap<u64, ProcessingEventStream>>,
}

impl Mailbox {
    pub(super) fn new(aggregate_id: String) -> Self {
        Self {
            aggregate_id,
            queue: Mutex::new(VecDeque::new()),
            running: AtomicBool::new(false),
            waiting: Mutex::new(BTreeMap::new()),
        }
    }

    /// Queue a stream. Returns true when the caller must start a runner.
    pub(super) fn enqueue(&self, stream: ProcessingEventStream) -> bool {
        lock(&self.queue).push_back(stream);
        !self.running.swap(true, Ordering::SeqCst)
    }

    pub(super) fn dequeue(&self) -> Option<ProcessingEventStream> {
        lock(&self.queue).pop_front()
    }

    /// Mark the runner stopped. Returns true when new work arrived in the
    /// meantime and the caller reclaimed the mailbox.
    pub(super) fn release(&self) -> bool {
        self.running.store(false, Ordering::SeqCst);
        let has_queued = !lock(&self.queue).is_empty();
        has_queued && !self.running.swap(true, Ordering::SeqCst)
    }

    /// No runner, nothing queued, nothing waiting.
    pub(super) fn is_idle(&self) -> bool {
        !self.running.load(Ordering::SeqCst)
            && lock(&self.queue).is_empty()
            && lock(&self.waiting).is_empty()
    }

    /// Hold a stream until its predecessor completes. If the same version is
    /// already held, the new copy is handed back as a duplicate.
    pub(super) fn park(&self, stream: ProcessingEventStream) -> Option<ProcessingEventStream> {
        match lock(&self.waiting).entry(stream.message.version) {
            Entry::Occupied(_) => Some(stream),
            Entry::Vacant(slot) => {
                slot.insert(stream);
                None
            }
        }
    }

    /// After the cursor reached `published`: take the held successor
    /// (`published + 1`) and every held stream the cursor already covers.
    pub(super) fn take_successor(
        &self,
        published: u64,
    ) -> (Option<ProcessingEventStream>, Vec<ProcessingEventStream>) {
        let mut waiting = lock(&self.waiting);
        let remaining = waiting.split_off(&(published + 1));
        let stale = std::mem::replace(&mut *waiting, remaining)
            .into_values()
            .collect();
        let next = waiting.remove(&(published + 1));
        (next, stale)
    }

    pub(super) fn waiting_count(&self) -> usize {
        lock(&self.waiting).len()
    }
}
