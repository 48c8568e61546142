//! Least-recently-used garbage collection for the durable persistence.
//!
//! Every target and every document that left all targets carries the
//! sequence number of its last use. A collection run picks the sequence
//! number below which a configured percentile of those entries fall, then
//! removes inactive targets and orphaned documents at or below it.

use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::LruParams;
use crate::error::FirestoreResult;
use crate::local::local_store::LocalStore;
use crate::local::persistence::{
    is_primary_lease_lost, ActiveTargets, PersistenceTransaction, INVALID_SEQUENCE_NUMBER,
};
use crate::local::target_data::TargetData;
use crate::model::ListenSequenceNumber;
use crate::util::async_queue::{AsyncQueue, DelayedOperation, TimerId};
use crate::util::box_future;

/// Storage-specific half of the collector.
pub trait LruDelegate: Send + Sync {
    /// Targets plus orphaned documents.
    fn get_sequence_number_count(&self, txn: &PersistenceTransaction) -> FirestoreResult<usize>;

    fn for_each_target(
        &self,
        txn: &PersistenceTransaction,
        visitor: &mut dyn FnMut(&TargetData),
    ) -> FirestoreResult<()>;

    /// Visits the sequence number of every document that is in no target.
    fn for_each_orphaned_document(
        &self,
        txn: &PersistenceTransaction,
        visitor: &mut dyn FnMut(ListenSequenceNumber),
    ) -> FirestoreResult<()>;

    /// Removes targets at or below `upper_bound` that are not active.
    fn remove_targets(
        &self,
        txn: &PersistenceTransaction,
        upper_bound: ListenSequenceNumber,
        active_targets: &ActiveTargets,
    ) -> FirestoreResult<usize>;

    /// Removes unpinned orphaned documents at or below `upper_bound`.
    fn remove_orphaned_documents(
        &self,
        txn: &PersistenceTransaction,
        upper_bound: ListenSequenceNumber,
    ) -> FirestoreResult<usize>;

    fn get_cache_size(&self, txn: &PersistenceTransaction) -> FirestoreResult<i64>;
}

/// Outcome of one collection run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LruResults {
    pub did_run: bool,
    pub sequence_numbers_collected: usize,
    pub targets_removed: usize,
    pub documents_removed: usize,
}

impl LruResults {
    pub fn did_not_run() -> Self {
        Self::default()
    }
}

pub struct LruGarbageCollector {
    delegate: Arc<dyn LruDelegate>,
    params: LruParams,
}

impl LruGarbageCollector {
    pub fn new(delegate: Arc<dyn LruDelegate>, params: LruParams) -> Self {
        Self { delegate, params }
    }

    pub fn params(&self) -> LruParams {
        self.params
    }

    /// Number of sequence numbers making up `percentile` percent of the
    /// entries in use.
    pub fn calculate_target_count(
        &self,
        txn: &PersistenceTransaction,
        percentile: u32,
    ) -> FirestoreResult<usize> {
        let count = self.delegate.get_sequence_number_count(txn)?;
        Ok(count * percentile as usize / 100)
    }

    /// The `n`th lowest sequence number in use, or
    /// [`INVALID_SEQUENCE_NUMBER`] when `n` is zero.
    pub fn nth_sequence_number(
        &self,
        txn: &PersistenceTransaction,
        n: usize,
    ) -> FirestoreResult<ListenSequenceNumber> {
        if n == 0 {
            return Ok(INVALID_SEQUENCE_NUMBER);
        }
        let mut buffer = RollingSequenceNumberBuffer::new(n);
        self.delegate
            .for_each_target(txn, &mut |data| buffer.add(data.sequence_number))?;
        self.delegate
            .for_each_orphaned_document(txn, &mut |sequence_number| buffer.add(sequence_number))?;
        Ok(buffer.max_value())
    }

    pub fn remove_targets(
        &self,
        txn: &PersistenceTransaction,
        upper_bound: ListenSequenceNumber,
        active_targets: &ActiveTargets,
    ) -> FirestoreResult<usize> {
        self.delegate.remove_targets(txn, upper_bound, active_targets)
    }

    pub fn remove_orphaned_documents(
        &self,
        txn: &PersistenceTransaction,
        upper_bound: ListenSequenceNumber,
    ) -> FirestoreResult<usize> {
        self.delegate.remove_orphaned_documents(txn, upper_bound)
    }

    pub fn get_cache_size(&self, txn: &PersistenceTransaction) -> FirestoreResult<i64> {
        self.delegate.get_cache_size(txn)
    }

    /// Runs a collection if the cache grew beyond the threshold.
    pub fn collect(
        &self,
        txn: &PersistenceTransaction,
        active_targets: &ActiveTargets,
    ) -> FirestoreResult<LruResults> {
        if self.params.is_disabled() {
            log::debug!("garbage collection skipped; disabled");
            return Ok(LruResults::did_not_run());
        }
        let cache_size = self.get_cache_size(txn)?;
        if cache_size < self.params.cache_size_collection_threshold {
            log::debug!(
                "garbage collection skipped; cache size {cache_size} is lower than threshold {}",
                self.params.cache_size_collection_threshold
            );
            return Ok(LruResults::did_not_run());
        }
        self.run_garbage_collection(txn, active_targets)
    }

    fn run_garbage_collection(
        &self,
        txn: &PersistenceTransaction,
        active_targets: &ActiveTargets,
    ) -> FirestoreResult<LruResults> {
        let mut to_collect = self.calculate_target_count(txn, self.params.percentile_to_collect)?;
        if to_collect > self.params.maximum_sequence_numbers_to_collect {
            log::debug!(
                "capping sequence numbers to collect down to the maximum of {} from {to_collect}",
                self.params.maximum_sequence_numbers_to_collect
            );
            to_collect = self.params.maximum_sequence_numbers_to_collect;
        }
        let upper_bound = self.nth_sequence_number(txn, to_collect)?;
        let targets_removed = self.remove_targets(txn, upper_bound, active_targets)?;
        let documents_removed = self.remove_orphaned_documents(txn, upper_bound)?;
        log::debug!(
            "LRU garbage collection: counted {to_collect} sequence numbers up to {upper_bound}, \
             removed {targets_removed} targets and {documents_removed} documents"
        );
        Ok(LruResults {
            did_run: true,
            sequence_numbers_collected: to_collect,
            targets_removed,
            documents_removed,
        })
    }
}

/// Keeps the `max_elements` lowest sequence numbers seen.
struct RollingSequenceNumberBuffer {
    heap: BinaryHeap<ListenSequenceNumber>,
    max_elements: usize,
}

impl RollingSequenceNumberBuffer {
    fn new(max_elements: usize) -> Self {
        Self {
            heap: BinaryHeap::with_capacity(max_elements),
            max_elements,
        }
    }

    fn add(&mut self, sequence_number: ListenSequenceNumber) {
        if self.heap.len() < self.max_elements {
            self.heap.push(sequence_number);
        } else if let Some(&highest) = self.heap.peek() {
            if sequence_number < highest {
                self.heap.pop();
                self.heap.push(sequence_number);
            }
        }
    }

    fn max_value(&self) -> ListenSequenceNumber {
        self.heap.peek().copied().unwrap_or(INVALID_SEQUENCE_NUMBER)
    }
}

/// Runs garbage collection periodically while the client holds the
/// primary lease.
pub struct LruScheduler {
    collector: Arc<LruGarbageCollector>,
    local_store: Arc<LocalStore>,
    queue: AsyncQueue,
    initial_delay: Duration,
    regular_delay: Duration,
    has_run: AtomicBool,
    task: Mutex<Option<DelayedOperation>>,
}

impl LruScheduler {
    pub fn new(
        collector: Arc<LruGarbageCollector>,
        local_store: Arc<LocalStore>,
        queue: AsyncQueue,
        initial_delay: Duration,
        regular_delay: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            collector,
            local_store,
            queue,
            initial_delay,
            regular_delay,
            has_run: AtomicBool::new(false),
            task: Mutex::new(None),
        })
    }

    pub fn start(self: &Arc<Self>) {
        if self.collector.params().is_disabled() {
            return;
        }
        self.schedule();
    }

    pub fn stop(&self) {
        if let Ok(mut task) = self.task.lock() {
            if let Some(task) = task.take() {
                task.cancel();
            }
        }
    }

    pub fn is_started(&self) -> bool {
        self.task
            .lock()
            .map(|task| task.as_ref().is_some_and(DelayedOperation::is_pending))
            .unwrap_or(false)
    }

    fn schedule(self: &Arc<Self>) {
        let delay = if self.has_run.load(Ordering::SeqCst) {
            self.regular_delay
        } else {
            self.initial_delay
        };
        log::debug!("garbage collection scheduled in {delay:?}");
        let scheduler = Arc::clone(self);
        let task = self
            .queue
            .enqueue_after_delay(TimerId::LruGarbageCollection, delay, move || {
                box_future(async move {
                    scheduler.has_run.store(true, Ordering::SeqCst);
                    match scheduler.local_store.collect_garbage(&scheduler.collector) {
                        Ok(results) => log::debug!("garbage collection finished: {results:?}"),
                        Err(err) if is_primary_lease_lost(&err) => {
                            log::debug!("ignoring primary lease loss during garbage collection");
                        }
                        Err(err) if err.is_storage_failure() => {
                            log::warn!("ignoring storage failure during garbage collection: {err}");
                        }
                        Err(err) => log::error!("garbage collection failed: {err}"),
                    }
                    scheduler.schedule();
                })
            });
        if let Ok(mut slot) = self.task.lock() {
            *slot = Some(task);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rolling_buffer_keeps_lowest_values() {
        let mut buffer = RollingSequenceNumberBuffer::new(3);
        for value in [50, 10, 40, 30, 20, 60] {
            buffer.add(value);
        }
        assert_eq!(buffer.max_value(), 30);
    }

    #[test]
    fn empty_buffer_reports_invalid() {
        assert_eq!(
            RollingSequenceNumberBuffer::new(2).max_value(),
            INVALID_SEQUENCE_NUMBER
        );
    }
}
