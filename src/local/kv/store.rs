use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use crate::collections::SortedMap;
use crate::error::{failed_precondition, internal_error, storage_failure, FirestoreResult};
use crate::local::kv::{IterControl, KvStore, KvTransaction, ScanVisitor};

type Table = SortedMap<Vec<u8>, Vec<u8>>;

#[derive(Default)]
struct StoreState {
    data: Table,
    failing: bool,
    fail_next_commits: usize,
}

/// In-process [`KvStore`]. Clones share the same data, which is how
/// several tabs of one process share a store.
///
/// Read-write transactions are serialized: `begin` blocks while another
/// read-write transaction is open. Read-only transactions run on a snapshot.
#[derive(Clone, Default)]
pub struct MemoryKvStore {
    inner: Arc<Mutex<StoreState>>,
    writer: Arc<WriterSlot>,
}

#[derive(Default)]
struct WriterSlot {
    active: Mutex<bool>,
    released: Condvar,
}

impl WriterSlot {
    fn acquire(&self) -> FirestoreResult<()> {
        let mut active = self
            .active
            .lock()
            .map_err(|_| internal_error("writer slot lock poisoned"))?;
        while *active {
            active = self
                .released
                .wait(active)
                .map_err(|_| internal_error("writer slot lock poisoned"))?;
        }
        *active = true;
        Ok(())
    }

    fn release(&self) {
        let mut active = self
            .active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *active = false;
        self.released.notify_one();
    }
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> FirestoreResult<MutexGuard<'_, StoreState>> {
        self.inner
            .lock()
            .map_err(|_| internal_error("key-value store lock poisoned"))
    }

    /// Makes the next `count` commits fail with a storage failure.
    pub fn fail_next_commits(&self, count: usize) {
        if let Ok(mut state) = self.inner.lock() {
            state.fail_next_commits = count;
        }
    }

    /// While set, every transaction fails to start.
    pub fn set_failing(&self, failing: bool) {
        if let Ok(mut state) = self.inner.lock() {
            state.failing = failing;
        }
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.inner.lock().map(|state| state.data.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KvStore for MemoryKvStore {
    fn begin(&self, read_only: bool) -> FirestoreResult<Box<dyn KvTransaction>> {
        if self.lock()?.failing {
            return Err(storage_failure("Simulated storage failure on open"));
        }
        if !read_only {
            self.writer.acquire()?;
        }
        let data = match self.lock() {
            Ok(state) => state.data.clone(),
            Err(err) => {
                if !read_only {
                    self.writer.release();
                }
                return Err(err);
            }
        };
        Ok(Box::new(MemoryKvTransaction {
            store: self.clone(),
            read_only,
            view: Mutex::new(data),
            writes: Mutex::new(Vec::new()),
        }))
    }
}

struct MemoryKvTransaction {
    store: MemoryKvStore,
    read_only: bool,
    /// Snapshot at begin plus this transaction's writes.
    view: Mutex<Table>,
    /// Writes replayed onto the shared data at commit. `None` deletes.
    writes: Mutex<Vec<(Vec<u8>, Option<Vec<u8>>)>>,
}

impl MemoryKvTransaction {
    fn snapshot(&self) -> FirestoreResult<Table> {
        self.view
            .lock()
            .map(|view| view.clone())
            .map_err(|_| internal_error("transaction view lock poisoned"))
    }

    fn record(&self, key: &[u8], value: Option<&[u8]>) -> FirestoreResult<()> {
        if self.read_only {
            return Err(failed_precondition("Cannot write in a read-only transaction"));
        }
        let mut view = self
            .view
            .lock()
            .map_err(|_| internal_error("transaction view lock poisoned"))?;
        *view = match value {
            Some(value) => view.insert(key.to_vec(), value.to_vec()),
            None => view.remove(&key.to_vec()),
        };
        self.writes
            .lock()
            .map_err(|_| internal_error("transaction log lock poisoned"))?
            .push((key.to_vec(), value.map(<[u8]>::to_vec)));
        Ok(())
    }
}

impl KvTransaction for MemoryKvTransaction {
    fn get(&self, key: &[u8]) -> FirestoreResult<Option<Vec<u8>>> {
        let view = self
            .view
            .lock()
            .map_err(|_| internal_error("transaction view lock poisoned"))?;
        Ok(view.get(&key.to_vec()).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> FirestoreResult<()> {
        self.record(key, Some(value))
    }

    fn delete(&self, key: &[u8]) -> FirestoreResult<()> {
        self.record(key, None)
    }

    fn scan(&self, start: &[u8], end: &[u8], visitor: &mut ScanVisitor<'_>) -> FirestoreResult<()> {
        let snapshot = self.snapshot()?;
        let mut cursor = start.to_vec();
        'restart: loop {
            for (key, value) in snapshot.iter_from(&cursor) {
                if key.as_slice() >= end {
                    return Ok(());
                }
                match visitor(key.as_slice(), value.as_slice())? {
                    IterControl::Continue => {}
                    IterControl::Stop => return Ok(()),
                    IterControl::SkipTo(next) => {
                        if next.as_slice() <= key.as_slice() {
                            continue;
                        }
                        cursor = next;
                        continue 'restart;
                    }
                }
            }
            return Ok(());
        }
    }

    fn scan_reverse(
        &self,
        start: &[u8],
        end: &[u8],
        visitor: &mut ScanVisitor<'_>,
    ) -> FirestoreResult<()> {
        let snapshot = self.snapshot()?;
        let in_range: Vec<(&Vec<u8>, &Vec<u8>)> = snapshot
            .iter_from(&start.to_vec())
            .take_while(|(key, _)| key.as_slice() < end)
            .collect();
        // `SkipTo` moves the cursor down to the first key `<=` the target.
        let mut skip_above: Option<Vec<u8>> = None;
        for (key, value) in in_range.into_iter().rev() {
            if let Some(limit) = &skip_above {
                if key > limit {
                    continue;
                }
            }
            match visitor(key.as_slice(), value.as_slice())? {
                IterControl::Continue => {}
                IterControl::Stop => return Ok(()),
                IterControl::SkipTo(next) => skip_above = Some(next),
            }
        }
        Ok(())
    }

    fn commit(self: Box<Self>) -> FirestoreResult<()> {
        let writes = std::mem::take(
            &mut *self
                .writes
                .lock()
                .map_err(|_| internal_error("transaction log lock poisoned"))?,
        );
        let mut state = self.store.lock()?;
        if state.fail_next_commits > 0 {
            state.fail_next_commits -= 1;
            return Err(storage_failure("Simulated storage failure on commit"));
        }
        if writes.is_empty() {
            return Ok(());
        }
        let mut data = state.data.clone();
        for (key, value) in writes {
            data = match value {
                Some(value) => data.insert(key, value),
                None => data.remove(&key),
            };
        }
        state.data = data;
        Ok(())
    }

    fn abort(self: Box<Self>) {}
}

impl Drop for MemoryKvTransaction {
    fn drop(&mut self) {
        if !self.read_only {
            self.store.writer.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(txn: &dyn KvTransaction, start: &[u8], end: &[u8]) -> Vec<Vec<u8>> {
        let mut keys = Vec::new();
        txn.scan(start, end, &mut |key, _| {
            keys.push(key.to_vec());
            Ok(IterControl::Continue)
        })
        .unwrap();
        keys
    }

    #[test]
    fn writes_become_visible_on_commit() {
        let store = MemoryKvStore::new();
        let txn = store.begin(false).unwrap();
        txn.put(b"a", b"1").unwrap();
        assert_eq!(txn.get(b"a").unwrap(), Some(b"1".to_vec()));

        let other = store.begin(true).unwrap();
        assert_eq!(other.get(b"a").unwrap(), None);

        txn.commit().unwrap();
        let reader = store.begin(true).unwrap();
        assert_eq!(reader.get(b"a").unwrap(), Some(b"1".to_vec()));
    }

    #[test]
    fn aborted_writes_are_dropped() {
        let store = MemoryKvStore::new();
        let txn = store.begin(false).unwrap();
        txn.put(b"a", b"1").unwrap();
        txn.abort();
        assert!(store.is_empty());
    }

    #[test]
    fn scans_are_ordered_and_can_skip() {
        let store = MemoryKvStore::new();
        let txn = store.begin(false).unwrap();
        for key in [b"a1", b"a2", b"b1", b"b2", b"c1"] {
            txn.put(key, b"").unwrap();
        }
        assert_eq!(collect(txn.as_ref(), b"a", b"c"), vec![b"a1".to_vec(), b"a2".to_vec(), b"b1".to_vec(), b"b2".to_vec()]);

        let mut visited = Vec::new();
        txn.scan(b"a", b"z", &mut |key, _| {
            visited.push(key.to_vec());
            if key == b"a1" {
                Ok(IterControl::SkipTo(b"b2".to_vec()))
            } else {
                Ok(IterControl::Continue)
            }
        })
        .unwrap();
        assert_eq!(visited, vec![b"a1".to_vec(), b"b2".to_vec(), b"c1".to_vec()]);

        let mut reversed = Vec::new();
        txn.scan_reverse(b"a", b"c", &mut |key, _| {
            reversed.push(key.to_vec());
            Ok(if reversed.len() == 2 { IterControl::Stop } else { IterControl::Continue })
        })
        .unwrap();
        assert_eq!(reversed, vec![b"b2".to_vec(), b"b1".to_vec()]);
    }

    #[test]
    fn visitors_may_delete_while_scanning() {
        let store = MemoryKvStore::new();
        let txn = store.begin(false).unwrap();
        txn.put(b"a", b"").unwrap();
        txn.put(b"b", b"").unwrap();
        txn.scan(b"a", b"z", &mut |key, _| {
            txn.delete(key)?;
            Ok(IterControl::Continue)
        })
        .unwrap();
        assert!(collect(txn.as_ref(), b"a", b"z").is_empty());
    }

    #[test]
    fn injected_failures_surface_as_storage_failures() {
        let store = MemoryKvStore::new();
        store.fail_next_commits(1);
        let txn = store.begin(false).unwrap();
        txn.put(b"a", b"1").unwrap();
        let err = txn.commit().unwrap_err();
        assert!(err.is_storage_failure());
        assert!(store.is_empty());

        store.set_failing(true);
        assert!(store.begin(true).is_err());
        store.set_failing(false);
        assert!(store.begin(true).is_ok());
    }

    #[test]
    fn read_write_transactions_are_serialized() {
        let store = MemoryKvStore::new();
        let first = store.begin(false).unwrap();
        let contender = store.clone();
        let handle = std::thread::spawn(move || {
            let second = contender.begin(false).unwrap();
            let seen = second.get(b"k").unwrap();
            second.commit().unwrap();
            seen
        });
        std::thread::sleep(std::time::Duration::from_millis(20));
        first.put(b"k", b"first").unwrap();
        first.commit().unwrap();
        assert_eq!(handle.join().unwrap(), Some(b"first".to_vec()));
    }
}
