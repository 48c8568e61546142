use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::core::target::Target;
use crate::core::target_id_generator::TargetIdGenerator;
use crate::error::{internal_error, FirestoreResult};
use crate::local::persistence::{PersistenceTransaction, TargetCache};
use crate::local::reference_set::ReferenceSet;
use crate::local::target_data::TargetData;
use crate::model::{DocumentKey, DocumentKeySet, ListenSequenceNumber, SnapshotVersion, TargetId};
use crate::util::assert::hard_assert;

struct TargetState {
    /// Keyed by canonical id.
    targets: HashMap<String, TargetData>,
    last_remote_snapshot_version: SnapshotVersion,
    highest_target_id: TargetId,
    highest_sequence_number: ListenSequenceNumber,
    references: ReferenceSet,
    generator: TargetIdGenerator,
}

pub struct MemoryTargetCache {
    state: Mutex<TargetState>,
}

impl Default for MemoryTargetCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTargetCache {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TargetState {
                targets: HashMap::new(),
                last_remote_snapshot_version: SnapshotVersion::min(),
                highest_target_id: 0,
                highest_sequence_number: 0,
                references: ReferenceSet::new(),
                generator: TargetIdGenerator::for_target_cache(0),
            }),
        }
    }

    fn lock(&self) -> FirestoreResult<MutexGuard<'_, TargetState>> {
        self.state
            .lock()
            .map_err(|_| internal_error("target cache lock poisoned"))
    }

    fn save_target_data(&self, data: &TargetData) -> FirestoreResult<()> {
        let mut state = self.lock()?;
        state
            .targets
            .insert(data.target.canonical_id(), data.clone());
        if data.target_id > state.highest_target_id {
            state.generator = TargetIdGenerator::for_target_cache(data.target_id);
            state.highest_target_id = data.target_id;
        }
        if data.sequence_number > state.highest_sequence_number {
            state.highest_sequence_number = data.sequence_number;
        }
        Ok(())
    }
}

impl TargetCache for MemoryTargetCache {
    fn get_last_remote_snapshot_version(
        &self,
        _txn: &PersistenceTransaction,
    ) -> FirestoreResult<SnapshotVersion> {
        Ok(self.lock()?.last_remote_snapshot_version)
    }

    fn get_highest_sequence_number(
        &self,
        _txn: &PersistenceTransaction,
    ) -> FirestoreResult<ListenSequenceNumber> {
        Ok(self.lock()?.highest_sequence_number)
    }

    fn allocate_target_id(&self, _txn: &PersistenceTransaction) -> FirestoreResult<TargetId> {
        let mut state = self.lock()?;
        let id = state.generator.next_id();
        state.highest_target_id = id;
        Ok(id)
    }

    fn set_targets_metadata(
        &self,
        _txn: &PersistenceTransaction,
        highest_listen_sequence_number: ListenSequenceNumber,
        last_remote_snapshot_version: Option<SnapshotVersion>,
    ) -> FirestoreResult<()> {
        let mut state = self.lock()?;
        if let Some(version) = last_remote_snapshot_version {
            state.last_remote_snapshot_version = version;
        }
        if highest_listen_sequence_number > state.highest_sequence_number {
            state.highest_sequence_number = highest_listen_sequence_number;
        }
        Ok(())
    }

    fn add_target_data(&self, _txn: &PersistenceTransaction, data: &TargetData) -> FirestoreResult<()> {
        hard_assert(
            !self.lock()?.targets.contains_key(&data.target.canonical_id()),
            "Adding a target that already exists",
        );
        self.save_target_data(data)
    }

    fn update_target_data(
        &self,
        _txn: &PersistenceTransaction,
        data: &TargetData,
    ) -> FirestoreResult<()> {
        hard_assert(
            self.lock()?.targets.contains_key(&data.target.canonical_id()),
            "Updating a non-existent target",
        );
        self.save_target_data(data)
    }

    fn remove_target_data(
        &self,
        _txn: &PersistenceTransaction,
        data: &TargetData,
    ) -> FirestoreResult<()> {
        let mut state = self.lock()?;
        hard_assert(
            state.targets.contains_key(&data.target.canonical_id()),
            "Removing a non-existent target",
        );
        state.targets.remove(&data.target.canonical_id());
        state.references.remove_references_for_id(data.target_id);
        Ok(())
    }

    fn get_target_count(&self, _txn: &PersistenceTransaction) -> FirestoreResult<usize> {
        Ok(self.lock()?.targets.len())
    }

    fn get_target_data(
        &self,
        _txn: &PersistenceTransaction,
        target: &Target,
    ) -> FirestoreResult<Option<TargetData>> {
        Ok(self.lock()?.targets.get(&target.canonical_id()).cloned())
    }

    fn get_target_data_for_target_id(
        &self,
        _txn: &PersistenceTransaction,
        target_id: TargetId,
    ) -> FirestoreResult<Option<TargetData>> {
        Ok(self
            .lock()?
            .targets
            .values()
            .find(|data| data.target_id == target_id)
            .cloned())
    }

    fn for_each_target(
        &self,
        _txn: &PersistenceTransaction,
        visitor: &mut dyn FnMut(&TargetData),
    ) -> FirestoreResult<()> {
        let targets: Vec<TargetData> = self.lock()?.targets.values().cloned().collect();
        targets.iter().for_each(visitor);
        Ok(())
    }

    fn add_matching_keys(
        &self,
        _txn: &PersistenceTransaction,
        keys: &DocumentKeySet,
        target_id: TargetId,
    ) -> FirestoreResult<()> {
        self.lock()?.references.add_references(keys, target_id);
        Ok(())
    }

    fn remove_matching_keys(
        &self,
        _txn: &PersistenceTransaction,
        keys: &DocumentKeySet,
        target_id: TargetId,
    ) -> FirestoreResult<()> {
        self.lock()?.references.remove_references(keys, target_id);
        Ok(())
    }

    fn remove_matching_keys_for_target_id(
        &self,
        _txn: &PersistenceTransaction,
        target_id: TargetId,
    ) -> FirestoreResult<()> {
        self.lock()?.references.remove_references_for_id(target_id);
        Ok(())
    }

    fn get_matching_keys_for_target_id(
        &self,
        _txn: &PersistenceTransaction,
        target_id: TargetId,
    ) -> FirestoreResult<DocumentKeySet> {
        Ok(self.lock()?.references.references_for_id(target_id))
    }

    fn contains_key(&self, _txn: &PersistenceTransaction, key: &DocumentKey) -> FirestoreResult<bool> {
        Ok(self.lock()?.references.contains_key(key))
    }
}
