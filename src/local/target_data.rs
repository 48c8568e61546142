use crate::core::target::Target;
use crate::model::{ListenSequenceNumber, SnapshotVersion, TargetId};

/// Why a target is being listened to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TargetPurpose {
    /// A regular query listen.
    Listen,
    /// Re-listen after the backend's existence filter disagreed with the
    /// locally tracked document count.
    ExistenceFilterMismatch,
    /// Single-document listen resolving a document in limbo.
    LimboResolution,
}

/// Metadata the client keeps for each listened target.
#[derive(Clone, Debug, PartialEq)]
pub struct TargetData {
    pub target: Target,
    pub target_id: TargetId,
    pub purpose: TargetPurpose,
    /// Last time the target was used, for LRU collection.
    pub sequence_number: ListenSequenceNumber,
    /// Version of the most recent consistent snapshot received for the target.
    pub snapshot_version: SnapshotVersion,
    /// Version at which the target last produced a snapshot without limbo
    /// documents. Only such snapshots are safe for index-free requeries.
    pub last_limbo_free_snapshot_version: SnapshotVersion,
    /// Opaque backend cursor. Empty when the target was never current.
    pub resume_token: Vec<u8>,
}

impl TargetData {
    pub fn new(
        target: Target,
        target_id: TargetId,
        purpose: TargetPurpose,
        sequence_number: ListenSequenceNumber,
    ) -> Self {
        Self {
            target,
            target_id,
            purpose,
            sequence_number,
            snapshot_version: SnapshotVersion::min(),
            last_limbo_free_snapshot_version: SnapshotVersion::min(),
            resume_token: Vec::new(),
        }
    }

    pub fn with_sequence_number(&self, sequence_number: ListenSequenceNumber) -> Self {
        Self {
            sequence_number,
            ..self.clone()
        }
    }

    pub fn with_resume_token(&self, resume_token: Vec<u8>, snapshot_version: SnapshotVersion) -> Self {
        Self {
            resume_token,
            snapshot_version,
            ..self.clone()
        }
    }

    pub fn with_last_limbo_free_snapshot_version(&self, version: SnapshotVersion) -> Self {
        Self {
            last_limbo_free_snapshot_version: version,
            ..self.clone()
        }
    }

    pub fn with_purpose(&self, purpose: TargetPurpose) -> Self {
        Self {
            purpose,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::query::Query;
    use crate::model::{ResourcePath, Timestamp};

    #[test]
    fn builders_leave_other_fields_untouched() {
        let target = Query::new(ResourcePath::from_string("rooms").unwrap()).to_target();
        let data = TargetData::new(target, 2, TargetPurpose::Listen, 7);
        let version = SnapshotVersion::from_timestamp(Timestamp::new(10, 0));
        let updated = data
            .with_resume_token(vec![1, 2], version)
            .with_sequence_number(9);
        assert_eq!(updated.target_id, 2);
        assert_eq!(updated.sequence_number, 9);
        assert_eq!(updated.snapshot_version, version);
        assert_eq!(updated.resume_token, vec![1, 2]);
        assert!(updated.last_limbo_free_snapshot_version.is_min());
    }
}
