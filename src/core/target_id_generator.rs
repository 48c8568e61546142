use crate::model::TargetId;

/// Hands out target ids from disjoint sequences: even ids for targets
/// persisted in the target cache, odd ids for the sync engine's limbo
/// resolution targets.
#[derive(Clone, Debug)]
pub struct TargetIdGenerator {
    last_id: TargetId,
}

impl TargetIdGenerator {
    /// Even ids strictly above `after`.
    pub fn for_target_cache(after: TargetId) -> Self {
        let last_id = if after % 2 == 0 { after } else { after - 1 };
        Self { last_id }
    }

    pub fn for_sync_engine() -> Self {
        Self { last_id: -1 }
    }

    pub fn next_id(&mut self) -> TargetId {
        self.last_id += 2;
        self.last_id
    }
}
