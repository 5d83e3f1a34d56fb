use std::collections::{BTreeMap, BTreeSet};

use crate::model::*;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffEvent {
    /// Persisted timeslot no longer in the snapshot.
    Close(PersistedTimeslot),
    /// Snapshot timeslot with no persisted record.
    Open(CanonicalTimeslot),
}

/// Minimal edit script between persisted state and a fresh snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diff {
    pub closes: Vec<PersistedTimeslot>,
    pub opens: Vec<CanonicalTimeslot>,
}

impl Diff {
    pub fn is_empty(&self) -> bool {
        self.closes.is_empty() && self.opens.is_empty()
    }

    pub fn len(&self) -> usize {
        self.closes.len() + self.opens.len()
    }

    /// Closes first, then opens; each group in key order.
    pub fn into_events(self) -> Vec<DiffEvent> {
        self.closes
            .into_iter()
            .map(DiffEvent::Close)
            .chain(self.opens.into_iter().map(DiffEvent::Open))
            .collect()
    }
}

/// Compare a canonical snapshot against persisted rows, by identity key.
///
/// Pure: no I/O. Soft-deleted rows are ignored; duplicate persisted keys
/// collapse last-write-wins before diffing.
pub fn diff(canonical: &[CanonicalTimeslot], persisted: Vec<PersistedTimeslot>) -> Diff {
    let mut existing: BTreeMap<CanonicalTimeslot, PersistedTimeslot> = BTreeMap::new();
    for row in persisted.into_iter().filter(PersistedTimeslot::is_active) {
        existing.insert(row.slot.clone(), row);
    }
    let current: BTreeSet<&CanonicalTimeslot> = canonical.iter().collect();

    let opens = current
        .iter()
        .filter(|slot| !existing.contains_key(**slot))
        .map(|slot| (*slot).clone())
        .collect();
    let closes = existing
        .into_iter()
        .filter(|(slot, _)| !current.contains(slot))
        .map(|(_, row)| row)
        .collect();

    Diff { closes, opens }
}
