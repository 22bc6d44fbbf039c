//! Persistence state of artifacts, members and folders.
//!
//! # Invariants
//! - `Detached` only leaves through a successful publish or a discard.
//! - `Deleted` is sticky until publish removes the object.
//! - Mutating an `Unchanged` object makes it `Modified`; other states keep
//!   their value.

use std::fmt::{Display, Formatter};

/// Where an object stands relative to its last committed version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PersistentState {
    /// Never committed.
    #[default]
    Detached,
    /// Matches the committed version.
    Unchanged,
    /// Committed once, edited since.
    Modified,
    /// Committed once, marked for removal.
    Deleted,
}

/// Result of asking an object to delete itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// Never committed: drop it outright.
    Discard,
    /// Keep it around, marked `Deleted`, until publish.
    MarkDeleted,
}

impl PersistentState {
    /// State after a content mutation.
    pub fn on_mutation(self) -> Self {
        match self {
            Self::Unchanged => Self::Modified,
            other => other,
        }
    }

    /// What a delete request does from this state.
    pub fn on_delete(self) -> DeleteOutcome {
        match self {
            Self::Detached => DeleteOutcome::Discard,
            Self::Unchanged | Self::Modified | Self::Deleted => DeleteOutcome::MarkDeleted,
        }
    }

    /// Returns whether the object has something to publish.
    pub fn is_pending(self) -> bool {
        self != Self::Unchanged
    }

    pub fn is_deleted(self) -> bool {
        self == Self::Deleted
    }

    pub fn code(self) -> u8 {
        match self {
            Self::Detached => 0,
            Self::Unchanged => 1,
            Self::Modified => 2,
            Self::Deleted => 3,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Detached),
            1 => Some(Self::Unchanged),
            2 => Some(Self::Modified),
            3 => Some(Self::Deleted),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Detached => "detached",
            Self::Unchanged => "unchanged",
            Self::Modified => "modified",
            Self::Deleted => "deleted",
        }
    }
}

impl Display for PersistentState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::{DeleteOutcome, PersistentState};

    #[test]
    fn mutation_only_promotes_unchanged() {
        assert_eq!(PersistentState::Unchanged.on_mutation(), PersistentState::Modified);
        assert_eq!(PersistentState::Detached.on_mutation(), PersistentState::Detached);
        assert_eq!(PersistentState::Modified.on_mutation(), PersistentState::Modified);
        assert_eq!(PersistentState::Deleted.on_mutation(), PersistentState::Deleted);
    }

    #[test]
    fn deleting_detached_discards() {
        assert_eq!(PersistentState::Detached.on_delete(), DeleteOutcome::Discard);
        assert_eq!(PersistentState::Modified.on_delete(), DeleteOutcome::MarkDeleted);
    }

    #[test]
    fn codes_round_trip() {
        for state in [
            PersistentState::Detached,
            PersistentState::Unchanged,
            PersistentState::Modified,
            PersistentState::Deleted,
        ] {
            assert_eq!(PersistentState::from_code(state.code()), Some(state));
        }
        assert_eq!(PersistentState::from_code(9), None);
    }
}
