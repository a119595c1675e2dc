//! Conflict resolution by revision
//!
//! Whole-value, last-writer-wins by revision, with tombstones winning ties.
//! The same rule guards both directions: pull compares an incoming remote
//! document against the local entry, push compares the outbound payload
//! against what the remote already holds.

use super::types::EntryVersion;

/// Decision for one incoming write against the currently stored version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Incoming write wins and must be stored
    Apply,
    /// Stored copy has a strictly higher revision
    SkipStale,
    /// Stored tombstone at or above the incoming revision blocks a live value
    SkipTombstoned,
}

impl Resolution {
    pub fn should_apply(&self) -> bool {
        matches!(self, Resolution::Apply)
    }
}

/// Resolve an incoming version against the stored one (`None` if absent)
pub fn resolve(stored: Option<EntryVersion>, incoming: EntryVersion) -> Resolution {
    let Some(stored) = stored else {
        return Resolution::Apply;
    };

    if stored.revision > incoming.revision {
        return Resolution::SkipStale;
    }

    // incoming.revision >= stored.revision from here on
    if incoming.deleted {
        return Resolution::Apply;
    }

    if stored.deleted && stored.revision >= incoming.revision {
        return Resolution::SkipTombstoned;
    }

    Resolution::Apply
}

#[cfg(test)]
mod tests {
    use super::*;

    fn live(revision: i64) -> EntryVersion {
        EntryVersion {
            revision,
            deleted: false,
        }
    }

    fn dead(revision: i64) -> EntryVersion {
        EntryVersion {
            revision,
            deleted: true,
        }
    }

    #[test]
    fn test_absent_always_applies() {
        assert_eq!(resolve(None, live(1)), Resolution::Apply);
        assert_eq!(resolve(None, dead(4)), Resolution::Apply);
    }

    #[test]
    fn test_older_incoming_is_skipped() {
        assert_eq!(resolve(Some(live(5)), live(4)), Resolution::SkipStale);
        assert_eq!(resolve(Some(live(5)), dead(4)), Resolution::SkipStale);
        assert_eq!(resolve(Some(dead(5)), live(4)), Resolution::SkipStale);
    }

    #[test]
    fn test_tombstone_wins_ties() {
        assert_eq!(resolve(Some(live(3)), dead(3)), Resolution::Apply);
        assert_eq!(resolve(Some(dead(3)), dead(3)), Resolution::Apply);
        assert_eq!(resolve(Some(dead(3)), live(3)), Resolution::SkipTombstoned);
    }

    #[test]
    fn test_newer_live_value_clears_tombstone() {
        assert_eq!(resolve(Some(dead(3)), live(4)), Resolution::Apply);
        assert_eq!(resolve(Some(live(2)), live(3)), Resolution::Apply);
    }
}
