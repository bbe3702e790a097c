//! Per-connection pinned version state.

use crate::types::Version;
use std::cell::Cell;

/// The snapshot version a connection is currently pinned to.
///
/// Thread-confined; advancing is monotonic. Attempting to move backwards
/// is a fatal internal error, since it would make listeners observe time
/// running in reverse.
#[derive(Debug)]
pub(crate) struct VersionState {
    current: Cell<Version>,
}

impl VersionState {
    pub(crate) fn new(initial: Version) -> Self {
        Self {
            current: Cell::new(initial),
        }
    }

    pub(crate) fn current(&self) -> Version {
        self.current.get()
    }

    pub(crate) fn advance_to(&self, new: Version) {
        let old = self.current.get();
        if new < old {
            panic!("version regression: {:?} -> {:?}", old, new);
        }
        self.current.set(new);
    }

    /// True when the two versions reference identical committed data.
    ///
    /// The engine mints no version for an empty write transaction, so two
    /// versions are interchangeable exactly when they are equal. A dispatch
    /// pass over a no-op advance is skipped entirely.
    pub(crate) fn is_noop(old: Version, new: Version) -> bool {
        old == new
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance_is_monotonic() {
        let state = VersionState::new(Version(1));
        state.advance_to(Version(3));
        assert_eq!(state.current(), Version(3));
        // Advancing to the current version is allowed (no-op).
        state.advance_to(Version(3));
        assert_eq!(state.current(), Version(3));
    }

    #[test]
    #[should_panic(expected = "version regression")]
    fn test_regression_panics() {
        let state = VersionState::new(Version(5));
        state.advance_to(Version(4));
    }

    #[test]
    fn test_noop_detection() {
        assert!(VersionState::is_noop(Version(2), Version(2)));
        assert!(!VersionState::is_noop(Version(2), Version(3)));
    }
}
