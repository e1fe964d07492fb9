//! Fibre identifiers.

use crate::util::ArenaIndex;
use core::fmt;

/// Identifies a fibre for the lifetime of its slot in the fibre table.
///
/// The wrapped arena index carries a generation counter, so an id that
/// outlives its fibre never resolves to a later occupant of the same slot.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FibreId(ArenaIndex);

impl FibreId {
    /// Wraps an arena index (internal use and tests).
    #[must_use]
    pub const fn from_arena(index: ArenaIndex) -> Self {
        Self(index)
    }

    /// Returns the underlying arena index.
    #[must_use]
    pub const fn arena_index(self) -> ArenaIndex {
        self.0
    }
}

impl fmt::Debug for FibreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FibreId({}:{})", self.0.slot(), self.0.generation())
    }
}

impl fmt::Display for FibreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fibre-{}", self.0.slot())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_uses_slot_only() {
        let id = FibreId::from_arena(ArenaIndex::new(3, 7));
        assert_eq!(id.to_string(), "fibre-3");
        assert_eq!(format!("{id:?}"), "FibreId(3:7)");
    }
}
