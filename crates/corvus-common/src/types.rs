//! Machine-level type aliases.

/// A count of machine pages (see [`crate::constants::PAGE_SIZE`]).
///
/// All page quantities in the memory subsystem (capacities, run lengths,
/// size classes) are expressed in this unit.
pub type MachinePageCount = u64;
