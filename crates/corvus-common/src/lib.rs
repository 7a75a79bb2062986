//! # corvus-common
//!
//! Common types, constants, and utilities for the Corvus query engine.
//!
//! This crate provides the foundational pieces shared by the other Corvus
//! components:
//!
//! - **Constants**: page geometry and memory limits in [`constants`]
//! - **Bit utilities**: power-of-two math in [`bits`]
//! - **Types**: machine-level aliases such as [`MachinePageCount`]

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bits;
pub mod constants;
pub mod types;

pub use constants::*;
pub use types::MachinePageCount;
