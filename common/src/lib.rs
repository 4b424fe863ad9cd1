//! Core types for the Aether trading runtime
//!
//! Everything here is hot-path safe after construction: no allocation, no
//! locking, no syscalls.

#![deny(warnings)]
#![deny(clippy::all)]

pub mod clock;
pub mod types;

pub use clock::TscClock;
pub use types::{Px, Qty, Symbol, Ts};
