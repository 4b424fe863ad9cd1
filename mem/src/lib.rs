//! Hot-path memory primitives
//!
//! Nothing in this crate touches the system allocator after construction,
//! except the pool's tracked fallback path (a counted jitter event).

#![deny(warnings)]
#![deny(clippy::all)]

pub mod mirrored;
pub mod pool;

pub use mirrored::MirroredRing;
pub use pool::Pool;
