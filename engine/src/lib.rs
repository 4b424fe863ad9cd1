//! Component runtime for the Aether trading core
//!
//! A [`Dispatcher`] is a worker thread pinned to one core that hosts a set
//! of [`Component`]s: it drains its Ether cursor in adaptive batches, fires
//! due timers, and fans each message out to the components registered for
//! its discriminant. [`Assembly`] composes the whole process: it builds one
//! Ether per [`Compartment`], wires the dispatchers, and drives lifecycle.
//!
//! Rate limiting lives here too: [`BurstCounter`] is the sliding-window
//! primitive, [`BurstController`] the Normal/Cooldown gate on top of it,
//! and [`OrderThrottle`] the per-parent orchestration over a hash table and
//! an object pool.

#![deny(warnings)]
#![deny(clippy::all)]

pub mod assembly;
pub mod burst;
pub mod component;
pub mod dispatcher;
pub mod heap;
pub mod timer;

pub use assembly::{Assembly, BackingKind, Compartment, EtherConfig, Runnable};
pub use burst::{
    BurstConfigError, BurstController, BurstCounter, ControllerState, Mode, OrderThrottle,
};
pub use component::{Component, Ctx};
pub use dispatcher::{
    AffinityFn, Dispatcher, DispatcherBuilder, DispatcherOptions, IdleStrategy, IoPoller,
};
pub use heap::PriorityHeap;
pub use timer::{TimerEntry, TimerKind, TimerQueue};
