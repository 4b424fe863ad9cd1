//! Top-level composition: ethers, compartments, lifecycle.
//!
//! The assembly owns the process topology. Each compartment binds one Ether
//! and the dispatchers reading it; `start` launches every dispatcher thread
//! and `stop` flags and joins them. Two ethers can never map the same
//! shared-memory path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{bail, Context};
use bus::{Backing, Ether, MessageSet};
use common::TscClock;
use rustc_hash::FxHashMap;
use tracing::{info, warn};

use crate::dispatcher::DispatcherBuilder;

/// Where an Ether's buffer lives.
#[derive(Debug, Clone)]
pub enum BackingKind {
    /// Process-private allocation; always reset at startup.
    Private,
    /// Named POSIX shared-memory object, attachable across processes.
    Shared {
        /// POSIX shm path, e.g. `/md-ether`.
        path: String,
    },
}

/// Configuration for one Ether.
#[derive(Debug, Clone)]
pub struct EtherConfig {
    /// Ether name (diagnostics, duplicate-path reporting).
    pub name: String,
    /// Slot count; power of two.
    pub capacity: usize,
    /// Buffer placement.
    pub backing: BackingKind,
    /// Zero and re-stamp the buffer instead of validating it.
    pub reset: bool,
}

impl EtherConfig {
    /// Private ether of `capacity` slots.
    #[must_use]
    pub fn private(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            name: name.into(),
            capacity,
            backing: BackingKind::Private,
            reset: true,
        }
    }

    /// Shared-memory ether at `path`.
    #[must_use]
    pub fn shared(
        name: impl Into<String>,
        capacity: usize,
        path: impl Into<String>,
        reset: bool,
    ) -> Self {
        Self {
            name: name.into(),
            capacity,
            backing: BackingKind::Shared { path: path.into() },
            reset,
        }
    }
}

/// Lifecycle surface the assembly drives. Implemented by [`Compartment`];
/// object-safe so compartments over different message sets can live side by
/// side.
pub trait Runnable {
    /// Build and launch the dispatcher threads.
    fn start(&mut self, clock: &Arc<TscClock>) -> anyhow::Result<()>;

    /// Signal every dispatcher and join. Idempotent.
    fn stop(&mut self);
}

/// A group of dispatchers bound to one Ether.
pub struct Compartment<M: MessageSet> {
    ether: Arc<Ether<M>>,
    builders: Vec<DispatcherBuilder<M>>,
    running: Vec<(Arc<AtomicBool>, JoinHandle<()>)>,
}

impl<M: MessageSet> Compartment<M> {
    /// Create an empty compartment over `ether`.
    #[must_use]
    pub fn new(ether: Arc<Ether<M>>) -> Self {
        Self {
            ether,
            builders: Vec::new(),
            running: Vec::new(),
        }
    }

    /// Queue a dispatcher for launch. Its cursor is created at start time,
    /// positioned after whatever the producer had claimed by then.
    pub fn add_dispatcher(&mut self, builder: DispatcherBuilder<M>) {
        self.builders.push(builder);
    }

    /// The Ether this compartment is bound to.
    #[must_use]
    pub fn ether(&self) -> &Arc<Ether<M>> {
        &self.ether
    }
}

impl<M: MessageSet> Runnable for Compartment<M> {
    fn start(&mut self, clock: &Arc<TscClock>) -> anyhow::Result<()> {
        for builder in self.builders.drain(..) {
            let stop = Arc::new(AtomicBool::new(false));
            let dispatcher = builder.build(
                Some(Arc::clone(&self.ether)),
                Arc::clone(clock),
                Arc::clone(&stop),
            );
            let name = dispatcher.name().to_string();
            let handle = std::thread::Builder::new()
                .name(name.clone())
                .spawn(move || dispatcher.run())
                .with_context(|| format!("spawning dispatcher thread '{name}'"))?;
            self.running.push((stop, handle));
        }
        Ok(())
    }

    fn stop(&mut self) {
        for (flag, _) in &self.running {
            flag.store(true, Ordering::Relaxed);
        }
        for (_, handle) in self.running.drain(..) {
            if handle.join().is_err() {
                warn!("dispatcher thread terminated abnormally");
            }
        }
    }
}

/// Process-level owner of ethers and compartments.
pub struct Assembly {
    clock: Arc<TscClock>,
    compartments: Vec<Box<dyn Runnable>>,
    shm_bindings: FxHashMap<String, String>,
}

impl Assembly {
    /// Create an assembly with a freshly calibrated clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(TscClock::new()))
    }

    /// Create an assembly around an existing clock.
    #[must_use]
    pub fn with_clock(clock: Arc<TscClock>) -> Self {
        Self {
            clock,
            compartments: Vec::new(),
            shm_bindings: FxHashMap::default(),
        }
    }

    /// The clock shared with every dispatcher.
    #[must_use]
    pub fn clock(&self) -> &Arc<TscClock> {
        &self.clock
    }

    /// Allocate an Ether's backing per `config` and bind it.
    ///
    /// Shared paths are deduplicated across the assembly: binding the same
    /// path to a second ether is a configuration error, as is a signature
    /// or capacity mismatch against a persisted buffer. Construction
    /// aborts with no partial state.
    pub fn add_ether<M: MessageSet>(&mut self, config: EtherConfig) -> anyhow::Result<Arc<Ether<M>>> {
        let required = Ether::<M>::required_size(config.capacity);
        let (backing, reset) = match &config.backing {
            BackingKind::Private => (Backing::private(required), true),
            BackingKind::Shared { path } => {
                if let Some(owner) = self.shm_bindings.get(path) {
                    bail!("shared memory path '{path}' is already bound to ether '{owner}'");
                }
                self.shm_bindings
                    .insert(path.clone(), config.name.clone());
                let backing = Backing::shared(path, required)
                    .with_context(|| format!("mapping shared memory '{path}'"))?;
                (backing, config.reset)
            }
        };

        let ether = Ether::initialize(config.name.clone(), config.capacity, backing, reset)?;
        info!(ether = %config.name, capacity = config.capacity, "ether bound");
        Ok(Arc::new(ether))
    }

    /// Register a compartment for lifecycle management.
    pub fn add_compartment(&mut self, compartment: impl Runnable + 'static) {
        self.compartments.push(Box::new(compartment));
    }

    /// Launch every dispatcher thread.
    pub fn start(&mut self) -> anyhow::Result<()> {
        for compartment in &mut self.compartments {
            compartment.start(&self.clock)?;
        }
        info!(compartments = self.compartments.len(), "assembly started");
        Ok(())
    }

    /// Signal every dispatcher and join. Idempotent.
    pub fn stop(&mut self) {
        for compartment in &mut self.compartments {
            compartment.stop();
        }
    }
}

impl Default for Assembly {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Assembly {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Copy, Debug)]
    #[repr(C)]
    struct Ping {
        seq: u64,
    }

    bus::messages! {
        enum AssemblyMsg {
            Ping(Ping),
        }
    }

    #[test]
    fn duplicate_shared_paths_are_rejected() {
        let path = format!("/aether-assembly-test-{}", std::process::id());
        let mut assembly = Assembly::new();

        let first = assembly
            .add_ether::<AssemblyMsg>(EtherConfig::shared("alpha", 16, &path, true))
            .expect("first binding");
        first.publish(Ping { seq: 1 });

        let err = assembly
            .add_ether::<AssemblyMsg>(EtherConfig::shared("beta", 16, &path, false))
            .expect_err("second binding of the same path");
        assert!(err.to_string().contains("already bound"));

        bus::backing::SharedBacking::unlink(&path).expect("unlink");
    }

    #[test]
    fn private_ethers_are_always_reset() {
        let mut assembly = Assembly::new();
        let ether = assembly
            .add_ether::<AssemblyMsg>(EtherConfig::private("md", 64))
            .expect("private ether");
        assert_eq!(ether.sequence(), 0);
        ether.publish(Ping { seq: 9 });
        assert_eq!(ether.sequence(), 1);
    }
}
