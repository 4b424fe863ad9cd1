//! The dispatcher: one worker thread hosting a set of components.
//!
//! Per loop iteration: drain the Ether cursor in an adaptive batch, poll
//! sockets when configured, fire due timers, run the batch-end hook, and
//! pause or yield when nothing happened. Failure policy is detection over
//! recovery: a lapped cursor or a panic escaping a handler logs one
//! structured error and terminates the process, because silently losing
//! sequence order would corrupt everything downstream.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bus::{Cursor, Ether, EtherError, MessageSet};
use common::TscClock;
use tracing::{error, info};

use crate::component::{Component, Ctx};
use crate::timer::{TimerEntry, TimerKind, TimerQueue, DEFAULT_TIMER_CAPACITY};

/// What an idle iteration does with the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleStrategy {
    /// CPU pause hint; lowest wake-up latency.
    Pause,
    /// Cooperative yield; for non-critical dispatchers sharing cores.
    Yield,
}

/// External socket-polling seam. Implementations must not block: the
/// dispatcher calls this once per iteration with zero-timeout semantics.
pub trait IoPoller: Send {
    /// Dispatch ready socket events; returns how many were handled.
    fn poll(&mut self) -> usize;
}

/// External CPU-affinity hook, consulted once at thread start.
pub type AffinityFn = fn(usize) -> std::io::Result<()>;

/// Dispatcher tuning knobs.
#[derive(Debug, Clone)]
pub struct DispatcherOptions {
    /// Starting (and floor) batch size for the adaptive drain.
    pub batch_initial: usize,
    /// Idle behavior.
    pub idle: IdleStrategy,
    /// Run `process_batch_end` every iteration.
    pub batch_end: bool,
    /// Fire timers from the event loop.
    pub timers: bool,
    /// Capacity of the timer queue.
    pub timer_capacity: usize,
    /// Core to pin to, resolved through the affinity hook.
    pub core: Option<usize>,
}

impl Default for DispatcherOptions {
    fn default() -> Self {
        Self {
            batch_initial: 64,
            idle: IdleStrategy::Pause,
            batch_end: true,
            timers: true,
            timer_capacity: DEFAULT_TIMER_CAPACITY,
            core: None,
        }
    }
}

enum Hook {
    Begin,
    End,
    BatchEnd,
}

/// Builder for a dispatcher's compile-time-style wiring: components are
/// registered in declaration order and compiled into a per-message-ID
/// dispatch table at build time.
pub struct DispatcherBuilder<M: MessageSet> {
    name: String,
    components: Vec<Box<dyn Component<M>>>,
    options: DispatcherOptions,
    affinity: Option<AffinityFn>,
    io: Option<Box<dyn IoPoller>>,
}

impl<M: MessageSet> DispatcherBuilder<M> {
    /// Start a builder for a dispatcher called `name`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            components: Vec::new(),
            options: DispatcherOptions::default(),
            affinity: None,
            io: None,
        }
    }

    /// Add a component. Routing and hook order follow registration order.
    #[must_use]
    pub fn component(mut self, component: impl Component<M> + 'static) -> Self {
        self.components.push(Box::new(component));
        self
    }

    /// Override the default options.
    #[must_use]
    pub fn options(mut self, options: DispatcherOptions) -> Self {
        self.options = options;
        self
    }

    /// Install the external CPU-affinity hook.
    #[must_use]
    pub fn affinity(mut self, affinity: AffinityFn) -> Self {
        self.affinity = Some(affinity);
        self
    }

    /// Install the external socket poller.
    #[must_use]
    pub fn io_poller(mut self, io: impl IoPoller + 'static) -> Self {
        self.io = Some(Box::new(io));
        self
    }

    /// Compile the wiring into a runnable dispatcher.
    ///
    /// Panics on configuration errors: no components, or a component
    /// subscribed to a discriminant outside the message set.
    #[must_use]
    pub fn build(
        self,
        ether: Option<Arc<Ether<M>>>,
        clock: Arc<TscClock>,
        stop: Arc<AtomicBool>,
    ) -> Dispatcher<M> {
        assert!(
            !self.components.is_empty(),
            "dispatcher '{}' needs at least one component",
            self.name
        );
        assert!(
            self.components.len() <= usize::from(u16::MAX),
            "dispatcher '{}' has too many components",
            self.name
        );

        let mut table: Vec<Vec<u16>> = (0..M::COUNT).map(|_| Vec::new()).collect();
        for (idx, component) in self.components.iter().enumerate() {
            for &id in component.interests() {
                assert!(
                    id < M::COUNT,
                    "component '{}' subscribes to unknown message id {id}",
                    component.name()
                );
                table[id as usize].push(idx as u16);
            }
        }
        let table = table
            .into_iter()
            .map(Vec::into_boxed_slice)
            .collect::<Vec<_>>()
            .into_boxed_slice();

        let cursor = ether.as_ref().map(|e| Cursor::new(Arc::clone(e)));
        let timer_scratch = Vec::with_capacity(self.options.timer_capacity);

        Dispatcher {
            name: self.name,
            ether,
            cursor,
            components: self.components,
            table,
            timers: TimerQueue::new(self.options.timer_capacity),
            timer_scratch,
            clock,
            stop,
            options: self.options,
            affinity: self.affinity,
            io: self.io,
        }
    }
}

/// A worker hosting components; consumed by [`Dispatcher::run`] on its
/// thread.
pub struct Dispatcher<M: MessageSet> {
    name: String,
    ether: Option<Arc<Ether<M>>>,
    cursor: Option<Cursor<M>>,
    components: Vec<Box<dyn Component<M>>>,
    table: Box<[Box<[u16]>]>,
    timers: TimerQueue,
    timer_scratch: Vec<TimerEntry>,
    clock: Arc<TscClock>,
    stop: Arc<AtomicBool>,
    options: DispatcherOptions,
    affinity: Option<AffinityFn>,
    io: Option<Box<dyn IoPoller>>,
}

impl<M: MessageSet> Dispatcher<M> {
    /// Dispatcher name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Flag that makes [`Dispatcher::run`] return at the next iteration.
    #[must_use]
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Run the event loop until the stop flag is raised.
    ///
    /// Fatal conditions (a lapped cursor, a panic escaping any component
    /// hook, an affinity failure) log one structured error and exit the
    /// process with a non-zero code.
    pub fn run(mut self) {
        let name = self.name.clone();

        if let (Some(core), Some(set_affinity)) = (self.options.core, self.affinity) {
            if let Err(err) = set_affinity(core) {
                Self::fatal(&name, &format!("failed to pin to core {core}: {err}"));
            }
        }

        info!(dispatcher = %name, components = self.components.len(), "dispatcher running");
        match catch_unwind(AssertUnwindSafe(|| self.event_loop())) {
            Ok(Ok(())) => info!(dispatcher = %name, "dispatcher stopped"),
            Ok(Err(err)) => Self::fatal(&name, &err.to_string()),
            Err(payload) => Self::fatal(&name, &panic_message(payload.as_ref())),
        }
    }

    fn event_loop(&mut self) -> Result<(), EtherError> {
        let initial_batch = self.options.batch_initial.max(1);
        // Latency-sensitive configurations cap the batch low; pure
        // throughput drains run much deeper.
        let max_batch = if self.io.is_some() || self.options.batch_end {
            1024
        } else if self.options.timers {
            2048
        } else {
            65536
        };
        let mut batch = initial_batch;

        self.run_hook(&Hook::Begin);

        while !self.stop.load(Ordering::Relaxed) {
            let mut read = 0;
            if self.cursor.is_some() {
                read = self.poll_ether(batch)?;
                let backlog = self.cursor.as_ref().map_or(0, Cursor::queue_len);
                if backlog > (batch << 3) as u64 {
                    batch = (batch << 1).min(max_batch);
                } else if read < batch && batch > initial_batch {
                    batch = (batch >> 1).max(initial_batch);
                }
            }

            let io_events = match self.io.as_mut() {
                Some(io) => io.poll(),
                None => 0,
            };

            let fired = if self.options.timers {
                self.fire_timers()
            } else {
                0
            };

            if self.options.batch_end {
                self.run_hook(&Hook::BatchEnd);
            }

            if read == 0 && io_events == 0 && fired == 0 {
                match self.options.idle {
                    IdleStrategy::Pause => std::hint::spin_loop(),
                    IdleStrategy::Yield => std::thread::yield_now(),
                }
            }

            self.run_hook(&Hook::End);
        }
        Ok(())
    }

    fn poll_ether(&mut self, batch: usize) -> Result<usize, EtherError> {
        let Self {
            cursor,
            components,
            table,
            timers,
            clock,
            ether,
            ..
        } = self;
        let Some(cursor) = cursor.as_mut() else {
            return Ok(0);
        };

        let now = clock.now();
        let eth = ether.as_deref();
        let mut handler = |msg: M| {
            let id = msg.id() as usize;
            for &ci in table[id].iter() {
                let mut ctx = Ctx {
                    ether: eth,
                    timers: &mut *timers,
                    clock: clock.as_ref(),
                    now_ns: now,
                    component: ci,
                };
                components[usize::from(ci)].on_message(&msg, &mut ctx);
            }
        };
        cursor.poll(batch, &mut handler)
    }

    fn fire_timers(&mut self) -> usize {
        let now = self.clock.now();
        let mut scratch = std::mem::take(&mut self.timer_scratch);
        self.timers.drain_due(now, &mut scratch);
        let fired = scratch.len();

        if fired > 0 {
            let Self {
                components,
                timers,
                clock,
                ether,
                ..
            } = self;
            let eth = ether.as_deref();
            for entry in scratch.drain(..) {
                let mut ctx = Ctx {
                    ether: eth,
                    timers: &mut *timers,
                    clock: clock.as_ref(),
                    now_ns: now,
                    component: entry.component,
                };
                components[usize::from(entry.component)].on_timer(entry.token, &mut ctx);

                if entry.kind == TimerKind::Recurring {
                    let rearmed = TimerEntry {
                        due_ns: now.saturating_add(entry.period_ns),
                        ..entry
                    };
                    assert!(timers.requeue(rearmed), "timer queue full while re-arming");
                }
            }
        }

        self.timer_scratch = scratch;
        fired
    }

    fn run_hook(&mut self, hook: &Hook) {
        let Self {
            components,
            timers,
            clock,
            ether,
            ..
        } = self;
        let now = clock.now();
        let eth = ether.as_deref();
        for (idx, component) in components.iter_mut().enumerate() {
            let mut ctx = Ctx {
                ether: eth,
                timers: &mut *timers,
                clock: clock.as_ref(),
                now_ns: now,
                component: idx as u16,
            };
            match hook {
                Hook::Begin => component.process_begin(&mut ctx),
                Hook::End => component.process_end(&mut ctx),
                Hook::BatchEnd => component.process_batch_end(&mut ctx),
            }
        }
    }

    fn fatal(name: &str, errmsg: &str) -> ! {
        error!(dispatcher = name, error = errmsg, "fatal dispatcher error");
        std::process::exit(1);
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("component handler panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("component handler panicked: {s}")
    } else {
        "component handler panicked".to_string()
    }
}
