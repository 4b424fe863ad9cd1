//! Components and the per-call context they receive.

use bus::{Ether, Member, MessageSet, MsgRef};
use common::TscClock;

use crate::timer::{TimerKind, TimerQueue};

/// A message-processing unit hosted by one dispatcher.
///
/// Components are wired at dispatcher construction: `interests` names the
/// message discriminants routed to `on_message`, in component declaration
/// order. All hooks run on the dispatcher thread; none may block.
pub trait Component<M: MessageSet>: Send {
    /// Component name (diagnostics).
    fn name(&self) -> &str;

    /// Message discriminants this component consumes.
    fn interests(&self) -> &'static [u32];

    /// Handle one message routed by discriminant.
    fn on_message(&mut self, msg: &M, ctx: &mut Ctx<'_, M>);

    /// A timer armed through [`Ctx::set_timer_at`] or
    /// [`Ctx::set_timer_after`] came due.
    fn on_timer(&mut self, _token: u64, _ctx: &mut Ctx<'_, M>) {}

    /// Runs once before the event loop starts.
    fn process_begin(&mut self, _ctx: &mut Ctx<'_, M>) {}

    /// Runs at the end of every loop iteration.
    fn process_end(&mut self, _ctx: &mut Ctx<'_, M>) {}

    /// Runs after each drained batch, when the dispatcher enables it.
    fn process_batch_end(&mut self, _ctx: &mut Ctx<'_, M>) {}
}

/// Dispatcher services exposed to a component during a callback.
pub struct Ctx<'a, M: MessageSet> {
    pub(crate) ether: Option<&'a Ether<M>>,
    pub(crate) timers: &'a mut TimerQueue,
    pub(crate) clock: &'a TscClock,
    pub(crate) now_ns: u64,
    pub(crate) component: u16,
}

impl<'a, M: MessageSet> Ctx<'a, M> {
    /// Timestamp taken at the top of the current batch.
    #[inline]
    #[must_use]
    pub fn now(&self) -> u64 {
        self.now_ns
    }

    /// The dispatcher's clock, for callers that need a fresh reading.
    #[inline]
    #[must_use]
    pub fn clock(&self) -> &TscClock {
        self.clock
    }

    /// Allocate a message on the dispatcher's Ether for in-place
    /// construction. Panics (fatal) when the dispatcher has no Ether.
    pub fn allocate<T: Member<M>>(&self, value: T) -> MsgRef<'a, M, T> {
        self.ether().allocate(value)
    }

    /// Publish a previously allocated message.
    pub fn commit<T: Member<M>>(&self, msg: MsgRef<'a, M, T>) {
        self.ether().commit(msg);
    }

    /// Allocate and commit in one call.
    pub fn publish<T: Member<M>>(&self, value: T) {
        self.ether().publish(value);
    }

    /// Arm a one-shot timer at an absolute deadline; `token` comes back in
    /// `on_timer`. A full timer queue is fatal.
    pub fn set_timer_at(&mut self, due_ns: u64, token: u64) {
        let component = self.component;
        assert!(
            self.timers.schedule_at(due_ns, component, token),
            "timer queue full"
        );
    }

    /// Arm a timer `wait_ns` from the batch timestamp; `token` comes back
    /// in `on_timer` on every fire. A full timer queue is fatal.
    pub fn set_timer_after(&mut self, kind: TimerKind, wait_ns: u64, token: u64) {
        let (component, now) = (self.component, self.now_ns);
        assert!(
            self.timers.schedule_after(kind, wait_ns, now, component, token),
            "timer queue full"
        );
    }

    fn ether(&self) -> &'a Ether<M> {
        match self.ether {
            Some(ether) => ether,
            None => panic!("dispatcher has no ether configured"),
        }
    }
}
