//! Order burst control: sliding-window counters and the Normal/Cooldown gate.

use mem::Pool;
use tables::{HashMapSt, TableError};
use tracing::debug;

/// Invalid burst-control construction parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BurstConfigError {
    /// Window shorter than one millisecond.
    #[error("window must be at least 1ms, got {0}ns")]
    WindowTooShort(u64),
    /// Limit outside `1..=10_000`.
    #[error("limit must be within 1..=10000, got {0}")]
    LimitOutOfRange(u64),
}

/// Sliding-window event counter with slotted decay.
///
/// The window is divided into `B` equal slots; rolling forward lazily
/// clears only the slots that aged out since the last event. The running
/// total always equals the sum of the live slots.
#[derive(Debug, Clone, Copy)]
pub struct BurstCounter<const B: usize = 20> {
    slots: [u64; B],
    limit: u64,
    width_ns: u64,
    last_ns: u64,
    total: u64,
}

impl<const B: usize> BurstCounter<B> {
    /// Create a counter for `limit` events per `window_ns`.
    ///
    /// The window must be at least 1 ms and the limit within `1..=10_000`;
    /// slot width is `ceil(window / B)`.
    pub fn new(window_ns: u64, limit: u64) -> Result<Self, BurstConfigError> {
        const { assert!(B > 0, "counter needs at least one slot") };
        if window_ns < 1_000_000 {
            return Err(BurstConfigError::WindowTooShort(window_ns));
        }
        if !(1..=10_000).contains(&limit) {
            return Err(BurstConfigError::LimitOutOfRange(limit));
        }
        Ok(Self {
            slots: [0; B],
            limit,
            width_ns: window_ns.div_ceil(B as u64),
            last_ns: 0,
            total: 0,
        })
    }

    /// Count one event at `ts_ns`.
    ///
    /// Returns false iff the event would push the window total past the
    /// limit. Timestamps older than the stored head are credited to their
    /// historical slot when still inside the window, and accepted uncounted
    /// once the whole window has passed them by; the head never moves
    /// backward.
    #[inline]
    pub fn increment(&mut self, ts_ns: u64) -> bool {
        let tick = ts_ns / self.width_ns;
        let last_tick = self.last_ns / self.width_ns;

        if tick >= last_tick {
            self.roll(last_tick, tick - last_tick);
            self.last_ns = ts_ns;
        } else if last_tick - tick >= B as u64 {
            // Entire window has moved past this event.
            return true;
        }

        if self.total >= self.limit {
            return false;
        }
        self.slots[(tick % B as u64) as usize] += 1;
        self.total += 1;
        true
    }

    /// Events currently inside the window.
    #[must_use]
    pub fn value(&self) -> u64 {
        self.total
    }

    /// Configured window limit.
    #[must_use]
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Clear the slots that aged out since the last observed tick.
    #[inline]
    fn roll(&mut self, last_tick: u64, delta: u64) {
        if delta == 0 {
            return;
        }
        if delta >= B as u64 {
            self.slots = [0; B];
            self.total = 0;
            return;
        }
        for i in 1..=delta {
            let idx = ((last_tick + i) % B as u64) as usize;
            self.total -= self.slots[idx];
            self.slots[idx] = 0;
        }
    }
}

/// Gate mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Events flow while the heatup window stays under its limit.
    Normal,
    /// Events are rejected until the flow quiets down.
    Cooldown,
}

/// Snapshot of the controller, for monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerState {
    /// Current mode.
    pub mode: Mode,
    /// When Cooldown was entered (zero in Normal).
    pub start_time: u64,
    /// Events counted in the current window.
    pub total_count: u64,
}

#[derive(Debug, Clone, Copy)]
struct GateConfig {
    window_ns: u64,
    max_cnt: u64,
    slot_width_ns: u64,
}

impl GateConfig {
    fn new(window_ns: u64, max_cnt: u64, slots: usize) -> Self {
        let mut slot_width_ns = window_ns / slots as u64;
        if slot_width_ns == 0 {
            slot_width_ns = 1;
        }
        Self {
            window_ns,
            max_cnt,
            slot_width_ns,
        }
    }
}

/// Two-mode burst gate over a slotted sliding window.
///
/// In Normal mode events pass while the heatup window count stays under its
/// limit; the event that would exceed it flips the gate to Cooldown, which
/// rejects everything until the flow has been quiet for the cooldown window.
/// Every mode switch clears the slot ring.
pub struct BurstController<const SLOTS: usize = 1024> {
    heatup: GateConfig,
    cooldown: GateConfig,
    mode: Mode,
    cooldown_start: u64,
    counters: [u64; SLOTS],
    total: u64,
    last_slot: u64,
}

impl<const SLOTS: usize> BurstController<SLOTS> {
    /// Create a gate from the heatup and cooldown `(window_ns, max_count)`
    /// pairs.
    #[must_use]
    pub fn new(
        heatup_window_ns: u64,
        heatup_max_cnt: u64,
        cooldown_window_ns: u64,
        cooldown_max_cnt: u64,
    ) -> Self {
        const { assert!(SLOTS.is_power_of_two(), "slot count must be a power of two") };
        Self {
            heatup: GateConfig::new(heatup_window_ns, heatup_max_cnt, SLOTS),
            cooldown: GateConfig::new(cooldown_window_ns, cooldown_max_cnt, SLOTS),
            mode: Mode::Normal,
            cooldown_start: 0,
            counters: [0; SLOTS],
            total: 0,
            last_slot: 0,
        }
    }

    /// Decide whether the event at `tm` may pass, recording it either way.
    ///
    /// Timestamps need not be monotonic: an event within `SLOTS` slots of
    /// the head is credited to its historical slot without advancing the
    /// head, and one older than the whole ring is rejected outright.
    pub fn evaluate(&mut self, tm: u64) -> bool {
        let abs_slot = tm / self.config().slot_width_ns;

        if abs_slot < self.last_slot {
            if self.last_slot - abs_slot >= SLOTS as u64 {
                // Older than anything the ring still remembers.
                return false;
            }
            // Valid historical slot; no pruning, the head stays put.
        } else {
            let delta = abs_slot - self.last_slot;
            if delta >= SLOTS as u64 {
                self.counters = [0; SLOTS];
                self.total = 0;
            } else if delta > 0 {
                for i in 1..=delta {
                    let idx = ((self.last_slot + i) & (SLOTS as u64 - 1)) as usize;
                    self.total -= self.counters[idx];
                    self.counters[idx] = 0;
                }
            }
            self.last_slot = abs_slot;
        }

        match self.mode {
            Mode::Normal => {
                if self.total < self.heatup.max_cnt {
                    self.bump(abs_slot);
                    true
                } else {
                    self.switch_mode(Mode::Cooldown, tm);
                    let slot = tm / self.cooldown.slot_width_ns;
                    self.last_slot = slot;
                    self.bump(slot);
                    false
                }
            }
            Mode::Cooldown => {
                if tm.saturating_sub(self.cooldown_start) >= self.cooldown.window_ns
                    && self.total <= self.cooldown.max_cnt
                {
                    self.switch_mode(Mode::Normal, tm);
                    let slot = tm / self.heatup.slot_width_ns;
                    self.last_slot = slot;
                    self.bump(slot);
                    true
                } else {
                    self.bump(abs_slot);
                    false
                }
            }
        }
    }

    /// Current mode, cooldown start, and window count.
    #[must_use]
    pub fn state(&self) -> ControllerState {
        ControllerState {
            mode: self.mode,
            start_time: if self.mode == Mode::Normal {
                0
            } else {
                self.cooldown_start
            },
            total_count: self.total,
        }
    }

    fn config(&self) -> &GateConfig {
        match self.mode {
            Mode::Normal => &self.heatup,
            Mode::Cooldown => &self.cooldown,
        }
    }

    fn switch_mode(&mut self, mode: Mode, now: u64) {
        debug!(?mode, now, "burst gate mode switch");
        self.mode = mode;
        if mode == Mode::Cooldown {
            self.cooldown_start = now;
        }
        self.counters = [0; SLOTS];
        self.total = 0;
    }

    #[inline]
    fn bump(&mut self, abs_slot: u64) {
        self.counters[(abs_slot & (SLOTS as u64 - 1)) as usize] += 1;
        self.total += 1;
    }
}

/// Per-parent order throttling.
///
/// Owns its hash table and counter pool explicitly (one throttle per
/// dispatcher thread), so hot-path checks never allocate or lock.
pub struct OrderThrottle<const B: usize = 20> {
    table: HashMapSt<u64, BurstCounter<B>>,
    pool: Pool<BurstCounter<B>>,
    prototype: BurstCounter<B>,
}

impl<const B: usize> OrderThrottle<B> {
    /// Create a throttle for up to `max_parents` concurrently registered
    /// parents (power of two, at least 16), each allowed `limit` children
    /// per `window_ns`.
    pub fn new(max_parents: usize, window_ns: u64, limit: u64) -> Result<Self, BurstConfigError> {
        let prototype = BurstCounter::new(window_ns, limit)?;
        Ok(Self {
            table: HashMapSt::new(max_parents),
            pool: Pool::new(max_parents),
            prototype,
        })
    }

    /// Register a parent order. Idempotent; reports table exhaustion.
    pub fn add_parent(&mut self, parent: u64) -> Result<(), TableError> {
        if self.table.find(parent).is_some() {
            return Ok(());
        }
        let counter = self.pool.allocate(self.prototype);
        if let Err(e) = self.table.insert(parent, counter) {
            // Do not leak the pool block on a full table.
            // SAFETY: just allocated, never shared.
            unsafe { self.pool.free(counter) };
            return Err(e);
        }
        Ok(())
    }

    /// Unregister a parent and recycle its counter.
    pub fn remove_parent(&mut self, parent: u64) {
        if let Some(counter) = self.table.find(parent) {
            self.table.erase(parent);
            // SAFETY: the pointer came from our pool and is no longer
            // reachable through the table.
            unsafe { self.pool.free(counter) };
        }
    }

    /// Hot path: may this parent place one more child order at `now_ns`?
    /// Unknown parents are rejected.
    #[inline]
    pub fn allow_child(&mut self, parent: u64, now_ns: u64) -> bool {
        match self.table.find(parent) {
            // SAFETY: &mut self gives exclusive access to pool-owned
            // counters reachable through the table.
            Some(counter) => unsafe { (*counter.as_ptr()).increment(now_ns) },
            None => false,
        }
    }

    /// Children counted in the parent's current window.
    #[must_use]
    pub fn child_count(&self, parent: u64) -> u64 {
        match self.table.find(parent) {
            // SAFETY: shared read of a pool-owned counter.
            Some(counter) => unsafe { (*counter.as_ptr()).value() },
            None => 0,
        }
    }

    /// Currently registered parents.
    #[must_use]
    pub fn parent_count(&self) -> usize {
        self.table.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: u64 = 1_000_000;

    #[test]
    fn construction_validates_window_and_limit() {
        assert_eq!(
            BurstCounter::<20>::new(500_000, 3).unwrap_err(),
            BurstConfigError::WindowTooShort(500_000)
        );
        assert_eq!(
            BurstCounter::<20>::new(20 * MS, 0).unwrap_err(),
            BurstConfigError::LimitOutOfRange(0)
        );
        assert_eq!(
            BurstCounter::<20>::new(20 * MS, 10_001).unwrap_err(),
            BurstConfigError::LimitOutOfRange(10_001)
        );
        assert!(BurstCounter::<20>::new(MS, 1).is_ok());
    }

    #[test]
    fn limit_blocks_the_fourth_event_and_window_recovers() {
        // 20ms window, 20 slots, limit 3.
        let mut counter = BurstCounter::<20>::new(20 * MS, 3).expect("counter");
        let t0 = 1_000_000_000u64;

        assert!(counter.increment(t0));
        assert!(counter.increment(t0 + 50_000));
        assert!(counter.increment(t0 + 200_000));
        assert!(!counter.increment(t0 + 200_001));
        assert_eq!(counter.value(), 3);

        // 25ms later the whole window has rolled.
        assert!(counter.increment(t0 + 25 * MS));
        assert_eq!(counter.value(), 1);
    }

    #[test]
    fn total_always_matches_slot_sum() {
        let mut counter = BurstCounter::<20>::new(20 * MS, 10_000).expect("counter");
        let mut state = 0x1234_5678u64;
        let mut ts = 1_000_000u64;
        for _ in 0..5_000 {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
            ts += state >> 52; // 0..4096ns steps
            counter.increment(ts);
            let sum: u64 = counter.slots.iter().sum();
            assert_eq!(counter.value(), sum);
            assert!(counter.value() <= counter.limit());
        }
    }

    #[test]
    fn stale_timestamps_credit_history_without_rolling_back() {
        let mut counter = BurstCounter::<20>::new(20 * MS, 5).expect("counter");
        let t0 = 100 * MS;
        assert!(counter.increment(t0));
        // 3ms earlier: inside the window, lands in its own slot.
        assert!(counter.increment(t0 - 3 * MS));
        assert_eq!(counter.value(), 2);
        // Head did not move backward: rolling forward clears as if from t0.
        assert!(counter.increment(t0 + MS));
        assert_eq!(counter.value(), 3);
        // Older than the whole window: accepted but not counted.
        assert!(counter.increment(t0 - 50 * MS));
        assert_eq!(counter.value(), 3);
    }

    #[test]
    fn controller_lifecycle_matches_the_gate_contract() {
        // Heatup 100ms/max 5, cooldown 100ms/max-to-exit 2.
        let mut gate = BurstController::<1024>::new(100 * MS, 5, 100 * MS, 2);

        for _ in 0..5 {
            assert!(gate.evaluate(0));
        }
        assert!(!gate.evaluate(0), "sixth event must trip the gate");
        assert_eq!(gate.state().mode, Mode::Cooldown);
        assert_eq!(gate.state().start_time, 0);

        assert!(!gate.evaluate(50 * MS), "still cooling down");

        // Quiet until past the cooldown window: re-enters Normal.
        assert!(gate.evaluate(110 * MS));
        let state = gate.state();
        assert_eq!(state.mode, Mode::Normal);
        assert_eq!(state.total_count, 1);
    }

    #[test]
    fn noisy_cooldown_does_not_reopen() {
        let mut gate = BurstController::<1024>::new(10 * MS, 2, 10 * MS, 1);
        assert!(gate.evaluate(0));
        assert!(gate.evaluate(0));
        assert!(!gate.evaluate(0));
        // Keep the cooldown window busy past its exit threshold.
        for i in 1..=20u64 {
            assert!(!gate.evaluate(i * MS / 2));
        }
        assert_eq!(gate.state().mode, Mode::Cooldown);
    }

    #[test]
    fn ancient_events_are_dropped_by_the_gate() {
        let mut gate = BurstController::<1024>::new(100 * MS, 5, 100 * MS, 2);
        assert!(gate.evaluate(200_000 * MS));
        // Slot index far behind the head: rejected, not credited.
        assert!(!gate.evaluate(0));
        assert_eq!(gate.state().total_count, 1);
    }

    #[test]
    fn throttle_tracks_parents_independently() {
        let mut throttle = OrderThrottle::<20>::new(16, 20 * MS, 2).expect("throttle");
        throttle.add_parent(100).expect("parent");
        throttle.add_parent(200).expect("parent");
        assert_eq!(throttle.parent_count(), 2);

        let t = 50 * MS;
        assert!(throttle.allow_child(100, t));
        assert!(throttle.allow_child(100, t + 1));
        assert!(!throttle.allow_child(100, t + 2), "parent 100 throttled");
        assert!(throttle.allow_child(200, t + 3), "parent 200 unaffected");
        assert_eq!(throttle.child_count(100), 2);
        assert_eq!(throttle.child_count(200), 1);

        assert!(!throttle.allow_child(999, t), "unknown parent rejected");
    }

    #[test]
    fn throttle_recycles_counters_through_the_pool() {
        let mut throttle = OrderThrottle::<20>::new(16, 20 * MS, 3).expect("throttle");
        for parent in 0..16u64 {
            throttle.add_parent(parent).expect("register");
        }
        // Table full for a new parent.
        assert_eq!(
            throttle.add_parent(999),
            Err(TableError::CapacityExhausted)
        );
        // Idempotent re-registration is not an error.
        throttle.add_parent(5).expect("idempotent");

        throttle.remove_parent(5);
        assert_eq!(throttle.parent_count(), 15);
        throttle.add_parent(999).expect("slot freed");
        assert!(throttle.allow_child(999, 30 * MS));
        assert_eq!(throttle.pool.fallback_count(), 0);
    }
}
