//! Seq-locked TSC to nanoseconds converter
//!
//! Readers pay two atomic loads and one `rdtsc` (~10ns). Calibration is the
//! slow path: it anchors the counter to the wall clock and measures the TSC
//! frequency over a short monotonic spin. When to recalibrate is the host's
//! decision; a dedicated slow thread calling [`TscClock::calibrate`] every
//! few hundred milliseconds is typical.

use std::sync::atomic::{fence, AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::types::Ts;

/// Length of the frequency-measurement spin inside [`TscClock::calibrate`].
const CALIBRATION_SPIN: Duration = Duration::from_millis(10);

/// Seq-locked TSC clock.
///
/// All calibration state lives in atomics; an odd sequence number marks a
/// write in progress. `ns_per_cycle` is an `f64` stored as its bit pattern
/// so the seqlock never reads a non-atomic field.
pub struct TscClock {
    seq: AtomicU64,
    ns_per_cycle_bits: AtomicU64,
    base_tsc: AtomicU64,
    base_ns: AtomicU64,
}

impl TscClock {
    /// Create and calibrate. Blocks for the ~10ms measurement spin.
    #[must_use]
    pub fn new() -> Self {
        let clock = Self {
            seq: AtomicU64::new(0),
            ns_per_cycle_bits: AtomicU64::new(1.0f64.to_bits()),
            base_tsc: AtomicU64::new(0),
            base_ns: AtomicU64::new(0),
        };
        clock.calibrate();
        clock
    }

    /// Raw cycle counter.
    #[cfg(target_arch = "x86_64")]
    #[inline(always)]
    #[must_use]
    pub fn tsc() -> u64 {
        // SAFETY: _rdtsc has no preconditions; it reads the time-stamp counter.
        unsafe { core::arch::x86_64::_rdtsc() }
    }

    /// Raw cycle counter. Non-x86 targets fall back to wall-clock nanoseconds
    /// so that a factor of 1.0 makes `now()` exact.
    #[cfg(not(target_arch = "x86_64"))]
    #[inline(always)]
    #[must_use]
    pub fn tsc() -> u64 {
        wall_nanos()
    }

    /// Nanoseconds since the UNIX epoch. Hot path.
    #[inline]
    #[must_use]
    pub fn now(&self) -> u64 {
        loop {
            let s1 = self.seq.load(Ordering::Acquire);
            if s1 & 1 != 0 {
                std::hint::spin_loop();
                continue;
            }
            let factor = f64::from_bits(self.ns_per_cycle_bits.load(Ordering::Relaxed));
            let base_tsc = self.base_tsc.load(Ordering::Relaxed);
            let base_ns = self.base_ns.load(Ordering::Relaxed);
            fence(Ordering::Acquire);
            if self.seq.load(Ordering::Relaxed) == s1 {
                let delta = Self::tsc().wrapping_sub(base_tsc);
                return base_ns.wrapping_add((delta as f64 * factor) as u64);
            }
        }
    }

    /// [`TscClock::now`] as a [`Ts`].
    #[inline]
    #[must_use]
    pub fn now_ts(&self) -> Ts {
        Ts::from_nanos(self.now())
    }

    /// Measure the TSC frequency and re-anchor to the wall clock.
    ///
    /// Not reentrant: at most one calibrating thread at a time.
    pub fn calibrate(&self) {
        let anchor_ns = wall_nanos();
        let anchor_tsc = Self::tsc();

        let started = Instant::now();
        while started.elapsed() < CALIBRATION_SPIN {
            std::hint::spin_loop();
        }
        let elapsed_ns = started.elapsed().as_nanos() as u64;
        let end_tsc = Self::tsc();

        let cycles = end_tsc.wrapping_sub(anchor_tsc);
        let factor = if cycles > 0 {
            elapsed_ns as f64 / cycles as f64
        } else {
            1.0
        };

        self.publish(anchor_tsc, anchor_ns, factor);
    }

    /// Inject externally-computed calibration parameters.
    pub fn recalibrate_with(&self, base_tsc: u64, base_ns: u64, ns_per_cycle: f64) {
        self.publish(base_tsc, base_ns, ns_per_cycle);
    }

    fn publish(&self, base_tsc: u64, base_ns: u64, factor: f64) {
        let s = self.seq.load(Ordering::Relaxed);
        self.seq.store(s.wrapping_add(1), Ordering::Relaxed);
        // Release stores keep the odd sequence visible before any field.
        self.ns_per_cycle_bits
            .store(factor.to_bits(), Ordering::Release);
        self.base_tsc.store(base_tsc, Ordering::Release);
        self.base_ns.store(base_ns, Ordering::Release);
        self.seq.store(s.wrapping_add(2), Ordering::Release);
    }
}

impl Default for TscClock {
    fn default() -> Self {
        Self::new()
    }
}

fn wall_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_tracks_wall_clock() {
        let clock = TscClock::new();
        let wall = wall_nanos();
        let tsc_now = clock.now();
        // Within 50ms of the wall clock right after calibration.
        let drift = wall.abs_diff(tsc_now);
        assert!(drift < 50_000_000, "drift {drift}ns");
    }

    #[test]
    fn now_is_monotonic_between_calls() {
        let clock = TscClock::new();
        let mut last = clock.now();
        for _ in 0..10_000 {
            let next = clock.now();
            assert!(next >= last);
            last = next;
        }
    }

    #[test]
    fn recalibrate_with_rebases() {
        let clock = TscClock::new();
        let tsc = TscClock::tsc();
        clock.recalibrate_with(tsc, 42, 0.0);
        // Zero factor pins the clock to the injected base.
        assert_eq!(clock.now(), 42);
    }
}
