//! One-shot and recurring timers over a bounded heap.
//!
//! Timer targets are component-addressed tokens rather than stored
//! closures: expiry hands `(component, token)` back to the dispatcher,
//! which invokes `Component::on_timer`. This keeps the queue free of
//! aliasing into component state and the entries plain data.

use crate::heap::PriorityHeap;

/// Default queue depth, matching one dispatcher's worth of timers.
pub const DEFAULT_TIMER_CAPACITY: usize = 1 << 10;

/// Whether a timer re-arms after firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Fire once and forget.
    OneShot,
    /// Re-arm `period_ns` after each fire.
    Recurring,
}

/// A scheduled timer.
#[derive(Debug, Clone, Copy)]
pub struct TimerEntry {
    /// Absolute deadline, nanoseconds.
    pub due_ns: u64,
    /// Re-arm interval for recurring timers (zero for one-shot).
    pub period_ns: u64,
    /// Index of the component to notify.
    pub component: u16,
    /// Caller-chosen discriminator handed back on expiry.
    pub token: u64,
    /// One-shot or recurring.
    pub kind: TimerKind,
}

// Heap order: earliest deadline wins.
impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.due_ns == other.due_ns
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other.due_ns.cmp(&self.due_ns)
    }
}

/// Bounded timer queue. Never blocks; never allocates after construction.
pub struct TimerQueue {
    queue: PriorityHeap<TimerEntry>,
}

impl TimerQueue {
    /// Create a queue holding at most `capacity` pending timers.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: PriorityHeap::new(capacity),
        }
    }

    /// Schedule a one-shot timer at an absolute deadline.
    /// Returns false when the queue is full.
    pub fn schedule_at(&mut self, due_ns: u64, component: u16, token: u64) -> bool {
        self.queue.push(TimerEntry {
            due_ns,
            period_ns: 0,
            component,
            token,
            kind: TimerKind::OneShot,
        })
    }

    /// Schedule `wait_ns` from `now_ns`, one-shot or recurring.
    /// Returns false when the queue is full.
    pub fn schedule_after(
        &mut self,
        kind: TimerKind,
        wait_ns: u64,
        now_ns: u64,
        component: u16,
        token: u64,
    ) -> bool {
        self.queue.push(TimerEntry {
            due_ns: now_ns.saturating_add(wait_ns),
            period_ns: wait_ns,
            component,
            token,
            kind,
        })
    }

    /// Re-queue a fired entry (dispatcher re-arm path).
    /// Returns false when the queue is full.
    pub fn requeue(&mut self, entry: TimerEntry) -> bool {
        self.queue.push(entry)
    }

    /// Pop every entry due at `now_ns` into `out` (cleared first), earliest
    /// first. Recurring entries are *not* re-armed here; the caller fires
    /// the callbacks and then re-queues, so a callback scheduling new
    /// timers sees a consistent queue.
    pub fn drain_due(&mut self, now_ns: u64, out: &mut Vec<TimerEntry>) {
        out.clear();
        while let Some(next) = self.queue.peek() {
            if next.due_ns > now_ns {
                break;
            }
            if let Some(entry) = self.queue.pop() {
                out.push(entry);
            }
        }
    }

    /// Earliest pending deadline.
    #[must_use]
    pub fn next_due(&self) -> Option<u64> {
        self.queue.peek().map(|e| e.due_ns)
    }

    /// Pending timer count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// True when nothing is scheduled.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Drop every pending timer.
    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

impl Default for TimerQueue {
    fn default() -> Self {
        Self::new(DEFAULT_TIMER_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drains_earliest_first_and_only_due() {
        let mut timers = TimerQueue::new(16);
        assert!(timers.schedule_at(300, 0, 3));
        assert!(timers.schedule_at(100, 0, 1));
        assert!(timers.schedule_at(200, 1, 2));

        let mut due = Vec::new();
        timers.drain_due(250, &mut due);
        let tokens: Vec<u64> = due.iter().map(|e| e.token).collect();
        assert_eq!(tokens, vec![1, 2]);
        assert_eq!(timers.len(), 1);
        assert_eq!(timers.next_due(), Some(300));
    }

    #[test]
    fn recurring_entries_carry_their_period() {
        let mut timers = TimerQueue::new(4);
        assert!(timers.schedule_after(TimerKind::Recurring, 50, 1000, 2, 7));

        let mut due = Vec::new();
        timers.drain_due(1050, &mut due);
        assert_eq!(due.len(), 1);
        let fired = due[0];
        assert_eq!(fired.kind, TimerKind::Recurring);
        assert_eq!(fired.period_ns, 50);
        assert_eq!(fired.component, 2);

        // Dispatcher-style re-arm.
        let rearmed = TimerEntry {
            due_ns: 1050 + fired.period_ns,
            ..fired
        };
        assert!(timers.requeue(rearmed));
        assert_eq!(timers.next_due(), Some(1100));
    }

    #[test]
    fn full_queue_rejects_new_timers() {
        let mut timers = TimerQueue::new(2);
        assert!(timers.schedule_at(1, 0, 0));
        assert!(timers.schedule_at(2, 0, 0));
        assert!(!timers.schedule_at(3, 0, 0));
    }
}
