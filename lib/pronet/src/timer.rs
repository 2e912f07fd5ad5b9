//! Monotonic, min-heap-ordered timer wheel. One `TimerWheel` is owned per reactor worker.
//!
//! Grounded in the original `pro_timer_factory.h`'s `PRO_TIMER_NODE`, whose ordering
//! (`expireTick` then `timerId`) is exactly what `Ord`/`PartialOrd` below reproduce via the
//! `Reverse` wrapper so `BinaryHeap` (a max-heap) pops the earliest deadline first.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

pub type TimerId = u64;

/// Opaque handle identifying who owns a timer, threaded back out on fire so the caller can
/// dispatch to the right handler without the wheel knowing about handler types.
pub type TimerOwner = u64;

#[derive(Debug, Clone, Copy)]
struct TimerNode {
    id: TimerId,
    deadline: Instant,
    period: Option<Duration>,
    is_heartbeat: bool,
    slot_index: u32,
    owner: TimerOwner,
    user_data: u64,
}

impl PartialEq for TimerNode {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.id == other.id
    }
}
impl Eq for TimerNode {}

impl PartialOrd for TimerNode {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerNode {
    /// Reversed so that `BinaryHeap` (a max-heap) surfaces the earliest deadline first, breaking
    /// ties by timer id.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.id.cmp(&self.id))
    }
}

/// A timer that has fired and should be dispatched to `owner`.
#[derive(Debug, Clone, Copy)]
pub struct TimerFire {
    pub id: TimerId,
    pub owner: TimerOwner,
    pub user_data: u64,
    pub is_heartbeat: bool,
}

/// Min-heap-ordered collection of one-shot and periodic timers. `cancel_timer` is a lazy
/// tombstone: the node is marked dead and skipped when it would otherwise fire, avoiding an
/// O(n) heap search.
pub struct TimerWheel {
    heap: BinaryHeap<TimerNode>,
    dead: std::collections::HashSet<TimerId>,
    next_id: TimerId,
    heartbeat_period: Duration,
}

impl TimerWheel {
    pub fn new(heartbeat_period: Duration) -> TimerWheel {
        TimerWheel {
            heap: BinaryHeap::new(),
            dead: std::collections::HashSet::new(),
            next_id: 1,
            heartbeat_period,
        }
    }

    /// Schedule a one-shot (`period_ms == 0`) or periodic timer.
    pub fn setup_timer(
        &mut self,
        owner: TimerOwner,
        first_delay_ms: u64,
        period_ms: u64,
        user_data: u64,
    ) -> TimerId {
        let id = self.mint_id(false);
        let period = if period_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(period_ms))
        };

        self.heap.push(TimerNode {
            id,
            deadline: Instant::now() + Duration::from_millis(first_delay_ms),
            period,
            is_heartbeat: false,
            slot_index: 0,
            owner,
            user_data,
        });

        id
    }

    /// Schedule a multimedia (high-precision) one-shot or periodic timer. Shares the wheel with
    /// `setup_timer`; the id's low bit is the only thing that distinguishes the two (§3), so a
    /// caller can always tell which kind an id names without tracking it separately.
    pub fn setup_mm_timer(
        &mut self,
        owner: TimerOwner,
        first_delay_ms: u64,
        period_ms: u64,
        user_data: u64,
    ) -> TimerId {
        let id = self.mint_id(true);
        let period = if period_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(period_ms))
        };

        self.heap.push(TimerNode {
            id,
            deadline: Instant::now() + Duration::from_millis(first_delay_ms),
            period,
            is_heartbeat: false,
            slot_index: 0,
            owner,
            user_data,
        });

        id
    }

    /// Cancel a multimedia timer. Identical to `cancel_timer`; kept as a distinct entry point so
    /// callers mirror the `setup_mm_timer`/`cancel_mm_timer` pairing from §4.1 instead of having
    /// to know the two share one wheel underneath.
    pub fn cancel_mm_timer(&mut self, id: TimerId) {
        debug_assert!(is_mm_timer(id), "cancel_mm_timer called with a regular timer id");
        self.cancel_timer(id);
    }

    /// Schedule a heartbeat timer, assigning it a slot in `[0, period_s)` so fire times spread
    /// evenly across the heartbeat period instead of bunching at `t=0`.
    pub fn setup_heartbeat_timer(&mut self, owner: TimerOwner, user_data: u64) -> TimerId {
        let id = self.mint_id(false);
        let period_secs = self.heartbeat_period.as_secs().max(1);
        let slot_index = (id % period_secs) as u32;
        let first_delay = Duration::from_millis(slot_index as u64 * 1000);

        self.heap.push(TimerNode {
            id,
            deadline: Instant::now() + first_delay,
            period: Some(self.heartbeat_period),
            is_heartbeat: true,
            slot_index,
            owner,
            user_data,
        });

        id
    }

    /// Reschedule every live heartbeat timer to `now + (slot * 1000 / period) mod period*1000`,
    /// spreading fire times evenly after a heartbeat period change.
    pub fn update_heartbeat_timers(&mut self, new_period: Duration) {
        self.heartbeat_period = new_period;
        let period_secs = new_period.as_secs().max(1);

        let nodes: Vec<TimerNode> = self
            .heap
            .drain()
            .filter(|node| !self.dead.contains(&node.id))
            .collect();

        for mut node in nodes {
            if node.is_heartbeat {
                node.slot_index = (node.id % period_secs) as u32;
                node.deadline = Instant::now() + Duration::from_millis(node.slot_index as u64 * 1000);
                node.period = Some(new_period);
            }
            self.heap.push(node);
        }
    }

    /// Cancel a timer. Safe to call even if the timer already fired or doesn't exist.
    pub fn cancel_timer(&mut self, id: TimerId) {
        self.dead.insert(id);
    }

    /// Pop and return every timer whose deadline is `<= now`, rescheduling periodic ones.
    pub fn poll_expired(&mut self, now: Instant) -> Vec<TimerFire> {
        let mut fired = Vec::new();

        while let Some(node) = self.heap.peek() {
            if node.deadline > now {
                break;
            }

            let node = self.heap.pop().expect("peeked node must pop");

            if self.dead.remove(&node.id) {
                continue;
            }

            fired.push(TimerFire {
                id: node.id,
                owner: node.owner,
                user_data: node.user_data,
                is_heartbeat: node.is_heartbeat,
            });

            if let Some(period) = node.period {
                self.heap.push(TimerNode {
                    deadline: node.deadline + period,
                    ..node
                });
            }
        }

        fired
    }

    /// Number of pending (not-yet-fired, non-cancelled) timers, used for `get_trace_info`.
    pub fn pending_count(&self) -> usize {
        self.heap.len().saturating_sub(self.dead.len())
    }

    /// Mint a unique id with the low bit set for mm timers, clear for regular ones (§3).
    fn mint_id(&mut self, is_mm: bool) -> TimerId {
        let id = self.next_id;
        self.next_id += 1;
        (id << 1) | (is_mm as u64)
    }
}

/// `true` if `id` names a multimedia (high-precision) timer rather than a regular one (§3).
pub fn is_mm_timer(id: TimerId) -> bool {
    id & 1 == 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancelled_timer_never_fires() {
        let mut wheel = TimerWheel::new(Duration::from_secs(20));
        let id = wheel.setup_timer(1, 0, 0, 42);
        wheel.cancel_timer(id);

        let fired = wheel.poll_expired(Instant::now() + Duration::from_millis(10));
        assert!(fired.is_empty());
    }

    #[test]
    fn test_one_shot_fires_once() {
        let mut wheel = TimerWheel::new(Duration::from_secs(20));
        wheel.setup_timer(7, 0, 0, 99);

        let now = Instant::now() + Duration::from_millis(1);
        let fired = wheel.poll_expired(now);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].owner, 7);
        assert_eq!(fired[0].user_data, 99);

        let fired_again = wheel.poll_expired(now + Duration::from_secs(1));
        assert!(fired_again.is_empty());
    }

    #[test]
    fn test_periodic_reschedules() {
        let mut wheel = TimerWheel::new(Duration::from_secs(20));
        wheel.setup_timer(1, 0, 100, 0);

        let base = Instant::now();
        let fired = wheel.poll_expired(base + Duration::from_millis(350));
        // Fires at ~0, 100, 200, 300 => 4 fires
        assert_eq!(fired.len(), 4);
    }

    #[test]
    fn test_mm_timer_id_low_bit_set_regular_clear() {
        let mut wheel = TimerWheel::new(Duration::from_secs(20));
        let regular = wheel.setup_timer(1, 0, 0, 1);
        let mm = wheel.setup_mm_timer(1, 0, 0, 2);

        assert!(!is_mm_timer(regular));
        assert!(is_mm_timer(mm));
    }

    #[test]
    fn test_mm_timer_fires_and_cancels_like_a_regular_timer() {
        let mut wheel = TimerWheel::new(Duration::from_secs(20));
        let id = wheel.setup_mm_timer(3, 0, 0, 77);

        let fired = wheel.poll_expired(Instant::now() + Duration::from_millis(1));
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].id, id);
        assert_eq!(fired[0].user_data, 77);

        let cancel_id = wheel.setup_mm_timer(3, 1000, 0, 88);
        wheel.cancel_mm_timer(cancel_id);
        let fired = wheel.poll_expired(Instant::now() + Duration::from_secs(2));
        assert!(fired.is_empty());
    }

    #[test]
    fn test_ordering_breaks_ties_by_id() {
        let mut wheel = TimerWheel::new(Duration::from_secs(20));
        let now = Instant::now();
        // Both timers scheduled for "now" (first_delay 0); lower id should pop first.
        let first = wheel.setup_timer(10, 0, 0, 1);
        let second = wheel.setup_timer(20, 0, 0, 2);

        let fired = wheel.poll_expired(now + Duration::from_millis(5));
        assert_eq!(fired.len(), 2);
        assert_eq!(fired[0].id, first);
        assert_eq!(fired[1].id, second);
    }
}
