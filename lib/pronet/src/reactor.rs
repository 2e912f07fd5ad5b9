//! The event-demultiplexer plus timer wheel. A `Reactor` owns exactly one `mio::Poll` and one
//! `TimerWheel`; a `WorkerPool` fans registrations out across `N` reactors so sockets stay
//! sticky to the worker they were registered on (serialization is per-socket, not per-process,
//! per the concurrency model).

use crate::timer::{TimerFire, TimerId, TimerOwner, TimerWheel};
use mio::Evented;
use std::io;
use std::time::{Duration, Instant};

/// A registered handler's interest set. Mirrors `IProReactor`'s add/remove/modify surface.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Interest {
    pub readable: bool,
    pub writable: bool,
}

impl Interest {
    pub const READ: Interest = Interest {
        readable: true,
        writable: false,
    };
    pub const WRITE: Interest = Interest {
        readable: false,
        writable: true,
    };
    pub const BOTH: Interest = Interest {
        readable: true,
        writable: true,
    };

    fn to_ready(self) -> mio::Ready {
        let mut ready = mio::Ready::empty();
        if self.readable {
            ready |= mio::Ready::readable();
        }
        if self.writable {
            ready |= mio::Ready::writable();
        }
        ready
    }
}

#[derive(Debug, Clone, Copy)]
pub struct IoEvent {
    pub token: mio::Token,
    pub readable: bool,
    pub writable: bool,
}

/// One I/O worker: a private demultiplexer and a private timer heap. Handler dispatch happens
/// outside this type, in the caller's event loop, which holds a strong reference to the handler
/// for the duration of the upcall (the "upcall lock" from the concurrency model).
pub struct Reactor {
    poll: mio::Poll,
    events: mio::Events,
    timers: TimerWheel,
}

impl Reactor {
    pub fn new(heartbeat_period: Duration, event_capacity: usize) -> io::Result<Reactor> {
        Ok(Reactor {
            poll: mio::Poll::new()?,
            events: mio::Events::with_capacity(event_capacity),
            timers: TimerWheel::new(heartbeat_period),
        })
    }

    pub fn register<E: Evented>(&self, handle: &E, token: mio::Token, interest: Interest) -> io::Result<()> {
        self.poll
            .register(handle, token, interest.to_ready(), mio::PollOpt::edge())
    }

    pub fn reregister<E: Evented>(&self, handle: &E, token: mio::Token, interest: Interest) -> io::Result<()> {
        self.poll
            .reregister(handle, token, interest.to_ready(), mio::PollOpt::edge())
    }

    pub fn deregister<E: Evented>(&self, handle: &E) -> io::Result<()> {
        self.poll.deregister(handle)
    }

    pub fn setup_timer(&mut self, owner: TimerOwner, first_delay_ms: u64, period_ms: u64, user_data: u64) -> TimerId {
        self.timers.setup_timer(owner, first_delay_ms, period_ms, user_data)
    }

    pub fn setup_heartbeat_timer(&mut self, owner: TimerOwner, user_data: u64) -> TimerId {
        self.timers.setup_heartbeat_timer(owner, user_data)
    }

    pub fn update_heartbeat_timers(&mut self, period: Duration) {
        self.timers.update_heartbeat_timers(period)
    }

    pub fn cancel_timer(&mut self, id: TimerId) {
        self.timers.cancel_timer(id)
    }

    /// Schedule a multimedia (high-precision) timer; see `TimerWheel::setup_mm_timer`.
    pub fn setup_mm_timer(&mut self, owner: TimerOwner, first_delay_ms: u64, period_ms: u64, user_data: u64) -> TimerId {
        self.timers.setup_mm_timer(owner, first_delay_ms, period_ms, user_data)
    }

    pub fn cancel_mm_timer(&mut self, id: TimerId) {
        self.timers.cancel_mm_timer(id)
    }

    /// Drive one iteration: poll for I/O readiness (bounded by `timeout`) and drain any timers
    /// that have come due as of `now`.
    pub fn turn(&mut self, now: Instant, timeout: Option<Duration>) -> io::Result<(Vec<IoEvent>, Vec<TimerFire>)> {
        self.poll.poll(&mut self.events, timeout)?;

        let io_events = self
            .events
            .iter()
            .map(|event| IoEvent {
                token: event.token(),
                readable: event.readiness().is_readable(),
                writable: event.readiness().is_writable(),
            })
            .collect();

        let timer_fires = self.timers.poll_expired(now);

        Ok((io_events, timer_fires))
    }

    /// Snapshot of worker load for periodic `debug`-level logging; not a stable metrics surface.
    pub fn trace_info(&self) -> ReactorTrace {
        ReactorTrace {
            pending_timer_count: self.timers.pending_count(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReactorTrace {
    pub pending_timer_count: usize,
}

/// Distributes registrations across `N` reactors by a simple round-robin counter, giving each
/// worker its own demultiplexer and timer heap. Worker count is a deployment choice (§9), not
/// part of the contract.
pub struct WorkerPool {
    workers: Vec<Reactor>,
    next_worker: usize,
}

impl WorkerPool {
    pub fn new(worker_count: usize, heartbeat_period: Duration, event_capacity: usize) -> io::Result<WorkerPool> {
        let worker_count = worker_count.max(1);
        let mut workers = Vec::with_capacity(worker_count);

        for _ in 0..worker_count {
            workers.push(Reactor::new(heartbeat_period, event_capacity)?);
        }

        Ok(WorkerPool { workers, next_worker: 0 })
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Pick the next worker a new socket should be registered on, round-robin.
    pub fn assign(&mut self) -> usize {
        let idx = self.next_worker;
        self.next_worker = (self.next_worker + 1) % self.workers.len();
        idx
    }

    pub fn worker(&self, idx: usize) -> &Reactor {
        &self.workers[idx]
    }

    pub fn worker_mut(&mut self, idx: usize) -> &mut Reactor {
        &mut self.workers[idx]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_reactor_timer_fires() {
        let mut reactor = Reactor::new(Duration::from_secs(20), 128).unwrap();
        reactor.setup_timer(1, 0, 0, 55);

        let (_, fires) = reactor
            .turn(Instant::now() + Duration::from_millis(1), Some(Duration::from_millis(0)))
            .unwrap();

        assert_eq!(fires.len(), 1);
        assert_eq!(fires[0].user_data, 55);
    }

    #[test]
    fn test_worker_pool_round_robins_assignment() {
        let pool = WorkerPool::new(3, Duration::from_secs(20), 128).unwrap();
        let mut pool = pool;

        assert_eq!(pool.assign(), 0);
        assert_eq!(pool.assign(), 1);
        assert_eq!(pool.assign(), 2);
        assert_eq!(pool.assign(), 0);
    }
}
