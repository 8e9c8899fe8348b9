//! The single-threaded event multiplexer: socket readiness, timers, and
//! deferred events.
//!
//! Components register interest and receive [`WakeEvent`]s from
//! [`Mainloop::run_once`]; all callbacks run to completion between poll
//! iterations, so no two operate on the same state concurrently.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet, VecDeque};
use std::io;
use std::time::{Duration, Instant};

use mio::{Events, Interest, Poll, Registry, Token};

/// Identifies a one-shot timer armed with [`Mainloop::set_timer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerToken(u64);

/// Identifies a deferred event armed with [`Mainloop::defer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeferToken(u64);

/// One wakeup delivered by the loop.
#[derive(Debug)]
pub enum WakeEvent {
    /// A registered I/O source became ready.
    Io {
        /// The token the source was registered under.
        token: Token,
        /// Readable (or a closed peer, which also reads as EOF).
        readable: bool,
        /// Writable.
        writable: bool,
    },
    /// A timer expired.
    Timer(TimerToken),
    /// A deferred event became runnable.
    Deferred(DeferToken),
}

/// The multiplexer.
pub struct Mainloop {
    poll: Poll,
    events: Events,
    timers: BinaryHeap<Reverse<(Instant, u64)>>,
    cancelled_timers: HashSet<u64>,
    deferred: VecDeque<u64>,
    next_id: u64,
    quit: bool,
}

impl Mainloop {
    /// Creates a new loop.
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(256),
            timers: BinaryHeap::new(),
            cancelled_timers: HashSet::new(),
            deferred: VecDeque::new(),
            next_id: 0,
            quit: false,
        })
    }

    /// The registry components register their I/O sources with.
    pub fn registry(&self) -> &Registry {
        self.poll.registry()
    }

    /// Registers an I/O source for the given interests.
    pub fn register<S: mio::event::Source + ?Sized>(
        &self,
        source: &mut S,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.poll.registry().register(source, token, interests)
    }

    /// Updates a source's interests.
    pub fn reregister<S: mio::event::Source + ?Sized>(
        &self,
        source: &mut S,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.poll.registry().reregister(source, token, interests)
    }

    /// Removes a source from the loop.
    pub fn deregister<S: mio::event::Source + ?Sized>(&self, source: &mut S) -> io::Result<()> {
        self.poll.registry().deregister(source)
    }

    /// Arms a one-shot timer.
    pub fn set_timer(&mut self, after: Duration) -> TimerToken {
        let id = self.next_id;
        self.next_id += 1;
        self.timers.push(Reverse((Instant::now() + after, id)));
        TimerToken(id)
    }

    /// Cancels a timer. Harmless if it already fired.
    pub fn cancel_timer(&mut self, token: TimerToken) {
        self.cancelled_timers.insert(token.0);
    }

    /// Queues a deferred event, delivered on the next iteration before any
    /// I/O waiting.
    pub fn defer(&mut self) -> DeferToken {
        let id = self.next_id;
        self.next_id += 1;
        self.deferred.push_back(id);
        DeferToken(id)
    }

    /// Asks the loop to stop; [`Mainloop::should_quit`] turns true.
    pub fn quit(&mut self) {
        self.quit = true;
    }

    /// Whether a quit was requested.
    pub fn should_quit(&self) -> bool {
        self.quit
    }

    fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((deadline, id))) = self.timers.peek().copied() {
            if self.cancelled_timers.remove(&id) {
                self.timers.pop();
                continue;
            }

            return Some(deadline);
        }

        None
    }

    /// Waits for the next batch of events, up to `max_wait`, and appends
    /// them to `out`. Returns the number of events delivered.
    pub fn run_once(&mut self, max_wait: Option<Duration>, out: &mut Vec<WakeEvent>) -> io::Result<usize> {
        let before = out.len();

        // Deferred events preempt any waiting.
        if !self.deferred.is_empty() {
            while let Some(id) = self.deferred.pop_front() {
                out.push(WakeEvent::Deferred(DeferToken(id)));
            }
        }

        let now = Instant::now();
        let timeout = match self.next_deadline() {
            _ if out.len() > before => Some(Duration::ZERO),
            Some(deadline) => {
                let until = deadline.saturating_duration_since(now);
                Some(max_wait.map_or(until, |m| m.min(until)))
            }
            None => max_wait,
        };

        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }

        for event in self.events.iter() {
            out.push(WakeEvent::Io {
                token: event.token(),
                readable: event.is_readable() || event.is_read_closed(),
                writable: event.is_writable(),
            });
        }

        // Fire due timers.
        let now = Instant::now();
        while let Some(Reverse((deadline, id))) = self.timers.peek().copied() {
            if deadline > now {
                break;
            }

            self.timers.pop();
            if !self.cancelled_timers.remove(&id) {
                out.push(WakeEvent::Timer(TimerToken(id)));
            }
        }

        Ok(out.len() - before)
    }
}

impl std::fmt::Debug for Mainloop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mainloop")
            .field("timers", &self.timers.len())
            .field("deferred", &self.deferred.len())
            .field("quit", &self.quit)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn timers_fire_in_order() -> io::Result<()> {
        let mut ml = Mainloop::new()?;
        let late = ml.set_timer(Duration::from_millis(20));
        let early = ml.set_timer(Duration::from_millis(1));

        let mut events = Vec::new();
        while events.len() < 2 {
            ml.run_once(Some(Duration::from_millis(50)), &mut events)?;
        }

        assert_matches!(events[0], WakeEvent::Timer(t) if t == early);
        assert_matches!(events[1], WakeEvent::Timer(t) if t == late);

        Ok(())
    }

    #[test]
    fn cancelled_timers_do_not_fire() -> io::Result<()> {
        let mut ml = Mainloop::new()?;
        let t = ml.set_timer(Duration::from_millis(1));
        ml.cancel_timer(t);

        let mut events = Vec::new();
        ml.run_once(Some(Duration::from_millis(10)), &mut events)?;
        assert!(events.is_empty());

        Ok(())
    }

    #[test]
    fn deferred_events_preempt_waiting() -> io::Result<()> {
        let mut ml = Mainloop::new()?;
        let d = ml.defer();

        let start = Instant::now();
        let mut events = Vec::new();
        ml.run_once(Some(Duration::from_secs(5)), &mut events)?;

        assert!(start.elapsed() < Duration::from_secs(1));
        assert_matches!(events[0], WakeEvent::Deferred(t) if t == d);

        Ok(())
    }
}
