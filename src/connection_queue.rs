//! The half-open connection limiter.
//!
//! Outbound connection attempts don't hit the network directly: they are
//! enqueued here as tickets and promoted under a global cap on concurrently
//! half-open (initiated but not yet established) connections. Priorities 1
//! and 2 jump the queue; a single shared deadline timer times out attempts
//! that take too long.
//!
//! The queue never invokes handlers while its internal state is borrowed:
//! every operation that makes tickets runnable returns the ready closures
//! for the caller to post to the executor. The session drives the deadline
//! timer off [`next_deadline`](ConnectionQueue::next_deadline).

use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

/// Identifies a queued connection attempt.
pub(crate) type TicketId = u32;

/// Called when the attempt may proceed (`Some(ticket)`) or when the queue is
/// dropping it unpromoted (`None`).
pub(crate) type ConnectHandler = Box<dyn FnOnce(Option<TicketId>) + Send>;
/// Called when the attempt's deadline passes, or on queue close.
pub(crate) type TimeoutHandler = Box<dyn FnOnce() + Send>;

/// A closure made runnable by a queue operation; the caller executes these
/// after the call returns.
pub(crate) type Runnable = Box<dyn FnOnce() + Send>;

/// Ticket ids wrap well below the integer range so they stay readable in
/// logs.
const TICKET_WRAP: TicketId = 1 << 29;

/// The slack added to "now" when collecting expired tickets, so a deadline
/// the timer undershot by a few milliseconds still fires in this round.
const TIMEOUT_SLACK: Duration = Duration::from_millis(100);

struct Entry {
    ticket: TicketId,
    priority: u8,
    connecting: bool,
    /// Armed when the ticket is promoted.
    expires: Option<Instant>,
    timeout: Duration,
    on_connect: Option<ConnectHandler>,
    on_timeout: Option<TimeoutHandler>,
}

pub(crate) struct ConnectionQueue {
    queue: VecDeque<Entry>,
    next_ticket: TicketId,
    num_connecting: usize,
    /// Zero means unlimited.
    half_open_limit: usize,
}

impl ConnectionQueue {
    pub fn new(half_open_limit: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            next_ticket: 0,
            num_connecting: 0,
            half_open_limit,
        }
    }

    pub fn limit(&self) -> usize {
        self.half_open_limit
    }

    pub fn set_limit(&mut self, limit: usize) {
        self.half_open_limit = limit;
    }

    pub fn num_connecting(&self) -> usize {
        self.num_connecting
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Admits a new attempt. Priority 0 queues at the tail, priorities 1 and
    /// 2 at the head (so of two high-priority tickets the later-added one
    /// goes first). Follow up with [`try_connect`](Self::try_connect) to
    /// promote whatever the cap allows.
    pub fn enqueue(
        &mut self,
        on_connect: ConnectHandler,
        on_timeout: TimeoutHandler,
        timeout: Duration,
        priority: u8,
    ) -> TicketId {
        debug_assert!(priority < 3);
        let ticket = self.next_ticket;
        self.next_ticket = (self.next_ticket + 1) % TICKET_WRAP;

        let entry = Entry {
            ticket,
            priority,
            connecting: false,
            expires: None,
            timeout,
            on_connect: Some(on_connect),
            on_timeout: Some(on_timeout),
        };
        if priority == 0 {
            self.queue.push_back(entry);
        } else {
            self.queue.push_front(entry);
        }
        ticket
    }

    /// Marks the attempt finished (successfully or not), freeing its
    /// half-open slot. Returns false if the ticket is no longer queued
    /// (it may have timed out already).
    pub fn done(&mut self, ticket: TicketId) -> bool {
        let pos = match self.queue.iter().position(|e| e.ticket == ticket) {
            Some(pos) => pos,
            None => return false,
        };
        if self.queue[pos].connecting {
            self.num_connecting -= 1;
        }
        self.queue.remove(pos);
        self.check_invariant();
        true
    }

    /// Promotes as many waiting tickets as the half-open cap allows,
    /// starting their timeout countdowns. Returns the connect handlers to
    /// post.
    pub fn try_connect(&mut self, now: Instant) -> Vec<Runnable> {
        let mut runnables: Vec<Runnable> = Vec::new();
        for entry in self.queue.iter_mut() {
            if self.half_open_limit > 0
                && self.num_connecting >= self.half_open_limit
            {
                break;
            }
            if entry.connecting {
                continue;
            }
            entry.connecting = true;
            entry.expires = Some(now + entry.timeout);
            self.num_connecting += 1;

            let ticket = entry.ticket;
            let on_connect =
                entry.on_connect.take().expect("connect handler consumed");
            runnables.push(Box::new(move || on_connect(Some(ticket))));
        }
        self.check_invariant();
        runnables
    }

    /// Fires the timeout handlers of every connecting ticket whose deadline
    /// (with slack) has passed, removes them from the queue, and promotes
    /// waiting tickets into the freed slots.
    pub fn tick(&mut self, now: Instant) -> Vec<Runnable> {
        let cutoff = now + TIMEOUT_SLACK;
        let mut runnables: Vec<Runnable> = Vec::new();

        let mut i = 0;
        while i < self.queue.len() {
            let expired = match (self.queue[i].connecting, self.queue[i].expires)
            {
                (true, Some(expires)) => expires < cutoff,
                _ => false,
            };
            if expired {
                let mut entry = self.queue.remove(i).unwrap();
                self.num_connecting -= 1;
                let on_timeout =
                    entry.on_timeout.take().expect("timeout handler consumed");
                runnables.push(Box::new(on_timeout));
            } else {
                i += 1;
            }
        }

        runnables.extend(self.try_connect(now));
        self.check_invariant();
        runnables
    }

    /// The earliest pending deadline, for the caller to arm the shared timer
    /// at. `None` when nothing is connecting.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.queue
            .iter()
            .filter(|e| e.connecting)
            .filter_map(|e| e.expires)
            .min()
    }

    /// Drains the queue: priority-2 tickets survive (keeping their half-open
    /// slots), connecting tickets fire their timeout handlers and waiting
    /// ones their connect handlers with a failure indication.
    pub fn close(&mut self) -> Vec<Runnable> {
        let mut survivors = VecDeque::new();
        let mut runnables: Vec<Runnable> = Vec::new();
        let mut num_connecting = 0;

        for mut entry in self.queue.drain(..) {
            if entry.priority > 1 {
                if entry.connecting {
                    num_connecting += 1;
                }
                survivors.push_back(entry);
                continue;
            }
            if entry.connecting {
                let on_timeout =
                    entry.on_timeout.take().expect("timeout handler consumed");
                runnables.push(Box::new(on_timeout));
            } else {
                let on_connect =
                    entry.on_connect.take().expect("connect handler consumed");
                runnables.push(Box::new(move || on_connect(None)));
            }
        }

        self.queue = survivors;
        self.num_connecting = num_connecting;
        self.check_invariant();
        runnables
    }

    fn check_invariant(&self) {
        debug_assert_eq!(
            self.num_connecting,
            self.queue.iter().filter(|e| e.connecting).count()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    const TIMEOUT: Duration = Duration::from_secs(10);

    struct Recorder {
        connects: Arc<AtomicUsize>,
        aborts: Arc<AtomicUsize>,
        timeouts: Arc<AtomicUsize>,
    }

    impl Recorder {
        fn new() -> Self {
            Self {
                connects: Arc::new(AtomicUsize::new(0)),
                aborts: Arc::new(AtomicUsize::new(0)),
                timeouts: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn handlers(&self) -> (ConnectHandler, TimeoutHandler) {
            let connects = Arc::clone(&self.connects);
            let aborts = Arc::clone(&self.aborts);
            let timeouts = Arc::clone(&self.timeouts);
            (
                Box::new(move |ticket| {
                    if ticket.is_some() {
                        connects.fetch_add(1, Ordering::SeqCst);
                    } else {
                        aborts.fetch_add(1, Ordering::SeqCst);
                    }
                }),
                Box::new(move || {
                    timeouts.fetch_add(1, Ordering::SeqCst);
                }),
            )
        }

        fn counts(&self) -> (usize, usize, usize) {
            (
                self.connects.load(Ordering::SeqCst),
                self.aborts.load(Ordering::SeqCst),
                self.timeouts.load(Ordering::SeqCst),
            )
        }
    }

    fn run(runnables: Vec<Runnable>) {
        for r in runnables {
            r();
        }
    }

    #[test]
    fn test_half_open_limit() {
        let mut q = ConnectionQueue::new(2);
        let rec = Recorder::new();
        for _ in 0..5 {
            let (on_connect, on_timeout) = rec.handlers();
            q.enqueue(on_connect, on_timeout, TIMEOUT, 0);
        }

        run(q.try_connect(Instant::now()));
        // exactly the cap's worth of tickets get to connect
        assert_eq!(q.num_connecting(), 2);
        assert_eq!(rec.counts(), (2, 0, 0));

        // a freed slot promotes the next waiting ticket
        assert!(q.done(0));
        run(q.try_connect(Instant::now()));
        assert_eq!(q.num_connecting(), 2);
        assert_eq!(rec.counts(), (3, 0, 0));
    }

    #[test]
    fn test_unlimited_when_zero() {
        let mut q = ConnectionQueue::new(0);
        let rec = Recorder::new();
        for _ in 0..8 {
            let (on_connect, on_timeout) = rec.handlers();
            q.enqueue(on_connect, on_timeout, TIMEOUT, 0);
        }
        run(q.try_connect(Instant::now()));
        assert_eq!(q.num_connecting(), 8);
        assert_eq!(rec.counts(), (8, 0, 0));
    }

    #[test]
    fn test_priority_ordering() {
        let mut q = ConnectionQueue::new(1);
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let enqueue =
            |q: &mut ConnectionQueue, label: &'static str, priority| {
                let order = Arc::clone(&order);
                q.enqueue(
                    Box::new(move |ticket| {
                        order.lock().unwrap().push((label, ticket.unwrap()))
                    }),
                    Box::new(|| {}),
                    TIMEOUT,
                    priority,
                );
            };
        enqueue(&mut q, "first normal", 0);
        enqueue(&mut q, "second normal", 0);
        enqueue(&mut q, "first urgent", 1);
        enqueue(&mut q, "second urgent", 1);

        // promote one at a time, freeing the slot in between
        let now = Instant::now();
        for _ in 0..4 {
            run(q.try_connect(now));
            let (_, ticket) = *order.lock().unwrap().last().unwrap();
            assert!(q.done(ticket));
        }

        // urgent tickets run first, later-added ahead of earlier-added;
        // normal tickets keep FIFO order
        let labels: Vec<_> =
            order.lock().unwrap().iter().map(|(l, _)| *l).collect();
        assert_eq!(
            labels,
            vec![
                "second urgent",
                "first urgent",
                "first normal",
                "second normal"
            ]
        );
    }

    #[test]
    fn test_timeout_fires_once_and_frees_slot() {
        let mut q = ConnectionQueue::new(1);
        let rec = Recorder::new();
        let (on_connect, on_timeout) = rec.handlers();
        q.enqueue(on_connect, on_timeout, Duration::from_secs(1), 0);
        let (on_connect, on_timeout) = rec.handlers();
        q.enqueue(on_connect, on_timeout, Duration::from_secs(1), 0);

        let start = Instant::now();
        run(q.try_connect(start));
        assert_eq!(rec.counts(), (1, 0, 0));
        assert!(q.next_deadline().is_some());

        // the deadline passes: the first ticket times out and the freed
        // slot promotes the second
        run(q.tick(start + Duration::from_secs(2)));
        assert_eq!(rec.counts(), (2, 0, 1));
        // the timed out ticket is gone
        assert!(!q.done(0));
        assert!(q.done(1));
        assert_eq!(q.num_connecting(), 0);
        assert_eq!(q.next_deadline(), None);
    }

    #[test]
    fn test_close_with_mixed_priorities() {
        let mut q = ConnectionQueue::new(0);
        let rec = Recorder::new();
        for priority in 0..3 {
            let (on_connect, on_timeout) = rec.handlers();
            q.enqueue(on_connect, on_timeout, TIMEOUT, priority);
        }
        run(q.try_connect(Instant::now()));
        assert_eq!(q.num_connecting(), 3);

        run(q.close());
        // the priority 2 ticket survives with its slot; 0 and 1 fired their
        // timeout handlers exactly once
        assert_eq!(q.len(), 1);
        assert_eq!(q.num_connecting(), 1);
        assert_eq!(rec.counts(), (3, 0, 2));
    }

    #[test]
    fn test_close_aborts_unpromoted() {
        let mut q = ConnectionQueue::new(1);
        let rec = Recorder::new();
        for _ in 0..3 {
            let (on_connect, on_timeout) = rec.handlers();
            q.enqueue(on_connect, on_timeout, TIMEOUT, 0);
        }
        run(q.try_connect(Instant::now()));
        assert_eq!(rec.counts(), (1, 0, 0));

        run(q.close());
        // the connecting ticket times out, the waiting ones get the abort
        // indication on their connect handlers
        assert_eq!(rec.counts(), (1, 2, 1));
        assert_eq!(q.len(), 0);
    }
}
