//! A cooperative, single-threaded event loop.
//!
//! Promise reactions never run inside the call that schedules them. They are
//! pushed onto the microtask queue of an [`EventLoop`] and run when the host
//! drives it with [`EventLoop::run`] or [`EventLoop::block_on`].
//!
//! Timers run on a virtual clock: the clock only moves when the microtask
//! queue is empty, and then jumps straight to the next due timer. Nothing
//! ever sleeps.
//!
//! # Examples
//!
//! ```
//! use promise_aplus::{EventLoop, Value};
//! use std::time::Duration;
//!
//! let event_loop = EventLoop::new();
//! let answer = event_loop.block_on(async {
//!     let deferred = promise_aplus::deferred();
//!     let resolve = deferred.resolve.clone();
//!     promise_aplus::set_timeout(Duration::from_millis(10), move || resolve.call(42));
//!     deferred.promise.await
//! });
//! assert_eq!(answer.unwrap(), Ok(Value::from(42)));
//! assert_eq!(event_loop.now(), Duration::from_millis(10));
//! ```
use crate::Error;
use futures::task::noop_waker_ref;
use std::{
    cell::{Cell, RefCell},
    cmp::{Ordering, Reverse},
    collections::{BinaryHeap, VecDeque},
    future::Future,
    pin::pin,
    rc::Rc,
    task::{Context, Poll},
    time::Duration,
};
use tracing::{debug, trace};

/// Tasks a single drive may run before it gives up.
pub const DEFAULT_TASK_BUDGET: usize = 1_000_000;

type Task = Box<dyn FnOnce()>;

thread_local! {
    /// The loop new promises on this thread bind to.
    static CURRENT: RefCell<Option<EventLoop>> = const { RefCell::new(None) };
}

/// Handle to an event loop. Clones drive the same queues.
#[derive(Clone)]
pub struct EventLoop {
    inner: Rc<Inner>,
}

struct Inner {
    task_budget: usize,
    microtasks: RefCell<VecDeque<Task>>,
    timers: RefCell<BinaryHeap<Reverse<Timer>>>,
    now: Cell<Duration>,
    next_timer: Cell<u64>,
    spent: Cell<usize>,
}

struct Timer {
    due: Duration,
    seq: u64,
    task: Task,
}

impl PartialEq for Timer {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Timer {}

impl PartialOrd for Timer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timer {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.due, self.seq).cmp(&(other.due, other.seq))
    }
}

/// Builder for configuring an [`EventLoop`].
///
/// ```
/// use promise_aplus::EventLoop;
/// let event_loop = EventLoop::builder().task_budget(64).build();
/// assert_eq!(event_loop.task_budget(), 64);
/// ```
pub struct Builder {
    task_budget: usize,
}

impl Builder {
    pub fn new() -> Self {
        Self {
            task_budget: DEFAULT_TASK_BUDGET,
        }
    }

    /// Caps the number of tasks one call to [`EventLoop::run`],
    /// [`EventLoop::turn`] or [`EventLoop::block_on`] may execute.
    ///
    /// # Panics
    ///
    /// Panics if `n == 0`.
    pub fn task_budget(mut self, n: usize) -> Self {
        assert!(n > 0, "task_budget must be > 0");

        self.task_budget = n;
        self
    }

    pub fn build(self) -> EventLoop {
        EventLoop {
            inner: Rc::new(Inner {
                task_budget: self.task_budget,
                microtasks: RefCell::new(VecDeque::new()),
                timers: RefCell::new(BinaryHeap::new()),
                now: Cell::new(Duration::ZERO),
                next_timer: Cell::new(0),
                spent: Cell::new(0),
            }),
        }
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLoop {
    pub fn new() -> Self {
        Builder::new().build()
    }

    pub fn builder() -> Builder {
        Builder::new()
    }

    /// The loop installed on this thread, creating a default one on first use.
    pub fn current() -> EventLoop {
        CURRENT.with(|cell| cell.borrow_mut().get_or_insert_with(EventLoop::new).clone())
    }

    /// Runs `f` with this loop installed as the thread's current loop, then
    /// restores whatever was installed before.
    pub fn enter<R>(&self, f: impl FnOnce() -> R) -> R {
        let prev = CURRENT.with(|cell| cell.replace(Some(self.clone())));
        let out = f();

        CURRENT.with(|cell| cell.replace(prev));

        out
    }

    pub fn task_budget(&self) -> usize {
        self.inner.task_budget
    }

    /// Current reading of the virtual clock.
    pub fn now(&self) -> Duration {
        self.inner.now.get()
    }

    pub fn queue_microtask(&self, task: impl FnOnce() + 'static) {
        self.inner.microtasks.borrow_mut().push_back(Box::new(task));
    }

    /// Schedules `task` once `delay` has elapsed on the virtual clock. Timers
    /// with the same due time fire in the order they were set.
    pub fn set_timeout(&self, delay: Duration, task: impl FnOnce() + 'static) {
        let seq = self.inner.next_timer.get();
        self.inner.next_timer.set(seq + 1);
        let due = self.now() + delay;
        trace!(?due, seq, "timer set");
        self.inner.timers.borrow_mut().push(Reverse(Timer {
            due,
            seq,
            task: Box::new(task),
        }));
    }

    pub fn is_idle(&self) -> bool {
        self.inner.microtasks.borrow().is_empty() && self.inner.timers.borrow().is_empty()
    }

    /// Drains the microtask queue or, if it was already empty, fires the next
    /// due timer. Returns whether anything ran.
    ///
    /// Each call is its own drive and gets the full task budget.
    pub fn turn(&self) -> Result<bool, Error> {
        self.inner.spent.set(0);
        self.enter(|| self.step())
    }

    /// Runs until there is nothing left to do.
    pub fn run(&self) -> Result<(), Error> {
        self.inner.spent.set(0);
        self.enter(|| {
            while self.step()? {}
            Ok(())
        })
    }

    /// Polls `future` to completion, driving the loop between polls.
    ///
    /// Fails with [`Error::Stalled`] when the loop has nothing left to run but
    /// the future is still pending.
    pub fn block_on<F: Future>(&self, future: F) -> Result<F::Output, Error> {
        self.inner.spent.set(0);
        let mut future = pin!(future);
        let mut cx = Context::from_waker(noop_waker_ref());

        self.enter(|| loop {
            if let Poll::Ready(out) = future.as_mut().poll(&mut cx) {
                return Ok(out);
            }
            if !self.step()? {
                debug!("event loop went idle with the future still pending");
                return Err(Error::Stalled);
            }
        })
    }

    fn step(&self) -> Result<bool, Error> {
        let mut progressed = false;

        while let Some(task) = self.pop_microtask() {
            self.charge()?;
            task();
            progressed = true;
        }
        if progressed {
            return Ok(true);
        }

        let Some(Reverse(timer)) = self.pop_timer() else {
            return Ok(false);
        };
        self.charge()?;
        if timer.due > self.now() {
            self.inner.now.set(timer.due);
        }
        trace!(now = ?timer.due, seq = timer.seq, "timer fired");
        (timer.task)();
        Ok(true)
    }

    fn pop_microtask(&self) -> Option<Task> {
        self.inner.microtasks.borrow_mut().pop_front()
    }

    fn pop_timer(&self) -> Option<Reverse<Timer>> {
        self.inner.timers.borrow_mut().pop()
    }

    fn charge(&self) -> Result<(), Error> {
        let spent = self.inner.spent.get() + 1;
        self.inner.spent.set(spent);
        if spent > self.inner.task_budget {
            debug!(budget = self.inner.task_budget, "task budget exhausted");
            return Err(Error::BudgetExhausted(self.inner.task_budget));
        }
        Ok(())
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

/// [`EventLoop::queue_microtask`] on the current loop.
pub fn queue_microtask(task: impl FnOnce() + 'static) {
    EventLoop::current().queue_microtask(task)
}

/// [`EventLoop::set_timeout`] on the current loop.
pub fn set_timeout(delay: Duration, task: impl FnOnce() + 'static) {
    EventLoop::current().set_timeout(delay, task)
}

/// [`EventLoop::run`] on the current loop.
pub fn run() -> Result<(), Error> {
    EventLoop::current().run()
}

/// [`EventLoop::block_on`] on the current loop.
pub fn block_on<F: Future>(future: F) -> Result<F::Output, Error> {
    EventLoop::current().block_on(future)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder() -> (Rc<RefCell<Vec<&'static str>>>, impl Fn(&'static str) -> Box<dyn FnOnce()>) {
        let log = Rc::new(RefCell::new(Vec::new()));
        let sink = log.clone();
        let push = move |name: &'static str| {
            let sink = sink.clone();
            Box::new(move || sink.borrow_mut().push(name)) as Box<dyn FnOnce()>
        };
        (log, push)
    }

    #[test]
    fn test_microtasks_run_in_fifo_order() {
        let event_loop = EventLoop::new();
        let (log, push) = recorder();
        event_loop.queue_microtask(push("a"));
        event_loop.queue_microtask(push("b"));
        event_loop.queue_microtask(push("c"));
        assert!(log.borrow().is_empty());
        event_loop.run().unwrap();
        assert_eq!(*log.borrow(), ["a", "b", "c"]);
    }

    #[test]
    fn test_microtasks_drain_before_timers() {
        let event_loop = EventLoop::new();
        let (log, push) = recorder();
        event_loop.set_timeout(Duration::ZERO, push("timer"));
        let inner = event_loop.clone();
        let nested = push("nested");
        event_loop.queue_microtask(move || inner.queue_microtask(nested));
        event_loop.run().unwrap();
        assert_eq!(*log.borrow(), ["nested", "timer"]);
    }

    #[test]
    fn test_timers_fire_by_due_time_then_insertion() {
        let event_loop = EventLoop::new();
        let (log, push) = recorder();
        event_loop.set_timeout(Duration::from_millis(10), push("ten"));
        event_loop.set_timeout(Duration::from_millis(5), push("five"));
        event_loop.set_timeout(Duration::from_millis(5), push("five again"));
        event_loop.run().unwrap();
        assert_eq!(*log.borrow(), ["five", "five again", "ten"]);
        assert_eq!(event_loop.now(), Duration::from_millis(10));
    }

    #[test]
    fn test_timer_delay_is_relative_to_now() {
        let event_loop = EventLoop::new();
        let (log, push) = recorder();
        let inner = event_loop.clone();
        let late = push("late");
        event_loop.set_timeout(Duration::from_millis(5), move || {
            inner.set_timeout(Duration::from_millis(5), late)
        });
        event_loop.run().unwrap();
        assert_eq!(*log.borrow(), ["late"]);
        assert_eq!(event_loop.now(), Duration::from_millis(10));
    }

    #[test]
    fn test_budget_stops_runaway_tasks() {
        fn respawn(event_loop: EventLoop) {
            let next = event_loop.clone();
            event_loop.queue_microtask(move || respawn(next));
        }
        let event_loop = EventLoop::builder().task_budget(100).build();
        respawn(event_loop.clone());
        assert_eq!(event_loop.run(), Err(Error::BudgetExhausted(100)));
    }

    #[test]
    fn test_budget_is_per_turn() {
        let event_loop = EventLoop::builder().task_budget(3).build();
        for _ in 0..5 {
            event_loop.queue_microtask(|| {});
            assert_eq!(event_loop.turn(), Ok(true));
        }
        assert_eq!(event_loop.turn(), Ok(false));
    }

    #[test]
    fn test_budget_caps_a_single_turn() {
        let event_loop = EventLoop::builder().task_budget(2).build();
        for _ in 0..3 {
            event_loop.queue_microtask(|| {});
        }
        assert_eq!(event_loop.turn(), Err(Error::BudgetExhausted(2)));
    }

    #[test]
    #[should_panic(expected = "task_budget must be > 0")]
    fn test_zero_budget_rejected() {
        let _ = EventLoop::builder().task_budget(0);
    }

    #[test]
    fn test_block_on_stalls_on_a_future_that_never_wakes() {
        let event_loop = EventLoop::new();
        let out = event_loop.block_on(futures::future::pending::<()>());
        assert_eq!(out, Err(Error::Stalled));
    }

    #[test]
    fn test_enter_restores_previous_loop() {
        let outer = EventLoop::current();
        let inner = EventLoop::new();
        inner.enter(|| assert!(Rc::ptr_eq(&EventLoop::current().inner, &inner.inner)));
        assert!(Rc::ptr_eq(&EventLoop::current().inner, &outer.inner));
    }
}
