// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A command queue with cancellable delayed delivery.
//!
//! `WorkQueue` is the sole synchronisation boundary between the listener
//! thread and the coordinator thread: any number of producers may `push`
//! (or `push_after`) messages, and a single consumer drains them with
//! `pop`/`pop_until`.
//!
//! Delayed messages are the soft-realtime scheduler for periodic detector
//! work. `push_after` hands back a [`TimerHandle`]; dropping the handle
//! before the delay elapses cancels the delivery, dropping it afterwards is
//! a no-op. Exactly one of those two outcomes is observed for every handle.
//!
//! The expected usage model is:
//!
//! - The consumer owns one `WorkQueue` and clones it into each producer.
//!
//! - A handler that wants to run again later re-arms itself by calling
//!   `push_after` and *replacing* its stored `TimerHandle` with the new
//!   one, so that at most one delivery per activity is ever pending.
//!
//! Internally this is a ready deque plus a min-heap of delayed entries
//! keyed by deadline, under one mutex with a condvar. The consumer sleeps
//! until either a producer pushes or the earliest deadline passes; entries
//! whose cancellation flag is set by the time they come due are discarded
//! instead of delivered.

use std::collections::{BinaryHeap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

pub struct WorkQueue<T> {
    shared: Arc<Shared<T>>,
}

// Manual impl: a derived Clone would demand `T: Clone`.
impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Default for WorkQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Owning token for one pending delayed delivery.
///
/// Dropping the handle cancels the delivery if the message has not yet
/// migrated into the ready queue; afterwards dropping is a no-op.
#[must_use = "dropping a TimerHandle cancels the pending delivery"]
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }
}

struct Shared<T> {
    state: Mutex<State<T>>,
    available: Condvar,
}

struct State<T> {
    ready: VecDeque<T>,
    delayed: BinaryHeap<Delayed<T>>,
    // Tie-break for entries due in the same instant, and the FIFO order
    // within a producer.
    next_seq: u64,
}

struct Delayed<T> {
    due: Instant,
    seq: u64,
    cancelled: Arc<AtomicBool>,
    msg: T,
}

// BinaryHeap is a max-heap; order entries so the earliest deadline (then
// lowest sequence number) is the greatest element.
impl<T> Ord for Delayed<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (other.due, other.seq).cmp(&(self.due, self.seq))
    }
}

impl<T> PartialOrd for Delayed<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> PartialEq for Delayed<T> {
    fn eq(&self, other: &Self) -> bool {
        (self.due, self.seq) == (other.due, other.seq)
    }
}

impl<T> Eq for Delayed<T> {}

impl<T> WorkQueue<T> {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    ready: VecDeque::new(),
                    delayed: BinaryHeap::new(),
                    next_seq: 0,
                }),
                available: Condvar::new(),
            }),
        }
    }

    // A poisoned lock means a producer panicked mid-push; the queue state
    // can no longer be trusted, so take the whole process down.
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.shared.state.lock().expect("work queue lock poisoned")
    }

    /// Appends a message for immediate delivery.
    pub fn push(&self, msg: T) {
        let mut state = self.lock();
        state.ready.push_back(msg);
        drop(state);
        self.shared.available.notify_one();
    }

    /// Schedules a message for delivery no earlier than `delay` from now.
    ///
    /// Release the returned handle to cancel the delivery; once the
    /// message has been moved into the ready queue the handle is inert.
    pub fn push_after(&self, msg: T, delay: Duration) -> TimerHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let mut state = self.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.delayed.push(Delayed {
            due: Instant::now() + delay,
            seq,
            cancelled: Arc::clone(&cancelled),
            msg,
        });
        drop(state);
        // Wake the consumer so it recomputes its sleep deadline.
        self.shared.available.notify_one();
        TimerHandle { cancelled }
    }

    /// Blocks until a message is available and returns it.
    pub fn pop(&self) -> T {
        let mut state = self.lock();
        loop {
            promote_due(&mut state);
            if let Some(msg) = state.ready.pop_front() {
                return msg;
            }
            state = match next_deadline(&state) {
                Some(due) => {
                    let timeout = due.saturating_duration_since(Instant::now());
                    self.shared
                        .available
                        .wait_timeout(state, timeout)
                        .expect("work queue lock poisoned")
                        .0
                }
                None => self
                    .shared
                    .available
                    .wait(state)
                    .expect("work queue lock poisoned"),
            };
        }
    }

    /// Like [`pop`](Self::pop), but gives up at `deadline` and returns
    /// `None`. Delayed work that comes due in the meantime is delivered.
    pub fn pop_until(&self, deadline: Instant) -> Option<T> {
        let mut state = self.lock();
        loop {
            promote_due(&mut state);
            if let Some(msg) = state.ready.pop_front() {
                return Some(msg);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let until = match next_deadline(&state) {
                Some(due) if due < deadline => due,
                _ => deadline,
            };
            state = self
                .shared
                .available
                .wait_timeout(state, until.saturating_duration_since(now))
                .expect("work queue lock poisoned")
                .0;
        }
    }
}

/// Moves every non-cancelled entry whose deadline has passed into the
/// ready queue. Cancellation is checked here, at migration time: this is
/// the point past which releasing a `TimerHandle` no longer has an effect.
fn promote_due<T>(state: &mut State<T>) {
    let now = Instant::now();
    while let Some(head) = state.delayed.peek() {
        if head.due > now {
            break;
        }
        let entry = state.delayed.pop().unwrap();
        if entry.cancelled.load(Ordering::Relaxed) {
            continue;
        }
        state.ready.push_back(entry.msg);
    }
}

fn next_deadline<T>(state: &State<T>) -> Option<Instant> {
    state.delayed.peek().map(|d| d.due)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    const SHORT: Duration = Duration::from_millis(20);

    #[test]
    fn push_pop_is_fifo() {
        let q = WorkQueue::new();
        q.push(1u32);
        q.push(2);
        q.push(3);
        assert_eq!(q.pop(), 1);
        assert_eq!(q.pop(), 2);
        assert_eq!(q.pop(), 3);
    }

    #[test]
    fn pop_blocks_for_producer() {
        let q = WorkQueue::new();
        let producer = q.clone();
        let t = thread::spawn(move || {
            thread::sleep(SHORT);
            producer.push(7u32);
        });
        assert_eq!(q.pop(), 7);
        t.join().unwrap();
    }

    #[test]
    fn delayed_message_is_not_early() {
        let q = WorkQueue::new();
        let start = Instant::now();
        let _handle = q.push_after(1u32, SHORT);
        assert_eq!(q.pop(), 1);
        assert!(start.elapsed() >= SHORT);
    }

    #[test]
    fn dropping_handle_cancels_pending_delivery() {
        let q = WorkQueue::new();
        let handle = q.push_after(1u32, SHORT);
        drop(handle);
        // Long enough that the cancelled entry would have come due.
        assert_eq!(q.pop_until(Instant::now() + 3 * SHORT), None);
    }

    #[test]
    fn dropping_handle_after_delivery_is_noop() {
        let q = WorkQueue::new();
        let handle = q.push_after(1u32, Duration::ZERO);
        assert_eq!(q.pop(), 1);
        drop(handle);
        assert_eq!(q.pop_until(Instant::now() + SHORT), None);
    }

    #[test]
    fn replacing_handle_leaves_one_cycle() {
        let q = WorkQueue::new();
        let mut handle = q.push_after(1u32, SHORT);
        // Re-arm before the first delivery fires, as the coordinator does.
        handle = q.push_after(2u32, SHORT);
        assert_eq!(q.pop(), 2);
        assert_eq!(q.pop_until(Instant::now() + 3 * SHORT), None);
        drop(handle);
    }

    #[test]
    fn same_tick_timers_all_arrive() {
        let q = WorkQueue::new();
        let h1 = q.push_after(1u32, SHORT);
        let h2 = q.push_after(2u32, SHORT);
        let mut got = vec![q.pop(), q.pop()];
        got.sort_unstable();
        assert_eq!(got, [1, 2]);
        drop((h1, h2));
    }

    #[test]
    fn immediate_push_overtakes_delayed() {
        let q = WorkQueue::new();
        let _handle = q.push_after(1u32, SHORT);
        q.push(2u32);
        assert_eq!(q.pop(), 2);
        assert_eq!(q.pop(), 1);
    }

    #[test]
    fn pop_until_times_out_empty() {
        let q: WorkQueue<u32> = WorkQueue::new();
        let deadline = Instant::now() + SHORT;
        assert_eq!(q.pop_until(deadline), None);
        assert!(Instant::now() >= deadline);
    }
}
