// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! The callout queue.
//!
//! A single-threaded queue of deferred work. Callers schedule an
//! event `delay` seconds from now and get back a handle they may use
//! to cancel it. The owner of the queue drives time forward with
//! [`TimerQueue::advance`] (or [`TimerQueue::pop_due`] when the events
//! it fires may schedule more events), and asks
//! [`TimerQueue::time_until_next`] how long it may block.
//!
//! Events are kept sorted by absolute deadline rather than as a chain
//! of deltas. The two are equivalent: the delta of an event is its
//! deadline minus its predecessor's, and inserting or cancelling an
//! event never perturbs the deadline of any other. Events with equal
//! deadlines fire in the order they were scheduled.

use std::collections::BTreeMap;
use std::collections::HashMap;

/// An opaque reference to a scheduled event.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct TimerHandle(u64);

#[derive(Debug)]
pub struct TimerQueue<T> {
    /// Seconds since the queue was created.
    now: u64,
    next_id: u64,
    pending: BTreeMap<(u64, u64), T>,
    deadlines: HashMap<u64, u64>,
}

impl<T> Default for TimerQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TimerQueue<T> {
    pub fn new() -> Self {
        Self {
            now: 0,
            next_id: 0,
            pending: BTreeMap::new(),
            deadlines: HashMap::new(),
        }
    }

    /// The queue's notion of the current time, in seconds.
    pub fn now(&self) -> u64 {
        self.now
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Schedule `event` to fire `delay` seconds from now.
    pub fn schedule(&mut self, delay: u32, event: T) -> TimerHandle {
        let id = self.next_id;
        self.next_id += 1;
        let deadline = self.now + u64::from(delay);
        self.pending.insert((deadline, id), event);
        self.deadlines.insert(id, deadline);
        TimerHandle(id)
    }

    /// Cancel a scheduled event, handing its payload back.
    ///
    /// Returns `None` if the event already fired or was cancelled.
    pub fn cancel(&mut self, handle: TimerHandle) -> Option<T> {
        let deadline = self.deadlines.remove(&handle.0)?;
        self.pending.remove(&(deadline, handle.0))
    }

    /// Seconds until the earliest pending event, if any.
    pub fn time_until_next(&self) -> Option<u32> {
        self.pending
            .first_key_value()
            .map(|((deadline, _), _)| self.remaining(*deadline))
    }

    /// Seconds until the event behind `handle` fires.
    pub fn time_left(&self, handle: TimerHandle) -> Option<u32> {
        self.deadlines.get(&handle.0).map(|d| self.remaining(*d))
    }

    fn remaining(&self, deadline: u64) -> u32 {
        u32::try_from(deadline.saturating_sub(self.now)).unwrap_or(u32::MAX)
    }

    /// Remove and return the earliest event due at or before `until`,
    /// moving the clock to that event's deadline.
    ///
    /// Events scheduled between calls are relative to the deadline of
    /// the event that was just returned, so an event may schedule a
    /// follow-up that becomes due within the same sweep.
    pub fn pop_due(&mut self, until: u64) -> Option<T> {
        let (&(deadline, id), _) = self.pending.first_key_value()?;
        if deadline > until {
            return None;
        }

        let (_, event) = self.pending.pop_first()?;
        self.deadlines.remove(&id);
        self.now = self.now.max(deadline);
        Some(event)
    }

    /// Move the clock to `until` once all due events are handled.
    pub fn settle(&mut self, until: u64) {
        self.now = self.now.max(until);
    }

    /// Advance time by `elapsed` seconds, returning every event that
    /// came due, in firing order.
    pub fn advance(&mut self, elapsed: u32) -> Vec<T> {
        let until = self.now + u64::from(elapsed);
        let mut fired = Vec::new();
        while let Some(ev) = self.pop_due(until) {
            fired.push(ev);
        }
        self.settle(until);
        fired
    }

    /// Drop every pending event.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.deadlines.clear();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fires_in_delay_order() {
        let mut q = TimerQueue::new();
        let delays = [7u32, 3, 12, 3, 0, 9];
        for (i, d) in delays.iter().enumerate() {
            q.schedule(*d, i);
        }
        assert_eq!(q.time_until_next(), Some(0));

        let total: u32 = delays.iter().sum();
        let fired = q.advance(total);
        // Equal delays fire in scheduling order.
        assert_eq!(fired, vec![4, 1, 3, 0, 5, 2]);
        assert!(q.is_empty());
        assert_eq!(q.time_until_next(), None);
        assert_eq!(q.now(), u64::from(total));
    }

    #[test]
    fn cancel_does_not_perturb_others() {
        let mut q = TimerQueue::new();
        let a = q.schedule(5, "a");
        let b = q.schedule(10, "b");
        let c = q.schedule(15, "c");

        assert_eq!(q.cancel(b), Some("b"));
        assert_eq!(q.cancel(b), None);
        assert_eq!(q.time_left(a), Some(5));
        assert_eq!(q.time_left(c), Some(15));

        assert_eq!(q.advance(5), vec!["a"]);
        assert_eq!(q.time_left(c), Some(10));
        assert!(q.advance(9).is_empty());
        assert_eq!(q.advance(1), vec!["c"]);
    }

    #[test]
    fn partial_advance() {
        let mut q = TimerQueue::new();
        q.schedule(10, ());
        assert!(q.advance(4).is_empty());
        assert_eq!(q.time_until_next(), Some(6));
        assert_eq!(q.advance(6).len(), 1);
    }

    #[test]
    fn reentrant_schedule_within_sweep() {
        let mut q = TimerQueue::new();
        q.schedule(2, 1u32);
        q.schedule(9, 100);

        let until = q.now() + 10;
        let mut fired = vec![];
        while let Some(ev) = q.pop_due(until) {
            fired.push((q.now(), ev));
            // Each small event reschedules itself with a doubling delay.
            if ev < 100 {
                q.schedule(2 * ev + 1, ev * 2);
            }
        }
        q.settle(until);

        // 4 comes due exactly at the end of the sweep; 8 does not.
        assert_eq!(fired, vec![(2, 1), (5, 2), (9, 100), (10, 4)]);
        assert_eq!(q.now(), 10);
        assert_eq!(q.time_until_next(), Some(9));
    }
}
