// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use crate::runtime::{
    fail::Fail,
    scheduler::{
        Yielder,
        YielderHandle,
    },
    SharedObject,
};
use ::core::cmp::Reverse;
use ::std::{
    cell::Cell,
    collections::BinaryHeap,
    ops::{
        Deref,
        DerefMut,
    },
    rc::Rc,
    time::{
        Duration,
        Instant,
    },
};

//==============================================================================
// Structures
//==============================================================================

struct TimerQueueEntry {
    expiry: Instant,
    waiter: YielderHandle,
    cancelled: Rc<Cell<bool>>,
}

/// Token for an armed deadline. Cancelling it prevents the deadline from
/// waking the waiter after the waiter has already resumed for another reason.
pub struct TimerToken {
    cancelled: Rc<Cell<bool>>,
}

/// Timer that holds one or more events for future wake up. Time only moves
/// when `advance_clock` is called, which keeps timeout behavior deterministic.
pub struct Timer {
    now: Instant,
    // Reverse gives a min heap.
    heap: BinaryHeap<Reverse<TimerQueueEntry>>,
}

#[derive(Clone)]
pub struct SharedTimer(SharedObject<Timer>);

//==============================================================================
// Associate Functions
//==============================================================================

impl TimerToken {
    /// Disarms the deadline associated with this token.
    pub fn cancel(&self) {
        self.cancelled.set(true);
    }
}

impl SharedTimer {
    pub fn new(now: Instant) -> Self {
        Self(SharedObject::<Timer>::new(Timer {
            now,
            heap: BinaryHeap::new(),
        }))
    }

    /// Moves time forward deterministically. Every waiter whose deadline has
    /// passed is woken with `ETIMEDOUT`.
    pub fn advance_clock(&mut self, now: Instant) {
        assert!(self.now <= now);

        while let Some(Reverse(entry)) = self.heap.peek() {
            if now < entry.expiry {
                break;
            }
            let mut entry: TimerQueueEntry = self
                .heap
                .pop()
                .expect("should have an entry because we were able to peek")
                .0;
            if !entry.cancelled.get() {
                entry.waiter.wake_with(Err(Fail::new(libc::ETIMEDOUT, "deadline elapsed")));
            }
        }
        self.now = now;
    }

    pub fn now(&self) -> Instant {
        self.now
    }

    /// Arms a wake-up for `waiter` at `expiry`. The returned token disarms it.
    pub fn schedule_wake(&mut self, expiry: Instant, waiter: YielderHandle) -> TimerToken {
        let cancelled: Rc<Cell<bool>> = Rc::new(Cell::new(false));
        let entry: TimerQueueEntry = TimerQueueEntry {
            expiry,
            waiter,
            cancelled: cancelled.clone(),
        };
        self.heap.push(Reverse(entry));
        TimerToken { cancelled }
    }

    /// Suspends the calling coroutine for `timeout` of virtual time.
    pub async fn wait(mut self, timeout: Duration, yielder: &Yielder) -> Result<(), Fail> {
        let expiry: Instant = self.now + timeout;
        let token: TimerToken = self.schedule_wake(expiry, yielder.get_handle());
        match yielder.yield_until_wake().await {
            // The deadline elapsing is the expected wake-up.
            Err(e) if e.is_timeout() => Ok(()),
            Ok(()) => {
                token.cancel();
                Ok(())
            },
            Err(e) => {
                token.cancel();
                Err(e)
            },
        }
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

impl Default for SharedTimer {
    fn default() -> Self {
        Self::new(Instant::now())
    }
}

impl Deref for SharedTimer {
    type Target = Timer;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for SharedTimer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.0.deref_mut()
    }
}

impl PartialEq for TimerQueueEntry {
    fn eq(&self, other: &TimerQueueEntry) -> bool {
        // For the usage in this module we only compare entries by expiration.
        self.expiry == other.expiry
    }
}

impl Eq for TimerQueueEntry {}

impl PartialOrd for TimerQueueEntry {
    fn partial_cmp(&self, other: &TimerQueueEntry) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerQueueEntry {
    fn cmp(&self, other: &TimerQueueEntry) -> core::cmp::Ordering {
        self.expiry.cmp(&other.expiry)
    }
}
