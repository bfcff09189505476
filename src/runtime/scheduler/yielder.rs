// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use crate::runtime::fail::Fail;
use ::std::{
    cell::RefCell,
    future::Future,
    hint,
    pin::Pin,
    rc::Rc,
    task::{
        Context,
        Poll,
        Waker,
    },
};

//==============================================================================
// Constants
//==============================================================================

/// Backoff iterations below this threshold spin in place; at or above it, the
/// waiter yields to the scheduler.
const YIELD_K_SPIN_LIMIT: usize = 16;

//==============================================================================
// Structures
//==============================================================================

/// Yield is a future that lets the currently running coroutine cooperatively
/// yield because it cannot make progress. Coroutines are expected to use the
/// methods on [Yielder] to create yield points.
struct Yield {
    /// How many times have we already yielded?
    already_yielded: usize,
    /// How many times should we yield? If none, then we yield until a wake
    /// signal.
    yield_quanta: Option<usize>,
    /// Shared reference used to wake the yielded coroutine with either Ok to
    /// indicate there is work to be done or an error to stop the coroutine.
    yielder_handle: YielderHandle,
}

/// Yielder Handle
///
/// Uniquely identifies a suspended coroutine and is the means of resuming it:
/// waking with `Ok(())` resumes normally, waking with an error cancels the
/// coroutine at its suspension point.
#[derive(Clone)]
pub struct YielderHandle {
    result_handle: Rc<RefCell<Option<Result<(), Fail>>>>,
    waker_handle: Rc<RefCell<Option<Waker>>>,
}

/// Yielder lets a single coroutine yield to the scheduler. The yielder handle
/// can be used to wake the coroutine.
pub struct Yielder {
    yielder_handle: YielderHandle,
}

//==============================================================================
// Associate Functions
//==============================================================================

impl Yield {
    fn new(yield_quanta: Option<usize>, yielder_handle: YielderHandle) -> Self {
        Self {
            already_yielded: 0,
            yield_quanta,
            yielder_handle,
        }
    }
}

impl YielderHandle {
    pub fn new() -> Self {
        Self {
            result_handle: Rc::new(RefCell::new(None)),
            waker_handle: Rc::new(RefCell::new(None)),
        }
    }

    /// Wake this yielded coroutine: Ok indicates there is work to be done and
    /// Fail indicates the coroutine should exit with an error.
    pub fn wake_with(&mut self, result: Result<(), Fail>) {
        if let Some(old_result) = self.result_handle.borrow_mut().replace(result) {
            debug!("wake_with(): already scheduled, overwriting result (old={:?})", old_result);
        }

        if let Some(waker) = self.waker_handle.borrow_mut().take() {
            waker.wake();
        }
    }

    /// Get the result this coroutine should be woken with.
    pub fn get_result(&mut self) -> Option<Result<(), Fail>> {
        self.result_handle.borrow_mut().take()
    }

    /// Set the waker for this yielder.
    pub fn set_waker(&mut self, waker: Waker) {
        *self.waker_handle.borrow_mut() = Some(waker);
    }
}

impl Yielder {
    /// Creates a new Yielder object for a specific coroutine to yield.
    pub fn new() -> Self {
        Self {
            yielder_handle: YielderHandle::new(),
        }
    }

    /// Returns a handle to this Yielder for waking the yielded coroutine.
    pub fn get_handle(&self) -> YielderHandle {
        self.yielder_handle.clone()
    }

    /// Creates a Yield future that yields for just one quanta.
    pub async fn yield_once(&self) -> Result<(), Fail> {
        Yield::new(Some(1), self.yielder_handle.clone()).await
    }

    /// Creates a Yield future that yields for n quanta.
    pub async fn yield_times(&self, n: usize) -> Result<(), Fail> {
        Yield::new(Some(n), self.yielder_handle.clone()).await
    }

    /// Creates a Yield future that yields until woken with a signal.
    pub async fn yield_until_wake(&self) -> Result<(), Fail> {
        Yield::new(None, self.yielder_handle.clone()).await
    }
}

//==============================================================================
// Standalone Functions
//==============================================================================

/// Backoff primitive for contended waits, parameterised by the iteration
/// count: early iterations spin in place, later ones yield cooperatively so
/// the lock holder can run.
pub async fn yield_k(k: usize, yielder: &Yielder) -> Result<(), Fail> {
    if k < YIELD_K_SPIN_LIMIT {
        hint::spin_loop();
        Ok(())
    } else {
        yielder.yield_once().await
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

impl Default for Yielder {
    fn default() -> Self {
        Self::new()
    }
}

impl Future for Yield {
    type Output = Result<(), Fail>;

    fn poll(self: Pin<&mut Self>, context: &mut Context) -> Poll<Self::Output> {
        let self_: &mut Self = self.get_mut();

        // First check if we've been woken to do some work.
        if let Some(result) = self_.yielder_handle.get_result() {
            return Poll::Ready(result);
        }

        // Stash the waker.
        self_.yielder_handle.set_waker(context.waker().clone());

        // If we are waiting for a fixed quanta, then always wake up.
        if let Some(budget) = self_.yield_quanta {
            self_.already_yielded += 1;
            if self_.already_yielded < budget {
                context.waker().wake_by_ref();
            } else {
                self_.yielder_handle.wake_with(Ok(()));
            }
        }

        Poll::Pending
    }
}
