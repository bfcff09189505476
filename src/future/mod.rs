// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Futures and promises: single-assignment shared states with waiters, plus
//! the continuation combinators that compose them into task graphs.

mod combinators;
mod state;

//======================================================================================================================
// Exports
//======================================================================================================================

pub use self::{
    combinators::{
        dataflow,
        when_all,
        when_any,
        Launch,
        WhenAnyResult,
    },
    state::SharedFutureState,
};

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    fail::Fail,
    scheduler::Yielder,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Write handle to a shared state. May transition the state exactly once;
/// dropping a promise without setting it stores a "broken promise" error.
pub struct Promise<T> {
    state: Option<SharedFutureState<T>>,
    future_retrieved: bool,
}

/// Read handle to a shared state. Non-copyable: moving a future transfers
/// ownership of the read side, and `get` consumes it.
pub struct TaskFuture<T> {
    state: Option<SharedFutureState<T>>,
}

impl<T> ::std::fmt::Debug for TaskFuture<T> {
    fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
        f.debug_struct("TaskFuture").finish()
    }
}

/// Copyable read handle. Multiple holders may read the same outcome.
pub struct SharedTaskFuture<T: Clone> {
    state: SharedFutureState<T>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl<T> Promise<T> {
    pub fn new() -> Self {
        Self {
            state: Some(SharedFutureState::new()),
            future_retrieved: false,
        }
    }

    /// Retrieves the future associated with this promise. May be called once.
    pub fn get_future(&mut self) -> Result<TaskFuture<T>, Fail> {
        let state: &SharedFutureState<T> = match self.state.as_ref() {
            Some(state) => state,
            None => return Err(no_state_fail("get_future")),
        };
        if self.future_retrieved {
            let cause: &str = "future was already retrieved";
            error!("get_future(): {}", cause);
            return Err(Fail::new(libc::EINVAL, cause));
        }
        self.future_retrieved = true;
        Ok(TaskFuture::from_state(state.clone()))
    }

    /// Stores `value` into the shared state, waking all waiters.
    pub fn set_value(&mut self, value: T) -> Result<(), Fail> {
        match self.state.as_mut() {
            Some(state) => state.set_value(value),
            None => Err(no_state_fail("set_value")),
        }
    }

    /// Stores `error` into the shared state, waking all waiters.
    pub fn set_error(&mut self, error: Fail) -> Result<(), Fail> {
        match self.state.as_mut() {
            Some(state) => state.set_error(error),
            None => Err(no_state_fail("set_error")),
        }
    }

    /// Exposes the underlying shared state, e.g. for registration with the
    /// symbol namespace.
    pub fn get_state(&self) -> Result<SharedFutureState<T>, Fail> {
        match self.state.as_ref() {
            Some(state) => Ok(state.clone()),
            None => Err(no_state_fail("get_state")),
        }
    }
}

impl<T> TaskFuture<T> {
    pub(crate) fn from_state(state: SharedFutureState<T>) -> Self {
        Self { state: Some(state) }
    }

    /// Whether this future refers to a shared state.
    pub fn has_state(&self) -> bool {
        self.state.is_some()
    }

    /// Whether the underlying state holds an outcome.
    pub fn is_ready(&self) -> bool {
        match self.state.as_ref() {
            Some(state) => state.is_ready(),
            None => false,
        }
    }

    /// Returns the stored value, suspending the current task until the state
    /// transitions. Consumes the future.
    pub async fn get(mut self, yielder: &Yielder) -> Result<T, Fail> {
        let mut state: SharedFutureState<T> = match self.state.take() {
            Some(state) => state,
            None => return Err(no_state_fail("get")),
        };
        state.wait_ready(yielder).await?;
        state.take_result()
    }

    /// Suspends the current task until the state holds an outcome, without
    /// consuming it.
    pub async fn wait_ready(&mut self, yielder: &Yielder) -> Result<(), Fail> {
        match self.state.as_mut() {
            Some(state) => state.wait_ready(yielder).await,
            None => Err(no_state_fail("wait_ready")),
        }
    }

    /// Registers a waiter on the underlying state.
    pub(crate) fn register_waiter(&mut self, waiter: crate::runtime::scheduler::YielderHandle) -> Result<(), Fail> {
        match self.state.as_mut() {
            Some(state) => {
                state.add_waiter(waiter);
                Ok(())
            },
            None => Err(no_state_fail("register_waiter")),
        }
    }

    /// Converts this future into a copyable one.
    pub fn share(mut self) -> Result<SharedTaskFuture<T>, Fail>
    where
        T: Clone,
    {
        match self.state.take() {
            Some(state) => Ok(SharedTaskFuture { state }),
            None => Err(no_state_fail("share")),
        }
    }
}

impl<T: Clone> SharedTaskFuture<T> {
    /// Returns a copy of the stored value, suspending the current task until
    /// the state transitions. May be called multiple times.
    pub async fn get_clone(&mut self, yielder: &Yielder) -> Result<T, Fail> {
        self.state.wait_ready(yielder).await?;
        self.state.clone_result()
    }

    pub fn is_ready(&self) -> bool {
        self.state.is_ready()
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Creates a future that is already resolved to `value`.
pub fn make_ready_future<T>(value: T) -> TaskFuture<T> {
    let mut state: SharedFutureState<T> = SharedFutureState::new();
    // The state is freshly constructed, so the transition cannot fail.
    state
        .set_value(value)
        .expect("freshly constructed state cannot be satisfied");
    TaskFuture::from_state(state)
}

/// Creates a future that is already resolved to `error`.
pub fn make_exceptional_future<T>(error: Fail) -> TaskFuture<T> {
    let mut state: SharedFutureState<T> = SharedFutureState::new();
    state
        .set_error(error)
        .expect("freshly constructed state cannot be satisfied");
    TaskFuture::from_state(state)
}

fn no_state_fail(op: &str) -> Fail {
    let cause: String = format!("{}(): no associated shared state", op);
    error!("{}", cause);
    Fail::new(libc::ENXIO, &cause)
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

/// A default-constructed promise has no shared state; every access reports
/// `ENXIO`.
impl<T> Default for Promise<T> {
    fn default() -> Self {
        Self {
            state: None,
            future_retrieved: false,
        }
    }
}

/// A default-constructed future has no shared state.
impl<T> Default for TaskFuture<T> {
    fn default() -> Self {
        Self { state: None }
    }
}

impl<T: Clone> Clone for SharedTaskFuture<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

/// Dropping a promise that never transitioned its state breaks the promise:
/// readers observe `EPIPE`.
impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        if let Some(state) = self.state.as_mut() {
            if !state.is_ready() {
                let _ = state.set_error(Fail::new(libc::EPIPE, "broken promise"));
            }
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::{
        make_exceptional_future,
        make_ready_future,
        Promise,
        TaskFuture,
    };
    use crate::runtime::fail::Fail;
    use ::anyhow::Result;

    #[test]
    fn default_promise_has_no_state() -> Result<()> {
        let mut promise: Promise<i32> = Promise::default();
        let e: Fail = promise.get_future().unwrap_err();
        crate::ensure_eq!(e.errno, libc::ENXIO);
        let e: Fail = promise.set_value(1).unwrap_err();
        crate::ensure_eq!(e.errno, libc::ENXIO);
        Ok(())
    }

    #[test]
    fn future_can_only_be_retrieved_once() -> Result<()> {
        let mut promise: Promise<i32> = Promise::new();
        crate::ensure_eq!(promise.get_future().is_ok(), true);
        let e: Fail = promise.get_future().unwrap_err();
        crate::ensure_eq!(e.errno, libc::EINVAL);
        Ok(())
    }

    #[test]
    fn second_set_value_fails() -> Result<()> {
        let mut promise: Promise<i32> = Promise::new();
        promise.set_value(1)?;
        let e: Fail = promise.set_value(2).unwrap_err();
        crate::ensure_eq!(e.errno, libc::EEXIST);
        Ok(())
    }

    #[test]
    fn dropping_unsatisfied_promise_breaks_it() -> Result<()> {
        let mut promise: Promise<i32> = Promise::new();
        let future: TaskFuture<i32> = promise.get_future()?;
        drop(promise);
        crate::ensure_eq!(future.is_ready(), true);
        Ok(())
    }

    #[test]
    fn ready_future_is_ready() -> Result<()> {
        let future: TaskFuture<i32> = make_ready_future(42);
        crate::ensure_eq!(future.is_ready(), true);
        Ok(())
    }

    #[test]
    fn exceptional_future_is_ready() -> Result<()> {
        let future: TaskFuture<i32> = make_exceptional_future(Fail::new(libc::EINVAL, "nope"));
        crate::ensure_eq!(future.is_ready(), true);
        Ok(())
    }
}
