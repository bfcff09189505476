// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    fail::Fail,
    scheduler::{
        Yielder,
        YielderHandle,
    },
    SharedObject,
};
use ::std::ops::{
    Deref,
    DerefMut,
};

//======================================================================================================================
// Enumerations
//======================================================================================================================

/// Outcome slot of a shared state. At most one transition leaves `Empty`;
/// every later read observes that same outcome. `Retrieved` marks a value
/// that was moved out through a unique future.
enum ResultCell<T> {
    Empty,
    Value(T),
    Error(Fail),
    Cancelled,
    Retrieved,
}

//======================================================================================================================
// Structures
//======================================================================================================================

/// Single-assignment value cell with waiters. Jointly owned by every future,
/// promise and continuation that refers to it; waiters registered while the
/// cell is empty are woken when the cell transitions.
pub struct FutureState<T> {
    cell: ResultCell<T>,
    waiters: Vec<YielderHandle>,
}

pub struct SharedFutureState<T>(SharedObject<FutureState<T>>);

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl<T> SharedFutureState<T> {
    pub fn new() -> Self {
        Self(SharedObject::new(FutureState {
            cell: ResultCell::Empty,
            waiters: Vec::new(),
        }))
    }

    /// Stores a value. Fails with `EEXIST` if the state was already
    /// satisfied.
    pub fn set_value(&mut self, value: T) -> Result<(), Fail> {
        if !matches!(self.cell, ResultCell::Empty) {
            let cause: &str = "shared state is already satisfied";
            error!("set_value(): {}", cause);
            return Err(Fail::new(libc::EEXIST, cause));
        }
        self.cell = ResultCell::Value(value);
        self.wake_waiters();
        Ok(())
    }

    /// Stores an error. Fails with `EEXIST` if the state was already
    /// satisfied.
    pub fn set_error(&mut self, error: Fail) -> Result<(), Fail> {
        if !matches!(self.cell, ResultCell::Empty) {
            let cause: &str = "shared state is already satisfied";
            error!("set_error(): {}", cause);
            return Err(Fail::new(libc::EEXIST, cause));
        }
        self.cell = ResultCell::Error(error);
        self.wake_waiters();
        Ok(())
    }

    /// Moves the state to cancelled if it is still empty. Idempotent.
    pub fn cancel(&mut self) {
        if matches!(self.cell, ResultCell::Empty) {
            self.cell = ResultCell::Cancelled;
            self.wake_waiters();
        }
    }

    /// Whether the state holds an outcome.
    pub fn is_ready(&self) -> bool {
        !matches!(self.cell, ResultCell::Empty)
    }

    /// Registers a waiter to be woken on the next transition. Must only be
    /// called while the state is empty.
    pub fn add_waiter(&mut self, waiter: YielderHandle) {
        debug_assert!(!self.is_ready());
        self.waiters.push(waiter);
    }

    /// Suspends the current task until the state holds an outcome.
    pub async fn wait_ready(&mut self, yielder: &Yielder) -> Result<(), Fail> {
        while !self.is_ready() {
            self.add_waiter(yielder.get_handle());
            yielder.yield_until_wake().await?;
        }
        Ok(())
    }

    /// Moves the outcome out of the state. Errors remain stored so that every
    /// subsequent read observes the same outcome.
    pub fn take_result(&mut self) -> Result<T, Fail> {
        match std::mem::replace(&mut self.cell, ResultCell::Retrieved) {
            ResultCell::Value(value) => Ok(value),
            ResultCell::Error(e) => {
                self.cell = ResultCell::Error(e.clone());
                Err(e)
            },
            ResultCell::Cancelled => {
                self.cell = ResultCell::Cancelled;
                Err(Fail::new(libc::ECANCELED, "shared state was cancelled"))
            },
            ResultCell::Empty => {
                self.cell = ResultCell::Empty;
                let cause: &str = "shared state is not ready";
                error!("take_result(): {}", cause);
                Err(Fail::new(libc::EAGAIN, cause))
            },
            ResultCell::Retrieved => {
                let cause: &str = "value was already retrieved";
                error!("take_result(): {}", cause);
                Err(Fail::new(libc::ENXIO, cause))
            },
        }
    }

    /// Number of live references to this state (futures, promises,
    /// continuations, registry entries).
    pub fn reference_count(&self) -> usize {
        self.0.reference_count()
    }

    fn wake_waiters(&mut self) {
        for mut waiter in self.waiters.drain(..) {
            waiter.wake_with(Ok(()));
        }
    }
}

impl<T: Clone> SharedFutureState<T> {
    /// Reads the outcome without consuming it.
    pub fn clone_result(&self) -> Result<T, Fail> {
        match &self.cell {
            ResultCell::Value(value) => Ok(value.clone()),
            ResultCell::Error(e) => Err(e.clone()),
            ResultCell::Cancelled => Err(Fail::new(libc::ECANCELED, "shared state was cancelled")),
            ResultCell::Empty => Err(Fail::new(libc::EAGAIN, "shared state is not ready")),
            ResultCell::Retrieved => Err(Fail::new(libc::ENXIO, "value was already retrieved")),
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl<T> Clone for SharedFutureState<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T> Default for SharedFutureState<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Deref for SharedFutureState<T> {
    type Target = FutureState<T>;

    fn deref(&self) -> &Self::Target {
        self.0.deref()
    }
}

impl<T> DerefMut for SharedFutureState<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.0.deref_mut()
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::SharedFutureState;
    use ::anyhow::Result;
    use crate::runtime::fail::Fail;

    /// The number of value/error transitions out of `Empty` is at most one.
    #[test]
    fn second_transition_fails() -> Result<()> {
        let mut state: SharedFutureState<i32> = SharedFutureState::new();
        crate::ensure_eq!(state.set_value(1).is_ok(), true);
        let e: Fail = state.set_value(2).unwrap_err();
        crate::ensure_eq!(e.errno, libc::EEXIST);
        let e: Fail = state.set_error(Fail::new(libc::EIO, "nope")).unwrap_err();
        crate::ensure_eq!(e.errno, libc::EEXIST);
        Ok(())
    }

    #[test]
    fn error_outcome_is_sticky() -> Result<()> {
        let mut state: SharedFutureState<i32> = SharedFutureState::new();
        state.set_error(Fail::new(libc::EIO, "producer failed")).unwrap();
        let e: Fail = state.take_result().unwrap_err();
        crate::ensure_eq!(e.errno, libc::EIO);
        // A second read observes the same outcome.
        let e: Fail = state.take_result().unwrap_err();
        crate::ensure_eq!(e.errno, libc::EIO);
        Ok(())
    }

    #[test]
    fn cancel_is_idempotent_and_sticky() -> Result<()> {
        let mut state: SharedFutureState<i32> = SharedFutureState::new();
        state.cancel();
        state.cancel();
        let e: Fail = state.take_result().unwrap_err();
        crate::ensure_eq!(e.errno, libc::ECANCELED);
        Ok(())
    }

    #[test]
    fn cancel_after_value_is_a_no_op() -> Result<()> {
        let mut state: SharedFutureState<i32> = SharedFutureState::new();
        state.set_value(7).unwrap();
        state.cancel();
        crate::ensure_eq!(state.take_result()?, 7);
        Ok(())
    }
}
