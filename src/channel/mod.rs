// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Generation-indexed rendezvous channel.
//!
//! Each send and each receive carries a generation ordinal (or the sentinel,
//! which selects the next one); operations on the same generation rendezvous
//! through a [ReceiveBuffer] entry regardless of arrival order. Closing the
//! channel resolves every unsatisfiable pending receive with a cancellation.

mod receive_buffer;

pub use self::receive_buffer::ReceiveBuffer;

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    future::{
        make_exceptional_future,
        TaskFuture,
    },
    runtime::{
        fail::Fail,
        scheduler::Yielder,
        SharedObject,
    },
    sync::McsLock,
    AUTO_GENERATION,
};

//======================================================================================================================
// Structures
//======================================================================================================================

struct ChannelState<T> {
    /// Rendezvous buffer, generation -> shared state.
    buffer: ReceiveBuffer<T>,
    /// Serialises buffer and counter access. Critical sections never suspend.
    lock: McsLock,
    /// Ordinal of the most recent receive.
    get_generation: u64,
    /// Ordinal of the most recent send.
    set_generation: u64,
    closed: bool,
}

/// Reference-counted channel handle exposing both halves of the interface.
pub struct Channel<T>(SharedObject<ChannelState<T>>);

/// Send-only view over a channel.
pub struct SendChannel<T>(Channel<T>);

/// Receive-only view over a channel.
pub struct ReceiveChannel<T>(Channel<T>);

/// Iteration over a channel: repeatedly takes the next generation until the
/// channel is closed and drained.
pub struct ChannelIter<T> {
    channel: Channel<T>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl<T> Channel<T> {
    pub fn new() -> Self {
        Self(SharedObject::new(ChannelState {
            buffer: ReceiveBuffer::new(),
            lock: McsLock::new(),
            get_generation: 0,
            set_generation: 0,
            closed: false,
        }))
    }

    /// Associates `value` with `generation` (sentinel: next send ordinal).
    /// Fails with `EINVAL` if the channel is closed.
    pub fn set(&mut self, value: T, generation: u64) -> Result<(), Fail> {
        let state: &mut ChannelState<T> = self.0.as_mut();
        let _guard = state.lock.acquire_spin();

        if state.closed {
            let cause: &str = "attempting to write to a closed channel";
            error!("set(): {}", cause);
            return Err(Fail::new(libc::EINVAL, cause));
        }

        state.set_generation += 1;
        let generation: u64 = if generation == AUTO_GENERATION {
            state.set_generation
        } else {
            generation
        };

        state.buffer.store_received(generation, value)
    }

    /// Returns the future for `generation` (sentinel: next receive ordinal).
    /// If the channel is closed and the requested value never arrived, the
    /// returned future resolves to `EINVAL`.
    pub fn get(&mut self, generation: u64) -> TaskFuture<T> {
        self.do_get(generation, false)
    }

    /// Non-suspending variant: returns None when the channel is closed and
    /// drained.
    pub fn try_get(&mut self, generation: u64) -> Option<TaskFuture<T>> {
        let state: &mut ChannelState<T> = self.0.as_mut();
        let _guard = state.lock.acquire_spin();

        if state.buffer.is_empty() && state.closed {
            return None;
        }

        state.get_generation += 1;
        let generation: u64 = if generation == AUTO_GENERATION {
            state.get_generation
        } else {
            generation
        };

        Some(state.buffer.receive(generation))
    }

    /// Blocking variant of [Self::get]. Additionally fails with `EINVAL` when
    /// the channel is empty and this handle is the only reference to it: no
    /// other party can ever set a value, so waiting would deadlock.
    pub async fn get_sync(&mut self, generation: u64, yielder: &Yielder) -> Result<T, Fail> {
        let future: TaskFuture<T> = self.do_get(generation, true);
        future.get(yielder).await
    }

    /// Marks the channel closed. Pending receives whose generation can never
    /// be satisfied resolve to `ECANCELED`. Closing an already-closed channel
    /// is an error.
    pub fn close(&mut self) -> Result<(), Fail> {
        let state: &mut ChannelState<T> = self.0.as_mut();
        let _guard = state.lock.acquire_spin();

        if state.closed {
            let cause: &str = "attempting to close an already closed channel";
            error!("close(): {}", cause);
            return Err(Fail::new(libc::EINVAL, cause));
        }

        state.closed = true;

        if state.buffer.is_empty() {
            return Ok(());
        }

        // All pending requests which can't be satisfied have to be canceled
        // at this point.
        state
            .buffer
            .cancel_waiting(Fail::new(libc::ECANCELED, "canceled waiting on this entry"));
        Ok(())
    }

    /// Iteration over successive generations.
    pub fn iter(&self) -> ChannelIter<T> {
        ChannelIter {
            channel: self.clone(),
        }
    }

    /// Number of live handles to the channel, views included.
    pub fn reference_count(&self) -> usize {
        self.0.reference_count()
    }

    fn do_get(&mut self, generation: u64, blocking: bool) -> TaskFuture<T> {
        let reference_count: usize = self.0.reference_count();
        let state: &mut ChannelState<T> = self.0.as_mut();
        let _guard = state.lock.acquire_spin();

        if state.buffer.is_empty() {
            if state.closed {
                let cause: &str = "channel is empty and was closed";
                return make_exceptional_future(Fail::new(libc::EINVAL, cause));
            }

            if blocking && reference_count == 1 {
                let cause: &str = "channel is empty and not accessible by any other task, would deadlock";
                error!("get_sync(): {}", cause);
                return make_exceptional_future(Fail::new(libc::EINVAL, cause));
            }
        }

        state.get_generation += 1;
        let generation: u64 = if generation == AUTO_GENERATION {
            state.get_generation
        } else {
            generation
        };

        if state.closed {
            // The requested item must already be available, otherwise this
            // would wait forever.
            match state.buffer.try_receive(generation) {
                Some(future) => future,
                None => {
                    let cause: &str = "channel is closed and the requested value has not been received";
                    make_exceptional_future(Fail::new(libc::EINVAL, cause))
                },
            }
        } else {
            state.buffer.receive(generation)
        }
    }
}

impl<T> SendChannel<T> {
    pub fn set(&mut self, value: T, generation: u64) -> Result<(), Fail> {
        self.0.set(value, generation)
    }

    pub fn close(&mut self) -> Result<(), Fail> {
        self.0.close()
    }
}

impl<T> ReceiveChannel<T> {
    pub fn get(&mut self, generation: u64) -> TaskFuture<T> {
        self.0.get(generation)
    }

    pub fn try_get(&mut self, generation: u64) -> Option<TaskFuture<T>> {
        self.0.try_get(generation)
    }

    pub async fn get_sync(&mut self, generation: u64, yielder: &Yielder) -> Result<T, Fail> {
        self.0.get_sync(generation, yielder).await
    }

    pub fn iter(&self) -> ChannelIter<T> {
        self.0.iter()
    }
}

impl<T> ChannelIter<T> {
    /// Takes the next value off the channel, suspending until it arrives.
    /// Returns None once the channel is closed and drained.
    pub async fn next(&mut self, yielder: &Yielder) -> Option<Result<T, Fail>> {
        match self.channel.try_get(AUTO_GENERATION) {
            Some(future) => Some(future.get(yielder).await),
            None => None,
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl<T> Default for Channel<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T> From<&Channel<T>> for SendChannel<T> {
    fn from(channel: &Channel<T>) -> Self {
        Self(channel.clone())
    }
}

impl<T> From<&Channel<T>> for ReceiveChannel<T> {
    fn from(channel: &Channel<T>) -> Self {
        Self(channel.clone())
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::Channel;
    use crate::{
        future::TaskFuture,
        runtime::fail::Fail,
        AUTO_GENERATION,
    };
    use ::anyhow::Result;

    #[test]
    fn set_then_get_rendezvous() -> Result<()> {
        let mut channel: Channel<i32> = Channel::new();
        channel.set(42, AUTO_GENERATION)?;
        let future: TaskFuture<i32> = channel.get(AUTO_GENERATION);
        crate::ensure_eq!(future.is_ready(), true);
        Ok(())
    }

    #[test]
    fn get_then_set_rendezvous() -> Result<()> {
        let mut channel: Channel<i32> = Channel::new();
        let future: TaskFuture<i32> = channel.get(AUTO_GENERATION);
        crate::ensure_eq!(future.is_ready(), false);
        channel.set(42, AUTO_GENERATION)?;
        crate::ensure_eq!(future.is_ready(), true);
        Ok(())
    }

    #[test]
    fn set_on_closed_channel_fails() -> Result<()> {
        let mut channel: Channel<i32> = Channel::new();
        channel.close()?;
        let e: Fail = channel.set(1, AUTO_GENERATION).unwrap_err();
        crate::ensure_eq!(e.errno, libc::EINVAL);
        Ok(())
    }

    /// Closing an already-closed channel raises `EINVAL`; close is not
    /// idempotent by design.
    #[test]
    fn double_close_fails() -> Result<()> {
        let mut channel: Channel<i32> = Channel::new();
        channel.close()?;
        let e: Fail = channel.close().unwrap_err();
        crate::ensure_eq!(e.errno, libc::EINVAL);
        Ok(())
    }

    #[test]
    fn close_cancels_pending_get() -> Result<()> {
        let mut channel: Channel<i32> = Channel::new();
        let future: TaskFuture<i32> = channel.get(AUTO_GENERATION);
        channel.close()?;
        crate::ensure_eq!(future.is_ready(), true);
        Ok(())
    }

    #[test]
    fn try_get_on_closed_and_drained_channel_returns_none() -> Result<()> {
        let mut channel: Channel<i32> = Channel::new();
        channel.set(1, AUTO_GENERATION)?;
        channel.close()?;
        crate::ensure_eq!(channel.try_get(AUTO_GENERATION).is_some(), true);
        crate::ensure_eq!(channel.try_get(AUTO_GENERATION).is_none(), true);
        Ok(())
    }

    #[test]
    fn get_missing_generation_on_closed_channel_is_exceptional() -> Result<()> {
        let mut channel: Channel<i32> = Channel::new();
        channel.set('a' as i32, 1)?;
        channel.close()?;
        let future: TaskFuture<i32> = channel.get(4);
        crate::ensure_eq!(future.is_ready(), true);
        Ok(())
    }
}
