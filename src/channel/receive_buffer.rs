// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    future::{
        SharedFutureState,
        TaskFuture,
    },
    runtime::fail::Fail,
};
use ::std::collections::BTreeMap;

//======================================================================================================================
// Structures
//======================================================================================================================

/// One outstanding generation. Created by whichever side arrives first and
/// destroyed once both sides have visited it.
struct BufferEntry<T> {
    state: SharedFutureState<T>,
    consumer_seen: bool,
    producer_seen: bool,
}

/// Maps generation indices to shared states so that set and get operations on
/// the same generation rendezvous regardless of arrival order.
pub struct ReceiveBuffer<T> {
    entries: BTreeMap<u64, BufferEntry<T>>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl<T> BufferEntry<T> {
    fn new() -> Self {
        Self {
            state: SharedFutureState::new(),
            consumer_seen: false,
            producer_seen: false,
        }
    }
}

impl<T> ReceiveBuffer<T> {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Whether any generation is outstanding.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the future for `generation`, creating the entry if the
    /// consumer arrives first.
    pub fn receive(&mut self, generation: u64) -> TaskFuture<T> {
        let entry: &mut BufferEntry<T> = self.entries.entry(generation).or_insert_with(BufferEntry::new);
        entry.consumer_seen = true;
        let future: TaskFuture<T> = TaskFuture::from_state(entry.state.clone());
        if entry.producer_seen {
            // Both sides have visited this generation.
            self.entries.remove(&generation);
        }
        future
    }

    /// Returns the future for `generation` only if its value has already
    /// arrived.
    pub fn try_receive(&mut self, generation: u64) -> Option<TaskFuture<T>> {
        match self.entries.get(&generation) {
            Some(entry) if entry.producer_seen => Some(self.receive(generation)),
            _ => None,
        }
    }

    /// Associates `value` with `generation`, creating the entry if the
    /// producer arrives first.
    pub fn store_received(&mut self, generation: u64, value: T) -> Result<(), Fail> {
        let entry: &mut BufferEntry<T> = self.entries.entry(generation).or_insert_with(BufferEntry::new);
        entry.state.set_value(value)?;
        entry.producer_seen = true;
        if entry.consumer_seen {
            self.entries.remove(&generation);
        }
        Ok(())
    }

    /// Resolves every generation still waiting for its value with `error` and
    /// drops those entries. Generations whose value already arrived are kept
    /// so that late consumers can still fetch them.
    pub fn cancel_waiting(&mut self, error: Fail) {
        let waiting: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, entry)| !entry.producer_seen)
            .map(|(generation, _)| *generation)
            .collect();
        for generation in waiting {
            if let Some(mut entry) = self.entries.remove(&generation) {
                let _ = entry.state.set_error(error.clone());
            }
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl<T> Default for ReceiveBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::ReceiveBuffer;
    use crate::future::TaskFuture;
    use ::anyhow::Result;

    /// Set then get on the same generation rendezvous.
    #[test]
    fn producer_first() -> Result<()> {
        let mut buffer: ReceiveBuffer<i32> = ReceiveBuffer::new();
        buffer.store_received(1, 42)?;
        let future: TaskFuture<i32> = buffer.receive(1);
        crate::ensure_eq!(future.is_ready(), true);
        // Both sides visited; the entry is gone.
        crate::ensure_eq!(buffer.is_empty(), true);
        Ok(())
    }

    /// Get then set on the same generation rendezvous.
    #[test]
    fn consumer_first() -> Result<()> {
        let mut buffer: ReceiveBuffer<i32> = ReceiveBuffer::new();
        let future: TaskFuture<i32> = buffer.receive(1);
        crate::ensure_eq!(future.is_ready(), false);
        buffer.store_received(1, 42)?;
        crate::ensure_eq!(future.is_ready(), true);
        crate::ensure_eq!(buffer.is_empty(), true);
        Ok(())
    }

    #[test]
    fn try_receive_requires_value() -> Result<()> {
        let mut buffer: ReceiveBuffer<i32> = ReceiveBuffer::new();
        crate::ensure_eq!(buffer.try_receive(1).is_none(), true);
        buffer.store_received(1, 7)?;
        crate::ensure_eq!(buffer.try_receive(1).is_some(), true);
        Ok(())
    }

    #[test]
    fn cancel_waiting_keeps_stored_values() -> Result<()> {
        let mut buffer: ReceiveBuffer<i32> = ReceiveBuffer::new();
        let waiting: TaskFuture<i32> = buffer.receive(1);
        buffer.store_received(2, 7)?;
        buffer.cancel_waiting(crate::runtime::fail::Fail::new(libc::ECANCELED, "cancelled"));
        crate::ensure_eq!(waiting.is_ready(), true);
        // The stored value for generation 2 survives.
        crate::ensure_eq!(buffer.try_receive(2).is_some(), true);
        Ok(())
    }
}
