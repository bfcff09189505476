// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use crate::runtime::scheduler::{
    page::WakerPageRef,
    waker64::WAKER_BIT_LENGTH,
};
use ::std::hash::{
    Hash,
    Hasher,
};

//==============================================================================
// Structures
//==============================================================================

/// Task Handle
///
/// Uniquely identifies a task in the scheduler. Used to check on the status of
/// the task and to remove it once it has completed.
#[derive(Clone)]
pub struct TaskHandle {
    /// External identifying token.
    task_id: u64,
    /// Corresponding location in the scheduler's task storage.
    index: usize,
    /// Waker page in which the task's status lives.
    chunk: WakerPageRef,
}

//==============================================================================
// Associate Functions
//==============================================================================

impl TaskHandle {
    /// Creates a new task handle.
    pub(crate) fn new(task_id: u64, index: usize, waker_page: WakerPageRef) -> Self {
        Self {
            index,
            task_id,
            chunk: waker_page,
        }
    }

    /// Queries whether the task associated with the target handle has run to
    /// completion.
    pub fn has_completed(&self) -> bool {
        let subpage_ix: usize = self.index & (WAKER_BIT_LENGTH - 1);
        self.chunk.has_completed(subpage_ix)
    }

    /// Returns the raw identifier stored in the target handle.
    pub fn get_task_id(&self) -> u64 {
        self.task_id
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

impl Hash for TaskHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.task_id.hash(state);
    }
}

impl PartialEq for TaskHandle {
    fn eq(&self, other: &Self) -> bool {
        self.task_id == other.task_id
    }
}

impl Eq for TaskHandle {}
