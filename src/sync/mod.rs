// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

mod condition_variable;
mod mcs_lock;

//==============================================================================
// Exports
//==============================================================================

pub use self::{
    condition_variable::{
        SharedConditionVariable,
        WaitStatus,
        WakePriority,
    },
    mcs_lock::{
        McsGuard,
        McsLock,
    },
};
