// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use ::futures::future::FusedFuture;
use ::std::{
    any::Any,
    future::Future,
    pin::Pin,
    task::{
        Context,
        Poll,
    },
};

//==============================================================================
// Traits
//==============================================================================

/// Task runs a single coroutine to completion and stores the result for
/// later. Thus, it implements Future but never directly returns anything.
pub trait Task: FusedFuture<Output = ()> + Unpin + Any {
    fn get_name(&self) -> String;
    fn as_any(self: Box<Self>) -> Box<dyn Any>;
}

//==============================================================================
// Structures
//==============================================================================

/// A specific instance of Task that stores a result of type `R`.
pub struct TaskWithResult<R: Unpin + Clone + Any> {
    /// Task name. Callers use this to identify the kind of task.
    name: String,
    /// Underlying coroutine to run.
    coroutine: Pin<Box<dyn FusedFuture<Output = R>>>,
    /// Output value of the underlying coroutine.
    result: Option<R>,
}

//==============================================================================
// Associate Functions
//==============================================================================

impl<R: Unpin + Clone + Any> TaskWithResult<R> {
    /// Instantiates a new task.
    pub fn new(name: String, coroutine: Pin<Box<dyn FusedFuture<Output = R>>>) -> Self {
        Self {
            name,
            coroutine,
            result: None,
        }
    }

    /// Returns the result of the coroutine once it completes. Returns None if
    /// the coroutine is still running.
    pub fn get_result(&self) -> Option<R> {
        self.result.clone()
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

impl<R: Unpin + Clone + Any> Task for TaskWithResult<R> {
    fn get_name(&self) -> String {
        self.name.clone()
    }

    fn as_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

impl<R: Unpin + Clone + Any> TryFrom<Box<dyn Any>> for TaskWithResult<R> {
    type Error = Box<dyn Any>;

    fn try_from(value: Box<dyn Any>) -> Result<Self, Self::Error> {
        match value.downcast::<Self>() {
            Ok(ptr) => Ok(*ptr),
            Err(e) => Err(e),
        }
    }
}

impl<R: Unpin + Clone + Any> Future for TaskWithResult<R> {
    type Output = ();

    /// Polls the coroutine.
    fn poll(self: Pin<&mut Self>, ctx: &mut Context) -> Poll<()> {
        let self_: &mut Self = self.get_mut();
        if self_.result.is_some() {
            debug!("poll(): task polled after completion");
            return Poll::Ready(());
        }
        let result: R = match Future::poll(self_.coroutine.as_mut(), ctx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(r) => r,
        };
        self_.result = Some(result);
        Poll::Ready(())
    }
}

impl<R: Unpin + Clone + Any> FusedFuture for TaskWithResult<R> {
    fn is_terminated(&self) -> bool {
        self.result.is_some()
    }
}
