// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Continuation combinators over [TaskFuture]s.
//!
//! A continuation holds strong references to its input states (the futures it
//! was given) while each input state only holds the continuation's wake
//! handle, so no reference cycle forms. The last input to transition wakes
//! the continuation coroutine, which then runs at most once.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    future::{
        make_ready_future,
        Promise,
        TaskFuture,
    },
    runtime::{
        fail::Fail,
        scheduler::Yielder,
        SharedTaskRuntime,
    },
};
use ::futures::{
    future::FusedFuture,
    FutureExt,
};
use ::std::pin::Pin;

//======================================================================================================================
// Enumerations
//======================================================================================================================

/// Execution context selected when a continuation is attached: `Sync` runs
/// the continuation inline when its input is already ready, `Task` always
/// schedules it as a coroutine in the task pool.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Launch {
    Sync,
    Task,
}

//======================================================================================================================
// Structures
//======================================================================================================================

/// Result of [when_any]: the index of the first input observed ready, plus
/// all input futures for further processing.
pub struct WhenAnyResult<T> {
    pub index: usize,
    pub futures: Vec<TaskFuture<T>>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl<T: 'static> TaskFuture<T> {
    /// Attaches a continuation to this future. `f` is invoked exactly once
    /// with the ready input future; the returned future represents its
    /// result. With [Launch::Sync] and a ready input, `f` runs inline.
    pub fn then<R: 'static, F>(
        self,
        runtime: &mut SharedTaskRuntime,
        launch: Launch,
        f: F,
    ) -> Result<TaskFuture<R>, Fail>
    where
        F: FnOnce(TaskFuture<T>) -> R + 'static,
    {
        if !self.has_state() {
            let cause: &str = "then(): no associated shared state";
            error!("{}", cause);
            return Err(Fail::new(libc::ENXIO, cause));
        }

        if launch == Launch::Sync && self.is_ready() {
            return Ok(make_ready_future(f(self)));
        }

        let mut promise: Promise<R> = Promise::new();
        let output: TaskFuture<R> = promise.get_future()?;
        let mut input: TaskFuture<T> = self;
        let coroutine: Pin<Box<dyn FusedFuture<Output = ()>>> = Box::pin(
            async move {
                let yielder: Yielder = Yielder::new();
                match input.wait_ready(&yielder).await {
                    Ok(()) => {
                        if promise.set_value(f(input)).is_err() {
                            warn!("then(): continuation output was already satisfied");
                        }
                    },
                    Err(e) => {
                        let _ = promise.set_error(e);
                    },
                }
            }
            .fuse(),
        );
        runtime.insert_coroutine("continuation", coroutine)?;
        Ok(output)
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Returns a future that completes once every input future is ready. The
/// inputs are handed back, each holding its own outcome.
pub fn when_all<T: 'static>(
    runtime: &mut SharedTaskRuntime,
    futures_in: Vec<TaskFuture<T>>,
) -> Result<TaskFuture<Vec<TaskFuture<T>>>, Fail> {
    if futures_in.iter().all(|f| f.is_ready()) {
        return Ok(make_ready_future(futures_in));
    }

    let mut promise: Promise<Vec<TaskFuture<T>>> = Promise::new();
    let output: TaskFuture<Vec<TaskFuture<T>>> = promise.get_future()?;
    let mut futures_in: Vec<TaskFuture<T>> = futures_in;
    let coroutine: Pin<Box<dyn FusedFuture<Output = ()>>> = Box::pin(
        async move {
            let yielder: Yielder = Yielder::new();
            for future in futures_in.iter_mut() {
                if let Err(e) = future.wait_ready(&yielder).await {
                    let _ = promise.set_error(e);
                    return;
                }
            }
            if promise.set_value(futures_in).is_err() {
                warn!("when_all(): output was already satisfied");
            }
        }
        .fuse(),
    );
    runtime.insert_coroutine("when_all", coroutine)?;
    Ok(output)
}

/// Returns a future that completes once the first input future is ready.
pub fn when_any<T: 'static>(
    runtime: &mut SharedTaskRuntime,
    futures_in: Vec<TaskFuture<T>>,
) -> Result<TaskFuture<WhenAnyResult<T>>, Fail> {
    if futures_in.is_empty() {
        let cause: &str = "when_any(): no input futures";
        error!("{}", cause);
        return Err(Fail::new(libc::EINVAL, cause));
    }

    let mut promise: Promise<WhenAnyResult<T>> = Promise::new();
    let output: TaskFuture<WhenAnyResult<T>> = promise.get_future()?;
    let mut futures_in: Vec<TaskFuture<T>> = futures_in;
    let coroutine: Pin<Box<dyn FusedFuture<Output = ()>>> = Box::pin(
        async move {
            let yielder: Yielder = Yielder::new();
            loop {
                if let Some(index) = futures_in.iter().position(|f| f.is_ready()) {
                    if promise
                        .set_value(WhenAnyResult {
                            index,
                            futures: futures_in,
                        })
                        .is_err()
                    {
                        warn!("when_any(): output was already satisfied");
                    }
                    return;
                }
                for future in futures_in.iter_mut() {
                    if future.register_waiter(yielder.get_handle()).is_err() {
                        let _ = promise.set_error(Fail::new(libc::ENXIO, "when_any(): input without state"));
                        return;
                    }
                }
                if let Err(e) = yielder.yield_until_wake().await {
                    let _ = promise.set_error(e);
                    return;
                }
            }
        }
        .fuse(),
    );
    runtime.insert_coroutine("when_any", coroutine)?;
    Ok(output)
}

/// Invokes `f` exactly once, after every input future is ready, without
/// materialising an intermediate future of futures. `f` receives the ready
/// inputs and can observe each branch's outcome.
pub fn dataflow<T: 'static, R: 'static, F>(
    runtime: &mut SharedTaskRuntime,
    f: F,
    futures_in: Vec<TaskFuture<T>>,
) -> Result<TaskFuture<R>, Fail>
where
    F: FnOnce(Vec<TaskFuture<T>>) -> R + 'static,
{
    let mut promise: Promise<R> = Promise::new();
    let output: TaskFuture<R> = promise.get_future()?;
    let mut futures_in: Vec<TaskFuture<T>> = futures_in;
    let coroutine: Pin<Box<dyn FusedFuture<Output = ()>>> = Box::pin(
        async move {
            let yielder: Yielder = Yielder::new();
            for future in futures_in.iter_mut() {
                if let Err(e) = future.wait_ready(&yielder).await {
                    let _ = promise.set_error(e);
                    return;
                }
            }
            if promise.set_value(f(futures_in)).is_err() {
                warn!("dataflow(): output was already satisfied");
            }
        }
        .fuse(),
    );
    runtime.insert_coroutine("dataflow", coroutine)?;
    Ok(output)
}
