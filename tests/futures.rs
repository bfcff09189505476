// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use ::anyhow::Result;
use ::futures::{
    future::FusedFuture,
    FutureExt,
};
use ::std::{
    cell::RefCell,
    pin::Pin,
    rc::Rc,
};
use ::taskfabric::{
    ensure_eq,
    future::{
        dataflow,
        when_all,
        when_any,
        Launch,
        Promise,
        SharedTaskFuture,
        TaskFuture,
        WhenAnyResult,
    },
    runtime::config::Config,
    Fail,
    SharedTaskRuntime,
    Yielder,
};

//==============================================================================
// Helpers
//==============================================================================

fn runtime() -> SharedTaskRuntime {
    SharedTaskRuntime::new(Config::default())
}

type Coroutine<R> = Pin<Box<dyn FusedFuture<Output = R>>>;

//==============================================================================
// Unit Tests
//==============================================================================

/// A future attached to an already-satisfied state observes the value.
#[test]
fn test_get_on_ready_future() -> Result<()> {
    let mut rt: SharedTaskRuntime = runtime();
    let mut promise: Promise<i32> = Promise::new();
    let future: TaskFuture<i32> = promise.get_future()?;
    promise.set_value(42)?;

    let coroutine: Coroutine<Result<i32, Fail>> = Box::pin(
        async move {
            let yielder: Yielder = Yielder::new();
            future.get(&yielder).await
        }
        .fuse(),
    );
    let handle = rt.insert_coroutine("get", coroutine)?;
    let value: Result<i32, Fail> = rt.run_until_complete(&handle, 100)?;
    ensure_eq!(value?, 42);
    Ok(())
}

/// `get` suspends until the promise transitions the state.
#[test]
fn test_get_suspends_until_set() -> Result<()> {
    let mut rt: SharedTaskRuntime = runtime();
    let mut promise: Promise<i32> = Promise::new();
    let future: TaskFuture<i32> = promise.get_future()?;

    let coroutine: Coroutine<Result<i32, Fail>> = Box::pin(
        async move {
            let yielder: Yielder = Yielder::new();
            future.get(&yielder).await
        }
        .fuse(),
    );
    let handle = rt.insert_coroutine("get", coroutine)?;

    // The consumer cannot make progress before the producer runs.
    for _ in 0..10 {
        rt.poll();
    }
    ensure_eq!(handle.has_completed(), false);

    promise.set_value(7)?;
    let value: Result<i32, Fail> = rt.run_until_complete(&handle, 100)?;
    ensure_eq!(value?, 7);
    Ok(())
}

/// An abandoned promise surfaces a broken-promise error to its consumer.
#[test]
fn test_broken_promise_surfaces_epipe() -> Result<()> {
    let mut rt: SharedTaskRuntime = runtime();
    let mut promise: Promise<i32> = Promise::new();
    let future: TaskFuture<i32> = promise.get_future()?;
    drop(promise);

    let coroutine: Coroutine<Result<i32, Fail>> = Box::pin(
        async move {
            let yielder: Yielder = Yielder::new();
            future.get(&yielder).await
        }
        .fuse(),
    );
    let handle = rt.insert_coroutine("get", coroutine)?;
    let value: Result<i32, Fail> = rt.run_until_complete(&handle, 100)?;
    ensure_eq!(value.unwrap_err().errno, libc::EPIPE);
    Ok(())
}

/// A continuation attached with `Launch::Sync` to a ready input runs inline.
#[test]
fn test_then_sync_on_ready_input_runs_inline() -> Result<()> {
    let mut rt: SharedTaskRuntime = runtime();
    let mut promise: Promise<i32> = Promise::new();
    let future: TaskFuture<i32> = promise.get_future()?;
    promise.set_value(20)?;

    let output: TaskFuture<i32> = future.then(&mut rt, Launch::Sync, |_input| 21)?;
    ensure_eq!(output.is_ready(), true);
    Ok(())
}

/// A continuation on a pending input runs exactly once, after the transition.
#[test]
fn test_then_task_fires_once_after_transition() -> Result<()> {
    let mut rt: SharedTaskRuntime = runtime();
    let mut promise: Promise<i32> = Promise::new();
    let future: TaskFuture<i32> = promise.get_future()?;

    let fired: Rc<RefCell<usize>> = Rc::new(RefCell::new(0));
    let fired2: Rc<RefCell<usize>> = fired.clone();
    let output: TaskFuture<usize> = future.then(&mut rt, Launch::Task, move |_input| {
        *fired2.borrow_mut() += 1;
        *fired2.borrow()
    })?;

    for _ in 0..10 {
        rt.poll();
    }
    ensure_eq!(*fired.borrow(), 0);

    promise.set_value(1)?;
    for _ in 0..10 {
        rt.poll();
    }
    ensure_eq!(*fired.borrow(), 1);
    ensure_eq!(output.is_ready(), true);
    Ok(())
}

/// `when_all(xs).then(f)` invokes `f` exactly once, after the last input.
#[test]
fn test_when_all_then_fires_after_last_input() -> Result<()> {
    let mut rt: SharedTaskRuntime = runtime();
    let mut p1: Promise<i32> = Promise::new();
    let mut p2: Promise<i32> = Promise::new();
    let futures: Vec<TaskFuture<i32>> = vec![p1.get_future()?, p2.get_future()?];

    let all: TaskFuture<Vec<TaskFuture<i32>>> = when_all(&mut rt, futures)?;
    let fired: Rc<RefCell<usize>> = Rc::new(RefCell::new(0));
    let fired2: Rc<RefCell<usize>> = fired.clone();
    let _output: TaskFuture<()> = all.then(&mut rt, Launch::Task, move |_inputs| {
        *fired2.borrow_mut() += 1;
    })?;

    p1.set_value(1)?;
    for _ in 0..10 {
        rt.poll();
    }
    ensure_eq!(*fired.borrow(), 0);

    p2.set_value(2)?;
    for _ in 0..10 {
        rt.poll();
    }
    ensure_eq!(*fired.borrow(), 1);
    Ok(())
}

/// `when_any` reports the index of the first ready input.
#[test]
fn test_when_any_reports_first_ready() -> Result<()> {
    let mut rt: SharedTaskRuntime = runtime();
    let mut p1: Promise<i32> = Promise::new();
    let mut p2: Promise<i32> = Promise::new();
    let futures: Vec<TaskFuture<i32>> = vec![p1.get_future()?, p2.get_future()?];

    let any: TaskFuture<WhenAnyResult<i32>> = when_any(&mut rt, futures)?;
    for _ in 0..5 {
        rt.poll();
    }
    ensure_eq!(any.is_ready(), false);

    p2.set_value(9)?;
    let coroutine: Coroutine<Result<usize, Fail>> = Box::pin(
        async move {
            let yielder: Yielder = Yielder::new();
            let result: WhenAnyResult<i32> = any.get(&yielder).await?;
            Ok(result.index)
        }
        .fuse(),
    );
    let handle = rt.insert_coroutine("collect", coroutine)?;
    let index: Result<usize, Fail> = rt.run_until_complete(&handle, 100)?;
    ensure_eq!(index?, 1);

    // p1 is still pending; setting it afterwards must succeed.
    p1.set_value(1)?;
    Ok(())
}

/// `dataflow` evaluates its function exactly once with all inputs ready.
#[test]
fn test_dataflow_unwraps_inputs() -> Result<()> {
    let mut rt: SharedTaskRuntime = runtime();
    let mut p1: Promise<i64> = Promise::new();
    let mut p2: Promise<i64> = Promise::new();
    let futures: Vec<TaskFuture<i64>> = vec![p1.get_future()?, p2.get_future()?];

    let output: TaskFuture<i64> = dataflow(
        &mut rt,
        |mut inputs: Vec<TaskFuture<i64>>| {
            let mut sum: i64 = 0;
            for input in inputs.drain(..) {
                // Inputs are ready by contract; a ready future resolves on
                // the first poll of get.
                assert!(input.is_ready());
                sum += 1;
            }
            sum
        },
        futures,
    )?;

    p1.set_value(17)?;
    p2.set_value(-5)?;
    let coroutine: Coroutine<Result<i64, Fail>> = Box::pin(
        async move {
            let yielder: Yielder = Yielder::new();
            output.get(&yielder).await
        }
        .fuse(),
    );
    let handle = rt.insert_coroutine("collect", coroutine)?;
    let value: Result<i64, Fail> = rt.run_until_complete(&handle, 100)?;
    ensure_eq!(value?, 2);
    Ok(())
}

/// A shared future may be read by multiple holders.
#[test]
fn test_shared_future_reads_twice() -> Result<()> {
    let mut rt: SharedTaskRuntime = runtime();
    let mut promise: Promise<String> = Promise::new();
    let shared: SharedTaskFuture<String> = promise.get_future()?.share()?;
    let mut first: SharedTaskFuture<String> = shared.clone();
    let mut second: SharedTaskFuture<String> = shared;

    promise.set_value(String::from("shared"))?;

    let coroutine: Coroutine<Result<(String, String), Fail>> = Box::pin(
        async move {
            let yielder: Yielder = Yielder::new();
            let a: String = first.get_clone(&yielder).await?;
            let b: String = second.get_clone(&yielder).await?;
            Ok((a, b))
        }
        .fuse(),
    );
    let handle = rt.insert_coroutine("collect", coroutine)?;
    let (a, b): (String, String) = rt.run_until_complete::<Result<(String, String), Fail>>(&handle, 100)??;
    ensure_eq!(a, "shared");
    ensure_eq!(b, "shared");
    Ok(())
}
