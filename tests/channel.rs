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
use ::std::pin::Pin;
use ::taskfabric::{
    channel::{
        Channel,
        ReceiveChannel,
        SendChannel,
    },
    ensure_eq,
    runtime::config::Config,
    Fail,
    SharedTaskRuntime,
    Yielder,
    AUTO_GENERATION,
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

/// A writer sets three generations and closes; an iterating reader sees
/// exactly the pre-close values in generation order, then terminates. A get
/// for a generation that never arrives resolves to an error.
#[test]
fn test_channel_rendezvous() -> Result<()> {
    let mut rt: SharedTaskRuntime = runtime();
    let channel: Channel<char> = Channel::new();
    let mut tx: SendChannel<char> = SendChannel::from(&channel);
    let rx: ReceiveChannel<char> = ReceiveChannel::from(&channel);

    let writer: Coroutine<Result<(), Fail>> = Box::pin(
        async move {
            for value in ['a', 'b', 'c'] {
                tx.set(value, AUTO_GENERATION)?;
            }
            tx.close()?;
            Ok(())
        }
        .fuse(),
    );
    let writer_handle = rt.insert_coroutine("writer", writer)?;

    let reader: Coroutine<Result<Vec<char>, Fail>> = Box::pin(
        async move {
            let yielder: Yielder = Yielder::new();
            let mut seen: Vec<char> = Vec::new();
            let mut iter = rx.iter();
            while let Some(item) = iter.next(&yielder).await {
                seen.push(item?);
            }
            Ok(seen)
        }
        .fuse(),
    );
    let reader_handle = rt.insert_coroutine("reader", reader)?;

    let seen: Result<Vec<char>, Fail> = rt.run_until_complete(&reader_handle, 1000)?;
    ensure_eq!(seen?, vec!['a', 'b', 'c']);
    let written: Result<(), Fail> = rt.run_until_complete(&writer_handle, 10)?;
    ensure_eq!(written.is_ok(), true);

    // A generation that was never set resolves exceptionally after close.
    let mut late: Channel<char> = channel.clone();
    let future = late.get(4);
    ensure_eq!(future.is_ready(), true);
    let collect: Coroutine<Result<char, Fail>> = Box::pin(
        async move {
            let yielder: Yielder = Yielder::new();
            future.get(&yielder).await
        }
        .fuse(),
    );
    let handle = rt.insert_coroutine("late", collect)?;
    let late_value: Result<char, Fail> = rt.run_until_complete(&handle, 100)?;
    ensure_eq!(late_value.unwrap_err().errno, libc::EINVAL);
    Ok(())
}

/// Exactly one consumer observes the value set for a generation.
#[test]
fn test_exactly_once_per_generation() -> Result<()> {
    let mut rt: SharedTaskRuntime = runtime();
    let mut channel: Channel<i32> = Channel::new();
    channel.set(5, 1)?;

    let first = channel.get(1);
    let second = channel.get(1);
    ensure_eq!(first.is_ready(), true);

    let collect: Coroutine<(Result<i32, Fail>, bool)> = Box::pin(
        async move {
            let yielder: Yielder = Yielder::new();
            let a: Result<i32, Fail> = first.get(&yielder).await;
            // The second future for the same generation never observes the
            // value; it rendezvouses with a hypothetical second set.
            (a, second.is_ready())
        }
        .fuse(),
    );
    let handle = rt.insert_coroutine("collect", collect)?;
    let (a, second_ready): (Result<i32, Fail>, bool) = rt.run_until_complete(&handle, 100)?;
    ensure_eq!(a?, 5);
    ensure_eq!(second_ready, false);
    Ok(())
}

/// A producer splits a slice in half and ships partial sums through one
/// channel; the consumer reduces two generations.
#[test]
fn test_sum_dispatch() -> Result<()> {
    let mut rt: SharedTaskRuntime = runtime();
    let input: Vec<i64> = vec![7, 2, 8, -9, 4, 0];
    let channel: Channel<i64> = Channel::new();

    let mut tx: SendChannel<i64> = SendChannel::from(&channel);
    let halves: (Vec<i64>, Vec<i64>) = {
        let mid: usize = input.len() / 2;
        (input[..mid].to_vec(), input[mid..].to_vec())
    };
    let producer: Coroutine<Result<(), Fail>> = Box::pin(
        async move {
            tx.set(halves.0.iter().sum(), AUTO_GENERATION)?;
            tx.set(halves.1.iter().sum(), AUTO_GENERATION)?;
            Ok(())
        }
        .fuse(),
    );
    rt.insert_coroutine("producer", producer)?;

    let mut rx: ReceiveChannel<i64> = ReceiveChannel::from(&channel);
    let consumer: Coroutine<Result<i64, Fail>> = Box::pin(
        async move {
            let yielder: Yielder = Yielder::new();
            let first: i64 = rx.get(AUTO_GENERATION).get(&yielder).await?;
            let second: i64 = rx.get(AUTO_GENERATION).get(&yielder).await?;
            Ok(first + second)
        }
        .fuse(),
    );
    let consumer_handle = rt.insert_coroutine("consumer", consumer)?;

    let total: Result<i64, Fail> = rt.run_until_complete(&consumer_handle, 1000)?;
    ensure_eq!(total?, input.iter().sum::<i64>());
    Ok(())
}

/// Ping-pong: a sender writes to P, a forwarder moves the message from P to
/// Q, the main task reads Q. All reads are synchronous (suspending).
#[test]
fn test_ping_pong_over_channels() -> Result<()> {
    let mut rt: SharedTaskRuntime = runtime();
    let p: Channel<String> = Channel::new();
    let q: Channel<String> = Channel::new();

    let mut p_tx: SendChannel<String> = SendChannel::from(&p);
    let sender: Coroutine<Result<(), Fail>> = Box::pin(
        async move {
            p_tx.set(String::from("passed message"), AUTO_GENERATION)?;
            Ok(())
        }
        .fuse(),
    );
    rt.insert_coroutine("sender", sender)?;

    let mut p_rx: ReceiveChannel<String> = ReceiveChannel::from(&p);
    let mut q_tx: SendChannel<String> = SendChannel::from(&q);
    let forwarder: Coroutine<Result<(), Fail>> = Box::pin(
        async move {
            let yielder: Yielder = Yielder::new();
            let message: String = p_rx.get_sync(AUTO_GENERATION, &yielder).await?;
            q_tx.set(message, AUTO_GENERATION)?;
            Ok(())
        }
        .fuse(),
    );
    rt.insert_coroutine("forwarder", forwarder)?;

    let mut q_rx: ReceiveChannel<String> = ReceiveChannel::from(&q);
    let main: Coroutine<Result<String, Fail>> = Box::pin(
        async move {
            let yielder: Yielder = Yielder::new();
            q_rx.get_sync(AUTO_GENERATION, &yielder).await
        }
        .fuse(),
    );
    let main_handle = rt.insert_coroutine("main", main)?;

    let message: Result<String, Fail> = rt.run_until_complete(&main_handle, 1000)?;
    ensure_eq!(message?, "passed message");
    Ok(())
}

/// A synchronous read on a channel nobody else references reports the
/// would-be deadlock instead of suspending forever.
#[test]
fn test_get_sync_detects_deadlock() -> Result<()> {
    let mut rt: SharedTaskRuntime = runtime();
    let channel: Channel<i32> = Channel::new();

    let mut sole: Channel<i32> = channel;
    let reader: Coroutine<Result<i32, Fail>> = Box::pin(
        async move {
            let yielder: Yielder = Yielder::new();
            sole.get_sync(AUTO_GENERATION, &yielder).await
        }
        .fuse(),
    );
    let handle = rt.insert_coroutine("reader", reader)?;
    let value: Result<i32, Fail> = rt.run_until_complete(&handle, 100)?;
    ensure_eq!(value.unwrap_err().errno, libc::EINVAL);
    Ok(())
}
