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
    collective::{
        broadcast_recv,
        broadcast_send,
        generate_locality_indices,
        install_broadcast_handlers,
        TAG_BROADCAST_DIRECT,
        TAG_BROADCAST_TREE,
    },
    ensure_eq,
    fabric::{
        LoopbackTransport,
        SharedParcelport,
    },
    naming::SharedSymbolNamespace,
    runtime::config::Config,
    Fail,
    SharedTaskRuntime,
    Yielder,
    AUTO_GENERATION,
};

//==============================================================================
// Helpers
//==============================================================================

type Coroutine<R> = Pin<Box<dyn FusedFuture<Output = R>>>;

struct World {
    rt: SharedTaskRuntime,
    ns: SharedSymbolNamespace,
    pp: SharedParcelport,
}

/// Builds a simulated world of `num_localities` localities connected through
/// the loopback transport.
fn make_world(num_localities: u32, fanout: usize) -> World {
    let config: Config = Config {
        num_localities,
        broadcast_fanout: fanout,
        ..Default::default()
    };
    let rt: SharedTaskRuntime = SharedTaskRuntime::new(config.clone());
    let ns: SharedSymbolNamespace = SharedSymbolNamespace::new(&config);
    let transport: LoopbackTransport = LoopbackTransport::new();
    let mut pp: SharedParcelport = SharedParcelport::new(&config, rt.get_timer(), Box::new(transport));
    install_broadcast_handlers::<i32>(&rt, &ns, &mut pp);
    World { rt, ns, pp }
}

/// Drives the scheduler and the parcelport pump together.
fn pump(world: &mut World, rounds: usize) -> Result<()> {
    for _ in 0..rounds {
        world.rt.poll();
        world.pp.background_work()?;
    }
    Ok(())
}

//==============================================================================
// Unit Tests
//==============================================================================

/// One send to four sites resolves all four receive futures to the value.
/// With a fanout of two, two localities are reached directly from the root
/// and the other two through exactly one tree forward, whose recursion sends
/// two more direct parcels.
#[test]
fn test_broadcast_to_four_sites() -> Result<()> {
    let mut world: World = make_world(4, 2);

    let mut receives = Vec::with_capacity(4);
    for site in 0..4u64 {
        receives.push(broadcast_recv::<i32>(
            &mut world.rt,
            &mut world.ns,
            "x",
            site,
            AUTO_GENERATION,
        )?);
    }

    let send_done = broadcast_send::<i32>(
        &mut world.rt,
        &mut world.ns,
        &mut world.pp,
        "x",
        42,
        4,
        AUTO_GENERATION,
    )?;

    pump(&mut world, 100)?;

    let collect: Coroutine<Result<Vec<i32>, Fail>> = Box::pin(
        async move {
            let yielder: Yielder = Yielder::new();
            let mut values: Vec<i32> = Vec::new();
            for receive in receives {
                values.push(receive.get(&yielder).await?);
            }
            Ok(values)
        }
        .fuse(),
    );
    let handle = world.rt.insert_coroutine("collect", collect)?;

    for _ in 0..100 {
        if handle.has_completed() {
            break;
        }
        world.rt.poll();
        world.pp.background_work().ok();
    }
    let values: Result<Vec<i32>, Fail> = world.rt.remove_coroutine(&handle)?;
    ensure_eq!(values?, vec![42, 42, 42, 42]);

    // Exactly one tree forward; sites 2 and 3 were reached via one recursion.
    ensure_eq!(world.pp.parcels_delivered_with_tag(TAG_BROADCAST_TREE), 1);
    ensure_eq!(world.pp.parcels_delivered_with_tag(TAG_BROADCAST_DIRECT), 4);

    // The send side completed as well.
    ensure_eq!(send_done.is_ready(), true);

    // Every sender returned to its pool.
    ensure_eq!(world.pp.in_flight_senders(), 0);
    Ok(())
}

/// A broadcast over zero sites is a no-op that completes immediately.
#[test]
fn test_broadcast_zero_sites() -> Result<()> {
    let mut world: World = make_world(4, 2);
    let done = broadcast_send::<i32>(
        &mut world.rt,
        &mut world.ns,
        &mut world.pp,
        "empty",
        7,
        0,
        AUTO_GENERATION,
    )?;
    ensure_eq!(done.is_ready(), true);
    ensure_eq!(world.pp.parcels_delivered(), 0);
    Ok(())
}

/// A single-site broadcast takes the direct-send path, never the tree path.
#[test]
fn test_broadcast_single_site_is_direct() -> Result<()> {
    let mut world: World = make_world(4, 2);

    let receive = broadcast_recv::<i32>(&mut world.rt, &mut world.ns, "solo", 0, AUTO_GENERATION)?;
    let _send = broadcast_send::<i32>(
        &mut world.rt,
        &mut world.ns,
        &mut world.pp,
        "solo",
        13,
        1,
        AUTO_GENERATION,
    )?;

    pump(&mut world, 50)?;

    let collect: Coroutine<Result<i32, Fail>> = Box::pin(
        async move {
            let yielder: Yielder = Yielder::new();
            receive.get(&yielder).await
        }
        .fuse(),
    );
    let handle = world.rt.insert_coroutine("collect", collect)?;
    for _ in 0..50 {
        if handle.has_completed() {
            break;
        }
        world.rt.poll();
        world.pp.background_work().ok();
    }
    let value: Result<i32, Fail> = world.rt.remove_coroutine(&handle)?;
    ensure_eq!(value?, 13);

    ensure_eq!(world.pp.parcels_delivered_with_tag(TAG_BROADCAST_TREE), 0);
    ensure_eq!(world.pp.parcels_delivered_with_tag(TAG_BROADCAST_DIRECT), 1);
    Ok(())
}

/// The locality map groups sites by the shard owner of their names.
#[test]
fn test_locality_indices_grouping() -> Result<()> {
    let world: World = make_world(2, 16);
    let indices = generate_locality_indices(&world.ns, "x", 6);
    ensure_eq!(indices.len(), 2);
    ensure_eq!(indices[&0], vec![0, 2, 4]);
    ensure_eq!(indices[&1], vec![1, 3, 5]);
    Ok(())
}

/// The receive side works when registration happens after the payload was
/// already routed: the lookup parks until the cell is registered.
#[test]
fn test_send_before_recv() -> Result<()> {
    let mut world: World = make_world(2, 16);

    let _send = broadcast_send::<i32>(
        &mut world.rt,
        &mut world.ns,
        &mut world.pp,
        "late",
        5,
        2,
        AUTO_GENERATION,
    )?;
    pump(&mut world, 50)?;

    // Receivers register only after the payload reached their localities.
    let r0 = broadcast_recv::<i32>(&mut world.rt, &mut world.ns, "late", 0, AUTO_GENERATION)?;
    let r1 = broadcast_recv::<i32>(&mut world.rt, &mut world.ns, "late", 1, AUTO_GENERATION)?;

    let collect: Coroutine<Result<(i32, i32), Fail>> = Box::pin(
        async move {
            let yielder: Yielder = Yielder::new();
            Ok((r0.get(&yielder).await?, r1.get(&yielder).await?))
        }
        .fuse(),
    );
    let handle = world.rt.insert_coroutine("collect", collect)?;
    for _ in 0..100 {
        if handle.has_completed() {
            break;
        }
        world.rt.poll();
        world.pp.background_work().ok();
    }
    let (a, b): (i32, i32) = world.rt.remove_coroutine::<Result<(i32, i32), Fail>>(&handle)??;
    ensure_eq!(a, 5);
    ensure_eq!(b, 5);
    Ok(())
}
