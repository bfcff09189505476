// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Broadcast collective: deliver one value to every site registered under a
//! symbolic basename.
//!
//! The receive side registers a local single-assignment cell under
//! `basename[/generation]/<site>` and hands back a future; the send side
//! groups sites by the locality owning their symbol-namespace shard and
//! distributes the payload with a hybrid fanout. The first `fanout_local`
//! localities get a direct parcel; the remainder is partitioned into slices,
//! each carried by a single tree parcel whose first locality recurses. Total
//! messages stay linear in the number of sites, with per-node fanout bounded
//! by `fanout_local` and tree depth logarithmic in it.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    fabric::{
        FabricAddress,
        SendBuffer,
        SharedParcelport,
    },
    future::{
        make_ready_future,
        when_all,
        Launch,
        Promise,
        SharedFutureState,
        TaskFuture,
    },
    naming::{
        name_from_basename,
        LocalityId,
        ObjectId,
        SharedSymbolNamespace,
    },
    runtime::{
        fail::Fail,
        scheduler::Yielder,
        SharedTaskRuntime,
    },
    serialization::{
        ReadArchive,
        Serializable,
        WriteArchive,
    },
    AUTO_GENERATION,
    THIS_SITE,
};
use ::futures::{
    future::FusedFuture,
    FutureExt,
};
use ::std::{
    collections::BTreeMap,
    pin::Pin,
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Parcel tag: payload plus the ordered list of sites owned by the receiving
/// locality.
pub const TAG_BROADCAST_DIRECT: u32 = 1;

/// Parcel tag: payload plus a slice of the locality map; the receiving
/// locality recurses over the slice.
pub const TAG_BROADCAST_TREE: u32 = 2;

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Creates the receiving endpoint for one site of a broadcast: a local cell
/// registered with the naming service. The returned future resolves once the
/// payload has been delivered; the registration is removed after use.
pub fn broadcast_recv<T: Clone + 'static>(
    runtime: &mut SharedTaskRuntime,
    namespace: &mut SharedSymbolNamespace,
    basename: &str,
    this_site: u64,
    generation: u64,
) -> Result<TaskFuture<T>, Fail> {
    let this_site: u64 = if this_site == THIS_SITE {
        namespace.get_locality_id().0 as u64
    } else {
        this_site
    };
    let name: String = decorated_name(basename, generation);

    // The local receiving endpoint for this site.
    let state: SharedFutureState<T> = SharedFutureState::new();
    let value_future: TaskFuture<T> = TaskFuture::from_state(state.clone());
    let cell_id: ObjectId = namespace.register_cell(state);

    // Publish the cell under the symbolic name.
    let registered: TaskFuture<bool> = namespace.register_with_basename(&name, cell_id, this_site);

    let mut out_promise: Promise<T> = Promise::new();
    let output: TaskFuture<T> = out_promise.get_future()?;
    let mut namespace: SharedSymbolNamespace = namespace.clone();
    let coroutine: Pin<Box<dyn FusedFuture<Output = ()>>> = Box::pin(
        async move {
            let yielder: Yielder = Yielder::new();

            match registered.get(&yielder).await {
                Ok(true) => {},
                Ok(false) => {
                    let cause: String = format!("name is already registered (name={:?})", name);
                    error!("broadcast_recv(): {}", cause);
                    namespace.remove_cell(cell_id);
                    let _ = out_promise.set_error(Fail::new(libc::EEXIST, &cause));
                    return;
                },
                Err(e) => {
                    namespace.remove_cell(cell_id);
                    let _ = out_promise.set_error(e);
                    return;
                },
            }

            let result: Result<T, Fail> = value_future.get(&yielder).await;

            // Make sure the registration is removed after use.
            let _ = namespace.unregister_with_basename(&name, this_site).get(&yielder).await;
            namespace.remove_cell(cell_id);

            match result {
                Ok(value) => {
                    let _ = out_promise.set_value(value);
                },
                Err(e) => {
                    let _ = out_promise.set_error(e);
                },
            }
        }
        .fuse(),
    );
    runtime.insert_coroutine("broadcast_recv", coroutine)?;
    Ok(output)
}

/// Delivers one copy of `value` to each of the `num_sites` receivers
/// registered under `basename`. The returned future completes once every
/// parcel posted by this locality has completed at the send engine; leaf
/// deliveries are independent of each other.
pub fn broadcast_send<T: Serializable + Clone + 'static>(
    runtime: &mut SharedTaskRuntime,
    namespace: &mut SharedSymbolNamespace,
    parcelport: &mut SharedParcelport,
    basename: &str,
    value: T,
    num_sites: u64,
    generation: u64,
) -> Result<TaskFuture<()>, Fail> {
    // A broadcast over zero sites completes immediately.
    if num_sites == 0 {
        return Ok(make_ready_future(()));
    }

    let name: String = decorated_name(basename, generation);
    let indices: BTreeMap<u32, Vec<u64>> = generate_locality_indices(namespace, &name, num_sites);
    broadcast_send_sliced(runtime, parcelport, &name, value, indices, 0)
}

/// Groups the sites of a broadcast by the locality owning each site's
/// symbol-namespace shard.
pub fn generate_locality_indices(
    namespace: &SharedSymbolNamespace,
    name: &str,
    num_sites: u64,
) -> BTreeMap<u32, Vec<u64>> {
    let mut indices: BTreeMap<u32, Vec<u64>> = BTreeMap::new();
    for site in 0..num_sites {
        let locality: LocalityId = namespace.service_locality_id(&name_from_basename(name, site));
        indices.entry(locality.0).or_default().push(site);
    }
    indices
}

/// Width of one tree slice: grows geometrically so that deep trees stay
/// shallow while per-node fanout remains bounded.
pub fn calculate_fanout(size: usize, local_fanout: usize) -> usize {
    if size == 0 || local_fanout == 0 {
        return 1;
    }
    if size <= local_fanout {
        return size;
    }
    let remaining: usize = size - local_fanout;
    let mut fanout: usize = 1;
    while fanout < remaining {
        fanout *= local_fanout;
    }
    fanout
}

/// Installs the broadcast parcel handlers for payload type `T`. Must run on
/// every locality before payloads of that type are broadcast.
pub fn install_broadcast_handlers<T: Serializable + Clone + 'static>(
    runtime: &SharedTaskRuntime,
    namespace: &SharedSymbolNamespace,
    parcelport: &mut SharedParcelport,
) {
    let runtime_handle: SharedTaskRuntime = runtime.clone();
    let namespace_handle: SharedSymbolNamespace = namespace.clone();
    parcelport.register_handler(
        TAG_BROADCAST_DIRECT,
        Box::new(move |_pp: &mut SharedParcelport, archive: &mut ReadArchive| {
            let mut runtime: SharedTaskRuntime = runtime_handle.clone();
            let mut namespace: SharedSymbolNamespace = namespace_handle.clone();
            let name: String = String::deserialize(archive)?;
            let sites: Vec<u64> = Vec::<u64>::deserialize(archive)?;
            let value: T = T::deserialize(archive)?;
            for site in sites {
                deliver_to_site(&mut runtime, &mut namespace, &name, site, value.clone())?;
            }
            Ok(())
        }),
    );

    let runtime_handle: SharedTaskRuntime = runtime.clone();
    parcelport.register_handler(
        TAG_BROADCAST_TREE,
        Box::new(move |pp: &mut SharedParcelport, archive: &mut ReadArchive| {
            let mut runtime: SharedTaskRuntime = runtime_handle.clone();
            let name: String = String::deserialize(archive)?;
            let global_idx: u64 = u64::deserialize(archive)?;
            let slices: BTreeMap<u32, Vec<u64>> = BTreeMap::<u32, Vec<u64>>::deserialize(archive)?;
            let value: T = T::deserialize(archive)?;
            // Recurse over the slice carried by this parcel.
            let _ = broadcast_send_sliced(&mut runtime, pp, &name, value, slices, global_idx as usize)?;
            Ok(())
        }),
    );
}

/// Applies the broadcast to a locality map: one direct parcel per locality up
/// to the configured fanout, then one tree parcel per slice of the remainder.
fn broadcast_send_sliced<T: Serializable + Clone + 'static>(
    runtime: &mut SharedTaskRuntime,
    parcelport: &mut SharedParcelport,
    name: &str,
    value: T,
    sites_map: BTreeMap<u32, Vec<u64>>,
    global_idx: usize,
) -> Result<TaskFuture<()>, Fail> {
    if sites_map.is_empty() {
        return Ok(make_ready_future(()));
    }

    let entries: Vec<(u32, Vec<u64>)> = sites_map.into_iter().collect();
    let size: usize = entries.len();

    // A single locality gets the payload together with its full site list.
    if size == 1 {
        let (locality, sites) = &entries[0];
        let completion: TaskFuture<()> =
            post_direct(runtime, parcelport, name, *locality, sites.clone(), value)?;
        return Ok(completion);
    }

    let local_fanout: usize = runtime.get_config().broadcast_fanout;
    let local_size: usize = size.min(local_fanout);
    let fanout: usize = calculate_fanout(size, local_fanout);

    let mut completions: Vec<TaskFuture<()>> = Vec::with_capacity(local_size + size / fanout + 1);

    // The first `local_fanout` localities are handled directly.
    for (locality, sites) in entries.iter().take(local_size) {
        completions.push(post_direct(
            runtime,
            parcelport,
            name,
            *locality,
            sites.clone(),
            value.clone(),
        )?);
    }

    // The remaining localities are reached through tree parcels, one per
    // slice; the first locality of each slice recurses.
    let mut applied: usize = local_size;
    let mut index: usize = local_size;
    while index < size {
        debug_assert!(size >= applied);
        let next_fan: usize = fanout.min(size - applied);
        let slice: BTreeMap<u32, Vec<u64>> = entries[index..index + next_fan].iter().cloned().collect();
        let target: u32 = *slice.keys().next().expect("slice is non-empty");

        completions.push(post_tree(
            runtime,
            parcelport,
            name,
            target,
            slice,
            (global_idx + applied) as u64,
            value.clone(),
        )?);

        applied += next_fan;
        index += next_fan;
    }

    let all: TaskFuture<Vec<TaskFuture<()>>> = when_all(runtime, completions)?;
    all.then(runtime, Launch::Sync, |_| ())
}

/// Resolves the identity registered for `site` and sets the payload on it.
/// The lookup may park until the receiver registers, so delivery runs as its
/// own coroutine.
fn deliver_to_site<T: Clone + 'static>(
    runtime: &mut SharedTaskRuntime,
    namespace: &mut SharedSymbolNamespace,
    name: &str,
    site: u64,
    value: T,
) -> Result<(), Fail> {
    let found: TaskFuture<ObjectId> = namespace.find_from_basename(name, site);
    let mut namespace: SharedSymbolNamespace = namespace.clone();
    let name: String = name.to_string();
    let coroutine: Pin<Box<dyn FusedFuture<Output = ()>>> = Box::pin(
        async move {
            let yielder: Yielder = Yielder::new();
            match found.get(&yielder).await {
                Ok(id) => {
                    if let Err(e) = namespace.set_cell_value(id, value) {
                        warn!("deliver_to_site(): delivery failed (name={:?}, site={:?}): {:?}", name, site, e);
                    }
                },
                Err(e) => {
                    warn!("deliver_to_site(): lookup failed (name={:?}, site={:?}): {:?}", name, site, e);
                },
            }
        }
        .fuse(),
    );
    runtime.insert_coroutine("broadcast_deliver", coroutine)?;
    Ok(())
}

fn post_direct<T: Serializable>(
    runtime: &mut SharedTaskRuntime,
    parcelport: &mut SharedParcelport,
    name: &str,
    locality: u32,
    sites: Vec<u64>,
    value: T,
) -> Result<TaskFuture<()>, Fail> {
    let mut archive: WriteArchive = WriteArchive::new();
    archive.write_u32(TAG_BROADCAST_DIRECT);
    name.to_string().serialize(&mut archive);
    sites.serialize(&mut archive);
    value.serialize(&mut archive);

    parcelport.put_parcel(
        runtime,
        SendBuffer {
            body: archive.into_bytes(),
            chunks: Vec::new(),
            dest: FabricAddress(locality as u64),
            bootstrap: false,
            handler: None,
        },
    )
}

fn post_tree<T: Serializable>(
    runtime: &mut SharedTaskRuntime,
    parcelport: &mut SharedParcelport,
    name: &str,
    locality: u32,
    slice: BTreeMap<u32, Vec<u64>>,
    global_idx: u64,
    value: T,
) -> Result<TaskFuture<()>, Fail> {
    let mut archive: WriteArchive = WriteArchive::new();
    archive.write_u32(TAG_BROADCAST_TREE);
    name.to_string().serialize(&mut archive);
    global_idx.serialize(&mut archive);
    slice.serialize(&mut archive);
    value.serialize(&mut archive);

    parcelport.put_parcel(
        runtime,
        SendBuffer {
            body: archive.into_bytes(),
            chunks: Vec::new(),
            dest: FabricAddress(locality as u64),
            bootstrap: false,
            handler: None,
        },
    )
}

/// Appends the generation to the basename when one was given.
fn decorated_name(basename: &str, generation: u64) -> String {
    if generation == AUTO_GENERATION {
        basename.to_string()
    } else {
        format!("{}/{}", basename, generation)
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::calculate_fanout;
    use ::anyhow::Result;

    #[test]
    fn fanout_of_small_maps_is_their_size() -> Result<()> {
        crate::ensure_eq!(calculate_fanout(1, 16), 1);
        crate::ensure_eq!(calculate_fanout(16, 16), 16);
        Ok(())
    }

    #[test]
    fn fanout_grows_geometrically() -> Result<()> {
        // 4 localities at fanout 2: two direct, one slice of two.
        crate::ensure_eq!(calculate_fanout(4, 2), 2);
        // 20 localities at fanout 16: the 4 remaining fit one slice width.
        crate::ensure_eq!(calculate_fanout(20, 16), 16);
        // 300 localities at fanout 16: the slice width covers the 284
        // remaining localities in one forward.
        crate::ensure_eq!(calculate_fanout(300, 16), 4096);
        Ok(())
    }

    #[test]
    fn fanout_degenerate_inputs() -> Result<()> {
        crate::ensure_eq!(calculate_fanout(0, 16), 1);
        crate::ensure_eq!(calculate_fanout(8, 0), 1);
        Ok(())
    }
}
