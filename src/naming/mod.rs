// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Client surface of the symbol namespace (the global address service).
//!
//! Symbolic names map to registered object identities. The service is sharded
//! across localities; `service_locality_id` names the shard owner for a given
//! name. This in-process implementation backs the simulated multi-locality
//! world: registered identities resolve to typed single-assignment cells that
//! a collective delivery can set.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    future::{
        make_exceptional_future,
        make_ready_future,
        SharedFutureState,
        TaskFuture,
    },
    runtime::{
        config::Config,
        fail::Fail,
        SharedObject,
    },
};
use ::std::{
    any::Any,
    collections::HashMap,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// One process/node in the distributed runtime.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct LocalityId(pub u32);

/// Handle to a registered object.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ObjectId(pub u64);

pub struct SymbolNamespace {
    num_localities: u32,
    locality_id: u32,
    next_object_id: u64,
    /// Symbolic name -> registered identity.
    names: HashMap<String, ObjectId>,
    /// Registered identity -> type-erased single-assignment cell.
    cells: HashMap<u64, Box<dyn Any>>,
    /// Lookups parked until the name is registered.
    pending_finds: HashMap<String, Vec<SharedFutureState<ObjectId>>>,
}

#[derive(Clone)]
pub struct SharedSymbolNamespace(SharedObject<SymbolNamespace>);

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl SharedSymbolNamespace {
    pub fn new(config: &Config) -> Self {
        Self(SharedObject::new(SymbolNamespace {
            num_localities: config.num_localities,
            locality_id: config.locality_id,
            next_object_id: 1,
            names: HashMap::new(),
            cells: HashMap::new(),
            pending_finds: HashMap::new(),
        }))
    }

    pub fn get_num_localities(&self) -> u32 {
        self.num_localities
    }

    pub fn get_locality_id(&self) -> LocalityId {
        LocalityId(self.locality_id)
    }

    /// Names the locality whose symbol-namespace shard serves `name`. Names
    /// carrying a trailing ordinal are sharded round-robin; others by hash.
    /// Local and synchronous.
    pub fn service_locality_id(&self, name: &str) -> LocalityId {
        let shard: u32 = match trailing_ordinal(name) {
            Some(ordinal) => (ordinal % self.num_localities as u64) as u32,
            None => (fnv1a(name.as_bytes()) % self.num_localities as u64) as u32,
        };
        LocalityId(shard)
    }

    /// Registers a typed single-assignment cell and returns its identity.
    pub fn register_cell<T: 'static>(&mut self, state: SharedFutureState<T>) -> ObjectId {
        let this: &mut SymbolNamespace = self.0.as_mut();
        let id: ObjectId = ObjectId(this.next_object_id);
        this.next_object_id += 1;
        this.cells.insert(id.0, Box::new(state));
        id
    }

    /// Delivers `value` to the registered cell `id`.
    pub fn set_cell_value<T: 'static>(&mut self, id: ObjectId, value: T) -> Result<(), Fail> {
        let this: &mut SymbolNamespace = self.0.as_mut();
        let cell: &dyn Any = match this.cells.get(&id.0) {
            Some(cell) => cell.as_ref(),
            None => {
                let cause: String = format!("no registered cell (id={:?})", id);
                error!("set_cell_value(): {}", cause);
                return Err(Fail::new(libc::ENOENT, &cause));
            },
        };
        let mut state: SharedFutureState<T> = match cell.downcast_ref::<SharedFutureState<T>>() {
            Some(state) => state.clone(),
            None => {
                let cause: String = format!("registered cell has a different value type (id={:?})", id);
                error!("set_cell_value(): {}", cause);
                return Err(Fail::new(libc::EINVAL, &cause));
            },
        };
        state.set_value(value)
    }

    /// Drops a registered cell.
    pub fn remove_cell(&mut self, id: ObjectId) {
        self.0.as_mut().cells.remove(&id.0);
    }

    /// Registers `id` under `basename/site`. Resolves to false if the name
    /// was already taken.
    pub fn register_with_basename(&mut self, basename: &str, id: ObjectId, site: u64) -> TaskFuture<bool> {
        let name: String = name_from_basename(basename, site);
        let this: &mut SymbolNamespace = self.0.as_mut();

        if this.names.contains_key(&name) {
            warn!("register_with_basename(): name already registered (name={:?})", name);
            return make_ready_future(false);
        }
        this.names.insert(name.clone(), id);
        trace!("register_with_basename(): name={:?}, id={:?}", name, id);

        // Resolve lookups that raced ahead of the registration.
        if let Some(waiting) = this.pending_finds.remove(&name) {
            for mut state in waiting {
                let _ = state.set_value(id);
            }
        }

        make_ready_future(true)
    }

    /// Resolves the identity registered under `basename/site`. The returned
    /// future stays pending until the registration happens.
    pub fn find_from_basename(&mut self, basename: &str, site: u64) -> TaskFuture<ObjectId> {
        let name: String = name_from_basename(basename, site);
        let this: &mut SymbolNamespace = self.0.as_mut();

        if let Some(id) = this.names.get(&name) {
            return make_ready_future(*id);
        }

        let state: SharedFutureState<ObjectId> = SharedFutureState::new();
        this.pending_finds.entry(name).or_default().push(state.clone());
        TaskFuture::from_state(state)
    }

    /// Removes the registration under `basename/site`, yielding the identity
    /// that was registered there.
    pub fn unregister_with_basename(&mut self, basename: &str, site: u64) -> TaskFuture<ObjectId> {
        let name: String = name_from_basename(basename, site);
        let this: &mut SymbolNamespace = self.0.as_mut();

        match this.names.remove(&name) {
            Some(id) => {
                trace!("unregister_with_basename(): name={:?}, id={:?}", name, id);
                make_ready_future(id)
            },
            None => {
                let cause: String = format!("name is not registered (name={:?})", name);
                error!("unregister_with_basename(): {}", cause);
                make_exceptional_future(Fail::new(libc::ENOENT, &cause))
            },
        }
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Builds the symbolic name a site registers under.
pub fn name_from_basename(basename: &str, site: u64) -> String {
    format!("{}/{}", basename, site)
}

/// Parses the trailing `/<ordinal>` of a symbolic name, if any.
fn trailing_ordinal(name: &str) -> Option<u64> {
    let (_, suffix): (&str, &str) = name.rsplit_once('/')?;
    suffix.parse::<u64>().ok()
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in bytes {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl ::std::ops::Deref for SharedSymbolNamespace {
    type Target = SymbolNamespace;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::{
        name_from_basename,
        LocalityId,
        ObjectId,
        SharedSymbolNamespace,
    };
    use crate::{
        future::{
            SharedFutureState,
            TaskFuture,
        },
        runtime::config::Config,
    };
    use ::anyhow::Result;

    fn four_locality_namespace() -> SharedSymbolNamespace {
        let config: Config = Config {
            num_localities: 4,
            ..Default::default()
        };
        SharedSymbolNamespace::new(&config)
    }

    #[test]
    fn ordinal_names_shard_round_robin() -> Result<()> {
        let ns: SharedSymbolNamespace = four_locality_namespace();
        for site in 0..8u64 {
            let name: String = name_from_basename("x", site);
            crate::ensure_eq!(ns.service_locality_id(&name), LocalityId((site % 4) as u32));
        }
        Ok(())
    }

    #[test]
    fn register_then_find() -> Result<()> {
        let mut ns: SharedSymbolNamespace = four_locality_namespace();
        let registered: TaskFuture<bool> = ns.register_with_basename("x", ObjectId(9), 1);
        crate::ensure_eq!(registered.is_ready(), true);
        let found: TaskFuture<ObjectId> = ns.find_from_basename("x", 1);
        crate::ensure_eq!(found.is_ready(), true);
        Ok(())
    }

    #[test]
    fn find_parks_until_registration() -> Result<()> {
        let mut ns: SharedSymbolNamespace = four_locality_namespace();
        let found: TaskFuture<ObjectId> = ns.find_from_basename("x", 2);
        crate::ensure_eq!(found.is_ready(), false);
        ns.register_with_basename("x", ObjectId(3), 2);
        crate::ensure_eq!(found.is_ready(), true);
        Ok(())
    }

    #[test]
    fn double_registration_resolves_false() -> Result<()> {
        let mut ns: SharedSymbolNamespace = four_locality_namespace();
        ns.register_with_basename("x", ObjectId(1), 0);
        let second: TaskFuture<bool> = ns.register_with_basename("x", ObjectId(2), 0);
        crate::ensure_eq!(second.is_ready(), true);
        Ok(())
    }

    #[test]
    fn cell_delivery() -> Result<()> {
        let mut ns: SharedSymbolNamespace = four_locality_namespace();
        let state: SharedFutureState<i32> = SharedFutureState::new();
        let id: super::ObjectId = ns.register_cell(state.clone());
        ns.set_cell_value(id, 42)?;
        crate::ensure_eq!(state.is_ready(), true);
        Ok(())
    }

    #[test]
    fn cell_delivery_with_wrong_type_fails() -> Result<()> {
        let mut ns: SharedSymbolNamespace = four_locality_namespace();
        let state: SharedFutureState<i32> = SharedFutureState::new();
        let id: super::ObjectId = ns.register_cell(state);
        crate::ensure_eq!(ns.set_cell_value(id, String::from("nope")).is_err(), true);
        Ok(())
    }
}
