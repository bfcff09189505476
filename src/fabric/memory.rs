// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Pinned memory for the fabric: a pool of fixed-size registered regions plus
//! on-demand registration of user memory for zero-copy chunks.
//!
//! A region is leased from the pool for exactly the lifetime between post and
//! completion; dropping the lease deregisters the memory and returns the
//! buffer to the pool. The domain keeps the remote-key table, which is also
//! what a loopback receiver consults to emulate an RDMA read.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::fail::Fail;
use crate::runtime::SharedObject;
use ::std::{
    collections::HashMap,
    ptr::NonNull,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Registration table of the fabric domain: remote key -> (address, length).
pub struct FabricDomain {
    next_key: u64,
    registered: HashMap<u64, (usize, usize)>,
}

#[derive(Clone)]
pub struct SharedFabricDomain(SharedObject<FabricDomain>);

enum RegionStorage {
    /// Pool-owned buffer, returned on drop.
    Pooled { buf: Option<Box<[u8]>>, pool: RegionPool },
    /// User memory registered for zero-copy; the caller guarantees it stays
    /// valid until the region is released.
    User { ptr: NonNull<u8>, len: usize },
}

/// Memory registered with the fabric for direct network access. Carries a
/// local key (descriptor for sends) and a remote key (for RDMA fetches).
pub struct PinnedRegion {
    storage: RegionStorage,
    domain: SharedFabricDomain,
    local_key: u64,
    remote_key: u64,
    message_length: usize,
}

impl ::std::fmt::Debug for PinnedRegion {
    fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
        f.debug_struct("PinnedRegion")
            .field("local_key", &self.local_key)
            .field("remote_key", &self.remote_key)
            .field("message_length", &self.message_length)
            .finish()
    }
}

pub struct RegionPoolState {
    buffers: Vec<Box<[u8]>>,
    region_size: usize,
    domain: SharedFabricDomain,
}

/// Pool of same-sized pinned regions.
#[derive(Clone)]
pub struct RegionPool(SharedObject<RegionPoolState>);

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl SharedFabricDomain {
    pub fn new() -> Self {
        Self(SharedObject::new(FabricDomain {
            next_key: 1,
            registered: HashMap::new(),
        }))
    }

    /// Registers user memory for zero-copy access and returns the pinned
    /// region describing it.
    ///
    /// # Safety
    /// The caller must keep the memory valid until the returned region is
    /// dropped.
    pub unsafe fn register_chunk(&mut self, ptr: *const u8, len: usize) -> Result<PinnedRegion, Fail> {
        let ptr: NonNull<u8> = match NonNull::new(ptr as *mut u8) {
            Some(ptr) => ptr,
            None => {
                let cause: &str = "cannot register a null chunk";
                error!("register_chunk(): {}", cause);
                return Err(Fail::new(libc::EINVAL, cause));
            },
        };
        let key: u64 = self.register(ptr.as_ptr() as usize, len);
        Ok(PinnedRegion {
            storage: RegionStorage::User { ptr, len },
            domain: self.clone(),
            local_key: key,
            remote_key: key,
            message_length: len,
        })
    }

    /// Emulates a receiver-initiated RDMA read: copies `len` bytes from the
    /// registered region identified by `remote_key` starting at `addr`.
    pub fn read_remote(&self, remote_key: u64, addr: u64, len: usize) -> Result<Vec<u8>, Fail> {
        let (base, region_len): (usize, usize) = match self.registered.get(&remote_key) {
            Some(entry) => *entry,
            None => {
                let cause: String = format!("unknown remote key (key={:?})", remote_key);
                error!("read_remote(): {}", cause);
                return Err(Fail::new(libc::EINVAL, &cause));
            },
        };
        let addr: usize = addr as usize;
        if addr < base || addr + len > base + region_len {
            let cause: String = format!("remote read out of bounds (key={:?}, len={:?})", remote_key, len);
            error!("read_remote(): {}", cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }
        // Safety: the range was registered and regions stay pinned (alive)
        // until deregistered, which only happens when the owning lease drops.
        let bytes: Vec<u8> = unsafe { std::slice::from_raw_parts(addr as *const u8, len) }.to_vec();
        Ok(bytes)
    }

    /// Number of currently registered regions.
    pub fn num_registered(&self) -> usize {
        self.registered.len()
    }

    fn register(&mut self, addr: usize, len: usize) -> u64 {
        let this: &mut FabricDomain = self.0.as_mut();
        let key: u64 = this.next_key;
        this.next_key += 1;
        this.registered.insert(key, (addr, len));
        key
    }

    fn deregister(&mut self, key: u64) {
        self.0.as_mut().registered.remove(&key);
    }
}

impl PinnedRegion {
    /// Address of the region as seen by the fabric.
    pub fn address(&self) -> u64 {
        match &self.storage {
            RegionStorage::Pooled { buf, .. } => {
                buf.as_ref().expect("pooled buffer is present until drop").as_ptr() as u64
            },
            RegionStorage::User { ptr, .. } => ptr.as_ptr() as u64,
        }
    }

    pub fn capacity(&self) -> usize {
        match &self.storage {
            RegionStorage::Pooled { buf, .. } => buf.as_ref().expect("pooled buffer is present until drop").len(),
            RegionStorage::User { len, .. } => *len,
        }
    }

    pub fn local_key(&self) -> u64 {
        self.local_key
    }

    pub fn remote_key(&self) -> u64 {
        self.remote_key
    }

    /// Length of the message currently held in the region.
    pub fn message_length(&self) -> usize {
        self.message_length
    }

    pub fn set_message_length(&mut self, len: usize) {
        debug_assert!(len <= self.capacity());
        self.message_length = len;
    }

    /// The valid message bytes of the region.
    pub fn as_slice(&self) -> &[u8] {
        match &self.storage {
            RegionStorage::Pooled { buf, .. } => {
                &buf.as_ref().expect("pooled buffer is present until drop")[..self.message_length]
            },
            RegionStorage::User { ptr, .. } => {
                // Safety: the caller of register_chunk guarantees validity for
                // the lifetime of the region.
                unsafe { std::slice::from_raw_parts(ptr.as_ptr(), self.message_length) }
            },
        }
    }

    /// Mutable access to the full region, for in-place construction.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match &mut self.storage {
            RegionStorage::Pooled { buf, .. } => &mut buf.as_mut().expect("pooled buffer is present until drop")[..],
            RegionStorage::User { .. } => panic!("user chunks are read-only"),
        }
    }
}

impl RegionPool {
    /// Creates a pool of `count` regions of `region_size` bytes each.
    pub fn new(domain: SharedFabricDomain, region_size: usize, count: usize) -> Self {
        let mut buffers: Vec<Box<[u8]>> = Vec::with_capacity(count);
        for _ in 0..count {
            buffers.push(vec![0u8; region_size].into_boxed_slice());
        }
        Self(SharedObject::new(RegionPoolState {
            buffers,
            region_size,
            domain,
        }))
    }

    /// Leases one region from the pool, registering it with the domain.
    /// Fails with `ENOMEM` when the pool is exhausted.
    pub fn reserve(&mut self) -> Result<PinnedRegion, Fail> {
        let this: &mut RegionPoolState = self.0.as_mut();
        let buf: Box<[u8]> = match this.buffers.pop() {
            Some(buf) => buf,
            None => {
                let cause: &str = "region pool is exhausted";
                error!("reserve(): {}", cause);
                return Err(Fail::new(libc::ENOMEM, cause));
            },
        };
        let mut domain: SharedFabricDomain = this.domain.clone();
        let key: u64 = domain.register(buf.as_ptr() as usize, buf.len());
        Ok(PinnedRegion {
            storage: RegionStorage::Pooled {
                buf: Some(buf),
                pool: self.clone(),
            },
            domain,
            local_key: key,
            remote_key: key,
            message_length: 0,
        })
    }

    /// Size of each region in the pool.
    pub fn region_size(&self) -> usize {
        self.region_size
    }

    /// Number of free regions in the pool.
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    fn return_buffer(&mut self, buf: Box<[u8]>) {
        self.0.as_mut().buffers.push(buf);
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Default for SharedFabricDomain {
    fn default() -> Self {
        Self::new()
    }
}

impl ::std::ops::Deref for SharedFabricDomain {
    type Target = FabricDomain;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl ::std::ops::Deref for RegionPool {
    type Target = RegionPoolState;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Drop for PinnedRegion {
    fn drop(&mut self) {
        let mut domain: SharedFabricDomain = self.domain.clone();
        domain.deregister(self.remote_key);
        if let RegionStorage::Pooled { buf, pool } = &mut self.storage {
            if let Some(buf) = buf.take() {
                pool.clone().return_buffer(buf);
            }
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
