// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! The send engine: one sender drives one outgoing message over the fabric.
//!
//! A sender is leased from the [SenderPool], bound to a destination and a
//! prepared buffer, posted, and returned to the pool once all completion
//! events have arrived. Zero-copy chunks are registered with the domain at
//! preparation time; the header is constructed in place inside a pooled
//! pinned region, and the piggyback layout is chosen whenever header and body
//! together fit the header-region budget.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    fabric::{
        header::{
            ChunkDescriptor,
            MessageHeader,
            RmaHandle,
            FLAG_BOOTSTRAP,
            FLAG_PIGGYBACK_CHUNKS,
            FLAG_PIGGYBACK_MESSAGE,
        },
        memory::{
            PinnedRegion,
            RegionPool,
            SharedFabricDomain,
        },
        FabricAddress,
        FabricTransport,
    },
    runtime::{
        fail::Fail,
        limits,
        SharedObject,
    },
};
use ::arrayvec::ArrayVec;
use ::std::ops::{
    Deref,
    DerefMut,
};

//======================================================================================================================
// Enumerations
//======================================================================================================================

/// Lifecycle of a sender.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SenderState {
    Idle,
    Prepared,
    Posted,
    WaitingAck,
}

/// One segment of a serialized payload handed to the engine.
pub enum Chunk {
    /// Bytes already serialized into the message body.
    Inline { len: u32 },
    /// User memory to transfer zero-copy; registered at preparation time.
    Pointer { ptr: *const u8, len: usize },
    /// A pre-registered remote region.
    Rma { key: u64, addr: u64, len: u32 },
}

//======================================================================================================================
// Structures
//======================================================================================================================

/// Completion handler invoked exactly once per posted message.
pub type CompletionHandler = Box<dyn FnOnce(Result<(), Fail>)>;

/// A prepared outgoing message.
pub struct SendBuffer {
    /// Serialized body (archive bytes).
    pub body: Vec<u8>,
    /// Chunk list describing the payload's segments.
    pub chunks: Vec<Chunk>,
    pub dest: FabricAddress,
    /// Marks a message sent before address resolution has converged;
    /// `-ENOENT` is retried instead of fatal.
    pub bootstrap: bool,
    pub handler: Option<CompletionHandler>,
}

/// One in-flight message. Owns every pinned region between post and
/// completion.
pub struct Sender {
    id: u64,
    state: SenderState,
    dest: FabricAddress,
    bootstrap: bool,
    piggyback: bool,
    completion_count: usize,
    header_region: Option<PinnedRegion>,
    message_region: Option<PinnedRegion>,
    chunk_region: Option<PinnedRegion>,
    rma_regions: ArrayVec<PinnedRegion, { limits::MAX_ZERO_COPY_CHUNKS }>,
    handler: Option<CompletionHandler>,
}

#[derive(Clone)]
pub struct SharedSender(SharedObject<Sender>);

struct SenderPoolState {
    free: Vec<SharedSender>,
}

/// Pool of idle senders.
#[derive(Clone)]
pub struct SenderPool(SharedObject<SenderPoolState>);

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl SharedSender {
    fn new(id: u64) -> Self {
        Self(SharedObject::new(Sender {
            id,
            state: SenderState::Idle,
            dest: FabricAddress(0),
            bootstrap: false,
            piggyback: false,
            completion_count: 0,
            header_region: None,
            message_region: None,
            chunk_region: None,
            rma_regions: ArrayVec::new(),
            handler: None,
        }))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> SenderState {
        self.state
    }

    pub fn is_bootstrap(&self) -> bool {
        self.bootstrap
    }

    /// Whether this sender still owns pinned regions. A sender in the pool
    /// must not.
    pub fn owns_regions(&self) -> bool {
        self.header_region.is_some()
            || self.message_region.is_some()
            || self.chunk_region.is_some()
            || !self.rma_regions.is_empty()
    }

    /// Binds this sender to `buffer`: registers zero-copy chunks, leases the
    /// header and message regions, constructs the header in place, and
    /// decides the wire layout and completion count.
    pub fn prepare(
        &mut self,
        buffer: SendBuffer,
        region_pool: &mut RegionPool,
        domain: &mut SharedFabricDomain,
        header_budget: usize,
    ) -> Result<(), Fail> {
        debug_assert_eq!(self.state, SenderState::Idle);
        debug_assert_eq!(self.completion_count, 0);
        debug_assert!(!self.owns_regions());

        let SendBuffer {
            body,
            chunks,
            dest,
            bootstrap,
            handler,
        } = buffer;
        let this: &mut Sender = self.0.as_mut();
        this.dest = dest;
        this.bootstrap = bootstrap;
        this.handler = handler;

        // Register a memory region for every zero-copy chunk before building
        // the header: the chunk descriptors carry the resulting remote keys.
        let mut descriptors: Vec<ChunkDescriptor> = Vec::with_capacity(chunks.len());
        let mut rma_chunks: usize = 0;
        for chunk in chunks {
            match chunk {
                Chunk::Inline { len } => descriptors.push(ChunkDescriptor::Inline { len }),
                Chunk::Pointer { ptr, len } => {
                    // Safety: the chunk owner keeps the memory valid until the
                    // sender completes and releases the region.
                    let region: PinnedRegion = unsafe { domain.register_chunk(ptr, len)? };
                    descriptors.push(ChunkDescriptor::Pointer {
                        rma: RmaHandle {
                            key: region.remote_key(),
                            addr: region.address(),
                            len: len as u32,
                        },
                    });
                    if this.rma_regions.try_push(region).is_err() {
                        this.release_regions();
                        let cause: &str = "too many zero-copy chunks";
                        error!("prepare(): {}", cause);
                        return Err(Fail::new(libc::EINVAL, cause));
                    }
                },
                Chunk::Rma { key, addr, len } => {
                    rma_chunks += 1;
                    descriptors.push(ChunkDescriptor::Rma {
                        rma: RmaHandle { key, addr, len },
                    });
                },
            }
        }

        let header_region: PinnedRegion = match region_pool.reserve() {
            Ok(region) => region,
            Err(e) => {
                this.release_regions();
                return Err(e);
            },
        };
        let mut message_region: PinnedRegion = match region_pool.reserve() {
            Ok(region) => region,
            Err(e) => {
                this.release_regions();
                return Err(e);
            },
        };
        if body.len() > message_region.capacity() {
            this.release_regions();
            let cause: String = format!("message is too large (len={:?})", body.len());
            error!("prepare(): {}", cause);
            return Err(Fail::new(libc::EMSGSIZE, &cause));
        }
        message_region.as_mut_slice()[..body.len()].copy_from_slice(&body);
        message_region.set_message_length(body.len());

        let piggyback_chunks: bool = descriptors.len() <= limits::MAX_INLINE_CHUNKS;
        let mut flags: u8 = 0;
        if bootstrap {
            flags |= FLAG_BOOTSTRAP;
        }
        if piggyback_chunks {
            flags |= FLAG_PIGGYBACK_CHUNKS;
        }

        // When the chunk table does not fit the header, it travels in its own
        // pinned block and the header carries that block's handle.
        let mut chunk_block: Option<RmaHandle> = None;
        if !piggyback_chunks {
            let mut chunk_region: PinnedRegion = match region_pool.reserve() {
                Ok(region) => region,
                Err(e) => {
                    this.release_regions();
                    return Err(e);
                },
            };
            let table_len: usize = match encode_chunk_table(&descriptors, chunk_region.as_mut_slice()) {
                Ok(len) => len,
                Err(e) => {
                    this.release_regions();
                    return Err(e);
                },
            };
            chunk_region.set_message_length(table_len);
            chunk_block = Some(RmaHandle {
                key: chunk_region.remote_key(),
                addr: chunk_region.address(),
                len: table_len as u32,
            });
            this.chunk_region = Some(chunk_region);
        }

        let mut header: MessageHeader = MessageHeader {
            flags: flags | FLAG_PIGGYBACK_MESSAGE,
            tag: this.id,
            message_length: body.len() as u32,
            chunks: if piggyback_chunks { descriptors } else { Vec::new() },
            chunk_block,
            message_rma: None,
        };

        // The piggyback path carries header and body in one message, bounded
        // by the header-region budget. Exactly equal fits; one byte more
        // demotes the message to the RDMA-fetch layout.
        let budget: usize = header_budget.min(header_region.capacity());
        let piggyback_message: bool = header.encoded_len() + body.len() <= budget;
        if !piggyback_message {
            header.flags &= !FLAG_PIGGYBACK_MESSAGE;
            header.message_rma = Some(RmaHandle {
                key: message_region.remote_key(),
                addr: message_region.address(),
                len: body.len() as u32,
            });
        }

        this.header_region = Some(header_region);
        let header_len: usize = {
            let region: &mut PinnedRegion = this.header_region.as_mut().expect("header region was just leased");
            match header.write(region.as_mut_slice()) {
                Ok(len) => len,
                Err(e) => {
                    this.message_region = Some(message_region);
                    this.release_regions();
                    return Err(e);
                },
            }
        };
        if let Some(region) = this.header_region.as_mut() {
            region.set_message_length(header_len);
        }
        this.message_region = Some(message_region);

        // One completion for the posted send; a second when the receiver must
        // RDMA-fetch the body and/or chunks and acknowledge.
        this.completion_count = 1;
        if !this.rma_regions.is_empty() || rma_chunks > 0 || !piggyback_message {
            this.completion_count = 2;
        }
        this.piggyback = piggyback_message;
        this.state = SenderState::Prepared;

        trace!(
            "prepare(): id={:?}, piggyback={:?}, completion_count={:?}, header_len={:?}, body_len={:?}",
            this.id,
            this.piggyback,
            this.completion_count,
            header_len,
            body.len()
        );
        Ok(())
    }

    /// Posts the message once. Returns the transport's code: 0 on success,
    /// a negative errno otherwise.
    pub fn try_post(&mut self, transport: &mut dyn FabricTransport) -> i32 {
        debug_assert!(matches!(self.state, SenderState::Prepared | SenderState::Posted));
        let this: &mut Sender = self.0.as_mut();
        let header: &PinnedRegion = this.header_region.as_ref().expect("prepared sender has a header region");

        let ret: i32 = if this.piggyback {
            let message: &PinnedRegion = this
                .message_region
                .as_ref()
                .expect("prepared sender has a message region");
            debug_assert!(header.message_length() + message.message_length() <= header.capacity());
            // One vector send carries both regions into a single receive.
            transport.sendv(
                &[header.as_slice(), message.as_slice()],
                &[header.local_key(), message.local_key()],
                this.dest,
                this.id,
            )
        } else {
            // Header-only send; the receiver fetches the body by its remote
            // key.
            transport.send(header.as_slice(), header.local_key(), this.dest, this.id)
        };

        if ret == 0 {
            this.state = SenderState::Posted;
        }
        ret
    }

    /// Accounts one successful completion event. Returns true when the
    /// sender is done and should be cleaned up.
    pub fn process_completion(&mut self) -> bool {
        let this: &mut Sender = self.0.as_mut();
        if this.completion_count == 0 {
            warn!("process_completion(): spurious completion (id={:?})", this.id);
            return false;
        }
        this.completion_count -= 1;
        if this.completion_count > 0 {
            this.state = SenderState::WaitingAck;
            return false;
        }
        true
    }

    /// Fires the user handler and releases every pinned region, returning
    /// the sender to its idle state.
    pub fn complete(&mut self) {
        let this: &mut Sender = self.0.as_mut();
        if let Some(handler) = this.handler.take() {
            handler(Ok(()));
        }
        this.release_regions();
        this.state = SenderState::Idle;
    }

    /// Fails the in-flight message: releases the regions and reports `error`
    /// through the user handler.
    pub fn fail(&mut self, error: Fail) {
        let this: &mut Sender = self.0.as_mut();
        if let Some(handler) = this.handler.take() {
            handler(Err(error));
        }
        this.release_regions();
        this.completion_count = 0;
        this.state = SenderState::Idle;
    }
}

impl Sender {
    fn release_regions(&mut self) {
        self.header_region = None;
        self.message_region = None;
        self.chunk_region = None;
        self.rma_regions.clear();
    }
}

impl SenderPool {
    /// Creates a pool of `size` idle senders.
    pub fn new(size: usize) -> Self {
        let mut free: Vec<SharedSender> = Vec::with_capacity(size);
        for id in 1..=size as u64 {
            free.push(SharedSender::new(id));
        }
        Self(SharedObject::new(SenderPoolState { free }))
    }

    /// Takes an idle sender out of the pool.
    pub fn reserve(&mut self) -> Result<SharedSender, Fail> {
        match self.0.as_mut().free.pop() {
            Some(sender) => Ok(sender),
            None => {
                let cause: &str = "no idle senders available";
                error!("reserve(): {}", cause);
                Err(Fail::new(libc::EAGAIN, cause))
            },
        }
    }

    /// Returns a completed sender to the pool. A pooled sender owns no
    /// pinned regions.
    pub fn release(&mut self, sender: SharedSender) {
        debug_assert!(!sender.owns_regions());
        debug_assert_eq!(sender.state(), SenderState::Idle);
        self.0.as_mut().free.push(sender);
    }

    /// Number of idle senders.
    pub fn len(&self) -> usize {
        self.0.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.free.is_empty()
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Encodes a chunk table into a pinned block, using the same entry layout as
/// the header's inline table.
fn encode_chunk_table(descriptors: &[ChunkDescriptor], out: &mut [u8]) -> Result<usize, Fail> {
    let header: MessageHeader = MessageHeader {
        flags: FLAG_PIGGYBACK_CHUNKS | FLAG_PIGGYBACK_MESSAGE,
        tag: 0,
        message_length: 0,
        chunks: descriptors.to_vec(),
        chunk_block: None,
        message_rma: None,
    };
    header.write(out)
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Deref for SharedSender {
    type Target = Sender;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for SharedSender {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.0.deref_mut()
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
