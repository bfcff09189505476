// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Fabric layer: pinned memory, wire headers, the sender engine and the
//! parcelport service that ties them to a transport.
//!
//! The transport itself is a collaborator reached through [FabricTransport],
//! which mirrors the libfabric entry points the engine consumes (`fi_send`,
//! `fi_sendv`, completion-queue polling) and their error codes. The bundled
//! [LoopbackTransport] routes messages back into the local process, which is
//! how the simulated multi-locality world exchanges parcels.

pub mod header;
pub mod memory;
pub mod parcelport;
pub mod sender;

//======================================================================================================================
// Exports
//======================================================================================================================

pub use self::{
    header::{
        ChunkDescriptor,
        MessageHeader,
        RmaHandle,
    },
    memory::{
        PinnedRegion,
        RegionPool,
        SharedFabricDomain,
    },
    parcelport::SharedParcelport,
    sender::{
        Chunk,
        SendBuffer,
        SenderPool,
        SharedSender,
    },
};

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    fail::Fail,
    SharedObject,
};
use ::std::collections::VecDeque;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Fabric-level address of a destination endpoint.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct FabricAddress(pub u64);

/// One completion-queue event. `context` is the sender identity passed at
/// post time; an error entry describes the failed operation.
pub struct CompletionEvent {
    pub context: u64,
    pub error: Option<Fail>,
}

/// One message surfaced on the receive side: header bytes plus, on the
/// piggyback path, the body.
pub struct DeliveredMessage {
    pub bytes: Vec<u8>,
}

struct LoopbackState {
    deliveries: VecDeque<DeliveredMessage>,
    completions: VecDeque<CompletionEvent>,
    /// Return codes forced onto upcoming send/sendv calls.
    inject: VecDeque<i32>,
    /// Number of upcoming sends that will be accepted but fail in the
    /// completion queue (no delivery, an error completion instead).
    fail_sends: usize,
    sends_posted: u64,
    acks_posted: u64,
}

/// In-process transport: every send is delivered back to the local process
/// and immediately generates a success completion for the poster.
#[derive(Clone)]
pub struct LoopbackTransport(SharedObject<LoopbackState>);

//======================================================================================================================
// Traits
//======================================================================================================================

/// Wire-level transport consumed by the send engine. Return codes follow the
/// libfabric convention: 0 means posted, `-EAGAIN` asks for a retry,
/// `-ENOENT` means the destination is unknown, anything else is fatal.
pub trait FabricTransport {
    fn send(&mut self, buf: &[u8], desc: u64, dest: FabricAddress, context: u64) -> i32;
    fn sendv(&mut self, bufs: &[&[u8]; 2], descs: &[u64; 2], dest: FabricAddress, context: u64) -> i32;
    /// Drains one completion-queue event, if any.
    fn poll_completion(&mut self) -> Option<CompletionEvent>;
    /// Drains one received message, if any.
    fn poll_delivery(&mut self) -> Option<DeliveredMessage>;
    /// Receiver-side acknowledgement: completes the second completion of the
    /// sender identified by `context`.
    fn post_ack(&mut self, context: u64);
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl LoopbackTransport {
    pub fn new() -> Self {
        Self(SharedObject::new(LoopbackState {
            deliveries: VecDeque::new(),
            completions: VecDeque::new(),
            inject: VecDeque::new(),
            fail_sends: 0,
            sends_posted: 0,
            acks_posted: 0,
        }))
    }

    /// Forces `code` as the return value of the next send/sendv call. Codes
    /// queue up; a zero means "behave normally".
    pub fn inject_return_code(&mut self, code: i32) {
        self.0.as_mut().inject.push_back(code);
    }

    /// Makes the next send be accepted but fail afterwards: the message is
    /// not delivered and the completion queue reports an error entry for it.
    pub fn inject_failed_send(&mut self) {
        self.0.as_mut().fail_sends += 1;
    }

    pub fn sends_posted(&self) -> u64 {
        self.0.sends_posted
    }

    pub fn acks_posted(&self) -> u64 {
        self.0.acks_posted
    }

    fn accept(&mut self, bytes: Vec<u8>, context: u64) {
        let this: &mut LoopbackState = self.0.as_mut();
        this.sends_posted += 1;
        if this.fail_sends > 0 {
            this.fail_sends -= 1;
            this.completions.push_back(CompletionEvent {
                context,
                error: Some(Fail::new(libc::EIO, "completion queue error entry")),
            });
            return;
        }
        this.deliveries.push_back(DeliveredMessage { bytes });
        this.completions.push_back(CompletionEvent { context, error: None });
    }

    fn take_injected(&mut self) -> Option<i32> {
        match self.0.as_mut().inject.pop_front() {
            Some(0) | None => None,
            Some(code) => Some(code),
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl FabricTransport for LoopbackTransport {
    fn send(&mut self, buf: &[u8], _desc: u64, _dest: FabricAddress, context: u64) -> i32 {
        if let Some(code) = self.take_injected() {
            return code;
        }
        self.accept(buf.to_vec(), context);
        0
    }

    fn sendv(&mut self, bufs: &[&[u8]; 2], _descs: &[u64; 2], _dest: FabricAddress, context: u64) -> i32 {
        if let Some(code) = self.take_injected() {
            return code;
        }
        let mut bytes: Vec<u8> = Vec::with_capacity(bufs[0].len() + bufs[1].len());
        bytes.extend_from_slice(bufs[0]);
        bytes.extend_from_slice(bufs[1]);
        self.accept(bytes, context);
        0
    }

    fn poll_completion(&mut self) -> Option<CompletionEvent> {
        self.0.as_mut().completions.pop_front()
    }

    fn poll_delivery(&mut self) -> Option<DeliveredMessage> {
        self.0.as_mut().deliveries.pop_front()
    }

    fn post_ack(&mut self, context: u64) {
        let this: &mut LoopbackState = self.0.as_mut();
        this.acks_posted += 1;
        this.completions.push_back(CompletionEvent { context, error: None });
    }
}
