// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! The parcelport service: sender pool, completion pump, and tag-dispatched
//! parcel delivery.
//!
//! Outgoing parcels lease a sender from the pool; the post loop runs as a
//! coroutine so that a transport "try again" yields cooperatively instead of
//! blocking the worker. `background_work` drains received messages (fetching
//! non-piggybacked bodies through the domain, the receiver-side equivalent of
//! an RDMA read, and acknowledging them) and completion events, returning
//! finished senders to the pool.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    fabric::{
        header::MessageHeader,
        memory::{
            RegionPool,
            SharedFabricDomain,
        },
        sender::{
            SendBuffer,
            SenderPool,
            SharedSender,
        },
        CompletionEvent,
        DeliveredMessage,
        FabricTransport,
    },
    future::{
        Promise,
        TaskFuture,
    },
    runtime::{
        config::Config,
        fail::Fail,
        limits,
        scheduler::Yielder,
        timer::SharedTimer,
        SharedObject,
        SharedTaskRuntime,
    },
    serialization::ReadArchive,
};
use ::futures::{
    future::FusedFuture,
    FutureExt,
};
use ::std::{
    collections::{
        HashMap,
        VecDeque,
    },
    pin::Pin,
    time::Duration,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Handler for one kind of incoming parcel, keyed by the tag at the front of
/// the parcel body.
pub type ParcelHandler = Box<dyn Fn(&mut SharedParcelport, &mut ReadArchive) -> Result<(), Fail>>;

pub struct Parcelport {
    transport: Box<dyn FabricTransport>,
    domain: SharedFabricDomain,
    region_pool: RegionPool,
    sender_pool: SenderPool,
    /// Senders between post and final completion, by sender id.
    in_flight: HashMap<u64, SharedSender>,
    /// Senders whose error-path re-post hit `-EAGAIN`.
    retry: VecDeque<u64>,
    handlers: HashMap<u32, ParcelHandler>,
    timer: SharedTimer,
    header_budget: usize,
    sends_posted: u64,
    sends_completed: u64,
    parcels_delivered: u64,
    delivered_by_tag: HashMap<u32, u64>,
}

#[derive(Clone)]
pub struct SharedParcelport(SharedObject<Parcelport>);

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl SharedParcelport {
    pub fn new(config: &Config, timer: SharedTimer, transport: Box<dyn FabricTransport>) -> Self {
        let domain: SharedFabricDomain = SharedFabricDomain::new();
        // Header regions and message regions come from the same pool; two to
        // three regions per in-flight sender.
        let region_count: usize = config.sender_pool_size * 3;
        let region_size: usize = config.header_region_size.max(limits::MESSAGE_REGION_SIZE);
        let region_pool: RegionPool = RegionPool::new(domain.clone(), region_size, region_count);
        Self(SharedObject::new(Parcelport {
            transport,
            domain,
            region_pool,
            sender_pool: SenderPool::new(config.sender_pool_size),
            in_flight: HashMap::new(),
            retry: VecDeque::new(),
            handlers: HashMap::new(),
            timer,
            header_budget: config.header_region_size,
            sends_posted: 0,
            sends_completed: 0,
            parcels_delivered: 0,
            delivered_by_tag: HashMap::new(),
        }))
    }

    /// Registers the handler for parcels tagged `tag`.
    pub fn register_handler(&mut self, tag: u32, handler: ParcelHandler) {
        if self.0.as_mut().handlers.insert(tag, handler).is_some() {
            warn!("register_handler(): replacing handler (tag={:?})", tag);
        }
    }

    /// Hands one outgoing parcel to the send engine. The returned future
    /// completes once every completion event for the message has arrived (or
    /// resolves to the failure reported by the engine).
    pub fn put_parcel(
        &mut self,
        runtime: &mut SharedTaskRuntime,
        mut buffer: SendBuffer,
    ) -> Result<TaskFuture<()>, Fail> {
        let mut sender: SharedSender = self.0.as_mut().sender_pool.reserve()?;

        // Chain the caller's completion handler with the future resolution.
        let mut promise: Promise<()> = Promise::new();
        let future: TaskFuture<()> = promise.get_future()?;
        let user_handler = buffer.handler.take();
        buffer.handler = Some(Box::new(move |result: Result<(), Fail>| {
            if let Some(handler) = user_handler {
                handler(result.clone());
            }
            match result {
                Ok(()) => {
                    let _ = promise.set_value(());
                },
                Err(e) => {
                    let _ = promise.set_error(e);
                },
            }
        }));

        {
            let this: &mut Parcelport = self.0.as_mut();
            let mut region_pool: RegionPool = this.region_pool.clone();
            let mut domain: SharedFabricDomain = this.domain.clone();
            if let Err(e) = sender.prepare(buffer, &mut region_pool, &mut domain, this.header_budget) {
                // Drains the stored handler so the completion future resolves.
                sender.fail(e.clone());
                this.sender_pool.release(sender);
                return Err(e);
            }
            this.in_flight.insert(sender.id(), sender.clone());
            this.sends_posted += 1;
        }

        // The post loop is a coroutine: a transport "try again" is a
        // suspension point, not a busy wait.
        let pp: SharedParcelport = self.clone();
        let coroutine: Pin<Box<dyn FusedFuture<Output = ()>>> = Box::pin(run_post(pp, sender).fuse());
        runtime.insert_coroutine("parcel_post", coroutine)?;
        Ok(future)
    }

    /// Pumps the transport: drains delivered messages and completion events,
    /// and re-posts senders whose error-path retry was deferred. Returns the
    /// number of events processed.
    pub fn background_work(&mut self) -> Result<usize, Fail> {
        let mut processed: usize = 0;

        // Error-path re-posts deferred on -EAGAIN.
        while let Some(id) = self.0.as_mut().retry.pop_front() {
            let mut sender: SharedSender = match self.0.in_flight.get(&id) {
                Some(sender) => sender.clone(),
                None => continue,
            };
            let ret: i32 = sender.try_post(self.0.as_mut().transport.as_mut());
            if ret == -libc::EAGAIN {
                self.0.as_mut().retry.push_back(id);
                break;
            } else if ret != 0 {
                self.fail_sender(&mut sender, Fail::new(libc::EIO, "fatal transport error on re-post"));
            }
            processed += 1;
        }

        while let Some(message) = self.0.as_mut().transport.poll_delivery() {
            self.handle_delivery(message)?;
            processed += 1;
        }

        while let Some(event) = self.0.as_mut().transport.poll_completion() {
            self.handle_completion(event);
            processed += 1;
        }

        Ok(processed)
    }

    /// Posts the sender's message once through the transport.
    pub(crate) fn try_post_sender(&mut self, sender: &mut SharedSender) -> i32 {
        sender.try_post(self.0.as_mut().transport.as_mut())
    }

    /// Fails an in-flight sender and returns it to the pool.
    pub(crate) fn fail_sender(&mut self, sender: &mut SharedSender, error: Fail) {
        let this: &mut Parcelport = self.0.as_mut();
        this.in_flight.remove(&sender.id());
        sender.fail(error);
        this.sender_pool.release(sender.clone());
    }

    pub fn get_timer(&self) -> SharedTimer {
        self.timer.clone()
    }

    /// Number of idle senders in the pool.
    pub fn idle_senders(&self) -> usize {
        self.sender_pool.len()
    }

    /// Number of senders between post and final completion.
    pub fn in_flight_senders(&self) -> usize {
        self.in_flight.len()
    }

    pub fn parcels_delivered(&self) -> u64 {
        self.parcels_delivered
    }

    /// Number of delivered parcels carrying `tag`.
    pub fn parcels_delivered_with_tag(&self, tag: u32) -> u64 {
        self.delivered_by_tag.get(&tag).copied().unwrap_or(0)
    }

    pub fn sends_completed(&self) -> u64 {
        self.sends_completed
    }

    /// Drops the registered handlers (and whatever they capture) and
    /// reports leftover in-flight senders. Bound to runtime teardown.
    pub fn teardown(&mut self) {
        let this: &mut Parcelport = self.0.as_mut();
        this.handlers.clear();
        if !this.in_flight.is_empty() {
            warn!("teardown(): {} senders still in flight", this.in_flight.len());
        }
    }

    fn handle_delivery(&mut self, message: DeliveredMessage) -> Result<(), Fail> {
        let (header, header_len): (MessageHeader, usize) = MessageHeader::read(&message.bytes)?;

        // Piggybacked bodies arrive in the same fabric message; otherwise the
        // header carries the remote key and we fetch the body ourselves.
        let body: Vec<u8> = if header.message_piggyback() {
            let end: usize = header_len + header.message_length as usize;
            if end > message.bytes.len() {
                let cause: &str = "piggybacked body is truncated";
                error!("handle_delivery(): {}", cause);
                return Err(Fail::new(libc::EINVAL, cause));
            }
            message.bytes[header_len..end].to_vec()
        } else {
            let rma = header.message_rma.ok_or_else(|| {
                let cause: &str = "non-piggybacked message without an RMA handle";
                error!("handle_delivery(): {}", cause);
                Fail::new(libc::EINVAL, cause)
            })?;
            self.0.domain.read_remote(rma.key, rma.addr, rma.len as usize)?
        };

        // Fetch the chunk table when it did not piggyback.
        if !header.chunks_piggyback() {
            if let Some(block) = header.chunk_block {
                let table: Vec<u8> = self.0.domain.read_remote(block.key, block.addr, block.len as usize)?;
                let (decoded, _): (MessageHeader, usize) = MessageHeader::read(&table)?;
                trace!("handle_delivery(): fetched chunk table ({} chunks)", decoded.chunks.len());
            }
        }

        // Acknowledge once everything has been fetched; this is the sender's
        // second completion.
        if header.expects_ack() {
            self.0.as_mut().transport.post_ack(header.tag);
        }

        self.0.as_mut().parcels_delivered += 1;

        let mut archive: ReadArchive = ReadArchive::new(&body)?;
        let tag: u32 = archive.read_u32()?;
        *self.0.as_mut().delivered_by_tag.entry(tag).or_insert(0) += 1;
        let mut pp: SharedParcelport = self.clone();
        match self.0.handlers.get(&tag) {
            Some(handler) => handler(&mut pp, &mut archive),
            None => {
                let cause: String = format!("no handler for parcel (tag={:?})", tag);
                error!("handle_delivery(): {}", cause);
                Err(Fail::new(libc::EINVAL, &cause))
            },
        }
    }

    fn handle_completion(&mut self, event: CompletionEvent) {
        let mut sender: SharedSender = match self.0.in_flight.get(&event.context) {
            Some(sender) => sender.clone(),
            None => {
                warn!("handle_completion(): unknown context (context={:?})", event.context);
                return;
            },
        };

        match event.error {
            Some(e) => {
                // The regions are still pinned; re-post the same payload.
                warn!("handle_completion(): completion error, re-posting (cause={:?})", e);
                let ret: i32 = sender.try_post(self.0.as_mut().transport.as_mut());
                if ret == -libc::EAGAIN {
                    self.0.as_mut().retry.push_back(sender.id());
                } else if ret != 0 {
                    self.fail_sender(&mut sender, Fail::new(libc::EIO, "fatal transport error on re-post"));
                }
            },
            None => {
                if sender.process_completion() {
                    let this: &mut Parcelport = self.0.as_mut();
                    this.in_flight.remove(&sender.id());
                    this.sends_completed += 1;
                    sender.complete();
                    this.sender_pool.release(sender);
                }
            },
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl ::std::ops::Deref for SharedParcelport {
    type Target = Parcelport;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Post loop for one sender: yields on "try again", waits a second between
/// attempts while the destination is unknown during bootstrap, and fails the
/// sender on anything fatal.
async fn run_post(mut pp: SharedParcelport, mut sender: SharedSender) {
    let yielder: Yielder = Yielder::new();
    loop {
        let ret: i32 = pp.try_post_sender(&mut sender);
        if ret == 0 {
            return;
        } else if ret == -libc::EAGAIN {
            debug!("run_post(): transport busy, re-posting (id={:?})", sender.id());
            if let Err(e) = yielder.yield_once().await {
                pp.fail_sender(&mut sender, e);
                return;
            }
        } else if ret == -libc::ENOENT {
            if sender.is_bootstrap() {
                warn!("run_post(): no destination endpoint (bootstrap), retrying after 1s");
                let timer: SharedTimer = pp.get_timer();
                if let Err(e) = timer.wait(Duration::from_secs(1), &yielder).await {
                    pp.fail_sender(&mut sender, e);
                    return;
                }
            } else {
                pp.fail_sender(&mut sender, Fail::new(libc::ENOENT, "no destination endpoint"));
                return;
            }
        } else {
            let cause: String = format!("fatal transport error (ret={:?})", ret);
            error!("run_post(): {}", cause);
            pp.fail_sender(&mut sender, Fail::new(libc::EIO, &cause));
            return;
        }
    }
}
