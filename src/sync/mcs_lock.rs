// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Mellor-Crummey & Scott queue lock for cooperative tasks.
//!
//! Acquiring tasks append a per-acquisition node to an atomic tail pointer
//! and spin on their own cache line, so the lock admits waiters strictly in
//! arrival order and contended waiting never bounces the tail line. The
//! waiter loop backs off through [yield_k], so a task that cannot acquire the
//! lock yields its worker instead of blocking it.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    fail::Fail,
    scheduler::{
        yield_k,
        Yielder,
    },
};
use ::std::{
    hint,
    ptr::{
        self,
        NonNull,
    },
    sync::atomic::{
        AtomicBool,
        AtomicPtr,
        Ordering,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Pads its content to a full cache line so that a waiter spinning on its own
/// node never shares the line with its neighbor's state.
#[repr(align(64))]
struct CachePadded<T>(T);

/// One waiter's slot in the queue. Lives on the heap for the duration of the
/// hold: suspended tasks have no stable stack frame to link into the queue.
struct McsNode {
    /// Spun on by the owning waiter; cleared by the predecessor on unlock.
    locked: CachePadded<AtomicBool>,
    /// Published by the successor after it appends itself at the tail.
    next: CachePadded<AtomicPtr<McsNode>>,
}

/// MCS queue lock.
pub struct McsLock {
    /// The most recently enqueued waiter, or null when the lock is free.
    tail: AtomicPtr<McsNode>,
}

/// Exclusive access to the resource guarded by an [McsLock]. Releases the
/// lock when dropped.
pub struct McsGuard<'a> {
    lock: &'a McsLock,
    node: NonNull<McsNode>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl McsNode {
    fn allocate() -> NonNull<McsNode> {
        NonNull::from(Box::leak(Box::new(McsNode {
            locked: CachePadded(AtomicBool::new(false)),
            next: CachePadded(AtomicPtr::new(ptr::null_mut())),
        })))
    }
}

impl McsLock {
    pub fn new() -> Self {
        Self {
            tail: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Acquires the lock, yielding cooperatively while a predecessor holds
    /// it. Waiters are admitted in the order they enqueue. Cancellation while
    /// waiting still completes the acquisition, then releases and reports the
    /// cancellation: a waiter cannot abandon its queue slot without breaking
    /// the successor chain.
    pub async fn lock(&self, yielder: &Yielder) -> Result<McsGuard<'_>, Fail> {
        let node: NonNull<McsNode> = McsNode::allocate();

        // Atomically append our node at the tail of the queue; the previous
        // tail, if any, is our predecessor.
        let prev: *mut McsNode = self.tail.swap(node.as_ptr(), Ordering::Acquire);
        if !prev.is_null() {
            unsafe { node.as_ref() }.locked.0.store(true, Ordering::Relaxed);

            // Let the predecessor find us on unlock.
            unsafe { (*prev).next.0.store(node.as_ptr(), Ordering::Release) };

            // Spin on our own locked flag until the predecessor clears it.
            let mut cancelled: Option<Fail> = None;
            let mut k: usize = 0;
            while unsafe { node.as_ref() }.locked.0.load(Ordering::Acquire) {
                if let Err(e) = yield_k(k, yielder).await {
                    if cancelled.is_none() {
                        warn!("lock(): cancelled while enqueued, completing acquisition first");
                        cancelled = Some(e);
                    }
                }
                k += 1;
            }

            if let Some(e) = cancelled {
                drop(McsGuard { lock: self, node });
                return Err(e);
            }
        }

        Ok(McsGuard { lock: self, node })
    }

    /// Attempts to acquire the lock without waiting.
    pub fn try_lock(&self) -> Option<McsGuard<'_>> {
        let node: NonNull<McsNode> = McsNode::allocate();
        match self
            .tail
            .compare_exchange(ptr::null_mut(), node.as_ptr(), Ordering::Acquire, Ordering::Relaxed)
        {
            Ok(_) => Some(McsGuard { lock: self, node }),
            Err(_) => {
                // Never enqueued, so the node can be reclaimed right away.
                drop(unsafe { Box::from_raw(node.as_ptr()) });
                None
            },
        }
    }

    /// Acquires the lock with a pure busy-wait. Only for critical sections
    /// whose holders never suspend, where the wait is bounded by the length
    /// of the predecessor's straight-line critical section.
    pub fn acquire_spin(&self) -> McsGuard<'_> {
        let node: NonNull<McsNode> = McsNode::allocate();

        let prev: *mut McsNode = self.tail.swap(node.as_ptr(), Ordering::Acquire);
        if !prev.is_null() {
            unsafe { node.as_ref() }.locked.0.store(true, Ordering::Relaxed);
            unsafe { (*prev).next.0.store(node.as_ptr(), Ordering::Release) };
            while unsafe { node.as_ref() }.locked.0.load(Ordering::Acquire) {
                hint::spin_loop();
            }
        }

        McsGuard { lock: self, node }
    }

    /// Whether some task currently holds or waits for the lock.
    pub fn is_contended(&self) -> bool {
        !self.tail.load(Ordering::Relaxed).is_null()
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Default for McsLock {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for McsGuard<'_> {
    fn drop(&mut self) {
        let node: *mut McsNode = self.node.as_ptr();
        unsafe {
            if (*node).next.0.load(Ordering::Acquire).is_null() {
                // Either nobody is waiting, or a successor has swapped the
                // tail but not yet published itself. The CAS distinguishes
                // the two.
                if self
                    .lock
                    .tail
                    .compare_exchange(node, ptr::null_mut(), Ordering::Release, Ordering::Relaxed)
                    .is_ok()
                {
                    drop(Box::from_raw(node));
                    return;
                }

                // A successor is about to publish itself; its publication
                // strictly precedes our CAS failure, so this wait is bounded.
                while (*node).next.0.load(Ordering::Acquire).is_null() {
                    hint::spin_loop();
                }
            }

            let successor: *mut McsNode = (*node).next.0.load(Ordering::Acquire);
            (*successor).locked.0.store(false, Ordering::Release);
            (*node).next.0.store(ptr::null_mut(), Ordering::Relaxed);
            drop(Box::from_raw(node));
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
