// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Waker pages: per-64-task state bitmaps and the raw-waker machinery that
//! notifies them.
//!
//! A [WakerPage] holds the status of up to 64 tasks in the scheduler as
//! bitmaps (notified, completed, dropped). The page is 64 bytes large and
//! 64-byte aligned, which lets a raw waker pointer encode both the page base
//! address and the task's offset within the page: the scheduler hands out
//! `base + ix` as the waker data pointer and recovers `(base, ix)` by
//! realigning.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::scheduler::waker64::{
    Waker64,
    WAKER_BIT_LENGTH,
};
use ::std::{
    alloc::{
        alloc,
        dealloc,
        handle_alloc_error,
        Layout,
    },
    mem,
    ops::Deref,
    ptr::{
        self,
        NonNull,
    },
    task::{
        RawWaker,
        RawWakerVTable,
    },
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Size of a waker page (in bytes).
pub const WAKER_PAGE_SIZE: usize = 64;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Waker Page
///
/// The number of bytes in this structure matches the number of bits in a
/// [Waker64], and the structure is aligned to its own size. Both properties
/// are load-bearing for the raw-waker pointer encoding described in the module
/// documentation.
#[repr(align(64))]
pub struct WakerPage {
    /// Reference count for the page.
    refcount: Waker64,
    /// Flags whether or not a given task has been notified.
    notified: Waker64,
    /// Flags whether or not a given task has completed.
    completed: Waker64,
    /// Flags whether or not a given task has been dropped.
    dropped: Waker64,
    /// Padding required to make the structure 64 bytes big.
    _unused: [u8; 32],
}

/// Waker Page Reference
///
/// Manually reference-counted pointer to a [WakerPage].
pub struct WakerPageRef(NonNull<WakerPage>);

/// Waker Reference
///
/// Representation of the status slot of one particular task inside a
/// [WakerPage]; carries the encoded `base + ix` pointer.
#[repr(transparent)]
pub struct WakerRef(NonNull<u8>);

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl WakerPage {
    /// Sets the notification flag for the `ix` task in the target [WakerPage].
    pub fn notify(&self, ix: usize) {
        debug_assert!(ix < WAKER_BIT_LENGTH);
        self.notified.fetch_or(1 << ix);
    }

    /// Takes out notification flags in the target [WakerPage].
    /// Notification flags are reset after this operation.
    pub fn take_notified(&self) -> u64 {
        // Unset all completed bits, since spurious notifications for completed
        // tasks would lead us to poll them after completion.
        let mut notified: u64 = self.notified.swap(0);
        notified &= !self.completed.load();
        notified &= !self.dropped.load();
        notified
    }

    /// Queries whether the completed flag for the `ix` task is set.
    pub fn has_completed(&self, ix: usize) -> bool {
        debug_assert!(ix < WAKER_BIT_LENGTH);
        self.completed.load() & (1 << ix) != 0
    }

    /// Sets the completed flag for the `ix` task in the target [WakerPage].
    pub fn mark_completed(&self, ix: usize) {
        debug_assert!(ix < WAKER_BIT_LENGTH);
        self.completed.fetch_or(1 << ix);
    }

    /// Resets all flags in the target [WakerPage].
    /// The reference count for the target page is reset to one.
    pub fn reset(&mut self) {
        self.refcount.swap(1);
        self.notified.swap(0);
        self.completed.swap(0);
        self.dropped.swap(0);
    }

    /// Initializes flags for the `ix` task in the target [WakerPage].
    pub fn initialize(&self, ix: usize) {
        debug_assert!(ix < WAKER_BIT_LENGTH);
        self.notified.fetch_or(1 << ix);
        self.completed.fetch_and(!(1 << ix));
        self.dropped.fetch_and(!(1 << ix));
    }

    /// Clears flags for the `ix` task in the target [WakerPage].
    /// The reference count for the target page is left unmodified.
    pub fn clear(&self, ix: usize) {
        debug_assert!(ix < WAKER_BIT_LENGTH);
        let mask: u64 = !(1 << ix);
        self.notified.fetch_and(mask);
        self.completed.fetch_and(mask);
        self.dropped.fetch_and(mask);
    }

    /// Increments the reference count of the target [WakerPage].
    /// The old reference count is returned.
    pub fn refcount_inc(&self) -> u64 {
        self.refcount.fetch_add(1)
    }

    /// Decrements the reference count of the target [WakerPage].
    /// Upon successful completion, the old reference count is returned.
    pub fn refcount_dec(&self) -> Option<u64> {
        self.refcount.fetch_sub(1)
    }

    #[cfg(test)]
    pub fn refcount_get(&self) -> u64 {
        self.refcount.load()
    }
}

impl WakerPageRef {
    /// Creates a new waker page reference from a non-null pointer to a
    /// [WakerPage].
    pub fn new(waker_page: NonNull<WakerPage>) -> Self {
        Self(waker_page)
    }

    /// Encodes the status slot of the `ix` task as a raw pointer suitable for
    /// a [RawWaker]. The returned pointer addresses `base + ix`; it is not
    /// meant to be dereferenced, only realigned back to the page base.
    /// Bumps the page reference count on behalf of the waker.
    pub fn into_raw_waker_ref(&self, ix: usize) -> NonNull<u8> {
        debug_assert!(ix < WAKER_BIT_LENGTH);

        // Bump the refcount of the underlying waker page.
        let self_: WakerPageRef = self.clone();
        mem::forget(self_);

        unsafe {
            let base_ptr: *mut u8 = self.0.as_ptr().cast();
            NonNull::new_unchecked(base_ptr.add(ix))
        }
    }
}

impl WakerRef {
    pub fn new(raw_page_ref: NonNull<u8>) -> Self {
        Self(raw_page_ref)
    }

    /// Decodes the target [WakerRef] back into a pointer to its [WakerPage]
    /// plus the offset identifying the task within the page.
    fn base_ptr(&self) -> (NonNull<WakerPage>, usize) {
        let ptr: *mut u8 = self.0.as_ptr();
        let forward_offset: usize = ptr.align_offset(WAKER_PAGE_SIZE);
        let mut base_ptr: *mut u8 = ptr;
        let mut offset: usize = 0;
        if forward_offset != 0 {
            offset = WAKER_PAGE_SIZE - forward_offset;
            base_ptr = ptr.wrapping_sub(offset);
        }
        unsafe { (NonNull::new_unchecked(base_ptr).cast(), offset) }
    }

    /// Sets the notification flag for the task associated with this waker.
    fn wake_by_ref(&self) {
        let (base_ptr, ix): (NonNull<WakerPage>, usize) = self.base_ptr();
        let base: &WakerPage = unsafe { &*base_ptr.as_ptr() };
        base.notify(ix);
    }

    fn wake(self) {
        self.wake_by_ref()
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Default for WakerPage {
    fn default() -> Self {
        Self {
            refcount: Waker64::new(1),
            notified: Waker64::new(0),
            completed: Waker64::new(0),
            dropped: Waker64::new(0),
            _unused: Default::default(),
        }
    }
}

impl Clone for WakerPageRef {
    fn clone(&self) -> Self {
        let old_refcount: u64 = unsafe { self.0.as_ref().refcount_inc() };
        debug_assert!(old_refcount < u64::MAX);
        Self(self.0)
    }
}

impl Drop for WakerPageRef {
    fn drop(&mut self) {
        match unsafe { self.0.as_ref().refcount_dec() } {
            Some(1) => unsafe {
                let layout: Layout = Layout::new::<WakerPage>();
                ptr::drop_in_place(self.0.as_mut());
                dealloc(self.0.as_ptr().cast(), layout);
            },
            Some(_) => {},
            None => panic!("double free on waker page {:?}", self.0),
        }
    }
}

impl Deref for WakerPageRef {
    type Target = WakerPage;

    fn deref(&self) -> &WakerPage {
        unsafe { self.0.as_ref() }
    }
}

impl Default for WakerPageRef {
    fn default() -> Self {
        let layout: Layout = Layout::new::<WakerPage>();
        assert_eq!(layout.align(), WAKER_PAGE_SIZE);
        let raw: *mut u8 = unsafe { alloc(layout) };
        let mut ptr: NonNull<WakerPage> = match NonNull::new(raw.cast::<WakerPage>()) {
            Some(ptr) => ptr,
            None => handle_alloc_error(layout),
        };
        unsafe {
            ptr::write(ptr.as_ptr(), WakerPage::default());
            let page: &mut WakerPage = ptr.as_mut();
            page.reset();
        }
        Self(ptr)
    }
}

impl Clone for WakerRef {
    fn clone(&self) -> Self {
        let (base_ptr, _): (NonNull<WakerPage>, _) = self.base_ptr();
        let p: WakerPageRef = WakerPageRef::new(base_ptr);
        // Increment reference count.
        mem::forget(p.clone());
        // This is not a double increment.
        mem::forget(p);
        WakerRef(self.0)
    }
}

impl Drop for WakerRef {
    fn drop(&mut self) {
        let (base_ptr, _) = self.base_ptr();
        // Decrement the refcount.
        drop(WakerPageRef::new(base_ptr));
    }
}

impl From<WakerRef> for RawWaker {
    fn from(waker: WakerRef) -> RawWaker {
        let ptr: *const () = waker.0.cast().as_ptr() as *const ();
        let raw: RawWaker = RawWaker::new(ptr, &VTABLE);
        // The raw waker took over the reference.
        mem::forget(waker);
        raw
    }
}

/// Clones the waker that is associated with the target raw pointer.
unsafe fn waker_ref_clone(ptr: *const ()) -> RawWaker {
    let p: WakerRef = WakerRef(NonNull::new_unchecked(ptr as *const u8 as *mut u8));
    let q: WakerRef = p.clone();
    // Increment reference count.
    mem::forget(p);
    q.into()
}

/// Wakes up the task that is associated with the target raw pointer.
unsafe fn waker_ref_wake(ptr: *const ()) {
    let p: WakerRef = WakerRef(NonNull::new_unchecked(ptr as *const u8 as *mut u8));
    p.wake();
}

/// Wakes up the task that is associated with the target raw pointer.
unsafe fn waker_ref_wake_by_ref(ptr: *const ()) {
    let p: WakerRef = WakerRef(NonNull::new_unchecked(ptr as *const u8 as *mut u8));
    p.wake_by_ref();
    // The reference is still owned by the caller.
    mem::forget(p);
}

/// Drops the waker that is associated with the target raw pointer.
unsafe fn waker_ref_drop(ptr: *const ()) {
    let p: WakerRef = WakerRef(NonNull::new_unchecked(ptr as *const u8 as *mut u8));
    drop(p);
}

/// Raw waker vtable for waker references.
pub const VTABLE: RawWakerVTable =
    RawWakerVTable::new(waker_ref_clone, waker_ref_wake, waker_ref_wake_by_ref, waker_ref_drop);

//======================================================================================================================
// Unit Tests
//======================================================================================================================
