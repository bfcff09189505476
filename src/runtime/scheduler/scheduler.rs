// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Implementation of the single-threaded task scheduler.
//!
//! Tasks are stored in a pinned memory slab and their runnable status lives in
//! [crate::runtime::scheduler::page::WakerPage]s. Wakers notify tasks by
//! flipping bits in those pages; `poll` walks the pages and polls exactly the
//! notified, not-yet-completed tasks.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    collections::pin_slab::PinSlab,
    runtime::scheduler::{
        page::{
            WakerPageRef,
            WakerRef,
        },
        waker64::{
            WAKER_BIT_LENGTH,
            WAKER_BIT_LENGTH_SHIFT,
        },
        Task,
        TaskHandle,
    },
};
use ::bit_iter::BitIter;
use ::rand::{
    rngs::SmallRng,
    RngCore,
    SeedableRng,
};
use ::std::{
    collections::HashMap,
    future::Future,
    pin::Pin,
    ptr::NonNull,
    task::{
        Context,
        Poll,
        Waker,
    },
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Seed for the random number generator used to generate task ids.
/// This value was chosen arbitrarily.
#[cfg(debug_assertions)]
const SCHEDULER_SEED: u64 = 42;
const MAX_NUM_TASKS: usize = 16000;
const MAX_RETRIES_TASK_ID_ALLOC: usize = 500;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Task Scheduler
pub struct Scheduler {
    /// Stores all the tasks that are held by the scheduler.
    tasks: PinSlab<Box<dyn Task>>,
    /// Maps between externally meaningful ids and the index of the task in the slab.
    task_ids: HashMap<u64, usize>,
    /// Holds the waker bits for controlling task scheduling.
    waker_page_refs: Vec<WakerPageRef>,
    /// Small random number generator for task ids.
    rng: SmallRng,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Scheduler {
    /// Given a handle to a task, remove it from the scheduler.
    pub fn remove(&mut self, handle: &TaskHandle) -> Option<Box<dyn Task>> {
        let task_id: u64 = handle.get_task_id();
        // We should not have a handle that refers to an invalid id, so unwrap and expect are safe here.
        let pin_slab_index: usize = self
            .task_ids
            .remove(&task_id)
            .expect("token should be in the token table");
        let (waker_page_ref, waker_page_offset): (&WakerPageRef, usize) = {
            let (waker_page_index, waker_page_offset) = self.get_waker_page_index_and_offset(pin_slab_index);
            (&self.waker_page_refs[waker_page_index], waker_page_offset)
        };
        waker_page_ref.clear(waker_page_offset);
        if let Some(task) = self.tasks.remove_unpin(pin_slab_index) {
            trace!(
                "remove(): name={:?}, id={:?}, pin_slab_index={:?}",
                task.get_name(),
                task_id,
                pin_slab_index
            );
            Some(task)
        } else {
            warn!("unable to unpin and remove: id={:?}, pin_slab_index={:?}", task_id, pin_slab_index);
            None
        }
    }

    /// Given a task id, return a handle to the task.
    pub fn from_task_id(&self, task_id: u64) -> Option<TaskHandle> {
        let pin_slab_index: usize = *self.task_ids.get(&task_id)?;
        self.tasks.get(pin_slab_index)?;
        let (waker_page_index, _) = self.get_waker_page_index_and_offset(pin_slab_index);
        let waker_page_ref: &WakerPageRef = &self.waker_page_refs[waker_page_index];
        Some(TaskHandle::new(task_id, pin_slab_index, waker_page_ref.clone()))
    }

    /// Insert a new task into the scheduler, returning a handle corresponding to it.
    pub fn insert<F: Task>(&mut self, future: F) -> Option<TaskHandle> {
        self.panic_if_too_many_tasks();

        let task_name: String = future.get_name();
        // The pin slab index can be reverse-computed in a page index and an offset within the page.
        let pin_slab_index: usize = self.tasks.insert(Box::new(future))?;
        let task_id: u64 = self.get_new_task_id(pin_slab_index);

        self.add_new_pages_up_to_pin_slab_index(pin_slab_index);

        // Initialize the appropriate page offset.
        let (waker_page_ref, waker_page_offset): (&WakerPageRef, usize) = {
            let (waker_page_index, waker_page_offset) = self.get_waker_page_index_and_offset(pin_slab_index);
            (&self.waker_page_refs[waker_page_index], waker_page_offset)
        };
        waker_page_ref.initialize(waker_page_offset);

        trace!(
            "insert(): name={:?}, id={:?}, pin_slab_index={:?}",
            task_name,
            task_id,
            pin_slab_index
        );
        Some(TaskHandle::new(task_id, pin_slab_index, waker_page_ref.clone()))
    }

    /// Generate a new id. If the id is currently in use, keep generating until we find an unused one.
    fn get_new_task_id(&mut self, pin_slab_index: usize) -> u64 {
        for _ in 0..MAX_RETRIES_TASK_ID_ALLOC {
            let new_task_id: u64 = self.rng.next_u64() as u16 as u64;
            if !self.task_ids.contains_key(&new_task_id) {
                self.task_ids.insert(new_task_id, pin_slab_index);
                return new_task_id;
            }
        }
        panic!("could not find a valid task id");
    }

    /// If the address space for task ids is close to half full, it will become increasingly difficult to avoid
    /// collisions, so we cap the number of tasks.
    fn panic_if_too_many_tasks(&self) {
        if self.task_ids.len() > MAX_NUM_TASKS {
            panic!("too many concurrent tasks");
        }
    }

    /// Computes the page and page offset of a given task based on its total offset.
    fn get_waker_page_index_and_offset(&self, pin_slab_index: usize) -> (usize, usize) {
        let waker_page_index: usize = pin_slab_index >> WAKER_BIT_LENGTH_SHIFT;
        let waker_page_offset: usize = Self::get_waker_page_offset(pin_slab_index);
        (waker_page_index, waker_page_offset)
    }

    /// Add new page(s) to hold this task's status if the current page is filled. This may result in addition of
    /// multiple pages because of the gap between the pin slab index and the current page index.
    fn add_new_pages_up_to_pin_slab_index(&mut self, pin_slab_index: usize) {
        while pin_slab_index >= (self.waker_page_refs.len() << WAKER_BIT_LENGTH_SHIFT) {
            self.waker_page_refs.push(WakerPageRef::default());
        }
    }

    /// Poll all tasks which are ready to run. Events that unblock a task invoke its waker, which flips the
    /// notification bit for the task; here we collect those bits and poll the corresponding tasks.
    pub fn poll(&mut self) {
        let num_waker_pages: usize = self.waker_page_refs.len();
        for waker_page_index in 0..num_waker_pages {
            let notified_offsets: u64 = self.waker_page_refs[waker_page_index].take_notified();
            self.poll_notified_tasks(waker_page_index, notified_offsets);
        }
    }

    /// Number of tasks currently stored in the scheduler.
    pub fn num_tasks(&self) -> usize {
        self.task_ids.len()
    }

    fn poll_notified_tasks(&mut self, waker_page_index: usize, notified_offsets: u64) {
        for waker_page_offset in BitIter::from(notified_offsets) {
            // Get the pinned ref.
            let pinned_ptr = {
                let pin_slab_index: usize = Self::get_pin_slab_index(waker_page_index, waker_page_offset);
                let pinned_ref: Pin<&mut Box<dyn Task>> = match self.tasks.get_pin_mut(pin_slab_index) {
                    Some(pinned_ref) => pinned_ref,
                    // Task was removed between notification and this poll round.
                    None => continue,
                };
                unsafe { Pin::into_inner_unchecked(pinned_ref) as *mut Box<dyn Task> }
            };
            let pinned_ref: Pin<&mut Box<dyn Task>> = unsafe { Pin::new_unchecked(&mut *pinned_ptr) };

            // Get the waker context.
            let waker: Waker = unsafe {
                let raw_waker: NonNull<u8> = self.waker_page_refs[waker_page_index].into_raw_waker_ref(waker_page_offset);
                Waker::from_raw(WakerRef::new(raw_waker).into())
            };
            let mut waker_context: Context = Context::from_waker(&waker);

            // Poll the task.
            let poll_result: Poll<()> = Future::poll(pinned_ref, &mut waker_context);
            if let Poll::Ready(()) = poll_result {
                self.waker_page_refs[waker_page_index].mark_completed(waker_page_offset)
            }
        }
    }

    fn get_waker_page_offset(pin_slab_index: usize) -> usize {
        pin_slab_index & (WAKER_BIT_LENGTH - 1)
    }

    fn get_pin_slab_index(waker_page_index: usize, waker_page_offset: usize) -> usize {
        (waker_page_index << WAKER_BIT_LENGTH_SHIFT) + waker_page_offset
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Default for Scheduler {
    /// Creates a scheduler with default values.
    fn default() -> Self {
        Self {
            tasks: PinSlab::new(),
            task_ids: HashMap::<u64, usize>::new(),
            waker_page_refs: vec![],
            #[cfg(debug_assertions)]
            rng: SmallRng::seed_from_u64(SCHEDULER_SEED),
            #[cfg(not(debug_assertions))]
            rng: SmallRng::from_entropy(),
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use crate::runtime::scheduler::{
        task::TaskWithResult,
        Scheduler,
        TaskHandle,
    };
    use ::anyhow::Result;
    use ::futures::FutureExt;
    use ::std::{
        future::Future,
        pin::Pin,
        task::{
            Context,
            Poll,
            Waker,
        },
    };

    #[derive(Default)]
    struct DummyCoroutine {
        pub val: usize,
    }

    impl DummyCoroutine {
        pub fn new(val: usize) -> Self {
            Self { val }
        }
    }

    impl Future for DummyCoroutine {
        type Output = ();

        fn poll(self: Pin<&mut Self>, ctx: &mut Context) -> Poll<Self::Output> {
            match self.as_ref().val & 1 {
                0 => Poll::Ready(()),
                _ => {
                    self.get_mut().val += 1;
                    let waker: &Waker = ctx.waker();
                    waker.wake_by_ref();
                    Poll::Pending
                },
            }
        }
    }

    type DummyTask = TaskWithResult<()>;

    fn dummy_task(val: usize) -> DummyTask {
        DummyTask::new(String::from("testing"), Box::pin(DummyCoroutine::new(val).fuse()))
    }

    /// Tests that when inserting multiple tasks into the scheduler, each gets a unique identifier.
    #[test]
    fn insert_creates_unique_task_ids() -> Result<()> {
        let mut scheduler: Scheduler = Scheduler::default();

        let handle: TaskHandle = match scheduler.insert(dummy_task(0)) {
            Some(handle) => handle,
            None => anyhow::bail!("insert() failed"),
        };
        let handle2: TaskHandle = match scheduler.insert(dummy_task(0)) {
            Some(handle) => handle,
            None => anyhow::bail!("insert() failed"),
        };
        crate::ensure_neq!(handle2.get_task_id(), handle.get_task_id());

        Ok(())
    }

    #[test]
    fn poll_once_with_one_small_task_completes_it() -> Result<()> {
        let mut scheduler: Scheduler = Scheduler::default();

        let handle: TaskHandle = match scheduler.insert(dummy_task(0)) {
            Some(handle) => handle,
            None => anyhow::bail!("insert() failed"),
        };

        // All tasks are inserted in the scheduler with the notification flag set.
        scheduler.poll();

        crate::ensure_eq!(handle.has_completed(), true);

        Ok(())
    }

    #[test]
    fn poll_twice_with_one_long_task_completes_it() -> Result<()> {
        let mut scheduler: Scheduler = Scheduler::default();

        let handle: TaskHandle = match scheduler.insert(dummy_task(1)) {
            Some(handle) => handle,
            None => anyhow::bail!("insert() failed"),
        };

        // By polling once, this task should make a transition.
        scheduler.poll();

        crate::ensure_eq!(handle.has_completed(), false);

        // This shall make the task ready.
        scheduler.poll();

        crate::ensure_eq!(handle.has_completed(), true);

        Ok(())
    }

    #[test]
    fn remove_removes_task_id() -> Result<()> {
        let mut scheduler: Scheduler = Scheduler::default();
        const NUM_TASKS: usize = 1024;
        let mut handles: Vec<TaskHandle> = Vec::<TaskHandle>::with_capacity(NUM_TASKS);

        crate::ensure_eq!(scheduler.num_tasks(), 0);

        for val in 0..NUM_TASKS {
            let handle: TaskHandle = match scheduler.insert(dummy_task(val)) {
                Some(handle) => handle,
                None => panic!("insert() failed"),
            };
            handles.push(handle);
        }

        // This poll is required to give the opportunity for all the tasks to complete.
        scheduler.poll();

        // Remove tasks one by one and check if remove is only removing the requested task.
        let mut curr_num_tasks: usize = NUM_TASKS;
        for handle in handles.iter() {
            scheduler.remove(handle);
            curr_num_tasks -= 1;
            crate::ensure_eq!(scheduler.num_tasks(), curr_num_tasks);
        }

        crate::ensure_eq!(scheduler.num_tasks(), 0);

        Ok(())
    }

    #[test]
    fn from_task_id_returns_none_for_non_existing_task_id() -> Result<()> {
        let scheduler: Scheduler = Scheduler::default();
        if scheduler.from_task_id(0).is_some() {
            anyhow::bail!("from_task_id() must return None");
        }
        Ok(())
    }

    #[test]
    fn from_task_id_returns_correct_task_handle() -> Result<()> {
        let mut scheduler: Scheduler = Scheduler::default();
        let handle: TaskHandle = match scheduler.insert(dummy_task(42)) {
            Some(handle) => handle,
            None => anyhow::bail!("insert() failed"),
        };
        let task_id: u64 = handle.get_task_id();
        match scheduler.from_task_id(task_id) {
            Some(retrieved) => crate::ensure_eq!(task_id, retrieved.get_task_id()),
            None => anyhow::bail!("from_task_id() must not return None"),
        }
        Ok(())
    }
}
