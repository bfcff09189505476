// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Exports
//======================================================================================================================

pub mod config;
pub mod fail;
pub mod limits;
pub mod logging;
pub mod scheduler;
pub mod timer;

pub use self::{
    config::Config,
    timer::SharedTimer,
};

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    fail::Fail,
    scheduler::{
        Scheduler,
        TaskHandle,
        TaskWithResult,
    },
    timer::TimerToken,
};
use ::futures::future::FusedFuture;
use ::std::{
    any::Any,
    convert::{
        AsMut,
        AsRef,
    },
    ops::{
        Deref,
        DerefMut,
    },
    pin::Pin,
    rc::Rc,
    time::Instant,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// The SharedObject wraps an object that will be shared across coroutines.
pub struct SharedObject<T>(Rc<T>);

/// Many-Task Runtime
///
/// Owns the scheduler, the virtual clock, and the configuration. Long-lived
/// services (the symbol namespace, the parcelport) are constructed alongside
/// and passed explicitly to the operations that need them.
pub struct TaskRuntime {
    /// Scheduler.
    scheduler: Scheduler,
    /// Virtual clock for deadline wake-ups.
    timer: SharedTimer,
    /// Runtime configuration.
    config: Config,
}

#[derive(Clone)]
pub struct SharedTaskRuntime(SharedObject<TaskRuntime>);

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl<T> SharedObject<T> {
    pub fn new(object: T) -> Self {
        Self(Rc::new(object))
    }

    /// Number of live handles to the shared object.
    pub fn reference_count(&self) -> usize {
        Rc::strong_count(&self.0)
    }
}

impl SharedTaskRuntime {
    pub fn new(config: Config) -> Self {
        logging::initialize();
        Self(SharedObject::<TaskRuntime>::new(TaskRuntime {
            scheduler: Scheduler::default(),
            timer: SharedTimer::new(Instant::now()),
            config,
        }))
    }

    /// Inserts the coroutine named `task_name` into the scheduler.
    pub fn insert_coroutine<R: Unpin + Clone + Any>(
        &mut self,
        task_name: &str,
        coroutine: Pin<Box<dyn FusedFuture<Output = R>>>,
    ) -> Result<TaskHandle, Fail> {
        trace!("insert_coroutine(): name={:?}", task_name);
        let task: TaskWithResult<R> = TaskWithResult::new(task_name.to_string(), coroutine);
        match self.scheduler.insert(task) {
            Some(handle) => Ok(handle),
            None => {
                let cause: String = format!("cannot schedule coroutine (task_name={:?})", &task_name);
                error!("insert_coroutine(): {}", cause);
                Err(Fail::new(libc::EAGAIN, &cause))
            },
        }
    }

    /// Removes the completed coroutine associated with `handle` and returns
    /// its result.
    pub fn remove_coroutine<R: Unpin + Clone + Any>(&mut self, handle: &TaskHandle) -> Result<R, Fail> {
        let boxed_task: Box<dyn scheduler::Task> = match self.scheduler.remove(handle) {
            Some(boxed_task) => boxed_task,
            None => {
                let cause: String = format!("cannot remove coroutine (task_id={:?})", handle.get_task_id());
                error!("remove_coroutine(): {}", cause);
                return Err(Fail::new(libc::ESRCH, &cause));
            },
        };
        let task: TaskWithResult<R> = match TaskWithResult::<R>::try_from(boxed_task.as_any()) {
            Ok(task) => task,
            Err(_) => {
                let cause: &str = "coroutine has an unexpected result type";
                error!("remove_coroutine(): {}", cause);
                return Err(Fail::new(libc::EINVAL, cause));
            },
        };
        match task.get_result() {
            Some(result) => Ok(result),
            None => {
                let cause: &str = "coroutine has not completed";
                error!("remove_coroutine(): {}", cause);
                Err(Fail::new(libc::EBUSY, cause))
            },
        }
    }

    /// Performs a single poll on the underlying scheduler.
    pub fn poll(&mut self) {
        self.scheduler.poll()
    }

    /// Polls the scheduler until the coroutine associated with `handle`
    /// completes, then removes it and returns its result. `max_polls` bounds
    /// the number of scheduling rounds.
    pub fn run_until_complete<R: Unpin + Clone + Any>(
        &mut self,
        handle: &TaskHandle,
        max_polls: usize,
    ) -> Result<R, Fail> {
        for _ in 0..max_polls {
            if handle.has_completed() {
                return self.remove_coroutine(handle);
            }
            self.poll();
        }
        if handle.has_completed() {
            return self.remove_coroutine(handle);
        }
        let cause: String = format!("coroutine did not complete (task_id={:?})", handle.get_task_id());
        error!("run_until_complete(): {}", cause);
        Err(Fail::new(libc::ETIMEDOUT, &cause))
    }

    /// Returns a handle to the shared timer.
    pub fn get_timer(&self) -> SharedTimer {
        self.timer.clone()
    }

    /// Arms a deadline wake-up for a suspended coroutine.
    pub fn schedule_wake(&mut self, expiry: Instant, waiter: scheduler::YielderHandle) -> TimerToken {
        self.timer.schedule_wake(expiry, waiter)
    }

    /// Moves time forward deterministically.
    pub fn advance_clock(&mut self, now: Instant) {
        self.timer.advance_clock(now)
    }

    /// Gets the current time according to the internal timer.
    pub fn get_now(&self) -> Instant {
        self.timer.now()
    }

    /// Returns the runtime configuration.
    pub fn get_config(&self) -> &Config {
        &self.config
    }

    /// Number of tasks currently held by the scheduler.
    pub fn num_tasks(&self) -> usize {
        self.scheduler.num_tasks()
    }

    /// Tears the runtime down. Tasks still held by the scheduler at this
    /// point never ran to completion.
    pub fn teardown(&mut self) {
        let leftover: usize = self.scheduler.num_tasks();
        if leftover != 0 {
            warn!("teardown(): {} coroutines never completed", leftover);
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

/// Dereferences a shared object for use.
impl<T> Deref for SharedObject<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        self.0.deref()
    }
}

/// Dereferences a mutable reference to a shared object for use. This breaks Rust's ownership model because it allows
/// more than one mutable dereference of a shared object at a time. The runtime requires this because multiple
/// coroutines hold mutable references to shared objects at the same time; however, the runtime also ensures that only
/// one coroutine runs at a time. Due to this design, Rust's static borrow checker cannot ensure memory safety and we
/// have chosen not to use the dynamic borrow checker. Instead, shared objects should be used judiciously across
/// coroutines with the understanding that the shared object may change whenever the coroutine yields.
impl<T> DerefMut for SharedObject<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        let ptr: *mut T = Rc::as_ptr(&self.0) as *mut T;
        unsafe { &mut *ptr }
    }
}

impl<T> AsRef<T> for SharedObject<T> {
    fn as_ref(&self) -> &T {
        self.0.as_ref()
    }
}

impl<T> AsMut<T> for SharedObject<T> {
    fn as_mut(&mut self) -> &mut T {
        let ptr: *mut T = Rc::as_ptr(&self.0) as *mut T;
        unsafe { &mut *ptr }
    }
}

impl<T> Clone for SharedObject<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl Deref for SharedTaskRuntime {
    type Target = TaskRuntime;

    fn deref(&self) -> &Self::Target {
        self.0.deref()
    }
}

impl DerefMut for SharedTaskRuntime {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.0.deref_mut()
    }
}
