// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Condition variable for cooperative tasks.
//!
//! Waiters suspend under an externally held [McsLock], releasing it while
//! suspended and re-acquiring it before returning. The waiter queue stores
//! each task's identity ([YielderHandle]); a waiter that resumes for a reason
//! other than a notification (timeout, cancellation) unlinks its own entry.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    runtime::{
        fail::Fail,
        scheduler::{
            Yielder,
            YielderHandle,
        },
        timer::{
            SharedTimer,
            TimerToken,
        },
        SharedObject,
    },
    sync::mcs_lock::{
        McsGuard,
        McsLock,
    },
};
use ::std::{
    collections::VecDeque,
    mem,
    ops::{
        Deref,
        DerefMut,
    },
    time::Instant,
};

//======================================================================================================================
// Enumerations
//======================================================================================================================

/// Scheduling hint attached to a notification.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WakePriority {
    Default,
    Boost,
}

/// Why a timed wait returned.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WaitStatus {
    Signaled,
    Timeout,
}

//======================================================================================================================
// Structures
//======================================================================================================================

/// One suspended waiter. The identity is taken out when the waiter is
/// serviced; an entry whose identity is already vacated is a consistency
/// violation surfaced as `EFAULT`.
struct WaitEntry {
    id: u64,
    waiter: Option<YielderHandle>,
}

/// Queue of suspended waiters.
pub struct ConditionVariable {
    queue: VecDeque<WaitEntry>,
    last_id: u64,
}

#[derive(Clone)]
pub struct SharedConditionVariable(SharedObject<ConditionVariable>);

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl SharedConditionVariable {
    /// Suspends the current task until notified. The mutex `guard` is
    /// released while the task is suspended; the mutex is re-acquired before
    /// this function returns with the new guard.
    pub async fn wait<'m>(
        &mut self,
        mutex: &'m McsLock,
        guard: McsGuard<'m>,
        yielder: &Yielder,
    ) -> Result<McsGuard<'m>, Fail> {
        let id: u64 = self.enqueue_waiter(yielder.get_handle());

        // Release the mutex while suspended.
        drop(guard);

        let result: Result<(), Fail> = yielder.yield_until_wake().await;
        match result {
            Ok(()) => mutex.lock(yielder).await,
            Err(e) => {
                // Woken by cancellation rather than a notification, so our
                // entry may still be queued.
                self.remove_waiter(id);
                Err(e)
            },
        }
    }

    /// As [Self::wait], returning [WaitStatus::Timeout] if `deadline` elapses
    /// on the runtime clock before a notification arrives.
    pub async fn wait_until<'m>(
        &mut self,
        mutex: &'m McsLock,
        guard: McsGuard<'m>,
        deadline: Instant,
        mut timer: SharedTimer,
        yielder: &Yielder,
    ) -> Result<(WaitStatus, McsGuard<'m>), Fail> {
        let id: u64 = self.enqueue_waiter(yielder.get_handle());
        let token: TimerToken = timer.schedule_wake(deadline, yielder.get_handle());

        drop(guard);

        let result: Result<(), Fail> = yielder.yield_until_wake().await;
        token.cancel();
        match result {
            Ok(()) => {
                let guard: McsGuard<'m> = mutex.lock(yielder).await?;
                Ok((WaitStatus::Signaled, guard))
            },
            Err(e) if e.is_timeout() => {
                // The waiter is still in the queue until notify_* removes it,
                // so the timeout path must unlink the entry itself.
                self.remove_waiter(id);
                let guard: McsGuard<'m> = mutex.lock(yielder).await?;
                Ok((WaitStatus::Timeout, guard))
            },
            Err(e) => {
                self.remove_waiter(id);
                Err(e)
            },
        }
    }

    /// Resumes the frontmost waiter, if any. Returns whether more waiters
    /// remain queued.
    pub fn notify_one(&mut self, priority: WakePriority) -> Result<bool, Fail> {
        match self.queue.pop_front() {
            None => Ok(false),
            Some(mut entry) => match entry.waiter.take() {
                Some(mut waiter) => {
                    trace!("notify_one(): id={:?}, priority={:?}", entry.id, priority);
                    waiter.wake_with(Ok(()));
                    Ok(!self.queue.is_empty())
                },
                None => {
                    let cause: &str = "null waiter identity encountered";
                    error!("notify_one(): {}", cause);
                    Err(Fail::new(libc::EFAULT, cause))
                },
            },
        }
    }

    /// Resumes every currently enqueued waiter. Waiters that enqueue during
    /// the notification are left for the next call. On encountering a
    /// vacated identity, the remaining entries are restored and the error is
    /// reported.
    pub fn notify_all(&mut self, priority: WakePriority) -> Result<(), Fail> {
        // Swap the queue so that concurrent arrivals go to a fresh one.
        let mut queue: VecDeque<WaitEntry> = mem::take(&mut self.queue);

        while let Some(mut entry) = queue.pop_front() {
            match entry.waiter.take() {
                Some(mut waiter) => {
                    trace!("notify_all(): id={:?}, priority={:?}", entry.id, priority);
                    waiter.wake_with(Ok(()));
                },
                None => {
                    self.prepend_entries(queue);
                    let cause: &str = "null waiter identity encountered";
                    error!("notify_all(): {}", cause);
                    return Err(Fail::new(libc::EFAULT, cause));
                },
            }
        }

        Ok(())
    }

    /// Forces every waiter to resume with a cancellation status. Used during
    /// shutdown.
    pub fn abort_all(&mut self) {
        // New waiters might enqueue while we are aborting.
        while !self.queue.is_empty() {
            let mut queue: VecDeque<WaitEntry> = mem::take(&mut self.queue);
            while let Some(mut entry) = queue.pop_front() {
                match entry.waiter.take() {
                    Some(mut waiter) => {
                        waiter.wake_with(Err(Fail::new(libc::ECANCELED, "condition variable aborted")))
                    },
                    None => {
                        warn!("abort_all(): null waiter identity encountered");
                        continue;
                    },
                }
            }
        }
    }

    /// Number of currently enqueued waiters.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    fn enqueue_waiter(&mut self, waiter: YielderHandle) -> u64 {
        self.last_id += 1;
        let id: u64 = self.last_id;
        self.queue.push_back(WaitEntry { id, waiter: Some(waiter) });
        id
    }

    fn remove_waiter(&mut self, id: u64) {
        self.queue.retain(|entry| entry.id != id);
    }

    /// Re-adds the remaining swapped-out entries ahead of any newly enqueued
    /// waiters.
    fn prepend_entries(&mut self, mut queue: VecDeque<WaitEntry>) {
        queue.extend(self.queue.drain(..));
        self.queue = queue;
    }

    #[cfg(test)]
    fn push_vacated_entry(&mut self) {
        self.last_id += 1;
        let id: u64 = self.last_id;
        self.queue.push_back(WaitEntry { id, waiter: None });
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Default for SharedConditionVariable {
    fn default() -> Self {
        Self(SharedObject::new(ConditionVariable {
            queue: VecDeque::new(),
            last_id: 0,
        }))
    }
}

impl Deref for SharedConditionVariable {
    type Target = ConditionVariable;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for SharedConditionVariable {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.0.deref_mut()
    }
}

impl Drop for ConditionVariable {
    fn drop(&mut self) {
        if !self.queue.is_empty() {
            error!("drop(): condition variable queue is not empty, aborting waiters");
            while let Some(mut entry) = self.queue.pop_front() {
                if let Some(mut waiter) = entry.waiter.take() {
                    waiter.wake_with(Err(Fail::new(libc::ECANCELED, "condition variable destroyed")));
                }
            }
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::{
        SharedConditionVariable,
        WakePriority,
    };
    use ::anyhow::Result;

    #[test]
    fn notify_one_on_empty_queue_returns_false() -> Result<()> {
        let mut cond_var: SharedConditionVariable = SharedConditionVariable::default();
        crate::ensure_eq!(cond_var.notify_one(WakePriority::Default)?, false);
        Ok(())
    }

    #[test]
    fn notify_all_on_empty_queue_is_ok() -> Result<()> {
        let mut cond_var: SharedConditionVariable = SharedConditionVariable::default();
        crate::ensure_eq!(cond_var.notify_all(WakePriority::Default).is_ok(), true);
        Ok(())
    }

    #[test]
    fn notify_one_reports_vacated_identity() -> Result<()> {
        let mut cond_var: SharedConditionVariable = SharedConditionVariable::default();
        cond_var.push_vacated_entry();
        let e = match cond_var.notify_one(WakePriority::Default) {
            Err(e) => e,
            Ok(_) => anyhow::bail!("notify_one() must fail on a vacated identity"),
        };
        crate::ensure_eq!(e.errno, libc::EFAULT);
        Ok(())
    }

    #[test]
    fn notify_all_restores_queue_on_vacated_identity() -> Result<()> {
        let mut cond_var: SharedConditionVariable = SharedConditionVariable::default();
        cond_var.push_vacated_entry();
        let e = match cond_var.notify_all(WakePriority::Default) {
            Err(e) => e,
            Ok(_) => anyhow::bail!("notify_all() must fail on a vacated identity"),
        };
        crate::ensure_eq!(e.errno, libc::EFAULT);
        // The vacated entry itself was consumed; nothing else was queued.
        crate::ensure_eq!(cond_var.len(), 0);
        Ok(())
    }
}
