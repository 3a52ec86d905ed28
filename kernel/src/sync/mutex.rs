//! Reentrant, owner-tracked kernel mutex.
//!
//! No wait queue: a contended `lock` spins with exponential backoff,
//! yields the CPU periodically, and gives up after a soft timeout
//! instead of deadlocking. `try_lock` is deliberately non-reentrant to
//! match conventional try-lock semantics.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::{
    config::{MUTEX_BACKOFF_CAP, MUTEX_TIMEOUT_MS, MUTEX_YIELD_EVERY},
    error::{KernelResult, SyncError},
    sched::{scheduler::current_task_id, TaskId},
    time,
};

pub struct KMutex {
    name: &'static str,
    locked: AtomicBool,
    /// Raw id of the owning task; 0 when unowned.
    owner: AtomicU32,
    recursion: AtomicU32,
}

impl KMutex {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            locked: AtomicBool::new(false),
            owner: AtomicU32::new(0),
            recursion: AtomicU32::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }

    pub fn owner(&self) -> Option<TaskId> {
        match self.owner.load(Ordering::Acquire) {
            0 => None,
            id => Some(TaskId(id)),
        }
    }

    pub fn recursion_count(&self) -> u32 {
        self.recursion.load(Ordering::Acquire)
    }

    /// Acquire the mutex for the calling task. Reentrant: the owner
    /// nests by incrementing the recursion count. Gives up with
    /// [`SyncError::Timeout`] after the soft deadline.
    pub fn lock(&self) -> KernelResult<()> {
        self.lock_from(current_task_id())
    }

    /// Attempt the lock without spinning. Rejects even the current
    /// owner (standard try-lock semantics).
    pub fn try_lock(&self) -> KernelResult<()> {
        self.try_lock_from(current_task_id())
    }

    /// Release one level of the lock. A non-owner release is logged and
    /// ignored.
    pub fn unlock(&self) {
        self.unlock_from(current_task_id());
    }

    pub(crate) fn lock_from(&self, me: TaskId) -> KernelResult<()> {
        // Reentrance: the owner walks straight in.
        if self.is_held_by(me) {
            self.recursion.fetch_add(1, Ordering::AcqRel);
            return Ok(());
        }

        let deadline = time::now_ms() + MUTEX_TIMEOUT_MS;
        let mut backoff: u32 = 1;
        let mut spins: u32 = 0;

        loop {
            if self
                .locked
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                self.owner.store(me.0, Ordering::Release);
                self.recursion.store(1, Ordering::Release);
                return Ok(());
            }

            for _ in 0..backoff {
                core::hint::spin_loop();
            }
            backoff = (backoff * 2).min(MUTEX_BACKOFF_CAP);

            spins += 1;
            if spins % MUTEX_YIELD_EVERY == 0 {
                yield_now();
            }

            if time::now_ms() >= deadline {
                log::warn!(
                    target: "sync",
                    "lock '{}' timed out after {} ms (owner {:?})",
                    self.name,
                    MUTEX_TIMEOUT_MS,
                    self.owner()
                );
                return Err(SyncError::Timeout { name: self.name }.into());
            }
        }
    }

    pub(crate) fn try_lock_from(&self, me: TaskId) -> KernelResult<()> {
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            self.owner.store(me.0, Ordering::Release);
            self.recursion.store(1, Ordering::Release);
            Ok(())
        } else {
            Err(SyncError::WouldBlock.into())
        }
    }

    pub(crate) fn unlock_from(&self, me: TaskId) {
        if !self.is_held_by(me) {
            log::warn!(
                target: "sync",
                "unlock of '{}' by non-owner {} (owner {:?})",
                self.name,
                me,
                self.owner()
            );
            return;
        }
        if self.recursion.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.owner.store(0, Ordering::Release);
            // The release store is the barrier that publishes everything
            // done under the lock to the next acquirer.
            self.locked.store(false, Ordering::Release);
        }
    }

    fn is_held_by(&self, me: TaskId) -> bool {
        self.locked.load(Ordering::Acquire) && self.owner.load(Ordering::Acquire) == me.0
    }
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
fn yield_now() {
    crate::sched::scheduler::task_yield();
}

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
fn yield_now() {
    std::thread::yield_now();
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn reentrance_counts_and_unwinds() {
        let m = KMutex::new("test");
        let me = TaskId(1);

        m.lock_from(me).unwrap();
        m.lock_from(me).unwrap();
        m.unlock_from(me);
        // Still locked at recursion 1.
        assert!(m.is_locked());
        assert_eq!(m.recursion_count(), 1);

        m.unlock_from(me);
        assert!(!m.is_locked());
        assert_eq!(m.recursion_count(), 0);
        assert_eq!(m.owner(), None);
    }

    #[test]
    fn locked_iff_recursion_positive() {
        let m = KMutex::new("inv");
        let me = TaskId(1);
        assert_eq!(m.is_locked(), m.recursion_count() > 0);
        m.lock_from(me).unwrap();
        assert_eq!(m.is_locked(), m.recursion_count() > 0);
        m.unlock_from(me);
        assert_eq!(m.is_locked(), m.recursion_count() > 0);
    }

    #[test]
    fn try_lock_rejects_everyone_when_held() {
        let m = KMutex::new("try");
        let me = TaskId(1);
        m.try_lock_from(me).unwrap();
        // Non-reentrant even for the owner.
        assert!(matches!(
            m.try_lock_from(me),
            Err(crate::KernelError::Sync(SyncError::WouldBlock))
        ));
        assert!(m.try_lock_from(TaskId(2)).is_err());
        m.unlock_from(me);
        assert!(m.try_lock_from(TaskId(2)).is_ok());
    }

    #[test]
    fn non_owner_unlock_is_ignored() {
        let m = KMutex::new("owner");
        m.lock_from(TaskId(1)).unwrap();
        m.unlock_from(TaskId(2));
        assert!(m.is_locked());
        assert_eq!(m.owner(), Some(TaskId(1)));
        m.unlock_from(TaskId(1));
        assert!(!m.is_locked());
    }

    #[test]
    fn contended_lock_times_out() {
        use std::sync::{
            atomic::{AtomicBool, Ordering as O},
            Arc,
        };

        let m = Arc::new(KMutex::new("contended"));
        m.lock_from(TaskId(1)).unwrap();

        // A helper thread advances the kernel clock past the soft
        // deadline while task 2 spins.
        let done = Arc::new(AtomicBool::new(false));
        let done2 = done.clone();
        let ticker = std::thread::spawn(move || {
            while !done2.load(O::Acquire) {
                crate::time::advance_ticks(50);
                std::thread::sleep(std::time::Duration::from_millis(1));
            }
        });

        let result = m.lock_from(TaskId(2));
        done.store(true, O::Release);
        ticker.join().unwrap();

        assert!(matches!(
            result,
            Err(crate::KernelError::Sync(SyncError::Timeout { .. }))
        ));
        // The owner is untouched by the failed acquisition.
        assert_eq!(m.owner(), Some(TaskId(1)));
        assert_eq!(m.recursion_count(), 1);
    }
}
