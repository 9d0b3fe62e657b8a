//! KSU manager lock
//!
//! OS-abstraction lock contract plus the RAII wrapper the manager keeps its
//! state in. Three implementations:
//! - [`NoLock`]: bare metal, single thread. Not `Sync`, so a manager built on
//!   it cannot be shared between threads.
//! - [`SpinLock`]: busy-waits on a `spin` mutex. Works without an OS.
//! - [`OsLock`] (feature `std`): blocking mutex + condition variable, yields
//!   to the host scheduler while waiting.

use core::cell::{Cell, UnsafeCell};
use core::fmt;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};

/// How long `take` may wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockTimeout {
    #[default]
    WaitForever,
    NonBlocking,
    /// Scheduler ticks (milliseconds for [`OsLock`], retries for [`SpinLock`]).
    Ticks(u32),
}

/// Lock errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockError {
    /// Held by someone else and the timeout did not allow waiting.
    Busy,
    /// Still held when the timeout expired.
    Timeout,
    /// `give` without a matching `take`.
    NotOwner,
    /// A holder panicked (OS lock only).
    Poisoned,
}

impl fmt::Display for LockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockError::Busy => write!(f, "Lock busy"),
            LockError::Timeout => write!(f, "Lock timed out"),
            LockError::NotOwner => write!(f, "Lock released without being held"),
            LockError::Poisoned => write!(f, "Lock poisoned"),
        }
    }
}

/// Mutual-exclusion primitive guarding the KSU slot table.
///
/// # Safety
///
/// After `take` returns `Ok`, no other `take` on the same lock may return
/// `Ok` until `give` has been called. The manager hands out `&mut` access to
/// its state on the strength of this.
pub unsafe trait KsuLock {
    /// One-time setup, called from `KsuManager::init`.
    fn init(&self) -> Result<(), LockError> {
        Ok(())
    }

    fn take(&self, timeout: LockTimeout) -> Result<(), LockError>;

    fn give(&self) -> Result<(), LockError>;

    /// Teardown, called when the manager is dropped.
    fn free(&self) -> Result<(), LockError> {
        Ok(())
    }

    /// True if `take` would succeed right now.
    fn is_accessible(&self) -> bool;
}

// =============================================================================
// NoLock
// =============================================================================

/// Pass-through lock for single-threaded builds.
#[derive(Debug, Default)]
pub struct NoLock {
    taken: Cell<bool>,
}

impl NoLock {
    pub const fn new() -> Self {
        Self {
            taken: Cell::new(false),
        }
    }
}

// SAFETY: `taken` rejects a second take, and `Cell` keeps the type on one
// thread.
unsafe impl KsuLock for NoLock {
    fn take(&self, _timeout: LockTimeout) -> Result<(), LockError> {
        // Waiting can only deadlock with a single thread.
        if self.taken.replace(true) {
            return Err(LockError::Busy);
        }
        Ok(())
    }

    fn give(&self) -> Result<(), LockError> {
        if !self.taken.replace(false) {
            return Err(LockError::NotOwner);
        }
        Ok(())
    }

    fn is_accessible(&self) -> bool {
        !self.taken.get()
    }
}

// =============================================================================
// SpinLock
// =============================================================================

/// Spinning lock for `no_std` targets with preemption.
#[derive(Debug, Default)]
pub struct SpinLock {
    inner: spin::Mutex<()>,
}

impl SpinLock {
    pub const fn new() -> Self {
        Self {
            inner: spin::Mutex::new(()),
        }
    }
}

// SAFETY: exclusion comes from the spin mutex; the guard is forgotten on take
// and the mutex force-unlocked on give.
unsafe impl KsuLock for SpinLock {
    fn take(&self, timeout: LockTimeout) -> Result<(), LockError> {
        match timeout {
            LockTimeout::WaitForever => {
                core::mem::forget(self.inner.lock());
                Ok(())
            }
            LockTimeout::NonBlocking => match self.inner.try_lock() {
                Some(guard) => {
                    core::mem::forget(guard);
                    Ok(())
                }
                None => Err(LockError::Busy),
            },
            LockTimeout::Ticks(ticks) => {
                for _ in 0..=ticks {
                    if let Some(guard) = self.inner.try_lock() {
                        core::mem::forget(guard);
                        return Ok(());
                    }
                    core::hint::spin_loop();
                }
                Err(LockError::Timeout)
            }
        }
    }

    fn give(&self) -> Result<(), LockError> {
        if !self.inner.is_locked() {
            return Err(LockError::NotOwner);
        }
        // SAFETY: the guard from `take` was forgotten, so this is the only
        // release of that acquisition.
        unsafe { self.inner.force_unlock() };
        Ok(())
    }

    fn is_accessible(&self) -> bool {
        !self.inner.is_locked()
    }
}

// =============================================================================
// OsLock
// =============================================================================

/// Blocking lock backed by the host OS.
#[cfg(feature = "std")]
#[derive(Debug, Default)]
pub struct OsLock {
    taken: std::sync::Mutex<bool>,
    released: std::sync::Condvar,
}

#[cfg(feature = "std")]
impl OsLock {
    pub const fn new() -> Self {
        Self {
            taken: std::sync::Mutex::new(false),
            released: std::sync::Condvar::new(),
        }
    }
}

// SAFETY: the `taken` flag is only flipped under the std mutex.
#[cfg(feature = "std")]
unsafe impl KsuLock for OsLock {
    fn take(&self, timeout: LockTimeout) -> Result<(), LockError> {
        let taken = self.taken.lock().map_err(|_| LockError::Poisoned)?;

        let mut taken = match timeout {
            LockTimeout::WaitForever => self
                .released
                .wait_while(taken, |taken| *taken)
                .map_err(|_| LockError::Poisoned)?,
            LockTimeout::NonBlocking => {
                if *taken {
                    return Err(LockError::Busy);
                }
                taken
            }
            LockTimeout::Ticks(ms) => {
                let (taken, result) = self
                    .released
                    .wait_timeout_while(
                        taken,
                        std::time::Duration::from_millis(u64::from(ms)),
                        |taken| *taken,
                    )
                    .map_err(|_| LockError::Poisoned)?;
                if result.timed_out() && *taken {
                    return Err(LockError::Timeout);
                }
                taken
            }
        };

        *taken = true;
        Ok(())
    }

    fn give(&self) -> Result<(), LockError> {
        let mut taken = self.taken.lock().map_err(|_| LockError::Poisoned)?;
        if !*taken {
            return Err(LockError::NotOwner);
        }
        *taken = false;
        drop(taken);
        self.released.notify_one();
        Ok(())
    }

    fn free(&self) -> Result<(), LockError> {
        match self.taken.lock() {
            Ok(taken) if *taken => Err(LockError::Busy),
            Ok(_) => Ok(()),
            Err(_) => Err(LockError::Poisoned),
        }
    }

    fn is_accessible(&self) -> bool {
        self.taken.lock().map(|taken| !*taken).unwrap_or(false)
    }
}

// =============================================================================
// KsuMutex
// =============================================================================

/// Data protected by a [`KsuLock`].
pub(crate) struct KsuMutex<L: KsuLock, T> {
    lock: L,
    data: UnsafeCell<T>,
}

// SAFETY: access to `data` only goes through `KsuGuard`, which exists only
// between a successful take and its give.
unsafe impl<L: KsuLock + Sync, T: Send> Sync for KsuMutex<L, T> {}

impl<L: KsuLock, T> KsuMutex<L, T> {
    pub(crate) const fn new(lock: L, data: T) -> Self {
        Self {
            lock,
            data: UnsafeCell::new(data),
        }
    }

    pub(crate) fn lock_ref(&self) -> &L {
        &self.lock
    }

    pub(crate) fn acquire(&self, timeout: LockTimeout) -> Result<KsuGuard<'_, L, T>, LockError> {
        self.lock.take(timeout)?;
        Ok(KsuGuard {
            mutex: self,
            _not_send: PhantomData,
        })
    }
}

impl<L: KsuLock, T> Drop for KsuMutex<L, T> {
    fn drop(&mut self) {
        if let Err(err) = self.lock.free() {
            log::warn!("KSU lock free failed: {}", err);
        }
    }
}

/// Scoped hold on a [`KsuMutex`]; released on drop, on every exit path.
pub(crate) struct KsuGuard<'a, L: KsuLock, T> {
    mutex: &'a KsuMutex<L, T>,
    // OS mutexes must be released by the thread that took them.
    _not_send: PhantomData<*const ()>,
}

impl<L: KsuLock, T> Deref for KsuGuard<'_, L, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the lock is held for the guard's lifetime.
        unsafe { &*self.mutex.data.get() }
    }
}

impl<L: KsuLock, T> DerefMut for KsuGuard<'_, L, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the lock is held for the guard's lifetime.
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<L: KsuLock, T> Drop for KsuGuard<'_, L, T> {
    fn drop(&mut self) {
        if let Err(err) = self.mutex.lock.give() {
            log::error!("KSU lock release failed: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_no_lock_rejects_second_take() {
        let lock = NoLock::new();
        assert!(lock.take(LockTimeout::WaitForever).is_ok());
        assert!(!lock.is_accessible());
        assert_eq!(lock.take(LockTimeout::NonBlocking), Err(LockError::Busy));
        assert!(lock.give().is_ok());
        assert_eq!(lock.give(), Err(LockError::NotOwner));
    }

    #[test]
    fn test_spin_lock_timeouts() {
        let lock = SpinLock::new();
        lock.take(LockTimeout::WaitForever).unwrap();

        assert_eq!(lock.take(LockTimeout::NonBlocking), Err(LockError::Busy));
        assert_eq!(lock.take(LockTimeout::Ticks(10)), Err(LockError::Timeout));

        lock.give().unwrap();
        assert!(lock.is_accessible());
        assert!(lock.take(LockTimeout::Ticks(0)).is_ok());
        lock.give().unwrap();
        assert_eq!(lock.give(), Err(LockError::NotOwner));
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let mutex = KsuMutex::new(SpinLock::new(), 0u32);
        {
            let mut guard = mutex.acquire(LockTimeout::WaitForever).unwrap();
            *guard += 1;
            assert!(!mutex.lock_ref().is_accessible());
            assert!(mutex.acquire(LockTimeout::NonBlocking).is_err());
        }
        assert!(mutex.lock_ref().is_accessible());
        assert_eq!(*mutex.acquire(LockTimeout::NonBlocking).unwrap(), 1);
    }

    #[test]
    fn test_guard_releases_on_early_return() {
        fn bump(mutex: &KsuMutex<NoLock, u32>, fail: bool) -> Result<(), ()> {
            let mut guard = mutex.acquire(LockTimeout::WaitForever).map_err(|_| ())?;
            if fail {
                return Err(());
            }
            *guard += 1;
            Ok(())
        }

        let mutex = KsuMutex::new(NoLock::new(), 0u32);
        assert!(bump(&mutex, true).is_err());
        assert!(bump(&mutex, false).is_ok());
        assert!(mutex.lock_ref().is_accessible());
    }

    #[test]
    fn test_spin_lock_serializes_threads() {
        let mutex = Arc::new(KsuMutex::new(SpinLock::new(), 0u64));
        let workers: std::vec::Vec<_> = (0..4)
            .map(|_| {
                let mutex = Arc::clone(&mutex);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        let mut guard = mutex.acquire(LockTimeout::WaitForever).unwrap();
                        let value = *guard;
                        core::hint::spin_loop();
                        *guard = value + 1;
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(*mutex.acquire(LockTimeout::NonBlocking).unwrap(), 4000);
    }

    #[cfg(feature = "std")]
    #[test]
    fn test_os_lock_blocks_until_given() {
        let lock = Arc::new(OsLock::new());
        lock.take(LockTimeout::WaitForever).unwrap();

        assert_eq!(lock.take(LockTimeout::Ticks(5)), Err(LockError::Timeout));
        assert_eq!(lock.free(), Err(LockError::Busy));

        let waiter = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                lock.take(LockTimeout::WaitForever).unwrap();
                lock.give().unwrap();
            })
        };
        thread::sleep(std::time::Duration::from_millis(10));
        lock.give().unwrap();
        waiter.join().unwrap();

        assert!(lock.is_accessible());
        assert!(lock.free().is_ok());
    }
}
