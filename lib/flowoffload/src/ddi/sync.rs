// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Safe abstractions for synchronization primitives.
//!
//! These mirror the kernel mutex/condvar APIs the engine was written
//! against, backed by their std counterparts. A poisoned lock is
//! recovered rather than propagated: every critical section in the
//! engine leaves its data consistent before any call that may panic.
use core::cell::UnsafeCell;
use core::ops::Deref;
use core::ops::DerefMut;
use core::time::Duration;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::thread::ThreadId;

/// A mutex.
///
/// We name it `KMutex` (Kernel Mutex) on purpose. The API for a kernel
/// mutex isn't quite the same as a userland `Mutex`: locking never
/// fails, and there is no poisoning to deal with at the call site.
pub struct KMutex<T> {
    inner: Mutex<T>,
}

pub struct KMutexGuard<'a, T: 'a> {
    guard: MutexGuard<'a, T>,
}

impl<T> Deref for KMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.guard.deref()
    }
}

impl<T> DerefMut for KMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.guard.deref_mut()
    }
}

impl<T> KMutex<T> {
    pub fn into_inner(self) -> T
    where
        T: Sized,
    {
        self.inner.into_inner().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create a new mutex, taking ownership of `val`. All access from
    /// here on out must be done by acquiring a `KMutexGuard` via the
    /// `lock()` method.
    pub fn new(val: T) -> Self {
        KMutex { inner: Mutex::new(val) }
    }

    /// Acquire the mutex guard to gain access to the underlying value.
    /// If the guard is currently held, then this call will block. The
    /// mutex is released when the guard is dropped.
    pub fn lock(&self) -> KMutexGuard<'_, T> {
        let guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        KMutexGuard { guard }
    }
}

impl<T: Default> Default for KMutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// A condition variable paired with a [`KMutex`].
pub struct KCondvar {
    cv: Condvar,
}

impl KCondvar {
    pub fn new() -> Self {
        Self { cv: Condvar::new() }
    }

    pub fn notify_one(&self) {
        self.cv.notify_one()
    }

    pub fn notify_all(&self) {
        self.cv.notify_all()
    }

    pub fn wait<'a, T: 'a>(
        &self,
        lock: KMutexGuard<'a, T>,
    ) -> KMutexGuard<'a, T> {
        let guard =
            self.cv.wait(lock.guard).unwrap_or_else(PoisonError::into_inner);
        KMutexGuard { guard }
    }

    /// Wait for a notification or for `timeout` to elapse, whichever
    /// comes first. Spurious wakeups are possible: the caller must
    /// recheck its condition.
    pub fn wait_timeout<'a, T: 'a>(
        &self,
        lock: KMutexGuard<'a, T>,
        timeout: Duration,
    ) -> KMutexGuard<'a, T> {
        let (guard, _) = self
            .cv
            .wait_timeout(lock.guard, timeout)
            .unwrap_or_else(PoisonError::into_inner);
        KMutexGuard { guard }
    }
}

impl Default for KCondvar {
    fn default() -> Self {
        Self::new()
    }
}

/// A mutual exclusion mechanism which loans out access to a single
/// internal token. This is used to ensure at most one thread is present
/// in a critical section *without actively holding a [`KMutex`]*.
///
/// The sweep of an offload table is such a section: it calls out to
/// the packet-filter framework and the hardware setup path, which may
/// block, and it must not run concurrently with itself.
pub struct TokenLock<T> {
    holder: KMutex<Option<ThreadId>>,
    cv: KCondvar,
    inner: UnsafeCell<T>,
}

// SAFETY: Access to `inner` is only ever granted through a `Token`,
// and at most one `Token` exists at a time.
unsafe impl<T: Send> Send for TokenLock<T> {}
unsafe impl<T: Send> Sync for TokenLock<T> {}

impl<T> TokenLock<T> {
    pub fn new(token: T) -> Self {
        let holder = KMutex::new(None);
        let cv = KCondvar::new();

        Self { holder, cv, inner: UnsafeCell::new(token) }
    }

    pub fn lock(&self) -> Token<'_, T> {
        let mut thread_lock = self.holder.lock();

        while thread_lock.is_some() {
            thread_lock = self.cv.wait(thread_lock);
        }

        *thread_lock = Some(std::thread::current().id());

        Token { lock: self }
    }

    /// Is the token currently loaned out?
    pub fn is_held(&self) -> bool {
        self.holder.lock().is_some()
    }
}

pub struct Token<'a, T> {
    lock: &'a TokenLock<T>,
}

impl<T> Deref for Token<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        // SAFETY: Only the thread indicated by `parent.holder`
        // can have a `Token`, thus we are safe to take a shared ref
        // (no other writers).
        unsafe { &*self.lock.inner.get() }
    }
}

impl<T> DerefMut for Token<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // SAFETY: Only the thread indicated by `parent.holder`
        // can have a `Token`, thus there are no other writers.
        // Rust has also guaranteed this is the only &mut to the Token
        // itself, so no other readers.
        unsafe { &mut *self.lock.inner.get() }
    }
}

impl<T> Drop for Token<'_, T> {
    fn drop(&mut self) {
        let mut thread_lock = self.lock.holder.lock();
        *thread_lock = None;
        self.lock.cv.notify_all();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use alloc::sync::Arc;
    use std::thread;

    #[test]
    fn token_is_exclusive() {
        let lock = Arc::new(TokenLock::new(0u64));
        let mut handles = vec![];

        for _ in 0..4 {
            let lock = lock.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    let mut tok = lock.lock();
                    *tok += 1;
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        assert!(!lock.is_held());
        assert_eq!(*lock.lock(), 4000);
    }

    #[test]
    fn wait_timeout_returns() {
        let m = KMutex::new(false);
        let cv = KCondvar::new();
        let guard = cv.wait_timeout(m.lock(), Duration::from_millis(10));
        assert!(!*guard);
    }
}
