//! The single coarse spinlock protecting all tracer slow paths.
//!
//! The hot path (appending an encoded event to a thread-local buffer) never
//! touches this lock; contention is limited to token refreshes, buffer
//! flushes, thread birth/death, and dump passes, all of which hold the lock
//! for microseconds. A `std::sync::Mutex` would work but may allocate or
//! syscall on contention, which is off-limits inside the traced allocator.

use std::{
  cell::UnsafeCell,
  ops::{Deref, DerefMut},
  sync::atomic::{AtomicBool, Ordering},
};

use crossbeam_utils::{Backoff, CachePadded};

/// A test-and-test-and-set spinlock owning the data it guards.
pub struct SpinLock<T> {
  locked: CachePadded<AtomicBool>,
  value: UnsafeCell<T>,
}

// SAFETY: the lock serializes all access to `value`.
unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
  #[must_use]
  pub const fn new(value: T) -> Self {
    Self {
      locked: CachePadded::new(AtomicBool::new(false)),
      value: UnsafeCell::new(value),
    }
  }

  /// Spin until the lock is acquired.
  pub fn lock(&self) -> SpinGuard<'_, T> {
    let backoff = Backoff::new();

    loop {
      if self
        .locked
        .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
        .is_ok()
      {
        return SpinGuard { lock: self };
      }

      while self.locked.load(Ordering::Relaxed) {
        backoff.snooze();
      }
    }
  }

  /// Acquire the lock only if it is free right now.
  pub fn try_lock(&self) -> Option<SpinGuard<'_, T>> {
    self
      .locked
      .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
      .ok()
      .map(|_| SpinGuard { lock: self })
  }
}

/// RAII guard; the lock is released on all exit paths when this drops.
pub struct SpinGuard<'a, T> {
  lock: &'a SpinLock<T>,
}

impl<T> Deref for SpinGuard<'_, T> {
  type Target = T;

  fn deref(&self) -> &T {
    // SAFETY: the guard holds the lock.
    unsafe { &*self.lock.value.get() }
  }
}

impl<T> DerefMut for SpinGuard<'_, T> {
  fn deref_mut(&mut self) -> &mut T {
    // SAFETY: the guard holds the lock exclusively.
    unsafe { &mut *self.lock.value.get() }
  }
}

impl<T> Drop for SpinGuard<'_, T> {
  fn drop(&mut self) {
    self.lock.locked.store(false, Ordering::Release);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::{sync::Arc, thread};

  #[test]
  fn guards_exclusive_access() {
    let lock = Arc::new(SpinLock::new(0u64));
    let mut handles = Vec::new();

    for _ in 0..8 {
      let lock = Arc::clone(&lock);
      handles.push(thread::spawn(move || {
        for _ in 0..10_000 {
          *lock.lock() += 1;
        }
      }));
    }

    for handle in handles {
      handle.join().expect("worker panicked");
    }

    assert_eq!(*lock.lock(), 80_000);
  }

  #[test]
  fn try_lock_fails_while_held() {
    let lock = SpinLock::new(());
    let guard = lock.lock();
    assert!(lock.try_lock().is_none());
    drop(guard);
    assert!(lock.try_lock().is_some());
  }
}
