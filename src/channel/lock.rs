use crate::error::{Error, Result};
use crate::utils::lock;
use std::sync::{Condvar, Mutex, PoisonError};
use std::thread::{self, ThreadId};
use std::time::Duration;

#[derive(Debug, Default)]
struct Ownership {
    owner: Option<ThreadId>,
    depth: u32,
}

/// Recursive mutex with timed acquisition.
///
/// The owning thread may acquire it any number of times; it is free again
/// once every acquisition has been released. Other threads wait on a
/// condition variable until it is free or their timeout elapses.
#[derive(Debug, Default)]
pub struct RecursiveLock {
    state: Mutex<Ownership>,
    released: Condvar,
}

impl RecursiveLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// `Timeout` if another thread still holds the lock after `timeout`.
    pub fn acquire(&self, timeout: Duration) -> Result<()> {
        let me = thread::current().id();
        let state = lock(&self.state);
        let (mut state, _) = self
            .released
            .wait_timeout_while(state, timeout, |s| s.owner.is_some_and(|owner| owner != me))
            .unwrap_or_else(PoisonError::into_inner);

        if state.owner.is_some_and(|owner| owner != me) {
            return Err(Error::Timeout);
        }

        state.owner = Some(me);
        state.depth += 1;
        Ok(())
    }

    /// Drops one level of ownership. `Illegal` if the caller is not the owner.
    pub fn release(&self) -> Result<()> {
        let me = thread::current().id();
        let mut state = lock(&self.state);
        if state.owner != Some(me) || state.depth == 0 {
            return Err(Error::Illegal);
        }

        state.depth -= 1;
        if state.depth == 0 {
            state.owner = None;
            drop(state);
            self.released.notify_one();
        }
        Ok(())
    }

    /// Clears ownership regardless of holder and depth.
    pub fn force_release(&self) {
        let mut state = lock(&self.state);
        let was_held = state.owner.take().is_some();
        state.depth = 0;
        drop(state);
        if was_held {
            self.released.notify_all();
        }
    }

    pub fn is_locked(&self) -> bool {
        lock(&self.state).owner.is_some()
    }

    pub fn is_held_by_current_thread(&self) -> bool {
        lock(&self.state).owner == Some(thread::current().id())
    }

    pub fn depth(&self) -> u32 {
        lock(&self.state).depth
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn test_recursive_acquire_release() {
        let lock = RecursiveLock::new();
        lock.acquire(Duration::from_millis(10)).unwrap();
        lock.acquire(Duration::from_millis(10)).unwrap();
        assert_eq!(lock.depth(), 2);

        lock.release().unwrap();
        assert!(lock.is_locked());
        lock.release().unwrap();
        assert!(!lock.is_locked());
        assert_eq!(lock.release(), Err(Error::Illegal));
    }

    #[test]
    fn test_other_thread_times_out() {
        let lock = Arc::new(RecursiveLock::new());
        lock.acquire(Duration::from_millis(10)).unwrap();

        let contender = Arc::clone(&lock);
        let result = thread::spawn(move || {
            let start = Instant::now();
            let result = contender.acquire(Duration::from_millis(30));
            (result, start.elapsed())
        })
        .join()
        .unwrap();

        assert_eq!(result.0, Err(Error::Timeout));
        assert!(result.1 >= Duration::from_millis(30));
    }

    #[test]
    fn test_waiter_wakes_on_release() {
        let lock = Arc::new(RecursiveLock::new());
        lock.acquire(Duration::from_millis(10)).unwrap();

        let contender = Arc::clone(&lock);
        let waiter = thread::spawn(move || {
            let result = contender.acquire(Duration::from_secs(2));
            contender.release().unwrap();
            result
        });

        thread::sleep(Duration::from_millis(20));
        lock.release().unwrap();
        assert_eq!(waiter.join().unwrap(), Ok(()));
    }

    #[test]
    fn test_release_from_non_owner_is_illegal() {
        let lock = Arc::new(RecursiveLock::new());
        lock.acquire(Duration::from_millis(10)).unwrap();

        let other = Arc::clone(&lock);
        let result = thread::spawn(move || other.release()).join().unwrap();
        assert_eq!(result, Err(Error::Illegal));

        lock.force_release();
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_ownership_is_per_thread() {
        let lock = Arc::new(RecursiveLock::new());
        lock.acquire(Duration::from_millis(10)).unwrap();
        assert!(lock.is_held_by_current_thread());

        let other = Arc::clone(&lock);
        assert!(!thread::spawn(move || other.is_held_by_current_thread()).join().unwrap());

        lock.force_release();
        assert!(!lock.is_held_by_current_thread());
    }
}
