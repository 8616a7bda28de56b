//! Thread synchronization primitives
//!
//! Thin scoped wrappers over the POSIX semaphore, mutex and condition
//! variable. Each one acquires its kernel/libc resource at construction and
//! releases it on drop. The raw objects are boxed so their address stays
//! fixed after `*_init`, which POSIX requires.
//!
//! These are the only blocking primitives the worker pool, the connection
//! state machine and the database collaborator use.

use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::time::Duration;
use std::{io, mem, ptr};

use crate::error::{Result, ServerError};

// ============================================================================
// Semaphore
// ============================================================================

/// Counting semaphore.
pub struct Sem {
    sem: Box<UnsafeCell<libc::sem_t>>,
}

// sem_t is designed to be shared between threads once initialized.
unsafe impl Send for Sem {}
unsafe impl Sync for Sem {}

impl Sem {
    /// Semaphore with an initial count of zero.
    pub fn new() -> Result<Self> {
        Self::with_count(0)
    }

    pub fn with_count(count: u32) -> Result<Self> {
        let sem = Box::new(UnsafeCell::new(unsafe { mem::zeroed::<libc::sem_t>() }));
        if unsafe { libc::sem_init(sem.get(), 0, count) } != 0 {
            return Err(ServerError::Sync {
                what: "semaphore",
                source: io::Error::last_os_error(),
            });
        }
        Ok(Self { sem })
    }

    /// Block until the count is positive, then decrement it.
    pub fn wait(&self) -> io::Result<()> {
        loop {
            if unsafe { libc::sem_wait(self.sem.get()) } == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    /// Decrement without blocking. Returns false if the count was zero.
    pub fn try_wait(&self) -> bool {
        unsafe { libc::sem_trywait(self.sem.get()) == 0 }
    }

    /// Increment the count and wake one waiter.
    pub fn post(&self) -> io::Result<()> {
        if unsafe { libc::sem_post(self.sem.get()) } == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

impl Drop for Sem {
    fn drop(&mut self) {
        unsafe {
            libc::sem_destroy(self.sem.get());
        }
    }
}

// ============================================================================
// Mutex
// ============================================================================

/// Mutual-exclusion lock owning the data it protects.
///
/// Not re-entrant: locking twice from the same thread deadlocks.
pub struct Locker<T> {
    mutex: Box<UnsafeCell<libc::pthread_mutex_t>>,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for Locker<T> {}
unsafe impl<T: Send> Sync for Locker<T> {}

impl<T> Locker<T> {
    pub fn new(data: T) -> Result<Self> {
        let mutex = Box::new(UnsafeCell::new(unsafe {
            mem::zeroed::<libc::pthread_mutex_t>()
        }));
        let ret = unsafe { libc::pthread_mutex_init(mutex.get(), ptr::null()) };
        if ret != 0 {
            return Err(ServerError::Sync {
                what: "mutex",
                source: io::Error::from_raw_os_error(ret),
            });
        }
        Ok(Self {
            mutex,
            data: UnsafeCell::new(data),
        })
    }

    /// Acquire the lock. It is released when the guard drops.
    pub fn lock(&self) -> LockerGuard<'_, T> {
        // A default-attribute mutex initialized in `new` reports none of
        // EINVAL, EAGAIN (recursive count) or EDEADLK (error-checking type).
        let ret = unsafe { libc::pthread_mutex_lock(self.mutex.get()) };
        if ret != 0 {
            tracing::error!(error = %io::Error::from_raw_os_error(ret), "pthread_mutex_lock failed");
        }
        debug_assert_eq!(ret, 0, "pthread_mutex_lock failed");
        LockerGuard {
            locker: self,
            _not_send: PhantomData,
        }
    }

    /// Exclusive access without locking; the borrow checker already
    /// guarantees no guard is alive.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    fn raw(&self) -> *mut libc::pthread_mutex_t {
        self.mutex.get()
    }
}

impl<T> Drop for Locker<T> {
    fn drop(&mut self) {
        unsafe {
            libc::pthread_mutex_destroy(self.mutex.get());
        }
    }
}

/// Scoped lock. A pthread mutex must be unlocked by the thread that locked
/// it, so the guard is neither `Send` nor `Sync`.
pub struct LockerGuard<'a, T> {
    locker: &'a Locker<T>,
    _not_send: PhantomData<*const ()>,
}

impl<T> Deref for LockerGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.locker.data.get() }
    }
}

impl<T> DerefMut for LockerGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.locker.data.get() }
    }
}

impl<T> Drop for LockerGuard<'_, T> {
    fn drop(&mut self) {
        unsafe {
            libc::pthread_mutex_unlock(self.locker.raw());
        }
    }
}

// ============================================================================
// Condition variable
// ============================================================================

/// Condition variable paired with a [`Locker`] at wait time.
pub struct Cond {
    cond: Box<UnsafeCell<libc::pthread_cond_t>>,
}

unsafe impl Send for Cond {}
unsafe impl Sync for Cond {}

impl Cond {
    pub fn new() -> Result<Self> {
        let cond = Box::new(UnsafeCell::new(unsafe {
            mem::zeroed::<libc::pthread_cond_t>()
        }));
        let ret = unsafe { libc::pthread_cond_init(cond.get(), ptr::null()) };
        if ret != 0 {
            return Err(ServerError::Sync {
                what: "condition variable",
                source: io::Error::from_raw_os_error(ret),
            });
        }
        Ok(Self { cond })
    }

    /// Atomically release the guard's mutex and block until signalled; the
    /// mutex is held again when this returns. Spurious wakeups happen, so
    /// callers re-check their predicate.
    pub fn wait<T>(&self, guard: &mut LockerGuard<'_, T>) -> io::Result<()> {
        let ret = unsafe { libc::pthread_cond_wait(self.cond.get(), guard.locker.raw()) };
        if ret == 0 {
            Ok(())
        } else {
            Err(io::Error::from_raw_os_error(ret))
        }
    }

    /// Like [`Cond::wait`] but gives up after `timeout`. Returns `Ok(false)`
    /// on timeout.
    pub fn timed_wait<T>(
        &self,
        guard: &mut LockerGuard<'_, T>,
        timeout: Duration,
    ) -> io::Result<bool> {
        let deadline = realtime_deadline(timeout)?;
        let ret = unsafe {
            libc::pthread_cond_timedwait(self.cond.get(), guard.locker.raw(), &deadline)
        };
        match ret {
            0 => Ok(true),
            libc::ETIMEDOUT => Ok(false),
            code => Err(io::Error::from_raw_os_error(code)),
        }
    }

    /// Wake one waiter.
    pub fn signal(&self) -> io::Result<()> {
        match unsafe { libc::pthread_cond_signal(self.cond.get()) } {
            0 => Ok(()),
            code => Err(io::Error::from_raw_os_error(code)),
        }
    }

    /// Wake every waiter.
    pub fn broadcast(&self) -> io::Result<()> {
        match unsafe { libc::pthread_cond_broadcast(self.cond.get()) } {
            0 => Ok(()),
            code => Err(io::Error::from_raw_os_error(code)),
        }
    }
}

impl Drop for Cond {
    fn drop(&mut self) {
        unsafe {
            libc::pthread_cond_destroy(self.cond.get());
        }
    }
}

// pthread_cond_timedwait takes an absolute CLOCK_REALTIME instant
fn realtime_deadline(timeout: Duration) -> io::Result<libc::timespec> {
    let mut now: libc::timespec = unsafe { mem::zeroed() };
    if unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut now) } != 0 {
        return Err(io::Error::last_os_error());
    }
    let mut sec = now.tv_sec + timeout.as_secs() as libc::time_t;
    let mut nsec = now.tv_nsec + timeout.subsec_nanos() as libc::c_long;
    if nsec >= 1_000_000_000 {
        sec += 1;
        nsec -= 1_000_000_000;
    }
    Ok(libc::timespec {
        tv_sec: sec,
        tv_nsec: nsec,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn sem_counts_posts() {
        let sem = Sem::with_count(2).unwrap();
        assert!(sem.try_wait());
        assert!(sem.try_wait());
        assert!(!sem.try_wait());

        sem.post().unwrap();
        sem.wait().unwrap();
        assert!(!sem.try_wait());
    }

    #[test]
    fn sem_wakes_blocked_waiter() {
        let sem = Arc::new(Sem::new().unwrap());
        let waiter = {
            let sem = Arc::clone(&sem);
            thread::spawn(move || sem.wait().is_ok())
        };
        thread::sleep(Duration::from_millis(20));
        sem.post().unwrap();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn dropped_guard_unlocks_for_other_threads() {
        let locker = Arc::new(Locker::new(Vec::new()).unwrap());
        locker.lock().push(1);
        let other = Arc::clone(&locker);
        thread::spawn(move || other.lock().push(2)).join().unwrap();
        assert_eq!(*locker.lock(), vec![1, 2]);
    }

    #[test]
    fn locker_serializes_increments() {
        let counter = Arc::new(Locker::new(0usize).unwrap());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        *counter.lock() += 1;
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*counter.lock(), 4000);
    }

    #[test]
    fn cond_timed_wait_times_out() {
        let locker = Locker::new(()).unwrap();
        let cond = Cond::new().unwrap();
        let mut guard = locker.lock();
        let started = Instant::now();
        let signalled = cond.timed_wait(&mut guard, Duration::from_millis(30)).unwrap();
        assert!(!signalled);
        assert!(started.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn cond_signal_releases_waiter() {
        let shared = Arc::new((Locker::new(false).unwrap(), Cond::new().unwrap()));
        let waiter = {
            let shared = Arc::clone(&shared);
            thread::spawn(move || {
                let (locker, cond) = &*shared;
                let mut ready = locker.lock();
                while !*ready {
                    cond.wait(&mut ready).unwrap();
                }
                true
            })
        };
        {
            let (locker, cond) = &*shared;
            *locker.lock() = true;
            cond.broadcast().unwrap();
        }
        assert!(waiter.join().unwrap());
    }
}
