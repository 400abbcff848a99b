//! A mutex and a condition variable that each fit in one 32-bit word.
//!
//! The mutex is Drepper's three-state futex lock ("Futexes Are Tricky",
//! mutex 2): `0` unlocked, `1` locked with no waiters, `2` locked with
//! possible waiters. The condition variable is a sequence counter: waiters
//! sample it, release the lock, and sleep until it moves.
//!
//! Both types are `#[repr(transparent)]` over their word so they can be
//! placed at fixed offsets inside shared memory and used from several
//! threads (or processes) at once.

use crate::futex::{WAKE_ALL, futex_wait, futex_wake};
use crate::sync::{AtomicU32, Ordering};

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;
const CONTENDED: u32 = 2;

/// Futex-backed mutex word.
#[repr(transparent)]
pub struct Lock {
    state: AtomicU32,
}

#[cfg(not(feature = "loom"))]
static_assertions::assert_eq_size!(Lock, u32);

impl Default for Lock {
    fn default() -> Self {
        Self::new()
    }
}

impl Lock {
    pub fn new() -> Self {
        Self {
            state: AtomicU32::new(UNLOCKED),
        }
    }

    /// Reset the word to unlocked. Only valid while nobody uses the lock.
    pub fn init(&self) {
        self.state.store(UNLOCKED, Ordering::Release);
    }

    #[inline]
    fn cas(&self, current: u32, new: u32) -> u32 {
        match self
            .state
            .compare_exchange(current, new, Ordering::Acquire, Ordering::Relaxed)
        {
            Ok(v) | Err(v) => v,
        }
    }

    /// Acquire the lock, blocking the calling thread.
    pub fn lock(&self) -> LockGuard<'_> {
        let mut c = self.cas(UNLOCKED, LOCKED);
        while c != UNLOCKED {
            if c == CONTENDED || self.cas(LOCKED, CONTENDED) != UNLOCKED {
                futex_wait(&self.state, CONTENDED);
            }
            c = self.cas(UNLOCKED, CONTENDED);
        }
        LockGuard { lock: self }
    }

    /// Acquire the lock without suspending the OS thread.
    #[cfg(feature = "async")]
    pub async fn lock_async(&self) -> LockGuard<'_> {
        let mut c = self.cas(UNLOCKED, LOCKED);
        while c != UNLOCKED {
            if c == CONTENDED || self.cas(LOCKED, CONTENDED) != UNLOCKED {
                crate::futex::futex_wait_async(&self.state, CONTENDED).await;
            }
            c = self.cas(UNLOCKED, CONTENDED);
        }
        LockGuard { lock: self }
    }

    pub fn try_lock(&self) -> Option<LockGuard<'_>> {
        (self.cas(UNLOCKED, LOCKED) == UNLOCKED).then_some(LockGuard { lock: self })
    }

    pub fn is_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) != UNLOCKED
    }

    fn unlock(&self) {
        if self.state.fetch_sub(1, Ordering::Release) != LOCKED {
            self.state.store(UNLOCKED, Ordering::Release);
            futex_wake(&self.state, 1);
        }
    }
}

/// Proof that a [`Lock`] is held. Unlocks on drop.
#[must_use = "dropping the guard releases the lock immediately"]
pub struct LockGuard<'a> {
    lock: &'a Lock,
}

impl<'a> LockGuard<'a> {
    pub fn lock(&self) -> &'a Lock {
        self.lock
    }

    pub fn unlock(self) {
        drop(self);
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

/// Sequence-counter condition variable word.
///
/// A `Cond` is always used together with one particular [`Lock`]; every
/// operation takes that lock's guard.
#[repr(transparent)]
pub struct Cond {
    seq: AtomicU32,
}

#[cfg(not(feature = "loom"))]
static_assertions::assert_eq_size!(Cond, u32);

impl Default for Cond {
    fn default() -> Self {
        Self::new()
    }
}

impl Cond {
    pub fn new() -> Self {
        Self {
            seq: AtomicU32::new(0),
        }
    }

    pub fn init(&self) {
        self.seq.store(0, Ordering::Release);
    }

    /// Release the lock, block until notified (or spuriously woken), then
    /// reacquire it.
    pub fn wait<'a>(&self, guard: LockGuard<'a>) -> LockGuard<'a> {
        let seq = self.seq.load(Ordering::Acquire);
        let lock = guard.lock();
        guard.unlock();
        futex_wait(&self.seq, seq);
        lock.lock()
    }

    /// Task-suspending [`Cond::wait`].
    #[cfg(feature = "async")]
    pub async fn wait_async<'a>(&self, guard: LockGuard<'a>) -> LockGuard<'a> {
        let seq = self.seq.load(Ordering::Acquire);
        let lock = guard.lock();
        guard.unlock();
        crate::futex::futex_wait_async(&self.seq, seq).await;
        lock.lock_async().await
    }

    pub fn notify_one(&self, _guard: &LockGuard<'_>) {
        self.seq.fetch_add(1, Ordering::Release);
        futex_wake(&self.seq, 1);
    }

    pub fn notify_all(&self, _guard: &LockGuard<'_>) {
        self.seq.fetch_add(1, Ordering::Release);
        futex_wake(&self.seq, WAKE_ALL);
    }
}
