//! Wait/wake on a 32-bit word.
//!
//! On Linux the blocking calls go straight to the `futex` syscall (without
//! `FUTEX_PRIVATE_FLAG`, so the word may live in memory shared between
//! processes). Elsewhere they degrade to a yield/sleep spin on the value.
//! Under `loom` every wait is a single `yield_now` and wakes are no-ops; the
//! callers always re-check their condition in a loop, so that is enough for
//! the model checker to explore every interleaving.
//!
//! Waits may return spuriously. Callers must loop.

use crate::sync::AtomicU32;

/// Wake every waiter.
pub const WAKE_ALL: u32 = i32::MAX as u32;

/// Block the calling thread while `*word == expected`.
#[cfg(all(feature = "std", not(feature = "loom"), target_os = "linux"))]
pub fn futex_wait(word: &AtomicU32, expected: u32) {
    // SAFETY: `word` is a valid, aligned u32 for the duration of the call.
    // EAGAIN (value already changed) and EINTR both just return to the caller.
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAIT,
            expected,
            core::ptr::null::<libc::timespec>(),
        );
    }
}

/// Wake up to `count` threads blocked in [`futex_wait`] on `word`.
#[cfg(all(feature = "std", not(feature = "loom"), target_os = "linux"))]
pub fn futex_wake(word: &AtomicU32, count: u32) {
    // SAFETY: as above.
    unsafe {
        libc::syscall(libc::SYS_futex, word.as_ptr(), libc::FUTEX_WAKE, count);
    }
}

#[cfg(all(feature = "std", not(feature = "loom"), not(target_os = "linux")))]
pub fn futex_wait(word: &AtomicU32, expected: u32) {
    use crate::sync::Ordering;
    let mut spins = 0u32;
    while word.load(Ordering::Acquire) == expected {
        if spins < 64 {
            std::thread::yield_now();
            spins += 1;
        } else {
            std::thread::sleep(std::time::Duration::from_micros(50));
        }
    }
}

#[cfg(all(feature = "std", not(feature = "loom"), not(target_os = "linux")))]
pub fn futex_wake(_word: &AtomicU32, _count: u32) {}

#[cfg(all(not(feature = "std"), not(feature = "loom")))]
pub fn futex_wait(word: &AtomicU32, expected: u32) {
    use crate::sync::{Ordering, spin_loop};
    while word.load(Ordering::Acquire) == expected {
        spin_loop();
    }
}

#[cfg(all(not(feature = "std"), not(feature = "loom")))]
pub fn futex_wake(_word: &AtomicU32, _count: u32) {}

#[cfg(feature = "loom")]
pub fn futex_wait(_word: &AtomicU32, _expected: u32) {
    loom::thread::yield_now();
}

#[cfg(feature = "loom")]
pub fn futex_wake(_word: &AtomicU32, _count: u32) {}

/// Suspend the current task while `*word == expected`.
///
/// There is no async futex, so this polls the word: a few cooperative
/// yields first, then sleeps on the tokio timer with a backoff capped at one
/// millisecond. The runtime must have its time driver enabled.
#[cfg(all(feature = "async", not(feature = "loom")))]
pub async fn futex_wait_async(word: &AtomicU32, expected: u32) {
    use crate::sync::Ordering;
    use core::time::Duration;

    const YIELDS: u32 = 16;
    const MAX_BACKOFF: Duration = Duration::from_millis(1);

    let mut attempt = 0u32;
    let mut backoff = Duration::from_micros(10);
    while word.load(Ordering::Acquire) == expected {
        if attempt < YIELDS {
            tokio::task::yield_now().await;
            attempt += 1;
        } else {
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }
}

#[cfg(all(feature = "async", feature = "loom"))]
pub async fn futex_wait_async(_word: &AtomicU32, _expected: u32) {
    tokio::task::yield_now().await;
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use crate::sync::Ordering;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn wait_returns_immediately_when_value_differs() {
        let word = AtomicU32::new(5);
        futex_wait(&word, 4);
    }

    #[test]
    fn wake_releases_blocked_thread() {
        let word = Arc::new(AtomicU32::new(0));
        let waiter = {
            let word = word.clone();
            std::thread::spawn(move || {
                while word.load(Ordering::Acquire) == 0 {
                    futex_wait(&word, 0);
                }
            })
        };
        std::thread::sleep(Duration::from_millis(20));
        word.store(1, Ordering::Release);
        futex_wake(&word, WAKE_ALL);
        waiter.join().unwrap();
    }

    #[cfg(feature = "async")]
    #[tokio::test]
    async fn async_wait_observes_change_from_another_thread() {
        let word = Arc::new(AtomicU32::new(0));
        let setter = {
            let word = word.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(10));
                word.store(7, Ordering::Release);
            })
        };
        futex_wait_async(&word, 0).await;
        assert_eq!(word.load(Ordering::Acquire), 7);
        setter.join().unwrap();
    }
}
