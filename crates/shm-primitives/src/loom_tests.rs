#![cfg(all(test, feature = "loom"))]

use crate::lock::{Cond, Lock};
use crate::sync::{AtomicU32, Ordering, thread};
use alloc::vec::Vec;
use loom::sync::Arc;

#[test]
fn lock_provides_mutual_exclusion() {
    loom::model(|| {
        let lock = Arc::new(Lock::new());
        let counter = Arc::new(AtomicU32::new(0));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let lock = lock.clone();
                let counter = counter.clone();
                thread::spawn(move || {
                    let _guard = lock.lock();
                    let v = counter.load(Ordering::Relaxed);
                    counter.store(v + 1, Ordering::Relaxed);
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 2);
        assert!(!lock.is_locked());
    });
}

#[test]
fn cond_handoff() {
    loom::model(|| {
        struct Shared {
            lock: Lock,
            cond: Cond,
            ready: AtomicU32,
        }
        let shared = Arc::new(Shared {
            lock: Lock::new(),
            cond: Cond::new(),
            ready: AtomicU32::new(0),
        });

        let notifier = {
            let shared = shared.clone();
            thread::spawn(move || {
                let guard = shared.lock.lock();
                shared.ready.store(1, Ordering::Relaxed);
                shared.cond.notify_one(&guard);
            })
        };

        let mut guard = shared.lock.lock();
        while shared.ready.load(Ordering::Relaxed) == 0 {
            guard = shared.cond.wait(guard);
        }
        drop(guard);
        notifier.join().unwrap();
    });
}
