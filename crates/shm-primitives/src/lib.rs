//! Synchronization primitives for shared memory.
//!
//! This crate provides `no_std`-compatible building blocks that live at fixed
//! offsets inside a memory region shared between threads or processes, for
//! the case where one side must block its OS thread while the other side
//! keeps running an event loop.
//!
//! # Primitives
//!
//! - [`Lock`] / [`Cond`]: a futex mutex and sequence condition variable, one
//!   32-bit word each, with blocking and (feature `async`) task-suspending
//!   waits
//! - [`TransferBuffer`]: a single-slot chunk protocol moving UTF-8 text from
//!   a cooperative [`Producer`] to a blocking [`Consumer`], with a generation
//!   counter so a newer transfer can cancel a stale producer without
//!   interrupting it
//!
//! # Raw vs owned
//!
//! [`TransferBuffer`] is a `Copy` view over a [`Region`]; the caller keeps the
//! memory alive (an `mmap`, a host-provided buffer). [`SharedTransferBuffer`]
//! owns heap memory through an `Arc` and is what in-process users want.
//!
//! # Loom Testing
//!
//! Enable the `loom` feature to model-check the lock and condition variable.
//!
//! ```text
//! cargo test -p shm-primitives --features loom
//! ```

#![no_std]

#[cfg(any(test, feature = "alloc"))]
extern crate alloc;
#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod futex;
pub mod lock;
pub mod region;
pub mod sync;
pub mod transfer;

pub use lock::{Cond, Lock, LockGuard};
#[cfg(any(test, feature = "alloc"))]
pub use region::HeapRegion;
pub use region::Region;
pub use transfer::{
    Chunk, Consumer, DEFAULT_TRANSFER_BUFFER_LEN, MIN_DATA_LEN, MIN_TRANSFER_BUFFER_LEN,
    TRANSFER_OVERHEAD, TransferBuffer, TransferError, TransferHeader,
};
#[cfg(feature = "alloc")]
pub use transfer::{Producer, SharedTransferBuffer};

#[cfg(all(test, feature = "loom"))]
mod loom_tests;
