#![doc = include_str!("../README.md")]
#![forbid(unsafe_op_in_unsafe_fn)]

mod codec;
mod dispatch;
mod engine;
mod error;
pub mod eventual;
mod finalize;
mod invocation;
mod marshal;
mod message;
mod options;
mod promise;
mod refcount;
mod slot;
mod stats;
mod tables;
mod trap;
mod value;

pub use codec::*;
pub use engine::*;
pub use error::*;
pub use finalize::*;
pub use invocation::*;
pub use marshal::*;
pub use message::*;
pub use options::*;
pub use promise::*;
pub use refcount::*;
pub use slot::*;
pub use stats::*;
pub use tables::*;
pub use trap::*;
pub use value::*;
