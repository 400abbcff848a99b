#![doc = include_str!("../README.md")]
#![forbid(unsafe_op_in_unsafe_fn)]

// Re-export the engine so `captp_core` paths stay reachable through the facade.
#[doc(hidden)]
pub extern crate captp_core;

pub use captp_core::{
    // Engine
    Bootstrap,
    CapTp,
    CapTpOptions,
    RawSend,
    RejectHook,
    SlotHook,
    Stats,
    // Tables
    DefaultTables,
    ImportExportTables,
    TableOptions,
    TablesFactory,
    // Errors
    CapTpError,
    SendError,
    TrapTargetError,
    // Values
    ErrorValue,
    Exo,
    Invocation,
    Outcome,
    Promise,
    Remotable,
    Settler,
    Value,
    // Wire
    Answer,
    CapData,
    Codec,
    JsonCodec,
    JsonMarshal,
    Marshal,
    Message,
    MessageKind,
    Resolution,
    Slot,
    SlotKind,
    // Traps
    IterMethod,
    Trap,
    TrapGuest,
    TrapHost,
    TrapProducer,
    TrapRequest,
};

pub use captp_core::eventual::{self, call, get, send};

pub mod atomics;

/// Prelude module for convenient imports.
///
/// ```ignore
/// use captp::prelude::*;
/// ```
pub mod prelude {
    pub use crate::atomics::{AtomicsTrapGuest, AtomicsTrapHost};
    pub use crate::{CapTp, CapTpError, CapTpOptions, Invocation, Promise, Value, eventual};
}
