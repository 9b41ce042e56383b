//! Causeway ABI - Calling-convention codec and structure conversion
//!
//! This crate provides the architecture-level building blocks of the call
//! bridge:
//! - Arch: guest architecture descriptions (register budgets, slot widths,
//!   aggregate classification) behind the [`GuestArch`] trait
//! - State: `#[repr(C)]` per-architecture CPU state and [`ProcessState`]
//! - Value: ABI value kinds, call signatures, host code handles
//! - Params: typed extraction of arguments from a guest call frame and
//!   typed dispatch into host functions
//! - Buffer: the architecture-neutral argument buffer used to synthesize
//!   guest call frames from host-side calls
//! - Arena: per-call allocation holder with explicit out-of-memory reporting
//! - Chain: deep conversion of tagged extension chains between guest and
//!   host layouts
//!
//! Everything here is pure data plumbing: no I/O, no global state. The
//! runtime crate layers caches, registries and dispatch on top of it.

pub mod arch;
pub mod arena;
pub mod buffer;
pub mod chain;
pub mod params;
pub mod state;
pub mod value;

pub use arch::{AggregateReturn, Arm, Arm64, ArchKind, GuestArch, Riscv64};
pub use arena::{ConvArena, OutOfMemory};
pub use buffer::{ArgBuffer, GuestArgs, HostArgs};
pub use chain::{ChainError, ChainRule, ChainTable};
pub use params::{AbiParam, AbiRet, GuestParams, HostFn};
pub use state::ProcessState;
pub use value::{AbiKind, GuestAddr, HostCode, Signature, SignatureError};

/// Crate version, re-exported for diagnostics.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
