//! Causeway Proxies - Per-API marshalling units
//!
//! Each module bridges one guest-visible host library:
//!
//! - `graphics` (`libgfx.so`): extension enumeration with filtering,
//!   recorder bookkeeping and deep begin-info conversion
//! - `audio` (`libsonic.so`): id-keyed interface dispatch over
//!   method-table instances
//! - `threads` (`libthread.so`): thread creation with stack widening,
//!   start-routine and destructor wrapping
//!
//! A unit's `init_proxy_library` declares its trampoline and variable
//! tables against a [`Bridge`](causeway_runtime::Bridge) and registers
//! the guest-wrapper entries its marshallers rely on. Initialization is
//! one-shot per library name.

use causeway_abi::{GuestAddr, GuestArch, Signature};
use causeway_runtime::{InterfaceError, RegistryError};
use thiserror::Error;

/// Version of the causeway-proxies crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// Marshalling units
pub mod audio;
pub mod graphics;
pub mod threads;

/// Errors surfaced while installing a proxy library.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Interface(#[from] InterfaceError),
}

/// Parses a signature literal, panicking on malformed text. Units build
/// signatures from literals at initialization, so this is a build-time
/// contract in practice.
pub(crate) fn sig(text: &str) -> Signature {
    Signature::parse(text).unwrap_or_else(|e| panic!("bad proxy signature `{text}`: {e}"))
}

/// Reinterprets a guest address as a host pointer after normalizing it
/// to the guest's pointer width.
pub(crate) fn guest_ptr<A: GuestArch, T>(addr: GuestAddr) -> *mut T {
    (addr & A::ADDR_MASK) as usize as *mut T
}

/// Writes a pointer-sized value through a guest out-parameter slot.
///
/// # Safety
/// `slot` must address a writable guest location of at least the
/// guest's pointer width.
pub(crate) unsafe fn write_guest_ptr_slot<A: GuestArch>(slot: GuestAddr, value: u64) {
    if A::POINTER_SIZE == 4 {
        *guest_ptr::<A, u32>(slot) = value as u32;
    } else {
        *guest_ptr::<A, u64>(slot) = value;
    }
}
