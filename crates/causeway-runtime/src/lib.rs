//! Causeway Runtime - Process-wide call-bridging state
//!
//! This library provides everything the bridge needs beyond the codec:
//! - Function identity and wrapper cache (synthetic guest stubs, libffi
//!   closure stubs for guest callbacks)
//! - Per-library trampoline and variable tables
//! - Interface dispatch registry for id-keyed method tables
//! - Host library symbol access
//! - Guest register snapshots for crash dumps
//! - Stack sizing policy and TOML configuration

/// Causeway runtime version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// Public API modules
pub mod bridge;
pub mod cache;
pub mod config;
pub mod interface;
pub mod library;
pub mod proxy;
pub mod registry;
pub mod snapshot;
pub mod stack;

// Re-export commonly used types
pub use bridge::Bridge;
pub use cache::{
    call_host_by_signature, reserved_stub_base, GuestRuntime, HostCallStub, MarshalFn,
    WrapperCache, STUB_STRIDE,
};
pub use config::{BridgeConfig, ConfigError};
pub use interface::{
    InterfaceDescriptor, InterfaceError, InterfaceRegistry, RegisterMethodsFn, INTERFACE_ID_SIZE,
};
pub use library::{HostLibrary, LibraryError, SymbolSource, SymbolTable};
pub use proxy::{ProxyLibraryBuilder, VariableDescriptor};
pub use registry::{KnownWrapFn, RegistryError, TrampolineEntry, TrampolineRegistry};
pub use snapshot::{
    export_regs, load_guest_regs, GuestRegs, SnapshotError, SnapshotHeader, SNAPSHOT_SIGNATURE,
    SNAPSHOT_VERSION,
};
pub use stack::{effective_stack_size, DEFAULT_TRANSLATION_RESERVE};
