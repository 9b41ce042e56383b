//! Declarative proxy-library construction.
//!
//! A proxy unit describes itself as two tables: trampolines for exported
//! functions and descriptors for exported data symbols. The builder
//! collects both and installs them into a bridge in one step.

use causeway_abi::GuestArch;

use crate::bridge::Bridge;
use crate::registry::{RegistryError, TrampolineEntry};

/// Exported data symbol the loader maps through to the host library.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VariableDescriptor {
    pub name: &'static str,
    pub size: usize,
}

impl VariableDescriptor {
    pub fn new(name: &'static str, size: usize) -> Self {
        Self { name, size }
    }
}

/// Collects one proxy library's tables.
///
/// ```
/// # use causeway_runtime::{Bridge, BridgeConfig, GuestRuntime, ProxyLibraryBuilder};
/// # use causeway_runtime::registry::TrampolineEntry;
/// # use causeway_abi::{AbiKind, ArgBuffer, Arm64, GuestAddr};
/// # use std::sync::Arc;
/// # struct NullRuntime;
/// # impl GuestRuntime<Arm64> for NullRuntime {
/// #     fn invoke(&self, _: GuestAddr, _: &mut ArgBuffer, _: AbiKind) {}
/// # }
/// # let bridge = Bridge::<Arm64>::new(BridgeConfig::default(), Arc::new(NullRuntime));
/// ProxyLibraryBuilder::new("libgfx.so")
///     .trampoline(TrampolineEntry::by_signature("gfxCreateDevice", "ipp"))
///     .variable("GFX_API_VERSION", 4)
///     .build(&bridge)
///     .unwrap();
/// ```
pub struct ProxyLibraryBuilder<A: GuestArch> {
    library: String,
    trampolines: Vec<TrampolineEntry<A>>,
    variables: Vec<VariableDescriptor>,
}

impl<A: GuestArch> ProxyLibraryBuilder<A> {
    pub fn new(library: &str) -> Self {
        Self {
            library: library.to_string(),
            trampolines: Vec::new(),
            variables: Vec::new(),
        }
    }

    pub fn trampoline(mut self, entry: TrampolineEntry<A>) -> Self {
        self.trampolines.push(entry);
        self
    }

    pub fn trampolines(mut self, entries: impl IntoIterator<Item = TrampolineEntry<A>>) -> Self {
        self.trampolines.extend(entries);
        self
    }

    pub fn variable(mut self, name: &'static str, size: usize) -> Self {
        self.variables.push(VariableDescriptor::new(name, size));
        self
    }

    pub fn variables(mut self, descriptors: impl IntoIterator<Item = VariableDescriptor>) -> Self {
        self.variables.extend(descriptors);
        self
    }

    /// Installs the collected tables into `bridge`.
    pub fn build(self, bridge: &Bridge<A>) -> Result<(), RegistryError> {
        bridge
            .registry()
            .build_library(&self.library, self.trampolines, self.variables)
    }
}
