//! The bridge context.
//!
//! One `Bridge` owns all process-wide call-bridging state: the wrapper
//! cache, the trampoline registry, and the interface dispatch registry.
//! Proxy libraries are built into it at initialization; afterwards every
//! guest thread shares it through `&Bridge`.

use std::sync::Arc;

use causeway_abi::{AbiKind, ArgBuffer, GuestAddr, GuestArch, HostCode, ProcessState};

use crate::cache::{call_host_by_signature, GuestRuntime, HostCallStub, WrapperCache};
use crate::config::BridgeConfig;
use crate::interface::{InterfaceError, InterfaceRegistry};
use crate::library::SymbolSource;
use crate::registry::TrampolineRegistry;

pub struct Bridge<A: GuestArch> {
    config: BridgeConfig,
    cache: WrapperCache<A>,
    registry: TrampolineRegistry<A>,
    interfaces: InterfaceRegistry<A>,
}

impl<A: GuestArch> Bridge<A> {
    pub fn new(config: BridgeConfig, runtime: Arc<dyn GuestRuntime<A>>) -> Self {
        Self {
            config,
            cache: WrapperCache::new(runtime),
            registry: TrampolineRegistry::new(),
            interfaces: InterfaceRegistry::new(),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn cache(&self) -> &WrapperCache<A> {
        &self.cache
    }

    pub fn registry(&self) -> &TrampolineRegistry<A> {
        &self.registry
    }

    pub fn interfaces(&self) -> &InterfaceRegistry<A> {
        &self.interfaces
    }

    /// Makes a host function guest-callable through its registry entry.
    /// `None` means no usable entry exists; never fatal.
    pub fn wrap_host_function(&self, name: &str, host: HostCode) -> Option<GuestAddr> {
        self.registry.wrap_host_function(&self.cache, name, host)
    }

    /// Makes a guest function host-callable through its registry entry or
    /// the known-wrapper side table.
    pub fn wrap_guest_function(&self, name: &str, guest: GuestAddr) -> Option<HostCode> {
        self.registry.wrap_guest_function(&self.cache, name, guest)
    }

    pub fn wrap_known_guest_function(&self, name: &str, guest: GuestAddr) -> Option<HostCode> {
        self.registry
            .wrap_known_guest_function(&self.cache, name, guest)
    }

    /// Interpreter contract: the dispatch record behind a synthetic pc.
    pub fn find_host_call(&self, pc: GuestAddr) -> Option<Arc<HostCallStub<A>>> {
        self.cache.find_host_call(pc)
    }

    /// Interpreter entry point for a pc inside the reserved stub range.
    /// Marshals and invokes the recorded host function, leaving the result
    /// in the guest return slot. Returns `false` when `pc` is not a stub,
    /// meaning ordinary guest code the interpreter should execute itself.
    ///
    /// # Safety
    ///
    /// `state` must be the live register file of the thread whose
    /// execution reached `pc`, with the guest call frame intact.
    pub unsafe fn dispatch_host_call(&self, pc: GuestAddr, state: &mut ProcessState<A>) -> bool {
        let Some(stub) = self.cache.find_host_call(pc) else {
            return false;
        };
        log::trace!("host call `{}` at {pc:#x}", stub.name());
        if let Some(marshal) = stub.marshal() {
            marshal(self, stub.host_code(), state);
        } else if let Some(signature) = stub.signature() {
            call_host_by_signature::<A>(signature, stub.host_code(), state);
        } else {
            log::error!("stub for `{}` has no dispatch path", stub.name());
        }
        true
    }

    /// Runs a guest function against a prepared argument frame. Used by
    /// marshallers that call guest code directly instead of returning a
    /// wrapped pointer to the host.
    pub fn invoke_guest(&self, addr: GuestAddr, args: &mut ArgBuffer, ret: AbiKind) {
        self.cache.runtime().invoke(addr, args, ret);
    }

    /// Resolves and caches interface descriptors against the real host
    /// library.
    ///
    /// # Safety
    ///
    /// Every id symbol `source` resolves must point at least
    /// [`crate::interface::INTERFACE_ID_SIZE`] readable bytes.
    pub unsafe fn install_interfaces(
        &self,
        source: &dyn SymbolSource,
        descriptors: Vec<crate::interface::InterfaceDescriptor<A>>,
        diagnostic_ids: &[&str],
    ) -> Result<(), InterfaceError> {
        self.interfaces.install(source, descriptors, diagnostic_ids)
    }

    /// Wraps the method table of `instance` for the interface identified
    /// by the bytes at `id`. Panics on an unknown id.
    ///
    /// # Safety
    ///
    /// See [`InterfaceRegistry::register_for`].
    pub unsafe fn register_for(&self, id: *const u8, instance: *mut ()) {
        self.interfaces.register_for(self, id, instance)
    }

    /// Host stack size for a guest thread-creation request.
    pub fn effective_stack_size(&self, requested: usize) -> usize {
        self.config.effective_stack_size(requested)
    }
}
