//! Per-library trampoline and variable tables.
//!
//! Proxy libraries declare, per exported symbol, how a call through that
//! symbol crosses the architecture boundary. The registry owns those
//! declarations: one name-sorted table per library, installed once at
//! initialization and searched by binary search afterwards.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use thiserror::Error;

use causeway_abi::{GuestAddr, GuestArch, HostCode, HostFn, ProcessState, Signature};

use crate::bridge::Bridge;
use crate::cache::{MarshalFn, WrapperCache};
use crate::proxy::VariableDescriptor;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Proxy library `{0}` is already built")]
    LibraryAlreadyBuilt(String),

    #[error("Duplicate symbol `{symbol}` in proxy library `{library}`")]
    DuplicateSymbol { library: String, symbol: String },
}

/// Wrapper generator for a guest callback that is not itself a table
/// symbol. Keyed by a name the registering marshaller chooses.
pub type KnownWrapFn<A> = fn(&WrapperCache<A>, GuestAddr) -> HostCode;

/// How calls through one exported symbol cross the boundary.
///
/// A signature alone is enough for the generic kind-driven dispatch; a
/// marshaller takes over when the call needs conversion work the alphabet
/// cannot express. An entry with neither is declared but unsupported.
#[derive(Clone)]
pub struct TrampolineEntry<A: GuestArch> {
    name: &'static str,
    signature: Option<Signature>,
    marshal: Option<MarshalFn<A>>,
}

impl<A: GuestArch> TrampolineEntry<A> {
    /// Entry dispatched by the typed codec for a compile-time-known host
    /// function type.
    pub fn marshalled<F: HostFn<A>>(name: &'static str) -> Self {
        Self {
            name,
            signature: Some(F::signature()),
            marshal: Some(invoke_typed::<A, F>),
        }
    }

    /// Entry dispatched kind-by-kind from a signature string.
    ///
    /// # Panics
    ///
    /// Panics if `signature` is not a valid signature string. Entries are
    /// built from literals at initialization, so this is a build-time
    /// contract in practice.
    pub fn by_signature(name: &'static str, signature: &str) -> Self {
        let signature = Signature::parse(signature)
            .unwrap_or_else(|e| panic!("bad signature for trampoline `{name}`: {e}"));
        Self {
            name,
            signature: Some(signature),
            marshal: None,
        }
    }

    /// Entry with a hand-written marshaller and no generic fallback.
    pub fn custom(name: &'static str, marshal: MarshalFn<A>) -> Self {
        Self {
            name,
            signature: None,
            marshal: Some(marshal),
        }
    }

    /// Entry with a hand-written marshaller that also records the
    /// signature, so the symbol stays wrappable guest-ward.
    pub fn custom_with_signature(
        name: &'static str,
        signature: &str,
        marshal: MarshalFn<A>,
    ) -> Self {
        let signature = Signature::parse(signature)
            .unwrap_or_else(|e| panic!("bad signature for trampoline `{name}`: {e}"));
        Self {
            name,
            signature: Some(signature),
            marshal: Some(marshal),
        }
    }

    /// Known exported symbol the bridge cannot marshal. Declaring it keeps
    /// the failure diagnosable by name instead of a silent table miss.
    pub fn unsupported(name: &'static str) -> Self {
        Self {
            name,
            signature: None,
            marshal: None,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn signature(&self) -> Option<&Signature> {
        self.signature.as_ref()
    }

    pub fn marshal(&self) -> Option<MarshalFn<A>> {
        self.marshal
    }

    pub fn has_dispatch(&self) -> bool {
        self.signature.is_some() || self.marshal.is_some()
    }
}

unsafe fn invoke_typed<A: GuestArch, F: HostFn<A>>(
    _bridge: &Bridge<A>,
    callee: HostCode,
    state: &mut ProcessState<A>,
) {
    F::invoke(callee, state)
}

struct LibraryTable<A: GuestArch> {
    /// Sorted by entry name.
    trampolines: Vec<TrampolineEntry<A>>,
    /// Sorted by descriptor name.
    variables: Vec<VariableDescriptor>,
}

/// All installed proxy-library tables plus the dynamic side tables fed by
/// marshallers at run time.
pub struct TrampolineRegistry<A: GuestArch> {
    libraries: RwLock<HashMap<String, LibraryTable<A>>>,
    known_guest_wrappers: RwLock<HashMap<&'static str, KnownWrapFn<A>>>,
    /// Names looked up at run time that turned out not to be wrappable.
    unsupported: RwLock<HashSet<String>>,
}

impl<A: GuestArch> TrampolineRegistry<A> {
    pub fn new() -> Self {
        Self {
            libraries: RwLock::new(HashMap::new()),
            known_guest_wrappers: RwLock::new(HashMap::new()),
            unsupported: RwLock::new(HashSet::new()),
        }
    }

    /// Installs a library's tables. Each library is built exactly once;
    /// symbol names must be unique within it.
    pub fn build_library(
        &self,
        library: &str,
        mut trampolines: Vec<TrampolineEntry<A>>,
        mut variables: Vec<VariableDescriptor>,
    ) -> Result<(), RegistryError> {
        trampolines.sort_by_key(|e| e.name);
        if let Some(pair) = trampolines.windows(2).find(|p| p[0].name == p[1].name) {
            return Err(RegistryError::DuplicateSymbol {
                library: library.to_string(),
                symbol: pair[0].name.to_string(),
            });
        }
        variables.sort_by_key(|v| v.name);
        if let Some(pair) = variables.windows(2).find(|p| p[0].name == p[1].name) {
            return Err(RegistryError::DuplicateSymbol {
                library: library.to_string(),
                symbol: pair[0].name.to_string(),
            });
        }

        let mut libraries = self.libraries.write().unwrap();
        if libraries.contains_key(library) {
            return Err(RegistryError::LibraryAlreadyBuilt(library.to_string()));
        }
        log::debug!(
            "built proxy library `{library}`: {} trampolines, {} variables",
            trampolines.len(),
            variables.len()
        );
        libraries.insert(
            library.to_string(),
            LibraryTable {
                trampolines,
                variables,
            },
        );
        Ok(())
    }

    /// The entry for `name` in one library's table.
    pub fn find(&self, library: &str, name: &str) -> Option<TrampolineEntry<A>> {
        let libraries = self.libraries.read().unwrap();
        let table = libraries.get(library)?;
        table
            .trampolines
            .binary_search_by(|e| e.name.cmp(name))
            .ok()
            .map(|i| table.trampolines[i].clone())
    }

    /// The entry for `name` in any installed library. Run-time symbol
    /// resolution does not know which proxy exported the name.
    pub fn find_any(&self, name: &str) -> Option<TrampolineEntry<A>> {
        let libraries = self.libraries.read().unwrap();
        libraries.values().find_map(|table| {
            table
                .trampolines
                .binary_search_by(|e| e.name.cmp(name))
                .ok()
                .map(|i| table.trampolines[i].clone())
        })
    }

    /// The data-symbol descriptor for `name` in one library's table.
    pub fn find_variable(&self, library: &str, name: &str) -> Option<VariableDescriptor> {
        let libraries = self.libraries.read().unwrap();
        let table = libraries.get(library)?;
        table
            .variables
            .binary_search_by(|v| v.name.cmp(name))
            .ok()
            .map(|i| table.variables[i])
    }

    /// Makes a host function guest-callable, returning its stub address.
    ///
    /// `None` means the name has no usable entry; the failure is recorded
    /// and logged but not fatal, callers fall back on their own behavior.
    pub fn wrap_host_function(
        &self,
        cache: &WrapperCache<A>,
        name: &str,
        host: HostCode,
    ) -> Option<GuestAddr> {
        match self.find_any(name) {
            Some(entry) if entry.has_dispatch() => {
                Some(cache.wrap_host(name, host, entry.signature, entry.marshal))
            }
            Some(_) => {
                log::error!("trampoline for `{name}` has no marshaller");
                self.unsupported.write().unwrap().insert(name.to_string());
                None
            }
            None => {
                log::error!("no trampoline registered for `{name}`");
                self.unsupported.write().unwrap().insert(name.to_string());
                None
            }
        }
    }

    /// Makes a guest function host-callable through its table entry's
    /// signature, falling back to the known-wrapper side table.
    pub fn wrap_guest_function(
        &self,
        cache: &WrapperCache<A>,
        name: &str,
        guest: GuestAddr,
    ) -> Option<HostCode> {
        if let Some(entry) = self.find_any(name) {
            if let Some(signature) = entry.signature() {
                return Some(cache.wrap_guest(name, guest, signature));
            }
        }
        self.wrap_known_guest_function(cache, name, guest)
    }

    /// Registers a wrapper generator for guest callbacks that are not
    /// table symbols themselves.
    pub fn register_known_guest_wrapper(&self, name: &'static str, wrap: KnownWrapFn<A>) {
        self.known_guest_wrappers.write().unwrap().insert(name, wrap);
    }

    pub fn wrap_known_guest_function(
        &self,
        cache: &WrapperCache<A>,
        name: &str,
        guest: GuestAddr,
    ) -> Option<HostCode> {
        let wrap = *self.known_guest_wrappers.read().unwrap().get(name)?;
        Some(wrap(cache, guest))
    }

    /// Whether a run-time wrap attempt for `name` has failed.
    pub fn is_unsupported(&self, name: &str) -> bool {
        self.unsupported.read().unwrap().contains(name)
    }
}

impl<A: GuestArch> Default for TrampolineRegistry<A> {
    fn default() -> Self {
        Self::new()
    }
}
