//! Interface dispatch registry.
//!
//! Object-oriented C APIs hand out opaque instances whose method tables
//! are discovered at run time by asking for a sub-interface by 128-bit id.
//! The ids are not literal constants in source; they are the contents of
//! data symbols the host library exports, so the registry resolves each
//! candidate symbol once at install time and compares by byte content
//! afterwards.

use std::sync::RwLock;

use thiserror::Error;

use causeway_abi::GuestArch;

use crate::bridge::Bridge;
use crate::library::SymbolSource;

/// Byte width of an interface id structure.
pub const INTERFACE_ID_SIZE: usize = 16;

#[derive(Debug, Error)]
pub enum InterfaceError {
    #[error("Interface id symbol `{0}` is not exported by the host library")]
    UnresolvedId(String),
}

/// Rewrites one instance's method table with guest-callable stubs.
pub type RegisterMethodsFn<A> = fn(&Bridge<A>, *mut ());

/// Declares how one interface family gets wrapped.
pub struct InterfaceDescriptor<A: GuestArch> {
    /// Data symbol whose contents identify the interface.
    pub id_symbol: &'static str,
    pub register_methods: RegisterMethodsFn<A>,
}

struct ResolvedInterface<A: GuestArch> {
    id_symbol: &'static str,
    id: [u8; INTERFACE_ID_SIZE],
    register_methods: RegisterMethodsFn<A>,
}

/// Id the bridge knows by name but has no descriptor for. Only used to
/// name the culprit in the fatal diagnostic.
struct DiagnosticId {
    name: String,
    id: [u8; INTERFACE_ID_SIZE],
}

pub struct InterfaceRegistry<A: GuestArch> {
    entries: RwLock<Vec<ResolvedInterface<A>>>,
    diagnostics: RwLock<Vec<DiagnosticId>>,
}

impl<A: GuestArch> InterfaceRegistry<A> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            diagnostics: RwLock::new(Vec::new()),
        }
    }

    /// Resolves and caches a proxy unit's interface descriptors.
    ///
    /// Every descriptor's id symbol must resolve or installation fails;
    /// `diagnostic_ids` names additional id symbols resolved only so the
    /// fatal path can report an unknown id by name, and missing ones are
    /// skipped.
    ///
    /// # Safety
    ///
    /// Every id symbol `source` resolves must point at least
    /// [`INTERFACE_ID_SIZE`] readable bytes.
    pub unsafe fn install(
        &self,
        source: &dyn SymbolSource,
        descriptors: Vec<InterfaceDescriptor<A>>,
        diagnostic_ids: &[&str],
    ) -> Result<(), InterfaceError> {
        let mut resolved = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            let ptr = source
                .data(descriptor.id_symbol)
                .ok_or_else(|| InterfaceError::UnresolvedId(descriptor.id_symbol.to_string()))?;
            resolved.push(ResolvedInterface {
                id_symbol: descriptor.id_symbol,
                id: read_id(ptr),
                register_methods: descriptor.register_methods,
            });
        }

        let mut hints = Vec::new();
        for &name in diagnostic_ids {
            match source.data(name) {
                Some(ptr) => hints.push(DiagnosticId {
                    name: name.to_string(),
                    id: read_id(ptr),
                }),
                None => log::debug!("diagnostic id symbol `{name}` not exported, skipping"),
            }
        }

        log::debug!(
            "installed {} interface descriptors, {} diagnostic ids",
            resolved.len(),
            hints.len()
        );
        self.entries.write().unwrap().extend(resolved);
        self.diagnostics.write().unwrap().extend(hints);
        Ok(())
    }

    /// Wraps the method table of `instance` for the interface identified
    /// by the bytes at `id`.
    ///
    /// # Safety
    ///
    /// `id` must point at [`INTERFACE_ID_SIZE`] readable bytes and
    /// `instance` must be an instance of the interface those bytes name.
    ///
    /// # Panics
    ///
    /// Panics when the id matches no installed descriptor. A call through
    /// an unwrapped method table would run guest-architecture code on the
    /// host calling convention, so execution must not continue.
    pub unsafe fn register_for(&self, bridge: &Bridge<A>, id: *const u8, instance: *mut ()) {
        let id_bytes = read_id(id);

        let matched = {
            let entries = self.entries.read().unwrap();
            entries
                .iter()
                .find(|e| e.id == id_bytes)
                .map(|e| (e.id_symbol, e.register_methods))
        };
        if let Some((symbol, register_methods)) = matched {
            log::trace!("registering methods for interface `{symbol}`");
            register_methods(bridge, instance);
            return;
        }

        match self.diagnostic_name(&id_bytes) {
            Some(name) => {
                log::error!("unknown interface id `{name}` at {id:p}");
                panic!("unknown interface id `{name}`");
            }
            None => {
                log::error!("unknown interface id at {id:p}: {id_bytes:02x?}");
                panic!("unknown interface id {id_bytes:02x?}");
            }
        }
    }

    pub fn descriptor_count(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    fn diagnostic_name(&self, id: &[u8; INTERFACE_ID_SIZE]) -> Option<String> {
        let diagnostics = self.diagnostics.read().unwrap();
        diagnostics
            .iter()
            .find(|d| &d.id == id)
            .map(|d| d.name.clone())
    }
}

impl<A: GuestArch> Default for InterfaceRegistry<A> {
    fn default() -> Self {
        Self::new()
    }
}

unsafe fn read_id(ptr: *const u8) -> [u8; INTERFACE_ID_SIZE] {
    let mut id = [0u8; INTERFACE_ID_SIZE];
    std::ptr::copy_nonoverlapping(ptr, id.as_mut_ptr(), INTERFACE_ID_SIZE);
    id
}
