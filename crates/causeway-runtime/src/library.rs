//! Host library symbol access.
//!
//! A thin seam over dynamic symbol resolution. [`HostLibrary`] wraps the
//! real host shared object; [`SymbolSource`] is the trait the interface
//! registry and the proxy units depend on, so tests substitute an in-memory
//! [`SymbolTable`]. A symbol that fails to resolve is treated as absent,
//! never as a fatal error.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use libloading::Library;
use thiserror::Error;

use causeway_abi::HostCode;

/// Host library errors
#[derive(Debug, Error)]
pub enum LibraryError {
    #[error("Failed to load host library {path}: {message}")]
    LoadFailed { path: PathBuf, message: String },
}

/// Resolves exported symbols of one host library.
///
/// Function and data symbols are resolved separately because they are used
/// differently: functions become [`HostCode`] handles the wrapper cache can
/// marshal to, data symbols are raw object addresses (interface-id
/// structures, version constants) that are only ever read.
pub trait SymbolSource: Send + Sync {
    /// Address of an exported function, or `None` if the library does not
    /// export `name`.
    fn function(&self, name: &str) -> Option<HostCode>;

    /// Address of an exported data object, or `None` if the library does
    /// not export `name`.
    fn data(&self, name: &str) -> Option<*const u8>;
}

/// A loaded host shared object.
pub struct HostLibrary {
    path: PathBuf,
    library: Library,
}

impl HostLibrary {
    /// Opens a host shared object.
    ///
    /// # Safety
    ///
    /// Loading a library runs its initialization code in this process. The
    /// caller must ensure the library is the trusted host implementation of
    /// the API being bridged.
    pub unsafe fn open(path: &Path) -> Result<Self, LibraryError> {
        let library = Library::new(path).map_err(|e| LibraryError::LoadFailed {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        log::debug!("loaded host library {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            library,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SymbolSource for HostLibrary {
    fn function(&self, name: &str) -> Option<HostCode> {
        // Safety: the symbol is handled as an opaque address; a type is
        // only assigned when a marshaller calls through it.
        let symbol = unsafe { self.library.get::<*const ()>(name.as_bytes()) };
        match symbol {
            Ok(symbol) => Some(HostCode::from_ptr(*symbol)),
            Err(_) => {
                log::debug!("{}: no function symbol '{}'", self.path.display(), name);
                None
            }
        }
    }

    fn data(&self, name: &str) -> Option<*const u8> {
        // Safety: as above; data symbols are never written through here.
        let symbol = unsafe { self.library.get::<*const u8>(name.as_bytes()) };
        match symbol {
            Ok(symbol) => Some(*symbol),
            Err(_) => {
                log::debug!("{}: no data symbol '{}'", self.path.display(), name);
                None
            }
        }
    }
}

/// In-memory symbol source for tests and embedders that resolve symbols
/// themselves.
#[derive(Debug, Default)]
pub struct SymbolTable {
    functions: HashMap<String, usize>,
    data: HashMap<String, usize>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_function(&mut self, name: &str, code: HostCode) {
        self.functions.insert(name.to_string(), code.as_usize());
    }

    pub fn insert_data(&mut self, name: &str, address: *const u8) {
        self.data.insert(name.to_string(), address as usize);
    }
}

impl SymbolSource for SymbolTable {
    fn function(&self, name: &str) -> Option<HostCode> {
        self.functions.get(name).map(|&a| HostCode::from_usize(a))
    }

    fn data(&self, name: &str) -> Option<*const u8> {
        self.data.get(name).map(|&a| a as *const u8)
    }
}
