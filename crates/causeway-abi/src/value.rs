//! ABI value kinds, call signatures and code handles.

use std::fmt;

use thiserror::Error;

/// A guest virtual address, zero-extended to 64 bits for 32-bit guests.
pub type GuestAddr = u64;

/// The kind of a single value crossing the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AbiKind {
    Void,
    I32,
    U32,
    I64,
    U64,
    Ptr,
    F32,
    F64,
}

impl AbiKind {
    /// Decodes one character of the signature alphabet.
    pub fn from_char(c: char) -> Option<Self> {
        match c {
            'v' => Some(AbiKind::Void),
            'i' => Some(AbiKind::I32),
            'u' => Some(AbiKind::U32),
            'l' => Some(AbiKind::I64),
            'z' => Some(AbiKind::U64),
            'p' => Some(AbiKind::Ptr),
            'f' => Some(AbiKind::F32),
            'd' => Some(AbiKind::F64),
            _ => None,
        }
    }

    pub fn to_char(self) -> char {
        match self {
            AbiKind::Void => 'v',
            AbiKind::I32 => 'i',
            AbiKind::U32 => 'u',
            AbiKind::I64 => 'l',
            AbiKind::U64 => 'z',
            AbiKind::Ptr => 'p',
            AbiKind::F32 => 'f',
            AbiKind::F64 => 'd',
        }
    }

    /// Size of a value of this kind in a guest frame, given the guest
    /// pointer width in bytes.
    pub fn size(self, pointer_size: usize) -> usize {
        match self {
            AbiKind::Void => 0,
            AbiKind::I32 | AbiKind::U32 | AbiKind::F32 => 4,
            AbiKind::I64 | AbiKind::U64 | AbiKind::F64 => 8,
            AbiKind::Ptr => pointer_size,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, AbiKind::F32 | AbiKind::F64)
    }
}

/// Errors produced while decoding a signature string.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SignatureError {
    #[error("empty signature string")]
    Empty,

    #[error("unknown type character '{0}' in signature")]
    UnknownChar(char),

    #[error("void ('v') is only valid as a return type")]
    VoidParameter,
}

/// A bridged call signature: one return kind plus the parameter kinds, in
/// order.
///
/// The text form puts the return type first: `"ipp"` is a function taking
/// two pointers and returning an `i32`, `"v"` takes nothing and returns
/// nothing. Variadic and by-value aggregate parameters have no encoding;
/// calls that need them get hand-written marshallers.
///
/// # Examples
///
/// ```
/// use causeway_abi::{AbiKind, Signature};
///
/// let sig = Signature::parse("ipz").unwrap();
/// assert_eq!(sig.ret(), AbiKind::I32);
/// assert_eq!(sig.params(), &[AbiKind::Ptr, AbiKind::U64]);
/// assert_eq!(sig.to_string(), "ipz");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Signature {
    ret: AbiKind,
    params: Vec<AbiKind>,
}

impl Signature {
    /// Decodes a signature string (return kind first).
    pub fn parse(text: &str) -> Result<Self, SignatureError> {
        let mut chars = text.chars();
        let ret = match chars.next() {
            None => return Err(SignatureError::Empty),
            Some(c) => AbiKind::from_char(c).ok_or(SignatureError::UnknownChar(c))?,
        };
        let mut params = Vec::new();
        for c in chars {
            let kind = AbiKind::from_char(c).ok_or(SignatureError::UnknownChar(c))?;
            if kind == AbiKind::Void {
                return Err(SignatureError::VoidParameter);
            }
            params.push(kind);
        }
        Ok(Self { ret, params })
    }

    pub fn from_parts(ret: AbiKind, params: &[AbiKind]) -> Self {
        debug_assert!(!params.contains(&AbiKind::Void));
        Self {
            ret,
            params: params.to_vec(),
        }
    }

    pub fn ret(&self) -> AbiKind {
        self.ret
    }

    pub fn params(&self) -> &[AbiKind] {
        &self.params
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.ret.to_char())?;
        for p in &self.params {
            write!(f, "{}", p.to_char())?;
        }
        Ok(())
    }
}

/// Address of host-native code: a function exported by a host library, or a
/// trampoline synthesized by the wrapper cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostCode(*const ());

// Safety: HostCode is only an address; it owns nothing and is safe to share.
unsafe impl Send for HostCode {}
unsafe impl Sync for HostCode {}

impl HostCode {
    pub const fn null() -> Self {
        Self(std::ptr::null())
    }

    pub fn is_null(self) -> bool {
        self.0.is_null()
    }

    pub fn from_ptr(ptr: *const ()) -> Self {
        Self(ptr)
    }

    pub fn from_usize(addr: usize) -> Self {
        Self(addr as *const ())
    }

    pub fn as_ptr(self) -> *const () {
        self.0
    }

    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}
