//! Deep conversion of tagged extension chains.
//!
//! Several bridged APIs extend their call structures through a linked chain
//! of optional nodes: every node starts with a 32-bit tag identifying its
//! concrete type, followed by a pointer to the next node. A chain built by
//! guest code must be rebuilt in host layout before the host library sees
//! it (and a chain returned by the host rebuilt in guest layout), with
//! every `next` pointer relinked to the converted copy.
//!
//! A [`ChainTable`] holds one [`ChainRule`] per known tag, sorted once for
//! binary search. Conversion storage comes from a [`ConvArena`] scoped to
//! the enclosing call; allocation failure surfaces as [`OutOfMemory`],
//! never a panic, so marshalling units can translate it into the bridged
//! API's own status code.

use std::mem;
use std::ptr;

use thiserror::Error;

use crate::arch::GuestArch;
use crate::arena::{ConvArena, OutOfMemory};
use crate::value::GuestAddr;

/// Chain nodes are handed out at the strictest fundamental alignment so a
/// converter can overlay any `#[repr(C)]` node type on them.
const NODE_ALIGN: usize = 16;

/// Conversion failure. Unknown tags are a table-configuration problem;
/// exhaustion of the conversion arena is reported explicitly so callers can
/// abort the call instead of crashing.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChainError {
    #[error("duplicate chain rule for tag {0:#010x}")]
    DuplicateTag(u32),
    #[error("unrecognized extension tag {0:#010x} in structure chain")]
    UnknownTag(u32),
    #[error(transparent)]
    OutOfMemory(#[from] OutOfMemory),
}

/// Converts one node body between layouts. Receives raw pointers to the
/// whole source and destination nodes; the walker owns the header (tag and
/// `next`) and rewrites it after the converter runs, so converters only
/// need to fill the fields past the header. Nested allocations (arrays,
/// sub-chains) come from the same arena.
pub type ConvertFn =
    unsafe fn(src: *const u8, dst: *mut u8, arena: &ConvArena) -> Result<(), OutOfMemory>;

/// How to convert one known node type.
#[derive(Clone, Copy, Debug)]
pub struct ChainRule {
    tag: u32,
    guest_size: usize,
    host_size: usize,
    to_host: Option<ConvertFn>,
    to_guest: Option<ConvertFn>,
}

impl ChainRule {
    /// Rule for a node whose guest and host layouts are identical: the body
    /// is copied bitwise and only the header is rewritten.
    pub const fn bitwise(tag: u32, size: usize) -> Self {
        Self {
            tag,
            guest_size: size,
            host_size: size,
            to_host: None,
            to_guest: None,
        }
    }

    /// Rule for a node whose layouts differ (pointer-width fields, dropped
    /// padding). The converters rewrite the body in both directions.
    pub const fn converted(
        tag: u32,
        guest_size: usize,
        host_size: usize,
        to_host: ConvertFn,
        to_guest: ConvertFn,
    ) -> Self {
        Self {
            tag,
            guest_size,
            host_size,
            to_host: Some(to_host),
            to_guest: Some(to_guest),
        }
    }

    pub fn tag(&self) -> u32 {
        self.tag
    }
}

/// Offset of the `next` pointer inside a host-layout node.
pub const fn host_next_offset() -> usize {
    align_up(4, mem::align_of::<*const u8>())
}

/// Offset of the `next` pointer inside a guest-layout node.
pub const fn guest_next_offset<A: GuestArch>() -> usize {
    align_up(4, A::POINTER_SIZE)
}

const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// The set of node types one conversion site understands, sorted by tag.
#[derive(Debug)]
pub struct ChainTable {
    rules: Vec<ChainRule>,
}

impl ChainTable {
    /// Builds the table, sorting the rules by tag. Two rules for the same
    /// tag are rejected rather than silently shadowed.
    pub fn new(mut rules: Vec<ChainRule>) -> Result<Self, ChainError> {
        rules.sort_by_key(|rule| rule.tag);
        if let Some(pair) = rules.windows(2).find(|pair| pair[0].tag == pair[1].tag) {
            return Err(ChainError::DuplicateTag(pair[0].tag));
        }
        Ok(Self { rules })
    }

    pub fn find(&self, tag: u32) -> Option<&ChainRule> {
        self.rules
            .binary_search_by_key(&tag, |rule| rule.tag)
            .ok()
            .map(|index| &self.rules[index])
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Rebuilds the guest chain starting at `head` in host layout, storage
    /// backed by `arena`. Returns the converted head, null for an empty
    /// chain. Nothing is allocated for an empty chain.
    ///
    /// # Safety
    ///
    /// `head` must be zero or the address of a chain of nodes readable for
    /// their rules' guest sizes, each starting with a 32-bit tag and a
    /// guest-width `next` pointer, terminated by a zero `next`.
    pub unsafe fn to_host<A: GuestArch>(
        &self,
        head: GuestAddr,
        arena: &ConvArena,
    ) -> Result<*mut u8, ChainError> {
        let mut converted_head: *mut u8 = ptr::null_mut();
        // Host-side `next` slot awaiting the address of the next converted
        // node; null while the head is still pending.
        let mut pending_link: *mut u8 = ptr::null_mut();
        let mut cursor = head;
        while cursor != 0 {
            let src = cursor as usize as *const u8;
            let tag = ptr::read_unaligned(src as *const u32);
            let rule = self.find(tag).ok_or(ChainError::UnknownTag(tag))?;
            let dst = arena.alloc_bytes(rule.host_size, NODE_ALIGN)?;
            match rule.to_host {
                Some(convert) => convert(src, dst, arena)?,
                None => ptr::copy_nonoverlapping(src, dst, rule.host_size),
            }
            ptr::write_unaligned(dst as *mut u32, tag);
            ptr::write_unaligned(dst.add(host_next_offset()) as *mut *mut u8, ptr::null_mut());
            if pending_link.is_null() {
                converted_head = dst;
            } else {
                ptr::write_unaligned(pending_link as *mut *mut u8, dst);
            }
            pending_link = dst.add(host_next_offset());
            cursor = read_guest_ptr::<A>(cursor + guest_next_offset::<A>() as u64);
        }
        Ok(converted_head)
    }

    /// Inverse of [`ChainTable::to_host`]: rebuilds the host chain starting
    /// at `head` in guest layout.
    ///
    /// # Safety
    ///
    /// `head` must be null or point to a chain of host-layout nodes
    /// readable for their rules' host sizes, terminated by a null `next`.
    pub unsafe fn to_guest<A: GuestArch>(
        &self,
        head: *const u8,
        arena: &ConvArena,
    ) -> Result<GuestAddr, ChainError> {
        let mut converted_head: GuestAddr = 0;
        let mut pending_link: *mut u8 = ptr::null_mut();
        let mut cursor = head;
        while !cursor.is_null() {
            let tag = ptr::read_unaligned(cursor as *const u32);
            let rule = self.find(tag).ok_or(ChainError::UnknownTag(tag))?;
            let dst = arena.alloc_bytes(rule.guest_size, NODE_ALIGN)?;
            match rule.to_guest {
                Some(convert) => convert(cursor, dst, arena)?,
                None => ptr::copy_nonoverlapping(cursor, dst, rule.guest_size),
            }
            ptr::write_unaligned(dst as *mut u32, tag);
            write_guest_ptr::<A>(dst.add(guest_next_offset::<A>()), 0);
            if pending_link.is_null() {
                converted_head = dst as usize as GuestAddr;
            } else {
                write_guest_ptr::<A>(pending_link, dst as usize as GuestAddr);
            }
            pending_link = dst.add(guest_next_offset::<A>());
            cursor = ptr::read_unaligned(cursor.add(host_next_offset()) as *const *const u8);
        }
        Ok(converted_head)
    }
}

unsafe fn read_guest_ptr<A: GuestArch>(at: GuestAddr) -> GuestAddr {
    let p = at as usize as *const u8;
    if A::POINTER_SIZE == 4 {
        u64::from(ptr::read_unaligned(p as *const u32))
    } else {
        ptr::read_unaligned(p as *const u64)
    }
}

unsafe fn write_guest_ptr<A: GuestArch>(at: *mut u8, value: GuestAddr) {
    // 32-bit guests need conversion storage inside the guest address range.
    debug_assert!(value <= A::ADDR_MASK);
    if A::POINTER_SIZE == 4 {
        ptr::write_unaligned(at as *mut u32, value as u32);
    } else {
        ptr::write_unaligned(at as *mut u64, value);
    }
}
