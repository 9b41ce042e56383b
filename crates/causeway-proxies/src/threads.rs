//! Marshalling unit for `libthread.so`.
//!
//! Thread creation needs two interventions. The start routine is a
//! guest function the host will enter on a brand-new thread, so it is
//! swapped for a callable stub. And the guest sizes its stack for guest
//! frames only, while translation and marshalling push host frames onto
//! the same stack, so every request is widened to the configured
//! reserve.

use std::ffi::c_void;
use std::mem;
use std::ptr;

use causeway_abi::params::set_guest_return;
use causeway_abi::{AbiKind, GuestArch, GuestParams, HostCode, ProcessState};
use causeway_runtime::registry::TrampolineEntry;
use causeway_runtime::{Bridge, ProxyLibraryBuilder};

use crate::{guest_ptr, sig, ProxyError};

/// Status code shared by the bridged threading entry points.
pub type ThreadStatus = i32;

pub const THREAD_SUCCESS: ThreadStatus = 0;
/// Mirrors `EINVAL`; returned without reaching the host.
pub const THREAD_ERROR_INVALID: ThreadStatus = 22;

// Names the guest-wrapper entries are registered under.
const THREAD_START: &str = "threadStart";
const KEY_DESTRUCTOR: &str = "threadKeyDestructor";

// Host-side types of the entry points the unit calls directly.
type ThreadCreateFn = unsafe extern "C" fn(
    *mut u64,
    *const ThreadAttributes,
    *const c_void,
    *mut c_void,
) -> ThreadStatus;
type KeyCreateFn = unsafe extern "C" fn(*mut u32, *const c_void) -> ThreadStatus;
type SelfFn = extern "C" fn() -> u64;

/// Creation attributes. Stack sizes and thread handles are 64-bit on
/// every guest.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ThreadAttributes {
    /// Requested stack size in bytes; zero asks for the platform
    /// default.
    pub stack_size: u64,
    pub flags: u32,
    pub _reserved: u32,
}

const _: () = assert!(mem::size_of::<ThreadAttributes>() == 16);

/// `threadCreate(out_thread, attributes, start_routine, argument)`.
///
/// Rejects a null start routine before the host sees the request; hosts
/// fault on it rather than report it.
unsafe fn marshal_thread_create<A: GuestArch>(
    bridge: &Bridge<A>,
    callee: HostCode,
    state: &mut ProcessState<A>,
) {
    let (out_addr, attr_addr, start, argument) = {
        let mut params = GuestParams::new(state);
        (
            params.read_raw(AbiKind::Ptr),
            params.read_raw(AbiKind::Ptr),
            params.read_raw(AbiKind::Ptr),
            params.read_raw(AbiKind::Ptr),
        )
    };
    if start == 0 {
        set_guest_return(state, THREAD_ERROR_INVALID);
        return;
    }
    let stub = match bridge.wrap_known_guest_function(THREAD_START, start) {
        Some(code) => code,
        None => {
            log::error!("no guest wrapper registered for `{THREAD_START}`");
            set_guest_return(state, THREAD_ERROR_INVALID);
            return;
        }
    };
    let requested = if attr_addr == 0 {
        ThreadAttributes::default()
    } else {
        ptr::read_unaligned(guest_ptr::<A, ThreadAttributes>(attr_addr))
    };
    let attributes = ThreadAttributes {
        stack_size: bridge.effective_stack_size(requested.stack_size as usize) as u64,
        ..requested
    };
    let create: ThreadCreateFn = mem::transmute(callee.as_ptr());
    let mut handle = 0u64;
    let status = create(
        &mut handle,
        &attributes,
        stub.as_ptr() as *const c_void,
        argument as usize as *mut c_void,
    );
    if status == THREAD_SUCCESS {
        ptr::write_unaligned(guest_ptr::<A, u64>(out_addr), handle);
    }
    set_guest_return(state, status);
}

/// `threadKeyCreate(out_key, destructor)`.
///
/// The destructor is a guest function the host calls at thread exit
/// with the stored value; a null destructor stays null.
unsafe fn marshal_key_create<A: GuestArch>(
    bridge: &Bridge<A>,
    callee: HostCode,
    state: &mut ProcessState<A>,
) {
    let (out_addr, destructor) = {
        let mut params = GuestParams::new(state);
        (params.read_raw(AbiKind::Ptr), params.read_raw(AbiKind::Ptr))
    };
    let destructor = if destructor == 0 {
        ptr::null()
    } else {
        match bridge.wrap_known_guest_function(KEY_DESTRUCTOR, destructor) {
            Some(code) => code.as_ptr() as *const c_void,
            None => {
                log::error!("no guest wrapper registered for `{KEY_DESTRUCTOR}`");
                set_guest_return(state, THREAD_ERROR_INVALID);
                return;
            }
        }
    };
    let key_create: KeyCreateFn = mem::transmute(callee.as_ptr());
    let mut key = 0u32;
    let status = key_create(&mut key, destructor);
    if status == THREAD_SUCCESS {
        ptr::write_unaligned(guest_ptr::<A, u32>(out_addr), key);
    }
    set_guest_return(state, status);
}

/// Declares `libthread.so` against `bridge`: the trampoline table plus
/// the guest-wrapper entries for start routines and key destructors.
pub fn init_proxy_library<A: GuestArch>(bridge: &Bridge<A>) -> Result<(), ProxyError> {
    let registry = bridge.registry();
    registry.register_known_guest_wrapper(THREAD_START, |cache, guest| {
        cache.wrap_guest(THREAD_START, guest, &sig("pp"))
    });
    registry.register_known_guest_wrapper(KEY_DESTRUCTOR, |cache, guest| {
        cache.wrap_guest(KEY_DESTRUCTOR, guest, &sig("vp"))
    });
    ProxyLibraryBuilder::new("libthread.so")
        .trampoline(TrampolineEntry::custom_with_signature(
            "threadCreate",
            "ipppp",
            marshal_thread_create::<A>,
        ))
        .trampoline(TrampolineEntry::custom_with_signature(
            "threadKeyCreate",
            "ipp",
            marshal_key_create::<A>,
        ))
        .trampoline(TrampolineEntry::by_signature("threadJoin", "izp"))
        .trampoline(TrampolineEntry::by_signature("threadDetach", "iz"))
        .trampoline(TrampolineEntry::by_signature("threadYield", "v"))
        .trampoline(TrampolineEntry::marshalled::<SelfFn>("threadSelf"))
        .build(bridge)?;
    Ok(())
}
