//! Marshalling unit for `libsonic.so`.
//!
//! The library hands out instances as pointers to method tables, so the
//! symbol table covers little more than the bootstrap entry point.
//! Everything else becomes callable when an instance first crosses the
//! boundary: the wrapping side walks its table, swaps every slot for a
//! synthetic stub and keys the slot signatures per interface family by
//! the content of the id structure the guest queried with.

use std::ffi::c_void;
use std::mem;
use std::ptr;

use causeway_abi::params::set_guest_return;
use causeway_abi::{AbiKind, GuestArch, GuestParams, HostCode, ProcessState};
use causeway_runtime::registry::TrampolineEntry;
use causeway_runtime::{
    Bridge, InterfaceDescriptor, MarshalFn, ProxyLibraryBuilder, SymbolSource, VariableDescriptor,
    INTERFACE_ID_SIZE,
};

use crate::{guest_ptr, sig, write_guest_ptr_slot, ProxyError};

/// Status code shared by the bridged audio entry points.
pub type SonicStatus = u32;

pub const SONIC_SUCCESS: SonicStatus = 0;

/// Name the player-callback wrapper is registered under.
const PLAYER_CALLBACK: &str = "SonicPlayer::Callback";

/// Id symbols `libsonic.so` exports. The object, engine and player ids
/// key wrapping; the rest resolve for diagnostics only.
const ID_SYMBOLS: &[&str] = &[
    "SONIC_IID_OBJECT",
    "SONIC_IID_ENGINE",
    "SONIC_IID_PLAYER",
    "SONIC_IID_EQUALIZER",
];

// Host-side types of the entry points the unit calls directly.
type CreateEngineFn = unsafe extern "C" fn(*mut *mut c_void, u32, *const c_void) -> SonicStatus;
type CreatePlayerFn =
    unsafe extern "C" fn(*mut c_void, *mut *mut c_void, *mut c_void, *mut c_void) -> SonicStatus;
type GetInterfaceFn = unsafe extern "C" fn(*mut c_void, *const u8, *mut *mut c_void) -> SonicStatus;
type RegisterCallbackFn =
    unsafe extern "C" fn(*mut c_void, *const c_void, *mut c_void) -> SonicStatus;
type GetVersionFn = extern "C" fn() -> u32;

/// Method table of the root object family. Slots are 64-bit on every
/// guest.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SonicObjectMethods {
    pub realize: u64,
    pub resume: u64,
    pub get_state: u64,
    pub get_interface: u64,
    pub destroy: u64,
}

/// Method table of the engine family.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SonicEngineMethods {
    pub create_player: u64,
    pub query_supported_interfaces: u64,
}

/// Method table of the player family.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SonicPlayerMethods {
    pub set_play_state: u64,
    pub get_play_state: u64,
    pub get_duration: u64,
    pub register_callback: u64,
}

/// Replaces one table slot with a guest-callable stub, kind-driven.
/// Empty slots stay empty; hosts leave optional methods null.
fn wrap_slot<A: GuestArch>(
    bridge: &Bridge<A>,
    name: &'static str,
    signature: &str,
    slot: &mut u64,
) {
    if *slot == 0 {
        return;
    }
    *slot = bridge.cache().wrap_host(
        name,
        HostCode::from_usize(*slot as usize),
        Some(sig(signature)),
        None,
    );
}

/// Same as [`wrap_slot`] for a slot whose calls need a hand-written
/// marshaller.
fn wrap_custom_slot<A: GuestArch>(
    bridge: &Bridge<A>,
    name: &'static str,
    signature: &str,
    marshal: MarshalFn<A>,
    slot: &mut u64,
) {
    if *slot == 0 {
        return;
    }
    *slot = bridge.cache().wrap_host(
        name,
        HostCode::from_usize(*slot as usize),
        Some(sig(signature)),
        Some(marshal),
    );
}

/// An instance is a pointer to its method-table pointer, so one
/// dereference reaches the table. Registering the same instance again
/// finds synthetic addresses in the slots and leaves them untouched.
fn register_object_methods<A: GuestArch>(bridge: &Bridge<A>, instance: *mut ()) {
    let table = unsafe { &mut **(instance as *mut *mut SonicObjectMethods) };
    wrap_slot(bridge, "SonicObject::Realize", "upu", &mut table.realize);
    wrap_slot(bridge, "SonicObject::Resume", "upu", &mut table.resume);
    wrap_slot(bridge, "SonicObject::GetState", "upp", &mut table.get_state);
    wrap_custom_slot(
        bridge,
        "SonicObject::GetInterface",
        "uppp",
        marshal_get_interface::<A>,
        &mut table.get_interface,
    );
    wrap_slot(bridge, "SonicObject::Destroy", "vp", &mut table.destroy);
}

fn register_engine_methods<A: GuestArch>(bridge: &Bridge<A>, instance: *mut ()) {
    let table = unsafe { &mut **(instance as *mut *mut SonicEngineMethods) };
    wrap_custom_slot(
        bridge,
        "SonicEngine::CreatePlayer",
        "upppp",
        marshal_create_player::<A>,
        &mut table.create_player,
    );
    wrap_slot(
        bridge,
        "SonicEngine::QuerySupportedInterfaces",
        "upup",
        &mut table.query_supported_interfaces,
    );
}

fn register_player_methods<A: GuestArch>(bridge: &Bridge<A>, instance: *mut ()) {
    let table = unsafe { &mut **(instance as *mut *mut SonicPlayerMethods) };
    wrap_slot(bridge, "SonicPlayer::SetPlayState", "upu", &mut table.set_play_state);
    wrap_slot(bridge, "SonicPlayer::GetPlayState", "upp", &mut table.get_play_state);
    wrap_slot(bridge, "SonicPlayer::GetDuration", "upp", &mut table.get_duration);
    wrap_custom_slot(
        bridge,
        "SonicPlayer::RegisterCallback",
        "uppp",
        marshal_register_callback::<A>,
        &mut table.register_callback,
    );
}

/// `sonicCreateEngine(out_engine, num_options, options)`.
///
/// The object that comes back is wrapped before the guest ever sees the
/// handle, so its table is guest-callable from the first use.
unsafe fn marshal_create_engine<A: GuestArch>(
    bridge: &Bridge<A>,
    callee: HostCode,
    state: &mut ProcessState<A>,
) {
    let (out_addr, num_options, options) = {
        let mut params = GuestParams::new(state);
        (
            params.read_raw(AbiKind::Ptr),
            params.read_raw(AbiKind::U32),
            params.read_raw(AbiKind::Ptr),
        )
    };
    let create: CreateEngineFn = mem::transmute(callee.as_ptr());
    let mut engine: *mut c_void = ptr::null_mut();
    let status = create(&mut engine, num_options as u32, options as usize as *const c_void);
    if status == SONIC_SUCCESS && !engine.is_null() {
        register_object_methods::<A>(bridge, engine as *mut ());
        write_guest_ptr_slot::<A>(out_addr, engine as u64);
    }
    set_guest_return(state, status);
}

/// `SonicEngine::CreatePlayer(self, out_player, source, sink)`.
unsafe fn marshal_create_player<A: GuestArch>(
    bridge: &Bridge<A>,
    callee: HostCode,
    state: &mut ProcessState<A>,
) {
    let (engine, out_addr, source, sink) = {
        let mut params = GuestParams::new(state);
        (
            params.read_raw(AbiKind::Ptr),
            params.read_raw(AbiKind::Ptr),
            params.read_raw(AbiKind::Ptr),
            params.read_raw(AbiKind::Ptr),
        )
    };
    let create: CreatePlayerFn = mem::transmute(callee.as_ptr());
    let mut object: *mut c_void = ptr::null_mut();
    let status = create(
        engine as usize as *mut c_void,
        &mut object,
        source as usize as *mut c_void,
        sink as usize as *mut c_void,
    );
    if status == SONIC_SUCCESS && !object.is_null() {
        register_object_methods::<A>(bridge, object as *mut ());
        write_guest_ptr_slot::<A>(out_addr, object as u64);
    }
    set_guest_return(state, status);
}

/// `SonicObject::GetInterface(self, id, out_interface)`.
///
/// Forwards the query, then wraps whatever instance the host handed
/// back under the family the id names. The guest's id pointer reaches
/// host-readable bytes, so dispatch compares content, never addresses.
unsafe fn marshal_get_interface<A: GuestArch>(
    bridge: &Bridge<A>,
    callee: HostCode,
    state: &mut ProcessState<A>,
) {
    let (object, id_addr, out_addr) = {
        let mut params = GuestParams::new(state);
        (
            params.read_raw(AbiKind::Ptr),
            params.read_raw(AbiKind::Ptr),
            params.read_raw(AbiKind::Ptr),
        )
    };
    let get_interface: GetInterfaceFn = mem::transmute(callee.as_ptr());
    let mut instance: *mut c_void = ptr::null_mut();
    let status = get_interface(
        object as usize as *mut c_void,
        guest_ptr::<A, u8>(id_addr),
        &mut instance,
    );
    if status == SONIC_SUCCESS && !instance.is_null() {
        bridge.register_for(guest_ptr::<A, u8>(id_addr), instance as *mut ());
        write_guest_ptr_slot::<A>(out_addr, instance as u64);
    }
    set_guest_return(state, status);
}

/// `SonicPlayer::RegisterCallback(self, callback, context)`.
unsafe fn marshal_register_callback<A: GuestArch>(
    bridge: &Bridge<A>,
    callee: HostCode,
    state: &mut ProcessState<A>,
) {
    let (player, callback, context) = {
        let mut params = GuestParams::new(state);
        (
            params.read_raw(AbiKind::Ptr),
            params.read_raw(AbiKind::Ptr),
            params.read_raw(AbiKind::Ptr),
        )
    };
    let callback = if callback == 0 {
        ptr::null()
    } else {
        match bridge.wrap_known_guest_function(PLAYER_CALLBACK, callback) {
            Some(code) => code.as_ptr(),
            None => {
                log::error!("no guest wrapper registered for `{PLAYER_CALLBACK}`");
                ptr::null()
            }
        }
    };
    let register: RegisterCallbackFn = mem::transmute(callee.as_ptr());
    let status = register(
        player as usize as *mut c_void,
        callback as *const c_void,
        context as usize as *mut c_void,
    );
    set_guest_return(state, status);
}

/// Declares `libsonic.so` against `bridge` and resolves its interface
/// ids out of `source`.
///
/// # Safety
///
/// Every id symbol `source` resolves must point at [`INTERFACE_ID_SIZE`]
/// readable bytes.
pub unsafe fn init_proxy_library<A: GuestArch>(
    bridge: &Bridge<A>,
    source: &dyn SymbolSource,
) -> Result<(), ProxyError> {
    bridge
        .registry()
        .register_known_guest_wrapper(PLAYER_CALLBACK, |cache, guest| {
            cache.wrap_guest(PLAYER_CALLBACK, guest, &sig("vppu"))
        });
    ProxyLibraryBuilder::new("libsonic.so")
        .trampoline(TrampolineEntry::custom_with_signature(
            "sonicCreateEngine",
            "upup",
            marshal_create_engine::<A>,
        ))
        .trampoline(TrampolineEntry::marshalled::<GetVersionFn>("sonicGetVersion"))
        .variables(
            ID_SYMBOLS
                .iter()
                .copied()
                .map(|name| VariableDescriptor::new(name, INTERFACE_ID_SIZE)),
        )
        .variable("SONIC_API_LEVEL", 4)
        .build(bridge)?;
    bridge.install_interfaces(
        source,
        vec![
            InterfaceDescriptor {
                id_symbol: "SONIC_IID_OBJECT",
                register_methods: register_object_methods::<A>,
            },
            InterfaceDescriptor {
                id_symbol: "SONIC_IID_ENGINE",
                register_methods: register_engine_methods::<A>,
            },
            InterfaceDescriptor {
                id_symbol: "SONIC_IID_PLAYER",
                register_methods: register_player_methods::<A>,
            },
        ],
        ID_SYMBOLS,
    )?;
    Ok(())
}
