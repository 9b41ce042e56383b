//! Scenario tests for the audio unit.
//!
//! The host side is a miniature in-process `libsonic.so`: leaked method
//! tables, a get-interface that routes by id content, and callback
//! registration that captures what the host was handed.

use std::ffi::c_void;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use causeway_abi::params::guest_return;
use causeway_abi::{AbiKind, ArgBuffer, Arm64, GuestAddr, HostArgs, HostCode, ProcessState};
use causeway_proxies::audio::{
    init_proxy_library, SonicEngineMethods, SonicObjectMethods, SonicPlayerMethods, SonicStatus,
    SONIC_SUCCESS,
};
use causeway_runtime::{
    reserved_stub_base, Bridge, BridgeConfig, GuestRuntime, SymbolTable, INTERFACE_ID_SIZE,
};

static OBJECT_ID: [u8; INTERFACE_ID_SIZE] = [0x5A; INTERFACE_ID_SIZE];
static ENGINE_ID: [u8; INTERFACE_ID_SIZE] = [0x5B; INTERFACE_ID_SIZE];
static PLAYER_ID: [u8; INTERFACE_ID_SIZE] = [0x5C; INTERFACE_ID_SIZE];
static EQUALIZER_ID: [u8; INTERFACE_ID_SIZE] = [0x5D; INTERFACE_ID_SIZE];

fn id_source() -> SymbolTable {
    let mut table = SymbolTable::new();
    table.insert_data("SONIC_IID_OBJECT", OBJECT_ID.as_ptr());
    table.insert_data("SONIC_IID_ENGINE", ENGINE_ID.as_ptr());
    table.insert_data("SONIC_IID_PLAYER", PLAYER_ID.as_ptr());
    table.insert_data("SONIC_IID_EQUALIZER", EQUALIZER_ID.as_ptr());
    table
}

/// Builds an instance the way the host library lays one out: a pointer
/// to its method-table pointer. Tables live for the process.
fn leak_instance<T>(table: T) -> *mut c_void {
    let table = Box::leak(Box::new(table));
    let slot = Box::leak(Box::new(table as *mut T));
    slot as *mut *mut T as *mut c_void
}

fn object_table() -> SonicObjectMethods {
    SonicObjectMethods {
        realize: host_realize as usize as u64,
        resume: host_realize as usize as u64,
        get_state: host_get_state as usize as u64,
        get_interface: host_get_interface as usize as u64,
        destroy: host_destroy as usize as u64,
    }
}

// ===== Host-side fakes =====

unsafe extern "C" fn host_realize(_object: *mut c_void, _blocking: u32) -> SonicStatus {
    SONIC_SUCCESS
}

unsafe extern "C" fn host_get_state(_object: *mut c_void, _out: *mut u32) -> SonicStatus {
    SONIC_SUCCESS
}

unsafe extern "C" fn host_destroy(_object: *mut c_void) {}

unsafe extern "C" fn host_create_engine(
    out: *mut *mut c_void,
    _num_options: u32,
    _options: *const c_void,
) -> SonicStatus {
    *out = leak_instance(object_table());
    SONIC_SUCCESS
}

/// One engine interface for the process, so a repeated query returns
/// the same instance the way a real host does.
static ENGINE_INTERFACE: AtomicUsize = AtomicUsize::new(0);

unsafe extern "C" fn host_get_interface(
    _object: *mut c_void,
    id: *const u8,
    out: *mut *mut c_void,
) -> SonicStatus {
    let mut bytes = [0u8; INTERFACE_ID_SIZE];
    ptr::copy_nonoverlapping(id, bytes.as_mut_ptr(), INTERFACE_ID_SIZE);
    if bytes == ENGINE_ID {
        if ENGINE_INTERFACE.load(Ordering::SeqCst) == 0 {
            let instance = leak_instance(SonicEngineMethods {
                create_player: host_create_player as usize as u64,
                query_supported_interfaces: host_query_supported as usize as u64,
            });
            ENGINE_INTERFACE.store(instance as usize, Ordering::SeqCst);
        }
        *out = ENGINE_INTERFACE.load(Ordering::SeqCst) as *mut c_void;
        SONIC_SUCCESS
    } else if bytes == PLAYER_ID {
        *out = leak_instance(SonicPlayerMethods {
            set_play_state: host_set_play_state as usize as u64,
            get_play_state: host_get_state as usize as u64,
            get_duration: host_get_state as usize as u64,
            register_callback: host_register_callback as usize as u64,
        });
        SONIC_SUCCESS
    } else {
        *out = ptr::null_mut();
        12
    }
}

unsafe extern "C" fn host_query_supported(
    _engine: *mut c_void,
    _index: u32,
    _out: *mut c_void,
) -> SonicStatus {
    SONIC_SUCCESS
}

unsafe extern "C" fn host_create_player(
    _engine: *mut c_void,
    out: *mut *mut c_void,
    _source: *mut c_void,
    _sink: *mut c_void,
) -> SonicStatus {
    *out = leak_instance(object_table());
    SONIC_SUCCESS
}

unsafe extern "C" fn host_set_play_state(_player: *mut c_void, _state: u32) -> SonicStatus {
    SONIC_SUCCESS
}

static REGISTERED_CALLBACK: AtomicUsize = AtomicUsize::new(0);

unsafe extern "C" fn host_register_callback(
    _player: *mut c_void,
    callback: *const c_void,
    _context: *mut c_void,
) -> SonicStatus {
    REGISTERED_CALLBACK.store(callback as usize, Ordering::SeqCst);
    SONIC_SUCCESS
}

// ===== Guest-side runtime =====

/// Records every player-callback invocation the stub forwards.
struct CallbackRuntime {
    calls: Mutex<Vec<(GuestAddr, u64, u64, u32)>>,
}

impl GuestRuntime<Arm64> for CallbackRuntime {
    fn invoke(&self, addr: GuestAddr, args: &mut ArgBuffer, _ret: AbiKind) {
        let (context, buffer, size) = {
            let mut reader = HostArgs::<Arm64>::new(args);
            (
                reader.read_raw(AbiKind::Ptr),
                reader.read_raw(AbiKind::Ptr),
                reader.read_raw(AbiKind::U32) as u32,
            )
        };
        self.calls.lock().unwrap().push((addr, context, buffer, size));
    }
}

fn dispatch(bridge: &Bridge<Arm64>, pc: GuestAddr, regs: &[u64]) -> ProcessState<Arm64> {
    let mut state = ProcessState::<Arm64>::new();
    state.cpu.x[..regs.len()].copy_from_slice(regs);
    assert!(unsafe { bridge.dispatch_host_call(pc, &mut state) });
    state
}

// ===== Scenarios =====

#[test]
fn test_engine_to_player_flow() {
    let runtime = Arc::new(CallbackRuntime {
        calls: Mutex::new(Vec::new()),
    });
    let bridge = Bridge::new(BridgeConfig::default(), runtime.clone());
    unsafe { init_proxy_library(&bridge, &id_source()) }.unwrap();

    // Bootstrap: the engine object arrives with its table wrapped.
    let pc_create = bridge
        .wrap_host_function(
            "sonicCreateEngine",
            HostCode::from_ptr(host_create_engine as *const ()),
        )
        .unwrap();
    let mut out_engine = 0u64;
    let state = dispatch(
        &bridge,
        pc_create,
        &[&mut out_engine as *mut u64 as u64, 0, 0],
    );
    assert_eq!(guest_return::<Arm64, u32>(&state), SONIC_SUCCESS);
    assert_ne!(out_engine, 0);

    let engine_object = unsafe { **(out_engine as usize as *mut *mut SonicObjectMethods) };
    let base = reserved_stub_base(8);
    assert!(engine_object.get_interface >= base);
    assert!(engine_object.realize >= base);

    // Query the engine interface by id content.
    let mut out_iface = 0u64;
    let state = dispatch(
        &bridge,
        engine_object.get_interface,
        &[
            out_engine,
            ENGINE_ID.as_ptr() as u64,
            &mut out_iface as *mut u64 as u64,
        ],
    );
    assert_eq!(guest_return::<Arm64, u32>(&state), SONIC_SUCCESS);
    assert_ne!(out_iface, 0);
    let engine_table = unsafe { **(out_iface as usize as *mut *mut SonicEngineMethods) };
    assert!(engine_table.create_player >= base);

    // Asking again returns the same instance with the table untouched.
    let mut out_again = 0u64;
    dispatch(
        &bridge,
        engine_object.get_interface,
        &[
            out_engine,
            ENGINE_ID.as_ptr() as u64,
            &mut out_again as *mut u64 as u64,
        ],
    );
    assert_eq!(out_again, out_iface);
    let again = unsafe { **(out_iface as usize as *mut *mut SonicEngineMethods) };
    assert_eq!(again, engine_table);

    // Create a player through the wrapped engine method.
    let mut out_player = 0u64;
    let state = dispatch(
        &bridge,
        engine_table.create_player,
        &[out_iface, &mut out_player as *mut u64 as u64, 0, 0],
    );
    assert_eq!(guest_return::<Arm64, u32>(&state), SONIC_SUCCESS);
    let player_object = unsafe { **(out_player as usize as *mut *mut SonicObjectMethods) };
    // Same host functions behind both object tables, so the stubs match.
    assert_eq!(player_object.get_interface, engine_object.get_interface);

    // Reach the player interface and register a guest callback on it.
    let mut out_player_iface = 0u64;
    dispatch(
        &bridge,
        player_object.get_interface,
        &[
            out_player,
            PLAYER_ID.as_ptr() as u64,
            &mut out_player_iface as *mut u64 as u64,
        ],
    );
    let player_table = unsafe { **(out_player_iface as usize as *mut *mut SonicPlayerMethods) };
    let state = dispatch(
        &bridge,
        player_table.register_callback,
        &[out_player_iface, 0x8800, 0xBEEF],
    );
    assert_eq!(guest_return::<Arm64, u32>(&state), SONIC_SUCCESS);

    // The host holds a stub, not the guest address.
    let stored = REGISTERED_CALLBACK.load(Ordering::SeqCst);
    assert_ne!(stored as u64, 0x8800);
    assert_eq!(
        bridge.cache().unwrap_guest(HostCode::from_usize(stored)),
        Some(0x8800)
    );

    // The host fires the callback natively; the guest function runs.
    let callback: unsafe extern "C" fn(*mut c_void, *mut c_void, u32) =
        unsafe { mem::transmute(stored as *const ()) };
    unsafe { callback(0xBEEF as *mut c_void, 0x1234 as *mut c_void, 64) };
    assert_eq!(
        runtime.calls.lock().unwrap().as_slice(),
        &[(0x8800, 0xBEEF, 0x1234, 64)]
    );
}

struct NullRuntime;

impl GuestRuntime<Arm64> for NullRuntime {
    fn invoke(&self, _addr: GuestAddr, _args: &mut ArgBuffer, _ret: AbiKind) {}
}

extern "C" fn host_get_version() -> u32 {
    0x0004_0100
}

#[test]
fn test_get_version_rides_the_typed_codec() {
    let bridge = Bridge::new(BridgeConfig::default(), Arc::new(NullRuntime));
    unsafe { init_proxy_library(&bridge, &id_source()) }.unwrap();
    let pc = bridge
        .wrap_host_function(
            "sonicGetVersion",
            HostCode::from_ptr(host_get_version as *const ()),
        )
        .unwrap();
    let state = dispatch(&bridge, pc, &[]);
    assert_eq!(guest_return::<Arm64, u32>(&state), 0x0004_0100);
}

unsafe extern "C" fn host_grant_anything(
    _object: *mut c_void,
    _id: *const u8,
    out: *mut *mut c_void,
) -> SonicStatus {
    *out = leak_instance(object_table());
    SONIC_SUCCESS
}

#[test]
#[should_panic(expected = "unknown interface id `SONIC_IID_EQUALIZER`")]
fn test_granted_but_unknown_interface_is_fatal() {
    let bridge = Bridge::<Arm64>::new(BridgeConfig::default(), Arc::new(NullRuntime));
    unsafe { init_proxy_library(&bridge, &id_source()) }.unwrap();

    // An object that grants any interface it is asked for, including
    // one the bridge has no wrapping family for.
    let instance = leak_instance(SonicObjectMethods {
        realize: 0,
        resume: 0,
        get_state: 0,
        get_interface: host_grant_anything as usize as u64,
        destroy: 0,
    });
    unsafe { bridge.register_for(OBJECT_ID.as_ptr(), instance as *mut ()) };
    let table = unsafe { **(instance as *mut *mut SonicObjectMethods) };

    let mut out_iface = 0u64;
    dispatch(
        &bridge,
        table.get_interface,
        &[
            instance as u64,
            EQUALIZER_ID.as_ptr() as u64,
            &mut out_iface as *mut u64 as u64,
        ],
    );
}
