//! Function identity and wrapper cache.
//!
//! The bridge hands out exactly one stub per wrapped function, per
//! direction, for the life of the process:
//!
//! - Guest-callable stubs for host functions are *synthetic guest
//!   addresses* carved from a reserved range. No code lives there; when
//!   guest execution reaches one, the interpreter calls
//!   [`WrapperCache::find_host_call`] and hands control back to the bridge.
//! - Host-callable stubs for guest functions are genuine code, synthesized
//!   at run time as libffi closures that decode the native arguments into
//!   an [`ArgBuffer`] and drive the guest through [`GuestRuntime::invoke`].
//!
//! Identity is the core invariant: wrapping the same address twice returns
//! the same stub, and wrapping a stub of the opposite direction returns the
//! original address instead of a wrapper around a wrapper. Both rules keep
//! the pointer-equality expectations of bridged APIs intact.

use std::collections::HashMap;
use std::ffi::c_void;
use std::sync::{Arc, RwLock};

use libffi::low::ffi_cif;
use libffi::middle::{Arg, Cif, Closure, CodePtr, Type};

use causeway_abi::params::set_guest_return_raw;
use causeway_abi::{
    AbiKind, ArgBuffer, GuestAddr, GuestArch, GuestArgs, GuestParams, HostCode, ProcessState,
    Signature,
};

use crate::bridge::Bridge;

/// Byte stride between synthetic stub addresses.
pub const STUB_STRIDE: u64 = 16;

/// First synthetic stub address for a guest pointer width.
///
/// 64-bit guests get a range well above any mapping the loader creates;
/// 32-bit guests get the top 16 MiB of their address space.
pub fn reserved_stub_base(pointer_size: usize) -> GuestAddr {
    if pointer_size == 8 {
        0x7f00_0000_0000
    } else {
        0xff00_0000
    }
}

/// A hand-written forward marshaller. Decodes guest arguments from `state`,
/// calls the host function natively and writes the guest return slot. The
/// bridge reference gives marshallers access to the cache and registries
/// for nested wrapping.
pub type MarshalFn<A> = unsafe fn(&Bridge<A>, HostCode, &mut ProcessState<A>);

/// Executes guest code on behalf of the bridge.
///
/// Implemented by the interpreter the bridge is embedded in. `invoke` runs
/// the guest function at `addr` against the frame prepared in `args` and
/// captures the return registers back into it before returning.
pub trait GuestRuntime<A: GuestArch>: Send + Sync {
    fn invoke(&self, addr: GuestAddr, args: &mut ArgBuffer, ret: AbiKind);
}

/// Record of one guest-callable stub for a host function.
pub struct HostCallStub<A: GuestArch> {
    name: String,
    host_code: HostCode,
    signature: Option<Signature>,
    marshal: Option<MarshalFn<A>>,
    guest_addr: GuestAddr,
}

impl<A: GuestArch> HostCallStub<A> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn host_code(&self) -> HostCode {
        self.host_code
    }

    pub fn signature(&self) -> Option<&Signature> {
        self.signature.as_ref()
    }

    pub fn marshal(&self) -> Option<MarshalFn<A>> {
        self.marshal
    }

    /// The synthetic guest address this stub was issued under.
    pub fn guest_addr(&self) -> GuestAddr {
        self.guest_addr
    }
}

/// Record of one host-callable stub for a guest function. The closure owns
/// the executable trampoline; dropping it would invalidate `code`.
struct GuestCallStub {
    code: HostCode,
    _closure: Closure<'static>,
}

// Safety: the closure's code and userdata are immutable once created, the
// userdata is leaked for the process lifetime, and libffi trampolines are
// callable from any thread.
unsafe impl Send for GuestCallStub {}
unsafe impl Sync for GuestCallStub {}

/// Userdata baked into each guest-call stub.
struct StubData<A: GuestArch> {
    runtime: Arc<dyn GuestRuntime<A>>,
    guest_addr: GuestAddr,
    signature: Signature,
}

struct CacheInner<A: GuestArch> {
    next_slot: u64,
    /// Synthetic guest pc -> host call record.
    host_calls: HashMap<GuestAddr, Arc<HostCallStub<A>>>,
    /// Host function address -> its synthetic guest pc.
    by_host_code: HashMap<usize, GuestAddr>,
    /// Guest function address -> its host-callable closure stub.
    guest_calls: HashMap<GuestAddr, GuestCallStub>,
    /// Closure code address -> the guest function it dispatches to.
    by_stub_code: HashMap<usize, GuestAddr>,
}

impl<A: GuestArch> CacheInner<A> {
    fn lookup_host_wrap(&self, host: HostCode) -> Option<GuestAddr> {
        if let Some(&guest) = self.by_stub_code.get(&host.as_usize()) {
            // The "host function" is one of our guest-call stubs: hand the
            // original guest address back instead of wrapping a wrapper.
            return Some(guest);
        }
        let as_pc = host.as_usize() as GuestAddr;
        if self.host_calls.contains_key(&as_pc) {
            // Already a synthetic pc. Method tables rewritten in place get
            // re-registered with the value we wrote there earlier.
            return Some(as_pc);
        }
        self.by_host_code.get(&host.as_usize()).copied()
    }

    fn lookup_guest_wrap(&self, guest: GuestAddr) -> Option<HostCode> {
        if let Some(stub) = self.host_calls.get(&guest) {
            // The "guest function" is a synthetic stub for a host function:
            // the host can call the original directly.
            return Some(stub.host_code);
        }
        self.guest_calls.get(&guest).map(|s| s.code)
    }
}

/// The per-process wrapper cache. Shared by every guest thread; all methods
/// take `&self`.
pub struct WrapperCache<A: GuestArch> {
    runtime: Arc<dyn GuestRuntime<A>>,
    inner: RwLock<CacheInner<A>>,
}

impl<A: GuestArch> WrapperCache<A> {
    pub fn new(runtime: Arc<dyn GuestRuntime<A>>) -> Self {
        Self {
            runtime,
            inner: RwLock::new(CacheInner {
                next_slot: 0,
                host_calls: HashMap::new(),
                by_host_code: HashMap::new(),
                guest_calls: HashMap::new(),
                by_stub_code: HashMap::new(),
            }),
        }
    }

    pub fn runtime(&self) -> &Arc<dyn GuestRuntime<A>> {
        &self.runtime
    }

    /// Returns the guest-callable address for a host function, issuing a
    /// new synthetic stub on first sight.
    ///
    /// At least one of `signature` and `marshal` must be present or the
    /// stub could never be dispatched.
    pub fn wrap_host(
        &self,
        name: &str,
        host: HostCode,
        signature: Option<Signature>,
        marshal: Option<MarshalFn<A>>,
    ) -> GuestAddr {
        debug_assert!(
            signature.is_some() || marshal.is_some(),
            "host stub for `{name}` has no dispatch path"
        );
        {
            let inner = self.inner.read().unwrap();
            if let Some(pc) = inner.lookup_host_wrap(host) {
                return pc;
            }
        }
        let mut inner = self.inner.write().unwrap();
        // Losing a wrap race returns the winner's stub.
        if let Some(pc) = inner.lookup_host_wrap(host) {
            return pc;
        }
        let pc = reserved_stub_base(A::POINTER_SIZE) + inner.next_slot * STUB_STRIDE;
        inner.next_slot += 1;
        inner.by_host_code.insert(host.as_usize(), pc);
        inner.host_calls.insert(
            pc,
            Arc::new(HostCallStub {
                name: name.to_string(),
                host_code: host,
                signature,
                marshal,
                guest_addr: pc,
            }),
        );
        log::trace!("issued guest stub {pc:#x} for host function `{name}`");
        pc
    }

    /// Returns a host-callable code address for a guest function, creating
    /// the closure trampoline on first sight.
    pub fn wrap_guest(&self, name: &str, guest: GuestAddr, signature: &Signature) -> HostCode {
        {
            let inner = self.inner.read().unwrap();
            if let Some(code) = inner.lookup_guest_wrap(guest) {
                return code;
            }
        }
        let mut inner = self.inner.write().unwrap();
        if let Some(code) = inner.lookup_guest_wrap(guest) {
            return code;
        }

        let cif = Cif::new(
            signature.params().iter().map(|&k| kind_to_type(k)),
            kind_to_type(signature.ret()),
        );
        // Wrapper records live for the process; leaking the userdata lets
        // the closure be 'static.
        let data: &'static StubData<A> = Box::leak(Box::new(StubData {
            runtime: Arc::clone(&self.runtime),
            guest_addr: guest,
            signature: signature.clone(),
        }));
        let closure = Closure::new(cif, guest_stub_entry::<A>, data);
        let code = HostCode::from_usize(*closure.code_ptr() as usize);

        inner.by_stub_code.insert(code.as_usize(), guest);
        inner.guest_calls.insert(
            guest,
            GuestCallStub {
                code,
                _closure: closure,
            },
        );
        log::trace!(
            "issued host stub {:#x} for guest function `{name}` ({signature})",
            code.as_usize()
        );
        code
    }

    /// The host function behind a synthetic guest pc, if `pc` is one.
    /// Callers treat `None` as "an ordinary guest address".
    pub fn unwrap_host(&self, pc: GuestAddr) -> Option<HostCode> {
        let inner = self.inner.read().unwrap();
        inner.host_calls.get(&pc).map(|s| s.host_code)
    }

    /// The guest function behind a closure stub, if `code` is one.
    /// Callers treat `None` as "an ordinary host address".
    pub fn unwrap_guest(&self, code: HostCode) -> Option<GuestAddr> {
        let inner = self.inner.read().unwrap();
        inner.by_stub_code.get(&code.as_usize()).copied()
    }

    /// Interpreter contract: the dispatch record for a synthetic pc.
    pub fn find_host_call(&self, pc: GuestAddr) -> Option<Arc<HostCallStub<A>>> {
        let inner = self.inner.read().unwrap();
        inner.host_calls.get(&pc).cloned()
    }

    pub fn host_stub_count(&self) -> usize {
        self.inner.read().unwrap().host_calls.len()
    }

    pub fn guest_stub_count(&self) -> usize {
        self.inner.read().unwrap().guest_calls.len()
    }
}

fn kind_to_type(kind: AbiKind) -> Type {
    match kind {
        AbiKind::Void => Type::void(),
        AbiKind::I32 => Type::i32(),
        AbiKind::U32 => Type::u32(),
        AbiKind::I64 => Type::i64(),
        AbiKind::U64 => Type::u64(),
        AbiKind::Ptr => Type::pointer(),
        AbiKind::F32 => Type::f32(),
        AbiKind::F64 => Type::f64(),
    }
}

/// Entry point of every guest-call stub. libffi passes the native
/// arguments as an array of pointers to values; they are re-encoded into a
/// guest frame and the runtime executes the guest function synchronously.
unsafe extern "C" fn guest_stub_entry<A: GuestArch>(
    _cif: &ffi_cif,
    result: &mut u64,
    args: *const *const c_void,
    data: &StubData<A>,
) {
    let mut buffer = ArgBuffer::new();
    let mut frame = GuestArgs::<A>::new(&mut buffer);
    for (i, &kind) in data.signature.params().iter().enumerate() {
        let slot = *args.add(i);
        let bits = match kind {
            AbiKind::Void => 0,
            AbiKind::I32 => *(slot as *const i32) as i64 as u64,
            AbiKind::U32 => *(slot as *const u32) as u64,
            AbiKind::I64 => *(slot as *const i64) as u64,
            AbiKind::U64 => *(slot as *const u64),
            AbiKind::Ptr => *(slot as *const usize) as u64,
            AbiKind::F32 => (*(slot as *const f32)).to_bits() as u64,
            AbiKind::F64 => (*(slot as *const f64)).to_bits(),
        };
        frame.push_raw(kind, bits);
    }
    drop(frame);

    data.runtime
        .invoke(data.guest_addr, &mut buffer, data.signature.ret());

    // Integer results narrower than a slot are extended per libffi's
    // closure convention; floats are written in their natural form.
    match data.signature.ret() {
        AbiKind::Void => {}
        AbiKind::I32 => *result = buffer.int_result() as u32 as i32 as i64 as u64,
        AbiKind::F32 => {
            *(result as *mut u64 as *mut f32) = f32::from_bits(buffer.float_result_bits() as u32)
        }
        AbiKind::F64 => {
            *(result as *mut u64 as *mut f64) = f64::from_bits(buffer.float_result_bits())
        }
        _ => *result = buffer.int_result(),
    }
}

/// Calls a host function natively, driven by a runtime signature.
///
/// The generic dispatch path behind synthetic stubs whose registry entry
/// carries no hand-written marshaller: arguments are decoded kind-by-kind
/// from the guest frame, handed to libffi, and the native result goes back
/// into the guest return slot.
///
/// # Safety
///
/// `callee` must point to a host function whose actual type matches
/// `signature`, and the guest frame in `state` must carry arguments for it.
pub unsafe fn call_host_by_signature<A: GuestArch>(
    signature: &Signature,
    callee: HostCode,
    state: &mut ProcessState<A>,
) {
    enum RawArg {
        I32(i32),
        U32(u32),
        I64(i64),
        U64(u64),
        Ptr(usize),
        F32(f32),
        F64(f64),
    }

    let mut storage: Vec<RawArg> = Vec::with_capacity(signature.params().len());
    {
        let mut params = GuestParams::new(state);
        for &kind in signature.params() {
            let bits = params.read_raw(kind);
            storage.push(match kind {
                AbiKind::Void => unreachable!("void parameters are rejected at parse time"),
                AbiKind::I32 => RawArg::I32(bits as u32 as i32),
                AbiKind::U32 => RawArg::U32(bits as u32),
                AbiKind::I64 => RawArg::I64(bits as i64),
                AbiKind::U64 => RawArg::U64(bits),
                AbiKind::Ptr => RawArg::Ptr(bits as usize),
                AbiKind::F32 => RawArg::F32(f32::from_bits(bits as u32)),
                AbiKind::F64 => RawArg::F64(f64::from_bits(bits)),
            });
        }
    }
    let args: Vec<Arg> = storage
        .iter()
        .map(|a| match a {
            RawArg::I32(v) => Arg::new(v),
            RawArg::U32(v) => Arg::new(v),
            RawArg::I64(v) => Arg::new(v),
            RawArg::U64(v) => Arg::new(v),
            RawArg::Ptr(v) => Arg::new(v),
            RawArg::F32(v) => Arg::new(v),
            RawArg::F64(v) => Arg::new(v),
        })
        .collect();

    let cif = Cif::new(
        signature.params().iter().map(|&k| kind_to_type(k)),
        kind_to_type(signature.ret()),
    );
    let code = CodePtr(callee.as_ptr() as *mut c_void);
    match signature.ret() {
        AbiKind::Void => {
            cif.call::<()>(code, &args);
        }
        AbiKind::I32 => {
            let v: i32 = cif.call(code, &args);
            set_guest_return_raw(state, AbiKind::I32, v as u32 as u64);
        }
        AbiKind::U32 => {
            let v: u32 = cif.call(code, &args);
            set_guest_return_raw(state, AbiKind::U32, v as u64);
        }
        AbiKind::I64 => {
            let v: i64 = cif.call(code, &args);
            set_guest_return_raw(state, AbiKind::I64, v as u64);
        }
        AbiKind::U64 => {
            let v: u64 = cif.call(code, &args);
            set_guest_return_raw(state, AbiKind::U64, v);
        }
        AbiKind::Ptr => {
            let v: usize = cif.call(code, &args);
            set_guest_return_raw(state, AbiKind::Ptr, v as u64);
        }
        AbiKind::F32 => {
            let v: f32 = cif.call(code, &args);
            set_guest_return_raw(state, AbiKind::F32, v.to_bits() as u64);
        }
        AbiKind::F64 => {
            let v: f64 = cif.call(code, &args);
            set_guest_return_raw(state, AbiKind::F64, v.to_bits());
        }
    }
}
