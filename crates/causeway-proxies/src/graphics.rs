//! Marshalling unit for `libgfx.so`.
//!
//! Most entry points ride the kind-driven codec. Three concerns need
//! hand-written marshallers:
//!
//! - extension enumeration: the host set is queried until it is stable,
//!   then filtered down to what the conversion layer understands
//! - recorder state: the level each recorder was allocated with is
//!   tracked so begin-recording can decide whether inheritance state
//!   crosses the boundary
//! - callable results: proc-addr lookups and recorder callbacks hand
//!   out wrapped addresses instead of raw ones

use std::collections::HashMap;
use std::ffi::{c_char, c_void, CStr};
use std::mem;
use std::ptr;
use std::sync::{Mutex, OnceLock};

use causeway_abi::params::{set_guest_return, set_guest_return_raw};
use causeway_abi::{
    AbiKind, ChainError, ChainRule, ChainTable, ConvArena, GuestAddr, GuestArch, GuestParams,
    HostCode, OutOfMemory, ProcessState,
};
use causeway_runtime::registry::TrampolineEntry;
use causeway_runtime::{Bridge, ProxyLibraryBuilder};

use crate::{guest_ptr, sig, ProxyError};

/// Status code shared by the bridged graphics entry points.
pub type GfxStatus = i32;

pub const GFX_SUCCESS: GfxStatus = 0;
pub const GFX_ERROR_OUT_OF_MEMORY: GfxStatus = -1;
/// A buffer query wrote fewer elements than the host had available.
pub const GFX_INCOMPLETE: GfxStatus = 1;

/// Capacity of [`GfxExtensionProperties::name`], terminator included.
pub const GFX_MAX_EXTENSION_NAME: usize = 256;

pub const GFX_RECORDER_LEVEL_PRIMARY: u32 = 0;
pub const GFX_RECORDER_LEVEL_SECONDARY: u32 = 1;

// Structure tags understood by the recording chain walker.
pub const TAG_RECORDING_BEGIN_INFO: u32 = 0x2001;
pub const TAG_RECORDER_INHERITANCE: u32 = 0x2002;
pub const TAG_DEVICE_GROUP_BEGIN: u32 = 0x2003;

/// Name the recorder-callback wrapper is registered under.
const RECORDER_CALLBACK: &str = "gfxRecorderCallback";

// Host-side types of the entry points the unit calls directly.
type CreateDeviceFn = extern "C" fn(*mut c_void, *const c_void, *mut *mut c_void) -> GfxStatus;
type DestroyDeviceFn = extern "C" fn(*mut c_void);
type EnumerateExtensionsFn =
    unsafe extern "C" fn(*mut c_void, *mut u32, *mut GfxExtensionProperties) -> GfxStatus;
type AllocateRecordersFn =
    unsafe extern "C" fn(*mut c_void, *const GfxRecorderAllocateInfo, *mut u64) -> GfxStatus;
type BeginRecordingFn = unsafe extern "C" fn(u64, *const GfxRecordingBeginInfo) -> GfxStatus;
type FreeRecordersFn = unsafe extern "C" fn(*mut c_void, u32, *const u64);
type GetProcAddrFn = unsafe extern "C" fn(*mut c_void, *const c_char) -> *const c_void;
type SetRecorderCallbackFn = unsafe extern "C" fn(u64, *const c_void, *mut c_void) -> GfxStatus;
type GetRecorderCallbackFn = unsafe extern "C" fn(u64) -> *const c_void;

/// One extension row as the host enumeration reports it.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GfxExtensionProperties {
    pub name: [u8; GFX_MAX_EXTENSION_NAME],
    pub spec_version: u32,
}

const _: () = assert!(mem::size_of::<GfxExtensionProperties>() == 260);

impl Default for GfxExtensionProperties {
    fn default() -> Self {
        Self {
            name: [0; GFX_MAX_EXTENSION_NAME],
            spec_version: 0,
        }
    }
}

impl GfxExtensionProperties {
    /// Row with `name` copied in NUL-terminated. Names at the capacity
    /// limit are truncated.
    pub fn named(name: &str, spec_version: u32) -> Self {
        let mut row = Self::default();
        let len = name.len().min(GFX_MAX_EXTENSION_NAME - 1);
        row.name[..len].copy_from_slice(&name.as_bytes()[..len]);
        row.spec_version = spec_version;
        row
    }

    /// The name bytes up to the first NUL.
    pub fn name_bytes(&self) -> &[u8] {
        let end = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.name.len());
        &self.name[..end]
    }
}

/// Extensions the conversion layer can marshal, each with the highest
/// revision it understands. Sorted by name.
const SUPPORTED_EXTENSIONS: &[(&str, u32)] = &[
    ("GFX_EXT_debug_report", 9),
    ("GFX_EXT_external_memory", 1),
    ("GFX_KHR_surface_present", 25),
    ("GFX_KHR_swapchain", 70),
];

fn supported_revision(name: &[u8]) -> Option<u32> {
    SUPPORTED_EXTENSIONS
        .binary_search_by(|(candidate, _)| candidate.as_bytes().cmp(name))
        .ok()
        .map(|index| SUPPORTED_EXTENSIONS[index].1)
}

/// Runs the two-call enumeration pattern until it yields a stable
/// snapshot: the count query and the buffer query agree on the element
/// count and the buffer query reports completion. Hosts may grow or
/// shrink the set between the two calls; an inconsistent round is
/// retried rather than returned.
pub fn stable_extension_snapshot<F>(
    mut enumerate: F,
) -> Result<Vec<GfxExtensionProperties>, GfxStatus>
where
    F: FnMut(&mut u32, Option<&mut [GfxExtensionProperties]>) -> GfxStatus,
{
    loop {
        let mut count = 0u32;
        let status = enumerate(&mut count, None);
        if status != GFX_SUCCESS {
            return Err(status);
        }
        let mut rows = vec![GfxExtensionProperties::default(); count as usize];
        let mut written = count;
        let status = enumerate(&mut written, Some(&mut rows));
        if status == GFX_INCOMPLETE || written != count {
            log::trace!("host extension set changed between queries, retrying");
            continue;
        }
        if status != GFX_SUCCESS {
            return Err(status);
        }
        rows.truncate(written as usize);
        return Ok(rows);
    }
}

/// Drops rows the conversion layer cannot marshal and clamps each
/// survivor's revision to the highest one supported. Pure, so applied
/// to a stable snapshot the filtered count is stable too.
pub fn filter_extension_properties(
    rows: &[GfxExtensionProperties],
) -> Vec<GfxExtensionProperties> {
    rows.iter()
        .filter_map(|row| {
            let cap = supported_revision(row.name_bytes())?;
            let mut kept = *row;
            kept.spec_version = kept.spec_version.min(cap);
            Some(kept)
        })
        .collect()
}

/// Answers the guest's count or buffer query from a filtered row set.
/// A null `out` is a count query. A short buffer gets a partial write
/// and [`GFX_INCOMPLETE`].
///
/// # Safety
///
/// `count` must be valid for reads and writes. A non-null `out` must be
/// valid for writes of `*count` elements.
pub unsafe fn write_enumeration(
    rows: &[GfxExtensionProperties],
    count: *mut u32,
    out: *mut GfxExtensionProperties,
) -> GfxStatus {
    if out.is_null() {
        *count = rows.len() as u32;
        return GFX_SUCCESS;
    }
    let capacity = *count as usize;
    let written = capacity.min(rows.len());
    ptr::copy_nonoverlapping(rows.as_ptr(), out, written);
    *count = written as u32;
    if written < rows.len() {
        GFX_INCOMPLETE
    } else {
        GFX_SUCCESS
    }
}

/// Tracks the level each live recorder handle was allocated with. The
/// begin marshaller consults it to decide whether inheritance state
/// crosses the boundary.
pub struct RecorderMetadata {
    levels: Mutex<HashMap<u64, u32>>,
}

impl RecorderMetadata {
    pub fn new() -> Self {
        Self {
            levels: Mutex::new(HashMap::new()),
        }
    }

    /// Records `handle` at `level`. A handle already present keeps its
    /// original level; hosts recycle handle values and the free side is
    /// what retires them.
    pub fn record(&self, handle: u64, level: u32) {
        self.levels.lock().unwrap().entry(handle).or_insert(level);
    }

    /// Whether `handle` was allocated as a secondary recorder. Unknown
    /// handles count as primary, which keeps inheritance state away
    /// from the host.
    pub fn is_secondary(&self, handle: u64) -> bool {
        self.levels.lock().unwrap().get(&handle).copied() == Some(GFX_RECORDER_LEVEL_SECONDARY)
    }

    pub fn forget(&self, handle: u64) {
        self.levels.lock().unwrap().remove(&handle);
    }

    pub fn len(&self) -> usize {
        self.levels.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for RecorderMetadata {
    fn default() -> Self {
        Self::new()
    }
}

static RECORDER_METADATA: OnceLock<RecorderMetadata> = OnceLock::new();

/// Process-wide recorder metadata shared by the allocate, begin and
/// free marshallers.
pub fn recorder_metadata() -> &'static RecorderMetadata {
    RECORDER_METADATA.get_or_init(RecorderMetadata::new)
}

/// Fixed part of a begin-recording request in host layout. 64-bit
/// guests share this layout.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct GfxRecordingBeginInfo {
    pub tag: u32,
    pub next: u64,
    pub flags: u32,
    pub inheritance: u64,
}

/// The same request as a 32-bit guest lays it out.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct GfxRecordingBeginInfo32 {
    pub tag: u32,
    pub next: u32,
    pub flags: u32,
    pub inheritance: u32,
}

/// Inheritance state a secondary recorder begins with. Render-target
/// handles are 64-bit on every guest.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct GfxRecorderInheritanceInfo {
    pub tag: u32,
    pub next: u64,
    pub render_target: u64,
    pub subpass: u32,
    pub query_flags: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct GfxRecorderInheritanceInfo32 {
    pub tag: u32,
    pub next: u32,
    pub render_target: u64,
    pub subpass: u32,
    pub query_flags: u32,
}

/// Optional chain node restricting recording to a device subset.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct GfxDeviceGroupBeginInfo {
    pub tag: u32,
    pub next: u64,
    pub device_mask: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct GfxDeviceGroupBeginInfo32 {
    pub tag: u32,
    pub next: u32,
    pub device_mask: u32,
}

/// Allocation request for a batch of recorders.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct GfxRecorderAllocateInfo {
    pub tag: u32,
    pub next: u64,
    pub pool: u64,
    pub level: u32,
    pub count: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct GfxRecorderAllocateInfo32 {
    pub tag: u32,
    pub next: u32,
    pub pool: u64,
    pub level: u32,
    pub count: u32,
}

const _: () = assert!(mem::size_of::<GfxRecordingBeginInfo>() == 32);
const _: () = assert!(mem::size_of::<GfxRecordingBeginInfo32>() == 16);
const _: () = assert!(mem::size_of::<GfxRecorderInheritanceInfo>() == 32);
const _: () = assert!(mem::size_of::<GfxRecorderInheritanceInfo32>() == 24);
const _: () = assert!(mem::size_of::<GfxDeviceGroupBeginInfo>() == 24);
const _: () = assert!(mem::size_of::<GfxDeviceGroupBeginInfo32>() == 12);
const _: () = assert!(mem::size_of::<GfxRecorderAllocateInfo>() == 32);
const _: () = assert!(mem::size_of::<GfxRecorderAllocateInfo32>() == 24);

/// Chain rules for the recording chain, keyed by guest pointer width.
/// 64-bit guests share the host node layout; 32-bit guests carry narrow
/// `next` links and get widened per node.
fn recording_chain<A: GuestArch>() -> &'static ChainTable {
    static WIDE: OnceLock<ChainTable> = OnceLock::new();
    static NARROW: OnceLock<ChainTable> = OnceLock::new();
    if A::POINTER_SIZE == 8 {
        WIDE.get_or_init(|| {
            ChainTable::new(vec![ChainRule::bitwise(
                TAG_DEVICE_GROUP_BEGIN,
                mem::size_of::<GfxDeviceGroupBeginInfo>(),
            )])
            .expect("recording chain tags are distinct")
        })
    } else {
        NARROW.get_or_init(|| {
            ChainTable::new(vec![ChainRule::converted(
                TAG_DEVICE_GROUP_BEGIN,
                mem::size_of::<GfxDeviceGroupBeginInfo32>(),
                mem::size_of::<GfxDeviceGroupBeginInfo>(),
                widen_device_group,
                narrow_device_group,
            )])
            .expect("recording chain tags are distinct")
        })
    }
}

unsafe fn widen_device_group(
    src: *const u8,
    dst: *mut u8,
    _arena: &ConvArena,
) -> Result<(), OutOfMemory> {
    let node = ptr::read_unaligned(src as *const GfxDeviceGroupBeginInfo32);
    (*(dst as *mut GfxDeviceGroupBeginInfo)).device_mask = node.device_mask;
    Ok(())
}

unsafe fn narrow_device_group(
    src: *const u8,
    dst: *mut u8,
    _arena: &ConvArena,
) -> Result<(), OutOfMemory> {
    let node = ptr::read_unaligned(src as *const GfxDeviceGroupBeginInfo);
    (*(dst as *mut GfxDeviceGroupBeginInfo32)).device_mask = node.device_mask;
    Ok(())
}

/// Rebuilds a guest begin-recording request in host layout inside
/// `arena`. The inheritance block crosses the boundary only for
/// recorders allocated as secondary; hosts ignore it on primary
/// recorders and guests routinely leave it dangling there.
pub unsafe fn convert_begin_info<A: GuestArch>(
    recorder: u64,
    info: GuestAddr,
    metadata: &RecorderMetadata,
    arena: &ConvArena,
) -> Result<*const GfxRecordingBeginInfo, ChainError> {
    if info == 0 {
        return Ok(ptr::null());
    }
    let (guest_next, flags, guest_inheritance) = if A::POINTER_SIZE == 8 {
        let src = ptr::read_unaligned(guest_ptr::<A, GfxRecordingBeginInfo>(info));
        (src.next, src.flags, src.inheritance)
    } else {
        let src = ptr::read_unaligned(guest_ptr::<A, GfxRecordingBeginInfo32>(info));
        (u64::from(src.next), src.flags, u64::from(src.inheritance))
    };
    let mut converted = GfxRecordingBeginInfo {
        tag: TAG_RECORDING_BEGIN_INFO,
        next: recording_chain::<A>().to_host::<A>(guest_next, arena)? as u64,
        flags,
        inheritance: 0,
    };
    if guest_inheritance != 0 && metadata.is_secondary(recorder) {
        converted.inheritance = convert_inheritance::<A>(guest_inheritance, arena)? as u64;
    }
    Ok(arena.alloc(converted)? as *const GfxRecordingBeginInfo)
}

unsafe fn convert_inheritance<A: GuestArch>(
    info: GuestAddr,
    arena: &ConvArena,
) -> Result<*mut GfxRecorderInheritanceInfo, ChainError> {
    let mut converted = if A::POINTER_SIZE == 8 {
        ptr::read_unaligned(guest_ptr::<A, GfxRecorderInheritanceInfo>(info))
    } else {
        let src = ptr::read_unaligned(guest_ptr::<A, GfxRecorderInheritanceInfo32>(info));
        GfxRecorderInheritanceInfo {
            tag: 0,
            next: u64::from(src.next),
            render_target: src.render_target,
            subpass: src.subpass,
            query_flags: src.query_flags,
        }
    };
    converted.tag = TAG_RECORDER_INHERITANCE;
    converted.next = recording_chain::<A>().to_host::<A>(converted.next, arena)? as u64;
    Ok(arena.alloc(converted)?)
}

unsafe fn read_allocate_info<A: GuestArch>(info: GuestAddr) -> GfxRecorderAllocateInfo {
    if A::POINTER_SIZE == 8 {
        ptr::read_unaligned(guest_ptr::<A, GfxRecorderAllocateInfo>(info))
    } else {
        let src = ptr::read_unaligned(guest_ptr::<A, GfxRecorderAllocateInfo32>(info));
        GfxRecorderAllocateInfo {
            tag: src.tag,
            next: u64::from(src.next),
            pool: src.pool,
            level: src.level,
            count: src.count,
        }
    }
}

/// `gfxEnumerateDeviceExtensions(device, count, properties)`.
///
/// Queries the host until the snapshot is stable, filters it down to
/// what the conversion layer can marshal and answers the guest's count
/// or buffer query from the filtered set.
unsafe fn marshal_enumerate_extensions<A: GuestArch>(
    _bridge: &Bridge<A>,
    callee: HostCode,
    state: &mut ProcessState<A>,
) {
    let (device, count_addr, rows_addr) = {
        let mut params = GuestParams::new(state);
        (
            params.read_raw(AbiKind::Ptr),
            params.read_raw(AbiKind::Ptr),
            params.read_raw(AbiKind::Ptr),
        )
    };
    let enumerate: EnumerateExtensionsFn = mem::transmute(callee.as_ptr());
    let device = device as usize as *mut c_void;
    let snapshot = stable_extension_snapshot(|count, rows| unsafe {
        match rows {
            None => enumerate(device, count, ptr::null_mut()),
            Some(rows) => enumerate(device, count, rows.as_mut_ptr()),
        }
    });
    let status = match snapshot {
        Ok(rows) => {
            let filtered = filter_extension_properties(&rows);
            write_enumeration(
                &filtered,
                guest_ptr::<A, u32>(count_addr),
                guest_ptr::<A, GfxExtensionProperties>(rows_addr),
            )
        }
        Err(status) => status,
    };
    set_guest_return(state, status);
}

/// `gfxAllocateRecorders(device, info, recorders)`.
///
/// Forwards the allocation and records the level of every handle the
/// host returns. Recorder handles are 64-bit on every guest.
unsafe fn marshal_allocate_recorders<A: GuestArch>(
    _bridge: &Bridge<A>,
    callee: HostCode,
    state: &mut ProcessState<A>,
) {
    let (device, info_addr, out_addr) = {
        let mut params = GuestParams::new(state);
        (
            params.read_raw(AbiKind::Ptr),
            params.read_raw(AbiKind::Ptr),
            params.read_raw(AbiKind::Ptr),
        )
    };
    let request = read_allocate_info::<A>(info_addr);
    let arena = ConvArena::new();
    let next = match recording_chain::<A>().to_host::<A>(request.next, &arena) {
        Ok(node) => node as u64,
        Err(error) => {
            log::error!("gfxAllocateRecorders: dropping request, {error}");
            set_guest_return(state, GFX_ERROR_OUT_OF_MEMORY);
            return;
        }
    };
    let host_info = GfxRecorderAllocateInfo { next, ..request };
    let allocate: AllocateRecordersFn = mem::transmute(callee.as_ptr());
    let out = guest_ptr::<A, u64>(out_addr);
    let status = allocate(device as usize as *mut c_void, &host_info, out);
    if status == GFX_SUCCESS {
        for index in 0..request.count as usize {
            recorder_metadata().record(ptr::read_unaligned(out.add(index)), request.level);
        }
    }
    set_guest_return(state, status);
}

/// `gfxBeginRecording(recorder, info)`.
unsafe fn marshal_begin_recording<A: GuestArch>(
    _bridge: &Bridge<A>,
    callee: HostCode,
    state: &mut ProcessState<A>,
) {
    let (recorder, info_addr) = {
        let mut params = GuestParams::new(state);
        (params.read_raw(AbiKind::U64), params.read_raw(AbiKind::Ptr))
    };
    let arena = ConvArena::new();
    let info = match convert_begin_info::<A>(recorder, info_addr, recorder_metadata(), &arena) {
        Ok(info) => info,
        Err(error) => {
            log::error!("gfxBeginRecording: dropping request, {error}");
            set_guest_return(state, GFX_ERROR_OUT_OF_MEMORY);
            return;
        }
    };
    let begin: BeginRecordingFn = mem::transmute(callee.as_ptr());
    let status = begin(recorder, info);
    set_guest_return(state, status);
}

/// `gfxFreeRecorders(device, count, recorders)`.
unsafe fn marshal_free_recorders<A: GuestArch>(
    _bridge: &Bridge<A>,
    callee: HostCode,
    state: &mut ProcessState<A>,
) {
    let (device, count, handles_addr) = {
        let mut params = GuestParams::new(state);
        (
            params.read_raw(AbiKind::Ptr),
            params.read_raw(AbiKind::U32),
            params.read_raw(AbiKind::Ptr),
        )
    };
    let handles = guest_ptr::<A, u64>(handles_addr);
    for index in 0..count as usize {
        recorder_metadata().forget(ptr::read_unaligned(handles.add(index)));
    }
    let free: FreeRecordersFn = mem::transmute(callee.as_ptr());
    free(device as usize as *mut c_void, count as u32, handles);
}

/// `gfxGetDeviceProcAddr(device, name)`.
///
/// Resolves through the host, then hands back a guest-callable address
/// for the resolved entry point. Unknown or unmarshallable entries
/// surface as null rather than a fault.
unsafe fn marshal_get_device_proc_addr<A: GuestArch>(
    bridge: &Bridge<A>,
    callee: HostCode,
    state: &mut ProcessState<A>,
) {
    let (device, name_addr) = {
        let mut params = GuestParams::new(state);
        (params.read_raw(AbiKind::Ptr), params.read_raw(AbiKind::Ptr))
    };
    let resolve: GetProcAddrFn = mem::transmute(callee.as_ptr());
    let name = CStr::from_ptr(guest_ptr::<A, c_char>(name_addr));
    let target = resolve(device as usize as *mut c_void, name.as_ptr());
    let pc = if target.is_null() {
        0
    } else {
        let name = name.to_string_lossy();
        bridge
            .wrap_host_function(&name, HostCode::from_ptr(target as *const ()))
            .unwrap_or(0)
    };
    set_guest_return_raw(state, AbiKind::Ptr, pc);
}

/// `gfxSetRecorderCallback(recorder, callback, user_data)`.
unsafe fn marshal_set_recorder_callback<A: GuestArch>(
    bridge: &Bridge<A>,
    callee: HostCode,
    state: &mut ProcessState<A>,
) {
    let (recorder, callback, user_data) = {
        let mut params = GuestParams::new(state);
        (
            params.read_raw(AbiKind::U64),
            params.read_raw(AbiKind::Ptr),
            params.read_raw(AbiKind::Ptr),
        )
    };
    let callback = if callback == 0 {
        ptr::null()
    } else {
        match bridge.wrap_known_guest_function(RECORDER_CALLBACK, callback) {
            Some(code) => code.as_ptr(),
            None => {
                log::error!("no guest wrapper registered for `{RECORDER_CALLBACK}`");
                ptr::null()
            }
        }
    };
    let set: SetRecorderCallbackFn = mem::transmute(callee.as_ptr());
    let status = set(
        recorder,
        callback as *const c_void,
        user_data as usize as *mut c_void,
    );
    set_guest_return(state, status);
}

/// `gfxGetRecorderCallback(recorder)`.
///
/// A callback the guest registered earlier comes back as the guest's
/// own function address, not as the stub the host was handed.
unsafe fn marshal_get_recorder_callback<A: GuestArch>(
    bridge: &Bridge<A>,
    callee: HostCode,
    state: &mut ProcessState<A>,
) {
    let recorder = {
        let mut params = GuestParams::new(state);
        params.read_raw(AbiKind::U64)
    };
    let get: GetRecorderCallbackFn = mem::transmute(callee.as_ptr());
    let code = get(recorder);
    let result = match bridge.cache().unwrap_guest(HostCode::from_ptr(code as *const ())) {
        Some(guest) => guest,
        None => code as usize as u64,
    };
    set_guest_return_raw(state, AbiKind::Ptr, result);
}

/// Declares `libgfx.so` against `bridge`: the trampoline and variable
/// tables plus the guest-wrapper entry the callback marshallers use.
pub fn init_proxy_library<A: GuestArch>(bridge: &Bridge<A>) -> Result<(), ProxyError> {
    bridge
        .registry()
        .register_known_guest_wrapper(RECORDER_CALLBACK, |cache, guest| {
            cache.wrap_guest(RECORDER_CALLBACK, guest, &sig("vzp"))
        });
    ProxyLibraryBuilder::new("libgfx.so")
        .trampoline(TrampolineEntry::marshalled::<CreateDeviceFn>("gfxCreateDevice"))
        .trampoline(TrampolineEntry::marshalled::<DestroyDeviceFn>("gfxDestroyDevice"))
        .trampoline(TrampolineEntry::by_signature("gfxQueueSubmit", "izup"))
        .trampoline(TrampolineEntry::custom_with_signature(
            "gfxEnumerateDeviceExtensions",
            "ippp",
            marshal_enumerate_extensions::<A>,
        ))
        .trampoline(TrampolineEntry::custom_with_signature(
            "gfxAllocateRecorders",
            "ippp",
            marshal_allocate_recorders::<A>,
        ))
        .trampoline(TrampolineEntry::custom_with_signature(
            "gfxBeginRecording",
            "izp",
            marshal_begin_recording::<A>,
        ))
        .trampoline(TrampolineEntry::custom_with_signature(
            "gfxFreeRecorders",
            "vpup",
            marshal_free_recorders::<A>,
        ))
        .trampoline(TrampolineEntry::custom_with_signature(
            "gfxGetDeviceProcAddr",
            "ppp",
            marshal_get_device_proc_addr::<A>,
        ))
        .trampoline(TrampolineEntry::custom_with_signature(
            "gfxSetRecorderCallback",
            "izpp",
            marshal_set_recorder_callback::<A>,
        ))
        .trampoline(TrampolineEntry::custom_with_signature(
            "gfxGetRecorderCallback",
            "pz",
            marshal_get_recorder_callback::<A>,
        ))
        .trampoline(TrampolineEntry::unsupported("gfxDebugMarker"))
        .variable("GFX_API_VERSION", 4)
        .build(bridge)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use causeway_abi::{ArgBuffer, Arm64};
    use causeway_runtime::{BridgeConfig, GuestRuntime, RegistryError};
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use std::sync::Arc;

    struct NullRuntime;

    impl GuestRuntime<Arm64> for NullRuntime {
        fn invoke(&self, _addr: GuestAddr, _args: &mut ArgBuffer, _ret: AbiKind) {}
    }

    #[test]
    fn test_snapshot_retries_until_stable() {
        let mut calls = 0;
        let rows = stable_extension_snapshot(|count, rows| {
            calls += 1;
            match calls {
                1 => {
                    *count = 3;
                    GFX_SUCCESS
                }
                // The set grew while the caller sized its buffer.
                2 => {
                    let rows = rows.unwrap();
                    assert_eq!(rows.len(), 3);
                    for (i, row) in rows.iter_mut().enumerate() {
                        *row = GfxExtensionProperties::named("GFX_KHR_swapchain", i as u32);
                    }
                    *count = 3;
                    GFX_INCOMPLETE
                }
                3 => {
                    *count = 4;
                    GFX_SUCCESS
                }
                _ => {
                    let rows = rows.unwrap();
                    for (i, row) in rows.iter_mut().enumerate() {
                        *row = GfxExtensionProperties::named("GFX_KHR_swapchain", i as u32);
                    }
                    *count = 4;
                    GFX_SUCCESS
                }
            }
        })
        .unwrap();
        assert_eq!(calls, 4);
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[3].spec_version, 3);
    }

    #[test]
    fn test_snapshot_retries_when_the_set_shrinks() {
        let mut calls = 0;
        let rows = stable_extension_snapshot(|count, rows| {
            calls += 1;
            match calls {
                1 => {
                    *count = 5;
                    GFX_SUCCESS
                }
                2 => {
                    // Four left by the time the buffer query runs.
                    rows.unwrap()[..4].fill(GfxExtensionProperties::named("GFX_KHR_swapchain", 1));
                    *count = 4;
                    GFX_SUCCESS
                }
                3 => {
                    *count = 4;
                    GFX_SUCCESS
                }
                _ => {
                    rows.unwrap().fill(GfxExtensionProperties::named("GFX_KHR_swapchain", 1));
                    *count = 4;
                    GFX_SUCCESS
                }
            }
        })
        .unwrap();
        assert_eq!(calls, 4);
        assert_eq!(rows.len(), 4);
    }

    #[test]
    fn test_snapshot_propagates_host_failure() {
        let status = stable_extension_snapshot(|_, _| -7).unwrap_err();
        assert_eq!(status, -7);
    }

    #[test]
    fn test_snapshot_handles_an_empty_set() {
        let rows = stable_extension_snapshot(|count, _| {
            *count = 0;
            GFX_SUCCESS
        })
        .unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn test_filter_drops_unknown_and_clamps_revisions() {
        let rows = vec![
            GfxExtensionProperties::named("GFX_KHR_swapchain", 90),
            GfxExtensionProperties::named("GFX_VENDOR_secret", 1),
            GfxExtensionProperties::named("GFX_KHR_surface_present", 10),
        ];
        let filtered = filter_extension_properties(&rows);
        assert_eq!(filtered.len(), 2);
        assert_eq!(filtered[0].name_bytes(), b"GFX_KHR_swapchain");
        assert_eq!(filtered[0].spec_version, 70);
        assert_eq!(filtered[1].name_bytes(), b"GFX_KHR_surface_present");
        assert_eq!(filtered[1].spec_version, 10);
    }

    #[test]
    fn test_write_enumeration_answers_count_query() {
        let rows = [
            GfxExtensionProperties::named("GFX_KHR_swapchain", 1),
            GfxExtensionProperties::named("GFX_EXT_debug_report", 2),
        ];
        let mut count = 0u32;
        let status = unsafe { write_enumeration(&rows, &mut count, ptr::null_mut()) };
        assert_eq!(status, GFX_SUCCESS);
        assert_eq!(count, 2);
    }

    #[test]
    fn test_write_enumeration_reports_short_buffers() {
        let rows = [
            GfxExtensionProperties::named("GFX_KHR_swapchain", 1),
            GfxExtensionProperties::named("GFX_EXT_debug_report", 2),
        ];
        let mut out = [GfxExtensionProperties::default(); 1];
        let mut count = 1u32;
        let status = unsafe { write_enumeration(&rows, &mut count, out.as_mut_ptr()) };
        assert_eq!(status, GFX_INCOMPLETE);
        assert_eq!(count, 1);
        assert_eq!(out[0], rows[0]);

        let mut out = [GfxExtensionProperties::default(); 4];
        let mut count = 4u32;
        let status = unsafe { write_enumeration(&rows, &mut count, out.as_mut_ptr()) };
        assert_eq!(status, GFX_SUCCESS);
        assert_eq!(count, 2);
        assert_eq!(out[1], rows[1]);
    }

    #[test]
    fn test_extension_name_terminates_at_nul() {
        let row = GfxExtensionProperties::named("GFX_KHR_swapchain", 3);
        assert_eq!(row.name_bytes(), b"GFX_KHR_swapchain");
        assert_eq!(row.name[17], 0);
        assert_eq!(row.spec_version, 3);
    }

    #[test]
    fn test_recorder_metadata_tracks_levels() {
        let metadata = RecorderMetadata::new();
        metadata.record(1, GFX_RECORDER_LEVEL_PRIMARY);
        metadata.record(2, GFX_RECORDER_LEVEL_SECONDARY);
        assert!(!metadata.is_secondary(1));
        assert!(metadata.is_secondary(2));
        assert!(!metadata.is_secondary(99));
        // Double registration keeps the original level.
        metadata.record(2, GFX_RECORDER_LEVEL_PRIMARY);
        assert!(metadata.is_secondary(2));
        metadata.forget(2);
        assert!(!metadata.is_secondary(2));
        assert_eq!(metadata.len(), 1);
    }

    #[test]
    fn test_recorder_metadata_is_process_wide() {
        assert!(std::ptr::eq(recorder_metadata(), recorder_metadata()));
    }

    #[test]
    fn test_convert_begin_info_null_passthrough() {
        let metadata = RecorderMetadata::new();
        let arena = ConvArena::new();
        let converted = unsafe { convert_begin_info::<Arm64>(1, 0, &metadata, &arena) }.unwrap();
        assert!(converted.is_null());
        assert_eq!(arena.blocks(), 0);
    }

    #[test]
    fn test_convert_begin_info_primary_drops_inheritance() {
        let metadata = RecorderMetadata::new();
        metadata.record(7, GFX_RECORDER_LEVEL_PRIMARY);
        let inheritance = GfxRecorderInheritanceInfo {
            tag: TAG_RECORDER_INHERITANCE,
            next: 0,
            render_target: 0xAB,
            subpass: 2,
            query_flags: 1,
        };
        let begin = GfxRecordingBeginInfo {
            tag: TAG_RECORDING_BEGIN_INFO,
            next: 0,
            flags: 5,
            inheritance: &inheritance as *const _ as u64,
        };
        let arena = ConvArena::new();
        let converted = unsafe {
            &*convert_begin_info::<Arm64>(7, &begin as *const _ as u64, &metadata, &arena).unwrap()
        };
        assert_eq!(converted.flags, 5);
        assert_eq!(converted.inheritance, 0);
        assert_eq!(converted.next, 0);
    }

    #[test]
    fn test_convert_begin_info_secondary_rebuilds_chain() {
        let metadata = RecorderMetadata::new();
        metadata.record(7, GFX_RECORDER_LEVEL_SECONDARY);
        let group = GfxDeviceGroupBeginInfo {
            tag: TAG_DEVICE_GROUP_BEGIN,
            next: 0,
            device_mask: 0b101,
        };
        let inheritance = GfxRecorderInheritanceInfo {
            tag: 0,
            next: 0,
            render_target: 0xAB,
            subpass: 2,
            query_flags: 1,
        };
        let begin = GfxRecordingBeginInfo {
            tag: TAG_RECORDING_BEGIN_INFO,
            next: &group as *const _ as u64,
            flags: 5,
            inheritance: &inheritance as *const _ as u64,
        };
        let arena = ConvArena::new();
        let converted = unsafe {
            &*convert_begin_info::<Arm64>(7, &begin as *const _ as u64, &metadata, &arena).unwrap()
        };
        assert_ne!(converted.next, 0);
        assert_ne!(converted.next, &group as *const _ as u64);
        let node = unsafe { &*(converted.next as *const GfxDeviceGroupBeginInfo) };
        assert_eq!(node.tag, TAG_DEVICE_GROUP_BEGIN);
        assert_eq!(node.next, 0);
        assert_eq!(node.device_mask, 0b101);
        assert_ne!(converted.inheritance, 0);
        let inherited = unsafe { &*(converted.inheritance as *const GfxRecorderInheritanceInfo) };
        assert_eq!(inherited.tag, TAG_RECORDER_INHERITANCE);
        assert_eq!(inherited.render_target, 0xAB);
        assert_eq!(inherited.subpass, 2);
    }

    #[test]
    fn test_convert_begin_info_rejects_unknown_chain_tags() {
        let metadata = RecorderMetadata::new();
        let stranger = GfxDeviceGroupBeginInfo {
            tag: 0xdead,
            next: 0,
            device_mask: 0,
        };
        let begin = GfxRecordingBeginInfo {
            tag: TAG_RECORDING_BEGIN_INFO,
            next: &stranger as *const _ as u64,
            flags: 0,
            inheritance: 0,
        };
        let arena = ConvArena::new();
        let err = unsafe {
            convert_begin_info::<Arm64>(1, &begin as *const _ as u64, &metadata, &arena)
        }
        .unwrap_err();
        assert!(matches!(err, ChainError::UnknownTag(0xdead)));
    }

    #[test]
    fn test_convert_begin_info_reports_exhausted_arena() {
        let metadata = RecorderMetadata::new();
        let begin = GfxRecordingBeginInfo {
            tag: TAG_RECORDING_BEGIN_INFO,
            next: 0,
            flags: 0,
            inheritance: 0,
        };
        let arena = ConvArena::with_budget(8);
        let err = unsafe {
            convert_begin_info::<Arm64>(1, &begin as *const _ as u64, &metadata, &arena)
        }
        .unwrap_err();
        assert!(matches!(err, ChainError::OutOfMemory(_)));
    }

    #[test]
    fn test_device_group_rules_widen_and_narrow() {
        let narrow = GfxDeviceGroupBeginInfo32 {
            tag: TAG_DEVICE_GROUP_BEGIN,
            next: 0,
            device_mask: 7,
        };
        let mut wide = GfxDeviceGroupBeginInfo {
            tag: 0,
            next: 0,
            device_mask: 0,
        };
        let arena = ConvArena::new();
        unsafe {
            widen_device_group(
                &narrow as *const _ as *const u8,
                &mut wide as *mut _ as *mut u8,
                &arena,
            )
            .unwrap();
        }
        assert_eq!(wide.device_mask, 7);

        let mut back = GfxDeviceGroupBeginInfo32 {
            tag: 0,
            next: 0,
            device_mask: 0,
        };
        unsafe {
            narrow_device_group(
                &wide as *const _ as *const u8,
                &mut back as *mut _ as *mut u8,
                &arena,
            )
            .unwrap();
        }
        assert_eq!(back.device_mask, 7);
    }

    #[test]
    fn test_init_declares_the_library_once() {
        let bridge = Bridge::<Arm64>::new(BridgeConfig::default(), Arc::new(NullRuntime));
        init_proxy_library(&bridge).unwrap();
        let begin = bridge.registry().find("libgfx.so", "gfxBeginRecording").unwrap();
        assert!(begin.marshal().is_some());
        assert!(begin.signature().is_some());
        let marker = bridge.registry().find("libgfx.so", "gfxDebugMarker").unwrap();
        assert!(!marker.has_dispatch());
        assert!(bridge.registry().find_variable("libgfx.so", "GFX_API_VERSION").is_some());

        let err = init_proxy_library(&bridge).unwrap_err();
        assert!(matches!(
            err,
            ProxyError::Registry(RegistryError::LibraryAlreadyBuilt(_))
        ));
    }

    proptest! {
        #[test]
        fn prop_filter_never_raises_a_revision(
            rows in proptest::collection::vec((0usize..4, any::<u32>()), 0..16)
        ) {
            let rows: Vec<_> = rows
                .into_iter()
                .map(|(index, version)| {
                    GfxExtensionProperties::named(SUPPORTED_EXTENSIONS[index].0, version)
                })
                .collect();
            let filtered = filter_extension_properties(&rows);
            prop_assert_eq!(filtered.len(), rows.len());
            for (kept, original) in filtered.iter().zip(&rows) {
                prop_assert!(kept.spec_version <= original.spec_version);
                prop_assert!(kept.spec_version <= supported_revision(kept.name_bytes()).unwrap());
            }
        }
    }
}
