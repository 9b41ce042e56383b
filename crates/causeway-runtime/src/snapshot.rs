//! Guest-state snapshot accessor.
//!
//! Crash tooling outside the process reads guest register files through a
//! versioned, signature-tagged header. The layout of everything in this
//! module is an ABI contract: the compile-time assertions pin it, and any
//! change that moves a byte needs a version bump.

use std::mem::{align_of, size_of};

use thiserror::Error;

use causeway_abi::state::{Arm64CpuState, ArmCpuState, Riscv64CpuState};
use causeway_abi::{ArchKind, GuestArch, ProcessState};

/// Little-endian bytes `"CAUSEWAY"`.
pub const SNAPSHOT_SIGNATURE: u64 = 0x5941_5745_5355_4143;

/// Current snapshot layout version.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Snapshot decoding errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SnapshotError {
    #[error("bad snapshot signature {0:#018x}")]
    BadSignature(u64),

    #[error("unsupported snapshot version {0}")]
    UnsupportedVersion(u32),

    #[error("unsupported guest architecture code {0}")]
    UnsupportedArch(u32),

    #[error("invalid guest state payload: expected at least {expected} bytes, got {actual}")]
    InvalidState { expected: usize, actual: usize },
}

/// Snapshot header as written by the runtime's crash path.
///
/// `guest_state_data` points at the raw register file of the crashing guest
/// thread; `guest_arch` selects its layout using the [`ArchKind`] codes.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SnapshotHeader {
    pub signature: u64,
    pub version: u32,
    pub host_arch: u32,
    pub guest_arch: u32,
    pub guest_state_data: *const u8,
    pub guest_state_data_size: usize,
}

/// One register file per supported guest architecture.
#[repr(C)]
#[derive(Clone, Copy)]
pub union GuestRegsUnion {
    pub arm: ArmCpuState,
    pub arm64: Arm64CpuState,
    pub riscv64: Riscv64CpuState,
}

impl GuestRegsUnion {
    /// All-zero register file. The largest member covers the whole union.
    pub fn zeroed() -> Self {
        Self {
            arm64: Arm64CpuState::default(),
        }
    }
}

/// A decoded guest register file, tagged with its architecture code.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct GuestRegs {
    pub guest_arch: u32,
    pub regs: GuestRegsUnion,
}

// Layout pins. External debuggers hard-code these.
#[cfg(target_pointer_width = "64")]
const _: () = assert!(size_of::<SnapshotHeader>() == 40);
const _: () = assert!(size_of::<GuestRegsUnion>() == 816);
const _: () = assert!(align_of::<GuestRegsUnion>() == 16);
const _: () = assert!(size_of::<GuestRegs>() == 832);

impl GuestRegs {
    pub fn arch(&self) -> Option<ArchKind> {
        ArchKind::from_raw(self.guest_arch)
    }

    pub fn as_arm(&self) -> Option<&ArmCpuState> {
        // Safety: the tag says the union holds this member.
        (self.guest_arch == ArchKind::Arm as u32).then(|| unsafe { &self.regs.arm })
    }

    pub fn as_arm64(&self) -> Option<&Arm64CpuState> {
        // Safety: as above.
        (self.guest_arch == ArchKind::Arm64 as u32).then(|| unsafe { &self.regs.arm64 })
    }

    pub fn as_riscv64(&self) -> Option<&Riscv64CpuState> {
        // Safety: as above.
        (self.guest_arch == ArchKind::Riscv64 as u32).then(|| unsafe { &self.regs.riscv64 })
    }
}

impl std::fmt::Debug for GuestRegs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = f.debug_struct("GuestRegs");
        s.field("guest_arch", &self.guest_arch);
        if let Some(arm) = self.as_arm() {
            s.field("regs", arm);
        } else if let Some(arm64) = self.as_arm64() {
            s.field("regs", arm64);
        } else if let Some(riscv64) = self.as_riscv64() {
            s.field("regs", riscv64);
        }
        s.finish()
    }
}

fn state_size(kind: ArchKind) -> Option<usize> {
    match kind {
        ArchKind::Arm => Some(size_of::<ArmCpuState>()),
        ArchKind::Arm64 => Some(size_of::<Arm64CpuState>()),
        ArchKind::Riscv64 => Some(size_of::<Riscv64CpuState>()),
        // Host-only codes; no guest register layout to decode.
        ArchKind::X86 | ArchKind::X86_64 => None,
    }
}

/// Decodes the guest register file a snapshot header points at.
///
/// Signature, version, architecture code and payload size are validated
/// before anything is read through the payload pointer.
///
/// # Safety
///
/// If the header passes validation, `guest_state_data` must point to at
/// least `guest_state_data_size` readable bytes.
pub unsafe fn load_guest_regs(header: &SnapshotHeader) -> Result<GuestRegs, SnapshotError> {
    if header.signature != SNAPSHOT_SIGNATURE {
        return Err(SnapshotError::BadSignature(header.signature));
    }
    if header.version != SNAPSHOT_VERSION {
        return Err(SnapshotError::UnsupportedVersion(header.version));
    }
    let kind = ArchKind::from_raw(header.guest_arch)
        .ok_or(SnapshotError::UnsupportedArch(header.guest_arch))?;
    let expected = state_size(kind).ok_or(SnapshotError::UnsupportedArch(header.guest_arch))?;
    if header.guest_state_data.is_null() || header.guest_state_data_size < expected {
        return Err(SnapshotError::InvalidState {
            expected,
            actual: header.guest_state_data_size,
        });
    }

    let mut regs = GuestRegs {
        guest_arch: header.guest_arch,
        regs: GuestRegsUnion::zeroed(),
    };
    // Safety: validated non-null and large enough; the payload may come
    // from a byte stream, so copy without assuming alignment.
    std::ptr::copy_nonoverlapping(
        header.guest_state_data,
        &mut regs.regs as *mut GuestRegsUnion as *mut u8,
        expected,
    );
    Ok(regs)
}

/// Fills a snapshot register block from live CPU state.
pub fn export_regs<A: GuestArch>(state: &ProcessState<A>) -> GuestRegs {
    let mut regs = GuestRegs {
        guest_arch: A::KIND as u32,
        regs: GuestRegsUnion::zeroed(),
    };
    debug_assert!(size_of::<A::CpuState>() <= size_of::<GuestRegsUnion>());
    // Safety: every supported CpuState is plain `#[repr(C)]` data no larger
    // than the union.
    unsafe {
        std::ptr::copy_nonoverlapping(
            &state.cpu as *const A::CpuState as *const u8,
            &mut regs.regs as *mut GuestRegsUnion as *mut u8,
            size_of::<A::CpuState>(),
        );
    }
    regs
}
