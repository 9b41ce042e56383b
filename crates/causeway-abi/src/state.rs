//! Per-architecture guest CPU state.
//!
//! These are the register files the interpreter materializes for each guest
//! thread and the call bridge reads/writes when marshalling. Layouts are
//! `#[repr(C)]` and pinned by compile-time assertions: crash tooling and the
//! snapshot accessor copy them as raw bytes.

use std::mem::{align_of, size_of};

use crate::arch::GuestArch;

/// Register file of a 64-bit Arm guest.
///
/// `insn_addr` is the guest program counter. `v` holds the full 128-bit SIMD
/// registers; scalar float arguments travel in the low 64 bits. The
/// reservation pair backs exclusive-access emulation and is never touched by
/// the bridge.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct Arm64CpuState {
    pub x: [u64; 31],
    pub sp: u64,
    pub insn_addr: u64,
    pub v: [u128; 32],
    pub flags: u16,
    pub reservation_address: u64,
    pub reservation_value: u128,
}

/// Register file of a 32-bit Arm guest (AAPCS, VFP hard-float).
///
/// `r[13]` is the stack pointer; `r[15]` mirrors `insn_addr` so that code
/// reading the register file sees a coherent PC. `d` holds the VFP registers;
/// single-precision `s` registers are the 32-bit halves of `d`.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct ArmCpuState {
    pub r: [u32; 16],
    pub insn_addr: u32,
    pub d: [u64; 32],
    pub cpsr_flags: u32,
    pub reservation_address: u32,
    pub reservation_value: u64,
}

/// Register file of a 64-bit RISC-V guest (LP64D).
///
/// `x[0]` is hardwired zero by convention; writes to it are ignored by the
/// interpreter, not by this struct. `f` registers hold doubles directly and
/// NaN-boxed singles.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct Riscv64CpuState {
    pub x: [u64; 32],
    pub f: [u64; 32],
    pub insn_addr: u64,
    pub reservation_address: u64,
    pub reservation_value: u128,
}

// Layout pins. The snapshot accessor and crash tooling copy these structs as
// raw bytes, so any size or alignment drift is a wire-format break.
const _: () = assert!(size_of::<Arm64CpuState>() == 816);
const _: () = assert!(align_of::<Arm64CpuState>() == 16);
const _: () = assert!(size_of::<ArmCpuState>() == 344);
const _: () = assert!(align_of::<ArmCpuState>() == 8);
const _: () = assert!(size_of::<Riscv64CpuState>() == 544);
const _: () = assert!(align_of::<Riscv64CpuState>() == 16);

/// Per-thread guest execution state as seen by the bridge.
///
/// Each guest thread owns one `ProcessState`. Marshallers receive it mutably
/// for the duration of a bridged call and must leave every register except
/// the return slots untouched.
#[derive(Debug, Clone, Default)]
pub struct ProcessState<A: GuestArch> {
    pub cpu: A::CpuState,
}

impl<A: GuestArch> ProcessState<A> {
    /// Creates a zeroed state.
    pub fn new() -> Self {
        Self {
            cpu: A::CpuState::default(),
        }
    }

    /// Guest program counter.
    pub fn program_counter(&self) -> crate::value::GuestAddr {
        A::program_counter(&self.cpu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::{Arm, Arm64, Riscv64};

    #[test]
    fn test_states_zeroed_by_default() {
        let s64 = Arm64CpuState::default();
        assert_eq!(s64.x, [0; 31]);
        assert_eq!(s64.sp, 0);
        assert_eq!(s64.reservation_value, 0);

        let s32 = ArmCpuState::default();
        assert_eq!(s32.r, [0; 16]);

        let rv = Riscv64CpuState::default();
        assert_eq!(rv.f, [0; 32]);
    }

    #[test]
    fn test_process_state_program_counter() {
        let mut st = ProcessState::<Arm64>::new();
        st.cpu.insn_addr = 0x4000;
        assert_eq!(st.program_counter(), 0x4000);

        let mut st = ProcessState::<Arm>::new();
        st.cpu.insn_addr = 0x8000;
        assert_eq!(st.program_counter(), 0x8000);

        let mut st = ProcessState::<Riscv64>::new();
        st.cpu.insn_addr = 0x1_0000;
        assert_eq!(st.program_counter(), 0x1_0000);
    }
}
