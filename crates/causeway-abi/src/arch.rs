//! Guest architecture descriptions.
//!
//! [`GuestArch`] is the single seam through which the codec, the wrapper
//! cache and the marshalling units learn about a guest: pointer width,
//! argument register budgets, return slots, and how small aggregates come
//! back from a call. Each supported guest is a zero-sized marker type so
//! that architecture mismatches are compile-time errors, not runtime
//! branches.

use crate::state::{Arm64CpuState, ArmCpuState, Riscv64CpuState};
use crate::value::GuestAddr;

/// Architecture identifiers shared with the snapshot format.
///
/// The numeric values are part of the crash-dump contract and must not be
/// reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ArchKind {
    Arm = 1,
    Arm64 = 2,
    Riscv64 = 4,
    X86 = 5,
    X86_64 = 6,
}

impl ArchKind {
    /// Decodes a raw architecture code from a snapshot header.
    pub fn from_raw(code: u32) -> Option<Self> {
        match code {
            1 => Some(ArchKind::Arm),
            2 => Some(ArchKind::Arm64),
            4 => Some(ArchKind::Riscv64),
            5 => Some(ArchKind::X86),
            6 => Some(ArchKind::X86_64),
            _ => None,
        }
    }
}

/// How a small `#[repr(C)]` aggregate is returned by value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateReturn {
    /// Packed into the low integer return registers.
    Packed { regs: usize },
    /// Written through a hidden pointer supplied by the caller.
    Indirect,
}

/// A guest architecture the bridge can marshal for.
///
/// Implementations describe the integer/float argument register files, the
/// return slots, stack slot granularity and aggregate classification of one
/// calling convention. All register accessors take the raw CPU state so the
/// codec stays free of per-architecture branches.
pub trait GuestArch: Copy + Send + Sync + 'static {
    const KIND: ArchKind;
    const NAME: &'static str;

    /// Guest pointer width in bytes.
    const POINTER_SIZE: usize;
    /// Mask applied when normalizing a raw slot value to a guest address.
    const ADDR_MASK: u64;

    /// Number of integer argument registers.
    const INT_ARG_REGS: usize;
    /// Width of an integer argument register in bytes.
    const INT_SLOT_SIZE: usize;
    /// Number of single-precision float argument slots. On architectures
    /// whose float registers hold one argument each this equals the register
    /// count; on 32-bit Arm it counts `s` registers (two per `d`).
    const FLOAT_ARG_SLOTS: usize;
    /// How many single-precision slots one float register provides.
    const F32_SLOTS_PER_FREG: usize;
    /// Granularity of a stack argument slot in bytes.
    const STACK_SLOT_SIZE: usize;
    /// Whether single-precision values are NaN-boxed in float registers.
    const NAN_BOX_F32: bool;
    /// Whether an indirect aggregate result pointer occupies the first
    /// integer argument slot (true) or a dedicated register (false).
    const INDIRECT_RESULT_IN_ARG0: bool;

    type CpuState: Clone + Default + Send + Sync + 'static;

    fn int_arg(cpu: &Self::CpuState, index: usize) -> u64;
    fn set_int_arg(cpu: &mut Self::CpuState, index: usize, value: u64);

    /// Raw bits of a float register (`d`, `v` or `f` depending on the
    /// architecture). Only the low 64 bits participate in argument passing.
    fn float_reg_bits(cpu: &Self::CpuState, index: usize) -> u64;
    fn set_float_reg_bits(cpu: &mut Self::CpuState, index: usize, bits: u64);

    fn stack_pointer(cpu: &Self::CpuState) -> GuestAddr;
    fn set_stack_pointer(cpu: &mut Self::CpuState, sp: GuestAddr);

    fn program_counter(cpu: &Self::CpuState) -> GuestAddr;
    fn set_program_counter(cpu: &mut Self::CpuState, pc: GuestAddr);

    /// Primary integer return slot (x0 / r0 / a0).
    fn int_return(cpu: &Self::CpuState) -> u64;
    fn set_int_return(cpu: &mut Self::CpuState, value: u64);

    /// Secondary integer return slot, used by register pairs and packed
    /// aggregates (x1 / r1 / a1).
    fn int_return_hi(cpu: &Self::CpuState) -> u64;
    fn set_int_return_hi(cpu: &mut Self::CpuState, value: u64);

    /// Raw bits of the float return register (v0 / d0 / fa0).
    fn float_return_bits(cpu: &Self::CpuState) -> u64;
    fn set_float_return_bits(cpu: &mut Self::CpuState, bits: u64);

    /// Register holding the hidden pointer for indirect aggregate returns.
    /// Only meaningful when the classification says [`AggregateReturn::Indirect`];
    /// when [`Self::INDIRECT_RESULT_IN_ARG0`] is set this aliases the first
    /// integer argument.
    fn indirect_result_reg(cpu: &Self::CpuState) -> u64;

    /// Classifies a by-value aggregate return of `size` bytes. Only
    /// integer-field aggregates are modeled; homogeneous float aggregates
    /// are special-cased by the marshalling unit that needs them.
    fn classify_aggregate_return(size: usize) -> AggregateReturn;

    /// Normalizes a raw 64-bit slot value to a guest address, zero-extending
    /// 32-bit guest pointers.
    #[inline]
    fn slot_to_addr(value: u64) -> GuestAddr {
        value & Self::ADDR_MASK
    }
}

/// 64-bit Arm guest (AAPCS64).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Arm64;

/// 32-bit Arm guest (AAPCS, VFP hard-float).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Arm;

/// 64-bit RISC-V guest (LP64D).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Riscv64;

impl GuestArch for Arm64 {
    const KIND: ArchKind = ArchKind::Arm64;
    const NAME: &'static str = "arm64";
    const POINTER_SIZE: usize = 8;
    const ADDR_MASK: u64 = u64::MAX;
    const INT_ARG_REGS: usize = 8;
    const INT_SLOT_SIZE: usize = 8;
    const FLOAT_ARG_SLOTS: usize = 8;
    const F32_SLOTS_PER_FREG: usize = 1;
    const STACK_SLOT_SIZE: usize = 8;
    const NAN_BOX_F32: bool = false;
    const INDIRECT_RESULT_IN_ARG0: bool = false;

    type CpuState = Arm64CpuState;

    #[inline]
    fn int_arg(cpu: &Self::CpuState, index: usize) -> u64 {
        cpu.x[index]
    }

    #[inline]
    fn set_int_arg(cpu: &mut Self::CpuState, index: usize, value: u64) {
        cpu.x[index] = value;
    }

    #[inline]
    fn float_reg_bits(cpu: &Self::CpuState, index: usize) -> u64 {
        cpu.v[index] as u64
    }

    #[inline]
    fn set_float_reg_bits(cpu: &mut Self::CpuState, index: usize, bits: u64) {
        let high = cpu.v[index] & (u128::MAX << 64);
        cpu.v[index] = high | bits as u128;
    }

    #[inline]
    fn stack_pointer(cpu: &Self::CpuState) -> GuestAddr {
        cpu.sp
    }

    #[inline]
    fn set_stack_pointer(cpu: &mut Self::CpuState, sp: GuestAddr) {
        cpu.sp = sp;
    }

    #[inline]
    fn program_counter(cpu: &Self::CpuState) -> GuestAddr {
        cpu.insn_addr
    }

    #[inline]
    fn set_program_counter(cpu: &mut Self::CpuState, pc: GuestAddr) {
        cpu.insn_addr = pc;
    }

    #[inline]
    fn int_return(cpu: &Self::CpuState) -> u64 {
        cpu.x[0]
    }

    #[inline]
    fn set_int_return(cpu: &mut Self::CpuState, value: u64) {
        cpu.x[0] = value;
    }

    #[inline]
    fn int_return_hi(cpu: &Self::CpuState) -> u64 {
        cpu.x[1]
    }

    #[inline]
    fn set_int_return_hi(cpu: &mut Self::CpuState, value: u64) {
        cpu.x[1] = value;
    }

    #[inline]
    fn float_return_bits(cpu: &Self::CpuState) -> u64 {
        cpu.v[0] as u64
    }

    #[inline]
    fn set_float_return_bits(cpu: &mut Self::CpuState, bits: u64) {
        let high = cpu.v[0] & (u128::MAX << 64);
        cpu.v[0] = high | bits as u128;
    }

    #[inline]
    fn indirect_result_reg(cpu: &Self::CpuState) -> u64 {
        // AAPCS64 passes the indirect result location in x8.
        cpu.x[8]
    }

    fn classify_aggregate_return(size: usize) -> AggregateReturn {
        match size {
            0..=8 => AggregateReturn::Packed { regs: 1 },
            9..=16 => AggregateReturn::Packed { regs: 2 },
            _ => AggregateReturn::Indirect,
        }
    }
}

impl GuestArch for Arm {
    const KIND: ArchKind = ArchKind::Arm;
    const NAME: &'static str = "arm";
    const POINTER_SIZE: usize = 4;
    const ADDR_MASK: u64 = 0xffff_ffff;
    const INT_ARG_REGS: usize = 4;
    const INT_SLOT_SIZE: usize = 4;
    // s0-s15 are available for arguments, packed two per d register.
    const FLOAT_ARG_SLOTS: usize = 16;
    const F32_SLOTS_PER_FREG: usize = 2;
    const STACK_SLOT_SIZE: usize = 4;
    const NAN_BOX_F32: bool = false;
    const INDIRECT_RESULT_IN_ARG0: bool = true;

    type CpuState = ArmCpuState;

    #[inline]
    fn int_arg(cpu: &Self::CpuState, index: usize) -> u64 {
        cpu.r[index] as u64
    }

    #[inline]
    fn set_int_arg(cpu: &mut Self::CpuState, index: usize, value: u64) {
        cpu.r[index] = value as u32;
    }

    #[inline]
    fn float_reg_bits(cpu: &Self::CpuState, index: usize) -> u64 {
        cpu.d[index]
    }

    #[inline]
    fn set_float_reg_bits(cpu: &mut Self::CpuState, index: usize, bits: u64) {
        cpu.d[index] = bits;
    }

    #[inline]
    fn stack_pointer(cpu: &Self::CpuState) -> GuestAddr {
        cpu.r[13] as u64
    }

    #[inline]
    fn set_stack_pointer(cpu: &mut Self::CpuState, sp: GuestAddr) {
        cpu.r[13] = sp as u32;
    }

    #[inline]
    fn program_counter(cpu: &Self::CpuState) -> GuestAddr {
        cpu.insn_addr as u64
    }

    #[inline]
    fn set_program_counter(cpu: &mut Self::CpuState, pc: GuestAddr) {
        cpu.insn_addr = pc as u32;
        cpu.r[15] = pc as u32;
    }

    #[inline]
    fn int_return(cpu: &Self::CpuState) -> u64 {
        cpu.r[0] as u64
    }

    #[inline]
    fn set_int_return(cpu: &mut Self::CpuState, value: u64) {
        cpu.r[0] = value as u32;
    }

    #[inline]
    fn int_return_hi(cpu: &Self::CpuState) -> u64 {
        cpu.r[1] as u64
    }

    #[inline]
    fn set_int_return_hi(cpu: &mut Self::CpuState, value: u64) {
        cpu.r[1] = value as u32;
    }

    #[inline]
    fn float_return_bits(cpu: &Self::CpuState) -> u64 {
        cpu.d[0]
    }

    #[inline]
    fn set_float_return_bits(cpu: &mut Self::CpuState, bits: u64) {
        cpu.d[0] = bits;
    }

    #[inline]
    fn indirect_result_reg(cpu: &Self::CpuState) -> u64 {
        cpu.r[0] as u64
    }

    fn classify_aggregate_return(size: usize) -> AggregateReturn {
        if size <= 4 {
            AggregateReturn::Packed { regs: 1 }
        } else {
            AggregateReturn::Indirect
        }
    }
}

impl GuestArch for Riscv64 {
    const KIND: ArchKind = ArchKind::Riscv64;
    const NAME: &'static str = "riscv64";
    const POINTER_SIZE: usize = 8;
    const ADDR_MASK: u64 = u64::MAX;
    const INT_ARG_REGS: usize = 8;
    const INT_SLOT_SIZE: usize = 8;
    const FLOAT_ARG_SLOTS: usize = 8;
    const F32_SLOTS_PER_FREG: usize = 1;
    const STACK_SLOT_SIZE: usize = 8;
    const NAN_BOX_F32: bool = true;
    const INDIRECT_RESULT_IN_ARG0: bool = true;

    type CpuState = Riscv64CpuState;

    #[inline]
    fn int_arg(cpu: &Self::CpuState, index: usize) -> u64 {
        // a0-a7 are x10-x17.
        cpu.x[10 + index]
    }

    #[inline]
    fn set_int_arg(cpu: &mut Self::CpuState, index: usize, value: u64) {
        cpu.x[10 + index] = value;
    }

    #[inline]
    fn float_reg_bits(cpu: &Self::CpuState, index: usize) -> u64 {
        // fa0-fa7 are f10-f17.
        cpu.f[10 + index]
    }

    #[inline]
    fn set_float_reg_bits(cpu: &mut Self::CpuState, index: usize, bits: u64) {
        cpu.f[10 + index] = bits;
    }

    #[inline]
    fn stack_pointer(cpu: &Self::CpuState) -> GuestAddr {
        cpu.x[2]
    }

    #[inline]
    fn set_stack_pointer(cpu: &mut Self::CpuState, sp: GuestAddr) {
        cpu.x[2] = sp;
    }

    #[inline]
    fn program_counter(cpu: &Self::CpuState) -> GuestAddr {
        cpu.insn_addr
    }

    #[inline]
    fn set_program_counter(cpu: &mut Self::CpuState, pc: GuestAddr) {
        cpu.insn_addr = pc;
    }

    #[inline]
    fn int_return(cpu: &Self::CpuState) -> u64 {
        cpu.x[10]
    }

    #[inline]
    fn set_int_return(cpu: &mut Self::CpuState, value: u64) {
        cpu.x[10] = value;
    }

    #[inline]
    fn int_return_hi(cpu: &Self::CpuState) -> u64 {
        cpu.x[11]
    }

    #[inline]
    fn set_int_return_hi(cpu: &mut Self::CpuState, value: u64) {
        cpu.x[11] = value;
    }

    #[inline]
    fn float_return_bits(cpu: &Self::CpuState) -> u64 {
        cpu.f[10]
    }

    #[inline]
    fn set_float_return_bits(cpu: &mut Self::CpuState, bits: u64) {
        cpu.f[10] = bits;
    }

    #[inline]
    fn indirect_result_reg(cpu: &Self::CpuState) -> u64 {
        cpu.x[10]
    }

    fn classify_aggregate_return(size: usize) -> AggregateReturn {
        match size {
            0..=8 => AggregateReturn::Packed { regs: 1 },
            9..=16 => AggregateReturn::Packed { regs: 2 },
            _ => AggregateReturn::Indirect,
        }
    }
}
