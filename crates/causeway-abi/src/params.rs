//! Typed access to guest call frames.
//!
//! The guest→host half of the codec: [`GuestParams`] walks the argument
//! registers and the guest stack of a captured call frame in declaration
//! order, and [`HostFn`] turns an `extern "C"` function type into a complete
//! marshal-and-call step. The host→guest half lives in [`crate::buffer`] and
//! shares the slot-assignment rules through [`FrameCursor`].
//!
//! Slot assignment follows the guest calling convention: integer and pointer
//! values fill the integer argument registers and then spill to the stack;
//! float values fill the float registers (with `s`-slot packing on 32-bit
//! Arm); 64-bit values on 32-bit guests occupy even-aligned register pairs
//! and never back-fill once an argument has spilled.

use std::mem::size_of;

use crate::arch::{AggregateReturn, GuestArch};
use crate::buffer::{GuestArgs, HostArgs};
use crate::state::ProcessState;
use crate::value::{AbiKind, GuestAddr, HostCode, Signature};

/// Where one argument lives in a guest frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Slot {
    /// One integer argument register.
    IntReg(usize),
    /// An even-aligned register pair holding a 64-bit value (low half first).
    IntRegPair(usize),
    /// A float register; `half` selects a 32-bit lane when the architecture
    /// packs two single-precision slots per register.
    FloatReg { reg: usize, half: Option<usize> },
    /// Bytes above the guest stack pointer.
    Stack { offset: u64 },
}

/// Sequential slot assignment for one call frame.
///
/// Both frame views (register file and argument buffer) use the same cursor
/// so that reader and writer agree on placement by construction.
#[derive(Debug, Default)]
pub(crate) struct FrameCursor {
    int: usize,
    float: usize,
    stack: u64,
}

impl FrameCursor {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn int_slot<A: GuestArch>(&mut self, bytes: usize) -> Slot {
        if bytes > A::INT_SLOT_SIZE {
            // 64-bit value on a 32-bit guest: even-aligned pair, and no
            // back-fill of the remaining registers once it spills.
            self.int = (self.int + 1) & !1;
            if self.int + 2 <= A::INT_ARG_REGS {
                let slot = Slot::IntRegPair(self.int);
                self.int += 2;
                return slot;
            }
            self.int = A::INT_ARG_REGS;
            return self.stack_slot::<A>(8, 8);
        }
        if self.int < A::INT_ARG_REGS {
            let slot = Slot::IntReg(self.int);
            self.int += 1;
            slot
        } else {
            self.stack_slot::<A>(bytes, bytes)
        }
    }

    pub(crate) fn float_slot<A: GuestArch>(&mut self, bytes: usize) -> Slot {
        if bytes <= 4 {
            if self.float < A::FLOAT_ARG_SLOTS {
                let slot = if A::F32_SLOTS_PER_FREG == 1 {
                    Slot::FloatReg {
                        reg: self.float,
                        half: None,
                    }
                } else {
                    Slot::FloatReg {
                        reg: self.float / 2,
                        half: Some(self.float % 2),
                    }
                };
                self.float += 1;
                return slot;
            }
            return self.stack_slot::<A>(4, 4);
        }
        if A::F32_SLOTS_PER_FREG == 1 {
            if self.float < A::FLOAT_ARG_SLOTS {
                let slot = Slot::FloatReg {
                    reg: self.float,
                    half: None,
                };
                self.float += 1;
                return slot;
            }
            return self.stack_slot::<A>(8, 8);
        }
        // Double on s-slot packing architectures: align to a full register.
        self.float = (self.float + 1) & !1;
        if self.float + 2 <= A::FLOAT_ARG_SLOTS {
            let slot = Slot::FloatReg {
                reg: self.float / 2,
                half: None,
            };
            self.float += 2;
            return slot;
        }
        self.float = A::FLOAT_ARG_SLOTS;
        self.stack_slot::<A>(8, 8)
    }

    fn stack_slot<A: GuestArch>(&mut self, size: usize, align: usize) -> Slot {
        let align = align.max(A::STACK_SLOT_SIZE) as u64;
        self.stack = (self.stack + align - 1) & !(align - 1);
        let slot = Slot::Stack { offset: self.stack };
        self.stack += size.max(A::STACK_SLOT_SIZE) as u64;
        slot
    }
}

/// Reader over the argument slots of a captured guest call frame.
///
/// Values are read in declaration order through [`GuestParams::read`]. Frames
/// are produced by the interpreter and described by proxy-table signatures,
/// so a frame always matches the sequence of reads a marshaller performs;
/// reads past the register budget dereference the guest stack, which shares
/// the host address space.
pub struct GuestParams<'a, A: GuestArch> {
    cpu: &'a A::CpuState,
    cursor: FrameCursor,
}

impl<'a, A: GuestArch> GuestParams<'a, A> {
    pub fn new(state: &'a ProcessState<A>) -> Self {
        Self {
            cpu: &state.cpu,
            cursor: FrameCursor::new(),
        }
    }

    /// Reads the next parameter.
    pub fn read<T: AbiParam>(&mut self) -> T {
        T::read_guest(self)
    }

    /// Claims the hidden pointer of an indirect aggregate return. Must be
    /// called before any parameter is read: on architectures that pass the
    /// pointer in the first integer argument register this consumes that
    /// slot.
    pub fn claim_indirect_result(&mut self) -> GuestAddr {
        debug_assert!(self.cursor.int == 0 && self.cursor.stack == 0);
        if A::INDIRECT_RESULT_IN_ARG0 {
            let slot = self.cursor.int_slot::<A>(A::POINTER_SIZE);
            A::slot_to_addr(self.resolve_int(slot))
        } else {
            A::slot_to_addr(A::indirect_result_reg(self.cpu))
        }
    }

    /// Reads the next parameter by kind, as its raw 64-bit image: integers
    /// zero-extended, pointers normalized to host width, float bits in the
    /// low lanes. This is the wrap-at-runtime path; compile-time marshallers
    /// use [`GuestParams::read`].
    pub fn read_raw(&mut self, kind: AbiKind) -> u64 {
        match kind {
            AbiKind::Void => 0,
            AbiKind::I32 | AbiKind::U32 => self.int_value(4) & 0xffff_ffff,
            AbiKind::I64 | AbiKind::U64 => self.int_value(8),
            AbiKind::Ptr => A::slot_to_addr(self.int_value(A::POINTER_SIZE)),
            AbiKind::F32 => self.float_value(4) & 0xffff_ffff,
            AbiKind::F64 => self.float_value(8),
        }
    }

    fn resolve_int(&self, slot: Slot) -> u64 {
        match slot {
            Slot::IntReg(i) => A::int_arg(self.cpu, i),
            Slot::IntRegPair(i) => {
                A::int_arg(self.cpu, i) & 0xffff_ffff | (A::int_arg(self.cpu, i + 1) << 32)
            }
            Slot::FloatReg { .. } => unreachable!("integer value in float slot"),
            Slot::Stack { offset } => self.read_stack(offset, 8),
        }
    }

    fn resolve_float(&self, slot: Slot, bytes: usize) -> u64 {
        match slot {
            Slot::FloatReg { reg, half } => {
                let bits = A::float_reg_bits(self.cpu, reg);
                match half {
                    Some(1) => bits >> 32,
                    _ => bits,
                }
            }
            Slot::Stack { offset } => self.read_stack(offset, bytes),
            _ => unreachable!("float value in integer slot"),
        }
    }

    fn int_value(&mut self, bytes: usize) -> u64 {
        let slot = self.cursor.int_slot::<A>(bytes);
        self.resolve_int(slot)
    }

    fn float_value(&mut self, bytes: usize) -> u64 {
        let slot = self.cursor.float_slot::<A>(bytes);
        self.resolve_float(slot, bytes)
    }

    fn read_stack(&self, offset: u64, bytes: usize) -> u64 {
        let addr = (A::stack_pointer(self.cpu) + offset) as usize;
        // The guest stack lives in this process; the frame extends past the
        // register budget exactly when the signature says it does.
        unsafe {
            if bytes <= 4 {
                std::ptr::read_unaligned(addr as *const u32) as u64
            } else {
                std::ptr::read_unaligned(addr as *const u64)
            }
        }
    }
}

/// A value type that can cross the bridge as a parameter.
pub trait AbiParam: Copy + 'static {
    const KIND: AbiKind;

    fn read_guest<A: GuestArch>(params: &mut GuestParams<'_, A>) -> Self;
    fn read_buffer<A: GuestArch>(args: &mut HostArgs<'_, A>) -> Self;
    fn write_buffer<A: GuestArch>(args: &mut GuestArgs<'_, A>, value: Self);
}

impl AbiParam for u32 {
    const KIND: AbiKind = AbiKind::U32;

    fn read_guest<A: GuestArch>(params: &mut GuestParams<'_, A>) -> Self {
        params.int_value(4) as u32
    }

    fn read_buffer<A: GuestArch>(args: &mut HostArgs<'_, A>) -> Self {
        args.int_value(4) as u32
    }

    fn write_buffer<A: GuestArch>(args: &mut GuestArgs<'_, A>, value: Self) {
        args.push_int(value as u64, 4);
    }
}

impl AbiParam for i32 {
    const KIND: AbiKind = AbiKind::I32;

    fn read_guest<A: GuestArch>(params: &mut GuestParams<'_, A>) -> Self {
        params.int_value(4) as u32 as i32
    }

    fn read_buffer<A: GuestArch>(args: &mut HostArgs<'_, A>) -> Self {
        args.int_value(4) as u32 as i32
    }

    fn write_buffer<A: GuestArch>(args: &mut GuestArgs<'_, A>, value: Self) {
        // Sign-extend so 64-bit register images stay canonical.
        args.push_int(value as i64 as u64, 4);
    }
}

impl AbiParam for u64 {
    const KIND: AbiKind = AbiKind::U64;

    fn read_guest<A: GuestArch>(params: &mut GuestParams<'_, A>) -> Self {
        params.int_value(8)
    }

    fn read_buffer<A: GuestArch>(args: &mut HostArgs<'_, A>) -> Self {
        args.int_value(8)
    }

    fn write_buffer<A: GuestArch>(args: &mut GuestArgs<'_, A>, value: Self) {
        args.push_int(value, 8);
    }
}

impl AbiParam for i64 {
    const KIND: AbiKind = AbiKind::I64;

    fn read_guest<A: GuestArch>(params: &mut GuestParams<'_, A>) -> Self {
        params.int_value(8) as i64
    }

    fn read_buffer<A: GuestArch>(args: &mut HostArgs<'_, A>) -> Self {
        args.int_value(8) as i64
    }

    fn write_buffer<A: GuestArch>(args: &mut GuestArgs<'_, A>, value: Self) {
        args.push_int(value as u64, 8);
    }
}

impl AbiParam for f32 {
    const KIND: AbiKind = AbiKind::F32;

    fn read_guest<A: GuestArch>(params: &mut GuestParams<'_, A>) -> Self {
        f32::from_bits(params.float_value(4) as u32)
    }

    fn read_buffer<A: GuestArch>(args: &mut HostArgs<'_, A>) -> Self {
        f32::from_bits(args.float_value(4) as u32)
    }

    fn write_buffer<A: GuestArch>(args: &mut GuestArgs<'_, A>, value: Self) {
        args.push_float(value.to_bits() as u64, 4);
    }
}

impl AbiParam for f64 {
    const KIND: AbiKind = AbiKind::F64;

    fn read_guest<A: GuestArch>(params: &mut GuestParams<'_, A>) -> Self {
        f64::from_bits(params.float_value(8))
    }

    fn read_buffer<A: GuestArch>(args: &mut HostArgs<'_, A>) -> Self {
        f64::from_bits(args.float_value(8))
    }

    fn write_buffer<A: GuestArch>(args: &mut GuestArgs<'_, A>, value: Self) {
        args.push_float(value.to_bits(), 8);
    }
}

impl<T: 'static> AbiParam for *const T {
    const KIND: AbiKind = AbiKind::Ptr;

    fn read_guest<A: GuestArch>(params: &mut GuestParams<'_, A>) -> Self {
        A::slot_to_addr(params.int_value(A::POINTER_SIZE)) as usize as *const T
    }

    fn read_buffer<A: GuestArch>(args: &mut HostArgs<'_, A>) -> Self {
        A::slot_to_addr(args.int_value(A::POINTER_SIZE)) as usize as *const T
    }

    fn write_buffer<A: GuestArch>(args: &mut GuestArgs<'_, A>, value: Self) {
        args.push_int(value as usize as u64, A::POINTER_SIZE);
    }
}

impl<T: 'static> AbiParam for *mut T {
    const KIND: AbiKind = AbiKind::Ptr;

    fn read_guest<A: GuestArch>(params: &mut GuestParams<'_, A>) -> Self {
        A::slot_to_addr(params.int_value(A::POINTER_SIZE)) as usize as *mut T
    }

    fn read_buffer<A: GuestArch>(args: &mut HostArgs<'_, A>) -> Self {
        A::slot_to_addr(args.int_value(A::POINTER_SIZE)) as usize as *mut T
    }

    fn write_buffer<A: GuestArch>(args: &mut GuestArgs<'_, A>, value: Self) {
        args.push_int(value as usize as u64, A::POINTER_SIZE);
    }
}

pub(crate) const F32_NAN_BOX: u64 = 0xffff_ffff_0000_0000;

/// A value type that can cross the bridge as a return value.
pub trait AbiRet: Copy + 'static {
    const KIND: AbiKind;

    fn write_guest_return<A: GuestArch>(cpu: &mut A::CpuState, value: Self);
    fn read_guest_return<A: GuestArch>(cpu: &A::CpuState) -> Self;
}

impl AbiRet for () {
    const KIND: AbiKind = AbiKind::Void;

    fn write_guest_return<A: GuestArch>(_cpu: &mut A::CpuState, _value: Self) {}

    fn read_guest_return<A: GuestArch>(_cpu: &A::CpuState) -> Self {}
}

impl AbiRet for u32 {
    const KIND: AbiKind = AbiKind::U32;

    fn write_guest_return<A: GuestArch>(cpu: &mut A::CpuState, value: Self) {
        A::set_int_return(cpu, value as u64);
    }

    fn read_guest_return<A: GuestArch>(cpu: &A::CpuState) -> Self {
        A::int_return(cpu) as u32
    }
}

impl AbiRet for i32 {
    const KIND: AbiKind = AbiKind::I32;

    fn write_guest_return<A: GuestArch>(cpu: &mut A::CpuState, value: Self) {
        A::set_int_return(cpu, value as i64 as u64);
    }

    fn read_guest_return<A: GuestArch>(cpu: &A::CpuState) -> Self {
        A::int_return(cpu) as u32 as i32
    }
}

impl AbiRet for u64 {
    const KIND: AbiKind = AbiKind::U64;

    fn write_guest_return<A: GuestArch>(cpu: &mut A::CpuState, value: Self) {
        if A::INT_SLOT_SIZE == 4 {
            A::set_int_return(cpu, value & 0xffff_ffff);
            A::set_int_return_hi(cpu, value >> 32);
        } else {
            A::set_int_return(cpu, value);
        }
    }

    fn read_guest_return<A: GuestArch>(cpu: &A::CpuState) -> Self {
        if A::INT_SLOT_SIZE == 4 {
            A::int_return(cpu) & 0xffff_ffff | (A::int_return_hi(cpu) << 32)
        } else {
            A::int_return(cpu)
        }
    }
}

impl AbiRet for i64 {
    const KIND: AbiKind = AbiKind::I64;

    fn write_guest_return<A: GuestArch>(cpu: &mut A::CpuState, value: Self) {
        u64::write_guest_return::<A>(cpu, value as u64);
    }

    fn read_guest_return<A: GuestArch>(cpu: &A::CpuState) -> Self {
        u64::read_guest_return::<A>(cpu) as i64
    }
}

impl AbiRet for f32 {
    const KIND: AbiKind = AbiKind::F32;

    fn write_guest_return<A: GuestArch>(cpu: &mut A::CpuState, value: Self) {
        let mut bits = value.to_bits() as u64;
        if A::NAN_BOX_F32 {
            bits |= F32_NAN_BOX;
        }
        A::set_float_return_bits(cpu, bits);
    }

    fn read_guest_return<A: GuestArch>(cpu: &A::CpuState) -> Self {
        f32::from_bits(A::float_return_bits(cpu) as u32)
    }
}

impl AbiRet for f64 {
    const KIND: AbiKind = AbiKind::F64;

    fn write_guest_return<A: GuestArch>(cpu: &mut A::CpuState, value: Self) {
        A::set_float_return_bits(cpu, value.to_bits());
    }

    fn read_guest_return<A: GuestArch>(cpu: &A::CpuState) -> Self {
        f64::from_bits(A::float_return_bits(cpu))
    }
}

impl<T: 'static> AbiRet for *const T {
    const KIND: AbiKind = AbiKind::Ptr;

    fn write_guest_return<A: GuestArch>(cpu: &mut A::CpuState, value: Self) {
        A::set_int_return(cpu, value as usize as u64);
    }

    fn read_guest_return<A: GuestArch>(cpu: &A::CpuState) -> Self {
        A::slot_to_addr(A::int_return(cpu)) as usize as *const T
    }
}

impl<T: 'static> AbiRet for *mut T {
    const KIND: AbiKind = AbiKind::Ptr;

    fn write_guest_return<A: GuestArch>(cpu: &mut A::CpuState, value: Self) {
        A::set_int_return(cpu, value as usize as u64);
    }

    fn read_guest_return<A: GuestArch>(cpu: &A::CpuState) -> Self {
        A::slot_to_addr(A::int_return(cpu)) as usize as *mut T
    }
}

/// Writes a typed return value into a guest frame.
pub fn set_guest_return<A: GuestArch, R: AbiRet>(state: &mut ProcessState<A>, value: R) {
    R::write_guest_return::<A>(&mut state.cpu, value);
}

/// Reads a typed return value back out of a guest frame.
pub fn guest_return<A: GuestArch, R: AbiRet>(state: &ProcessState<A>) -> R {
    R::read_guest_return::<A>(&state.cpu)
}

/// Writes a return value into a guest frame from its raw 64-bit image,
/// kind-driven. Wrap-at-runtime counterpart of [`set_guest_return`].
pub fn set_guest_return_raw<A: GuestArch>(state: &mut ProcessState<A>, kind: AbiKind, bits: u64) {
    match kind {
        AbiKind::Void => {}
        AbiKind::I32 => set_guest_return(state, bits as u32 as i32),
        AbiKind::U32 => set_guest_return(state, bits as u32),
        AbiKind::I64 => set_guest_return(state, bits as i64),
        AbiKind::U64 => set_guest_return(state, bits),
        AbiKind::Ptr => set_guest_return(state, bits as usize as *mut u8),
        AbiKind::F32 => set_guest_return(state, f32::from_bits(bits as u32)),
        AbiKind::F64 => set_guest_return(state, f64::from_bits(bits)),
    }
}

/// Return-slot handling for a by-value aggregate, resolved once per call.
///
/// Covers the split between architectures that pack small aggregates into
/// the integer return registers and those that return them through a hidden
/// caller-supplied pointer.
pub struct AggregateSlot {
    indirect: Option<GuestAddr>,
}

impl AggregateSlot {
    /// Claims the return slot for an aggregate of type `T`. Must run before
    /// the first parameter is read.
    pub fn claim<A: GuestArch, T: Copy>(params: &mut GuestParams<'_, A>) -> Self {
        match A::classify_aggregate_return(size_of::<T>()) {
            AggregateReturn::Indirect => Self {
                indirect: Some(params.claim_indirect_result()),
            },
            AggregateReturn::Packed { .. } => Self { indirect: None },
        }
    }

    /// Stores the aggregate into the claimed slot.
    ///
    /// # Safety
    ///
    /// For an indirect return the claimed pointer must reference writable
    /// guest memory with room for `T`.
    pub unsafe fn store<A: GuestArch, T: Copy>(&self, cpu: &mut A::CpuState, value: T) {
        match self.indirect {
            Some(addr) => {
                std::ptr::write_unaligned(addr as usize as *mut T, value);
                // The conventions that pass the slot in the first argument
                // register also return the address there.
                if A::INDIRECT_RESULT_IN_ARG0 {
                    A::set_int_return(cpu, addr);
                }
            }
            None => {
                debug_assert!(size_of::<T>() <= 16);
                let mut slots = [0u64; 2];
                std::ptr::copy_nonoverlapping(
                    &value as *const T as *const u8,
                    slots.as_mut_ptr() as *mut u8,
                    size_of::<T>(),
                );
                A::set_int_return(cpu, slots[0]);
                if size_of::<T>() > 8 {
                    A::set_int_return_hi(cpu, slots[1]);
                }
            }
        }
    }
}

/// An `extern "C"` function type the codec can bridge generically.
///
/// Implemented for function-pointer types of up to eight parameters whose
/// parameter and return types are [`AbiParam`]/[`AbiRet`]. Proxy tables name
/// a concrete type to get a ready-made marshaller:
/// `forward_call::<A, extern "C" fn(*mut Device, u32) -> i32>`.
pub trait HostFn<A: GuestArch> {
    /// The signature in codec terms, used for stub synthesis and diagnostics.
    fn signature() -> Signature;

    /// Reads the arguments from a guest frame, calls `callee` natively and
    /// writes the return value back into the frame.
    ///
    /// # Safety
    ///
    /// `callee` must point to a host function of exactly this type and the
    /// frame must carry arguments for it.
    unsafe fn invoke(callee: HostCode, state: &mut ProcessState<A>);
}

macro_rules! impl_host_fn {
    ($($P:ident),*) => {
        impl<A: GuestArch, R: AbiRet $(, $P: AbiParam)*> HostFn<A>
            for extern "C" fn($($P),*) -> R
        {
            fn signature() -> Signature {
                Signature::from_parts(R::KIND, &[$($P::KIND),*])
            }

            #[allow(non_snake_case, unused_mut, unused_variables)]
            unsafe fn invoke(callee: HostCode, state: &mut ProcessState<A>) {
                let mut params = GuestParams::new(state);
                $(let $P = params.read::<$P>();)*
                let f: extern "C" fn($($P),*) -> R = std::mem::transmute(callee.as_ptr());
                let ret = f($($P),*);
                R::write_guest_return::<A>(&mut state.cpu, ret);
            }
        }
    };
}

impl_host_fn!();
impl_host_fn!(P1);
impl_host_fn!(P1, P2);
impl_host_fn!(P1, P2, P3);
impl_host_fn!(P1, P2, P3, P4);
impl_host_fn!(P1, P2, P3, P4, P5);
impl_host_fn!(P1, P2, P3, P4, P5, P6);
impl_host_fn!(P1, P2, P3, P4, P5, P6, P7);
impl_host_fn!(P1, P2, P3, P4, P5, P6, P7, P8);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::{Arm, Arm64, Riscv64};
    use pretty_assertions::assert_eq;

    fn arm64_state() -> ProcessState<Arm64> {
        ProcessState::new()
    }

    #[test]
    fn test_int_args_from_registers() {
        let mut st = arm64_state();
        for i in 0..8 {
            st.cpu.x[i] = 100 + i as u64;
        }
        let mut params = GuestParams::new(&st);
        assert_eq!(params.read::<u64>(), 100);
        assert_eq!(params.read::<u32>(), 101);
        assert_eq!(params.read::<i32>(), 102);
        assert_eq!(params.read::<u64>(), 103);
    }

    #[test]
    fn test_int_args_spill_to_stack() {
        let mut st = arm64_state();
        for i in 0..8 {
            st.cpu.x[i] = i as u64;
        }
        let stack: Vec<u64> = vec![800, 900];
        st.cpu.sp = stack.as_ptr() as u64;

        let mut params = GuestParams::new(&st);
        for i in 0..8u64 {
            assert_eq!(params.read::<u64>(), i);
        }
        assert_eq!(params.read::<u64>(), 800);
        assert_eq!(params.read::<u32>(), 900);
    }

    #[test]
    fn test_arm64_u32_stack_args_take_full_slots() {
        let mut st = arm64_state();
        for i in 0..8 {
            st.cpu.x[i] = i as u64;
        }
        // Each u32 stack argument occupies an 8-byte slot.
        let stack: Vec<u64> = vec![7, 9];
        st.cpu.sp = stack.as_ptr() as u64;

        let mut params = GuestParams::new(&st);
        for _ in 0..8 {
            params.read::<u32>();
        }
        assert_eq!(params.read::<u32>(), 7);
        assert_eq!(params.read::<u32>(), 9);
    }

    #[test]
    fn test_float_args_from_registers() {
        let mut st = arm64_state();
        st.cpu.v[0] = 1.5f64.to_bits() as u128;
        st.cpu.v[1] = 2.5f32.to_bits() as u128;
        st.cpu.x[0] = 42;

        let mut params = GuestParams::new(&st);
        assert_eq!(params.read::<f64>(), 1.5);
        assert_eq!(params.read::<f32>(), 2.5);
        assert_eq!(params.read::<u32>(), 42);
    }

    #[test]
    fn test_arm_64bit_values_use_even_register_pairs() {
        let mut st = ProcessState::<Arm>::new();
        st.cpu.r[0] = 1; // u32
        // r1 skipped by pair alignment
        st.cpu.r[2] = 0x5566_7788;
        st.cpu.r[3] = 0x1122_3344;

        let mut params = GuestParams::new(&st);
        assert_eq!(params.read::<u32>(), 1);
        assert_eq!(params.read::<u64>(), 0x1122_3344_5566_7788);
    }

    #[test]
    fn test_arm_pair_spills_whole_value_to_stack() {
        // A u64 after three u32s cannot take r3 alone: it spills entirely
        // and r3 is not back-filled by later arguments.
        let mut cursor = FrameCursor::new();
        assert_eq!(cursor.int_slot::<Arm>(4), Slot::IntReg(0));
        assert_eq!(cursor.int_slot::<Arm>(4), Slot::IntReg(1));
        assert_eq!(cursor.int_slot::<Arm>(4), Slot::IntReg(2));
        assert_eq!(cursor.int_slot::<Arm>(8), Slot::Stack { offset: 0 });
        assert_eq!(cursor.int_slot::<Arm>(4), Slot::Stack { offset: 8 });
    }

    #[test]
    fn test_arm_f32_args_pack_into_s_slots() {
        let mut st = ProcessState::<Arm>::new();
        // s0 and s1 are the halves of d0.
        st.cpu.d[0] = (1.0f32.to_bits() as u64) | ((2.0f32.to_bits() as u64) << 32);
        st.cpu.d[1] = 3.5f64.to_bits();

        let mut params = GuestParams::new(&st);
        assert_eq!(params.read::<f32>(), 1.0);
        assert_eq!(params.read::<f32>(), 2.0);
        assert_eq!(params.read::<f64>(), 3.5);
    }

    #[test]
    fn test_riscv_f32_read_ignores_nan_box() {
        let mut st = ProcessState::<Riscv64>::new();
        st.cpu.f[10] = F32_NAN_BOX | 4.25f32.to_bits() as u64;

        let mut params = GuestParams::new(&st);
        assert_eq!(params.read::<f32>(), 4.25);
    }

    #[test]
    fn test_pointer_args_normalize_width() {
        let mut st = ProcessState::<Arm>::new();
        st.cpu.r[0] = 0x1000;
        let mut params = GuestParams::new(&st);
        let p: *const u8 = params.read();
        assert_eq!(p as usize, 0x1000);
    }

    #[test]
    fn test_return_round_trips() {
        let mut st = arm64_state();
        set_guest_return(&mut st, 0x1234_5678_9abc_def0u64);
        assert_eq!(guest_return::<Arm64, u64>(&st), 0x1234_5678_9abc_def0);

        let mut st = ProcessState::<Arm>::new();
        set_guest_return(&mut st, 0x1234_5678_9abc_def0u64);
        assert_eq!(st.cpu.r[0], 0x9abc_def0);
        assert_eq!(st.cpu.r[1], 0x1234_5678);
        assert_eq!(guest_return::<Arm, u64>(&st), 0x1234_5678_9abc_def0);

        let mut st = ProcessState::<Riscv64>::new();
        set_guest_return(&mut st, 2.5f32);
        // Singles are NaN-boxed in the float return register.
        assert_eq!(st.cpu.f[10] >> 32, 0xffff_ffff);
        assert_eq!(guest_return::<Riscv64, f32>(&st), 2.5);
    }

    #[test]
    fn test_aggregate_packed_in_return_registers() {
        #[derive(Clone, Copy)]
        #[repr(C)]
        struct Rect {
            x: i32,
            y: i32,
            w: i32,
            h: i32,
        }

        let mut st = arm64_state();
        let mut params = GuestParams::new(&st);
        let slot = AggregateSlot::claim::<Arm64, Rect>(&mut params);
        drop(params);
        unsafe {
            slot.store::<Arm64, Rect>(
                &mut st.cpu,
                Rect {
                    x: 1,
                    y: 2,
                    w: 3,
                    h: 4,
                },
            );
        }
        assert_eq!(st.cpu.x[0], (2u64 << 32) | 1);
        assert_eq!(st.cpu.x[1], (4u64 << 32) | 3);
    }

    #[test]
    fn test_aggregate_indirect_through_hidden_pointer() {
        // Five fields push the size past the two-register limit, so LP64D
        // returns this through a hidden pointer in a0.
        #[derive(Clone, Copy, Debug, PartialEq)]
        #[repr(C)]
        struct Bounds {
            x: i32,
            y: i32,
            w: i32,
            h: i32,
            depth: i32,
        }

        let mut out = Bounds {
            x: 0,
            y: 0,
            w: 0,
            h: 0,
            depth: 0,
        };
        let mut st = ProcessState::<Riscv64>::new();
        st.cpu.x[10] = &mut out as *mut Bounds as u64;
        st.cpu.x[11] = 77; // first real argument, after the hidden pointer

        let mut params = GuestParams::new(&st);
        let slot = AggregateSlot::claim::<Riscv64, Bounds>(&mut params);
        assert_eq!(params.read::<u32>(), 77);
        drop(params);
        let filled = Bounds {
            x: 5,
            y: 6,
            w: 7,
            h: 8,
            depth: 9,
        };
        unsafe { slot.store::<Riscv64, Bounds>(&mut st.cpu, filled) };
        assert_eq!(out, filled);
        // LP64 returns the result address in a0.
        assert_eq!(st.cpu.x[10], &out as *const Bounds as u64);
    }

    #[test]
    fn test_arm_indirect_return_consumes_first_arg_slot() {
        let mut st = ProcessState::<Arm>::new();
        st.cpu.r[0] = 0x2000; // hidden result pointer
        st.cpu.r[1] = 33;

        #[derive(Clone, Copy)]
        #[repr(C)]
        struct Rect {
            x: i32,
            y: i32,
            w: i32,
            h: i32,
        }

        let mut params = GuestParams::new(&st);
        let _slot = AggregateSlot::claim::<Arm, Rect>(&mut params);
        // The hidden pointer took r0; real arguments start at r1.
        assert_eq!(params.read::<u32>(), 33);
    }

    extern "C" fn mix(a: u64, b: u32, c: f64, d: *const u32) -> u64 {
        a + b as u64 + c as u64 + unsafe { *d } as u64
    }

    #[test]
    fn test_host_fn_invoke_end_to_end() {
        type F = extern "C" fn(u64, u32, f64, *const u32) -> u64;

        let forty = 40u32;
        let mut st = arm64_state();
        st.cpu.x[0] = 1000;
        st.cpu.x[1] = 20;
        st.cpu.v[0] = 3.0f64.to_bits() as u128;
        st.cpu.x[2] = &forty as *const u32 as u64;

        let f: F = mix;
        unsafe { <F as HostFn<Arm64>>::invoke(HostCode::from_usize(f as usize), &mut st) };
        assert_eq!(st.cpu.x[0], 1063);
    }

    #[test]
    fn test_host_fn_signature() {
        type F = extern "C" fn(*mut u8, u32, f32) -> i32;
        assert_eq!(<F as HostFn<Arm64>>::signature().to_string(), "ipuf");

        type G = extern "C" fn() -> ();
        assert_eq!(<G as HostFn<Arm64>>::signature().to_string(), "v");
    }
}
