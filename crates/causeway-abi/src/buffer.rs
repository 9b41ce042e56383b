//! Architecture-neutral argument buffers.
//!
//! The host→guest half of the codec. When host code calls a wrapped guest
//! function, the stub dispatcher decodes the native arguments into an
//! [`ArgBuffer`]; the interpreter (or a handler standing in for it) applies
//! the buffer to a fresh guest frame, runs the guest code, and captures the
//! return registers back into the buffer.
//!
//! [`GuestArgs`] writes a frame and [`HostArgs`] reads one; both use the
//! slot-assignment cursor from [`crate::params`], so a frame written here is
//! read back identically by [`crate::params::GuestParams`] on the guest
//! side.

use crate::arch::GuestArch;
use crate::params::{AbiParam, FrameCursor, Slot, F32_NAN_BOX};
use crate::state::ProcessState;
use crate::value::AbiKind;

/// One synthesized guest call frame: argument registers, a stack image and
/// the return slots.
#[derive(Debug, Default)]
pub struct ArgBuffer {
    int_regs: [u64; 8],
    float_regs: [u64; 8],
    stack: Vec<u8>,
    ret_int: u64,
    ret_float: u64,
}

impl ArgBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Normalized 64-bit integer return value.
    pub fn int_result(&self) -> u64 {
        self.ret_int
    }

    pub fn set_int_result(&mut self, value: u64) {
        self.ret_int = value;
    }

    /// Raw bits of the float return value (low 32 valid for singles).
    pub fn float_result_bits(&self) -> u64 {
        self.ret_float
    }

    pub fn set_float_result_bits(&mut self, bits: u64) {
        self.ret_float = bits;
    }

    /// Loads the frame into a guest CPU state: argument registers, float
    /// registers, and the stack pointer. The stack image stays inside this
    /// buffer; the guest frame points straight at it, so the buffer must
    /// outlive the call.
    pub fn apply_to_state<A: GuestArch>(&self, state: &mut ProcessState<A>) {
        for (i, value) in self.int_regs.iter().enumerate().take(A::INT_ARG_REGS) {
            A::set_int_arg(&mut state.cpu, i, *value);
        }
        let float_regs = A::FLOAT_ARG_SLOTS / A::F32_SLOTS_PER_FREG;
        for (i, bits) in self.float_regs.iter().enumerate().take(float_regs) {
            A::set_float_reg_bits(&mut state.cpu, i, *bits);
        }
        if !self.stack.is_empty() {
            A::set_stack_pointer(&mut state.cpu, self.stack.as_ptr() as u64);
        }
    }

    /// Captures the return registers of a finished guest call.
    pub fn capture_result<A: GuestArch>(&mut self, state: &ProcessState<A>, ret: AbiKind) {
        match ret {
            AbiKind::Void => {}
            AbiKind::F32 | AbiKind::F64 => {
                self.ret_float = A::float_return_bits(&state.cpu);
            }
            AbiKind::I64 | AbiKind::U64 => {
                self.ret_int = if A::INT_SLOT_SIZE == 4 {
                    A::int_return(&state.cpu) & 0xffff_ffff
                        | (A::int_return_hi(&state.cpu) << 32)
                } else {
                    A::int_return(&state.cpu)
                };
            }
            AbiKind::Ptr => {
                self.ret_int = A::slot_to_addr(A::int_return(&state.cpu));
            }
            AbiKind::I32 | AbiKind::U32 => {
                self.ret_int = A::int_return(&state.cpu) & 0xffff_ffff;
            }
        }
    }
}

/// Writer view: fills a frame in declaration order. Creating a writer
/// resets the frame, so retrying handlers can rebuild arguments in place.
pub struct GuestArgs<'a, A: GuestArch> {
    buf: &'a mut ArgBuffer,
    cursor: FrameCursor,
    _arch: std::marker::PhantomData<A>,
}

impl<'a, A: GuestArch> GuestArgs<'a, A> {
    pub fn new(buf: &'a mut ArgBuffer) -> Self {
        buf.int_regs = [0; 8];
        buf.float_regs = [0; 8];
        buf.stack.clear();
        Self {
            buf,
            cursor: FrameCursor::new(),
            _arch: std::marker::PhantomData,
        }
    }

    /// Appends the next parameter.
    pub fn push<T: AbiParam>(&mut self, value: T) {
        T::write_buffer(self, value);
    }

    /// Appends the next parameter from its raw 64-bit image, kind-driven.
    /// Used by stub dispatchers whose signature is only known as data.
    pub fn push_raw(&mut self, kind: AbiKind, bits: u64) {
        match kind {
            AbiKind::Void => {}
            AbiKind::I32 => self.push_int(bits as u32 as i32 as i64 as u64, 4),
            AbiKind::U32 => self.push_int(bits & 0xffff_ffff, 4),
            AbiKind::I64 | AbiKind::U64 => self.push_int(bits, 8),
            AbiKind::Ptr => self.push_int(bits, A::POINTER_SIZE),
            AbiKind::F32 => self.push_float(bits & 0xffff_ffff, 4),
            AbiKind::F64 => self.push_float(bits, 8),
        }
    }

    pub(crate) fn push_int(&mut self, value: u64, bytes: usize) {
        match self.cursor.int_slot::<A>(bytes) {
            Slot::IntReg(i) => self.buf.int_regs[i] = value,
            Slot::IntRegPair(i) => {
                self.buf.int_regs[i] = value & 0xffff_ffff;
                self.buf.int_regs[i + 1] = value >> 32;
            }
            Slot::Stack { offset } => self.write_stack(offset, value, bytes),
            Slot::FloatReg { .. } => unreachable!("integer value in float slot"),
        }
    }

    pub(crate) fn push_float(&mut self, bits: u64, bytes: usize) {
        let bits = if bytes == 4 && A::NAN_BOX_F32 {
            bits | F32_NAN_BOX
        } else {
            bits
        };
        match self.cursor.float_slot::<A>(bytes) {
            Slot::FloatReg { reg, half } => match half {
                Some(1) => {
                    let low = self.buf.float_regs[reg] & 0xffff_ffff;
                    self.buf.float_regs[reg] = low | (bits << 32);
                }
                Some(_) => {
                    let high = self.buf.float_regs[reg] & !0xffff_ffff;
                    self.buf.float_regs[reg] = high | (bits & 0xffff_ffff);
                }
                None => self.buf.float_regs[reg] = bits,
            },
            Slot::Stack { offset } => self.write_stack(offset, bits, bytes),
            _ => unreachable!("float value in integer slot"),
        }
    }

    fn write_stack(&mut self, offset: u64, value: u64, bytes: usize) {
        let offset = offset as usize;
        let size = bytes.max(A::STACK_SLOT_SIZE);
        if self.buf.stack.len() < offset + size {
            self.buf.stack.resize(offset + size, 0);
        }
        let le = value.to_le_bytes();
        self.buf.stack[offset..offset + bytes].copy_from_slice(&le[..bytes]);
    }
}

/// Reader view: host-typed values out of a frame, in declaration order.
pub struct HostArgs<'a, A: GuestArch> {
    buf: &'a ArgBuffer,
    cursor: FrameCursor,
    _arch: std::marker::PhantomData<A>,
}

impl<'a, A: GuestArch> HostArgs<'a, A> {
    pub fn new(buf: &'a ArgBuffer) -> Self {
        Self {
            buf,
            cursor: FrameCursor::new(),
            _arch: std::marker::PhantomData,
        }
    }

    /// Reads the next parameter.
    pub fn read<T: AbiParam>(&mut self) -> T {
        T::read_buffer(self)
    }

    /// Reads the next parameter as its raw 64-bit image, kind-driven.
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

    pub(crate) fn int_value(&mut self, bytes: usize) -> u64 {
        match self.cursor.int_slot::<A>(bytes) {
            Slot::IntReg(i) => self.buf.int_regs[i],
            Slot::IntRegPair(i) => {
                self.buf.int_regs[i] & 0xffff_ffff | (self.buf.int_regs[i + 1] << 32)
            }
            Slot::Stack { offset } => self.read_stack(offset, bytes),
            Slot::FloatReg { .. } => unreachable!("integer value in float slot"),
        }
    }

    pub(crate) fn float_value(&mut self, bytes: usize) -> u64 {
        match self.cursor.float_slot::<A>(bytes) {
            Slot::FloatReg { reg, half } => {
                let bits = self.buf.float_regs[reg];
                match half {
                    Some(1) => bits >> 32,
                    _ => bits,
                }
            }
            Slot::Stack { offset } => self.read_stack(offset, bytes),
            _ => unreachable!("float value in integer slot"),
        }
    }

    fn read_stack(&self, offset: u64, bytes: usize) -> u64 {
        let offset = offset as usize;
        let mut le = [0u8; 8];
        le[..bytes].copy_from_slice(&self.buf.stack[offset..offset + bytes]);
        u64::from_le_bytes(le)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::{Arm, Arm64, Riscv64};
    use crate::params::GuestParams;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_buffer_round_trip_arm64() {
        let mut buf = ArgBuffer::new();
        let mut w = GuestArgs::<Arm64>::new(&mut buf);
        w.push(7u32);
        w.push(1.5f64);
        w.push(0xdead_beef_0000_0001u64);
        w.push(2.5f32);
        w.push(0x4000usize as *const u8);

        let mut r = HostArgs::<Arm64>::new(&buf);
        assert_eq!(r.read::<u32>(), 7);
        assert_eq!(r.read::<f64>(), 1.5);
        assert_eq!(r.read::<u64>(), 0xdead_beef_0000_0001);
        assert_eq!(r.read::<f32>(), 2.5);
        assert_eq!(r.read::<*const u8>() as usize, 0x4000);
    }

    #[test]
    fn test_buffer_round_trip_arm_pairs_and_s_slots() {
        let mut buf = ArgBuffer::new();
        let mut w = GuestArgs::<Arm>::new(&mut buf);
        w.push(1u32);
        w.push(0x1122_3344_5566_7788u64); // r2:r3 pair
        w.push(1.0f32); // s0
        w.push(2.0f32); // s1
        w.push(3.5f64); // d1

        let mut r = HostArgs::<Arm>::new(&buf);
        assert_eq!(r.read::<u32>(), 1);
        assert_eq!(r.read::<u64>(), 0x1122_3344_5566_7788);
        assert_eq!(r.read::<f32>(), 1.0);
        assert_eq!(r.read::<f32>(), 2.0);
        assert_eq!(r.read::<f64>(), 3.5);
    }

    #[test]
    fn test_buffer_spills_to_stack_image() {
        let mut buf = ArgBuffer::new();
        let mut w = GuestArgs::<Riscv64>::new(&mut buf);
        for i in 0..10u64 {
            w.push(i);
        }

        let mut r = HostArgs::<Riscv64>::new(&buf);
        for i in 0..10u64 {
            assert_eq!(r.read::<u64>(), i);
        }
    }

    #[test]
    fn test_writer_resets_frame() {
        let mut buf = ArgBuffer::new();
        let mut w = GuestArgs::<Arm64>::new(&mut buf);
        w.push(1u64);
        w.push(2u64);

        let mut w = GuestArgs::<Arm64>::new(&mut buf);
        w.push(9u64);

        let mut r = HostArgs::<Arm64>::new(&buf);
        assert_eq!(r.read::<u64>(), 9);
        assert_eq!(r.read::<u64>(), 0);
    }

    #[test]
    fn test_apply_then_read_as_guest_frame() {
        let mut buf = ArgBuffer::new();
        let mut w = GuestArgs::<Arm64>::new(&mut buf);
        for i in 0..8u64 {
            w.push(1000 + i);
        }
        w.push(5.5f64);
        w.push(0xfeed_0000_0000_0001u64); // spills to the stack image

        let mut st = ProcessState::<Arm64>::new();
        buf.apply_to_state(&mut st);

        let mut params = GuestParams::new(&st);
        for i in 0..8u64 {
            assert_eq!(params.read::<u64>(), 1000 + i);
        }
        assert_eq!(params.read::<f64>(), 5.5);
        assert_eq!(params.read::<u64>(), 0xfeed_0000_0000_0001);
    }

    #[test]
    fn test_capture_result_normalizes_widths() {
        let mut st = ProcessState::<Arm>::new();
        st.cpu.r[0] = 0x9abc_def0;
        st.cpu.r[1] = 0x1234_5678;

        let mut buf = ArgBuffer::new();
        buf.capture_result(&st, AbiKind::U64);
        assert_eq!(buf.int_result(), 0x1234_5678_9abc_def0);

        buf.capture_result(&st, AbiKind::U32);
        assert_eq!(buf.int_result(), 0x9abc_def0);

        let mut st = ProcessState::<Riscv64>::new();
        st.cpu.f[10] = 0xffff_ffff_0000_0000 | 2.5f32.to_bits() as u64;
        buf.capture_result(&st, AbiKind::F32);
        assert_eq!(f32::from_bits(buf.float_result_bits() as u32), 2.5);
    }

    #[test]
    fn test_riscv_f32_args_nan_boxed_on_apply() {
        let mut buf = ArgBuffer::new();
        let mut w = GuestArgs::<Riscv64>::new(&mut buf);
        w.push(2.5f32);

        let mut st = ProcessState::<Riscv64>::new();
        buf.apply_to_state(&mut st);
        assert_eq!(st.cpu.f[10] >> 32, 0xffff_ffff);
        assert_eq!(f32::from_bits(st.cpu.f[10] as u32), 2.5);
    }
}
