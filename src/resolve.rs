//! Runtime resolution of operand values from a live register context.
//!
//! Resolution runs inline in whichever target thread executes the probed
//! instruction. It never allocates, never blocks, and never fails the
//! execution: an operand that cannot be obtained safely drops the single
//! event, and the next execution of the same instruction gets a fresh
//! chance.

use core::ptr;

use crate::{
    insn::{MemRef, RegisterId},
    map::TRACE_RTN_LEN,
    plan::{Operand, OperandSpec, ProbePlan},
};

/// A live register-context snapshot, supplied by the instrumentation
/// engine for every dynamic execution of a probed instruction.
pub trait CpuContext {
    /// Read a register value by its decoder identifier.
    fn read_reg(&self, reg: RegisterId) -> u64;

    /// The code address of the probed instruction.
    fn ip(&self) -> u64;

    /// The value of the `n`-th argument-passing register of the platform
    /// calling convention (0-based; rdi and rsi on SysV x86-64).
    fn call_argument(&self, n: u8) -> u64;
}

/// Answers whether a memory range may be dereferenced.
///
/// Queried before every memory read the resolver performs.
/// Implementations must be side-effect-free and must not fault.
///
/// # Safety
/// A `true` answer is a promise that reading `len` bytes at `addr` cannot
/// fault for the duration of the probe; the resolver dereferences raw
/// pointers on its strength.
pub unsafe trait MemoryOracle {
    /// Whether `[addr, addr + len)` is readable.
    fn is_readable(&self, addr: usize, len: usize) -> bool;
}

/// A resolved probe event, ready for the trace map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceEvent {
    /// The operand values of one comparison-class execution.
    Compare {
        /// Code address of the instruction.
        address: u64,
        /// Declared operand width in bytes.
        width: u8,
        /// The first operand value.
        v0: u64,
        /// The second operand value.
        v1: u64,
    },
    /// The argument buffers of one call-class execution.
    Routine {
        /// Code address of the instruction.
        address: u64,
        /// Bytes behind the first argument pointer.
        v0: [u8; TRACE_RTN_LEN],
        /// Bytes behind the second argument pointer.
        v1: [u8; TRACE_RTN_LEN],
    },
}

/// Resolve a probe plan against a live context snapshot.
///
/// Returns `None` when any involved value cannot be obtained safely; the
/// event is dropped without a trace.
#[inline]
pub fn resolve<C, O>(plan: &ProbePlan, ctx: &C, oracle: &O) -> Option<TraceEvent>
where
    C: CpuContext,
    O: MemoryOracle,
{
    match plan {
        ProbePlan::Compare { lhs, rhs } => {
            let v0 = operand_value(lhs, ctx, oracle)?;
            let v1 = operand_value(rhs, ctx, oracle)?;
            Some(TraceEvent::Compare {
                address: ctx.ip(),
                width: lhs.width(),
                v0,
                v1,
            })
        }
        ProbePlan::Call => resolve_call(ctx, oracle),
    }
}

fn operand_value<C, O>(spec: &OperandSpec, ctx: &C, oracle: &O) -> Option<u64>
where
    C: CpuContext,
    O: MemoryOracle,
{
    match *spec.op() {
        Operand::Register(reg) => Some(ctx.read_reg(reg)),
        Operand::Immediate(imm) => Some(imm),
        Operand::Memory(ref mem) => read_mem(mem, spec.width(), ctx, oracle),
    }
}

#[expect(clippy::cast_sign_loss)]
fn read_mem<C, O>(mem: &MemRef, width: u8, ctx: &C, oracle: &O) -> Option<u64>
where
    C: CpuContext,
    O: MemoryOracle,
{
    let base = mem.base.map_or(0, |reg| ctx.read_reg(reg));
    let index = mem.index.map_or(0, |reg| ctx.read_reg(reg));
    let address = base
        .wrapping_add(index.wrapping_mul(u64::from(mem.scale)))
        .wrapping_add(mem.disp as u64) as usize;

    if !oracle.is_readable(address, width as usize) {
        return None;
    }

    // The oracle vouched for `width` bytes at `address`. Reads must be
    // unaligned: nothing constrains what the target compares.
    let value = unsafe {
        match width {
            1 => u64::from(ptr::read_unaligned(address as *const u8)),
            2 => u64::from(ptr::read_unaligned(address as *const u16)),
            4 => u64::from(ptr::read_unaligned(address as *const u32)),
            8 => ptr::read_unaligned(address as *const u64),
            _ => panic!("unsupported operand width: {width}"),
        }
    };
    Some(value)
}

fn resolve_call<C, O>(ctx: &C, oracle: &O) -> Option<TraceEvent>
where
    C: CpuContext,
    O: MemoryOracle,
{
    let ptr0 = ctx.call_argument(0) as usize;
    let ptr1 = ctx.call_argument(1) as usize;

    if usize::MAX - ptr0 < TRACE_RTN_LEN || usize::MAX - ptr1 < TRACE_RTN_LEN {
        return None;
    }
    if !oracle.is_readable(ptr0, TRACE_RTN_LEN) || !oracle.is_readable(ptr1, TRACE_RTN_LEN) {
        return None;
    }

    let (v0, v1) = unsafe { (read_argument(ptr0), read_argument(ptr1)) };
    Some(TraceEvent::Routine {
        address: ctx.ip(),
        v0,
        v1,
    })
}

/// # Safety
/// `ptr` must be readable for [`TRACE_RTN_LEN`] bytes.
unsafe fn read_argument(ptr: usize) -> [u8; TRACE_RTN_LEN] {
    let mut buf = [0u8; TRACE_RTN_LEN];
    ptr::copy_nonoverlapping(ptr as *const u8, buf.as_mut_ptr(), TRACE_RTN_LEN);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::insn::{DecodedInsn, DecodedOperand, InsnKind, RawOperand};

    /// A snapshot over a handful of registers; register 0 doubles as ip.
    struct TestContext {
        regs: [u64; 8],
    }

    impl CpuContext for TestContext {
        fn read_reg(&self, reg: RegisterId) -> u64 {
            self.regs[usize::from(reg.0)]
        }

        fn ip(&self) -> u64 {
            self.regs[0]
        }

        fn call_argument(&self, n: u8) -> u64 {
            self.regs[6 + usize::from(n)]
        }
    }

    /// Treats everything inside one readable range as dereferenceable.
    struct RangeOracle {
        start: usize,
        len: usize,
    }

    impl RangeOracle {
        fn over(slice: &[u8]) -> Self {
            Self {
                start: slice.as_ptr() as usize,
                len: slice.len(),
            }
        }

        fn nothing() -> Self {
            Self { start: 0, len: 0 }
        }
    }

    unsafe impl MemoryOracle for RangeOracle {
        fn is_readable(&self, addr: usize, len: usize) -> bool {
            addr >= self.start && addr + len <= self.start + self.len
        }
    }

    fn compare_plan(operands: &[DecodedOperand]) -> ProbePlan {
        let insn = DecodedInsn::new(InsnKind::Cmp, 0x1000, operands);
        ProbePlan::classify(&insn).unwrap()
    }

    #[test]
    fn registers_and_immediates_resolve() {
        let ctx = TestContext {
            regs: [0x1000, 0xaabb, 0, 0, 0, 0, 0, 0],
        };
        let plan = compare_plan(&[
            DecodedOperand::new(2, RawOperand::Register(RegisterId(1))),
            DecodedOperand::new(2, RawOperand::Immediate(0x7f)),
        ]);

        assert_eq!(
            resolve(&plan, &ctx, &RangeOracle::nothing()),
            Some(TraceEvent::Compare {
                address: 0x1000,
                width: 2,
                v0: 0xaabb,
                v1: 0x7f,
            })
        );
    }

    #[test]
    fn memory_operands_resolve_through_the_formula() {
        // 2 elements of 4 bytes each, read the second one.
        let data: [u8; 8] = [0, 0, 0, 0, 0x78, 0x56, 0x34, 0x12];
        let ctx = TestContext {
            regs: [0x1000, data.as_ptr() as u64, 1, 0, 0, 0, 0, 0],
        };
        let plan = compare_plan(&[
            DecodedOperand::new(
                4,
                RawOperand::Memory(MemRef {
                    segment: None,
                    base: Some(RegisterId(1)),
                    index: Some(RegisterId(2)),
                    scale: 4,
                    disp: 0,
                }),
            ),
            DecodedOperand::new(4, RawOperand::Immediate(0x12345678)),
        ]);

        assert_eq!(
            resolve(&plan, &ctx, &RangeOracle::over(&data)),
            Some(TraceEvent::Compare {
                address: 0x1000,
                width: 4,
                v0: 0x12345678,
                v1: 0x12345678,
            })
        );
    }

    #[test]
    fn memory_reads_may_be_unaligned() {
        let data: [u8; 9] = [0xff, 1, 2, 3, 4, 5, 6, 7, 8];
        let ctx = TestContext {
            regs: [0x1000, data.as_ptr() as u64, 0, 0, 0, 0, 0, 0],
        };
        let plan = compare_plan(&[
            DecodedOperand::new(
                8,
                RawOperand::Memory(MemRef {
                    segment: None,
                    base: Some(RegisterId(1)),
                    index: None,
                    scale: 1,
                    disp: 1,
                }),
            ),
            DecodedOperand::new(8, RawOperand::Immediate(0)),
        ]);

        assert_eq!(
            resolve(&plan, &ctx, &RangeOracle::over(&data)),
            Some(TraceEvent::Compare {
                address: 0x1000,
                width: 8,
                v0: 0x0807060504030201,
                v1: 0,
            })
        );
    }

    #[test]
    fn unreadable_memory_drops_the_event() {
        let ctx = TestContext {
            regs: [0x1000, 0xdead0000, 0, 0, 0, 0, 0, 0],
        };
        let plan = compare_plan(&[
            DecodedOperand::new(
                4,
                RawOperand::Memory(MemRef {
                    segment: None,
                    base: Some(RegisterId(1)),
                    index: None,
                    scale: 1,
                    disp: 0,
                }),
            ),
            DecodedOperand::new(4, RawOperand::Register(RegisterId(2))),
        ]);

        assert_eq!(resolve(&plan, &ctx, &RangeOracle::nothing()), None);
    }

    #[test]
    fn call_arguments_resolve_to_byte_buffers() {
        let arg0: [u8; 64] = core::array::from_fn(|i| i as u8);
        let arg1 = [0x5au8; 64];
        // Both buffers readable through one oracle is not expressible with
        // RangeOracle, so pick them out of a single backing slice.
        let mut backing = [0u8; 128];
        backing[..64].copy_from_slice(&arg0);
        backing[64..].copy_from_slice(&arg1);

        let ctx = TestContext {
            regs: [
                0x2000,
                0,
                0,
                0,
                0,
                0,
                backing.as_ptr() as u64,
                backing[64..].as_ptr() as u64,
            ],
        };

        let Some(TraceEvent::Routine { address, v0, v1 }) =
            resolve(&ProbePlan::Call, &ctx, &RangeOracle::over(&backing))
        else {
            panic!("expected a routine event");
        };
        assert_eq!(address, 0x2000);
        assert_eq!(&v0[..], &arg0[..TRACE_RTN_LEN]);
        assert_eq!(v1, [0x5au8; TRACE_RTN_LEN]);
    }

    #[test]
    fn pointer_near_address_space_end_drops_the_event() {
        let data = [0u8; 64];
        let ctx = TestContext {
            regs: [
                0x2000,
                0,
                0,
                0,
                0,
                0,
                u64::MAX - 10,
                data.as_ptr() as u64,
            ],
        };

        assert_eq!(
            resolve(&ProbePlan::Call, &ctx, &RangeOracle::over(&data)),
            None
        );
    }

    #[test]
    fn unreadable_call_argument_drops_the_event() {
        let data = [0u8; 64];
        let ctx = TestContext {
            regs: [0x2000, 0, 0, 0, 0, 0, data.as_ptr() as u64, 0x1000],
        };

        assert_eq!(
            resolve(&ProbePlan::Call, &ctx, &RangeOracle::over(&data)),
            None
        );
    }
}
