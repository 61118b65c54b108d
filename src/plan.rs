//! Instrumentation-time classification of instructions into probe plans.
//!
//! A probe plan is built once per static instruction, the first time the
//! instrumentation engine visits it, and is immutable afterwards. Building
//! a plan only copies static operand metadata; target memory is never
//! touched before the probe actually runs.

use serde::{Deserialize, Serialize};

use crate::insn::{DecodedInsn, DecodedOperand, InsnKind, MemRef, RawOperand, RegisterId};

/// How to obtain one operand's runtime value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operand {
    /// Read the named register from the context snapshot.
    Register(RegisterId),
    /// The statically captured constant, sign-extended to 64 bit.
    Immediate(u64),
    /// Dereference the addressing formula.
    Memory(MemRef),
}

/// An operand value source plus its declared width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperandSpec {
    width: u8,
    op: Operand,
}

impl OperandSpec {
    /// Copy the static metadata of a decoded operand into the plan.
    ///
    /// # Panics
    /// On operand kinds or widths the eligibility checks should have
    /// rejected. Reaching those here means the decoder and the planner
    /// disagree on the supported operand universe, which can never be
    /// safely ignored.
    fn capture(raw: &DecodedOperand) -> Self {
        assert!(
            matches!(raw.width, 1 | 2 | 4 | 8),
            "unsupported operand width: {}",
            raw.width
        );
        let op = match raw.op {
            RawOperand::Register(reg) => Operand::Register(reg),
            #[expect(clippy::cast_sign_loss)]
            RawOperand::Immediate(imm) => Operand::Immediate(imm as u64),
            RawOperand::Memory(mem) => Operand::Memory(mem),
            RawOperand::Invalid => panic!("invalid operand past the eligibility checks"),
        };
        Self {
            width: raw.width,
            op,
        }
    }

    /// Declared operand width in bytes.
    #[must_use]
    pub fn width(&self) -> u8 {
        self.width
    }

    /// The value source.
    #[must_use]
    pub fn op(&self) -> &Operand {
        &self.op
    }
}

/// An immutable probe plan for one static instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProbePlan {
    /// Log the two operand values of a comparison-class instruction.
    Compare {
        /// The first operand. Its width is the slot's declared width.
        lhs: OperandSpec,
        /// The second operand.
        rhs: OperandSpec,
    },
    /// Log the leading bytes behind the two argument registers of a call.
    ///
    /// Carries no operand metadata: the designated argument registers are
    /// read directly from the context snapshot at execution time.
    Call,
}

impl ProbePlan {
    /// Decide whether and how to instrument `insn`.
    ///
    /// Returns `None` for every instruction that is not eligible. This is
    /// the silent path: ineligible instructions are common and skipping
    /// them is not an error.
    #[must_use]
    pub fn classify(insn: &DecodedInsn) -> Option<Self> {
        let plan = match insn.kind {
            InsnKind::Call => Self::classify_call(insn),
            InsnKind::Cmp
            | InsnKind::Sub
            | InsnKind::Scasb
            | InsnKind::Scasw
            | InsnKind::Scasd
            | InsnKind::Scasq
            | InsnKind::Cmpsb
            | InsnKind::Cmpsw
            | InsnKind::Cmpsd
            | InsnKind::Cmpss
            | InsnKind::Cmpsq => Self::classify_cmp_sub(insn),
            InsnKind::Other => None,
        }?;
        log::debug!("planned probe at {:#x}: {:?}", insn.address, plan);
        Some(plan)
    }

    fn classify_call(insn: &DecodedInsn) -> Option<Self> {
        if insn.operands.len() != 1 {
            return None;
        }

        match insn.operands[0].op {
            RawOperand::Invalid => None,
            // Segment-relative calls have addressing semantics we do not model.
            RawOperand::Memory(mem) if mem.segment.is_some() => None,
            _ => Some(ProbePlan::Call),
        }
    }

    fn classify_cmp_sub(insn: &DecodedInsn) -> Option<Self> {
        if insn.operands.len() != 2 {
            return None;
        }

        let op1 = &insn.operands[0];
        let op2 = &insn.operands[1];

        if op1.op == RawOperand::Invalid || op2.op == RawOperand::Invalid {
            return None;
        }

        // Both operands are the same size. One-byte compares are never
        // instrumented.
        if op1.width == 1 {
            return None;
        }

        Some(ProbePlan::Compare {
            lhs: OperandSpec::capture(op1),
            rhs: OperandSpec::capture(op2),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reg(width: u8, id: u16) -> DecodedOperand {
        DecodedOperand::new(width, RawOperand::Register(RegisterId(id)))
    }

    fn imm(width: u8, value: i64) -> DecodedOperand {
        DecodedOperand::new(width, RawOperand::Immediate(value))
    }

    fn mem(width: u8, segment: Option<RegisterId>) -> DecodedOperand {
        DecodedOperand::new(
            width,
            RawOperand::Memory(MemRef {
                segment,
                base: Some(RegisterId(3)),
                index: None,
                scale: 1,
                disp: 16,
            }),
        )
    }

    #[test]
    fn cmp_two_registers_plans() {
        let operands = [reg(8, 1), reg(8, 2)];
        let insn = DecodedInsn::new(InsnKind::Cmp, 0x1000, &operands);
        let plan = ProbePlan::classify(&insn).unwrap();
        match plan {
            ProbePlan::Compare { lhs, rhs } => {
                assert_eq!(lhs.width(), 8);
                assert_eq!(*lhs.op(), Operand::Register(RegisterId(1)));
                assert_eq!(*rhs.op(), Operand::Register(RegisterId(2)));
            }
            ProbePlan::Call => panic!("expected a compare plan"),
        }
    }

    #[test]
    fn one_byte_compare_is_skipped() {
        let operands = [reg(1, 1), reg(1, 2)];
        let insn = DecodedInsn::new(InsnKind::Cmp, 0x1000, &operands);
        assert!(ProbePlan::classify(&insn).is_none());
    }

    #[test]
    fn wrong_operand_count_is_skipped() {
        let operands = [reg(8, 1)];
        let insn = DecodedInsn::new(InsnKind::Cmp, 0x1000, &operands);
        assert!(ProbePlan::classify(&insn).is_none());

        let operands = [reg(8, 1), reg(8, 2)];
        let insn = DecodedInsn::new(InsnKind::Call, 0x1000, &operands);
        assert!(ProbePlan::classify(&insn).is_none());
    }

    #[test]
    fn invalid_operands_are_skipped() {
        let operands = [reg(8, 1), DecodedOperand::new(8, RawOperand::Invalid)];
        let insn = DecodedInsn::new(InsnKind::Cmp, 0x1000, &operands);
        assert!(ProbePlan::classify(&insn).is_none());

        let operands = [DecodedOperand::new(8, RawOperand::Invalid)];
        let insn = DecodedInsn::new(InsnKind::Call, 0x1000, &operands);
        assert!(ProbePlan::classify(&insn).is_none());
    }

    #[test]
    fn uninstrumented_identities_are_skipped() {
        let operands = [reg(8, 1), reg(8, 2)];
        let insn = DecodedInsn::new(InsnKind::Other, 0x1000, &operands);
        assert!(ProbePlan::classify(&insn).is_none());
    }

    #[test]
    fn sub_and_string_ops_plan() {
        for kind in [
            InsnKind::Sub,
            InsnKind::Scasw,
            InsnKind::Cmpsd,
            InsnKind::Cmpsq,
        ] {
            let operands = [reg(4, 1), mem(4, None)];
            let insn = DecodedInsn::new(kind, 0x2000, &operands);
            assert!(ProbePlan::classify(&insn).is_some(), "{kind:?}");
        }
    }

    #[test]
    fn call_through_register_plans() {
        let operands = [reg(8, 1)];
        let insn = DecodedInsn::new(InsnKind::Call, 0x3000, &operands);
        assert_eq!(ProbePlan::classify(&insn), Some(ProbePlan::Call));
    }

    #[test]
    fn direct_call_plans() {
        let operands = [imm(8, 0x4010)];
        let insn = DecodedInsn::new(InsnKind::Call, 0x4000, &operands);
        assert_eq!(ProbePlan::classify(&insn), Some(ProbePlan::Call));
    }

    #[test]
    fn segment_relative_call_is_skipped() {
        let operands = [mem(8, Some(RegisterId(40)))];
        let insn = DecodedInsn::new(InsnKind::Call, 0x5000, &operands);
        assert!(ProbePlan::classify(&insn).is_none());

        // Without the override the same call is eligible.
        let operands = [mem(8, None)];
        let insn = DecodedInsn::new(InsnKind::Call, 0x5000, &operands);
        assert_eq!(ProbePlan::classify(&insn), Some(ProbePlan::Call));
    }

    #[test]
    fn immediates_are_sign_extended() {
        let operands = [reg(4, 1), imm(4, -1)];
        let insn = DecodedInsn::new(InsnKind::Cmp, 0x6000, &operands);
        let Some(ProbePlan::Compare { rhs, .. }) = ProbePlan::classify(&insn) else {
            panic!("expected a compare plan");
        };
        assert_eq!(*rhs.op(), Operand::Immediate(u64::MAX));
    }

    #[test]
    #[should_panic(expected = "unsupported operand width")]
    fn odd_width_aborts_planning() {
        let operands = [reg(3, 1), reg(3, 2)];
        let insn = DecodedInsn::new(InsnKind::Cmp, 0x7000, &operands);
        let _ = ProbePlan::classify(&insn);
    }
}
