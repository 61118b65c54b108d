//! Types at the boundary to the instruction decoder.
//!
//! The dynamic instrumentation engine walks the target's code with its own
//! decoder and hands every discovered instruction to the probe planner in
//! this shape. All of it is static metadata; nothing here ever reads
//! target memory or registers.

use serde::{Deserialize, Serialize};

/// An opaque register identifier, as assigned by the decoder.
///
/// The engine never interprets these, it only carries them from the
/// decoder to the register-context snapshot.
#[repr(transparent)]
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct RegisterId(pub u16);

/// A memory-operand addressing formula: `base + index * scale + disp`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemRef {
    /// Segment override register, if any.
    ///
    /// Only consulted when deciding call-probe eligibility; address
    /// computation ignores it.
    pub segment: Option<RegisterId>,
    /// Base register. Contributes 0 to the address when absent.
    pub base: Option<RegisterId>,
    /// Index register. Contributes 0 to the address when absent.
    pub index: Option<RegisterId>,
    /// Scale applied to the index register value.
    pub scale: u32,
    /// Constant displacement.
    pub disp: i64,
}

/// One operand as reported by the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawOperand {
    /// The decoder could not classify this operand.
    Invalid,
    /// A register operand.
    Register(RegisterId),
    /// An immediate operand, sign-extended by the decoder.
    Immediate(i64),
    /// A memory operand.
    Memory(MemRef),
}

/// A decoded operand together with its declared width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedOperand {
    /// Operand width in bytes.
    pub width: u8,
    /// The operand itself.
    pub op: RawOperand,
}

impl DecodedOperand {
    /// Bundle an operand with its width.
    #[must_use]
    pub fn new(width: u8, op: RawOperand) -> Self {
        Self { width, op }
    }
}

/// The instruction identities the probe planner distinguishes.
///
/// Every identity the engine does not instrument maps to
/// [`InsnKind::Other`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InsnKind {
    /// A routine call.
    Call,
    /// An equality/ordering compare.
    Cmp,
    /// A subtraction.
    Sub,
    /// String scan, byte element.
    Scasb,
    /// String scan, word element.
    Scasw,
    /// String scan, doubleword element.
    Scasd,
    /// String scan, quadword element.
    Scasq,
    /// String compare, byte element.
    Cmpsb,
    /// String compare, word element.
    Cmpsw,
    /// String compare, doubleword element.
    Cmpsd,
    /// String compare, scalar single.
    Cmpss,
    /// String compare, quadword element.
    Cmpsq,
    /// Anything else; never instrumented.
    Other,
}

/// A decoded instruction, as supplied once per static instruction the
/// instrumentation engine discovers.
#[derive(Debug, Clone, Copy)]
pub struct DecodedInsn<'a> {
    /// Instruction identity.
    pub kind: InsnKind,
    /// Code address of the instruction.
    pub address: u64,
    /// The instruction's operands, in decoder order.
    pub operands: &'a [DecodedOperand],
}

impl<'a> DecodedInsn<'a> {
    /// Bundle an instruction identity with its operands.
    #[must_use]
    pub fn new(kind: InsnKind, address: u64, operands: &'a [DecodedOperand]) -> Self {
        Self {
            kind,
            address,
            operands,
        }
    }
}
