//! Instructions: the addressable unit the gadget-reduction passes mutate.

use crate::ir::link::Link;

/// Stable identity of an instruction within its owning function's arena.
///
/// `Function::instrs` is append-only, so an `InstrId` remains valid for the
/// lifetime of the function even after passes splice new instructions into
/// block order — insertion never shifts an existing id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstrId(pub u32);

/// The x86-64 general-purpose registers the gadget-reduction passes reason
/// about (indirect-jump target registers for C3, caller-saved registers for
/// C5). Not an exhaustive register file — this is deliberately scoped to
/// what the CORE passes need.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum Register {
    Rax,
    Rbx,
    Rcx,
    Rdx,
    Rsi,
    Rdi,
    Rbp,
    Rsp,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
}

/// Kind of control transfer a [`Semantic::ControlFlow`] instruction performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlFlowKind {
    Call,
    Jump,
    CondJump,
    Ret,
    IndirectJump,
}

/// How a direct-branch instruction's displacement bytes are laid out, so the
/// generator can re-encode them after address assignment without
/// re-disassembling. `NotEncoded` covers instructions whose bytes are fixed
/// (returns, indirect jumps, plain/literal bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchEncoding {
    /// `E9 rel32` — 5 bytes. Used for all jumps synthesized by the
    /// merge-return/merge-jump passes.
    NearJmpRel32,
    /// `E8 rel32` — 5 bytes.
    NearCallRel32,
    /// `7x rel8` — 2 bytes. The condition code `cc` is the low nibble of the
    /// second opcode byte (`0f 8x`) when promoted.
    ShortCondJmpRel8 { cc: u8 },
    /// `0F 8x rel32` — 6 bytes, the promoted form of `ShortCondJmpRel8`.
    NearCondJmpRel32 { cc: u8 },
    /// No displacement to re-encode.
    NotEncoded,
}

impl BranchEncoding {
    /// Size in bytes of this encoding.
    pub fn size(self) -> usize {
        match self {
            BranchEncoding::NearJmpRel32 | BranchEncoding::NearCallRel32 => 5,
            BranchEncoding::ShortCondJmpRel8 { .. } => 2,
            BranchEncoding::NearCondJmpRel32 { .. } => 6,
            BranchEncoding::NotEncoded => 0,
        }
    }

    /// Re-render this encoding's bytes given the already-computed
    /// displacement (target minus address of the byte following the
    /// instruction).
    pub fn encode(self, displacement: i64) -> Vec<u8> {
        match self {
            BranchEncoding::NearJmpRel32 => {
                let mut v = vec![0xe9];
                v.extend_from_slice(&(displacement as i32).to_le_bytes());
                v
            }
            BranchEncoding::NearCallRel32 => {
                let mut v = vec![0xe8];
                v.extend_from_slice(&(displacement as i32).to_le_bytes());
                v
            }
            BranchEncoding::ShortCondJmpRel8 { cc } => {
                vec![0x70 | cc, displacement as i8 as u8]
            }
            BranchEncoding::NearCondJmpRel32 { cc } => {
                let mut v = vec![0x0f, 0x80 | cc];
                v.extend_from_slice(&(displacement as i32).to_le_bytes());
                v
            }
            BranchEncoding::NotEncoded => Vec::new(),
        }
    }

    /// Whether `displacement` still fits this encoding's field width.
    pub fn fits(self, displacement: i64) -> bool {
        match self {
            BranchEncoding::ShortCondJmpRel8 { .. } => {
                displacement >= i8::MIN as i64 && displacement <= i8::MAX as i64
            }
            BranchEncoding::NearJmpRel32
            | BranchEncoding::NearCallRel32
            | BranchEncoding::NearCondJmpRel32 { .. } => {
                displacement >= i32::MIN as i64 && displacement <= i32::MAX as i64
            }
            BranchEncoding::NotEncoded => true,
        }
    }

    /// The promoted (wider) form of a short conditional jump, if any. Used
    /// by the `PromoteJumps` layout fixup.
    pub fn promoted(self) -> Option<BranchEncoding> {
        match self {
            BranchEncoding::ShortCondJmpRel8 { cc } => {
                Some(BranchEncoding::NearCondJmpRel32 { cc })
            }
            _ => None,
        }
    }
}

/// Tagged variant over what an instruction *means*, matched exhaustively at
/// use sites instead of the source's semantic base class plus dynamic type
/// tests (spec §9, "Polymorphism over instruction semantics").
#[derive(Debug, Clone)]
pub enum Semantic {
    /// An instruction with no gadget-reduction-relevant structure.
    Plain,
    /// Bytes obtained from the disassembler but otherwise opaque to the
    /// passes (same bucket as `Plain`, kept distinct to track provenance).
    Disassembled,
    /// A literal byte sequence this module inserted (NOPs, sanitizer XORs).
    Literal,
    /// A control-transfer instruction. `link` is `None` for indirect calls
    /// and for direct branches whose target could not be resolved within
    /// this program (external/PLT).
    ControlFlow {
        kind: ControlFlowKind,
        link: Option<Link>,
        encoding: BranchEncoding,
    },
    /// A non-control-flow instruction whose operand references data (RIP-
    /// relative load of a global, etc.).
    LinkedData { link: Link },
}

impl Semantic {
    /// The link carried by a [`Semantic::ControlFlow`] instruction, if any.
    pub fn link(&self) -> Option<&Link> {
        match self {
            Semantic::ControlFlow { link, .. } => link.as_ref(),
            Semantic::LinkedData { link } => Some(link),
            _ => None,
        }
    }

    /// True if this is a `ret` instruction.
    pub fn is_ret(&self) -> bool {
        matches!(
            self,
            Semantic::ControlFlow {
                kind: ControlFlowKind::Ret,
                ..
            }
        )
    }

    /// True if this is an indirect jump.
    pub fn is_indirect_jump(&self) -> bool {
        matches!(
            self,
            Semantic::ControlFlow {
                kind: ControlFlowKind::IndirectJump,
                ..
            }
        )
    }

    /// True if this is a control-flow instruction whose link is RIP-relative
    /// (the population C6/C7 scan).
    pub fn is_rip_relative_branch(&self) -> bool {
        matches!(self, Semantic::ControlFlow { link: Some(l), .. } if l.is_rip_relative())
    }
}

/// An addressable unit of raw bytes plus semantic tag.
#[derive(Debug, Clone)]
pub struct Instruction {
    /// Raw encoded bytes, length 1-15.
    pub bytes: Vec<u8>,
    /// Semantic classification.
    pub semantic: Semantic,
    /// Address assigned by the most recent generator pass; `None` whenever
    /// the IR has been structurally mutated since the last layout.
    pub address: Option<u64>,
    /// Target register of an indirect jump, used by C3's grouping. `None`
    /// for every other semantic.
    pub indirect_target_reg: Option<Register>,
}

impl Instruction {
    /// Build a plain (non-control-flow) instruction from raw bytes.
    pub fn plain(bytes: Vec<u8>) -> Self {
        Instruction {
            bytes,
            semantic: Semantic::Plain,
            address: None,
            indirect_target_reg: None,
        }
    }

    /// Build a literal instruction this module inserted (NOP, sanitizer
    /// XOR) rather than one that came from the disassembler.
    pub fn literal(bytes: Vec<u8>) -> Self {
        Instruction {
            bytes,
            semantic: Semantic::Literal,
            address: None,
            indirect_target_reg: None,
        }
    }

    /// A single `0x90` NOP.
    pub fn nop() -> Self {
        Instruction::literal(vec![0x90])
    }

    /// Build a control-flow instruction.
    pub fn control_flow(
        bytes: Vec<u8>,
        kind: ControlFlowKind,
        link: Option<Link>,
        encoding: BranchEncoding,
    ) -> Self {
        Instruction {
            bytes,
            semantic: Semantic::ControlFlow {
                kind,
                link,
                encoding,
            },
            address: None,
            indirect_target_reg: None,
        }
    }

    /// Build an indirect-jump instruction targeting `reg`.
    pub fn indirect_jump(bytes: Vec<u8>, reg: Register) -> Self {
        Instruction {
            bytes,
            semantic: Semantic::ControlFlow {
                kind: ControlFlowKind::IndirectJump,
                link: None,
                encoding: BranchEncoding::NotEncoded,
            },
            address: None,
            indirect_target_reg: Some(reg),
        }
    }

    /// Size in bytes.
    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    /// The address of the byte following this instruction, used as the
    /// reference point for RIP-relative displacement arithmetic.
    pub fn next_address(&self) -> Option<u64> {
        self.address.map(|a| a + self.size() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nop_is_one_byte() {
        assert_eq!(Instruction::nop().size(), 1);
        assert_eq!(Instruction::nop().bytes, vec![0x90]);
    }

    #[test]
    fn near_jmp_encoding_roundtrip() {
        let enc = BranchEncoding::NearJmpRel32;
        let bytes = enc.encode(10);
        assert_eq!(bytes.len(), 5);
        assert_eq!(bytes[0], 0xe9);
        assert_eq!(i32::from_le_bytes(bytes[1..5].try_into().unwrap()), 10);
    }

    #[test]
    fn short_cond_jump_promotion_widens() {
        let short = BranchEncoding::ShortCondJmpRel8 { cc: 0x4 };
        assert!(!short.fits(200));
        let near = short.promoted().unwrap();
        assert!(near.fits(200));
        assert_eq!(near.size(), 6);
    }
}
