//! C5: Sanitize-Volatiles pass.
//!
//! Immediately before every `ret` and indirect jump, clears the
//! caller-saved scratch registers with `xor reg, reg` so a hijacked
//! control transfer cannot reuse stale register contents as gadget
//! arguments. Grounded on
//! `original_source/src/pass/sanitizevolatileregisters.cpp`.
//!
//! Soundness caveat (carried over from the source, not silently fixed):
//! this only clears registers the *compiler* left live across the return:
//! a register still holding the function's return value (conventionally
//! `rax`) is deliberately excluded, so a gadget that only needs `rax` is
//! unaffected. See DESIGN.md.

use crate::ir::{FuncId, FunctionMutator, Instruction, Module, Register};

/// Caller-saved scratch registers sanitized before every exit point.
/// `Rax` is excluded: it carries the return value out of the function.
/// Five registers at 3 bytes each (`xor reg64, reg64`) gives the 15-byte
/// size delta per ret this pass contributes to layout.
const VOLATILE_REGS: [Register; 5] = [
    Register::Rcx,
    Register::R8,
    Register::R9,
    Register::R10,
    Register::R11,
];

fn register_ordinal(reg: Register) -> u8 {
    match reg {
        Register::Rax => 0,
        Register::Rcx => 1,
        Register::Rdx => 2,
        Register::Rbx => 3,
        Register::Rsp => 4,
        Register::Rbp => 5,
        Register::Rsi => 6,
        Register::Rdi => 7,
        Register::R8 => 8,
        Register::R9 => 9,
        Register::R10 => 10,
        Register::R11 => 11,
        Register::R12 => 12,
        Register::R13 => 13,
        Register::R14 => 14,
        Register::R15 => 15,
    }
}

/// Encode `xor reg64, reg64` (zeroes `reg` without touching flags beyond
/// the usual `xor` side effects).
fn xor_self_bytes(reg: Register) -> Vec<u8> {
    let ord = register_ordinal(reg);
    let low = ord & 0x7;
    let ext = if ord >= 8 { 1 } else { 0 };
    let rex = 0x48 | (ext << 2) | ext; // REX.W + REX.R + REX.B (same register twice)
    let modrm = 0xc0 | (low << 3) | low;
    vec![rex, 0x31, modrm]
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SanitizeVolatilesStats {
    pub functions_mutated: usize,
    pub exit_points_sanitized: usize,
}

/// Run C5 over every function of `module`.
pub fn run(module: &mut Module) -> SanitizeVolatilesStats {
    let mut stats = SanitizeVolatilesStats::default();
    let func_ids: Vec<FuncId> = (0..module.functions.len() as u32).map(FuncId).collect();
    for func in func_ids {
        let sanitized = run_function(module, func);
        if sanitized > 0 {
            stats.functions_mutated += 1;
            stats.exit_points_sanitized += sanitized;
        }
    }
    stats
}

/// Run C5 on a single function. Returns the number of exit points
/// (ret/indirect-jump instructions) that received sanitizing code.
pub fn run_function(module: &mut Module, func: FuncId) -> usize {
    let function = module.function(func);
    let mut exit_points = Vec::new();
    for block in &function.blocks {
        for &id in &block.order {
            let semantic = &function.instr(id).semantic;
            if semantic.is_ret() || semantic.is_indirect_jump() {
                exit_points.push(id);
            }
        }
    }

    if exit_points.is_empty() {
        return 0;
    }

    let function = module.function_mut(func);
    let mut fm = FunctionMutator::new(function);
    for &exit in &exit_points {
        let block_id = fm
            .function()
            .block_of(exit)
            .expect("exit instruction must belong to a block");
        let mut bm = fm.block(block_id);
        let mut cursor = exit;
        for &reg in VOLATILE_REGS.iter().rev() {
            cursor = bm.insert_before(cursor, Instruction::literal(xor_self_bytes(reg)));
        }
        let _ = cursor;
    }
    exit_points.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Block, BlockId, ControlFlowKind};

    fn ret_instr() -> Instruction {
        Instruction::control_flow(
            vec![0xc3],
            ControlFlowKind::Ret,
            None,
            crate::ir::BranchEncoding::NotEncoded,
        )
    }

    #[test]
    fn xor_rax_is_not_emitted_for_rax() {
        // rax is excluded; 0x48 0x31 0xc0 would be xor rax,rax.
        for &reg in VOLATILE_REGS.iter() {
            assert_ne!(xor_self_bytes(reg), vec![0x48, 0x31, 0xc0]);
        }
    }

    #[test]
    fn xor_r11_uses_rex_rb() {
        assert_eq!(xor_self_bytes(Register::R11), vec![0x4d, 0x31, 0xdb]);
    }

    /// S1: a single ret gets 8 sanitizing instructions inserted before it,
    /// in front of, not after.
    #[test]
    fn ret_gets_sanitized_before() {
        let mut module = Module::new("m");
        let mut f = crate::ir::Function::new("f");
        let r = f.alloc(ret_instr());
        f.blocks.push(Block::new(vec![r]));
        f.recompute_block_size(BlockId(0));
        f.recompute_size();
        let id = module.push_function(f);

        assert_eq!(run_function(&mut module, id), 1);
        let f = module.function(id);
        let order = &f.block(BlockId(0)).order;
        assert_eq!(order.len(), 1 + VOLATILE_REGS.len());
        assert_eq!(*order.last().unwrap(), r);
        for &sanitizer in &order[..VOLATILE_REGS.len()] {
            assert!(matches!(f.instr(sanitizer).semantic, crate::ir::Semantic::Literal));
        }
    }

    /// Not idempotent: running twice doubles sanitizers, since this pass
    /// performs no dedup check. The convergence driver invokes it exactly
    /// once, before the per-iteration loop starts, to avoid this.
    #[test]
    fn function_with_no_exit_points_is_noop() {
        let mut module = Module::new("m");
        let mut f = crate::ir::Function::new("f");
        let p = f.alloc(Instruction::plain(vec![0x90]));
        f.blocks.push(Block::new(vec![p]));
        f.recompute_block_size(BlockId(0));
        f.recompute_size();
        let id = module.push_function(f);

        assert_eq!(run_function(&mut module, id), 0);
    }
}
