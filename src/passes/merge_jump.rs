//! C3: Merge-Jump pass.
//!
//! Groups indirect jumps by target register; within each group, collapses
//! all but one canonical indirect jump into direct jumps to it. Grounded on
//! `original_source/src/pass/mergejump.cpp`.

use std::collections::HashMap;

use crate::ir::{
    BranchEncoding, ControlFlowKind, FuncId, FunctionMutator, InstrId, Link, LinkScope,
    LinkTarget, Module, Register, Semantic,
};

#[derive(Debug, Default, Clone, Copy)]
pub struct MergeJumpStats {
    pub functions_mutated: usize,
    pub jumps_merged: usize,
}

/// Run C3 over every function of `module`.
pub fn run(module: &mut Module) -> MergeJumpStats {
    let mut stats = MergeJumpStats::default();
    let func_ids: Vec<FuncId> = (0..module.functions.len() as u32).map(FuncId).collect();
    for func in func_ids {
        let merged = run_function(module, func);
        if merged > 0 {
            stats.functions_mutated += 1;
            stats.jumps_merged += merged;
        }
    }
    stats
}

/// Run C3 on a single function. Returns the number of indirect jumps merged
/// away. A function with no register group larger than one is untouched.
pub fn run_function(module: &mut Module, func: FuncId) -> usize {
    let function = module.function(func);
    let mut by_reg: HashMap<Register, Vec<InstrId>> = HashMap::new();
    for block in &function.blocks {
        for &id in &block.order {
            let instr = function.instr(id);
            if instr.semantic.is_indirect_jump() {
                if let Some(reg) = instr.indirect_target_reg {
                    by_reg.entry(reg).or_default().push(id);
                }
            }
        }
    }

    let mut merged = 0;
    let function = module.function_mut(func);
    let mut fm = FunctionMutator::new(function);
    for (_reg, group) in by_reg {
        if group.len() <= 1 {
            continue;
        }
        let canonical = group[0];
        for &dup in &group[1..] {
            let block_id = fm
                .function()
                .block_of(dup)
                .expect("indirect jump must belong to a block");
            let mut bm = fm.block(block_id);
            bm.replace(
                dup,
                BranchEncoding::NearJmpRel32.encode(0),
                Semantic::ControlFlow {
                    kind: ControlFlowKind::Jump,
                    link: Some(Link::Normal {
                        target: LinkTarget::Instruction(func, canonical),
                        scope: LinkScope::InternalJump,
                        rip_relative: true,
                    }),
                    encoding: BranchEncoding::NearJmpRel32,
                },
            );
            merged += 1;
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Block, Function, Instruction};

    fn ijmp(reg: Register) -> Instruction {
        Instruction::indirect_jump(vec![0xff, 0xe0], reg)
    }

    /// S1: a single indirect jump per register is left untouched.
    #[test]
    fn single_jump_per_register_is_noop() {
        let mut module = Module::new("m");
        let mut f = Function::new("f");
        let a = f.alloc(ijmp(Register::Rax));
        let b = f.alloc(ijmp(Register::Rbx));
        f.blocks.push(Block::new(vec![a]));
        f.blocks.push(Block::new(vec![b]));
        for id in f.block_ids() {
            f.recompute_block_size(id);
        }
        f.recompute_size();
        let id = module.push_function(f);

        assert_eq!(run_function(&mut module, id), 0);
    }

    /// S2: three indirect jumps through `rax` collapse to one, the other two
    /// become internal direct jumps.
    #[test]
    fn three_rax_jumps_collapse_to_one() {
        let mut module = Module::new("m");
        let mut f = Function::new("f");
        let j0 = f.alloc(ijmp(Register::Rax));
        let j1 = f.alloc(ijmp(Register::Rax));
        let j2 = f.alloc(ijmp(Register::Rax));
        f.blocks.push(Block::new(vec![j0]));
        f.blocks.push(Block::new(vec![j1]));
        f.blocks.push(Block::new(vec![j2]));
        for id in f.block_ids() {
            f.recompute_block_size(id);
        }
        f.recompute_size();
        let id = module.push_function(f);

        assert_eq!(run_function(&mut module, id), 2);

        let f = module.function(id);
        let remaining_indirect = f
            .instrs
            .iter()
            .filter(|i| i.semantic.is_indirect_jump())
            .count();
        assert_eq!(remaining_indirect, 1);
        assert!(f.instr(j0).semantic.is_indirect_jump());

        for rewritten in [j1, j2] {
            let instr = f.instr(rewritten);
            assert_eq!(instr.bytes[0], 0xe9);
            match &instr.semantic {
                Semantic::ControlFlow {
                    link: Some(Link::Normal { target, .. }),
                    ..
                } => assert_eq!(*target, LinkTarget::Instruction(id, j0)),
                other => panic!("expected rewritten jump, got {other:?}"),
            }
        }
    }

    /// Jumps through different registers never merge with each other.
    #[test]
    fn distinct_registers_do_not_merge() {
        let mut module = Module::new("m");
        let mut f = Function::new("f");
        let j0 = f.alloc(ijmp(Register::Rax));
        let j1 = f.alloc(ijmp(Register::Rbx));
        f.blocks.push(Block::new(vec![j0]));
        f.blocks.push(Block::new(vec![j1]));
        for id in f.block_ids() {
            f.recompute_block_size(id);
        }
        f.recompute_size();
        let id = module.push_function(f);

        assert_eq!(run_function(&mut module, id), 0);
        let f = module.function(id);
        assert!(f.instr(j0).semantic.is_indirect_jump());
        assert!(f.instr(j1).semantic.is_indirect_jump());
    }
}
