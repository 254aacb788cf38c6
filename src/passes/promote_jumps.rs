//! PromoteJumps: a layout-correctness fixup, not a gadget-reduction
//! technique by itself.
//!
//! `original_source` has no standalone file for this — the reference
//! implementation folds the equivalent fixup into its generator's address
//! assignment loop. Implemented as its own pass here so `layout::layout`
//! can call it every fixed-point iteration: whenever address assignment
//! (or a preceding gadget-reduction pass growing an instruction) pushes a
//! short conditional jump's displacement out of the `i8` range its 2-byte
//! encoding can hold, widen it to the 6-byte near form.

use crate::ir::{FuncId, FunctionMutator, InstrId, Module, Semantic};

#[derive(Debug, Default, Clone, Copy)]
pub struct PromoteJumpsStats {
    pub jumps_promoted: usize,
}

/// Scan every function for `ShortCondJmpRel8` branches whose recorded
/// displacement (computed from currently assigned addresses) no longer
/// fits an `i8`, and widen them to `NearCondJmpRel32`. Addresses must be
/// assigned before calling this — unassigned branches are skipped, since
/// there is no displacement yet to check.
pub fn run(module: &mut Module) -> PromoteJumpsStats {
    let mut stats = PromoteJumpsStats::default();
    let func_ids: Vec<FuncId> = (0..module.functions.len() as u32).map(FuncId).collect();
    for func in func_ids {
        stats.jumps_promoted += run_function(module, func);
    }
    stats
}

fn run_function(module: &mut Module, func: FuncId) -> usize {
    let function = module.function(func);
    let mut to_promote: Vec<InstrId> = Vec::new();
    for block in &function.blocks {
        for &id in &block.order {
            let instr = function.instr(id);
            let Semantic::ControlFlow { encoding, link, .. } = &instr.semantic else {
                continue;
            };
            if !matches!(encoding, crate::ir::BranchEncoding::ShortCondJmpRel8 { .. }) {
                continue;
            }
            let Some(link) = link else { continue };
            let Some(target) = link.target() else { continue };
            let (Some(next_addr), Some(target_addr)) =
                (instr.next_address(), module.resolve_address(target))
            else {
                continue;
            };
            let displacement = target_addr as i64 - next_addr as i64;
            if !encoding.fits(displacement) {
                to_promote.push(id);
            }
        }
    }

    if to_promote.is_empty() {
        return 0;
    }

    let function = module.function_mut(func);
    let mut fm = FunctionMutator::new(function);
    for id in &to_promote {
        let block_id = fm
            .function()
            .block_of(*id)
            .expect("branch must belong to a block");
        let instr = fm.function().instr(*id).clone();
        let Semantic::ControlFlow { kind, link, encoding } = instr.semantic else {
            unreachable!("filtered to ControlFlow above")
        };
        let promoted = encoding
            .promoted()
            .expect("filtered to ShortCondJmpRel8 above, which always has a promoted form");
        let mut bm = fm.block(block_id);
        bm.replace(
            *id,
            promoted.encode(0),
            Semantic::ControlFlow {
                kind,
                link,
                encoding: promoted,
            },
        );
    }
    to_promote.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Block, BlockId, BranchEncoding, ControlFlowKind, Function, Instruction, Link, LinkScope, LinkTarget};

    #[test]
    fn out_of_range_short_jump_gets_promoted() {
        let mut module = Module::new("m");
        let mut f = Function::new("f");
        let target = f.alloc(Instruction::nop());
        let branch = f.alloc(Instruction::control_flow(
            BranchEncoding::ShortCondJmpRel8 { cc: 0x4 }.encode(0),
            ControlFlowKind::CondJump,
            Some(Link::Normal {
                target: LinkTarget::Instruction(FuncId(0), target),
                scope: LinkScope::InternalJump,
                rip_relative: true,
            }),
            BranchEncoding::ShortCondJmpRel8 { cc: 0x4 },
        ));
        f.blocks.push(Block::new(vec![branch, target]));
        f.recompute_block_size(BlockId(0));
        f.recompute_size();
        f.instr_mut(branch).address = Some(0);
        f.instr_mut(target).address = Some(1000);
        module.push_function(f);

        let stats = run(&mut module);
        assert_eq!(stats.jumps_promoted, 1);
        let f = module.function(FuncId(0));
        match &f.instr(branch).semantic {
            Semantic::ControlFlow { encoding, .. } => {
                assert!(matches!(encoding, BranchEncoding::NearCondJmpRel32 { cc: 0x4 }));
            }
            other => panic!("expected control flow, got {other:?}"),
        }
        assert_eq!(f.instr(branch).bytes.len(), 6);
    }

    #[test]
    fn in_range_short_jump_is_untouched() {
        let mut module = Module::new("m");
        let mut f = Function::new("f");
        let target = f.alloc(Instruction::nop());
        let branch = f.alloc(Instruction::control_flow(
            BranchEncoding::ShortCondJmpRel8 { cc: 0x4 }.encode(10),
            ControlFlowKind::CondJump,
            Some(Link::Normal {
                target: LinkTarget::Instruction(FuncId(0), target),
                scope: LinkScope::InternalJump,
                rip_relative: true,
            }),
            BranchEncoding::ShortCondJmpRel8 { cc: 0x4 },
        ));
        f.blocks.push(Block::new(vec![branch, target]));
        f.instr_mut(branch).address = Some(0);
        f.instr_mut(target).address = Some(12);
        module.push_function(f);

        let stats = run(&mut module);
        assert_eq!(stats.jumps_promoted, 0);
    }
}
