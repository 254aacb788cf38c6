//! C2: Merge-Return pass.
//!
//! Collapses every function's `ret` instructions to a single canonical
//! `ret`; the others become internal direct jumps to it. Idempotent: a
//! function with <= 1 ret is left untouched. Grounded on
//! `original_source/src/pass/mergereturn.cpp`.

use crate::ir::{
    BranchEncoding, ControlFlowKind, FuncId, FunctionMutator, Instruction, InstrId, Link,
    LinkScope, LinkTarget, Module, Semantic,
};

/// Per-function statistics the pass returns to its caller instead of
/// tracking module-global state (spec §9, "Per-pass stats").
#[derive(Debug, Default, Clone, Copy)]
pub struct MergeReturnStats {
    pub functions_mutated: usize,
    pub returns_merged: usize,
}

/// Run C2 over every function of `module`.
pub fn run(module: &mut Module) -> MergeReturnStats {
    let mut stats = MergeReturnStats::default();
    let func_ids: Vec<FuncId> = (0..module.functions.len() as u32).map(FuncId).collect();
    for func in func_ids {
        let merged = run_function(module, func);
        if merged > 0 {
            stats.functions_mutated += 1;
            stats.returns_merged += merged;
        }
    }
    stats
}

/// Run C2 on a single function. Returns the number of returns merged away
/// (0 if the function had at most one `ret` and was left untouched).
pub fn run_function(module: &mut Module, func: FuncId) -> usize {
    let function = module.function(func);
    let mut rets: Vec<InstrId> = Vec::new();
    for block in &function.blocks {
        for &id in &block.order {
            if function.instr(id).semantic.is_ret() {
                rets.push(id);
            }
        }
    }

    if rets.len() <= 1 {
        return 0;
    }

    let canonical = rets[0];
    let function = module.function_mut(func);
    let mut fm = FunctionMutator::new(function);
    for &ret_id in &rets[1..] {
        let block_id = fm
            .function()
            .block_of(ret_id)
            .expect("ret instruction must belong to a block");
        let mut bm = fm.block(block_id);
        bm.replace(
            ret_id,
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
    }
    rets.len() - 1
}
