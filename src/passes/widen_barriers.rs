//! C4: Widen-Barriers pass.
//!
//! Scans every pair of contiguous instructions (within a block, and across
//! a block boundary into the next block) for the cross-instruction boundary
//! patterns the oracle's `is_boundary_gadget` recognizes, and inserts a
//! single-byte NOP between them to break the pattern. Grounded on
//! `original_source/src/pass/widenbarrier.cpp`.

use crate::ir::{BlockId, FuncId, FunctionMutator, Instruction, InstrId, Module};
use crate::oracle::is_boundary_gadget;

#[derive(Debug, Default, Clone, Copy)]
pub struct WidenBarriersStats {
    pub functions_mutated: usize,
    pub barriers_widened: usize,
}

/// Run C4 over every function of `module`.
pub fn run(module: &mut Module) -> WidenBarriersStats {
    let mut stats = WidenBarriersStats::default();
    let func_ids: Vec<FuncId> = (0..module.functions.len() as u32).map(FuncId).collect();
    for func in func_ids {
        let widened = run_function(module, func);
        if widened > 0 {
            stats.functions_mutated += 1;
            stats.barriers_widened += widened;
        }
    }
    stats
}

/// A contiguous-instruction boundary needing a NOP inserted after `after`,
/// within `block`.
struct Boundary {
    block: BlockId,
    after: InstrId,
}

/// Run C4 on a single function. Returns the number of boundaries widened.
/// Runs to a local fixed point: inserting a NOP can create a new adjacent
/// boundary only if the inserted `0x90` itself matched a pattern, which it
/// never does (`0x90` is not a first byte of any table entry), so one scan
/// over the pre-mutation layout suffices.
pub fn run_function(module: &mut Module, func: FuncId) -> usize {
    let function = module.function(func);
    let mut boundaries: Vec<Boundary> = Vec::new();

    for block_id in function.block_ids() {
        let block = function.block(block_id);
        for pair in block.order.windows(2) {
            let (a, b) = (pair[0], pair[1]);
            if boundary_needs_nop(function, a, b) {
                boundaries.push(Boundary { block: block_id, after: a });
            }
        }
        if let (Some(last), Some(next_block)) = (block.last(), function.next_block(block_id)) {
            if let Some(first) = function.block(next_block).entry() {
                if boundary_needs_nop(function, last, first) {
                    boundaries.push(Boundary { block: block_id, after: last });
                }
            }
        }
    }

    let count = boundaries.len();
    if count == 0 {
        return 0;
    }

    let function = module.function_mut(func);
    let mut fm = FunctionMutator::new(function);
    for boundary in boundaries {
        let mut bm = fm.block(boundary.block);
        bm.insert_after(boundary.after, Instruction::nop());
    }
    count
}

fn boundary_needs_nop(
    function: &crate::ir::Function,
    a: InstrId,
    b: InstrId,
) -> bool {
    let last = *function.instr(a).bytes.last().expect("instruction has at least one byte");
    let first = function.instr(b).bytes[0];
    is_boundary_gadget(last, first)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Block, Function};

    /// S1: two instructions whose boundary encodes `ff e0` (jmp rax) get a
    /// NOP spliced between them.
    #[test]
    fn boundary_gadget_gets_nop_inserted() {
        let mut module = Module::new("m");
        let mut f = Function::new("f");
        let a = f.alloc(Instruction::plain(vec![0x48, 0xff]));
        let b = f.alloc(Instruction::plain(vec![0xe0, 0x90]));
        f.blocks.push(Block::new(vec![a, b]));
        f.recompute_block_size(BlockId(0));
        f.recompute_size();
        let id = module.push_function(f);

        assert_eq!(run_function(&mut module, id), 1);
        let f = module.function(id);
        let order = &f.block(BlockId(0)).order;
        assert_eq!(order.len(), 3);
        assert_eq!(f.instr(order[1]).bytes, vec![0x90]);
    }

    /// Boundary across a block edge is also caught.
    #[test]
    fn boundary_across_blocks_gets_nop_inserted() {
        let mut module = Module::new("m");
        let mut f = Function::new("f");
        let a = f.alloc(Instruction::plain(vec![0x0f]));
        let b = f.alloc(Instruction::plain(vec![0x05]));
        f.blocks.push(Block::new(vec![a]));
        f.blocks.push(Block::new(vec![b]));
        for id in f.block_ids() {
            f.recompute_block_size(id);
        }
        f.recompute_size();
        let id = module.push_function(f);

        assert_eq!(run_function(&mut module, id), 1);
        let f = module.function(id);
        assert_eq!(f.block(BlockId(0)).order.len(), 2);
    }

    /// A harmless boundary is left untouched.
    #[test]
    fn harmless_boundary_is_noop() {
        let mut module = Module::new("m");
        let mut f = Function::new("f");
        let a = f.alloc(Instruction::plain(vec![0x48, 0x89]));
        let b = f.alloc(Instruction::plain(vec![0xc0]));
        f.blocks.push(Block::new(vec![a, b]));
        f.recompute_block_size(BlockId(0));
        f.recompute_size();
        let id = module.push_function(f);

        assert_eq!(run_function(&mut module, id), 0);
        assert_eq!(module.function(id).block(BlockId(0)).order.len(), 2);
    }
}
