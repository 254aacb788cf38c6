//! Scoped-acquisition mutators (spec §5).
//!
//! A `BlockMutator` scope tracks structural edits and, on drop, recomputes
//! its block's size and propagates to the containing function. A
//! `FunctionMutator` recomputes the function's size on drop. No other pass
//! is active while a mutator scope is open — the scopes simply exist to
//! keep the size invariants from drifting after a splice.

use crate::ir::block::BlockId;
use crate::ir::function::Function;
use crate::ir::instruction::{Instruction, InstrId};

/// Scope that recomputes `Function::size` when dropped.
pub struct FunctionMutator<'a> {
    function: &'a mut Function,
}

impl<'a> FunctionMutator<'a> {
    pub fn new(function: &'a mut Function) -> Self {
        FunctionMutator { function }
    }

    /// Open a block-scoped mutator reborrowing this function.
    pub fn block(&mut self, block: BlockId) -> BlockMutator<'_> {
        BlockMutator {
            function: self.function,
            block,
        }
    }

    pub fn function(&self) -> &Function {
        self.function
    }
}

impl Drop for FunctionMutator<'_> {
    fn drop(&mut self) {
        self.function.recompute_size();
    }
}

/// Scope that recomputes the enclosing block's (and, on its own drop,
/// transitively the function's) size when dropped.
pub struct BlockMutator<'a> {
    function: &'a mut Function,
    block: BlockId,
}

impl<'a> BlockMutator<'a> {
    pub fn new(function: &'a mut Function, block: BlockId) -> Self {
        BlockMutator { function, block }
    }

    /// The entry instruction of this mutator's block, if non-empty.
    pub fn entry(&self) -> Option<InstrId> {
        self.function.block(self.block).entry()
    }

    /// Insert `instr` immediately after `after` in this block's order.
    /// Returns the new instruction's id.
    pub fn insert_after(&mut self, after: InstrId, instr: Instruction) -> InstrId {
        let id = self.function.alloc(instr);
        let block = self.function.block_mut(self.block);
        let pos = block
            .position_of(after)
            .expect("insert_after: instruction not in this block");
        block.order.insert(pos + 1, id);
        id
    }

    /// Insert `instr` immediately before `before` in this block's order.
    pub fn insert_before(&mut self, before: InstrId, instr: Instruction) -> InstrId {
        let id = self.function.alloc(instr);
        let block = self.function.block_mut(self.block);
        let pos = block
            .position_of(before)
            .expect("insert_before: instruction not in this block");
        block.order.insert(pos, id);
        id
    }

    /// Replace `id`'s bytes and semantic in place (identity preserved).
    pub fn replace(&mut self, id: InstrId, bytes: Vec<u8>, semantic: crate::ir::instruction::Semantic) {
        let instr = self.function.instr_mut(id);
        instr.bytes = bytes;
        instr.semantic = semantic;
        instr.address = None;
    }
}

impl Drop for BlockMutator<'_> {
    fn drop(&mut self) {
        self.function.recompute_block_size(self.block);
        self.function.recompute_size();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::block::Block;
    use crate::ir::function::Function;

    #[test]
    fn insert_after_updates_sizes_on_drop() {
        let mut f = Function::new("f");
        let a = f.alloc(Instruction::plain(vec![0x90]));
        f.blocks.push(Block::new(vec![a]));
        f.recompute_block_size(BlockId(0));
        f.recompute_size();
        assert_eq!(f.size, 1);

        {
            let mut fm = FunctionMutator::new(&mut f);
            let mut bm = fm.block(BlockId(0));
            bm.insert_after(a, Instruction::nop());
        }

        assert_eq!(f.block(BlockId(0)).order.len(), 2);
        assert_eq!(f.block(BlockId(0)).size, 2);
        assert_eq!(f.size, 2);
    }
}
