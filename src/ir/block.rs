//! Basic blocks: ordered runs of instructions with one entry, at most one
//! terminator.

use crate::ir::instruction::InstrId;

/// Position of a block within its function's `blocks` vector. Blocks are
/// never inserted or removed by the gadget-reduction passes, so a plain
/// index is stable for their entire lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

/// An ordered sequence of instruction ids plus the cached byte size
/// invariant: `size == sum of instruction sizes`. Recomputed by
/// [`crate::ir::mutator::BlockMutator`] on scope exit.
#[derive(Debug, Clone, Default)]
pub struct Block {
    pub order: Vec<InstrId>,
    pub size: usize,
}

impl Block {
    pub fn new(order: Vec<InstrId>) -> Self {
        Block { order, size: 0 }
    }

    /// The block's first instruction id (its entry), if non-empty.
    pub fn entry(&self) -> Option<InstrId> {
        self.order.first().copied()
    }

    /// The block's last instruction id (its potential terminator), if
    /// non-empty.
    pub fn last(&self) -> Option<InstrId> {
        self.order.last().copied()
    }

    /// Position of `id` within this block's order, if present.
    pub fn position_of(&self, id: InstrId) -> Option<usize> {
        self.order.iter().position(|&i| i == id)
    }
}
