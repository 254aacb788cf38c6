//! In-memory intermediate representation: modules, functions, basic blocks,
//! and instructions with explicit inter-instruction links.
//!
//! Ownership is tree-shaped (`Program -> Module -> Function -> {Block,
//! Instruction arena}`); cross-references (`Link`) use the stable ids
//! defined here rather than raw pointers into the tree (spec §9).

pub mod block;
pub mod function;
pub mod instruction;
pub mod link;
pub mod mutator;
pub mod program;

pub use block::{Block, BlockId};
pub use function::{FuncId, Function, FunctionOrder};
pub use instruction::{BranchEncoding, ControlFlowKind, Instruction, InstrId, Register, Semantic};
pub use link::{Link, LinkScope, LinkTarget};
pub use mutator::{BlockMutator, FunctionMutator};
pub use program::{DataRegion, Module, Program};
