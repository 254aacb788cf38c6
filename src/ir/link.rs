//! Cross-reference edges between control-flow instructions and their targets.
//!
//! Links are replaced, never mutated, whenever a control-flow instruction's
//! target changes (retargeting swaps in a new `Link`). They never hold raw
//! pointers into the instruction tree — only the stable ids from
//! [`crate::ir::function::FuncId`] / [`crate::ir::instruction::InstrId`].

use crate::ir::function::FuncId;
use crate::ir::instruction::InstrId;

/// Scope of a [`Link::Normal`] edge, mirroring the source's `Link::SCOPE_*`
/// constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkScope {
    /// Target is another instruction in the same function.
    InternalJump,
    /// Target is an instruction or function entry in a different function.
    ExternalJump,
    /// Target is a data location, not code.
    Data,
}

/// What a [`Link::Normal`] points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkTarget {
    /// A specific instruction within a function.
    Instruction(FuncId, InstrId),
    /// A function's entry point (its first instruction), used when only the
    /// function as a whole is the resolvable target (e.g. function
    /// reordering profiles).
    Function(FuncId),
}

/// Polymorphic relation from a control-flow operand to its target.
///
/// Variants mirror the source's `Link` subclasses. `Normal` is the only
/// variant the gadget-reduction passes retarget; `SymbolOnly`/`Data`/`Plt`
/// describe edges this module treats as opaque (PLT stubs, relocations to
/// data, symbol-only relocations resolved by the external linker).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Link {
    /// A resolved intra-module edge with a known target and byte-offset
    /// encoding (RIP-relative or absolute).
    Normal {
        target: LinkTarget,
        scope: LinkScope,
        rip_relative: bool,
    },
    /// An edge resolved only by symbol name (e.g. a PLT import whose target
    /// is external to this program).
    SymbolOnly { rip_relative: bool },
    /// A RIP-relative reference into a data section.
    Data { rip_relative: bool },
    /// A reference resolved through the Procedure Linkage Table.
    Plt { rip_relative: bool },
}

impl Link {
    /// Whether the underlying operand encodes a PC-relative displacement.
    pub fn is_rip_relative(&self) -> bool {
        match self {
            Link::Normal { rip_relative, .. }
            | Link::SymbolOnly { rip_relative }
            | Link::Data { rip_relative }
            | Link::Plt { rip_relative } => *rip_relative,
        }
    }

    /// The resolved target, if this link carries one.
    pub fn target(&self) -> Option<LinkTarget> {
        match self {
            Link::Normal { target, .. } => Some(*target),
            _ => None,
        }
    }

    /// The scope of a [`Link::Normal`] edge, if applicable.
    pub fn scope(&self) -> Option<LinkScope> {
        match self {
            Link::Normal { scope, .. } => Some(*scope),
            _ => None,
        }
    }
}
