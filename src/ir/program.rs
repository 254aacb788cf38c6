//! Program and Module: the top two levels of the IR tree.

use crate::ir::function::{FuncId, Function, FunctionOrder};
use crate::ir::instruction::InstrId;
use crate::ir::link::LinkTarget;

/// A named region of non-code (read-only or writable) data. Addresses are
/// opaque to the gadget-reduction passes; kept only so the generator has
/// somewhere to anchor `Link::Data` targets.
#[derive(Debug, Clone)]
pub struct DataRegion {
    pub name: String,
    pub address: u64,
    pub size: u64,
}

/// A module: an ordered function list plus data-region metadata.
///
/// Links between control-flow instructions are scoped to a single module in
/// this implementation (cross-module/PLT edges are represented as
/// `Link::Plt`/`Link::SymbolOnly`, never `Link::Normal`) — see DESIGN.md.
#[derive(Debug, Clone)]
pub struct Module {
    pub name: String,
    pub functions: Vec<Function>,
    pub function_order: FunctionOrder,
    pub data_regions: Vec<DataRegion>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Module {
            name: name.into(),
            functions: Vec::new(),
            function_order: Vec::new(),
            data_regions: Vec::new(),
        }
    }

    /// Append a function, returning its stable id, and place it at the end
    /// of the current function order.
    pub fn push_function(&mut self, function: Function) -> FuncId {
        let id = FuncId(self.functions.len() as u32);
        self.functions.push(function);
        self.function_order.push(id);
        id
    }

    pub fn function(&self, id: FuncId) -> &Function {
        &self.functions[id.0 as usize]
    }

    pub fn function_mut(&mut self, id: FuncId) -> &mut Function {
        &mut self.functions[id.0 as usize]
    }

    /// Resolve a link target to its currently assigned address. `None` if
    /// the target (or any ancestor on the path to it) has no address yet —
    /// i.e. a layout pass has not run since the last structural mutation.
    pub fn resolve_address(&self, target: LinkTarget) -> Option<u64> {
        match target {
            LinkTarget::Function(f) => self.function(f).base_address,
            LinkTarget::Instruction(f, i) => self.function(f).instr(i).address,
        }
    }

    /// Clear every address in this module, modeling the "addresses invalid
    /// after structural mutation" invariant for module-scoped passes (C7).
    pub fn invalidate_addresses_of_module(&mut self) {
        for f in &mut self.functions {
            f.base_address = None;
            for i in &mut f.instrs {
                i.address = None;
            }
        }
    }

    /// Validate the "every function appears exactly once" invariant on
    /// `function_order` (spec P8). Used by tests and by C7's postcondition
    /// check.
    pub fn function_order_is_permutation(&self) -> bool {
        let mut seen: Vec<bool> = vec![false; self.functions.len()];
        if self.function_order.len() != self.functions.len() {
            return false;
        }
        for &id in &self.function_order {
            let idx = id.0 as usize;
            if idx >= seen.len() || seen[idx] {
                return false;
            }
            seen[idx] = true;
        }
        seen.into_iter().all(|b| b)
    }
}

/// The whole program: a collection of modules.
#[derive(Debug, Clone, Default)]
pub struct Program {
    pub modules: Vec<Module>,
}

impl Program {
    pub fn new() -> Self {
        Program { modules: Vec::new() }
    }

    pub fn push_module(&mut self, module: Module) -> usize {
        self.modules.push(module);
        self.modules.len() - 1
    }

    /// Total number of functions across all modules.
    pub fn function_count(&self) -> usize {
        self.modules.iter().map(|m| m.functions.len()).sum()
    }

    /// All instruction addresses are cleared whenever a structural mutation
    /// happens (spec §5: "Address fields become invalid upon any structural
    /// mutation"). Passes achieve this implicitly by never re-setting
    /// `address` on replace/insert; this helper lets a driver assert it.
    pub fn all_addresses_assigned(&self) -> bool {
        self.modules.iter().all(|m| {
            m.functions.iter().all(|f| {
                f.base_address.is_some()
                    && f.instrs.iter().all(|i| i.address.is_some())
            })
        })
    }

    /// Clear every address in the program, modeling the "addresses invalid
    /// after structural mutation" invariant explicitly.
    pub fn invalidate_addresses(&mut self) {
        for m in &mut self.modules {
            for f in &mut m.functions {
                f.base_address = None;
                for i in &mut f.instrs {
                    i.address = None;
                }
            }
        }
    }
}

/// Helper to look up an instruction id's owning `(FuncId, InstrId)` pair's
/// raw instruction across a whole program (used by reporting/tests only —
/// passes always carry `(FuncId, InstrId)` pairs directly).
pub fn instr_bytes<'p>(program: &'p Program, module: usize, func: FuncId, instr: InstrId) -> &'p [u8] {
    &program.modules[module].function(func).instr(instr).bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::block::{Block, BlockId};
    use crate::ir::function::Function;
    use crate::ir::instruction::Instruction;

    #[test]
    fn function_order_permutation_invariant() {
        let mut m = Module::new("m");
        m.push_function(Function::new("a"));
        m.push_function(Function::new("b"));
        assert!(m.function_order_is_permutation());

        m.function_order.swap(0, 1);
        assert!(m.function_order_is_permutation());

        m.function_order.pop();
        assert!(!m.function_order_is_permutation());
    }

    #[test]
    fn resolve_address_none_until_assigned() {
        let mut m = Module::new("m");
        let f = m.push_function(Function::new("a"));
        let i = m.function_mut(f).alloc(Instruction::nop());
        m.function_mut(f).blocks.push(Block::new(vec![i]));
        assert_eq!(m.resolve_address(LinkTarget::Instruction(f, i)), None);

        m.function_mut(f).base_address = Some(0x1000);
        m.function_mut(f).instr_mut(i).address = Some(0x1000);
        assert_eq!(m.resolve_address(LinkTarget::Instruction(f, i)), Some(0x1000));
    }
}
