//! C6: Offset-Sledding pass.
//!
//! Profile-guided: [`generate_profile`] scans every RIP-relative
//! control-flow instruction whose target is address-resolved and groups,
//! per function, every instruction whose displacement encoding contains an
//! unintended gadget. [`visit`] then picks exactly *one* candidate
//! instruction per function in the profile, recomputes its displacement and
//! required sled at application time, and inserts that many NOPs — before
//! the target instruction when the displacement is positive, before the
//! branch instruction itself when it's negative. One correction per
//! function per call keeps each iteration's size growth bounded, which is
//! what the convergence driver's failure budget accounting depends on.
//!
//! Grounded on `original_source/src/pass/offsetsledding.cpp`
//! (`containsUnintendedGadgets` is [`crate::oracle::gadget_sled`];
//! `generateProfile`/`visit`).

use rand::Rng;

use crate::ir::{FuncId, FunctionMutator, Instruction, InstrId, LinkTarget, Module};
use crate::oracle::gadget_sled;

/// The full C6 profile: for each function that has at least one
/// gadget-encoding branch, the list of candidate instructions [`visit`] may
/// pick from.
#[derive(Debug, Clone, Default)]
pub struct OffsetSleddingProfile {
    pub entries: Vec<(FuncId, Vec<InstrId>)>,
}

fn displacement(module: &Module, func: FuncId, instr: InstrId) -> Option<i64> {
    let function = module.function(func);
    let instr = function.instr(instr);
    let link = instr.semantic.link()?;
    let target = link.target()?;
    let next_addr = instr.next_address()?;
    let target_addr = module.resolve_address(target)?;
    Some(target_addr as i64 - next_addr as i64)
}

/// Scan `module` for unintended gadgets in resolved RIP-relative branch
/// displacements, grouped by the function each offending instruction lives
/// in. Instructions without an assigned address (no layout pass has run
/// yet) are skipped.
pub fn generate_profile(module: &Module) -> OffsetSleddingProfile {
    let mut entries: Vec<(FuncId, Vec<InstrId>)> = Vec::new();
    for (func_idx, function) in module.functions.iter().enumerate() {
        let func = FuncId(func_idx as u32);
        let mut candidates = Vec::new();
        for block in &function.blocks {
            for &id in &block.order {
                let instr = function.instr(id);
                if !instr.semantic.is_rip_relative_branch() {
                    continue;
                }
                let Some(d) = displacement(module, func, id) else {
                    continue;
                };
                if gadget_sled(d) > 0 {
                    candidates.push(id);
                }
            }
        }
        if !candidates.is_empty() {
            entries.push((func, candidates));
        }
    }
    OffsetSleddingProfile { entries }
}

/// Apply a previously generated profile. For each function entry, select a
/// random candidate, recompute its current sled requirement, and splice
/// `0x90` bytes before the target instruction (positive displacement) or
/// before the branch itself (negative displacement). Invalidates addresses
/// in the affected functions — callers must re-run layout afterward.
pub fn visit<R: Rng>(module: &mut Module, profile: &OffsetSleddingProfile, rng: &mut R) {
    for (func, candidates) in &profile.entries {
        if candidates.is_empty() {
            continue;
        }
        let instr_id = candidates[rng.gen_range(0..candidates.len())];

        let Some(d) = displacement(module, *func, instr_id) else {
            continue;
        };
        let sled = gadget_sled(d);
        if sled == 0 {
            continue;
        }

        if d > 0 {
            let Some(LinkTarget::Instruction(target_func, target_instr)) =
                module.function(*func).instr(instr_id).semantic.link().and_then(|l| l.target())
            else {
                continue;
            };
            splice_before(module, target_func, target_instr, sled);
        } else {
            splice_before(module, *func, instr_id, sled);
        }
    }
}

fn splice_before(module: &mut Module, func: FuncId, before: InstrId, count: u64) {
    let function = module.function_mut(func);
    let Some(block_id) = function.block_of(before) else {
        return;
    };
    let mut fm = FunctionMutator::new(function);
    let mut bm = fm.block(block_id);
    for _ in 0..count {
        bm.insert_before(before, Instruction::nop());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Block, BlockId, BranchEncoding, ControlFlowKind, Function, Link, LinkScope};
    use rand_pcg::Pcg32;

    fn seeded_rng() -> Pcg32 {
        Pcg32::new(0xcafef00dd15ea5e5, 0xa02bdbf7bb3c0a7)
    }

    /// A branch whose positive displacement encodes `0xc3` at byte 0 needs
    /// padding before its target.
    #[test]
    fn generates_profile_entry_for_unintended_gadget() {
        let mut module = Module::new("m");
        let mut f = Function::new("f");
        let target = f.alloc(Instruction::nop());
        let branch = f.alloc(Instruction::control_flow(
            BranchEncoding::NearJmpRel32.encode(0xc3),
            ControlFlowKind::Jump,
            Some(Link::Normal {
                target: LinkTarget::Instruction(FuncId(0), target),
                scope: LinkScope::InternalJump,
                rip_relative: true,
            }),
            BranchEncoding::NearJmpRel32,
        ));
        f.blocks.push(Block::new(vec![branch, target]));
        f.recompute_block_size(BlockId(0));
        f.recompute_size();
        f.instr_mut(branch).address = Some(0x1000);
        f.instr_mut(target).address = Some(0x1000 + 5 + 0xc3);
        f.base_address = Some(0x1000);
        module.push_function(f);

        let profile = generate_profile(&module);
        assert_eq!(profile.entries.len(), 1);
        assert_eq!(profile.entries[0].1, vec![branch]);
    }

    /// Positive-displacement correction splices NOPs before the target, not
    /// after the branch.
    #[test]
    fn visit_splices_before_target_for_positive_displacement() {
        let mut module = Module::new("m");
        let mut f = Function::new("f");
        let target = f.alloc(Instruction::nop());
        let branch = f.alloc(Instruction::control_flow(
            BranchEncoding::NearJmpRel32.encode(0xc3),
            ControlFlowKind::Jump,
            Some(Link::Normal {
                target: LinkTarget::Instruction(FuncId(0), target),
                scope: LinkScope::InternalJump,
                rip_relative: true,
            }),
            BranchEncoding::NearJmpRel32,
        ));
        f.blocks.push(Block::new(vec![branch, target]));
        f.recompute_block_size(BlockId(0));
        f.recompute_size();
        f.instr_mut(branch).address = Some(0x1000);
        f.instr_mut(target).address = Some(0x1000 + 5 + 0xc3);
        f.base_address = Some(0x1000);
        let func = module.push_function(f);

        let profile = OffsetSleddingProfile {
            entries: vec![(func, vec![branch])],
        };
        let mut rng = seeded_rng();
        visit(&mut module, &profile, &mut rng);

        let f = module.function(func);
        let order = &f.block(BlockId(0)).order;
        // branch, then the inserted NOP(s), then target: target is last.
        assert_eq!(*order.last().unwrap(), target);
        assert_eq!(order[0], branch);
        assert!(order.len() > 2);
    }

    /// No rip-relative branches means an empty profile.
    #[test]
    fn no_branches_yields_empty_profile() {
        let mut module = Module::new("m");
        let mut f = Function::new("f");
        let a = f.alloc(Instruction::plain(vec![0x90]));
        f.blocks.push(Block::new(vec![a]));
        module.push_function(f);

        let profile = generate_profile(&module);
        assert!(profile.entries.is_empty());
    }
}
