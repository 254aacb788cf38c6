//! C7: Function-Reordering pass.
//!
//! Profile-guided, targeted, and incremental: [`generate_profile`] scans
//! every cross-function RIP-relative call whose displacement needs a sled
//! longer than 2 bytes and groups, per source function, the `(target
//! function, required sled)` pairs that justify moving something. [`visit`]
//! picks one profile entry, chooses to move either the source function or
//! one specific target, and walks it one adjacent swap at a time in a
//! random direction — subtracting the displaced neighbor's size each step —
//! until the required shift is satisfied or a module boundary is hit. Only
//! that one function moves per call, which is what keeps a single
//! invocation from churning every cross-function displacement in the
//! module at once. Grounded on
//! `original_source/src/pass/functionreordering.cpp`.

use rand::Rng;

use crate::ir::{FuncId, LinkTarget, Module};
use crate::oracle::gadget_sled;

/// Long-sled threshold below which a cross-function call isn't worth
/// reordering over (`original_source/src/pass/functionreordering.cpp`'s
/// `sled > 2` gate).
const MIN_SLED_FOR_REORDER: u64 = 2;

/// The C7 profile: for each source function with at least one long-sled
/// cross-function call, the `(target function, required sled)` pairs found.
#[derive(Debug, Clone, Default)]
pub struct FunctionReorderingProfile {
    pub entries: Vec<(FuncId, Vec<(FuncId, u64)>)>,
}

/// Scan `module` for cross-function RIP-relative branches whose
/// displacement needs a sled longer than [`MIN_SLED_FOR_REORDER`], grouped
/// by the calling function.
pub fn generate_profile(module: &Module) -> FunctionReorderingProfile {
    let mut entries: Vec<(FuncId, Vec<(FuncId, u64)>)> = Vec::new();
    for (func_idx, function) in module.functions.iter().enumerate() {
        let func = FuncId(func_idx as u32);
        let mut targets = Vec::new();
        for block in &function.blocks {
            for &id in &block.order {
                let instr = function.instr(id);
                if !instr.semantic.is_rip_relative_branch() {
                    continue;
                }
                let Some(link) = instr.semantic.link() else {
                    continue;
                };
                let Some(target) = link.target() else {
                    continue;
                };
                let target_func = match target {
                    LinkTarget::Instruction(f, _) if f != func => f,
                    LinkTarget::Function(f) if f != func => f,
                    _ => continue,
                };
                let Some(next_addr) = instr.next_address() else {
                    continue;
                };
                let Some(target_addr) = module.resolve_address(target) else {
                    continue;
                };
                let displacement = target_addr as i64 - next_addr as i64;
                let sled = gadget_sled(displacement);
                if sled > MIN_SLED_FOR_REORDER {
                    targets.push((target_func, sled));
                }
            }
        }
        if !targets.is_empty() {
            entries.push((func, targets));
        }
    }
    FunctionReorderingProfile { entries }
}

/// Apply one correction from a previously generated profile: pick a random
/// entry, pick the source function or one of its targets to move, and slide
/// it through `module.function_order` one adjacent swap at a time until the
/// chosen sled requirement is satisfied or a boundary is hit. Invalidates
/// every function's address — callers must re-run layout afterward.
pub fn visit<R: Rng>(module: &mut Module, profile: &FunctionReorderingProfile, rng: &mut R) {
    if profile.entries.is_empty() {
        return;
    }
    let (source, targets) = &profile.entries[rng.gen_range(0..profile.entries.len())];

    let mover_idx = rng.gen_range(0..=targets.len());
    let (mover, mut bytes_to_move) = if mover_idx == 0 {
        let max_sled = targets.iter().map(|(_, sled)| *sled).max().unwrap_or(0);
        (*source, max_sled)
    } else {
        targets[mover_idx - 1]
    };

    let move_back = rng.gen_bool(0.5);
    let Some(mut index) = module.function_order.iter().position(|&f| f == mover) else {
        return;
    };

    while bytes_to_move > 0 {
        let neighbor_index = if move_back {
            if index == 0 {
                break;
            }
            index - 1
        } else {
            if index + 1 >= module.function_order.len() {
                break;
            }
            index + 1
        };

        let neighbor = module.function_order[neighbor_index];
        let moved_by = module.function(neighbor).size as u64;
        module.function_order.swap(index, neighbor_index);
        index = neighbor_index;

        bytes_to_move = bytes_to_move.saturating_sub(moved_by);
    }

    module.invalidate_addresses_of_module();
}
