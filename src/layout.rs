//! Address assignment and displacement materialization.
//!
//! Pure-IR layout logic shared by the real ELF generator
//! ([`crate::elf::generator`]) and by tests/the convergence driver, which
//! need to lay out a module without touching the filesystem. Grounded on
//! `original_source/src/conductor/setup.cpp`'s
//! `generateMirrorELFWithGadgetElimination` (assign addresses, fix up
//! branches, repeat until stable).

use crate::error::{HardenError, Result};
use crate::ir::Module;
use crate::passes::promote_jumps;

/// Lay out every function of `module` sequentially starting at `base`,
/// following the current `function_order`, and assign every instruction's
/// address. Pure function of sizes — independent of branch displacements.
pub fn assign_addresses_sequential(module: &mut Module, base: u64) {
    let mut addr = base;
    for &func in &module.function_order.clone() {
        let function = module.function_mut(func);
        function.base_address = Some(addr);
        for block in &function.blocks.clone() {
            for &id in &block.order {
                let size = function.instr(id).size() as u64;
                function.instr_mut(id).address = Some(addr);
                addr += size;
            }
        }
    }
}

/// Re-encode every direct branch's displacement bytes now that addresses
/// are assigned. Returns an error if any branch's target no longer fits
/// its current encoding — callers should run [`promote_jumps::run`] first
/// so that never happens for conditional jumps; unconditional/call forms
/// already use the widest (`rel32`) encoding and cannot overflow within an
/// address space this tool lays out.
pub fn materialize_displacements(module: &mut Module) -> Result<()> {
    let func_ids: Vec<_> = (0..module.functions.len() as u32)
        .map(crate::ir::FuncId)
        .collect();
    for func in func_ids {
        let function = module.function(func);
        let mut rewrites = Vec::new();
        for block in &function.blocks {
            for &id in &block.order {
                let instr = function.instr(id);
                let crate::ir::Semantic::ControlFlow { encoding, link: Some(link), .. } =
                    &instr.semantic
                else {
                    continue;
                };
                if matches!(encoding, crate::ir::BranchEncoding::NotEncoded) {
                    continue;
                }
                let Some(target) = link.target() else { continue };
                let (Some(next_addr), Some(target_addr)) =
                    (instr.next_address(), module.resolve_address(target))
                else {
                    continue;
                };
                let displacement = target_addr as i64 - next_addr as i64;
                if !encoding.fits(displacement) {
                    return Err(HardenError::GenerationError {
                        message: format!(
                            "displacement {displacement} does not fit encoding {encoding:?}"
                        ),
                    });
                }
                rewrites.push((id, encoding.encode(displacement)));
            }
        }
        let function = module.function_mut(func);
        for (id, bytes) in rewrites {
            function.instr_mut(id).bytes = bytes;
        }
    }
    Ok(())
}

/// Full layout cycle: assign addresses, widen any jump that no longer
/// fits, and repeat until a fixed point, then materialize displacements.
/// Mirrors the source's iterate-until-stable fixup loop; bounded so a
/// pathological case can't loop forever.
pub fn layout(module: &mut Module, base: u64) -> Result<()> {
    const MAX_FIXUP_ROUNDS: usize = 16;
    for _ in 0..MAX_FIXUP_ROUNDS {
        assign_addresses_sequential(module, base);
        let stats = promote_jumps::run(module);
        if stats.jumps_promoted == 0 {
            return materialize_displacements(module);
        }
    }
    Err(HardenError::GenerationError {
        message: "branch widening did not converge within the fixup round budget".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{
        Block, BranchEncoding, ControlFlowKind, Function, Instruction, Link, LinkScope,
        LinkTarget,
    };

    #[test]
    fn sequential_layout_assigns_increasing_addresses() {
        let mut module = Module::new("m");
        let mut f = Function::new("f");
        let a = f.alloc(Instruction::plain(vec![0x90]));
        let b = f.alloc(Instruction::plain(vec![0x90, 0x90]));
        f.blocks.push(Block::new(vec![a, b]));
        module.push_function(f);

        assign_addresses_sequential(&mut module, 0x400000);
        let f = module.function(crate::ir::FuncId(0));
        assert_eq!(f.base_address, Some(0x400000));
        assert_eq!(f.instr(a).address, Some(0x400000));
        assert_eq!(f.instr(b).address, Some(0x400001));
    }

    #[test]
    fn materialize_encodes_correct_displacement() {
        let mut module = Module::new("m");
        let mut f = Function::new("f");
        let target = f.alloc(Instruction::nop());
        let branch = f.alloc(Instruction::control_flow(
            BranchEncoding::NearJmpRel32.encode(0),
            ControlFlowKind::Jump,
            Some(Link::Normal {
                target: LinkTarget::Instruction(crate::ir::FuncId(0), target),
                scope: LinkScope::InternalJump,
                rip_relative: true,
            }),
            BranchEncoding::NearJmpRel32,
        ));
        f.blocks.push(Block::new(vec![branch, target]));
        module.push_function(f);

        assign_addresses_sequential(&mut module, 0);
        materialize_displacements(&mut module).unwrap();

        let f = module.function(crate::ir::FuncId(0));
        let bytes = &f.instr(branch).bytes;
        assert_eq!(bytes[0], 0xe9);
        // branch at 0, 5 bytes, target at 5: displacement 0.
        assert_eq!(i32::from_le_bytes(bytes[1..5].try_into().unwrap()), 0);
    }

    #[test]
    fn full_layout_promotes_and_materializes() {
        let mut module = Module::new("m");
        let mut f = Function::new("f");
        let target = f.alloc(Instruction::nop());
        let branch = f.alloc(Instruction::control_flow(
            BranchEncoding::ShortCondJmpRel8 { cc: 0x4 }.encode(0),
            ControlFlowKind::CondJump,
            Some(Link::Normal {
                target: LinkTarget::Instruction(crate::ir::FuncId(0), target),
                scope: LinkScope::InternalJump,
                rip_relative: true,
            }),
            BranchEncoding::ShortCondJmpRel8 { cc: 0x4 },
        ));
        // Pad the gap with enough bytes to overflow an i8 displacement.
        let mut padding = Vec::new();
        for _ in 0..200 {
            padding.push(f.alloc(Instruction::nop()));
        }
        let mut order = vec![branch];
        order.extend(padding);
        order.push(target);
        f.blocks.push(Block::new(order));
        module.push_function(f);

        layout(&mut module, 0).unwrap();

        let f = module.function(crate::ir::FuncId(0));
        match &f.instr(branch).semantic {
            crate::ir::Semantic::ControlFlow { encoding, .. } => {
                assert!(matches!(
                    encoding,
                    BranchEncoding::NearCondJmpRel32 { cc: 0x4 }
                ));
            }
            other => panic!("expected control flow, got {other:?}"),
        }
    }
}
