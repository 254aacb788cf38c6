//! Load a PIE x86-64 ELF executable into the gadget-reduction IR.
//!
//! Scope: linear-sweep disassembly of `.text`, seeded at `FUNC` symbols
//! from the symbol table when present (falling back to one function
//! spanning the whole section otherwise), split into basic blocks at
//! control-flow instructions. Direct branch/call targets that land on a
//! decoded instruction boundary are resolved into `Link::Normal` edges;
//! everything else (PLT imports, indirect calls, memory-operand indirect
//! jumps) is left as an opaque link. No relocation processing beyond that
//! resolution.
//!
//! Grounded on the `object`+`capstone` combination `bytecodealliance-wasmtime`
//! uses for reading and disassembling native code sections.

use std::collections::HashMap;

use capstone::arch::x86::X86OperandType;
use capstone::arch::{self, BuildsCapstone, DetailsArchInsn};
use capstone::{Capstone, Insn};
use object::{Object, ObjectSection, ObjectSymbol, SymbolKind};

use crate::error::{HardenError, Result};
use crate::ir::{
    BranchEncoding, ControlFlowKind, FuncId, Function, InstrId, Instruction, Link, LinkScope,
    LinkTarget, Module, Register, Semantic,
};

/// A direct branch/call whose target address capstone resolved but which
/// couldn't be tied to an `InstrId` until every function is loaded.
struct PendingLink {
    site: InstrId,
    kind: ControlFlowKind,
    encoding: BranchEncoding,
    target_addr: u64,
}

/// Parse `data` as an ELF object and lift its executable section into a
/// [`Module`].
pub fn load(data: &[u8]) -> Result<Module> {
    let file = object::File::parse(data).map_err(|e| HardenError::ElfParseError {
        message: e.to_string(),
    })?;

    if file.architecture() != object::Architecture::X86_64 {
        return Err(HardenError::UnsupportedMachine {
            machine: format!("{:?}", file.architecture()),
        });
    }
    if !matches!(file.kind(), object::ObjectKind::Dynamic) {
        return Err(HardenError::NotPositionIndependent {
            path: "<in-memory>".to_string(),
        });
    }

    let text = file
        .section_by_name(".text")
        .ok_or_else(|| HardenError::ElfParseError {
            message: "no .text section".to_string(),
        })?;
    let text_addr = text.address();
    let text_data = text.data().map_err(|e| HardenError::ElfParseError {
        message: e.to_string(),
    })?;

    let mut symbol_starts: HashMap<u64, String> = HashMap::new();
    for sym in file.symbols() {
        if sym.kind() == SymbolKind::Text && sym.address() >= text_addr {
            let name = sym.name().unwrap_or("").to_string();
            if !name.is_empty() {
                symbol_starts.insert(sym.address(), name);
            }
        }
    }
    if symbol_starts.is_empty() {
        symbol_starts.insert(text_addr, "text".to_string());
    }
    let mut starts: Vec<u64> = symbol_starts.keys().copied().collect();
    starts.sort_unstable();

    let cs = Capstone::new()
        .x86()
        .mode(arch::x86::ArchMode::Mode64)
        .detail(true)
        .build()
        .map_err(|e| HardenError::DisassemblyError {
            address: text_addr,
            message: e.to_string(),
        })?;
    let insns = cs.disasm_all(text_data, text_addr).map_err(|e| HardenError::DisassemblyError {
        address: text_addr,
        message: e.to_string(),
    })?;

    let mut module = Module::new(format!("{:?}", file.format()).to_lowercase());
    let mut pending: Vec<(FuncId, PendingLink)> = Vec::new();
    let mut addr_to_instr: HashMap<u64, (FuncId, InstrId)> = HashMap::new();

    for (idx, &start) in starts.iter().enumerate() {
        let end = starts
            .get(idx + 1)
            .copied()
            .unwrap_or(text_addr + text_data.len() as u64);
        let name = symbol_starts[&start].clone();
        let mut func_pending = Vec::new();
        let function = lift_function(&cs, &insns, start, end, name, &mut func_pending);
        let func_id = module.push_function(function);
        for (i, instr) in module.function(func_id).instrs.iter().enumerate() {
            if let Some(addr) = instr.address {
                addr_to_instr.insert(addr, (func_id, InstrId(i as u32)));
            }
        }
        pending.extend(func_pending.into_iter().map(|p| (func_id, p)));
    }

    for (site_func, p) in pending {
        let Some(&(target_func, target_instr)) = addr_to_instr.get(&p.target_addr) else {
            continue;
        };
        let scope = if site_func == target_func {
            LinkScope::InternalJump
        } else {
            LinkScope::ExternalJump
        };
        let instr = module.function_mut(site_func).instr_mut(p.site);
        instr.semantic = Semantic::ControlFlow {
            kind: p.kind,
            link: Some(Link::Normal {
                target: LinkTarget::Instruction(target_func, target_instr),
                scope,
                rip_relative: true,
            }),
            encoding: p.encoding,
        };
    }

    Ok(module)
}

fn lift_function(
    cs: &Capstone,
    insns: &capstone::Instructions<'_>,
    start: u64,
    end: u64,
    name: String,
    pending: &mut Vec<PendingLink>,
) -> Function {
    let mut function = Function::new(name);
    let mut block_order = Vec::new();

    for insn in insns.iter().filter(|i| i.address() >= start && i.address() < end) {
        let (semantic, reg, branch_target) = classify(cs, insn);
        let is_terminator = matches!(semantic, Semantic::ControlFlow { .. });
        let instr = Instruction {
            bytes: insn.bytes().to_vec(),
            semantic,
            address: Some(insn.address()),
            indirect_target_reg: reg,
        };
        let id = function.alloc(instr);
        if let Some((kind, encoding, target_addr)) = branch_target {
            pending.push(PendingLink { site: id, kind, encoding, target_addr });
        }
        block_order.push(id);
        if is_terminator {
            function.blocks.push(crate::ir::Block::new(std::mem::take(&mut block_order)));
        }
    }
    if !block_order.is_empty() {
        function.blocks.push(crate::ir::Block::new(block_order));
    }

    for b in function.block_ids() {
        function.recompute_block_size(b);
    }
    function.recompute_size();
    function
}

/// Classify one decoded instruction. The third return value, when present,
/// is `(kind, encoding, target_addr)` for a direct branch/call whose
/// immediate target the caller should try to resolve into an `InstrId` once
/// every function in the module has been allocated; until then the
/// instruction carries `Link::SymbolOnly`.
fn classify(cs: &Capstone, insn: &Insn) -> (Semantic, Option<Register>, Option<(ControlFlowKind, BranchEncoding, u64)>) {
    let mnemonic = insn.mnemonic().unwrap_or("");
    let bytes = insn.bytes();

    if mnemonic == "ret" || mnemonic == "retf" {
        return (
            Semantic::ControlFlow {
                kind: ControlFlowKind::Ret,
                link: None,
                encoding: BranchEncoding::NotEncoded,
            },
            None,
            None,
        );
    }

    let is_call = mnemonic == "call";
    let is_cond_jmp = mnemonic.starts_with('j') && mnemonic != "jmp";
    let is_jmp = mnemonic == "jmp";
    if !is_call && !is_cond_jmp && !is_jmp {
        return (Semantic::Disassembled, None, None);
    }

    if let Ok(detail) = cs.insn_detail(insn) {
        if let Some(arch_detail) = detail.arch_detail().x86() {
            for op in arch_detail.operands() {
                match op.op_type {
                    X86OperandType::Imm(target) => {
                        let kind = if is_call {
                            ControlFlowKind::Call
                        } else if is_jmp {
                            ControlFlowKind::Jump
                        } else {
                            ControlFlowKind::CondJump
                        };
                        let encoding = match (bytes.len(), kind) {
                            (5, ControlFlowKind::Call) => BranchEncoding::NearCallRel32,
                            (5, ControlFlowKind::Jump) => BranchEncoding::NearJmpRel32,
                            (2, ControlFlowKind::CondJump) => {
                                BranchEncoding::ShortCondJmpRel8 { cc: bytes[0] & 0xf }
                            }
                            (6, ControlFlowKind::CondJump) => {
                                BranchEncoding::NearCondJmpRel32 { cc: bytes[1] & 0xf }
                            }
                            _ => BranchEncoding::NotEncoded,
                        };
                        return (
                            Semantic::ControlFlow {
                                kind,
                                link: Some(Link::SymbolOnly { rip_relative: true }),
                                encoding,
                            },
                            None,
                            Some((kind, encoding, target as u64)),
                        );
                    }
                    X86OperandType::Reg(reg_id) => {
                        let reg = map_register(cs, reg_id);
                        return (
                            Semantic::ControlFlow {
                                kind: if is_call {
                                    ControlFlowKind::Call
                                } else {
                                    ControlFlowKind::IndirectJump
                                },
                                link: None,
                                encoding: BranchEncoding::NotEncoded,
                            },
                            reg,
                            None,
                        );
                    }
                    _ => {}
                }
            }
        }
    }

    // Memory-operand indirect call/jump: opaque, no recoverable register.
    (
        Semantic::ControlFlow {
            kind: if is_call {
                ControlFlowKind::Call
            } else {
                ControlFlowKind::IndirectJump
            },
            link: None,
            encoding: BranchEncoding::NotEncoded,
        },
        None,
        None,
    )
}

fn map_register(cs: &Capstone, reg_id: capstone::RegId) -> Option<Register> {
    let name = cs.reg_name(reg_id)?;
    Some(match name.as_str() {
        "rax" => Register::Rax,
        "rbx" => Register::Rbx,
        "rcx" => Register::Rcx,
        "rdx" => Register::Rdx,
        "rsi" => Register::Rsi,
        "rdi" => Register::Rdi,
        "rbp" => Register::Rbp,
        "rsp" => Register::Rsp,
        "r8" => Register::R8,
        "r9" => Register::R9,
        "r10" => Register::R10,
        "r11" => Register::R11,
        "r12" => Register::R12,
        "r13" => Register::R13,
        "r14" => Register::R14,
        "r15" => Register::R15,
        _ => return None,
    })
}
