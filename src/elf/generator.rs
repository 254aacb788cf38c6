//! Mirror-ELF emission.
//!
//! Patches the hardened `.text` bytes back into a copy of the input file,
//! leaving every other section, segment, and symbol untouched. This is
//! deliberately narrower than a general-purpose linker: it never grows a
//! segment, so a pass sequence that inflates `.text` past the original
//! section's file size fails loudly instead of silently corrupting layout.
//! See DESIGN.md for why a byte-patch generator was chosen over building a
//! fresh ELF image with `object::write`.

use object::{Object, ObjectSection};

use crate::error::{HardenError, Result};
use crate::ir::Module;

/// Concatenate every instruction of every function, in `module.function_order`,
/// into one contiguous buffer addressed from the first function's base
/// address. Callers must have already run [`crate::layout::layout`] on
/// `module` so every instruction carries an assigned address.
pub fn serialize_text(module: &Module) -> Result<Vec<u8>> {
    let &first = module.function_order.first().ok_or_else(|| HardenError::GenerationError {
        message: "module has no functions to emit".to_string(),
    })?;
    let text_base = module.function(first).base_address.ok_or_else(|| {
        HardenError::GenerationError {
            message: "module has not been laid out".to_string(),
        }
    })?;

    let mut buf = Vec::new();
    for &func in &module.function_order {
        let function = module.function(func);
        for block in &function.blocks {
            for &id in &block.order {
                let instr = function.instr(id);
                let addr = instr.address.ok_or_else(|| HardenError::GenerationError {
                    message: format!("instruction in `{}` has no assigned address", function.name),
                })?;
                if addr < text_base {
                    return Err(HardenError::GenerationError {
                        message: format!("`{}` is laid out before the text base", function.name),
                    });
                }
                let offset = (addr - text_base) as usize;
                if offset < buf.len() {
                    return Err(HardenError::GenerationError {
                        message: "instruction addresses are not monotonically increasing"
                            .to_string(),
                    });
                }
                buf.resize(offset, 0x90);
                buf.extend_from_slice(&instr.bytes);
            }
        }
    }
    Ok(buf)
}

/// Produce a hardened copy of `original` with its `.text` section replaced
/// by `module`'s laid-out code, NOP-padded to the original section's exact
/// file size.
pub fn generate(original: &[u8], module: &Module) -> Result<Vec<u8>> {
    let (file_offset, file_size) = {
        let file = object::File::parse(original).map_err(|e| HardenError::ElfParseError {
            message: e.to_string(),
        })?;
        let text = file.section_by_name(".text").ok_or_else(|| HardenError::ElfParseError {
            message: "no .text section".to_string(),
        })?;
        text.file_range().ok_or_else(|| HardenError::ElfParseError {
            message: ".text section has no file backing".to_string(),
        })?
    };

    let new_text = serialize_text(module)?;
    if new_text.len() as u64 > file_size {
        return Err(HardenError::GenerationError {
            message: format!(
                "hardened code is {} bytes but the original .text section only holds {file_size}; \
                 this generator does not grow segments",
                new_text.len()
            ),
        });
    }

    let mut out = original.to_vec();
    let start = file_offset as usize;
    out[start..start + new_text.len()].copy_from_slice(&new_text);
    for byte in &mut out[start + new_text.len()..start + file_size as usize] {
        *byte = 0x90;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Block, Function, Instruction};
    use crate::layout;

    #[test]
    fn serialize_text_concatenates_in_function_order() {
        let mut module = Module::new("m");
        let mut f0 = Function::new("a");
        let a = f0.alloc(Instruction::plain(vec![0xaa]));
        f0.blocks.push(Block::new(vec![a]));
        module.push_function(f0);

        let mut f1 = Function::new("b");
        let b = f1.alloc(Instruction::plain(vec![0xbb, 0xbb]));
        f1.blocks.push(Block::new(vec![b]));
        module.push_function(f1);

        layout::layout(&mut module, 0x1000).unwrap();
        let bytes = serialize_text(&module).unwrap();
        assert_eq!(bytes, vec![0xaa, 0xbb, 0xbb]);
    }

    #[test]
    fn serialize_text_fails_without_layout() {
        let mut module = Module::new("m");
        let mut f = Function::new("a");
        let a = f.alloc(Instruction::plain(vec![0xaa]));
        f.blocks.push(Block::new(vec![a]));
        module.push_function(f);

        assert!(serialize_text(&module).is_err());
    }
}
