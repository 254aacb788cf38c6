//! External collaborators: ELF I/O and x86-64 disassembly.
//!
//! These modules are deliberately simplified relative to a production
//! linker/loader (no relocation processing beyond what's needed to seed
//! [`crate::ir::Link`], no dynamic-segment rewriting, no multi-module
//! programs) but are real implementations against the `object` and
//! `capstone` crates, not stubs — see DESIGN.md.

pub mod generator;
pub mod loader;

pub use generator::generate;
pub use loader::load;
