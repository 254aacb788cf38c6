//! etharden - code-reuse-attack gadget reduction for PIE x86-64 ELF binaries
//!
//! This library hardens position-independent x86-64 ELF executables against
//! ROP/JOP/COP code-reuse attacks by collapsing the return/indirect-jump
//! instructions a gadget scanner can chain into, widening the instruction
//! boundaries that produce unintended gadgets, and sledding away any gadget
//! an address assignment happens to reintroduce. A handful of non-gadget-
//! reduction hardening modes (CFI landing pads, retpolines, stack-canary
//! strongiciation, profiling/watchpoint traps) ride the same pipeline.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use etharden::{harden_file, registry::{Mode, Selection}};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let selection = Selection::new(vec![Mode::GadgetReduction]);
//!     let outcome = harden_file("input.elf", &selection, 0x1000, 42)?;
//!     std::fs::write("output.elf", &outcome.bytes)?;
//!     Ok(())
//! }
//! ```
//!
//! # Pipeline
//!
//! 1. [`elf::load`] disassembles the input's `.text` into the [`ir`] tree.
//! 2. [`registry::Selection::techniques`] and [`registry::Selection::run_ancillary`]
//!    dispatch the CLI's requested modes.
//! 3. [`driver::run`] iterates the gadget-reduction passes (when selected) to
//!    a clean, fully laid-out fixed point; [`layout::layout`] alone handles
//!    address assignment when only ancillary modes ran.
//! 4. [`elf::generate`] patches the hardened code back into a copy of the
//!    input file.

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::too_many_arguments)]

pub mod driver;
pub mod elf;
pub mod error;
pub mod formatter;
pub mod ir;
pub mod layout;
pub mod oracle;
pub mod passes;
pub mod registry;

pub use error::{HardenError, Result};
pub use formatter::{HardenReport, HumanFormatter, JsonFormatter, ReportFormatter, ShortFormatter};
pub use registry::{Mode, Selection};

use std::path::Path;

use rand_pcg::Pcg32;

use crate::driver::ConvergenceReport;
use crate::ir::Module;
use crate::passes::ancillary::AncillaryReport;

/// The hardened bytes plus the reports describing what was done to produce
/// them.
#[derive(Debug, Clone)]
pub struct HardenOutcome {
    /// The hardened ELF image, ready to write to disk.
    pub bytes: Vec<u8>,
    /// What the run did, suitable for a [`formatter::ReportFormatter`].
    pub report: HardenReport,
}

/// Harden a file on disk at `path` per `selection`, laying out code from
/// `base` and seeding any randomized pass from `seed`.
pub fn harden_file<P: AsRef<Path>>(
    path: P,
    selection: &Selection,
    base: u64,
    seed: u64,
) -> Result<HardenOutcome> {
    let data = std::fs::read(path)?;
    harden_bytes(&data, selection, base, seed)
}

/// Harden raw ELF bytes per `selection`.
///
/// Gadget reduction (`--gadget-reduction`) runs through [`driver::run`] to a
/// fixed point; every other selected mode runs once through
/// [`registry::Selection::run_ancillary`]. When gadget reduction is not
/// selected, [`layout::layout`] still runs once so ancillary-only runs
/// produce a consistently addressed module before generation.
pub fn harden_bytes(
    data: &[u8],
    selection: &Selection,
    base: u64,
    seed: u64,
) -> Result<HardenOutcome> {
    let mut module = elf::load(data)?;
    let mut rng = Pcg32::new(seed, 0xa02bdbf7bb3c0a7);

    let ancillary_report = selection.run_ancillary(&mut module, &mut rng)?;

    let gadget_reduction_report: Option<ConvergenceReport> = if selection.contains(Mode::GadgetReduction) {
        Some(driver::run(&mut module, selection.techniques(), base, &mut rng)?)
    } else {
        layout::layout(&mut module, base)?;
        None
    };

    let bytes = elf::generate(data, &module)?;

    Ok(HardenOutcome {
        bytes,
        report: HardenReport {
            gadget_reduction: gadget_reduction_report,
            ancillary: Some(ancillary_report).filter(|r| has_any_effect(r)),
        },
    })
}

fn has_any_effect(report: &AncillaryReport) -> bool {
    report.nops_inserted > 0
        || report.retpolines_applied > 0
        || report.cfi_checks_inserted > 0
        || report.stack_strongize_applied > 0
        || report.cet_markers_inserted > 0
        || report.profile_points_inserted > 0
        || report.watchpoints_inserted > 0
        || report.data_regions_permuted > 0
}

/// Lay out and disassemble-check `module` without generating output bytes;
/// used by the CLI's `--check` dry-run path.
pub fn validate(module: &mut Module, base: u64) -> Result<()> {
    layout::layout(module, base)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn has_any_effect_is_false_for_default_report() {
        assert!(!has_any_effect(&AncillaryReport::default()));
    }

    #[test]
    fn has_any_effect_is_true_when_any_counter_is_nonzero() {
        let report = AncillaryReport {
            nops_inserted: 1,
            ..AncillaryReport::default()
        };
        assert!(has_any_effect(&report));
    }
}
