//! C8: the convergence driver.
//!
//! Repeatedly applies the selected gadget-reduction techniques, lays the
//! module out, and asks the oracle (via C6's profile generator) whether any
//! unintended gadget remains in a resolved RIP-relative displacement. Stops
//! at the first clean layout, or after `MAX_FAILS` unsuccessful attempts.
//! Grounded on `original_source/src/conductor/setup.cpp`
//! (`generateMirrorELFWithGadgetElimination`, `MAX_FAILS = 25`).

use rand::Rng;

use crate::error::{HardenError, Result};
use crate::ir::Module;
use crate::layout;
use crate::passes::{function_reordering, merge_jump, merge_return, offset_sledding, sanitize_volatiles, widen_barriers};

/// Matches the source's hard cap on regeneration attempts before giving up.
pub const MAX_FAILS: usize = 25;

/// Which gadget-reduction techniques C8 applies each iteration. Built by
/// the registry (C9) from CLI flags.
#[derive(Debug, Clone, Copy)]
pub struct Techniques {
    pub merge_return: bool,
    pub merge_jump: bool,
    pub widen_barriers: bool,
    pub sanitize_volatiles: bool,
    pub function_reordering: bool,
    pub offset_sledding: bool,
}

impl Techniques {
    /// No techniques selected: layout only, no mutation.
    pub fn none() -> Self {
        Techniques {
            merge_return: false,
            merge_jump: false,
            widen_barriers: false,
            sanitize_volatiles: false,
            function_reordering: false,
            offset_sledding: false,
        }
    }

    /// The default `--gadget-reduction` bundle: C2 + C3 + C4 + C7, with
    /// generation (offset-sledding) always active since it is what the
    /// driver's convergence check depends on. C7 rides along with the
    /// bundle rather than behind its own flag — the original doesn't expose
    /// function reordering as a separate CLI technique either.
    pub fn gadget_reduction() -> Self {
        Techniques {
            merge_return: true,
            merge_jump: true,
            widen_barriers: true,
            sanitize_volatiles: false,
            function_reordering: true,
            offset_sledding: true,
        }
    }
}

/// One failed convergence attempt, recorded for the final report.
#[derive(Debug, Clone)]
pub struct FailureRecord {
    pub attempt: usize,
    pub gadgets_remaining: usize,
}

/// Failure history across a convergence run.
#[derive(Debug, Clone, Default)]
pub struct FailureLedger {
    pub records: Vec<FailureRecord>,
}

impl FailureLedger {
    fn push(&mut self, attempt: usize, gadgets_remaining: usize) {
        self.records.push(FailureRecord {
            attempt,
            gadgets_remaining,
        });
    }
}

/// Summary of a completed (successful) convergence run.
#[derive(Debug, Clone)]
pub struct ConvergenceReport {
    pub attempts: usize,
    pub returns_merged: usize,
    pub jumps_merged: usize,
    pub barriers_widened: usize,
    pub exit_points_sanitized: usize,
    pub sleds_applied: usize,
    pub reordered: bool,
    pub ledger: FailureLedger,
}

/// Run C8 to a fixed point (or until `MAX_FAILS` is exhausted). `base` is
/// the address the sequential layout starts from.
pub fn run<R: Rng>(
    module: &mut Module,
    techniques: Techniques,
    base: u64,
    rng: &mut R,
) -> Result<ConvergenceReport> {
    let mut report = ConvergenceReport {
        attempts: 0,
        returns_merged: 0,
        jumps_merged: 0,
        barriers_widened: 0,
        exit_points_sanitized: 0,
        sleds_applied: 0,
        reordered: false,
        ledger: FailureLedger::default(),
    };

    // C2-C5 are size-changing pre-passes: the original only runs them once,
    // before generation, never per regeneration attempt.
    if techniques.merge_return {
        report.returns_merged = merge_return::run(module).returns_merged;
    }
    if techniques.merge_jump {
        report.jumps_merged = merge_jump::run(module).jumps_merged;
    }
    if techniques.widen_barriers {
        report.barriers_widened = widen_barriers::run(module).barriers_widened;
    }
    if techniques.sanitize_volatiles {
        report.exit_points_sanitized = sanitize_volatiles::run(module).exit_points_sanitized;
    }
    if techniques.function_reordering {
        // generate_profile needs resolved addresses to compute call
        // displacements, so lay out once before reading it.
        layout::layout(module, base)?;
        let profile = function_reordering::generate_profile(module);
        function_reordering::visit(module, &profile, rng);
        report.reordered = true;
    }

    for attempt in 1..=MAX_FAILS {
        report.attempts = attempt;

        layout::layout(module, base)?;

        if !techniques.offset_sledding {
            return Ok(report);
        }

        let profile = offset_sledding::generate_profile(module);
        if profile.entries.is_empty() {
            return Ok(report);
        }

        report.ledger.push(attempt, profile.entries.len());
        report.sleds_applied += profile.entries.len();
        offset_sledding::visit(module, &profile, rng);
    }

    Err(HardenError::ConvergenceFailed {
        attempts: MAX_FAILS,
        failures: report.ledger.records.len(),
    })
}
