//! C9: the pass registry.
//!
//! Maps hardening mode names to the techniques they enable, and keeps
//! invocation order so a report can state which modes a given run actually
//! applied. Grounded on `original_source/app/harden/etharden.cpp`'s
//! technique-name dispatch table.

use rand::Rng;

use crate::driver::Techniques;
use crate::error::{HardenError, Result};
use crate::ir::Module;
use crate::passes::ancillary;

/// A single hardening mode the CLI can request, in the order
/// `original_source/app/harden/etharden.cpp` declares its `--` flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    GadgetReduction,
    Nop,
    Retpolines,
    Cfi,
    StackStrongize,
    StackStrongizeXor,
    StackStrongizeGs,
    StackStrongizeConst,
    ControlFlowEnforcement,
    PermuteData,
    Profile,
    CondWatchpoint,
}

impl Mode {
    /// Parse a `--flag`-style name (without the leading dashes) into a mode.
    pub fn from_flag(name: &str) -> Result<Self> {
        Ok(match name {
            "gadget-reduction" => Mode::GadgetReduction,
            "nop" => Mode::Nop,
            "retpolines" => Mode::Retpolines,
            "cfi" => Mode::Cfi,
            "ss" => Mode::StackStrongize,
            "ss-xor" => Mode::StackStrongizeXor,
            "ss-gs" => Mode::StackStrongizeGs,
            "ss-const" => Mode::StackStrongizeConst,
            "cet" => Mode::ControlFlowEnforcement,
            "permute-data" => Mode::PermuteData,
            "profile" => Mode::Profile,
            "cond-watchpoint" => Mode::CondWatchpoint,
            other => {
                return Err(HardenError::UnknownTechnique {
                    name: other.to_string(),
                })
            }
        })
    }
}

/// A run's selected modes, in the order the user passed them on the
/// command line (invocation order is preserved, not sorted).
#[derive(Debug, Clone, Default)]
pub struct Selection {
    pub modes: Vec<Mode>,
}

impl Selection {
    pub fn new(modes: Vec<Mode>) -> Self {
        Selection { modes }
    }

    pub fn contains(&self, mode: Mode) -> bool {
        self.modes.contains(&mode)
    }

    /// Build the C8 [`Techniques`] bundle this selection implies.
    /// `gadget-reduction` is the only mode that drives C8; every other mode
    /// is purely ancillary and combines freely with it (spec: "Multiple
    /// modes combine").
    pub fn techniques(&self) -> Techniques {
        if self.contains(Mode::GadgetReduction) {
            Techniques::gadget_reduction()
        } else {
            Techniques::none()
        }
    }

    /// Run every selected ancillary (non-gadget-reduction) mode against
    /// `module`, in invocation order. The caller runs the C8 convergence
    /// driver separately for `gadget-reduction`.
    pub fn run_ancillary<R: Rng>(&self, module: &mut Module, rng: &mut R) -> Result<ancillary::AncillaryReport> {
        let mut report = ancillary::AncillaryReport::default();
        for &mode in &self.modes {
            match mode {
                Mode::GadgetReduction => {}
                Mode::Nop => ancillary::nop(module, &mut report),
                Mode::Retpolines => ancillary::retpolines(module, &mut report),
                Mode::Cfi => ancillary::cfi(module, &mut report),
                Mode::StackStrongize => ancillary::stack_strongize(module, ancillary::StackStrongizeKind::Plain, &mut report),
                Mode::StackStrongizeXor => ancillary::stack_strongize(module, ancillary::StackStrongizeKind::Xor, &mut report),
                Mode::StackStrongizeGs => ancillary::stack_strongize(module, ancillary::StackStrongizeKind::Gs, &mut report),
                Mode::StackStrongizeConst => ancillary::stack_strongize(module, ancillary::StackStrongizeKind::Const, &mut report),
                Mode::ControlFlowEnforcement => ancillary::control_flow_enforcement(module, &mut report),
                Mode::PermuteData => ancillary::permute_data(module, rng, &mut report),
                Mode::Profile => ancillary::profile(module, &mut report),
                Mode::CondWatchpoint => ancillary::cond_watchpoint(module, &mut report),
            }
        }
        Ok(report)
    }
}
