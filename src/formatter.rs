//! Output formatters for hardening run reports.
//!
//! This module provides trait-based formatters for rendering a completed
//! run in various output formats (human-readable, JSON, compact), mirroring
//! `original_source/app/harden/etharden.cpp`'s summary printout.

use std::path::Path;

use crate::driver::ConvergenceReport;
use crate::passes::ancillary::AncillaryReport;

/// Everything a completed hardening run produced, ready to format. A run
/// that only selected ancillary modes has no [`ConvergenceReport`]; one that
/// only ran `--gadget-reduction` has no [`AncillaryReport`]. Both can be
/// present when a CLI invocation combines `--gadget-reduction` with an
/// ancillary flag.
#[derive(Debug, Clone, Default)]
pub struct HardenReport {
    pub gadget_reduction: Option<ConvergenceReport>,
    pub ancillary: Option<AncillaryReport>,
}

/// Trait for formatting a [`HardenReport`].
///
/// Implementors provide methods for rendering each component, plus a method
/// to render the complete report.
pub trait ReportFormatter {
    /// Format the input/output file header.
    fn format_files(&self, input: &Path, output: &Path) -> String;

    /// Format the gadget-reduction convergence summary, if one ran.
    fn format_gadget_reduction(&self, report: &ConvergenceReport) -> Option<String>;

    /// Format the ancillary-mode counters, if any ran.
    fn format_ancillary(&self, report: &AncillaryReport) -> Option<String>;

    /// Format the complete report.
    ///
    /// Default implementation concatenates all component outputs.
    fn format_report(&self, report: &HardenReport, input: &Path, output: &Path) -> String {
        let mut parts = Vec::new();

        parts.push(self.format_files(input, output));

        if let Some(r) = &report.gadget_reduction {
            if let Some(s) = self.format_gadget_reduction(r) {
                parts.push(s);
            }
        }
        if let Some(r) = &report.ancillary {
            if let Some(s) = self.format_ancillary(r) {
                parts.push(s);
            }
        }

        parts.join("")
    }
}

/// Human-readable output formatter.
#[derive(Debug, Clone)]
pub struct HumanFormatter {
    /// Show verbose output (per-attempt failure ledger).
    pub verbose: bool,
    /// Quiet mode (single summary line).
    pub quiet: bool,
}

impl Default for HumanFormatter {
    fn default() -> Self {
        Self {
            verbose: false,
            quiet: false,
        }
    }
}

impl HumanFormatter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn verbose() -> Self {
        Self {
            verbose: true,
            quiet: false,
        }
    }

    pub fn quiet() -> Self {
        Self {
            verbose: false,
            quiet: true,
        }
    }
}

impl ReportFormatter for HumanFormatter {
    fn format_files(&self, input: &Path, output: &Path) -> String {
        if self.quiet {
            String::new()
        } else {
            format!("Input:  {}\nOutput: {}\n", input.display(), output.display())
        }
    }

    fn format_gadget_reduction(&self, report: &ConvergenceReport) -> Option<String> {
        if self.quiet {
            return Some(format!(
                "gadget-reduction: {} attempt(s), {} sled(s)\n",
                report.attempts, report.sleds_applied
            ));
        }

        let mut s = String::new();
        s.push_str("  Gadget reduction:\n");
        s.push_str(&format!("    Attempts:          {}\n", report.attempts));
        s.push_str(&format!("    Returns merged:    {}\n", report.returns_merged));
        s.push_str(&format!("    Jumps merged:      {}\n", report.jumps_merged));
        s.push_str(&format!("    Barriers widened:  {}\n", report.barriers_widened));
        s.push_str(&format!(
            "    Exits sanitized:   {}\n",
            report.exit_points_sanitized
        ));
        s.push_str(&format!("    Sleds applied:     {}\n", report.sleds_applied));
        s.push_str(&format!("    Reordered:         {}\n", report.reordered));

        if self.verbose && !report.ledger.records.is_empty() {
            s.push_str("    Failure ledger:\n");
            for record in &report.ledger.records {
                s.push_str(&format!(
                    "      attempt {}: {} gadget(s) remaining\n",
                    record.attempt, record.gadgets_remaining
                ));
            }
        }

        Some(s)
    }

    fn format_ancillary(&self, report: &AncillaryReport) -> Option<String> {
        if self.quiet {
            return None;
        }

        let counters: [(&str, usize); 7] = [
            ("NOPs inserted", report.nops_inserted),
            ("Retpolines applied", report.retpolines_applied),
            ("CFI checks inserted", report.cfi_checks_inserted),
            ("Stack-strongize applied", report.stack_strongize_applied),
            ("CET markers inserted", report.cet_markers_inserted),
            ("Profile points inserted", report.profile_points_inserted),
            ("Watchpoints inserted", report.watchpoints_inserted),
        ];
        let active: Vec<_> = counters.iter().filter(|(_, n)| *n > 0).collect();
        if active.is_empty() {
            return None;
        }

        let mut s = String::from("  Ancillary hardening:\n");
        for (label, n) in active {
            s.push_str(&format!("    {label}: {n}\n"));
        }
        Some(s)
    }

    fn format_report(&self, report: &HardenReport, input: &Path, output: &Path) -> String {
        if self.quiet {
            let gr = report
                .gadget_reduction
                .as_ref()
                .and_then(|r| self.format_gadget_reduction(r));
            return format!(
                "{}: {}\n",
                output.display(),
                gr.unwrap_or_else(|| "hardened\n".to_string()).trim_end()
            );
        }

        let mut parts = vec![self.format_files(input, output)];
        if let Some(r) = &report.gadget_reduction {
            if let Some(s) = self.format_gadget_reduction(r) {
                parts.push(s);
            }
        }
        if let Some(r) = &report.ancillary {
            if let Some(s) = self.format_ancillary(r) {
                parts.push(s);
            }
        }
        parts.join("")
    }
}

/// JSON output formatter.
#[derive(Debug, Clone)]
pub struct JsonFormatter {
    pub pretty: bool,
}

impl Default for JsonFormatter {
    fn default() -> Self {
        Self { pretty: true }
    }
}

impl JsonFormatter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn compact() -> Self {
        Self { pretty: false }
    }
}

impl ReportFormatter for JsonFormatter {
    fn format_files(&self, _input: &Path, _output: &Path) -> String {
        String::new() // Handled in format_report.
    }

    fn format_gadget_reduction(&self, _report: &ConvergenceReport) -> Option<String> {
        None // Handled in format_report.
    }

    fn format_ancillary(&self, _report: &AncillaryReport) -> Option<String> {
        None // Handled in format_report.
    }

    fn format_report(&self, report: &HardenReport, input: &Path, output: &Path) -> String {
        #[derive(serde::Serialize)]
        struct JsonOutput {
            input: String,
            output: String,
            gadget_reduction: Option<GadgetReductionJson>,
            ancillary: Option<AncillaryJson>,
        }

        #[derive(serde::Serialize)]
        struct GadgetReductionJson {
            attempts: usize,
            returns_merged: usize,
            jumps_merged: usize,
            barriers_widened: usize,
            exit_points_sanitized: usize,
            sleds_applied: usize,
            reordered: bool,
            failed_attempts: usize,
        }

        #[derive(serde::Serialize)]
        struct AncillaryJson {
            nops_inserted: usize,
            retpolines_applied: usize,
            cfi_checks_inserted: usize,
            stack_strongize_applied: usize,
            cet_markers_inserted: usize,
            profile_points_inserted: usize,
            watchpoints_inserted: usize,
        }

        let output_json = JsonOutput {
            input: input.display().to_string(),
            output: output.display().to_string(),
            gadget_reduction: report.gadget_reduction.as_ref().map(|r| GadgetReductionJson {
                attempts: r.attempts,
                returns_merged: r.returns_merged,
                jumps_merged: r.jumps_merged,
                barriers_widened: r.barriers_widened,
                exit_points_sanitized: r.exit_points_sanitized,
                sleds_applied: r.sleds_applied,
                reordered: r.reordered,
                failed_attempts: r.ledger.records.len(),
            }),
            ancillary: report.ancillary.as_ref().map(|r| AncillaryJson {
                nops_inserted: r.nops_inserted,
                retpolines_applied: r.retpolines_applied,
                cfi_checks_inserted: r.cfi_checks_inserted,
                stack_strongize_applied: r.stack_strongize_applied,
                cet_markers_inserted: r.cet_markers_inserted,
                profile_points_inserted: r.profile_points_inserted,
                watchpoints_inserted: r.watchpoints_inserted,
            }),
        };

        if self.pretty {
            serde_json::to_string_pretty(&output_json).unwrap_or_else(|_| "{}".to_string())
        } else {
            serde_json::to_string(&output_json).unwrap_or_else(|_| "{}".to_string())
        }
    }
}

/// Compact single-line output formatter.
#[derive(Debug, Clone, Default)]
pub struct ShortFormatter;

impl ShortFormatter {
    pub fn new() -> Self {
        Self
    }
}

impl ReportFormatter for ShortFormatter {
    fn format_files(&self, _input: &Path, _output: &Path) -> String {
        String::new()
    }

    fn format_gadget_reduction(&self, _report: &ConvergenceReport) -> Option<String> {
        None
    }

    fn format_ancillary(&self, _report: &AncillaryReport) -> Option<String> {
        None
    }

    fn format_report(&self, report: &HardenReport, input: &Path, output: &Path) -> String {
        let gr = report
            .gadget_reduction
            .as_ref()
            .map(|r| format!("attempts={} sleds={}", r.attempts, r.sleds_applied))
            .unwrap_or_default();
        let anc_total: usize = report
            .ancillary
            .as_ref()
            .map(|r| {
                r.nops_inserted
                    + r.retpolines_applied
                    + r.cfi_checks_inserted
                    + r.stack_strongize_applied
                    + r.cet_markers_inserted
                    + r.profile_points_inserted
                    + r.watchpoints_inserted
            })
            .unwrap_or(0);

        format!(
            "{}\t{}\t{}\tancillary_edits={}\n",
            input.display(),
            output.display(),
            gr,
            anc_total
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{ConvergenceReport, FailureLedger};
    use std::path::PathBuf;

    fn sample_report() -> HardenReport {
        HardenReport {
            gadget_reduction: Some(ConvergenceReport {
                attempts: 2,
                returns_merged: 3,
                jumps_merged: 1,
                barriers_widened: 0,
                exit_points_sanitized: 0,
                sleds_applied: 4,
                reordered: false,
                ledger: FailureLedger::default(),
            }),
            ancillary: Some(AncillaryReport {
                nops_inserted: 5,
                ..AncillaryReport::default()
            }),
        }
    }

    #[test]
    fn human_formatter_includes_counters() {
        let formatter = HumanFormatter::new();
        let report = sample_report();
        let output = formatter.format_report(&report, &PathBuf::from("in.elf"), &PathBuf::from("out.elf"));
        assert!(output.contains("Returns merged:    3"));
        assert!(output.contains("NOPs inserted: 5"));
    }

    #[test]
    fn human_formatter_quiet_is_one_line() {
        let formatter = HumanFormatter::quiet();
        let report = sample_report();
        let output = formatter.format_report(&report, &PathBuf::from("in.elf"), &PathBuf::from("out.elf"));
        assert_eq!(output.lines().count(), 1);
        assert!(output.starts_with("out.elf:"));
    }

    #[test]
    fn json_formatter_roundtrips_counts() {
        let formatter = JsonFormatter::new();
        let report = sample_report();
        let output = formatter.format_report(&report, &PathBuf::from("in.elf"), &PathBuf::from("out.elf"));
        assert!(output.contains("\"returns_merged\": 3"));
        assert!(output.contains("\"nops_inserted\": 5"));
    }

    #[test]
    fn short_formatter_is_tab_separated() {
        let formatter = ShortFormatter::new();
        let report = sample_report();
        let output = formatter.format_report(&report, &PathBuf::from("in.elf"), &PathBuf::from("out.elf"));
        assert_eq!(output.matches('\t').count(), 3);
    }
}
