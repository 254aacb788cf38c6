//! Error types for the binary hardener.

use thiserror::Error;

/// Primary error type for the hardener.
#[derive(Debug, Error)]
pub enum HardenError {
    /// IO error during file operations.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The input could not be parsed as an ELF object.
    #[error("ELF parse error: {message}")]
    ElfParseError { message: String },

    /// The input ELF is a format this tool does not harden.
    #[error("unsupported ELF: {reason}")]
    UnsupportedElf { reason: String },

    /// The object's machine type is not x86-64.
    #[error("unsupported machine type: expected x86-64, got {machine:?}")]
    UnsupportedMachine { machine: String },

    /// The input ELF is not position-independent.
    #[error("input is not a PIE executable: {path}")]
    NotPositionIndependent { path: String },

    /// Disassembly failed at a given address.
    #[error("disassembly failed at address 0x{address:x}: {message}")]
    DisassemblyError { address: u64, message: String },

    /// Mirror ELF generation failed.
    #[error("ELF generation error: {message}")]
    GenerationError { message: String },

    /// A requested hardening technique name is not registered.
    #[error("unknown technique: {name}")]
    UnknownTechnique { name: String },

    /// The convergence driver exhausted its failure budget without
    /// reaching a fixed point.
    #[error("gadget reduction failed to converge after {attempts} attempts ({failures} failed layouts)")]
    ConvergenceFailed { attempts: usize, failures: usize },

    /// Invariant violation caught by a debug assertion surfaced as an error
    /// in release builds instead of panicking mid-pipeline.
    #[error("internal invariant violated: {message}")]
    InvariantViolation { message: String },

    /// Configuration error (conflicting CLI flags, etc).
    #[error("configuration error: {message}")]
    ConfigError { message: String },
}

/// Result type alias for hardener operations.
pub type Result<T> = std::result::Result<T, HardenError>;

/// Extension trait for adding context to errors, mirroring the pattern of
/// attaching a human-readable stage description to low-level failures.
pub trait ResultExt<T> {
    /// Add context to an error, wrapping it as an [`HardenError::ElfParseError`].
    fn context(self, msg: impl Into<String>) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, msg: impl Into<String>) -> Result<T> {
        self.map_err(|e| HardenError::ElfParseError {
            message: format!("{}: {}", msg.into(), e),
        })
    }
}
