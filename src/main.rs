//! etharden CLI
//!
//! Command-line front end for the gadget-reduction hardener: parses mode
//! flags into a [`Selection`], runs the pipeline, and reports what happened.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use etharden::{harden_file, HumanFormatter, JsonFormatter, Mode, ReportFormatter, Selection, ShortFormatter};

/// Reduce code-reuse-attack gadgets in a position-independent x86-64 ELF
/// executable.
#[derive(Parser, Debug)]
#[command(name = "etharden")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Input ELF executable.
    input: PathBuf,

    /// Output ELF executable.
    output: PathBuf,

    /// Verbose output (per-attempt failure ledger).
    #[arg(short = 'v', long, conflicts_with = "quiet")]
    verbose: bool,

    /// Quiet mode: one summary line (default).
    #[arg(short = 'q', long)]
    quiet: bool,

    /// Emit a mirror (1-to-1) ELF (default).
    #[arg(short = 'm', long, conflicts_with = "union_elf")]
    mirror: bool,

    /// Emit a union (merged) ELF.
    #[arg(short = 'u', long = "union")]
    union_elf: bool,

    /// Output format.
    #[arg(short, long, default_value = "human")]
    format: OutputFormat,

    /// Base address to lay out code from.
    #[arg(long, default_value = "0x1000", value_parser = parse_hex)]
    base: u64,

    /// Seed for the offset-sledding and function-reordering RNGs.
    #[arg(long, default_value = "0")]
    seed: u64,

    /// Insert a single-byte NOP at each function entry.
    #[arg(long)]
    nop: bool,

    /// Rewrite indirect branches through registers into retpoline sequences.
    #[arg(long)]
    retpolines: bool,

    /// Insert `endbr64` landing pads and verify indirect call targets.
    #[arg(long)]
    cfi: bool,

    /// Stack canary strongization, plain variant.
    #[arg(long)]
    ss: bool,

    /// Stack canary strongization, XOR-masked variant.
    #[arg(long = "ss-xor")]
    ss_xor: bool,

    /// Stack canary strongization, %gs-segment variant.
    #[arg(long = "ss-gs")]
    ss_gs: bool,

    /// Stack canary strongization, constant-mask variant.
    #[arg(long = "ss-const")]
    ss_const: bool,

    /// Control-flow enforcement (CET) markers.
    #[arg(long)]
    cet: bool,

    /// Control-flow enforcement, %gs-segment variant.
    #[arg(long = "cet-gs")]
    cet_gs: bool,

    /// Control-flow enforcement, constant-mask variant.
    #[arg(long = "cet-const")]
    cet_const: bool,

    /// Randomize the emission order of .data global variables.
    #[arg(long = "permute-data")]
    permute_data: bool,

    /// Insert profiling counter-increment prologues.
    #[arg(long)]
    profile: bool,

    /// Insert conditional watchpoint traps.
    #[arg(long = "cond-watchpoint")]
    cond_watchpoint: bool,

    /// Reduce ROP/JOP/COP gadgets (merge-return, merge-jump, widen-barriers,
    /// function-reordering, offset-sledding).
    #[arg(long = "gadget-reduction")]
    gadget_reduction: bool,
}

fn parse_hex(s: &str) -> Result<u64, String> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(s, 16).map_err(|e| e.to_string())
}

/// Output format options.
#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum OutputFormat {
    /// Human-readable output (default unless `-q`).
    Human,
    /// JSON output.
    Json,
    /// Compact single-line output.
    Short,
}

impl Args {
    fn selection(&self) -> Selection {
        let mut modes = Vec::new();
        let mut push = |flag: bool, mode: Mode| {
            if flag {
                modes.push(mode);
            }
        };
        push(self.nop, Mode::Nop);
        push(self.retpolines, Mode::Retpolines);
        push(self.cfi, Mode::Cfi);
        push(self.ss, Mode::StackStrongize);
        push(self.ss_xor, Mode::StackStrongizeXor);
        push(self.ss_gs, Mode::StackStrongizeGs);
        push(self.ss_const, Mode::StackStrongizeConst);
        push(self.cet || self.cet_gs || self.cet_const, Mode::ControlFlowEnforcement);
        push(self.permute_data, Mode::PermuteData);
        push(self.profile, Mode::Profile);
        push(self.cond_watchpoint, Mode::CondWatchpoint);
        push(self.gadget_reduction, Mode::GadgetReduction);
        Selection::new(modes)
    }
}

fn main() -> ExitCode {
    let args = Args::parse();

    if args.verbose {
        tracing_subscriber::fmt()
            .with_env_filter(
                std::env::var("ETHARDEN_DEBUG").unwrap_or_else(|_| "etharden=debug".to_string()),
            )
            .init();
    }

    if args.union_elf {
        eprintln!("union ELF generation is not implemented; use -m (mirror) instead");
        return ExitCode::FAILURE;
    }

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("etharden: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> etharden::Result<()> {
    let selection = args.selection();
    let outcome = harden_file(&args.input, &selection, args.base, args.seed)?;
    std::fs::write(&args.output, &outcome.bytes)?;

    let rendered = match args.format {
        OutputFormat::Human if args.verbose => HumanFormatter::verbose().format_report(&outcome.report, &args.input, &args.output),
        OutputFormat::Human if args.quiet => HumanFormatter::quiet().format_report(&outcome.report, &args.input, &args.output),
        OutputFormat::Human => HumanFormatter::new().format_report(&outcome.report, &args.input, &args.output),
        OutputFormat::Json => JsonFormatter::new().format_report(&outcome.report, &args.input, &args.output),
        OutputFormat::Short => ShortFormatter::new().format_report(&outcome.report, &args.input, &args.output),
    };
    print!("{rendered}");

    Ok(())
}
