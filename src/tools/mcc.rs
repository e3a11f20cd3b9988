use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use mcc_rs::driver::{DriveOpts, Driver, LastPhase};
use mcc_rs::Target;

/// A small compiler for a C subset
#[derive(Clone, Debug, Parser)]
#[command(name = "mcc")]
struct Args {
    /// give verbose output of the compilation stages
    #[arg(short = 'v')]
    verbose: bool,
    /// generate object files but don't link them
    #[arg(short = 'c')]
    compile_only: bool,
    /// pre-process the files, output on stdout
    #[arg(short = 'E')]
    preprocess_only: bool,
    /// generate assembly files but don't assemble or link them
    #[arg(short = 'S')]
    asm_only: bool,
    /// keep temporary files for debugging
    #[arg(short = 'X')]
    keep_temps: bool,
    /// dump each function's AST tree
    #[arg(short = 'T')]
    dump_ast: bool,
    /// set a pre-processor define
    #[arg(short = 'D', value_name = "NAME")]
    defines: Vec<String>,
    /// the CPU to generate code for
    #[arg(short = 'm', value_enum, default_value_t = Target::Qbe, value_name = "CPU")]
    cpu: Target,
    /// produce this output file
    #[arg(short = 'o', value_name = "OUTFILE")]
    output: Option<PathBuf>,
    /// the peephole rules file for the 6809
    #[arg(long, value_name = "FILE")]
    rules: Option<PathBuf>,
    /// the files to compile, assemble or link
    #[arg(required = true)]
    files: Vec<PathBuf>,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let last_phase = if args.preprocess_only {
        LastPhase::Preprocess
    } else if args.asm_only {
        LastPhase::Generate
    } else if args.compile_only {
        LastPhase::Assemble
    } else {
        LastPhase::Link
    };

    let opts = DriveOpts {
        verbose: args.verbose,
        last_phase,
        keep_temps: args.keep_temps,
        out_name: args.output,
        target: args.cpu,
        defines: args.defines,
        dump_ast: args.dump_ast,
        rules_path: args.rules,
    };

    let mut driver = Driver::new(opts);
    match driver.run(&args.files) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err}");
            ExitCode::FAILURE
        }
    }
}
