mod dump_ast;
use dump_ast::dump_ast;
mod dump_tokens;
use dump_tokens::dump_tokens;
mod dump_symbols;
use dump_symbols::dump_symbols;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

/// Inspect the compiler's inter-phase files
#[derive(Clone, Debug, Parser)]
struct Args {
    #[command(subcommand)]
    operation: Operation,
}

#[derive(Clone, Debug, Subcommand)]
enum Operation {
    /// Print the tokens of a token file
    DumpTokens(FileArgs),
    /// Print the function trees of an AST file
    DumpAst(DumpAstArgs),
    /// Print the records of a symbol file
    DumpSymbols(FileArgs),
}

#[derive(Clone, Debug, Parser)]
struct FileArgs {
    /// input filename to parse
    input: PathBuf,
}

#[derive(Clone, Debug, Parser)]
struct DumpAstArgs {
    /// input filename to parse
    input: PathBuf,
    /// also show the Glue nodes
    #[arg(short, long)]
    glue: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    match &args.operation {
        Operation::DumpTokens(file) => dump_tokens(&file.input),
        Operation::DumpAst(ast_args) => dump_ast(&ast_args.input, ast_args.glue),
        Operation::DumpSymbols(file) => dump_symbols(&file.input),
    }
}
