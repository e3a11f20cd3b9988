use anyhow::Result;

use std::path::Path;

use mcc_rs::ast::dump::dump_functions;
use mcc_rs::ast::serial::AstLoader;
use mcc_rs::driver::scratch_index_path;

/// Print each function tree in an AST file. The index is built into
/// a scratch file and removed afterwards.
pub fn dump_ast(input: &Path, show_glue: bool) -> Result<()> {
    let idx_path = scratch_index_path();
    let result = (|| {
        let mut loader = AstLoader::open(input, &idx_path)?;
        dump_functions(&mut loader, show_glue, &mut std::io::stdout().lock())
    })();
    let _ = std::fs::remove_file(&idx_path);
    result
}
