use anyhow::{anyhow, bail, Context, Result};

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::ast::serial::AstLoader;
use crate::gen::m6809::M6809Backend;
use crate::gen::qbe::QbeBackend;
use crate::gen::{Backend, GenState};
use crate::parse::parse_phase;
use crate::peep::peephole_phase;
use crate::scan::scan_phase;
use crate::sym::record::load_symtab;
use crate::target::Target;

/// The external programs and objects each target's pipeline uses.
struct PhaseCmds {
    cpp: &'static str,
    /// Translates the generator's output to assembly, if the target
    /// needs one (the IL target runs `qbe`).
    translate: Option<&'static str>,
    assembler: &'static str,
    linker: &'static str,
    pre_objs: &'static [&'static str],
    post_objs: &'static [&'static str],
}

const QBE_CMDS: PhaseCmds = PhaseCmds {
    cpp: "cpp",
    translate: Some("qbe"),
    assembler: "as",
    linker: "cc",
    pre_objs: &[],
    post_objs: &[],
};

const M6809_CMDS: PhaseCmds = PhaseCmds {
    cpp: "cpp",
    translate: None,
    assembler: "as6809",
    linker: "ld6809",
    pre_objs: &["/opt/mcc/lib/6809/crt0.o"],
    post_objs: &["/opt/mcc/lib/6809/libc.a", "/opt/mcc/lib/6809/lib6809.a"],
};

/// Where to stop the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LastPhase {
    Preprocess,
    Generate,
    Assemble,
    Link,
}

/// Driver options, straight from the command line.
#[derive(Debug, Clone)]
pub struct DriveOpts {
    pub verbose: bool,
    pub last_phase: LastPhase,
    pub keep_temps: bool,
    pub out_name: Option<PathBuf>,
    pub target: Target,
    pub defines: Vec<String>,
    pub dump_ast: bool,
    pub rules_path: Option<PathBuf>,
}

impl Default for DriveOpts {
    fn default() -> Self {
        Self {
            verbose: false,
            last_phase: LastPhase::Link,
            keep_temps: false,
            out_name: None,
            target: Target::Qbe,
            defines: Vec::new(),
            dump_ast: false,
            rules_path: None,
        }
    }
}

/// Sequences the compilation phases over the input files, creating
/// and cleaning up the intermediate files.
pub struct Driver {
    opts: DriveOpts,
    temps: Vec<PathBuf>,
    objs: Vec<PathBuf>,
    temp_serial: u32,
}

impl Driver {
    pub fn new(opts: DriveOpts) -> Self {
        Self {
            opts,
            temps: Vec::new(),
            objs: Vec::new(),
            temp_serial: 0,
        }
    }

    fn cmds(&self) -> &'static PhaseCmds {
        match self.opts.target {
            Target::Qbe => &QBE_CMDS,
            Target::M6809 => &M6809_CMDS,
        }
    }

    /// A fresh intermediate file: the input name plus a suffix, or a
    /// file in the temp directory when that can't be created.
    fn new_temp(&mut self, origin: &Path, suffix: &str) -> Result<PathBuf> {
        let mut name = origin.as_os_str().to_owned();
        name.push(suffix);
        let path = PathBuf::from(name);
        if File::create(&path).is_ok() {
            self.temps.push(path.clone());
            return Ok(path);
        }

        self.temp_serial += 1;
        let path = std::env::temp_dir().join(format!(
            "mcc_{}_{}{}",
            std::process::id(),
            self.temp_serial,
            suffix
        ));
        File::create(&path).with_context(|| format!("Unable to create {}", path.display()))?;
        self.temps.push(path.clone());
        Ok(path)
    }

    /// Run an external command, optionally redirecting stdin/stdout
    /// to files. A non-zero exit status stops the compilation.
    fn run_command(
        &self,
        program: &str,
        args: &[&str],
        stdin: Option<&Path>,
        stdout: Option<&Path>,
    ) -> Result<()> {
        if self.opts.verbose {
            eprintln!("Doing: {} {}", program, args.join(" "));
            if let Some(f) = stdin {
                eprintln!("  redirecting stdin from {}", f.display());
            }
            if let Some(f) = stdout {
                eprintln!("  redirecting stdout to {}", f.display());
            }
        }

        let mut cmd = Command::new(program);
        cmd.args(args);
        if let Some(f) = stdin {
            cmd.stdin(Stdio::from(
                File::open(f).with_context(|| format!("Unable to read {}", f.display()))?,
            ));
        }
        if let Some(f) = stdout {
            cmd.stdout(Stdio::from(
                File::create(f).with_context(|| format!("Unable to write {}", f.display()))?,
            ));
        }

        let status = cmd
            .status()
            .with_context(|| format!("exec {program} failed"))?;
        if !status.success() {
            bail!("{program} exited with {status}");
        }
        Ok(())
    }

    /// Run the external preprocessor over one source file.
    fn do_preprocess(&mut self, name: &Path) -> Result<Option<PathBuf>> {
        let mut args: Vec<String> = Vec::new();
        for define in &self.opts.defines {
            args.push("-D".into());
            args.push(define.clone());
        }
        args.push(name.display().to_string());
        let args: Vec<&str> = args.iter().map(String::as_str).collect();

        if self.opts.last_phase == LastPhase::Preprocess {
            let out = self.opts.out_name.clone();
            self.run_command(self.cmds().cpp, &args, None, out.as_deref())?;
            return Ok(None);
        }

        let temp = self.new_temp(name, "_cpp")?;
        self.run_command(self.cmds().cpp, &args, None, Some(&temp))?;
        Ok(Some(temp))
    }

    /// Run the in-process phases: scan, parse, generate, and for the
    /// 6809 the peephole pass. Returns the assembly file.
    fn do_compile(&mut self, origin: &Path, cpp_name: &Path) -> Result<Option<PathBuf>> {
        let target = self.opts.target;

        // Characters to tokens
        let tok_name = self.new_temp(origin, "_tok")?;
        if self.opts.verbose {
            eprintln!("Scanning {} to {}", cpp_name.display(), tok_name.display());
        }
        let cpp_in = BufReader::new(File::open(cpp_name)?);
        let mut tok_out = BufWriter::new(File::create(&tok_name)?);
        scan_phase(cpp_in, &mut tok_out).context("scan failed")?;
        tok_out.flush()?;
        drop(tok_out);

        // Tokens to the AST and symbol files
        let sym_name = self.new_temp(origin, "_sym")?;
        let ast_name = self.new_temp(origin, "_ast")?;
        if self.opts.verbose {
            eprintln!(
                "Parsing {} to {} and {}",
                tok_name.display(),
                ast_name.display(),
                sym_name.display()
            );
        }
        {
            let tok_in = BufReader::new(File::open(&tok_name)?);
            let ast_out = BufWriter::new(File::create(&ast_name)?);
            let mut sym_out = BufWriter::new(File::create(&sym_name)?);
            parse_phase(tok_in, ast_out, &mut sym_out, target).context("parse failed")?;
            sym_out.flush()?;
        }

        let idx_name = self.new_temp(origin, "_idx")?;

        if self.opts.dump_ast {
            let mut loader = AstLoader::open(&ast_name, &idx_name)?;
            crate::ast::dump::dump_functions(&mut loader, false, &mut std::io::stdout().lock())?;
        }

        // Where the assembly ends up
        let asm_name = if self.opts.last_phase == LastPhase::Generate {
            match &self.opts.out_name {
                Some(name) => name.clone(),
                None => origin.with_extension("s"),
            }
        } else {
            self.new_temp(origin, "_s")?
        };

        // The AST and symbol files to IL or assembly
        let gen_name = self.new_temp(origin, "_gen")?;
        if self.opts.verbose {
            eprintln!("Generating {} to {}", ast_name.display(), gen_name.display());
        }
        {
            let mut sym_in = BufReader::new(File::open(&sym_name)?);
            let syms = load_symtab(&mut sym_in, target)?;
            let loader = AstLoader::open(&ast_name, &idx_name)?;
            let out = BufWriter::new(File::create(&gen_name)?);
            match target {
                Target::Qbe => run_generate(syms, loader, QbeBackend::new(out))?,
                Target::M6809 => run_generate(syms, loader, M6809Backend::new(out))?,
            }
        }

        match target {
            Target::Qbe => {
                // The IL still has to be translated to assembly
                let translate = self.cmds().translate.unwrap();
                self.run_command(
                    translate,
                    &[
                        "-o",
                        &asm_name.display().to_string(),
                        &gen_name.display().to_string(),
                    ],
                    None,
                    None,
                )?;
            }
            Target::M6809 => {
                let rules_path = self
                    .opts
                    .rules_path
                    .clone()
                    .unwrap_or_else(|| PathBuf::from("rules/6809.rules"));
                if self.opts.verbose {
                    eprintln!(
                        "Peephole {} to {} with {}",
                        gen_name.display(),
                        asm_name.display(),
                        rules_path.display()
                    );
                }
                let rules = std::fs::read_to_string(&rules_path)
                    .with_context(|| format!("Can't open rules file {}", rules_path.display()))?;
                let asm_in = std::fs::read_to_string(&gen_name)?;
                let optimised = peephole_phase(&asm_in, &rules).context("peephole failed")?;
                std::fs::write(&asm_name, optimised)?;
            }
        }

        if self.opts.last_phase == LastPhase::Generate {
            return Ok(None);
        }
        Ok(Some(asm_name))
    }

    /// Assemble one file to an object file.
    fn do_assemble(&mut self, name: &Path) -> Result<Option<PathBuf>> {
        let obj_name = if self.opts.last_phase == LastPhase::Assemble {
            match &self.opts.out_name {
                Some(out) => out.clone(),
                None => name.with_extension("o"),
            }
        } else {
            self.new_temp(name, "_o")?
        };

        self.run_command(
            self.cmds().assembler,
            &[
                "-o",
                &obj_name.display().to_string(),
                &name.display().to_string(),
            ],
            None,
            None,
        )?;

        if self.opts.last_phase == LastPhase::Assemble {
            return Ok(None);
        }
        Ok(Some(obj_name))
    }

    /// Link everything into the final executable.
    fn do_link(&mut self) -> Result<()> {
        let out_name = self
            .opts
            .out_name
            .clone()
            .unwrap_or_else(|| PathBuf::from("a.out"));

        let mut args: Vec<String> = vec!["-o".into(), out_name.display().to_string()];
        for obj in self.cmds().pre_objs {
            args.push((*obj).into());
        }
        for obj in &self.objs {
            args.push(obj.display().to_string());
        }
        for obj in self.cmds().post_objs {
            args.push((*obj).into());
        }

        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run_command(self.cmds().linker, &args, None, None)
    }

    /// Compile, assemble and link the given files. `.c` files go
    /// through the whole pipeline, `.s` files are assembled, `.o`
    /// files go straight to the linker.
    pub fn run(&mut self, files: &[PathBuf]) -> Result<()> {
        for file in files {
            let ext = file.extension().and_then(|e| e.to_str());
            match ext {
                Some("c") => {
                    let Some(cpp_name) = self.do_preprocess(file)? else {
                        continue;
                    };
                    let Some(asm_name) = self.do_compile(file, &cpp_name)? else {
                        continue;
                    };
                    let Some(obj_name) = self.do_assemble(&asm_name)? else {
                        continue;
                    };
                    self.objs.push(obj_name);
                }
                Some("s") => {
                    if let Some(obj_name) = self.do_assemble(file)? {
                        self.objs.push(obj_name);
                    }
                }
                Some("o") => self.objs.push(file.clone()),
                _ => bail!("Input file with unrecognised suffix: {}", file.display()),
            }
        }

        if self.opts.last_phase == LastPhase::Link && !self.objs.is_empty() {
            self.do_link()?;
        }
        Ok(())
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        if self.opts.keep_temps {
            return;
        }
        for temp in &self.temps {
            let _ = std::fs::remove_file(temp);
        }
    }
}

/// Generate code with the given backend over loaded symbol and AST
/// files.
pub fn run_generate<B: Backend>(
    syms: crate::sym::SymTab,
    loader: AstLoader,
    cg: B,
) -> Result<()> {
    let mut state = GenState::new(syms, loader, cg);
    state.generate()
}

/// Helper for the tools binary: a throwaway index file next to the
/// temp directory.
pub fn scratch_index_path() -> PathBuf {
    std::env::temp_dir().join(format!("mcc_idx_{}", std::process::id()))
}

/// Convenience used by tests: run scanner, parser and generator over
/// a source string already run through the preprocessor, returning
/// the generated IL or assembly.
pub fn compile_to_text(source: &str, target: Target) -> Result<String> {
    let mut tokens = Vec::new();
    scan_phase(BufReader::new(source.as_bytes()), &mut tokens)?;

    let mut ast_bytes = Vec::new();
    let mut sym_bytes = Vec::new();
    parse_phase(
        BufReader::new(&tokens[..]),
        &mut ast_bytes,
        &mut sym_bytes,
        target,
    )?;

    // The loader works on files: park the AST in the temp directory
    static SERIAL: std::sync::atomic::AtomicU32 = std::sync::atomic::AtomicU32::new(0);
    let serial = SERIAL.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    let ast_path = std::env::temp_dir().join(format!(
        "mcc_text_ast_{}_{}",
        std::process::id(),
        serial
    ));
    let idx_path = std::env::temp_dir().join(format!(
        "mcc_text_idx_{}_{}",
        std::process::id(),
        serial
    ));
    std::fs::write(&ast_path, &ast_bytes)?;

    let mut sym_in = BufReader::new(&sym_bytes[..]);
    let syms = load_symtab(&mut sym_in, target)?;
    let loader = AstLoader::open(&ast_path, &idx_path)?;

    let mut out = Vec::new();
    match target {
        Target::Qbe => run_generate(syms, loader, QbeBackend::new(&mut out))?,
        Target::M6809 => run_generate(syms, loader, M6809Backend::new(&mut out))?,
    }

    let _ = std::fs::remove_file(&ast_path);
    let _ = std::fs::remove_file(&idx_path);

    String::from_utf8(out).map_err(|e| anyhow!("Generated text is not UTF-8: {e}"))
}
