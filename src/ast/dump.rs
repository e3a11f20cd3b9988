use anyhow::Result;

use std::io::Write;

use crate::ast::serial::AstLoader;
use crate::ast::{Node, Op};

/// Labels invented purely for the dump output.
struct DumpState {
    next_label: u32,
    show_glue: bool,
}

impl DumpState {
    fn label(&mut self) -> u32 {
        self.next_label += 1;
        self.next_label
    }
}

fn indent(out: &mut impl Write, level: i32) -> Result<()> {
    for _ in 0..level {
        write!(out, " ")?;
    }
    Ok(())
}

/// Print one node and recursively its children, loaded by id.
fn dump_node(
    loader: &mut AstLoader,
    st: &mut DumpState,
    n: &Node,
    level: i32,
    out: &mut impl Write,
) -> Result<()> {
    let nleft = loader.load_child(n.left_id)?;
    let nmid = loader.load_child(n.mid_id)?;
    let nright = loader.load_child(n.right_id)?;

    // IF and WHILE get invented labels so the shape is readable
    match n.op {
        Op::If => {
            let _l_false = st.label();
            indent(out, level)?;
            write!(out, "IF")?;
            if nright.is_some() {
                write!(out, ", end L{}", st.label())?;
            }
            writeln!(out, " (id {})", n.id.0)?;
            for child in [&nleft, &nmid, &nright].into_iter().flatten() {
                dump_node(loader, st, child, level + 2, out)?;
            }
            return Ok(());
        }
        Op::While => {
            indent(out, level)?;
            writeln!(out, "WHILE start L{} (id {})", st.label(), n.id.0)?;
            for child in [&nleft, &nright].into_iter().flatten() {
                dump_node(loader, st, child, level + 2, out)?;
            }
            return Ok(());
        }
        _ => {}
    }

    let mut level = level;
    if n.op == Op::Glue {
        if st.show_glue {
            writeln!(
                out,
                "glue {} {}",
                n.left_id.map(|i| i.0).unwrap_or(0),
                n.right_id.map(|i| i.0).unwrap_or(0)
            )?;
        }
        level -= 2;
    } else {
        indent(out, level)?;
        write!(out, "{}", format!("{:?}", n.op).to_uppercase())?;
        if let Some(sym) = n.sym {
            write!(out, " symid {}", sym.0)?;
        }
        match n.op {
            Op::Function | Op::FuncCall | Op::Addr | Op::PreInc | Op::PostInc => {
                if let Some(name) = &n.name {
                    write!(out, " {}", name)?;
                }
            }
            Op::IntLit => write!(out, " {}", n.value)?,
            Op::StrLit => {
                write!(out, " rval \"{}\"", n.name.as_deref().unwrap_or(""))?;
            }
            Op::Ident => {
                if let Some(name) = &n.name {
                    if n.rvalue {
                        write!(out, " rval {}", name)?;
                    } else {
                        write!(out, " {}", name)?;
                    }
                }
            }
            Op::Deref => {
                if n.rvalue {
                    write!(out, " rval")?;
                }
            }
            Op::Scale => write!(out, " {}", n.value)?,
            Op::Case => write!(out, " {}", n.value)?,
            Op::Cast => write!(out, " {}", n.prim)?,
            _ => {}
        }
        writeln!(out, " (id {})", n.id.0)?;
    }

    for child in [&nleft, &nmid, &nright].into_iter().flatten() {
        dump_node(loader, st, child, level + 2, out)?;
    }
    Ok(())
}

/// Dump every function tree in the AST file.
pub fn dump_functions(
    loader: &mut AstLoader,
    show_glue: bool,
    out: &mut impl Write,
) -> Result<()> {
    let mut st = DumpState {
        next_label: 0,
        show_glue,
    };
    while let Some(node) = loader.next_function()? {
        dump_node(loader, &mut st, &node, 0, out)?;
        writeln!(out)?;
        writeln!(out)?;
    }
    Ok(())
}
