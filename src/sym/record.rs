use anyhow::{anyhow, ensure, Result};

use std::io::Write;

use crate::reader::{RecordBufRead, RecordWrite};
use crate::sym::{Sym, SymClass, SymId, SymKind, SymTab};
use crate::target::Target;
use crate::types::Prim;

const TAG_SEPARATOR: u8 = 0;
const TAG_SYMBOL: u8 = 1;

const FLAG_HAS_ADDR: u8 = 1 << 0;
const FLAG_VARIADIC: u8 = 1 << 1;
const FLAG_HAS_INIT: u8 = 1 << 2;

/// One record of the symbol file: either a symbol (with its members
/// nested behind it) or the separator that divides top-level entities.
#[derive(Debug, PartialEq)]
pub enum SymRecord {
    Separator,
    Symbol(Sym),
}

/// Serialise one symbol: the fixed-width fields, the name, the
/// initialiser list if any, then the members.
pub fn write_sym<W: Write>(out: &mut W, sym: &Sym) -> Result<()> {
    out.write_u8(TAG_SYMBOL)?;
    out.write_u32(sym.id.0)?;
    out.write_u16(sym.prim.into_raw())?;
    out.write_u8(sym.kind.into())?;
    out.write_u8(sym.class.into())?;
    out.write_u32(sym.ctype.map(|c| c.0).unwrap_or(0))?;
    out.write_i64(sym.size)?;
    out.write_i64(sym.nelems)?;
    out.write_i64(sym.posn)?;

    let mut flags = 0;
    if sym.has_addr {
        flags |= FLAG_HAS_ADDR;
    }
    if sym.variadic {
        flags |= FLAG_VARIADIC;
    }
    if sym.init_list.is_some() {
        flags |= FLAG_HAS_INIT;
    }
    out.write_u8(flags)?;
    out.write_cstr(&sym.name)?;

    if let Some(init) = &sym.init_list {
        out.write_u32(u32::try_from(init.len())?)?;
        for value in init {
            out.write_i32(*value)?;
        }
    }

    out.write_u32(u32::try_from(sym.members.len())?)?;
    for member in &sym.members {
        write_sym(out, member)?;
    }
    Ok(())
}

fn write_separator<W: Write>(out: &mut W) -> Result<()> {
    out.write_u8(TAG_SEPARATOR)
}

/// Read the next record from the symbol file; None at EOF.
pub fn read_record<R: RecordBufRead>(input: &mut R) -> Result<Option<SymRecord>> {
    let Some(tag) = input.fill_buf()?.first().copied() else {
        return Ok(None);
    };
    input.consume(1);
    match tag {
        TAG_SEPARATOR => Ok(Some(SymRecord::Separator)),
        TAG_SYMBOL => Ok(Some(SymRecord::Symbol(read_sym(input)?))),
        other => Err(anyhow!("Invalid symbol record tag {other:#04x}")),
    }
}

fn read_sym<R: RecordBufRead>(input: &mut R) -> Result<Sym> {
    let id = SymId(input.read_u32()?);
    let prim = Prim::from_raw(input.read_u16()?)?;
    let kind = SymKind::try_from(input.read_u8()?)
        .map_err(|e| anyhow!("Invalid symbol kind: {e}"))?;
    let class = SymClass::try_from(input.read_u8()?)
        .map_err(|e| anyhow!("Invalid symbol class: {e}"))?;
    let ctype = match input.read_u32()? {
        0 => None,
        c => Some(SymId(c)),
    };
    let size = input.read_i64()?;
    let nelems = input.read_i64()?;
    let posn = input.read_i64()?;
    let flags = input.read_u8()?;
    let name = input.read_cstr()?;

    let init_list = if flags & FLAG_HAS_INIT != 0 {
        let count = input.read_u32()? as usize;
        let mut init = Vec::with_capacity(count);
        for _ in 0..count {
            init.push(input.read_i32()?);
        }
        Some(init)
    } else {
        None
    };

    let n_members = input.read_u32()? as usize;
    let mut members = Vec::with_capacity(n_members);
    for _ in 0..n_members {
        let tag = input.read_u8()?;
        ensure!(tag == TAG_SYMBOL, "Member record with a bad tag {tag}");
        members.push(read_sym(input)?);
    }

    Ok(Sym {
        name,
        id,
        prim,
        ctype,
        kind,
        class,
        size,
        nelems,
        variadic: flags & FLAG_VARIADIC != 0,
        has_addr: flags & FLAG_HAS_ADDR != 0,
        posn,
        init_list,
        members,
    })
}

/// Flush the whole symbol table: types first, then variables and
/// functions, a separator after each top-level record.
pub fn write_symtab<W: Write>(out: &mut W, tab: &SymTab) -> Result<()> {
    for sym in tab.types.iter().chain(tab.globals.iter()) {
        write_sym(out, sym)?;
        write_separator(out)?;
    }
    Ok(())
}

/// Load a symbol file back into an in-memory table, for the code
/// generator phase.
pub fn load_symtab<R: RecordBufRead>(input: &mut R, target: Target) -> Result<SymTab> {
    let mut tab = SymTab::new(target);
    let mut max_id = 0;
    while let Some(record) = read_record(input)? {
        let SymRecord::Symbol(sym) = record else {
            continue;
        };
        fn highest_id(sym: &Sym) -> u32 {
            sym.members
                .iter()
                .map(highest_id)
                .max()
                .unwrap_or(0)
                .max(sym.id.0)
        }
        max_id = max_id.max(highest_id(&sym));
        if sym.kind.is_type() || sym.kind == SymKind::EnumValue {
            tab.types.push(sym);
        } else {
            tab.globals.push(sym);
        }
    }
    tab.next_id = max_id;
    Ok(tab)
}
