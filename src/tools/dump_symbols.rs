use anyhow::Result;

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use mcc_rs::sym::record::{read_record, SymRecord};
use mcc_rs::sym::{Sym, SymClass, SymKind};

fn dump_sym(sym: &Sym, depth: usize) {
    print!("{}", " ".repeat(depth));
    print!("{} ", sym.prim);

    print!("{}", sym.name);
    match sym.kind {
        SymKind::Variable => {}
        SymKind::Function => print!("()"),
        SymKind::Array => print!("[]"),
        SymKind::Struct => print!(": struct"),
        SymKind::Union => print!(": union"),
        SymKind::EnumType => print!(": enum"),
        SymKind::EnumValue => print!(": enumval"),
        SymKind::Typedef => print!(": typedef"),
        SymKind::StrLit => print!(": strlit"),
    }

    print!(" id {}", sym.id.0);

    match sym.class {
        SymClass::Global => print!(": global"),
        SymClass::Extern => print!(": extern"),
        SymClass::Static => print!(": static"),
        SymClass::Local => print!(": local offset {}", sym.posn),
        SymClass::Param => print!(": param offset {}", sym.posn),
        SymClass::Member => print!(": member offset {}", sym.posn),
    }

    if sym.has_addr {
        print!(", hasaddr");
    }
    if sym.variadic {
        print!(", ...");
    }

    match sym.kind {
        SymKind::Variable => print!(", size {}", sym.size),
        SymKind::Function => print!(", {} params", sym.nelems),
        SymKind::Array => print!(", {} elems, size {}", sym.nelems, sym.size),
        _ => {}
    }

    println!(
        ", ctypeid {}, nelems {} posn {}",
        sym.ctype.map(|c| c.0).unwrap_or(0),
        sym.nelems,
        sym.posn
    );

    if let Some(init) = &sym.init_list {
        print!("{}initlist: ", " ".repeat(depth + 2));
        for value in init {
            print!("{value} ");
        }
        println!();
    }

    for member in &sym.members {
        dump_sym(member, depth + 4);
    }
}

/// Print every record of a symbol file.
pub fn dump_symbols(input: &Path) -> Result<()> {
    let mut input = BufReader::new(File::open(input)?);

    while let Some(record) = read_record(&mut input)? {
        match record {
            SymRecord::Separator => {}
            SymRecord::Symbol(sym) => dump_sym(&sym, 0),
        }
    }
    Ok(())
}
