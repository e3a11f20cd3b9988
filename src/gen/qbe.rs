use anyhow::{anyhow, bail, Result};

use std::io::Write;

use crate::ast::Op;
use crate::gen::{Backend, Reg};
use crate::sym::{Sym, SymClass, SymKind};
use crate::target::Target;
use crate::types::{type_size, Prim};
use crate::{Label, LabelAlloc};

/// Code generator emitting the QBE intermediate language. Every value
/// lands in a fresh single-assignment temporary; temporaries are never
/// reused, so register management is trivial.
pub struct QbeBackend<W> {
    out: W,
    labels: LabelAlloc,
    next_temp: u32,
    /// Literal strings can't appear in the middle of code; they are
    /// collected here and dumped at the postamble.
    strings: Vec<(Label, String)>,
}

/// The comparison instructions in Eq..Ge order, and their inversions.
const CMP: [&str; 6] = ["ceq", "cne", "cslt", "csgt", "csle", "csge"];
const INV_CMP: [&str; 6] = ["cne", "ceq", "csge", "csle", "csgt", "cslt"];

fn cmp_index(op: Op) -> Result<usize> {
    if !op.is_comparison() {
        bail!("Bad operator {op:?} in comparison");
    }
    Ok(u8::from(op) as usize - u8::from(Op::Eq) as usize)
}

impl<W: Write> QbeBackend<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            labels: LabelAlloc::new(),
            next_temp: 0,
            strings: Vec::new(),
        }
    }

    /// The QBE base type character for a primitive type. Chars live
    /// in 'w' registers and are only byte-sized in memory.
    fn qbe_type(&self, prim: Prim) -> Result<char> {
        if prim.is_ptr() {
            return Ok('l');
        }
        match prim {
            Prim::VOID => Ok(' '),
            Prim::CHAR | Prim::INT => Ok('w'),
            Prim::LONG => Ok('l'),
            _ => Err(anyhow!("Bad type {prim} in qbe_type")),
        }
    }

    fn prim_size(&self, prim: Prim) -> Result<i64> {
        Target::Qbe.prim_size(prim)
    }

    fn alloc_temp(&mut self) -> Reg {
        self.next_temp += 1;
        Reg(self.next_temp)
    }

    /// The '$' or '%' sigil for a symbol reference.
    fn sigil(sym: &Sym) -> char {
        match sym.class {
            SymClass::Global | SymClass::Static | SymClass::Extern => '$',
            _ => '%',
        }
    }

    /// Load or store a memory-resident variable around an increment.
    fn emit_mem_incdec(&mut self, sym: &Sym, sigil: char, offset: i64) -> Result<()> {
        let t = self.alloc_temp();
        match self.prim_size(sym.prim)? {
            1 => {
                writeln!(self.out, "  %.t{} =w loadub {}{}", t.0, sigil, sym.name)?;
                writeln!(self.out, "  %.t{} =w add %.t{}, {}", t.0, t.0, offset)?;
                writeln!(self.out, "  storeb %.t{}, {}{}", t.0, sigil, sym.name)?;
            }
            4 => {
                writeln!(self.out, "  %.t{} =w loadsw {}{}", t.0, sigil, sym.name)?;
                writeln!(self.out, "  %.t{} =w add %.t{}, {}", t.0, t.0, offset)?;
                writeln!(self.out, "  storew %.t{}, {}{}", t.0, sigil, sym.name)?;
            }
            _ => {
                writeln!(self.out, "  %.t{} =l loadl {}{}", t.0, sigil, sym.name)?;
                writeln!(self.out, "  %.t{} =l add %.t{}, {}", t.0, t.0, offset)?;
                writeln!(self.out, "  storel %.t{}, {}{}", t.0, sigil, sym.name)?;
            }
        }
        Ok(())
    }

    fn binary(&mut self, name: &str, r1: Reg, r2: Reg, prim: Prim) -> Result<Reg> {
        let q = self.qbe_type(prim)?;
        writeln!(
            self.out,
            "  %.t{} ={} {} %.t{}, %.t{}",
            r1.0, q, name, r1.0, r2.0
        )?;
        Ok(r1)
    }
}

impl<W: Write> Backend for QbeBackend<W> {
    fn target(&self) -> Target {
        Target::Qbe
    }

    fn new_label(&mut self) -> Label {
        self.labels.next()
    }

    fn preamble(&mut self) -> Result<()> {
        self.strings.clear();
        Ok(())
    }

    fn postamble(&mut self) -> Result<()> {
        let strings = std::mem::take(&mut self.strings);
        for (label, text) in strings {
            write!(self.out, "data $L{} = {{ ", label.0)?;
            for byte in text.bytes() {
                write!(self.out, "b {}, ", byte)?;
            }
            writeln!(self.out, " b 0 }}")?;
        }
        self.out.flush()?;
        Ok(())
    }

    fn func_preamble(&mut self, sym: &mut Sym) -> Result<()> {
        if sym.class == SymClass::Global {
            write!(self.out, "export ")?;
        }
        write!(
            self.out,
            "function {} ${}(",
            self.qbe_type(sym.prim)?,
            sym.name
        )?;

        // Every parameter gets a stack slot so that narrow stores and
        // address-taking both work; the incoming value arrives in a
        // '.p' temporary and is copied into the slot below.
        for parm in sym.members.iter_mut() {
            if parm.class != SymClass::Param {
                break;
            }
            parm.has_addr = true;
            write!(self.out, "{} %.p{}, ", self.qbe_type(parm.prim)?, parm.name)?;
        }
        writeln!(self.out, ") {{")?;

        let label = self.new_label();
        self.label(label)?;

        let mut in_params = true;
        for var in sym.members.iter_mut() {
            if var.class == SymClass::Local {
                in_params = false;
            }
            if in_params {
                let size = Target::Qbe.prim_size(var.prim)?;
                let slot_size = if size < 4 { 4 } else { size };
                writeln!(
                    self.out,
                    "  %{} =l alloc{} {}",
                    var.name, slot_size, slot_size
                )?;
                match size {
                    1 => writeln!(self.out, "  storeb %.p{}, %{}", var.name, var.name)?,
                    4 => writeln!(self.out, "  storew %.p{}, %{}", var.name, var.name)?,
                    _ => writeln!(self.out, "  storel %.p{}, %{}", var.name, var.name)?,
                }
                continue;
            }

            // Locals whose address is used live on the stack, as do
            // chars, which QBE can only truncate through memory
            if var.has_addr {
                writeln!(self.out, "  %{} =l alloc8 {}", var.name, var.size.max(1))?;
            } else if var.prim == Prim::CHAR {
                var.has_addr = true;
                writeln!(self.out, "  %{} =l alloc4 4", var.name)?;
            }
        }
        Ok(())
    }

    fn func_postamble(&mut self, sym: &Sym) -> Result<()> {
        self.label(Label(sym.posn as u32))?;
        if sym.prim != Prim::VOID {
            writeln!(self.out, "  ret %.ret")?;
        } else {
            writeln!(self.out, "  ret")?;
        }
        writeln!(self.out, "}}")?;
        Ok(())
    }

    fn free_all_regs(&mut self, _keep: Option<Reg>) -> Result<()> {
        Ok(())
    }

    fn alloc_reg(&mut self, _prim: Prim) -> Result<Reg> {
        Ok(self.alloc_temp())
    }

    fn free_reg(&mut self, _reg: Reg) -> Result<()> {
        Ok(())
    }

    fn load_int(&mut self, value: i64, prim: Prim) -> Result<Reg> {
        let t = self.alloc_temp();
        writeln!(self.out, "  %.t{} ={} copy {}", t.0, self.qbe_type(prim)?, value)?;
        Ok(t)
    }

    fn load_var(&mut self, sym: &Sym, op: Option<Op>) -> Result<Reg> {
        let r = self.alloc_temp();
        let sigil = Self::sigil(sym);

        // Pointers step by the size of what they point to
        let mut offset = 1;
        if sym.prim.is_ptr() {
            offset = self.prim_size(sym.prim.value_at()?)?;
        }
        if matches!(op, Some(Op::PreDec) | Some(Op::PostDec)) {
            offset = -offset;
        }

        let in_memory = sym.has_addr || sigil == '$';

        if matches!(op, Some(Op::PreInc) | Some(Op::PreDec)) {
            if in_memory {
                self.emit_mem_incdec(sym, sigil, offset)?;
            } else {
                writeln!(
                    self.out,
                    "  {}{} ={} add {}{}, {}",
                    sigil,
                    sym.name,
                    self.qbe_type(sym.prim)?,
                    sigil,
                    sym.name,
                    offset
                )?;
            }
        }

        if in_memory {
            match self.prim_size(sym.prim)? {
                1 => writeln!(self.out, "  %.t{} =w loadub {}{}", r.0, sigil, sym.name)?,
                4 => writeln!(self.out, "  %.t{} =w loadsw {}{}", r.0, sigil, sym.name)?,
                _ => writeln!(self.out, "  %.t{} =l loadl {}{}", r.0, sigil, sym.name)?,
            }
        } else {
            writeln!(
                self.out,
                "  %.t{} ={} copy {}{}",
                r.0,
                self.qbe_type(sym.prim)?,
                sigil,
                sym.name
            )?;
        }

        if matches!(op, Some(Op::PostInc) | Some(Op::PostDec)) {
            if in_memory {
                self.emit_mem_incdec(sym, sigil, offset)?;
            } else {
                writeln!(
                    self.out,
                    "  {}{} ={} add {}{}, {}",
                    sigil,
                    sym.name,
                    self.qbe_type(sym.prim)?,
                    sigil,
                    sym.name,
                    offset
                )?;
            }
        }

        Ok(r)
    }

    fn load_str_addr(&mut self, label: Label) -> Result<Reg> {
        let r = self.alloc_temp();
        writeln!(self.out, "  %.t{} =l copy $L{}", r.0, label.0)?;
        Ok(r)
    }

    fn add(&mut self, r1: Reg, r2: Reg, prim: Prim) -> Result<Reg> {
        self.binary("add", r1, r2, prim)
    }

    fn sub(&mut self, r1: Reg, r2: Reg, prim: Prim) -> Result<Reg> {
        self.binary("sub", r1, r2, prim)
    }

    fn mul(&mut self, r1: Reg, r2: Reg, prim: Prim) -> Result<Reg> {
        self.binary("mul", r1, r2, prim)
    }

    fn div(&mut self, r1: Reg, r2: Reg, prim: Prim) -> Result<Reg> {
        self.binary("div", r1, r2, prim)
    }

    fn modulo(&mut self, r1: Reg, r2: Reg, prim: Prim) -> Result<Reg> {
        self.binary("rem", r1, r2, prim)
    }

    fn bit_and(&mut self, r1: Reg, r2: Reg, prim: Prim) -> Result<Reg> {
        self.binary("and", r1, r2, prim)
    }

    fn bit_or(&mut self, r1: Reg, r2: Reg, prim: Prim) -> Result<Reg> {
        self.binary("or", r1, r2, prim)
    }

    fn bit_xor(&mut self, r1: Reg, r2: Reg, prim: Prim) -> Result<Reg> {
        self.binary("xor", r1, r2, prim)
    }

    fn shl(&mut self, r1: Reg, r2: Reg, prim: Prim) -> Result<Reg> {
        self.binary("shl", r1, r2, prim)
    }

    fn shr(&mut self, r1: Reg, r2: Reg, prim: Prim) -> Result<Reg> {
        self.binary("shr", r1, r2, prim)
    }

    fn negate(&mut self, r: Reg, prim: Prim) -> Result<Reg> {
        let q = self.qbe_type(prim)?;
        writeln!(self.out, "  %.t{} ={} sub 0, %.t{}", r.0, q, r.0)?;
        Ok(r)
    }

    fn invert(&mut self, r: Reg, prim: Prim) -> Result<Reg> {
        let q = self.qbe_type(prim)?;
        writeln!(self.out, "  %.t{} ={} xor %.t{}, -1", r.0, q, r.0)?;
        Ok(r)
    }

    fn lognot(&mut self, r: Reg, prim: Prim) -> Result<Reg> {
        let q = self.qbe_type(prim)?;
        writeln!(self.out, "  %.t{} ={} ceq{} %.t{}, 0", r.0, q, q, r.0)?;
        Ok(r)
    }

    fn shl_const(&mut self, r: Reg, amount: i64, prim: Prim) -> Result<Reg> {
        let t = self.alloc_temp();
        writeln!(
            self.out,
            "  %.t{} ={} shl %.t{}, {}",
            t.0,
            self.qbe_type(prim)?,
            r.0,
            amount
        )?;
        Ok(t)
    }

    fn compare_and_set(&mut self, op: Op, r1: Reg, r2: Reg, prim: Prim) -> Result<Reg> {
        let q = self.qbe_type(prim)?;
        let r3 = self.alloc_temp();
        writeln!(
            self.out,
            "  %.t{} ={} {}{} %.t{}, %.t{}",
            r3.0,
            q,
            CMP[cmp_index(op)?],
            q,
            r1.0,
            r2.0
        )?;
        Ok(r3)
    }

    fn compare_and_jump(
        &mut self,
        op: Op,
        parent: Option<Op>,
        r1: Reg,
        r2: Reg,
        label: Label,
        prim: Prim,
    ) -> Result<()> {
        let q = self.qbe_type(prim)?;
        let cmp = if parent == Some(Op::LogOr) {
            CMP[cmp_index(op)?]
        } else {
            INV_CMP[cmp_index(op)?]
        };

        // The fall-through block needs its own label: QBE rejects two
        // adjacent jumps
        let next = self.new_label();
        let r3 = self.alloc_temp();
        writeln!(
            self.out,
            "  %.t{} ={} {}{} %.t{}, %.t{}",
            r3.0, q, cmp, q, r1.0, r2.0
        )?;
        writeln!(self.out, "  jnz %.t{}, @L{}, @L{}", r3.0, label.0, next.0)?;
        self.label(next)?;
        Ok(())
    }

    fn boolean(
        &mut self,
        r: Reg,
        parent: Option<Op>,
        label: Option<Label>,
        prim: Prim,
    ) -> Result<Option<Reg>> {
        let next = self.new_label();
        let r2 = self.alloc_temp();
        writeln!(
            self.out,
            "  %.t{} =l cne{} %.t{}, 0",
            r2.0,
            self.qbe_type(prim)?,
            r.0
        )?;

        match parent {
            Some(Op::If) | Some(Op::While) | Some(Op::Ternary) | Some(Op::LogAnd) => {
                let label = label.ok_or_else(|| anyhow!("boolean jump with no label"))?;
                writeln!(self.out, "  jnz %.t{}, @L{}, @L{}", r2.0, next.0, label.0)?;
            }
            Some(Op::LogOr) => {
                let label = label.ok_or_else(|| anyhow!("boolean jump with no label"))?;
                writeln!(self.out, "  jnz %.t{}, @L{}, @L{}", r2.0, label.0, next.0)?;
            }
            _ => {}
        }
        self.label(next)?;
        Ok(Some(r2))
    }

    fn load_boolean(&mut self, r: Option<Reg>, value: i64, prim: Prim) -> Result<Reg> {
        let r = match r {
            Some(r) => r,
            None => self.alloc_temp(),
        };
        writeln!(self.out, "  %.t{} ={} copy {}", r.0, self.qbe_type(prim)?, value)?;
        Ok(r)
    }

    fn call(&mut self, sym: &Sym, args: &[(Reg, Prim)]) -> Result<Option<Reg>> {
        let out_reg = self.alloc_temp();

        if sym.prim == Prim::VOID {
            write!(self.out, "  call ${}(", sym.name)?;
        } else {
            write!(
                self.out,
                "  %.t{} ={} call ${}(",
                out_reg.0,
                self.qbe_type(sym.prim)?,
                sym.name
            )?;
        }

        // The handles arrive right-to-left; print them first-to-last
        for (reg, prim) in args.iter().rev() {
            write!(self.out, "{} %.t{}, ", self.qbe_type(*prim)?, reg.0)?;
        }
        writeln!(self.out, ")")?;

        if sym.prim == Prim::VOID {
            Ok(None)
        } else {
            Ok(Some(out_reg))
        }
    }

    fn gen_return(&mut self, r: Option<Reg>, sym: &Sym) -> Result<()> {
        if let Some(r) = r {
            writeln!(
                self.out,
                "  %.ret ={} copy %.t{}",
                self.qbe_type(sym.prim)?,
                r.0
            )?;
        }
        self.jump(Label(sym.posn as u32))
    }

    fn widen(&mut self, r: Reg, old: Prim, new: Prim) -> Result<Reg> {
        let t = self.alloc_temp();
        let newq = self.qbe_type(new)?;
        if old == Prim::CHAR {
            writeln!(self.out, "  %.t{} ={} extub %.t{}", t.0, newq, r.0)?;
        } else {
            let oldq = self.qbe_type(old)?;
            writeln!(self.out, "  %.t{} ={} exts{} %.t{}", t.0, newq, oldq, r.0)?;
        }
        Ok(t)
    }

    fn cast(&mut self, r: Reg, old: Prim, new: Prim) -> Result<Reg> {
        if new.is_ptr() {
            if old.is_ptr() {
                return Ok(r);
            }
            return self.widen(r, old, new);
        }

        let old_size = self.prim_size(old)?;
        let new_size = self.prim_size(new)?;
        if new_size == old_size {
            return Ok(r);
        }
        if new_size < old_size {
            // A copy truncates to the narrower register class
            let t = self.alloc_temp();
            writeln!(self.out, "  %.t{} ={} copy %.t{}", t.0, self.qbe_type(new)?, r.0)?;
            return Ok(t);
        }
        self.widen(r, old, new)
    }

    fn label(&mut self, l: Label) -> Result<()> {
        writeln!(self.out, "@L{}", l.0)?;
        Ok(())
    }

    fn jump(&mut self, l: Label) -> Result<()> {
        writeln!(self.out, "  jmp @L{}", l.0)?;
        // A bogus label so two jumps are never adjacent
        let next = self.new_label();
        self.label(next)
    }

    fn switch(
        &mut self,
        r: Reg,
        top: Label,
        cases: &[(i64, Label)],
        default: Label,
    ) -> Result<()> {
        // A straight compare-and-branch per case
        let rval = self.alloc_temp();
        let rcmp = self.alloc_temp();

        self.label(top)?;
        for (value, case_label) in cases {
            let next = self.new_label();
            writeln!(self.out, "  %.t{} =w copy {}", rval.0, value)?;
            writeln!(self.out, "  %.t{} =w ceqw %.t{}, %.t{}", rcmp.0, r.0, rval.0)?;
            writeln!(
                self.out,
                "  jnz %.t{}, @L{}, @L{}",
                rcmp.0, case_label.0, next.0
            )?;
            self.label(next)?;
        }
        self.jump(default)
    }

    fn address_of(&mut self, sym: &Sym) -> Result<Reg> {
        let r = self.alloc_temp();
        writeln!(self.out, "  %.t{} =l copy {}{}", r.0, Self::sigil(sym), sym.name)?;
        Ok(r)
    }

    fn deref(&mut self, r: Reg, ptr_prim: Prim) -> Result<Reg> {
        let pointee = ptr_prim.value_at()?;
        let ret = self.alloc_temp();
        match type_size(pointee, None, Target::Qbe)? {
            1 => writeln!(self.out, "  %.t{} =w loadub %.t{}", ret.0, r.0)?,
            4 => writeln!(self.out, "  %.t{} =w loadsw %.t{}", ret.0, r.0)?,
            8 => writeln!(self.out, "  %.t{} =l loadl %.t{}", ret.0, r.0)?,
            _ => bail!("Can't dereference type {ptr_prim}"),
        }
        Ok(ret)
    }

    fn store_global(&mut self, r: Reg, sym: &Sym) -> Result<Reg> {
        // Chars can be byte-stored in memory
        let q = if sym.prim == Prim::CHAR {
            'b'
        } else {
            self.qbe_type(sym.prim)?
        };
        writeln!(self.out, "  store{} %.t{}, ${}", q, r.0, sym.name)?;
        Ok(r)
    }

    fn store_local(&mut self, r: Reg, sym: &Sym) -> Result<Reg> {
        if sym.has_addr {
            let q = if sym.prim == Prim::CHAR {
                'b'
            } else {
                self.qbe_type(sym.prim)?
            };
            writeln!(self.out, "  store{} %.t{}, %{}", q, r.0, sym.name)?;
        } else {
            writeln!(
                self.out,
                "  %{} ={} copy %.t{}",
                sym.name,
                self.qbe_type(sym.prim)?,
                r.0
            )?;
        }
        Ok(r)
    }

    fn store_through(&mut self, val: Reg, ptr: Reg, prim: Prim) -> Result<Reg> {
        match self.prim_size(prim)? {
            1 => writeln!(self.out, "  storeb %.t{}, %.t{}", val.0, ptr.0)?,
            4 => writeln!(self.out, "  storew %.t{}, %.t{}", val.0, ptr.0)?,
            8 => writeln!(self.out, "  storel %.t{}, %.t{}", val.0, ptr.0)?,
            _ => bail!("Can't store through type {prim}"),
        }
        Ok(val)
    }

    fn global_sym(&mut self, sym: &Sym) -> Result<()> {
        if sym.kind == SymKind::Function {
            return Ok(());
        }

        // The element size and type, for arrays the elements'
        let (size, prim) = if sym.kind == SymKind::Array {
            let elem = sym.prim.value_at()?;
            (type_size(elem, None, Target::Qbe)?, elem)
        } else {
            (sym.size, sym.prim)
        };

        if sym.class == SymClass::Global {
            write!(self.out, "export ")?;
        }
        let align = if sym.ctype.is_none() {
            self.prim_size(prim).unwrap_or(8).max(1)
        } else {
            8
        };
        write!(self.out, "data ${} = align {} {{ ", sym.name, align)?;

        let char_ptr = Prim::CHAR.pointer_to().unwrap();
        for i in 0..sym.nelems.max(1) {
            let init = sym
                .init_list
                .as_ref()
                .and_then(|l| l.get(i as usize).copied())
                .unwrap_or(0);
            match size {
                1 => write!(self.out, "b {}, ", init)?,
                4 => write!(self.out, "w {}, ", init)?,
                8 => {
                    // A char-pointer initialiser is a string label;
                    // zero stays a null pointer
                    if sym.init_list.is_some() && prim == char_ptr && init != 0 {
                        write!(self.out, "l $L{}, ", init)?;
                    } else {
                        write!(self.out, "l {}, ", init)?;
                    }
                }
                size => write!(self.out, "z {}, ", size)?,
            }
        }
        writeln!(self.out, "}}")?;
        Ok(())
    }

    fn global_str(&mut self, label: Label, text: &str) -> Result<()> {
        self.strings.push((label, text.to_owned()));
        Ok(())
    }

    fn move_reg(&mut self, src: Reg, dst: Reg, prim: Prim) -> Result<()> {
        writeln!(
            self.out,
            "  %.t{} ={} copy %.t{}",
            dst.0,
            self.qbe_type(prim)?,
            src.0
        )?;
        Ok(())
    }

    fn line_num(&mut self, _line: i32) -> Result<()> {
        Ok(())
    }
}
