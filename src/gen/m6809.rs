use anyhow::{anyhow, bail, Result};

use std::io::Write;

use crate::ast::Op;
use crate::gen::{Backend, Reg};
use crate::sym::{Sym, SymClass, SymKind};
use crate::target::Target;
use crate::types::{type_size, Prim};
use crate::{Label, LabelAlloc};

/// Where a computed value currently lives.
#[derive(Debug, Clone, PartialEq)]
enum Locn {
    Free,
    /// A global symbol, addressed by name.
    Symbol(String),
    /// A local or parameter at a frame offset.
    Local(i64),
    /// An integer constant.
    Const(i64),
    /// The address of a string literal.
    StrLabel(u32),
    /// The address of a global symbol.
    SymAddr(String),
    /// A spill slot R0, R1, ... in static memory.
    Temp(u32),
    /// Held in the D accumulator (B, D or Y:D depending on width).
    DReg,
}

/// The machine's view of a value's width.
#[derive(Debug, Clone, Copy, PartialEq)]
enum MType {
    Char,
    Int,
    Pointer,
    Long,
}

impl MType {
    fn bytes(self) -> i64 {
        match self {
            MType::Char => 1,
            MType::Int | MType::Pointer => 2,
            MType::Long => 4,
        }
    }
}

/// Which register's byte or word of a constant an operand refers to.
#[derive(Debug, Clone, Copy)]
enum Part {
    B,
    A,
    D,
    Y,
    /// High-word low byte of a 32-bit constant.
    F,
    /// High-word high byte of a 32-bit constant.
    E,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Seg {
    None,
    Text,
    Data,
    Lit,
}

const NUM_LOCNS: usize = 16;

/// Code generator for the 6809. Values are tracked as locations; at
/// most one location is in the D accumulator at a time, and loading
/// another first stashes the current holder into a static temporary.
pub struct M6809Backend<W> {
    out: W,
    labels: LabelAlloc,
    locns: Vec<(Locn, MType)>,
    d_holds: Option<usize>,
    next_temp: u32,
    /// Bytes of outstanding stack growth from pushes; local and
    /// parameter offsets are read through this. Must be zero at every
    /// function postamble.
    sp_adjust: i64,
    local_offset: i64,
    seg: Seg,
    /// Outstanding spills from location-allocator overflow.
    spills: Vec<(usize, MType)>,
    spill_rr: usize,
}

impl<W: Write> M6809Backend<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            labels: LabelAlloc::new(),
            locns: vec![(Locn::Free, MType::Int); NUM_LOCNS],
            d_holds: None,
            next_temp: 0,
            sp_adjust: 0,
            local_offset: 0,
            seg: Seg::None,
            spills: Vec::new(),
            spill_rr: 0,
        }
    }

    fn mtype(&self, prim: Prim) -> Result<MType> {
        if prim.is_ptr() {
            return Ok(MType::Pointer);
        }
        match prim {
            Prim::CHAR => Ok(MType::Char),
            Prim::INT => Ok(MType::Int),
            Prim::LONG => Ok(MType::Long),
            _ => Err(anyhow!("Bad type {prim} in mtype")),
        }
    }

    fn alloc_temp(&mut self) -> u32 {
        let t = self.next_temp;
        self.next_temp += 1;
        t
    }

    /// Format the operand for one part of a location.
    fn operand(&self, l: usize, offset: i64, part: Part) -> Result<String> {
        let (locn, _) = &self.locns[l];
        Ok(match locn {
            Locn::Symbol(name) => format!("_{name}+{offset}"),
            Locn::Local(frame) => format!("{},s", frame + offset + self.sp_adjust),
            Locn::StrLabel(id) => format!("#L{id}"),
            Locn::SymAddr(name) => format!("#_{name}"),
            Locn::Temp(n) => format!("R{n}+{offset}"),
            Locn::Const(val) => match part {
                Part::B => format!("#{}", val & 0xff),
                Part::A => format!("#{}", (val >> 8) & 0xff),
                Part::D => format!("#{}", val & 0xffff),
                Part::Y => format!("#{}", (val >> 16) & 0xffff),
                Part::F => format!("#{}", (val >> 16) & 0xff),
                Part::E => format!("#{}", (val >> 24) & 0xff),
            },
            Locn::Free | Locn::DReg => bail!("Error trying to print location {l}"),
        })
    }

    fn op2(&mut self, mnemonic: &str, l: usize, offset: i64, part: Part) -> Result<()> {
        let operand = self.operand(l, offset, part)?;
        writeln!(self.out, "\t{mnemonic} {operand}")?;
        Ok(())
    }

    /// Store D (B, D or Y:D) into a location.
    fn save_d(&mut self, l: usize) -> Result<()> {
        if self.locns[l].0 == Locn::DReg {
            return Ok(());
        }
        match self.locns[l].1 {
            MType::Char => self.op2("stb", l, 0, Part::B)?,
            MType::Int | MType::Pointer => self.op2("std", l, 0, Part::D)?,
            MType::Long => {
                self.op2("std", l, 2, Part::D)?;
                self.op2("sty", l, 0, Part::Y)?;
            }
        }
        self.d_holds = Some(l);
        Ok(())
    }

    /// If D holds a live location, move it out to a temporary.
    fn stash_d(&mut self) -> Result<()> {
        if let Some(held) = self.d_holds {
            if self.locns[held].0 == Locn::DReg {
                let t = self.alloc_temp();
                self.locns[held].0 = Locn::Temp(t);
                self.save_d(held)?;
            }
        }
        Ok(())
    }

    /// Bring a location's value into D.
    fn load_d(&mut self, l: usize) -> Result<()> {
        if self.locns[l].0 == Locn::DReg {
            return Ok(());
        }
        self.stash_d()?;

        match self.locns[l].1 {
            MType::Char => self.op2("ldb", l, 0, Part::B)?,
            MType::Int | MType::Pointer => self.op2("ldd", l, 0, Part::D)?,
            MType::Long => {
                self.op2("ldd", l, 2, Part::D)?;
                self.op2("ldy", l, 0, Part::Y)?;
            }
        }
        self.locns[l].0 = Locn::DReg;
        self.d_holds = Some(l);
        Ok(())
    }

    /// Load D and leave the Z flag describing the whole value. A
    /// fresh 8/16-bit load sets the flag itself; a 32-bit value needs
    /// both halves tested.
    fn load_d_z(&mut self, l: usize, mt: MType) -> Result<()> {
        let fresh = self.locns[l].0 != Locn::DReg;
        if fresh {
            self.load_d(l)?;
        }
        match mt {
            MType::Char => {
                if !fresh {
                    writeln!(self.out, "\tcmpb #0")?;
                }
            }
            MType::Int | MType::Pointer => {
                if !fresh {
                    writeln!(self.out, "\tcmpd #0")?;
                }
            }
            MType::Long => {
                let label = self.new_label();
                writeln!(self.out, "\tcmpd #0")?;
                writeln!(self.out, "\tbne L{}", label.0)?;
                writeln!(self.out, "\tcmpy #0")?;
                self.label(label)?;
            }
        }
        Ok(())
    }

    /// Allocate a location slot. When every slot is in use, the next
    /// round-robin victim's value is pushed on the stack and its slot
    /// reused; the matching free pops it back.
    fn alloc_locn(&mut self, locn: Locn, mt: MType) -> Result<usize> {
        if let Some(i) = self.locns.iter().position(|(l, _)| *l == Locn::Free) {
            if locn == Locn::DReg {
                self.d_holds = Some(i);
            }
            self.locns[i] = (locn, mt);
            return Ok(i);
        }

        // Spill a victim
        let victim = self.spill_rr % NUM_LOCNS;
        self.spill_rr += 1;
        let victim_mt = self.locns[victim].1;
        self.load_d(victim)?;
        match victim_mt {
            MType::Char => {
                writeln!(self.out, "\tpshs b")?;
                self.sp_adjust += 1;
            }
            MType::Int | MType::Pointer => {
                writeln!(self.out, "\tpshs d")?;
                self.sp_adjust += 2;
            }
            MType::Long => {
                writeln!(self.out, "\tpshs d")?;
                writeln!(self.out, "\tpshs y")?;
                self.sp_adjust += 4;
            }
        }
        self.spills.push((victim, victim_mt));
        self.d_holds = None;

        if locn == Locn::DReg {
            self.d_holds = Some(victim);
        }
        self.locns[victim] = (locn, mt);
        Ok(victim)
    }

    /// Free one location, restoring a spilled value into its slot if
    /// this slot was the most recent spill victim.
    fn free_locn(&mut self, l: usize) -> Result<()> {
        if self.locns[l].0 == Locn::Free {
            bail!("Error trying to free location {l}");
        }
        if self.d_holds == Some(l) {
            self.d_holds = None;
        }

        if self.spills.last().map(|s| s.0) == Some(l) {
            let (_, mt) = self.spills.pop().unwrap();
            self.stash_d()?;
            match mt {
                MType::Char => {
                    writeln!(self.out, "\tpuls b")?;
                    self.sp_adjust -= 1;
                }
                MType::Int | MType::Pointer => {
                    writeln!(self.out, "\tpuls d")?;
                    self.sp_adjust -= 2;
                }
                MType::Long => {
                    writeln!(self.out, "\tpuls y")?;
                    writeln!(self.out, "\tpuls d")?;
                    self.sp_adjust -= 4;
                }
            }
            self.locns[l] = (Locn::DReg, mt);
            self.d_holds = Some(l);
            return Ok(());
        }

        self.locns[l].0 = Locn::Free;
        Ok(())
    }

    /// Push a location's value for a call argument.
    fn push_locn(&mut self, l: usize) -> Result<()> {
        self.load_d(l)?;
        match self.locns[l].1 {
            MType::Char => {
                writeln!(self.out, "\tpshs b")?;
                self.sp_adjust += 1;
            }
            MType::Int | MType::Pointer => {
                writeln!(self.out, "\tpshs d")?;
                self.sp_adjust += 2;
            }
            MType::Long => {
                writeln!(self.out, "\tpshs d")?;
                writeln!(self.out, "\tpshs y")?;
                self.sp_adjust += 4;
            }
        }
        self.free_locn(l)?;
        self.d_holds = None;
        Ok(())
    }

    fn text_seg(&mut self) -> Result<()> {
        if self.seg != Seg::Text {
            writeln!(self.out, "\t.code")?;
            self.seg = Seg::Text;
        }
        Ok(())
    }

    fn data_seg(&mut self) -> Result<()> {
        if self.seg != Seg::Data {
            writeln!(self.out, "\t.data")?;
            self.seg = Seg::Data;
        }
        Ok(())
    }

    fn lit_seg(&mut self) -> Result<()> {
        if self.seg != Seg::Lit {
            writeln!(self.out, "\t.literal")?;
            self.seg = Seg::Lit;
        }
        Ok(())
    }

    /// Mark a location as now living in D.
    fn result_in_d(&mut self, l: usize) {
        self.locns[l].0 = Locn::DReg;
        self.d_holds = Some(l);
    }

    /// Increment the variable at a symbol by a possibly negative
    /// offset.
    fn incdec_sym(&mut self, sym: &Sym, offset: i64) -> Result<()> {
        if sym.class == SymClass::Local || sym.class == SymClass::Param {
            writeln!(self.out, "\tleax {},s", sym.posn + self.sp_adjust)?;
        } else {
            writeln!(self.out, "\tldx #_{}", sym.name)?;
        }

        match type_size(sym.prim, None, Target::M6809)? {
            1 => {
                writeln!(self.out, "\tldb #{}", offset & 0xff)?;
                writeln!(self.out, "\taddb 0,x")?;
                writeln!(self.out, "\tstb 0,x")?;
            }
            2 => {
                writeln!(self.out, "\tldd #{}", offset & 0xffff)?;
                writeln!(self.out, "\taddd 0,x")?;
                writeln!(self.out, "\tstd 0,x")?;
            }
            _ => {
                writeln!(self.out, "\tldd #{}", offset & 0xffff)?;
                writeln!(self.out, "\taddd 2,x")?;
                writeln!(self.out, "\tstd 2,x")?;
                writeln!(self.out, "\tldd 0,x")?;
                writeln!(self.out, "\tadcb #{}", (offset >> 16) & 0xff)?;
                writeln!(self.out, "\tadca #{}", (offset >> 24) & 0xff)?;
                writeln!(self.out, "\tstd 0,x")?;
            }
        }
        Ok(())
    }

    /// Binary operation via a runtime helper routine: push the first
    /// operand, load the second, call the helper.
    fn bin_helper(
        &mut self,
        l1: Reg,
        l2: Reg,
        prim: Prim,
        char_op: &str,
        int_op: &str,
        long_op: &str,
    ) -> Result<Reg> {
        let (l1, l2) = (l1.0 as usize, l2.0 as usize);
        self.load_d(l1)?;

        match self.mtype(prim)? {
            MType::Char => {
                writeln!(self.out, "\tclra")?;
                writeln!(self.out, "\tpshs d")?;
                self.sp_adjust += 2;
                self.op2("ldb", l2, 0, Part::B)?;
                writeln!(self.out, "\tlbsr {char_op}")?;
                self.sp_adjust -= 2;
            }
            MType::Int | MType::Pointer => {
                writeln!(self.out, "\tpshs d")?;
                self.sp_adjust += 2;
                self.op2("ldd", l2, 0, Part::D)?;
                writeln!(self.out, "\tlbsr {int_op}")?;
                self.sp_adjust -= 2;
            }
            MType::Long => {
                writeln!(self.out, "\tpshs d")?;
                writeln!(self.out, "\tpshs y")?;
                self.sp_adjust += 4;
                self.op2("ldy", l2, 0, Part::Y)?;
                self.op2("ldd", l2, 2, Part::D)?;
                writeln!(self.out, "\tlbsr {long_op}")?;
                self.sp_adjust -= 4;
            }
        }
        self.free_locn(l2)?;
        self.result_in_d(l1);
        Ok(Reg(l1 as u32))
    }

    /// Byte-at-a-time binary operation (and, or, eor).
    fn bin_op(&mut self, l1: Reg, l2: Reg, prim: Prim, op: &str) -> Result<Reg> {
        let (l1, l2) = (l1.0 as usize, l2.0 as usize);
        self.load_d(l1)?;

        match self.mtype(prim)? {
            MType::Char => {
                self.op2(&format!("{op}b"), l2, 0, Part::B)?;
            }
            MType::Int | MType::Pointer => {
                self.op2(&format!("{op}a"), l2, 0, Part::A)?;
                self.op2(&format!("{op}b"), l2, 1, Part::B)?;
            }
            MType::Long => {
                self.op2(&format!("{op}a"), l2, 2, Part::A)?;
                self.op2(&format!("{op}b"), l2, 3, Part::B)?;
                writeln!(self.out, "\texg y,d")?;
                self.op2(&format!("{op}a"), l2, 0, Part::E)?;
                self.op2(&format!("{op}b"), l2, 1, Part::F)?;
                writeln!(self.out, "\texg y,d")?;
            }
        }
        self.free_locn(l2)?;
        self.result_in_d(l1);
        Ok(Reg(l1 as u32))
    }

    /// The long comparison branches: for each operation the branch
    /// taken when the high words decide true, when they decide false,
    /// and the unsigned branches for the low words.
    fn long_cmp_parts(op: Op) -> Result<(Option<&'static str>, Option<&'static str>, &'static str, &'static str)>
    {
        Ok(match op {
            Op::Eq => (None, Some("bne"), "beq", "bne"),
            Op::Ne => (Some("bne"), None, "bne", "beq"),
            Op::Lt => (Some("blt"), Some("bgt"), "blo", "bhs"),
            Op::Gt => (Some("bgt"), Some("blt"), "bhi", "bls"),
            Op::Le => (Some("blt"), Some("bgt"), "bls", "bhi"),
            Op::Ge => (Some("bgt"), Some("blt"), "bhs", "blo"),
            _ => bail!("Bad operator {op:?} in comparison"),
        })
    }

    /// Compare the 32-bit value in Y:D against location l2 and branch
    /// to `target` when the comparison result equals `jump_if`.
    fn long_compare_branch(&mut self, op: Op, l2: usize, target: Label, jump_if: bool) -> Result<()> {
        let (hi_true, hi_false, lo_true, lo_false) = Self::long_cmp_parts(op)?;
        let skip = self.new_label();
        let mut skip_used = false;

        self.op2("cmpy", l2, 0, Part::Y)?;
        if jump_if {
            if let Some(b) = hi_true {
                writeln!(self.out, "\t{b} L{}", target.0)?;
            }
            if let Some(b) = hi_false {
                writeln!(self.out, "\t{b} L{}", skip.0)?;
                skip_used = true;
            }
            self.op2("cmpd", l2, 2, Part::D)?;
            writeln!(self.out, "\t{lo_true} L{}", target.0)?;
        } else {
            if let Some(b) = hi_true {
                writeln!(self.out, "\t{b} L{}", skip.0)?;
                skip_used = true;
            }
            if let Some(b) = hi_false {
                writeln!(self.out, "\t{b} L{}", target.0)?;
            }
            self.op2("cmpd", l2, 2, Part::D)?;
            writeln!(self.out, "\t{lo_false} L{}", target.0)?;
        }
        if skip_used {
            self.label(skip)?;
        }
        Ok(())
    }
}

/// The direct and inverted branch mnemonics, in Eq..Ge order.
const CMP_BRANCH: [&str; 6] = ["beq", "bne", "blt", "bgt", "ble", "bge"];
const INV_BRANCH: [&str; 6] = ["bne", "beq", "bge", "ble", "bgt", "blt"];

fn cmp_index(op: Op) -> Result<usize> {
    if !op.is_comparison() {
        bail!("Bad operator {op:?} in comparison");
    }
    Ok(u8::from(op) as usize - u8::from(Op::Eq) as usize)
}

impl<W: Write> Backend for M6809Backend<W> {
    fn target(&self) -> Target {
        Target::M6809
    }

    fn new_label(&mut self) -> Label {
        self.labels.next()
    }

    fn preamble(&mut self) -> Result<()> {
        self.free_all_regs(None)?;
        self.next_temp = 0;
        self.text_seg()
    }

    fn postamble(&mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }

    fn func_preamble(&mut self, sym: &mut Sym) -> Result<()> {
        self.text_seg()?;
        self.local_offset = 0;
        self.next_temp = 0;
        self.sp_adjust = 0;

        if sym.class == SymClass::Global {
            writeln!(self.out, "\t.export _{}", sym.name)?;
        }
        writeln!(self.out, "_{}:", sym.name)?;

        // Locals sit just above the stack pointer; parameters beyond
        // the return address, above the locals
        for var in sym.members.iter_mut().filter(|v| v.class == SymClass::Local) {
            var.posn = self.local_offset;
            self.local_offset += var.size;
        }
        let mut param_offset = 2;
        for parm in sym.members.iter_mut().filter(|v| v.class == SymClass::Param) {
            parm.posn = param_offset + self.local_offset;
            param_offset += parm.size;
        }

        if self.local_offset != 0 {
            writeln!(self.out, "\tleas -{},s", self.local_offset)?;
        }
        Ok(())
    }

    fn func_postamble(&mut self, sym: &Sym) -> Result<()> {
        self.label(Label(sym.posn as u32))?;
        if self.local_offset != 0 {
            writeln!(self.out, "\tleas {},s", self.local_offset)?;
        }
        writeln!(self.out, "\trts")?;
        self.free_all_regs(None)?;
        self.next_temp = 0;

        if self.sp_adjust != 0 {
            bail!("sp_adjust is not zero: {}", self.sp_adjust);
        }
        Ok(())
    }

    fn free_all_regs(&mut self, keep: Option<Reg>) -> Result<()> {
        // Any outstanding spills are dead values: drop the stack back
        while let Some((_, mt)) = self.spills.pop() {
            writeln!(self.out, "\tleas {},s", mt.bytes())?;
            self.sp_adjust -= mt.bytes();
        }

        for l in 0..NUM_LOCNS {
            if keep.map(|k| k.0 as usize) != Some(l) {
                self.locns[l].0 = Locn::Free;
            }
        }
        if keep.is_none() {
            self.next_temp = 0;
        }
        writeln!(self.out, ";")?;
        // A kept location still in D stays tracked
        self.d_holds = keep
            .map(|k| k.0 as usize)
            .filter(|&l| self.locns[l].0 == Locn::DReg);
        Ok(())
    }

    fn alloc_reg(&mut self, prim: Prim) -> Result<Reg> {
        let mt = self.mtype(prim)?;
        let t = self.alloc_temp();
        let l = self.alloc_locn(Locn::Temp(t), mt)?;
        Ok(Reg(l as u32))
    }

    fn free_reg(&mut self, reg: Reg) -> Result<()> {
        self.free_locn(reg.0 as usize)
    }

    fn load_int(&mut self, value: i64, prim: Prim) -> Result<Reg> {
        let mt = self.mtype(prim)?;
        let l = self.alloc_locn(Locn::Const(value), mt)?;
        Ok(Reg(l as u32))
    }

    fn load_var(&mut self, sym: &Sym, op: Option<Op>) -> Result<Reg> {
        let mt = self.mtype(sym.prim)?;

        let mut offset = 1;
        if sym.prim.is_ptr() {
            offset = type_size(sym.prim.value_at()?, None, Target::M6809)?;
        }
        if matches!(op, Some(Op::PreDec) | Some(Op::PostDec)) {
            offset = -offset;
        }

        if matches!(op, Some(Op::PreInc) | Some(Op::PreDec)) {
            // The update sequence clobbers D
            self.stash_d()?;
            self.incdec_sym(sym, offset)?;
        }

        let l = if sym.class == SymClass::Local || sym.class == SymClass::Param {
            self.alloc_locn(Locn::Local(sym.posn), mt)?
        } else {
            self.alloc_locn(Locn::Symbol(sym.name.clone()), mt)?
        };

        if matches!(op, Some(Op::PostInc) | Some(Op::PostDec)) {
            // Get the current value first, then update memory
            self.load_d(l)?;
            self.stash_d()?;
            self.incdec_sym(sym, offset)?;
        }

        Ok(Reg(l as u32))
    }

    fn load_str_addr(&mut self, label: Label) -> Result<Reg> {
        let l = self.alloc_locn(Locn::StrLabel(label.0), MType::Pointer)?;
        Ok(Reg(l as u32))
    }

    fn add(&mut self, r1: Reg, r2: Reg, prim: Prim) -> Result<Reg> {
        let (l1, l2) = (r1.0 as usize, r2.0 as usize);
        self.load_d(l1)?;

        match self.mtype(prim)? {
            MType::Char => self.op2("addb", l2, 0, Part::B)?,
            MType::Int | MType::Pointer => self.op2("addd", l2, 0, Part::D)?,
            MType::Long => {
                self.op2("addd", l2, 2, Part::D)?;
                writeln!(self.out, "\texg y,d")?;
                self.op2("adcb", l2, 1, Part::F)?;
                self.op2("adca", l2, 0, Part::E)?;
                writeln!(self.out, "\texg y,d")?;
            }
        }
        self.free_locn(l2)?;
        self.result_in_d(l1);
        Ok(r1)
    }

    fn sub(&mut self, r1: Reg, r2: Reg, prim: Prim) -> Result<Reg> {
        let (l1, l2) = (r1.0 as usize, r2.0 as usize);
        self.load_d(l1)?;

        match self.mtype(prim)? {
            MType::Char => self.op2("subb", l2, 0, Part::B)?,
            MType::Int | MType::Pointer => self.op2("subd", l2, 0, Part::D)?,
            MType::Long => {
                self.op2("subd", l2, 2, Part::D)?;
                writeln!(self.out, "\texg y,d")?;
                self.op2("sbcb", l2, 1, Part::F)?;
                self.op2("sbca", l2, 0, Part::E)?;
                writeln!(self.out, "\texg y,d")?;
            }
        }
        self.free_locn(l2)?;
        self.result_in_d(l1);
        Ok(r1)
    }

    fn mul(&mut self, r1: Reg, r2: Reg, prim: Prim) -> Result<Reg> {
        self.bin_helper(r1, r2, prim, "__mul", "__mul", "__mull")
    }

    fn div(&mut self, r1: Reg, r2: Reg, prim: Prim) -> Result<Reg> {
        self.bin_helper(r1, r2, prim, "__div", "__div", "__divl")
    }

    fn modulo(&mut self, r1: Reg, r2: Reg, prim: Prim) -> Result<Reg> {
        self.bin_helper(r1, r2, prim, "__rem", "__rem", "__reml")
    }

    fn bit_and(&mut self, r1: Reg, r2: Reg, prim: Prim) -> Result<Reg> {
        self.bin_op(r1, r2, prim, "and")
    }

    fn bit_or(&mut self, r1: Reg, r2: Reg, prim: Prim) -> Result<Reg> {
        self.bin_op(r1, r2, prim, "or")
    }

    fn bit_xor(&mut self, r1: Reg, r2: Reg, prim: Prim) -> Result<Reg> {
        self.bin_op(r1, r2, prim, "eor")
    }

    fn shl(&mut self, r1: Reg, r2: Reg, prim: Prim) -> Result<Reg> {
        self.bin_helper(r1, r2, prim, "__shl", "__shl", "__shll")
    }

    fn shr(&mut self, r1: Reg, r2: Reg, prim: Prim) -> Result<Reg> {
        // Shifts by 8, 16 or 24 are register moves and clears
        if let Locn::Const(val) = self.locns[r2.0 as usize].0 {
            if val == 8 || val == 16 || val == 24 {
                let l1 = r1.0 as usize;
                self.load_d(l1)?;
                match (self.mtype(prim)?, val) {
                    (MType::Char, _) => writeln!(self.out, "\tclrb")?,
                    (MType::Int | MType::Pointer, 8) => {
                        writeln!(self.out, "\ttfr a,b")?;
                        writeln!(self.out, "\tclra")?;
                    }
                    (MType::Int | MType::Pointer, _) => {
                        writeln!(self.out, "\tclra")?;
                        writeln!(self.out, "\tclrb")?;
                    }
                    (MType::Long, 8) => {
                        let t = self.alloc_temp();
                        writeln!(self.out, "\tclr R{t}")?;
                        writeln!(self.out, "\tsty R{t}+1")?;
                        writeln!(self.out, "\tsta R{t}+3")?;
                        writeln!(self.out, "\tldy R{t}")?;
                        writeln!(self.out, "\tldd R{t}+2")?;
                    }
                    (MType::Long, 16) => {
                        writeln!(self.out, "\ttfr y,d")?;
                        writeln!(self.out, "\tldy #0")?;
                    }
                    (MType::Long, _) => {
                        writeln!(self.out, "\ttfr y,d")?;
                        writeln!(self.out, "\ttfr a,b")?;
                        writeln!(self.out, "\tclra")?;
                        writeln!(self.out, "\tldy #0")?;
                    }
                }
                self.free_locn(r2.0 as usize)?;
                self.result_in_d(l1);
                return Ok(r1);
            }
        }
        self.bin_helper(r1, r2, prim, "__shr", "__shr", "__shrl")
    }

    fn negate(&mut self, r: Reg, prim: Prim) -> Result<Reg> {
        let l = r.0 as usize;
        self.load_d(l)?;
        match self.mtype(prim)? {
            MType::Char => writeln!(self.out, "\tnegb")?,
            MType::Int | MType::Pointer => {
                writeln!(self.out, "\tcoma")?;
                writeln!(self.out, "\tcomb")?;
                writeln!(self.out, "\taddd #1")?;
            }
            MType::Long => writeln!(self.out, "\tlbsr __negatel")?,
        }
        self.result_in_d(l);
        Ok(r)
    }

    fn invert(&mut self, r: Reg, prim: Prim) -> Result<Reg> {
        let l = r.0 as usize;
        self.load_d(l)?;
        match self.mtype(prim)? {
            MType::Char => writeln!(self.out, "\tcomb")?,
            MType::Int | MType::Pointer => {
                writeln!(self.out, "\tcoma")?;
                writeln!(self.out, "\tcomb")?;
            }
            MType::Long => {
                writeln!(self.out, "\tcoma")?;
                writeln!(self.out, "\tcomb")?;
                writeln!(self.out, "\texg y,d")?;
                writeln!(self.out, "\tcoma")?;
                writeln!(self.out, "\tcomb")?;
                writeln!(self.out, "\texg y,d")?;
            }
        }
        self.result_in_d(l);
        Ok(r)
    }

    fn lognot(&mut self, r: Reg, prim: Prim) -> Result<Reg> {
        let l = r.0 as usize;
        let label1 = self.new_label();
        let label2 = self.new_label();
        self.load_d(l)?;

        match self.mtype(prim)? {
            MType::Char => {
                writeln!(self.out, "\tcmpb #0")?;
                writeln!(self.out, "\tbne L{}", label1.0)?;
            }
            MType::Int | MType::Pointer => {
                writeln!(self.out, "\tcmpd #0")?;
                writeln!(self.out, "\tbne L{}", label1.0)?;
            }
            MType::Long => {
                writeln!(self.out, "\tcmpd #0")?;
                writeln!(self.out, "\tbne L{}", label1.0)?;
                writeln!(self.out, "\tcmpy #0")?;
                writeln!(self.out, "\tbne L{}", label1.0)?;
            }
        }
        writeln!(self.out, "\tldd #1")?;
        writeln!(self.out, "\tbra L{}", label2.0)?;
        self.label(label1)?;
        writeln!(self.out, "\tldd #0")?;
        self.label(label2)?;

        self.locns[l].1 = MType::Int;
        self.result_in_d(l);
        Ok(r)
    }

    fn shl_const(&mut self, r: Reg, amount: i64, prim: Prim) -> Result<Reg> {
        let l = r.0 as usize;
        self.load_d(l)?;
        for _ in 0..amount {
            match self.mtype(prim)? {
                MType::Char => writeln!(self.out, "\taslb")?,
                MType::Int | MType::Pointer => {
                    writeln!(self.out, "\taslb")?;
                    writeln!(self.out, "\trola")?;
                }
                MType::Long => {
                    writeln!(self.out, "\taslb")?;
                    writeln!(self.out, "\trola")?;
                    writeln!(self.out, "\texg y,d")?;
                    writeln!(self.out, "\trolb")?;
                    writeln!(self.out, "\trola")?;
                    writeln!(self.out, "\texg y,d")?;
                }
            }
        }
        self.result_in_d(l);
        Ok(r)
    }

    fn compare_and_set(&mut self, op: Op, r1: Reg, r2: Reg, prim: Prim) -> Result<Reg> {
        let (l1, l2) = (r1.0 as usize, r2.0 as usize);
        let label1 = self.new_label();
        let label2 = self.new_label();
        self.load_d(l1)?;

        match self.mtype(prim)? {
            MType::Char => {
                self.op2("cmpb", l2, 0, Part::B)?;
                writeln!(self.out, "\t{} L{}", CMP_BRANCH[cmp_index(op)?], label1.0)?;
            }
            MType::Int | MType::Pointer => {
                self.op2("cmpd", l2, 0, Part::D)?;
                writeln!(self.out, "\t{} L{}", CMP_BRANCH[cmp_index(op)?], label1.0)?;
            }
            MType::Long => {
                self.long_compare_branch(op, l2, label1, true)?;
            }
        }
        writeln!(self.out, "\tldd #0")?;
        writeln!(self.out, "\tbra L{}", label2.0)?;
        self.label(label1)?;
        writeln!(self.out, "\tldd #1")?;
        self.label(label2)?;
        self.free_locn(l2)?;

        self.locns[l1].1 = MType::Int;
        self.result_in_d(l1);
        Ok(r1)
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
        let (l1, l2) = (r1.0 as usize, r2.0 as usize);
        let mt = self.mtype(prim)?;
        self.load_d(l1)?;

        // Jump on the inverted condition, or directly for an OR-like
        // parent
        let jump_if_true = parent == Some(Op::LogOr);
        match mt {
            MType::Char => {
                self.op2("cmpb", l2, 0, Part::B)?;
                let b = if jump_if_true {
                    CMP_BRANCH[cmp_index(op)?]
                } else {
                    INV_BRANCH[cmp_index(op)?]
                };
                writeln!(self.out, "\t{b} L{}", label.0)?;
            }
            MType::Int | MType::Pointer => {
                self.op2("cmpd", l2, 0, Part::D)?;
                let b = if jump_if_true {
                    CMP_BRANCH[cmp_index(op)?]
                } else {
                    INV_BRANCH[cmp_index(op)?]
                };
                writeln!(self.out, "\t{b} L{}", label.0)?;
            }
            MType::Long => {
                self.long_compare_branch(op, l2, label, jump_if_true)?;
            }
        }
        self.free_locn(l1)?;
        self.free_locn(l2)?;
        Ok(())
    }

    fn boolean(
        &mut self,
        r: Reg,
        parent: Option<Op>,
        label: Option<Label>,
        prim: Prim,
    ) -> Result<Option<Reg>> {
        let l = r.0 as usize;
        let mt = self.mtype(prim)?;
        self.load_d_z(l, mt)?;

        match parent {
            Some(Op::If) | Some(Op::While) | Some(Op::Ternary) | Some(Op::LogAnd) => {
                let label = label.ok_or_else(|| anyhow!("boolean jump with no label"))?;
                writeln!(self.out, "\tbeq L{}", label.0)?;
                Ok(None)
            }
            Some(Op::LogOr) => {
                let label = label.ok_or_else(|| anyhow!("boolean jump with no label"))?;
                writeln!(self.out, "\tbne L{}", label.0)?;
                Ok(None)
            }
            _ => {
                // Materialise the 0/1 value
                let label1 = self.new_label();
                let label2 = self.new_label();
                writeln!(self.out, "\tbne L{}", label1.0)?;
                writeln!(self.out, "\tldd #0")?;
                writeln!(self.out, "\tbra L{}", label2.0)?;
                self.label(label1)?;
                writeln!(self.out, "\tldd #1")?;
                self.label(label2)?;
                self.locns[l].1 = MType::Int;
                self.result_in_d(l);
                Ok(Some(r))
            }
        }
    }

    fn load_boolean(&mut self, r: Option<Reg>, value: i64, prim: Prim) -> Result<Reg> {
        let mt = self.mtype(prim)?;
        let templ = self.alloc_locn(Locn::Const(value), mt)?;
        self.load_d(templ)?;

        match r {
            None => Ok(Reg(templ as u32)),
            Some(r) => {
                self.save_d(r.0 as usize)?;
                self.free_locn(templ)?;
                Ok(r)
            }
        }
    }

    fn call(&mut self, sym: &Sym, args: &[(Reg, Prim)]) -> Result<Option<Reg>> {
        // The call clobbers D, so any live value there moves out first
        self.stash_d()?;

        // Arguments arrive right-to-left, which is exactly the push
        // order the callee expects
        let mut arg_bytes = 0;
        for (reg, prim) in args {
            self.push_locn(reg.0 as usize)?;
            arg_bytes += Target::M6809.prim_size(*prim)?;
        }

        writeln!(self.out, "\tlbsr _{}", sym.name)?;
        if arg_bytes != 0 {
            writeln!(self.out, "\tleas {},s", arg_bytes)?;
        }
        self.sp_adjust -= arg_bytes;

        if sym.prim == Prim::VOID {
            return Ok(None);
        }
        let mt = self.mtype(sym.prim)?;
        let l = self.alloc_locn(Locn::DReg, mt)?;
        Ok(Some(Reg(l as u32)))
    }

    fn gen_return(&mut self, r: Option<Reg>, sym: &Sym) -> Result<()> {
        if let Some(r) = r {
            self.load_d(r.0 as usize)?;
        }
        self.jump(Label(sym.posn as u32))
    }

    fn widen(&mut self, r: Reg, old: Prim, new: Prim) -> Result<Reg> {
        let grow = Target::M6809.prim_size(new)? - Target::M6809.prim_size(old)?;
        if grow <= 0 {
            return Ok(r);
        }
        let l = r.0 as usize;
        self.load_d(l)?;

        // Chars are unsigned; int to long sign-extends through Y
        match grow {
            1 => writeln!(self.out, "\tclra")?,
            2 => {
                let label1 = self.new_label();
                let label2 = self.new_label();
                writeln!(self.out, "\tcmpd #0")?;
                writeln!(self.out, "\tbge L{}", label1.0)?;
                writeln!(self.out, "\tldy #65535")?;
                writeln!(self.out, "\tbra L{}", label2.0)?;
                self.label(label1)?;
                writeln!(self.out, "\tldy #0")?;
                self.label(label2)?;
            }
            _ => {
                writeln!(self.out, "\tclra")?;
                writeln!(self.out, "\tldy #0")?;
            }
        }

        self.locns[l].1 = self.mtype(new)?;
        self.result_in_d(l);
        Ok(r)
    }

    fn cast(&mut self, r: Reg, old: Prim, new: Prim) -> Result<Reg> {
        let l = r.0 as usize;
        if Target::M6809.prim_size(new)? <= Target::M6809.prim_size(old)? {
            // Narrowing just re-tags the location
            self.locns[l].1 = self.mtype(new)?;
            return Ok(r);
        }
        self.widen(r, old, new)
    }

    fn label(&mut self, l: Label) -> Result<()> {
        writeln!(self.out, "L{}:", l.0)?;
        Ok(())
    }

    fn jump(&mut self, l: Label) -> Result<()> {
        writeln!(self.out, "\tbra L{}", l.0)?;
        self.d_holds = None;
        Ok(())
    }

    fn switch(
        &mut self,
        r: Reg,
        top: Label,
        cases: &[(i64, Label)],
        default: Label,
    ) -> Result<()> {
        // The jump table lives in the literal segment: the case
        // count, the (value, label) pairs, then the default label
        let table = self.new_label();
        self.lit_seg()?;
        self.label(table)?;
        writeln!(self.out, "\t.word {}", cases.len())?;
        for (value, label) in cases {
            writeln!(self.out, "\t.word {}", value)?;
            writeln!(self.out, "\t.word L{}", label.0)?;
        }
        writeln!(self.out, "\t.word L{}", default.0)?;

        // Load the selector and let the helper search the table
        self.text_seg()?;
        self.label(top)?;
        self.load_d(r.0 as usize)?;
        writeln!(self.out, "\tldx #L{}", table.0)?;
        writeln!(self.out, "\tlbra __switch")?;
        Ok(())
    }

    fn address_of(&mut self, sym: &Sym) -> Result<Reg> {
        if matches!(
            sym.class,
            SymClass::Global | SymClass::Extern | SymClass::Static
        ) {
            let l = self.alloc_locn(Locn::SymAddr(sym.name.clone()), MType::Pointer)?;
            return Ok(Reg(l as u32));
        }

        // Stack addresses go through X
        self.stash_d()?;
        writeln!(self.out, "\tleax {},s", sym.posn + self.sp_adjust)?;
        writeln!(self.out, "\ttfr x,d")?;
        let l = self.alloc_locn(Locn::DReg, MType::Pointer)?;
        Ok(Reg(l as u32))
    }

    fn deref(&mut self, r: Reg, ptr_prim: Prim) -> Result<Reg> {
        let l = r.0 as usize;
        let pointee = ptr_prim.value_at()?;
        let mt = self.mtype(pointee)?;

        if self.locns[l].0 == Locn::DReg {
            writeln!(self.out, "\ttfr d,x")?;
        } else {
            self.stash_d()?;
            self.op2("ldx", l, 0, Part::D)?;
        }

        match mt {
            MType::Char => writeln!(self.out, "\tldb 0,x")?,
            MType::Int | MType::Pointer => writeln!(self.out, "\tldd 0,x")?,
            MType::Long => {
                writeln!(self.out, "\tldd 2,x")?;
                writeln!(self.out, "\tldy 0,x")?;
            }
        }

        self.free_locn(l)?;
        let l = self.alloc_locn(Locn::DReg, mt)?;
        Ok(Reg(l as u32))
    }

    fn store_global(&mut self, r: Reg, sym: &Sym) -> Result<Reg> {
        self.load_d(r.0 as usize)?;
        match type_size(sym.prim, None, Target::M6809)? {
            1 => writeln!(self.out, "\tstb _{}", sym.name)?,
            2 => writeln!(self.out, "\tstd _{}", sym.name)?,
            _ => {
                writeln!(self.out, "\tstd _{}+2", sym.name)?;
                writeln!(self.out, "\tsty _{}", sym.name)?;
            }
        }
        Ok(r)
    }

    fn store_local(&mut self, r: Reg, sym: &Sym) -> Result<Reg> {
        self.load_d(r.0 as usize)?;
        match self.mtype(sym.prim)? {
            MType::Char => writeln!(self.out, "\tstb {},s", sym.posn + self.sp_adjust)?,
            MType::Int | MType::Pointer => {
                writeln!(self.out, "\tstd {},s", sym.posn + self.sp_adjust)?
            }
            MType::Long => {
                writeln!(self.out, "\tsty {},s", sym.posn + self.sp_adjust)?;
                writeln!(self.out, "\tstd {},s", 2 + sym.posn + self.sp_adjust)?;
            }
        }
        Ok(r)
    }

    fn store_through(&mut self, val: Reg, ptr: Reg, prim: Prim) -> Result<Reg> {
        let (l1, l2) = (val.0 as usize, ptr.0 as usize);

        if self.d_holds == Some(l2) {
            writeln!(self.out, "\ttfr d,x")?;
        } else {
            self.op2("ldx", l2, 0, Part::D)?;
        }
        self.d_holds = None;
        self.load_d(l1)?;

        match self.mtype(prim)? {
            MType::Char => writeln!(self.out, "\tstb 0,x")?,
            MType::Int | MType::Pointer => writeln!(self.out, "\tstd 0,x")?,
            MType::Long => {
                writeln!(self.out, "\tsty 0,x")?;
                writeln!(self.out, "\tstd 2,x")?;
            }
        }
        self.d_holds = Some(l1);
        Ok(val)
    }

    fn global_sym(&mut self, sym: &Sym) -> Result<()> {
        if sym.kind == SymKind::Function {
            return Ok(());
        }

        let (size, prim) = if sym.kind == SymKind::Array {
            let elem = sym.prim.value_at()?;
            (type_size(elem, None, Target::M6809)?, elem)
        } else {
            (sym.size, sym.prim)
        };

        self.data_seg()?;
        if sym.class == SymClass::Global {
            writeln!(self.out, "\t.export _{}", sym.name)?;
        }
        writeln!(self.out, "_{}:", sym.name)?;

        let char_ptr = Prim::CHAR.pointer_to().unwrap();
        for i in 0..sym.nelems.max(1) {
            let init = sym
                .init_list
                .as_ref()
                .and_then(|l| l.get(i as usize).copied())
                .unwrap_or(0) as i64;
            match size {
                1 => writeln!(self.out, "\t.byte\t{}", init & 0xff)?,
                2 => {
                    // A char-pointer initialiser holds a string label
                    if sym.init_list.is_some() && prim == char_ptr && init != 0 {
                        writeln!(self.out, "\t.word\tL{}", init)?;
                    } else {
                        writeln!(self.out, "\t.word\t{}", init & 0xffff)?;
                    }
                }
                4 => {
                    writeln!(self.out, "\t.word\t{}", (init >> 16) & 0xffff)?;
                    writeln!(self.out, "\t.word\t{}", init & 0xffff)?;
                }
                size => {
                    for _ in 0..size {
                        writeln!(self.out, "\t.byte\t0")?;
                    }
                }
            }
        }
        Ok(())
    }

    fn global_str(&mut self, label: Label, text: &str) -> Result<()> {
        self.lit_seg()?;
        self.label(label)?;
        for byte in text.bytes() {
            writeln!(self.out, "\t.byte\t{}", byte)?;
        }
        writeln!(self.out, "\t.byte\t0")?;
        self.text_seg()?;
        Ok(())
    }

    fn move_reg(&mut self, src: Reg, dst: Reg, _prim: Prim) -> Result<()> {
        self.load_d(src.0 as usize)?;
        self.save_d(dst.0 as usize)
    }

    fn line_num(&mut self, line: i32) -> Result<()> {
        writeln!(self.out, ";\t\t\t\t\tline {}", line)?;
        Ok(())
    }
}
