pub mod m6809;
pub mod qbe;

use anyhow::{anyhow, Result};
use serde::Serialize;

use crate::ast::serial::AstLoader;
use crate::ast::{Node, Op};
use crate::sym::{Sym, SymClass, SymKind, SymTab};
use crate::target::Target;
use crate::types::Prim;
use crate::Label;

/// A backend value handle: a register, temporary or location id,
/// whatever the backend uses. "No value" is `Option<Reg>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Reg(pub u32);

/// The fixed set of operations a backend must provide. The generic
/// tree walker drives one of these; every backend implements the same
/// observable semantics.
pub trait Backend {
    fn target(&self) -> Target;

    /// Mint a unique label. Shared with the tree walker so generic
    /// and backend-internal labels never collide.
    fn new_label(&mut self) -> Label;

    fn preamble(&mut self) -> Result<()>;
    fn postamble(&mut self) -> Result<()>;

    /// Emit a function's prologue. Assigns frame positions to the
    /// function's parameters and locals in place.
    fn func_preamble(&mut self, sym: &mut Sym) -> Result<()>;
    fn func_postamble(&mut self, sym: &Sym) -> Result<()>;

    fn free_all_regs(&mut self, keep: Option<Reg>) -> Result<()>;
    fn alloc_reg(&mut self, prim: Prim) -> Result<Reg>;
    fn free_reg(&mut self, reg: Reg) -> Result<()>;

    fn load_int(&mut self, value: i64, prim: Prim) -> Result<Reg>;
    /// Load a variable; `op` is a pre/post increment or decrement to
    /// apply around the load. Pointers step by the pointee size.
    fn load_var(&mut self, sym: &Sym, op: Option<Op>) -> Result<Reg>;
    fn load_str_addr(&mut self, label: Label) -> Result<Reg>;

    fn add(&mut self, r1: Reg, r2: Reg, prim: Prim) -> Result<Reg>;
    fn sub(&mut self, r1: Reg, r2: Reg, prim: Prim) -> Result<Reg>;
    fn mul(&mut self, r1: Reg, r2: Reg, prim: Prim) -> Result<Reg>;
    fn div(&mut self, r1: Reg, r2: Reg, prim: Prim) -> Result<Reg>;
    fn modulo(&mut self, r1: Reg, r2: Reg, prim: Prim) -> Result<Reg>;
    fn bit_and(&mut self, r1: Reg, r2: Reg, prim: Prim) -> Result<Reg>;
    fn bit_or(&mut self, r1: Reg, r2: Reg, prim: Prim) -> Result<Reg>;
    fn bit_xor(&mut self, r1: Reg, r2: Reg, prim: Prim) -> Result<Reg>;
    fn shl(&mut self, r1: Reg, r2: Reg, prim: Prim) -> Result<Reg>;
    fn shr(&mut self, r1: Reg, r2: Reg, prim: Prim) -> Result<Reg>;

    fn negate(&mut self, r: Reg, prim: Prim) -> Result<Reg>;
    fn invert(&mut self, r: Reg, prim: Prim) -> Result<Reg>;
    fn lognot(&mut self, r: Reg, prim: Prim) -> Result<Reg>;
    /// Shift left by a constant, used for pointer scaling.
    fn shl_const(&mut self, r: Reg, amount: i64, prim: Prim) -> Result<Reg>;

    fn compare_and_set(&mut self, op: Op, r1: Reg, r2: Reg, prim: Prim) -> Result<Reg>;
    /// Compare and jump to `label` when the comparison is false, or
    /// when it is true if the parent operation is LogOr.
    fn compare_and_jump(
        &mut self,
        op: Op,
        parent: Option<Op>,
        r1: Reg,
        r2: Reg,
        label: Label,
        prim: Prim,
    ) -> Result<()>;

    /// Booleanise a value: jump to the label when it is zero for
    /// If/While/Ternary/LogAnd parents, when non-zero for LogOr, and
    /// otherwise produce a 0/1 value.
    fn boolean(
        &mut self,
        r: Reg,
        parent: Option<Op>,
        label: Option<Label>,
        prim: Prim,
    ) -> Result<Option<Reg>>;
    fn load_boolean(&mut self, r: Option<Reg>, value: i64, prim: Prim) -> Result<Reg>;

    /// Call a function. The argument handles arrive right-to-left,
    /// each with the argument expression's type. Returns the handle
    /// holding the result, or None for a void function.
    fn call(&mut self, sym: &Sym, args: &[(Reg, Prim)]) -> Result<Option<Reg>>;
    fn gen_return(&mut self, r: Option<Reg>, sym: &Sym) -> Result<()>;

    fn widen(&mut self, r: Reg, old: Prim, new: Prim) -> Result<Reg>;
    fn cast(&mut self, r: Reg, old: Prim, new: Prim) -> Result<Reg>;

    fn label(&mut self, l: Label) -> Result<()>;
    fn jump(&mut self, l: Label) -> Result<()>;
    /// Dispatch a switch. `cases` pairs each case value with its
    /// label; the backend chooses a jump table or a compare chain.
    fn switch(
        &mut self,
        r: Reg,
        top: Label,
        cases: &[(i64, Label)],
        default: Label,
    ) -> Result<()>;

    fn address_of(&mut self, sym: &Sym) -> Result<Reg>;
    /// Dereference the pointer in r; `ptr_prim` is the pointer's type.
    fn deref(&mut self, r: Reg, ptr_prim: Prim) -> Result<Reg>;
    fn store_global(&mut self, r: Reg, sym: &Sym) -> Result<Reg>;
    fn store_local(&mut self, r: Reg, sym: &Sym) -> Result<Reg>;
    fn store_through(&mut self, val: Reg, ptr: Reg, prim: Prim) -> Result<Reg>;

    fn global_sym(&mut self, sym: &Sym) -> Result<()>;
    fn global_str(&mut self, label: Label, text: &str) -> Result<()>;

    fn move_reg(&mut self, src: Reg, dst: Reg, prim: Prim) -> Result<()>;
    fn line_num(&mut self, line: i32) -> Result<()>;
}

/// The generator phase: walks each function's AST, loaded lazily by
/// node id, and drives the backend.
pub struct GenState<B> {
    pub syms: SymTab,
    pub loader: AstLoader,
    pub cg: B,
    cur_fn: Option<crate::sym::SymId>,
    line: i32,
}

/// Parents under which a comparison compiles to a compare-and-jump
/// rather than a materialised 0/1.
fn jump_parent(parent: Option<Op>) -> bool {
    matches!(
        parent,
        Some(Op::If) | Some(Op::While) | Some(Op::Ternary) | Some(Op::LogAnd) | Some(Op::LogOr)
    )
}

impl<B: Backend> GenState<B> {
    pub fn new(syms: SymTab, loader: AstLoader, cg: B) -> Self {
        Self {
            syms,
            loader,
            cg,
            cur_fn: None,
            line: 0,
        }
    }

    /// Run the whole generation phase.
    pub fn generate(&mut self) -> Result<()> {
        self.cg.preamble()?;
        self.allocate_globals()?;
        while let Some(node) = self.loader.next_function()? {
            self.gen_ast(&node, None, None, None, None)?;
        }
        self.cg.postamble()?;
        Ok(())
    }

    /// Emit the string literals and global variables from the symbol
    /// table. String labels are assigned here; char-pointer
    /// initialiser entries are rewritten from string symbol ids to
    /// those labels.
    fn allocate_globals(&mut self) -> Result<()> {
        // Labels for the string literals first
        let str_ids: Vec<_> = self
            .syms
            .globals
            .iter()
            .filter(|s| s.kind == SymKind::StrLit)
            .map(|s| s.id)
            .collect();
        for id in str_ids {
            let label = self.cg.new_label();
            let sym = self.syms.find_by_id_mut(id).unwrap();
            sym.posn = label.0 as i64;
            let text = sym.name.clone();
            self.cg.global_str(label, &text)?;
        }

        // Now the variables and arrays
        let char_ptr = Prim::CHAR.pointer_to().unwrap();
        let char_ptr_ptr = char_ptr.pointer_to().unwrap();
        for idx in 0..self.syms.globals.len() {
            let sym = &self.syms.globals[idx];
            if sym.kind != SymKind::Variable && sym.kind != SymKind::Array {
                continue;
            }
            if sym.class != SymClass::Global && sym.class != SymClass::Static {
                continue;
            }

            // Rewrite string-literal symbol ids into labels
            if sym.init_list.is_some() && (sym.prim == char_ptr || sym.prim == char_ptr_ptr) {
                let init = self.syms.globals[idx].init_list.clone().unwrap();
                let mut rewritten = Vec::with_capacity(init.len());
                for value in init {
                    if value == 0 {
                        rewritten.push(0);
                        continue;
                    }
                    let lit = self.syms.must_find_by_id(crate::sym::SymId(value as u32))?;
                    rewritten.push(lit.posn as i32);
                }
                self.syms.globals[idx].init_list = Some(rewritten);
            }

            let sym = self.syms.globals[idx].clone();
            self.cg.global_sym(&sym)?;
        }
        Ok(())
    }

    fn update_line(&mut self, n: &Node) -> Result<()> {
        if n.line != 0 && n.line != self.line {
            self.line = n.line;
            self.cg.line_num(n.line)?;
        }
        Ok(())
    }

    fn cur_fn_sym(&self) -> Result<Sym> {
        let id = self.cur_fn.ok_or_else(|| anyhow!("Not inside a function"))?;
        Ok(self.syms.must_find_by_id(id)?.clone())
    }

    fn node_sym(&self, n: &Node) -> Result<Sym> {
        let id = n
            .sym
            .ok_or_else(|| anyhow!("AST node {:?} has no symbol", n.op))?;
        Ok(self.syms.must_find_by_id(id)?.clone())
    }

    /// Generate an IF statement with an optional ELSE clause.
    fn gen_if(
        &mut self,
        n: &Node,
        nleft: Option<Node>,
        nmid: Option<Node>,
        nright: Option<Node>,
        looptop: Option<Label>,
        loopend: Option<Label>,
    ) -> Result<Option<Reg>> {
        // With no ELSE clause, the false label is the end label
        let l_false = self.cg.new_label();
        let l_end = if nright.is_some() {
            Some(self.cg.new_label())
        } else {
            None
        };

        // Condition, jumping to the false label when untrue
        if let Some(cond) = &nleft {
            self.gen_ast(cond, Some(l_false), looptop, loopend, Some(n.op))?;
        }
        self.cg.free_all_regs(None)?;

        if let Some(body) = &nmid {
            self.gen_ast(body, None, looptop, loopend, Some(n.op))?;
        }
        self.cg.free_all_regs(None)?;

        if let Some(l_end) = l_end {
            self.cg.jump(l_end)?;
        }
        self.cg.label(l_false)?;

        if let Some(else_body) = &nright {
            self.gen_ast(else_body, None, looptop, loopend, Some(n.op))?;
            self.cg.free_all_regs(None)?;
            self.cg.label(l_end.unwrap())?;
        }
        Ok(None)
    }

    fn gen_while(
        &mut self,
        n: &Node,
        nleft: Option<Node>,
        nright: Option<Node>,
    ) -> Result<Option<Reg>> {
        let l_start = self.cg.new_label();
        let l_end = self.cg.new_label();
        self.cg.label(l_start)?;

        if let Some(cond) = &nleft {
            self.gen_ast(cond, Some(l_end), Some(l_start), Some(l_end), Some(n.op))?;
        }
        self.cg.free_all_regs(None)?;

        if let Some(body) = &nright {
            self.gen_ast(body, None, Some(l_start), Some(l_end), Some(n.op))?;
        }
        self.cg.free_all_regs(None)?;

        self.cg.jump(l_start)?;
        self.cg.label(l_end)?;
        Ok(None)
    }

    /// Generate a switch: evaluate the selector, emit the dispatch,
    /// then each case body in order.
    fn gen_switch(
        &mut self,
        nleft: Option<Node>,
        nright: Option<Node>,
        looptop: Option<Label>,
    ) -> Result<Option<Reg>> {
        let l_top = self.cg.new_label();
        let l_end = self.cg.new_label();

        // Walk the clause chain, giving each clause a label
        struct Clause {
            op: Op,
            value: i64,
            label: Label,
            body: Option<crate::ast::NodeId>,
        }
        let mut clauses = Vec::new();
        let mut default_label = l_end;
        let mut cur = nright;
        while let Some(c) = cur {
            let label = self.cg.new_label();
            if c.op == Op::Default {
                default_label = label;
            }
            clauses.push(Clause {
                op: c.op,
                value: c.value,
                label,
                body: c.left_id,
            });
            cur = self.loader.load_child(c.right_id)?;
        }

        // The selector value, then the dispatch
        let mut reg = None;
        if let Some(selector) = &nleft {
            reg = self.gen_ast(selector, None, None, None, None)?;
        }
        let reg = reg.ok_or_else(|| anyhow!("Switch selector produced no value"))?;
        self.cg.jump(l_top)?;
        self.cg.free_all_regs(Some(reg))?;

        let cases: Vec<(i64, Label)> = clauses
            .iter()
            .filter(|c| c.op == Op::Case)
            .map(|c| (c.value, c.label))
            .collect();
        self.cg.switch(reg, l_top, &cases, default_label)?;

        // The case bodies. An empty body falls into the next one.
        for clause in &clauses {
            self.cg.label(clause.label)?;
            if let Some(body_id) = clause.body {
                let body = self.loader.load_node(body_id)?;
                // looptop passes through so 'continue' still reaches
                // an enclosing loop
                self.gen_ast(&body, None, looptop, Some(l_end), None)?;
            }
            self.cg.free_all_regs(None)?;
        }

        self.cg.label(l_end)?;
        Ok(None)
    }

    /// Evaluate the arguments of a call right-to-left, then call.
    fn gen_funccall(&mut self, n: &Node, nleft: Option<Node>) -> Result<Option<Reg>> {
        let mut args: Vec<(Reg, Prim)> = Vec::new();

        // The argument list is a Glue chain; the top node's right
        // child is the last argument.
        let mut glue = nleft;
        while let Some(g) = glue {
            if let Some(arg) = self.loader.load_child(g.right_id)? {
                let reg = self.gen_ast(&arg, None, None, None, Some(g.op))?;
                let reg = reg.ok_or_else(|| anyhow!("Call argument produced no value"))?;
                args.push((reg, arg.prim));
            }
            glue = self.loader.load_child(g.left_id)?;
        }

        let fsym = self.node_sym(n)?;
        self.cg.call(&fsym, &args)
    }

    /// A ternary expression: both branches move their value into one
    /// shared register.
    fn gen_ternary(
        &mut self,
        n: &Node,
        nleft: Option<Node>,
        nmid: Option<Node>,
        nright: Option<Node>,
    ) -> Result<Option<Reg>> {
        let l_false = self.cg.new_label();
        let l_end = self.cg.new_label();

        if let Some(cond) = &nleft {
            self.gen_ast(cond, Some(l_false), None, None, Some(n.op))?;
        }

        let reg = self.cg.alloc_reg(n.prim)?;

        if let Some(true_expr) = &nmid {
            let expr_reg = self.gen_ast(true_expr, None, None, None, Some(n.op))?;
            let expr_reg = expr_reg.ok_or_else(|| anyhow!("Ternary arm produced no value"))?;
            self.cg.move_reg(expr_reg, reg, true_expr.prim)?;
            self.cg.free_reg(expr_reg)?;
        }
        self.cg.jump(l_end)?;
        self.cg.label(l_false)?;

        if let Some(false_expr) = &nright {
            let expr_reg = self.gen_ast(false_expr, None, None, None, Some(n.op))?;
            let expr_reg = expr_reg.ok_or_else(|| anyhow!("Ternary arm produced no value"))?;
            self.cg.move_reg(expr_reg, reg, false_expr.prim)?;
            self.cg.free_reg(expr_reg)?;
        }
        self.cg.label(l_end)?;
        Ok(Some(reg))
    }

    /// Short-circuit OR. Jumps to the given label for jump-shaped
    /// parents, otherwise materialises 0/1.
    fn gen_logor(
        &mut self,
        n: &Node,
        nleft: Option<Node>,
        nright: Option<Node>,
        parent: Option<Op>,
        label: Option<Label>,
    ) -> Result<Option<Reg>> {
        let make_bool = !jump_parent(parent);

        let (l_true, l_false) = if make_bool {
            (self.cg.new_label(), self.cg.new_label())
        } else if parent == Some(Op::LogOr) {
            (label.unwrap(), self.cg.new_label())
        } else {
            (self.cg.new_label(), label.unwrap())
        };
        let l_end = self.cg.new_label();

        // Each operand may jump to the true label itself; when a
        // value comes back, test and jump here.
        for operand in [&nleft, &nright].into_iter().flatten() {
            let reg = self.gen_ast(operand, Some(l_true), None, None, Some(Op::LogOr))?;
            if let Some(r) = reg {
                self.cg.boolean(r, Some(Op::LogOr), Some(l_true), operand.prim)?;
                self.cg.free_all_regs(None)?;
            }
        }

        if !make_bool {
            // Both operands false: jump to the false label when the
            // parent expects a jump-if-false
            if label == Some(l_false) {
                self.cg.jump(l_false)?;
                self.cg.label(l_true)?;
            }
            return Ok(None);
        }

        // Materialise 0/1 into one stable slot shared by both paths
        let result = self.cg.alloc_reg(n.prim)?;
        self.cg.label(l_false)?;
        self.cg.load_boolean(Some(result), 0, n.prim)?;
        self.cg.jump(l_end)?;
        self.cg.label(l_true)?;
        self.cg.load_boolean(Some(result), 1, n.prim)?;
        self.cg.label(l_end)?;
        Ok(Some(result))
    }

    /// Short-circuit AND, mirroring gen_logor.
    fn gen_logand(
        &mut self,
        n: &Node,
        nleft: Option<Node>,
        nright: Option<Node>,
        parent: Option<Op>,
        label: Option<Label>,
    ) -> Result<Option<Reg>> {
        let make_bool = !jump_parent(parent);

        let (l_true, l_false) = if make_bool {
            (self.cg.new_label(), self.cg.new_label())
        } else if parent == Some(Op::LogOr) {
            (label.unwrap(), self.cg.new_label())
        } else {
            (self.cg.new_label(), label.unwrap())
        };
        let l_end = self.cg.new_label();

        for operand in [&nleft, &nright].into_iter().flatten() {
            let reg = self.gen_ast(operand, Some(l_false), None, None, Some(Op::LogAnd))?;
            if let Some(r) = reg {
                self.cg
                    .boolean(r, Some(Op::LogAnd), Some(l_false), operand.prim)?;
                self.cg.free_all_regs(None)?;
            }
        }

        if !make_bool {
            // Both operands true: jump to the true label when the
            // parent expects a jump-if-true
            if label == Some(l_true) {
                self.cg.jump(l_true)?;
                self.cg.label(l_false)?;
            }
            return Ok(None);
        }

        // Materialise 0/1 into one stable slot shared by both paths
        let result = self.cg.alloc_reg(n.prim)?;
        self.cg.label(l_true)?;
        self.cg.load_boolean(Some(result), 1, n.prim)?;
        self.cg.jump(l_end)?;
        self.cg.label(l_false)?;
        self.cg.load_boolean(Some(result), 0, n.prim)?;
        self.cg.label(l_end)?;
        Ok(Some(result))
    }

    /// Generate code for one AST node, recursively. `iflabel` is the
    /// jump target a condition's comparison uses; the loop labels
    /// serve break and continue.
    pub fn gen_ast(
        &mut self,
        n: &Node,
        iflabel: Option<Label>,
        looptop: Option<Label>,
        loopend: Option<Label>,
        parent: Option<Op>,
    ) -> Result<Option<Reg>> {
        let nleft = self.loader.load_child(n.left_id)?;
        let nmid = self.loader.load_child(n.mid_id)?;
        let nright = self.loader.load_child(n.right_id)?;

        self.update_line(n)?;

        // Control-flow nodes are handled before their children are
        // evaluated
        match n.op {
            Op::If => return self.gen_if(n, nleft, nmid, nright, looptop, loopend),
            Op::While => return self.gen_while(n, nleft, nright),
            Op::Switch => return self.gen_switch(nleft, nright, looptop),
            Op::FuncCall => return self.gen_funccall(n, nleft),
            Op::Ternary => return self.gen_ternary(n, nleft, nmid, nright),
            Op::LogOr => return self.gen_logor(n, nleft, nright, parent, iflabel),
            Op::LogAnd => return self.gen_logand(n, nleft, nright, parent, iflabel),
            Op::Glue => {
                if let Some(left) = &nleft {
                    self.gen_ast(left, iflabel, looptop, loopend, Some(n.op))?;
                }
                self.cg.free_all_regs(None)?;
                if let Some(right) = &nright {
                    self.gen_ast(right, iflabel, looptop, loopend, Some(n.op))?;
                }
                self.cg.free_all_regs(None)?;
                return Ok(None);
            }
            Op::Function => {
                let fid = n.sym.ok_or_else(|| anyhow!("Function node has no symbol"))?;
                let end_label = self.cg.new_label();
                let fsym = self
                    .syms
                    .find_by_id_mut(fid)
                    .ok_or_else(|| anyhow!("Can't find symbol with id {}", fid.0))?;
                fsym.posn = end_label.0 as i64;

                let mut fsym = fsym.clone();
                self.cur_fn = Some(fid);
                self.cg.func_preamble(&mut fsym)?;
                self.syms.replace(fsym)?;

                if let Some(body) = &nleft {
                    self.gen_ast(body, None, None, None, Some(n.op))?;
                }

                let fsym = self.cur_fn_sym()?;
                self.cg.func_postamble(&fsym)?;
                self.cur_fn = None;
                return Ok(None);
            }
            _ => {}
        }

        // General nodes: children first
        let mut leftreg = None;
        let mut rightreg = None;
        let mut prim = Prim::VOID;
        if let Some(left) = &nleft {
            prim = left.prim;
            leftreg = self.gen_ast(left, None, looptop, loopend, Some(n.op))?;
        }
        if let Some(right) = &nright {
            prim = right.prim;
            rightreg = self.gen_ast(right, None, looptop, loopend, Some(n.op))?;
        }

        let want = |r: Option<Reg>| r.ok_or_else(|| anyhow!("Operand produced no value"));

        let result: Option<Reg> = match n.op {
            Op::Add => Some(self.cg.add(want(leftreg)?, want(rightreg)?, prim)?),
            Op::Subtract => Some(self.cg.sub(want(leftreg)?, want(rightreg)?, prim)?),
            Op::Multiply => Some(self.cg.mul(want(leftreg)?, want(rightreg)?, prim)?),
            Op::Divide => Some(self.cg.div(want(leftreg)?, want(rightreg)?, prim)?),
            Op::Mod => Some(self.cg.modulo(want(leftreg)?, want(rightreg)?, prim)?),
            Op::And => Some(self.cg.bit_and(want(leftreg)?, want(rightreg)?, prim)?),
            Op::Or => Some(self.cg.bit_or(want(leftreg)?, want(rightreg)?, prim)?),
            Op::Xor => Some(self.cg.bit_xor(want(leftreg)?, want(rightreg)?, prim)?),
            Op::LShift => Some(self.cg.shl(want(leftreg)?, want(rightreg)?, prim)?),
            Op::RShift => Some(self.cg.shr(want(leftreg)?, want(rightreg)?, prim)?),

            Op::Eq | Op::Ne | Op::Lt | Op::Gt | Op::Le | Op::Ge => {
                let cmp_prim = nleft.as_ref().map(|l| l.prim).unwrap_or(prim);
                if jump_parent(parent) {
                    let label =
                        iflabel.ok_or_else(|| anyhow!("Comparison with no jump target"))?;
                    self.cg.compare_and_jump(
                        n.op,
                        parent,
                        want(leftreg)?,
                        want(rightreg)?,
                        label,
                        cmp_prim,
                    )?;
                    None
                } else {
                    Some(
                        self.cg
                            .compare_and_set(n.op, want(leftreg)?, want(rightreg)?, cmp_prim)?,
                    )
                }
            }

            Op::IntLit => Some(self.cg.load_int(n.value, n.prim)?),
            Op::StrLit => {
                let lit = self.node_sym(n)?;
                Some(self.cg.load_str_addr(Label(lit.posn as u32))?)
            }
            Op::Ident => {
                // Load only as an rvalue or under a dereference;
                // otherwise the assignment code stores through it
                if n.rvalue || parent == Some(Op::Deref) {
                    let sym = self.node_sym(n)?;
                    Some(self.cg.load_var(&sym, None)?)
                } else {
                    None
                }
            }

            Op::Assign
            | Op::AsPlus
            | Op::AsMinus
            | Op::AsStar
            | Op::AsSlash
            | Op::AsMod => {
                // Compound assignments compute into a value first,
                // then share the assignment path with the left child
                // standing in as the store target
                let (value, target_node) = match n.op {
                    Op::AsPlus => (
                        Some(self.cg.add(want(leftreg)?, want(rightreg)?, prim)?),
                        &nleft,
                    ),
                    Op::AsMinus => (
                        Some(self.cg.sub(want(leftreg)?, want(rightreg)?, prim)?),
                        &nleft,
                    ),
                    Op::AsStar => (
                        Some(self.cg.mul(want(leftreg)?, want(rightreg)?, prim)?),
                        &nleft,
                    ),
                    Op::AsSlash => (
                        Some(self.cg.div(want(leftreg)?, want(rightreg)?, prim)?),
                        &nleft,
                    ),
                    Op::AsMod => (
                        Some(self.cg.modulo(want(leftreg)?, want(rightreg)?, prim)?),
                        &nleft,
                    ),
                    _ => (leftreg, &nright),
                };
                let value = want(value)?;

                let target_node = target_node
                    .as_ref()
                    .ok_or_else(|| anyhow!("Assignment with no target"))?;
                match target_node.op {
                    Op::Ident => {
                        let sym = self.node_sym(target_node)?;
                        if matches!(
                            sym.class,
                            SymClass::Global | SymClass::Extern | SymClass::Static
                        ) {
                            Some(self.cg.store_global(value, &sym)?)
                        } else {
                            Some(self.cg.store_local(value, &sym)?)
                        }
                    }
                    Op::Deref => {
                        // A plain assignment already evaluated the
                        // target as the untouched pointer. A compound
                        // assignment consumed it as a value, so walk
                        // the target subtree a second time for the
                        // store address.
                        let ptr = if n.op == Op::Assign {
                            want(rightreg)?
                        } else {
                            let mut addr = target_node.clone();
                            addr.rvalue = false;
                            let ptr =
                                self.gen_ast(&addr, None, looptop, loopend, Some(n.op))?;
                            want(ptr)?
                        };
                        Some(self.cg.store_through(value, ptr, target_node.prim)?)
                    }
                    op => return Err(anyhow!("Can't assign through a {op:?} node")),
                }
            }

            Op::Widen => Some(self.cg.widen(
                want(leftreg)?,
                nleft.as_ref().map(|l| l.prim).unwrap_or(prim),
                n.prim,
            )?),
            Op::Cast => Some(self.cg.cast(
                want(leftreg)?,
                nleft.as_ref().map(|l| l.prim).unwrap_or(prim),
                n.prim,
            )?),

            Op::Return => {
                let fsym = self.cur_fn_sym()?;
                self.cg.gen_return(leftreg, &fsym)?;
                None
            }

            Op::Addr => {
                if n.sym.is_some() {
                    let sym = self.node_sym(n)?;
                    Some(self.cg.address_of(&sym)?)
                } else {
                    // A member access: the left register already
                    // holds the address
                    leftreg
                }
            }
            Op::Deref => {
                if n.rvalue {
                    let ptr_prim = nleft.as_ref().map(|l| l.prim).unwrap_or(prim);
                    Some(self.cg.deref(want(leftreg)?, ptr_prim)?)
                } else {
                    leftreg
                }
            }

            Op::Scale => {
                // The index becomes an address offset: widen it to
                // address width first when the index type is narrower
                let target = self.cg.target();
                let mut reg = want(leftreg)?;
                if target.prim_size(n.prim)? > target.prim_size(prim)? {
                    reg = self.cg.widen(reg, prim, n.prim)?;
                }

                // Shift for power-of-two element sizes, multiply
                // otherwise
                let reg = match n.value {
                    2 => self.cg.shl_const(reg, 1, n.prim)?,
                    4 => self.cg.shl_const(reg, 2, n.prim)?,
                    8 => self.cg.shl_const(reg, 3, n.prim)?,
                    size => {
                        let size_reg = self.cg.load_int(size, n.prim)?;
                        self.cg.mul(reg, size_reg, n.prim)?
                    }
                };
                Some(reg)
            }

            Op::PostInc | Op::PostDec => {
                let sym = self.node_sym(n)?;
                Some(self.cg.load_var(&sym, Some(n.op))?)
            }
            Op::PreInc | Op::PreDec => {
                let child = nleft
                    .as_ref()
                    .ok_or_else(|| anyhow!("Pre-increment with no operand"))?;
                let sym = self.node_sym(child)?;
                Some(self.cg.load_var(&sym, Some(n.op))?)
            }

            Op::Negate => Some(self.cg.negate(want(leftreg)?, prim)?),
            Op::Invert => Some(self.cg.invert(want(leftreg)?, prim)?),
            Op::LogNot => Some(self.cg.lognot(want(leftreg)?, prim)?),
            Op::ToBool => self.cg.boolean(want(leftreg)?, parent, iflabel, prim)?,

            Op::Break => {
                let label = loopend.ok_or_else(|| anyhow!("break with nowhere to go"))?;
                self.cg.jump(label)?;
                None
            }
            Op::Continue => {
                let label = looptop.ok_or_else(|| anyhow!("continue with nowhere to go"))?;
                self.cg.jump(label)?;
                None
            }

            op => return Err(anyhow!("Unknown AST operator {op:?}")),
        };

        Ok(result)
    }
}
