use anyhow::Result;

use std::io::{BufRead, Write};

use crate::ast::{Node, Op};
use crate::parse::Parser;
use crate::sym::{SymClass, SymId, SymKind};
use crate::token::TokenKind;
use crate::types::{modify_type, type_size, Prim};

/// Operator precedence for each binary-operator token, indexed by the
/// token tag. A zero entry is not a binary operator.
const OP_PREC: [i32; 26] = [
    0, // Eof
    10, 10, 10, 10, 10, 10, // assignments
    15, // ?
    20, 30, // || &&
    40, 50, 60, // | ^ &
    70, 70, // == !=
    80, 80, 80, 80, // < > <= >=
    90, 90, // << >>
    100, 100, // + -
    110, 110, 110, // * / %
];

/// Tokens that end an expression.
fn is_terminator(kind: TokenKind) -> bool {
    matches!(
        kind,
        TokenKind::Semi
            | TokenKind::RParen
            | TokenKind::RBracket
            | TokenKind::Comma
            | TokenKind::Colon
            | TokenKind::RBrace
    )
}

/// The assignment operators are right-associative.
fn right_assoc(kind: TokenKind) -> bool {
    (TokenKind::Assign..=TokenKind::AsMod).contains(&kind)
}

impl<R: BufRead, W: Write> Parser<R, W> {
    /// Check that the token is a binary operator and return its
    /// precedence.
    fn op_precedence(&self, kind: TokenKind) -> Result<i32> {
        let idx = u8::from(kind) as usize;
        if idx >= OP_PREC.len() || OP_PREC[idx] == 0 {
            return Err(self.err(format!("Syntax error, token \"{}\"", kind.spelling())));
        }
        Ok(OP_PREC[idx])
    }

    /// Map a binary-operator token to its AST operation; the two
    /// enums line up one-for-one.
    fn binastop(&self, kind: TokenKind) -> Result<Op> {
        if (TokenKind::Assign..=TokenKind::Mod).contains(&kind) {
            return Ok(Op::try_from(u8::from(kind)).unwrap());
        }
        Err(self.err(format!("Syntax error, token \"{}\"", kind.spelling())))
    }

    /// Parse zero or more comma-separated expressions up to the end
    /// token, glued together left to right. Each Glue node records
    /// the running expression count.
    pub fn expression_list(&mut self, end: TokenKind) -> Result<Option<Node>> {
        let mut tree: Option<Node> = None;
        let mut count = 0i64;

        while self.toks.tok.kind != end {
            let child = self.binexpr(0)?;
            count += 1;
            let line = child.line;
            tree = Some(self.tb.node(
                Op::Glue,
                Prim::NONE,
                None,
                tree,
                None,
                Some(child),
                None,
                count,
                line,
            ));
            if self.toks.tok.kind == end {
                break;
            }
            self.match_token(TokenKind::Comma, ",")?;
        }
        Ok(tree)
    }

    /// Parse a call to a known function; the identifier has been
    /// consumed and the current token is the '('.
    fn funccall(
        &mut self,
        fid: SymId,
        fname: &str,
        fprim: Prim,
        fctype: Option<SymId>,
    ) -> Result<Node> {
        self.lparen()?;
        let args = self.expression_list(TokenKind::RParen)?;
        let line = self.line();
        let tree = self.tb.node(
            Op::FuncCall,
            fprim,
            fctype,
            args,
            None,
            None,
            Some((fid, fname)),
            0,
            line,
        );
        self.rparen()?;
        Ok(tree)
    }

    /// `x[i]`: scale the index, add it to the pointer and dereference.
    /// The result stays an lvalue until promoted.
    fn array_access(&mut self, mut left: Node) -> Result<Node> {
        if !left.prim.is_ptr() {
            return Err(self.err("Not an array or pointer"));
        }
        self.toks.scan()?;
        let mut right = self.binexpr(0)?;
        self.match_token(TokenKind::RBracket, "]")?;
        if !right.prim.is_int() {
            return Err(self.err("Array index is not of integer type"));
        }
        left.rvalue = true;

        let (scaled, ok) = modify_type(
            right,
            left.prim,
            left.ctype,
            Some(Op::Add),
            &mut self.tb,
            self.target,
        )?;
        if !ok {
            return Err(self.err("Incompatible array index type"));
        }
        right = scaled;

        let line = self.line();
        let elem = left.prim.value_at().map_err(|e| self.err(e.to_string()))?;
        let ctype = left.ctype;
        let sum = self.tb.node(
            Op::Add,
            left.prim,
            ctype,
            Some(left),
            None,
            Some(right),
            None,
            0,
            line,
        );
        Ok(self.tb.unary(Op::Deref, elem, ctype, sum, None, 0, line))
    }

    /// `s.m` and `p->m`: add the member offset to the base address
    /// and dereference at the member's type.
    fn member_access(&mut self, mut left: Node, with_pointer: bool) -> Result<Node> {
        let struct_ptr = Prim::STRUCT.pointer_to().unwrap();
        let union_ptr = Prim::UNION.pointer_to().unwrap();
        if with_pointer && left.prim != struct_ptr && left.prim != union_ptr {
            return Err(self.err("Expression is not a pointer to a struct/union"));
        }
        if !with_pointer {
            if left.prim == Prim::STRUCT || left.prim == Prim::UNION {
                // Use the base address, not the value at it; the
                // variable must therefore live in memory
                left.op = Op::Addr;
                if let Some(id) = left.sym {
                    self.syms.set_has_addr(id)?;
                }
            } else {
                return Err(self.err("Expression is not a struct/union"));
            }
        }

        // Skip the '.' or '->' and get the member name
        self.toks.scan()?;
        let name = self.toks.tok.text.clone().unwrap_or_default();
        self.ident()?;

        let ctype_id = left
            .ctype
            .ok_or_else(|| self.err("Expression has no composite type"))?;
        let ctype = self.syms.must_find_by_id(ctype_id)?;
        let member = ctype
            .members
            .iter()
            .find(|m| m.name == name)
            .ok_or_else(|| self.err(format!("No member found in struct/union: {name}")))?;
        let (mprim, mctype, moffset) = (member.prim, member.ctype, member.posn);

        left.rvalue = true;
        let line = self.line();
        // The offset is address arithmetic, so it gets address width
        let offset = self
            .tb
            .leaf(Op::IntLit, self.target.addr_int(), None, None, moffset, line);
        let mptr = mprim.pointer_to().map_err(|e| self.err(e.to_string()))?;
        let sum = self.tb.node(
            Op::Add,
            mptr,
            mctype,
            Some(left),
            None,
            Some(offset),
            None,
            0,
            line,
        );
        Ok(self.tb.unary(Op::Deref, mprim, mctype, sum, None, 0, line))
    }

    /// A parenthesised expression or a cast.
    fn paren_expression(&mut self, ptp: i32) -> Result<Node> {
        // Skip the '('
        self.toks.scan()?;

        let is_cast = match self.toks.tok.kind {
            TokenKind::Void
            | TokenKind::Char
            | TokenKind::Int
            | TokenKind::Long
            | TokenKind::Struct
            | TokenKind::Union
            | TokenKind::Enum => true,
            TokenKind::Ident => {
                let name = self.toks.tok.text_or_err()?;
                self.syms.find_typedef(name).is_some()
            }
            _ => false,
        };

        if !is_cast {
            let n = self.binexpr(0)?;
            self.rparen()?;
            return Ok(n);
        }

        // A cast: get the type, then the expression it applies to.
        // The cast does not change the expression's precedence.
        let (prim, ctype) = self.parse_cast()?;
        self.rparen()?;
        let n = self.binexpr(ptp)?;
        let line = self.line();
        Ok(self.tb.unary(Op::Cast, prim, ctype, n, None, 0, line))
    }

    /// Parse a primary factor.
    fn primary(&mut self, ptp: i32) -> Result<Node> {
        let line = self.line();
        let n = match self.toks.tok.kind {
            TokenKind::Static | TokenKind::Extern => {
                return Err(self.err("Compiler doesn't support static or extern local declarations"))
            }
            TokenKind::Sizeof => {
                self.toks.scan()?;
                if self.toks.tok.kind != TokenKind::LParen {
                    return Err(self.err("Left parenthesis expected after sizeof"));
                }
                self.toks.scan()?;

                let mut class = SymClass::Global;
                let (prim, ctype) = self.parse_type(&mut class)?;
                let prim = prim.ok_or_else(|| self.err("Expected a type after sizeof"))?;
                let prim = self.parse_stars(prim)?;
                let ctype_sym = ctype.and_then(|id| self.syms.find_by_id(id));
                let size = type_size(prim, ctype_sym, self.target)?;
                self.rparen()?;
                return Ok(self.tb.leaf(Op::IntLit, Prim::INT, None, None, size, line));
            }
            TokenKind::IntLit => {
                // Literals that fit a char are char-typed
                let value = self.toks.tok.value;
                let prim = if (0..256).contains(&value) {
                    Prim::CHAR
                } else {
                    Prim::INT
                };
                self.tb.leaf(Op::IntLit, prim, None, None, value as i64, line)
            }
            TokenKind::CharLit => {
                let value = self.toks.tok.value;
                self.tb
                    .leaf(Op::IntLit, Prim::CHAR, None, None, value as i64, line)
            }
            TokenKind::StrLit => {
                // The literal becomes an anonymous symbol; its label
                // is assigned when the generator emits it.
                let text = self.toks.tok.text.clone().unwrap_or_default();
                let prim = Prim::CHAR.pointer_to().unwrap();
                let id = self.syms.add_global(
                    &text,
                    prim,
                    None,
                    SymKind::StrLit,
                    SymClass::Static,
                    1,
                    0,
                )?;
                self.tb
                    .leaf(Op::StrLit, prim, None, Some((id, &text)), id.0 as i64, line)
            }
            TokenKind::Ident => {
                let name = self.toks.tok.text_or_err()?.to_owned();

                // An enum value is just an integer literal
                if let Some(enum_val) = self.syms.find_enum_value(&name) {
                    let value = enum_val.posn;
                    let n = self.tb.leaf(Op::IntLit, Prim::INT, None, None, value, line);
                    self.toks.scan()?;
                    return Ok(n);
                }

                let Some(sym) = self.syms.find_symbol(&name) else {
                    return Err(self.err(format!("Unknown variable or function \"{name}\"")));
                };
                let (id, kind, prim, ctype) = (sym.id, sym.kind, sym.prim, sym.ctype);
                match kind {
                    SymKind::Variable => {
                        self.tb
                            .leaf(Op::Ident, prim, ctype, Some((id, &name)), 0, line)
                    }
                    SymKind::Array => {
                        let mut n =
                            self.tb
                                .leaf(Op::Addr, prim, ctype, Some((id, &name)), 0, line);
                        n.rvalue = true;
                        n
                    }
                    SymKind::Function => {
                        self.toks.scan()?;
                        if self.toks.tok.kind != TokenKind::LParen {
                            return Err(
                                self.err(format!("Function name used without parentheses: {name}"))
                            );
                        }
                        return self.funccall(id, &name, prim, ctype);
                    }
                    _ => {
                        return Err(
                            self.err(format!("Identifier not a scalar or array variable: {name}"))
                        )
                    }
                }
            }
            TokenKind::LParen => return self.paren_expression(ptp),
            kind => {
                return Err(self.err(format!(
                    "Expecting a primary expression, got token \"{}\"",
                    kind.spelling()
                )))
            }
        };

        self.toks.scan()?;
        Ok(n)
    }

    /// Parse a postfix expression: array references, member accesses
    /// and post-increment/decrement.
    fn postfix(&mut self, ptp: i32) -> Result<Node> {
        let mut n = self.primary(ptp)?;

        loop {
            match self.toks.tok.kind {
                TokenKind::LBracket => n = self.array_access(n)?,
                TokenKind::Dot => n = self.member_access(n, false)?,
                TokenKind::Arrow => n = self.member_access(n, true)?,
                TokenKind::Inc | TokenKind::Dec => {
                    if n.rvalue {
                        return Err(self.err("Cannot ++ or -- an rvalue"));
                    }
                    if n.op == Op::PostInc || n.op == Op::PostDec {
                        return Err(self.err("Cannot ++ and/or -- more than once"));
                    }
                    n.op = if self.toks.tok.kind == TokenKind::Inc {
                        Op::PostInc
                    } else {
                        Op::PostDec
                    };
                    self.toks.scan()?;
                }
                _ => return Ok(n),
            }
        }
    }

    /// Parse a prefix expression.
    fn prefix(&mut self, ptp: i32) -> Result<Node> {
        let line = self.line();
        let tree = match self.toks.tok.kind {
            TokenKind::Amper => {
                self.toks.scan()?;
                let mut tree = self.prefix(ptp)?;
                if tree.op != Op::Ident {
                    return Err(self.err("& operator must be followed by an identifier"));
                }
                // Change to an address operation and force the
                // variable to live in memory
                tree.op = Op::Addr;
                tree.prim = tree.prim.pointer_to().map_err(|e| self.err(e.to_string()))?;
                if let Some(id) = tree.sym {
                    self.syms.set_has_addr(id)?;
                }
                tree
            }
            TokenKind::Star => {
                self.toks.scan()?;
                let mut tree = self.prefix(ptp)?;
                tree.rvalue = true;
                if !tree.prim.is_ptr() {
                    return Err(
                        self.err("* operator must be followed by an expression of pointer type")
                    );
                }
                let elem = tree.prim.value_at().map_err(|e| self.err(e.to_string()))?;
                let ctype = tree.ctype;
                self.tb.unary(Op::Deref, elem, ctype, tree, None, 0, line)
            }
            TokenKind::Minus => {
                self.toks.scan()?;
                let mut tree = self.prefix(ptp)?;
                // Chars are unsigned, so negate at int width
                tree.rvalue = true;
                if tree.prim == Prim::CHAR {
                    tree.prim = Prim::INT;
                }
                let prim = tree.prim;
                let ctype = tree.ctype;
                self.tb.unary(Op::Negate, prim, ctype, tree, None, 0, line)
            }
            TokenKind::Invert => {
                self.toks.scan()?;
                let mut tree = self.prefix(ptp)?;
                tree.rvalue = true;
                let prim = tree.prim;
                let ctype = tree.ctype;
                self.tb.unary(Op::Invert, prim, ctype, tree, None, 0, line)
            }
            TokenKind::LogNot => {
                self.toks.scan()?;
                let mut tree = self.prefix(ptp)?;
                tree.rvalue = true;
                let prim = tree.prim;
                let ctype = tree.ctype;
                self.tb.unary(Op::LogNot, prim, ctype, tree, None, 0, line)
            }
            TokenKind::Inc => {
                self.toks.scan()?;
                let tree = self.prefix(ptp)?;
                if tree.op != Op::Ident {
                    return Err(self.err("++ operator must be followed by an identifier"));
                }
                let prim = tree.prim;
                let ctype = tree.ctype;
                self.tb.unary(Op::PreInc, prim, ctype, tree, None, 0, line)
            }
            TokenKind::Dec => {
                self.toks.scan()?;
                let tree = self.prefix(ptp)?;
                if tree.op != Op::Ident {
                    return Err(self.err("-- operator must be followed by an identifier"));
                }
                let prim = tree.prim;
                let ctype = tree.ctype;
                self.tb.unary(Op::PreDec, prim, ctype, tree, None, 0, line)
            }
            _ => self.postfix(ptp)?,
        };
        Ok(tree)
    }

    /// Pratt expression parser. `ptp` is the previous token's
    /// precedence.
    pub fn binexpr(&mut self, ptp: i32) -> Result<Node> {
        let mut left = self.prefix(ptp)?;

        let mut kind = self.toks.tok.kind;
        if is_terminator(kind) {
            left.rvalue = true;
            return Ok(left);
        }

        while self.op_precedence(kind)? > ptp
            || (right_assoc(kind) && self.op_precedence(kind)? == ptp)
        {
            self.toks.scan()?;
            let mut right = self.binexpr(OP_PREC[u8::from(kind) as usize])?;
            let op = self.binastop(kind)?;

            match op {
                Op::Ternary => {
                    self.match_token(TokenKind::Colon, ":")?;
                    let false_expr = self.binexpr(0)?;
                    let line = self.line();
                    let prim = right.prim;
                    let ctype = right.ctype;
                    let cond = self.to_bool(left);
                    return Ok(self.tb.node(
                        Op::Ternary,
                        prim,
                        ctype,
                        Some(cond),
                        Some(right),
                        Some(false_expr),
                        None,
                        0,
                        line,
                    ));
                }
                Op::Assign => {
                    right.rvalue = true;
                    let (modified, ok) = modify_type(
                        right,
                        left.prim,
                        left.ctype,
                        None,
                        &mut self.tb,
                        self.target,
                    )?;
                    if !ok {
                        return Err(self.err("Incompatible expression in assignment"));
                    }
                    right = modified;
                    // Swap the children so the value expression is
                    // generated before the assignment target
                    std::mem::swap(&mut left, &mut right);
                }
                _ => {
                    left.rvalue = true;
                    right.rvalue = true;
                    let (lprim, lctype) = (left.prim, left.ctype);
                    let (rprim, rctype) = (right.prim, right.ctype);
                    let (new_left, lok) =
                        modify_type(left, rprim, rctype, Some(op), &mut self.tb, self.target)?;
                    let (new_right, rok) =
                        modify_type(right, lprim, lctype, Some(op), &mut self.tb, self.target)?;
                    if !lok && !rok {
                        return Err(self.err("Incompatible types in binary expression"));
                    }
                    left = new_left;
                    right = new_right;
                }
            }

            let line = self.line();
            let prim = left.prim;
            let ctype = left.ctype;
            left = self.tb.node(
                op,
                prim,
                ctype,
                Some(left),
                None,
                Some(right),
                None,
                0,
                line,
            );

            // Comparisons and logical operations produce an int
            if op.is_comparison() || matches!(op, Op::LogAnd | Op::LogOr) {
                left.prim = Prim::INT;
            }

            kind = self.toks.tok.kind;
            if is_terminator(kind) {
                left.rvalue = true;
                return Ok(left);
            }
        }

        left.rvalue = true;
        Ok(left)
    }
}
