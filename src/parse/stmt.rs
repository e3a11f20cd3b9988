use anyhow::Result;

use std::io::{BufRead, Write};

use crate::ast::{Node, Op};
use crate::parse::Parser;
use crate::sym::SymClass;
use crate::token::TokenKind;
use crate::types::{modify_type, Prim};

impl<R: BufRead, W: Write> Parser<R, W> {
    /// Force a condition expression to a boolean unless it is already
    /// a comparison.
    pub(crate) fn to_bool(&mut self, cond: Node) -> Node {
        if cond.op.is_comparison() {
            return cond;
        }
        let prim = cond.prim;
        let ctype = cond.ctype;
        let line = cond.line;
        self.tb.unary(Op::ToBool, prim, ctype, cond, None, 0, line)
    }

    /// if_statement: 'if' '(' expression ')' statement
    ///               optionally followed by 'else' statement.
    fn if_statement(&mut self) -> Result<Node> {
        let line = self.line();
        self.match_token(TokenKind::If, "if")?;
        self.lparen()?;

        let cond = self.binexpr(0)?;
        let cond = self.to_bool(cond);
        self.rparen()?;

        let true_stmt = self.single_statement()?;

        let mut false_stmt = None;
        if self.toks.tok.kind == TokenKind::Else {
            self.toks.scan()?;
            false_stmt = self.single_statement()?;
        }

        Ok(self.tb.node(
            Op::If,
            Prim::NONE,
            None,
            Some(cond),
            true_stmt,
            false_stmt,
            None,
            0,
            line,
        ))
    }

    /// while_statement: 'while' '(' expression ')' statement.
    fn while_statement(&mut self) -> Result<Node> {
        let line = self.line();
        self.match_token(TokenKind::While, "while")?;
        self.lparen()?;

        let cond = self.binexpr(0)?;
        let cond = self.to_bool(cond);
        self.rparen()?;

        self.loop_level += 1;
        let body = self.single_statement()?;
        self.loop_level -= 1;

        Ok(self.tb.node(
            Op::While,
            Prim::NONE,
            None,
            Some(cond),
            None,
            body,
            None,
            0,
            line,
        ))
    }

    /// for_statement, lowered to
    /// `Glue(preop, While(cond, Glue(body, postop)))`. An empty
    /// condition defaults to true.
    fn for_statement(&mut self) -> Result<Node> {
        let line = self.line();
        self.match_token(TokenKind::For, "for")?;
        self.lparen()?;

        let preop = self.expression_list(TokenKind::Semi)?;
        self.semi()?;

        let cond = if self.toks.tok.kind == TokenKind::Semi {
            self.tb.leaf(Op::IntLit, Prim::INT, None, None, 1, line)
        } else {
            self.binexpr(0)?
        };
        let cond = self.to_bool(cond);
        self.semi()?;

        let postop = self.expression_list(TokenKind::RParen)?;
        self.rparen()?;

        self.loop_level += 1;
        let body = self.single_statement()?;
        self.loop_level -= 1;

        let inner = self.tb.node(
            Op::Glue,
            Prim::NONE,
            None,
            body,
            None,
            postop,
            None,
            0,
            line,
        );
        let while_tree = self.tb.node(
            Op::While,
            Prim::NONE,
            None,
            Some(cond),
            None,
            Some(inner),
            None,
            0,
            line,
        );
        Ok(self.tb.node(
            Op::Glue,
            Prim::NONE,
            None,
            preop,
            None,
            Some(while_tree),
            None,
            0,
            line,
        ))
    }

    /// return_statement: 'return' [ '(' expression ')' ] ';'.
    fn return_statement(&mut self) -> Result<Node> {
        let line = self.line();
        let func = self
            .syms
            .current_function()
            .ok_or_else(|| self.err("return outside a function"))?;
        let (fprim, fctype) = (func.prim, func.ctype);

        self.match_token(TokenKind::Return, "return")?;

        // A bare return is allowed in a void function
        if self.toks.tok.kind == TokenKind::Semi {
            if fprim != Prim::VOID {
                return Err(self.err("Must return a value from a non-void function"));
            }
            self.toks.scan()?;
            return Ok(self
                .tb
                .node(Op::Return, Prim::NONE, None, None, None, None, None, 0, line));
        }

        if fprim == Prim::VOID {
            return Err(self.err("Can't return from a void function"));
        }
        self.lparen()?;

        let mut tree = self.binexpr(0)?;
        tree.rvalue = true;

        let (tree, ok) = modify_type(tree, fprim, fctype, None, &mut self.tb, self.target)?;
        if !ok {
            return Err(self.err("Incompatible type to return"));
        }

        let tree = self
            .tb
            .unary(Op::Return, Prim::NONE, None, tree, None, 0, line);
        self.rparen()?;
        self.semi()?;
        Ok(tree)
    }

    fn break_statement(&mut self) -> Result<Node> {
        if self.loop_level == 0 && self.switch_level == 0 {
            return Err(self.err("no loop or switch to break out from"));
        }
        let line = self.line();
        self.toks.scan()?;
        self.semi()?;
        Ok(self.tb.leaf(Op::Break, Prim::NONE, None, None, 0, line))
    }

    fn continue_statement(&mut self) -> Result<Node> {
        if self.loop_level == 0 {
            return Err(self.err("no loop to continue to"));
        }
        let line = self.line();
        self.toks.scan()?;
        self.semi()?;
        Ok(self.tb.leaf(Op::Continue, Prim::NONE, None, None, 0, line))
    }

    /// Parse a switch statement: the integer selector, then the
    /// chained case clauses. The Switch node's value is the number
    /// of clauses, default included.
    fn switch_statement(&mut self) -> Result<Node> {
        let line = self.line();

        // Skip 'switch' and '('
        self.toks.scan()?;
        self.lparen()?;

        let selector = self.binexpr(0)?;
        self.rparen()?;
        self.lbrace()?;

        if !selector.prim.is_int() {
            return Err(self.err("Switch expression is not of integer type"));
        }

        // Each clause: the op, the case value, the body
        let mut clauses: Vec<(Op, i64, Option<Node>)> = Vec::new();
        let mut seen_default = false;

        self.switch_level += 1;
        loop {
            match self.toks.tok.kind {
                TokenKind::RBrace => {
                    if clauses.is_empty() {
                        return Err(self.err("No cases in switch"));
                    }
                    break;
                }
                TokenKind::Case | TokenKind::Default => {
                    if seen_default {
                        return Err(self.err("case or default after existing default"));
                    }
                    let (op, value) = if self.toks.tok.kind == TokenKind::Default {
                        seen_default = true;
                        self.toks.scan()?;
                        (Op::Default, 0)
                    } else {
                        self.toks.scan()?;
                        let case_expr = self.binexpr(0)?;
                        if case_expr.op != Op::IntLit {
                            return Err(self.err("Expecting integer literal for case value"));
                        }
                        let value = case_expr.value;
                        if clauses
                            .iter()
                            .any(|(op, v, _)| *op == Op::Case && *v == value)
                        {
                            return Err(self.err("Duplicate case value"));
                        }
                        (Op::Case, value)
                    };

                    self.match_token(TokenKind::Colon, ":")?;
                    let body = self.compound_statement(true)?;
                    clauses.push((op, value, body));
                }
                kind => {
                    return Err(self.err(format!(
                        "Unexpected token in switch: \"{}\"",
                        kind.spelling()
                    )))
                }
            }
        }
        self.switch_level -= 1;

        let case_count = clauses.len() as i64;
        self.rbrace()?;

        // Build the case chain back to front so every clause links to
        // the one after it
        let mut chain: Option<Node> = None;
        for (op, value, body) in clauses.into_iter().rev() {
            chain = Some(self.tb.node(op, Prim::NONE, None, body, None, chain, None, value, line));
        }

        Ok(self.tb.node(
            Op::Switch,
            Prim::NONE,
            None,
            Some(selector),
            None,
            chain,
            None,
            case_count,
            line,
        ))
    }

    /// Parse a single statement; declarations hand back the glued
    /// initialisation assignments, which may be empty.
    fn single_statement(&mut self) -> Result<Option<Node>> {
        match self.toks.tok.kind {
            TokenKind::LBrace => {
                self.lbrace()?;
                let stmt = self.compound_statement(false)?;
                self.rbrace()?;
                Ok(stmt)
            }
            TokenKind::Ident
                if self
                    .syms
                    .find_typedef(self.toks.tok.text.as_deref().unwrap_or(""))
                    .is_none() =>
            {
                // Not a typedef name: an expression statement
                let stmt = self.binexpr(0)?;
                self.semi()?;
                Ok(Some(stmt))
            }
            TokenKind::Ident
            | TokenKind::Char
            | TokenKind::Int
            | TokenKind::Long
            | TokenKind::Struct
            | TokenKind::Union
            | TokenKind::Enum
            | TokenKind::Typedef => {
                // A local declaration list; the result is any
                // initialisation assignments
                let (_, tree) =
                    self.declaration_list(SymClass::Local, TokenKind::Semi, TokenKind::Eof)?;
                self.semi()?;
                Ok(tree)
            }
            TokenKind::If => Ok(Some(self.if_statement()?)),
            TokenKind::While => Ok(Some(self.while_statement()?)),
            TokenKind::For => Ok(Some(self.for_statement()?)),
            TokenKind::Return => Ok(Some(self.return_statement()?)),
            TokenKind::Break => Ok(Some(self.break_statement()?)),
            TokenKind::Continue => Ok(Some(self.continue_statement()?)),
            TokenKind::Switch => Ok(Some(self.switch_statement()?)),
            _ => {
                // An expression statement, e.g. an assignment
                let stmt = self.binexpr(0)?;
                self.semi()?;
                Ok(Some(stmt))
            }
        }
    }

    /// Parse statements until '}' (or 'case'/'default' inside a
    /// switch body), glueing them left to right.
    pub fn compound_statement(&mut self, in_switch: bool) -> Result<Option<Node>> {
        let mut left: Option<Node> = None;

        loop {
            if self.toks.tok.kind == TokenKind::RBrace {
                return Ok(left);
            }
            if in_switch
                && matches!(self.toks.tok.kind, TokenKind::Case | TokenKind::Default)
            {
                return Ok(left);
            }

            let tree = self.single_statement()?;
            if let Some(tree) = tree {
                left = match left {
                    None => Some(tree),
                    Some(prev) => {
                        let line = tree.line;
                        Some(self.tb.node(
                            Op::Glue,
                            Prim::NONE,
                            None,
                            Some(prev),
                            None,
                            Some(tree),
                            None,
                            0,
                            line,
                        ))
                    }
                };
            }
        }
    }
}
