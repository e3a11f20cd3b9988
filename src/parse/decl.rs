use anyhow::Result;

use std::io::{BufRead, Write};

use crate::ast::{fold::optimise, Node, Op};
use crate::parse::Parser;
use crate::sym::{SymClass, SymId, SymKind};
use crate::token::TokenKind;
use crate::types::{modify_type, type_size, Prim};

impl<R: BufRead, W: Write> Parser<R, W> {
    /// Parse one or more global declarations until end of input.
    pub fn global_declarations(&mut self) -> Result<()> {
        while self.toks.tok.kind != TokenKind::Eof {
            self.declaration_list(SymClass::Global, TokenKind::Semi, TokenKind::Eof)?;
            if self.toks.tok.kind == TokenKind::Semi {
                self.toks.scan()?;
            }
        }
        Ok(())
    }

    /// Parse a list of symbols that share an initial type. `et1` and
    /// `et2` are the tokens that end the list. Returns the parsed
    /// type, or None when the type declaration itself consumed the
    /// whole statement, plus the glued assignment trees of any
    /// initialised locals.
    pub fn declaration_list(
        &mut self,
        class: SymClass,
        et1: TokenKind,
        et2: TokenKind,
    ) -> Result<(Option<Prim>, Option<Node>)> {
        let mut class = class;
        let mut glue: Option<Node> = None;

        let (Some(init_type), ctype) = self.parse_type(&mut class)? else {
            return Ok((None, None));
        };

        loop {
            let prim = self.parse_stars(init_type)?;
            let (kind, tree) = self.symbol_declaration(prim, ctype, class)?;

            // A function has a body, not a declarator list
            if kind == SymKind::Function {
                if class != SymClass::Global && class != SymClass::Static {
                    return Err(self.err("Function definition not at global level"));
                }
                return Ok((Some(prim), None));
            }

            // Glue an initialised local's assignment onto the list
            glue = match (glue, tree) {
                (None, tree) => tree,
                (Some(glue), None) => Some(glue),
                (Some(prev), Some(tree)) => {
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

            if self.toks.tok.kind == et1 || self.toks.tok.kind == et2 {
                return Ok((Some(prim), glue));
            }
            self.comma()?;
        }
    }

    /// Parse an optional storage class and a type keyword. A
    /// composite, enum or typedef declaration directly followed by a
    /// ';' declares no symbol: the type comes back as None.
    pub fn parse_type(&mut self, class: &mut SymClass) -> Result<(Option<Prim>, Option<SymId>)> {
        // Leading extern/static change the symbol's class
        loop {
            match self.toks.tok.kind {
                TokenKind::Extern => {
                    if *class == SymClass::Static {
                        return Err(self.err("Illegal to have extern and static at the same time"));
                    }
                    *class = SymClass::Extern;
                    self.toks.scan()?;
                }
                TokenKind::Static => {
                    if *class == SymClass::Local {
                        return Err(
                            self.err("Compiler doesn't support static local declarations")
                        );
                    }
                    if *class == SymClass::Extern {
                        return Err(self.err("Illegal to have extern and static at the same time"));
                    }
                    *class = SymClass::Static;
                    self.toks.scan()?;
                }
                _ => break,
            }
        }

        let mut ctype = None;
        let prim = match self.toks.tok.kind {
            TokenKind::Void => {
                self.toks.scan()?;
                Prim::VOID
            }
            TokenKind::Char => {
                self.toks.scan()?;
                Prim::CHAR
            }
            TokenKind::Int => {
                self.toks.scan()?;
                Prim::INT
            }
            TokenKind::Long => {
                self.toks.scan()?;
                Prim::LONG
            }
            TokenKind::Struct => {
                ctype = Some(self.composite_declaration(Prim::STRUCT)?);
                if self.toks.tok.kind == TokenKind::Semi {
                    return Ok((None, ctype));
                }
                Prim::STRUCT
            }
            TokenKind::Union => {
                ctype = Some(self.composite_declaration(Prim::UNION)?);
                if self.toks.tok.kind == TokenKind::Semi {
                    return Ok((None, ctype));
                }
                Prim::UNION
            }
            TokenKind::Enum => {
                // Enums are really ints
                self.enum_declaration()?;
                if self.toks.tok.kind == TokenKind::Semi {
                    return Ok((None, None));
                }
                Prim::INT
            }
            TokenKind::Typedef => {
                let (prim, tctype) = self.typedef_declaration()?;
                ctype = tctype;
                if self.toks.tok.kind == TokenKind::Semi {
                    return Ok((None, ctype));
                }
                prim
            }
            TokenKind::Ident => {
                let name = self.toks.tok.text_or_err()?.to_owned();
                let (prim, tctype) = self.type_of_typedef(&name)?;
                ctype = tctype;
                prim
            }
            kind => {
                return Err(self.err(format!("Illegal type, token \"{}\"", kind.spelling())))
            }
        };
        Ok((Some(prim), ctype))
    }

    /// Scan any '*' tokens after a type.
    pub fn parse_stars(&mut self, mut prim: Prim) -> Result<Prim> {
        while self.toks.tok.kind == TokenKind::Star {
            prim = prim.pointer_to().map_err(|e| self.err(e.to_string()))?;
            self.toks.scan()?;
        }
        Ok(prim)
    }

    /// Parse the type inside a cast.
    pub fn parse_cast(&mut self) -> Result<(Prim, Option<SymId>)> {
        let mut class = SymClass::Global;
        let (prim, ctype) = self.parse_type(&mut class)?;
        let prim = prim.ok_or_else(|| self.err("Expected a type in cast"))?;
        let prim = self.parse_stars(prim)?;
        if matches!(prim, Prim::STRUCT | Prim::UNION | Prim::VOID) {
            return Err(self.err("Cannot cast to a struct, union or void type"));
        }
        Ok((prim, ctype))
    }

    /// Parse an expression of literals, fold it, and check its type
    /// against the given one. Returns the literal value; for a string
    /// literal assigned to a char pointer, the value is the string
    /// symbol's id, rewritten to a label before emission.
    pub fn parse_literal(&mut self, prim: Prim) -> Result<i32> {
        let tree = self.binexpr(0)?;
        let mut tree = optimise(tree, &mut self.tb);

        // A cast just re-tags the literal under it
        if tree.op == Op::Cast {
            let cast_prim = tree.prim;
            let mut inner = *tree.left.take().unwrap();
            inner.prim = cast_prim;
            tree = inner;
        }

        if tree.op != Op::IntLit && tree.op != Op::StrLit {
            return Err(self.err("Cannot initialise globals with a general expression"));
        }

        if prim == Prim::CHAR.pointer_to().unwrap() {
            if tree.op == Op::StrLit {
                return Ok(tree.value as i32);
            }
            if tree.op == Op::IntLit && tree.value == 0 {
                return Ok(0);
            }
        }

        if prim.is_int()
            && tree.prim.is_int()
            && type_size(prim, None, self.target)? >= type_size(tree.prim, None, self.target)?
        {
            return Ok(tree.value as i32);
        }

        Err(self.err("Type mismatch: literal vs. variable"))
    }

    /// A global symbol may be declared extern first and defined
    /// global later, or the other way around, with identical types.
    /// Returns the existing symbol's id in that case, None when the
    /// name is new, and an error on any other redeclaration.
    fn existing_global(
        &mut self,
        name: &str,
        class: SymClass,
        prim: Prim,
        ctype: Option<SymId>,
    ) -> Result<Option<SymId>> {
        let Some(sym) = self.syms.find_global_mut(name) else {
            return Ok(None);
        };

        let promotes = (sym.class == SymClass::Global && class == SymClass::Extern)
            || (sym.class == SymClass::Extern && class == SymClass::Global);
        if promotes {
            if prim != sym.prim || (prim.is_composite() && ctype != sym.ctype) {
                return Err(self
                    .toks
                    .pos
                    .error(format!("Type mismatch between global/extern: {name}")));
            }
            sym.class = SymClass::Global;
            return Ok(Some(sym.id));
        }

        Err(self
            .toks
            .pos
            .error(format!("Duplicate global variable declaration: {name}")))
    }

    /// Parse a scalar variable's declaration and any initialisation.
    fn scalar_declaration(
        &mut self,
        varname: &str,
        prim: Prim,
        ctype: Option<SymId>,
        class: SymClass,
    ) -> Result<(SymId, Option<Node>)> {
        let id = match class {
            SymClass::Static | SymClass::Extern | SymClass::Global => {
                match self.existing_global(varname, class, prim, ctype)? {
                    Some(id) => id,
                    None => self.syms.add_global(
                        varname,
                        prim,
                        ctype,
                        SymKind::Variable,
                        class,
                        1,
                        0,
                    )?,
                }
            }
            SymClass::Local => self
                .syms
                .add_local(varname, prim, ctype, SymKind::Variable, 1)?,
            SymClass::Param => self.syms.add_parameter(varname, prim, ctype)?,
            SymClass::Member => self
                .syms
                .add_member(varname, prim, ctype, SymKind::Variable, 1)?,
        };

        let mut tree = None;
        if self.toks.tok.kind == TokenKind::Assign {
            if !matches!(class, SymClass::Global | SymClass::Local | SymClass::Static) {
                return Err(self.err(format!("Variable {varname} can not be initialised")));
            }
            self.toks.scan()?;

            if class == SymClass::Global || class == SymClass::Static {
                // Globals get a single literal initialiser
                let value = self.parse_literal(prim)?;
                let sym = self.syms.find_by_id_mut(id).unwrap();
                sym.init_list = Some(vec![value]);
            } else {
                // A local initialiser is an ordinary assignment
                let line = self.line();
                let varnode = self
                    .tb
                    .leaf(Op::Ident, prim, ctype, Some((id, varname)), 0, line);
                let mut expr = self.binexpr(0)?;
                expr.rvalue = true;

                let (expr, ok) =
                    modify_type(expr, prim, ctype, None, &mut self.tb, self.target)?;
                if !ok {
                    return Err(self.err("Incompatible expression in assignment"));
                }

                let (eprim, ectype) = (expr.prim, expr.ctype);
                tree = Some(self.tb.node(
                    Op::Assign,
                    eprim,
                    ectype,
                    Some(expr),
                    None,
                    Some(varnode),
                    None,
                    0,
                    line,
                ));
            }
        }

        Ok((id, tree))
    }

    /// Parse an array declaration: the optional size, then an
    /// optional `{ literal, ... }` initialiser list.
    fn array_declaration(
        &mut self,
        varname: &str,
        prim: Prim,
        ctype: Option<SymId>,
        class: SymClass,
    ) -> Result<SymId> {
        // Skip the '['
        self.toks.scan()?;

        let mut nelems: Option<i64> = None;
        if self.toks.tok.kind != TokenKind::RBracket {
            let n = self.parse_literal(Prim::INT)? as i64;
            if n <= 0 {
                return Err(self.err(format!("Array size is illegal: {n}")));
            }
            nelems = Some(n);
        }
        self.match_token(TokenKind::RBracket, "]")?;

        // The array is a pointer to its elements' type
        let array_prim = prim.pointer_to().map_err(|e| self.err(e.to_string()))?;
        let id = match class {
            SymClass::Static | SymClass::Extern | SymClass::Global => {
                match self.existing_global(varname, class, array_prim, ctype)? {
                    Some(id) => id,
                    None => self.syms.add_global(
                        varname,
                        array_prim,
                        ctype,
                        SymKind::Array,
                        class,
                        0,
                        0,
                    )?,
                }
            }
            SymClass::Local => self
                .syms
                .add_local(varname, array_prim, ctype, SymKind::Array, 0)?,
            _ => return Err(self.err("Declaration of array parameters is not implemented")),
        };

        let mut init_list = None;
        let mut given = 0i64;
        if self.toks.tok.kind == TokenKind::Assign {
            if class != SymClass::Global && class != SymClass::Static {
                return Err(self.err(format!("Variable {varname} can not be initialised")));
            }
            self.toks.scan()?;
            self.lbrace()?;

            let mut values = Vec::new();
            loop {
                if let Some(n) = nelems {
                    if values.len() as i64 == n {
                        return Err(self.err("Too many values in initialisation list"));
                    }
                }
                values.push(self.parse_literal(prim)?);

                if self.toks.tok.kind == TokenKind::RBrace {
                    self.toks.scan()?;
                    break;
                }
                self.comma()?;
            }
            given = values.len() as i64;

            // Missing trailing elements are zero
            if let Some(n) = nelems {
                values.resize(n as usize, 0);
            }
            init_list = Some(values);
        }

        let nelems = nelems.unwrap_or(given);
        if class != SymClass::Extern && nelems <= 0 {
            return Err(self.err(format!("Array must have non-zero elements: {varname}")));
        }

        let ctype_sym = ctype.and_then(|c| self.syms.find_by_id(c));
        let size = nelems * type_size(prim, ctype_sym, self.target)?;
        let sym = self.syms.find_by_id_mut(id).unwrap();
        sym.nelems = nelems;
        sym.size = size;
        if init_list.is_some() {
            sym.init_list = init_list;
        }
        Ok(id)
    }

    /// Parse the parameter list of a function declaration, checking
    /// it against any previous prototype. Returns the parameter count
    /// and whether the list ends in an ellipsis.
    fn param_declaration_list(&mut self, old: Option<SymId>) -> Result<(i64, bool)> {
        // The prototype's parameter types, if there is one
        let proto: Option<(String, i64, Vec<Prim>)> = old.map(|id| {
            let sym = self.syms.must_find_by_id(id).unwrap();
            (
                sym.name.clone(),
                sym.nelems,
                sym.members
                    .iter()
                    .filter(|m| m.class == SymClass::Param)
                    .map(|m| m.prim)
                    .collect(),
            )
        });

        let mut count = 0i64;
        let mut variadic = false;

        while self.toks.tok.kind != TokenKind::RParen {
            // 'void' alone means no parameters
            if self.toks.tok.kind == TokenKind::Void
                && self.toks.peek()?.kind == TokenKind::RParen
            {
                self.toks.scan()?;
                count = 0;
                break;
            }

            if self.toks.tok.kind == TokenKind::Ellipsis {
                variadic = true;
                self.toks.scan()?;
                break;
            }

            let (prim, _) =
                self.declaration_list(SymClass::Param, TokenKind::Comma, TokenKind::RParen)?;
            let Some(prim) = prim else {
                return Err(self.err("Bad type in parameter list"));
            };

            if let Some((ref fname, _, ref prims)) = proto {
                match prims.get(count as usize) {
                    Some(&p) if p == prim => {}
                    _ => {
                        return Err(self.err(format!(
                            "Type doesn't match prototype for parameter {} of {fname}",
                            count + 1
                        )))
                    }
                }
            }
            count += 1;

            if self.toks.tok.kind == TokenKind::RParen {
                break;
            }
            self.comma()?;
        }

        if let Some((fname, nelems, _)) = proto {
            if count != nelems {
                return Err(self.err(format!("Parameter count mismatch for function {fname}")));
            }
        }
        Ok((count, variadic))
    }

    /// Parse a function declaration: the parameter list, then either
    /// a ';' for a prototype or the body. A body is parsed, checked,
    /// folded and streamed to the AST file.
    fn function_declaration(
        &mut self,
        funcname: &str,
        prim: Prim,
        ctype: Option<SymId>,
        class: SymClass,
    ) -> Result<SymId> {
        let line = self.line();

        // An earlier declaration of this function, if any
        let old = self
            .syms
            .find_symbol(funcname)
            .filter(|s| s.kind == SymKind::Function)
            .map(|s| s.id);

        let new = match old {
            Some(_) => None,
            None => Some(self.syms.add_global(
                funcname,
                prim,
                None,
                SymKind::Function,
                class,
                0,
                0,
            )?),
        };

        self.lparen()?;
        let (count, variadic) = self.param_declaration_list(old)?;
        self.rparen()?;

        let params = self.syms.take_members();
        let fid = match new {
            Some(id) => {
                let sym = self.syms.find_by_id_mut(id).unwrap();
                sym.nelems = count;
                sym.variadic = variadic;
                sym.members = params;
                id
            }
            None => {
                let id = old.unwrap();
                // The definition's parameter names replace the
                // prototype's, which may have used different ones
                if self.toks.tok.kind != TokenKind::Semi {
                    self.syms.find_by_id_mut(id).unwrap().members = params;
                }
                id
            }
        };

        // Just a prototype
        if self.toks.tok.kind == TokenKind::Semi {
            return Ok(fid);
        }

        self.syms.enter_function(fid)?;
        self.loop_level = 0;
        self.switch_level = 0;
        self.lbrace()?;
        let body = self.compound_statement(false)?;
        self.rbrace()?;

        if prim != Prim::VOID {
            let Some(ref body) = body else {
                return Err(self.err("No statements in function with non-void type"));
            };
            let final_stmt = if body.op == Op::Glue {
                body.right_ref()
            } else {
                Some(body)
            };
            if final_stmt.map(|n| n.op) != Some(Op::Return) {
                return Err(self.err("No return for function with non-void type"));
            }
        }

        let mut tree = self.tb.node(
            Op::Function,
            prim,
            ctype,
            body,
            None,
            None,
            Some((fid, funcname)),
            0,
            line,
        );
        tree.line = line;

        let tree = optimise(tree, &mut self.tb);
        self.ast.write_tree(&tree)?;
        self.syms.free_local_symbols();
        Ok(fid)
    }

    /// Parse a struct or union declaration, or a reference to an
    /// existing one. Returns the composite type's symbol id.
    fn composite_declaration(&mut self, prim: Prim) -> Result<SymId> {
        // Skip the struct/union keyword
        self.toks.scan()?;

        let mut name = String::new();
        let mut existing = None;
        if self.toks.tok.kind == TokenKind::Ident {
            name = self.toks.tok.text_or_err()?.to_owned();
            existing = if prim == Prim::STRUCT {
                self.syms.find_struct(&name).map(|s| s.id)
            } else {
                self.syms.find_union(&name).map(|s| s.id)
            };
            self.toks.scan()?;
        }

        // No brace: a use of an already-declared type
        if self.toks.tok.kind != TokenKind::LBrace {
            return existing.ok_or_else(|| self.err(format!("unknown struct/union type: {name}")));
        }
        if existing.is_some() {
            return Err(self.err(format!("previously defined struct/union: {name}")));
        }

        let id = if prim == Prim::STRUCT {
            self.syms.add_struct(&name)?
        } else {
            self.syms.add_union(&name)?
        };
        self.toks.scan()?;

        // Scan in the member list
        loop {
            let (t, _) =
                self.declaration_list(SymClass::Member, TokenKind::Semi, TokenKind::RBrace)?;
            if t.is_none() {
                return Err(self.err("Bad type in member list"));
            }
            if self.toks.tok.kind == TokenKind::Semi {
                self.toks.scan()?;
            }
            if self.toks.tok.kind == TokenKind::RBrace {
                break;
            }
        }
        self.rbrace()?;

        let mut members = self.syms.take_members();
        if members.is_empty() {
            return Err(self.err(format!("No members in struct/union: {name}")));
        }

        // Lay the members out: each struct member goes at the first
        // aligned position at or after the previous member's end, a
        // union member always at offset zero.
        let mut offset = 0i64;
        let mut max_size = 0i64;
        for m in members.iter_mut() {
            let msize = {
                let ctype_sym = m.ctype.and_then(|c| self.syms.find_by_id(c));
                type_size(m.prim, ctype_sym, self.target)?
            };
            if prim == Prim::STRUCT {
                offset = self.target.align(m.prim, offset, 1);
                m.posn = offset;
                offset += msize;
            } else {
                m.posn = 0;
                max_size = max_size.max(msize);
            }
        }

        let size = if prim == Prim::STRUCT { offset } else { max_size };
        let sym = self.syms.find_by_id_mut(id).unwrap();
        sym.members = members;
        sym.size = size;
        Ok(id)
    }

    /// Parse an enum declaration: a named or anonymous value list,
    /// or a reference to an existing enum type.
    fn enum_declaration(&mut self) -> Result<()> {
        // Skip the enum keyword
        self.toks.scan()?;

        let mut name = String::new();
        let mut existing = false;
        if self.toks.tok.kind == TokenKind::Ident {
            name = self.toks.tok.text_or_err()?.to_owned();
            existing = self.syms.find_enum_type(&name).is_some();
            self.toks.scan()?;
        }

        if self.toks.tok.kind != TokenKind::LBrace {
            if !existing {
                return Err(self.err(format!("undeclared enum type: {name}")));
            }
            return Ok(());
        }
        self.toks.scan()?;
        if existing {
            return Err(self.err(format!("enum type redeclared: {name}")));
        }
        self.syms.add_enum_type(&name)?;

        let mut value = 0i64;
        loop {
            let valname = self.toks.tok.text.clone().unwrap_or_default();
            self.ident()?;
            if self.syms.find_enum_value(&valname).is_some() {
                return Err(self.err(format!("enum value redeclared: {valname}")));
            }

            if self.toks.tok.kind == TokenKind::Assign {
                self.toks.scan()?;
                if self.toks.tok.kind != TokenKind::IntLit {
                    return Err(self.err("Expected int literal after '='"));
                }
                value = self.toks.tok.value as i64;
                self.toks.scan()?;
            }

            self.syms.add_enum_value(&valname, value)?;
            value += 1;

            if self.toks.tok.kind == TokenKind::RBrace {
                break;
            }
            self.comma()?;
        }
        // Skip the right curly bracket
        self.toks.scan()?;
        Ok(())
    }

    /// Parse a typedef declaration; returns the aliased type.
    fn typedef_declaration(&mut self) -> Result<(Prim, Option<SymId>)> {
        // Skip the typedef keyword
        self.toks.scan()?;

        let mut class = SymClass::Global;
        let (prim, ctype) = self.parse_type(&mut class)?;
        if class != SymClass::Global {
            return Err(self.err("Can't have static/extern in a typedef declaration"));
        }
        let prim = prim.ok_or_else(|| self.err("Expected a type in typedef"))?;
        let prim = self.parse_stars(prim)?;

        let name = self.toks.tok.text.clone().unwrap_or_default();
        if self.syms.find_typedef(&name).is_some() {
            return Err(self.err(format!("redefinition of typedef {name}")));
        }
        self.syms.add_typedef(&name, prim, ctype)?;
        self.toks.scan()?;
        Ok((prim, ctype))
    }

    /// Given a typedef name, return the type it aliases.
    fn type_of_typedef(&mut self, name: &str) -> Result<(Prim, Option<SymId>)> {
        let Some(t) = self.syms.find_typedef(name) else {
            return Err(self.err(format!("unknown type: {name}")));
        };
        let result = (t.prim, t.ctype);
        self.toks.scan()?;
        Ok(result)
    }

    /// Parse the declaration of one variable or a function. The type
    /// and stars have been parsed; the current token is the
    /// identifier.
    fn symbol_declaration(
        &mut self,
        prim: Prim,
        ctype: Option<SymId>,
        class: SymClass,
    ) -> Result<(SymKind, Option<Node>)> {
        let varname = self.toks.tok.text.clone().unwrap_or_default();

        // Scan past the identifier before looking at what follows
        self.ident()?;

        if self.toks.tok.kind == TokenKind::LParen {
            self.function_declaration(&varname, prim, ctype, class)?;
            return Ok((SymKind::Function, None));
        }

        // Duplicate declarations in the same scope are fatal
        match class {
            SymClass::Local => {
                if self.syms.find_local(&varname).is_some() {
                    return Err(
                        self.err(format!("Duplicate local variable declaration: {varname}"))
                    );
                }
            }
            SymClass::Param | SymClass::Member => {
                if self.syms.find_member(&varname).is_some() {
                    return Err(self.err(format!(
                        "Duplicate member or parameter declaration: {varname}"
                    )));
                }
            }
            _ => {}
        }

        if self.toks.tok.kind == TokenKind::LBracket {
            self.array_declaration(&varname, prim, ctype, class)?;
            // Arrays are not initialised with expressions
            Ok((SymKind::Array, None))
        } else {
            let (_, tree) = self.scalar_declaration(&varname, prim, ctype, class)?;
            Ok((SymKind::Variable, tree))
        }
    }
}
