pub mod decl;
pub mod expr;
pub mod stmt;

use anyhow::Result;

use std::io::{BufRead, Write};

use crate::ast::serial::AstWriter;
use crate::ast::TreeBuilder;
use crate::errors::SrcPos;
use crate::sym::record::write_symtab;
use crate::sym::SymTab;
use crate::target::Target;
use crate::token::{read_token, Token, TokenKind};

/// Reads the binary token stream for the parser. Filename and
/// line-number markers are consumed here and only update the source
/// position; the parser never sees them.
pub struct Tokens<R> {
    input: R,
    /// The token currently being looked at.
    pub tok: Token,
    peeked: Option<Token>,
    pub pos: SrcPos,
}

impl<R: BufRead> Tokens<R> {
    pub fn new(input: R) -> Result<Self> {
        let mut toks = Self {
            input,
            tok: Token::bare(TokenKind::Eof),
            peeked: None,
            pos: SrcPos::new("", 1),
        };
        toks.scan()?;
        Ok(toks)
    }

    fn fetch(&mut self) -> Result<Token> {
        loop {
            let Some(tok) = read_token(&mut self.input)? else {
                return Ok(Token::bare(TokenKind::Eof));
            };
            match tok.kind {
                TokenKind::LineNum => self.pos.line = tok.value,
                TokenKind::Filename => self.pos.file = tok.text_or_err()?.to_owned(),
                _ => return Ok(tok),
            }
        }
    }

    /// Advance to the next token.
    pub fn scan(&mut self) -> Result<()> {
        self.tok = match self.peeked.take() {
            Some(tok) => tok,
            None => self.fetch()?,
        };
        Ok(())
    }

    /// Look at the token after the current one without consuming it.
    pub fn peek(&mut self) -> Result<&Token> {
        if self.peeked.is_none() {
            self.peeked = Some(self.fetch()?);
        }
        Ok(self.peeked.as_ref().unwrap())
    }
}

/// The parser: consumes the token file, fills the symbol table and
/// streams each function's typed AST to the AST file.
pub struct Parser<R, W: Write> {
    pub toks: Tokens<R>,
    pub syms: SymTab,
    pub tb: TreeBuilder,
    pub ast: AstWriter<W>,
    pub target: Target,
    loop_level: i32,
    switch_level: i32,
}

impl<R: BufRead, W: Write> Parser<R, W> {
    pub fn new(input: R, ast_out: W, target: Target) -> Result<Self> {
        Ok(Self {
            toks: Tokens::new(input)?,
            syms: SymTab::new(target),
            tb: TreeBuilder::new(),
            ast: AstWriter::new(ast_out),
            target,
            loop_level: 0,
            switch_level: 0,
        })
    }

    pub fn err(&self, msg: impl AsRef<str>) -> anyhow::Error {
        self.toks.pos.error(msg)
    }

    pub fn line(&self) -> i32 {
        self.toks.pos.line
    }

    /// Ensure the current token is `kind` and move past it.
    pub fn match_token(&mut self, kind: TokenKind, what: &str) -> Result<()> {
        if self.toks.tok.kind == kind {
            self.toks.scan()
        } else {
            Err(self.err(format!("Expected {what}")))
        }
    }

    pub fn semi(&mut self) -> Result<()> {
        self.match_token(TokenKind::Semi, ";")
    }

    pub fn lbrace(&mut self) -> Result<()> {
        self.match_token(TokenKind::LBrace, "{")
    }

    pub fn rbrace(&mut self) -> Result<()> {
        self.match_token(TokenKind::RBrace, "}")
    }

    pub fn lparen(&mut self) -> Result<()> {
        self.match_token(TokenKind::LParen, "(")
    }

    pub fn rparen(&mut self) -> Result<()> {
        self.match_token(TokenKind::RParen, ")")
    }

    pub fn ident(&mut self) -> Result<()> {
        self.match_token(TokenKind::Ident, "identifier")
    }

    pub fn comma(&mut self) -> Result<()> {
        self.match_token(TokenKind::Comma, "comma")
    }
}

/// Run the parser phase: read the token file, write the AST file and
/// the symbol file.
pub fn parse_phase<R: BufRead, A: Write, S: Write>(
    tokens: R,
    ast_out: A,
    sym_out: &mut S,
    target: Target,
) -> Result<()> {
    let mut parser = Parser::new(tokens, ast_out, target)?;
    parser.global_declarations()?;
    write_symtab(sym_out, &parser.syms)?;
    parser.ast.finish()?;
    Ok(())
}
