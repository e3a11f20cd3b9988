use anyhow::{anyhow, Result};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::Serialize;

use std::io::Write;

use crate::reader::{RecordBufRead, RecordWrite};

/// Every kind of token the scanner can produce. The discriminants are
/// the one-byte tags of the token file, and the binary-operator block
/// `Assign..=Mod` lines up one-for-one with the matching AST ops.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, TryFromPrimitive, IntoPrimitive, Serialize,
)]
#[repr(u8)]
pub enum TokenKind {
    Eof = 0,

    // Binary operators, in precedence-table order
    Assign,
    AsPlus,
    AsMinus,
    AsStar,
    AsSlash,
    AsMod,
    Question,
    LogOr,
    LogAnd,
    Or,
    Xor,
    Amper,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    LShift,
    RShift,
    Plus,
    Minus,
    Star,
    Slash,
    Mod,

    // Other operators
    Inc,
    Dec,
    Invert,
    LogNot,

    // Type keywords
    Void,
    Char,
    Int,
    Long,

    // Other keywords
    If,
    Else,
    While,
    For,
    Return,
    Struct,
    Union,
    Enum,
    Typedef,
    Extern,
    Break,
    Continue,
    Switch,
    Case,
    Default,
    Sizeof,
    Static,

    // Structural tokens
    IntLit,
    StrLit,
    Semi,
    Ident,
    LBrace,
    RBrace,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Dot,
    Arrow,
    Colon,
    Ellipsis,
    CharLit,

    // In-band markers from the preprocessor line-info stream
    Filename,
    LineNum,
}

impl TokenKind {
    /// Keyword recognition by name.
    pub fn keyword(name: &str) -> Option<TokenKind> {
        use TokenKind::*;
        Some(match name {
            "break" => Break,
            "case" => Case,
            "char" => Char,
            "continue" => Continue,
            "default" => Default,
            "else" => Else,
            "enum" => Enum,
            "extern" => Extern,
            "for" => For,
            "if" => If,
            "int" => Int,
            "long" => Long,
            "return" => Return,
            "sizeof" => Sizeof,
            "static" => Static,
            "struct" => Struct,
            "switch" => Switch,
            "typedef" => Typedef,
            "union" => Union,
            "void" => Void,
            "while" => While,
            _ => return None,
        })
    }

    /// Human-readable spelling for diagnostics.
    pub fn spelling(self) -> &'static str {
        use TokenKind::*;
        match self {
            Eof => "EOF",
            Assign => "=",
            AsPlus => "+=",
            AsMinus => "-=",
            AsStar => "*=",
            AsSlash => "/=",
            AsMod => "%=",
            Question => "?",
            LogOr => "||",
            LogAnd => "&&",
            Or => "|",
            Xor => "^",
            Amper => "&",
            Eq => "==",
            Ne => "!=",
            Lt => "<",
            Gt => ">",
            Le => "<=",
            Ge => ">=",
            LShift => "<<",
            RShift => ">>",
            Plus => "+",
            Minus => "-",
            Star => "*",
            Slash => "/",
            Mod => "%",
            Inc => "++",
            Dec => "--",
            Invert => "~",
            LogNot => "!",
            Void => "void",
            Char => "char",
            Int => "int",
            Long => "long",
            If => "if",
            Else => "else",
            While => "while",
            For => "for",
            Return => "return",
            Struct => "struct",
            Union => "union",
            Enum => "enum",
            Typedef => "typedef",
            Extern => "extern",
            Break => "break",
            Continue => "continue",
            Switch => "switch",
            Case => "case",
            Default => "default",
            Sizeof => "sizeof",
            Static => "static",
            IntLit => "intlit",
            StrLit => "strlit",
            Semi => ";",
            Ident => "identifier",
            LBrace => "{",
            RBrace => "}",
            LParen => "(",
            RParen => ")",
            LBracket => "[",
            RBracket => "]",
            Comma => ",",
            Dot => ".",
            Arrow => "->",
            Colon => ":",
            Ellipsis => "...",
            CharLit => "charlit",
            Filename => "filename",
            LineNum => "linenum",
        }
    }
}

/// A scanned token: the kind, the integer value of an int/char literal
/// or a line-number marker, and the text of an identifier, string
/// literal or filename marker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Token {
    pub kind: TokenKind,
    pub value: i32,
    pub text: Option<String>,
}

impl Token {
    pub fn bare(kind: TokenKind) -> Self {
        Self {
            kind,
            value: 0,
            text: None,
        }
    }

    pub fn int(kind: TokenKind, value: i32) -> Self {
        Self {
            kind,
            value,
            text: None,
        }
    }

    pub fn text(kind: TokenKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            value: 0,
            text: Some(text.into()),
        }
    }

    /// The identifier/string payload; fatal if this token kind has none.
    pub fn text_or_err(&self) -> Result<&str> {
        self.text
            .as_deref()
            .ok_or_else(|| anyhow!("Token {:?} has no text payload", self.kind))
    }
}

/// Append one token to a token file. The tag byte is followed by a
/// 32-bit value for int/char literals and line-number markers, or a
/// NUL-terminated string for identifiers, string literals and
/// filename markers.
pub fn write_token<W: Write>(out: &mut W, tok: &Token) -> Result<()> {
    out.write_u8(tok.kind.into())?;
    match tok.kind {
        TokenKind::IntLit | TokenKind::CharLit | TokenKind::LineNum => {
            out.write_i32(tok.value)?;
        }
        TokenKind::StrLit | TokenKind::Ident | TokenKind::Filename => {
            out.write_cstr(tok.text_or_err()?)?;
        }
        _ => {}
    }
    Ok(())
}

/// Read the next token from a token file. Returns `None` at EOF.
pub fn read_token<R: RecordBufRead>(input: &mut R) -> Result<Option<Token>> {
    let Some(tag) = input.fill_buf()?.first().copied() else {
        return Ok(None);
    };
    input.consume(1);
    let kind = TokenKind::try_from(tag)
        .map_err(|_| anyhow!("Invalid token tag {tag:#04x} in token file"))?;
    let tok = match kind {
        TokenKind::IntLit | TokenKind::CharLit | TokenKind::LineNum => {
            Token::int(kind, input.read_i32()?)
        }
        TokenKind::StrLit | TokenKind::Ident | TokenKind::Filename => {
            Token::text(kind, input.read_cstr()?)
        }
        _ => Token::bare(kind),
    };
    Ok(Some(tok))
}
