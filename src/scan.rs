use anyhow::Result;

use std::collections::VecDeque;
use std::io::{BufRead, Write};

use crate::errors::SrcPos;
use crate::token::{write_token, Token, TokenKind};
use crate::TEXTLEN;

/// The character → token scanner. Owns the input stream, the
/// one-character pushback, the current source position adopted from
/// preprocessor line markers, and a small token queue used for the
/// string-concatenation lookahead.
pub struct Scanner<R> {
    input: R,
    putback: Option<u8>,
    line_start: bool,
    pub pos: SrcPos,
    pending: VecDeque<Token>,
    prev: TokenKind,
    new_filename: bool,
    new_linenum: bool,
}

fn is_ident_char(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_'
}

/// Position of c in the hexadecimal digit string, or None.
fn digit_val(c: u8) -> Option<i32> {
    match c.to_ascii_lowercase() {
        b'0'..=b'9' => Some((c - b'0') as i32),
        c @ b'a'..=b'f' => Some((c - b'a') as i32 + 10),
        _ => None,
    }
}

impl<R: BufRead> Scanner<R> {
    pub fn new(input: R) -> Self {
        Self {
            input,
            putback: Some(b'\n'),
            line_start: true,
            pos: SrcPos::new("", 1),
            pending: VecDeque::new(),
            prev: TokenKind::Eof,
            new_filename: false,
            new_linenum: false,
        }
    }

    /// Read one raw byte from the input, bypassing the pushback.
    fn raw_ch(&mut self) -> Result<Option<u8>> {
        let Some(&c) = self.input.fill_buf()?.first() else {
            return Ok(None);
        };
        self.input.consume(1);
        Ok(Some(c))
    }

    /// Get the next character, honouring the pushback and absorbing
    /// preprocessor line markers at the start of a line.
    fn next_ch(&mut self) -> Result<Option<u8>> {
        if let Some(c) = self.putback.take() {
            return Ok(Some(c));
        }

        let mut c = self.raw_ch()?;

        while self.line_start && c == Some(b'#') {
            self.line_start = false;

            // The marker is an integer line number and a string filename
            let tok = self.scan_token(true)?;
            if tok.kind != TokenKind::IntLit {
                return Err(self.pos.error("Expecting pre-processor line number"));
            }
            let line = tok.value;

            let tok = self.scan_token(true)?;
            if tok.kind != TokenKind::StrLit {
                return Err(self.pos.error("Expecting pre-processor file name"));
            }
            let name = tok.text_or_err()?;

            // A leading '<' marks a system header: ignore it
            if !name.starts_with('<') {
                if name != self.pos.file {
                    self.pos.file = name.to_owned();
                    self.new_filename = true;
                }
                self.pos.line = line;
                self.new_linenum = true;
            }

            // Discard the rest of the physical line
            self.putback = None;
            loop {
                match self.raw_ch()? {
                    None => return Ok(None),
                    Some(b'\n') => break,
                    Some(_) => {}
                }
            }
            c = self.raw_ch()?;
            self.line_start = true;
        }

        self.line_start = false;
        if c == Some(b'\n') {
            self.pos.line += 1;
            self.new_linenum = true;
            self.line_start = true;
        }
        Ok(c)
    }

    fn put_back(&mut self, c: u8) {
        self.putback = Some(c);
    }

    /// Skip whitespace and return the first character that matters,
    /// or None at end of input.
    fn skip(&mut self) -> Result<Option<u8>> {
        loop {
            match self.next_ch()? {
                Some(b' ' | b'\t' | b'\n' | b'\r' | b'\x0c') => {}
                other => return Ok(other),
            }
        }
    }

    /// A character that must exist, inside a literal.
    fn literal_ch(&mut self) -> Result<u8> {
        self.next_ch()?
            .ok_or_else(|| self.pos.error("Unexpected end of file in literal"))
    }

    /// Read a hexadecimal escape value, at most 8 bits.
    fn hex_escape(&mut self) -> Result<i32> {
        let mut n = 0;
        let mut seen = false;
        loop {
            let c = self.literal_ch()?;
            if !c.is_ascii_hexdigit() {
                self.put_back(c);
                break;
            }
            n = n * 16 + digit_val(c).unwrap();
            seen = true;
        }
        if !seen {
            return Err(self.pos.error("missing digits after '\\x'"));
        }
        if n > 255 {
            return Err(self.pos.error("value out of range after '\\x'"));
        }
        Ok(n)
    }

    /// The next character of a character or string literal. Also
    /// return whether it was backslash-escaped, so a quoted quote does
    /// not terminate the literal.
    fn scan_ch(&mut self) -> Result<(u8, bool)> {
        let c = self.literal_ch()?;
        if c != b'\\' {
            return Ok((c, false));
        }
        let c = self.literal_ch()?;
        let value = match c {
            b'a' => 7,
            b'b' => 8,
            b'f' => 12,
            b'n' => b'\n',
            b'r' => b'\r',
            b't' => b'\t',
            b'v' => 11,
            b'\\' => b'\\',
            b'"' => b'"',
            b'\'' => b'\'',
            b'0'..=b'7' => {
                // Octal: at most three digits
                let mut val = 0u32;
                let mut c = c;
                let mut count = 0;
                while c.is_ascii_digit() && c < b'8' {
                    count += 1;
                    if count > 3 {
                        break;
                    }
                    val = val * 8 + (c - b'0') as u32;
                    c = self.literal_ch()?;
                }
                self.put_back(c);
                (val & 0xff) as u8
            }
            b'x' => self.hex_escape()? as u8,
            _ => {
                return Err(self
                    .pos
                    .error(format!("unknown escape sequence '\\{}'", c as char)))
            }
        };
        Ok((value, true))
    }

    /// Scan an integer literal whose first character is c. The radix
    /// is 8 for a leading 0, 16 for 0x, 10 otherwise.
    fn scan_int(&mut self, c: u8) -> Result<i32> {
        let mut c = c;
        let mut radix = 10;
        if c == b'0' {
            match self.next_ch()? {
                Some(b'x') => {
                    radix = 16;
                    c = self
                        .next_ch()?
                        .ok_or_else(|| self.pos.error("Unexpected end of file in literal"))?;
                }
                Some(other) => {
                    radix = 8;
                    self.put_back(other);
                }
                None => return Ok(0),
            }
        }

        let mut val: i64 = 0;
        loop {
            let Some(k) = digit_val(c) else {
                self.put_back(c);
                break;
            };
            if k >= radix {
                return Err(self
                    .pos
                    .error(format!("invalid digit '{}' in integer literal", c as char)));
            }
            val = val * radix as i64 + k as i64;
            match self.next_ch()? {
                Some(next) => c = next,
                None => break,
            }
        }
        Ok(val as i32)
    }

    /// Scan a string literal; the opening quote has been consumed.
    fn scan_str(&mut self) -> Result<String> {
        let mut buf = Vec::new();
        loop {
            let (c, escaped) = self.scan_ch()?;
            if c == b'"' && !escaped {
                break;
            }
            if buf.len() == TEXTLEN {
                return Err(self.pos.error("String literal too long"));
            }
            buf.push(c);
        }
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    /// Scan an identifier whose first character is c.
    fn scan_ident(&mut self, c: u8) -> Result<String> {
        let mut buf = vec![c];
        loop {
            match self.next_ch()? {
                Some(c) if is_ident_char(c) => {
                    if buf.len() == TEXTLEN {
                        return Err(self.pos.error("Identifier too long"));
                    }
                    buf.push(c);
                }
                Some(c) => {
                    self.put_back(c);
                    break;
                }
                None => break,
            }
        }
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    /// True when the previous token could be the left operand of a
    /// binary minus, in which case a following '-' is an operator and
    /// not the sign of a literal.
    fn prev_ends_value(&self) -> bool {
        matches!(
            self.prev,
            TokenKind::Ident
                | TokenKind::IntLit
                | TokenKind::CharLit
                | TokenKind::StrLit
                | TokenKind::RParen
                | TokenKind::RBracket
        )
    }

    /// Scan one token from the input. With `nocpp` set, do not emit
    /// filename or line-number markers; that mode is used while the
    /// markers themselves are being parsed.
    fn scan_token(&mut self, nocpp: bool) -> Result<Token> {
        use TokenKind::*;

        let c = self.skip()?;

        if !nocpp {
            if self.new_filename {
                self.new_filename = false;
                if let Some(c) = c {
                    self.put_back(c);
                }
                return Ok(Token::text(Filename, self.pos.file.clone()));
            }
            if self.new_linenum {
                self.new_linenum = false;
                if let Some(c) = c {
                    self.put_back(c);
                }
                return Ok(Token::int(LineNum, self.pos.line));
            }
        }

        let Some(c) = c else {
            return Ok(Token::bare(Eof));
        };

        let tok = match c {
            b'+' => match self.next_ch()? {
                Some(b'+') => Token::bare(Inc),
                Some(b'=') => Token::bare(AsPlus),
                other => {
                    if let Some(c) = other {
                        self.put_back(c);
                    }
                    Token::bare(Plus)
                }
            },
            b'-' => match self.next_ch()? {
                Some(b'-') => Token::bare(Dec),
                Some(b'>') => Token::bare(Arrow),
                Some(b'=') => Token::bare(AsMinus),
                Some(d) if d.is_ascii_digit() && !self.prev_ends_value() => {
                    Token::int(IntLit, -self.scan_int(d)?)
                }
                other => {
                    if let Some(c) = other {
                        self.put_back(c);
                    }
                    Token::bare(Minus)
                }
            },
            b'*' => self.two_char(b'=', AsStar, Star)?,
            b'/' => self.two_char(b'=', AsSlash, Slash)?,
            b'%' => self.two_char(b'=', AsMod, Mod)?,
            b';' => Token::bare(Semi),
            b'{' => Token::bare(LBrace),
            b'}' => Token::bare(RBrace),
            b'(' => Token::bare(LParen),
            b')' => Token::bare(RParen),
            b'[' => Token::bare(LBracket),
            b']' => Token::bare(RBracket),
            b'~' => Token::bare(Invert),
            b'^' => Token::bare(Xor),
            b',' => Token::bare(Comma),
            b':' => Token::bare(Colon),
            b'?' => Token::bare(Question),
            b'.' => match self.next_ch()? {
                Some(b'.') => {
                    if self.next_ch()? != Some(b'.') {
                        return Err(self.pos.error("Expected '...', only got '..'"));
                    }
                    Token::bare(Ellipsis)
                }
                other => {
                    if let Some(c) = other {
                        self.put_back(c);
                    }
                    Token::bare(Dot)
                }
            },
            b'=' => self.two_char(b'=', Eq, Assign)?,
            b'!' => self.two_char(b'=', Ne, LogNot)?,
            b'<' => match self.next_ch()? {
                Some(b'=') => Token::bare(Le),
                Some(b'<') => Token::bare(LShift),
                other => {
                    if let Some(c) = other {
                        self.put_back(c);
                    }
                    Token::bare(Lt)
                }
            },
            b'>' => match self.next_ch()? {
                Some(b'=') => Token::bare(Ge),
                Some(b'>') => Token::bare(RShift),
                other => {
                    if let Some(c) = other {
                        self.put_back(c);
                    }
                    Token::bare(Gt)
                }
            },
            b'&' => self.two_char(b'&', LogAnd, Amper)?,
            b'|' => self.two_char(b'|', LogOr, Or)?,
            b'\'' => {
                let (value, _) = self.scan_ch()?;
                if self.next_ch()? != Some(b'\'') {
                    return Err(self.pos.error("Expected '\\'' at end of char literal"));
                }
                Token::int(CharLit, value as i32)
            }
            b'"' => Token::text(StrLit, self.scan_str()?),
            c if c.is_ascii_digit() => Token::int(IntLit, self.scan_int(c)?),
            c if c.is_ascii_alphabetic() || c == b'_' => {
                let name = self.scan_ident(c)?;
                match TokenKind::keyword(&name) {
                    Some(kind) => Token::bare(kind),
                    None => Token::text(Ident, name),
                }
            }
            c => {
                return Err(self
                    .pos
                    .error(format!("Unrecognised character '{}'", c as char)))
            }
        };
        self.prev = tok.kind;
        Ok(tok)
    }

    /// Helper for the "one char, or two with a given second char"
    /// operators.
    fn two_char(&mut self, second: u8, double: TokenKind, single: TokenKind) -> Result<Token> {
        match self.next_ch()? {
            Some(c) if c == second => Ok(Token::bare(double)),
            other => {
                if let Some(c) = other {
                    self.put_back(c);
                }
                Ok(Token::bare(single))
            }
        }
    }

    /// Get the next token. Adjacent string literals are concatenated
    /// here, using the token queue as the lookahead slot.
    pub fn next_token(&mut self) -> Result<Token> {
        if let Some(tok) = self.pending.pop_front() {
            return Ok(tok);
        }

        let mut tok = self.scan_token(false)?;
        if tok.kind != TokenKind::StrLit {
            return Ok(tok);
        }

        // Peek ahead: a following string literal extends this one.
        // Position markers seen on the way are queued for delivery
        // after the combined literal.
        let mut text = tok.text.take().unwrap_or_default();
        loop {
            let next = self.scan_token(false)?;
            match next.kind {
                TokenKind::StrLit => {
                    let extra = next.text.as_deref().unwrap_or("");
                    if text.len() + extra.len() > TEXTLEN {
                        return Err(self.pos.error("String literal too long"));
                    }
                    text.push_str(extra);
                }
                TokenKind::Filename | TokenKind::LineNum => self.pending.push_back(next),
                _ => {
                    self.pending.push_back(next);
                    break;
                }
            }
        }
        tok.text = Some(text);
        Ok(tok)
    }
}

/// Run the scanner phase: tokenise the preprocessed source on `input`
/// and write the binary token stream to `output`.
pub fn scan_phase<R: BufRead, W: Write>(input: R, output: &mut W) -> Result<()> {
    let mut scanner = Scanner::new(input);
    loop {
        let tok = scanner.next_token()?;
        if tok.kind == TokenKind::Eof {
            return Ok(());
        }
        write_token(output, &tok)?;
    }
}
