use anyhow::Result;

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use mcc_rs::token::{read_token, TokenKind};

/// Print a token file, one token per line.
pub fn dump_tokens(input: &Path) -> Result<()> {
    let mut input = BufReader::new(File::open(input)?);

    while let Some(tok) = read_token(&mut input)? {
        let tag = u8::from(tok.kind);
        match tok.kind {
            TokenKind::IntLit | TokenKind::CharLit => {
                println!("{tag:02X}: {}", tok.value);
            }
            TokenKind::LineNum => {
                println!("{tag:02X}: linenum {}", tok.value);
            }
            TokenKind::StrLit => {
                println!("{tag:02X}: \"{}\"", tok.text.as_deref().unwrap_or(""));
            }
            TokenKind::Filename => {
                println!("{tag:02X}: filename \"{}\"", tok.text.as_deref().unwrap_or(""));
            }
            TokenKind::Ident => {
                println!("{tag:02X}: {}", tok.text.as_deref().unwrap_or(""));
            }
            kind => println!("{tag:02X}: {}", kind.spelling()),
        }
    }
    Ok(())
}
