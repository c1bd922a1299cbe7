//! Script tokenizer
//!
//! Byte-oriented scanner producing the full token stream up front. Every
//! token carries its 1-based line and column so later stages can report
//! exact locations.

use kestrel_api::ScriptError;

#[derive(Debug, Clone, PartialEq)]
pub enum TokKind {
    Int(i64),
    Flt(f64),
    Str(String),
    Bytes(Vec<u8>),
    Ident(String),

    Function,
    If,
    Else,
    While,
    For,
    Return,
    Break,
    Continue,
    Nil,

    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Comma,
    Semi,
    Assign,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Bang,
    AndAnd,
    OrOr,
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Tok {
    pub kind: TokKind,
    pub line: u32,
    pub col: u32,
}

pub struct Lexer<'a> {
    src: &'a [u8],
    file: &'a str,
    pos: usize,
    line: u32,
    col: u32,
}

impl<'a> Lexer<'a> {
    pub fn new(source: &'a str, file: &'a str) -> Self {
        Self {
            src: source.as_bytes(),
            file,
            pos: 0,
            line: 1,
            col: 1,
        }
    }

    pub fn tokenize(mut self) -> Result<Vec<Tok>, ScriptError> {
        let mut toks = Vec::new();
        loop {
            self.skip_trivia();
            let (line, col) = (self.line, self.col);
            let Some(c) = self.peek() else {
                toks.push(Tok {
                    kind: TokKind::Eof,
                    line,
                    col,
                });
                return Ok(toks);
            };
            let kind = match c {
                b'0'..=b'9' => self.number(line, col)?,
                b'"' => TokKind::Str(self.quoted(line, col, false)?.0),
                b'b' if self.peek_at(1) == Some(b'"') => {
                    self.bump(); // consume the prefix
                    TokKind::Bytes(self.quoted(line, col, true)?.1)
                }
                b'a'..=b'z' | b'A'..=b'Z' | b'_' => self.ident(),
                _ => self.punct(line, col)?,
            };
            toks.push(Tok { kind, line, col });
        }
    }

    fn err(&self, line: u32, col: u32, msg: impl Into<String>) -> ScriptError {
        ScriptError::at(self.file, line, col, msg)
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn peek_at(&self, ahead: usize) -> Option<u8> {
        self.src.get(self.pos + ahead).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let c = self.peek()?;
        self.pos += 1;
        if c == b'\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(c)
    }

    fn eat(&mut self, c: u8) -> bool {
        if self.peek() == Some(c) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn skip_trivia(&mut self) {
        loop {
            match self.peek() {
                Some(b' ' | b'\t' | b'\r' | b'\n') => {
                    self.bump();
                }
                Some(b'#') => {
                    while let Some(c) = self.peek() {
                        if c == b'\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                _ => return,
            }
        }
    }

    fn number(&mut self, line: u32, col: u32) -> Result<TokKind, ScriptError> {
        let start = self.pos;
        while matches!(self.peek(), Some(b'0'..=b'9')) {
            self.bump();
        }
        let mut float = false;
        if self.peek() == Some(b'.') && matches!(self.peek_at(1), Some(b'0'..=b'9')) {
            float = true;
            self.bump();
            while matches!(self.peek(), Some(b'0'..=b'9')) {
                self.bump();
            }
        }
        let text = std::str::from_utf8(&self.src[start..self.pos]).expect("digits are ascii");
        if float {
            let v: f64 = text
                .parse()
                .map_err(|_| self.err(line, col, format!("bad float literal '{text}'")))?;
            Ok(TokKind::Flt(v))
        } else {
            let v: i64 = text
                .parse()
                .map_err(|_| self.err(line, col, format!("integer literal '{text}' out of range")))?;
            Ok(TokKind::Int(v))
        }
    }

    fn ident(&mut self) -> TokKind {
        let start = self.pos;
        while matches!(
            self.peek(),
            Some(b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'_')
        ) {
            self.bump();
        }
        let text = std::str::from_utf8(&self.src[start..self.pos]).expect("ident bytes are ascii");
        match text {
            "function" => TokKind::Function,
            "if" => TokKind::If,
            "else" => TokKind::Else,
            "while" => TokKind::While,
            "for" => TokKind::For,
            "return" => TokKind::Return,
            "break" => TokKind::Break,
            "continue" => TokKind::Continue,
            "nil" => TokKind::Nil,
            _ => TokKind::Ident(text.to_string()),
        }
    }

    /// Scan a quoted literal, returning both text and raw bytes; `\xNN`
    /// escapes are only legal in byte-string literals.
    fn quoted(
        &mut self,
        line: u32,
        col: u32,
        bytes: bool,
    ) -> Result<(String, Vec<u8>), ScriptError> {
        self.bump(); // opening quote
        let mut out = Vec::new();
        loop {
            let Some(c) = self.bump() else {
                return Err(self.err(line, col, "unterminated string literal"));
            };
            match c {
                b'"' => break,
                b'\\' => {
                    let (eline, ecol) = (self.line, self.col);
                    let Some(e) = self.bump() else {
                        return Err(self.err(line, col, "unterminated string literal"));
                    };
                    match e {
                        b'n' => out.push(b'\n'),
                        b't' => out.push(b'\t'),
                        b'r' => out.push(b'\r'),
                        b'\\' => out.push(b'\\'),
                        b'"' => out.push(b'"'),
                        b'0' => out.push(0),
                        b'x' if bytes => {
                            let hi = self.hex_digit(eline, ecol)?;
                            let lo = self.hex_digit(eline, ecol)?;
                            out.push(hi * 16 + lo);
                        }
                        _ => {
                            return Err(self.err(
                                eline,
                                ecol,
                                format!("invalid escape '\\{}'", e as char),
                            ))
                        }
                    }
                }
                _ => out.push(c),
            }
        }
        let text = if bytes {
            String::new()
        } else {
            String::from_utf8(out.clone())
                .map_err(|_| self.err(line, col, "string literal is not valid utf-8"))?
        };
        Ok((text, out))
    }

    fn hex_digit(&mut self, line: u32, col: u32) -> Result<u8, ScriptError> {
        match self.bump() {
            Some(c @ b'0'..=b'9') => Ok(c - b'0'),
            Some(c @ b'a'..=b'f') => Ok(c - b'a' + 10),
            Some(c @ b'A'..=b'F') => Ok(c - b'A' + 10),
            _ => Err(self.err(line, col, "expected two hex digits after '\\x'")),
        }
    }

    fn punct(&mut self, line: u32, col: u32) -> Result<TokKind, ScriptError> {
        let c = self.bump().expect("peeked before punct");
        let kind = match c {
            b'(' => TokKind::LParen,
            b')' => TokKind::RParen,
            b'{' => TokKind::LBrace,
            b'}' => TokKind::RBrace,
            b'[' => TokKind::LBracket,
            b']' => TokKind::RBracket,
            b',' => TokKind::Comma,
            b';' => TokKind::Semi,
            b'+' => TokKind::Plus,
            b'-' => TokKind::Minus,
            b'*' => TokKind::Star,
            b'/' => TokKind::Slash,
            b'%' => TokKind::Percent,
            b'=' => {
                if self.eat(b'=') {
                    TokKind::Eq
                } else {
                    TokKind::Assign
                }
            }
            b'!' => {
                if self.eat(b'=') {
                    TokKind::Ne
                } else {
                    TokKind::Bang
                }
            }
            b'<' => {
                if self.eat(b'=') {
                    TokKind::Le
                } else {
                    TokKind::Lt
                }
            }
            b'>' => {
                if self.eat(b'=') {
                    TokKind::Ge
                } else {
                    TokKind::Gt
                }
            }
            b'&' => {
                if self.eat(b'&') {
                    TokKind::AndAnd
                } else {
                    return Err(self.err(line, col, "expected '&&'"));
                }
            }
            b'|' => {
                if self.eat(b'|') {
                    TokKind::OrOr
                } else {
                    return Err(self.err(line, col, "expected '||'"));
                }
            }
            _ => {
                return Err(self.err(
                    line,
                    col,
                    format!("unexpected character '{}'", c as char),
                ))
            }
        };
        Ok(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokKind> {
        Lexer::new(src, "t")
            .tokenize()
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn scans_function_header() {
        assert_eq!(
            kinds("function f(a)"),
            vec![
                TokKind::Function,
                TokKind::Ident("f".into()),
                TokKind::LParen,
                TokKind::Ident("a".into()),
                TokKind::RParen,
                TokKind::Eof,
            ]
        );
    }

    #[test]
    fn scans_numbers_and_operators() {
        assert_eq!(
            kinds("1 + 2.5 <= x"),
            vec![
                TokKind::Int(1),
                TokKind::Plus,
                TokKind::Flt(2.5),
                TokKind::Le,
                TokKind::Ident("x".into()),
                TokKind::Eof,
            ]
        );
    }

    #[test]
    fn comments_run_to_end_of_line() {
        assert_eq!(
            kinds("a # trailing words\nb"),
            vec![
                TokKind::Ident("a".into()),
                TokKind::Ident("b".into()),
                TokKind::Eof,
            ]
        );
    }

    #[test]
    fn byte_literal_with_hex_escape() {
        assert_eq!(
            kinds(r#"b"ab\x00c""#),
            vec![TokKind::Bytes(vec![b'a', b'b', 0, b'c']), TokKind::Eof]
        );
    }

    #[test]
    fn ident_starting_with_b_is_not_bytes() {
        assert_eq!(kinds("bat"), vec![TokKind::Ident("bat".into()), TokKind::Eof]);
    }

    #[test]
    fn tracks_line_and_column() {
        let toks = Lexer::new("a\n  b", "t").tokenize().unwrap();
        assert_eq!((toks[0].line, toks[0].col), (1, 1));
        assert_eq!((toks[1].line, toks[1].col), (2, 3));
    }

    #[test]
    fn reports_unterminated_string() {
        let err = Lexer::new("\"open", "t").tokenize().unwrap_err();
        assert_eq!(err.msg, "unterminated string literal");
        assert_eq!((err.line, err.col), (1, 1));
    }
}
