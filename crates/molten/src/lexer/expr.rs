//! The expression lexer.
//!
//! Runs inside tag and output segments, producing typed tokens with
//! byte-offset spans. Single-byte dispatch goes through a 256-entry class
//! table so the hot loop avoids cascaded range comparisons.

use strum::EnumString;

use crate::lexer::LexError;
use crate::span::Span;

/// Reserved words recognized by the expression grammar.
///
/// `nil` also accepts the `null` spelling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString)]
#[strum(serialize_all = "lowercase")]
pub(crate) enum Keyword {
    And,
    Or,
    Not,
    Contains,
    In,
    With,
    For,
    As,
    By,
    Limit,
    Offset,
    Reversed,
    True,
    False,
    #[strum(serialize = "nil", serialize = "null")]
    Nil,
    Empty,
    Blank,
}

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub(crate) enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    /// Source spelling, used in error messages and disassembly.
    pub(crate) fn symbol(self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
        }
    }
}

/// One expression token.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TokenKind {
    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),
    Keyword(Keyword),
    Compare(CmpOp),
    Dot,
    DotDot,
    Pipe,
    Colon,
    Comma,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Assign,
    /// End of the segment's markup.
    End,
}

/// A token plus its source span.
#[derive(Debug, Clone)]
pub(crate) struct Token {
    pub kind: TokenKind,
    pub span: Span,
}

/// Byte classes for the dispatch table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ByteClass {
    Space,
    Digit,
    IdentStart,
    Quote,
    Punct,
    Other,
}

/// 256-entry dispatch table; indexed by the leading byte of each token.
static BYTE_CLASS: [ByteClass; 256] = build_byte_class();

const fn build_byte_class() -> [ByteClass; 256] {
    let mut table = [ByteClass::Other; 256];
    let mut b = 0usize;
    while b < 256 {
        let byte = b as u8;
        table[b] = match byte {
            b' ' | b'\t' | b'\r' | b'\n' => ByteClass::Space,
            b'0'..=b'9' => ByteClass::Digit,
            b'a'..=b'z' | b'A'..=b'Z' | b'_' => ByteClass::IdentStart,
            b'\'' | b'"' => ByteClass::Quote,
            b'.' | b'|' | b':' | b',' | b'(' | b')' | b'[' | b']' | b'=' | b'!' | b'<' | b'>' | b'-' => ByteClass::Punct,
            _ => ByteClass::Other,
        };
        b += 1;
    }
    table
}

/// Tokenizer over one segment's markup.
///
/// Positions are absolute byte offsets into the full template source so token
/// spans line up with the shell lexer's.
pub(crate) struct ExprLexer<'s> {
    src: &'s str,
    pos: usize,
    end: usize,
    line: u32,
}

impl<'s> ExprLexer<'s> {
    /// Creates a lexer over `src[range]`, with `line` the 1-based line of the
    /// range's start.
    pub(crate) fn new(src: &'s str, range: std::ops::Range<usize>, line: u32) -> Self {
        Self {
            src,
            pos: range.start,
            end: range.end,
            line,
        }
    }

    /// Lexes the next token. Returns `TokenKind::End` at the end of markup
    /// (and on every call thereafter).
    pub(crate) fn next_token(&mut self) -> Result<Token, LexError> {
        self.skip_whitespace();
        let start = self.pos;
        let line = self.line;
        if self.pos >= self.end {
            return Ok(Token {
                kind: TokenKind::End,
                span: Span::new(start, 0, line),
            });
        }
        let byte = self.src.as_bytes()[self.pos];
        let kind = match BYTE_CLASS[byte as usize] {
            ByteClass::Space => unreachable!("whitespace was skipped"),
            ByteClass::Digit => self.lex_number()?,
            ByteClass::IdentStart => self.lex_word(),
            ByteClass::Quote => self.lex_string(byte)?,
            ByteClass::Punct => self.lex_punct(byte)?,
            ByteClass::Other => {
                let c = self.src[self.pos..].chars().next().unwrap_or('\u{fffd}');
                return Err(LexError::new(
                    format!("unexpected character {c:?}"),
                    Span::new(start, c.len_utf8(), line),
                ));
            }
        };
        Ok(Token {
            kind,
            span: Span::new(start, self.pos - start, line),
        })
    }

    fn skip_whitespace(&mut self) {
        while self.pos < self.end {
            let b = self.src.as_bytes()[self.pos];
            if BYTE_CLASS[b as usize] != ByteClass::Space {
                break;
            }
            if b == b'\n' {
                self.line += 1;
            }
            self.pos += 1;
        }
    }

    /// Numbers: `-?digits(.digits)?`. A lone `.` never joins a number so
    /// `1..5` lexes as `1`, `..`, `5`.
    fn lex_number(&mut self) -> Result<TokenKind, LexError> {
        let start = self.pos;
        let bytes = self.src.as_bytes();
        if bytes[self.pos] == b'-' {
            self.pos += 1;
        }
        while self.pos < self.end && bytes[self.pos].is_ascii_digit() {
            self.pos += 1;
        }
        let mut is_float = false;
        if self.pos < self.end
            && bytes[self.pos] == b'.'
            && self.pos + 1 < self.end
            && bytes[self.pos + 1].is_ascii_digit()
        {
            is_float = true;
            self.pos += 1;
            while self.pos < self.end && bytes[self.pos].is_ascii_digit() {
                self.pos += 1;
            }
        }
        let text = &self.src[start..self.pos];
        if is_float {
            text.parse()
                .map(TokenKind::Float)
                .map_err(|_| LexError::new(format!("invalid number {text:?}"), Span::new(start, text.len(), self.line)))
        } else {
            text.parse()
                .map(TokenKind::Int)
                .map_err(|_| LexError::new(format!("integer out of range: {text}"), Span::new(start, text.len(), self.line)))
        }
    }

    /// Identifiers and keywords. Identifiers may contain hyphens and end in
    /// `?`, matching the reference engine's permissive pattern.
    fn lex_word(&mut self) -> TokenKind {
        let start = self.pos;
        let bytes = self.src.as_bytes();
        self.pos += 1;
        while self.pos < self.end {
            let b = bytes[self.pos];
            if b.is_ascii_alphanumeric() || b == b'_' || b == b'-' {
                self.pos += 1;
            } else {
                break;
            }
        }
        if self.pos < self.end && bytes[self.pos] == b'?' {
            self.pos += 1;
        }
        let word = &self.src[start..self.pos];
        match word.parse::<Keyword>() {
            Ok(keyword) => TokenKind::Keyword(keyword),
            Err(_) => TokenKind::Ident(word.to_owned()),
        }
    }

    /// Quoted strings with the standard escapes `\\ \" \' \n \r \t`.
    fn lex_string(&mut self, quote: u8) -> Result<TokenKind, LexError> {
        let start = self.pos;
        let line = self.line;
        let bytes = self.src.as_bytes();
        self.pos += 1;
        let mut value = String::new();
        while self.pos < self.end {
            let b = bytes[self.pos];
            if b == quote {
                self.pos += 1;
                return Ok(TokenKind::Str(value));
            }
            if b == b'\\' {
                let escape = bytes.get(self.pos + 1).copied();
                let resolved = match escape {
                    Some(b'\\') => '\\',
                    Some(b'"') => '"',
                    Some(b'\'') => '\'',
                    Some(b'n') => '\n',
                    Some(b'r') => '\r',
                    Some(b't') => '\t',
                    _ => {
                        return Err(LexError::new(
                            "invalid escape sequence",
                            Span::new(self.pos, 2.min(self.end - self.pos), self.line),
                        ));
                    }
                };
                value.push(resolved);
                self.pos += 2;
                continue;
            }
            if b == b'\n' {
                self.line += 1;
            }
            let c = self.src[self.pos..].chars().next().expect("pos is on a char boundary");
            value.push(c);
            self.pos += c.len_utf8();
        }
        Err(LexError::new(
            "unterminated string literal",
            Span::new(start, self.pos - start, line),
        ))
    }

    fn lex_punct(&mut self, byte: u8) -> Result<TokenKind, LexError> {
        let bytes = self.src.as_bytes();
        let next = bytes.get(self.pos + 1).copied().filter(|_| self.pos + 1 < self.end);
        let (kind, width) = match (byte, next) {
            (b'-', Some(b'0'..=b'9')) => return self.lex_number(),
            (b'.', Some(b'.')) => (TokenKind::DotDot, 2),
            (b'.', _) => (TokenKind::Dot, 1),
            (b'|', _) => (TokenKind::Pipe, 1),
            (b':', _) => (TokenKind::Colon, 1),
            (b',', _) => (TokenKind::Comma, 1),
            (b'(', _) => (TokenKind::LParen, 1),
            (b')', _) => (TokenKind::RParen, 1),
            (b'[', _) => (TokenKind::LBracket, 1),
            (b']', _) => (TokenKind::RBracket, 1),
            (b'=', Some(b'=')) => (TokenKind::Compare(CmpOp::Eq), 2),
            (b'=', _) => (TokenKind::Assign, 1),
            (b'!', Some(b'=')) => (TokenKind::Compare(CmpOp::Ne), 2),
            (b'<', Some(b'=')) => (TokenKind::Compare(CmpOp::Le), 2),
            (b'<', Some(b'>')) => (TokenKind::Compare(CmpOp::Ne), 2),
            (b'<', _) => (TokenKind::Compare(CmpOp::Lt), 1),
            (b'>', Some(b'=')) => (TokenKind::Compare(CmpOp::Ge), 2),
            (b'>', _) => (TokenKind::Compare(CmpOp::Gt), 1),
            _ => {
                return Err(LexError::new(
                    format!("unexpected character {:?}", byte as char),
                    Span::new(self.pos, 1, self.line),
                ));
            }
        };
        self.pos += width;
        Ok(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex_all(markup: &str) -> Vec<TokenKind> {
        let mut lexer = ExprLexer::new(markup, 0..markup.len(), 1);
        let mut kinds = Vec::new();
        loop {
            let token = lexer.next_token().unwrap();
            let done = token.kind == TokenKind::End;
            kinds.push(token.kind);
            if done {
                break;
            }
        }
        kinds
    }

    #[test]
    fn test_basic_tokens() {
        assert_eq!(
            lex_all("x | append: 'hi'"),
            vec![
                TokenKind::Ident("x".to_owned()),
                TokenKind::Pipe,
                TokenKind::Ident("append".to_owned()),
                TokenKind::Colon,
                TokenKind::Str("hi".to_owned()),
                TokenKind::End,
            ]
        );
    }

    #[test]
    fn test_range_does_not_absorb_dots() {
        assert_eq!(
            lex_all("(1..5)"),
            vec![
                TokenKind::LParen,
                TokenKind::Int(1),
                TokenKind::DotDot,
                TokenKind::Int(5),
                TokenKind::RParen,
                TokenKind::End,
            ]
        );
    }

    #[test]
    fn test_numbers() {
        assert_eq!(lex_all("-3"), vec![TokenKind::Int(-3), TokenKind::End]);
        assert_eq!(lex_all("2.5"), vec![TokenKind::Float(2.5), TokenKind::End]);
        assert_eq!(
            lex_all("1.."),
            vec![TokenKind::Int(1), TokenKind::DotDot, TokenKind::End]
        );
    }

    #[test]
    fn test_keywords_and_hyphenated_idents() {
        assert_eq!(
            lex_all("a-b contains null"),
            vec![
                TokenKind::Ident("a-b".to_owned()),
                TokenKind::Keyword(Keyword::Contains),
                TokenKind::Keyword(Keyword::Nil),
                TokenKind::End,
            ]
        );
    }

    #[test]
    fn test_comparison_operators() {
        assert_eq!(
            lex_all("a <> b <= c"),
            vec![
                TokenKind::Ident("a".to_owned()),
                TokenKind::Compare(CmpOp::Ne),
                TokenKind::Ident("b".to_owned()),
                TokenKind::Compare(CmpOp::Le),
                TokenKind::Ident("c".to_owned()),
                TokenKind::End,
            ]
        );
    }

    #[test]
    fn test_string_escapes() {
        assert_eq!(
            lex_all(r#""a\n\t\"b""#),
            vec![TokenKind::Str("a\n\t\"b".to_owned()), TokenKind::End]
        );
    }

    #[test]
    fn test_unterminated_string() {
        let mut lexer = ExprLexer::new("'abc", 0..4, 1);
        let err = lexer.next_token().unwrap_err();
        assert!(err.message.contains("unterminated string"));
    }

    #[test]
    fn test_invalid_escape() {
        let mut lexer = ExprLexer::new(r"'a\q'", 0..5, 1);
        let err = lexer.next_token().unwrap_err();
        assert!(err.message.contains("invalid escape"));
    }

    #[test]
    fn test_spans_are_absolute() {
        let src = "xxxx{{ name }}";
        let mut lexer = ExprLexer::new(src, 6..12, 1);
        let token = lexer.next_token().unwrap();
        assert_eq!(token.span.offset, 7);
        assert_eq!(token.span.len, 4);
    }
}
