//! Two-stage lexical analysis.
//!
//! The *template lexer* ([`template`]) splits the source into raw text, tag
//! and output segments and applies the `{%-`/`-%}` whitespace-trim markers.
//! Inside each tag or output segment the *expression lexer* ([`expr`]) then
//! produces typed tokens for the parser. Both stages attach byte-offset spans
//! to everything they emit.

pub(crate) mod expr;
pub(crate) mod template;

pub(crate) use expr::{ExprLexer, Keyword, Token, TokenKind};
pub(crate) use template::{Segment, SegmentKind, tokenize};

use crate::error::TemplateError;
use crate::span::Span;

/// A lexical error with the span it occurred at.
///
/// Surfaced as a compile-time syntax diagnostic; in lax mode the parser turns
/// it into an inline render-time error for the enclosing segment instead.
#[derive(Debug, Clone)]
pub(crate) struct LexError {
    pub message: String,
    pub span: Span,
}

impl LexError {
    pub(crate) fn new(message: impl Into<String>, span: Span) -> Self {
        Self {
            message: message.into(),
            span,
        }
    }
}

impl From<LexError> for TemplateError {
    fn from(err: LexError) -> Self {
        Self::syntax(err.message, err.span)
    }
}
