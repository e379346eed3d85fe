//! Recursive-descent parser emitting IR directly.
//!
//! There is no AST: the parser walks the segment stream from the template
//! lexer, runs the expression lexer inside each tag and output, and appends
//! instructions to an [`IrBuilder`] as it goes. Control-flow tags allocate
//! symbolic labels that the linker resolves after optimization.
//!
//! Error recovery follows the engine's two error modes: structural problems
//! (an unclosed block, an unterminated tag) fail compilation in either mode,
//! while a malformed tag or output in lax mode compiles to an instruction
//! that renders the standard inline error text in its place.

mod expr;
mod tags;

use std::sync::Arc;

use crate::error::{ErrorMode, TemplateError};
use crate::ir::builder::IrBuilder;
use crate::ir::Instruction;
use crate::lexer::{ExprLexer, LexError, Segment, SegmentKind, Token, TokenKind, tokenize};
use crate::span::Span;

/// Result of parsing a block body: the terminator tag that ended it.
///
/// `None` means the segment stream ran out (only valid at the top level).
pub(crate) struct BlockEnd {
    /// Terminator tag name (`"endif"`, `"else"`, `"when"`, …).
    pub name: String,
    /// Cursor over the terminator tag's remaining markup (after the name),
    /// for terminators that carry expressions (`elsif`, `when`).
    pub tokens: Tokens,
    pub span: Span,
}

/// Token cursor over one segment's markup, with single-token lookahead.
pub(crate) struct Tokens {
    tokens: Vec<Token>,
    position: usize,
}

impl Tokens {
    /// Lexes the whole markup eagerly; a lex error surfaces here so tags can
    /// recover before emitting anything.
    fn new(src: &str, segment: &Segment) -> Result<Self, LexError> {
        let mut lexer = ExprLexer::new(src, segment.markup.clone(), segment.markup_line);
        let mut tokens = Vec::new();
        loop {
            let token = lexer.next_token()?;
            let end = token.kind == TokenKind::End;
            tokens.push(token);
            if end {
                break;
            }
        }
        Ok(Self { tokens, position: 0 })
    }

    /// The next token without consuming it.
    pub(crate) fn peek(&self) -> &Token {
        &self.tokens[self.position.min(self.tokens.len() - 1)]
    }

    /// Looks `offset` tokens ahead (0 is [`peek`](Self::peek)); saturates at
    /// the trailing `End` token.
    pub(crate) fn peek_at(&self, offset: usize) -> &Token {
        let index = (self.position + offset).min(self.tokens.len() - 1);
        &self.tokens[index]
    }

    /// Span of the most recently consumed token.
    pub(crate) fn prev_span(&self) -> Span {
        if self.position == 0 {
            self.tokens[0].span
        } else {
            self.tokens[self.position - 1].span
        }
    }

    /// Consumes and returns the next token; sticks at `End`.
    pub(crate) fn next(&mut self) -> Token {
        let token = self.tokens[self.position.min(self.tokens.len() - 1)].clone();
        if self.position < self.tokens.len() - 1 {
            self.position += 1;
        }
        token
    }

    /// True when all meaningful tokens are consumed.
    pub(crate) fn at_end(&self) -> bool {
        self.peek().kind == TokenKind::End
    }

    /// Consumes the next token if it matches `kind`.
    pub(crate) fn eat(&mut self, kind: &TokenKind) -> bool {
        if &self.peek().kind == kind {
            self.next();
            true
        } else {
            false
        }
    }

    /// Consumes an identifier, or errors.
    pub(crate) fn expect_ident(&mut self, what: &str) -> Result<String, TemplateError> {
        let token = self.next();
        match token.kind {
            TokenKind::Ident(name) => Ok(name),
            other => Err(unexpected(what, &other, token.span)),
        }
    }

    /// Consumes a specific punctuation token, or errors.
    pub(crate) fn expect(&mut self, kind: &TokenKind, what: &str) -> Result<(), TemplateError> {
        let token = self.next();
        if &token.kind == kind {
            Ok(())
        } else {
            Err(unexpected(what, &token.kind, token.span))
        }
    }

    /// Errors unless the markup is fully consumed.
    pub(crate) fn expect_end(&mut self) -> Result<(), TemplateError> {
        let token = self.next();
        if token.kind == TokenKind::End {
            Ok(())
        } else {
            Err(unexpected("end of tag", &token.kind, token.span))
        }
    }
}

/// Builds the standard "expected X, found Y" syntax error.
pub(crate) fn unexpected(expected: &str, found: &TokenKind, span: Span) -> TemplateError {
    let found = match found {
        TokenKind::End => "end of tag".to_owned(),
        TokenKind::Ident(name) => format!("`{name}`"),
        TokenKind::Str(_) => "string literal".to_owned(),
        TokenKind::Int(i) => format!("`{i}`"),
        TokenKind::Float(f) => format!("`{f}`"),
        other => format!("{other:?}"),
    };
    TemplateError::syntax(format!("expected {expected}, found {found}"), span)
}

/// The parser: a cursor over segments plus the IR builder.
pub(crate) struct Parser<'s> {
    src: &'s str,
    segments: Vec<Segment>,
    position: usize,
    pub(crate) builder: IrBuilder,
    /// Partial name used in inline error text; `None` at top level.
    name: Option<Arc<str>>,
    mode: ErrorMode,
}

/// Parses a template source into unlinked IR.
///
/// The returned vector ends in `Halt`; jump targets are still symbolic.
pub(crate) fn parse_template(
    src: &str,
    name: Option<Arc<str>>,
    mode: ErrorMode,
) -> Result<(Vec<Instruction>, Vec<Span>), TemplateError> {
    let segments = tokenize(src)?;
    let mut parser = Parser {
        src,
        segments,
        position: 0,
        builder: IrBuilder::new(),
        name,
        mode,
    };
    let end = parser.parse_block(&[])?;
    debug_assert!(end.is_none(), "top level cannot hit a terminator");
    parser.builder.set_span(Span::synthetic());
    parser.builder.emit(Instruction::Halt);
    Ok(parser.builder.finish())
}

impl Parser<'_> {
    /// Parses segments until one of `terminators` (a tag by that name) or the
    /// end of the stream. The terminator segment itself is consumed.
    pub(crate) fn parse_block(&mut self, terminators: &[&str]) -> Result<Option<BlockEnd>, TemplateError> {
        while self.position < self.segments.len() {
            let segment = self.segments[self.position].clone();
            self.position += 1;
            self.builder.set_span(segment.span);
            match segment.kind {
                SegmentKind::Raw => {
                    if !segment.text.is_empty() {
                        self.builder.emit(Instruction::WriteRaw(Arc::from(segment.text.as_str())));
                    }
                }
                SegmentKind::Output => self.parse_output(&segment)?,
                SegmentKind::Tag => {
                    let markup = self.src[segment.markup.clone()].trim();
                    if markup.starts_with('#') {
                        // `{% # inline comment %}` renders nothing.
                        continue;
                    }
                    let mut tokens = match Tokens::new(self.src, &segment) {
                        Ok(tokens) => tokens,
                        Err(err) => {
                            self.recover(err.into(), segment.span, None)?;
                            continue;
                        }
                    };
                    let Some(tag_name) = tag_name(&mut tokens) else {
                        self.recover(
                            TemplateError::syntax("missing tag name", segment.span),
                            segment.span,
                            None,
                        )?;
                        continue;
                    };
                    if terminators.contains(&tag_name.as_str()) {
                        return Ok(Some(BlockEnd {
                            name: tag_name,
                            tokens,
                            span: segment.span,
                        }));
                    }
                    self.parse_tag(&tag_name, tokens, &segment)?;
                }
            }
        }
        if terminators.is_empty() {
            Ok(None)
        } else {
            // An unclosed block is structural: it always fails compilation.
            Err(TemplateError::new(
                crate::error::ErrorKind::Syntax,
                format!("block was never closed: expected {}", terminators.join(" or ")),
            ))
        }
    }

    /// Parses a `{{ … }}` segment: expression, then `WriteValue`.
    fn parse_output(&mut self, segment: &Segment) -> Result<(), TemplateError> {
        let checkpoint = self.builder.checkpoint();
        let result = (|| -> Result<(), TemplateError> {
            let mut tokens = Tokens::new(self.src, segment)?;
            self.parse_expression(&mut tokens)?;
            tokens.expect_end()?;
            self.builder.emit(Instruction::WriteValue);
            Ok(())
        })();
        match result {
            Ok(()) => Ok(()),
            Err(err) => {
                self.builder.rollback(checkpoint);
                self.recover(err, segment.span, None)
            }
        }
    }

    /// Handles a failed tag or output per the error mode.
    ///
    /// Lax mode writes the standard inline error text where the construct
    /// would have rendered; `block_name` additionally skips the (balanced)
    /// body of a failed block tag.
    pub(crate) fn recover(
        &mut self,
        err: TemplateError,
        span: Span,
        block_name: Option<&str>,
    ) -> Result<(), TemplateError> {
        if self.mode == ErrorMode::Strict {
            return Err(err.with_partial(self.name.clone()));
        }
        let text = match self.name.as_deref() {
            Some(partial) => format!("Liquid error ({partial} line {}): {}", span.line, err.message()),
            None => format!("Liquid error (line {}): {}", span.line, err.message()),
        };
        self.builder.set_span(span);
        self.builder.emit(Instruction::WriteRaw(Arc::from(text)));
        if let Some(name) = block_name {
            self.skip_balanced(name)?;
        }
        Ok(())
    }

    /// Skips segments until the matching `end<name>`, honoring nesting.
    ///
    /// Used for recovery and for `{% comment %}` bodies.
    pub(crate) fn skip_balanced(&mut self, name: &str) -> Result<(), TemplateError> {
        let end_name = format!("end{name}");
        let mut depth = 1usize;
        while self.position < self.segments.len() {
            let segment = &self.segments[self.position];
            self.position += 1;
            if segment.kind != SegmentKind::Tag {
                continue;
            }
            let markup = self.src[segment.markup.clone()].trim();
            let first_word = markup.split_whitespace().next().unwrap_or("");
            if first_word == name {
                depth += 1;
            } else if first_word == end_name {
                depth -= 1;
                if depth == 0 {
                    return Ok(());
                }
            }
        }
        Err(TemplateError::new(
            crate::error::ErrorKind::Syntax,
            format!("tag `{name}` was never closed"),
        ))
    }

    /// Source text of a span, used for loop names and cycle identities.
    pub(crate) fn source_slice(&self, span: Span) -> &str {
        &self.src[span.offset as usize..span.end() as usize]
    }

    /// The full template source.
    pub(crate) fn source(&self) -> &'_ str {
        self.src
    }

    /// Consumes and returns the next segment, if any.
    pub(crate) fn next_segment(&mut self) -> Option<Segment> {
        let segment = self.segments.get(self.position)?.clone();
        self.position += 1;
        Some(segment)
    }
}

/// Extracts the tag name from the front of a tag's markup.
///
/// `for` collides with the expression keyword, so keywords that double as
/// tag names are mapped back to their spelling.
fn tag_name(tokens: &mut Tokens) -> Option<String> {
    match &tokens.peek().kind {
        TokenKind::Ident(name) => {
            let name = name.clone();
            tokens.next();
            Some(name)
        }
        TokenKind::Keyword(crate::lexer::Keyword::For) => {
            tokens.next();
            Some("for".to_owned())
        }
        _ => None,
    }
}
