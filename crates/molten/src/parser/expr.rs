//! The expression grammar.
//!
//! Precedence, tightest first: primary (literals, variables, ranges, indexed
//! paths) → filter pipeline (`|`) → comparison (`==`, `<`, `contains`, …) →
//! unary `not` → `and` → `or`. Everything emits IR directly; the value of an
//! expression is whatever the emitted code leaves on top of the stack.

use std::sync::Arc;

use crate::ir::{Instruction, Target};
use crate::lexer::{Keyword, TokenKind};
use crate::parser::{Parser, Tokens, unexpected};
use crate::error::TemplateError;

impl Parser<'_> {
    /// Parses a full expression (`or` level).
    pub(crate) fn parse_expression(&mut self, tokens: &mut Tokens) -> Result<(), TemplateError> {
        self.parse_and(tokens)?;
        while tokens.eat(&TokenKind::Keyword(Keyword::Or)) {
            // Short-circuit: keep the left value when truthy.
            let done = self.builder.new_label();
            self.builder.emit(Instruction::IsTruthy);
            self.builder.emit(Instruction::Dup);
            self.builder.emit(Instruction::JumpIfTrue(Target::Label(done)));
            self.builder.emit(Instruction::Pop);
            self.parse_and(tokens)?;
            self.builder.emit(Instruction::IsTruthy);
            self.builder.bind_label(done);
        }
        Ok(())
    }

    fn parse_and(&mut self, tokens: &mut Tokens) -> Result<(), TemplateError> {
        self.parse_not(tokens)?;
        while tokens.eat(&TokenKind::Keyword(Keyword::And)) {
            let done = self.builder.new_label();
            self.builder.emit(Instruction::IsTruthy);
            self.builder.emit(Instruction::Dup);
            self.builder.emit(Instruction::JumpIfFalse(Target::Label(done)));
            self.builder.emit(Instruction::Pop);
            self.parse_not(tokens)?;
            self.builder.emit(Instruction::IsTruthy);
            self.builder.bind_label(done);
        }
        Ok(())
    }

    fn parse_not(&mut self, tokens: &mut Tokens) -> Result<(), TemplateError> {
        if tokens.eat(&TokenKind::Keyword(Keyword::Not)) {
            self.parse_not(tokens)?;
            self.builder.emit(Instruction::BoolNot);
            Ok(())
        } else {
            self.parse_comparison(tokens)
        }
    }

    fn parse_comparison(&mut self, tokens: &mut Tokens) -> Result<(), TemplateError> {
        self.parse_pipeline(tokens)?;
        if let TokenKind::Compare(op) = tokens.peek().kind {
            tokens.next();
            self.parse_pipeline(tokens)?;
            self.builder.emit(Instruction::Compare(op));
        } else if tokens.eat(&TokenKind::Keyword(Keyword::Contains)) {
            self.parse_pipeline(tokens)?;
            self.builder.emit(Instruction::Contains);
        }
        Ok(())
    }

    /// Parses `primary (| filter[: args])*`.
    pub(crate) fn parse_pipeline(&mut self, tokens: &mut Tokens) -> Result<(), TemplateError> {
        self.parse_primary(tokens)?;
        while tokens.eat(&TokenKind::Pipe) {
            let name_token = tokens.next();
            let TokenKind::Ident(name) = name_token.kind else {
                return Err(unexpected("filter name", &name_token.kind, name_token.span));
            };
            self.builder.set_span(name_token.span.merge(self.builder.span()));
            let argc = if tokens.eat(&TokenKind::Colon) {
                self.parse_filter_args(tokens)?
            } else {
                0
            };
            self.builder.emit(Instruction::CallFilter {
                name: Arc::from(name.as_str()),
                argc,
            });
        }
        Ok(())
    }

    /// Parses filter arguments: positional values, then optional `key: value`
    /// pairs which are collected into one trailing hash argument.
    ///
    /// Arguments are primaries: a `|` after an argument belongs to the
    /// enclosing pipeline, not to the argument.
    fn parse_filter_args(&mut self, tokens: &mut Tokens) -> Result<u8, TemplateError> {
        let mut positional: u8 = 0;
        let mut named: u16 = 0;
        loop {
            if named > 0 || self.at_named_arg(tokens) {
                let key_token = tokens.next();
                let TokenKind::Ident(key) = key_token.kind else {
                    return Err(unexpected("argument name", &key_token.kind, key_token.span));
                };
                tokens.expect(&TokenKind::Colon, "`:`")?;
                self.builder.emit(Instruction::ConstString(Arc::from(key.as_str())));
                self.parse_primary(tokens)?;
                named += 1;
            } else {
                self.parse_primary(tokens)?;
                positional = positional
                    .checked_add(1)
                    .ok_or_else(|| TemplateError::syntax("too many filter arguments", tokens.peek().span))?;
            }
            if !tokens.eat(&TokenKind::Comma) {
                break;
            }
        }
        if named > 0 {
            self.builder.emit(Instruction::BuildHash(named));
            positional = positional
                .checked_add(1)
                .ok_or_else(|| TemplateError::syntax("too many filter arguments", tokens.peek().span))?;
        }
        Ok(positional)
    }

    /// Whether the cursor sits on a `key: value` named argument.
    fn at_named_arg(&self, tokens: &Tokens) -> bool {
        matches!(tokens.peek().kind, TokenKind::Ident(_)) && tokens.peek_at(1).kind == TokenKind::Colon
    }

    /// Parses a primary expression: literal, range, variable path, or
    /// dynamic root lookup.
    pub(crate) fn parse_primary(&mut self, tokens: &mut Tokens) -> Result<(), TemplateError> {
        let token = tokens.next();
        match token.kind {
            TokenKind::Int(i) => self.builder.emit(Instruction::ConstInt(i)),
            TokenKind::Float(f) => self.builder.emit(Instruction::ConstFloat(f)),
            TokenKind::Str(s) => self.builder.emit(Instruction::ConstString(Arc::from(s.as_str()))),
            TokenKind::Keyword(Keyword::True) => self.builder.emit(Instruction::ConstTrue),
            TokenKind::Keyword(Keyword::False) => self.builder.emit(Instruction::ConstFalse),
            TokenKind::Keyword(Keyword::Nil) => self.builder.emit(Instruction::ConstNil),
            TokenKind::Keyword(Keyword::Empty) => self.builder.emit(Instruction::ConstEmpty),
            TokenKind::Keyword(Keyword::Blank) => self.builder.emit(Instruction::ConstBlank),
            TokenKind::LParen => self.parse_range_or_group(tokens)?,
            TokenKind::LBracket => {
                // Dynamic root lookup: `[expr]` resolves the computed name.
                self.parse_expression(tokens)?;
                tokens.expect(&TokenKind::RBracket, "`]`")?;
                self.builder.emit(Instruction::FindVarDynamic);
                self.parse_path(tokens)?;
            }
            TokenKind::Ident(name) => {
                self.builder.emit(Instruction::FindVar(Arc::from(name.as_str())));
                self.parse_path(tokens)?;
            }
            other => return Err(unexpected("expression", &other, token.span)),
        }
        Ok(())
    }

    /// Parses `(a..b)` ranges and parenthesized expressions.
    ///
    /// A pure literal range collapses to `ConstRange` at parse time.
    fn parse_range_or_group(&mut self, tokens: &mut Tokens) -> Result<(), TemplateError> {
        // Literal fast path: `( int .. int )`.
        if let (TokenKind::Int(start), TokenKind::DotDot) = (&tokens.peek().kind, &tokens.peek_at(1).kind) {
            if let TokenKind::Int(end) = tokens.peek_at(2).kind
                && tokens.peek_at(3).kind == TokenKind::RParen
            {
                let start = *start;
                tokens.next();
                tokens.next();
                tokens.next();
                tokens.next();
                self.builder.emit(Instruction::ConstRange(start, end));
                return Ok(());
            }
        }
        self.parse_expression(tokens)?;
        if tokens.eat(&TokenKind::DotDot) {
            self.parse_expression(tokens)?;
            tokens.expect(&TokenKind::RParen, "`)`")?;
            self.builder.emit(Instruction::NewRange);
        } else {
            tokens.expect(&TokenKind::RParen, "`)`")?;
        }
        Ok(())
    }

    /// Parses the `.key` / `[expr]` postfix chain after a variable root.
    fn parse_path(&mut self, tokens: &mut Tokens) -> Result<(), TemplateError> {
        loop {
            if tokens.eat(&TokenKind::Dot) {
                let token = tokens.next();
                let TokenKind::Ident(name) = token.kind else {
                    return Err(unexpected("property name", &token.kind, token.span));
                };
                if matches!(name.as_str(), "size" | "first" | "last") {
                    self.builder.emit(Instruction::LookupCommand(Arc::from(name.as_str())));
                } else {
                    self.builder.emit(Instruction::LookupConstKey(Arc::from(name.as_str())));
                }
            } else if tokens.eat(&TokenKind::LBracket) {
                if let TokenKind::Str(key) = &tokens.peek().kind
                    && tokens.peek_at(1).kind == TokenKind::RBracket
                {
                    let key = key.clone();
                    tokens.next();
                    tokens.next();
                    self.builder.emit(Instruction::LookupConstKey(Arc::from(key.as_str())));
                } else {
                    self.parse_expression(tokens)?;
                    tokens.expect(&TokenKind::RBracket, "`]`")?;
                    self.builder.emit(Instruction::LookupKey);
                }
            } else {
                return Ok(());
            }
        }
    }
}
