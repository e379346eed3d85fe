//! Tag grammar and lowering.
//!
//! Each tag lowers to the IR shapes the VM expects; the comments on the loop
//! tags show the full instruction skeleton since the interrupt protocol is
//! easy to get subtly wrong.

use std::sync::Arc;

use crate::error::TemplateError;
use crate::ir::{
    ForInitArgs, Instruction, InterruptKind, PartialBinding, PartialCall, TablerowInitArgs, Target,
};
use crate::lexer::{Keyword, Segment, SegmentKind, TokenKind};
use crate::parser::{BlockEnd, Parser, Tokens, unexpected};
use crate::span::Span;

/// Tag names only valid as block terminators; hitting one outside its block
/// is a syntax error of its own kind.
const STRAY_TERMINATORS: &[&str] = &[
    "endif",
    "endunless",
    "endcase",
    "endfor",
    "endtablerow",
    "endcapture",
    "endifchanged",
    "endcomment",
    "endraw",
    "else",
    "elsif",
    "when",
];

impl Parser<'_> {
    /// Dispatches one tag by name.
    pub(crate) fn parse_tag(&mut self, name: &str, tokens: Tokens, segment: &Segment) -> Result<(), TemplateError> {
        match name {
            "if" => self.tag_if(tokens, segment, false),
            "unless" => self.tag_if(tokens, segment, true),
            "case" => self.tag_case(tokens, segment),
            "for" => self.tag_for(tokens, segment),
            "tablerow" => self.tag_tablerow(tokens, segment),
            "assign" => self.tag_assign(tokens, segment),
            "capture" => self.tag_capture(tokens, segment),
            "increment" => self.tag_counter(tokens, segment, false),
            "decrement" => self.tag_counter(tokens, segment, true),
            "cycle" => self.tag_cycle(tokens, segment),
            "ifchanged" => self.tag_ifchanged(segment),
            "comment" => self.skip_balanced("comment"),
            "echo" => self.tag_echo(tokens, segment),
            "break" => self.tag_interrupt(tokens, segment, InterruptKind::Break),
            "continue" => self.tag_interrupt(tokens, segment, InterruptKind::Continue),
            "render" => self.tag_partial(tokens, segment, true),
            "include" => self.tag_partial(tokens, segment, false),
            "liquid" => self.tag_liquid(segment),
            _ if STRAY_TERMINATORS.contains(&name) => self.recover(
                TemplateError::syntax(format!("unexpected tag `{name}`"), segment.span),
                segment.span,
                None,
            ),
            _ => self.recover(
                TemplateError::syntax(format!("unknown tag `{name}`"), segment.span),
                segment.span,
                None,
            ),
        }
    }

    /// Parses a condition expression, recovering to a constant-false
    /// condition (plus the inline error text) in lax mode.
    fn condition_or_false(&mut self, tokens: &mut Tokens, span: Span) -> Result<(), TemplateError> {
        let checkpoint = self.builder.checkpoint();
        let result = (|| {
            self.parse_expression(tokens)?;
            tokens.expect_end()
        })();
        if let Err(err) = result {
            self.builder.rollback(checkpoint);
            self.recover(err, span, None)?;
            self.builder.emit(Instruction::ConstFalse);
        }
        Ok(())
    }

    /// `{% if c %} … {% elsif c %} … {% else %} … {% endif %}` and the
    /// negated `unless` variant.
    fn tag_if(&mut self, mut tokens: Tokens, segment: &Segment, negate: bool) -> Result<(), TemplateError> {
        let end_tag = if negate { "endunless" } else { "endif" };
        let base = self.builder.stack_depth();
        let done = self.builder.new_label();
        let mut next = self.builder.new_label();

        self.condition_or_false(&mut tokens, segment.span)?;
        self.builder.emit(Instruction::IsTruthy);
        self.builder.emit(if negate {
            Instruction::JumpIfTrue(Target::Label(next))
        } else {
            Instruction::JumpIfFalse(Target::Label(next))
        });

        loop {
            let mut end = self
                .parse_block(&["elsif", "else", end_tag])?
                .expect("parse_block errors on missing terminator");
            let terminator = std::mem::take(&mut end.name);
            match terminator.as_str() {
                "elsif" => {
                    self.builder.emit(Instruction::Jump(Target::Label(done)));
                    self.builder.bind_label(next);
                    self.builder.set_stack_depth(base);
                    next = self.builder.new_label();
                    self.condition_or_false(&mut end.tokens, end.span)?;
                    self.builder.emit(Instruction::IsTruthy);
                    self.builder.emit(Instruction::JumpIfFalse(Target::Label(next)));
                }
                "else" => {
                    self.builder.emit(Instruction::Jump(Target::Label(done)));
                    self.builder.bind_label(next);
                    self.builder.set_stack_depth(base);
                    next = self.builder.new_label();
                    self.parse_block(&[end_tag])?
                        .expect("parse_block errors on missing terminator");
                    break;
                }
                _ => break,
            }
        }
        self.builder.bind_label(next);
        self.builder.set_stack_depth(base);
        self.builder.bind_label(done);
        self.builder.set_stack_depth(base);
        Ok(())
    }

    /// `{% case e %}{% when v %} … {% else %} … {% endcase %}`.
    ///
    /// The case value stays on the stack across the whole dispatch; every
    /// path pops it exactly once.
    fn tag_case(&mut self, mut tokens: Tokens, segment: &Segment) -> Result<(), TemplateError> {
        let checkpoint = self.builder.checkpoint();
        let head = (|| {
            self.parse_expression(&mut tokens)?;
            tokens.expect_end()
        })();
        if let Err(err) = head {
            self.builder.rollback(checkpoint);
            self.recover(err, segment.span, None)?;
            self.builder.emit(Instruction::ConstNil);
        }
        let base = self.builder.stack_depth();
        let done = self.builder.new_label();

        let mut end = self.case_leading_terminator(segment.span)?;
        let mut popped = false;
        loop {
            let terminator = std::mem::take(&mut end.name);
            match terminator.as_str() {
                "when" => {
                    let body = self.builder.new_label();
                    let next = self.builder.new_label();
                    let when_span = end.span;
                    let when_checkpoint = self.builder.checkpoint();
                    let values = self.parse_when_values(&mut end.tokens, body);
                    if let Err(err) = values {
                        // Drop any half-emitted checks; the body becomes
                        // unreachable through the fall-through jump below.
                        self.builder.rollback(when_checkpoint);
                        self.recover(err, when_span, None)?;
                    }
                    self.builder.emit(Instruction::Jump(Target::Label(next)));
                    self.builder.bind_label(body);
                    self.builder.set_stack_depth(base);
                    self.builder.emit(Instruction::Pop);
                    end = self
                        .parse_block(&["when", "else", "endcase"])?
                        .expect("parse_block errors on missing terminator");
                    self.builder.emit(Instruction::Jump(Target::Label(done)));
                    self.builder.bind_label(next);
                    self.builder.set_stack_depth(base);
                }
                "else" => {
                    self.builder.emit(Instruction::Pop);
                    popped = true;
                    end = self
                        .parse_block(&["endcase"])?
                        .expect("parse_block errors on missing terminator");
                }
                _ => {
                    if !popped {
                        self.builder.emit(Instruction::Pop);
                    }
                    break;
                }
            }
        }
        self.builder.bind_label(done);
        self.builder.set_stack_depth(base - 1);
        Ok(())
    }

    /// Emits the `Dup; eval v; CaseCompare; JumpIfTrue body` chain for one
    /// `when` clause (values separated by `,` or `or`).
    fn parse_when_values(&mut self, tokens: &mut Tokens, body: crate::ir::LabelId) -> Result<(), TemplateError> {
        loop {
            self.builder.emit(Instruction::Dup);
            self.parse_primary(tokens)?;
            self.builder.emit(Instruction::CaseCompare);
            self.builder.emit(Instruction::JumpIfTrue(Target::Label(body)));
            if !(tokens.eat(&TokenKind::Comma) || tokens.eat(&TokenKind::Keyword(Keyword::Or))) {
                break;
            }
        }
        tokens.expect_end()
    }

    /// Consumes segments between `case` and its first clause; only raw text
    /// (which the engine discards) may appear there.
    fn case_leading_terminator(&mut self, case_span: Span) -> Result<BlockEnd, TemplateError> {
        while let Some(segment) = self.next_segment() {
            match segment.kind {
                SegmentKind::Raw => {}
                SegmentKind::Output => {
                    return Err(TemplateError::syntax("expected `when` after `case`", segment.span));
                }
                SegmentKind::Tag => {
                    let mut tokens = Tokens::new(self.source(), &segment)?;
                    let name = match &tokens.peek().kind {
                        TokenKind::Ident(name) => name.clone(),
                        _ => return Err(TemplateError::syntax("expected `when` after `case`", segment.span)),
                    };
                    if matches!(name.as_str(), "when" | "else" | "endcase") {
                        tokens.next();
                        return Ok(BlockEnd {
                            name,
                            tokens,
                            span: segment.span,
                        });
                    }
                    return Err(TemplateError::syntax("expected `when` after `case`", segment.span));
                }
            }
        }
        Err(TemplateError::syntax("tag `case` was never closed", case_span))
    }

    /// `{% for x in xs limit: l offset: o reversed %}BODY{% else %}E{% endfor %}`.
    ///
    /// Lowered skeleton (modifier evaluations reordered in front of the
    /// collection so `JumpIfEmpty` can peek it on top of the stack):
    ///
    /// ```text
    ///     [offset] [limit] xs
    ///     JumpIfEmpty else
    ///     ForInit            ; pops xs, limit?, offset?; pushes iterator
    ///     PushScope
    ///     PushForloop
    /// head:
    ///     ForNext cont, brk  ; pushes item or jumps brk on exhaustion
    ///     AssignLocal x
    ///     BODY
    ///     JumpIfInterrupt brk
    /// cont:
    ///     PopInterrupt       ; clears a pending continue
    ///     Jump head
    /// brk:
    ///     PopInterrupt       ; clears a pending break
    ///     ForEnd
    ///     PopForloop
    ///     PopScope
    ///     Jump end
    /// else:
    ///     Pop ...            ; drops xs and unused modifier values
    ///     E
    /// end:
    /// ```
    fn tag_for(&mut self, mut tokens: Tokens, segment: &Segment) -> Result<(), TemplateError> {
        let base = self.builder.stack_depth();
        let checkpoint = self.builder.checkpoint();
        let head = match self.parse_loop_head(&mut tokens, false) {
            Ok(head) => head,
            Err(err) => {
                self.builder.rollback(checkpoint);
                return self.recover(err, segment.span, Some("for"));
            }
        };
        let extra = usize::from(head.has_limit) + usize::from(head.has_offset);

        let lelse = self.builder.new_label();
        let lend = self.builder.new_label();
        self.builder.emit(Instruction::JumpIfEmpty(Target::Label(lelse)));
        self.builder.emit(Instruction::ForInit(Arc::new(ForInitArgs {
            var: head.var.clone(),
            loop_name: head.loop_name.clone(),
            has_limit: head.has_limit,
            has_offset: head.has_offset,
            offset_continue: head.offset_continue,
            reversed: head.reversed,
        })));
        self.builder.emit(Instruction::PushScope);
        self.builder.emit(Instruction::PushForloop);

        let lhead = self.builder.new_label();
        let lcont = self.builder.new_label();
        let lbrk = self.builder.new_label();
        self.builder.bind_label(lhead);
        self.builder.emit(Instruction::ForNext {
            cont: Target::Label(lcont),
            brk: Target::Label(lbrk),
        });
        self.builder.emit(Instruction::AssignLocal(head.var));

        let end = self
            .parse_block(&["endfor", "else"])?
            .expect("parse_block errors on missing terminator");

        self.builder.emit(Instruction::JumpIfInterrupt(Target::Label(lbrk)));
        self.builder.bind_label(lcont);
        self.builder.emit(Instruction::PopInterrupt);
        self.builder.emit(Instruction::Jump(Target::Label(lhead)));
        self.builder.bind_label(lbrk);
        self.builder.set_stack_depth(base);
        self.builder.emit(Instruction::PopInterrupt);
        self.builder.emit(Instruction::ForEnd);
        self.builder.emit(Instruction::PopForloop);
        self.builder.emit(Instruction::PopScope);
        self.builder.emit(Instruction::Jump(Target::Label(lend)));

        self.builder.bind_label(lelse);
        self.builder.set_stack_depth(base + 1 + i32::try_from(extra).expect("modifier count fits i32"));
        for _ in 0..=extra {
            self.builder.emit(Instruction::Pop);
        }
        if end.name == "else" {
            self.parse_block(&["endfor"])?
                .expect("parse_block errors on missing terminator");
        }
        self.builder.bind_label(lend);
        self.builder.set_stack_depth(base);
        Ok(())
    }

    /// `{% tablerow x in xs cols: 3 %} … {% endtablerow %}`.
    fn tag_tablerow(&mut self, mut tokens: Tokens, segment: &Segment) -> Result<(), TemplateError> {
        let base = self.builder.stack_depth();
        let checkpoint = self.builder.checkpoint();
        let head = match self.parse_loop_head(&mut tokens, true) {
            Ok(head) => head,
            Err(err) => {
                self.builder.rollback(checkpoint);
                return self.recover(err, segment.span, Some("tablerow"));
            }
        };

        self.builder.emit(Instruction::TablerowInit(Arc::new(TablerowInitArgs {
            var: head.var.clone(),
            loop_name: head.loop_name.clone(),
            has_cols: head.has_cols,
            has_limit: head.has_limit,
            has_offset: head.has_offset,
        })));
        self.builder.emit(Instruction::PushScope);

        let lhead = self.builder.new_label();
        let lcont = self.builder.new_label();
        let lbrk = self.builder.new_label();
        self.builder.bind_label(lhead);
        self.builder.emit(Instruction::TablerowNext {
            cont: Target::Label(lcont),
            brk: Target::Label(lbrk),
        });
        self.builder.emit(Instruction::AssignLocal(head.var));

        self.parse_block(&["endtablerow"])?
            .expect("parse_block errors on missing terminator");

        self.builder.emit(Instruction::JumpIfInterrupt(Target::Label(lbrk)));
        self.builder.bind_label(lcont);
        self.builder.emit(Instruction::PopInterrupt);
        self.builder.emit(Instruction::Jump(Target::Label(lhead)));
        self.builder.bind_label(lbrk);
        self.builder.set_stack_depth(base);
        self.builder.emit(Instruction::PopInterrupt);
        self.builder.emit(Instruction::TablerowEnd);
        self.builder.emit(Instruction::PopScope);
        Ok(())
    }

    /// `{% assign x = e | filters %}`.
    fn tag_assign(&mut self, mut tokens: Tokens, segment: &Segment) -> Result<(), TemplateError> {
        let checkpoint = self.builder.checkpoint();
        let result = (|| -> Result<String, TemplateError> {
            let var = tokens.expect_ident("variable name")?;
            tokens.expect(&TokenKind::Assign, "`=`")?;
            self.parse_expression(&mut tokens)?;
            tokens.expect_end()?;
            Ok(var)
        })();
        match result {
            Ok(var) => {
                self.builder.emit(Instruction::Assign(Arc::from(var.as_str())));
                Ok(())
            }
            Err(err) => {
                self.builder.rollback(checkpoint);
                self.recover(err, segment.span, None)
            }
        }
    }

    /// `{% capture x %} … {% endcapture %}`.
    fn tag_capture(&mut self, mut tokens: Tokens, segment: &Segment) -> Result<(), TemplateError> {
        let var = match tokens.expect_ident("variable name").and_then(|var| {
            tokens.expect_end()?;
            Ok(var)
        }) {
            Ok(var) => var,
            Err(err) => return self.recover(err, segment.span, Some("capture")),
        };
        self.builder.emit(Instruction::PushCapture);
        self.parse_block(&["endcapture"])?
            .expect("parse_block errors on missing terminator");
        self.builder.emit(Instruction::PopCapture);
        self.builder.emit(Instruction::Assign(Arc::from(var.as_str())));
        Ok(())
    }

    /// `{% increment x %}` / `{% decrement x %}`; both write the counter.
    fn tag_counter(&mut self, mut tokens: Tokens, segment: &Segment, decrement: bool) -> Result<(), TemplateError> {
        let var = match tokens.expect_ident("counter name").and_then(|var| {
            tokens.expect_end()?;
            Ok(var)
        }) {
            Ok(var) => var,
            Err(err) => return self.recover(err, segment.span, None),
        };
        let name = Arc::from(var.as_str());
        self.builder.emit(if decrement {
            Instruction::Decrement(name)
        } else {
            Instruction::Increment(name)
        });
        self.builder.emit(Instruction::WriteValue);
        Ok(())
    }

    /// `{% cycle ['group':] v1, v2, … %}`; writes the selected value.
    fn tag_cycle(&mut self, mut tokens: Tokens, segment: &Segment) -> Result<(), TemplateError> {
        let checkpoint = self.builder.checkpoint();
        let result = self.parse_cycle(&mut tokens, segment);
        match result {
            Ok(()) => Ok(()),
            Err(err) => {
                self.builder.rollback(checkpoint);
                self.recover(err, segment.span, None)
            }
        }
    }

    fn parse_cycle(&mut self, tokens: &mut Tokens, segment: &Segment) -> Result<(), TemplateError> {
        // A literal group: `cycle 'g': a, b`. A dynamic group is any other
        // expression followed by `:`; its value is pushed below the cycle
        // values.
        let mut static_key: Option<String> = None;
        let mut dynamic_group = false;
        if let TokenKind::Str(group) = &tokens.peek().kind {
            if tokens.peek_at(1).kind == TokenKind::Colon {
                static_key = Some(format!("name:{group}"));
                tokens.next();
                tokens.next();
            }
        } else if matches!(tokens.peek().kind, TokenKind::Ident(_)) && tokens.peek_at(1).kind == TokenKind::Colon {
            self.parse_primary(tokens)?;
            tokens.expect(&TokenKind::Colon, "`:`")?;
            dynamic_group = true;
        }

        let mut argc: u8 = 0;
        loop {
            self.parse_pipeline(tokens)?;
            argc = argc
                .checked_add(1)
                .ok_or_else(|| TemplateError::syntax("too many cycle values", segment.span))?;
            if !tokens.eat(&TokenKind::Comma) {
                break;
            }
        }
        tokens.expect_end()?;

        if dynamic_group {
            self.builder.emit(Instruction::CycleStepVar { argc });
        } else {
            let key = static_key.unwrap_or_else(|| format!("pos:{}", segment.span.offset));
            self.builder.emit(Instruction::CycleStep {
                key: Arc::from(key.as_str()),
                argc,
            });
        }
        self.builder.emit(Instruction::WriteValue);
        Ok(())
    }

    /// `{% ifchanged %} … {% endifchanged %}`: the body renders only when it
    /// differs from this site's previous rendering.
    fn tag_ifchanged(&mut self, segment: &Segment) -> Result<(), TemplateError> {
        self.builder.emit(Instruction::PushCapture);
        self.parse_block(&["endifchanged"])?
            .expect("parse_block errors on missing terminator");
        self.builder.emit(Instruction::PopCapture);
        self.builder.emit(Instruction::IfchangedCheck(segment.span.offset));
        Ok(())
    }

    /// `{% echo e %}`: identical lowering to `{{ e }}`.
    fn tag_echo(&mut self, mut tokens: Tokens, segment: &Segment) -> Result<(), TemplateError> {
        let checkpoint = self.builder.checkpoint();
        let result = (|| {
            self.parse_expression(&mut tokens)?;
            tokens.expect_end()
        })();
        match result {
            Ok(()) => {
                self.builder.emit(Instruction::WriteValue);
                Ok(())
            }
            Err(err) => {
                self.builder.rollback(checkpoint);
                self.recover(err, segment.span, None)
            }
        }
    }

    /// `{% break %}` / `{% continue %}`.
    fn tag_interrupt(&mut self, mut tokens: Tokens, segment: &Segment, kind: InterruptKind) -> Result<(), TemplateError> {
        if let Err(err) = tokens.expect_end() {
            return self.recover(err, segment.span, None);
        }
        self.builder.emit(Instruction::PushInterrupt(kind));
        Ok(())
    }

    /// `{% render 'name' with e as x, k: v %}` and the `include` variant.
    ///
    /// Argument expressions are spliced inline: the call instruction pops the
    /// keyword hash, the binding value, and (for dynamic names) the name.
    fn tag_partial(&mut self, mut tokens: Tokens, segment: &Segment, isolated: bool) -> Result<(), TemplateError> {
        let checkpoint = self.builder.checkpoint();
        let result = self.parse_partial(&mut tokens, isolated);
        match result {
            Ok(()) => Ok(()),
            Err(err) => {
                self.builder.rollback(checkpoint);
                self.recover(err, segment.span, None)
            }
        }
    }

    fn parse_partial(&mut self, tokens: &mut Tokens, isolated: bool) -> Result<(), TemplateError> {
        let name: Option<Arc<str>> = if let TokenKind::Str(name) = &tokens.peek().kind {
            let name = Arc::from(name.as_str());
            tokens.next();
            Some(name)
        } else {
            self.parse_primary(tokens)?;
            None
        };

        let binding = if tokens.eat(&TokenKind::Keyword(Keyword::With)) {
            self.parse_expression(tokens)?;
            PartialBinding::With(self.partial_alias(tokens)?)
        } else if tokens.eat(&TokenKind::Keyword(Keyword::For)) {
            self.parse_expression(tokens)?;
            PartialBinding::For(self.partial_alias(tokens)?)
        } else {
            self.builder.emit(Instruction::ConstNil);
            PartialBinding::None
        };

        let mut kwargs: u16 = 0;
        loop {
            tokens.eat(&TokenKind::Comma);
            if tokens.at_end() {
                break;
            }
            let key_token = tokens.next();
            let TokenKind::Ident(key) = key_token.kind else {
                return Err(unexpected("argument name", &key_token.kind, key_token.span));
            };
            tokens.expect(&TokenKind::Colon, "`:`")?;
            self.builder.emit(Instruction::ConstString(Arc::from(key.as_str())));
            self.parse_expression(tokens)?;
            kwargs += 1;
        }
        self.builder.emit(Instruction::BuildHash(kwargs));

        let call = Arc::new(PartialCall { name, binding });
        self.builder.emit(if isolated {
            Instruction::RenderPartial(call)
        } else {
            Instruction::IncludePartial(call)
        });
        Ok(())
    }

    fn partial_alias(&mut self, tokens: &mut Tokens) -> Result<Option<Arc<str>>, TemplateError> {
        if tokens.eat(&TokenKind::Keyword(Keyword::As)) {
            Ok(Some(Arc::from(tokens.expect_ident("alias name")?.as_str())))
        } else {
            Ok(None)
        }
    }

    /// `{% liquid … %}`: one tag per line. Block tags are not supported
    /// inside the shorthand; each line must be a self-contained tag.
    fn tag_liquid(&mut self, segment: &Segment) -> Result<(), TemplateError> {
        let full: &str = &self.src[segment.markup.clone()];
        // The markup still starts with the `liquid` keyword itself; the tag
        // stream begins right after it (same line or the next).
        let skip = full.find("liquid").map_or(0, |at| at + "liquid".len());
        let markup_start = segment.markup.start + skip;
        let markup: String = full[skip..].to_owned();
        let mut line_no = segment.markup_line;
        let mut offset = 0usize;
        for line in markup.split('\n') {
            let trimmed = line.trim();
            let line_start = markup_start + offset + (line.len() - line.trim_start().len());
            offset += line.len() + 1;
            let this_line = line_no;
            line_no += 1;
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let sub = Segment {
                kind: SegmentKind::Tag,
                text: String::new(),
                markup: line_start..line_start + trimmed.len(),
                span: Span::new(line_start, trimmed.len(), this_line),
                markup_line: this_line,
                trim: (false, false),
            };
            let mut tokens = Tokens::new(self.src, &sub)?;
            let name_token = tokens.next();
            let name = match name_token.kind {
                TokenKind::Ident(name) => name,
                other => return Err(unexpected("tag name", &other, name_token.span)),
            };
            match name.as_str() {
                "assign" => self.tag_assign(tokens, &sub)?,
                "echo" => self.tag_echo(tokens, &sub)?,
                "increment" => self.tag_counter(tokens, &sub, false)?,
                "decrement" => self.tag_counter(tokens, &sub, true)?,
                "cycle" => self.tag_cycle(tokens, &sub)?,
                "break" => self.tag_interrupt(tokens, &sub, InterruptKind::Break)?,
                "continue" => self.tag_interrupt(tokens, &sub, InterruptKind::Continue)?,
                "render" => self.tag_partial(tokens, &sub, true)?,
                "include" => self.tag_partial(tokens, &sub, false)?,
                other => {
                    return Err(TemplateError::syntax(
                        format!("tag `{other}` is not supported inside `liquid`"),
                        sub.span,
                    ));
                }
            }
        }
        Ok(())
    }

    /// Parses `var in collection` plus loop modifiers, emitting modifier
    /// expressions *before* the collection (see [`tag_for`](Self::tag_for)).
    fn parse_loop_head(&mut self, tokens: &mut Tokens, tablerow: bool) -> Result<LoopHead, TemplateError> {
        let var = tokens.expect_ident("loop variable")?;
        tokens.expect(&TokenKind::Keyword(Keyword::In), "`in`")?;

        let reorder_start = self.builder.len();
        let collection_span_start = tokens.peek().span;
        self.parse_primary(tokens)?;
        let collection_range = reorder_start..self.builder.len();
        let collection_markup = self
            .source_slice(collection_span_start.merge(tokens.prev_span()))
            .trim()
            .to_owned();

        let mut head = LoopHead {
            var: Arc::from(var.as_str()),
            loop_name: Arc::from(format!("{var}-{collection_markup}").as_str()),
            has_limit: false,
            has_offset: false,
            has_cols: false,
            offset_continue: false,
            reversed: false,
        };

        let mut limit_range = None;
        let mut offset_range = None;
        let mut cols_range = None;
        loop {
            tokens.eat(&TokenKind::Comma);
            let token = tokens.peek().clone();
            match &token.kind {
                TokenKind::Keyword(Keyword::Reversed) if !tablerow => {
                    tokens.next();
                    head.reversed = true;
                }
                TokenKind::Keyword(Keyword::Limit) => {
                    tokens.next();
                    tokens.expect(&TokenKind::Colon, "`:`")?;
                    let start = self.builder.len();
                    self.parse_primary(tokens)?;
                    limit_range = Some(start..self.builder.len());
                    head.has_limit = true;
                }
                TokenKind::Keyword(Keyword::Offset) => {
                    tokens.next();
                    tokens.expect(&TokenKind::Colon, "`:`")?;
                    if matches!(&tokens.peek().kind, TokenKind::Ident(word) if word == "continue") {
                        tokens.next();
                        head.offset_continue = true;
                        head.has_offset = false;
                    } else {
                        let start = self.builder.len();
                        self.parse_primary(tokens)?;
                        offset_range = Some(start..self.builder.len());
                        head.has_offset = true;
                    }
                }
                TokenKind::Ident(word) if tablerow && word == "cols" => {
                    tokens.next();
                    tokens.expect(&TokenKind::Colon, "`:`")?;
                    let start = self.builder.len();
                    self.parse_primary(tokens)?;
                    cols_range = Some(start..self.builder.len());
                    head.has_cols = true;
                }
                TokenKind::End => break,
                other => return Err(unexpected("loop modifier", other, token.span)),
            }
        }

        // The VM pops collection, then limit, offset and cols; put the
        // modifier values underneath the collection in that pop order.
        let mut order: Vec<std::ops::Range<usize>> = Vec::new();
        if let Some(range) = offset_range {
            order.push(range);
        }
        if let Some(range) = cols_range {
            order.push(range);
        }
        if let Some(range) = limit_range {
            order.push(range);
        }
        order.push(collection_range);
        self.builder.reorder(reorder_start, &order);
        Ok(head)
    }
}

/// Parsed `for`/`tablerow` head.
struct LoopHead {
    var: Arc<str>,
    loop_name: Arc<str>,
    has_limit: bool,
    has_offset: bool,
    has_cols: bool,
    offset_continue: bool,
    reversed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorMode;
    use crate::parser::parse_template;

    fn parse_ok(src: &str) -> Vec<Instruction> {
        parse_template(src, None, ErrorMode::Strict).unwrap().0
    }

    #[test]
    fn test_if_else_lowering_shape() {
        let code = parse_ok("{% if c %}A{% else %}B{% endif %}");
        assert!(code.contains(&Instruction::IsTruthy));
        let false_jumps = code.iter().filter(|i| matches!(i, Instruction::JumpIfFalse(_))).count();
        assert_eq!(false_jumps, 1);
        let raw: Vec<_> = code
            .iter()
            .filter_map(|i| match i {
                Instruction::WriteRaw(s) => Some(s.as_ref()),
                _ => None,
            })
            .collect();
        assert_eq!(raw, vec!["A", "B"]);
    }

    #[test]
    fn test_for_lowering_protocol() {
        let code = parse_ok("{% for x in (1..3) %}{{ x }}{% endfor %}");
        let names: Vec<_> = code.iter().map(Instruction::opcode_name).collect();
        for expected in [
            "JumpIfEmpty",
            "ForInit",
            "PushScope",
            "PushForloop",
            "ForNext",
            "AssignLocal",
            "JumpIfInterrupt",
            "PopInterrupt",
            "ForEnd",
            "PopForloop",
            "PopScope",
        ] {
            assert!(names.contains(&expected), "missing {expected} in {names:?}");
        }
    }

    #[test]
    fn test_for_modifiers_are_reordered_before_collection() {
        let code = parse_ok("{% for x in xs limit: 2 offset: 1 %}{% endfor %}");
        let find = |target: &Instruction| code.iter().position(|i| i == target).unwrap();
        let offset_at = find(&Instruction::ConstInt(1));
        let limit_at = find(&Instruction::ConstInt(2));
        let collection_at = find(&Instruction::FindVar(Arc::from("xs")));
        assert!(offset_at < limit_at && limit_at < collection_at);
    }

    #[test]
    fn test_offset_continue_sets_flag() {
        let code = parse_ok("{% for x in xs offset: continue %}{% endfor %}");
        let init = code
            .iter()
            .find_map(|i| match i {
                Instruction::ForInit(args) => Some(args.clone()),
                _ => None,
            })
            .unwrap();
        assert!(init.offset_continue);
        assert!(!init.has_offset);
        assert_eq!(init.loop_name.as_ref(), "x-xs");
    }

    #[test]
    fn test_capture_lowering() {
        let code = parse_ok("{% capture v %}x{% endcapture %}");
        let names: Vec<_> = code.iter().map(Instruction::opcode_name).collect();
        assert_eq!(names, vec!["PushCapture", "WriteRaw", "PopCapture", "Assign", "Halt"]);
    }

    #[test]
    fn test_case_balances_stack() {
        // Parsing asserts stack depth consistency internally (debug builds);
        // reaching Halt means every path popped the case value exactly once.
        let code = parse_ok("{% case x %}{% when 1, 2 %}a{% when 3 %}b{% else %}c{% endcase %}");
        assert!(code.contains(&Instruction::CaseCompare));
        assert_eq!(*code.last().unwrap(), Instruction::Halt);
    }

    #[test]
    fn test_cycle_without_group_keys_by_position() {
        let code = parse_ok("{% cycle 'a', 'b' %}");
        let Instruction::CycleStep { key, argc } = &code[2] else {
            panic!("expected CycleStep, got {:?}", code[2]);
        };
        assert!(key.starts_with("pos:"));
        assert_eq!(*argc, 2);
    }

    #[test]
    fn test_cycle_with_group() {
        let code = parse_ok("{% cycle 'g': 'a', 'b' %}");
        assert!(matches!(&code[2], Instruction::CycleStep { key, .. } if key.as_ref() == "name:g"));
    }

    #[test]
    fn test_render_with_kwargs() {
        let code = parse_ok("{% render 'card', title: t %}");
        let names: Vec<_> = code.iter().map(Instruction::opcode_name).collect();
        assert_eq!(
            names,
            vec!["ConstNil", "ConstString", "FindVar", "BuildHash", "RenderPartial", "Halt"]
        );
    }

    #[test]
    fn test_include_keeps_caller_scope_opcode() {
        let code = parse_ok("{% include 'snippet' %}");
        assert!(code.iter().any(|i| matches!(i, Instruction::IncludePartial(_))));
    }

    #[test]
    fn test_comment_block_elided() {
        let code = parse_ok("a{% comment %}{% if %}{% comment %}{% endcomment %}{% endcomment %}b");
        assert_eq!(
            code,
            vec![
                Instruction::WriteRaw(Arc::from("a")),
                Instruction::WriteRaw(Arc::from("b")),
                Instruction::Halt,
            ]
        );
    }

    #[test]
    fn test_liquid_tag_lines() {
        let code = parse_ok("{% liquid\nassign x = 1\necho x\n%}");
        assert!(code.contains(&Instruction::Assign(Arc::from("x"))));
        assert!(code.contains(&Instruction::WriteValue));
    }

    #[test]
    fn test_tablerow_lowering() {
        let code = parse_ok("{% tablerow x in xs cols: 2 %}{{ x }}{% endtablerow %}");
        let names: Vec<_> = code.iter().map(Instruction::opcode_name).collect();
        assert!(names.contains(&"TablerowInit"));
        assert!(names.contains(&"TablerowNext"));
        assert!(names.contains(&"TablerowEnd"));
    }

    #[test]
    fn test_stray_endif_is_an_error() {
        assert!(parse_template("{% endif %}", None, ErrorMode::Strict).is_err());
    }
}
