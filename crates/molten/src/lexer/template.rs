//! The template shell lexer.
//!
//! Splits a source string into [`Segment`]s: literal raw text, `{% … %}` tags
//! and `{{ … }}` outputs. `{% raw %}` blocks are resolved here so their
//! contents are never tokenized. Whitespace-trim markers are applied as a
//! post-pass over the segment list.

use std::ops::Range;

use crate::lexer::LexError;
use crate::span::Span;

/// What a segment is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SegmentKind {
    /// Literal text copied to the output verbatim.
    Raw,
    /// A `{% … %}` tag; the markup range excludes delimiters and trim
    /// markers.
    Tag,
    /// A `{{ … }}` output expression.
    Output,
}

/// One lexed piece of the template.
#[derive(Debug, Clone)]
pub(crate) struct Segment {
    pub kind: SegmentKind,
    /// For `Raw`: the literal text (after trim application). Empty for tags
    /// and outputs.
    pub text: String,
    /// For `Tag`/`Output`: byte range of the inner markup in the source.
    pub markup: Range<usize>,
    /// Span of the whole construct, delimiters included.
    pub span: Span,
    /// 1-based line the inner markup starts on.
    pub markup_line: u32,
    /// Whitespace-trim markers: trim the end of the preceding raw segment
    /// and the start of the following one.
    pub(crate) trim: (bool, bool),
}

impl Segment {
    fn raw(text: String, span: Span) -> Self {
        Self {
            kind: SegmentKind::Raw,
            text,
            markup: 0..0,
            span,
            markup_line: span.line,
            trim: (false, false),
        }
    }
}

/// Scanner state for the shell pass.
struct TemplateLexer<'s> {
    src: &'s str,
    pos: usize,
    line: u32,
}

/// Tokenizes the whole source into segments with trim markers applied.
pub(crate) fn tokenize(src: &str) -> Result<Vec<Segment>, LexError> {
    let mut lexer = TemplateLexer { src, pos: 0, line: 1 };
    let mut segments = Vec::new();
    lexer.run(&mut segments)?;
    apply_trim(&mut segments);
    Ok(segments)
}

impl TemplateLexer<'_> {
    fn run(&mut self, segments: &mut Vec<Segment>) -> Result<(), LexError> {
        while self.pos < self.src.len() {
            let start = self.pos;
            let start_line = self.line;
            let open = self.find_open(start);
            let raw_end = open.unwrap_or(self.src.len());
            if raw_end > start {
                let text = &self.src[start..raw_end];
                self.advance_lines(text);
                segments.push(Segment::raw(
                    text.to_owned(),
                    Span::new(start, raw_end - start, start_line),
                ));
            }
            let Some(open) = open else {
                break;
            };
            self.pos = open;
            self.lex_construct(segments)?;
        }
        Ok(())
    }

    /// Finds the next `{{` or `{%` at or after `from`.
    fn find_open(&self, from: usize) -> Option<usize> {
        let bytes = self.src.as_bytes();
        let mut i = from;
        while i + 1 < bytes.len() {
            if bytes[i] == b'{' && (bytes[i + 1] == b'{' || bytes[i + 1] == b'%') {
                return Some(i);
            }
            i += 1;
        }
        None
    }

    /// Lexes one `{% … %}` or `{{ … }}` construct starting at `self.pos`.
    fn lex_construct(&mut self, segments: &mut Vec<Segment>) -> Result<(), LexError> {
        let bytes = self.src.as_bytes();
        let start = self.pos;
        let start_line = self.line;
        let is_tag = bytes[start + 1] == b'%';
        let close: &str = if is_tag { "%}" } else { "}}" };

        let mut inner_start = start + 2;
        let trim_left = bytes.get(inner_start) == Some(&b'-');
        if trim_left {
            inner_start += 1;
        }

        let Some(rel_close) = find_close(&self.src[inner_start..], close) else {
            let kind = if is_tag { "tag" } else { "output" };
            return Err(LexError::new(
                format!("unterminated {kind}: missing `{close}`"),
                Span::new(start, 2, start_line),
            ));
        };
        let close_at = inner_start + rel_close;
        let mut inner_end = close_at;
        let trim_right = inner_end > inner_start && bytes[inner_end - 1] == b'-';
        if trim_right {
            inner_end -= 1;
        }
        let construct_end = close_at + 2;

        let markup = &self.src[inner_start..inner_end];
        self.advance_lines(&self.src[start..construct_end]);
        self.pos = construct_end;
        let span = Span::new(start, construct_end - start, start_line);

        // `{% raw %}` swallows everything up to the matching endraw without
        // tokenizing it.
        if is_tag && markup.trim() == "raw" {
            let block = self.scan_endraw(span)?;
            let mut content = block.content;
            if trim_right {
                let kept = content.trim_start().len();
                content.drain(..content.len() - kept);
            }
            if block.end_trim_left {
                content.truncate(content.trim_end().len());
            }
            let mut segment = Segment::raw(content, span.merge(block.end_span));
            segment.trim = (trim_left, block.end_trim_right);
            segments.push(segment);
            return Ok(());
        }

        segments.push(Segment {
            kind: if is_tag { SegmentKind::Tag } else { SegmentKind::Output },
            text: String::new(),
            markup: inner_start..inner_end,
            span,
            markup_line: start_line,
            trim: (trim_left, trim_right),
        });
        Ok(())
    }

    /// Scans for `{% endraw %}`, returning the literal content before it.
    fn scan_endraw(&mut self, open_span: Span) -> Result<RawBlock, LexError> {
        let content_start = self.pos;
        let mut search = self.pos;
        loop {
            let Some(open) = self.find_open(search) else {
                return Err(LexError::new("tag `raw` was never closed", open_span));
            };
            let after = &self.src[open..];
            if after.starts_with("{%")
                && let Some(rel_close) = find_close(&after[2..], "%}")
            {
                let mut inner = &after[2..2 + rel_close];
                let end_trim_left = inner.starts_with('-');
                let end_trim_right = inner.ends_with('-');
                inner = inner.trim_matches('-');
                if inner.trim() == "endraw" {
                    let content = self.src[content_start..open].to_owned();
                    let end = open + 2 + rel_close + 2;
                    let end_line = self.line + count_lines(&self.src[content_start..open]);
                    self.advance_lines(&self.src[content_start..end]);
                    self.pos = end;
                    return Ok(RawBlock {
                        content,
                        end_span: Span::new(open, end - open, end_line),
                        end_trim_left,
                        end_trim_right,
                    });
                }
            }
            search = open + 1;
        }
    }

    fn advance_lines(&mut self, text: &str) {
        self.line += count_lines(text);
    }
}

struct RawBlock {
    content: String,
    end_span: Span,
    end_trim_left: bool,
    end_trim_right: bool,
}

fn count_lines(text: &str) -> u32 {
    text.bytes().filter(|&b| b == b'\n').count() as u32
}

/// Finds the closing delimiter, skipping over quoted strings so an embedded
/// `"%}"` literal does not end the tag early.
fn find_close(s: &str, close: &str) -> Option<usize> {
    let bytes = s.as_bytes();
    let first = close.as_bytes()[0];
    let second = close.as_bytes()[1];
    let mut i = 0;
    let mut quote: Option<u8> = None;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(q) => {
                if b == b'\\' {
                    i += 1;
                } else if b == q {
                    quote = None;
                }
            }
            None => {
                if b == b'\'' || b == b'"' {
                    quote = Some(b);
                } else if b == first && bytes.get(i + 1) == Some(&second) {
                    return Some(i);
                }
            }
        }
        i += 1;
    }
    None
}

/// Applies whitespace-trim markers to the raw segments adjacent to each
/// trimmed segment.
fn apply_trim(segments: &mut [Segment]) {
    for i in 0..segments.len() {
        let (left, right) = segments[i].trim;
        if left && i > 0 {
            let prev = &mut segments[i - 1];
            if prev.kind == SegmentKind::Raw {
                prev.text.truncate(prev.text.trim_end().len());
            }
        }
        if right && i + 1 < segments.len() {
            let next = &mut segments[i + 1];
            if next.kind == SegmentKind::Raw {
                let kept = next.text.trim_start().len();
                next.text.drain(..next.text.len() - kept);
            }
        }
    }
}
