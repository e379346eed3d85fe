//! Error types for compilation and rendering.
//!
//! Three error kinds exist: syntax errors (lexer/parser), runtime errors (VM)
//! and filter errors (filter implementations). How an error propagates depends
//! on the [`ErrorMode`]: in `Lax` mode runtime and filter errors are rendered
//! inline as `Liquid error (<partial> line <N>): <message>` and execution
//! continues; in `Strict` mode they abort the render. Structural syntax errors
//! (an unclosed block, an unterminated tag) fail compilation in either mode;
//! in `Lax` mode a malformed tag or output compiles to an instruction that
//! produces the inline error text at render time instead.

use std::fmt;
use std::sync::Arc;

use strum::{Display, IntoStaticStr};

use crate::resource::ResourceError;
use crate::span::Span;

/// Result alias for VM operations that can raise a runtime error.
pub(crate) type RunResult<T> = Result<T, RunError>;

/// Classification of a template error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoStaticStr)]
pub enum ErrorKind {
    /// Malformed source detected by the lexer or parser.
    Syntax,
    /// Error raised while the VM executes compiled code.
    Runtime,
    /// Error raised from a filter implementation. Always recoverable per
    /// expression in `Lax` mode.
    Filter,
    /// A resource budget (instructions, output size, recursion) was exceeded.
    /// Never recovered inline.
    Resource,
}

/// How runtime and filter errors propagate during rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorMode {
    /// Render errors inline and keep going. Matches hosted Liquid defaults.
    #[default]
    Lax,
    /// Abort the render on the first runtime or filter error.
    Strict,
}

/// A compilation or rendering failure surfaced to the embedding application.
#[derive(Debug, Clone)]
pub struct TemplateError {
    kind: ErrorKind,
    message: String,
    /// Line the error is attributed to, if known.
    line: Option<u32>,
    /// Name of the partial the error occurred in; `None` for the top-level
    /// template.
    partial: Option<Arc<str>>,
}

impl TemplateError {
    pub(crate) fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            line: None,
            partial: None,
        }
    }

    pub(crate) fn syntax(message: impl Into<String>, span: Span) -> Self {
        Self::new(ErrorKind::Syntax, message).with_line(span.line)
    }

    pub(crate) fn with_line(mut self, line: u32) -> Self {
        self.line = Some(line);
        self
    }

    pub(crate) fn with_partial(mut self, partial: Option<Arc<str>>) -> Self {
        self.partial = partial;
        self
    }

    /// The error classification.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The bare message, without location prefix.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// 1-based source line the error is attributed to, if known.
    #[must_use]
    pub fn line(&self) -> Option<u32> {
        self.line
    }

    /// Name of the partial the error occurred in, or `None` for the
    /// top-level template.
    #[must_use]
    pub fn partial(&self) -> Option<&str> {
        self.partial.as_deref()
    }
}

impl fmt::Display for TemplateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.partial, self.line) {
            (Some(p), Some(line)) => write!(f, "{} error ({p} line {line}): {}", self.kind, self.message),
            (None, Some(line)) => write!(f, "{} error (line {line}): {}", self.kind, self.message),
            _ => write!(f, "{} error: {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for TemplateError {}

/// Internal error raised during VM execution.
///
/// `Runtime` and `Filter` are recoverable per enclosing expression in `Lax`
/// mode; `Resource` always aborts the render.
#[derive(Debug, Clone)]
pub(crate) enum RunError {
    Runtime(String),
    Filter(String),
    Resource(ResourceError),
    /// An already-attributed error propagating out of a nested partial
    /// render; outer frames must not re-attribute it.
    Fatal(Box<TemplateError>),
}

impl RunError {
    pub(crate) fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    /// Whether this error may be rendered inline in `Lax` mode.
    pub(crate) fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Resource(_) | Self::Fatal(_))
    }

    pub(crate) fn kind(&self) -> ErrorKind {
        match self {
            Self::Runtime(_) => ErrorKind::Runtime,
            Self::Filter(_) => ErrorKind::Filter,
            Self::Resource(_) => ErrorKind::Resource,
            Self::Fatal(e) => e.kind(),
        }
    }

    pub(crate) fn message(&self) -> String {
        match self {
            Self::Runtime(m) | Self::Filter(m) => m.clone(),
            Self::Resource(e) => e.to_string(),
            Self::Fatal(e) => e.message().to_owned(),
        }
    }

    /// Formats the inline error text written to the output in `Lax` mode.
    ///
    /// The format is `Liquid error (<partial> line <N>): <message>`, with the
    /// partial segment omitted for the top-level template.
    pub(crate) fn inline_text(&self, partial: Option<&str>, line: u32) -> String {
        match partial {
            Some(p) => format!("Liquid error ({p} line {line}): {}", self.message()),
            None => format!("Liquid error (line {line}): {}", self.message()),
        }
    }

    /// Converts into the public error type with location attribution.
    ///
    /// A `Fatal` error keeps the attribution from the frame that raised it.
    pub(crate) fn into_template_error(self, partial: Option<Arc<str>>, line: u32) -> TemplateError {
        if let Self::Fatal(inner) = self {
            return *inner;
        }
        let kind = self.kind();
        TemplateError::new(kind, self.message())
            .with_line(line)
            .with_partial(partial)
    }
}

impl From<ResourceError> for RunError {
    fn from(err: ResourceError) -> Self {
        Self::Resource(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inline_text_with_partial() {
        let err = RunError::Filter("invalid integer".to_owned());
        assert_eq!(err.inline_text(Some("p"), 2), "Liquid error (p line 2): invalid integer");
    }

    #[test]
    fn test_inline_text_top_level() {
        let err = RunError::runtime("missing partial");
        assert_eq!(err.inline_text(None, 7), "Liquid error (line 7): missing partial");
    }

    #[test]
    fn test_resource_errors_not_recoverable() {
        let err = RunError::from(ResourceError::Instructions { limit: 10, count: 11 });
        assert!(!err.is_recoverable());
        let err = RunError::runtime("x");
        assert!(err.is_recoverable());
    }
}
