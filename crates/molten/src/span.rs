//! Source positions for diagnostics and error attribution.
//!
//! Every template token and every emitted instruction carries a [`Span`]. The
//! compiled artifact stores a span table parallel to the instruction vector so
//! the VM can attribute runtime errors to a source line without retaining the
//! source text itself.

use std::fmt;

/// A contiguous byte range in a template source, with the 1-based line the
/// range starts on.
///
/// Uses `u32` fields to keep the span table compact; a single template source
/// is capped well below 4 GiB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct Span {
    /// Byte offset of the first byte of the range.
    pub offset: u32,
    /// Length of the range in bytes.
    pub len: u32,
    /// 1-based line number of `offset`.
    pub line: u32,
}

impl Span {
    /// Creates a span from raw parts.
    #[must_use]
    pub fn new(offset: usize, len: usize, line: u32) -> Self {
        Self {
            offset: u32::try_from(offset).expect("source offset exceeds u32"),
            len: u32::try_from(len).expect("span length exceeds u32"),
            line,
        }
    }

    /// A zero-width span pointing at the start of the source.
    ///
    /// Used for synthesized instructions that have no direct source form
    /// (e.g. the final `Halt`).
    #[must_use]
    pub fn synthetic() -> Self {
        Self::default()
    }

    /// Returns the smallest span covering both `self` and `other`.
    ///
    /// The line is taken from whichever span starts first.
    #[must_use]
    pub fn merge(self, other: Self) -> Self {
        let (first, _) = if self.offset <= other.offset {
            (self, other)
        } else {
            (other, self)
        };
        let end = (self.offset + self.len).max(other.offset + other.len);
        Self {
            offset: first.offset,
            len: end - first.offset,
            line: first.line,
        }
    }

    /// End offset (exclusive) of the range.
    #[must_use]
    pub fn end(self) -> u32 {
        self.offset + self.len
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}", self.line)
    }
}
