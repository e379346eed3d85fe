//! Partial template loading.
//!
//! The engine never touches the filesystem itself; `render` and `include`
//! resolve partial names through a [`PartialSource`] capability supplied by
//! the embedding application. Loaded sources are parsed once per render and
//! cached by name.

use std::borrow::Cow;
use std::fmt;

use ahash::AHashMap;

/// Capability for resolving partial names to template source text.
///
/// A single operation: return the source of the named partial, or `None` when
/// it does not exist (which renders as an inline `missing partial` error).
/// Implementations must be cheap to call repeatedly; the engine caches the
/// *compiled* form, not the source.
pub trait PartialSource: fmt::Debug {
    /// Returns the source text of the named partial, if it exists.
    fn read(&self, name: &str) -> Option<Cow<'_, str>>;
}

/// A partial source that never resolves anything.
///
/// The default for renders that use no partials.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPartials;

impl PartialSource for NoPartials {
    fn read(&self, _name: &str) -> Option<Cow<'_, str>> {
        None
    }
}

/// An in-memory name → source mapping.
///
/// The common choice for tests and for applications that manage template
/// storage themselves.
#[derive(Debug, Clone, Default)]
pub struct InMemorySource {
    sources: AHashMap<String, String>,
}

impl InMemorySource {
    /// Creates an empty source map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a partial.
    pub fn insert(&mut self, name: impl Into<String>, source: impl Into<String>) {
        self.sources.insert(name.into(), source.into());
    }

    /// Builder-style insertion.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, source: impl Into<String>) -> Self {
        self.insert(name, source);
        self
    }
}

impl PartialSource for InMemorySource {
    fn read(&self, name: &str) -> Option<Cow<'_, str>> {
        self.sources.get(name).map(|s| Cow::Borrowed(s.as_str()))
    }
}

impl<const N: usize> From<[(&str, &str); N]> for InMemorySource {
    fn from(entries: [(&str, &str); N]) -> Self {
        let mut source = Self::new();
        for (name, text) in entries {
            source.insert(name, text);
        }
        source
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_lookup() {
        let source = InMemorySource::from([("greet", "Hi {{ name }}")]);
        assert_eq!(source.read("greet").as_deref(), Some("Hi {{ name }}"));
        assert!(source.read("missing").is_none());
    }
}
