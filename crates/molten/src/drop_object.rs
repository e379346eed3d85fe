//! Host object bridge.
//!
//! A [`DropObject`] is the single polymorphic extension point of the value
//! model: an opaque host object exposing any subset of the capability set
//! `{to_liquid, to_liquid_value, index, iterate}`. Every method defaults to
//! "capability absent", in which case the engine treats the object as opaque
//! and the corresponding operation yields nil or false.

use std::fmt;
use std::sync::Arc;

use crate::value::Value;

/// Capability record for host-provided objects.
///
/// Implementations live on the host side; the engine only ever calls through
/// this trait. All methods are optional:
///
/// - [`to_liquid`](Self::to_liquid) is invoked before the object is written
///   to the output; it usually returns a safe view (a map or string).
/// - [`to_liquid_value`](Self::to_liquid_value) is invoked for truthiness and
///   comparison checks.
/// - [`index`](Self::index) serves key lookups (`obj.key`, `obj[expr]`).
/// - [`iterate`](Self::iterate) serves `for` loops over the object.
pub trait DropObject: fmt::Debug + Send + Sync {
    /// Converts to a renderable value; `None` renders as the empty string.
    fn to_liquid(&self) -> Option<Value> {
        None
    }

    /// Converts to a value for truthiness and comparisons; `None` leaves the
    /// object truthy and incomparable.
    fn to_liquid_value(&self) -> Option<Value> {
        None
    }

    /// Looks up a property; `None` yields nil.
    fn index(&self, key: &Value) -> Option<Value> {
        let _ = key;
        None
    }

    /// Produces the iteration sequence for `for` loops; `None` iterates as
    /// an empty collection.
    fn iterate(&self) -> Option<Vec<Value>> {
        None
    }
}

/// A ready-made drop backed by closures, convenient for embedding hosts that
/// do not want a dedicated type per object.
pub struct FnDrop {
    name: &'static str,
    index_fn: Option<Box<dyn Fn(&Value) -> Option<Value> + Send + Sync>>,
    iterate_fn: Option<Box<dyn Fn() -> Vec<Value> + Send + Sync>>,
}

impl FnDrop {
    /// Creates a drop with no capabilities; attach them with the builder
    /// methods.
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            index_fn: None,
            iterate_fn: None,
        }
    }

    /// Attaches an `index` capability.
    #[must_use]
    pub fn with_index(mut self, f: impl Fn(&Value) -> Option<Value> + Send + Sync + 'static) -> Self {
        self.index_fn = Some(Box::new(f));
        self
    }

    /// Attaches an `iterate` capability.
    #[must_use]
    pub fn with_iterate(mut self, f: impl Fn() -> Vec<Value> + Send + Sync + 'static) -> Self {
        self.iterate_fn = Some(Box::new(f));
        self
    }

    /// Wraps the drop into a [`Value`].
    #[must_use]
    pub fn into_value(self) -> Value {
        Value::Drop(Arc::new(self))
    }
}

impl fmt::Debug for FnDrop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnDrop").field("name", &self.name).finish_non_exhaustive()
    }
}

impl DropObject for FnDrop {
    fn index(&self, key: &Value) -> Option<Value> {
        self.index_fn.as_ref().and_then(|f| f(key))
    }

    fn iterate(&self) -> Option<Vec<Value>> {
        self.iterate_fn.as_ref().map(|f| f())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absent_capabilities_return_none() {
        #[derive(Debug)]
        struct Opaque;
        impl DropObject for Opaque {}

        let drop = Opaque;
        assert!(drop.to_liquid().is_none());
        assert!(drop.index(&Value::from("key")).is_none());
        assert!(drop.iterate().is_none());
    }

    #[test]
    fn test_fn_drop_index() {
        let drop = FnDrop::new("settings").with_index(|key| match key.as_str() {
            Some("color") => Some(Value::from("red")),
            _ => None,
        });
        assert_eq!(drop.index(&Value::from("color")), Some(Value::from("red")));
        assert_eq!(drop.index(&Value::from("size")), None);
    }
}
