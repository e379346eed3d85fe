//! Variable scopes and per-render mutable state.
//!
//! A [`Scope`] owns everything a render mutates: the frame chain searched by
//! variable lookups, the forloop and capture stacks, pending interrupts, and
//! the counter/cycle/offset registers shared across the render. The `render`
//! partial operation creates an isolated child scope that shares none of this
//! state; the `include` operation borrows the caller's scope directly.

use std::sync::Arc;

use ahash::AHashMap;

use crate::value::{Value, ValueMap};

/// A pending `break` or `continue` signal.
///
/// Stored on a stack in the scope and detected by the enclosing loop's
/// interrupt check; captures absorb orphan interrupts when no loop encloses
/// them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Interrupt {
    Break,
    Continue,
}

/// Per-iteration metadata for an active `for` loop.
///
/// Exposed to templates through the `forloop` variable; the parent loop is
/// reached positionally through the stack rather than an owned pointer.
#[derive(Debug, Clone)]
pub(crate) struct ForloopFrame {
    /// The loop identity, `"<var>-<collection markup>"`.
    pub name: Arc<str>,
    /// Item count after limit/offset were applied.
    pub length: usize,
    /// Current 0-based iteration index.
    pub index0: usize,
}

/// Per-iteration metadata for an active `tablerow` loop.
#[derive(Debug, Clone)]
pub(crate) struct TablerowFrame {
    pub length: usize,
    pub index0: usize,
    /// Configured column count; `length` when no `cols` was given.
    pub cols: usize,
}

impl TablerowFrame {
    /// 0-based column of the current cell.
    pub fn col0(&self) -> usize {
        self.index0 % self.cols
    }

    /// 0-based row of the current cell.
    pub fn row0(&self) -> usize {
        self.index0 / self.cols
    }
}

/// An open `{% capture %}` buffer.
#[derive(Debug, Default)]
pub(crate) struct CaptureFrame {
    pub buffer: String,
    /// Interrupt stack depth at capture entry; orphan interrupts above this
    /// depth are absorbed when the capture closes outside any loop.
    pub interrupt_depth: usize,
}

/// The variable environment and mutable registers of one render.
#[derive(Debug, Default)]
pub(crate) struct Scope {
    /// Frame chain, searched innermost (last) first. `assign` binds in the
    /// root frame, `assign_local` in the innermost.
    frames: Vec<AHashMap<String, Value>>,
    /// Active `for` loops, innermost last.
    pub forloops: Vec<ForloopFrame>,
    /// Active `tablerow` loops, innermost last.
    pub tablerows: Vec<TablerowFrame>,
    /// Pending interrupts, most recent last.
    interrupts: Vec<Interrupt>,
    /// Open capture buffers, innermost last.
    pub captures: Vec<CaptureFrame>,
    /// `increment`/`decrement` counters, shared across the whole render.
    pub counters: AHashMap<String, i64>,
    /// Cycle positions keyed by group identity.
    pub cycles: AHashMap<String, usize>,
    /// `offset: continue` resume positions keyed by loop name.
    pub for_offsets: AHashMap<String, usize>,
    /// Last rendered body per `ifchanged` site.
    pub ifchanged: AHashMap<u32, String>,
    /// Current partial nesting depth; isolated children inherit it.
    pub render_depth: usize,
}

impl Scope {
    /// Creates a root scope over the given globals.
    pub fn new(globals: ValueMap) -> Self {
        let root: AHashMap<String, Value> = globals.into_iter().collect();
        Self {
            frames: vec![root],
            ..Self::default()
        }
    }

    /// Creates the isolated scope used by the `render` partial operation.
    ///
    /// Only the nesting depth carries over; frames, loops, interrupts,
    /// captures, counters and cycles all start fresh.
    pub fn isolated_child(&self) -> Self {
        Self {
            frames: vec![AHashMap::new()],
            render_depth: self.render_depth + 1,
            ..Self::default()
        }
    }

    /// Pushes a fresh innermost frame.
    pub fn push_frame(&mut self) {
        self.frames.push(AHashMap::new());
    }

    /// Pops the innermost frame. The root frame is never popped; the parser
    /// guarantees balanced scope instructions.
    pub fn pop_frame(&mut self) {
        if self.frames.len() > 1 {
            self.frames.pop();
        }
    }

    /// Binds in the root frame (the `assign` tag).
    pub fn assign(&mut self, name: &str, value: Value) {
        self.frames[0].insert(name.to_owned(), value);
    }

    /// Binds in the innermost frame (loop variables).
    pub fn assign_local(&mut self, name: &str, value: Value) {
        let frame = self.frames.last_mut().expect("scope always has a root frame");
        frame.insert(name.to_owned(), value);
    }

    /// Looks up a variable, innermost frame first. The `forloop` and
    /// `tablerowloop` descriptors resolve here when no frame shadows them.
    /// A miss is nil, not an error (strict-variable policy sits in the VM).
    pub fn lookup(&self, name: &str) -> Option<Value> {
        for frame in self.frames.iter().rev() {
            if let Some(value) = frame.get(name) {
                return Some(value.clone());
            }
        }
        match name {
            "forloop" if !self.forloops.is_empty() => Some(self.forloop_value(self.forloops.len() - 1)),
            "tablerowloop" if !self.tablerows.is_empty() => Some(self.tablerow_value()),
            _ => None,
        }
    }

    /// Builds the `forloop` snapshot for the loop at `depth`, with
    /// `parentloop` nested recursively.
    fn forloop_value(&self, depth: usize) -> Value {
        let frame = &self.forloops[depth];
        let index0 = frame.index0 as i64;
        let length = frame.length as i64;
        let mut map = ValueMap::new();
        map.insert("name".to_owned(), Value::Str(frame.name.clone()));
        map.insert("length".to_owned(), Value::Int(length));
        map.insert("index".to_owned(), Value::Int(index0 + 1));
        map.insert("index0".to_owned(), Value::Int(index0));
        map.insert("rindex".to_owned(), Value::Int(length - index0));
        map.insert("rindex0".to_owned(), Value::Int(length - index0 - 1));
        map.insert("first".to_owned(), Value::Bool(index0 == 0));
        map.insert("last".to_owned(), Value::Bool(index0 + 1 == length));
        if depth > 0 {
            map.insert("parentloop".to_owned(), self.forloop_value(depth - 1));
        }
        Value::map(map)
    }

    /// Builds the `tablerowloop` snapshot for the innermost tablerow.
    fn tablerow_value(&self) -> Value {
        let frame = self.tablerows.last().expect("tablerow_value called with active tablerow");
        let index0 = frame.index0 as i64;
        let length = frame.length as i64;
        let col0 = frame.col0() as i64;
        let mut map = ValueMap::new();
        map.insert("length".to_owned(), Value::Int(length));
        map.insert("index".to_owned(), Value::Int(index0 + 1));
        map.insert("index0".to_owned(), Value::Int(index0));
        map.insert("rindex".to_owned(), Value::Int(length - index0));
        map.insert("rindex0".to_owned(), Value::Int(length - index0 - 1));
        map.insert("first".to_owned(), Value::Bool(index0 == 0));
        map.insert("last".to_owned(), Value::Bool(index0 + 1 == length));
        map.insert("col".to_owned(), Value::Int(col0 + 1));
        map.insert("col0".to_owned(), Value::Int(col0));
        map.insert("col_first".to_owned(), Value::Bool(col0 == 0));
        map.insert(
            "col_last".to_owned(),
            Value::Bool(col0 + 1 == frame.cols as i64 || index0 + 1 == length),
        );
        map.insert("row".to_owned(), Value::Int(frame.row0() as i64 + 1));
        Value::map(map)
    }

    /// Raises a pending interrupt.
    pub fn push_interrupt(&mut self, interrupt: Interrupt) {
        self.interrupts.push(interrupt);
    }

    /// The most recent pending interrupt, if any.
    pub fn pending_interrupt(&self) -> Option<Interrupt> {
        self.interrupts.last().copied()
    }

    /// Consumes the most recent pending interrupt, if any.
    pub fn pop_interrupt(&mut self) {
        self.interrupts.pop();
    }

    /// Current interrupt stack depth, recorded by captures at entry.
    pub fn interrupt_depth(&self) -> usize {
        self.interrupts.len()
    }

    /// Drops interrupts raised above `depth`; used by captures closing
    /// outside any loop to absorb orphan break/continue signals.
    pub fn truncate_interrupts(&mut self, depth: usize) {
        self.interrupts.truncate(depth);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope_with(name: &str, value: Value) -> Scope {
        let mut globals = ValueMap::new();
        globals.insert(name.to_owned(), value);
        Scope::new(globals)
    }

    #[test]
    fn test_inner_frame_shadows_outer() {
        let mut scope = scope_with("x", Value::Int(1));
        scope.push_frame();
        scope.assign_local("x", Value::Int(2));
        assert_eq!(scope.lookup("x"), Some(Value::Int(2)));
        scope.pop_frame();
        assert_eq!(scope.lookup("x"), Some(Value::Int(1)));
    }

    #[test]
    fn test_assign_binds_root_through_inner_frames() {
        let mut scope = Scope::new(ValueMap::new());
        scope.push_frame();
        scope.assign("y", Value::Int(9));
        scope.pop_frame();
        assert_eq!(scope.lookup("y"), Some(Value::Int(9)));
    }

    #[test]
    fn test_forloop_snapshot_exposes_parentloop() {
        let mut scope = Scope::new(ValueMap::new());
        scope.forloops.push(ForloopFrame {
            name: Arc::from("i-(1..2)"),
            length: 2,
            index0: 1,
        });
        scope.forloops.push(ForloopFrame {
            name: Arc::from("j-(1..3)"),
            length: 3,
            index0: 0,
        });
        let Some(Value::Map(inner)) = scope.lookup("forloop") else {
            panic!("forloop should resolve to a map");
        };
        assert_eq!(inner.get("index"), Some(&Value::Int(1)));
        assert_eq!(inner.get("rindex"), Some(&Value::Int(3)));
        let Some(Value::Map(parent)) = inner.get("parentloop").cloned() else {
            panic!("parentloop should resolve to a map");
        };
        assert_eq!(parent.get("index"), Some(&Value::Int(2)));
        assert_eq!(parent.get("last"), Some(&Value::Bool(true)));
    }

    #[test]
    fn test_isolated_child_shares_nothing_but_depth() {
        let mut scope = scope_with("x", Value::Int(1));
        scope.counters.insert("c".to_owned(), 3);
        scope.render_depth = 2;
        let child = scope.isolated_child();
        assert_eq!(child.render_depth, 3);
        assert_eq!(child.lookup("x"), None);
        assert!(child.counters.is_empty());
    }

    #[test]
    fn test_interrupt_truncation() {
        let mut scope = Scope::new(ValueMap::new());
        let depth = scope.interrupt_depth();
        scope.push_interrupt(Interrupt::Break);
        scope.truncate_interrupts(depth);
        assert_eq!(scope.pending_interrupt(), None);
    }
}
