//! Builder for emitting IR during parsing.
//!
//! `IrBuilder` appends instructions, allocates fresh label ids, records a
//! span per instruction and tracks the value-stack depth so the parser can
//! enforce depth consistency at every control-flow join.

use crate::ir::{Instruction, LabelId};
use crate::span::Span;

/// Append-only IR builder.
///
/// # Usage
///
/// ```ignore
/// let mut builder = IrBuilder::new();
/// builder.set_span(span);
/// builder.emit(Instruction::FindVar(name));
/// let end = builder.new_label();
/// builder.emit(Instruction::JumpIfFalse(Target::Label(end)));
/// // ... emit more code ...
/// builder.bind_label(end);
/// let (code, spans) = builder.finish();
/// ```
#[derive(Debug, Default)]
pub(crate) struct IrBuilder {
    code: Vec<Instruction>,
    spans: Vec<Span>,
    /// Next unallocated label id.
    next_label: u32,
    /// Span applied to subsequently emitted instructions.
    current_span: Span,
    /// Current value-stack depth on the fall-through path.
    stack_depth: i32,
    /// Deepest stack the emitted code can reach.
    max_stack_depth: i32,
}

impl IrBuilder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Sets the source span recorded for subsequent instructions.
    pub(crate) fn set_span(&mut self, span: Span) {
        self.current_span = span;
    }

    /// The span currently applied to emitted instructions.
    pub(crate) fn span(&self) -> Span {
        self.current_span
    }

    /// Appends an instruction, tracking its stack effect.
    pub(crate) fn emit(&mut self, instruction: Instruction) {
        self.stack_depth += i32::from(instruction.stack_effect());
        debug_assert!(self.stack_depth >= 0, "stack depth went negative at {instruction:?}");
        self.max_stack_depth = self.max_stack_depth.max(self.stack_depth);
        self.code.push(instruction);
        self.spans.push(self.current_span);
    }

    /// Allocates a fresh label id.
    #[must_use]
    pub(crate) fn new_label(&mut self) -> LabelId {
        let id = LabelId(self.next_label);
        self.next_label += 1;
        id
    }

    /// Declares a label at the current position.
    pub(crate) fn bind_label(&mut self, label: LabelId) {
        self.emit(Instruction::Label(label));
    }

    /// Current fall-through stack depth.
    pub(crate) fn stack_depth(&self) -> i32 {
        self.stack_depth
    }

    /// Restores the depth when control reconverges from a branch whose path
    /// left a different fall-through depth (the join invariant: every path
    /// into a label carries the same depth, which the parser asserts by
    /// resetting here).
    pub(crate) fn set_stack_depth(&mut self, depth: i32) {
        self.stack_depth = depth;
        self.max_stack_depth = self.max_stack_depth.max(depth);
    }

    /// Number of instructions emitted so far.
    pub(crate) fn len(&self) -> usize {
        self.code.len()
    }

    /// Snapshot of the emission state, for error recovery.
    pub(crate) fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            len: self.code.len(),
            stack_depth: self.stack_depth,
        }
    }

    /// Discards everything emitted since `checkpoint`.
    ///
    /// Labels allocated in the discarded range stay allocated; unused labels
    /// are legal and the linker accepts them.
    pub(crate) fn rollback(&mut self, checkpoint: Checkpoint) {
        self.code.truncate(checkpoint.len);
        self.spans.truncate(checkpoint.len);
        self.stack_depth = checkpoint.stack_depth;
    }

    /// Rebuilds `code[start..]` by concatenating the given sub-ranges in
    /// order. Used by loop heads to put modifier expressions in front of the
    /// collection expression regardless of their source order.
    ///
    /// The ranges must tile `start..len()` exactly. Safe before linking:
    /// jumps reference label ids, not positions.
    pub(crate) fn reorder(&mut self, start: usize, order: &[std::ops::Range<usize>]) {
        debug_assert_eq!(
            order.iter().map(|range| range.len()).sum::<usize>(),
            self.code.len() - start,
            "reorder ranges must tile the tail"
        );
        let mut code_tail = Vec::with_capacity(self.code.len() - start);
        let mut span_tail = Vec::with_capacity(self.code.len() - start);
        for range in order {
            code_tail.extend_from_slice(&self.code[range.clone()]);
            span_tail.extend_from_slice(&self.spans[range.clone()]);
        }
        self.code.truncate(start);
        self.spans.truncate(start);
        self.code.append(&mut code_tail);
        self.spans.append(&mut span_tail);
    }

    /// Consumes the builder, returning the instruction and span vectors.
    pub(crate) fn finish(self) -> (Vec<Instruction>, Vec<Span>) {
        debug_assert_eq!(self.code.len(), self.spans.len());
        (self.code, self.spans)
    }
}

/// Opaque snapshot returned by [`IrBuilder::checkpoint`].
#[derive(Debug, Clone, Copy)]
pub(crate) struct Checkpoint {
    len: usize,
    stack_depth: i32,
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::ir::Target;

    #[test]
    fn test_depth_tracking() {
        let mut builder = IrBuilder::new();
        builder.emit(Instruction::ConstInt(1));
        builder.emit(Instruction::ConstInt(2));
        assert_eq!(builder.stack_depth(), 2);
        builder.emit(Instruction::Compare(crate::ir::CmpOp::Lt));
        assert_eq!(builder.stack_depth(), 1);
        builder.emit(Instruction::WriteValue);
        assert_eq!(builder.stack_depth(), 0);
    }

    #[test]
    fn test_labels_are_unique() {
        let mut builder = IrBuilder::new();
        let a = builder.new_label();
        let b = builder.new_label();
        assert_ne!(a, b);
    }

    #[test]
    fn test_spans_parallel_code() {
        let mut builder = IrBuilder::new();
        builder.set_span(Span::new(3, 4, 1));
        builder.emit(Instruction::WriteRaw(Arc::from("x")));
        let end = builder.new_label();
        builder.emit(Instruction::Jump(Target::Label(end)));
        builder.bind_label(end);
        let (code, spans) = builder.finish();
        assert_eq!(code.len(), spans.len());
        assert_eq!(spans[0], Span::new(3, 4, 1));
    }
}
