//! The multi-pass IR optimizer.
//!
//! A fixed-order pipeline of local rewrites over the linear, pre-link
//! instruction vector. No CFG is built: because jumps can only land on
//! `Label` instructions, any *contiguous* run of non-label instructions is
//! safe to rewrite as a unit, which is what every pass relies on.
//!
//! Pass order (each is a function in this module tree):
//!
//!  1. inline simple partials           ([`inline`])
//!  2. fold constant operations         ([`fold`])
//!  3. fold constant filters            ([`fold`])
//!  4. fold constant writes             ([`fold`])
//!  5. collapse constant lookup paths   ([`peephole`])
//!  6. fuse find-var + path             ([`peephole`])
//!  7. remove redundant truthy checks   ([`peephole`])
//!  8. remove noops                     ([`peephole`])
//!  9. remove jumps to the next label   ([`peephole`])
//! 10. merge raw writes                 ([`peephole`])
//! 11. remove unreachable code          ([`peephole`])
//! 12. re-merge raw writes
//! 13. fold constant captures           ([`fold`])
//! 14. remove empty raw writes          ([`peephole`])
//! 15. propagate constants              ([`propagate`])
//! 16. re-run the constant folds
//! 17. hoist loop invariants            ([`hoist`])
//! 18. cache repeated lookups           ([`hoist`])
//! 19. local value numbering            ([`hoist`])
//! 20. allocate temporary registers     ([`regalloc`])
//!
//! Every pass keeps the span table parallel to the code and preserves the IR
//! invariants: label well-formedness and stack-depth consistency.

mod fold;
mod hoist;
mod inline;
mod peephole;
mod propagate;
pub(crate) mod regalloc;

use crate::error::{ErrorMode, TemplateError};
use crate::ir::Instruction;
use crate::partials::PartialSource;
use crate::span::Span;

/// Hard cap on temporary slots; the passes stop introducing temporaries at
/// this bound and the allocator reports exceeding it as a compile failure.
pub(crate) const MAX_TEMP_SLOTS: u8 = 16;

/// The instruction vector plus its parallel span table.
///
/// All passes mutate through this wrapper so the two vectors can never fall
/// out of step.
#[derive(Debug, Default)]
pub(crate) struct CodeStream {
    pub code: Vec<Instruction>,
    pub spans: Vec<Span>,
}

impl CodeStream {
    pub(crate) fn new(code: Vec<Instruction>, spans: Vec<Span>) -> Self {
        debug_assert_eq!(code.len(), spans.len());
        Self { code, spans }
    }

    pub(crate) fn len(&self) -> usize {
        self.code.len()
    }

    /// Removes the instruction at `index`.
    pub(crate) fn remove(&mut self, index: usize) {
        self.code.remove(index);
        self.spans.remove(index);
    }

    /// Inserts an instruction before `index`, reusing the span at `index`
    /// (or the last span when appending).
    pub(crate) fn insert(&mut self, index: usize, instruction: Instruction) {
        let span = self
            .spans
            .get(index)
            .or_else(|| self.spans.last())
            .copied()
            .unwrap_or_default();
        self.code.insert(index, instruction);
        self.spans.insert(index, span);
    }

    /// Replaces `range` with `replacement`, all carrying the span of the
    /// range's first instruction.
    pub(crate) fn splice(&mut self, range: std::ops::Range<usize>, replacement: Vec<Instruction>) {
        let span = self.spans.get(range.start).copied().unwrap_or_default();
        let spans = vec![span; replacement.len()];
        self.code.splice(range.clone(), replacement);
        self.spans.splice(range, spans);
    }

    /// Replaces `range` with instruction/span pairs (used by partial
    /// inlining, which carries its own span table).
    pub(crate) fn splice_with_spans(
        &mut self,
        range: std::ops::Range<usize>,
        code: Vec<Instruction>,
        spans: Vec<Span>,
    ) {
        debug_assert_eq!(code.len(), spans.len());
        self.code.splice(range.clone(), code);
        self.spans.splice(range, spans);
    }

    /// Largest label id in use, for allocating fresh labels during inlining.
    pub(crate) fn max_label_id(&self) -> u32 {
        self.code
            .iter()
            .filter_map(|instruction| match instruction {
                Instruction::Label(label) => Some(label.0),
                _ => None,
            })
            .max()
            .map_or(0, |max| max + 1)
    }

    /// Smallest unused temporary slot.
    pub(crate) fn next_temp_slot(&self) -> u8 {
        self.code
            .iter()
            .filter_map(|instruction| match instruction {
                Instruction::StoreTemp(slot) | Instruction::LoadTemp(slot) => Some(*slot),
                _ => None,
            })
            .max()
            .map_or(0, |max| max + 1)
    }
}

/// Everything the pipeline needs besides the code itself.
pub(crate) struct OptimizeContext<'a> {
    /// Compile-time partial source, when the embedder provided one; enables
    /// the inlining pass.
    pub partials: Option<&'a dyn PartialSource>,
    pub mode: ErrorMode,
    /// Recursion guard for nested partial inlining.
    pub inline_depth: usize,
}

impl OptimizeContext<'_> {
    /// Context for compiling a partial one level deeper.
    pub(crate) fn deeper(&self) -> OptimizeContext<'_> {
        OptimizeContext {
            partials: self.partials,
            mode: self.mode,
            inline_depth: self.inline_depth + 1,
        }
    }
}

/// Runs the full pass pipeline in order.
pub(crate) fn optimize(stream: &mut CodeStream, ctx: &OptimizeContext<'_>) -> Result<(), TemplateError> {
    inline::inline_partials(stream, ctx);

    fold::fold_constants(stream);
    fold::fold_constant_filters(stream);
    fold::fold_constant_writes(stream);

    peephole::collapse_lookup_paths(stream);
    peephole::fuse_find_var_paths(stream);
    peephole::remove_redundant_truthy(stream);
    peephole::remove_noops(stream);
    peephole::remove_jumps_to_next_label(stream);
    peephole::merge_raw_writes(stream);
    peephole::remove_unreachable(stream);
    peephole::merge_raw_writes(stream);
    // Unreachable-code removal exposes new jump-to-next patterns.
    peephole::remove_jumps_to_next_label(stream);

    fold::fold_constant_captures(stream);
    peephole::remove_empty_raw_writes(stream);

    propagate::propagate_constants(stream);

    // Re-fold: propagation exposes new constant operands.
    fold::fold_constants(stream);
    fold::fold_constant_filters(stream);
    fold::fold_constant_writes(stream);
    peephole::merge_raw_writes(stream);

    hoist::hoist_loop_invariants(stream);
    hoist::cache_repeated_lookups(stream);
    hoist::number_local_values(stream);

    regalloc::allocate(stream)?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::parser::parse_template;

    /// Parses and optimizes without a partial source; returns the stream.
    pub(crate) fn optimized(src: &str) -> CodeStream {
        let (code, spans) = parse_template(src, None, ErrorMode::Lax).unwrap();
        let mut stream = CodeStream::new(code, spans);
        let ctx = OptimizeContext {
            partials: None,
            mode: ErrorMode::Lax,
            inline_depth: 0,
        };
        optimize(&mut stream, &ctx).unwrap();
        stream
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::testutil::optimized;
    use super::*;

    #[test]
    fn test_filter_chain_collapses_to_single_raw_write() {
        // The canonical end-to-end optimizer scenario.
        let stream = optimized("{{ 'hello' | upcase | append: '!' }}");
        assert_eq!(
            stream.code,
            vec![Instruction::WriteRaw(Arc::from("HELLO!")), Instruction::Halt]
        );
    }

    #[test]
    fn test_optimization_is_idempotent() {
        let sources = [
            "{{ 'hello' | upcase | append: '!' }}",
            "{% assign x = 5 %}{{ x }}{{ x }}",
            "{% if true %}A{% else %}B{% endif %}",
            "{% for i in (1..3) %}{{ settings.theme }}{{ i }}{% endfor %}",
            "{% capture c %}hi {% endcapture %}{{ c }}",
        ];
        for src in sources {
            let mut first = optimized(src);
            let before = first.code.clone();
            let ctx = OptimizeContext {
                partials: None,
                mode: ErrorMode::Lax,
                inline_depth: 0,
            };
            optimize(&mut first, &ctx).unwrap();
            assert_eq!(first.code, before, "optimize(optimize(ir)) != optimize(ir) for {src}");
        }
    }

    #[test]
    fn test_constant_if_drops_dead_branch_writes() {
        let stream = optimized("{% if true %}A{% else %}B{% endif %}");
        let raws: Vec<_> = stream
            .code
            .iter()
            .filter_map(|i| match i {
                Instruction::WriteRaw(s) => Some(s.as_ref()),
                _ => None,
            })
            .collect();
        assert_eq!(raws, vec!["A"], "else branch should be unreachable: {:?}", stream.code);
    }
}
