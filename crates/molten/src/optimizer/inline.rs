//! Pass 1: partial inlining.
//!
//! When the embedder supplies a partial source at compile time, a call with
//! a literal name can be resolved early, two ways:
//!
//! - **Splice.** Small bodies whose instructions cannot raise (so error
//!   attribution never matters) are parsed and spliced in place of the call,
//!   with labels renumbered. `include` bodies share the caller's scope, so
//!   splicing is semantically exact; `render` bodies must not touch
//!   variables at all (isolation would be violated) and are wrapped in a
//!   scope push/pop.
//! - **Pre-compile.** Anything else becomes `ConstRender`/`ConstInclude`
//!   carrying a fully compiled template, skipping the loader and parser at
//!   render time while keeping the partial's own span table for error
//!   attribution.
//!
//! Bodies are spliced *unoptimized*: every later pass then optimizes the
//! spliced code together with its surroundings.

use std::sync::Arc;

use crate::ir::{CompiledTemplate, InlinePartial, Instruction, LabelId, PartialBinding, Target};
use crate::optimizer::{CodeStream, OptimizeContext, optimize, regalloc};
use crate::parser::parse_template;

/// Nested-inline recursion guard.
const MAX_INLINE_DEPTH: usize = 2;

/// Largest body (in instructions) eligible for splicing.
const MAX_SPLICE_LEN: usize = 32;

pub(crate) fn inline_partials(stream: &mut CodeStream, ctx: &OptimizeContext<'_>) {
    let Some(partials) = ctx.partials else {
        return;
    };
    if ctx.inline_depth >= MAX_INLINE_DEPTH {
        return;
    }
    let mut i = 0;
    while i < stream.len() {
        let (call, isolated) = match &stream.code[i] {
            Instruction::RenderPartial(call) => (call.clone(), true),
            Instruction::IncludePartial(call) => (call.clone(), false),
            _ => {
                i += 1;
                continue;
            }
        };
        let Some(name) = call.name.clone() else {
            i += 1;
            continue;
        };
        let Some(source) = partials.read(&name) else {
            i += 1;
            continue;
        };

        // Splice candidates: `{% include 'p' %}` / `{% render 'p' %}` with
        // no binding and no arguments, small raise-free bodies only.
        let plain = call.binding == PartialBinding::None
            && i >= 2
            && stream.code[i - 2] == Instruction::ConstNil
            && stream.code[i - 1] == Instruction::BuildHash(0);
        if plain
            && let Ok((mut body, _)) = parse_template(&source, Some(name.clone()), ctx.mode)
        {
            strip_halt(&mut body);
            if body.len() <= MAX_SPLICE_LEN && spliceable(&body, isolated) {
                remap_labels(&mut body, stream.max_label_id());
                let mut spliced = Vec::with_capacity(body.len() + 2);
                if isolated {
                    spliced.push(Instruction::PushScope);
                }
                spliced.extend(body);
                if isolated {
                    spliced.push(Instruction::PopScope);
                }
                let call_span = stream.spans[i];
                let spans = vec![call_span; spliced.len()];
                stream.splice_with_spans(i - 2..i + 1, spliced, spans);
                // Re-examine from the splice start for nested rewrites.
                i = i.saturating_sub(2);
                continue;
            }
        }

        // Fall back to pre-compiling the body behind the call.
        if let Some(template) = compile_partial(&source, &name, ctx) {
            let inline = Arc::new(InlinePartial {
                name,
                template,
                binding: call.binding.clone(),
            });
            stream.code[i] = if isolated {
                Instruction::ConstRender(inline)
            } else {
                Instruction::ConstInclude(inline)
            };
        }
        i += 1;
    }
}

/// Compiles a partial body to a linked template, one inline level deeper.
fn compile_partial(source: &str, name: &str, ctx: &OptimizeContext<'_>) -> Option<Arc<CompiledTemplate>> {
    let name: Arc<str> = Arc::from(name);
    let (code, spans) = parse_template(source, Some(name.clone()), ctx.mode).ok()?;
    let mut stream = CodeStream::new(code, spans);
    optimize(&mut stream, &ctx.deeper()).ok()?;
    crate::ir::linker::link(&mut stream.code).ok()?;
    let temp_slots = regalloc::slot_count(&stream.code);
    Some(Arc::new(CompiledTemplate {
        name: Some(name),
        code: stream.code,
        spans: stream.spans,
        temp_slots,
    }))
}

/// Removes the trailing `Halt` a parsed template always ends with.
fn strip_halt(body: &mut Vec<Instruction>) {
    if body.last() == Some(&Instruction::Halt) {
        body.pop();
    }
}

/// Whether every instruction in `body` may be executed inline at the call
/// site without changing semantics or error attribution.
fn spliceable(body: &[Instruction], isolated: bool) -> bool {
    body.iter().all(|instruction| {
        let harmless_output = matches!(
            instruction,
            Instruction::WriteRaw(_)
                | Instruction::WriteValue
                | Instruction::ConstNil
                | Instruction::ConstTrue
                | Instruction::ConstFalse
                | Instruction::ConstInt(_)
                | Instruction::ConstFloat(_)
                | Instruction::ConstString(_)
                | Instruction::ConstRange(_, _)
                | Instruction::ConstEmpty
                | Instruction::ConstBlank
                | Instruction::Dup
                | Instruction::Pop
        );
        if isolated {
            // A render body reading or writing any variable would observe
            // the caller's scope once spliced; only pure output qualifies.
            return harmless_output;
        }
        harmless_output
            || matches!(
                instruction,
                Instruction::FindVar(_)
                    | Instruction::FindVarPath(_, _)
                    | Instruction::FindVarDynamic
                    | Instruction::LookupKey
                    | Instruction::LookupConstKey(_)
                    | Instruction::LookupConstPath(_)
                    | Instruction::LookupCommand(_)
                    | Instruction::Compare(crate::ir::CmpOp::Eq | crate::ir::CmpOp::Ne)
                    | Instruction::CaseCompare
                    | Instruction::Contains
                    | Instruction::BoolNot
                    | Instruction::IsTruthy
                    | Instruction::Jump(_)
                    | Instruction::JumpIfFalse(_)
                    | Instruction::JumpIfTrue(_)
                    | Instruction::Label(_)
                    | Instruction::Assign(_)
                    | Instruction::AssignLocal(_)
                    | Instruction::PushScope
                    | Instruction::PopScope
                    | Instruction::PushCapture
                    | Instruction::PopCapture
                    | Instruction::Increment(_)
                    | Instruction::Decrement(_)
            )
    })
}

/// Shifts every label id in `body` by `offset` so spliced labels cannot
/// collide with the caller's.
fn remap_labels(body: &mut [Instruction], offset: u32) {
    for instruction in body.iter_mut() {
        if let Instruction::Label(label) = instruction {
            *label = LabelId(label.0 + offset);
        }
        instruction.map_targets(|target| match target {
            Target::Label(label) => Target::Label(LabelId(label.0 + offset)),
            resolved @ Target::Index(_) => resolved,
        });
    }
}
