//! Temporary-slot producing passes: loop-invariant hoisting (17), repeated
//! lookup caching (18) and local value numbering (19).
//!
//! All three rewrite code to seed a `StoreTemp` at the first computation and
//! replace later recomputations with `LoadTemp`. They stop introducing new
//! temporaries at [`MAX_TEMP_SLOTS`] logical slots, which guarantees the
//! register allocator can never need more physical slots than that.

use std::sync::Arc;

use ahash::AHashMap;

use crate::ir::Instruction;
use crate::optimizer::{CodeStream, MAX_TEMP_SLOTS};

/// Hashable identity of a variable lookup (`FindVar` has an empty path).
///
/// `Instruction` itself is not hashable (float operands), so the caching
/// passes key on this instead.
type LookupSig = (Arc<str>, Vec<Arc<str>>);

fn lookup_signature(instruction: &Instruction) -> Option<LookupSig> {
    match instruction {
        Instruction::FindVar(name) => Some((name.clone(), Vec::new())),
        Instruction::FindVarPath(name, path) => Some((name.clone(), path.to_vec())),
        _ => None,
    }
}

/// Pass 17: hoists loop-invariant variable reads in front of their loop.
///
/// A `FindVar`/`FindVarPath` inside a loop body qualifies when its variable
/// is not the loop variable, is not written anywhere inside the loop, and the
/// loop contains no `include`-style partial (which could rebind anything).
/// The read is computed once into a temporary immediately before the loop's
/// init instruction — after the emptiness check, so an empty collection
/// never evaluates it.
pub(crate) fn hoist_loop_invariants(stream: &mut CodeStream) {
    loop {
        let mut rewrote = false;
        for (init, end) in loop_regions(&stream.code) {
            if let Some((positions, instruction)) = hoistable_group(stream, init, end) {
                let slot = stream.next_temp_slot();
                if slot >= MAX_TEMP_SLOTS {
                    return;
                }
                for &position in &positions {
                    stream.splice(position..position + 1, vec![Instruction::LoadTemp(slot)]);
                }
                stream.insert(init, Instruction::StoreTemp(slot));
                stream.insert(init, instruction);
                rewrote = true;
                break;
            }
        }
        if !rewrote {
            return;
        }
    }
}

/// `(init, end)` index pairs of every loop, innermost first.
fn loop_regions(code: &[Instruction]) -> Vec<(usize, usize)> {
    let mut open = Vec::new();
    let mut regions = Vec::new();
    for (index, instruction) in code.iter().enumerate() {
        match instruction {
            Instruction::ForInit(_) | Instruction::TablerowInit(_) => open.push(index),
            Instruction::ForEnd | Instruction::TablerowEnd => {
                if let Some(start) = open.pop() {
                    regions.push((start, index));
                }
            }
            _ => {}
        }
    }
    regions
}

/// Finds one hoistable lookup group inside the loop body, returning its
/// occurrence positions and the lookup instruction.
fn hoistable_group(stream: &CodeStream, init: usize, end: usize) -> Option<(Vec<usize>, Instruction)> {
    let body = &stream.code[init..=end];
    if body
        .iter()
        .any(|i| matches!(i, Instruction::IncludePartial(_) | Instruction::ConstInclude(_)))
    {
        return None;
    }
    let mut written: Vec<&str> = vec!["forloop", "tablerowloop"];
    for instruction in body {
        match instruction {
            Instruction::Assign(name) | Instruction::AssignLocal(name) => written.push(name),
            _ => {}
        }
    }

    let mut groups: AHashMap<LookupSig, Vec<usize>> = AHashMap::new();
    for (offset, instruction) in body.iter().enumerate().skip(1) {
        let Some(signature) = lookup_signature(instruction) else {
            continue;
        };
        if written.contains(&signature.0.as_ref()) {
            continue;
        }
        groups.entry(signature).or_default().push(init + offset);
    }
    groups
        .into_values()
        .min_by_key(|positions| positions[0])
        .map(|positions| {
            let instruction = stream.code[positions[0]].clone();
            (positions, instruction)
        })
}

/// Pass 18: in straight-line code, the second and later identical variable
/// lookups load the temporary seeded at the first.
pub(crate) fn cache_repeated_lookups(stream: &mut CodeStream) {
    loop {
        if !cache_one_repeat(stream) {
            return;
        }
    }
}

fn cache_one_repeat(stream: &mut CodeStream) -> bool {
    let mut first_seen: AHashMap<LookupSig, usize> = AHashMap::new();
    for index in 0..stream.len() {
        let instruction = &stream.code[index];
        if is_block_boundary(instruction) || invalidates_lookups(instruction) {
            first_seen.clear();
            continue;
        }
        let Some(signature) = lookup_signature(instruction) else {
            continue;
        };
        if let Some(&first) = first_seen.get(&signature) {
            // Reuse the slot when the first occurrence was already seeded by
            // an earlier rewrite; otherwise seed it now.
            if let Some(slot) = seeded_slot(stream, first) {
                stream.splice(index..index + 1, vec![Instruction::LoadTemp(slot)]);
                return true;
            }
            let slot = stream.next_temp_slot();
            if slot >= MAX_TEMP_SLOTS {
                return false;
            }
            stream.splice(index..index + 1, vec![Instruction::LoadTemp(slot)]);
            stream.insert(first + 1, Instruction::LoadTemp(slot));
            stream.insert(first + 1, Instruction::StoreTemp(slot));
            return true;
        }
        first_seen.insert(signature, index);
    }
    false
}

/// If the computation ending at `last` is already followed by a seeded
/// `StoreTemp t; LoadTemp t` pair, returns `t`.
fn seeded_slot(stream: &CodeStream, last: usize) -> Option<u8> {
    if let (Some(Instruction::StoreTemp(store)), Some(Instruction::LoadTemp(load))) =
        (stream.code.get(last + 1), stream.code.get(last + 2))
        && store == load
    {
        Some(*store)
    } else {
        None
    }
}

/// Instructions after which straight-line reasoning stops.
fn is_block_boundary(instruction: &Instruction) -> bool {
    matches!(
        instruction,
        Instruction::Label(_)
            | Instruction::Jump(_)
            | Instruction::JumpIfFalse(_)
            | Instruction::JumpIfTrue(_)
            | Instruction::JumpIfEmpty(_)
            | Instruction::JumpIfInterrupt(_)
            | Instruction::ForNext { .. }
            | Instruction::TablerowNext { .. }
            | Instruction::Halt
    )
}

/// Instructions that may change what a variable lookup returns.
fn invalidates_lookups(instruction: &Instruction) -> bool {
    matches!(
        instruction,
        Instruction::Assign(_)
            | Instruction::AssignLocal(_)
            | Instruction::PushScope
            | Instruction::PopScope
            | Instruction::ForInit(_)
            | Instruction::ForEnd
            | Instruction::TablerowInit(_)
            | Instruction::TablerowEnd
            | Instruction::RenderPartial(_)
            | Instruction::IncludePartial(_)
            | Instruction::ConstRender(_)
            | Instruction::ConstInclude(_)
    )
}

/// Pass 19: local value numbering.
///
/// Simulates the value stack symbolically through each basic block; when a
/// pure multi-instruction computation produces a value already computed in
/// the block, the recomputation is replaced by a temporary load.
pub(crate) fn number_local_values(stream: &mut CodeStream) {
    loop {
        if !number_one_value(stream) {
            return;
        }
    }
}

/// One symbolic stack entry: the canonical key of the computation that
/// produced it, plus the contiguous instruction range that computed it.
#[derive(Debug, Clone)]
struct SymValue {
    key: Option<String>,
    start: usize,
    cost: usize,
}

impl SymValue {
    fn unknown(at: usize) -> Self {
        Self {
            key: None,
            start: at,
            cost: 0,
        }
    }
}

fn number_one_value(stream: &mut CodeStream) -> bool {
    let mut stack: Vec<SymValue> = Vec::new();
    let mut seen: AHashMap<String, SymValue> = AHashMap::new();

    for index in 0..stream.len() {
        let instruction = stream.code[index].clone();
        if is_block_boundary(&instruction) {
            seen.clear();
            // Values survive the boundary but their provenance does not.
            let depth_change = instruction.stack_effect();
            adjust_unknown(&mut stack, depth_change, index);
            for value in &mut stack {
                value.key = None;
            }
            continue;
        }
        if invalidates_lookups(&instruction) {
            seen.clear();
            adjust_unknown(&mut stack, instruction.stack_effect(), index);
            continue;
        }

        let arity = pure_arity(&instruction);
        let Some(arity) = arity else {
            adjust_unknown(&mut stack, instruction.stack_effect(), index);
            continue;
        };

        // Pop operands, newest first, then restore oldest-first order.
        let mut operands: Vec<SymValue> = Vec::with_capacity(arity);
        for _ in 0..arity {
            operands.push(stack.pop().unwrap_or_else(|| SymValue::unknown(index)));
        }
        operands.reverse();

        let contiguous = operands.iter().all(|operand| operand.key.is_some())
            && operands
                .first()
                .is_none_or(|first| first.start + operands.iter().map(|o| o.cost).sum::<usize>() == index);
        let value = if contiguous {
            let operand_keys: Vec<&str> = operands.iter().filter_map(|o| o.key.as_deref()).collect();
            let start = operands.first().map_or(index, |first| first.start);
            let cost = operands.iter().map(|o| o.cost).sum::<usize>() + 1;
            SymValue {
                key: Some(format!("{:?}({})", instruction, operand_keys.join(","))),
                start,
                cost,
            }
        } else {
            SymValue::unknown(index)
        };

        if let Some(key) = value.key.clone()
            && value.cost >= 2
        {
            if let Some(previous) = seen.get(&key) {
                let previous = previous.clone();
                let seed_at = previous.start + previous.cost;
                if let Some(slot) = seeded_slot(stream, seed_at - 1) {
                    stream.splice(value.start..value.start + value.cost, vec![Instruction::LoadTemp(slot)]);
                    return true;
                }
                let slot = stream.next_temp_slot();
                if slot >= MAX_TEMP_SLOTS {
                    return false;
                }
                stream.splice(value.start..value.start + value.cost, vec![Instruction::LoadTemp(slot)]);
                stream.insert(seed_at, Instruction::LoadTemp(slot));
                stream.insert(seed_at, Instruction::StoreTemp(slot));
                return true;
            }
            seen.insert(key, value.clone());
        }
        stack.push(value);
    }
    false
}

/// Applies a raw stack effect with unknown values.
fn adjust_unknown(stack: &mut Vec<SymValue>, effect: i16, at: usize) {
    if effect < 0 {
        for _ in 0..(-effect) {
            stack.pop();
        }
    } else {
        for _ in 0..effect {
            stack.push(SymValue::unknown(at));
        }
    }
}

/// Operand count for instructions the simulator can model as pure functions
/// of their stack inputs; `None` for everything else.
fn pure_arity(instruction: &Instruction) -> Option<usize> {
    match instruction {
        Instruction::ConstNil
        | Instruction::ConstTrue
        | Instruction::ConstFalse
        | Instruction::ConstInt(_)
        | Instruction::ConstFloat(_)
        | Instruction::ConstString(_)
        | Instruction::ConstRange(_, _)
        | Instruction::ConstEmpty
        | Instruction::ConstBlank
        | Instruction::FindVar(_)
        | Instruction::FindVarPath(_, _) => Some(0),
        Instruction::LookupConstKey(_)
        | Instruction::LookupConstPath(_)
        | Instruction::LookupCommand(_)
        | Instruction::BoolNot
        | Instruction::IsTruthy
        | Instruction::FindVarDynamic => Some(1),
        Instruction::LookupKey
        | Instruction::Compare(_)
        | Instruction::CaseCompare
        | Instruction::Contains
        | Instruction::NewRange => Some(2),
        Instruction::CallFilter { name, argc } if crate::filters::is_pure(name) => Some(usize::from(*argc) + 1),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::testutil::optimized;

    #[test]
    fn test_loop_invariant_lookup_is_hoisted() {
        let stream = optimized("{% for i in xs %}{{ settings.theme }}{% endfor %}");
        let code = &stream.code;
        let store_at = code.iter().position(|i| matches!(i, Instruction::StoreTemp(_)));
        let init_at = code.iter().position(|i| matches!(i, Instruction::ForInit(_)));
        let (Some(store_at), Some(init_at)) = (store_at, init_at) else {
            panic!("expected hoisted store before ForInit: {code:?}");
        };
        assert!(store_at < init_at);
        assert!(code.iter().any(|i| matches!(i, Instruction::LoadTemp(_))));
        // The hoisted lookup itself sits outside the loop body.
        let lookup_at = code
            .iter()
            .position(|i| matches!(i, Instruction::FindVarPath(name, _) if name.as_ref() == "settings"))
            .unwrap();
        assert!(lookup_at < init_at);
    }

    #[test]
    fn test_loop_variable_reads_not_hoisted() {
        let stream = optimized("{% for i in xs %}{{ i }}{% endfor %}");
        assert!(!stream.code.iter().any(|i| matches!(i, Instruction::StoreTemp(_))));
    }

    #[test]
    fn test_assigned_names_not_hoisted() {
        let stream = optimized("{% for i in xs %}{% assign y = i %}{{ y }}{% endfor %}");
        assert!(!stream.code.iter().any(|i| matches!(i, Instruction::StoreTemp(_))));
    }

    #[test]
    fn test_repeated_lookup_cached_in_straight_line() {
        let stream = optimized("{{ user }}{{ user }}{{ user }}");
        let stores = stream
            .code
            .iter()
            .filter(|i| matches!(i, Instruction::StoreTemp(_)))
            .count();
        let finds = stream
            .code
            .iter()
            .filter(|i| matches!(i, Instruction::FindVar(_)))
            .count();
        assert_eq!(stores, 1, "{:?}", stream.code);
        assert_eq!(finds, 1, "{:?}", stream.code);
    }

    #[test]
    fn test_assignment_invalidates_cache() {
        // The rebinding is not constant, so propagation leaves both reads in
        // place and the cache must not span the assignment.
        let stream = optimized("{{ user }}{% assign user = other %}{{ user }}");
        let finds = stream
            .code
            .iter()
            .filter(|i| matches!(i, Instruction::FindVar(name) if name.as_ref() == "user"))
            .count();
        assert_eq!(finds, 2, "{:?}", stream.code);
    }

    #[test]
    fn test_value_numbering_dedups_compound_lookup() {
        let stream = optimized("{% if a == b %}{% endif %}{% if a == b %}{% endif %}");
        // Both comparisons sit in different blocks (conditional jumps split
        // them), so this must NOT be numbered across the branch.
        assert!(
            stream
                .code
                .iter()
                .filter(|i| matches!(i, Instruction::Compare(_)))
                .count()
                >= 1
        );
    }
}
