//! Pass 15: constant propagation for `assign` bindings.
//!
//! Deliberately conservative — there is no dataflow lattice here. A name
//! qualifies only when:
//!
//! - it is assigned exactly once in the whole program, from a constant;
//! - it is never bound as a loop variable (`AssignLocal`);
//! - the assignment is not inside any loop and no jump crosses it (so it
//!   executes unconditionally, exactly once, before every replaced use);
//! - no `include`-style partial appears anywhere (an included partial shares
//!   the caller's scope and may rebind anything).
//!
//! Uses after the assignment are then rewritten to the constant, including
//! the variable component of fused `FindVarPath` lookups.

use ahash::{AHashMap, AHashSet};

use crate::ir::{Instruction, LabelId, Target};
use crate::optimizer::CodeStream;
use crate::value::Value;

pub(crate) fn propagate_constants(stream: &mut CodeStream) {
    if stream
        .code
        .iter()
        .any(|i| matches!(i, Instruction::IncludePartial(_) | Instruction::ConstInclude(_)))
    {
        return;
    }

    let label_positions: AHashMap<LabelId, usize> = stream
        .code
        .iter()
        .enumerate()
        .filter_map(|(index, instruction)| match instruction {
            Instruction::Label(label) => Some((*label, index)),
            _ => None,
        })
        .collect();

    // Gather assignment facts.
    let mut assign_counts: AHashMap<&str, usize> = AHashMap::new();
    let mut local_bound: AHashSet<&str> = AHashSet::new();
    let mut loop_depth = 0usize;
    let mut loop_depth_at: Vec<usize> = Vec::with_capacity(stream.len());
    for instruction in &stream.code {
        loop_depth_at.push(loop_depth);
        match instruction {
            Instruction::ForInit(_) | Instruction::TablerowInit(_) => loop_depth += 1,
            Instruction::ForEnd | Instruction::TablerowEnd => loop_depth = loop_depth.saturating_sub(1),
            Instruction::Assign(name) => *assign_counts.entry(name).or_insert(0) += 1,
            Instruction::AssignLocal(name) => {
                local_bound.insert(name);
            }
            _ => {}
        }
    }

    // Candidate sites: Const c; Assign(x) with x assigned once and never
    // loop-bound, at loop depth zero, with no jump crossing the site.
    let mut replacements: Vec<(usize, String, Value)> = Vec::new();
    for i in 1..stream.len() {
        let Instruction::Assign(name) = &stream.code[i] else {
            continue;
        };
        if assign_counts.get(name.as_ref()) != Some(&1) || local_bound.contains(name.as_ref()) {
            continue;
        }
        if loop_depth_at[i] != 0 {
            continue;
        }
        let Some(value) = stream.code[i - 1].as_const() else {
            continue;
        };
        if jump_crosses(stream, &label_positions, i) {
            continue;
        }
        replacements.push((i, name.to_string(), value));
    }

    for (site, name, value) in replacements {
        let Some(constant) = Instruction::for_const(&value) else {
            continue;
        };
        let mut i = site + 1;
        while i < stream.len() {
            match &stream.code[i] {
                Instruction::FindVar(var) if var.as_ref() == name => {
                    stream.splice(i..i + 1, vec![constant.clone()]);
                }
                Instruction::FindVarPath(var, path) if var.as_ref() == name => {
                    let path = path.clone();
                    stream.splice(
                        i..i + 1,
                        vec![constant.clone(), Instruction::LookupConstPath(path)],
                    );
                    i += 1;
                }
                _ => {}
            }
            i += 1;
        }
    }
}

/// Whether any jump spans position `site` (in either direction), meaning the
/// assignment might be skipped or repeated.
fn jump_crosses(stream: &CodeStream, labels: &AHashMap<LabelId, usize>, site: usize) -> bool {
    for (index, instruction) in stream.code.iter().enumerate() {
        let mut crossing = false;
        let mut probe = instruction.clone();
        probe.map_targets(|target| {
            if let Target::Label(label) = target
                && let Some(&target_index) = labels.get(&label)
            {
                let (low, high) = if target_index < index {
                    (target_index, index)
                } else {
                    (index, target_index)
                };
                if low < site && site < high {
                    crossing = true;
                }
            }
            target
        });
        if crossing {
            return true;
        }
    }
    false
}
