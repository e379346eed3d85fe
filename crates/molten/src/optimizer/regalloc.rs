//! Pass 20: register allocation for temporary slots.
//!
//! Logical slots handed out by the hoisting/caching passes are renumbered
//! onto the smallest set of physical slots. Liveness is a single backward
//! walk (each logical slot is live on the closed interval from its first
//! definition to its last use); a forward walk then assigns each interval
//! the lowest-indexed free physical slot.
//!
//! Loop awareness: a slot defined before a loop and used inside it stays
//! live until the loop's backward jump, so the value survives every
//! iteration.

use ahash::AHashMap;

use crate::error::{ErrorKind, TemplateError};
use crate::ir::{Instruction, LabelId, Target};
use crate::optimizer::{CodeStream, MAX_TEMP_SLOTS};

/// Live interval of one logical slot, in instruction indices.
#[derive(Debug, Clone, Copy)]
struct Interval {
    def: usize,
    last_use: usize,
}

/// Renumbers temporaries onto physical slots; errors when more than
/// [`MAX_TEMP_SLOTS`] would be needed.
pub(crate) fn allocate(stream: &mut CodeStream) -> Result<(), TemplateError> {
    let mut intervals: AHashMap<u8, Interval> = AHashMap::new();

    // Backward walk: the first time a slot is seen records its last use;
    // definitions keep shrinking toward the front.
    for index in (0..stream.len()).rev() {
        match &stream.code[index] {
            Instruction::StoreTemp(slot) | Instruction::LoadTemp(slot) => {
                let entry = intervals.entry(*slot).or_insert(Interval {
                    def: index,
                    last_use: index,
                });
                entry.def = index;
            }
            _ => {}
        }
    }
    if intervals.is_empty() {
        return Ok(());
    }

    // Extend intervals across loops: a slot defined before a backward jump's
    // target and last used inside the loop region must survive the jump.
    let loops = loop_spans(stream);
    let mut changed = true;
    while changed {
        changed = false;
        for interval in intervals.values_mut() {
            for &(start, end) in &loops {
                if interval.def < start && interval.last_use >= start && interval.last_use < end {
                    interval.last_use = end;
                    changed = true;
                }
            }
        }
    }

    // Forward allocation in definition order.
    let mut ordered: Vec<(u8, Interval)> = intervals.into_iter().collect();
    ordered.sort_by_key(|(_, interval)| interval.def);
    let mut physical_last_use: Vec<usize> = Vec::new();
    let mut mapping: AHashMap<u8, u8> = AHashMap::new();
    for (logical, interval) in ordered {
        let free = physical_last_use.iter().position(|&last| last < interval.def);
        let physical = match free {
            Some(slot) => {
                physical_last_use[slot] = interval.last_use;
                slot
            }
            None => {
                physical_last_use.push(interval.last_use);
                physical_last_use.len() - 1
            }
        };
        if physical >= usize::from(MAX_TEMP_SLOTS) {
            return Err(TemplateError::new(
                ErrorKind::Syntax,
                format!("template needs more than {MAX_TEMP_SLOTS} temporary slots"),
            ));
        }
        mapping.insert(logical, u8::try_from(physical).expect("physical slot bounded by MAX_TEMP_SLOTS"));
    }

    for instruction in &mut stream.code {
        match instruction {
            Instruction::StoreTemp(slot) | Instruction::LoadTemp(slot) => {
                *slot = mapping[slot];
            }
            _ => {}
        }
    }
    Ok(())
}

/// `(target, jump)` index pairs for every backward jump; these delimit loop
/// bodies (including `ForNext`-driven loops, whose back edge is the
/// unconditional jump to the loop head).
fn loop_spans(stream: &CodeStream) -> Vec<(usize, usize)> {
    let label_positions: AHashMap<LabelId, usize> = stream
        .code
        .iter()
        .enumerate()
        .filter_map(|(index, instruction)| match instruction {
            Instruction::Label(label) => Some((*label, index)),
            _ => None,
        })
        .collect();
    let mut spans = Vec::new();
    for (index, instruction) in stream.code.iter().enumerate() {
        let mut probe = instruction.clone();
        probe.map_targets(|target| {
            if let Target::Label(label) = target
                && let Some(&target_index) = label_positions.get(&label)
                && target_index < index
            {
                spans.push((target_index, index));
            }
            target
        });
    }
    spans
}

/// Number of physical slots a linked or unlinked stream uses.
pub(crate) fn slot_count(code: &[Instruction]) -> u8 {
    code.iter()
        .filter_map(|instruction| match instruction {
            Instruction::StoreTemp(slot) | Instruction::LoadTemp(slot) => Some(*slot),
            _ => None,
        })
        .max()
        .map_or(0, |max| max + 1)
}
