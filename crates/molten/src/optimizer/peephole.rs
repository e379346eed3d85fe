//! Structural peephole passes: lookup fusion, noop/jump cleanup, raw-write
//! merging and unreachable-code removal.

use std::sync::Arc;

use ahash::AHashSet;

use crate::ir::{Instruction, LabelId, Target};
use crate::optimizer::CodeStream;

/// Pass 5: collapses adjacent constant-key lookups into one path lookup.
pub(crate) fn collapse_lookup_paths(stream: &mut CodeStream) {
    let mut i = 0;
    while i + 1 < stream.len() {
        let first_keys: Option<Vec<Arc<str>>> = match &stream.code[i] {
            Instruction::LookupConstKey(key) => Some(vec![key.clone()]),
            Instruction::LookupConstPath(path) => Some(path.to_vec()),
            _ => None,
        };
        let Some(mut keys) = first_keys else {
            i += 1;
            continue;
        };
        let mut j = i + 1;
        while j < stream.len() {
            match &stream.code[j] {
                Instruction::LookupConstKey(key) => keys.push(key.clone()),
                Instruction::LookupConstPath(path) => keys.extend(path.iter().cloned()),
                _ => break,
            }
            j += 1;
        }
        if j - i >= 2 {
            stream.splice(i..j, vec![Instruction::LookupConstPath(Arc::from(keys))]);
        }
        i += 1;
    }
}

/// Pass 6: fuses a variable load with a following constant lookup path.
pub(crate) fn fuse_find_var_paths(stream: &mut CodeStream) {
    let mut i = 0;
    while i + 1 < stream.len() {
        let (name, mut keys): (Arc<str>, Vec<Arc<str>>) = match &stream.code[i] {
            Instruction::FindVar(name) => (name.clone(), Vec::new()),
            Instruction::FindVarPath(name, path) => (name.clone(), path.to_vec()),
            _ => {
                i += 1;
                continue;
            }
        };
        match &stream.code[i + 1] {
            Instruction::LookupConstKey(key) => keys.push(key.clone()),
            Instruction::LookupConstPath(path) => keys.extend(path.iter().cloned()),
            _ => {
                i += 1;
                continue;
            }
        }
        stream.splice(i..i + 2, vec![Instruction::FindVarPath(name, Arc::from(keys))]);
    }
}

/// Pass 7: drops `IsTruthy` when the producing instruction already yields a
/// boolean.
pub(crate) fn remove_redundant_truthy(stream: &mut CodeStream) {
    let mut i = 0;
    while i + 1 < stream.len() {
        let boolean_producer = matches!(
            stream.code[i],
            Instruction::Compare(_)
                | Instruction::CaseCompare
                | Instruction::Contains
                | Instruction::BoolNot
                | Instruction::IsTruthy
                | Instruction::ConstTrue
                | Instruction::ConstFalse
        );
        if boolean_producer && stream.code[i + 1] == Instruction::IsTruthy {
            stream.remove(i + 1);
        } else {
            i += 1;
        }
    }
}

/// Pass 8: removes `Noop`.
pub(crate) fn remove_noops(stream: &mut CodeStream) {
    let mut i = 0;
    while i < stream.len() {
        if stream.code[i] == Instruction::Noop {
            stream.remove(i);
        } else {
            i += 1;
        }
    }
}

/// Pass 9: `Jump L; Label L` becomes just the label.
pub(crate) fn remove_jumps_to_next_label(stream: &mut CodeStream) {
    let mut i = 0;
    while i + 1 < stream.len() {
        if let (Instruction::Jump(Target::Label(target)), Instruction::Label(label)) =
            (&stream.code[i], &stream.code[i + 1])
            && target == label
        {
            stream.remove(i);
        } else {
            i += 1;
        }
    }
}

/// Pass 10 (and 12 and 16): merges consecutive raw writes.
pub(crate) fn merge_raw_writes(stream: &mut CodeStream) {
    let mut i = 0;
    while i + 1 < stream.len() {
        if let (Instruction::WriteRaw(a), Instruction::WriteRaw(b)) = (&stream.code[i], &stream.code[i + 1]) {
            let merged: Arc<str> = Arc::from(format!("{a}{b}").as_str());
            stream.splice(i..i + 2, vec![Instruction::WriteRaw(merged)]);
        } else {
            i += 1;
        }
    }
}

/// Pass 11: deletes instructions strictly between an unconditional
/// `Jump`/`Halt` and the next *referenced* label. Labels no jump mentions
/// are dead code like anything else.
pub(crate) fn remove_unreachable(stream: &mut CodeStream) {
    let referenced = referenced_labels(stream);
    let mut i = 0;
    while i < stream.len() {
        let terminal = matches!(stream.code[i], Instruction::Jump(_) | Instruction::Halt);
        if !terminal {
            i += 1;
            continue;
        }
        let mut j = i + 1;
        while j < stream.len() {
            if let Instruction::Label(label) = &stream.code[j]
                && referenced.contains(label)
            {
                break;
            }
            j += 1;
        }
        if j > i + 1 {
            stream.splice(i + 1..j, vec![]);
        }
        i += 1;
    }
}

/// Pass 14: removes zero-length raw writes.
pub(crate) fn remove_empty_raw_writes(stream: &mut CodeStream) {
    let mut i = 0;
    while i < stream.len() {
        if matches!(&stream.code[i], Instruction::WriteRaw(s) if s.is_empty()) {
            stream.remove(i);
        } else {
            i += 1;
        }
    }
}

/// Labels referenced by at least one jump.
fn referenced_labels(stream: &CodeStream) -> AHashSet<LabelId> {
    let mut referenced = AHashSet::new();
    for instruction in &stream.code {
        let mut collect = |target: Target| {
            if let Target::Label(label) = target {
                referenced.insert(label);
            }
            target
        };
        // map_targets requires &mut; clone the instruction's targets instead.
        let mut probe = instruction.clone();
        probe.map_targets(&mut collect);
    }
    referenced
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::span::Span;

    fn stream_of(code: Vec<Instruction>) -> CodeStream {
        let spans = vec![Span::default(); code.len()];
        CodeStream::new(code, spans)
    }

    #[test]
    fn test_collapse_and_fuse_lookup_chain() {
        let mut stream = stream_of(vec![
            Instruction::FindVar(Arc::from("a")),
            Instruction::LookupConstKey(Arc::from("b")),
            Instruction::LookupConstKey(Arc::from("c")),
        ]);
        collapse_lookup_paths(&mut stream);
        fuse_find_var_paths(&mut stream);
        let Instruction::FindVarPath(name, path) = &stream.code[0] else {
            panic!("expected fused path, got {:?}", stream.code);
        };
        assert_eq!(name.as_ref(), "a");
        assert_eq!(path.iter().map(AsRef::as_ref).collect::<Vec<_>>(), vec!["b", "c"]);
        assert_eq!(stream.len(), 1);
    }

    #[test]
    fn test_single_key_still_fuses() {
        let mut stream = stream_of(vec![
            Instruction::FindVar(Arc::from("a")),
            Instruction::LookupConstKey(Arc::from("b")),
        ]);
        collapse_lookup_paths(&mut stream);
        fuse_find_var_paths(&mut stream);
        assert!(matches!(&stream.code[0], Instruction::FindVarPath(_, path) if path.len() == 1));
    }

    #[test]
    fn test_redundant_truthy_removed() {
        let mut stream = stream_of(vec![
            Instruction::Contains,
            Instruction::IsTruthy,
            Instruction::IsTruthy,
        ]);
        remove_redundant_truthy(&mut stream);
        assert_eq!(stream.code, vec![Instruction::Contains]);
    }

    #[test]
    fn test_jump_to_next_label() {
        let label = LabelId(4);
        let mut stream = stream_of(vec![
            Instruction::Jump(Target::Label(label)),
            Instruction::Label(label),
        ]);
        remove_jumps_to_next_label(&mut stream);
        assert_eq!(stream.code, vec![Instruction::Label(label)]);
    }

    #[test]
    fn test_merge_raw_writes() {
        let mut stream = stream_of(vec![
            Instruction::WriteRaw(Arc::from("a")),
            Instruction::WriteRaw(Arc::from("b")),
            Instruction::WriteRaw(Arc::from("c")),
        ]);
        merge_raw_writes(&mut stream);
        assert_eq!(stream.code, vec![Instruction::WriteRaw(Arc::from("abc"))]);
    }

    #[test]
    fn test_unreachable_removal_respects_referenced_labels() {
        let live = LabelId(0);
        let dead = LabelId(1);
        let mut stream = stream_of(vec![
            Instruction::Jump(Target::Label(live)),
            Instruction::Label(dead),
            Instruction::WriteRaw(Arc::from("dead")),
            Instruction::Label(live),
            Instruction::Halt,
        ]);
        remove_unreachable(&mut stream);
        assert_eq!(
            stream.code,
            vec![
                Instruction::Jump(Target::Label(live)),
                Instruction::Label(live),
                Instruction::Halt,
            ]
        );
    }
}
