//! Constant folding passes.
//!
//! All folds run to a local fixpoint: rewriting restarts the scan a couple
//! of instructions back so chains collapse in one invocation, which keeps
//! the pipeline idempotent.

use std::sync::Arc;

use crate::filters;
use crate::ir::Instruction;
use crate::optimizer::CodeStream;
use crate::value::Value;

/// Pass 2: folds constant truthiness, negation, comparison, case comparison
/// and containment, plus conditional jumps whose condition is constant.
pub(crate) fn fold_constants(stream: &mut CodeStream) {
    let mut i = 0;
    while i < stream.len() {
        if let Some(rewrite_at) = try_fold_at(stream, i) {
            i = rewrite_at.saturating_sub(2);
        } else {
            i += 1;
        }
    }
}

/// Attempts one fold with its last instruction at or after `i`; returns the
/// rewrite position on success.
fn try_fold_at(stream: &mut CodeStream, i: usize) -> Option<usize> {
    let code = &stream.code;

    // Unary: Const + (IsTruthy | BoolNot).
    if i + 1 < code.len()
        && let Some(value) = code[i].as_const()
    {
        match &code[i + 1] {
            Instruction::IsTruthy => {
                let result = const_bool(value.is_truthy());
                stream.splice(i..i + 2, vec![result]);
                return Some(i);
            }
            Instruction::BoolNot => {
                let result = const_bool(!value.is_truthy());
                stream.splice(i..i + 2, vec![result]);
                return Some(i);
            }
            Instruction::JumpIfFalse(target) => {
                let replacement = if value.is_truthy() {
                    vec![]
                } else {
                    vec![Instruction::Jump(*target)]
                };
                stream.splice(i..i + 2, replacement);
                return Some(i);
            }
            Instruction::JumpIfTrue(target) => {
                let replacement = if value.is_truthy() {
                    vec![Instruction::Jump(*target)]
                } else {
                    vec![]
                };
                stream.splice(i..i + 2, replacement);
                return Some(i);
            }
            Instruction::JumpIfEmpty(target) => {
                // Peeks rather than pops: the constant stays either way.
                let replacement = if value.iterates_empty() {
                    vec![code[i].clone(), Instruction::Jump(*target)]
                } else {
                    vec![code[i].clone()]
                };
                stream.splice(i..i + 2, replacement);
                return Some(i + 1);
            }
            _ => {}
        }
    }

    // Binary: Const + Const + (Compare | CaseCompare | Contains).
    if i + 2 < code.len()
        && let (Some(a), Some(b)) = (code[i].as_const(), code[i + 1].as_const())
    {
        let result = match &code[i + 2] {
            Instruction::Compare(op) => filters::compare_values(&a, &b, *op).ok(),
            Instruction::CaseCompare => Some(a.case_eq(&b)),
            Instruction::Contains => Some(a.contains(&b)),
            _ => None,
        };
        if let Some(result) = result {
            stream.splice(i..i + 3, vec![const_bool(result)]);
            return Some(i);
        }
    }
    None
}

fn const_bool(value: bool) -> Instruction {
    if value { Instruction::ConstTrue } else { Instruction::ConstFalse }
}

/// Pass 3: evaluates whitelisted pure filters whose input and arguments are
/// all constants. A filter error or a non-literal result (arrays) leaves the
/// call for runtime.
pub(crate) fn fold_constant_filters(stream: &mut CodeStream) {
    let mut i = 0;
    while i < stream.len() {
        let Instruction::CallFilter { name, argc } = &stream.code[i] else {
            i += 1;
            continue;
        };
        let argc = usize::from(*argc);
        let needed = argc + 1;
        if i < needed || !filters::is_pure(name) {
            i += 1;
            continue;
        }
        let operands: Option<Vec<Value>> = stream.code[i - needed..i].iter().map(Instruction::as_const).collect();
        let Some(mut operands) = operands else {
            i += 1;
            continue;
        };
        let name = name.clone();
        let args = operands.split_off(1);
        let input = operands.pop().expect("operands holds the filter input");
        let Ok(result) = filters::apply(&name, &input, &args) else {
            i += 1;
            continue;
        };
        let Some(replacement) = Instruction::for_const(&result) else {
            i += 1;
            continue;
        };
        let start = i - needed;
        stream.splice(start..i + 1, vec![replacement]);
        i = start.saturating_sub(2);
    }
}

/// Pass 4: `Const + WriteValue` becomes a raw write of the value's output
/// form (dropped later when empty).
pub(crate) fn fold_constant_writes(stream: &mut CodeStream) {
    let mut i = 0;
    while i + 1 < stream.len() {
        if stream.code[i + 1] == Instruction::WriteValue
            && let Some(value) = stream.code[i].as_const()
        {
            let text = value.to_output_string();
            stream.splice(i..i + 2, vec![Instruction::WriteRaw(Arc::from(text.as_str()))]);
        } else {
            i += 1;
        }
    }
}

/// Pass 13: a capture whose body is nothing but raw writes becomes the
/// captured string constant (feeding the `Assign` that follows it).
pub(crate) fn fold_constant_captures(stream: &mut CodeStream) {
    let mut changed = true;
    while changed {
        changed = false;
        let mut i = 0;
        while i < stream.len() {
            if stream.code[i] != Instruction::PushCapture {
                i += 1;
                continue;
            }
            let mut text = String::new();
            let mut j = i + 1;
            let folded = loop {
                match stream.code.get(j) {
                    Some(Instruction::WriteRaw(s)) => {
                        text.push_str(s);
                        j += 1;
                    }
                    Some(Instruction::PopCapture) => break true,
                    _ => break false,
                }
            };
            if folded {
                stream.splice(i..j + 1, vec![Instruction::ConstString(Arc::from(text.as_str()))]);
                changed = true;
            }
            i += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{CmpOp, LabelId, Target};
    use crate::span::Span;

    fn stream_of(code: Vec<Instruction>) -> CodeStream {
        let spans = vec![Span::default(); code.len()];
        CodeStream::new(code, spans)
    }

    #[test]
    fn test_fold_truthiness_chain() {
        let mut stream = stream_of(vec![
            Instruction::ConstString(Arc::from("x")),
            Instruction::IsTruthy,
            Instruction::BoolNot,
        ]);
        fold_constants(&mut stream);
        assert_eq!(stream.code, vec![Instruction::ConstFalse]);
    }

    #[test]
    fn test_fold_comparison() {
        let mut stream = stream_of(vec![
            Instruction::ConstInt(2),
            Instruction::ConstInt(3),
            Instruction::Compare(CmpOp::Lt),
        ]);
        fold_constants(&mut stream);
        assert_eq!(stream.code, vec![Instruction::ConstTrue]);
    }

    #[test]
    fn test_incomparable_ordering_is_left_for_runtime() {
        let mut stream = stream_of(vec![
            Instruction::ConstInt(2),
            Instruction::ConstString(Arc::from("x")),
            Instruction::Compare(CmpOp::Lt),
        ]);
        fold_constants(&mut stream);
        assert_eq!(stream.len(), 3);
    }

    #[test]
    fn test_fold_constant_conditional_jump() {
        let target = Target::Label(LabelId(0));
        let mut stream = stream_of(vec![Instruction::ConstTrue, Instruction::JumpIfFalse(target)]);
        fold_constants(&mut stream);
        assert!(stream.code.is_empty());

        let mut stream = stream_of(vec![Instruction::ConstFalse, Instruction::JumpIfFalse(target)]);
        fold_constants(&mut stream);
        assert_eq!(stream.code, vec![Instruction::Jump(target)]);
    }

    #[test]
    fn test_jump_if_empty_keeps_the_peeked_constant() {
        let target = Target::Label(LabelId(0));
        let mut stream = stream_of(vec![Instruction::ConstRange(1, 3), Instruction::JumpIfEmpty(target)]);
        fold_constants(&mut stream);
        assert_eq!(stream.code, vec![Instruction::ConstRange(1, 3)]);

        let mut stream = stream_of(vec![Instruction::ConstRange(3, 1), Instruction::JumpIfEmpty(target)]);
        fold_constants(&mut stream);
        assert_eq!(
            stream.code,
            vec![Instruction::ConstRange(3, 1), Instruction::Jump(target)]
        );
    }

    #[test]
    fn test_fold_filter_chain() {
        let mut stream = stream_of(vec![
            Instruction::ConstString(Arc::from("hello")),
            Instruction::CallFilter {
                name: Arc::from("upcase"),
                argc: 0,
            },
            Instruction::ConstString(Arc::from("!")),
            Instruction::CallFilter {
                name: Arc::from("append"),
                argc: 1,
            },
        ]);
        fold_constant_filters(&mut stream);
        assert_eq!(stream.code, vec![Instruction::ConstString(Arc::from("HELLO!"))]);
    }

    #[test]
    fn test_impure_filters_not_folded() {
        let mut stream = stream_of(vec![
            Instruction::ConstString(Arc::from("now")),
            Instruction::CallFilter {
                name: Arc::from("date"),
                argc: 0,
            },
        ]);
        fold_constant_filters(&mut stream);
        assert_eq!(stream.len(), 2);
    }

    #[test]
    fn test_fold_constant_write() {
        let mut stream = stream_of(vec![Instruction::ConstInt(42), Instruction::WriteValue]);
        fold_constant_writes(&mut stream);
        assert_eq!(stream.code, vec![Instruction::WriteRaw(Arc::from("42"))]);
    }

    #[test]
    fn test_fold_constant_capture() {
        let mut stream = stream_of(vec![
            Instruction::PushCapture,
            Instruction::WriteRaw(Arc::from("a")),
            Instruction::WriteRaw(Arc::from("b")),
            Instruction::PopCapture,
            Instruction::Assign(Arc::from("v")),
        ]);
        fold_constant_captures(&mut stream);
        assert_eq!(
            stream.code,
            vec![
                Instruction::ConstString(Arc::from("ab")),
                Instruction::Assign(Arc::from("v")),
            ]
        );
    }

    #[test]
    fn test_capture_with_dynamic_body_not_folded() {
        let mut stream = stream_of(vec![
            Instruction::PushCapture,
            Instruction::FindVar(Arc::from("x")),
            Instruction::WriteValue,
            Instruction::PopCapture,
        ]);
        fold_constant_captures(&mut stream);
        assert_eq!(stream.len(), 4);
    }
}
