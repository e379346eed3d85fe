//! The label linker.
//!
//! Two passes over the instruction vector: the first records the index of
//! every `Label` declaration, the second rewrites every symbolic jump target
//! to that absolute index and degrades the labels themselves to `Noop`. An
//! undefined label is a fatal compile-time error; unused labels are silently
//! accepted.

use ahash::AHashMap;

use crate::error::{ErrorKind, TemplateError};
use crate::ir::{Instruction, LabelId, Target};

/// Resolves all symbolic labels in `code` in place.
///
/// After a successful return every jump operand is a valid `Target::Index`
/// into `code` and no `Label` instruction remains.
pub(crate) fn link(code: &mut [Instruction]) -> Result<(), TemplateError> {
    let mut positions: AHashMap<LabelId, usize> = AHashMap::new();
    for (index, instruction) in code.iter().enumerate() {
        if let Instruction::Label(label) = instruction {
            let previous = positions.insert(*label, index);
            if previous.is_some() {
                return Err(TemplateError::new(
                    ErrorKind::Syntax,
                    format!("label {label} declared twice"),
                ));
            }
        }
    }

    let mut undefined: Option<LabelId> = None;
    for instruction in code.iter_mut() {
        instruction.map_targets(|target| match target {
            Target::Label(label) => match positions.get(&label) {
                Some(&index) => Target::Index(index),
                None => {
                    undefined.get_or_insert(label);
                    target
                }
            },
            resolved @ Target::Index(_) => resolved,
        });
        if let Instruction::Label(_) = instruction {
            *instruction = Instruction::Noop;
        }
    }
    if let Some(label) = undefined {
        return Err(TemplateError::new(
            ErrorKind::Syntax,
            format!("jump to undefined label {label}"),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_links_forward_and_backward() {
        let head = LabelId(0);
        let end = LabelId(1);
        let mut code = vec![
            Instruction::Label(head),
            Instruction::ConstTrue,
            Instruction::JumpIfFalse(Target::Label(end)),
            Instruction::Jump(Target::Label(head)),
            Instruction::Label(end),
            Instruction::Halt,
        ];
        link(&mut code).unwrap();
        assert_eq!(code[0], Instruction::Noop);
        assert_eq!(code[2], Instruction::JumpIfFalse(Target::Index(4)));
        assert_eq!(code[3], Instruction::Jump(Target::Index(0)));
        assert_eq!(code[4], Instruction::Noop);
    }

    #[test]
    fn test_undefined_label_is_fatal() {
        let mut code = vec![Instruction::Jump(Target::Label(LabelId(9))), Instruction::Halt];
        let err = link(&mut code).unwrap_err();
        assert!(err.message().contains("undefined label"));
    }

    #[test]
    fn test_duplicate_label_is_fatal() {
        let mut code = vec![Instruction::Label(LabelId(0)), Instruction::Label(LabelId(0))];
        assert!(link(&mut code).is_err());
    }

    #[test]
    fn test_unused_labels_are_accepted() {
        let mut code = vec![Instruction::Label(LabelId(3)), Instruction::Halt];
        link(&mut code).unwrap();
        assert_eq!(code[0], Instruction::Noop);
    }
}
