//! The extension meta-instructions.
//!
//! `STACKTYPE` asserts the current stack shape and erases to a no-op;
//! `FN` frames check their body against a declared input/output pattern
//! with scoped type variables and erase to the body; `PRINT` validates its
//! stack references; `TEST_ASSERT` checks its body produces `bool` without
//! unconditionally failing. Pattern variables bind `(type, notes)` pairs;
//! rebinding unifies through type equality and note convergence.

use super::instr::{check_seq, StepOut};
use super::{Checker, ExtError, Hst, SomeInstr, StackItem, TcError, TyVarMap};
use crate::annotation::converge;
use crate::instr::Instr;
use crate::ty::Comparable;
use crate::untyped::{
    PrintComment, PrintPart, StackPatternItem, StackTail, StackTypePattern, UExtInstr, UInstr,
};

fn ext_err(stack: &Hst, error: ExtError) -> TcError {
    TcError::Ext {
        stack: stack.clone(),
        error,
    }
}

/// Match a pattern against a stack prefix, binding type variables.
fn match_pattern(
    map: &mut TyVarMap,
    pattern: &StackTypePattern,
    stack: &Hst,
) -> Result<(), ExtError> {
    if stack.len() < pattern.items.len()
        || (pattern.tail == StackTail::Empty && stack.len() != pattern.items.len())
    {
        return Err(ExtError::LengthMismatch {
            pattern_len: pattern.items.len(),
            stack_len: stack.len(),
        });
    }
    for (position, (item, slot)) in pattern.items.iter().zip(stack.iter()).enumerate() {
        match item {
            StackPatternItem::TyVar(name) => match map.get(name) {
                Some((bound_ty, bound_notes)) => {
                    if *bound_ty != slot.ty {
                        return Err(ExtError::TyVarMismatch {
                            var: name.clone(),
                            bound: bound_ty.clone(),
                            actual: slot.ty.clone(),
                        });
                    }
                    let merged = converge(bound_notes, &slot.notes)?;
                    map.insert(name.clone(), (slot.ty.clone(), merged));
                }
                None => {
                    map.insert(name.clone(), (slot.ty.clone(), slot.notes.clone()));
                }
            },
            StackPatternItem::Ty(u) => {
                let (ty, notes) = u
                    .extract()
                    .map_err(|e| ExtError::VarError(format!("bad type in pattern: {}", e)))?;
                if ty != slot.ty {
                    return Err(ExtError::TypeMismatch {
                        position,
                        expected: ty,
                        actual: slot.ty.clone(),
                    });
                }
                converge(&notes, &slot.notes)?;
            }
        }
    }
    Ok(())
}

/// Match an `FN` output pattern against the body's output stack. All
/// variables must already be bound by the input match; the open tail, if
/// any, must be exactly the input stack's tail.
fn match_output(
    map: &TyVarMap,
    pattern: &StackTypePattern,
    stack: &Hst,
    input_rest: &[StackItem],
) -> Result<(), ExtError> {
    if stack.len() < pattern.items.len()
        || (pattern.tail == StackTail::Empty && stack.len() != pattern.items.len())
    {
        return Err(ExtError::LengthMismatch {
            pattern_len: pattern.items.len(),
            stack_len: stack.len(),
        });
    }
    for (position, (item, slot)) in pattern.items.iter().zip(stack.iter()).enumerate() {
        match item {
            StackPatternItem::TyVar(name) => {
                let (bound_ty, bound_notes) = map.get(name).ok_or_else(|| {
                    ExtError::VarError(format!(
                        "output references unbound type variable '{}'",
                        name
                    ))
                })?;
                if *bound_ty != slot.ty {
                    return Err(ExtError::TypeMismatch {
                        position,
                        expected: bound_ty.clone(),
                        actual: slot.ty.clone(),
                    });
                }
                converge(bound_notes, &slot.notes)?;
            }
            StackPatternItem::Ty(u) => {
                let (ty, notes) = u
                    .extract()
                    .map_err(|e| ExtError::VarError(format!("bad type in pattern: {}", e)))?;
                if ty != slot.ty {
                    return Err(ExtError::TypeMismatch {
                        position,
                        expected: ty,
                        actual: slot.ty.clone(),
                    });
                }
                converge(&notes, &slot.notes)?;
            }
        }
    }
    if pattern.tail == StackTail::Rest {
        let remaining = &stack[pattern.items.len()..];
        if remaining.len() != input_rest.len()
            || remaining
                .iter()
                .zip(input_rest.iter())
                .any(|(a, b)| a.ty != b.ty)
        {
            return Err(ExtError::StkRestMismatch);
        }
    }
    Ok(())
}

fn check_print_refs(comment: &PrintComment, stack: &Hst) -> Result<(), ExtError> {
    for part in &comment.parts {
        if let PrintPart::StackRef(reference) = part {
            if *reference >= stack.len() {
                return Err(ExtError::InvalidStackReference {
                    reference: *reference,
                    stack_size: stack.len(),
                });
            }
        }
    }
    Ok(())
}

/// Variables appearing in a pattern prefix.
fn pattern_vars(pattern: &StackTypePattern) -> Vec<&str> {
    pattern
        .items
        .iter()
        .filter_map(|item| match item {
            StackPatternItem::TyVar(name) => Some(name.as_str()),
            StackPatternItem::Ty(_) => None,
        })
        .collect()
}

pub(crate) fn check_ext(
    checker: &mut Checker,
    ext: &UExtInstr,
    stack: Hst,
) -> Result<(Vec<Instr>, StepOut), TcError> {
    match ext {
        UExtInstr::StackType(pattern) => {
            // Binds into the innermost frame so later assertions in the
            // same frame see the same variables.
            let scope = checker
                .scopes
                .last_mut()
                .expect("the root variable scope always exists");
            match_pattern(scope, pattern, &stack).map_err(|e| ext_err(&stack, e))?;
            Ok((vec![Instr::Nop], StepOut::Stack(stack)))
        }

        UExtInstr::Fn {
            name,
            pattern,
            body,
        } => {
            let input_vars = pattern_vars(&pattern.input);
            for var in &input_vars {
                if !pattern.quantified.iter().any(|q| q == var) {
                    return Err(ext_err(
                        &stack,
                        ExtError::VarError(format!(
                            "FN '{}': type variable '{}' is not quantified",
                            name, var
                        )),
                    ));
                }
            }
            for q in &pattern.quantified {
                if !input_vars.contains(&q.as_str()) {
                    return Err(ext_err(
                        &stack,
                        ExtError::VarError(format!(
                            "FN '{}': quantified variable '{}' does not occur in the input",
                            name, q
                        )),
                    ));
                }
            }

            checker.scopes.push(TyVarMap::new());
            let result = check_fn_frame(checker, pattern, body, &stack);
            checker.scopes.pop();
            result
        }

        UExtInstr::Print(comment) => {
            check_print_refs(comment, &stack).map_err(|e| ext_err(&stack, e))?;
            Ok((vec![Instr::Print(comment.clone())], StepOut::Stack(stack)))
        }

        UExtInstr::TestAssert {
            name,
            comment,
            body,
        } => {
            check_print_refs(comment, &stack).map_err(|e| ext_err(&stack, e))?;
            let checked = check_seq(checker, body, stack.clone())?;
            let code = match checked {
                SomeInstr::AnyOut(_) => {
                    return Err(ext_err(
                        &stack,
                        ExtError::TestAssertError(format!(
                            "'{}': the assertion body may not fail unconditionally",
                            name
                        )),
                    ))
                }
                SomeInstr::Typed(code, out) => {
                    let top_is_bool = out
                        .first()
                        .map(|item| item.ty.as_comparable() == Some(Comparable::Bool))
                        .unwrap_or(false);
                    if !top_is_bool {
                        return Err(ext_err(
                            &stack,
                            ExtError::TestAssertError(format!(
                                "'{}': the assertion body must leave bool on top",
                                name
                            )),
                        ));
                    }
                    code
                }
            };
            Ok((
                vec![Instr::TestAssert {
                    name: name.clone(),
                    comment: comment.clone(),
                    body: code,
                }],
                StepOut::Stack(stack),
            ))
        }
    }
}

fn check_fn_frame(
    checker: &mut Checker,
    pattern: &crate::untyped::FnPattern,
    body: &[UInstr],
    stack: &Hst,
) -> Result<(Vec<Instr>, StepOut), TcError> {
    {
        let scope = checker
            .scopes
            .last_mut()
            .expect("FN frame scope was just pushed");
        match_pattern(scope, &pattern.input, stack).map_err(|e| ext_err(stack, e))?;
    }

    let checked = check_seq(checker, body, stack.clone())?;
    match checked {
        // An always-failing frame body has no output to match.
        SomeInstr::AnyOut(code) => Ok((code, StepOut::Fail)),
        SomeInstr::Typed(code, out) => {
            let mut rebound = TyVarMap::new();
            match_pattern(&mut rebound, &pattern.input, stack).map_err(|e| ext_err(stack, e))?;
            let input_rest = &stack[pattern.input.items.len().min(stack.len())..];
            match_output(&rebound, &pattern.output, &out, input_rest)
                .map_err(|e| ext_err(stack, e))?;
            Ok((code, StepOut::Stack(out)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotation::VarAnn;
    use crate::ty::Type;
    use crate::untyped::{FnPattern, UType, UValue};

    fn int_item() -> StackItem {
        StackItem::plain(Type::int())
    }

    fn stacktype(items: Vec<StackPatternItem>, tail: StackTail) -> UInstr {
        UInstr::Ext(UExtInstr::StackType(StackTypePattern { items, tail }))
    }

    fn run(code: &[UInstr], stack: Hst) -> Result<SomeInstr, TcError> {
        let mut checker = Checker::new(None);
        check_seq(&mut checker, code, stack)
    }

    #[test]
    fn stacktype_accepts_matching_stack() {
        let code = vec![stacktype(
            vec![StackPatternItem::Ty(UType::int())],
            StackTail::Empty,
        )];
        assert!(run(&code, vec![int_item()]).is_ok());
    }

    #[test]
    fn stacktype_rejects_wrong_length() {
        let code = vec![stacktype(vec![], StackTail::Empty)];
        let err = run(&code, vec![int_item()]).unwrap_err();
        match err {
            TcError::Ext {
                error: ExtError::LengthMismatch { .. },
                ..
            } => {}
            other => panic!("expected length mismatch, got {:?}", other),
        }
    }

    #[test]
    fn stacktype_open_tail_allows_deeper_stack() {
        let code = vec![stacktype(
            vec![StackPatternItem::Ty(UType::int())],
            StackTail::Rest,
        )];
        assert!(run(&code, vec![int_item(), StackItem::plain(Type::nat())]).is_ok());
    }

    #[test]
    fn repeated_tyvar_must_unify() {
        let code = vec![stacktype(
            vec![
                StackPatternItem::TyVar("a".into()),
                StackPatternItem::TyVar("a".into()),
            ],
            StackTail::Empty,
        )];
        assert!(run(&code, vec![int_item(), int_item()]).is_ok());
        let err = run(&code, vec![int_item(), StackItem::plain(Type::nat())]).unwrap_err();
        match err {
            TcError::Ext {
                error: ExtError::TyVarMismatch { .. },
                ..
            } => {}
            other => panic!("expected tyvar mismatch, got {:?}", other),
        }
    }

    #[test]
    fn fn_frame_checks_output_pattern() {
        // FN declares int -> int but the body pushes a nat on top.
        let pattern = FnPattern {
            quantified: vec!["a".into()],
            input: StackTypePattern {
                items: vec![StackPatternItem::TyVar("a".into())],
                tail: StackTail::Rest,
            },
            output: StackTypePattern {
                items: vec![StackPatternItem::TyVar("a".into())],
                tail: StackTail::Rest,
            },
        };
        let good = vec![UInstr::Ext(UExtInstr::Fn {
            name: "id".into(),
            pattern: pattern.clone(),
            body: vec![],
        })];
        assert!(run(&good, vec![int_item()]).is_ok());

        let bad = vec![UInstr::Ext(UExtInstr::Fn {
            name: "id".into(),
            pattern,
            body: vec![UInstr::push(UType::nat(), UValue::int(1))],
        })];
        let err = run(&bad, vec![int_item()]).unwrap_err();
        match err {
            TcError::Ext {
                error: ExtError::TypeMismatch { .. } | ExtError::StkRestMismatch,
                ..
            } => {}
            other => panic!("expected output mismatch, got {:?}", other),
        }
    }

    #[test]
    fn fn_rejects_unquantified_variables() {
        let pattern = FnPattern {
            quantified: vec![],
            input: StackTypePattern {
                items: vec![StackPatternItem::TyVar("a".into())],
                tail: StackTail::Rest,
            },
            output: StackTypePattern {
                items: vec![],
                tail: StackTail::Rest,
            },
        };
        let code = vec![UInstr::Ext(UExtInstr::Fn {
            name: "broken".into(),
            pattern,
            body: vec![],
        })];
        let err = run(&code, vec![int_item()]).unwrap_err();
        match err {
            TcError::Ext {
                error: ExtError::VarError(_),
                ..
            } => {}
            other => panic!("expected var error, got {:?}", other),
        }
    }

    #[test]
    fn print_validates_stack_references() {
        let comment = PrintComment {
            parts: vec![PrintPart::Text("top: ".into()), PrintPart::StackRef(1)],
        };
        let code = vec![UInstr::Ext(UExtInstr::Print(comment))];
        let err = run(&code, vec![int_item()]).unwrap_err();
        match err {
            TcError::Ext {
                error:
                    ExtError::InvalidStackReference {
                        reference: 1,
                        stack_size: 1,
                    },
                ..
            } => {}
            other => panic!("expected invalid stack reference, got {:?}", other),
        }
    }

    #[test]
    fn test_assert_requires_bool_body() {
        let good = vec![UInstr::Ext(UExtInstr::TestAssert {
            name: "top_is_positive".into(),
            comment: PrintComment::empty(),
            body: vec![
                UInstr::Dup {
                    var_ann: VarAnn::none(),
                },
                UInstr::Gt {
                    var_ann: VarAnn::none(),
                },
            ],
        })];
        assert!(run(&good, vec![int_item()]).is_ok());

        let bad = vec![UInstr::Ext(UExtInstr::TestAssert {
            name: "not_bool".into(),
            comment: PrintComment::empty(),
            body: vec![],
        })];
        assert!(run(&bad, vec![int_item()]).is_err());
    }

    #[test]
    fn test_assert_leaves_stack_unchanged() {
        let code = vec![
            UInstr::Ext(UExtInstr::TestAssert {
                name: "check".into(),
                comment: PrintComment::empty(),
                body: vec![
                    UInstr::Dup {
                        var_ann: VarAnn::none(),
                    },
                    UInstr::Eq {
                        var_ann: VarAnn::none(),
                    },
                ],
            }),
            // Still exactly one int below.
            stacktype(vec![StackPatternItem::Ty(UType::int())], StackTail::Empty),
        ];
        assert!(run(&code, vec![int_item()]).is_ok());
    }
}
