//! The instruction walker: one case per opcode.
//!
//! Every case pops the stack prefix the opcode consumes, resolves result
//! types through the primitive tables, runs the annotation derivations,
//! and emits the typed instruction. Structured opcodes recurse through
//! `check_seq` and converge their branch stacks element-wise.

use super::{ext, prim, value::typecheck_value};
use super::{Checker, ExtError, Hst, SomeInstr, StackItem, TcError};
use crate::annotation::{
    converge, converge_anns, derive_car_cdr_var, derive_option_sub, derive_or_sub,
    derive_pair_anns, derive_var, AnnError, FieldAnn, Notes, TypeAnn, VarAnn,
};
use crate::instr::{Instr, Lambda};
use crate::ty::{require_eq, Comparable, Type};
use crate::untyped::{UContract, UInstr};

/// What one checked instruction leaves behind.
pub(crate) enum StepOut {
    Stack(Hst),
    /// Unconditional failure: the rest of the sequence is unreachable.
    Fail,
}

pub(crate) fn check_seq(
    checker: &mut Checker,
    code: &[UInstr],
    start: Hst,
) -> Result<SomeInstr, TcError> {
    let mut out: Vec<Instr> = Vec::with_capacity(code.len());
    let mut stack = Some(start);
    for instr in code {
        let current = match stack.take() {
            Some(s) => s,
            None => return Err(TcError::Unreachable),
        };
        let (emitted, step) = check_instr(checker, instr, current)?;
        out.extend(emitted);
        match step {
            StepOut::Stack(next) => stack = Some(next),
            StepOut::Fail => stack = None,
        }
    }
    Ok(match stack {
        Some(s) => SomeInstr::Typed(out, s),
        None => SomeInstr::AnyOut(out),
    })
}

fn on_instr(instr: &UInstr, stack: &Hst, message: impl Into<String>) -> TcError {
    TcError::FailedOnInstr {
        instr: instr.clone(),
        stack: stack.clone(),
        message: message.into(),
    }
}

fn ann_err(stack: &Hst, error: AnnError) -> TcError {
    TcError::Ext {
        stack: stack.clone(),
        error: ExtError::Ann(error),
    }
}

fn need(instr: &UInstr, stack: &Hst, n: usize) -> Result<(), TcError> {
    if stack.len() < n {
        Err(on_instr(
            instr,
            stack,
            format!("not enough items on the stack: need {}", n),
        ))
    } else {
        Ok(())
    }
}

fn var_or(var: &VarAnn, default_name: &str) -> VarAnn {
    if var.is_none() {
        VarAnn::new(default_name)
    } else {
        var.clone()
    }
}

fn keep_or(user: &VarAnn, fallback: &VarAnn) -> VarAnn {
    if user.is_none() {
        fallback.clone()
    } else {
        user.clone()
    }
}

/// Pair-node components, defaulting for `Star`.
fn pair_components(notes: &Notes) -> (FieldAnn, FieldAnn, Notes, Notes) {
    match notes {
        Notes::Pair {
            first_field,
            second_field,
            first,
            second,
            ..
        } => (
            first_field.clone(),
            second_field.clone(),
            (**first).clone(),
            (**second).clone(),
        ),
        _ => (
            FieldAnn::none(),
            FieldAnn::none(),
            Notes::Star,
            Notes::Star,
        ),
    }
}

/// One-child node component (list/set/contract), defaulting for `Star`.
fn elem_child(notes: &Notes) -> Notes {
    match notes {
        Notes::Elem { elem, .. } => (**elem).clone(),
        _ => Notes::Star,
    }
}

/// Two-child node components (map/big_map/lambda), defaulting for `Star`.
fn entry_children(notes: &Notes) -> (Notes, Notes) {
    match notes {
        Notes::Entry { key, value, .. } => ((**key).clone(), (**value).clone()),
        _ => (Notes::Star, Notes::Star),
    }
}

fn converge_stacks(
    instr: &UInstr,
    entry: &Hst,
    a: Hst,
    b: Hst,
) -> Result<Hst, TcError> {
    if a.len() != b.len() {
        return Err(on_instr(
            instr,
            entry,
            "branches produce stacks of different depth",
        ));
    }
    let mut out = Vec::with_capacity(a.len());
    for (x, y) in a.into_iter().zip(b.into_iter()) {
        if x.ty != y.ty {
            return Err(on_instr(
                instr,
                entry,
                format!("branches disagree on a stack type: {} vs {}", x.ty, y.ty),
            ));
        }
        let notes = converge(&x.notes, &y.notes).map_err(|e| ann_err(entry, e))?;
        let var = converge_anns(&x.var, &y.var).map_err(|e| ann_err(entry, e))?;
        out.push(StackItem::new(x.ty, notes, var));
    }
    Ok(out)
}

/// Converge two checked branches into the instruction's output.
fn merge_branches(
    instr: &UInstr,
    entry: &Hst,
    a: SomeInstr,
    b: SomeInstr,
) -> Result<(Vec<Instr>, Vec<Instr>, StepOut), TcError> {
    match (a, b) {
        (SomeInstr::Typed(ca, sa), SomeInstr::Typed(cb, sb)) => {
            let merged = converge_stacks(instr, entry, sa, sb)?;
            Ok((ca, cb, StepOut::Stack(merged)))
        }
        (SomeInstr::Typed(ca, sa), SomeInstr::AnyOut(cb)) => {
            Ok((ca, cb, StepOut::Stack(sa)))
        }
        (SomeInstr::AnyOut(ca), SomeInstr::Typed(cb, sb)) => {
            Ok((ca, cb, StepOut::Stack(sb)))
        }
        (SomeInstr::AnyOut(ca), SomeInstr::AnyOut(cb)) => Ok((ca, cb, StepOut::Fail)),
    }
}

pub(crate) fn check_instr(
    checker: &mut Checker,
    instr: &UInstr,
    mut stack: Hst,
) -> Result<(Vec<Instr>, StepOut), TcError> {
    let entry = stack.clone();
    let one = |i: Instr, s: Hst| Ok((vec![i], StepOut::Stack(s)));

    match instr {
        UInstr::Drop => {
            need(instr, &entry, 1)?;
            stack.remove(0);
            one(Instr::Drop, stack)
        }

        UInstr::Dup { var_ann } => {
            need(instr, &entry, 1)?;
            let top = stack[0].clone();
            let var = keep_or(var_ann, &top.var);
            stack.insert(0, StackItem::new(top.ty, top.notes, var));
            one(Instr::Dup, stack)
        }

        UInstr::Swap => {
            need(instr, &entry, 2)?;
            stack.swap(0, 1);
            one(Instr::Swap, stack)
        }

        UInstr::Push { var_ann, ty, value } => {
            let (t, notes) = ty.extract().map_err(|e| on_instr(instr, &entry, e))?;
            if !t.has_no_op() {
                return Err(on_instr(instr, &entry, "operation values cannot be pushed"));
            }
            let typed = typecheck_value(value, &t)?;
            stack.insert(0, StackItem::new(t.clone(), notes, var_ann.clone()));
            one(
                Instr::Push {
                    ty: t,
                    value: typed,
                },
                stack,
            )
        }

        UInstr::Unit { type_ann, var_ann } => {
            stack.insert(
                0,
                StackItem::new(Type::Unit, Notes::Atom(type_ann.clone()), var_ann.clone()),
            );
            one(Instr::Unit, stack)
        }

        UInstr::Some {
            type_ann,
            var_ann,
            field_ann,
        } => {
            need(instr, &entry, 1)?;
            let x = stack.remove(0);
            let notes = Notes::Option {
                type_ann: type_ann.clone(),
                some_field: field_ann.clone(),
                some: Box::new(x.notes),
            };
            stack.insert(
                0,
                StackItem::new(Type::option(x.ty), notes, var_ann.clone()),
            );
            one(Instr::Some, stack)
        }

        UInstr::None {
            type_ann,
            var_ann,
            field_ann,
            ty,
        } => {
            let (t, tnotes) = ty.extract().map_err(|e| on_instr(instr, &entry, e))?;
            let notes = Notes::Option {
                type_ann: type_ann.clone(),
                some_field: field_ann.clone(),
                some: Box::new(tnotes),
            };
            stack.insert(
                0,
                StackItem::new(Type::option(t.clone()), notes, var_ann.clone()),
            );
            one(Instr::None { ty: t }, stack)
        }

        UInstr::IfNone { if_none, if_some } => {
            need(instr, &entry, 1)?;
            let x = stack.remove(0);
            let inner = match &x.ty {
                Type::Option(t) => (**t).clone(),
                other => {
                    return Err(on_instr(
                        instr,
                        &entry,
                        format!("type mismatch: expected an option, got {}", other),
                    ))
                }
            };
            let (some_notes, some_var) = derive_option_sub(&x.notes, &x.var);
            let none_stack = stack.clone();
            let mut some_stack = stack;
            some_stack.insert(0, StackItem::new(inner, some_notes, some_var));

            let bn = check_seq(checker, if_none, none_stack)?;
            let bs = check_seq(checker, if_some, some_stack)?;
            let (cn, cs, step) = merge_branches(instr, &entry, bn, bs)?;
            Ok((
                vec![Instr::IfNone {
                    if_none: cn,
                    if_some: cs,
                }],
                step,
            ))
        }

        UInstr::Pair {
            type_ann,
            var_ann,
            first_field,
            second_field,
        } => {
            need(instr, &entry, 2)?;
            let p = stack.remove(0);
            let q = stack.remove(0);
            let (derived_var, pf, qf) = derive_pair_anns(first_field, second_field, &p.var, &q.var);
            let var = keep_or(var_ann, &derived_var);
            let notes = Notes::Pair {
                type_ann: type_ann.clone(),
                first_field: pf,
                second_field: qf,
                first: Box::new(p.notes),
                second: Box::new(q.notes),
            };
            stack.insert(0, StackItem::new(Type::pair(p.ty, q.ty), notes, var));
            one(Instr::Pair, stack)
        }

        UInstr::Car { var_ann, field_ann } => {
            need(instr, &entry, 1)?;
            let x = stack.remove(0);
            let (a, _) = match &x.ty {
                Type::Pair(a, b) => ((**a).clone(), (**b).clone()),
                other => {
                    return Err(on_instr(
                        instr,
                        &entry,
                        format!("type mismatch: expected a pair, got {}", other),
                    ))
                }
            };
            let (stored_field, _, first_notes, _) = pair_components(&x.notes);
            converge_anns(field_ann, &stored_field).map_err(|e| ann_err(&entry, e))?;
            let var = derive_car_cdr_var(var_ann, &stored_field, &x.var);
            stack.insert(0, StackItem::new(a, first_notes, var));
            one(Instr::Car, stack)
        }

        UInstr::Cdr { var_ann, field_ann } => {
            need(instr, &entry, 1)?;
            let x = stack.remove(0);
            let b = match &x.ty {
                Type::Pair(_, b) => (**b).clone(),
                other => {
                    return Err(on_instr(
                        instr,
                        &entry,
                        format!("type mismatch: expected a pair, got {}", other),
                    ))
                }
            };
            let (_, stored_field, _, second_notes) = pair_components(&x.notes);
            converge_anns(field_ann, &stored_field).map_err(|e| ann_err(&entry, e))?;
            let var = derive_car_cdr_var(var_ann, &stored_field, &x.var);
            stack.insert(0, StackItem::new(b, second_notes, var));
            one(Instr::Cdr, stack)
        }

        UInstr::Left {
            type_ann,
            var_ann,
            left_field,
            right_field,
            right_ty,
        } => {
            need(instr, &entry, 1)?;
            let x = stack.remove(0);
            let (rt, rnotes) = right_ty.extract().map_err(|e| on_instr(instr, &entry, e))?;
            let notes = Notes::Or {
                type_ann: type_ann.clone(),
                left_field: left_field.clone(),
                right_field: right_field.clone(),
                left: Box::new(x.notes),
                right: Box::new(rnotes),
            };
            stack.insert(
                0,
                StackItem::new(Type::or(x.ty, rt.clone()), notes, var_ann.clone()),
            );
            one(Instr::Left { right_ty: rt }, stack)
        }

        UInstr::Right {
            type_ann,
            var_ann,
            left_field,
            right_field,
            left_ty,
        } => {
            need(instr, &entry, 1)?;
            let x = stack.remove(0);
            let (lt, lnotes) = left_ty.extract().map_err(|e| on_instr(instr, &entry, e))?;
            let notes = Notes::Or {
                type_ann: type_ann.clone(),
                left_field: left_field.clone(),
                right_field: right_field.clone(),
                left: Box::new(lnotes),
                right: Box::new(x.notes),
            };
            stack.insert(
                0,
                StackItem::new(Type::or(lt.clone(), x.ty), notes, var_ann.clone()),
            );
            one(Instr::Right { left_ty: lt }, stack)
        }

        UInstr::IfLeft { if_left, if_right } => {
            need(instr, &entry, 1)?;
            let x = stack.remove(0);
            let (ta, tb) = match &x.ty {
                Type::Or(a, b) => ((**a).clone(), (**b).clone()),
                other => {
                    return Err(on_instr(
                        instr,
                        &entry,
                        format!("type mismatch: expected a union, got {}", other),
                    ))
                }
            };
            let (ln, rn, lv, rv) = derive_or_sub(&x.notes, &x.var);
            let mut left_stack = stack.clone();
            left_stack.insert(0, StackItem::new(ta, ln, lv));
            let mut right_stack = stack;
            right_stack.insert(0, StackItem::new(tb, rn, rv));

            let bl = check_seq(checker, if_left, left_stack)?;
            let br = check_seq(checker, if_right, right_stack)?;
            let (cl, cr, step) = merge_branches(instr, &entry, bl, br)?;
            Ok((
                vec![Instr::IfLeft {
                    if_left: cl,
                    if_right: cr,
                }],
                step,
            ))
        }

        UInstr::Nil {
            type_ann,
            var_ann,
            ty,
        } => {
            let (t, tnotes) = ty.extract().map_err(|e| on_instr(instr, &entry, e))?;
            let notes = Notes::Elem {
                type_ann: type_ann.clone(),
                elem: Box::new(tnotes),
            };
            stack.insert(
                0,
                StackItem::new(Type::list(t.clone()), notes, var_ann.clone()),
            );
            one(Instr::Nil { ty: t }, stack)
        }

        UInstr::Cons { var_ann } => {
            need(instr, &entry, 2)?;
            let head = stack.remove(0);
            let list = stack.remove(0);
            match &list.ty {
                Type::List(elem) if **elem == head.ty => {}
                other => {
                    return Err(on_instr(
                        instr,
                        &entry,
                        format!("type mismatch: cannot cons {} onto {}", head.ty, other),
                    ))
                }
            }
            let candidate = Notes::Elem {
                type_ann: TypeAnn::none(),
                elem: Box::new(head.notes),
            };
            let notes = converge(&list.notes, &candidate).map_err(|e| ann_err(&entry, e))?;
            stack.insert(0, StackItem::new(list.ty, notes, var_ann.clone()));
            one(Instr::Cons, stack)
        }

        UInstr::IfCons { if_cons, if_nil } => {
            need(instr, &entry, 1)?;
            let list = stack.remove(0);
            let elem = match &list.ty {
                Type::List(t) => (**t).clone(),
                other => {
                    return Err(on_instr(
                        instr,
                        &entry,
                        format!("type mismatch: expected a list, got {}", other),
                    ))
                }
            };
            let elem_notes = elem_child(&list.notes);
            let nil_stack = stack.clone();
            let mut cons_stack = stack;
            cons_stack.insert(
                0,
                StackItem::new(list.ty.clone(), list.notes.clone(), derive_var("tl", &list.var)),
            );
            cons_stack.insert(
                0,
                StackItem::new(elem, elem_notes, derive_var("hd", &list.var)),
            );

            let bc = check_seq(checker, if_cons, cons_stack)?;
            let bn = check_seq(checker, if_nil, nil_stack)?;
            let (cc, cn, step) = merge_branches(instr, &entry, bc, bn)?;
            Ok((
                vec![Instr::IfCons {
                    if_cons: cc,
                    if_nil: cn,
                }],
                step,
            ))
        }

        UInstr::EmptySet {
            type_ann,
            var_ann,
            elem_ty,
        } => {
            let (t, tnotes) = elem_ty.extract().map_err(|e| on_instr(instr, &entry, e))?;
            let elem = t.as_comparable().ok_or_else(|| {
                on_instr(
                    instr,
                    &entry,
                    format!("set element type must be comparable, got {}", t),
                )
            })?;
            let notes = Notes::Elem {
                type_ann: type_ann.clone(),
                elem: Box::new(tnotes),
            };
            stack.insert(0, StackItem::new(Type::Set(elem), notes, var_ann.clone()));
            one(Instr::EmptySet { elem }, stack)
        }

        UInstr::EmptyMap {
            type_ann,
            var_ann,
            key_ty,
            value_ty,
        } => {
            let (kt, knotes) = key_ty.extract().map_err(|e| on_instr(instr, &entry, e))?;
            let key = kt.as_comparable().ok_or_else(|| {
                on_instr(
                    instr,
                    &entry,
                    format!("map key type must be comparable, got {}", kt),
                )
            })?;
            let (vt, vnotes) = value_ty.extract().map_err(|e| on_instr(instr, &entry, e))?;
            let notes = Notes::Entry {
                type_ann: type_ann.clone(),
                key: Box::new(knotes),
                value: Box::new(vnotes),
            };
            stack.insert(
                0,
                StackItem::new(
                    Type::Map(key, Box::new(vt.clone())),
                    notes,
                    var_ann.clone(),
                ),
            );
            one(Instr::EmptyMap { key, value: vt }, stack)
        }

        UInstr::Map { var_ann, body } => {
            need(instr, &entry, 1)?;
            let coll = stack.remove(0);
            let rest = stack;
            match &coll.ty {
                Type::List(elem) => {
                    let elem_notes = elem_child(&coll.notes);
                    let mut body_stack = rest.clone();
                    body_stack.insert(
                        0,
                        StackItem::new(
                            (**elem).clone(),
                            elem_notes,
                            derive_var("elt", &coll.var),
                        ),
                    );
                    let checked = check_seq(checker, body, body_stack)?;
                    let (code, mut out) = match checked {
                        SomeInstr::Typed(code, out) => (code, out),
                        SomeInstr::AnyOut(_) => {
                            return Err(on_instr(
                                instr,
                                &entry,
                                "MAP body may not fail unconditionally",
                            ))
                        }
                    };
                    if out.len() != rest.len() + 1 {
                        return Err(on_instr(
                            instr,
                            &entry,
                            "MAP body must produce exactly one new element",
                        ));
                    }
                    let new_elem = out.remove(0);
                    for (got, expected) in out.iter().zip(rest.iter()) {
                        if got.ty != expected.ty {
                            return Err(on_instr(
                                instr,
                                &entry,
                                "MAP body may not change the rest of the stack",
                            ));
                        }
                    }
                    let notes = Notes::Elem {
                        type_ann: TypeAnn::none(),
                        elem: Box::new(new_elem.notes),
                    };
                    out.insert(
                        0,
                        StackItem::new(Type::list(new_elem.ty), notes, var_ann.clone()),
                    );
                    one(Instr::Map { body: code }, out)
                }
                Type::Map(key, val) => {
                    let (key_notes, val_notes) = entry_children(&coll.notes);
                    let pair_ty = Type::pair(Type::Comparable(*key), (**val).clone());
                    let pair_notes = Notes::Pair {
                        type_ann: TypeAnn::none(),
                        first_field: FieldAnn::none(),
                        second_field: FieldAnn::none(),
                        first: Box::new(key_notes.clone()),
                        second: Box::new(val_notes),
                    };
                    let mut body_stack = rest.clone();
                    body_stack.insert(
                        0,
                        StackItem::new(pair_ty, pair_notes, derive_var("elt", &coll.var)),
                    );
                    let checked = check_seq(checker, body, body_stack)?;
                    let (code, mut out) = match checked {
                        SomeInstr::Typed(code, out) => (code, out),
                        SomeInstr::AnyOut(_) => {
                            return Err(on_instr(
                                instr,
                                &entry,
                                "MAP body may not fail unconditionally",
                            ))
                        }
                    };
                    if out.len() != rest.len() + 1 {
                        return Err(on_instr(
                            instr,
                            &entry,
                            "MAP body must produce exactly one new element",
                        ));
                    }
                    let new_val = out.remove(0);
                    for (got, expected) in out.iter().zip(rest.iter()) {
                        if got.ty != expected.ty {
                            return Err(on_instr(
                                instr,
                                &entry,
                                "MAP body may not change the rest of the stack",
                            ));
                        }
                    }
                    let notes = Notes::Entry {
                        type_ann: TypeAnn::none(),
                        key: Box::new(key_notes),
                        value: Box::new(new_val.notes),
                    };
                    out.insert(
                        0,
                        StackItem::new(
                            Type::Map(*key, Box::new(new_val.ty)),
                            notes,
                            var_ann.clone(),
                        ),
                    );
                    one(Instr::Map { body: code }, out)
                }
                other => Err(on_instr(
                    instr,
                    &entry,
                    format!("type mismatch: MAP expects a list or map, got {}", other),
                )),
            }
        }

        UInstr::Iter { body } => {
            need(instr, &entry, 1)?;
            let coll = stack.remove(0);
            let rest = stack;
            let (elem_ty, elem_notes) = match &coll.ty {
                Type::List(t) => ((**t).clone(), elem_child(&coll.notes)),
                Type::Set(c) => (Type::Comparable(*c), elem_child(&coll.notes)),
                Type::Map(k, v) => {
                    let (kn, vn) = entry_children(&coll.notes);
                    (
                        Type::pair(Type::Comparable(*k), (**v).clone()),
                        Notes::Pair {
                            type_ann: TypeAnn::none(),
                            first_field: FieldAnn::none(),
                            second_field: FieldAnn::none(),
                            first: Box::new(kn),
                            second: Box::new(vn),
                        },
                    )
                }
                other => {
                    return Err(on_instr(
                        instr,
                        &entry,
                        format!(
                            "type mismatch: ITER expects a list, set or map, got {}",
                            other
                        ),
                    ))
                }
            };
            let mut body_stack = rest.clone();
            body_stack.insert(
                0,
                StackItem::new(elem_ty, elem_notes, derive_var("elt", &coll.var)),
            );
            let checked = check_seq(checker, body, body_stack)?;
            let (code, out) = match checked {
                SomeInstr::Typed(code, out) => (code, out),
                SomeInstr::AnyOut(_) => {
                    return Err(on_instr(
                        instr,
                        &entry,
                        "ITER body may not fail unconditionally",
                    ))
                }
            };
            if out.len() != rest.len() {
                return Err(on_instr(
                    instr,
                    &entry,
                    "ITER body must consume exactly the element",
                ));
            }
            for (got, expected) in out.iter().zip(rest.iter()) {
                if got.ty != expected.ty {
                    return Err(on_instr(
                        instr,
                        &entry,
                        "ITER body may not change the rest of the stack",
                    ));
                }
            }
            one(Instr::Iter { body: code }, out)
        }

        UInstr::Mem { var_ann } => {
            need(instr, &entry, 2)?;
            let key = stack.remove(0);
            let coll = stack.remove(0);
            if !prim::mem_ok(&key.ty, &coll.ty) {
                return Err(on_instr(instr, &entry, "type mismatch"));
            }
            stack.insert(
                0,
                StackItem::new(Type::bool(), Notes::Star, var_ann.clone()),
            );
            one(Instr::Mem, stack)
        }

        UInstr::Get { var_ann } => {
            need(instr, &entry, 2)?;
            let key = stack.remove(0);
            let coll = stack.remove(0);
            let result = prim::get_result(&key.ty, &coll.ty)
                .ok_or_else(|| on_instr(instr, &entry, "type mismatch"))?;
            let (_, val_notes) = entry_children(&coll.notes);
            let notes = Notes::Option {
                type_ann: TypeAnn::none(),
                some_field: FieldAnn::none(),
                some: Box::new(val_notes),
            };
            stack.insert(0, StackItem::new(result, notes, var_ann.clone()));
            one(Instr::Get, stack)
        }

        UInstr::Update { var_ann } => {
            need(instr, &entry, 3)?;
            let key = stack.remove(0);
            let arg = stack.remove(0);
            let coll = stack.remove(0);
            if !prim::update_ok(&key.ty, &arg.ty, &coll.ty) {
                return Err(on_instr(instr, &entry, "type mismatch"));
            }
            let var = keep_or(var_ann, &coll.var);
            stack.insert(0, StackItem::new(coll.ty, coll.notes, var));
            one(Instr::Update, stack)
        }

        UInstr::Size { var_ann } => {
            need(instr, &entry, 1)?;
            let coll = stack.remove(0);
            if !prim::size_ok(&coll.ty) {
                return Err(on_instr(instr, &entry, "type mismatch"));
            }
            stack.insert(0, StackItem::new(Type::nat(), Notes::Star, var_ann.clone()));
            one(Instr::Size, stack)
        }

        UInstr::Concat { var_ann } => {
            need(instr, &entry, 1)?;
            if let Some(result) = prim::concat_list_result(&stack[0].ty) {
                let elem = result
                    .as_comparable()
                    .expect("list CONCAT results are string or bytes");
                let _ = stack.remove(0);
                stack.insert(0, StackItem::new(result, Notes::Star, var_ann.clone()));
                return one(Instr::ConcatList { elem }, stack);
            }
            need(instr, &entry, 2)?;
            let a = stack.remove(0);
            let b = stack.remove(0);
            if !prim::concat_ok(&a.ty, &b.ty) {
                return Err(on_instr(instr, &entry, "type mismatch"));
            }
            let notes = converge(&a.notes, &b.notes).map_err(|e| ann_err(&entry, e))?;
            stack.insert(0, StackItem::new(a.ty, notes, var_ann.clone()));
            one(Instr::Concat, stack)
        }

        UInstr::Slice { var_ann } => {
            need(instr, &entry, 3)?;
            let offset = stack.remove(0);
            let length = stack.remove(0);
            let seq = stack.remove(0);
            let result = prim::slice_result(&offset.ty, &length.ty, &seq.ty)
                .ok_or_else(|| on_instr(instr, &entry, "type mismatch"))?;
            stack.insert(0, StackItem::new(result, Notes::Star, var_ann.clone()));
            one(Instr::Slice, stack)
        }

        UInstr::If { if_true, if_false } => {
            need(instr, &entry, 1)?;
            let cond = stack.remove(0);
            if cond.ty.as_comparable() != Some(Comparable::Bool) {
                return Err(on_instr(
                    instr,
                    &entry,
                    format!("type mismatch: expected bool, got {}", cond.ty),
                ));
            }
            let bt = check_seq(checker, if_true, stack.clone())?;
            let bf = check_seq(checker, if_false, stack)?;
            let (ct, cf, step) = merge_branches(instr, &entry, bt, bf)?;
            Ok((
                vec![Instr::If {
                    if_true: ct,
                    if_false: cf,
                }],
                step,
            ))
        }

        UInstr::Loop { body } => {
            need(instr, &entry, 1)?;
            let cond = stack.remove(0);
            if cond.ty.as_comparable() != Some(Comparable::Bool) {
                return Err(on_instr(
                    instr,
                    &entry,
                    format!("type mismatch: expected bool, got {}", cond.ty),
                ));
            }
            let rest = stack;
            let checked = check_seq(checker, body, rest.clone())?;
            match checked {
                SomeInstr::Typed(code, mut out) => {
                    if out.is_empty() || out[0].ty.as_comparable() != Some(Comparable::Bool) {
                        return Err(on_instr(
                            instr,
                            &entry,
                            "LOOP body must leave bool on top",
                        ));
                    }
                    out.remove(0);
                    if out.len() != rest.len()
                        || out.iter().zip(rest.iter()).any(|(a, b)| a.ty != b.ty)
                    {
                        return Err(on_instr(
                            instr,
                            &entry,
                            "LOOP body may not change the rest of the stack",
                        ));
                    }
                    one(Instr::Loop { body: code }, out)
                }
                SomeInstr::AnyOut(code) => one(Instr::Loop { body: code }, rest),
            }
        }

        UInstr::LoopLeft { body } => {
            need(instr, &entry, 1)?;
            let x = stack.remove(0);
            let (ta, tb) = match &x.ty {
                Type::Or(a, b) => ((**a).clone(), (**b).clone()),
                other => {
                    return Err(on_instr(
                        instr,
                        &entry,
                        format!("type mismatch: expected a union, got {}", other),
                    ))
                }
            };
            let (ln, rn, lv, rv) = derive_or_sub(&x.notes, &x.var);
            let rest = stack;
            let mut body_stack = rest.clone();
            body_stack.insert(0, StackItem::new(ta, ln, lv));
            let checked = check_seq(checker, body, body_stack)?;
            let exit_item = StackItem::new(tb, rn, rv);
            match checked {
                SomeInstr::Typed(code, mut out) => {
                    if out.is_empty() || out[0].ty != x.ty {
                        return Err(on_instr(
                            instr,
                            &entry,
                            "LOOP_LEFT body must leave the union back on top",
                        ));
                    }
                    out.remove(0);
                    if out.len() != rest.len()
                        || out.iter().zip(rest.iter()).any(|(a, b)| a.ty != b.ty)
                    {
                        return Err(on_instr(
                            instr,
                            &entry,
                            "LOOP_LEFT body may not change the rest of the stack",
                        ));
                    }
                    out.insert(0, exit_item);
                    one(Instr::LoopLeft { body: code }, out)
                }
                SomeInstr::AnyOut(code) => {
                    let mut out = rest;
                    out.insert(0, exit_item);
                    one(Instr::LoopLeft { body: code }, out)
                }
            }
        }

        UInstr::Lambda {
            var_ann,
            arg_ty,
            ret_ty,
            body,
        } => {
            let (arg, arg_notes) = arg_ty.extract().map_err(|e| on_instr(instr, &entry, e))?;
            let (ret, ret_notes) = ret_ty.extract().map_err(|e| on_instr(instr, &entry, e))?;
            // A lambda body sees only its argument; SELF is unavailable.
            let mut sub = Checker::new(None);
            let input = vec![StackItem::new(arg.clone(), arg_notes.clone(), VarAnn::none())];
            let checked = check_seq(&mut sub, body, input)?;
            let code = match checked {
                SomeInstr::AnyOut(code) => code,
                SomeInstr::Typed(code, out) => {
                    if out.len() != 1 || out[0].ty != ret {
                        return Err(on_instr(
                            instr,
                            &entry,
                            format!(
                                "lambda body must produce exactly {}, got {}",
                                ret,
                                super::fmt_stack(&out)
                            ),
                        ));
                    }
                    code
                }
            };
            let notes = Notes::Entry {
                type_ann: TypeAnn::none(),
                key: Box::new(arg_notes),
                value: Box::new(ret_notes),
            };
            let lambda = Lambda {
                arg: arg.clone(),
                ret: ret.clone(),
                code,
            };
            stack.insert(
                0,
                StackItem::new(Type::lambda(arg, ret), notes, var_ann.clone()),
            );
            one(Instr::Lambda { lambda }, stack)
        }

        UInstr::Exec { var_ann } => {
            need(instr, &entry, 2)?;
            let arg = stack.remove(0);
            let lam = stack.remove(0);
            let ret = match &lam.ty {
                Type::Lambda(a, r) if **a == arg.ty => (**r).clone(),
                other => {
                    return Err(on_instr(
                        instr,
                        &entry,
                        format!("type mismatch: cannot apply {} to {}", other, arg.ty),
                    ))
                }
            };
            let (_, ret_notes) = entry_children(&lam.notes);
            stack.insert(0, StackItem::new(ret, ret_notes, var_ann.clone()));
            one(Instr::Exec, stack)
        }

        UInstr::Dip { body } => {
            need(instr, &entry, 1)?;
            let top = stack.remove(0);
            let checked = check_seq(checker, body, stack)?;
            match checked {
                SomeInstr::Typed(code, mut out) => {
                    out.insert(0, top);
                    one(Instr::Dip { body: code }, out)
                }
                SomeInstr::AnyOut(code) => {
                    Ok((vec![Instr::Dip { body: code }], StepOut::Fail))
                }
            }
        }

        UInstr::Failwith => {
            need(instr, &entry, 1)?;
            Ok((vec![Instr::Failwith], StepOut::Fail))
        }

        UInstr::Cast { var_ann, ty } => {
            need(instr, &entry, 1)?;
            let top = stack.remove(0);
            let (t, n) = ty.extract().map_err(|e| on_instr(instr, &entry, e))?;
            require_eq(&t, &top.ty).map_err(|e| on_instr(instr, &entry, e))?;
            let notes = converge(&top.notes, &n).map_err(|e| ann_err(&entry, e))?;
            let var = keep_or(var_ann, &top.var);
            stack.insert(0, StackItem::new(top.ty, notes, var));
            one(Instr::Cast, stack)
        }

        UInstr::Rename { var_ann } => {
            need(instr, &entry, 1)?;
            stack[0].var = var_ann.clone();
            one(Instr::Rename, stack)
        }

        UInstr::Add { var_ann } => binary_arith(instr, entry, stack, var_ann, Instr::Add, prim::add_result),
        UInstr::Sub { var_ann } => binary_arith(instr, entry, stack, var_ann, Instr::Sub, prim::sub_result),
        UInstr::Mul { var_ann } => binary_arith(instr, entry, stack, var_ann, Instr::Mul, prim::mul_result),
        UInstr::Ediv { var_ann } => binary_arith(instr, entry, stack, var_ann, Instr::Ediv, prim::ediv_result),
        UInstr::And { var_ann } => binary_arith(instr, entry, stack, var_ann, Instr::And, prim::logic_result),
        UInstr::Or { var_ann } => binary_arith(instr, entry, stack, var_ann, Instr::Or, prim::logic_result),
        UInstr::Xor { var_ann } => binary_arith(instr, entry, stack, var_ann, Instr::Xor, prim::logic_result),
        UInstr::Lsl { var_ann } => binary_arith(instr, entry, stack, var_ann, Instr::Lsl, prim::shift_result),
        UInstr::Lsr { var_ann } => binary_arith(instr, entry, stack, var_ann, Instr::Lsr, prim::shift_result),

        UInstr::Abs { var_ann } => unary_arith(instr, entry, stack, var_ann, Instr::Abs, prim::abs_result),
        UInstr::Neg { var_ann } => unary_arith(instr, entry, stack, var_ann, Instr::Neg, prim::neg_result),
        UInstr::Not { var_ann } => unary_arith(instr, entry, stack, var_ann, Instr::Not, prim::not_result),
        UInstr::Int { var_ann } => unary_arith(instr, entry, stack, var_ann, Instr::Int, prim::int_result),

        UInstr::Compare { var_ann } => {
            need(instr, &entry, 2)?;
            let a = stack.remove(0);
            let b = stack.remove(0);
            if !prim::compare_ok(&a.ty, &b.ty) || a.ty != b.ty {
                return Err(on_instr(instr, &entry, "type mismatch"));
            }
            stack.insert(0, StackItem::new(Type::int(), Notes::Star, var_ann.clone()));
            one(Instr::Compare, stack)
        }

        UInstr::Eq { var_ann } => sign_test(instr, entry, stack, var_ann, Instr::Eq),
        UInstr::Neq { var_ann } => sign_test(instr, entry, stack, var_ann, Instr::Neq),
        UInstr::Lt { var_ann } => sign_test(instr, entry, stack, var_ann, Instr::Lt),
        UInstr::Gt { var_ann } => sign_test(instr, entry, stack, var_ann, Instr::Gt),
        UInstr::Le { var_ann } => sign_test(instr, entry, stack, var_ann, Instr::Le),
        UInstr::Ge { var_ann } => sign_test(instr, entry, stack, var_ann, Instr::Ge),

        UInstr::Now { var_ann } => {
            stack.insert(
                0,
                StackItem::new(Type::timestamp(), Notes::Star, var_or(var_ann, "now")),
            );
            one(Instr::Now, stack)
        }

        UInstr::Amount { var_ann } => {
            stack.insert(
                0,
                StackItem::new(Type::mutez(), Notes::Star, var_or(var_ann, "amount")),
            );
            one(Instr::Amount, stack)
        }

        UInstr::Balance { var_ann } => {
            stack.insert(
                0,
                StackItem::new(Type::mutez(), Notes::Star, var_or(var_ann, "balance")),
            );
            one(Instr::Balance, stack)
        }

        UInstr::Sender { var_ann } => {
            stack.insert(
                0,
                StackItem::new(Type::address(), Notes::Star, var_or(var_ann, "sender")),
            );
            one(Instr::Sender, stack)
        }

        UInstr::Source { var_ann } => {
            stack.insert(
                0,
                StackItem::new(Type::address(), Notes::Star, var_or(var_ann, "source")),
            );
            one(Instr::Source, stack)
        }

        UInstr::SelfContract { var_ann } => {
            let (param_ty, param_notes) = checker.self_param.clone().ok_or_else(|| {
                on_instr(instr, &entry, "SELF is only available inside contract code")
            })?;
            let notes = Notes::Elem {
                type_ann: TypeAnn::none(),
                elem: Box::new(param_notes),
            };
            stack.insert(
                0,
                StackItem::new(Type::contract(param_ty), notes, var_or(var_ann, "self")),
            );
            one(Instr::SelfContract, stack)
        }

        UInstr::Address { var_ann } => {
            need(instr, &entry, 1)?;
            let x = stack.remove(0);
            if !matches!(x.ty, Type::Contract(_)) {
                return Err(on_instr(
                    instr,
                    &entry,
                    format!("type mismatch: expected a contract, got {}", x.ty),
                ));
            }
            stack.insert(
                0,
                StackItem::new(Type::address(), Notes::Star, var_or(var_ann, "address")),
            );
            one(Instr::Address, stack)
        }

        UInstr::Contract { var_ann, param_ty } => {
            need(instr, &entry, 1)?;
            let x = stack.remove(0);
            if x.ty.as_comparable() != Some(Comparable::Address) {
                return Err(on_instr(
                    instr,
                    &entry,
                    format!("type mismatch: expected address, got {}", x.ty),
                ));
            }
            let (t, tnotes) = param_ty.extract().map_err(|e| on_instr(instr, &entry, e))?;
            let notes = Notes::Option {
                type_ann: TypeAnn::none(),
                some_field: FieldAnn::none(),
                some: Box::new(Notes::Elem {
                    type_ann: TypeAnn::none(),
                    elem: Box::new(tnotes),
                }),
            };
            stack.insert(
                0,
                StackItem::new(
                    Type::option(Type::contract(t.clone())),
                    notes,
                    var_ann.clone(),
                ),
            );
            one(Instr::Contract { param_ty: t }, stack)
        }

        UInstr::ImplicitAccount { var_ann } => {
            need(instr, &entry, 1)?;
            let x = stack.remove(0);
            if x.ty.as_comparable() != Some(Comparable::KeyHash) {
                return Err(on_instr(
                    instr,
                    &entry,
                    format!("type mismatch: expected key_hash, got {}", x.ty),
                ));
            }
            stack.insert(
                0,
                StackItem::new(
                    Type::contract(Type::Unit),
                    Notes::Star,
                    var_ann.clone(),
                ),
            );
            one(Instr::ImplicitAccount, stack)
        }

        UInstr::TransferTokens { var_ann } => {
            need(instr, &entry, 3)?;
            let param = stack.remove(0);
            let amount = stack.remove(0);
            let dest = stack.remove(0);
            if amount.ty.as_comparable() != Some(Comparable::Mutez) {
                return Err(on_instr(
                    instr,
                    &entry,
                    format!("type mismatch: expected mutez, got {}", amount.ty),
                ));
            }
            match &dest.ty {
                Type::Contract(p) if **p == param.ty => {}
                other => {
                    return Err(on_instr(
                        instr,
                        &entry,
                        format!(
                            "type mismatch: cannot pass {} to {}",
                            param.ty, other
                        ),
                    ))
                }
            }
            stack.insert(
                0,
                StackItem::new(Type::Operation, Notes::Star, var_ann.clone()),
            );
            one(
                Instr::TransferTokens {
                    param_ty: param.ty,
                },
                stack,
            )
        }

        UInstr::SetDelegate { var_ann } => {
            need(instr, &entry, 1)?;
            let x = stack.remove(0);
            match &x.ty {
                Type::Option(t) if t.as_comparable() == Some(Comparable::KeyHash) => {}
                other => {
                    return Err(on_instr(
                        instr,
                        &entry,
                        format!("type mismatch: expected (option key_hash), got {}", other),
                    ))
                }
            }
            stack.insert(
                0,
                StackItem::new(Type::Operation, Notes::Star, var_ann.clone()),
            );
            one(Instr::SetDelegate, stack)
        }

        UInstr::CreateAccount { op_var, addr_var } => {
            need(instr, &entry, 4)?;
            let manager = stack.remove(0);
            let delegate = stack.remove(0);
            let spendable = stack.remove(0);
            let balance = stack.remove(0);
            check_account_prefix(instr, &entry, &manager, &delegate, &spendable, &balance)?;
            stack.insert(
                0,
                StackItem::new(Type::address(), Notes::Star, addr_var.clone()),
            );
            stack.insert(
                0,
                StackItem::new(Type::Operation, Notes::Star, op_var.clone()),
            );
            one(Instr::CreateAccount, stack)
        }

        UInstr::CreateContract {
            op_var,
            addr_var,
            param_ty,
            storage_ty,
            code,
        } => {
            need(instr, &entry, 6)?;
            let manager = stack.remove(0);
            let delegate = stack.remove(0);
            let spendable = stack.remove(0);
            let delegatable = stack.remove(0);
            let balance = stack.remove(0);
            let storage = stack.remove(0);
            check_account_prefix(instr, &entry, &manager, &delegate, &spendable, &balance)?;
            if delegatable.ty.as_comparable() != Some(Comparable::Bool) {
                return Err(on_instr(
                    instr,
                    &entry,
                    format!("type mismatch: expected bool, got {}", delegatable.ty),
                ));
            }
            let inner = UContract {
                parameter: param_ty.clone(),
                storage: storage_ty.clone(),
                code: code.clone(),
            };
            let typed = super::typecheck_contract(&inner)?;
            require_eq(&typed.storage_ty, &storage.ty).map_err(|e| on_instr(instr, &entry, e))?;
            stack.insert(
                0,
                StackItem::new(Type::address(), Notes::Star, addr_var.clone()),
            );
            stack.insert(
                0,
                StackItem::new(Type::Operation, Notes::Star, op_var.clone()),
            );
            one(
                Instr::CreateContract {
                    param_ty: typed.param_ty,
                    storage_ty: typed.storage_ty,
                    code: typed.code,
                },
                stack,
            )
        }

        UInstr::Ext(ext_instr) => ext::check_ext(checker, ext_instr, stack),
    }
}

/// The shared `key_hash : option key_hash : bool : mutez` prefix of the
/// account-creating instructions.
fn check_account_prefix(
    instr: &UInstr,
    entry: &Hst,
    manager: &StackItem,
    delegate: &StackItem,
    spendable: &StackItem,
    balance: &StackItem,
) -> Result<(), TcError> {
    if manager.ty.as_comparable() != Some(Comparable::KeyHash) {
        return Err(on_instr(
            instr,
            entry,
            format!("type mismatch: expected key_hash, got {}", manager.ty),
        ));
    }
    match &delegate.ty {
        Type::Option(t) if t.as_comparable() == Some(Comparable::KeyHash) => {}
        other => {
            return Err(on_instr(
                instr,
                entry,
                format!("type mismatch: expected (option key_hash), got {}", other),
            ))
        }
    }
    if spendable.ty.as_comparable() != Some(Comparable::Bool) {
        return Err(on_instr(
            instr,
            entry,
            format!("type mismatch: expected bool, got {}", spendable.ty),
        ));
    }
    if balance.ty.as_comparable() != Some(Comparable::Mutez) {
        return Err(on_instr(
            instr,
            entry,
            format!("type mismatch: expected mutez, got {}", balance.ty),
        ));
    }
    Ok(())
}

fn binary_arith(
    instr: &UInstr,
    entry: Hst,
    mut stack: Hst,
    var_ann: &VarAnn,
    typed: Instr,
    table: fn(&Type, &Type) -> Option<Type>,
) -> Result<(Vec<Instr>, StepOut), TcError> {
    need(instr, &entry, 2)?;
    let a = stack.remove(0);
    let b = stack.remove(0);
    let result =
        table(&a.ty, &b.ty).ok_or_else(|| on_instr(instr, &entry, "type mismatch"))?;
    stack.insert(0, StackItem::new(result, Notes::Star, var_ann.clone()));
    Ok((vec![typed], StepOut::Stack(stack)))
}

fn unary_arith(
    instr: &UInstr,
    entry: Hst,
    mut stack: Hst,
    var_ann: &VarAnn,
    typed: Instr,
    table: fn(&Type) -> Option<Type>,
) -> Result<(Vec<Instr>, StepOut), TcError> {
    need(instr, &entry, 1)?;
    let a = stack.remove(0);
    let result = table(&a.ty).ok_or_else(|| on_instr(instr, &entry, "type mismatch"))?;
    stack.insert(0, StackItem::new(result, Notes::Star, var_ann.clone()));
    Ok((vec![typed], StepOut::Stack(stack)))
}

fn sign_test(
    instr: &UInstr,
    entry: Hst,
    mut stack: Hst,
    var_ann: &VarAnn,
    typed: Instr,
) -> Result<(Vec<Instr>, StepOut), TcError> {
    need(instr, &entry, 1)?;
    let a = stack.remove(0);
    if !prim::sign_test_ok(&a.ty) {
        return Err(on_instr(instr, &entry, "type mismatch"));
    }
    stack.insert(0, StackItem::new(Type::bool(), Notes::Star, var_ann.clone()));
    Ok((vec![typed], StepOut::Stack(stack)))
}
