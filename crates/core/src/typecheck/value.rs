//! Value checking: untyped literals against an expected type.

use std::collections::{BTreeMap, BTreeSet};

use num_traits::Signed;

use super::{Checker, Hst, SomeInstr, StackItem, TcError};
use crate::instr::Lambda;
use crate::ty::{Comparable, Type};
use crate::untyped::UValue;
use crate::value::{Address, KeyHash, Mutez, PublicKey, Signature, Value};

fn fail(value: &UValue, expected: &Type, message: impl Into<String>) -> TcError {
    TcError::FailedOnValue {
        value: value.clone(),
        expected: expected.clone(),
        message: message.into(),
    }
}

/// Check an untyped value literal against an expected type, producing the
/// corresponding typed value.
pub fn typecheck_value(value: &UValue, expected: &Type) -> Result<Value, TcError> {
    match (value, expected) {
        (UValue::Int(i), Type::Comparable(Comparable::Int)) => Ok(Value::Int(i.clone())),
        (UValue::Int(i), Type::Comparable(Comparable::Nat)) => {
            if i.is_negative() {
                Err(fail(value, expected, "nat literals may not be negative"))
            } else {
                Ok(Value::Nat(i.clone()))
            }
        }
        (UValue::Int(i), Type::Comparable(Comparable::Mutez)) => {
            let raw = u64::try_from(i.clone())
                .ok()
                .and_then(Mutez::new)
                .ok_or_else(|| fail(value, expected, "mutez literal out of range"))?;
            Ok(Value::Mutez(raw))
        }
        (UValue::Int(i), Type::Comparable(Comparable::Timestamp)) => {
            let seconds = i64::try_from(i.clone())
                .map_err(|_| fail(value, expected, "timestamp literal out of range"))?;
            Ok(Value::Timestamp(seconds))
        }
        (UValue::String(s), Type::Comparable(Comparable::String)) => {
            Ok(Value::String(s.clone()))
        }
        (UValue::String(s), Type::Comparable(Comparable::Address)) => {
            let addr: Address = s.parse().map_err(|e| fail(value, expected, e))?;
            Ok(Value::Address(addr))
        }
        (UValue::String(s), Type::Comparable(Comparable::KeyHash)) => {
            let kh: KeyHash = s.parse().map_err(|e| fail(value, expected, e))?;
            Ok(Value::KeyHash(kh))
        }
        // A contract literal is an address; the handle's parameter type
        // is whatever the expected type declares.
        (UValue::String(s), Type::Contract(_)) => {
            let addr: Address = s.parse().map_err(|e| fail(value, expected, e))?;
            Ok(Value::Contract(addr))
        }
        (UValue::Bytes(b), Type::Comparable(Comparable::Bytes)) => Ok(Value::Bytes(b.clone())),
        (UValue::Bytes(b), Type::Key) => Ok(Value::Key(PublicKey(b.clone()))),
        (UValue::Bytes(b), Type::Signature) => Ok(Value::Signature(Signature(b.clone()))),
        (UValue::True, Type::Comparable(Comparable::Bool)) => Ok(Value::Bool(true)),
        (UValue::False, Type::Comparable(Comparable::Bool)) => Ok(Value::Bool(false)),
        (UValue::Unit, Type::Unit) => Ok(Value::Unit),
        (UValue::Pair(a, b), Type::Pair(ta, tb)) => Ok(Value::pair(
            typecheck_value(a, ta)?,
            typecheck_value(b, tb)?,
        )),
        (UValue::Left(v), Type::Or(tl, _)) => {
            Ok(Value::Left(Box::new(typecheck_value(v, tl)?)))
        }
        (UValue::Right(v), Type::Or(_, tr)) => {
            Ok(Value::Right(Box::new(typecheck_value(v, tr)?)))
        }
        (UValue::Some(v), Type::Option(t)) => Ok(Value::some(typecheck_value(v, t)?)),
        (UValue::None, Type::Option(_)) => Ok(Value::none()),
        (UValue::Seq(items), Type::List(t)) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(typecheck_value(item, t)?);
            }
            Ok(Value::List(out))
        }
        (UValue::Seq(items), Type::Set(elem)) => {
            let elem_ty = Type::Comparable(*elem);
            let mut out = BTreeSet::new();
            for item in items {
                let v = typecheck_value(item, &elem_ty)?;
                if !out.insert(v) {
                    return Err(fail(value, expected, "duplicate element in set literal"));
                }
            }
            Ok(Value::Set(out))
        }
        (UValue::Map(entries), Type::Map(key, val)) => {
            Ok(Value::Map(check_entries(value, expected, entries, *key, val)?))
        }
        (UValue::Map(entries), Type::BigMap(key, val)) => Ok(Value::BigMap(check_entries(
            value, expected, entries, *key, val,
        )?)),
        (UValue::Lambda(body), Type::Lambda(arg, ret)) => {
            let input: Hst = vec![StackItem::plain((**arg).clone())];
            let mut checker = Checker::new(None);
            let checked = super::instr::check_seq(&mut checker, body, input)?;
            match checked {
                SomeInstr::AnyOut(code) => Ok(Value::Lambda(Lambda {
                    arg: (**arg).clone(),
                    ret: (**ret).clone(),
                    code,
                })),
                SomeInstr::Typed(code, out) => {
                    if out.len() != 1 || out[0].ty != **ret {
                        return Err(fail(
                            value,
                            expected,
                            "lambda body does not produce the declared result",
                        ));
                    }
                    Ok(Value::Lambda(Lambda {
                        arg: (**arg).clone(),
                        ret: (**ret).clone(),
                        code,
                    }))
                }
            }
        }
        _ => Err(fail(
            value,
            expected,
            format!("literal does not fit type {}", expected),
        )),
    }
}

fn check_entries(
    whole: &UValue,
    expected: &Type,
    entries: &[crate::untyped::UElt],
    key: Comparable,
    val: &Type,
) -> Result<BTreeMap<Value, Value>, TcError> {
    let key_ty = Type::Comparable(key);
    let mut out = BTreeMap::new();
    for entry in entries {
        let k = typecheck_value(&entry.key, &key_ty)?;
        let v = typecheck_value(&entry.value, val)?;
        if out.insert(k, v).is_some() {
            return Err(fail(whole, expected, "duplicate key in map literal"));
        }
    }
    Ok(out)
}
