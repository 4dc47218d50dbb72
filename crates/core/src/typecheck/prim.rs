//! Result-type resolution for the polymorphic primitives.
//!
//! Each family (`MEM`/`GET`/`UPDATE`/`SIZE`/`SLICE`/`CONCAT`, the
//! arithmetic operators, `COMPARE`, and the unary operators) is a total
//! lookup from the input-type combination to the result type. `None`
//! means the combination is not in the table and the caller reports a
//! "type mismatch" on the instruction.

use crate::ty::{Comparable, Type};

fn is_int_or_nat(c: Comparable) -> bool {
    matches!(c, Comparable::Int | Comparable::Nat)
}

fn comparable_pair(a: &Type, b: &Type) -> Option<(Comparable, Comparable)> {
    Some((a.as_comparable()?, b.as_comparable()?))
}

/// `ADD`: arithmetic join on int/nat, timestamp shifting, mutez addition.
pub(crate) fn add_result(a: &Type, b: &Type) -> Option<Type> {
    use Comparable::*;
    match comparable_pair(a, b)? {
        (Nat, Nat) => Some(Type::nat()),
        (x, y) if is_int_or_nat(x) && is_int_or_nat(y) => Some(Type::int()),
        (Int, Timestamp) | (Timestamp, Int) => Some(Type::timestamp()),
        (Mutez, Mutez) => Some(Type::mutez()),
        _ => None,
    }
}

/// `SUB`: int/nat subtraction is always `int`; timestamps difference and
/// shift; mutez subtraction.
pub(crate) fn sub_result(a: &Type, b: &Type) -> Option<Type> {
    use Comparable::*;
    match comparable_pair(a, b)? {
        (x, y) if is_int_or_nat(x) && is_int_or_nat(y) => Some(Type::int()),
        (Timestamp, Timestamp) => Some(Type::int()),
        (Timestamp, Int) => Some(Type::timestamp()),
        (Mutez, Mutez) => Some(Type::mutez()),
        _ => None,
    }
}

/// `MUL`: arithmetic join on int/nat, mutez scaling by nat.
pub(crate) fn mul_result(a: &Type, b: &Type) -> Option<Type> {
    use Comparable::*;
    match comparable_pair(a, b)? {
        (Nat, Nat) => Some(Type::nat()),
        (x, y) if is_int_or_nat(x) && is_int_or_nat(y) => Some(Type::int()),
        (Nat, Mutez) | (Mutez, Nat) => Some(Type::mutez()),
        _ => None,
    }
}

/// `EDIV`: `option (pair quotient remainder)` with the quotient/remainder
/// types determined by the operand combination.
pub(crate) fn ediv_result(a: &Type, b: &Type) -> Option<Type> {
    use Comparable::*;
    let (q, r) = match comparable_pair(a, b)? {
        (Nat, Nat) => (Type::nat(), Type::nat()),
        (x, y) if is_int_or_nat(x) && is_int_or_nat(y) => (Type::int(), Type::nat()),
        (Mutez, Nat) => (Type::mutez(), Type::mutez()),
        (Mutez, Mutez) => (Type::nat(), Type::mutez()),
        _ => return None,
    };
    Some(Type::option(Type::pair(q, r)))
}

/// `AND`/`OR`/`XOR`: boolean logic or bitwise on nat.
pub(crate) fn logic_result(a: &Type, b: &Type) -> Option<Type> {
    use Comparable::*;
    match comparable_pair(a, b)? {
        (Bool, Bool) => Some(Type::bool()),
        (Nat, Nat) => Some(Type::nat()),
        _ => None,
    }
}

/// `LSL`/`LSR`: nat shifted by nat.
pub(crate) fn shift_result(a: &Type, b: &Type) -> Option<Type> {
    use Comparable::*;
    match comparable_pair(a, b)? {
        (Nat, Nat) => Some(Type::nat()),
        _ => None,
    }
}

/// `NEG`: int or nat to int.
pub(crate) fn neg_result(a: &Type) -> Option<Type> {
    match a.as_comparable()? {
        c if is_int_or_nat(c) => Some(Type::int()),
        _ => None,
    }
}

/// `ABS`: int to nat.
pub(crate) fn abs_result(a: &Type) -> Option<Type> {
    match a.as_comparable()? {
        Comparable::Int => Some(Type::nat()),
        _ => None,
    }
}

/// `NOT`: boolean negation or bitwise complement (result `int`).
pub(crate) fn not_result(a: &Type) -> Option<Type> {
    use Comparable::*;
    match a.as_comparable()? {
        Bool => Some(Type::bool()),
        Int | Nat => Some(Type::int()),
        _ => None,
    }
}

/// `INT`: nat to int.
pub(crate) fn int_result(a: &Type) -> Option<Type> {
    match a.as_comparable()? {
        Comparable::Nat => Some(Type::int()),
        _ => None,
    }
}

/// `EQ`/`NEQ`/`LT`/`GT`/`LE`/`GE`: sign test on int.
pub(crate) fn sign_test_ok(a: &Type) -> bool {
    matches!(a.as_comparable(), Some(Comparable::Int))
}

/// `COMPARE`: any two equal comparable types, result `int`.
pub(crate) fn compare_ok(a: &Type, b: &Type) -> bool {
    matches!(comparable_pair(a, b), Some((x, y)) if x == y)
}

/// `MEM`: key against set/map/big_map with a matching key type.
pub(crate) fn mem_ok(key: &Type, coll: &Type) -> bool {
    let key = match key.as_comparable() {
        Some(c) => c,
        None => return false,
    };
    matches!(
        coll,
        Type::Set(k) | Type::Map(k, _) | Type::BigMap(k, _) if *k == key
    )
}

/// `GET`: the value type wrapped in `option`.
pub(crate) fn get_result(key: &Type, coll: &Type) -> Option<Type> {
    let key = key.as_comparable()?;
    match coll {
        Type::Map(k, v) | Type::BigMap(k, v) if *k == key => {
            Some(Type::option((**v).clone()))
        }
        _ => None,
    }
}

/// `UPDATE`: set membership toggle or map entry set/delete; the
/// collection type is preserved.
pub(crate) fn update_ok(key: &Type, arg: &Type, coll: &Type) -> bool {
    let key = match key.as_comparable() {
        Some(c) => c,
        None => return false,
    };
    match (arg, coll) {
        (Type::Comparable(Comparable::Bool), Type::Set(k)) => *k == key,
        (Type::Option(v), Type::Map(k, w)) | (Type::Option(v), Type::BigMap(k, w)) => {
            *k == key && v == w
        }
        _ => false,
    }
}

/// `SIZE`: every counted container.
pub(crate) fn size_ok(coll: &Type) -> bool {
    matches!(
        coll,
        Type::Set(_)
            | Type::Map(_, _)
            | Type::BigMap(_, _)
            | Type::List(_)
            | Type::Comparable(Comparable::String)
            | Type::Comparable(Comparable::Bytes)
    )
}

/// `SLICE`: `nat : nat : c` for sliceable `c`, result `option c`.
pub(crate) fn slice_result(offset: &Type, length: &Type, seq: &Type) -> Option<Type> {
    use Comparable::*;
    if offset.as_comparable() != Some(Nat) || length.as_comparable() != Some(Nat) {
        return None;
    }
    match seq.as_comparable()? {
        String => Some(Type::option(Type::string())),
        Bytes => Some(Type::option(Type::bytes())),
        _ => None,
    }
}

/// Binary `CONCAT`: two strings or two bytes.
pub(crate) fn concat_ok(a: &Type, b: &Type) -> bool {
    use Comparable::*;
    matches!(
        comparable_pair(a, b),
        Some((String, String)) | Some((Bytes, Bytes))
    )
}

/// List `CONCAT`: a list of strings or bytes, result the element type.
pub(crate) fn concat_list_result(coll: &Type) -> Option<Type> {
    use Comparable::*;
    match coll {
        Type::List(elem) => match elem.as_comparable()? {
            String => Some(Type::string()),
            Bytes => Some(Type::bytes()),
            _ => None,
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_join() {
        assert_eq!(add_result(&Type::nat(), &Type::nat()), Some(Type::nat()));
        assert_eq!(add_result(&Type::int(), &Type::nat()), Some(Type::int()));
        assert_eq!(
            add_result(&Type::timestamp(), &Type::int()),
            Some(Type::timestamp())
        );
        assert_eq!(
            add_result(&Type::mutez(), &Type::mutez()),
            Some(Type::mutez())
        );
        assert_eq!(add_result(&Type::mutez(), &Type::nat()), None);
        assert_eq!(add_result(&Type::string(), &Type::string()), None);
    }

    #[test]
    fn sub_never_returns_nat() {
        assert_eq!(sub_result(&Type::nat(), &Type::nat()), Some(Type::int()));
        assert_eq!(
            sub_result(&Type::timestamp(), &Type::timestamp()),
            Some(Type::int())
        );
        assert_eq!(
            sub_result(&Type::timestamp(), &Type::int()),
            Some(Type::timestamp())
        );
        assert_eq!(sub_result(&Type::int(), &Type::timestamp()), None);
    }

    #[test]
    fn mul_mutez_scaling() {
        assert_eq!(
            mul_result(&Type::nat(), &Type::mutez()),
            Some(Type::mutez())
        );
        assert_eq!(
            mul_result(&Type::mutez(), &Type::nat()),
            Some(Type::mutez())
        );
        assert_eq!(mul_result(&Type::mutez(), &Type::mutez()), None);
        assert_eq!(mul_result(&Type::int(), &Type::int()), Some(Type::int()));
    }

    #[test]
    fn ediv_quotient_remainder_types() {
        assert_eq!(
            ediv_result(&Type::nat(), &Type::nat()),
            Some(Type::option(Type::pair(Type::nat(), Type::nat())))
        );
        assert_eq!(
            ediv_result(&Type::int(), &Type::nat()),
            Some(Type::option(Type::pair(Type::int(), Type::nat())))
        );
        assert_eq!(
            ediv_result(&Type::mutez(), &Type::nat()),
            Some(Type::option(Type::pair(Type::mutez(), Type::mutez())))
        );
        assert_eq!(
            ediv_result(&Type::mutez(), &Type::mutez()),
            Some(Type::option(Type::pair(Type::nat(), Type::mutez())))
        );
    }

    #[test]
    fn collection_primitives() {
        let set = Type::Set(Comparable::Int);
        let map = Type::Map(Comparable::String, Box::new(Type::nat()));
        assert!(mem_ok(&Type::int(), &set));
        assert!(!mem_ok(&Type::nat(), &set));
        assert_eq!(
            get_result(&Type::string(), &map),
            Some(Type::option(Type::nat()))
        );
        assert_eq!(get_result(&Type::int(), &map), None);
        assert!(update_ok(&Type::int(), &Type::bool(), &set));
        assert!(update_ok(
            &Type::string(),
            &Type::option(Type::nat()),
            &map
        ));
        assert!(!update_ok(
            &Type::string(),
            &Type::option(Type::int()),
            &map
        ));
        assert!(size_ok(&Type::string()) && size_ok(&map) && !size_ok(&Type::int()));
    }

    #[test]
    fn concat_and_slice() {
        assert!(concat_ok(&Type::string(), &Type::string()));
        assert!(!concat_ok(&Type::string(), &Type::bytes()));
        assert_eq!(
            concat_list_result(&Type::list(Type::bytes())),
            Some(Type::bytes())
        );
        assert_eq!(concat_list_result(&Type::list(Type::int())), None);
        assert_eq!(
            slice_result(&Type::nat(), &Type::nat(), &Type::string()),
            Some(Type::option(Type::string()))
        );
        assert_eq!(slice_result(&Type::nat(), &Type::int(), &Type::string()), None);
    }
}
