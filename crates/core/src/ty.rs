//! The closed universe of Michelson types.
//!
//! `Comparable` is the subset usable as set elements and map keys; `Type`
//! is the full algebra. The GADT indices of the reference implementation
//! are erased: type identity is re-established at check time through
//! `require_eq`, the runtime equality witness every stack-shape proof
//! bottoms out in.

use std::fmt;

/// Comparable types: total ordering, usable as set elements and map keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparable {
    Int,
    Nat,
    String,
    Bytes,
    Mutez,
    Bool,
    KeyHash,
    Timestamp,
    Address,
}

impl fmt::Display for Comparable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Comparable::Int => "int",
            Comparable::Nat => "nat",
            Comparable::String => "string",
            Comparable::Bytes => "bytes",
            Comparable::Mutez => "mutez",
            Comparable::Bool => "bool",
            Comparable::KeyHash => "key_hash",
            Comparable::Timestamp => "timestamp",
            Comparable::Address => "address",
        };
        f.write_str(name)
    }
}

/// A Michelson type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Type {
    Comparable(Comparable),
    Key,
    Unit,
    Signature,
    Option(Box<Type>),
    List(Box<Type>),
    Set(Comparable),
    Operation,
    Contract(Box<Type>),
    Pair(Box<Type>, Box<Type>),
    Or(Box<Type>, Box<Type>),
    Lambda(Box<Type>, Box<Type>),
    Map(Comparable, Box<Type>),
    BigMap(Comparable, Box<Type>),
}

impl Type {
    pub fn int() -> Type {
        Type::Comparable(Comparable::Int)
    }
    pub fn nat() -> Type {
        Type::Comparable(Comparable::Nat)
    }
    pub fn string() -> Type {
        Type::Comparable(Comparable::String)
    }
    pub fn bytes() -> Type {
        Type::Comparable(Comparable::Bytes)
    }
    pub fn mutez() -> Type {
        Type::Comparable(Comparable::Mutez)
    }
    pub fn bool() -> Type {
        Type::Comparable(Comparable::Bool)
    }
    pub fn key_hash() -> Type {
        Type::Comparable(Comparable::KeyHash)
    }
    pub fn timestamp() -> Type {
        Type::Comparable(Comparable::Timestamp)
    }
    pub fn address() -> Type {
        Type::Comparable(Comparable::Address)
    }

    pub fn pair(a: Type, b: Type) -> Type {
        Type::Pair(Box::new(a), Box::new(b))
    }

    pub fn option(t: Type) -> Type {
        Type::Option(Box::new(t))
    }

    pub fn list(t: Type) -> Type {
        Type::List(Box::new(t))
    }

    pub fn or(a: Type, b: Type) -> Type {
        Type::Or(Box::new(a), Box::new(b))
    }

    pub fn lambda(a: Type, b: Type) -> Type {
        Type::Lambda(Box::new(a), Box::new(b))
    }

    pub fn contract(t: Type) -> Type {
        Type::Contract(Box::new(t))
    }

    /// The comparable view of this type, if it has one.
    pub fn as_comparable(&self) -> Option<Comparable> {
        match self {
            Type::Comparable(c) => Some(*c),
            _ => None,
        }
    }

    /// True when no `operation` occurs anywhere in the type.
    pub fn has_no_op(&self) -> bool {
        match self {
            Type::Operation => false,
            Type::Comparable(_) | Type::Key | Type::Unit | Type::Signature | Type::Set(_) => true,
            Type::Option(t) | Type::List(t) | Type::Contract(t) => t.has_no_op(),
            Type::Pair(a, b) | Type::Or(a, b) | Type::Lambda(a, b) => {
                a.has_no_op() && b.has_no_op()
            }
            Type::Map(_, v) | Type::BigMap(_, v) => v.has_no_op(),
        }
    }

    /// Structural well-formedness: `operation` may not occur inside
    /// `big_map`/`map` values or a `contract` parameter. Checked once when
    /// an untyped type is lowered; every nested constructor recurses.
    pub fn well_formed(&self) -> Result<(), String> {
        match self {
            Type::Comparable(_)
            | Type::Key
            | Type::Unit
            | Type::Signature
            | Type::Operation
            | Type::Set(_) => Ok(()),
            Type::Option(t) | Type::List(t) => t.well_formed(),
            Type::Contract(t) => {
                if !t.has_no_op() {
                    return Err("operation type is not allowed in a contract parameter".into());
                }
                t.well_formed()
            }
            Type::Pair(a, b) | Type::Or(a, b) | Type::Lambda(a, b) => {
                a.well_formed()?;
                b.well_formed()
            }
            Type::Map(_, v) | Type::BigMap(_, v) => {
                if !v.has_no_op() {
                    return Err("operation type is not allowed in map values".into());
                }
                v.well_formed()
            }
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Comparable(c) => write!(f, "{}", c),
            Type::Key => f.write_str("key"),
            Type::Unit => f.write_str("unit"),
            Type::Signature => f.write_str("signature"),
            Type::Option(t) => write!(f, "(option {})", t),
            Type::List(t) => write!(f, "(list {})", t),
            Type::Set(c) => write!(f, "(set {})", c),
            Type::Operation => f.write_str("operation"),
            Type::Contract(t) => write!(f, "(contract {})", t),
            Type::Pair(a, b) => write!(f, "(pair {} {})", a, b),
            Type::Or(a, b) => write!(f, "(or {} {})", a, b),
            Type::Lambda(a, b) => write!(f, "(lambda {} {})", a, b),
            Type::Map(k, v) => write!(f, "(map {} {})", k, v),
            Type::BigMap(k, v) => write!(f, "(big_map {} {})", k, v),
        }
    }
}

/// The erased equality witness: evidence that two stack slots carry the
/// same type is a successful structural comparison.
pub fn require_eq(expected: &Type, actual: &Type) -> Result<(), String> {
    if expected == actual {
        Ok(())
    } else {
        Err(format!(
            "type mismatch: expected {}, got {}",
            expected, actual
        ))
    }
}
