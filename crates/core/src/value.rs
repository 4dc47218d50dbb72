//! Typed Michelson values and the operations contracts emit.
//!
//! A `Value` is only ever built by the value checker or by the interpreter
//! stepping checked code, so the constructor-per-type correspondence holds
//! at every use site even though the type index is erased. Comparable
//! values carry the Michelson total order; sets and maps are `BTree`
//! collections, which keeps keys strictly ascending and unique.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use num_bigint::BigInt;

use crate::instr::{Instr, Lambda};
use crate::ty::Type;

// ──────────────────────────────────────────────
// Mutez
// ──────────────────────────────────────────────

/// Millionths of a tez. Non-negative, bounded by 2^63 - 1; every
/// arithmetic path is checked and overflow is a runtime failure at the
/// interpreter level, never a wrapped value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Mutez(u64);

impl Mutez {
    pub const MAX: Mutez = Mutez((1 << 63) - 1);

    pub fn new(raw: u64) -> Option<Mutez> {
        if raw <= Mutez::MAX.0 {
            Some(Mutez(raw))
        } else {
            None
        }
    }

    pub fn zero() -> Mutez {
        Mutez(0)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn checked_add(self, other: Mutez) -> Option<Mutez> {
        self.0.checked_add(other.0).and_then(Mutez::new)
    }

    pub fn checked_sub(self, other: Mutez) -> Option<Mutez> {
        self.0.checked_sub(other.0).map(Mutez)
    }

    pub fn checked_mul(self, factor: &BigInt) -> Option<Mutez> {
        let factor = u64::try_from(factor.clone()).ok()?;
        self.0.checked_mul(factor).and_then(Mutez::new)
    }
}

impl fmt::Display for Mutez {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ──────────────────────────────────────────────
// Addresses, keys, signatures
// ──────────────────────────────────────────────

/// Address prefix. Implicit (`tz*`) accounts order before originated
/// (`KT1`) ones, matching the comparable order on addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AddressKind {
    Tz1,
    Tz2,
    Tz3,
    Kt1,
}

impl AddressKind {
    pub fn prefix(self) -> &'static str {
        match self {
            AddressKind::Tz1 => "tz1",
            AddressKind::Tz2 => "tz2",
            AddressKind::Tz3 => "tz3",
            AddressKind::Kt1 => "KT1",
        }
    }
}

/// A tagged 20-byte account address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Address {
    pub kind: AddressKind,
    pub hash: [u8; 20],
}

impl Address {
    pub fn implicit(hash: [u8; 20]) -> Address {
        Address {
            kind: AddressKind::Tz1,
            hash,
        }
    }

    pub fn originated(hash: [u8; 20]) -> Address {
        Address {
            kind: AddressKind::Kt1,
            hash,
        }
    }

    pub fn is_originated(&self) -> bool {
        self.kind == AddressKind::Kt1
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind.prefix())?;
        for byte in &self.hash {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

fn parse_hash20(hex: &str) -> Option<[u8; 20]> {
    if hex.len() != 40 || !hex.is_ascii() {
        return None;
    }
    let mut hash = [0u8; 20];
    for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
        let chunk = std::str::from_utf8(chunk).ok()?;
        hash[i] = u8::from_str_radix(chunk, 16).ok()?;
    }
    Some(hash)
}

impl std::str::FromStr for Address {
    type Err = String;

    /// Parses the rendering `Display` produces: a `tz1`/`tz2`/`tz3`/`KT1`
    /// prefix followed by 40 hex digits.
    fn from_str(s: &str) -> Result<Address, String> {
        if !s.is_ascii() {
            return Err(format!("bad address literal '{}'", s));
        }
        let (prefix, rest) = s.split_at(s.len().min(3));
        let kind = match prefix {
            "tz1" => AddressKind::Tz1,
            "tz2" => AddressKind::Tz2,
            "tz3" => AddressKind::Tz3,
            "KT1" => AddressKind::Kt1,
            _ => return Err(format!("unknown address prefix in '{}'", s)),
        };
        let hash = parse_hash20(rest).ok_or_else(|| format!("bad address payload in '{}'", s))?;
        Ok(Address { kind, hash })
    }
}

impl std::str::FromStr for KeyHash {
    type Err = String;

    fn from_str(s: &str) -> Result<KeyHash, String> {
        let addr: Address = s.parse()?;
        if addr.is_originated() {
            return Err(format!("'{}' is not an implicit key hash", s));
        }
        Ok(KeyHash(addr.hash))
    }
}

/// A 20-byte public key hash. Signature checking itself is an external
/// collaborator; the harness only moves the bytes around.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct KeyHash(pub [u8; 20]);

impl KeyHash {
    /// The implicit account owned by this key hash.
    pub fn implicit_address(&self) -> Address {
        Address::implicit(self.0)
    }
}

impl fmt::Display for KeyHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("tz1")?;
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKey(pub Vec<u8>);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature(pub Vec<u8>);

// ──────────────────────────────────────────────
// Values
// ──────────────────────────────────────────────

/// A well-typed Michelson value, one constructor per type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(BigInt),
    /// Non-negative by construction: the checker and every interpreter
    /// step that yields a `Nat` maintain the sign invariant.
    Nat(BigInt),
    String(String),
    Bytes(Vec<u8>),
    Mutez(Mutez),
    Bool(bool),
    KeyHash(KeyHash),
    /// Signed seconds since epoch.
    Timestamp(i64),
    Address(Address),
    Key(PublicKey),
    Unit,
    Signature(Signature),
    Option(Option<Box<Value>>),
    List(Vec<Value>),
    Set(BTreeSet<Value>),
    Left(Box<Value>),
    Right(Box<Value>),
    Pair(Box<Value>, Box<Value>),
    Map(BTreeMap<Value, Value>),
    BigMap(BTreeMap<Value, Value>),
    /// A contract handle carries only the address; the parameter type
    /// lives in the stack descriptor and in the global state.
    Contract(Address),
    Lambda(Lambda),
    Operation(Box<Operation>),
}

impl Value {
    pub fn pair(a: Value, b: Value) -> Value {
        Value::Pair(Box::new(a), Box::new(b))
    }

    pub fn some(v: Value) -> Value {
        Value::Option(Some(Box::new(v)))
    }

    pub fn none() -> Value {
        Value::Option(None)
    }

    pub fn int(i: i64) -> Value {
        Value::Int(BigInt::from(i))
    }

    pub fn nat(n: u64) -> Value {
        Value::Nat(BigInt::from(n))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "int",
            Value::Nat(_) => "nat",
            Value::String(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Mutez(_) => "mutez",
            Value::Bool(_) => "bool",
            Value::KeyHash(_) => "key_hash",
            Value::Timestamp(_) => "timestamp",
            Value::Address(_) => "address",
            Value::Key(_) => "key",
            Value::Unit => "unit",
            Value::Signature(_) => "signature",
            Value::Option(_) => "option",
            Value::List(_) => "list",
            Value::Set(_) => "set",
            Value::Left(_) | Value::Right(_) => "or",
            Value::Pair(_, _) => "pair",
            Value::Map(_) => "map",
            Value::BigMap(_) => "big_map",
            Value::Contract(_) => "contract",
            Value::Lambda(_) => "lambda",
            Value::Operation(_) => "operation",
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    /// The Michelson comparable order: numeric on numbers, lexicographic
    /// on strings and bytes, `False < True`, tag-then-bytes on addresses.
    /// The checker guarantees only comparable values meet here.
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Nat(a), Value::Nat(b)) => a.cmp(b),
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Bytes(a), Value::Bytes(b)) => a.cmp(b),
            (Value::Mutez(a), Value::Mutez(b)) => a.cmp(b),
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::KeyHash(a), Value::KeyHash(b)) => a.cmp(b),
            (Value::Timestamp(a), Value::Timestamp(b)) => a.cmp(b),
            (Value::Address(a), Value::Address(b)) => a.cmp(b),
            (a, b) => unreachable!(
                "comparison of non-comparable values: {} vs {}",
                a.type_name(),
                b.type_name()
            ),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(i) | Value::Nat(i) => write!(f, "{}", i),
            Value::String(s) => write!(f, "{:?}", s),
            Value::Bytes(b) => {
                f.write_str("0x")?;
                for byte in b {
                    write!(f, "{:02x}", byte)?;
                }
                Ok(())
            }
            Value::Mutez(m) => write!(f, "{}", m),
            Value::Bool(true) => f.write_str("True"),
            Value::Bool(false) => f.write_str("False"),
            Value::KeyHash(kh) => write!(f, "\"{}\"", kh),
            Value::Timestamp(ts) => write!(f, "{}", ts),
            Value::Address(a) => write!(f, "\"{}\"", a),
            Value::Key(k) => {
                f.write_str("0x")?;
                for byte in &k.0 {
                    write!(f, "{:02x}", byte)?;
                }
                Ok(())
            }
            Value::Unit => f.write_str("Unit"),
            Value::Signature(s) => {
                f.write_str("0x")?;
                for byte in &s.0 {
                    write!(f, "{:02x}", byte)?;
                }
                Ok(())
            }
            Value::Option(Some(v)) => write!(f, "(Some {})", v),
            Value::Option(None) => f.write_str("None"),
            Value::List(items) => {
                f.write_str("{ ")?;
                for (i, v) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str("; ")?;
                    }
                    write!(f, "{}", v)?;
                }
                f.write_str(" }")
            }
            Value::Set(items) => {
                f.write_str("{ ")?;
                for (i, v) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str("; ")?;
                    }
                    write!(f, "{}", v)?;
                }
                f.write_str(" }")
            }
            Value::Left(v) => write!(f, "(Left {})", v),
            Value::Right(v) => write!(f, "(Right {})", v),
            Value::Pair(a, b) => write!(f, "(Pair {} {})", a, b),
            Value::Map(entries) | Value::BigMap(entries) => {
                f.write_str("{ ")?;
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        f.write_str("; ")?;
                    }
                    write!(f, "Elt {} {}", k, v)?;
                }
                f.write_str(" }")
            }
            Value::Contract(a) => write!(f, "\"{}\"", a),
            Value::Lambda(_) => f.write_str("<lambda>"),
            Value::Operation(_) => f.write_str("<operation>"),
        }
    }
}

// ──────────────────────────────────────────────
// Emitted operations
// ──────────────────────────────────────────────

/// An operation produced by contract execution, folded back into the
/// pending queue by the interpreter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    TransferTokens {
        parameter: Value,
        /// Declared parameter type of the destination handle; dispatch
        /// re-checks it against the destination's stored type.
        param_ty: Type,
        amount: Mutez,
        dest: Address,
    },
    SetDelegate {
        delegate: Option<KeyHash>,
    },
    CreateAccount {
        manager: KeyHash,
        delegate: Option<KeyHash>,
        spendable: bool,
        balance: Mutez,
        /// The derived address, fixed at emission time so that folding the
        /// operation reproduces exactly the account the emitter saw.
        addr: Address,
    },
    CreateContract {
        manager: KeyHash,
        delegate: Option<KeyHash>,
        spendable: bool,
        delegatable: bool,
        balance: Mutez,
        storage: Value,
        storage_ty: Type,
        param_ty: Type,
        code: Vec<Instr>,
        /// Derived at emission time, like `CreateAccount::addr`.
        addr: Address,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mutez_is_bounded() {
        assert!(Mutez::new(u64::MAX).is_none());
        assert_eq!(Mutez::new(5).unwrap().raw(), 5);
        assert_eq!(Mutez::MAX.checked_add(Mutez::new(1).unwrap()), None);
        assert_eq!(Mutez::zero().checked_sub(Mutez::new(1).unwrap()), None);
        let ten = Mutez::new(10).unwrap();
        assert_eq!(
            ten.checked_mul(&BigInt::from(3u32)),
            Some(Mutez::new(30).unwrap())
        );
    }

    #[test]
    fn comparable_order_matches_michelson() {
        assert!(Value::int(-1) < Value::int(2));
        assert!(Value::String("a".into()) < Value::String("b".into()));
        assert!(Value::Bool(false) < Value::Bool(true));
        assert!(Value::Bytes(vec![0x00]) < Value::Bytes(vec![0x00, 0x01]));
        let implicit = Value::Address(Address::implicit([0xff; 20]));
        let originated = Value::Address(Address::originated([0x00; 20]));
        assert!(implicit < originated);
    }

    #[test]
    fn set_keys_stay_sorted_and_unique() {
        let mut set = BTreeSet::new();
        set.insert(Value::int(3));
        set.insert(Value::int(1));
        set.insert(Value::int(1));
        let collected: Vec<Value> = set.into_iter().collect();
        assert_eq!(collected, vec![Value::int(1), Value::int(3)]);
    }

    #[test]
    fn literal_rendering() {
        assert_eq!(
            Value::pair(Value::int(1), Value::some(Value::Unit)).to_string(),
            "(Pair 1 (Some Unit))"
        );
        assert_eq!(
            Value::List(vec![Value::int(1), Value::int(2)]).to_string(),
            "{ 1; 2 }"
        );
    }
}
