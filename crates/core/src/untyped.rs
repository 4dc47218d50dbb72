//! The untyped instruction language the checker consumes.
//!
//! The surface parser is an external collaborator; it hands the checker
//! this AST, either constructed directly or through the serde interchange
//! (`UContract::from_json`). Types carry their annotations inline the way
//! the concrete syntax writes them; `extract` lowers an annotated untyped
//! type into a bare `Type` plus its `Notes` tree, enforcing the structural
//! constraints (comparable keys, no `operation` inside storable types).

use num_bigint::BigInt;
use serde::{Deserialize, Serialize};

use crate::annotation::{FieldAnn, Notes, TypeAnn, VarAnn};
use crate::ty::Type;

// ──────────────────────────────────────────────
// Untyped types
// ──────────────────────────────────────────────

/// An annotated type expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UType {
    pub node: UTypeNode,
    #[serde(default)]
    pub type_ann: TypeAnn,
    #[serde(default)]
    pub field_ann: FieldAnn,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UTypeNode {
    Int,
    Nat,
    String,
    Bytes,
    Mutez,
    Bool,
    KeyHash,
    Timestamp,
    Address,
    Key,
    Unit,
    Signature,
    Operation,
    Option(Box<UType>),
    List(Box<UType>),
    Set(Box<UType>),
    Contract(Box<UType>),
    Pair(Box<UType>, Box<UType>),
    Or(Box<UType>, Box<UType>),
    Lambda(Box<UType>, Box<UType>),
    Map(Box<UType>, Box<UType>),
    BigMap(Box<UType>, Box<UType>),
}

impl UType {
    pub fn new(node: UTypeNode) -> UType {
        UType {
            node,
            type_ann: TypeAnn::none(),
            field_ann: FieldAnn::none(),
        }
    }

    pub fn with_type_ann(mut self, ann: impl Into<String>) -> UType {
        self.type_ann = TypeAnn::new(ann);
        self
    }

    pub fn with_field_ann(mut self, ann: impl Into<String>) -> UType {
        self.field_ann = FieldAnn::new(ann);
        self
    }

    pub fn int() -> UType {
        UType::new(UTypeNode::Int)
    }
    pub fn nat() -> UType {
        UType::new(UTypeNode::Nat)
    }
    pub fn string() -> UType {
        UType::new(UTypeNode::String)
    }
    pub fn bytes() -> UType {
        UType::new(UTypeNode::Bytes)
    }
    pub fn mutez() -> UType {
        UType::new(UTypeNode::Mutez)
    }
    pub fn bool() -> UType {
        UType::new(UTypeNode::Bool)
    }
    pub fn timestamp() -> UType {
        UType::new(UTypeNode::Timestamp)
    }
    pub fn address() -> UType {
        UType::new(UTypeNode::Address)
    }
    pub fn key_hash() -> UType {
        UType::new(UTypeNode::KeyHash)
    }
    pub fn unit() -> UType {
        UType::new(UTypeNode::Unit)
    }
    pub fn operation() -> UType {
        UType::new(UTypeNode::Operation)
    }
    pub fn option(t: UType) -> UType {
        UType::new(UTypeNode::Option(Box::new(t)))
    }
    pub fn list(t: UType) -> UType {
        UType::new(UTypeNode::List(Box::new(t)))
    }
    pub fn set(t: UType) -> UType {
        UType::new(UTypeNode::Set(Box::new(t)))
    }
    pub fn pair(a: UType, b: UType) -> UType {
        UType::new(UTypeNode::Pair(Box::new(a), Box::new(b)))
    }
    pub fn or(a: UType, b: UType) -> UType {
        UType::new(UTypeNode::Or(Box::new(a), Box::new(b)))
    }
    pub fn map(k: UType, v: UType) -> UType {
        UType::new(UTypeNode::Map(Box::new(k), Box::new(v)))
    }

    /// Lower to a bare type plus annotation tree, rejecting ill-formed
    /// nesting (non-comparable keys, `operation` where forbidden).
    pub fn extract(&self) -> Result<(Type, Notes), String> {
        let (ty, notes) = self.extract_inner()?;
        ty.well_formed()?;
        Ok((ty, normalize(notes)))
    }

    fn extract_inner(&self) -> Result<(Type, Notes), String> {
        let type_ann = self.type_ann.clone();
        let atom = |ty: Type| (ty, Notes::Atom(self.type_ann.clone()));
        Ok(match &self.node {
            UTypeNode::Int => atom(Type::int()),
            UTypeNode::Nat => atom(Type::nat()),
            UTypeNode::String => atom(Type::string()),
            UTypeNode::Bytes => atom(Type::bytes()),
            UTypeNode::Mutez => atom(Type::mutez()),
            UTypeNode::Bool => atom(Type::bool()),
            UTypeNode::KeyHash => atom(Type::key_hash()),
            UTypeNode::Timestamp => atom(Type::timestamp()),
            UTypeNode::Address => atom(Type::address()),
            UTypeNode::Key => atom(Type::Key),
            UTypeNode::Unit => atom(Type::Unit),
            UTypeNode::Signature => atom(Type::Signature),
            UTypeNode::Operation => atom(Type::Operation),
            UTypeNode::Option(t) => {
                let (ty, notes) = t.extract_inner()?;
                (
                    Type::option(ty),
                    Notes::Option {
                        type_ann,
                        some_field: t.field_ann.clone(),
                        some: Box::new(notes),
                    },
                )
            }
            UTypeNode::List(t) => {
                let (ty, notes) = t.extract_inner()?;
                (
                    Type::list(ty),
                    Notes::Elem {
                        type_ann,
                        elem: Box::new(notes),
                    },
                )
            }
            UTypeNode::Set(t) => {
                let (ty, notes) = t.extract_inner()?;
                let elem = ty
                    .as_comparable()
                    .ok_or_else(|| format!("set element type must be comparable, got {}", ty))?;
                (
                    Type::Set(elem),
                    Notes::Elem {
                        type_ann,
                        elem: Box::new(notes),
                    },
                )
            }
            UTypeNode::Contract(t) => {
                let (ty, notes) = t.extract_inner()?;
                (
                    Type::contract(ty),
                    Notes::Elem {
                        type_ann,
                        elem: Box::new(notes),
                    },
                )
            }
            UTypeNode::Pair(a, b) => {
                let (ta, na) = a.extract_inner()?;
                let (tb, nb) = b.extract_inner()?;
                (
                    Type::pair(ta, tb),
                    Notes::Pair {
                        type_ann,
                        first_field: a.field_ann.clone(),
                        second_field: b.field_ann.clone(),
                        first: Box::new(na),
                        second: Box::new(nb),
                    },
                )
            }
            UTypeNode::Or(a, b) => {
                let (ta, na) = a.extract_inner()?;
                let (tb, nb) = b.extract_inner()?;
                (
                    Type::or(ta, tb),
                    Notes::Or {
                        type_ann,
                        left_field: a.field_ann.clone(),
                        right_field: b.field_ann.clone(),
                        left: Box::new(na),
                        right: Box::new(nb),
                    },
                )
            }
            UTypeNode::Lambda(a, b) => {
                let (ta, na) = a.extract_inner()?;
                let (tb, nb) = b.extract_inner()?;
                (
                    Type::lambda(ta, tb),
                    Notes::Entry {
                        type_ann,
                        key: Box::new(na),
                        value: Box::new(nb),
                    },
                )
            }
            UTypeNode::Map(k, v) => {
                let (tk, nk) = k.extract_inner()?;
                let (tv, nv) = v.extract_inner()?;
                let key = tk
                    .as_comparable()
                    .ok_or_else(|| format!("map key type must be comparable, got {}", tk))?;
                (
                    Type::Map(key, Box::new(tv)),
                    Notes::Entry {
                        type_ann,
                        key: Box::new(nk),
                        value: Box::new(nv),
                    },
                )
            }
            UTypeNode::BigMap(k, v) => {
                let (tk, nk) = k.extract_inner()?;
                let (tv, nv) = v.extract_inner()?;
                let key = tk
                    .as_comparable()
                    .ok_or_else(|| format!("big_map key type must be comparable, got {}", tk))?;
                (
                    Type::BigMap(key, Box::new(tv)),
                    Notes::Entry {
                        type_ann,
                        key: Box::new(nk),
                        value: Box::new(nv),
                    },
                )
            }
        })
    }
}

/// Collapse trees with no concrete annotation anywhere back to `Star`.
fn normalize(notes: Notes) -> Notes {
    fn is_blank(notes: &Notes) -> bool {
        match notes {
            Notes::Star => true,
            Notes::Atom(t) => t.is_none(),
            Notes::Pair {
                type_ann,
                first_field,
                second_field,
                first,
                second,
            } => {
                type_ann.is_none()
                    && first_field.is_none()
                    && second_field.is_none()
                    && is_blank(first)
                    && is_blank(second)
            }
            Notes::Or {
                type_ann,
                left_field,
                right_field,
                left,
                right,
            } => {
                type_ann.is_none()
                    && left_field.is_none()
                    && right_field.is_none()
                    && is_blank(left)
                    && is_blank(right)
            }
            Notes::Option {
                type_ann,
                some_field,
                some,
            } => type_ann.is_none() && some_field.is_none() && is_blank(some),
            Notes::Elem { type_ann, elem } => type_ann.is_none() && is_blank(elem),
            Notes::Entry {
                type_ann,
                key,
                value,
            } => type_ann.is_none() && is_blank(key) && is_blank(value),
        }
    }
    if is_blank(&notes) {
        Notes::Star
    } else {
        notes
    }
}

// ──────────────────────────────────────────────
// Untyped values
// ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UValue {
    Int(BigInt),
    String(String),
    Bytes(Vec<u8>),
    Unit,
    True,
    False,
    Pair(Box<UValue>, Box<UValue>),
    Left(Box<UValue>),
    Right(Box<UValue>),
    Some(Box<UValue>),
    None,
    Seq(Vec<UValue>),
    Map(Vec<UElt>),
    Lambda(Vec<UInstr>),
}

impl UValue {
    pub fn int(i: i64) -> UValue {
        UValue::Int(BigInt::from(i))
    }

    pub fn string(s: impl Into<String>) -> UValue {
        UValue::String(s.into())
    }

    pub fn pair(a: UValue, b: UValue) -> UValue {
        UValue::Pair(Box::new(a), Box::new(b))
    }
}

/// One `Elt k v` entry of a map literal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UElt {
    pub key: UValue,
    pub value: UValue,
}

// ──────────────────────────────────────────────
// Untyped instructions
// ──────────────────────────────────────────────

/// An unchecked instruction, annotations as written in the source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UInstr {
    Drop,
    Dup {
        #[serde(default)]
        var_ann: VarAnn,
    },
    Swap,
    Push {
        #[serde(default)]
        var_ann: VarAnn,
        ty: UType,
        value: UValue,
    },
    Unit {
        #[serde(default)]
        type_ann: TypeAnn,
        #[serde(default)]
        var_ann: VarAnn,
    },
    Some {
        #[serde(default)]
        type_ann: TypeAnn,
        #[serde(default)]
        var_ann: VarAnn,
        #[serde(default)]
        field_ann: FieldAnn,
    },
    None {
        #[serde(default)]
        type_ann: TypeAnn,
        #[serde(default)]
        var_ann: VarAnn,
        #[serde(default)]
        field_ann: FieldAnn,
        ty: UType,
    },
    IfNone {
        if_none: Vec<UInstr>,
        if_some: Vec<UInstr>,
    },
    Pair {
        #[serde(default)]
        type_ann: TypeAnn,
        #[serde(default)]
        var_ann: VarAnn,
        #[serde(default)]
        first_field: FieldAnn,
        #[serde(default)]
        second_field: FieldAnn,
    },
    Car {
        #[serde(default)]
        var_ann: VarAnn,
        #[serde(default)]
        field_ann: FieldAnn,
    },
    Cdr {
        #[serde(default)]
        var_ann: VarAnn,
        #[serde(default)]
        field_ann: FieldAnn,
    },
    Left {
        #[serde(default)]
        type_ann: TypeAnn,
        #[serde(default)]
        var_ann: VarAnn,
        #[serde(default)]
        left_field: FieldAnn,
        #[serde(default)]
        right_field: FieldAnn,
        right_ty: UType,
    },
    Right {
        #[serde(default)]
        type_ann: TypeAnn,
        #[serde(default)]
        var_ann: VarAnn,
        #[serde(default)]
        left_field: FieldAnn,
        #[serde(default)]
        right_field: FieldAnn,
        left_ty: UType,
    },
    IfLeft {
        if_left: Vec<UInstr>,
        if_right: Vec<UInstr>,
    },
    Nil {
        #[serde(default)]
        type_ann: TypeAnn,
        #[serde(default)]
        var_ann: VarAnn,
        ty: UType,
    },
    Cons {
        #[serde(default)]
        var_ann: VarAnn,
    },
    IfCons {
        if_cons: Vec<UInstr>,
        if_nil: Vec<UInstr>,
    },
    EmptySet {
        #[serde(default)]
        type_ann: TypeAnn,
        #[serde(default)]
        var_ann: VarAnn,
        elem_ty: UType,
    },
    EmptyMap {
        #[serde(default)]
        type_ann: TypeAnn,
        #[serde(default)]
        var_ann: VarAnn,
        key_ty: UType,
        value_ty: UType,
    },
    Map {
        #[serde(default)]
        var_ann: VarAnn,
        body: Vec<UInstr>,
    },
    Iter {
        body: Vec<UInstr>,
    },
    Mem {
        #[serde(default)]
        var_ann: VarAnn,
    },
    Get {
        #[serde(default)]
        var_ann: VarAnn,
    },
    Update {
        #[serde(default)]
        var_ann: VarAnn,
    },
    Size {
        #[serde(default)]
        var_ann: VarAnn,
    },
    Concat {
        #[serde(default)]
        var_ann: VarAnn,
    },
    Slice {
        #[serde(default)]
        var_ann: VarAnn,
    },
    If {
        if_true: Vec<UInstr>,
        if_false: Vec<UInstr>,
    },
    Loop {
        body: Vec<UInstr>,
    },
    LoopLeft {
        body: Vec<UInstr>,
    },
    Lambda {
        #[serde(default)]
        var_ann: VarAnn,
        arg_ty: UType,
        ret_ty: UType,
        body: Vec<UInstr>,
    },
    Exec {
        #[serde(default)]
        var_ann: VarAnn,
    },
    Dip {
        body: Vec<UInstr>,
    },
    Failwith,
    Cast {
        #[serde(default)]
        var_ann: VarAnn,
        ty: UType,
    },
    Rename {
        #[serde(default)]
        var_ann: VarAnn,
    },
    Add {
        #[serde(default)]
        var_ann: VarAnn,
    },
    Sub {
        #[serde(default)]
        var_ann: VarAnn,
    },
    Mul {
        #[serde(default)]
        var_ann: VarAnn,
    },
    Ediv {
        #[serde(default)]
        var_ann: VarAnn,
    },
    Abs {
        #[serde(default)]
        var_ann: VarAnn,
    },
    Neg {
        #[serde(default)]
        var_ann: VarAnn,
    },
    Not {
        #[serde(default)]
        var_ann: VarAnn,
    },
    Int {
        #[serde(default)]
        var_ann: VarAnn,
    },
    And {
        #[serde(default)]
        var_ann: VarAnn,
    },
    Or {
        #[serde(default)]
        var_ann: VarAnn,
    },
    Xor {
        #[serde(default)]
        var_ann: VarAnn,
    },
    Lsl {
        #[serde(default)]
        var_ann: VarAnn,
    },
    Lsr {
        #[serde(default)]
        var_ann: VarAnn,
    },
    Compare {
        #[serde(default)]
        var_ann: VarAnn,
    },
    Eq {
        #[serde(default)]
        var_ann: VarAnn,
    },
    Neq {
        #[serde(default)]
        var_ann: VarAnn,
    },
    Lt {
        #[serde(default)]
        var_ann: VarAnn,
    },
    Gt {
        #[serde(default)]
        var_ann: VarAnn,
    },
    Le {
        #[serde(default)]
        var_ann: VarAnn,
    },
    Ge {
        #[serde(default)]
        var_ann: VarAnn,
    },
    Now {
        #[serde(default)]
        var_ann: VarAnn,
    },
    Amount {
        #[serde(default)]
        var_ann: VarAnn,
    },
    Balance {
        #[serde(default)]
        var_ann: VarAnn,
    },
    Sender {
        #[serde(default)]
        var_ann: VarAnn,
    },
    Source {
        #[serde(default)]
        var_ann: VarAnn,
    },
    SelfContract {
        #[serde(default)]
        var_ann: VarAnn,
    },
    Address {
        #[serde(default)]
        var_ann: VarAnn,
    },
    Contract {
        #[serde(default)]
        var_ann: VarAnn,
        param_ty: UType,
    },
    ImplicitAccount {
        #[serde(default)]
        var_ann: VarAnn,
    },
    TransferTokens {
        #[serde(default)]
        var_ann: VarAnn,
    },
    SetDelegate {
        #[serde(default)]
        var_ann: VarAnn,
    },
    CreateAccount {
        #[serde(default)]
        op_var: VarAnn,
        #[serde(default)]
        addr_var: VarAnn,
    },
    CreateContract {
        #[serde(default)]
        op_var: VarAnn,
        #[serde(default)]
        addr_var: VarAnn,
        param_ty: UType,
        storage_ty: UType,
        code: Vec<UInstr>,
    },
    Ext(UExtInstr),
}

impl UInstr {
    /// `PUSH` with no annotations; the fixture-building workhorse.
    pub fn push(ty: UType, value: UValue) -> UInstr {
        UInstr::Push {
            var_ann: VarAnn::none(),
            ty,
            value,
        }
    }
}

// ──────────────────────────────────────────────
// Extension instructions
// ──────────────────────────────────────────────

/// The meta-instructions of the test dialect: stack-shape assertions,
/// named stack-pattern frames, diagnostic printing, inline assertions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UExtInstr {
    StackType(StackTypePattern),
    Fn {
        name: String,
        pattern: FnPattern,
        body: Vec<UInstr>,
    },
    Print(PrintComment),
    TestAssert {
        name: String,
        comment: PrintComment,
        body: Vec<UInstr>,
    },
}

/// A stack-shape pattern: a concrete prefix and an open or closed tail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackTypePattern {
    pub items: Vec<StackPatternItem>,
    pub tail: StackTail,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StackPatternItem {
    /// A named type variable; repeated uses must unify.
    TyVar(String),
    Ty(UType),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StackTail {
    /// The pattern covers the whole stack.
    Empty,
    /// Anything may follow the prefix.
    Rest,
}

/// Input/output contract of an `FN` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FnPattern {
    pub quantified: Vec<String>,
    pub input: StackTypePattern,
    pub output: StackTypePattern,
}

/// A `PRINT`/`TEST_ASSERT` comment: literal text interleaved with stack
/// references rendered from the live stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrintComment {
    pub parts: Vec<PrintPart>,
}

impl PrintComment {
    pub fn text(s: impl Into<String>) -> PrintComment {
        PrintComment {
            parts: vec![PrintPart::Text(s.into())],
        }
    }

    pub fn empty() -> PrintComment {
        PrintComment { parts: Vec::new() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrintPart {
    Text(String),
    StackRef(usize),
}

// ──────────────────────────────────────────────
// Contracts
// ──────────────────────────────────────────────

/// An unchecked contract as delivered by the parser or interchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UContract {
    pub parameter: UType,
    pub storage: UType,
    pub code: Vec<UInstr>,
}

impl UContract {
    pub fn from_json(json: &str) -> Result<UContract, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_builds_pair_notes_from_field_anns() {
        let ut = UType::pair(
            UType::int().with_field_ann("balance"),
            UType::nat().with_field_ann("counter").with_type_ann("ctr"),
        );
        let (ty, notes) = ut.extract().unwrap();
        assert_eq!(ty, Type::pair(Type::int(), Type::nat()));
        match notes {
            Notes::Pair {
                first_field,
                second_field,
                second,
                ..
            } => {
                assert_eq!(first_field, FieldAnn::new("balance"));
                assert_eq!(second_field, FieldAnn::new("counter"));
                assert_eq!(*second, Notes::Atom(TypeAnn::new("ctr")));
            }
            other => panic!("expected pair notes, got {:?}", other),
        }
    }

    #[test]
    fn extract_collapses_unannotated_types_to_star() {
        let (_, notes) = UType::pair(UType::int(), UType::nat()).extract().unwrap();
        assert!(notes.is_star());
    }

    #[test]
    fn extract_rejects_non_comparable_set_elements() {
        let ut = UType::set(UType::list(UType::int()));
        assert!(ut.extract().is_err());
    }

    #[test]
    fn extract_rejects_operation_in_map_value() {
        let ut = UType::map(UType::int(), UType::operation());
        assert!(ut.extract().is_err());
    }

    #[test]
    fn contract_json_round_trip() {
        let contract = UContract {
            parameter: UType::unit(),
            storage: UType::int(),
            code: vec![
                UInstr::Drop,
                UInstr::push(UType::int(), UValue::int(42)),
                UInstr::Nil {
                    type_ann: TypeAnn::none(),
                    var_ann: VarAnn::none(),
                    ty: UType::operation(),
                },
                UInstr::Pair {
                    type_ann: TypeAnn::none(),
                    var_ann: VarAnn::none(),
                    first_field: FieldAnn::none(),
                    second_field: FieldAnn::none(),
                },
            ],
        };
        let json = contract.to_json().unwrap();
        assert_eq!(UContract::from_json(&json).unwrap(), contract);
    }
}
