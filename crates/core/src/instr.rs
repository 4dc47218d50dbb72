//! The index-erased typed instruction tree.
//!
//! In the reference encoding every instruction is indexed by its input and
//! output stack shapes; here those indices live in the checker's stack
//! descriptors, and an `Instr` value is only ever produced by a successful
//! type check. Structured opcodes embed their sub-trees as `Vec<Instr>`
//! bodies whose shapes the checker has already connected.

use crate::annotation::Notes;
use crate::ty::{Comparable, Type};
use crate::untyped::PrintComment;
use crate::value::Value;

/// A type-checked instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instr {
    /// No-op; what `STACKTYPE` and friends erase to.
    Nop,
    Drop,
    Dup,
    Swap,
    Push {
        ty: Type,
        value: Value,
    },
    Unit,
    Some,
    None {
        ty: Type,
    },
    IfNone {
        if_none: Vec<Instr>,
        if_some: Vec<Instr>,
    },
    Pair,
    Car,
    Cdr,
    Left {
        right_ty: Type,
    },
    Right {
        left_ty: Type,
    },
    IfLeft {
        if_left: Vec<Instr>,
        if_right: Vec<Instr>,
    },
    Nil {
        ty: Type,
    },
    Cons,
    IfCons {
        if_cons: Vec<Instr>,
        if_nil: Vec<Instr>,
    },
    EmptySet {
        elem: Comparable,
    },
    EmptyMap {
        key: Comparable,
        value: Type,
    },
    Map {
        body: Vec<Instr>,
    },
    Iter {
        body: Vec<Instr>,
    },
    Mem,
    Get,
    Update,
    Size,
    Concat,
    /// List-form `CONCAT`; the element kind disambiguates the empty list.
    ConcatList {
        elem: Comparable,
    },
    Slice,
    If {
        if_true: Vec<Instr>,
        if_false: Vec<Instr>,
    },
    Loop {
        body: Vec<Instr>,
    },
    LoopLeft {
        body: Vec<Instr>,
    },
    Lambda {
        lambda: Lambda,
    },
    Exec,
    Dip {
        body: Vec<Instr>,
    },
    Failwith,
    Cast,
    Rename,
    Add,
    Sub,
    Mul,
    Ediv,
    Abs,
    Neg,
    Not,
    Int,
    And,
    Or,
    Xor,
    Lsl,
    Lsr,
    Compare,
    Eq,
    Neq,
    Lt,
    Gt,
    Le,
    Ge,
    Now,
    Amount,
    Balance,
    Sender,
    Source,
    SelfContract,
    Address,
    Contract {
        param_ty: Type,
    },
    ImplicitAccount,
    TransferTokens {
        param_ty: Type,
    },
    SetDelegate,
    CreateAccount,
    CreateContract {
        param_ty: Type,
        storage_ty: Type,
        code: Vec<Instr>,
    },
    /// Checked `PRINT`: every stack reference is in range.
    Print(PrintComment),
    /// Checked `TEST_ASSERT`: the body leaves `bool` on top and never
    /// unconditionally fails.
    TestAssert {
        name: String,
        comment: PrintComment,
        body: Vec<Instr>,
    },
}

/// A first-class function value: checked code from `[arg]` to `[ret]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lambda {
    pub arg: Type,
    pub ret: Type,
    pub code: Vec<Instr>,
}

/// A fully checked contract: code from `[pair(param, storage)]` to
/// `[pair(list operation, storage)]`, plus the annotation trees inferred
/// for both type descriptors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypedContract {
    pub param_ty: Type,
    pub param_notes: Notes,
    pub storage_ty: Type,
    pub storage_notes: Notes,
    pub code: Vec<Instr>,
}
