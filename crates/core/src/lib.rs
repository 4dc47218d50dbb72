//! mica-core: the static half of the Michelson harness.
//!
//! Provides the type algebra, the annotation algebra with its derivation
//! rules, the typed value and instruction model, and the type checker
//! (including the `STACKTYPE`/`FN`/`PRINT`/`TEST_ASSERT` extension
//! dialect). The runtime half lives in `mica-eval`.
//!
//! # Public API
//!
//! - [`typecheck_contract`] -- check a whole contract
//! - [`typecheck`] -- check an instruction sequence against a stack
//! - [`typecheck_value`] -- check a value literal against a type
//! - Model types: [`Type`], [`Value`], [`Instr`], [`Notes`], [`UContract`]

pub mod annotation;
pub mod instr;
pub mod ty;
pub mod typecheck;
pub mod untyped;
pub mod value;

pub use annotation::{converge, AnnError, FieldAnn, Notes, TypeAnn, VarAnn};
pub use instr::{Instr, Lambda, TypedContract};
pub use ty::{Comparable, Type};
pub use typecheck::{
    typecheck, typecheck_contract, typecheck_value, ExtError, Hst, SomeInstr, StackItem, TcError,
};
pub use untyped::{UContract, UInstr, UType, UValue};
pub use value::{
    Address, AddressKind, KeyHash, Mutez, Operation, PublicKey, Signature, Value,
};
