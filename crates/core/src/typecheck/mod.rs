//! Untyped → typed lowering.
//!
//! The checker walks an untyped instruction sequence against a
//! hypothetical stack: a vector of `(type, notes, variable)` triples with
//! index 0 at the top. Each step verifies the stack prefix the opcode
//! consumes, derives the annotations of what it produces, and emits the
//! corresponding typed instruction. A successful result ties the emitted
//! code to its input and output stack descriptors; `FAILWITH` tails are
//! existentially "any output" and act as bottom during branch convergence.

mod ext;
mod instr;
mod prim;
mod value;

use std::collections::BTreeMap;
use std::fmt;

use crate::annotation::{AnnError, Notes, VarAnn};
use crate::instr::{Instr, TypedContract};
use crate::ty::Type;
use crate::untyped::{UContract, UInstr, UValue};

pub use value::typecheck_value;

// ──────────────────────────────────────────────
// Hypothetical stack types
// ──────────────────────────────────────────────

/// One slot of the hypothetical stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackItem {
    pub ty: Type,
    pub notes: Notes,
    pub var: VarAnn,
}

impl StackItem {
    pub fn new(ty: Type, notes: Notes, var: VarAnn) -> StackItem {
        StackItem { ty, notes, var }
    }

    /// A slot with no annotations.
    pub fn plain(ty: Type) -> StackItem {
        StackItem {
            ty,
            notes: Notes::Star,
            var: VarAnn::none(),
        }
    }
}

impl fmt::Display for StackItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.ty)?;
        if !self.var.is_none() {
            write!(f, " {}", self.var)?;
        }
        Ok(())
    }
}

/// The hypothetical stack type; index 0 is the top.
pub type Hst = Vec<StackItem>;

pub(crate) fn fmt_stack(stack: &Hst) -> String {
    let mut out = String::from("[");
    for (i, item) in stack.iter().enumerate() {
        if i > 0 {
            out.push_str(" : ");
        }
        out.push_str(&item.to_string());
    }
    out.push(']');
    out
}

/// A checked instruction sequence with its (existential) output stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SomeInstr {
    /// Normal code: runs from the input stack to the carried output stack.
    Typed(Vec<Instr>, Hst),
    /// Code ending in an unconditional failure; fits any output stack.
    AnyOut(Vec<Instr>),
}

impl SomeInstr {
    pub fn code(&self) -> &[Instr] {
        match self {
            SomeInstr::Typed(code, _) => code,
            SomeInstr::AnyOut(code) => code,
        }
    }
}

// ──────────────────────────────────────────────
// Errors
// ──────────────────────────────────────────────

/// A type-checking failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TcError {
    /// An instruction did not fit the stack it was applied to.
    FailedOnInstr {
        instr: UInstr,
        stack: Hst,
        message: String,
    },
    /// A value literal did not have its expected type.
    FailedOnValue {
        value: UValue,
        expected: Type,
        message: String,
    },
    /// An extension meta-instruction failed.
    Ext { stack: Hst, error: ExtError },
    /// The contract envelope itself is malformed: bad parameter/storage
    /// type expression, or code with the wrong output shape.
    Contract { message: String },
    /// Code after an unconditional failure.
    Unreachable,
}

impl fmt::Display for TcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TcError::FailedOnInstr {
                instr,
                stack,
                message,
            } => write!(
                f,
                "type check failed on {:?} with stack {}: {}",
                instr,
                fmt_stack(stack),
                message
            ),
            TcError::FailedOnValue {
                value,
                expected,
                message,
            } => write!(
                f,
                "value {:?} is not a valid {}: {}",
                value, expected, message
            ),
            TcError::Ext { stack, error } => write!(
                f,
                "extension check failed with stack {}: {}",
                fmt_stack(stack),
                error
            ),
            TcError::Contract { message } => write!(f, "ill-formed contract: {}", message),
            TcError::Unreachable => f.write_str("unreachable code after an unconditional failure"),
        }
    }
}

impl std::error::Error for TcError {}

/// Failures specific to the extension meta-instructions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtError {
    LengthMismatch {
        pattern_len: usize,
        stack_len: usize,
    },
    TypeMismatch {
        position: usize,
        expected: Type,
        actual: Type,
    },
    /// A closed pattern met a longer stack, or an open one was required
    /// to end a frame.
    StkRestMismatch,
    VarError(String),
    Ann(AnnError),
    TyVarMismatch {
        var: String,
        bound: Type,
        actual: Type,
    },
    TestAssertError(String),
    InvalidStackReference {
        reference: usize,
        stack_size: usize,
    },
}

impl fmt::Display for ExtError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtError::LengthMismatch {
                pattern_len,
                stack_len,
            } => write!(
                f,
                "stack pattern of length {} does not match stack of length {}",
                pattern_len, stack_len
            ),
            ExtError::TypeMismatch {
                position,
                expected,
                actual,
            } => write!(
                f,
                "pattern mismatch at position {}: expected {}, got {}",
                position, expected, actual
            ),
            ExtError::StkRestMismatch => f.write_str("stack tail does not match the pattern tail"),
            ExtError::VarError(message) => write!(f, "stack pattern error: {}", message),
            ExtError::Ann(e) => write!(f, "{}", e),
            ExtError::TyVarMismatch { var, bound, actual } => write!(
                f,
                "type variable '{}' already bound to {}, cannot rebind to {}",
                var, bound, actual
            ),
            ExtError::TestAssertError(message) => write!(f, "TEST_ASSERT: {}", message),
            ExtError::InvalidStackReference {
                reference,
                stack_size,
            } => write!(
                f,
                "stack reference %[{}] is out of range for a stack of {} items",
                reference, stack_size
            ),
        }
    }
}

impl std::error::Error for ExtError {}

impl From<AnnError> for ExtError {
    fn from(e: AnnError) -> Self {
        ExtError::Ann(e)
    }
}

// ──────────────────────────────────────────────
// Checker state and entry points
// ──────────────────────────────────────────────

/// Bindings of stack-pattern type variables within one `FN` frame.
pub(crate) type TyVarMap = BTreeMap<String, (Type, Notes)>;

/// Walker state threaded through a check: the contract's own parameter
/// type (for `SELF`) and the extension checker's variable scopes.
pub(crate) struct Checker {
    pub self_param: Option<(Type, Notes)>,
    pub scopes: Vec<TyVarMap>,
}

impl Checker {
    pub(crate) fn new(self_param: Option<(Type, Notes)>) -> Checker {
        Checker {
            self_param,
            scopes: vec![TyVarMap::new()],
        }
    }
}

/// Type-check an instruction sequence against a starting stack.
pub fn typecheck(code: &[UInstr], start: Hst) -> Result<SomeInstr, TcError> {
    let mut checker = Checker::new(None);
    instr::check_seq(&mut checker, code, start)
}

/// Type-check a whole contract: code from `[pair(parameter, storage)]`
/// to `[pair(list operation, storage)]`.
pub fn typecheck_contract(contract: &UContract) -> Result<TypedContract, TcError> {
    let (param_ty, param_notes) = contract
        .parameter
        .extract()
        .map_err(|message| TcError::Contract {
            message: format!("bad parameter type: {}", message),
        })?;
    let (storage_ty, storage_notes) = contract
        .storage
        .extract()
        .map_err(|message| TcError::Contract {
            message: format!("bad storage type: {}", message),
        })?;

    let input = vec![StackItem::new(
        Type::pair(param_ty.clone(), storage_ty.clone()),
        Notes::Pair {
            type_ann: crate::annotation::TypeAnn::none(),
            first_field: crate::annotation::FieldAnn::none(),
            second_field: crate::annotation::FieldAnn::none(),
            first: Box::new(param_notes.clone()),
            second: Box::new(storage_notes.clone()),
        },
        VarAnn::none(),
    )];

    let mut checker = Checker::new(Some((param_ty.clone(), param_notes.clone())));
    let checked = instr::check_seq(&mut checker, &contract.code, input)?;

    let code = match checked {
        SomeInstr::AnyOut(code) => code,
        SomeInstr::Typed(code, out) => {
            let expected = Type::pair(Type::list(Type::Operation), storage_ty.clone());
            if out.len() != 1 {
                return Err(TcError::Contract {
                    message: format!(
                        "contract code must leave exactly one stack element, got {}",
                        fmt_stack(&out)
                    ),
                });
            }
            if out[0].ty != expected {
                return Err(TcError::Contract {
                    message: format!("contract code must end with {}, got {}", expected, out[0].ty),
                });
            }
            code
        }
    };

    Ok(TypedContract {
        param_ty,
        param_notes,
        storage_ty,
        storage_notes,
        code,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotation::{FieldAnn, TypeAnn};
    use crate::untyped::{UType, UValue};
    use crate::value::Value;

    fn push_int(value: i64, var: &str) -> UInstr {
        UInstr::Push {
            var_ann: if var.is_empty() {
                VarAnn::none()
            } else {
                VarAnn::new(var)
            },
            ty: UType::int(),
            value: UValue::int(value),
        }
    }

    fn push_nat(value: i64) -> UInstr {
        UInstr::Push {
            var_ann: VarAnn::none(),
            ty: UType::nat(),
            value: UValue::Int(value.into()),
        }
    }

    fn pair_with_fields(first: &str, second: &str) -> UInstr {
        UInstr::Pair {
            type_ann: TypeAnn::none(),
            var_ann: VarAnn::none(),
            first_field: FieldAnn::new(first),
            second_field: FieldAnn::new(second),
        }
    }

    fn add() -> UInstr {
        UInstr::Add {
            var_ann: VarAnn::none(),
        }
    }

    fn expect_typed(result: SomeInstr) -> Hst {
        match result {
            SomeInstr::Typed(_, out) => out,
            SomeInstr::AnyOut(_) => panic!("expected a typed result"),
        }
    }

    #[test]
    fn pair_special_annotations_split_shared_prefix() {
        let code = vec![
            push_int(1, "a.x"),
            push_int(2, "a.y"),
            pair_with_fields("@", "@"),
        ];
        let out = expect_typed(typecheck(&code, vec![]).unwrap());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].var, VarAnn::new("a"));
        match &out[0].notes {
            Notes::Pair {
                first_field,
                second_field,
                ..
            } => {
                // The second push is on top, so it becomes the first
                // component of the pair.
                assert_eq!(*first_field, FieldAnn::new("y"));
                assert_eq!(*second_field, FieldAnn::new("x"));
            }
            other => panic!("expected pair notes, got {:?}", other),
        }
    }

    #[test]
    fn car_preserves_field_and_rejects_conflicts() {
        let code = vec![
            push_int(1, ""),
            push_int(2, ""),
            pair_with_fields("p", "q"),
            UInstr::Car {
                var_ann: VarAnn::none(),
                field_ann: FieldAnn::new("p"),
            },
        ];
        assert!(typecheck(&code, vec![]).is_ok());

        let conflicting = vec![
            push_int(1, ""),
            push_int(2, ""),
            pair_with_fields("p", "q"),
            UInstr::Car {
                var_ann: VarAnn::none(),
                field_ann: FieldAnn::new("z"),
            },
        ];
        match typecheck(&conflicting, vec![]).unwrap_err() {
            TcError::Ext {
                error: ExtError::Ann(_),
                ..
            } => {}
            other => panic!("expected an annotation conflict, got {:?}", other),
        }
    }

    #[test]
    fn arithmetic_join_types() {
        let out = expect_typed(typecheck(&[push_nat(1), push_nat(2), add()], vec![]).unwrap());
        assert_eq!(out[0].ty, Type::nat());

        let out = expect_typed(
            typecheck(&[push_nat(1), push_int(2, ""), add()], vec![]).unwrap(),
        );
        assert_eq!(out[0].ty, Type::int());
    }

    #[test]
    fn arithmetic_rejects_unlisted_combinations() {
        let code = vec![
            UInstr::push(UType::mutez(), UValue::int(1)),
            push_nat(2),
            add(),
        ];
        match typecheck(&code, vec![]).unwrap_err() {
            TcError::FailedOnInstr { message, .. } => {
                assert!(message.contains("type mismatch"))
            }
            other => panic!("expected instruction failure, got {:?}", other),
        }
    }

    #[test]
    fn branches_must_converge() {
        let code = vec![
            UInstr::push(UType::bool(), UValue::True),
            UInstr::If {
                if_true: vec![push_int(1, "")],
                if_false: vec![push_nat(1)],
            },
        ];
        assert!(typecheck(&code, vec![]).is_err());
    }

    #[test]
    fn failing_branch_adopts_the_other_stack() {
        let code = vec![
            UInstr::push(UType::bool(), UValue::True),
            UInstr::If {
                if_true: vec![push_int(1, "")],
                if_false: vec![
                    UInstr::push(UType::string(), UValue::string("no")),
                    UInstr::Failwith,
                ],
            },
        ];
        let out = expect_typed(typecheck(&code, vec![]).unwrap());
        assert_eq!(out[0].ty, Type::int());
    }

    #[test]
    fn code_after_failwith_is_unreachable() {
        let code = vec![
            UInstr::push(UType::string(), UValue::string("no")),
            UInstr::Failwith,
            UInstr::Drop,
        ];
        assert_eq!(typecheck(&code, vec![]).unwrap_err(), TcError::Unreachable);
    }

    #[test]
    fn compare_then_sign_test() {
        let code = vec![
            push_int(1, ""),
            push_int(2, ""),
            UInstr::Compare {
                var_ann: VarAnn::none(),
            },
            UInstr::Eq {
                var_ann: VarAnn::none(),
            },
        ];
        let out = expect_typed(typecheck(&code, vec![]).unwrap());
        assert_eq!(out[0].ty, Type::bool());
    }

    #[test]
    fn lambda_and_exec() {
        let code = vec![
            push_int(5, ""),
            UInstr::Lambda {
                var_ann: VarAnn::none(),
                arg_ty: UType::int(),
                ret_ty: UType::int(),
                body: vec![push_int(1, ""), add()],
            },
            UInstr::Swap,
            UInstr::Exec {
                var_ann: VarAnn::none(),
            },
        ];
        let out = expect_typed(typecheck(&code, vec![]).unwrap());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].ty, Type::int());
    }

    #[test]
    fn dip_protects_the_top() {
        let code = vec![
            push_int(1, ""),
            push_nat(2),
            UInstr::Dip {
                body: vec![UInstr::Drop],
            },
        ];
        let out = expect_typed(typecheck(&code, vec![]).unwrap());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].ty, Type::nat());
    }

    #[test]
    fn typechecks_a_simple_contract() {
        let contract = UContract {
            parameter: UType::unit(),
            storage: UType::int(),
            code: vec![
                UInstr::Drop,
                push_int(42, ""),
                UInstr::Nil {
                    type_ann: TypeAnn::none(),
                    var_ann: VarAnn::none(),
                    ty: UType::operation(),
                },
                pair_with_fields("", ""),
            ],
        };
        let typed = typecheck_contract(&contract).unwrap();
        assert_eq!(typed.param_ty, Type::Unit);
        assert_eq!(typed.storage_ty, Type::int());
        assert_eq!(typed.code.len(), 4);
        assert!(matches!(
            typed.code[1],
            Instr::Push {
                value: Value::Int(_),
                ..
            }
        ));
    }

    #[test]
    fn contract_with_wrong_output_is_rejected() {
        let contract = UContract {
            parameter: UType::unit(),
            storage: UType::int(),
            code: vec![UInstr::Drop, push_int(42, "")],
        };
        match typecheck_contract(&contract).unwrap_err() {
            TcError::Contract { message } => {
                assert!(message.contains("must end with"))
            }
            other => panic!("expected a contract error, got {:?}", other),
        }
    }

    #[test]
    fn map_over_list_retypes_elements() {
        let start = vec![StackItem::plain(Type::list(Type::int()))];
        let code = vec![UInstr::Map {
            var_ann: VarAnn::none(),
            body: vec![UInstr::Eq {
                var_ann: VarAnn::none(),
            }],
        }];
        let out = expect_typed(typecheck(&code, start).unwrap());
        assert_eq!(out[0].ty, Type::list(Type::bool()));
    }

    #[test]
    fn iter_consumes_elements() {
        let start = vec![
            StackItem::plain(Type::list(Type::int())),
            StackItem::plain(Type::int()),
        ];
        let code = vec![UInstr::Iter {
            body: vec![add()],
        }];
        let out = expect_typed(typecheck(&code, start).unwrap());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].ty, Type::int());
    }

    #[test]
    fn collection_lookups() {
        let start = vec![
            StackItem::plain(Type::string()),
            StackItem::plain(Type::Map(
                crate::ty::Comparable::String,
                Box::new(Type::nat()),
            )),
        ];
        let code = vec![UInstr::Get {
            var_ann: VarAnn::none(),
        }];
        let out = expect_typed(typecheck(&code, start).unwrap());
        assert_eq!(out[0].ty, Type::option(Type::nat()));
    }
}
