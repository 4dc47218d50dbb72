//! End-to-end scenarios: originate, transfer, validate.
//!
//! Each test drives a `Scenario` the way a contract test suite would:
//! queue operations, flush them through the interpreter, and check the
//! resulting state and update journal with composable validators.

use mica_core::annotation::{FieldAnn, TypeAnn, VarAnn};
use mica_core::untyped::{UContract, UInstr, UType, UValue};
use mica_core::value::{Mutez, Value};

use mica_eval::{
    expect_balance, expect_gas_exhaustion, expect_michelson_failed, expect_storage_const,
    Scenario, TxData, ValidationError, Validator,
};

fn mutez(raw: u64) -> Mutez {
    Mutez::new(raw).unwrap()
}

fn nil_operation() -> UInstr {
    UInstr::Nil {
        type_ann: TypeAnn::none(),
        var_ann: VarAnn::none(),
        ty: UType::operation(),
    }
}

fn pair() -> UInstr {
    UInstr::Pair {
        type_ann: TypeAnn::none(),
        var_ann: VarAnn::none(),
        first_field: FieldAnn::none(),
        second_field: FieldAnn::none(),
    }
}

fn car() -> UInstr {
    UInstr::Car {
        var_ann: VarAnn::none(),
        field_ann: FieldAnn::none(),
    }
}

fn unit_tx(scenario: &Scenario, amount: u64) -> TxData {
    TxData {
        sender: scenario.genesis_address(),
        parameter: UValue::Unit,
        amount: mutez(amount),
    }
}

/// `DROP; PUSH int 42; NIL operation; PAIR`
fn set_storage_contract() -> UContract {
    UContract {
        parameter: UType::unit(),
        storage: UType::int(),
        code: vec![
            UInstr::Drop,
            UInstr::push(UType::int(), UValue::int(42)),
            nil_operation(),
            pair(),
        ],
    }
}

/// Stores its own parameter: `CAR; NIL operation; PAIR`.
fn store_parameter_contract() -> UContract {
    UContract {
        parameter: UType::int(),
        storage: UType::int(),
        code: vec![car(), nil_operation(), pair()],
    }
}

#[test]
fn s1_originate_and_set_storage() {
    let mut scenario = Scenario::new();
    let addr = scenario.originate(set_storage_contract(), UValue::int(0), mutez(100));
    let tx = unit_tx(&scenario, 0);
    scenario.transfer(tx, addr);
    scenario
        .validate(Validator::ExpectSuccess(
            expect_storage_const(addr, Value::int(42)).compose(expect_balance(addr, mutez(100))),
        ))
        .unwrap();
}

#[test]
fn s2_gas_exhaustion() {
    // A countdown loop far beyond a three-step budget.
    let looping = UContract {
        parameter: UType::unit(),
        storage: UType::unit(),
        code: vec![
            UInstr::Drop,
            UInstr::push(UType::int(), UValue::int(1000)),
            UInstr::push(UType::bool(), UValue::True),
            UInstr::Loop {
                body: vec![
                    UInstr::push(UType::int(), UValue::int(1)),
                    UInstr::Swap,
                    UInstr::Sub {
                        var_ann: VarAnn::none(),
                    },
                    UInstr::Dup {
                        var_ann: VarAnn::none(),
                    },
                    UInstr::Gt {
                        var_ann: VarAnn::none(),
                    },
                ],
            },
            UInstr::Drop,
            UInstr::Unit {
                type_ann: TypeAnn::none(),
                var_ann: VarAnn::none(),
            },
            nil_operation(),
            pair(),
        ],
    };

    let mut scenario = Scenario::new();
    scenario.set_max_steps(3);
    let addr = scenario.originate(looping, UValue::Unit, mutez(0));
    let tx = unit_tx(&scenario, 0);
    scenario.transfer(tx, addr);
    scenario.validate(expect_gas_exhaustion()).unwrap();
}

#[test]
fn s3_failwith_propagation() {
    let failing = UContract {
        parameter: UType::unit(),
        storage: UType::unit(),
        code: vec![
            UInstr::Drop,
            UInstr::push(UType::string(), UValue::string("nope")),
            UInstr::Failwith,
        ],
    };

    let mut scenario = Scenario::new();
    let addr = scenario.originate(failing, UValue::Unit, mutez(0));
    let tx = unit_tx(&scenario, 0);
    scenario.transfer(tx, addr);
    scenario
        .validate(expect_michelson_failed(
            |v| *v == Value::String("nope".into()),
            addr,
        ))
        .unwrap();
}

#[test]
fn s4_chained_operations() {
    let mut scenario = Scenario::new();

    // B stores whatever parameter it receives.
    let addr_b = scenario.originate(store_parameter_contract(), UValue::int(0), mutez(100));

    // A sends `7` and 10 mutez to B.
    let caller = UContract {
        parameter: UType::unit(),
        storage: UType::unit(),
        code: vec![
            UInstr::Cdr {
                var_ann: VarAnn::none(),
                field_ann: FieldAnn::none(),
            },
            UInstr::push(UType::address(), UValue::String(addr_b.to_string())),
            UInstr::Contract {
                var_ann: VarAnn::none(),
                param_ty: UType::int(),
            },
            UInstr::IfNone {
                if_none: vec![
                    UInstr::push(UType::string(), UValue::string("no target")),
                    UInstr::Failwith,
                ],
                if_some: vec![],
            },
            UInstr::push(UType::mutez(), UValue::int(10)),
            UInstr::push(UType::int(), UValue::int(7)),
            UInstr::TransferTokens {
                var_ann: VarAnn::none(),
            },
            nil_operation(),
            UInstr::Swap,
            UInstr::Cons {
                var_ann: VarAnn::none(),
            },
            pair(),
        ],
    };
    let addr_a = scenario.originate(caller, UValue::Unit, mutez(50));

    let tx = unit_tx(&scenario, 0);
    scenario.transfer(tx, addr_a);
    scenario
        .validate(Validator::ExpectSuccess(
            expect_storage_const(addr_b, Value::int(7))
                .compose(expect_balance(addr_b, mutez(110)))
                .compose(expect_balance(addr_a, mutez(40))),
        ))
        .unwrap();
}

#[test]
fn s5_atomic_rollback() {
    let mut scenario = Scenario::new();
    let addr = scenario.originate(store_parameter_contract(), UValue::int(0), mutez(0));

    let tx1 = TxData {
        sender: scenario.genesis_address(),
        parameter: UValue::int(1),
        amount: mutez(0),
    };
    scenario.transfer(tx1, addr);
    scenario
        .validate(Validator::ExpectSuccess(expect_storage_const(
            addr,
            Value::int(1),
        )))
        .unwrap();

    // A deliberately wrong expectation: the batch runs but must not be
    // committed.
    let tx2 = TxData {
        sender: scenario.genesis_address(),
        parameter: UValue::int(2),
        amount: mutez(0),
    };
    scenario.transfer(tx2, addr);
    let err = scenario
        .validate(Validator::ExpectSuccess(expect_storage_const(
            addr,
            Value::int(99),
        )))
        .unwrap_err();
    assert!(matches!(err, ValidationError::IncorrectUpdates { .. }));

    // The committed state is still the one after transfer 1.
    assert_eq!(
        scenario.gstate().contract(&addr).unwrap().storage,
        Value::int(1)
    );

    // The scenario is poisoned: later validations report the failure.
    assert_eq!(scenario.failure(), Some(&err));
    let again = scenario
        .validate(Validator::ExpectSuccess(expect_storage_const(
            addr,
            Value::int(1),
        )))
        .unwrap_err();
    assert_eq!(again, err);
}

#[test]
fn expected_failures_leave_state_untouched() {
    let mut scenario = Scenario::new();
    let addr = scenario.originate(set_storage_contract(), UValue::int(5), mutez(10));
    let tx = unit_tx(&scenario, 0);
    scenario.transfer(tx, addr);
    scenario
        .validate(Validator::ExpectSuccess(expect_storage_const(
            addr,
            Value::int(42),
        )))
        .unwrap();

    // An underfunded transfer: the batch fails, the snapshot stays.
    let broke = TxData {
        sender: scenario.genesis_address(),
        parameter: UValue::Unit,
        amount: Mutez::MAX,
    };
    scenario.transfer(broke, addr);
    scenario
        .validate(Validator::ExpectError(Box::new(|e| {
            matches!(
                e,
                mica_eval::InterpreterError::InterpreterFailed(
                    _,
                    mica_eval::RuntimeFailure::MutezUnderflow
                )
            )
        })))
        .unwrap();
    assert_eq!(
        scenario.gstate().contract(&addr).unwrap().storage,
        Value::int(42)
    );
}
