// Property tests for the interpreter's determinism guarantees.
//
// Two runs over equal inputs must produce identical journals and states,
// and replaying a journal over the input snapshot must reproduce the
// output snapshot exactly.

use proptest::prelude::*;

use mica_core::annotation::{FieldAnn, TypeAnn, VarAnn};
use mica_core::untyped::{UContract, UInstr, UType, UValue};
use mica_core::value::Mutez;

use mica_eval::interpreter::{contract_address, origination_payload};
use mica_eval::{apply_updates, interpret, GState, InterpreterOp, OriginateOp, TransferOp, TxData};

/// `CAR; NIL operation; PAIR` — stores the parameter it receives.
fn store_parameter_contract() -> UContract {
    UContract {
        parameter: UType::int(),
        storage: UType::int(),
        code: vec![
            UInstr::Car {
                var_ann: VarAnn::none(),
                field_ann: FieldAnn::none(),
            },
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
    }
}

/// One batch: originate the store-parameter contract, then call it.
fn batch(initial: i64, parameter: i64, balance: u64, amount: u64) -> Vec<InterpreterOp> {
    let contract = store_parameter_contract();
    let storage = UValue::int(initial);
    let balance = Mutez::new(balance).unwrap();
    let payload = origination_payload(&contract, &storage, balance);
    let dest = contract_address(&payload, 0);
    vec![
        InterpreterOp::Originate(OriginateOp {
            contract,
            initial_storage: storage,
            balance,
        }),
        InterpreterOp::Transfer(TransferOp {
            tx: TxData {
                sender: GState::genesis_address(),
                parameter: UValue::int(parameter),
                amount: Mutez::new(amount).unwrap(),
            },
            dest,
        }),
    ]
}

proptest! {
    #[test]
    fn runs_are_deterministic(
        initial in -1000i64..1000,
        parameter in -1000i64..1000,
        balance in 0u64..10_000,
        amount in 0u64..10_000,
    ) {
        let genesis = GState::genesis();
        let ops = batch(initial, parameter, balance, amount);
        let first = interpret(0, 10_000, &genesis, &ops).unwrap();
        let second = interpret(0, 10_000, &genesis, &ops).unwrap();
        prop_assert_eq!(&first.updates, &second.updates);
        prop_assert_eq!(&first.gstate, &second.gstate);
        prop_assert_eq!(first.remaining_steps, second.remaining_steps);
    }

    #[test]
    fn journal_replay_reproduces_the_state(
        initial in -1000i64..1000,
        parameter in -1000i64..1000,
        amount in 0u64..10_000,
    ) {
        let genesis = GState::genesis();
        let ops = batch(initial, parameter, 50, amount);
        let res = interpret(0, 10_000, &genesis, &ops).unwrap();
        prop_assert_eq!(apply_updates(&genesis, &res.updates).unwrap(), res.gstate);
    }

    #[test]
    fn failed_batches_change_nothing(
        initial in -1000i64..1000,
    ) {
        // A two-step budget cannot even finish the contract body, so the
        // batch fails; the caller keeps using the original snapshot.
        let genesis = GState::genesis();
        let ops = batch(initial, 1, 10, 0);
        let err = interpret(0, 2, &genesis, &ops);
        prop_assert!(err.is_err());
        prop_assert_eq!(genesis, GState::genesis());
    }
}
