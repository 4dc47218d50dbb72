//! mica-eval: the runtime half of the Michelson harness.
//!
//! An in-memory chain simulator: a pure interpreter over global-state
//! snapshots ([`interpreter::interpret`]), the state model with its
//! canonical update journal ([`gstate`]), and the scenario driver with
//! composable validators ([`scenario`]). The static half (types, values,
//! type checker) lives in `mica-core`.

pub mod gstate;
pub mod interpreter;
pub mod scenario;

pub use gstate::{apply_updates, AccountState, ContractState, GState, GStateError, GStateUpdate};
pub use interpreter::{
    interpret, InterpreterError, InterpreterOp, InterpreterRes, OriginateOp, RemainingSteps,
    RuntimeFailure, TransferOp, TxData,
};
pub use scenario::{
    expect_any_success, expect_balance, expect_gas_exhaustion, expect_michelson_failed,
    expect_storage_const, expect_storage_update, expect_storage_update_const, Scenario,
    SuccessValidator, ValidationError, Validator,
};
