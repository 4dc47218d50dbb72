//! Integrational scenarios: originate, transfer, validate.
//!
//! A `Scenario` owns the simulated chain: the clock, the step budget, the
//! state snapshot, and the queue of pending operations. `validate`
//! flushes the queue through the interpreter and applies a validator; the
//! new snapshot is committed only when the validator passes, so a batch
//! is atomic by construction. The first failure poisons the scenario:
//! every later operation is a no-op and `validate` keeps returning the
//! stored error.

use mica_core::untyped::{UContract, UValue};
use mica_core::value::{Address, Mutez, Value};

use crate::gstate::{GState, GStateUpdate};
use crate::interpreter::{
    contract_address, interpret, origination_payload, InterpreterError, InterpreterOp,
    OriginateOp, RuntimeFailure, TransferOp, TxData,
};

const DEFAULT_MAX_STEPS: u64 = 100_000;

// ──────────────────────────────────────────────
// Validators
// ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("unexpected interpreter error: {0}")]
    UnexpectedInterpreterError(InterpreterError),

    #[error("expected the interpreter to fail, but it succeeded")]
    ExpectingInterpreterToFail,

    #[error("incorrect updates: {error}")]
    IncorrectUpdates {
        error: Box<ValidationError>,
        updates: Vec<GStateUpdate>,
    },

    #[error("missing or wrong storage update for {addr}: {reason}")]
    IncorrectStorageUpdate { addr: Address, reason: String },

    #[error("storage of {addr}: {reason}")]
    StorageMismatch { addr: Address, reason: String },

    #[error("balance of {addr}: expected {expected}, got {actual}")]
    BalanceMismatch {
        addr: Address,
        expected: Mutez,
        actual: Mutez,
    },

    #[error("unknown address: {0}")]
    UnknownAddress(Address),
}

/// A check over the interpreter's successful result.
pub struct SuccessValidator(
    Box<dyn Fn(&GState, &[GStateUpdate]) -> Result<(), ValidationError>>,
);

impl SuccessValidator {
    pub fn new(
        check: impl Fn(&GState, &[GStateUpdate]) -> Result<(), ValidationError> + 'static,
    ) -> SuccessValidator {
        SuccessValidator(Box::new(check))
    }

    pub fn check(
        &self,
        gstate: &GState,
        updates: &[GStateUpdate],
    ) -> Result<(), ValidationError> {
        (self.0)(gstate, updates)
    }

    /// Left-to-right composition; `expect_any_success` is the identity.
    pub fn compose(self, next: SuccessValidator) -> SuccessValidator {
        SuccessValidator::new(move |gstate, updates| {
            self.check(gstate, updates)?;
            next.check(gstate, updates)
        })
    }
}

/// What `validate` should expect of the interpreter outcome.
pub enum Validator {
    /// The batch must fail, with an error this predicate accepts.
    ExpectError(Box<dyn Fn(&InterpreterError) -> bool>),
    /// The batch must succeed and satisfy the validator.
    ExpectSuccess(SuccessValidator),
}

/// Accepts any successful batch.
pub fn expect_any_success() -> SuccessValidator {
    SuccessValidator::new(|_, _| Ok(()))
}

/// The *last* `StorageValueSet` for the address must satisfy `pred`.
pub fn expect_storage_update(
    addr: Address,
    pred: impl Fn(&Value) -> bool + 'static,
) -> SuccessValidator {
    SuccessValidator::new(move |_, updates| {
        let last = updates.iter().rev().find_map(|u| match u {
            GStateUpdate::StorageValueSet { addr: a, storage } if *a == addr => Some(storage),
            _ => None,
        });
        match last {
            None => Err(ValidationError::IncorrectStorageUpdate {
                addr,
                reason: "no storage update in the batch".into(),
            }),
            Some(storage) if !pred(storage) => Err(ValidationError::IncorrectStorageUpdate {
                addr,
                reason: format!("last update set storage to {}", storage),
            }),
            Some(_) => Ok(()),
        }
    })
}

/// The last storage update for the address must set exactly `value`.
pub fn expect_storage_update_const(addr: Address, value: Value) -> SuccessValidator {
    expect_storage_update(addr, move |storage| *storage == value)
}

/// The final state must hold a contract at `addr` storing `value`.
pub fn expect_storage_const(addr: Address, value: Value) -> SuccessValidator {
    SuccessValidator::new(move |gstate, _| match gstate.account(&addr) {
        None => Err(ValidationError::UnknownAddress(addr)),
        Some(crate::gstate::AccountState::Simple { .. }) => {
            Err(ValidationError::StorageMismatch {
                addr,
                reason: "the address holds a plain account, not a contract".into(),
            })
        }
        Some(crate::gstate::AccountState::Contract(c)) => {
            if c.storage == value {
                Ok(())
            } else {
                Err(ValidationError::StorageMismatch {
                    addr,
                    reason: format!("expected {}, got {}", value, c.storage),
                })
            }
        }
    })
}

/// The final state must show exactly this balance.
pub fn expect_balance(addr: Address, expected: Mutez) -> SuccessValidator {
    SuccessValidator::new(move |gstate, _| match gstate.balance(&addr) {
        None => Err(ValidationError::UnknownAddress(addr)),
        Some(actual) if actual == expected => Ok(()),
        Some(actual) => Err(ValidationError::BalanceMismatch {
            addr,
            expected,
            actual,
        }),
    })
}

/// The batch must die of gas exhaustion.
pub fn expect_gas_exhaustion() -> Validator {
    Validator::ExpectError(Box::new(|e| {
        matches!(
            e,
            InterpreterError::InterpreterFailed(_, RuntimeFailure::GasExhaustion)
        )
    }))
}

/// The batch must fail with `FAILWITH` in the given contract, on a value
/// the predicate accepts.
pub fn expect_michelson_failed(
    pred: impl Fn(&Value) -> bool + 'static,
    addr: Address,
) -> Validator {
    Validator::ExpectError(Box::new(move |e| {
        matches!(
            e,
            InterpreterError::InterpreterFailed(a, RuntimeFailure::Failed(v))
                if *a == addr && pred(v)
        )
    }))
}

// ──────────────────────────────────────────────
// The scenario driver
// ──────────────────────────────────────────────

pub struct Scenario {
    now: i64,
    max_steps: u64,
    gstate: GState,
    pending: Vec<InterpreterOp>,
    failure: Option<ValidationError>,
}

impl Scenario {
    pub fn new() -> Scenario {
        Scenario {
            now: 0,
            max_steps: DEFAULT_MAX_STEPS,
            gstate: GState::genesis(),
            pending: Vec::new(),
            failure: None,
        }
    }

    /// The funded faucet account.
    pub fn genesis_address(&self) -> Address {
        GState::genesis_address()
    }

    pub fn set_now(&mut self, now: i64) {
        self.now = now;
    }

    pub fn set_max_steps(&mut self, max_steps: u64) {
        self.max_steps = max_steps;
    }

    /// Queue an origination and return the address it will create.
    ///
    /// The address is derived exactly the way the interpreter will derive
    /// it when the queue is flushed: from the origination payload and the
    /// next free origination nonce. Originations queued before transfers
    /// keep the driver's prediction and the interpreter's assignment in
    /// lock-step.
    pub fn originate(
        &mut self,
        contract: UContract,
        initial_storage: UValue,
        balance: Mutez,
    ) -> Address {
        let pending_originations = self
            .pending
            .iter()
            .filter(|op| matches!(op, InterpreterOp::Originate(_)))
            .count() as u64;
        let nonce = self.gstate.originations() + pending_originations;
        let payload = origination_payload(&contract, &initial_storage, balance);
        let addr = contract_address(&payload, nonce);
        if self.failure.is_none() {
            self.pending.push(InterpreterOp::Originate(OriginateOp {
                contract,
                initial_storage,
                balance,
            }));
        }
        addr
    }

    /// Queue a transfer.
    pub fn transfer(&mut self, tx: TxData, dest: Address) {
        if self.failure.is_none() {
            self.pending
                .push(InterpreterOp::Transfer(TransferOp { tx, dest }));
        }
    }

    /// Flush the pending queue through the interpreter and apply the
    /// validator. On a pass the queue is consumed; the state snapshot is
    /// replaced only when the batch actually succeeded. On a fail the
    /// scenario is poisoned.
    pub fn validate(&mut self, validator: Validator) -> Result<(), ValidationError> {
        if let Some(failure) = &self.failure {
            return Err(failure.clone());
        }
        let ops = std::mem::take(&mut self.pending);
        let outcome = match (
            interpret(self.now, self.max_steps, &self.gstate, &ops),
            validator,
        ) {
            (Err(e), Validator::ExpectError(pred)) => {
                if pred(&e) {
                    Ok(())
                } else {
                    Err(ValidationError::UnexpectedInterpreterError(e))
                }
            }
            (Err(e), Validator::ExpectSuccess(_)) => {
                Err(ValidationError::UnexpectedInterpreterError(e))
            }
            (Ok(_), Validator::ExpectError(_)) => Err(ValidationError::ExpectingInterpreterToFail),
            (Ok(res), Validator::ExpectSuccess(v)) => match v.check(&res.gstate, &res.updates) {
                Ok(()) => {
                    self.gstate = res.gstate;
                    Ok(())
                }
                Err(error) => Err(ValidationError::IncorrectUpdates {
                    error: Box::new(error),
                    updates: res.updates,
                }),
            },
        };
        if let Err(error) = &outcome {
            self.failure = Some(error.clone());
        }
        outcome
    }

    pub fn gstate(&self) -> &GState {
        &self.gstate
    }

    pub fn failure(&self) -> Option<&ValidationError> {
        self.failure.as_ref()
    }
}

impl Default for Scenario {
    fn default() -> Self {
        Scenario::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gstate::GStateUpdate;
    use mica_core::value::Value;

    fn dummy_updates() -> Vec<GStateUpdate> {
        vec![GStateUpdate::StorageValueSet {
            addr: Address::originated([0x11; 20]),
            storage: Value::int(5),
        }]
    }

    #[test]
    fn any_success_is_identity_under_composition() {
        let gstate = GState::genesis();
        let updates = dummy_updates();
        let addr = Address::originated([0x11; 20]);

        let plain = expect_storage_update_const(addr, Value::int(5));
        assert!(plain.check(&gstate, &updates).is_ok());

        let left = expect_any_success()
            .compose(expect_storage_update_const(addr, Value::int(5)));
        let right = expect_storage_update_const(addr, Value::int(5))
            .compose(expect_any_success());
        assert!(left.check(&gstate, &updates).is_ok());
        assert!(right.check(&gstate, &updates).is_ok());

        let failing = expect_storage_update_const(addr, Value::int(6));
        let wrapped = expect_any_success().compose(failing);
        assert!(wrapped.check(&gstate, &updates).is_err());
    }

    #[test]
    fn storage_update_validator_uses_the_last_update() {
        let addr = Address::originated([0x11; 20]);
        let updates = vec![
            GStateUpdate::StorageValueSet {
                addr,
                storage: Value::int(1),
            },
            GStateUpdate::StorageValueSet {
                addr,
                storage: Value::int(2),
            },
        ];
        let v = expect_storage_update_const(addr, Value::int(2));
        assert!(v.check(&GState::genesis(), &updates).is_ok());
        let v1 = expect_storage_update_const(addr, Value::int(1));
        assert!(v1.check(&GState::genesis(), &updates).is_err());
    }

    #[test]
    fn missing_storage_update_is_reported() {
        let addr = Address::originated([0x22; 20]);
        let v = expect_storage_update(addr, |_| true);
        match v.check(&GState::genesis(), &[]).unwrap_err() {
            ValidationError::IncorrectStorageUpdate { addr: a, .. } => assert_eq!(a, addr),
            other => panic!("expected IncorrectStorageUpdate, got {:?}", other),
        }
    }

    #[test]
    fn storage_const_rejects_plain_accounts() {
        let v = expect_storage_const(GState::genesis_address(), Value::Unit);
        assert!(matches!(
            v.check(&GState::genesis(), &[]),
            Err(ValidationError::StorageMismatch { .. })
        ));
    }
}
