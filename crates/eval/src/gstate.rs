//! Global chain state and its update journal.
//!
//! `GState` is the persistent `Address -> AccountState` mapping plus the
//! origination nonce the address derivation draws from. Every mutation
//! the interpreter performs goes through a `GStateUpdate`, so the journal
//! it returns is canonical: replaying it over the input state reproduces
//! the output state exactly.

use std::collections::BTreeMap;

use mica_core::instr::Instr;
use mica_core::ty::Type;
use mica_core::value::{Address, KeyHash, Mutez, Value};

/// The state of a contract account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractState {
    pub balance: Mutez,
    pub storage: Value,
    pub storage_ty: Type,
    pub param_ty: Type,
    pub code: Vec<Instr>,
    pub delegate: Option<KeyHash>,
}

/// An account: either a plain balance holder or a contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccountState {
    Simple { balance: Mutez },
    Contract(ContractState),
}

impl AccountState {
    pub fn balance(&self) -> Mutez {
        match self {
            AccountState::Simple { balance } => *balance,
            AccountState::Contract(c) => c.balance,
        }
    }
}

/// One journal entry. `BalanceUpdated` sets (it does not add);
/// `StorageValueSet` overwrites; the `*Created` entries fail on an
/// existing address and advance the origination nonce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GStateUpdate {
    BalanceUpdated { addr: Address, balance: Mutez },
    StorageValueSet { addr: Address, storage: Value },
    ContractCreated { addr: Address, state: ContractState },
    SimpleAccountCreated { addr: Address, balance: Mutez },
    DelegateSet { addr: Address, delegate: Option<KeyHash> },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GStateError {
    #[error("account {0} does not exist")]
    UnknownAddress(Address),

    #[error("account {0} already exists")]
    AlreadyExists(Address),

    #[error("{0} is not a contract account")]
    NotAContract(Address),
}

/// The global state snapshot. Never mutated in place by the interpreter;
/// it hands out new snapshots built through `apply_updates`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GState {
    accounts: BTreeMap<Address, AccountState>,
    originations: u64,
}

impl GState {
    pub fn empty() -> GState {
        GState::default()
    }

    /// The faucet account scenarios draw funds from.
    pub fn genesis_address() -> Address {
        Address::implicit([0x01; 20])
    }

    /// A state with one well-funded genesis account.
    pub fn genesis() -> GState {
        let mut accounts = BTreeMap::new();
        accounts.insert(
            GState::genesis_address(),
            AccountState::Simple {
                balance: Mutez::new(1_000_000_000_000).expect("genesis balance is in range"),
            },
        );
        GState {
            accounts,
            originations: 0,
        }
    }

    pub fn account(&self, addr: &Address) -> Option<&AccountState> {
        self.accounts.get(addr)
    }

    pub fn balance(&self, addr: &Address) -> Option<Mutez> {
        self.accounts.get(addr).map(AccountState::balance)
    }

    pub fn contract(&self, addr: &Address) -> Option<&ContractState> {
        match self.accounts.get(addr) {
            Some(AccountState::Contract(c)) => Some(c),
            _ => None,
        }
    }

    /// Total originations ever applied; the address derivation nonce.
    pub fn originations(&self) -> u64 {
        self.originations
    }

    /// Apply a single journal entry in place.
    pub(crate) fn apply_update(&mut self, update: &GStateUpdate) -> Result<(), GStateError> {
        match update {
            GStateUpdate::BalanceUpdated { addr, balance } => {
                match self.accounts.get_mut(addr) {
                    Some(AccountState::Simple { balance: b }) => *b = *balance,
                    Some(AccountState::Contract(c)) => c.balance = *balance,
                    None => return Err(GStateError::UnknownAddress(*addr)),
                }
            }
            GStateUpdate::StorageValueSet { addr, storage } => {
                match self.accounts.get_mut(addr) {
                    Some(AccountState::Contract(c)) => c.storage = storage.clone(),
                    Some(_) => return Err(GStateError::NotAContract(*addr)),
                    None => return Err(GStateError::UnknownAddress(*addr)),
                }
            }
            GStateUpdate::ContractCreated { addr, state } => {
                if self.accounts.contains_key(addr) {
                    return Err(GStateError::AlreadyExists(*addr));
                }
                self.accounts
                    .insert(*addr, AccountState::Contract(state.clone()));
                self.originations += 1;
            }
            GStateUpdate::SimpleAccountCreated { addr, balance } => {
                if self.accounts.contains_key(addr) {
                    return Err(GStateError::AlreadyExists(*addr));
                }
                self.accounts
                    .insert(*addr, AccountState::Simple { balance: *balance });
                self.originations += 1;
            }
            GStateUpdate::DelegateSet { addr, delegate } => {
                match self.accounts.get_mut(addr) {
                    Some(AccountState::Contract(c)) => c.delegate = *delegate,
                    Some(_) => return Err(GStateError::NotAContract(*addr)),
                    None => return Err(GStateError::UnknownAddress(*addr)),
                }
            }
        }
        Ok(())
    }
}

/// Fold a journal over a snapshot, producing the next snapshot.
pub fn apply_updates(gstate: &GState, updates: &[GStateUpdate]) -> Result<GState, GStateError> {
    let mut next = gstate.clone();
    for update in updates {
        next.apply_update(update)?;
    }
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contract_state(balance: u64, stored: i64) -> ContractState {
        ContractState {
            balance: Mutez::new(balance).unwrap(),
            storage: Value::int(stored),
            storage_ty: Type::int(),
            param_ty: Type::Unit,
            code: vec![],
            delegate: None,
        }
    }

    #[test]
    fn balance_updates_set_rather_than_add() {
        let addr = GState::genesis_address();
        let state = GState::genesis();
        let updates = vec![
            GStateUpdate::BalanceUpdated {
                addr,
                balance: Mutez::new(10).unwrap(),
            },
            GStateUpdate::BalanceUpdated {
                addr,
                balance: Mutez::new(3).unwrap(),
            },
        ];
        let next = apply_updates(&state, &updates).unwrap();
        assert_eq!(next.balance(&addr), Some(Mutez::new(3).unwrap()));
    }

    #[test]
    fn creation_is_not_idempotent() {
        let addr = Address::originated([0x07; 20]);
        let update = GStateUpdate::ContractCreated {
            addr,
            state: contract_state(5, 0),
        };
        let state = apply_updates(&GState::empty(), &[update.clone()]).unwrap();
        assert_eq!(state.originations(), 1);
        assert_eq!(
            apply_updates(&state, &[update]),
            Err(GStateError::AlreadyExists(addr))
        );
    }

    #[test]
    fn storage_set_requires_a_contract() {
        let state = GState::genesis();
        let update = GStateUpdate::StorageValueSet {
            addr: GState::genesis_address(),
            storage: Value::int(1),
        };
        assert_eq!(
            apply_updates(&state, &[update]),
            Err(GStateError::NotAContract(GState::genesis_address()))
        );
    }

    #[test]
    fn delegate_set_overwrites() {
        let addr = Address::originated([0x09; 20]);
        let kh = KeyHash([0x02; 20]);
        let updates = vec![
            GStateUpdate::ContractCreated {
                addr,
                state: contract_state(0, 0),
            },
            GStateUpdate::DelegateSet {
                addr,
                delegate: Some(kh),
            },
            GStateUpdate::DelegateSet {
                addr,
                delegate: None,
            },
        ];
        let next = apply_updates(&GState::empty(), &updates).unwrap();
        assert_eq!(next.contract(&addr).unwrap().delegate, None);
    }
}
