//! Pure execution of checked code against a global-state snapshot.
//!
//! `interpret` drains a queue of origination and transfer operations,
//! running contract code in a small stack machine. The caller's snapshot
//! is never touched: a working copy evolves exclusively through journal
//! entries, so the returned journal replayed over the input snapshot is
//! the returned state. Gas is one `RemainingSteps` counter shared by the
//! whole batch, decremented once per executed instruction.

use std::collections::VecDeque;

use num_bigint::BigInt;
use num_traits::{One, Signed, ToPrimitive, Zero};
use sha2::{Digest, Sha256};

use mica_core::instr::Instr;
use mica_core::ty::{Comparable, Type};
use mica_core::typecheck::{typecheck_contract, typecheck_value, TcError};
use mica_core::untyped::{PrintComment, PrintPart, UContract, UValue};
use mica_core::value::{Address, KeyHash, Mutez, Operation, Value};

use crate::gstate::{ContractState, GState, GStateUpdate};

// ──────────────────────────────────────────────
// Public operation types
// ──────────────────────────────────────────────

/// The step budget for one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemainingSteps(pub u64);

/// A transfer as submitted by the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxData {
    pub sender: Address,
    pub parameter: UValue,
    pub amount: Mutez,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginateOp {
    pub contract: UContract,
    pub initial_storage: UValue,
    pub balance: Mutez,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOp {
    pub tx: TxData,
    pub dest: Address,
}

/// One pending operation in a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterpreterOp {
    Originate(OriginateOp),
    Transfer(TransferOp),
}

/// How a contract run can go wrong at runtime.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuntimeFailure {
    #[error("FAILWITH: {0}")]
    Failed(Value),

    #[error("mutez addition overflow")]
    MutezOverflow,

    #[error("mutez subtraction underflow")]
    MutezUnderflow,

    #[error("arithmetic overflow")]
    ArithOverflow,

    #[error("gas exhausted")]
    GasExhaustion,

    #[error("TEST_ASSERT '{name}' failed")]
    TestAssertFailed { name: String },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InterpreterError {
    #[error("unknown contract: {0}")]
    UnknownContract(Address),

    #[error("unknown sender: {0}")]
    UnknownSender(Address),

    #[error("contract {0} failed: {1}")]
    InterpreterFailed(Address, RuntimeFailure),

    #[error("ill-typed contract: {0}")]
    IllTypedContract(TcError),

    #[error("ill-typed parameter: {0}")]
    IllTypedParameter(TcError),
}

/// The outcome of a successful batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterpreterRes {
    pub gstate: GState,
    /// The canonical journal: replaying it over the input snapshot yields
    /// `gstate`.
    pub updates: Vec<GStateUpdate>,
    pub remaining_steps: RemainingSteps,
    /// Output of `PRINT` and failed `TEST_ASSERT` comments, in order.
    pub prints: Vec<String>,
}

// ──────────────────────────────────────────────
// Address derivation
// ──────────────────────────────────────────────

/// Derive an originated address from an origination payload and the
/// global origination nonce. The nonce stands in for the reference
/// client's per-operation origination index: it makes two originations of
/// byte-identical contracts in one batch land on distinct addresses.
pub fn contract_address(payload: &[u8], nonce: u64) -> Address {
    let mut hasher = Sha256::new();
    hasher.update(nonce.to_be_bytes());
    hasher.update(payload);
    let digest = hasher.finalize();
    let mut hash = [0u8; 20];
    hash.copy_from_slice(&digest[..20]);
    Address::originated(hash)
}

/// The payload bytes for a driver-level origination.
pub fn origination_payload(contract: &UContract, storage: &UValue, balance: Mutez) -> Vec<u8> {
    let mut bytes = serde_json::to_vec(contract).expect("AST serialization cannot fail");
    bytes.extend(serde_json::to_vec(storage).expect("AST serialization cannot fail"));
    bytes.extend(balance.raw().to_be_bytes());
    bytes
}

fn typed_origination_payload(
    param_ty: &Type,
    storage_ty: &Type,
    storage: &Value,
    balance: Mutez,
) -> Vec<u8> {
    format!("{}|{}|{}|{}", param_ty, storage_ty, storage, balance).into_bytes()
}

// ──────────────────────────────────────────────
// The stack machine
// ──────────────────────────────────────────────

struct Machine<'a> {
    /// Runtime stack; the last element is the top.
    stack: Vec<Value>,
    now: i64,
    amount: Mutez,
    balance: Mutez,
    self_addr: Address,
    sender: Address,
    source: Address,
    state: &'a GState,
    gas: &'a mut RemainingSteps,
    nonce: &'a mut u64,
    prints: &'a mut Vec<String>,
}

impl<'a> Machine<'a> {
    // The checker guarantees every pop finds a value of the matched
    // constructor; a mismatch here is a harness bug, not user error.
    fn pop(&mut self) -> Value {
        self.stack.pop().expect("checked code never underflows")
    }

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop_bool(&mut self) -> bool {
        match self.pop() {
            Value::Bool(b) => b,
            other => unreachable!("expected bool on the stack, got {}", other.type_name()),
        }
    }

    fn pop_mutez(&mut self) -> Mutez {
        match self.pop() {
            Value::Mutez(m) => m,
            other => unreachable!("expected mutez on the stack, got {}", other.type_name()),
        }
    }

    fn pop_key_hash_opt(&mut self) -> Option<KeyHash> {
        match self.pop() {
            Value::Option(None) => None,
            Value::Option(Some(v)) => match *v {
                Value::KeyHash(kh) => Some(kh),
                other => unreachable!("expected key_hash, got {}", other.type_name()),
            },
            other => unreachable!("expected option, got {}", other.type_name()),
        }
    }

    fn consume_gas(&mut self) -> Result<(), RuntimeFailure> {
        if self.gas.0 == 0 {
            return Err(RuntimeFailure::GasExhaustion);
        }
        self.gas.0 -= 1;
        Ok(())
    }

    fn run_seq(&mut self, code: &[Instr]) -> Result<(), RuntimeFailure> {
        for instr in code {
            self.step(instr)?;
        }
        Ok(())
    }

    fn render_comment(&self, comment: &PrintComment) -> String {
        let mut out = String::new();
        for part in &comment.parts {
            match part {
                PrintPart::Text(text) => out.push_str(text),
                PrintPart::StackRef(i) => {
                    let idx = self.stack.len() - 1 - i;
                    out.push_str(&self.stack[idx].to_string());
                }
            }
        }
        out
    }

    fn step(&mut self, instr: &Instr) -> Result<(), RuntimeFailure> {
        self.consume_gas()?;
        match instr {
            Instr::Nop | Instr::Cast | Instr::Rename => {}

            Instr::Drop => {
                self.pop();
            }

            Instr::Dup => {
                let top = self.stack.last().cloned().expect("checked code never underflows");
                self.push(top);
            }

            Instr::Swap => {
                let len = self.stack.len();
                self.stack.swap(len - 1, len - 2);
            }

            Instr::Push { value, .. } => self.push(value.clone()),

            Instr::Unit => self.push(Value::Unit),

            Instr::Some => {
                let v = self.pop();
                self.push(Value::some(v));
            }

            Instr::None { .. } => self.push(Value::none()),

            Instr::IfNone { if_none, if_some } => match self.pop() {
                Value::Option(None) => self.run_seq(if_none)?,
                Value::Option(Some(v)) => {
                    self.push(*v);
                    self.run_seq(if_some)?;
                }
                other => unreachable!("expected option, got {}", other.type_name()),
            },

            Instr::Pair => {
                let a = self.pop();
                let b = self.pop();
                self.push(Value::pair(a, b));
            }

            Instr::Car => match self.pop() {
                Value::Pair(a, _) => self.push(*a),
                other => unreachable!("expected pair, got {}", other.type_name()),
            },

            Instr::Cdr => match self.pop() {
                Value::Pair(_, b) => self.push(*b),
                other => unreachable!("expected pair, got {}", other.type_name()),
            },

            Instr::Left { .. } => {
                let v = self.pop();
                self.push(Value::Left(Box::new(v)));
            }

            Instr::Right { .. } => {
                let v = self.pop();
                self.push(Value::Right(Box::new(v)));
            }

            Instr::IfLeft { if_left, if_right } => match self.pop() {
                Value::Left(v) => {
                    self.push(*v);
                    self.run_seq(if_left)?;
                }
                Value::Right(v) => {
                    self.push(*v);
                    self.run_seq(if_right)?;
                }
                other => unreachable!("expected union, got {}", other.type_name()),
            },

            Instr::Nil { .. } => self.push(Value::List(Vec::new())),

            Instr::Cons => {
                let head = self.pop();
                match self.pop() {
                    Value::List(mut items) => {
                        items.insert(0, head);
                        self.push(Value::List(items));
                    }
                    other => unreachable!("expected list, got {}", other.type_name()),
                }
            }

            Instr::IfCons { if_cons, if_nil } => match self.pop() {
                Value::List(mut items) => {
                    if items.is_empty() {
                        self.run_seq(if_nil)?;
                    } else {
                        let head = items.remove(0);
                        self.push(Value::List(items));
                        self.push(head);
                        self.run_seq(if_cons)?;
                    }
                }
                other => unreachable!("expected list, got {}", other.type_name()),
            },

            Instr::EmptySet { .. } => self.push(Value::Set(Default::default())),

            Instr::EmptyMap { .. } => self.push(Value::Map(Default::default())),

            Instr::Map { body } => match self.pop() {
                Value::List(items) => {
                    let mut mapped = Vec::with_capacity(items.len());
                    for item in items {
                        self.push(item);
                        self.run_seq(body)?;
                        mapped.push(self.pop());
                    }
                    self.push(Value::List(mapped));
                }
                Value::Map(entries) => {
                    let mut mapped = std::collections::BTreeMap::new();
                    for (key, value) in entries {
                        self.push(Value::pair(key.clone(), value));
                        self.run_seq(body)?;
                        let new_value = self.pop();
                        mapped.insert(key, new_value);
                    }
                    self.push(Value::Map(mapped));
                }
                other => unreachable!("expected list or map, got {}", other.type_name()),
            },

            Instr::Iter { body } => match self.pop() {
                Value::List(items) => {
                    for item in items {
                        self.push(item);
                        self.run_seq(body)?;
                    }
                }
                Value::Set(items) => {
                    for item in items {
                        self.push(item);
                        self.run_seq(body)?;
                    }
                }
                Value::Map(entries) => {
                    for (key, value) in entries {
                        self.push(Value::pair(key, value));
                        self.run_seq(body)?;
                    }
                }
                other => unreachable!("expected a container, got {}", other.type_name()),
            },

            Instr::Mem => {
                let key = self.pop();
                let present = match self.pop() {
                    Value::Set(items) => items.contains(&key),
                    Value::Map(entries) | Value::BigMap(entries) => entries.contains_key(&key),
                    other => unreachable!("expected a container, got {}", other.type_name()),
                };
                self.push(Value::Bool(present));
            }

            Instr::Get => {
                let key = self.pop();
                let found = match self.pop() {
                    Value::Map(entries) | Value::BigMap(entries) => entries.get(&key).cloned(),
                    other => unreachable!("expected a map, got {}", other.type_name()),
                };
                self.push(match found {
                    Some(v) => Value::some(v),
                    None => Value::none(),
                });
            }

            Instr::Update => {
                let key = self.pop();
                let arg = self.pop();
                let coll = self.pop();
                let updated = match (arg, coll) {
                    (Value::Bool(true), Value::Set(mut items)) => {
                        items.insert(key);
                        Value::Set(items)
                    }
                    (Value::Bool(false), Value::Set(mut items)) => {
                        items.remove(&key);
                        Value::Set(items)
                    }
                    (Value::Option(Some(v)), Value::Map(mut entries)) => {
                        entries.insert(key, *v);
                        Value::Map(entries)
                    }
                    (Value::Option(None), Value::Map(mut entries)) => {
                        entries.remove(&key);
                        Value::Map(entries)
                    }
                    (Value::Option(Some(v)), Value::BigMap(mut entries)) => {
                        entries.insert(key, *v);
                        Value::BigMap(entries)
                    }
                    (Value::Option(None), Value::BigMap(mut entries)) => {
                        entries.remove(&key);
                        Value::BigMap(entries)
                    }
                    (arg, coll) => unreachable!(
                        "UPDATE on {} with {}",
                        coll.type_name(),
                        arg.type_name()
                    ),
                };
                self.push(updated);
            }

            Instr::Size => {
                let len = match self.pop() {
                    Value::List(items) => items.len(),
                    Value::Set(items) => items.len(),
                    Value::Map(entries) | Value::BigMap(entries) => entries.len(),
                    Value::String(s) => s.len(),
                    Value::Bytes(b) => b.len(),
                    other => unreachable!("expected a sized value, got {}", other.type_name()),
                };
                self.push(Value::Nat(BigInt::from(len)));
            }

            Instr::Concat => {
                let a = self.pop();
                let b = self.pop();
                match (a, b) {
                    (Value::String(x), Value::String(y)) => {
                        self.push(Value::String(format!("{}{}", x, y)))
                    }
                    (Value::Bytes(mut x), Value::Bytes(y)) => {
                        x.extend(y);
                        self.push(Value::Bytes(x));
                    }
                    (a, b) => unreachable!(
                        "CONCAT of {} and {}",
                        a.type_name(),
                        b.type_name()
                    ),
                }
            }

            Instr::ConcatList { elem } => match self.pop() {
                Value::List(items) => match elem {
                    Comparable::String => {
                        let mut joined = String::new();
                        for item in items {
                            match item {
                                Value::String(s) => joined.push_str(&s),
                                other => unreachable!(
                                    "expected string, got {}",
                                    other.type_name()
                                ),
                            }
                        }
                        self.push(Value::String(joined));
                    }
                    Comparable::Bytes => {
                        let mut joined = Vec::new();
                        for item in items {
                            match item {
                                Value::Bytes(b) => joined.extend(b),
                                other => unreachable!(
                                    "expected bytes, got {}",
                                    other.type_name()
                                ),
                            }
                        }
                        self.push(Value::Bytes(joined));
                    }
                    other => unreachable!("CONCAT over a list of {}", other),
                },
                other => unreachable!("expected list, got {}", other.type_name()),
            },

            Instr::Slice => {
                let offset = self.pop_nat_usize();
                let length = self.pop_nat_usize();
                let sliced = match (offset, length, self.pop()) {
                    (Some(o), Some(l), Value::String(s)) => o
                        .checked_add(l)
                        .and_then(|end| s.get(o..end))
                        .map(|sub| Value::String(sub.to_string())),
                    (Some(o), Some(l), Value::Bytes(b)) => o
                        .checked_add(l)
                        .and_then(|end| b.get(o..end))
                        .map(|sub| Value::Bytes(sub.to_vec())),
                    (_, _, Value::String(_)) | (_, _, Value::Bytes(_)) => None,
                    (_, _, other) => {
                        unreachable!("SLICE of {}", other.type_name())
                    }
                };
                self.push(match sliced {
                    Some(v) => Value::some(v),
                    None => Value::none(),
                });
            }

            Instr::If { if_true, if_false } => {
                if self.pop_bool() {
                    self.run_seq(if_true)?;
                } else {
                    self.run_seq(if_false)?;
                }
            }

            Instr::Loop { body } => {
                while self.pop_bool() {
                    self.run_seq(body)?;
                }
            }

            Instr::LoopLeft { body } => loop {
                match self.pop() {
                    Value::Left(v) => {
                        self.push(*v);
                        self.run_seq(body)?;
                    }
                    Value::Right(v) => {
                        self.push(*v);
                        break;
                    }
                    other => unreachable!("expected union, got {}", other.type_name()),
                }
            },

            Instr::Lambda { lambda } => self.push(Value::Lambda(lambda.clone())),

            Instr::Exec => {
                let arg = self.pop();
                let lambda = match self.pop() {
                    Value::Lambda(l) => l,
                    other => unreachable!("expected lambda, got {}", other.type_name()),
                };
                let saved = std::mem::replace(&mut self.stack, vec![arg]);
                self.run_seq(&lambda.code)?;
                let result = self.pop();
                self.stack = saved;
                self.push(result);
            }

            Instr::Dip { body } => {
                let top = self.pop();
                self.run_seq(body)?;
                self.push(top);
            }

            Instr::Failwith => {
                let v = self.pop();
                return Err(RuntimeFailure::Failed(v));
            }

            Instr::Add => self.arith_add()?,
            Instr::Sub => self.arith_sub()?,
            Instr::Mul => self.arith_mul()?,
            Instr::Ediv => self.arith_ediv(),
            Instr::Abs => match self.pop() {
                Value::Int(i) => self.push(Value::Nat(i.abs())),
                other => unreachable!("ABS of {}", other.type_name()),
            },
            Instr::Neg => match self.pop() {
                Value::Int(i) | Value::Nat(i) => self.push(Value::Int(-i)),
                other => unreachable!("NEG of {}", other.type_name()),
            },
            Instr::Not => match self.pop() {
                Value::Bool(b) => self.push(Value::Bool(!b)),
                Value::Int(i) | Value::Nat(i) => {
                    self.push(Value::Int(-(i + BigInt::one())))
                }
                other => unreachable!("NOT of {}", other.type_name()),
            },
            Instr::Int => match self.pop() {
                Value::Nat(n) => self.push(Value::Int(n)),
                other => unreachable!("INT of {}", other.type_name()),
            },
            Instr::And => self.logic(|a, b| a && b, |a, b| a & b),
            Instr::Or => self.logic(|a, b| a || b, |a, b| a | b),
            Instr::Xor => self.logic(|a, b| a ^ b, |a, b| a ^ b),
            Instr::Lsl => self.shift(true)?,
            Instr::Lsr => self.shift(false)?,

            Instr::Compare => {
                let a = self.pop();
                let b = self.pop();
                let ordering = a.cmp(&b) as i8;
                self.push(Value::Int(BigInt::from(ordering)));
            }

            Instr::Eq => self.sign_test(|i| i.is_zero()),
            Instr::Neq => self.sign_test(|i| !i.is_zero()),
            Instr::Lt => self.sign_test(|i| i.is_negative()),
            Instr::Gt => self.sign_test(|i| i.is_positive()),
            Instr::Le => self.sign_test(|i| !i.is_positive()),
            Instr::Ge => self.sign_test(|i| !i.is_negative()),

            Instr::Now => self.push(Value::Timestamp(self.now)),
            Instr::Amount => self.push(Value::Mutez(self.amount)),
            Instr::Balance => self.push(Value::Mutez(self.balance)),
            Instr::Sender => self.push(Value::Address(self.sender)),
            Instr::Source => self.push(Value::Address(self.source)),
            Instr::SelfContract => self.push(Value::Contract(self.self_addr)),

            Instr::Address => match self.pop() {
                Value::Contract(addr) => self.push(Value::Address(addr)),
                other => unreachable!("ADDRESS of {}", other.type_name()),
            },

            Instr::Contract { param_ty } => {
                let addr = match self.pop() {
                    Value::Address(a) => a,
                    other => unreachable!("CONTRACT of {}", other.type_name()),
                };
                let handle = match self.state.account(&addr) {
                    Some(crate::gstate::AccountState::Simple { .. }) => {
                        (*param_ty == Type::Unit).then_some(Value::Contract(addr))
                    }
                    Some(crate::gstate::AccountState::Contract(c)) => {
                        (c.param_ty == *param_ty).then_some(Value::Contract(addr))
                    }
                    None => None,
                };
                self.push(match handle {
                    Some(v) => Value::some(v),
                    None => Value::none(),
                });
            }

            Instr::ImplicitAccount => match self.pop() {
                Value::KeyHash(kh) => self.push(Value::Contract(kh.implicit_address())),
                other => unreachable!("IMPLICIT_ACCOUNT of {}", other.type_name()),
            },

            Instr::TransferTokens { param_ty } => {
                let parameter = self.pop();
                let amount = self.pop_mutez();
                let dest = match self.pop() {
                    Value::Contract(addr) => addr,
                    other => unreachable!("TRANSFER_TOKENS to {}", other.type_name()),
                };
                self.push(Value::Operation(Box::new(Operation::TransferTokens {
                    parameter,
                    param_ty: param_ty.clone(),
                    amount,
                    dest,
                })));
            }

            Instr::SetDelegate => {
                let delegate = self.pop_key_hash_opt();
                self.push(Value::Operation(Box::new(Operation::SetDelegate {
                    delegate,
                })));
            }

            Instr::CreateAccount => {
                let manager = match self.pop() {
                    Value::KeyHash(kh) => kh,
                    other => unreachable!("expected key_hash, got {}", other.type_name()),
                };
                let delegate = self.pop_key_hash_opt();
                let spendable = self.pop_bool();
                let balance = self.pop_mutez();
                let payload =
                    format!("account|{}|{:?}|{}|{}", manager, delegate, spendable, balance);
                let addr = contract_address(payload.as_bytes(), *self.nonce);
                *self.nonce += 1;
                self.push(Value::Address(addr));
                self.push(Value::Operation(Box::new(Operation::CreateAccount {
                    manager,
                    delegate,
                    spendable,
                    balance,
                    addr,
                })));
            }

            Instr::CreateContract {
                param_ty,
                storage_ty,
                code,
            } => {
                let manager = match self.pop() {
                    Value::KeyHash(kh) => kh,
                    other => unreachable!("expected key_hash, got {}", other.type_name()),
                };
                let delegate = self.pop_key_hash_opt();
                let spendable = self.pop_bool();
                let delegatable = self.pop_bool();
                let balance = self.pop_mutez();
                let storage = self.pop();
                let payload = typed_origination_payload(param_ty, storage_ty, &storage, balance);
                let addr = contract_address(&payload, *self.nonce);
                *self.nonce += 1;
                self.push(Value::Address(addr));
                self.push(Value::Operation(Box::new(Operation::CreateContract {
                    manager,
                    delegate,
                    spendable,
                    delegatable,
                    balance,
                    storage,
                    storage_ty: storage_ty.clone(),
                    param_ty: param_ty.clone(),
                    code: code.clone(),
                    addr,
                })));
            }

            Instr::Print(comment) => {
                let rendered = self.render_comment(comment);
                self.prints.push(rendered);
            }

            Instr::TestAssert {
                name,
                comment,
                body,
            } => {
                let saved = self.stack.clone();
                self.run_seq(body)?;
                let passed = self.pop_bool();
                self.stack = saved;
                if !passed {
                    let rendered = self.render_comment(comment);
                    self.prints.push(rendered);
                    return Err(RuntimeFailure::TestAssertFailed { name: name.clone() });
                }
            }
        }
        Ok(())
    }

    fn pop_nat_usize(&mut self) -> Option<usize> {
        match self.pop() {
            Value::Nat(n) => n.to_usize(),
            other => unreachable!("expected nat, got {}", other.type_name()),
        }
    }

    fn arith_add(&mut self) -> Result<(), RuntimeFailure> {
        let a = self.pop();
        let b = self.pop();
        let result = match (a, b) {
            (Value::Nat(x), Value::Nat(y)) => Value::Nat(x + y),
            (Value::Int(x), Value::Int(y))
            | (Value::Int(x), Value::Nat(y))
            | (Value::Nat(x), Value::Int(y)) => Value::Int(x + y),
            (Value::Int(x), Value::Timestamp(t)) | (Value::Timestamp(t), Value::Int(x)) => {
                let shift = x.to_i64().ok_or(RuntimeFailure::ArithOverflow)?;
                let shifted = t.checked_add(shift).ok_or(RuntimeFailure::ArithOverflow)?;
                Value::Timestamp(shifted)
            }
            (Value::Mutez(x), Value::Mutez(y)) => {
                Value::Mutez(x.checked_add(y).ok_or(RuntimeFailure::MutezOverflow)?)
            }
            (a, b) => unreachable!("ADD of {} and {}", a.type_name(), b.type_name()),
        };
        self.push(result);
        Ok(())
    }

    fn arith_sub(&mut self) -> Result<(), RuntimeFailure> {
        let a = self.pop();
        let b = self.pop();
        let result = match (a, b) {
            (Value::Int(x), Value::Int(y))
            | (Value::Int(x), Value::Nat(y))
            | (Value::Nat(x), Value::Int(y))
            | (Value::Nat(x), Value::Nat(y)) => Value::Int(x - y),
            (Value::Timestamp(x), Value::Timestamp(y)) => {
                Value::Int(BigInt::from(x) - BigInt::from(y))
            }
            (Value::Timestamp(t), Value::Int(x)) => {
                let shift = x.to_i64().ok_or(RuntimeFailure::ArithOverflow)?;
                let shifted = t.checked_sub(shift).ok_or(RuntimeFailure::ArithOverflow)?;
                Value::Timestamp(shifted)
            }
            (Value::Mutez(x), Value::Mutez(y)) => {
                Value::Mutez(x.checked_sub(y).ok_or(RuntimeFailure::MutezUnderflow)?)
            }
            (a, b) => unreachable!("SUB of {} and {}", a.type_name(), b.type_name()),
        };
        self.push(result);
        Ok(())
    }

    fn arith_mul(&mut self) -> Result<(), RuntimeFailure> {
        let a = self.pop();
        let b = self.pop();
        let result = match (a, b) {
            (Value::Nat(x), Value::Nat(y)) => Value::Nat(x * y),
            (Value::Int(x), Value::Int(y))
            | (Value::Int(x), Value::Nat(y))
            | (Value::Nat(x), Value::Int(y)) => Value::Int(x * y),
            (Value::Nat(n), Value::Mutez(m)) | (Value::Mutez(m), Value::Nat(n)) => {
                Value::Mutez(m.checked_mul(&n).ok_or(RuntimeFailure::MutezOverflow)?)
            }
            (a, b) => unreachable!("MUL of {} and {}", a.type_name(), b.type_name()),
        };
        self.push(result);
        Ok(())
    }

    /// Division by zero is `None`, never a failure.
    fn arith_ediv(&mut self) {
        let a = self.pop();
        let b = self.pop();
        let result = match (a, b) {
            (Value::Nat(x), Value::Nat(y)) => ediv_bigint(&x, &y)
                .map(|(q, r)| Value::pair(Value::Nat(q), Value::Nat(r))),
            (Value::Int(x), Value::Int(y))
            | (Value::Int(x), Value::Nat(y))
            | (Value::Nat(x), Value::Int(y)) => ediv_bigint(&x, &y)
                .map(|(q, r)| Value::pair(Value::Int(q), Value::Nat(r))),
            (Value::Mutez(m), Value::Nat(n)) => match n.to_u64() {
                Some(0) => None,
                Some(n) => Some(Value::pair(
                    Value::Mutez(Mutez::new(m.raw() / n).expect("quotient is in range")),
                    Value::Mutez(Mutez::new(m.raw() % n).expect("remainder is in range")),
                )),
                // Divisor beyond the mutez range: quotient 0, remainder m.
                None => Some(Value::pair(
                    Value::Mutez(Mutez::zero()),
                    Value::Mutez(m),
                )),
            },
            (Value::Mutez(m), Value::Mutez(n)) => {
                if n.raw() == 0 {
                    None
                } else {
                    Some(Value::pair(
                        Value::Nat(BigInt::from(m.raw() / n.raw())),
                        Value::Mutez(Mutez::new(m.raw() % n.raw()).expect("remainder is in range")),
                    ))
                }
            }
            (a, b) => unreachable!("EDIV of {} and {}", a.type_name(), b.type_name()),
        };
        self.push(match result {
            Some(v) => Value::some(v),
            None => Value::none(),
        });
    }

    fn logic(&mut self, on_bool: fn(bool, bool) -> bool, on_nat: fn(BigInt, BigInt) -> BigInt) {
        let a = self.pop();
        let b = self.pop();
        let result = match (a, b) {
            (Value::Bool(x), Value::Bool(y)) => Value::Bool(on_bool(x, y)),
            (Value::Nat(x), Value::Nat(y)) => Value::Nat(on_nat(x, y)),
            (a, b) => unreachable!(
                "bitwise operation on {} and {}",
                a.type_name(),
                b.type_name()
            ),
        };
        self.push(result);
    }

    fn shift(&mut self, left: bool) -> Result<(), RuntimeFailure> {
        let a = self.pop();
        let b = self.pop();
        let (value, by) = match (a, b) {
            (Value::Nat(x), Value::Nat(y)) => (x, y),
            (a, b) => unreachable!("shift of {} by {}", a.type_name(), b.type_name()),
        };
        let by = by
            .to_usize()
            .filter(|n| *n <= 256)
            .ok_or(RuntimeFailure::ArithOverflow)?;
        let result = if left { value << by } else { value >> by };
        self.push(Value::Nat(result));
        Ok(())
    }

    fn sign_test(&mut self, test: fn(&BigInt) -> bool) {
        match self.pop() {
            Value::Int(i) => self.push(Value::Bool(test(&i))),
            other => unreachable!("sign test of {}", other.type_name()),
        }
    }
}

/// Euclidean quotient and remainder; the remainder is never negative.
fn ediv_bigint(a: &BigInt, b: &BigInt) -> Option<(BigInt, BigInt)> {
    if b.is_zero() {
        return None;
    }
    let q = a / b;
    let r = a - &q * b;
    if r.is_negative() {
        if b.is_positive() {
            Some((q - BigInt::one(), r + b))
        } else {
            Some((q + BigInt::one(), r - b))
        }
    } else {
        Some((q, r))
    }
}

// ──────────────────────────────────────────────
// Batch interpretation
// ──────────────────────────────────────────────

/// A queued unit of work inside one batch.
enum Exec {
    Originate(OriginateOp),
    TransferUntyped(TransferOp),
    Emitted {
        /// The contract that emitted the operation.
        emitter: Address,
        /// The original external sender of the enclosing transfer.
        source: Address,
        op: Operation,
    },
}

/// The typed parameter of a dispatched transfer.
enum Param {
    Untyped(UValue),
    Typed(Value, Type),
}

struct Batch {
    state: GState,
    updates: Vec<GStateUpdate>,
    prints: Vec<String>,
    gas: RemainingSteps,
    nonce: u64,
    now: i64,
}

impl Batch {
    fn commit(&mut self, update: GStateUpdate) {
        self.state
            .apply_update(&update)
            .expect("interpreter-produced updates always apply");
        self.updates.push(update);
    }

    fn transfer(
        &mut self,
        queue: &mut VecDeque<Exec>,
        sender: Address,
        source: Address,
        dest: Address,
        amount: Mutez,
        param: Param,
    ) -> Result<(), InterpreterError> {
        let sender_balance = self
            .state
            .balance(&sender)
            .ok_or(InterpreterError::UnknownSender(sender))?;
        if self.state.account(&dest).is_none() {
            return Err(InterpreterError::UnknownContract(dest));
        }

        let debited = sender_balance.checked_sub(amount).ok_or(
            InterpreterError::InterpreterFailed(sender, RuntimeFailure::MutezUnderflow),
        )?;
        self.commit(GStateUpdate::BalanceUpdated {
            addr: sender,
            balance: debited,
        });
        let credited = self
            .state
            .balance(&dest)
            .expect("destination existence was just checked")
            .checked_add(amount)
            .ok_or(InterpreterError::InterpreterFailed(
                dest,
                RuntimeFailure::MutezOverflow,
            ))?;
        self.commit(GStateUpdate::BalanceUpdated {
            addr: dest,
            balance: credited,
        });

        let contract = match self.state.contract(&dest) {
            Some(c) => c.clone(),
            // A plain account: the transfer is just the balance movement.
            None => return Ok(()),
        };

        let parameter = match param {
            Param::Untyped(uv) => typecheck_value(&uv, &contract.param_ty)
                .map_err(InterpreterError::IllTypedParameter)?,
            Param::Typed(value, declared) => {
                if declared != contract.param_ty {
                    return Err(InterpreterError::IllTypedParameter(TcError::Contract {
                        message: format!(
                            "operation parameter has type {}, contract expects {}",
                            declared, contract.param_ty
                        ),
                    }));
                }
                value
            }
        };

        let mut machine = Machine {
            stack: vec![Value::pair(parameter, contract.storage.clone())],
            now: self.now,
            amount,
            balance: credited,
            self_addr: dest,
            sender,
            source,
            state: &self.state,
            gas: &mut self.gas,
            nonce: &mut self.nonce,
            prints: &mut self.prints,
        };
        machine
            .run_seq(&contract.code)
            .map_err(|failure| InterpreterError::InterpreterFailed(dest, failure))?;
        let result = machine.pop();

        let (operations, new_storage) = match result {
            Value::Pair(ops, storage) => match *ops {
                Value::List(items) => (items, *storage),
                other => unreachable!("expected operation list, got {}", other.type_name()),
            },
            other => unreachable!("expected pair, got {}", other.type_name()),
        };

        self.commit(GStateUpdate::StorageValueSet {
            addr: dest,
            storage: new_storage,
        });

        for op_value in operations {
            let op = match op_value {
                Value::Operation(op) => *op,
                other => unreachable!("expected operation, got {}", other.type_name()),
            };
            queue.push_back(Exec::Emitted {
                emitter: dest,
                source,
                op,
            });
        }
        Ok(())
    }
}

/// Run a batch of operations against a snapshot.
///
/// The input `gstate` is untouched; on success the result carries the new
/// snapshot and its journal, on failure the whole batch is void.
pub fn interpret(
    now: i64,
    max_steps: u64,
    gstate: &GState,
    ops: &[InterpreterOp],
) -> Result<InterpreterRes, InterpreterError> {
    let mut batch = Batch {
        state: gstate.clone(),
        updates: Vec::new(),
        prints: Vec::new(),
        gas: RemainingSteps(max_steps),
        nonce: gstate.originations(),
        now,
    };
    let mut queue: VecDeque<Exec> = ops
        .iter()
        .map(|op| match op {
            InterpreterOp::Originate(o) => Exec::Originate(o.clone()),
            InterpreterOp::Transfer(t) => Exec::TransferUntyped(t.clone()),
        })
        .collect();

    while let Some(item) = queue.pop_front() {
        match item {
            Exec::Originate(op) => {
                let typed = typecheck_contract(&op.contract)
                    .map_err(InterpreterError::IllTypedContract)?;
                let storage = typecheck_value(&op.initial_storage, &typed.storage_ty)
                    .map_err(InterpreterError::IllTypedParameter)?;
                let payload = origination_payload(&op.contract, &op.initial_storage, op.balance);
                let addr = contract_address(&payload, batch.nonce);
                batch.nonce += 1;
                batch.commit(GStateUpdate::ContractCreated {
                    addr,
                    state: ContractState {
                        balance: op.balance,
                        storage,
                        storage_ty: typed.storage_ty,
                        param_ty: typed.param_ty,
                        code: typed.code,
                        delegate: None,
                    },
                });
            }

            Exec::TransferUntyped(op) => {
                batch.transfer(
                    &mut queue,
                    op.tx.sender,
                    op.tx.sender,
                    op.dest,
                    op.tx.amount,
                    Param::Untyped(op.tx.parameter),
                )?;
            }

            Exec::Emitted {
                emitter,
                source,
                op,
            } => match op {
                Operation::TransferTokens {
                    parameter,
                    param_ty,
                    amount,
                    dest,
                } => {
                    batch.transfer(
                        &mut queue,
                        emitter,
                        source,
                        dest,
                        amount,
                        Param::Typed(parameter, param_ty),
                    )?;
                }
                Operation::SetDelegate { delegate } => {
                    batch.commit(GStateUpdate::DelegateSet {
                        addr: emitter,
                        delegate,
                    });
                }
                Operation::CreateAccount { balance, addr, .. } => {
                    batch.commit(GStateUpdate::SimpleAccountCreated { addr, balance });
                }
                Operation::CreateContract {
                    balance,
                    storage,
                    storage_ty,
                    param_ty,
                    code,
                    delegate,
                    addr,
                    ..
                } => {
                    batch.commit(GStateUpdate::ContractCreated {
                        addr,
                        state: ContractState {
                            balance,
                            storage,
                            storage_ty,
                            param_ty,
                            code,
                            delegate,
                        },
                    });
                }
            },
        }
    }

    Ok(InterpreterRes {
        gstate: batch.state,
        updates: batch.updates,
        remaining_steps: batch.gas,
        prints: batch.prints,
    })
}
