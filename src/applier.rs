//! Applies finalized transactions to the ledger state.
//!
//! Every transaction is atomic with respect to the state tree: a snapshot is
//! taken before any work and the tree is reverted to it on error. Contract
//! invocations take a further nested snapshot so a faulting contract reverts
//! its own writes while gas is still charged.
//!
//! Gas accounting invariants are checked after every invocation; a violation
//! is a [`ApplyError::BugAssertion`] and means the ledger can no longer be
//! trusted. Callers must abort the node rather than continue.

use std::sync::Arc;

use crate::config::ConsensusConfig;
use crate::ledger::Round;
use crate::state::{
    self, read_balance, read_contract_gas_balance, write_balance, write_contract_gas_balance,
    RewardWithdrawalRequest, StateTree,
};
use crate::transaction::{
    BatchPayload, ContractPayload, PayloadError, StakeOpcode, StakePayload, Tag, Transaction,
    TransferPayload,
};
use crate::AccountId;

/// Errors surfaced while applying a transaction.
///
/// All variants except [`ApplyError::BugAssertion`] are per-transaction:
/// the transaction's writes are reverted and round application continues.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ApplyError {
    #[error(transparent)]
    Payload(#[from] PayloadError),
    #[error("{account:?} tried to send {requested} {unit} but only has {available} {unit}")]
    InsufficientFunds {
        account: AccountId,
        requested: u64,
        available: u64,
        unit: &'static str,
    },
    #[error("{account:?} attempted to withdraw a stake of {requested} PERL but has only staked {available} PERL")]
    InsufficientStake {
        account: AccountId,
        requested: u64,
        available: u64,
    },
    #[error("{account:?} attempted to withdraw rewards of {requested} PERL but only has {available} PERL")]
    InsufficientReward {
        account: AccountId,
        requested: u64,
        available: u64,
    },
    #[error("reward withdrawal of {requested} PERL is below the minimum of {minimum} PERL")]
    RewardBelowMinimum { requested: u64, minimum: u64 },
    #[error("transfers to non-contract accounts must not specify a gas limit, function name or params")]
    TransferToNonContract,
    #[error("contract already exists at this transaction id")]
    ContractAlreadyExists,
    #[error("gas payer {gas_payer:?} cannot cover a gas fee of {requested} PERL with {available} PERL available")]
    InsufficientGas {
        gas_payer: AccountId,
        requested: u64,
        available: u64,
    },
    #[error("batch entry {index} failed: {source}")]
    BatchEntry {
        index: usize,
        source: Box<ApplyError>,
    },
    #[error("gas accounting invariant violated: {0}")]
    BugAssertion(&'static str),
}

impl ApplyError {
    /// Whether this error signals ledger corruption. Fatal errors must abort
    /// the node instead of being recorded and skipped.
    pub fn is_fatal(&self) -> bool {
        match self {
            ApplyError::BugAssertion(_) => true,
            ApplyError::BatchEntry { source, .. } => source.is_fatal(),
            _ => false,
        }
    }
}

/// Gas context threaded through every contract call of one transaction tree.
///
/// The limit is fixed by the first invocation; nested calls run under the
/// lesser of their own request and whatever remains of it.
#[derive(Clone, Debug)]
pub struct ExecutorState {
    pub gas_payer: AccountId,
    pub gas_limit: u64,
    pub gas_limit_is_set: bool,
}

impl ExecutorState {
    fn new(gas_payer: AccountId) -> ExecutorState {
        ExecutorState {
            gas_payer,
            gas_limit: 0,
            gas_limit_is_set: false,
        }
    }
}

/// What a contract invocation produced.
#[derive(Clone, Debug, Default)]
pub struct ExecutionOutcome {
    /// Gas consumed; charged regardless of success.
    pub gas_used: u64,
    /// The invocation ran out of gas. Its writes are reverted.
    pub gas_limit_exceeded: bool,
    /// Transactions the contract enqueued, applied recursively on success.
    pub queue: Vec<Transaction>,
    /// Executor-level fault. Writes are reverted, gas is charged.
    pub error: Option<String>,
}

/// The WebAssembly contract executor, supplied by the runtime host.
///
/// Implementations must not observe or mutate state outside the handle they
/// are passed, and must report `gas_used <= gas_limit`.
pub trait ContractExecutor: Send + Sync {
    #[allow(clippy::too_many_arguments)]
    fn execute(
        &self,
        state: &mut StateTree,
        contract_id: &AccountId,
        round: &Round,
        tx: &Transaction,
        amount: u64,
        gas_limit: u64,
        func_name: &[u8],
        func_params: &[u8],
        code: &[u8],
    ) -> ExecutionOutcome;
}

/// Executor for nodes without a contract runtime: every invocation succeeds,
/// consumes no gas and enqueues nothing.
pub struct NoopExecutor;

impl ContractExecutor for NoopExecutor {
    fn execute(
        &self,
        _state: &mut StateTree,
        _contract_id: &AccountId,
        _round: &Round,
        _tx: &Transaction,
        _amount: u64,
        _gas_limit: u64,
        _func_name: &[u8],
        _func_params: &[u8],
        _code: &[u8],
    ) -> ExecutionOutcome {
        ExecutionOutcome::default()
    }
}

type ReadFn = fn(&StateTree, &AccountId) -> u64;
type WriteFn = fn(&mut StateTree, &AccountId, u64);

/// Move value of any form (balance, gas deposit) between two accounts.
fn transfer_value(
    state: &mut StateTree,
    from: &AccountId,
    to: &AccountId,
    amount: u64,
    src: (ReadFn, WriteFn),
    dst: (ReadFn, WriteFn),
    unit: &'static str,
) -> Result<(), ApplyError> {
    let (src_read, src_write) = src;
    let (dst_read, dst_write) = dst;

    let sender_value = src_read(state, from);
    if sender_value < amount {
        return Err(ApplyError::InsufficientFunds {
            account: *from,
            requested: amount,
            available: sender_value,
            unit,
        });
    }
    src_write(state, from, sender_value - amount);

    let recipient_value = dst_read(state, to);
    dst_write(state, to, recipient_value + amount);

    Ok(())
}

/// The transaction applier.
pub struct Applier {
    config: Arc<ConsensusConfig>,
    executor: Box<dyn ContractExecutor>,
}

impl Applier {
    pub fn new(config: Arc<ConsensusConfig>, executor: Box<dyn ContractExecutor>) -> Applier {
        Applier { config, executor }
    }

    /// Apply one transaction to the state tree.
    ///
    /// On error the tree is left exactly as it was; the gas payer for any
    /// contract calls in this transaction tree is the transaction creator.
    pub fn apply(
        &self,
        round: &Round,
        state: &mut StateTree,
        tx: &Transaction,
    ) -> Result<(), ApplyError> {
        let mut exec_state = ExecutorState::new(tx.creator);
        self.apply_with(round, state, tx, &mut exec_state)
    }

    fn apply_with(
        &self,
        round: &Round,
        state: &mut StateTree,
        tx: &Transaction,
        exec_state: &mut ExecutorState,
    ) -> Result<(), ApplyError> {
        let original = state.snapshot();

        let result = match tx.tag {
            Tag::Nop => Ok(()),
            Tag::Transfer => self.apply_transfer(round, state, tx, exec_state),
            Tag::Stake => self.apply_stake(round, state, tx),
            Tag::Contract => self.apply_contract(round, state, tx, exec_state),
            Tag::Batch => self.apply_batch(round, state, tx, exec_state),
        };

        if let Err(error) = result {
            state.revert(original);
            return Err(error);
        }
        Ok(())
    }

    fn apply_transfer(
        &self,
        round: &Round,
        state: &mut StateTree,
        tx: &Transaction,
        exec_state: &mut ExecutorState,
    ) -> Result<(), ApplyError> {
        let params = TransferPayload::decode(&tx.payload)?;

        let code = state::read_contract_code(state, &params.recipient);

        if code.is_none()
            && (params.gas_limit > 0
                || !params.func_name.is_empty()
                || !params.func_params.is_empty())
        {
            return Err(ApplyError::TransferToNonContract);
        }

        // Testnet compatibility: the faucet mints, it is never debited.
        if self.config.faucet_account() == Some(tx.creator) {
            let recipient_balance = read_balance(state, &params.recipient);
            write_balance(state, &params.recipient, recipient_balance + params.amount);
            return Ok(());
        }

        transfer_value(
            state,
            &tx.creator,
            &params.recipient,
            params.amount,
            (read_balance, write_balance),
            (read_balance, write_balance),
            "PERL",
        )?;

        let Some(code) = code else {
            return Ok(());
        };

        if params.gas_deposit != 0 {
            transfer_value(
                state,
                &tx.creator,
                &params.recipient,
                params.gas_deposit,
                (read_balance, write_balance),
                (read_contract_gas_balance, write_contract_gas_balance),
                "PERL (gas deposit)",
            )?;
        }

        if params.func_name.is_empty() {
            return Ok(());
        }

        self.invoke_contract(
            state,
            round,
            tx,
            &params.recipient,
            &code,
            params.amount,
            params.gas_limit,
            &params.func_name,
            &params.func_params,
            exec_state,
        )
    }

    fn apply_stake(
        &self,
        round: &Round,
        state: &mut StateTree,
        tx: &Transaction,
    ) -> Result<(), ApplyError> {
        let params = StakePayload::decode(&tx.payload)?;

        let balance = read_balance(state, &tx.creator);
        let stake = state::read_stake(state, &tx.creator);
        let reward = state::read_reward(state, &tx.creator);

        match params.opcode {
            StakeOpcode::PlaceStake => {
                if balance < params.amount {
                    return Err(ApplyError::InsufficientFunds {
                        account: tx.creator,
                        requested: params.amount,
                        available: balance,
                        unit: "PERL",
                    });
                }
                write_balance(state, &tx.creator, balance - params.amount);
                state::write_stake(state, &tx.creator, stake + params.amount);
            }
            StakeOpcode::WithdrawStake => {
                if stake < params.amount {
                    return Err(ApplyError::InsufficientStake {
                        account: tx.creator,
                        requested: params.amount,
                        available: stake,
                    });
                }
                write_balance(state, &tx.creator, balance + params.amount);
                state::write_stake(state, &tx.creator, stake - params.amount);
            }
            StakeOpcode::WithdrawReward => {
                if params.amount < self.config.min_reward_withdraw {
                    return Err(ApplyError::RewardBelowMinimum {
                        requested: params.amount,
                        minimum: self.config.min_reward_withdraw,
                    });
                }
                if reward < params.amount {
                    return Err(ApplyError::InsufficientReward {
                        account: tx.creator,
                        requested: params.amount,
                        available: reward,
                    });
                }
                state::write_reward(state, &tx.creator, reward - params.amount);
                state::store_reward_withdrawal(
                    state,
                    &RewardWithdrawalRequest {
                        account: tx.creator,
                        amount: params.amount,
                        round_index: round.index,
                    },
                );
            }
        }

        Ok(())
    }

    fn apply_contract(
        &self,
        round: &Round,
        state: &mut StateTree,
        tx: &Transaction,
        exec_state: &mut ExecutorState,
    ) -> Result<(), ApplyError> {
        let params = ContractPayload::decode(&tx.payload)?;

        let contract_id = AccountId(tx.id.0);

        if state::read_contract_code(state, &contract_id).is_some() {
            return Err(ApplyError::ContractAlreadyExists);
        }

        state::write_contract_code(state, &contract_id, &params.code);

        if params.gas_deposit != 0 {
            transfer_value(
                state,
                &tx.creator,
                &contract_id,
                params.gas_deposit,
                (read_balance, write_balance),
                (read_contract_gas_balance, write_contract_gas_balance),
                "PERL (gas deposit)",
            )?;
        }

        self.invoke_contract(
            state,
            round,
            tx,
            &contract_id,
            &params.code,
            0,
            params.gas_limit,
            b"init",
            &params.params,
            exec_state,
        )
    }

    fn apply_batch(
        &self,
        round: &Round,
        state: &mut StateTree,
        tx: &Transaction,
        exec_state: &mut ExecutorState,
    ) -> Result<(), ApplyError> {
        let params = BatchPayload::decode(&tx.payload)?;

        for (index, (&tag, payload)) in params.tags.iter().zip(&params.payloads).enumerate() {
            let tag = Tag::from_u8(tag).ok_or(PayloadError::UnknownTag { index, tag })?;

            // Sub-transactions inherit identity from the enclosing batch.
            let entry = Transaction {
                id: tx.id,
                sender: tx.sender,
                creator: tx.creator,
                nonce: tx.nonce,
                parent_ids: Vec::new(),
                depth: tx.depth,
                confidence: tx.confidence,
                seed: tx.seed,
                tag,
                payload: payload.clone(),
            };

            self.apply_with(round, state, &entry, exec_state)
                .map_err(|source| ApplyError::BatchEntry {
                    index,
                    source: Box::new(source),
                })?;
        }

        Ok(())
    }

    /// Invoke a contract with gas metering.
    ///
    /// Gas is paid from the contract's own gas balance first, any remainder
    /// from the gas payer. A faulting or gas-exhausted invocation reverts the
    /// contract's writes but still pays for the gas burned, and does not fail
    /// the enclosing transaction.
    #[allow(clippy::too_many_arguments)]
    fn invoke_contract(
        &self,
        state: &mut StateTree,
        round: &Round,
        tx: &Transaction,
        contract_id: &AccountId,
        code: &[u8],
        amount: u64,
        requested_gas_limit: u64,
        func_name: &[u8],
        func_params: &[u8],
        exec_state: &mut ExecutorState,
    ) -> Result<(), ApplyError> {
        let gas_payer_balance = read_balance(state, &exec_state.gas_payer);
        let contract_gas_balance = read_contract_gas_balance(state, contract_id);
        let available = gas_payer_balance + contract_gas_balance;

        // The first invocation in a transaction tree fixes the outer limit.
        if !exec_state.gas_limit_is_set {
            exec_state.gas_limit = requested_gas_limit;
            exec_state.gas_limit_is_set = true;
        }

        let real_gas_limit = exec_state.gas_limit.min(requested_gas_limit);

        if available < real_gas_limit {
            return Err(ApplyError::InsufficientGas {
                gas_payer: exec_state.gas_payer,
                requested: real_gas_limit,
                available,
            });
        }

        let before_execution = state.snapshot();
        let outcome = self.executor.execute(
            state,
            contract_id,
            round,
            tx,
            amount,
            real_gas_limit,
            func_name,
            func_params,
            code,
        );

        // available >= real_gas_limit >= gas_used and
        // exec_state.gas_limit >= real_gas_limit must hold from here on.
        if real_gas_limit < outcome.gas_used {
            return Err(ApplyError::BugAssertion(
                "executor reported more gas than the granted limit",
            ));
        }
        if exec_state.gas_limit < real_gas_limit {
            return Err(ApplyError::BugAssertion(
                "executor state gas limit fell below the granted limit",
            ));
        }

        let faulted = outcome.gas_limit_exceeded || outcome.error.is_some();
        if faulted {
            state.revert(before_execution);
        }

        if outcome.gas_used > contract_gas_balance {
            write_contract_gas_balance(state, contract_id, 0);
            let remainder = outcome.gas_used - contract_gas_balance;
            if gas_payer_balance < remainder {
                return Err(ApplyError::BugAssertion(
                    "gas payer balance cannot cover the gas remainder",
                ));
            }
            write_balance(state, &exec_state.gas_payer, gas_payer_balance - remainder);
        } else {
            write_contract_gas_balance(state, contract_id, contract_gas_balance - outcome.gas_used);
        }
        exec_state.gas_limit -= outcome.gas_used;

        if faulted {
            match &outcome.error {
                Some(error) => {
                    tracing::info!(contract = ?contract_id, %error, "failed to invoke smart contract");
                }
                None => {
                    tracing::info!(
                        sender = ?tx.creator,
                        contract = ?contract_id,
                        gas = outcome.gas_used,
                        gas_limit = real_gas_limit,
                        "exceeded gas limit while invoking smart contract function"
                    );
                }
            }
            return Ok(());
        }

        tracing::debug!(
            sender = ?tx.creator,
            contract = ?contract_id,
            gas = outcome.gas_used,
            gas_limit = real_gas_limit,
            "deducted PERL for invoking smart contract function"
        );

        for entry in &outcome.queue {
            if let Err(error) = self.apply_with(round, state, entry, exec_state) {
                if error.is_fatal() {
                    return Err(error);
                }
                // Enqueued sub-transactions revert individually; their
                // failure does not undo the successful contract call.
                tracing::info!(%error, "failed to process sub-transaction");
            }
        }

        Ok(())
    }
}
