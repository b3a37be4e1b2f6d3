#![forbid(unsafe_code)]

use cvl_protocol::cvl::v1::{
    InstanceId, Instruction, ProofEnvelope, Request, TransactionId, TransactionUnit,
    UPDATE_COMMAND, UPDATE_RULE,
};
use signers::verify_signature;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the ledger collaborator seam.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("no such instance")]
    NotFound,
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("submission rejected: {0}")]
    Submission(String),
}

/// Acknowledgement returned by the ledger for an accepted transaction unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub transaction_id: TransactionId,
}

/// Narrow interface to a running ledger node.
pub trait LedgerRpc {
    /// Fetch the authenticated state proof for an instance.
    fn fetch_proof(&self, id: &InstanceId) -> Result<ProofEnvelope, LedgerError>;

    /// Submit a transaction unit. Exactly one network interaction per call;
    /// retry and durability belong to the ledger, not this seam.
    fn submit(&self, unit: &TransactionUnit) -> Result<Ack, LedgerError>;

    /// Expected block production cadence, used as the poll-retry delay.
    fn block_interval(&self) -> Duration;
}

#[derive(Debug, Clone)]
struct StoredInstance {
    contract_kind: String,
    value: Vec<u8>,
}

#[derive(Debug, Clone)]
struct PendingWrite {
    value: Vec<u8>,
    fetches_left: u32,
}

#[derive(Debug, Default)]
struct MockState {
    instances: HashMap<InstanceId, StoredInstance>,
    pending: HashMap<InstanceId, PendingWrite>,
    seen_tokens: HashSet<[u8; 32]>,
    visibility_lag: u32,
    fetch_count: u64,
    fail_fetch: Option<LedgerError>,
    fail_submit: Option<LedgerError>,
}

/// In-memory ledger for tests and demos.
///
/// Submitted updates stay invisible for a configurable number of proof
/// fetches, simulating block production lag. Idempotency tokens are
/// deduplicated: a replayed unit is acknowledged without being re-applied.
#[derive(Debug, Default)]
pub struct MockLedger {
    state: Mutex<MockState>,
    block_interval: Duration,
}

impl MockLedger {
    pub fn new(block_interval: Duration) -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            block_interval,
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register an instance in the visible global state.
    pub fn seed_instance(&self, id: InstanceId, contract_kind: &str, value: Vec<u8>) {
        self.lock().instances.insert(
            id,
            StoredInstance {
                contract_kind: contract_kind.to_string(),
                value,
            },
        );
    }

    /// Number of proof fetches a submitted update stays invisible for.
    pub fn set_visibility_lag(&self, fetches: u32) {
        self.lock().visibility_lag = fetches;
    }

    /// Fail the next proof fetch with the given error, once.
    pub fn fail_next_fetch(&self, err: LedgerError) {
        self.lock().fail_fetch = Some(err);
    }

    /// Fail the next submission with the given error, once.
    pub fn fail_next_submit(&self, err: LedgerError) {
        self.lock().fail_submit = Some(err);
    }

    /// Total number of proof fetches served so far.
    pub fn fetch_count(&self) -> u64 {
        self.lock().fetch_count
    }

    /// Currently visible value of an instance, if any.
    pub fn stored_value(&self, id: &InstanceId) -> Option<Vec<u8>> {
        self.lock()
            .instances
            .get(id)
            .map(|stored| stored.value.clone())
    }

    fn validate_instruction(
        instruction: &Instruction,
        stored: &StoredInstance,
    ) -> Result<(), LedgerError> {
        if instruction.invoke.command != UPDATE_COMMAND {
            return Err(LedgerError::Submission(format!(
                "unsupported invocation: {}",
                instruction.invoke.command
            )));
        }
        if instruction.invoke.contract_kind != stored.contract_kind {
            return Err(LedgerError::Submission(format!(
                "contract kind mismatch: {}",
                instruction.invoke.contract_kind
            )));
        }
        if instruction.signatures.is_empty() {
            return Err(LedgerError::Submission("unsigned instruction".to_string()));
        }

        // Re-derive the governed request exactly as the client built it and
        // check every attached signature against its identity.
        let request = Request {
            darc_id: instruction.target.darc_id(),
            rule: UPDATE_RULE.to_string(),
            instruction_digest: instruction.digest(),
            identities: instruction
                .signatures
                .iter()
                .map(|signature| signature.signer)
                .collect(),
            extra: None,
        };
        let request_digest = request.digest();
        for signature in &instruction.signatures {
            if !verify_signature(&signature.signer, &request_digest, &signature.signature) {
                return Err(LedgerError::Submission(
                    "request signature verification failed".to_string(),
                ));
            }
        }
        Ok(())
    }
}

impl LedgerRpc for MockLedger {
    fn fetch_proof(&self, id: &InstanceId) -> Result<ProofEnvelope, LedgerError> {
        let mut state = self.lock();
        state.fetch_count += 1;
        if let Some(err) = state.fail_fetch.take() {
            return Err(err);
        }

        let landed = match state.pending.get_mut(id) {
            Some(pending) if pending.fetches_left == 0 => true,
            Some(pending) => {
                pending.fetches_left -= 1;
                false
            }
            None => false,
        };
        if landed {
            if let Some(write) = state.pending.remove(id) {
                if let Some(stored) = state.instances.get_mut(id) {
                    stored.value = write.value;
                }
            }
        }

        let stored = state.instances.get(id).ok_or(LedgerError::NotFound)?;
        Ok(ProofEnvelope {
            key: id.to_bytes().to_vec(),
            contract_kind: stored.contract_kind.clone(),
            value: stored.value.clone(),
        })
    }

    fn submit(&self, unit: &TransactionUnit) -> Result<Ack, LedgerError> {
        let mut guard = self.lock();
        let state = &mut *guard;
        if let Some(err) = state.fail_submit.take() {
            return Err(err);
        }

        let ack = Ack {
            transaction_id: unit.id(),
        };
        if state.seen_tokens.contains(&unit.token) {
            // Replayed token: acknowledged, not re-applied.
            return Ok(ack);
        }

        let lag = state.visibility_lag;
        for instruction in &unit.instructions {
            let stored = state
                .instances
                .get(&instruction.target)
                .ok_or_else(|| LedgerError::Submission("unknown target instance".to_string()))?;
            Self::validate_instruction(instruction, stored)?;
            state.pending.insert(
                instruction.target,
                PendingWrite {
                    value: instruction.invoke.argument.clone(),
                    fetches_left: lag,
                },
            );
        }
        state.seen_tokens.insert(unit.token);
        Ok(ack)
    }

    fn block_interval(&self) -> Duration {
        self.block_interval
    }
}
