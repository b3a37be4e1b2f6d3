#![forbid(unsafe_code)]

use cvl_protocol::cvl::v1::{
    Instance, InstanceId, Instruction, InstructionSignature, Invoke, ProofEnvelope, ProtocolError,
    Request, SubId, TransactionId, TransactionUnit, UPDATE_COMMAND, UPDATE_RULE,
    VALUE_CONTRACT_KIND,
};
use ledger_rpc::{LedgerError, LedgerRpc};
use log::{debug, error, info};
use signers::{SignRejected, Signer};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use thiserror::Error;

/// Maximum number of poll iterations before an evolution is declared lost.
pub const MAX_EVOLVE_POLLS: u32 = 10;

/// Errors surfaced while viewing or evolving a value instance.
#[derive(Debug, Error)]
pub enum ValueInstanceError {
    /// The instance is absent, or present with a different contract kind.
    #[error("no such value instance")]
    NotFound,
    #[error(transparent)]
    Authorization(#[from] SignRejected),
    #[error(transparent)]
    Ledger(LedgerError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("couldn't observe the new value within the poll budget")]
    ConvergenceTimeout,
    #[error("wait cancelled by caller")]
    Cancelled,
}

impl From<LedgerError> for ValueInstanceError {
    fn from(err: LedgerError) -> Self {
        match err {
            // Absent instances and wrong-kind instances surface the same way.
            LedgerError::NotFound => Self::NotFound,
            other => Self::Ledger(other),
        }
    }
}

/// Shared flag aborting a convergence wait in progress.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Client-side view of a single value instance tracked by the ledger.
///
/// The snapshot is replaced whole on every refresh; a failed refresh leaves
/// the previous snapshot untouched.
#[derive(Debug)]
pub struct ValueInstance<'a, L: LedgerRpc> {
    rpc: &'a L,
    instance: Instance,
}

impl<'a, L: LedgerRpc> ValueInstance<'a, L> {
    /// Connect to an existing value instance by id.
    pub fn new(rpc: &'a L, id: &InstanceId) -> Result<Self, ValueInstanceError> {
        let instance = fetch_instance(rpc, id)?;
        Ok(Self { rpc, instance })
    }

    /// Build a view from a proof already fetched for the same id.
    pub fn from_proof(rpc: &'a L, proof: &ProofEnvelope) -> Result<Self, ValueInstanceError> {
        let instance = decode_instance(proof)?;
        Ok(Self { rpc, instance })
    }

    /// Id of the viewed instance.
    pub fn id(&self) -> InstanceId {
        self.instance.id
    }

    /// The decoded snapshot backing this view.
    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    /// Copy of the value stored in this instance.
    pub fn value(&self) -> Vec<u8> {
        self.instance.data.clone()
    }

    /// Re-fetch the instance and replace the snapshot.
    pub fn refresh(&mut self) -> Result<(), ValueInstanceError> {
        let id = self.instance.id;
        let instance = fetch_instance(self.rpc, &id)?;
        self.instance = instance;
        Ok(())
    }

    /// Build a signed instruction evolving the value. The signer must have
    /// its identity in the governing darc under the `invoke:update` rule.
    pub fn evolve_instruction(
        &self,
        new_value: &[u8],
        signer: &dyn Signer,
        index: u32,
        length: u32,
    ) -> Result<Instruction, ValueInstanceError> {
        self.evolve_instruction_with(new_value, &[signer], index, length)
    }

    /// Multi-signer variant of [`Self::evolve_instruction`]: every supplied
    /// signer's identity is listed in the request and one signature per
    /// signer is appended, in order. Whether the collected identities
    /// satisfy the rule is the policy engine's decision, not this client's.
    pub fn evolve_instruction_with(
        &self,
        new_value: &[u8],
        signers: &[&dyn Signer],
        index: u32,
        length: u32,
    ) -> Result<Instruction, ValueInstanceError> {
        let invoke = Invoke {
            command: UPDATE_COMMAND.to_string(),
            contract_kind: VALUE_CONTRACT_KIND.to_string(),
            argument: new_value.to_vec(),
        };
        let mut instruction =
            Instruction::new(self.instance.id, SubId::random(), index, length, invoke);

        let request = Request {
            darc_id: self.instance.id.darc_id(),
            rule: UPDATE_RULE.to_string(),
            instruction_digest: instruction.digest(),
            identities: signers.iter().map(|signer| signer.identity()).collect(),
            extra: None,
        };
        let request_digest = request.digest();
        info!("signing request {}", hex::encode(request_digest));

        for signer in signers {
            let signature = signer.sign(&request_digest)?;
            instruction.append_signature(InstructionSignature {
                signature,
                signer: signer.identity(),
            });
        }
        Ok(instruction)
    }

    /// Submit a single-instruction transaction unit evolving the value.
    ///
    /// Submission is fire-and-forget: the returned id correlates the unit,
    /// it does not mean the mutation is visible yet.
    pub fn evolve_value(
        &self,
        new_value: &[u8],
        signer: &dyn Signer,
    ) -> Result<TransactionId, ValueInstanceError> {
        let instruction = self.evolve_instruction(new_value, signer, 0, 1)?;
        let unit = TransactionUnit::new(vec![instruction])?;
        let ack = self.rpc.submit(&unit)?;
        Ok(ack.transaction_id)
    }

    /// Evolve the value and block until the ledger reflects it.
    pub fn evolve_value_and_wait(
        &mut self,
        new_value: &[u8],
        signer: &dyn Signer,
    ) -> Result<TransactionId, ValueInstanceError> {
        self.evolve_value_and_wait_with(new_value, signer, &CancelToken::default())
    }

    /// Cancellable variant of [`Self::evolve_value_and_wait`]. Re-fetches the
    /// instance up to [`MAX_EVOLVE_POLLS`] times, sleeping one ledger block
    /// interval between attempts. A fired cancel token surfaces as
    /// [`ValueInstanceError::Cancelled`], distinct from timeout.
    pub fn evolve_value_and_wait_with(
        &mut self,
        new_value: &[u8],
        signer: &dyn Signer,
        cancel: &CancelToken,
    ) -> Result<TransactionId, ValueInstanceError> {
        let transaction_id = self.evolve_value(new_value, signer)?;
        let id = self.instance.id;

        for attempt in 1..=MAX_EVOLVE_POLLS {
            let instance = fetch_instance(self.rpc, &id)?;
            debug!(
                "poll {attempt}: stored {} - expected {}",
                hex::encode(&instance.data),
                hex::encode(new_value)
            );
            if instance.data.as_slice() == new_value {
                self.instance = instance;
                return Ok(transaction_id);
            }
            if cancel.is_cancelled() {
                return Err(ValueInstanceError::Cancelled);
            }
            thread::sleep(self.rpc.block_interval());
        }
        Err(ValueInstanceError::ConvergenceTimeout)
    }
}

fn fetch_instance<L: LedgerRpc>(
    rpc: &L,
    id: &InstanceId,
) -> Result<Instance, ValueInstanceError> {
    let proof = rpc.fetch_proof(id)?;
    decode_instance(&proof)
}

fn decode_instance(proof: &ProofEnvelope) -> Result<Instance, ValueInstanceError> {
    let instance = Instance::from_proof(proof)?;
    if instance.contract_kind != VALUE_CONTRACT_KIND {
        error!("wrong instance kind: {}", instance.contract_kind);
        return Err(ValueInstanceError::NotFound);
    }
    Ok(instance)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cvl_protocol::cvl::v1::DarcId;
    use ledger_rpc::MockLedger;
    use signers::{verify_signature, Ed25519Signer, RejectingSigner};
    use std::time::Duration;

    fn sample_id() -> InstanceId {
        InstanceId::new(DarcId([0xAB; 32]), SubId::zero())
    }

    fn seeded_ledger(value: &[u8]) -> (MockLedger, InstanceId) {
        let ledger = MockLedger::new(Duration::from_millis(1));
        let id = sample_id();
        ledger.seed_instance(id, VALUE_CONTRACT_KIND, value.to_vec());
        (ledger, id)
    }

    #[test]
    fn view_exposes_seeded_value() {
        let (ledger, id) = seeded_ledger(b"v1");
        let view = ValueInstance::new(&ledger, &id).unwrap();
        assert_eq!(view.id(), id);
        assert_eq!(view.value(), b"v1");
        assert_eq!(view.instance().contract_kind, VALUE_CONTRACT_KIND);
    }

    #[test]
    fn wrong_contract_kind_is_not_found() {
        let ledger = MockLedger::new(Duration::from_millis(1));
        let id = sample_id();
        ledger.seed_instance(id, "darc", b"policy".to_vec());
        assert!(matches!(
            ValueInstance::new(&ledger, &id).unwrap_err(),
            ValueInstanceError::NotFound
        ));
    }

    #[test]
    fn absent_instance_is_not_found() {
        let ledger = MockLedger::new(Duration::from_millis(1));
        assert!(matches!(
            ValueInstance::new(&ledger, &sample_id()).unwrap_err(),
            ValueInstanceError::NotFound
        ));
    }

    #[test]
    fn view_constructs_from_prefetched_proof() {
        let (ledger, id) = seeded_ledger(b"v1");
        let proof = ledger.fetch_proof(&id).unwrap();
        let view = ValueInstance::from_proof(&ledger, &proof).unwrap();
        assert_eq!(view.value(), b"v1");
    }

    #[test]
    fn value_returns_unaliased_copies() {
        let (ledger, id) = seeded_ledger(b"v1");
        let view = ValueInstance::new(&ledger, &id).unwrap();
        let mut first = view.value();
        let second = view.value();
        assert_eq!(first, second);
        first[0] ^= 0xFF;
        assert_eq!(second, b"v1");
        assert_eq!(view.value(), b"v1");
    }

    #[test]
    fn instruction_signature_verifies_against_request() {
        let (ledger, id) = seeded_ledger(b"v1");
        let view = ValueInstance::new(&ledger, &id).unwrap();
        let signer = Ed25519Signer::generate();

        let instruction = view.evolve_instruction(b"v2", &signer, 0, 1).unwrap();
        assert_eq!(instruction.signatures.len(), 1);

        let request = Request {
            darc_id: id.darc_id(),
            rule: UPDATE_RULE.to_string(),
            instruction_digest: instruction.digest(),
            identities: vec![signer.identity()],
            extra: None,
        };
        assert!(verify_signature(
            &signer.identity(),
            &request.digest(),
            &instruction.signatures[0].signature
        ));
    }

    #[test]
    fn multi_signer_instruction_lists_all_identities() {
        let (ledger, id) = seeded_ledger(b"v1");
        let view = ValueInstance::new(&ledger, &id).unwrap();
        let first = Ed25519Signer::generate();
        let second = Ed25519Signer::generate();

        let instruction = view
            .evolve_instruction_with(b"v2", &[&first, &second], 0, 1)
            .unwrap();
        assert_eq!(instruction.signatures.len(), 2);
        assert_eq!(instruction.signatures[0].signer, first.identity());
        assert_eq!(instruction.signatures[1].signer, second.identity());

        let request = Request {
            darc_id: id.darc_id(),
            rule: UPDATE_RULE.to_string(),
            instruction_digest: instruction.digest(),
            identities: vec![first.identity(), second.identity()],
            extra: None,
        };
        let request_digest = request.digest();
        for signature in &instruction.signatures {
            assert!(verify_signature(
                &signature.signer,
                &request_digest,
                &signature.signature
            ));
        }
    }

    #[test]
    fn rejected_signer_surfaces_authorization_error() {
        let (ledger, id) = seeded_ledger(b"v1");
        let view = ValueInstance::new(&ledger, &id).unwrap();
        let signer = RejectingSigner::new("identity not in rule");

        let err = view.evolve_instruction(b"v2", &signer, 0, 1).unwrap_err();
        assert!(matches!(err, ValueInstanceError::Authorization(_)));
    }

    #[test]
    fn evolution_converges_within_budget() {
        let (ledger, id) = seeded_ledger(b"v1");
        ledger.set_visibility_lag(3);
        let signer = Ed25519Signer::generate();
        let mut view = ValueInstance::new(&ledger, &id).unwrap();

        view.evolve_value_and_wait(b"v2", &signer).unwrap();
        assert_eq!(view.value(), b"v2");
        assert_eq!(ledger.stored_value(&id).unwrap(), b"v2");
    }

    #[test]
    fn exhausted_poll_budget_times_out() {
        let (ledger, id) = seeded_ledger(b"v1");
        ledger.set_visibility_lag(u32::MAX);
        let signer = Ed25519Signer::generate();
        let mut view = ValueInstance::new(&ledger, &id).unwrap();

        let before = ledger.fetch_count();
        let err = view.evolve_value_and_wait(b"v2", &signer).unwrap_err();
        assert!(matches!(err, ValueInstanceError::ConvergenceTimeout));
        assert_eq!(ledger.fetch_count() - before, u64::from(MAX_EVOLVE_POLLS));
        assert_eq!(view.value(), b"v1");
    }

    #[test]
    fn cancelled_wait_is_reported_as_cancelled() {
        let (ledger, id) = seeded_ledger(b"v1");
        ledger.set_visibility_lag(u32::MAX);
        let signer = Ed25519Signer::generate();
        let mut view = ValueInstance::new(&ledger, &id).unwrap();

        let cancel = CancelToken::new();
        cancel.cancel();
        let err = view
            .evolve_value_and_wait_with(b"v2", &signer, &cancel)
            .unwrap_err();
        assert!(matches!(err, ValueInstanceError::Cancelled));
    }

    #[test]
    fn failed_refresh_keeps_prior_snapshot() {
        let (ledger, id) = seeded_ledger(b"v1");
        let mut view = ValueInstance::new(&ledger, &id).unwrap();

        ledger.fail_next_fetch(LedgerError::Transport("node unreachable".to_string()));
        let err = view.refresh().unwrap_err();
        assert!(matches!(
            err,
            ValueInstanceError::Ledger(LedgerError::Transport(_))
        ));
        assert_eq!(view.value(), b"v1");

        view.refresh().unwrap();
        assert_eq!(view.value(), b"v1");
    }

    #[test]
    fn submission_rejection_propagates() {
        let (ledger, id) = seeded_ledger(b"v1");
        let signer = Ed25519Signer::generate();
        let view = ValueInstance::new(&ledger, &id).unwrap();

        ledger.fail_next_submit(LedgerError::Submission("pool full".to_string()));
        let err = view.evolve_value(b"v2", &signer).unwrap_err();
        assert!(matches!(
            err,
            ValueInstanceError::Ledger(LedgerError::Submission(_))
        ));
    }
}
