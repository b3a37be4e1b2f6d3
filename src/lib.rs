#![forbid(unsafe_code)]

//! Facade over the CVL value-instance client crates.

pub use cvl_protocol::cvl;
pub use ledger_rpc::{Ack, LedgerError, LedgerRpc, MockLedger};
pub use signers::{Ed25519Signer, RejectingSigner, SignRejected, Signer};
pub use value_instance::{CancelToken, ValueInstance, ValueInstanceError, MAX_EVOLVE_POLLS};
