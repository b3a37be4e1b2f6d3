#![forbid(unsafe_code)]

use cvl_protocol::cvl::v1::{DarcId, InstanceId, SubId, VALUE_CONTRACT_KIND};
use ledger_rpc::MockLedger;
use signers::Ed25519Signer;
use std::time::Duration;
use value_instance::{ValueInstance, ValueInstanceError};

fn run() -> Result<(), ValueInstanceError> {
    let ledger = MockLedger::new(Duration::from_millis(10));
    ledger.set_visibility_lag(2);

    let id = InstanceId::new(DarcId([7u8; 32]), SubId::zero());
    ledger.seed_instance(id, VALUE_CONTRACT_KIND, b"genesis".to_vec());

    let signer = Ed25519Signer::generate();
    let mut view = ValueInstance::new(&ledger, &id)?;
    println!("initial value: {}", String::from_utf8_lossy(&view.value()));

    let transaction_id = view.evolve_value_and_wait(b"evolved", &signer)?;
    println!("converged value: {}", String::from_utf8_lossy(&view.value()));
    println!("transaction id: {}", hex::encode(transaction_id.as_bytes()));
    Ok(())
}

fn main() {
    if let Err(err) = run() {
        eprintln!("value evolution failed: {err}");
        std::process::exit(1);
    }
}
