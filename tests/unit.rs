use async_trait::async_trait;
use percolator_inspect::{
    config::InspectorOptions,
    error::{ConfigError, SimulateError, TransportError},
    ledger::{ClusterVersion, LedgerTransport, MemoryLedger, RemoteAccount, RetryingLedger, SimulationResponse},
    probe::{probe, probe_one, AccountObservation, ProbeOutcome},
    simulate::{check_target, probe_instruction, probe_transaction},
};
use solana_program::{hash::Hash, pubkey::Pubkey};
use solana_sdk::{
    signature::{Keypair, Signer},
    transaction::Transaction,
};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Counts how many account reads are in flight at once.
#[derive(Default)]
struct InFlightCounter {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl LedgerTransport for InFlightCounter {
    async fn get_account_info(&self, _address: &Pubkey) -> Result<Option<RemoteAccount>, TransportError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(None)
    }

    async fn get_latest_blockhash(&self) -> Result<Hash, TransportError> {
        Ok(Hash::default())
    }

    async fn simulate_transaction(&self, _transaction: &Transaction) -> Result<SimulationResponse, TransportError> {
        Ok(SimulationResponse::default())
    }

    async fn get_cluster_version(&self) -> Result<ClusterVersion, TransportError> {
        Err(TransportError::Connection("unsupported".to_string()))
    }
}

fn fan_out(n: usize) -> NonZeroUsize {
    NonZeroUsize::new(n).unwrap()
}

#[tokio::test]
async fn test_probe_respects_fan_out() {
    let ledger = InFlightCounter::default();
    let addresses: Vec<Pubkey> = (0..20).map(|_| Pubkey::new_unique()).collect();

    let outcomes = probe(&ledger, addresses, fan_out(3), None).await;

    assert_eq!(outcomes.len(), 20);
    assert!(ledger.peak.load(Ordering::SeqCst) <= 3);
    assert!(outcomes.values().all(|o| *o == ProbeOutcome::Observed(AccountObservation::absent())));
}

#[tokio::test]
async fn test_probe_deduplicates_addresses() {
    let ledger = MemoryLedger::new();
    let address = Pubkey::new_unique();

    let outcomes = probe(&ledger, vec![address, address, address], fan_out(4), None).await;

    assert_eq!(outcomes.len(), 1);
    assert_eq!(ledger.account_info_calls(), 1);
}

#[tokio::test]
async fn test_failure_isolated_to_one_address() {
    let ledger = MemoryLedger::new();
    let good = Pubkey::new_unique();
    let bad = Pubkey::new_unique();
    let owner = Pubkey::new_unique();
    ledger.insert_account(good, RemoteAccount { lamports: 10, owner, executable: false, data_len: 64 });
    ledger.fail_address(bad, TransportError::Rpc { code: -32005, message: "node is behind".to_string() });

    let outcomes = probe(&ledger, vec![good, bad], fan_out(2), None).await;

    let observed = outcomes[&good].observation().unwrap();
    assert!(observed.exists);
    assert_eq!(observed.owner, Some(owner));
    assert_eq!(observed.data_len, 64);
    assert!(matches!(outcomes[&bad], ProbeOutcome::Failed(TransportError::Rpc { code: -32005, .. })));
}

#[tokio::test]
async fn test_retry_recovers_from_flaky_reads() {
    let inner = MemoryLedger::new();
    let address = Pubkey::new_unique();
    inner.insert_account(address, RemoteAccount { lamports: 1, owner: Pubkey::new_unique(), executable: false, data_len: 0 });
    inner.flaky_address(address, 2);
    let ledger = RetryingLedger::new(inner, 3, Duration::from_millis(1));

    let outcome = probe_one(&ledger, &address, None).await;

    assert!(outcome.observation().unwrap().exists);
    assert_eq!(ledger.inner().account_info_calls(), 3);
}

#[tokio::test]
async fn test_retry_gives_up_after_max_retries() {
    let inner = MemoryLedger::new();
    let address = Pubkey::new_unique();
    inner.flaky_address(address, 5);
    let ledger = RetryingLedger::new(inner, 2, Duration::from_millis(1));

    let outcome = probe_one(&ledger, &address, None).await;

    assert!(matches!(outcome, ProbeOutcome::Failed(TransportError::Connection(_))));
    assert_eq!(ledger.inner().account_info_calls(), 3);
}

#[tokio::test]
async fn test_rpc_errors_are_not_retried() {
    let inner = MemoryLedger::new();
    let address = Pubkey::new_unique();
    inner.fail_address(address, TransportError::Rpc { code: -32602, message: "invalid params".to_string() });
    let ledger = RetryingLedger::new(inner, 5, Duration::from_millis(1));

    let _ = probe_one(&ledger, &address, None).await;

    assert_eq!(ledger.inner().account_info_calls(), 1);
}

#[tokio::test]
async fn test_stalled_read_cancelled_at_deadline() {
    let ledger = MemoryLedger::new();
    let address = Pubkey::new_unique();
    ledger.stall_address(address);
    let deadline = tokio::time::Instant::now() + Duration::from_millis(50);

    let outcome = probe_one(&ledger, &address, Some(deadline)).await;

    assert_eq!(outcome, ProbeOutcome::Failed(TransportError::Cancelled));
}

#[test]
fn test_probe_instruction_shape() {
    let program_id = Pubkey::new_unique();
    let payer = Pubkey::new_unique();
    let ix = probe_instruction(&program_id, &payer);

    assert_eq!(ix.program_id, program_id);
    assert!(ix.data.is_empty());
    assert_eq!(ix.accounts.len(), 1);
    assert_eq!(ix.accounts[0].pubkey, payer);
    assert!(ix.accounts[0].is_signer);
    assert!(!ix.accounts[0].is_writable);
}

#[test]
fn test_probe_transaction_is_signed_by_identity() {
    let identity = Keypair::new();
    let program_id = Pubkey::new_unique();
    let blockhash = Hash::new_unique();

    let tx = probe_transaction(&program_id, &identity, blockhash);

    assert!(tx.verify().is_ok());
    assert_eq!(tx.message.account_keys[0], identity.pubkey());
    assert_eq!(tx.message.recent_blockhash, blockhash);
    assert_eq!(tx.signatures.len(), 1);
}

#[test]
fn test_check_target_requires_executable() {
    let program_id = Pubkey::new_unique();
    let executable = ProbeOutcome::Observed(AccountObservation {
        exists: true,
        owner: Some(Pubkey::new_unique()),
        executable: true,
        data_len: 36,
        lamports: 1,
    });
    assert!(check_target(&program_id, &executable).is_ok());

    let absent = ProbeOutcome::Observed(AccountObservation::absent());
    assert!(matches!(
        check_target(&program_id, &absent),
        Err(SimulateError::TargetNotExecutable { reason, .. }) if reason == "account not found"
    ));

    let failed = ProbeOutcome::Failed(TransportError::Timeout);
    assert_eq!(check_target(&program_id, &failed), Err(SimulateError::Transport(TransportError::Timeout)));
}

#[tokio::test]
async fn test_reads_queued_past_deadline_never_start() {
    let ledger = MemoryLedger::new();
    // Sorts first, so with one slot it holds the queue until the deadline.
    let stalled = Pubkey::default();
    ledger.stall_address(stalled);
    let present: Vec<Pubkey> = (1..=4u8).map(|i| Pubkey::new_from_array([i; 32])).collect();
    for address in &present {
        ledger.insert_account(*address, RemoteAccount { lamports: 1, owner: Pubkey::new_unique(), executable: false, data_len: 8 });
    }
    let deadline = tokio::time::Instant::now() + Duration::from_millis(50);

    let addresses = std::iter::once(stalled).chain(present.iter().copied());
    let outcomes = probe(&ledger, addresses, fan_out(1), Some(deadline)).await;

    assert_eq!(outcomes.len(), 5);
    assert!(outcomes.values().all(|o| *o == ProbeOutcome::Failed(TransportError::Cancelled)));
    assert_eq!(ledger.account_info_calls(), 1);
}

#[tokio::test]
async fn test_removed_account_reads_as_absent() {
    let ledger = MemoryLedger::new();
    let address = Pubkey::new_unique();
    ledger.insert_account(address, RemoteAccount { lamports: 5, owner: Pubkey::new_unique(), executable: false, data_len: 0 });
    assert!(probe_one(&ledger, &address, None).await.observation().unwrap().exists);

    ledger.remove_account(&address);

    assert_eq!(probe_one(&ledger, &address, None).await, ProbeOutcome::Observed(AccountObservation::absent()));
}

#[test]
fn test_options_from_json_file() {
    let path = std::env::temp_dir().join(format!("percolator-inspect-{}.json", std::process::id()));
    std::fs::write(&path, r#"{"market":"SOL-PERP","nonce":9,"runTimeoutMs":1500}"#).unwrap();

    let options = InspectorOptions::from_json_file(&path).unwrap();
    std::fs::remove_file(&path).unwrap();

    assert_eq!(options.market.as_deref(), Some("SOL-PERP"));
    assert_eq!(options.nonce, Some(9));
    assert_eq!(options.run_timeout_ms, Some(1500));

    let missing = InspectorOptions::from_json_file(&path);
    assert!(matches!(missing, Err(ConfigError::Io { .. })));
}

#[test]
fn test_options_from_env() {
    std::env::set_var("PERCOLATOR_MARKET", "ETH-PERP");
    std::env::set_var("PERCOLATOR_FAN_OUT", "2");

    let options = InspectorOptions::from_env();

    std::env::remove_var("PERCOLATOR_MARKET");
    std::env::remove_var("PERCOLATOR_FAN_OUT");
    let options = options.unwrap();
    assert_eq!(options.market.as_deref(), Some("ETH-PERP"));
    assert_eq!(options.fan_out, Some(2));
}
