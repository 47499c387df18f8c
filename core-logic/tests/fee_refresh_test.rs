mod common;

use common::{engine_config, MockChain};
use core_logic::{
    BatchRequest, EndpointConfig, EndpointPool, FeeConfig, FeeEstimator, OperationRequest,
    Orchestrator, PercentileTable, PriorityLevel, ShutdownSignal,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn table(medium: u64) -> PercentileTable {
    PercentileTable::from_levels([
        (PriorityLevel::Min, 0),
        (PriorityLevel::Medium, medium),
        (PriorityLevel::UnsafeMax, medium * 100),
    ])
}

fn pool() -> Arc<EndpointPool> {
    Arc::new(
        EndpointPool::new(&EndpointConfig {
            primary: "https://primary.test".to_string(),
            alternatives: vec![],
            failure_threshold: 3,
            cooldown_secs: 60,
        })
        .unwrap(),
    )
}

fn medium_fee(fees: &FeeEstimator) -> u64 {
    fees.observation().table.fee_for(PriorityLevel::Medium)
}

#[tokio::test(start_paused = true)]
async fn test_failed_refresh_keeps_table_and_retries_sooner() {
    let chain = Arc::new(MockChain::new(0));
    chain.state().fee_table = table(2_000);
    let fees = Arc::new(FeeEstimator::new(FeeConfig::default()));
    let cancel = CancellationToken::new();
    let task = Arc::clone(&fees).spawn_refresh_loop(Arc::clone(&chain), pool(), cancel.clone());

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(chain.state().fee_fetches, 1);
    assert_eq!(medium_fee(&fees), 2_000);

    chain.state().fee_fetch_fails = true;
    // t = 301: the scheduled refresh ran and failed.
    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(chain.state().fee_fetches, 2);
    assert_eq!(medium_fee(&fees), 2_000);

    // Retry follows after 30 s, not another 300 s.
    tokio::time::sleep(Duration::from_secs(19)).await;
    assert_eq!(chain.state().fee_fetches, 2);
    tokio::time::sleep(Duration::from_secs(11)).await;
    assert_eq!(chain.state().fee_fetches, 3);
    assert_eq!(medium_fee(&fees), 2_000);

    {
        let mut state = chain.state();
        state.fee_fetch_fails = false;
        state.fee_table = table(7_000);
    }
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(chain.state().fee_fetches, 4);
    assert_eq!(medium_fee(&fees), 7_000);

    cancel.cancel();
    task.await.unwrap();
}

fn request() -> BatchRequest {
    BatchRequest {
        wallet_count: 1,
        amount_per_wallet: 10_000,
        operation: OperationRequest::default(),
        priority_level: None,
    }
}

async fn start(dir: &TempDir, chain: &Arc<MockChain>) -> Orchestrator<MockChain> {
    Orchestrator::start(
        engine_config(dir.path()),
        Arc::clone(chain),
        None,
        ShutdownSignal::new(),
    )
    .await
    .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_retry_after_compute_budget_failure_pays_more() {
    let dir = TempDir::new().unwrap();
    let chain = Arc::new(MockChain::new(1_000_000));
    chain
        .state()
        .reject_next
        .push_back("Transaction simulation failed: Computational budget exceeded".to_string());
    let orchestrator = start(&dir, &chain).await;

    let cycle = orchestrator.run_batch(request()).await.unwrap();
    assert!(cycle.funding_signature.is_some());

    let fees = chain.state().attempted_fees.clone();
    assert!(fees.len() >= 2);
    assert!(fees[1] > fees[0], "escalated fee {} not above {}", fees[1], fees[0]);

    orchestrator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_endpoint_fault_retries_at_same_fee() {
    let dir = TempDir::new().unwrap();
    let chain = Arc::new(MockChain::new(1_000_000));
    chain.state().unavailable_next = 1;
    let orchestrator = start(&dir, &chain).await;

    let cycle = orchestrator.run_batch(request()).await.unwrap();
    assert!(cycle.funding_signature.is_some());

    let fees = chain.state().attempted_fees.clone();
    assert_eq!(fees[0], fees[1]);
    assert!(!orchestrator.fees().snapshot().recovery_mode);

    orchestrator.shutdown().await;
}
