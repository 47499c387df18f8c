mod common;

use common::{MockChain, Script};
use core_logic::{
    ChainClient, ConfirmationConfig, ConfirmationStatus, ConfirmationTracker, EndpointPool, EndpointRole,
    FailureReason, FeeConfig, FeeEstimator, MetricsCollector, OperationRequest,
};
use std::sync::Arc;
use std::time::Duration;

fn pool() -> Arc<EndpointPool> {
    Arc::new(EndpointPool::from_parts(
        "https://primary.test",
        &["https://alt-1.test".to_string(), "https://alt-2.test".to_string()],
        3,
        Duration::from_secs(60),
    ))
}

fn tracker(
    chain: Arc<MockChain>,
    pool: Arc<EndpointPool>,
    fees: Arc<FeeEstimator>,
) -> ConfirmationTracker<MockChain> {
    ConfirmationTracker::new(
        chain,
        pool,
        fees,
        Arc::new(MetricsCollector::default()),
        ConfirmationConfig {
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            max_retries: 5,
            max_concurrent_polls: 8,
        },
    )
}

#[tokio::test(start_paused = true)]
async fn test_timeout_follows_exponential_schedule() {
    let chain = Arc::new(MockChain::new(0));
    let fees = Arc::new(FeeEstimator::new(FeeConfig::default()));
    let tracker = tracker(chain.clone(), pool(), fees.clone());

    let started = tokio::time::Instant::now();
    let outcome = tracker.register("never-lands".to_string(), 7).wait().await;

    // 1 + 2 + 4 + 8 + 16 seconds
    assert_eq!(outcome.status, ConfirmationStatus::TimedOut);
    assert_eq!(outcome.attempts, 5);
    let waited = started.elapsed();
    assert!(waited >= Duration::from_secs(31), "{:?}", waited);
    assert!(waited < Duration::from_secs(32), "{:?}", waited);
    assert_eq!(outcome.failure_reason(), Some(FailureReason::ConfirmationTimeout));

    // Terminal outcomes feed the fee estimator.
    assert!(fees.snapshot().recovery_mode);
    assert_eq!(tracker.pending(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_delay_is_capped() {
    let chain = Arc::new(MockChain::new(0));
    let fees = Arc::new(FeeEstimator::new(FeeConfig::default()));
    let tracker = tracker(chain, pool(), fees);
    assert_eq!(tracker.delay_for(0), Duration::from_secs(1));
    assert_eq!(tracker.delay_for(4), Duration::from_secs(16));
    assert_eq!(tracker.delay_for(5), Duration::from_secs(30));
    assert_eq!(tracker.delay_for(40), Duration::from_secs(30));
}

#[tokio::test(start_paused = true)]
async fn test_onchain_failure_is_terminal_immediately() {
    let chain = Arc::new(MockChain::new(0));
    {
        let mut state = chain.state();
        state.operation = Script::Fail("InstructionError(0, Custom(1))".to_string());
    }
    let fees = Arc::new(FeeEstimator::new(FeeConfig::default()));
    let pool = pool();

    // Produce a scripted failing signature through the chain itself.
    let wallet = chain.generate_wallet(1).unwrap();
    let endpoint = pool.primary();
    let tx = chain
        .build_operation_transaction(&wallet, &OperationRequest::default(), 0, &endpoint)
        .await
        .unwrap();
    let signature = chain.sign_and_submit(tx, &[], &endpoint).await.unwrap();

    let tracker = tracker(chain.clone(), pool, fees);
    let outcome = tracker.register(signature, 1).wait().await;

    assert!(matches!(outcome.status, ConfirmationStatus::Failed(_)));
    assert_eq!(outcome.attempts, 1);
    assert_eq!(outcome.failure_reason(), Some(FailureReason::OnChainFailure));
}

#[tokio::test(start_paused = true)]
async fn test_register_does_not_block_and_drain_waits() {
    let chain = Arc::new(MockChain::new(0));
    let fees = Arc::new(FeeEstimator::new(FeeConfig::default()));
    let tracker = tracker(chain, pool(), fees);

    let handles: Vec<_> = (0..10)
        .map(|i| tracker.register(format!("pending-{}", i), i))
        .collect();
    assert_eq!(tracker.pending(), 10);
    assert_eq!(handles[3].signature(), "pending-3");

    tracker.drain().await;
    assert_eq!(tracker.pending(), 0);
    for handle in handles {
        assert_eq!(handle.wait().await.status, ConfirmationStatus::TimedOut);
    }
}

#[tokio::test(start_paused = true)]
async fn test_polling_avoids_unhealthy_primary() {
    let chain = Arc::new(MockChain::new(0));
    let fees = Arc::new(FeeEstimator::new(FeeConfig::default()));
    let pool = pool();

    let primary = pool.primary();
    for _ in 0..3 {
        pool.report_outcome(&primary, false);
    }

    let tracker = tracker(chain.clone(), pool.clone(), fees);
    tracker.register("x".to_string(), 0).wait().await;

    let polls = chain.state().polls.clone();
    assert_eq!(polls.len(), 5);
    assert!(polls.iter().all(|url| url != "https://primary.test"));
    assert_eq!(
        pool.next_endpoint(EndpointRole::Alternative).role,
        EndpointRole::Alternative
    );
}
