use core_logic::{classify_failure, with_retry, CoreError, FailureReason, RetryConfig};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_retry_success_first_try() {
    let counter = Arc::new(AtomicUsize::new(0));
    let config = RetryConfig::new(3, 10).without_jitter();

    let result: Result<String, anyhow::Error> = with_retry(config, "test_op", || async {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok("success".to_string())
    })
    .await;

    assert!(result.is_ok());
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_retry_success_after_failures() {
    let counter = Arc::new(AtomicUsize::new(0));
    let config = RetryConfig::new(3, 10).without_jitter();

    let result: Result<String, anyhow::Error> = with_retry(config, "test_op", || async {
        let count = counter.fetch_add(1, Ordering::SeqCst) + 1;
        if count < 3 {
            Err(anyhow::anyhow!("temporary error"))
        } else {
            Ok("success".to_string())
        }
    })
    .await;

    assert!(result.is_ok());
    assert_eq!(counter.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_retry_all_failures() {
    let counter = Arc::new(AtomicUsize::new(0));
    let config = RetryConfig::new(3, 10).without_jitter();

    let result: Result<String, anyhow::Error> = with_retry(config, "test_op", || async {
        counter.fetch_add(1, Ordering::SeqCst);
        Err(anyhow::anyhow!("permanent error"))
    })
    .await;

    assert!(result.is_err());
    assert_eq!(counter.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_retry_with_delay() {
    let counter = Arc::new(AtomicUsize::new(0));
    let config = RetryConfig::new(2, 50).without_jitter();

    let start = tokio::time::Instant::now();
    let _: Result<String, anyhow::Error> = with_retry(config, "test_op", || async {
        counter.fetch_add(1, Ordering::SeqCst);
        if counter.load(Ordering::SeqCst) < 3 {
            Err(anyhow::anyhow!("temp"))
        } else {
            Ok("done".to_string())
        }
    })
    .await;

    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(100));
}

#[tokio::test(start_paused = true)]
async fn test_retry_gives_up_with_context() {
    let config = RetryConfig::new(1, 10).without_jitter();

    let result: Result<(), anyhow::Error> = with_retry(config, "ledger write", || async {
        Err(anyhow::anyhow!("disk full"))
    })
    .await;

    let message = format!("{:#}", result.unwrap_err());
    assert!(message.contains("ledger write failed after 2 attempts"));
    assert!(message.contains("disk full"));
}

#[test]
fn test_failure_classification() {
    let cases = [
        ("Transaction simulation failed: Blockhash not found", FailureReason::BlockhashExpired),
        ("block height exceeded", FailureReason::BlockhashExpired),
        ("Attempt to debit an account but found no record of a prior credit", FailureReason::InsufficientFunds),
        ("HTTP status client error (429 Too Many Requests)", FailureReason::RateLimited),
        ("error sending request for url", FailureReason::EndpointUnavailable),
        ("operation timed out", FailureReason::EndpointUnavailable),
        ("InstructionError(2, Custom(6001))", FailureReason::OnChainFailure),
        ("sig123 not finalized", FailureReason::ConfirmationTimeout),
        ("Invalid address", FailureReason::Other),
    ];
    for (message, expected) in cases {
        assert_eq!(classify_failure(message), expected, "{}", message);
    }
}

#[test]
fn test_failure_classification_case_insensitive() {
    assert_eq!(classify_failure("TIMEOUT"), FailureReason::EndpointUnavailable);
    assert_eq!(
        classify_failure("COMPUTATIONAL BUDGET EXCEEDED"),
        FailureReason::ComputeBudgetExceeded
    );
}

#[test]
fn test_endpoint_faults_do_not_escalate() {
    assert!(FailureReason::RateLimited.is_endpoint_fault());
    assert!(FailureReason::EndpointUnavailable.is_endpoint_fault());
    assert!(!FailureReason::ComputeBudgetExceeded.is_endpoint_fault());

    let err = CoreError::chain("503 Service Unavailable");
    assert_eq!(err.failure_reason(), FailureReason::EndpointUnavailable);
    assert!(!err.is_fatal());
}
