use core_logic::{EndpointConfig, EndpointPool, EndpointRole};
use std::time::Duration;

fn pool() -> EndpointPool {
    EndpointPool::new(&EndpointConfig {
        primary: "https://primary.test".to_string(),
        alternatives: vec![
            "https://a.test".to_string(),
            "https://b.test".to_string(),
        ],
        failure_threshold: 3,
        cooldown_secs: 60,
    })
    .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_failed_endpoint_skipped_until_cooldown() {
    let pool = pool();
    let a = pool.next_endpoint(EndpointRole::Alternative);
    assert_eq!(a.url, "https://a.test");
    for _ in 0..3 {
        pool.report_outcome(&a, false);
    }

    for _ in 0..5 {
        assert_eq!(pool.next_endpoint(EndpointRole::Alternative).url, "https://b.test");
    }

    tokio::time::advance(Duration::from_secs(59)).await;
    for _ in 0..3 {
        assert_ne!(pool.next_endpoint(EndpointRole::Alternative).url, "https://a.test");
    }

    tokio::time::advance(Duration::from_secs(2)).await;
    let trials = (0..6)
        .map(|_| pool.next_endpoint(EndpointRole::Alternative))
        .filter(|e| e.url == "https://a.test")
        .count();
    // Half-open: exactly one caller gets the trial call.
    assert_eq!(trials, 1);

    pool.report_outcome(&a, true);
    let picks: Vec<String> = (0..4)
        .map(|_| pool.next_endpoint(EndpointRole::Alternative).url.clone())
        .collect();
    assert!(picks.iter().any(|u| u == "https://a.test"));
    assert!(picks.iter().any(|u| u == "https://b.test"));
}

#[tokio::test(start_paused = true)]
async fn test_failed_trial_restarts_cooldown() {
    let pool = pool();
    let a = pool.next_endpoint(EndpointRole::Alternative);
    for _ in 0..3 {
        pool.report_outcome(&a, false);
    }
    tokio::time::advance(Duration::from_secs(61)).await;

    let trial = (0..2)
        .map(|_| pool.next_endpoint(EndpointRole::Alternative))
        .find(|e| e.url == "https://a.test")
        .unwrap();
    pool.report_outcome(&trial, false);

    tokio::time::advance(Duration::from_secs(30)).await;
    for _ in 0..4 {
        assert_ne!(pool.next_endpoint(EndpointRole::Alternative).url, "https://a.test");
    }
}

#[tokio::test(start_paused = true)]
async fn test_unhealthy_primary_fails_over_for_submission() {
    let pool = pool();
    let primary = pool.primary();
    for _ in 0..3 {
        pool.report_outcome(&primary, false);
    }

    let picked = pool.next_endpoint(EndpointRole::Primary);
    assert_eq!(picked.role, EndpointRole::Alternative);
    for _ in 0..4 {
        assert_eq!(
            pool.next_endpoint(EndpointRole::Alternative).role,
            EndpointRole::Alternative
        );
    }
}

#[tokio::test(start_paused = true)]
async fn test_everything_down_still_yields_primary() {
    let pool = pool();
    let endpoints = [
        pool.primary(),
        pool.next_endpoint(EndpointRole::Alternative),
        pool.next_endpoint(EndpointRole::Alternative),
    ];
    for endpoint in &endpoints {
        for _ in 0..3 {
            pool.report_outcome(endpoint, false);
        }
    }

    assert_eq!(pool.healthy_count(), 0);
    assert_eq!(
        pool.next_endpoint(EndpointRole::Alternative).url,
        "https://primary.test"
    );
    assert_eq!(
        pool.next_endpoint(EndpointRole::Primary).url,
        "https://primary.test"
    );
}
