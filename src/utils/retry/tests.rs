use super::*;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[test]
fn test_linear_delays() {
    let delays: Vec<Duration> = LinearBuilder::default()
        .with_delay(Duration::from_millis(100))
        .with_max_times(3)
        .build()
        .collect();

    assert_eq!(
        delays,
        vec![
            Duration::from_millis(100),
            Duration::from_millis(200),
            Duration::from_millis(300),
        ]
    );
}

#[test]
fn test_zero_retries_yields_no_delays() {
    let mut backoff = LinearBuilder::default().with_max_times(0).build();
    assert!(backoff.next().is_none());
}

#[test]
fn test_client_backoff_follows_config() {
    let config = RpcClientConfig {
        max_retries: 2,
        retry_delay_ms: 50,
        ..RpcClientConfig::default()
    };
    let delays: Vec<Duration> = client_backoff(&config).build().collect();
    assert_eq!(
        delays,
        vec![Duration::from_millis(50), Duration::from_millis(100)]
    );
}

#[tokio::test]
async fn test_always_failing_runs_k_plus_one_times() {
    let calls = Arc::new(AtomicU32::new(0));
    let backoff = LinearBuilder::default()
        .with_delay(Duration::from_millis(1))
        .with_max_times(3);

    let counter = calls.clone();
    let result: std::result::Result<(), RetryError<String>> =
        retry_with_backoff("test", backoff, &CancellationToken::new(), || {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                Err(format!("failure {}", n))
            }
        })
        .await;

    assert_eq!(calls.load(Ordering::SeqCst), 4);
    match result {
        Err(RetryError::Exhausted { attempts, last }) => {
            assert_eq!(attempts, 4);
            assert_eq!(last, "failure 4");
        }
        other => panic!("Expected exhausted error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_success_after_failures_stops_retrying() {
    let calls = Arc::new(AtomicU32::new(0));
    let backoff = LinearBuilder::default()
        .with_delay(Duration::from_millis(1))
        .with_max_times(5);

    let counter = calls.clone();
    let result = retry_with_backoff("test", backoff, &CancellationToken::new(), || {
        let counter = counter.clone();
        async move {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err("not yet")
            } else {
                Ok(7)
            }
        }
    })
    .await;

    assert_eq!(result.unwrap(), 7);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_cancel_during_backoff_returns_promptly() {
    let cancel = CancellationToken::new();
    let backoff = LinearBuilder::default()
        .with_delay(Duration::from_secs(30))
        .with_max_times(3);

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let result: std::result::Result<(), RetryError<&str>> =
        retry_with_backoff("test", backoff, &cancel, || async { Err("down") }).await;

    assert!(started.elapsed() < Duration::from_secs(5));
    match result {
        Err(RetryError::Cancelled { attempts, last }) => {
            assert_eq!(attempts, 1);
            assert_eq!(last, "down");
        }
        other => panic!("Expected cancellation, got {:?}", other),
    }
}
