use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::*;

#[derive(Debug)]
enum TestError {
    Throttled,
    Fatal,
}

impl Display for TestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TestError::Throttled => f.write_str("throttled"),
            TestError::Fatal => f.write_str("fatal"),
        }
    }
}

impl Retryable for TestError {
    fn is_retryable(&self) -> bool {
        matches!(self, TestError::Throttled)
    }
}

fn fast_policy(max_attempts: usize) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        min_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        jitter: false,
    }
}

#[test]
fn test_default_policy() {
    let policy = RetryPolicy::default();
    assert_eq!(policy.max_attempts, 10);
    assert_eq!(policy.min_delay, Duration::from_millis(100));
    assert_eq!(policy.max_delay, Duration::from_secs(20));
    assert!(policy.jitter);
}

#[test]
fn test_backoff_yields_one_delay_per_retry() {
    let delays: Vec<_> = fast_policy(4).backoff().build().collect();
    assert_eq!(delays.len(), 3);
    assert!(delays.iter().all(|d| *d <= Duration::from_millis(5)));
}

#[tokio::test(start_paused = true)]
async fn test_retries_until_success() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();

    let result: Result<&str, TestError> = fast_policy(5)
        .run("DescribeServices", || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(TestError::Throttled)
                } else {
                    Ok("ok")
                }
            }
        })
        .await;

    assert_eq!(result.unwrap(), "ok");
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn test_gives_up_after_max_attempts() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();

    let result: Result<(), TestError> = fast_policy(3)
        .run("UpdateService", || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(TestError::Throttled)
            }
        })
        .await;

    assert!(matches!(result, Err(TestError::Throttled)));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_fatal_error_not_retried() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();

    let result: Result<(), TestError> = fast_policy(10)
        .run("RegisterTaskDefinition", || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(TestError::Fatal)
            }
        })
        .await;

    assert!(matches!(result, Err(TestError::Fatal)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_none_policy_single_attempt() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();

    let _: Result<(), TestError> = RetryPolicy::none()
        .run("ListTasks", || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(TestError::Throttled)
            }
        })
        .await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
