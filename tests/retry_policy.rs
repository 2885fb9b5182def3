use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use presspool::config::RetrySettings;
use presspool::telemetry::{Event, EventBus, MemorySink, RetryEvent};
use presspool::{Backoff, Error, Jitter, RecordingSleeper, RetryError, RetryPolicy};

fn overloaded() -> Error {
    Error::from_status(529, "Overloaded", None)
}

#[tokio::test]
async fn default_schedule_doubles_from_one_second() {
    let sleeper = RecordingSleeper::new();
    let policy = RetryPolicy::<Error>::builder()
        .with_jitter(Jitter::None)
        .with_sleeper(sleeper.clone())
        .build()
        .unwrap();

    let err = policy.execute(|| async { Err::<(), _>(overloaded()) }).await.unwrap_err();

    assert_eq!(err.attempts(), 5);
    let secs: Vec<u64> = sleeper.delays().iter().map(Duration::as_secs).collect();
    assert_eq!(secs, vec![1, 2, 4, 8]);
    assert_eq!(sleeper.total(), Duration::from_secs(15));
}

#[tokio::test]
async fn message_vocabulary_is_retried() {
    let sleeper = RecordingSleeper::new();
    let policy = RetryPolicy::<Error>::builder()
        .max_attempts(3)
        .with_sleeper(sleeper.clone())
        .build()
        .unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();

    let result = policy
        .execute(|| {
            let counter = counter.clone();
            async move {
                match counter.fetch_add(1, Ordering::SeqCst) {
                    0 => Err(Error::from_message("Service temporarily unavailable")),
                    1 => Err(Error::from_message("connection timed out")),
                    _ => Ok("outline"),
                }
            }
        })
        .await;

    assert_eq!(result.unwrap(), "outline");
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(sleeper.delays().len(), 2);
}

#[tokio::test]
async fn auth_failures_are_not_retried() {
    let policy = RetryPolicy::<Error>::builder().with_sleeper(RecordingSleeper::new()).build().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();

    let err = policy
        .execute(|| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(Error::from_status(401, "invalid x-api-key", None))
            }
        })
        .await
        .unwrap_err();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    match err {
        RetryError::Aborted { attempts, error } => {
            assert_eq!(attempts, 1);
            assert_eq!(error.status(), Some(401));
        }
        other => panic!("expected abort, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn real_sleeps_follow_backoff_in_virtual_time() {
    let policy = RetryPolicy::<Error>::builder()
        .max_attempts(4)
        .backoff(Backoff::exponential(Duration::from_millis(100)))
        .with_jitter(Jitter::None)
        .build()
        .unwrap();

    let started = tokio::time::Instant::now();
    let _ = policy.execute(|| async { Err::<(), _>(overloaded()) }).await;
    // 100 + 200 + 400 ms between four attempts.
    assert_eq!(started.elapsed(), Duration::from_millis(700));
}

#[tokio::test]
async fn retry_events_reach_the_sink() {
    let sink = MemorySink::new();
    let policy = RetryPolicy::<Error>::from_settings(&RetrySettings {
        max_attempts: 3,
        base_delay_ms: 1,
        max_delay_ms: 1,
        jitter_factor: 0.0,
    })
    .unwrap()
    .with_events(EventBus::spawn(sink.clone(), 16));

    let _ = policy.execute(|| async { Err::<(), _>(overloaded()) }).await;
    for _ in 0..50 {
        if sink.len() == 3 {
            break;
        }
        tokio::task::yield_now().await;
    }

    let events = sink.events();
    let attempts = events.iter().filter(|e| matches!(e, Event::Retry(RetryEvent::Attempt { .. }))).count();
    assert_eq!(attempts, 2);
    assert!(matches!(
        events.last(),
        Some(Event::Retry(RetryEvent::Exhausted { total_attempts: 3, .. }))
    ));
}
