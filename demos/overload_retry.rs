//! An upstream that answers "529 Overloaded" twice before succeeding.
//!
//! Uses short delays so the run finishes quickly; production code would
//! keep the default 1s doubling schedule.
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use presspool::config::{PoolSettings, ServiceConfig};
use presspool::{Backoff, Error, Hub, Jitter, Result, RetryPolicy};

#[derive(Debug, Clone, Default)]
struct FlakyModel {
    calls: Arc<AtomicUsize>,
}

impl FlakyModel {
    async fn generate(&self, prompt: &str) -> Result<String> {
        match self.calls.fetch_add(1, Ordering::SeqCst) {
            0 | 1 => Err(Error::from_status(529, "Overloaded", None)),
            _ => Ok(format!("cover art brief for '{prompt}'")),
        }
    }
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let model = FlakyModel::default();
    let retry = RetryPolicy::builder()
        .max_attempts(4)
        .backoff(Backoff::exponential(Duration::from_millis(100)).with_max(Duration::from_secs(2))?)
        .with_jitter(Jitter::proportional(0.3))
        .build()?;
    let hub = Hub::builder(PoolSettings::publishing_defaults(), {
        let model = model.clone();
        move |_: &str, _: &ServiceConfig, _: usize| -> Result<FlakyModel> { Ok(model.clone()) }
    })
    .retry(retry)
    .build()?;

    let conn = hub.acquire("image-generation").await?;
    let brief = hub.call_with_retry("image-generation", || conn.generate("Night Birds")).await?;
    println!("{brief} (after {} calls)", model.calls.load(Ordering::SeqCst));
    drop(conn);

    let stubborn = hub
        .call_with_retry("image-generation", || async {
            Err::<(), _>(Error::from_message("rate limit exceeded"))
        })
        .await
        .unwrap_err();
    println!("gave up: {stubborn}");

    hub.shutdown();
    Ok(())
}
