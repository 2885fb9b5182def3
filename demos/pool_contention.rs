//! Ten writers share a text-generation pool of five clients.
//!
//! Logs at debug level so hand-offs between waiters are visible.
use std::sync::Arc;
use std::time::Duration;

use presspool::config::{PoolSettings, ServiceConfig};
use presspool::{Hub, Result};

#[derive(Debug, Clone)]
struct FakeModelClient {
    id: usize,
}

impl FakeModelClient {
    async fn complete(&self, prompt: &str) -> String {
        tokio::time::sleep(Duration::from_millis(150)).await;
        format!("[client {}] draft for '{prompt}'", self.id)
    }
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_max_level(tracing::Level::DEBUG).init();

    let hub = Arc::new(
        Hub::builder(
            PoolSettings::publishing_defaults(),
            |_: &str, _: &ServiceConfig, id: usize| -> Result<FakeModelClient> { Ok(FakeModelClient { id }) },
        )
        .build()?,
    );

    let writers: Vec<_> = (0..10)
        .map(|n| {
            let hub = hub.clone();
            tokio::spawn(async move {
                let conn = hub.acquire("text-generation").await?;
                let draft = conn.complete(&format!("chapter {n}")).await;
                println!("{draft}");
                Ok::<_, presspool::Error>(())
            })
        })
        .collect();

    tokio::time::sleep(Duration::from_millis(20)).await;
    let stats = hub.stats().pools[0].clone();
    println!("while busy: active={} waiting={} capacity={}", stats.active, stats.waiting, stats.capacity);

    for writer in writers {
        writer.await??;
    }
    println!("{}", serde_json::to_string_pretty(&hub.stats().pools)?);
    hub.shutdown();
    Ok(())
}
