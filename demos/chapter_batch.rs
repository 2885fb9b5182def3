//! Summarize a manuscript chapter by chapter, then run the batch again to
//! show every chapter coming back from the cache.
use std::time::Duration;

use presspool::config::{PoolSettings, ServiceConfig};
use presspool::{BatchOptions, Error, Hub, Result, Schedule};

#[derive(Debug, Clone)]
struct Summarizer {
    id: usize,
}

impl Summarizer {
    async fn summarize(&self, chapter: &str) -> Result<String> {
        tokio::time::sleep(Duration::from_millis(40 * chapter.len() as u64)).await;
        if chapter.is_empty() {
            return Err(Error::from_status(400, "chapter text is empty", None));
        }
        Ok(format!("{} words of '{chapter}' condensed by client {}", chapter.len() * 250, self.id))
    }
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let hub = Hub::builder(
        PoolSettings::new().with_service("text-generation", ServiceConfig::with_capacity(3)),
        |_: &str, _: &ServiceConfig, id: usize| -> Result<Summarizer> { Ok(Summarizer { id }) },
    )
    .build()?;

    let chapters: Vec<String> =
        ["Owls", "Nightjars", "", "Frogmouths", "Potoos", "Kiwi"].iter().map(|c| c.to_string()).collect();
    let options = BatchOptions::new("chapter-summary")
        .concurrency(3)
        .schedule(Schedule::SlidingWindow)
        .ttl(Duration::from_secs(600))
        .on_progress(|done, total| println!("progress {done}/{total}"));

    for run in ["cold", "warm"] {
        let results = hub
            .batch_on(
                "text-generation",
                chapters.clone(),
                |chapter: String, client: Summarizer| async move { client.summarize(&chapter).await },
                &options,
            )
            .await;
        println!("-- {run} run --");
        for result in &results {
            match &result.outcome {
                Ok(summary) if result.cached => println!("{:>12}: {summary} (cached)", result.item),
                Ok(summary) => println!("{:>12}: {summary}", result.item),
                Err(message) => println!("{:>12}: failed: {message}", result.item),
            }
        }
    }

    println!("{}", serde_json::to_string_pretty(&hub.stats())?);
    hub.shutdown();
    Ok(())
}
