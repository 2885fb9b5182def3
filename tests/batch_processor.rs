use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use presspool::{BatchOptions, BatchProcessor, CacheStore, Error, Schedule};
use tokio::time::sleep;

fn summarize(chapter: &'static str) -> impl std::future::Future<Output = Result<String, Error>> {
    async move {
        let pause = if chapter == "b" { 50 } else { 5 };
        sleep(Duration::from_millis(pause)).await;
        Ok(format!("summary of {chapter}"))
    }
}

#[tokio::test(start_paused = true)]
async fn slow_item_keeps_its_slot() {
    for schedule in [Schedule::Waves, Schedule::SlidingWindow] {
        let processor = BatchProcessor::new(CacheStore::in_memory());
        let options = BatchOptions::new("summaries").concurrency(2).schedule(schedule);

        let results = processor.process(vec!["a", "b", "c"], summarize, &options).await;

        let items: Vec<_> = results.iter().map(|r| r.item).collect();
        assert_eq!(items, vec!["a", "b", "c"], "{schedule:?}");
        assert_eq!(results[1].result().map(String::as_str), Some("summary of b"));
    }
}

#[tokio::test]
async fn one_bad_chapter_does_not_sink_the_book() {
    let processor = BatchProcessor::new(CacheStore::in_memory());
    let options = BatchOptions::new("chapters").concurrency(3);

    let results = processor
        .process(
            vec![1u32, 2, 3, 4],
            |n| async move {
                if n == 3 {
                    Err(Error::from_status(400, "prompt too long", None))
                } else {
                    Ok(n * 10)
                }
            },
            &options,
        )
        .await;

    assert_eq!(results.len(), 4);
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 3);
    assert!(results[2].error().unwrap().contains("prompt too long"));
    assert_eq!(results[3].result(), Some(&40));
}

#[tokio::test]
async fn second_run_is_served_from_cache() {
    let processor = BatchProcessor::new(CacheStore::in_memory());
    let options = BatchOptions::new("outlines").ttl(Duration::from_secs(60));
    let calls = Arc::new(AtomicUsize::new(0));

    let work = {
        let calls = calls.clone();
        move |title: String| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, Error>(title.to_uppercase())
            }
        }
    };

    let titles = vec!["owls".to_string(), "wrens".to_string()];
    let first = processor.process(titles.clone(), &work, &options).await;
    assert!(first.iter().all(|r| !r.cached));

    let second = processor.process(titles, &work, &options).await;
    assert!(second.iter().all(|r| r.cached));
    assert_eq!(second[1].result().map(String::as_str), Some("WRENS"));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn progress_reaches_total() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let options = BatchOptions::new("progress")
        .concurrency(2)
        .schedule(Schedule::SlidingWindow)
        .on_progress(move |done, total| sink.lock().unwrap().push((done, total)));

    let processor = BatchProcessor::new(CacheStore::in_memory());
    processor.process((0..7u8).collect::<Vec<_>>(), |n| async move { Ok::<_, Error>(n) }, &options).await;

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 7);
    assert_eq!(seen.last(), Some(&(7, 7)));
    assert!(seen.windows(2).all(|w| w[0].0 < w[1].0));
}

#[tokio::test]
async fn empty_batch_returns_empty() {
    let processor = BatchProcessor::new(CacheStore::in_memory());
    let results = processor
        .process(Vec::<u8>::new(), |n| async move { Ok::<_, Error>(n) }, &BatchOptions::new("empty"))
        .await;
    assert!(results.is_empty());
}
