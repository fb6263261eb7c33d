use call_dedupe::{CallOptions, DedupeConfig, Deduplicator};
use futures::future::join_all;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Serialize)]
struct Lookup {
    user_id: u32,
}

/// Stand-in for a slow remote API
async fn fetch_user(lookup: Lookup, calls: Arc<AtomicUsize>) -> Result<String, String> {
    calls.fetch_add(1, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(200)).await;
    Ok(format!("user-{}", lookup.user_id))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::init();

    let deduplicator = Deduplicator::<String, String>::new(DedupeConfig::new(1_000, 5_000, 50));
    let calls = Arc::new(AtomicUsize::new(0));

    // Example 1: Concurrent identical calls
    println!("=== Concurrent Calls ===");
    let start = std::time::Instant::now();
    let results = join_all((0..5).map(|_| {
        let calls = calls.clone();
        deduplicator.dedupe(
            move |lookup| fetch_user(lookup, calls),
            Lookup { user_id: 42 },
            CallOptions::new(),
        )
    }))
    .await;
    println!("5 concurrent calls took: {:?}", start.elapsed());
    println!("Upstream calls made: {}", calls.load(Ordering::SeqCst));
    for result in results {
        println!("  -> {}", result?);
    }

    // Example 2: Cached result
    println!("\n=== Cached Call ===");
    let start = std::time::Instant::now();
    let calls_for_cached = calls.clone();
    let cached = deduplicator
        .dedupe(
            move |lookup| fetch_user(lookup, calls_for_cached),
            Lookup { user_id: 42 },
            CallOptions::new(),
        )
        .await?;
    println!("Cached call took: {:?} ({})", start.elapsed(), cached);

    // Example 3: Forced call
    println!("\n=== Forced Call ===");
    let calls_for_forced = calls.clone();
    deduplicator
        .dedupe(
            move |lookup| fetch_user(lookup, calls_for_forced),
            Lookup { user_id: 42 },
            CallOptions::new().force_call(true),
        )
        .await?;
    println!("Upstream calls made: {}", calls.load(Ordering::SeqCst));

    println!("\nStats: {:?}", deduplicator.stats());
    deduplicator.clean();
    println!("Stats after clean: {:?}", deduplicator.stats());

    Ok(())
}
