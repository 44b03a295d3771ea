//! Simulated scroll through a page of chunks.
//!
//! Chunks enter and leave the viewport, one section fails twice before
//! loading, and the cache snapshot is restored on a second "visit".

use chunkcull::persistence::FileSnapshotStore;
use chunkcull::testing::{ManualIntersection, RecordingListener, Script, ScriptedResolver};
use chunkcull::visibility::ElementRef;
use chunkcull::{ChunkCull, ChunkCullConfig, ErrorHandlingOptions};
use std::sync::Arc;
use std::time::Duration;

const SECTIONS: [&str; 6] = ["hero", "features", "gallery", "pricing", "faq", "footer"];

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    chunkcull::logging::init();

    let dir = tempfile::tempdir()?;
    let config = ChunkCullConfig::new()
        .with_max_size(4)
        .with_error_handling(ErrorHandlingOptions {
            max_retries: 3,
            retry_delay: Duration::from_millis(300),
            timeout: Duration::from_secs(2),
        });

    println!("--- First visit ---");
    let store = Arc::new(FileSnapshotStore::open(dir.path())?);
    let primitive = Arc::new(ManualIntersection::new());
    let cull = ChunkCull::start(config.clone(), store)
        .await?
        .with_intersection(primitive.clone());

    let resolver = Arc::new(ScriptedResolver::new().with_latency(Duration::from_millis(50)));
    resolver.fail_times("gallery", 2, "image service unavailable");
    resolver.push(
        "pricing",
        Script::Synthetic {
            content: "<p>prices unavailable</p>".into(),
            message: "served placeholder pricing".into(),
        },
    );
    let listener = Arc::new(RecordingListener::new());

    let _subscription = cull.cache().subscribe(|status| {
        println!("  cache: {}/{} {:?}", status.size, status.max_size, status.keys);
        Ok(())
    });

    let chunks: Vec<_> = SECTIONS
        .iter()
        .map(|id| {
            cull.mount_chunk(
                *id,
                Some(ElementRef::new(*id)),
                resolver.clone(),
                listener.clone(),
            )
        })
        .collect();

    // Scroll down one section at a time.
    for id in SECTIONS {
        let el = ElementRef::new(id);
        primitive.enter(&el);
        tokio::time::sleep(Duration::from_millis(900)).await;
        primitive.exit(&el);
        tokio::time::sleep(Duration::from_millis(300)).await;
    }

    println!("\nEvents:");
    for event in listener.events() {
        println!("  {:?}", event);
    }

    // Narrow viewport: sensors switch to a smaller margin after the debounce.
    cull.viewport_resized(375);
    tokio::time::sleep(Duration::from_millis(1100)).await;
    if let Some(sensor) = chunks[0].sensor() {
        println!("\nMargin after resize: {}px", sensor.current_margin());
    }

    let stats = cull.stats();
    println!("\nCache stats:");
    println!("  Entries: {}", stats.entry_count);
    println!("  Estimated bytes: {}", stats.estimated_bytes);
    println!("  Hits: {}", stats.hits);
    println!("  Misses: {}", stats.misses);
    println!("  Evicted (capacity): {}", stats.evicted_capacity);

    drop(chunks);
    cull.shutdown().await;

    println!("\n--- Second visit ---");
    let store = Arc::new(FileSnapshotStore::open(dir.path())?);
    let cull = ChunkCull::start(config, store).await?;
    println!("Restored keys: {:?}", cull.cache().keys());
    cull.shutdown().await;

    Ok(())
}
