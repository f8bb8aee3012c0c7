//! Shared counter demo
//!
//! Two handles on the same JSON file share one cell. Run twice to see the
//! count persist:
//!
//! ```text
//! RUST_LOG=sharing=debug cargo run --bin sharing_demo -- /tmp/counter.json
//! ```

use sharing::keys::FileStorageKey;
use sharing::{Shared, SharedObservable, SharedReader};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| std::env::temp_dir().join("sharing_demo_counter.json").display().to_string());

    let counter = Shared::new(FileStorageKey::<u64>::new(&path), 0);
    let reader: SharedReader<u64> = SharedReader::new(FileStorageKey::<u64>::new(&path), 1000);
    info!(%counter, value = counter.get(), reader = reader.get(), "started");

    let _subscription = reader.observe(|count| info!(count, "reader observed"));

    for _ in 0..3 {
        counter.with_lock(|count| *count += 1);
    }
    counter.save().await?;
    info!(value = counter.get(), %path, "saved");

    counter.load().await?;
    let equal = counter == reader;
    info!(value = counter.get(), equal, "reloaded");
    Ok(())
}
