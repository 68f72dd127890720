//! Notify the subscribers of several topics, one page of subscribers at a time
//!
//! Pipeline:
//! 1. Subscribers: topic -> pages of subscriber ids from a simulated database
//! 2. Notifier: "sends" a notification to every id of a page, slowly
//!
//! The database is only asked for the next page once the notifier has
//! accepted the previous one.
//!
//! Usage: cargo run --example subscribers [seed]

use std::time::Duration;
use stream_dataflow::{Batch, FnSink, PaginatedFanOut, PipelineBuilder, SimulatedSource};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let seed = match std::env::args().nth(1) {
        Some(arg) => arg.parse()?,
        None => rand::random(),
    };
    info!(seed, "simulating subscriber database");

    let running = PipelineBuilder::new()
        .with_name("subscribers")
        .with_default_capacity(1)
        .fan_out(PaginatedFanOut::new(
            "subscribers",
            SimulatedSource::seeded(seed).with_delay(Duration::from_millis(500)),
        ))?
        .sink(FnSink::new("notifier", |batch: Batch<u32>| async move {
            tokio::time::sleep(Duration::from_millis(250)).await;
            println!(
                "Notified {} subscribers of {}: {:?}",
                batch.ids.len(),
                batch.key,
                batch.ids
            );
            Ok(())
        }))?
        .start()?;

    for topic in ["Gaming", "Furniture", "Smartphones", "Furniture"] {
        running.submit(topic.to_string()).await?;
    }
    running.complete();

    running.await_completion().await?;
    Ok(())
}
