//! Fan-out of each number into five pairs through capacity-1 mailboxes
//!
//! Pipeline:
//! 1. Multiplier: n -> (n, 1) .. (n, 5), produced lazily
//! 2. Printer: prints every pair
//!
//! With capacity 1 the multiplier can only run one pair ahead of the printer.
//!
//! Usage: cargo run --example multiplier
//!        RUST_LOG=stream_dataflow=trace cargo run --example multiplier

use stream_dataflow::{FnSink, IterFanOut, PipelineBuilder};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy)]
struct TwoNumbers {
    first: u32,
    second: u32,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let running = PipelineBuilder::new()
        .with_name("multiplier")
        .with_default_capacity(1)
        .fan_out(IterFanOut::new("multiplier", |number: u32| {
            (1..=5).map(move |n| TwoNumbers {
                first: number,
                second: n,
            })
        }))?
        .sink(FnSink::new("printer", |numbers: TwoNumbers| async move {
            println!("{numbers:?}");
            Ok(())
        }))?
        .start()?;

    for n in 1..=5 {
        running.submit(n).await?;
    }
    running.complete();

    println!("\n{}", running.metrics_summary());
    running.await_completion().await?;
    Ok(())
}
