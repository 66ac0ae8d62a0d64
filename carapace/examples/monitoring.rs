//! Example demonstrating connection monitoring.
//!
//! This example shows how to:
//! - Connect to a pool of brokers
//! - Receive lifecycle events while the client fails over
//! - Keep publishing through a reconnect
//!
//! Run with a broker on localhost (stop and restart it to see the events):
//! ```bash
//! NATS_URL=nats://127.0.0.1:4222 cargo run --example monitoring
//! ```

use carapace::nats::prelude::*;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let options = ConnectOptions::from_env()?
        .with_name("monitoring-demo")
        .with_max_reconnect_attempts(None);
    let client = Client::connect_with_options(options).await?;
    let monitor = client.monitor();

    let _monitor_task = tokio::spawn(async move {
        while let Ok(event) = monitor.recv_async().await {
            match event {
                ConnectionEvent::Closed { .. } => {
                    println!("{event}");
                    break;
                }
                other => println!("{other}"),
            }
        }
    });

    for i in 0..30u32 {
        // Buffered while reconnecting, sent once a link is back.
        if let Err(e) = client.publish("demo.tick", i.to_string()) {
            println!("publish {i} failed: {e}");
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    client.drain().await?;
    Ok(())
}
