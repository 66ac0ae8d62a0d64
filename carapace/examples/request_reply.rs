//! Request/reply with a handler-mode responder.
//!
//! ```bash
//! cargo run --example request_reply
//! ```

use carapace::nats::prelude::*;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    carapace::dev_tracing::init_tracing();

    let options = ConnectOptions::from_env()?;
    let service = Client::connect_with_options(options.clone()).await?;
    let responder = service.clone();
    let _svc = service.subscribe_with_handler(
        "math.double",
        SubscribeOptions::queue("math"),
        move |msg| {
            let responder = responder.clone();
            async move {
                let Some(reply) = msg.reply.as_deref() else { return };
                let answer = msg
                    .text()
                    .trim()
                    .parse::<i64>()
                    .map(|n| (n * 2).to_string())
                    .unwrap_or_else(|_| "NaN".to_string());
                let _ = responder.publish(reply, answer);
            }
        },
    )?;
    service.flush().await?;

    let client = Client::connect_with_options(options).await?;
    for n in [1, 21, 512] {
        let reply = client
            .request_timeout("math.double", n.to_string(), Duration::from_secs(1))
            .await?;
        println!("{n} * 2 = {}", reply.text());
    }

    match client.request_timeout("math.nobody", "x", Duration::from_secs(1)).await {
        Err(Error::NoResponders) => println!("no responders for math.nobody"),
        other => println!("unexpected: {other:?}"),
    }

    client.drain().await?;
    service.drain().await?;
    Ok(())
}
