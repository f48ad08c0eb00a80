//! Stream - a method returning a push stream consumed under back pressure.
//!
//! This example demonstrates:
//! - Registering a streaming method with `stream_method`
//! - Consuming it with `call_stream` as a `futures::Stream`
//! - Stopping an endless stream early with `cancel`
//!
//! # Running
//!
//! ```text
//! RUST_LOG=remotewire=trace cargo run --example stream
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use futures::StreamExt;
use remotewire::codec::MsgPackSerializer;
use remotewire::{ServiceBuilder, StreamConfig, TransportBuilder};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

/// Element pushed by the generator.
#[derive(Serialize, Deserialize, Debug, Clone)]
struct Chunk {
    index: u32,
    data: String,
}

struct Generator;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let stream_config = StreamConfig {
        initial_credit: 4,
        credit_batch: 2,
        ..StreamConfig::default()
    };

    let server = TransportBuilder::new()
        .listen("tcp://127.0.0.1:0")
        .stream_config(stream_config.clone())
        .start()
        .await?;
    let definition = ServiceBuilder::new(Generator, MsgPackSerializer)
        .interface("example.Generator")
        .stream_method("generate(int)", |_: &Generator, (count,): (u32,)| {
            Ok(futures::stream::iter((0..count).map(|index| {
                Ok(Chunk {
                    index,
                    data: format!("Chunk {}", index),
                })
            })))
        })
        .stream_method("ticker()", |_: &Generator, (): ()| {
            Ok(futures::stream::unfold(0u64, |n| async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Some((Ok(n), n + 1))
            }))
        })
        .build();
    let export = server.export(definition, BTreeMap::new())?;

    let client = TransportBuilder::new().stream_config(stream_config).start().await?;
    let import = client
        .import(export.endpoint().ok_or("export closed")?, MsgPackSerializer)
        .await;
    let proxy = import.proxy().ok_or_else(|| format!("import failed: {:?}", import.error()))?;

    let mut chunks = proxy.call_stream::<_, Chunk>("generate", (5u32,)).await?;
    while let Some(chunk) = chunks.next().await {
        println!("received {:?}", chunk?);
    }

    let mut ticks = proxy.call_stream::<_, u64>("ticker", ()).await?;
    while let Some(tick) = ticks.next().await {
        let tick = tick?;
        println!("tick {}", tick);
        if tick == 9 {
            ticks.cancel().await?;
        }
    }
    println!("ticker stopped");

    client.shutdown().await;
    server.shutdown().await;
    Ok(())
}
