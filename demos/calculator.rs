//! Calculator - export a service and call it through an imported proxy.
//!
//! This example demonstrates:
//! - Building a service table with `ServiceBuilder`
//! - Exporting it on a TCP listener and importing it from a second transport
//! - Plain calls, promise-returning calls and async arguments
//! - How an application failure reaches the caller
//!
//! # Running
//!
//! ```text
//! RUST_LOG=remotewire=debug cargo run --example calculator
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use remotewire::codec::MsgPackSerializer;
use remotewire::endpoint::{PropertyValue, REMOTE_TIMEOUT};
use remotewire::{Promise, RemoteError, ServiceBuilder, ServiceError, TransportBuilder};
use tracing_subscriber::EnvFilter;

struct Calculator;

fn gcd(a: i64, b: i64) -> i64 {
    if b == 0 {
        a.abs()
    } else {
        gcd(b, a % b)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let server = TransportBuilder::new().listen("tcp://127.0.0.1:0").start().await?;
    let definition = ServiceBuilder::new(Calculator, MsgPackSerializer)
        .interface("example.Calculator")
        .method("add(long,long)", |_: &Calculator, (a, b): (i64, i64)| Ok(a + b))
        .method("divide(long,long)", |_: &Calculator, (a, b): (i64, i64)| {
            if b == 0 {
                return Err(ServiceError::with_kind("arithmetic", "division by zero"));
            }
            Ok(a / b)
        })
        .async_method(
            "coprime(long,long,Promise)",
            |_: &Calculator, (a, b, strict): (i64, i64, Promise<bool>)| async move {
                let strict = strict.await.map_err(ServiceError::from)?;
                let coprime = gcd(a, b) == 1;
                if strict && !coprime {
                    return Err(ServiceError::with_kind(
                        "illegal_argument",
                        format!("{} and {} are not coprime", a, b),
                    ));
                }
                Ok(coprime)
            },
        )
        .build();

    let properties = BTreeMap::from([(REMOTE_TIMEOUT.to_string(), PropertyValue::from(2_000i64))]);
    let export = server.export(definition, properties)?;
    let endpoint = export.endpoint().ok_or("export closed")?;
    println!("exported endpoint: {}", endpoint.to_json()?);

    let client = TransportBuilder::new().start().await?;
    let import = client.import(endpoint, MsgPackSerializer).await;
    let proxy = import.proxy().ok_or_else(|| format!("import failed: {:?}", import.error()))?;

    let sum: i64 = proxy.call("add", (40i64, 2i64)).await?;
    println!("add(40, 2) = {}", sum);

    let quotient = proxy.call_promise::<_, i64>("divide", (84i64, 2i64));
    println!("divide(84, 2) = {}", quotient.await?);

    match proxy.call::<_, i64>("divide", (1i64, 0i64)).await {
        Err(RemoteError::Failure(error)) => println!("divide(1, 0) failed remotely: {}", error),
        other => println!("divide(1, 0) = {:?}", other),
    }

    // The flag is decided after the call was sent; it follows as a separate frame.
    let (strict, resolver) = Promise::pending();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        resolver.resolve(true);
    });
    match proxy.call::<_, bool>("coprime", (7i64, 42i64, strict)).await {
        Ok(coprime) => println!("coprime(7, 42) = {}", coprime),
        Err(e) => println!("coprime(7, 42) failed: {}", e),
    }

    let coprime: bool = proxy
        .call("coprime", (7i64, 40i64, Promise::resolved(true)))
        .await?;
    println!("coprime(7, 40) = {}", coprime);

    client.shutdown().await;
    server.shutdown().await;
    Ok(())
}
