//! # remotewire
//!
//! Binary RPC transport: export local services to remote peers and import
//! remote services as local proxies, over multiplexed stream connections.
//!
//! ## Architecture
//!
//! - **Wire** ([`protocol`]): 25-byte header (version, length, command,
//!   service id, call id) followed by a command-specific payload
//! - **Server** ([`invoker`]): per-service invokers decode calls, run them on
//!   a bounded worker pool and adapt each method's return shape to response
//!   frames
//! - **Client** ([`client`]): proxies encode calls, correlate responses by
//!   call id and consume push-streams under credit-based back pressure
//! - **Lifecycle** ([`registration`], [`provider`]): exports and imports
//!   with an explicit state machine, endpoint descriptions and pooled
//!   connections
//!
//! ## Example
//!
//! ```no_run
//! use std::collections::BTreeMap;
//!
//! use remotewire::codec::MsgPackSerializer;
//! use remotewire::handler::ServiceBuilder;
//! use remotewire::TransportBuilder;
//!
//! struct Phrase(String);
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = TransportBuilder::new().listen("tcp://127.0.0.1:0").start().await?;
//!     let export = server.export(
//!         ServiceBuilder::new(Phrase("hello".into()), MsgPackSerializer)
//!             .interface("example.Phrase")
//!             .method("length()", |p: &Phrase, (): ()| Ok(p.0.len() as i64))
//!             .build(),
//!         BTreeMap::new(),
//!     )?;
//!
//!     let client = TransportBuilder::new().start().await?;
//!     let import = client.import(export.endpoint().unwrap(), MsgPackSerializer).await;
//!     let length: i64 = import.proxy().unwrap().call("length()", ()).await?;
//!     assert_eq!(length, 5);
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod endpoint;
pub mod error;
pub mod handler;
pub mod invoker;
pub mod promise;
pub mod protocol;
pub mod provider;
pub mod registration;
pub mod transport;
pub mod writer;

mod backpressure;

pub use client::{RemoteStream, ServiceProxy};
pub use config::{StreamConfig, TransportConfig};
pub use endpoint::{EndpointDescription, PropertyValue};
pub use error::{Error, RemoteError, Result, ServiceError};
pub use handler::{ServiceBuilder, ServiceDefinition};
pub use promise::{Deferred, Promise, Resolver};
pub use provider::{RemoteTransport, TransportBuilder};
pub use registration::{ExportRegistration, ImportRegistration, RegistrationState};
