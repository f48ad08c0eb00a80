//! Transport module - stream sockets addressed by URI.
//!
//! Provides abstraction over:
//! - TCP sockets (`tcp://host:port`)
//! - Unix Domain Sockets (`unix:///path`)

mod socket;

pub use socket::{connect, Accepted, BoxReader, BoxWriter, Listener, TransportUri};
