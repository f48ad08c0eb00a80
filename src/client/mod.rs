//! Client side of the protocol: outbound calls and their correlation.
//!
//! Provides:
//! - [`Correlator`] - call id → pending handle table of one connection
//! - [`ServiceProxy`] - typed calls against an imported endpoint
//! - [`CallArgs`] / [`ClientParam`] - argument encoding, including the
//!   async-argument fast path
//! - [`RemoteStream`] - consumer of a streaming return

mod args;
mod correlation;
mod proxy;
mod stream;

pub use args::{CallArgs, ClientParam, FollowUp};
pub use correlation::{remote_error, Correlator, Reply, StreamEvent};
pub use proxy::ServiceProxy;
pub use stream::RemoteStream;
