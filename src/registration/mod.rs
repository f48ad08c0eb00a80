//! Registration lifecycle - exports and imports.
//!
//! Both sides share the [`RegistrationState`] machine. Every transition
//! happens under the registration's own lock and is reported to a
//! [`RegistrationSink`]. Closing is idempotent.

mod export;
mod import;
mod sink;
mod state;

pub use export::ExportRegistration;
pub use import::ImportRegistration;
pub use sink::{ChannelSink, EventKind, NoopSink, RegistrationEvent, RegistrationSink, SharedSink};
pub use state::RegistrationState;
