//! Where registrations report their transitions.
//!
//! The core does not dispatch to listeners itself; it hands every
//! transition to a [`RegistrationSink`]. [`ChannelSink`] forwards events
//! over a tokio channel, [`NoopSink`] drops them.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::trace;
use uuid::Uuid;

use crate::endpoint::EndpointDescription;

/// Kind of transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A service was exported.
    ExportRegistration,
    /// An export's properties changed.
    ExportUpdate,
    /// An export failed.
    ExportError,
    /// An export was closed.
    ExportUnregistration,
    /// A remote service was imported.
    ImportRegistration,
    /// An import failed.
    ImportError,
    /// An import was closed.
    ImportUnregistration,
}

/// One transition: `(kind, service, endpoint, cause)`.
#[derive(Debug, Clone)]
pub struct RegistrationEvent {
    /// What happened.
    pub kind: EventKind,
    /// Service id, when known.
    pub service_id: Option<Uuid>,
    /// Endpoint at the time of the event.
    pub endpoint: Option<EndpointDescription>,
    /// Failure cause for error events.
    pub cause: Option<String>,
}

impl RegistrationEvent {
    /// Event without a cause.
    pub fn new(kind: EventKind, service_id: Option<Uuid>, endpoint: Option<EndpointDescription>) -> Self {
        Self {
            kind,
            service_id,
            endpoint,
            cause: None,
        }
    }

    /// Attach a failure cause.
    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.cause = Some(cause.into());
        self
    }
}

/// Receives registration transitions. Must not block.
pub trait RegistrationSink: Send + Sync + 'static {
    /// Deliver one event.
    fn publish(&self, event: RegistrationEvent);
}

/// Forwards events to an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<RegistrationEvent>,
}

impl ChannelSink {
    /// Create a sink and the receiver its events arrive on.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RegistrationEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl RegistrationSink for ChannelSink {
    fn publish(&self, event: RegistrationEvent) {
        if self.tx.send(event).is_err() {
            trace!("Registration event receiver dropped");
        }
    }
}

/// Drops every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl RegistrationSink for NoopSink {
    fn publish(&self, _event: RegistrationEvent) {}
}

/// Shared sink handle.
pub type SharedSink = Arc<dyn RegistrationSink>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_sink_forwards() {
        let (sink, mut rx) = ChannelSink::new();
        sink.publish(RegistrationEvent::new(EventKind::ImportError, None, None).with_cause("reset"));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::ImportError);
        assert_eq!(event.cause.as_deref(), Some("reset"));

        drop(rx);
        sink.publish(RegistrationEvent::new(EventKind::ImportUnregistration, None, None));
    }
}
