//! Import side of the lifecycle.

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use super::sink::{EventKind, RegistrationEvent, SharedSink};
use super::state::RegistrationState;
use crate::client::ServiceProxy;
use crate::codec::Serializer;
use crate::endpoint::EndpointDescription;
use crate::error::RemoteError;

struct Inner<S> {
    state: RegistrationState,
    proxy: Option<ServiceProxy<S>>,
    error: Option<String>,
}

/// A remote service imported through a transport.
///
/// An import that could not be set up (no connection, serializer mismatch,
/// unsupported intent) is born in ERROR and owns no proxy. An open import
/// moves to ERROR when its connection is lost.
pub struct ImportRegistration<S> {
    endpoint: EndpointDescription,
    service_id: Option<Uuid>,
    sink: SharedSink,
    inner: Mutex<Inner<S>>,
}

impl<S> fmt::Debug for ImportRegistration<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ImportRegistration")
            .field("service_id", &self.service_id)
            .field("state", &inner.state)
            .field("error", &inner.error)
            .finish()
    }
}

impl<S: Serializer> ImportRegistration<S> {
    /// Publish a live import and watch its connection.
    pub(crate) fn open(endpoint: EndpointDescription, proxy: ServiceProxy<S>, sink: SharedSink) -> Arc<Self> {
        let closed = proxy.connection().closed_promise();
        let registration = Arc::new(Self {
            service_id: Some(proxy.service_id()),
            endpoint,
            sink,
            inner: Mutex::new(Inner {
                state: RegistrationState::Open,
                proxy: Some(proxy),
                error: None,
            }),
        });
        debug!(service_id = ?registration.service_id, "Service imported");
        registration.publish(EventKind::ImportRegistration, None);

        let weak: Weak<Self> = Arc::downgrade(&registration);
        closed.on_complete(move |reason| {
            if let Some(registration) = weak.upgrade() {
                let reason = match reason {
                    Ok(reason) => reason.clone(),
                    Err(e) => e.to_string(),
                };
                registration.fail(RemoteError::Communication(reason).to_string());
            }
        });
        registration
    }

    /// Publish an import that failed before it had any resources.
    pub(crate) fn failed(endpoint: EndpointDescription, cause: impl Into<String>, sink: SharedSink) -> Arc<Self> {
        let cause = cause.into();
        warn!(cause = %cause, "Import failed");
        let registration = Arc::new(Self {
            service_id: endpoint.id().ok(),
            endpoint,
            sink,
            inner: Mutex::new(Inner {
                state: RegistrationState::Error,
                proxy: None,
                error: Some(cause.clone()),
            }),
        });
        registration.publish(EventKind::ImportError, Some(cause));
        registration
    }

    /// Imported service id, if the endpoint carried a valid one.
    pub fn service_id(&self) -> Option<Uuid> {
        self.service_id
    }

    /// Current state.
    pub fn state(&self) -> RegistrationState {
        self.inner.lock().state
    }

    /// Endpoint the import was created from.
    pub fn endpoint(&self) -> &EndpointDescription {
        &self.endpoint
    }

    /// Last failure, if any.
    pub fn error(&self) -> Option<String> {
        self.inner.lock().error.clone()
    }

    /// The proxy, while OPEN.
    pub fn proxy(&self) -> Option<ServiceProxy<S>> {
        let inner = self.inner.lock();
        match inner.state {
            RegistrationState::Open => inner.proxy.clone(),
            _ => None,
        }
    }

    /// Move to ERROR and invalidate the proxy. Returns false if not OPEN.
    pub fn fail(&self, cause: impl Into<String>) -> bool {
        let cause = cause.into();
        {
            let mut inner = self.inner.lock();
            if inner.state != RegistrationState::Open {
                return false;
            }
            inner.state = RegistrationState::Error;
            inner.error = Some(cause.clone());
            if let Some(proxy) = inner.proxy.take() {
                proxy.invalidate();
            }
        }
        warn!(service_id = ?self.service_id, cause = %cause, "Import failed");
        self.publish(EventKind::ImportError, Some(cause));
        true
    }

    /// Close the import. Idempotent.
    pub fn close(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.state.is_terminal() {
                return;
            }
            inner.state = RegistrationState::Closed;
            if let Some(proxy) = inner.proxy.take() {
                proxy.invalidate();
            }
        }
        debug!(service_id = ?self.service_id, "Import closed");
        self.publish(EventKind::ImportUnregistration, None);
    }

    fn publish(&self, kind: EventKind, cause: Option<String>) {
        let mut event = RegistrationEvent::new(kind, self.service_id, Some(self.endpoint.clone()));
        event.cause = cause;
        self.sink.publish(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::MsgPackSerializer;
    use crate::config::TransportConfig;
    use crate::connection::Connection;
    use crate::invoker::ServerDispatcher;
    use crate::registration::ChannelSink;
    use std::collections::BTreeMap;
    use tokio::io::duplex;

    fn proxy() -> (ServiceProxy<MsgPackSerializer>, tokio::io::DuplexStream) {
        let (local, remote) = duplex(4096);
        let (reader, writer) = tokio::io::split(local);
        let conn = Connection::spawn(
            "test",
            reader,
            writer,
            Arc::new(ServerDispatcher::new()),
            &TransportConfig::default(),
        );
        let methods = BTreeMap::from([(0, "length()".to_string())]);
        (ServiceProxy::new(conn, Uuid::from_u128(9), &methods, MsgPackSerializer), remote)
    }

    #[tokio::test]
    async fn test_close_invalidates_handed_out_proxy() {
        let (sink, mut events) = ChannelSink::new();
        let (proxy, _remote) = proxy();
        let import = ImportRegistration::open(EndpointDescription::default(), proxy, Arc::new(sink));

        let handed_out = import.proxy().unwrap();
        assert!(handed_out.is_open());

        import.close();
        import.close();
        assert_eq!(import.state(), RegistrationState::Closed);
        assert!(import.proxy().is_none());
        assert!(!handed_out.is_open());

        assert_eq!(events.recv().await.unwrap().kind, EventKind::ImportRegistration);
        assert_eq!(events.recv().await.unwrap().kind, EventKind::ImportUnregistration);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_connection_loss_moves_to_error() {
        let (sink, mut events) = ChannelSink::new();
        let (proxy, remote) = proxy();
        let import = ImportRegistration::open(EndpointDescription::default(), proxy, Arc::new(sink));
        assert_eq!(events.recv().await.unwrap().kind, EventKind::ImportRegistration);

        drop(remote);
        let event = events.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::ImportError);
        assert!(event.cause.unwrap().starts_with("Remote communication error"));
        assert_eq!(import.state(), RegistrationState::Error);
        assert!(import.proxy().is_none());

        import.close();
        assert_eq!(import.state(), RegistrationState::Closed);
    }

    #[test]
    fn test_born_in_error() {
        let (sink, mut events) = ChannelSink::new();
        let import = ImportRegistration::<MsgPackSerializer>::failed(
            EndpointDescription::default(),
            "serializer mismatch",
            Arc::new(sink),
        );
        assert_eq!(import.state(), RegistrationState::Error);
        assert!(import.proxy().is_none());
        assert!(!import.fail("again"));
        assert_eq!(events.try_recv().unwrap().cause.as_deref(), Some("serializer mismatch"));
    }
}
