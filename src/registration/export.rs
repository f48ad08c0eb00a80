//! Export side of the lifecycle.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use super::sink::{EventKind, RegistrationEvent, SharedSink};
use super::state::RegistrationState;
use crate::endpoint::{EndpointDescription, PropertyValue};
use crate::error::{Error, Result};
use crate::invoker::{ServerDispatcher, ServiceInvoker};

struct Inner {
    state: RegistrationState,
    endpoint: EndpointDescription,
    error: Option<String>,
}

/// A service exported through a transport.
///
/// While open, its [`ServiceInvoker`] is registered with the transport's
/// dispatcher. Closing publishes the unregistration first and only then
/// releases the invoker, so observers of the event still see a valid
/// endpoint.
pub struct ExportRegistration {
    service_id: Uuid,
    invoker: Arc<ServiceInvoker>,
    dispatcher: Arc<ServerDispatcher>,
    sink: SharedSink,
    inner: Mutex<Inner>,
}

impl fmt::Debug for ExportRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExportRegistration")
            .field("service_id", &self.service_id)
            .field("state", &self.state())
            .finish()
    }
}

impl ExportRegistration {
    /// Register `invoker` and publish the export.
    pub(crate) fn open(
        invoker: Arc<ServiceInvoker>,
        dispatcher: Arc<ServerDispatcher>,
        endpoint: EndpointDescription,
        sink: SharedSink,
    ) -> Arc<Self> {
        let registration = Arc::new(Self {
            service_id: invoker.service_id(),
            invoker,
            dispatcher,
            sink,
            inner: Mutex::new(Inner {
                state: RegistrationState::PreInit,
                endpoint,
                error: None,
            }),
        });

        let endpoint = {
            let mut inner = registration.inner.lock();
            registration.dispatcher.register(registration.invoker.clone());
            inner.state = RegistrationState::Open;
            inner.endpoint.clone()
        };
        debug!(service_id = %registration.service_id, "Service exported");
        registration.publish(EventKind::ExportRegistration, Some(endpoint), None);
        registration
    }

    /// Exported service id.
    pub fn service_id(&self) -> Uuid {
        self.service_id
    }

    /// Current state.
    pub fn state(&self) -> RegistrationState {
        self.inner.lock().state
    }

    /// Endpoint snapshot; `None` once closed.
    pub fn endpoint(&self) -> Option<EndpointDescription> {
        let inner = self.inner.lock();
        (!inner.state.is_terminal()).then(|| inner.endpoint.clone())
    }

    /// Last failure, if the export is in ERROR.
    pub fn error(&self) -> Option<String> {
        self.inner.lock().error.clone()
    }

    /// Invoker serving this export.
    pub fn invoker(&self) -> &Arc<ServiceInvoker> {
        &self.invoker
    }

    /// Merge `properties` into the endpoint and publish an update.
    ///
    /// From ERROR this re-registers the invoker and returns to OPEN.
    pub fn update(&self, properties: BTreeMap<String, PropertyValue>) -> Result<EndpointDescription> {
        let endpoint = {
            let mut inner = self.inner.lock();
            match inner.state {
                RegistrationState::Open => {}
                RegistrationState::Error if inner.state.can_transition(RegistrationState::Open, true) => {
                    self.dispatcher.register(self.invoker.clone());
                    inner.state = RegistrationState::Open;
                    inner.error = None;
                }
                _ => return Err(Error::RegistrationClosed),
            }
            inner.endpoint.merge(properties);
            inner.endpoint.clone()
        };
        debug!(service_id = %self.service_id, "Export updated");
        self.publish(EventKind::ExportUpdate, Some(endpoint.clone()), None);
        Ok(endpoint)
    }

    /// Move to ERROR and stop serving. Returns false if not OPEN.
    pub fn fail(&self, cause: impl Into<String>) -> bool {
        let cause = cause.into();
        let endpoint = {
            let mut inner = self.inner.lock();
            if inner.state != RegistrationState::Open {
                return false;
            }
            inner.state = RegistrationState::Error;
            inner.error = Some(cause.clone());
            self.dispatcher.unregister(&self.service_id);
            inner.endpoint.clone()
        };
        warn!(service_id = %self.service_id, cause = %cause, "Export failed");
        self.publish(EventKind::ExportError, Some(endpoint), Some(cause));
        true
    }

    /// Close the export. Idempotent.
    pub async fn close(&self) {
        let endpoint = {
            let mut inner = self.inner.lock();
            if inner.state.is_terminal() {
                return;
            }
            inner.state = RegistrationState::Closed;
            inner.endpoint.clone()
        };
        self.publish(EventKind::ExportUnregistration, Some(endpoint), None);

        self.dispatcher.unregister(&self.service_id);
        self.invoker.close().await;
        debug!(service_id = %self.service_id, "Export closed");
    }

    fn publish(&self, kind: EventKind, endpoint: Option<EndpointDescription>, cause: Option<String>) {
        let mut event = RegistrationEvent::new(kind, Some(self.service_id), endpoint);
        event.cause = cause;
        self.sink.publish(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::MsgPackSerializer;
    use crate::config::StreamConfig;
    use crate::endpoint::OBJECT_CLASS;
    use crate::handler::ServiceBuilder;
    use crate::invoker::WorkerPool;
    use crate::registration::{ChannelSink, RegistrationSink};
    use std::time::Duration;

    struct Echo;

    struct OrderCheck {
        dispatcher: Arc<ServerDispatcher>,
        seen: Mutex<Vec<(EventKind, bool)>>,
    }

    impl RegistrationSink for OrderCheck {
        fn publish(&self, event: RegistrationEvent) {
            let registered = event.service_id.map_or(false, |id| self.dispatcher.get(&id).is_some());
            self.seen.lock().push((event.kind, registered));
        }
    }

    fn invoker(id: u128) -> Arc<ServiceInvoker> {
        let definition = ServiceBuilder::new(Echo, MsgPackSerializer)
            .interface("example.Echo")
            .method("echo", |_: &Echo, (s,): (String,)| Ok(s))
            .build();
        ServiceInvoker::new(
            Uuid::from_u128(id),
            definition,
            Duration::from_secs(1),
            WorkerPool::new(4),
            StreamConfig::default(),
        )
    }

    fn endpoint() -> EndpointDescription {
        let mut endpoint = EndpointDescription::default();
        endpoint.set(OBJECT_CLASS, vec!["example.Echo"]);
        endpoint
    }

    #[tokio::test]
    async fn test_close_publishes_before_unregistering() {
        let dispatcher = Arc::new(ServerDispatcher::new());
        let sink = Arc::new(OrderCheck {
            dispatcher: dispatcher.clone(),
            seen: Mutex::new(Vec::new()),
        });
        let export = ExportRegistration::open(invoker(1), dispatcher.clone(), endpoint(), sink.clone());
        assert_eq!(export.state(), RegistrationState::Open);

        export.close().await;
        export.close().await;

        assert_eq!(export.state(), RegistrationState::Closed);
        assert!(export.endpoint().is_none());
        assert!(dispatcher.is_empty());
        assert_eq!(
            *sink.seen.lock(),
            vec![(EventKind::ExportRegistration, true), (EventKind::ExportUnregistration, true)]
        );
    }

    #[tokio::test]
    async fn test_update_recovers_from_error() {
        let dispatcher = Arc::new(ServerDispatcher::new());
        let (sink, mut events) = ChannelSink::new();
        let export = ExportRegistration::open(invoker(2), dispatcher.clone(), endpoint(), Arc::new(sink));

        assert!(export.fail("listener lost"));
        assert!(!export.fail("again"));
        assert_eq!(export.state(), RegistrationState::Error);
        assert_eq!(export.error().as_deref(), Some("listener lost"));
        assert!(dispatcher.is_empty());

        let updated = export
            .update(BTreeMap::from([("service.ranking".to_string(), PropertyValue::from(5i64))]))
            .unwrap();
        assert_eq!(export.state(), RegistrationState::Open);
        assert!(export.error().is_none());
        assert!(updated.get("service.ranking").is_some());
        assert_eq!(dispatcher.len(), 1);

        export.close().await;
        assert!(matches!(export.update(BTreeMap::new()), Err(Error::RegistrationClosed)));

        let kinds: Vec<EventKind> = std::iter::from_fn(|| events.try_recv().ok()).map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::ExportRegistration,
                EventKind::ExportError,
                EventKind::ExportUpdate,
                EventKind::ExportUnregistration,
            ]
        );
    }
}
