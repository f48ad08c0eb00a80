//! Transport provider - listeners, pooled connections, exports and imports.
//!
//! The [`TransportBuilder`] provides a fluent API for configuring the
//! transport. The [`RemoteTransport`] it starts owns:
//! 1. One accept loop per listen URI
//! 2. The dispatcher and worker pool shared by every export
//! 3. A pool of client connections, one per dialed URI
//!
//! # Example
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
//! async fn main() -> remotewire::Result<()> {
//!     let server = TransportBuilder::new().listen("tcp://127.0.0.1:0").start().await?;
//!     let definition = ServiceBuilder::new(Phrase("hello, remote world".into()), MsgPackSerializer)
//!         .interface("example.Phrase")
//!         .method("length()", |p: &Phrase, (): ()| Ok(p.0.len() as i64))
//!         .build();
//!     let export = server.export(definition, BTreeMap::new())?;
//!
//!     let client = TransportBuilder::new().start().await?;
//!     let endpoint = export.endpoint().expect("open export");
//!     let import = client.import(endpoint, MsgPackSerializer).await;
//!     let proxy = import.proxy().expect("connected");
//!
//!     let length: i64 = proxy.call("length()", ()).await.expect("call");
//!     assert_eq!(length, 19);
//!
//!     client.shutdown().await;
//!     server.shutdown().await;
//!     Ok(())
//! }
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::client::ServiceProxy;
use crate::codec::Serializer;
use crate::config::{StreamConfig, TransportConfig};
use crate::connection::{Connection, ConnectionId};
use crate::endpoint::{
    EndpointDescription, PropertyValue, ENDPOINT_ID, FRAMEWORK_UUID, OBJECT_CLASS, REMOTE_SERIALIZER,
    REMOTE_TIMEOUT, REMOTE_URIS, SERVICE_INTENTS,
};
use crate::error::{Error, Result};
use crate::handler::ServiceDefinition;
use crate::invoker::{ServerDispatcher, ServiceInvoker, WorkerPool};
use crate::registration::{
    ExportRegistration, ImportRegistration, NoopSink, RegistrationSink, SharedSink,
};
use crate::transport::{connect, Listener, TransportUri};
use crate::writer::WriterConfig;

/// Builder for configuring and starting a [`RemoteTransport`].
pub struct TransportBuilder {
    config: TransportConfig,
    sink: SharedSink,
    framework_id: Option<String>,
}

impl TransportBuilder {
    /// Create a builder with default configuration and no listeners.
    pub fn new() -> Self {
        Self {
            config: TransportConfig::default(),
            sink: Arc::new(NoopSink),
            framework_id: None,
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: TransportConfig) -> Self {
        self.config = config;
        self
    }

    /// Listen on `uri` (`tcp://host:port` or `unix:///path`). Port 0 picks
    /// a free port.
    pub fn listen(mut self, uri: impl Into<String>) -> Self {
        self.config.listen.push(uri.into());
        self
    }

    /// Maximum concurrent calls across all exports.
    ///
    /// Default: 256
    pub fn worker_capacity(mut self, capacity: usize) -> Self {
        self.config.worker_capacity = capacity;
        self
    }

    /// Call timeout for endpoints without `remote.timeout.ms`.
    ///
    /// Default: 30 seconds
    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.config.default_timeout = timeout;
        self
    }

    /// Largest accepted frame payload.
    pub fn max_payload_size(mut self, size: u32) -> Self {
        self.config.max_payload_size = size;
        self
    }

    /// Add a supported intent.
    pub fn intent(mut self, intent: impl Into<String>) -> Self {
        self.config.intents.push(intent.into());
        self
    }

    /// Per-connection writer settings.
    pub fn writer_config(mut self, config: WriterConfig) -> Self {
        self.config.writer = config;
        self
    }

    /// Streaming flow control.
    pub fn stream_config(mut self, config: StreamConfig) -> Self {
        self.config.stream = config;
        self
    }

    /// Where registration events go. Default: dropped.
    pub fn sink(mut self, sink: impl RegistrationSink) -> Self {
        self.sink = Arc::new(sink);
        self
    }

    /// Identifier advertised as `endpoint.framework.uuid`. Default: random.
    pub fn framework_id(mut self, id: impl Into<String>) -> Self {
        self.framework_id = Some(id.into());
        self
    }

    /// Bind the listeners and start accepting.
    pub async fn start(self) -> Result<RemoteTransport> {
        RemoteTransport::start(self).await
    }
}

impl Default for TransportBuilder {
    fn default() -> Self {
        Self::new()
    }
}

trait ImportHandle: Send + Sync {
    fn close(&self);
}

impl<S: Serializer> ImportHandle for ImportRegistration<S> {
    fn close(&self) {
        ImportRegistration::close(self);
    }
}

type ConnectionTable<K> = Arc<DashMap<K, Arc<Connection>>>;

/// A running transport.
pub struct RemoteTransport {
    config: TransportConfig,
    framework_id: String,
    sink: SharedSink,
    dispatcher: Arc<ServerDispatcher>,
    pool: WorkerPool,
    uris: Vec<TransportUri>,
    accept_tasks: Mutex<Vec<JoinHandle<()>>>,
    accepted: ConnectionTable<ConnectionId>,
    dialed: ConnectionTable<TransportUri>,
    dial_lock: tokio::sync::Mutex<()>,
    exports: Mutex<Vec<Arc<ExportRegistration>>>,
    imports: Mutex<Vec<Weak<dyn ImportHandle>>>,
    shut_down: AtomicBool,
}

impl fmt::Debug for RemoteTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTransport")
            .field("framework_id", &self.framework_id)
            .field("uris", &self.uris)
            .field("exports", &self.exports.lock().len())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

impl RemoteTransport {
    /// Create a transport builder.
    pub fn builder() -> TransportBuilder {
        TransportBuilder::new()
    }

    async fn start(builder: TransportBuilder) -> Result<Self> {
        let TransportBuilder {
            config,
            sink,
            framework_id,
        } = builder;

        let dispatcher = Arc::new(ServerDispatcher::new());
        let accepted: ConnectionTable<ConnectionId> = Arc::new(DashMap::new());
        let mut uris = Vec::with_capacity(config.listen.len());
        let mut accept_tasks = Vec::with_capacity(config.listen.len());

        for raw in &config.listen {
            let listener = Listener::bind(&raw.parse()?).await?;
            let uri = listener.local_uri()?;
            debug!(%uri, "Listening");
            uris.push(uri);
            accept_tasks.push(tokio::spawn(accept_loop(
                listener,
                dispatcher.clone(),
                accepted.clone(),
                config.clone(),
            )));
        }

        Ok(Self {
            pool: WorkerPool::new(config.worker_capacity),
            framework_id: framework_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            config,
            sink,
            dispatcher,
            uris,
            accept_tasks: Mutex::new(accept_tasks),
            accepted,
            dialed: Arc::new(DashMap::new()),
            dial_lock: tokio::sync::Mutex::new(()),
            exports: Mutex::new(Vec::new()),
            imports: Mutex::new(Vec::new()),
            shut_down: AtomicBool::new(false),
        })
    }

    /// URIs peers dial to reach this transport, with ports resolved.
    pub fn local_uris(&self) -> &[TransportUri] {
        &self.uris
    }

    /// Identifier advertised as `endpoint.framework.uuid`.
    pub fn framework_id(&self) -> &str {
        &self.framework_id
    }

    /// Effective configuration.
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Dispatcher shared by every export.
    pub fn dispatcher(&self) -> &Arc<ServerDispatcher> {
        &self.dispatcher
    }

    /// Worker pool shared by every export.
    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Open exports.
    pub fn exports(&self) -> Vec<Arc<ExportRegistration>> {
        self.exports.lock().clone()
    }

    /// Live client connections.
    pub fn dialed_connections(&self) -> usize {
        self.dialed.len()
    }

    /// Live server connections.
    pub fn accepted_connections(&self) -> usize {
        self.accepted.len()
    }

    /// True after [`shutdown`](Self::shutdown).
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Export `definition` on every listen URI.
    ///
    /// The endpoint starts from `properties` and is completed with the
    /// service id, framework id, URIs, method table, serializer, timeout
    /// and intents.
    pub fn export(
        &self,
        definition: ServiceDefinition,
        properties: BTreeMap<String, PropertyValue>,
    ) -> Result<Arc<ExportRegistration>> {
        if self.is_shut_down() {
            return Err(Error::RegistrationClosed);
        }
        if self.uris.is_empty() {
            return Err(Error::InvalidEndpoint("Transport is not listening".to_string()));
        }

        let service_id = Uuid::new_v4();
        let mut endpoint = EndpointDescription::unchecked(properties);
        if endpoint.interfaces().is_empty() {
            endpoint.set(OBJECT_CLASS, definition.interfaces().to_vec());
        }
        endpoint.set(ENDPOINT_ID, service_id.to_string());
        endpoint.set(FRAMEWORK_UUID, self.framework_id.clone());
        endpoint.set(
            REMOTE_URIS,
            self.uris.iter().map(ToString::to_string).collect::<Vec<_>>(),
        );
        endpoint.set_methods(&definition.method_table());
        endpoint.set(REMOTE_SERIALIZER, definition.serializer());
        if endpoint.get(REMOTE_TIMEOUT).is_none() {
            endpoint.set(REMOTE_TIMEOUT, self.config.default_timeout.as_millis() as i64);
        }
        if endpoint.get(SERVICE_INTENTS).is_none() {
            endpoint.set(SERVICE_INTENTS, self.config.intents.clone());
        }
        endpoint.validate()?;

        let timeout = endpoint.timeout().unwrap_or(self.config.default_timeout);
        let invoker = ServiceInvoker::new(
            service_id,
            definition,
            timeout,
            self.pool.clone(),
            self.config.stream.clone(),
        );
        let registration = ExportRegistration::open(invoker, self.dispatcher.clone(), endpoint, self.sink.clone());

        let mut exports = self.exports.lock();
        exports.retain(|e| !e.state().is_terminal());
        exports.push(registration.clone());
        Ok(registration)
    }

    /// Import the service described by `endpoint`.
    ///
    /// Never fails outright: an import that cannot be set up is returned in
    /// ERROR with the cause in [`ImportRegistration::error`].
    pub async fn import<S: Serializer>(&self, endpoint: EndpointDescription, serializer: S) -> Arc<ImportRegistration<S>> {
        let registration = match self.prepare_import(&endpoint, serializer).await {
            Ok(proxy) => ImportRegistration::open(endpoint, proxy, self.sink.clone()),
            Err(e) => ImportRegistration::failed(endpoint, e.to_string(), self.sink.clone()),
        };

        let handle: Arc<dyn ImportHandle> = registration.clone();
        let mut imports = self.imports.lock();
        imports.retain(|w| w.strong_count() > 0);
        imports.push(Arc::downgrade(&handle));
        registration
    }

    async fn prepare_import<S: Serializer>(
        &self,
        endpoint: &EndpointDescription,
        serializer: S,
    ) -> Result<ServiceProxy<S>> {
        if self.is_shut_down() {
            return Err(Error::RegistrationClosed);
        }
        endpoint.validate()?;

        if let Some(name) = endpoint.serializer() {
            if name != serializer.name() {
                return Err(Error::InvalidEndpoint(format!(
                    "Endpoint uses serializer {}, local serializer is {}",
                    name,
                    serializer.name()
                )));
            }
        }
        if let Some(intent) = endpoint.intents().into_iter().find(|i| !self.config.intents.contains(i)) {
            return Err(Error::InvalidEndpoint(format!("Unsupported intent: {}", intent)));
        }

        let mut last_error = None;
        for uri in endpoint.uris()? {
            match self.connection(&uri).await {
                Ok(conn) => {
                    return Ok(ServiceProxy::new(conn, endpoint.id()?, &endpoint.methods()?, serializer)
                        .with_timeout(endpoint.timeout().unwrap_or(self.config.default_timeout))
                        .with_stream_config(self.config.stream.clone()));
                }
                Err(e) => {
                    warn!(%uri, error = %e, "Could not connect");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or(Error::ConnectionClosed))
    }

    /// Pooled connection to `uri`, dialing if there is none or it died.
    pub async fn connection(&self, uri: &TransportUri) -> Result<Arc<Connection>> {
        if let Some(conn) = self.live_connection(uri) {
            return Ok(conn);
        }

        let _dialing = self.dial_lock.lock().await;
        if let Some(conn) = self.live_connection(uri) {
            return Ok(conn);
        }

        let (reader, writer) = connect(uri).await?;
        let conn = Connection::spawn(uri.to_string(), reader, writer, self.dispatcher.clone(), &self.config);
        self.dialed.insert(uri.clone(), conn.clone());

        let id = conn.id();
        let key = uri.clone();
        let table = Arc::downgrade(&self.dialed);
        conn.closed_promise().on_complete(move |_| {
            if let Some(table) = table.upgrade() {
                table.remove_if(&key, |_, c| c.id() == id);
            }
        });
        Ok(conn)
    }

    fn live_connection(&self, uri: &TransportUri) -> Option<Arc<Connection>> {
        let conn = self.dialed.get(uri).map(|c| c.value().clone())?;
        if conn.is_closed() {
            debug!(%uri, "Evicting dead connection");
            self.dialed.remove_if(uri, |_, c| c.id() == conn.id());
            return None;
        }
        Some(conn)
    }

    /// Close every export and import, stop listening, refuse further calls
    /// and drop all connections. Idempotent.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(framework_id = %self.framework_id, "Shutting down");

        let exports: Vec<Arc<ExportRegistration>> = std::mem::take(&mut *self.exports.lock());
        for export in exports {
            export.close().await;
        }

        let imports: Vec<Weak<dyn ImportHandle>> = std::mem::take(&mut *self.imports.lock());
        for import in imports.iter().filter_map(Weak::upgrade) {
            import.close();
        }

        for task in self.accept_tasks.lock().drain(..) {
            task.abort();
        }
        self.pool.shutdown();

        let dialed: Vec<Arc<Connection>> = self.dialed.iter().map(|e| e.value().clone()).collect();
        self.dialed.clear();
        let accepted: Vec<Arc<Connection>> = self.accepted.iter().map(|e| e.value().clone()).collect();
        self.accepted.clear();
        for conn in dialed.iter().chain(accepted.iter()) {
            conn.close();
        }
    }
}

impl Drop for RemoteTransport {
    fn drop(&mut self) {
        for task in self.accept_tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

async fn accept_loop(
    listener: Listener,
    dispatcher: Arc<ServerDispatcher>,
    accepted: ConnectionTable<ConnectionId>,
    config: TransportConfig,
) {
    loop {
        let incoming = match listener.accept().await {
            Ok(incoming) => incoming,
            Err(e) => {
                error!(error = %e, "Accept failed");
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            }
        };

        let conn = Connection::spawn(incoming.peer, incoming.reader, incoming.writer, dispatcher.clone(), &config);
        let id = conn.id();
        accepted.insert(id, conn.clone());

        let table = Arc::downgrade(&accepted);
        conn.closed_promise().on_complete(move |_| {
            if let Some(table) = table.upgrade() {
                table.remove(&id);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{JsonSerializer, MsgPackSerializer};
    use crate::handler::ServiceBuilder;
    use crate::registration::{ChannelSink, EventKind, RegistrationState};

    struct Phrase;

    fn definition() -> ServiceDefinition {
        ServiceBuilder::new(Phrase, MsgPackSerializer)
            .interface("example.Phrase")
            .method("length()", |_: &Phrase, (): ()| Ok(30i64))
            .build()
    }

    #[tokio::test]
    async fn test_export_fills_endpoint() {
        let transport = TransportBuilder::new()
            .listen("tcp://127.0.0.1:0")
            .default_timeout(Duration::from_millis(750))
            .framework_id("node-a")
            .start()
            .await
            .unwrap();

        let export = transport.export(definition(), BTreeMap::new()).unwrap();
        let endpoint = export.endpoint().unwrap();

        assert_eq!(endpoint.interfaces(), vec!["example.Phrase"]);
        assert_eq!(endpoint.id().unwrap(), export.service_id());
        assert_eq!(endpoint.framework_uuid(), Some("node-a"));
        assert_eq!(endpoint.uris().unwrap(), transport.local_uris());
        assert_eq!(endpoint.methods().unwrap()[&0], "length()");
        assert_eq!(endpoint.serializer(), Some("msgpack"));
        assert_eq!(endpoint.timeout(), Some(Duration::from_millis(750)));
        assert_eq!(export.invoker().timeout(), Duration::from_millis(750));

        transport.shutdown().await;
        assert_eq!(export.state(), RegistrationState::Closed);
        assert!(transport.export(definition(), BTreeMap::new()).is_err());
    }

    #[tokio::test]
    async fn test_export_requires_listener() {
        let transport = TransportBuilder::new().start().await.unwrap();
        assert!(matches!(
            transport.export(definition(), BTreeMap::new()),
            Err(Error::InvalidEndpoint(_))
        ));
    }

    #[tokio::test]
    async fn test_import_born_in_error() {
        let server = TransportBuilder::new().listen("tcp://127.0.0.1:0").start().await.unwrap();
        let endpoint = server.export(definition(), BTreeMap::new()).unwrap().endpoint().unwrap();

        let (sink, mut events) = ChannelSink::new();
        let client = TransportBuilder::new().sink(sink).start().await.unwrap();

        let import = client.import(endpoint.clone(), JsonSerializer).await;
        assert_eq!(import.state(), RegistrationState::Error);
        assert!(import.error().unwrap().contains("serializer"));
        assert_eq!(events.recv().await.unwrap().kind, EventKind::ImportError);

        let mut confidential = endpoint.clone();
        confidential.set(SERVICE_INTENTS, vec!["confidentiality.message"]);
        let import = client.import(confidential, MsgPackSerializer).await;
        assert!(import.error().unwrap().contains("confidentiality.message"));

        let mut unreachable = endpoint;
        server.shutdown().await;
        unreachable.set(REMOTE_URIS, vec!["tcp://127.0.0.1:1"]);
        let import = client.import(unreachable, MsgPackSerializer).await;
        assert_eq!(import.state(), RegistrationState::Error);
        assert!(import.proxy().is_none());
    }

    #[tokio::test]
    async fn test_connections_are_pooled_and_evicted() {
        let server = TransportBuilder::new().listen("tcp://127.0.0.1:0").start().await.unwrap();
        let client = TransportBuilder::new().start().await.unwrap();
        let uri = server.local_uris()[0].clone();

        let first = client.connection(&uri).await.unwrap();
        let again = client.connection(&uri).await.unwrap();
        assert_eq!(first.id(), again.id());
        assert_eq!(client.dialed_connections(), 1);

        first.close();
        let redialed = client.connection(&uri).await.unwrap();
        assert_ne!(redialed.id(), first.id());

        client.shutdown().await;
        assert_eq!(client.dialed_connections(), 0);
        assert!(redialed.is_closed());
        server.shutdown().await;
    }
}
