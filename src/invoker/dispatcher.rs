//! Routes request frames to the invoker of their service.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{trace, warn};
use uuid::Uuid;

use super::ServiceInvoker;
use crate::connection::ConnectionId;
use crate::error::Result;
use crate::handler::ResponseContext;
use crate::protocol::{Command, Frame};
use crate::writer::WriterHandle;

/// Registered invokers by service id. Shared by every server connection.
#[derive(Default)]
pub struct ServerDispatcher {
    invokers: DashMap<Uuid, Arc<ServiceInvoker>>,
}

impl ServerDispatcher {
    /// Create an empty dispatcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an invoker under its service id.
    pub fn register(&self, invoker: Arc<ServiceInvoker>) {
        self.invokers.insert(invoker.service_id(), invoker);
    }

    /// Remove an invoker. Later calls get NO_SERVICE.
    pub fn unregister(&self, service_id: &Uuid) -> Option<Arc<ServiceInvoker>> {
        self.invokers.remove(service_id).map(|(_, invoker)| invoker)
    }

    /// Invoker for a service id.
    pub fn get(&self, service_id: &Uuid) -> Option<Arc<ServiceInvoker>> {
        self.invokers.get(service_id).map(|i| i.value().clone())
    }

    /// Number of registered services.
    pub fn len(&self) -> usize {
        self.invokers.len()
    }

    /// True if no service is registered.
    pub fn is_empty(&self) -> bool {
        self.invokers.is_empty()
    }

    /// Handle one request frame that arrived on `conn`.
    pub async fn dispatch(&self, conn: ConnectionId, frame: Frame, writer: &WriterHandle) -> Result<()> {
        let command = frame.command();
        let key = frame.key();
        trace!(?command, service_id = %key.service_id, call_id = key.call_id, "Request");

        let invoker = self.get(&key.service_id);
        match (command, invoker) {
            (Command::CallWithReturn | Command::CallWithoutReturn, Some(invoker)) => {
                invoker.invoke(conn, frame, writer.clone()).await
            }
            (Command::CallWithReturn, None) => {
                warn!(service_id = %key.service_id, call_id = key.call_id, "No such service");
                let message = format!("No service with id {}", key.service_id);
                ResponseContext::new(key, true, writer.clone())
                    .reject(Command::NoService, &message)
                    .await
            }
            (Command::CallWithoutReturn, None) => {
                warn!(service_id = %key.service_id, "Fire-and-forget call for an unknown service dropped");
                Ok(())
            }
            (Command::Cancel, Some(invoker)) => {
                invoker.cancel(conn, key);
                Ok(())
            }
            (Command::AsyncParamData | Command::AsyncParamFailure, Some(invoker)) => {
                invoker.resolve_param(conn, frame, writer.clone()).await
            }
            (Command::ClientOpen, Some(invoker)) => {
                invoker.open_stream(conn, frame, writer.clone()).await
            }
            (Command::ClientBackPressure, Some(invoker)) => {
                invoker.stream_credit(conn, frame, writer.clone()).await
            }
            (Command::ClientClose, Some(invoker)) => {
                invoker.close_stream(conn, key, writer.clone()).await
            }
            (Command::Cancel | Command::ClientClose, None) => Ok(()),
            (Command::AsyncParamData | Command::AsyncParamFailure, None) => {
                warn!(service_id = %key.service_id, "Async argument for an unknown service");
                ResponseContext::new(key, true, writer.clone())
                    .error(Command::AsyncParamError, "No such service")
                    .await
            }
            (Command::ClientOpen | Command::ClientBackPressure, None) => {
                warn!(service_id = %key.service_id, "Stream control for an unknown service");
                ResponseContext::new(key, true, writer.clone())
                    .error(Command::UnknownError, "Unknown stream")
                    .await
            }
            (other, _) => {
                warn!(command = ?other, "Response command sent as a request, ignored");
                Ok(())
            }
        }
    }

    /// Cancel everything `conn` owned on every service.
    pub fn connection_closed(&self, conn: ConnectionId) {
        for invoker in self.invokers.iter() {
            invoker.connection_closed(conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{MsgPackSerializer, Serializer};
    use crate::config::StreamConfig;
    use crate::handler::ServiceBuilder;
    use crate::invoker::WorkerPool;
    use crate::protocol::payload::encode_call;
    use crate::protocol::{CacheKey, FrameBuffer};
    use crate::writer::spawn_writer_task_default;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt};

    #[tokio::test]
    async fn test_unknown_service() {
        let dispatcher = ServerDispatcher::new();
        let (client, mut server) = duplex(4096);
        let (writer, _task) = spawn_writer_task_default(client);

        let key = CacheKey::new(Uuid::from_u128(3), 1);
        let forget = Frame::message(Command::CallWithoutReturn, key, encode_call(0, &[0x90]));
        dispatcher.dispatch(ConnectionId(1), forget, &writer).await.unwrap();
        let call = Frame::message(Command::CallWithReturn, key, encode_call(0, &[0x90]));
        dispatcher.dispatch(ConnectionId(1), call, &writer).await.unwrap();

        let mut buf = vec![0u8; 1024];
        let n = server.read(&mut buf).await.unwrap();
        let frames = FrameBuffer::new().push(&buf[..n]).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].command(), Command::NoService);
    }

    #[tokio::test]
    async fn test_unregister_routes_to_no_service() {
        let dispatcher = ServerDispatcher::new();
        let id = Uuid::from_u128(4);
        let definition = ServiceBuilder::new((), MsgPackSerializer)
            .method("length", |_: &(), (): ()| Ok(30i64))
            .build();
        dispatcher.register(ServiceInvoker::new(
            id,
            definition,
            Duration::from_secs(1),
            WorkerPool::new(2),
            StreamConfig::default(),
        ));
        assert_eq!(dispatcher.len(), 1);

        let (client, mut server) = duplex(4096);
        let (writer, _task) = spawn_writer_task_default(client);
        let key = CacheKey::new(id, 9);
        let args = MsgPackSerializer.serialize_args(&()).unwrap();
        let call = || Frame::message(Command::CallWithReturn, key, encode_call(0, &args));

        dispatcher.dispatch(ConnectionId(1), call(), &writer).await.unwrap();
        let mut buf = vec![0u8; 1024];
        let n = server.read(&mut buf).await.unwrap();
        assert_eq!(FrameBuffer::new().push(&buf[..n]).unwrap()[0].command(), Command::Success);

        assert!(dispatcher.unregister(&id).is_some());
        dispatcher.dispatch(ConnectionId(1), call(), &writer).await.unwrap();
        let n = server.read(&mut buf).await.unwrap();
        assert_eq!(FrameBuffer::new().push(&buf[..n]).unwrap()[0].command(), Command::NoService);
    }
}
