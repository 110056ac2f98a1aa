use crate::{
    config::ServerConfig,
    contract::{ContractRegistry, ServiceId},
    dispatcher::{Dispatcher, RpcService},
    error::RegistryError,
    net::Connection,
};
use std::{future::Future, io, net::SocketAddr, sync::Arc};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, ToSocketAddrs},
    sync::Semaphore,
    task,
};

/// Hosts service implementations and answers calls for them.
///
/// Implementations are bound with [`bind`](Self::bind), then the server is
/// started with [`serve_tcp`](Self::serve_tcp) or
/// [`serve_listener`](Self::serve_listener). Each connection is read by its
/// own task and every request is dispatched in a task of its own, so a slow
/// call never holds up the others.
pub struct Server {
    dispatcher: Arc<Dispatcher>,
    config: ServerConfig,
}

impl Server {
    pub fn new(contracts: Arc<ContractRegistry>) -> Self {
        Self::with_config(contracts, ServerConfig::default())
    }

    pub fn with_config(contracts: Arc<ContractRegistry>, config: ServerConfig) -> Self {
        Self {
            dispatcher: Arc::new(Dispatcher::new(contracts)),
            config,
        }
    }

    pub fn bind<S: RpcService>(&self, id: ServiceId, service: S) -> Result<(), RegistryError> {
        self.dispatcher.bind(id, service)
    }

    pub fn unbind(&self, id: &ServiceId) -> Result<(), RegistryError> {
        self.dispatcher.implementations().unbind(id).map(drop)
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub async fn serve_tcp(self, addr: impl ToSocketAddrs) -> io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve_listener(listener).await
    }

    pub async fn serve_listener(self, listener: TcpListener) -> io::Result<()> {
        tracing::info!(addr = %listener.local_addr()?, "rpc server listening");
        loop {
            let (sock, peer) = listener.accept().await?;
            if let Err(err) = sock.set_nodelay(true) {
                tracing::debug!(%peer, error = %err, "could not disable nagle");
            }
            task::spawn(self.serve_stream(sock, Some(peer)));
        }
    }

    /// Serves a single already-open stream until it closes.
    pub fn serve_stream<S>(
        &self,
        stream: S,
        peer: Option<SocketAddr>,
    ) -> impl Future<Output = ()> + Send + 'static
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let connection = Arc::new(Connection::new(stream, &self.config.connection));
        tracing::info!(connection = %connection.id(), ?peer, "accepted connection");
        serve_connection(
            self.dispatcher.clone(),
            connection,
            Arc::new(Semaphore::new(self.config.max_in_flight.max(1))),
        )
    }
}

async fn serve_connection(
    dispatcher: Arc<Dispatcher>,
    connection: Arc<Connection>,
    in_flight: Arc<Semaphore>,
) {
    while let Ok(frame) = connection.receive().await {
        let Ok(permit) = in_flight.clone().acquire_owned().await else {
            break;
        };
        let dispatcher = dispatcher.clone();
        let connection = connection.clone();
        task::spawn(async move {
            let call_id = frame.call_id;
            let response = dispatcher.dispatch_frame(&frame).await;
            drop(permit);
            if connection.send(response).await.is_err() {
                tracing::debug!(call_id, connection = %connection.id(), "connection closed before response could be sent");
            }
        });
    }
    tracing::info!(connection = %connection.id(), "connection closed");
}
