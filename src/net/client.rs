use crate::{
    codec::{self, CallRequest, Frame, FrameKind, Outcome},
    config::ConnectionConfig,
    contract::{ContractRegistry, ServiceDescriptor, ServiceId},
    error::RpcError,
    net::Connection,
    pending::{self, PendingCall, PendingCalls, PendingGuard, Resolution},
    types::{Decode, Value},
};
use std::{
    io,
    sync::Arc,
    time::{Duration, Instant as StdInstant},
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::ToSocketAddrs,
    task::{self, JoinHandle},
    time::{self, Instant},
};

/// The client side of a connection.
///
/// Calls are multiplexed over one [`Connection`] and matched back to their
/// callers by call id, so any number of invocations may be in flight at once.
/// Dropping the client closes the connection.
pub struct Client {
    contracts: Arc<ContractRegistry>,
    connection: Arc<Connection>,
    pending: Arc<PendingCalls>,
    router: JoinHandle<()>,
}

impl Client {
    pub async fn connect(
        addr: impl ToSocketAddrs,
        contracts: Arc<ContractRegistry>,
    ) -> io::Result<Self> {
        Self::connect_with_config(addr, contracts, &ConnectionConfig::default()).await
    }

    pub async fn connect_with_config(
        addr: impl ToSocketAddrs,
        contracts: Arc<ContractRegistry>,
        config: &ConnectionConfig,
    ) -> io::Result<Self> {
        let connection = Connection::connect(addr, config).await?;
        Ok(Self::from_connection(connection, contracts))
    }

    pub fn from_stream<S>(
        stream: S,
        contracts: Arc<ContractRegistry>,
        config: &ConnectionConfig,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::from_connection(Connection::new(stream, config), contracts)
    }

    fn from_connection(connection: Connection, contracts: Arc<ContractRegistry>) -> Self {
        let connection = Arc::new(connection);
        let pending = Arc::new(PendingCalls::new());
        let router = task::spawn(route_responses(connection.clone(), pending.clone()));
        Self {
            contracts,
            connection,
            pending,
            router,
        }
    }

    pub fn contracts(&self) -> &ContractRegistry {
        &self.contracts
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_open()
    }

    /// Number of calls currently waiting for a response.
    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    pub fn close(&self) {
        self.connection.close();
    }

    /// Calls method `method_index` of `service` on the server.
    ///
    /// The arguments are checked against the locally registered descriptor
    /// before anything is sent. The call fails with
    /// [`RpcError::CallTimeout`] if no response arrives within `timeout`,
    /// and with [`RpcError::ConnectionLost`] as soon as the connection drops.
    pub async fn invoke(
        &self,
        service: &ServiceId,
        method_index: u32,
        args: Vec<Value>,
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        let descriptor = self.contracts.resolve(service)?;
        let method = descriptor.method(method_index)?;
        method.check_args(&args)?;

        let call_id = pending::next_call_id();
        let pending = self
            .pending
            .register(call_id, Instant::now() + timeout)
            .ok_or(RpcError::ConnectionLost)?;
        let _guard = PendingGuard {
            calls: &self.pending,
            call_id: pending.call_id,
        };

        let request = CallRequest::new(call_id, service.clone(), method_index, args);
        let frame = codec::encode_request(&request)?;
        tracing::debug!(call_id, service = %service, method = %method.name, connection = %self.connection.id(), "sending request");

        let outcome = match self.round_trip(frame, pending, timeout).await {
            Err(err @ RpcError::CallTimeout { .. }) => {
                tracing::debug!(call_id, service = %service, method = %method.name, ?timeout, "call timed out");
                return Err(err);
            }
            result => result?,
        };

        match outcome {
            Outcome::Success(value) => {
                method.check_return(&value)?;
                Ok(value)
            }
            Outcome::ApplicationError(err) => Err(RpcError::RemoteApplication(err)),
            Outcome::ProtocolError(fault) => Err(RpcError::Protocol(fault)),
        }
    }

    /// A stand-in for `service` whose calls all use `timeout`.
    pub fn proxy(
        &self,
        service: &ServiceId,
        timeout: Duration,
    ) -> Result<ServiceProxy<'_>, RpcError> {
        let descriptor = self.contracts.resolve(service)?;
        Ok(ServiceProxy {
            client: self,
            descriptor,
            timeout,
        })
    }

    /// Measures a round trip to the server.
    pub async fn ping(&self, timeout: Duration) -> Result<Duration, RpcError> {
        let call_id = pending::next_call_id();
        let pending = self
            .pending
            .register(call_id, Instant::now() + timeout)
            .ok_or(RpcError::ConnectionLost)?;
        let _guard = PendingGuard {
            calls: &self.pending,
            call_id: pending.call_id,
        };

        let started = StdInstant::now();
        self.round_trip(Frame::ping(call_id), pending, timeout).await?;
        Ok(started.elapsed())
    }

    /// Sends `frame` and waits for the resolution of `pending`. The deadline
    /// covers the send as well, since a peer that stops reading stalls it.
    async fn round_trip(
        &self,
        frame: Frame,
        pending: PendingCall,
        timeout: Duration,
    ) -> Result<Outcome, RpcError> {
        let PendingCall {
            call_id,
            deadline,
            slot,
        } = pending;
        let exchange = async move {
            self.connection.send(frame).await?;
            slot.await.map_err(|_| RpcError::ConnectionLost)
        };
        match time::timeout_at(deadline, exchange).await {
            Ok(Ok(Resolution::Response(outcome))) => Ok(outcome),
            Ok(Ok(Resolution::Malformed(err))) => Err(err.into()),
            Ok(Ok(Resolution::ConnectionLost)) => Err(RpcError::ConnectionLost),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(RpcError::CallTimeout { call_id, timeout }),
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.connection.close();
        self.router.abort();
        self.pending.fail_all();
    }
}

/// Reads frames off the connection and hands each response to its waiter.
async fn route_responses(connection: Arc<Connection>, pending: Arc<PendingCalls>) {
    while let Ok(frame) = connection.receive().await {
        let call_id = frame.call_id;
        match frame.kind() {
            Ok(FrameKind::Response) => {
                let resolution = match codec::decode_response(&frame) {
                    Ok(response) => Resolution::Response(response.outcome),
                    Err(err) => {
                        tracing::warn!(call_id, error = %err, "undecodable response");
                        Resolution::Malformed(err)
                    }
                };
                pending.resolve(call_id, resolution);
            }
            Ok(FrameKind::Pong) => {
                pending.resolve(call_id, Resolution::Response(Outcome::Success(Value::Nil)));
            }
            Ok(kind) => {
                tracing::warn!(call_id, ?kind, connection = %connection.id(), "ignoring unexpected frame");
            }
            Err(err) => {
                tracing::warn!(call_id, error = %err, connection = %connection.id(), "ignoring frame of unknown kind");
            }
        }
    }
    tracing::debug!(connection = %connection.id(), "connection lost, failing pending calls");
    pending.fail_all();
}

/// A client bound to one contract, calling its methods by name.
///
/// Typed adapters for a specific contract wrap one of these and map each
/// Rust method onto [`call_typed`](Self::call_typed).
pub struct ServiceProxy<'c> {
    client: &'c Client,
    descriptor: &'c ServiceDescriptor,
    timeout: Duration,
}

impl<'c> ServiceProxy<'c> {
    pub fn descriptor(&self) -> &ServiceDescriptor {
        self.descriptor
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        Self { timeout, ..self }
    }

    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value, RpcError> {
        let index = self.descriptor.method_index(method)?;
        self.client
            .invoke(self.descriptor.id(), index, args, self.timeout)
            .await
    }

    pub async fn call_typed<R: Decode>(
        &self,
        method: &str,
        args: Vec<Value>,
    ) -> Result<R, RpcError> {
        let value = self.call(method, args).await?;
        Ok(R::decode(value)?)
    }
}
