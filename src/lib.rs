//! A small RPC core: contracts described at runtime, a client that turns
//! method calls into frames on a multiplexed connection, and a server that
//! dispatches those frames to bound implementations.

mod macros;

pub mod codec;
pub mod config;
pub mod contract;
pub mod dispatcher;
pub mod error;
pub mod net;
mod pending;
pub mod types;

pub use codec::{CallRequest, CallResponse, Frame, FrameKind, Outcome};
pub use config::{ConnectionConfig, ServerConfig};
pub use contract::{ContractRegistry, MethodDescriptor, ServiceDescriptor, ServiceId};
pub use dispatcher::{Arguments, Dispatcher, ImplementationRegistry, RpcService};
pub use error::{
    ApplicationError, CodecError, ConnectionClosed, ProtocolFault, RegistryError, RpcError,
};
pub use futures::future::BoxFuture;
pub use net::{
    client::{Client, ServiceProxy},
    server::Server,
    Connection, ConnectionId, LinkState,
};
pub use types::{Decode, Encode, Field, Type, TypeMismatch, Typed, Value};
