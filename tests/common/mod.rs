#![allow(dead_code)]

use parking_lot::Mutex;
use rpcrelay::{
    service, ApplicationError, Arguments, BoxFuture, Client, ContractRegistry, Decode, Encode,
    RpcError, RpcService, Server, ServiceDescriptor, ServiceId, ServiceProxy, Type, TypeMismatch,
    Typed, Value,
};
use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};
use tokio::net::TcpListener;

#[derive(Debug, Clone, PartialEq)]
pub struct User {
    pub id: i64,
    pub user_name: String,
    pub sex: bool,
}

impl Typed for User {
    fn rpc_type() -> Type {
        Type::record([
            ("id", Type::Int),
            ("userName", Type::String),
            ("sex", Type::Bool),
        ])
    }
}

impl Encode for User {
    fn encode(user: User) -> Value {
        Value::record([
            ("id", Value::Int(user.id)),
            ("userName", Value::String(user.user_name)),
            ("sex", Value::Bool(user.sex)),
        ])
    }
}

impl Decode for User {
    fn decode(mut val: Value) -> Result<Self, TypeMismatch> {
        User::rpc_type().check(&val)?;
        let mut field = |name: &str| {
            val.take_field(name)
                .ok_or_else(|| TypeMismatch::MissingField(name.to_owned()))
        };
        Ok(User {
            id: i64::decode(field("id")?)?,
            user_name: String::decode(field("userName")?)?,
            sex: bool::decode(field("sex")?)?,
        })
    }
}

pub fn user_service_id() -> ServiceId {
    ServiceId::new("UserService", 1)
}

pub fn user_service() -> ServiceDescriptor {
    service!("UserService" @ 1 {
        "getUserByUserId"(Type::Int) -> User::rpc_type();
        "insertUserId"(User::rpc_type()) -> Type::Int;
    })
}

pub const GET_USER_BY_USER_ID: u32 = 0;
pub const INSERT_USER_ID: u32 = 1;

pub struct UserServiceImpl {
    users: Mutex<HashMap<i64, User>>,
}

impl UserServiceImpl {
    pub fn new() -> Self {
        let ann = User {
            id: 7,
            user_name: "ann".into(),
            sex: true,
        };
        Self {
            users: Mutex::new(HashMap::from([(ann.id, ann)])),
        }
    }
}

impl RpcService for UserServiceImpl {
    fn call(
        &self,
        method_index: u32,
        mut args: Arguments,
    ) -> BoxFuture<'_, Result<Value, ApplicationError>> {
        Box::pin(async move {
            match method_index {
                GET_USER_BY_USER_ID => {
                    let id: i64 = args.next()?;
                    let user = self.users.lock().get(&id).cloned();
                    user.map(User::encode)
                        .ok_or_else(|| ApplicationError::new("user not found"))
                }
                INSERT_USER_ID => {
                    let user: User = args.next()?;
                    let id = user.id;
                    self.users.lock().insert(id, user);
                    Ok(Value::Int(id))
                }
                _ => Err(ApplicationError::new("unsupported method")),
            }
        })
    }
}

/// Hand-written stand-in for the `UserService` contract.
pub struct UserServiceClient<'c> {
    proxy: ServiceProxy<'c>,
}

impl<'c> UserServiceClient<'c> {
    pub fn new(client: &'c Client, timeout: Duration) -> Result<Self, RpcError> {
        Ok(Self {
            proxy: client.proxy(&user_service_id(), timeout)?,
        })
    }

    pub async fn get_user_by_user_id(&self, id: i64) -> Result<User, RpcError> {
        self.proxy
            .call_typed("getUserByUserId", vec![id.into()])
            .await
    }

    pub async fn insert_user_id(&self, user: User) -> Result<i64, RpcError> {
        self.proxy
            .call_typed("insertUserId", vec![User::encode(user)])
            .await
    }
}

pub fn timer_service_id() -> ServiceId {
    ServiceId::new("Timer", 1)
}

pub fn timer_service() -> ServiceDescriptor {
    service!("Timer" @ 1 {
        "delayed"(Type::Int, Type::Int) -> Type::Int;
        "explode"() -> Type::Nil;
        "explodeEarly"() -> Type::Nil;
    })
}

pub const DELAYED: u32 = 0;
pub const EXPLODE: u32 = 1;
pub const EXPLODE_EARLY: u32 = 2;

/// `delayed(ms, tag)` sleeps for `ms` milliseconds and returns `tag`.
/// `explodeEarly` panics before it even returns a future.
pub struct TimerServiceImpl;

impl RpcService for TimerServiceImpl {
    fn call(
        &self,
        method_index: u32,
        mut args: Arguments,
    ) -> BoxFuture<'_, Result<Value, ApplicationError>> {
        if method_index == EXPLODE_EARLY {
            panic!("timer exploded early");
        }
        Box::pin(async move {
            match method_index {
                DELAYED => {
                    let ms: i64 = args.next()?;
                    let tag: i64 = args.next()?;
                    tokio::time::sleep(Duration::from_millis(ms.max(0) as u64)).await;
                    Ok(Value::Int(tag))
                }
                EXPLODE => panic!("timer exploded"),
                _ => Err(ApplicationError::new("unsupported method")),
            }
        })
    }
}

pub fn contracts() -> Arc<ContractRegistry> {
    let mut contracts = ContractRegistry::new();
    contracts.register(user_service()).unwrap();
    contracts.register(timer_service()).unwrap();
    Arc::new(contracts)
}

/// Starts a server on an ephemeral port with both services bound.
pub async fn start_server() -> SocketAddr {
    start_server_with(|server| {
        server.bind(user_service_id(), UserServiceImpl::new()).unwrap();
        server.bind(timer_service_id(), TimerServiceImpl).unwrap();
    })
    .await
}

pub async fn start_server_with(bind: impl FnOnce(&Server)) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Server::new(contracts());
    bind(&server);
    tokio::spawn(server.serve_listener(listener));
    addr
}

pub async fn connect(addr: SocketAddr) -> Client {
    Client::connect(addr, contracts()).await.unwrap()
}
