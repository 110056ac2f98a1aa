use parking_lot::Mutex;
use rpcrelay::{
    service, ApplicationError, Arguments, BoxFuture, Client, ContractRegistry, Decode, Encode,
    RpcError, RpcService, Server, ServiceDescriptor, ServiceId, ServiceProxy, Type, TypeMismatch,
    Typed, Value,
};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{net::TcpListener, task};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone)]
pub struct User {
    id: i64,
    user_name: String,
    sex: bool,
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
            ("id", user.id.into()),
            ("userName", user.user_name.into()),
            ("sex", user.sex.into()),
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

fn user_service() -> ServiceDescriptor {
    service!("UserService" @ 1 {
        "getUserByUserId"(Type::Int) -> User::rpc_type();
        "insertUserId"(User::rpc_type()) -> Type::Int;
    })
}

#[derive(Default)]
pub struct Users {
    users: Mutex<HashMap<i64, User>>,
}

impl RpcService for Users {
    fn call(
        &self,
        method_index: u32,
        mut args: Arguments,
    ) -> BoxFuture<'_, Result<Value, ApplicationError>> {
        Box::pin(async move {
            match method_index {
                0 => {
                    let id: i64 = args.next()?;
                    let user = self.users.lock().get(&id).cloned();
                    user.map(User::encode)
                        .ok_or_else(|| ApplicationError::new("user not found"))
                }
                1 => {
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

pub struct UserServiceClient<'c> {
    proxy: ServiceProxy<'c>,
}

impl<'c> UserServiceClient<'c> {
    fn new(client: &'c Client) -> Result<Self, RpcError> {
        let id = ServiceId::new("UserService", 1);
        Ok(Self {
            proxy: client.proxy(&id, Duration::from_secs(3))?,
        })
    }

    async fn get_user_by_user_id(&self, id: i64) -> Result<User, RpcError> {
        self.proxy.call_typed("getUserByUserId", vec![id.into()]).await
    }

    async fn insert_user_id(&self, user: User) -> Result<i64, RpcError> {
        self.proxy
            .call_typed("insertUserId", vec![User::encode(user)])
            .await
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let mut contracts = ContractRegistry::new();
    contracts.register(user_service()).unwrap();
    let contracts = Arc::new(contracts);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Server::new(contracts.clone());
    server
        .bind(ServiceId::new("UserService", 1), Users::default())
        .unwrap();
    task::spawn(server.serve_listener(listener));

    let client = Client::connect(addr, contracts).await.unwrap();
    let users = UserServiceClient::new(&client).unwrap();

    let id = users
        .insert_user_id(User {
            id: 1,
            user_name: "ann".into(),
            sex: true,
        })
        .await
        .unwrap();
    println!("{:?}", users.get_user_by_user_id(id).await.unwrap());

    match users.get_user_by_user_id(-1).await {
        Ok(user) => println!("unexpected {user:?}"),
        Err(err) => println!("{err}"),
    }
}
