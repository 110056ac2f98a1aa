use rpcrelay::{Client, ContractRegistry, Server};
use std::{sync::Arc, time::Duration};
use tokio::{net::TcpListener, task};

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt::init();

    let contracts = Arc::new(ContractRegistry::new());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    task::spawn(Server::new(contracts.clone()).serve_listener(listener));

    let client = Client::connect(addr, contracts).await.unwrap();
    for _ in 0..3 {
        let rtt = client.ping(Duration::from_secs(1)).await.unwrap();
        println!("pong in {rtt:?}");
    }
}
