//! TCP echo through a door, a direct dispatcher and a real listener

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use relaycore::app::{DirectDispatcher, Door, DoorConfig, InboundConnection, InboundHandler, StaticPolicyManager};
use relaycore::common::{Address, Network, RequestScope};
use relaycore::transport::{DialerRegistry, SocketConfig, StreamSettings, TcpDialer, TcpInbound};

async fn echo_server() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut conn, _) = listener.accept().await.unwrap();
        let mut data = Vec::new();
        conn.read_to_end(&mut data).await.unwrap();
        conn.write_all(&data).await.unwrap();
        conn.shutdown().await.unwrap();
    });
    addr
}

#[tokio::test]
async fn test_tcp_echo_with_client_half_close() {
    let upstream = echo_server().await;

    let door = Door::new(
        DoorConfig {
            address: Some(upstream.ip().to_string()),
            port: upstream.port(),
            networks: vec![Network::Tcp],
            ..Default::default()
        },
        Arc::new(StaticPolicyManager::new()),
        None,
    )
    .unwrap();

    let mut registry = DialerRegistry::new();
    registry.register(Arc::new(TcpDialer::new()));
    let dispatcher = Arc::new(DirectDispatcher::new("direct", Arc::new(registry), StreamSettings::default()));

    let inbound = TcpInbound::bind(&Address::from(("127.0.0.1", 0)), SocketConfig::default())
        .await
        .unwrap();
    let listen = inbound.local_addr().unwrap().as_socket().unwrap();

    let pipeline = tokio::spawn(async move {
        let accepted = inbound.accept().await.unwrap();
        let scope = RequestScope::default().with_inbound_tag("door-in").with_source(accepted.peer);
        let conn = InboundConnection::stream(accepted.peer, Box::new(accepted.stream));
        door.process(&scope, Network::Tcp, conn, dispatcher).await
    });

    let mut client = TcpStream::connect(listen).await.unwrap();
    let payload = vec![0x5a; 100 * 1024];
    client.write_all(&payload).await.unwrap();
    client.shutdown().await.unwrap();

    let mut reply = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), client.read_to_end(&mut reply))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply.len(), payload.len());
    assert_eq!(reply, payload);

    let result = tokio::time::timeout(Duration::from_secs(10), pipeline).await.unwrap().unwrap();
    assert!(result.is_ok(), "pipeline ended with {:?}", result);
}

#[tokio::test]
async fn test_unreachable_destination_fails_dispatch() {
    let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target = closed.local_addr().unwrap();
    drop(closed);

    let door = Door::new(
        DoorConfig {
            address: Some(target.ip().to_string()),
            port: target.port(),
            networks: vec![Network::Tcp],
            ..Default::default()
        },
        Arc::new(StaticPolicyManager::new()),
        None,
    )
    .unwrap();

    let mut registry = DialerRegistry::new();
    registry.register(Arc::new(TcpDialer::new()));
    let dispatcher = Arc::new(DirectDispatcher::new("direct", Arc::new(registry), StreamSettings::default()));

    let (a, _b) = tokio::io::duplex(64);
    let conn = InboundConnection::stream("127.0.0.1:1".parse().unwrap(), Box::new(a));
    let result = door.process(&RequestScope::default(), Network::Tcp, conn, dispatcher).await;
    assert!(matches!(result, Err(relaycore::Error::Dispatch(_))));
}
