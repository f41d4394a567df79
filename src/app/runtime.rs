//! Runtime - Configuration-driven pipeline construction
//!
//! The runtime is responsible for:
//! - Building the dialer registry, policy manager and dispatcher
//! - Building one inbound handler per configured inbound
//! - Running TCP and UDP listeners for every inbound network
//! - Managing lifecycle (Ctrl+C cancels every connection scope)

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::common::{Address, Destination, Network, RequestScope, Result};
use crate::config::{shadowsocks_outbound_unsupported, Config, InboundSettings, OutboundConfig, OutboundSettings};
use crate::protocol::ShadowsocksInbound;
use crate::transport::{DialerRegistry, PacketConn, SocketConfig, TcpInbound, UdpHub};

use super::dispatcher::{DirectDispatcher, Dispatcher};
use super::door::{Door, InboundConnection, InboundHandler};
use super::policy::{PolicyManager, StaticPolicyManager};

/// One configured inbound
struct Inbound {
    tag: String,
    listen: SocketAddr,
    sockopt: SocketConfig,
    handler: Arc<dyn InboundHandler>,
}

/// Runtime manages the proxy system lifecycle
pub struct Runtime {
    inbounds: Vec<Arc<Inbound>>,
    dispatcher: Arc<dyn Dispatcher>,
    registry: Arc<DialerRegistry>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Runtime {
    /// Build runtime from configuration
    ///
    /// Must be called within a tokio runtime.
    pub fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;

        let registry = Arc::new(DialerRegistry::with_defaults());
        let policy: Arc<dyn PolicyManager> = Arc::new(StaticPolicyManager::from_levels(&config.policy.levels));
        let dispatcher = Self::build_dispatcher(&config.outbound, registry.clone())?;

        let mut inbounds = Vec::with_capacity(config.inbounds.len());
        for inbound in &config.inbounds {
            let handler: Arc<dyn InboundHandler> = match inbound.settings()? {
                InboundSettings::Door(door) => {
                    Arc::new(Door::new(door, policy.clone(), Some(inbound.sockopt.clone()))?)
                }
                InboundSettings::Shadowsocks(ss) => Arc::new(ShadowsocksInbound::new(ss.build()?, policy.clone())?),
            };

            inbounds.push(Arc::new(Inbound {
                tag: inbound.tag.clone(),
                listen: inbound.listen,
                sockopt: inbound.sockopt.clone(),
                handler,
            }));
        }

        Ok(Self {
            inbounds,
            dispatcher,
            registry,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    fn build_dispatcher(config: &OutboundConfig, registry: Arc<DialerRegistry>) -> Result<Arc<dyn Dispatcher>> {
        match config.settings()? {
            OutboundSettings::Freedom(freedom) => {
                let mut dispatcher = DirectDispatcher::new(&config.tag, registry, config.stream_settings.clone());
                if let Some(server) = freedom.redirect_destination()? {
                    dispatcher = dispatcher.with_tunnel(Destination::tcp(server));
                }
                Ok(Arc::new(dispatcher))
            }
            OutboundSettings::Shadowsocks(ss) => {
                ss.build()?;
                Err(shadowsocks_outbound_unsupported(&config.tag))
            }
        }
    }

    /// Bind every listener and start accepting. Returns the bound addresses.
    pub async fn start(&self) -> Result<Vec<SocketAddr>> {
        let mut bound = Vec::new();

        for inbound in &self.inbounds {
            for network in inbound.handler.network() {
                let listen = Address::Socket(inbound.listen);
                let task = match network {
                    Network::Tcp => {
                        let listener = TcpInbound::bind(&listen, inbound.sockopt.clone()).await?;
                        let local = listener.local_addr()?;
                        bound.extend(local.as_socket());
                        info!("[{}] Listening on {} (tcp)", inbound.tag, local);
                        tokio::spawn(run_tcp(
                            inbound.clone(),
                            listener,
                            self.dispatcher.clone(),
                            self.shutdown.clone(),
                        ))
                    }
                    Network::Udp => {
                        let hub = UdpHub::bind(&listen, &inbound.sockopt)?;
                        let local = hub.local_addr()?;
                        bound.push(local);
                        info!("[{}] Listening on {} (udp)", inbound.tag, local);
                        tokio::spawn(run_udp(inbound.clone(), hub, self.dispatcher.clone(), self.shutdown.clone()))
                    }
                };
                self.tasks.lock().push(task);
            }
        }

        Ok(bound)
    }

    /// Run until Ctrl+C
    pub async fn run(&self) -> Result<()> {
        self.start().await?;
        info!("Runtime started with {} inbounds", self.inbounds.len());

        tokio::signal::ctrl_c().await?;
        info!("Shutting down...");

        self.shutdown().await;
        Ok(())
    }

    /// Stop listeners, cancel every connection and release pooled transports.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        self.registry.close().await;
    }
}

fn connection_scope(inbound: &Inbound, shutdown: &CancellationToken, source: SocketAddr) -> RequestScope {
    RequestScope::new(shutdown.child_token())
        .with_inbound_tag(inbound.tag.clone())
        .with_source(source)
}

/// Run a TCP listener
async fn run_tcp(
    inbound: Arc<Inbound>,
    listener: TcpInbound,
    dispatcher: Arc<dyn Dispatcher>,
    shutdown: CancellationToken,
) {
    let mut conn_count: u64 = 0;

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok(accepted) => {
                        conn_count += 1;
                        let conn_id = conn_count;
                        let source = accepted.peer;
                        debug!("[{}] New connection #{} from {}", inbound.tag, conn_id, source);

                        let mut scope = connection_scope(&inbound, &shutdown, source);
                        if let Some(original) = accepted.original_destination {
                            scope = scope.with_redirect_target(Destination::tcp(original));
                        }

                        let conn = InboundConnection::stream(source, Box::new(accepted.stream));
                        let inbound = inbound.clone();
                        let dispatcher = dispatcher.clone();
                        tokio::spawn(async move {
                            if let Err(e) = inbound.handler.process(&scope, Network::Tcp, conn, dispatcher).await {
                                warn!("[{}] Connection #{} from {} error: {}", inbound.tag, conn_id, source, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("[{}] Accept error: {}", inbound.tag, e);
                    }
                }
            }
            _ = shutdown.cancelled() => {
                info!("[{}] Shutting down tcp (handled {} connections)", inbound.tag, conn_count);
                break;
            }
        }
    }
}

/// Run a UDP listener; every new source address becomes one connection
async fn run_udp(inbound: Arc<Inbound>, hub: UdpHub, dispatcher: Arc<dyn Dispatcher>, shutdown: CancellationToken) {
    let mut session_count: u64 = 0;

    loop {
        tokio::select! {
            result = hub.accept() => {
                match result {
                    Ok(session) => {
                        session_count += 1;
                        let source = session.peer_addr();
                        debug!("[{}] New udp session #{} from {}", inbound.tag, session_count, source);

                        let mut scope = connection_scope(&inbound, &shutdown, source);
                        if let Some(original) = session.original_destination() {
                            scope = scope.with_redirect_target(original.clone());
                        }

                        let conn = InboundConnection::packet(session);
                        let inbound = inbound.clone();
                        let dispatcher = dispatcher.clone();
                        tokio::spawn(async move {
                            if let Err(e) = inbound.handler.process(&scope, Network::Udp, conn, dispatcher).await {
                                warn!("[{}] Udp session from {} error: {}", inbound.tag, source, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("[{}] Receive error: {}", inbound.tag, e);
                    }
                }
            }
            _ = shutdown.cancelled() => {
                info!("[{}] Shutting down udp (handled {} sessions)", inbound.tag, session_count);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream, UdpSocket};

    fn door_config(target: SocketAddr, networks: &str) -> Config {
        Config::from_json(&format!(
            r#"{{
                "inbounds": [{{
                    "tag": "door-in",
                    "protocol": "door",
                    "listen": "127.0.0.1:0",
                    "settings": {{ "address": "{}", "port": {}, "networks": {} }}
                }}]
            }}"#,
            target.ip(),
            target.port(),
            networks
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn test_tcp_forwarding() {
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = upstream.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut conn, _) = upstream.accept().await.unwrap();
            let mut buf = [0u8; 5];
            conn.read_exact(&mut buf).await.unwrap();
            conn.write_all(&buf).await.unwrap();
        });

        let runtime = Runtime::from_config(&door_config(target, r#"["tcp"]"#)).unwrap();
        let bound = runtime.start().await.unwrap();
        assert_eq!(bound.len(), 1);

        let mut client = TcpStream::connect(bound[0]).await.unwrap();
        client.write_all(b"hello").await.unwrap();
        let mut reply = [0u8; 5];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"hello");

        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_udp_forwarding() {
        let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = upstream.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (n, from) = upstream.recv_from(&mut buf).await.unwrap();
            upstream.send_to(&buf[..n], from).await.unwrap();
        });

        let runtime = Runtime::from_config(&door_config(target, r#"["udp"]"#)).unwrap();
        let bound = runtime.start().await.unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"query", bound[0]).await.unwrap();
        let mut buf = [0u8; 64];
        let (n, from) = client.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"query");
        assert_eq!(from, bound[0]);

        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_plain_shadowsocks_forwarding() {
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = upstream.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut conn, _) = upstream.accept().await.unwrap();
            let mut buf = [0u8; 5];
            conn.read_exact(&mut buf).await.unwrap();
            conn.write_all(&buf).await.unwrap();
        });

        let config = Config::from_json(
            r#"{
                "inbounds": [{
                    "tag": "ss-in",
                    "protocol": "shadowsocks",
                    "listen": "127.0.0.1:0",
                    "settings": { "method": "none", "password": "secret" }
                }]
            }"#,
        )
        .unwrap();
        let runtime = Runtime::from_config(&config).unwrap();
        let bound = runtime.start().await.unwrap();
        assert_eq!(bound.len(), 1);

        let SocketAddr::V4(target) = target else {
            panic!("expected an ipv4 listener");
        };
        let mut request = vec![0x01];
        request.extend_from_slice(&target.ip().octets());
        request.extend_from_slice(&target.port().to_be_bytes());
        request.extend_from_slice(b"hello");

        let mut client = TcpStream::connect(bound[0]).await.unwrap();
        client.write_all(&request).await.unwrap();
        let mut reply = [0u8; 5];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"hello");

        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_encrypted_shadowsocks_inbound_is_unsupported() {
        let mut config = Config::default_example();
        config.inbounds[0].protocol = crate::config::InboundProtocol::Shadowsocks;
        config.inbounds[0].settings = serde_json::json!({ "method": "aes-128-gcm", "password": "p" });
        assert!(matches!(Runtime::from_config(&config), Err(Error::Unsupported(_))));
    }

    #[tokio::test]
    async fn test_shadowsocks_outbound_is_unsupported() {
        let mut config = Config::default_example();
        config.outbound = serde_json::from_str(
            r#"{
                "protocol": "shadowsocks",
                "settings": { "servers": [{ "address": "ss.example", "port": 8388, "method": "aes-128-gcm", "password": "p" }] }
            }"#,
        )
        .unwrap();
        assert!(matches!(Runtime::from_config(&config), Err(Error::Unsupported(_))));
    }
}
