use crate::proxy::error::TransportError;
use crate::proxy::{relay_bidirectional, DirectionalStream, Dispatcher, NetworkAddr};
use fast_socks5::util::target_addr::read_address;
use fast_socks5::{consts, read_exact};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub struct Socks5Inbound {
    port: u16,
    server: TcpListener,
    dispatcher: Arc<Dispatcher>,
}

impl Socks5Inbound {
    pub async fn new(port: u16, dispatcher: Arc<Dispatcher>) -> io::Result<Self> {
        let server =
            TcpListener::bind(SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), port)).await?;
        Ok(Self {
            port,
            server,
            dispatcher,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.server.local_addr()
    }

    pub async fn run(self) {
        tracing::info!(
            "[Socks5] Listen proxy at 127.0.0.1:{}, running...",
            self.port
        );
        loop {
            match self.server.accept().await {
                Ok((socket, _)) => {
                    let dispatcher = self.dispatcher.clone();
                    tokio::spawn(async move {
                        if let Err(err) = Self::serve_connection(socket, dispatcher).await {
                            tracing::debug!("[Socks5] connection closed: {}", err);
                        }
                    });
                }
                Err(err) => {
                    tracing::error!("[Socks5] inbound failed to accept: {}", err);
                    return;
                }
            }
        }
    }

    async fn serve_connection(
        mut socket: TcpStream,
        dispatcher: Arc<Dispatcher>,
    ) -> Result<(), TransportError> {
        let [version, method_len] = read_exact!(socket, [0u8; 2])?;
        if version != consts::SOCKS5_VERSION {
            return Err(TransportError::Socks5Extra("unsupported SOCKS version"));
        }
        let methods = read_exact!(socket, vec![0u8; method_len as usize])?;
        if !methods.contains(&consts::SOCKS5_AUTH_METHOD_NONE) {
            socket
                .write_all(&[
                    consts::SOCKS5_VERSION,
                    consts::SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE,
                ])
                .await?;
            return Err(TransportError::Socks5Extra("no acceptable auth method"));
        }
        socket
            .write_all(&[consts::SOCKS5_VERSION, consts::SOCKS5_AUTH_METHOD_NONE])
            .await?;

        let [version, cmd, _rsv, address_type] = read_exact!(socket, [0u8; 4])?;
        if version != consts::SOCKS5_VERSION {
            return Err(TransportError::Socks5Extra("unsupported SOCKS version"));
        }
        if cmd != consts::SOCKS5_CMD_TCP_CONNECT {
            socket
                .write_all(&Self::reply(consts::SOCKS5_REPLY_COMMAND_NOT_SUPPORTED))
                .await?;
            return Err(TransportError::Socks5Extra("command not supported"));
        }
        let dst: NetworkAddr = read_address(&mut socket, address_type)
            .await
            .map_err(|e| TransportError::BadDestination(e.to_string()))?
            .into();

        let label = dispatcher.route(&dst);
        tracing::debug!("[Socks5] CONNECT {} matched proxy source {}", dst, label);
        let upstream = match dispatcher.connect(&label, &dst).await {
            Ok(upstream) => upstream,
            Err(err) => {
                tracing::info!("[Socks5] connect {} via {} failed: {}", dst, label, err);
                socket
                    .write_all(&Self::reply(consts::SOCKS5_REPLY_CONNECTION_REFUSED))
                    .await?;
                return Ok(());
            }
        };
        socket
            .write_all(&Self::reply(consts::SOCKS5_REPLY_SUCCEEDED))
            .await?;

        let collector = dispatcher.collector(&label);
        let client = DirectionalStream::new(socket, collector, true);
        relay_bidirectional(client, upstream).await;
        Ok(())
    }

    /// Reply with an all-zero IPv4 bind address; CONNECT clients ignore it.
    fn reply(code: u8) -> [u8; 10] {
        [
            consts::SOCKS5_VERSION,
            code,
            0x00,
            consts::SOCKS5_ADDR_TYPE_IPV4,
            0,
            0,
            0,
            0,
            0,
            0,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::OutboundRegistry;
    use crate::config::RuleSchema;
    use crate::dispatch::Dispatching;
    use crate::proxy::stats::StatCenter;

    async fn spawn_inbound(
        rules: Vec<RuleSchema>,
    ) -> (SocketAddr, Arc<OutboundRegistry>, Arc<Dispatcher>) {
        let registry = Arc::new(OutboundRegistry::new());
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(Dispatching::new(rules)),
            registry.clone(),
            Arc::new(StatCenter::new()),
        ));
        let inbound = Socks5Inbound::new(0, dispatcher.clone()).await.unwrap();
        let addr = inbound.local_addr().unwrap();
        tokio::spawn(inbound.run());
        (addr, registry, dispatcher)
    }

    #[tokio::test]
    async fn test_protocol_roundtrip() {
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = upstream.accept().await.unwrap();
            let mut buf = [0u8; 5];
            socket.read_exact(&mut buf).await.unwrap();
            socket.write_all(&buf).await.unwrap();
        });

        let (addr, _registry, _dispatcher) =
            spawn_inbound(vec![RuleSchema::new("MATCH", "", "DIRECT", true)]).await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut choice = [0u8; 2];
        client.read_exact(&mut choice).await.unwrap();
        assert_eq!(choice, [0x05, 0x00]);

        let SocketAddr::V4(v4) = upstream_addr else {
            panic!("expected v4 listener");
        };
        let mut request = vec![0x05, 0x01, 0x00, 0x01];
        request.extend_from_slice(&v4.ip().octets());
        request.extend_from_slice(&v4.port().to_be_bytes());
        client.write_all(&request).await.unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);

        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn test_unknown_source_refuses_connection() {
        let (addr, _registry, _dispatcher) =
            spawn_inbound(vec![RuleSchema::new("MATCH", "", "ghost", true)]).await;
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut choice = [0u8; 2];
        client.read_exact(&mut choice).await.unwrap();

        client
            .write_all(&[0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1, 0x01, 0xbb])
            .await
            .unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x05, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn test_non_connect_command_rejected() {
        let (addr, _registry, _dispatcher) =
            spawn_inbound(vec![RuleSchema::new("MATCH", "", "DIRECT", true)]).await;
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut choice = [0u8; 2];
        client.read_exact(&mut choice).await.unwrap();

        // UDP ASSOCIATE
        client
            .write_all(&[0x05, 0x03, 0x00, 0x01, 127, 0, 0, 1, 0x00, 0x35])
            .await
            .unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], 0x07);
    }

    #[tokio::test]
    async fn test_auth_only_client_is_refused() {
        let (addr, _registry, _dispatcher) =
            spawn_inbound(vec![RuleSchema::new("MATCH", "", "DIRECT", true)]).await;
        let mut client = TcpStream::connect(addr).await.unwrap();
        // offers only username/password
        client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
        let mut choice = [0u8; 2];
        client.read_exact(&mut choice).await.unwrap();
        assert_eq!(choice, [0x05, 0xff]);
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_domain_destination_reaches_rules() {
        let (addr, _registry, dispatcher) = spawn_inbound(vec![
            RuleSchema::new("DOMAIN", "t.local", "s5up", true),
            RuleSchema::new("MATCH", "", "DIRECT", true),
        ])
        .await;
        // no transport registered under s5up: the route resolves, the dial is
        // refused
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut choice = [0u8; 2];
        client.read_exact(&mut choice).await.unwrap();

        let mut request = vec![0x05, 0x01, 0x00, 0x03, 0x07];
        request.extend_from_slice(b"t.local");
        request.extend_from_slice(&443u16.to_be_bytes());
        client.write_all(&request).await.unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], 0x05);
        // the label was still resolved by the rules engine
        assert!(dispatcher.collector("s5up").upload() == 0);
    }

    #[tokio::test]
    async fn test_chained_through_socks5_egress() {
        // mock upstream SOCKS5 server asserting the egress exchange
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();
        let egress_side = tokio::spawn(async move {
            let (mut socket, _) = upstream.accept().await.unwrap();
            let mut greeting = [0u8; 3];
            socket.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [0x05, 0x01, 0x00]);
            socket.write_all(&[0x05, 0x00]).await.unwrap();

            let mut head = [0u8; 4];
            socket.read_exact(&mut head).await.unwrap();
            assert_eq!(head, [0x05, 0x01, 0x00, 0x03]);
            let mut len = [0u8; 1];
            socket.read_exact(&mut len).await.unwrap();
            let mut name = vec![0u8; len[0] as usize];
            socket.read_exact(&mut name).await.unwrap();
            assert_eq!(name, b"t.local");
            let mut port = [0u8; 2];
            socket.read_exact(&mut port).await.unwrap();
            assert_eq!(u16::from_be_bytes(port), 443);
            socket
                .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();

            let mut buf = [0u8; 7];
            socket.read_exact(&mut buf).await.unwrap();
            socket.write_all(&buf).await.unwrap();
        });

        let (addr, registry, _dispatcher) = spawn_inbound(vec![
            RuleSchema::new("DOMAIN", "t.local", "s5up", true),
            RuleSchema::new("MATCH", "", "DIRECT", true),
        ])
        .await;
        registry.register(
            "s5up",
            Arc::new(crate::adapter::Socks5Outbound::new(
                "s5up",
                &upstream_addr.ip().to_string(),
                upstream_addr.port(),
            )),
        );

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut choice = [0u8; 2];
        client.read_exact(&mut choice).await.unwrap();

        let mut request = vec![0x05, 0x01, 0x00, 0x03, 0x07];
        request.extend_from_slice(b"t.local");
        request.extend_from_slice(&443u16.to_be_bytes());
        client.write_all(&request).await.unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], 0x00);

        client.write_all(b"payload".as_ref()).await.unwrap();
        let mut buf = [0u8; 7];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"payload");
        egress_side.await.unwrap();
    }
}
