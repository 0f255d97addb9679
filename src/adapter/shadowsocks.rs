use crate::adapter::{cfg_str, dial_tcp, BoxedStream, Outbound, OutboundType, DIAL_TIMEOUT};
use crate::proxy::error::TransportError;
use crate::proxy::NetworkAddr;
use async_trait::async_trait;
use shadowsocks::config::ServerType;
use shadowsocks::context::Context;
use shadowsocks::crypto::CipherKind;
use shadowsocks::relay::Address;
use shadowsocks::{ProxyClientStream, ServerAddr, ServerConfig};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};

pub const DEFAULT_CIPHER: &str = "chacha20-ietf-poly1305";

pub struct ShadowsocksOutbound {
    name: String,
    config: ServerConfig,
}

impl ShadowsocksOutbound {
    /// `method` takes precedence over `cipher`; both absent falls back to
    /// chacha20-ietf-poly1305.
    pub fn new(
        name: &str,
        server: &str,
        port: u16,
        config: &HashMap<String, serde_json::Value>,
    ) -> Result<Self, TransportError> {
        let method = cfg_str(config, "method")
            .or_else(|| cfg_str(config, "cipher"))
            .unwrap_or(DEFAULT_CIPHER);
        let password = cfg_str(config, "password").unwrap_or_default();
        let kind = method
            .to_ascii_lowercase()
            .parse::<CipherKind>()
            .map_err(|_| TransportError::Config(format!("unsupported cipher method: {}", method)))?;
        let server_addr = match server.parse::<IpAddr>() {
            Ok(ip) => ServerAddr::SocketAddr(SocketAddr::new(ip, port)),
            Err(_) => ServerAddr::DomainName(server.to_string(), port),
        };
        Ok(Self {
            name: name.to_string(),
            config: ServerConfig::new(server_addr, password.to_string(), kind)
                .map_err(|e| TransportError::Config(e.to_string()))?,
        })
    }
}

#[async_trait]
impl Outbound for ShadowsocksOutbound {
    fn name(&self) -> &str {
        &self.name
    }

    fn outbound_type(&self) -> OutboundType {
        OutboundType::Shadowsocks
    }

    async fn connect(&self, dst: &NetworkAddr) -> Result<BoxedStream, TransportError> {
        let server = match self.config.addr() {
            ServerAddr::SocketAddr(addr) => NetworkAddr::Raw(*addr),
            ServerAddr::DomainName(domain, port) => NetworkAddr::DomainName {
                domain_name: domain.clone(),
                port: *port,
            },
        };
        let stream = dial_tcp(&server, DIAL_TIMEOUT).await?;
        let target = match dst {
            NetworkAddr::Raw(addr) => Address::from(*addr),
            NetworkAddr::DomainName { domain_name, port } => {
                Address::from((domain_name.clone(), *port))
            }
        };
        let context = Context::new_shared(ServerType::Local);
        // the SOCKS-style target address rides as the first plaintext bytes
        // of the encrypted stream
        let ss_stream = ProxyClientStream::from_stream(context, stream, &self.config, target);
        Ok(Box::new(ss_stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn cfg(pairs: &[(&str, &str)]) -> HashMap<String, serde_json::Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), json!(v)))
            .collect()
    }

    #[test]
    fn test_method_takes_precedence_over_cipher() {
        let config = cfg(&[
            ("method", "aes-256-gcm"),
            ("cipher", "chacha20-ietf-poly1305"),
            ("password", "p@ss"),
        ]);
        let outbound = ShadowsocksOutbound::new("ss", "127.0.0.1", 19388, &config).unwrap();
        assert_eq!(outbound.config.method(), CipherKind::AES_256_GCM);
    }

    #[test]
    fn test_cipher_used_when_method_absent() {
        let config = cfg(&[("cipher", "aes-128-gcm"), ("password", "p@ss")]);
        let outbound = ShadowsocksOutbound::new("ss", "127.0.0.1", 19388, &config).unwrap();
        assert_eq!(outbound.config.method(), CipherKind::AES_128_GCM);
    }

    #[test]
    fn test_default_cipher_and_uppercase_names() {
        let config = cfg(&[("password", "p@ss")]);
        let outbound = ShadowsocksOutbound::new("ss", "127.0.0.1", 19388, &config).unwrap();
        assert_eq!(outbound.config.method(), CipherKind::CHACHA20_POLY1305);

        let config = cfg(&[("method", "CHACHA20-IETF-POLY1305"), ("password", "p@ss")]);
        let outbound = ShadowsocksOutbound::new("ss", "127.0.0.1", 19388, &config).unwrap();
        assert_eq!(outbound.config.method(), CipherKind::CHACHA20_POLY1305);
    }

    #[test]
    fn test_unknown_cipher_is_config_error() {
        let config = cfg(&[("method", "rot13"), ("password", "p@ss")]);
        assert!(matches!(
            ShadowsocksOutbound::new("ss", "127.0.0.1", 19388, &config),
            Err(TransportError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_first_bytes_are_encrypted_frame_not_plaintext() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            socket.read_to_end(&mut buf).await.unwrap();
            buf
        });

        let config = cfg(&[("method", "chacha20-ietf-poly1305"), ("password", "p@ss")]);
        let outbound =
            ShadowsocksOutbound::new("ss", &addr.ip().to_string(), addr.port(), &config).unwrap();
        let dst = NetworkAddr::parse("example.org:80").unwrap();
        let mut stream = outbound.connect(&dst).await.unwrap();
        stream.write_all(b"GET / HTTP/1.0\r\n\r\n").await.unwrap();
        stream.flush().await.unwrap();
        drop(stream);

        let wire = server.await.unwrap();
        // 32-byte salt plus AEAD-framed target header and payload
        assert!(wire.len() > 32 + 7);
        let needle = b"example.org";
        assert!(!wire.windows(needle.len()).any(|w| w == needle));
        let payload = b"GET / HTTP/1.0";
        assert!(!wire.windows(payload.len()).any(|w| w == payload));
    }
}
