use crate::proxy::error::TransportError;
use crate::proxy::NetworkAddr;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

mod direct;
mod http;
mod openvpn;
mod registry;
mod shadowsocks;
mod socks5;
mod stub;

pub use direct::DirectOutbound;
pub use http::HttpOutbound;
pub use openvpn::OpenVpnOutbound;
pub use registry::{OutboundRegistry, DIRECT_LABEL};
pub use shadowsocks::ShadowsocksOutbound;
pub use socks5::Socks5Outbound;
pub use stub::StubOutbound;

pub const DIAL_TIMEOUT: Duration = Duration::from_secs(5);
pub(crate) const USER_AGENT: &str = "dualproxy/0.1";

/// Anything that can carry relay payload in both directions.
pub trait ProxyStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ProxyStream for T {}

pub type BoxedStream = Box<dyn ProxyStream>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboundType {
    Direct,
    Http,
    Https,
    Socks5,
    Shadowsocks,
    ShadowsocksR,
    Openvpn,
    Wireguard,
    Ipsec,
    L2tp,
    Pptp,
    Vmess,
    Trojan,
    Snell,
    Ikev2,
    Softether,
    Vless,
}

impl Display for OutboundType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            OutboundType::Direct => "direct",
            OutboundType::Http => "http",
            OutboundType::Https => "https",
            OutboundType::Socks5 => "socks5",
            OutboundType::Shadowsocks => "shadowsocks",
            OutboundType::ShadowsocksR => "shadowsocksr",
            OutboundType::Openvpn => "openvpn",
            OutboundType::Wireguard => "wireguard",
            OutboundType::Ipsec => "ipsec",
            OutboundType::L2tp => "l2tp",
            OutboundType::Pptp => "pptp",
            OutboundType::Vmess => "vmess",
            OutboundType::Trojan => "trojan",
            OutboundType::Snell => "snell",
            OutboundType::Ikev2 => "ikev2",
            OutboundType::Softether => "softether",
            OutboundType::Vless => "vless",
        };
        f.write_str(name)
    }
}

/// An egress transport: resolves a destination into an upstream byte stream.
#[async_trait]
pub trait Outbound: Send + Sync {
    fn name(&self) -> &str;

    fn outbound_type(&self) -> OutboundType;

    /// Whether the transport can currently serve connects.
    fn is_running(&self) -> bool {
        true
    }

    async fn connect(&self, dst: &NetworkAddr) -> Result<BoxedStream, TransportError>;

    /// Tear down background state. Invoked when the registry entry is
    /// replaced or removed.
    async fn close(&self) {}
}

/// Instantiate a transport from its control-plane description.
pub fn build_outbound(
    kind: OutboundType,
    name: &str,
    server: &str,
    port: u16,
    config: &HashMap<String, serde_json::Value>,
) -> Result<Arc<dyn Outbound>, TransportError> {
    Ok(match kind {
        OutboundType::Direct => Arc::new(DirectOutbound::new(name)),
        OutboundType::Http | OutboundType::Https => Arc::new(HttpOutbound::new(
            name,
            server,
            port,
            cfg_str(config, "username"),
            cfg_str(config, "password"),
        )),
        OutboundType::Socks5 => Arc::new(Socks5Outbound::new(name, server, port)),
        OutboundType::Shadowsocks => {
            Arc::new(ShadowsocksOutbound::new(name, server, port, config)?)
        }
        OutboundType::Openvpn => Arc::new(OpenVpnOutbound::new(name, config)),
        other => Arc::new(StubOutbound::new(name, other)),
    })
}

pub(crate) fn cfg_str<'a>(
    config: &'a HashMap<String, serde_json::Value>,
    key: &str,
) -> Option<&'a str> {
    config.get(key).and_then(|v| v.as_str())
}

pub(crate) fn server_addr(server: &str, port: u16) -> NetworkAddr {
    match server.parse::<IpAddr>() {
        Ok(ip) => NetworkAddr::Raw(SocketAddr::new(ip, port)),
        Err(_) => NetworkAddr::DomainName {
            domain_name: server.to_string(),
            port,
        },
    }
}

/// TCP dial with a hard deadline. Every egress path funnels through here so
/// no connect can hang past its timeout.
pub(crate) async fn dial_tcp(
    addr: &NetworkAddr,
    timeout: Duration,
) -> Result<TcpStream, TransportError> {
    let dial = async {
        match addr {
            NetworkAddr::Raw(addr) => TcpStream::connect(*addr).await,
            NetworkAddr::DomainName { domain_name, port } => {
                TcpStream::connect((domain_name.as_str(), *port)).await
            }
        }
    };
    match tokio::time::timeout(timeout, dial).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(err)) => Err(TransportError::Io(err)),
        Err(_) => Err(TransportError::DialTimeout(addr.to_string(), timeout)),
    }
}
