mod dispatcher;
pub mod error;
mod http_inbound;
mod manager;
mod relay;
mod socks5_inbound;
mod stats;

pub use dispatcher::Dispatcher;
pub use http_inbound::HttpInbound;
pub use manager::{ProxyInfo, ProxySource, SourceManager};
pub use relay::{relay_bidirectional, DirectionalStream};
pub use socks5_inbound::Socks5Inbound;
pub use stats::{format_speed, SourceStatsCollector, StatCenter};

use crate::proxy::error::TransportError;
use fast_socks5::util::target_addr::TargetAddr;
use std::fmt::{Display, Formatter};
use std::net::SocketAddr;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NetworkAddr {
    Raw(SocketAddr),
    DomainName { domain_name: String, port: u16 },
}

impl NetworkAddr {
    pub fn port(&self) -> u16 {
        match self {
            NetworkAddr::Raw(addr) => addr.port(),
            NetworkAddr::DomainName { port, .. } => *port,
        }
    }

    /// Parse a `host:port` destination. IPv6 hosts must be bracketed.
    pub fn parse(destination: &str) -> Result<Self, TransportError> {
        if let Ok(addr) = destination.parse::<SocketAddr>() {
            return Ok(NetworkAddr::Raw(addr));
        }
        let (host, port) = destination
            .rsplit_once(':')
            .ok_or_else(|| TransportError::BadDestination(destination.to_string()))?;
        let port: u16 = port
            .parse()
            .map_err(|_| TransportError::BadDestination(destination.to_string()))?;
        if host.is_empty() {
            return Err(TransportError::BadDestination(destination.to_string()));
        }
        Ok(NetworkAddr::DomainName {
            domain_name: host.to_string(),
            port,
        })
    }
}

impl Display for NetworkAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            NetworkAddr::Raw(addr) => write!(f, "{}", addr),
            NetworkAddr::DomainName { domain_name, port } => {
                write!(f, "{}:{}", domain_name, port)
            }
        }
    }
}

impl From<TargetAddr> for NetworkAddr {
    fn from(value: TargetAddr) -> Self {
        match value {
            TargetAddr::Ip(addr) => NetworkAddr::Raw(addr),
            TargetAddr::Domain(domain_name, port) => NetworkAddr::DomainName { domain_name, port },
        }
    }
}
