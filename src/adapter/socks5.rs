use crate::adapter::{
    dial_tcp, server_addr, BoxedStream, Outbound, OutboundType, DIAL_TIMEOUT,
};
use crate::proxy::error::TransportError;
use crate::proxy::NetworkAddr;
use async_trait::async_trait;
use fast_socks5::consts;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const REPLY_TIMEOUT: Duration = Duration::from_secs(30);

pub struct Socks5Outbound {
    name: String,
    server: NetworkAddr,
}

impl Socks5Outbound {
    pub fn new(name: &str, server: &str, port: u16) -> Self {
        Self {
            name: name.to_string(),
            server: server_addr(server, port),
        }
    }

    async fn handshake(mut stream: TcpStream, dst: &NetworkAddr) -> Result<TcpStream, TransportError> {
        stream
            .write_all(&[
                consts::SOCKS5_VERSION,
                1,
                consts::SOCKS5_AUTH_METHOD_NONE,
            ])
            .await?;
        let mut choice = [0u8; 2];
        stream.read_exact(&mut choice).await?;
        if choice[0] != consts::SOCKS5_VERSION {
            return Err(TransportError::Socks5Extra("unexpected greeting version"));
        }
        if choice[1] != consts::SOCKS5_AUTH_METHOD_NONE {
            return Err(TransportError::AuthUnsupported);
        }

        stream.write_all(&encode_connect_request(dst)?).await?;
        let mut head = [0u8; 4];
        stream.read_exact(&mut head).await?;
        if head[0] != consts::SOCKS5_VERSION {
            return Err(TransportError::Socks5Extra("unexpected reply version"));
        }
        if head[1] != consts::SOCKS5_REPLY_SUCCEEDED {
            return Err(TransportError::UpstreamRejected(format!(
                "SOCKS5 reply {:#04x}: {}",
                head[1],
                reply_code_message(head[1])
            )));
        }
        // consume the variable-length bind address
        match head[3] {
            consts::SOCKS5_ADDR_TYPE_IPV4 => {
                stream.read_exact(&mut [0u8; 6]).await?;
            }
            consts::SOCKS5_ADDR_TYPE_IPV6 => {
                stream.read_exact(&mut [0u8; 18]).await?;
            }
            consts::SOCKS5_ADDR_TYPE_DOMAIN_NAME => {
                let mut len = [0u8; 1];
                stream.read_exact(&mut len).await?;
                let mut rest = vec![0u8; len[0] as usize + 2];
                stream.read_exact(&mut rest).await?;
            }
            _ => return Err(TransportError::Socks5Extra("unexpected bind address type")),
        }
        Ok(stream)
    }
}

#[async_trait]
impl Outbound for Socks5Outbound {
    fn name(&self) -> &str {
        &self.name
    }

    fn outbound_type(&self) -> OutboundType {
        OutboundType::Socks5
    }

    async fn connect(&self, dst: &NetworkAddr) -> Result<BoxedStream, TransportError> {
        let stream = dial_tcp(&self.server, DIAL_TIMEOUT).await?;
        let stream = tokio::time::timeout(REPLY_TIMEOUT, Self::handshake(stream, dst))
            .await
            .map_err(|_| TransportError::Socks5Extra("handshake timed out"))??;
        Ok(Box::new(stream))
    }
}

/// `[VER, CMD, RSV, ATYP, addr..., port_hi, port_lo]` with the ATYP picked
/// from the destination: IPv4 literal, IPv6 literal, else domain name.
pub(crate) fn encode_connect_request(dst: &NetworkAddr) -> Result<Vec<u8>, TransportError> {
    let mut buf = vec![
        consts::SOCKS5_VERSION,
        consts::SOCKS5_CMD_TCP_CONNECT,
        0x00,
    ];
    match dst {
        NetworkAddr::Raw(SocketAddr::V4(addr)) => {
            buf.push(consts::SOCKS5_ADDR_TYPE_IPV4);
            buf.extend_from_slice(&addr.ip().octets());
        }
        NetworkAddr::Raw(SocketAddr::V6(addr)) => {
            buf.push(consts::SOCKS5_ADDR_TYPE_IPV6);
            buf.extend_from_slice(&addr.ip().octets());
        }
        NetworkAddr::DomainName { domain_name, .. } => match domain_name.parse::<IpAddr>() {
            Ok(IpAddr::V4(ip)) => {
                buf.push(consts::SOCKS5_ADDR_TYPE_IPV4);
                buf.extend_from_slice(&ip.octets());
            }
            Ok(IpAddr::V6(ip)) => {
                buf.push(consts::SOCKS5_ADDR_TYPE_IPV6);
                buf.extend_from_slice(&ip.octets());
            }
            Err(_) => {
                if domain_name.len() > 255 {
                    return Err(TransportError::BadDestination(domain_name.clone()));
                }
                buf.push(consts::SOCKS5_ADDR_TYPE_DOMAIN_NAME);
                buf.push(domain_name.len() as u8);
                buf.extend_from_slice(domain_name.as_bytes());
            }
        },
    }
    buf.extend_from_slice(&dst.port().to_be_bytes());
    Ok(buf)
}

fn reply_code_message(code: u8) -> &'static str {
    match code {
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unassigned reply code",
    }
}
