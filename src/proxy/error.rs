use crate::adapter::OutboundType;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("dial to {0} timed out after {1:?}")]
    DialTimeout(String, Duration),
    #[error("unknown proxy source: {0}")]
    Unknown(String),
    #[error("upstream rejected: {0}")]
    UpstreamRejected(String),
    #[error("upstream offered no acceptable authentication method")]
    AuthUnsupported,
    #[error("HTTP proxy error: {0}")]
    Http(&'static str),
    #[error("SOCKS5 error: {0}")]
    Socks5(#[from] fast_socks5::SocksError),
    #[error("SOCKS5 error: {0}")]
    Socks5Extra(&'static str),
    #[error("Shadowsocks error: {0}")]
    ShadowSocks(&'static str),
    #[error("bad destination: {0}")]
    BadDestination(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("{0} outbound is not implemented")]
    NotImplemented(OutboundType),
    #[error("tunnel not ready")]
    TunnelNotReady,
    #[error("tunnel startup timed out")]
    TunnelTimeout,
    #[error("failed to spawn tunnel process: {0}")]
    SpawnFailed(std::io::Error),
}
