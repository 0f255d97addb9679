use crate::adapter::USER_AGENT;
use crate::proxy::error::TransportError;
use crate::proxy::{relay_bidirectional, DirectionalStream, Dispatcher, NetworkAddr};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

const MAX_REQUEST_HEAD: usize = 8 * 1024;
const RESPONSE_200: &str = "HTTP/1.1 200 Connection Established\r\n\r\n";
const RESPONSE_502: &str = "HTTP/1.1 502 Bad Gateway\r\n\r\n";

pub struct HttpInbound {
    port: u16,
    server: TcpListener,
    dispatcher: Arc<Dispatcher>,
}

impl HttpInbound {
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
        tracing::info!("[HTTP] Listen proxy at 127.0.0.1:{}, running...", self.port);
        loop {
            match self.server.accept().await {
                Ok((socket, _)) => {
                    let dispatcher = self.dispatcher.clone();
                    tokio::spawn(async move {
                        if let Err(err) = Self::serve_connection(socket, dispatcher).await {
                            tracing::debug!("[HTTP] connection closed: {}", err);
                        }
                    });
                }
                Err(err) => {
                    tracing::error!("[HTTP] inbound failed to accept: {}", err);
                    return;
                }
            }
        }
    }

    async fn serve_connection(
        socket: TcpStream,
        dispatcher: Arc<Dispatcher>,
    ) -> Result<(), TransportError> {
        let mut reader = BufReader::new(socket);
        let mut head = String::new();
        while !head.ends_with("\r\n\r\n") {
            if reader.read_line(&mut head).await? == 0 {
                return Err(TransportError::Http("EOF while reading request head"));
            }
            if head.len() > MAX_REQUEST_HEAD {
                return Err(TransportError::Http("request head too long"));
            }
        }
        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut parsed = httparse::Request::new(&mut headers);
        parsed
            .parse(head.as_bytes())
            .map_err(|_| TransportError::Http("malformed request head"))?;
        let method = parsed
            .method
            .ok_or(TransportError::Http("missing method"))?
            .to_string();
        let path = parsed
            .path
            .ok_or(TransportError::Http("missing request target"))?
            .to_string();
        let version = parsed.version.unwrap_or(1);
        let request_headers: Vec<(String, String)> = parsed
            .headers
            .iter()
            .map(|h| {
                (
                    h.name.to_string(),
                    String::from_utf8_lossy(h.value).to_string(),
                )
            })
            .collect();

        if method == "CONNECT" {
            Self::serve_tunnel(reader, &path, dispatcher).await
        } else {
            Self::serve_forward(reader, &method, version, &path, &request_headers, dispatcher)
                .await
        }
    }

    async fn serve_tunnel(
        mut client: BufReader<TcpStream>,
        authority: &str,
        dispatcher: Arc<Dispatcher>,
    ) -> Result<(), TransportError> {
        let dst = match NetworkAddr::parse(authority) {
            Ok(dst) => dst,
            Err(err) => {
                client.write_all(RESPONSE_502.as_bytes()).await?;
                return Err(err);
            }
        };
        let label = dispatcher.route(&dst);
        tracing::debug!("[HTTP] CONNECT {} matched proxy source {}", dst, label);
        let upstream = match dispatcher.connect(&label, &dst).await {
            Ok(upstream) => upstream,
            Err(err) => {
                tracing::info!("[HTTP] connect {} via {} failed: {}", dst, label, err);
                client.write_all(RESPONSE_502.as_bytes()).await?;
                return Ok(());
            }
        };
        client.write_all(RESPONSE_200.as_bytes()).await?;
        client.flush().await?;

        let collector = dispatcher.collector(&label);
        let client = DirectionalStream::new(client, collector, true);
        relay_bidirectional(client, upstream).await;
        Ok(())
    }

    async fn serve_forward(
        mut client: BufReader<TcpStream>,
        method: &str,
        version: u8,
        target: &str,
        request_headers: &[(String, String)],
        dispatcher: Arc<Dispatcher>,
    ) -> Result<(), TransportError> {
        let uri: http::Uri = target
            .parse()
            .map_err(|_| TransportError::Http("invalid absolute-form URI"))?;
        let host = uri.host().ok_or(TransportError::Http("URI without host"))?;
        let https = uri.scheme_str() == Some("https");
        let port = uri.port_u16().unwrap_or(if https { 443 } else { 80 });
        let host = host.trim_start_matches('[').trim_end_matches(']');
        let dst = match host.parse::<IpAddr>() {
            Ok(ip) => NetworkAddr::Raw(SocketAddr::new(ip, port)),
            Err(_) => NetworkAddr::DomainName {
                domain_name: host.to_string(),
                port,
            },
        };
        let label = dispatcher.route(&dst);
        tracing::debug!("[HTTP] {} {} matched proxy source {}", method, dst, label);
        let upstream = match dispatcher.connect(&label, &dst).await {
            Ok(upstream) => upstream,
            Err(err) => {
                tracing::info!("[HTTP] connect {} via {} failed: {}", dst, label, err);
                client.write_all(RESPONSE_502.as_bytes()).await?;
                return Ok(());
            }
        };

        let collector = dispatcher.collector(&label);
        // the upstream side carries the accounting: the rebuilt head must be
        // attributed as upload before the splice takes over
        let mut upstream = DirectionalStream::new(upstream, collector, false);
        let head = rebuild_request_head(method, version, &uri, &dst, request_headers);
        if upstream.write_all(head.as_bytes()).await.is_err() {
            client.write_all(RESPONSE_502.as_bytes()).await?;
            return Ok(());
        }
        relay_bidirectional(client, upstream).await;
        Ok(())
    }
}

/// Egress request line and headers for forward-mode requests: origin-form
/// target, rewritten Host, hop-by-hop headers stripped, connection pinned
/// closed.
fn rebuild_request_head(
    method: &str,
    version: u8,
    uri: &http::Uri,
    dst: &NetworkAddr,
    request_headers: &[(String, String)],
) -> String {
    const HOP_BY_HOP: [&str; 5] = [
        "Proxy-Connection",
        "Proxy-Authorization",
        "Connection",
        "Upgrade",
        "Accept-Encoding",
    ];
    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let mut head = format!(
        "{} {} HTTP/1.{}\r\nHost: {}\r\n",
        method, path_and_query, version, dst
    );
    let mut has_user_agent = false;
    for (name, value) in request_headers {
        if name.eq_ignore_ascii_case("Host")
            || HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
        {
            continue;
        }
        if name.eq_ignore_ascii_case("User-Agent") {
            has_user_agent = true;
        }
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    if !has_user_agent {
        head.push_str("User-Agent: ");
        head.push_str(USER_AGENT);
        head.push_str("\r\n");
    }
    head.push_str("Connection: close\r\n\r\n");
    head
}
