use crate::adapter::{
    dial_tcp, server_addr, BoxedStream, Outbound, OutboundType, DIAL_TIMEOUT, USER_AGENT,
};
use crate::proxy::error::TransportError;
use crate::proxy::NetworkAddr;
use async_trait::async_trait;
use base64::Engine;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

const MAX_RESPONSE_HEAD: usize = 8 * 1024;
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

pub struct HttpOutbound {
    name: String,
    server: NetworkAddr,
    auth: Option<(String, String)>,
}

impl HttpOutbound {
    pub fn new(
        name: &str,
        server: &str,
        port: u16,
        username: Option<&str>,
        password: Option<&str>,
    ) -> Self {
        let auth = match (username, password) {
            (Some(user), Some(pass)) => Some((user.to_string(), pass.to_string())),
            _ => None,
        };
        Self {
            name: name.to_string(),
            server: server_addr(server, port),
            auth,
        }
    }
}

#[async_trait]
impl Outbound for HttpOutbound {
    fn name(&self) -> &str {
        &self.name
    }

    fn outbound_type(&self) -> OutboundType {
        OutboundType::Http
    }

    async fn connect(&self, dst: &NetworkAddr) -> Result<BoxedStream, TransportError> {
        let mut stream = dial_tcp(&self.server, DIAL_TIMEOUT).await?;

        let mut req = format!(
            "CONNECT {0} HTTP/1.1\r\nHost: {0}\r\nUser-Agent: {1}\r\n",
            dst, USER_AGENT
        );
        if let Some((user, pass)) = &self.auth {
            let encoded =
                base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", user, pass));
            req.push_str(&format!("Proxy-Authorization: Basic {}\r\n", encoded));
        }
        req.push_str("\r\n");
        stream.write_all(req.as_bytes()).await?;
        stream.flush().await?;

        let mut buf_reader = BufReader::new(stream);
        let mut resp = String::new();
        let read_head = async {
            while !resp.ends_with("\r\n\r\n") {
                if buf_reader.read_line(&mut resp).await? == 0 {
                    return Err(TransportError::Http("EOF before CONNECT response completed"));
                }
                if resp.len() > MAX_RESPONSE_HEAD {
                    return Err(TransportError::Http("CONNECT response head too long"));
                }
            }
            Ok(())
        };
        tokio::time::timeout(RESPONSE_TIMEOUT, read_head)
            .await
            .map_err(|_| TransportError::Http("CONNECT response timed out"))??;
        let mut headers = [httparse::EMPTY_HEADER; 16];
        let mut parsed = httparse::Response::new(&mut headers);
        parsed
            .parse(resp.as_bytes())
            .map_err(|_| TransportError::Http("malformed CONNECT response"))?;
        match parsed.code {
            // keep the BufReader: bytes the upstream sent past the head stay
            // in its buffer and must reach the client
            Some(200) => Ok(Box::new(buf_reader)),
            Some(code) => Err(TransportError::UpstreamRejected(format!(
                "HTTP CONNECT status {}",
                code
            ))),
            None => Err(TransportError::Http("incomplete CONNECT response")),
        }
    }
}
