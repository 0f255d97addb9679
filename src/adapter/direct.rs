use crate::adapter::{dial_tcp, BoxedStream, Outbound, OutboundType, DIAL_TIMEOUT};
use crate::proxy::error::TransportError;
use crate::proxy::NetworkAddr;
use async_trait::async_trait;

pub struct DirectOutbound {
    name: String,
}

impl DirectOutbound {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl Outbound for DirectOutbound {
    fn name(&self) -> &str {
        &self.name
    }

    fn outbound_type(&self) -> OutboundType {
        OutboundType::Direct
    }

    async fn connect(&self, dst: &NetworkAddr) -> Result<BoxedStream, TransportError> {
        let stream = dial_tcp(dst, DIAL_TIMEOUT).await?;
        Ok(Box::new(stream))
    }
}
