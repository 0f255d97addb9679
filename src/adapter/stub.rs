use crate::adapter::{BoxedStream, Outbound, OutboundType};
use crate::proxy::error::TransportError;
use crate::proxy::NetworkAddr;
use async_trait::async_trait;

/// Placeholder for protocols without a wire implementation. It keeps the
/// registry and control-plane surface uniform but refuses to relay: handing
/// out a raw socket with no handshake would not be a usable tunnel.
pub struct StubOutbound {
    name: String,
    kind: OutboundType,
}

impl StubOutbound {
    pub fn new(name: &str, kind: OutboundType) -> Self {
        Self {
            name: name.to_string(),
            kind,
        }
    }
}

#[async_trait]
impl Outbound for StubOutbound {
    fn name(&self) -> &str {
        &self.name
    }

    fn outbound_type(&self) -> OutboundType {
        self.kind
    }

    fn is_running(&self) -> bool {
        false
    }

    async fn connect(&self, _dst: &NetworkAddr) -> Result<BoxedStream, TransportError> {
        Err(TransportError::NotImplemented(self.kind))
    }
}
