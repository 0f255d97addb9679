use crate::adapter::{BoxedStream, DirectOutbound, Outbound};
use crate::proxy::error::TransportError;
use crate::proxy::NetworkAddr;
use dashmap::DashMap;
use std::sync::Arc;

pub const DIRECT_LABEL: &str = "DIRECT";

/// The single choke-point where a proxy-source label becomes an upstream
/// stream.
pub struct OutboundRegistry {
    entries: DashMap<String, Arc<dyn Outbound>>,
}

impl OutboundRegistry {
    pub fn new() -> Self {
        let registry = Self {
            entries: DashMap::new(),
        };
        registry.register("direct", Arc::new(DirectOutbound::new("direct")));
        registry
    }

    /// Replace any existing entry; the displaced transport is closed in the
    /// background.
    pub fn register(&self, name: &str, outbound: Arc<dyn Outbound>) {
        tracing::info!("Registering {} outbound {}", outbound.outbound_type(), name);
        if let Some(old) = self.entries.insert(name.to_string(), outbound) {
            tokio::spawn(async move { old.close().await });
        }
    }

    pub fn remove(&self, name: &str) {
        if let Some((_, old)) = self.entries.remove(name) {
            tracing::info!("Removing outbound {}", name);
            tokio::spawn(async move { old.close().await });
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Outbound>> {
        self.entries.get(name).map(|entry| entry.value().clone())
    }

    pub fn list(&self) -> Vec<(String, Arc<dyn Outbound>)> {
        self.entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub async fn connect(
        &self,
        name: &str,
        dst: &NetworkAddr,
    ) -> Result<BoxedStream, TransportError> {
        // the Arc is cloned out of the map first; no shard lock spans the dial
        let outbound = match self.get(name) {
            Some(outbound) => outbound,
            None if name.eq_ignore_ascii_case(DIRECT_LABEL) => {
                Arc::new(DirectOutbound::new("direct")) as Arc<dyn Outbound>
            }
            None => return Err(TransportError::Unknown(name.to_string())),
        };
        outbound.connect(dst).await
    }
}

impl Default for OutboundRegistry {
    fn default() -> Self {
        Self::new()
    }
}
