use crate::adapter::{build_outbound, OutboundRegistry, OutboundType};
use crate::proxy::error::TransportError;
use crate::proxy::stats::StatCenter;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ProxyInfo {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: OutboundType,
    pub server: String,
    pub port: u16,
    #[serde(default)]
    pub config: HashMap<String, Value>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ProxySource {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub config: HashMap<String, Value>,
    #[serde(default)]
    pub proxies: HashMap<String, ProxyInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_proxy: Option<String>,
}

/// The proxy-source table. Rules resolve to source ids; selecting a source's
/// current proxy builds the matching transport and swaps it into the
/// registry under the source id.
pub struct SourceManager {
    sources: RwLock<HashMap<String, ProxySource>>,
    current: RwLock<HashMap<String, ProxyInfo>>,
    registry: Arc<OutboundRegistry>,
    stats: Arc<StatCenter>,
}

impl SourceManager {
    pub fn new(registry: Arc<OutboundRegistry>, stats: Arc<StatCenter>) -> Self {
        Self {
            sources: RwLock::new(HashMap::new()),
            current: RwLock::new(HashMap::new()),
            registry,
            stats,
        }
    }

    pub fn add_source(&self, source: ProxySource) {
        tracing::info!("Adding proxy source {} ({})", source.name, source.id);
        self.sources
            .write()
            .unwrap()
            .insert(source.id.clone(), source);
    }

    pub fn remove_source(&self, source_id: &str) {
        tracing::info!("Removing proxy source {}", source_id);
        self.sources.write().unwrap().remove(source_id);
        self.current.write().unwrap().remove(source_id);
        self.registry.remove(source_id);
        self.stats.remove(source_id);
    }

    pub fn list_sources(&self) -> Vec<ProxySource> {
        self.sources.read().unwrap().values().cloned().collect()
    }

    pub fn update_proxies(&self, source_id: &str, proxies: HashMap<String, ProxyInfo>) -> bool {
        let mut sources = self.sources.write().unwrap();
        match sources.get_mut(source_id) {
            Some(source) => {
                source.proxies = proxies;
                true
            }
            None => false,
        }
    }

    /// Select the live proxy for a source. The transport is built before any
    /// state changes so a config error refuses the whole operation.
    pub fn set_current_proxy(
        &self,
        source_id: &str,
        proxy: ProxyInfo,
    ) -> Result<(), TransportError> {
        let outbound = build_outbound(
            proxy.kind,
            source_id,
            &proxy.server,
            proxy.port,
            &proxy.config,
        )?;
        {
            let mut sources = self.sources.write().unwrap();
            if let Some(source) = sources.get_mut(source_id) {
                source.proxies.insert(proxy.id.clone(), proxy.clone());
                source.current_proxy = Some(proxy.id.clone());
            }
        }
        self.current
            .write()
            .unwrap()
            .insert(source_id.to_string(), proxy);
        self.registry.register(source_id, outbound);
        Ok(())
    }

    pub fn current_proxies(&self) -> HashMap<String, ProxyInfo> {
        self.current.read().unwrap().clone()
    }
}
