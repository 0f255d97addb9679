use crate::adapter::{BoxedStream, OutboundRegistry};
use crate::dispatch::Dispatching;
use crate::proxy::error::TransportError;
use crate::proxy::stats::{SourceStatsCollector, StatCenter};
use crate::proxy::NetworkAddr;
use std::sync::Arc;

/// What a listener needs from the rest of the system: route a destination,
/// open the upstream, account the bytes. Nothing else leaks through.
pub struct Dispatcher {
    rules: Arc<Dispatching>,
    registry: Arc<OutboundRegistry>,
    stats: Arc<StatCenter>,
}

impl Dispatcher {
    pub fn new(
        rules: Arc<Dispatching>,
        registry: Arc<OutboundRegistry>,
        stats: Arc<StatCenter>,
    ) -> Self {
        Self {
            rules,
            registry,
            stats,
        }
    }

    pub fn route(&self, dst: &NetworkAddr) -> String {
        self.rules.matches(&dst.to_string())
    }

    pub async fn connect(
        &self,
        label: &str,
        dst: &NetworkAddr,
    ) -> Result<BoxedStream, TransportError> {
        self.registry.connect(label, dst).await
    }

    pub fn collector(&self, label: &str) -> Arc<SourceStatsCollector> {
        self.stats.get_or_create(label)
    }
}
