use crate::adapter::DIRECT_LABEL;
use crate::config::RuleSchema;
use crate::dispatch::rule::Rule;
use arc_swap::ArcSwap;
use std::net::{IpAddr, Ipv6Addr};
use std::sync::Arc;

struct RuleTable {
    raw: Vec<RuleSchema>,
    compiled: Vec<Rule>,
}

impl RuleTable {
    fn compile(raw: Vec<RuleSchema>) -> Self {
        let compiled = raw.iter().filter_map(Rule::compile).collect();
        Self { raw, compiled }
    }
}

/// Routing rule engine. The active rule set is an immutable snapshot swapped
/// as a whole; a match always runs against one consistent table.
pub struct Dispatching {
    table: ArcSwap<RuleTable>,
}

impl Dispatching {
    pub fn new(rules: Vec<RuleSchema>) -> Self {
        Self {
            table: ArcSwap::from_pointee(RuleTable::compile(rules)),
        }
    }

    pub fn update(&self, rules: Vec<RuleSchema>) {
        tracing::info!("Installing {} routing rules", rules.len());
        self.table.store(Arc::new(RuleTable::compile(rules)));
    }

    /// Rules in declaration order, including disabled and malformed entries.
    pub fn rules(&self) -> Vec<RuleSchema> {
        self.table.load().raw.clone()
    }

    /// Resolve a destination ("host:port", bracketed IPv6, or a bare host) to
    /// a proxy-source label. First enabled hit wins; no hit resolves to
    /// `DIRECT`.
    pub fn matches(&self, destination: &str) -> String {
        let table = self.table.load();
        let host = extract_host(destination);
        let ip = host_ip(host);
        for rule in &table.compiled {
            if let Some(source) = rule.matches(host, ip) {
                tracing::trace!("{} matched proxy source {}", destination, source);
                return source.to_string();
            }
        }
        DIRECT_LABEL.to_string()
    }
}

/// Strip a trailing `:port` from a destination. The port is the part after
/// the last colon when it is all digits; a bare IPv6 address carries colons
/// but no port and is returned untouched.
pub fn extract_host(destination: &str) -> &str {
    if destination.parse::<Ipv6Addr>().is_ok() {
        return destination;
    }
    if let Some(idx) = destination.rfind(':') {
        let port = &destination[idx + 1..];
        if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) {
            return &destination[..idx];
        }
    }
    destination
}

fn host_ip(host: &str) -> Option<IpAddr> {
    host.trim_start_matches('[').trim_end_matches(']').parse().ok()
}
