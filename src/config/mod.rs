mod config;
mod rule;

pub use config::{load_config, DnsType, RawRootCfg};
pub use rule::{default_rules, RuleSchema};
