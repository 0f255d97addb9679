use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct RawRootCfg {
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default = "default_socks5_port")]
    pub socks5_port: u16,
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    #[serde(default = "default_openvpn_port")]
    pub openvpn_port: u16,
    #[serde(default = "default_dns_port")]
    pub dns_port: u16,
    #[serde(default = "default_dns_type")]
    pub dns_type: DnsType,
    #[serde(default = "default_doh_server")]
    pub doh_server: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DnsType {
    FakeIp,
    Doh,
}

impl Default for RawRootCfg {
    fn default() -> Self {
        Self {
            http_port: default_http_port(),
            socks5_port: default_socks5_port(),
            api_port: default_api_port(),
            openvpn_port: default_openvpn_port(),
            dns_port: default_dns_port(),
            dns_type: default_dns_type(),
            doh_server: default_doh_server(),
            log_level: default_log_level(),
        }
    }
}

pub fn load_config(path: &Path) -> anyhow::Result<RawRootCfg> {
    let data = std::fs::read_to_string(path)?;
    Ok(serde_yaml::from_str(&data)?)
}

// Used for serde
fn default_http_port() -> u16 {
    6160
}

fn default_socks5_port() -> u16 {
    6161
}

fn default_api_port() -> u16 {
    6162
}

fn default_openvpn_port() -> u16 {
    1080
}

fn default_dns_port() -> u16 {
    53
}

fn default_dns_type() -> DnsType {
    DnsType::FakeIp
}

fn default_doh_server() -> String {
    "https://1.1.1.1/dns-query".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let cfg: RawRootCfg = serde_yaml::from_str("{}").unwrap();
        assert_eq!(cfg.http_port, 6160);
        assert_eq!(cfg.socks5_port, 6161);
        assert_eq!(cfg.api_port, 6162);
        assert_eq!(cfg.openvpn_port, 1080);
        assert_eq!(cfg.dns_port, 53);
        assert_eq!(cfg.dns_type, DnsType::FakeIp);
        assert_eq!(cfg.log_level, "info");
    }

    #[test]
    fn test_full_config() {
        let text = "http_port: 7160\n\
                    socks5_port: 7161\n\
                    api_port: 7162\n\
                    openvpn_port: 2080\n\
                    dns_port: 5353\n\
                    dns_type: doh\n\
                    doh_server: https://9.9.9.9/dns-query\n\
                    log_level: debug\n";
        let cfg: RawRootCfg = serde_yaml::from_str(text).unwrap();
        assert_eq!(cfg.http_port, 7160);
        assert_eq!(cfg.dns_type, DnsType::Doh);
        assert_eq!(cfg.doh_server, "https://9.9.9.9/dns-query");
        assert_eq!(cfg.log_level, "debug");
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(serde_yaml::from_str::<RawRootCfg>("clash_port: 7890\n").is_err());
    }
}
