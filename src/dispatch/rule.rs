use crate::config::RuleSchema;
use ipnet::IpNet;
use std::net::IpAddr;

pub enum RuleImpl {
    Domain(String),
    DomainSuffix(String),
    IpCidr(IpNet),
    Match,
}

pub struct Rule {
    imp: RuleImpl,
    source: String,
    enabled: bool,
}

impl Rule {
    /// Returns None for unknown kinds and malformed CIDR patterns; a bad rule
    /// never matches and never aborts the rest of the set.
    pub fn compile(schema: &RuleSchema) -> Option<Rule> {
        let imp = match schema.kind.as_str() {
            "DOMAIN" => RuleImpl::Domain(schema.pattern.clone()),
            "DOMAIN-SUFFIX" => RuleImpl::DomainSuffix(schema.pattern.clone()),
            "IP-CIDR" => match schema.pattern.parse::<IpNet>() {
                Ok(net) => RuleImpl::IpCidr(net),
                Err(err) => {
                    tracing::warn!("Invalid IP-CIDR pattern {}: {}", schema.pattern, err);
                    return None;
                }
            },
            "MATCH" => RuleImpl::Match,
            other => {
                tracing::warn!("Unknown rule type: {}", other);
                return None;
            }
        };
        Some(Rule {
            imp,
            source: schema.proxy_source.clone(),
            enabled: schema.enabled,
        })
    }

    pub fn matches(&self, host: &str, ip: Option<IpAddr>) -> Option<&str> {
        if !self.enabled {
            return None;
        }
        let hit = match &self.imp {
            RuleImpl::Domain(domain) => host == domain,
            // suffix must align on a label boundary: a.b.com matches b.com,
            // evilb.com does not
            RuleImpl::DomainSuffix(suffix) => {
                host == suffix
                    || (host.len() > suffix.len()
                        && host.ends_with(suffix)
                        && host.as_bytes()[host.len() - suffix.len() - 1] == b'.')
            }
            RuleImpl::IpCidr(net) => ip.map_or(false, |ip| net.contains(&ip)),
            RuleImpl::Match => true,
        };
        hit.then_some(self.source.as_str())
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile(kind: &str, pattern: &str) -> Rule {
        Rule::compile(&RuleSchema::new(kind, pattern, "up", true)).unwrap()
    }

    #[test]
    fn test_domain_exact() {
        let rule = compile("DOMAIN", "pingcode.com");
        assert_eq!(rule.matches("pingcode.com", None), Some("up"));
        assert_eq!(rule.matches("www.pingcode.com", None), None);
        assert_eq!(rule.matches("Pingcode.com", None), None);
    }

    #[test]
    fn test_domain_suffix_label_boundary() {
        let rule = compile("DOMAIN-SUFFIX", "pingcode.com");
        assert_eq!(rule.matches("pingcode.com", None), Some("up"));
        assert_eq!(rule.matches("www.pingcode.com", None), Some("up"));
        assert_eq!(rule.matches("a.b.pingcode.com", None), Some("up"));
        assert_eq!(rule.matches("evilpingcode.com", None), None);
        assert_eq!(rule.matches("xpingcode.com", None), None);
    }

    #[test]
    fn test_cidr_rejects_malformed_pattern() {
        assert!(Rule::compile(&RuleSchema::new("IP-CIDR", "10.0.0.0/33", "up", true)).is_none());
        assert!(Rule::compile(&RuleSchema::new("IP-CIDR", "not-a-cidr", "up", true)).is_none());
    }

    #[test]
    fn test_disabled_rule_never_matches() {
        let rule = Rule::compile(&RuleSchema::new("MATCH", "", "up", false)).unwrap();
        assert_eq!(rule.matches("anything", None), None);
    }
}
