use serde::{Deserialize, Serialize};

/// Raw routing rule as it appears in the control-plane body.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RuleSchema {
    /// "DOMAIN", "DOMAIN-SUFFIX", "IP-CIDR" or "MATCH"
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub pattern: String,
    pub proxy_source: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl RuleSchema {
    pub fn new(kind: &str, pattern: &str, proxy_source: &str, enabled: bool) -> Self {
        Self {
            kind: kind.to_string(),
            pattern: pattern.to_string(),
            proxy_source: proxy_source.to_string(),
            enabled,
        }
    }
}

/// The rule set installed before the control plane pushes anything.
pub fn default_rules() -> Vec<RuleSchema> {
    vec![RuleSchema::new("MATCH", "", "DIRECT", true)]
}

fn default_enabled() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_schema_roundtrip() {
        let body = r#"[{"type":"DOMAIN-SUFFIX","pattern":"example.com","proxy_source":"hup","enabled":true}]"#;
        let rules: Vec<RuleSchema> = serde_json::from_str(body).unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].kind, "DOMAIN-SUFFIX");
        assert_eq!(rules[0].proxy_source, "hup");
        let encoded = serde_json::to_string(&rules).unwrap();
        let decoded: Vec<RuleSchema> = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, rules);
    }

    #[test]
    fn test_enabled_defaults_to_true() {
        let body = r#"{"type":"MATCH","pattern":"","proxy_source":"DIRECT"}"#;
        let rule: RuleSchema = serde_json::from_str(body).unwrap();
        assert!(rule.enabled);
    }
}
