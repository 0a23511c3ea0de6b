//! Weakly-typed option access
//!
//! Configuration arrives as untyped JSON maps. `Options` normalizes keys
//! once at entry (lowercase, `-`/`_` stripped) and offers accessors with
//! the weak conversions the config surface promises: strings accept
//! numbers, booleans accept "true"/"false"/1/0, lists accept scalars.

use std::collections::HashMap;

use serde_json::Value;

use crate::error::{Error, Result};

/// Canonical key form: lowercase with `-` and `_` removed
pub fn normalize_key(key: &str) -> String {
    key.chars()
        .filter(|c| *c != '-' && *c != '_')
        .flat_map(|c| c.to_lowercase())
        .collect()
}

/// An option map with normalized keys
#[derive(Debug, Clone, Default)]
pub struct Options {
    map: HashMap<String, Value>,
}

impl Options {
    /// Build from a JSON value; anything but an object is rejected.
    pub fn from_value(value: &Value) -> Result<Self> {
        let object = value
            .as_object()
            .ok_or_else(|| Error::Config("proxy entry must be a mapping".into()))?;
        let mut map = HashMap::with_capacity(object.len());
        for (key, val) in object {
            map.insert(normalize_key(key), val.clone());
        }
        Ok(Self { map })
    }

    fn get(&self, key: &str) -> Option<&Value> {
        self.map.get(&normalize_key(key))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// String accessor; numbers and booleans convert
    pub fn string(&self, key: &str) -> Option<String> {
        match self.get(key)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    pub fn string_or(&self, key: &str, default: &str) -> String {
        self.string(key).unwrap_or_else(|| default.to_string())
    }

    /// Mandatory string; the error names the offending field
    pub fn require_string(&self, key: &str, kind: &str) -> Result<String> {
        self.string(key)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::Config(format!("{kind}: missing {key}")))
    }

    /// Integer accessor; strings parse
    pub fn integer(&self, key: &str) -> Option<i64> {
        match self.get(key)? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            Value::Bool(b) => Some(*b as i64),
            _ => None,
        }
    }

    pub fn port(&self, key: &str, kind: &str) -> Result<u16> {
        let value = self
            .integer(key)
            .ok_or_else(|| Error::Config(format!("{kind}: missing {key}")))?;
        u16::try_from(value).map_err(|_| Error::Config(format!("{kind}: invalid {key}: {value}")))
    }

    /// Boolean accessor; "true"/"false" and 0/1 convert
    pub fn boolean(&self, key: &str) -> Option<bool> {
        match self.get(key)? {
            Value::Bool(b) => Some(*b),
            Value::String(s) => match s.to_lowercase().as_str() {
                "true" | "1" => Some(true),
                "false" | "0" => Some(false),
                _ => None,
            },
            Value::Number(n) => match n.as_i64() {
                Some(1) => Some(true),
                Some(0) => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn boolean_or(&self, key: &str, default: bool) -> bool {
        self.boolean(key).unwrap_or(default)
    }

    /// List of weak strings; a bare scalar reads as a one-element list
    pub fn string_list(&self, key: &str) -> Option<Vec<String>> {
        match self.get(key)? {
            Value::Array(items) => Some(
                items
                    .iter()
                    .filter_map(|v| match v {
                        Value::String(s) => Some(s.clone()),
                        Value::Number(n) => Some(n.to_string()),
                        _ => None,
                    })
                    .collect(),
            ),
            Value::String(s) => Some(vec![s.clone()]),
            Value::Number(n) => Some(vec![n.to_string()]),
            _ => None,
        }
    }

    /// Nested option record
    pub fn object(&self, key: &str) -> Option<Options> {
        Options::from_value(self.get(key)?).ok()
    }

    /// Flat string map (e.g. headers)
    pub fn string_map(&self, key: &str) -> Option<HashMap<String, String>> {
        let object = self.get(key)?.as_object()?;
        Some(
            object
                .iter()
                .filter_map(|(k, v)| match v {
                    Value::String(s) => Some((k.clone(), s.clone())),
                    Value::Number(n) => Some((k.clone(), n.to_string())),
                    Value::Array(items) => items.first().and_then(|first| {
                        first.as_str().map(|s| (k.clone(), s.to_string()))
                    }),
                    _ => None,
                })
                .collect(),
        )
    }

    /// Multi-valued string map (e.g. HTTP obfuscation headers)
    pub fn string_list_map(&self, key: &str) -> Option<HashMap<String, Vec<String>>> {
        let object = self.get(key)?.as_object()?;
        Some(
            object
                .iter()
                .filter_map(|(k, v)| match v {
                    Value::Array(items) => Some((
                        k.clone(),
                        items
                            .iter()
                            .filter_map(|i| i.as_str().map(str::to_string))
                            .collect(),
                    )),
                    Value::String(s) => Some((k.clone(), vec![s.clone()])),
                    _ => None,
                })
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_normalization() {
        assert_eq!(normalize_key("client-fingerprint"), "clientfingerprint");
        assert_eq!(normalize_key("Skip_Cert_Verify"), "skipcertverify");
        assert_eq!(normalize_key("UUID"), "uuid");
    }

    #[test]
    fn test_weak_conversions() {
        let opts = Options::from_value(&json!({
            "port": "8443",
            "server": 17,
            "udp": "true",
            "tls": 1,
            "skip-cert-verify": false,
        }))
        .unwrap();

        assert_eq!(opts.integer("port"), Some(8443));
        assert_eq!(opts.string("server").as_deref(), Some("17"));
        assert_eq!(opts.boolean("udp"), Some(true));
        assert_eq!(opts.boolean("tls"), Some(true));
        assert_eq!(opts.boolean("skipCertVerify"), Some(false));
    }

    #[test]
    fn test_key_variants_collapse() {
        let opts = Options::from_value(&json!({"ws-opts": {"max_early_data": 2048}})).unwrap();
        let ws = opts.object("wsopts").unwrap();
        assert_eq!(ws.integer("max-early-data"), Some(2048));
    }

    #[test]
    fn test_missing_mandatory_field_names_it() {
        let opts = Options::from_value(&json!({"type": "trojan"})).unwrap();
        let err = opts.require_string("password", "trojan").unwrap_err();
        assert!(err.to_string().contains("password"));
    }

    #[test]
    fn test_non_object_rejected() {
        assert!(Options::from_value(&json!("scalar")).is_err());
        assert!(Options::from_value(&json!([1, 2])).is_err());
    }
}
