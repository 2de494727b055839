//! Message envelope normalization.
//!
//! Producers emit two shapes: flat field maps, and wrapped
//! `{type, data}` envelopes where `data` is a JSON object. Handlers see a
//! single normalized view with typed accessors.

use std::collections::HashMap;

use crate::broker::StreamMessage;

/// Normalized view of one stream message
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Wrapped-envelope discriminator, when present
    pub kind: Option<String>,
    fields: HashMap<String, String>,
}

impl Envelope {
    /// Normalize a raw message. A message carrying both `type` and `data`
    /// is treated as wrapped: `data` is parsed as a JSON object and its
    /// members become the field map. Anything else passes through flat.
    #[must_use]
    pub fn normalize(message: &StreamMessage) -> Self {
        let kind = message.fields.get("type").cloned();
        if let (Some(kind), Some(data)) = (kind.as_deref(), message.fields.get("data")) {
            if let Ok(serde_json::Value::Object(object)) = serde_json::from_str(data) {
                let fields = object
                    .into_iter()
                    .map(|(k, v)| (k, json_to_string(&v)))
                    .collect();
                return Self {
                    kind: Some(kind.to_string()),
                    fields,
                };
            }
        }

        Self {
            kind,
            fields: message.fields.clone(),
        }
    }

    #[must_use]
    pub fn from_fields(fields: HashMap<String, String>) -> Self {
        let kind = fields.get("type").cloned();
        Self { kind, fields }
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str).filter(|v| !v.is_empty())
    }

    /// First non-empty value among `keys` (back-compat field aliases)
    #[must_use]
    pub fn get_any(&self, keys: &[&str]) -> Option<&str> {
        keys.iter().find_map(|k| self.get(k))
    }

    #[must_use]
    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key)?.parse().ok()
    }

    #[must_use]
    pub fn get_i64(&self, key: &str) -> Option<i64> {
        let raw = self.get(key)?;
        raw.parse::<i64>()
            .ok()
            .or_else(|| raw.parse::<f64>().ok().map(|v| v as i64))
    }

    /// Boolean accessor accepting JSON booleans serialized as strings
    #[must_use]
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.get(key)? {
            "true" | "1" => Some(true),
            "false" | "0" => Some(false),
            _ => None,
        }
    }

    #[must_use]
    pub fn fields(&self) -> &HashMap<String, String> {
        &self.fields
    }

    /// JSON rendering for DLQ envelopes
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.fields).unwrap_or_else(|_| "{}".to_string())
    }
}

fn json_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(pairs: &[(&str, &str)]) -> StreamMessage {
        StreamMessage::new(
            "1-0",
            pairs
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
        )
    }

    #[test]
    fn test_flat_passthrough() {
        let env = Envelope::normalize(&message(&[("id", "opp-1"), ("confidence", "0.9")]));
        assert!(env.kind.is_none());
        assert_eq!(env.get("id"), Some("opp-1"));
        assert_eq!(env.get_f64("confidence"), Some(0.9));
    }

    #[test]
    fn test_wrapped_unwraps_data_object() {
        let env = Envelope::normalize(&message(&[
            ("type", "swap-event"),
            (
                "data",
                r#"{"pairAddress":"0xabc","chain":"ethereum","usdValue":1234.5}"#,
            ),
        ]));
        assert_eq!(env.kind.as_deref(), Some("swap-event"));
        assert_eq!(env.get("pairAddress"), Some("0xabc"));
        assert_eq!(env.get_f64("usdValue"), Some(1234.5));
    }

    #[test]
    fn test_wrapped_with_unparseable_data_stays_flat() {
        let env = Envelope::normalize(&message(&[("type", "swap-event"), ("data", "not json")]));
        assert_eq!(env.kind.as_deref(), Some("swap-event"));
        assert_eq!(env.get("data"), Some("not json"));
    }

    #[test]
    fn test_type_without_data_stays_flat() {
        let env = Envelope::normalize(&message(&[("type", "ping"), ("id", "x")]));
        assert_eq!(env.kind.as_deref(), Some("ping"));
        assert_eq!(env.get("id"), Some("x"));
    }

    #[test]
    fn test_name_service_alias() {
        let env = Envelope::normalize(&message(&[("service", "detector-eth")]));
        assert_eq!(env.get_any(&["name", "service"]), Some("detector-eth"));

        let env = Envelope::normalize(&message(&[
            ("name", "detector-eth"),
            ("service", "legacy-name"),
        ]));
        // `name` is preferred when both are present
        assert_eq!(env.get_any(&["name", "service"]), Some("detector-eth"));
    }

    #[test]
    fn test_bool_accepts_string_true() {
        let env = Envelope::normalize(&message(&[("success", "true")]));
        assert_eq!(env.get_bool("success"), Some(true));

        let env = Envelope::normalize(&message(&[("success", "false")]));
        assert_eq!(env.get_bool("success"), Some(false));

        let env = Envelope::normalize(&message(&[("success", "yes")]));
        assert_eq!(env.get_bool("success"), None);
    }

    #[test]
    fn test_empty_values_read_as_absent() {
        let env = Envelope::normalize(&message(&[("chain", "")]));
        assert_eq!(env.get("chain"), None);
    }
}
