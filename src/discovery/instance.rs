//! Service instance record.
//!
//! Instances are serialized as self-describing JSON keyed by a stable id;
//! the field names below are the wire format and must not drift.

use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use serde::Deserialize;
use serde::Serialize;

use crate::connector::random_token_suffix;

/// How an instance participates in discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum ServiceType {
    /// Registered with a lease; disappears when its process dies.
    #[default]
    Dynamic,
    /// Long-lived registration managed out of band.
    Static,
}

/// A single registered instance of a named service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInstance {
    pub name: String,
    /// Opaque application payload, itself JSON-encoded.
    pub json_payload: String,
    pub address: String,
    pub port: i32,
    pub ssl_port: i32,
    #[serde(rename = "registrationTimeUTC")]
    pub registration_time_utc: i64,
    pub service_type: ServiceType,
    pub uri: String,
    pub enabled: bool,
    /// Stable id; the last segment of the instance's key.
    pub id: String,
}

/// Milliseconds since the Unix epoch.
pub(crate) fn now_unix_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or_default()
}

impl ServiceInstance {
    /// A dynamic, enabled instance with a fresh id, registered "now".
    pub fn new(name: impl Into<String>, address: impl Into<String>, port: i32) -> Self {
        Self {
            name: name.into(),
            json_payload: String::new(),
            address: address.into(),
            port,
            ssl_port: -1,
            registration_time_utc: now_unix_ms(),
            service_type: ServiceType::Dynamic,
            uri: String::new(),
            enabled: true,
            id: random_token_suffix(),
        }
    }

    pub fn with_payload(mut self, json_payload: impl Into<String>) -> Self {
        self.json_payload = json_payload.into();
        self
    }

    pub fn with_uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = uri.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_format_field_names() {
        let instance = ServiceInstance {
            name: "billing".to_string(),
            json_payload: "{}".to_string(),
            address: "10.0.0.7".to_string(),
            port: 8080,
            ssl_port: -1,
            registration_time_utc: 1700000000000,
            service_type: ServiceType::Dynamic,
            uri: "http://10.0.0.7:8080".to_string(),
            enabled: true,
            id: "abc123xyz".to_string(),
        };
        let json = serde_json::to_string(&instance).unwrap();
        for field in [
            "\"name\"",
            "\"jsonPayload\"",
            "\"address\"",
            "\"port\"",
            "\"sslPort\"",
            "\"registrationTimeUTC\"",
            "\"serviceType\":\"DYNAMIC\"",
            "\"uri\"",
            "\"enabled\"",
            "\"id\"",
        ] {
            assert!(json.contains(field), "missing {field} in {json}");
        }

        let decoded: ServiceInstance = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, instance);
    }

    #[test]
    fn new_fills_identity_fields() {
        let a = ServiceInstance::new("svc", "127.0.0.1", 80);
        let b = ServiceInstance::new("svc", "127.0.0.1", 80);
        assert!(!a.id.is_empty());
        assert_ne!(a.id, b.id);
        assert!(a.enabled);
        assert!(a.registration_time_utc > 0);
        assert_eq!(a.service_type, ServiceType::Dynamic);
    }
}
