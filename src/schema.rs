//! Schema Publisher (C7): publish a field-descriptor document at startup,
//! retract it at shutdown if no siblings remain.
//!
//! `ConsulKv` generalizes `ConsulKVClient` in
//! `examples/original_source/common/consul.py` — same PUT/DELETE-under-a-base-path
//! shape, now over Consul's plain HTTP KV API via `reqwest` rather than the
//! `consul` Python client.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SmsError;

/// One accepted request field, as published under `ServerData.fields`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDescriptor {
    #[serde(rename = "type")]
    pub field_type: String,
    pub required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(rename = "minLength", skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,
    #[serde(rename = "maxLength", skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    pub description: String,
}

/// `ServerData` payload: just the field map, per §4.7.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerData {
    pub fields: HashMap<String, FieldDescriptor>,
}

/// Full document published at `<Base>/<Name>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaDescriptor {
    #[serde(rename = "ServerName")]
    pub server_name: String,
    #[serde(rename = "ServerPath")]
    pub server_path: String,
    #[serde(rename = "ServerDesc")]
    pub server_desc: String,
    #[serde(rename = "ServerData")]
    pub server_data: ServerData,
    pub created_at: u64,
    pub updated_at: u64,
}

impl SchemaDescriptor {
    /// Build the descriptor for this service, stamping both timestamps to
    /// now.
    #[must_use]
    pub fn for_service(server_name: &str, server_path: &str, server_desc: &str) -> Self {
        let now = now_epoch();
        Self {
            server_name: server_name.to_string(),
            server_path: server_path.to_string(),
            server_desc: server_desc.to_string(),
            server_data: ServerData {
                fields: sms_request_fields(),
            },
            created_at: now,
            updated_at: now,
        }
    }
}

/// The accepted-field table for an `SmsRequest`, matching
/// `sms_field_description` in `examples/original_source/service/sms.py`.
#[must_use]
pub fn sms_request_fields() -> HashMap<String, FieldDescriptor> {
    let mut fields = HashMap::new();
    fields.insert(
        "phone".to_string(),
        FieldDescriptor {
            field_type: "string".to_string(),
            required: true,
            pattern: Some(r"^(\+\d{10,15}|1[3-9]\d{9})$".to_string()),
            min_length: None,
            max_length: None,
            description: "destination phone number, E.164 or national".to_string(),
        },
    );
    fields.insert(
        "content".to_string(),
        FieldDescriptor {
            field_type: "string".to_string(),
            required: true,
            pattern: None,
            min_length: Some(1),
            max_length: None,
            description: "UTF-8 message body".to_string(),
        },
    );
    fields.insert(
        "metadata".to_string(),
        FieldDescriptor {
            field_type: "object".to_string(),
            required: false,
            pattern: None,
            min_length: None,
            max_length: None,
            description: "arbitrary caller-supplied metadata".to_string(),
        },
    );
    fields
}

/// A discovery/KV store the schema publisher writes to and reads siblings
/// from. Only the HTTP KV subset used here is modeled — no gossip
/// protocol, no watch/blocking queries.
#[async_trait]
pub trait SchemaStore: Send + Sync {
    /// PUT the descriptor under `key`.
    async fn put(&self, key: &str, descriptor: &SchemaDescriptor) -> Result<(), SmsError>;

    /// List every descriptor stored under `prefix` (a recursive KV read).
    async fn list(&self, prefix: &str) -> Result<Vec<(String, SchemaDescriptor)>, SmsError>;

    /// DELETE the value at `key`.
    async fn delete(&self, key: &str) -> Result<(), SmsError>;
}

/// Thin Consul HTTP KV client.
pub struct ConsulKv {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    base_path: String,
}

impl ConsulKv {
    #[must_use]
    pub fn new(host: &str, port: u16, scheme: &str, token: Option<&str>, base_path: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: format!("{scheme}://{host}:{port}"),
            token: token.filter(|t| !t.is_empty()).map(str::to_string),
            base_path: base_path.trim_end_matches('/').to_string(),
        }
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}/{}", self.base_path, key.trim_start_matches('/'))
    }

    fn apply_token(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => builder.header("X-Consul-Token", token),
            None => builder,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ConsulKvEntry {
    #[serde(rename = "Key")]
    key: String,
    #[serde(rename = "Value")]
    value: Option<String>,
}

#[async_trait]
impl SchemaStore for ConsulKv {
    async fn put(&self, key: &str, descriptor: &SchemaDescriptor) -> Result<(), SmsError> {
        let url = format!("{}/v1/kv/{}", self.base_url, self.full_key(key));
        let body = serde_json::to_vec(descriptor)
            .map_err(|e| SmsError::PayloadMalformed(format!("schema encode: {e}")))?;

        let response = self
            .apply_token(self.client.put(&url))
            .body(body)
            .send()
            .await
            .map_err(|e| SmsError::TransportBroken(format!("consul PUT {url}: {e}")))?;

        if !response.status().is_success() {
            return Err(SmsError::TransportBroken(format!(
                "consul PUT {url} returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, SchemaDescriptor)>, SmsError> {
        let url = format!(
            "{}/v1/kv/{}?recurse=true",
            self.base_url,
            self.full_key(prefix)
        );

        let response = self
            .apply_token(self.client.get(&url))
            .send()
            .await
            .map_err(|e| SmsError::TransportBroken(format!("consul GET {url}: {e}")))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            return Err(SmsError::TransportBroken(format!(
                "consul GET {url} returned {}",
                response.status()
            )));
        }

        let entries: Vec<ConsulKvEntry> = response
            .json()
            .await
            .map_err(|e| SmsError::PayloadMalformed(format!("consul KV decode: {e}")))?;

        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            let Some(encoded) = entry.value else { continue };
            let decoded = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, encoded)
                .map_err(|e| SmsError::PayloadMalformed(format!("consul value base64: {e}")))?;
            let descriptor: SchemaDescriptor = serde_json::from_slice(&decoded)
                .map_err(|e| SmsError::PayloadMalformed(format!("schema decode: {e}")))?;
            out.push((entry.key, descriptor));
        }
        Ok(out)
    }

    async fn delete(&self, key: &str) -> Result<(), SmsError> {
        let url = format!("{}/v1/kv/{}", self.base_url, self.full_key(key));
        let response = self
            .apply_token(self.client.delete(&url))
            .send()
            .await
            .map_err(|e| SmsError::TransportBroken(format!("consul DELETE {url}: {e}")))?;

        if !response.status().is_success() {
            return Err(SmsError::TransportBroken(format!(
                "consul DELETE {url} returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// Decide whether any *other* instance's descriptor under `siblings` counts
/// as live — `updated_at` within `max_age_secs` of now. Resolves the
/// sibling-liveness open question from §4.7.
#[must_use]
pub fn has_live_sibling(
    own_key: &str,
    siblings: &[(String, SchemaDescriptor)],
    max_age_secs: u64,
) -> bool {
    let now = now_epoch();
    siblings.iter().any(|(key, descriptor)| {
        key != own_key && now.saturating_sub(descriptor.updated_at) <= max_age_secs
    })
}

fn now_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sms_request_fields_cover_phone_content_metadata() {
        let fields = sms_request_fields();
        assert!(fields["phone"].required);
        assert!(fields["content"].required);
        assert!(!fields["metadata"].required);
    }

    #[test]
    fn no_live_sibling_when_all_stale() {
        let siblings = vec![(
            "other".to_string(),
            SchemaDescriptor {
                server_name: "sms".to_string(),
                server_path: "p".to_string(),
                server_desc: String::new(),
                server_data: ServerData {
                    fields: HashMap::new(),
                },
                created_at: 0,
                updated_at: 0,
            },
        )];
        assert!(!has_live_sibling("self", &siblings, 60));
    }

    #[test]
    fn live_sibling_detected_within_window() {
        let now = now_epoch();
        let siblings = vec![(
            "other".to_string(),
            SchemaDescriptor {
                server_name: "sms".to_string(),
                server_path: "p".to_string(),
                server_desc: String::new(),
                server_data: ServerData {
                    fields: HashMap::new(),
                },
                created_at: now,
                updated_at: now,
            },
        )];
        assert!(has_live_sibling("self", &siblings, 60));
    }

    #[test]
    fn own_key_never_counts_as_a_sibling() {
        let now = now_epoch();
        let siblings = vec![(
            "self".to_string(),
            SchemaDescriptor {
                server_name: "sms".to_string(),
                server_path: "p".to_string(),
                server_desc: String::new(),
                server_data: ServerData {
                    fields: HashMap::new(),
                },
                created_at: now,
                updated_at: now,
            },
        )];
        assert!(!has_live_sibling("self", &siblings, 60));
    }
}
