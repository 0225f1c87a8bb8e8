//! Consumer Pipeline (C6): bus message in, modem send out, ack/nack.
//!
//! The per-message procedure generalizes `_process_message` in
//! `examples/original_source/common/pulsar.py` (redelivery check → JSON
//! decode → handler → ack/nack) combined with `create_sms_task`'s
//! metadata-splicing block in `examples/original_source/service/sms.py`.

use std::time::Instant;

use serde::Deserialize;
use serde_json::Value;
use tracing::{error, info, warn};

use crate::bus::Consumer;
use crate::error::SmsError;
use crate::pool::ModemPool;
use crate::session::normalize_phone;

/// Metadata fields spliced into the body as a cosmetic footer, matching
/// `special_fields = ('user_id', 'app_id', 'function')`.
const SPLICED_METADATA_FIELDS: &[&str] = &["user_id", "app_id", "function"];

#[derive(Debug, Deserialize)]
struct InboundPayload {
    phone: String,
    content: String,
    #[serde(default)]
    metadata: Value,
}

/// A normalized, ready-to-send request.
#[derive(Debug, Clone)]
pub struct SmsRequest {
    pub phone: String,
    pub body: String,
    pub metadata: Value,
}

impl SmsRequest {
    /// Decode, normalize, and splice metadata in one step, mirroring
    /// `SMSMessage.from_dict` plus the metadata-footer block.
    fn from_payload(bytes: &[u8], default_country_code: &str) -> Result<Self, SmsError> {
        let inbound: InboundPayload = serde_json::from_slice(bytes)
            .map_err(|e| SmsError::PayloadMalformed(format!("JSON decode: {e}")))?;

        if inbound.content.is_empty() {
            return Err(SmsError::PayloadMalformed("empty content".into()));
        }

        let phone = normalize_phone(inbound.phone.trim(), default_country_code);
        let body = splice_metadata_footer(&inbound.content, &inbound.metadata);

        Ok(Self {
            phone,
            body,
            metadata: inbound.metadata,
        })
    }
}

/// Append a cosmetic `| user_id: … | app_id: … |` footer line built from
/// the special fields, governed by `splice_metadata` (a compile-time-ish
/// knob — defaults on, matching the original's unconditional behavior).
fn splice_metadata_footer(content: &str, metadata: &Value) -> String {
    let Some(map) = metadata.as_object() else {
        return content.to_string();
    };
    if map.is_empty() {
        return content.to_string();
    }

    let special: Vec<String> = SPLICED_METADATA_FIELDS
        .iter()
        .filter_map(|field| map.get(*field).map(|v| format!("{field}: {}", render(v))))
        .collect();

    if special.is_empty() {
        return content.to_string();
    }

    let footer = format!("| {} |", special.join(" | "));
    let separator = if content.ends_with('\n') { "" } else { "\n" };
    format!("{content}{separator}{footer}")
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Outcome of processing exactly one bus message.
#[derive(Debug)]
pub enum ProcessOutcome {
    Acked,
    Nacked(SmsError),
}

/// Run the consumer loop until `cancel` fires. Each iteration pulls one
/// message, fully resolves it (ack or nack), then pulls the next —
/// at-most-one-in-flight-per-worker.
pub async fn run(
    consumer: &dyn Consumer,
    pool: &ModemPool,
    redelivery_threshold: u32,
    default_country_code: &str,
    cancel: &tokio::sync::Notify,
) {
    loop {
        let message = tokio::select! {
            m = consumer.receive() => m,
            () = cancel.notified() => {
                info!("consumer loop cancelled");
                return;
            }
        };

        let Some(message) = message else {
            info!("bus consumer closed, exiting loop");
            return;
        };

        let id = message.id();
        let redelivery_count = message.redelivery_count();
        let payload = message.payload().to_vec();

        let outcome = process_one(
            &id,
            &payload,
            redelivery_count,
            redelivery_threshold,
            pool,
            default_country_code,
            cancel,
        )
        .await;

        match outcome {
            ProcessOutcome::Acked => {
                message.ack().await;
                info!(message_id = %id, "processed successfully");
            }
            ProcessOutcome::Nacked(err) => {
                message.nack().await;
                warn!(message_id = %id, error = %err, "negative-acked");
            }
        }
    }
}

async fn process_one(
    id: &str,
    payload: &[u8],
    redelivery_count: u32,
    redelivery_threshold: u32,
    pool: &ModemPool,
    default_country_code: &str,
    cancel: &tokio::sync::Notify,
) -> ProcessOutcome {
    if redelivery_count >= redelivery_threshold {
        warn!(message_id = %id, redelivery_count, "redelivery cap reached, routing to DLQ");
        return ProcessOutcome::Nacked(SmsError::Poisoned(redelivery_count));
    }

    let request = match SmsRequest::from_payload(payload, default_country_code) {
        Ok(r) => r,
        Err(e) => return ProcessOutcome::Nacked(e),
    };

    let lease = match pool.acquire_waiting(cancel).await {
        Ok(lease) => lease,
        Err(e) => return ProcessOutcome::Nacked(e),
    };

    let started = Instant::now();
    let send_result = lease.session().send(&request.phone, &request.body).await;
    let elapsed = started.elapsed();

    match send_result {
        Ok(outcome) if outcome.is_success() => {
            info!(
                message_id = %id,
                segments = outcome.total,
                elapsed_ms = elapsed.as_millis() as u64,
                "sms sent"
            );
            ProcessOutcome::Acked
        }
        Ok(outcome) => {
            let err = outcome
                .error
                .unwrap_or_else(|| SmsError::AtProtocol("send incomplete".into()));
            error!(message_id = %id, succeeded = outcome.succeeded, total = outcome.total, error = %err, "sms send failed");
            ProcessOutcome::Nacked(err)
        }
        Err(e) => {
            error!(message_id = %id, error = %e, "sms send errored");
            ProcessOutcome::Nacked(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_and_normalizes_national_number() {
        let payload = json!({"phone": "13800138000", "content": "hi"}).to_string();
        let req = SmsRequest::from_payload(payload.as_bytes(), "+86").unwrap();
        assert_eq!(req.phone, "+8613800138000");
        assert_eq!(req.body, "hi");
    }

    #[test]
    fn rejects_empty_content() {
        let payload = json!({"phone": "+15551234567", "content": ""}).to_string();
        let err = SmsRequest::from_payload(payload.as_bytes(), "+86").unwrap_err();
        assert!(matches!(err, SmsError::PayloadMalformed(_)));
    }

    #[test]
    fn rejects_malformed_json() {
        let err = SmsRequest::from_payload(b"not json", "+86").unwrap_err();
        assert!(matches!(err, SmsError::PayloadMalformed(_)));
    }

    #[test]
    fn splices_special_metadata_fields_as_a_footer() {
        let footer = splice_metadata_footer(
            "hello",
            &json!({"user_id": "42", "app_id": "billing", "other": "x"}),
        );
        assert_eq!(footer, "hello\n| user_id: 42 | app_id: billing |");
    }

    #[test]
    fn leaves_body_untouched_when_no_special_fields_present() {
        let footer = splice_metadata_footer("hello", &json!({"other": "x"}));
        assert_eq!(footer, "hello");
    }

    #[test]
    fn leaves_body_untouched_for_empty_metadata() {
        let footer = splice_metadata_footer("hello", &json!({}));
        assert_eq!(footer, "hello");
    }
}
