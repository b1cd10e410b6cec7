//! Inbound payment-processor webhooks: signature verification and event
//! decoding. Payloads are only parsed after the signature checks out.

use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying `t=<unix ts>,v1=<hex hmac>[,v1=...]`
pub const SIGNATURE_HEADER: &str = "stripe-signature";

const PAYMENT_SUCCEEDED: &str = "payment_intent.succeeded";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WebhookError {
    #[error("Stripe signature is missing")]
    MissingHeader,
    #[error("Unable to extract timestamp and signatures from header")]
    MalformedHeader,
    #[error("Timestamp outside the tolerance zone")]
    TimestampOutsideTolerance,
    #[error("No signatures found matching the expected signature for payload")]
    NoMatchingSignature,
    #[error("Webhook signing secret is not configured")]
    SecretNotConfigured,
    #[error("Webhook signing secret is not a usable HMAC key")]
    InvalidSecret,
    #[error("Invalid webhook payload: {0}")]
    InvalidPayload(String),
}

/// Decoded event. Only confirmed payments carrying checkout metadata drive
/// order creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentEvent {
    PaymentSucceeded {
        event_id: Option<String>,
        payment_intent_id: Option<String>,
        session_id: Uuid,
        user_id: String,
    },
    Other {
        event_id: Option<String>,
        event_type: String,
    },
}

#[derive(Deserialize)]
struct RawEvent {
    id: Option<String>,
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    data: RawEventData,
}

#[derive(Deserialize, Default)]
struct RawEventData {
    #[serde(default)]
    object: Value,
}

struct SignatureHeader<'a> {
    timestamp: i64,
    signatures: Vec<&'a str>,
}

fn parse_header(header: &str) -> Result<SignatureHeader<'_>, WebhookError> {
    let mut timestamp = None;
    let mut signatures = Vec::new();

    for part in header.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else {
            continue;
        };
        match key {
            "t" => timestamp = value.parse::<i64>().ok(),
            "v1" => signatures.push(value),
            _ => {}
        }
    }

    match timestamp {
        Some(timestamp) if !signatures.is_empty() => Ok(SignatureHeader {
            timestamp,
            signatures,
        }),
        _ => Err(WebhookError::MalformedHeader),
    }
}

#[derive(Clone)]
pub struct WebhookVerifier {
    secret: String,
    tolerance_secs: u64,
}

impl WebhookVerifier {
    pub fn new(secret: impl Into<String>, tolerance_secs: u64) -> Self {
        Self {
            secret: secret.into(),
            tolerance_secs,
        }
    }

    fn mac(&self, timestamp: i64, payload: &[u8]) -> Result<HmacSha256, WebhookError> {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|_| WebhookError::InvalidSecret)?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        Ok(mac)
    }

    /// Signature header value for `payload` at `timestamp`.
    pub fn sign(&self, payload: &[u8], timestamp: i64) -> Result<String, WebhookError> {
        let digest = self.mac(timestamp, payload)?.finalize().into_bytes();
        Ok(format!("t={},v1={}", timestamp, hex::encode(digest)))
    }

    /// Checks the signature header against the raw body at time `now`.
    pub fn verify_at(
        &self,
        header: Option<&str>,
        payload: &[u8],
        now: i64,
    ) -> Result<(), WebhookError> {
        let header = header.ok_or(WebhookError::MissingHeader)?;
        let parsed = parse_header(header)?;
        let mac = self.mac(parsed.timestamp, payload)?;

        let matched = parsed.signatures.iter().any(|candidate| {
            hex::decode(candidate)
                .map(|expected| mac.clone().verify_slice(&expected).is_ok())
                .unwrap_or(false)
        });
        if !matched {
            return Err(WebhookError::NoMatchingSignature);
        }

        if self.tolerance_secs > 0 && (now - parsed.timestamp).unsigned_abs() > self.tolerance_secs
        {
            return Err(WebhookError::TimestampOutsideTolerance);
        }

        Ok(())
    }

    pub fn verify(&self, header: Option<&str>, payload: &[u8]) -> Result<(), WebhookError> {
        self.verify_at(header, payload, chrono::Utc::now().timestamp())
    }

    /// Verifies, then decodes the event.
    pub fn construct_event(
        &self,
        header: Option<&str>,
        payload: &[u8],
    ) -> Result<PaymentEvent, WebhookError> {
        self.verify(header, payload)?;
        decode_event(payload)
    }
}

fn decode_event(payload: &[u8]) -> Result<PaymentEvent, WebhookError> {
    let raw: RawEvent = serde_json::from_slice(payload)
        .map_err(|e| WebhookError::InvalidPayload(e.to_string()))?;

    if raw.event_type != PAYMENT_SUCCEEDED {
        return Ok(PaymentEvent::Other {
            event_id: raw.id,
            event_type: raw.event_type,
        });
    }

    let object = &raw.data.object;
    let payment_intent_id = object.get("id").and_then(Value::as_str).map(str::to_string);
    let metadata = object.get("metadata");
    let session_id = metadata
        .and_then(|m| m.get("sessionId"))
        .and_then(Value::as_str)
        .and_then(|s| Uuid::parse_str(s).ok());
    let user_id = metadata
        .and_then(|m| m.get("userId"))
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty());

    match (session_id, user_id) {
        (Some(session_id), Some(user_id)) => Ok(PaymentEvent::PaymentSucceeded {
            event_id: raw.id,
            payment_intent_id,
            session_id,
            user_id: user_id.to_string(),
        }),
        _ => {
            warn!(
                event_id = raw.id.as_deref().unwrap_or("-"),
                "Payment succeeded without checkout metadata; ignoring"
            );
            Ok(PaymentEvent::Other {
                event_id: raw.id,
                event_type: raw.event_type,
            })
        }
    }
}
