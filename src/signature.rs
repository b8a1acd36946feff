//! Webhook delivery authentication.
//!
//! Deliveries carry a nonce, a unix timestamp and a hex HMAC-SHA256 signature
//! over `nonce + timestamp + payload`. Several secrets may be active at once
//! (rotation, multiple streams); a signature produced by any of them is accepted.

use axum::http::HeaderMap;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{AppError, AppResult};

type HmacSha256 = Hmac<Sha256>;

pub const NONCE_HEADER: &str = "x-qn-nonce";
pub const TIMESTAMP_HEADER: &str = "x-qn-timestamp";
pub const SIGNATURE_HEADER: &str = "x-qn-signature";

pub const DEFAULT_MAX_AGE_SECS: i64 = 300;

/// Per-request authentication envelope extracted from the delivery headers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WebhookEnvelope {
    pub nonce: Option<String>,
    pub timestamp: Option<String>,
    pub signature: Option<String>,
    pub content_encoding: Option<String>,
}

impl WebhookEnvelope {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let get = |name: &str| {
            headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(|value| value.trim().to_string())
        };

        Self {
            nonce: get(NONCE_HEADER),
            timestamp: get(TIMESTAMP_HEADER),
            signature: get(SIGNATURE_HEADER),
            content_encoding: get(axum::http::header::CONTENT_ENCODING.as_str()),
        }
    }

    /// The provider checks connectivity with unsigned, header-less requests.
    pub fn is_ping(&self) -> bool {
        self.nonce.is_none() && self.timestamp.is_none() && self.signature.is_none()
    }
}

/// Hex HMAC-SHA256 of `nonce + timestamp + payload`.
pub fn sign(secret: &str, nonce: &str, timestamp: &str, payload: &str) -> String {
    hex::encode(signing_mac(secret, nonce, timestamp, payload).finalize().into_bytes())
}

fn signing_mac(secret: &str, nonce: &str, timestamp: &str, payload: &str) -> HmacSha256 {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(nonce.as_bytes());
    mac.update(timestamp.as_bytes());
    mac.update(payload.as_bytes());
    mac
}

/// `true` iff `timestamp` is an integer within `max_age_secs` of `now` (inclusive).
pub fn is_timestamp_valid(timestamp: &str, now: i64, max_age_secs: i64) -> bool {
    match timestamp.trim().parse::<i64>() {
        Ok(ts) => now.abs_diff(ts) <= max_age_secs.unsigned_abs(),
        Err(_) => false,
    }
}

#[derive(Debug, Clone)]
pub struct SignatureVerifier {
    secrets: Vec<String>,
    max_age_secs: i64,
}

impl SignatureVerifier {
    pub fn new(secrets: Vec<String>, max_age_secs: i64) -> Self {
        let secrets = secrets
            .into_iter()
            .map(|secret| secret.trim().to_string())
            .filter(|secret| !secret.is_empty())
            .collect();
        Self { secrets, max_age_secs }
    }

    pub fn verify(&self, envelope: &WebhookEnvelope, payload: &str) -> AppResult<()> {
        self.verify_at(envelope, payload, chrono::Utc::now().timestamp())
    }

    /// Header presence and freshness. Needs no body, so it runs before the
    /// payload is decompressed.
    pub fn check_envelope(&self, envelope: &WebhookEnvelope) -> AppResult<()> {
        self.check_envelope_at(envelope, chrono::Utc::now().timestamp())
            .map(|_| ())
    }

    fn check_envelope_at<'a>(
        &self,
        envelope: &'a WebhookEnvelope,
        now: i64,
    ) -> AppResult<(&'a str, &'a str, &'a str)> {
        let (Some(nonce), Some(timestamp), Some(signature)) = (
            envelope.nonce.as_deref(),
            envelope.timestamp.as_deref(),
            envelope.signature.as_deref(),
        ) else {
            return Err(AppError::Auth("Missing signature headers".to_string()));
        };

        if !is_timestamp_valid(timestamp, now, self.max_age_secs) {
            return Err(AppError::StaleRequest(format!(
                "Timestamp {} outside the {}s window",
                timestamp, self.max_age_secs
            )));
        }
        Ok((nonce, timestamp, signature))
    }

    pub fn verify_at(&self, envelope: &WebhookEnvelope, payload: &str, now: i64) -> AppResult<()> {
        let (nonce, timestamp, signature) = self.check_envelope_at(envelope, now)?;

        if !self.signature_matches(nonce, timestamp, signature, payload) {
            return Err(AppError::Auth("Signature mismatch".to_string()));
        }

        Ok(())
    }

    /// Constant-time check of `signature` against every configured secret.
    pub fn signature_matches(&self, nonce: &str, timestamp: &str, signature: &str, payload: &str) -> bool {
        // Only canonical lowercase hex is accepted, so a case flip is a mismatch.
        if !signature.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return false;
        }
        let Ok(expected) = hex::decode(signature) else {
            return false;
        };

        self.secrets.iter().fold(false, |matched, secret| {
            let ok = signing_mac(secret, nonce, timestamp, payload)
                .verify_slice(&expected)
                .is_ok();
            matched | ok
        })
    }
}
