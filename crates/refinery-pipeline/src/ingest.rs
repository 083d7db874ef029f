//! Authentication and replay protection for inbound capture batches.
//!
//! Checks run in a fixed order (signature, timestamp, nonce, rate limit) and
//! the first failure wins. Recording the nonce is the only side effect.

use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use refinery_core::{CaptureRepo, ConfigError, NonceLedger, StoreError};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Largest accepted distance between the claimed timestamp and now.
pub const MAX_TIMESTAMP_SKEW_MS: i64 = 5 * 60 * 1000;

/// Minimum spacing between two ingests from the same source feed.
pub const MIN_INGEST_INTERVAL_SECS: i64 = 60;

/// Why an ingest request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum VerifyRejection {
    #[error("invalid signature")]
    InvalidSignature,
    #[error("timestamp too old or too far in the future")]
    StaleOrFutureTimestamp,
    #[error("duplicate nonce, possible replay")]
    ReplayDetected,
    #[error("rate limit exceeded, wait at least {MIN_INGEST_INTERVAL_SECS}s between ingests")]
    RateLimited,
}

impl VerifyRejection {
    /// Stable machine-readable code.
    #[must_use]
    pub fn code(self) -> &'static str {
        match self {
            Self::InvalidSignature => "invalid_signature",
            Self::StaleOrFutureTimestamp => "stale_or_future_timestamp",
            Self::ReplayDetected => "replay_detected",
            Self::RateLimited => "rate_limited",
        }
    }
}

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error(transparent)]
    Rejected(#[from] VerifyRejection),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The authentication material carried by one ingest request.
#[derive(Debug, Clone, Copy)]
pub struct IngestRequest<'a> {
    /// Exact request bytes as received.
    pub body: &'a [u8],
    /// Hex HMAC-SHA256 claimed by the sender.
    pub signature: &'a str,
    /// Epoch milliseconds claimed by the sender.
    pub timestamp_ms: i64,
    pub nonce: &'a str,
    pub source_feed: &'a str,
}

/// Holds the shared secret and verifies ingest requests against it.
#[derive(Clone)]
pub struct IngestVerifier {
    mac: HmacSha256,
}

impl std::fmt::Debug for IngestVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestVerifier")
            .field("mac", &"[redacted]")
            .finish()
    }
}

impl IngestVerifier {
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingEnvVar`] when `secret` is empty.
    pub fn new(secret: &str) -> Result<Self, ConfigError> {
        if secret.is_empty() {
            return Err(ConfigError::MissingEnvVar(
                "REFINERY_INGEST_HMAC_SECRET".to_string(),
            ));
        }
        let mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|e| {
            ConfigError::InvalidEnvVar {
                var: "REFINERY_INGEST_HMAC_SECRET".to_string(),
                reason: e.to_string(),
            }
        })?;
        Ok(Self { mac })
    }

    /// Lowercase hex HMAC-SHA256 of `body`.
    #[must_use]
    pub fn sign(&self, body: &[u8]) -> String {
        let mut mac = self.mac.clone();
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    /// Constant-time check of `claimed` against the signature of `body`.
    /// Non-hex or wrong-length input is simply a mismatch.
    #[must_use]
    pub fn verify_signature(&self, body: &[u8], claimed: &str) -> bool {
        let Ok(claimed) = hex::decode(claimed) else {
            return false;
        };
        let mut mac = self.mac.clone();
        mac.update(body);
        let expected = mac.finalize().into_bytes();
        expected.as_slice().ct_eq(&claimed).into()
    }

    /// Runs every check in order against `store`.
    ///
    /// # Errors
    ///
    /// Returns [`VerifyError::Rejected`] with the first failed check, or
    /// [`VerifyError::Store`] if the nonce or capture lookup fails.
    pub async fn verify<S>(
        &self,
        store: &S,
        request: &IngestRequest<'_>,
        now: DateTime<Utc>,
    ) -> Result<(), VerifyError>
    where
        S: NonceLedger + CaptureRepo + ?Sized,
    {
        if !self.verify_signature(request.body, request.signature) {
            return Err(VerifyRejection::InvalidSignature.into());
        }

        if !verify_timestamp(now.timestamp_millis(), request.timestamp_ms) {
            return Err(VerifyRejection::StaleOrFutureTimestamp.into());
        }

        if !store.record_nonce(request.nonce, now).await? {
            return Err(VerifyRejection::ReplayDetected.into());
        }

        if let Some(last) = store.latest_ingest_at(request.source_feed).await? {
            if now - last < Duration::seconds(MIN_INGEST_INTERVAL_SECS) {
                return Err(VerifyRejection::RateLimited.into());
            }
        }

        Ok(())
    }
}

/// Whether `claimed_ms` is within [`MAX_TIMESTAMP_SKEW_MS`] of `now_ms`,
/// in either direction, boundary inclusive.
#[must_use]
pub fn verify_timestamp(now_ms: i64, claimed_ms: i64) -> bool {
    now_ms.abs_diff(claimed_ms) <= MAX_TIMESTAMP_SKEW_MS.unsigned_abs()
}

#[cfg(test)]
mod tests {
    use refinery_core::CaptureRepo;
    use refinery_db::MemoryStore;

    use super::*;
    use crate::test_support::capture_from_feed;

    const SECRET: &str = "test-secret-key-min-32-characters!";
    const BODY: &[u8] = br#"{"test":"data"}"#;

    fn verifier() -> IngestVerifier {
        IngestVerifier::new(SECRET).expect("verifier")
    }

    fn request<'a>(signature: &'a str, timestamp_ms: i64, nonce: &'a str) -> IngestRequest<'a> {
        IngestRequest {
            body: BODY,
            signature,
            timestamp_ms,
            nonce,
            source_feed: "home-timeline",
        }
    }

    #[test]
    fn signature_is_lowercase_hex_sha256() {
        let sig = verifier().sign(BODY);
        assert_eq!(sig.len(), 64);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(sig, verifier().sign(BODY));
    }

    #[test]
    fn signature_round_trips() {
        let v = verifier();
        assert!(v.verify_signature(BODY, &v.sign(BODY)));
    }

    #[test]
    fn single_byte_changes_break_the_signature() {
        let v = verifier();
        let sig = v.sign(BODY);

        assert!(!v.verify_signature(br#"{"test":"datb"}"#, &sig));

        let mut flipped = sig.clone().into_bytes();
        flipped[0] = if flipped[0] == b'0' { b'1' } else { b'0' };
        let flipped = String::from_utf8(flipped).expect("ascii");
        assert!(!v.verify_signature(BODY, &flipped));

        let other = IngestVerifier::new("test-secret-key-min-32-characters?").expect("verifier");
        assert!(!other.verify_signature(BODY, &sig));
    }

    #[test]
    fn malformed_signatures_are_mismatches() {
        let v = verifier();
        assert!(!v.verify_signature(BODY, "not-hex-at-all!"));
        assert!(!v.verify_signature(BODY, "abcd"));
        assert!(!v.verify_signature(BODY, ""));
    }

    #[test]
    fn empty_secret_cannot_build_a_verifier() {
        assert!(matches!(
            IngestVerifier::new(""),
            Err(ConfigError::MissingEnvVar(_))
        ));
    }

    #[test]
    fn timestamp_window_is_inclusive() {
        let now = 1_700_000_000_000;
        assert!(verify_timestamp(now, now));
        assert!(verify_timestamp(now, now - 300_000));
        assert!(verify_timestamp(now, now + 300_000));
        assert!(!verify_timestamp(now, now - 300_001));
        assert!(!verify_timestamp(now, now + 300_001));
    }

    #[test]
    fn rejection_codes_are_stable() {
        assert_eq!(VerifyRejection::InvalidSignature.code(), "invalid_signature");
        assert_eq!(
            VerifyRejection::StaleOrFutureTimestamp.code(),
            "stale_or_future_timestamp"
        );
        assert_eq!(VerifyRejection::ReplayDetected.code(), "replay_detected");
        assert_eq!(VerifyRejection::RateLimited.code(), "rate_limited");
    }

    #[tokio::test]
    async fn valid_request_passes_and_records_the_nonce() {
        let store = MemoryStore::new();
        let v = verifier();
        let sig = v.sign(BODY);
        let now = Utc::now();

        v.verify(&store, &request(&sig, now.timestamp_millis(), "n-1"), now)
            .await
            .expect("should verify");

        let replay = v
            .verify(&store, &request(&sig, now.timestamp_millis(), "n-1"), now)
            .await;
        assert!(matches!(
            replay,
            Err(VerifyError::Rejected(VerifyRejection::ReplayDetected))
        ));
    }

    #[tokio::test]
    async fn bad_signature_short_circuits_before_the_nonce() {
        let store = MemoryStore::new();
        let v = verifier();
        let now = Utc::now();

        let bad = v
            .verify(&store, &request("00", now.timestamp_millis(), "n-2"), now)
            .await;
        assert!(matches!(
            bad,
            Err(VerifyError::Rejected(VerifyRejection::InvalidSignature))
        ));

        // The nonce was never consumed.
        let sig = v.sign(BODY);
        v.verify(&store, &request(&sig, now.timestamp_millis(), "n-2"), now)
            .await
            .expect("nonce should still be fresh");
    }

    #[tokio::test]
    async fn stale_timestamp_is_rejected() {
        let store = MemoryStore::new();
        let v = verifier();
        let sig = v.sign(BODY);
        let now = Utc::now();
        let stale = now.timestamp_millis() - 6 * 60 * 1000;

        let result = v.verify(&store, &request(&sig, stale, "n-3"), now).await;
        assert!(matches!(
            result,
            Err(VerifyError::Rejected(VerifyRejection::StaleOrFutureTimestamp))
        ));
    }

    #[tokio::test]
    async fn recent_ingest_from_the_same_feed_is_rate_limited() {
        let store = MemoryStore::new();
        let capture = capture_from_feed("home-timeline");
        store.insert_capture(&capture).await.expect("insert");

        let v = verifier();
        let sig = v.sign(BODY);
        let now = Utc::now();

        let result = v
            .verify(&store, &request(&sig, now.timestamp_millis(), "n-4"), now)
            .await;
        assert!(matches!(
            result,
            Err(VerifyError::Rejected(VerifyRejection::RateLimited))
        ));

        store.backdate_capture(capture.capture_id, now - Duration::seconds(61));
        v.verify(&store, &request(&sig, now.timestamp_millis(), "n-5"), now)
            .await
            .expect("interval has elapsed");
    }
}
