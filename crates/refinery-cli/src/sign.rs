//! Signs a capture file the way a capture agent would, for manual ingest
//! testing with curl or similar.

use std::path::Path;

use anyhow::Context;
use chrono::Utc;
use refinery_core::{AppConfig, RawCapture, Validate};
use refinery_pipeline::IngestVerifier;
use serde::Serialize;
use uuid::Uuid;

/// The three authentication headers an ingest request carries.
#[derive(Debug, Serialize, PartialEq, Eq)]
pub(crate) struct SignedHeaders {
    #[serde(rename = "x-refinery-signature")]
    pub signature: String,
    #[serde(rename = "x-refinery-timestamp")]
    pub timestamp: String,
    #[serde(rename = "x-refinery-nonce")]
    pub nonce: String,
}

/// Checks that `body` is a valid capture, then signs it.
///
/// # Errors
///
/// Returns an error if `body` is not a capture payload or fails validation.
pub(crate) fn sign_capture(
    verifier: &IngestVerifier,
    body: &[u8],
    timestamp_ms: i64,
    nonce: &str,
) -> anyhow::Result<SignedHeaders> {
    let capture: RawCapture =
        serde_json::from_slice(body).context("file is not a capture payload")?;
    capture
        .validate()
        .context("capture would be rejected at ingest")?;

    Ok(SignedHeaders {
        signature: verifier.sign(body),
        timestamp: timestamp_ms.to_string(),
        nonce: nonce.to_string(),
    })
}

pub(crate) fn run(config: &AppConfig, file: &Path, nonce: Option<String>) -> anyhow::Result<()> {
    let secret = config
        .ingest_hmac_secret
        .as_deref()
        .context("REFINERY_INGEST_HMAC_SECRET is required to sign captures")?;
    let verifier = IngestVerifier::new(secret)?;

    let body = std::fs::read(file).with_context(|| format!("failed to read {}", file.display()))?;
    let nonce = nonce.unwrap_or_else(|| Uuid::new_v4().to_string());

    let headers = sign_capture(&verifier, &body, Utc::now().timestamp_millis(), &nonce)?;
    println!("{}", serde_json::to_string_pretty(&headers)?);
    Ok(())
}
