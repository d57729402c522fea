//! # Webhook Signature Verification
//!
//! HMAC-SHA256 verification of raw webhook bodies against a connection's stored
//! secret, driven by the provider's [`SignatureScheme`]. Digests are compared in
//! constant time.

use axum::http::{HeaderMap, StatusCode};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::debug;

use crate::connectors::{SignatureEncoding, SignatureScheme};

type HmacSha256 = Hmac<Sha256>;

/// Errors that can occur during webhook signature verification
#[derive(Debug, thiserror::Error)]
pub enum VerificationError {
    #[error("Missing required signature header: {header}")]
    MissingSignature { header: String },

    #[error("Invalid signature format in {header}")]
    InvalidSignatureFormat { header: String },

    #[error("Signature verification failed")]
    VerificationFailed,
}

impl VerificationError {
    pub fn status_code(&self) -> StatusCode {
        StatusCode::UNAUTHORIZED
    }
}

pub type VerificationResult<T> = Result<T, VerificationError>;

/// Signature value the provider sent, if any.
pub fn claimed_signature(scheme: &SignatureScheme, headers: &HeaderMap) -> Option<String> {
    headers
        .get(scheme.header.as_str())
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// Computes the signature a provider would send for `body`, including any prefix.
pub fn sign(scheme: &SignatureScheme, secret: &str, body: &[u8]) -> VerificationResult<String> {
    let digest = hmac_sha256(secret, body)?;
    let encoded = match scheme.encoding {
        SignatureEncoding::Hex => hex::encode(digest),
        SignatureEncoding::Base64 => STANDARD.encode(digest),
    };
    Ok(format!(
        "{}{}",
        scheme.prefix.as_deref().unwrap_or_default(),
        encoded
    ))
}

/// Verifies `claimed` against the HMAC-SHA256 of `body` keyed with `secret`.
pub fn verify_signature(
    scheme: &SignatureScheme,
    secret: &str,
    body: &[u8],
    claimed: Option<&str>,
) -> VerificationResult<()> {
    debug!(body_size = body.len(), header = %scheme.header, "Verifying webhook signature");

    let claimed = claimed
        .filter(|c| !c.is_empty())
        .ok_or_else(|| VerificationError::MissingSignature {
            header: scheme.header.clone(),
        })?;

    let encoded = match scheme.prefix.as_deref() {
        Some(prefix) => claimed.strip_prefix(prefix).ok_or_else(|| {
            VerificationError::InvalidSignatureFormat {
                header: scheme.header.clone(),
            }
        })?,
        None => claimed,
    };

    let provided = match scheme.encoding {
        SignatureEncoding::Hex => hex::decode(encoded).ok(),
        SignatureEncoding::Base64 => STANDARD.decode(encoded).ok(),
    }
    .ok_or_else(|| VerificationError::InvalidSignatureFormat {
        header: scheme.header.clone(),
    })?;

    let expected = hmac_sha256(secret, body)?;
    if expected.as_slice().ct_eq(&provided[..]).into() {
        Ok(())
    } else {
        Err(VerificationError::VerificationFailed)
    }
}

fn hmac_sha256(secret: &str, body: &[u8]) -> VerificationResult<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| VerificationError::VerificationFailed)?;
    mac.update(body);
    Ok(mac.finalize().into_bytes().to_vec())
}
