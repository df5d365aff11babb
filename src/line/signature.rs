//! Webhook signature verification
//!
//! LINE signs every webhook delivery with HMAC-SHA256 over the raw
//! request body, base64-encoded into the `x-line-signature` header.
//! Verification runs over the exact byte stream as received, never a
//! re-serialized JSON document.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::AppError;

/// Header carrying the webhook signature.
pub const SIGNATURE_HEADER: &str = "x-line-signature";

/// Compute the base64 HMAC-SHA256 signature for a body.
///
/// Used by tests to sign synthetic deliveries the same way LINE does.
pub fn sign_body(channel_secret: &str, body: &[u8]) -> Result<String, AppError> {
    type HmacSha256 = Hmac<Sha256>;
    let mut mac = HmacSha256::new_from_slice(channel_secret.as_bytes())
        .map_err(|e| AppError::Internal(anyhow::anyhow!("HMAC init failed: {e}")))?;
    mac.update(body);
    Ok(BASE64.encode(mac.finalize().into_bytes()))
}

/// Verify a webhook signature against the raw body bytes.
///
/// Pure function, no side effects. Comparison happens in constant
/// time via `Mac::verify_slice`.
///
/// # Errors
/// `AppError::InvalidSignature` if the header does not match the body.
pub fn verify_signature(
    channel_secret: &str,
    body: &[u8],
    signature_header: &str,
) -> Result<(), AppError> {
    type HmacSha256 = Hmac<Sha256>;
    let mut mac = HmacSha256::new_from_slice(channel_secret.as_bytes())
        .map_err(|e| AppError::Internal(anyhow::anyhow!("HMAC init failed: {e}")))?;
    mac.update(body);

    let expected = BASE64
        .decode(signature_header)
        .map_err(|_| AppError::InvalidSignature)?;

    mac.verify_slice(&expected)
        .map_err(|_| AppError::InvalidSignature)?;

    Ok(())
}
