// Ingest payload decryption
//
// The body of an ingest request is a text-encoded RSA-OAEP/SHA-256 ciphertext
// of a small JSON claim. There is no hybrid envelope, so claims are bounded by
// the key modulus.

use crate::config::CiphertextEncoding;
use crate::crypto::key_exchange::KeyExchange;
use crate::error::{LinkGuardError, Result};
use crate::types::ClaimPayload;
use base64::engine::general_purpose::STANDARD;
use base64::engine::Engine;
use rand::rngs::OsRng;
use rsa::{Oaep, RsaPublicKey};
use sha2::Sha256;
use std::sync::Arc;
use tracing::debug;
use zeroize::Zeroizing;

/// Turns an ingest body into a candidate claim.
pub struct IngestDecryptor {
    keys: Arc<KeyExchange>,
    encoding: CiphertextEncoding,
}

impl IngestDecryptor {
    pub fn new(keys: Arc<KeyExchange>, encoding: CiphertextEncoding) -> Self {
        Self { keys, encoding }
    }

    /// Decode, decrypt and parse a request body.
    ///
    /// Every failure is reported as `InvalidPayload`; the error text names the
    /// failing stage but never includes payload bytes.
    pub fn decrypt(&self, body: &[u8]) -> Result<ClaimPayload> {
        let ciphertext = decode_body(body, self.encoding)?;

        let plaintext = Zeroizing::new(
            self.keys
                .private_key()
                .decrypt(Oaep::new::<Sha256>(), &ciphertext)
                .map_err(|_| LinkGuardError::InvalidPayload("decryption failed".to_string()))?,
        );

        parse_claim(&plaintext)
    }
}

/// Strip transport noise and decode the ciphertext text.
fn decode_body(body: &[u8], encoding: CiphertextEncoding) -> Result<Vec<u8>> {
    let text = std::str::from_utf8(body)
        .map_err(|_| LinkGuardError::InvalidPayload("body is not text".to_string()))?
        .trim();
    let text = text
        .strip_prefix('"')
        .and_then(|t| t.strip_suffix('"'))
        .unwrap_or(text);

    if text.is_empty() {
        return Err(LinkGuardError::InvalidPayload("empty body".to_string()));
    }

    match encoding {
        CiphertextEncoding::Base64 => STANDARD
            .decode(text)
            .map_err(|_| LinkGuardError::InvalidPayload("body is not base64".to_string())),
        CiphertextEncoding::Hex => hex::decode(text)
            .map_err(|_| LinkGuardError::InvalidPayload("body is not hex".to_string())),
    }
}

/// Parse decrypted bytes into a claim with all fields present and non-empty.
fn parse_claim(plaintext: &[u8]) -> Result<ClaimPayload> {
    let text = std::str::from_utf8(plaintext)
        .map_err(|_| LinkGuardError::InvalidPayload("plaintext is not UTF-8".to_string()))?;

    let claim: ClaimPayload = serde_json::from_str(text).map_err(|e| {
        debug!("Claim JSON rejected at line {} column {}", e.line(), e.column());
        LinkGuardError::InvalidPayload("malformed claim".to_string())
    })?;

    for (field, value) in [
        ("fingerprint", &claim.fingerprint),
        ("id", &claim.id),
        ("hash", &claim.hash),
    ] {
        if value.trim().is_empty() {
            return Err(LinkGuardError::InvalidPayload(format!(
                "claim field `{}` is empty",
                field
            )));
        }
    }

    Ok(claim)
}

/// Encrypt a plaintext for the node and encode it the way the ingest endpoint
/// expects. This is the sending side of `IngestDecryptor`, used by trusted
/// backends and tests.
pub fn seal(
    public_key: &RsaPublicKey,
    plaintext: &[u8],
    encoding: CiphertextEncoding,
) -> Result<String> {
    let ciphertext = public_key
        .encrypt(&mut OsRng, Oaep::new::<Sha256>(), plaintext)
        .map_err(|e| LinkGuardError::Encryption(format!("Failed to encrypt payload: {}", e)))?;

    Ok(match encoding {
        CiphertextEncoding::Base64 => STANDARD.encode(ciphertext),
        CiphertextEncoding::Hex => hex::encode(ciphertext),
    })
}

/// Serialize and seal a claim in one step.
pub fn seal_claim(
    public_key: &RsaPublicKey,
    claim: &ClaimPayload,
    encoding: CiphertextEncoding,
) -> Result<String> {
    let plaintext = Zeroizing::new(
        serde_json::to_vec(claim)
            .map_err(|e| LinkGuardError::Internal(format!("Failed to encode claim: {}", e)))?,
    );
    seal(public_key, &plaintext, encoding)
}
