// Claim authentication
//
// The public key is public, so anyone can produce a well-formed ciphertext.
// What binds an account id to the trusted backend is an HMAC under a secret
// only the backend and this node hold.

use crate::error::{LinkGuardError, Result};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

/// Checks that an account id claim was issued by the trusted backend.
pub struct OriginVerifier {
    secret: Zeroizing<Vec<u8>>,
}

impl OriginVerifier {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: Zeroizing::new(secret.as_ref().to_vec()),
        }
    }

    fn tag(&self, account_id: &str) -> Result<Vec<u8>> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| LinkGuardError::Internal(format!("Invalid HMAC key: {}", e)))?;
        mac.update(account_id.as_bytes());
        Ok(mac.finalize().into_bytes().to_vec())
    }

    /// Hex HMAC-SHA256 of the account id, as the backend would send it.
    pub fn sign(&self, account_id: &str) -> Result<String> {
        Ok(hex::encode(self.tag(account_id)?))
    }

    /// Verify a submitted hex hash against the account id.
    pub fn verify(&self, account_id: &str, claimed_hash: &str) -> Result<()> {
        let claimed = hex::decode(claimed_hash.trim())
            .map_err(|_| LinkGuardError::Authentication("claim hash is not hex".to_string()))?;
        let expected = self.tag(account_id)?;

        if claimed.len() != expected.len() {
            return Err(LinkGuardError::Authentication(
                "claim hash has the wrong length".to_string(),
            ));
        }

        if bool::from(expected.ct_eq(claimed.as_slice())) {
            Ok(())
        } else {
            Err(LinkGuardError::Authentication(
                "claim hash mismatch".to_string(),
            ))
        }
    }
}
