// Long-lived RSA keypair for the ingest path
//
// The keypair is provisioned once (`linkguard-node keygen`) and loaded from the
// secret store at startup. Nothing on the request path ever generates keys.

use crate::config::SecretsConfig;
use crate::error::{LinkGuardError, Result};
use rand::rngs::OsRng;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use zeroize::Zeroizing;

/// Modulus size used for newly provisioned keys
pub const KEY_BITS: usize = 2048;

/// OAEP overhead with a SHA-256 label hash: two digests plus two bytes
const OAEP_SHA256_OVERHEAD: usize = 2 * 32 + 2;

/// File names written by `save`
pub const PRIVATE_KEY_FILE: &str = "private_key.pem";
pub const PUBLIC_KEY_FILE: &str = "public_key.pem";

/// The service's asymmetric keypair.
pub struct KeyExchange {
    private_key: RsaPrivateKey,
    public_key: RsaPublicKey,
    public_pem: String,
}

impl KeyExchange {
    /// Generate a fresh keypair. Provisioning only.
    pub fn generate(bits: usize) -> Result<Self> {
        if bits < KEY_BITS {
            return Err(LinkGuardError::Encryption(format!(
                "Refusing to generate a {}-bit key, minimum is {}",
                bits, KEY_BITS
            )));
        }

        debug!("Generating {}-bit RSA keypair", bits);
        let private_key = RsaPrivateKey::new(&mut OsRng, bits)
            .map_err(|e| LinkGuardError::Encryption(format!("Failed to generate key: {}", e)))?;

        Self::from_private_key(private_key)
    }

    /// Parse a PEM private key, PKCS#8 first and PKCS#1 as a fallback.
    pub fn from_pem(pem: &str) -> Result<Self> {
        let private_key = RsaPrivateKey::from_pkcs8_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
            .map_err(|e| {
                LinkGuardError::Encryption(format!("Failed to parse private key: {}", e))
            })?;

        Self::from_private_key(private_key)
    }

    /// Load the keypair named by the secrets configuration.
    pub fn load(secrets: &SecretsConfig) -> Result<Self> {
        let keys = if let Some(pem) = &secrets.private_key_pem {
            debug!("Loading private key from inline secret");
            Self::from_pem(pem)?
        } else if let Some(path) = &secrets.private_key_path {
            debug!("Loading private key from {:?}", path);
            let pem = Zeroizing::new(fs::read_to_string(path).map_err(|e| {
                LinkGuardError::Config(format!("Failed to read private key {:?}: {}", path, e))
            })?);
            Self::from_pem(&pem)?
        } else {
            return Err(LinkGuardError::Config(
                "No private key configured".to_string(),
            ));
        };

        info!("Loaded {}-bit ingest keypair", keys.modulus_bits());
        Ok(keys)
    }

    fn from_private_key(private_key: RsaPrivateKey) -> Result<Self> {
        let bits = private_key.size() * 8;
        if bits < KEY_BITS {
            return Err(LinkGuardError::Encryption(format!(
                "Private key is {} bits, minimum is {}",
                bits, KEY_BITS
            )));
        }

        let public_key = RsaPublicKey::from(&private_key);
        let public_pem = public_key
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| LinkGuardError::Encryption(format!("Failed to encode public key: {}", e)))?;

        Ok(Self {
            private_key,
            public_key,
            public_pem,
        })
    }

    /// SPKI PEM of the public half, as served on `/keys`.
    pub fn public_key_pem(&self) -> &str {
        &self.public_pem
    }

    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public_key
    }

    pub(crate) fn private_key(&self) -> &RsaPrivateKey {
        &self.private_key
    }

    /// PKCS#8 PEM of the private half. Provisioning only.
    pub fn private_key_pem(&self) -> Result<Zeroizing<String>> {
        self.private_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| LinkGuardError::Encryption(format!("Failed to encode private key: {}", e)))
    }

    pub fn modulus_bits(&self) -> usize {
        self.public_key.size() * 8
    }

    /// Largest plaintext an OAEP/SHA-256 ciphertext can carry under this key.
    pub fn max_plaintext_len(&self) -> usize {
        self.public_key.size() - OAEP_SHA256_OVERHEAD
    }

    /// Write both halves into `dir`. The private key file is created owner-only
    /// on unix.
    pub fn save(&self, dir: &Path) -> Result<(PathBuf, PathBuf)> {
        fs::create_dir_all(dir)?;

        let private_path = dir.join(PRIVATE_KEY_FILE);
        let public_path = dir.join(PUBLIC_KEY_FILE);

        if private_path.exists() {
            return Err(LinkGuardError::Config(format!(
                "Refusing to overwrite existing key at {:?}",
                private_path
            )));
        }

        let private_pem = self.private_key_pem()?;
        write_private(&private_path, private_pem.as_bytes())?;
        fs::write(&public_path, self.public_pem.as_bytes())?;

        info!("Wrote keypair to {:?}", dir);
        Ok((private_path, public_path))
    }
}

#[cfg(unix)]
fn write_private(path: &Path, contents: &[u8]) -> Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(contents)?;
    Ok(())
}

#[cfg(not(unix))]
fn write_private(path: &Path, contents: &[u8]) -> Result<()> {
    fs::write(path, contents)?;
    Ok(())
}
