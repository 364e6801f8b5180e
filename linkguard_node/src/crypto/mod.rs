// Crypto module for the LinkGuard node
//
// Key exchange, ingest decryption and claim authentication. Transport
// confidentiality comes from RSA-OAEP; claim authenticity comes from the HMAC
// check in `origin`, never from the encryption layer.

pub mod decryptor;
pub mod key_exchange;
pub mod origin;

pub use decryptor::{seal, seal_claim, IngestDecryptor};
pub use key_exchange::{KeyExchange, KEY_BITS};
pub use origin::OriginVerifier;
