//! Ed25519 verification of inbound webhook requests against the
//! application's static public key.

use ed25519_dalek::{Signature, VerifyingKey};

use crate::error::{Result, SystemError};

pub struct SignatureVerifier {
    key: VerifyingKey,
}

impl SignatureVerifier {
    /// Build from the hex-encoded 32-byte public key (`PUBLIC_KEY`).
    pub fn new(public_key_hex: &str) -> Result<Self> {
        let bytes = hex::decode(public_key_hex).map_err(|e| {
            SystemError::Config {
                reason: format!("PUBLIC_KEY is not valid hex: {e}"),
            }
        })?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|_| SystemError::Config {
            reason: "PUBLIC_KEY must be 32 bytes".to_string(),
        })?;
        let key = VerifyingKey::from_bytes(&bytes).map_err(|e| SystemError::Config {
            reason: format!("PUBLIC_KEY is not a valid Ed25519 key: {e}"),
        })?;
        Ok(Self { key })
    }

    /// Check the signature over `timestamp || body`.
    pub fn verify(&self, signature_hex: &str, timestamp: &str, body: &[u8]) -> bool {
        let Ok(signature_bytes) = hex::decode(signature_hex) else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(&signature_bytes) else {
            return false;
        };

        let mut message = Vec::with_capacity(timestamp.len() + body.len());
        message.extend_from_slice(timestamp.as_bytes());
        message.extend_from_slice(body);

        self.key.verify_strict(&message, &signature).is_ok()
    }
}
