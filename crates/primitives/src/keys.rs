//! secp256k1 signing adapter.
//!
//! Public keys travel as 65-byte uncompressed points, signatures as DER.
//! Signing is always over a 32-byte digest (the txid).

use std::fmt;
use std::sync::OnceLock;

use emberd_consensus::Hash256;
use rand::RngCore;
use secp256k1::{ecdsa, Message, PublicKey, Secp256k1, SecretKey};

pub const PUBLIC_KEY_BYTES: usize = 65;

pub type PublicKeyBytes = [u8; PUBLIC_KEY_BYTES];

fn secp() -> &'static Secp256k1<secp256k1::All> {
    static SECP: OnceLock<Secp256k1<secp256k1::All>> = OnceLock::new();
    SECP.get_or_init(Secp256k1::new)
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum KeyError {
    InvalidSecretKey,
    InvalidPublicKey,
}

impl fmt::Display for KeyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyError::InvalidSecretKey => write!(f, "invalid secret key"),
            KeyError::InvalidPublicKey => write!(f, "invalid public key"),
        }
    }
}

impl std::error::Error for KeyError {}

#[derive(Clone)]
pub struct Keypair {
    secret: SecretKey,
    public: PublicKeyBytes,
}

impl Keypair {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        loop {
            rand::thread_rng().fill_bytes(&mut bytes);
            if let Ok(secret) = SecretKey::from_slice(&bytes) {
                return Self::from_secret(secret);
            }
        }
    }

    pub fn from_secret_hex(value: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(value).map_err(|_| KeyError::InvalidSecretKey)?;
        let secret = SecretKey::from_slice(&bytes).map_err(|_| KeyError::InvalidSecretKey)?;
        Ok(Self::from_secret(secret))
    }

    fn from_secret(secret: SecretKey) -> Self {
        let public = PublicKey::from_secret_key(secp(), &secret).serialize_uncompressed();
        Self { secret, public }
    }

    pub fn public(&self) -> &PublicKeyBytes {
        &self.public
    }

    pub fn public_hex(&self) -> String {
        hex::encode(self.public)
    }

    pub fn secret_hex(&self) -> String {
        hex::encode(self.secret.secret_bytes())
    }

    /// DER-encoded ECDSA signature over a 32-byte digest.
    pub fn sign(&self, digest: &Hash256) -> Vec<u8> {
        let message = Message::from_digest(*digest);
        secp()
            .sign_ecdsa(&message, &self.secret)
            .serialize_der()
            .to_vec()
    }
}

pub fn verify(digest: &Hash256, der: &[u8], public_key: &PublicKeyBytes) -> bool {
    let Ok(public) = PublicKey::from_slice(public_key) else {
        return false;
    };
    let Ok(signature) = ecdsa::Signature::from_der(der) else {
        return false;
    };
    let message = Message::from_digest(*digest);
    secp().verify_ecdsa(&message, &signature, &public).is_ok()
}

pub fn public_key_from_hex(value: &str) -> Result<PublicKeyBytes, KeyError> {
    let bytes = hex::decode(value).map_err(|_| KeyError::InvalidPublicKey)?;
    let mut out = [0u8; PUBLIC_KEY_BYTES];
    if bytes.len() != out.len() {
        return Err(KeyError::InvalidPublicKey);
    }
    out.copy_from_slice(&bytes);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify_roundtrip() {
        let keypair = Keypair::generate();
        let digest = crate::hash::sha256(b"payload");
        let signature = keypair.sign(&digest);
        assert!(verify(&digest, &signature, keypair.public()));

        let other = crate::hash::sha256(b"other payload");
        assert!(!verify(&other, &signature, keypair.public()));
        assert!(!verify(&digest, &signature, Keypair::generate().public()));
    }

    #[test]
    fn secret_hex_roundtrip() {
        let keypair = Keypair::generate();
        let restored = Keypair::from_secret_hex(&keypair.secret_hex()).expect("restore");
        assert_eq!(restored.public(), keypair.public());
    }

    #[test]
    fn uncompressed_point_prefix() {
        let keypair = Keypair::generate();
        assert_eq!(keypair.public()[0], 0x04);
    }
}
