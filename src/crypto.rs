//! Cryptographic primitives for OrderChain
//!
//! Hashing, the proof-of-work difficulty predicate, the rolling Merkle
//! commitment folded over block operations, and secp256k1 wallet keys.

use crate::error::ChainError;
use once_cell::sync::Lazy;
use rand::rngs::OsRng;
use secp256k1::{
    constants::{COMPACT_SIGNATURE_SIZE, PUBLIC_KEY_SIZE, SECRET_KEY_SIZE},
    ecdsa::Signature,
    All, Message, PublicKey, Secp256k1, SecretKey,
};
use sha2::{Digest, Sha256};

/// A thread-safe, lazily initialized Secp256k1 context.
static SECP256K1_CONTEXT: Lazy<Secp256k1<All>> = Lazy::new(Secp256k1::new);

pub type Sha256Hash = [u8; 32];

/// Deterministic hash used for block headers, operation keys and the rolling root.
pub fn hash(bytes: &[u8]) -> Sha256Hash {
    Sha256::digest(bytes).into()
}

/// Returns true when `digest` has at least `target` leading zero bits.
pub fn meets_difficulty(target: u32, digest: &Sha256Hash) -> bool {
    leading_zero_bits(digest) >= target
}

pub fn leading_zero_bits(digest: &Sha256Hash) -> u32 {
    let mut bits = 0;
    for byte in digest {
        if *byte == 0 {
            bits += 8;
        } else {
            bits += byte.leading_zeros();
            break;
        }
    }
    bits
}

/// Running hash accumulator folded over every eligible operation of a block,
/// in category order: `root' = H(hex(root) ++ encoding)`.
///
/// An empty block has no root at all.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RollingRoot(Option<Sha256Hash>);

impl RollingRoot {
    pub fn new() -> Self {
        Self(None)
    }

    pub fn fold(&mut self, encoded: &str) {
        let prefix = self.0.map(hex::encode).unwrap_or_default();
        let mut input = String::with_capacity(prefix.len() + encoded.len());
        input.push_str(&prefix);
        input.push_str(encoded);
        self.0 = Some(hash(input.as_bytes()));
    }

    pub fn folded(mut self, encoded: &str) -> Self {
        self.fold(encoded);
        self
    }

    pub fn value(&self) -> Option<Sha256Hash> {
        self.0
    }
}

/// Derive the wallet address (hex SHA-256 of the compressed public key).
pub fn address_from_public_key(public_key_bytes: &[u8]) -> String {
    hex::encode(hash(public_key_bytes))
}

#[derive(Debug, Clone)]
pub struct KeyPair {
    pub secret_key: SecretKey,
    pub public_key: PublicKey,
}

impl KeyPair {
    /// Generates a new random KeyPair using the OS random number generator.
    pub fn generate() -> Result<Self, ChainError> {
        let secret_key = SecretKey::new(&mut OsRng);
        let public_key = PublicKey::from_secret_key(&SECP256K1_CONTEXT, &secret_key);

        Ok(KeyPair {
            secret_key,
            public_key,
        })
    }

    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, ChainError> {
        let secret_key = SecretKey::from_slice(bytes).map_err(|e| {
            if bytes.len() != SECRET_KEY_SIZE {
                ChainError::CryptoError(format!(
                    "Secret key must be {} bytes, got {}",
                    SECRET_KEY_SIZE,
                    bytes.len()
                ))
            } else {
                ChainError::CryptoError(format!("Invalid secret key bytes: {}", e))
            }
        })?;
        let public_key = PublicKey::from_secret_key(&SECP256K1_CONTEXT, &secret_key);

        Ok(KeyPair {
            secret_key,
            public_key,
        })
    }

    pub fn address(&self) -> String {
        address_from_public_key(&self.public_key_bytes())
    }

    pub fn public_key_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.public_key.serialize()
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key_bytes())
    }

    /// Signs a message (which is first hashed using SHA-256) and returns the compact signature bytes.
    pub fn sign(&self, message: &[u8]) -> Result<[u8; COMPACT_SIGNATURE_SIZE], ChainError> {
        let digest = Sha256::digest(message);
        let message = Message::from_digest_slice(&digest)
            .map_err(|e| ChainError::CryptoError(format!("Failed to create message: {}", e)))?;

        let signature = SECP256K1_CONTEXT.sign_ecdsa(&message, &self.secret_key);
        Ok(signature.serialize_compact())
    }
}

/// Verifies an ECDSA signature given the raw public key bytes, message, and signature bytes.
pub fn verify_signature(
    public_key_bytes: &[u8],
    message: &[u8],
    signature_bytes: &[u8],
) -> Result<(), ChainError> {
    if public_key_bytes.len() != PUBLIC_KEY_SIZE {
        return Err(ChainError::CryptoError(format!(
            "Public key must be exactly {} bytes (compressed), got {}",
            PUBLIC_KEY_SIZE,
            public_key_bytes.len()
        )));
    }
    if signature_bytes.len() != COMPACT_SIGNATURE_SIZE {
        return Err(ChainError::CryptoError(format!(
            "Signature must be exactly {} bytes (compact), got {}",
            COMPACT_SIGNATURE_SIZE,
            signature_bytes.len()
        )));
    }

    let public_key = PublicKey::from_slice(public_key_bytes)
        .map_err(|e| ChainError::CryptoError(format!("Invalid public key: {}", e)))?;

    let digest = Sha256::digest(message);
    let message = Message::from_digest_slice(&digest)
        .map_err(|e| ChainError::CryptoError(format!("Failed to create message: {}", e)))?;

    let signature = Signature::from_compact(signature_bytes)
        .map_err(|e| ChainError::CryptoError(format!("Invalid signature: {}", e)))?;

    SECP256K1_CONTEXT
        .verify_ecdsa(&message, &signature, &public_key)
        .map_err(|_| ChainError::CryptoError("Signature verification failed".to_string()))
}

/// Hex-encoded variant used by signed ledger operations. Also checks that the
/// public key belongs to `wallet`.
pub fn verify_wallet_signature(
    wallet: &str,
    public_key_hex: &str,
    message: &[u8],
    signature_hex: &str,
) -> Result<(), ChainError> {
    let public_key = hex::decode(public_key_hex)
        .map_err(|e| ChainError::CryptoError(format!("Invalid hex public key: {}", e)))?;
    if address_from_public_key(&public_key) != wallet {
        return Err(ChainError::CryptoError(format!(
            "Public key does not belong to wallet {}",
            wallet
        )));
    }
    let signature = hex::decode(signature_hex)
        .map_err(|e| ChainError::CryptoError(format!("Invalid hex signature: {}", e)))?;
    verify_signature(&public_key, message, &signature)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meets_difficulty() {
        let mut digest = [0xFFu8; 32];
        assert!(meets_difficulty(0, &digest));
        assert!(!meets_difficulty(1, &digest));

        digest[0] = 0;
        digest[1] = 0b0001_0000;
        assert_eq!(leading_zero_bits(&digest), 11);
        assert!(meets_difficulty(11, &digest));
        assert!(!meets_difficulty(12, &digest));

        assert_eq!(leading_zero_bits(&[0u8; 32]), 256);
    }

    #[test]
    fn test_rolling_root_is_deterministic() {
        let a = RollingRoot::new().folded("deposit").folded("offer");
        let b = RollingRoot::new().folded("deposit").folded("offer");
        assert_eq!(a, b);
        assert!(a.value().is_some());

        let swapped = RollingRoot::new().folded("offer").folded("deposit");
        assert_ne!(a, swapped);
        assert_eq!(RollingRoot::new().value(), None);
    }

    #[test]
    fn test_rolling_root_first_fold_uses_empty_prefix() {
        let root = RollingRoot::new().folded("abc");
        assert_eq!(root.value(), Some(hash(b"abc")));

        let second = root.folded("def");
        let expected = hash(format!("{}def", hex::encode(hash(b"abc"))).as_bytes());
        assert_eq!(second.value(), Some(expected));
    }

    #[test]
    fn test_signing_and_verification() {
        let keypair = KeyPair::generate().unwrap();
        let message = b"Hello, OrderChain!";

        let signature = keypair.sign(message).unwrap();
        assert!(verify_signature(&keypair.public_key_bytes(), message, &signature).is_ok());
        assert_eq!(signature.len(), COMPACT_SIGNATURE_SIZE);
    }

    #[test]
    fn test_wallet_signature_checks_owner() {
        let owner = KeyPair::generate().unwrap();
        let other = KeyPair::generate().unwrap();
        let message = b"withdraw";
        let signature = hex::encode(owner.sign(message).unwrap());

        assert!(verify_wallet_signature(&owner.address(), &owner.public_key_hex(), message, &signature).is_ok());

        let result = verify_wallet_signature(&other.address(), &owner.public_key_hex(), message, &signature);
        assert!(result.unwrap_err().to_string().contains("does not belong"));
    }

    #[test]
    fn test_invalid_signature() {
        let keypair1 = KeyPair::generate().unwrap();
        let keypair2 = KeyPair::generate().unwrap();

        let message = b"Test message";
        let signature = keypair1.sign(message).unwrap();

        let result = verify_signature(&keypair2.public_key_bytes(), message, &signature);
        assert_eq!(
            result.unwrap_err().to_string(),
            "Cryptographic error: Signature verification failed"
        );
    }

    #[test]
    fn test_from_secret_bytes_invalid_length() {
        let short_bytes = [0u8; SECRET_KEY_SIZE - 1];
        let result = KeyPair::from_secret_bytes(&short_bytes);
        assert!(result.unwrap_err().to_string().contains("Secret key must be"));
    }
}
