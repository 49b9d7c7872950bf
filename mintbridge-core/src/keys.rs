use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::error::ValidationError;

pub use ed25519_dalek::Signature;

/// DER prefix of an Ed25519 private key (PKCS#8)
const PRIVATE_KEY_DER_PREFIX: &str = "302e020100300506032b657004220420";

/// DER prefix of an Ed25519 public key (SubjectPublicKeyInfo)
const PUBLIC_KEY_DER_PREFIX: &str = "302a300506032b6570032100";

/// Decode either DER-prefixed hex or raw 32-byte hex
fn decode_key(field: &str, raw: &str, der_prefix: &str) -> Result<[u8; 32], ValidationError> {
    let raw = raw.trim();
    let raw = raw.strip_prefix("0x").unwrap_or(raw);
    let body = if raw.len() == der_prefix.len() + 64 && raw.to_ascii_lowercase().starts_with(der_prefix) {
        &raw[der_prefix.len()..]
    } else {
        raw
    };

    let bytes = hex::decode(body).map_err(|e| ValidationError::new(field, e.to_string()))?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| ValidationError::new(field, format!("expected 32 bytes, got {}", b.len())))
}

/// The public half of an Ed25519 key pair
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey(VerifyingKey);

impl PublicKey {
    /// Fails if `bytes` is not a valid compressed Edwards point
    pub fn from_bytes(bytes: [u8; 32]) -> Result<Self, ValidationError> {
        VerifyingKey::from_bytes(&bytes)
            .map(PublicKey)
            .map_err(|e| ValidationError::new("public_key", e.to_string()))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }

    /// Check an Ed25519 signature over `message`
    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        self.0.verify(message, signature).is_ok()
    }

    /// Hex string with the DER prefix, the form the ledger tooling prints
    pub fn to_der_hex(&self) -> String {
        format!("{}{}", PUBLIC_KEY_DER_PREFIX, hex::encode(self.as_bytes()))
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_der_hex())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", hex::encode(&self.as_bytes()[..6]))
    }
}

impl FromStr for PublicKey {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PublicKey::from_bytes(decode_key("public_key", s, PUBLIC_KEY_DER_PREFIX)?)
    }
}

/// An Ed25519 signing key
#[derive(Clone, PartialEq, Eq)]
pub struct PrivateKey(SigningKey);

impl PrivateKey {
    /// Generate a fresh key from the operating system's RNG
    pub fn generate() -> Self {
        PrivateKey(SigningKey::generate(&mut OsRng))
    }

    pub fn from_bytes(seed: [u8; 32]) -> Self {
        PrivateKey(SigningKey::from_bytes(&seed))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.0.verifying_key())
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.0.sign(message)
    }

    pub fn to_der_hex(&self) -> String {
        format!("{}{}", PRIVATE_KEY_DER_PREFIX, hex::encode(self.as_bytes()))
    }
}

// Never print key material through Debug
impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey(..)")
    }
}

impl FromStr for PrivateKey {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode_key("private_key", s, PRIVATE_KEY_DER_PREFIX).map(PrivateKey::from_bytes)
    }
}

macro_rules! string_serde {
    ($ty:ty) => {
        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_der_hex())
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let raw = String::deserialize(deserializer)?;
                raw.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

string_serde!(PublicKey);
string_serde!(PrivateKey);

/// A freshly generated key pair
#[derive(Debug, Clone)]
pub struct KeyPair {
    pub private_key: PrivateKey,
    pub public_key: PublicKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        Self::from_private(PrivateKey::generate())
    }

    pub fn from_private(private_key: PrivateKey) -> Self {
        let public_key = private_key.public_key();
        Self {
            private_key,
            public_key,
        }
    }
}
