use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ValidationError;

// EntityId identifies an account or token class on the ledger.
// It renders as `shard.realm.num`, e.g. `0.0.4512`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId {
    pub shard: u64,
    pub realm: u64,
    pub num: u64,
}

/// A ledger account identifier
pub type AccountId = EntityId;

/// A token class identifier
pub type TokenClassId = EntityId;

impl EntityId {
    pub const fn new(shard: u64, realm: u64, num: u64) -> Self {
        Self { shard, realm, num }
    }

    /// Entity in the default shard and realm
    pub const fn from_num(num: u64) -> Self {
        Self::new(0, 0, num)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.shard, self.realm, self.num)
    }
}

impl FromStr for EntityId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ValidationError::new("entity_id", format!("`{}` is not shard.realm.num", s));

        let mut parts = s.trim().split('.');
        let mut next = || -> Result<u64, ValidationError> {
            parts
                .next()
                .and_then(|p| p.parse::<u64>().ok())
                .ok_or_else(invalid)
        };
        let id = EntityId::new(next()?, next()?, next()?);
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(id)
    }
}

/// Prefix used for identifiers of tokens that were mirrored without a ledger mint
pub const MIRROR_TOKEN_PREFIX: &str = "TOKEN-";

// LedgerTokenId is the identifier the ledger assigned to one minted token.
// Minted tokens are `<class>/<serial number>`; mirror-only tokens are `TOKEN-<serial>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LedgerTokenId(String);

impl LedgerTokenId {
    /// Identifier of the `serial_number`-th token minted under `class`
    pub fn minted(class: &TokenClassId, serial_number: u64) -> Self {
        LedgerTokenId(format!("{}/{}", class, serial_number))
    }

    /// Synthetic identifier for a token recorded without touching the ledger
    pub fn mirrored(serial: &str) -> Self {
        LedgerTokenId(format!("{}{}", MIRROR_TOKEN_PREFIX, serial))
    }

    /// Parse a caller-supplied identifier; only emptiness is rejected
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(ValidationError::missing("token_id"));
        }
        Ok(LedgerTokenId(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Split a minted identifier into its class and serial number
    pub fn class_and_serial(&self) -> Option<(TokenClassId, u64)> {
        let (class, serial) = self.0.split_once('/')?;
        Some((class.parse().ok()?, serial.parse().ok()?))
    }

    pub fn is_mirrored(&self) -> bool {
        self.0.starts_with(MIRROR_TOKEN_PREFIX)
    }
}

impl fmt::Display for LedgerTokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for LedgerTokenId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// AccountRef is the owning-account column of the mirror. Buyers are free-form
// references supplied by the marketplace caller, so this is not an EntityId.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountRef(String);

impl AccountRef {
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(ValidationError::missing("buyer_account"));
        }
        Ok(AccountRef(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<AccountId> for AccountRef {
    fn from(id: AccountId) -> Self {
        AccountRef(id.to_string())
    }
}

impl fmt::Display for AccountRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
