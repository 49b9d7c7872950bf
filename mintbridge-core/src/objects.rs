use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::id::{AccountId, AccountRef, LedgerTokenId, TokenClassId};
use crate::keys::{PrivateKey, PublicKey};

/// Largest metadata payload the ledger accepts for a single token
pub const MAX_METADATA_BYTES: usize = 100;

/// Date format used by distribution batches
pub const DISTRIBUTION_DATE_FORMAT: &str = "%Y-%m-%d";

/// One row of a distribution batch. Lives only for the duration of an ingest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributionRecord {
    /// Row identifier assigned by the batch producer (not unique across batches)
    pub id: String,
    pub name: String,
    pub region: String,
    pub district: String,
    pub village: String,
    pub phone: String,
    /// Device serial, expected to be globally unique
    pub serial: String,
    pub country: String,
    pub distribution_date: NaiveDate,
}

impl DistributionRecord {
    /// Metadata written on-ledger for this record
    pub fn metadata(&self) -> TokenMetadata {
        TokenMetadata {
            serial: self.serial.clone(),
            phone: self.phone.clone(),
        }
    }
}

/// The on-ledger payload of a minted token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenMetadata {
    pub serial: String,
    pub phone: String,
}

impl TokenMetadata {
    /// Compact JSON encoding; rejected when it would not fit on the ledger
    pub fn to_bytes(&self) -> Result<Vec<u8>, ValidationError> {
        let bytes = serde_json::to_vec(self)
            .map_err(|e| ValidationError::new("metadata", e.to_string()))?;
        if bytes.len() > MAX_METADATA_BYTES {
            return Err(ValidationError::new(
                "metadata",
                format!("{} bytes exceeds the {} byte limit", bytes.len(), MAX_METADATA_BYTES),
            ));
        }
        Ok(bytes)
    }
}

/// A ledger-backed token mirrored into the local store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenAsset {
    /// Copy of the distribution row the token was issued for
    pub record: DistributionRecord,

    /// Identifier the ledger assigned at mint time; immutable afterwards
    pub ledger_token_id: LedgerTokenId,

    /// Token class the token was minted under, absent for mirror-only issuance
    pub token_class_id: Option<TokenClassId>,

    /// Current owner, if any
    pub account: Option<AccountRef>,

    /// Whether the token is listed on the marketplace
    pub for_sale: bool,

    pub created_at: DateTime<Utc>,
}

impl TokenAsset {
    /// A freshly issued, unlisted token
    pub fn issue(
        record: DistributionRecord,
        ledger_token_id: LedgerTokenId,
        token_class_id: Option<TokenClassId>,
        account: Option<AccountRef>,
    ) -> Self {
        Self {
            record,
            ledger_token_id,
            token_class_id,
            account,
            for_sale: false,
            created_at: Utc::now(),
        }
    }

    pub fn serial(&self) -> &str {
        &self.record.serial
    }

    pub fn market_state(&self) -> MarketState {
        MarketState::of(self.for_sale, self.account.as_ref())
    }
}

/// Marketplace position of a token, derived from its mirror row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarketState {
    /// Never listed and not owned
    Unlisted,
    /// Listed and waiting for a buyer
    ForSale,
    /// Held by an account and not listed
    Owned(AccountRef),
}

impl MarketState {
    pub fn of(for_sale: bool, account: Option<&AccountRef>) -> Self {
        match (for_sale, account) {
            (true, _) => MarketState::ForSale,
            (false, Some(account)) => MarketState::Owned(account.clone()),
            (false, None) => MarketState::Unlisted,
        }
    }
}

/// A provisioned ledger account and its key material
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerAccount {
    pub account_id: AccountId,
    pub public_key: PublicKey,
    pub private_key: PrivateKey,
}
