use async_trait::async_trait;

use mintbridge_core::error::StorageError;
use mintbridge_core::id::{AccountId, AccountRef, LedgerTokenId};
use mintbridge_core::objects::{LedgerAccount, TokenAsset};

/// Result of an idempotent token upsert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// A new row was written
    Inserted,
    /// A row with the same serial already existed; nothing changed
    Skipped,
}

/// Local mirror of ledger tokens, their marketplace status, and provisioned accounts.
///
/// The single atomic primitive is [`StateStore::buy_token`]; everything else is either an
/// idempotent write or a read.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Insert a token unless its serial is already present
    ///
    /// # Parameters
    /// * `asset` - The token to mirror
    ///
    /// # Returns
    /// `Skipped` if a row with the same serial exists. A different serial reusing an existing
    /// ledger token id is an error.
    async fn upsert_token(&self, asset: &TokenAsset) -> Result<UpsertOutcome, StorageError>;

    /// Insert an account unless its ledger account id is already present
    async fn upsert_account(&self, account: &LedgerAccount) -> Result<UpsertOutcome, StorageError>;

    /// All tokens currently listed for sale
    async fn list_for_sale(&self) -> Result<Vec<TokenAsset>, StorageError>;

    /// All tokens in insertion order
    async fn list_all(&self) -> Result<Vec<TokenAsset>, StorageError>;

    /// Mark a token as listed
    ///
    /// # Returns
    /// `StorageError::NotFound` if no row has this ledger token id
    async fn set_for_sale(&self, ledger_token_id: &LedgerTokenId) -> Result<(), StorageError>;

    /// Transfer a listed token to `buyer` in one conditional update
    ///
    /// # Parameters
    /// * `ledger_token_id` - The token to buy
    /// * `buyer` - The account that becomes the owner
    ///
    /// # Returns
    /// The number of rows changed: 1 if the token was for sale, 0 otherwise
    async fn buy_token(
        &self,
        ledger_token_id: &LedgerTokenId,
        buyer: &AccountRef,
    ) -> Result<u64, StorageError>;

    /// Get a token by its ledger token id
    async fn get_token(&self, ledger_token_id: &LedgerTokenId)
        -> Result<Option<TokenAsset>, StorageError>;

    /// Whether a token with this serial has been mirrored
    async fn contains_serial(&self, serial: &str) -> Result<bool, StorageError>;

    /// Get an account by its ledger account id
    async fn get_account(&self, account_id: &AccountId)
        -> Result<Option<LedgerAccount>, StorageError>;

    async fn list_accounts(&self) -> Result<Vec<LedgerAccount>, StorageError>;

    /// Wait for open connections to finish and release them
    async fn close(&self);
}
