use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use mintbridge_core::error::LedgerError;
use mintbridge_core::hbar::Hbar;
use mintbridge_core::id::{AccountId, LedgerTokenId, TokenClassId};
use mintbridge_core::keys::{PrivateKey, PublicKey};
use mintbridge_core::objects::LedgerAccount;

/// How many tokens a class may ever mint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SupplyPolicy {
    Infinite,
    Finite { max_supply: u64 },
}

/// Fee charged on every transfer of a token, paid to `collector`.
/// `fallback_fee` applies when a transfer carries no fungible value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoyaltyFee {
    pub numerator: u64,
    pub denominator: u64,
    pub fallback_fee: Hbar,
    pub collector: AccountId,
}

/// Definition of a non-fungible token class
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClassSpec {
    pub name: String,
    pub symbol: String,
    /// Initial holder of every minted token
    pub treasury: AccountId,
    pub admin_key: PublicKey,
    pub supply_key: PublicKey,
    pub supply: SupplyPolicy,
    pub royalty: Option<RoyaltyFee>,
}

/// Facade over the distributed ledger.
///
/// Every call returns only after the transaction has settled. Nothing is retried; a failed call
/// reports a [`LedgerError`] and leaves retry policy to the caller. All submissions are paid for
/// and signed by [`LedgerClient::operator`].
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// The paying account all submissions are signed by
    fn operator(&self) -> AccountId;

    /// Create a new account funded with `initial_balance` from the operator
    ///
    /// # Returns
    /// The new account id together with its generated key material
    async fn create_account(&self, initial_balance: Hbar) -> Result<LedgerAccount, LedgerError>;

    /// Create a non-fungible token class. Called once per batch.
    async fn create_token_class(&self, spec: &TokenClassSpec) -> Result<TokenClassId, LedgerError>;

    /// Mint one token under `class`, signed with the class's supply key
    ///
    /// # Returns
    /// The identifier the ledger assigned to the new token
    async fn mint_token(
        &self,
        class: &TokenClassId,
        metadata: &[u8],
        supply_key: &PrivateKey,
    ) -> Result<LedgerTokenId, LedgerError>;
}
