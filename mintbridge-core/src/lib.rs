pub mod config;
pub mod error;
pub mod hbar;
pub mod id;
pub mod keys;
pub mod objects;
pub mod summary;

// Re-export the main types for convenience
pub use crate::config::{EngineConfig, IssuanceMode};
pub use error::{LedgerError, MarketError, StorageError, StreamError, ValidationError};
pub use hbar::Hbar;
pub use id::{AccountId, AccountRef, EntityId, LedgerTokenId, TokenClassId};
pub use keys::{KeyPair, PrivateKey, PublicKey};
pub use objects::{DistributionRecord, LedgerAccount, MarketState, TokenAsset, TokenMetadata};
pub use summary::{BatchSummary, FailureKind, RecordFailure};
