use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use mintbridge_core::id::AccountId;

/// Transaction hash type (32-byte array)
pub type TransactionHash = [u8; 32];

/// Kind of a settled ledger transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionKind {
    AccountCreate,
    TokenCreate,
    TokenMint,
}

/// Final status reported in a receipt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReceiptStatus {
    Success,
    Failed,
}

// TransactionId names a submission by its payer and valid-start time,
// rendered as `payer@seconds.nanos`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionId {
    pub payer: AccountId,
    pub valid_start: DateTime<Utc>,
}

impl TransactionId {
    pub fn new(payer: AccountId, valid_start: DateTime<Utc>) -> Self {
        Self { payer, valid_start }
    }

    pub fn hash(&self, kind: TransactionKind, nonce: u64) -> TransactionHash {
        let mut hasher = Sha256::new();

        // Domain separator
        hasher.update(b"MINTBRIDGE_Tx");
        hasher.update(self.to_string().as_bytes());
        hasher.update(format!("{:?}", kind).as_bytes());
        hasher.update(nonce.to_le_bytes());

        hasher.finalize().into()
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}.{:09}",
            self.payer,
            self.valid_start.timestamp(),
            self.valid_start.timestamp_subsec_nanos()
        )
    }
}

/// A receipt of a settled transaction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionReceipt {
    pub transaction_id: TransactionId,

    pub transaction_hash: TransactionHash,

    pub kind: TransactionKind,

    pub status: ReceiptStatus,

    /// Consensus time assigned by the ledger
    pub consensus_timestamp: DateTime<Utc>,

    /// Entity the transaction created (account, token class or token), if any
    pub created_entity: Option<String>,

    /// Any error message from the execution (if not successful)
    pub error_message: Option<String>,
}

impl TransactionReceipt {
    pub fn success(
        transaction_id: TransactionId,
        transaction_hash: TransactionHash,
        kind: TransactionKind,
        created_entity: String,
    ) -> Self {
        Self {
            transaction_id,
            transaction_hash,
            kind,
            status: ReceiptStatus::Success,
            consensus_timestamp: Utc::now(),
            created_entity: Some(created_entity),
            error_message: None,
        }
    }

    pub fn failure(
        transaction_id: TransactionId,
        transaction_hash: TransactionHash,
        kind: TransactionKind,
        error: String,
    ) -> Self {
        Self {
            transaction_id,
            transaction_hash,
            kind,
            status: ReceiptStatus::Failed,
            consensus_timestamp: Utc::now(),
            created_entity: None,
            error_message: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ReceiptStatus::Success
    }
}
