use serde::{Deserialize, Serialize};

use crate::id::TokenClassId;
use crate::objects::TokenAsset;

/// Why a single record did not produce a token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// The row could not be parsed or was missing a required field
    Malformed,
    /// The ledger rejected the mint
    Ledger,
    /// The mirror write failed. `diverged` is set when the token exists on the ledger.
    Storage { diverged: bool },
}

/// A per-record failure, recorded against the record's serial when it has one
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordFailure {
    /// Line of the record in the batch file
    pub line: u64,
    pub serial: Option<String>,
    pub kind: FailureKind,
    pub message: String,
}

impl RecordFailure {
    pub fn is_divergence(&self) -> bool {
        matches!(self.kind, FailureKind::Storage { diverged: true })
    }
}

/// Outcome of issuing one batch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    /// Token class created for this batch, if the batch was minted on-ledger
    pub token_class: Option<TokenClassId>,

    /// Records read from the batch, malformed ones included
    pub total_records: u64,

    /// Tokens created and mirrored, in arrival order
    pub created: Vec<TokenAsset>,

    /// Serials skipped because they were already present
    pub duplicates: Vec<String>,

    /// Records that failed, in arrival order
    pub failures: Vec<RecordFailure>,
}

impl BatchSummary {
    pub fn created_count(&self) -> usize {
        self.created.len()
    }

    pub fn duplicate_count(&self) -> usize {
        self.duplicates.len()
    }

    pub fn failed_serials(&self) -> Vec<&str> {
        self.failures
            .iter()
            .filter_map(|f| f.serial.as_deref())
            .collect()
    }

    /// Failures where the ledger holds a token the mirror does not
    pub fn divergences(&self) -> impl Iterator<Item = &RecordFailure> {
        self.failures.iter().filter(|f| f.is_divergence())
    }
}
