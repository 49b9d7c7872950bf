pub mod client;
pub mod memory;
pub mod receipt;
pub mod sequencer;

// Re-export the main types for convenience
pub use client::{LedgerClient, RoyaltyFee, SupplyPolicy, TokenClassSpec};
pub use memory::{FeeSchedule, InMemoryLedger};
pub use receipt::{
    ReceiptStatus,
    TransactionHash,
    TransactionId,
    TransactionKind,
    TransactionReceipt
};
pub use sequencer::SequencedLedger;
