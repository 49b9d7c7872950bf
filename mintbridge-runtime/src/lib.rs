pub mod engine;
pub mod ingest;
pub mod marketplace;
pub mod orchestrator;

// Re-export the main types for convenience
pub use engine::{EngineError, IssuanceEngine};
pub use ingest::{
    BatchIngestor,
    ByteStream,
    FileObjectFetcher,
    InMemoryObjectFetcher,
    IngestedRecord,
    ObjectFetcher,
    ObjectLocation,
    RecordStream
};
pub use marketplace::MarketplaceStateMachine;
pub use orchestrator::{IssuanceError, TokenLifecycleOrchestrator};
