use futures::StreamExt;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinSet;

use mintbridge_core::config::{IssuanceConfig, IssuanceMode};
use mintbridge_core::error::{LedgerError, StorageError, StreamError, ValidationError};
use mintbridge_core::hbar::Hbar;
use mintbridge_core::id::{AccountRef, LedgerTokenId, TokenClassId};
use mintbridge_core::keys::PrivateKey;
use mintbridge_core::objects::{DistributionRecord, TokenAsset};
use mintbridge_core::summary::{BatchSummary, FailureKind, RecordFailure};
use mintbridge_ledger::client::{LedgerClient, RoyaltyFee, SupplyPolicy, TokenClassSpec};
use mintbridge_storage_impl::storage_traits::{StateStore, UpsertOutcome};

use crate::ingest::{IngestedRecord, RecordStream};

/// Errors that stop a batch as a whole
#[derive(Error, Debug)]
pub enum IssuanceError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("failed to create token class: {0}")]
    TokenClass(#[source] LedgerError),

    #[error("batch stream failed after {} records: {error}", .partial.total_records)]
    Stream {
        #[source]
        error: StreamError,
        /// Outcome of the records processed before the failure
        partial: BatchSummary,
    },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

// What became of one record
enum Outcome {
    Created(TokenAsset),
    Duplicate(String),
    Failed(RecordFailure),
}

// A record that still has to be written to the store
struct PendingWrite {
    line: u64,
    asset: TokenAsset,
    minted: bool,
}

/// Drives a batch from records to mirrored tokens.
///
/// Mints are submitted one at a time in arrival order. Each successful mint is handed to a write
/// task so the next mint can start while the previous token is persisted. A record's failure is
/// recorded in the summary and never stops the batch.
pub struct TokenLifecycleOrchestrator {
    ledger: Arc<dyn LedgerClient>,
    store: Arc<dyn StateStore>,
    config: IssuanceConfig,
    supply_key: Option<PrivateKey>,
}

impl TokenLifecycleOrchestrator {
    /// `supply_key` signs token class creation and mints; it is not needed in mirror-only mode
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        store: Arc<dyn StateStore>,
        config: IssuanceConfig,
        supply_key: Option<PrivateKey>,
    ) -> Self {
        Self {
            ledger,
            store,
            config,
            supply_key,
        }
    }

    pub fn mode(&self) -> IssuanceMode {
        self.config.mode
    }

    fn class_spec(&self, supply_key: &PrivateKey) -> TokenClassSpec {
        let treasury = self.ledger.operator();
        let key = supply_key.public_key();
        let royalty = &self.config.royalty;

        TokenClassSpec {
            name: self.config.token_name.clone(),
            symbol: self.config.token_symbol.clone(),
            treasury,
            admin_key: key,
            supply_key: key,
            supply: match self.config.max_supply {
                Some(max_supply) => SupplyPolicy::Finite { max_supply },
                None => SupplyPolicy::Infinite,
            },
            royalty: royalty.enabled.then(|| RoyaltyFee {
                numerator: royalty.numerator,
                denominator: royalty.denominator,
                fallback_fee: Hbar::new(royalty.fallback_fee_hbar),
                collector: treasury,
            }),
        }
    }

    /// Create the batch's token class, or nothing in mirror-only mode
    async fn prepare(&self) -> Result<Option<TokenClassId>, IssuanceError> {
        if self.config.mode == IssuanceMode::MirrorOnly {
            return Ok(None);
        }

        let supply_key = self
            .supply_key
            .as_ref()
            .ok_or_else(|| ValidationError::missing("operator_private_key"))?;
        let spec = self.class_spec(supply_key);
        let class = self
            .ledger
            .create_token_class(&spec)
            .await
            .map_err(|err| {
                log::error!("token class creation failed: {}", err);
                IssuanceError::TokenClass(err)
            })?;

        log::info!("created token class {} ({})", class, spec.symbol);
        Ok(Some(class))
    }

    /// Process every record of `records` and summarize the batch.
    ///
    /// # Returns
    /// The batch summary, or `IssuanceError::Stream` carrying the summary of the records
    /// processed before the stream failed.
    pub async fn run(&self, mut records: RecordStream) -> Result<BatchSummary, IssuanceError> {
        let token_class = self.prepare().await?;
        log::info!(
            "starting batch in {:?} mode{}",
            self.config.mode,
            token_class
                .map(|class| format!(" under token class {}", class))
                .unwrap_or_default()
        );

        let mut summary = BatchSummary {
            token_class,
            ..Default::default()
        };
        let mut seen = HashSet::new();
        let mut outcomes: Vec<(usize, Outcome)> = Vec::new();
        let mut writes: JoinSet<(usize, Outcome)> = JoinSet::new();
        let max_in_flight = self.config.max_in_flight_writes.max(1);
        let mut stream_error = None;
        let mut index = 0usize;

        while let Some(item) = records.next().await {
            let ingested = match item {
                Ok(ingested) => ingested,
                Err(err) => {
                    log::error!("aborting batch after {} records: {}", index, err);
                    stream_error = Some(err);
                    break;
                }
            };
            summary.total_records += 1;
            let position = index;
            index += 1;

            // A repeated serial may still have its first write in flight; settle those first
            let repeated = matches!(&ingested.record, Ok(record) if seen.contains(&record.serial));
            if repeated && !writes.is_empty() {
                while let Some(joined) = writes.join_next().await {
                    Self::settle(joined, &mut seen, &mut outcomes)?;
                }
            }

            let pending = match self.issue(ingested, token_class, &mut seen).await {
                Ok(pending) => pending,
                Err(outcome) => {
                    outcomes.push((position, outcome));
                    continue;
                }
            };

            while writes.len() >= max_in_flight {
                if let Some(joined) = writes.join_next().await {
                    Self::settle(joined, &mut seen, &mut outcomes)?;
                }
            }
            let store = self.store.clone();
            writes.spawn(async move { (position, Self::persist(store, pending).await) });
        }

        while let Some(joined) = writes.join_next().await {
            Self::settle(joined, &mut seen, &mut outcomes)?;
        }

        outcomes.sort_by_key(|(position, _)| *position);
        for (_, outcome) in outcomes {
            match outcome {
                Outcome::Created(asset) => summary.created.push(asset),
                Outcome::Duplicate(serial) => summary.duplicates.push(serial),
                Outcome::Failed(failure) => summary.failures.push(failure),
            }
        }

        log::info!(
            "batch finished: {} records, {} created, {} duplicates, {} failed",
            summary.total_records,
            summary.created_count(),
            summary.duplicate_count(),
            summary.failures.len()
        );

        match stream_error {
            Some(error) => Err(IssuanceError::Stream {
                error,
                partial: summary,
            }),
            None => Ok(summary),
        }
    }

    /// Mint (or mirror) one record, yielding the write still to be done
    async fn issue(
        &self,
        ingested: IngestedRecord,
        token_class: Option<TokenClassId>,
        seen: &mut HashSet<String>,
    ) -> Result<PendingWrite, Outcome> {
        let IngestedRecord { line, serial, record } = ingested;
        let record = record.map_err(|err| {
            log::warn!("line {}: malformed record: {}", line, err);
            Outcome::Failed(RecordFailure {
                line,
                serial,
                kind: FailureKind::Malformed,
                message: err.to_string(),
            })
        })?;

        if self.is_duplicate(line, &record, seen).await? {
            log::debug!("line {}: serial {} already issued", line, record.serial);
            return Err(Outcome::Duplicate(record.serial));
        }

        let (ledger_token_id, account) = match token_class {
            Some(class) => {
                let token = self.mint(line, &record, &class).await?;
                (token, Some(AccountRef::from(self.ledger.operator())))
            }
            None => (LedgerTokenId::mirrored(&record.serial), None),
        };
        seen.insert(record.serial.clone());
        log::debug!("line {}: serial {} issued as {}", line, record.serial, ledger_token_id);

        Ok(PendingWrite {
            line,
            asset: TokenAsset::issue(record, ledger_token_id, token_class, account),
            minted: token_class.is_some(),
        })
    }

    async fn is_duplicate(
        &self,
        line: u64,
        record: &DistributionRecord,
        seen: &HashSet<String>,
    ) -> Result<bool, Outcome> {
        if seen.contains(&record.serial) {
            return Ok(true);
        }
        self.store
            .contains_serial(&record.serial)
            .await
            .map_err(|err| {
                log::warn!("line {}: duplicate check for {} failed: {}", line, record.serial, err);
                Outcome::Failed(RecordFailure {
                    line,
                    serial: Some(record.serial.clone()),
                    kind: FailureKind::Storage { diverged: false },
                    message: err.to_string(),
                })
            })
    }

    async fn mint(
        &self,
        line: u64,
        record: &DistributionRecord,
        class: &TokenClassId,
    ) -> Result<LedgerTokenId, Outcome> {
        let failure = |kind: FailureKind, message: String| {
            Outcome::Failed(RecordFailure {
                line,
                serial: Some(record.serial.clone()),
                kind,
                message,
            })
        };

        let metadata = record.metadata().to_bytes().map_err(|err| {
            log::warn!("line {}: {}", line, err);
            failure(FailureKind::Malformed, err.to_string())
        })?;
        let supply_key = self
            .supply_key
            .as_ref()
            .ok_or_else(|| failure(FailureKind::Ledger, "no supply key".to_string()))?;

        self.ledger
            .mint_token(class, &metadata, supply_key)
            .await
            .map_err(|err| {
                log::warn!("line {}: mint for serial {} failed: {}", line, record.serial, err);
                failure(FailureKind::Ledger, err.to_string())
            })
    }

    async fn persist(store: Arc<dyn StateStore>, pending: PendingWrite) -> Outcome {
        let PendingWrite {
            line,
            asset,
            minted,
        } = pending;

        match store.upsert_token(&asset).await {
            Ok(UpsertOutcome::Inserted) => Outcome::Created(asset),
            Ok(UpsertOutcome::Skipped) => {
                if minted {
                    log::warn!(
                        "line {}: serial {} was mirrored concurrently; ledger token {} is orphaned",
                        line,
                        asset.serial(),
                        asset.ledger_token_id
                    );
                }
                Outcome::Duplicate(asset.record.serial)
            }
            Err(err) => {
                if minted {
                    log::warn!(
                        "line {}: ledger token {} for serial {} was not mirrored: {}",
                        line,
                        asset.ledger_token_id,
                        asset.serial(),
                        err
                    );
                } else {
                    log::warn!("line {}: failed to store serial {}: {}", line, asset.serial(), err);
                }
                Outcome::Failed(RecordFailure {
                    line,
                    serial: Some(asset.record.serial),
                    kind: FailureKind::Storage { diverged: minted },
                    message: err.to_string(),
                })
            }
        }
    }

    /// Record a finished write. A serial whose write failed before anything reached the ledger
    /// leaves the seen set so a later row can issue it.
    fn settle(
        joined: Result<(usize, Outcome), tokio::task::JoinError>,
        seen: &mut HashSet<String>,
        outcomes: &mut Vec<(usize, Outcome)>,
    ) -> Result<(), IssuanceError> {
        let (position, outcome) = joined.map_err(|err| {
            log::error!("write task failed: {}", err);
            IssuanceError::Storage(StorageError::Other(format!("write task failed: {}", err)))
        })?;

        if let Outcome::Failed(RecordFailure {
            serial: Some(serial),
            kind: FailureKind::Storage { diverged: false },
            ..
        }) = &outcome
        {
            seen.remove(serial);
        }
        outcomes.push((position, outcome));
        Ok(())
    }
}
