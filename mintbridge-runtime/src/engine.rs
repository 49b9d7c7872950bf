use config::ConfigError;
use std::sync::Arc;
use thiserror::Error;

use mintbridge_core::config::{EngineConfig, IssuanceMode};
use mintbridge_core::error::{LedgerError, MarketError, StorageError};
use mintbridge_core::hbar::Hbar;
use mintbridge_core::id::AccountId;
use mintbridge_core::keys::PrivateKey;
use mintbridge_core::objects::{LedgerAccount, MarketState, TokenAsset};
use mintbridge_core::summary::BatchSummary;
use mintbridge_ledger::client::LedgerClient;
use mintbridge_ledger::memory::InMemoryLedger;
use mintbridge_ledger::sequencer::SequencedLedger;
use mintbridge_storage_impl::sqlite::SqliteStateStore;
use mintbridge_storage_impl::storage_traits::StateStore;

use crate::ingest::{BatchIngestor, ObjectFetcher, ObjectLocation};
use crate::marketplace::MarketplaceStateMachine;
use crate::orchestrator::{IssuanceError, TokenLifecycleOrchestrator};

/// Account that pays for the simulated ledger when none is configured
const SIMULATED_OPERATOR: AccountId = AccountId::from_num(2);

/// Errors surfaced by [`IssuanceEngine`]
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Issuance(#[from] IssuanceError),

    #[error(transparent)]
    Market(#[from] MarketError),

    /// The ledger account exists and is funded but has no local row. `account` holds the only
    /// copy of its private key.
    #[error("account {} was created on the ledger but not recorded: {source}", .account.account_id)]
    AccountNotPersisted {
        account: Box<LedgerAccount>,
        #[source]
        source: StorageError,
    },
}

/// The issuance and marketplace service.
///
/// Owns the state store connection, the sequenced ledger client and the batch ingestor. Open it
/// once, share it, and call [`IssuanceEngine::shutdown`] to release the store.
pub struct IssuanceEngine {
    config: EngineConfig,
    ledger: Arc<dyn LedgerClient>,
    store: Arc<dyn StateStore>,
    ingestor: BatchIngestor,
    orchestrator: TokenLifecycleOrchestrator,
    marketplace: MarketplaceStateMachine,
}

impl IssuanceEngine {
    /// Open the state store and wire the components together.
    ///
    /// Every submission to `ledger` goes through a [`SequencedLedger`] bounded by
    /// `ledger.request_timeout_ms`.
    pub async fn open(
        config: EngineConfig,
        ledger: Arc<dyn LedgerClient>,
        fetcher: Arc<dyn ObjectFetcher>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let supply_key = match config.issuance.mode {
            IssuanceMode::Mint => Some(config.ledger.operator_key()?),
            IssuanceMode::MirrorOnly => None,
        };

        let store: Arc<dyn StateStore> = Arc::new(SqliteStateStore::open(&config.database).await?);
        let ledger: Arc<dyn LedgerClient> = Arc::new(
            SequencedLedger::new(ledger).with_timeout(config.ledger.request_timeout()),
        );

        let orchestrator = TokenLifecycleOrchestrator::new(
            ledger.clone(),
            store.clone(),
            config.issuance.clone(),
            supply_key,
        );
        let marketplace = MarketplaceStateMachine::new(store.clone());

        log::info!(
            "issuance engine open on {} ({:?} mode, operator {})",
            config.ledger.network,
            config.issuance.mode,
            ledger.operator()
        );

        Ok(Self {
            config,
            ledger,
            store,
            ingestor: BatchIngestor::new(fetcher),
            orchestrator,
            marketplace,
        })
    }

    /// Open an engine backed by an in-process [`InMemoryLedger`].
    ///
    /// The configured operator (or a generated one in mirror-only mode) starts with
    /// `operator_balance`, and the configured maximum transaction fee applies.
    pub async fn open_simulated(
        config: EngineConfig,
        fetcher: Arc<dyn ObjectFetcher>,
        operator_balance: Hbar,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let (operator, operator_key) = match (
            &config.ledger.operator_account_id,
            &config.ledger.operator_private_key,
        ) {
            (Some(_), Some(_)) => (config.ledger.operator_account()?, config.ledger.operator_key()?),
            _ => (SIMULATED_OPERATOR, PrivateKey::generate()),
        };
        let ledger = InMemoryLedger::new(operator, operator_key, operator_balance)
            .with_max_transaction_fee(config.ledger.max_transaction_fee());

        Self::open(config, ledger.into_shared(), fetcher).await
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Issue the batch named in the configuration
    pub async fn issue_batch(&self) -> Result<BatchSummary, EngineError> {
        let location = ObjectLocation::from(&self.config.batch);
        self.issue_batch_from(&location).await
    }

    /// Fetch, mint and mirror the batch at `location`
    pub async fn issue_batch_from(&self, location: &ObjectLocation) -> Result<BatchSummary, EngineError> {
        log::info!("issuing batch {}", location);
        let records = self.ingestor.open(location).await.map_err(|error| {
            log::error!("failed to open batch {}: {}", location, error);
            IssuanceError::Stream {
                error,
                partial: BatchSummary::default(),
            }
        })?;

        Ok(self.orchestrator.run(records).await?)
    }

    pub async fn list_for_sale(&self) -> Result<Vec<TokenAsset>, EngineError> {
        Ok(self.marketplace.list_for_sale().await?)
    }

    pub async fn list_all(&self) -> Result<Vec<TokenAsset>, EngineError> {
        Ok(self.marketplace.list_all().await?)
    }

    pub async fn sell(&self, token_id: &str) -> Result<MarketState, EngineError> {
        Ok(self.marketplace.sell(token_id).await?)
    }

    pub async fn buy(&self, token_id: &str, buyer: &str) -> Result<MarketState, EngineError> {
        Ok(self.marketplace.buy(token_id, buyer).await?)
    }

    pub async fn market_state(&self, token_id: &str) -> Result<MarketState, EngineError> {
        Ok(self.marketplace.state(token_id).await?)
    }

    /// Provision a ledger account funded with the configured initial balance and record it
    ///
    /// # Returns
    /// The new account and its keys. If the ledger succeeds but the local write fails, the
    /// account is returned inside `EngineError::AccountNotPersisted`.
    pub async fn create_account(&self) -> Result<LedgerAccount, EngineError> {
        let account = self
            .ledger
            .create_account(self.config.ledger.initial_account_balance())
            .await
            .map_err(|err| {
                log::warn!("account creation failed: {}", err);
                err
            })?;
        if let Err(source) = self.store.upsert_account(&account).await {
            log::error!(
                "account {} exists on the ledger but was not recorded: {}",
                account.account_id,
                source
            );
            return Err(EngineError::AccountNotPersisted {
                account: Box::new(account),
                source,
            });
        }
        log::info!("created account {}", account.account_id);
        Ok(account)
    }

    /// Close the state store. In-flight queries finish first.
    pub async fn shutdown(self) {
        self.store.close().await;
        log::info!("issuance engine shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::tests::batch;
    use crate::ingest::{FileObjectFetcher, InMemoryObjectFetcher};
    use mintbridge_core::keys::KeyPair;
    use tempfile::TempDir;

    fn config(dir: &TempDir, mode: IssuanceMode) -> EngineConfig {
        let mut config = EngineConfig::default();
        config.database.path = dir.path().join("engine.db").to_string_lossy().into_owned();
        config.issuance.mode = mode;
        config.batch.root = dir.path().to_string_lossy().into_owned();
        config.batch.bucket = "uploads".to_string();
        config.batch.key = "distributions.csv".to_string();
        config
    }

    fn with_operator(mut config: EngineConfig) -> EngineConfig {
        config.ledger.operator_account_id = Some("0.0.1001".to_string());
        config.ledger.operator_private_key = Some(KeyPair::generate().private_key.to_der_hex());
        config
    }

    fn write_batch(dir: &TempDir, serials: &[&str]) {
        std::fs::create_dir_all(dir.path().join("uploads")).unwrap();
        std::fs::write(dir.path().join("uploads/distributions.csv"), batch(serials)).unwrap();
    }

    #[tokio::test]
    async fn test_mirror_only_batch_and_marketplace() {
        let dir = tempfile::tempdir().unwrap();
        write_batch(&dir, &["A", "B", "A"]);
        let config = config(&dir, IssuanceMode::MirrorOnly);
        let fetcher = Arc::new(FileObjectFetcher::new(config.batch.root.clone()));
        let engine = IssuanceEngine::open_simulated(config, fetcher, Hbar::new(100))
            .await
            .unwrap();

        let summary = engine.issue_batch().await.unwrap();
        assert_eq!(summary.created_count(), 2);
        assert_eq!(summary.duplicate_count(), 1);
        assert_eq!(engine.list_all().await.unwrap().len(), 2);
        assert!(engine.list_for_sale().await.unwrap().is_empty());

        assert_eq!(engine.sell("TOKEN-A").await.unwrap(), MarketState::ForSale);
        assert_eq!(engine.list_for_sale().await.unwrap().len(), 1);
        engine.buy("TOKEN-A", "0.0.3003").await.unwrap();
        assert!(matches!(
            engine.buy("TOKEN-A", "0.0.3004").await,
            Err(EngineError::Market(MarketError::NotAvailable(_)))
        ));
        assert!(matches!(
            engine.buy("TOKEN-Z", "0.0.3004").await,
            Err(EngineError::Market(MarketError::NotFound(_)))
        ));

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_mint_batch_and_account_creation() {
        let dir = tempfile::tempdir().unwrap();
        write_batch(&dir, &["SN-1", "SN-2"]);
        let config = with_operator(config(&dir, IssuanceMode::Mint));
        let fetcher = Arc::new(FileObjectFetcher::new(config.batch.root.clone()));
        let engine = IssuanceEngine::open_simulated(config, fetcher, Hbar::new(1_000))
            .await
            .unwrap();

        let summary = engine.issue_batch().await.unwrap();
        let class = summary.token_class.unwrap();
        assert_eq!(summary.created_count(), 2);
        assert_eq!(summary.created[0].token_class_id, Some(class));
        assert_eq!(summary.created[0].account.as_ref().unwrap().as_str(), "0.0.1001");

        let account = engine.create_account().await.unwrap();
        assert_eq!(account.private_key.public_key(), account.public_key);
        assert_eq!(
            engine.store().get_account(&account.account_id).await.unwrap(),
            Some(account)
        );
    }

    #[tokio::test]
    async fn test_missing_batch_is_a_stream_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir, IssuanceMode::MirrorOnly);
        let engine = IssuanceEngine::open_simulated(
            config,
            Arc::new(InMemoryObjectFetcher::new()),
            Hbar::new(1),
        )
        .await
        .unwrap();

        let err = engine.issue_batch().await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Issuance(IssuanceError::Stream { .. })
        ));
        assert!(engine.list_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mint_mode_requires_operator_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir, IssuanceMode::Mint);
        let ledger = InMemoryLedger::new(AccountId::from_num(1001), PrivateKey::generate(), Hbar::new(1));
        let result = IssuanceEngine::open(
            config,
            ledger.into_shared(),
            Arc::new(InMemoryObjectFetcher::new()),
        )
        .await;
        assert!(matches!(result, Err(EngineError::Config(_))));
    }

    #[tokio::test]
    async fn test_account_creation_failure_is_surfaced() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir, IssuanceMode::MirrorOnly);
        let engine = IssuanceEngine::open_simulated(
            config,
            Arc::new(InMemoryObjectFetcher::new()),
            Hbar::new(1),
        )
        .await
        .unwrap();

        let err = engine.create_account().await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Ledger(LedgerError::InsufficientBalance { .. })
        ));
        assert!(engine.store().list_accounts().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unrecorded_account_keeps_its_keys() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir, IssuanceMode::MirrorOnly);
        let ledger = InMemoryLedger::new(AccountId::from_num(1001), PrivateKey::generate(), Hbar::new(100))
            .into_shared();
        let engine = IssuanceEngine::open(
            config,
            ledger.clone(),
            Arc::new(InMemoryObjectFetcher::new()),
        )
        .await
        .unwrap();
        engine.store().close().await;

        let err = engine.create_account().await.unwrap_err();
        let account = match err {
            EngineError::AccountNotPersisted { account, .. } => account,
            other => panic!("unexpected error: {:?}", other),
        };
        assert_eq!(ledger.account_key(&account.account_id), Some(account.public_key));
        assert_eq!(account.private_key.public_key(), account.public_key);
    }

    #[tokio::test]
    async fn test_out_of_range_fee_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(&dir, IssuanceMode::MirrorOnly);
        config.ledger.max_transaction_fee_hbar = 100_000_000_000;
        let result = IssuanceEngine::open_simulated(
            config,
            Arc::new(InMemoryObjectFetcher::new()),
            Hbar::new(100),
        )
        .await;
        assert!(matches!(result, Err(EngineError::Config(_))));
    }
}
