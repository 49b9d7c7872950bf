use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mintbridge_core::error::LedgerError;
use mintbridge_core::hbar::Hbar;
use mintbridge_core::id::{AccountId, LedgerTokenId, TokenClassId};
use mintbridge_core::keys::PrivateKey;
use mintbridge_core::objects::LedgerAccount;

use crate::client::{LedgerClient, TokenClassSpec};

/// Serializes submissions per paying account.
///
/// A ledger account's transactions must reach the network one at a time, so each payer gets a
/// lane and a submission waits for the lane before it is forwarded. Submissions from different
/// payers proceed in parallel. An optional timeout bounds the wait and the call together.
pub struct SequencedLedger {
    inner: Arc<dyn LedgerClient>,
    lanes: Mutex<HashMap<AccountId, Arc<tokio::sync::Mutex<()>>>>,
    timeout: Option<Duration>,
}

impl SequencedLedger {
    pub fn new(inner: Arc<dyn LedgerClient>) -> Self {
        Self {
            inner,
            lanes: Mutex::new(HashMap::new()),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    fn lane(&self, payer: AccountId) -> Arc<tokio::sync::Mutex<()>> {
        let mut lanes = self.lanes.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        lanes.entry(payer).or_default().clone()
    }

    async fn sequenced<T, F>(&self, call: F) -> Result<T, LedgerError>
    where
        F: Future<Output = Result<T, LedgerError>> + Send,
    {
        let lane = self.lane(self.inner.operator());
        let run = async {
            let _turn = lane.lock().await;
            call.await
        };

        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, run)
                .await
                .map_err(|_| LedgerError::Timeout(limit))?,
            None => run.await,
        }
    }
}

#[async_trait]
impl LedgerClient for SequencedLedger {
    fn operator(&self) -> AccountId {
        self.inner.operator()
    }

    async fn create_account(&self, initial_balance: Hbar) -> Result<LedgerAccount, LedgerError> {
        self.sequenced(self.inner.create_account(initial_balance)).await
    }

    async fn create_token_class(&self, spec: &TokenClassSpec) -> Result<TokenClassId, LedgerError> {
        self.sequenced(self.inner.create_token_class(spec)).await
    }

    async fn mint_token(
        &self,
        class: &TokenClassId,
        metadata: &[u8],
        supply_key: &PrivateKey,
    ) -> Result<LedgerTokenId, LedgerError> {
        self.sequenced(self.inner.mint_token(class, metadata, supply_key))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::SupplyPolicy;
    use crate::memory::InMemoryLedger;

    const OPERATOR: AccountId = AccountId::from_num(1001);

    fn slow_ledger(delay: Duration) -> Arc<InMemoryLedger> {
        InMemoryLedger::new(OPERATOR, PrivateKey::generate(), Hbar::new(1_000))
            .with_settlement_delay(delay)
            .into_shared()
    }

    fn spec(ledger: &InMemoryLedger) -> TokenClassSpec {
        let key = ledger.operator_key().public_key();
        TokenClassSpec {
            name: "Devices".to_string(),
            symbol: "DEV".to_string(),
            treasury: OPERATOR,
            admin_key: key,
            supply_key: key,
            supply: SupplyPolicy::Infinite,
            royalty: None,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_same_payer_is_never_concurrent() {
        let inner = slow_ledger(Duration::from_millis(5));
        let class = inner.create_token_class(&spec(&inner)).await.unwrap();
        let ledger = Arc::new(SequencedLedger::new(inner.clone()));
        let key = inner.operator_key().clone();

        let mut handles = Vec::new();
        for i in 0..8u8 {
            let ledger = ledger.clone();
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                ledger.mint_token(&class, &[i], &key).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(inner.minted_count(&class), 8);
        assert_eq!(inner.max_observed_concurrency(), 1);
    }

    #[tokio::test]
    async fn test_timeout_surfaces_as_ledger_error() {
        let inner = slow_ledger(Duration::from_millis(200));
        let ledger = SequencedLedger::new(inner).with_timeout(Some(Duration::from_millis(10)));

        let err = ledger.create_account(Hbar::new(1)).await.unwrap_err();
        assert_eq!(err, LedgerError::Timeout(Duration::from_millis(10)));
    }

    #[tokio::test]
    async fn test_forwards_results() {
        let inner = slow_ledger(Duration::from_millis(0));
        let ledger = SequencedLedger::new(inner.clone());

        assert_eq!(ledger.operator(), OPERATOR);
        let account = ledger.create_account(Hbar::new(3)).await.unwrap();
        assert_eq!(inner.balance(&account.account_id), Some(Hbar::new(3)));
    }
}
