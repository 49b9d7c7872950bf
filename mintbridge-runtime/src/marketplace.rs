use std::sync::Arc;

use mintbridge_core::error::{MarketError, StorageError};
use mintbridge_core::id::{AccountRef, LedgerTokenId};
use mintbridge_core::objects::{MarketState, TokenAsset};
use mintbridge_storage_impl::storage_traits::StateStore;

/// Moves mirrored tokens between unlisted, for-sale and owned.
///
/// Holds no locks of its own. A purchase is decided by the store's conditional update, so
/// concurrent buyers of the same token race there and exactly one wins.
#[derive(Clone)]
pub struct MarketplaceStateMachine {
    store: Arc<dyn StateStore>,
}

impl MarketplaceStateMachine {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    /// List a token for sale. Listing an already listed token is a no-op.
    pub async fn sell(&self, token_id: &str) -> Result<MarketState, MarketError> {
        let token_id = LedgerTokenId::parse(token_id)?;
        match self.store.set_for_sale(&token_id).await {
            Ok(()) => {
                log::info!("token {} listed for sale", token_id);
                Ok(MarketState::ForSale)
            }
            Err(StorageError::NotFound(_)) => Err(MarketError::NotFound(token_id)),
            Err(err) => Err(err.into()),
        }
    }

    /// Buy a listed token for `buyer`
    ///
    /// # Returns
    /// `Owned(buyer)` on success, `MarketError::NotAvailable` if the token exists but is not
    /// listed, `MarketError::NotFound` if it does not exist
    pub async fn buy(&self, token_id: &str, buyer: &str) -> Result<MarketState, MarketError> {
        let token_id = LedgerTokenId::parse(token_id)?;
        let buyer = AccountRef::parse(buyer)?;

        if self.store.buy_token(&token_id, &buyer).await? == 1 {
            log::info!("token {} bought by {}", token_id, buyer);
            return Ok(MarketState::Owned(buyer));
        }

        match self.store.get_token(&token_id).await? {
            Some(_) => {
                log::debug!("token {} is not for sale", token_id);
                Err(MarketError::NotAvailable(token_id))
            }
            None => Err(MarketError::NotFound(token_id)),
        }
    }

    /// Current marketplace position of a token
    pub async fn state(&self, token_id: &str) -> Result<MarketState, MarketError> {
        let token_id = LedgerTokenId::parse(token_id)?;
        self.store
            .get_token(&token_id)
            .await?
            .map(|asset| asset.market_state())
            .ok_or(MarketError::NotFound(token_id))
    }

    pub async fn list_for_sale(&self) -> Result<Vec<TokenAsset>, MarketError> {
        Ok(self.store.list_for_sale().await?)
    }

    pub async fn list_all(&self) -> Result<Vec<TokenAsset>, MarketError> {
        Ok(self.store.list_all().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use mintbridge_core::objects::DistributionRecord;
    use mintbridge_storage_impl::sqlite::SqliteStateStore;
    use tempfile::TempDir;

    async fn market_with(serials: &[&str]) -> (TempDir, MarketplaceStateMachine) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStateStore::new(dir.path().join("market.db"))
            .await
            .unwrap();
        for (i, serial) in serials.iter().enumerate() {
            let record = DistributionRecord {
                id: (i + 1).to_string(),
                name: "Joseph Mugisha".to_string(),
                region: "Western".to_string(),
                district: "Mbarara".to_string(),
                village: "Kakoba".to_string(),
                phone: "+256772000000".to_string(),
                serial: serial.to_string(),
                country: "Uganda".to_string(),
                distribution_date: NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
            };
            let asset = TokenAsset::issue(record, LedgerTokenId::mirrored(serial), None, None);
            store.upsert_token(&asset).await.unwrap();
        }
        (dir, MarketplaceStateMachine::new(Arc::new(store)))
    }

    #[tokio::test]
    async fn test_sell_then_buy() {
        let (_dir, market) = market_with(&["T"]).await;
        assert_eq!(market.state("TOKEN-T").await.unwrap(), MarketState::Unlisted);

        assert_eq!(market.sell("TOKEN-T").await.unwrap(), MarketState::ForSale);
        let buyer = AccountRef::parse("0.0.4242").unwrap();
        assert_eq!(
            market.buy("TOKEN-T", "0.0.4242").await.unwrap(),
            MarketState::Owned(buyer.clone())
        );

        let token = &market.list_all().await.unwrap()[0];
        assert!(!token.for_sale);
        assert_eq!(token.account, Some(buyer.clone()));
        assert_eq!(market.state("TOKEN-T").await.unwrap(), MarketState::Owned(buyer));
    }

    #[tokio::test]
    async fn test_sell_is_idempotent() {
        let (_dir, market) = market_with(&["T", "U"]).await;
        market.sell("TOKEN-T").await.unwrap();
        market.sell("TOKEN-T").await.unwrap();

        let listed = market.list_for_sale().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].serial(), "T");
    }

    #[tokio::test]
    async fn test_unknown_token_is_not_found() {
        let (_dir, market) = market_with(&["T"]).await;
        assert!(matches!(
            market.buy("TOKEN-missing", "0.0.1").await,
            Err(MarketError::NotFound(_))
        ));
        assert!(matches!(
            market.sell("TOKEN-missing").await,
            Err(MarketError::NotFound(_))
        ));
        assert!(matches!(
            market.state("TOKEN-missing").await,
            Err(MarketError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_buy_unlisted_is_not_available() {
        let (_dir, market) = market_with(&["T"]).await;
        let err = market.buy("TOKEN-T", "0.0.9").await.unwrap_err();
        assert!(matches!(err, MarketError::NotAvailable(_)));
        assert_eq!(market.state("TOKEN-T").await.unwrap(), MarketState::Unlisted);
    }

    #[tokio::test]
    async fn test_second_buy_is_not_available() {
        let (_dir, market) = market_with(&["T"]).await;
        market.sell("TOKEN-T").await.unwrap();
        market.buy("TOKEN-T", "0.0.100").await.unwrap();

        let err = market.buy("TOKEN-T", "0.0.200").await.unwrap_err();
        assert!(matches!(err, MarketError::NotAvailable(_)));
        assert_eq!(
            market.state("TOKEN-T").await.unwrap(),
            MarketState::Owned(AccountRef::parse("0.0.100").unwrap())
        );
    }

    #[tokio::test]
    async fn test_resell_keeps_owner_until_bought() {
        let (_dir, market) = market_with(&["T"]).await;
        market.sell("TOKEN-T").await.unwrap();
        market.buy("TOKEN-T", "0.0.100").await.unwrap();
        market.sell("TOKEN-T").await.unwrap();

        let token = &market.list_for_sale().await.unwrap()[0];
        assert_eq!(token.account, Some(AccountRef::parse("0.0.100").unwrap()));
        assert_eq!(
            market.buy("TOKEN-T", "0.0.200").await.unwrap(),
            MarketState::Owned(AccountRef::parse("0.0.200").unwrap())
        );
    }

    #[tokio::test]
    async fn test_blank_inputs_are_rejected() {
        let (_dir, market) = market_with(&["T"]).await;
        assert!(matches!(market.sell("  ").await, Err(MarketError::Validation(_))));
        assert!(matches!(
            market.buy("TOKEN-T", "").await,
            Err(MarketError::Validation(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_buyers_one_winner() {
        let (_dir, market) = market_with(&["T"]).await;
        market.sell("TOKEN-T").await.unwrap();

        let mut handles = Vec::new();
        for i in 0..12 {
            let market = market.clone();
            handles.push(tokio::spawn(async move {
                market.buy("TOKEN-T", &format!("0.0.{}", 700 + i)).await
            }));
        }

        let mut winners = 0;
        let mut not_available = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(MarketState::Owned(_)) => winners += 1,
                Err(MarketError::NotAvailable(_)) => not_available += 1,
                other => panic!("unexpected outcome: {:?}", other),
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(not_available, 11);
    }
}
