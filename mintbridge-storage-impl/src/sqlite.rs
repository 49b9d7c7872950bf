#![cfg(feature = "sqlite")]

use crate::storage_traits::{StateStore, UpsertOutcome};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow},
    Row,
};
use std::path::Path;
use std::str::FromStr;

use mintbridge_core::config::DatabaseConfig;
use mintbridge_core::error::StorageError;
use mintbridge_core::id::{AccountId, AccountRef, LedgerTokenId, TokenClassId};
use mintbridge_core::objects::{
    DistributionRecord, LedgerAccount, TokenAsset, DISTRIBUTION_DATE_FORMAT,
};

// SQL statements for the mirror tables
mod sql {
    pub const CREATE_TOKENS_TABLE: &str = r#"
        CREATE TABLE IF NOT EXISTS tokens (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            record_id TEXT NOT NULL,
            name TEXT NOT NULL,
            region TEXT NOT NULL,
            district TEXT NOT NULL,
            village TEXT NOT NULL,
            phone TEXT NOT NULL,
            serial TEXT NOT NULL UNIQUE,
            country TEXT NOT NULL,
            distribution_date TEXT NOT NULL,
            ledger_token_id TEXT NOT NULL UNIQUE,
            token_class_id TEXT,
            account TEXT,
            for_sale INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL
        );
    "#;

    pub const CREATE_FOR_SALE_INDEX: &str = r#"
        CREATE INDEX IF NOT EXISTS idx_tokens_for_sale ON tokens(for_sale);
    "#;

    pub const CREATE_ACCOUNTS_TABLE: &str = r#"
        CREATE TABLE IF NOT EXISTS accounts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            ledger_account_id TEXT NOT NULL UNIQUE,
            public_key TEXT NOT NULL,
            private_key TEXT NOT NULL
        );
    "#;

    pub const INSERT_TOKEN: &str = r#"
        INSERT INTO tokens (
            record_id, name, region, district, village, phone, serial, country,
            distribution_date, ledger_token_id, token_class_id, account, for_sale, created_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(serial) DO NOTHING
    "#;

    pub const INSERT_ACCOUNT: &str = r#"
        INSERT INTO accounts (ledger_account_id, public_key, private_key)
        VALUES (?, ?, ?)
        ON CONFLICT(ledger_account_id) DO NOTHING
    "#;

    pub const SELECT_ALL_TOKENS: &str = r#"
        SELECT record_id, name, region, district, village, phone, serial, country,
               distribution_date, ledger_token_id, token_class_id, account, for_sale, created_at
        FROM tokens
        ORDER BY id
    "#;

    pub const SELECT_TOKENS_FOR_SALE: &str = r#"
        SELECT record_id, name, region, district, village, phone, serial, country,
               distribution_date, ledger_token_id, token_class_id, account, for_sale, created_at
        FROM tokens
        WHERE for_sale = 1
        ORDER BY id
    "#;

    pub const SELECT_TOKEN_BY_LEDGER_ID: &str = r#"
        SELECT record_id, name, region, district, village, phone, serial, country,
               distribution_date, ledger_token_id, token_class_id, account, for_sale, created_at
        FROM tokens
        WHERE ledger_token_id = ?
    "#;

    pub const SERIAL_EXISTS: &str = r#"
        SELECT EXISTS(SELECT 1 FROM tokens WHERE serial = ?)
    "#;

    pub const SET_FOR_SALE: &str = r#"
        UPDATE tokens
        SET for_sale = 1
        WHERE ledger_token_id = ?
    "#;

    // The guard and the write happen in one statement
    pub const BUY_TOKEN: &str = r#"
        UPDATE tokens
        SET for_sale = 0, account = ?
        WHERE ledger_token_id = ? AND for_sale = 1
    "#;

    pub const SELECT_ACCOUNT: &str = r#"
        SELECT ledger_account_id, public_key, private_key
        FROM accounts
        WHERE ledger_account_id = ?
    "#;

    pub const SELECT_ALL_ACCOUNTS: &str = r#"
        SELECT ledger_account_id, public_key, private_key
        FROM accounts
        ORDER BY id
    "#;
}

/// A SQLite-backed implementation of [`StateStore`] using sqlx.
pub struct SqliteStateStore {
    pool: SqlitePool,
}

impl SqliteStateStore {
    /// Open (creating if needed) the database described by `config`
    pub async fn open(config: &DatabaseConfig) -> Result<Self, StorageError> {
        let db_url = format!("sqlite:{}", config.path);

        let options = SqliteConnectOptions::from_str(&db_url)
            .with_context(|| format!("Invalid database URL: {}", db_url))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(config.busy_timeout());

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await
            .with_context(|| format!("Failed to connect to database: {}", config.path))?;

        Self::initialize_schema(&pool)
            .await
            .with_context(|| "Failed to initialize database schema")?;

        log::info!("opened state store at {}", config.path);
        Ok(Self { pool })
    }

    /// Open a database file with default pool settings
    pub async fn new<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let config = DatabaseConfig {
            path: path.as_ref().to_string_lossy().into_owned(),
            ..DatabaseConfig::default()
        };
        Self::open(&config).await
    }

    /// Creates the necessary tables in the database
    async fn initialize_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
        sqlx::query(sql::CREATE_TOKENS_TABLE).execute(pool).await?;
        sqlx::query(sql::CREATE_FOR_SALE_INDEX).execute(pool).await?;
        sqlx::query(sql::CREATE_ACCOUNTS_TABLE).execute(pool).await?;
        Ok(())
    }

    fn token_from_row(row: &SqliteRow) -> Result<TokenAsset, StorageError> {
        let date: String = row.try_get("distribution_date")?;
        let distribution_date = NaiveDate::parse_from_str(&date, DISTRIBUTION_DATE_FORMAT)
            .map_err(|e| StorageError::Serialization(format!("distribution_date `{}`: {}", date, e)))?;

        let created_at: String = row.try_get("created_at")?;
        let created_at = DateTime::parse_from_rfc3339(&created_at)
            .map_err(|e| StorageError::Serialization(format!("created_at `{}`: {}", created_at, e)))?
            .with_timezone(&Utc);

        let ledger_token_id: String = row.try_get("ledger_token_id")?;
        let token_class_id: Option<String> = row.try_get("token_class_id")?;
        let account: Option<String> = row.try_get("account")?;
        let for_sale: i64 = row.try_get("for_sale")?;

        Ok(TokenAsset {
            record: DistributionRecord {
                id: row.try_get("record_id")?,
                name: row.try_get("name")?,
                region: row.try_get("region")?,
                district: row.try_get("district")?,
                village: row.try_get("village")?,
                phone: row.try_get("phone")?,
                serial: row.try_get("serial")?,
                country: row.try_get("country")?,
                distribution_date,
            },
            ledger_token_id: LedgerTokenId::parse(&ledger_token_id)?,
            token_class_id: token_class_id
                .map(|raw| raw.parse::<TokenClassId>())
                .transpose()?,
            account: account.map(|raw| AccountRef::parse(&raw)).transpose()?,
            for_sale: for_sale == 1,
            created_at,
        })
    }

    fn account_from_row(row: &SqliteRow) -> Result<LedgerAccount, StorageError> {
        let account_id: String = row.try_get("ledger_account_id")?;
        let public_key: String = row.try_get("public_key")?;
        let private_key: String = row.try_get("private_key")?;

        Ok(LedgerAccount {
            account_id: account_id.parse()?,
            public_key: public_key.parse()?,
            private_key: private_key.parse()?,
        })
    }

    async fn fetch_tokens(&self, query: &str) -> Result<Vec<TokenAsset>, StorageError> {
        let rows = sqlx::query(query)
            .fetch_all(&self.pool)
            .await
            .with_context(|| "Failed to fetch tokens")?;

        rows.iter().map(Self::token_from_row).collect()
    }
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn upsert_token(&self, asset: &TokenAsset) -> Result<UpsertOutcome, StorageError> {
        let record = &asset.record;
        let result = sqlx::query(sql::INSERT_TOKEN)
            .bind(&record.id)
            .bind(&record.name)
            .bind(&record.region)
            .bind(&record.district)
            .bind(&record.village)
            .bind(&record.phone)
            .bind(&record.serial)
            .bind(&record.country)
            .bind(record.distribution_date.format(DISTRIBUTION_DATE_FORMAT).to_string())
            .bind(asset.ledger_token_id.as_str())
            .bind(asset.token_class_id.map(|id| id.to_string()))
            .bind(asset.account.as_ref().map(|a| a.as_str().to_string()))
            .bind(asset.for_sale as i64)
            .bind(asset.created_at.to_rfc3339_opts(SecondsFormat::Nanos, true))
            .execute(&self.pool)
            .await
            .with_context(|| {
                format!(
                    "Failed to store token {} for serial {}",
                    asset.ledger_token_id, record.serial
                )
            })?;

        if result.rows_affected() == 0 {
            log::debug!("serial {} already mirrored, skipping", record.serial);
            Ok(UpsertOutcome::Skipped)
        } else {
            Ok(UpsertOutcome::Inserted)
        }
    }

    async fn upsert_account(&self, account: &LedgerAccount) -> Result<UpsertOutcome, StorageError> {
        let result = sqlx::query(sql::INSERT_ACCOUNT)
            .bind(account.account_id.to_string())
            .bind(account.public_key.to_der_hex())
            .bind(account.private_key.to_der_hex())
            .execute(&self.pool)
            .await
            .with_context(|| format!("Failed to store account {}", account.account_id))?;

        Ok(if result.rows_affected() == 0 {
            UpsertOutcome::Skipped
        } else {
            UpsertOutcome::Inserted
        })
    }

    async fn list_for_sale(&self) -> Result<Vec<TokenAsset>, StorageError> {
        self.fetch_tokens(sql::SELECT_TOKENS_FOR_SALE).await
    }

    async fn list_all(&self) -> Result<Vec<TokenAsset>, StorageError> {
        self.fetch_tokens(sql::SELECT_ALL_TOKENS).await
    }

    async fn set_for_sale(&self, ledger_token_id: &LedgerTokenId) -> Result<(), StorageError> {
        let result = sqlx::query(sql::SET_FOR_SALE)
            .bind(ledger_token_id.as_str())
            .execute(&self.pool)
            .await
            .with_context(|| format!("Failed to list token {}", ledger_token_id))?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!(
                "Token {} not found",
                ledger_token_id
            )));
        }
        Ok(())
    }

    async fn buy_token(
        &self,
        ledger_token_id: &LedgerTokenId,
        buyer: &AccountRef,
    ) -> Result<u64, StorageError> {
        let result = sqlx::query(sql::BUY_TOKEN)
            .bind(buyer.as_str())
            .bind(ledger_token_id.as_str())
            .execute(&self.pool)
            .await
            .with_context(|| format!("Failed to buy token {}", ledger_token_id))?;

        Ok(result.rows_affected())
    }

    async fn get_token(
        &self,
        ledger_token_id: &LedgerTokenId,
    ) -> Result<Option<TokenAsset>, StorageError> {
        let row = sqlx::query(sql::SELECT_TOKEN_BY_LEDGER_ID)
            .bind(ledger_token_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("Failed to fetch token {}", ledger_token_id))?;

        row.as_ref().map(Self::token_from_row).transpose()
    }

    async fn contains_serial(&self, serial: &str) -> Result<bool, StorageError> {
        let exists: i64 = sqlx::query_scalar(sql::SERIAL_EXISTS)
            .bind(serial)
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("Failed to look up serial {}", serial))?;

        Ok(exists == 1)
    }

    async fn get_account(
        &self,
        account_id: &AccountId,
    ) -> Result<Option<LedgerAccount>, StorageError> {
        let row = sqlx::query(sql::SELECT_ACCOUNT)
            .bind(account_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("Failed to fetch account {}", account_id))?;

        row.as_ref().map(Self::account_from_row).transpose()
    }

    async fn list_accounts(&self) -> Result<Vec<LedgerAccount>, StorageError> {
        let rows = sqlx::query(sql::SELECT_ALL_ACCOUNTS)
            .fetch_all(&self.pool)
            .await
            .with_context(|| "Failed to fetch accounts")?;

        rows.iter().map(Self::account_from_row).collect()
    }

    async fn close(&self) {
        self.pool.close().await;
        log::info!("state store closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mintbridge_core::keys::KeyPair;
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn temp_store() -> (TempDir, SqliteStateStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStateStore::new(dir.path().join("tokens.db"))
            .await
            .unwrap();
        (dir, store)
    }

    fn asset(serial: &str) -> TokenAsset {
        let record = DistributionRecord {
            id: "7".to_string(),
            name: "Grace Nakato".to_string(),
            region: "Eastern".to_string(),
            district: "Jinja".to_string(),
            village: "Bugembe".to_string(),
            phone: "+256700000001".to_string(),
            serial: serial.to_string(),
            country: "Uganda".to_string(),
            distribution_date: NaiveDate::from_ymd_opt(2024, 5, 2).unwrap(),
        };
        let class = TokenClassId::from_num(9001);
        TokenAsset::issue(
            record,
            LedgerTokenId::parse(&format!("{}/{}", class, serial)).unwrap(),
            Some(class),
            Some(AccountRef::from(AccountId::from_num(1001))),
        )
    }

    fn token_id(serial: &str) -> LedgerTokenId {
        asset(serial).ledger_token_id
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent_on_serial() {
        let (_dir, store) = temp_store().await;
        let first = asset("SN-00001-aaaa");

        assert_eq!(store.upsert_token(&first).await.unwrap(), UpsertOutcome::Inserted);
        assert_eq!(store.upsert_token(&first).await.unwrap(), UpsertOutcome::Skipped);

        let mut renamed = first.clone();
        renamed.ledger_token_id = LedgerTokenId::mirrored("SN-00001-aaaa");
        assert_eq!(store.upsert_token(&renamed).await.unwrap(), UpsertOutcome::Skipped);

        let all = store.list_all().await.unwrap();
        assert_eq!(all, vec![first.clone()]);
        assert!(store.contains_serial("SN-00001-aaaa").await.unwrap());
        assert!(!store.contains_serial("SN-00002-bbbb").await.unwrap());
        assert_eq!(
            store.get_token(&first.ledger_token_id).await.unwrap(),
            Some(first)
        );
    }

    #[tokio::test]
    async fn test_reused_ledger_token_id_is_an_error() {
        let (_dir, store) = temp_store().await;
        let first = asset("A");
        let mut second = asset("B");
        second.ledger_token_id = first.ledger_token_id.clone();

        store.upsert_token(&first).await.unwrap();
        assert!(store.upsert_token(&second).await.is_err());
        assert_eq!(store.list_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_set_for_sale() {
        let (_dir, store) = temp_store().await;
        store.upsert_token(&asset("A")).await.unwrap();
        store.upsert_token(&asset("B")).await.unwrap();

        let err = store.set_for_sale(&token_id("missing")).await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));

        store.set_for_sale(&token_id("B")).await.unwrap();
        store.set_for_sale(&token_id("B")).await.unwrap();

        let listed = store.list_for_sale().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].serial(), "B");
        assert!(listed[0].for_sale);
    }

    #[tokio::test]
    async fn test_buy_requires_listing() {
        let (_dir, store) = temp_store().await;
        let token = asset("A");
        let buyer = AccountRef::parse("0.0.5005").unwrap();
        store.upsert_token(&token).await.unwrap();

        assert_eq!(store.buy_token(&token.ledger_token_id, &buyer).await.unwrap(), 0);
        let unchanged = store.get_token(&token.ledger_token_id).await.unwrap().unwrap();
        assert_eq!(unchanged, token);

        store.set_for_sale(&token.ledger_token_id).await.unwrap();
        assert_eq!(store.buy_token(&token.ledger_token_id, &buyer).await.unwrap(), 1);
        assert_eq!(store.buy_token(&token.ledger_token_id, &buyer).await.unwrap(), 0);

        let owned = store.get_token(&token.ledger_token_id).await.unwrap().unwrap();
        assert!(!owned.for_sale);
        assert_eq!(owned.account, Some(buyer));
        assert!(store.list_for_sale().await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_buys_have_one_winner() {
        let (_dir, store) = temp_store().await;
        let store = Arc::new(store);
        let token = asset("A");
        store.upsert_token(&token).await.unwrap();
        store.set_for_sale(&token.ledger_token_id).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            let id = token.ledger_token_id.clone();
            handles.push(tokio::spawn(async move {
                let buyer = AccountRef::parse(&format!("0.0.{}", 6000 + i)).unwrap();
                store.buy_token(&id, &buyer).await.unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            winners += handle.await.unwrap();
        }
        assert_eq!(winners, 1);

        let owned = store.get_token(&token.ledger_token_id).await.unwrap().unwrap();
        assert!(!owned.for_sale);
        assert!(owned.account.unwrap().as_str().starts_with("0.0.60"));
    }

    #[tokio::test]
    async fn test_accounts_round_trip() {
        let (_dir, store) = temp_store().await;
        let keys = KeyPair::generate();
        let account = LedgerAccount {
            account_id: AccountId::from_num(4512),
            public_key: keys.public_key,
            private_key: keys.private_key,
        };

        assert_eq!(store.upsert_account(&account).await.unwrap(), UpsertOutcome::Inserted);
        assert_eq!(store.upsert_account(&account).await.unwrap(), UpsertOutcome::Skipped);
        assert_eq!(
            store.get_account(&account.account_id).await.unwrap(),
            Some(account.clone())
        );
        assert_eq!(store.get_account(&AccountId::from_num(1)).await.unwrap(), None);
        assert_eq!(store.list_accounts().await.unwrap(), vec![account]);
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.db");
        let token = asset("A");

        let store = SqliteStateStore::new(&path).await.unwrap();
        store.upsert_token(&token).await.unwrap();
        store.set_for_sale(&token.ledger_token_id).await.unwrap();
        store.close().await;

        let reopened = SqliteStateStore::new(&path).await.unwrap();
        let listed = reopened.list_for_sale().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].ledger_token_id, token.ledger_token_id);
    }
}
