use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::hbar::Hbar;
use crate::id::AccountId;
use crate::keys::PrivateKey;

/// Prefix of environment overrides, e.g. `MINTBRIDGE__LEDGER__OPERATOR_ACCOUNT_ID`
pub const ENV_PREFIX: &str = "MINTBRIDGE";

/// Top-level configuration of an issuance engine
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub issuance: IssuanceConfig,
    #[serde(default)]
    pub batch: BatchConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_path")]
    pub path: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

fn default_database_path() -> String {
    "tokens.db".to_string()
}

fn default_max_connections() -> u32 {
    5
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
            max_connections: default_max_connections(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

impl DatabaseConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

/// Networks an operator account can belong to
pub const KNOWN_NETWORKS: &[&str] = &["mainnet", "testnet", "previewnet", "local"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Name of the network the operator account lives on. Reported in logs; the ledger client
    /// passed to the engine decides where transactions actually go.
    #[serde(default = "default_network")]
    pub network: String,
    #[serde(default)]
    pub operator_account_id: Option<String>,
    #[serde(default)]
    pub operator_private_key: Option<String>,
    #[serde(default = "default_max_transaction_fee_hbar")]
    pub max_transaction_fee_hbar: i64,
    #[serde(default = "default_initial_account_balance_hbar")]
    pub initial_account_balance_hbar: i64,
    /// Upper bound on a single ledger call; unbounded when absent
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,
}

fn default_network() -> String {
    "testnet".to_string()
}

fn default_max_transaction_fee_hbar() -> i64 {
    5
}

fn default_initial_account_balance_hbar() -> i64 {
    10
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            network: default_network(),
            operator_account_id: None,
            operator_private_key: None,
            max_transaction_fee_hbar: default_max_transaction_fee_hbar(),
            initial_account_balance_hbar: default_initial_account_balance_hbar(),
            request_timeout_ms: None,
        }
    }
}

impl LedgerConfig {
    pub fn operator_account(&self) -> Result<AccountId, ConfigError> {
        let raw = self
            .operator_account_id
            .as_deref()
            .ok_or_else(|| ConfigError::Message("ledger.operator_account_id is required".to_string()))?;
        raw.parse()
            .map_err(|e| ConfigError::Message(format!("ledger.operator_account_id: {}", e)))
    }

    pub fn operator_key(&self) -> Result<PrivateKey, ConfigError> {
        let raw = self
            .operator_private_key
            .as_deref()
            .ok_or_else(|| ConfigError::Message("ledger.operator_private_key is required".to_string()))?;
        raw.parse()
            .map_err(|e| ConfigError::Message(format!("ledger.operator_private_key: {}", e)))
    }

    pub fn max_transaction_fee(&self) -> Hbar {
        Hbar::new(self.max_transaction_fee_hbar)
    }

    pub fn initial_account_balance(&self) -> Hbar {
        Hbar::new(self.initial_account_balance_hbar)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }
}

/// Whether a batch is minted on the ledger or only recorded locally
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssuanceMode {
    #[default]
    Mint,
    MirrorOnly,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssuanceConfig {
    #[serde(default)]
    pub mode: IssuanceMode,
    #[serde(default = "default_token_name")]
    pub token_name: String,
    #[serde(default = "default_token_symbol")]
    pub token_symbol: String,
    /// Finite supply cap per token class; infinite when absent
    #[serde(default)]
    pub max_supply: Option<u64>,
    #[serde(default)]
    pub royalty: RoyaltyConfig,
    #[serde(default = "default_max_in_flight_writes")]
    pub max_in_flight_writes: usize,
}

fn default_token_name() -> String {
    "UpEnergy Distribution".to_string()
}

fn default_token_symbol() -> String {
    "UPE".to_string()
}

fn default_max_in_flight_writes() -> usize {
    8
}

impl Default for IssuanceConfig {
    fn default() -> Self {
        Self {
            mode: IssuanceMode::default(),
            token_name: default_token_name(),
            token_symbol: default_token_symbol(),
            max_supply: None,
            royalty: RoyaltyConfig::default(),
            max_in_flight_writes: default_max_in_flight_writes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoyaltyConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_royalty_numerator")]
    pub numerator: u64,
    #[serde(default = "default_royalty_denominator")]
    pub denominator: u64,
    #[serde(default = "default_fallback_fee_hbar")]
    pub fallback_fee_hbar: i64,
}

fn default_true() -> bool {
    true
}

fn default_royalty_numerator() -> u64 {
    5
}

fn default_royalty_denominator() -> u64 {
    10
}

fn default_fallback_fee_hbar() -> i64 {
    200
}

impl Default for RoyaltyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            numerator: default_royalty_numerator(),
            denominator: default_royalty_denominator(),
            fallback_fee_hbar: default_fallback_fee_hbar(),
        }
    }
}

/// Where the distribution batch is fetched from
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Directory standing in for the object store
    #[serde(default = "default_batch_root")]
    pub root: String,
    #[serde(default)]
    pub bucket: String,
    #[serde(default = "default_batch_key")]
    pub key: String,
}

fn default_batch_root() -> String {
    "data".to_string()
}

fn default_batch_key() -> String {
    "distributions.csv".to_string()
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            root: default_batch_root(),
            bucket: String::new(),
            key: default_batch_key(),
        }
    }
}

// A configured amount must be non-negative and representable in tinybars
fn hbar_amount(field: &str, hbars: i64) -> Result<Hbar, ConfigError> {
    if hbars < 0 {
        return Err(ConfigError::Message(format!("{} must not be negative", field)));
    }
    Hbar::checked_from_hbars(hbars)
        .ok_or_else(|| ConfigError::Message(format!("{} = {} is out of range", field, hbars)))
}

impl EngineConfig {
    /// Load from an optional TOML file, then apply `MINTBRIDGE__*` environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with_env(path, Environment::with_prefix(ENV_PREFIX))
    }

    fn load_with_env(path: Option<&Path>, env: Environment) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(false));
        }
        let settings = builder
            .add_source(env.separator("__").try_parsing(true))
            .build()?;
        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !KNOWN_NETWORKS.contains(&self.ledger.network.as_str()) {
            return Err(ConfigError::Message(format!(
                "ledger.network `{}` is not one of {}",
                self.ledger.network,
                KNOWN_NETWORKS.join(", ")
            )));
        }
        hbar_amount("ledger.max_transaction_fee_hbar", self.ledger.max_transaction_fee_hbar)?;
        hbar_amount(
            "ledger.initial_account_balance_hbar",
            self.ledger.initial_account_balance_hbar,
        )?;
        hbar_amount(
            "issuance.royalty.fallback_fee_hbar",
            self.issuance.royalty.fallback_fee_hbar,
        )?;
        if self.issuance.mode == IssuanceMode::Mint {
            self.ledger.operator_account()?;
            self.ledger.operator_key()?;
        }
        if self.issuance.royalty.enabled && self.issuance.royalty.denominator == 0 {
            return Err(ConfigError::Message(
                "issuance.royalty.denominator must be non-zero".to_string(),
            ));
        }
        if self.issuance.max_in_flight_writes == 0 {
            return Err(ConfigError::Message(
                "issuance.max_in_flight_writes must be at least 1".to_string(),
            ));
        }
        if self.database.max_connections == 0 {
            return Err(ConfigError::Message(
                "database.max_connections must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyPair;
    use std::collections::HashMap;
    use std::io::Write;

    fn env(vars: &[(&str, &str)]) -> Environment {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Environment::with_prefix(ENV_PREFIX).source(Some(map))
    }

    #[test]
    fn test_mint_mode_requires_operator() {
        let err = EngineConfig::load_with_env(None, env(&[])).unwrap_err();
        assert!(err.to_string().contains("operator_account_id"));
    }

    #[test]
    fn test_mirror_mode_needs_no_credentials() {
        let config = EngineConfig::load_with_env(
            None,
            env(&[("MINTBRIDGE__ISSUANCE__MODE", "mirror_only")]),
        )
        .unwrap();
        assert_eq!(config.issuance.mode, IssuanceMode::MirrorOnly);
        assert_eq!(config.database.path, "tokens.db");
        assert_eq!(config.ledger.initial_account_balance(), Hbar::new(10));
        assert_eq!(config.ledger.request_timeout(), None);
    }

    #[test]
    fn test_file_then_environment() {
        let operator = KeyPair::generate();
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[database]
path = "/tmp/mirror.db"

[ledger]
operator_account_id = "0.0.1001"
operator_private_key = "{}"
request_timeout_ms = 2500

[issuance]
token_symbol = "SOL"
max_in_flight_writes = 2
"#,
            operator.private_key.to_der_hex()
        )
        .unwrap();

        let config = EngineConfig::load_with_env(
            Some(file.path()),
            env(&[("MINTBRIDGE__DATABASE__MAX_CONNECTIONS", "3")]),
        )
        .unwrap();

        assert_eq!(config.database.path, "/tmp/mirror.db");
        assert_eq!(config.database.max_connections, 3);
        assert_eq!(config.ledger.operator_account().unwrap(), AccountId::from_num(1001));
        assert_eq!(config.ledger.operator_key().unwrap().public_key(), operator.public_key);
        assert_eq!(config.ledger.request_timeout(), Some(Duration::from_millis(2500)));
        assert_eq!(config.issuance.token_symbol, "SOL");
        assert_eq!(config.issuance.max_in_flight_writes, 2);
        assert_eq!(config.issuance.royalty.denominator, 10);
    }

    #[test]
    fn test_rejects_zero_royalty_denominator() {
        let mut config = EngineConfig::default();
        config.issuance.mode = IssuanceMode::MirrorOnly;
        config.issuance.royalty.denominator = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_out_of_range_amounts() {
        let err = EngineConfig::load_with_env(
            None,
            env(&[
                ("MINTBRIDGE__ISSUANCE__MODE", "mirror_only"),
                ("MINTBRIDGE__LEDGER__MAX_TRANSACTION_FEE_HBAR", "100000000000"),
            ]),
        )
        .unwrap_err();
        assert!(err.to_string().contains("max_transaction_fee_hbar"));

        let mut config = EngineConfig::default();
        config.issuance.mode = IssuanceMode::MirrorOnly;
        config.ledger.initial_account_balance_hbar = -1;
        assert!(config.validate().is_err());

        config.ledger.initial_account_balance_hbar = 10;
        config.issuance.royalty.fallback_fee_hbar = i64::MAX;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_unknown_network() {
        let mut config = EngineConfig::default();
        config.issuance.mode = IssuanceMode::MirrorOnly;
        config.ledger.network = "devnet".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("devnet"));

        config.ledger.network = "mainnet".to_string();
        assert!(config.validate().is_ok());
    }
}
