use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use mintbridge_core::error::LedgerError;
use mintbridge_core::hbar::Hbar;
use mintbridge_core::id::{AccountId, EntityId, LedgerTokenId, TokenClassId};
use mintbridge_core::keys::{KeyPair, PrivateKey, PublicKey};
use mintbridge_core::objects::{LedgerAccount, MAX_METADATA_BYTES};

use crate::client::{LedgerClient, SupplyPolicy, TokenClassSpec};
use crate::receipt::{TransactionId, TransactionKind, TransactionReceipt};

/// Fixed fee charged to the payer for each kind of transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeSchedule {
    pub account_create: Hbar,
    pub token_create: Hbar,
    pub token_mint: Hbar,
}

impl FeeSchedule {
    fn fee_for(&self, kind: TransactionKind) -> Hbar {
        match kind {
            TransactionKind::AccountCreate => self.account_create,
            TransactionKind::TokenCreate => self.token_create,
            TransactionKind::TokenMint => self.token_mint,
        }
    }
}

impl Default for FeeSchedule {
    fn default() -> Self {
        Self {
            account_create: Hbar::from_tinybars(5_000_000),
            token_create: Hbar::new(2),
            token_mint: Hbar::from_tinybars(5_000_000),
        }
    }
}

struct AccountEntry {
    public_key: PublicKey,
    balance: Hbar,
}

struct TokenClassEntry {
    spec: TokenClassSpec,
    minted: u64,
    owners: HashMap<u64, AccountId>,
    metadata: HashMap<u64, Vec<u8>>,
}

struct LedgerState {
    next_entity_num: u64,
    nonce: u64,
    accounts: HashMap<AccountId, AccountEntry>,
    token_classes: HashMap<TokenClassId, TokenClassEntry>,
    receipts: Vec<TransactionReceipt>,
    faults: HashMap<TransactionKind, VecDeque<LedgerError>>,
}

impl LedgerState {
    fn allocate_entity(&mut self) -> EntityId {
        let id = EntityId::from_num(self.next_entity_num);
        self.next_entity_num += 1;
        id
    }

    /// Pop an injected failure for this kind of transaction, if one is queued
    fn take_fault(&mut self, kind: TransactionKind) -> Option<LedgerError> {
        self.faults.get_mut(&kind).and_then(VecDeque::pop_front)
    }

    /// Debit the fee and any transfer amount from the payer
    fn charge(&mut self, payer: &AccountId, fee: Hbar, transfer: Hbar) -> Result<(), LedgerError> {
        let entry = self
            .accounts
            .get_mut(payer)
            .ok_or_else(|| LedgerError::UnknownEntity(payer.to_string()))?;
        let required = fee
            .checked_add(transfer)
            .ok_or_else(|| LedgerError::InvalidRequest("amount overflow".to_string()))?;
        let remaining = entry
            .balance
            .checked_sub(required)
            .filter(|b| *b >= Hbar::ZERO)
            .ok_or(LedgerError::InsufficientBalance {
                payer: payer.to_string(),
                balance: entry.balance,
                required,
            })?;
        entry.balance = remaining;
        Ok(())
    }
}

/// Decrements the in-flight counter when a submission finishes or is dropped
struct InFlightToken<'a> {
    counter: &'a AtomicUsize,
}

impl<'a> InFlightToken<'a> {
    fn enter(counter: &'a AtomicUsize, high_water: &AtomicUsize) -> Self {
        let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
        high_water.fetch_max(now, Ordering::SeqCst);
        Self { counter }
    }
}

impl Drop for InFlightToken<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

/// An in-process ledger that settles every transaction before returning.
///
/// The operator account exists from genesis and pays for every submission. Fees are checked
/// against the maximum transaction fee before anything is applied, so a rejected call has no
/// effect. Failures can be queued per transaction kind with [`InMemoryLedger::fail_next`].
pub struct InMemoryLedger {
    operator: AccountId,
    operator_key: PrivateKey,
    max_transaction_fee: Hbar,
    fees: FeeSchedule,
    settlement_delay: Option<Duration>,
    state: Mutex<LedgerState>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl InMemoryLedger {
    /// Create a ledger whose genesis operator holds `operator_balance`
    pub fn new(operator: AccountId, operator_key: PrivateKey, operator_balance: Hbar) -> Self {
        let mut accounts = HashMap::new();
        accounts.insert(
            operator,
            AccountEntry {
                public_key: operator_key.public_key(),
                balance: operator_balance,
            },
        );

        Self {
            operator,
            operator_key,
            max_transaction_fee: Hbar::new(5),
            fees: FeeSchedule::default(),
            settlement_delay: None,
            state: Mutex::new(LedgerState {
                next_entity_num: operator.num.max(1000) + 1,
                nonce: 0,
                accounts,
                token_classes: HashMap::new(),
                receipts: Vec::new(),
                faults: HashMap::new(),
            }),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_max_transaction_fee(mut self, max: Hbar) -> Self {
        self.max_transaction_fee = max;
        self
    }

    pub fn with_fees(mut self, fees: FeeSchedule) -> Self {
        self.fees = fees;
        self
    }

    /// Simulate network latency before each transaction settles
    pub fn with_settlement_delay(mut self, delay: Duration) -> Self {
        self.settlement_delay = Some(delay);
        self
    }

    pub fn into_shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Key the operator signs with; also the treasury's key
    pub fn operator_key(&self) -> &PrivateKey {
        &self.operator_key
    }

    /// Make the next call of `kind` fail with `error` without side effects
    pub fn fail_next(&self, kind: TransactionKind, error: LedgerError) {
        self.state()
            .faults
            .entry(kind)
            .or_default()
            .push_back(error);
    }

    pub fn balance(&self, account: &AccountId) -> Option<Hbar> {
        self.state().accounts.get(account).map(|a| a.balance)
    }

    pub fn account_key(&self, account: &AccountId) -> Option<PublicKey> {
        self.state().accounts.get(account).map(|a| a.public_key)
    }

    pub fn token_class(&self, class: &TokenClassId) -> Option<TokenClassSpec> {
        self.state().token_classes.get(class).map(|c| c.spec.clone())
    }

    pub fn minted_count(&self, class: &TokenClassId) -> u64 {
        self.state()
            .token_classes
            .get(class)
            .map(|c| c.minted)
            .unwrap_or(0)
    }

    pub fn token_metadata(&self, token: &LedgerTokenId) -> Option<Vec<u8>> {
        let (class, serial) = token.class_and_serial()?;
        self.state()
            .token_classes
            .get(&class)
            .and_then(|c| c.metadata.get(&serial).cloned())
    }

    pub fn token_owner(&self, token: &LedgerTokenId) -> Option<AccountId> {
        let (class, serial) = token.class_and_serial()?;
        self.state()
            .token_classes
            .get(&class)
            .and_then(|c| c.owners.get(&serial).copied())
    }

    /// Receipts of every settled or failed transaction, oldest first
    pub fn receipts(&self) -> Vec<TransactionReceipt> {
        self.state().receipts.clone()
    }

    /// Highest number of submissions that were ever in flight at once
    pub fn max_observed_concurrency(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn state(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn settle(&self) {
        if let Some(delay) = self.settlement_delay {
            tokio::time::sleep(delay).await;
        }
    }

    /// Run one transaction against the ledger state and record its receipt.
    ///
    /// Injected faults and fee checks happen before `apply` so a rejected submission changes
    /// nothing but the receipt log.
    fn submit<T, F>(&self, kind: TransactionKind, apply: F) -> Result<T, LedgerError>
    where
        F: FnOnce(&mut LedgerState) -> Result<(T, String), LedgerError>,
    {
        let mut state = self.state();
        state.nonce += 1;
        let nonce = state.nonce;
        let transaction_id = TransactionId::new(self.operator, Utc::now());
        let transaction_hash = transaction_id.hash(kind, nonce);

        let result = match state.take_fault(kind) {
            Some(fault) => Err(fault),
            None => {
                let fee = self.fees.fee_for(kind);
                if fee > self.max_transaction_fee {
                    Err(LedgerError::InsufficientFee {
                        required: fee,
                        max: self.max_transaction_fee,
                    })
                } else {
                    apply(&mut *state)
                }
            }
        };

        match result {
            Ok((value, entity)) => {
                log::debug!("{} settled {:?} creating {}", transaction_id, kind, entity);
                state.receipts.push(TransactionReceipt::success(
                    transaction_id,
                    transaction_hash,
                    kind,
                    entity,
                ));
                Ok(value)
            }
            Err(err) => {
                log::debug!("{} rejected {:?}: {}", transaction_id, kind, err);
                state.receipts.push(TransactionReceipt::failure(
                    transaction_id,
                    transaction_hash,
                    kind,
                    err.to_string(),
                ));
                Err(err)
            }
        }
    }
}

#[async_trait]
impl LedgerClient for InMemoryLedger {
    fn operator(&self) -> AccountId {
        self.operator
    }

    async fn create_account(&self, initial_balance: Hbar) -> Result<LedgerAccount, LedgerError> {
        let _token = InFlightToken::enter(&self.in_flight, &self.max_in_flight);
        self.settle().await;

        if initial_balance < Hbar::ZERO {
            return Err(LedgerError::InvalidRequest(format!(
                "initial balance {} is negative",
                initial_balance
            )));
        }

        let operator = self.operator;
        let fee = self.fees.account_create;
        self.submit(TransactionKind::AccountCreate, |state| {
            state.charge(&operator, fee, initial_balance)?;
            let keys = KeyPair::generate();
            let account_id = state.allocate_entity();
            state.accounts.insert(
                account_id,
                AccountEntry {
                    public_key: keys.public_key,
                    balance: initial_balance,
                },
            );
            let account = LedgerAccount {
                account_id,
                public_key: keys.public_key,
                private_key: keys.private_key,
            };
            Ok((account, account_id.to_string()))
        })
    }

    async fn create_token_class(&self, spec: &TokenClassSpec) -> Result<TokenClassId, LedgerError> {
        let _token = InFlightToken::enter(&self.in_flight, &self.max_in_flight);
        self.settle().await;

        if spec.name.trim().is_empty() || spec.symbol.trim().is_empty() {
            return Err(LedgerError::InvalidRequest(
                "token class needs a name and a symbol".to_string(),
            ));
        }
        if let SupplyPolicy::Finite { max_supply: 0 } = spec.supply {
            return Err(LedgerError::InvalidRequest(
                "finite supply must be at least 1".to_string(),
            ));
        }
        if let Some(royalty) = &spec.royalty {
            if royalty.denominator == 0 || royalty.numerator > royalty.denominator {
                return Err(LedgerError::InvalidRequest(format!(
                    "royalty fraction {}/{} is invalid",
                    royalty.numerator, royalty.denominator
                )));
            }
        }

        let operator = self.operator;
        let operator_public = self.operator_key.public_key();
        let fee = self.fees.token_create;
        self.submit(TransactionKind::TokenCreate, |state| {
            let treasury_key = state
                .accounts
                .get(&spec.treasury)
                .map(|a| a.public_key)
                .ok_or_else(|| LedgerError::UnknownEntity(spec.treasury.to_string()))?;
            // Only the operator signs, so the treasury must be an operator-held key
            if treasury_key != operator_public {
                return Err(LedgerError::SignatureRejected(format!(
                    "treasury {} did not sign",
                    spec.treasury
                )));
            }
            if let Some(royalty) = &spec.royalty {
                if !state.accounts.contains_key(&royalty.collector) {
                    return Err(LedgerError::UnknownEntity(royalty.collector.to_string()));
                }
            }

            state.charge(&operator, fee, Hbar::ZERO)?;
            let class_id = state.allocate_entity();
            state.token_classes.insert(
                class_id,
                TokenClassEntry {
                    spec: spec.clone(),
                    minted: 0,
                    owners: HashMap::new(),
                    metadata: HashMap::new(),
                },
            );
            Ok((class_id, class_id.to_string()))
        })
    }

    async fn mint_token(
        &self,
        class: &TokenClassId,
        metadata: &[u8],
        supply_key: &PrivateKey,
    ) -> Result<LedgerTokenId, LedgerError> {
        let _token = InFlightToken::enter(&self.in_flight, &self.max_in_flight);
        self.settle().await;

        if metadata.len() > MAX_METADATA_BYTES {
            return Err(LedgerError::MetadataTooLarge {
                len: metadata.len(),
                max: MAX_METADATA_BYTES,
            });
        }

        let operator = self.operator;
        let signature = supply_key.sign(metadata);
        let fee = self.fees.token_mint;
        self.submit(TransactionKind::TokenMint, |state| {
            let entry = state
                .token_classes
                .get(class)
                .ok_or_else(|| LedgerError::UnknownEntity(class.to_string()))?;
            if !entry.spec.supply_key.verify(metadata, &signature) {
                return Err(LedgerError::SignatureRejected(format!(
                    "mint on {} not signed by its supply key",
                    class
                )));
            }
            if let SupplyPolicy::Finite { max_supply } = entry.spec.supply {
                if entry.minted >= max_supply {
                    return Err(LedgerError::SupplyExhausted(class.to_string()));
                }
            }

            state.charge(&operator, fee, Hbar::ZERO)?;
            let entry = state
                .token_classes
                .get_mut(class)
                .ok_or_else(|| LedgerError::UnknownEntity(class.to_string()))?;
            entry.minted += 1;
            let serial_number = entry.minted;
            entry.owners.insert(serial_number, entry.spec.treasury);
            entry.metadata.insert(serial_number, metadata.to_vec());

            let token = LedgerTokenId::minted(class, serial_number);
            let created = token.to_string();
            Ok((token, created))
        })
    }
}
