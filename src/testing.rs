//! In-process collaborator doubles.
//!
//! Used by the unit and integration tests, and handy for running the
//! engine locally without a conferencing provider or a chain. The chain
//! double keeps real balances: a swap credits the treasury, a batch
//! transfer debits it.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::domain::amount::parse_amount;
use crate::domain::{RoomId, UserId};
use crate::external::{
    ChainCall, ChainClient, ConferencingProvider, ExternalError, IdentityResolver, SwapAggregator,
    SwapRoute, TxOptions, TxReceipt,
};

/// Conferencing double reporting a fixed participant count.
#[derive(Debug, Default)]
pub struct StaticConferencing {
    count: AtomicU32,
    failing: AtomicBool,
    delay: Mutex<Duration>,
    ended: Mutex<Vec<(RoomId, String)>>,
}

impl StaticConferencing {
    /// Reports `count` participants for every room.
    #[must_use]
    pub fn new(count: u32) -> Self {
        Self {
            count: AtomicU32::new(count),
            ..Self::default()
        }
    }

    /// Changes the reported count.
    pub fn set_count(&self, count: u32) {
        self.count.store(count, Ordering::SeqCst);
    }

    /// Makes every call fail until reset.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Holds every call for `delay` before answering.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap_or_else(PoisonError::into_inner) = delay;
    }

    /// Rooms terminated so far, with their reasons.
    #[must_use]
    pub fn ended_rooms(&self) -> Vec<(RoomId, String)> {
        self.ended
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn check(&self) -> Result<(), ExternalError> {
        let delay = *self.delay.lock().unwrap_or_else(PoisonError::into_inner);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(ExternalError::Status {
                service: "conferencing",
                status: 503,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ConferencingProvider for StaticConferencing {
    async fn active_participant_count(&self, _room_id: RoomId) -> Result<u32, ExternalError> {
        self.check().await?;
        Ok(self.count.load(Ordering::SeqCst))
    }

    async fn end_room(&self, room_id: RoomId, reason: &str) -> Result<(), ExternalError> {
        self.check().await?;
        self.ended
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((room_id, reason.to_string()));
        Ok(())
    }
}

/// Identity double backed by a map.
#[derive(Debug, Default)]
pub struct MapIdentity {
    wallets: Mutex<HashMap<UserId, String>>,
    failing: AtomicBool,
}

impl MapIdentity {
    /// Creates an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a wallet for a viewer.
    pub fn insert(&self, user_id: impl Into<UserId>, wallet: impl Into<String>) {
        self.wallets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(user_id.into(), wallet.into());
    }

    /// Makes every lookup fail until reset.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl IdentityResolver for MapIdentity {
    async fn resolve_wallet(&self, user_id: &UserId) -> Result<Option<String>, ExternalError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ExternalError::Timeout("identity".to_string()));
        }
        Ok(self
            .wallets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(user_id)
            .cloned())
    }
}

#[derive(Debug, Default)]
struct ChainState {
    balances: HashMap<(String, String), u128>,
    allowances: HashMap<(String, String, String), u128>,
    nonce: u64,
    next_hash: u64,
    submitted: Vec<(ChainCall, TxOptions, String)>,
    reverting: HashSet<String>,
}

/// Chain double with ERC-20 balances and allowances for one treasury.
#[derive(Debug)]
pub struct FakeChain {
    treasury: String,
    gas_price: u128,
    state: Mutex<ChainState>,
    fail_transfers: AtomicBool,
}

impl FakeChain {
    /// Creates a chain where `treasury` signs every transaction.
    #[must_use]
    pub fn new(treasury: impl Into<String>) -> Self {
        Self {
            treasury: treasury.into(),
            gas_price: 1_000_000_000,
            state: Mutex::new(ChainState::default()),
            fail_transfers: AtomicBool::new(false),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ChainState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sets a token balance.
    pub fn set_balance(&self, token: &str, owner: &str, amount: u128) {
        self.state()
            .balances
            .insert((token.to_string(), owner.to_string()), amount);
    }

    /// Reads a token balance.
    #[must_use]
    pub fn balance(&self, token: &str, owner: &str) -> u128 {
        self.state()
            .balances
            .get(&(token.to_string(), owner.to_string()))
            .copied()
            .unwrap_or(0)
    }

    /// Makes every batch transfer submission fail until reset.
    pub fn set_fail_transfers(&self, fail: bool) {
        self.fail_transfers.store(fail, Ordering::SeqCst);
    }

    /// Every transaction submitted so far with its options and hash.
    #[must_use]
    pub fn submitted(&self) -> Vec<(ChainCall, TxOptions, String)> {
        self.state().submitted.clone()
    }

    fn debit(state: &mut ChainState, token: &str, owner: &str, amount: u128) -> bool {
        let balance = state
            .balances
            .entry((token.to_string(), owner.to_string()))
            .or_insert(0);
        if *balance < amount {
            return false;
        }
        *balance -= amount;
        true
    }

    fn credit(state: &mut ChainState, token: &str, owner: &str, amount: u128) {
        let balance = state
            .balances
            .entry((token.to_string(), owner.to_string()))
            .or_insert(0);
        *balance = balance.saturating_add(amount);
    }
}

#[async_trait]
impl ChainClient for FakeChain {
    async fn token_balance(&self, token: &str, owner: &str) -> Result<u128, ExternalError> {
        Ok(self.balance(token, owner))
    }

    async fn allowance(
        &self,
        token: &str,
        owner: &str,
        spender: &str,
    ) -> Result<u128, ExternalError> {
        Ok(self
            .state()
            .allowances
            .get(&(token.to_string(), owner.to_string(), spender.to_string()))
            .copied()
            .unwrap_or(0))
    }

    async fn gas_price(&self) -> Result<u128, ExternalError> {
        Ok(self.gas_price)
    }

    async fn pending_nonce(&self) -> Result<u64, ExternalError> {
        Ok(self.state().nonce)
    }

    async fn estimate_gas(&self, call: &ChainCall) -> Result<u64, ExternalError> {
        Ok(match call {
            ChainCall::Approve { .. } => 46_000,
            ChainCall::Swap { .. } => 180_000,
            ChainCall::MultiTransfer { recipients, .. } => {
                30_000 + 35_000 * u64::try_from(recipients.len()).unwrap_or(u64::MAX / 35_000)
            }
        })
    }

    async fn submit(&self, call: &ChainCall, tx: &TxOptions) -> Result<String, ExternalError> {
        if matches!(call, ChainCall::MultiTransfer { .. })
            && self.fail_transfers.load(Ordering::SeqCst)
        {
            return Err(ExternalError::Http {
                service: "chain",
                message: "relay unavailable".to_string(),
            });
        }

        let mut state = self.state();
        state.next_hash += 1;
        let hash = format!("0x{:064x}", state.next_hash);
        let mut reverted = false;

        match call {
            ChainCall::Approve {
                token,
                spender,
                amount,
            } => {
                state.allowances.insert(
                    (token.clone(), self.treasury.clone(), spender.clone()),
                    *amount,
                );
            }
            ChainCall::Swap { route } => {
                reverted =
                    !Self::debit(&mut state, &route.sell_token, &self.treasury, route.sell_amount);
                if !reverted {
                    Self::credit(&mut state, &route.buy_token, &self.treasury, route.buy_amount);
                }
            }
            ChainCall::MultiTransfer {
                token,
                recipients,
                amounts,
                ..
            } => {
                let parsed: Vec<u128> = amounts.iter().filter_map(|a| parse_amount(a)).collect();
                let total: u128 = parsed.iter().sum();
                reverted = parsed.len() != recipients.len()
                    || !Self::debit(&mut state, token, &self.treasury, total);
                if !reverted {
                    for (wallet, amount) in recipients.iter().zip(parsed) {
                        Self::credit(&mut state, token, wallet, amount);
                    }
                }
            }
        }

        if reverted {
            state.reverting.insert(hash.clone());
        }
        state.nonce = state.nonce.max(tx.nonce + 1);
        state.submitted.push((call.clone(), *tx, hash.clone()));
        Ok(hash)
    }

    async fn wait_for_confirmation(
        &self,
        tx_hash: &str,
        _confirmations: u64,
        _timeout: Duration,
    ) -> Result<TxReceipt, ExternalError> {
        let state = self.state();
        if state.reverting.contains(tx_hash) {
            return Err(ExternalError::Reverted(tx_hash.to_string()));
        }
        Ok(TxReceipt {
            tx_hash: tx_hash.to_string(),
            block_number: state.next_hash,
            success: true,
        })
    }
}

/// Swap double quoting a fixed rate and executing through a [`FakeChain`].
#[derive(Debug)]
pub struct FakeSwap {
    chain: Arc<FakeChain>,
    /// `buy = sell * numerator / denominator`.
    rate: (u128, u128),
    quotes: AtomicU32,
    executions: AtomicU32,
}

impl FakeSwap {
    /// Creates a swap double with rate `numerator / denominator`.
    #[must_use]
    pub fn new(chain: Arc<FakeChain>, numerator: u128, denominator: u128) -> Self {
        Self {
            chain,
            rate: (numerator, denominator.max(1)),
            quotes: AtomicU32::new(0),
            executions: AtomicU32::new(0),
        }
    }

    /// Number of quotes requested.
    #[must_use]
    pub fn quote_count(&self) -> u32 {
        self.quotes.load(Ordering::SeqCst)
    }

    /// Number of swaps executed.
    #[must_use]
    pub fn execution_count(&self) -> u32 {
        self.executions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SwapAggregator for FakeSwap {
    async fn quote(
        &self,
        sell_token: &str,
        buy_token: &str,
        sell_amount: u128,
        _taker: &str,
    ) -> Result<SwapRoute, ExternalError> {
        self.quotes.fetch_add(1, Ordering::SeqCst);
        let (num, den) = self.rate;
        Ok(SwapRoute {
            sell_token: sell_token.to_string(),
            buy_token: buy_token.to_string(),
            sell_amount,
            buy_amount: sell_amount.saturating_mul(num) / den,
            allowance_target: "0xallowance".to_string(),
            to: "0xrouter".to_string(),
            data: "0x".to_string(),
            value: 0,
        })
    }

    async fn execute(&self, route: &SwapRoute, tx: &TxOptions) -> Result<String, ExternalError> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        self.chain
            .submit(
                &ChainCall::Swap {
                    route: route.clone(),
                },
                tx,
            )
            .await
    }
}
