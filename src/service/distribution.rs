//! Revenue distribution engine.
//!
//! After a room ends its collected revenue is swapped into the reward
//! token and split across viewers by watch weight, then sent in batched
//! transfers. The payout record gates every run: a completed room is
//! never paid twice and a pending room is never run concurrently.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;

use crate::domain::{
    AdId, AdView, Advertisement, Payout, PayoutClaim, PayoutReceipt, PayoutRecipient,
    PricingTable, RoomId, UserId,
};
use crate::error::AdsError;
use crate::external::{
    ChainCall, ChainClient, ExternalError, IdentityResolver, SwapAggregator, TxOptions,
};
use crate::persistence::{AdCatalog, AdViewStore, PayoutStore};

/// Token addresses and transaction policy for distribution runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributionSettings {
    /// Token revenue is collected in.
    pub stable_token: String,
    /// Token paid out to viewers.
    pub reward_token: String,
    /// Treasury address that signs every transaction.
    pub treasury: String,
    /// Batch transfer contract.
    pub transfer_contract: String,
    /// Recipients per transfer transaction.
    pub batch_size: usize,
    /// Gas price multiplier over the network price, percent.
    pub gas_multiplier_pct: u128,
    /// Upper bound for `gas_multiplier_pct`.
    pub max_gas_multiplier_pct: u128,
    /// Extra gas over the estimate, percent.
    pub gas_limit_buffer_pct: u64,
    /// Confirmations to wait for.
    pub confirmations: u64,
    /// Longest wait for one confirmation.
    pub confirmation_timeout: Duration,
}

impl DistributionSettings {
    /// Settings with the default transaction policy: batches of 200,
    /// 120 % gas price capped at 300 %, 20 % gas buffer, one confirmation
    /// within 180 s.
    #[must_use]
    pub fn new(
        stable_token: impl Into<String>,
        reward_token: impl Into<String>,
        treasury: impl Into<String>,
        transfer_contract: impl Into<String>,
    ) -> Self {
        Self {
            stable_token: stable_token.into(),
            reward_token: reward_token.into(),
            treasury: treasury.into(),
            transfer_contract: transfer_contract.into(),
            batch_size: 200,
            gas_multiplier_pct: 120,
            max_gas_multiplier_pct: 300,
            gas_limit_buffer_pct: 20,
            confirmations: 1,
            confirmation_timeout: Duration::from_secs(180),
        }
    }
}

/// Storage and collaborator ports used by the engine.
#[derive(Clone)]
pub struct DistributionPorts {
    /// Watch records.
    pub views: Arc<dyn AdViewStore>,
    /// Advertisement catalog.
    pub catalog: Arc<dyn AdCatalog>,
    /// Payout records and earnings ledger.
    pub payouts: Arc<dyn PayoutStore>,
    /// Wallet lookup.
    pub identity: Arc<dyn IdentityResolver>,
    /// Swap routing.
    pub swap: Arc<dyn SwapAggregator>,
    /// Treasury signer.
    pub chain: Arc<dyn ChainClient>,
}

impl fmt::Debug for DistributionPorts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistributionPorts").finish_non_exhaustive()
    }
}

/// Result of a distribution trigger.
#[derive(Debug, Clone, PartialEq)]
pub enum DistributionOutcome {
    /// The room was already paid; the cached record is returned.
    AlreadyCompleted(Payout),
    /// Another run owns the room.
    InProgress(Payout),
    /// This call ran the pipeline; the record is completed, skipped or failed.
    Finished(Payout),
}

impl DistributionOutcome {
    /// The payout record.
    #[must_use]
    pub fn payout(&self) -> &Payout {
        match self {
            Self::AlreadyCompleted(p) | Self::InProgress(p) | Self::Finished(p) => p,
        }
    }

    /// Consumes the outcome, returning the payout record.
    #[must_use]
    pub fn into_payout(self) -> Payout {
        match self {
            Self::AlreadyCompleted(p) | Self::InProgress(p) | Self::Finished(p) => p,
        }
    }
}

enum RunResult {
    Completed(PayoutReceipt),
    Skipped(&'static str),
}

/// Runs the post-room revenue pipeline.
#[derive(Debug, Clone)]
pub struct DistributionEngine {
    ports: DistributionPorts,
    pricing: PricingTable,
    settings: DistributionSettings,
}

impl DistributionEngine {
    /// Creates a new `DistributionEngine`.
    #[must_use]
    pub fn new(
        ports: DistributionPorts,
        pricing: PricingTable,
        settings: DistributionSettings,
    ) -> Self {
        Self {
            ports,
            pricing,
            settings,
        }
    }

    /// Current payout record for a room.
    ///
    /// # Errors
    ///
    /// Returns [`AdsError::PayoutNotFound`] if the room was never
    /// triggered, or a persistence error.
    pub async fn payout(&self, room_id: RoomId) -> Result<Payout, AdsError> {
        self.ports
            .payouts
            .get_payout(room_id)
            .await?
            .ok_or(AdsError::PayoutNotFound(room_id))
    }

    /// Distributes a room's revenue, once.
    ///
    /// Pipeline failures do not surface as errors: they are stored on the
    /// payout as `failed` and the room can be triggered again.
    ///
    /// # Errors
    ///
    /// Returns an [`AdsError`] only if the payout record itself cannot be
    /// read or written.
    pub async fn trigger(&self, room_id: RoomId) -> Result<DistributionOutcome, AdsError> {
        let claimed = match self.ports.payouts.claim(room_id).await? {
            PayoutClaim::AlreadyCompleted(payout) => {
                tracing::debug!(%room_id, "payout already completed");
                return Ok(DistributionOutcome::AlreadyCompleted(payout));
            }
            PayoutClaim::InProgress(payout) => {
                tracing::info!(%room_id, "payout in progress elsewhere");
                return Ok(DistributionOutcome::InProgress(payout));
            }
            PayoutClaim::Claimed(payout) => payout,
        };

        tracing::info!(%room_id, attempt = claimed.attempts, "distribution started");
        let payout = match self.run(room_id).await {
            Ok(RunResult::Completed(receipt)) => {
                let payout = self.ports.payouts.complete(room_id, &receipt).await?;
                let credits: Vec<(UserId, u128)> = receipt
                    .recipients
                    .iter()
                    .map(|r| (r.user_id.clone(), r.amount))
                    .collect();
                if let Err(e) = self.ports.payouts.credit_earnings(&credits).await {
                    tracing::error!(%room_id, error = %e, "earnings ledger not credited");
                }
                tracing::info!(
                    %room_id,
                    distributed = %receipt.distributed,
                    recipients = receipt.recipients.len(),
                    batches = receipt.batch_count,
                    "distribution completed"
                );
                payout
            }
            Ok(RunResult::Skipped(reason)) => {
                tracing::info!(%room_id, reason, "distribution skipped");
                self.ports.payouts.skip(room_id, reason).await?
            }
            Err(e) => {
                tracing::error!(%room_id, error = %e, "distribution failed");
                self.ports.payouts.fail(room_id, &e.to_string()).await?
            }
        };
        Ok(DistributionOutcome::Finished(payout))
    }

    async fn run(&self, room_id: RoomId) -> Result<RunResult, AdsError> {
        let views = self.ports.views.list_for_room(room_id).await?;

        let mut ads: HashMap<AdId, Advertisement> = HashMap::new();
        let served: BTreeSet<AdId> = views.iter().map(|v| v.ad_id).collect();
        for ad_id in served {
            match self.ports.catalog.get_ad(ad_id).await? {
                Some(ad) => {
                    ads.insert(ad_id, ad);
                }
                None => tracing::warn!(%room_id, %ad_id, "served ad missing from catalog"),
            }
        }

        let revenue = ads
            .values()
            .map(|ad| self.pricing.revenue_for(ad))
            .fold(0_u128, u128::saturating_add);
        if revenue == 0 {
            return Ok(RunResult::Skipped("no_revenue"));
        }

        let weights = watch_weights(&views, &ads);
        let total_weight: f64 = weights.values().sum();
        if total_weight <= 0.0 {
            return Ok(RunResult::Skipped("no_watch_time"));
        }

        let mut receipt = PayoutReceipt {
            revenue,
            ..PayoutReceipt::default()
        };

        let s = &self.settings;
        let stable = self.ports.chain.token_balance(&s.stable_token, &s.treasury).await?;
        if stable < revenue {
            return Err(AdsError::Distribution(format!(
                "treasury holds {stable} of the stable token, revenue is {revenue}"
            )));
        }

        let before = self.ports.chain.token_balance(&s.reward_token, &s.treasury).await?;
        self.swap_revenue(revenue, &mut receipt).await?;
        let after = self.ports.chain.token_balance(&s.reward_token, &s.treasury).await?;
        let distributable = after.saturating_sub(before);
        receipt.reward_balance = distributable;
        if distributable == 0 {
            return Ok(RunResult::Skipped("no_reward_balance"));
        }

        let mut recipients = Vec::new();
        for (user_id, weight) in &weights {
            let amount = share_of(distributable, *weight, total_weight);
            match self.ports.identity.resolve_wallet(user_id).await? {
                Some(wallet) if amount > 0 => recipients.push(PayoutRecipient {
                    user_id: user_id.clone(),
                    wallet,
                    weight: *weight,
                    amount,
                }),
                Some(_) => {}
                None => tracing::info!(%room_id, %user_id, "no payout wallet, share retained"),
            }
        }
        if recipients.is_empty() {
            return Ok(RunResult::Skipped("no_resolvable_wallets"));
        }

        let deficit = apply_deficit_correction(&mut recipients, distributable)?;
        if deficit > 0 {
            tracing::warn!(%room_id, %deficit, "rounding deficit taken from last recipient");
        }
        let total = recipients
            .iter()
            .map(|r| r.amount)
            .fold(0_u128, u128::saturating_add);

        let allowance = self
            .ports
            .chain
            .allowance(&s.reward_token, &s.treasury, &s.transfer_contract)
            .await?;
        if allowance < total {
            let approve = ChainCall::Approve {
                token: s.reward_token.clone(),
                spender: s.transfer_contract.clone(),
                amount: total,
            };
            receipt.approve_txs.push(self.send(&approve).await?);
        }

        receipt.transfer_txs = self.transfer(&recipients).await?;
        receipt.batch_count = u32::try_from(receipt.transfer_txs.len()).unwrap_or(u32::MAX);
        receipt.distributed = total;
        receipt.recipients = recipients;
        Ok(RunResult::Completed(receipt))
    }

    async fn swap_revenue(&self, revenue: u128, receipt: &mut PayoutReceipt) -> Result<(), AdsError> {
        let s = &self.settings;
        let route = self
            .ports
            .swap
            .quote(&s.stable_token, &s.reward_token, revenue, &s.treasury)
            .await?;

        let allowance = self
            .ports
            .chain
            .allowance(&s.stable_token, &s.treasury, &route.allowance_target)
            .await?;
        if allowance < route.sell_amount {
            let approve = ChainCall::Approve {
                token: s.stable_token.clone(),
                spender: route.allowance_target.clone(),
                amount: route.sell_amount,
            };
            receipt.approve_txs.push(self.send(&approve).await?);
        }

        let call = ChainCall::Swap {
            route: route.clone(),
        };
        let gas_price = self.gas_price().await?;
        let nonce = self.ports.chain.pending_nonce().await?;
        let tx = self.tx_options(&call, nonce, gas_price).await?;
        let hash = self.ports.swap.execute(&route, &tx).await?;
        self.confirm(&hash).await?;
        tracing::info!(tx_hash = %hash, sold = %route.sell_amount, quoted = %route.buy_amount, "revenue swapped");
        receipt.swap_tx = Some(hash);
        Ok(())
    }

    /// Sends every batch concurrently with nonces reserved up front.
    async fn transfer(&self, recipients: &[PayoutRecipient]) -> Result<Vec<String>, AdsError> {
        let s = &self.settings;
        let gas_price = self.gas_price().await?;
        let base_nonce = self.ports.chain.pending_nonce().await?;

        let sends = recipients
            .chunks(s.batch_size.max(1))
            .enumerate()
            .map(|(index, batch)| {
                let call = ChainCall::MultiTransfer {
                    contract: s.transfer_contract.clone(),
                    token: s.reward_token.clone(),
                    recipients: batch.iter().map(|r| r.wallet.clone()).collect(),
                    amounts: batch.iter().map(|r| r.amount.to_string()).collect(),
                };
                let nonce = base_nonce.saturating_add(u64::try_from(index).unwrap_or(u64::MAX));
                async move {
                    let tx = self.tx_options(&call, nonce, gas_price).await?;
                    let hash = self.ports.chain.submit(&call, &tx).await?;
                    tracing::debug!(batch = index, nonce, tx_hash = %hash, "transfer batch submitted");
                    self.confirm(&hash).await?;
                    Ok::<String, AdsError>(hash)
                }
            });

        join_all(sends).await.into_iter().collect()
    }

    async fn send(&self, call: &ChainCall) -> Result<String, AdsError> {
        let gas_price = self.gas_price().await?;
        let nonce = self.ports.chain.pending_nonce().await?;
        let tx = self.tx_options(call, nonce, gas_price).await?;
        let hash = self.ports.chain.submit(call, &tx).await?;
        self.confirm(&hash).await?;
        Ok(hash)
    }

    async fn gas_price(&self) -> Result<u128, AdsError> {
        let network = self.ports.chain.gas_price().await?;
        let pct = self
            .settings
            .gas_multiplier_pct
            .min(self.settings.max_gas_multiplier_pct);
        Ok(network.saturating_mul(pct) / 100)
    }

    async fn tx_options(
        &self,
        call: &ChainCall,
        nonce: u64,
        gas_price: u128,
    ) -> Result<TxOptions, AdsError> {
        let estimate = self.ports.chain.estimate_gas(call).await?;
        Ok(TxOptions {
            nonce,
            gas_price,
            gas_limit: estimate.saturating_mul(100 + self.settings.gas_limit_buffer_pct) / 100,
        })
    }

    async fn confirm(&self, tx_hash: &str) -> Result<(), AdsError> {
        let receipt = self
            .ports
            .chain
            .wait_for_confirmation(
                tx_hash,
                self.settings.confirmations,
                self.settings.confirmation_timeout,
            )
            .await?;
        if receipt.success {
            Ok(())
        } else {
            Err(ExternalError::Reverted(tx_hash.to_string()).into())
        }
    }
}

/// Watch weight per viewer: the sum of `watched_ms / ad_duration_ms` over
/// their views. Views of ads with no known duration carry no weight.
#[must_use]
pub fn watch_weights(
    views: &[AdView],
    ads: &HashMap<AdId, Advertisement>,
) -> BTreeMap<UserId, f64> {
    let mut weights: BTreeMap<UserId, f64> = BTreeMap::new();
    for view in views {
        let Some(duration_ms) = ads.get(&view.ad_id).map(Advertisement::duration_ms) else {
            continue;
        };
        if duration_ms == 0 {
            continue;
        }
        *weights.entry(view.user_id.clone()).or_insert(0.0) +=
            view.watched_ms as f64 / duration_ms as f64;
    }
    weights
}

fn share_of(distributable: u128, weight: f64, total_weight: f64) -> u128 {
    let raw = weight / total_weight * distributable as f64;
    if raw.is_finite() && raw > 0.0 {
        raw.round() as u128
    } else {
        0
    }
}

/// Caps the sum of recipient amounts at `on_hand` by reducing the last
/// recipient. Returns the amount removed.
///
/// # Errors
///
/// Returns [`AdsError::Distribution`] if the last recipient's amount is
/// smaller than the excess.
pub fn apply_deficit_correction(
    recipients: &mut [PayoutRecipient],
    on_hand: u128,
) -> Result<u128, AdsError> {
    let total = recipients
        .iter()
        .map(|r| r.amount)
        .fold(0_u128, u128::saturating_add);
    if total <= on_hand {
        return Ok(0);
    }
    let deficit = total - on_hand;
    let Some(last) = recipients.last_mut() else {
        return Err(AdsError::Distribution(
            "deficit with no recipients".to_string(),
        ));
    };
    if last.amount < deficit {
        return Err(AdsError::Distribution(format!(
            "rounding deficit {deficit} exceeds last recipient amount {}",
            last.amount
        )));
    }
    last.amount -= deficit;
    Ok(deficit)
}

#[cfg(test)]
#[allow(clippy::panic)]
pub(crate) mod tests {
    use chrono::Utc;

    use super::*;
    use crate::domain::{PayoutStatus, Reservation, SessionId};
    use crate::persistence::MemoryStore;
    use crate::service::session_manager::tests::advertisement;
    use crate::testing::{FakeChain, FakeSwap, MapIdentity};

    const STABLE: &str = "0xstable";
    const REWARD: &str = "0xreward";
    const TREASURY: &str = "0xtreasury";
    const CONTRACT: &str = "0xmulti";

    pub(crate) struct Fixture {
        pub(crate) engine: DistributionEngine,
        pub(crate) store: Arc<MemoryStore>,
        pub(crate) chain: Arc<FakeChain>,
        pub(crate) swap: Arc<FakeSwap>,
        pub(crate) identity: Arc<MapIdentity>,
        pub(crate) room: RoomId,
        pub(crate) ad: AdId,
    }

    pub(crate) async fn fixture(batch_size: usize) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let chain = Arc::new(FakeChain::new(TREASURY));
        chain.set_balance(STABLE, TREASURY, 20_000_000);
        let swap = Arc::new(FakeSwap::new(Arc::clone(&chain), 3, 1));
        let identity = Arc::new(MapIdentity::new());

        let ports = DistributionPorts {
            views: Arc::clone(&store) as Arc<dyn AdViewStore>,
            catalog: Arc::clone(&store) as Arc<dyn AdCatalog>,
            payouts: Arc::clone(&store) as Arc<dyn PayoutStore>,
            identity: Arc::clone(&identity) as Arc<dyn IdentityResolver>,
            swap: Arc::clone(&swap) as Arc<dyn SwapAggregator>,
            chain: Arc::clone(&chain) as Arc<dyn ChainClient>,
        };
        let settings = DistributionSettings {
            batch_size,
            ..DistributionSettings::new(STABLE, REWARD, TREASURY, CONTRACT)
        };
        let engine = DistributionEngine::new(ports, PricingTable::new(1_000_000), settings);
        let ad = store.insert_ad(advertisement(5, 1, 3)).await;
        Fixture {
            engine,
            store,
            chain,
            swap,
            identity,
            room: RoomId::new(),
            ad,
        }
    }

    impl Fixture {
        /// One full 300 s view per named viewer.
        pub(crate) async fn watched(&self, users: &[&str]) {
            self.watched_in(self.room, users).await;
        }

        pub(crate) async fn watched_in(&self, room: RoomId, users: &[&str]) {
            let reservation =
                Reservation::new(self.ad, room, SessionId::new(), 300, Utc::now(), None);
            let views: Vec<AdView> = users
                .iter()
                .map(|u| AdView::for_reservation(&reservation, UserId::from(*u), 300_000))
                .collect();
            let Ok(()) = self.store.upsert_views(&views).await else {
                panic!("views should be stored");
            };
        }
    }

    fn recipient(user: &str, amount: u128) -> PayoutRecipient {
        PayoutRecipient {
            user_id: UserId::from(user),
            wallet: format!("0x{user}"),
            weight: 1.0,
            amount,
        }
    }

    #[tokio::test]
    async fn splits_reward_by_weight_and_retains_unresolved_shares() {
        let f = fixture(200).await;
        f.watched(&["alice", "bob", "carol"]).await;
        f.identity.insert("alice", "0xalice");
        f.identity.insert("bob", "0xbob");

        let Ok(DistributionOutcome::Finished(payout)) = f.engine.trigger(f.room).await else {
            panic!("distribution should run");
        };
        assert_eq!(payout.status, PayoutStatus::Completed);
        let Some(receipt) = payout.receipt else {
            panic!("completed payout carries a receipt");
        };
        // 5 min at 1.00/min, swapped 1:3
        assert_eq!(receipt.revenue, 5_000_000);
        assert_eq!(receipt.reward_balance, 15_000_000);
        assert_eq!(receipt.distributed, 10_000_000);
        assert_eq!(receipt.batch_count, 1);
        assert_eq!(receipt.approve_txs.len(), 2);
        assert!(receipt.swap_tx.is_some());

        assert_eq!(f.chain.balance(REWARD, "0xalice"), 5_000_000);
        assert_eq!(f.chain.balance(REWARD, "0xbob"), 5_000_000);
        assert_eq!(f.chain.balance(REWARD, TREASURY), 5_000_000);
        assert_eq!(f.store.earnings_of(&UserId::from("alice")).await, 5_000_000);
        assert_eq!(f.store.earnings_of(&UserId::from("carol")).await, 0);
    }

    #[tokio::test]
    async fn completed_room_is_never_paid_twice() {
        let f = fixture(200).await;
        f.watched(&["alice"]).await;
        f.identity.insert("alice", "0xalice");

        let Ok(first) = f.engine.trigger(f.room).await else {
            panic!("first run should succeed");
        };
        let submitted = f.chain.submitted().len();

        let Ok(DistributionOutcome::AlreadyCompleted(cached)) = f.engine.trigger(f.room).await
        else {
            panic!("second trigger should short-circuit");
        };
        assert_eq!(&cached, first.payout());
        assert_eq!(f.swap.quote_count(), 1);
        assert_eq!(f.swap.execution_count(), 1);
        assert_eq!(f.chain.submitted().len(), submitted);
    }

    #[tokio::test]
    async fn batches_use_sequential_nonces() {
        let f = fixture(2).await;
        let users = ["u1", "u2", "u3", "u4", "u5"];
        f.watched(&users).await;
        for u in users {
            f.identity.insert(u, format!("0x{u}"));
        }

        let Ok(outcome) = f.engine.trigger(f.room).await else {
            panic!("distribution should run");
        };
        let Some(receipt) = outcome.into_payout().receipt else {
            panic!("expected a receipt");
        };
        assert_eq!(receipt.batch_count, 3);

        let mut nonces: Vec<u64> = f
            .chain
            .submitted()
            .into_iter()
            .filter(|(call, _, _)| matches!(call, ChainCall::MultiTransfer { .. }))
            .map(|(_, tx, _)| tx.nonce)
            .collect();
        nonces.sort_unstable();
        let Some(&first) = nonces.first() else {
            panic!("expected transfer submissions");
        };
        assert_eq!(nonces, vec![first, first + 1, first + 2]);
    }

    #[tokio::test]
    async fn failed_run_is_recorded_and_retriable() {
        let f = fixture(200).await;
        f.watched(&["alice"]).await;
        f.identity.insert("alice", "0xalice");
        f.chain.set_fail_transfers(true);

        let Ok(DistributionOutcome::Finished(failed)) = f.engine.trigger(f.room).await else {
            panic!("run should finish");
        };
        assert_eq!(failed.status, PayoutStatus::Failed);
        assert!(failed.error.is_some_and(|e| e.contains("relay unavailable")));

        f.chain.set_fail_transfers(false);
        let Ok(DistributionOutcome::Finished(retried)) = f.engine.trigger(f.room).await else {
            panic!("retry should run");
        };
        assert_eq!(retried.status, PayoutStatus::Completed);
        assert_eq!(retried.attempts, 2);
        assert_eq!(f.chain.balance(REWARD, "0xalice"), 15_000_000);
    }

    #[tokio::test]
    async fn identity_outage_fails_the_run() {
        let f = fixture(200).await;
        f.watched(&["alice"]).await;
        f.identity.set_failing(true);

        let Ok(outcome) = f.engine.trigger(f.room).await else {
            panic!("run should finish");
        };
        assert_eq!(outcome.payout().status, PayoutStatus::Failed);
    }

    #[tokio::test]
    async fn room_without_views_is_skipped() {
        let f = fixture(200).await;
        let Ok(outcome) = f.engine.trigger(f.room).await else {
            panic!("run should finish");
        };
        assert_eq!(outcome.payout().status, PayoutStatus::Skipped);
        assert_eq!(outcome.payout().skip_reason.as_deref(), Some("no_revenue"));
        assert_eq!(f.swap.quote_count(), 0);
    }

    #[tokio::test]
    async fn unknown_room_has_no_payout() {
        let f = fixture(200).await;
        assert!(matches!(
            f.engine.payout(f.room).await,
            Err(AdsError::PayoutNotFound(_))
        ));
    }

    #[test]
    fn deficit_is_taken_from_last_recipient() {
        let mut recipients = vec![recipient("a", 334), recipient("b", 334), recipient("c", 334)];
        let Ok(deficit) = apply_deficit_correction(&mut recipients, 1000) else {
            panic!("correction should succeed");
        };
        assert_eq!(deficit, 2);
        let amounts: Vec<u128> = recipients.iter().map(|r| r.amount).collect();
        assert_eq!(amounts, vec![334, 334, 332]);
        assert_eq!(amounts.iter().sum::<u128>(), 1000);
    }

    #[test]
    fn no_deficit_leaves_amounts_alone() {
        let mut recipients = vec![recipient("a", 400), recipient("b", 500)];
        assert!(matches!(apply_deficit_correction(&mut recipients, 1000), Ok(0)));
        assert_eq!(recipients.last().map(|r| r.amount), Some(500));
    }

    #[test]
    fn deficit_larger_than_last_share_is_fatal() {
        let mut recipients = vec![recipient("a", 990), recipient("b", 5)];
        assert!(matches!(
            apply_deficit_correction(&mut recipients, 985),
            Err(AdsError::Distribution(_))
        ));
    }

    #[test]
    fn weights_sum_fractions_of_each_ad() {
        let short = advertisement(1, 1, 1);
        let long = advertisement(4, 1, 1);
        let room = RoomId::new();
        let r1 = Reservation::new(short.id, room, SessionId::new(), 60, Utc::now(), None);
        let r2 = Reservation::new(long.id, room, SessionId::new(), 240, Utc::now(), None);
        let views = vec![
            AdView::for_reservation(&r1, UserId::from("ann"), 30_000),
            AdView::for_reservation(&r2, UserId::from("ann"), 240_000),
            AdView::for_reservation(&r2, UserId::from("ben"), 60_000),
        ];
        let ads: HashMap<AdId, Advertisement> =
            [(short.id, short), (long.id, long)].into_iter().collect();

        let weights = watch_weights(&views, &ads);
        assert_eq!(weights.get(&UserId::from("ann")).copied(), Some(1.5));
        assert_eq!(weights.get(&UserId::from("ben")).copied(), Some(0.25));
    }
}
