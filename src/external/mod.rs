//! Collaborator ports: conferencing, identity, swap routing and the chain.
//!
//! The engine never talks to these services directly. Each is a trait
//! with an HTTP implementation in [`http`] and an in-process double in
//! [`crate::testing`].

pub mod http;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::amount::as_string;
use crate::domain::{RoomId, UserId};

/// Failure of a collaborator call.
#[derive(Debug, thiserror::Error)]
pub enum ExternalError {
    /// Transport failure (connection refused, TLS, reset...).
    #[error("{service} request failed: {message}")]
    Http {
        /// Collaborator name.
        service: &'static str,
        /// Transport error text.
        message: String,
    },

    /// Non-success HTTP status.
    #[error("{service} returned status {status}")]
    Status {
        /// Collaborator name.
        service: &'static str,
        /// HTTP status code.
        status: u16,
    },

    /// The response body did not have the expected shape.
    #[error("{service} response could not be decoded: {message}")]
    Decode {
        /// Collaborator name.
        service: &'static str,
        /// Decoder error text.
        message: String,
    },

    /// A submitted transaction was mined but reverted.
    #[error("transaction {0} reverted")]
    Reverted(String),

    /// A call or confirmation wait exceeded its deadline.
    #[error("timed out waiting for {0}")]
    Timeout(String),
}

/// Executable swap route returned by the aggregator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwapRoute {
    /// Token sold.
    pub sell_token: String,
    /// Token bought.
    pub buy_token: String,
    /// Amount sold, base units.
    #[serde(with = "as_string")]
    pub sell_amount: u128,
    /// Quoted amount bought, base units.
    #[serde(with = "as_string")]
    pub buy_amount: u128,
    /// Spender that must be approved for `sell_amount` of `sell_token`.
    pub allowance_target: String,
    /// Contract to call.
    pub to: String,
    /// Hex calldata.
    pub data: String,
    /// Native value to attach, base units.
    #[serde(with = "as_string")]
    pub value: u128,
}

/// A contract call the treasury signer can send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ChainCall {
    /// ERC-20 `approve(spender, amount)`.
    Approve {
        /// Token contract.
        token: String,
        /// Spender to approve.
        spender: String,
        /// Allowance to grant.
        #[serde(with = "as_string")]
        amount: u128,
    },
    /// Execute an aggregator route.
    Swap {
        /// The quoted route.
        route: SwapRoute,
    },
    /// `multiTransfer(token, recipients, amounts)` on the batch contract.
    MultiTransfer {
        /// Batch transfer contract.
        contract: String,
        /// Token to send.
        token: String,
        /// Recipient wallets.
        recipients: Vec<String>,
        /// Amounts, aligned with `recipients`, as decimal strings.
        amounts: Vec<String>,
    },
}

/// Gas and nonce for one transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxOptions {
    /// Sender nonce.
    pub nonce: u64,
    /// Gas price, wei.
    #[serde(with = "as_string")]
    pub gas_price: u128,
    /// Gas limit.
    pub gas_limit: u64,
}

/// Outcome of a confirmed transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxReceipt {
    /// Transaction hash.
    pub tx_hash: String,
    /// Block it was mined in.
    pub block_number: u64,
    /// `false` if the transaction reverted.
    pub success: bool,
}

/// Video/audio conferencing provider.
#[async_trait]
pub trait ConferencingProvider: Send + Sync {
    /// Number of participants currently connected to the room's media session.
    ///
    /// # Errors
    ///
    /// Returns [`ExternalError`] if the provider cannot be reached.
    async fn active_participant_count(&self, room_id: RoomId) -> Result<u32, ExternalError>;

    /// Terminates the room's media session.
    ///
    /// # Errors
    ///
    /// Returns [`ExternalError`] if the provider rejects the call.
    async fn end_room(&self, room_id: RoomId, reason: &str) -> Result<(), ExternalError>;
}

/// Wallet lookup by user handle.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    /// The viewer's payout wallet, `None` if they have none.
    ///
    /// # Errors
    ///
    /// Returns [`ExternalError`] if the identity service fails.
    async fn resolve_wallet(&self, user_id: &UserId) -> Result<Option<String>, ExternalError>;
}

/// Price quoting and swap execution.
#[async_trait]
pub trait SwapAggregator: Send + Sync {
    /// Quotes selling `sell_amount` of `sell_token` for `buy_token` on
    /// behalf of `taker`.
    ///
    /// # Errors
    ///
    /// Returns [`ExternalError`] if no route is available.
    async fn quote(
        &self,
        sell_token: &str,
        buy_token: &str,
        sell_amount: u128,
        taker: &str,
    ) -> Result<SwapRoute, ExternalError>;

    /// Sends the swap transaction and returns its hash.
    ///
    /// # Errors
    ///
    /// Returns [`ExternalError`] if submission fails.
    async fn execute(&self, route: &SwapRoute, tx: &TxOptions) -> Result<String, ExternalError>;
}

/// Read and write access to the chain through the treasury signer.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// ERC-20 balance of `owner`.
    ///
    /// # Errors
    ///
    /// Returns [`ExternalError`] on RPC failure.
    async fn token_balance(&self, token: &str, owner: &str) -> Result<u128, ExternalError>;

    /// ERC-20 allowance granted by `owner` to `spender`.
    ///
    /// # Errors
    ///
    /// Returns [`ExternalError`] on RPC failure.
    async fn allowance(&self, token: &str, owner: &str, spender: &str)
    -> Result<u128, ExternalError>;

    /// Current network gas price, wei.
    ///
    /// # Errors
    ///
    /// Returns [`ExternalError`] on RPC failure.
    async fn gas_price(&self) -> Result<u128, ExternalError>;

    /// Next nonce for the treasury, counting pending transactions.
    ///
    /// # Errors
    ///
    /// Returns [`ExternalError`] on RPC failure.
    async fn pending_nonce(&self) -> Result<u64, ExternalError>;

    /// Gas estimate for a call.
    ///
    /// # Errors
    ///
    /// Returns [`ExternalError`] if the call would revert or RPC fails.
    async fn estimate_gas(&self, call: &ChainCall) -> Result<u64, ExternalError>;

    /// Signs and broadcasts a call, returning the transaction hash.
    ///
    /// # Errors
    ///
    /// Returns [`ExternalError`] if the signer rejects the transaction.
    async fn submit(&self, call: &ChainCall, tx: &TxOptions) -> Result<String, ExternalError>;

    /// Waits until `tx_hash` has `confirmations` confirmations.
    ///
    /// # Errors
    ///
    /// Returns [`ExternalError::Timeout`] past `timeout` and
    /// [`ExternalError::Reverted`] if the transaction failed.
    async fn wait_for_confirmation(
        &self,
        tx_hash: &str,
        confirmations: u64,
        timeout: Duration,
    ) -> Result<TxReceipt, ExternalError>;
}
