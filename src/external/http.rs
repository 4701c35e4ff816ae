//! `reqwest` implementations of the collaborator ports.
//!
//! Every client is built with an explicit request timeout, so no
//! collaborator call can block a session transition indefinitely.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, Url};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;

use super::{
    ChainCall, ChainClient, ConferencingProvider, ExternalError, IdentityResolver, SwapAggregator,
    SwapRoute, TxOptions, TxReceipt,
};
use crate::domain::amount::deserialize_flexible;
use crate::domain::{RoomId, UserId};

/// Builds a client whose requests fail after `timeout`.
///
/// # Errors
///
/// Returns [`ExternalError::Http`] if the TLS backend cannot initialize.
pub fn build_client(timeout: Duration) -> Result<Client, ExternalError> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| ExternalError::Http {
            service: "http-client",
            message: e.to_string(),
        })
}

fn transport(service: &'static str) -> impl Fn(reqwest::Error) -> ExternalError {
    move |e| {
        if e.is_timeout() {
            ExternalError::Timeout(service.to_string())
        } else {
            ExternalError::Http {
                service,
                message: e.to_string(),
            }
        }
    }
}

async fn read_json<T: DeserializeOwned>(
    service: &'static str,
    response: Response,
) -> Result<T, ExternalError> {
    let status = response.status();
    if !status.is_success() {
        return Err(ExternalError::Status {
            service,
            status: status.as_u16(),
        });
    }
    response
        .json::<T>()
        .await
        .map_err(|e| ExternalError::Decode {
            service,
            message: e.to_string(),
        })
}

/// Appends path segments to `base`, percent-encoding each one.
fn endpoint(service: &'static str, base: &str, segments: &[&str]) -> Result<Url, ExternalError> {
    let mut url = Url::parse(base).map_err(|e| ExternalError::Http {
        service,
        message: format!("invalid base url {base}: {e}"),
    })?;
    url.path_segments_mut()
        .map_err(|()| ExternalError::Http {
            service,
            message: format!("base url {base} cannot carry a path"),
        })?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

/// Conferencing provider REST API.
#[derive(Debug, Clone)]
pub struct HttpConferencing {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpConferencing {
    /// Creates a client for the provider at `base_url`.
    #[must_use]
    pub fn new(client: Client, base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            api_key,
        }
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }
}

#[derive(Deserialize)]
struct ParticipantCount {
    count: u32,
}

#[async_trait]
impl ConferencingProvider for HttpConferencing {
    async fn active_participant_count(&self, room_id: RoomId) -> Result<u32, ExternalError> {
        const SERVICE: &str = "conferencing";
        let room = room_id.to_string();
        let url = endpoint(SERVICE, &self.base_url, &["rooms", room.as_str(), "participants"])?;
        let response = self
            .authorize(self.client.get(url))
            .send()
            .await
            .map_err(transport(SERVICE))?;
        let body: ParticipantCount = read_json(SERVICE, response).await?;
        Ok(body.count)
    }

    async fn end_room(&self, room_id: RoomId, reason: &str) -> Result<(), ExternalError> {
        const SERVICE: &str = "conferencing";
        let room = room_id.to_string();
        let url = endpoint(SERVICE, &self.base_url, &["rooms", room.as_str(), "end"])?;
        let response = self
            .authorize(self.client.post(url))
            .json(&json!({ "reason": reason }))
            .send()
            .await
            .map_err(transport(SERVICE))?;
        if !response.status().is_success() {
            return Err(ExternalError::Status {
                service: SERVICE,
                status: response.status().as_u16(),
            });
        }
        Ok(())
    }
}

/// Identity service wallet lookup.
#[derive(Debug, Clone)]
pub struct HttpIdentity {
    client: Client,
    base_url: String,
}

impl HttpIdentity {
    /// Creates a client for the identity service at `base_url`.
    #[must_use]
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }
}

#[derive(Deserialize)]
struct WalletBody {
    address: Option<String>,
}

#[async_trait]
impl IdentityResolver for HttpIdentity {
    async fn resolve_wallet(&self, user_id: &UserId) -> Result<Option<String>, ExternalError> {
        const SERVICE: &str = "identity";
        let url = endpoint(SERVICE, &self.base_url, &["users", user_id.as_str(), "wallet"])?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(transport(SERVICE))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body: WalletBody = read_json(SERVICE, response).await?;
        Ok(body.address.filter(|a| !a.is_empty()))
    }
}

/// 0x-style quote API. Execution goes through the treasury signer.
#[derive(Clone)]
pub struct HttpSwapAggregator {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    chain: Arc<dyn ChainClient>,
}

impl fmt::Debug for HttpSwapAggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpSwapAggregator")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl HttpSwapAggregator {
    /// Creates a quoting client that executes routes through `chain`.
    #[must_use]
    pub fn new(
        client: Client,
        base_url: impl Into<String>,
        api_key: Option<String>,
        chain: Arc<dyn ChainClient>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            api_key,
            chain,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct QuoteBody {
    #[serde(deserialize_with = "deserialize_flexible")]
    buy_amount: u128,
    allowance_target: String,
    to: String,
    data: String,
    #[serde(default, deserialize_with = "deserialize_flexible")]
    value: u128,
}

#[async_trait]
impl SwapAggregator for HttpSwapAggregator {
    async fn quote(
        &self,
        sell_token: &str,
        buy_token: &str,
        sell_amount: u128,
        taker: &str,
    ) -> Result<SwapRoute, ExternalError> {
        const SERVICE: &str = "swap";
        let mut url = endpoint(SERVICE, &self.base_url, &["swap", "v1", "quote"])?;
        url.query_pairs_mut()
            .append_pair("sellToken", sell_token)
            .append_pair("buyToken", buy_token)
            .append_pair("sellAmount", &sell_amount.to_string())
            .append_pair("takerAddress", taker);

        let mut request = self.client.get(url);
        if let Some(key) = &self.api_key {
            request = request.header("0x-api-key", key);
        }
        let response = request.send().await.map_err(transport(SERVICE))?;
        let body: QuoteBody = read_json(SERVICE, response).await?;
        Ok(SwapRoute {
            sell_token: sell_token.to_string(),
            buy_token: buy_token.to_string(),
            sell_amount,
            buy_amount: body.buy_amount,
            allowance_target: body.allowance_target,
            to: body.to,
            data: body.data,
            value: body.value,
        })
    }

    async fn execute(&self, route: &SwapRoute, tx: &TxOptions) -> Result<String, ExternalError> {
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

/// Signer relay that owns the treasury key and ABI-encodes calls.
#[derive(Debug, Clone)]
pub struct HttpChainClient {
    client: Client,
    base_url: String,
    poll_interval: Duration,
}

impl HttpChainClient {
    /// Creates a client for the relay at `base_url`, polling receipts every
    /// `poll_interval`.
    #[must_use]
    pub fn new(client: Client, base_url: impl Into<String>, poll_interval: Duration) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            poll_interval,
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, segments: &[&str]) -> Result<T, ExternalError> {
        const SERVICE: &str = "chain";
        let url = endpoint(SERVICE, &self.base_url, segments)?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(transport(SERVICE))?;
        read_json(SERVICE, response).await
    }

    async fn post_json<T: DeserializeOwned>(
        &self,
        segments: &[&str],
        body: &serde_json::Value,
    ) -> Result<T, ExternalError> {
        const SERVICE: &str = "chain";
        let url = endpoint(SERVICE, &self.base_url, segments)?;
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(transport(SERVICE))?;
        read_json(SERVICE, response).await
    }
}

#[derive(Deserialize)]
struct BalanceBody {
    #[serde(deserialize_with = "deserialize_flexible")]
    balance: u128,
}

#[derive(Deserialize)]
struct AllowanceBody {
    #[serde(deserialize_with = "deserialize_flexible")]
    allowance: u128,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GasPriceBody {
    #[serde(deserialize_with = "deserialize_flexible")]
    gas_price: u128,
}

#[derive(Deserialize)]
struct NonceBody {
    nonce: u64,
}

#[derive(Deserialize)]
struct GasBody {
    gas: u64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitBody {
    tx_hash: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReceiptBody {
    status: String,
    #[serde(default)]
    block_number: u64,
}

#[async_trait]
impl ChainClient for HttpChainClient {
    async fn token_balance(&self, token: &str, owner: &str) -> Result<u128, ExternalError> {
        let body: BalanceBody = self.get_json(&["tokens", token, "balance", owner]).await?;
        Ok(body.balance)
    }

    async fn allowance(
        &self,
        token: &str,
        owner: &str,
        spender: &str,
    ) -> Result<u128, ExternalError> {
        let body: AllowanceBody = self
            .get_json(&["tokens", token, "allowance", owner, spender])
            .await?;
        Ok(body.allowance)
    }

    async fn gas_price(&self) -> Result<u128, ExternalError> {
        let body: GasPriceBody = self.get_json(&["gas-price"]).await?;
        Ok(body.gas_price)
    }

    async fn pending_nonce(&self) -> Result<u64, ExternalError> {
        let body: NonceBody = self.get_json(&["nonce"]).await?;
        Ok(body.nonce)
    }

    async fn estimate_gas(&self, call: &ChainCall) -> Result<u64, ExternalError> {
        let body: GasBody = self
            .post_json(&["estimate"], &json!({ "call": call }))
            .await?;
        Ok(body.gas)
    }

    async fn submit(&self, call: &ChainCall, tx: &TxOptions) -> Result<String, ExternalError> {
        let body: SubmitBody = self
            .post_json(&["transactions"], &json!({ "call": call, "tx": tx }))
            .await?;
        Ok(body.tx_hash)
    }

    async fn wait_for_confirmation(
        &self,
        tx_hash: &str,
        confirmations: u64,
        timeout: Duration,
    ) -> Result<TxReceipt, ExternalError> {
        let confirmations = confirmations.to_string();
        let poll = async {
            loop {
                let body: ReceiptBody = self
                    .get_json(&["transactions", tx_hash, "receipt", confirmations.as_str()])
                    .await?;
                match body.status.as_str() {
                    "confirmed" => {
                        return Ok(TxReceipt {
                            tx_hash: tx_hash.to_string(),
                            block_number: body.block_number,
                            success: true,
                        });
                    }
                    "reverted" => return Err(ExternalError::Reverted(tx_hash.to_string())),
                    _ => tokio::time::sleep(self.poll_interval).await,
                }
            }
        };
        tokio::time::timeout(timeout, poll)
            .await
            .map_err(|_| ExternalError::Timeout(format!("confirmation of {tx_hash}")))?
    }
}
