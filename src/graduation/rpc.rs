//! HTTP clients for the migration collaborators
//!
//! - [`SolanaLedgerReader`]: JSON-RPC reader for curve accounts
//! - [`HttpPoolCreator`]: pool service
//! - [`HttpCustodyService`]: custody service
//! - [`WebhookAnnouncer`]: migration webhook

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use super::account::{ASSET_OFFSET, CurveAccount};
use super::adapters::{
    Announcer, CustodyService, ExternalLedgerReader, MigrationEvent, PoolCreator, ReleaseReceipt,
};
use crate::core_types::{Address, AssetUnits, Lamports};
use crate::error::MarketError;

fn http_client(service: &'static str, timeout: Duration) -> Result<reqwest::Client, MarketError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| MarketError::external(service, e))
}

// ============================================================================
// JSON-RPC
// ============================================================================

#[derive(Serialize)]
struct JsonRpcRequest<T> {
    jsonrpc: &'static str,
    method: &'static str,
    params: T,
    id: u64,
}

#[derive(Deserialize)]
struct JsonRpcResponse<T> {
    result: Option<T>,
    error: Option<JsonRpcError>,
}

#[derive(Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

/// `getAccountInfo` result envelope.
#[derive(Deserialize)]
struct RpcContextValue<T> {
    value: Option<T>,
}

#[derive(Deserialize)]
struct RpcAccount {
    /// `[payload, encoding]`
    data: (String, String),
}

#[derive(Deserialize)]
struct RpcKeyedAccount {
    pubkey: String,
    account: RpcAccount,
}

/// Reads curve accounts over Solana JSON-RPC.
///
/// The curve account for an asset is located once with `getProgramAccounts`
/// filtered on the asset field, then read directly with `getAccountInfo`.
pub struct SolanaLedgerReader {
    client: reqwest::Client,
    url: String,
    program: Address,
    discriminator: Option<[u8; 8]>,
    curve_accounts: DashMap<Address, String>,
}

impl SolanaLedgerReader {
    pub fn new(
        url: impl Into<String>,
        program: Address,
        discriminator: Option<[u8; 8]>,
    ) -> Result<Self, MarketError> {
        Ok(Self {
            client: http_client("ledger_reader", Duration::from_secs(15))?,
            url: url.into(),
            program,
            discriminator,
            curve_accounts: DashMap::new(),
        })
    }

    async fn rpc_call<T, R>(&self, method: &'static str, params: T) -> Result<R, MarketError>
    where
        T: Serialize,
        R: for<'de> Deserialize<'de>,
    {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            method,
            params,
            id: 1,
        };
        let response: JsonRpcResponse<R> = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| MarketError::external("ledger_reader", e))?
            .json()
            .await
            .map_err(|e| {
                MarketError::external("ledger_reader", format!("bad {} response: {}", method, e))
            })?;

        if let Some(error) = response.error {
            return Err(MarketError::external(
                "ledger_reader",
                format!("RPC error {}: {}", error.code, error.message),
            ));
        }
        response.result.ok_or_else(|| {
            MarketError::external("ledger_reader", format!("no result for {}", method))
        })
    }

    async fn locate(&self, asset: &Address) -> Result<Option<String>, MarketError> {
        if let Some(found) = self.curve_accounts.get(asset) {
            return Ok(Some(found.value().clone()));
        }
        let params = (
            self.program.to_string(),
            serde_json::json!({
                "encoding": "base64",
                "filters": [{ "memcmp": { "offset": ASSET_OFFSET, "bytes": asset.to_string() } }],
            }),
        );
        let accounts: Vec<RpcKeyedAccount> = self.rpc_call("getProgramAccounts", params).await?;
        let Some(first) = accounts.into_iter().next() else {
            return Ok(None);
        };
        debug!(asset = %asset, curve_account = %first.pubkey, "Located curve account");
        self.curve_accounts.insert(*asset, first.pubkey.clone());
        Ok(Some(first.pubkey))
    }

    fn decode(&self, account: &RpcAccount) -> Result<CurveAccount, MarketError> {
        let (payload, encoding) = &account.data;
        if encoding != "base64" {
            return Err(MarketError::external(
                "ledger_reader",
                format!("unexpected account encoding {}", encoding),
            ));
        }
        let bytes = BASE64
            .decode(payload)
            .map_err(|e| MarketError::external("ledger_reader", e))?;
        let decoded = match &self.discriminator {
            Some(expected) => CurveAccount::decode_checked(&bytes, expected),
            None => CurveAccount::decode(&bytes),
        };
        decoded.map_err(|e| MarketError::external("ledger_reader", e))
    }
}

#[async_trait]
impl ExternalLedgerReader for SolanaLedgerReader {
    fn name(&self) -> &'static str {
        "solana_rpc"
    }

    async fn read_curve(&self, asset: &Address) -> Result<Option<CurveAccount>, MarketError> {
        let Some(curve_account) = self.locate(asset).await? else {
            return Ok(None);
        };
        let params = (curve_account, serde_json::json!({ "encoding": "base64" }));
        let envelope: RpcContextValue<RpcAccount> =
            self.rpc_call("getAccountInfo", params).await?;
        envelope.value.as_ref().map(|a| self.decode(a)).transpose()
    }
}

// ============================================================================
// Pool service
// ============================================================================

#[derive(Serialize)]
struct CreatePoolRequest<'a> {
    asset: &'a str,
    quote_amount: Lamports,
    asset_amount: AssetUnits,
}

#[derive(Deserialize)]
struct PoolResponse {
    pool_id: String,
}

pub struct HttpPoolCreator {
    client: reqwest::Client,
    base_url: String,
}

impl HttpPoolCreator {
    /// The caller bounds `create_pool` with its own timeout; the client
    /// timeout only guards against a hung connection.
    pub fn new(base_url: impl Into<String>) -> Result<Self, MarketError> {
        Ok(Self {
            client: http_client("pool_service", Duration::from_secs(120))?,
            base_url: base_url.into(),
        })
    }
}

#[async_trait]
impl PoolCreator for HttpPoolCreator {
    fn name(&self) -> &'static str {
        "pool_service"
    }

    async fn create_pool(
        &self,
        asset: &Address,
        quote: Lamports,
        units: AssetUnits,
    ) -> Result<String, MarketError> {
        let asset = asset.to_string();
        let body = CreatePoolRequest {
            asset: &asset,
            quote_amount: quote,
            asset_amount: units,
        };
        let response: PoolResponse = self
            .client
            .post(format!("{}/pools", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| MarketError::external("pool_service", e))?
            .error_for_status()
            .map_err(|e| MarketError::external("pool_service", e))?
            .json()
            .await
            .map_err(|e| MarketError::external("pool_service", e))?;
        Ok(response.pool_id)
    }

    async fn find_pool(&self, asset: &Address) -> Result<Option<String>, MarketError> {
        let response = self
            .client
            .get(format!("{}/pools/{}", self.base_url, asset))
            .send()
            .await
            .map_err(|e| MarketError::external("pool_service", e))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let pool: PoolResponse = response
            .error_for_status()
            .map_err(|e| MarketError::external("pool_service", e))?
            .json()
            .await
            .map_err(|e| MarketError::external("pool_service", e))?;
        Ok(Some(pool.pool_id))
    }
}

// ============================================================================
// Custody service
// ============================================================================

#[derive(Serialize)]
struct ReleaseRequest<'a> {
    asset: &'a str,
    quote_amount: Lamports,
    asset_amount: AssetUnits,
}

pub struct HttpCustodyService {
    client: reqwest::Client,
    base_url: String,
}

impl HttpCustodyService {
    pub fn new(base_url: impl Into<String>) -> Result<Self, MarketError> {
        Ok(Self {
            client: http_client("custody", Duration::from_secs(60))?,
            base_url: base_url.into(),
        })
    }
}

#[async_trait]
impl CustodyService for HttpCustodyService {
    fn name(&self) -> &'static str {
        "custody_service"
    }

    async fn release_reserves(
        &self,
        asset: &Address,
        quote: Lamports,
        units: AssetUnits,
    ) -> Result<ReleaseReceipt, MarketError> {
        let asset = asset.to_string();
        let body = ReleaseRequest {
            asset: &asset,
            quote_amount: quote,
            asset_amount: units,
        };
        let receipt: ReleaseReceipt = self
            .client
            .post(format!("{}/releases", self.base_url))
            // One release per asset, ever
            .header("Idempotency-Key", format!("release-{}", asset))
            .json(&body)
            .send()
            .await
            .map_err(|e| MarketError::external("custody", e))?
            .error_for_status()
            .map_err(|e| MarketError::external("custody", e))?
            .json()
            .await
            .map_err(|e| MarketError::external("custody", e))?;
        info!(asset = %asset, reference = %receipt.reference, "Custody release confirmed");
        Ok(receipt)
    }
}

// ============================================================================
// Announcements
// ============================================================================

pub struct WebhookAnnouncer {
    client: reqwest::Client,
    url: String,
}

impl WebhookAnnouncer {
    pub fn new(url: impl Into<String>) -> Result<Self, MarketError> {
        Ok(Self {
            client: http_client("announcer", Duration::from_secs(10))?,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Announcer for WebhookAnnouncer {
    async fn announce_migration(&self, event: &MigrationEvent) -> Result<(), MarketError> {
        self.client
            .post(&self.url)
            .json(event)
            .send()
            .await
            .map_err(|e| MarketError::external("announcer", e))?
            .error_for_status()
            .map_err(|e| MarketError::external("announcer", e))?;
        Ok(())
    }
}
