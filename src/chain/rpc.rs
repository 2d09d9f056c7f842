//! Ethereum JSON-RPC Backend
//!
//! Implements the wallet and contract traits against a JSON-RPC node over
//! HTTP. Transactions are submitted with `eth_sendTransaction`, so signing is
//! left to the node or the wallet behind it.
//!
//! Push notifications are emulated by polling: `eth_accounts`/`eth_chainId`
//! for provider events and `eth_getLogs` for contract events. Pollers start
//! on the first subscription and stop on `remove_all_listeners` or drop.

use super::{
    abi, ChainError, ChainResult, ContractEvent, FundManagerContract, ProviderEvent, Signer,
    TokenContract, TxReceipt, WalletProvider, EVENT_CHANNEL_CAPACITY,
};
use crate::types::{
    Address, ChainId, InvestmentCategory, Investment, InvestorStats, LockDuration,
    PerformancePoint, TxHash,
};
use crate::units::BaseUnits;
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// EIP-1193 "user rejected request"
const USER_REJECTED_CODE: i64 = 4001;

/// JSON-RPC "method not found"
const METHOD_NOT_FOUND_CODE: i64 = -32601;

/// Configuration for the JSON-RPC backend
#[derive(Debug, Clone)]
pub struct RpcConfig {
    /// Node endpoint (e.g., "http://localhost:8545")
    pub url: String,
    /// Per-request HTTP timeout in milliseconds
    pub request_timeout_ms: u64,
    /// Interval for receipt, log and account polling in milliseconds
    pub poll_interval_ms: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8545".to_string(),
            request_timeout_ms: 10_000,
            poll_interval_ms: 2_000,
        }
    }
}

impl RpcConfig {
    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(10))
    }
}

// ============================================
// Transport
// ============================================

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    #[serde(default)]
    message: String,
}

/// Minimal JSON-RPC 2.0 client
struct RpcClient {
    client: Client,
    url: String,
    next_id: AtomicU64,
}

impl RpcClient {
    fn new(config: &RpcConfig) -> ChainResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| ChainError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            url: config.url.clone(),
            next_id: AtomicU64::new(1),
        })
    }

    async fn request<T: DeserializeOwned>(&self, method: &str, params: Value) -> ChainResult<T> {
        let body = RpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };

        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(map_transport_error)?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(ChainError::Transport(format!("HTTP {}: {}", status.as_u16(), text)));
        }

        let envelope: RpcResponse = response.json().await.map_err(map_transport_error)?;
        if let Some(error) = envelope.error {
            return Err(map_rpc_error(error.code, error.message));
        }

        serde_json::from_value(envelope.result.unwrap_or(Value::Null))
            .map_err(|e| ChainError::Decode(format!("{}: {}", method, e)))
    }
}

fn map_transport_error(e: reqwest::Error) -> ChainError {
    if e.is_timeout() {
        ChainError::Timeout
    } else if e.is_connect() {
        ChainError::Unavailable
    } else if e.is_decode() {
        ChainError::Decode(e.to_string())
    } else {
        ChainError::Transport(e.to_string())
    }
}

fn map_rpc_error(code: i64, message: String) -> ChainError {
    if code == USER_REJECTED_CODE {
        ChainError::UserRejected
    } else {
        ChainError::Rpc { code, message }
    }
}

/// Parse a hex quantity such as "0x1bc16d674ec80000"
fn parse_quantity(value: &str) -> ChainResult<u128> {
    let digits = value.trim().trim_start_matches("0x");
    if digits.is_empty() {
        return Ok(0);
    }
    u128::from_str_radix(digits, 16)
        .map_err(|_| ChainError::Decode(format!("invalid quantity {}", value)))
}

fn quantity(value: u64) -> String {
    format!("0x{:x}", value)
}

fn parse_addresses(raw: Vec<String>) -> ChainResult<Vec<Address>> {
    raw.iter()
        .map(|s| Address::parse(s).map_err(|e| ChainError::Decode(e.to_string())))
        .collect()
}

fn parse_tx_hash(raw: &str) -> ChainResult<TxHash> {
    TxHash::parse(raw).map_err(|e| ChainError::Decode(e.to_string()))
}

// ============================================
// Polled event streams
// ============================================

/// Broadcast channel fed by a lazily started polling task
struct PolledStream<E> {
    tx: RwLock<broadcast::Sender<E>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<E: Clone + Send + 'static> PolledStream<E> {
    fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            tx: RwLock::new(tx),
            task: Mutex::new(None),
        }
    }

    /// Subscribe, starting the poller with `spawn` if it is not running
    fn subscribe_with<F>(&self, spawn: F) -> broadcast::Receiver<E>
    where
        F: FnOnce(broadcast::Sender<E>) -> JoinHandle<()>,
    {
        let tx = self.tx.read().unwrap_or_else(|e| e.into_inner()).clone();
        let rx = tx.subscribe();

        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        let running = task.as_ref().map(|t| !t.is_finished()).unwrap_or(false);
        if !running {
            if tokio::runtime::Handle::try_current().is_ok() {
                *task = Some(spawn(tx));
            } else {
                tracing::warn!("No async runtime; event polling not started");
            }
        }
        rx
    }

    /// Stop the poller and close every receiver
    fn reset(&self) {
        if let Some(task) = self.task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            task.abort();
        }
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        *self.tx.write().unwrap_or_else(|e| e.into_inner()) = tx;
    }
}

impl<E> Drop for PolledStream<E> {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            task.abort();
        }
    }
}

// ============================================
// Wallet provider
// ============================================

struct WalletInner {
    rpc: Arc<RpcClient>,
    config: RpcConfig,
    provider_events: PolledStream<ProviderEvent>,
}

/// Wallet provider backed by a JSON-RPC node
#[derive(Clone)]
pub struct JsonRpcWallet {
    inner: Arc<WalletInner>,
}

impl JsonRpcWallet {
    pub fn new(config: RpcConfig) -> ChainResult<Self> {
        let rpc = Arc::new(RpcClient::new(&config)?);
        Ok(Self {
            inner: Arc::new(WalletInner {
                rpc,
                config,
                provider_events: PolledStream::new(),
            }),
        })
    }

    pub fn config(&self) -> &RpcConfig {
        &self.inner.config
    }

    async fn accounts(&self) -> ChainResult<Vec<Address>> {
        let raw: Vec<String> = self.inner.rpc.request("eth_accounts", json!([])).await?;
        parse_addresses(raw)
    }
}

/// Poll accounts and chain id, emitting changes.
///
/// The first successful poll only records a baseline. A failed poll after a
/// successful one is reported as a disconnect.
async fn watch_provider(
    rpc: Arc<RpcClient>,
    interval: Duration,
    tx: broadcast::Sender<ProviderEvent>,
) {
    let mut ticker = tokio::time::interval(interval);
    let mut last: Option<(Vec<Address>, ChainId)> = None;

    loop {
        ticker.tick().await;

        let snapshot = async {
            let raw: Vec<String> = rpc.request("eth_accounts", json!([])).await?;
            let accounts = parse_addresses(raw)?;
            let chain: String = rpc.request("eth_chainId", json!([])).await?;
            let chain = ChainId::from_hex(&chain).map_err(|e| ChainError::Decode(e.to_string()))?;
            Ok::<_, ChainError>((accounts, chain))
        }
        .await;

        match (snapshot, last.take()) {
            (Ok((accounts, chain)), Some((prev_accounts, prev_chain))) => {
                if accounts != prev_accounts {
                    let _ = tx.send(ProviderEvent::AccountsChanged(accounts.clone()));
                }
                if chain != prev_chain {
                    let _ = tx.send(ProviderEvent::ChainChanged(chain));
                }
                last = Some((accounts, chain));
            }
            (Ok(current), None) => last = Some(current),
            (Err(e), Some(_)) => {
                tracing::warn!(error = %e, "Provider poll failed; reporting disconnect");
                let _ = tx.send(ProviderEvent::Disconnected);
            }
            (Err(e), None) => {
                tracing::debug!(error = %e, "Provider poll failed");
            }
        }
    }
}

#[async_trait]
impl WalletProvider for JsonRpcWallet {
    async fn is_installed(&self) -> bool {
        match self
            .inner
            .rpc
            .request::<String>("web3_clientVersion", json!([]))
            .await
        {
            Ok(version) => {
                tracing::debug!(client = %version, "Wallet provider detected");
                true
            }
            Err(e) => {
                tracing::debug!(error = %e, "Wallet provider not reachable");
                false
            }
        }
    }

    async fn request_accounts(&self) -> ChainResult<Vec<Address>> {
        match self
            .inner
            .rpc
            .request::<Vec<String>>("eth_requestAccounts", json!([]))
            .await
        {
            Ok(raw) => parse_addresses(raw),
            Err(ChainError::Rpc { code, .. }) if code == METHOD_NOT_FOUND_CODE => {
                self.accounts().await
            }
            Err(e) => Err(e),
        }
    }

    async fn get_balance(&self, address: &Address) -> ChainResult<BaseUnits> {
        let raw: String = self
            .inner
            .rpc
            .request("eth_getBalance", json!([address.as_str(), "latest"]))
            .await?;
        parse_quantity(&raw).map(BaseUnits::new)
    }

    async fn get_network(&self) -> ChainResult<ChainId> {
        let raw: String = self.inner.rpc.request("eth_chainId", json!([])).await?;
        ChainId::from_hex(&raw).map_err(|e| ChainError::Decode(e.to_string()))
    }

    async fn get_signer(&self) -> ChainResult<Signer> {
        self.accounts()
            .await?
            .into_iter()
            .next()
            .map(Signer::new)
            .ok_or(ChainError::Rpc {
                code: 4100,
                message: "no authorized accounts".to_string(),
            })
    }

    async fn wait_for_confirmation(&self, hash: &TxHash) -> ChainResult<TxReceipt> {
        let mut ticker = tokio::time::interval(self.inner.config.poll_interval());

        loop {
            ticker.tick().await;

            let receipt: Option<ReceiptDto> = self
                .inner
                .rpc
                .request("eth_getTransactionReceipt", json!([hash.as_str()]))
                .await?;

            let Some(receipt) = receipt else {
                continue;
            };
            let Some(block) = receipt.block_number.as_deref() else {
                continue;
            };

            if receipt.status.as_deref() == Some("0x0") {
                return Err(ChainError::Reverted { hash: hash.clone() });
            }

            let block_number = u64::try_from(parse_quantity(block)?)
                .map_err(|_| ChainError::Decode(format!("block number {}", block)))?;
            return Ok(TxReceipt {
                hash: hash.clone(),
                block_number,
            });
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<ProviderEvent> {
        let rpc = self.inner.rpc.clone();
        let interval = self.inner.config.poll_interval();
        self.inner
            .provider_events
            .subscribe_with(|tx| tokio::spawn(watch_provider(rpc, interval, tx)))
    }

    fn remove_all_listeners(&self) {
        self.inner.provider_events.reset();
    }

    fn bind_fund_manager(
        &self,
        signer: &Signer,
        address: &Address,
    ) -> ChainResult<Arc<dyn FundManagerContract>> {
        Ok(Arc::new(RpcFundManager {
            handle: ContractHandle::new(self, signer, address),
            events: PolledStream::new(),
            poll_interval: self.inner.config.poll_interval(),
        }))
    }

    fn bind_token(
        &self,
        signer: &Signer,
        address: &Address,
    ) -> ChainResult<Arc<dyn TokenContract>> {
        Ok(Arc::new(RpcToken {
            handle: ContractHandle::new(self, signer, address),
        }))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReceiptDto {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    block_number: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LogDto {
    topics: Vec<String>,
    data: String,
    #[serde(default)]
    transaction_hash: Option<String>,
    #[serde(default)]
    removed: bool,
}

// ============================================
// Contract handles
// ============================================

/// A contract address bound to a sending account
struct ContractHandle {
    rpc: Arc<RpcClient>,
    from: Signer,
    address: Address,
}

impl ContractHandle {
    fn new(wallet: &JsonRpcWallet, signer: &Signer, address: &Address) -> Self {
        Self {
            rpc: wallet.inner.rpc.clone(),
            from: signer.clone(),
            address: address.clone(),
        }
    }

    async fn call(&self, data: String) -> ChainResult<String> {
        self.rpc
            .request(
                "eth_call",
                json!([
                    {
                        "from": self.from.address().as_str(),
                        "to": self.address.as_str(),
                        "data": data,
                    },
                    "latest"
                ]),
            )
            .await
    }

    async fn send(&self, data: String) -> ChainResult<TxHash> {
        let raw: String = self
            .rpc
            .request(
                "eth_sendTransaction",
                json!([{
                    "from": self.from.address().as_str(),
                    "to": self.address.as_str(),
                    "data": data,
                }]),
            )
            .await?;
        parse_tx_hash(&raw)
    }
}

/// Fund-manager contract over JSON-RPC
pub struct RpcFundManager {
    handle: ContractHandle,
    events: PolledStream<ContractEvent>,
    poll_interval: Duration,
}

/// Poll `eth_getLogs` for fund events from the block after the one current
/// at start-up
async fn watch_logs(
    rpc: Arc<RpcClient>,
    address: Address,
    interval: Duration,
    tx: broadcast::Sender<ContractEvent>,
) {
    let mut ticker = tokio::time::interval(interval);
    let mut next_block: Option<u64> = None;

    loop {
        ticker.tick().await;

        let latest = match rpc.request::<String>("eth_blockNumber", json!([])).await {
            Ok(raw) => match parse_quantity(&raw).ok().and_then(|n| u64::try_from(n).ok()) {
                Some(n) => n,
                None => continue,
            },
            Err(e) => {
                tracing::warn!(error = %e, "Block number poll failed");
                continue;
            }
        };

        let from = match next_block {
            Some(from) => from,
            None => {
                next_block = Some(latest + 1);
                continue;
            }
        };
        if latest < from {
            continue;
        }

        let filter = json!([{
            "address": address.as_str(),
            "fromBlock": quantity(from),
            "toBlock": quantity(latest),
            "topics": [abi::topic::ALL],
        }]);

        let logs: Vec<LogDto> = match rpc.request("eth_getLogs", filter).await {
            Ok(logs) => logs,
            Err(e) => {
                tracing::warn!(error = %e, from, latest, "Log poll failed");
                continue;
            }
        };

        for log in logs.into_iter().filter(|l| !l.removed) {
            let hash = log.transaction_hash.as_deref().and_then(|h| TxHash::parse(h).ok());
            match abi::decode_log(&log.topics, &log.data, hash) {
                Ok(Some(event)) => {
                    tracing::debug!(event = event.name(), "Contract event");
                    let _ = tx.send(event);
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(error = %e, "Skipping undecodable log"),
            }
        }

        next_block = Some(latest + 1);
    }
}

#[async_trait]
impl FundManagerContract for RpcFundManager {
    fn address(&self) -> &Address {
        &self.handle.address
    }

    async fn create_locked_investment(
        &self,
        amount: BaseUnits,
        lock_duration: LockDuration,
        category: InvestmentCategory,
    ) -> ChainResult<TxHash> {
        self.handle
            .send(abi::create_locked_investment_call(amount, lock_duration, category))
            .await
    }

    async fn withdraw(&self, amount: BaseUnits) -> ChainResult<TxHash> {
        self.handle.send(abi::withdraw_call(amount)).await
    }

    async fn get_investor_stats(&self, investor: &Address) -> ChainResult<InvestorStats> {
        let data = self.handle.call(abi::investor_stats_call(investor)).await?;
        abi::decode_investor_stats(&data)
    }

    async fn get_investor_investments(&self, investor: &Address) -> ChainResult<Vec<Investment>> {
        let data = self.handle.call(abi::investor_investments_call(investor)).await?;
        abi::decode_investments(&data)
    }

    async fn get_historical_performance(&self, days: u32) -> ChainResult<Vec<PerformancePoint>> {
        let data = self.handle.call(abi::historical_performance_call(days)).await?;
        abi::decode_performance(&data)
    }

    fn events(&self) -> broadcast::Receiver<ContractEvent> {
        let rpc = self.handle.rpc.clone();
        let address = self.handle.address.clone();
        let interval = self.poll_interval;
        self.events
            .subscribe_with(|tx| tokio::spawn(watch_logs(rpc, address, interval, tx)))
    }

    fn remove_all_listeners(&self) {
        self.events.reset();
    }
}

/// Deposit token over JSON-RPC
pub struct RpcToken {
    handle: ContractHandle,
}

#[async_trait]
impl TokenContract for RpcToken {
    fn address(&self) -> &Address {
        &self.handle.address
    }

    async fn balance_of(&self, owner: &Address) -> ChainResult<BaseUnits> {
        let data = self.handle.call(abi::balance_of_call(owner)).await?;
        abi::decode_units(&data)
    }

    async fn approve(&self, spender: &Address, amount: BaseUnits) -> ChainResult<TxHash> {
        self.handle.send(abi::approve_call(spender, amount)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RpcConfig::default();
        assert_eq!(config.url, "http://localhost:8545");
        assert_eq!(config.poll_interval(), Duration::from_millis(2_000));
    }

    #[test]
    fn test_error_mapping() {
        assert_eq!(map_rpc_error(4001, "denied".into()), ChainError::UserRejected);
        assert_eq!(
            map_rpc_error(-32000, "insufficient funds".into()),
            ChainError::Rpc {
                code: -32000,
                message: "insufficient funds".into()
            }
        );
    }

    #[test]
    fn test_quantities() {
        assert_eq!(parse_quantity("0x0").unwrap(), 0);
        assert_eq!(parse_quantity("0x").unwrap(), 0);
        assert_eq!(parse_quantity("0xde0b6b3a7640000").unwrap(), 1_000_000_000_000_000_000);
        assert!(parse_quantity("0xzz").is_err());
        assert_eq!(quantity(255), "0xff");
    }

    #[test]
    fn test_request_envelope() {
        let body = RpcRequest {
            jsonrpc: "2.0",
            id: 7,
            method: "eth_chainId",
            params: json!([]),
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["jsonrpc"], "2.0");
        assert_eq!(value["id"], 7);
        assert_eq!(value["method"], "eth_chainId");
    }

    #[test]
    fn test_response_parsing() {
        let ok: RpcResponse =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":1,"result":"0x1"}"#).unwrap();
        assert_eq!(ok.result, Some(json!("0x1")));
        assert!(ok.error.is_none());

        let err: RpcResponse = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":1,"error":{"code":4001,"message":"User rejected"}}"#,
        )
        .unwrap();
        assert_eq!(err.error.unwrap().code, 4001);

        let log: LogDto = serde_json::from_str(
            r#"{"topics":["0x01"],"data":"0x","transactionHash":null,"logIndex":"0x0"}"#,
        )
        .unwrap();
        assert!(!log.removed);
        assert!(log.transaction_hash.is_none());
    }

    #[tokio::test]
    async fn test_unreachable_node_is_not_installed() {
        let wallet = JsonRpcWallet::new(RpcConfig {
            url: "http://127.0.0.1:9".to_string(),
            request_timeout_ms: 500,
            poll_interval_ms: 50,
        })
        .unwrap();

        assert!(!wallet.is_installed().await);
        assert!(wallet.get_network().await.is_err());
    }

    #[tokio::test]
    async fn test_remove_all_listeners_closes_subscription() {
        let wallet = JsonRpcWallet::new(RpcConfig {
            url: "http://127.0.0.1:9".to_string(),
            request_timeout_ms: 200,
            poll_interval_ms: 50,
        })
        .unwrap();

        let mut rx = wallet.subscribe();
        wallet.remove_all_listeners();
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
    }
}
