//! Wallet Session
//!
//! Holds the connected account, chain id, cached balances and investor stats,
//! and the contract session bound to the account's signer. Owns the provider
//! listener and the event bridge, and tears both down on disconnect.
//!
//! Every state change that belongs to a particular connection is tagged with
//! an epoch. Connect, account switch and teardown bump the epoch, so late
//! results from an earlier connection are discarded instead of applied.

use super::contracts::{ContractSession, SessionRefresh};
use super::events::{BridgeTarget, EventBridge, Reaction};
use super::notifications::Notification;
use super::{with_timeout, SessionConfig, SessionError, SessionResult};
use crate::chain::{ProviderEvent, TxReceipt, WalletProvider, EVENT_CHANNEL_CAPACITY};
use crate::ledger::{TransactionKind, TransactionLedger};
use crate::types::{
    Address, BadgeLevel, CategorySummary, ChainId, InvestmentCategory, InvestorStats,
    LockDuration, PerformancePoint, TxHash,
};
use crate::units::BaseUnits;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

/// Snapshot of the session as seen by a front end
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionState {
    pub account: Option<Address>,
    pub chain_id: Option<ChainId>,
    /// Native currency balance
    pub balance: BaseUnits,
    /// Deposit-token balance, when a token is configured
    pub token_balance: Option<BaseUnits>,
    pub stats: Option<InvestorStats>,
    pub badge_level: BadgeLevel,
    pub is_connecting: bool,
    /// Message of the last failed connect attempt
    pub error: Option<String>,
    /// Last balance refresh failed; `balance` is the last known value
    pub balance_stale: bool,
    /// Last stats refresh failed; `stats` is the last known value
    pub stats_stale: bool,
    pub epoch: u64,
}

impl SessionState {
    pub fn is_connected(&self) -> bool {
        self.account.is_some()
    }
}

#[derive(Default)]
struct SessionTasks {
    provider_listener: Option<JoinHandle<()>>,
    bridge: Option<EventBridge>,
    auto_refresh: Option<JoinHandle<()>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Teardown {
    /// Requested by the user or a failed connect
    Explicit,
    /// Triggered from inside the provider listener, which must not abort itself
    FromListener,
}

pub(crate) struct SessionInner {
    provider: Arc<dyn WalletProvider>,
    config: SessionConfig,
    state: RwLock<SessionState>,
    contracts: RwLock<Option<Arc<ContractSession>>>,
    connecting: Mutex<()>,
    ledger: Arc<TransactionLedger>,
    notifications: broadcast::Sender<Notification>,
    tasks: std::sync::Mutex<SessionTasks>,
}

/// The live binding between a wallet and the fund
///
/// Cheap to clone; clones share one session.
#[derive(Clone)]
pub struct WalletSession {
    inner: Arc<SessionInner>,
}

impl WalletSession {
    pub fn new(provider: Arc<dyn WalletProvider>, config: SessionConfig) -> Self {
        let (notifications, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            inner: Arc::new(SessionInner {
                provider,
                config,
                state: RwLock::new(SessionState::default()),
                contracts: RwLock::new(None),
                connecting: Mutex::new(()),
                ledger: Arc::new(TransactionLedger::new()),
                notifications,
                tasks: std::sync::Mutex::new(SessionTasks::default()),
            }),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub async fn snapshot(&self) -> SessionState {
        self.inner.state.read().await.clone()
    }

    pub async fn account(&self) -> Option<Address> {
        self.inner.state.read().await.account.clone()
    }

    pub async fn is_connected(&self) -> bool {
        self.inner.state.read().await.is_connected()
    }

    /// Ledger of transactions initiated in this process
    pub fn ledger(&self) -> Arc<TransactionLedger> {
        self.inner.ledger.clone()
    }

    pub fn notifications(&self) -> broadcast::Receiver<Notification> {
        self.inner.notifications.subscribe()
    }

    pub async fn contracts(&self) -> Option<Arc<ContractSession>> {
        self.inner.contracts.read().await.clone()
    }

    /// Whether contract events are currently being turned into notifications
    pub fn is_following_events(&self) -> bool {
        self.inner
            .lock_tasks()
            .bridge
            .as_ref()
            .is_some_and(EventBridge::is_running)
    }

    async fn require_contracts(&self) -> SessionResult<Arc<ContractSession>> {
        self.contracts()
            .await
            .ok_or(SessionError::ContractsNotInitialized)
    }

    /// Connect to the wallet and bind the fund contracts.
    ///
    /// Replaces any existing connection. On failure the session is left fully
    /// disconnected with `error` set.
    pub async fn connect(&self) -> SessionResult<Address> {
        let _connecting = self
            .inner
            .connecting
            .try_lock()
            .map_err(|_| SessionError::ConnectInProgress)?;

        if self.is_connected().await {
            self.inner.teardown(Teardown::Explicit).await;
        }
        {
            let mut state = self.inner.state.write().await;
            state.is_connecting = true;
            state.error = None;
        }

        tracing::info!("Connecting wallet");
        match self.inner.establish().await {
            Ok(account) => Ok(account),
            Err(e) => {
                tracing::error!(error = %e, "Wallet connection failed");
                self.inner.teardown(Teardown::Explicit).await;
                self.inner.state.write().await.error = Some(e.to_string());
                Err(e)
            }
        }
    }

    /// Tear down the connection. Safe to call when already disconnected.
    pub async fn disconnect(&self) {
        self.inner.teardown(Teardown::Explicit).await;
        tracing::info!("Wallet disconnected");
    }

    /// Re-read the native balance. Failures only mark the balance stale.
    pub async fn refresh_balance(&self) {
        self.inner.load_balance().await;
    }

    /// Re-read investor stats. Failures only mark the stats stale.
    pub async fn refresh_stats(&self) {
        self.inner.load_stats().await;
    }

    pub async fn refresh_token_balance(&self) {
        self.inner.load_token_balance().await;
    }

    /// Refresh balance and stats in the background
    pub fn spawn_refresh(&self) -> JoinHandle<()> {
        self.inner.spawn_refresh()
    }

    /// Periodically refresh balances and stats while connected.
    ///
    /// Stopped by disconnect; call again after reconnecting.
    pub fn start_background_refresh(&self) {
        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.config.refresh_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if !inner.state.read().await.is_connected() {
                    continue;
                }
                tracing::debug!("Background refresh");
                inner.load_balance().await;
                inner.load_stats().await;
                inner.load_token_balance().await;
            }
        });

        let previous = self
            .inner
            .lock_tasks()
            .auto_refresh
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Whether a deposit, withdrawal or approval is running or queued
    pub async fn is_processing(&self) -> bool {
        self.contracts()
            .await
            .map(|c| c.is_processing())
            .unwrap_or(false)
    }

    // ===== Contract operations =====

    pub async fn approve(&self, amount: BaseUnits) -> SessionResult<TxReceipt> {
        self.require_contracts().await?.approve(amount).await
    }

    pub async fn create_locked_investment(
        &self,
        amount: BaseUnits,
        lock_duration: LockDuration,
        category: InvestmentCategory,
    ) -> SessionResult<TxReceipt> {
        self.require_contracts()
            .await?
            .create_locked_investment(amount, lock_duration, category)
            .await
    }

    pub async fn withdraw(&self, amount: BaseUnits) -> SessionResult<TxReceipt> {
        self.require_contracts().await?.withdraw(amount).await
    }

    /// Deposit-token balance of the connected account; zero when disconnected
    pub async fn get_usdt_balance(&self) -> SessionResult<BaseUnits> {
        match self.contracts().await {
            Some(contracts) => contracts.get_token_balance().await,
            None => Ok(BaseUnits::ZERO),
        }
    }

    pub async fn category_breakdown(&self) -> SessionResult<Vec<CategorySummary>> {
        self.require_contracts().await?.category_breakdown().await
    }

    pub async fn historical_performance(
        &self,
        days: Option<u32>,
    ) -> SessionResult<Vec<PerformancePoint>> {
        self.require_contracts()
            .await?
            .historical_performance(days)
            .await
    }
}

impl SessionInner {
    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, SessionTasks> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn establish(self: &Arc<Self>) -> SessionResult<Address> {
        if !self.provider.is_installed().await {
            return Err(SessionError::wallet_not_installed());
        }

        let timeout = self.config.call_timeout;
        let accounts =
            with_timeout("request_accounts", timeout, self.provider.request_accounts()).await?;
        let account = accounts.into_iter().next().ok_or(SessionError::NoAccounts)?;
        let chain_id = with_timeout("get_network", timeout, self.provider.get_network()).await?;
        let balance =
            with_timeout("get_balance", timeout, self.provider.get_balance(&account)).await?;
        let contracts = self.bind_contracts(&account).await?;

        let epoch = {
            let mut state = self.state.write().await;
            state.epoch += 1;
            state.account = Some(account.clone());
            state.chain_id = Some(chain_id);
            state.balance = balance;
            state.is_connecting = false;
            state.error = None;
            state.balance_stale = false;
            state.stats_stale = false;
            state.epoch
        };
        *self.contracts.write().await = Some(contracts.clone());

        self.attach_provider_listener();
        self.attach_bridge(&contracts, epoch);

        tracing::info!(
            account = %account,
            chain_id = %chain_id,
            balance = %balance,
            epoch,
            "Wallet connected"
        );

        self.load_stats().await;
        self.load_token_balance().await;
        Ok(account)
    }

    async fn bind_contracts(
        self: &Arc<Self>,
        account: &Address,
    ) -> SessionResult<Arc<ContractSession>> {
        let signer = with_timeout(
            "get_signer",
            self.config.call_timeout,
            self.provider.get_signer(),
        )
        .await?;
        if signer.address() != account {
            tracing::warn!(
                account = %account,
                signer = %signer.address(),
                "Signer differs from the selected account"
            );
        }

        let fund_manager = self
            .provider
            .bind_fund_manager(&signer, &self.config.fund_manager)?;
        let token = self
            .config
            .token
            .as_ref()
            .map(|address| self.provider.bind_token(&signer, address))
            .transpose()?;

        let refresher: Weak<dyn SessionRefresh> = Arc::downgrade(self) as Weak<dyn SessionRefresh>;
        Ok(Arc::new(ContractSession::new(
            account.clone(),
            fund_manager,
            token,
            self.provider.clone(),
            self.ledger.clone(),
            self.notifications.clone(),
            refresher,
            &self.config,
        )))
    }

    /// Register the provider listener unless one is already running
    fn attach_provider_listener(self: &Arc<Self>) {
        let mut tasks = self.lock_tasks();
        if tasks
            .provider_listener
            .as_ref()
            .map(|t| !t.is_finished())
            .unwrap_or(false)
        {
            return;
        }

        let events = self.provider.subscribe();
        let weak = Arc::downgrade(self);
        tasks.provider_listener = Some(tokio::spawn(listen_provider(weak, events)));
    }

    fn attach_bridge(self: &Arc<Self>, contracts: &ContractSession, epoch: u64) {
        let target: Weak<dyn BridgeTarget> = Arc::downgrade(self) as Weak<dyn BridgeTarget>;
        let bridge = EventBridge::spawn(
            contracts.fund_manager().events(),
            target,
            contracts.account().clone(),
            epoch,
            self.config.performance_alert_threshold,
        );

        let previous = self.lock_tasks().bridge.replace(bridge);
        drop(previous);
    }

    async fn handle_provider_event(self: &Arc<Self>, event: ProviderEvent) {
        match event {
            ProviderEvent::AccountsChanged(accounts) => match accounts.into_iter().next() {
                None => {
                    tracing::info!("Wallet accounts removed");
                    self.teardown(Teardown::FromListener).await;
                }
                Some(next) => {
                    let current = self.state.read().await.account.clone();
                    match current {
                        Some(current) if current != next => self.switch_account(next).await,
                        _ => {}
                    }
                }
            },
            ProviderEvent::ChainChanged(chain_id) => {
                {
                    let mut state = self.state.write().await;
                    if !state.is_connected() {
                        return;
                    }
                    state.chain_id = Some(chain_id);
                }
                tracing::info!(chain_id = %chain_id, "Wallet chain changed");
                self.spawn_refresh();
            }
            ProviderEvent::Disconnected => {
                tracing::info!("Wallet provider disconnected");
                self.teardown(Teardown::FromListener).await;
            }
        }
    }

    /// Adopt a new account: rebind contracts and restart the bridge under a new epoch
    async fn switch_account(self: &Arc<Self>, next: Address) {
        tracing::info!(account = %next, "Wallet account changed");

        let contracts = match self.bind_contracts(&next).await {
            Ok(contracts) => contracts,
            Err(e) => {
                tracing::error!(account = %next, error = %e, "Failed to rebind contracts");
                self.teardown(Teardown::FromListener).await;
                self.state.write().await.error = Some(e.to_string());
                return;
            }
        };

        let epoch = {
            let mut state = self.state.write().await;
            state.epoch += 1;
            state.account = Some(next);
            state.stats = None;
            state.token_balance = None;
            state.badge_level = BadgeLevel::default();
            state.balance_stale = false;
            state.stats_stale = false;
            state.epoch
        };

        let previous_bridge = self.lock_tasks().bridge.take();
        drop(previous_bridge);
        let previous = self.contracts.write().await.replace(contracts.clone());
        if let Some(previous) = previous {
            previous.fund_manager().remove_all_listeners();
        }
        self.attach_bridge(&contracts, epoch);

        self.load_balance().await;
        self.load_stats().await;
        self.load_token_balance().await;
    }

    async fn teardown(&self, source: Teardown) {
        let (bridge, auto_refresh, listener) = {
            let mut tasks = self.lock_tasks();
            (
                tasks.bridge.take(),
                tasks.auto_refresh.take(),
                tasks.provider_listener.take(),
            )
        };

        drop(bridge);
        if let Some(handle) = auto_refresh {
            handle.abort();
        }
        if let Some(handle) = listener {
            // A listener tearing down its own session exits once its channel closes.
            if source == Teardown::Explicit {
                handle.abort();
            }
        }

        let contracts = self.contracts.write().await.take();
        if let Some(contracts) = contracts {
            contracts.fund_manager().remove_all_listeners();
        }
        self.provider.remove_all_listeners();

        let mut state = self.state.write().await;
        let epoch = state.epoch + 1;
        *state = SessionState {
            epoch,
            ..SessionState::default()
        };
    }

    fn spawn_refresh(self: &Arc<Self>) -> JoinHandle<()> {
        let inner = self.clone();
        tokio::spawn(async move {
            inner.load_balance().await;
            inner.load_stats().await;
        })
    }

    async fn load_balance(&self) {
        let (account, epoch) = {
            let state = self.state.read().await;
            match &state.account {
                Some(account) => (account.clone(), state.epoch),
                None => return,
            }
        };

        let result = with_timeout(
            "get_balance",
            self.config.call_timeout,
            self.provider.get_balance(&account),
        )
        .await;

        let mut state = self.state.write().await;
        if state.epoch != epoch {
            return;
        }
        match result {
            Ok(balance) => {
                state.balance = balance;
                state.balance_stale = false;
            }
            Err(e) => {
                tracing::warn!(account = %account, error = %e, "Balance refresh failed");
                state.balance_stale = true;
            }
        }
    }

    /// Contract session bound to the current account, with the epoch it belongs to.
    ///
    /// The epoch is read before the contracts, so a binding replaced by an
    /// account switch shows up as an account mismatch rather than passing
    /// the epoch check.
    async fn current_contracts(&self) -> Option<(u64, Arc<ContractSession>)> {
        let (epoch, account) = {
            let state = self.state.read().await;
            (state.epoch, state.account.clone()?)
        };
        let contracts = self.contracts.read().await.clone()?;
        if contracts.account() != &account {
            tracing::debug!(account = %account, "Contracts not yet rebound; skipping refresh");
            return None;
        }
        Some((epoch, contracts))
    }

    async fn load_stats(&self) {
        let Some((epoch, contracts)) = self.current_contracts().await else {
            return;
        };

        let result = contracts.get_stats().await;

        let mut state = self.state.write().await;
        if state.epoch != epoch {
            return;
        }
        match result {
            Ok(stats) => {
                state.badge_level = stats.badge_level;
                state.stats = Some(stats);
                state.stats_stale = false;
            }
            Err(e) => {
                tracing::warn!(account = %contracts.account(), error = %e, "Stats refresh failed");
                state.stats_stale = true;
            }
        }
    }

    async fn load_token_balance(&self) {
        let Some((epoch, contracts)) = self.current_contracts().await else {
            return;
        };
        if contracts.token().is_none() {
            return;
        }

        match contracts.get_token_balance().await {
            Ok(balance) => {
                let mut state = self.state.write().await;
                if state.epoch == epoch {
                    state.token_balance = Some(balance);
                }
            }
            Err(e) => {
                tracing::warn!(
                    account = %contracts.account(),
                    error = %e,
                    "Token balance refresh failed"
                );
            }
        }
    }

    /// Ledger a withdrawal seen on-chain unless this session already tracks it
    async fn record_external_withdrawal(&self, amount: BaseUnits, tx_hash: Option<TxHash>) {
        if let Some(hash) = &tx_hash {
            if self.ledger.find_by_hash(hash).await.is_some() {
                return;
            }
        }
        if self.ledger.has_pending(TransactionKind::Withdraw, amount).await {
            tracing::debug!(amount = %amount, "Withdrawal event matches a pending withdrawal");
            return;
        }

        let id = self
            .ledger
            .record_completed(TransactionKind::Withdraw, amount, tx_hash)
            .await;
        tracing::info!(tx_id = %id, amount = %amount, "External withdrawal recorded");
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        let tasks = self.tasks.get_mut().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = tasks.provider_listener.take() {
            handle.abort();
        }
        if let Some(handle) = tasks.auto_refresh.take() {
            handle.abort();
        }
    }
}

async fn listen_provider(
    session: Weak<SessionInner>,
    mut events: broadcast::Receiver<ProviderEvent>,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(missed)) => {
                tracing::warn!(missed, "Provider listener lagged");
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        let Some(inner) = session.upgrade() else {
            break;
        };
        tracing::debug!(event = ?event, "Provider event");
        inner.handle_provider_event(event).await;
    }
}

#[async_trait]
impl SessionRefresh for SessionInner {
    async fn refresh_balance(&self) {
        self.load_balance().await;
    }

    async fn refresh_stats(&self) {
        self.load_stats().await;
    }
}

#[async_trait]
impl BridgeTarget for SessionInner {
    async fn epoch(&self) -> u64 {
        self.state.read().await.epoch
    }

    async fn apply(&self, epoch: u64, reaction: Reaction) {
        if self.state.read().await.epoch != epoch {
            return;
        }

        match reaction {
            Reaction::RefreshStats => self.load_stats().await,
            Reaction::RefreshBalance => self.load_balance().await,
            Reaction::RecordWithdrawal { amount, tx_hash } => {
                self.record_external_withdrawal(amount, tx_hash).await
            }
            Reaction::Notify(notification) => {
                let _ = self.notifications.send(notification);
            }
        }
    }
}
