//! Simulated Chain
//!
//! Deterministic in-memory stand-in for a wallet provider, the fund-manager
//! contract and the deposit token. Used by the CLI's `--simulate` mode and as
//! the test double for the session layer.
//!
//! Writes are mined instantly into the next block. Failures can be injected
//! per operation, confirmations can be stalled, and every trait call is
//! recorded so tests can assert on ordering.

use super::{
    ChainError, ChainResult, ContractEvent, FundManagerContract, ProviderEvent, Signer,
    TokenContract, TxReceipt, WalletProvider, EVENT_CHANNEL_CAPACITY,
};
use crate::types::{
    Address, BadgeLevel, ChainId, InvestmentCategory, Investment, InvestorStats, LockDuration,
    PerformancePoint, TxHash,
};
use crate::units::BaseUnits;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tokio::sync::{broadcast, Notify};

/// Chain id reported by a fresh simulated chain (local dev network)
pub const SIM_CHAIN_ID: ChainId = ChainId(31337);

/// Simulated clock start (unix seconds)
const GENESIS_TIME: u64 = 1_700_000_000;

const SECONDS_PER_DAY: u64 = 86_400;

/// Execution-reverted code used by nodes for failed `eth_call`/`eth_estimateGas`
const REVERT_CODE: i64 = 3;

/// Operations that can be observed in the call log or made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimOp {
    RequestAccounts,
    GetBalance,
    GetNetwork,
    GetSigner,
    Confirm,
    CreateLockedInvestment,
    Withdraw,
    GetInvestorStats,
    GetInvestorInvestments,
    GetHistoricalPerformance,
    BalanceOf,
    Approve,
}

/// One recorded call against the simulated chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimCall {
    pub op: SimOp,
    pub account: Option<Address>,
    pub amount: Option<BaseUnits>,
}

#[derive(Debug, Default)]
struct Position {
    investments: Vec<Investment>,
    total_invested: BaseUnits,
    realized_profit: BaseUnits,
    fees_paid: BaseUnits,
    investment_count: u64,
}

#[derive(Debug)]
struct SimState {
    installed: bool,
    accounts: Vec<Address>,
    chain_id: ChainId,
    now: u64,
    block_number: u64,
    tx_counter: u64,
    gas_fee: BaseUnits,
    withdrawal_fee_bps: u32,
    native: HashMap<Address, BaseUnits>,
    tokens: HashMap<Address, BaseUnits>,
    allowances: HashMap<(Address, Address), BaseUnits>,
    positions: HashMap<Address, Position>,
    history: Vec<PerformancePoint>,
    peak_tvl: BaseUnits,
    mined: HashMap<TxHash, u64>,
    failures: HashMap<SimOp, ChainError>,
    stalled: bool,
    calls: Vec<SimCall>,
}

impl Default for SimState {
    fn default() -> Self {
        Self {
            installed: true,
            accounts: Vec::new(),
            chain_id: SIM_CHAIN_ID,
            now: GENESIS_TIME,
            block_number: 1,
            tx_counter: 0,
            gas_fee: BaseUnits::new(100_000_000_000_000),
            withdrawal_fee_bps: 0,
            native: HashMap::new(),
            tokens: HashMap::new(),
            allowances: HashMap::new(),
            positions: HashMap::new(),
            history: Vec::new(),
            peak_tvl: BaseUnits::ZERO,
            mined: HashMap::new(),
            failures: HashMap::new(),
            stalled: false,
            calls: Vec::new(),
        }
    }
}

impl SimState {
    fn record(&mut self, op: SimOp, account: Option<&Address>, amount: Option<BaseUnits>) {
        self.calls.push(SimCall {
            op,
            account: account.cloned(),
            amount,
        });
    }

    /// Record the call and consume an injected failure for it, if any
    fn enter(
        &mut self,
        op: SimOp,
        account: Option<&Address>,
        amount: Option<BaseUnits>,
    ) -> ChainResult<()> {
        self.record(op, account, amount);
        match self.failures.remove(&op) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn mine(&mut self) -> TxHash {
        self.tx_counter += 1;
        self.block_number += 1;

        let mut bytes = [0u8; 32];
        bytes[0] = 0x5e;
        bytes[24..].copy_from_slice(&self.tx_counter.to_be_bytes());
        let hash = TxHash::from_bytes(bytes);

        self.mined.insert(hash.clone(), self.block_number);
        hash
    }

    fn charge_gas(&mut self, payer: &Address) -> ChainResult<()> {
        let balance = self.native.get(payer).copied().unwrap_or_default();
        let remaining = balance.checked_sub(self.gas_fee).ok_or(ChainError::Rpc {
            code: -32000,
            message: "insufficient funds for gas".to_string(),
        })?;
        self.native.insert(payer.clone(), remaining);
        Ok(())
    }

    fn tvl(&self) -> BaseUnits {
        self.positions
            .values()
            .flat_map(|p| p.investments.iter())
            .fold(BaseUnits::ZERO, |acc, inv| acc.saturating_add(inv.current_value))
    }

    fn stats(&self, investor: &Address) -> InvestorStats {
        let Some(position) = self.positions.get(investor) else {
            return InvestorStats {
                total_invested: BaseUnits::ZERO,
                current_total: BaseUnits::ZERO,
                unrealized_profit: BaseUnits::ZERO,
                realized_profit: BaseUnits::ZERO,
                total_fee_paid: BaseUnits::ZERO,
                badge_level: BadgeLevel::Bronze,
                investment_count: 0,
            };
        };

        let (current_total, unrealized_profit) = position.investments.iter().fold(
            (BaseUnits::ZERO, BaseUnits::ZERO),
            |(total, profit), inv| {
                (
                    total.saturating_add(inv.current_value),
                    profit.saturating_add(inv.current_value.saturating_sub(inv.amount)),
                )
            },
        );

        InvestorStats {
            total_invested: position.total_invested,
            current_total,
            unrealized_profit,
            realized_profit: position.realized_profit,
            total_fee_paid: position.fees_paid,
            badge_level: badge_for(position.total_invested),
            investment_count: position.investment_count,
        }
    }
}

/// Badge tier for a cumulative invested amount
pub fn badge_for(total_invested: BaseUnits) -> BadgeLevel {
    const THRESHOLDS: [(u64, BadgeLevel); 4] = [
        (100_000, BadgeLevel::Platinum),
        (50_000, BadgeLevel::Diamond),
        (10_000, BadgeLevel::Gold),
        (1_000, BadgeLevel::Silver),
    ];

    THRESHOLDS
        .iter()
        .find(|(min, _)| total_invested >= BaseUnits::from_whole(*min))
        .map(|(_, level)| *level)
        .unwrap_or(BadgeLevel::Bronze)
}

fn revert(reason: &str) -> ChainError {
    ChainError::Rpc {
        code: REVERT_CODE,
        message: format!("execution reverted: {}", reason),
    }
}

struct SimInner {
    state: Mutex<SimState>,
    provider_tx: RwLock<broadcast::Sender<ProviderEvent>>,
    contract_tx: RwLock<broadcast::Sender<ContractEvent>>,
    release: Notify,
}

/// Handle to a simulated chain. Clones share the same chain.
#[derive(Clone)]
pub struct SimulatedChain {
    inner: Arc<SimInner>,
}

impl Default for SimulatedChain {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedChain {
    /// Empty chain with an installed wallet and no accounts
    pub fn new() -> Self {
        let (provider_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (contract_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            inner: Arc::new(SimInner {
                state: Mutex::new(SimState::default()),
                provider_tx: RwLock::new(provider_tx),
                contract_tx: RwLock::new(contract_tx),
                release: Notify::new(),
            }),
        }
    }

    /// Chain with one funded account and 30 days of fund history
    pub fn demo(account: &Address) -> Self {
        let chain = Self::new();
        chain.add_account(account.clone());
        chain.fund_native(account, BaseUnits::from_whole(10));
        chain.fund_tokens(account, BaseUnits::from_whole(50_000));

        let start = GENESIS_TIME - 30 * SECONDS_PER_DAY;
        for day in 0..=30u64 {
            // gentle upward drift with a dip mid-month
            let wobble = if (12..18).contains(&day) { 0 } else { day * 900 };
            chain.push_history(
                start + day * SECONDS_PER_DAY,
                BaseUnits::from_whole(1_000_000 + day * 2_500 + wobble),
            );
        }
        chain
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn send_contract_event(&self, event: ContractEvent) {
        let tx = self.inner.contract_tx.read().unwrap_or_else(|e| e.into_inner());
        // no receivers is fine
        let _ = tx.send(event);
    }

    // ===== Wallet setup =====

    pub fn set_installed(&self, installed: bool) {
        self.state().installed = installed;
    }

    /// Expose an account without notifying listeners
    pub fn add_account(&self, account: Address) {
        let mut state = self.state();
        if !state.accounts.contains(&account) {
            state.accounts.push(account);
        }
    }

    pub fn fund_native(&self, account: &Address, amount: BaseUnits) {
        let mut state = self.state();
        let entry = state.native.entry(account.clone()).or_default();
        *entry = entry.saturating_add(amount);
    }

    pub fn fund_tokens(&self, account: &Address, amount: BaseUnits) {
        let mut state = self.state();
        let entry = state.tokens.entry(account.clone()).or_default();
        *entry = entry.saturating_add(amount);
    }

    pub fn set_gas_fee(&self, fee: BaseUnits) {
        self.state().gas_fee = fee;
    }

    /// Fee taken from every withdrawal, in basis points
    pub fn set_withdrawal_fee_bps(&self, bps: u32) {
        self.state().withdrawal_fee_bps = bps.min(10_000);
    }

    // ===== Chain control =====

    pub fn advance_time(&self, secs: u64) {
        self.state().now += secs;
    }

    pub fn now(&self) -> u64 {
        self.state().now
    }

    pub fn push_history(&self, timestamp: u64, value: BaseUnits) {
        self.state().history.push(PerformancePoint { timestamp, value });
    }

    /// Make the next call of `op` fail with `error`
    pub fn fail_next(&self, op: SimOp, error: ChainError) {
        self.state().failures.insert(op, error);
    }

    /// Hold every confirmation until `release_confirmations`
    pub fn stall_confirmations(&self) {
        self.state().stalled = true;
    }

    pub fn release_confirmations(&self) {
        self.state().stalled = false;
        self.inner.release.notify_waiters();
    }

    /// Set the current value of one of an investor's positions and emit
    /// `InvestmentPerformance`
    pub fn revalue(&self, investor: &Address, index: usize, new_value: BaseUnits) -> bool {
        let event = {
            let mut state = self.state();
            let now = state.now;
            let Some(inv) = state
                .positions
                .get_mut(investor)
                .and_then(|p| p.investments.get_mut(index))
            else {
                return false;
            };

            let previous_value = inv.current_value;
            inv.current_value = new_value;
            ContractEvent::InvestmentPerformance {
                investor: investor.clone(),
                investment_id: index as u64,
                previous_value,
                new_value,
                timestamp: now,
            }
        };

        self.send_contract_event(event);
        true
    }

    // ===== Event injection =====

    /// Deliver a provider notification, updating wallet state to match
    pub fn emit_provider_event(&self, event: ProviderEvent) {
        {
            let mut state = self.state();
            match &event {
                ProviderEvent::AccountsChanged(accounts) => state.accounts = accounts.clone(),
                ProviderEvent::ChainChanged(chain_id) => state.chain_id = *chain_id,
                ProviderEvent::Disconnected => {}
            }
        }

        let tx = self.inner.provider_tx.read().unwrap_or_else(|e| e.into_inner());
        let _ = tx.send(event);
    }

    pub fn emit_contract_event(&self, event: ContractEvent) {
        self.send_contract_event(event);
    }

    // ===== Inspection =====

    pub fn calls(&self) -> Vec<SimCall> {
        self.state().calls.clone()
    }

    /// Ops of recorded calls, in order
    pub fn ops(&self) -> Vec<SimOp> {
        self.state().calls.iter().map(|c| c.op).collect()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    pub fn token_balance(&self, account: &Address) -> BaseUnits {
        self.state().tokens.get(account).copied().unwrap_or_default()
    }

    pub fn native_balance(&self, account: &Address) -> BaseUnits {
        self.state().native.get(account).copied().unwrap_or_default()
    }

    pub fn allowance(&self, owner: &Address, spender: &Address) -> BaseUnits {
        self.state()
            .allowances
            .get(&(owner.clone(), spender.clone()))
            .copied()
            .unwrap_or_default()
    }

    pub fn provider_listener_count(&self) -> usize {
        self.inner
            .provider_tx
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .receiver_count()
    }

    pub fn contract_listener_count(&self) -> usize {
        self.inner
            .contract_tx
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .receiver_count()
    }

    // ===== Contract execution =====

    fn approve_as(
        &self,
        owner: &Address,
        spender: &Address,
        amount: BaseUnits,
    ) -> ChainResult<TxHash> {
        let mut state = self.state();
        state.enter(SimOp::Approve, Some(owner), Some(amount))?;
        state.charge_gas(owner)?;
        state
            .allowances
            .insert((owner.clone(), spender.clone()), amount);
        Ok(state.mine())
    }

    fn invest_as(
        &self,
        investor: &Address,
        fund: &Address,
        amount: BaseUnits,
        lock_duration: LockDuration,
        category: InvestmentCategory,
    ) -> ChainResult<TxHash> {
        let mut events = Vec::new();
        let hash = {
            let mut state = self.state();
            state.enter(SimOp::CreateLockedInvestment, Some(investor), Some(amount))?;

            if amount.is_zero() {
                return Err(revert("amount must be positive"));
            }
            if lock_duration.is_zero() {
                return Err(revert("invalid lock duration"));
            }

            let key = (investor.clone(), fund.clone());
            let allowance = state.allowances.get(&key).copied().unwrap_or_default();
            let remaining_allowance = allowance
                .checked_sub(amount)
                .ok_or_else(|| revert("insufficient allowance"))?;
            let balance = state.tokens.get(investor).copied().unwrap_or_default();
            let remaining_balance = balance
                .checked_sub(amount)
                .ok_or_else(|| revert("transfer amount exceeds balance"))?;

            state.charge_gas(investor)?;
            state.allowances.insert(key, remaining_allowance);
            state.tokens.insert(investor.clone(), remaining_balance);

            let now = state.now;
            let position = state.positions.entry(investor.clone()).or_default();
            let previous_badge = badge_for(position.total_invested);
            position.total_invested = position.total_invested.saturating_add(amount);
            position.investment_count += 1;
            position.investments.push(Investment {
                amount,
                current_value: amount,
                lock_duration,
                start_time: now,
                category,
            });
            let new_badge = badge_for(position.total_invested);

            if new_badge != previous_badge {
                events.push(ContractEvent::BadgeLevelChange {
                    investor: investor.clone(),
                    previous: previous_badge,
                    new: new_badge,
                });
            }

            let tvl = state.tvl();
            if tvl > state.peak_tvl {
                state.peak_tvl = tvl;
                events.push(ContractEvent::NewPeakTvl {
                    timestamp: now,
                    amount: tvl,
                });
            }

            state.mine()
        };

        for event in events {
            self.send_contract_event(event);
        }
        Ok(hash)
    }

    /// Withdraw from unlocked positions, oldest first; principal is paid out
    /// before profit
    fn withdraw_as(&self, investor: &Address, amount: BaseUnits) -> ChainResult<TxHash> {
        let (hash, event) = {
            let mut state = self.state();
            state.enter(SimOp::Withdraw, Some(investor), Some(amount))?;

            if amount.is_zero() {
                return Err(revert("amount must be positive"));
            }

            let now = state.now;
            let available = state
                .positions
                .get(investor)
                .map(|p| {
                    p.investments
                        .iter()
                        .filter(|inv| !inv.is_locked(now))
                        .fold(BaseUnits::ZERO, |acc, inv| acc.saturating_add(inv.current_value))
                })
                .unwrap_or_default();
            if amount > available {
                return Err(revert("insufficient unlocked balance"));
            }

            state.charge_gas(investor)?;

            let fee = BaseUnits::new(amount.raw() / 10_000 * state.withdrawal_fee_bps as u128);
            let position = state.positions.entry(investor.clone()).or_default();
            let mut remaining = amount;
            for inv in position.investments.iter_mut().filter(|inv| !inv.is_locked(now)) {
                if remaining.is_zero() {
                    break;
                }
                let taken = remaining.min(inv.current_value);
                let principal = taken.min(inv.amount);
                position.realized_profit =
                    position.realized_profit.saturating_add(taken.saturating_sub(principal));
                inv.amount = inv.amount.saturating_sub(principal);
                inv.current_value = inv.current_value.saturating_sub(taken);
                remaining = remaining.saturating_sub(taken);
            }
            position.investments.retain(|inv| !inv.current_value.is_zero());
            position.fees_paid = position.fees_paid.saturating_add(fee);

            let payout = amount.saturating_sub(fee);
            let entry = state.tokens.entry(investor.clone()).or_default();
            *entry = entry.saturating_add(payout);

            let hash = state.mine();
            let event = ContractEvent::Withdrawal {
                investor: investor.clone(),
                amount,
                timestamp: now,
                tx_hash: Some(hash.clone()),
            };
            (hash, event)
        };

        self.send_contract_event(event);
        Ok(hash)
    }
}

#[async_trait]
impl WalletProvider for SimulatedChain {
    async fn is_installed(&self) -> bool {
        self.state().installed
    }

    async fn request_accounts(&self) -> ChainResult<Vec<Address>> {
        let mut state = self.state();
        if !state.installed {
            return Err(ChainError::Unavailable);
        }
        state.enter(SimOp::RequestAccounts, None, None)?;
        Ok(state.accounts.clone())
    }

    async fn get_balance(&self, address: &Address) -> ChainResult<BaseUnits> {
        let mut state = self.state();
        state.enter(SimOp::GetBalance, Some(address), None)?;
        Ok(state.native.get(address).copied().unwrap_or_default())
    }

    async fn get_network(&self) -> ChainResult<ChainId> {
        let mut state = self.state();
        state.enter(SimOp::GetNetwork, None, None)?;
        Ok(state.chain_id)
    }

    async fn get_signer(&self) -> ChainResult<Signer> {
        let mut state = self.state();
        state.enter(SimOp::GetSigner, None, None)?;
        state
            .accounts
            .first()
            .cloned()
            .map(Signer::new)
            .ok_or(ChainError::Rpc {
                code: 4100,
                message: "no authorized accounts".to_string(),
            })
    }

    async fn wait_for_confirmation(&self, hash: &TxHash) -> ChainResult<TxReceipt> {
        self.state().enter(SimOp::Confirm, None, None)?;

        loop {
            let released = self.inner.release.notified();
            if !self.state().stalled {
                break;
            }
            released.await;
        }

        let state = self.state();
        state
            .mined
            .get(hash)
            .map(|block| TxReceipt {
                hash: hash.clone(),
                block_number: *block,
            })
            .ok_or_else(|| ChainError::Rpc {
                code: -32000,
                message: format!("unknown transaction {}", hash),
            })
    }

    fn subscribe(&self) -> broadcast::Receiver<ProviderEvent> {
        self.inner
            .provider_tx
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .subscribe()
    }

    fn remove_all_listeners(&self) {
        // Dropping the old sender closes every existing receiver.
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        *self.inner.provider_tx.write().unwrap_or_else(|e| e.into_inner()) = tx;
    }

    fn bind_fund_manager(
        &self,
        signer: &Signer,
        address: &Address,
    ) -> ChainResult<Arc<dyn FundManagerContract>> {
        Ok(Arc::new(SimFundManager {
            chain: self.clone(),
            signer: signer.clone(),
            address: address.clone(),
        }))
    }

    fn bind_token(
        &self,
        signer: &Signer,
        address: &Address,
    ) -> ChainResult<Arc<dyn TokenContract>> {
        Ok(Arc::new(SimToken {
            chain: self.clone(),
            signer: signer.clone(),
            address: address.clone(),
        }))
    }
}

/// Fund-manager handle on a simulated chain
pub struct SimFundManager {
    chain: SimulatedChain,
    signer: Signer,
    address: Address,
}

#[async_trait]
impl FundManagerContract for SimFundManager {
    fn address(&self) -> &Address {
        &self.address
    }

    async fn create_locked_investment(
        &self,
        amount: BaseUnits,
        lock_duration: LockDuration,
        category: InvestmentCategory,
    ) -> ChainResult<TxHash> {
        self.chain.invest_as(
            self.signer.address(),
            &self.address,
            amount,
            lock_duration,
            category,
        )
    }

    async fn withdraw(&self, amount: BaseUnits) -> ChainResult<TxHash> {
        self.chain.withdraw_as(self.signer.address(), amount)
    }

    async fn get_investor_stats(&self, investor: &Address) -> ChainResult<InvestorStats> {
        let mut state = self.chain.state();
        state.enter(SimOp::GetInvestorStats, Some(investor), None)?;
        Ok(state.stats(investor))
    }

    async fn get_investor_investments(&self, investor: &Address) -> ChainResult<Vec<Investment>> {
        let mut state = self.chain.state();
        state.enter(SimOp::GetInvestorInvestments, Some(investor), None)?;
        Ok(state
            .positions
            .get(investor)
            .map(|p| p.investments.clone())
            .unwrap_or_default())
    }

    async fn get_historical_performance(&self, days: u32) -> ChainResult<Vec<PerformancePoint>> {
        let mut state = self.chain.state();
        state.enter(SimOp::GetHistoricalPerformance, None, None)?;
        let since = state.now.saturating_sub(days as u64 * SECONDS_PER_DAY);
        Ok(state
            .history
            .iter()
            .filter(|p| p.timestamp >= since)
            .cloned()
            .collect())
    }

    fn events(&self) -> broadcast::Receiver<ContractEvent> {
        self.chain
            .inner
            .contract_tx
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .subscribe()
    }

    fn remove_all_listeners(&self) {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        *self
            .chain
            .inner
            .contract_tx
            .write()
            .unwrap_or_else(|e| e.into_inner()) = tx;
    }
}

/// Token handle on a simulated chain
pub struct SimToken {
    chain: SimulatedChain,
    signer: Signer,
    address: Address,
}

#[async_trait]
impl TokenContract for SimToken {
    fn address(&self) -> &Address {
        &self.address
    }

    async fn balance_of(&self, owner: &Address) -> ChainResult<BaseUnits> {
        let mut state = self.chain.state();
        state.enter(SimOp::BalanceOf, Some(owner), None)?;
        Ok(state.tokens.get(owner).copied().unwrap_or_default())
    }

    async fn approve(&self, spender: &Address, amount: BaseUnits) -> ChainResult<TxHash> {
        self.chain.approve_as(self.signer.address(), spender, amount)
    }
}
