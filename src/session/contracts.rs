//! Contract Session
//!
//! Fund-manager and token handles bound to the connected signer, plus the
//! tracked financial operations built on them. Each deposit or withdrawal is
//! written to the ledger as pending before anything is submitted and settles
//! to completed or failed exactly once.

use super::notifications::Notification;
use super::{with_timeout, SessionConfig, SessionError, SessionResult};
use crate::chain::{FundManagerContract, TokenContract, TxReceipt, WalletProvider};
use crate::ledger::{
    DepositMetadata, StatusUpdate, TransactionId, TransactionKind, TransactionLedger,
};
use crate::types::{
    summarize_by_category, Address, CategorySummary, InvestmentCategory, Investment,
    InvestorStats, LockDuration, PerformancePoint, TxHash,
};
use crate::units::BaseUnits;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};

/// Refresh hooks the contract session calls after a settled operation
#[async_trait]
pub(crate) trait SessionRefresh: Send + Sync {
    async fn refresh_balance(&self);
    async fn refresh_stats(&self);
}

/// Decrements the in-flight counter when dropped
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct ContractSession {
    account: Address,
    fund_manager: Arc<dyn FundManagerContract>,
    token: Option<Arc<dyn TokenContract>>,
    provider: Arc<dyn WalletProvider>,
    ledger: Arc<TransactionLedger>,
    notifications: broadcast::Sender<Notification>,
    refresher: Weak<dyn SessionRefresh>,
    call_timeout: Duration,
    confirmation_timeout: Duration,
    history_days: u32,
    /// Serializes state-mutating calls
    write_lock: Mutex<()>,
    in_flight: AtomicUsize,
}

impl ContractSession {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        account: Address,
        fund_manager: Arc<dyn FundManagerContract>,
        token: Option<Arc<dyn TokenContract>>,
        provider: Arc<dyn WalletProvider>,
        ledger: Arc<TransactionLedger>,
        notifications: broadcast::Sender<Notification>,
        refresher: Weak<dyn SessionRefresh>,
        config: &SessionConfig,
    ) -> Self {
        Self {
            account,
            fund_manager,
            token,
            provider,
            ledger,
            notifications,
            refresher,
            call_timeout: config.call_timeout,
            confirmation_timeout: config.confirmation_timeout,
            history_days: config.history_days,
            write_lock: Mutex::new(()),
            in_flight: AtomicUsize::new(0),
        }
    }

    /// Account the handles are bound to
    pub fn account(&self) -> &Address {
        &self.account
    }

    pub fn fund_manager(&self) -> &Arc<dyn FundManagerContract> {
        &self.fund_manager
    }

    pub fn token(&self) -> Option<&Arc<dyn TokenContract>> {
        self.token.as_ref()
    }

    /// Whether a financial operation is running or queued
    pub fn is_processing(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst) > 0
    }

    // ===== Write operations =====

    /// Approve the fund manager to spend `amount` tokens and wait for confirmation
    pub async fn approve(&self, amount: BaseUnits) -> SessionResult<TxReceipt> {
        if amount.is_zero() {
            return Err(SessionError::InvalidAmount(amount.to_string()));
        }
        let token = self.token.as_ref().ok_or(SessionError::TokenNotConfigured)?;

        let _busy = InFlight::enter(&self.in_flight);
        let _guard = self.write_lock.lock().await;
        self.approve_locked(token, amount).await
    }

    async fn approve_locked(
        &self,
        token: &Arc<dyn TokenContract>,
        amount: BaseUnits,
    ) -> SessionResult<TxReceipt> {
        let spender = self.fund_manager.address();
        let hash =
            with_timeout("approve", self.call_timeout, token.approve(spender, amount)).await?;
        tracing::debug!(tx = %hash, amount = %amount, "Approval submitted");
        self.confirm(&hash).await
    }

    /// Approve then lock `amount` into the fund, tracked in the ledger
    pub async fn create_locked_investment(
        &self,
        amount: BaseUnits,
        lock_duration: LockDuration,
        category: InvestmentCategory,
    ) -> SessionResult<TxReceipt> {
        if amount.is_zero() {
            return Err(SessionError::InvalidAmount(amount.to_string()));
        }
        if lock_duration.is_zero() {
            return Err(SessionError::InvalidLockDuration);
        }
        let token = self.token.as_ref().ok_or(SessionError::TokenNotConfigured)?;

        let _busy = InFlight::enter(&self.in_flight);
        let _guard = self.write_lock.lock().await;

        let metadata = DepositMetadata {
            category,
            lock_duration,
        };
        let id = self
            .ledger
            .add(TransactionKind::Deposit, amount, Some(metadata))
            .await;
        tracing::info!(
            tx_id = %id,
            amount = %amount,
            lock = %lock_duration,
            category = %category,
            "Deposit started"
        );

        let result = async {
            self.approve_locked(token, amount).await?;
            let hash = with_timeout(
                "create_locked_investment",
                self.call_timeout,
                self.fund_manager
                    .create_locked_investment(amount, lock_duration, category),
            )
            .await?;
            self.confirm(&hash).await
        }
        .await;

        self.settle(id, TransactionKind::Deposit, amount, result).await
    }

    /// Withdraw `amount` from the fund, tracked in the ledger
    pub async fn withdraw(&self, amount: BaseUnits) -> SessionResult<TxReceipt> {
        if amount.is_zero() {
            return Err(SessionError::InvalidAmount(amount.to_string()));
        }

        let _busy = InFlight::enter(&self.in_flight);
        let _guard = self.write_lock.lock().await;

        let id = self.ledger.add(TransactionKind::Withdraw, amount, None).await;
        tracing::info!(tx_id = %id, amount = %amount, "Withdrawal started");

        let result = async {
            let hash = with_timeout(
                "withdraw",
                self.call_timeout,
                self.fund_manager.withdraw(amount),
            )
            .await?;
            self.confirm(&hash).await
        }
        .await;

        self.settle(id, TransactionKind::Withdraw, amount, result).await
    }

    async fn confirm(&self, hash: &TxHash) -> SessionResult<TxReceipt> {
        with_timeout(
            "confirmation",
            self.confirmation_timeout,
            self.provider.wait_for_confirmation(hash),
        )
        .await
    }

    /// Record the outcome of a tracked operation, notify, and refresh on success
    async fn settle(
        &self,
        id: TransactionId,
        kind: TransactionKind,
        amount: BaseUnits,
        result: SessionResult<TxReceipt>,
    ) -> SessionResult<TxReceipt> {
        match result {
            Ok(receipt) => {
                self.ledger
                    .update_status(&id, StatusUpdate::completed(receipt.hash.clone()))
                    .await;
                tracing::info!(
                    tx_id = %id,
                    tx = %receipt.hash,
                    block = receipt.block_number,
                    "{} confirmed",
                    kind
                );
                let _ = self.notifications.send(Notification::TransactionCompleted {
                    id,
                    kind,
                    amount,
                    hash: receipt.hash.clone(),
                });

                if let Some(refresher) = self.refresher.upgrade() {
                    refresher.refresh_stats().await;
                    refresher.refresh_balance().await;
                }
                Ok(receipt)
            }
            Err(e) => {
                tracing::error!(tx_id = %id, error = %e, "{} failed", kind);
                self.ledger
                    .update_status(&id, StatusUpdate::failed(e.to_string()))
                    .await;
                let _ = self.notifications.send(Notification::TransactionFailed {
                    id,
                    kind,
                    amount,
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    // ===== Reads =====

    /// Deposit-token balance of the connected account
    pub async fn get_token_balance(&self) -> SessionResult<BaseUnits> {
        let token = self.token.as_ref().ok_or(SessionError::TokenNotConfigured)?;
        with_timeout("balance_of", self.call_timeout, token.balance_of(&self.account)).await
    }

    pub async fn get_stats(&self) -> SessionResult<InvestorStats> {
        with_timeout(
            "get_investor_stats",
            self.call_timeout,
            self.fund_manager.get_investor_stats(&self.account),
        )
        .await
    }

    pub async fn get_investments(&self) -> SessionResult<Vec<Investment>> {
        with_timeout(
            "get_investor_investments",
            self.call_timeout,
            self.fund_manager.get_investor_investments(&self.account),
        )
        .await
    }

    /// Per-category value and change for the connected account
    pub async fn category_breakdown(&self) -> SessionResult<Vec<CategorySummary>> {
        let investments = self.get_investments().await?;
        Ok(summarize_by_category(&investments))
    }

    /// Fund value history; `None` uses the configured window
    pub async fn historical_performance(
        &self,
        days: Option<u32>,
    ) -> SessionResult<Vec<PerformancePoint>> {
        let days = days.unwrap_or(self.history_days);
        with_timeout(
            "get_historical_performance",
            self.call_timeout,
            self.fund_manager.get_historical_performance(days),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::super::WalletSession;
    use super::*;
    use crate::chain::{ChainError, SimOp};
    use crate::ledger::TransactionStatus;

    async fn connected() -> (crate::chain::SimulatedChain, WalletSession, Arc<ContractSession>) {
        let (chain, session) = setup();
        session.connect().await.unwrap();
        let contracts = session.contracts().await.unwrap();
        chain.clear_calls();
        (chain, session, contracts)
    }

    #[tokio::test]
    async fn test_deposit_approves_then_invests_and_refreshes() {
        let (chain, session, contracts) = connected().await;
        let balance_before = session.snapshot().await.balance;

        let receipt = contracts
            .create_locked_investment(
                BaseUnits::from_whole(100),
                LockDuration::from_secs(2_592_000),
                InvestmentCategory::from_code(0).unwrap(),
            )
            .await
            .unwrap();

        let ops = chain.ops();
        let approve = ops.iter().position(|op| *op == SimOp::Approve).unwrap();
        let invest = ops
            .iter()
            .position(|op| *op == SimOp::CreateLockedInvestment)
            .unwrap();
        assert!(approve < invest);
        let after: Vec<_> = ops[invest..].to_vec();
        assert!(after.contains(&SimOp::GetInvestorStats));
        assert!(after.contains(&SimOp::GetBalance));

        let ledger = session.ledger().list().await;
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger[0].kind, TransactionKind::Deposit);
        assert_eq!(ledger[0].status, TransactionStatus::Completed);
        assert_eq!(ledger[0].hash, Some(receipt.hash));
        assert_eq!(ledger[0].category, Some(InvestmentCategory::Crypto));

        let state = session.snapshot().await;
        let stats = state.stats.unwrap();
        assert_eq!(stats.total_invested, BaseUnits::from_whole(100));
        assert_eq!(stats.investment_count, 1);
        assert!(state.balance < balance_before);
        assert!(!contracts.is_processing());
    }

    #[tokio::test]
    async fn test_rejected_deposit_fails_one_entry() {
        let (chain, session, contracts) = connected().await;
        let before = session.snapshot().await;
        chain.fail_next(SimOp::CreateLockedInvestment, ChainError::UserRejected);
        chain.clear_calls();

        let err = contracts
            .create_locked_investment(
                BaseUnits::from_whole(100),
                LockDuration::from_days(30),
                InvestmentCategory::Crypto,
            )
            .await
            .unwrap_err();
        assert!(err.is_user_rejection());

        let ledger = session.ledger().list().await;
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger[0].status, TransactionStatus::Failed);
        assert!(!ledger[0].error.as_deref().unwrap_or_default().is_empty());

        let after = session.snapshot().await;
        assert_eq!(after.balance, before.balance);
        assert_eq!(after.stats, before.stats);
        assert!(!chain.ops().contains(&SimOp::GetInvestorStats));
    }

    #[tokio::test]
    async fn test_validation_happens_before_tracking() {
        let (_chain, session, contracts) = connected().await;

        let zero = contracts
            .create_locked_investment(
                BaseUnits::ZERO,
                LockDuration::from_days(30),
                InvestmentCategory::Bonds,
            )
            .await;
        assert!(matches!(zero, Err(SessionError::InvalidAmount(_))));

        let no_lock = contracts
            .create_locked_investment(
                BaseUnits::from_whole(1),
                LockDuration::from_secs(0),
                InvestmentCategory::Bonds,
            )
            .await;
        assert_eq!(no_lock.unwrap_err(), SessionError::InvalidLockDuration);

        let zero_withdraw = contracts.withdraw(BaseUnits::ZERO).await;
        assert!(matches!(zero_withdraw, Err(SessionError::InvalidAmount(_))));
        assert!(session.ledger().is_empty().await);
    }

    #[tokio::test]
    async fn test_missing_token_address() {
        let mut config = config();
        config.token = None;
        let (_chain, session) = setup_with(config);
        session.connect().await.unwrap();
        let contracts = session.contracts().await.unwrap();

        let err = contracts
            .create_locked_investment(
                BaseUnits::from_whole(1),
                LockDuration::from_days(30),
                InvestmentCategory::Crypto,
            )
            .await
            .unwrap_err();
        assert_eq!(err, SessionError::TokenNotConfigured);
        assert_eq!(
            contracts.approve(BaseUnits::from_whole(1)).await.unwrap_err(),
            SessionError::TokenNotConfigured
        );
        assert!(session.ledger().is_empty().await);
    }

    #[tokio::test]
    async fn test_withdraw_records_once() {
        let (chain, session, contracts) = connected().await;
        contracts
            .create_locked_investment(
                BaseUnits::from_whole(500),
                LockDuration::from_days(30),
                InvestmentCategory::Stocks,
            )
            .await
            .unwrap();
        chain.advance_time(LockDuration::from_days(31).as_secs());

        let receipt = contracts.withdraw(BaseUnits::from_whole(200)).await.unwrap();

        // The contract's own Withdrawal event must not add a second entry.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let withdrawals: Vec<_> = session
            .ledger()
            .list()
            .await
            .into_iter()
            .filter(|r| r.kind == TransactionKind::Withdraw)
            .collect();
        assert_eq!(withdrawals.len(), 1);
        assert_eq!(withdrawals[0].hash, Some(receipt.hash));
        assert_eq!(withdrawals[0].status, TransactionStatus::Completed);
    }

    #[tokio::test]
    async fn test_confirmation_timeout_fails_entry() {
        let mut config = config();
        config.confirmation_timeout = Duration::from_millis(50);
        let (chain, session) = setup_with(config);
        session.connect().await.unwrap();
        let contracts = session.contracts().await.unwrap();

        chain.stall_confirmations();
        let err = contracts
            .create_locked_investment(
                BaseUnits::from_whole(10),
                LockDuration::from_days(30),
                InvestmentCategory::Crypto,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Timeout { operation: "confirmation", .. }));

        let ledger = session.ledger().list().await;
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger[0].status, TransactionStatus::Failed);
        chain.release_confirmations();
    }

    #[tokio::test]
    async fn test_writes_are_serialized() {
        let (chain, session, contracts) = connected().await;
        chain.stall_confirmations();

        let first = {
            let contracts = contracts.clone();
            tokio::spawn(async move {
                contracts
                    .create_locked_investment(
                        BaseUnits::from_whole(10),
                        LockDuration::from_days(30),
                        InvestmentCategory::Crypto,
                    )
                    .await
            })
        };
        assert!(
            eventually(|| {
                let contracts = contracts.clone();
                async move { contracts.is_processing() }
            })
            .await
        );

        let second = {
            let contracts = contracts.clone();
            tokio::spawn(async move {
                contracts
                    .create_locked_investment(
                        BaseUnits::from_whole(20),
                        LockDuration::from_days(60),
                        InvestmentCategory::Bonds,
                    )
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;

        // The second deposit waits behind the first, so only one approval is out.
        assert_eq!(chain.ops().iter().filter(|op| **op == SimOp::Approve).count(), 1);
        assert!(session.is_processing().await);

        chain.release_confirmations();
        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();

        assert_eq!(chain.ops().iter().filter(|op| **op == SimOp::Approve).count(), 2);
        assert!(!contracts.is_processing());
        assert_eq!(
            session.ledger().list_by_status(TransactionStatus::Completed).await.len(),
            2
        );
    }

    #[tokio::test]
    async fn test_reads() {
        let (chain, _session, contracts) = connected().await;
        chain.push_history(chain.now() - 86_400, BaseUnits::from_whole(100));
        chain.push_history(chain.now() - 40 * 86_400, BaseUnits::from_whole(90));

        contracts
            .create_locked_investment(
                BaseUnits::from_whole(100),
                LockDuration::from_days(30),
                InvestmentCategory::Commodities,
            )
            .await
            .unwrap();
        chain.revalue(&alice(), 0, BaseUnits::from_whole(110));

        let breakdown = contracts.category_breakdown().await.unwrap();
        let commodities = breakdown
            .iter()
            .find(|c| c.category == InvestmentCategory::Commodities)
            .unwrap();
        assert!((commodities.change_percent - 10.0).abs() < 1e-9);

        assert_eq!(contracts.historical_performance(None).await.unwrap().len(), 1);
        assert_eq!(contracts.historical_performance(Some(60)).await.unwrap().len(), 2);
        assert_eq!(contracts.get_token_balance().await.unwrap(), BaseUnits::from_whole(19_900));
    }
}
