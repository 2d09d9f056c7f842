//! Wallet and Contract Sessions
//!
//! This module provides the live binding between a user's wallet and the fund:
//! - `WalletSession`: connect/disconnect, cached balance and investor stats,
//!   reactions to account, chain and disconnect notifications
//! - `ContractSession`: tracked deposit/withdraw operations on the bound contracts
//! - `EventBridge`: routes contract events to refreshes, ledger entries and
//!   notifications for the connected account
//!
//! Every remote call is bounded by a timeout. Financial operations are
//! serialized per contract session.

mod contracts;
mod error;
mod events;
mod notifications;
mod wallet;

pub use contracts::ContractSession;
pub use error::{SessionError, SessionResult, WALLET_INSTALL_URL};
pub use events::{route, BridgeTarget, EventBridge, Reaction};
pub use notifications::Notification;
pub use wallet::{SessionState, WalletSession};

use crate::chain::ChainResult;
use crate::types::{Address, LockDuration};
use crate::units::BaseUnits;
use std::future::Future;
use std::time::Duration;

/// Runtime settings for a wallet session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Fund-manager contract address
    pub fund_manager: Address,
    /// Deposit token address; deposits and approvals need it
    pub token: Option<Address>,
    /// Bound on every read and transaction submission
    pub call_timeout: Duration,
    /// Bound on waiting for a transaction to be mined
    pub confirmation_timeout: Duration,
    /// Minimum absolute daily change (percent) that raises a performance alert
    pub performance_alert_threshold: f64,
    /// Default window for historical performance queries
    pub history_days: u32,
    /// Period of the background refresh task
    pub refresh_interval: Duration,
}

impl SessionConfig {
    pub fn new(fund_manager: Address) -> Self {
        Self {
            fund_manager,
            token: None,
            call_timeout: Duration::from_secs(30),
            confirmation_timeout: Duration::from_secs(300),
            performance_alert_threshold: 5.0,
            history_days: 30,
            refresh_interval: Duration::from_secs(30),
        }
    }

    pub fn with_token(mut self, token: Address) -> Self {
        self.token = Some(token);
        self
    }
}

/// Run a chain call under a deadline
pub(crate) async fn with_timeout<T, F>(
    operation: &'static str,
    limit: Duration,
    call: F,
) -> SessionResult<T>
where
    F: Future<Output = ChainResult<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result.map_err(SessionError::from),
        Err(_) => Err(SessionError::Timeout {
            operation,
            secs: limit.as_secs(),
        }),
    }
}

/// Parse a user-entered amount, rejecting zero
pub fn parse_amount(input: &str) -> SessionResult<BaseUnits> {
    let amount = BaseUnits::parse(input)?;
    if amount.is_zero() {
        return Err(SessionError::InvalidAmount(input.trim().to_string()));
    }
    Ok(amount)
}

/// Lock period for a user-entered day count; only the offered presets are accepted
pub fn parse_lock_days(days: u64) -> SessionResult<LockDuration> {
    if days == 0 {
        return Err(SessionError::InvalidLockDuration);
    }
    match LockDuration::checked_from_days(days) {
        Some(lock) if lock.is_preset() => Ok(lock),
        _ => Err(SessionError::UnsupportedLockDuration { days }),
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::ChainError;

    #[test]
    fn test_parse_amount() {
        assert_eq!(parse_amount("100").unwrap(), BaseUnits::from_whole(100));
        assert!(matches!(parse_amount("0"), Err(SessionError::InvalidAmount(_))));
        assert!(matches!(parse_amount("0.000"), Err(SessionError::InvalidAmount(_))));
        assert!(matches!(parse_amount("-5"), Err(SessionError::Units(_))));
    }

    #[test]
    fn test_parse_lock_days() {
        for days in LockDuration::PRESET_DAYS {
            assert_eq!(parse_lock_days(days).unwrap().as_days(), days);
        }
        assert_eq!(parse_lock_days(0), Err(SessionError::InvalidLockDuration));
        assert_eq!(
            parse_lock_days(45),
            Err(SessionError::UnsupportedLockDuration { days: 45 })
        );
    }

    #[test]
    fn test_parse_lock_days_overflow() {
        assert_eq!(
            parse_lock_days(u64::MAX),
            Err(SessionError::UnsupportedLockDuration { days: u64::MAX })
        );
        let just_over = u64::MAX / 86_400 + 1;
        assert_eq!(
            parse_lock_days(just_over),
            Err(SessionError::UnsupportedLockDuration { days: just_over })
        );
    }

    #[tokio::test]
    async fn test_with_timeout() {
        let ok = with_timeout("fast", Duration::from_secs(1), async {
            Ok::<_, ChainError>(1)
        })
        .await;
        assert_eq!(ok.unwrap(), 1);

        let slow = with_timeout("slow", Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, ChainError>(1)
        })
        .await;
        assert!(matches!(slow, Err(SessionError::Timeout { operation: "slow", .. })));

        let failed = with_timeout("rejected", Duration::from_secs(1), async {
            Err::<u8, _>(ChainError::UserRejected)
        })
        .await;
        assert_eq!(failed, Err(SessionError::Chain(ChainError::UserRejected)));
    }
}
