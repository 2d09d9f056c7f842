//! Session error types

use crate::chain::ChainError;
use crate::units::UnitsError;
use thiserror::Error;

/// Where users are sent when no wallet is detected
pub const WALLET_INSTALL_URL: &str = "https://metamask.io/download/";

/// Errors surfaced by wallet and contract sessions
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("No wallet detected. Install a wallet extension from {install_url}")]
    WalletNotInstalled { install_url: &'static str },

    #[error("Wallet did not expose any accounts")]
    NoAccounts,

    #[error("A wallet connection is already in progress")]
    ConnectInProgress,

    #[error("Contracts not initialized; connect a wallet first")]
    ContractsNotInitialized,

    #[error("Deposit token address is not configured")]
    TokenNotConfigured,

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Lock duration must be greater than zero")]
    InvalidLockDuration,

    #[error("Unsupported lock period of {days} days; choose 30, 60, 90, 180 or 365")]
    UnsupportedLockDuration { days: u64 },

    #[error("{operation} timed out after {secs}s")]
    Timeout { operation: &'static str, secs: u64 },

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error(transparent)]
    Units(#[from] UnitsError),
}

impl SessionError {
    pub fn wallet_not_installed() -> Self {
        SessionError::WalletNotInstalled {
            install_url: WALLET_INSTALL_URL,
        }
    }

    /// The user declined the request in their wallet
    pub fn is_user_rejection(&self) -> bool {
        matches!(self, SessionError::Chain(ChainError::UserRejected))
    }
}

pub type SessionResult<T> = Result<T, SessionError>;
