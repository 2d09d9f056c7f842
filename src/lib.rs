//! # Fundboard
//!
//! Wallet session, contract session and transaction tracking for an on-chain
//! investment fund dashboard.
//!
//! ## Features
//!
//! - **Wallet session**: connect/disconnect, cached balance and investor stats,
//!   reactions to account switches, chain changes and provider disconnects
//! - **Tracked operations**: locked deposits and withdrawals recorded in a
//!   transaction ledger from submission to confirmation
//! - **Contract events**: badge upgrades, new TVL peaks and performance alerts
//!   delivered as notifications for the connected account
//! - **Backends**: Ethereum JSON-RPC over HTTP, or a deterministic simulated chain
//!
//! ## Modules
//!
//! - [`units`]: 18-decimal fixed-point amounts
//! - [`types`]: addresses, badges, categories, investor stats
//! - [`ledger`]: in-memory transaction ledger
//! - [`chain`]: wallet and contract seams, with JSON-RPC and simulated backends
//! - [`session`]: wallet session, contract session and event bridge
//! - [`config`]: TOML and environment configuration
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use fundboard::chain::SimulatedChain;
//! use fundboard::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let account = Address::parse("0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed")?;
//!     let chain = SimulatedChain::demo(&account);
//!     let config = SessionConfig::new(Address::from_bytes([0xf0; 20]))
//!         .with_token(Address::from_bytes([0x70; 20]));
//!
//!     let session = WalletSession::new(Arc::new(chain), config);
//!     session.connect().await?;
//!
//!     session
//!         .create_locked_investment(
//!             BaseUnits::parse("250")?,
//!             LockDuration::from_days(30),
//!             InvestmentCategory::Crypto,
//!         )
//!         .await?;
//!
//!     for entry in session.ledger().list().await {
//!         println!("{} {} {}", entry.kind, entry.amount, entry.status);
//!     }
//!
//!     session.disconnect().await;
//!     Ok(())
//! }
//! ```

pub mod chain;
pub mod config;
pub mod ledger;
pub mod session;
pub mod types;
pub mod units;

// Re-export top-level types for convenience
pub use units::{format_units, parse_units, BaseUnits, UnitsError, DECIMALS};

pub use types::{
    summarize_by_category, Address, BadgeLevel, CategorySummary, ChainId, Investment,
    InvestmentCategory, InvestorStats, LockDuration, ParseError, PerformancePoint, TxHash,
};

pub use ledger::{
    DepositMetadata, StatusUpdate, TransactionId, TransactionKind, TransactionLedger,
    TransactionRecord, TransactionStatus,
};

pub use chain::{
    ChainError, ChainResult, ContractEvent, FundManagerContract, JsonRpcWallet, ProviderEvent,
    RpcConfig, Signer, SimulatedChain, TokenContract, TxReceipt, WalletProvider,
};

pub use session::{
    parse_amount, parse_lock_days, ContractSession, EventBridge, Notification, SessionConfig,
    SessionError, SessionResult, SessionState, WalletSession, WALLET_INSTALL_URL,
};

pub use config::{generate_default_config, Config, ConfigError, LoggingConfig};
