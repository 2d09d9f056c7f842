//! Chain Collaborators
//!
//! The session layer talks to the outside world only through the traits in
//! this module:
//! - `WalletProvider`: account access, balances, signing, provider notifications
//! - `FundManagerContract`: the fund's fixed ABI surface and its events
//! - `TokenContract`: the fungible token used for deposits
//!
//! Two backends implement them: `rpc` (Ethereum JSON-RPC over HTTP) and
//! `sim` (deterministic in-memory chain for demo mode and tests).

pub mod abi;
pub mod rpc;
pub mod sim;

pub use rpc::{JsonRpcWallet, RpcConfig};
pub use sim::{SimCall, SimOp, SimulatedChain};

use crate::types::{
    Address, BadgeLevel, ChainId, InvestmentCategory, Investment, InvestorStats,
    LockDuration, PerformancePoint, TxHash,
};
use crate::units::BaseUnits;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

/// Capacity of provider and contract event channels
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// The account that signs state-changing calls
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Signer {
    address: Address,
}

impl Signer {
    pub fn new(address: Address) -> Self {
        Self { address }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }
}

/// Confirmation of a mined transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxReceipt {
    pub hash: TxHash,
    pub block_number: u64,
}

/// Asynchronous notifications from the wallet provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderEvent {
    /// The exposed account list changed; empty means every account was removed
    AccountsChanged(Vec<Address>),
    ChainChanged(ChainId),
    Disconnected,
}

/// Events emitted by the fund-manager contract
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ContractEvent {
    BadgeLevelChange {
        investor: Address,
        previous: BadgeLevel,
        new: BadgeLevel,
    },
    InvestmentPerformance {
        investor: Address,
        investment_id: u64,
        previous_value: BaseUnits,
        new_value: BaseUnits,
        timestamp: u64,
    },
    Withdrawal {
        investor: Address,
        amount: BaseUnits,
        timestamp: u64,
        tx_hash: Option<TxHash>,
    },
    NewPeakTvl {
        timestamp: u64,
        amount: BaseUnits,
    },
    PerformanceUpdate {
        timestamp: u64,
        total_value: BaseUnits,
        /// Signed daily change in percent
        daily_change: f64,
        active_investors: u64,
    },
}

impl ContractEvent {
    /// Investor the event concerns, for per-account events
    pub fn investor(&self) -> Option<&Address> {
        match self {
            ContractEvent::BadgeLevelChange { investor, .. }
            | ContractEvent::InvestmentPerformance { investor, .. }
            | ContractEvent::Withdrawal { investor, .. } => Some(investor),
            ContractEvent::NewPeakTvl { .. } | ContractEvent::PerformanceUpdate { .. } => None,
        }
    }

    /// Solidity event name
    pub fn name(&self) -> &'static str {
        match self {
            ContractEvent::BadgeLevelChange { .. } => "BadgeLevelChange",
            ContractEvent::InvestmentPerformance { .. } => "InvestmentPerformance",
            ContractEvent::Withdrawal { .. } => "WithdrawalEvent",
            ContractEvent::NewPeakTvl { .. } => "NewPeakTVL",
            ContractEvent::PerformanceUpdate { .. } => "PerformanceUpdate",
        }
    }
}

/// Browser-wallet style provider
#[async_trait]
pub trait WalletProvider: Send + Sync {
    /// Whether a wallet is present at all
    async fn is_installed(&self) -> bool;

    /// Ask the wallet to expose its accounts (may prompt the user)
    async fn request_accounts(&self) -> ChainResult<Vec<Address>>;

    /// Native currency balance
    async fn get_balance(&self, address: &Address) -> ChainResult<BaseUnits>;

    async fn get_network(&self) -> ChainResult<ChainId>;

    async fn get_signer(&self) -> ChainResult<Signer>;

    /// Wait until `hash` is mined. Reverted transactions are errors.
    async fn wait_for_confirmation(&self, hash: &TxHash) -> ChainResult<TxReceipt>;

    /// Receive account, chain and disconnect notifications
    fn subscribe(&self) -> broadcast::Receiver<ProviderEvent>;

    /// Stop delivering provider notifications to every subscriber
    fn remove_all_listeners(&self);

    fn bind_fund_manager(
        &self,
        signer: &Signer,
        address: &Address,
    ) -> ChainResult<Arc<dyn FundManagerContract>>;

    fn bind_token(&self, signer: &Signer, address: &Address) -> ChainResult<Arc<dyn TokenContract>>;
}

/// Fund-manager contract handle bound to a signer
#[async_trait]
pub trait FundManagerContract: Send + Sync {
    fn address(&self) -> &Address;

    async fn create_locked_investment(
        &self,
        amount: BaseUnits,
        lock_duration: LockDuration,
        category: InvestmentCategory,
    ) -> ChainResult<TxHash>;

    async fn withdraw(&self, amount: BaseUnits) -> ChainResult<TxHash>;

    async fn get_investor_stats(&self, investor: &Address) -> ChainResult<InvestorStats>;

    async fn get_investor_investments(&self, investor: &Address) -> ChainResult<Vec<Investment>>;

    async fn get_historical_performance(&self, days: u32) -> ChainResult<Vec<PerformancePoint>>;

    /// Receive contract events
    fn events(&self) -> broadcast::Receiver<ContractEvent>;

    /// Stop delivering contract events to every subscriber
    fn remove_all_listeners(&self);
}

/// Fungible token handle bound to a signer
#[async_trait]
pub trait TokenContract: Send + Sync {
    fn address(&self) -> &Address;

    async fn balance_of(&self, owner: &Address) -> ChainResult<BaseUnits>;

    async fn approve(&self, spender: &Address, amount: BaseUnits) -> ChainResult<TxHash>;
}

/// Errors from wallet and contract calls
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ChainError {
    #[error("User rejected the request")]
    UserRejected,

    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Request timeout")]
    Timeout,

    #[error("Failed to decode response: {0}")]
    Decode(String),

    #[error("Transaction {hash} reverted")]
    Reverted { hash: TxHash },

    #[error("Wallet provider unavailable")]
    Unavailable,
}

pub type ChainResult<T> = Result<T, ChainError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_investor() {
        let investor = Address::from_bytes([7; 20]);
        let event = ContractEvent::Withdrawal {
            investor: investor.clone(),
            amount: BaseUnits::from_whole(1),
            timestamp: 0,
            tx_hash: None,
        };
        assert_eq!(event.investor(), Some(&investor));
        assert_eq!(event.name(), "WithdrawalEvent");

        let peak = ContractEvent::NewPeakTvl {
            timestamp: 0,
            amount: BaseUnits::from_whole(1),
        };
        assert_eq!(peak.investor(), None);
    }

    #[test]
    fn test_event_serialization() {
        let event = ContractEvent::BadgeLevelChange {
            investor: Address::from_bytes([1; 20]),
            previous: BadgeLevel::Bronze,
            new: BadgeLevel::Silver,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"badge_level_change\""));
        assert!(json.contains("\"new\":\"SILVER\""));
    }
}
