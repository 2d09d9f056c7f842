//! Core domain types
//!
//! This module defines the values shared by the session, ledger and chain layers:
//! - `Address` / `TxHash`: opaque on-chain identifiers
//! - `BadgeLevel` and `InvestmentCategory`: contract-side enumerations
//! - `InvestorStats`, `Investment`, `PerformancePoint`: read-only contract snapshots
//! - `CategorySummary`: per-category aggregation used by the dashboard

use crate::units::BaseUnits;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use thiserror::Error;

/// An externally-owned or contract address ("0x" + 40 hex digits)
///
/// The original casing is preserved for display, but equality and hashing
/// are case-insensitive so checksummed and lowercase forms compare equal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(String);

impl Address {
    /// Parse and validate an address string
    pub fn parse(s: &str) -> Result<Self, ParseError> {
        let s = s.trim();
        let digits = s
            .strip_prefix("0x")
            .or_else(|| s.strip_prefix("0X"))
            .ok_or_else(|| ParseError::InvalidAddress(s.to_string()))?;

        if digits.len() != 40 || hex::decode(digits).is_err() {
            return Err(ParseError::InvalidAddress(s.to_string()));
        }

        Ok(Self(format!("0x{}", digits)))
    }

    /// Build an address from its raw 20 bytes
    pub fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(format!("0x{}", hex::encode(bytes)))
    }

    /// Raw 20 bytes of the address
    pub fn to_bytes(&self) -> [u8; 20] {
        let mut out = [0u8; 20];
        // Validated in `parse`/`from_bytes`, so decoding cannot fail here.
        if let Ok(decoded) = hex::decode(&self.0[2..]) {
            out.copy_from_slice(&decoded);
        }
        out
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Abbreviated form for status lines, e.g. `0x1234...abcd`
    pub fn short(&self) -> String {
        format!("{}...{}", &self.0[..6], &self.0[self.0.len() - 4..])
    }
}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq_ignore_ascii_case(&other.0)
    }
}

impl Eq for Address {}

impl Hash for Address {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for b in self.0.bytes() {
            state.write_u8(b.to_ascii_lowercase());
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Address {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Address {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Address> for String {
    fn from(address: Address) -> Self {
        address.0
    }
}

/// Hash of a submitted transaction ("0x" + 64 hex digits, stored lowercase)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TxHash(String);

impl TxHash {
    pub fn parse(s: &str) -> Result<Self, ParseError> {
        let s = s.trim();
        let digits = s
            .strip_prefix("0x")
            .or_else(|| s.strip_prefix("0X"))
            .ok_or_else(|| ParseError::InvalidTxHash(s.to_string()))?;

        if digits.len() != 64 || hex::decode(digits).is_err() {
            return Err(ParseError::InvalidTxHash(s.to_string()));
        }

        Ok(Self(format!("0x{}", digits.to_ascii_lowercase())))
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(format!("0x{}", hex::encode(bytes)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for TxHash {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<TxHash> for String {
    fn from(hash: TxHash) -> Self {
        hash.0
    }
}

/// EVM chain identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChainId(pub u64);

impl ChainId {
    /// Parse the hex quantity form used by `chainChanged` notifications ("0xaa36a7")
    pub fn from_hex(s: &str) -> Result<Self, ParseError> {
        let digits = s.trim().trim_start_matches("0x").trim_start_matches("0X");
        u64::from_str_radix(digits, 16)
            .map(ChainId)
            .map_err(|_| ParseError::InvalidChainId(s.to_string()))
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Tiered investor classification maintained by the fund contract
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BadgeLevel {
    #[default]
    Bronze,
    Silver,
    Gold,
    Diamond,
    Platinum,
}

impl BadgeLevel {
    /// Decode the contract's uint8 representation
    pub fn from_code(code: u8) -> Result<Self, ParseError> {
        match code {
            0 => Ok(BadgeLevel::Bronze),
            1 => Ok(BadgeLevel::Silver),
            2 => Ok(BadgeLevel::Gold),
            3 => Ok(BadgeLevel::Diamond),
            4 => Ok(BadgeLevel::Platinum),
            other => Err(ParseError::UnknownBadgeLevel(other)),
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    /// Title shown next to the account, e.g. "Gold Investor"
    pub fn title(self) -> String {
        let name = self.to_string();
        let mut chars = name.chars();
        match chars.next() {
            Some(first) => format!("{}{} Investor", first, chars.as_str().to_lowercase()),
            None => String::new(),
        }
    }
}

impl fmt::Display for BadgeLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BadgeLevel::Bronze => write!(f, "BRONZE"),
            BadgeLevel::Silver => write!(f, "SILVER"),
            BadgeLevel::Gold => write!(f, "GOLD"),
            BadgeLevel::Diamond => write!(f, "DIAMOND"),
            BadgeLevel::Platinum => write!(f, "PLATINUM"),
        }
    }
}

/// Asset class a locked investment is allocated to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvestmentCategory {
    Crypto,
    Stocks,
    Commodities,
    Bonds,
}

impl InvestmentCategory {
    /// Get all categories in contract order
    pub fn all() -> &'static [InvestmentCategory] {
        &[
            InvestmentCategory::Crypto,
            InvestmentCategory::Stocks,
            InvestmentCategory::Commodities,
            InvestmentCategory::Bonds,
        ]
    }

    pub fn from_code(code: u8) -> Result<Self, ParseError> {
        Self::all()
            .get(code as usize)
            .copied()
            .ok_or(ParseError::UnknownCategory(code))
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn label(self) -> &'static str {
        match self {
            InvestmentCategory::Crypto => "Cryptocurrency",
            InvestmentCategory::Stocks => "Stock Market",
            InvestmentCategory::Commodities => "Commodities",
            InvestmentCategory::Bonds => "Government Bonds",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            InvestmentCategory::Crypto => "Diversified crypto portfolio",
            InvestmentCategory::Stocks => "Global equity markets",
            InvestmentCategory::Commodities => "Natural resources and metals",
            InvestmentCategory::Bonds => "Sovereign debt instruments",
        }
    }
}

impl fmt::Display for InvestmentCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvestmentCategory::Crypto => write!(f, "crypto"),
            InvestmentCategory::Stocks => write!(f, "stocks"),
            InvestmentCategory::Commodities => write!(f, "commodities"),
            InvestmentCategory::Bonds => write!(f, "bonds"),
        }
    }
}

impl FromStr for InvestmentCategory {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "crypto" | "cryptocurrency" | "0" => Ok(InvestmentCategory::Crypto),
            "stocks" | "stock" | "1" => Ok(InvestmentCategory::Stocks),
            "commodities" | "2" => Ok(InvestmentCategory::Commodities),
            "bonds" | "3" => Ok(InvestmentCategory::Bonds),
            _ => Err(ParseError::UnknownCategoryName(s.to_string())),
        }
    }
}

const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

/// Lock period of an investment, in seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LockDuration(u64);

impl LockDuration {
    /// Lock periods offered by the deposit form
    pub const PRESET_DAYS: [u64; 5] = [30, 60, 90, 180, 365];

    pub fn from_secs(secs: u64) -> Self {
        Self(secs)
    }

    /// Saturates at `u64::MAX` seconds; use [`LockDuration::checked_from_days`]
    /// for user input.
    pub fn from_days(days: u64) -> Self {
        Self(days.saturating_mul(SECONDS_PER_DAY))
    }

    /// `None` when `days` does not fit in seconds
    pub fn checked_from_days(days: u64) -> Option<Self> {
        days.checked_mul(SECONDS_PER_DAY).map(Self)
    }

    pub fn is_preset(self) -> bool {
        Self::PRESET_DAYS
            .iter()
            .any(|&days| days * SECONDS_PER_DAY == self.0)
    }

    pub fn as_secs(self) -> u64 {
        self.0
    }

    /// Whole days, rounded down
    pub fn as_days(self) -> u64 {
        self.0 / SECONDS_PER_DAY
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for LockDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} days", self.as_days())
    }
}

/// Aggregate investor position as reported by `getInvestorStats`
///
/// Always replaced wholesale on refresh, never patched locally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvestorStats {
    pub total_invested: BaseUnits,
    pub current_total: BaseUnits,
    pub unrealized_profit: BaseUnits,
    pub realized_profit: BaseUnits,
    pub total_fee_paid: BaseUnits,
    pub badge_level: BadgeLevel,
    pub investment_count: u64,
}

impl InvestorStats {
    /// Percent change of the current position against the amount invested
    pub fn total_change_percent(&self) -> f64 {
        percent_change(self.total_invested.to_f64(), self.current_total.to_f64())
    }
}

/// A single locked investment as reported by `getInvestorInvestments`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Investment {
    pub amount: BaseUnits,
    pub current_value: BaseUnits,
    pub lock_duration: LockDuration,
    /// Unix timestamp (seconds) when the investment was created
    pub start_time: u64,
    pub category: InvestmentCategory,
}

impl Investment {
    /// Unix timestamp (seconds) after which the position can be withdrawn
    pub fn unlock_time(&self) -> u64 {
        self.start_time.saturating_add(self.lock_duration.as_secs())
    }

    pub fn is_locked(&self, now_secs: u64) -> bool {
        now_secs < self.unlock_time()
    }
}

/// One sample of the fund's historical value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformancePoint {
    /// Unix timestamp in seconds
    pub timestamp: u64,
    pub value: BaseUnits,
}

/// Current value and percent change of all investments in one category
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategorySummary {
    pub category: InvestmentCategory,
    pub invested: f64,
    pub current_value: f64,
    pub change_percent: f64,
}

/// Group investments by category; every category is present, zero-filled if empty
pub fn summarize_by_category(investments: &[Investment]) -> Vec<CategorySummary> {
    InvestmentCategory::all()
        .iter()
        .map(|&category| {
            let (invested, current_value) = investments
                .iter()
                .filter(|inv| inv.category == category)
                .fold((0.0, 0.0), |(inv_sum, cur_sum), inv| {
                    (
                        inv_sum + inv.amount.to_f64(),
                        cur_sum + inv.current_value.to_f64(),
                    )
                });

            CategorySummary {
                category,
                invested,
                current_value,
                change_percent: percent_change(invested, current_value),
            }
        })
        .collect()
}

fn percent_change(initial: f64, current: f64) -> f64 {
    if initial > 0.0 {
        (current - initial) / initial * 100.0
    } else {
        0.0
    }
}

/// Errors parsing domain identifiers and contract codes
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid transaction hash: {0}")]
    InvalidTxHash(String),

    #[error("Invalid chain id: {0}")]
    InvalidChainId(String),

    #[error("Unknown badge level code: {0}")]
    UnknownBadgeLevel(u8),

    #[error("Unknown investment category code: {0}")]
    UnknownCategory(u8),

    #[error("Unknown investment category: {0}")]
    UnknownCategoryName(String),
}
