//! User-facing notifications
//!
//! Emitted on the session's broadcast channel for whatever front end is
//! attached (the CLI prints them).

use crate::ledger::{TransactionId, TransactionKind};
use crate::types::{BadgeLevel, TxHash};
use crate::units::BaseUnits;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    /// The connected investor reached a higher badge tier
    BadgeUnlocked { level: BadgeLevel },
    /// Fund TVL reached a new all-time high
    NewPeakTvl { amount: BaseUnits },
    /// Daily fund change crossed the alert threshold (signed percent)
    PerformanceAlert { change_percent: f64 },
    TransactionCompleted {
        id: TransactionId,
        kind: TransactionKind,
        amount: BaseUnits,
        hash: TxHash,
    },
    TransactionFailed {
        id: TransactionId,
        kind: TransactionKind,
        amount: BaseUnits,
        error: String,
    },
}

impl Notification {
    pub fn title(&self) -> &'static str {
        match self {
            Notification::BadgeUnlocked { .. } => "Achievement Unlocked!",
            Notification::NewPeakTvl { .. } => "New Peak TVL!",
            Notification::PerformanceAlert { change_percent } if *change_percent > 0.0 => {
                "Strong Performance"
            }
            Notification::PerformanceAlert { .. } => "Market Alert",
            Notification::TransactionCompleted { .. } => "Transaction Completed",
            Notification::TransactionFailed { .. } => "Transaction Failed",
        }
    }

    pub fn message(&self) -> String {
        match self {
            Notification::BadgeUnlocked { level } => {
                format!("Congratulations! You've reached {} status!", level)
            }
            Notification::NewPeakTvl { amount } => {
                format!("The fund has reached a new peak of ${}!", amount)
            }
            Notification::PerformanceAlert { change_percent } => {
                format!("Fund value has changed by {:.2}% today", change_percent)
            }
            Notification::TransactionCompleted { kind, amount, hash, .. } => {
                format!("{} of {} confirmed in {}", kind, amount, hash)
            }
            Notification::TransactionFailed { kind, amount, error, .. } => {
                format!("{} of {} failed: {}", kind, amount, error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_performance_alert_titles() {
        let up = Notification::PerformanceAlert { change_percent: 6.25 };
        let down = Notification::PerformanceAlert { change_percent: -7.0 };
        assert_eq!(up.title(), "Strong Performance");
        assert_eq!(down.title(), "Market Alert");
        assert_eq!(up.message(), "Fund value has changed by 6.25% today");
    }

    #[test]
    fn test_badge_message() {
        let n = Notification::BadgeUnlocked { level: BadgeLevel::Gold };
        assert_eq!(n.message(), "Congratulations! You've reached GOLD status!");
        let json = serde_json::to_string(&n).unwrap();
        assert!(json.contains("\"type\":\"badge_unlocked\""));
    }
}
