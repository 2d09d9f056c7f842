//! Event Bridge
//!
//! Routes fund-manager events to session reactions. Routing is a pure
//! function of the event, the connected account and the alert threshold;
//! the bridge task only delivers reactions while its session epoch is current.

use super::notifications::Notification;
use crate::chain::ContractEvent;
use crate::types::{Address, TxHash};
use crate::units::BaseUnits;
use async_trait::async_trait;
use std::sync::Weak;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

/// Something the session should do in response to a contract event
#[derive(Debug, Clone, PartialEq)]
pub enum Reaction {
    RefreshStats,
    RefreshBalance,
    /// Ledger a withdrawal that was not initiated through this session
    RecordWithdrawal {
        amount: BaseUnits,
        tx_hash: Option<TxHash>,
    },
    Notify(Notification),
}

/// Decide how the session reacts to `event` while `account` is connected
pub fn route(event: &ContractEvent, account: &Address, alert_threshold: f64) -> Vec<Reaction> {
    if let Some(investor) = event.investor() {
        if investor != account {
            return Vec::new();
        }
    }

    match event {
        ContractEvent::BadgeLevelChange { previous, new, .. } => {
            let mut reactions = vec![Reaction::RefreshStats];
            if new > previous {
                reactions.push(Reaction::Notify(Notification::BadgeUnlocked { level: *new }));
            }
            reactions
        }
        ContractEvent::InvestmentPerformance { .. } => vec![Reaction::RefreshStats],
        ContractEvent::Withdrawal { amount, tx_hash, .. } => vec![
            Reaction::RecordWithdrawal {
                amount: *amount,
                tx_hash: tx_hash.clone(),
            },
            Reaction::RefreshStats,
            Reaction::RefreshBalance,
        ],
        ContractEvent::NewPeakTvl { amount, .. } => {
            vec![Reaction::Notify(Notification::NewPeakTvl { amount: *amount })]
        }
        ContractEvent::PerformanceUpdate { daily_change, .. } => {
            if daily_change.abs() >= alert_threshold {
                vec![Reaction::Notify(Notification::PerformanceAlert {
                    change_percent: *daily_change,
                })]
            } else {
                Vec::new()
            }
        }
    }
}

/// Receiver of bridge reactions
#[async_trait]
pub trait BridgeTarget: Send + Sync {
    /// Current session epoch; reactions from other epochs are stale
    async fn epoch(&self) -> u64;

    async fn apply(&self, epoch: u64, reaction: Reaction);
}

/// Running subscription to contract events for one session epoch
///
/// Dropping the bridge stops it.
pub struct EventBridge {
    task: JoinHandle<()>,
}

impl EventBridge {
    pub fn spawn(
        mut events: broadcast::Receiver<ContractEvent>,
        target: Weak<dyn BridgeTarget>,
        account: Address,
        epoch: u64,
        alert_threshold: f64,
    ) -> Self {
        let task = tokio::spawn(async move {
            tracing::debug!(account = %account, epoch, "Event bridge started");

            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "Event bridge lagged; events dropped");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };

                let Some(target) = target.upgrade() else {
                    break;
                };
                if target.epoch().await != epoch {
                    tracing::debug!(epoch, "Event bridge outlived its session");
                    break;
                }

                let reactions = route(&event, &account, alert_threshold);
                tracing::debug!(
                    event = event.name(),
                    reactions = reactions.len(),
                    "Routing contract event"
                );
                for reaction in reactions {
                    target.apply(epoch, reaction).await;
                }
            }

            tracing::debug!(account = %account, epoch, "Event bridge stopped");
        });

        Self { task }
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for EventBridge {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BadgeLevel;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    fn me() -> Address {
        Address::from_bytes([0xaa; 20])
    }

    fn someone_else() -> Address {
        Address::from_bytes([0xbb; 20])
    }

    #[test]
    fn test_route_filters_other_investors() {
        let event = ContractEvent::Withdrawal {
            investor: someone_else(),
            amount: BaseUnits::from_whole(1),
            timestamp: 0,
            tx_hash: None,
        };
        assert!(route(&event, &me(), 5.0).is_empty());
    }

    #[test]
    fn test_route_matches_case_insensitively() {
        let upper = Address::parse(&me().as_str().to_uppercase().replacen("0X", "0x", 1)).unwrap();
        let event = ContractEvent::InvestmentPerformance {
            investor: upper,
            investment_id: 0,
            previous_value: BaseUnits::from_whole(1),
            new_value: BaseUnits::from_whole(2),
            timestamp: 0,
        };
        assert_eq!(route(&event, &me(), 5.0), vec![Reaction::RefreshStats]);
    }

    #[test]
    fn test_route_badge_upgrade_and_downgrade() {
        let up = ContractEvent::BadgeLevelChange {
            investor: me(),
            previous: BadgeLevel::Silver,
            new: BadgeLevel::Gold,
        };
        assert_eq!(
            route(&up, &me(), 5.0),
            vec![
                Reaction::RefreshStats,
                Reaction::Notify(Notification::BadgeUnlocked { level: BadgeLevel::Gold })
            ]
        );

        let down = ContractEvent::BadgeLevelChange {
            investor: me(),
            previous: BadgeLevel::Gold,
            new: BadgeLevel::Silver,
        };
        assert_eq!(route(&down, &me(), 5.0), vec![Reaction::RefreshStats]);
    }

    #[test]
    fn test_route_withdrawal() {
        let hash = TxHash::from_bytes([1; 32]);
        let event = ContractEvent::Withdrawal {
            investor: me(),
            amount: BaseUnits::from_whole(3),
            timestamp: 0,
            tx_hash: Some(hash.clone()),
        };
        assert_eq!(
            route(&event, &me(), 5.0),
            vec![
                Reaction::RecordWithdrawal {
                    amount: BaseUnits::from_whole(3),
                    tx_hash: Some(hash)
                },
                Reaction::RefreshStats,
                Reaction::RefreshBalance,
            ]
        );
    }

    #[test]
    fn test_route_performance_threshold() {
        let update = |daily_change| ContractEvent::PerformanceUpdate {
            timestamp: 0,
            total_value: BaseUnits::from_whole(1),
            daily_change,
            active_investors: 1,
        };
        assert!(route(&update(4.99), &me(), 5.0).is_empty());
        assert_eq!(route(&update(-5.0), &me(), 5.0).len(), 1);
        assert_eq!(
            route(&update(8.0), &me(), 5.0),
            vec![Reaction::Notify(Notification::PerformanceAlert { change_percent: 8.0 })]
        );
    }

    struct Recorder {
        epoch: Mutex<u64>,
        applied: Mutex<Vec<Reaction>>,
    }

    #[async_trait]
    impl BridgeTarget for Recorder {
        async fn epoch(&self) -> u64 {
            *self.epoch.lock().await
        }

        async fn apply(&self, _epoch: u64, reaction: Reaction) {
            self.applied.lock().await.push(reaction);
        }
    }

    #[tokio::test]
    async fn test_bridge_stops_on_epoch_change() {
        let (tx, rx) = broadcast::channel(16);
        let recorder = Arc::new(Recorder {
            epoch: Mutex::new(1),
            applied: Mutex::new(Vec::new()),
        });
        let target: Arc<dyn BridgeTarget> = recorder.clone();
        let bridge = EventBridge::spawn(rx, Arc::downgrade(&target), me(), 1, 5.0);

        let peak = ContractEvent::NewPeakTvl {
            timestamp: 0,
            amount: BaseUnits::from_whole(10),
        };
        tx.send(peak.clone()).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(recorder.applied.lock().await.len(), 1);

        *recorder.epoch.lock().await = 2;
        tx.send(peak).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        assert_eq!(recorder.applied.lock().await.len(), 1);
        assert!(!bridge.is_running());
    }

    #[tokio::test]
    async fn test_bridge_stops_when_channel_closes() {
        let (tx, rx) = broadcast::channel::<ContractEvent>(4);
        let recorder: Arc<dyn BridgeTarget> = Arc::new(Recorder {
            epoch: Mutex::new(0),
            applied: Mutex::new(Vec::new()),
        });
        let bridge = EventBridge::spawn(rx, Arc::downgrade(&recorder), me(), 0, 5.0);

        drop(tx);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!bridge.is_running());
    }
}
