//! Transaction Ledger
//!
//! In-memory record of user-initiated deposits and withdrawals and their
//! outcomes. Entries are inserted most-recent-first with status `pending`,
//! transition exactly once to `completed` or `failed`, and are only ever
//! removed by [`TransactionLedger::clear_failed`].
//!
//! The ledger lives for the process lifetime; it is not persisted.

use crate::types::{InvestmentCategory, LockDuration, TxHash};
use crate::units::BaseUnits;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Locally generated, ledger-unique identifier of a transaction record
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionId(String);

impl TransactionId {
    fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What the user asked the fund to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    Deposit,
    Withdraw,
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionKind::Deposit => write!(f, "deposit"),
            TransactionKind::Withdraw => write!(f, "withdraw"),
        }
    }
}

/// Lifecycle status of a record: pending -> completed | failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
}

impl TransactionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, TransactionStatus::Pending)
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionStatus::Pending => write!(f, "pending"),
            TransactionStatus::Completed => write!(f, "completed"),
            TransactionStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Extra details recorded with a deposit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositMetadata {
    pub category: InvestmentCategory,
    pub lock_duration: LockDuration,
}

/// One tracked transaction attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub id: TransactionId,
    pub kind: TransactionKind,
    /// Amount in fund-token denomination
    pub amount: BaseUnits,
    pub status: TransactionStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<TxHash>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<InvestmentCategory>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock_duration: Option<LockDuration>,
}

/// Fields merged into a record by [`TransactionLedger::update_status`]
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub status: TransactionStatus,
    pub hash: Option<TxHash>,
    pub error: Option<String>,
}

impl StatusUpdate {
    pub fn completed(hash: TxHash) -> Self {
        Self {
            status: TransactionStatus::Completed,
            hash: Some(hash),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: TransactionStatus::Failed,
            hash: None,
            error: Some(error.into()),
        }
    }
}

/// Ordered, most-recent-first list of transaction records
#[derive(Debug, Default)]
pub struct TransactionLedger {
    entries: RwLock<Vec<TransactionRecord>>,
}

impl TransactionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new pending record at the head and return its id
    pub async fn add(
        &self,
        kind: TransactionKind,
        amount: BaseUnits,
        metadata: Option<DepositMetadata>,
    ) -> TransactionId {
        let id = TransactionId::generate();
        let record = TransactionRecord {
            id: id.clone(),
            kind,
            amount,
            status: TransactionStatus::Pending,
            created_at: Utc::now(),
            hash: None,
            error: None,
            category: metadata.map(|m| m.category),
            lock_duration: metadata.map(|m| m.lock_duration),
        };

        self.entries.write().await.insert(0, record);

        tracing::debug!(tx_id = %id, kind = %kind, amount = %amount, "Ledger entry added");
        id
    }

    /// Merge a status update into the record with `id`.
    ///
    /// Returns `false` when the id is unknown or the record has already
    /// reached a terminal status; only status, hash and error ever change.
    pub async fn update_status(&self, id: &TransactionId, update: StatusUpdate) -> bool {
        let mut entries = self.entries.write().await;
        let Some(record) = entries.iter_mut().find(|r| &r.id == id) else {
            return false;
        };

        if record.status.is_terminal() {
            tracing::warn!(
                tx_id = %id,
                current = %record.status,
                requested = %update.status,
                "Ignoring status update on settled transaction"
            );
            return false;
        }

        record.status = update.status;
        if update.hash.is_some() {
            record.hash = update.hash;
        }
        if update.error.is_some() {
            record.error = update.error;
        }

        tracing::debug!(tx_id = %id, status = %record.status, "Ledger entry updated");
        true
    }

    /// Add a record that is already settled (e.g. a withdrawal seen on-chain)
    pub async fn record_completed(
        &self,
        kind: TransactionKind,
        amount: BaseUnits,
        hash: Option<TxHash>,
    ) -> TransactionId {
        let id = TransactionId::generate();
        let record = TransactionRecord {
            id: id.clone(),
            kind,
            amount,
            status: TransactionStatus::Completed,
            created_at: Utc::now(),
            hash,
            error: None,
            category: None,
            lock_duration: None,
        };

        self.entries.write().await.insert(0, record);

        tracing::debug!(tx_id = %id, kind = %kind, amount = %amount, "Settled ledger entry added");
        id
    }

    /// Remove every failed record, keeping the rest in order. Returns the number removed.
    pub async fn clear_failed(&self) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|r| r.status != TransactionStatus::Failed);
        before - entries.len()
    }

    /// All records with the given status, in ledger order
    pub async fn list_by_status(&self, status: TransactionStatus) -> Vec<TransactionRecord> {
        self.entries
            .read()
            .await
            .iter()
            .filter(|r| r.status == status)
            .cloned()
            .collect()
    }

    /// Snapshot of the whole ledger, most recent first
    pub async fn list(&self) -> Vec<TransactionRecord> {
        self.entries.read().await.clone()
    }

    pub async fn get(&self, id: &TransactionId) -> Option<TransactionRecord> {
        self.entries.read().await.iter().find(|r| &r.id == id).cloned()
    }

    pub async fn find_by_hash(&self, hash: &TxHash) -> Option<TransactionRecord> {
        self.entries
            .read()
            .await
            .iter()
            .find(|r| r.hash.as_ref() == Some(hash))
            .cloned()
    }

    /// Whether a pending record of this kind and amount exists
    pub async fn has_pending(&self, kind: TransactionKind, amount: BaseUnits) -> bool {
        self.entries.read().await.iter().any(|r| {
            r.kind == kind && r.amount == amount && r.status == TransactionStatus::Pending
        })
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(n: u8) -> TxHash {
        TxHash::from_bytes([n; 32])
    }

    #[tokio::test]
    async fn test_add_inserts_pending_at_head() {
        let ledger = TransactionLedger::new();
        let first = ledger.add(TransactionKind::Deposit, BaseUnits::from_whole(1), None).await;
        let second = ledger.add(TransactionKind::Withdraw, BaseUnits::from_whole(2), None).await;

        assert_ne!(first, second);
        let entries = ledger.list().await;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].id, second);
        assert_eq!(entries[1].id, first);
        assert!(entries.iter().all(|r| r.status == TransactionStatus::Pending));
    }

    #[tokio::test]
    async fn test_deposit_metadata_recorded() {
        let ledger = TransactionLedger::new();
        let meta = DepositMetadata {
            category: InvestmentCategory::Bonds,
            lock_duration: LockDuration::from_days(90),
        };
        let id = ledger.add(TransactionKind::Deposit, BaseUnits::from_whole(5), Some(meta)).await;

        let record = ledger.get(&id).await.unwrap();
        assert_eq!(record.category, Some(InvestmentCategory::Bonds));
        assert_eq!(record.lock_duration, Some(LockDuration::from_days(90)));
    }

    #[tokio::test]
    async fn test_update_only_touches_status_fields() {
        let ledger = TransactionLedger::new();
        let amount = BaseUnits::parse("10.5").unwrap();
        let id = ledger.add(TransactionKind::Deposit, amount, None).await;
        let before = ledger.get(&id).await.unwrap();

        assert!(ledger.update_status(&id, StatusUpdate::completed(hash(1))).await);

        let after = ledger.get(&id).await.unwrap();
        assert_eq!(after.kind, before.kind);
        assert_eq!(after.amount, before.amount);
        assert_eq!(after.created_at, before.created_at);
        assert_eq!(after.status, TransactionStatus::Completed);
        assert_eq!(after.hash, Some(hash(1)));
        assert_eq!(after.error, None);
    }

    #[tokio::test]
    async fn test_terminal_status_is_final() {
        let ledger = TransactionLedger::new();
        let id = ledger.add(TransactionKind::Withdraw, BaseUnits::from_whole(1), None).await;

        assert!(ledger.update_status(&id, StatusUpdate::failed("user rejected")).await);
        assert!(!ledger.update_status(&id, StatusUpdate::completed(hash(2))).await);

        let record = ledger.get(&id).await.unwrap();
        assert_eq!(record.status, TransactionStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("user rejected"));
        assert_eq!(record.hash, None);
    }

    #[tokio::test]
    async fn test_update_unknown_id_is_noop() {
        let ledger = TransactionLedger::new();
        ledger.add(TransactionKind::Deposit, BaseUnits::from_whole(1), None).await;
        let snapshot = ledger.list().await;

        let unknown = TransactionId::generate();
        assert!(!ledger.update_status(&unknown, StatusUpdate::completed(hash(3))).await);
        assert_eq!(ledger.list().await, snapshot);
    }

    #[tokio::test]
    async fn test_clear_failed_is_idempotent_and_keeps_order() {
        let ledger = TransactionLedger::new();
        let a = ledger.add(TransactionKind::Deposit, BaseUnits::from_whole(1), None).await;
        let b = ledger.add(TransactionKind::Deposit, BaseUnits::from_whole(2), None).await;
        let c = ledger.add(TransactionKind::Withdraw, BaseUnits::from_whole(3), None).await;
        let d = ledger.add(TransactionKind::Withdraw, BaseUnits::from_whole(4), None).await;

        ledger.update_status(&b, StatusUpdate::failed("revert")).await;
        ledger.update_status(&c, StatusUpdate::completed(hash(4))).await;
        ledger.update_status(&d, StatusUpdate::failed("timeout")).await;

        assert_eq!(ledger.clear_failed().await, 2);
        let once = ledger.list().await;
        assert_eq!(ledger.clear_failed().await, 0);
        let twice = ledger.list().await;

        assert_eq!(once, twice);
        let ids: Vec<_> = once.iter().map(|r| r.id.clone()).collect();
        assert_eq!(ids, vec![c, a]);
    }

    #[tokio::test]
    async fn test_list_by_status_preserves_order() {
        let ledger = TransactionLedger::new();
        let mut completed = Vec::new();
        for i in 0..6u8 {
            let id = ledger
                .add(TransactionKind::Deposit, BaseUnits::from_whole(i as u64), None)
                .await;
            if i % 2 == 0 {
                ledger.update_status(&id, StatusUpdate::completed(hash(i))).await;
                completed.push(id);
            }
        }
        completed.reverse();

        let listed: Vec<_> = ledger
            .list_by_status(TransactionStatus::Completed)
            .await
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(listed, completed);
        assert_eq!(ledger.list_by_status(TransactionStatus::Pending).await.len(), 3);
        assert!(ledger.list_by_status(TransactionStatus::Failed).await.is_empty());
    }

    #[tokio::test]
    async fn test_record_completed_and_lookup() {
        let ledger = TransactionLedger::new();
        let id = ledger
            .record_completed(TransactionKind::Withdraw, BaseUnits::from_whole(7), Some(hash(9)))
            .await;

        let found = ledger.find_by_hash(&hash(9)).await.unwrap();
        assert_eq!(found.id, id);
        assert_eq!(found.status, TransactionStatus::Completed);
        assert!(!ledger.has_pending(TransactionKind::Withdraw, BaseUnits::from_whole(7)).await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_record_completed_never_visible_as_pending() {
        let ledger = std::sync::Arc::new(TransactionLedger::new());

        let watcher = {
            let ledger = ledger.clone();
            tokio::spawn(async move {
                let mut seen_pending = false;
                for _ in 0..500 {
                    if !ledger.list_by_status(TransactionStatus::Pending).await.is_empty() {
                        seen_pending = true;
                    }
                    tokio::task::yield_now().await;
                }
                seen_pending
            })
        };

        for n in 0..200u64 {
            ledger
                .record_completed(TransactionKind::Withdraw, BaseUnits::from_whole(n + 1), None)
                .await;
        }

        assert!(!watcher.await.unwrap());
        assert_eq!(ledger.list_by_status(TransactionStatus::Completed).await.len(), 200);
        assert!(ledger.list().await.iter().all(|r| r.hash.is_none() && r.error.is_none()));
    }

    #[test]
    fn test_record_serialization() {
        let record = TransactionRecord {
            id: TransactionId("abc".to_string()),
            kind: TransactionKind::Deposit,
            amount: BaseUnits::from_whole(100),
            status: TransactionStatus::Pending,
            created_at: Utc::now(),
            hash: None,
            error: None,
            category: Some(InvestmentCategory::Crypto),
            lock_duration: Some(LockDuration::from_days(30)),
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"kind\":\"deposit\""));
        assert!(json.contains("\"status\":\"pending\""));
        assert!(json.contains("\"amount\":\"100\""));
        assert!(!json.contains("\"hash\""));
    }
}
