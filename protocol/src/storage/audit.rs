//! # Audit Log
//!
//! The auditor's view of token movements. Every transaction the auditor
//! signs leaves one [`AuditRecord`] per (enrollment, token type, direction)
//! it touches; audit checks query the log for the payment history and the
//! current holding of an enrollment ID.
//!
//! Records start `Pending`. The log also listens to ledger finality so a
//! rejected transaction stops counting as soon as it is `Deleted`.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::TxStatus;
use crate::ledger::FinalityListener;

/// Which way value moved relative to the enrollment ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// The enrollment received tokens.
    Inbound,
    /// The enrollment spent tokens.
    Outbound,
}

/// One movement observed by the auditor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub tx_id: String,
    pub enrollment_id: String,
    pub token_type: String,
    pub amount: u64,
    pub direction: Direction,
    pub status: TxStatus,
    /// Unix timestamp (ms).
    pub created_at: i64,
}

impl AuditRecord {
    /// A `Pending` record stamped now.
    pub fn new(
        tx_id: &str,
        enrollment_id: &str,
        token_type: &str,
        amount: u64,
        direction: Direction,
    ) -> Self {
        Self {
            tx_id: tx_id.to_string(),
            enrollment_id: enrollment_id.to_string(),
            token_type: token_type.to_string(),
            amount,
            direction,
            status: TxStatus::Pending,
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Append-only movement log kept by an auditor.
#[derive(Debug, Default)]
pub struct AuditLog {
    records: RwLock<Vec<AuditRecord>>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append the records of one transaction. Records of a transaction
    /// already in the log are replaced, so re-auditing is harmless.
    pub fn append(&self, tx_id: &str, records: Vec<AuditRecord>) {
        let mut log = self.records.write();
        log.retain(|r| r.tx_id != tx_id);
        debug!(tx_id = %tx_id, count = records.len(), "appending audit records");
        log.extend(records);
    }

    /// Amounts of the last `n` outbound payments of `enrollment_id`,
    /// newest first. Rejected transactions are skipped.
    pub fn payments(&self, enrollment_id: &str, token_type: &str, n: usize) -> Vec<u64> {
        self.records
            .read()
            .iter()
            .rev()
            .filter(|r| {
                r.enrollment_id == enrollment_id
                    && r.token_type == token_type
                    && r.direction == Direction::Outbound
                    && r.status != TxStatus::Deleted
            })
            .take(n)
            .map(|r| r.amount)
            .collect()
    }

    /// Inbound minus outbound for `enrollment_id`, ignoring rejected
    /// transactions. Never negative.
    pub fn holding(&self, enrollment_id: &str, token_type: &str) -> u64 {
        let (mut inbound, mut outbound) = (0u64, 0u64);
        for r in self.records.read().iter() {
            if r.enrollment_id != enrollment_id
                || r.token_type != token_type
                || r.status == TxStatus::Deleted
            {
                continue;
            }
            match r.direction {
                Direction::Inbound => inbound = inbound.saturating_add(r.amount),
                Direction::Outbound => outbound = outbound.saturating_add(r.amount),
            }
        }
        inbound.saturating_sub(outbound)
    }

    /// Records of one transaction.
    pub fn records_of(&self, tx_id: &str) -> Vec<AuditRecord> {
        self.records
            .read()
            .iter()
            .filter(|r| r.tx_id == tx_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl FinalityListener for AuditLog {
    fn on_status(&self, tx_id: &str, status: TxStatus, _message: &str) {
        for r in self.records.write().iter_mut().filter(|r| r.tx_id == tx_id) {
            r.status = status;
        }
    }
}
