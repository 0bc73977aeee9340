//! Loan records.
//!
//! Only `Borrowed` and `Returned` are stored. Overdue is derived from the
//! due date whenever a loan is read, so it can never go stale.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{BookId, BorrowerId, FineId, LoanId};
use crate::store::Document;

/// Stored loan status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoanStatus {
    Borrowed,
    Returned,
}

/// Loan status as seen at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoanStanding {
    Borrowed,
    Overdue,
    Returned,
}

/// One copy of a title lent to one borrower.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoanRecord {
    pub id: LoanId,
    pub book_id: BookId,
    pub borrower_id: BorrowerId,
    pub issue_date: DateTime<Utc>,
    pub due_date: DateTime<Utc>,
    pub return_date: Option<DateTime<Utc>>,
    pub status: LoanStatus,

    /// Fines charged against this loan so far.
    pub fine_amount: Decimal,

    /// On-demand fines already counted in `fine_amount`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub charged_fines: Vec<FineId>,
}

impl LoanRecord {
    /// Open a new loan.
    pub fn open(
        book_id: BookId,
        borrower_id: BorrowerId,
        issue_date: DateTime<Utc>,
        due_date: DateTime<Utc>,
    ) -> Self {
        Self {
            id: LoanId::generate(),
            book_id,
            borrower_id,
            issue_date,
            due_date,
            return_date: None,
            status: LoanStatus::Borrowed,
            fine_amount: Decimal::ZERO,
            charged_fines: Vec::new(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == LoanStatus::Borrowed
    }

    pub fn standing(&self, now: DateTime<Utc>) -> LoanStanding {
        match self.status {
            LoanStatus::Returned => LoanStanding::Returned,
            LoanStatus::Borrowed if now > self.due_date => LoanStanding::Overdue,
            LoanStatus::Borrowed => LoanStanding::Borrowed,
        }
    }

    /// Mark returned at `returned_at`, charging `fine`.
    pub fn close(&mut self, returned_at: DateTime<Utc>, fine: Decimal) {
        self.return_date = Some(returned_at);
        self.status = LoanStatus::Returned;
        self.fine_amount += fine;
    }

    /// Add an on-demand fine to the running total once.
    ///
    /// Returns false when `fine_id` was already counted.
    pub fn charge(&mut self, fine_id: &FineId, total: Decimal) -> bool {
        if self.charged_fines.contains(fine_id) {
            return false;
        }
        self.charged_fines.push(fine_id.clone());
        self.fine_amount += total;
        true
    }
}

impl Document for LoanRecord {
    const COLLECTION: &'static str = "loans";

    fn document_id(&self) -> &str {
        self.id.as_str()
    }
}
