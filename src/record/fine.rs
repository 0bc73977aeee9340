//! Fine records.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{BookId, BorrowerId, FineId, LoanId};
use crate::store::Document;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FineReason {
    #[default]
    LateReturn,
    Damage,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FineStatus {
    Unpaid,
    Paid,
}

/// A charge against a loan. Kept forever as an audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FineRecord {
    pub id: FineId,
    pub loan_id: LoanId,
    pub borrower_id: BorrowerId,
    pub book_id: BookId,
    pub amount: Decimal,
    pub discount: Decimal,

    /// `max(0, amount - discount)`.
    pub total_amount: Decimal,

    pub reason: FineReason,
    pub overdue_days: i64,
    pub status: FineStatus,
    pub created_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
}

impl FineId {
    /// Id of the late-return fine of `loan_id`; a loan has at most one.
    pub fn late_return(loan_id: &LoanId) -> Self {
        Self::new(format!("{loan_id}-late"))
    }
}

impl FineRecord {
    /// Amount owed after discount, never negative.
    pub fn net(amount: Decimal, discount: Decimal) -> Decimal {
        (amount - discount).max(Decimal::ZERO)
    }

    pub fn is_paid(&self) -> bool {
        self.status == FineStatus::Paid
    }

    pub fn pay(&mut self, paid_at: DateTime<Utc>) {
        self.status = FineStatus::Paid;
        self.paid_at = Some(paid_at);
    }
}

impl Document for FineRecord {
    const COLLECTION: &'static str = "fines";

    fn document_id(&self) -> &str {
        self.id.as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_net_floors_at_zero() {
        assert_eq!(FineRecord::net(dec!(2.00), dec!(0)), dec!(2.00));
        assert_eq!(FineRecord::net(dec!(2.00), dec!(0.75)), dec!(1.25));
        assert_eq!(FineRecord::net(dec!(1.00), dec!(5.00)), Decimal::ZERO);
    }

    #[test]
    fn test_late_return_id_follows_loan() {
        let loan_id = LoanId::new("4f1c");
        assert_eq!(FineId::late_return(&loan_id).as_str(), "4f1c-late");
        assert_eq!(FineId::late_return(&loan_id), FineId::late_return(&loan_id));
    }
}
