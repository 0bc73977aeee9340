//! Per-borrower holdings.
//!
//! One document per borrower lists the titles they currently hold. Issuing
//! claims a slot here with a conditioned write before any copy is reserved,
//! so two issues for the same borrower serialise on this document and the
//! one-loan-per-title and open-loan limit rules cannot be raced past.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::{BookId, BorrowerId, LoanId, LoanRecord};
use crate::store::Document;

/// How long a claim may wait for its loan document before it counts as
/// abandoned.
const CLAIM_GRACE_MINUTES: i64 = 10;

/// A claimed slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Holding {
    pub loan_id: LoanId,
    pub claimed_at: DateTime<Utc>,
}

/// Titles held by one borrower, keyed by book.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BorrowerHoldings {
    pub borrower_id: BorrowerId,
    pub loans: BTreeMap<BookId, Holding>,
}

impl BorrowerHoldings {
    pub fn new(borrower_id: BorrowerId) -> Self {
        Self {
            borrower_id,
            loans: BTreeMap::new(),
        }
    }

    /// Rebuild from the borrower's open loans.
    pub fn from_open_loans<'a>(
        borrower_id: BorrowerId,
        loans: impl IntoIterator<Item = &'a LoanRecord>,
    ) -> Self {
        let mut holdings = Self::new(borrower_id);
        for loan in loans.into_iter().filter(|loan| loan.is_open()) {
            holdings.loans.insert(
                loan.book_id.clone(),
                Holding {
                    loan_id: loan.id.clone(),
                    claimed_at: loan.issue_date,
                },
            );
        }
        holdings
    }

    pub fn holds(&self, book_id: &BookId) -> bool {
        self.loans.contains_key(book_id)
    }

    /// Whether `loan_id` already owns the slot for `book_id`.
    pub fn is_claimed_by(&self, book_id: &BookId, loan_id: &LoanId) -> bool {
        self.loans
            .get(book_id)
            .is_some_and(|holding| holding.loan_id == *loan_id)
    }

    pub fn count(&self) -> usize {
        self.loans.len()
    }

    pub fn claim(&mut self, book_id: BookId, loan_id: LoanId, now: DateTime<Utc>) {
        self.loans.insert(
            book_id,
            Holding {
                loan_id,
                claimed_at: now,
            },
        );
    }

    /// Drop the slot for `book_id` if `loan_id` owns it.
    pub fn release(&mut self, book_id: &BookId, loan_id: &LoanId) -> bool {
        if self.is_claimed_by(book_id, loan_id) {
            self.loans.remove(book_id);
            true
        } else {
            false
        }
    }

    /// Whether a claim whose loan was never written has been left behind.
    pub fn is_abandoned(holding: &Holding, now: DateTime<Utc>) -> bool {
        now - holding.claimed_at > Duration::minutes(CLAIM_GRACE_MINUTES)
    }
}

impl Document for BorrowerHoldings {
    const COLLECTION: &'static str = "holdings";

    fn document_id(&self) -> &str {
        self.borrower_id.as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 3, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_release_only_by_owner() {
        let mut holdings = BorrowerHoldings::new(BorrowerId::new("u1"));
        holdings.claim(BookId::new("b1"), LoanId::new("l1"), t0());

        assert!(holdings.holds(&BookId::new("b1")));
        assert!(!holdings.release(&BookId::new("b1"), &LoanId::new("l2")));
        assert_eq!(holdings.count(), 1);

        assert!(holdings.release(&BookId::new("b1"), &LoanId::new("l1")));
        assert_eq!(holdings.count(), 0);
    }

    #[test]
    fn test_rebuilt_from_open_loans_only() {
        let due = t0() + Duration::days(14);
        let open = LoanRecord::open(BookId::new("b1"), BorrowerId::new("u1"), t0(), due);
        let mut closed = LoanRecord::open(BookId::new("b2"), BorrowerId::new("u1"), t0(), due);
        closed.close(t0() + Duration::days(1), Default::default());

        let holdings = BorrowerHoldings::from_open_loans(BorrowerId::new("u1"), [&open, &closed]);
        assert_eq!(holdings.count(), 1);
        assert!(holdings.is_claimed_by(&BookId::new("b1"), &open.id));
    }

    #[test]
    fn test_abandoned_after_grace() {
        let holding = Holding {
            loan_id: LoanId::new("l1"),
            claimed_at: t0(),
        };
        assert!(!BorrowerHoldings::is_abandoned(&holding, t0() + Duration::minutes(5)));
        assert!(BorrowerHoldings::is_abandoned(&holding, t0() + Duration::minutes(11)));
    }

    #[test]
    fn test_json_keys_are_book_ids() {
        let mut holdings = BorrowerHoldings::new(BorrowerId::new("u1"));
        holdings.claim(BookId::new("b1"), LoanId::new("l1"), t0());

        let value = serde_json::to_value(&holdings).unwrap();
        assert_eq!(value["borrowerId"], "u1");
        assert_eq!(value["loans"]["b1"]["loanId"], "l1");
        assert_eq!(serde_json::from_value::<BorrowerHoldings>(value).unwrap(), holdings);
    }
}
