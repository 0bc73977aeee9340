//! Fine engine: overdue charges and their payment.
//!
//! Fines are computed once, at return time or on demand, from the loan's
//! due date and its return date (or the assessment time if the loan is
//! still open). The engine reads loans but never writes them.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::{debug, info};

use crate::record::{BorrowerId, FineId, FineReason, FineRecord, FineStatus, LoanId, LoanRecord};
use crate::retry::RetryPolicy;
use crate::store::{Collection, DocumentStore, StoreError};

#[derive(Error, Debug)]
pub enum FineError {
    #[error("Fine not found: {0}")]
    NotFound(FineId),

    #[error("Fine {0} has already been paid")]
    AlreadyPaid(FineId),

    #[error("Loan not found: {0}")]
    LoanNotFound(LoanId),

    #[error("Invalid fine amount: {0}")]
    InvalidAmount(String),

    #[error("{0} is not permitted to set manual fines")]
    NotAuthorized(BorrowerId),

    #[error("Fine storage failed after {attempts} attempts: {source}")]
    PersistenceFailure {
        attempts: u32,
        #[source]
        source: StoreError,
    },

    #[error("Fine storage error: {0}")]
    Store(#[from] StoreError),
}

impl FineError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_retryable())
    }

    /// Creates are only retried when the store was unreachable; a conflict
    /// on create means the id is taken.
    fn is_unavailable(&self) -> bool {
        matches!(self, Self::Store(StoreError::Unavailable(_)))
    }
}

pub type Result<T> = std::result::Result<T, FineError>;

/// Whole calendar days from `due_date` to `reference`, never negative.
pub fn compute_overdue_days(due_date: DateTime<Utc>, reference: DateTime<Utc>) -> i64 {
    (reference.date_naive() - due_date.date_naive())
        .num_days()
        .max(0)
}

/// Parameters of an assessment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FineTerms {
    pub rate_per_day: Decimal,

    /// Staff override replacing `overdue_days * rate_per_day`.
    pub manual_amount: Option<Decimal>,

    pub discount: Decimal,
    pub reason: FineReason,
}

impl FineTerms {
    /// Standard late-return charge.
    pub fn late_return(rate_per_day: Decimal) -> Self {
        Self {
            rate_per_day,
            manual_amount: None,
            discount: Decimal::ZERO,
            reason: FineReason::LateReturn,
        }
    }

    /// Fixed charge set by staff.
    pub fn manual(amount: Decimal, reason: FineReason) -> Self {
        Self {
            rate_per_day: Decimal::ZERO,
            manual_amount: Some(amount),
            discount: Decimal::ZERO,
            reason,
        }
    }

    pub fn with_discount(mut self, discount: Decimal) -> Self {
        self.discount = discount;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.rate_per_day.is_sign_negative() {
            return Err(FineError::InvalidAmount(format!(
                "rate per day cannot be negative: {}",
                self.rate_per_day
            )));
        }
        if self.discount.is_sign_negative() {
            return Err(FineError::InvalidAmount(format!(
                "discount cannot be negative: {}",
                self.discount
            )));
        }
        if let Some(amount) = self.manual_amount {
            if amount.is_sign_negative() {
                return Err(FineError::InvalidAmount(format!(
                    "manual amount cannot be negative: {amount}"
                )));
            }
        }
        Ok(())
    }
}

/// Computed charge, before it is recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FineQuote {
    pub overdue_days: i64,
    pub amount: Decimal,
    pub discount: Decimal,
    pub total_amount: Decimal,
}

/// Compute the charge for `loan`; deterministic in its inputs.
pub fn quote(loan: &LoanRecord, terms: &FineTerms, now: DateTime<Utc>) -> Result<FineQuote> {
    terms.validate()?;

    let reference = loan.return_date.unwrap_or(now);
    let overdue_days = compute_overdue_days(loan.due_date, reference);
    let amount = terms
        .manual_amount
        .unwrap_or_else(|| Decimal::from(overdue_days) * terms.rate_per_day);

    Ok(FineQuote {
        overdue_days,
        amount,
        discount: terms.discount,
        total_amount: FineRecord::net(amount, terms.discount),
    })
}

fn build(
    id: FineId,
    loan: &LoanRecord,
    terms: &FineTerms,
    assessed_at: DateTime<Utc>,
) -> Result<FineRecord> {
    let quote = quote(loan, terms, assessed_at)?;

    Ok(FineRecord {
        id,
        loan_id: loan.id.clone(),
        borrower_id: loan.borrower_id.clone(),
        book_id: loan.book_id.clone(),
        amount: quote.amount,
        discount: quote.discount,
        total_amount: quote.total_amount,
        reason: terms.reason,
        overdue_days: quote.overdue_days,
        status: FineStatus::Unpaid,
        created_at: assessed_at,
        paid_at: None,
    })
}

/// Owner of every [`FineRecord`].
#[derive(Clone)]
pub struct FineEngine {
    fines: Collection<FineRecord>,
    retry: RetryPolicy,
}

impl FineEngine {
    pub fn new(store: Arc<dyn DocumentStore>, timeout: Duration, retry: RetryPolicy) -> Self {
        Self {
            fines: Collection::new(store, timeout),
            retry,
        }
    }

    /// Compute and record a fine. A record is kept even when the total is zero.
    pub async fn assess_fine(
        &self,
        loan: &LoanRecord,
        terms: &FineTerms,
        now: DateTime<Utc>,
    ) -> Result<FineRecord> {
        let fine = build(FineId::generate(), loan, terms, now)?;
        self.record(&fine).await?;

        info!(
            fine_id = %fine.id,
            loan_id = %fine.loan_id,
            overdue_days = fine.overdue_days,
            total = %fine.total_amount,
            reason = ?fine.reason,
            "Assessed fine"
        );

        Ok(fine)
    }

    /// Record the late-return fine of a returned loan.
    ///
    /// The fine is keyed by the loan and dated at its return, so assessing
    /// it again yields the record already stored.
    pub async fn assess_late_fine(
        &self,
        loan: &LoanRecord,
        terms: &FineTerms,
        now: DateTime<Utc>,
    ) -> Result<FineRecord> {
        let assessed_at = loan.return_date.unwrap_or(now);
        let fine = build(FineId::late_return(&loan.id), loan, terms, assessed_at)?;

        match self.record(&fine).await {
            Ok(()) => {}
            Err(FineError::Store(StoreError::Conflict { .. })) => {
                debug!(fine_id = %fine.id, "Late fine already recorded");
                return self.get_fine(&fine.id).await;
            }
            Err(e) => return Err(e),
        }

        info!(
            fine_id = %fine.id,
            loan_id = %fine.loan_id,
            overdue_days = fine.overdue_days,
            total = %fine.total_amount,
            "Assessed late-return fine"
        );

        Ok(fine)
    }

    /// The late-return fine of `loan_id`, if one was recorded.
    pub async fn late_fine(&self, loan_id: &LoanId) -> Result<Option<FineRecord>> {
        Ok(self
            .fines
            .find(FineId::late_return(loan_id).as_str())
            .await?
            .map(|stored| stored.document))
    }

    async fn record(&self, fine: &FineRecord) -> Result<()> {
        let fines = &self.fines;
        self.retry
            .run("assess_fine", FineError::is_unavailable, move || async move {
                fines.create(fine).await.map_err(FineError::from)
            })
            .await
            .map(|_| ())
            .map_err(|(err, attempts)| match err {
                FineError::Store(source @ StoreError::Unavailable(_)) => {
                    FineError::PersistenceFailure { attempts, source }
                }
                other => other,
            })
    }

    /// Settle an unpaid fine.
    pub async fn mark_paid(&self, fine_id: &FineId, now: DateTime<Utc>) -> Result<FineRecord> {
        let fine = self
            .retry
            .run("mark_paid", FineError::is_retryable, || self.try_mark_paid(fine_id, now))
            .await
            .map_err(|(err, attempts)| match err {
                FineError::Store(source) if source.is_retryable() => {
                    FineError::PersistenceFailure { attempts, source }
                }
                other => other,
            })?;

        info!(fine_id = %fine_id, total = %fine.total_amount, "Fine paid");

        Ok(fine)
    }

    async fn try_mark_paid(&self, fine_id: &FineId, now: DateTime<Utc>) -> Result<FineRecord> {
        let stored = self.fines.get(fine_id.as_str()).await.map_err(|e| {
            if e.is_not_found() {
                FineError::NotFound(fine_id.clone())
            } else {
                e.into()
            }
        })?;

        let mut fine = stored.document;
        if fine.is_paid() {
            return Err(FineError::AlreadyPaid(fine_id.clone()));
        }

        fine.pay(now);
        self.fines.update(&fine, stored.version).await?;
        Ok(fine)
    }

    pub async fn get_fine(&self, fine_id: &FineId) -> Result<FineRecord> {
        match self.fines.find(fine_id.as_str()).await? {
            Some(stored) => Ok(stored.document),
            None => Err(FineError::NotFound(fine_id.clone())),
        }
    }

    pub async fn fines_for_borrower(&self, borrower_id: &BorrowerId) -> Result<Vec<FineRecord>> {
        let mut fines: Vec<_> = self
            .fines
            .query("borrowerId", borrower_id.as_str())
            .await?
            .into_iter()
            .map(|stored| stored.document)
            .collect();
        fines.sort_by_key(|fine| fine.created_at);
        Ok(fines)
    }

    pub async fn fines_for_loan(&self, loan_id: &LoanId) -> Result<Vec<FineRecord>> {
        let mut fines: Vec<_> = self
            .fines
            .query("loanId", loan_id.as_str())
            .await?
            .into_iter()
            .map(|stored| stored.document)
            .collect();
        fines.sort_by_key(|fine| fine.created_at);
        Ok(fines)
    }

    /// Sum of unpaid totals.
    pub async fn outstanding_balance(&self, borrower_id: &BorrowerId) -> Result<Decimal> {
        Ok(self
            .fines_for_borrower(borrower_id)
            .await?
            .iter()
            .filter(|fine| !fine.is_paid())
            .map(|fine| fine.total_amount)
            .sum())
    }

    pub async fn list_fines(&self) -> Result<Vec<FineRecord>> {
        Ok(self
            .fines
            .list()
            .await?
            .into_iter()
            .map(|stored| stored.document)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{BookId, BorrowerId};
    use crate::store::testing::FaultyStore;
    use crate::store::MemoryStore;
    use chrono::{Duration as Days, TimeZone};
    use rust_decimal_macros::dec;

    fn engine() -> FineEngine {
        FineEngine::new(
            Arc::new(MemoryStore::new()),
            Duration::from_secs(1),
            RetryPolicy::new(3, Duration::from_millis(1)),
        )
    }

    fn returned_loan(days_late: i64) -> LoanRecord {
        let issued = Utc.with_ymd_and_hms(2024, 5, 1, 9, 30, 0).unwrap();
        let mut loan = LoanRecord::open(
            BookId::new("b1"),
            BorrowerId::new("u1"),
            issued,
            issued + Days::days(14),
        );
        let returned = loan.due_date + Days::days(days_late);
        loan.close(returned, Decimal::ZERO);
        loan
    }

    #[test]
    fn test_overdue_days_use_calendar_days() {
        let due = Utc.with_ymd_and_hms(2024, 5, 15, 23, 0, 0).unwrap();

        // Two hours late but across midnight
        let next_day = Utc.with_ymd_and_hms(2024, 5, 16, 1, 0, 0).unwrap();
        assert_eq!(compute_overdue_days(due, next_day), 1);

        // Later the same day
        let same_day = Utc.with_ymd_and_hms(2024, 5, 15, 23, 59, 0).unwrap();
        assert_eq!(compute_overdue_days(due, same_day), 0);

        // Early return
        let early = due - Days::days(3);
        assert_eq!(compute_overdue_days(due, early), 0);
    }

    #[test]
    fn test_quote_four_days_late() {
        let loan = returned_loan(4);
        let quote = quote(&loan, &FineTerms::late_return(dec!(0.50)), Utc::now()).unwrap();

        assert_eq!(quote.overdue_days, 4);
        assert_eq!(quote.amount, dec!(2.00));
        assert_eq!(quote.total_amount, dec!(2.00));
    }

    #[test]
    fn test_quote_is_deterministic_and_non_negative() {
        let loan = returned_loan(3);
        let terms = FineTerms::late_return(dec!(0.35)).with_discount(dec!(0.40));
        let now = Utc::now();

        let first = quote(&loan, &terms, now).unwrap();
        for _ in 0..10 {
            assert_eq!(quote(&loan, &terms, now).unwrap(), first);
        }
        assert_eq!(first.total_amount, dec!(0.65));

        let generous = FineTerms::late_return(dec!(0.35)).with_discount(dec!(100));
        assert_eq!(quote(&loan, &generous, now).unwrap().total_amount, Decimal::ZERO);
    }

    #[test]
    fn test_open_loan_uses_assessment_time() {
        let issued = Utc.with_ymd_and_hms(2024, 5, 1, 9, 30, 0).unwrap();
        let loan = LoanRecord::open(
            BookId::new("b1"),
            BorrowerId::new("u1"),
            issued,
            issued + Days::days(14),
        );

        let now = loan.due_date + Days::days(6);
        let quote = quote(&loan, &FineTerms::late_return(dec!(1)), now).unwrap();
        assert_eq!(quote.overdue_days, 6);
        assert_eq!(quote.amount, dec!(6));
    }

    #[test]
    fn test_manual_amount_overrides_rate() {
        let loan = returned_loan(10);
        let terms = FineTerms::manual(dec!(25.00), FineReason::Damage);
        let quote = quote(&loan, &terms, Utc::now()).unwrap();

        assert_eq!(quote.overdue_days, 10);
        assert_eq!(quote.amount, dec!(25.00));
    }

    #[test]
    fn test_negative_terms_rejected() {
        let loan = returned_loan(1);
        let now = Utc::now();

        let err = quote(&loan, &FineTerms::late_return(dec!(-1)), now).unwrap_err();
        assert!(matches!(err, FineError::InvalidAmount(_)));

        let terms = FineTerms::late_return(dec!(1)).with_discount(dec!(-0.5));
        assert!(matches!(quote(&loan, &terms, now), Err(FineError::InvalidAmount(_))));

        let terms = FineTerms::manual(dec!(-3), FineReason::Other);
        assert!(matches!(quote(&loan, &terms, now), Err(FineError::InvalidAmount(_))));
    }

    #[tokio::test]
    async fn test_discount_larger_than_fine_still_recorded() {
        let engine = engine();
        let loan = returned_loan(2);
        let terms = FineTerms::late_return(dec!(0.50)).with_discount(dec!(5.00));

        let fine = engine.assess_fine(&loan, &terms, Utc::now()).await.unwrap();
        assert_eq!(fine.amount, dec!(1.00));
        assert_eq!(fine.total_amount, dec!(0.00));
        assert_eq!(fine.status, FineStatus::Unpaid);

        let stored = engine.get_fine(&fine.id).await.unwrap();
        assert_eq!(stored, fine);
    }

    #[tokio::test]
    async fn test_mark_paid_once() {
        let engine = engine();
        let loan = returned_loan(4);
        let fine = engine
            .assess_fine(&loan, &FineTerms::late_return(dec!(0.50)), Utc::now())
            .await
            .unwrap();

        let paid = engine.mark_paid(&fine.id, Utc::now()).await.unwrap();
        assert_eq!(paid.status, FineStatus::Paid);
        assert!(paid.paid_at.is_some());

        let err = engine.mark_paid(&fine.id, Utc::now()).await.unwrap_err();
        assert!(matches!(err, FineError::AlreadyPaid(_)));

        let err = engine
            .mark_paid(&FineId::new("missing"), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, FineError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_outstanding_balance() {
        let engine = engine();
        let now = Utc::now();
        let rate = FineTerms::late_return(dec!(0.50));

        let first = engine.assess_fine(&returned_loan(4), &rate, now).await.unwrap();
        engine.assess_fine(&returned_loan(1), &rate, now).await.unwrap();
        assert_eq!(
            engine.outstanding_balance(&BorrowerId::new("u1")).await.unwrap(),
            dec!(2.50)
        );

        engine.mark_paid(&first.id, now).await.unwrap();
        assert_eq!(
            engine.outstanding_balance(&BorrowerId::new("u1")).await.unwrap(),
            dec!(0.50)
        );
        assert_eq!(engine.fines_for_borrower(&BorrowerId::new("u1")).await.unwrap().len(), 2);
        assert_eq!(engine.fines_for_loan(&first.loan_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_late_fine_recorded_once_per_loan() {
        let engine = engine();
        let loan = returned_loan(4);
        let rate = FineTerms::late_return(dec!(0.50));

        let first = engine.assess_late_fine(&loan, &rate, Utc::now()).await.unwrap();
        assert_eq!(first.id, FineId::late_return(&loan.id));
        assert_eq!(Some(first.created_at), loan.return_date);
        assert_eq!(first.total_amount, dec!(2.00));

        // A later assessment returns the stored record untouched
        let again = engine
            .assess_late_fine(&loan, &rate, Utc::now() + Days::days(30))
            .await
            .unwrap();
        assert_eq!(again, first);
        assert_eq!(engine.fines_for_loan(&loan.id).await.unwrap().len(), 1);
        assert_eq!(engine.late_fine(&loan.id).await.unwrap(), Some(first));
    }

    #[tokio::test]
    async fn test_unavailable_store_exhausts_retries() {
        let store = Arc::new(FaultyStore::new());
        let engine = FineEngine::new(
            store.clone(),
            Duration::from_secs(1),
            RetryPolicy::new(3, Duration::from_millis(1)),
        );
        let loan = returned_loan(2);

        store.fail_creates("fines", 5);
        let err = engine
            .assess_late_fine(&loan, &FineTerms::late_return(dec!(0.50)), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, FineError::PersistenceFailure { attempts: 3, .. }));
        assert_eq!(engine.late_fine(&loan.id).await.unwrap(), None);
    }
}
