//! Circulation service: the three components wired over one store.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::CirculationConfig;
use crate::directory::{DirectoryError, UserDirectory};
use crate::fines::{FineEngine, FineError, FineTerms};
use crate::ledger::{CatalogLedger, LedgerError};
use crate::loans::{IssueError, LoanManager, LoanPolicy, ReturnError, Returned};
use crate::record::{
    BookAvailabilityView, BookId, BorrowerId, FineId, FineRecord, LoanId, LoanRecord, LoanStanding,
};
use crate::store::{DocumentStore, StoreError};

/// Errors from read-only reports spanning several components.
#[derive(Error, Debug)]
pub enum ReportError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Fines(#[from] FineError),

    #[error("Report storage error: {0}")]
    Store(#[from] StoreError),
}

/// Recorded borrowed count against counted open loans for one title, and
/// loans whose running fine total disagrees with their fine records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationReport {
    pub book_id: BookId,
    pub recorded_borrowed: u32,
    pub open_loans: u32,

    /// `recorded_borrowed - open_loans`; zero when consistent.
    pub drift: i64,

    /// Loans whose `fine_amount` is not the sum of their fines.
    pub unbalanced_fines: Vec<LoanId>,
}

impl ReconciliationReport {
    pub fn is_consistent(&self) -> bool {
        self.drift == 0 && self.unbalanced_fines.is_empty()
    }
}

/// Whole-service counts for the status endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CirculationSummary {
    pub titles: usize,
    pub copies: u64,
    pub available_copies: u64,
    pub open_loans: usize,
    pub overdue_loans: usize,
    pub unpaid_fines: usize,
    pub outstanding_fines: Decimal,
}

#[derive(Clone)]
pub struct CirculationService {
    ledger: CatalogLedger,
    loans: LoanManager,
    fines: FineEngine,
    directory: Arc<dyn UserDirectory>,
    config: CirculationConfig,
}

impl CirculationService {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        directory: Arc<dyn UserDirectory>,
        config: &CirculationConfig,
    ) -> Self {
        let ledger = CatalogLedger::new(store.clone(), config.store_timeout, config.retry);
        let fines = FineEngine::new(store.clone(), config.store_timeout, config.retry);
        let loans = LoanManager::new(
            store,
            config.store_timeout,
            ledger.clone(),
            fines.clone(),
            directory.clone(),
            LoanPolicy {
                max_open_loans: config.max_open_loans,
                fine_rate_per_day: config.fine_rate_per_day,
            },
            config.retry,
        );

        Self {
            ledger,
            loans,
            fines,
            directory,
            config: config.clone(),
        }
    }

    pub fn ledger(&self) -> &CatalogLedger {
        &self.ledger
    }

    pub fn loans(&self) -> &LoanManager {
        &self.loans
    }

    pub fn fines(&self) -> &FineEngine {
        &self.fines
    }

    pub fn config(&self) -> &CirculationConfig {
        &self.config
    }

    /// Issue a book; without a due date the configured loan period applies.
    pub async fn issue_book(
        &self,
        book_id: &BookId,
        borrower_id: &BorrowerId,
        due_date: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<LoanRecord, IssueError> {
        let due_date = due_date.unwrap_or_else(|| self.config.default_due_date(now));
        self.loans.issue_book(book_id, borrower_id, due_date, now).await
    }

    pub async fn return_book(
        &self,
        loan_id: &LoanId,
        now: DateTime<Utc>,
    ) -> Result<Returned, ReturnError> {
        self.loans.return_book(loan_id, now).await
    }

    /// Assess a fine against a loan on demand.
    ///
    /// Manual amounts may only be set by librarians and admins. The fine is
    /// also added to the loan's running `fine_amount`.
    pub async fn assess_fine(
        &self,
        loan_id: &LoanId,
        terms: &FineTerms,
        actor: &BorrowerId,
        now: DateTime<Utc>,
    ) -> Result<FineRecord, FineError> {
        if terms.manual_amount.is_some() {
            let staff = match self.directory.lookup(actor).await {
                Ok(profile) => profile.role.is_staff(),
                Err(DirectoryError::NotFound(_)) => false,
                Err(DirectoryError::Unavailable(e)) => return Err(e.into()),
                Err(e) => {
                    warn!(actor = %actor, error = %e, "Directory lookup failed");
                    false
                }
            };
            if !staff {
                return Err(FineError::NotAuthorized(actor.clone()));
            }
        }

        let loan = self
            .loans
            .get_loan(loan_id)
            .await?
            .ok_or_else(|| FineError::LoanNotFound(loan_id.clone()))?;

        let fine = self.fines.assess_fine(&loan, terms, now).await?;

        if let Err(e) = self.loans.record_fine(&fine).await {
            error!(
                fine_id = %fine.id,
                loan_id = %loan_id,
                error = %e,
                "Fine recorded but loan total not updated; reconciliation will report the loan"
            );
        }

        Ok(fine)
    }

    pub async fn mark_paid(&self, fine_id: &FineId, now: DateTime<Utc>) -> Result<FineRecord, FineError> {
        self.fines.mark_paid(fine_id, now).await
    }

    pub async fn get_availability(&self, book_id: &BookId) -> Result<BookAvailabilityView, LedgerError> {
        self.ledger.get_availability(book_id).await
    }

    pub async fn list_open_loans(&self, book_id: &BookId) -> Result<Vec<LoanRecord>, LedgerError> {
        // Surface unknown titles instead of an empty list
        self.ledger.get_book(book_id).await?;
        Ok(self.loans.list_open_loans(book_id).await?)
    }

    /// Compare a title's borrowed counter with its open loans, and each of
    /// its loans' fine totals with the fines on record. Read-only.
    pub async fn reconcile(&self, book_id: &BookId) -> Result<ReconciliationReport, ReportError> {
        let book = self.ledger.get_book(book_id).await?;
        let loans = self.loans.loans_for_book(book_id).await?;
        let open_loans = loans.iter().filter(|loan| loan.is_open()).count() as u32;

        let mut unbalanced_fines = Vec::new();
        for loan in &loans {
            let recorded: Decimal = self
                .fines
                .fines_for_loan(&loan.id)
                .await?
                .iter()
                .map(|fine| fine.total_amount)
                .sum();
            if recorded != loan.fine_amount {
                warn!(
                    loan_id = %loan.id,
                    fine_amount = %loan.fine_amount,
                    recorded = %recorded,
                    "Loan fine total does not match its fines"
                );
                unbalanced_fines.push(loan.id.clone());
            }
        }

        let report = ReconciliationReport {
            book_id: book_id.clone(),
            recorded_borrowed: book.currently_borrowed,
            open_loans,
            drift: i64::from(book.currently_borrowed) - i64::from(open_loans),
            unbalanced_fines,
        };

        if report.drift != 0 {
            warn!(
                book_id = %book_id,
                recorded_borrowed = report.recorded_borrowed,
                open_loans = report.open_loans,
                "Catalog counter drift detected"
            );
        }

        Ok(report)
    }

    pub async fn summary(&self, now: DateTime<Utc>) -> Result<CirculationSummary, ReportError> {
        let books = self.ledger.list_books().await?;
        let loans = self.loans.list_loans().await?;
        let fines = self.fines.list_fines().await?;

        let unpaid: Vec<_> = fines.iter().filter(|fine| !fine.is_paid()).collect();

        Ok(CirculationSummary {
            titles: books.len(),
            copies: books.iter().map(|b| u64::from(b.quantity)).sum(),
            available_copies: books.iter().map(|b| u64::from(b.available_quantity)).sum(),
            open_loans: loans.iter().filter(|l| l.is_open()).count(),
            overdue_loans: loans
                .iter()
                .filter(|l| l.standing(now) == LoanStanding::Overdue)
                .count(),
            unpaid_fines: unpaid.len(),
            outstanding_fines: unpaid.iter().map(|fine| fine.total_amount).sum(),
        })
    }

    /// Log reconciliation drift for every title. Returns the inconsistent reports.
    pub async fn audit(&self) -> Result<Vec<ReconciliationReport>, ReportError> {
        let mut drifted = Vec::new();
        for book in self.ledger.list_books().await? {
            let report = self.reconcile(&book.id).await?;
            if !report.is_consistent() {
                drifted.push(report);
            }
        }

        info!(drifted = drifted.len(), "Catalog audit finished");

        Ok(drifted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as Days, TimeZone};
    use rust_decimal_macros::dec;
    use std::time::Duration;

    use crate::directory::{NewAccount, StoreDirectory};
    use crate::ledger::NewBook;
    use crate::record::{FineReason, FineStatus, Role};
    use crate::retry::RetryPolicy;
    use crate::store::testing::FaultyStore;
    use crate::store::Collection;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
    }

    async fn service() -> (CirculationService, Arc<FaultyStore>) {
        let store = Arc::new(FaultyStore::new());
        let config = CirculationConfig::new("/unused".into())
            .with_retry(RetryPolicy::new(3, Duration::from_millis(1)))
            .with_store_timeout(Duration::from_millis(200));

        let directory = StoreDirectory::new(store.clone(), config.store_timeout);
        for (id, role) in [("reader", Role::User), ("staff", Role::Librarian)] {
            directory
                .register(NewAccount {
                    id: Some(BorrowerId::new(id)),
                    name: id.to_string(),
                    email: format!("{id}@library.test"),
                    role,
                })
                .await
                .unwrap();
        }

        let service = CirculationService::new(store.clone(), Arc::new(directory), &config);
        service
            .ledger()
            .add_book(NewBook {
                id: Some(BookId::new("sicp")),
                isbn13: "978-0-262-03384-8".to_string(),
                title: "Structure and Interpretation of Computer Programs".to_string(),
                authors: vec!["Abelson".to_string(), "Sussman".to_string()],
                quantity: 2,
            })
            .await
            .unwrap();

        (service, store)
    }

    #[tokio::test]
    async fn test_default_due_date() {
        let (service, _) = service().await;
        let loan = service
            .issue_book(&BookId::new("sicp"), &BorrowerId::new("reader"), None, t0())
            .await
            .unwrap();
        assert_eq!(loan.due_date, t0() + Days::days(14));
    }

    #[tokio::test]
    async fn test_manual_fine_requires_staff() {
        let (service, _) = service().await;
        let loan = service
            .issue_book(&BookId::new("sicp"), &BorrowerId::new("reader"), None, t0())
            .await
            .unwrap();
        let terms = FineTerms::manual(dec!(12.00), FineReason::Damage);

        let err = service
            .assess_fine(&loan.id, &terms, &BorrowerId::new("reader"), t0())
            .await
            .unwrap_err();
        assert!(matches!(err, FineError::NotAuthorized(_)));

        let fine = service
            .assess_fine(&loan.id, &terms, &BorrowerId::new("staff"), t0())
            .await
            .unwrap();
        assert_eq!(fine.total_amount, dec!(12.00));
        assert_eq!(fine.reason, FineReason::Damage);
        assert_eq!(fine.status, FineStatus::Unpaid);

        let loan = service.loans().get_loan(&loan.id).await.unwrap().unwrap();
        assert_eq!(loan.fine_amount, dec!(12.00));
    }

    #[tokio::test]
    async fn test_fine_for_unknown_loan() {
        let (service, _) = service().await;
        let terms = FineTerms::late_return(dec!(0.50));
        let err = service
            .assess_fine(&LoanId::new("nope"), &terms, &BorrowerId::new("reader"), t0())
            .await
            .unwrap_err();
        assert!(matches!(err, FineError::LoanNotFound(_)));
    }

    #[tokio::test]
    async fn test_reconcile_reports_drift() {
        let (service, store) = service().await;
        let book = BookId::new("sicp");
        service
            .issue_book(&book, &BorrowerId::new("reader"), None, t0())
            .await
            .unwrap();

        let report = service.reconcile(&book).await.unwrap();
        assert!(report.is_consistent());
        assert_eq!((report.recorded_borrowed, report.open_loans), (1, 1));

        // Simulate a lost compensation: counter bumped with no loan behind it
        service.ledger().reserve_copy(&book).await.unwrap();
        let report = service.reconcile(&book).await.unwrap();
        assert_eq!(report.drift, 1);

        let drifted = service.audit().await.unwrap();
        assert_eq!(drifted, vec![report]);

        // Nothing was repaired by the audit
        let books: Collection<crate::record::BookRecord> =
            Collection::new(store, Duration::from_secs(1));
        assert_eq!(books.get("sicp").await.unwrap().document.currently_borrowed, 2);
    }

    #[tokio::test]
    async fn test_unrecorded_loan_total_is_reported() {
        let (service, store) = service().await;
        let book = BookId::new("sicp");
        let loan = service
            .issue_book(&book, &BorrowerId::new("reader"), None, t0())
            .await
            .unwrap();
        let terms = FineTerms::manual(dec!(12.00), FineReason::Damage);

        store.fail_updates("loans", 10);
        let fine = service
            .assess_fine(&loan.id, &terms, &BorrowerId::new("staff"), t0())
            .await
            .unwrap();
        store.fail_updates("loans", 0);

        let stored = service.loans().get_loan(&loan.id).await.unwrap().unwrap();
        assert_eq!(stored.fine_amount, Decimal::ZERO);

        let report = service.reconcile(&book).await.unwrap();
        assert_eq!(report.drift, 0);
        assert_eq!(report.unbalanced_fines, vec![loan.id.clone()]);
        assert!(!report.is_consistent());
        assert_eq!(service.audit().await.unwrap(), vec![report]);

        // Recording the same fine again counts it once
        service.loans().record_fine(&fine).await.unwrap();
        service.loans().record_fine(&fine).await.unwrap();
        let stored = service.loans().get_loan(&loan.id).await.unwrap().unwrap();
        assert_eq!(stored.fine_amount, dec!(12.00));
        assert!(service.reconcile(&book).await.unwrap().is_consistent());
    }

    #[tokio::test]
    async fn test_lost_acknowledgement_does_not_double_loan_total() {
        let (service, store) = service().await;
        let loan = service
            .issue_book(&BookId::new("sicp"), &BorrowerId::new("reader"), None, t0())
            .await
            .unwrap();

        store.lose_update_acks("loans", 1);
        service
            .assess_fine(
                &loan.id,
                &FineTerms::manual(dec!(3.00), FineReason::Other),
                &BorrowerId::new("staff"),
                t0(),
            )
            .await
            .unwrap();

        let stored = service.loans().get_loan(&loan.id).await.unwrap().unwrap();
        assert_eq!(stored.fine_amount, dec!(3.00));
        assert!(service.reconcile(&BookId::new("sicp")).await.unwrap().is_consistent());
    }

    #[tokio::test]
    async fn test_late_return_balances_loan_total() {
        let (service, _) = service().await;
        let book = BookId::new("sicp");
        let due = t0() + Days::days(7);
        let loan = service
            .issue_book(&book, &BorrowerId::new("reader"), Some(due), t0())
            .await
            .unwrap();

        service.return_book(&loan.id, due + Days::days(2)).await.unwrap();
        let report = service.reconcile(&book).await.unwrap();
        assert!(report.is_consistent(), "{report:?}");
    }

    #[tokio::test]
    async fn test_summary_counts() {
        let (service, _) = service().await;
        let book = BookId::new("sicp");
        let due = t0() + Days::days(7);
        let loan = service
            .issue_book(&book, &BorrowerId::new("reader"), Some(due), t0())
            .await
            .unwrap();
        service
            .issue_book(&book, &BorrowerId::new("staff"), Some(due), t0())
            .await
            .unwrap();

        let summary = service.summary(due + Days::days(1)).await.unwrap();
        assert_eq!(summary.titles, 1);
        assert_eq!(summary.copies, 2);
        assert_eq!(summary.available_copies, 0);
        assert_eq!(summary.open_loans, 2);
        assert_eq!(summary.overdue_loans, 2);

        service.return_book(&loan.id, due + Days::days(3)).await.unwrap();
        let summary = service.summary(due + Days::days(3)).await.unwrap();
        assert_eq!(summary.open_loans, 1);
        assert_eq!(summary.unpaid_fines, 1);
        assert_eq!(summary.outstanding_fines, dec!(1.50));
    }

    #[tokio::test]
    async fn test_store_timeout_surfaces_as_persistence_failure() {
        let (service, store) = service().await;
        store.set_latency(Duration::from_millis(500));

        let err = service
            .issue_book(&BookId::new("sicp"), &BorrowerId::new("reader"), None, t0())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            IssueError::PersistenceFailure(StoreError::Unavailable(_))
        ));
    }
}
