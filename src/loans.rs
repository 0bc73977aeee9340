//! Loan manager: issuing and returning books.
//!
//! Issue and return each span two documents (the loan and the book
//! counters) and the store offers no multi-document transaction, so both
//! run as small sagas:
//!
//! - issue: claim a slot in the borrower's holdings, reserve a copy, then
//!   create the loan; each step that fails undoes the ones before it.
//! - return: close the loan with a conditioned write, then release the copy;
//!   if the release fails the loan is reopened. A closed loan therefore
//!   always means its copy is back on the shelf.
//!
//! The holdings claim is a conditioned write on one document per borrower,
//! so concurrent issues for the same borrower cannot both pass the
//! one-copy-per-title and open-loan limit checks.
//!
//! Whatever drift a failed compensation leaves behind is visible through
//! [`LoanManager::list_open_loans`] and the ledger's counters.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::directory::{DirectoryError, UserDirectory};
use crate::fines::{self, FineEngine, FineError, FineTerms};
use crate::ledger::{CatalogLedger, LedgerError};
use crate::record::{BookId, BorrowerHoldings, BorrowerId, FineRecord, LoanId, LoanRecord};
use crate::retry::RetryPolicy;
use crate::store::{Collection, DocumentStore, StoreError, Stored};

/// Errors from issuing a book.
#[derive(Error, Debug)]
pub enum IssueError {
    #[error("Due date must be after issue date (issued {issue_date}, due {due_date})")]
    InvalidDueDate {
        issue_date: DateTime<Utc>,
        due_date: DateTime<Utc>,
    },

    #[error("Borrower not found: {0}")]
    BorrowerNotFound(BorrowerId),

    #[error("Borrower {0} is suspended")]
    BorrowerSuspended(BorrowerId),

    #[error("Borrower {borrower_id} already has book {book_id} on loan")]
    AlreadyBorrowed {
        borrower_id: BorrowerId,
        book_id: BookId,
    },

    #[error("Borrower {borrower_id} has reached the limit of {limit} open loans")]
    LoanLimitReached { borrower_id: BorrowerId, limit: usize },

    #[error("Book not found: {0}")]
    BookNotFound(BookId),

    #[error("Book {0} is out of stock")]
    OutOfStock(BookId),

    #[error("Book {0} is on hold")]
    BookOnHold(BookId),

    #[error("Book {0} has been withdrawn from circulation")]
    BookWithdrawn(BookId),

    #[error("Could not record the loan: {0}")]
    PersistenceFailure(#[source] StoreError),

    #[error("Directory error: {0}")]
    Directory(#[source] DirectoryError),

    #[error("Unexpected catalog error: {0}")]
    Ledger(#[source] LedgerError),
}

impl IssueError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::PersistenceFailure(e) if e.is_retryable())
    }
}

impl From<LedgerError> for IssueError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::NotFound(id) => Self::BookNotFound(id),
            LedgerError::OutOfStock(id) => Self::OutOfStock(id),
            LedgerError::OnHold(id) => Self::BookOnHold(id),
            LedgerError::Withdrawn(id) => Self::BookWithdrawn(id),
            LedgerError::PersistenceFailure { source, .. } | LedgerError::Store(source) => {
                Self::PersistenceFailure(source)
            }
            other => Self::Ledger(other),
        }
    }
}

impl From<DirectoryError> for IssueError {
    fn from(err: DirectoryError) -> Self {
        match err {
            DirectoryError::NotFound(id) => Self::BorrowerNotFound(id),
            DirectoryError::Unavailable(source) => Self::PersistenceFailure(source),
            other => Self::Directory(other),
        }
    }
}

/// Errors from returning a book.
#[derive(Error, Debug)]
pub enum ReturnError {
    #[error("Loan not found: {0}")]
    NotFound(LoanId),

    #[error("Loan {0} has already been returned")]
    AlreadyReturned(LoanId),

    #[error("Could not record the return: {0}")]
    PersistenceFailure(#[source] StoreError),

    #[error("Catalog rejected the return of loan {loan_id}: {source}")]
    Ledger {
        loan_id: LoanId,
        #[source]
        source: LedgerError,
    },

    #[error("Loan {loan_id} was returned but its fine could not be recorded: {source}")]
    FineNotRecorded {
        loan_id: LoanId,
        #[source]
        source: FineError,
    },
}

impl ReturnError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::PersistenceFailure(e) if e.is_retryable())
    }
}

/// Outcome of a successful return.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Returned {
    pub loan: LoanRecord,

    /// Fine assessed because the book came back late.
    pub fine: Option<FineRecord>,
}

/// What the close step of a return found.
enum Closing {
    /// Closed now: the loan as read, as written, and its new version.
    Closed {
        original: LoanRecord,
        closed: LoanRecord,
        version: u64,
    },

    /// Closed by an earlier return.
    AlreadyClosed(LoanRecord),
}

fn is_late(loan: &LoanRecord) -> bool {
    loan.return_date.is_some_and(|returned| returned > loan.due_date)
}

/// Borrowing rules applied on issue and return.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoanPolicy {
    pub max_open_loans: usize,
    pub fine_rate_per_day: Decimal,
}

/// Owner of every [`LoanRecord`].
#[derive(Clone)]
pub struct LoanManager {
    loans: Collection<LoanRecord>,
    holdings: Collection<BorrowerHoldings>,
    ledger: CatalogLedger,
    fines: FineEngine,
    directory: Arc<dyn UserDirectory>,
    policy: LoanPolicy,
    retry: RetryPolicy,
}

impl LoanManager {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        timeout: Duration,
        ledger: CatalogLedger,
        fines: FineEngine,
        directory: Arc<dyn UserDirectory>,
        policy: LoanPolicy,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            loans: Collection::new(store.clone(), timeout),
            holdings: Collection::new(store, timeout),
            ledger,
            fines,
            directory,
            policy,
            retry,
        }
    }

    /// Lend one copy of `book_id` to `borrower_id` until `due_date`.
    pub async fn issue_book(
        &self,
        book_id: &BookId,
        borrower_id: &BorrowerId,
        due_date: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<LoanRecord, IssueError> {
        if due_date <= now {
            return Err(IssueError::InvalidDueDate {
                issue_date: now,
                due_date,
            });
        }

        let profile = self.directory.lookup(borrower_id).await?;
        if profile.is_suspended {
            return Err(IssueError::BorrowerSuspended(borrower_id.clone()));
        }

        let loan = LoanRecord::open(book_id.clone(), borrower_id.clone(), now, due_date);
        self.claim_slot(&loan, now).await?;

        if let Err(err) = self.ledger.reserve_copy(book_id).await {
            self.release_slot(&loan).await;
            return Err(err.into());
        }

        if let Err(err) = self.persist_new(&loan).await {
            warn!(
                loan_id = %loan.id,
                book_id = %book_id,
                error = %err,
                "Loan write failed, releasing reserved copy"
            );
            self.release_after_failed_issue(book_id).await;
            self.release_slot(&loan).await;
            return Err(IssueError::PersistenceFailure(err));
        }

        info!(
            loan_id = %loan.id,
            book_id = %book_id,
            borrower_id = %borrower_id,
            due_date = %loan.due_date,
            "Issued book"
        );

        Ok(loan)
    }

    /// Create the loan document, retrying only when the store was unreachable.
    ///
    /// A timed-out create may still have landed, so before giving up the
    /// loan id is looked up once more.
    async fn persist_new(&self, loan: &LoanRecord) -> Result<(), StoreError> {
        let loans = &self.loans;
        let outcome = self
            .retry
            .run(
                "create_loan",
                |e: &StoreError| matches!(e, StoreError::Unavailable(_)),
                move || async move { loans.create(loan).await },
            )
            .await;

        match outcome {
            Ok(_) => Ok(()),
            Err((err, _)) => match self.loans.find(loan.id.as_str()).await {
                Ok(Some(_)) => {
                    debug!(loan_id = %loan.id, "Loan write landed despite error");
                    Ok(())
                }
                _ => Err(err),
            },
        }
    }

    /// Reserve the borrower's slot for `loan.book_id`, enforcing one open
    /// loan per title and the open-loan limit.
    async fn claim_slot(&self, loan: &LoanRecord, now: DateTime<Utc>) -> Result<(), IssueError> {
        self.retry
            .run("claim_slot", IssueError::is_retryable, || self.try_claim(loan, now))
            .await
            .map_err(|(err, _)| err)
    }

    async fn try_claim(&self, loan: &LoanRecord, now: DateTime<Utc>) -> Result<(), IssueError> {
        let borrower_id = &loan.borrower_id;
        let book_id = &loan.book_id;

        let found = self
            .holdings
            .find(borrower_id.as_str())
            .await
            .map_err(IssueError::PersistenceFailure)?;
        let (mut holdings, version) = match found {
            Some(Stored { version, document }) => (document, Some(version)),
            None => {
                let open = self
                    .open_loans_for_borrower(borrower_id)
                    .await
                    .map_err(IssueError::PersistenceFailure)?;
                (BorrowerHoldings::from_open_loans(borrower_id.clone(), &open), None)
            }
        };

        // An earlier attempt landed before its acknowledgement was lost
        if holdings.is_claimed_by(book_id, &loan.id) {
            return Ok(());
        }

        self.prune(&mut holdings, now)
            .await
            .map_err(IssueError::PersistenceFailure)?;

        if holdings.holds(book_id) {
            return Err(IssueError::AlreadyBorrowed {
                borrower_id: borrower_id.clone(),
                book_id: book_id.clone(),
            });
        }
        if holdings.count() >= self.policy.max_open_loans {
            return Err(IssueError::LoanLimitReached {
                borrower_id: borrower_id.clone(),
                limit: self.policy.max_open_loans,
            });
        }

        holdings.claim(book_id.clone(), loan.id.clone(), now);
        match version {
            Some(version) => self.holdings.update(&holdings, version).await,
            None => self.holdings.create(&holdings).await,
        }
        .map_err(IssueError::PersistenceFailure)?;

        debug!(loan_id = %loan.id, held = holdings.count(), "Claimed holding slot");
        Ok(())
    }

    /// Drop slots whose loan has been returned, or whose loan was never
    /// written and whose claim is past its grace period.
    async fn prune(&self, holdings: &mut BorrowerHoldings, now: DateTime<Utc>) -> Result<(), StoreError> {
        let mut stale = Vec::new();
        for (book_id, holding) in &holdings.loans {
            let gone = match self.loans.find(holding.loan_id.as_str()).await? {
                Some(stored) => !stored.document.is_open(),
                None => BorrowerHoldings::is_abandoned(holding, now),
            };
            if gone {
                stale.push(book_id.clone());
            }
        }

        for book_id in stale {
            if let Some(holding) = holdings.loans.remove(&book_id) {
                debug!(loan_id = %holding.loan_id, book_id = %book_id, "Pruned stale holding");
            }
        }
        Ok(())
    }

    /// Give up the slot held by `loan`. Failures are logged; a slot left
    /// behind is pruned on the borrower's next issue.
    async fn release_slot(&self, loan: &LoanRecord) {
        let holdings = &self.holdings;
        let outcome = self
            .retry
            .run("release_slot", StoreError::is_retryable, move || async move {
                let Some(Stored {
                    version,
                    mut document,
                }) = holdings.find(loan.borrower_id.as_str()).await?
                else {
                    return Ok(());
                };
                if document.release(&loan.book_id, &loan.id) {
                    holdings.update(&document, version).await?;
                }
                Ok(())
            })
            .await;

        if let Err((e, _)) = outcome {
            error!(
                loan_id = %loan.id,
                borrower_id = %loan.borrower_id,
                error = %e,
                "Could not release holding slot"
            );
        }
    }

    async fn release_after_failed_issue(&self, book_id: &BookId) {
        match self.ledger.release_copy(book_id).await {
            Ok(_) => info!(book_id = %book_id, "Released copy after failed issue"),
            Err(e) => error!(
                book_id = %book_id,
                error = %e,
                "Could not release copy after failed issue; catalog needs reconciliation"
            ),
        }
    }

    /// Take back the copy lent under `loan_id`.
    ///
    /// A fine is assessed at the configured rate when the book comes back
    /// after its due date. Returning a loan again completes a late fine
    /// that an earlier return closed the loan for but could not record.
    pub async fn return_book(
        &self,
        loan_id: &LoanId,
        now: DateTime<Utc>,
    ) -> Result<Returned, ReturnError> {
        let terms = FineTerms::late_return(self.policy.fine_rate_per_day);

        let closing = self
            .retry
            .run("close_loan", ReturnError::is_retryable, || {
                self.try_close(loan_id, &terms, now)
            })
            .await
            .map_err(|(err, _)| err)?;

        let (original, closed, version) = match closing {
            Closing::Closed {
                original,
                closed,
                version,
            } => (original, closed, version),
            Closing::AlreadyClosed(loan) => return self.complete_late_fine(loan, &terms, now).await,
        };

        if let Err(err) = self.ledger.release_copy(&closed.book_id).await {
            warn!(
                loan_id = %loan_id,
                book_id = %closed.book_id,
                error = %err,
                "Copy release failed, reopening loan"
            );
            self.reopen(&original, version).await;

            return Err(match err {
                LedgerError::PersistenceFailure { source, .. } | LedgerError::Store(source) => {
                    ReturnError::PersistenceFailure(source)
                }
                other => ReturnError::Ledger {
                    loan_id: loan_id.clone(),
                    source: other,
                },
            });
        }

        self.release_slot(&closed).await;

        info!(
            loan_id = %loan_id,
            book_id = %closed.book_id,
            late = is_late(&closed),
            "Returned book"
        );

        let fine = if is_late(&closed) {
            Some(self.assess_late_fine(&closed, &terms, now).await?)
        } else {
            None
        };

        Ok(Returned { loan: closed, fine })
    }

    async fn assess_late_fine(
        &self,
        closed: &LoanRecord,
        terms: &FineTerms,
        now: DateTime<Utc>,
    ) -> Result<FineRecord, ReturnError> {
        self.fines
            .assess_late_fine(closed, terms, now)
            .await
            .map_err(|source| {
                error!(
                    loan_id = %closed.id,
                    error = %source,
                    "Late fine not recorded; return the loan again to complete it"
                );
                ReturnError::FineNotRecorded {
                    loan_id: closed.id.clone(),
                    source,
                }
            })
    }

    /// Finish a late return whose fine never landed; otherwise the loan
    /// was simply returned already.
    async fn complete_late_fine(
        &self,
        loan: LoanRecord,
        terms: &FineTerms,
        now: DateTime<Utc>,
    ) -> Result<Returned, ReturnError> {
        if !is_late(&loan) {
            return Err(ReturnError::AlreadyReturned(loan.id));
        }

        let recorded = self
            .fines
            .late_fine(&loan.id)
            .await
            .map_err(|source| ReturnError::FineNotRecorded {
                loan_id: loan.id.clone(),
                source,
            })?;
        if recorded.is_some() {
            return Err(ReturnError::AlreadyReturned(loan.id));
        }

        warn!(loan_id = %loan.id, "Completing late fine of an earlier return");
        let fine = self.assess_late_fine(&loan, terms, now).await?;

        Ok(Returned {
            loan,
            fine: Some(fine),
        })
    }

    /// Conditioned close.
    async fn try_close(
        &self,
        loan_id: &LoanId,
        terms: &FineTerms,
        now: DateTime<Utc>,
    ) -> Result<Closing, ReturnError> {
        let Stored { version, document } = self.load(loan_id).await?;

        if !document.is_open() {
            return Ok(Closing::AlreadyClosed(document));
        }

        let mut closed = document.clone();
        let fine = if now > closed.due_date {
            // Invalid terms are reported by the fine engine after the release
            fines::quote(&closed, terms, now)
                .map(|q| q.total_amount)
                .unwrap_or(Decimal::ZERO)
        } else {
            Decimal::ZERO
        };
        closed.close(now, fine);

        let version = self
            .loans
            .update(&closed, version)
            .await
            .map_err(ReturnError::PersistenceFailure)?;

        Ok(Closing::Closed {
            original: document,
            closed,
            version,
        })
    }

    /// Undo a close whose copy could not be released.
    async fn reopen(&self, original: &LoanRecord, closed_version: u64) {
        match self.loans.update(original, closed_version).await {
            Ok(_) => info!(loan_id = %original.id, "Reopened loan after failed release"),
            Err(e) => error!(
                loan_id = %original.id,
                book_id = %original.book_id,
                error = %e,
                "Could not reopen loan after failed release; catalog needs reconciliation"
            ),
        }
    }

    /// Add a separately assessed fine to a loan's running total.
    ///
    /// The fine id is remembered on the loan, so a retried write whose
    /// acknowledgement was lost does not count the fine twice.
    pub async fn record_fine(&self, fine: &FineRecord) -> Result<LoanRecord, StoreError> {
        let loans = &self.loans;
        let loan = self
            .retry
            .run("record_fine", StoreError::is_retryable, move || async move {
                let Stored {
                    version,
                    mut document,
                } = loans.get(fine.loan_id.as_str()).await?;
                if document.charge(&fine.id, fine.total_amount) {
                    loans.update(&document, version).await?;
                }
                Ok(document)
            })
            .await
            .map_err(|(err, _)| err)?;

        debug!(loan_id = %loan.id, fine_amount = %loan.fine_amount, "Recorded fine on loan");

        Ok(loan)
    }

    async fn load(&self, loan_id: &LoanId) -> Result<Stored<LoanRecord>, ReturnError> {
        self.loans.get(loan_id.as_str()).await.map_err(|e| {
            if e.is_not_found() {
                ReturnError::NotFound(loan_id.clone())
            } else {
                ReturnError::PersistenceFailure(e)
            }
        })
    }

    pub async fn get_loan(&self, loan_id: &LoanId) -> Result<Option<LoanRecord>, StoreError> {
        Ok(self
            .loans
            .find(loan_id.as_str())
            .await?
            .map(|stored| stored.document))
    }

    /// Loans of `book_id` not yet returned.
    pub async fn list_open_loans(&self, book_id: &BookId) -> Result<Vec<LoanRecord>, StoreError> {
        Ok(self
            .loans_for_book(book_id)
            .await?
            .into_iter()
            .filter(LoanRecord::is_open)
            .collect())
    }

    /// Every loan of `book_id`, oldest first.
    pub async fn loans_for_book(&self, book_id: &BookId) -> Result<Vec<LoanRecord>, StoreError> {
        let mut loans: Vec<_> = self
            .loans
            .query("bookId", book_id.as_str())
            .await?
            .into_iter()
            .map(|stored| stored.document)
            .collect();
        loans.sort_by_key(|loan| loan.issue_date);
        Ok(loans)
    }

    /// Every loan of `borrower_id`, oldest first.
    pub async fn loans_for_borrower(
        &self,
        borrower_id: &BorrowerId,
    ) -> Result<Vec<LoanRecord>, StoreError> {
        let mut loans: Vec<_> = self
            .loans
            .query("borrowerId", borrower_id.as_str())
            .await?
            .into_iter()
            .map(|stored| stored.document)
            .collect();
        loans.sort_by_key(|loan| loan.issue_date);
        Ok(loans)
    }

    async fn open_loans_for_borrower(
        &self,
        borrower_id: &BorrowerId,
    ) -> Result<Vec<LoanRecord>, StoreError> {
        Ok(self
            .loans_for_borrower(borrower_id)
            .await?
            .into_iter()
            .filter(LoanRecord::is_open)
            .collect())
    }

    pub async fn list_loans(&self) -> Result<Vec<LoanRecord>, StoreError> {
        Ok(self
            .loans
            .list()
            .await?
            .into_iter()
            .map(|stored| stored.document)
            .collect())
    }
}
