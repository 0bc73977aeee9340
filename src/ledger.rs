//! Catalog ledger: authoritative copy counts per title.
//!
//! Every counter change is a read-modify-write conditioned on the version
//! that was read. A lost race shows up as a store conflict and the whole
//! read-modify-write is retried under the configured [`RetryPolicy`];
//! a title can therefore never be double-decremented or go negative.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::record::{BookAvailabilityView, BookId, BookRecord, CopyError};
use crate::retry::RetryPolicy;
use crate::store::{Collection, DocumentStore, StoreError, Stored};

/// Errors from catalog ledger operations.
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Book not found: {0}")]
    NotFound(BookId),

    #[error("Book {0} already exists in the catalog")]
    Duplicate(BookId),

    #[error("Invalid book: {0}")]
    Invalid(String),

    #[error("Book {0} is out of stock")]
    OutOfStock(BookId),

    #[error("Book {0} is on hold")]
    OnHold(BookId),

    #[error("Book {0} has been withdrawn from circulation")]
    Withdrawn(BookId),

    #[error("Book {0} has no borrowed copies to release")]
    InvalidState(BookId),

    #[error("Catalog write for book {book_id} failed after {attempts} attempts: {source}")]
    PersistenceFailure {
        book_id: BookId,
        attempts: u32,
        #[source]
        source: StoreError,
    },

    #[error("Catalog storage error: {0}")]
    Store(#[from] StoreError),
}

impl LedgerError {
    fn from_copy(book_id: &BookId, err: CopyError) -> Self {
        let book_id = book_id.clone();
        match err {
            CopyError::OutOfStock => Self::OutOfStock(book_id),
            CopyError::OnHold => Self::OnHold(book_id),
            CopyError::Withdrawn => Self::Withdrawn(book_id),
            CopyError::NoneBorrowed => Self::InvalidState(book_id),
        }
    }

    fn is_retryable(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_retryable())
    }
}

pub type Result<T> = std::result::Result<T, LedgerError>;

/// A title to add to the catalog.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewBook {
    /// Caller-chosen id; generated when absent.
    #[serde(default)]
    pub id: Option<BookId>,
    pub isbn13: String,
    pub title: String,
    #[serde(default)]
    pub authors: Vec<String>,
    pub quantity: u32,
}

/// Normalize an ISBN-13 to bare digits and verify its check digit.
fn normalize_isbn13(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(|c| *c != '-' && *c != ' ').collect();
    if digits.len() != 13 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }

    let checksum: u32 = digits
        .chars()
        .filter_map(|c| c.to_digit(10))
        .enumerate()
        .map(|(i, d)| if i % 2 == 0 { d } else { d * 3 })
        .sum();

    (checksum % 10 == 0).then_some(digits)
}

/// Owner of every [`BookRecord`].
#[derive(Clone)]
pub struct CatalogLedger {
    books: Collection<BookRecord>,
    retry: RetryPolicy,
}

impl CatalogLedger {
    pub fn new(store: Arc<dyn DocumentStore>, timeout: Duration, retry: RetryPolicy) -> Self {
        Self {
            books: Collection::new(store, timeout),
            retry,
        }
    }

    /// Add a title with all copies on the shelf.
    pub async fn add_book(&self, new: NewBook) -> Result<BookRecord> {
        if new.quantity == 0 {
            return Err(LedgerError::Invalid("quantity must be at least 1".to_string()));
        }
        if new.title.trim().is_empty() {
            return Err(LedgerError::Invalid("title is required".to_string()));
        }
        let isbn13 = normalize_isbn13(&new.isbn13)
            .ok_or_else(|| LedgerError::Invalid(format!("invalid ISBN-13: {}", new.isbn13)))?;

        let book = BookRecord::new(
            new.id.unwrap_or_else(BookId::generate),
            isbn13,
            new.title.trim(),
            new.authors,
            new.quantity,
        );

        match self.books.create(&book).await {
            Ok(_) => {}
            Err(StoreError::Conflict { .. }) => return Err(LedgerError::Duplicate(book.id)),
            Err(e) => return Err(e.into()),
        }

        info!(book_id = %book.id, quantity = book.quantity, "Added book to catalog");

        Ok(book)
    }

    pub async fn get_book(&self, book_id: &BookId) -> Result<BookRecord> {
        Ok(self.load(book_id).await?.document)
    }

    pub async fn list_books(&self) -> Result<Vec<BookRecord>> {
        let books = self.books.list().await?;
        Ok(books.into_iter().map(|stored| stored.document).collect())
    }

    /// Read-only snapshot of a title's counters.
    pub async fn get_availability(&self, book_id: &BookId) -> Result<BookAvailabilityView> {
        Ok(self.get_book(book_id).await?.availability())
    }

    /// Take one copy for a loan.
    pub async fn reserve_copy(&self, book_id: &BookId) -> Result<BookRecord> {
        let book = self
            .mutate(book_id, "reserve_copy", |book| {
                book.take_copy()
                    .map_err(|e| LedgerError::from_copy(&book.id, e))
            })
            .await?;

        debug!(
            book_id = %book_id,
            available = book.available_quantity,
            borrowed = book.currently_borrowed,
            "Reserved copy"
        );

        Ok(book)
    }

    /// Put one borrowed copy back.
    pub async fn release_copy(&self, book_id: &BookId) -> Result<BookRecord> {
        let book = self
            .mutate(book_id, "release_copy", |book| {
                book.return_copy()
                    .map_err(|e| LedgerError::from_copy(&book.id, e))
            })
            .await?;

        debug!(
            book_id = %book_id,
            available = book.available_quantity,
            borrowed = book.currently_borrowed,
            "Released copy"
        );

        Ok(book)
    }

    /// Add newly acquired copies.
    pub async fn restock(&self, book_id: &BookId, additional: u32) -> Result<BookRecord> {
        if additional == 0 {
            return Err(LedgerError::Invalid(
                "restock must add at least one copy".to_string(),
            ));
        }

        let book = self
            .mutate(book_id, "restock", |book| {
                book.add_copies(additional);
                Ok(())
            })
            .await?;

        info!(book_id = %book_id, added = additional, quantity = book.quantity, "Restocked book");

        Ok(book)
    }

    /// Take a title out of circulation. Outstanding loans can still be returned.
    pub async fn withdraw(&self, book_id: &BookId) -> Result<BookRecord> {
        let book = self
            .mutate(book_id, "withdraw", |book| {
                book.withdraw();
                Ok(())
            })
            .await?;

        info!(book_id = %book_id, outstanding = book.currently_borrowed, "Withdrew book");

        Ok(book)
    }

    /// Place or lift a staff hold.
    pub async fn set_hold(&self, book_id: &BookId, held: bool) -> Result<BookRecord> {
        let book = self
            .mutate(book_id, "set_hold", |book| {
                if book.status == crate::record::BookStatus::Unavailable {
                    return Err(LedgerError::Withdrawn(book.id.clone()));
                }
                book.set_hold(held);
                Ok(())
            })
            .await?;

        info!(book_id = %book_id, held, status = ?book.status, "Updated hold");

        Ok(book)
    }

    async fn load(&self, book_id: &BookId) -> Result<Stored<BookRecord>> {
        self.books.get(book_id.as_str()).await.map_err(|e| {
            if e.is_not_found() {
                LedgerError::NotFound(book_id.clone())
            } else {
                e.into()
            }
        })
    }

    /// Conditioned read-modify-write with bounded retry.
    ///
    /// Each call carries one change token across its retries. A write whose
    /// acknowledgement was lost is recognised by its token on the next
    /// attempt and not applied twice.
    async fn mutate<F>(&self, book_id: &BookId, what: &str, apply: F) -> Result<BookRecord>
    where
        F: Fn(&mut BookRecord) -> Result<()>,
    {
        let token = Uuid::new_v4().to_string();
        self.retry
            .run(what, LedgerError::is_retryable, || {
                self.try_mutate(book_id, &token, &apply)
            })
            .await
            .map_err(|(err, attempts)| match err {
                LedgerError::Store(source) if source.is_retryable() => {
                    LedgerError::PersistenceFailure {
                        book_id: book_id.clone(),
                        attempts,
                        source,
                    }
                }
                other => other,
            })
    }

    async fn try_mutate<F>(&self, book_id: &BookId, token: &str, apply: &F) -> Result<BookRecord>
    where
        F: Fn(&mut BookRecord) -> Result<()>,
    {
        let Stored {
            version,
            mut document,
        } = self.load(book_id).await?;

        if document.has_change(token) {
            debug!(book_id = %book_id, token, "Change already applied");
            return Ok(document);
        }

        apply(&mut document)?;
        debug_assert!(document.is_consistent(), "book counters out of balance");
        document.record_change(token);

        self.books.update(&document, version).await?;
        Ok(document)
    }
}
