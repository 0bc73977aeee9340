//! Book records and copy accounting.
//!
//! A book record counts copies of one title. The counters always satisfy
//! `available_quantity + currently_borrowed == quantity`; the transitions
//! below are the only way they change.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::BookId;
use crate::store::Document;

/// Circulation status of a title.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookStatus {
    /// At least one copy is on the shelf.
    #[default]
    Available,

    /// Every copy is out on loan.
    Borrowed,

    /// Held by staff; not issued until the hold is lifted.
    Reserved,

    /// Withdrawn from circulation (soft delete).
    Unavailable,
}

impl BookStatus {
    /// Staff-set statuses the ledger never overwrites.
    pub fn is_hold(self) -> bool {
        matches!(self, Self::Reserved | Self::Unavailable)
    }
}

/// Why a copy could not be taken or put back.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyError {
    #[error("no copies available")]
    OutOfStock,

    #[error("title is on hold")]
    OnHold,

    #[error("title has been withdrawn")]
    Withdrawn,

    #[error("no copies are out on loan")]
    NoneBorrowed,
}

/// A title in the catalog and its copy counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookRecord {
    pub id: BookId,
    pub isbn13: String,
    pub title: String,
    pub authors: Vec<String>,

    /// Copies owned.
    pub quantity: u32,

    /// Copies on the shelf.
    pub available_quantity: u32,

    /// Copies out on loan.
    pub currently_borrowed: u32,

    pub status: BookStatus,

    /// Lifetime checkouts.
    pub total_checkouts: u64,

    /// Tokens of the most recent ledger writes, newest last.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recent_changes: Vec<String>,
}

/// How many change tokens a book remembers.
const RECENT_CHANGES: usize = 16;

impl BookRecord {
    /// New title with every copy on the shelf.
    pub fn new(
        id: BookId,
        isbn13: impl Into<String>,
        title: impl Into<String>,
        authors: Vec<String>,
        quantity: u32,
    ) -> Self {
        let mut book = Self {
            id,
            isbn13: isbn13.into(),
            title: title.into(),
            authors,
            quantity,
            available_quantity: quantity,
            currently_borrowed: 0,
            status: BookStatus::Available,
            total_checkouts: 0,
            recent_changes: Vec::new(),
        };
        book.refresh_status();
        book
    }

    /// Check the counter invariants.
    pub fn is_consistent(&self) -> bool {
        self.available_quantity.checked_add(self.currently_borrowed) == Some(self.quantity)
            && self.available_quantity <= self.quantity
    }

    /// Whether the write identified by `token` already landed.
    pub fn has_change(&self, token: &str) -> bool {
        self.recent_changes.iter().any(|t| t == token)
    }

    /// Remember the token of a write about to be stored.
    pub fn record_change(&mut self, token: impl Into<String>) {
        self.recent_changes.push(token.into());
        if self.recent_changes.len() > RECENT_CHANGES {
            let excess = self.recent_changes.len() - RECENT_CHANGES;
            self.recent_changes.drain(..excess);
        }
    }

    /// Take one copy off the shelf for a loan.
    pub fn take_copy(&mut self) -> Result<(), CopyError> {
        match self.status {
            BookStatus::Unavailable => return Err(CopyError::Withdrawn),
            BookStatus::Reserved => return Err(CopyError::OnHold),
            BookStatus::Available | BookStatus::Borrowed => {}
        }

        if self.available_quantity == 0 {
            return Err(CopyError::OutOfStock);
        }

        self.available_quantity -= 1;
        self.currently_borrowed += 1;
        self.total_checkouts += 1;
        self.refresh_status();
        Ok(())
    }

    /// Put one borrowed copy back on the shelf.
    ///
    /// Withdrawn and held titles still accept returns.
    pub fn return_copy(&mut self) -> Result<(), CopyError> {
        if self.currently_borrowed == 0 {
            return Err(CopyError::NoneBorrowed);
        }

        self.currently_borrowed -= 1;
        self.available_quantity += 1;
        self.refresh_status();
        Ok(())
    }

    /// Add newly acquired copies.
    pub fn add_copies(&mut self, additional: u32) {
        self.quantity = self.quantity.saturating_add(additional);
        self.available_quantity = self.quantity - self.currently_borrowed;
        self.refresh_status();
    }

    /// Put a staff hold on the title or lift it.
    pub fn set_hold(&mut self, held: bool) {
        if held {
            self.status = BookStatus::Reserved;
        } else if self.status == BookStatus::Reserved {
            self.status = BookStatus::Available;
            self.refresh_status();
        }
    }

    /// Take the title out of circulation.
    pub fn withdraw(&mut self) {
        self.status = BookStatus::Unavailable;
    }

    /// Recompute `Available`/`Borrowed` from the counters.
    fn refresh_status(&mut self) {
        if self.status.is_hold() {
            return;
        }
        self.status = if self.available_quantity > 0 {
            BookStatus::Available
        } else {
            BookStatus::Borrowed
        };
    }

    /// Read-only snapshot.
    pub fn availability(&self) -> BookAvailabilityView {
        BookAvailabilityView {
            book_id: self.id.clone(),
            title: self.title.clone(),
            quantity: self.quantity,
            available_quantity: self.available_quantity,
            currently_borrowed: self.currently_borrowed,
            status: self.status,
            total_checkouts: self.total_checkouts,
        }
    }
}

impl Document for BookRecord {
    const COLLECTION: &'static str = "books";

    fn document_id(&self) -> &str {
        self.id.as_str()
    }
}

/// Snapshot of a title's counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookAvailabilityView {
    pub book_id: BookId,
    pub title: String,
    pub quantity: u32,
    pub available_quantity: u32,
    pub currently_borrowed: u32,
    pub status: BookStatus,
    pub total_checkouts: u64,
}
