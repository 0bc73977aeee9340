//! Borrower directory.
//!
//! The loan manager only needs to know whether a borrower exists, is
//! suspended, and what role they hold. [`UserDirectory`] is that seam;
//! [`StoreDirectory`] answers it from an `accounts` collection kept in the
//! same document store as the circulation records.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tracing::info;

use crate::record::{AccountRecord, BorrowerId, Role};
use crate::store::{Collection, DocumentStore, StoreError};

#[derive(Error, Debug)]
pub enum DirectoryError {
    #[error("Borrower not found: {0}")]
    NotFound(BorrowerId),

    #[error("Account {0} already exists")]
    Duplicate(BorrowerId),

    #[error("Invalid account: {0}")]
    Invalid(String),

    #[error("Directory unavailable: {0}")]
    Unavailable(#[from] StoreError),
}

/// What the directory knows about a borrower.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BorrowerProfile {
    pub id: BorrowerId,
    pub role: Role,
    pub is_suspended: bool,
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Look up a borrower, failing with [`DirectoryError::NotFound`] if unknown.
    async fn lookup(&self, borrower_id: &BorrowerId) -> Result<BorrowerProfile, DirectoryError>;
}

/// Account registration request.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewAccount {
    #[serde(default)]
    pub id: Option<BorrowerId>,
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub role: Role,
}

/// Directory backed by `accounts` documents.
#[derive(Clone)]
pub struct StoreDirectory {
    accounts: Collection<AccountRecord>,
}

impl StoreDirectory {
    pub fn new(store: Arc<dyn DocumentStore>, timeout: Duration) -> Self {
        Self {
            accounts: Collection::new(store, timeout),
        }
    }

    pub async fn register(&self, new: NewAccount) -> Result<AccountRecord, DirectoryError> {
        if new.name.trim().is_empty() {
            return Err(DirectoryError::Invalid("name is required".to_string()));
        }
        if !new.email.contains('@') {
            return Err(DirectoryError::Invalid(format!("invalid email: {}", new.email)));
        }

        let account = AccountRecord {
            id: new.id.unwrap_or_else(BorrowerId::generate),
            name: new.name.trim().to_string(),
            email: new.email.trim().to_lowercase(),
            role: new.role,
            suspended: false,
        };

        match self.accounts.create(&account).await {
            Ok(_) => {}
            Err(StoreError::Conflict { .. }) => return Err(DirectoryError::Duplicate(account.id)),
            Err(e) => return Err(e.into()),
        }

        info!(borrower_id = %account.id, role = ?account.role, "Registered account");

        Ok(account)
    }

    pub async fn account(&self, borrower_id: &BorrowerId) -> Result<AccountRecord, DirectoryError> {
        self.accounts
            .get(borrower_id.as_str())
            .await
            .map(|stored| stored.document)
            .map_err(|e| {
                if e.is_not_found() {
                    DirectoryError::NotFound(borrower_id.clone())
                } else {
                    e.into()
                }
            })
    }

    /// Suspend or reinstate borrowing privileges.
    pub async fn set_suspended(
        &self,
        borrower_id: &BorrowerId,
        suspended: bool,
    ) -> Result<AccountRecord, DirectoryError> {
        let stored = self.accounts.get(borrower_id.as_str()).await.map_err(|e| {
            if e.is_not_found() {
                DirectoryError::NotFound(borrower_id.clone())
            } else {
                e.into()
            }
        })?;

        let mut account = stored.document;
        account.suspended = suspended;
        self.accounts.update(&account, stored.version).await?;

        info!(borrower_id = %borrower_id, suspended, "Updated account suspension");

        Ok(account)
    }
}

#[async_trait]
impl UserDirectory for StoreDirectory {
    async fn lookup(&self, borrower_id: &BorrowerId) -> Result<BorrowerProfile, DirectoryError> {
        let account = self.account(borrower_id).await?;
        Ok(BorrowerProfile {
            id: account.id,
            role: account.role,
            is_suspended: account.suspended,
        })
    }
}
