//! Mapping of component errors onto HTTP responses.

use std::future::Future;

use axum::http::StatusCode;
use tracing::error;

use crate::directory::DirectoryError;
use crate::fines::FineError;
use crate::ledger::LedgerError;
use crate::loans::{IssueError, ReturnError};
use crate::service::ReportError;
use crate::store::StoreError;

/// Handler error: status plus a message for the caller.
pub type ApiError = (StatusCode, String);

/// Errors that know which HTTP status they answer with.
pub trait HttpStatus: std::error::Error {
    fn status(&self) -> StatusCode;
}

/// Turn a component error into a handler error, logging server-side failures.
pub fn reject<E: HttpStatus>(err: E) -> ApiError {
    let status = err.status();
    if status.is_server_error() {
        error!(status = %status, error = %err, "Request failed");
    }
    (status, err.to_string())
}

/// Run a mutation on its own task so a dropped connection cannot cancel it
/// between a write and its compensation.
pub async fn detached<T, E, F>(operation: F) -> Result<T, ApiError>
where
    F: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: HttpStatus + Send + 'static,
{
    match tokio::spawn(operation).await {
        Ok(result) => result.map_err(reject),
        Err(e) => {
            error!(error = %e, "Mutation task aborted");
            Err((StatusCode::INTERNAL_SERVER_ERROR, "Operation aborted".to_string()))
        }
    }
}

impl HttpStatus for StoreError {
    fn status(&self) -> StatusCode {
        match self {
            StoreError::NotFound { .. } => StatusCode::NOT_FOUND,
            StoreError::Conflict { .. } => StatusCode::CONFLICT,
            StoreError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            StoreError::InvalidId(_) => StatusCode::BAD_REQUEST,
            StoreError::Malformed { .. } | StoreError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl HttpStatus for LedgerError {
    fn status(&self) -> StatusCode {
        match self {
            LedgerError::NotFound(_) => StatusCode::NOT_FOUND,
            LedgerError::Invalid(_) => StatusCode::BAD_REQUEST,
            LedgerError::Duplicate(_)
            | LedgerError::OutOfStock(_)
            | LedgerError::OnHold(_)
            | LedgerError::Withdrawn(_)
            | LedgerError::InvalidState(_) => StatusCode::CONFLICT,
            LedgerError::PersistenceFailure { .. } => StatusCode::SERVICE_UNAVAILABLE,
            LedgerError::Store(e) => e.status(),
        }
    }
}

impl HttpStatus for DirectoryError {
    fn status(&self) -> StatusCode {
        match self {
            DirectoryError::NotFound(_) => StatusCode::NOT_FOUND,
            DirectoryError::Duplicate(_) => StatusCode::CONFLICT,
            DirectoryError::Invalid(_) => StatusCode::BAD_REQUEST,
            DirectoryError::Unavailable(e) => e.status(),
        }
    }
}

impl HttpStatus for IssueError {
    fn status(&self) -> StatusCode {
        match self {
            IssueError::InvalidDueDate { .. } => StatusCode::BAD_REQUEST,
            IssueError::BorrowerNotFound(_) | IssueError::BookNotFound(_) => StatusCode::NOT_FOUND,
            IssueError::BorrowerSuspended(_) => StatusCode::FORBIDDEN,
            IssueError::AlreadyBorrowed { .. }
            | IssueError::LoanLimitReached { .. }
            | IssueError::OutOfStock(_)
            | IssueError::BookOnHold(_)
            | IssueError::BookWithdrawn(_) => StatusCode::CONFLICT,
            IssueError::PersistenceFailure(_) => StatusCode::SERVICE_UNAVAILABLE,
            IssueError::Directory(e) => e.status(),
            IssueError::Ledger(e) => e.status(),
        }
    }
}

impl HttpStatus for ReturnError {
    fn status(&self) -> StatusCode {
        match self {
            ReturnError::NotFound(_) => StatusCode::NOT_FOUND,
            ReturnError::AlreadyReturned(_) => StatusCode::CONFLICT,
            ReturnError::PersistenceFailure(_) => StatusCode::SERVICE_UNAVAILABLE,
            ReturnError::Ledger { source, .. } => source.status(),
            ReturnError::FineNotRecorded { source, .. } => source.status(),
        }
    }
}

impl HttpStatus for FineError {
    fn status(&self) -> StatusCode {
        match self {
            FineError::NotFound(_) | FineError::LoanNotFound(_) => StatusCode::NOT_FOUND,
            FineError::AlreadyPaid(_) => StatusCode::CONFLICT,
            FineError::InvalidAmount(_) => StatusCode::BAD_REQUEST,
            FineError::NotAuthorized(_) => StatusCode::FORBIDDEN,
            FineError::PersistenceFailure { .. } => StatusCode::SERVICE_UNAVAILABLE,
            FineError::Store(e) => e.status(),
        }
    }
}

impl HttpStatus for ReportError {
    fn status(&self) -> StatusCode {
        match self {
            ReportError::Ledger(e) => e.status(),
            ReportError::Fines(e) => e.status(),
            ReportError::Store(e) => e.status(),
        }
    }
}
