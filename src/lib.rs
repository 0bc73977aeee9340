//! Circulation - book lending and fine accounting for a library.
//!
//! Three components share one document store, each owning its own records:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        LOAN MANAGER                          │
//! │  issue / return sagas, borrower holdings, compensation       │
//! └───────────────┬─────────────────────────────┬────────────────┘
//!                 │ reserve / release           │ assess on late return
//! ┌───────────────┴──────────────┐ ┌────────────┴────────────────┐
//! │        CATALOG LEDGER        │ │         FINE ENGINE         │
//! │  copy counters per title     │ │  overdue charges, payment   │
//! └───────────────┬──────────────┘ └────────────┬────────────────┘
//!                 │                             │
//! ┌───────────────┴─────────────────────────────┴────────────────┐
//! │                       DOCUMENT STORE                         │
//! │  versioned JSON documents, conditioned updates, timeouts     │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Properties
//!
//! - **No lost copies**: counters only change through conditioned writes
//! - **Compensated sagas**: a failed issue or return leaves no half state
//! - **Idempotent retries**: a write whose acknowledgement was lost is not applied twice
//! - **Derived overdue**: lateness is computed on read, never stored

// === Core Modules ===

/// Persisted record types.
pub mod record;

/// Versioned document storage.
pub mod store;

/// Catalog ledger.
pub mod ledger;

/// Loan manager.
pub mod loans;

/// Fine engine.
pub mod fines;

/// Borrower directory.
pub mod directory;

/// Components wired together.
pub mod service;

// === Supporting Modules ===

/// Service configuration.
pub mod config;

/// Bounded retry.
pub mod retry;

/// REST API.
pub mod api;

// === Re-exports ===

pub use config::CirculationConfig;
pub use directory::{StoreDirectory, UserDirectory};
pub use fines::{compute_overdue_days, FineEngine, FineError, FineTerms};
pub use ledger::{CatalogLedger, LedgerError};
pub use loans::{IssueError, LoanManager, ReturnError, Returned};
pub use retry::RetryPolicy;
pub use service::CirculationService;
