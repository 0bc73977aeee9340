//! Persisted circulation records.
//!
//! Each record type owns its own collection and exposes the pure state
//! transitions its owning component applies before writing it back.

pub mod account;
pub mod book;
pub mod fine;
pub mod holdings;
pub mod loan;

pub use account::{AccountRecord, Role};
pub use book::{BookAvailabilityView, BookRecord, BookStatus, CopyError};
pub use fine::{FineReason, FineRecord, FineStatus};
pub use holdings::{BorrowerHoldings, Holding};
pub use loan::{LoanRecord, LoanStanding, LoanStatus};

macro_rules! record_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord,
            serde::Serialize, serde::Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Fresh random identifier.
            pub fn generate() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<$name> for serde_json::Value {
            fn from(id: $name) -> Self {
                serde_json::Value::String(id.0)
            }
        }
    };
}

record_id!(
    /// Catalog identifier of a book title.
    BookId
);
record_id!(
    /// Identifier of a loan.
    LoanId
);
record_id!(
    /// Identifier of an assessed fine.
    FineId
);
record_id!(
    /// Borrower identity as issued by the identity provider.
    BorrowerId
);
