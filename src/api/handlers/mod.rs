//! API request handlers.

pub mod accounts;
pub mod books;
pub mod fines;
pub mod loans;
pub mod status;
