//! Borrower accounts backing the store directory.

use serde::{Deserialize, Serialize};

use super::BorrowerId;
use crate::store::Document;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    User,
    Librarian,
    Admin,
}

impl Role {
    pub fn is_staff(self) -> bool {
        matches!(self, Self::Librarian | Self::Admin)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountRecord {
    pub id: BorrowerId,
    pub name: String,
    pub email: String,
    pub role: Role,
    pub suspended: bool,
}

impl Document for AccountRecord {
    const COLLECTION: &'static str = "accounts";

    fn document_id(&self) -> &str {
        self.id.as_str()
    }
}
