//! Loan handlers.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::api::error::{detached, reject, ApiError};
use crate::api::ApiState;
use crate::loans::Returned;
use crate::record::{BookId, BorrowerId, LoanId, LoanRecord, LoanStanding};

/// Loan together with its standing at response time.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoanView {
    #[serde(flatten)]
    pub loan: LoanRecord,

    /// Borrowed, Overdue or Returned.
    pub standing: LoanStanding,
}

impl LoanView {
    pub fn at(loan: LoanRecord, now: DateTime<Utc>) -> Self {
        let standing = loan.standing(now);
        Self { loan, standing }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueRequest {
    pub book_id: BookId,
    pub borrower_id: BorrowerId,

    /// Defaults to the configured loan period.
    #[serde(default)]
    pub due_date: Option<DateTime<Utc>>,
}

/// Issue a book.
///
/// POST /api/v1/loans
pub async fn issue_book(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<IssueRequest>,
) -> Result<Json<LoanView>, ApiError> {
    let service = state.service.clone();
    let now = Utc::now();
    let loan = detached(async move {
        service
            .issue_book(&request.book_id, &request.borrower_id, request.due_date, now)
            .await
    })
    .await?;
    Ok(Json(LoanView::at(loan, now)))
}

pub async fn get_loan(
    State(state): State<Arc<ApiState>>,
    Path(loan_id): Path<String>,
) -> Result<Json<LoanView>, ApiError> {
    let loan = state
        .service
        .loans()
        .get_loan(&LoanId::new(loan_id))
        .await
        .map_err(reject)?
        .ok_or((StatusCode::NOT_FOUND, "Loan not found".to_string()))?;
    Ok(Json(LoanView::at(loan, Utc::now())))
}

/// Return a book, assessing a fine when late.
///
/// POST /api/v1/loans/:id/return
pub async fn return_book(
    State(state): State<Arc<ApiState>>,
    Path(loan_id): Path<String>,
) -> Result<Json<Returned>, ApiError> {
    let service = state.service.clone();
    let loan_id = LoanId::new(loan_id);
    let returned = detached(async move { service.return_book(&loan_id, Utc::now()).await }).await?;
    Ok(Json(returned))
}
