//! Account and borrower handlers.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    Json,
};
use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::api::error::{detached, reject, ApiError};
use crate::api::handlers::loans::LoanView;
use crate::api::ApiState;
use crate::directory::NewAccount;
use crate::record::{AccountRecord, BorrowerId, FineRecord};

/// POST /api/v1/accounts
pub async fn register(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<NewAccount>,
) -> Result<Json<AccountRecord>, ApiError> {
    let accounts = state.accounts.clone();
    let account = detached(async move { accounts.register(request).await }).await?;
    Ok(Json(account))
}

#[derive(Deserialize)]
pub struct SuspensionRequest {
    pub suspended: bool,
}

/// Suspend or reinstate a borrower.
pub async fn set_suspension(
    State(state): State<Arc<ApiState>>,
    Path(borrower_id): Path<String>,
    Json(request): Json<SuspensionRequest>,
) -> Result<Json<AccountRecord>, ApiError> {
    let accounts = state.accounts.clone();
    let borrower_id = BorrowerId::new(borrower_id);
    let account = detached(async move {
        accounts.set_suspended(&borrower_id, request.suspended).await
    })
    .await?;
    Ok(Json(account))
}

pub async fn borrower_loans(
    State(state): State<Arc<ApiState>>,
    Path(borrower_id): Path<String>,
) -> Result<Json<Vec<LoanView>>, ApiError> {
    let now = Utc::now();
    let loans = state
        .service
        .loans()
        .loans_for_borrower(&BorrowerId::new(borrower_id))
        .await
        .map_err(reject)?;
    Ok(Json(loans.into_iter().map(|loan| LoanView::at(loan, now)).collect()))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BorrowerFines {
    pub fines: Vec<FineRecord>,

    /// Sum of unpaid totals.
    pub outstanding_balance: Decimal,
}

pub async fn borrower_fines(
    State(state): State<Arc<ApiState>>,
    Path(borrower_id): Path<String>,
) -> Result<Json<BorrowerFines>, ApiError> {
    let fines = state
        .service
        .fines()
        .fines_for_borrower(&BorrowerId::new(borrower_id))
        .await
        .map_err(reject)?;
    let outstanding_balance = fines
        .iter()
        .filter(|fine| !fine.is_paid())
        .map(|fine| fine.total_amount)
        .sum();
    Ok(Json(BorrowerFines {
        fines,
        outstanding_balance,
    }))
}
