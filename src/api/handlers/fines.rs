//! Fine handlers.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    Json,
};
use chrono::Utc;
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::api::error::{detached, reject, ApiError};
use crate::api::ApiState;
use crate::fines::FineTerms;
use crate::record::{BorrowerId, FineId, FineReason, FineRecord, LoanId};

/// On-demand fine assessment.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssessRequest {
    pub loan_id: LoanId,

    /// Who is assessing; must be staff when `amount` is set.
    pub actor_id: BorrowerId,

    /// Manual amount overriding the per-day rate.
    #[serde(default)]
    pub amount: Option<Decimal>,

    #[serde(default)]
    pub discount: Option<Decimal>,

    #[serde(default)]
    pub reason: Option<FineReason>,
}

impl AssessRequest {
    fn terms(&self, rate_per_day: Decimal) -> FineTerms {
        let terms = match self.amount {
            Some(amount) => FineTerms::manual(amount, self.reason.unwrap_or(FineReason::Other)),
            None => FineTerms::late_return(rate_per_day),
        };
        terms.with_discount(self.discount.unwrap_or_default())
    }
}

/// POST /api/v1/fines
pub async fn assess_fine(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<AssessRequest>,
) -> Result<Json<FineRecord>, ApiError> {
    let service = state.service.clone();
    let terms = request.terms(service.config().fine_rate_per_day);
    let fine = detached(async move {
        service
            .assess_fine(&request.loan_id, &terms, &request.actor_id, Utc::now())
            .await
    })
    .await?;
    Ok(Json(fine))
}

pub async fn get_fine(
    State(state): State<Arc<ApiState>>,
    Path(fine_id): Path<String>,
) -> Result<Json<FineRecord>, ApiError> {
    let fine = state
        .service
        .fines()
        .get_fine(&FineId::new(fine_id))
        .await
        .map_err(reject)?;
    Ok(Json(fine))
}

/// POST /api/v1/fines/:id/pay
pub async fn pay_fine(
    State(state): State<Arc<ApiState>>,
    Path(fine_id): Path<String>,
) -> Result<Json<FineRecord>, ApiError> {
    let service = state.service.clone();
    let fine_id = FineId::new(fine_id);
    let fine = detached(async move { service.mark_paid(&fine_id, Utc::now()).await }).await?;
    Ok(Json(fine))
}
