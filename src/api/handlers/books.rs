//! Catalog handlers.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    Json,
};
use serde::Deserialize;

use crate::api::error::{detached, reject, ApiError};
use crate::api::handlers::loans::LoanView;
use crate::api::ApiState;
use crate::ledger::NewBook;
use crate::record::{BookAvailabilityView, BookId, BookRecord};
use crate::service::ReconciliationReport;

/// List every title in the catalog.
pub async fn list_books(
    State(state): State<Arc<ApiState>>,
) -> Result<Json<Vec<BookRecord>>, ApiError> {
    let books = state.service.ledger().list_books().await.map_err(reject)?;
    Ok(Json(books))
}

/// Add a title.
///
/// POST /api/v1/books
pub async fn add_book(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<NewBook>,
) -> Result<Json<BookRecord>, ApiError> {
    let service = state.service.clone();
    let book = detached(async move { service.ledger().add_book(request).await }).await?;
    Ok(Json(book))
}

/// Availability snapshot for one title.
pub async fn get_book(
    State(state): State<Arc<ApiState>>,
    Path(book_id): Path<String>,
) -> Result<Json<BookAvailabilityView>, ApiError> {
    let view = state
        .service
        .get_availability(&BookId::new(book_id))
        .await
        .map_err(reject)?;
    Ok(Json(view))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestockRequest {
    pub additional: u32,
}

pub async fn restock(
    State(state): State<Arc<ApiState>>,
    Path(book_id): Path<String>,
    Json(request): Json<RestockRequest>,
) -> Result<Json<BookRecord>, ApiError> {
    let service = state.service.clone();
    let book_id = BookId::new(book_id);
    let book = detached(async move {
        service.ledger().restock(&book_id, request.additional).await
    })
    .await?;
    Ok(Json(book))
}

/// Take a title out of circulation. Copies on loan can still be returned.
pub async fn withdraw(
    State(state): State<Arc<ApiState>>,
    Path(book_id): Path<String>,
) -> Result<Json<BookRecord>, ApiError> {
    let service = state.service.clone();
    let book_id = BookId::new(book_id);
    let book = detached(async move { service.ledger().withdraw(&book_id).await }).await?;
    Ok(Json(book))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HoldRequest {
    pub held: bool,
}

pub async fn set_hold(
    State(state): State<Arc<ApiState>>,
    Path(book_id): Path<String>,
    Json(request): Json<HoldRequest>,
) -> Result<Json<BookRecord>, ApiError> {
    let service = state.service.clone();
    let book_id = BookId::new(book_id);
    let book =
        detached(async move { service.ledger().set_hold(&book_id, request.held).await }).await?;
    Ok(Json(book))
}

/// Open loans of one title.
pub async fn open_loans(
    State(state): State<Arc<ApiState>>,
    Path(book_id): Path<String>,
) -> Result<Json<Vec<LoanView>>, ApiError> {
    let now = chrono::Utc::now();
    let loans = state
        .service
        .list_open_loans(&BookId::new(book_id))
        .await
        .map_err(reject)?;
    Ok(Json(loans.into_iter().map(|loan| LoanView::at(loan, now)).collect()))
}

pub async fn reconcile(
    State(state): State<Arc<ApiState>>,
    Path(book_id): Path<String>,
) -> Result<Json<ReconciliationReport>, ApiError> {
    let report = state
        .service
        .reconcile(&BookId::new(book_id))
        .await
        .map_err(reject)?;
    Ok(Json(report))
}
