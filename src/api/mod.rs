//! REST API for the circulation daemon.
//!
//! Provides HTTP endpoints for:
//! - Catalog management and availability
//! - Issuing and returning loans
//! - Fine assessment and payment
//! - Borrower accounts

pub mod error;
pub mod handlers;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::directory::StoreDirectory;
use crate::service::CirculationService;

/// Shared state for API handlers.
pub struct ApiState {
    /// Ledger, loan manager and fine engine.
    pub service: CirculationService,

    /// Account registration and suspension.
    pub accounts: StoreDirectory,
}

impl ApiState {
    pub fn new(service: CirculationService, accounts: StoreDirectory) -> Self {
        Self { service, accounts }
    }
}

/// Build the API router with all routes.
pub fn router(state: Arc<ApiState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Status/health
        .route("/api/v1/status", get(handlers::status::health))
        // Catalog
        .route(
            "/api/v1/books",
            get(handlers::books::list_books).post(handlers::books::add_book),
        )
        .route("/api/v1/books/:id", get(handlers::books::get_book))
        .route("/api/v1/books/:id/restock", post(handlers::books::restock))
        .route("/api/v1/books/:id/withdraw", post(handlers::books::withdraw))
        .route("/api/v1/books/:id/hold", post(handlers::books::set_hold))
        .route("/api/v1/books/:id/loans", get(handlers::books::open_loans))
        .route(
            "/api/v1/books/:id/reconciliation",
            get(handlers::books::reconcile),
        )
        // Loans
        .route("/api/v1/loans", post(handlers::loans::issue_book))
        .route("/api/v1/loans/:id", get(handlers::loans::get_loan))
        .route("/api/v1/loans/:id/return", post(handlers::loans::return_book))
        // Fines
        .route("/api/v1/fines", post(handlers::fines::assess_fine))
        .route("/api/v1/fines/:id", get(handlers::fines::get_fine))
        .route("/api/v1/fines/:id/pay", post(handlers::fines::pay_fine))
        // Accounts
        .route("/api/v1/accounts", post(handlers::accounts::register))
        .route(
            "/api/v1/accounts/:id/suspension",
            post(handlers::accounts::set_suspension),
        )
        .route(
            "/api/v1/borrowers/:id/loans",
            get(handlers::accounts::borrower_loans),
        )
        .route(
            "/api/v1/borrowers/:id/fines",
            get(handlers::accounts::borrower_fines),
        )
        // Middleware
        .layer(cors)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &axum::http::Request<_>| {
                    tracing::info_span!(
                        "request",
                        method = %request.method(),
                        uri = %request.uri(),
                    )
                })
                // Only log responses that are not 2xx
                .on_request(())
                .on_response(|response: &axum::http::Response<_>, latency: std::time::Duration, _span: &tracing::Span| {
                    let status = response.status();
                    if !status.is_success() {
                        tracing::warn!(
                            status = %status,
                            latency_ms = latency.as_millis(),
                            "request failed"
                        );
                    }
                })
        )
        .with_state(state)
}

/// Start the API server.
pub async fn serve(state: Arc<ApiState>, bind_addr: &str) -> anyhow::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;

    tracing::info!("Circulation API listening on {}", bind_addr);

    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use crate::config::CirculationConfig;
    use crate::store::{DocumentStore, MemoryStore};

    fn app() -> Router {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        let config = CirculationConfig::new("/unused".into());
        let accounts = StoreDirectory::new(store.clone(), config.store_timeout);
        let service = CirculationService::new(store, Arc::new(accounts.clone()), &config);
        router(Arc::new(ApiState::new(service, accounts)))
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json");
        let request = match body {
            Some(body) => request.body(Body::from(body.to_string())).unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        // Errors come back as plain text
        let value = serde_json::from_slice(&bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()));
        (status, value)
    }

    async fn seed(app: &Router) {
        let (status, _) = call(
            app,
            "POST",
            "/api/v1/books",
            Some(json!({
                "id": "dune",
                "isbn13": "978-0-441-17271-9",
                "title": "Dune",
                "authors": ["Frank Herbert"],
                "quantity": 1
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        for id in ["alice", "bob"] {
            let (status, _) = call(
                app,
                "POST",
                "/api/v1/accounts",
                Some(json!({ "id": id, "name": id, "email": format!("{id}@example.org") })),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
        }
    }

    #[tokio::test]
    async fn test_issue_and_return_over_http() {
        let app = app();
        seed(&app).await;

        let (status, loan) = call(
            &app,
            "POST",
            "/api/v1/loans",
            Some(json!({ "bookId": "dune", "borrowerId": "alice" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(loan["status"], "Borrowed");
        assert_eq!(loan["standing"], "Borrowed");

        let (status, _) = call(
            &app,
            "POST",
            "/api/v1/loans",
            Some(json!({ "bookId": "dune", "borrowerId": "bob" })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, availability) = call(&app, "GET", "/api/v1/books/dune", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(availability["availableQuantity"], 0);

        let loan_id = loan["id"].as_str().unwrap();
        let uri = format!("/api/v1/loans/{loan_id}/return");
        let (status, returned) = call(&app, "POST", &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(returned["loan"]["status"], "Returned");
        assert!(returned["fine"].is_null());

        let (status, _) = call(&app, "POST", &uri, None).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, report) = call(&app, "GET", "/api/v1/books/dune/reconciliation", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(report["drift"], 0);
    }

    #[tokio::test]
    async fn test_error_statuses() {
        let app = app();
        seed(&app).await;

        let (status, _) = call(&app, "GET", "/api/v1/books/missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = call(
            &app,
            "POST",
            "/api/v1/loans",
            Some(json!({
                "bookId": "dune",
                "borrowerId": "alice",
                "dueDate": "2000-01-01T00:00:00Z"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.as_str().unwrap().starts_with("Due date must be after issue date"));

        let (status, _) = call(
            &app,
            "POST",
            "/api/v1/accounts/bob/suspension",
            Some(json!({ "suspended": true })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = call(
            &app,
            "POST",
            "/api/v1/loans",
            Some(json!({ "bookId": "dune", "borrowerId": "bob" })),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = call(&app, "POST", "/api/v1/fines/nope/pay", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(
            &app,
            "POST",
            "/api/v1/books",
            Some(json!({ "isbn13": "9780262033849", "title": "Bad", "quantity": 1 })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_status_endpoint() {
        let app = app();
        seed(&app).await;

        let (status, body) = call(&app, "GET", "/api/v1/status", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["summary"]["titles"], 1);
    }
}
