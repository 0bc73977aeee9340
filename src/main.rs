//! Circulation - book lending and fine accounting for a library.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use circulation::{
    api::{self, ApiState},
    store::{DocumentStore, FileStore, MemoryStore},
    CirculationConfig, CirculationService, StoreDirectory,
};

/// Library circulation service.
#[derive(Parser)]
#[command(name = "circulation", about = "Book lending and fine accounting")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the REST API daemon.
    Daemon {
        /// Address to bind the API server.
        #[arg(long, default_value = "0.0.0.0:7979", env = "CIRCULATION_BIND")]
        bind: String,

        /// Data directory for the document store.
        #[arg(long, env = "CIRCULATION_DATA_DIR")]
        data_dir: Option<PathBuf>,

        /// Keep everything in memory (nothing survives a restart).
        #[arg(long)]
        in_memory: bool,

        /// Late-return charge per overdue day.
        #[arg(long, env = "CIRCULATION_FINE_RATE")]
        fine_rate: Option<Decimal>,

        /// Loan period in days when no due date is given.
        #[arg(long)]
        loan_period_days: Option<i64>,

        /// Open loans allowed per borrower.
        #[arg(long)]
        max_open_loans: Option<usize>,
    },

    /// Show service status.
    Status {
        /// Circulation API URL.
        #[arg(long, env = "CIRCULATION_API_URL", default_value = "http://localhost:7979")]
        api_url: String,
    },

    /// Show availability of a title.
    Availability {
        book_id: String,

        /// Circulation API URL.
        #[arg(long, env = "CIRCULATION_API_URL", default_value = "http://localhost:7979")]
        api_url: String,
    },

    /// Issue a book to a borrower.
    Issue {
        #[arg(long)]
        book_id: String,

        #[arg(long)]
        borrower_id: String,

        /// RFC 3339 due date; defaults to the configured loan period.
        #[arg(long)]
        due_date: Option<DateTime<Utc>>,

        /// Circulation API URL.
        #[arg(long, env = "CIRCULATION_API_URL", default_value = "http://localhost:7979")]
        api_url: String,
    },

    /// Return a loan.
    Return {
        loan_id: String,

        /// Circulation API URL.
        #[arg(long, env = "CIRCULATION_API_URL", default_value = "http://localhost:7979")]
        api_url: String,
    },

    /// Mark a fine as paid.
    Pay {
        fine_id: String,

        /// Circulation API URL.
        #[arg(long, env = "CIRCULATION_API_URL", default_value = "http://localhost:7979")]
        api_url: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "circulation=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon {
            bind,
            data_dir,
            in_memory,
            fine_rate,
            loan_period_days,
            max_open_loans,
        } => {
            let mut config = match data_dir {
                Some(dir) => CirculationConfig::new(dir),
                None => CirculationConfig::default(),
            };
            if let Some(rate) = fine_rate {
                config = config.with_fine_rate(rate);
            }
            if let Some(days) = loan_period_days {
                config = config.with_loan_period_days(days);
            }
            if let Some(max) = max_open_loans {
                config = config.with_max_open_loans(max);
            }

            run_daemon(&bind, config, in_memory).await?;
        }

        Commands::Status { api_url } => {
            show_status(&api_url).await?;
        }

        Commands::Availability { book_id, api_url } => {
            show_availability(&api_url, &book_id).await?;
        }

        Commands::Issue {
            book_id,
            borrower_id,
            due_date,
            api_url,
        } => {
            issue_book(&api_url, &book_id, &borrower_id, due_date).await?;
        }

        Commands::Return { loan_id, api_url } => {
            return_book(&api_url, &loan_id).await?;
        }

        Commands::Pay { fine_id, api_url } => {
            pay_fine(&api_url, &fine_id).await?;
        }
    }

    Ok(())
}

/// Run the API daemon.
async fn run_daemon(bind: &str, config: CirculationConfig, in_memory: bool) -> Result<()> {
    tracing::info!("Starting circulation daemon...");

    if config.fine_rate_per_day.is_sign_negative() {
        anyhow::bail!("Fine rate must not be negative: {}", config.fine_rate_per_day);
    }
    if config.loan_period_days < 1 {
        anyhow::bail!("Loan period must be at least one day");
    }

    let store: Arc<dyn DocumentStore> = if in_memory {
        tracing::warn!("Using in-memory store; records will not survive a restart");
        Arc::new(MemoryStore::new())
    } else {
        let store = FileStore::open(config.data_dir.clone()).await?;
        tracing::info!(data_dir = %config.data_dir.display(), "Opened document store");
        Arc::new(store)
    };

    let accounts = StoreDirectory::new(store.clone(), config.store_timeout);
    let service = CirculationService::new(store, Arc::new(accounts.clone()), &config);

    // Surface counter drift left behind by a crash mid-compensation
    match service.audit().await {
        Ok(drifted) if !drifted.is_empty() => {
            tracing::warn!(titles = drifted.len(), "Catalog needs reconciliation");
        }
        Ok(_) => {}
        Err(e) => tracing::warn!(error = %e, "Startup audit failed"),
    }

    let state = Arc::new(ApiState::new(service, accounts));

    api::serve(state, bind).await?;

    Ok(())
}

async fn error_text(response: reqwest::Response) -> String {
    let status = response.status();
    match response.text().await {
        Ok(text) if !text.is_empty() => format!("{} ({})", text, status),
        _ => status.to_string(),
    }
}

/// Show service status via API.
async fn show_status(api_url: &str) -> Result<()> {
    let client = reqwest::Client::new();
    let url = format!("{}/api/v1/status", api_url);

    let response = client.get(&url).send().await?;

    if !response.status().is_success() {
        anyhow::bail!("Failed to get status: {}", error_text(response).await);
    }

    let status: serde_json::Value = response.json().await?;
    let summary = &status["summary"];

    println!("Circulation Status");
    println!("==================");
    println!("Status:        {}", status["status"]);
    println!("Version:       {}", status["version"]);
    println!("Titles:        {}", summary["titles"]);
    println!("Copies:        {} ({} available)", summary["copies"], summary["availableCopies"]);
    println!("Open Loans:    {} ({} overdue)", summary["openLoans"], summary["overdueLoans"]);
    println!("Unpaid Fines:  {} totalling {}", summary["unpaidFines"], summary["outstandingFines"]);

    Ok(())
}

async fn show_availability(api_url: &str, book_id: &str) -> Result<()> {
    let client = reqwest::Client::new();
    let url = format!("{}/api/v1/books/{}", api_url, book_id);

    let response = client.get(&url).send().await?;

    if !response.status().is_success() {
        anyhow::bail!("Failed to get availability: {}", error_text(response).await);
    }

    let view: serde_json::Value = response.json().await?;

    println!("Title:     {}", view["title"]);
    println!("Status:    {}", view["status"]);
    println!("Available: {} of {}", view["availableQuantity"], view["quantity"]);
    println!("On Loan:   {}", view["currentlyBorrowed"]);
    println!("Checkouts: {}", view["totalCheckouts"]);

    Ok(())
}

/// Issue a book via API.
async fn issue_book(
    api_url: &str,
    book_id: &str,
    borrower_id: &str,
    due_date: Option<DateTime<Utc>>,
) -> Result<()> {
    let client = reqwest::Client::new();
    let url = format!("{}/api/v1/loans", api_url);

    let body = serde_json::json!({
        "bookId": book_id,
        "borrowerId": borrower_id,
        "dueDate": due_date,
    });

    let response = client.post(&url).json(&body).send().await?;

    if !response.status().is_success() {
        anyhow::bail!("Failed to issue book: {}", error_text(response).await);
    }

    let loan: serde_json::Value = response.json().await?;

    println!("Book issued.");
    println!("Loan ID:  {}", loan["id"]);
    println!("Due Date: {}", loan["dueDate"]);

    Ok(())
}

/// Return a loan via API.
async fn return_book(api_url: &str, loan_id: &str) -> Result<()> {
    let client = reqwest::Client::new();
    let url = format!("{}/api/v1/loans/{}/return", api_url, loan_id);

    let response = client.post(&url).send().await?;

    if !response.status().is_success() {
        anyhow::bail!("Failed to return book: {}", error_text(response).await);
    }

    let returned: serde_json::Value = response.json().await?;

    println!("Book returned.");
    println!("Returned: {}", returned["loan"]["returnDate"]);
    if returned["fine"].is_object() {
        println!("Fine ID:  {}", returned["fine"]["id"]);
        println!(
            "Fine:     {} ({} days overdue)",
            returned["fine"]["totalAmount"], returned["fine"]["overdueDays"]
        );
    }

    Ok(())
}

/// Pay a fine via API.
async fn pay_fine(api_url: &str, fine_id: &str) -> Result<()> {
    let client = reqwest::Client::new();
    let url = format!("{}/api/v1/fines/{}/pay", api_url, fine_id);

    let response = client.post(&url).send().await?;

    if !response.status().is_success() {
        anyhow::bail!("Failed to pay fine: {}", error_text(response).await);
    }

    let fine: serde_json::Value = response.json().await?;

    println!("Fine paid.");
    println!("Amount:  {}", fine["totalAmount"]);
    println!("Paid At: {}", fine["paidAt"]);

    Ok(())
}
