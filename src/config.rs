//! Service configuration.

use std::path::PathBuf;
use std::time::Duration;

use rust_decimal::Decimal;

use crate::retry::RetryPolicy;

/// Configuration for a circulation service.
#[derive(Debug, Clone)]
pub struct CirculationConfig {
    /// Directory for the file document store.
    pub data_dir: PathBuf,

    /// Late-return charge per overdue day.
    pub fine_rate_per_day: Decimal,

    /// Loan period used when a caller gives no due date.
    pub loan_period_days: i64,

    /// Open loans a borrower may hold at once.
    pub max_open_loans: usize,

    /// Retry policy for book counter writes.
    pub retry: RetryPolicy,

    /// Upper bound on any single store call.
    pub store_timeout: Duration,
}

impl CirculationConfig {
    /// Create a config with default policies.
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            fine_rate_per_day: Decimal::new(50, 2), // 0.50 per day
            loan_period_days: 14,
            max_open_loans: 5,
            retry: RetryPolicy::default(),
            store_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_fine_rate(mut self, rate: Decimal) -> Self {
        self.fine_rate_per_day = rate;
        self
    }

    pub fn with_loan_period_days(mut self, days: i64) -> Self {
        self.loan_period_days = days;
        self
    }

    pub fn with_max_open_loans(mut self, max: usize) -> Self {
        self.max_open_loans = max;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    /// Default due date for a loan issued at `now`.
    pub fn default_due_date(&self, now: chrono::DateTime<chrono::Utc>) -> chrono::DateTime<chrono::Utc> {
        now + chrono::Duration::days(self.loan_period_days)
    }
}

impl Default for CirculationConfig {
    fn default() -> Self {
        let data_dir = directories::ProjectDirs::from("org", "circulation", "circulation")
            .map(|d| d.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from(".circulation"));

        Self::new(data_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_builders() {
        let config = CirculationConfig::new(PathBuf::from("/tmp/circ"))
            .with_fine_rate(Decimal::new(25, 2))
            .with_loan_period_days(21)
            .with_max_open_loans(2);

        assert_eq!(config.fine_rate_per_day, Decimal::new(25, 2));
        assert_eq!(config.max_open_loans, 2);

        let now = chrono::Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let due = config.default_due_date(now);
        assert_eq!((due - now).num_days(), 21);
    }
}
