use chrono::{DateTime, Duration, Utc};

pub const DEFAULT_LOAN_DAYS: i64 = 15;

/// Longest loan period a deployment may configure, ten years.
pub const MAX_LOAN_DAYS: i64 = 3650;

/// Per-day penalty, in whole currency units.
pub const DEFAULT_FINE_PER_DAY: u64 = 5;

const SECONDS_PER_DAY: i64 = 24 * 60 * 60;

/// Whole days elapsed past `due`, zero when `as_of` is on or before it.
pub fn days_late(due: DateTime<Utc>, as_of: DateTime<Utc>) -> u64 {
    if as_of <= due {
        return 0;
    }
    let seconds = (as_of - due).num_seconds();
    u64::try_from(seconds.div_euclid(SECONDS_PER_DAY)).unwrap_or(0)
}

pub fn fine(due: DateTime<Utc>, as_of: DateTime<Utc>, rate: u64) -> u64 {
    days_late(due, as_of).saturating_mul(rate)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoanPolicy {
    pub loan_period: Duration,
    pub fine_per_day: u64,
}

impl Default for LoanPolicy {
    fn default() -> Self {
        Self {
            loan_period: Duration::days(DEFAULT_LOAN_DAYS),
            fine_per_day: DEFAULT_FINE_PER_DAY,
        }
    }
}

impl LoanPolicy {
    /// Saturates at the latest representable instant instead of overflowing.
    pub fn due_date(&self, issued: DateTime<Utc>) -> DateTime<Utc> {
        issued
            .checked_add_signed(self.loan_period)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn fine(&self, due: DateTime<Utc>, as_of: DateTime<Utc>) -> u64 {
        fine(due, as_of, self.fine_per_day)
    }
}
