use chrono::NaiveDate;

#[derive(Debug)]
pub enum StoreError {
    /// Uniqueness constraint hit: a default for the time slot, or an override
    /// for the date/time-slot pair, already exists.
    DuplicateKey(String),
    /// Override written for a date that has no calendar-date record.
    MissingDate(NaiveDate),
    WalError(String),
}

impl StoreError {
    pub fn is_duplicate_key(&self) -> bool {
        matches!(self, StoreError::DuplicateKey(_))
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DuplicateKey(key) => write!(f, "duplicate key: {key}"),
            StoreError::MissingDate(date) => write!(f, "no calendar date record for {date}"),
            StoreError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}
