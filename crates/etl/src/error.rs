use thiserror::Error;

#[derive(Error, Debug)]
pub enum EtlError {
    #[error("dataset not registered: {0}")]
    DatasetNotFound(String),

    #[error("dataset already registered: {0}")]
    DatasetExists(String),

    #[error("invalid dataset name: {0:?}")]
    InvalidName(String),

    #[error("dataset name {0:?} is reserved")]
    ReservedName(String),

    #[error("unknown update frequency {0:?} (expected one of yearly, monthly, weekly, daily)")]
    InvalidFrequency(String),

    #[error("source {0} has no header row")]
    EmptySource(String),

    #[error("column {column:?} not found in source for dataset {dataset}")]
    MissingColumn { dataset: String, column: String },

    #[error("line {line}: value {value:?} is not a valid {expected} for column {column:?}")]
    BadValue {
        line: u64,
        column: String,
        value: String,
        expected: &'static str,
    },

    #[error("download of {url} failed with HTTP {status}")]
    Download { url: String, status: u16 },

    #[error("download of {0} timed out")]
    DownloadTimeout(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("staging task failed: {0}")]
    Task(String),
}
