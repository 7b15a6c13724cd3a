use ustat_external::ExternalError;
use ustat_warehouse::WarehouseError;

#[derive(thiserror::Error, Debug)]
pub enum EtlError {
    #[error("Warehouse error: {0}")]
    Warehouse(#[from] WarehouseError),
    #[error("External service error: {0}")]
    External(#[from] ExternalError),
    /// An insert kept failing after the one retry a race is allowed.
    #[error("Persistent conflict in `{table}` for value `{value}`")]
    PersistentConflict { table: String, value: String },
    #[error("Run for worker `{0}` is still in progress")]
    RunInProgress(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Corrupt row {key} in `{table}`: {detail}")]
    CorruptRow {
        table: String,
        key: i64,
        detail: String,
    },
}

impl EtlError {
    pub fn config<T: ToString>(msg: T) -> Self {
        EtlError::Config(msg.to_string())
    }

    pub fn corrupt<T: ToString, D: ToString>(
        table: T,
        key: i64,
        detail: D,
    ) -> Self {
        EtlError::CorruptRow {
            table: table.to_string(),
            key,
            detail: detail.to_string(),
        }
    }
}

pub type EtlResult<T> = Result<T, EtlError>;
