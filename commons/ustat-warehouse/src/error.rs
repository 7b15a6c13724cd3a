use thiserror::Error;

#[derive(Debug, Error)]
pub enum WarehouseError {
    /// Natural or surrogate key already taken, usually by a sibling worker.
    #[error("Duplicate key in `{table}` for value `{value}`")]
    Duplicate { table: String, value: String },

    #[error("No row {key} in `{table}`")]
    NotFound { table: String, key: i64 },

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Warehouse is read-only: {0}")]
    ReadOnly(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[cfg(feature = "sqlite")]
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl WarehouseError {
    pub fn duplicate<T: ToString, V: ToString>(table: T, value: V) -> Self {
        Self::Duplicate {
            table: table.to_string(),
            value: value.to_string(),
        }
    }

    pub fn backend<T: ToString>(msg: T) -> Self {
        Self::Backend(msg.to_string())
    }

    pub fn connection<T: ToString>(msg: T) -> Self {
        Self::Connection(msg.to_string())
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate { .. })
    }
}

pub type WarehouseResult<T> = Result<T, WarehouseError>;
