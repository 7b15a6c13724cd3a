use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::WarehouseResult;

pub type SurrogateKey = i64;

/// One row of a dimension table: surrogate key, natural value and any
/// derived columns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DimensionRow {
    pub key: SurrogateKey,
    pub value: String,
    pub attrs: BTreeMap<String, String>,
}

impl DimensionRow {
    pub fn new(key: SurrogateKey, value: impl Into<String>) -> Self {
        Self {
            key,
            value: value.into(),
            attrs: BTreeMap::new(),
        }
    }

    pub fn with_attr(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.attrs.insert(name.into(), value.into());
        self
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).map(String::as_str)
    }

    pub fn attr_key(&self, name: &str) -> Option<SurrogateKey> {
        self.attr(name).and_then(|v| v.parse().ok())
    }
}

/// Shared statistics warehouse. Every table has a surrogate integer primary
/// key and a uniqueness constraint on its natural value.
#[async_trait]
pub trait Warehouse: Send + Sync {
    async fn find_by_value(
        &self,
        table: &str,
        value: &str,
    ) -> WarehouseResult<Option<DimensionRow>>;

    async fn find_by_key(
        &self,
        table: &str,
        key: SurrogateKey,
    ) -> WarehouseResult<Option<DimensionRow>>;

    /// Fails with [`crate::WarehouseError::Duplicate`] if either the natural
    /// value or the surrogate key is already present.
    async fn insert(&self, table: &str, row: DimensionRow)
        -> WarehouseResult<()>;

    /// Merges `attrs` into the stored row.
    async fn update(
        &self,
        table: &str,
        key: SurrogateKey,
        attrs: BTreeMap<String, String>,
    ) -> WarehouseResult<()>;

    /// All rows whose natural value starts with `prefix`, ordered by key.
    async fn scan(
        &self,
        table: &str,
        prefix: &str,
    ) -> WarehouseResult<Vec<DimensionRow>>;

    /// Reserves `count` consecutive keys and returns the first one.
    async fn reserve(
        &self,
        sequence: &str,
        count: u64,
    ) -> WarehouseResult<SurrogateKey>;

    /// Last key handed out by `sequence`, zero if never used.
    async fn current(&self, sequence: &str) -> WarehouseResult<SurrogateKey>;

    /// Bumped every time the underlying connection is re-established.
    fn connection_epoch(&self) -> u64;
}
