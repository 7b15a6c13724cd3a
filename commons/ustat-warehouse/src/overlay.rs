use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    DimensionRow, MemoryWarehouse, SurrogateKey, Warehouse, WarehouseError,
    WarehouseResult,
};

/// Read-through view used for dry runs: reads fall back to `base`, writes
/// stay in memory and are dropped with the overlay.
pub struct OverlayWarehouse {
    base: Arc<dyn Warehouse>,
    overlay: MemoryWarehouse,
}

impl OverlayWarehouse {
    pub fn new(base: Arc<dyn Warehouse>) -> Self {
        Self {
            base,
            overlay: MemoryWarehouse::new(),
        }
    }
}

#[async_trait]
impl Warehouse for OverlayWarehouse {
    async fn find_by_value(
        &self,
        table: &str,
        value: &str,
    ) -> WarehouseResult<Option<DimensionRow>> {
        match self.overlay.find_by_value(table, value).await? {
            Some(row) => Ok(Some(row)),
            None => self.base.find_by_value(table, value).await,
        }
    }

    async fn find_by_key(
        &self,
        table: &str,
        key: SurrogateKey,
    ) -> WarehouseResult<Option<DimensionRow>> {
        match self.overlay.find_by_key(table, key).await? {
            Some(row) => Ok(Some(row)),
            None => self.base.find_by_key(table, key).await,
        }
    }

    async fn insert(
        &self,
        table: &str,
        row: DimensionRow,
    ) -> WarehouseResult<()> {
        if self.base.find_by_value(table, &row.value).await?.is_some()
            || self.base.find_by_key(table, row.key).await?.is_some()
        {
            return Err(WarehouseError::duplicate(table, &row.value));
        }
        self.overlay.insert(table, row).await
    }

    async fn update(
        &self,
        table: &str,
        key: SurrogateKey,
        attrs: BTreeMap<String, String>,
    ) -> WarehouseResult<()> {
        if self.overlay.find_by_key(table, key).await?.is_none() {
            // copy-on-write of the base row
            let row = self.base.find_by_key(table, key).await?.ok_or_else(
                || WarehouseError::NotFound {
                    table: table.to_string(),
                    key,
                },
            )?;
            self.overlay.insert(table, row).await?;
        }
        self.overlay.update(table, key, attrs).await
    }

    async fn scan(
        &self,
        table: &str,
        prefix: &str,
    ) -> WarehouseResult<Vec<DimensionRow>> {
        let mut merged: BTreeMap<SurrogateKey, DimensionRow> = self
            .base
            .scan(table, prefix)
            .await?
            .into_iter()
            .map(|row| (row.key, row))
            .collect();
        for row in self.overlay.scan(table, prefix).await? {
            merged.insert(row.key, row);
        }
        Ok(merged.into_values().collect())
    }

    async fn reserve(
        &self,
        sequence: &str,
        _count: u64,
    ) -> WarehouseResult<SurrogateKey> {
        Err(WarehouseError::ReadOnly(format!(
            "cannot reserve from sequence `{sequence}` in dry-run"
        )))
    }

    async fn current(&self, sequence: &str) -> WarehouseResult<SurrogateKey> {
        self.base.current(sequence).await
    }

    fn connection_epoch(&self) -> u64 {
        self.base.connection_epoch()
    }
}
