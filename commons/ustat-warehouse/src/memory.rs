use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use scc::HashMap;

use crate::{
    DimensionRow, SurrogateKey, Warehouse, WarehouseError, WarehouseResult,
};

#[derive(Default)]
struct Table {
    by_value: HashMap<String, SurrogateKey>,
    rows: HashMap<SurrogateKey, DimensionRow>,
}

/// In-memory warehouse. Several workers may share one instance through an
/// `Arc`; uniqueness is enforced per table exactly like the real store.
#[derive(Default)]
pub struct MemoryWarehouse {
    tables: HashMap<String, Arc<Table>>,
    sequences: HashMap<String, SurrogateKey>,
    pending_conflicts: HashMap<String, u32>,
    epoch: AtomicU64,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    async fn table(&self, name: &str) -> Arc<Table> {
        self.tables
            .entry_async(name.to_string())
            .await
            .or_insert_with(|| Arc::new(Table::default()))
            .get()
            .clone()
    }

    /// Makes the next `count` inserts into `table` fail as if a sibling
    /// worker had won the race.
    pub async fn fail_next_inserts(&self, table: &str, count: u32) {
        self.pending_conflicts
            .upsert_async(table.to_string(), count)
            .await;
    }

    /// Simulates the access layer re-establishing its connection.
    pub fn reconnect(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
    }

    pub async fn row_count(&self, table: &str) -> usize {
        self.table(table).await.rows.len()
    }

    async fn take_injected_conflict(&self, table: &str) -> bool {
        self.pending_conflicts
            .update_async(table, |_, remaining| {
                if *remaining > 0 {
                    *remaining -= 1;
                    true
                } else {
                    false
                }
            })
            .await
            .unwrap_or(false)
    }
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    async fn find_by_value(
        &self,
        table: &str,
        value: &str,
    ) -> WarehouseResult<Option<DimensionRow>> {
        // every call is a round trip; let concurrent workers interleave
        tokio::task::yield_now().await;
        let t = self.table(table).await;
        let Some(key) = t.by_value.read_async(value, |_, k| *k).await else {
            return Ok(None);
        };
        Ok(t.rows.read_async(&key, |_, row| row.clone()).await)
    }

    async fn find_by_key(
        &self,
        table: &str,
        key: SurrogateKey,
    ) -> WarehouseResult<Option<DimensionRow>> {
        tokio::task::yield_now().await;
        let t = self.table(table).await;
        Ok(t.rows.read_async(&key, |_, row| row.clone()).await)
    }

    async fn insert(
        &self,
        table: &str,
        row: DimensionRow,
    ) -> WarehouseResult<()> {
        tokio::task::yield_now().await;
        if self.take_injected_conflict(table).await {
            return Err(WarehouseError::duplicate(table, &row.value));
        }
        let t = self.table(table).await;
        let key = row.key;
        let value = row.value.clone();
        if t.rows.insert_async(key, row).await.is_err() {
            return Err(WarehouseError::duplicate(table, value));
        }
        if t.by_value.insert_async(value.clone(), key).await.is_err() {
            t.rows.remove_async(&key).await;
            return Err(WarehouseError::duplicate(table, value));
        }
        Ok(())
    }

    async fn update(
        &self,
        table: &str,
        key: SurrogateKey,
        attrs: BTreeMap<String, String>,
    ) -> WarehouseResult<()> {
        tokio::task::yield_now().await;
        let t = self.table(table).await;
        t.rows
            .update_async(&key, |_, row| row.attrs.extend(attrs))
            .await
            .ok_or_else(|| WarehouseError::NotFound {
                table: table.to_string(),
                key,
            })
    }

    async fn scan(
        &self,
        table: &str,
        prefix: &str,
    ) -> WarehouseResult<Vec<DimensionRow>> {
        tokio::task::yield_now().await;
        let t = self.table(table).await;
        let mut out = Vec::new();
        t.rows
            .scan_async(|_, row| {
                if row.value.starts_with(prefix) {
                    out.push(row.clone());
                }
            })
            .await;
        out.sort_by_key(|row| row.key);
        Ok(out)
    }

    async fn reserve(
        &self,
        sequence: &str,
        count: u64,
    ) -> WarehouseResult<SurrogateKey> {
        tokio::task::yield_now().await;
        let mut entry = self
            .sequences
            .entry_async(sequence.to_string())
            .await
            .or_insert(0);
        let first = *entry.get() + 1;
        *entry.get_mut() += count.max(1) as SurrogateKey;
        Ok(first)
    }

    async fn current(&self, sequence: &str) -> WarehouseResult<SurrogateKey> {
        Ok(self
            .sequences
            .read_async(sequence, |_, v| *v)
            .await
            .unwrap_or(0))
    }

    fn connection_epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }
}
