use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
#[cfg(test)]
use std::sync::atomic::AtomicU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{
    params, Connection, ErrorCode, OpenFlags, OptionalExtension,
    TransactionBehavior,
};
use tracing::{info, warn};

use crate::{
    DimensionRow, SurrogateKey, Warehouse, WarehouseError, WarehouseResult,
};

const MAX_RECONNECTS: u32 = 3;
const RECONNECT_BACKOFF: Duration = Duration::from_millis(100);
const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

type RawRow = (SurrogateKey, String, String);

/// SQLite-backed warehouse. Every dimension lives in its own `dim_<name>`
/// table with a `UNIQUE` natural value; several worker processes may open
/// the same file.
pub struct SqliteWarehouse {
    path: PathBuf,
    conn: Mutex<Connection>,
    tables: Mutex<HashSet<String>>,
    epoch: AtomicU64,
    #[cfg(test)]
    lost_connections: AtomicU32,
}

impl SqliteWarehouse {
    pub fn open(path: impl AsRef<Path>) -> WarehouseResult<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = open_connection(&path)?;
        info!("opened warehouse {}", path.display());
        Ok(Self {
            path,
            conn: Mutex::new(conn),
            tables: Mutex::new(HashSet::new()),
            epoch: AtomicU64::new(0),
            #[cfg(test)]
            lost_connections: AtomicU32::new(0),
        })
    }

    /// Drops the current connection (and with it every cached statement)
    /// and opens a new one.
    pub fn reconnect(&self) -> WarehouseResult<()> {
        let fresh = open_connection(&self.path)?;
        *self.lock_conn()? = fresh;
        self.tables
            .lock()
            .map_err(|_| WarehouseError::backend("table set lock poisoned"))?
            .clear();
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        info!("warehouse reconnected, epoch {}", epoch);
        Ok(())
    }

    fn lock_conn(
        &self,
    ) -> WarehouseResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| WarehouseError::backend("connection lock poisoned"))
    }

    async fn with_conn<T, F>(&self, mut op: F) -> WarehouseResult<T>
    where
        F: FnMut(&mut Connection) -> rusqlite::Result<T>,
    {
        let mut attempt = 0;
        loop {
            let result = match self.simulated_loss() {
                Some(e) => Err(e),
                None => {
                    let mut conn = self.lock_conn()?;
                    op(&mut conn)
                }
            };
            match result {
                Ok(value) => return Ok(value),
                Err(e) if is_connection_loss(&e) && attempt < MAX_RECONNECTS => {
                    attempt += 1;
                    warn!(
                        "warehouse connection lost ({}), reconnect attempt {}",
                        e, attempt
                    );
                    tokio::time::sleep(RECONNECT_BACKOFF * 2u32.pow(attempt - 1))
                        .await;
                    if let Err(e) = self.reconnect() {
                        warn!("reconnect failed: {}", e);
                    }
                }
                Err(e) if is_connection_loss(&e) => {
                    return Err(WarehouseError::connection(e))
                }
                Err(e) => return Err(WarehouseError::backend(e)),
            }
        }
    }

    /// Makes the next `count` operations fail as if the database file
    /// became unreachable.
    #[cfg(test)]
    fn lose_connections(&self, count: u32) {
        self.lost_connections.store(count, Ordering::SeqCst);
    }

    #[cfg(test)]
    fn simulated_loss(&self) -> Option<rusqlite::Error> {
        self.lost_connections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .ok()
            .map(|_| {
                rusqlite::Error::SqliteFailure(
                    rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CANTOPEN),
                    None,
                )
            })
    }

    #[cfg(not(test))]
    fn simulated_loss(&self) -> Option<rusqlite::Error> {
        None
    }

    async fn ensure_table(&self, table: &str) -> WarehouseResult<String> {
        if table.is_empty()
            || !table.chars().all(|c| c.is_ascii_lowercase() || c == '_')
        {
            return Err(WarehouseError::backend(format!(
                "invalid table name `{table}`"
            )));
        }
        let name = format!("dim_{table}");
        let known = self
            .tables
            .lock()
            .map_err(|_| WarehouseError::backend("table set lock poisoned"))?
            .contains(table);
        if !known {
            let ddl = format!(
                "CREATE TABLE IF NOT EXISTS {name} (
                    id INTEGER PRIMARY KEY,
                    value TEXT NOT NULL UNIQUE,
                    attrs TEXT NOT NULL DEFAULT '{{}}'
                )"
            );
            self.with_conn(|c| c.execute_batch(&ddl)).await?;
            self.tables
                .lock()
                .map_err(|_| {
                    WarehouseError::backend("table set lock poisoned")
                })?
                .insert(table.to_string());
        }
        Ok(name)
    }
}

fn open_connection(path: &Path) -> WarehouseResult<Connection> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_FULL_MUTEX;
    let conn = Connection::open_with_flags(path, flags)
        .map_err(WarehouseError::connection)?;
    conn.busy_timeout(BUSY_TIMEOUT)
        .map_err(WarehouseError::connection)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         CREATE TABLE IF NOT EXISTS sequences (
            name TEXT PRIMARY KEY,
            last INTEGER NOT NULL
         );",
    )
    .map_err(WarehouseError::backend)?;
    Ok(conn)
}

fn is_connection_loss(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _)
            if matches!(f.code, ErrorCode::CannotOpen | ErrorCode::SystemIoFailure)
    )
}

fn raw_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
}

fn decode_row((key, value, attrs): RawRow) -> WarehouseResult<DimensionRow> {
    Ok(DimensionRow {
        key,
        value,
        attrs: serde_json::from_str(&attrs)?,
    })
}

fn encode_failure(e: serde_json::Error) -> rusqlite::Error {
    rusqlite::Error::ToSqlConversionFailure(Box::new(e))
}

#[async_trait]
impl Warehouse for SqliteWarehouse {
    async fn find_by_value(
        &self,
        table: &str,
        value: &str,
    ) -> WarehouseResult<Option<DimensionRow>> {
        let name = self.ensure_table(table).await?;
        let sql = format!("SELECT id, value, attrs FROM {name} WHERE value = ?1");
        let raw = self
            .with_conn(|c| {
                c.prepare_cached(&sql)?
                    .query_row(params![value], raw_row)
                    .optional()
            })
            .await?;
        raw.map(decode_row).transpose()
    }

    async fn find_by_key(
        &self,
        table: &str,
        key: SurrogateKey,
    ) -> WarehouseResult<Option<DimensionRow>> {
        let name = self.ensure_table(table).await?;
        let sql = format!("SELECT id, value, attrs FROM {name} WHERE id = ?1");
        let raw = self
            .with_conn(|c| {
                c.prepare_cached(&sql)?
                    .query_row(params![key], raw_row)
                    .optional()
            })
            .await?;
        raw.map(decode_row).transpose()
    }

    async fn insert(
        &self,
        table: &str,
        row: DimensionRow,
    ) -> WarehouseResult<()> {
        let name = self.ensure_table(table).await?;
        let attrs = serde_json::to_string(&row.attrs)?;
        let sql = format!(
            "INSERT OR IGNORE INTO {name} (id, value, attrs) VALUES (?1, ?2, ?3)"
        );
        let inserted = self
            .with_conn(|c| {
                c.prepare_cached(&sql)?
                    .execute(params![row.key, row.value, attrs])
            })
            .await?;
        if inserted == 0 {
            return Err(WarehouseError::duplicate(table, &row.value));
        }
        Ok(())
    }

    async fn update(
        &self,
        table: &str,
        key: SurrogateKey,
        attrs: BTreeMap<String, String>,
    ) -> WarehouseResult<()> {
        let name = self.ensure_table(table).await?;
        let select = format!("SELECT attrs FROM {name} WHERE id = ?1");
        let write = format!("UPDATE {name} SET attrs = ?2 WHERE id = ?1");
        let found = self
            .with_conn(|c| {
                let tx =
                    c.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let current: Option<String> = tx
                    .query_row(&select, params![key], |r| r.get(0))
                    .optional()?;
                let Some(current) = current else {
                    return Ok(false);
                };
                let mut merged: BTreeMap<String, String> =
                    serde_json::from_str(&current).map_err(encode_failure)?;
                merged.extend(attrs.clone());
                let encoded =
                    serde_json::to_string(&merged).map_err(encode_failure)?;
                tx.execute(&write, params![key, encoded])?;
                tx.commit()?;
                Ok(true)
            })
            .await?;
        if found {
            Ok(())
        } else {
            Err(WarehouseError::NotFound {
                table: table.to_string(),
                key,
            })
        }
    }

    async fn scan(
        &self,
        table: &str,
        prefix: &str,
    ) -> WarehouseResult<Vec<DimensionRow>> {
        let name = self.ensure_table(table).await?;
        let sql = format!(
            "SELECT id, value, attrs FROM {name}
             WHERE substr(value, 1, length(?1)) = ?1 ORDER BY id"
        );
        let raw = self
            .with_conn(|c| {
                let mut stmt = c.prepare_cached(&sql)?;
                let rows = stmt.query_map(params![prefix], raw_row)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()
            })
            .await?;
        raw.into_iter().map(decode_row).collect()
    }

    async fn reserve(
        &self,
        sequence: &str,
        count: u64,
    ) -> WarehouseResult<SurrogateKey> {
        let count = count.max(1) as SurrogateKey;
        let last = self
            .with_conn(|c| {
                let tx =
                    c.transaction_with_behavior(TransactionBehavior::Immediate)?;
                tx.execute(
                    "INSERT OR IGNORE INTO sequences (name, last) VALUES (?1, 0)",
                    params![sequence],
                )?;
                tx.execute(
                    "UPDATE sequences SET last = last + ?2 WHERE name = ?1",
                    params![sequence, count],
                )?;
                let last: SurrogateKey = tx.query_row(
                    "SELECT last FROM sequences WHERE name = ?1",
                    params![sequence],
                    |r| r.get(0),
                )?;
                tx.commit()?;
                Ok(last)
            })
            .await?;
        Ok(last - count + 1)
    }

    async fn current(&self, sequence: &str) -> WarehouseResult<SurrogateKey> {
        let last = self
            .with_conn(|c| {
                c.query_row(
                    "SELECT last FROM sequences WHERE name = ?1",
                    params![sequence],
                    |r| r.get(0),
                )
                .optional()
            })
            .await?;
        Ok(last.unwrap_or(0))
    }

    fn connection_epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }
}
