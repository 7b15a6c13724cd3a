use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info};
use ustat_warehouse::{SurrogateKey, Warehouse};

use crate::error::EtlResult;

#[derive(Debug, Clone, Copy)]
struct Reservation {
    next: SurrogateKey,
    end: SurrogateKey,
}

#[derive(Default)]
struct SequencerState {
    epoch: u64,
    reservations: HashMap<String, Reservation>,
    counters: HashMap<String, SurrogateKey>,
}

/// Hands out surrogate keys per dimension, optionally from batched
/// warehouse reservations.
pub struct Sequencer {
    warehouse: Arc<dyn Warehouse>,
    dry_run: bool,
    state: Mutex<SequencerState>,
}

impl Sequencer {
    pub fn new(warehouse: Arc<dyn Warehouse>, dry_run: bool) -> Self {
        let epoch = warehouse.connection_epoch();
        Self {
            warehouse,
            dry_run,
            state: Mutex::new(SequencerState {
                epoch,
                ..Default::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SequencerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// A reservation taken before a reconnect cannot be trusted. Dry-run
    /// counters live only in this process and survive it.
    fn check_epoch(&self) {
        let epoch = self.warehouse.connection_epoch();
        let mut state = self.lock();
        if state.epoch != epoch {
            info!(
                "warehouse epoch {} -> {}, dropping {} sequence reservations",
                state.epoch,
                epoch,
                state.reservations.len()
            );
            state.reservations.clear();
            state.epoch = epoch;
        }
    }

    pub async fn next(&self, name: &str) -> EtlResult<SurrogateKey> {
        self.next_batched(name, 1).await
    }

    /// Reserves `batch` keys in one round trip and serves later calls from
    /// the reservation until it runs out.
    pub async fn next_batched(
        &self,
        name: &str,
        batch: u64,
    ) -> EtlResult<SurrogateKey> {
        self.check_epoch();
        if self.dry_run {
            return self.next_local(name).await;
        }
        {
            let mut state = self.lock();
            if let Some(r) = state.reservations.get_mut(name) {
                if r.next < r.end {
                    let key = r.next;
                    r.next += 1;
                    return Ok(key);
                }
            }
        }
        let batch = batch.max(1);
        let first = self.warehouse.reserve(name, batch).await?;
        debug!("reserved {} keys of `{}` from {}", batch, name, first);
        self.lock().reservations.insert(
            name.to_string(),
            Reservation {
                next: first + 1,
                end: first + batch as SurrogateKey,
            },
        );
        Ok(first)
    }

    async fn next_local(&self, name: &str) -> EtlResult<SurrogateKey> {
        let seeded = self.lock().counters.contains_key(name);
        if !seeded {
            let current = self.warehouse.current(name).await?;
            self.lock()
                .counters
                .entry(name.to_string())
                .or_insert(current);
        }
        let mut state = self.lock();
        let counter = state.counters.entry(name.to_string()).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }
}

#[cfg(test)]
mod tests {
    use ustat_warehouse::{MemoryWarehouse, OverlayWarehouse};

    use super::*;
    use crate::conf::CacheSizing;
    use crate::dimension::{Dimension, DimensionResolver};

    #[tokio::test]
    async fn batch_is_served_locally_until_exhausted() {
        let wh = Arc::new(MemoryWarehouse::new());
        let seq = Sequencer::new(wh.clone(), false);

        let keys: Vec<_> = {
            let mut keys = Vec::new();
            for _ in 0..4 {
                keys.push(seq.next_batched("service", 3).await.unwrap());
            }
            keys
        };
        assert_eq!(keys, vec![1, 2, 3, 4]);
        assert_eq!(wh.current("service").await.unwrap(), 6);
        assert_eq!(seq.next("other").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn reconnect_discards_reservations() {
        let wh = Arc::new(MemoryWarehouse::new());
        let seq = Sequencer::new(wh.clone(), false);
        assert_eq!(seq.next_batched("date", 10).await.unwrap(), 1);
        assert_eq!(seq.next_batched("date", 10).await.unwrap(), 2);

        wh.reconnect();
        assert_eq!(seq.next_batched("date", 10).await.unwrap(), 11);
    }

    #[tokio::test]
    async fn dry_run_counts_from_current_without_persisting() {
        let wh = Arc::new(MemoryWarehouse::new());
        wh.reserve("identity", 5).await.unwrap();
        let dry: Arc<dyn Warehouse> = Arc::new(OverlayWarehouse::new(wh.clone()));
        let seq = Sequencer::new(dry, true);

        assert_eq!(seq.next_batched("identity", 50).await.unwrap(), 6);
        assert_eq!(seq.next("identity").await.unwrap(), 7);
        assert_eq!(wh.current("identity").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn dry_run_keeps_counting_across_reconnect() {
        let base = Arc::new(MemoryWarehouse::new());
        let dry: Arc<dyn Warehouse> = Arc::new(OverlayWarehouse::new(base.clone()));
        let seq = Sequencer::new(dry.clone(), true);

        assert_eq!(seq.next("service").await.unwrap(), 1);
        assert_eq!(seq.next("service").await.unwrap(), 2);
        base.reconnect();
        assert_eq!(seq.next("service").await.unwrap(), 3);

        let fresh = Arc::new(Sequencer::new(dry.clone(), true));
        let resolver = DimensionResolver::new(dry, fresh, CacheSizing::default(), 1);
        let a = resolver.resolve(Dimension::Service, "web").await.unwrap();
        base.reconnect();
        let b = resolver.resolve(Dimension::Service, "api").await.unwrap();
        assert_ne!(a, b);
    }

    #[cfg(feature = "sqlite")]
    #[tokio::test]
    async fn sqlite_reconnect_never_reissues_keys() {
        use ustat_warehouse::SqliteWarehouse;

        let dir = tempfile::tempdir().unwrap();
        let wh = Arc::new(SqliteWarehouse::open(dir.path().join("w.db")).unwrap());
        let seq = Sequencer::new(wh.clone(), false);

        let mut keys = vec![
            seq.next_batched("service", 10).await.unwrap(),
            seq.next_batched("service", 10).await.unwrap(),
        ];
        wh.reconnect().unwrap();
        keys.push(seq.next_batched("service", 10).await.unwrap());
        keys.push(seq.next_batched("service", 10).await.unwrap());

        assert_eq!(keys, vec![1, 2, 11, 12]);
        assert_eq!(wh.current("service").await.unwrap(), 20);

        let dry = Sequencer::new(
            Arc::new(OverlayWarehouse::new(wh.clone())),
            true,
        );
        assert_eq!(dry.next("service").await.unwrap(), 21);
        wh.reconnect().unwrap();
        assert_eq!(dry.next("service").await.unwrap(), 22);
        assert_eq!(wh.current("service").await.unwrap(), 20);
    }
}
