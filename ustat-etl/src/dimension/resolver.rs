use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::debug;
use ustat_warehouse::{DimensionRow, SurrogateKey, Warehouse};

use super::{truncate, CacheClass, Dimension, DimensionDescriptor};
use crate::cache::{BoundedCache, CachePolicy};
use crate::conf::CacheSizing;
use crate::conflict::with_conflict_retry;
use crate::error::EtlResult;
use crate::sequence::Sequencer;

/// Key of a resolved value, and whether the row was already in the
/// warehouse before this call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolved {
    pub key: SurrogateKey,
    pub existed: bool,
}

/// Insert-or-fetch of natural values into their dimension tables, through a
/// per-dimension cache.
pub struct DimensionResolver {
    warehouse: Arc<dyn Warehouse>,
    sequencer: Arc<Sequencer>,
    caches: HashMap<Dimension, BoundedCache<String, SurrogateKey>>,
    sequence_batch: u64,
}

impl DimensionResolver {
    pub fn new(
        warehouse: Arc<dyn Warehouse>,
        sequencer: Arc<Sequencer>,
        sizing: CacheSizing,
        sequence_batch: u64,
    ) -> Self {
        let caches = Dimension::ALL
            .iter()
            .map(|dim| {
                let policy = match dim.descriptor().cache {
                    CacheClass::Small => CachePolicy::Unbounded,
                    CacheClass::Large => CachePolicy::Watermark {
                        high: sizing.high_watermark,
                        low: sizing.low_watermark,
                    },
                    CacheClass::Uncached => CachePolicy::Disabled,
                };
                (*dim, BoundedCache::new(policy))
            })
            .collect();
        Self {
            warehouse,
            sequencer,
            caches,
            sequence_batch,
        }
    }

    pub fn warehouse(&self) -> &Arc<dyn Warehouse> {
        &self.warehouse
    }

    pub fn sequencer(&self) -> &Arc<Sequencer> {
        &self.sequencer
    }

    pub async fn resolve(
        &self,
        dim: Dimension,
        raw: &str,
    ) -> EtlResult<Option<SurrogateKey>> {
        Ok(self.resolve_checked(dim, raw).await?.map(|r| r.key))
    }

    /// Like [`Self::resolve`], also reporting whether the value existed.
    /// A cache hit always counts as existing.
    pub async fn resolve_checked(
        &self,
        dim: Dimension,
        raw: &str,
    ) -> EtlResult<Option<Resolved>> {
        self.resolve_with(dim, raw, BTreeMap::new()).await
    }

    /// Resolves `raw`, writing `extra` alongside the derived columns if the
    /// row has to be created. Existing rows are left untouched.
    pub async fn resolve_with(
        &self,
        dim: Dimension,
        raw: &str,
        extra: BTreeMap<String, String>,
    ) -> EtlResult<Option<Resolved>> {
        if raw.trim().is_empty() {
            return Ok(None);
        }
        let desc = dim.descriptor();
        let value = truncate(raw, desc.max_len);
        let cache = self.caches.get(&dim);
        if let Some(key) = cache.and_then(|c| c.get(value)) {
            return Ok(Some(Resolved { key, existed: true }));
        }
        let Some(normalized) = desc.normalizer.apply(value) else {
            debug!("rejected `{}` for `{}`", value, desc.table);
            return Ok(None);
        };
        let normalized = truncate(&normalized, desc.max_len).to_string();
        let resolved = with_conflict_retry(desc.table, &normalized, || {
            self.fetch_or_insert(&desc, &normalized, &extra)
        })
        .await?;
        if let Some(cache) = cache {
            cache.set(value.to_string(), resolved.key);
        }
        Ok(Some(resolved))
    }

    async fn fetch_or_insert(
        &self,
        desc: &DimensionDescriptor,
        value: &str,
        extra: &BTreeMap<String, String>,
    ) -> EtlResult<Resolved> {
        if let Some(row) = self.warehouse.find_by_value(desc.table, value).await?
        {
            return Ok(Resolved {
                key: row.key,
                existed: true,
            });
        }
        let key = self
            .sequencer
            .next_batched(desc.table, self.sequence_batch)
            .await?;
        let mut row = DimensionRow::new(key, value);
        row.attrs = desc.insert.attrs(value);
        row.attrs
            .extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.warehouse.insert(desc.table, row).await?;
        debug!("created {} `{}` as {}", desc.table, value, key);
        Ok(Resolved {
            key,
            existed: false,
        })
    }

    /// Stored row behind `key`, bypassing the cache.
    pub async fn row(
        &self,
        dim: Dimension,
        key: SurrogateKey,
    ) -> EtlResult<Option<DimensionRow>> {
        Ok(self.warehouse.find_by_key(dim.table(), key).await?)
    }

    pub fn is_cached(&self, dim: Dimension, raw: &str) -> bool {
        let value = truncate(raw, dim.descriptor().max_len);
        self.caches
            .get(&dim)
            .and_then(|c| c.get(value))
            .is_some()
    }

    /// Drops every cache whose dimension is scoped to a calendar day.
    pub fn clear_date_scoped(&self) {
        for (dim, cache) in &self.caches {
            if dim.descriptor().date_scoped {
                cache.clear();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use ustat_warehouse::MemoryWarehouse;

    use super::*;
    use crate::error::EtlError;

    fn resolver(wh: Arc<MemoryWarehouse>) -> DimensionResolver {
        let seq = Arc::new(Sequencer::new(wh.clone(), false));
        DimensionResolver::new(wh, seq, CacheSizing::default(), 10)
    }

    #[tokio::test]
    async fn resolution_is_idempotent_across_cache_states() {
        let wh = Arc::new(MemoryWarehouse::new());
        let first = resolver(wh.clone());
        let a = first.resolve(Dimension::Service, "Journals").await.unwrap();
        let b = first.resolve(Dimension::Service, "Journals").await.unwrap();
        assert_eq!(a, b);

        let fresh = resolver(wh.clone());
        let c = fresh.resolve(Dimension::Service, "journals").await.unwrap();
        assert_eq!(a, c);
        assert_eq!(wh.row_count("service").await, 1);
    }

    #[tokio::test]
    async fn empty_and_invalid_values_resolve_to_nothing() {
        let wh = Arc::new(MemoryWarehouse::new());
        let res = resolver(wh.clone());
        assert_eq!(res.resolve(Dimension::Service, "  ").await.unwrap(), None);
        assert_eq!(
            res.resolve(Dimension::Country, "Germany").await.unwrap(),
            None
        );
        assert_eq!(wh.row_count("country").await, 0);
    }

    #[tokio::test]
    async fn long_values_are_truncated_not_rejected() {
        let wh = Arc::new(MemoryWarehouse::new());
        let res = resolver(wh.clone());
        let base = "a".repeat(255);
        let one = format!("{base}{}", "b".repeat(45));
        let two = format!("{base}{}", "c".repeat(10));

        let k1 = res.resolve(Dimension::UserAgent, &one).await.unwrap();
        let k2 = resolver(wh.clone())
            .resolve(Dimension::UserAgent, &two)
            .await
            .unwrap();
        assert!(k1.is_some());
        assert_eq!(k1, k2);

        let row = res.row(Dimension::UserAgent, k1.unwrap()).await.unwrap();
        assert_eq!(row.unwrap().value.chars().count(), 255);
    }

    #[tokio::test]
    async fn checked_variant_reports_existence() {
        let wh = Arc::new(MemoryWarehouse::new());
        let res = resolver(wh.clone());
        let first = res
            .resolve_checked(Dimension::SyndicateGroup, "4,2")
            .await
            .unwrap()
            .unwrap();
        assert!(!first.existed);
        let again = resolver(wh)
            .resolve_checked(Dimension::SyndicateGroup, "2,4")
            .await
            .unwrap()
            .unwrap();
        assert!(again.existed);
        assert_eq!(first.key, again.key);
    }

    #[tokio::test]
    async fn one_lost_race_is_retried_two_are_fatal() {
        let wh = Arc::new(MemoryWarehouse::new());
        let res = resolver(wh.clone());

        wh.fail_next_inserts("referrer", 1).await;
        let key = res
            .resolve(Dimension::Referrer, "https://a.org/x")
            .await
            .unwrap();
        assert!(key.is_some());

        wh.fail_next_inserts("referrer", 2).await;
        let err = res
            .resolve(Dimension::Referrer, "https://b.org/y")
            .await
            .unwrap_err();
        assert!(matches!(err, EtlError::PersistentConflict { .. }));
    }

    #[tokio::test]
    async fn date_scoped_caches_are_cleared() {
        let wh = Arc::new(MemoryWarehouse::new());
        let res = resolver(wh);
        res.resolve(Dimension::ContentItem, "jnl/1/2/a3").await.unwrap();
        res.resolve(Dimension::Country, "de").await.unwrap();
        assert!(res.is_cached(Dimension::ContentItem, "jnl/1/2/a3"));

        res.clear_date_scoped();
        assert!(!res.is_cached(Dimension::ContentItem, "jnl/1/2/a3"));
        assert!(res.is_cached(Dimension::Country, "de"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_workers_share_one_row() {
        let wh = Arc::new(MemoryWarehouse::new());
        let left = Arc::new(resolver(wh.clone()));
        let right = Arc::new(resolver(wh.clone()));

        let a = tokio::spawn({
            let left = left.clone();
            async move { left.resolve(Dimension::Referrer, "https://x.org").await }
        });
        let b = tokio::spawn({
            let right = right.clone();
            async move { right.resolve(Dimension::Referrer, "https://x.org").await }
        });
        let (a, b) = (a.await.unwrap().unwrap(), b.await.unwrap().unwrap());
        assert!(a.is_some());
        assert_eq!(a, b);
        assert_eq!(wh.row_count("referrer").await, 1);
    }
}
