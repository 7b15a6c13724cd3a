use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, warn};
use ustat_external::{IdentityAttributes, IdentityKind, IdentityService};
use ustat_warehouse::SurrogateKey;

use crate::dimension::{Dimension, DimensionResolver};
use crate::error::EtlResult;

/// An identity as known to this run: directory attributes plus its key in
/// the identity dimension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityRecord {
    pub key: SurrogateKey,
    pub external_id: String,
    pub kind: IdentityKind,
    pub country: Option<String>,
    pub country_key: Option<SurrogateKey>,
    pub shares_subscriptions: bool,
    pub counts_usage: bool,
}

impl IdentityRecord {
    /// Institutions and the groupings above them; never individuals.
    pub fn is_institutional(&self) -> bool {
        !matches!(self.kind, IdentityKind::Individual)
    }

    fn columns(&self) -> BTreeMap<String, String> {
        let mut cols = BTreeMap::new();
        cols.insert("kind".to_string(), self.kind.as_str().to_string());
        cols.insert(
            "country_key".to_string(),
            self.country_key.map(|k| k.to_string()).unwrap_or_default(),
        );
        cols.insert("counts".to_string(), flag(self.counts_usage));
        cols.insert("shares".to_string(), flag(self.shares_subscriptions));
        cols
    }
}

fn flag(on: bool) -> String {
    if on { "1" } else { "0" }.to_string()
}

/// Run-scoped identity lookups, cached by external id and by surrogate
/// key. Failed lookups are cached as absent and not retried.
pub struct IdentityStore {
    service: Arc<dyn IdentityService>,
    dims: Arc<DimensionResolver>,
    unknown_id: String,
    by_external: scc::HashMap<String, Option<Arc<IdentityRecord>>>,
    by_key: scc::HashMap<SurrogateKey, Arc<IdentityRecord>>,
}

impl IdentityStore {
    pub fn new(
        service: Arc<dyn IdentityService>,
        dims: Arc<DimensionResolver>,
        unknown_id: impl Into<String>,
    ) -> Self {
        Self {
            service,
            dims,
            unknown_id: unknown_id.into(),
            by_external: scc::HashMap::new(),
            by_key: scc::HashMap::new(),
        }
    }

    pub fn unknown_id(&self) -> &str {
        &self.unknown_id
    }

    pub fn service(&self) -> &Arc<dyn IdentityService> {
        &self.service
    }

    pub async fn by_external_id(
        &self,
        id: &str,
    ) -> EtlResult<Option<Arc<IdentityRecord>>> {
        let id = id.trim();
        if id.is_empty() {
            return Ok(None);
        }
        let max_len = Dimension::Identity.descriptor().max_len;
        if id.chars().count() > max_len {
            warn!("identity `{}` is longer than {} characters, ignored", id, max_len);
            return Ok(None);
        }
        if let Some(hit) = self.by_external.read_async(id, |_, v| v.clone()).await
        {
            return Ok(hit);
        }
        let attrs = match self.service.identity(id).await {
            Ok(attrs) => Some(attrs),
            Err(e) if id == self.unknown_id => {
                debug!("sentinel identity `{}` not in directory: {}", id, e);
                Some(IdentityAttributes {
                    id: id.to_string(),
                    kind: IdentityKind::Unknown,
                    country: None,
                    shares_subscriptions: false,
                    counts_usage: true,
                })
            }
            Err(e) => {
                warn!("identity `{}` could not be looked up: {}", id, e);
                None
            }
        };
        let record = match attrs {
            Some(attrs) => self.persist(id, attrs).await?.map(Arc::new),
            None => None,
        };
        if let Some(record) = &record {
            self.by_key.upsert_async(record.key, record.clone()).await;
        }
        self.by_external
            .upsert_async(id.to_string(), record.clone())
            .await;
        Ok(record)
    }

    pub async fn by_internal_key(
        &self,
        key: SurrogateKey,
    ) -> EtlResult<Option<Arc<IdentityRecord>>> {
        if let Some(hit) = self.by_key.read_async(&key, |_, v| v.clone()).await {
            return Ok(Some(hit));
        }
        match self.dims.row(Dimension::Identity, key).await? {
            Some(row) => self.by_external_id(&row.value).await,
            None => Ok(None),
        }
    }

    /// Fetches or inserts the identity row and brings its attributes up to
    /// date with the directory.
    async fn persist(
        &self,
        id: &str,
        attrs: IdentityAttributes,
    ) -> EtlResult<Option<IdentityRecord>> {
        let country_key = match attrs.country.as_deref() {
            Some(code) => self.dims.resolve(Dimension::Country, code).await?,
            None => None,
        };
        let mut record = IdentityRecord {
            key: 0,
            external_id: id.to_string(),
            kind: attrs.kind,
            country: attrs.country,
            country_key,
            shares_subscriptions: attrs.shares_subscriptions,
            counts_usage: attrs.counts_usage,
        };
        let columns = record.columns();
        let Some(resolved) = self
            .dims
            .resolve_with(Dimension::Identity, id, columns.clone())
            .await?
        else {
            return Ok(None);
        };
        record.key = resolved.key;
        if resolved.existed {
            let stored = self.dims.row(Dimension::Identity, resolved.key).await?;
            let stale = stored.map_or(true, |row| {
                columns.iter().any(|(k, v)| row.attr(k) != Some(v.as_str()))
            });
            if stale {
                debug!("updating identity `{}` ({})", id, resolved.key);
                self.dims
                    .warehouse()
                    .update(Dimension::Identity.table(), resolved.key, columns)
                    .await?;
            }
        }
        Ok(Some(record))
    }
}

#[cfg(test)]
mod tests {
    use ustat_external::StaticDirectory;
    use ustat_warehouse::{DimensionRow, MemoryWarehouse, Warehouse};

    use super::*;
    use crate::conf::CacheSizing;
    use crate::sequence::Sequencer;

    fn attrs(id: &str, kind: IdentityKind, country: Option<&str>) -> IdentityAttributes {
        IdentityAttributes {
            id: id.into(),
            kind,
            country: country.map(str::to_string),
            shares_subscriptions: false,
            counts_usage: true,
        }
    }

    fn store(
        wh: Arc<MemoryWarehouse>,
        dir: Arc<StaticDirectory>,
    ) -> IdentityStore {
        let seq = Arc::new(Sequencer::new(wh.clone(), false));
        let dims = Arc::new(DimensionResolver::new(
            wh,
            seq,
            CacheSizing::default(),
            5,
        ));
        IdentityStore::new(dir, dims, "unknown")
    }

    #[tokio::test]
    async fn lookups_are_cached_both_ways() {
        let wh = Arc::new(MemoryWarehouse::new());
        let dir = Arc::new(
            StaticDirectory::new()
                .with_identity(attrs("inst", IdentityKind::Institution, Some("de"))),
        );
        let store = store(wh.clone(), dir.clone());

        let rec = store.by_external_id("inst").await.unwrap().unwrap();
        assert!(rec.country_key.is_some());
        let again = store.by_internal_key(rec.key).await.unwrap().unwrap();
        assert_eq!(rec, again);
        store.by_external_id("inst").await.unwrap();
        assert_eq!(dir.calls("identity"), 1);
        assert_eq!(wh.row_count("identity").await, 1);
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn failed_lookup_is_cached_as_absent() {
        let wh = Arc::new(MemoryWarehouse::new());
        let dir = Arc::new(StaticDirectory::new());
        let store = store(wh, dir.clone());

        assert!(store.by_external_id("ghost").await.unwrap().is_none());
        assert!(store.by_external_id("ghost").await.unwrap().is_none());
        assert_eq!(dir.calls("identity"), 1);
        assert!(logs_contain("could not be looked up"));

        let unknown = store.by_external_id("unknown").await.unwrap().unwrap();
        assert_eq!(unknown.kind, IdentityKind::Unknown);
    }

    #[tokio::test]
    async fn existing_rows_pick_up_changed_attributes() {
        let wh = Arc::new(MemoryWarehouse::new());
        wh.insert(
            "identity",
            DimensionRow::new(40, "inst").with_attr("kind", "individual"),
        )
        .await
        .unwrap();
        let dir = Arc::new(
            StaticDirectory::new()
                .with_identity(attrs("inst", IdentityKind::Consortium, None)),
        );
        let store = store(wh.clone(), dir);

        let rec = store.by_external_id("inst").await.unwrap().unwrap();
        assert_eq!(rec.key, 40);
        let row = wh.find_by_key("identity", 40).await.unwrap().unwrap();
        assert_eq!(row.attr("kind"), Some("consortium"));
        assert_eq!(row.attr("counts"), Some("1"));
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn over_long_ids_are_ignored_not_merged() {
        let wh = Arc::new(MemoryWarehouse::new());
        let base = "i".repeat(255);
        let long = format!("{base}-a");
        let dir = Arc::new(
            StaticDirectory::new()
                .with_identity(attrs(&base, IdentityKind::Institution, None))
                .with_identity(attrs(&long, IdentityKind::Institution, None)),
        );
        let store = store(wh.clone(), dir.clone());

        assert!(store.by_external_id(&base).await.unwrap().is_some());
        assert!(store.by_external_id(&long).await.unwrap().is_none());
        assert!(logs_contain("is longer than 255 characters"));
        assert_eq!(dir.calls("identity"), 1);
        assert_eq!(wh.row_count("identity").await, 1);
    }

    #[tokio::test]
    async fn unknown_internal_key_is_absent() {
        let wh = Arc::new(MemoryWarehouse::new());
        let store = store(wh, Arc::new(StaticDirectory::new()));
        assert!(store.by_internal_key(99).await.unwrap().is_none());
    }
}
