use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, warn};
use ustat_external::{ExternalError, ExternalResult, IdentityKind, ProductRecord};
use ustat_warehouse::SurrogateKey;

use crate::cache::{BoundedCache, CachePolicy};
use crate::conf::CacheSizing;
use crate::dimension::{Dimension, DimensionResolver};
use crate::error::EtlResult;
use crate::identity::{IdentityRecord, IdentityStore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LicenseInfo {
    pub key: SurrogateKey,
    pub holder_key: SurrogateKey,
    pub holder_kind: IdentityKind,
    pub free: bool,
    pub collection: Option<String>,
    /// Holder could not be determined; linked to the unknown identity.
    pub unrecorded: bool,
}

/// License to holder linkage, read from the license dimension or, on first
/// sight, from the license / subscription / product chain in the identity
/// service.
pub struct LicenseResolver {
    dims: Arc<DimensionResolver>,
    identities: Arc<IdentityStore>,
    cache: BoundedCache<String, Arc<LicenseInfo>>,
}

impl LicenseResolver {
    pub fn new(
        dims: Arc<DimensionResolver>,
        identities: Arc<IdentityStore>,
        sizing: CacheSizing,
    ) -> Self {
        Self {
            dims,
            identities,
            cache: BoundedCache::new(CachePolicy::Watermark {
                high: sizing.high_watermark,
                low: sizing.low_watermark,
            }),
        }
    }

    pub async fn resolve(&self, license_id: &str) -> EtlResult<Option<Arc<LicenseInfo>>> {
        let license_id = license_id.trim();
        if license_id.is_empty() {
            return Ok(None);
        }
        if let Some(hit) = self.cache.get(license_id) {
            return Ok(Some(hit));
        }
        let Some(key) = self.dims.resolve(Dimension::License, license_id).await? else {
            return Ok(None);
        };
        let row = self.dims.row(Dimension::License, key).await?;
        let stored_holder = row.as_ref().and_then(|r| r.attr_key("holder_key"));
        let info = match (row, stored_holder) {
            (Some(row), Some(holder_key)) => {
                let Some(holder) = self.identities.by_internal_key(holder_key).await? else {
                    return Ok(None);
                };
                LicenseInfo {
                    key,
                    holder_key,
                    holder_kind: holder.kind,
                    free: row.attr("free") == Some("1"),
                    collection: row.attr("collection").map(str::to_string),
                    unrecorded: holder.external_id == self.identities.unknown_id(),
                }
            }
            _ => match self.link(key, license_id).await? {
                Some(info) => info,
                None => return Ok(None),
            },
        };
        let info = Arc::new(info);
        self.cache.set(license_id.to_string(), info.clone());
        Ok(Some(info))
    }

    /// First sighting: follows the entitlement chain and records the holder
    /// on the license row.
    async fn link(
        &self,
        key: SurrogateKey,
        license_id: &str,
    ) -> EtlResult<Option<LicenseInfo>> {
        let (holder, product) = match self.chain(license_id).await {
            Ok((holder_id, product)) => {
                match self.identities.by_external_id(&holder_id).await? {
                    Some(holder) => (Some(holder), product),
                    None => (None, None),
                }
            }
            Err(e) => {
                warn!("license `{}` cannot be traced: {}", license_id, e);
                (None, None)
            }
        };
        let holder: Arc<IdentityRecord> = match holder {
            Some(holder) => holder,
            None => {
                let unknown = self.identities.unknown_id().to_string();
                match self.identities.by_external_id(&unknown).await? {
                    Some(holder) => holder,
                    None => return Ok(None),
                }
            }
        };
        let free = product.as_ref().is_some_and(|p| p.free);
        let collection = product.and_then(|p| p.collection);

        let mut attrs = BTreeMap::new();
        attrs.insert("holder_key".to_string(), holder.key.to_string());
        attrs.insert("free".to_string(), if free { "1" } else { "0" }.to_string());
        if let Some(collection) = &collection {
            attrs.insert("collection".to_string(), collection.clone());
        }
        self.dims
            .warehouse()
            .update(Dimension::License.table(), key, attrs)
            .await?;
        debug!("license `{}` linked to `{}`", license_id, holder.external_id);

        Ok(Some(LicenseInfo {
            key,
            holder_key: holder.key,
            holder_kind: holder.kind,
            free,
            collection,
            unrecorded: holder.external_id == self.identities.unknown_id(),
        }))
    }

    async fn chain(
        &self,
        license_id: &str,
    ) -> ExternalResult<(String, Option<ProductRecord>)> {
        let service = self.identities.service();
        let license = service.license(license_id).await?;
        let subscription_id = license.subscription_id.ok_or_else(|| {
            ExternalError::not_found(format!(
                "subscription of license {license_id}"
            ))
        })?;
        let subscription = service.subscription(&subscription_id).await?;
        let product = match &subscription.product_id {
            Some(product_id) => Some(service.product(product_id).await?),
            None => None,
        };
        Ok((subscription.holder_id, product))
    }
}
