use async_trait::async_trait;

use crate::{
    ContentKey, ContentMetadata, ExternalResult, IdentityAttributes,
    LicenseRecord, ProductRecord, SubscriptionRecord,
};

/// Identity / entitlement directory. All lookups are keyed by opaque
/// string ids.
#[async_trait]
pub trait IdentityService: Send + Sync {
    async fn identity(&self, id: &str) -> ExternalResult<IdentityAttributes>;

    /// Ancestor paths of `id`, each ordered root first and ending with the
    /// direct parent. An identity without parents has no paths.
    async fn ancestor_paths(&self, id: &str) -> ExternalResult<Vec<Vec<String>>>;

    async fn descendants(&self, id: &str) -> ExternalResult<Vec<String>>;

    async fn license(&self, id: &str) -> ExternalResult<LicenseRecord>;

    async fn subscription(&self, id: &str)
        -> ExternalResult<SubscriptionRecord>;

    async fn product(&self, id: &str) -> ExternalResult<ProductRecord>;
}

/// Publishing system holding publication / volume / issue / article
/// metadata.
#[async_trait]
pub trait SourceSystem: Send + Sync {
    async fn content(
        &self,
        key: &ContentKey,
    ) -> ExternalResult<Option<ContentMetadata>>;
}
