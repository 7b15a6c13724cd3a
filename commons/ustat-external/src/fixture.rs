use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    ContentKey, ContentMetadata, ExternalError, ExternalResult,
    IdentityAttributes, IdentityService, LicenseRecord, ProductRecord,
    SourceSystem, SubscriptionRecord,
};

/// Serialized directory snapshot, as exported for offline runs.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct DirectoryFixture {
    #[serde(default)]
    pub identities: Vec<IdentityAttributes>,
    #[serde(default)]
    pub ancestor_paths: HashMap<String, Vec<Vec<String>>>,
    /// Explicit descendant listings. Identities without an entry get the
    /// descendants implied by `ancestor_paths`.
    #[serde(default)]
    pub descendants: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub licenses: Vec<LicenseRecord>,
    #[serde(default)]
    pub subscriptions: Vec<SubscriptionRecord>,
    #[serde(default)]
    pub products: Vec<ProductRecord>,
    #[serde(default)]
    pub content: Vec<ContentMetadata>,
}

/// In-process directory serving both the identity service and the source
/// system from a [`DirectoryFixture`].
#[derive(Default)]
pub struct StaticDirectory {
    identities: HashMap<String, IdentityAttributes>,
    ancestor_paths: HashMap<String, Vec<Vec<String>>>,
    descendants: HashMap<String, Vec<String>>,
    licenses: HashMap<String, LicenseRecord>,
    subscriptions: HashMap<String, SubscriptionRecord>,
    products: HashMap<String, ProductRecord>,
    content: HashMap<String, ContentMetadata>,
    calls: Mutex<HashMap<&'static str, u64>>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_fixture(fixture: DirectoryFixture) -> Self {
        let mut dir = Self::new();
        for attrs in fixture.identities {
            dir = dir.with_identity(attrs);
        }
        for (id, paths) in fixture.ancestor_paths {
            dir.ancestor_paths.insert(id, paths);
        }
        dir.descendants = fixture.descendants;
        for license in fixture.licenses {
            dir.licenses.insert(license.id.clone(), license);
        }
        for sub in fixture.subscriptions {
            dir.subscriptions.insert(sub.id.clone(), sub);
        }
        for product in fixture.products {
            dir.products.insert(product.id.clone(), product);
        }
        for meta in fixture.content {
            dir = dir.with_content(meta);
        }
        dir
    }

    pub async fn load(path: impl AsRef<Path>) -> ExternalResult<Self> {
        let raw = tokio::fs::read_to_string(path.as_ref()).await?;
        let fixture: DirectoryFixture = serde_json::from_str(&raw)?;
        info!(
            "loaded directory fixture {} ({} identities)",
            path.as_ref().display(),
            fixture.identities.len()
        );
        Ok(Self::from_fixture(fixture))
    }

    pub fn with_identity(mut self, attrs: IdentityAttributes) -> Self {
        self.identities.insert(attrs.id.clone(), attrs);
        self
    }

    /// Records `path` as one ancestor path of `id` (root first).
    pub fn with_path(mut self, id: &str, path: &[&str]) -> Self {
        self.ancestor_paths
            .entry(id.to_string())
            .or_default()
            .push(path.iter().map(|s| s.to_string()).collect());
        self
    }

    pub fn with_license(
        mut self,
        license: &str,
        holder: &str,
        product: Option<ProductRecord>,
    ) -> Self {
        let sub_id = format!("sub-{license}");
        self.licenses.insert(
            license.to_string(),
            LicenseRecord {
                id: license.to_string(),
                subscription_id: Some(sub_id.clone()),
            },
        );
        self.subscriptions.insert(
            sub_id.clone(),
            SubscriptionRecord {
                id: sub_id,
                holder_id: holder.to_string(),
                product_id: product.as_ref().map(|p| p.id.clone()),
            },
        );
        if let Some(product) = product {
            self.products.insert(product.id.clone(), product);
        }
        self
    }

    pub fn with_content(mut self, meta: ContentMetadata) -> Self {
        self.content.insert(meta.key.clone(), meta);
        self
    }

    /// Number of calls made to the named operation so far.
    pub fn calls(&self, op: &str) -> u64 {
        self.calls
            .lock()
            .map(|calls| calls.get(op).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    fn record(&self, op: &'static str) {
        if let Ok(mut calls) = self.calls.lock() {
            *calls.entry(op).or_default() += 1;
        }
    }
}

#[async_trait]
impl IdentityService for StaticDirectory {
    async fn identity(&self, id: &str) -> ExternalResult<IdentityAttributes> {
        self.record("identity");
        self.identities
            .get(id)
            .cloned()
            .ok_or_else(|| ExternalError::not_found(format!("identity {id}")))
    }

    async fn ancestor_paths(
        &self,
        id: &str,
    ) -> ExternalResult<Vec<Vec<String>>> {
        self.record("ancestor_paths");
        Ok(self.ancestor_paths.get(id).cloned().unwrap_or_default())
    }

    async fn descendants(&self, id: &str) -> ExternalResult<Vec<String>> {
        self.record("descendants");
        if let Some(explicit) = self.descendants.get(id) {
            return Ok(explicit.clone());
        }
        let implied: BTreeSet<String> = self
            .ancestor_paths
            .iter()
            .filter(|(_, paths)| {
                paths.iter().any(|path| path.iter().any(|p| p == id))
            })
            .map(|(child, _)| child.clone())
            .collect();
        Ok(implied.into_iter().collect())
    }

    async fn license(&self, id: &str) -> ExternalResult<LicenseRecord> {
        self.record("license");
        self.licenses
            .get(id)
            .cloned()
            .ok_or_else(|| ExternalError::not_found(format!("license {id}")))
    }

    async fn subscription(
        &self,
        id: &str,
    ) -> ExternalResult<SubscriptionRecord> {
        self.record("subscription");
        self.subscriptions.get(id).cloned().ok_or_else(|| {
            ExternalError::not_found(format!("subscription {id}"))
        })
    }

    async fn product(&self, id: &str) -> ExternalResult<ProductRecord> {
        self.record("product");
        self.products
            .get(id)
            .cloned()
            .ok_or_else(|| ExternalError::not_found(format!("product {id}")))
    }
}

#[async_trait]
impl SourceSystem for StaticDirectory {
    async fn content(
        &self,
        key: &ContentKey,
    ) -> ExternalResult<Option<ContentMetadata>> {
        self.record("content");
        Ok(self.content.get(&key.composite()).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::IdentityKind;

    #[tokio::test]
    async fn fixture_file_round_trips_into_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("directory.json");
        std::fs::write(
            &path,
            r#"{
                "identities": [
                    {"id": "inst", "kind": "institution", "country": "DE"},
                    {"id": "dept", "kind": "hierarchy"}
                ],
                "ancestor_paths": {"dept": [["inst"]]}
            }"#,
        )
        .unwrap();

        let directory = StaticDirectory::load(&path).await.unwrap();
        let inst = directory.identity("inst").await.unwrap();
        assert_eq!(inst.kind, IdentityKind::Institution);
        assert_eq!(inst.country.as_deref(), Some("DE"));
        assert_eq!(directory.descendants("inst").await.unwrap(), vec!["dept"]);
        assert!(directory.identity("nobody").await.is_err());
        assert_eq!(directory.calls("identity"), 2);
    }

    #[tokio::test]
    async fn license_chain_resolves_to_holder() {
        let directory = StaticDirectory::new().with_license(
            "L1",
            "inst",
            Some(ProductRecord {
                id: "P1".into(),
                free: false,
                collection: Some("journals".into()),
            }),
        );
        let license = directory.license("L1").await.unwrap();
        let sub = directory
            .subscription(license.subscription_id.as_deref().unwrap())
            .await
            .unwrap();
        assert_eq!(sub.holder_id, "inst");
        let product = directory.product("P1").await.unwrap();
        assert_eq!(product.collection.as_deref(), Some("journals"));
    }
}
