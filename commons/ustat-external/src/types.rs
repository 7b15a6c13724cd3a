use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum IdentityKind {
    Individual,
    Institution,
    Hierarchy,
    Consortium,
    Network,
    #[default]
    #[serde(other)]
    Unknown,
}

impl IdentityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentityKind::Individual => "individual",
            IdentityKind::Institution => "institution",
            IdentityKind::Hierarchy => "hierarchy",
            IdentityKind::Consortium => "consortium",
            IdentityKind::Network => "network",
            IdentityKind::Unknown => "unknown",
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityAttributes {
    pub id: String,
    #[serde(default)]
    pub kind: IdentityKind,
    #[serde(default)]
    pub country: Option<String>,
    /// Members inherit this identity's subscriptions.
    #[serde(default)]
    pub shares_subscriptions: bool,
    #[serde(default = "default_true")]
    pub counts_usage: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LicenseRecord {
    pub id: String,
    #[serde(default)]
    pub subscription_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    pub id: String,
    pub holder_id: String,
    #[serde(default)]
    pub product_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductRecord {
    pub id: String,
    #[serde(default)]
    pub free: bool,
    #[serde(default)]
    pub collection: Option<String>,
}

/// Hierarchical address of a content item in the source system.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentKey {
    pub publication: String,
    #[serde(default)]
    pub volume: Option<String>,
    #[serde(default)]
    pub issue: Option<String>,
    #[serde(default)]
    pub article: Option<String>,
}

impl ContentKey {
    /// Parses `pub/vol/iss/art`; trailing levels may be missing.
    pub fn parse(path: &str) -> Option<Self> {
        let mut parts = path
            .trim_matches('/')
            .split('/')
            .map(str::trim)
            .filter(|p| !p.is_empty());
        let publication = parts.next()?.to_string();
        let key = Self {
            publication,
            volume: parts.next().map(str::to_string),
            issue: parts.next().map(str::to_string),
            article: parts.next().map(str::to_string),
        };
        match parts.next() {
            Some(_) => None,
            None => Some(key),
        }
    }

    pub fn composite(&self) -> String {
        [
            Some(self.publication.as_str()),
            self.volume.as_deref(),
            self.issue.as_deref(),
            self.article.as_deref(),
        ]
        .into_iter()
        .map_while(|p| p)
        .collect::<Vec<_>>()
        .join("/")
    }

    pub fn is_article(&self) -> bool {
        self.volume.is_some() && self.issue.is_some() && self.article.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ContentMetadata {
    /// Composite `pub/vol/iss/art` key.
    pub key: String,
    #[serde(default)]
    pub cover_date: Option<NaiveDate>,
    #[serde(default)]
    pub online_release: Option<NaiveDate>,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
}
