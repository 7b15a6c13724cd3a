use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{Datelike, NaiveDate};
use tracing::{debug, warn};
use ustat_external::{ContentKey, ContentMetadata, SourceSystem};
use ustat_warehouse::SurrogateKey;

use crate::cache::{BoundedCache, CachePolicy};
use crate::conf::CacheSizing;
use crate::dimension::{truncate, Dimension, DimensionResolver, UNKNOWN_CONTENT};
use crate::error::{EtlError, EtlResult};

/// Longest free-text field stored from the source system.
pub const MAX_TEXT_LEN: usize = 255;

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Time between an article's online release and an access to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ArticleAge {
    pub years: u32,
    pub days: u32,
}

fn anniversary(release: NaiveDate, years: u32) -> Option<NaiveDate> {
    let year = release.year() + years as i32;
    NaiveDate::from_ymd_opt(year, release.month(), release.day())
        .or_else(|| NaiveDate::from_ymd_opt(year, 2, 28))
}

impl ArticleAge {
    /// Whole years since release, then days since the last anniversary.
    /// An access before the release counts as age zero.
    pub fn between(release: NaiveDate, access: NaiveDate) -> Self {
        if access <= release {
            return Self::default();
        }
        let mut years = (access.year() - release.year()).max(0) as u32;
        let mut last = anniversary(release, years).unwrap_or(release);
        if last > access {
            years = years.saturating_sub(1);
            last = anniversary(release, years).unwrap_or(release);
        }
        Self {
            years,
            days: (access - last).num_days().max(0) as u32,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentInfo {
    pub key: SurrogateKey,
    /// Composite `pub/vol/iss/art` value, or the unknown sentinel.
    pub composite: String,
    pub online_release: Option<NaiveDate>,
    pub age: Option<ArticleAge>,
}

/// Resolves content paths to content-item keys and fills in release dates
/// from the source system the first time an article is seen.
pub struct ContentResolver {
    dims: Arc<DimensionResolver>,
    source: Arc<dyn SourceSystem>,
    releases: BoundedCache<SurrogateKey, Option<NaiveDate>>,
}

impl ContentResolver {
    pub fn new(
        dims: Arc<DimensionResolver>,
        source: Arc<dyn SourceSystem>,
        sizing: CacheSizing,
    ) -> Self {
        Self {
            dims,
            source,
            releases: BoundedCache::new(CachePolicy::Watermark {
                high: sizing.high_watermark,
                low: sizing.low_watermark,
            }),
        }
    }

    pub fn clear_daily(&self) {
        self.releases.clear();
    }

    pub async fn resolve(
        &self,
        path: Option<&str>,
        accessed: NaiveDate,
    ) -> EtlResult<ContentInfo> {
        let parsed = path.and_then(ContentKey::parse);
        let composite = parsed
            .as_ref()
            .map(ContentKey::composite)
            .unwrap_or_else(|| UNKNOWN_CONTENT.to_string());
        let (key, composite) =
            match self.dims.resolve(Dimension::ContentItem, &composite).await? {
                Some(key) => (key, composite),
                None => (self.unknown().await?, UNKNOWN_CONTENT.to_string()),
            };
        let online_release = match &parsed {
            Some(content) if composite != UNKNOWN_CONTENT => {
                self.release_date(key, content).await?
            }
            _ => None,
        };
        Ok(ContentInfo {
            key,
            composite,
            online_release,
            age: online_release.map(|r| ArticleAge::between(r, accessed)),
        })
    }

    async fn unknown(&self) -> EtlResult<SurrogateKey> {
        let key = self
            .dims
            .resolve(Dimension::ContentItem, UNKNOWN_CONTENT)
            .await?;
        key.ok_or_else(|| {
            EtlError::corrupt(
                Dimension::ContentItem.table(),
                0,
                "unknown content sentinel rejected",
            )
        })
    }

    async fn release_date(
        &self,
        key: SurrogateKey,
        content: &ContentKey,
    ) -> EtlResult<Option<NaiveDate>> {
        if let Some(hit) = self.releases.get(&key) {
            return Ok(hit);
        }
        let stored = self
            .dims
            .row(Dimension::ContentItem, key)
            .await?
            .and_then(|row| {
                row.attr("online_release")
                    .and_then(|d| NaiveDate::parse_from_str(d, DATE_FORMAT).ok())
            });
        let release = match stored {
            Some(date) => Some(date),
            None if content.is_article() => self.fetch_release(key, content).await?,
            None => None,
        };
        self.releases.set(key, release);
        Ok(release)
    }

    async fn fetch_release(
        &self,
        key: SurrogateKey,
        content: &ContentKey,
    ) -> EtlResult<Option<NaiveDate>> {
        let meta = match self.source.content(content).await {
            Ok(Some(meta)) => meta,
            Ok(None) => {
                debug!("no source metadata for `{}`", content.composite());
                return Ok(None);
            }
            Err(e) => {
                warn!("source lookup for `{}` failed: {}", content.composite(), e);
                return Ok(None);
            }
        };
        let attrs = metadata_columns(&meta);
        if !attrs.is_empty() {
            self.dims
                .warehouse()
                .update(Dimension::ContentItem.table(), key, attrs)
                .await?;
        }
        Ok(meta.online_release)
    }
}

fn metadata_columns(meta: &ContentMetadata) -> BTreeMap<String, String> {
    let mut attrs = BTreeMap::new();
    if let Some(date) = meta.online_release {
        attrs.insert("online_release".into(), date.format(DATE_FORMAT).to_string());
    }
    if let Some(date) = meta.cover_date {
        attrs.insert("cover_date".into(), date.format(DATE_FORMAT).to_string());
    }
    for (name, text) in [("type", &meta.kind), ("title", &meta.title)] {
        if let Some(text) = text {
            attrs.insert(name.into(), truncate(text, MAX_TEXT_LEN).to_string());
        }
    }
    attrs
}
