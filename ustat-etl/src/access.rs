use std::sync::Arc;

use chrono::NaiveDate;
use tokio::sync::OnceCell;
use tracing::{info, warn};
use ustat_external::IdentityKind;
use ustat_warehouse::{DimensionRow, SurrogateKey};

use crate::content::ArticleAge;
use crate::dimension::{Dimension, DimensionResolver};
use crate::error::{EtlError, EtlResult};
use crate::license::LicenseInfo;

/// Warehouse table holding promotional access grants.
pub const PROMOTION_TABLE: &str = "promotion";

/// Identity scope matching every identity.
pub const ANY_IDENTITY: &str = "*";

const NONE: &str = "-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessRole {
    Individual,
    Free,
    Consortium,
    Institution,
    Unlicensed,
    LicenseNotYetRecorded,
    LicenseNotChecked,
}

impl AccessRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessRole::Individual => "individual",
            AccessRole::Free => "free",
            AccessRole::Consortium => "consortium",
            AccessRole::Institution => "institution",
            AccessRole::Unlicensed => "unlicensed",
            AccessRole::LicenseNotYetRecorded => "license_not_yet_recorded",
            AccessRole::LicenseNotChecked => "license_not_checked",
        }
    }
}

/// A promotional grant: every access matching scope, content prefix and
/// date range is tagged with `reason`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Promotion {
    pub reason: String,
    /// `None` applies to every identity.
    pub identity: Option<String>,
    pub prefix: String,
    pub from: NaiveDate,
    pub to: NaiveDate,
}

impl Promotion {
    fn from_row(row: &DimensionRow) -> Option<Self> {
        let date = |name| {
            row.attr(name)
                .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
        };
        Some(Self {
            reason: row.attr("reason").unwrap_or(&row.value).to_string(),
            identity: row
                .attr("identity")
                .filter(|id| *id != ANY_IDENTITY && !id.is_empty())
                .map(str::to_string),
            prefix: row.attr("prefix").unwrap_or_default().to_string(),
            from: date("from")?,
            to: date("to")?,
        })
    }

    pub fn matches(&self, identity: &str, content: &str, day: NaiveDate) -> bool {
        self.identity.as_deref().map_or(true, |id| id == identity)
            && content.starts_with(&self.prefix)
            && self.from <= day
            && day <= self.to
    }
}

/// Inputs of the access classification for one event.
#[derive(Debug, Clone, Copy)]
pub struct AccessRequest<'a> {
    pub license: Option<&'a LicenseInfo>,
    /// External id of the primary identity.
    pub identity: &'a str,
    /// Composite content value.
    pub content: &'a str,
    pub day: NaiveDate,
    pub age: Option<ArticleAge>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessClass {
    pub key: SurrogateKey,
    pub role: AccessRole,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct AccessWindow {
    /// Accesses before this date were never license-checked.
    pub license_check_start: NaiveDate,
    /// Licenses linked to the unknown identity within this many days of
    /// the run date may simply not be recorded yet.
    pub grace_days: i64,
    pub run_date: NaiveDate,
}

pub struct AccessResolver {
    dims: Arc<DimensionResolver>,
    window: AccessWindow,
    promotions: OnceCell<Vec<Promotion>>,
}

impl AccessResolver {
    pub fn new(dims: Arc<DimensionResolver>, window: AccessWindow) -> Self {
        Self {
            dims,
            window,
            promotions: OnceCell::new(),
        }
    }

    pub fn role(&self, license: Option<&LicenseInfo>, day: NaiveDate) -> AccessRole {
        match license {
            None if day < self.window.license_check_start => AccessRole::LicenseNotChecked,
            None => AccessRole::Unlicensed,
            Some(l) if l.unrecorded => {
                if (self.window.run_date - day).num_days() <= self.window.grace_days {
                    AccessRole::LicenseNotYetRecorded
                } else {
                    AccessRole::Unlicensed
                }
            }
            Some(l) if l.free => AccessRole::Free,
            Some(l) => match l.holder_kind {
                IdentityKind::Individual => AccessRole::Individual,
                IdentityKind::Consortium | IdentityKind::Network => AccessRole::Consortium,
                _ => AccessRole::Institution,
            },
        }
    }

    async fn promotions(&self) -> EtlResult<&[Promotion]> {
        let loaded = self
            .promotions
            .get_or_try_init(|| async {
                let rows = self.dims.warehouse().scan(PROMOTION_TABLE, "").await?;
                let mut promotions = Vec::with_capacity(rows.len());
                for row in &rows {
                    match Promotion::from_row(row) {
                        Some(p) => promotions.push(p),
                        None => warn!("ignoring promotion `{}` without a date range", row.value),
                    }
                }
                info!("loaded {} promotions", promotions.len());
                Ok::<_, EtlError>(promotions)
            })
            .await?;
        Ok(loaded)
    }

    /// Reason of the first promotion covering this access.
    pub async fn promotion(
        &self,
        identity: &str,
        content: &str,
        day: NaiveDate,
    ) -> EtlResult<Option<String>> {
        Ok(self
            .promotions()
            .await?
            .iter()
            .find(|p| p.matches(identity, content, day))
            .map(|p| p.reason.clone()))
    }

    pub async fn resolve(&self, req: AccessRequest<'_>) -> EtlResult<Option<AccessClass>> {
        let role = self.role(req.license, req.day);
        let reason = self.promotion(req.identity, req.content, req.day).await?;
        let collection = req.license.and_then(|l| l.collection.as_deref());
        let tuple = format!(
            "{}|{}|{}|{}",
            role.as_str(),
            reason.as_deref().unwrap_or(NONE),
            collection.unwrap_or(NONE),
            req.age.map(|a| a.years.to_string()).as_deref().unwrap_or(NONE),
        );
        Ok(self
            .dims
            .resolve(Dimension::Access, &tuple)
            .await?
            .map(|key| AccessClass { key, role, reason }))
    }
}

#[cfg(test)]
mod tests {
    use ustat_warehouse::{MemoryWarehouse, Warehouse};

    use super::*;
    use crate::conf::CacheSizing;
    use crate::sequence::Sequencer;

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn resolver(wh: Arc<MemoryWarehouse>) -> AccessResolver {
        let seq = Arc::new(Sequencer::new(wh.clone(), false));
        let dims = Arc::new(DimensionResolver::new(wh, seq, CacheSizing::default(), 10));
        AccessResolver::new(
            dims,
            AccessWindow {
                license_check_start: day("2010-01-01"),
                grace_days: 2,
                run_date: day("2024-06-10"),
            },
        )
    }

    fn license(kind: IdentityKind, free: bool, unrecorded: bool) -> LicenseInfo {
        LicenseInfo {
            key: 1,
            holder_key: 2,
            holder_kind: kind,
            free,
            collection: None,
            unrecorded,
        }
    }

    #[test]
    fn roles_follow_holder_and_time_windows() {
        let access = resolver(Arc::new(MemoryWarehouse::new()));
        let today = day("2024-06-10");
        assert_eq!(access.role(None, day("2009-12-31")), AccessRole::LicenseNotChecked);
        assert_eq!(access.role(None, today), AccessRole::Unlicensed);

        let unknown = license(IdentityKind::Unknown, false, true);
        assert_eq!(
            access.role(Some(&unknown), day("2024-06-08")),
            AccessRole::LicenseNotYetRecorded
        );
        assert_eq!(access.role(Some(&unknown), day("2024-06-01")), AccessRole::Unlicensed);

        let free = license(IdentityKind::Individual, true, false);
        assert_eq!(access.role(Some(&free), today), AccessRole::Free);
        let person = license(IdentityKind::Individual, false, false);
        assert_eq!(access.role(Some(&person), today), AccessRole::Individual);
        let consortium = license(IdentityKind::Consortium, false, false);
        assert_eq!(access.role(Some(&consortium), today), AccessRole::Consortium);
        let inst = license(IdentityKind::Institution, false, false);
        assert_eq!(access.role(Some(&inst), today), AccessRole::Institution);
    }

    #[tokio::test]
    async fn promotions_match_scope_prefix_and_dates() {
        let wh = Arc::new(MemoryWarehouse::new());
        wh.insert(
            PROMOTION_TABLE,
            DimensionRow::new(1, "spring")
                .with_attr("reason", "trial")
                .with_attr("identity", "*")
                .with_attr("prefix", "jnl/")
                .with_attr("from", "2024-03-01")
                .with_attr("to", "2024-05-31"),
        )
        .await
        .unwrap();
        wh.insert(
            PROMOTION_TABLE,
            DimensionRow::new(2, "broken").with_attr("reason", "x"),
        )
        .await
        .unwrap();
        let access = resolver(wh);

        let hit = access.promotion("inst", "jnl/1/2", day("2024-05-31")).await.unwrap();
        assert_eq!(hit.as_deref(), Some("trial"));
        let late = access.promotion("inst", "jnl/1/2", day("2024-06-01")).await.unwrap();
        assert_eq!(late, None);
        let other = access.promotion("inst", "book/1", day("2024-04-01")).await.unwrap();
        assert_eq!(other, None);
    }

    #[tokio::test]
    async fn identical_tuples_share_a_key() {
        let access = resolver(Arc::new(MemoryWarehouse::new()));
        let inst = license(IdentityKind::Institution, false, false);
        let req = AccessRequest {
            license: Some(&inst),
            identity: "inst",
            content: "jnl/1/1/a1",
            day: day("2024-06-10"),
            age: Some(ArticleAge { years: 3, days: 20 }),
        };
        let a = access.resolve(req).await.unwrap().unwrap();
        let b = access
            .resolve(AccessRequest {
                age: Some(ArticleAge { years: 3, days: 200 }),
                ..req
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(a.key, b.key);
        assert_eq!(a.role, AccessRole::Institution);
        assert_eq!(a.reason, None);

        let c = access.resolve(AccessRequest { license: None, ..req }).await.unwrap().unwrap();
        assert_ne!(a.key, c.key);
    }
}
