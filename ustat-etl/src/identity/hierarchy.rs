use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use tracing::{debug, warn};
use ustat_external::IdentityKind;
use ustat_warehouse::SurrogateKey;

use super::graph::HierarchyGraph;
use super::store::{IdentityRecord, IdentityStore};
use crate::cache::{BoundedCache, CachePolicy};
use crate::dimension::{truncate, Dimension, DimensionResolver};
use crate::error::{EtlError, EtlResult};

/// How an identity took part in a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Role {
    Primary,
    Shared,
    Individual,
    Inherited,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Primary => "primary",
            Role::Shared => "shared",
            Role::Individual => "individual",
            Role::Inherited => "inherited",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "primary" => Some(Role::Primary),
            "shared" => Some(Role::Shared),
            "individual" => Some(Role::Individual),
            "inherited" => Some(Role::Inherited),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionResolution {
    /// Absent for events without a session id.
    pub session_key: Option<SurrogateKey>,
    pub primary_key: SurrogateKey,
    pub counts_usage: bool,
    pub country_key: Option<SurrogateKey>,
    pub syndicate_key: Option<SurrogateKey>,
    pub participants: Vec<(SurrogateKey, Role)>,
}

/// Identity references carried by one event.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityRefs<'a> {
    pub session_id: Option<&'a str>,
    pub identity_ids: &'a [String],
    pub primary_id: Option<&'a str>,
}

fn non_empty(s: Option<&str>) -> Option<&str> {
    s.map(str::trim).filter(|s| !s.is_empty())
}

/// Works out the primary identity, participation roles and syndicate
/// group for the identities of an event, and records them per session.
pub struct HierarchyResolver {
    identities: Arc<IdentityStore>,
    dims: Arc<DimensionResolver>,
    guest_id: String,
    sessions: BoundedCache<String, Arc<SessionResolution>>,
    memberships: BoundedCache<String, Arc<SessionResolution>>,
}

impl HierarchyResolver {
    pub fn new(
        identities: Arc<IdentityStore>,
        dims: Arc<DimensionResolver>,
        guest_id: impl Into<String>,
        session_cache: usize,
    ) -> Self {
        Self {
            identities,
            dims,
            guest_id: guest_id.into(),
            sessions: BoundedCache::new(CachePolicy::Watermark {
                high: session_cache,
                low: session_cache / 4 * 3,
            }),
            memberships: BoundedCache::new(CachePolicy::Unbounded),
        }
    }

    /// Session and membership reuse only holds within one calendar day.
    pub fn clear_daily(&self) {
        self.sessions.clear();
        self.memberships.clear();
    }

    /// `None` means no identity record could be found for the primary; the
    /// event has to be abandoned.
    pub async fn resolve(
        &self,
        refs: IdentityRefs<'_>,
    ) -> EtlResult<Option<Arc<SessionResolution>>> {
        let primary_id = non_empty(refs.primary_id);
        let Some(session_id) = non_empty(refs.session_id) else {
            return match primary_id {
                Some(primary) => self.single(primary).await,
                None => self.classify_cached(refs.identity_ids, None).await,
            };
        };
        let session_id =
            truncate(session_id, Dimension::Session.descriptor().max_len);
        if let Some(hit) = self.sessions.get(session_id) {
            return Ok(Some(hit));
        }
        if let Some(stored) = self.load_session(session_id).await? {
            let stored = Arc::new(stored);
            self.sessions.set(session_id.to_string(), stored.clone());
            return Ok(Some(stored));
        }
        let Some(class) =
            self.classify_cached(refs.identity_ids, primary_id).await?
        else {
            return Ok(None);
        };
        let resolution = Arc::new(self.persist_session(session_id, &class).await?);
        self.sessions.set(session_id.to_string(), resolution.clone());
        Ok(Some(resolution))
    }

    async fn single(&self, id: &str) -> EtlResult<Option<Arc<SessionResolution>>> {
        Ok(self
            .identities
            .by_external_id(id)
            .await?
            .map(|rec| Arc::new(resolution_for(&rec, None, vec![(rec.key, Role::Primary)]))))
    }

    async fn classify_cached(
        &self,
        identity_ids: &[String],
        primary_id: Option<&str>,
    ) -> EtlResult<Option<Arc<SessionResolution>>> {
        let ids: BTreeSet<&str> = identity_ids
            .iter()
            .map(|id| id.trim())
            .filter(|id| !id.is_empty())
            .collect();
        if ids.is_empty() {
            return self.single(primary_id.unwrap_or(&self.guest_id)).await;
        }
        let membership = format!(
            "{}|{}",
            primary_id.unwrap_or_default(),
            ids.iter().copied().collect::<Vec<_>>().join(",")
        );
        if let Some(hit) = self.memberships.get(&membership) {
            return Ok(Some(hit));
        }
        let class = self.classify(&ids, primary_id).await?.map(Arc::new);
        if let Some(class) = &class {
            self.memberships.set(membership, class.clone());
        }
        Ok(class)
    }

    async fn classify(
        &self,
        ids: &BTreeSet<&str>,
        primary_id: Option<&str>,
    ) -> EtlResult<Option<SessionResolution>> {
        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(rec) = self.identities.by_external_id(id).await? {
                if !records.iter().any(|r: &Arc<IdentityRecord>| r.key == rec.key) {
                    records.push(rec);
                }
            }
        }

        let mut contributors = Vec::new();
        let mut pool = BTreeSet::new();
        for rec in records.iter().filter(|r| r.shares_subscriptions && r.is_institutional()) {
            contributors.push(rec.key);
            pool.extend(self.descendants(&rec.external_id).await);
        }
        let mut shared: BTreeSet<String> = records
            .iter()
            .filter(|r| pool.contains(&r.external_id))
            .map(|r| r.external_id.clone())
            .collect();

        let mut paths = HashMap::with_capacity(records.len());
        for rec in &records {
            paths.insert(
                rec.external_id.clone(),
                self.ancestor_paths(&rec.external_id).await,
            );
        }

        let primary = match primary_id {
            Some(primary_id) => {
                let Some(primary) = self.identities.by_external_id(primary_id).await?
                else {
                    return Ok(None);
                };
                for rec in &records {
                    let below_primary = paths
                        .get(&rec.external_id)
                        .is_some_and(|ps| ps.iter().flatten().any(|a| a == primary_id));
                    if rec.key != primary.key && rec.is_institutional() && below_primary {
                        shared.insert(rec.external_id.clone());
                    }
                }
                primary
            }
            None => match self.infer(&records, &paths, &shared) {
                Some(primary) => primary,
                None => match self.identities.by_external_id(&self.guest_id).await? {
                    Some(guest) => {
                        debug!("no primary among {:?}, falling back to guest", ids);
                        guest
                    }
                    None => return Ok(None),
                },
            },
        };

        let participants = participants(&records, &primary, &shared);
        let syndicate_key = self.syndicate(contributors).await?;
        Ok(Some(resolution_for(&primary, syndicate_key, participants)))
    }

    /// Deepest eligible institution; `None` if nothing qualifies. Ties go to
    /// the lowest external id.
    fn infer(
        &self,
        records: &[Arc<IdentityRecord>],
        paths: &HashMap<String, Vec<Vec<String>>>,
        shared: &BTreeSet<String>,
    ) -> Option<Arc<IdentityRecord>> {
        let mut graph = HierarchyGraph::new();
        for rec in records {
            graph.add_node(&rec.external_id);
            for path in paths.get(&rec.external_id).into_iter().flatten() {
                graph.add_path(&rec.external_id, path);
            }
        }
        let depths = graph.depths();

        let mut ignored = BTreeSet::new();
        for rec in records {
            if rec.kind == IdentityKind::Individual && !shared.contains(&rec.external_id) {
                ignored.extend(graph.ancestors(&rec.external_id));
            }
        }

        let mut best: Option<(i64, &Arc<IdentityRecord>)> = None;
        for rec in records {
            let id = rec.external_id.as_str();
            if matches!(rec.kind, IdentityKind::Hierarchy | IdentityKind::Individual)
                || ignored.contains(id)
                || shared.contains(id)
            {
                continue;
            }
            let depth = if id == self.guest_id {
                -1
            } else {
                depths.get(id).copied().unwrap_or(0) as i64
            };
            if best.map_or(true, |(d, _)| depth > d) {
                best = Some((depth, rec));
            }
        }
        best.map(|(_, rec)| rec.clone())
    }

    async fn syndicate(
        &self,
        mut contributors: Vec<SurrogateKey>,
    ) -> EtlResult<Option<SurrogateKey>> {
        if contributors.is_empty() {
            return Ok(None);
        }
        contributors.sort_unstable();
        contributors.dedup();
        let members = contributors
            .iter()
            .map(SurrogateKey::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let Some(group) = self
            .dims
            .resolve_checked(Dimension::SyndicateGroup, &members)
            .await?
        else {
            return Ok(None);
        };
        if !group.existed {
            for member in &contributors {
                self.dims
                    .resolve(
                        Dimension::SyndicateMember,
                        &format!("{}:{}", group.key, member),
                    )
                    .await?;
            }
        }
        Ok(Some(group.key))
    }

    async fn descendants(&self, id: &str) -> Vec<String> {
        match self.identities.service().descendants(id).await {
            Ok(ids) => ids,
            Err(e) => {
                warn!("descendants of `{}` unavailable: {}", id, e);
                Vec::new()
            }
        }
    }

    async fn ancestor_paths(&self, id: &str) -> Vec<Vec<String>> {
        match self.identities.service().ancestor_paths(id).await {
            Ok(paths) => paths,
            Err(e) => {
                warn!("ancestor paths of `{}` unavailable: {}", id, e);
                Vec::new()
            }
        }
    }

    async fn load_session(
        &self,
        session_id: &str,
    ) -> EtlResult<Option<SessionResolution>> {
        let warehouse = self.dims.warehouse();
        let table = Dimension::Session.table();
        let Some(row) = warehouse.find_by_value(table, session_id).await? else {
            return Ok(None);
        };
        let primary_key = row
            .attr_key("primary_key")
            .ok_or_else(|| EtlError::corrupt(table, row.key, "missing primary_key"))?;
        let member_table = Dimension::SessionMember.table();
        let mut participants = Vec::new();
        for member in warehouse
            .scan(member_table, &format!("{}:", row.key))
            .await?
        {
            let identity = member
                .value
                .rsplit(':')
                .next()
                .and_then(|k| k.parse().ok());
            let role = member.attr("role").and_then(Role::parse);
            match (identity, role) {
                (Some(identity), Some(role)) => participants.push((identity, role)),
                _ => {
                    return Err(EtlError::corrupt(
                        member_table,
                        member.key,
                        "unreadable participation",
                    ))
                }
            }
        }
        debug!("session `{}` reused from warehouse", session_id);
        Ok(Some(SessionResolution {
            session_key: Some(row.key),
            primary_key,
            counts_usage: row.attr("counts") != Some("0"),
            country_key: row.attr_key("country_key"),
            syndicate_key: row.attr_key("syndicate_key"),
            participants,
        }))
    }

    async fn persist_session(
        &self,
        session_id: &str,
        class: &SessionResolution,
    ) -> EtlResult<SessionResolution> {
        let mut attrs = BTreeMap::new();
        attrs.insert("primary_key".to_string(), class.primary_key.to_string());
        attrs.insert(
            "counts".to_string(),
            if class.counts_usage { "1" } else { "0" }.to_string(),
        );
        if let Some(country) = class.country_key {
            attrs.insert("country_key".to_string(), country.to_string());
        }
        if let Some(group) = class.syndicate_key {
            attrs.insert("syndicate_key".to_string(), group.to_string());
        }
        let mut resolution = class.clone();
        let Some(session) = self
            .dims
            .resolve_with(Dimension::Session, session_id, attrs)
            .await?
        else {
            return Ok(resolution);
        };
        for (identity, role) in &class.participants {
            let mut attrs = BTreeMap::new();
            attrs.insert("role".to_string(), role.as_str().to_string());
            self.dims
                .resolve_with(
                    Dimension::SessionMember,
                    &format!("{}:{}", session.key, identity),
                    attrs,
                )
                .await?;
        }
        resolution.session_key = Some(session.key);
        Ok(resolution)
    }
}

fn participants(
    records: &[Arc<IdentityRecord>],
    primary: &IdentityRecord,
    shared: &BTreeSet<String>,
) -> Vec<(SurrogateKey, Role)> {
    let mut out: Vec<_> = records
        .iter()
        .map(|rec| {
            let role = if rec.key == primary.key {
                Role::Primary
            } else if shared.contains(&rec.external_id) {
                Role::Shared
            } else if rec.kind == IdentityKind::Individual {
                Role::Individual
            } else {
                Role::Inherited
            };
            (rec.key, role)
        })
        .collect();
    if !out.iter().any(|(key, _)| *key == primary.key) {
        out.push((primary.key, Role::Primary));
    }
    out
}

fn resolution_for(
    primary: &IdentityRecord,
    syndicate_key: Option<SurrogateKey>,
    participants: Vec<(SurrogateKey, Role)>,
) -> SessionResolution {
    SessionResolution {
        session_key: None,
        primary_key: primary.key,
        counts_usage: primary.counts_usage,
        country_key: primary.country_key,
        syndicate_key,
        participants,
    }
}

#[cfg(test)]
mod tests {
    use ustat_external::{IdentityAttributes, StaticDirectory};
    use ustat_warehouse::{MemoryWarehouse, Warehouse};

    use super::*;
    use crate::conf::CacheSizing;
    use crate::sequence::Sequencer;

    fn ident(id: &str, kind: IdentityKind) -> IdentityAttributes {
        IdentityAttributes {
            id: id.into(),
            kind,
            country: Some("at".into()),
            shares_subscriptions: false,
            counts_usage: true,
        }
    }

    struct Fixture {
        wh: Arc<MemoryWarehouse>,
        dir: Arc<StaticDirectory>,
        hierarchy: HierarchyResolver,
        identities: Arc<IdentityStore>,
    }

    fn fixture(wh: Arc<MemoryWarehouse>, dir: Arc<StaticDirectory>) -> Fixture {
        let seq = Arc::new(Sequencer::new(wh.clone(), false));
        let dims = Arc::new(DimensionResolver::new(
            wh.clone(),
            seq,
            CacheSizing::default(),
            10,
        ));
        let identities = Arc::new(IdentityStore::new(dir.clone(), dims.clone(), "unknown"));
        Fixture {
            wh,
            dir,
            hierarchy: HierarchyResolver::new(identities.clone(), dims, "guest", 100),
            identities,
        }
    }

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    async fn key_of(f: &Fixture, id: &str) -> SurrogateKey {
        f.identities.by_external_id(id).await.unwrap().unwrap().key
    }

    fn syndicating_directory() -> StaticDirectory {
        let mut a = ident("A", IdentityKind::Institution);
        a.shares_subscriptions = true;
        StaticDirectory::new()
            .with_identity(a)
            .with_identity(ident("B", IdentityKind::Individual))
            .with_identity(ident("guest", IdentityKind::Institution))
            .with_path("B", &["A"])
    }

    #[tokio::test]
    async fn shared_descendant_leaves_syndicating_institution_primary() {
        let f = fixture(
            Arc::new(MemoryWarehouse::new()),
            Arc::new(syndicating_directory()),
        );
        let list = ids(&["A", "B"]);
        let res = f
            .hierarchy
            .resolve(IdentityRefs {
                session_id: Some("s1"),
                identity_ids: &list,
                primary_id: None,
            })
            .await
            .unwrap()
            .unwrap();
        let a = key_of(&f, "A").await;
        let b = key_of(&f, "B").await;
        assert_eq!(res.primary_key, a);
        assert!(res.participants.contains(&(b, Role::Shared)));
        assert!(res.participants.contains(&(a, Role::Primary)));

        let group = f
            .wh
            .find_by_key("syndicate_group", res.syndicate_key.unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(group.value, a.to_string());
        assert_eq!(f.wh.row_count("syndicate_member").await, 1);
        assert_eq!(f.wh.row_count("session_identity").await, 2);
    }

    #[tokio::test]
    async fn same_membership_reuses_classification_with_new_session() {
        let f = fixture(
            Arc::new(MemoryWarehouse::new()),
            Arc::new(syndicating_directory()),
        );
        let list = ids(&["B", "A"]);
        let first = f
            .hierarchy
            .resolve(IdentityRefs {
                session_id: Some("s1"),
                identity_ids: &list,
                primary_id: None,
            })
            .await
            .unwrap()
            .unwrap();
        let paths_calls = f.dir.calls("ancestor_paths");
        let second = f
            .hierarchy
            .resolve(IdentityRefs {
                session_id: Some("s2"),
                identity_ids: &list,
                primary_id: None,
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(f.dir.calls("ancestor_paths"), paths_calls);
        assert_ne!(first.session_key, second.session_key);
        assert_eq!(first.primary_key, second.primary_key);
        assert_eq!(first.country_key, second.country_key);
        assert_eq!(first.syndicate_key, second.syndicate_key);
        assert_eq!(f.wh.row_count("session").await, 2);
    }

    #[tokio::test]
    async fn stored_session_is_used_verbatim_by_a_fresh_run() {
        let wh = Arc::new(MemoryWarehouse::new());
        let dir = Arc::new(syndicating_directory());
        let list = ids(&["A", "B"]);
        let refs = IdentityRefs {
            session_id: Some("s1"),
            identity_ids: &list,
            primary_id: None,
        };
        let first = fixture(wh.clone(), dir.clone())
            .hierarchy
            .resolve(refs)
            .await
            .unwrap()
            .unwrap();

        let rerun = fixture(wh, dir.clone());
        let calls = dir.calls("identity");
        let again = rerun.hierarchy.resolve(refs).await.unwrap().unwrap();
        assert_eq!(dir.calls("identity"), calls);
        assert_eq!(first.session_key, again.session_key);
        assert_eq!(first.primary_key, again.primary_key);
        assert_eq!(first.syndicate_key, again.syndicate_key);
        let mut a = first.participants.clone();
        let mut b = again.participants.clone();
        a.sort();
        b.sort();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn deepest_institution_wins_and_ties_go_to_lowest_id() {
        let dir = StaticDirectory::new()
            .with_identity(ident("P", IdentityKind::Institution))
            .with_identity(ident("C", IdentityKind::Institution))
            .with_identity(ident("X", IdentityKind::Institution))
            .with_identity(ident("Y", IdentityKind::Institution))
            .with_identity(ident("H", IdentityKind::Hierarchy))
            .with_path("P", &["H"])
            .with_path("C", &["H", "P"]);
        let f = fixture(Arc::new(MemoryWarehouse::new()), Arc::new(dir));

        let list = ids(&["P", "C", "H"]);
        let res = f
            .hierarchy
            .resolve(IdentityRefs {
                identity_ids: &list,
                ..Default::default()
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(res.primary_key, key_of(&f, "C").await);
        assert_eq!(res.session_key, None);

        let list = ids(&["Y", "X"]);
        let res = f
            .hierarchy
            .resolve(IdentityRefs {
                identity_ids: &list,
                ..Default::default()
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(res.primary_key, key_of(&f, "X").await);
    }

    #[tokio::test]
    async fn ancestors_of_individuals_are_ignored() {
        let dir = StaticDirectory::new()
            .with_identity(ident("I", IdentityKind::Individual))
            .with_identity(ident("X", IdentityKind::Institution))
            .with_identity(ident("Y", IdentityKind::Institution))
            .with_path("I", &["X"])
            .with_path("X", &["R"]);
        let f = fixture(Arc::new(MemoryWarehouse::new()), Arc::new(dir));
        let list = ids(&["I", "X", "Y"]);
        let res = f
            .hierarchy
            .resolve(IdentityRefs {
                session_id: Some("s"),
                identity_ids: &list,
                primary_id: None,
            })
            .await
            .unwrap()
            .unwrap();
        let y = key_of(&f, "Y").await;
        let i = key_of(&f, "I").await;
        let x = key_of(&f, "X").await;
        assert_eq!(res.primary_key, y);
        assert!(res.participants.contains(&(i, Role::Individual)));
        assert!(res.participants.contains(&(x, Role::Inherited)));
    }

    #[tokio::test]
    async fn explicit_primary_marks_institutions_below_it_shared() {
        let dir = StaticDirectory::new()
            .with_identity(ident("Top", IdentityKind::Consortium))
            .with_identity(ident("Mid", IdentityKind::Institution))
            .with_identity(ident("Other", IdentityKind::Institution))
            .with_path("Mid", &["Top"]);
        let f = fixture(Arc::new(MemoryWarehouse::new()), Arc::new(dir));
        let list = ids(&["Mid", "Other"]);
        let res = f
            .hierarchy
            .resolve(IdentityRefs {
                session_id: Some("s"),
                identity_ids: &list,
                primary_id: Some("Top"),
            })
            .await
            .unwrap()
            .unwrap();
        let top = key_of(&f, "Top").await;
        assert_eq!(res.primary_key, top);
        assert!(res.participants.contains(&(key_of(&f, "Mid").await, Role::Shared)));
        assert!(res
            .participants
            .contains(&(key_of(&f, "Other").await, Role::Inherited)));
        assert!(res.participants.contains(&(top, Role::Primary)));
    }

    #[tokio::test]
    async fn guest_fallback_and_abandonment() {
        let dir = StaticDirectory::new()
            .with_identity(ident("I", IdentityKind::Individual))
            .with_identity(ident("guest", IdentityKind::Institution));
        let f = fixture(Arc::new(MemoryWarehouse::new()), Arc::new(dir));
        let list = ids(&["I"]);
        let res = f
            .hierarchy
            .resolve(IdentityRefs {
                identity_ids: &list,
                ..Default::default()
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(res.primary_key, key_of(&f, "guest").await);

        let bare = StaticDirectory::new().with_identity(ident("I", IdentityKind::Individual));
        let f = fixture(Arc::new(MemoryWarehouse::new()), Arc::new(bare));
        let res = f
            .hierarchy
            .resolve(IdentityRefs {
                identity_ids: &list,
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(res.is_none());

        let res = f
            .hierarchy
            .resolve(IdentityRefs {
                primary_id: Some("nobody"),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(res.is_none());
    }
}
