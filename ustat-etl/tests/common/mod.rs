#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use chrono::NaiveDate;
use ustat_etl::{Directory, NoGeoLocator, Pipeline, PrefixLocator, Settings};
use ustat_external::{
    ContentMetadata, IdentityAttributes, IdentityKind, ProductRecord, StaticDirectory,
};
use ustat_warehouse::MemoryWarehouse;

pub fn ident(id: &str, kind: IdentityKind) -> IdentityAttributes {
    IdentityAttributes {
        id: id.into(),
        kind,
        country: Some("AT".into()),
        shares_subscriptions: false,
        counts_usage: true,
    }
}

/// A small institution hierarchy: `Uni` below `Net`, a library `Lib` below
/// `Uni`, and a reader `r1` registered at `Lib`.
pub fn directory() -> StaticDirectory {
    let mut net = ident("Net", IdentityKind::Network);
    net.shares_subscriptions = true;
    StaticDirectory::new()
        .with_identity(ident("guest", IdentityKind::Institution))
        .with_identity(ident("unknown", IdentityKind::Unknown))
        .with_identity(net)
        .with_identity(ident("Uni", IdentityKind::Institution))
        .with_identity(ident("Lib", IdentityKind::Institution))
        .with_identity(ident("r1", IdentityKind::Individual))
        .with_path("Uni", &["Net"])
        .with_path("Lib", &["Net", "Uni"])
        .with_path("r1", &["Net", "Uni", "Lib"])
        .with_license(
            "L1",
            "Uni",
            Some(ProductRecord {
                id: "p1".into(),
                free: false,
                collection: Some("core".into()),
            }),
        )
        .with_content(ContentMetadata {
            key: "jnl/1/2/a3".into(),
            online_release: NaiveDate::from_ymd_opt(2022, 1, 10),
            title: Some("On things".into()),
            ..Default::default()
        })
}

pub fn settings(dir: &Path, worker: &str) -> Settings {
    Settings {
        worker: worker.into(),
        sequence_batch: 5,
        run_date: NaiveDate::from_ymd_opt(2024, 3, 10).unwrap_or_default(),
        delivery_dir: dir.join("delivery"),
        loader_dir: Some(dir.join("loader")),
        progress_dir: dir.join("progress"),
        ..Default::default()
    }
}

pub struct TestEnvironment {
    pub warehouse: Arc<MemoryWarehouse>,
    pub directory: Arc<StaticDirectory>,
    pub dir: tempfile::TempDir,
}

impl TestEnvironment {
    pub fn new() -> Self {
        Self {
            warehouse: Arc::new(MemoryWarehouse::new()),
            directory: Arc::new(directory()),
            dir: tempfile::tempdir().unwrap(),
        }
    }

    pub fn settings(&self, worker: &str) -> Settings {
        settings(self.dir.path(), worker)
    }

    pub fn pipeline(&self, settings: Settings) -> Pipeline {
        Pipeline::new(
            settings,
            self.warehouse.clone(),
            Directory {
                identity: self.directory.clone(),
                source: self.directory.clone(),
            },
            Arc::new(PrefixLocator::new([("10.1.", "DE")])),
            "r1",
        )
    }

    pub fn pipeline_without_geo(&self, settings: Settings) -> Pipeline {
        Pipeline::new(
            settings,
            self.warehouse.clone(),
            Directory {
                identity: self.directory.clone(),
                source: self.directory.clone(),
            },
            Arc::new(NoGeoLocator),
            "r1",
        )
    }

    pub fn delivered(&self) -> Vec<String> {
        list_csv(&self.dir.path().join("delivery"))
    }
}

/// Names of the published csv files in `dir`, sorted.
pub fn list_csv(dir: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|n| n.ends_with(".csv"))
        .collect();
    names.sort();
    names
}

/// One tab-delimited log line.
pub fn tab_line(
    ts: &str,
    ip: &str,
    session: &str,
    identities: &str,
    license: &str,
    content: &str,
) -> String {
    [
        ts, "journals", "200", ip, session, identities, "-", license, content, "curl/8", "-",
    ]
    .join("\t")
}
