mod access;
mod cache;
mod conf;
mod conflict;
mod content;
mod dimension;
mod error;
mod event;
mod fact;
mod geo;
mod identity;
mod input;
mod license;
mod pipeline;
mod progress;
mod sequence;
mod summary;
mod writer;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use tokio::io::BufReader;
use tracing::{info, warn};
use ustat_external::{HttpDirectory, HttpDirectoryConfig, StaticDirectory};
use ustat_warehouse::{MemoryWarehouse, Warehouse};

pub use access::{AccessRole, PROMOTION_TABLE};
pub use conf::{CacheSizing, EtlConfig, Settings};
pub use dimension::{Dimension, DimensionResolver};
pub use error::{EtlError, EtlResult};
pub use event::{AbandonReason, EventOutcome, SkipReason};
pub use fact::{Column, FACT_COLUMNS, FACT_SEQUENCE};
pub use geo::{GeoLocator, NoGeoLocator, PrefixLocator};
pub use pipeline::{Directory, Pipeline, RunReport};
pub use progress::ProgressMarker;
pub use summary::RunSummary;
pub use writer::Published;

pub fn open_warehouse(conf: &EtlConfig) -> EtlResult<Arc<dyn Warehouse>> {
    match &conf.warehouse_path {
        #[cfg(feature = "sqlite")]
        Some(path) => {
            let warehouse = ustat_warehouse::SqliteWarehouse::open(path)?;
            info!("using sqlite warehouse at {}", path);
            Ok(Arc::new(warehouse))
        }
        #[cfg(not(feature = "sqlite"))]
        Some(path) => Err(EtlError::config(format!(
            "warehouse `{path}` needs the sqlite feature"
        ))),
        None => {
            warn!("no warehouse configured, dimension rows will not outlive this run");
            Ok(Arc::new(MemoryWarehouse::new()))
        }
    }
}

pub async fn open_directory(conf: &EtlConfig) -> EtlResult<Directory> {
    if let Some(fixture) = &conf.directory_fixture {
        let directory = Arc::new(StaticDirectory::load(fixture).await?);
        info!("using directory snapshot {}", fixture);
        return Ok(Directory {
            identity: directory.clone(),
            source: directory,
        });
    }
    let Some(identity_url) = &conf.identity_url else {
        return Err(EtlError::config(
            "either USTAT_DIRECTORY_FIXTURE or USTAT_IDENTITY_URL must be set",
        ));
    };
    let directory = Arc::new(HttpDirectory::new(HttpDirectoryConfig {
        identity_url: identity_url.clone(),
        source_url: conf.source_url.clone(),
        username: conf.identity_user.clone(),
        password: conf.identity_password.clone(),
        timeout: Duration::from_secs(conf.service_timeout_secs),
    })?);
    Ok(Directory {
        identity: directory.clone(),
        source: directory,
    })
}

pub fn open_geo(conf: &EtlConfig) -> EtlResult<Arc<dyn GeoLocator>> {
    match &conf.geo_prefixes {
        Some(raw) => Ok(Arc::new(PrefixLocator::parse(raw)?)),
        None => Ok(Arc::new(NoGeoLocator)),
    }
}

/// Runs one worker over the given files in order, or over stdin when none
/// are given. The progress marker stays behind if the run fails.
pub async fn run(conf: &EtlConfig, inputs: &[PathBuf]) -> EtlResult<RunReport> {
    let settings = conf.settings()?;
    let marker = ProgressMarker::acquire(&settings.progress_dir, &settings.worker).await?;
    let warehouse = open_warehouse(conf)?;
    let directory = open_directory(conf).await?;
    let geo = open_geo(conf)?;
    let run_id = Local::now().format("%Y%m%d%H%M%S").to_string();
    info!(
        "starting run {} for worker {} (dry run: {})",
        run_id, settings.worker, settings.dry_run
    );

    let mut pipeline = Pipeline::new(settings, warehouse, directory, geo, run_id);
    if inputs.is_empty() {
        pipeline.consume(BufReader::new(tokio::io::stdin())).await?;
    } else {
        for input in inputs {
            info!("reading {}", input.display());
            let file = tokio::fs::File::open(input).await?;
            pipeline.consume(BufReader::new(file)).await?;
        }
    }
    let report = pipeline.finish().await?;
    marker.release().await?;
    Ok(report)
}
