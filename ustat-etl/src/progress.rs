use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::Local;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::info;

use crate::error::{EtlError, EtlResult};

/// Exclusive per-worker marker. Its presence means a run for the worker has
/// not finished; it is only removed by [`ProgressMarker::release`].
#[derive(Debug)]
pub struct ProgressMarker {
    path: PathBuf,
}

impl ProgressMarker {
    pub fn path_for(dir: &Path, worker: &str) -> PathBuf {
        dir.join(format!("ustat-etl.{worker}.running"))
    }

    pub async fn acquire(dir: &Path, worker: &str) -> EtlResult<Self> {
        fs::create_dir_all(dir).await?;
        let path = Self::path_for(dir, worker);
        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(EtlError::RunInProgress(worker.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let stamp = format!(
            "pid={} started={}\n",
            std::process::id(),
            Local::now().format("%Y-%m-%dT%H:%M:%S")
        );
        file.write_all(stamp.as_bytes()).await?;
        file.flush().await?;
        info!("acquired progress marker {}", path.display());
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn release(self) -> EtlResult<()> {
        fs::remove_file(&self.path).await?;
        info!("released progress marker {}", self.path.display());
        Ok(())
    }
}
