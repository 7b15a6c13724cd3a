use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio::fs::{self, File};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info, warn};

use crate::error::EtlResult;
use crate::fact::FactRow;

struct Partition {
    spool: PathBuf,
    name: String,
    out: BufWriter<File>,
    rows: u64,
}

/// A partition file that reached its delivery locations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Published {
    pub year: i32,
    pub rows: u64,
    pub path: PathBuf,
    pub loader_path: Option<PathBuf>,
}

/// Year-partitioned fact output. Rows are spooled under a hidden temporary
/// name in the delivery directory and only become visible under their final
/// name once [`PartitionedWriter::publish`] renames them.
pub struct PartitionedWriter {
    delivery_dir: PathBuf,
    loader_dir: Option<PathBuf>,
    worker: String,
    run_id: String,
    header: String,
    partitions: BTreeMap<i32, Partition>,
}

impl PartitionedWriter {
    pub fn new(
        delivery_dir: impl Into<PathBuf>,
        loader_dir: Option<PathBuf>,
        worker: impl Into<String>,
        run_id: impl Into<String>,
        header: impl Into<String>,
    ) -> Self {
        Self {
            delivery_dir: delivery_dir.into(),
            loader_dir,
            worker: worker.into(),
            run_id: run_id.into(),
            header: header.into(),
            partitions: BTreeMap::new(),
        }
    }

    pub fn file_name(&self, year: i32) -> String {
        format!("access_{}_{}_{}.csv", year, self.worker, self.run_id)
    }

    async fn open(&self, year: i32) -> EtlResult<Partition> {
        fs::create_dir_all(&self.delivery_dir).await?;
        let name = self.file_name(year);
        let spool = self.delivery_dir.join(format!(".{name}.tmp"));
        let file = File::create(&spool).await?;
        let mut out = BufWriter::new(file);
        out.write_all(self.header.as_bytes()).await?;
        out.write_all(b"\n").await?;
        debug!("opened partition {} at {}", year, spool.display());
        Ok(Partition {
            spool,
            name,
            out,
            rows: 0,
        })
    }

    pub async fn append(&mut self, year: i32, row: &FactRow) -> EtlResult<()> {
        if !self.partitions.contains_key(&year) {
            let partition = self.open(year).await?;
            self.partitions.insert(year, partition);
        }
        if let Some(partition) = self.partitions.get_mut(&year) {
            partition.out.write_all(row.to_line().as_bytes()).await?;
            partition.out.write_all(b"\n").await?;
            partition.rows += 1;
        }
        Ok(())
    }

    #[cfg(test)]
    pub fn rows(&self, year: i32) -> u64 {
        self.partitions.get(&year).map_or(0, |p| p.rows)
    }

    /// Flushes every partition and moves it to its final name, then links it
    /// into the loader directory.
    pub async fn publish(self) -> EtlResult<Vec<Published>> {
        let mut published = Vec::with_capacity(self.partitions.len());
        if let Some(loader) = &self.loader_dir {
            fs::create_dir_all(loader).await?;
        }
        for (year, mut partition) in self.partitions {
            partition.out.flush().await?;
            let file = partition.out.into_inner();
            file.sync_all().await?;
            drop(file);

            let path = self.delivery_dir.join(&partition.name);
            fs::rename(&partition.spool, &path).await?;
            let loader_path = match &self.loader_dir {
                Some(loader) => Some(link_into(&path, loader, &partition.name).await?),
                None => None,
            };
            info!(
                "published {} rows for {} to {}",
                partition.rows,
                year,
                path.display()
            );
            published.push(Published {
                year,
                rows: partition.rows,
                path,
                loader_path,
            });
        }
        Ok(published)
    }

    /// Removes every spool file without publishing anything.
    pub async fn discard(self) -> EtlResult<()> {
        for (year, partition) in self.partitions {
            drop(partition.out);
            if let Err(e) = fs::remove_file(&partition.spool).await {
                warn!("could not remove spool for {}: {}", year, e);
            }
        }
        Ok(())
    }
}

async fn link_into(path: &Path, dir: &Path, name: &str) -> EtlResult<PathBuf> {
    let target = dir.join(name);
    fs::hard_link(path, &target).await?;
    Ok(target)
}
