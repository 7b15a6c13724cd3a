use std::error::Error;
use std::path::PathBuf;

use envconfig::Envconfig;
use tracing::error;
use ustat_etl::EtlConfig;

#[derive(clap::Parser, Clone, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    /// Access log files, read in order. Reads stdin when none are given.
    pub inputs: Vec<PathBuf>,
    /// Worker id, overrides USTAT_WORKER
    #[arg(long)]
    pub worker: Option<String>,
    /// Resolve everything but write nothing
    #[arg(long)]
    pub dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    use clap::Parser;
    init_log();
    let args = Args::parse();
    let mut conf = EtlConfig::init_from_env()?;
    if let Some(worker) = args.worker {
        conf.worker = worker;
    }
    conf.dry_run |= args.dry_run;

    match ustat_etl::run(&conf, &args.inputs).await {
        Ok(report) => {
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Err(e) => {
            error!("run failed: {}", e);
            Err(e.into())
        }
    }
}

fn init_log() {
    use tracing::level_filters::LevelFilter;
    use tracing_subscriber::{
        layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("USTAT_LOG")
                .from_env_lossy(),
        )
        .init();
}
