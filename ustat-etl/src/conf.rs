use std::path::PathBuf;

use chrono::{Local, NaiveDate};
use envconfig::Envconfig;

use crate::error::{EtlError, EtlResult};

#[derive(Envconfig, Clone, Debug)]
pub struct EtlConfig {
    #[envconfig(from = "USTAT_WORKER", default = "0")]
    pub worker: String,
    #[envconfig(from = "USTAT_DELIVERY_DIR", default = "delivery")]
    pub delivery_dir: String,
    /// Second delivery location, hard-linked for the bulk loader.
    #[envconfig(from = "USTAT_LOADER_DIR")]
    pub loader_dir: Option<String>,
    #[envconfig(from = "USTAT_PROGRESS_DIR", default = ".")]
    pub progress_dir: String,
    #[envconfig(from = "USTAT_DRY_RUN", default = "false")]
    pub dry_run: bool,
    /// SQLite warehouse file; an in-memory warehouse is used when unset.
    #[envconfig(from = "USTAT_WAREHOUSE")]
    pub warehouse_path: Option<String>,
    #[envconfig(from = "USTAT_IDENTITY_URL")]
    pub identity_url: Option<String>,
    #[envconfig(from = "USTAT_IDENTITY_USER", default = "")]
    pub identity_user: String,
    #[envconfig(from = "USTAT_IDENTITY_PASSWORD", default = "")]
    pub identity_password: String,
    #[envconfig(from = "USTAT_SOURCE_URL")]
    pub source_url: Option<String>,
    /// JSON directory snapshot used instead of the HTTP services.
    #[envconfig(from = "USTAT_DIRECTORY_FIXTURE")]
    pub directory_fixture: Option<String>,
    /// Address prefix table, `prefix=CC` pairs separated by commas.
    #[envconfig(from = "USTAT_GEO_PREFIXES")]
    pub geo_prefixes: Option<String>,
    #[envconfig(from = "USTAT_SERVICE_TIMEOUT_SECS", default = "30")]
    pub service_timeout_secs: u64,
    #[envconfig(from = "USTAT_SEQUENCE_BATCH", default = "50")]
    pub sequence_batch: u64,
    #[envconfig(from = "USTAT_CACHE_HIGH_WATERMARK", default = "50000")]
    pub cache_high_watermark: usize,
    #[envconfig(from = "USTAT_CACHE_LOW_WATERMARK", default = "40000")]
    pub cache_low_watermark: usize,
    #[envconfig(from = "USTAT_SESSION_CACHE", default = "20000")]
    pub session_cache_size: usize,
    #[envconfig(from = "USTAT_LICENSE_CHECK_START", default = "2010-01-01")]
    pub license_check_start: String,
    #[envconfig(from = "USTAT_LICENSE_GRACE_DAYS", default = "2")]
    pub license_grace_days: i64,
    #[envconfig(from = "USTAT_UNKNOWN_IDENTITY", default = "unknown")]
    pub unknown_identity: String,
    #[envconfig(from = "USTAT_GUEST_IDENTITY", default = "guest")]
    pub guest_identity: String,
    /// Overrides the run date (defaults to today), `YYYY-MM-DD`.
    #[envconfig(from = "USTAT_RUN_DATE")]
    pub run_date: Option<String>,
}

/// Cache sizes for the watermark-bounded dimension caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheSizing {
    pub high_watermark: usize,
    pub low_watermark: usize,
    pub sessions: usize,
}

impl Default for CacheSizing {
    fn default() -> Self {
        Self {
            high_watermark: 50_000,
            low_watermark: 40_000,
            sessions: 20_000,
        }
    }
}

/// Validated per-run settings shared by the resolvers.
#[derive(Debug, Clone)]
pub struct Settings {
    pub worker: String,
    pub dry_run: bool,
    pub sequence_batch: u64,
    pub sizing: CacheSizing,
    pub license_check_start: NaiveDate,
    pub license_grace_days: i64,
    pub run_date: NaiveDate,
    pub unknown_identity: String,
    pub guest_identity: String,
    pub delivery_dir: PathBuf,
    pub loader_dir: Option<PathBuf>,
    pub progress_dir: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            worker: "0".into(),
            dry_run: false,
            sequence_batch: 50,
            sizing: CacheSizing::default(),
            license_check_start: NaiveDate::from_ymd_opt(2010, 1, 1)
                .unwrap_or_default(),
            license_grace_days: 2,
            run_date: Local::now().date_naive(),
            unknown_identity: "unknown".into(),
            guest_identity: "guest".into(),
            delivery_dir: PathBuf::from("delivery"),
            loader_dir: None,
            progress_dir: PathBuf::from("."),
        }
    }
}

fn parse_date(name: &str, raw: &str) -> EtlResult<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").map_err(|e| {
        EtlError::config(format!("{name} `{raw}` is not a date: {e}"))
    })
}

impl EtlConfig {
    pub fn settings(&self) -> EtlResult<Settings> {
        if self.cache_low_watermark > self.cache_high_watermark {
            return Err(EtlError::config(format!(
                "low watermark {} above high watermark {}",
                self.cache_low_watermark, self.cache_high_watermark
            )));
        }
        if self.worker.is_empty()
            || !self
                .worker
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(EtlError::config(format!(
                "worker id `{}` must be alphanumeric",
                self.worker
            )));
        }
        let run_date = match &self.run_date {
            Some(raw) => parse_date("USTAT_RUN_DATE", raw)?,
            None => Local::now().date_naive(),
        };
        Ok(Settings {
            worker: self.worker.clone(),
            dry_run: self.dry_run,
            sequence_batch: self.sequence_batch.max(1),
            sizing: CacheSizing {
                high_watermark: self.cache_high_watermark,
                low_watermark: self.cache_low_watermark,
                sessions: self.session_cache_size,
            },
            license_check_start: parse_date(
                "USTAT_LICENSE_CHECK_START",
                &self.license_check_start,
            )?,
            license_grace_days: self.license_grace_days,
            run_date,
            unknown_identity: self.unknown_identity.clone(),
            guest_identity: self.guest_identity.clone(),
            delivery_dir: PathBuf::from(&self.delivery_dir),
            loader_dir: self.loader_dir.as_ref().map(PathBuf::from),
            progress_dir: PathBuf::from(&self.progress_dir),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_produce_valid_settings() {
        let conf = EtlConfig::init_from_hashmap(&env(&[(
            "USTAT_RUN_DATE",
            "2024-03-01",
        )]))
        .unwrap();
        let settings = conf.settings().unwrap();
        assert_eq!(settings.worker, "0");
        assert_eq!(settings.sizing, CacheSizing::default());
        assert_eq!(
            settings.run_date,
            NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()
        );
        assert!(settings.loader_dir.is_none());
    }

    #[test]
    fn rejects_inverted_watermarks_and_bad_dates() {
        let conf = EtlConfig::init_from_hashmap(&env(&[
            ("USTAT_CACHE_HIGH_WATERMARK", "10"),
            ("USTAT_CACHE_LOW_WATERMARK", "20"),
        ]))
        .unwrap();
        assert!(matches!(conf.settings(), Err(EtlError::Config(_))));

        let conf = EtlConfig::init_from_hashmap(&env(&[(
            "USTAT_LICENSE_CHECK_START",
            "yesterday",
        )]))
        .unwrap();
        assert!(matches!(conf.settings(), Err(EtlError::Config(_))));

        let conf =
            EtlConfig::init_from_hashmap(&env(&[("USTAT_WORKER", "../x")]))
                .unwrap();
        assert!(conf.settings().is_err());
    }
}
