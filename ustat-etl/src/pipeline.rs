use std::sync::Arc;

use chrono::NaiveDate;
use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, info};
use ustat_external::{IdentityService, SourceSystem};
use ustat_warehouse::{OverlayWarehouse, Warehouse};

use crate::access::{AccessRequest, AccessResolver, AccessWindow};
use crate::conf::Settings;
use crate::content::ContentResolver;
use crate::dimension::{Dimension, DimensionResolver};
use crate::error::EtlResult;
use crate::event::{AbandonReason, AccessEvent, EventOutcome, ResolvedKeys};
use crate::fact::FactAssembler;
use crate::geo::GeoLocator;
use crate::identity::{HierarchyResolver, IdentityRefs, IdentityStore};
use crate::input::parse_line;
use crate::license::LicenseResolver;
use crate::sequence::Sequencer;
use crate::summary::RunSummary;
use crate::writer::{PartitionedWriter, Published};

/// External systems an event is resolved against.
#[derive(Clone)]
pub struct Directory {
    pub identity: Arc<dyn IdentityService>,
    pub source: Arc<dyn SourceSystem>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub worker: String,
    pub dry_run: bool,
    pub published: Vec<Published>,
    pub summary: RunSummary,
}

/// One run: reads lines in order, resolves each event completely and
/// appends its fact row before touching the next line.
pub struct Pipeline {
    settings: Settings,
    run_id: String,
    dims: Arc<DimensionResolver>,
    identities: Arc<IdentityStore>,
    hierarchy: HierarchyResolver,
    content: ContentResolver,
    licenses: LicenseResolver,
    access: AccessResolver,
    geo: Arc<dyn GeoLocator>,
    assembler: FactAssembler,
    writer: PartitionedWriter,
    summary: RunSummary,
    current_date: Option<NaiveDate>,
}

impl Pipeline {
    /// In dry-run mode every warehouse write stays in an in-memory overlay.
    pub fn new(
        settings: Settings,
        warehouse: Arc<dyn Warehouse>,
        directory: Directory,
        geo: Arc<dyn GeoLocator>,
        run_id: impl Into<String>,
    ) -> Self {
        let warehouse: Arc<dyn Warehouse> = if settings.dry_run {
            Arc::new(OverlayWarehouse::new(warehouse))
        } else {
            warehouse
        };
        let sequencer = Arc::new(Sequencer::new(warehouse.clone(), settings.dry_run));
        let dims = Arc::new(DimensionResolver::new(
            warehouse,
            sequencer,
            settings.sizing,
            settings.sequence_batch,
        ));
        let identities = Arc::new(IdentityStore::new(
            directory.identity,
            dims.clone(),
            settings.unknown_identity.clone(),
        ));
        let hierarchy = HierarchyResolver::new(
            identities.clone(),
            dims.clone(),
            settings.guest_identity.clone(),
            settings.sizing.sessions,
        );
        let content = ContentResolver::new(dims.clone(), directory.source, settings.sizing);
        let licenses = LicenseResolver::new(dims.clone(), identities.clone(), settings.sizing);
        let access = AccessResolver::new(
            dims.clone(),
            AccessWindow {
                license_check_start: settings.license_check_start,
                grace_days: settings.license_grace_days,
                run_date: settings.run_date,
            },
        );
        let assembler = FactAssembler::new(dims.clone(), settings.sequence_batch);
        let run_id = run_id.into();
        let writer = PartitionedWriter::new(
            settings.delivery_dir.clone(),
            settings.loader_dir.clone(),
            settings.worker.clone(),
            run_id.clone(),
            assembler.header(),
        );
        Self {
            settings,
            run_id,
            dims,
            identities,
            hierarchy,
            content,
            licenses,
            access,
            geo,
            assembler,
            writer,
            summary: RunSummary::default(),
            current_date: None,
        }
    }

    pub fn summary(&self) -> &RunSummary {
        &self.summary
    }

    pub fn dimensions(&self) -> &Arc<DimensionResolver> {
        &self.dims
    }

    /// Parses and processes one line, recording its outcome.
    pub async fn process_line(&mut self, line: &str) -> EtlResult<EventOutcome> {
        let outcome = match parse_line(line) {
            Ok(event) => self.process_event(event).await?,
            Err(reason) => EventOutcome::Skipped(reason),
        };
        self.summary.record(&outcome);
        Ok(outcome)
    }

    pub async fn consume<R>(&mut self, reader: R) -> EtlResult<()>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut lines = reader.lines();
        while let Some(line) = lines.next_line().await? {
            self.process_line(&line).await?;
        }
        Ok(())
    }

    fn advance_date(&mut self, day: NaiveDate) {
        if self.current_date == Some(day) {
            return;
        }
        if let Some(previous) = self.current_date {
            info!("input date moved from {} to {}, dropping daily caches", previous, day);
            self.dims.clear_date_scoped();
            self.hierarchy.clear_daily();
            self.content.clear_daily();
        }
        self.current_date = Some(day);
    }

    async fn process_event(&mut self, mut event: AccessEvent) -> EtlResult<EventOutcome> {
        let day = event.date();
        self.advance_date(day);

        let refs = IdentityRefs {
            session_id: event.session_id.as_deref(),
            identity_ids: &event.identity_ids,
            primary_id: event.primary_id.as_deref(),
        };
        let Some(session) = self.hierarchy.resolve(refs).await? else {
            debug!("abandoning event at {}: no primary identity", event.timestamp);
            return Ok(EventOutcome::Abandoned(AbandonReason::PrimaryUnavailable));
        };
        let Some(primary) = self.identities.by_internal_key(session.primary_key).await? else {
            return Ok(EventOutcome::Abandoned(AbandonReason::PrimaryUnavailable));
        };

        let content = self.content.resolve(event.content_path.as_deref(), day).await?;
        let license = match event.license_id.as_deref() {
            Some(id) => self.licenses.resolve(id).await?,
            None => None,
        };
        let access = self
            .access
            .resolve(AccessRequest {
                license: license.as_deref(),
                identity: &primary.external_id,
                content: &content.composite,
                day,
                age: content.age,
            })
            .await?;
        let located = match event.ip.as_deref().and_then(|ip| self.geo.country(ip)) {
            Some(code) => self.dims.resolve(Dimension::Country, &code).await?,
            None => None,
        };

        event.resolved = ResolvedKeys {
            session: session.session_key,
            identity: Some(session.primary_key),
            syndicate: session.syndicate_key,
            country: located.or(session.country_key),
            content: Some(content.key),
            license: license.as_ref().map(|l| l.key),
            access: access.as_ref().map(|a| a.key),
            role: access.as_ref().map(|a| a.role),
            age: content.age,
            counts: session.counts_usage,
        };
        let row = self.assembler.assemble(&event).await?;
        let year = event.year();
        self.writer.append(year, &row).await?;
        Ok(EventOutcome::Emitted { year })
    }

    /// Publishes every partition, or throws the spool away on a dry run.
    pub async fn finish(self) -> EtlResult<RunReport> {
        self.summary.log();
        let published = if self.settings.dry_run {
            self.writer.discard().await?;
            info!("dry run, nothing published");
            Vec::new()
        } else {
            self.writer.publish().await?
        };
        Ok(RunReport {
            run_id: self.run_id,
            worker: self.settings.worker,
            dry_run: self.settings.dry_run,
            published,
            summary: self.summary,
        })
    }
}
