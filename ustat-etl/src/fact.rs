use std::sync::Arc;

use tracing::debug;

use crate::dimension::{Dimension, DimensionResolver};
use crate::error::EtlResult;
use crate::event::AccessEvent;

/// Sequence handing out fact row ids.
pub const FACT_SEQUENCE: &str = "access_fact";

/// Raw event fields that can feed a dimension lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventField {
    Date,
    Service,
    Status,
    UserAgent,
    Referrer,
}

/// Values computed from the event rather than looked up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Computed {
    Time,
    AgeYears,
    AgeDays,
    Counts,
    Role,
}

/// Keys already resolved upstream and copied as they are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedField {
    Session,
    Identity,
    Syndicate,
    Country,
    Content,
    License,
    Access,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Column {
    Lookup {
        name: &'static str,
        dimension: Dimension,
        field: EventField,
    },
    Sequence {
        name: &'static str,
        sequence: &'static str,
    },
    Computed {
        name: &'static str,
        value: Computed,
    },
    Copy {
        name: &'static str,
        field: ResolvedField,
    },
}

impl Column {
    pub fn name(&self) -> &'static str {
        match self {
            Column::Lookup { name, .. }
            | Column::Sequence { name, .. }
            | Column::Computed { name, .. }
            | Column::Copy { name, .. } => *name,
        }
    }
}

/// Column layout of the access fact table.
pub const FACT_COLUMNS: &[Column] = &[
    Column::Sequence { name: "access_id", sequence: FACT_SEQUENCE },
    Column::Lookup { name: "date_key", dimension: Dimension::Date, field: EventField::Date },
    Column::Computed { name: "access_time", value: Computed::Time },
    Column::Lookup { name: "service_key", dimension: Dimension::Service, field: EventField::Service },
    Column::Lookup { name: "http_status_key", dimension: Dimension::HttpStatus, field: EventField::Status },
    Column::Copy { name: "country_key", field: ResolvedField::Country },
    Column::Copy { name: "session_key", field: ResolvedField::Session },
    Column::Copy { name: "identity_key", field: ResolvedField::Identity },
    Column::Copy { name: "syndicate_key", field: ResolvedField::Syndicate },
    Column::Copy { name: "content_key", field: ResolvedField::Content },
    Column::Copy { name: "license_key", field: ResolvedField::License },
    Column::Copy { name: "access_key", field: ResolvedField::Access },
    Column::Computed { name: "access_role", value: Computed::Role },
    Column::Lookup { name: "user_agent_key", dimension: Dimension::UserAgent, field: EventField::UserAgent },
    Column::Lookup { name: "referrer_key", dimension: Dimension::Referrer, field: EventField::Referrer },
    Column::Computed { name: "age_years", value: Computed::AgeYears },
    Column::Computed { name: "age_days", value: Computed::AgeDays },
    Column::Computed { name: "counts", value: Computed::Counts },
];

/// One output row; `None` is written as an empty field.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FactRow(pub Vec<Option<String>>);

fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('"', "\"\""))
}

impl FactRow {
    /// Comma separated, every present value quoted.
    pub fn to_line(&self) -> String {
        self.0
            .iter()
            .map(|v| v.as_deref().map(quote).unwrap_or_default())
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn header(columns: &[Column]) -> String {
        columns
            .iter()
            .map(|c| quote(c.name()))
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Turns a fully resolved event into a fact row following a column layout.
pub struct FactAssembler {
    dims: Arc<DimensionResolver>,
    columns: &'static [Column],
    sequence_batch: u64,
}

impl FactAssembler {
    pub fn new(dims: Arc<DimensionResolver>, sequence_batch: u64) -> Self {
        Self {
            dims,
            columns: FACT_COLUMNS,
            sequence_batch,
        }
    }

    pub fn header(&self) -> String {
        FactRow::header(self.columns)
    }

    pub async fn assemble(&self, event: &AccessEvent) -> EtlResult<FactRow> {
        let mut row = Vec::with_capacity(self.columns.len());
        for column in self.columns {
            let value = match column {
                Column::Lookup { dimension, field, .. } => {
                    match event_field(event, *field) {
                        Some(raw) => self
                            .dims
                            .resolve(*dimension, &raw)
                            .await?
                            .map(|k| k.to_string()),
                        None => None,
                    }
                }
                Column::Sequence { sequence, .. } => Some(
                    self.dims
                        .sequencer()
                        .next_batched(sequence, self.sequence_batch)
                        .await?
                        .to_string(),
                ),
                Column::Computed { value, .. } => computed(event, *value),
                Column::Copy { field, .. } => resolved(event, *field).map(|k| k.to_string()),
            };
            row.push(value);
        }
        debug!("assembled fact row for {}", event.timestamp);
        Ok(FactRow(row))
    }
}

fn event_field(event: &AccessEvent, field: EventField) -> Option<String> {
    match field {
        EventField::Date => Some(event.date().format("%Y-%m-%d").to_string()),
        EventField::Service => Some(event.service.clone()),
        EventField::Status => Some(event.status.to_string()),
        EventField::UserAgent => event.user_agent.clone(),
        EventField::Referrer => event.referrer.clone(),
    }
}

fn computed(event: &AccessEvent, value: Computed) -> Option<String> {
    let keys = &event.resolved;
    match value {
        Computed::Time => Some(event.timestamp.format("%H:%M:%S").to_string()),
        Computed::AgeYears => keys.age.map(|a| a.years.to_string()),
        Computed::AgeDays => keys.age.map(|a| a.days.to_string()),
        Computed::Counts => Some(if keys.counts { "1" } else { "0" }.to_string()),
        Computed::Role => keys.role.map(|r| r.as_str().to_string()),
    }
}

fn resolved(event: &AccessEvent, field: ResolvedField) -> Option<i64> {
    let keys = &event.resolved;
    match field {
        ResolvedField::Session => keys.session,
        ResolvedField::Identity => keys.identity,
        ResolvedField::Syndicate => keys.syndicate,
        ResolvedField::Country => keys.country,
        ResolvedField::Content => keys.content,
        ResolvedField::License => keys.license,
        ResolvedField::Access => keys.access,
    }
}
