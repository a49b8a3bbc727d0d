// 🗂️ Column Layout - configured column order and enrichment requirements
//
// Each configured entry is one of:
//   Required (0)  always present; synthesized as empty when the table lacks it
//   Optional (1)  kept when present, dropped silently otherwise
//   Dynamic  (2)  a family name, expanded to the columns an aggregator
//                 registered under that name

use crate::enrollment::ENROLLMENT_FAMILY;
use crate::entities::EntityKind;
use crate::error::UnmergeError;
use crate::wages::{
    ANNUAL_AMOUNT_FAMILY, ANNUAL_HOURS_FAMILY, PRESENCE_FAMILY, QUARTER_AMOUNT_FAMILY,
    QUARTER_HOURS_FAMILY,
};
use crate::worksheet::{OptionalColumns, Worksheet};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, info, warn};

// ============================================================================
// COLUMN SPEC
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnKind {
    Required,
    Optional,
    Dynamic,
}

impl ColumnKind {
    pub fn code(&self) -> i64 {
        match self {
            ColumnKind::Required => 0,
            ColumnKind::Optional => 1,
            ColumnKind::Dynamic => 2,
        }
    }
}

impl TryFrom<i64> for ColumnKind {
    type Error = UnmergeError;

    fn try_from(code: i64) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(ColumnKind::Required),
            1 => Ok(ColumnKind::Optional),
            2 => Ok(ColumnKind::Dynamic),
            other => Err(UnmergeError::UnknownColumnKind(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub order: i64,
    pub name: String,
    pub kind: ColumnKind,
    pub entity_kind: EntityKind,
}

impl ColumnSpec {
    pub fn new(order: i64, name: &str, kind: ColumnKind, entity_kind: EntityKind) -> Self {
        ColumnSpec {
            order,
            name: name.to_string(),
            kind,
            entity_kind,
        }
    }
}

/// Resolve the final column set and order, then prune the table to it.
pub fn apply_column_order(sheet: &mut Worksheet, spec: &[ColumnSpec], optional: &OptionalColumns) {
    let mut entries: Vec<&ColumnSpec> = spec.iter().collect();
    entries.sort_by_key(|entry| entry.order);

    let mut final_columns: Vec<String> = Vec::new();
    let mut selected: HashSet<String> = HashSet::new();
    let mut push = |column: &str, final_columns: &mut Vec<String>| {
        if selected.insert(column.to_string()) {
            final_columns.push(column.to_string());
        }
    };

    for entry in entries {
        match entry.kind {
            ColumnKind::Required => {
                if !sheet.has_column(&entry.name) {
                    warn!(column = %entry.name, "required column not found, adding as empty");
                    sheet.add_empty_column(&entry.name);
                }
                push(&entry.name, &mut final_columns);
            }
            ColumnKind::Optional => {
                if sheet.has_column(&entry.name) {
                    push(&entry.name, &mut final_columns);
                } else {
                    debug!(column = %entry.name, "optional column absent, dropped");
                }
            }
            ColumnKind::Dynamic => {
                let available: Vec<&String> = optional
                    .get(&entry.name)
                    .map(|columns| columns.iter().filter(|c| sheet.has_column(c)).collect())
                    .unwrap_or_default();

                if available.is_empty() {
                    warn!(family = %entry.name, "no columns registered for dynamic family");
                }
                for column in available {
                    push(column, &mut final_columns);
                }
            }
        }
    }

    info!(
        configured = spec.len(),
        resolved = final_columns.len(),
        "applied column order"
    );
    sheet.select_columns(final_columns);
}

// ============================================================================
// ENRICHMENT REQUIREMENTS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnrichmentSource {
    Enrollment,
    Wages,
}

impl EnrichmentSource {
    /// Source behind a dynamic family name. Declared families are looked up
    /// directly; anything else falls back to the historical name prefixes
    /// (`K12_` for enrollment, `Wage` or `InWorkforce` for wages).
    pub fn for_family(family: &str) -> Option<EnrichmentSource> {
        match family {
            ENROLLMENT_FAMILY => Some(EnrichmentSource::Enrollment),
            PRESENCE_FAMILY
            | QUARTER_HOURS_FAMILY
            | QUARTER_AMOUNT_FAMILY
            | ANNUAL_HOURS_FAMILY
            | ANNUAL_AMOUNT_FAMILY => Some(EnrichmentSource::Wages),
            other if other.starts_with("K12_") => Some(EnrichmentSource::Enrollment),
            other if other.starts_with("Wage") || other.starts_with("InWorkforce") => {
                Some(EnrichmentSource::Wages)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequiredSources {
    pub enrollment: bool,
    pub wages: bool,
}

/// Which enrichment sources the Dynamic entries of a layout need.
pub fn required_sources(spec: &[ColumnSpec]) -> RequiredSources {
    let mut required = RequiredSources::default();

    for entry in spec.iter().filter(|e| e.kind == ColumnKind::Dynamic) {
        match EnrichmentSource::for_family(&entry.name) {
            Some(EnrichmentSource::Enrollment) => required.enrollment = true,
            Some(EnrichmentSource::Wages) => required.wages = true,
            None => debug!(family = %entry.name, "dynamic family has no enrichment source"),
        }
    }

    required
}
