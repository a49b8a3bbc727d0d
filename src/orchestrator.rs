// 🏭 Worksheet Generation - unmerge_in → review worksheet file
//
// identities → tokens → column layout → enrichment (person only, when the
// layout asks for it) → assembled worksheet → CSV

use crate::bitmap::BitmapCodec;
use crate::builder::WorksheetBuilder;
use crate::columns::required_sources;
use crate::db::{self, DbChildSource};
use crate::entities::EntityKind;
use crate::error::Result;
use rusqlite::Connection;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorksheetReport {
    pub entity_kind: EntityKind,
    pub identities: usize,
    pub tokens: usize,
    pub rows: usize,
    pub columns: usize,
    pub output_path: PathBuf,
}

pub fn generate_worksheet(
    conn: &Connection,
    kind: EntityKind,
    codec: BitmapCodec,
    output_path: &Path,
) -> Result<WorksheetReport> {
    info!(kind = %kind, "starting worksheet generation");

    let identity_ids = db::get_identity_ids_from_unmerge_in(conn, kind)?;
    info!(identities = identity_ids.len(), "loaded identities flagged for review");

    let pairs = db::get_tokens_by_identity_ids(conn, kind, &identity_ids)?;
    let (token_ids, token_to_identity) = db::token_identity_map(&pairs);
    info!(tokens = token_ids.len(), "resolved tokens");

    let column_order = db::load_column_order(conn, kind)?;
    let required = required_sources(&column_order);

    let enrollment_periods = if kind.has_history() && required.enrollment {
        let periods = db::get_enrollment_history(conn, &token_ids)?;
        info!(periods = periods.len(), "loaded enrollment history");
        periods
    } else {
        info!(kind = %kind, required = required.enrollment, "enrollment history skipped");
        Vec::new()
    };

    let wage_records = if kind.has_history() && required.wages {
        let records = db::get_wage_history(conn, &token_ids)?;
        info!(records = records.len(), "loaded wage history");
        records
    } else {
        info!(kind = %kind, required = required.wages, "wage history skipped");
        Vec::new()
    };

    let builder = WorksheetBuilder::new(column_order).with_codec(codec);
    let source = DbChildSource { conn, kind };
    let sheet = builder.build(
        &source,
        &token_ids,
        &token_to_identity,
        &enrollment_periods,
        &wage_records,
    )?;

    if let Some(parent) = output_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    sheet.write_csv(output_path)?;

    Ok(WorksheetReport {
        entity_kind: kind,
        identities: identity_ids.len(),
        tokens: token_ids.len(),
        rows: sheet.len(),
        columns: sheet.columns.len(),
        output_path: output_path.to_path_buf(),
    })
}
