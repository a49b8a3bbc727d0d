// 📥 Review Consumption - reviewed worksheet → classification records
//
// Two transactions per run, one job id, one entity kind:
//   Phase 1: delete the kind's whitelist, blacklist, invalid-SSN and unmerge
//            rows, commit
//   Phase 2: load and validate the worksheet, plan every write, apply the
//            plan, commit, then move the staged processing summary into place
//
// A phase-1 failure stops the run before phase 2 starts. A phase-2 failure
// leaves the tables empty for the kind until the next successful run.

use crate::db::{self, Event, TruncateCounts};
use crate::entities::{
    BlacklistPair, ClassificationPlan, EntityKind, InvalidSsnEntry, UnmergeEntry, WhitelistEntry,
};
use crate::error::{Result, UnmergeError};
use crate::ssn::normalize_ssn;
use crate::worksheet::{
    cell_as_i64, cell_as_text, is_null, names, persist_staged, staging_file, Worksheet,
};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, error, info, warn};

/// Columns a reviewed worksheet must carry.
pub const REQUIRED_COLUMNS: [&str; 6] = [
    names::IDENTITY_ID,
    names::TOKEN_ID,
    names::GROUP_ID,
    names::DO_NOT_MERGE,
    names::INVALID_SSN,
    names::SSN,
];

pub const DO_NOT_MERGE_PRIMARY: i64 = 1;
pub const DO_NOT_MERGE_EXCLUDE: i64 = 2;

const ACTOR: &str = "worksheet_consumer";

// ============================================================================
// REVIEWED ROWS
// ============================================================================

/// The reviewer-relevant view of one worksheet row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewRow {
    /// 1-based data row number (header excluded)
    pub row: usize,
    pub identity_id: i64,
    pub token_id: i64,
    pub group_label: Option<String>,
    pub do_not_merge: Option<i64>,
    pub invalid_ssn: bool,
    pub ssn: Option<String>,
}

fn required_id(sheet: &Worksheet, index: usize, column: &str) -> Result<Option<i64>> {
    let value = sheet.rows[index].get(column);
    if is_null(value) {
        return Ok(None);
    }
    match value.and_then(cell_as_i64) {
        Some(id) => Ok(Some(id)),
        None => Err(UnmergeError::MalformedRow {
            row: index + 1,
            message: format!("{column} is not an integer"),
        }),
    }
}

/// Parse the worksheet into review rows.
///
/// Rows with neither an identity nor a token id are blank spreadsheet rows and
/// are skipped. A row with only one of the two, or a non-integer id, is a
/// malformed key and aborts the run.
pub fn review_rows(sheet: &Worksheet) -> Result<Vec<ReviewRow>> {
    let mut rows = Vec::with_capacity(sheet.len());

    for index in 0..sheet.len() {
        let identity = required_id(sheet, index, names::IDENTITY_ID)?;
        let token = required_id(sheet, index, names::TOKEN_ID)?;

        let (identity_id, token_id) = match (identity, token) {
            (Some(identity_id), Some(token_id)) => (identity_id, token_id),
            (None, None) => {
                debug!(row = index + 1, "blank worksheet row skipped");
                continue;
            }
            (None, Some(_)) | (Some(_), None) => {
                return Err(UnmergeError::MalformedRow {
                    row: index + 1,
                    message: "P20ID and TokenID must both be present".to_string(),
                })
            }
        };

        let row = &sheet.rows[index];
        rows.push(ReviewRow {
            row: index + 1,
            identity_id,
            token_id,
            group_label: cell_as_text(row.get(names::GROUP_ID)).map(|g| g.trim().to_string()),
            do_not_merge: row.get(names::DO_NOT_MERGE).and_then(cell_as_i64),
            invalid_ssn: row.get(names::INVALID_SSN).and_then(cell_as_i64) == Some(1),
            ssn: cell_as_text(row.get(names::SSN)),
        });
    }

    Ok(rows)
}

// ============================================================================
// PLANNING
// ============================================================================

/// Compute every classification write for one run. Pure: no I/O.
pub fn plan_classifications(rows: &[ReviewRow], job_id: i64, now: DateTime<Utc>) -> ClassificationPlan {
    let mut plan = ClassificationPlan::default();

    let mut by_identity: BTreeMap<i64, Vec<&ReviewRow>> = BTreeMap::new();
    for row in rows {
        by_identity.entry(row.identity_id).or_default().push(row);
    }

    // Whitelist: identities whose rows all lack a GroupID
    let mut whitelisted: HashSet<i64> = HashSet::new();
    for (identity_id, identity_rows) in &by_identity {
        if identity_rows.iter().all(|r| r.group_label.is_none()) {
            whitelisted.insert(*identity_id);
            plan.whitelist.push(WhitelistEntry {
                identity_id: *identity_id,
                job_id,
            });
            plan.whitelisted_tokens
                .extend(identity_rows.iter().map(|r| r.token_id));
        }
    }

    // Do-not-merge: exactly one primary and at least one exclusion
    let mut pairs: BTreeSet<(i64, i64)> = BTreeSet::new();
    for (identity_id, identity_rows) in &by_identity {
        if whitelisted.contains(identity_id) {
            continue;
        }
        let primary: Vec<i64> = identity_rows
            .iter()
            .filter(|r| r.do_not_merge == Some(DO_NOT_MERGE_PRIMARY))
            .map(|r| r.token_id)
            .collect();
        let excluded: Vec<i64> = identity_rows
            .iter()
            .filter(|r| r.do_not_merge == Some(DO_NOT_MERGE_EXCLUDE))
            .map(|r| r.token_id)
            .collect();

        if primary.len() != 1 || excluded.is_empty() {
            if !primary.is_empty() || !excluded.is_empty() {
                debug!(
                    identity_id,
                    primary = primary.len(),
                    excluded = excluded.len(),
                    "do-not-merge marks do not form a pairing"
                );
            }
            continue;
        }

        for token_id_2 in excluded {
            if token_id_2 == primary[0] {
                warn!(identity_id, token_id = token_id_2, "token marked as both primary and excluded");
                continue;
            }
            pairs.insert((primary[0], token_id_2));
        }
    }
    plan.blacklist = pairs
        .into_iter()
        .map(|(token_id_1, token_id_2)| BlacklistPair {
            token_id_1,
            token_id_2,
            job_id,
        })
        .collect();

    // Invalid SSN: normalize or skip the row
    let mut seen_ssn: HashSet<(i64, String)> = HashSet::new();
    for row in rows.iter().filter(|r| r.invalid_ssn) {
        match normalize_ssn(row.ssn.as_deref().unwrap_or("")) {
            Ok(ssn) => {
                if seen_ssn.insert((row.token_id, ssn.clone())) {
                    plan.invalid_ssns.push(InvalidSsnEntry {
                        token_id: row.token_id,
                        ssn,
                        job_id,
                    });
                }
            }
            Err(e) => {
                warn!(row = row.row, token_id = row.token_id, error = %e, "skipping invalid SSN");
                plan.skipped_ssn += 1;
            }
        }
    }

    // Final grouping: first row per token wins
    let mut seen_tokens: HashSet<i64> = HashSet::new();
    for row in rows {
        let Some(label) = &row.group_label else {
            continue;
        };
        if seen_tokens.insert(row.token_id) {
            plan.unmerge.push(UnmergeEntry {
                token_id: row.token_id,
                group_label: label.clone(),
                job_id,
                created_at: now,
            });
        }
    }

    plan
}

/// Write a plan inside the caller's transaction.
pub fn apply_plan(conn: &Connection, kind: EntityKind, plan: &ClassificationPlan) -> Result<()> {
    if plan.is_empty() {
        info!(kind = %kind, "no classification writes planned");
        return Ok(());
    }

    for entry in &plan.whitelist {
        db::insert_whitelist(conn, kind, entry)?;
    }

    let whitelisted: Vec<i64> = plan.whitelisted_tokens.iter().copied().collect();
    let purged = db::delete_blacklist_for_tokens(conn, &whitelisted)?;
    if purged > 0 {
        info!(purged, "removed blacklist pairs of whitelisted identities");
    }

    for pair in &plan.blacklist {
        db::insert_blacklist(conn, kind, pair)?;
    }
    for entry in &plan.invalid_ssns {
        db::insert_invalid_ssn(conn, kind, entry)?;
    }
    for entry in &plan.unmerge {
        db::insert_unmerge(conn, kind, entry)?;
    }

    info!(
        whitelist = plan.whitelist.len(),
        blacklist = plan.blacklist.len(),
        invalid_ssn = plan.invalid_ssns.len(),
        unmerge = plan.unmerge.len(),
        "applied classification plan"
    );
    Ok(())
}

// ============================================================================
// PROCESSING SUMMARY
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessingSummary {
    pub entity_kind: EntityKind,
    pub job_id: i64,
    pub total_records: usize,
    pub records_with_group: usize,
    pub records_without_group: usize,
    pub invalid_ssn_records: usize,
    pub invalid_ssn_recorded: usize,
    pub invalid_ssn_skipped: usize,
    pub whitelisted_identities: usize,
    pub blacklist_pairs: usize,
    pub unmerge_records: usize,
    pub groups: usize,
    pub worksheet_sha256: String,
    pub processed_at: DateTime<Utc>,
}

impl ProcessingSummary {
    pub fn from_plan(
        kind: EntityKind,
        job_id: i64,
        rows: &[ReviewRow],
        plan: &ClassificationPlan,
        worksheet_sha256: String,
        processed_at: DateTime<Utc>,
    ) -> Self {
        let with_group = rows.iter().filter(|r| r.group_label.is_some()).count();
        ProcessingSummary {
            entity_kind: kind,
            job_id,
            total_records: rows.len(),
            records_with_group: with_group,
            records_without_group: rows.len() - with_group,
            invalid_ssn_records: rows.iter().filter(|r| r.invalid_ssn).count(),
            invalid_ssn_recorded: plan.invalid_ssns.len(),
            invalid_ssn_skipped: plan.skipped_ssn,
            whitelisted_identities: plan.whitelist.len(),
            blacklist_pairs: plan.blacklist.len(),
            unmerge_records: plan.unmerge.len(),
            groups: plan.group_count(),
            worksheet_sha256,
            processed_at,
        }
    }

    /// Write the summary to a staging file beside `path`. Nothing appears at
    /// `path` until the returned file is persisted.
    pub fn stage_csv(&self, path: &Path) -> Result<NamedTempFile> {
        let mut staged = staging_file(path)?;
        {
            let mut wtr = csv::Writer::from_writer(staged.as_file_mut());
            wtr.serialize(self)?;
            wtr.flush()?;
        }
        Ok(staged)
    }
}

pub fn file_sha256(path: &Path) -> Result<String> {
    let bytes = fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

// ============================================================================
// WORKSHEET CONSUMER
// ============================================================================

#[derive(Debug, Clone)]
pub struct WorksheetConsumer {
    worksheet_path: PathBuf,
    job_id: i64,
    kind: EntityKind,
    output_dir: PathBuf,
    output_filename: String,
}

impl WorksheetConsumer {
    /// Validate the kind name and the worksheet path, then build a consumer.
    /// Neither check touches the database.
    pub fn create_for_entity(
        worksheet_path: impl Into<PathBuf>,
        job_id: i64,
        entity_kind: &str,
        output_dir: impl Into<PathBuf>,
        output_filename: &str,
    ) -> Result<Self> {
        let kind: EntityKind = entity_kind.parse()?;
        Self::new(worksheet_path, job_id, kind, output_dir, output_filename)
    }

    pub fn new(
        worksheet_path: impl Into<PathBuf>,
        job_id: i64,
        kind: EntityKind,
        output_dir: impl Into<PathBuf>,
        output_filename: &str,
    ) -> Result<Self> {
        let worksheet_path = worksheet_path.into();
        if !worksheet_path.exists() {
            return Err(UnmergeError::WorksheetNotFound(worksheet_path));
        }

        let output_dir = output_dir.into();
        fs::create_dir_all(&output_dir)?;

        info!(
            kind = %kind,
            worksheet = %worksheet_path.display(),
            job_id,
            output = %output_dir.join(output_filename).display(),
            "initialized worksheet consumer"
        );

        Ok(WorksheetConsumer {
            worksheet_path,
            job_id,
            kind,
            output_dir,
            output_filename: output_filename.to_string(),
        })
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    pub fn job_id(&self) -> i64 {
        self.job_id
    }

    pub fn summary_path(&self) -> PathBuf {
        self.output_dir
            .join(format!("summary_{}", self.output_filename))
    }

    /// Phase 1: drop the kind's classification rows in their own transaction.
    pub fn truncate_tables(&self, conn: &mut Connection) -> Result<TruncateCounts> {
        info!(kind = %self.kind, "truncating classification tables");

        let tx = conn.transaction()?;
        let counts = match db::delete_classifications(&tx, self.kind).and_then(|counts| {
            let event = Event::new(
                "classifications_truncated",
                self.kind.as_str(),
                &self.job_id.to_string(),
                serde_json::to_value(counts)?,
                ACTOR,
            );
            db::insert_event(&tx, &event)?;
            Ok(counts)
        }) {
            Ok(counts) => counts,
            Err(e) => {
                error!(kind = %self.kind, error = %e, "truncate failed, rolled back");
                return Err(e);
            }
        };
        tx.commit()?;

        info!(removed = counts.total(), "classification tables truncated");
        Ok(counts)
    }

    /// Read the worksheet and check the required columns.
    pub fn load_worksheet(&self) -> Result<Worksheet> {
        info!(path = %self.worksheet_path.display(), "loading worksheet");
        let sheet = Worksheet::read_csv(&self.worksheet_path)?;

        let missing: Vec<String> = REQUIRED_COLUMNS
            .iter()
            .filter(|column| !sheet.has_column(column))
            .map(|column| column.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(UnmergeError::MissingColumns(missing));
        }

        info!(
            rows = sheet.len(),
            columns = sheet.columns.len(),
            "worksheet loaded"
        );
        Ok(sheet)
    }

    /// Phase 2: plan and apply every write, commit once, then save the summary.
    pub fn process(&self, conn: &mut Connection) -> Result<ProcessingSummary> {
        let sheet = self.load_worksheet()?;
        let rows = review_rows(&sheet)?;
        let now = Utc::now();
        let plan = plan_classifications(&rows, self.job_id, now);
        let summary = ProcessingSummary::from_plan(
            self.kind,
            self.job_id,
            &rows,
            &plan,
            file_sha256(&self.worksheet_path)?,
            now,
        );

        let summary_path = self.summary_path();
        let staged = summary.stage_csv(&summary_path)?;

        let tx = conn.transaction()?;
        let applied = apply_plan(&tx, self.kind, &plan)
            .and_then(|()| {
                let event = Event::new(
                    "worksheet_consumed",
                    self.kind.as_str(),
                    &self.job_id.to_string(),
                    serde_json::to_value(&summary)?,
                    ACTOR,
                );
                db::insert_event(&tx, &event)
            });
        if let Err(e) = applied {
            error!(kind = %self.kind, error = %e, "worksheet processing failed, rolled back");
            return Err(e);
        }
        tx.commit()?;

        info!(
            kind = %self.kind,
            job_id = self.job_id,
            rows = summary.total_records,
            "worksheet processing committed"
        );

        // The summary only describes committed runs
        persist_staged(staged, &summary_path)?;
        info!(path = %summary_path.display(), "processing summary saved");
        Ok(summary)
    }

    /// Full run: truncate, then process.
    pub fn consume(&self, conn: &mut Connection) -> Result<ProcessingSummary> {
        info!(kind = %self.kind, "starting worksheet consumption");
        self.truncate_tables(conn)?;
        let summary = self.process(conn)?;
        info!(kind = %self.kind, "worksheet consumption completed");
        Ok(summary)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worksheet::Row;
    use serde_json::{json, Value};
    use tempfile::TempDir;

    fn review(row: usize, identity: i64, token: i64, group: Option<&str>, dnm: Option<i64>) -> ReviewRow {
        ReviewRow {
            row,
            identity_id: identity,
            token_id: token,
            group_label: group.map(str::to_string),
            do_not_merge: dnm,
            invalid_ssn: false,
            ssn: None,
        }
    }

    fn sheet_row(identity: Value, token: Value, group: Value, dnm: Value, invalid: Value, ssn: Value) -> Row {
        [
            (names::IDENTITY_ID, identity),
            (names::TOKEN_ID, token),
            (names::GROUP_ID, group),
            (names::DO_NOT_MERGE, dnm),
            (names::INVALID_SSN, invalid),
            (names::SSN, ssn),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
    }

    fn write_sheet(dir: &TempDir, rows: Vec<Row>) -> PathBuf {
        let path = dir.path().join("reviewed.csv");
        let sheet = Worksheet {
            columns: REQUIRED_COLUMNS.iter().map(|c| c.to_string()).collect(),
            rows,
        };
        sheet.write_csv(&path).unwrap();
        path
    }

    fn reviewed_rows() -> Vec<Row> {
        vec![
            // identity 100: fully ungrouped, whitelisted
            sheet_row(json!(100), json!(1), Value::Null, json!(1), json!(""), json!("")),
            sheet_row(json!(100), json!(2), Value::Null, json!(2), json!(""), json!("")),
            // identity 200: split with a do-not-merge pairing
            sheet_row(json!(200), json!(3), json!(1), json!(1), json!(1), json!("123-45-6789")),
            sheet_row(json!(200), json!(4), json!(3), json!(2), json!(1), json!("12-34")),
            sheet_row(json!(200), json!(4), json!(3), json!(2), json!(""), json!("")),
            sheet_row(json!(200), json!(5), json!(3), json!("2.0"), json!(""), json!("")),
        ]
    }

    fn setup_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        db::setup_database(&conn).unwrap();
        conn
    }

    #[test]
    fn test_whitelist_requires_every_row_ungrouped() {
        let rows = vec![
            review(1, 10, 1, None, None),
            review(2, 10, 2, None, None),
            review(3, 20, 3, None, None),
            review(4, 20, 4, Some("1"), None),
        ];
        let plan = plan_classifications(&rows, 7, Utc::now());

        assert_eq!(plan.whitelist, vec![WhitelistEntry { identity_id: 10, job_id: 7 }]);
        assert_eq!(plan.whitelisted_tokens, BTreeSet::from([1, 2]));
        assert_eq!(plan.unmerge.len(), 1);
        assert_eq!(plan.unmerge[0].token_id, 4);
    }

    #[test]
    fn test_do_not_merge_pairing_rules() {
        let rows = vec![
            // one primary, two exclusions (one duplicated)
            review(1, 10, 1, Some("1"), Some(1)),
            review(2, 10, 2, Some("3"), Some(2)),
            review(3, 10, 2, Some("3"), Some(2)),
            review(4, 10, 3, Some("3"), Some(2)),
            // two primaries: no pairs
            review(5, 20, 4, Some("5"), Some(1)),
            review(6, 20, 5, Some("5"), Some(1)),
            review(7, 20, 6, Some("7"), Some(2)),
            // primary without exclusions: no pairs
            review(8, 30, 7, Some("9"), Some(1)),
        ];
        let plan = plan_classifications(&rows, 1, Utc::now());

        let pairs: Vec<(i64, i64)> = plan
            .blacklist
            .iter()
            .map(|p| (p.token_id_1, p.token_id_2))
            .collect();
        assert_eq!(pairs, vec![(1, 2), (1, 3)]);
    }

    #[test]
    fn test_whitelisted_identity_never_paired() {
        let rows = vec![
            review(1, 10, 1, None, Some(1)),
            review(2, 10, 2, None, Some(2)),
        ];
        let plan = plan_classifications(&rows, 1, Utc::now());

        assert!(plan.blacklist.is_empty());
        assert_eq!(plan.whitelist.len(), 1);
    }

    #[test]
    fn test_invalid_ssn_normalized_or_skipped() {
        let mut good = review(1, 10, 1, Some("1"), None);
        good.invalid_ssn = true;
        good.ssn = Some("123-45-6789".to_string());
        let mut bad = review(2, 10, 2, Some("1"), None);
        bad.invalid_ssn = true;
        bad.ssn = Some("123".to_string());
        let mut missing = review(3, 10, 3, Some("1"), None);
        missing.invalid_ssn = true;

        let plan = plan_classifications(&[good, bad, missing], 5, Utc::now());

        assert_eq!(
            plan.invalid_ssns,
            vec![InvalidSsnEntry { token_id: 1, ssn: "123456789".to_string(), job_id: 5 }]
        );
        assert_eq!(plan.skipped_ssn, 2);
    }

    #[test]
    fn test_unmerge_deduplicated_by_token() {
        let rows = vec![
            review(1, 10, 1, Some("1"), None),
            review(2, 10, 1, Some("3"), None),
            review(3, 10, 2, Some("3"), None),
        ];
        let plan = plan_classifications(&rows, 1, Utc::now());

        let labels: Vec<(i64, &str)> = plan
            .unmerge
            .iter()
            .map(|e| (e.token_id, e.group_label.as_str()))
            .collect();
        assert_eq!(labels, vec![(1, "1"), (2, "3")]);
        assert_eq!(plan.group_count(), 2);
    }

    #[test]
    fn test_review_rows_skip_blank_and_reject_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_sheet(
            &dir,
            vec![
                sheet_row(json!(1), json!(10), json!(1), Value::Null, Value::Null, Value::Null),
                sheet_row(Value::Null, Value::Null, Value::Null, Value::Null, Value::Null, Value::Null),
            ],
        );
        let sheet = Worksheet::read_csv(&path).unwrap();
        let rows = review_rows(&sheet).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].group_label.as_deref(), Some("1"));

        let bad = write_sheet(
            &dir,
            vec![sheet_row(json!("abc"), json!(10), Value::Null, Value::Null, Value::Null, Value::Null)],
        );
        let err = review_rows(&Worksheet::read_csv(&bad).unwrap()).unwrap_err();
        assert!(matches!(err, UnmergeError::MalformedRow { row: 1, .. }));
    }

    #[test]
    fn test_create_for_entity_validation() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_sheet(&dir, reviewed_rows());

        let err = WorksheetConsumer::create_for_entity(&path, 1, "vendor", dir.path(), "out.csv").unwrap_err();
        assert!(matches!(err, UnmergeError::UnsupportedEntityKind(_)));

        let missing = dir.path().join("nope.csv");
        let err = WorksheetConsumer::create_for_entity(&missing, 1, "person", dir.path(), "out.csv").unwrap_err();
        assert_eq!(err.class(), crate::error::ErrorClass::NotFound);
    }

    #[test]
    fn test_missing_columns_rejected_before_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.csv");
        let sheet = Worksheet {
            columns: vec![names::IDENTITY_ID.to_string(), names::TOKEN_ID.to_string()],
            rows: vec![],
        };
        sheet.write_csv(&path).unwrap();

        let mut conn = setup_db();
        let consumer = WorksheetConsumer::new(&path, 1, EntityKind::Person, dir.path(), "out.csv").unwrap();
        let err = consumer.process(&mut conn).unwrap_err();

        match err {
            UnmergeError::MissingColumns(columns) => {
                assert_eq!(columns, vec!["GroupID", "DoNotMerge", "InvalidSSN", "SSN"]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!consumer.summary_path().exists());
    }

    #[test]
    fn test_consume_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_sheet(&dir, reviewed_rows());
        let mut conn = setup_db();

        // Stale pair from another kind touching a token of the whitelisted identity
        let stale = BlacklistPair { token_id_1: 2, token_id_2: 99, job_id: 0 };
        db::insert_blacklist(&conn, EntityKind::Organization, &stale).unwrap();

        let job_id = db::next_job_id(&conn).unwrap();
        let consumer =
            WorksheetConsumer::create_for_entity(&path, job_id, "person", dir.path(), "out.csv").unwrap();
        let summary = consumer.consume(&mut conn).unwrap();

        assert_eq!(summary.total_records, 6);
        assert_eq!(summary.records_with_group, 4);
        assert_eq!(summary.records_without_group, 2);
        assert_eq!(summary.invalid_ssn_records, 2);
        assert_eq!(summary.invalid_ssn_recorded, 1);
        assert_eq!(summary.worksheet_sha256.len(), 64);
        assert!(consumer.summary_path().exists());

        let whitelist = db::get_whitelist(&conn, EntityKind::Person).unwrap();
        assert_eq!(whitelist, vec![WhitelistEntry { identity_id: 100, job_id }]);

        let blacklist = db::get_blacklist(&conn, EntityKind::Person).unwrap();
        let pairs: Vec<(i64, i64)> = blacklist.iter().map(|p| (p.token_id_1, p.token_id_2)).collect();
        assert_eq!(pairs, vec![(3, 4), (3, 5)]);
        assert!(db::get_blacklist(&conn, EntityKind::Organization).unwrap().is_empty());

        let ssns = db::get_invalid_ssns(&conn, EntityKind::Person).unwrap();
        assert_eq!(ssns.len(), 1);
        assert_eq!(ssns[0].ssn, "123456789");

        let unmerge = db::get_unmerge_entries(&conn, EntityKind::Person).unwrap();
        let labels: Vec<(i64, &str)> = unmerge.iter().map(|e| (e.token_id, e.group_label.as_str())).collect();
        assert_eq!(labels, vec![(3, "1"), (4, "3"), (5, "3")]);

        let events = db::get_events_for_entity(&conn, "person", &job_id.to_string()).unwrap();
        let types: BTreeSet<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(types, BTreeSet::from(["classifications_truncated", "worksheet_consumed"]));
    }

    #[test]
    fn test_consume_twice_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_sheet(&dir, reviewed_rows());
        let mut conn = setup_db();

        let snapshot = |conn: &Connection| {
            let whitelist: Vec<i64> = db::get_whitelist(conn, EntityKind::Person)
                .unwrap()
                .into_iter()
                .map(|e| e.identity_id)
                .collect();
            let blacklist: Vec<(i64, i64)> = db::get_blacklist(conn, EntityKind::Person)
                .unwrap()
                .into_iter()
                .map(|p| (p.token_id_1, p.token_id_2))
                .collect();
            let ssns: Vec<(i64, String)> = db::get_invalid_ssns(conn, EntityKind::Person)
                .unwrap()
                .into_iter()
                .map(|e| (e.token_id, e.ssn))
                .collect();
            let unmerge: Vec<(i64, String)> = db::get_unmerge_entries(conn, EntityKind::Person)
                .unwrap()
                .into_iter()
                .map(|e| (e.token_id, e.group_label))
                .collect();
            (whitelist, blacklist, ssns, unmerge)
        };

        let run = |conn: &mut Connection| {
            let job_id = db::next_job_id(conn).unwrap();
            WorksheetConsumer::new(&path, job_id, EntityKind::Person, dir.path(), "out.csv")
                .unwrap()
                .consume(conn)
                .unwrap();
        };

        run(&mut conn);
        let after_one = snapshot(&conn);
        run(&mut conn);
        let after_two = snapshot(&conn);

        assert_eq!(after_one, after_two);
        assert_eq!(after_two.0, vec![100]);
        assert_eq!(after_two.1.len(), 2);
        assert_eq!(after_two.2.len(), 1);
        assert_eq!(after_two.3.len(), 3);
    }

    #[test]
    fn test_failed_commit_leaves_no_summary() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_sheet(&dir, reviewed_rows());
        let out_dir = dir.path().join("out");
        let mut conn = setup_db();
        conn.execute("DROP TABLE events", []).unwrap();

        let consumer = WorksheetConsumer::new(&path, 1, EntityKind::Person, &out_dir, "out.csv").unwrap();
        let err = consumer.process(&mut conn).unwrap_err();

        assert_eq!(err.class(), crate::error::ErrorClass::DataAccess);
        assert!(!consumer.summary_path().exists());
        assert_eq!(fs::read_dir(&out_dir).unwrap().count(), 0);
        assert!(db::get_unmerge_entries(&conn, EntityKind::Person).unwrap().is_empty());
    }

    #[test]
    fn test_empty_plan_writes_nothing() {
        let conn = setup_db();
        let kept = BlacklistPair { token_id_1: 1, token_id_2: 2, job_id: 0 };
        db::insert_blacklist(&conn, EntityKind::Person, &kept).unwrap();

        let plan = plan_classifications(&[], 3, Utc::now());
        assert!(plan.is_empty());
        apply_plan(&conn, EntityKind::Person, &plan).unwrap();

        assert_eq!(db::get_blacklist(&conn, EntityKind::Person).unwrap(), vec![kept]);
    }

    #[test]
    fn test_generated_worksheet_consumed_after_review() {
        use crate::bitmap::BitmapCodec;
        use crate::columns::{ColumnKind, ColumnSpec};
        use crate::entities::{ChildDetails, ChildRecord, PersonDetails};
        use crate::orchestrator::generate_worksheet;

        let child = |child_id: i64, token_id: i64, name: &str, ssn: Option<&str>| ChildRecord {
            child_id,
            token_id,
            pkey: format!("P-{child_id}"),
            child_hash: format!("{child_id:08x}"),
            source_system: "K12".to_string(),
            full_name: Some(name.to_string()),
            user_comment: None,
            created_at: None,
            job_id: None,
            details: ChildDetails::Person(PersonDetails {
                ssn: ssn.map(str::to_string),
                ..PersonDetails::default()
            }),
        };

        let mut conn = setup_db();
        db::insert_unmerge_in(&conn, 500, EntityKind::Person).unwrap();
        for token_id in [1, 2, 3] {
            db::insert_token(&conn, token_id, 500, EntityKind::Person).unwrap();
        }
        db::insert_child(&conn, &child(10, 1, "Bob Smith", None)).unwrap();
        db::insert_child(&conn, &child(11, 2, "Bo Smith", None)).unwrap();
        db::insert_child(&conn, &child(12, 3, "Alice Jones", Some("123-45-6789"))).unwrap();
        for (order, name) in REQUIRED_COLUMNS.iter().enumerate() {
            let spec = ColumnSpec::new(order as i64, name, ColumnKind::Required, EntityKind::Person);
            db::insert_column_spec(&conn, &spec).unwrap();
        }

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("unmerge_workbook_person.csv");
        generate_worksheet(&conn, EntityKind::Person, BitmapCodec::default(), &path).unwrap();

        // Reviewer edits: keep the clusters, split token 2 from token 1, flag token 3's SSN
        let mut sheet = Worksheet::read_csv(&path).unwrap();
        assert_eq!(sheet.columns, REQUIRED_COLUMNS.to_vec());
        sheet.rows[0].insert(names::DO_NOT_MERGE.to_string(), json!(1));
        sheet.rows[1].insert(names::DO_NOT_MERGE.to_string(), json!(2));
        sheet.rows[2].insert(names::INVALID_SSN.to_string(), json!(1));
        sheet.write_csv(&path).unwrap();

        let job_id = db::next_job_id(&conn).unwrap();
        let summary = WorksheetConsumer::new(&path, job_id, EntityKind::Person, dir.path(), "out.csv")
            .unwrap()
            .consume(&mut conn)
            .unwrap();

        assert_eq!(summary.total_records, 3);
        assert_eq!(summary.records_with_group, 3);
        assert_eq!(summary.groups, 2);
        assert!(db::get_whitelist(&conn, EntityKind::Person).unwrap().is_empty());

        let pairs: Vec<(i64, i64)> = db::get_blacklist(&conn, EntityKind::Person)
            .unwrap()
            .iter()
            .map(|p| (p.token_id_1, p.token_id_2))
            .collect();
        assert_eq!(pairs, vec![(1, 2)]);

        let ssns = db::get_invalid_ssns(&conn, EntityKind::Person).unwrap();
        assert_eq!(ssns.len(), 1);
        assert_eq!((ssns[0].token_id, ssns[0].ssn.as_str()), (3, "123456789"));

        // "ALICEJONS" is the longest fingerprint and forms group 1
        let labels: Vec<(i64, String)> = db::get_unmerge_entries(&conn, EntityKind::Person)
            .unwrap()
            .into_iter()
            .map(|e| (e.token_id, e.group_label))
            .collect();
        assert_eq!(
            labels,
            vec![(1, "3".to_string()), (2, "3".to_string()), (3, "1".to_string())]
        );
    }

    #[test]
    fn test_phase_one_failure_leaves_state_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_sheet(&dir, reviewed_rows());
        let mut conn = setup_db();

        let prior = UnmergeEntry {
            token_id: 42,
            group_label: "9".to_string(),
            job_id: 0,
            created_at: Utc::now(),
        };
        db::insert_unmerge(&conn, EntityKind::Person, &prior).unwrap();
        conn.execute("DROP TABLE invalid_ssn", []).unwrap();

        let consumer = WorksheetConsumer::new(&path, 1, EntityKind::Person, dir.path(), "out.csv").unwrap();
        let err = consumer.consume(&mut conn).unwrap_err();

        assert_eq!(err.class(), crate::error::ErrorClass::DataAccess);
        assert!(!consumer.summary_path().exists());
        let unmerge = db::get_unmerge_entries(&conn, EntityKind::Person).unwrap();
        assert_eq!(unmerge.len(), 1);
        assert_eq!(unmerge[0].token_id, 42);
        assert!(db::get_whitelist(&conn, EntityKind::Person).unwrap().is_empty());
    }
}
