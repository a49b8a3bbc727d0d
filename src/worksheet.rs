// 📋 Worksheet Table - ordered columns over map-shaped rows
//
// Rows are maps, not structs: enrichment blocks add year-named columns that
// only exist at run time. The column list carries the display order.

use crate::error::Result;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::{debug, info};

pub type Row = HashMap<String, Value>;

/// Column names each enrichment family produced, keyed by family name.
pub type OptionalColumns = HashMap<String, Vec<String>>;

// ============================================================================
// COLUMN NAMES
// ============================================================================

pub mod names {
    pub const IDENTITY_ID: &str = "P20ID";
    pub const TOKEN_ID: &str = "TokenID";
    pub const FULL_NAME: &str = "FullName";
    pub const FINGERPRINT: &str = "SmashID";
    pub const GROUP_ID: &str = "GroupID";
    pub const INVALID_SSN: &str = "InvalidSSN";
    pub const INVALID_DOB: &str = "InvalidDob";
    pub const DO_NOT_MERGE: &str = "DoNotMerge";
    pub const SSN: &str = "SSN";
    pub const ENTITY_TYPE: &str = "EntityType";
}

// ============================================================================
// ENRICHMENT BLOCK
// ============================================================================

/// Per-token columns produced by an aggregator, ready to left-merge.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnrichmentBlock {
    pub columns: Vec<String>,
    pub by_token: HashMap<i64, Row>,
}

impl EnrichmentBlock {
    pub fn is_empty(&self) -> bool {
        self.by_token.is_empty()
    }
}

// ============================================================================
// WORKSHEET
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Worksheet {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

impl Worksheet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c == name)
    }

    /// Register a column name without touching rows.
    pub fn ensure_column(&mut self, name: &str) {
        if !self.has_column(name) {
            self.columns.push(name.to_string());
        }
    }

    /// Add a column holding an empty string in every row.
    pub fn add_empty_column(&mut self, name: &str) {
        self.ensure_column(name);
        for row in &mut self.rows {
            row.insert(name.to_string(), Value::String(String::new()));
        }
    }

    pub fn get(&self, row: usize, column: &str) -> Option<&Value> {
        self.rows.get(row).and_then(|r| r.get(column))
    }

    /// Keep only `columns`, in that order.
    pub fn select_columns(&mut self, columns: Vec<String>) {
        for row in &mut self.rows {
            row.retain(|key, _| columns.contains(key));
        }
        self.columns = columns;
    }

    /// Left-merge a per-token block on the token id column. Rows whose token
    /// has no block entry get nulls.
    pub fn left_merge(&mut self, block: &EnrichmentBlock) {
        for column in &block.columns {
            self.ensure_column(column);
        }

        for row in &mut self.rows {
            let token_row = row
                .get(names::TOKEN_ID)
                .and_then(cell_as_i64)
                .and_then(|token_id| block.by_token.get(&token_id));

            for column in &block.columns {
                let value = token_row
                    .and_then(|r| r.get(column))
                    .cloned()
                    .unwrap_or(Value::Null);
                row.insert(column.clone(), value);
            }
        }

        debug!(
            columns = block.columns.len(),
            tokens = block.by_token.len(),
            "merged enrichment block"
        );
    }

    /// Stable multi-key sort, nulls last in every key.
    pub fn sort_by_columns(&mut self, keys: &[&str]) {
        self.rows.sort_by(|a, b| {
            keys.iter()
                .map(|key| compare_cells(a.get(*key), b.get(*key)))
                .find(|ordering| *ordering != Ordering::Equal)
                .unwrap_or(Ordering::Equal)
        });
    }

    // ========================================================================
    // CSV I/O
    // ========================================================================

    /// Written to a staging file beside `path` and renamed into place, so a
    /// failed write never leaves a truncated worksheet behind.
    pub fn write_csv(&self, path: &Path) -> Result<()> {
        let mut staged = staging_file(path)?;
        {
            let mut wtr = csv::Writer::from_writer(staged.as_file_mut());
            wtr.write_record(&self.columns)?;

            for row in &self.rows {
                let record: Vec<String> = self
                    .columns
                    .iter()
                    .map(|column| row.get(column).map(cell_text).unwrap_or_default())
                    .collect();
                wtr.write_record(&record)?;
            }

            wtr.flush()?;
        }
        persist_staged(staged, path)?;
        info!(
            path = %path.display(),
            rows = self.rows.len(),
            columns = self.columns.len(),
            "worksheet written"
        );
        Ok(())
    }

    /// Every field comes back as text; empty fields become null.
    pub fn read_csv(path: &Path) -> Result<Worksheet> {
        let mut rdr = csv::Reader::from_path(path)?;
        let columns: Vec<String> = rdr.headers()?.iter().map(str::to_string).collect();

        let mut rows = Vec::new();
        for record in rdr.records() {
            let record = record?;
            let row: Row = columns
                .iter()
                .zip(record.iter())
                .map(|(column, field)| {
                    let value = if field.is_empty() {
                        Value::Null
                    } else {
                        Value::String(field.to_string())
                    };
                    (column.clone(), value)
                })
                .collect();
            rows.push(row);
        }

        Ok(Worksheet { columns, rows })
    }
}

// ============================================================================
// STAGED FILES
// ============================================================================

/// Temp file in the directory of `path`; removed on drop unless persisted.
pub fn staging_file(path: &Path) -> Result<NamedTempFile> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    Ok(NamedTempFile::new_in(dir)?)
}

/// Atomically replace `path` with the staged file.
pub fn persist_staged(staged: NamedTempFile, path: &Path) -> Result<()> {
    staged.persist(path).map_err(|e| e.error)?;
    Ok(())
}

// ============================================================================
// CELL HELPERS
// ============================================================================

pub fn is_null(value: Option<&Value>) -> bool {
    matches!(value, None | Some(Value::Null))
}

/// Display form written to the worksheet file.
pub fn cell_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Integer view of a cell. Accepts `7`, `7.0` and their text spellings.
pub fn cell_as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        Value::String(s) => {
            let trimmed = s.trim();
            trimmed.parse::<i64>().ok().or_else(|| {
                trimmed
                    .parse::<f64>()
                    .ok()
                    .filter(|f| f.is_finite() && f.fract() == 0.0)
                    .map(|f| f as i64)
            })
        }
        _ => None,
    }
}

/// Text view of a cell; null and blank text are `None`.
pub fn cell_as_text(value: Option<&Value>) -> Option<String> {
    match value {
        None | Some(Value::Null) => None,
        Some(v) => {
            let text = cell_text(v);
            if text.trim().is_empty() {
                None
            } else {
                Some(text)
            }
        }
    }
}

/// Nulls sort after everything; numbers before text.
pub fn compare_cells(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (is_null(a), is_null(b)) {
        (true, true) => return Ordering::Equal,
        (true, false) => return Ordering::Greater,
        (false, true) => return Ordering::Less,
        (false, false) => {}
    }

    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let x = x.as_f64().unwrap_or(f64::NAN);
            let y = y.as_f64().unwrap_or(f64::NAN);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Some(Value::Number(_)), Some(_)) => Ordering::Less,
        (Some(_), Some(Value::Number(_))) => Ordering::Greater,
        (Some(x), Some(y)) => cell_text(x).cmp(&cell_text(y)),
        _ => Ordering::Equal,
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(cells: &[(&str, Value)]) -> Row {
        cells
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_sort_nulls_last() {
        let mut sheet = Worksheet {
            columns: vec!["P20ID".into(), "TokenID".into(), "FullName".into()],
            rows: vec![
                row(&[("P20ID", json!(2)), ("TokenID", json!(5)), ("FullName", json!("B"))]),
                row(&[("P20ID", Value::Null), ("TokenID", json!(1)), ("FullName", json!("A"))]),
                row(&[("P20ID", json!(1)), ("TokenID", json!(9)), ("FullName", Value::Null)]),
                row(&[("P20ID", json!(1)), ("TokenID", json!(9)), ("FullName", json!("Z"))]),
            ],
        };

        sheet.sort_by_columns(&["P20ID", "TokenID", "FullName"]);

        assert_eq!(sheet.get(0, "FullName"), Some(&json!("Z")));
        assert_eq!(sheet.get(1, "FullName"), Some(&Value::Null));
        assert_eq!(sheet.get(2, "P20ID"), Some(&json!(2)));
        assert_eq!(sheet.get(3, "P20ID"), Some(&Value::Null));
    }

    #[test]
    fn test_left_merge_fills_nulls() {
        let mut sheet = Worksheet {
            columns: vec!["TokenID".into()],
            rows: vec![row(&[("TokenID", json!(1))]), row(&[("TokenID", json!(2))])],
        };
        let mut by_token = HashMap::new();
        by_token.insert(1, row(&[("k12_2005", json!("#___"))]));
        let block = EnrichmentBlock {
            columns: vec!["k12_2005".into()],
            by_token,
        };

        sheet.left_merge(&block);

        assert_eq!(sheet.columns, vec!["TokenID", "k12_2005"]);
        assert_eq!(sheet.get(0, "k12_2005"), Some(&json!("#___")));
        assert_eq!(sheet.get(1, "k12_2005"), Some(&Value::Null));
    }

    #[test]
    fn test_cell_as_i64_spellings() {
        assert_eq!(cell_as_i64(&json!(3)), Some(3));
        assert_eq!(cell_as_i64(&json!(3.0)), Some(3));
        assert_eq!(cell_as_i64(&json!("3")), Some(3));
        assert_eq!(cell_as_i64(&json!(" 2.0 ")), Some(2));
        assert_eq!(cell_as_i64(&json!("2.5")), None);
        assert_eq!(cell_as_i64(&json!("x")), None);
        assert_eq!(cell_as_i64(&Value::Null), None);
    }

    #[test]
    fn test_csv_round_trip_reads_text() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sheet.csv");

        let sheet = Worksheet {
            columns: vec!["TokenID".into(), "GroupID".into(), "SSN".into()],
            rows: vec![
                row(&[("TokenID", json!(10)), ("GroupID", json!(1)), ("SSN", json!("012345678"))]),
                row(&[("TokenID", json!(11)), ("GroupID", Value::Null)]),
            ],
        };
        sheet.write_csv(&path).unwrap();

        let loaded = Worksheet::read_csv(&path).unwrap();
        assert_eq!(loaded.columns, sheet.columns);
        assert_eq!(loaded.get(0, "TokenID"), Some(&json!("10")));
        assert_eq!(loaded.get(0, "SSN"), Some(&json!("012345678")));
        assert_eq!(loaded.get(1, "GroupID"), Some(&Value::Null));
        assert_eq!(loaded.get(1, "SSN"), Some(&Value::Null));
    }

    #[test]
    fn test_write_replaces_whole_file_without_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sheet.csv");
        std::fs::write(&path, "old,header\n1,2\n3,4\n5,6\n").unwrap();

        let sheet = Worksheet {
            columns: vec!["TokenID".into()],
            rows: vec![row(&[("TokenID", json!(7))])],
        };
        sheet.write_csv(&path).unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "TokenID\n7\n");
        let entries = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[test]
    fn test_failed_write_leaves_target_untouched() {
        let dir = tempfile::tempdir().unwrap();
        // A non-empty directory at the target path cannot be replaced by a file
        let target = dir.path().join("sheet.csv");
        std::fs::create_dir(&target).unwrap();
        std::fs::write(target.join("keep.txt"), "keep").unwrap();

        let sheet = Worksheet {
            columns: vec!["TokenID".into()],
            rows: vec![row(&[("TokenID", json!(7))])],
        };
        let err = sheet.write_csv(&target).unwrap_err();

        assert_eq!(err.class(), crate::error::ErrorClass::DataAccess);
        assert!(target.join("keep.txt").exists());
        // Staging file was cleaned up
        let entries = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(entries, 1);
    }
}
