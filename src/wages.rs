// 💵 Wage Aggregation - irregular wage rows → five aligned column families
//
//   wq_<y>_P          quarterly presence bitmap ("#_#_")
//   wq_<y>_<q>_HR     hours per quarter
//   wq_<y>_<q>_AMT    amount per quarter
//   wq_<y>_HR         annual hours (ANNUAL rows only)
//   wq_<y>_AMT        annual amount (ANNUAL rows only)
//
// Every family is laid out over the full observed year range, so every token
// gets the same shape. Missing cells are 0 (or an all-absent bitmap).

use crate::bitmap::BitmapCodec;
use crate::worksheet::{EnrichmentBlock, OptionalColumns, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::{debug, info};

pub const QUARTERS: [&str; 4] = ["1", "2", "3", "4"];
pub const ANNUAL_TERM: &str = "ANNUAL";

pub const HOURS_SENTINEL: f64 = -9999.0;
pub const AMOUNT_SENTINEL: f64 = -9999.99;

pub const PRESENCE_FAMILY: &str = "InWorkforceByQuarter";
pub const QUARTER_HOURS_FAMILY: &str = "WageHoursByQuarter";
pub const QUARTER_AMOUNT_FAMILY: &str = "WagesByQuarter";
pub const ANNUAL_HOURS_FAMILY: &str = "WageHoursByYear";
pub const ANNUAL_AMOUNT_FAMILY: &str = "WagesByYear";

pub const ORG_ID_COLUMN: &str = "WageOrgID";
pub const ORG_NAME_COLUMN: &str = "WageOrganization";

// ============================================================================
// WAGE RECORD
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WageRecord {
    pub token_id: i64,
    pub organization_year: i32,

    /// "1".."4" for quarters, "ANNUAL" for the yearly total
    pub term_code: String,
    pub wage_hours: f64,
    pub wage_amount: f64,
    pub organization_id: Option<String>,
    pub organization_name: Option<String>,
}

impl WageRecord {
    fn quarter_index(&self) -> Option<usize> {
        QUARTERS.iter().position(|q| *q == self.term_code)
    }

    fn is_annual(&self) -> bool {
        self.term_code == ANNUAL_TERM
    }
}

/// Organization shown next to a token's wage columns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrgMeta {
    pub organization_id: Option<String>,
    pub organization_name: Option<String>,
}

// ============================================================================
// STEPS
// ============================================================================

/// Replace sentinels with 0 and drop rows duplicated on
/// (token, year, term, amount, hours). First occurrence wins.
pub fn housekeep(records: &[WageRecord]) -> Vec<WageRecord> {
    let mut seen: HashSet<(i64, i32, String, u64, u64)> = HashSet::new();
    let mut cleaned = Vec::with_capacity(records.len());

    for record in records {
        let mut record = record.clone();
        record.term_code = record.term_code.trim().to_string();
        if record.wage_hours == HOURS_SENTINEL {
            record.wage_hours = 0.0;
        }
        if record.wage_amount == AMOUNT_SENTINEL {
            record.wage_amount = 0.0;
        }

        let key = (
            record.token_id,
            record.organization_year,
            record.term_code.clone(),
            record.wage_amount.to_bits(),
            record.wage_hours.to_bits(),
        );
        if seen.insert(key) {
            cleaned.push(record);
        }
    }

    debug!(
        input = records.len(),
        kept = cleaned.len(),
        "housekept wage rows"
    );
    cleaned
}

/// Per (token, year): bit q is 1 iff some quarter-q row has amount > 0.
pub fn presence_matrix(records: &[WageRecord]) -> HashMap<(i64, i32), [u8; 4]> {
    let mut presence: HashMap<(i64, i32), [u8; 4]> = HashMap::new();

    for record in records {
        if let Some(q) = record.quarter_index() {
            let bits = presence
                .entry((record.token_id, record.organization_year))
                .or_insert([0; 4]);
            if record.wage_amount > 0.0 {
                bits[q] = 1;
            }
        }
    }

    presence
}

/// First (hours, amount) seen per (token, year, quarter index).
pub fn quarter_tables(records: &[WageRecord]) -> HashMap<(i64, i32, usize), (f64, f64)> {
    let mut table = HashMap::new();
    for record in records {
        if let Some(q) = record.quarter_index() {
            table
                .entry((record.token_id, record.organization_year, q))
                .or_insert((record.wage_hours, record.wage_amount));
        }
    }
    table
}

/// First (hours, amount) seen per (token, year) among ANNUAL rows.
pub fn annual_tables(records: &[WageRecord]) -> HashMap<(i64, i32), (f64, f64)> {
    let mut table = HashMap::new();
    for record in records.iter().filter(|r| r.is_annual()) {
        table
            .entry((record.token_id, record.organization_year))
            .or_insert((record.wage_hours, record.wage_amount));
    }
    table
}

/// Organization from the most recent year, ties broken by term code
/// descending (so "ANNUAL" outranks "4").
pub fn org_meta(records: &[WageRecord]) -> HashMap<i64, OrgMeta> {
    let mut sorted: Vec<&WageRecord> = records.iter().collect();
    sorted.sort_by(|a, b| {
        a.token_id
            .cmp(&b.token_id)
            .then_with(|| b.organization_year.cmp(&a.organization_year))
            .then_with(|| b.term_code.cmp(&a.term_code))
    });

    let mut meta = HashMap::new();
    for record in sorted {
        meta.entry(record.token_id).or_insert_with(|| OrgMeta {
            organization_id: record.organization_id.clone(),
            organization_name: record.organization_name.clone(),
        });
    }
    meta
}

// ============================================================================
// COLUMN NAMES
// ============================================================================

pub fn presence_column(year: i32) -> String {
    format!("wq_{year}_P")
}

pub fn quarter_hours_column(year: i32, quarter: &str) -> String {
    format!("wq_{year}_{quarter}_HR")
}

pub fn quarter_amount_column(year: i32, quarter: &str) -> String {
    format!("wq_{year}_{quarter}_AMT")
}

pub fn annual_hours_column(year: i32) -> String {
    format!("wq_{year}_HR")
}

pub fn annual_amount_column(year: i32) -> String {
    format!("wq_{year}_AMT")
}

fn number(value: f64) -> Value {
    Value::from(value)
}

fn optional_text(value: &Option<String>) -> Value {
    value.clone().map(Value::String).unwrap_or(Value::Null)
}

// ============================================================================
// ENTRY POINT
// ============================================================================

/// Build the wage block and register each family's columns.
///
/// An empty input produces an empty block and registers nothing.
pub fn prepare(
    records: &[WageRecord],
    codec: &BitmapCodec,
    optional: &mut OptionalColumns,
) -> EnrichmentBlock {
    if records.is_empty() {
        return EnrichmentBlock::default();
    }

    info!(rows = records.len(), "processing wage rows");

    let cleaned = housekeep(records);
    let years: Vec<i32> = cleaned
        .iter()
        .map(|r| r.organization_year)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let tokens: BTreeSet<i64> = cleaned.iter().map(|r| r.token_id).collect();

    let presence = presence_matrix(&cleaned);
    let quarters = quarter_tables(&cleaned);
    let annual = annual_tables(&cleaned);
    let meta = org_meta(&cleaned);

    let presence_cols: Vec<String> = years.iter().map(|y| presence_column(*y)).collect();
    let quarter_hour_cols: Vec<String> = years
        .iter()
        .flat_map(|y| QUARTERS.iter().map(move |q| quarter_hours_column(*y, q)))
        .collect();
    let quarter_amount_cols: Vec<String> = years
        .iter()
        .flat_map(|y| QUARTERS.iter().map(move |q| quarter_amount_column(*y, q)))
        .collect();
    let annual_hour_cols: Vec<String> = years.iter().map(|y| annual_hours_column(*y)).collect();
    let annual_amount_cols: Vec<String> = years.iter().map(|y| annual_amount_column(*y)).collect();

    let mut by_token: HashMap<i64, Row> = HashMap::with_capacity(tokens.len());
    for token_id in &tokens {
        let mut row = Row::new();

        for year in &years {
            let bits = presence.get(&(*token_id, *year)).copied().unwrap_or([0; 4]);
            row.insert(presence_column(*year), Value::String(codec.encode(&bits)));

            for (q, quarter) in QUARTERS.iter().enumerate() {
                let (hours, amount) = quarters
                    .get(&(*token_id, *year, q))
                    .copied()
                    .unwrap_or((0.0, 0.0));
                row.insert(quarter_hours_column(*year, quarter), number(hours));
                row.insert(quarter_amount_column(*year, quarter), number(amount));
            }

            let (hours, amount) = annual.get(&(*token_id, *year)).copied().unwrap_or((0.0, 0.0));
            row.insert(annual_hours_column(*year), number(hours));
            row.insert(annual_amount_column(*year), number(amount));
        }

        let org = meta.get(token_id).cloned().unwrap_or_default();
        row.insert(ORG_ID_COLUMN.to_string(), optional_text(&org.organization_id));
        row.insert(ORG_NAME_COLUMN.to_string(), optional_text(&org.organization_name));

        by_token.insert(*token_id, row);
    }

    for (family, columns) in [
        (PRESENCE_FAMILY, &presence_cols),
        (QUARTER_HOURS_FAMILY, &quarter_hour_cols),
        (QUARTER_AMOUNT_FAMILY, &quarter_amount_cols),
        (ANNUAL_HOURS_FAMILY, &annual_hour_cols),
        (ANNUAL_AMOUNT_FAMILY, &annual_amount_cols),
    ] {
        optional.insert(family.to_string(), columns.clone());
    }

    let columns: Vec<String> = presence_cols
        .iter()
        .chain(&quarter_hour_cols)
        .chain(&quarter_amount_cols)
        .chain(&annual_hour_cols)
        .chain(&annual_amount_cols)
        .cloned()
        .chain([ORG_ID_COLUMN.to_string(), ORG_NAME_COLUMN.to_string()])
        .collect();

    info!(
        tokens = tokens.len(),
        years = years.len(),
        columns = columns.len(),
        "wage block ready"
    );

    EnrichmentBlock { columns, by_token }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wage(token_id: i64, year: i32, term: &str, hours: f64, amount: f64) -> WageRecord {
        WageRecord {
            token_id,
            organization_year: year,
            term_code: term.to_string(),
            wage_hours: hours,
            wage_amount: amount,
            organization_id: Some(format!("ORG-{year}-{term}")),
            organization_name: Some(format!("Employer {year} {term}")),
        }
    }

    #[test]
    fn test_sentinels_normalized() {
        let cleaned = housekeep(&[wage(1, 2010, "1", HOURS_SENTINEL, AMOUNT_SENTINEL)]);
        assert_eq!(cleaned[0].wage_hours, 0.0);
        assert_eq!(cleaned[0].wage_amount, 0.0);

        // Near-sentinel values are real data
        let kept = housekeep(&[wage(1, 2010, "1", -9999.5, -9999.98)]);
        assert_eq!(kept[0].wage_hours, -9999.5);
        assert_eq!(kept[0].wage_amount, -9999.98);
    }

    #[test]
    fn test_duplicates_collapsed_after_normalization() {
        let cleaned = housekeep(&[
            wage(1, 2010, "1", HOURS_SENTINEL, 100.0),
            wage(1, 2010, "1", 0.0, 100.0),
            wage(1, 2010, "2", 0.0, 100.0),
        ]);
        assert_eq!(cleaned.len(), 2);
    }

    #[test]
    fn test_presence_any_positive_amount() {
        let records = vec![
            wage(1, 2010, "1", 10.0, 0.0),
            wage(1, 2010, "1", 12.0, 50.0),
            wage(1, 2010, "3", 5.0, 20.0),
            wage(1, 2010, ANNUAL_TERM, 27.0, 70.0),
        ];
        let presence = presence_matrix(&records);
        assert_eq!(presence[&(1, 2010)], [1, 0, 1, 0]);
    }

    #[test]
    fn test_org_meta_latest_year_then_term_desc() {
        let records = vec![
            wage(1, 2011, "4", 1.0, 1.0),
            wage(1, 2011, ANNUAL_TERM, 1.0, 1.0),
            wage(1, 2009, "4", 1.0, 1.0),
        ];
        let meta = org_meta(&records);
        assert_eq!(meta[&1].organization_id.as_deref(), Some("ORG-2011-ANNUAL"));
    }

    #[test]
    fn test_prepare_shapes_and_families() {
        let records = vec![
            wage(1, 2010, "1", 40.0, 500.0),
            wage(1, 2010, "2", HOURS_SENTINEL, AMOUNT_SENTINEL),
            wage(2, 2011, ANNUAL_TERM, 1200.0, 30000.0),
        ];
        let mut optional = OptionalColumns::new();

        let block = prepare(&records, &BitmapCodec::default(), &mut optional);

        assert_eq!(optional[PRESENCE_FAMILY], vec!["wq_2010_P", "wq_2011_P"]);
        assert_eq!(optional[QUARTER_HOURS_FAMILY].len(), 8);
        assert_eq!(optional[ANNUAL_AMOUNT_FAMILY], vec!["wq_2010_AMT", "wq_2011_AMT"]);
        assert_eq!(block.columns.len(), 2 + 8 + 8 + 2 + 2 + 2);

        let first = &block.by_token[&1];
        assert_eq!(first["wq_2010_P"], Value::from("#___"));
        assert_eq!(first["wq_2010_1_AMT"], Value::from(500.0));
        assert_eq!(first["wq_2010_2_HR"], Value::from(0.0));
        assert_eq!(first["wq_2011_P"], Value::from("____"));

        // Annual-only token still carries every quarter column
        let second = &block.by_token[&2];
        assert_eq!(second["wq_2010_P"], Value::from("____"));
        assert_eq!(second["wq_2011_3_AMT"], Value::from(0.0));
        assert_eq!(second["wq_2011_AMT"], Value::from(30000.0));
        assert_eq!(second[ORG_NAME_COLUMN], Value::from("Employer 2011 ANNUAL"));
    }

    #[test]
    fn test_prepare_empty_input() {
        let mut optional = OptionalColumns::new();
        assert!(prepare(&[], &BitmapCodec::default(), &mut optional).is_empty());
        assert!(optional.is_empty());
    }
}
