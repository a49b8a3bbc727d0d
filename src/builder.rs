// 🏗️ Worksheet Assembly - child records + groups + history → review table
//
// Steps:
//   1. load child records for the tokens (empty → empty worksheet)
//   2. fingerprint each record, keep each token's longest (ties joined by '|')
//   3. cluster the fingerprints into GroupIDs
//   4. build the core table, one row per child record
//   5. left-merge enrollment and wage blocks by TokenID
//   6. give every row of a group the group's best fingerprint
//   7. apply the configured column layout
//   8. sort by (P20ID, TokenID, FullName), nulls last

use crate::bitmap::BitmapCodec;
use crate::columns::{apply_column_order, ColumnSpec};
use crate::enrollment::{self, EnrollmentPeriod};
use crate::entities::ChildRecord;
use crate::error::Result;
use crate::fingerprint::canonicalize_name;
use crate::grouping::{best_fingerprint, process_worksheet_group_ids, TIE_DELIMITER};
use crate::wages::{self, WageRecord};
use crate::worksheet::{cell_as_i64, cell_as_text, names, OptionalColumns, Row, Worksheet};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, info, warn};

// ============================================================================
// CHILD SOURCE
// ============================================================================

/// Where raw child records come from.
pub trait ChildSource {
    fn load_children(&self, token_ids: &[i64]) -> Result<Vec<ChildRecord>>;
}

impl ChildSource for [ChildRecord] {
    fn load_children(&self, token_ids: &[i64]) -> Result<Vec<ChildRecord>> {
        let wanted: BTreeSet<i64> = token_ids.iter().copied().collect();
        Ok(self
            .iter()
            .filter(|child| wanted.contains(&child.token_id))
            .cloned()
            .collect())
    }
}

impl ChildSource for Vec<ChildRecord> {
    fn load_children(&self, token_ids: &[i64]) -> Result<Vec<ChildRecord>> {
        self.as_slice().load_children(token_ids)
    }
}

// ============================================================================
// WORKSHEET BUILDER
// ============================================================================

pub struct WorksheetBuilder {
    column_order: Vec<ColumnSpec>,
    codec: BitmapCodec,
}

impl WorksheetBuilder {
    pub fn new(column_order: Vec<ColumnSpec>) -> Self {
        WorksheetBuilder {
            column_order,
            codec: BitmapCodec::default(),
        }
    }

    pub fn with_codec(mut self, codec: BitmapCodec) -> Self {
        self.codec = codec;
        self
    }

    pub fn column_order(&self) -> &[ColumnSpec] {
        &self.column_order
    }

    pub fn build<S: ChildSource + ?Sized>(
        &self,
        source: &S,
        token_ids: &[i64],
        token_to_identity: &HashMap<i64, i64>,
        enrollment_periods: &[EnrollmentPeriod],
        wage_records: &[WageRecord],
    ) -> Result<Worksheet> {
        let mut optional = OptionalColumns::new();

        let children = source.load_children(token_ids)?;
        if children.is_empty() {
            warn!(tokens = token_ids.len(), "no child rows found, returning empty worksheet");
            return Ok(Worksheet::new());
        }

        let token_fingerprints = compute_fingerprints(&children);
        let empty = token_fingerprints.values().filter(|fp| fp.is_empty()).count();
        if empty > 0 {
            // The empty fingerprint is a subset of every other one
            warn!(
                tokens = empty,
                "tokens without a usable name will join the first group formed"
            );
        }

        let pairs: Vec<(i64, String)> = token_fingerprints
            .iter()
            .map(|(token_id, fp)| (*token_id, fp.clone()))
            .collect();
        let group_map = process_worksheet_group_ids(&pairs);
        info!(
            tokens = token_fingerprints.len(),
            groups = group_map.values().collect::<BTreeSet<_>>().len(),
            "assigned group ids"
        );

        let mut sheet = build_core(&children, token_to_identity, &token_fingerprints, &group_map);

        if !enrollment_periods.is_empty() {
            let block = enrollment::prepare(enrollment_periods, &self.codec, &mut optional);
            sheet.left_merge(&block);
        }
        if !wage_records.is_empty() {
            let block = wages::prepare(wage_records, &self.codec, &mut optional);
            sheet.left_merge(&block);
        }

        overwrite_fingerprint_with_group_canonical(&mut sheet);
        apply_column_order(&mut sheet, &self.column_order, &optional);
        sheet.sort_by_columns(&[names::IDENTITY_ID, names::TOKEN_ID, names::FULL_NAME]);

        info!(
            rows = sheet.len(),
            columns = sheet.columns.len(),
            "worksheet assembled"
        );
        Ok(sheet)
    }
}

// ============================================================================
// STEPS
// ============================================================================

/// Per token: the distinct fingerprints tied at maximum length, sorted and
/// joined with `|`.
pub fn compute_fingerprints(children: &[ChildRecord]) -> BTreeMap<i64, String> {
    info!(children = children.len(), "computing fingerprints");
    let delimiter = TIE_DELIMITER.to_string();

    let mut by_token: BTreeMap<i64, BTreeSet<String>> = BTreeMap::new();
    for child in children {
        by_token
            .entry(child.token_id)
            .or_default()
            .insert(canonicalize_name(&child.display_name()));
    }

    by_token
        .into_iter()
        .map(|(token_id, fingerprints)| {
            let longest = fingerprints.iter().map(|fp| fp.len()).max().unwrap_or(0);
            let tied: Vec<&str> = fingerprints
                .iter()
                .filter(|fp| fp.len() == longest)
                .map(String::as_str)
                .collect();
            (token_id, tied.join(delimiter.as_str()))
        })
        .collect()
}

/// One row per child whose token has an identity.
pub fn build_core(
    children: &[ChildRecord],
    token_to_identity: &HashMap<i64, i64>,
    token_fingerprints: &BTreeMap<i64, String>,
    group_map: &HashMap<i64, i64>,
) -> Worksheet {
    let mut sheet = Worksheet::new();
    let mut skipped = 0usize;

    for child in children {
        let Some(identity_id) = token_to_identity.get(&child.token_id) else {
            skipped += 1;
            continue;
        };

        let mut row = Row::new();
        for (name, value) in child.worksheet_fields() {
            sheet.ensure_column(name);
            row.insert(name.to_string(), value);
        }

        let computed = [
            (names::IDENTITY_ID, Value::from(*identity_id)),
            (
                names::FINGERPRINT,
                Value::from(
                    token_fingerprints
                        .get(&child.token_id)
                        .cloned()
                        .unwrap_or_default(),
                ),
            ),
            (
                names::GROUP_ID,
                group_map
                    .get(&child.token_id)
                    .map(|g| Value::from(*g))
                    .unwrap_or(Value::Null),
            ),
            (names::INVALID_SSN, Value::from("")),
            (names::INVALID_DOB, Value::from("")),
            (names::DO_NOT_MERGE, Value::from("")),
        ];
        for (name, value) in computed {
            sheet.ensure_column(name);
            row.insert(name.to_string(), value);
        }

        sheet.rows.push(row);
    }

    if skipped > 0 {
        debug!(skipped, "children without an identity left out");
    }
    sheet
}

/// Every row of a group shows the group's best fingerprint. Rows without a
/// GroupID keep their own.
pub fn overwrite_fingerprint_with_group_canonical(sheet: &mut Worksheet) {
    let mut by_group: BTreeMap<i64, Vec<String>> = BTreeMap::new();
    for row in &sheet.rows {
        let Some(group_id) = row.get(names::GROUP_ID).and_then(cell_as_i64) else {
            continue;
        };
        let fingerprint = cell_as_text(row.get(names::FINGERPRINT));
        let variants = by_group.entry(group_id).or_default();
        if let Some(fp) = fingerprint {
            variants.push(fp);
        }
    }

    let canonical: HashMap<i64, String> = by_group
        .into_iter()
        .map(|(group_id, values)| (group_id, best_fingerprint(values.iter().map(String::as_str))))
        .collect();

    for row in &mut sheet.rows {
        let Some(group_id) = row.get(names::GROUP_ID).and_then(cell_as_i64) else {
            continue;
        };
        if let Some(fp) = canonical.get(&group_id) {
            row.insert(names::FINGERPRINT.to_string(), Value::from(fp.clone()));
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
