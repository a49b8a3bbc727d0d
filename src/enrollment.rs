// 🏫 Enrollment Aggregation - irregular enrollment periods → monthly presence
//
// Pipeline:
//   1. preprocess: drop periods starting after Aug 31 of their school year,
//      default an open end date to Sep 1 of the prior calendar year
//   2. sample the 15th of Sep..Dec (year - 1) and Jan..Aug (year)
//   3. pivot into a token × school-year matrix
//   4. trim leading and trailing school years where nobody was enrolled

use crate::bitmap::BitmapCodec;
use crate::worksheet::{EnrichmentBlock, OptionalColumns, Row};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, info, warn};

/// Family name the column specification uses for enrollment columns.
pub const ENROLLMENT_FAMILY: &str = "K12_District";

pub const MONTHS_PER_SCHOOL_YEAR: usize = 12;

const SAMPLE_DAY: u32 = 15;

// ============================================================================
// INPUT / INTERMEDIATE RECORDS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrollmentPeriod {
    pub token_id: i64,

    /// School year, named by the calendar year it ends in (2005 = 2004-05)
    pub organization_year: i32,
    pub begin_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
}

/// Period after preprocessing: end date resolved, school year assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchoolYearPeriod {
    pub token_id: i64,
    pub school_year: i32,
    pub begin: NaiveDate,
    pub end: NaiveDate,
}

/// Token × school-year matrix of 12-slot bitmaps. Missing cells mean "no
/// enrollment rows for that token in that year".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnrollmentMatrix {
    pub years: Vec<i32>,
    pub cells: BTreeMap<i64, BTreeMap<i32, Vec<u8>>>,
}

impl EnrollmentMatrix {
    fn year_has_enrollment(&self, year: i32) -> bool {
        self.cells
            .values()
            .filter_map(|by_year| by_year.get(&year))
            .any(|bits| bits.iter().any(|&bit| bit == 1))
    }
}

// ============================================================================
// STEPS
// ============================================================================

pub fn preprocess(periods: &[EnrollmentPeriod]) -> Vec<SchoolYearPeriod> {
    let mut kept = Vec::with_capacity(periods.len());

    for period in periods {
        let year = period.organization_year;
        let (Some(anchor), Some(default_end)) = (
            NaiveDate::from_ymd_opt(year, 8, 31),
            year.checked_sub(1).and_then(|prior| NaiveDate::from_ymd_opt(prior, 9, 1)),
        ) else {
            warn!(token_id = period.token_id, year, "school year out of date range, skipping");
            continue;
        };

        if period.begin_date > anchor {
            continue;
        }

        kept.push(SchoolYearPeriod {
            token_id: period.token_id,
            school_year: year,
            begin: period.begin_date,
            end: period.end_date.unwrap_or(default_end),
        });
    }

    debug!(
        input = periods.len(),
        kept = kept.len(),
        "preprocessed enrollment periods"
    );
    kept
}

/// The twelve sample dates of a school year, September first.
pub fn school_year_sample_dates(school_year: i32) -> Vec<NaiveDate> {
    let Some(prior) = school_year.checked_sub(1) else {
        return Vec::new();
    };
    let fall = (9..=12).filter_map(|month| NaiveDate::from_ymd_opt(prior, month, SAMPLE_DAY));
    let spring = (1..=8).filter_map(|month| NaiveDate::from_ymd_opt(school_year, month, SAMPLE_DAY));
    fall.chain(spring).collect()
}

/// 1 for every sample date covered (inclusive) by any period.
pub fn compute_enrollment_bitmap(school_year: i32, periods: &[(NaiveDate, NaiveDate)]) -> Vec<u8> {
    let mut bits: Vec<u8> = school_year_sample_dates(school_year)
        .into_iter()
        .map(|day| {
            let enrolled = periods
                .iter()
                .any(|(begin, end)| *begin <= day && day <= *end);
            u8::from(enrolled)
        })
        .collect();

    bits.resize(MONTHS_PER_SCHOOL_YEAR, 0);
    bits
}

/// One bitmap per (token, school year) that has at least one period.
pub fn generate_enrollment_bitmaps(periods: &[SchoolYearPeriod]) -> BTreeMap<(i64, i32), Vec<u8>> {
    let mut grouped: BTreeMap<(i64, i32), Vec<(NaiveDate, NaiveDate)>> = BTreeMap::new();
    for period in periods {
        grouped
            .entry((period.token_id, period.school_year))
            .or_default()
            .push((period.begin, period.end));
    }

    grouped
        .into_iter()
        .map(|((token_id, year), ranges)| {
            ((token_id, year), compute_enrollment_bitmap(year, &ranges))
        })
        .collect()
}

pub fn pivot(bitmaps: BTreeMap<(i64, i32), Vec<u8>>) -> EnrollmentMatrix {
    let years: BTreeSet<i32> = bitmaps.keys().map(|(_, year)| *year).collect();

    let mut cells: BTreeMap<i64, BTreeMap<i32, Vec<u8>>> = BTreeMap::new();
    for ((token_id, year), bits) in bitmaps {
        cells.entry(token_id).or_default().insert(year, bits);
    }

    EnrollmentMatrix {
        years: years.into_iter().collect(),
        cells,
    }
}

/// Drop the leading and trailing runs of all-zero school years. Interior
/// zero years stay; a matrix with no enrollment at all loses every year.
pub fn trim_non_enrollment_years(matrix: &mut EnrollmentMatrix) {
    let first = matrix
        .years
        .iter()
        .position(|year| matrix.year_has_enrollment(*year));
    let last = matrix
        .years
        .iter()
        .rposition(|year| matrix.year_has_enrollment(*year));

    let before = matrix.years.len();
    matrix.years = match (first, last) {
        (Some(first), Some(last)) => matrix.years[first..=last].to_vec(),
        _ => Vec::new(),
    };

    let kept: BTreeSet<i32> = matrix.years.iter().copied().collect();
    for by_year in matrix.cells.values_mut() {
        by_year.retain(|year, _| kept.contains(year));
    }

    debug!(before, after = matrix.years.len(), "trimmed enrollment years");
}

pub fn column_name(school_year: i32) -> String {
    format!("k12_{school_year}")
}

// ============================================================================
// ENTRY POINT
// ============================================================================

/// Build the enrollment block and register its columns under
/// [`ENROLLMENT_FAMILY`].
///
/// Tokens with rows get every year column; years they have no rows for show
/// an empty string. An empty input produces an empty block and registers
/// nothing.
pub fn prepare(
    periods: &[EnrollmentPeriod],
    codec: &BitmapCodec,
    optional: &mut OptionalColumns,
) -> EnrichmentBlock {
    if periods.is_empty() {
        return EnrichmentBlock::default();
    }

    info!(rows = periods.len(), "processing enrollment rows");

    let prepared = preprocess(periods);
    let mut matrix = pivot(generate_enrollment_bitmaps(&prepared));
    trim_non_enrollment_years(&mut matrix);

    let columns: Vec<String> = matrix.years.iter().map(|year| column_name(*year)).collect();

    let by_token: HashMap<i64, Row> = matrix
        .cells
        .iter()
        .map(|(token_id, by_year)| {
            let row: Row = matrix
                .years
                .iter()
                .map(|year| {
                    let display = by_year
                        .get(year)
                        .map(|bits| codec.encode(bits))
                        .unwrap_or_default();
                    (column_name(*year), Value::String(display))
                })
                .collect();
            (*token_id, row)
        })
        .collect();

    optional.insert(ENROLLMENT_FAMILY.to_string(), columns.clone());

    EnrichmentBlock { columns, by_token }
}
