use crate::builder::ChildSource;
use crate::columns::{ColumnKind, ColumnSpec};
use crate::enrollment::EnrollmentPeriod;
use crate::entities::{
    BlacklistPair, ChildDetails, ChildRecord, EntityKind, InvalidSsnEntry, OrganizationDetails,
    PersonDetails, UnmergeEntry, WhitelistEntry,
};
use crate::error::Result;
use crate::wages::WageRecord;
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Connection, Row};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

/// Upper bound on ids bound into one `IN (...)` list
const IN_CHUNK: usize = 500;

/// Event for audit trail: every classification change is recorded
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Event {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub data: serde_json::Value,
    pub actor: String,
}

impl Event {
    pub fn new(
        event_type: &str,
        entity_type: &str,
        entity_id: &str,
        data: serde_json::Value,
        actor: &str,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            data,
            actor: actor.to_string(),
        }
    }
}

/// Counts removed by a classification truncate
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TruncateCounts {
    pub whitelist: usize,
    pub blacklist: usize,
    pub invalid_ssn: usize,
    pub unmerge: usize,
}

impl TruncateCounts {
    pub fn total(&self) -> usize {
        self.whitelist + self.blacklist + self.invalid_ssn + self.unmerge
    }
}

pub fn setup_database(conn: &Connection) -> Result<()> {
    // Enable WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;

    // ==========================================================================
    // Registry tables (read-only to this crate apart from seeding)
    // ==========================================================================
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS unmerge_in (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            identity_id INTEGER NOT NULL,
            entity_kind TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        );

        CREATE TABLE IF NOT EXISTS token (
            token_id INTEGER PRIMARY KEY,
            identity_id INTEGER NOT NULL,
            entity_kind TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS child (
            child_id INTEGER PRIMARY KEY,
            token_id INTEGER NOT NULL,
            pkey TEXT NOT NULL,
            child_hash TEXT NOT NULL,
            source_system TEXT NOT NULL,
            full_name TEXT,
            user_comment TEXT,
            created_at TEXT,
            job_id INTEGER,
            entity_type TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS person_child (
            child_id INTEGER PRIMARY KEY REFERENCES child(child_id),
            first_name TEXT,
            middle_name TEXT,
            last_name TEXT,
            suffix TEXT,
            nickname TEXT,
            gender TEXT,
            birth_date TEXT,
            invalid_dob INTEGER,
            collapsed_dob REAL,
            ssn TEXT,
            invalid_ssn INTEGER,
            last4_ssn TEXT,
            org_student_id TEXT,
            sourcewide_id TEXT,
            local_student_id TEXT,
            resident_district_cd TEXT,
            org_staff_id TEXT,
            drivers_license_number TEXT,
            organization TEXT,
            county_cd TEXT,
            state_cd TEXT,
            zip_code TEXT
        );

        CREATE TABLE IF NOT EXISTS organization_child (
            child_id INTEGER PRIMARY KEY REFERENCES child(child_id),
            sub_source_system TEXT,
            sector_type TEXT,
            ownership_type TEXT,
            degree_year_type TEXT,
            district_cd TEXT,
            sourcewide_id TEXT,
            ceeb_cd TEXT,
            address_line_1 TEXT,
            address_line_2 TEXT,
            city TEXT,
            county_cd TEXT,
            state_cd TEXT,
            zip_code TEXT
        );

        CREATE TABLE IF NOT EXISTS column_order (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            column_order INTEGER NOT NULL,
            column_name TEXT NOT NULL,
            column_type INTEGER NOT NULL,
            entity_kind TEXT NOT NULL
        );",
    )?;

    // ==========================================================================
    // History tables (stand-ins for the external history source)
    // ==========================================================================
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS k12_enrollment (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            token_id INTEGER NOT NULL,
            organization_year INTEGER NOT NULL,
            enrollment_begin TEXT NOT NULL,
            enrollment_end TEXT
        );

        CREATE TABLE IF NOT EXISTS wage_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            token_id INTEGER NOT NULL,
            organization_year INTEGER NOT NULL,
            term_code TEXT NOT NULL,
            wage_hours REAL NOT NULL,
            wage_amount REAL NOT NULL,
            organization_id TEXT,
            organization_name TEXT
        );",
    )?;

    // ==========================================================================
    // Classification tables (written by consumption, scoped by entity kind)
    // ==========================================================================
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS whitelist (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            identity_id INTEGER NOT NULL,
            entity_kind TEXT NOT NULL,
            job_id INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS blacklist (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            token_id_1 INTEGER NOT NULL,
            token_id_2 INTEGER NOT NULL,
            entity_kind TEXT NOT NULL,
            job_id INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS invalid_ssn (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            token_id INTEGER NOT NULL,
            ssn TEXT NOT NULL,
            entity_kind TEXT NOT NULL,
            job_id INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS unmerge (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            token_id INTEGER NOT NULL,
            group_label TEXT NOT NULL,
            entity_kind TEXT NOT NULL,
            job_id INTEGER NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS job_ids (
            job_id INTEGER PRIMARY KEY AUTOINCREMENT,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        );",
    )?;

    // ==========================================================================
    // Events Table (audit trail)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            data TEXT NOT NULL,
            actor TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    // ==========================================================================
    // Indexes
    // ==========================================================================
    conn.execute_batch(
        "CREATE INDEX IF NOT EXISTS idx_unmerge_in_kind ON unmerge_in(entity_kind);
        CREATE INDEX IF NOT EXISTS idx_token_identity ON token(identity_id);
        CREATE INDEX IF NOT EXISTS idx_child_token ON child(token_id);
        CREATE INDEX IF NOT EXISTS idx_k12_token ON k12_enrollment(token_id);
        CREATE INDEX IF NOT EXISTS idx_wage_token ON wage_history(token_id);
        CREATE INDEX IF NOT EXISTS idx_blacklist_tokens ON blacklist(token_id_1, token_id_2);
        CREATE INDEX IF NOT EXISTS idx_events_entity ON events(entity_type, entity_id);
        CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp);",
    )?;

    Ok(())
}

// ============================================================================
// JOB IDS
// ============================================================================

/// Issue a fresh job id for one run.
pub fn next_job_id(conn: &Connection) -> Result<i64> {
    conn.execute("INSERT INTO job_ids DEFAULT VALUES", [])?;
    Ok(conn.last_insert_rowid())
}

// ============================================================================
// REGISTRY LOADERS
// ============================================================================

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn conversion_error(idx: usize, e: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

/// Distinct identities flagged for review, ascending.
pub fn get_identity_ids_from_unmerge_in(conn: &Connection, kind: EntityKind) -> Result<Vec<i64>> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT identity_id FROM unmerge_in
         WHERE entity_kind = ?1
         ORDER BY identity_id",
    )?;

    let ids = stmt
        .query_map(params![kind.as_str()], |row| row.get(0))?
        .collect::<std::result::Result<Vec<i64>, _>>()?;

    debug!(kind = %kind, identities = ids.len(), "loaded identities under review");
    Ok(ids)
}

/// (token id, identity id) pairs for the given identities, ordered by token.
pub fn get_tokens_by_identity_ids(
    conn: &Connection,
    kind: EntityKind,
    identity_ids: &[i64],
) -> Result<Vec<(i64, i64)>> {
    let mut pairs = Vec::new();

    for chunk in identity_ids.chunks(IN_CHUNK) {
        let sql = format!(
            "SELECT token_id, identity_id FROM token
             WHERE entity_kind = ? AND identity_id IN ({})
             ORDER BY token_id",
            placeholders(chunk.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let bound = std::iter::once(rusqlite::types::Value::from(kind.as_str().to_string()))
            .chain(chunk.iter().map(|id| rusqlite::types::Value::from(*id)));

        let rows = stmt
            .query_map(params_from_iter(bound), |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<(i64, i64)>, _>>()?;
        pairs.extend(rows);
    }

    pairs.sort_unstable();
    Ok(pairs)
}

const CHILD_COLUMNS: &str = "c.child_id, c.token_id, c.pkey, c.child_hash, c.source_system,
     c.full_name, c.user_comment, c.created_at, c.job_id";

const PERSON_COLUMNS: &str = "p.first_name, p.middle_name, p.last_name, p.suffix, p.nickname,
     p.gender, p.birth_date, p.invalid_dob, p.collapsed_dob, p.ssn, p.invalid_ssn,
     p.last4_ssn, p.org_student_id, p.sourcewide_id, p.local_student_id,
     p.resident_district_cd, p.org_staff_id, p.drivers_license_number, p.organization,
     p.county_cd, p.state_cd, p.zip_code";

const ORGANIZATION_COLUMNS: &str = "o.sub_source_system, o.sector_type, o.ownership_type,
     o.degree_year_type, o.district_cd, o.sourcewide_id, o.ceeb_cd, o.address_line_1,
     o.address_line_2, o.city, o.county_cd, o.state_cd, o.zip_code";

fn child_from_row(row: &Row, details: ChildDetails) -> rusqlite::Result<ChildRecord> {
    Ok(ChildRecord {
        child_id: row.get("child_id")?,
        token_id: row.get("token_id")?,
        pkey: row.get("pkey")?,
        child_hash: row.get("child_hash")?,
        source_system: row.get("source_system")?,
        full_name: row.get("full_name")?,
        user_comment: row.get("user_comment")?,
        created_at: row.get("created_at")?,
        job_id: row.get("job_id")?,
        details,
    })
}

fn person_from_row(row: &Row) -> rusqlite::Result<PersonDetails> {
    Ok(PersonDetails {
        first_name: row.get("first_name")?,
        middle_name: row.get("middle_name")?,
        last_name: row.get("last_name")?,
        suffix: row.get("suffix")?,
        nickname: row.get("nickname")?,
        gender: row.get("gender")?,
        birth_date: row.get("birth_date")?,
        invalid_dob: row.get("invalid_dob")?,
        collapsed_dob: row.get("collapsed_dob")?,
        ssn: row.get("ssn")?,
        invalid_ssn: row.get("invalid_ssn")?,
        last4_ssn: row.get("last4_ssn")?,
        org_student_id: row.get("org_student_id")?,
        sourcewide_id: row.get("sourcewide_id")?,
        local_student_id: row.get("local_student_id")?,
        resident_district_cd: row.get("resident_district_cd")?,
        org_staff_id: row.get("org_staff_id")?,
        drivers_license_number: row.get("drivers_license_number")?,
        organization: row.get("organization")?,
        county_cd: row.get("county_cd")?,
        state_cd: row.get("state_cd")?,
        zip_code: row.get("zip_code")?,
    })
}

fn organization_from_row(row: &Row) -> rusqlite::Result<OrganizationDetails> {
    Ok(OrganizationDetails {
        sub_source_system: row.get("sub_source_system")?,
        sector_type: row.get("sector_type")?,
        ownership_type: row.get("ownership_type")?,
        degree_year_type: row.get("degree_year_type")?,
        district_cd: row.get("district_cd")?,
        sourcewide_id: row.get("sourcewide_id")?,
        ceeb_cd: row.get("ceeb_cd")?,
        address_line_1: row.get("address_line_1")?,
        address_line_2: row.get("address_line_2")?,
        city: row.get("city")?,
        county_cd: row.get("county_cd")?,
        state_cd: row.get("state_cd")?,
        zip_code: row.get("zip_code")?,
    })
}

/// Child records of one kind for the given tokens, ordered by child id.
pub fn load_children_by_token_ids(
    conn: &Connection,
    kind: EntityKind,
    token_ids: &[i64],
) -> Result<Vec<ChildRecord>> {
    let mut children = Vec::new();

    for chunk in token_ids.chunks(IN_CHUNK) {
        let sql = match kind {
            EntityKind::Person => format!(
                "SELECT {CHILD_COLUMNS}, {PERSON_COLUMNS}
                 FROM child c JOIN person_child p ON p.child_id = c.child_id
                 WHERE c.token_id IN ({})",
                placeholders(chunk.len())
            ),
            EntityKind::Organization => format!(
                "SELECT {CHILD_COLUMNS}, {ORGANIZATION_COLUMNS}
                 FROM child c JOIN organization_child o ON o.child_id = c.child_id
                 WHERE c.token_id IN ({})",
                placeholders(chunk.len())
            ),
        };

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(chunk.iter()), |row| {
                let details = match kind {
                    EntityKind::Person => ChildDetails::Person(person_from_row(row)?),
                    EntityKind::Organization => {
                        ChildDetails::Organization(organization_from_row(row)?)
                    }
                };
                child_from_row(row, details)
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        children.extend(rows);
    }

    children.sort_by_key(|child| child.child_id);
    debug!(kind = %kind, tokens = token_ids.len(), children = children.len(), "loaded child records");
    Ok(children)
}

/// Column layout for a kind, in configured order.
pub fn load_column_order(conn: &Connection, kind: EntityKind) -> Result<Vec<ColumnSpec>> {
    let mut stmt = conn.prepare(
        "SELECT column_order, column_name, column_type FROM column_order
         WHERE entity_kind = ?1
         ORDER BY column_order, id",
    )?;

    let raw = stmt
        .query_map(params![kind.as_str()], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?, row.get::<_, i64>(2)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    raw.into_iter()
        .map(|(order, name, code)| {
            Ok(ColumnSpec {
                order,
                name,
                kind: ColumnKind::try_from(code)?,
                entity_kind: kind,
            })
        })
        .collect()
}

// ============================================================================
// HISTORY LOADERS
// ============================================================================

fn parse_date(idx: usize, text: &str) -> rusqlite::Result<NaiveDate> {
    NaiveDate::parse_from_str(text.trim(), "%Y-%m-%d").map_err(|e| conversion_error(idx, e))
}

pub fn get_enrollment_history(conn: &Connection, token_ids: &[i64]) -> Result<Vec<EnrollmentPeriod>> {
    let mut periods = Vec::new();

    for chunk in token_ids.chunks(IN_CHUNK) {
        let sql = format!(
            "SELECT token_id, organization_year, enrollment_begin, enrollment_end
             FROM k12_enrollment WHERE token_id IN ({})
             ORDER BY id",
            placeholders(chunk.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(chunk.iter()), |row| {
                let begin: String = row.get(2)?;
                let end: Option<String> = row.get(3)?;
                Ok(EnrollmentPeriod {
                    token_id: row.get(0)?,
                    organization_year: row.get(1)?,
                    begin_date: parse_date(2, &begin)?,
                    end_date: end.as_deref().map(|e| parse_date(3, e)).transpose()?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        periods.extend(rows);
    }

    Ok(periods)
}

pub fn get_wage_history(conn: &Connection, token_ids: &[i64]) -> Result<Vec<WageRecord>> {
    let mut records = Vec::new();

    for chunk in token_ids.chunks(IN_CHUNK) {
        let sql = format!(
            "SELECT token_id, organization_year, term_code, wage_hours, wage_amount,
                    organization_id, organization_name
             FROM wage_history WHERE token_id IN ({})
             ORDER BY id",
            placeholders(chunk.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(chunk.iter()), |row| {
                Ok(WageRecord {
                    token_id: row.get(0)?,
                    organization_year: row.get(1)?,
                    term_code: row.get(2)?,
                    wage_hours: row.get(3)?,
                    wage_amount: row.get(4)?,
                    organization_id: row.get(5)?,
                    organization_name: row.get(6)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        records.extend(rows);
    }

    Ok(records)
}

// ============================================================================
// SEEDING
// ============================================================================

pub fn insert_unmerge_in(conn: &Connection, identity_id: i64, kind: EntityKind) -> Result<()> {
    conn.execute(
        "INSERT INTO unmerge_in (identity_id, entity_kind) VALUES (?1, ?2)",
        params![identity_id, kind.as_str()],
    )?;
    Ok(())
}

pub fn insert_token(conn: &Connection, token_id: i64, identity_id: i64, kind: EntityKind) -> Result<()> {
    conn.execute(
        "INSERT INTO token (token_id, identity_id, entity_kind) VALUES (?1, ?2, ?3)",
        params![token_id, identity_id, kind.as_str()],
    )?;
    Ok(())
}

pub fn insert_child(conn: &Connection, child: &ChildRecord) -> Result<()> {
    conn.execute(
        "INSERT INTO child (
            child_id, token_id, pkey, child_hash, source_system,
            full_name, user_comment, created_at, job_id, entity_type
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            child.child_id,
            child.token_id,
            child.pkey,
            child.child_hash,
            child.source_system,
            child.full_name,
            child.user_comment,
            child.created_at,
            child.job_id,
            child.kind().child_discriminator(),
        ],
    )?;

    match &child.details {
        ChildDetails::Person(p) => {
            conn.execute(
                "INSERT INTO person_child (
                    child_id, first_name, middle_name, last_name, suffix, nickname,
                    gender, birth_date, invalid_dob, collapsed_dob, ssn, invalid_ssn,
                    last4_ssn, org_student_id, sourcewide_id, local_student_id,
                    resident_district_cd, org_staff_id, drivers_license_number,
                    organization, county_cd, state_cd, zip_code
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                          ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23)",
                params![
                    child.child_id,
                    p.first_name,
                    p.middle_name,
                    p.last_name,
                    p.suffix,
                    p.nickname,
                    p.gender,
                    p.birth_date,
                    p.invalid_dob,
                    p.collapsed_dob,
                    p.ssn,
                    p.invalid_ssn,
                    p.last4_ssn,
                    p.org_student_id,
                    p.sourcewide_id,
                    p.local_student_id,
                    p.resident_district_cd,
                    p.org_staff_id,
                    p.drivers_license_number,
                    p.organization,
                    p.county_cd,
                    p.state_cd,
                    p.zip_code,
                ],
            )?;
        }
        ChildDetails::Organization(o) => {
            conn.execute(
                "INSERT INTO organization_child (
                    child_id, sub_source_system, sector_type, ownership_type,
                    degree_year_type, district_cd, sourcewide_id, ceeb_cd,
                    address_line_1, address_line_2, city, county_cd, state_cd, zip_code
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                params![
                    child.child_id,
                    o.sub_source_system,
                    o.sector_type,
                    o.ownership_type,
                    o.degree_year_type,
                    o.district_cd,
                    o.sourcewide_id,
                    o.ceeb_cd,
                    o.address_line_1,
                    o.address_line_2,
                    o.city,
                    o.county_cd,
                    o.state_cd,
                    o.zip_code,
                ],
            )?;
        }
    }

    Ok(())
}

pub fn insert_column_spec(conn: &Connection, spec: &ColumnSpec) -> Result<()> {
    conn.execute(
        "INSERT INTO column_order (column_order, column_name, column_type, entity_kind)
         VALUES (?1, ?2, ?3, ?4)",
        params![spec.order, spec.name, spec.kind.code(), spec.entity_kind.as_str()],
    )?;
    Ok(())
}

pub fn insert_enrollment_period(conn: &Connection, period: &EnrollmentPeriod) -> Result<()> {
    conn.execute(
        "INSERT INTO k12_enrollment (token_id, organization_year, enrollment_begin, enrollment_end)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            period.token_id,
            period.organization_year,
            period.begin_date.format("%Y-%m-%d").to_string(),
            period.end_date.map(|d| d.format("%Y-%m-%d").to_string()),
        ],
    )?;
    Ok(())
}

pub fn insert_wage_record(conn: &Connection, record: &WageRecord) -> Result<()> {
    conn.execute(
        "INSERT INTO wage_history (
            token_id, organization_year, term_code, wage_hours, wage_amount,
            organization_id, organization_name
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            record.token_id,
            record.organization_year,
            record.term_code,
            record.wage_hours,
            record.wage_amount,
            record.organization_id,
            record.organization_name,
        ],
    )?;
    Ok(())
}

// ============================================================================
// CLASSIFICATION WRITES
// ============================================================================

/// Remove every classification row of one kind.
pub fn delete_classifications(conn: &Connection, kind: EntityKind) -> Result<TruncateCounts> {
    let k = kind.as_str();
    Ok(TruncateCounts {
        whitelist: conn.execute("DELETE FROM whitelist WHERE entity_kind = ?1", params![k])?,
        blacklist: conn.execute("DELETE FROM blacklist WHERE entity_kind = ?1", params![k])?,
        invalid_ssn: conn.execute("DELETE FROM invalid_ssn WHERE entity_kind = ?1", params![k])?,
        unmerge: conn.execute("DELETE FROM unmerge WHERE entity_kind = ?1", params![k])?,
    })
}

pub fn insert_whitelist(conn: &Connection, kind: EntityKind, entry: &WhitelistEntry) -> Result<()> {
    conn.execute(
        "INSERT INTO whitelist (identity_id, entity_kind, job_id) VALUES (?1, ?2, ?3)",
        params![entry.identity_id, kind.as_str(), entry.job_id],
    )?;
    Ok(())
}

/// Delete blacklist pairs touching any of the tokens. Returns rows removed.
pub fn delete_blacklist_for_tokens(conn: &Connection, token_ids: &[i64]) -> Result<usize> {
    let mut removed = 0;
    for chunk in token_ids.chunks(IN_CHUNK) {
        let list = placeholders(chunk.len());
        let sql = format!(
            "DELETE FROM blacklist WHERE token_id_1 IN ({list}) OR token_id_2 IN ({list})"
        );
        let bound: Vec<i64> = chunk.iter().chain(chunk.iter()).copied().collect();
        removed += conn.execute(&sql, params_from_iter(bound))?;
    }
    Ok(removed)
}

pub fn insert_blacklist(conn: &Connection, kind: EntityKind, pair: &BlacklistPair) -> Result<()> {
    conn.execute(
        "INSERT INTO blacklist (token_id_1, token_id_2, entity_kind, job_id) VALUES (?1, ?2, ?3, ?4)",
        params![pair.token_id_1, pair.token_id_2, kind.as_str(), pair.job_id],
    )?;
    Ok(())
}

pub fn insert_invalid_ssn(conn: &Connection, kind: EntityKind, entry: &InvalidSsnEntry) -> Result<()> {
    conn.execute(
        "INSERT INTO invalid_ssn (token_id, ssn, entity_kind, job_id) VALUES (?1, ?2, ?3, ?4)",
        params![entry.token_id, entry.ssn, kind.as_str(), entry.job_id],
    )?;
    Ok(())
}

pub fn insert_unmerge(conn: &Connection, kind: EntityKind, entry: &UnmergeEntry) -> Result<()> {
    conn.execute(
        "INSERT INTO unmerge (token_id, group_label, entity_kind, job_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            entry.token_id,
            entry.group_label,
            kind.as_str(),
            entry.job_id,
            entry.created_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

// ============================================================================
// CLASSIFICATION READERS
// ============================================================================

pub fn get_whitelist(conn: &Connection, kind: EntityKind) -> Result<Vec<WhitelistEntry>> {
    let mut stmt = conn.prepare(
        "SELECT identity_id, job_id FROM whitelist WHERE entity_kind = ?1 ORDER BY identity_id",
    )?;
    let entries = stmt
        .query_map(params![kind.as_str()], |row| {
            Ok(WhitelistEntry {
                identity_id: row.get(0)?,
                job_id: row.get(1)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(entries)
}

pub fn get_blacklist(conn: &Connection, kind: EntityKind) -> Result<Vec<BlacklistPair>> {
    let mut stmt = conn.prepare(
        "SELECT token_id_1, token_id_2, job_id FROM blacklist
         WHERE entity_kind = ?1 ORDER BY token_id_1, token_id_2",
    )?;
    let pairs = stmt
        .query_map(params![kind.as_str()], |row| {
            Ok(BlacklistPair {
                token_id_1: row.get(0)?,
                token_id_2: row.get(1)?,
                job_id: row.get(2)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(pairs)
}

pub fn get_invalid_ssns(conn: &Connection, kind: EntityKind) -> Result<Vec<InvalidSsnEntry>> {
    let mut stmt = conn.prepare(
        "SELECT token_id, ssn, job_id FROM invalid_ssn WHERE entity_kind = ?1 ORDER BY token_id",
    )?;
    let entries = stmt
        .query_map(params![kind.as_str()], |row| {
            Ok(InvalidSsnEntry {
                token_id: row.get(0)?,
                ssn: row.get(1)?,
                job_id: row.get(2)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(entries)
}

pub fn get_unmerge_entries(conn: &Connection, kind: EntityKind) -> Result<Vec<UnmergeEntry>> {
    let mut stmt = conn.prepare(
        "SELECT token_id, group_label, job_id, created_at FROM unmerge
         WHERE entity_kind = ?1 ORDER BY token_id",
    )?;
    let entries = stmt
        .query_map(params![kind.as_str()], |row| {
            let created_at: String = row.get(3)?;
            Ok(UnmergeEntry {
                token_id: row.get(0)?,
                group_label: row.get(1)?,
                job_id: row.get(2)?,
                created_at: DateTime::parse_from_rfc3339(&created_at)
                    .map_err(|e| conversion_error(3, e))?
                    .with_timezone(&Utc),
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(entries)
}

// ============================================================================
// AUDIT TRAIL
// ============================================================================

/// Insert event into audit trail
pub fn insert_event(conn: &Connection, event: &Event) -> Result<()> {
    let data_json = serde_json::to_string(&event.data)?;

    conn.execute(
        "INSERT INTO events (
            event_id, timestamp, event_type, entity_type, entity_id, data, actor
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            event.event_id,
            event.timestamp.to_rfc3339(),
            event.event_type,
            event.entity_type,
            event.entity_id,
            data_json,
            event.actor,
        ],
    )?;

    Ok(())
}

/// Get events for a specific entity, newest first
pub fn get_events_for_entity(
    conn: &Connection,
    entity_type: &str,
    entity_id: &str,
) -> Result<Vec<Event>> {
    let mut stmt = conn.prepare(
        "SELECT event_id, timestamp, event_type, entity_type, entity_id, data, actor
         FROM events
         WHERE entity_type = ?1 AND entity_id = ?2
         ORDER BY timestamp DESC, id DESC",
    )?;

    let events = stmt
        .query_map(params![entity_type, entity_id], |row| {
            let timestamp_str: String = row.get(1)?;
            let data_json: String = row.get(5)?;

            Ok(Event {
                event_id: row.get(0)?,
                timestamp: DateTime::parse_from_rfc3339(&timestamp_str)
                    .map_err(|e| conversion_error(1, e))?
                    .with_timezone(&Utc),
                event_type: row.get(2)?,
                entity_type: row.get(3)?,
                entity_id: row.get(4)?,
                data: serde_json::from_str(&data_json).map_err(|e| conversion_error(5, e))?,
                actor: row.get(6)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(events)
}

// ============================================================================
// CHILD SOURCE
// ============================================================================

/// Child records of one kind, read straight from the registry tables.
pub struct DbChildSource<'a> {
    pub conn: &'a Connection,
    pub kind: EntityKind,
}

impl ChildSource for DbChildSource<'_> {
    fn load_children(&self, token_ids: &[i64]) -> Result<Vec<ChildRecord>> {
        load_children_by_token_ids(self.conn, self.kind, token_ids)
    }
}

/// Token ids and the token → identity map for the given identities.
pub fn token_identity_map(pairs: &[(i64, i64)]) -> (Vec<i64>, HashMap<i64, i64>) {
    let token_ids = pairs.iter().map(|(token, _)| *token).collect();
    let map = pairs.iter().copied().collect();
    (token_ids, map)
}
