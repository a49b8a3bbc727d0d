// 👤 Child Records - one source system's view of a token
//
// Shared fields live on ChildRecord, kind-specific fields on ChildDetails.
// The worksheet projection is a static field list per kind; the source key
// and child hash never reach the worksheet.

use crate::entities::EntityKind;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// CHILD RECORD
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildRecord {
    pub child_id: i64,
    pub token_id: i64,

    /// Source-system primary key (internal, not shown to reviewers)
    pub pkey: String,

    /// Change-detection hash (internal, not shown to reviewers)
    pub child_hash: String,

    pub source_system: String,
    pub full_name: Option<String>,
    pub user_comment: Option<String>,
    pub created_at: Option<String>,
    pub job_id: Option<i64>,

    pub details: ChildDetails,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ChildDetails {
    Person(PersonDetails),
    Organization(OrganizationDetails),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersonDetails {
    pub first_name: Option<String>,
    pub middle_name: Option<String>,
    pub last_name: Option<String>,
    pub suffix: Option<String>,
    pub nickname: Option<String>,
    pub gender: Option<String>,
    pub birth_date: Option<String>,
    pub invalid_dob: Option<i64>,
    pub collapsed_dob: Option<f64>,
    pub ssn: Option<String>,
    pub invalid_ssn: Option<i64>,
    pub last4_ssn: Option<String>,
    pub org_student_id: Option<String>,
    pub sourcewide_id: Option<String>,
    pub local_student_id: Option<String>,
    pub resident_district_cd: Option<String>,
    pub org_staff_id: Option<String>,
    pub drivers_license_number: Option<String>,
    pub organization: Option<String>,
    pub county_cd: Option<String>,
    pub state_cd: Option<String>,
    pub zip_code: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrganizationDetails {
    pub sub_source_system: Option<String>,
    pub sector_type: Option<String>,
    pub ownership_type: Option<String>,
    pub degree_year_type: Option<String>,
    pub district_cd: Option<String>,
    pub sourcewide_id: Option<String>,
    pub ceeb_cd: Option<String>,
    pub address_line_1: Option<String>,
    pub address_line_2: Option<String>,
    pub city: Option<String>,
    pub county_cd: Option<String>,
    pub state_cd: Option<String>,
    pub zip_code: Option<String>,
}

impl ChildRecord {
    pub fn kind(&self) -> EntityKind {
        match self.details {
            ChildDetails::Person(_) => EntityKind::Person,
            ChildDetails::Organization(_) => EntityKind::Organization,
        }
    }

    /// Name used for fingerprinting: the full name, or "First Last" when the
    /// full name is absent or blank.
    pub fn display_name(&self) -> String {
        if let Some(full) = self.full_name.as_deref().filter(|s| !s.is_empty()) {
            return full.to_string();
        }

        match &self.details {
            ChildDetails::Person(p) => format!(
                "{} {}",
                p.first_name.as_deref().unwrap_or(""),
                p.last_name.as_deref().unwrap_or("")
            )
            .trim()
            .to_string(),
            ChildDetails::Organization(_) => String::new(),
        }
    }

    /// Worksheet columns for this record, in display order.
    pub fn worksheet_fields(&self) -> Vec<(&'static str, Value)> {
        let mut fields = vec![
            ("ChildID", Value::from(self.child_id)),
            ("TokenID", Value::from(self.token_id)),
            ("SourceSystem", Value::from(self.source_system.clone())),
            ("FullName", text(&self.full_name)),
            ("UserComment", text(&self.user_comment)),
            ("CreateDT", text(&self.created_at)),
            ("JobID", int(self.job_id)),
            ("EntityType", Value::from(self.kind().child_discriminator())),
        ];

        match &self.details {
            ChildDetails::Person(p) => fields.extend([
                ("FirstName", text(&p.first_name)),
                ("MiddleName", text(&p.middle_name)),
                ("LastName", text(&p.last_name)),
                ("Suffix", text(&p.suffix)),
                ("Nickname", text(&p.nickname)),
                ("Gender", text(&p.gender)),
                ("BirthDate", text(&p.birth_date)),
                ("InvalidDob", int(p.invalid_dob)),
                ("CollapsedDob", float(p.collapsed_dob)),
                ("SSN", text(&p.ssn)),
                ("InvalidSSN", int(p.invalid_ssn)),
                ("Last4Ssn", text(&p.last4_ssn)),
                ("OrgStudentID", text(&p.org_student_id)),
                ("SourcewideID", text(&p.sourcewide_id)),
                ("LocalStudentID", text(&p.local_student_id)),
                ("ResidentDistrictCD", text(&p.resident_district_cd)),
                ("OrgStaffID", text(&p.org_staff_id)),
                ("DriversLicenseNumber", text(&p.drivers_license_number)),
                ("Organization", text(&p.organization)),
                ("CountyCD", text(&p.county_cd)),
                ("StateCD", text(&p.state_cd)),
                ("ZipCode", text(&p.zip_code)),
            ]),
            ChildDetails::Organization(o) => fields.extend([
                ("SubSourceSystem", text(&o.sub_source_system)),
                ("SectorType", text(&o.sector_type)),
                ("OwnershipType", text(&o.ownership_type)),
                ("DegreeYearType", text(&o.degree_year_type)),
                ("DistrictCD", text(&o.district_cd)),
                ("SourcewideID", text(&o.sourcewide_id)),
                ("CEEB_CD", text(&o.ceeb_cd)),
                ("AddressLine_1", text(&o.address_line_1)),
                ("AddressLine_2", text(&o.address_line_2)),
                ("City", text(&o.city)),
                ("CountyCD", text(&o.county_cd)),
                ("StateCD", text(&o.state_cd)),
                ("ZipCode", text(&o.zip_code)),
            ]),
        }

        fields
    }
}

fn text(value: &Option<String>) -> Value {
    value.clone().map(Value::String).unwrap_or(Value::Null)
}

fn int(value: Option<i64>) -> Value {
    value.map(Value::from).unwrap_or(Value::Null)
}

fn float(value: Option<f64>) -> Value {
    value
        .and_then(serde_json::Number::from_f64)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}
