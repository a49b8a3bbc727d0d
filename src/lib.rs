// Unmerge Review - Core Library
// Exposes all modules for use in the CLI and tests

pub mod error;
pub mod db;
pub mod config;
pub mod entities;       // Entity kinds, child records, classification records
pub mod fingerprint;    // Name canonicalization
pub mod grouping;       // Greedy subset clustering
pub mod bitmap;         // Presence bitmap display codec
pub mod enrollment;     // School-year enrollment bitmaps
pub mod wages;          // Wage presence and value matrices
pub mod columns;        // Configured column layout
pub mod worksheet;      // In-memory worksheet table + CSV I/O
pub mod builder;        // Worksheet assembly
pub mod ssn;            // SSN normalization
pub mod consume;        // Reviewed worksheet → classification records
pub mod orchestrator;   // End-to-end worksheet generation

// Re-export commonly used types
pub use error::{ErrorClass, Result, UnmergeError};
pub use db::{
    Event, TruncateCounts, DbChildSource,
    setup_database, next_job_id, insert_event, get_events_for_entity,
};
pub use config::{Config, load_config};
pub use entities::{
    EntityKind, ChildRecord, ChildDetails, PersonDetails, OrganizationDetails,
    WhitelistEntry, BlacklistPair, InvalidSsnEntry, UnmergeEntry, ClassificationPlan,
};
pub use fingerprint::canonicalize_name;
pub use grouping::{GroupIdAssigner, process_worksheet_group_ids};
pub use bitmap::BitmapCodec;
pub use enrollment::EnrollmentPeriod;
pub use wages::WageRecord;
pub use columns::{ColumnKind, ColumnSpec, RequiredSources, apply_column_order, required_sources};
pub use worksheet::{EnrichmentBlock, OptionalColumns, Worksheet};
pub use builder::{ChildSource, WorksheetBuilder};
pub use ssn::normalize_ssn;
pub use consume::{ProcessingSummary, WorksheetConsumer, plan_classifications};
pub use orchestrator::{WorksheetReport, generate_worksheet};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
