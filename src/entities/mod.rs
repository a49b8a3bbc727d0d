// Entity Models
//
// Identities own tokens, tokens own raw child records. This crate reads all
// three and writes only classification records.

pub mod kind;
pub mod child;
pub mod classification;

pub use kind::EntityKind;
pub use child::{ChildDetails, ChildRecord, OrganizationDetails, PersonDetails};
pub use classification::{
    BlacklistPair, ClassificationPlan, InvalidSsnEntry, UnmergeEntry, WhitelistEntry,
};
