// Entity kinds - person vs organization registries share one shape
//
// The kind is a discriminator resolved once, when a run starts. Every table
// row this crate reads or writes carries it.

use crate::error::UnmergeError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Person,
    Organization,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Person => "person",
            EntityKind::Organization => "organization",
        }
    }

    /// Discriminator written into the worksheet's EntityType column.
    pub fn child_discriminator(&self) -> &'static str {
        match self {
            EntityKind::Person => "person_child",
            EntityKind::Organization => "organization_child",
        }
    }

    /// Only person registries are enriched with enrollment and wage history.
    pub fn has_history(&self) -> bool {
        matches!(self, EntityKind::Person)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = UnmergeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "person" => Ok(EntityKind::Person),
            "organization" | "org" => Ok(EntityKind::Organization),
            _ => Err(UnmergeError::UnsupportedEntityKind(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_kinds() {
        assert_eq!("person".parse::<EntityKind>().unwrap(), EntityKind::Person);
        assert_eq!("Organization".parse::<EntityKind>().unwrap(), EntityKind::Organization);
        assert_eq!("org".parse::<EntityKind>().unwrap(), EntityKind::Organization);

        let err = "vendor".parse::<EntityKind>().unwrap_err();
        assert!(err.is_validation());
    }
}
