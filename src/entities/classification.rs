// Classification records - durable output of a review consumption run
//
// Every record carries the job id of the run that produced it. A run replaces
// all of its kind's records, it never patches them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Identity confirmed not to need splitting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WhitelistEntry {
    pub identity_id: i64,
    pub job_id: i64,
}

/// Token pair that must never be merged. `token_id_1` is the primary token.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlacklistPair {
    pub token_id_1: i64,
    pub token_id_2: i64,
    pub job_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidSsnEntry {
    pub token_id: i64,

    /// Exactly nine digits
    pub ssn: String,
    pub job_id: i64,
}

/// Final accepted Token → Group assignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnmergeEntry {
    pub token_id: i64,
    pub group_label: String,
    pub job_id: i64,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// CLASSIFICATION PLAN
// ============================================================================

/// Everything one consumption run will write, computed before any write.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClassificationPlan {
    pub whitelist: Vec<WhitelistEntry>,

    /// Tokens of whitelisted identities; blacklist pairs touching them are purged
    pub whitelisted_tokens: BTreeSet<i64>,

    pub blacklist: Vec<BlacklistPair>,
    pub invalid_ssns: Vec<InvalidSsnEntry>,
    pub unmerge: Vec<UnmergeEntry>,

    /// Rows flagged invalid-SSN whose SSN could not be normalized
    pub skipped_ssn: usize,
}

impl ClassificationPlan {
    pub fn is_empty(&self) -> bool {
        self.whitelist.is_empty()
            && self.blacklist.is_empty()
            && self.invalid_ssns.is_empty()
            && self.unmerge.is_empty()
    }

    /// Number of distinct groups in the final assignment.
    pub fn group_count(&self) -> usize {
        self.unmerge
            .iter()
            .map(|entry| entry.group_label.as_str())
            .collect::<BTreeSet<_>>()
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_count() {
        let now = Utc::now();
        let entry = |token_id: i64, label: &str| UnmergeEntry {
            token_id,
            group_label: label.to_string(),
            job_id: 4,
            created_at: now,
        };

        let plan = ClassificationPlan {
            unmerge: vec![entry(1, "1"), entry(2, "1"), entry(3, "3")],
            ..ClassificationPlan::default()
        };

        assert_eq!(plan.group_count(), 2);
        assert!(!plan.is_empty());
        assert!(ClassificationPlan::default().is_empty());
    }
}
