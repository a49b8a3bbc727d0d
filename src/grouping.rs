// 🧩 Group Assignment - greedy longest-first clustering of fingerprints
//
// Rounds repeat until every fingerprint is placed:
//   1. primary = longest unassigned fingerprint (ties → lowest lexical order)
//   2. allocate a GroupID (1, 3, 5, ... the even ids belong to another system)
//   3. tokens whose fingerprint equals the primary join the group
//   4. shorter fingerprints whose letters are a subset of the primary's join too
//
// The empty fingerprint is a subset of everything, so it always lands in the
// first group formed.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::debug;

/// Separator used when a token has several maximal-length fingerprints.
pub const TIE_DELIMITER: char = '|';

/// Step between consecutive GroupIDs.
pub const GROUP_ID_STEP: i64 = 2;

// ============================================================================
// CLUSTER
// ============================================================================

/// One round of the clustering loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cluster {
    pub group_id: i64,

    /// Fingerprint that opened the round
    pub primary: String,

    /// Every fingerprint absorbed in the round, primary first
    pub fingerprints: Vec<String>,

    /// Tokens assigned in the round, in input order per fingerprint
    pub token_ids: Vec<i64>,
}

// ============================================================================
// GROUP ID ASSIGNER
// ============================================================================

/// Owns the running GroupID counter so clustering stays a pure function of
/// its input and starting value.
#[derive(Debug, Clone)]
pub struct GroupIdAssigner {
    next_group_id: i64,
}

impl GroupIdAssigner {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(first_group_id: i64) -> Self {
        GroupIdAssigner {
            next_group_id: first_group_id,
        }
    }

    /// GroupID the next round will receive.
    pub fn next_group_id(&self) -> i64 {
        self.next_group_id
    }

    fn allocate(&mut self) -> i64 {
        let id = self.next_group_id;
        self.next_group_id += GROUP_ID_STEP;
        id
    }

    /// Run the clustering loop and return every round.
    pub fn cluster(&mut self, token_fingerprints: &[(i64, String)]) -> Vec<Cluster> {
        let mut tokens_by_fingerprint: BTreeMap<&str, Vec<i64>> = BTreeMap::new();
        for (token_id, fingerprint) in token_fingerprints {
            tokens_by_fingerprint
                .entry(fingerprint.as_str())
                .or_default()
                .push(*token_id);
        }

        let mut unassigned: BTreeSet<&str> = tokens_by_fingerprint.keys().copied().collect();
        let mut clusters = Vec::new();

        while let Some(primary) = pick_primary(unassigned.iter().copied()) {
            let group_id = self.allocate();
            let primary_len = primary.chars().count();
            let primary_letters: BTreeSet<char> = primary.chars().collect();

            unassigned.remove(primary);

            // Identical strings were already folded together by the map, so
            // only strictly shorter subsets remain to absorb.
            let absorbed: Vec<&str> = unassigned
                .iter()
                .copied()
                .filter(|candidate| {
                    candidate.chars().count() < primary_len
                        && candidate.chars().all(|c| primary_letters.contains(&c))
                })
                .collect();

            let mut fingerprints = vec![primary.to_string()];
            let mut token_ids = tokens_by_fingerprint[primary].clone();
            for fingerprint in absorbed {
                unassigned.remove(fingerprint);
                fingerprints.push(fingerprint.to_string());
                token_ids.extend(tokens_by_fingerprint[fingerprint].iter().copied());
            }

            debug!(
                group_id,
                primary,
                members = fingerprints.len(),
                "formed fingerprint group"
            );

            clusters.push(Cluster {
                group_id,
                primary: primary.to_string(),
                fingerprints,
                token_ids,
            });
        }

        clusters
    }

    /// Map every token in the input to its GroupID.
    ///
    /// A token listed under several fingerprints keeps the GroupID of the
    /// last round that touched it.
    pub fn assign_group_ids(&mut self, token_fingerprints: &[(i64, String)]) -> HashMap<i64, i64> {
        let mut result = HashMap::new();
        for cluster in self.cluster(token_fingerprints) {
            for token_id in cluster.token_ids {
                result.insert(token_id, cluster.group_id);
            }
        }
        result
    }
}

impl Default for GroupIdAssigner {
    fn default() -> Self {
        Self::new()
    }
}

/// Longest first, ties broken by ascending lexical order.
fn pick_primary<'a>(candidates: impl Iterator<Item = &'a str>) -> Option<&'a str> {
    candidates.min_by(|a, b| {
        b.chars()
            .count()
            .cmp(&a.chars().count())
            .then_with(|| a.cmp(b))
    })
}

/// Best single fingerprint among a set of possibly tie-joined values.
///
/// Each `|`-joined value is split into its variants first.
pub fn best_fingerprint<'a>(values: impl IntoIterator<Item = &'a str>) -> String {
    pick_primary(
        values
            .into_iter()
            .flat_map(|value| value.split(TIE_DELIMITER)),
    )
    .unwrap_or_default()
    .to_string()
}

/// Split tie-joined fingerprints into (token, fingerprint) pairs and cluster
/// them with a fresh assigner.
pub fn process_worksheet_group_ids(token_fingerprints: &[(i64, String)]) -> HashMap<i64, i64> {
    let mut assigner = GroupIdAssigner::new();
    assign_split_fingerprints(&mut assigner, token_fingerprints)
}

/// Same as [`process_worksheet_group_ids`] with a caller-owned counter.
pub fn assign_split_fingerprints(
    assigner: &mut GroupIdAssigner,
    token_fingerprints: &[(i64, String)],
) -> HashMap<i64, i64> {
    let pairs: Vec<(i64, String)> = token_fingerprints
        .iter()
        .flat_map(|(token_id, joined)| {
            joined
                .split(TIE_DELIMITER)
                .map(move |fingerprint| (*token_id, fingerprint.to_string()))
        })
        .collect();

    debug!(
        tokens = token_fingerprints.len(),
        pairs = pairs.len(),
        "assigning group ids"
    );
    assigner.assign_group_ids(&pairs)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn pairs(input: &[(i64, &str)]) -> Vec<(i64, String)> {
        input.iter().map(|(t, s)| (*t, s.to_string())).collect()
    }

    #[test]
    fn test_subset_and_disjoint_groups() {
        let input = pairs(&[(1, "ABC"), (2, "ABC"), (3, "AB"), (4, "XYZ")]);
        let groups = GroupIdAssigner::new().assign_group_ids(&input);

        assert_eq!(groups[&1], 1);
        assert_eq!(groups[&2], 1);
        assert_eq!(groups[&3], 1);
        assert_eq!(groups[&4], 3);
    }

    #[test]
    fn test_group_ids_step_by_two() {
        let input = pairs(&[(1, "ABCD"), (2, "XYZ"), (3, "QR")]);
        let mut assigner = GroupIdAssigner::new();
        let groups = assigner.assign_group_ids(&input);

        assert_eq!(groups[&1], 1);
        assert_eq!(groups[&2], 3);
        assert_eq!(groups[&3], 5);
        assert_eq!(assigner.next_group_id(), 7);
    }

    #[test]
    fn test_counter_threads_through_calls() {
        let mut assigner = GroupIdAssigner::starting_at(11);
        let first = assigner.assign_group_ids(&pairs(&[(1, "AB")]));
        let second = assigner.assign_group_ids(&pairs(&[(2, "CD")]));

        assert_eq!(first[&1], 11);
        assert_eq!(second[&2], 13);
    }

    #[test]
    fn test_tie_broken_lexically() {
        let clusters = GroupIdAssigner::new().cluster(&pairs(&[(1, "XYZ"), (2, "ABC")]));
        assert_eq!(clusters[0].primary, "ABC");
        assert_eq!(clusters[1].primary, "XYZ");
    }

    #[test]
    fn test_same_length_non_identical_stay_apart() {
        let groups = GroupIdAssigner::new().assign_group_ids(&pairs(&[(1, "ABC"), (2, "ABD")]));
        assert_ne!(groups[&1], groups[&2]);
    }

    #[test]
    fn test_empty_fingerprint_joins_first_group() {
        let input = pairs(&[(1, "XY"), (2, "ABCDE"), (3, "")]);
        let groups = GroupIdAssigner::new().assign_group_ids(&input);

        assert_eq!(groups[&2], 1);
        assert_eq!(groups[&3], 1);
        assert_eq!(groups[&1], 3);
    }

    #[test]
    fn test_non_canonical_input_compared_as_sets() {
        // "AAB" has letters {A, B}, a subset of "ABC"
        let groups = GroupIdAssigner::new().assign_group_ids(&pairs(&[(1, "ABCD"), (2, "AAB")]));
        assert_eq!(groups[&1], groups[&2]);
    }

    #[test]
    fn test_tied_token_keeps_last_round() {
        let input = pairs(&[(1, "ABC|ABD"), (2, "ABC"), (3, "ABD")]);
        let groups = process_worksheet_group_ids(&input);

        // ABC opens group 1, ABD opens group 3, token 1 sits in both rounds
        assert_eq!(groups[&2], 1);
        assert_eq!(groups[&3], 3);
        assert_eq!(groups[&1], 3);
        assert_eq!(groups.len(), 3);
    }

    #[test]
    fn test_best_fingerprint_splits_ties() {
        assert_eq!(best_fingerprint(["AB", "XYZ|ABC", "ZZ"]), "ABC");
        assert_eq!(best_fingerprint(Vec::<&str>::new()), "");
        assert_eq!(best_fingerprint([""]), "");
    }

    proptest! {
        #[test]
        fn prop_partition_and_subset_rule(
            raw in proptest::collection::vec("[A-F]{0,5}", 1..20)
        ) {
            let input: Vec<(i64, String)> = raw
                .iter()
                .enumerate()
                .map(|(i, name)| (i as i64, crate::fingerprint::canonicalize_name(name)))
                .collect();

            let clusters = GroupIdAssigner::new().cluster(&input);

            // every token appears in exactly one cluster
            let mut seen = std::collections::HashSet::new();
            for cluster in &clusters {
                for token in &cluster.token_ids {
                    prop_assert!(seen.insert(*token));
                }
            }
            prop_assert_eq!(seen.len(), input.len());

            for cluster in &clusters {
                let primary: BTreeSet<char> = cluster.primary.chars().collect();
                for member in &cluster.fingerprints {
                    let identical = member == &cluster.primary;
                    let shorter_subset = member.len() < cluster.primary.len()
                        && member.chars().all(|c| primary.contains(&c));
                    prop_assert!(identical || shorter_subset);
                }
            }
        }
    }
}
