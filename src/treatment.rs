// Treatment assignment - condition picks for randomize and matchmaking
//
// Three strategies over a candidate list, scoped by a caller-chosen balance
// key (`configId:stateKey` for randomize, `configId:poolId` for matchmaking).
// Counter state is process-local and intentionally non-persistent: a restart
// resets balance.

use rand::seq::SliceRandom;
use rand::Rng;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

/// Candidate list used when a config doesn't name its own conditions.
pub const DEFAULT_CONDITIONS: [&str; 2] = ["control", "treatment"];

/// How to pick a condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStrategy {
    /// Uniform pick.
    #[default]
    Random,
    /// Uniform pick among the least-assigned candidates.
    BalancedRandom,
    /// Round-robin through the candidate list.
    Block,
}

/// Process-wide assignment state, keyed by balance key. Poisoned locks are
/// recovered; the counter maps stay usable after a panicked writer.
#[derive(Default)]
pub struct TreatmentAssigner {
    /// balanceKey -> condition -> assignments so far (balanced_random).
    counts: Mutex<HashMap<String, HashMap<String, u64>>>,
    /// balanceKey -> next position (block).
    cursors: Mutex<HashMap<String, usize>>,
}

impl TreatmentAssigner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pick a condition. An empty candidate list falls back to the defaults.
    pub fn assign(
        &self,
        strategy: AssignmentStrategy,
        balance_key: &str,
        candidates: &[String],
    ) -> String {
        let defaults: Vec<String> = DEFAULT_CONDITIONS.iter().map(|s| s.to_string()).collect();
        let candidates = if candidates.is_empty() {
            &defaults
        } else {
            candidates
        };

        match strategy {
            AssignmentStrategy::Random => {
                let mut rng = rand::thread_rng();
                candidates
                    .choose(&mut rng)
                    .expect("candidate list is non-empty")
                    .clone()
            }
            AssignmentStrategy::BalancedRandom => self.assign_balanced(balance_key, candidates),
            AssignmentStrategy::Block => self.assign_block(balance_key, candidates),
        }
    }

    fn assign_balanced(&self, balance_key: &str, candidates: &[String]) -> String {
        let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        let key_counts = counts.entry(balance_key.to_string()).or_default();

        let min = candidates
            .iter()
            .map(|c| key_counts.get(c).copied().unwrap_or(0))
            .min()
            .expect("candidate list is non-empty");
        let least_assigned: Vec<&String> = candidates
            .iter()
            .filter(|c| key_counts.get(*c).copied().unwrap_or(0) == min)
            .collect();

        let pick = {
            let mut rng = rand::thread_rng();
            least_assigned[rng.gen_range(0..least_assigned.len())].clone()
        };
        *key_counts.entry(pick.clone()).or_insert(0) += 1;
        pick
    }

    fn assign_block(&self, balance_key: &str, candidates: &[String]) -> String {
        let mut cursors = self.cursors.lock().unwrap_or_else(PoisonError::into_inner);
        let position = cursors.entry(balance_key.to_string()).or_insert(0);
        let pick = candidates[*position % candidates.len()].clone();
        *position += 1;
        pick
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conditions(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn random_picks_a_candidate() {
        let assigner = TreatmentAssigner::new();
        let candidates = conditions(&["a", "b", "c"]);
        for _ in 0..50 {
            let pick = assigner.assign(AssignmentStrategy::Random, "k", &candidates);
            assert!(candidates.contains(&pick));
        }
    }

    #[test]
    fn empty_candidates_fall_back_to_defaults() {
        let assigner = TreatmentAssigner::new();
        let pick = assigner.assign(AssignmentStrategy::Random, "k", &[]);
        assert!(DEFAULT_CONDITIONS.contains(&pick.as_str()));
    }

    #[test]
    fn balanced_random_never_skews_by_more_than_one() {
        let assigner = TreatmentAssigner::new();
        let candidates = conditions(&["a", "b", "c"]);
        let mut tallies: HashMap<String, u64> = HashMap::new();

        for _ in 0..100 {
            let pick = assigner.assign(AssignmentStrategy::BalancedRandom, "k", &candidates);
            *tallies.entry(pick).or_insert(0) += 1;

            let max = candidates
                .iter()
                .map(|c| tallies.get(c).copied().unwrap_or(0))
                .max()
                .unwrap();
            let min = candidates
                .iter()
                .map(|c| tallies.get(c).copied().unwrap_or(0))
                .min()
                .unwrap();
            assert!(max - min <= 1, "skew after assignment: max={max} min={min}");
        }
    }

    #[test]
    fn balance_keys_are_independent() {
        let assigner = TreatmentAssigner::new();
        let candidates = conditions(&["a", "b"]);
        // Drain "a" on one key; the other key must still start balanced.
        for _ in 0..4 {
            assigner.assign(AssignmentStrategy::BalancedRandom, "k1", &candidates);
        }
        let first = assigner.assign(AssignmentStrategy::BalancedRandom, "k2", &candidates);
        let second = assigner.assign(AssignmentStrategy::BalancedRandom, "k2", &candidates);
        assert_ne!(first, second);
    }

    #[test]
    fn block_cycles_in_candidate_order() {
        let assigner = TreatmentAssigner::new();
        let candidates = conditions(&["a", "b", "c"]);
        let picks: Vec<String> = (0..7)
            .map(|_| assigner.assign(AssignmentStrategy::Block, "k", &candidates))
            .collect();
        assert_eq!(picks, conditions(&["a", "b", "c", "a", "b", "c", "a"]));
    }

    #[test]
    fn strategy_parses_from_wire_names() {
        let parsed: AssignmentStrategy = serde_json::from_str("\"balanced_random\"").unwrap();
        assert_eq!(parsed, AssignmentStrategy::BalancedRandom);
        let parsed: AssignmentStrategy = serde_json::from_str("\"block\"").unwrap();
        assert_eq!(parsed, AssignmentStrategy::Block);
    }
}
