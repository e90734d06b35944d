//! Member selection policies for provider groups
//!
//! All strategies operate on the healthy candidate set computed by the
//! group; the balancer itself is stateless except for rotation cursors and
//! smooth-WRR current weights.

use crate::config::Strategy;
use hangar_foundation::ProviderId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// A selectable member with its routing attributes.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub id: ProviderId,
    pub weight: u32,
    pub priority: u32,
    pub in_flight: usize,
}

/// Pluggable member selector.
#[derive(Debug)]
pub struct LoadBalancer {
    strategy: Strategy,

    /// Rotation cursor for round_robin and priority tie-breaking
    cursor: AtomicUsize,

    /// Smooth weighted round-robin current weights
    wrr_current: Mutex<HashMap<ProviderId, i64>>,
}

impl LoadBalancer {
    pub fn new(strategy: Strategy) -> Self {
        Self {
            strategy,
            cursor: AtomicUsize::new(0),
            wrr_current: Mutex::new(HashMap::new()),
        }
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Select one candidate, or None when the set is empty.
    pub fn select(&self, candidates: &[Candidate]) -> Option<ProviderId> {
        if candidates.is_empty() {
            return None;
        }
        if candidates.len() == 1 {
            return Some(candidates[0].id.clone());
        }

        let picked = match self.strategy {
            Strategy::RoundRobin => self.pick_round_robin(candidates),
            Strategy::WeightedRoundRobin => self.pick_smooth_wrr(candidates),
            Strategy::Random => self.pick_random(candidates),
            Strategy::Priority => self.pick_priority(candidates),
            Strategy::LeastConnections => self.pick_least_connections(candidates),
        };
        Some(picked)
    }

    fn pick_round_robin(&self, candidates: &[Candidate]) -> ProviderId {
        let index = self.cursor.fetch_add(1, Ordering::SeqCst) % candidates.len();
        candidates[index].id.clone()
    }

    /// Classic smooth weighted round-robin (nginx-style): deterministic
    /// rotation that interleaves members proportionally to their weights.
    fn pick_smooth_wrr(&self, candidates: &[Candidate]) -> ProviderId {
        let mut current = self.wrr_current.lock().expect("wrr state poisoned");

        let total_weight: i64 = candidates.iter().map(|c| c.weight as i64).sum();

        let mut best: Option<(&Candidate, i64)> = None;
        for candidate in candidates {
            let entry = current.entry(candidate.id.clone()).or_insert(0);
            *entry += candidate.weight as i64;
            let value = *entry;
            match best {
                Some((_, best_value)) if best_value >= value => {}
                _ => best = Some((candidate, value)),
            }
        }

        let (winner, _) = best.expect("non-empty candidate set");
        *current.get_mut(&winner.id).expect("winner entry") -= total_weight;
        winner.id.clone()
    }

    fn pick_random(&self, candidates: &[Candidate]) -> ProviderId {
        let index = (crate::retry::rand_jitter() * candidates.len() as f64) as usize
            % candidates.len();
        candidates[index].id.clone()
    }

    /// Lowest priority number wins; ties broken by round-robin.
    fn pick_priority(&self, candidates: &[Candidate]) -> ProviderId {
        let best_priority = candidates
            .iter()
            .map(|c| c.priority)
            .min()
            .expect("non-empty candidate set");

        let ties: Vec<&Candidate> = candidates
            .iter()
            .filter(|c| c.priority == best_priority)
            .collect();

        let index = self.cursor.fetch_add(1, Ordering::SeqCst) % ties.len();
        ties[index].id.clone()
    }

    /// Smallest in-flight count wins; ties broken by declaration order.
    fn pick_least_connections(&self, candidates: &[Candidate]) -> ProviderId {
        candidates
            .iter()
            .min_by_key(|c| c.in_flight)
            .expect("non-empty candidate set")
            .id
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: &str, weight: u32, priority: u32, in_flight: usize) -> Candidate {
        Candidate {
            id: ProviderId::new(id).unwrap(),
            weight,
            priority,
            in_flight,
        }
    }

    fn ids(candidates: &[Candidate], lb: &LoadBalancer, n: usize) -> Vec<String> {
        (0..n)
            .map(|_| lb.select(candidates).unwrap().to_string())
            .collect()
    }

    #[test]
    fn test_empty_set() {
        let lb = LoadBalancer::new(Strategy::RoundRobin);
        assert!(lb.select(&[]).is_none());
    }

    #[test]
    fn test_round_robin_rotates() {
        let lb = LoadBalancer::new(Strategy::RoundRobin);
        let candidates = vec![
            candidate("a", 1, 0, 0),
            candidate("b", 1, 0, 0),
            candidate("c", 1, 0, 0),
        ];

        assert_eq!(ids(&candidates, &lb, 6), vec!["a", "b", "c", "a", "b", "c"]);
    }

    #[test]
    fn test_smooth_wrr_respects_weights() {
        let lb = LoadBalancer::new(Strategy::WeightedRoundRobin);
        let candidates = vec![candidate("a", 3, 0, 0), candidate("b", 1, 0, 0)];

        let picks = ids(&candidates, &lb, 8);
        let a_count = picks.iter().filter(|p| *p == "a").count();
        assert_eq!(a_count, 6);

        // Smooth WRR interleaves instead of bursting: a a b a repeated
        assert_eq!(picks[..4], ["a", "a", "b", "a"]);
    }

    #[test]
    fn test_priority_lowest_wins() {
        let lb = LoadBalancer::new(Strategy::Priority);
        let candidates = vec![
            candidate("backup", 1, 2, 0),
            candidate("primary", 1, 1, 0),
        ];

        for _ in 0..5 {
            assert_eq!(lb.select(&candidates).unwrap().as_str(), "primary");
        }
    }

    #[test]
    fn test_priority_ties_round_robin() {
        let lb = LoadBalancer::new(Strategy::Priority);
        let candidates = vec![
            candidate("p1", 1, 1, 0),
            candidate("p2", 1, 1, 0),
            candidate("backup", 1, 9, 0),
        ];

        let picks = ids(&candidates, &lb, 4);
        assert_eq!(picks, vec!["p1", "p2", "p1", "p2"]);
    }

    #[test]
    fn test_least_connections() {
        let lb = LoadBalancer::new(Strategy::LeastConnections);
        let candidates = vec![
            candidate("busy", 1, 0, 7),
            candidate("quiet", 1, 0, 1),
            candidate("idle", 1, 0, 0),
        ];

        assert_eq!(lb.select(&candidates).unwrap().as_str(), "idle");
    }

    #[test]
    fn test_least_connections_ties_by_order() {
        let lb = LoadBalancer::new(Strategy::LeastConnections);
        let candidates = vec![candidate("first", 1, 0, 2), candidate("second", 1, 0, 2)];

        assert_eq!(lb.select(&candidates).unwrap().as_str(), "first");
    }

    #[test]
    fn test_random_stays_in_set() {
        let lb = LoadBalancer::new(Strategy::Random);
        let candidates = vec![candidate("a", 1, 0, 0), candidate("b", 1, 0, 0)];

        for _ in 0..20 {
            let picked = lb.select(&candidates).unwrap();
            assert!(picked.as_str() == "a" || picked.as_str() == "b");
        }
    }

    #[test]
    fn test_single_candidate_short_circuit() {
        let lb = LoadBalancer::new(Strategy::LeastConnections);
        let candidates = vec![candidate("only", 1, 0, 99)];
        assert_eq!(lb.select(&candidates).unwrap().as_str(), "only");
    }
}
