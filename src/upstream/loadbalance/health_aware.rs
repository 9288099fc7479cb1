use super::Candidate;
use rand::Rng;

/// Weighted random by health score. Returns nothing only when every score
/// is zero.
#[derive(Default)]
pub struct HealthAwareBalancer;

impl HealthAwareBalancer {
    pub fn new() -> Self {
        Self
    }

    pub fn pick(&self, candidates: &[Candidate<'_>]) -> Option<usize> {
        let total: f64 = candidates.iter().map(|c| c.health_score.max(0.0)).sum();
        if total <= 0.0 {
            return None;
        }
        let mut target = rand::thread_rng().gen_range(0.0..total);
        let mut last_positive = None;
        for (i, c) in candidates.iter().enumerate() {
            let score = c.health_score.max(0.0);
            if score <= 0.0 {
                continue;
            }
            if target < score {
                return Some(i);
            }
            target -= score;
            last_positive = Some(i);
        }
        // Float rounding can leave a sliver past the last bucket.
        last_positive
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::instances;
    use super::super::LoadBalancer;
    use crate::config::LbStrategy;
    use std::collections::HashMap;
    use std::time::Duration;

    #[test]
    fn test_none_only_when_all_scores_zero() {
        let lb = LoadBalancer::new(LbStrategy::HealthAware);
        let insts = instances(2);
        lb.select(&insts, None).unwrap();
        lb.record_result("o-1", false, Duration::ZERO);
        lb.record_result("o-2", false, Duration::ZERO);
        assert!(lb.select(&insts, None).is_none());
    }

    #[test]
    fn test_zero_score_instance_never_picked() {
        let lb = LoadBalancer::new(LbStrategy::HealthAware);
        let insts = instances(2);
        lb.select(&insts, None).unwrap();
        lb.record_result("o-1", false, Duration::ZERO);
        for _ in 0..50 {
            assert_eq!(lb.select(&insts, None).unwrap().instance_id, "o-2");
        }
    }

    #[test]
    fn test_prefers_higher_score() {
        let lb = LoadBalancer::new(LbStrategy::HealthAware);
        let insts = instances(2);
        lb.select(&insts, None).unwrap();
        // o-1 succeeds one call in four: score 0.25 against 1.0.
        lb.record_result("o-1", false, Duration::ZERO);
        lb.record_result("o-1", false, Duration::ZERO);
        lb.record_result("o-1", false, Duration::ZERO);
        lb.record_result("o-1", true, Duration::ZERO);

        let mut counts: HashMap<String, u32> = HashMap::new();
        for _ in 0..5_000 {
            let picked = lb.select(&insts, None).unwrap();
            *counts.entry(picked.instance_id).or_insert(0) += 1;
        }
        let low = counts.get("o-1").copied().unwrap_or(0);
        assert!((700..1300).contains(&low), "o-1 count: {}", low);
    }
}
