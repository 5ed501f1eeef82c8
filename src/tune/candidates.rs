//! # Candidate Generator & Safety Policy
//!
//! ## Responsibility
//! Decide whether a (frequency, voltage) pair may ever be commanded, and
//! enumerate the safe subset of the search grid in the order it is tried.
//!
//! ## Guarantees
//! - Every generated candidate satisfies [`SafetyPolicy::is_safe`]
//! - Full-grid order is descending by frequency, then by voltage
//! - Quick-tune order is the fixed short list, unsafe entries removed
//!
//! ## NOT Responsible For
//! - Testing candidates (that belongs to `tester`)

use crate::config::SafetyConfig;

use super::Candidate;

/// Fixed short list tried by quick tune, in order.
const QUICK_LIST: [(u32, f64); 4] = [(525, 1.20), (550, 1.25), (500, 1.15), (575, 1.30)];

/// Numeric tolerance for voltage comparisons against grid points.
const VOLTAGE_EPSILON: f64 = 1e-9;

/// Safety envelope built from the `[safety]` config section.
#[derive(Debug, Clone)]
pub struct SafetyPolicy {
    cfg: SafetyConfig,
}

impl SafetyPolicy {
    /// Build a policy from `cfg`.
    pub fn new(cfg: SafetyConfig) -> Self {
        Self { cfg }
    }

    /// Whether `(frequency, voltage)` lies inside the absolute bounds and
    /// under every applicable de-rating cap.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn is_safe(&self, frequency: u32, voltage: f64) -> bool {
        if !voltage.is_finite() {
            return false;
        }
        if frequency < self.cfg.min_frequency || frequency > self.cfg.max_frequency {
            return false;
        }
        if voltage < self.cfg.min_voltage - VOLTAGE_EPSILON
            || voltage > self.cfg.max_voltage + VOLTAGE_EPSILON
        {
            return false;
        }
        self.cfg
            .derating
            .iter()
            .filter(|rule| frequency >= rule.min_frequency)
            .all(|rule| voltage <= rule.max_voltage + VOLTAGE_EPSILON)
    }

    /// Every safe grid point, highest frequency first, then highest voltage.
    pub fn generate(&self) -> Vec<Candidate> {
        let mut out: Vec<Candidate> = self
            .cfg
            .frequency_steps
            .iter()
            .flat_map(|&f| {
                self.cfg
                    .voltage_steps
                    .iter()
                    .map(move |&v| Candidate::new(f, v))
            })
            .filter(|c| self.is_safe(c.frequency, c.voltage))
            .collect();

        out.sort_by(|a, b| {
            b.frequency
                .cmp(&a.frequency)
                .then(b.voltage.total_cmp(&a.voltage))
        });
        out.dedup();
        out
    }

    /// The quick-tune short list with unsafe entries removed.
    pub fn quick_candidates(&self) -> Vec<Candidate> {
        QUICK_LIST
            .iter()
            .filter(|(f, v)| self.is_safe(*f, *v))
            .map(|&(f, v)| Candidate::new(f, v))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeratingRule;

    fn policy() -> SafetyPolicy {
        SafetyPolicy::new(SafetyConfig::default())
    }

    #[test]
    fn test_bounds_are_inclusive() {
        let p = policy();
        assert!(p.is_safe(400, 1.0));
        assert!(p.is_safe(500, 1.4));
        assert!(!p.is_safe(399, 1.2));
        assert!(!p.is_safe(601, 1.2));
        assert!(!p.is_safe(500, 0.99));
        assert!(!p.is_safe(500, 1.41));
    }

    #[test]
    fn test_derating_caps_voltage_at_high_clock() {
        let p = policy();
        assert!(p.is_safe(575, 1.30));
        assert!(!p.is_safe(575, 1.35));
        assert!(!p.is_safe(600, 1.31));
        assert!(p.is_safe(550, 1.35));
        assert!(!p.is_safe(550, 1.40));
        assert!(p.is_safe(525, 1.40));
    }

    #[test]
    fn test_non_finite_voltage_is_unsafe() {
        assert!(!policy().is_safe(500, f64::NAN));
    }

    #[test]
    fn test_every_generated_candidate_is_safe() {
        let p = policy();
        let cands = p.generate();
        assert!(!cands.is_empty());
        assert!(cands.iter().all(|c| p.is_safe(c.frequency, c.voltage)));
    }

    #[test]
    fn test_generate_default_grid_size_and_order() {
        let cands = policy().generate();
        // 7 x 8 grid minus (550: 1.40), (575: 1.35, 1.40), (600: 1.35, 1.40)
        assert_eq!(cands.len(), 51);
        assert_eq!(cands[0], Candidate::new(600, 1.30));
        assert_eq!(cands[1], Candidate::new(600, 1.25));
        assert_eq!(cands.last(), Some(&Candidate::new(400, 1.0)));
        for pair in cands.windows(2) {
            let (a, b) = (&pair[0], &pair[1]);
            assert!(a.frequency > b.frequency || (a.frequency == b.frequency && a.voltage > b.voltage));
        }
    }

    #[test]
    fn test_custom_derating_rule_applies() {
        let mut cfg = SafetyConfig::default();
        cfg.derating.push(DeratingRule {
            min_frequency: 500,
            max_voltage: 1.2,
        });
        let p = SafetyPolicy::new(cfg);
        assert!(!p.is_safe(500, 1.25));
        assert!(p.is_safe(450, 1.25));
    }

    #[test]
    fn test_quick_candidates_keep_order() {
        let quick = policy().quick_candidates();
        assert_eq!(
            quick,
            vec![
                Candidate::new(525, 1.20),
                Candidate::new(550, 1.25),
                Candidate::new(500, 1.15),
                Candidate::new(575, 1.30),
            ]
        );
    }

    #[test]
    fn test_quick_candidates_drop_unsafe_entries() {
        let cfg = SafetyConfig {
            max_frequency: 550,
            ..SafetyConfig::default()
        };
        let quick = SafetyPolicy::new(cfg).quick_candidates();
        assert_eq!(quick.len(), 3);
        assert!(quick.iter().all(|c| c.frequency <= 550));
    }
}
