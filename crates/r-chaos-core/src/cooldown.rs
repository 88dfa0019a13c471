//! ---
//! ems_section: "07-resilience-fault-tolerance"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Per-target cooldown deadlines between experiments."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::time::{Duration, Instant};

use r_chaos_common::{ExperimentConfig, ExperimentType};

/// Keys an experiment occupies for cooldown purposes: its targets, or the
/// type label when it names none.
pub fn cooldown_keys(experiment_type: ExperimentType, config: &ExperimentConfig) -> Vec<String> {
    if config.targets.is_empty() {
        vec![experiment_type.as_str().to_owned()]
    } else {
        config.targets.clone()
    }
}

/// Earliest instant at which each key may be targeted again.
#[derive(Debug, Default)]
pub struct CooldownTracker {
    deadlines: HashMap<String, Instant>,
}

impl CooldownTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block `key` until `until`; an existing later deadline is kept.
    pub fn schedule(&mut self, key: impl Into<String>, until: Instant) {
        let entry = self.deadlines.entry(key.into()).or_insert(until);
        if until > *entry {
            *entry = until;
        }
    }

    pub fn remaining(&self, key: &str, now: Instant) -> Option<Duration> {
        self.deadlines
            .get(key)
            .map(|deadline| deadline.saturating_duration_since(now))
            .filter(|left| !left.is_zero())
    }

    /// First key still cooling down, with its remaining time.
    pub fn first_blocked<'a>(
        &self,
        keys: impl IntoIterator<Item = &'a String>,
        now: Instant,
    ) -> Option<(String, Duration)> {
        keys.into_iter()
            .find_map(|key| self.remaining(key, now).map(|left| (key.clone(), left)))
    }

    /// Forget expired deadlines.
    pub fn prune(&mut self, now: Instant) {
        self.deadlines.retain(|_, deadline| *deadline > now);
    }

    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_until_deadline_passes() {
        let start = Instant::now();
        let mut tracker = CooldownTracker::new();
        tracker.schedule("lo", start + Duration::from_secs(60));

        let keys = vec!["eth0".to_owned(), "lo".to_owned()];
        let (key, left) = tracker.first_blocked(&keys, start + Duration::from_secs(10)).unwrap();
        assert_eq!(key, "lo");
        assert_eq!(left, Duration::from_secs(50));
        assert!(tracker.first_blocked(&keys, start + Duration::from_secs(60)).is_none());

        tracker.prune(start + Duration::from_secs(61));
        assert!(tracker.is_empty());
    }

    #[test]
    fn later_deadline_wins() {
        let start = Instant::now();
        let mut tracker = CooldownTracker::new();
        tracker.schedule("3000", start + Duration::from_secs(30));
        tracker.schedule("3000", start + Duration::from_secs(10));
        assert_eq!(tracker.remaining("3000", start), Some(Duration::from_secs(30)));
    }

    #[test]
    fn untargeted_experiments_cool_down_by_type() {
        let mut config = ExperimentConfig::defaults_for(ExperimentType::ServiceFailure);
        config.targets.clear();
        assert_eq!(
            cooldown_keys(ExperimentType::ServiceFailure, &config),
            vec!["serviceFailure".to_owned()]
        );
    }
}
