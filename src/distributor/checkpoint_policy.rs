//! When to checkpoint.

use crate::config::DistributorConfig;

/// Bookkeeping for the epoch since the last checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpochClock {
    /// Real time the epoch started (last successful checkpoint).
    pub started_at: i64,
    /// Something was distributed or received during this epoch.
    pub dirty: bool,
    /// Successful checkpoints so far.
    pub checkpoints: u64,
}

impl EpochClock {
    pub fn new(now: i64) -> Self {
        Self {
            started_at: now,
            dirty: false,
            checkpoints: 0,
        }
    }

    /// Start the next epoch after a successful checkpoint.
    pub fn completed(&mut self, now: i64) {
        self.started_at = now;
        self.dirty = false;
        self.checkpoints += 1;
    }

    pub fn age(&self, now: i64) -> i64 {
        now - self.started_at
    }
}

/// Checkpoint timing rules.
///
/// A clean epoch is never checkpointed. A dirty one is due once it is
/// `checkpoint_max_interval` old, or in lazy mode once it is
/// `lazy_checkpoint_interval` old, unless acknowledgements are waiting on
/// durability, which brings the lazy deadline back to the max interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointPolicy {
    max_interval: i64,
    lazy_interval: i64,
    lazy: bool,
    full_every: u64,
}

impl CheckpointPolicy {
    pub fn from_config(config: &DistributorConfig) -> Self {
        Self {
            max_interval: config.checkpoint_max_interval as i64,
            lazy_interval: config.lazy_checkpoint_interval as i64,
            lazy: config.lazy_persistence,
            full_every: u64::from(config.full_checkpoint_every.max(1)),
        }
    }

    pub fn is_due(&self, epoch: &EpochClock, now: i64, acks_waiting: bool) -> bool {
        if !epoch.dirty && !acks_waiting {
            return false;
        }
        let age = epoch.age(now);
        if !self.lazy || acks_waiting {
            age >= self.max_interval
        } else {
            age >= self.lazy_interval
        }
    }

    /// Whether the next checkpoint should be a full snapshot.
    pub fn next_is_full(&self, epoch: &EpochClock) -> bool {
        epoch.checkpoints % self.full_every == 0
    }

    /// How often the background timer should ask.
    pub fn tick_interval(&self) -> i64 {
        (self.max_interval / 4).clamp(100, 10_000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(lazy: bool) -> CheckpointPolicy {
        CheckpointPolicy::from_config(&DistributorConfig {
            lazy_persistence: lazy,
            full_checkpoint_every: 3,
            ..DistributorConfig::default()
        })
    }

    #[test]
    fn test_clean_epoch_never_due() {
        let epoch = EpochClock::new(0);
        assert!(!policy(false).is_due(&epoch, 1_000_000, false));
    }

    #[test]
    fn test_eager_due_at_max_interval() {
        let mut epoch = EpochClock::new(0);
        epoch.dirty = true;
        let p = policy(false);
        assert!(!p.is_due(&epoch, 36_999, false));
        assert!(p.is_due(&epoch, 37_000, false));
    }

    #[test]
    fn test_lazy_waits_unless_acks_pending() {
        let mut epoch = EpochClock::new(0);
        epoch.dirty = true;
        let p = policy(true);
        assert!(!p.is_due(&epoch, 37_000, false));
        assert!(p.is_due(&epoch, 37_000, true));
        assert!(p.is_due(&epoch, 300_000, false));
    }

    #[test]
    fn test_full_every_nth() {
        let p = policy(false);
        let mut epoch = EpochClock::new(0);
        let mut kinds = Vec::new();
        for _ in 0..6 {
            kinds.push(p.next_is_full(&epoch));
            epoch.completed(0);
        }
        assert_eq!(kinds, vec![true, false, false, true, false, false]);
    }
}
