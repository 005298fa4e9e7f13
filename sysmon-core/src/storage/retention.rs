//! Retention and rollup policy as pure functions over `(now, policy)`.
//!
//! Kept separate from `TimeSeriesStore` so the scheduling decision — what to
//! prune or roll up and in what order — is testable without a clock or a
//! database (the ordering must be deterministic and
//! idempotence, not the schedule").

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// Raw per-second rows older than this are deleted outright, default 30d.
    pub raw_retention_days: i64,
    /// Raw rows older than this (but within `raw_retention_days`) are
    /// collapsed to one-minute aggregates. `None` disables rollup.
    pub minute_rollup_after_days: Option<i64>,
    /// Minute-resolution rows older than this are collapsed to one-hour
    /// aggregates. `None` disables the second rollup stage.
    pub hour_rollup_after_days: Option<i64>,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            raw_retention_days: 30,
            minute_rollup_after_days: None,
            hour_rollup_after_days: None,
        }
    }
}

/// One maintenance step to run against the store, in the order they must be
/// applied: raw deletion first, then minute rollup, then hour rollup — never
/// back-filling a coarser bucket from data already rolled up past it.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RetentionAction {
    PruneBefore { cutoff_ts: i64 },
    RollupToMinute { cutoff_ts: i64 },
    RollupToHour { cutoff_ts: i64 },
}

const SECONDS_PER_DAY: i64 = 86_400;

/// Computes the maintenance plan for `now`. Calling this twice with the same
/// `now` and `policy` yields the same plan.
pub fn plan(now: i64, policy: &RetentionPolicy) -> Vec<RetentionAction> {
    let mut actions = Vec::new();

    if let Some(days) = policy.minute_rollup_after_days {
        actions.push(RetentionAction::RollupToMinute { cutoff_ts: now - days * SECONDS_PER_DAY });
    }
    if let Some(days) = policy.hour_rollup_after_days {
        actions.push(RetentionAction::RollupToHour { cutoff_ts: now - days * SECONDS_PER_DAY });
    }
    actions.push(RetentionAction::PruneBefore {
        cutoff_ts: now - policy.raw_retention_days * SECONDS_PER_DAY,
    });

    actions
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_orders_rollups_before_final_prune() {
        let policy = RetentionPolicy {
            raw_retention_days: 30,
            minute_rollup_after_days: Some(1),
            hour_rollup_after_days: Some(7),
        };
        let actions = plan(1_000_000, &policy);
        assert_eq!(actions.len(), 3);
        assert!(matches!(actions[0], RetentionAction::RollupToMinute { .. }));
        assert!(matches!(actions[1], RetentionAction::RollupToHour { .. }));
        assert!(matches!(actions[2], RetentionAction::PruneBefore { .. }));
    }

    #[test]
    fn plan_is_deterministic_for_same_inputs() {
        let policy = RetentionPolicy::default();
        assert_eq!(plan(500_000, &policy), plan(500_000, &policy));
    }

    #[test]
    fn default_policy_only_prunes() {
        let actions = plan(100_000, &RetentionPolicy::default());
        assert_eq!(actions.len(), 1);
        assert!(matches!(actions[0], RetentionAction::PruneBefore { .. }));
    }
}
