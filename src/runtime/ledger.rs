//! Per-agent reward accumulation.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::Side;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewardSummary {
    pub total_rewards: IndexMap<Side, f64>,
    pub total: f64,
}

/// Additive-only reward bookkeeping. Both agents are always present.
#[derive(Debug, Clone)]
pub struct RewardLedger {
    totals: IndexMap<Side, f64>,
}

impl Default for RewardLedger {
    fn default() -> Self {
        Self {
            totals: Side::ALL.iter().map(|s| (*s, 0.0)).collect(),
        }
    }
}

impl RewardLedger {
    pub fn record(&mut self, side: Side, reward: f64) {
        *self.totals.entry(side).or_insert(0.0) += reward;
    }

    pub fn total_for(&self, side: Side) -> f64 {
        self.totals.get(&side).copied().unwrap_or(0.0)
    }

    pub fn total(&self) -> f64 {
        self.totals.values().sum()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn summary(&self) -> RewardSummary {
        RewardSummary {
            total_rewards: self.totals.clone(),
            total: self.total(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewards_accumulate_per_agent_including_negatives() {
        let mut ledger = RewardLedger::default();
        ledger.record(Side::Red, 2.0);
        ledger.record(Side::Blue, -1.5);
        ledger.record(Side::Red, 0.0);
        ledger.record(Side::Red, 3.0);
        assert_eq!(ledger.total_for(Side::Red), 5.0);
        assert_eq!(ledger.total_for(Side::Blue), -1.5);
        assert_eq!(ledger.total(), 3.5);
    }

    #[test]
    fn reset_zeroes_both_agents() {
        let mut ledger = RewardLedger::default();
        ledger.record(Side::Blue, 4.0);
        ledger.reset();
        let summary = ledger.summary();
        assert_eq!(summary.total, 0.0);
        assert_eq!(summary.total_rewards.len(), 2);
    }
}
