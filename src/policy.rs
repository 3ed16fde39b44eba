//! Decision Policy
//!
//! Three-way settlement gate shared by the deterministic scorer, the model
//! path and the backtest harness. Pure: no state survives between calls, so
//! identical inputs always map to the identical decision.

use crate::models::{Decision, Ppm, RedemptionContext, TOKEN};
use serde::{Deserialize, Serialize};

/// Thresholds for the settlement gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyThresholds {
    /// Minimum lower confidence bound for provisional settlement (99.7%).
    pub provisional_ppm: Ppm,
    /// Minimum lower confidence bound for a buffer earmark (95%).
    pub buffer_ppm: Ppm,
    /// Deterministic path: volatility must be strictly below this (2%).
    pub max_provisional_volatility: Ppm,
    /// Deterministic path: amount must be strictly below this.
    #[serde(with = "crate::serde_utils::u128_decimal")]
    pub max_provisional_amount: u128,
    /// Deterministic path: agent stake must be at least this.
    #[serde(with = "crate::serde_utils::u128_decimal")]
    pub min_agent_stake: u128,
}

impl Default for PolicyThresholds {
    fn default() -> Self {
        Self {
            provisional_ppm: 997_000,
            buffer_ppm: 950_000,
            max_provisional_volatility: 20_000,
            max_provisional_amount: 10_000 * TOKEN,
            min_agent_stake: 100_000 * TOKEN,
        }
    }
}

/// Maps a point estimate and its confidence band to a [`Decision`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DecisionPolicy {
    thresholds: PolicyThresholds,
}

impl DecisionPolicy {
    pub fn new(thresholds: PolicyThresholds) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> &PolicyThresholds {
        &self.thresholds
    }

    /// Whether the deterministic-path context gates hold.
    pub fn context_gates_pass(&self, context: &RedemptionContext) -> bool {
        context.price_volatility < self.thresholds.max_provisional_volatility
            && context.amount < self.thresholds.max_provisional_amount
            && context.agent_stake >= self.thresholds.min_agent_stake
    }

    /// Whether provisional settlement is allowed for this band.
    ///
    /// `context` is `Some` on the deterministic path, which adds the
    /// volatility, amount and stake gates; the model path passes `None`.
    pub fn can_provisional(
        &self,
        confidence_lower: Ppm,
        context: Option<&RedemptionContext>,
    ) -> bool {
        confidence_lower >= self.thresholds.provisional_ppm
            && context.map_or(true, |ctx| self.context_gates_pass(ctx))
    }

    /// Decide the settlement action.
    ///
    /// The point estimate and upper bound do not move the decision today; they
    /// are part of the call so audit logs capture the full band.
    pub fn decide(
        &self,
        point_estimate: Ppm,
        confidence_lower: Ppm,
        confidence_upper: Ppm,
        context: Option<&RedemptionContext>,
    ) -> Decision {
        debug_assert!(
            confidence_lower <= confidence_upper,
            "inverted band: [{}, {}] around {}",
            confidence_lower,
            confidence_upper,
            point_estimate
        );

        if self.can_provisional(confidence_lower, context) {
            Decision::ProvisionalSettle
        } else if confidence_lower >= self.thresholds.buffer_ppm {
            Decision::BufferEarmark
        } else {
            Decision::QueueFdc
        }
    }
}
