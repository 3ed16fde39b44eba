//! Deterministic Settlement Scorer
//!
//! Integer-only, base-1,000,000 fixed-point scoring of a redemption from its
//! context signals. This module must stay bit-exact with the on-chain scorer:
//! no floating point, floor division everywhere, and the multipliers are
//! composed in a fixed order (stability → amount → time → agent) because each
//! step truncates.
//!
//! ```text
//! base 980_000
//!   × stability(volatility)      800_000 ..= 1_200_000
//!   × amount(amount)             900_000 ..= 1_100_000
//!   × time(hour)                 950_000 ..= 1_050_000
//!   × agent(success, stake)      850_000 ..= 1_150_000
//!   = composite  →  score = min(composite, 1_000_000)
//! ```

use crate::error::{EngineError, EngineResult};
use crate::models::{Ppm, RedemptionContext, ScoreBreakdown, ScoreResult, PPM_SCALE, TOKEN};
use crate::policy::{DecisionPolicy, PolicyThresholds};
use serde::{Deserialize, Serialize};

const STABILITY_MAX: u128 = 1_200_000;
const STABILITY_MIN: u128 = 800_000;
const STABILITY_SPAN: u128 = STABILITY_MAX - STABILITY_MIN;

const AMOUNT_SMALL_MULT: u128 = 1_100_000;
const AMOUNT_MEDIUM_MULT: u128 = 1_000_000;
const AMOUNT_LARGE_MULT: u128 = 900_000;
const AMOUNT_STEP: u128 = 100_000;

const TIME_LOW_ACTIVITY: Ppm = 950_000;
const TIME_HIGH_ACTIVITY: Ppm = 1_050_000;
const TIME_NORMAL: Ppm = 1_000_000;

const AGENT_BASE: u128 = 850_000;
const AGENT_SUCCESS_WEIGHT: u128 = 150_000;
const AGENT_MAX: u128 = 1_150_000;

/// Band half-width applied around the score, in percent.
const BAND_LOWER_PCT: u128 = 98;
const BAND_UPPER_PCT: u128 = 102;

/// Largest haircut suggested for a provisional payout (5%).
pub const MAX_HAIRCUT_PPM: Ppm = 50_000;

/// Success rate assumed for agents with no history (98%).
pub const DEFAULT_AGENT_SUCCESS_RATE: Ppm = 980_000;

/// Which value the ±2% confidence band is taken from.
///
/// `Composite` derives the band from the product of the multipliers before
/// the 100% cap and clamps each bound to 100%. `CappedScore` derives it from
/// the capped score, which bounds the lower edge at 980,000 and therefore
/// never clears the 997,000 provisional threshold. The two agree whenever the
/// composite does not exceed 100%.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BandBasis {
    #[default]
    Composite,
    CappedScore,
}

/// Scorer constants. Immutable once a scorer is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScorerParams {
    /// Starting score (98%).
    pub base_success_rate: Ppm,
    /// Volatility at which stability bottoms out (5%).
    pub max_volatility: Ppm,
    #[serde(with = "crate::serde_utils::u128_decimal")]
    pub small_amount: u128,
    #[serde(with = "crate::serde_utils::u128_decimal")]
    pub medium_amount: u128,
    #[serde(with = "crate::serde_utils::u128_decimal")]
    pub large_amount: u128,
    /// Stake at which the stake bonus starts ramping.
    #[serde(with = "crate::serde_utils::u128_decimal")]
    pub min_stake: u128,
    /// Bonus reached at `2 * min_stake`.
    pub max_stake_bonus: Ppm,
    #[serde(default)]
    pub band_basis: BandBasis,
}

impl Default for ScorerParams {
    fn default() -> Self {
        Self {
            base_success_rate: 980_000,
            max_volatility: 50_000,
            small_amount: 1_000 * TOKEN,
            medium_amount: 10_000 * TOKEN,
            large_amount: 100_000 * TOKEN,
            min_stake: 100_000 * TOKEN,
            max_stake_bonus: 150_000,
            band_basis: BandBasis::Composite,
        }
    }
}

impl ScorerParams {
    pub fn validate(&self) -> EngineResult<()> {
        if self.base_success_rate > PPM_SCALE {
            return Err(EngineError::validation(
                "base_success_rate",
                self.base_success_rate,
                "must not exceed 1000000 ppm",
            ));
        }
        if self.max_volatility == 0 {
            return Err(EngineError::validation("max_volatility", 0, "must be positive"));
        }
        if !(self.small_amount < self.medium_amount && self.medium_amount < self.large_amount) {
            return Err(EngineError::validation(
                "amount_thresholds",
                format!(
                    "{}/{}/{}",
                    self.small_amount, self.medium_amount, self.large_amount
                ),
                "must be strictly increasing small < medium < large",
            ));
        }
        if self.min_stake == 0 {
            return Err(EngineError::validation("min_stake", 0, "must be positive"));
        }
        Ok(())
    }

    /// The stake ramp and amount schedule share their break points with the
    /// provisional gates; both copies must agree.
    pub fn check_thresholds(&self, thresholds: &PolicyThresholds) -> EngineResult<()> {
        if thresholds.max_provisional_amount != self.medium_amount {
            return Err(EngineError::validation(
                "thresholds.max_provisional_amount",
                thresholds.max_provisional_amount,
                format!("must equal scorer.medium_amount ({})", self.medium_amount),
            ));
        }
        if thresholds.min_agent_stake != self.min_stake {
            return Err(EngineError::validation(
                "thresholds.min_agent_stake",
                thresholds.min_agent_stake,
                format!("must equal scorer.min_stake ({})", self.min_stake),
            ));
        }
        Ok(())
    }
}

/// `floor(a * b / c)` without overflowing on wei-scale `a`.
///
/// Exact: with `a = q*c + r`, `a*b/c = q*b + r*b/c` and `q*b` is integral.
fn mul_div(a: u128, b: u128, c: u128) -> u128 {
    match a.checked_mul(b) {
        Some(product) => product / c,
        None => (a / c) * b + (a % c) * b / c,
    }
}

// =============================================================================
// SCORER
// =============================================================================

/// Fixed-point scorer. Cheap to copy and safe to share across threads.
#[derive(Debug, Clone, Copy)]
pub struct DeterministicScorer {
    params: ScorerParams,
    policy: DecisionPolicy,
}

impl Default for DeterministicScorer {
    fn default() -> Self {
        Self {
            params: ScorerParams::default(),
            policy: DecisionPolicy::default(),
        }
    }
}

impl DeterministicScorer {
    pub fn new(params: ScorerParams, thresholds: PolicyThresholds) -> EngineResult<Self> {
        params.validate()?;
        params.check_thresholds(&thresholds)?;
        Ok(Self {
            params,
            policy: DecisionPolicy::new(thresholds),
        })
    }

    pub fn params(&self) -> &ScorerParams {
        &self.params
    }

    /// Stability multiplier: 1.2x at zero volatility, linear down to 0.8x at `max_volatility`.
    pub fn stability_multiplier(&self, volatility: Ppm) -> Ppm {
        let volatility = volatility as u128;
        let max_volatility = self.params.max_volatility as u128;
        if volatility >= max_volatility {
            return STABILITY_MIN as Ppm;
        }
        let reduction = volatility * STABILITY_SPAN / max_volatility;
        STABILITY_MAX
            .saturating_sub(reduction)
            .clamp(STABILITY_MIN, STABILITY_MAX) as Ppm
    }

    /// Amount multiplier: 1.1x small, 1.0x at medium, 0.9x from large upward.
    pub fn amount_multiplier(&self, amount: u128) -> Ppm {
        let p = &self.params;
        let mult = if amount < p.small_amount {
            AMOUNT_SMALL_MULT
        } else if amount < p.medium_amount {
            let range = p.medium_amount - p.small_amount;
            let excess = amount - p.small_amount;
            AMOUNT_SMALL_MULT - mul_div(excess, AMOUNT_STEP, range)
        } else {
            let range = p.large_amount - p.medium_amount;
            let excess = amount - p.medium_amount;
            if excess >= range {
                AMOUNT_LARGE_MULT
            } else {
                AMOUNT_MEDIUM_MULT - mul_div(excess, AMOUNT_STEP, range)
            }
        };
        mult as Ppm
    }

    /// Time-of-day multiplier.
    pub fn time_multiplier(&self, hour: u8) -> Ppm {
        match hour {
            2..=5 => TIME_LOW_ACTIVITY,
            9..=11 | 14..=16 => TIME_HIGH_ACTIVITY,
            _ => TIME_NORMAL,
        }
    }

    /// Agent multiplier: reputation plus a stake bonus ramping from `min_stake`
    /// to `2 * min_stake`, capped at 1.15x.
    pub fn agent_multiplier(&self, success_rate: Ppm, stake: u128) -> Ppm {
        let base = AGENT_BASE + success_rate as u128 * AGENT_SUCCESS_WEIGHT / PPM_SCALE as u128;

        let min_stake = self.params.min_stake;
        let max_bonus = self.params.max_stake_bonus as u128;
        let bonus = if stake < min_stake {
            0
        } else {
            let excess = stake - min_stake;
            if excess >= min_stake {
                max_bonus
            } else {
                mul_div(excess, max_bonus, min_stake)
            }
        };

        (base + bonus).min(AGENT_MAX) as Ppm
    }

    /// Score a redemption.
    pub fn score(&self, context: &RedemptionContext) -> EngineResult<ScoreResult> {
        context.validate()?;

        let stability = self.stability_multiplier(context.price_volatility);
        let amount = self.amount_multiplier(context.amount);
        let time = self.time_multiplier(context.hour_of_day);
        let agent = self.agent_multiplier(context.agent_success_rate, context.agent_stake);

        let scale = PPM_SCALE as u128;
        let mut composite = self.params.base_success_rate as u128;
        for mult in [stability, amount, time, agent] {
            composite = composite * mult as u128 / scale;
        }

        let score = composite.min(scale);
        let band_source = match self.params.band_basis {
            BandBasis::Composite => composite,
            BandBasis::CappedScore => score,
        };
        let confidence_lower = (band_source * BAND_LOWER_PCT / 100).min(scale);
        let confidence_upper = (band_source * BAND_UPPER_PCT / 100).min(scale);

        let (score, confidence_lower, confidence_upper) =
            (score as Ppm, confidence_lower as Ppm, confidence_upper as Ppm);

        debug_assert!(confidence_lower <= score && score <= confidence_upper);
        debug_assert!(confidence_upper <= PPM_SCALE);

        let can_provisional = self.policy.can_provisional(confidence_lower, Some(context));
        let decision =
            self.policy
                .decide(score, confidence_lower, confidence_upper, Some(context));

        Ok(ScoreResult {
            score,
            confidence_lower,
            confidence_upper,
            can_provisional,
            decision,
            breakdown: ScoreBreakdown {
                stability,
                amount,
                time,
                agent,
                composite: composite as u64,
            },
        })
    }
}

// =============================================================================
// SIGNAL HELPERS
// =============================================================================

/// Integer square root (floor).
fn isqrt(n: u128) -> u128 {
    if n < 2 {
        return n;
    }
    let mut x = n;
    let mut y = (x + 1) / 2;
    while y < x {
        x = y;
        y = (x + n / x) / 2;
    }
    x
}

/// Price volatility in ppm: population standard deviation over the mean.
///
/// Prices are raw feed units. Returns 0 with fewer than two prices or a zero
/// mean; saturates at 100%.
pub fn price_volatility_ppm(prices: &[u64]) -> Ppm {
    if prices.len() < 2 {
        return 0;
    }
    let n = prices.len() as u128;
    let sum: u128 = prices.iter().map(|&p| p as u128).sum();
    let mean = sum / n;
    if mean == 0 {
        return 0;
    }

    let variance = prices
        .iter()
        .map(|&p| {
            let diff = (p as u128).abs_diff(mean);
            diff * diff
        })
        .fold(0u128, |acc, sq| acc.saturating_add(sq))
        / n;

    let std_dev = isqrt(variance);
    mul_div(std_dev, PPM_SCALE as u128, mean).min(PPM_SCALE as u128) as Ppm
}

/// Agent success rate in ppm from completed/total counts.
pub fn agent_success_rate_ppm(completed: u64, total: u64) -> EngineResult<Ppm> {
    if total == 0 {
        return Ok(DEFAULT_AGENT_SUCCESS_RATE);
    }
    if completed > total {
        return Err(EngineError::validation(
            "completed",
            completed,
            format!("exceeds total {}", total),
        ));
    }
    Ok(mul_div(completed as u128, PPM_SCALE as u128, total as u128) as Ppm)
}

/// Haircut suggested for a provisional payout: higher confidence, lower haircut.
pub fn suggested_haircut(confidence_lower: Ppm) -> Ppm {
    let shortfall = PPM_SCALE.saturating_sub(confidence_lower);
    shortfall * MAX_HAIRCUT_PPM / PPM_SCALE
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Decision;

    fn ctx(vol: Ppm, amount: u128, rate: Ppm, stake: u128, hour: u8) -> RedemptionContext {
        RedemptionContext::new(vol, amount, rate, stake, hour).unwrap()
    }

    #[test]
    fn test_high_confidence_scenario() {
        let scorer = DeterministicScorer::default();
        let result = scorer
            .score(&ctx(10_000, 100 * TOKEN, 990_000, 200_000 * TOKEN, 10))
            .unwrap();

        assert_eq!(result.breakdown.stability, 1_120_000);
        assert_eq!(result.breakdown.amount, 1_100_000);
        assert_eq!(result.breakdown.time, 1_050_000);
        assert_eq!(result.breakdown.agent, 1_148_500);
        assert_eq!(result.breakdown.composite, 1_455_985);
        assert_eq!(result.score, 1_000_000);
        assert_eq!(result.confidence_lower, 1_000_000);
        assert_eq!(result.confidence_upper, 1_000_000);
        assert!(result.can_provisional);
        assert_eq!(result.decision, Decision::ProvisionalSettle);
    }

    #[test]
    fn test_low_confidence_scenario() {
        let scorer = DeterministicScorer::default();
        let result = scorer
            .score(&ctx(60_000, 100_000 * TOKEN, 900_000, 50_000 * TOKEN, 3))
            .unwrap();

        assert_eq!(result.breakdown.stability, 800_000);
        assert_eq!(result.breakdown.amount, 900_000);
        assert_eq!(result.breakdown.time, 950_000);
        assert_eq!(result.breakdown.agent, 985_000);
        assert_eq!(result.score, 660_265);
        assert_eq!(result.confidence_lower, 647_059);
        assert_eq!(result.confidence_upper, 673_470);
        assert!(!result.can_provisional);
        assert_eq!(result.decision, Decision::QueueFdc);
    }

    #[test]
    fn test_medium_confidence_scenario() {
        let scorer = DeterministicScorer::default();
        let result = scorer
            .score(&ctx(30_000, 5_000 * TOKEN, 970_000, 150_000 * TOKEN, 6))
            .unwrap();

        assert_eq!(result.breakdown.stability, 960_000);
        assert_eq!(result.breakdown.amount, 1_055_556);
        assert_eq!(result.breakdown.time, 1_000_000);
        assert_eq!(result.breakdown.agent, 1_070_500);
        assert_eq!(result.breakdown.composite, 1_063_078);
        assert_eq!(result.score, 1_000_000);
        assert_eq!(result.confidence_lower, 1_000_000);
        // 3% volatility fails the provisional gate.
        assert!(!result.can_provisional);
        assert_eq!(result.decision, Decision::BufferEarmark);
    }

    #[test]
    fn test_capped_band_never_settles() {
        let params = ScorerParams {
            band_basis: BandBasis::CappedScore,
            ..ScorerParams::default()
        };
        let scorer = DeterministicScorer::new(params, PolicyThresholds::default()).unwrap();
        let result = scorer
            .score(&ctx(10_000, 100 * TOKEN, 990_000, 200_000 * TOKEN, 10))
            .unwrap();
        assert_eq!(result.score, 1_000_000);
        assert_eq!(result.confidence_lower, 980_000);
        assert_eq!(result.decision, Decision::BufferEarmark);
    }

    #[test]
    fn test_band_bases_agree_below_cap() {
        let composite = DeterministicScorer::default();
        let capped = DeterministicScorer::new(
            ScorerParams {
                band_basis: BandBasis::CappedScore,
                ..ScorerParams::default()
            },
            PolicyThresholds::default(),
        )
        .unwrap();
        let c = ctx(60_000, 100_000 * TOKEN, 900_000, 50_000 * TOKEN, 3);
        assert_eq!(composite.score(&c).unwrap(), capped.score(&c).unwrap());
    }

    #[test]
    fn test_stability_monotone_and_bounded() {
        let scorer = DeterministicScorer::default();
        assert_eq!(scorer.stability_multiplier(0), 1_200_000);
        assert_eq!(scorer.stability_multiplier(50_000), 800_000);
        assert_eq!(scorer.stability_multiplier(1_000_000), 800_000);

        let mut prev = scorer.stability_multiplier(0);
        for vol in 0..=50_000 {
            let m = scorer.stability_multiplier(vol);
            assert!((800_000..=1_200_000).contains(&m));
            assert!(m <= prev, "not monotone at {}", vol);
            prev = m;
        }
    }

    #[test]
    fn test_amount_segments() {
        let scorer = DeterministicScorer::default();
        assert_eq!(scorer.amount_multiplier(0), 1_100_000);
        assert_eq!(scorer.amount_multiplier(1_000 * TOKEN - 1), 1_100_000);
        assert_eq!(scorer.amount_multiplier(1_000 * TOKEN), 1_100_000);
        assert_eq!(scorer.amount_multiplier(10_000 * TOKEN - 1), 1_000_001);
        assert_eq!(scorer.amount_multiplier(10_000 * TOKEN), 1_000_000);
        assert_eq!(scorer.amount_multiplier(55_000 * TOKEN), 950_000);
        assert_eq!(scorer.amount_multiplier(100_000 * TOKEN), 900_000);
        assert_eq!(scorer.amount_multiplier(u128::MAX), 900_000);
    }

    #[test]
    fn test_time_buckets() {
        let scorer = DeterministicScorer::default();
        let expected = |h: u8| match h {
            2..=5 => 950_000,
            9..=11 | 14..=16 => 1_050_000,
            _ => 1_000_000,
        };
        for h in 0..24 {
            assert_eq!(scorer.time_multiplier(h), expected(h), "hour {}", h);
        }
        assert_eq!(scorer.time_multiplier(1), 1_000_000);
        assert_eq!(scorer.time_multiplier(12), 1_000_000);
    }

    #[test]
    fn test_agent_multiplier_ramp_and_cap() {
        let scorer = DeterministicScorer::default();
        assert_eq!(scorer.agent_multiplier(0, 0), 850_000);
        assert_eq!(scorer.agent_multiplier(1_000_000, 0), 1_000_000);
        assert_eq!(scorer.agent_multiplier(0, 100_000 * TOKEN), 850_000);
        assert_eq!(scorer.agent_multiplier(0, 150_000 * TOKEN), 925_000);
        assert_eq!(scorer.agent_multiplier(0, 200_000 * TOKEN), 1_000_000);
        assert_eq!(scorer.agent_multiplier(1_000_000, 10_000_000 * TOKEN), 1_150_000);
    }

    #[test]
    fn test_score_bounds_over_grid() {
        let scorer = DeterministicScorer::default();
        let vols = [0, 5_000, 19_999, 20_000, 35_000, 50_000, 80_000];
        let amounts = [0, 999 * TOKEN, 5_000 * TOKEN, 10_000 * TOKEN, 60_000 * TOKEN, 500_000 * TOKEN];
        let rates = [0, 500_000, 900_000, 1_000_000];
        let stakes = [0, 100_000 * TOKEN, 170_000 * TOKEN, 300_000 * TOKEN];
        for &v in &vols {
            for &a in &amounts {
                for &r in &rates {
                    for &s in &stakes {
                        for h in [0u8, 3, 10, 15, 23] {
                            let res = scorer.score(&ctx(v, a, r, s, h)).unwrap();
                            assert!(res.score <= PPM_SCALE);
                            assert!(res.confidence_lower <= res.score);
                            assert!(res.score <= res.confidence_upper);
                            assert!(res.confidence_upper <= PPM_SCALE);
                            if res.decision == Decision::ProvisionalSettle {
                                assert!(res.confidence_lower >= 997_000);
                            }
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_rejects_invalid_context() {
        let scorer = DeterministicScorer::default();
        let bad = RedemptionContext {
            price_volatility: 0,
            amount: 0,
            agent_success_rate: 2_000_000,
            agent_stake: 0,
            hour_of_day: 0,
        };
        assert!(matches!(
            scorer.score(&bad),
            Err(EngineError::Validation { ref field, .. }) if field == "agent_success_rate"
        ));
    }

    #[test]
    fn test_params_validation() {
        let params = ScorerParams {
            medium_amount: 500 * TOKEN,
            ..ScorerParams::default()
        };
        assert!(DeterministicScorer::new(params, PolicyThresholds::default()).is_err());
    }

    #[test]
    fn test_gate_thresholds_must_match_schedule() {
        let thresholds = PolicyThresholds {
            min_agent_stake: 50_000 * TOKEN,
            ..PolicyThresholds::default()
        };
        let err = DeterministicScorer::new(ScorerParams::default(), thresholds).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Validation { ref field, .. } if field == "thresholds.min_agent_stake"
        ));

        let params = ScorerParams {
            medium_amount: 20_000 * TOKEN,
            ..ScorerParams::default()
        };
        let thresholds = PolicyThresholds {
            max_provisional_amount: 20_000 * TOKEN,
            ..PolicyThresholds::default()
        };
        assert!(DeterministicScorer::new(params, thresholds).is_ok());
        assert!(DeterministicScorer::new(params, PolicyThresholds::default()).is_err());
    }

    #[test]
    fn test_price_volatility() {
        assert_eq!(price_volatility_ppm(&[]), 0);
        assert_eq!(price_volatility_ppm(&[100]), 0);
        assert_eq!(price_volatility_ppm(&[100, 100, 100]), 0);
        assert_eq!(price_volatility_ppm(&[0, 0]), 0);
        // mean 100, deviations ±2 → std 2 → 2%.
        assert_eq!(price_volatility_ppm(&[98, 102, 98, 102]), 20_000);
    }

    #[test]
    fn test_isqrt() {
        for n in [0u128, 1, 2, 3, 4, 15, 16, 17, 1_000_000, u64::MAX as u128] {
            let r = isqrt(n);
            assert!(r * r <= n);
            assert!((r + 1) * (r + 1) > n);
        }
    }

    #[test]
    fn test_agent_success_rate_and_haircut() {
        assert_eq!(agent_success_rate_ppm(0, 0).unwrap(), 980_000);
        assert_eq!(agent_success_rate_ppm(99, 100).unwrap(), 990_000);
        assert!(agent_success_rate_ppm(5, 4).is_err());
        assert_eq!(
            agent_success_rate_ppm(u64::MAX - 1, u64::MAX).unwrap(),
            999_999
        );
        assert_eq!(agent_success_rate_ppm(u64::MAX, u64::MAX).unwrap(), PPM_SCALE);

        assert_eq!(suggested_haircut(1_000_000), 0);
        assert_eq!(suggested_haircut(997_000), 150);
        assert_eq!(suggested_haircut(0), MAX_HAIRCUT_PPM);
    }
}
