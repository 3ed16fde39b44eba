//! Settlement Data Model
//!
//! Records shared by the scorer, calibrator, policy and backtest harness.
//! Fractions are parts-per-million (`1_000_000` = 100%) wherever they cross
//! the deterministic boundary; token quantities are in the smallest token unit.

use crate::error::{EngineError, EngineResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Fixed-point scale: 1,000,000 ppm = 100%.
pub const PPM_SCALE: u64 = 1_000_000;

/// One whole token (18 decimals).
pub const TOKEN: u128 = 1_000_000_000_000_000_000;

/// Parts-per-million value in `[0, PPM_SCALE]`.
pub type Ppm = u64;

/// Convert a probability to ppm, rounding to nearest and clamping to `[0, PPM_SCALE]`.
///
/// NaN maps to 0 so a broken estimate can never look confident.
pub fn ppm_from_probability(p: f64) -> Ppm {
    if p.is_nan() {
        return 0;
    }
    (p.clamp(0.0, 1.0) * PPM_SCALE as f64).round() as Ppm
}

/// Convert a lower confidence bound to ppm, rounding down.
///
/// A bound just under a threshold must stay under it once converted. The
/// small epsilon absorbs representation error so exact values like `0.997`
/// still map to `997_000`.
pub fn ppm_floor_from_probability(p: f64) -> Ppm {
    if p.is_nan() {
        return 0;
    }
    ((p.clamp(0.0, 1.0) * PPM_SCALE as f64 + 1e-9).floor() as Ppm).min(PPM_SCALE)
}

/// Convert ppm back to a probability.
pub fn probability_from_ppm(ppm: Ppm) -> f64 {
    ppm as f64 / PPM_SCALE as f64
}

// =============================================================================
// REDEMPTION CONTEXT
// =============================================================================

/// Context signals for a single redemption request.
///
/// Construct through [`RedemptionContext::new`] so the domain checks run
/// before any scoring arithmetic does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedemptionContext {
    /// Price volatility in ppm (10_000 = 1%).
    pub price_volatility: Ppm,
    /// Redemption amount in the smallest token unit.
    #[serde(with = "crate::serde_utils::u128_decimal")]
    pub amount: u128,
    /// Agent historical success rate in ppm.
    pub agent_success_rate: Ppm,
    /// Agent collateral stake in the smallest token unit.
    #[serde(with = "crate::serde_utils::u128_decimal")]
    pub agent_stake: u128,
    /// Hour of day, 0-23.
    pub hour_of_day: u8,
}

impl RedemptionContext {
    pub fn new(
        price_volatility: Ppm,
        amount: u128,
        agent_success_rate: Ppm,
        agent_stake: u128,
        hour_of_day: u8,
    ) -> EngineResult<Self> {
        let ctx = Self {
            price_volatility,
            amount,
            agent_success_rate,
            agent_stake,
            hour_of_day,
        };
        ctx.validate()?;
        Ok(ctx)
    }

    /// Re-check the documented domains. Deserialized contexts bypass `new`,
    /// so the scorer calls this again before touching the numbers.
    pub fn validate(&self) -> EngineResult<()> {
        if self.agent_success_rate > PPM_SCALE {
            return Err(EngineError::validation(
                "agent_success_rate",
                self.agent_success_rate,
                "must be in [0, 1000000] ppm",
            ));
        }
        if self.hour_of_day > 23 {
            return Err(EngineError::validation(
                "hour_of_day",
                self.hour_of_day,
                "must be in [0, 23]",
            ));
        }
        Ok(())
    }
}

// =============================================================================
// DECISION
// =============================================================================

/// Settlement action for a redemption.
///
/// The discriminants are the contract wire encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Decision {
    /// Wait for the external attestation.
    #[serde(rename = "QueueFDC")]
    QueueFdc = 0,
    /// Earmark buffer funds pending likely confirmation.
    BufferEarmark = 1,
    /// Pay out now against the insurance buffer.
    ProvisionalSettle = 2,
}

impl Decision {
    pub fn code(&self) -> u8 {
        *self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::QueueFdc),
            1 => Some(Self::BufferEarmark),
            2 => Some(Self::ProvisionalSettle),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::QueueFdc => "QueueFDC",
            Self::BufferEarmark => "BufferEarmark",
            Self::ProvisionalSettle => "ProvisionalSettle",
        }
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// SCORE RESULT
// =============================================================================

/// Multipliers applied by the deterministic scorer, kept for audit trails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub stability: Ppm,
    pub amount: Ppm,
    pub time: Ppm,
    pub agent: Ppm,
    /// Composite before the 100% cap.
    pub composite: u64,
}

/// Output of one deterministic scoring call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreResult {
    pub score: Ppm,
    pub confidence_lower: Ppm,
    pub confidence_upper: Ppm,
    pub can_provisional: bool,
    pub decision: Decision,
    pub breakdown: ScoreBreakdown,
}

// =============================================================================
// BACKTEST RECORDS
// =============================================================================

/// A historical prediction, as emitted at decision time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRecord {
    pub redemption_id: String,
    pub probability: f64,
    pub confidence_lower: f64,
    pub confidence_upper: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl PredictionRecord {
    pub fn new(
        redemption_id: impl Into<String>,
        probability: f64,
        confidence_lower: f64,
        confidence_upper: f64,
    ) -> Self {
        Self {
            redemption_id: redemption_id.into(),
            probability,
            confidence_lower,
            confidence_upper,
            timestamp: None,
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

/// The attested outcome of a redemption.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeRecord {
    pub redemption_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl OutcomeRecord {
    pub fn new(redemption_id: impl Into<String>, success: bool) -> Self {
        Self {
            redemption_id: redemption_id.into(),
            success,
            timestamp: None,
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}
