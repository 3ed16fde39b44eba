//! Backtest metrics.
//!
//! Decision/outcome confusion counts and the rates derived from them. Every
//! ratio with an empty denominator is reported as 0, never NaN.

use crate::models::Decision;
use serde::{Deserialize, Serialize};

/// Confusion counts over joined (decision, outcome) rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeCounts {
    pub total: usize,
    /// Provisionally settled, then succeeded.
    pub true_positive: usize,
    /// Provisionally settled, then failed (insurance payout).
    pub false_positive: usize,
    /// Queued, but would have succeeded (opportunity cost).
    pub false_negative: usize,
    /// Queued, and failed.
    pub correctly_queued: usize,
    pub buffered_success: usize,
    pub buffered_failure: usize,
}

impl OutcomeCounts {
    pub fn record(&mut self, decision: Decision, success: bool) {
        self.total += 1;
        match (decision, success) {
            (Decision::ProvisionalSettle, true) => self.true_positive += 1,
            (Decision::ProvisionalSettle, false) => self.false_positive += 1,
            (Decision::QueueFdc, true) => self.false_negative += 1,
            (Decision::QueueFdc, false) => self.correctly_queued += 1,
            (Decision::BufferEarmark, true) => self.buffered_success += 1,
            (Decision::BufferEarmark, false) => self.buffered_failure += 1,
        }
    }

    pub fn provisional_count(&self) -> usize {
        self.true_positive + self.false_positive
    }

    pub fn queued_count(&self) -> usize {
        self.false_negative + self.correctly_queued
    }

    pub fn buffered_count(&self) -> usize {
        self.buffered_success + self.buffered_failure
    }
}

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

/// Backtest result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestMetrics {
    pub counts: OutcomeCounts,
    pub provisional_count: usize,
    /// Rows left waiting for attestation.
    pub queued_count: usize,
    pub buffered_count: usize,
    /// `(tp + correctly_queued) / total`; drives `meets_target`.
    pub accuracy: f64,
    /// Fraction of rows where the implied prediction matched the outcome
    /// (settle/buffer imply success, queue implies failure).
    pub outcome_accuracy: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    /// Share of provisional settlements that fell back on insurance.
    pub insurance_utilization: f64,
    /// Share of redemptions settled without waiting for attestation.
    pub latency_reduction: f64,
    pub target_accuracy: f64,
    pub meets_target: bool,
}

impl BacktestMetrics {
    pub fn from_counts(counts: OutcomeCounts, target_accuracy: f64) -> Self {
        let provisional_count = counts.provisional_count();
        let accuracy = ratio(counts.true_positive + counts.correctly_queued, counts.total);
        let outcome_accuracy = ratio(
            counts.true_positive + counts.buffered_success + counts.correctly_queued,
            counts.total,
        );
        let precision = ratio(counts.true_positive, provisional_count);
        let recall = ratio(
            counts.true_positive,
            counts.true_positive + counts.false_negative,
        );
        let f1 = if precision + recall > 0.0 {
            2.0 * precision * recall / (precision + recall)
        } else {
            0.0
        };

        Self {
            counts,
            provisional_count,
            queued_count: counts.queued_count(),
            buffered_count: counts.buffered_count(),
            accuracy,
            outcome_accuracy,
            precision,
            recall,
            f1,
            insurance_utilization: ratio(counts.false_positive, provisional_count),
            latency_reduction: ratio(provisional_count, counts.total),
            target_accuracy,
            meets_target: counts.total > 0 && accuracy >= target_accuracy,
        }
    }

    /// All-zero metrics for an empty joined dataset.
    pub fn empty(target_accuracy: f64) -> Self {
        Self::from_counts(OutcomeCounts::default(), target_accuracy)
    }

    pub fn is_empty(&self) -> bool {
        self.counts.total == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_tp_one_fp() {
        let mut counts = OutcomeCounts::default();
        counts.record(Decision::ProvisionalSettle, true);
        counts.record(Decision::ProvisionalSettle, false);
        let m = BacktestMetrics::from_counts(counts, 0.997);
        assert_eq!(m.precision, 0.5);
        assert_eq!(m.recall, 1.0);
        assert!((m.f1 - 2.0 / 3.0).abs() < 1e-12);
        assert_eq!(m.insurance_utilization, 0.5);
        assert_eq!(m.latency_reduction, 1.0);
        assert_eq!(m.accuracy, 0.5);
        assert!(!m.meets_target);
    }

    #[test]
    fn test_empty_is_all_zero() {
        let m = BacktestMetrics::empty(0.997);
        assert!(m.is_empty());
        for v in [
            m.accuracy,
            m.outcome_accuracy,
            m.precision,
            m.recall,
            m.f1,
            m.insurance_utilization,
            m.latency_reduction,
        ] {
            assert_eq!(v, 0.0);
        }
        assert!(!m.meets_target);
    }

    #[test]
    fn test_buffered_rows_only_in_totals() {
        let mut counts = OutcomeCounts::default();
        counts.record(Decision::BufferEarmark, true);
        counts.record(Decision::BufferEarmark, false);
        counts.record(Decision::QueueFdc, false);
        let m = BacktestMetrics::from_counts(counts, 0.5);
        assert_eq!(m.counts.total, 3);
        assert_eq!(m.provisional_count, 0);
        assert_eq!(m.queued_count, 1);
        assert_eq!(m.buffered_count, 2);
        assert_eq!(m.precision, 0.0);
        assert_eq!(m.recall, 0.0);
        assert!((m.accuracy - 1.0 / 3.0).abs() < 1e-12);
        assert!((m.outcome_accuracy - 2.0 / 3.0).abs() < 1e-12);
    }
}
