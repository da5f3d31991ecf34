//! Weighted-mean offset, linear-regression frequency estimate, and the
//! step-vs-slew decision (spec §4.7 "Steerer (Sigma)").
//!
//! The outlier filter and frequency smoothing reuse the median/MAD
//! statistics and the adaptive despiking already proven out in
//! [`crate::spike_filter`] (written for PTP drift-rate jitter); this module
//! applies them to the cross-sectional candidate set and to the
//! regression-derived slope the spec prescribes, rather than replacing them
//! with a second implementation of the same statistics.

use crate::error::SteeringError;
use crate::spike_filter::{FilterMode, SpikeFilter};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Spec §3: bounded history of the last 60 (timestamp, offset, delay)
/// samples fed to the frequency estimator.
const HISTORY_CAPACITY: usize = 60;
/// Spec §4.7: `|avg_offset| > 128 ms` ⇒ step.
const STEP_THRESHOLD_NS: i64 = 128_000_000;
/// Spec §4.7: clamp the frequency estimate to ±500 ppm.
const FREQUENCY_CLAMP_PPM: f64 = 500.0;
/// Spec §4.7: `f_new = 0.1·f_observed + 0.9·f_prev`.
const FREQUENCY_SMOOTHING_ALPHA: f64 = 0.1;

/// Outlier rejection strategy applied to a candidate sample set before
/// weighting (spec §4.7 "Outlier filter").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutlierPolicy {
    /// Reject samples deviating from the median by more than 3·MAD.
    Strict,
    /// Reject samples deviating from the median by more than 5·MAD.
    Moderate,
    /// Reject samples outside `[Q1 - 1.5·IQR, Q3 + 1.5·IQR]`.
    Relaxed,
}

/// One candidate offered to the steerer for a tick (spec §4.7 "Input").
#[derive(Debug, Clone, Copy)]
pub struct Candidate {
    pub offset_ns: i64,
    pub quality: u8,
    pub delay: Duration,
}

#[derive(Debug, Clone, Copy)]
struct HistoryEntry {
    at: Instant,
    offset_ns: i64,
    delay: Duration,
}

/// The correction the manager should apply (spec §4.7 "Step vs. slew").
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Adjustment {
    /// A discontinuous clock jump of `offset_ns` (applied via
    /// `clock_settime`-equivalent).
    Step { offset_ns: i64 },
    /// A frequency-only correction, in ppm.
    Slew { frequency_ppm: f64 },
}

pub struct Steerer {
    policy: OutlierPolicy,
    step_limit: Duration,
    history: VecDeque<HistoryEntry>,
    frequency_estimate_ppm: f64,
    spike_filter: SpikeFilter,
}

impl Steerer {
    pub fn new(policy: OutlierPolicy, step_limit: Duration) -> Steerer {
        Steerer {
            policy,
            step_limit,
            history: VecDeque::with_capacity(HISTORY_CAPACITY),
            frequency_estimate_ppm: 0.0,
            spike_filter: SpikeFilter::new(),
        }
    }

    pub fn frequency_estimate_ppm(&self) -> f64 {
        self.frequency_estimate_ppm
    }

    pub fn history(&self) -> impl Iterator<Item = (Instant, i64, Duration)> + '_ {
        self.history.iter().map(|e| (e.at, e.offset_ns, e.delay))
    }

    /// Runs one steering cycle over the given candidates: filters outliers,
    /// computes the weighted-mean offset, refuses it if it exceeds
    /// `step_limit` (spec §7 "never silently capped"), records it in the
    /// history, updates the frequency estimate, and returns the decided
    /// adjustment.
    pub fn apply(&mut self, candidates: &[Candidate]) -> Result<Adjustment, SteeringError> {
        let filtered = self.filter_outliers(candidates);
        let avg_offset_ns = weighted_mean_offset(&filtered)?;

        let step_limit_ns = self.step_limit.as_nanos().min(i64::MAX as u128) as i64;
        if avg_offset_ns.unsigned_abs() as i128 > step_limit_ns as i128 {
            return Err(SteeringError::OversizedCorrection {
                offset_ns: avg_offset_ns,
                step_limit_ns,
            });
        }

        let delay = filtered.first().map(|c| c.delay).unwrap_or(Duration::ZERO);
        push_bounded(
            &mut self.history,
            HistoryEntry {
                at: Instant::now(),
                offset_ns: avg_offset_ns,
                delay,
            },
            HISTORY_CAPACITY,
        );
        self.update_frequency_estimate();

        if avg_offset_ns.abs() > STEP_THRESHOLD_NS {
            Ok(Adjustment::Step { offset_ns: avg_offset_ns })
        } else {
            Ok(Adjustment::Slew {
                frequency_ppm: self.frequency_estimate_ppm,
            })
        }
    }

    /// Applies the configured outlier policy to `candidates`. If every
    /// sample would be rejected, retains the single sample closest to the
    /// median instead (spec §4.7).
    fn filter_outliers(&self, candidates: &[Candidate]) -> Vec<Candidate> {
        if candidates.len() < 2 {
            return candidates.to_vec();
        }

        let offsets: Vec<f64> = candidates.iter().map(|c| c.offset_ns as f64).collect();
        let median = median_of(&offsets);

        let kept: Vec<Candidate> = match self.policy {
            OutlierPolicy::Strict | OutlierPolicy::Moderate => {
                let mad = mad_of(&offsets, median);
                let k = if self.policy == OutlierPolicy::Strict { 3.0 } else { 5.0 };
                let threshold = k * mad;
                candidates
                    .iter()
                    .copied()
                    .filter(|c| (c.offset_ns as f64 - median).abs() <= threshold)
                    .collect()
            }
            OutlierPolicy::Relaxed => {
                let (q1, q3) = quartiles_of(&offsets);
                let iqr = q3 - q1;
                let lower = q1 - 1.5 * iqr;
                let upper = q3 + 1.5 * iqr;
                candidates
                    .iter()
                    .copied()
                    .filter(|c| {
                        let v = c.offset_ns as f64;
                        v >= lower && v <= upper
                    })
                    .collect()
            }
        };

        if kept.is_empty() {
            let closest = candidates
                .iter()
                .copied()
                .min_by(|a, b| {
                    let da = (a.offset_ns as f64 - median).abs();
                    let db = (b.offset_ns as f64 - median).abs();
                    da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
                })
                .expect("candidates is non-empty");
            vec![closest]
        } else {
            kept
        }
    }

    /// Computes the slope of offset vs. time (spec §4.7 "Frequency
    /// estimate") between the oldest and newest history entries, despikes
    /// it with the same MAD-based filter the teacher's drift-rate pipeline
    /// uses, then applies the spec's fixed exponential smoothing.
    fn update_frequency_estimate(&mut self) {
        if self.history.len() < 2 {
            return;
        }
        let first = self.history.front().expect("checked len >= 2");
        let last = self.history.back().expect("checked len >= 2");

        let dt_secs = last.at.saturating_duration_since(first.at).as_secs_f64();
        if dt_secs <= 0.0 {
            return;
        }

        let delta_ns = (last.offset_ns - first.offset_ns) as f64;
        // ns/s is dimensionless parts-per-billion; /1000 converts to ppm.
        let raw_ppm = delta_ns / 1000.0 / dt_secs;

        let despiked = self.spike_filter.filter(raw_ppm, FilterMode::Prod).value;
        let smoothed = FREQUENCY_SMOOTHING_ALPHA * despiked + (1.0 - FREQUENCY_SMOOTHING_ALPHA) * self.frequency_estimate_ppm;
        self.frequency_estimate_ppm = smoothed.clamp(-FREQUENCY_CLAMP_PPM, FREQUENCY_CLAMP_PPM);
    }
}

/// `w_i = (quality_i / 100) × exp(-delay_i_ms / 100)`; fails with
/// `ZeroTotalWeight` if every weight collapses to zero (spec §4.7).
fn weighted_mean_offset(candidates: &[Candidate]) -> Result<i64, SteeringError> {
    let mut weighted_sum = 0.0f64;
    let mut total_weight = 0.0f64;

    for c in candidates {
        let delay_ms = c.delay.as_secs_f64() * 1000.0;
        let weight = (c.quality as f64 / 100.0) * (-delay_ms / 100.0).exp();
        weighted_sum += weight * c.offset_ns as f64;
        total_weight += weight;
    }

    if total_weight <= 0.0 {
        return Err(SteeringError::ZeroTotalWeight);
    }

    Ok((weighted_sum / total_weight).round() as i64)
}

fn median_of(sorted_input: &[f64]) -> f64 {
    let mut values = sorted_input.to_vec();
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    percentile(&values, 0.5)
}

fn mad_of(values: &[f64], median: f64) -> f64 {
    let mut deviations: Vec<f64> = values.iter().map(|v| (v - median).abs()).collect();
    deviations.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    percentile(&deviations, 0.5)
}

fn quartiles_of(values: &[f64]) -> (f64, f64) {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    (percentile(&sorted, 0.25), percentile(&sorted, 0.75))
}

/// Linear-interpolated percentile over an already-sorted slice.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    if sorted.len() == 1 {
        return sorted[0];
    }
    let rank = p * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    if lower == upper {
        sorted[lower]
    } else {
        let frac = rank - lower as f64;
        sorted[lower] * (1.0 - frac) + sorted[upper] * frac
    }
}

fn push_bounded<T>(buf: &mut VecDeque<T>, value: T, capacity: usize) {
    if buf.len() == capacity {
        buf.pop_front();
    }
    buf.push_back(value);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(offset_ns: i64, quality: u8, delay_us: u64) -> Candidate {
        Candidate {
            offset_ns,
            quality,
            delay: Duration::from_micros(delay_us),
        }
    }

    #[test]
    fn weighted_mean_favors_higher_quality_lower_delay() {
        let candidates = [candidate(10_000_000, 250, 100), candidate(-10_000_000, 50, 10_000)];
        let avg = weighted_mean_offset(&candidates).unwrap();
        assert!(avg > 0, "higher-quality, lower-delay candidate should dominate, got {avg}");
    }

    #[test]
    fn weighted_mean_rejects_zero_total_weight() {
        let candidates = [candidate(1_000, 0, 0)];
        assert!(matches!(weighted_mean_offset(&candidates), Err(SteeringError::ZeroTotalWeight)));
    }

    #[test]
    fn strict_policy_rejects_far_outlier() {
        let steerer = Steerer::new(OutlierPolicy::Strict, Duration::from_secs(900));
        let candidates = [
            candidate(100, 200, 500),
            candidate(120, 200, 500),
            candidate(110, 200, 500),
            candidate(50_000_000, 200, 500),
        ];
        let kept = steerer.filter_outliers(&candidates);
        assert!(kept.iter().all(|c| c.offset_ns < 1_000_000));
    }

    #[test]
    fn relaxed_policy_uses_iqr_bounds() {
        let steerer = Steerer::new(OutlierPolicy::Relaxed, Duration::from_secs(900));
        let candidates = [candidate(100, 200, 500), candidate(110, 200, 500), candidate(105, 200, 500), candidate(98, 200, 500)];
        let kept = steerer.filter_outliers(&candidates);
        assert_eq!(kept.len(), candidates.len());
    }

    #[test]
    fn outlier_filter_keeps_closest_to_median_when_all_rejected() {
        let steerer = Steerer::new(OutlierPolicy::Strict, Duration::from_secs(900));
        let candidates = [candidate(0, 200, 500), candidate(1_000_000_000, 200, 500)];
        let kept = steerer.filter_outliers(&candidates);
        assert_eq!(kept.len(), 1);
    }

    #[test]
    fn step_vs_slew_threshold_matches_spec() {
        let mut steerer = Steerer::new(OutlierPolicy::Strict, Duration::from_secs(900));
        let step_candidates = [candidate(200_000_000, 240, 500)];
        assert!(matches!(
            steerer.apply(&step_candidates).unwrap(),
            Adjustment::Step { .. }
        ));

        let mut steerer = Steerer::new(OutlierPolicy::Strict, Duration::from_secs(900));
        let slew_candidates = [candidate(100_000_000, 240, 500)];
        assert!(matches!(
            steerer.apply(&slew_candidates).unwrap(),
            Adjustment::Slew { .. }
        ));
    }

    #[test]
    fn offset_equal_to_step_limit_is_applied_strictly_greater_is_refused() {
        let mut at_limit = Steerer::new(OutlierPolicy::Strict, Duration::from_millis(50));
        assert!(at_limit.apply(&[candidate(50_000_000, 240, 500)]).is_ok());

        let mut over_limit = Steerer::new(OutlierPolicy::Strict, Duration::from_millis(50));
        assert!(matches!(
            over_limit.apply(&[candidate(50_000_001, 240, 500)]),
            Err(SteeringError::OversizedCorrection { .. })
        ));
    }

    #[test]
    fn median_and_quartiles_match_known_values() {
        let values = vec![1.0, 2.0, 3.0, 4.0];
        assert!((median_of(&values) - 2.5).abs() < 1e-9);
        let (q1, q3) = quartiles_of(&values);
        assert!((q1 - 1.75).abs() < 1e-9);
        assert!((q3 - 3.25).abs() < 1e-9);
    }
}
