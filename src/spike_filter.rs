//! Adaptive Spike Detection Filter
//!
//! This module implements robust outlier detection for PTP drift rate measurements.
//!
//! ## The Problem
//! Software timestamps on Windows/Linux have jitter from:
//! - OS scheduler preemption
//! - Network interrupt latency
//! - Memory/cache effects
//!
//! This jitter appears as "spikes" in the measured drift rate, but these are NOT
//! real frequency changes. Real crystal oscillator frequency changes are physically
//! limited by thermal inertia (~0.04 ppm/°C, thermal time constant 10-60s).
//!
//! ## The Solution
//! Use Median Absolute Deviation (MAD) for robust outlier detection:
//! - MAD is resistant to outliers (unlike standard deviation)
//! - Self-calibrating to each computer's noise profile
//! - Mode-aware thresholds (stricter in LOCK/NANO modes)
//!
//! ## Algorithm
//! 1. Maintain rolling window of recent drift rate samples
//! 2. Calculate median and MAD of window
//! 3. Sample is "spike" if deviation > k * MAD
//! 4. k varies by mode: permissive in ACQ, strict in NANO
//! 5. Spikes are replaced with median (a real observed value)

use log::debug;
use std::collections::VecDeque;

// ============================================================================
// SPIKE FILTER CONSTANTS
// ============================================================================
// k values based on robust statistics (MAD multipliers):
// k=3: catches 99% of Gaussian outliers
// We use higher values to be conservative and only reject clear spikes

/// ACQ mode: Permissive threshold to allow fast convergence
const K_ACQ: f64 = 4.0;
/// PROD mode: Balanced protection
const K_PROD: f64 = 5.0;
/// LOCK mode: Strict threshold to protect locked state
const K_LOCK: f64 = 6.0;
/// NANO mode: Very strict threshold for ultra-stable operation
const K_NANO: f64 = 8.0;

/// Default rolling window size (~20 seconds at 1 sample/sec)
const DEFAULT_WINDOW_SIZE: usize = 20;
/// Minimum MAD floor to prevent over-sensitivity on ultra-stable systems (µs/s)
const MIN_MAD_FLOOR: f64 = 0.5;
/// Minimum samples before spike detection activates
const WARMUP_SAMPLES: usize = 5;
/// Accept as real step change after this many consecutive "spikes"
const MAX_CONSECUTIVE_SPIKES: usize = 5;

/// Operating mode for threshold selection
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FilterMode {
    /// Acquisition: Fast convergence, permissive filtering
    Acq,
    /// Production: Balanced filtering
    Prod,
    /// Locked: Protect stability, strict filtering
    Lock,
    /// Nano: Ultra-precise, very strict filtering
    Nano,
}

/// Adaptive spike detection filter using MAD (Median Absolute Deviation)
#[derive(Debug)]
pub struct SpikeFilter {
    /// Rolling window of rate samples (µs/s)
    rate_history: VecDeque<f64>,

    /// Maximum window size
    window_size: usize,

    /// Threshold multipliers for each mode
    /// Higher k = more permissive (fewer rejections)
    k_acq: f64,
    k_prod: f64,
    k_lock: f64,
    k_nano: f64,

    /// Minimum MAD floor to prevent issues on super-stable systems
    min_mad: f64,

    /// Minimum samples before spike detection activates
    warmup_samples: usize,

    /// Consecutive spike counter (for detecting real step changes)
    consecutive_spikes: usize,

    /// Maximum consecutive spikes before accepting as real
    max_consecutive_spikes: usize,

    /// Statistics
    total_samples: u64,
    rejected_spikes: u64,

    /// Last computed statistics (for debugging/status)
    last_median: f64,
    last_mad: f64,
    last_threshold: f64,
}

/// Result of filtering a sample
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilterResult {
    /// The value to use (filtered or original)
    pub value: f64,
    /// Whether this sample was detected as a spike
    pub is_spike: bool,
    /// The deviation from median (for logging)
    pub deviation: f64,
    /// The threshold used (for logging)
    pub threshold: f64,
    /// Current median of window
    pub median: f64,
    /// Current MAD of window
    pub mad: f64,
}

impl Default for SpikeFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl SpikeFilter {
    /// Create a new spike filter with default parameters
    ///
    /// Default parameters are tuned for typical PTP drift-rate sync:
    /// - 20 sample window (~20 seconds at 1 sample/sec)
    /// - MAD floor of 0.5 µs/s (prevents issues on ultra-stable systems)
    /// - Mode-dependent k values for appropriate sensitivity
    pub fn new() -> Self {
        Self {
            rate_history: VecDeque::with_capacity(DEFAULT_WINDOW_SIZE + 5),
            window_size: DEFAULT_WINDOW_SIZE,

            k_acq: K_ACQ,
            k_prod: K_PROD,
            k_lock: K_LOCK,
            k_nano: K_NANO,

            min_mad: MIN_MAD_FLOOR,
            warmup_samples: WARMUP_SAMPLES,

            consecutive_spikes: 0,
            max_consecutive_spikes: MAX_CONSECUTIVE_SPIKES,

            total_samples: 0,
            rejected_spikes: 0,

            last_median: 0.0,
            last_mad: 0.0,
            last_threshold: 0.0,
        }
    }

    /// Create a spike filter with custom window size
    pub fn with_window_size(window_size: usize) -> Self {
        let mut filter = Self::new();
        filter.window_size = window_size.max(WARMUP_SAMPLES); // Minimum for valid statistics
        filter.rate_history = VecDeque::with_capacity(window_size + 5);
        filter
    }

    /// Filter a raw rate sample, returning filtered value and spike info
    ///
    /// # Arguments
    /// * `raw_rate` - Raw drift rate in µs/s (equivalent to ppm)
    /// * `mode` - Current operating mode (affects threshold)
    ///
    /// # Returns
    /// FilterResult with the value to use and diagnostic info
    pub fn filter(&mut self, raw_rate: f64, mode: FilterMode) -> FilterResult {
        self.total_samples += 1;

        // Add to history
        self.rate_history.push_back(raw_rate);
        if self.rate_history.len() > self.window_size {
            self.rate_history.pop_front();
        }

        // During warmup, pass through without filtering
        if self.rate_history.len() < self.warmup_samples {
            return FilterResult {
                value: raw_rate,
                is_spike: false,
                deviation: 0.0,
                threshold: f64::MAX,
                median: raw_rate,
                mad: 0.0,
            };
        }

        // Calculate median
        let mut sorted: Vec<f64> = self.rate_history.iter().cloned().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let median = sorted[sorted.len() / 2];

        // Calculate MAD (Median Absolute Deviation)
        let mut deviations: Vec<f64> = sorted.iter().map(|&x| (x - median).abs()).collect();
        deviations.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let mad = deviations[deviations.len() / 2];

        // Apply minimum MAD floor
        let effective_mad = mad.max(self.min_mad);

        // Get threshold multiplier based on mode
        let k = match mode {
            FilterMode::Acq => self.k_acq,
            FilterMode::Prod => self.k_prod,
            FilterMode::Lock => self.k_lock,
            FilterMode::Nano => self.k_nano,
        };

        // Calculate spike threshold
        let threshold = k * effective_mad;

        // Store for debugging
        self.last_median = median;
        self.last_mad = mad;
        self.last_threshold = threshold;

        // Check if this is a spike
        let deviation = (raw_rate - median).abs();
        let is_spike = deviation > threshold;

        let filtered_value = if is_spike {
            self.consecutive_spikes += 1;

            // If too many consecutive "spikes", accept as real step change
            if self.consecutive_spikes >= self.max_consecutive_spikes {
                debug!(
                    "[Spike] Accepting step change after {} consecutive: {:+.1}us/s",
                    self.consecutive_spikes, raw_rate
                );
                self.consecutive_spikes = 0;
                raw_rate // Accept the value
            } else {
                self.rejected_spikes += 1;
                debug!(
                    "[Spike] Rejected: {:+.1}us/s (median={:+.1}, MAD={:.2}, k={:.1}, threshold={:.1})",
                    raw_rate, median, mad, k, threshold
                );
                median // Replace with median
            }
        } else {
            // Good sample, reset consecutive counter
            self.consecutive_spikes = 0;
            raw_rate
        };

        FilterResult {
            value: filtered_value,
            is_spike,
            deviation,
            threshold,
            median,
            mad,
        }
    }

    /// Get spike rejection statistics
    pub fn stats(&self) -> (u64, u64, f64) {
        let ratio = if self.total_samples > 0 {
            self.rejected_spikes as f64 / self.total_samples as f64 * 100.0
        } else {
            0.0
        };
        (self.total_samples, self.rejected_spikes, ratio)
    }

    /// Get last computed statistics
    pub fn last_stats(&self) -> (f64, f64, f64) {
        (self.last_median, self.last_mad, self.last_threshold)
    }

    /// Clear history (call after NTP step or major event)
    pub fn clear(&mut self) {
        self.rate_history.clear();
        self.consecutive_spikes = 0;
        self.last_median = 0.0;
        self.last_mad = 0.0;
        self.last_threshold = 0.0;
    }

    /// Get current window size
    pub fn window_len(&self) -> usize {
        self.rate_history.len()
    }
}

// ============================================================================
// JITTER ESTIMATOR - Adaptive EMA Smoothing for Noisy Systems
// ============================================================================

/// Jitter estimator for adaptive EMA smoothing
///
/// Measures the standard deviation of drift rate samples to detect
/// high-jitter systems (like those with Realtek NICs) and adjust
/// the EMA smoothing factor accordingly.
///
/// ## Design Principles
/// 1. **Conservative activation**: Only reduces α when jitter clearly high
/// 2. **Gradual adjustment**: Linear interpolation, no sudden jumps
/// 3. **Reversible**: α increases back when jitter decreases
/// 4. **No interference with spike filter**: Measures variance, not outliers
#[derive(Debug)]
pub struct JitterEstimator {
    /// Rolling window of rate samples for jitter estimation
    rate_history: VecDeque<f64>,

    /// Window size for jitter calculation
    window_size: usize,

    /// Minimum samples before jitter estimation is valid
    min_samples: usize,

    /// Jitter threshold below which no smoothing adjustment (µs/s)
    jitter_low: f64,

    /// Jitter threshold above which maximum smoothing applied (µs/s)
    jitter_high: f64,

    /// Normal EMA alpha (used when jitter is low)
    alpha_normal: f64,

    /// Smoothed EMA alpha (used when jitter is high)
    alpha_smooth: f64,

    /// Last computed jitter (stddev)
    last_jitter: f64,

    /// Last computed adaptive alpha
    last_alpha: f64,
}

impl JitterEstimator {
    /// Create a new jitter estimator with default parameters
    pub fn new() -> Self {
        Self {
            rate_history: VecDeque::with_capacity(30),
            window_size: 30,   // 30 samples (~30 seconds)
            min_samples: 15,   // Need at least 15 for valid estimate
            jitter_low: 2.0,   // Below this: α = 0.3 (normal)
            jitter_high: 8.0,  // Above this: α = 0.1 (heavily smoothed)
            alpha_normal: 0.3, // Standard EMA alpha
            alpha_smooth: 0.1, // Smoothed EMA alpha for noisy systems
            last_jitter: 0.0,
            last_alpha: 0.3, // Default to normal alpha
        }
    }

    /// Create with custom parameters (for testing)
    #[cfg(test)]
    pub fn with_params(
        window_size: usize,
        min_samples: usize,
        jitter_low: f64,
        jitter_high: f64,
    ) -> Self {
        Self {
            rate_history: VecDeque::with_capacity(window_size),
            window_size,
            min_samples,
            jitter_low,
            jitter_high,
            alpha_normal: 0.3,
            alpha_smooth: 0.1,
            last_jitter: 0.0,
            last_alpha: 0.3,
        }
    }

    /// Add a rate sample and compute adaptive alpha
    ///
    /// Returns the EMA alpha to use for this sample:
    /// - 0.3 for low-jitter systems (normal responsiveness)
    /// - 0.1-0.3 for medium-jitter systems (interpolated)
    /// - 0.1 for high-jitter systems (heavy smoothing)
    pub fn add_sample(&mut self, rate: f64) -> f64 {
        // Add to history
        self.rate_history.push_back(rate);
        if self.rate_history.len() > self.window_size {
            self.rate_history.pop_front();
        }

        // Not enough samples yet - use normal alpha
        if self.rate_history.len() < self.min_samples {
            self.last_alpha = self.alpha_normal;
            return self.alpha_normal;
        }

        // Calculate jitter (standard deviation)
        let jitter = self.calculate_stddev();
        self.last_jitter = jitter;

        // Compute adaptive alpha based on jitter level
        let alpha = self.compute_alpha(jitter);
        self.last_alpha = alpha;

        alpha
    }

    /// Calculate standard deviation of rate samples
    fn calculate_stddev(&self) -> f64 {
        if self.rate_history.is_empty() {
            return 0.0;
        }

        let n = self.rate_history.len() as f64;
        let mean: f64 = self.rate_history.iter().sum::<f64>() / n;
        let variance: f64 = self
            .rate_history
            .iter()
            .map(|x| (x - mean).powi(2))
            .sum::<f64>()
            / n;
        variance.sqrt()
    }

    /// Compute adaptive alpha based on jitter level
    fn compute_alpha(&self, jitter: f64) -> f64 {
        if jitter <= self.jitter_low {
            // Low jitter: use normal alpha (full responsiveness)
            self.alpha_normal
        } else if jitter >= self.jitter_high {
            // High jitter: use smooth alpha (heavy smoothing)
            self.alpha_smooth
        } else {
            // Medium jitter: linear interpolation
            let t = (jitter - self.jitter_low) / (self.jitter_high - self.jitter_low);
            self.alpha_normal - t * (self.alpha_normal - self.alpha_smooth)
        }
    }

    /// Get last computed jitter (stddev)
    pub fn last_jitter(&self) -> f64 {
        self.last_jitter
    }

    /// Get last computed adaptive alpha
    pub fn last_alpha(&self) -> f64 {
        self.last_alpha
    }

    /// Clear history (call after NTP step or major event)
    pub fn clear(&mut self) {
        self.rate_history.clear();
        self.last_jitter = 0.0;
        self.last_alpha = self.alpha_normal;
    }

    /// Get current sample count
    pub fn sample_count(&self) -> usize {
        self.rate_history.len()
    }
}

impl Default for JitterEstimator {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// TESTS
// ============================================================================
