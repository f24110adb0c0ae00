//! # Compare-RS: Spike Train Comparison
//!
//! Scores how well a simulated voltage trace reproduces a recorded one.
//!
//! A comparison works on three traces of the scored window:
//! - the recorded (target) voltage
//! - the free-running model voltage
//! - the single-step model voltage, forced to the recording before each step
//!
//! Before any measure runs, a validity gate rejects diverging or implausibly
//! spiking models with an infinite score. Each [`Measure`] then yields a raw
//! error which is normalized to `[0, 1]` and combined into one fitness value
//! (lower is better).
//!
//! Reference: Jolivet, R. et al. (2008). A benchmark test for a quantitative
//! assessment of simple neuron models. J. Neurosci. Methods 169, 417-424.

use serde::{Deserialize, Serialize};
use spikerecon_core::SPIKE_RECOGNITION;
use std::fmt;
use tracing::{debug, trace};

// ============================================================================
// SPIKE EXTRACTION
// ============================================================================

/// Indices of the spike peaks of a voltage trace.
///
/// A spike starts when the voltage reaches [`SPIKE_RECOGNITION`]; its index
/// is the last sample before the voltage first decreases. Detection re-arms
/// only after the voltage drops back below the threshold. An excursion that
/// is still rising at the end of the trace is not reported.
pub fn to_spike_indices(trace: &[f64]) -> Vec<usize> {
    let mut indices = Vec::new();
    let mut i = 0;

    while i < trace.len() {
        if trace[i] >= SPIKE_RECOGNITION {
            let mut last = trace[i];
            i += 1;
            while i < trace.len() {
                if trace[i] < last {
                    indices.push(i - 1);
                    break;
                }
                last = trace[i];
                i += 1;
            }
            while i < trace.len() && trace[i] >= SPIKE_RECOGNITION {
                i += 1;
            }
        } else {
            i += 1;
        }
    }

    indices
}

/// Number of above-threshold samples within four steps after the end of
/// each supra-threshold excursion. Large counts mean the neuron keeps firing
/// instead of resetting.
pub fn count_continuous_spikes(trace: &[f64]) -> usize {
    let len = trace.len();
    let mut continuous = 0;
    let mut i = 0;

    while i < len {
        if trace[i] >= SPIKE_RECOGNITION {
            if let Some(j) = ((i + 1)..len).find(|&j| trace[j] < SPIKE_RECOGNITION) {
                i = j + 1;
            }
            continuous += ((i + 1)..len.min(i + 5))
                .filter(|&j| trace[j] > SPIKE_RECOGNITION)
                .count();
        }
        i += 1;
    }

    continuous
}

/// Clamp to `[min, max]` and rescale to `[0, 1]`. Exact zero becomes 1e-8 so
/// a perfect measure never erases the others in a weighted sum.
pub fn normalize(value: f64, min: f64, max: f64) -> f64 {
    let x = (value.clamp(min, max) - min) / (max - min);
    if x == 0.0 {
        1e-8
    } else {
        x
    }
}

// ============================================================================
// RAW MEASURES
// ============================================================================

const SPIKE_TIME_SAMPLING: f64 = 1000.0;
const SPIKE_TIME_WINDOW: f64 = 25e-3;
const SPIKE_FREQUENCY_SAMPLING: f64 = 2000.0;

fn firing_rate(spikes: &[usize], sampling: f64) -> f64 {
    let span = (spikes[spikes.len() - 1] - spikes[0]).max(1);
    sampling * (spikes.len() as f64 - 1.0) / span as f64
}

/// Inverted gamma coincidence factor, 0 for identical trains.
///
/// Returns 0 when both trains are empty and 0.8 when only one is.
pub fn spike_time_error(target: &[usize], model: &[usize]) -> f64 {
    match (target.is_empty(), model.is_empty()) {
        (true, true) => return 0.0,
        (true, false) | (false, true) => return 0.8,
        _ => {}
    }

    let delta_bins = SPIKE_TIME_WINDOW * SPIKE_TIME_SAMPLING;
    let n_model = model.len();
    let n_target = target.len();

    let freq_model = firing_rate(model, SPIKE_TIME_SAMPLING);
    let coincidences_expected = 2.0 * SPIKE_TIME_WINDOW * n_target as f64 * freq_model;
    let norm = 1.0 - 2.0 * freq_model * SPIKE_TIME_WINDOW;

    // Greedy pass: a hit advances the target pointer and keeps scanning the
    // remaining model spikes.
    let mut coincidences = 0.0;
    let mut i = 0;
    while i < n_target {
        let mut j = 0;
        while j < n_model {
            if (model[j] as f64 - target[i] as f64).abs() <= delta_bins {
                coincidences += 1.0;
                i += 1;
                if i >= n_target {
                    break;
                }
            }
            j += 1;
        }
        i += 1;
    }

    let mut gamma =
        (coincidences - coincidences_expected) / (0.5 * (n_model + n_target) as f64) / norm;
    trace!(gamma, coincidences, "spike time coincidence");
    if gamma <= 0.0 {
        gamma = 1e-13;
    } else if gamma >= 1.0 {
        gamma = 0.9999999999999;
    }
    1.0 - gamma
}

/// Squared difference of the mean firing rates, 1000 when either train is
/// empty.
pub fn spike_frequency_error(target: &[usize], model: &[usize]) -> f64 {
    if target.is_empty() || model.is_empty() {
        return 1000.0;
    }
    let diff = firing_rate(model, SPIKE_FREQUENCY_SAMPLING)
        - firing_rate(target, SPIKE_FREQUENCY_SAMPLING);
    diff * diff
}

/// Mean squared error over the first `length` samples
pub fn mean_squared_error(target: &[f64], model: &[f64], length: usize) -> f64 {
    let sum: f64 = target
        .iter()
        .zip(model)
        .take(length)
        .map(|(t, m)| (t - m) * (t - m))
        .sum();
    (1.0 / length as f64) * sum
}

// ============================================================================
// MEASURES
// ============================================================================

/// Comparison criteria that can be combined into a fitness value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Measure {
    /// Spike timing coincidence within a 25 ms window
    SpikeTime,
    /// Difference of mean firing rates
    SpikeFrequency,
    /// Voltage error of the free-running simulation
    VoltageOverall,
    /// Voltage error of the one-step-ahead prediction
    VoltageSingle,
}

impl Measure {
    pub const ALL: [Measure; 4] = [
        Measure::SpikeTime,
        Measure::SpikeFrequency,
        Measure::VoltageOverall,
        Measure::VoltageSingle,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Measure::SpikeTime => "spike-time",
            Measure::SpikeFrequency => "spike-frequency",
            Measure::VoltageOverall => "voltage-overall",
            Measure::VoltageSingle => "voltage-single",
        }
    }

    /// Range over which the raw error is normalized
    pub fn range(&self) -> (f64, f64) {
        match self {
            Measure::SpikeTime => (0.0, 1.0),
            Measure::SpikeFrequency => (1.0, 5000.0),
            Measure::VoltageOverall | Measure::VoltageSingle => (0.0, 1000.0),
        }
    }

    pub fn raw(&self, trains: &SpikeTrains<'_>) -> f64 {
        match self {
            Measure::SpikeTime => spike_time_error(&trains.target_spikes, &trains.model_spikes),
            Measure::SpikeFrequency => {
                spike_frequency_error(&trains.target_spikes, &trains.model_spikes)
            }
            Measure::VoltageOverall => {
                mean_squared_error(trains.target, trains.model, trains.length)
            }
            Measure::VoltageSingle => {
                mean_squared_error(trains.target, trains.single_step, trains.length)
            }
        }
    }

    pub fn normalize(&self, raw: f64) -> f64 {
        let (min, max) = self.range();
        normalize(raw, min, max)
    }
}

impl fmt::Display for Measure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A measure together with its weight in the fitness sum
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WeightedMeasure {
    pub measure: Measure,
    pub weight: f64,
}

impl WeightedMeasure {
    pub fn new(measure: Measure, weight: f64) -> Self {
        Self { measure, weight }
    }
}

/// All four measures with weight 1, which selects rank-based weighting
pub fn balanced_measures() -> Vec<WeightedMeasure> {
    Measure::ALL.iter().map(|&m| WeightedMeasure::new(m, 1.0)).collect()
}

/// All four measures with one manual weight each
pub fn weighted_measures(
    spike_time: f64,
    spike_frequency: f64,
    voltage_overall: f64,
    voltage_single: f64,
) -> Vec<WeightedMeasure> {
    vec![
        WeightedMeasure::new(Measure::SpikeTime, spike_time),
        WeightedMeasure::new(Measure::SpikeFrequency, spike_frequency),
        WeightedMeasure::new(Measure::VoltageOverall, voltage_overall),
        WeightedMeasure::new(Measure::VoltageSingle, voltage_single),
    ]
}

// ============================================================================
// SCORING
// ============================================================================

/// Traces of one scored window plus their spike indices
#[derive(Debug, Clone)]
pub struct SpikeTrains<'a> {
    target: &'a [f64],
    model: &'a [f64],
    single_step: &'a [f64],
    length: usize,
    target_spikes: Vec<usize>,
    model_spikes: Vec<usize>,
}

impl<'a> SpikeTrains<'a> {
    pub fn new(target: &'a [f64], model: &'a [f64], single_step: &'a [f64]) -> Self {
        Self {
            target,
            model,
            single_step,
            length: target.len().min(model.len()).min(single_step.len()),
            target_spikes: to_spike_indices(target),
            model_spikes: to_spike_indices(model),
        }
    }

    pub fn target_spikes(&self) -> &[usize] {
        &self.target_spikes
    }

    pub fn model_spikes(&self) -> &[usize] {
        &self.model_spikes
    }

    /// Number of samples shared by all three traces
    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Validity gate: finite model, plausible spike count, and no runaway
    /// continuous firing compared to the recording.
    pub fn is_valid(&self) -> bool {
        if self.model[..self.length].iter().any(|v| !v.is_finite()) {
            return false;
        }

        let model_count = self.model_spikes.len();
        let target_count = self.target_spikes.len();
        if (model_count <= target_count / 3 || model_count > target_count * 3)
            && model_count != target_count
        {
            return false;
        }

        let model_continuous = count_continuous_spikes(self.model);
        let target_continuous = count_continuous_spikes(self.target);
        if target_continuous > 0 {
            model_continuous <= target_continuous * 5
        } else {
            model_continuous <= target_count / 5
        }
    }
}

/// Raw and normalized value of one measure
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MeasureValue {
    pub measure: Measure,
    pub raw: f64,
    pub normalized: f64,
}

pub fn evaluate_measures(
    trains: &SpikeTrains<'_>,
    measures: &[WeightedMeasure],
) -> Vec<MeasureValue> {
    measures
        .iter()
        .map(|wm| {
            let raw = wm.measure.raw(trains);
            let normalized = wm.measure.normalize(raw);
            debug!(measure = wm.measure.name(), raw, normalized, "measure");
            MeasureValue {
                measure: wm.measure,
                raw,
                normalized,
            }
        })
        .collect()
}

/// Weighted mean of normalized measure values.
///
/// When every weight is exactly 1 the weights are derived from the values:
/// sorted ascending, the i-th smallest gets weight 2^i, so the worst measure
/// dominates. Otherwise the given weights are used as they are.
pub fn aggregate(values: &[f64], measures: &[WeightedMeasure]) -> f64 {
    let automatic = measures.iter().all(|m| m.weight == 1.0);

    let (error_sum, weight_sum) = if automatic {
        let mut sorted = values.to_vec();
        sorted.sort_by(f64::total_cmp);
        sorted
            .iter()
            .enumerate()
            .fold((0.0, 0.0), |(error, total), (i, v)| {
                let weight = 2f64.powi(i as i32);
                (error + v * weight, total + weight)
            })
    } else {
        values
            .iter()
            .zip(measures)
            .fold((0.0, 0.0), |(error, total), (v, m)| (error + v * m.weight, total + m.weight))
    };

    let score = error_sum / weight_sum;
    debug!(automatic, score, error_sum, "aggregated fitness");
    score
}

/// Fitness of a model trace against a recording, `+inf` when the model
/// fails the validity gate.
pub fn score(
    target: &[f64],
    model: &[f64],
    single_step: &[f64],
    measures: &[WeightedMeasure],
) -> f64 {
    let trains = SpikeTrains::new(target, model, single_step);
    if !trains.is_valid() {
        trace!(
            target_spikes = trains.target_spikes.len(),
            model_spikes = trains.model_spikes.len(),
            "model rejected by validity gate"
        );
        return f64::INFINITY;
    }

    let values: Vec<f64> = evaluate_measures(&trains, measures)
        .into_iter()
        .map(|v| v.normalized)
        .collect();
    aggregate(&values, measures)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// Resting trace with a three-sample spike peaking at each given index
    fn spiking_trace(len: usize, peaks: &[usize]) -> Vec<f64> {
        let mut trace = vec![-65.0; len];
        for &p in peaks {
            trace[p - 1] = 10.0;
            trace[p] = 35.0;
            trace[p + 1] = -70.0;
        }
        trace
    }

    #[test]
    fn test_constant_trace_has_no_spikes() {
        assert!(to_spike_indices(&[-65.0; 100]).is_empty());
        assert!(to_spike_indices(&[]).is_empty());
    }

    #[test]
    fn test_single_pulse() {
        let trace = [-70.0, -70.0, 5.0, 20.0, 35.0, 10.0, -60.0, -70.0];
        assert_eq!(to_spike_indices(&trace), vec![4]);
    }

    #[test]
    fn test_plateau_counts_once() {
        // Rises, dips while above threshold, rises again, then drops
        let trace = [-60.0, 10.0, 30.0, 20.0, 25.0, 28.0, -50.0, 5.0, 12.0, -40.0];
        assert_eq!(to_spike_indices(&trace), vec![2, 8]);
    }

    #[test]
    fn test_rising_tail_is_ignored() {
        let trace = [-60.0, -40.0, 5.0, 15.0, 25.0];
        assert!(to_spike_indices(&trace).is_empty());
    }

    #[test]
    fn test_continuous_spikes() {
        let clean = spiking_trace(50, &[10, 30]);
        assert_eq!(count_continuous_spikes(&clean), 0);

        // Fires again right after the reset
        let mut bursting = clean.clone();
        bursting[13] = 5.0;
        bursting[14] = 6.0;
        assert_eq!(count_continuous_spikes(&bursting), 2);
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize(0.0, 0.0, 1.0), 1e-8);
        assert_eq!(normalize(-3.0, 0.0, 1000.0), 1e-8);
        assert_eq!(normalize(500.0, 0.0, 1000.0), 0.5);
        assert_eq!(normalize(9000.0, 1.0, 5000.0), 1.0);
        assert!(normalize(f64::NAN, 0.0, 1.0).is_nan());
    }

    #[test]
    fn test_spike_time_identical_trains() {
        let spikes = [100, 300, 500];
        let error = spike_time_error(&spikes, &spikes);
        assert!(error < 1e-12);
    }

    #[test]
    fn test_spike_time_empty_trains() {
        assert_eq!(spike_time_error(&[], &[]), 0.0);
        assert_eq!(spike_time_error(&[10], &[]), 0.8);
        assert_eq!(spike_time_error(&[], &[10]), 0.8);
    }

    #[test]
    fn test_spike_time_misses() {
        let target = [100, 300, 500];
        let far = [200, 400, 600];
        let close = [110, 290, 520];
        assert!(spike_time_error(&target, &far) > spike_time_error(&target, &close));
        assert!(spike_time_error(&target, &far) < 1.0);
    }

    #[test]
    fn test_spike_frequency() {
        assert_eq!(spike_frequency_error(&[], &[1, 2]), 1000.0);
        assert_eq!(spike_frequency_error(&[10, 20, 30], &[110, 120, 130]), 0.0);

        // 2000 * 2 / 20 = 200 against 2000 * 2 / 40 = 100
        assert_eq!(spike_frequency_error(&[0, 10, 20], &[0, 20, 40]), 10000.0);
    }

    #[test]
    fn test_mean_squared_error_uses_common_length() {
        let target = [1.0, 2.0, 3.0, 100.0];
        let model = [1.0, 4.0, 3.0];
        assert!((mean_squared_error(&target, &model, 3) - 4.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_validity_rejects_non_finite() {
        let target = spiking_trace(60, &[10, 30, 50]);
        let mut model = target.clone();
        model[20] = f64::NAN;
        assert!(!SpikeTrains::new(&target, &model, &target).is_valid());
        assert_eq!(score(&target, &model, &target, &balanced_measures()), f64::INFINITY);
    }

    #[test]
    fn test_validity_spike_count() {
        let target = spiking_trace(200, &[10, 30, 50, 70, 90, 110]);

        let too_few = spiking_trace(200, &[10, 30]);
        assert!(!SpikeTrains::new(&target, &too_few, &target).is_valid());

        let enough = spiking_trace(200, &[10, 30, 50]);
        assert!(SpikeTrains::new(&target, &enough, &target).is_valid());

        let silent = vec![-65.0; 200];
        assert!(SpikeTrains::new(&silent, &silent, &silent).is_valid());
    }

    #[test]
    fn test_validity_continuous_spiking() {
        let target = spiking_trace(200, &[10, 60, 110, 160]);
        let mut model = target.clone();
        // Keeps firing after the first spike
        for v in model.iter_mut().skip(13).take(4) {
            *v = 5.0;
        }
        assert_eq!(count_continuous_spikes(&target), 0);
        assert!(count_continuous_spikes(&model) > 0);
        assert!(!SpikeTrains::new(&target, &model, &target).is_valid());
    }

    /// Spikes every 20 steps from step 10; the first `bursts` of them fire one
    /// extra sample shortly after the reset
    fn bursting_trace(spikes: usize, bursts: usize) -> Vec<f64> {
        let peaks: Vec<usize> = (0..spikes).map(|k| 10 + 20 * k).collect();
        let mut trace = spiking_trace(20 * spikes + 20, &peaks);
        for &p in peaks.iter().take(bursts) {
            trace[p + 3] = 5.0;
        }
        trace
    }

    #[test]
    fn test_validity_relative_to_target_continuous_spikes() {
        let target = bursting_trace(8, 1);
        assert_eq!(count_continuous_spikes(&target), 1);
        assert!(SpikeTrains::new(&target, &target, &target).is_valid());

        let at_limit = bursting_trace(8, 5);
        assert_eq!(count_continuous_spikes(&at_limit), 5);
        assert!(SpikeTrains::new(&target, &at_limit, &target).is_valid());

        let beyond = bursting_trace(8, 6);
        assert_eq!(count_continuous_spikes(&beyond), 6);
        assert!(!SpikeTrains::new(&target, &beyond, &target).is_valid());
    }

    #[test]
    fn test_validity_without_target_continuous_spikes() {
        // Fewer than five target spikes tolerate no continuous firing at all
        let sparse = bursting_trace(3, 0);
        let single_burst = bursting_trace(3, 1);
        assert_eq!(count_continuous_spikes(&sparse), 0);
        assert_eq!(count_continuous_spikes(&single_burst), 1);
        assert!(!SpikeTrains::new(&sparse, &single_burst, &sparse).is_valid());

        // Ten target spikes tolerate two
        let dense = bursting_trace(10, 0);
        let two_bursts = bursting_trace(10, 2);
        let three_bursts = bursting_trace(10, 3);
        assert!(SpikeTrains::new(&dense, &two_bursts, &dense).is_valid());
        assert!(!SpikeTrains::new(&dense, &three_bursts, &dense).is_valid());
    }

    #[test]
    fn test_automatic_weights() {
        let measures = balanced_measures();
        let values = [0.4, 0.1, 0.2, 0.8];
        // Sorted 0.1, 0.2, 0.4, 0.8 with weights 1, 2, 4, 8
        let expected = (0.1 + 0.4 + 1.6 + 6.4) / 15.0;
        assert!((aggregate(&values, &measures) - expected).abs() < 1e-12);
    }

    #[test]
    fn test_manual_weights() {
        let measures = weighted_measures(5.0, 1.0, 1.0, 1.0);
        let values = [0.2, 0.4, 0.6, 0.8];
        let expected = (1.0 + 0.4 + 0.6 + 0.8) / 8.0;
        assert!((aggregate(&values, &measures) - expected).abs() < 1e-12);
    }

    #[test]
    fn test_perfect_model_scores_near_zero() {
        let target = spiking_trace(300, &[20, 90, 160, 230]);
        let fitness = score(&target, &target, &target, &balanced_measures());
        assert!(fitness.is_finite());
        assert!(fitness < 1e-6);
    }

    #[test]
    fn test_worse_model_scores_higher() {
        let target = spiking_trace(300, &[20, 90, 160, 230]);
        let shifted = spiking_trace(300, &[40, 110, 180, 250]);
        let measures = balanced_measures();
        let shifted_score = score(&target, &shifted, &shifted, &measures);
        assert!(shifted_score > score(&target, &target, &target, &measures));
    }

    #[test]
    fn test_measure_serde() {
        let json =
            serde_json::to_string(&WeightedMeasure::new(Measure::VoltageSingle, 5.0)).unwrap();
        assert!(json.contains("voltage-single"));
        let back: WeightedMeasure = serde_json::from_str(&json).unwrap();
        assert_eq!(back.measure, Measure::VoltageSingle);
    }

    proptest! {
        #[test]
        fn prop_spike_indices_are_supra_threshold_and_increasing(
            trace in proptest::collection::vec(-80.0f64..40.0, 0..200)
        ) {
            let spikes = to_spike_indices(&trace);
            for pair in spikes.windows(2) {
                prop_assert!(pair[0] < pair[1]);
            }
            for &i in &spikes {
                prop_assert!(trace[i] >= SPIKE_RECOGNITION);
                prop_assert!(trace[i + 1] < trace[i]);
            }
        }

        #[test]
        fn prop_normalized_values_in_unit_range(raw in -1e6f64..1e6) {
            for measure in Measure::ALL {
                let v = measure.normalize(raw);
                prop_assert!(v > 0.0 && v <= 1.0);
            }
        }
    }
}
