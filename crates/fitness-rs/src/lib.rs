//! # Fitness-RS: Candidate Evaluation
//!
//! Evaluates one candidate neuron against a recorded network.
//!
//! The recording is split at the tuning index:
//! 1. **Tuning**: the recovery variable is driven along the recorded voltage
//!    up to the split, so only the parameters have to be guessed.
//! 2. **Weight reconstruction**: incoming weights are the least-squares
//!    solution of the voltage updates after the split.
//! 3. **Traces**: a one-step-ahead trace (voltage forced to the recording
//!    before every step) and a free-running trace are simulated.
//! 4. **Scoring**: both traces are compared with the recording by
//!    [`spikerecon_compare::score`].
//!
//! Candidates whose score is not finite are replaced by fresh random
//! candidates until a valid one is found or the resample budget runs out.

use ndarray::{s, Array1, Array2};
use rand::Rng;
use serde::{Deserialize, Serialize};
use spikerecon_compare::{score, WeightedMeasure};
use spikerecon_core::{
    solve_linear_system, NeuronState, ObservedData, ReconError, ReconstructionMode, SPIKE_RESET,
};
use std::cmp::Ordering;
use thiserror::Error;
use tracing::{trace, warn};

#[derive(Error, Debug)]
pub enum FitnessError {
    #[error(transparent)]
    Core(#[from] ReconError),
    #[error("Neuron {0} is not part of a network of {1} neurons")]
    UnknownNeuron(usize, usize),
    #[error("No fitness measures configured")]
    NoMeasures,
}

pub type Result<T> = std::result::Result<T, FitnessError>;

// ============================================================================
// EVALUATION CONTEXT
// ============================================================================

/// Read-only inputs shared by every evaluation of one neuron
#[derive(Debug, Clone)]
pub struct EvaluationContext<'a> {
    data: &'a ObservedData,
    neuron: usize,
    dt: f64,
    tuning_split: usize,
    mode: ReconstructionMode,
    measures: &'a [WeightedMeasure],
    max_resamples: usize,
    target: Vec<f64>,
}

impl<'a> EvaluationContext<'a> {
    pub fn new(
        data: &'a ObservedData,
        neuron: usize,
        dt: f64,
        tuning_split: usize,
        mode: ReconstructionMode,
        measures: &'a [WeightedMeasure],
        max_resamples: usize,
    ) -> Result<Self> {
        if neuron >= data.num_neurons() {
            return Err(FitnessError::UnknownNeuron(neuron, data.num_neurons()));
        }
        if measures.is_empty() {
            return Err(FitnessError::NoMeasures);
        }
        if !dt.is_finite() || dt <= 0.0 {
            let message = format!("dt must be positive, got {}", dt);
            return Err(ReconError::InvalidConfig(message).into());
        }
        data.validate_split(tuning_split)?;

        let target = data.voltage().slice(s![tuning_split.., neuron]).to_vec();

        Ok(Self {
            data,
            neuron,
            dt,
            tuning_split,
            mode,
            measures,
            max_resamples,
            target,
        })
    }

    pub fn data(&self) -> &ObservedData {
        self.data
    }

    pub fn neuron(&self) -> usize {
        self.neuron
    }

    pub fn dt(&self) -> f64 {
        self.dt
    }

    pub fn tuning_split(&self) -> usize {
        self.tuning_split
    }

    pub fn mode(&self) -> ReconstructionMode {
        self.mode
    }

    /// Recorded voltage of the neuron from the split onwards
    pub fn target(&self) -> &[f64] {
        &self.target
    }
}

// ============================================================================
// TUNING AND TRACES
// ============================================================================

/// Copy of `state` with `u` driven along the recording up to the split and
/// `v` set to the recorded voltage at the split.
pub fn tune(state: &NeuronState, ctx: &EvaluationContext<'_>) -> NeuronState {
    let voltage = ctx.data.voltage();
    let current = ctx.data.current();
    let n = ctx.neuron;

    let mut tuned = state.clone();
    tuned.u = tuned.start_u;
    for t in 1..ctx.tuning_split {
        tuned.v = voltage[[t, n]];
        tuned.step_network(ctx.dt, voltage.row(t - 1), current[[t, n]]);
    }
    tuned.v = voltage[[ctx.tuning_split, n]];
    tuned
}

/// One-step-ahead predictions: before each step the voltage is reset to the
/// recording. Entry `j` is the voltage after the step at `split + j`.
pub fn single_step_trace(state: &NeuronState, ctx: &EvaluationContext<'_>) -> Vec<f64> {
    let voltage = ctx.data.voltage();
    let current = ctx.data.current();
    let n = ctx.neuron;

    let mut model = state.clone();
    (ctx.tuning_split..ctx.data.timesteps())
        .map(|t| {
            model.v = voltage[[t, n]];
            model.step_network(ctx.dt, voltage.row(t - 1), current[[t, n]]);
            model.v
        })
        .collect()
}

/// Simulation from the recorded voltage at the split without any further
/// forcing. Other neurons still couple in through their recorded voltages.
pub fn free_running_trace(state: &NeuronState, ctx: &EvaluationContext<'_>) -> Vec<f64> {
    let voltage = ctx.data.voltage();
    let current = ctx.data.current();
    let n = ctx.neuron;

    let mut model = state.clone();
    model.v = voltage[[ctx.tuning_split, n]];
    (ctx.tuning_split..ctx.data.timesteps())
        .map(|t| {
            model.step_network(ctx.dt, voltage.row(t - 1), current[[t, n]]);
            model.v
        })
        .collect()
}

// ============================================================================
// WEIGHT RECONSTRUCTION
// ============================================================================

/// Replace the weights of a tuned state by the least-squares fit of the
/// recorded voltage updates after the split.
///
/// For every step `t` at which the neuron did not spike at `t-1`, the part of
/// the update not explained by the neuron's own dynamics must equal the sum
/// of the weights of the neurons that spiked at `t-1`. The normal equations
/// of these constraints are solved by Gaussian elimination.
///
/// Networks with a single neuron and recordings shorter than two samples are
/// left untouched.
pub fn reconstruct_weights(state: &mut NeuronState, ctx: &EvaluationContext<'_>) -> Result<()> {
    let voltage = ctx.data.voltage();
    let current = ctx.data.current();
    let steps = voltage.nrows();
    let neurons = voltage.ncols();
    if steps < 2 || neurons < 2 {
        return Ok(());
    }

    let n = ctx.neuron;
    let split = ctx.tuning_split;
    let dt = ctx.dt;
    // Spike vector of step t, taken from the recording at t-1
    let spiked = |t: usize, k: usize| if voltage[[t - 1, k]] >= SPIKE_RESET { 1.0 } else { 0.0 };

    // Recovery variable and voltage update without synaptic input
    let mut u_guess = vec![0.0; steps];
    let mut v_factor = vec![0.0; steps];
    u_guess[split] = state.u;
    for t in (split + 1)..steps {
        let v_prev = voltage[[t - 1, n]];
        u_guess[t] = if spiked(t - 1, n) != 0.0 {
            u_guess[t - 1] + state.d
        } else {
            u_guess[t - 1] + dt * state.a * (state.b * v_prev - u_guess[t - 1])
        };
        v_factor[t] = v_prev
            + dt * (state.p1 * v_prev * v_prev + state.p2 * v_prev + state.p3 - u_guess[t - 1]);
    }

    let mut matrix = Array2::<f64>::zeros((neurons, neurons));
    let mut rhs = Array1::<f64>::zeros(neurons);
    let mut spikes = Array1::<f64>::zeros(neurons);
    for t in (split + 1)..steps {
        if voltage[[t - 1, n]] >= SPIKE_RESET {
            continue;
        }

        let residual = 1.0 / dt * (voltage[[t, n]] - v_factor[t]) - current[[t - 1, n]];
        for k in 0..neurons {
            spikes[k] = spiked(t, k);
        }
        for i in 0..neurons {
            rhs[i] += 1.0 / dt * spikes[i] * residual;
            for j in 0..neurons {
                matrix[[i, j]] += 1.0 / dt * spikes[i] * spikes[j];
            }
        }
    }

    let mut weights = solve_linear_system(&mut matrix, &mut rhs)?;
    // The own column never carries a constraint
    weights[n] = 0.0;
    state.weights = weights;
    Ok(())
}

// ============================================================================
// INDIVIDUAL
// ============================================================================

/// A candidate neuron and its fitness (lower is better)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Individual {
    pub state: NeuronState,
    pub fitness: f64,
}

impl Individual {
    /// Unevaluated individual, fitness `+inf`
    pub fn new(state: NeuronState) -> Self {
        Self {
            state,
            fitness: f64::INFINITY,
        }
    }

    pub fn random<R: Rng + ?Sized>(
        mode: ReconstructionMode,
        rng: &mut R,
        num_neurons: usize,
        neuron_index: usize,
    ) -> Self {
        Self::new(NeuronState::random_for_mode(mode, rng, num_neurons, neuron_index))
    }

    pub fn is_valid(&self) -> bool {
        self.fitness.is_finite()
    }

    /// Tune, reconstruct weights and score this individual.
    ///
    /// The evaluated state replaces the candidate, so afterwards `u` and `v`
    /// hold their values at the split and the weights are reconstructed.
    /// A non-finite score discards the candidate for a fresh random one.
    /// Returns the number of replacements that were needed.
    pub fn evaluate<R: Rng + ?Sized>(
        &mut self,
        ctx: &EvaluationContext<'_>,
        rng: &mut R,
    ) -> Result<usize> {
        let mut resamples = 0;
        loop {
            let mut tuned = tune(&self.state, ctx);
            reconstruct_weights(&mut tuned, ctx)?;
            let single = single_step_trace(&tuned, ctx);
            let free = free_running_trace(&tuned, ctx);

            let fitness = score(&ctx.target, &free, &single, ctx.measures);
            self.state = tuned;
            self.fitness = if fitness.is_finite() { fitness } else { f64::INFINITY };

            if self.is_valid() {
                trace!(neuron = ctx.neuron, fitness, resamples, "evaluated individual");
                return Ok(resamples);
            }
            if resamples >= ctx.max_resamples {
                warn!(
                    neuron = ctx.neuron,
                    resamples, "no valid candidate within resample budget"
                );
                return Ok(resamples);
            }

            resamples += 1;
            self.state =
                NeuronState::random_for_mode(ctx.mode, rng, ctx.data.num_neurons(), ctx.neuron);
        }
    }
}

// Individuals order by fitness alone
impl PartialEq for Individual {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Individual {}

impl PartialOrd for Individual {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Individual {
    fn cmp(&self, other: &Self) -> Ordering {
        self.fitness.total_cmp(&other.fitness)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use spikerecon_compare::balanced_measures;
    use spikerecon_core::{SyntheticConfig, SyntheticNetwork};

    const STANDARD: ReconstructionMode = ReconstructionMode::Standard;

    fn single_neuron_network() -> SyntheticNetwork {
        SyntheticNetwork::generate(&SyntheticConfig {
            seed: 18,
            num_neurons: 1,
            timesteps: 1000,
            dt: 0.1,
            tuning_split: 500,
            noise: false,
        })
        .unwrap()
    }

    #[test]
    fn test_context_validation() {
        let network = single_neuron_network();
        let measures = balanced_measures();
        let data = &network.data;

        assert!(EvaluationContext::new(data, 0, 0.1, 500, STANDARD, &measures, 10).is_ok());
        assert!(matches!(
            EvaluationContext::new(data, 1, 0.1, 500, ReconstructionMode::Standard, &measures, 10),
            Err(FitnessError::UnknownNeuron(1, 1))
        ));
        assert!(matches!(
            EvaluationContext::new(data, 0, 0.1, 500, ReconstructionMode::Standard, &[], 10),
            Err(FitnessError::NoMeasures)
        ));
        assert!(EvaluationContext::new(data, 0, 0.1, 1000, STANDARD, &measures, 10).is_err());
        assert!(EvaluationContext::new(data, 0, 0.0, 500, STANDARD, &measures, 10).is_err());
    }

    #[test]
    fn test_tuning_recovers_ground_truth_u() {
        let network = single_neuron_network();
        let measures = balanced_measures();
        let ctx = EvaluationContext::new(&network.data, 0, 0.1, 500, STANDARD, &measures, 10)
            .unwrap();

        let truth = &network.ground_truth[0];
        let mut guess = truth.clone();
        guess.u = 1234.0;

        let tuned = tune(&guess, &ctx);
        assert!((tuned.u - truth.u).abs() < 1e-9);
        assert_eq!(tuned.v, network.data.voltage()[[500, 0]]);
        assert_eq!(tuned.start_u, truth.start_u);
    }

    #[test]
    fn test_free_running_trace_follows_recording() {
        let network = single_neuron_network();
        let measures = balanced_measures();
        let ctx = EvaluationContext::new(&network.data, 0, 0.1, 500, STANDARD, &measures, 10)
            .unwrap();

        let tuned = tune(&network.ground_truth[0], &ctx);
        let free = free_running_trace(&tuned, &ctx);
        let single = single_step_trace(&tuned, &ctx);
        assert_eq!(free.len(), 500);
        assert_eq!(single.len(), 500);

        // Each entry is the voltage after one step, i.e. the next recorded sample
        let voltage = network.data.voltage();
        for j in 0..499 {
            assert!((free[j] - voltage[[501 + j, 0]]).abs() < 1e-6);
            assert!((single[j] - voltage[[501 + j, 0]]).abs() < 1e-6);
        }
    }

    #[test]
    fn test_single_neuron_weights_untouched() {
        let network = single_neuron_network();
        let measures = balanced_measures();
        let ctx = EvaluationContext::new(&network.data, 0, 0.1, 500, STANDARD, &measures, 10)
            .unwrap();

        let mut state = tune(&network.ground_truth[0], &ctx);
        reconstruct_weights(&mut state, &ctx).unwrap();
        assert_eq!(state.weights.len(), 1);
        assert_eq!(state.weights[0], 0.0);
    }

    /// Two neurons where the recorded updates of neuron 0 follow the
    /// reconstruction equations exactly with a weight of 2.5 from neuron 1.
    /// The leak keeps neuron 0 far below the reset voltage.
    #[test]
    fn test_weight_reconstruction_exact_system() {
        let steps = 200;
        let split = 50;
        let dt = 0.1;
        let weight = 2.5;

        let state = NeuronState {
            neuron_index: 0,
            a: 0.02,
            b: 0.0,
            c: -65.0,
            d: 8.0,
            p1: 0.0,
            p2: -1.0,
            p3: 0.0,
            p4: 1.0,
            v: 0.0,
            u: -10.0,
            start_u: -10.0,
            weights: Array1::zeros(2),
        };

        let mut voltage = Array2::from_elem((steps, 2), -60.0);
        let mut current = Array2::zeros((steps, 2));
        for t in 0..steps {
            // Presynaptic neuron peaks every seventh step
            voltage[[t, 1]] = if t % 7 == 0 { 35.0 } else { -65.0 };
            current[[t, 0]] = if t % 3 == 0 { 1.5 } else { 0.0 };
        }

        let measures = balanced_measures();
        let prefix = ObservedData::new(current.clone(), voltage.clone()).unwrap();
        let ctx = EvaluationContext::new(&prefix, 0, dt, split, STANDARD, &measures, 0).unwrap();
        let tuned = tune(&state, &ctx);

        let mut u = tuned.u;
        for t in (split + 1)..steps {
            let v_prev = voltage[[t - 1, 0]];
            let u_prev = u;
            u = u_prev + dt * state.a * (state.b * v_prev - u_prev);
            let v_factor = v_prev + dt * (state.p2 * v_prev - u_prev);
            let spike = if voltage[[t - 1, 1]] >= SPIKE_RESET { 1.0 } else { 0.0 };
            voltage[[t, 0]] = v_factor + dt * (current[[t - 1, 0]] + weight * spike);
        }

        let data = ObservedData::new(current, voltage).unwrap();
        let ctx = EvaluationContext::new(&data, 0, dt, split, STANDARD, &measures, 0).unwrap();
        let mut tuned = tune(&state, &ctx);
        reconstruct_weights(&mut tuned, &ctx).unwrap();

        assert_eq!(tuned.weights[0], 0.0);
        assert!((tuned.weights[1] - weight).abs() < 1e-8);
    }

    #[test]
    fn test_ground_truth_is_valid() {
        let network = single_neuron_network();
        let measures = balanced_measures();
        let ctx = EvaluationContext::new(&network.data, 0, 0.1, 500, STANDARD, &measures, 0)
            .unwrap();

        let mut individual = Individual::new(network.ground_truth[0].clone());
        let mut rng = StdRng::seed_from_u64(1);
        let resamples = individual.evaluate(&ctx, &mut rng).unwrap();

        assert_eq!(resamples, 0);
        assert!(individual.is_valid());
        assert_eq!(individual.state.start_u, network.ground_truth[0].start_u);
    }

    #[test]
    fn test_random_individual_ends_valid() {
        let network = single_neuron_network();
        let measures = balanced_measures();
        let ctx = EvaluationContext::new(
            &network.data,
            0,
            0.1,
            500,
            ReconstructionMode::Standard,
            &measures,
            100_000,
        )
        .unwrap();

        let mut rng = StdRng::seed_from_u64(4);
        for _ in 0..5 {
            let mut individual = Individual::random(ReconstructionMode::Standard, &mut rng, 1, 0);
            individual.evaluate(&ctx, &mut rng).unwrap();
            assert!(individual.is_valid());
            assert!(individual.fitness > 0.0 && individual.fitness <= 1.0);
        }
    }

    #[test]
    fn test_resample_budget() {
        // A diverging recording makes every candidate invalid
        let voltage = Array2::from_elem((20, 1), f64::NAN);
        let data = ObservedData::new(Array2::zeros((20, 1)), voltage).unwrap();
        let measures = balanced_measures();
        let ctx = EvaluationContext::new(&data, 0, 0.1, 10, STANDARD, &measures, 3).unwrap();

        let mut rng = StdRng::seed_from_u64(9);
        let mut individual = Individual::random(ReconstructionMode::Standard, &mut rng, 1, 0);
        assert_eq!(individual.evaluate(&ctx, &mut rng).unwrap(), 3);
        assert_eq!(individual.fitness, f64::INFINITY);
        assert!(!individual.is_valid());
    }

    #[test]
    fn test_individuals_sort_by_fitness() {
        let mut rng = StdRng::seed_from_u64(2);
        let mut population: Vec<Individual> = [0.5, f64::INFINITY, 0.1, 0.3]
            .iter()
            .map(|&fitness| Individual {
                fitness,
                ..Individual::random(ReconstructionMode::Standard, &mut rng, 1, 0)
            })
            .collect();
        population.sort();

        let order: Vec<f64> = population.iter().map(|i| i.fitness).collect();
        assert_eq!(order, vec![0.1, 0.3, 0.5, f64::INFINITY]);
    }
}
