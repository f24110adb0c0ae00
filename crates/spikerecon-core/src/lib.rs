//! # SpikeRecon Core
//!
//! Shared types for reconstructing the hidden parameters of spiking neuron
//! networks from recorded membrane potentials and injected currents.
//!
//! ## Neuron Model
//!
//! Every neuron follows a generalized Izhikevich model in which the discrete
//! threshold-and-reset rule is replaced by a steep smooth surrogate:
//!
//! ```text
//! h   = 1 / (1 - exp(10000 (30 - v)))
//! v'  = v (1 - h) + c h            u'  = u + d h
//! v'' = v' + dt (p1 v'^2 + p2 v' + p3 - u' + p4 I)
//! u'' = u' + dt a (b v' - u')
//! ```
//!
//! The input `I` of a coupled neuron is its external current plus the sum of
//! the synaptic weights of every neuron whose previous voltage was at or above
//! [`SPIKE_RECOGNITION`].
//!
//! ## Contents
//!
//! - [`NeuronState`] single and network steps
//! - [`ReconstructionMode`] parameter bounds used by the search
//! - [`ObservedData`] current/voltage recordings indexed `[time, neuron]`
//! - [`solve_linear_system`] Gaussian elimination with partial pivoting
//! - [`SyntheticNetwork`] ground-truth data generation

use ndarray::{s, Array1, Array2, ArrayView1};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::debug;

/// Common errors
#[derive(Debug, Error)]
pub enum ReconError {
    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, ReconError>;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Voltage (mV) at which the reset surrogate switches on
pub const SPIKE_RESET: f64 = 30.0;

/// Voltage (mV) at or above which a neuron counts as spiking
pub const SPIKE_RECOGNITION: f64 = 0.0;

/// Share of presynaptic indices (highest indices first) that are inhibitory
pub const PERCENTAGE_INHIBITORY_WEIGHTS: f64 = 0.3;

/// Replacement for an exactly zero pivot during elimination
pub const PIVOT_EPSILON: f64 = 1e-20;

const RESET_STEEPNESS: f64 = 10000.0;

// ============================================================================
// PARAMETER BOUNDS
// ============================================================================

/// Closed range for a single model parameter
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min: f64,
    pub max: f64,
}

impl Bounds {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub const fn fixed(value: f64) -> Self {
        Self { min: value, max: value }
    }

    /// Uniform draw in `[min, max)`. Fixed bounds still consume one draw so
    /// that the random stream does not depend on which parameters are fixed.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        self.min + (self.max - self.min) * rng.gen::<f64>()
    }

    pub fn is_fixed(&self) -> bool {
        self.min == self.max
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }

    pub fn width(&self) -> f64 {
        self.max - self.min
    }
}

/// The eight parameters touched by crossover and mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Parameter {
    A,
    B,
    C,
    D,
    P1,
    P2,
    P3,
    StartU,
}

impl Parameter {
    pub const ALL: [Parameter; 8] = [
        Parameter::A,
        Parameter::B,
        Parameter::C,
        Parameter::D,
        Parameter::P1,
        Parameter::P2,
        Parameter::P3,
        Parameter::StartU,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Parameter::A => "a",
            Parameter::B => "b",
            Parameter::C => "c",
            Parameter::D => "d",
            Parameter::P1 => "p1",
            Parameter::P2 => "p2",
            Parameter::P3 => "p3",
            Parameter::StartU => "startU",
        }
    }
}

/// Min/max pair for every model parameter and for the recovery variable
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParameterBounds {
    pub a: Bounds,
    pub b: Bounds,
    pub c: Bounds,
    pub d: Bounds,
    pub p1: Bounds,
    pub p2: Bounds,
    pub p3: Bounds,
    pub p4: Bounds,
    pub u: Bounds,
}

impl ParameterBounds {
    /// Bounds of a searchable parameter. `startU` shares the range of `u`.
    pub fn of(&self, parameter: Parameter) -> Bounds {
        match parameter {
            Parameter::A => self.a,
            Parameter::B => self.b,
            Parameter::C => self.c,
            Parameter::D => self.d,
            Parameter::P1 => self.p1,
            Parameter::P2 => self.p2,
            Parameter::P3 => self.p3,
            Parameter::StartU => self.u,
        }
    }
}

/// Bounds used to create ground-truth neurons for synthetic datasets
pub const GENERATION_BOUNDS: ParameterBounds = ParameterBounds {
    a: Bounds::new(0.01, 0.1),
    b: Bounds::new(0.05, 0.3),
    c: Bounds::new(-65.0, -40.0),
    d: Bounds::new(0.05, 8.0),
    p1: Bounds::fixed(0.04),
    p2: Bounds::fixed(5.0),
    p3: Bounds::fixed(140.0),
    p4: Bounds::fixed(1.0),
    u: Bounds::new(-30.0, 30.0),
};

pub const V_START_GENERATION: Bounds = Bounds::new(-75.0, -50.0);
pub const WEIGHT_GENERATION: Bounds = Bounds::new(0.0, 9.99999);
pub const INPUT_GENERATION: Bounds = Bounds::fixed(30.0);
pub const NOISE_V_GENERATION: Bounds = Bounds::new(-2.0, 2.0);
pub const NOISE_INPUT_GENERATION: Bounds = Bounds::new(-0.1, 0.1);

/// Parameter ranges explored by the reconstruction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReconstructionMode {
    /// Classic Izhikevich ranges with the quadratic coefficients fixed
    #[default]
    Standard,
    /// Wide ranges with free quadratic coefficients
    Extended,
    /// Literature values for a single cortical neuron
    SingleNeuron,
}

impl ReconstructionMode {
    pub const ALL: [ReconstructionMode; 3] = [
        ReconstructionMode::Standard,
        ReconstructionMode::Extended,
        ReconstructionMode::SingleNeuron,
    ];

    pub fn bounds(&self) -> ParameterBounds {
        match self {
            ReconstructionMode::Standard => GENERATION_BOUNDS,
            ReconstructionMode::Extended => ParameterBounds {
                a: Bounds::new(-1.0, 1.0),
                b: Bounds::new(-1.0, 1.0),
                c: Bounds::new(-65.0, -30.0),
                d: Bounds::new(-2.0, 10.0),
                p1: Bounds::new(0.01, 0.1),
                p2: Bounds::new(1.0, 15.0),
                p3: Bounds::new(108.0, 150.0),
                p4: Bounds::fixed(1.0),
                u: Bounds::new(-20.0, 15.0),
            },
            ReconstructionMode::SingleNeuron => ParameterBounds {
                a: Bounds::new(0.01, 0.1),
                b: Bounds::new(-0.1, 0.3),
                c: Bounds::new(-65.0, -30.0),
                d: Bounds::new(0.05, 8.0),
                p1: Bounds::fixed(0.04),
                p2: Bounds::fixed(4.1),
                p3: Bounds::fixed(108.0),
                p4: Bounds::fixed(1.0),
                u: Bounds::new(-20.0, 15.0),
            },
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ReconstructionMode::Standard => "standard",
            ReconstructionMode::Extended => "extended",
            ReconstructionMode::SingleNeuron => "single-neuron",
        }
    }
}

impl fmt::Display for ReconstructionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ReconstructionMode {
    type Err = ReconError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|mode| mode.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| {
                ReconError::InvalidConfig(format!("unknown reconstruction mode '{}'", s))
            })
    }
}

// ============================================================================
// NEURON STATE
// ============================================================================

/// Parameters, state and incoming weights of one neuron in a network
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NeuronState {
    /// Index of this neuron in the network
    pub neuron_index: usize,
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub d: f64,
    pub p1: f64,
    pub p2: f64,
    pub p3: f64,
    pub p4: f64,
    /// Membrane potential (mV)
    pub v: f64,
    /// Recovery variable
    pub u: f64,
    /// Initial guess of `u`, kept after tuning overwrites `u`
    pub start_u: f64,
    /// Incoming weight from every neuron of the network, self weight 0
    pub weights: Array1<f64>,
}

impl NeuronState {
    /// Random candidate within the given bounds. Weights start at zero since
    /// they are reconstructed during evaluation.
    pub fn random_with_bounds<R: Rng + ?Sized>(
        bounds: &ParameterBounds,
        rng: &mut R,
        num_neurons: usize,
        neuron_index: usize,
    ) -> Self {
        let a = bounds.a.sample(rng);
        let b = bounds.b.sample(rng);
        let c = bounds.c.sample(rng);
        let d = bounds.d.sample(rng);
        let p1 = bounds.p1.sample(rng);
        let p2 = bounds.p2.sample(rng);
        let p3 = bounds.p3.sample(rng);
        let p4 = bounds.p4.sample(rng);
        let u = bounds.u.sample(rng);

        Self {
            neuron_index,
            a,
            b,
            c,
            d,
            p1,
            p2,
            p3,
            p4,
            v: 0.0,
            u,
            start_u: u,
            weights: Array1::zeros(num_neurons),
        }
    }

    pub fn random_for_mode<R: Rng + ?Sized>(
        mode: ReconstructionMode,
        rng: &mut R,
        num_neurons: usize,
        neuron_index: usize,
    ) -> Self {
        Self::random_with_bounds(&mode.bounds(), rng, num_neurons, neuron_index)
    }

    /// Ground-truth neuron with a random start voltage and random weights.
    /// Presynaptic indices in the top [`PERCENTAGE_INHIBITORY_WEIGHTS`] share
    /// are inhibitory.
    pub fn random_ground_truth<R: Rng + ?Sized>(
        rng: &mut R,
        num_neurons: usize,
        neuron_index: usize,
    ) -> Self {
        let mut state =
            Self::random_with_bounds(&GENERATION_BOUNDS, rng, num_neurons, neuron_index);
        state.v = V_START_GENERATION.sample(rng);

        let inhibitory_from = num_neurons as f64 * (1.0 - PERCENTAGE_INHIBITORY_WEIGHTS);
        for n in 0..num_neurons {
            if n == neuron_index {
                continue;
            }
            let weight = WEIGHT_GENERATION.sample(rng);
            state.weights[n] = if n as f64 >= inhibitory_from { -weight } else { weight };
        }
        state
    }

    pub fn num_neurons(&self) -> usize {
        self.weights.len()
    }

    /// One integration step from the current state, returned as `(v, u)`
    pub fn integrate(&self, dt: f64, input: f64) -> (f64, f64) {
        let h = 1.0 / (1.0 - (RESET_STEEPNESS * (SPIKE_RESET - self.v)).exp());
        let v1 = self.v * (1.0 - h) + self.c * h;
        let u1 = self.u + self.d * h;

        let v2 = v1 + dt * (self.p1 * v1 * v1 + self.p2 * v1 + self.p3 - u1 + self.p4 * input);
        let u2 = u1 + dt * (self.a * (self.b * v1 - u1));
        (v2, u2)
    }

    /// Advance an isolated neuron by one step
    pub fn step(&mut self, dt: f64, input: f64) {
        let (v, u) = self.integrate(dt, input);
        self.v = v;
        self.u = u;
    }

    /// External current plus the weights of all neurons spiking in `previous`
    pub fn network_input(&self, external: f64, previous: ArrayView1<f64>) -> f64 {
        previous
            .iter()
            .zip(self.weights.iter())
            .filter(|(v, _)| **v >= SPIKE_RECOGNITION)
            .fold(external, |acc, (_, w)| acc + w)
    }

    /// Advance one step driven by the previous voltages of the whole network
    pub fn step_network(&mut self, dt: f64, previous: ArrayView1<f64>, external: f64) {
        let input = self.network_input(external, previous);
        self.step(dt, input);
    }

    pub fn parameter(&self, parameter: Parameter) -> f64 {
        match parameter {
            Parameter::A => self.a,
            Parameter::B => self.b,
            Parameter::C => self.c,
            Parameter::D => self.d,
            Parameter::P1 => self.p1,
            Parameter::P2 => self.p2,
            Parameter::P3 => self.p3,
            Parameter::StartU => self.start_u,
        }
    }

    pub fn set_parameter(&mut self, parameter: Parameter, value: f64) {
        match parameter {
            Parameter::A => self.a = value,
            Parameter::B => self.b = value,
            Parameter::C => self.c = value,
            Parameter::D => self.d = value,
            Parameter::P1 => self.p1 = value,
            Parameter::P2 => self.p2 = value,
            Parameter::P3 => self.p3 = value,
            Parameter::StartU => self.start_u = value,
        }
    }
}

impl fmt::Display for NeuronState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let weights: Vec<String> = self.weights.iter().map(|w| w.to_string()).collect();
        write!(
            f,
            "a={:.5}, b={:.5}, c={:.5}, d={:.5}, p1={:.5}, p2={:.5}, p3={:.5}, p4={:.5}, u={:.5}, startU={:.5}, weights=[{}]",
            self.a,
            self.b,
            self.c,
            self.d,
            self.p1,
            self.p2,
            self.p3,
            self.p4,
            self.u,
            self.start_u,
            weights.join(", ")
        )
    }
}

/// Advance every neuron by one step. All inputs are computed from the same
/// snapshot of the previous voltages before any state is written.
pub fn step_full_network(states: &mut [NeuronState], dt: f64, inputs: ArrayView1<f64>) {
    let previous: Array1<f64> = states.iter().map(|s| s.v).collect();
    let next: Vec<(f64, f64)> = states
        .iter()
        .zip(inputs.iter())
        .map(|(state, &external)| {
            state.integrate(dt, state.network_input(external, previous.view()))
        })
        .collect();

    for (state, (v, u)) in states.iter_mut().zip(next) {
        state.v = v;
        state.u = u;
    }
}

/// Free-running simulation of a whole network from `from` onwards.
///
/// Row `t` holds the voltages before the step driven by `current[t]`. Rows
/// before `from` stay zero.
pub fn simulate_network(
    models: &[NeuronState],
    current: &Array2<f64>,
    dt: f64,
    from: usize,
) -> Array2<f64> {
    let mut states = models.to_vec();
    let mut voltage = Array2::zeros(current.raw_dim());

    for t in from..current.nrows() {
        for (n, state) in states.iter().enumerate() {
            voltage[[t, n]] = state.v;
        }
        step_full_network(&mut states, dt, current.row(t));
    }
    voltage
}

// ============================================================================
// OBSERVED DATA
// ============================================================================

/// Recorded input current and membrane potential, both `[time, neuron]`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservedData {
    current: Array2<f64>,
    voltage: Array2<f64>,
}

impl ObservedData {
    pub fn new(current: Array2<f64>, voltage: Array2<f64>) -> Result<Self> {
        if current.dim() != voltage.dim() {
            return Err(ReconError::DimensionMismatch(format!(
                "current is {:?} but voltage is {:?}",
                current.dim(),
                voltage.dim()
            )));
        }
        if current.is_empty() {
            return Err(ReconError::InvalidData("recording contains no samples".into()));
        }
        Ok(Self { current, voltage })
    }

    /// Cut both recordings to the shorter time length
    pub fn truncated(current: Array2<f64>, voltage: Array2<f64>) -> Result<Self> {
        if current.ncols() != voltage.ncols() {
            return Err(ReconError::DimensionMismatch(format!(
                "current has {} neurons but voltage has {}",
                current.ncols(),
                voltage.ncols()
            )));
        }
        let len = current.nrows().min(voltage.nrows());
        if len < current.nrows().max(voltage.nrows()) {
            debug!(len, "truncating recordings to common length");
        }
        Self::new(
            current.slice(s![..len, ..]).to_owned(),
            voltage.slice(s![..len, ..]).to_owned(),
        )
    }

    /// Single-neuron recording from two sample sequences of possibly
    /// different length
    pub fn from_single_neuron(current: &[f64], voltage: &[f64]) -> Result<Self> {
        let len = current.len().min(voltage.len());
        let as_column = |samples: &[f64]| Array2::from_shape_fn((len, 1), |(t, _)| samples[t]);
        Self::new(as_column(current), as_column(voltage))
    }

    pub fn current(&self) -> &Array2<f64> {
        &self.current
    }

    pub fn voltage(&self) -> &Array2<f64> {
        &self.voltage
    }

    pub fn timesteps(&self) -> usize {
        self.voltage.nrows()
    }

    pub fn num_neurons(&self) -> usize {
        self.voltage.ncols()
    }

    /// Check that a tuning split leaves at least one step on each side
    pub fn validate_split(&self, split: usize) -> Result<()> {
        if split == 0 || split >= self.timesteps() {
            return Err(ReconError::InvalidConfig(format!(
                "tuning split {} must lie in [1, {})",
                split,
                self.timesteps()
            )));
        }
        Ok(())
    }
}

// ============================================================================
// LINEAR SOLVER
// ============================================================================

/// Gaussian elimination with partial pivoting.
///
/// The system is eliminated in place, so `a` and `b` hold the triangular
/// form afterwards. Exactly zero pivots are replaced by [`PIVOT_EPSILON`]
/// instead of failing, which keeps singular systems finite but imprecise.
pub fn solve_linear_system(a: &mut Array2<f64>, b: &mut Array1<f64>) -> Result<Array1<f64>> {
    let n = b.len();
    if a.nrows() != n || a.ncols() != n {
        return Err(ReconError::DimensionMismatch(format!(
            "matrix is {}x{} but vector has {} entries",
            a.nrows(),
            a.ncols(),
            n
        )));
    }

    // Forward elimination
    for p in 0..n {
        let mut max_row = p;
        for i in (p + 1)..n {
            if a[[i, p]].abs() > a[[max_row, p]].abs() {
                max_row = i;
            }
        }

        if max_row != p {
            for j in 0..n {
                a.swap([p, j], [max_row, j]);
            }
            b.swap(p, max_row);
        }

        for i in (p + 1)..n {
            let alpha = a[[i, p]] / nonzero(a[[p, p]]);
            b[i] -= alpha * b[p];
            for j in p..n {
                a[[i, j]] -= alpha * a[[p, j]];
            }
        }
    }

    // Back substitution
    let mut x = Array1::<f64>::zeros(n);
    for i in (0..n).rev() {
        let mut sum = 0.0;
        for j in (i + 1)..n {
            sum += a[[i, j]] * x[j];
        }
        x[i] = (b[i] - sum) / nonzero(a[[i, i]]);
    }

    Ok(x)
}

fn nonzero(value: f64) -> f64 {
    if value == 0.0 {
        PIVOT_EPSILON
    } else {
        value
    }
}

// ============================================================================
// SYNTHETIC NETWORKS
// ============================================================================

/// Settings for a generated ground-truth network
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyntheticConfig {
    /// Seed for parameters, stimulus and noise
    pub seed: u64,
    pub num_neurons: usize,
    pub timesteps: usize,
    /// Integration step (ms)
    pub dt: f64,
    /// Index at which the recovery variable of the ground truth is captured
    pub tuning_split: usize,
    /// Add uniform noise to the observed current and voltage
    pub noise: bool,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            seed: 56,
            num_neurons: 10,
            timesteps: 1000,
            dt: 0.1,
            tuning_split: 500,
            noise: true,
        }
    }
}

/// Whether the generated stimulus is on at step `t`. Two windows are active:
/// between 2/8 and 3/8 of the run and between 4.5/8 and 7/8.
pub fn stimulus_active(t: usize, timesteps: usize) -> bool {
    let eighth = timesteps / 8;
    let late = t < eighth * 7 && (t as f64) > eighth as f64 * 4.5;
    let early = t < eighth * 3 && t > eighth * 2;
    late || early
}

/// A simulated network together with the neurons that produced it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyntheticNetwork {
    /// Recording handed to the reconstruction (noisy when enabled)
    pub data: ObservedData,
    /// Noise-free stimulus
    pub clean_current: Array2<f64>,
    /// Noise-free voltage
    pub clean_voltage: Array2<f64>,
    /// Generating neurons, with `u` set to its value at the tuning split
    pub ground_truth: Vec<NeuronState>,
}

impl SyntheticNetwork {
    pub fn generate(config: &SyntheticConfig) -> Result<Self> {
        if config.num_neurons == 0 {
            return Err(ReconError::InvalidConfig(
                "synthetic network needs at least one neuron".into(),
            ));
        }
        if config.timesteps < 2 {
            return Err(ReconError::InvalidConfig(
                "synthetic network needs at least two time steps".into(),
            ));
        }
        if config.tuning_split == 0 || config.tuning_split >= config.timesteps {
            return Err(ReconError::InvalidConfig(format!(
                "tuning split {} must lie in [1, {})",
                config.tuning_split, config.timesteps
            )));
        }
        if !config.dt.is_finite() || config.dt <= 0.0 {
            return Err(ReconError::InvalidConfig(format!(
                "dt must be positive, got {}",
                config.dt
            )));
        }

        let (steps, neurons) = (config.timesteps, config.num_neurons);
        let mut rng = StdRng::seed_from_u64(config.seed);

        let mut current = Array2::<f64>::zeros((steps, neurons));
        for t in 0..steps {
            for n in 0..neurons {
                if stimulus_active(t, steps) {
                    current[[t, n]] = INPUT_GENERATION.sample(&mut rng);
                }
            }
        }

        let mut models: Vec<NeuronState> = (0..neurons)
            .map(|n| NeuronState::random_ground_truth(&mut rng, neurons, n))
            .collect();

        let mut voltage = Array2::<f64>::zeros((steps, neurons));
        for (n, model) in models.iter().enumerate() {
            voltage[[0, n]] = model.v;
        }

        let mut u_at_split = vec![0.0; neurons];
        for t in 1..steps {
            for (n, model) in models.iter().enumerate() {
                if t == config.tuning_split {
                    u_at_split[n] = model.u;
                }
                voltage[[t, n]] = model.v;
            }
            step_full_network(&mut models, config.dt, current.row(t));
        }
        for (model, u) in models.iter_mut().zip(u_at_split) {
            model.u = u;
        }

        let (observed_current, observed_voltage) = if config.noise {
            let noisy_current = current.mapv(|i| i + NOISE_INPUT_GENERATION.sample(&mut rng));
            let noisy_voltage = voltage.mapv(|v| v + NOISE_V_GENERATION.sample(&mut rng));
            (noisy_current, noisy_voltage)
        } else {
            (current.clone(), voltage.clone())
        };

        debug!(neurons, steps, noise = config.noise, "generated synthetic network");

        Ok(Self {
            data: ObservedData::new(observed_current, observed_voltage)?,
            clean_current: current,
            clean_voltage: voltage,
            ground_truth: models,
        })
    }

    /// Squared distance between generated and reconstructed weights, per neuron
    pub fn squared_weight_error(&self, reconstructed: &[NeuronState]) -> Vec<f64> {
        self.ground_truth
            .iter()
            .zip(reconstructed)
            .map(|(truth, model)| {
                truth
                    .weights
                    .iter()
                    .zip(model.weights.iter())
                    .map(|(a, b)| (a - b) * (a - b))
                    .sum()
            })
            .collect()
    }
}
