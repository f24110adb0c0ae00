//! # Genetic-RS: Parameter Search
//!
//! Genetic algorithm that reconstructs a recorded network one neuron at a
//! time. Every neuron gets its own population; the other neurons only enter
//! through their recorded voltages.
//!
//! Per neuron:
//! 1. A random population is drawn from the bounds of the [`ReconstructionMode`].
//! 2. All individuals are evaluated on a worker pool and sorted by fitness.
//! 3. The best individuals survive unchanged and as a mutated copy, the rest
//!    of the next generation is bred by rank-based selection, uniform
//!    crossover and Gray-code mutation.
//! 4. The search stops at the fitness threshold, the generation limit or
//!    when the best fitness has not moved for too long.
//!
//! Afterwards the reconstructed neurons are simulated together from the
//! tuning split onwards.
//!
//! ## Reproducibility
//!
//! All random decisions of the search come from one seeded generator. Each
//! evaluation batch draws a base seed from it and individual `i` uses the
//! stream `base + i`, so results do not depend on the number of workers.

use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::{ThreadPool, ThreadPoolBuildError, ThreadPoolBuilder};
use serde::{Deserialize, Serialize};
use spikerecon_compare::{balanced_measures, WeightedMeasure};
use spikerecon_core::{
    simulate_network, NeuronState, ObservedData, Parameter, ParameterBounds, ReconError,
    ReconstructionMode,
};
use spikerecon_fitness::{EvaluationContext, FitnessError, Individual};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum GeneticError {
    #[error(transparent)]
    Fitness(#[from] FitnessError),
    #[error(transparent)]
    Core(#[from] ReconError),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Failed to start worker pool: {0}")]
    ThreadPool(#[from] ThreadPoolBuildError),
}

pub type Result<T> = std::result::Result<T, GeneticError>;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Settings of one reconstruction run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconstructionConfig {
    /// Seed of the search generator
    pub seed: u64,
    /// Integration step (ms)
    pub dt: f64,
    pub population_size: usize,
    /// Stop as soon as the best fitness is at or below this value
    pub fitness_threshold: f64,
    /// Maximum number of bred generations per neuron
    pub generation_threshold: usize,
    /// Stop after the best fitness stayed identical for more generations than this
    pub stagnation_limit: usize,
    /// Probability that a bred child is mutated
    pub mutation_rate: f64,
    /// First sample that is scored; earlier samples only tune `u`
    pub tuning_split: usize,
    pub mode: ReconstructionMode,
    pub measures: Vec<WeightedMeasure>,
    /// Individuals carried over verbatim (each also adds one mutated copy)
    pub elite_count: usize,
    /// Random replacements allowed per individual before it is given up
    pub max_resamples: usize,
    /// Worker pool size, `None` for [`worker_count`]
    pub worker_threads: Option<usize>,
}

impl Default for ReconstructionConfig {
    fn default() -> Self {
        Self {
            seed: 20,
            dt: 0.1,
            population_size: 50,
            fitness_threshold: 1e-19,
            generation_threshold: 15,
            stagnation_limit: 5,
            mutation_rate: 0.3,
            tuning_split: 500,
            mode: ReconstructionMode::Standard,
            measures: balanced_measures(),
            elite_count: 1,
            max_resamples: 100_000,
            worker_threads: None,
        }
    }
}

impl ReconstructionConfig {
    /// Check everything that does not depend on the dataset
    pub fn validate(&self) -> Result<()> {
        if !self.dt.is_finite() || self.dt <= 0.0 {
            return Err(GeneticError::InvalidConfig(format!(
                "dt must be positive, got {}",
                self.dt
            )));
        }
        if self.elite_count == 0 {
            return Err(GeneticError::InvalidConfig(
                "at least one elite individual is required".into(),
            ));
        }
        if self.population_size < 2 * self.elite_count {
            return Err(GeneticError::InvalidConfig(format!(
                "population of {} cannot hold {} elites and their mutated copies",
                self.population_size, self.elite_count
            )));
        }
        if !(0.0..=1.0).contains(&self.mutation_rate) {
            return Err(GeneticError::InvalidConfig(format!(
                "mutation rate must lie in [0, 1], got {}",
                self.mutation_rate
            )));
        }
        if self.fitness_threshold.is_nan() {
            return Err(GeneticError::InvalidConfig("fitness threshold is NaN".into()));
        }
        if self.measures.is_empty() {
            return Err(GeneticError::InvalidConfig("no fitness measures configured".into()));
        }
        if self.measures.iter().any(|m| !m.weight.is_finite() || m.weight < 0.0)
            || self.measures.iter().map(|m| m.weight).sum::<f64>() <= 0.0
        {
            return Err(GeneticError::InvalidConfig(
                "measure weights must be non-negative with a positive sum".into(),
            ));
        }
        if self.worker_threads == Some(0) {
            return Err(GeneticError::InvalidConfig("worker pool needs at least one thread".into()));
        }
        Ok(())
    }
}

// ============================================================================
// GENETIC OPERATORS
// ============================================================================

/// Bits that mutation may flip: 2^18 to 2^26 and 2^28 of the encoded position
pub const MUTATION_BITS: [u32; 10] = [
    1 << 18,
    1 << 19,
    1 << 20,
    1 << 21,
    1 << 22,
    1 << 23,
    1 << 24,
    1 << 25,
    1 << 26,
    1 << 28,
];

pub fn binary_to_gray(value: u32) -> u32 {
    value ^ (value >> 1)
}

pub fn gray_to_binary(gray: u32) -> u32 {
    let mut value = gray;
    let mut mask = gray >> 1;
    while mask != 0 {
        value ^= mask;
        mask >>= 1;
    }
    value
}

/// Selection weight of `rank` in a population sorted best first
pub fn selection_probability(size: usize, rank: usize) -> f64 {
    let size = size as f64;
    (1.0 - (-0.005 * (size - size * 0.05 - rank as f64)).exp()).max(0.0)
}

/// Rank-based roulette: starting at a random rank, walk the ranks circularly
/// and accumulate [`selection_probability`] until the drawn threshold is
/// passed. `size` must be positive.
pub fn select_index<R: Rng + ?Sized>(rng: &mut R, size: usize) -> usize {
    let threshold: f64 = rng.gen();
    let mut rank = rng.gen_range(0..size);
    let mut chosen = 0;
    let mut cumulative = 0.0;
    while threshold >= cumulative {
        cumulative += selection_probability(size, rank);
        if threshold <= cumulative {
            chosen = rank;
        }
        rank = (rank + 1) % size;
    }
    chosen
}

/// Child that starts as a copy of `first` and takes each searchable
/// parameter from `second` with probability one half. `p4`, the state and
/// the weights always come from `first`.
pub fn crossover<R: Rng + ?Sized>(
    rng: &mut R,
    first: &NeuronState,
    second: &NeuronState,
) -> NeuronState {
    let mut child = first.clone();
    for parameter in Parameter::ALL {
        if rng.gen::<bool>() {
            child.set_parameter(parameter, second.parameter(parameter));
        }
    }
    child
}

/// Flip one coarse bit in the Gray code of a random parameter.
///
/// The parameter's position inside its bounds is scaled to `[0, i32::MAX]`,
/// Gray encoded, one of [`MUTATION_BITS`] is flipped and the result decoded
/// back into the bounds. Parameters with fixed bounds are left alone.
pub fn mutate<R: Rng + ?Sized>(rng: &mut R, bounds: &ParameterBounds, state: &mut NeuronState) {
    let parameter = Parameter::ALL[rng.gen_range(0..Parameter::ALL.len())];
    let range = bounds.of(parameter);
    if range.is_fixed() {
        return;
    }

    let scale = i32::MAX as f64;
    let position = ((state.parameter(parameter) - range.min) / range.width()).clamp(0.0, 1.0);
    let encoded = (position * scale) as u32;
    let flipped = binary_to_gray(encoded) ^ MUTATION_BITS[rng.gen_range(0..MUTATION_BITS.len())];
    let decoded = gray_to_binary(flipped);

    state.set_parameter(parameter, decoded as f64 / scale * range.width() + range.min);
}

/// Share of distinct fitness values in a population
pub fn diversity(population: &[Individual]) -> f64 {
    if population.is_empty() {
        return 0.0;
    }
    let distinct: HashSet<u64> = population.iter().map(|i| i.fitness.to_bits()).collect();
    distinct.len() as f64 / population.len() as f64
}

// ============================================================================
// OBSERVER
// ============================================================================

/// State of a neuron's search after one evaluated generation
#[derive(Debug, Clone, Serialize)]
pub struct GenerationReport {
    /// 0 for the initial population
    pub generation: usize,
    pub neuron: usize,
    pub best_fitness: f64,
    pub diversity: f64,
    /// Time since the reconstruction started
    pub elapsed: Duration,
    /// Time spent on this generation
    pub generation_elapsed: Duration,
    pub best: Individual,
}

/// Progress callbacks, invoked synchronously from the search thread
pub trait ReconstructionObserver {
    fn neuron_started(&mut self, _neuron: usize, _num_neurons: usize) {}

    /// `done` of `total` individuals of the current batch are evaluated
    fn population_evaluated(&mut self, _neuron: usize, _done: usize, _total: usize) {}

    fn generation_completed(&mut self, _report: &GenerationReport) {}

    /// Final state of a neuron; `report.generation` is the number of bred generations
    fn neuron_finished(&mut self, _report: &GenerationReport) {}

    fn reconstruction_finished(
        &mut self,
        _observed: &ObservedData,
        _predicted: &Array2<f64>,
        _models: &[NeuronState],
    ) {
    }
}

/// Observer that ignores every event
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl ReconstructionObserver for NoopObserver {}

impl<O: ReconstructionObserver + ?Sized> ReconstructionObserver for &mut O {
    fn neuron_started(&mut self, neuron: usize, num_neurons: usize) {
        (**self).neuron_started(neuron, num_neurons)
    }

    fn population_evaluated(&mut self, neuron: usize, done: usize, total: usize) {
        (**self).population_evaluated(neuron, done, total)
    }

    fn generation_completed(&mut self, report: &GenerationReport) {
        (**self).generation_completed(report)
    }

    fn neuron_finished(&mut self, report: &GenerationReport) {
        (**self).neuron_finished(report)
    }

    fn reconstruction_finished(
        &mut self,
        observed: &ObservedData,
        predicted: &Array2<f64>,
        models: &[NeuronState],
    ) {
        (**self).reconstruction_finished(observed, predicted, models)
    }
}

/// Forwards every event to both observers, first to `.0`
impl<A: ReconstructionObserver, B: ReconstructionObserver> ReconstructionObserver for (A, B) {
    fn neuron_started(&mut self, neuron: usize, num_neurons: usize) {
        self.0.neuron_started(neuron, num_neurons);
        self.1.neuron_started(neuron, num_neurons);
    }

    fn population_evaluated(&mut self, neuron: usize, done: usize, total: usize) {
        self.0.population_evaluated(neuron, done, total);
        self.1.population_evaluated(neuron, done, total);
    }

    fn generation_completed(&mut self, report: &GenerationReport) {
        self.0.generation_completed(report);
        self.1.generation_completed(report);
    }

    fn neuron_finished(&mut self, report: &GenerationReport) {
        self.0.neuron_finished(report);
        self.1.neuron_finished(report);
    }

    fn reconstruction_finished(
        &mut self,
        observed: &ObservedData,
        predicted: &Array2<f64>,
        models: &[NeuronState],
    ) {
        self.0.reconstruction_finished(observed, predicted, models);
        self.1.reconstruction_finished(observed, predicted, models);
    }
}

// ============================================================================
// PARALLEL EVALUATION
// ============================================================================

/// Workers started per available core
pub const WORKERS_PER_CORE: f64 = 1.4;

const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Default pool size: 1.4 workers per available core, at least one
pub fn worker_count() -> usize {
    let cores = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    ((cores as f64 * WORKERS_PER_CORE) as usize).max(1)
}

/// Counts a task as finished when dropped, also when the task panics
struct Completion<'a>(&'a AtomicUsize);

impl Drop for Completion<'_> {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::Release);
    }
}

/// Fixed-size worker pool that evaluates whole populations
pub struct ParallelEvaluator {
    pool: ThreadPool,
}

impl ParallelEvaluator {
    pub fn new(threads: Option<usize>) -> Result<Self> {
        let threads = threads.unwrap_or_else(worker_count);
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("spikerecon-worker-{}", i))
            .build()?;
        debug!(threads, "started evaluation pool");
        Ok(Self { pool })
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Evaluate every individual in place and return the total number of
    /// resamples. Individual `i` draws from a generator seeded with
    /// `base_seed + i`. The calling thread polls the completion counter and
    /// reports progress until the batch is done.
    pub fn evaluate<O: ReconstructionObserver + ?Sized>(
        &self,
        population: &mut [Individual],
        ctx: &EvaluationContext<'_>,
        base_seed: u64,
        observer: &mut O,
    ) -> Result<usize> {
        let total = population.len();
        let completed = AtomicUsize::new(0);
        let mut outcomes: Vec<Option<spikerecon_fitness::Result<usize>>> =
            (0..total).map(|_| None).collect();

        self.pool.in_place_scope(|scope| {
            let slots = population.iter_mut().zip(outcomes.iter_mut());
            for (index, (individual, outcome)) in slots.enumerate() {
                let completed = &completed;
                scope.spawn(move |_| {
                    let _done = Completion(completed);
                    let mut rng = StdRng::seed_from_u64(base_seed.wrapping_add(index as u64));
                    *outcome = Some(individual.evaluate(ctx, &mut rng));
                });
            }

            let mut reported = 0;
            loop {
                let done = completed.load(Ordering::Acquire);
                if done != reported {
                    observer.population_evaluated(ctx.neuron(), done, total);
                    reported = done;
                }
                if done >= total {
                    break;
                }
                thread::sleep(POLL_INTERVAL);
            }
        });

        let mut resamples = 0;
        for outcome in outcomes.into_iter().flatten() {
            resamples += outcome?;
        }
        Ok(resamples)
    }
}

// ============================================================================
// RECONSTRUCTION
// ============================================================================

/// Result of a complete run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconstructionOutcome {
    /// Best state per neuron: tuned `u`, `v` at the split, reconstructed weights
    pub neurons: Vec<NeuronState>,
    pub best_fitness: Vec<f64>,
    /// Bred generations per neuron
    pub generations: Vec<usize>,
    /// Best fitness per neuron and generation, starting with the initial population
    pub fitness_history: Vec<Vec<f64>>,
    /// Joint simulation of all reconstructed neurons, zero before the split
    pub predicted: Array2<f64>,
}

struct NeuronSearch {
    best: Individual,
    generations: usize,
    history: Vec<f64>,
}

/// Genetic reconstruction of every neuron of a recording
#[derive(Debug, Clone)]
pub struct Reconstruction {
    config: ReconstructionConfig,
}

impl Reconstruction {
    pub fn new(config: ReconstructionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ReconstructionConfig {
        &self.config
    }

    pub fn run(&self, data: &ObservedData) -> Result<ReconstructionOutcome> {
        self.run_with_observer(data, &mut NoopObserver)
    }

    pub fn run_with_observer<O: ReconstructionObserver + ?Sized>(
        &self,
        data: &ObservedData,
        observer: &mut O,
    ) -> Result<ReconstructionOutcome> {
        let config = &self.config;
        config.validate()?;
        data.validate_split(config.tuning_split)?;

        let evaluator = ParallelEvaluator::new(config.worker_threads)?;
        let mut rng = StdRng::seed_from_u64(config.seed);
        let start = Instant::now();
        let num_neurons = data.num_neurons();

        info!(
            neurons = num_neurons,
            steps = data.timesteps(),
            population = config.population_size,
            threads = evaluator.threads(),
            mode = %config.mode,
            "starting reconstruction"
        );

        let mut outcome = ReconstructionOutcome {
            neurons: Vec::with_capacity(num_neurons),
            best_fitness: Vec::with_capacity(num_neurons),
            generations: Vec::with_capacity(num_neurons),
            fitness_history: Vec::with_capacity(num_neurons),
            predicted: Array2::zeros((0, 0)),
        };

        for neuron in 0..num_neurons {
            let search =
                self.reconstruct_neuron(data, neuron, &evaluator, &mut rng, start, observer)?;
            outcome.best_fitness.push(search.best.fitness);
            outcome.generations.push(search.generations);
            outcome.fitness_history.push(search.history);
            outcome.neurons.push(search.best.state);
        }

        outcome.predicted =
            simulate_network(&outcome.neurons, data.current(), config.dt, config.tuning_split);
        observer.reconstruction_finished(data, &outcome.predicted, &outcome.neurons);

        info!(elapsed = ?start.elapsed(), "reconstruction finished");
        Ok(outcome)
    }

    fn reconstruct_neuron<O: ReconstructionObserver + ?Sized>(
        &self,
        data: &ObservedData,
        neuron: usize,
        evaluator: &ParallelEvaluator,
        rng: &mut StdRng,
        start: Instant,
        observer: &mut O,
    ) -> Result<NeuronSearch> {
        let config = &self.config;
        let num_neurons = data.num_neurons();
        let bounds = config.mode.bounds();
        let ctx = EvaluationContext::new(
            data,
            neuron,
            config.dt,
            config.tuning_split,
            config.mode,
            &config.measures,
            config.max_resamples,
        )?;

        observer.neuron_started(neuron, num_neurons);

        let mut population: Vec<Individual> = (0..config.population_size)
            .map(|_| Individual::random(config.mode, &mut *rng, num_neurons, neuron))
            .collect();
        evaluate_sorted(evaluator, &mut population, &ctx, rng, observer)?;

        let report = generation_report(0, neuron, &population, start.elapsed(), start.elapsed());
        log_generation(&report);
        observer.generation_completed(&report);

        let mut history = vec![population[0].fitness];
        let mut last_fitness = population[0].fitness;
        let mut unchanged = 0;
        let mut generation = 0;

        while population[0].fitness > config.fitness_threshold
            && generation < config.generation_threshold
        {
            generation += 1;
            let generation_start = Instant::now();

            let mut next = self.breed(&population, &bounds, rng);
            evaluate_sorted(evaluator, &mut next, &ctx, rng, observer)?;
            population = next;
            history.push(population[0].fitness);

            let report = generation_report(
                generation,
                neuron,
                &population,
                start.elapsed(),
                generation_start.elapsed(),
            );
            log_generation(&report);
            observer.generation_completed(&report);

            if population[0].fitness == last_fitness {
                unchanged += 1;
                if unchanged > config.stagnation_limit {
                    debug!(neuron, generation, unchanged, "best fitness stagnated");
                    break;
                }
            } else {
                last_fitness = population[0].fitness;
                unchanged = 0;
            }
        }

        let report =
            generation_report(generation, neuron, &population, start.elapsed(), Duration::ZERO);
        info!(
            neuron,
            generations = generation,
            fitness = report.best_fitness,
            "neuron reconstructed"
        );
        debug!(neuron, model = %report.best.state, "best model");
        observer.neuron_finished(&report);

        Ok(NeuronSearch {
            best: report.best,
            generations: generation,
            history,
        })
    }

    /// Next generation: elites with a mutated copy each, then bred children
    fn breed<R: Rng + ?Sized>(
        &self,
        population: &[Individual],
        bounds: &ParameterBounds,
        rng: &mut R,
    ) -> Vec<Individual> {
        let size = population.len();
        let mut next = Vec::with_capacity(self.config.population_size);

        for elite in population.iter().take(self.config.elite_count) {
            next.push(Individual::new(elite.state.clone()));
            let mut mutated = elite.state.clone();
            mutate(rng, bounds, &mut mutated);
            next.push(Individual::new(mutated));
        }

        while next.len() < self.config.population_size {
            let first = &population[select_index(rng, size)];
            let second = &population[select_index(rng, size)];
            let mut child = crossover(rng, &first.state, &second.state);
            if rng.gen::<f64>() <= self.config.mutation_rate {
                mutate(rng, bounds, &mut child);
            }
            next.push(Individual::new(child));
        }
        next
    }
}

/// Evaluate a batch with a fresh base seed and sort it best first
fn evaluate_sorted<O: ReconstructionObserver + ?Sized>(
    evaluator: &ParallelEvaluator,
    population: &mut [Individual],
    ctx: &EvaluationContext<'_>,
    rng: &mut StdRng,
    observer: &mut O,
) -> Result<()> {
    let base_seed: u64 = rng.gen();
    let resamples = evaluator.evaluate(population, ctx, base_seed, observer)?;
    if resamples > 0 {
        debug!(neuron = ctx.neuron(), resamples, "replaced invalid candidates");
    }
    population.sort();
    Ok(())
}

fn generation_report(
    generation: usize,
    neuron: usize,
    population: &[Individual],
    elapsed: Duration,
    generation_elapsed: Duration,
) -> GenerationReport {
    GenerationReport {
        generation,
        neuron,
        best_fitness: population[0].fitness,
        diversity: diversity(population),
        elapsed,
        generation_elapsed,
        best: population[0].clone(),
    }
}

fn log_generation(report: &GenerationReport) {
    info!(
        neuron = report.neuron,
        generation = report.generation,
        fitness = report.best_fitness,
        diversity = report.diversity,
        "generation evaluated"
    );
}
