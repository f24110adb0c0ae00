//! Named experiment presets

use spikerecon_compare::{balanced_measures, weighted_measures};
use spikerecon_core::{ReconstructionMode, SyntheticConfig};
use spikerecon_genetic::ReconstructionConfig;
use std::path::PathBuf;

/// Default location of a measured single-neuron recording
pub const RECORDING_CURRENT: &str = "contestData/input/input.csv";
pub const RECORDING_VOLTAGE: &str = "contestData/input/voltage.csv";

const FITNESS_THRESHOLD: f64 = 1e-19;
const DT: f64 = 0.1;

#[derive(Debug, Clone)]
pub enum Source {
    /// Network generated from random ground-truth neurons
    Synthetic(SyntheticConfig),
    /// Measured current and voltage files, split at half the length unless given
    Recording {
        current: PathBuf,
        voltage: PathBuf,
        split: Option<usize>,
    },
}

#[derive(Debug, Clone)]
pub struct Scenario {
    pub name: &'static str,
    pub description: &'static str,
    pub source: Source,
    pub config: ReconstructionConfig,
}

fn synthetic(seed: u64, num_neurons: usize, timesteps: usize) -> Source {
    Source::Synthetic(SyntheticConfig {
        seed,
        num_neurons,
        timesteps,
        dt: DT,
        tuning_split: timesteps / 2,
        noise: true,
    })
}

fn recording() -> Source {
    Source::Recording {
        current: PathBuf::from(RECORDING_CURRENT),
        voltage: PathBuf::from(RECORDING_VOLTAGE),
        split: None,
    }
}

fn search(
    population_size: usize,
    generation_threshold: usize,
    stagnation_limit: usize,
    mutation_rate: f64,
    tuning_split: usize,
) -> ReconstructionConfig {
    ReconstructionConfig {
        seed: 20,
        dt: DT,
        population_size,
        fitness_threshold: FITNESS_THRESHOLD,
        generation_threshold,
        stagnation_limit,
        mutation_rate,
        tuning_split,
        ..Default::default()
    }
}

/// Search settings of the measured-neuron presets. The split is set once the
/// recording length is known.
fn recording_search(mode: ReconstructionMode) -> ReconstructionConfig {
    ReconstructionConfig {
        seed: 22,
        mode,
        ..search(10_000, 15, 10, 0.5, 0)
    }
}

pub fn scenarios() -> Vec<Scenario> {
    vec![
        Scenario {
            name: "one-neuron-balanced",
            description: "Single generated neuron, rank-weighted measures",
            source: synthetic(12, 1, 1000),
            config: search(1000, 15, 5, 0.5, 500),
        },
        Scenario {
            name: "one-neuron-all-same",
            description: "Single generated neuron, equal manual weights, short run",
            source: synthetic(18, 1, 1000),
            config: ReconstructionConfig {
                measures: weighted_measures(2.0, 2.0, 2.0, 2.0),
                ..search(50, 15, 5, 0.3, 500)
            },
        },
        Scenario {
            name: "one-neuron-voltage-single",
            description: "Single generated neuron, one-step voltage error weighted highest",
            source: synthetic(12, 1, 1000),
            config: ReconstructionConfig {
                measures: weighted_measures(1.0, 1.0, 1.0, 5.0),
                ..search(1000, 15, 5, 0.5, 500)
            },
        },
        Scenario {
            name: "one-neuron-long-running",
            description: "Single generated neuron, 3000 steps and 50 generations",
            source: synthetic(11, 1, 3000),
            config: ReconstructionConfig {
                measures: weighted_measures(2.0, 2.0, 2.0, 2.0),
                ..search(50, 50, 150, 0.3, 1500)
            },
        },
        Scenario {
            name: "ten-neurons-balanced",
            description: "Generated network of ten coupled neurons",
            source: synthetic(56, 10, 1000),
            config: search(10_000, 25, 8, 0.5, 500),
        },
        Scenario {
            name: "real-neuron-balanced",
            description: "Measured neuron, single-neuron bounds, rank-weighted measures",
            source: recording(),
            config: ReconstructionConfig {
                measures: balanced_measures(),
                ..recording_search(ReconstructionMode::SingleNeuron)
            },
        },
        Scenario {
            name: "real-neuron-all-same",
            description: "Measured neuron, single-neuron bounds, equal manual weights",
            source: recording(),
            config: ReconstructionConfig {
                measures: weighted_measures(2.0, 2.0, 2.0, 2.0),
                ..recording_search(ReconstructionMode::SingleNeuron)
            },
        },
        Scenario {
            name: "real-neuron-spike-time",
            description: "Measured neuron, standard bounds, spike timing weighted highest",
            source: recording(),
            config: ReconstructionConfig {
                measures: weighted_measures(5.0, 1.0, 1.0, 1.0),
                ..recording_search(ReconstructionMode::Standard)
            },
        },
    ]
}

pub fn find(name: &str) -> Option<Scenario> {
    scenarios().into_iter().find(|s| s.name.eq_ignore_ascii_case(name))
}
