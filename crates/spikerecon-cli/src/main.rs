//! # SpikeRecon CLI
//!
//! Command-line launcher for neuron reconstruction experiments.

mod scenarios;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use console::Term;
use dialoguer::{theme::ColorfulTheme, FuzzySelect};
use indicatif::{ProgressBar, ProgressStyle};
use ndarray::Array2;
use scenarios::{Scenario, Source};
use spikerecon_compare::weighted_measures;
use spikerecon_core::{
    NeuronState, ObservedData, ReconstructionMode, SyntheticConfig, SyntheticNetwork,
};
use spikerecon_dataset::{read_recording, write_ground_truth, DiagnosticsWriter};
use spikerecon_genetic::{
    GenerationReport, Reconstruction, ReconstructionConfig, ReconstructionObserver,
    ReconstructionOutcome,
};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "spikerecon")]
#[command(author = "Yatrogenesis")]
#[command(version)]
#[command(about = "Reconstruct spiking neuron parameters from recorded voltages", long_about = None)]
struct Cli {
    /// Without a command an experiment preset is picked interactively
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// List experiment presets
    List,

    /// Run an experiment preset
    Run {
        /// Preset name
        scenario: String,
        /// Current recording for presets on measured data
        #[arg(long)]
        current: Option<PathBuf>,
        /// Voltage recording for presets on measured data
        #[arg(long)]
        voltage: Option<PathBuf>,
        #[command(flatten)]
        options: RunOptions,
    },

    /// Generate a network and reconstruct it
    Synthetic {
        #[arg(short, long, default_value_t = 1)]
        neurons: usize,
        #[arg(short, long, default_value_t = 1000)]
        timesteps: usize,
        /// Seed of the generated network
        #[arg(long, default_value_t = 56)]
        data_seed: u64,
        /// Observe the network without noise
        #[arg(long)]
        no_noise: bool,
        #[command(flatten)]
        options: RunOptions,
    },

    /// Reconstruct recorded neurons
    Recording {
        /// Current file, one time step per line and `;` between neurons
        current: PathBuf,
        /// Voltage file in the same layout
        voltage: PathBuf,
        /// Tuning split (default: half of the recording)
        #[arg(long)]
        split: Option<usize>,
        #[command(flatten)]
        options: RunOptions,
    },
}

#[derive(Args, Debug, Clone, Default)]
struct RunOptions {
    /// JSON reconstruction config that replaces the preset settings
    #[arg(long)]
    config: Option<PathBuf>,
    /// Output directory for logs and result tables
    #[arg(short, long)]
    output: Option<PathBuf>,
    /// Seed of the search
    #[arg(long)]
    seed: Option<u64>,
    #[arg(long)]
    population: Option<usize>,
    /// Maximum number of generations per neuron
    #[arg(long)]
    generations: Option<usize>,
    #[arg(long)]
    mutation_rate: Option<f64>,
    /// Parameter bounds: standard, extended or single-neuron
    #[arg(long)]
    mode: Option<ReconstructionMode>,
    /// Manual weights for spike time, spike frequency, overall and single-step voltage
    #[arg(long, value_delimiter = ',', num_args = 4)]
    weights: Option<Vec<f64>>,
    /// Worker threads (default: 1.4 per core)
    #[arg(long)]
    threads: Option<usize>,
    /// Hide the progress bar
    #[arg(short, long)]
    quiet: bool,
}

impl RunOptions {
    fn configure(&self, base: ReconstructionConfig) -> Result<ReconstructionConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let text = fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?
            }
            None => base,
        };

        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        if let Some(population) = self.population {
            config.population_size = population;
        }
        if let Some(generations) = self.generations {
            config.generation_threshold = generations;
        }
        if let Some(rate) = self.mutation_rate {
            config.mutation_rate = rate;
        }
        if let Some(mode) = self.mode {
            config.mode = mode;
        }
        if let Some(threads) = self.threads {
            config.worker_threads = Some(threads);
        }
        match self.weights.as_deref() {
            Some(&[spike_time, spike_frequency, voltage_overall, voltage_single]) => {
                config.measures =
                    weighted_measures(spike_time, spike_frequency, voltage_overall, voltage_single);
            }
            Some(other) => bail!("expected four measure weights, got {}", other.len()),
            None => {}
        }
        Ok(config)
    }
}

// ============================================================================
// PROGRESS
// ============================================================================

struct ProgressObserver {
    bar: ProgressBar,
}

impl ProgressObserver {
    fn new(quiet: bool) -> Self {
        let bar = if quiet { ProgressBar::hidden() } else { ProgressBar::new(0) };
        let style = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-");
        bar.set_style(style);
        Self { bar }
    }
}

impl ReconstructionObserver for ProgressObserver {
    fn neuron_started(&mut self, neuron: usize, num_neurons: usize) {
        self.bar.set_message(format!("neuron {}/{}", neuron + 1, num_neurons));
    }

    fn population_evaluated(&mut self, _neuron: usize, done: usize, total: usize) {
        self.bar.set_length(total as u64);
        self.bar.set_position(done as u64);
    }

    fn generation_completed(&mut self, report: &GenerationReport) {
        self.bar.set_message(format!(
            "neuron {} generation {} fitness {:.6}",
            report.neuron, report.generation, report.best_fitness
        ));
    }

    fn neuron_finished(&mut self, report: &GenerationReport) {
        self.bar.println(format!(
            "{} neuron {}: fitness {} after {} generation(s)",
            "done".green(),
            report.neuron,
            report.best_fitness,
            report.generation
        ));
    }

    fn reconstruction_finished(
        &mut self,
        _observed: &ObservedData,
        _predicted: &Array2<f64>,
        _models: &[NeuronState],
    ) {
        self.bar.finish_and_clear();
    }
}

// ============================================================================
// RUNS
// ============================================================================

/// Run the search with diagnostics and progress attached, then dump the models
fn reconstruct(
    data: &ObservedData,
    config: ReconstructionConfig,
    output: &Path,
    quiet: bool,
) -> Result<ReconstructionOutcome> {
    println!(
        "{} {} neuron(s), {} steps, population {}, mode {}",
        "Reconstructing".green().bold(),
        data.num_neurons(),
        data.timesteps(),
        config.population_size,
        config.mode
    );
    println!("  Output: {}", output.display());

    let mut diagnostics = DiagnosticsWriter::create(output)
        .with_context(|| format!("preparing {}", output.display()))?;
    let mut progress = ProgressObserver::new(quiet);
    let outcome = Reconstruction::new(config)
        .run_with_observer(data, &mut (&mut diagnostics, &mut progress))?;
    diagnostics.finish().context("writing diagnostics")?;

    let models = serde_json::to_string_pretty(&outcome.neurons)?;
    fs::write(output.join("models.json"), models)?;
    info!(output = %output.display(), "results written");
    Ok(outcome)
}

fn print_outcome(outcome: &ReconstructionOutcome) {
    println!("{}", "Reconstructed models:".green().bold());
    for (n, model) in outcome.neurons.iter().enumerate() {
        println!(
            "  {} fitness {} after {} generation(s)",
            format!("neuron {}", n).cyan(),
            outcome.best_fitness[n],
            outcome.generations[n]
        );
        println!("    {}", model);
    }
}

fn execute(
    name: &str,
    source: Source,
    config: ReconstructionConfig,
    options: &RunOptions,
) -> Result<()> {
    let output = options
        .output
        .clone()
        .unwrap_or_else(|| PathBuf::from("reconstruction-output").join(name));

    match source {
        Source::Synthetic(mut synthetic) => {
            // The generated recording follows the search settings
            synthetic.dt = config.dt;
            synthetic.tuning_split = config.tuning_split;
            let network = SyntheticNetwork::generate(&synthetic)?;

            let outcome = reconstruct(&network.data, config, &output, options.quiet)?;
            write_ground_truth(&output, &network.ground_truth, &outcome.neurons)?;
            print_outcome(&outcome);

            println!("{}", "Generated models:".green().bold());
            let errors = network.squared_weight_error(&outcome.neurons);
            for (n, (truth, error)) in network.ground_truth.iter().zip(errors).enumerate() {
                println!("  {}", format!("neuron {}", n).cyan());
                println!("    {}", truth);
                println!("    squared weight difference: {}", format!("{}", error).yellow());
            }
        }
        Source::Recording { current, voltage, split } => {
            let data = read_recording(&current, &voltage).with_context(|| {
                format!("reading {} and {}", current.display(), voltage.display())
            })?;
            let config = ReconstructionConfig {
                tuning_split: split.unwrap_or(data.timesteps() / 2),
                ..config
            };

            let outcome = reconstruct(&data, config, &output, options.quiet)?;
            print_outcome(&outcome);
        }
    }
    Ok(())
}

fn run_scenario(scenario: Scenario, options: &RunOptions) -> Result<()> {
    println!("{} {}", "Scenario:".green().bold(), scenario.name);
    println!("  {}", scenario.description);
    let config = options.configure(scenario.config)?;
    execute(scenario.name, scenario.source, config, options)
}

fn list() {
    println!("{}", "Experiment presets:".green().bold());
    println!();
    for scenario in scenarios::scenarios() {
        println!("  {} {}", format!("{:<28}", scenario.name).cyan(), scenario.description);
    }
}

fn pick_scenario() -> Result<Option<Scenario>> {
    let all = scenarios::scenarios();
    let items: Vec<String> = all
        .iter()
        .map(|s| format!("{:<28} {}", s.name, s.description))
        .collect();

    let selection = FuzzySelect::with_theme(&ColorfulTheme::default())
        .with_prompt("Select an experiment")
        .items(&items)
        .default(0)
        .interact_on_opt(&Term::stderr())?;
    Ok(selection.map(|index| all[index].clone()))
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::List) => list(),

        Some(Commands::Run {
            scenario,
            current,
            voltage,
            options,
        }) => {
            let Some(mut preset) = scenarios::find(&scenario) else {
                bail!("unknown scenario '{}', see `spikerecon list`", scenario);
            };
            if let Source::Recording {
                current: preset_current,
                voltage: preset_voltage,
                ..
            } = &mut preset.source
            {
                if let Some(path) = current {
                    *preset_current = path;
                }
                if let Some(path) = voltage {
                    *preset_voltage = path;
                }
            }
            run_scenario(preset, &options)?;
        }

        Some(Commands::Synthetic {
            neurons,
            timesteps,
            data_seed,
            no_noise,
            options,
        }) => {
            let synthetic = SyntheticConfig {
                seed: data_seed,
                num_neurons: neurons,
                timesteps,
                tuning_split: timesteps / 2,
                noise: !no_noise,
                ..Default::default()
            };
            let base = ReconstructionConfig {
                tuning_split: synthetic.tuning_split,
                dt: synthetic.dt,
                ..Default::default()
            };
            let config = options.configure(base)?;
            execute("synthetic", Source::Synthetic(synthetic), config, &options)?;
        }

        Some(Commands::Recording {
            current,
            voltage,
            split,
            options,
        }) => {
            let base = ReconstructionConfig {
                mode: ReconstructionMode::SingleNeuron,
                ..Default::default()
            };
            let config = options.configure(base)?;
            execute("recording", Source::Recording { current, voltage, split }, config, &options)?;
        }

        None => {
            if !console::user_attended() {
                bail!("no command given, see `spikerecon --help`");
            }
            if let Some(scenario) = pick_scenario()? {
                run_scenario(scenario, &RunOptions::default())?;
            }
        }
    }

    Ok(())
}
