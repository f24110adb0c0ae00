//! # Dataset-RS: Recordings and Diagnostics
//!
//! Plain-text input and CSV output around a reconstruction run.
//!
//! Recordings hold one time step per line. Networks list one column per
//! neuron, separated by `;`. Blank lines are ignored.
//!
//! [`DiagnosticsWriter`] follows a run as a [`ReconstructionObserver`] and
//! fills an output directory with:
//!
//! | file | content |
//! |---|---|
//! | `reconstruction.log` | description, neuron, fitness, diversity and times per generation |
//! | `fitness_neuron-<n>.csv` | best fitness per generation |
//! | `model_neuron-<n>.csv` | best parameters per generation |
//! | `weights_neuron-<n>.csv` | best weights per generation |
//! | `input_neuron-<n>.csv` | recorded current |
//! | `voltage_neuron-<n>.csv` | recorded and simulated voltage |
//!
//! Synthetic runs add `targetmodel_neuron-<n>.csv` and
//! `targetweights_neuron-<n>.csv` through [`write_ground_truth`].

use ndarray::Array2;
use spikerecon_core::{NeuronState, ObservedData, ReconError};
use spikerecon_genetic::{GenerationReport, ReconstructionObserver};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("{}:{line}: cannot parse '{value}' as a number", path.display())]
    Parse { path: PathBuf, line: usize, value: String },
    #[error("{}:{line}: expected {expected} columns, found {found}", path.display())]
    Ragged {
        path: PathBuf,
        line: usize,
        expected: usize,
        found: usize,
    },
    #[error("{} contains no samples", .0.display())]
    Empty(PathBuf),
    #[error(transparent)]
    Core(#[from] ReconError),
}

pub type Result<T> = std::result::Result<T, DatasetError>;

pub const LOG_FILE: &str = "reconstruction.log";
pub const LOG_HEADER: &str = "description,neuron,fitness,diversity,time,time_generation";
pub const MODEL_HEADER: &str = "a;b;c;d;p1;p2;p3;p4;u;startU;v";

// ============================================================================
// READERS
// ============================================================================

/// Read a `;`-separated table of numbers, one row per non-blank line
pub fn read_matrix(path: impl AsRef<Path>) -> Result<Array2<f64>> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)?;

    let mut values = Vec::new();
    let mut columns = None;
    let mut rows = 0;
    for (index, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let start = values.len();
        for field in line.split(';').map(str::trim) {
            let value = field.parse::<f64>().map_err(|_| DatasetError::Parse {
                path: path.to_path_buf(),
                line: index + 1,
                value: field.to_string(),
            })?;
            values.push(value);
        }

        let found = values.len() - start;
        match columns {
            None => columns = Some(found),
            Some(expected) if expected != found => {
                return Err(DatasetError::Ragged {
                    path: path.to_path_buf(),
                    line: index + 1,
                    expected,
                    found,
                });
            }
            Some(_) => {}
        }
        rows += 1;
    }

    let columns = columns.ok_or_else(|| DatasetError::Empty(path.to_path_buf()))?;
    debug!(path = %path.display(), rows, columns, "read table");
    Array2::from_shape_vec((rows, columns), values)
        .map_err(|e| ReconError::InvalidData(e.to_string()).into())
}

/// Read a single column of samples
pub fn read_samples(path: impl AsRef<Path>) -> Result<Vec<f64>> {
    let path = path.as_ref();
    let table = read_matrix(path)?;
    if table.ncols() != 1 {
        return Err(DatasetError::Ragged {
            path: path.to_path_buf(),
            line: 1,
            expected: 1,
            found: table.ncols(),
        });
    }
    Ok(table.column(0).to_vec())
}

/// Current and voltage recordings of the same neurons, cut to the shorter
/// of the two files
pub fn read_recording(
    current: impl AsRef<Path>,
    voltage: impl AsRef<Path>,
) -> Result<ObservedData> {
    let data = ObservedData::truncated(read_matrix(current)?, read_matrix(voltage)?)?;
    Ok(data)
}

// ============================================================================
// FORMATTING
// ============================================================================

/// `HH:MM:SS:mmm`
pub fn format_elapsed(elapsed: Duration) -> String {
    let millis = elapsed.as_millis();
    format!(
        "{:02}:{:02}:{:02}:{:03}",
        millis / 3_600_000,
        millis / 60_000 % 60,
        millis / 1_000 % 60,
        millis % 1_000
    )
}

/// Parameters in the column order of [`MODEL_HEADER`]
pub fn model_row(state: &NeuronState) -> String {
    join_values(&[
        state.a,
        state.b,
        state.c,
        state.d,
        state.p1,
        state.p2,
        state.p3,
        state.p4,
        state.u,
        state.start_u,
        state.v,
    ])
}

pub fn weights_row(state: &NeuronState) -> String {
    join_values(&state.weights.to_vec())
}

/// `0;1;...;n-1`
pub fn weights_header(num_neurons: usize) -> String {
    (0..num_neurons).map(|i| i.to_string()).collect::<Vec<_>>().join(";")
}

fn join_values(values: &[f64]) -> String {
    values.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(";")
}

fn neuron_file(dir: &Path, stem: &str, neuron: usize) -> PathBuf {
    dir.join(format!("{}_neuron-{}.csv", stem, neuron))
}

fn append_line(path: &Path, line: &str) -> io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{}", line)
}

// ============================================================================
// DIAGNOSTICS
// ============================================================================

fn is_diagnostics_file(name: &str) -> bool {
    const PREFIXES: [&str; 5] = [
        "fitness_",
        "model_",
        "weights_",
        "targetmodel_",
        "targetweights_",
    ];
    name == LOG_FILE || (name.ends_with(".csv") && PREFIXES.iter().any(|p| name.starts_with(p)))
}

/// Delete log and per-generation files of an earlier run. Returns how many
/// files were removed.
pub fn clean_diagnostics(dir: &Path) -> Result<usize> {
    let mut removed = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if entry.file_type()?.is_file() && name.to_str().is_some_and(is_diagnostics_file) {
            fs::remove_file(entry.path())?;
            removed += 1;
        }
    }
    Ok(removed)
}

/// Observer that records every generation into an output directory.
///
/// Observer callbacks cannot fail, so the first write error is kept and
/// returned by [`DiagnosticsWriter::finish`]; later events are still attempted.
#[derive(Debug)]
pub struct DiagnosticsWriter {
    dir: PathBuf,
    error: Option<DatasetError>,
}

impl DiagnosticsWriter {
    /// Create the directory if needed, clear stale diagnostics and start the log
    pub fn create(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let removed = clean_diagnostics(&dir)?;
        if removed > 0 {
            debug!(dir = %dir.display(), removed, "removed stale diagnostics");
        }
        append_line(&dir.join(LOG_FILE), LOG_HEADER)?;
        Ok(Self { dir, error: None })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// First error that occurred while writing, if any
    pub fn finish(self) -> Result<()> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn log(&self, message: &str) -> Result<()> {
        append_line(&self.dir.join(LOG_FILE), message)?;
        Ok(())
    }

    fn start_neuron(&self, neuron: usize, num_neurons: usize) -> Result<()> {
        append_line(&neuron_file(&self.dir, "fitness", neuron), "fitness")?;
        append_line(&neuron_file(&self.dir, "model", neuron), MODEL_HEADER)?;
        append_line(&neuron_file(&self.dir, "weights", neuron), &weights_header(num_neurons))?;
        self.log("Generating initial population,,,")?;
        self.log("Starting reconstruction,,,")
    }

    fn write_generation(&self, report: &GenerationReport) -> Result<()> {
        self.log(&format!(
            "Generation {},{},{},{},{},{}",
            report.generation,
            report.neuron,
            report.best_fitness,
            report.diversity,
            format_elapsed(report.elapsed),
            format_elapsed(report.generation_elapsed)
        ))?;

        let state = &report.best.state;
        append_line(
            &neuron_file(&self.dir, "fitness", report.neuron),
            &report.best_fitness.to_string(),
        )?;
        append_line(&neuron_file(&self.dir, "model", report.neuron), &model_row(state))?;
        append_line(&neuron_file(&self.dir, "weights", report.neuron), &weights_row(state))?;
        Ok(())
    }

    fn write_summary(&self, report: &GenerationReport) -> Result<()> {
        self.log(&format!(
            "Finished after {} generation(s),,{},{},{},",
            report.generation,
            report.best_fitness,
            report.diversity,
            format_elapsed(report.elapsed)
        ))
    }

    fn record(&mut self, result: Result<()>) {
        if let Err(error) = result {
            warn!(dir = %self.dir.display(), %error, "failed to write diagnostics");
            if self.error.is_none() {
                self.error = Some(error);
            }
        }
    }
}

impl ReconstructionObserver for DiagnosticsWriter {
    fn neuron_started(&mut self, neuron: usize, num_neurons: usize) {
        let result = self.start_neuron(neuron, num_neurons);
        self.record(result);
    }

    fn generation_completed(&mut self, report: &GenerationReport) {
        let result = self.write_generation(report);
        self.record(result);
    }

    fn neuron_finished(&mut self, report: &GenerationReport) {
        let result = self.write_summary(report);
        self.record(result);
    }

    fn reconstruction_finished(
        &mut self,
        observed: &ObservedData,
        predicted: &Array2<f64>,
        _models: &[NeuronState],
    ) {
        let result = write_results(&self.dir, observed, predicted);
        self.record(result);
    }
}

// ============================================================================
// RESULT TABLES
// ============================================================================

/// Recorded current and recorded vs. simulated voltage, one pair of files
/// per neuron
pub fn write_results(dir: &Path, observed: &ObservedData, predicted: &Array2<f64>) -> Result<()> {
    if predicted.dim() != observed.voltage().dim() {
        return Err(ReconError::DimensionMismatch(format!(
            "prediction is {:?} but recording is {:?}",
            predicted.dim(),
            observed.voltage().dim()
        ))
        .into());
    }
    fs::create_dir_all(dir)?;

    for n in 0..observed.num_neurons() {
        let mut input = BufWriter::new(File::create(neuron_file(dir, "input", n))?);
        let mut voltage = BufWriter::new(File::create(neuron_file(dir, "voltage", n))?);
        writeln!(input, "current")?;
        writeln!(voltage, "target;model")?;
        for t in 0..observed.timesteps() {
            writeln!(input, "{}", observed.current()[[t, n]])?;
            writeln!(voltage, "{};{}", observed.voltage()[[t, n]], predicted[[t, n]])?;
        }
        input.flush()?;
        voltage.flush()?;
    }
    Ok(())
}

/// Generating parameters and weights of a synthetic network. The voltage
/// column is taken from the reconstruction, which holds the recorded value
/// at the tuning split.
pub fn write_ground_truth(
    dir: &Path,
    ground_truth: &[NeuronState],
    reconstructed: &[NeuronState],
) -> Result<()> {
    if ground_truth.len() != reconstructed.len() {
        return Err(ReconError::DimensionMismatch(format!(
            "{} generated but {} reconstructed neurons",
            ground_truth.len(),
            reconstructed.len()
        ))
        .into());
    }
    fs::create_dir_all(dir)?;

    for (n, (truth, model)) in ground_truth.iter().zip(reconstructed).enumerate() {
        let mut row = truth.clone();
        row.v = model.v;

        let mut file = BufWriter::new(File::create(neuron_file(dir, "targetmodel", n))?);
        writeln!(file, "{}", MODEL_HEADER)?;
        writeln!(file, "{}", model_row(&row))?;
        file.flush()?;

        let mut file = BufWriter::new(File::create(neuron_file(dir, "targetweights", n))?);
        writeln!(file, "{}", weights_header(truth.num_neurons()))?;
        writeln!(file, "{}", weights_row(truth))?;
        file.flush()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array1};
    use spikerecon_fitness::Individual;
    use tempfile::tempdir;

    fn neuron(weights: Array1<f64>) -> NeuronState {
        NeuronState {
            neuron_index: 0,
            a: 0.02,
            b: 0.2,
            c: -65.0,
            d: 8.0,
            p1: 0.04,
            p2: 5.0,
            p3: 140.0,
            p4: 1.0,
            v: -70.0,
            u: -14.0,
            start_u: -13.5,
            weights,
        }
    }

    fn report(generation: usize, fitness: f64) -> GenerationReport {
        GenerationReport {
            generation,
            neuron: 0,
            best_fitness: fitness,
            diversity: 0.5,
            elapsed: Duration::from_millis(61_042),
            generation_elapsed: Duration::from_millis(250),
            best: Individual {
                state: neuron(array![0.0, 1.5]),
                fitness,
            },
        }
    }

    fn read(path: PathBuf) -> String {
        fs::read_to_string(path).unwrap()
    }

    #[test]
    fn test_format_elapsed() {
        assert_eq!(format_elapsed(Duration::ZERO), "00:00:00:000");
        assert_eq!(format_elapsed(Duration::from_millis(3_723_004)), "01:02:03:004");
        assert_eq!(format_elapsed(Duration::from_secs(100 * 3600)), "100:00:00:000");
    }

    #[test]
    fn test_rows() {
        let state = neuron(array![0.0, 1.5, -2.0]);
        assert_eq!(model_row(&state), "0.02;0.2;-65;8;0.04;5;140;1;-14;-13.5;-70");
        assert_eq!(weights_row(&state), "0;1.5;-2");
        assert_eq!(weights_header(3), "0;1;2");
    }

    #[test]
    fn test_read_matrix() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("voltage.csv");
        fs::write(&path, "-65.0;-70\n\n-64.5 ; 31.2\n").unwrap();

        let table = read_matrix(&path).unwrap();
        assert_eq!(table, array![[-65.0, -70.0], [-64.5, 31.2]]);
        assert!(matches!(read_samples(&path), Err(DatasetError::Ragged { found: 2, .. })));
    }

    #[test]
    fn test_read_errors() {
        let dir = tempdir().unwrap();

        let bad = dir.path().join("bad.csv");
        fs::write(&bad, "1.0\nabc\n").unwrap();
        assert!(matches!(read_samples(&bad), Err(DatasetError::Parse { line: 2, .. })));

        let ragged = dir.path().join("ragged.csv");
        fs::write(&ragged, "1;2\n3\n").unwrap();
        assert!(matches!(
            read_matrix(&ragged),
            Err(DatasetError::Ragged { line: 2, expected: 2, found: 1, .. })
        ));

        let empty = dir.path().join("empty.csv");
        fs::write(&empty, "\n\n").unwrap();
        assert!(matches!(read_matrix(&empty), Err(DatasetError::Empty(_))));

        assert!(matches!(
            read_matrix(dir.path().join("missing.csv")),
            Err(DatasetError::IoError(_))
        ));
    }

    #[test]
    fn test_read_recording_truncates() {
        let dir = tempdir().unwrap();
        let current = dir.path().join("input.csv");
        let voltage = dir.path().join("voltage.csv");
        fs::write(&current, "0\n1\n2\n3\n").unwrap();
        fs::write(&voltage, "-65\n-64\n-63\n").unwrap();

        let data = read_recording(&current, &voltage).unwrap();
        assert_eq!(data.timesteps(), 3);
        assert_eq!(data.num_neurons(), 1);
        assert_eq!(data.current()[[2, 0]], 2.0);
        assert_eq!(read_samples(&voltage).unwrap(), vec![-65.0, -64.0, -63.0]);
    }

    #[test]
    fn test_diagnostics_files() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("fitness_neuron-7.csv"), "old").unwrap();
        fs::write(dir.path().join(LOG_FILE), "old").unwrap();
        fs::write(dir.path().join("notes.txt"), "keep").unwrap();

        let mut writer = DiagnosticsWriter::create(dir.path()).unwrap();
        assert!(!dir.path().join("fitness_neuron-7.csv").exists());
        assert!(dir.path().join("notes.txt").exists());

        writer.neuron_started(0, 2);
        writer.generation_completed(&report(0, 0.5));
        writer.generation_completed(&report(1, 0.25));
        writer.neuron_finished(&report(1, 0.25));
        writer.finish().unwrap();

        let log = read(dir.path().join(LOG_FILE));
        let lines: Vec<&str> = log.lines().collect();
        assert_eq!(lines[0], LOG_HEADER);
        assert_eq!(lines[1], "Generating initial population,,,");
        assert_eq!(lines[2], "Starting reconstruction,,,");
        assert_eq!(lines[3], "Generation 0,0,0.5,0.5,00:01:01:042,00:00:00:250");
        assert_eq!(lines[5], "Finished after 1 generation(s),,0.25,0.5,00:01:01:042,");

        assert_eq!(read(dir.path().join("fitness_neuron-0.csv")), "fitness\n0.5\n0.25\n");
        let model = read(dir.path().join("model_neuron-0.csv"));
        assert_eq!(model.lines().next(), Some(MODEL_HEADER));
        assert_eq!(model.lines().count(), 3);
        assert_eq!(read(dir.path().join("weights_neuron-0.csv")), "0;1\n0;1.5\n0;1.5\n");
    }

    #[test]
    fn test_write_results() {
        let dir = tempdir().unwrap();
        let observed = ObservedData::new(
            array![[1.0, 2.0], [3.0, 4.0]],
            array![[-65.0, -60.0], [31.0, -59.0]],
        )
        .unwrap();
        let predicted = array![[0.0, 0.0], [30.5, -58.0]];

        write_results(dir.path(), &observed, &predicted).unwrap();
        assert_eq!(read(dir.path().join("input_neuron-1.csv")), "current\n2\n4\n");
        assert_eq!(read(dir.path().join("voltage_neuron-0.csv")), "target;model\n-65;0\n31;30.5\n");

        let wrong = Array2::zeros((1, 2));
        assert!(matches!(
            write_results(dir.path(), &observed, &wrong),
            Err(DatasetError::Core(ReconError::DimensionMismatch(_)))
        ));
    }

    #[test]
    fn test_write_ground_truth() {
        let dir = tempdir().unwrap();
        let truth = neuron(array![0.0, 4.0]);
        let mut reconstructed = neuron(array![0.0, 3.5]);
        reconstructed.v = -61.25;

        write_ground_truth(dir.path(), &[truth], &[reconstructed]).unwrap();
        let model = read(dir.path().join("targetmodel_neuron-0.csv"));
        assert!(model.ends_with(";-13.5;-61.25\n"));
        assert_eq!(read(dir.path().join("targetweights_neuron-0.csv")), "0;1\n0;4\n");
    }
}
