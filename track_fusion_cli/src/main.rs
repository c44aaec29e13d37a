use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueHint};
use track_fusion::io::{
    diagnose_track_csv, read_track_file, read_variable_file, write_environment,
    write_trajectories, write_training, Variable,
};
use track_fusion::{
    chronological_split, load_entities, load_environment, merge_environment, resample_entities,
    resample_track, run_batch, EntitySource, EnvironmentSource, Params, TrackError,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Trajectory resampling and environmental fusion CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Resample tracks, join environmental readings and write next-position training rows
    Build(BuildArgs),
    /// Resample tracks onto the fixed time grid only
    Resample(ResampleArgs),
    /// Outer-join per-variable environmental tables into one combined table
    MergeEnv(MergeEnvArgs),
    /// Report per-file parse problems and depth codes for track tables
    Diagnose(DiagnoseArgs),
}

#[derive(Parser, Debug)]
struct ParamArgs {
    /// JSON parameter file; flags below override its fields
    #[arg(long, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// Resample step in seconds
    #[arg(long)]
    step: Option<f64>,

    /// Decimal places used for the environmental join key
    #[arg(long)]
    decimals: Option<u32>,

    /// Lower bound of the depth class
    #[arg(long = "depth-min", allow_negative_numbers = true)]
    depth_min: Option<i64>,

    /// Upper bound of the depth class
    #[arg(long = "depth-max", allow_negative_numbers = true)]
    depth_max: Option<i64>,
}

impl ParamArgs {
    fn resolve(&self) -> Result<Params> {
        let mut params = match self.config.as_ref() {
            Some(path) => Params::from_json_file(path)?,
            None => Params::default(),
        };
        if let Some(step) = self.step {
            params.step_s = step;
        }
        if let Some(decimals) = self.decimals {
            params.join_decimals = decimals;
        }
        if let Some(min) = self.depth_min {
            params.depth_min = min;
        }
        if let Some(max) = self.depth_max {
            params.depth_max = max;
        }
        params.validate()?;
        Ok(params)
    }
}

#[derive(Parser, Debug)]
struct BuildArgs {
    /// Track CSV files, one entity per file
    #[arg(required = true, value_hint = ValueHint::FilePath)]
    inputs: Vec<PathBuf>,

    /// Combined environmental table (latitude, longitude, year, temperature, chlorophyll)
    #[arg(long, value_hint = ValueHint::FilePath, conflicts_with_all = ["chlorophyll", "temperature"])]
    env: Option<PathBuf>,

    /// Chlorophyll table, merged with --temperature before the join
    #[arg(long, value_hint = ValueHint::FilePath, requires = "temperature")]
    chlorophyll: Option<PathBuf>,

    /// Temperature table, merged with --chlorophyll before the join
    #[arg(long, value_hint = ValueHint::FilePath, requires = "chlorophyll")]
    temperature: Option<PathBuf>,

    /// Training CSV path (`-` for stdout)
    #[arg(short, long, default_value = "training.csv", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    /// Also write the resampled trajectories here
    #[arg(long, value_hint = ValueHint::FilePath)]
    trajectories: Option<PathBuf>,

    /// Hold out the trailing rows for testing and write them here
    #[arg(long = "test-output", value_hint = ValueHint::FilePath)]
    test_output: Option<PathBuf>,

    /// Fraction of rows held out (chronological, no shuffling)
    #[arg(long = "test-fraction")]
    test_fraction: Option<f64>,

    /// Name entities PREFIX_1, PREFIX_2, ... instead of by file stem
    #[arg(long = "id-prefix")]
    id_prefix: Option<String>,

    /// Write a JSON batch report
    #[arg(long, value_hint = ValueHint::FilePath)]
    report: Option<PathBuf>,

    #[command(flatten)]
    params: ParamArgs,

    /// Profile major stages with timings
    #[arg(long, action = ArgAction::SetTrue)]
    profile: bool,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Parser, Debug)]
struct ResampleArgs {
    /// Track CSV files, one entity per file
    #[arg(required = true, value_hint = ValueHint::FilePath)]
    inputs: Vec<PathBuf>,

    /// Output CSV path (`-` for stdout)
    #[arg(short, long, default_value = "resampled.csv", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    /// Name entities PREFIX_1, PREFIX_2, ... instead of by file stem
    #[arg(long = "id-prefix")]
    id_prefix: Option<String>,

    #[command(flatten)]
    params: ParamArgs,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Parser, Debug)]
struct MergeEnvArgs {
    /// Chlorophyll table (latitude, longitude, chlorophyll, year)
    #[arg(long, value_hint = ValueHint::FilePath)]
    chlorophyll: PathBuf,

    /// Temperature table (latitude, longitude, temperature, year)
    #[arg(long, value_hint = ValueHint::FilePath)]
    temperature: PathBuf,

    /// Output CSV path (`-` for stdout)
    #[arg(short, long, default_value = "environment.csv", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Parser, Debug)]
struct DiagnoseArgs {
    /// Track CSV files to inspect
    #[arg(required = true, value_hint = ValueHint::FilePath)]
    inputs: Vec<PathBuf>,

    /// Output report path
    #[arg(short, long, default_value = "track_diagnostics.txt", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    #[command(flatten)]
    params: ParamArgs,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let verbose = match &cli.command {
        Command::Build(args) => args.verbose,
        Command::Resample(args) => args.verbose,
        Command::MergeEnv(args) => args.verbose,
        Command::Diagnose(args) => args.verbose,
    };
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();

    match cli.command {
        Command::Build(args) => handle_build(args),
        Command::Resample(args) => handle_resample(args),
        Command::MergeEnv(args) => handle_merge_env(args),
        Command::Diagnose(args) => handle_diagnose(args),
    }
}

fn handle_build(args: BuildArgs) -> Result<()> {
    let mut params = args.params.resolve()?;
    if let Some(fraction) = args.test_fraction {
        params.test_fraction = fraction;
        params.validate()?;
    }
    if params.test_fraction > 0.0 && args.test_output.is_none() {
        return Err(anyhow!("--test-fraction needs --test-output"));
    }
    let timed = args.profile || args.verbose;

    let env_source = match (&args.env, &args.chlorophyll, &args.temperature) {
        (Some(path), _, _) => EnvironmentSource::Combined(path.clone()),
        (None, Some(chl), Some(temp)) => EnvironmentSource::PerVariable {
            chlorophyll: chl.clone(),
            temperature: temp.clone(),
        },
        _ => EnvironmentSource::None,
    };

    let t_env = Instant::now();
    let index = load_environment(&env_source, params.join_decimals);
    if timed {
        info!(
            "Environment stage: {:.1} ms ({} keys)",
            t_env.elapsed().as_secs_f64() * 1000.0,
            index.len()
        );
    }

    let t_load = Instant::now();
    let sources = EntitySource::from_paths(&args.inputs, args.id_prefix.as_deref());
    let inputs = load_entities(&sources);
    if timed {
        info!(
            "Parse stage: {:.1} ms ({} files)",
            t_load.elapsed().as_secs_f64() * 1000.0,
            inputs.len()
        );
    }

    let t_compute = Instant::now();
    let batch = run_batch(inputs, &index, &params)?;
    if timed {
        info!(
            "Compute stage: {:.1} ms ({} examples)",
            t_compute.elapsed().as_secs_f64() * 1000.0,
            batch.examples.len()
        );
    }

    if let Some(path) = args.trajectories.as_ref() {
        write_trajectories(&batch.trajectories, create(path)?)
            .with_context(|| format!("failed to write {}", path.display()))?;
        info!("Wrote resampled trajectories: {}", path.display());
    }

    let t_csv = Instant::now();
    let (train, test) = chronological_split(batch.examples, params.test_fraction);
    write_rows(&args.output, |w| write_training(&train, w))?;
    if let Some(path) = args.test_output.as_ref() {
        write_training(&test, create(path)?)
            .with_context(|| format!("failed to write {}", path.display()))?;
        info!("Wrote test split: {} ({} rows)", path.display(), test.len());
    }
    if timed {
        info!(
            "CSV stage: {:.1} ms ({} rows)",
            t_csv.elapsed().as_secs_f64() * 1000.0,
            train.len() + test.len()
        );
    }

    if let Some(path) = args.report.as_ref() {
        batch
            .report
            .write_json(path)
            .with_context(|| format!("failed to write {}", path.display()))?;
        info!("Wrote batch report: {}", path.display());
    }
    Ok(())
}

fn handle_resample(args: ResampleArgs) -> Result<()> {
    let params = args.params.resolve()?;
    let sources = EntitySource::from_paths(&args.inputs, args.id_prefix.as_deref());
    let outcomes = resample_entities(load_entities(&sources), &params);

    let mut trajectories = Vec::new();
    for outcome in outcomes {
        match outcome.result {
            Ok(trajectory) => trajectories.push(trajectory),
            Err(err) => warn!(entity = %outcome.entity_id, error = %err, "skipping entity"),
        }
    }
    if trajectories.is_empty() {
        return Err(TrackError::EmptyBatch.into());
    }
    info!(
        "Resampled {} entities ({} points)",
        trajectories.len(),
        trajectories.iter().map(|t| t.len()).sum::<usize>()
    );
    write_rows(&args.output, |w| write_trajectories(&trajectories, w))
}

fn handle_merge_env(args: MergeEnvArgs) -> Result<()> {
    let chlorophyll = read_variable_file(&args.chlorophyll, Variable::Chlorophyll)
        .with_context(|| format!("failed to read {}", args.chlorophyll.display()))?;
    let temperature = read_variable_file(&args.temperature, Variable::Temperature)
        .with_context(|| format!("failed to read {}", args.temperature.display()))?;
    let merged = merge_environment(chlorophyll, temperature);
    info!("Merged environmental table: {} keys", merged.len());
    write_rows(&args.output, |w| write_environment(&merged, w))
}

fn handle_diagnose(args: DiagnoseArgs) -> Result<()> {
    let params = args.params.resolve()?;
    let mut report = String::new();

    for path in &args.inputs {
        let file = File::open(path).with_context(|| format!("failed to read {}", path.display()))?;
        let diag = diagnose_track_csv(file)
            .with_context(|| format!("failed to parse {}", path.display()))?;

        report.push_str(&format!("FILE: {}\n", path.display()));
        report.push_str(&format!("  rows: {}\n", diag.rows));
        report.push_str(&format!("  parsed_rows: {}\n", diag.parsed_rows));
        report.push_str(&format!(
            "  distinct_timestamps: {}\n",
            diag.distinct_timestamps
        ));
        if let Some(span) = diag.timespan_s {
            report.push_str(&format!("  timespan_s: {:.1}\n", span));
        }
        if let Some(year) = diag.first_year {
            report.push_str(&format!("  year: {}\n", year));
        }
        if let Some(err) = diag.first_error.as_ref() {
            report.push_str(&format!("  first_error: {}\n", err));
        }

        if !diag.depth_codes.is_empty() {
            report.push_str(&format!(
                "  depth_codes (non-numeric={}):\n",
                diag.non_numeric_codes
            ));
            let mut entries: Vec<_> = diag.depth_codes.iter().collect();
            entries.sort_by(|a, b| b.1.cmp(a.1));
            for (code, count) in entries.into_iter().take(25) {
                let label = if code.is_empty() { "<blank>" } else { code.as_str() };
                report.push_str(&format!("    - {}: {}\n", label, count));
            }
        }

        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let verdict = read_track_file(path)
            .and_then(|fixes| resample_track(&stem, fixes, &params))
            .map(|trajectory| format!("ok ({} resampled points)", trajectory.len()))
            .unwrap_or_else(|err| format!("{} ({})", err.kind(), err));
        report.push_str(&format!("  verdict: {}\n", verdict));
        report.push('\n');
    }

    fs::write(&args.output, report)
        .with_context(|| format!("failed to write {}", args.output.display()))?;
    info!("Diagnostic report written: {}", args.output.display());
    Ok(())
}

fn create(path: &Path) -> Result<File> {
    File::create(path).with_context(|| format!("failed to create {}", path.display()))
}

/// Route a CSV writer to stdout for `-`, otherwise to a freshly created file.
fn write_rows<F>(output: &Path, write: F) -> Result<()>
where
    F: FnOnce(&mut dyn Write) -> Result<(), TrackError>,
{
    if output.as_os_str() == "-" {
        let stdout = io::stdout();
        let mut handle = stdout.lock();
        write(&mut handle)?;
    } else {
        let mut file = create(output)?;
        write(&mut file).with_context(|| format!("failed to write {}", output.display()))?;
        info!("Wrote CSV: {}", output.display());
    }
    Ok(())
}
