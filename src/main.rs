use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use motion_model::artifacts::{export_model, export_random, write_json};
use motion_model::io::{load_field, load_mask, load_sample_set, volume_stem};
use motion_model::qc::{check_composition_consistency, displacement_magnitude, jacobian_report};
use motion_model::{fit, ModelConfig, QcThresholds, RandomConfig, SweepConfig};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "motion-model")]
#[command(about = "Statistical motion model over dense displacement fields")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fit a model and write volumes, coordinates, sweep fields and QC reports
    Fit {
        /// Sample displacement fields (NIfTI vector volumes), in fit order
        #[arg(required = true, num_args = 2..)]
        samples: Vec<PathBuf>,

        /// Analysis mask on the sample grid
        #[arg(short, long)]
        mask: PathBuf,

        /// Anatomical mask for QC (defaults to the analysis mask)
        #[arg(long)]
        qc_mask: Option<PathBuf>,

        /// Output directory
        #[arg(short, long, default_value = "results/pca")]
        output: PathBuf,

        /// Retain at most this many modes
        #[arg(short = 'k', long)]
        n_components: Option<usize>,

        /// Number of leading modes to sweep
        #[arg(long, default_value_t = 2)]
        sweep_modes: usize,

        /// Sweep magnitudes in SD units
        #[arg(long, value_delimiter = ',', allow_hyphen_values = true, default_value = "-2,-1,1,2")]
        betas: Vec<f64>,

        /// Also draw this many random fields from the model
        #[arg(long, default_value_t = 0)]
        n_random: usize,

        /// Standard deviation of the random coefficients, SD units
        #[arg(long, default_value_t = 1.0)]
        variation_scale: f64,

        /// Seed for the random fields
        #[arg(long, default_value_t = 0)]
        seed: u64,

        /// Use the strict Jacobian gates
        #[arg(long)]
        strict: bool,

        /// Exit with an error when any QC gate fails
        #[arg(long)]
        fail_on_qc: bool,
    },

    /// Jacobian determinant QC of displacement fields
    Jacobian {
        /// Fields to check
        #[arg(required = true)]
        fields: Vec<PathBuf>,

        /// Anatomical mask on the field grid
        #[arg(short, long)]
        mask: PathBuf,

        /// Write the report here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Use the strict gates
        #[arg(long)]
        strict: bool,

        /// Exit with an error when any field fails
        #[arg(long)]
        fail_on_qc: bool,
    },

    /// Inverse consistency of a forward/backward field pair
    Compose {
        /// Forward field (A to B)
        forward: PathBuf,

        /// Backward field (B to A)
        backward: PathBuf,

        /// Mask on the field grid
        #[arg(short, long)]
        mask: PathBuf,

        /// Write the report here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Exit with an error when the pair is graded as a warning
        #[arg(long)]
        fail_on_qc: bool,
    },

    /// Displacement magnitude distribution of fields
    Magnitude {
        /// Fields to summarize
        #[arg(required = true)]
        fields: Vec<PathBuf>,

        /// Mask on the field grid
        #[arg(short, long)]
        mask: PathBuf,

        /// Write the report here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Fit {
            samples,
            mask,
            qc_mask,
            output,
            n_components,
            sweep_modes,
            betas,
            n_random,
            variation_scale,
            seed,
            strict,
            fail_on_qc,
        } => {
            let config = match n_components {
                Some(k) => ModelConfig::default().with_n_components(k),
                None => ModelConfig::default(),
            };
            let sweep = SweepConfig::default()
                .with_n_modes(sweep_modes)
                .with_betas(betas);
            let random = (n_random > 0).then(|| {
                RandomConfig::default()
                    .with_n_samples(n_random)
                    .with_variation_scale(variation_scale)
                    .with_seed(seed)
            });
            let args = FitArgs {
                samples: &samples,
                mask: &mask,
                qc_mask: qc_mask.as_deref(),
                output: &output,
                config,
                sweep,
                random,
                thresholds: thresholds(strict),
            };
            let passed = run_fit(&args)?;
            if fail_on_qc && !passed {
                anyhow::bail!("QC gates failed; see reports in {}", output.display());
            }
        }
        Commands::Jacobian {
            fields,
            mask,
            output,
            strict,
            fail_on_qc,
        } => {
            let passed = run_jacobian(&fields, &mask, output.as_deref(), &thresholds(strict))?;
            if fail_on_qc && !passed {
                anyhow::bail!("Jacobian gates failed");
            }
        }
        Commands::Compose {
            forward,
            backward,
            mask,
            output,
            fail_on_qc,
        } => {
            let passed = run_compose(&forward, &backward, &mask, output.as_deref())?;
            if fail_on_qc && !passed {
                anyhow::bail!("forward/backward pair is not inverse-consistent");
            }
        }
        Commands::Magnitude {
            fields,
            mask,
            output,
        } => {
            run_magnitude(&fields, &mask, output.as_deref())?;
        }
    }

    Ok(())
}

fn thresholds(strict: bool) -> QcThresholds {
    if strict {
        QcThresholds::strict()
    } else {
        QcThresholds::default()
    }
}

struct FitArgs<'a> {
    samples: &'a [PathBuf],
    mask: &'a Path,
    qc_mask: Option<&'a Path>,
    output: &'a Path,
    config: ModelConfig,
    sweep: SweepConfig,
    random: Option<RandomConfig>,
    thresholds: QcThresholds,
}

fn run_fit(args: &FitArgs<'_>) -> Result<bool> {
    let samples = load_sample_set(args.samples).context("Failed to load sample fields")?;
    let mask = load_mask(args.mask).context("Failed to load analysis mask")?;
    let qc_mask = match args.qc_mask {
        Some(path) => load_mask(path).context("Failed to load QC mask")?,
        None => mask.clone(),
    };

    let model = fit(&samples, &mask, &args.config).context("Fit failed")?;
    if model.is_degenerate() {
        warn!(
            n_components = model.n_components(),
            "fewer than 2 modes retained; sweep and QC cover only what exists"
        );
    }

    let summary = export_model(
        &model,
        &samples,
        &qc_mask,
        &args.sweep,
        &args.thresholds,
        args.output,
    )
    .context("Failed to write artifacts")?;

    for (k, ratio) in summary.metadata.variance_explained.iter().enumerate() {
        info!(
            mode = k + 1,
            sd_mm = summary.betas.per_mode_sd_mm[k],
            "variance explained {:.1}%",
            100.0 * ratio
        );
    }
    for id in summary.jacobian.failures() {
        warn!(field = id, "Jacobian gate failed");
    }

    let mut n_files = summary.files.len();
    if let Some(random) = &args.random {
        let (files, _) = export_random(&model, random, args.output)
            .context("Failed to write random fields")?;
        n_files += files.len();
    }

    info!(
        files = n_files,
        output = %args.output.display(),
        qc_passed = summary.qc_passed(),
        "fit complete"
    );
    Ok(summary.qc_passed())
}

fn run_jacobian(
    paths: &[PathBuf],
    mask: &Path,
    output: Option<&Path>,
    thresholds: &QcThresholds,
) -> Result<bool> {
    let mask = load_mask(mask).context("Failed to load mask")?;
    let fields = paths
        .iter()
        .map(|p| {
            load_field(p)
                .with_context(|| format!("Failed to load {}", p.display()))
                .map(|f| (volume_stem(p), f))
        })
        .collect::<Result<Vec<_>>>()?;

    let named: Vec<(&str, &_)> = fields.iter().map(|(id, f)| (id.as_str(), f)).collect();
    let report = jacobian_report(&named, &mask, thresholds)?;

    emit(&report, output)?;
    Ok(report.passed())
}

fn run_compose(
    forward: &Path,
    backward: &Path,
    mask: &Path,
    output: Option<&Path>,
) -> Result<bool> {
    let mask = load_mask(mask).context("Failed to load mask")?;
    let forward = load_field(forward)
        .with_context(|| format!("Failed to load {}", forward.display()))?;
    let backward = load_field(backward)
        .with_context(|| format!("Failed to load {}", backward.display()))?;

    let report = check_composition_consistency(&forward, &backward, &mask, &QcThresholds::default())?;
    info!(
        median_mm = report.residual.median_mm,
        p95_mm = report.residual.p95_mm,
        grade = ?report.grade,
        "composition consistency"
    );
    emit(&report, output)?;
    Ok(report.passed)
}

fn run_magnitude(paths: &[PathBuf], mask: &Path, output: Option<&Path>) -> Result<()> {
    let mask = load_mask(mask).context("Failed to load mask")?;
    let mut report = BTreeMap::new();
    for path in paths {
        let field =
            load_field(path).with_context(|| format!("Failed to load {}", path.display()))?;
        report.insert(volume_stem(path), displacement_magnitude(&field, &mask)?);
    }
    emit(&report, output)
}

fn emit<T: serde::Serialize>(report: &T, output: Option<&Path>) -> Result<()> {
    match output {
        Some(path) => {
            write_json(report, path)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            info!(path = %path.display(), "wrote report");
        }
        None => println!("{}", serde_json::to_string_pretty(report)?),
    }
    Ok(())
}
