use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};

use pta_cw_sampler::checkpoint::Snapshot;
use pta_cw_sampler::config::{AmplitudePrior, SamplerConfig};
use pta_cw_sampler::data::{load_pulsars, time_span, DistancePriors, NoiseDictionary};
use pta_cw_sampler::empirical::EmpiricalSet;
use pta_cw_sampler::io::csv::CsvCheckpoint;
use pta_cw_sampler::likelihood::cw::CwLikelihood;
use pta_cw_sampler::params::ParameterSpace;
use pta_cw_sampler::proposal::ProposalEngine;
use pta_cw_sampler::{ParallelTempering, Result};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum AmplitudeArg {
    /// Uniform in log10 h.
    Detection,
    /// Uniform in h.
    UpperLimit,
}

#[derive(Parser, Debug)]
#[command(name = "pta-cw-sampler")]
#[command(about = "Parallel-tempered MCMC search for continuous gravitational waves in PTA data")]
#[command(version)]
struct Cli {
    /// JSON array of pulsars.
    data: PathBuf,

    /// Sample table to write (CSV). Summary and snapshot are written next to it.
    save_file: PathBuf,

    #[arg(long, default_value = "./data/fake_pta_noisefile.json")]
    noise_file: PathBuf,

    /// Empirical red-noise distributions; the empirical proposal is disabled without it.
    #[arg(long)]
    rn_file: Option<PathBuf>,

    /// Per-pulsar distance priors; pulsars must carry the placeholder distance [0, 1].
    #[arg(long)]
    psr_dist_file: Option<PathBuf>,

    #[arg(short, long = "n-iter", default_value = "5000000")]
    n_iter: u64,

    #[arg(long, default_value = "3.0")]
    t_max: f64,

    #[arg(long, default_value = "4")]
    n_chain: usize,

    /// Number of coldest chains whose samples are saved.
    #[arg(long, default_value = "1")]
    n_save: usize,

    #[arg(long)]
    fix_rn: bool,

    #[arg(long)]
    zero_rn: bool,

    #[arg(long)]
    fix_gwb: bool,

    #[arg(long)]
    zero_gwb: bool,

    /// Sample the noise model only.
    #[arg(long)]
    exclude_cw: bool,

    #[arg(long, default_value = "2.5e-8")]
    freq_max: f64,

    /// Lower CW frequency bound; defaults to 1 / T_span.
    #[arg(long)]
    freq_min: Option<f64>,

    #[arg(long, default_value = "10.0")]
    m_max: f64,

    #[arg(long, default_value = "16")]
    gwb_comps: usize,

    /// Thinning of the saved samples; defaults to max(1, n_iter / 1_000_000).
    #[arg(long)]
    thin: Option<u64>,

    #[arg(long, default_value = "100000")]
    save_every: u64,

    /// Recompute full-matrix Fisher groups only every this many blocks.
    #[arg(long, default_value = "1")]
    fisher_eig_downsample: u64,

    #[arg(long, value_enum, default_value = "detection")]
    amplitude_prior: AmplitudeArg,

    #[arg(long)]
    seed: Option<u64>,

    /// Continue from the snapshot next to the sample table.
    #[arg(long)]
    resume: bool,

    #[arg(long)]
    progress: bool,

    #[arg(long, default_value = "info")]
    log_level: tracing::Level,

    /// Export the finished sample table to this Parquet file.
    #[cfg(feature = "parquet")]
    #[arg(long)]
    parquet: Option<PathBuf>,
}

impl Cli {
    fn config(&self) -> SamplerConfig {
        SamplerConfig {
            t_max: self.t_max,
            n_chain: self.n_chain,
            n_iterations: self.n_iter,
            save_every_n: self.save_every,
            thin: self.thin.unwrap_or((self.n_iter / 1_000_000).max(1)),
            n_save: self.n_save,
            seed: self.seed,
            freq_min: self.freq_min,
            freq_max: self.freq_max,
            m_max: self.m_max,
            amplitude_prior: match self.amplitude_prior {
                AmplitudeArg::Detection => AmplitudePrior::Detection,
                AmplitudeArg::UpperLimit => AmplitudePrior::UpperLimit,
            },
            gwb_comps: self.gwb_comps,
            fisher_eig_downsample: self.fisher_eig_downsample,
            fix_rn: self.fix_rn,
            zero_rn: self.zero_rn,
            fix_gwb: self.fix_gwb,
            zero_gwb: self.zero_gwb,
            include_cw: !self.exclude_cw,
            show_progress: self.progress,
            ..SamplerConfig::default()
        }
    }
}

fn run(cli: &Cli) -> Result<()> {
    let config = cli.config();
    // configuration errors surface before any data is read
    config.schedule()?;

    let mut pulsars = load_pulsars(&cli.data)?;
    if let Some(path) = &cli.psr_dist_file {
        DistancePriors::load(path)?.apply(&mut pulsars)?;
    }
    let noise = NoiseDictionary::load(&cli.noise_file)?;
    let (_, t_span) = time_span(&pulsars);
    info!(
        n_pulsars = pulsars.len(),
        t_span_years = t_span / (365.25 * 86400.0),
        "loaded pulsar data"
    );

    let space = ParameterSpace::for_pta(&pulsars, &noise, &config, t_span)?;
    let likelihood = CwLikelihood::new(&pulsars, &noise, &space, &config)?;
    let empirical = match &cli.rn_file {
        Some(path) => EmpiricalSet::new(EmpiricalSet::load_histograms(path)?, &space)?,
        None => EmpiricalSet::empty(&space),
    };
    info!(
        n_params = space.len(),
        n_empirical = empirical.len(),
        "parameter space ready"
    );
    let engine = ProposalEngine::new(&config, empirical);

    let retries = config.checkpoint_retries;
    let summary = if cli.resume {
        let writer = CsvCheckpoint::resume(&cli.save_file, space.names(), retries)?;
        let snapshot = Snapshot::load(writer.state_path())?;
        ParallelTempering::resume(&likelihood, &space, &engine, &config, writer, snapshot)?.run()?
    } else {
        let writer = CsvCheckpoint::create(&cli.save_file, space.names(), retries)?;
        ParallelTempering::new(&likelihood, &space, &engine, &config, writer)?.run()?
    };
    info!("run complete\n{summary}");

    #[cfg(feature = "parquet")]
    if let Some(path) = &cli.parquet {
        let (names, rows) = pta_cw_sampler::io::csv::read_samples(&cli.save_file)?;
        pta_cw_sampler::io::parquet::save_parquet(&names, &rows, path)
            .map_err(|e| pta_cw_sampler::Error::Checkpoint(format!("parquet export failed: {e}")))?;
        info!(path = %path.display(), rows = rows.len(), "exported samples to parquet");
    }
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(cli.log_level)
        .with_target(false)
        .init();

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
