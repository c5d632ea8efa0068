//! mutmap - map causative mutations by comparing wild-type and mutant read pools

use anyhow::{bail, Context};
use clap::Parser;
use env_logger::Env;
use mutmap_rs::{
    candidates::VariantAnnotator,
    candidates::VariantCaller,
    external::{check_program, BcftoolsCaller, NoopAnnotator, SnpEffAnnotator, VcfFileCaller},
    output::{write_candidates, write_summary},
    pileup::{find_index, BamPileupSource},
    pipeline::{run_pipeline, Collaborators},
    state::{CheckpointStore, PipelineState},
    utils::{get_num_cpus, Timer},
    validate_config, validate_pool_files, MapConfig, MutmapError, Pool,
};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "mutmap")]
#[command(about = "Map causative mutations from pooled wild-type and mutant sequencing")]
#[command(long_about = "
mutmap compares allele frequencies between a wild-type pool and a mutant pool
of a forward genetic screen and reports candidate causative variants.

The analysis runs five stages per chromosome:
1. Distance: depth-weighted allele frequency distance at informative positions
2. Smoothing: loess regression of the distances along the chromosome
3. Peak finding: local maxima of the smoothed track above a prominence
4. Refinement: permutation p-values and confidence intervals for each peak
5. Candidates: variants called and annotated inside each peak interval

A checkpoint is written after every stage. Use --resume to continue an
interrupted run from its last completed stage with the parameters it started with.

Alignment files must be coordinate-sorted and indexed (.bai, .csi or .crai).
")]
struct Args {
    /// Alignment files of the wild-type (or wild-type sibling) pool
    #[arg(long, value_name = "FILE", num_args = 1.., required = true)]
    wild_type: Vec<PathBuf>,

    /// Alignment files of the mutant pool
    #[arg(long, value_name = "FILE", num_args = 1.., required = true)]
    mutant: Vec<PathBuf>,

    /// Reference FASTA used for variant calling
    #[arg(long, value_name = "FILE", required_unless_present = "vcf")]
    reference: Option<PathBuf>,

    /// Use variants from a pre-called VCF instead of running bcftools
    #[arg(long, value_name = "FILE")]
    vcf: Option<PathBuf>,

    /// snpEff genome database; variants are left unannotated without it
    #[arg(long, value_name = "GENOME")]
    snpeff_genome: Option<String>,

    /// bcftools executable
    #[arg(long, default_value = "bcftools")]
    bcftools: PathBuf,

    /// snpEff executable
    #[arg(long, default_value = "snpEff")]
    snpeff: PathBuf,

    /// Chromosomes to analyze (comma separated); defaults to all
    #[arg(long, value_delimiter = ',')]
    chromosomes: Vec<String>,

    /// Directory for checkpoints, candidates and the run summary
    #[arg(long, value_name = "DIR")]
    output_dir: PathBuf,

    /// Resume from the latest checkpoint in the output directory
    #[arg(long)]
    resume: bool,

    /// Write candidates.tsv.gz instead of candidates.tsv
    #[arg(long)]
    gzip: bool,

    /// Minimum read depth in each pool
    #[arg(long, default_value_t = 10)]
    min_depth: u32,

    /// Minimum combined minor-allele frequency
    #[arg(long, default_value_t = 0.05)]
    min_allele_freq: f64,

    /// Depth pseudocount of the distance confidence weight
    #[arg(long, default_value_t = 10.0)]
    depth_pseudocount: f64,

    /// Loess span as a fraction of the chromosome
    #[arg(long, default_value_t = 0.3)]
    loess_span: f64,

    /// Loess local polynomial degree (0, 1 or 2)
    #[arg(long, default_value_t = 1)]
    loess_degree: usize,

    /// Choose the loess span per chromosome by AICc
    #[arg(long)]
    optimize_span: bool,

    /// Minimum peak prominence
    #[arg(long, default_value_t = 0.05)]
    min_prominence: f64,

    /// Number of permutation trials per chromosome
    #[arg(long, default_value_t = 200)]
    permutations: usize,

    /// Minimum usable null samples for a determinate p-value
    #[arg(long, default_value_t = 20)]
    min_null_samples: usize,

    /// Standard errors below the apex that bound a peak interval
    #[arg(long, default_value_t = 1.96)]
    interval_z: f64,

    /// Random seed for permutation trials
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Minimum read mapping quality
    #[arg(long = "min-mapq", default_value_t = 20)]
    min_mapping_quality: u8,

    /// Minimum base quality
    #[arg(long = "min-baseq", default_value_t = 13)]
    min_base_quality: u8,

    /// Retries for failing external tools and pileup reads
    #[arg(long, default_value_t = 3)]
    max_retries: usize,

    /// Base retry delay in milliseconds, doubled on every attempt
    #[arg(long, default_value_t = 500)]
    retry_backoff_ms: u64,

    /// Number of worker threads
    #[arg(long, default_value_t = get_num_cpus())]
    threads: usize,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Overwrite existing results in the output directory
    #[arg(short, long)]
    force: bool,
}

impl Args {
    fn map_config(&self) -> MapConfig {
        MapConfig {
            wild_type: Pool::new("wild_type", self.wild_type.clone()),
            mutant: Pool::new("mutant", self.mutant.clone()),
            chromosomes: self.chromosomes.clone(),
            min_depth: self.min_depth,
            min_allele_freq: self.min_allele_freq,
            depth_pseudocount: self.depth_pseudocount,
            loess_span: self.loess_span,
            loess_degree: self.loess_degree,
            optimize_span: self.optimize_span,
            min_prominence: self.min_prominence,
            permutations: self.permutations,
            min_null_samples: self.min_null_samples,
            interval_z: self.interval_z,
            seed: self.seed,
            min_mapping_quality: self.min_mapping_quality,
            min_base_quality: self.min_base_quality,
            max_retries: self.max_retries,
            retry_backoff_ms: self.retry_backoff_ms,
        }
    }

    fn candidates_path(&self) -> PathBuf {
        let name = if self.gzip { "candidates.tsv.gz" } else { "candidates.tsv" };
        self.output_dir.join(name)
    }
}

/// Start from the latest checkpoint when resuming, otherwise from scratch
/// with any earlier run's checkpoints removed
fn initial_state(args: &Args, store: &CheckpointStore) -> anyhow::Result<PipelineState> {
    let config = args.map_config();
    if !args.resume {
        store.clear().context("failed to clear old checkpoints")?;
    } else {
        if let Some(state) = store.latest().context("failed to load checkpoint")? {
            if state.config != config {
                log::warn!("Command line parameters differ from the checkpoint; continuing with the checkpoint's");
            }
            return Ok(state);
        }
        log::warn!("No checkpoint found in {:?}, starting a new run", args.output_dir);
    }
    Ok(PipelineState::new(config))
}

fn variant_caller(args: &Args, config: &MapConfig) -> anyhow::Result<Box<dyn VariantCaller>> {
    if let Some(vcf) = &args.vcf {
        let caller = VcfFileCaller::from_path(vcf).with_context(|| format!("failed to read {:?}", vcf))?;
        return Ok(Box::new(caller));
    }
    let Some(reference) = &args.reference else {
        bail!("either --reference or --vcf is required");
    };
    check_program(&args.bcftools, "--version")?;
    Ok(Box::new(
        BcftoolsCaller::new(reference, config.min_mapping_quality, config.min_base_quality)
            .with_program(&args.bcftools),
    ))
}

fn variant_annotator(args: &Args) -> anyhow::Result<Box<dyn VariantAnnotator>> {
    match &args.snpeff_genome {
        Some(genome) => {
            check_program(&args.snpeff, "-version")?;
            Ok(Box::new(SnpEffAnnotator::new(genome).with_program(&args.snpeff)))
        }
        None => {
            log::warn!("No --snpeff-genome given; candidates will not be annotated");
            Ok(Box::new(NoopAnnotator))
        }
    }
}

fn run() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_level = if args.debug {
        "debug"
    } else if args.verbose {
        "info"
    } else {
        "warn"
    };

    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_timestamp_secs()
        .init();

    log::info!("Starting mutmap");
    log::info!("Wild-type pool: {:?}", args.wild_type);
    log::info!("Mutant pool: {:?}", args.mutant);
    log::info!("Output directory: {:?}", args.output_dir);
    log::info!("Threads: {}", args.threads);

    let candidates_path = args.candidates_path();
    if candidates_path.exists() && !args.force && !args.resume {
        bail!(
            "Output file {:?} already exists. Use --force to overwrite or --resume to continue.",
            candidates_path
        );
    }

    let store = CheckpointStore::new(args.output_dir.join("checkpoints"))
        .with_context(|| format!("cannot create output directory {:?}", args.output_dir))?;
    let state = initial_state(&args, &store)?;

    validate_config(&state.config)?;
    validate_pool_files(&state.config)?;
    for file in state.config.wild_type.files.iter().chain(&state.config.mutant.files) {
        find_index(file)?;
    }
    log::info!(
        "Configuration: min_depth={}, min_allele_freq={}, loess_span={}{}, permutations={}, seed={}",
        state.config.min_depth,
        state.config.min_allele_freq,
        state.config.loess_span,
        if state.config.optimize_span { " (optimized)" } else { "" },
        state.config.permutations,
        state.config.seed
    );

    rayon::ThreadPoolBuilder::new()
        .num_threads(args.threads.max(1))
        .build_global()
        .context("failed to start the worker pool")?;

    let pileup = BamPileupSource::new(state.config.min_mapping_quality, state.config.min_base_quality);
    let caller = variant_caller(&args, &state.config)?;
    let annotator = variant_annotator(&args)?;
    let ctx = Collaborators {
        pileup: &pileup,
        caller: caller.as_ref(),
        annotator: annotator.as_ref(),
    };

    let state = {
        let _timer = Timer::new("Mapping pipeline");
        run_pipeline(state, &ctx, Some(&store))?
    };

    write_candidates(&state, &candidates_path)?;
    write_summary(&state, &args.output_dir.join("summary.tsv"))?;

    log::info!("Analysis completed successfully");
    log::info!("Candidates written to: {:?}", candidates_path);
    Ok(())
}

/// Handle application errors and provide user-friendly messages
fn handle_error(error: anyhow::Error) -> ! {
    eprintln!("Error: {:#}", error);
    match error.downcast_ref::<MutmapError>() {
        Some(MutmapError::FileNotFound(_)) => {
            eprintln!("Please check that every alignment file exists and is readable.");
            eprintln!("Alignment files need an index (.bai, .csi or .crai) next to them.");
        }
        Some(MutmapError::InvalidConfig(_)) => {
            eprintln!("Please check the pool definitions and tuning parameters.");
        }
        Some(MutmapError::NoData(_)) => {
            eprintln!("No chromosome had positions passing the depth and allele frequency filters.");
            eprintln!("Consider lowering --min-depth or --min-allele-freq.");
        }
        Some(MutmapError::Htslib(_)) => {
            eprintln!("Please check that the alignment files are valid, sorted and indexed.");
        }
        Some(MutmapError::Json(_)) => {
            eprintln!("A checkpoint could not be read. Remove the checkpoints directory or rerun without --resume.");
        }
        Some(MutmapError::ExternalTool { tool, .. }) => {
            eprintln!("Please check that {} is installed and on PATH.", tool);
        }
        Some(MutmapError::Io(_)) => {
            eprintln!("Please check file permissions and disk space.");
        }
        _ => {}
    }
    std::process::exit(1);
}

fn main() {
    if let Err(e) = run() {
        handle_error(e);
    }
}
