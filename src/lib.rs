//! # mutmap - Mutation mapping from pooled sequencing
//!
//! Maps causative mutations from forward genetic screens by comparing a
//! wild-type read pool against a mutant read pool. The pipeline runs five
//! checkpointed stages per chromosome: allele-frequency distance, loess
//! smoothing, peak finding, permutation-based peak refinement and candidate
//! variant generation.

pub mod candidates;
pub mod distance;
pub mod external;
pub mod loess;
pub mod output;
pub mod peaks;
pub mod pileup;
pub mod pipeline;
pub mod refine;
pub mod state;
pub mod utils;
pub mod vcf;

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;

/// Represents a genomic variant with its position and alleles
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Variant {
    pub chrom: String,
    pub pos: u32,
    pub ref_allele: String,
    pub alt_allele: String,
}

impl Variant {
    pub fn new(chrom: String, pos: u32, ref_allele: String, alt_allele: String) -> Self {
        Self {
            chrom,
            pos,
            ref_allele,
            alt_allele,
        }
    }
}

/// A group of alignment files sharing one phenotype
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pool {
    pub name: String,
    pub files: Vec<PathBuf>,
}

impl Pool {
    pub fn new(name: &str, files: Vec<PathBuf>) -> Self {
        Self {
            name: name.to_string(),
            files,
        }
    }
}

/// A closed, 1-based genomic interval
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub chrom: String,
    pub start: u32,
    pub end: u32,
}

impl Region {
    pub fn new(chrom: &str, start: u32, end: u32) -> Self {
        Self {
            chrom: chrom.to_string(),
            start,
            end,
        }
    }

    pub fn contains(&self, chrom: &str, pos: u32) -> bool {
        self.chrom == chrom && self.start <= pos && pos <= self.end
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}-{}", self.chrom, self.start, self.end)
    }
}

/// Run configuration. Stored inside every checkpoint so a resumed run
/// continues with exactly the parameters it started with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapConfig {
    pub wild_type: Pool,
    pub mutant: Pool,
    /// Chromosomes to analyze; empty means every chromosome in the alignment headers
    pub chromosomes: Vec<String>,
    /// Minimum read depth required in each pool
    pub min_depth: u32,
    /// Minimum combined minor-allele frequency for a position to be informative
    pub min_allele_freq: f64,
    /// Depth at which the confidence factor reaches one half
    pub depth_pseudocount: f64,
    /// Loess window as a fraction of the chromosome's position range
    pub loess_span: f64,
    pub loess_degree: usize,
    /// Choose the span per chromosome by AICc instead of using `loess_span`
    pub optimize_span: bool,
    pub min_prominence: f64,
    pub permutations: usize,
    pub min_null_samples: usize,
    /// Multiplier on the apex standard error that sets the interval threshold
    pub interval_z: f64,
    pub seed: u64,
    pub min_mapping_quality: u8,
    pub min_base_quality: u8,
    pub max_retries: usize,
    pub retry_backoff_ms: u64,
}

impl MapConfig {
    pub fn new(wild_type: Pool, mutant: Pool) -> Self {
        Self {
            wild_type,
            mutant,
            ..Default::default()
        }
    }
}

impl Default for MapConfig {
    fn default() -> Self {
        Self {
            wild_type: Pool::new("wild_type", Vec::new()),
            mutant: Pool::new("mutant", Vec::new()),
            chromosomes: Vec::new(),
            min_depth: 10,
            min_allele_freq: 0.05,
            depth_pseudocount: 10.0,
            loess_span: 0.3,
            loess_degree: 1,
            optimize_span: false,
            min_prominence: 0.05,
            permutations: 200,
            min_null_samples: 20,
            interval_z: 1.96,
            seed: 42,
            min_mapping_quality: 20,
            min_base_quality: 13,
            max_retries: 3,
            retry_backoff_ms: 500,
        }
    }
}

/// Validate parameter ranges and pool definitions.
///
/// Pool files are not checked here; see [`validate_pool_files`].
pub fn validate_config(config: &MapConfig) -> MutmapResult<()> {
    if config.min_depth == 0 {
        return Err(MutmapError::InvalidConfig(
            "min_depth must be at least 1".to_string(),
        ));
    }

    if !(0.0..=0.5).contains(&config.min_allele_freq) {
        return Err(MutmapError::InvalidConfig(
            "min_allele_freq must be between 0 and 0.5".to_string(),
        ));
    }

    if !(config.depth_pseudocount >= 0.0 && config.depth_pseudocount.is_finite()) {
        return Err(MutmapError::InvalidConfig(
            "depth_pseudocount must be a non-negative number".to_string(),
        ));
    }

    if !(config.loess_span > 0.0 && config.loess_span <= 1.0) {
        return Err(MutmapError::InvalidConfig(
            "loess_span must be in (0, 1]".to_string(),
        ));
    }

    if config.loess_degree > 2 {
        return Err(MutmapError::InvalidConfig(
            "loess_degree must be 0, 1 or 2".to_string(),
        ));
    }

    if !(config.min_prominence > 0.0) {
        return Err(MutmapError::InvalidConfig(
            "min_prominence must be greater than 0".to_string(),
        ));
    }

    if config.min_null_samples == 0 {
        return Err(MutmapError::InvalidConfig(
            "min_null_samples must be at least 1".to_string(),
        ));
    }

    if !(config.interval_z >= 0.0 && config.interval_z.is_finite()) {
        return Err(MutmapError::InvalidConfig(
            "interval_z must be a non-negative number".to_string(),
        ));
    }

    if config.wild_type.files.is_empty() || config.mutant.files.is_empty() {
        return Err(MutmapError::InvalidConfig(
            "both pools need at least one alignment file".to_string(),
        ));
    }

    if config.wild_type.name == config.mutant.name {
        return Err(MutmapError::InvalidConfig(format!(
            "pool names must differ (both are '{}')",
            config.wild_type.name
        )));
    }

    let mut seen = HashSet::new();
    for file in config.wild_type.files.iter().chain(&config.mutant.files) {
        if !seen.insert(file) {
            return Err(MutmapError::InvalidConfig(format!(
                "alignment file {} is listed more than once",
                file.display()
            )));
        }
    }

    Ok(())
}

/// Check that every alignment file of both pools exists and is readable
pub fn validate_pool_files(config: &MapConfig) -> MutmapResult<()> {
    for file in config.wild_type.files.iter().chain(&config.mutant.files) {
        utils::validate_file_readable(file)?;
    }
    Ok(())
}

/// Error types for the mutmap library
#[derive(Debug, thiserror::Error)]
pub enum MutmapError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTSlib error: {0}")]
    Htslib(#[from] rust_htslib::errors::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Checkpoint serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid variant format: {0}")]
    InvalidVariant(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("{tool} failed: {message}")]
    ExternalTool { tool: String, message: String },

    #[error("No data: {0}")]
    NoData(String),

    #[error("Stage order violation: {0}")]
    StageOrder(String),
}

impl MutmapError {
    pub fn external(tool: &str, message: impl Into<String>) -> Self {
        MutmapError::ExternalTool {
            tool: tool.to_string(),
            message: message.into(),
        }
    }

    /// Whether retrying the failed operation could succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MutmapError::Io(_) | MutmapError::Htslib(_) | MutmapError::ExternalTool { .. }
        )
    }
}

pub type MutmapResult<T> = Result<T, MutmapError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> MapConfig {
        MapConfig::new(
            Pool::new("wild_type", vec![PathBuf::from("wt.bam")]),
            Pool::new("mutant", vec![PathBuf::from("mut.bam")]),
        )
    }

    #[test]
    fn test_validate_config() {
        assert!(validate_config(&test_config()).is_ok());

        let mut config = test_config();
        config.min_depth = 0;
        assert!(validate_config(&config).is_err());

        let mut config = test_config();
        config.loess_span = 0.0;
        assert!(validate_config(&config).is_err());

        let mut config = test_config();
        config.min_prominence = 0.0;
        assert!(validate_config(&config).is_err());

        let mut config = test_config();
        config.loess_degree = 3;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_config_pools() {
        let mut config = test_config();
        config.mutant.files.clear();
        assert!(validate_config(&config).is_err());

        let mut config = test_config();
        config.mutant.name = "wild_type".to_string();
        assert!(validate_config(&config).is_err());

        let mut config = test_config();
        config.mutant.files = vec![PathBuf::from("wt.bam")];
        assert!(matches!(
            validate_config(&config),
            Err(MutmapError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_validate_pool_files_missing() {
        let result = validate_pool_files(&test_config());
        assert!(matches!(result, Err(MutmapError::FileNotFound(_))));
    }

    #[test]
    fn test_region() {
        let region = Region::new("chr2", 100, 200);
        assert!(region.contains("chr2", 100));
        assert!(region.contains("chr2", 200));
        assert!(!region.contains("chr2", 201));
        assert!(!region.contains("chr1", 150));
        assert_eq!(region.to_string(), "chr2:100-200");
    }

    #[test]
    fn test_error_retryable() {
        assert!(MutmapError::external("bcftools", "exit 1").is_retryable());
        assert!(!MutmapError::InvalidConfig("x".to_string()).is_retryable());
        assert!(!MutmapError::NoData("x".to_string()).is_retryable());
    }
}
