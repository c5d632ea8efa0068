//! Pipeline state, stage ordering and checkpoint persistence

use crate::candidates::Candidate;
use crate::distance::DistancePoint;
use crate::loess::SmoothedTrack;
use crate::peaks::Peak;
use crate::refine::RefinedPeak;
use crate::utils::ensure_parent_dirs;
use crate::{MapConfig, MutmapError, MutmapResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Pipeline stages in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Distance,
    Smoothing,
    PeakFinding,
    Refinement,
    Candidates,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Distance,
        Stage::Smoothing,
        Stage::PeakFinding,
        Stage::Refinement,
        Stage::Candidates,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Stage::Distance => "distance",
            Stage::Smoothing => "smoothing",
            Stage::PeakFinding => "peak_finding",
            Stage::Refinement => "refinement",
            Stage::Candidates => "candidates",
        }
    }

    fn index(&self) -> usize {
        Stage::ALL
            .iter()
            .position(|s| s == self)
            .unwrap_or_default()
    }

    pub fn next(&self) -> Option<Stage> {
        Stage::ALL.get(self.index() + 1).copied()
    }

    pub fn previous(&self) -> Option<Stage> {
        self.index().checked_sub(1).map(|i| Stage::ALL[i])
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Stage {
    type Err = MutmapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::ALL
            .iter()
            .find(|stage| stage.name() == s)
            .copied()
            .ok_or_else(|| MutmapError::InvalidConfig(format!("unknown stage '{}'", s)))
    }
}

/// Why a chromosome produced no result for a stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    DataAbsence,
    InsufficientSample,
    ExternalToolFailure,
}

impl fmt::Display for IssueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IssueKind::DataAbsence => "data_absence",
            IssueKind::InsufficientSample => "insufficient_sample",
            IssueKind::ExternalToolFailure => "external_tool_failure",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChromIssue {
    pub stage: Stage,
    pub chrom: String,
    pub kind: IssueKind,
    pub message: String,
}

/// Everything a run has produced so far. Each stage owns one result map;
/// maps are keyed by chromosome and ordered so snapshots serialize
/// deterministically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineState {
    pub config: MapConfig,
    /// Chromosomes the run covers, fixed by the distance stage
    pub chromosomes: Vec<String>,
    pub completed: Vec<Stage>,
    pub distances: BTreeMap<String, Vec<DistancePoint>>,
    pub smoothed: BTreeMap<String, SmoothedTrack>,
    pub peaks: BTreeMap<String, Vec<Peak>>,
    pub refined: BTreeMap<String, Vec<RefinedPeak>>,
    pub candidates: BTreeMap<String, Vec<Candidate>>,
    pub issues: Vec<ChromIssue>,
}

impl PipelineState {
    pub fn new(config: MapConfig) -> Self {
        Self {
            config,
            chromosomes: Vec::new(),
            completed: Vec::new(),
            distances: BTreeMap::new(),
            smoothed: BTreeMap::new(),
            peaks: BTreeMap::new(),
            refined: BTreeMap::new(),
            candidates: BTreeMap::new(),
            issues: Vec::new(),
        }
    }

    pub fn is_completed(&self, stage: Stage) -> bool {
        self.completed.contains(&stage)
    }

    /// First stage in execution order that has not completed
    pub fn next_stage(&self) -> Option<Stage> {
        Stage::ALL.into_iter().find(|s| !self.is_completed(*s))
    }

    pub fn last_completed(&self) -> Option<Stage> {
        self.completed.iter().max().copied()
    }

    /// Drop the results of `stage` and every later stage
    pub(crate) fn reset_from(&mut self, stage: Stage) {
        for s in Stage::ALL.into_iter().filter(|s| *s >= stage) {
            match s {
                Stage::Distance => {
                    self.chromosomes.clear();
                    self.distances.clear();
                }
                Stage::Smoothing => self.smoothed.clear(),
                Stage::PeakFinding => self.peaks.clear(),
                Stage::Refinement => self.refined.clear(),
                Stage::Candidates => self.candidates.clear(),
            }
        }
        self.completed.retain(|s| *s < stage);
        self.issues.retain(|i| i.stage < stage);
    }

    pub(crate) fn mark_completed(&mut self, stage: Stage) {
        if !self.is_completed(stage) {
            self.completed.push(stage);
            self.completed.sort();
        }
        self.issues.sort();
    }

    pub fn record_issue(&mut self, stage: Stage, chrom: &str, kind: IssueKind, message: impl Into<String>) {
        self.issues.push(ChromIssue {
            stage,
            chrom: chrom.to_string(),
            kind,
            message: message.into(),
        });
    }

    pub fn issues_for<'a>(&'a self, chrom: &'a str) -> impl Iterator<Item = &'a ChromIssue> + 'a {
        self.issues.iter().filter(move |i| i.chrom == chrom)
    }

    /// Chromosomes with at least one retained distance point
    pub fn chromosomes_with_data(&self) -> BTreeSet<&str> {
        self.distances
            .iter()
            .filter(|(_, points)| !points.is_empty())
            .map(|(chrom, _)| chrom.as_str())
            .collect()
    }

    pub fn to_json(&self) -> MutmapResult<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn from_json(bytes: &[u8]) -> MutmapResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Write `bytes` to `path` through a sibling temp file and a rename, so
/// readers see either the old file or the complete new one
pub fn write_atomic(path: &Path, bytes: &[u8]) -> MutmapResult<()> {
    ensure_parent_dirs(path)?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&tmp, path).inspect_err(|_| {
        let _ = fs::remove_file(&tmp);
    })?;
    Ok(())
}

/// One snapshot file per stage inside a directory
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new<P: AsRef<Path>>(dir: P) -> MutmapResult<Self> {
        fs::create_dir_all(dir.as_ref())?;
        Ok(Self {
            dir: dir.as_ref().to_path_buf(),
        })
    }

    pub fn path_for(&self, stage: Stage) -> PathBuf {
        self.dir.join(format!("{}.checkpoint.json", stage.name()))
    }

    pub fn save(&self, stage: Stage, state: &PipelineState) -> MutmapResult<PathBuf> {
        let path = self.path_for(stage);
        write_atomic(&path, &state.to_json()?)?;
        log::info!("Checkpoint for stage '{}' written to {}", stage, path.display());
        Ok(path)
    }

    pub fn load(&self, stage: Stage) -> MutmapResult<Option<PipelineState>> {
        let path = self.path_for(stage);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path)?;
        Ok(Some(PipelineState::from_json(&bytes)?))
    }

    /// Remove every stage snapshot, left-over temp files included
    pub fn clear(&self) -> MutmapResult<()> {
        for stage in Stage::ALL {
            let path = self.path_for(stage);
            let mut tmp = path.as_os_str().to_owned();
            tmp.push(".tmp");
            for file in [path, PathBuf::from(tmp)] {
                if file.exists() {
                    fs::remove_file(&file)?;
                }
            }
        }
        log::debug!("Cleared checkpoints in {}", self.dir.display());
        Ok(())
    }

    /// Snapshot of the furthest completed stage, if any. Snapshots whose
    /// configuration differs from the earliest one belong to another run
    /// and are skipped.
    pub fn latest(&self) -> MutmapResult<Option<PipelineState>> {
        let mut snapshots = Vec::new();
        for stage in Stage::ALL {
            if let Some(state) = self.load(stage)? {
                snapshots.push((stage, state));
            }
        }
        let Some(reference) = snapshots.first().map(|(_, s)| s.config.clone()) else {
            return Ok(None);
        };

        while let Some((stage, state)) = snapshots.pop() {
            if state.config != reference {
                log::warn!(
                    "Ignoring checkpoint {} from a run with a different configuration",
                    self.path_for(stage).display()
                );
            } else if state.is_completed(stage) {
                return Ok(Some(state));
            } else {
                log::warn!(
                    "Ignoring checkpoint {} without a completed '{}' stage",
                    self.path_for(stage).display(),
                    stage
                );
            }
        }
        Ok(None)
    }
}
