//! Per-position allele count pileups for each pool

use crate::{MutmapError, MutmapResult, Pool};
use rust_htslib::bam::{self, IndexedReader, Read};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};

/// Symbols counted at each position; `*` is a deletion
pub const ALPHABET: [u8; 5] = [b'A', b'C', b'G', b'T', b'*'];

const DEFAULT_BLOCK_SIZE: u32 = 1_000_000;
const MAX_PILEUP_DEPTH: u32 = 1_000_000;

/// Represents allele counts at a specific position
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlleleCounts {
    pub counts: [u32; ALPHABET.len()],
}

impl AlleleCounts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_counts(counts: [u32; ALPHABET.len()]) -> Self {
        Self { counts }
    }

    /// Index of a base in [`ALPHABET`], case-insensitive
    pub fn symbol_index(base: u8) -> Option<usize> {
        let base = base.to_ascii_uppercase();
        ALPHABET.iter().position(|&b| b == base)
    }

    /// Count one base; ambiguous bases are ignored and reported as `false`
    pub fn add(&mut self, base: u8) -> bool {
        match Self::symbol_index(base) {
            Some(i) => {
                self.counts[i] += 1;
                true
            }
            None => false,
        }
    }

    pub fn add_deletion(&mut self) {
        self.counts[ALPHABET.len() - 1] += 1;
    }

    pub fn get(&self, base: u8) -> u32 {
        Self::symbol_index(base)
            .map(|i| self.counts[i])
            .unwrap_or(0)
    }

    pub fn depth(&self) -> u32 {
        self.counts.iter().sum()
    }

    pub fn frequencies(&self) -> [f64; ALPHABET.len()] {
        let depth = self.depth();
        let mut freqs = [0.0; ALPHABET.len()];
        if depth == 0 {
            return freqs;
        }
        for (f, &c) in freqs.iter_mut().zip(self.counts.iter()) {
            *f = c as f64 / depth as f64;
        }
        freqs
    }

    pub fn merge(&mut self, other: &AlleleCounts) {
        for (a, b) in self.counts.iter_mut().zip(other.counts.iter()) {
            *a += b;
        }
    }
}

/// One pool's counts at one genomic position
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionRecord {
    pub chrom: String,
    /// 1-based coordinate
    pub pos: u32,
    pub counts: AlleleCounts,
}

impl PositionRecord {
    pub fn new(chrom: &str, pos: u32, counts: AlleleCounts) -> Self {
        Self {
            chrom: chrom.to_string(),
            pos,
            counts,
        }
    }
}

/// Lazy, coordinate-ordered, single-pass stream of one pool's records
pub type PositionStream<'a> = Box<dyn Iterator<Item = MutmapResult<PositionRecord>> + 'a>;

/// Source of per-pool pileups. A stream cannot be restarted; ask for a new one.
pub trait PileupSource: Send + Sync {
    /// Chromosomes present in the pool's alignment data, in header order
    fn chromosomes(&self, pool: &Pool) -> MutmapResult<Vec<String>>;

    /// Stream a chromosome. A chromosome absent from the pool yields an empty stream.
    fn positions<'a>(&'a self, pool: &Pool, chrom: &str) -> MutmapResult<PositionStream<'a>>;
}

/// Locate the index next to an alignment file
pub fn find_index(path: &Path) -> MutmapResult<PathBuf> {
    let file_name = path.to_string_lossy();
    let candidates = [
        PathBuf::from(format!("{}.bai", file_name)),
        PathBuf::from(format!("{}.csi", file_name)),
        PathBuf::from(format!("{}.crai", file_name)),
        path.with_extension("bai"),
    ];

    candidates
        .iter()
        .find(|p| p.exists())
        .cloned()
        .ok_or_else(|| {
            MutmapError::FileNotFound(format!(
                "Alignment index not found for {}. Expected {} or {}",
                path.display(),
                candidates[0].display(),
                candidates[3].display()
            ))
        })
}

/// Pileups from indexed BAM/CRAM files via htslib
#[derive(Debug, Clone)]
pub struct BamPileupSource {
    min_mapping_quality: u8,
    min_base_quality: u8,
    block_size: u32,
}

impl BamPileupSource {
    pub fn new(min_mapping_quality: u8, min_base_quality: u8) -> Self {
        Self {
            min_mapping_quality,
            min_base_quality,
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }

    pub fn with_block_size(mut self, block_size: u32) -> Self {
        self.block_size = block_size.max(1);
        self
    }

    fn open(path: &Path) -> MutmapResult<IndexedReader> {
        let index = find_index(path)?;
        Ok(IndexedReader::from_path_and_index(path, &index)?)
    }
}

impl PileupSource for BamPileupSource {
    fn chromosomes(&self, pool: &Pool) -> MutmapResult<Vec<String>> {
        let mut names: Vec<String> = Vec::new();
        for file in &pool.files {
            let reader = bam::Reader::from_path(file)?;
            for name in reader.header().target_names() {
                let name = String::from_utf8_lossy(name).to_string();
                if !names.contains(&name) {
                    names.push(name);
                }
            }
        }
        Ok(names)
    }

    fn positions<'a>(&'a self, pool: &Pool, chrom: &str) -> MutmapResult<PositionStream<'a>> {
        let mut readers = Vec::new();
        let mut chrom_len = 0u64;

        for file in &pool.files {
            let reader = Self::open(file)?;
            let tid = match reader.header().tid(chrom.as_bytes()) {
                Some(tid) => tid,
                None => {
                    log::debug!("{} has no sequence named {}", file.display(), chrom);
                    continue;
                }
            };
            chrom_len = chrom_len.max(reader.header().target_len(tid).unwrap_or(0));
            readers.push((reader, tid));
        }

        Ok(Box::new(BamPositionStream {
            chrom: chrom.to_string(),
            readers,
            chrom_len,
            next_start: 0,
            block_size: self.block_size as u64,
            min_mapping_quality: self.min_mapping_quality,
            min_base_quality: self.min_base_quality,
            buffer: VecDeque::new(),
        }))
    }
}

/// Reads the chromosome one block at a time, merging all files of the pool
struct BamPositionStream {
    chrom: String,
    readers: Vec<(IndexedReader, u32)>,
    chrom_len: u64,
    next_start: u64,
    block_size: u64,
    min_mapping_quality: u8,
    min_base_quality: u8,
    buffer: VecDeque<PositionRecord>,
}

impl BamPositionStream {
    fn load_block(&mut self) -> MutmapResult<()> {
        let start = self.next_start;
        let end = (start + self.block_size).min(self.chrom_len);
        let mut block: BTreeMap<u32, AlleleCounts> = BTreeMap::new();

        for (reader, tid) in self.readers.iter_mut() {
            reader.fetch((*tid, start as u32, end as u32))?;

            let mut pileups = reader.pileup();
            pileups.set_max_depth(MAX_PILEUP_DEPTH);

            for p in pileups {
                let p = p?;
                let pos = p.pos() as u64;
                // Reads overlapping the block edges report positions outside it
                if pos < start || pos >= end {
                    continue;
                }

                let counts = block.entry(p.pos() + 1).or_default();
                for alignment in p.alignments() {
                    let record = alignment.record();
                    if record.is_unmapped()
                        || record.is_secondary()
                        || record.is_duplicate()
                        || record.is_quality_check_failed()
                        || record.mapq() < self.min_mapping_quality
                    {
                        continue;
                    }

                    if alignment.is_refskip() {
                        continue;
                    }

                    if alignment.is_del() {
                        counts.add_deletion();
                        continue;
                    }

                    if let Some(qpos) = alignment.qpos() {
                        if record.qual()[qpos] < self.min_base_quality {
                            continue;
                        }
                        counts.add(record.seq()[qpos]);
                    }
                }
            }
        }

        for (pos, counts) in block {
            if counts.depth() > 0 {
                self.buffer
                    .push_back(PositionRecord::new(&self.chrom, pos, counts));
            }
        }

        self.next_start = end;
        Ok(())
    }
}

impl Iterator for BamPositionStream {
    type Item = MutmapResult<PositionRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(record) = self.buffer.pop_front() {
                return Some(Ok(record));
            }
            if self.readers.is_empty() || self.next_start >= self.chrom_len {
                return None;
            }
            if let Err(e) = self.load_block() {
                self.next_start = self.chrom_len;
                return Some(Err(e));
            }
        }
    }
}

/// Pileups held in memory, keyed by pool name then chromosome
#[derive(Debug, Clone, Default)]
pub struct MemoryPileupSource {
    pools: HashMap<String, BTreeMap<String, BTreeMap<u32, AlleleCounts>>>,
}

impl MemoryPileupSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a record; counts at an existing position are summed
    pub fn insert(&mut self, pool: &str, record: PositionRecord) {
        self.pools
            .entry(pool.to_string())
            .or_default()
            .entry(record.chrom)
            .or_default()
            .entry(record.pos)
            .or_default()
            .merge(&record.counts);
    }

    pub fn extend<I: IntoIterator<Item = PositionRecord>>(&mut self, pool: &str, records: I) {
        for record in records {
            self.insert(pool, record);
        }
    }
}

impl PileupSource for MemoryPileupSource {
    fn chromosomes(&self, pool: &Pool) -> MutmapResult<Vec<String>> {
        Ok(self
            .pools
            .get(&pool.name)
            .map(|chroms| chroms.keys().cloned().collect())
            .unwrap_or_default())
    }

    fn positions<'a>(&'a self, pool: &Pool, chrom: &str) -> MutmapResult<PositionStream<'a>> {
        let positions = self.pools.get(&pool.name).and_then(|c| c.get(chrom));
        let chrom = chrom.to_string();
        Ok(Box::new(positions.into_iter().flat_map(move |map| {
            let chrom = chrom.clone();
            map.iter()
                .map(move |(&pos, counts)| {
                    Ok::<_, MutmapError>(PositionRecord::new(&chrom, pos, *counts))
                })
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_allele_counts() {
        let mut counts = AlleleCounts::new();
        counts.add(b'A');
        counts.add(b'a');
        counts.add(b'T');
        counts.add_deletion();
        assert!(!counts.add(b'N'));

        assert_eq!(counts.get(b'A'), 2);
        assert_eq!(counts.get(b'T'), 1);
        assert_eq!(counts.get(b'*'), 1);
        assert_eq!(counts.get(b'N'), 0);
        assert_eq!(counts.depth(), 4);
    }

    #[test]
    fn test_frequencies() {
        let counts = AlleleCounts::from_counts([3, 0, 1, 0, 0]);
        let freqs = counts.frequencies();
        assert_eq!(freqs[0], 0.75);
        assert_eq!(freqs[2], 0.25);
        assert_eq!(freqs.iter().sum::<f64>(), 1.0);

        let empty = AlleleCounts::new();
        assert_eq!(empty.frequencies(), [0.0; 5]);
    }

    #[test]
    fn test_memory_source_merges_and_orders() {
        let pool = Pool::new("mutant", Vec::new());
        let mut source = MemoryPileupSource::new();
        source.insert("mutant", PositionRecord::new("chr1", 20, AlleleCounts::from_counts([1, 0, 0, 0, 0])));
        source.insert("mutant", PositionRecord::new("chr1", 10, AlleleCounts::from_counts([2, 0, 0, 0, 0])));
        source.insert("mutant", PositionRecord::new("chr1", 20, AlleleCounts::from_counts([0, 4, 0, 0, 0])));

        let records: Vec<_> = source
            .positions(&pool, "chr1")
            .unwrap()
            .collect::<MutmapResult<_>>()
            .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].pos, 10);
        assert_eq!(records[1].pos, 20);
        assert_eq!(records[1].counts.counts, [1, 4, 0, 0, 0]);

        assert_eq!(source.chromosomes(&pool).unwrap(), vec!["chr1".to_string()]);
    }

    #[test]
    fn test_memory_source_extend() {
        let pool = Pool::new("wild_type", Vec::new());
        let mut source = MemoryPileupSource::new();
        source.extend(
            "wild_type",
            [30, 10, 20, 10].map(|pos| PositionRecord::new("chr2", pos, AlleleCounts::from_counts([1, 0, 0, 0, 0]))),
        );

        let records: Vec<_> = source
            .positions(&pool, "chr2")
            .unwrap()
            .collect::<MutmapResult<_>>()
            .unwrap();
        let positions: Vec<u32> = records.iter().map(|r| r.pos).collect();
        assert_eq!(positions, vec![10, 20, 30]);
        assert_eq!(records[0].counts.counts, [2, 0, 0, 0, 0]);
    }

    #[test]
    fn test_memory_source_missing_chromosome_is_empty() {
        let pool = Pool::new("wild_type", Vec::new());
        let source = MemoryPileupSource::new();
        assert_eq!(source.positions(&pool, "chr9").unwrap().count(), 0);
        assert!(source.chromosomes(&pool).unwrap().is_empty());
    }

    #[test]
    fn test_find_index_missing() {
        let temp_bam = NamedTempFile::new().unwrap();
        let result = find_index(temp_bam.path());

        if let Err(MutmapError::FileNotFound(msg)) = result {
            assert!(msg.contains("Alignment index not found"));
            assert!(msg.contains(".bai"));
        } else {
            panic!("Expected FileNotFound error");
        }
    }

    #[test]
    fn test_find_index_with_bai_extension() {
        let temp_bam = NamedTempFile::new().unwrap();
        let bai_path = PathBuf::from(format!("{}.bai", temp_bam.path().display()));
        std::fs::File::create(&bai_path).unwrap();

        assert_eq!(find_index(temp_bam.path()).unwrap(), bai_path);

        std::fs::remove_file(bai_path).ok();
    }

    #[test]
    fn test_bam_source_rejects_invalid_file() {
        let temp_bam = NamedTempFile::new().unwrap();
        let bai_path = PathBuf::from(format!("{}.bai", temp_bam.path().display()));
        std::fs::File::create(&bai_path).unwrap();

        // Index found, but the file is not a real BAM
        let source = BamPileupSource::new(20, 13).with_block_size(0);
        assert_eq!(source.block_size, 1);
        let pool = Pool::new("mutant", vec![temp_bam.path().to_path_buf()]);
        assert!(source.positions(&pool, "chr1").is_err());

        std::fs::remove_file(bai_path).ok();
    }
}
