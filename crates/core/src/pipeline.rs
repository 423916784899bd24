//! Batch pipeline: discover edit samples, pack them in parallel, write
//! JSONL training/validation splits.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::Serialize;
use walkdir::WalkDir;

use crate::diff_chunks::{plan_from_sources, DiffChunkBuilder, EditSample};
use crate::format::Format;
use crate::packer::{PackParams, Packer};
use crate::{Encoding, Token};

/// Configuration for the pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub limit_ctx_n: usize,
    pub limit_aux_n: usize,
    pub for_training: bool,
    pub join_threshold: usize,
    pub padding: usize,
    pub val_ratio: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            limit_ctx_n: crate::DEFAULT_LIMIT_CTX_N,
            limit_aux_n: crate::DEFAULT_LIMIT_AUX_N,
            for_training: false,
            join_threshold: crate::diff_chunks::DEFAULT_JOIN_THRESHOLD,
            padding: crate::diff_chunks::DEFAULT_PADDING,
            val_ratio: 0.1,
        }
    }
}

/// One packed sample, ready to be written as a JSONL line.
#[derive(Debug, Serialize)]
pub struct PackedRecord {
    pub source: String,
    pub tokens: Vec<Token>,
    pub mask: Vec<u8>,
    pub filled_ctx_n: usize,
    pub filled_aux_n: usize,
    pub minimal_context_too_big: bool,
}

/// Result of processing all samples.
#[derive(Debug, Serialize)]
pub struct PipelineResult {
    pub total_samples: usize,
    pub train_records: usize,
    pub val_records: usize,
    pub total_tokens: usize,
}

/// Discover all `.json` edit samples under a directory.
pub fn discover_sample_files(root: &Path) -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().map_or(false, |ext| ext == "json"))
        .map(|e| e.path().to_path_buf())
        .collect();
    paths.sort();
    paths
}

/// Pack a single edit sample file.
pub fn process_sample<E: Encoding>(
    path: &Path,
    fmt: &Format<E>,
    config: &PipelineConfig,
) -> Result<PackedRecord, Box<dyn std::error::Error>> {
    let raw = std::fs::read_to_string(path)?;
    let sample: EditSample = serde_json::from_str(&raw)?;
    let builder = DiffChunkBuilder::new(config.join_threshold, config.padding);
    let (plan, msg_plan_n) = plan_from_sources(&sample, &builder);
    let mut packer = Packer::with_plan(fmt, plan);
    let params = PackParams {
        start_from_plan_n: 0,
        mask_from_plan_n: msg_plan_n,
        limit_ctx_n: config.limit_ctx_n,
        limit_aux_n: config.limit_aux_n,
        add_eot: true,
        for_training: config.for_training,
    };
    // seeded per path so training-time context shuffling is reproducible
    let mut rng = StdRng::seed_from_u64(path_seed(path));
    packer.pack_context(&params, &mut rng)?;
    Ok(PackedRecord {
        source: path.to_string_lossy().to_string(),
        tokens: packer.tokens,
        mask: packer.mask,
        filled_ctx_n: packer.cx.filled_ctx_n,
        filled_aux_n: packer.cx.filled_aux_n,
        minimal_context_too_big: packer.cx.minimal_context_too_big_warning,
    })
}

fn path_seed(path: &Path) -> u64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut h = DefaultHasher::new();
    path.hash(&mut h);
    h.finish()
}

/// Pack all samples under a directory in parallel.
///
/// Uses rayon; the encoding must be `Sync` to be shared across threads.
pub fn process_all_samples<E: Encoding + Sync>(
    root: &Path,
    fmt: &Format<E>,
    config: &PipelineConfig,
) -> Result<Vec<PackedRecord>, Box<dyn std::error::Error>> {
    let files = discover_sample_files(root);
    if files.is_empty() {
        return Err(format!("no .json edit samples found under {:?}", root).into());
    }
    let total = files.len();
    let processed = AtomicUsize::new(0);
    let errors = AtomicUsize::new(0);
    let records: Vec<PackedRecord> = files
        .into_par_iter()
        .filter_map(|path| {
            let result = process_sample(&path, fmt, config);
            let count = processed.fetch_add(1, Ordering::Relaxed) + 1;
            match result {
                Ok(record) => {
                    if count % 100 == 0 || count == total {
                        log::info!("packed {}/{} samples", count, total);
                    }
                    Some(record)
                }
                Err(e) => {
                    errors.fetch_add(1, Ordering::Relaxed);
                    log::warn!("failed to pack {:?}: {}", path, e);
                    None
                }
            }
        })
        .collect();
    let failed = errors.load(Ordering::Relaxed);
    if failed > 0 {
        log::warn!("{} samples failed to pack", failed);
    }
    Ok(records)
}

/// Write records to `training.jsonl` and `validation.jsonl` under
/// `output_dir`, splitting off `val_ratio` of them after a deterministic
/// shuffle.
pub fn write_jsonl_output(
    records: Vec<PackedRecord>,
    output_dir: &Path,
    val_ratio: f64,
) -> Result<PipelineResult, Box<dyn std::error::Error>> {
    use std::fs::File;
    use std::io::{BufWriter, Write};

    std::fs::create_dir_all(output_dir)?;

    // deterministic index-hash shuffle for the train/val split
    let mut indexed: Vec<(usize, PackedRecord)> = records.into_iter().enumerate().collect();
    indexed.sort_by(|(i, a), (j, b)| {
        let ha = i.wrapping_mul(2654435761) % 1000;
        let hb = j.wrapping_mul(2654435761) % 1000;
        ha.cmp(&hb).then_with(|| a.source.cmp(&b.source))
    });

    let total_samples = indexed.len();
    let val_count = (total_samples as f64 * val_ratio).round() as usize;
    let train_count = total_samples - val_count;

    let train_path = output_dir.join("training.jsonl");
    let val_path = output_dir.join("validation.jsonl");
    let mut train_file = BufWriter::new(File::create(&train_path)?);
    let mut val_file = BufWriter::new(File::create(&val_path)?);

    let mut train_records = 0;
    let mut val_records = 0;
    let mut total_tokens = 0;
    for (idx, (_, record)) in indexed.into_iter().enumerate() {
        let line = serde_json::to_string(&record)?;
        if idx >= train_count {
            writeln!(val_file, "{}", line)?;
            val_records += 1;
        } else {
            writeln!(train_file, "{}", line)?;
            train_records += 1;
        }
        total_tokens += record.tokens.len();
    }
    train_file.flush()?;
    val_file.flush()?;

    Ok(PipelineResult {
        total_samples,
        train_records,
        val_records,
        total_tokens,
    })
}
