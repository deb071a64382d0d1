//! Parallel partition driver.
//!
//! The engine itself never threads; this driver gives each worker thread
//! one disjoint byte range of the source file, shared-nothing. Every
//! worker runs locator → compiler → a user-provided handler over its own
//! partition, so the union of work across workers covers exactly the
//! patients a single full-file scan would find.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};

use crate::compile::{CompiledTimeline, CompilerConfig, Finalized, TimelineCompiler};
use crate::error::Error;
use crate::meta::{MedicationTable, MetadataTable};
use crate::tdf::{ByteRange, PatientLocator, PatientReader};

/// Per-patient consumer (user-provided logic).
pub trait PatientHandler: Send {
    /// Process one finalized timeline.
    fn handle(&mut self, timeline: &CompiledTimeline<Finalized>) -> Result<()>;

    /// Flush any buffered state once the partition is exhausted.
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Tile `[0, file_len)` into `workers` contiguous byte ranges. The last
/// range runs to end-of-file.
pub fn tile(file_len: u64, workers: usize) -> Vec<ByteRange> {
    let workers = workers.max(1) as u64;
    let step = (file_len / workers).max(1);
    (0..workers)
        .map(|w| {
            let start = (w * step).min(file_len);
            let stop = if w == workers - 1 { 0 } else { ((w + 1) * step).min(file_len) };
            ByteRange::new(start, stop)
        })
        .collect()
}

/// Worker statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct WorkerStats {
    pub patients: u64,
    pub skipped: u64,
}

/// Overall run statistics.
#[derive(Debug)]
pub struct ShardStats {
    pub patients: u64,
    pub skipped: u64,
    pub worker_stats: Vec<WorkerStats>,
    pub duration: Duration,
}

impl ShardStats {
    pub fn throughput(&self) -> f64 {
        if self.duration.as_secs_f64() > 0.0 {
            self.patients as f64 / self.duration.as_secs_f64()
        } else {
            0.0
        }
    }
}

/// Partitioned compile-and-consume run over one TDF file.
pub struct ShardRunner<H>
where
    H: Fn() -> Box<dyn PatientHandler> + Send + Sync + 'static,
{
    path: PathBuf,
    worker_count: usize,
    handler_factory: Arc<H>,
    table: Arc<MetadataTable>,
    meds: Arc<MedicationTable>,
    config: CompilerConfig,
}

impl<H> ShardRunner<H>
where
    H: Fn() -> Box<dyn PatientHandler> + Send + Sync + 'static,
{
    pub fn new(
        path: impl AsRef<Path>,
        worker_count: usize,
        table: Arc<MetadataTable>,
        meds: Arc<MedicationTable>,
        handler_factory: H,
    ) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            worker_count: worker_count.max(1),
            handler_factory: Arc::new(handler_factory),
            table,
            meds,
            config: CompilerConfig::default(),
        }
    }

    pub fn config(mut self, config: CompilerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn run(self) -> Result<ShardStats> {
        let file_len = std::fs::metadata(&self.path)
            .with_context(|| format!("stat {}", self.path.display()))?
            .len();
        let ranges = tile(file_len, self.worker_count);
        let start = Instant::now();

        let mut handles = Vec::with_capacity(ranges.len());
        for (worker_id, range) in ranges.into_iter().enumerate() {
            let path = self.path.clone();
            let factory = Arc::clone(&self.handler_factory);
            let table = Arc::clone(&self.table);
            let meds = Arc::clone(&self.meds);
            let config = self.config;
            let handle = thread::Builder::new()
                .name(format!("shard-worker-{worker_id}"))
                .spawn(move || -> Result<WorkerStats> {
                    let mut handler = factory();
                    run_partition(&path, range, &table, &meds, config, handler.as_mut())
                })
                .map_err(|e| anyhow!("failed to spawn worker thread: {e}"))?;
            handles.push(handle);
        }

        let mut worker_stats = Vec::with_capacity(handles.len());
        for handle in handles {
            worker_stats.push(
                handle
                    .join()
                    .map_err(|_| anyhow!("worker thread panicked"))??,
            );
        }

        Ok(ShardStats {
            patients: worker_stats.iter().map(|s| s.patients).sum(),
            skipped: worker_stats.iter().map(|s| s.skipped).sum(),
            worker_stats,
            duration: start.elapsed(),
        })
    }
}

fn run_partition(
    path: &Path,
    range: ByteRange,
    table: &Arc<MetadataTable>,
    meds: &Arc<MedicationTable>,
    config: CompilerConfig,
    handler: &mut dyn PatientHandler,
) -> Result<WorkerStats> {
    let mut locator = PatientLocator::open(path, range)
        .with_context(|| format!("open partition [{}, {})", range.start, range.stop))?;
    let mut reader = PatientReader::open(path)?;
    let compiler = TimelineCompiler::with_config(Arc::clone(table), Arc::clone(meds), config);
    let mut stats = WorkerStats::default();

    loop {
        let span = match locator.next_patient() {
            Ok(Some(span)) => span,
            Ok(None) => break,
            Err(Error::IncompleteRecord(offset)) => {
                log::warn!("incomplete record at byte {offset}, dropping partition tail");
                break;
            }
            Err(err) => return Err(err).context("locating patient records"),
        };
        let record = match reader.read(span) {
            Ok(record) => record,
            Err(err) => {
                log::warn!("skipping unreadable record at byte {}: {err}", span.start);
                stats.skipped += 1;
                continue;
            }
        };
        let timeline = compiler.compile_finalized(&record);
        handler.handle(&timeline)?;
        stats.patients += 1;
    }

    handler.flush()?;
    Ok(stats)
}
