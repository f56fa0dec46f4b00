use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::warn;
use viewer_core::{BackgroundWorkerPool, JobSubmitter, QueuedWorker, WorkerKind};

const FETCH_LATENCY: Duration = Duration::from_micros(500);
/// Simulated decoder throughput: one microsecond per this many codec bytes.
const DECODE_BYTES_PER_MICRO: u64 = 16;
const DECODED_BYTES_PER_CODEC_BYTE: u64 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FetchJob {
    pub(crate) texture_id: u32,
    pub(crate) codec_bytes: u32,
}

#[derive(Debug, Clone, Copy)]
struct DecodeJob {
    texture_id: u32,
    codec_bytes: u32,
}

#[derive(Debug, Clone, Copy)]
struct CacheJob {
    texture_id: u32,
    raw_bytes: u64,
}

#[derive(Debug, Clone, Copy)]
struct VfsJob {
    texture_id: u32,
    raw_bytes: u64,
}

#[derive(Debug, Clone)]
pub(crate) struct ChatLogJob {
    pub(crate) line: String,
}

/// Progress counters shared with every worker thread.
#[derive(Debug, Default)]
pub(crate) struct PipelineCounters {
    fetched: AtomicU64,
    decoded: AtomicU64,
    cached: AtomicU64,
    vfs_entries: AtomicU64,
    chat_lines_written: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct PipelineTotals {
    pub(crate) fetched: u64,
    pub(crate) decoded: u64,
    pub(crate) cached: u64,
    pub(crate) vfs_entries: u64,
    pub(crate) chat_lines_written: u64,
}

impl PipelineCounters {
    pub(crate) fn totals(&self) -> PipelineTotals {
        PipelineTotals {
            fetched: self.fetched.load(Ordering::Relaxed),
            decoded: self.decoded.load(Ordering::Relaxed),
            cached: self.cached.load(Ordering::Relaxed),
            vfs_entries: self.vfs_entries.load(Ordering::Relaxed),
            chat_lines_written: self.chat_lines_written.load(Ordering::Relaxed),
        }
    }
}

/// Entry points into the worker pipeline that the session layer feeds.
#[derive(Clone)]
pub(crate) struct WorkerJobs {
    pub(crate) fetch: JobSubmitter<FetchJob>,
    pub(crate) chat_log: JobSubmitter<ChatLogJob>,
    pub(crate) counters: Arc<PipelineCounters>,
}

/// Registers the texture pipeline (fetch, decode, disk cache on their own threads, then the
/// VFS index) and the chat log writer. Both file workers run inline on the pump.
pub(crate) fn register_workers(
    pool: &mut BackgroundWorkerPool,
    chat_log_path: PathBuf,
) -> io::Result<WorkerJobs> {
    let counters = Arc::new(PipelineCounters::default());
    let fetch_jobs = JobSubmitter::<FetchJob>::new();
    let decode_jobs = JobSubmitter::<DecodeJob>::new();
    let cache_jobs = JobSubmitter::<CacheJob>::new();
    let vfs_jobs = JobSubmitter::<VfsJob>::new();
    let chat_jobs = JobSubmitter::<ChatLogJob>::new();

    pool.try_register(WorkerKind::TextureFetch, "texture_fetch", |signal| {
        let decode = decode_jobs.clone();
        let counters = Arc::clone(&counters);
        QueuedWorker::threaded("texture_fetch", &fetch_jobs, signal, move |job: FetchJob| {
            thread::sleep(FETCH_LATENCY);
            counters.fetched.fetch_add(1, Ordering::Relaxed);
            decode.submit(DecodeJob {
                texture_id: job.texture_id,
                codec_bytes: job.codec_bytes,
            });
        })
    })?;

    pool.try_register(WorkerKind::ImageDecode, "image_decode", |signal| {
        let cache = cache_jobs.clone();
        let counters = Arc::clone(&counters);
        QueuedWorker::threaded("image_decode", &decode_jobs, signal, move |job: DecodeJob| {
            let codec_bytes = u64::from(job.codec_bytes);
            thread::sleep(Duration::from_micros(codec_bytes / DECODE_BYTES_PER_MICRO));
            counters.decoded.fetch_add(1, Ordering::Relaxed);
            cache.submit(CacheJob {
                texture_id: job.texture_id,
                raw_bytes: codec_bytes * DECODED_BYTES_PER_CODEC_BYTE,
            });
        })
    })?;

    pool.try_register(WorkerKind::DiskCache, "texture_cache", |signal| {
        let vfs = vfs_jobs.clone();
        let counters = Arc::clone(&counters);
        QueuedWorker::threaded("texture_cache", &cache_jobs, signal, move |job: CacheJob| {
            counters.cached.fetch_add(1, Ordering::Relaxed);
            vfs.submit(VfsJob {
                texture_id: job.texture_id,
                raw_bytes: job.raw_bytes,
            });
        })
    })?;

    let vfs_counters = Arc::clone(&counters);
    let mut vfs_index: HashMap<u32, u64> = HashMap::new();
    pool.register(WorkerKind::FileIo, "vfs", |_signal| {
        QueuedWorker::inline("vfs", &vfs_jobs, move |job: VfsJob| {
            vfs_index.insert(job.texture_id, job.raw_bytes);
            vfs_counters
                .vfs_entries
                .store(vfs_index.len() as u64, Ordering::Relaxed);
        })
    });

    let chat_counters = Arc::clone(&counters);
    let mut chat_log = ChatLogWriter::new(chat_log_path);
    pool.register(WorkerKind::FileIo, "lfs", |_signal| {
        QueuedWorker::inline("lfs", &chat_jobs, move |job: ChatLogJob| {
            if chat_log.append(&job.line) {
                chat_counters
                    .chat_lines_written
                    .fetch_add(1, Ordering::Relaxed);
            }
        })
    });

    Ok(WorkerJobs {
        fetch: fetch_jobs,
        chat_log: chat_jobs,
        counters,
    })
}

/// Appends chat lines to the local transcript, opening it on first use.
struct ChatLogWriter {
    path: PathBuf,
    file: Option<File>,
    failed: bool,
}

impl ChatLogWriter {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            file: None,
            failed: false,
        }
    }

    fn append(&mut self, line: &str) -> bool {
        if self.failed {
            return false;
        }
        if self.file.is_none() {
            match OpenOptions::new().create(true).append(true).open(&self.path) {
                Ok(file) => self.file = Some(file),
                Err(err) => {
                    warn!(error = %err, path = %self.path.display(), "chat_log_open_failed");
                    self.failed = true;
                    return false;
                }
            }
        }
        let Some(file) = self.file.as_mut() else {
            return false;
        };
        if let Err(err) = writeln!(file, "{line}") {
            warn!(error = %err, path = %self.path.display(), "chat_log_write_failed");
            self.failed = true;
            return false;
        }
        true
    }
}
