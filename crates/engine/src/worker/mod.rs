mod pool;
mod queued;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub use pool::{BackgroundWorkerPool, IdleWindow, PumpReport, PumpStats};
pub use queued::{JobSubmitter, QueuedWorker};

/// One cooperative background subsystem, advanced by the pool in small increments.
pub trait BackgroundWorker {
    /// Runs, or lets the backing thread run, at most `max_units` units of work and
    /// returns how many units are still pending afterwards.
    ///
    /// A single unit must finish in bounded, small time. Nothing preempts it.
    fn do_work(&mut self, max_units: u32) -> u32;

    /// Called after the worker's pause flag has been raised.
    fn pause(&mut self) {}

    /// Called after the worker's pause flag has been cleared.
    fn resume(&mut self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerKind {
    DiskCache,
    ImageDecode,
    TextureFetch,
    FileIo,
}

impl WorkerKind {
    pub fn is_file_io(self) -> bool {
        matches!(self, WorkerKind::FileIo)
    }

    /// Workers that compete with the render thread and are parked while it runs.
    pub fn contends_with_render(self) -> bool {
        matches!(
            self,
            WorkerKind::DiskCache | WorkerKind::ImageDecode | WorkerKind::TextureFetch
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(pub u32);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker#{}", self.0)
    }
}

/// Write side of a worker's pause flag. Owned by the pool, the only writer.
///
/// Pausing is advisory: the worker reads its [`PauseSignal`] between units and decides
/// when to stop. Nothing suspends a thread from the outside.
#[derive(Debug, Default)]
pub struct PauseFlag {
    paused: Arc<AtomicBool>,
}

impl PauseFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, paused: bool) {
        self.paused.store(paused, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn signal(&self) -> PauseSignal {
        PauseSignal {
            paused: Arc::clone(&self.paused),
        }
    }
}

/// Read side of a [`PauseFlag`], handed to the worker's own execution context.
#[derive(Debug, Clone)]
pub struct PauseSignal {
    paused: Arc<AtomicBool>,
}

impl PauseSignal {
    /// A signal no pool will ever raise.
    pub fn detached() -> Self {
        Self {
            paused: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
pub struct WorkerHandle {
    id: WorkerId,
    kind: WorkerKind,
    name: &'static str,
    paused: PauseFlag,
}

impl WorkerHandle {
    pub(crate) fn new(id: WorkerId, kind: WorkerKind, name: &'static str) -> Self {
        Self {
            id,
            kind,
            name,
            paused: PauseFlag::new(),
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn kind(&self) -> WorkerKind {
        self.kind
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_paused(&self) -> bool {
        self.paused.is_paused()
    }

    pub(crate) fn flag(&self) -> &PauseFlag {
        &self.paused
    }
}
