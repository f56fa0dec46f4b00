//! Per-frame scheduling core: frame timing, budgeted message intake, cooperative
//! background workers and a bounded shutdown sequence.

pub mod budget;
pub mod clock;
pub mod config;
pub mod context;
pub mod intake;
pub mod metrics;
pub mod scheduler;
pub mod shutdown;
pub mod worker;

pub use budget::AdaptiveBudget;
pub use clock::{Clock, FrameClock, FrameSample, ManualClock, SystemClock};
pub use config::{ConfigError, SchedulerConfig};
pub use context::{QuitHandle, SchedulerContext};
pub use intake::{
    DispatchError, DispatchStats, DispatchTable, DrainExit, DrainReport, IntakeStats,
    MessageDispatch, MessageIntakePump, MessageSource, TaggedMessage,
};
pub use metrics::{LoopMetricsSnapshot, MetricsHandle};
pub use scheduler::{FrameHost, FrameScheduler, RunSummary, SchedulerState};
pub use shutdown::{ShutdownQueries, ShutdownSequencer, ShutdownState, TerminationReason};
pub use worker::{
    BackgroundWorker, BackgroundWorkerPool, IdleWindow, JobSubmitter, PauseFlag, PauseSignal,
    PumpReport, PumpStats, QueuedWorker, WorkerHandle, WorkerId, WorkerKind,
};
