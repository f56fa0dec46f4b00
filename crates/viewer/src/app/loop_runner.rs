use std::process::ExitCode;
use std::rc::Rc;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use viewer_core::{
    BackgroundWorkerPool, FrameScheduler, MetricsHandle, RunSummary, SchedulerContext,
    SystemClock,
};

use super::bootstrap::{AppError, AppWiring};
use super::circuit::SimulatedCircuit;
use super::control_port::ControlPort;
use super::host::ViewerHost;
use super::marker;
use super::session::{build_dispatch, SessionQueries, SessionState};
use super::workers::register_workers;

pub(crate) fn run(app: AppWiring) -> ExitCode {
    match run_viewer(app) {
        Ok(summary) => {
            info!(
                frames = summary.frames,
                reason = ?summary.termination,
                frame_stalls = summary.frame_stalls,
                "viewer_exited"
            );
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(error = %err, "startup_failed");
            ExitCode::FAILURE
        }
    }
}

fn run_viewer(app: AppWiring) -> Result<RunSummary, AppError> {
    let AppWiring { paths, settings } = app;
    let context = SchedulerContext::new();
    let metrics = MetricsHandle::default();

    let mut pool = BackgroundWorkerPool::from_config(&settings.scheduler);
    let jobs =
        register_workers(&mut pool, paths.chat_log.clone()).map_err(AppError::SpawnWorker)?;
    let pool_size = pool.len();

    let (inbound_sender, mut inbound) = mpsc::channel();
    let circuit = SimulatedCircuit::spawn(settings.circuit.clone(), inbound_sender.clone())
        .map_err(AppError::SpawnCircuit)?;

    let session_id = u64::from(std::process::id());
    let session =
        SessionState::new(session_id, settings.uploads.pending_at_start as usize).shared();
    let mut dispatch = build_dispatch(&session, &context, &jobs, metrics.clone());
    let mut queries = SessionQueries::new(
        Rc::clone(&session),
        circuit.link(),
        Arc::clone(&context),
        paths.logout_marker.clone(),
        paths.final_snapshot.clone(),
    );
    let control = ControlPort::from_env();
    info!(
        session_id,
        workers = pool_size,
        control_port = ?control.bound_port(),
        "viewer_session_started"
    );
    let mut host = ViewerHost::new(
        Rc::clone(&session),
        control,
        inbound_sender,
        circuit.link(),
        Duration::from_millis(settings.render_cost_ms),
        settings.uploads.completed_per_second,
    );

    let mut scheduler = FrameScheduler::new(
        settings.scheduler.clone(),
        SystemClock,
        Arc::clone(&context),
        pool,
    )?
    .with_metrics_handle(metrics);
    let summary = scheduler.run(&mut host, &mut inbound, &mut dispatch, &mut queries);
    host.flush_replies();

    // Joins the worker threads, then the circuit thread.
    drop(scheduler);
    drop(circuit);

    if let Err(err) = marker::remove_marker(&paths.logout_marker) {
        warn!(
            error = %err,
            path = %paths.logout_marker.display(),
            "logout_marker_remove_failed"
        );
    }

    let totals = jobs.counters.totals();
    let state = session.borrow();
    info!(
        frames_rendered = host.frames_rendered(),
        object_updates = state.object_updates,
        objects_seen = state.objects_seen(),
        chat_lines = state.chat_lines,
        textures_fetched = totals.fetched,
        textures_decoded = totals.decoded,
        textures_cached = totals.cached,
        vfs_entries = totals.vfs_entries,
        chat_lines_written = totals.chat_lines_written,
        uploads_completed = state.uploads_completed,
        discarded_uploads = summary.discarded_uploads,
        abandoned_background_units = summary.abandoned_background_units,
        "session_totals"
    );
    Ok(summary)
}
