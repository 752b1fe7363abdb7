//! Serialized rebuild triggers
//!
//! Rebuilds for a project all go through one bounded queue with a single
//! consumer. The filesystem watcher and the proxy's reload endpoint are both
//! producers, so two rebuilds of the same container never overlap.

use crate::errors::Result;
use bytes::Bytes;
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Quiet window after the last event before a rebuild is queued
pub const DEBOUNCE: Duration = Duration::from_millis(500);

/// One queued rebuild
#[derive(Debug)]
pub struct RebuildJob {
    /// Receives rebuild output as it is produced
    pub output: Option<mpsc::Sender<Bytes>>,
    /// Completion signal with the failure message, if any
    pub done: Option<oneshot::Sender<std::result::Result<(), String>>>,
}

impl RebuildJob {
    /// Fire-and-forget job, as queued by the watcher
    pub fn detached() -> Self {
        Self {
            output: None,
            done: None,
        }
    }

    /// Job whose output and result are reported back to the caller
    pub fn reporting(
        output: mpsc::Sender<Bytes>,
    ) -> (Self, oneshot::Receiver<std::result::Result<(), String>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                output: Some(output),
                done: Some(tx),
            },
            rx,
        )
    }
}

/// The rebuild queue; one job may wait while another runs.
pub fn job_queue() -> (mpsc::Sender<RebuildJob>, mpsc::Receiver<RebuildJob>) {
    mpsc::channel(1)
}

/// Run queued jobs one at a time until every sender is dropped.
pub async fn run_jobs<F, Fut>(mut jobs: mpsc::Receiver<RebuildJob>, mut handler: F)
where
    F: FnMut(Option<mpsc::Sender<Bytes>>) -> Fut,
    Fut: Future<Output = std::result::Result<(), String>>,
{
    while let Some(job) = jobs.recv().await {
        let result = handler(job.output).await;
        match &result {
            Ok(()) => info!("Rebuild finished"),
            Err(e) => warn!("Rebuild failed: {}", e),
        }
        if let Some(done) = job.done {
            let _ = done.send(result);
        }
    }
}

/// Directories whose changes trigger a rebuild
pub fn watch_paths(project_local_dir: &Path, hat_dir: Option<&Path>) -> Vec<PathBuf> {
    let mut paths = vec![project_local_dir.join(".sail")];
    if let Some(hat) = hat_dir {
        paths.push(hat.to_path_buf());
    }
    paths
}

fn is_relevant(event: &Event) -> bool {
    !matches!(event.kind, EventKind::Access(_))
}

/// Coalesce `events` and queue a rebuild once they go quiet for `quiet`.
/// A burst that arrives while a job is already queued is dropped.
pub async fn debounce(
    mut events: mpsc::Receiver<notify::Result<Event>>,
    quiet: Duration,
    jobs: mpsc::Sender<RebuildJob>,
) {
    loop {
        match events.recv().await {
            None => return,
            Some(Err(e)) => {
                warn!("Watch error: {}", e);
                continue;
            }
            Some(Ok(event)) if !is_relevant(&event) => continue,
            Some(Ok(event)) => debug!("Change detected: {:?}", event.paths),
        }

        let mut closed = false;
        loop {
            match tokio::time::timeout(quiet, events.recv()).await {
                Ok(Some(_)) => continue,
                Ok(None) => {
                    closed = true;
                    break;
                }
                Err(_) => break,
            }
        }

        match jobs.try_send(RebuildJob::detached()) {
            Ok(()) => info!("Queued rebuild"),
            Err(mpsc::error::TrySendError::Full(_)) => debug!("Rebuild already queued"),
            Err(mpsc::error::TrySendError::Closed(_)) => return,
        }
        if closed {
            return;
        }
    }
}

/// Live watch; dropping it stops the watcher, which ends the debounce task.
pub struct WatchHandle {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl WatchHandle {
    /// Wait until the debounce task ends
    pub async fn join(self) {
        let _ = self.task.await;
    }
}

/// Watch `paths` recursively and feed rebuild jobs into `jobs`. Paths that
/// do not exist are skipped.
pub fn spawn(paths: &[PathBuf], jobs: mpsc::Sender<RebuildJob>) -> Result<WatchHandle> {
    let (tx, rx) = mpsc::channel(64);
    let mut watcher = RecommendedWatcher::new(
        move |res| {
            let _ = tx.blocking_send(res);
        },
        Config::default(),
    )?;

    for path in paths {
        if !path.exists() {
            debug!("Not watching missing {}", path.display());
            continue;
        }
        watcher.watch(path, RecursiveMode::Recursive)?;
        info!("Watching {}", path.display());
    }

    let task = tokio::spawn(debounce(rx, DEBOUNCE, jobs));
    Ok(WatchHandle {
        _watcher: watcher,
        task,
    })
}
