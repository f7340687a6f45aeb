//! Polling change detection.
//!
//! A `Watcher` owns a checksum source and a baseline. Every tick it collects
//! a fresh `ChecksumSet`, diffs it against the baseline and emits non-empty
//! diffs. Failed collections are emitted on the error channel and leave the
//! baseline untouched. The baseline starts empty, so the first successful
//! tick reports every unit as created.
//!
//! Both channels are bounded and sends are awaited: a consumer that stops
//! draining stalls detection rather than losing events.

use crate::error::Error;
use crate::services::database::{ChecksumSet, ChecksumSource, collect};
use crate::services::diff::Diff;
use async_channel::{Receiver, Sender, bounded};
use chrono::{DateTime, Utc};
use smol::{Task, Timer};
use std::future::Future;
use std::time::Duration;

pub const DEFAULT_CAPACITY: usize = 100;

#[derive(Debug, Clone)]
pub struct DiffEvent {
    pub diff: Diff,
    pub timestamp: DateTime<Utc>,
}

pub struct Watcher<S> {
    source: S,
    interval: Duration,
    capacity: usize,
}

impl<S: ChecksumSource + 'static> Watcher<S> {
    pub fn new(source: S, interval: Duration) -> Self {
        Self {
            source,
            interval,
            capacity: DEFAULT_CAPACITY,
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Spawn the polling task.
    pub fn start(self) -> WatcherHandle {
        let (diff_tx, diff_rx) = bounded(self.capacity);
        let (error_tx, error_rx) = bounded(self.capacity);
        let (stop_tx, stop_rx) = bounded::<()>(1);

        tracing::info!("Watching for changes every {:?}", self.interval);

        let task = smol::spawn(poll(
            self.source,
            self.interval,
            diff_tx,
            error_tx,
            stop_rx,
        ));

        WatcherHandle {
            diffs: diff_rx,
            errors: error_rx,
            stop: stop_tx,
            task,
        }
    }
}

/// Receiving side of a running watcher. Dropping it cancels the task.
pub struct WatcherHandle {
    diffs: Receiver<DiffEvent>,
    errors: Receiver<Error>,
    stop: Sender<()>,
    task: Task<()>,
}

impl WatcherHandle {
    pub fn diffs(&self) -> Receiver<DiffEvent> {
        self.diffs.clone()
    }

    pub fn errors(&self) -> Receiver<Error> {
        self.errors.clone()
    }

    /// Signal the task and wait for it to finish its current tick.
    pub async fn stop(self) {
        self.stop.close();
        self.task.await;
    }
}

async fn poll<S: ChecksumSource>(
    source: S,
    interval: Duration,
    diffs: Sender<DiffEvent>,
    errors: Sender<Error>,
    stop: Receiver<()>,
) {
    let mut baseline = ChecksumSet::new();

    loop {
        tracing::debug!("Checking for changes");

        match collect(&source).await {
            Ok(current) => {
                let diff = Diff::compute(&baseline, &current);
                baseline = current;

                if !diff.is_empty() {
                    if stop.is_closed() {
                        break;
                    }
                    tracing::debug!("Detected {} changed units", diff.len());
                    let event = DiffEvent {
                        diff,
                        timestamp: Utc::now(),
                    };
                    match until_stopped(&stop, diffs.send(event)).await {
                        Some(Ok(())) => {}
                        Some(Err(_)) | None => break,
                    }
                }
            }
            Err(e) => {
                tracing::warn!("Checksum collection failed: {}", e);
                if stop.is_closed() {
                    break;
                }
                match until_stopped(&stop, errors.send(e)).await {
                    Some(Ok(())) => {}
                    Some(Err(_)) | None => break,
                }
            }
        }

        if stop.is_closed() {
            break;
        }
        if until_stopped(&stop, Timer::after(interval)).await.is_none() {
            break;
        }
    }

    tracing::info!("Watcher stopped");
}

/// Run `fut` unless the stop signal fires first.
async fn until_stopped<F: Future>(stop: &Receiver<()>, fut: F) -> Option<F::Output> {
    smol::future::or(async { Some(fut.await) }, async {
        let _ = stop.recv().await;
        None
    })
    .await
}
