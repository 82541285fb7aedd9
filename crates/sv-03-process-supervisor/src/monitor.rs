//! # Multiplexed Death-Watch
//!
//! One blocking thread waits on every monitored process handle at once,
//! plus a control event. Adding or removing a process signals the control
//! event, which makes the thread rebuild its handle list and wait again.
//!
//! ```text
//!            monitor(pid) / unmonitor(pid)
//!                    │  SetEvent(control)
//!                    ▼
//! ┌──────────── wait thread ─────────────┐
//! │ WaitForMultipleObjects([control,     │
//! │                         h1, h2, ...])│
//! │   control ─► rebuild list            │
//! │   hN      ─► resolve Exited(pidN)    │
//! │   failure ─► attribute, retry        │
//! └──────────────────────────────────────┘
//! ```
//!
//! The thread exits when nothing is left to watch and is started again by
//! the next `monitor` call. Handles removed while the thread may be
//! blocked on them are retired and closed by the thread itself once it is
//! no longer waiting.
//!
//! ## Failure attribution
//!
//! A failed wait does not say which handle caused it. With
//! [`FailureAttribution::BlameMostRecent`] the most recently added entry is
//! assumed to be at fault and is the only one rejected; this is a guess.
//! If that entry is already gone, or with [`FailureAttribution::RejectAll`],
//! every entry is rejected.

use crate::error::MonitorError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use shared_types::{Pid, PlatformError, ProcessAccess, RawHandle, SharedPlatform, WaitOutcome};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

/// How a monitored process's watch ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorOutcome {
    /// The process terminated.
    Exited(Pid),
    /// The watch was removed with [`ProcessMonitor::unmonitor`].
    Removed,
}

/// Who is blamed when the aggregate wait fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureAttribution {
    #[default]
    BlameMostRecent,
    RejectAll,
}

type Reply = oneshot::Sender<Result<MonitorOutcome, MonitorError>>;

struct Entry {
    handle: RawHandle,
    pid: Pid,
    reply: Reply,
}

#[derive(Default)]
struct WatchSet {
    /// Control event; `Some` while the wait thread runs.
    control: Option<RawHandle>,
    entries: Vec<Entry>,
    last_added: Option<RawHandle>,
    /// Removed handles the thread may still be waiting on.
    retired: Vec<RawHandle>,
}

struct Shared {
    platform: SharedPlatform,
    attribution: FailureAttribution,
    set: Mutex<WatchSet>,
}

/// Resolves when the monitored process ends or is unmonitored.
#[derive(Debug)]
pub struct Monitored {
    rx: oneshot::Receiver<Result<MonitorOutcome, MonitorError>>,
}

impl Monitored {
    fn ready(result: Result<MonitorOutcome, MonitorError>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self { rx }
    }
}

impl Future for Monitored {
    type Output = Result<MonitorOutcome, MonitorError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(MonitorError::Dropped)))
    }
}

/// Watches many processes with one blocking wait.
#[derive(Clone)]
pub struct ProcessMonitor {
    shared: Arc<Shared>,
}

impl ProcessMonitor {
    pub fn new(platform: SharedPlatform, attribution: FailureAttribution) -> Self {
        Self {
            shared: Arc::new(Shared {
                platform,
                attribution,
                set: Mutex::new(WatchSet::default()),
            }),
        }
    }

    /// Watch `pid`. Registration is immediate; the returned future resolves
    /// with [`MonitorOutcome::Exited`] when the process ends.
    pub fn monitor(&self, pid: Pid) -> Monitored {
        let platform = &self.shared.platform;
        let handle = match platform.open_process(pid, ProcessAccess::Synchronize) {
            Ok(handle) => handle,
            Err(e) => return Monitored::ready(Err(e.into())),
        };
        let (tx, rx) = oneshot::channel();

        let mut set = self.shared.set.lock();
        set.entries.push(Entry {
            handle,
            pid,
            reply: tx,
        });
        set.last_added = Some(handle);

        match set.control {
            Some(control) => {
                if let Err(e) = platform.set_event(control) {
                    warn!(error = %e, "Unable to interrupt the process wait");
                }
            }
            None => {
                if let Err(e) = self.start_thread(&mut set) {
                    let entry = set.entries.pop();
                    set.last_added = None;
                    drop(set);
                    if let Some(entry) = entry {
                        self.close(entry.handle);
                        let _ = entry.reply.send(Err(e));
                    }
                }
            }
        }
        debug!(pid = %pid, "Monitoring process");
        Monitored { rx }
    }

    /// Stop watching `pid`. Its futures resolve with
    /// [`MonitorOutcome::Removed`]. Returns false if it was not watched.
    pub fn unmonitor(&self, pid: Pid) -> bool {
        let removed = {
            let mut set = self.shared.set.lock();
            let (removed, kept): (Vec<Entry>, Vec<Entry>) =
                std::mem::take(&mut set.entries).into_iter().partition(|e| e.pid == pid);
            set.entries = kept;
            if removed.is_empty() {
                return false;
            }
            for entry in &removed {
                if set.last_added == Some(entry.handle) {
                    set.last_added = None;
                }
            }
            match set.control {
                Some(control) => {
                    set.retired.extend(removed.iter().map(|e| e.handle));
                    let _ = self.shared.platform.set_event(control);
                }
                None => removed.iter().for_each(|e| self.close(e.handle)),
            }
            removed
        };

        for entry in removed {
            let _ = entry.reply.send(Ok(MonitorOutcome::Removed));
        }
        debug!(pid = %pid, "Stopped monitoring process");
        true
    }

    /// Stop watching everything.
    pub fn clear(&self) {
        let pids: Vec<Pid> = self.shared.set.lock().entries.iter().map(|e| e.pid).collect();
        for pid in pids {
            self.unmonitor(pid);
        }
    }

    /// Number of watched processes.
    pub fn len(&self) -> usize {
        self.shared.set.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_monitoring(&self, pid: Pid) -> bool {
        self.shared.set.lock().entries.iter().any(|e| e.pid == pid)
    }

    fn close(&self, handle: RawHandle) {
        if let Err(e) = self.shared.platform.close_handle(handle) {
            warn!(handle = %handle, error = %e, "Failed to close process handle");
        }
    }

    fn start_thread(&self, set: &mut WatchSet) -> Result<(), MonitorError> {
        let control = self.shared.platform.create_event(false)?;
        let shared = self.shared.clone();
        std::thread::Builder::new()
            .name("process-monitor".into())
            .spawn(move || wait_loop(&shared))
            .map_err(|e| {
                let _ = self.shared.platform.close_handle(control);
                MonitorError::Thread(e.to_string())
            })?;
        set.control = Some(control);
        Ok(())
    }
}

// =============================================================================
// WAIT THREAD
// =============================================================================

fn wait_loop(shared: &Shared) {
    let platform = &shared.platform;
    loop {
        let handles = {
            let mut set = shared.set.lock();
            for handle in set.retired.drain(..) {
                let _ = platform.close_handle(handle);
            }
            let Some(control) = set.control else {
                return;
            };
            if set.entries.is_empty() {
                let _ = platform.close_handle(control);
                set.control = None;
                debug!("Nothing left to monitor, wait thread exiting");
                return;
            }
            std::iter::once(control)
                .chain(set.entries.iter().map(|e| e.handle))
                .collect::<Vec<_>>()
        };

        let outcome = platform.wait_for_any(&handles, None);

        let replies = {
            let mut set = shared.set.lock();
            match outcome {
                Ok(WaitOutcome::Signaled(0)) | Ok(WaitOutcome::TimedOut) => Vec::new(),
                Ok(WaitOutcome::Signaled(index)) => {
                    let handle = handles.get(index).copied();
                    match set.entries.iter().position(|e| Some(e.handle) == handle) {
                        Some(position) => {
                            let entry = set.entries.remove(position);
                            if set.last_added == Some(entry.handle) {
                                set.last_added = None;
                            }
                            let _ = platform.close_handle(entry.handle);
                            let pid = entry.pid;
                            vec![(entry.reply, Ok(MonitorOutcome::Exited(pid)))]
                        }
                        // Removed while we were waiting; closed via `retired`.
                        None => Vec::new(),
                    }
                }
                Err(e) => attribute_failure(shared, &mut set, e),
            }
        };

        for (reply, result) in replies {
            let _ = reply.send(result);
        }
    }
}

fn attribute_failure(
    shared: &Shared,
    set: &mut WatchSet,
    err: PlatformError,
) -> Vec<(Reply, Result<MonitorOutcome, MonitorError>)> {
    let blamed = match (shared.attribution, set.last_added.take()) {
        (FailureAttribution::BlameMostRecent, Some(last)) => {
            set.entries.iter().position(|e| e.handle == last)
        }
        _ => None,
    };

    let rejected: Vec<Entry> = match blamed {
        Some(position) => {
            let entry = set.entries.remove(position);
            warn!(pid = %entry.pid, error = %err, "Process wait failed, blaming the newest entry");
            vec![entry]
        }
        None => {
            error!(count = set.entries.len(), error = %err, "Process wait failed, rejecting all");
            std::mem::take(&mut set.entries)
        }
    };

    rejected
        .into_iter()
        .map(|entry| {
            let _ = shared.platform.close_handle(entry.handle);
            (entry.reply, Err(MonitorError::Platform(err.clone())))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared_types::testing::{SimulatedPlatform, SERVICE_PID};
    use std::time::Duration;
    use tokio::time::timeout;

    const LIMIT: Duration = Duration::from_secs(5);

    fn monitor(sim: &SimulatedPlatform, attribution: FailureAttribution) -> ProcessMonitor {
        ProcessMonitor::new(Arc::new(sim.clone()), attribution)
    }

    async fn wait_until_idle(sim: &SimulatedPlatform) {
        // The thread closes the control event on its way out.
        timeout(LIMIT, async {
            while sim.open_handle_count(SERVICE_PID) > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("handles not released");
    }

    #[tokio::test]
    async fn test_exits_resolve_in_kill_order() {
        let sim = SimulatedPlatform::new();
        let monitor = monitor(&sim, FailureAttribution::default());
        let pids: Vec<Pid> = (0..5).map(|_| sim.spawn_process()).collect();
        let mut watches: Vec<Option<Monitored>> =
            pids.iter().map(|pid| Some(monitor.monitor(*pid))).collect();
        assert_eq!(monitor.len(), 5);

        for index in [4, 0, 2, 1, 3] {
            sim.exit_process(pids[index]);
            let watch = watches[index].take().unwrap();
            let outcome = timeout(LIMIT, watch).await.expect("timeout").unwrap();
            assert_eq!(outcome, MonitorOutcome::Exited(pids[index]));
        }

        assert!(monitor.is_empty());
        wait_until_idle(&sim).await;
    }

    #[tokio::test]
    async fn test_unmonitor_resolves_removed_only_for_that_pid() {
        let sim = SimulatedPlatform::new();
        let monitor = monitor(&sim, FailureAttribution::default());
        let kept = sim.spawn_process();
        let removed = sim.spawn_process();
        let kept_watch = monitor.monitor(kept);
        let removed_watch = monitor.monitor(removed);

        assert!(monitor.unmonitor(removed));
        assert!(!monitor.unmonitor(removed));
        let outcome = timeout(LIMIT, removed_watch).await.expect("timeout").unwrap();
        assert_eq!(outcome, MonitorOutcome::Removed);

        sim.exit_process(kept);
        let outcome = timeout(LIMIT, kept_watch).await.expect("timeout").unwrap();
        assert_eq!(outcome, MonitorOutcome::Exited(kept));
        wait_until_idle(&sim).await;
    }

    #[tokio::test]
    async fn test_unknown_process_rejects_at_once() {
        let sim = SimulatedPlatform::new();
        let monitor = monitor(&sim, FailureAttribution::default());

        let result = monitor.monitor(Pid(4242)).await;
        assert!(matches!(result, Err(MonitorError::Platform(_))));
        assert!(monitor.is_empty());
    }

    #[tokio::test]
    async fn test_wait_failure_blames_newest_entry() {
        let sim = SimulatedPlatform::new();
        let monitor = monitor(&sim, FailureAttribution::BlameMostRecent);
        let first = sim.spawn_process();
        let second = sim.spawn_process();
        let first_watch = monitor.monitor(first);

        // Let the thread settle into its wait on `first`.
        tokio::time::sleep(Duration::from_millis(20)).await;
        sim.fail_next_waits(1);
        let second_watch = monitor.monitor(second);

        let result = timeout(LIMIT, second_watch).await.expect("timeout");
        assert!(matches!(result, Err(MonitorError::Platform(_))));
        assert!(monitor.is_monitoring(first));

        sim.exit_process(first);
        let outcome = timeout(LIMIT, first_watch).await.expect("timeout").unwrap();
        assert_eq!(outcome, MonitorOutcome::Exited(first));
        wait_until_idle(&sim).await;
    }

    #[tokio::test]
    async fn test_wait_failure_reject_all_mode() {
        let sim = SimulatedPlatform::new();
        let monitor = monitor(&sim, FailureAttribution::RejectAll);
        let first = sim.spawn_process();
        let second = sim.spawn_process();
        let first_watch = monitor.monitor(first);
        tokio::time::sleep(Duration::from_millis(20)).await;
        sim.fail_next_waits(1);
        let second_watch = monitor.monitor(second);

        for watch in [first_watch, second_watch] {
            let result = timeout(LIMIT, watch).await.expect("timeout");
            assert!(matches!(result, Err(MonitorError::Platform(_))));
        }
        assert!(monitor.is_empty());
        wait_until_idle(&sim).await;
    }

    #[tokio::test]
    async fn test_thread_restarts_after_going_idle() {
        let sim = SimulatedPlatform::new();
        let monitor = monitor(&sim, FailureAttribution::default());

        let first = sim.spawn_process();
        let watch = monitor.monitor(first);
        sim.exit_process(first);
        timeout(LIMIT, watch).await.expect("timeout").unwrap();
        wait_until_idle(&sim).await;

        let second = sim.spawn_process();
        let watch = monitor.monitor(second);
        sim.exit_process(second);
        let outcome = timeout(LIMIT, watch).await.expect("timeout").unwrap();
        assert_eq!(outcome, MonitorOutcome::Exited(second));
    }
}
