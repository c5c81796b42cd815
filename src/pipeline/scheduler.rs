//! Scheduled calculations.
//!
//! A calculation is a synchronous job run on Tokio's blocking pool. The
//! caller gets a [`TaskHandle`] carrying its progress and cancellation flag,
//! and waits for it with [`CalculationScheduler::await_completion`], which
//! is a timeout over the task's join handle rather than a status poll.

use crate::cancel::CancellationToken;
use crate::config::CalculationConfig;
use crate::error::{BandCalcError, Result};
use crate::pipeline::Metrics;
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Identifies a calculation for event routing: which asset, which product.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct TaskKey {
    pub asset_id: String,
    pub product: String,
}

impl TaskKey {
    pub fn new(asset_id: impl Into<String>, product: impl Into<String>) -> Self {
        Self {
            asset_id: asset_id.into(),
            product: product.into(),
        }
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.asset_id, self.product)
    }
}

/// Events emitted while a calculation runs.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TaskEvent {
    Progress { key: TaskKey, percent: u8 },
    Completed { key: TaskKey, path: PathBuf },
    Failed { key: TaskKey, message: String },
    Canceled { key: TaskKey },
}

/// Terminal state observed by a waiter.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Completed(PathBuf),
    Failed(String),
    Canceled,
    TimedOut,
}

/// Handed to the job: progress reporting and cancellation.
pub struct TaskContext {
    key: TaskKey,
    progress: Arc<AtomicU8>,
    cancel: CancellationToken,
    events: Option<UnboundedSender<TaskEvent>>,
}

impl TaskContext {
    pub fn key(&self) -> &TaskKey {
        &self.key
    }

    /// Raise progress to `percent` (clamped to 100). Never decreases; an
    /// event is emitted only when the value goes up.
    pub fn set_progress(&self, percent: u8) {
        let percent = percent.min(100);
        let previous = self.progress.fetch_max(percent, Ordering::SeqCst);
        if percent > previous {
            tracing::debug!("{}: {}%", self.key, percent);
            self.emit(TaskEvent::Progress {
                key: self.key.clone(),
                percent,
            });
        }
    }

    pub fn progress(&self) -> u8 {
        self.progress.load(Ordering::SeqCst)
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.is_canceled()
    }

    pub fn check_canceled(&self) -> Result<()> {
        self.cancel.check()
    }

    /// Token to pass down into fetches and kernels.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    fn emit(&self, event: TaskEvent) {
        if let Some(ref tx) = self.events {
            // Receiver gone means nobody is listening
            let _ = tx.send(event);
        }
    }
}

/// A submitted calculation.
pub struct TaskHandle {
    key: TaskKey,
    progress: Arc<AtomicU8>,
    cancel: CancellationToken,
    join: JoinHandle<Result<PathBuf>>,
}

impl TaskHandle {
    pub fn key(&self) -> &TaskKey {
        &self.key
    }

    pub fn progress(&self) -> u8 {
        self.progress.load(Ordering::SeqCst)
    }

    /// Request cooperative cancellation. The job stops at its next checkpoint.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("key", &self.key)
            .field("progress", &self.progress())
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// Runs calculation jobs off the caller's thread.
pub struct CalculationScheduler {
    config: CalculationConfig,
    runtime: Handle,
    events: Option<UnboundedSender<TaskEvent>>,
    metrics: Option<Arc<Metrics>>,
}

impl CalculationScheduler {
    /// Scheduler spawning onto `runtime`.
    pub fn new(config: CalculationConfig, runtime: Handle) -> Self {
        Self {
            config,
            runtime,
            events: None,
            metrics: None,
        }
    }

    /// Send progress and completion events to `events`.
    pub fn with_events(mut self, events: UnboundedSender<TaskEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Deadline from configuration.
    pub fn default_timeout(&self) -> Duration {
        self.config.timeout()
    }

    /// Start `job` on the blocking pool.
    pub fn run_async<F>(&self, key: TaskKey, job: F) -> TaskHandle
    where
        F: FnOnce(&TaskContext) -> Result<PathBuf> + Send + 'static,
    {
        let progress = Arc::new(AtomicU8::new(0));
        let cancel = CancellationToken::new();
        let ctx = TaskContext {
            key: key.clone(),
            progress: progress.clone(),
            cancel: cancel.clone(),
            events: self.events.clone(),
        };
        let metrics = self.metrics.clone();

        tracing::info!("Scheduling calculation {}", key);
        let join = self.runtime.spawn_blocking(move || {
            let result = job(&ctx);
            match &result {
                Ok(path) => {
                    ctx.set_progress(100);
                    tracing::info!("Calculation {} completed: {}", ctx.key, path.display());
                    ctx.emit(TaskEvent::Completed {
                        key: ctx.key.clone(),
                        path: path.clone(),
                    });
                    if let Some(ref m) = metrics {
                        m.add_calculation_completed();
                    }
                }
                Err(BandCalcError::Canceled) => {
                    tracing::warn!("Calculation {} canceled", ctx.key);
                    ctx.emit(TaskEvent::Canceled { key: ctx.key.clone() });
                    if let Some(ref m) = metrics {
                        m.add_calculation_canceled();
                    }
                }
                Err(e) => {
                    tracing::error!("Calculation {} failed: {}", ctx.key, e);
                    ctx.emit(TaskEvent::Failed {
                        key: ctx.key.clone(),
                        message: e.to_string(),
                    });
                    if let Some(ref m) = metrics {
                        m.add_calculation_failed();
                    }
                }
            }
            result
        });

        TaskHandle {
            key,
            progress,
            cancel,
            join,
        }
    }

    /// Wait for `handle` to finish, up to `timeout`.
    ///
    /// On timeout the task is asked to cancel (best effort: a job in the
    /// middle of a write finishes that write) and `TimedOut` is returned.
    pub async fn await_completion(&self, handle: TaskHandle, timeout: Duration) -> TaskOutcome {
        let TaskHandle {
            key,
            progress,
            cancel,
            mut join,
        } = handle;

        // `interval` panics on a zero period
        let mut ticker = tokio::time::interval(self.config.poll_interval().max(MIN_POLL_INTERVAL));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let wait = async {
            loop {
                tokio::select! {
                    joined = &mut join => break joined,
                    _ = ticker.tick() => {
                        tracing::trace!("Waiting on {} ({}%)", key, progress.load(Ordering::SeqCst));
                    }
                }
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(Ok(Ok(path))) => TaskOutcome::Completed(path),
            Ok(Ok(Err(BandCalcError::Canceled))) => TaskOutcome::Canceled,
            Ok(Ok(Err(e))) => TaskOutcome::Failed(e.to_string()),
            Ok(Err(join_error)) => {
                tracing::error!("Calculation {} panicked: {}", key, join_error);
                if let Some(ref m) = self.metrics {
                    m.add_calculation_failed();
                }
                TaskOutcome::Failed(format!("calculation task failed: {}", join_error))
            }
            Err(_) => {
                tracing::warn!("Calculation {} timed out after {:?}, canceling", key, timeout);
                cancel.cancel();
                if let Some(ref m) = self.metrics {
                    m.add_calculation_timed_out();
                }
                TaskOutcome::TimedOut
            }
        }
    }

    /// Blocking form of [`await_completion`](Self::await_completion) for synchronous callers.
    ///
    /// Refuses to run on a thread that is already inside the runtime, where
    /// blocking would starve the task being waited on.
    pub fn await_completion_blocking(&self, handle: TaskHandle, timeout: Duration) -> Result<TaskOutcome> {
        if Handle::try_current().is_ok() {
            return Err(BandCalcError::Scheduler(format!(
                "cannot block on {} from inside the async runtime; use await_completion",
                handle.key
            )));
        }
        Ok(self.runtime.block_on(self.await_completion(handle, timeout)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use tokio::sync::mpsc;

    fn key() -> TaskKey {
        TaskKey::new("S2A_T1", "ndvi")
    }

    fn scheduler() -> CalculationScheduler {
        CalculationScheduler::new(CalculationConfig::default(), Handle::current())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_completion_and_monotonic_progress() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let metrics = Metrics::new();
        let scheduler = scheduler().with_events(tx).with_metrics(metrics.clone());

        let handle = scheduler.run_async(key(), |ctx| {
            ctx.set_progress(10);
            ctx.set_progress(5);
            ctx.set_progress(10);
            ctx.set_progress(50);
            ctx.set_progress(150);
            Ok(PathBuf::from("/cache/S2A_T1/ndvi.tif"))
        });
        let outcome = scheduler.await_completion(handle, Duration::from_secs(5)).await;
        assert_eq!(outcome, TaskOutcome::Completed(PathBuf::from("/cache/S2A_T1/ndvi.tif")));

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert_eq!(
            events,
            vec![
                TaskEvent::Progress { key: key(), percent: 10 },
                TaskEvent::Progress { key: key(), percent: 50 },
                TaskEvent::Progress { key: key(), percent: 100 },
                TaskEvent::Completed {
                    key: key(),
                    path: PathBuf::from("/cache/S2A_T1/ndvi.tif")
                },
            ]
        );
        assert_eq!(metrics.snapshot().calculations_completed, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failure_carries_message_and_key() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let scheduler = scheduler().with_events(tx);

        let handle = scheduler.run_async(key(), |_| {
            Err(BandCalcError::PartialBandFailure {
                missing: vec!["red".to_string()],
            })
        });
        let outcome = scheduler.await_completion(handle, Duration::from_secs(5)).await;
        assert_eq!(outcome, TaskOutcome::Failed("missing required bands: red".to_string()));
        assert_eq!(
            rx.try_recv().unwrap(),
            TaskEvent::Failed {
                key: key(),
                message: "missing required bands: red".to_string()
            }
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_timeout_cancels_task() {
        let observed = Arc::new(AtomicBool::new(false));
        let flag = observed.clone();
        let scheduler = scheduler();

        let handle = scheduler.run_async(key(), move |ctx| {
            while !ctx.is_canceled() {
                std::thread::sleep(Duration::from_millis(5));
            }
            flag.store(true, Ordering::SeqCst);
            ctx.check_canceled().map(|_| PathBuf::new())
        });
        let outcome = scheduler.await_completion(handle, Duration::from_millis(50)).await;
        assert_eq!(outcome, TaskOutcome::TimedOut);

        for _ in 0..200 {
            if observed.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(observed.load(Ordering::SeqCst));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cancel_reports_canceled() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let scheduler = scheduler().with_events(tx);

        let handle = scheduler.run_async(key(), |ctx| {
            while !ctx.is_canceled() {
                std::thread::sleep(Duration::from_millis(2));
            }
            ctx.check_canceled()?;
            Ok(PathBuf::new())
        });
        handle.cancel();
        let outcome = scheduler.await_completion(handle, Duration::from_secs(5)).await;
        assert_eq!(outcome, TaskOutcome::Canceled);
        assert_eq!(rx.try_recv().unwrap(), TaskEvent::Canceled { key: key() });
    }

    #[tokio::test]
    async fn test_blocking_wait_refused_inside_runtime() {
        let scheduler = scheduler();
        let handle = scheduler.run_async(key(), |_| Ok(PathBuf::new()));
        let err = scheduler
            .await_completion_blocking(handle, Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, BandCalcError::Scheduler(_)));
    }

    #[test]
    fn test_blocking_wait_outside_runtime() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();
        let scheduler = CalculationScheduler::new(CalculationConfig::default(), runtime.handle().clone());

        let handle = scheduler.run_async(key(), |ctx| {
            ctx.set_progress(40);
            Ok(PathBuf::from("out.tif"))
        });
        let outcome = scheduler
            .await_completion_blocking(handle, Duration::from_secs(5))
            .unwrap();
        assert_eq!(outcome, TaskOutcome::Completed(PathBuf::from("out.tif")));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_zero_poll_interval_still_waits() {
        let config = CalculationConfig {
            poll_interval_ms: 0,
            ..CalculationConfig::default()
        };
        let scheduler = CalculationScheduler::new(config, Handle::current());

        let handle = scheduler.run_async(key(), |_| {
            std::thread::sleep(Duration::from_millis(20));
            Ok(PathBuf::from("slow.tif"))
        });
        let outcome = scheduler.await_completion(handle, Duration::from_secs(5)).await;
        assert_eq!(outcome, TaskOutcome::Completed(PathBuf::from("slow.tif")));
    }
}
