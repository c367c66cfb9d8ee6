//! Periodic monitor loop.
//!
//! Once started, the monitor registers the vsync estimator with its source
//! and runs a tokio task that samples the engine at a fixed cadence,
//! pushing every positive value to the registered observer.
//!
//! Ticks never overlap: the next sleep only starts after the current
//! sample and delivery complete. `stop` cancels the task through a watch
//! channel, aborts it, and deregisters vsync before returning.

use crate::error::MonitorError;
use crate::sampler::{parse_fps, Sampler};
use crate::vsync::{VsyncEstimator, VsyncSource};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Receives one frame-rate value per monitor tick.
pub type Observer = Arc<dyn Fn(f64) + Send + Sync>;

type ObserverSlot = Arc<Mutex<Option<Observer>>>;

struct MonitorTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Restartable periodic monitor.
pub struct FpsMonitor {
    sampler: Arc<Sampler>,
    estimator: Arc<VsyncEstimator>,
    vsync: Arc<dyn VsyncSource>,
    interval: Duration,
    running: AtomicBool,
    observer: ObserverSlot,
    task: Mutex<Option<MonitorTask>>,
}

impl FpsMonitor {
    pub fn new(
        sampler: Arc<Sampler>,
        estimator: Arc<VsyncEstimator>,
        vsync: Arc<dyn VsyncSource>,
        interval: Duration,
    ) -> Self {
        Self {
            sampler,
            estimator,
            vsync,
            interval,
            running: AtomicBool::new(false),
            observer: Arc::new(Mutex::new(None)),
            task: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Replace the observer without restarting the loop.
    ///
    /// The observer is invoked while the monitor holds its observer slot,
    /// so it must not call back into `set_observer` or `stop`.
    pub fn set_observer(&self, observer: Observer) {
        *lock(&self.observer) = Some(observer);
    }

    /// Start monitoring. Returns `Ok(false)` if already running.
    ///
    /// Must be called from within a tokio runtime. A failed vsync
    /// registration is logged and the loop runs without it. The task slot
    /// stays locked until the loop is spawned, so a concurrent `stop` either
    /// runs first or sees the new task; `VsyncSource::register` must not call
    /// back into the monitor.
    pub fn start(&self, observer: Observer) -> Result<bool, MonitorError> {
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| MonitorError::NoRuntime)?;

        let mut task = lock(&self.task);
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Monitor already running, ignoring start");
            return Ok(false);
        }

        self.set_observer(observer);

        self.estimator.activate();
        if let Err(e) = self.vsync.register(self.estimator.callback()) {
            warn!("Vsync registration failed: {}, estimator stays at its last value", e);
            self.estimator.deactivate();
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = runtime.spawn(run_monitor_loop(
            Arc::clone(&self.sampler),
            Arc::clone(&self.observer),
            self.interval,
            shutdown_rx,
        ));
        *task = Some(MonitorTask { shutdown, handle });

        info!(interval_ms = self.interval.as_millis() as u64, "FPS monitoring started");
        Ok(true)
    }

    /// Stop monitoring. Safe to call repeatedly or before any `start`.
    ///
    /// After this returns the observer is not invoked again and the vsync
    /// estimator no longer changes.
    pub fn stop(&self) {
        let mut task = lock(&self.task);
        let was_running = self.running.swap(false, Ordering::SeqCst);

        lock(&self.observer).take();

        if let Some(active) = task.take() {
            let _ = active.shutdown.send(true);
            active.handle.abort();
        }

        self.vsync.deregister();
        self.estimator.deactivate();
        drop(task);

        if was_running {
            info!("FPS monitoring stopped");
        }
    }

    /// Stop monitoring and release the executor's privileged session.
    ///
    /// Terminal: the monitor is not meant to be used afterwards.
    pub fn destroy(&self) {
        self.stop();
        self.sampler.resolver().executor().release();
        info!("FPS monitor destroyed");
    }
}

impl Drop for FpsMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn run_monitor_loop(
    sampler: Arc<Sampler>,
    observer: ObserverSlot,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let tick_sampler = Arc::clone(&sampler);
        match tokio::task::spawn_blocking(move || tick_sampler.sample()).await {
            Ok(value) => deliver(&observer, &value),
            Err(e) => error!("Monitor tick failed: {}, continuing", e),
        }

        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            _ = tokio::time::sleep(interval) => {}
        }
    }
    debug!("Monitor loop exited");
}

fn deliver(observer: &ObserverSlot, value: &str) {
    let Some(fps) = parse_fps(value).filter(|fps| *fps > 0.0) else {
        trace!(value, "Skipping non-positive sample");
        return;
    };

    let slot = lock(observer);
    if let Some(callback) = slot.as_ref() {
        if std::panic::catch_unwind(AssertUnwindSafe(|| callback(fps))).is_err() {
            error!("Observer panicked on {:.1} fps, continuing", fps);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::{SourceResolver, DEFAULT_COUNTER_COMMAND, WELL_KNOWN_COUNTER_PATHS};
    use crate::sampler::DEFAULT_FRAME_REPORT_COMMAND;
    use crate::test_support::{ManualVsync, ScriptedExecutor};
    use crate::vsync::NANOS_PER_SEC;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;

    const TICK: Duration = Duration::from_millis(20);

    struct Fixture {
        executor: Arc<ScriptedExecutor>,
        vsync: Arc<ManualVsync>,
        estimator: Arc<VsyncEstimator>,
        monitor: FpsMonitor,
    }

    fn fixture() -> Fixture {
        let executor = Arc::new(ScriptedExecutor::new());
        executor.fail(DEFAULT_COUNTER_COMMAND);
        let resolver = Arc::new(SourceResolver::new(
            executor.clone(),
            WELL_KNOWN_COUNTER_PATHS.iter().map(|p| p.to_string()).collect(),
            Vec::new(),
            DEFAULT_COUNTER_COMMAND,
        ));
        let estimator = Arc::new(VsyncEstimator::new());
        let sampler = Arc::new(Sampler::new(
            resolver,
            estimator.clone(),
            DEFAULT_FRAME_REPORT_COMMAND,
            16,
        ));
        let vsync = Arc::new(ManualVsync::new());
        let monitor = FpsMonitor::new(sampler, estimator.clone(), vsync.clone(), TICK);

        Fixture {
            executor,
            vsync,
            estimator,
            monitor,
        }
    }

    fn channel_observer() -> (Observer, mpsc::UnboundedReceiver<f64>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let observer: Observer = Arc::new(move |fps| {
            let _ = tx.send(fps);
        });
        (observer, rx)
    }

    fn counting_observer() -> (Observer, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let observer: Observer = Arc::new(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        (observer, count)
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<f64>) -> Option<f64> {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn test_observer_receives_samples() {
        let f = fixture();
        f.executor.add_file(WELL_KNOWN_COUNTER_PATHS[0], "60");
        let (observer, mut rx) = channel_observer();

        assert!(f.monitor.start(observer).unwrap());
        assert_eq!(recv(&mut rx).await, Some(60.0));
        assert_eq!(recv(&mut rx).await, Some(60.0));
        f.monitor.stop();
    }

    #[tokio::test]
    async fn test_start_twice_is_idempotent() {
        let f = fixture();
        let (first, _rx1) = channel_observer();
        let (second, _rx2) = channel_observer();

        assert!(f.monitor.start(first).unwrap());
        assert!(!f.monitor.start(second).unwrap());

        assert!(f.monitor.is_running());
        assert_eq!(f.vsync.registrations(), 1);
        assert!(f.monitor.task.lock().unwrap().is_some());
        f.monitor.stop();
    }

    #[tokio::test]
    async fn test_stop_before_start_is_noop() {
        let f = fixture();
        f.monitor.stop();
        f.monitor.stop();
        assert!(!f.monitor.is_running());
        assert_eq!(f.vsync.deregistrations(), 0);
    }

    #[tokio::test]
    async fn test_no_delivery_after_stop() {
        let f = fixture();
        f.executor.add_file(WELL_KNOWN_COUNTER_PATHS[0], "60");
        let (observer, count) = counting_observer();

        f.monitor.start(observer).unwrap();
        tokio::time::sleep(TICK * 4).await;
        f.monitor.stop();

        let delivered = count.load(Ordering::SeqCst);
        assert!(delivered > 0);
        assert!(!f.vsync.is_registered());
        assert!(!f.estimator.is_active());

        tokio::time::sleep(TICK * 5).await;
        assert_eq!(count.load(Ordering::SeqCst), delivered);
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let f = fixture();
        f.executor.add_file(WELL_KNOWN_COUNTER_PATHS[0], "90");

        let (observer, _rx) = channel_observer();
        f.monitor.start(observer).unwrap();
        f.monitor.stop();

        let (observer, mut rx) = channel_observer();
        assert!(f.monitor.start(observer).unwrap());
        assert_eq!(f.vsync.registrations(), 2);
        assert_eq!(recv(&mut rx).await, Some(90.0));
        f.monitor.stop();
    }

    #[tokio::test]
    async fn test_baseline_values_not_delivered() {
        let f = fixture();
        let (observer, count) = counting_observer();

        f.monitor.start(observer).unwrap();
        tokio::time::sleep(TICK * 5).await;
        f.monitor.stop();

        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_vsync_drives_observer() {
        let f = fixture();
        let (observer, mut rx) = channel_observer();
        f.monitor.start(observer).unwrap();

        for k in 0..=60 {
            assert!(f.vsync.fire(k * NANOS_PER_SEC / 60));
        }
        assert_eq!(recv(&mut rx).await, Some(60.0));
        f.monitor.stop();

        // Deliveries after stop reach nobody.
        assert!(!f.vsync.fire(5 * NANOS_PER_SEC));
    }

    #[tokio::test]
    async fn test_observer_panic_is_swallowed() {
        let f = fixture();
        f.executor.add_file(WELL_KNOWN_COUNTER_PATHS[0], "60");

        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        let observer: Observer = Arc::new(move |_| {
            if c.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("observer failure");
            }
        });

        f.monitor.start(observer).unwrap();
        tokio::time::sleep(TICK * 5).await;
        f.monitor.stop();

        assert!(calls.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_set_observer_replaces_callback() {
        let f = fixture();
        f.executor.add_file(WELL_KNOWN_COUNTER_PATHS[0], "60");

        let (first, first_count) = counting_observer();
        let (second, mut rx) = channel_observer();

        f.monitor.start(first).unwrap();
        f.monitor.set_observer(second);
        let seen_by_first = first_count.load(Ordering::SeqCst);

        assert_eq!(recv(&mut rx).await, Some(60.0));
        assert_eq!(first_count.load(Ordering::SeqCst), seen_by_first);
        f.monitor.stop();
    }

    #[tokio::test]
    async fn test_destroy_releases_executor() {
        let f = fixture();
        let (observer, _rx) = channel_observer();
        f.monitor.start(observer).unwrap();

        f.monitor.destroy();
        assert!(!f.monitor.is_running());
        assert_eq!(f.executor.releases(), 1);
        assert_eq!(f.vsync.deregistrations(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_start_runs_one_loop() {
        let f = fixture();
        let runtime = tokio::runtime::Handle::current();
        let barrier = std::sync::Barrier::new(8);

        let started: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    scope.spawn(|| {
                        let _guard = runtime.enter();
                        let (observer, _count) = counting_observer();
                        barrier.wait();
                        f.monitor.start(observer).unwrap() as usize
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });

        assert_eq!(started, 1);
        assert_eq!(f.vsync.registrations(), 1);
        assert!(f.monitor.is_running());
        assert!(f.monitor.task.lock().unwrap().is_some());
        f.monitor.stop();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_racing_start_and_stop_stay_consistent() {
        let f = fixture();
        let runtime = tokio::runtime::Handle::current();

        std::thread::scope(|scope| {
            for worker in 0..6 {
                let (f, runtime) = (&f, &runtime);
                scope.spawn(move || {
                    let _guard = runtime.enter();
                    for round in 0..50 {
                        if (worker + round) % 2 == 0 {
                            let (observer, _count) = counting_observer();
                            f.monitor.start(observer).unwrap();
                        } else {
                            f.monitor.stop();
                        }
                    }
                });
            }
        });

        let running = f.monitor.is_running();
        assert_eq!(f.monitor.task.lock().unwrap().is_some(), running);
        assert_eq!(f.vsync.is_registered(), running);
        assert_eq!(
            f.vsync.registrations() - f.vsync.deregistrations(),
            running as usize
        );

        f.monitor.stop();
        assert!(f.monitor.task.lock().unwrap().is_none());
        assert!(!f.vsync.is_registered());
    }

    #[test]
    fn test_start_without_runtime() {
        let f = fixture();
        let (observer, _count) = counting_observer();
        assert!(matches!(f.monitor.start(observer), Err(MonitorError::NoRuntime)));
        assert!(!f.monitor.is_running());
    }
}
