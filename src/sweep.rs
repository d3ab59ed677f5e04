use crate::{
    build, close_session, open_session,
    utils::{file_timestamp, record_name},
    AcquisitionSettings, Capture, Controller, Device, IntegrityPolicy, LogSink, PatternSet,
    SampleSink, SweepError, SweepParameters, SweepResult, Timing,
};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

const CANCEL_POLL: Duration = Duration::from_millis(10);

/// Cooperative cancellation flag shared between a sweep and its owner.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Sleep for `duration`, waking early on cancellation. Returns `false`
    /// if the wait was cut short.
    pub fn wait(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep((deadline - now).min(CANCEL_POLL));
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepState {
    Idle,
    Generating,
    Running(usize),
    Finalizing(usize),
    Failed,
}

/// Outcome of one sweep point.
#[derive(Debug, Clone, PartialEq)]
pub struct PointRecord {
    pub index: usize,
    pub dark_time_slots: u32,
    pub samples: usize,
    /// Where the capture was written; `None` if the write failed.
    pub path: Option<PathBuf>,
    pub tainted: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SweepEvent {
    Started { points: usize, frequency: f64 },
    PointDone(PointRecord),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SweepReport {
    pub frequency: f64,
    pub points: Vec<PointRecord>,
    pub cancelled: bool,
}

struct RunGuard {
    flag: Arc<AtomicBool>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Runs T1 sweeps on one instrument, one sweep at a time.
pub struct SweepRunner<D: Device> {
    device: Mutex<D>,
    settings: AcquisitionSettings,
    log: Arc<dyn LogSink>,
    sink: Arc<dyn SampleSink>,
    running: Arc<AtomicBool>,
    state: Arc<Mutex<SweepState>>,
}

impl<D: Device> SweepRunner<D> {
    pub fn new(
        device: D,
        settings: AcquisitionSettings,
        log: Arc<dyn LogSink>,
        sink: Arc<dyn SampleSink>,
    ) -> Self {
        Self {
            device: Mutex::new(device),
            settings,
            log,
            sink,
            running: Arc::new(AtomicBool::new(false)),
            state: Arc::new(Mutex::new(SweepState::Idle)),
        }
    }

    /// Exclusive access to the device. Blocks while a sweep is running.
    pub fn device(&self) -> MutexGuard<'_, D> {
        self.device.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn settings(&self) -> &AcquisitionSettings {
        &self.settings
    }

    pub fn state(&self) -> SweepState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn open(&self) -> SweepResult<()> {
        open_session(&mut *self.device(), self.log.as_ref())
    }

    pub fn close(&self) -> SweepResult<()> {
        let channels = [self.settings.drive_channel, self.settings.reference_channel];
        close_session(&mut *self.device(), &channels, self.log.as_ref())
    }

    /// Run a sweep on the calling thread.
    ///
    /// Needs an open session. The session is released when the sweep ends,
    /// however it ends, once a sweep has started on the instrument.
    pub fn run(&self, params: &SweepParameters, cancel: &CancelToken) -> SweepResult<SweepReport> {
        let _guard = self.claim()?;
        self.execute(params, cancel, None)
    }

    /// Run a sweep on a dedicated worker thread.
    ///
    /// A request made while another sweep is running is rejected here, on
    /// the caller's thread.
    pub fn spawn(self: &Arc<Self>, params: SweepParameters) -> SweepResult<SweepHandle>
    where
        D: 'static,
    {
        let guard = self.claim()?;
        let cancel = CancelToken::new();
        let (tx, rx) = unbounded();

        let runner = Arc::clone(self);
        let token = cancel.clone();
        let handle = thread::Builder::new()
            .name("t1-sweep".into())
            .spawn(move || {
                let _guard = guard;
                runner.execute(&params, &token, Some(&tx))
            })?;

        Ok(SweepHandle {
            cancel,
            state: Arc::clone(&self.state),
            events: rx,
            handle,
        })
    }

    fn claim(&self) -> SweepResult<RunGuard> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            self.log.log(
                "Sweep",
                "Rejected",
                "a sweep is already running, request ignored",
            );
            return Err(SweepError::Busy);
        }
        Ok(RunGuard {
            flag: Arc::clone(&self.running),
        })
    }

    fn set_state(&self, state: SweepState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn execute(
        &self,
        params: &SweepParameters,
        cancel: &CancelToken,
        events: Option<&Sender<SweepEvent>>,
    ) -> SweepResult<SweepReport> {
        self.set_state(SweepState::Generating);
        let result = self.sweep(params, cancel, events);
        match &result {
            Ok(report) if report.cancelled => {
                self.log.log(
                    "Sweep",
                    "Cancelled",
                    &format!("stopped after {} points", report.points.len()),
                );
                self.set_state(SweepState::Idle);
            }
            Ok(report) => {
                self.log.log(
                    "Sweep",
                    "Finished",
                    &format!("{} points acquired", report.points.len()),
                );
                self.set_state(SweepState::Idle);
            }
            Err(e) => {
                self.log.log("Sweep", "Failed", &e.to_string());
                self.set_state(SweepState::Failed);
            }
        }
        result
    }

    fn sweep(
        &self,
        params: &SweepParameters,
        cancel: &CancelToken,
        events: Option<&Sender<SweepEvent>>,
    ) -> SweepResult<SweepReport> {
        // everything that can be checked without the instrument, first
        self.settings.validate()?;
        let set = build(params)?;

        let mut device = self.device();
        if !device.is_open() {
            return Err(SweepError::DeviceUnavailable(
                "no device session is open".into(),
            ));
        }

        self.log.log(
            "Sweep",
            "Started",
            &format!(
                "{} points, pattern frequency {:.3} Hz",
                set.len(),
                set.frequency
            ),
        );
        if let Some(tx) = events {
            let _ = tx.send(SweepEvent::Started {
                points: set.len(),
                frequency: set.frequency,
            });
        }

        let mut ctl = Controller::new(&mut *device, &self.settings);
        let outcome = self.run_points(&mut ctl, &set, cancel, events);
        let reset = ctl.reset();
        if let Err(e) = &reset {
            self.log
                .log("AD2", "Reset", &format!("channel reset failed: {e}"));
        }
        let channels = [self.settings.drive_channel, self.settings.reference_channel];
        let release = close_session(&mut *device, &channels, self.log.as_ref());
        if let Err(e) = &release {
            self.log
                .log("AD2", "Connection", &format!("session release failed: {e}"));
        }

        let report = outcome?;
        reset?;
        release?;
        Ok(report)
    }

    fn run_points<T: Device + ?Sized>(
        &self,
        ctl: &mut Controller<'_, T>,
        set: &PatternSet,
        cancel: &CancelToken,
        events: Option<&Sender<SweepEvent>>,
    ) -> SweepResult<SweepReport> {
        let timing = Timing::from(&self.settings);
        let mut report = SweepReport {
            frequency: set.frequency,
            points: Vec::with_capacity(set.len()),
            cancelled: false,
        };

        for (index, pattern) in set.patterns.iter().enumerate() {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            self.set_state(SweepState::Running(index));
            let stamp = file_timestamp();

            let (capture, taint) = match ctl.run_one(index, pattern, set.frequency, &timing, cancel) {
                Ok(capture) => (capture, None),
                Err(SweepError::DataIntegrity {
                    point,
                    sample_rate,
                    lost,
                    corrupted,
                    capture,
                }) => {
                    self.log.log(
                        "AD2",
                        "Lost data",
                        &format!("point {point}: {lost} samples lost, {corrupted} corrupted"),
                    );
                    (*capture, Some((sample_rate, lost, corrupted)))
                }
                Err(SweepError::Cancelled) => {
                    report.cancelled = true;
                    break;
                }
                Err(e) => {
                    self.log.log("AD2", "Error", &format!("point {index}: {e}"));
                    return Err(e);
                }
            };

            self.set_state(SweepState::Finalizing(index));
            let record = PointRecord {
                index,
                dark_time_slots: pattern.dark_time_slots,
                samples: capture.len(),
                path: self.persist(index, &stamp, &capture),
                tainted: taint.is_some(),
            };
            if let Some(tx) = events {
                let _ = tx.send(SweepEvent::PointDone(record.clone()));
            }
            report.points.push(record);

            if let Some((sample_rate, lost, corrupted)) = taint {
                if self.settings.integrity_policy == IntegrityPolicy::Abort {
                    return Err(SweepError::DataIntegrity {
                        point: index,
                        sample_rate,
                        lost,
                        corrupted,
                        capture: Box::new(capture),
                    });
                }
            }

            let last = index + 1 == set.len();
            if !last && !cancel.wait(self.settings.quiescence()) {
                report.cancelled = true;
                break;
            }
        }
        Ok(report)
    }

    fn persist(&self, index: usize, stamp: &str, capture: &Capture) -> Option<PathBuf> {
        let name = record_name(index, stamp);
        match self.sink.store(&name, &capture.values()) {
            Ok(path) => {
                self.log.log(
                    "Sweep",
                    "Saved",
                    &format!("point {index}: {} samples to {}", capture.len(), path.display()),
                );
                Some(path)
            }
            Err(e) => {
                self.log
                    .log("Sweep", "Write failed", &format!("point {index}: {e}"));
                None
            }
        }
    }
}

/// A sweep running on its worker thread.
pub struct SweepHandle {
    cancel: CancelToken,
    state: Arc<Mutex<SweepState>>,
    events: Receiver<SweepEvent>,
    handle: JoinHandle<SweepResult<SweepReport>>,
}

impl SweepHandle {
    /// Ask the sweep to stop at the next point boundary or poll.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn state(&self) -> SweepState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn events(&self) -> &Receiver<SweepEvent> {
        &self.events
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn join(self) -> SweepResult<SweepReport> {
        self.handle
            .join()
            .map_err(|_| SweepError::WorkerPanicked)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ChannelLog, LogEntry, RecordStatus, SimulatedDevice};
    use std::sync::atomic::AtomicUsize;

    /// Keeps records in memory; fails for the indices listed in `fail`.
    #[derive(Default)]
    struct MemorySink {
        stored: Mutex<Vec<(String, Vec<f64>)>>,
        fail: Vec<usize>,
        calls: AtomicUsize,
    }

    impl SampleSink for MemorySink {
        fn store(&self, name: &str, samples: &[f64]) -> std::io::Result<PathBuf> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.contains(&call) {
                return Err(std::io::Error::other("disk full"));
            }
            self.stored
                .lock()
                .unwrap()
                .push((name.to_owned(), samples.to_vec()));
            Ok(PathBuf::from(format!("{name}.csv")))
        }
    }

    fn settings(policy: IntegrityPolicy) -> AcquisitionSettings {
        AcquisitionSettings {
            run_time: 0.001,
            wait_time: 0.0,
            amplitude: 5.0,
            sample_frequency: 20_000.0,
            settle_time: 0.0,
            drive_channel: 0,
            reference_channel: 1,
            input_channel: 0,
            integrity_policy: policy,
        }
    }

    fn two_points() -> SweepParameters {
        // 2 slots of dark time at most: points at 1 and 2 slots
        SweepParameters {
            pulse_width: 5.0,
            max_dark_time_ms: 0.002,
            point_count: 2,
        }
    }

    fn runner(
        dev: SimulatedDevice,
        settings: AcquisitionSettings,
        sink: Arc<MemorySink>,
    ) -> (SweepRunner<SimulatedDevice>, Receiver<LogEntry>) {
        let (log, rx) = ChannelLog::new();
        let runner = SweepRunner::new(dev, settings, Arc::new(log), sink);
        (runner, rx)
    }

    fn statuses(rx: &Receiver<LogEntry>) -> Vec<String> {
        rx.try_iter().map(|e| e.status).collect()
    }

    #[test]
    fn requires_open_session() {
        let sink = Arc::new(MemorySink::default());
        let (runner, _rx) = runner(SimulatedDevice::new(), settings(IntegrityPolicy::Abort), sink);
        let err = runner.run(&two_points(), &CancelToken::new()).unwrap_err();
        assert!(matches!(err, SweepError::DeviceUnavailable(_)));
        assert_eq!(runner.state(), SweepState::Failed);
        assert!(runner.device().calls().is_empty());
    }

    #[test]
    fn configuration_checked_before_hardware() {
        let sink = Arc::new(MemorySink::default());
        let (runner, _rx) = runner(SimulatedDevice::new(), settings(IntegrityPolicy::Abort), sink);
        runner.open().unwrap();
        let calls_after_open = runner.device().calls().len();

        let params = SweepParameters {
            max_dark_time_ms: 5.0,
            ..two_points()
        };
        let err = runner.run(&params, &CancelToken::new()).unwrap_err();
        assert!(matches!(err, SweepError::Configuration(_)));
        assert_eq!(runner.device().calls().len(), calls_after_open);
        assert!(!runner.is_running());
    }

    #[test]
    fn stores_every_point_and_resets() {
        let sink = Arc::new(MemorySink::default());
        let (runner, rx) = runner(
            SimulatedDevice::new(),
            settings(IntegrityPolicy::Abort),
            Arc::clone(&sink),
        );
        runner.open().unwrap();
        let report = runner.run(&two_points(), &CancelToken::new()).unwrap();

        assert!(!report.cancelled);
        assert_eq!(report.points.len(), 2);
        assert_eq!(report.points[1].dark_time_slots, 2);
        let stored = sink.stored.lock().unwrap();
        assert_eq!(stored.len(), 2);
        assert!(stored[0].0.starts_with("data_point_0_"));
        assert!(stored[1].0.starts_with("data_point_1_"));
        assert!(stored.iter().all(|(_, s)| s.len() == 20));

        assert_eq!(runner.state(), SweepState::Idle);
        let dev = runner.device();
        assert!(!dev.output(0).running);
        assert!(!dev.output(1).running);
        assert_eq!(dev.starts(), 2);
        assert!(!dev.is_open());
        assert_eq!(dev.calls().iter().filter(|c| **c == "close").count(), 1);
        drop(dev);
        let entries: Vec<LogEntry> = rx.try_iter().collect();
        let released = entries.iter().position(|e| e.message == "Disconnected");
        let finished = entries.iter().position(|e| e.status == "Finished");
        assert!(released.is_some());
        assert!(released < finished);
    }

    #[test]
    fn tainted_point_aborts_by_default() {
        let dev = SimulatedDevice::new().with_script(vec![RecordStatus::new(10, 3, 0)]);
        let sink = Arc::new(MemorySink::default());
        let (runner, rx) = runner(dev, settings(IntegrityPolicy::Abort), Arc::clone(&sink));
        runner.open().unwrap();

        let err = runner.run(&two_points(), &CancelToken::new()).unwrap_err();
        match err {
            SweepError::DataIntegrity {
                point,
                lost,
                capture,
                ..
            } => {
                assert_eq!(point, 0);
                assert_eq!(lost, 3);
                assert_eq!(capture.copied, 10);
            }
            other => panic!("expected DataIntegrity, got {other:?}"),
        }
        // the tainted capture is still written, and nothing after it
        assert_eq!(sink.stored.lock().unwrap().len(), 1);
        assert_eq!(runner.state(), SweepState::Failed);
        assert!(!runner.device().output(0).running);
        assert!(!runner.device().is_open());
        let statuses = statuses(&rx);
        assert!(statuses.contains(&"Lost data".to_string()));
        assert!(statuses.contains(&"Failed".to_string()));
    }

    #[test]
    fn tainted_point_can_continue() {
        let dev = SimulatedDevice::new().with_script(vec![RecordStatus::new(10, 3, 0)]);
        let sink = Arc::new(MemorySink::default());
        let (runner, _rx) = runner(dev, settings(IntegrityPolicy::Continue), Arc::clone(&sink));
        runner.open().unwrap();

        let report = runner.run(&two_points(), &CancelToken::new()).unwrap();
        assert_eq!(report.points.len(), 2);
        assert!(report.points[0].tainted);
        assert_eq!(report.points[0].samples, 13);
        assert!(!report.points[1].tainted);
        assert_eq!(sink.stored.lock().unwrap().len(), 2);
    }

    #[test]
    fn write_failure_does_not_block_next_point() {
        let sink = Arc::new(MemorySink {
            fail: vec![0],
            ..Default::default()
        });
        let (runner, rx) = runner(
            SimulatedDevice::new(),
            settings(IntegrityPolicy::Abort),
            Arc::clone(&sink),
        );
        runner.open().unwrap();

        let report = runner.run(&two_points(), &CancelToken::new()).unwrap();
        assert_eq!(report.points[0].path, None);
        assert_eq!(report.points[0].samples, 20);
        assert!(report.points[1].path.is_some());
        assert!(statuses(&rx).contains(&"Write failed".to_string()));
    }

    #[test]
    fn cancelled_before_first_point() {
        let sink = Arc::new(MemorySink::default());
        let (runner, _rx) = runner(
            SimulatedDevice::new(),
            settings(IntegrityPolicy::Abort),
            Arc::clone(&sink),
        );
        runner.open().unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();

        let report = runner.run(&two_points(), &cancel).unwrap();
        assert!(report.cancelled);
        assert!(report.points.is_empty());
        let dev = runner.device();
        assert_eq!(dev.starts(), 0);
        assert!(dev.calls().contains(&"out_reset"));
        assert!(!dev.is_open());
    }

    #[test]
    fn next_sweep_needs_a_new_session() {
        let sink = Arc::new(MemorySink::default());
        let (runner, _rx) = runner(
            SimulatedDevice::new(),
            settings(IntegrityPolicy::Abort),
            Arc::clone(&sink),
        );
        runner.open().unwrap();
        runner.run(&two_points(), &CancelToken::new()).unwrap();

        let err = runner.run(&two_points(), &CancelToken::new()).unwrap_err();
        assert!(matches!(err, SweepError::DeviceUnavailable(_)));

        runner.open().unwrap();
        let report = runner.run(&two_points(), &CancelToken::new()).unwrap();
        assert_eq!(report.points.len(), 2);
        assert_eq!(sink.stored.lock().unwrap().len(), 4);
    }

    #[test]
    fn rejects_concurrent_sweep() {
        let mut slow = settings(IntegrityPolicy::Abort);
        slow.settle_time = 0.3;
        let sink = Arc::new(MemorySink::default());
        let (runner, rx) = runner(SimulatedDevice::new(), slow, Arc::clone(&sink));
        runner.open().unwrap();
        let runner = Arc::new(runner);

        let handle = runner.spawn(two_points()).unwrap();
        assert!(runner.is_running());
        assert!(matches!(
            runner.run(&two_points(), &CancelToken::new()),
            Err(SweepError::Busy)
        ));
        assert!(matches!(runner.spawn(two_points()), Err(SweepError::Busy)));

        let report = handle.join().unwrap();
        assert_eq!(report.points.len(), 2);
        assert!(!runner.is_running());
        let statuses = statuses(&rx);
        assert_eq!(statuses.iter().filter(|s| *s == "Rejected").count(), 2);
        // rejected requests never reach the instrument
        assert_eq!(runner.device().starts(), 2);
    }

    #[test]
    fn worker_reports_progress_and_cancels() {
        let mut slow = settings(IntegrityPolicy::Abort);
        slow.wait_time = 5.0;
        let sink = Arc::new(MemorySink::default());
        let (runner, _rx) = runner(SimulatedDevice::new(), slow, Arc::clone(&sink));
        runner.open().unwrap();
        let runner = Arc::new(runner);

        let handle = runner.spawn(two_points()).unwrap();
        match handle.events().recv().unwrap() {
            SweepEvent::Started { points, .. } => assert_eq!(points, 2),
            other => panic!("unexpected event {other:?}"),
        }
        match handle.events().recv().unwrap() {
            SweepEvent::PointDone(record) => assert_eq!(record.index, 0),
            other => panic!("unexpected event {other:?}"),
        }
        // the worker is now in the quiescence wait before point 1
        handle.cancel();
        let report = handle.join().unwrap();
        assert!(report.cancelled);
        assert_eq!(report.points.len(), 1);
        assert_eq!(runner.state(), SweepState::Idle);
        assert!(!runner.device().output(0).running);
    }

    #[test]
    fn cancel_during_capture_still_releases() {
        let dev = SimulatedDevice::new().with_prefill_polls(usize::MAX);
        let sink = Arc::new(MemorySink::default());
        let (runner, rx) = runner(dev, settings(IntegrityPolicy::Abort), Arc::clone(&sink));
        runner.open().unwrap();
        let runner = Arc::new(runner);

        let handle = runner.spawn(two_points()).unwrap();
        assert!(matches!(
            handle.events().recv().unwrap(),
            SweepEvent::Started { .. }
        ));
        thread::sleep(Duration::from_millis(10));
        handle.cancel();
        let report = handle.join().unwrap();

        assert!(report.cancelled);
        assert!(report.points.is_empty());
        assert!(sink.stored.lock().unwrap().is_empty());
        let dev = runner.device();
        assert_eq!(dev.starts(), 1);
        assert!(dev.calls().contains(&"out_reset"));
        assert!(!dev.output(0).running);
        assert!(!dev.is_open());
        drop(dev);
        assert!(statuses(&rx).contains(&"Cancelled".to_string()));
    }

    #[test]
    fn cancel_token_wait() {
        let token = CancelToken::new();
        assert!(token.wait(Duration::from_millis(1)));
        token.cancel();
        assert!(!token.wait(Duration::from_secs(10)));
    }
}
