//! Per-point acquisition: programs the drive and reference outputs and the
//! scope input, then drains the record-mode stream into a bounded buffer.

use crate::{
    utils::Counter, AcquisitionMode, AcquisitionSettings, CancelToken, Device, OutFunction,
    PulsePattern, RecordStatus, SweepError,
};
use ndarray::Array1;
use std::{
    borrow::Cow,
    thread,
    time::{Duration, Instant},
};

/// Samples streamed for one sweep point.
#[derive(Debug, Clone, PartialEq)]
pub struct Capture {
    /// Stream positions `0..samples_read`. Positions the device reported as
    /// lost stay at 0.0.
    pub samples: Array1<f64>,
    pub budget: usize,
    /// Samples actually copied from the device.
    pub copied: usize,
    pub lost: u64,
    pub corrupted: u64,
    pub sample_rate: f64,
}

impl Capture {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn is_tainted(&self) -> bool {
        self.lost > 0 || self.corrupted > 0
    }

    pub fn values(&self) -> Cow<'_, [f64]> {
        match self.samples.as_slice() {
            Some(values) => Cow::Borrowed(values),
            None => Cow::Owned(self.samples.to_vec()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamPhase {
    /// Started, but the device still reports configuring/prefilling/armed.
    AwaitingStart,
    Streaming,
    Done,
}

/// Bookkeeping of one running capture.
#[derive(Debug)]
struct AcquisitionSession {
    budget: usize,
    samples_read: usize,
    lost: u64,
    corrupted: u64,
}

impl AcquisitionSession {
    fn new(budget: usize) -> Self {
        Self {
            budget,
            samples_read: 0,
            lost: 0,
            corrupted: 0,
        }
    }

    /// Account for one status report and return how many of the available
    /// samples fit in the remaining budget.
    fn account(&mut self, status: &RecordStatus) -> usize {
        self.lost += status.lost as u64;
        self.corrupted += status.corrupted as u64;
        // the device position moves past lost samples too, but never past the budget
        self.samples_read = (self.samples_read + status.lost).min(self.budget);
        status.available.min(self.budget - self.samples_read)
    }

    fn is_full(&self) -> bool {
        self.samples_read >= self.budget
    }
}

/// Output run/wait times and levels shared by every point of a sweep.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Timing {
    pub run_time: f64,
    pub wait_time: f64,
    pub amplitude: f64,
}

impl From<&AcquisitionSettings> for Timing {
    fn from(settings: &AcquisitionSettings) -> Self {
        Self {
            run_time: settings.run_time,
            wait_time: settings.wait_time,
            amplitude: settings.amplitude,
        }
    }
}

/// Drives one capture at a time on an exclusively borrowed device.
pub struct Controller<'a, D: Device + ?Sized> {
    device: &'a mut D,
    drive: i32,
    reference: i32,
    input: i32,
    sample_frequency: f64,
    settle: Duration,
}

impl<'a, D: Device + ?Sized> Controller<'a, D> {
    pub fn new(device: &'a mut D, settings: &AcquisitionSettings) -> Self {
        Self {
            device,
            drive: settings.drive_channel,
            reference: settings.reference_channel,
            input: settings.input_channel,
            sample_frequency: settings.sample_frequency,
            settle: settings.settle(),
        }
    }

    pub fn sample_budget(&self, run_time: f64) -> usize {
        (self.sample_frequency * run_time).round() as usize
    }

    /// Program the outputs and input for `pattern`, run it, and stream the
    /// input into a buffer of `sample_frequency * run_time` samples.
    ///
    /// Loss or corruption is reported as [`SweepError::DataIntegrity`] once
    /// the stream has ended, carrying the capture.
    pub fn run_one(
        &mut self,
        point: usize,
        pattern: &PulsePattern,
        frequency: f64,
        timing: &Timing,
        cancel: &CancelToken,
    ) -> Result<Capture, SweepError> {
        if cancel.is_cancelled() {
            return Err(SweepError::Cancelled);
        }
        let budget = self.sample_budget(timing.run_time);

        self.configure_drive(pattern, frequency, timing)?;
        self.configure_reference(frequency, timing)?;
        self.configure_input(budget, timing.amplitude)?;

        // reset the trigger timeout without starting, then let the offset settle
        self.device.in_configure(true, false)?;
        thread::sleep(self.settle);

        self.device.out_configure(self.drive, true)?;
        self.device.out_configure(self.reference, true)?;
        self.device.in_configure(false, true)?;
        log::debug!(
            "point {point}: started, dark time {} slots, budget {budget} samples",
            pattern.dark_time_slots
        );

        let capture = self.stream(point, budget, cancel)?;
        if capture.is_tainted() {
            return Err(SweepError::DataIntegrity {
                point,
                sample_rate: self.sample_frequency,
                lost: capture.lost,
                corrupted: capture.corrupted,
                capture: Box::new(capture),
            });
        }
        Ok(capture)
    }

    /// Stop and reset both outputs and the input.
    pub fn reset(&mut self) -> Result<(), SweepError> {
        self.device.out_reset(self.drive)?;
        self.device.out_reset(self.reference)?;
        self.device.in_reset()?;
        Ok(())
    }

    fn configure_drive(
        &mut self,
        pattern: &PulsePattern,
        frequency: f64,
        timing: &Timing,
    ) -> Result<(), SweepError> {
        let ch = self.drive;
        let data = pattern.samples.to_vec();
        self.device.out_enable(ch, true)?;
        self.device.out_function(ch, OutFunction::Custom)?;
        self.device.out_data(ch, &data)?;
        self.device.out_frequency(ch, frequency)?;
        self.device.out_amplitude(ch, timing.amplitude)?;
        self.device.out_run(ch, timing.run_time)?;
        self.device.out_wait(ch, timing.wait_time)?;
        self.device.out_repeat(ch, 1)?;
        Ok(())
    }

    fn configure_reference(&mut self, frequency: f64, timing: &Timing) -> Result<(), SweepError> {
        let ch = self.reference;
        self.device.out_enable(ch, true)?;
        self.device.out_function(ch, OutFunction::Pulse)?;
        self.device.out_frequency(ch, frequency)?;
        self.device.out_amplitude(ch, timing.amplitude)?;
        self.device.out_run(ch, timing.run_time / frequency)?;
        self.device.out_wait(ch, timing.wait_time / frequency)?;
        Ok(())
    }

    fn configure_input(&mut self, budget: usize, amplitude: f64) -> Result<(), SweepError> {
        self.device.in_channel_enable(self.input, true)?;
        self.device.in_channel_range(self.input, amplitude)?;
        self.device.in_acquisition_mode(AcquisitionMode::Record)?;
        self.device.in_frequency(self.sample_frequency)?;
        self.device
            .in_record_length(budget as f64 / self.sample_frequency)?;
        Ok(())
    }

    /// Busy-poll the record stream until the budget is met or the device
    /// runs dry. No sleeping here: the device ring buffer overflows if it is
    /// not drained fast enough.
    fn stream(
        &mut self,
        point: usize,
        budget: usize,
        cancel: &CancelToken,
    ) -> Result<Capture, SweepError> {
        let mut session = AcquisitionSession::new(budget);
        let mut buffer = vec![0.0; budget];
        let mut copied = 0;
        let mut counter = Counter::new();
        let mut last_report = Instant::now();
        let mut phase = StreamPhase::AwaitingStart;

        while phase != StreamPhase::Done {
            if session.is_full() {
                phase = StreamPhase::Done;
                continue;
            }
            if cancel.is_cancelled() {
                return Err(SweepError::Cancelled);
            }

            let state = self.device.in_status(true)?;
            if phase == StreamPhase::AwaitingStart {
                if state.is_pre_acquisition() {
                    continue;
                }
                phase = StreamPhase::Streaming;
            }

            let status = self.device.in_status_record()?;
            let n = session.account(&status);
            if status.lost > 0 || status.corrupted > 0 {
                log::warn!(
                    "point {point}: {} samples lost, {} corrupted",
                    status.lost,
                    status.corrupted
                );
            }
            if status.available == 0 {
                phase = StreamPhase::Done;
                continue;
            }

            let start = session.samples_read;
            self.device
                .in_status_data(self.input, &mut buffer[start..start + n])?;
            session.samples_read += n;
            copied += n;
            counter.increment(n);

            if last_report.elapsed() >= Duration::from_secs(1) {
                log::debug!(
                    "point {point}: {} of {budget} ({:.0} samples/s)",
                    session.samples_read,
                    counter.rate()
                );
                last_report = Instant::now();
            }
        }

        buffer.truncate(session.samples_read);
        log::debug!(
            "point {point}: read {} of {budget} samples in {} reads ({:.0} samples/s)",
            session.samples_read,
            counter.n_reads,
            counter.average_rate()
        );
        Ok(Capture {
            samples: Array1::from(buffer),
            budget,
            copied,
            lost: session.lost,
            corrupted: session.corrupted,
            sample_rate: self.sample_frequency,
        })
    }
}
