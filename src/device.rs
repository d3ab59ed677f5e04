//! Hardware session boundary for a two-channel waveform generator paired with
//! an oscilloscope input, modelled on the WaveForms (`FDwf*`) call set.
//!
//! Every call is a blocking round-trip to the instrument and returns a
//! `Result`, the same way the digitizer wrapper turns library return codes
//! into Rust errors.

use crate::{DeviceError, LogSink, SweepError};

/// Waveform function of an analog-output carrier node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutFunction {
    Pulse,
    Custom,
}

/// Acquisition mode of the analog input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionMode {
    /// Continuous record: samples stream into the host until the record
    /// length elapses.
    Record,
}

/// Instrument state as reported by the input status query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcqState {
    Ready,
    Configuring,
    Prefilling,
    Armed,
    Waiting,
    Running,
    Done,
}

impl AcqState {
    /// True while the acquisition has been started but no samples flow yet.
    pub fn is_pre_acquisition(self) -> bool {
        matches!(self, Self::Configuring | Self::Prefilling | Self::Armed)
    }
}

/// Streaming counters returned by a record-mode status query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordStatus {
    pub available: usize,
    pub lost: usize,
    pub corrupted: usize,
}

impl RecordStatus {
    pub fn new(available: usize, lost: usize, corrupted: usize) -> Self {
        Self {
            available,
            lost,
            corrupted,
        }
    }
}

pub trait Device: Send {
    fn open(&mut self) -> Result<(), DeviceError>;
    fn close(&mut self) -> Result<(), DeviceError>;
    fn is_open(&self) -> bool;
    fn version(&self) -> String;
    /// Message describing the most recent failure reported by the device library.
    fn last_error(&self) -> String;
    fn set_auto_configure(&mut self, enable: bool) -> Result<(), DeviceError>;

    fn out_enable(&mut self, channel: i32, enable: bool) -> Result<(), DeviceError>;
    fn out_function(&mut self, channel: i32, function: OutFunction) -> Result<(), DeviceError>;
    fn out_data(&mut self, channel: i32, data: &[f64]) -> Result<(), DeviceError>;
    fn out_frequency(&mut self, channel: i32, hz: f64) -> Result<(), DeviceError>;
    fn out_amplitude(&mut self, channel: i32, volts: f64) -> Result<(), DeviceError>;
    fn out_run(&mut self, channel: i32, seconds: f64) -> Result<(), DeviceError>;
    fn out_wait(&mut self, channel: i32, seconds: f64) -> Result<(), DeviceError>;
    fn out_repeat(&mut self, channel: i32, count: i32) -> Result<(), DeviceError>;
    fn out_configure(&mut self, channel: i32, start: bool) -> Result<(), DeviceError>;
    fn out_reset(&mut self, channel: i32) -> Result<(), DeviceError>;

    fn in_channel_enable(&mut self, channel: i32, enable: bool) -> Result<(), DeviceError>;
    fn in_channel_range(&mut self, channel: i32, volts: f64) -> Result<(), DeviceError>;
    fn in_acquisition_mode(&mut self, mode: AcquisitionMode) -> Result<(), DeviceError>;
    fn in_frequency(&mut self, hz: f64) -> Result<(), DeviceError>;
    fn in_record_length(&mut self, seconds: f64) -> Result<(), DeviceError>;
    /// `reconfigure` resets the trigger timeout; `start` begins the acquisition.
    fn in_configure(&mut self, reconfigure: bool, start: bool) -> Result<(), DeviceError>;
    fn in_reset(&mut self) -> Result<(), DeviceError>;
    fn in_status(&mut self, read_data: bool) -> Result<AcqState, DeviceError>;
    fn in_status_record(&mut self) -> Result<RecordStatus, DeviceError>;
    /// Copy `dest.len()` of the available samples of `channel` into `dest`.
    fn in_status_data(&mut self, channel: i32, dest: &mut [f64]) -> Result<(), DeviceError>;
}

/// Open the first available device and disable auto-configure.
pub fn open_session<D: Device + ?Sized>(device: &mut D, log: &dyn LogSink) -> Result<(), SweepError> {
    if let Err(e) = device.open() {
        let reason = device.last_error();
        log.log("AD2", "Connection", &reason);
        return Err(match e {
            DeviceError::Call { .. } => SweepError::DeviceUnavailable(reason),
            other => other.into(),
        });
    }
    // each setter is applied on its own call instead of on the next configure
    device.set_auto_configure(false)?;
    log.log(
        "AD2",
        "Connection",
        &format!("Connected to AD2, DWF Version {}", device.version()),
    );
    Ok(())
}

/// Reset every output and the input, then close the session.
pub fn close_session<D: Device + ?Sized>(
    device: &mut D,
    channels: &[i32],
    log: &dyn LogSink,
) -> Result<(), SweepError> {
    if !device.is_open() {
        return Ok(());
    }
    for &channel in channels {
        device.out_reset(channel)?;
    }
    device.in_reset()?;
    device.close()?;
    log.log("AD2", "Connection", "Disconnected");
    Ok(())
}
