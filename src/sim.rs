use crate::{AcqState, AcquisitionMode, Device, DeviceError, OutFunction, RecordStatus};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::collections::VecDeque;

const N_OUTPUTS: usize = 3;

/// Analog-output channel as last programmed.
#[derive(Debug, Clone, Default)]
pub struct OutputState {
    pub enabled: bool,
    pub function: Option<OutFunction>,
    pub data: Vec<f64>,
    pub frequency: f64,
    pub amplitude: f64,
    pub run: f64,
    pub wait: f64,
    pub repeat: i32,
    pub running: bool,
}

#[derive(Debug, Clone, Default)]
pub struct InputState {
    pub enabled: bool,
    pub range: f64,
    pub mode: Option<AcquisitionMode>,
    pub frequency: f64,
    pub record_length: f64,
    pub armed: bool,
    pub running: bool,
}

/// Software stand-in for the generator/scope pair.
///
/// In its default mode the input plays back the custom waveform loaded on
/// the output channels, sampled at the input frequency, and streams
/// `sample_frequency * record_length` samples in chunks. A script of
/// record statuses can replace the generated stream to exercise loss,
/// corruption and overflow handling.
pub struct SimulatedDevice {
    present: bool,
    open: bool,
    auto_configure: bool,
    outputs: [OutputState; N_OUTPUTS],
    input: InputState,
    prefill_polls: usize,
    polls_left: usize,
    chunk: usize,
    script: Option<VecDeque<RecordStatus>>,
    total: usize,
    produced: usize,
    pending: usize,
    cursor: usize,
    noise: f64,
    rng: StdRng,
    starts: usize,
    calls: Vec<&'static str>,
}

impl Default for SimulatedDevice {
    fn default() -> Self {
        Self {
            present: true,
            open: false,
            auto_configure: true,
            outputs: Default::default(),
            input: InputState::default(),
            prefill_polls: 2,
            polls_left: 0,
            chunk: 4096,
            script: None,
            total: 0,
            produced: 0,
            pending: 0,
            cursor: 0,
            noise: 0.0,
            rng: StdRng::seed_from_u64(0),
            starts: 0,
            calls: Vec::new(),
        }
    }
}

impl SimulatedDevice {
    pub fn new() -> Self {
        Default::default()
    }

    /// A device that fails to open, as if nothing were plugged in.
    pub fn absent(mut self) -> Self {
        self.present = false;
        self
    }

    /// Number of status polls reporting a pre-acquisition state after each start.
    pub fn with_prefill_polls(mut self, polls: usize) -> Self {
        self.prefill_polls = polls;
        self
    }

    /// Largest number of samples reported available per poll.
    pub fn with_chunk(mut self, chunk: usize) -> Self {
        self.chunk = chunk.max(1);
        self
    }

    /// Replay these statuses, one per poll, then report end of stream.
    pub fn with_script(mut self, statuses: Vec<RecordStatus>) -> Self {
        self.script = Some(statuses.into());
        self
    }

    /// Add uniform noise of +/- `amplitude` volts from a seeded generator.
    pub fn with_noise(mut self, amplitude: f64, seed: u64) -> Self {
        self.noise = amplitude.abs();
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn output(&self, channel: i32) -> &OutputState {
        &self.outputs[channel as usize]
    }

    pub fn input(&self) -> &InputState {
        &self.input
    }

    pub fn auto_configure(&self) -> bool {
        self.auto_configure
    }

    /// Number of acquisitions started since the device was created.
    pub fn starts(&self) -> usize {
        self.starts
    }

    /// Names of every hardware call issued, in order.
    pub fn calls(&self) -> &[&'static str] {
        &self.calls
    }

    fn check(&mut self, call: &'static str) -> Result<(), DeviceError> {
        self.calls.push(call);
        if self.open {
            Ok(())
        } else {
            Err(DeviceError::NotOpen)
        }
    }

    fn out_mut(
        &mut self,
        call: &'static str,
        channel: i32,
    ) -> Result<&mut OutputState, DeviceError> {
        self.check(call)?;
        usize::try_from(channel)
            .ok()
            .and_then(|ch| self.outputs.get_mut(ch))
            .ok_or(DeviceError::Call {
                call,
                message: format!("invalid channel {channel}"),
            })
    }

    fn sample(&mut self, index: usize) -> f64 {
        let t = index as f64 / self.input.frequency.max(f64::MIN_POSITIVE);
        let value = self
            .outputs
            .iter()
            .find(|out| out.running && out.function == Some(OutFunction::Custom) && !out.data.is_empty())
            .map(|out| {
                let phase = (t * out.frequency).fract();
                let slot = ((phase * out.data.len() as f64) as usize).min(out.data.len() - 1);
                out.data[slot] * out.amplitude
            })
            .unwrap_or(0.0);
        if self.noise > 0.0 {
            value + self.rng.random_range(-self.noise..self.noise)
        } else {
            value
        }
    }
}

impl Device for SimulatedDevice {
    fn open(&mut self) -> Result<(), DeviceError> {
        self.calls.push("open");
        if !self.present {
            return Err(DeviceError::NotFound("Device is not connected".into()));
        }
        self.open = true;
        Ok(())
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        self.calls.push("close");
        self.open = false;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn version(&self) -> String {
        "simulated".into()
    }

    fn last_error(&self) -> String {
        if self.present {
            String::new()
        } else {
            "Device is not connected".into()
        }
    }

    fn set_auto_configure(&mut self, enable: bool) -> Result<(), DeviceError> {
        self.check("set_auto_configure")?;
        self.auto_configure = enable;
        Ok(())
    }

    fn out_enable(&mut self, channel: i32, enable: bool) -> Result<(), DeviceError> {
        self.out_mut("out_enable", channel)?.enabled = enable;
        Ok(())
    }

    fn out_function(&mut self, channel: i32, function: OutFunction) -> Result<(), DeviceError> {
        self.out_mut("out_function", channel)?.function = Some(function);
        Ok(())
    }

    fn out_data(&mut self, channel: i32, data: &[f64]) -> Result<(), DeviceError> {
        self.out_mut("out_data", channel)?.data = data.to_vec();
        Ok(())
    }

    fn out_frequency(&mut self, channel: i32, hz: f64) -> Result<(), DeviceError> {
        self.out_mut("out_frequency", channel)?.frequency = hz;
        Ok(())
    }

    fn out_amplitude(&mut self, channel: i32, volts: f64) -> Result<(), DeviceError> {
        self.out_mut("out_amplitude", channel)?.amplitude = volts;
        Ok(())
    }

    fn out_run(&mut self, channel: i32, seconds: f64) -> Result<(), DeviceError> {
        self.out_mut("out_run", channel)?.run = seconds;
        Ok(())
    }

    fn out_wait(&mut self, channel: i32, seconds: f64) -> Result<(), DeviceError> {
        self.out_mut("out_wait", channel)?.wait = seconds;
        Ok(())
    }

    fn out_repeat(&mut self, channel: i32, count: i32) -> Result<(), DeviceError> {
        self.out_mut("out_repeat", channel)?.repeat = count;
        Ok(())
    }

    fn out_configure(&mut self, channel: i32, start: bool) -> Result<(), DeviceError> {
        self.out_mut("out_configure", channel)?.running = start;
        Ok(())
    }

    fn out_reset(&mut self, channel: i32) -> Result<(), DeviceError> {
        *self.out_mut("out_reset", channel)? = OutputState::default();
        Ok(())
    }

    fn in_channel_enable(&mut self, _channel: i32, enable: bool) -> Result<(), DeviceError> {
        self.check("in_channel_enable")?;
        self.input.enabled = enable;
        Ok(())
    }

    fn in_channel_range(&mut self, _channel: i32, volts: f64) -> Result<(), DeviceError> {
        self.check("in_channel_range")?;
        self.input.range = volts;
        Ok(())
    }

    fn in_acquisition_mode(&mut self, mode: AcquisitionMode) -> Result<(), DeviceError> {
        self.check("in_acquisition_mode")?;
        self.input.mode = Some(mode);
        Ok(())
    }

    fn in_frequency(&mut self, hz: f64) -> Result<(), DeviceError> {
        self.check("in_frequency")?;
        self.input.frequency = hz;
        Ok(())
    }

    fn in_record_length(&mut self, seconds: f64) -> Result<(), DeviceError> {
        self.check("in_record_length")?;
        self.input.record_length = seconds;
        Ok(())
    }

    fn in_configure(&mut self, reconfigure: bool, start: bool) -> Result<(), DeviceError> {
        self.check("in_configure")?;
        if start {
            self.input.armed = false;
            self.input.running = true;
            self.polls_left = self.prefill_polls;
            self.total = (self.input.frequency * self.input.record_length).round() as usize;
            self.produced = 0;
            self.pending = 0;
            self.cursor = 0;
            self.starts += 1;
        } else if reconfigure {
            self.input.armed = true;
        }
        Ok(())
    }

    fn in_reset(&mut self) -> Result<(), DeviceError> {
        self.check("in_reset")?;
        self.input = InputState::default();
        self.pending = 0;
        Ok(())
    }

    fn in_status(&mut self, _read_data: bool) -> Result<AcqState, DeviceError> {
        self.check("in_status")?;
        if !self.input.running {
            return Ok(if self.input.armed {
                AcqState::Armed
            } else {
                AcqState::Ready
            });
        }
        if self.polls_left > 0 {
            self.polls_left -= 1;
            return Ok(if self.polls_left % 2 == 0 {
                AcqState::Armed
            } else {
                AcqState::Prefilling
            });
        }
        let exhausted = match &self.script {
            Some(script) => script.is_empty(),
            None => self.produced >= self.total,
        };
        Ok(if exhausted {
            AcqState::Done
        } else {
            AcqState::Running
        })
    }

    fn in_status_record(&mut self) -> Result<RecordStatus, DeviceError> {
        self.check("in_status_record")?;
        let status = match self.script.as_mut() {
            Some(script) => script.pop_front().unwrap_or_default(),
            None => {
                let remaining = self.total.saturating_sub(self.produced);
                RecordStatus::new(remaining.min(self.chunk), 0, 0)
            }
        };
        self.produced += status.available + status.lost;
        self.cursor += status.lost;
        self.pending = status.available;
        Ok(status)
    }

    fn in_status_data(&mut self, _channel: i32, dest: &mut [f64]) -> Result<(), DeviceError> {
        self.check("in_status_data")?;
        if dest.len() > self.pending {
            return Err(DeviceError::Call {
                call: "in_status_data",
                message: format!("{} samples requested, {} available", dest.len(), self.pending),
            });
        }
        let start = self.cursor;
        for (k, slot) in dest.iter_mut().enumerate() {
            *slot = self.sample(start + k);
        }
        // samples left over from a truncated read are dropped by the device
        self.cursor += self.pending;
        self.pending = 0;
        Ok(())
    }
}
