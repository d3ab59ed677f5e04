use crate::{SweepError, SweepParameters};
use confique::Config;
use serde::Deserialize;
use std::{path::Path, time::Duration};

#[derive(Config, Debug, Clone)]
pub struct Conf {
    #[config(nested)]
    pub sweep: SweepSettings,
    #[config(nested)]
    pub acquisition: AcquisitionSettings,
    #[config(nested)]
    pub output: OutputSettings,
}

#[derive(Config, Debug, Clone)]
pub struct SweepSettings {
    /// Pulse width in µs
    #[config(default = 5.0)]
    pub pulse_width: f64,
    #[config(default = 1.0)]
    pub max_dark_time_ms: f64,
    #[config(default = 10)]
    pub point_count: usize,
}

#[derive(Config, Debug, Clone)]
pub struct AcquisitionSettings {
    /// Output run time per point, in seconds
    #[config(default = 2.0)]
    pub run_time: f64,
    /// Output wait time per point, in seconds
    #[config(default = 2.0)]
    pub wait_time: f64,
    /// Output amplitude and input range, in volts
    #[config(default = 5.0)]
    pub amplitude: f64,
    #[config(default = 5000000.0)]
    pub sample_frequency: f64,
    /// Time the armed input is left to let its offset settle, in seconds
    #[config(default = 2.0)]
    pub settle_time: f64,
    #[config(default = 0)]
    pub drive_channel: i32,
    #[config(default = 1)]
    pub reference_channel: i32,
    #[config(default = 0)]
    pub input_channel: i32,
    #[config(default = "abort")]
    pub integrity_policy: IntegrityPolicy,
}

#[derive(Config, Debug, Clone)]
pub struct OutputSettings {
    #[config(default = "./logs")]
    pub output_dir: String,
    #[config(default = "t1_sweep.log")]
    pub log_file: String,
}

/// What a sweep does after a point loses or corrupts samples. The tainted
/// capture is stored either way.
#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum IntegrityPolicy {
    #[default]
    Abort,
    Continue,
}

impl Conf {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, confique::Error> {
        Conf::builder().file(path.as_ref()).load()
    }

    pub fn sweep_parameters(&self) -> SweepParameters {
        SweepParameters {
            pulse_width: self.sweep.pulse_width,
            max_dark_time_ms: self.sweep.max_dark_time_ms,
            point_count: self.sweep.point_count,
        }
    }
}

impl AcquisitionSettings {
    pub fn validate(&self) -> Result<(), SweepError> {
        let positive = [
            ("sample frequency", self.sample_frequency),
            ("amplitude", self.amplitude),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(SweepError::Configuration(format!(
                    "{name} must be positive, got {value}"
                )));
            }
        }
        let non_negative = [
            ("run time", self.run_time),
            ("wait time", self.wait_time),
            ("settle time", self.settle_time),
        ];
        for (name, value) in non_negative {
            if !(value.is_finite() && value >= 0.0) {
                return Err(SweepError::Configuration(format!(
                    "{name} must not be negative, got {value}"
                )));
            }
        }
        if self.drive_channel == self.reference_channel {
            return Err(SweepError::Configuration(format!(
                "drive and reference share output channel {}",
                self.drive_channel
            )));
        }
        Ok(())
    }

    /// Input samples retained per point.
    pub fn sample_budget(&self) -> usize {
        (self.sample_frequency * self.run_time).round() as usize
    }

    pub fn settle(&self) -> Duration {
        Duration::try_from_secs_f64(self.settle_time).unwrap_or(Duration::ZERO)
    }

    /// Idle time between points: the full run plus wait of the outputs.
    pub fn quiescence(&self) -> Duration {
        Duration::try_from_secs_f64(self.run_time + self.wait_time).unwrap_or(Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn defaults_without_file() {
        let dir = tempfile::tempdir().unwrap();
        let conf = Conf::load(dir.path().join("missing.toml")).unwrap();
        assert_eq!(conf.sweep.point_count, 10);
        assert_eq!(conf.acquisition.sample_frequency, 5e6);
        assert_eq!(conf.acquisition.sample_budget(), 10_000_000);
        assert_eq!(conf.acquisition.integrity_policy, IntegrityPolicy::Abort);
        assert_eq!(conf.output.output_dir, "./logs");
    }

    #[test]
    fn file_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t1.toml");
        fs::write(
            &path,
            r#"
[sweep]
max_dark_time_ms = 0.5
point_count = 4

[acquisition]
run_time = 0.5
wait_time = 0.25
sample_frequency = 1000.0
integrity_policy = "continue"
"#,
        )
        .unwrap();

        let conf = Conf::load(&path).unwrap();
        let params = conf.sweep_parameters();
        assert_eq!(params.point_count, 4);
        assert_eq!(params.max_dark_time_ms, 0.5);
        assert_eq!(params.pulse_width, 5.0);
        assert_eq!(conf.acquisition.sample_budget(), 500);
        assert_eq!(conf.acquisition.quiescence(), Duration::from_millis(750));
        assert_eq!(conf.acquisition.integrity_policy, IntegrityPolicy::Continue);
    }

    #[test]
    fn validation() {
        let dir = tempfile::tempdir().unwrap();
        let conf = Conf::load(dir.path().join("none.toml")).unwrap();
        assert!(conf.acquisition.validate().is_ok());

        let mut bad = conf.acquisition.clone();
        bad.sample_frequency = 0.0;
        assert!(matches!(bad.validate(), Err(SweepError::Configuration(_))));

        let mut bad = conf.acquisition.clone();
        bad.wait_time = -1.0;
        assert!(bad.validate().is_err());

        let mut bad = conf.acquisition;
        bad.reference_channel = bad.drive_channel;
        assert!(bad.validate().is_err());
    }
}
