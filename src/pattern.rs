use crate::{gen_log_space, SweepError};
use ndarray::{s, Array1};

/// Slots in one cycle of the custom output waveform.
pub const PATTERN_SIZE: usize = 4096;
/// Width of every pulse, in slots. The requested pulse width in µs maps onto
/// this many slots, which fixes the time per slot.
pub const PULSE_WIDTH_SLOTS: usize = 5;
pub const MIN_DARK_TIME_SLOTS: u32 = 1;
/// Upper bound on the dark time so the readout pulse stays inside the buffer.
pub const MAX_DARK_TIME_SLOTS: u32 = 2000;

/// Physical parameters of one T1 sweep.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SweepParameters {
    /// Pulse width in µs.
    pub pulse_width: f64,
    pub max_dark_time_ms: f64,
    pub point_count: usize,
}

/// One cycle of the drive waveform for a single dark time.
#[derive(Debug, Clone, PartialEq)]
pub struct PulsePattern {
    pub dark_time_slots: u32,
    pub samples: Array1<f64>,
}

impl PulsePattern {
    /// Cancellation pulse at 0, initialization at the half-way point, readout
    /// one pulse width plus `dark_time_slots` after the initialization pulse.
    pub fn new(dark_time_slots: u32) -> Result<Self, SweepError> {
        let init = PATTERN_SIZE / 2;
        let readout = init + PULSE_WIDTH_SLOTS + dark_time_slots as usize;
        if readout + PULSE_WIDTH_SLOTS > PATTERN_SIZE {
            return Err(SweepError::Configuration(format!(
                "readout pulse at slot {readout} overruns the {PATTERN_SIZE}-slot pattern"
            )));
        }

        let mut samples = Array1::<f64>::zeros(PATTERN_SIZE);
        for start in [0, init, readout] {
            samples
                .slice_mut(s![start..start + PULSE_WIDTH_SLOTS])
                .fill(1.0);
        }
        Ok(Self {
            dark_time_slots,
            samples,
        })
    }

    pub fn readout_offset(&self) -> usize {
        PATTERN_SIZE / 2 + PULSE_WIDTH_SLOTS + self.dark_time_slots as usize
    }

    /// Start offsets of each contiguous high region.
    pub fn pulse_starts(&self) -> Vec<usize> {
        let mut starts = Vec::new();
        let mut prev = 0.0;
        for (i, &v) in self.samples.iter().enumerate() {
            if v > 0.0 && prev == 0.0 {
                starts.push(i);
            }
            prev = v;
        }
        starts
    }
}

/// Patterns for every sweep point plus the timing they share.
#[derive(Debug, Clone)]
pub struct PatternSet {
    pub patterns: Vec<PulsePattern>,
    /// Repetition frequency of a whole pattern, in Hz.
    pub frequency: f64,
    pub slot_seconds: f64,
}

impl PatternSet {
    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn dark_times_seconds(&self) -> Vec<f64> {
        self.patterns
            .iter()
            .map(|p| f64::from(p.dark_time_slots) * self.slot_seconds)
            .collect()
    }
}

impl SweepParameters {
    fn validate(&self) -> Result<(), SweepError> {
        if !(self.pulse_width.is_finite() && self.pulse_width > 0.0) {
            return Err(SweepError::Configuration(format!(
                "pulse width must be positive, got {} us",
                self.pulse_width
            )));
        }
        if !(self.max_dark_time_ms.is_finite() && self.max_dark_time_ms >= 0.0) {
            return Err(SweepError::Configuration(format!(
                "maximum dark time must be positive, got {} ms",
                self.max_dark_time_ms
            )));
        }
        if self.point_count == 0 {
            return Err(SweepError::Configuration(
                "at least one sweep point is required".into(),
            ));
        }
        Ok(())
    }

    /// Duration of one pattern slot, in seconds.
    pub fn slot_seconds(&self) -> f64 {
        1e-6 * self.pulse_width / PULSE_WIDTH_SLOTS as f64
    }

    /// Maximum dark time expressed in slots, rounded to the nearest slot.
    ///
    /// Rounding rather than truncating keeps values like 999.9999 from
    /// float division at 1000; a sub-slot request of half a slot or more
    /// counts as one slot.
    pub fn max_dark_time_slots(&self) -> f64 {
        (self.max_dark_time_ms * 1e-3 / self.slot_seconds()).round()
    }
}

/// Build the drive pattern for every dark time of the sweep.
pub fn build(params: &SweepParameters) -> Result<PatternSet, SweepError> {
    params.validate()?;

    let slot_seconds = params.slot_seconds();
    let frequency = 1.0 / (slot_seconds * PATTERN_SIZE as f64);
    let max_slots = params.max_dark_time_slots();
    if max_slots < f64::from(MIN_DARK_TIME_SLOTS) || max_slots > f64::from(MAX_DARK_TIME_SLOTS) {
        return Err(SweepError::Configuration(format!(
            "maximum dark time of {} ms is {max_slots} slots, outside {MIN_DARK_TIME_SLOTS}..={MAX_DARK_TIME_SLOTS}",
            params.max_dark_time_ms
        )));
    }

    let dark_times = gen_log_space(MIN_DARK_TIME_SLOTS, max_slots as u32, params.point_count);
    if dark_times.len() < params.point_count {
        log::warn!(
            "requested {} points, dark-time range only holds {}",
            params.point_count,
            dark_times.len()
        );
    }

    let patterns = dark_times
        .into_iter()
        .map(PulsePattern::new)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(PatternSet {
        patterns,
        frequency,
        slot_seconds,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(max_dark_time_ms: f64, point_count: usize) -> SweepParameters {
        SweepParameters {
            pulse_width: 5.0,
            max_dark_time_ms,
            point_count,
        }
    }

    #[test]
    fn three_pulses_per_pattern() {
        let set = build(&params(1.0, 10)).unwrap();
        assert_eq!(set.len(), 10);
        for pattern in &set.patterns {
            assert_eq!(pattern.samples.len(), PATTERN_SIZE);
            assert!(pattern.readout_offset() < PATTERN_SIZE);
            assert_eq!(
                pattern.pulse_starts(),
                vec![0, PATTERN_SIZE / 2, pattern.readout_offset()]
            );
            let high = pattern.samples.iter().filter(|&&v| v == 1.0).count();
            assert_eq!(high, 3 * PULSE_WIDTH_SLOTS);
            assert!(pattern.samples.iter().all(|&v| v == 0.0 || v == 1.0));
        }
    }

    #[test]
    fn pattern_frequency_follows_pulse_width() {
        let set = build(&params(1.0, 4)).unwrap();
        assert!((set.slot_seconds - 1e-6).abs() < 1e-15);
        assert!((set.frequency - 1.0 / 4.096e-3).abs() < 1e-6);

        let wide = build(&SweepParameters {
            pulse_width: 10.0,
            ..params(1.0, 4)
        })
        .unwrap();
        assert!((wide.frequency * 2.0 - set.frequency).abs() < 1e-6);
    }

    #[test]
    fn dark_times_increase() {
        let set = build(&params(1.0, 10)).unwrap();
        let slots: Vec<u32> = set.patterns.iter().map(|p| p.dark_time_slots).collect();
        assert_eq!(slots[0], 1);
        assert_eq!(*slots.last().unwrap(), 1000);
        let secs = set.dark_times_seconds();
        assert!((secs[9] - 1e-3).abs() < 1e-12);
    }

    #[test]
    fn dark_time_bounds() {
        // 1 us per slot with a 5 us pulse width
        assert_eq!(build(&params(0.001, 5)).unwrap().len(), 1);
        let longest = build(&params(2.0, 5)).unwrap();
        assert_eq!(longest.patterns.last().unwrap().dark_time_slots, 2000);

        for bad in [0.0, 2.001] {
            assert!(matches!(
                build(&params(bad, 5)),
                Err(SweepError::Configuration(_))
            ));
        }
    }

    #[test]
    fn dark_time_rounds_to_nearest_slot() {
        assert_eq!(params(0.001, 5).max_dark_time_slots(), 1.0);
        assert_eq!(params(1.0, 5).max_dark_time_slots(), 1000.0);
        assert_eq!(params(0.0006, 5).max_dark_time_slots(), 1.0);
        assert_eq!(build(&params(0.0006, 5)).unwrap().len(), 1);
        assert_eq!(params(0.0004, 5).max_dark_time_slots(), 0.0);
        assert!(build(&params(0.0004, 5)).is_err());
    }

    #[test]
    fn rejects_invalid_parameters() {
        assert!(build(&params(1.0, 0)).is_err());
        assert!(build(&SweepParameters {
            pulse_width: 0.0,
            ..params(1.0, 3)
        })
        .is_err());
        assert!(build(&params(f64::NAN, 3)).is_err());
    }

    #[test]
    fn pattern_rejects_overrun() {
        let last_fit = (PATTERN_SIZE / 2 - 2 * PULSE_WIDTH_SLOTS) as u32;
        assert!(PulsePattern::new(last_fit).is_ok());
        assert!(PulsePattern::new(last_fit + 1).is_err());
    }
}
