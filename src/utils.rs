use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};
use time::{format_description::BorrowedFormatItem, macros::format_description, OffsetDateTime};

const FILE_STAMP: &[BorrowedFormatItem<'static>] =
    format_description!("[day]-[month]-[year]_[hour]-[minute]-[second]");
const CLOCK: &[BorrowedFormatItem<'static>] = format_description!("[hour]:[minute]:[second]");

fn now() -> OffsetDateTime {
    OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc())
}

/// Capture timestamp used in record names, `DD-MM-YYYY_HH-MM-SS`.
pub fn file_timestamp() -> String {
    now().format(FILE_STAMP).unwrap_or_default()
}

/// Wall-clock time of day, `HH:MM:SS`.
pub fn clock_time() -> String {
    now().format(CLOCK).unwrap_or_default()
}

/// Name under which the capture of sweep point `index` is stored.
pub fn record_name(index: usize, timestamp: &str) -> String {
    format!("data_point_{index}_{timestamp}")
}

/// Tracks streamed samples, with both *all-time* counters and a *sliding
/// 1 s window* rate.
#[derive(Debug)]
pub struct Counter {
    /// All-time number of samples
    pub total: usize,
    /// Number of increments
    pub n_reads: usize,
    /// Time when this counter was created
    pub t_begin: Instant,

    window: Duration,
    reads: VecDeque<(Instant, usize)>,
    in_window: usize,
}

impl Default for Counter {
    fn default() -> Self {
        Counter {
            total: 0,
            n_reads: 0,
            t_begin: Instant::now(),
            window: Duration::from_secs(1),
            reads: VecDeque::new(),
            in_window: 0,
        }
    }
}

impl Counter {
    pub fn new() -> Self {
        Default::default()
    }

    /// Long-term average rate since t_begin, in samples/s
    pub fn average_rate(&self) -> f64 {
        let secs = self.t_begin.elapsed().as_secs_f64().max(1e-6);
        self.total as f64 / secs
    }

    /// Sliding-window rate over the last second, in samples/s
    pub fn rate(&self) -> f64 {
        self.in_window as f64 / self.window.as_secs_f64().max(1e-6)
    }

    /// Record a read of `samples` samples.
    pub fn increment(&mut self, samples: usize) {
        let now = Instant::now();
        self.total += samples;
        self.n_reads += 1;

        self.reads.push_back((now, samples));
        self.in_window += samples;

        while let Some(&(ts, n)) = self.reads.front() {
            if now.duration_since(ts) > self.window {
                self.reads.pop_front();
                self.in_window -= n;
            } else {
                break;
            }
        }
    }
}
