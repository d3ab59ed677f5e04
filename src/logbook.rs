use crate::utils::clock_time;
use crossbeam_channel::{unbounded, Receiver, Sender};

/// Append-only sink for `(source, status, message)` records.
///
/// Implementations must return promptly: the sweep logs from inside the
/// acquisition path.
pub trait LogSink: Send + Sync {
    fn log(&self, source: &str, status: &str, message: &str);
}

/// Forwards records to the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogFacade;

impl LogSink for LogFacade {
    fn log(&self, source: &str, status: &str, message: &str) {
        log::info!("[{source}] {status}: {message}");
    }
}

/// A record as delivered by [`ChannelLog`].
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    /// Wall-clock time the record was made, `HH:MM:SS`.
    pub time: String,
    pub source: String,
    pub status: String,
    pub message: String,
}

/// Queues records on an unbounded channel for a display thread to drain.
#[derive(Debug, Clone)]
pub struct ChannelLog {
    tx: Sender<LogEntry>,
}

impl ChannelLog {
    pub fn new() -> (Self, Receiver<LogEntry>) {
        let (tx, rx) = unbounded();
        (Self { tx }, rx)
    }
}

impl LogSink for ChannelLog {
    fn log(&self, source: &str, status: &str, message: &str) {
        log::debug!("[{source}] {status}: {message}");
        let entry = LogEntry {
            time: clock_time(),
            source: source.to_owned(),
            status: status.to_owned(),
            message: message.to_owned(),
        };
        // nobody listening any more
        let _ = self.tx.send(entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_log_keeps_order() {
        let (log, rx) = ChannelLog::new();
        log.log("GUI", "Startup", "created");
        log.log("AD2", "Connection", "connected");
        let entries: Vec<LogEntry> = rx.try_iter().collect();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].source, "GUI");
        assert_eq!(entries[1].status, "Connection");
        assert_eq!(entries[1].time.len(), 8);
    }

    #[test]
    fn send_after_receiver_dropped() {
        let (log, rx) = ChannelLog::new();
        drop(rx);
        log.log("AD2", "Connection", "still fine");
    }
}
