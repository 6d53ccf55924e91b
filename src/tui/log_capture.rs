//! Capture of tracing output while the call screen owns the terminal.
//!
//! [`LogBuffer`] is a `MakeWriter`: the fmt layer writes into it instead of
//! stderr, so log lines never draw over the alternate screen. The log pane
//! drains it on every frame.

use std::collections::VecDeque;
use std::io::Write;
use std::sync::{Arc, Mutex};

use tracing_subscriber::fmt::MakeWriter;

/// Lines kept between two drains.
const DEFAULT_CAPACITY: usize = 500;

/// Bounded, shared queue of captured log lines. Oldest lines are dropped
/// first.
#[derive(Clone)]
pub struct LogBuffer {
    lines: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
}

impl LogBuffer {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            lines: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<String>> {
        self.lines.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn push(&self, line: String) {
        let mut lines = self.lock();
        while lines.len() >= self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    /// Take everything captured so far, oldest first.
    pub fn drain(&self) -> Vec<String> {
        self.lock().drain(..).collect()
    }

    /// Write whatever is still queued to stderr. Used once the terminal is
    /// restored so a failed call's log is not lost.
    pub fn dump_to_stderr(&self) {
        let mut stderr = std::io::stderr().lock();
        for line in self.drain() {
            let _ = writeln!(stderr, "{}", line);
        }
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// One formatted event in flight. Complete lines go to the buffer as they
/// are written; a trailing partial line goes on flush or drop.
pub struct LineWriter {
    target: LogBuffer,
    partial: Vec<u8>,
}

impl LineWriter {
    fn emit(&mut self, bytes: &[u8]) {
        let text = String::from_utf8_lossy(bytes);
        self.target.push(text.trim_end_matches('\r').to_string());
    }
}

impl Write for LineWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.partial.extend_from_slice(buf);
        while let Some(end) = self.partial.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.partial.drain(..=end).collect();
            self.emit(&line[..end]);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if !self.partial.is_empty() {
            let rest = std::mem::take(&mut self.partial);
            self.emit(&rest);
        }
        Ok(())
    }
}

impl Drop for LineWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

impl<'a> MakeWriter<'a> for LogBuffer {
    type Writer = LineWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LineWriter {
            target: self.clone(),
            partial: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oldest_lines_are_dropped() {
        let buf = LogBuffer::with_capacity(3);
        for i in 0..5 {
            buf.push(format!("line {}", i));
        }
        assert_eq!(buf.drain(), vec!["line 2", "line 3", "line 4"]);
        assert!(buf.drain().is_empty());
    }

    #[test]
    fn test_writer_splits_lines() {
        let buf = LogBuffer::new();
        let mut writer = buf.make_writer();
        write!(writer, "ICE pair selected\r\nCall connected\npart").unwrap();
        assert_eq!(buf.drain(), vec!["ICE pair selected", "Call connected"]);

        drop(writer);
        assert_eq!(buf.drain(), vec!["part"]);
    }

    #[test]
    fn test_events_through_subscriber_land_in_buffer() {
        use tracing_subscriber::layer::SubscriberExt;

        let buf = LogBuffer::new();
        let subscriber = tracing_subscriber::registry().with(
            tracing_subscriber::fmt::layer()
                .with_writer(buf.clone())
                .with_ansi(false)
                .with_target(false),
        );
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("Call abc connected");
        });

        let lines = buf.drain();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("INFO"));
        assert!(lines[0].ends_with("Call abc connected"));
    }
}
