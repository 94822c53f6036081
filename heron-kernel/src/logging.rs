//! Log output plumbing.
//!
//! The kernel logs through the `log` facade everywhere. This module adapts
//! it to whatever byte sink the platform has: the host installs a sink
//! function once and every record is formatted through it.

use core::fmt::Write;

use spinning_top::Spinlock;

/// Sink function receiving one formatted log line (without newline).
pub type SinkFn = fn(&str);

static SINK: Spinlock<Option<SinkFn>> = Spinlock::new(None);

struct LineBuffer {
    buf: [u8; 256],
    len: usize,
}

impl Write for LineBuffer {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let bytes = s.as_bytes();
        let room = self.buf.len() - self.len;
        let take = bytes.len().min(room);
        self.buf[self.len..self.len + take].copy_from_slice(&bytes[..take]);
        self.len += take;
        Ok(())
    }
}

pub struct Logger;

pub static LOGGER: Logger = Logger;

impl Logger {
    /// Install `sink` and enable the facade at `level`.
    ///
    /// Safe to call more than once; later calls only swap the sink.
    pub fn init(sink: SinkFn, level: log::LevelFilter) {
        *SINK.lock() = Some(sink);
        let _ = log::set_logger(&LOGGER);
        log::set_max_level(level);
    }
}

impl log::Log for Logger {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        SINK.lock().is_some()
    }

    fn log(&self, record: &log::Record) {
        let Some(sink) = *SINK.lock() else {
            return;
        };

        let mut line = LineBuffer {
            buf: [0; 256],
            len: 0,
        };
        let _ = write!(
            line,
            "[{}] {}: {}",
            record.target(),
            record.level(),
            record.args()
        );
        // Lines longer than the buffer are truncated.
        if let Ok(text) = core::str::from_utf8(&line.buf[..line.len]) {
            sink(text);
        }
    }

    fn flush(&self) {}
}
