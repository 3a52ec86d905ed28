//! Structured kernel logging.
//!
//! Installs a [`log::Log`] backend that fans every record out to the
//! serial console and into a fixed-capacity, heap-free ring buffer of
//! structured entries. The buffer wraps, silently overwriting the oldest
//! records. Boot code prints directly with `println!` until the boot
//! sequencer reaches the logger stage and calls [`init`].

use core::fmt::{self, Write};

use log::{Level, LevelFilter, Metadata, Record};

use crate::sync::IrqLock;

/// Entries the ring buffer can hold.
const LOG_BUFFER_CAPACITY: usize = 256;

/// Stored message length.
const LOG_MESSAGE_MAX_LEN: usize = 120;

/// Stored target (subsystem) length.
const LOG_TARGET_MAX_LEN: usize = 16;

/// One structured record.
#[derive(Clone, Copy)]
pub struct LogEntry {
    pub timestamp_ms: u64,
    pub level: Level,
    target_buf: [u8; LOG_TARGET_MAX_LEN],
    target_len: u8,
    message_buf: [u8; LOG_MESSAGE_MAX_LEN],
    message_len: u8,
}

impl LogEntry {
    const fn empty() -> Self {
        Self {
            timestamp_ms: 0,
            level: Level::Trace,
            target_buf: [0; LOG_TARGET_MAX_LEN],
            target_len: 0,
            message_buf: [0; LOG_MESSAGE_MAX_LEN],
            message_len: 0,
        }
    }

    pub fn target(&self) -> &str {
        core::str::from_utf8(&self.target_buf[..self.target_len as usize]).unwrap_or("?")
    }

    pub fn message(&self) -> &str {
        core::str::from_utf8(&self.message_buf[..self.message_len as usize]).unwrap_or("?")
    }
}

struct RingBuffer {
    entries: [LogEntry; LOG_BUFFER_CAPACITY],
    next: usize,
    total: u64,
}

impl RingBuffer {
    const fn new() -> Self {
        Self {
            entries: [LogEntry::empty(); LOG_BUFFER_CAPACITY],
            next: 0,
            total: 0,
        }
    }

    fn push(&mut self, entry: LogEntry) {
        self.entries[self.next] = entry;
        self.next = (self.next + 1) % LOG_BUFFER_CAPACITY;
        self.total += 1;
    }
}

static BUFFER: IrqLock<RingBuffer> = IrqLock::new(RingBuffer::new());

/// Truncating writer into a fixed byte buffer.
struct FixedWriter<'a> {
    buf: &'a mut [u8],
    len: usize,
}

impl Write for FixedWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = self.buf.len() - self.len;
        let take = s.len().min(room);
        self.buf[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        Ok(())
    }
}

struct KernelLogger;

impl log::Log for KernelLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let now = crate::time::now_ms();

        crate::println!(
            "[{:>6}.{:03}] {:>5} {}: {}",
            now / 1000,
            now % 1000,
            record.level(),
            record.target(),
            record.args()
        );

        let mut entry = LogEntry::empty();
        entry.timestamp_ms = now;
        entry.level = record.level();

        let mut w = FixedWriter {
            buf: &mut entry.target_buf,
            len: 0,
        };
        let _ = w.write_str(record.target());
        entry.target_len = w.len as u8;

        let mut w = FixedWriter {
            buf: &mut entry.message_buf,
            len: 0,
        };
        let _ = w.write_fmt(*record.args());
        entry.message_len = w.len as u8;

        BUFFER.lock().push(entry);
    }

    fn flush(&self) {}
}

static LOGGER: KernelLogger = KernelLogger;

/// Install the logger. Safe to call more than once; later calls only
/// adjust the level filter.
pub fn init(level: LevelFilter) {
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(level);
}

/// Total records ever logged (including overwritten ones).
pub fn count() -> u64 {
    BUFFER.lock().total
}

/// Visit the buffered records, oldest first.
pub fn for_each(mut f: impl FnMut(&LogEntry)) {
    let buf = BUFFER.lock();
    let kept = (buf.total as usize).min(LOG_BUFFER_CAPACITY);
    let start = (buf.next + LOG_BUFFER_CAPACITY - kept) % LOG_BUFFER_CAPACITY;
    for i in 0..kept {
        f(&buf.entries[(start + i) % LOG_BUFFER_CAPACITY]);
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn ring_buffer_wraps_and_keeps_newest() {
        let mut rb = RingBuffer::new();
        for i in 0..(LOG_BUFFER_CAPACITY as u64 + 10) {
            let mut e = LogEntry::empty();
            e.timestamp_ms = i;
            rb.push(e);
        }
        assert_eq!(rb.total, LOG_BUFFER_CAPACITY as u64 + 10);
        // The slot about to be overwritten holds the oldest surviving
        // record.
        let oldest = rb.entries[rb.next].timestamp_ms;
        assert_eq!(oldest, 10);
    }

    #[test]
    fn fixed_writer_truncates() {
        let mut buf = [0u8; 8];
        let mut w = FixedWriter {
            buf: &mut buf,
            len: 0,
        };
        w.write_str("hello world").unwrap();
        assert_eq!(w.len, 8);
        assert_eq!(&buf, b"hello wo");
    }

    #[test]
    fn entry_accessors_round_trip() {
        let mut e = LogEntry::empty();
        let mut w = FixedWriter {
            buf: &mut e.target_buf,
            len: 0,
        };
        w.write_str("sched").unwrap();
        e.target_len = w.len as u8;
        assert_eq!(e.target(), "sched");
    }
}
