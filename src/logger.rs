//! `log` backend that is safe to call from inside `malloc`.
//!
//! Records are formatted into a fixed buffer on the stack and written to fd 2
//! with a raw `write(2)`, so logging never allocates and never takes the
//! `std::io::stderr()` lock.

use std::{
    fmt::{self, Write},
    io,
};

use log::{LevelFilter, Log, Metadata, Record};

const LINE_CAPACITY: usize = 512;

/// Fixed-capacity formatting buffer. Output past the capacity is dropped.
struct StackWriter {
    buf: [u8; LINE_CAPACITY],
    len: usize,
}

impl StackWriter {
    fn new() -> Self {
        Self {
            buf: [0; LINE_CAPACITY],
            len: 0,
        }
    }

    fn flush_to(&self, fd: libc::c_int) {
        let mut written = 0;
        while written < self.len {
            let rest = &self.buf[written..self.len];
            let n = unsafe { libc::write(fd, rest.as_ptr().cast(), rest.len()) };
            if n > 0 {
                written += n as usize;
                continue;
            }
            if n < 0 && io::Error::last_os_error().kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return;
        }
    }
}

impl Write for StackWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let n = s.len().min(LINE_CAPACITY - self.len);
        self.buf[self.len..self.len + n].copy_from_slice(&s.as_bytes()[..n]);
        self.len += n;
        Ok(())
    }
}

/// Writes `args` to stderr without allocating. Errors are ignored.
pub fn write_stderr(args: fmt::Arguments<'_>) {
    let mut w = StackWriter::new();
    let _ = w.write_fmt(args);
    w.flush_to(libc::STDERR_FILENO);
}

pub struct StderrLogger;

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let (level, args) = (record.level(), record.args());
        write_stderr(format_args!("[memsafi {}] {}\n", level, args));
    }

    fn flush(&self) {}
}

static LOGGER: StderrLogger = StderrLogger;

/// Installs [`StderrLogger`]. Later calls only adjust the level.
pub fn init(debug: bool) {
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(level_for(debug));
}

fn level_for(debug: bool) -> LevelFilter {
    if debug {
        LevelFilter::Trace
    } else {
        LevelFilter::Error
    }
}
