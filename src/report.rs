use std::{
    fmt,
    io::{self, Write},
    sync::{
        atomic::{AtomicU8, Ordering},
        Mutex, PoisonError,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use chrono::{DateTime, Local};

use crate::stats::{Snapshot, Stats};

/// A [`Snapshot`] stamped with the time it was taken.
#[derive(Clone, Copy, Debug)]
pub struct Report {
    pub taken_at: DateTime<Local>,
    pub snapshot: Snapshot,
}

impl Report {
    pub fn now(snapshot: Snapshot) -> Self {
        Self {
            taken_at: Local::now(),
            snapshot,
        }
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let taken_at = self.taken_at.format("%c %z");
        writeln!(f, "==== memsafi report: {} ====", taken_at)?;
        write!(f, "{}", self.snapshot)
    }
}

/// Writes `report` to stderr. Failures are ignored.
pub fn emit(report: &Report) {
    let _ = write_to(&mut io::stderr().lock(), report);
}

/// Renders the whole report before the single write to `out`. Rendering
/// allocates, and debug lines logged by those allocations must not end up
/// inside the report.
fn write_to<W: Write>(out: &mut W, report: &Report) -> io::Result<()> {
    let text = format!("\n{}", report);
    out.write_all(text.as_bytes())
}

const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const STOPPED: u8 = 2;

/// Background thread printing a report every period.
///
/// Moves `Idle -> Running -> Stopped` and never back. Stopping is cooperative:
/// the thread notices it on its next wake-up and exits without reporting.
#[derive(Debug)]
pub struct Reporter {
    state: AtomicU8,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Reporter {
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(IDLE),
            handle: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.load(Ordering::Acquire) == RUNNING
    }

    pub fn is_stopped(&self) -> bool {
        self.state.load(Ordering::Acquire) == STOPPED
    }

    /// Spawns the reporting thread. Returns `Ok(false)` if the reporter was
    /// already started or stopped.
    pub fn start<F>(
        &'static self,
        stats: &'static Stats,
        period: Duration,
        sink: F,
    ) -> io::Result<bool>
    where
        F: Fn(Snapshot) + Send + 'static,
    {
        if self
            .state
            .compare_exchange(IDLE, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(false);
        }

        let handle = thread::Builder::new()
            .name("memsafi-report".into())
            .spawn(move || {
                while self.is_running() {
                    thread::sleep(period);
                    if !self.is_running() {
                        break;
                    }
                    sink(stats.snapshot());
                }
            });
        match handle {
            Ok(handle) => {
                *self.handle.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
                Ok(true)
            }
            Err(e) => {
                self.state.store(STOPPED, Ordering::Release);
                Err(e)
            }
        }
    }

    pub fn stop(&self) {
        self.state.store(STOPPED, Ordering::Release);
    }

    /// Lets the reporting thread finish on its own without waiting for it.
    pub fn detach(&self) {
        drop(
            self.handle
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
    }
}

impl Default for Reporter {
    fn default() -> Self {
        Self::new()
    }
}
