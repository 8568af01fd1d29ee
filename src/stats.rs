use std::{
    fmt,
    sync::atomic::{AtomicI64, AtomicU64, Ordering},
};

use num_format::{Locale, ToFormattedString};

/// Process-wide allocation counters.
///
/// Byte counters are signed: a shrinking `realloc` contributes a negative
/// delta, and `reserved` may dip below zero while frees race with the
/// allocations that produced them.
///
/// Every field is updated atomically on its own, never as a group, so a
/// [`Snapshot`] is an approximate view.
#[derive(Debug, Default)]
pub struct Stats {
    reserved: AtomicI64,
    total_reserved: AtomicI64,
    peak_reserved: AtomicI64,
    freed: AtomicI64,

    mallocs: AtomicU64,
    callocs: AtomicU64,
    reallocs: AtomicU64,
    frees: AtomicU64,
}

impl Stats {
    pub const fn new() -> Self {
        Self {
            reserved: AtomicI64::new(0),
            total_reserved: AtomicI64::new(0),
            peak_reserved: AtomicI64::new(0),
            freed: AtomicI64::new(0),
            mallocs: AtomicU64::new(0),
            callocs: AtomicU64::new(0),
            reallocs: AtomicU64::new(0),
            frees: AtomicU64::new(0),
        }
    }

    pub fn log_malloc(&self, size: usize) {
        self.reserve(size as i64);
        self.mallocs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn log_calloc(&self, size: usize) {
        self.reserve(size as i64);
        self.callocs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn log_realloc(&self, delta: i64) {
        self.reserve(delta);
        self.reallocs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn log_free(&self, size: usize) {
        let size = size as i64;
        self.reserved.fetch_sub(size, Ordering::Relaxed);
        self.freed.fetch_add(size, Ordering::Relaxed);
        self.frees.fetch_add(1, Ordering::Relaxed);
    }

    fn reserve(&self, delta: i64) {
        self.total_reserved.fetch_add(delta, Ordering::Relaxed);
        let reserved = self.reserved.fetch_add(delta, Ordering::Relaxed) + delta;
        self.raise_peak(reserved);
    }

    /// Raises `peak_reserved` to at least `candidate`.
    ///
    /// A plain load-then-store would let a thread holding a stale, smaller
    /// value overwrite a larger peak published concurrently.
    fn raise_peak(&self, candidate: i64) {
        let mut peak = self.peak_reserved.load(Ordering::Relaxed);
        while candidate > peak {
            match self.peak_reserved.compare_exchange_weak(
                peak,
                candidate,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(current) => peak = current,
            }
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            reserved: self.reserved.load(Ordering::Relaxed),
            peak_reserved: self.peak_reserved.load(Ordering::Relaxed),
            total_reserved: self.total_reserved.load(Ordering::Relaxed),
            freed: self.freed.load(Ordering::Relaxed),
            mallocs: self.mallocs.load(Ordering::Relaxed),
            callocs: self.callocs.load(Ordering::Relaxed),
            reallocs: self.reallocs.load(Ordering::Relaxed),
            frees: self.frees.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`Stats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub reserved: i64,
    pub peak_reserved: i64,
    pub total_reserved: i64,
    pub freed: i64,
    pub mallocs: u64,
    pub callocs: u64,
    pub reallocs: u64,
    pub frees: u64,
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Currently reserved: {}", Bytes(self.reserved))?;
        writeln!(f, "Peak reserved:      {}", Bytes(self.peak_reserved))?;
        writeln!(f, "Total reserved:     {}", Bytes(self.total_reserved))?;
        writeln!(f, "Total freed:        {}", Bytes(self.freed))?;
        for (name, count) in [
            ("malloc", self.mallocs),
            ("calloc", self.callocs),
            ("realloc", self.reallocs),
            ("free", self.frees),
        ] {
            writeln!(
                f,
                "{:<20}{}",
                format!("{} calls:", name),
                count.to_formatted_string(&Locale::en)
            )?;
        }
        Ok(())
    }
}

const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];

/// Byte count rendered with binary units, truncated to an integer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Bytes(pub i64);

impl fmt::Display for Bytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut value = self.0;
        let mut unit = 0;
        while value / 1024 != 0 && unit < UNITS.len() - 1 {
            value /= 1024;
            unit += 1;
        }
        write!(f, "{} {}", value, UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, thread};

    #[test]
    fn malloc_then_free_balances() {
        let stats = Stats::new();
        stats.log_malloc(112);
        let s = stats.snapshot();
        assert_eq!(s.reserved, 112);
        assert_eq!(s.total_reserved, 112);
        assert_eq!(s.peak_reserved, 112);

        stats.log_free(112);
        let s = stats.snapshot();
        assert_eq!(s.reserved, 0);
        assert_eq!(s.freed, 112);
        assert_eq!(s.total_reserved, s.freed);
        assert_eq!(s.peak_reserved, 112);
        assert_eq!((s.mallocs, s.frees), (1, 1));
    }

    #[test]
    fn counters_are_per_operation() {
        let stats = Stats::new();
        stats.log_malloc(16);
        stats.log_calloc(32);
        stats.log_calloc(32);
        stats.log_realloc(0);
        let s = stats.snapshot();
        assert_eq!((s.mallocs, s.callocs, s.reallocs, s.frees), (1, 2, 1, 0));
        assert_eq!(s.reserved, 80);
    }

    #[test]
    fn shrinking_realloc_lowers_reserved_but_not_peak() {
        let stats = Stats::new();
        stats.log_malloc(256);
        stats.log_realloc(-192);
        let s = stats.snapshot();
        assert_eq!(s.reserved, 64);
        assert_eq!(s.total_reserved, 64);
        assert_eq!(s.peak_reserved, 256);
        assert_eq!(s.reserved, s.total_reserved - s.freed);
    }

    #[test]
    fn peak_survives_concurrent_growth() {
        let stats = Arc::new(Stats::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let stats = stats.clone();
                thread::spawn(move || {
                    for _ in 0..1000 {
                        stats.log_malloc(48);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let s = stats.snapshot();
        assert_eq!(s.reserved, 8 * 1000 * 48);
        assert_eq!(s.peak_reserved, s.reserved);
        assert_eq!(s.mallocs, 8000);
    }

    #[test]
    fn peak_never_below_reserved_with_interleaved_frees() {
        let stats = Arc::new(Stats::new());
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let stats = stats.clone();
                thread::spawn(move || {
                    for n in 0..500 {
                        let size = 16 * (i + n % 7 + 1);
                        stats.log_malloc(size);
                        stats.log_free(size);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let s = stats.snapshot();
        assert_eq!(s.reserved, 0);
        assert_eq!(s.total_reserved, s.freed);
        assert!(s.peak_reserved >= s.reserved);
        assert!(s.peak_reserved > 0);
    }

    #[test]
    fn byte_scaling() {
        assert_eq!(Bytes(0).to_string(), "0 B");
        assert_eq!(Bytes(1023).to_string(), "1023 B");
        assert_eq!(Bytes(1024).to_string(), "1 KiB");
        assert_eq!(Bytes(5 * 1024 * 1024 + 3).to_string(), "5 MiB");
        assert_eq!(Bytes(3 << 30).to_string(), "3 GiB");
        assert_eq!(Bytes(2048 << 40).to_string(), "2048 TiB");
        assert_eq!(Bytes(-2048).to_string(), "-2 KiB");
    }

    #[test]
    fn snapshot_display() {
        let snapshot = Snapshot {
            reserved: 2048,
            peak_reserved: 4096,
            total_reserved: 6144,
            freed: 4096,
            mallocs: 1234,
            callocs: 2,
            reallocs: 0,
            frees: 1001,
        };
        let text = snapshot.to_string();
        assert!(text.contains("Currently reserved: 2 KiB\n"));
        assert!(text.contains("Peak reserved:      4 KiB\n"));
        assert!(text.contains("Total reserved:     6 KiB\n"));
        assert!(text.contains("Total freed:        4 KiB\n"));
        assert!(text.contains("malloc calls:       1,234\n"));
        assert!(text.contains("calloc calls:       2\n"));
        assert!(text.contains("realloc calls:      0\n"));
        assert!(text.contains("free calls:         1,001\n"));
    }
}
