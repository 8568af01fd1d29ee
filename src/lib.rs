//! `memsafi` reports how much heap memory a program uses without recompiling
//! or otherwise modifying it.  It interposes `malloc`, `calloc`, `realloc` and
//! `free`, forwards every request to the real libc implementation, and keeps
//! process-wide counters of the bytes reserved and released, the peak
//! reservation, and the number of calls to each function.
//!
//! Byte counts are usable sizes as reported by `malloc_usable_size`, i.e. they
//! include the padding the allocator adds for alignment.
//!
//! ## Using `memsafi` via `LD_PRELOAD`
//!
//! The companion [`lib_memsafi`] crate compiles into `libmemsafi.so`:
//!
//! ```bash
//! LD_PRELOAD=libmemsafi.so ./my_program
//! ```
//!
//! or, with the launcher built from this crate:
//!
//! ```bash
//! memsafi --period 1 -- ./my_program --its-flags
//! ```
//!
//! A report is written to stderr every five seconds (`MEM_SAFI_PERIOD`
//! overrides the period, `0` disables periodic reports) and once more after
//! the program's `main` returns:
//!
//! ```text
//! ==== memsafi report: Sat Oct 17 12:00:00 2026 +0000 ====
//! Currently reserved: 3 MiB
//! Peak reserved:      12 MiB
//! Total reserved:     96 MiB
//! Total freed:        93 MiB
//! malloc calls:       104,223
//! calloc calls:       13
//! realloc calls:      2,871
//! free calls:         103,960
//! ```
//!
//! Setting `MEM_SAFI_DEBUG=1` additionally traces every intercepted call.
//!
//! ## Bootstrapping
//!
//! The real allocator is looked up with `dlsym` on first use, and `dlsym` may
//! itself call `malloc`.  Requests that arrive while the lookup is in progress
//! are served from a small static [`BootstrapArena`] that is never reclaimed.
//!
//! [`lib_memsafi`]: https://docs.rs/lib_memsafi

pub mod arena;
pub mod config;
pub mod error;
pub mod interceptor;
pub mod lifecycle;
pub mod logger;
pub mod report;
pub mod resolver;
pub mod stats;

#[cfg(test)]
mod testing;

pub use arena::BootstrapArena;
pub use config::Config;
pub use error::FatalError;
pub use interceptor::Interceptor;
pub use lifecycle::EntryPoint;
pub use resolver::{DynamicLinker, Platform};
pub use stats::{Snapshot, Stats};
