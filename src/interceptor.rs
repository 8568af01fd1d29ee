use std::{ffi::c_void, ptr};

use log::{debug, error, trace};
use once_cell::sync::OnceCell;

use crate::{
    arena::{BootstrapArena, DEFAULT_ARENA_CAPACITY},
    config::Config,
    error::die,
    logger,
    report::{self, Report, Reporter},
    resolver::{Originals, Platform, Resolver},
    stats::{Snapshot, Stats},
};

/// Replacement for the four libc allocation entry points.
///
/// Every call is forwarded to the real implementation found by `P`, and the
/// usable size of the affected block is recorded in [`Stats`]. Requests made
/// while the real implementation is being looked up are served from a
/// [`BootstrapArena`] of `ARENA` bytes.
///
/// Methods take `&'static self`: an interceptor lives for the whole process
/// and the reporting thread it spawns keeps a reference to it.
pub struct Interceptor<P, const ARENA: usize = DEFAULT_ARENA_CAPACITY> {
    resolver: Resolver<P>,
    arena: BootstrapArena<ARENA>,
    stats: Stats,
    reporter: Reporter,
    config: OnceCell<Config>,
}

impl<P, const ARENA: usize> Interceptor<P, ARENA> {
    pub const fn new(platform: P) -> Self {
        Self {
            resolver: Resolver::new(platform),
            arena: BootstrapArena::new(),
            stats: Stats::new(),
            reporter: Reporter::new(),
            config: OnceCell::new(),
        }
    }

    /// Fixes the configuration instead of reading it from the environment on
    /// first use. Returns `false` if it was already set.
    pub fn configure(&self, config: Config) -> bool {
        self.config.set(config).is_ok()
    }

    pub fn config(&self) -> Option<&Config> {
        self.config.get()
    }

    pub fn resolver(&self) -> &Resolver<P> {
        &self.resolver
    }

    pub fn arena(&self) -> &BootstrapArena<ARENA> {
        &self.arena
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn reporter(&self) -> &Reporter {
        &self.reporter
    }
}

impl<P: Platform, const ARENA: usize> Interceptor<P, ARENA> {
    /// # Safety
    ///
    /// Same contract as libc `malloc`.
    pub unsafe fn malloc(&'static self, size: usize) -> *mut c_void {
        trace!("malloc(size: {})", size);

        if self.resolver.is_resolving() {
            return self.bootstrap(size);
        }
        let malloc = match self.original(Originals::malloc) {
            Some(malloc) => malloc,
            // Another thread is still resolving.
            None => return self.bootstrap(size),
        };

        let ptr = malloc(size);
        let usable = self.resolver.platform().usable_size(ptr);
        self.stats.log_malloc(usable);
        ptr
    }

    /// # Safety
    ///
    /// Same contract as libc `calloc`.
    pub unsafe fn calloc(&'static self, count: usize, size: usize) -> *mut c_void {
        trace!("calloc(count: {}, size: {})", count, size);

        let calloc = match self.bound(Originals::calloc) {
            Some(calloc) => calloc,
            None => {
                // Counted by `malloc`.
                let total = match count.checked_mul(size) {
                    Some(total) => total,
                    None => return ptr::null_mut(),
                };
                let ptr = self.malloc(total);
                if !ptr.is_null() {
                    ptr::write_bytes(ptr.cast::<u8>(), 0, total);
                }
                return ptr;
            }
        };

        let ptr = calloc(count, size);
        let usable = self.resolver.platform().usable_size(ptr);
        self.stats.log_calloc(usable);
        ptr
    }

    /// # Safety
    ///
    /// Same contract as libc `realloc`.
    pub unsafe fn realloc(&'static self, ptr: *mut c_void, size: usize) -> *mut c_void {
        trace!("realloc(ptr: {:p}, size: {})", ptr, size);

        if self.arena.owns(ptr) {
            // The real allocator knows nothing about arena blocks.
            return self.relocate(ptr, self.arena.span_from(ptr), size);
        }

        let platform = self.resolver.platform();
        let realloc = match self.bound(Originals::realloc) {
            Some(realloc) => realloc,
            None => {
                let new_ptr = self.relocate(ptr, platform.usable_size(ptr), size);
                if !new_ptr.is_null() && !ptr.is_null() {
                    self.free(ptr);
                }
                return new_ptr;
            }
        };

        let old_size = platform.usable_size(ptr) as i64;
        let new_ptr = realloc(ptr, size);
        let delta = if new_ptr.is_null() && size != 0 {
            // Failed: the old block is still live.
            0
        } else {
            platform.usable_size(new_ptr) as i64 - old_size
        };
        self.stats.log_realloc(delta);
        new_ptr
    }

    /// # Safety
    ///
    /// Same contract as libc `free`.
    pub unsafe fn free(&'static self, ptr: *mut c_void) {
        trace!("free(ptr: {:p})", ptr);

        if self.arena.owns(ptr) {
            trace!("ignoring free of bootstrap block {:p}", ptr);
            return;
        }
        let free = match self.original(Originals::free) {
            Some(free) => free,
            None => {
                debug!("leaking {:p}: allocator still being resolved", ptr);
                return;
            }
        };

        let usable = self.resolver.platform().usable_size(ptr);
        self.stats.log_free(usable);
        free(ptr);
    }

    /// Stops periodic reporting and emits the final report.
    pub fn shutdown(&self) -> Snapshot {
        self.reporter.stop();
        self.reporter.detach();
        let snapshot = self.stats.snapshot();
        report::emit(&Report::now(snapshot));
        snapshot
    }

    /// Returns the original selected by `get`, resolving the originals first
    /// if nobody has yet.
    fn original<F>(&'static self, get: fn(&Originals) -> Option<F>) -> Option<F> {
        get(self.resolver.originals()).or_else(|| {
            self.initialize();
            get(self.resolver.originals())
        })
    }

    /// Returns the original selected by `get` unless the originals are being
    /// resolved right now, in which case the emulation paths must be used so
    /// that the request ends up in the arena.
    fn bound<F>(&self, get: fn(&Originals) -> Option<F>) -> Option<F> {
        if self.resolver.is_resolving() {
            None
        } else {
            get(self.resolver.originals())
        }
    }

    fn initialize(&'static self) {
        let mut config = Config::default();
        let resolved = self.resolver.resolve(|| {
            config = *self.config.get_or_init(Config::from_env);
            logger::init(config.debug);
            debug!("initializing (report period: {:?})", config.period);
        });

        match resolved {
            Ok(true) => self.start_reporting(config),
            Ok(false) => {}
            Err(err) => die(&err),
        }
    }

    fn start_reporting(&'static self, config: Config) {
        if config.period.is_zero() {
            debug!("periodic reports disabled");
            return;
        }
        let sink = |snapshot: Snapshot| report::emit(&Report::now(snapshot));
        if let Err(err) = self.reporter.start(&self.stats, config.period, sink) {
            error!("failed to start reporting thread: {}", err);
        }
    }

    fn bootstrap(&self, size: usize) -> *mut c_void {
        match self.arena.allocate(size) {
            Ok(ptr) => ptr.as_ptr().cast(),
            Err(err) => die(&err),
        }
    }

    /// Moves a block the real `realloc` cannot handle into a fresh allocation,
    /// copying at most `old_size` bytes.
    unsafe fn relocate(
        &'static self,
        ptr: *mut c_void,
        old_size: usize,
        size: usize,
    ) -> *mut c_void {
        let new_ptr = self.malloc(size);
        if !new_ptr.is_null() && !ptr.is_null() {
            ptr::copy_nonoverlapping(ptr.cast::<u8>(), new_ptr.cast::<u8>(), old_size.min(size));
        }
        new_ptr
    }
}
