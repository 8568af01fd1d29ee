use std::{
    ffi::{c_void, CStr},
    mem,
    ptr::{self, NonNull},
    sync::atomic::{AtomicPtr, AtomicU8, Ordering},
};

use libc::RTLD_NEXT;

use crate::error::{DlError, FatalError};

pub type MallocFn = unsafe extern "C" fn(size: libc::size_t) -> *mut c_void;
pub type CallocFn = unsafe extern "C" fn(count: libc::size_t, size: libc::size_t) -> *mut c_void;
pub type ReallocFn = unsafe extern "C" fn(ptr: *mut c_void, size: libc::size_t) -> *mut c_void;
pub type FreeFn = unsafe extern "C" fn(ptr: *mut c_void);

/// Where the allocator underneath the interposer comes from.
pub trait Platform: Sync {
    /// Finds the next definition of `symbol` after the interposing library.
    // `FatalError` carries the `dlerror` text inline, since boxing it would allocate.
    #[allow(clippy::result_large_err)]
    fn lookup(&self, symbol: &'static CStr) -> Result<NonNull<c_void>, FatalError>;

    /// Number of bytes actually backing `ptr`, which may exceed the size
    /// originally requested. Returns 0 for null.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live block of the allocator found by
    /// [`lookup`](Self::lookup).
    unsafe fn usable_size(&self, ptr: *mut c_void) -> usize;
}

/// Resolves symbols through `dlsym(RTLD_NEXT, ..)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DynamicLinker;

impl Platform for DynamicLinker {
    #[allow(clippy::result_large_err)]
    fn lookup(&self, symbol: &'static CStr) -> Result<NonNull<c_void>, FatalError> {
        let addr = unsafe { libc::dlsym(RTLD_NEXT, symbol.as_ptr()) };
        NonNull::new(addr).ok_or_else(|| FatalError::SymbolNotFound {
            symbol: symbol.to_str().unwrap_or("?"),
            reason: DlError::last(),
        })
    }

    unsafe fn usable_size(&self, ptr: *mut c_void) -> usize {
        if ptr.is_null() {
            0
        } else {
            libc::malloc_usable_size(ptr)
        }
    }
}

const UNINITIALIZED: u8 = 0;
const RESOLVING: u8 = 1;
const READY: u8 = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Uninitialized,
    /// Lookups are running; allocations must be served by the bootstrap arena.
    Resolving,
    Ready,
}

/// The real allocator functions. Each slot is written once and never changes
/// afterwards.
#[derive(Debug)]
pub struct Originals {
    malloc: AtomicPtr<c_void>,
    calloc: AtomicPtr<c_void>,
    realloc: AtomicPtr<c_void>,
    free: AtomicPtr<c_void>,
}

macro_rules! original {
    ($name:ident, $ty:ty) => {
        pub fn $name(&self) -> Option<$ty> {
            let addr = self.$name.load(Ordering::Acquire);
            if addr.is_null() {
                None
            } else {
                Some(unsafe { mem::transmute::<*mut c_void, $ty>(addr) })
            }
        }
    };
}

impl Originals {
    const fn new() -> Self {
        Self {
            malloc: AtomicPtr::new(ptr::null_mut()),
            calloc: AtomicPtr::new(ptr::null_mut()),
            realloc: AtomicPtr::new(ptr::null_mut()),
            free: AtomicPtr::new(ptr::null_mut()),
        }
    }

    original!(malloc, MallocFn);
    original!(calloc, CallocFn);
    original!(realloc, ReallocFn);
    original!(free, FreeFn);
}

/// Binds [`Originals`] once per process.
#[derive(Debug)]
pub struct Resolver<P> {
    platform: P,
    phase: AtomicU8,
    originals: Originals,
}

impl<P> Resolver<P> {
    pub const fn new(platform: P) -> Self {
        Self {
            platform,
            phase: AtomicU8::new(UNINITIALIZED),
            originals: Originals::new(),
        }
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn originals(&self) -> &Originals {
        &self.originals
    }

    pub fn phase(&self) -> Phase {
        match self.phase.load(Ordering::Acquire) {
            UNINITIALIZED => Phase::Uninitialized,
            RESOLVING => Phase::Resolving,
            _ => Phase::Ready,
        }
    }

    pub fn is_resolving(&self) -> bool {
        self.phase.load(Ordering::Acquire) == RESOLVING
    }
}

impl<P: Platform> Resolver<P> {
    /// Looks up the four allocator entry points, unless another call already
    /// did or is doing so.
    ///
    /// Returns `Ok(true)` only for the call that performed the resolution.
    /// `prepare` runs in that call after the phase has switched to
    /// [`Phase::Resolving`] and before the first lookup.
    ///
    /// On error the phase stays [`Phase::Resolving`]; the caller is expected to
    /// terminate the process.
    // `FatalError` carries the `dlerror` text inline, since boxing it would allocate.
    #[allow(clippy::result_large_err)]
    pub fn resolve(&self, prepare: impl FnOnce()) -> Result<bool, FatalError> {
        if self
            .phase
            .compare_exchange(
                UNINITIALIZED,
                RESOLVING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Ok(false);
        }
        prepare();

        log::debug!("resolving allocator symbols");
        for (symbol, slot) in [
            (c"malloc", &self.originals.malloc),
            (c"calloc", &self.originals.calloc),
            (c"realloc", &self.originals.realloc),
            (c"free", &self.originals.free),
        ] {
            let addr = self.platform.lookup(symbol)?;
            slot.store(addr.as_ptr(), Ordering::Release);
        }

        self.phase.store(READY, Ordering::Release);
        log::debug!("allocator symbols resolved");
        Ok(true)
    }
}
