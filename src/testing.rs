//! In-process stand-in for the dynamic linker and the libc allocator.

use std::{
    cell::Cell,
    ffi::{c_void, CStr},
    ptr::{self, NonNull},
    sync::atomic::{AtomicUsize, Ordering},
};

use once_cell::sync::OnceCell;

use crate::{
    error::{DlError, FatalError},
    resolver::{CallocFn, FreeFn, MallocFn, Platform, ReallocFn},
};

// Each fake block is prefixed by a header holding its usable size.
const HEADER: usize = 16;

thread_local! {
    static REAL_FREES: Cell<usize> = const { Cell::new(0) };
}

/// Number of blocks released through the fake `free` on the current thread.
pub(crate) fn real_frees() -> usize {
    REAL_FREES.with(Cell::get)
}

/// Usable size reported for a request: rounded up to 16 bytes.
pub(crate) fn usable_for(size: usize) -> usize {
    size.max(1).div_ceil(16) * 16
}

unsafe fn tag(raw: *mut c_void, size: usize) -> *mut c_void {
    if raw.is_null() {
        return raw;
    }
    *raw.cast::<usize>() = usable_for(size);
    raw.cast::<u8>().add(HEADER).cast()
}

unsafe fn untag(ptr: *mut c_void) -> *mut c_void {
    ptr.cast::<u8>().sub(HEADER).cast()
}

unsafe extern "C" fn fake_malloc(size: libc::size_t) -> *mut c_void {
    tag(libc::malloc(usable_for(size) + HEADER), size)
}

unsafe extern "C" fn fake_calloc(count: libc::size_t, size: libc::size_t) -> *mut c_void {
    let total = count * size;
    tag(libc::calloc(1, usable_for(total) + HEADER), total)
}

unsafe extern "C" fn fake_realloc(ptr: *mut c_void, size: libc::size_t) -> *mut c_void {
    if ptr.is_null() {
        return fake_malloc(size);
    }
    if size == 0 {
        fake_free(ptr);
        return ptr::null_mut();
    }
    tag(libc::realloc(untag(ptr), usable_for(size) + HEADER), size)
}

unsafe extern "C" fn fake_free(ptr: *mut c_void) {
    if ptr.is_null() {
        return;
    }
    REAL_FREES.with(|frees| frees.set(frees.get() + 1));
    libc::free(untag(ptr));
}

type LookupHook = Box<dyn Fn(&'static CStr) + Send + Sync>;

pub(crate) struct FakePlatform {
    lookups: AtomicUsize,
    missing: Option<&'static str>,
    on_lookup: OnceCell<LookupHook>,
}

impl FakePlatform {
    pub(crate) fn new() -> Self {
        Self {
            lookups: AtomicUsize::new(0),
            missing: None,
            on_lookup: OnceCell::new(),
        }
    }

    /// A platform on which `symbol` cannot be found.
    pub(crate) fn missing(symbol: &'static str) -> Self {
        Self {
            missing: Some(symbol),
            ..Self::new()
        }
    }

    pub(crate) fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    /// Runs `hook` at the start of every lookup, the way `dlsym` may call back
    /// into `malloc`.
    pub(crate) fn on_lookup(&self, hook: impl Fn(&'static CStr) + Send + Sync + 'static) {
        assert!(self.on_lookup.set(Box::new(hook)).is_ok());
    }
}

impl Platform for FakePlatform {
    #[allow(clippy::result_large_err)]
    fn lookup(&self, symbol: &'static CStr) -> Result<NonNull<c_void>, FatalError> {
        if let Some(hook) = self.on_lookup.get() {
            hook(symbol);
        }
        self.lookups.fetch_add(1, Ordering::SeqCst);

        let name = symbol.to_str().unwrap_or("?");
        if self.missing == Some(name) {
            return Err(FatalError::SymbolNotFound {
                symbol: name,
                reason: DlError::new("undefined symbol"),
            });
        }
        let addr = match name {
            "malloc" => fake_malloc as MallocFn as *mut c_void,
            "calloc" => fake_calloc as CallocFn as *mut c_void,
            "realloc" => fake_realloc as ReallocFn as *mut c_void,
            "free" => fake_free as FreeFn as *mut c_void,
            _ => ptr::null_mut(),
        };
        NonNull::new(addr).ok_or(FatalError::SymbolNotFound {
            symbol: name,
            reason: DlError::new("unknown symbol"),
        })
    }

    unsafe fn usable_size(&self, ptr: *mut c_void) -> usize {
        if ptr.is_null() {
            0
        } else {
            *untag(ptr).cast::<usize>()
        }
    }
}
