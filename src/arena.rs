use std::{
    cell::UnsafeCell,
    ffi::c_void,
    ptr::NonNull,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex, PoisonError,
    },
};

use crate::error::FatalError;

pub const DEFAULT_ARENA_CAPACITY: usize = 80_000;

/// Alignment of every bootstrap block, matching `max_align_t` on x86-64.
pub const ARENA_ALIGN: usize = 16;

#[repr(C, align(16))]
struct Buffer<const N: usize>([u8; N]);

/// Bump allocator that serves requests made while the real allocator is being
/// resolved.
///
/// Memory is never reclaimed. Everything in `[base, base + used)` stays owned
/// by the arena for the lifetime of the process.
pub struct BootstrapArena<const N: usize = DEFAULT_ARENA_CAPACITY> {
    lock: Mutex<()>,
    used: AtomicUsize,
    buf: UnsafeCell<Buffer<N>>,
}

// Blocks are handed out under `lock` and never handed out twice.
unsafe impl<const N: usize> Sync for BootstrapArena<N> {}

impl<const N: usize> BootstrapArena<N> {
    pub const fn new() -> Self {
        Self {
            lock: Mutex::new(()),
            used: AtomicUsize::new(0),
            buf: UnsafeCell::new(Buffer([0; N])),
        }
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    fn base(&self) -> *mut u8 {
        self.buf.get().cast()
    }

    /// Carves `size` bytes off the arena.
    ///
    /// Zero-sized requests still take one aligned slot so that the returned
    /// pointer is distinct and recognized by [`owns`](Self::owns).
    // `FatalError` carries the `dlerror` text inline, since boxing it would allocate.
    #[allow(clippy::result_large_err)]
    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>, FatalError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let used = self.used.load(Ordering::Relaxed);
        let block = size
            .max(1)
            .checked_add(ARENA_ALIGN - 1)
            .map(|s| s & !(ARENA_ALIGN - 1))
            .filter(|block| *block <= N - used)
            .ok_or(FatalError::BootstrapExhausted {
                requested: size,
                used,
                capacity: N,
            })?;

        let ptr = unsafe { self.base().add(used) };
        self.used.store(used + block, Ordering::Release);
        log::trace!("bootstrap block {:p} ({} bytes)", ptr, block);
        Ok(unsafe { NonNull::new_unchecked(ptr) })
    }

    pub fn owns(&self, ptr: *const c_void) -> bool {
        let base = self.base() as usize;
        let addr = ptr as usize;
        addr >= base && addr < base + self.used()
    }

    /// Bytes between `ptr` and the end of the used region.
    ///
    /// Blocks do not record their size, so this is the largest amount that can
    /// be read from an arena-owned pointer without leaving the arena.
    pub fn span_from(&self, ptr: *const c_void) -> usize {
        if !self.owns(ptr) {
            return 0;
        }
        self.base() as usize + self.used() - ptr as usize
    }
}

impl<const N: usize> Default for BootstrapArena<N> {
    fn default() -> Self {
        Self::new()
    }
}
