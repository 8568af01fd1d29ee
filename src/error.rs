use std::{ffi::CStr, fmt};

use thiserror::Error;

use crate::logger;

/// Conditions under which the process cannot keep running with the
/// interposer loaded.
#[derive(Debug, Error)]
pub enum FatalError {
    #[error(
        "bootstrap arena exhausted: {requested} bytes requested, {used} of {capacity} bytes in use"
    )]
    BootstrapExhausted {
        requested: usize,
        used: usize,
        capacity: usize,
    },
    #[error("failed to resolve `{symbol}`: {reason}")]
    SymbolNotFound {
        symbol: &'static str,
        reason: DlError,
    },
    #[error("program entry point was never captured")]
    EntryPointMissing,
}

const DL_ERROR_CAPACITY: usize = 160;

/// Copy of the dynamic linker's last error message.
///
/// Kept inline because it is produced while the real allocator may not be
/// bound yet.
#[derive(Clone, Copy)]
pub struct DlError {
    buf: [u8; DL_ERROR_CAPACITY],
    len: usize,
}

impl DlError {
    pub fn new(message: &str) -> Self {
        Self::from_bytes(message.as_bytes())
    }

    /// Takes the pending `dlerror()` message, if any.
    pub fn last() -> Self {
        let message = unsafe { libc::dlerror() };
        if message.is_null() {
            Self::new("symbol not found")
        } else {
            Self::from_bytes(unsafe { CStr::from_ptr(message) }.to_bytes())
        }
    }

    fn from_bytes(bytes: &[u8]) -> Self {
        let mut buf = [0; DL_ERROR_CAPACITY];
        let len = bytes.len().min(DL_ERROR_CAPACITY);
        buf[..len].copy_from_slice(&bytes[..len]);
        Self { buf, len }
    }

    pub fn as_str(&self) -> &str {
        match std::str::from_utf8(&self.buf[..self.len]) {
            Ok(s) => s,
            // Truncation may split a multi-byte character.
            Err(e) => {
                let valid = &self.buf[..e.valid_up_to()];
                std::str::from_utf8(valid).unwrap_or_default()
            }
        }
    }
}

impl fmt::Display for DlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for DlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("DlError").field(&self.as_str()).finish()
    }
}

/// Reports `err` on stderr and terminates the process immediately.
///
/// `_exit` skips atexit handlers: they may allocate, and the allocator is
/// exactly what is broken at this point.
pub fn die(err: &FatalError) -> ! {
    logger::write_stderr(format_args!("memsafi: fatal: {}\n", err));
    unsafe { libc::_exit(1) }
}
