//! Wrapping of the program's `main` so that the final report is printed once
//! the program's own logic is done.

use std::{
    ffi::{c_void, CStr},
    mem,
};

use libc::{c_char, c_int};
use once_cell::sync::OnceCell;

use crate::{
    error::{die, FatalError},
    interceptor::Interceptor,
    resolver::Platform,
};

pub type MainFn =
    unsafe extern "C" fn(argc: c_int, argv: *mut *mut c_char, envp: *mut *mut c_char) -> c_int;

pub type HookFn = Option<unsafe extern "C" fn()>;

/// Signature of glibc's `__libc_start_main`.
pub type StartMainFn = unsafe extern "C" fn(
    main: MainFn,
    argc: c_int,
    argv: *mut *mut c_char,
    init: HookFn,
    fini: HookFn,
    rtld_fini: HookFn,
    stack_end: *mut c_void,
) -> c_int;

pub const START_MAIN_SYMBOL: &CStr = c"__libc_start_main";

/// Finds the `__libc_start_main` that the interposed one shadows.
// `FatalError` carries the `dlerror` text inline, since boxing it would allocate.
#[allow(clippy::result_large_err)]
pub fn resolve_start_main<P: Platform>(platform: &P) -> Result<StartMainFn, FatalError> {
    let addr = platform.lookup(START_MAIN_SYMBOL)?;
    Ok(unsafe { mem::transmute::<*mut c_void, StartMainFn>(addr.as_ptr()) })
}

/// The program's real `main`, captured at startup.
#[derive(Debug)]
pub struct EntryPoint {
    main: OnceCell<MainFn>,
}

impl EntryPoint {
    pub const fn new() -> Self {
        Self {
            main: OnceCell::new(),
        }
    }

    /// Records `main`. Only the first call has an effect.
    pub fn capture(&self, main: MainFn) -> bool {
        self.main.set(main).is_ok()
    }

    /// Runs the captured `main`, then stops periodic reporting and emits the
    /// final report before handing back `main`'s exit code.
    ///
    /// # Safety
    ///
    /// `argc`, `argv` and `envp` must be what the C runtime passes to `main`.
    pub unsafe fn run<P: Platform, const N: usize>(
        &self,
        interceptor: &'static Interceptor<P, N>,
        argc: c_int,
        argv: *mut *mut c_char,
        envp: *mut *mut c_char,
    ) -> c_int {
        let main = match self.main.get() {
            Some(main) => *main,
            None => die(&FatalError::EntryPointMissing),
        };

        let code = main(argc, argv, envp);
        log::debug!("main returned {}", code);

        interceptor.shutdown();
        code
    }
}

impl Default for EntryPoint {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::Config, testing::FakePlatform};
    use std::{ptr, time::Duration};

    type TestInterceptor = Interceptor<FakePlatform, 1024>;

    static ALLOCATED_IN_MAIN: OnceCell<&'static TestInterceptor> = OnceCell::new();

    unsafe extern "C" fn fake_main(
        argc: c_int,
        _argv: *mut *mut c_char,
        _envp: *mut *mut c_char,
    ) -> c_int {
        if let Some(interceptor) = ALLOCATED_IN_MAIN.get() {
            let ptr = interceptor.malloc(64);
            interceptor.free(ptr);
        }
        argc + 40
    }

    #[test]
    fn run_returns_main_exit_code_and_stops_reporting() {
        let interceptor: &'static TestInterceptor =
            Box::leak(Box::new(TestInterceptor::new(FakePlatform::new())));
        interceptor.configure(Config {
            debug: false,
            period: Duration::from_secs(3600),
        });
        ALLOCATED_IN_MAIN.set(interceptor).ok();

        let entry = EntryPoint::new();
        assert!(entry.capture(fake_main));
        assert!(!entry.capture(fake_main));

        let code = unsafe { entry.run(interceptor, 2, ptr::null_mut(), ptr::null_mut()) };
        assert_eq!(code, 42);
        assert!(interceptor.reporter().is_stopped());

        let s = interceptor.stats().snapshot();
        assert_eq!((s.mallocs, s.frees), (1, 1));
        assert_eq!(s.reserved, 0);
        assert_eq!(s.peak_reserved, 64);
    }

    #[test]
    fn start_main_lookup_failure_is_reported() {
        let platform = FakePlatform::new();
        match resolve_start_main(&platform) {
            Err(FatalError::SymbolNotFound { symbol, .. }) => {
                assert_eq!(symbol, "__libc_start_main")
            }
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("fake platform has no __libc_start_main"),
        }
    }
}
