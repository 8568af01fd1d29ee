//! Companion crate to [`memsafi`].  This crate compiles into a dynamic library that can be
//! loaded via `LD_PRELOAD` to intercept the allocation calls issued by a program and report
//! its heap usage on stderr.

use libc::{c_char, c_int, c_void};
use memsafi::{
    error::die,
    lifecycle::{self, HookFn, MainFn},
    DynamicLinker, EntryPoint, Interceptor,
};

static INTERCEPTOR: Interceptor<DynamicLinker> = Interceptor::new(DynamicLinker);

static ENTRY: EntryPoint = EntryPoint::new();

/// When this library is loaded with `LD_PRELOAD`, this `malloc` implementation
/// catches `malloc` calls performed by the program, forwards them to the
/// original `libc` malloc and records the usable size of the result.
///
/// # Safety
///
/// Same contract as libc `malloc`.
#[no_mangle]
pub unsafe extern "C" fn malloc(size: libc::size_t) -> *mut c_void {
    INTERCEPTOR.malloc(size)
}

/// # Safety
///
/// Same contract as libc `calloc`.
#[no_mangle]
pub unsafe extern "C" fn calloc(count: libc::size_t, size: libc::size_t) -> *mut c_void {
    INTERCEPTOR.calloc(count, size)
}

/// # Safety
///
/// Same contract as libc `realloc`.
#[no_mangle]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: libc::size_t) -> *mut c_void {
    INTERCEPTOR.realloc(ptr, size)
}

/// # Safety
///
/// Same contract as libc `free`.
#[no_mangle]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    INTERCEPTOR.free(ptr)
}

/// Shadows glibc's `__libc_start_main` to run the program's `main` through
/// [`main_hook`], which prints the final report once `main` returns.
///
/// # Safety
///
/// Only meant to be called by the C runtime's startup code.
#[no_mangle]
pub unsafe extern "C" fn __libc_start_main(
    main: MainFn,
    argc: c_int,
    argv: *mut *mut c_char,
    init: HookFn,
    fini: HookFn,
    rtld_fini: HookFn,
    stack_end: *mut c_void,
) -> c_int {
    ENTRY.capture(main);
    let start_main = lifecycle::resolve_start_main(INTERCEPTOR.resolver().platform())
        .unwrap_or_else(|err| die(&err));
    start_main(main_hook, argc, argv, init, fini, rtld_fini, stack_end)
}

unsafe extern "C" fn main_hook(
    argc: c_int,
    argv: *mut *mut c_char,
    envp: *mut *mut c_char,
) -> c_int {
    ENTRY.run(&INTERCEPTOR, argc, argv, envp)
}
