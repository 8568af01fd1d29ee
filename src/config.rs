use std::{ffi::CStr, time::Duration};

/// Enables per-call diagnostics on stderr when set to [`DEBUG_ENABLED`].
pub const DEBUG_ENV: &CStr = c"MEM_SAFI_DEBUG";
pub const DEBUG_ENABLED: &[u8] = b"1";

/// Seconds between periodic reports; `0` leaves only the final report.
pub const PERIOD_ENV: &CStr = c"MEM_SAFI_PERIOD";

pub const DEFAULT_PERIOD: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Config {
    pub debug: bool,
    pub period: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            debug: false,
            period: DEFAULT_PERIOD,
        }
    }
}

impl Config {
    /// Reads the configuration from the process environment.
    ///
    /// Uses `getenv` directly: `std::env` allocates, and this runs before the
    /// real allocator is bound.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| {
            let value = unsafe { libc::getenv(name.as_ptr()) };
            if value.is_null() {
                None
            } else {
                Some(unsafe { CStr::from_ptr(value) }.to_bytes())
            }
        })
    }

    pub fn from_lookup<'a, F>(lookup: F) -> Self
    where
        F: Fn(&CStr) -> Option<&'a [u8]>,
    {
        Self {
            debug: lookup(DEBUG_ENV) == Some(DEBUG_ENABLED),
            period: lookup(PERIOD_ENV)
                .and_then(parse_seconds)
                .unwrap_or(DEFAULT_PERIOD),
        }
    }
}

fn parse_seconds(value: &[u8]) -> Option<Duration> {
    std::str::from_utf8(value)
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}
