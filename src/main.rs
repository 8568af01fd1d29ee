use anyhow::{bail, Context};
use getopts::{Options, ParsingStyle};
use memsafi::config::{DEBUG_ENABLED, DEBUG_ENV, PERIOD_ENV};
use std::{
    env,
    ffi::{OsStr, OsString},
    os::unix::{ffi::OsStrExt, process::ExitStatusExt},
    path::{Path, PathBuf},
    process::{self, Command},
};

const PROGRAM_DESC: &str = "Report the heap usage of a program";
const PROGRAM_NAME: &str = "memsafi";
const PRELOAD_LIB: &str = "libmemsafi.so";

fn options() -> Options {
    let mut opts = Options::new();
    opts.parsing_style(ParsingStyle::StopAtFirstFree);
    opts.optflag("d", "debug", "Trace every intercepted call on stderr");
    opts.optopt(
        "p",
        "period",
        "Seconds between reports, 0 for a final report only",
        "SECS",
    );
    opts.optopt(
        "l",
        "lib",
        "Preload library (default: libmemsafi.so next to this executable)",
        "PATH",
    );
    opts.optflag("h", "help", "Print this help");
    opts
}

/// `LD_PRELOAD` value that loads `lib` ahead of whatever was already preloaded.
fn preload_value(lib: &Path, existing: Option<OsString>) -> OsString {
    let mut value = lib.as_os_str().to_owned();
    if let Some(existing) = existing.filter(|e| !e.is_empty()) {
        value.push(":");
        value.push(existing);
    }
    value
}

fn default_lib() -> Result<PathBuf, anyhow::Error> {
    let exe = env::current_exe().context("cannot locate the memsafi executable")?;
    Ok(exe.with_file_name(PRELOAD_LIB))
}

fn build_command(
    program: &[String],
    lib: &Path,
    debug: bool,
    period: Option<u64>,
) -> Result<Command, anyhow::Error> {
    let (target, args) = match program.split_first() {
        Some(split) => split,
        None => bail!("no program to run"),
    };

    let mut cmd = Command::new(target);
    cmd.args(args)
        .env("LD_PRELOAD", preload_value(lib, env::var_os("LD_PRELOAD")));
    if debug {
        cmd.env(
            OsStr::from_bytes(DEBUG_ENV.to_bytes()),
            OsStr::from_bytes(DEBUG_ENABLED),
        );
    }
    if let Some(period) = period {
        cmd.env(OsStr::from_bytes(PERIOD_ENV.to_bytes()), period.to_string());
    }
    Ok(cmd)
}

fn main() -> Result<(), anyhow::Error> {
    let opts = options();
    let matches = opts.parse(env::args_os().skip(1))?;

    if matches.opt_present("help") || matches.free.is_empty() {
        let brief = format!(
            "{}: {}\n\nUsage: {} [options] PROGRAM [ARGS...]",
            PROGRAM_NAME, PROGRAM_DESC, PROGRAM_NAME
        );
        eprint!("{}", opts.usage(&brief));
        return Ok(());
    }

    let period: Option<u64> = matches
        .opt_get("period")
        .context("--period expects a number of seconds")?;
    let lib = match matches.opt_str("lib") {
        Some(lib) => PathBuf::from(lib),
        None => default_lib()?,
    };
    let lib = lib
        .canonicalize()
        .with_context(|| format!("preload library {} not found", lib.display()))?;

    let mut cmd = build_command(&matches.free, &lib, matches.opt_present("debug"), period)?;
    let status = cmd
        .status()
        .with_context(|| format!("failed to run {}", matches.free[0]))?;

    process::exit(
        status
            .code()
            .unwrap_or_else(|| 128 + status.signal().unwrap_or(0)),
    );
}
