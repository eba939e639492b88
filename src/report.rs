//! The operator-facing message stream.
//!
//! Everything user-visible funnels through one `Reporter` handle: it owns
//! the message lock (so concurrent checks cannot interleave within a line),
//! the optional log-file tee, and the delayed-fatality bit that biases the
//! process exit code to 1 without stopping the run.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use camino::Utf8Path;

struct Inner {
    log_file: Option<File>,
    verbose: u8,
}

#[derive(Clone)]
pub struct Reporter {
    inner: Arc<Mutex<Inner>>,
    fatal_later: Arc<AtomicBool>,
    /// Prefix continuation style: `RR> ` on the first line of a message,
    /// `rr> ` on the rest. Empty for chk, which prefixes nothing.
    decorated: bool,
}

impl Reporter {
    pub fn new(verbose: u8) -> Self {
        Reporter {
            inner: Arc::new(Mutex::new(Inner {
                log_file: None,
                verbose,
            })),
            fatal_later: Arc::new(AtomicBool::new(false)),
            decorated: false,
        }
    }

    /// The rr flavour: every message line carries the `RR> `/`rr> `
    /// prefixes.
    pub fn decorated(verbose: u8) -> Self {
        Reporter {
            decorated: true,
            ..Reporter::new(verbose)
        }
    }

    /// Tee every emitted line to `path`, appending.
    pub fn log_to(&self, path: &Utf8Path) -> Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open {path}"))?;
        self.inner.lock().unwrap().log_file = Some(file);
        Ok(())
    }

    pub fn verbosity(&self) -> u8 {
        self.inner.lock().unwrap().verbose
    }

    fn emit(&self, first_prefix: &str, rest_prefix: &str, text: fmt::Arguments<'_>) {
        let rendered = text.to_string();
        let mut inner = self.inner.lock().unwrap();
        let mut out = String::new();
        for (i, line) in rendered.split('\n').enumerate() {
            out.push_str(if i == 0 { first_prefix } else { rest_prefix });
            out.push_str(line);
            out.push('\n');
        }
        eprint!("{out}");
        if let Some(log) = inner.log_file.as_mut() {
            let _ = log.write_all(out.as_bytes());
        }
    }

    pub fn msg(&self, text: fmt::Arguments<'_>) {
        if self.decorated {
            self.emit("RR> ", "rr> ", text);
        } else {
            self.emit("", "", text);
        }
    }

    pub fn warn(&self, text: fmt::Arguments<'_>) {
        if self.decorated {
            self.emit("RR> WARNING: ", "rr> ", text);
        } else {
            self.emit("WARNING: ", "", text);
        }
    }

    pub fn error(&self, text: fmt::Arguments<'_>) {
        self.emit("*** ", "*** ", text);
    }

    pub fn verbose(&self, text: fmt::Arguments<'_>) {
        if self.verbosity() >= 1 {
            self.msg(text);
        }
    }

    pub fn verbose_var(&self, var: &str, value: &str) {
        if self.verbosity() >= 2 {
            self.msg(format_args!(
                "Variable: {var} = {}",
                if value.is_empty() { "(empty)" } else { value }
            ));
        }
    }

    /// Note a non-fatal problem: the run continues but the final exit code
    /// becomes 1.
    pub fn fatal_later(&self, text: fmt::Arguments<'_>) {
        self.error(text);
        self.fatal_later.store(true, Ordering::Release);
    }

    pub fn saw_fatal_later(&self) -> bool {
        self.fatal_later.load(Ordering::Acquire)
    }

    /// The exit code the process should end with.
    pub fn exit_code(&self) -> i32 {
        i32::from(self.saw_fatal_later())
    }
}

/// `msg!(reporter, "...")` and friends keep call sites terse.
#[macro_export]
macro_rules! msg {
    ($reporter:expr, $($arg:tt)*) => {
        $reporter.msg(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! warn_msg {
    ($reporter:expr, $($arg:tt)*) => {
        $reporter.warn(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! verbose_msg {
    ($reporter:expr, $($arg:tt)*) => {
        $reporter.verbose(format_args!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_later_biases_the_exit_code() {
        let reporter = Reporter::new(0);
        assert_eq!(reporter.exit_code(), 0);
        reporter.fatal_later(format_args!("something went sideways"));
        assert_eq!(reporter.exit_code(), 1);
    }

    #[test]
    fn log_tee_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = camino::Utf8PathBuf::from_path_buf(dir.path().join("log")).unwrap();
        let reporter = Reporter::new(0);
        reporter.log_to(&path).unwrap();
        reporter.msg(format_args!("one"));
        reporter.msg(format_args!("two"));
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "one\ntwo\n");
    }

    #[test]
    fn decorated_reporter_prefixes_continuation_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = camino::Utf8PathBuf::from_path_buf(dir.path().join("log")).unwrap();
        let reporter = Reporter::decorated(0);
        reporter.log_to(&path).unwrap();
        reporter.msg(format_args!("first\nsecond"));
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "RR> first\nrr> second\n");
    }
}
