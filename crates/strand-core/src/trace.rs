//! Trace output for the fiber runtime
//!
//! Small leveled logger writing complete lines to stderr, one write per
//! record, so records from different OS threads never interleave
//! mid-line. Fibers suspend at arbitrary points, so nothing buffers
//! between the caller and the sink.
//!
//! Configured once from the `STRAND_TRACE` environment variable, a
//! comma-separated spec:
//!
//! - a verbosity word: `off`, `error`, `warn`, `info`, `debug`, `trace`
//! - `flush`: flush stderr after every record (useful when debugging
//!   crashes)
//!
//! The default verbosity is `warn`. `STRAND_TRACE=debug` or
//! `STRAND_TRACE=trace,flush` are typical.
//!
//! ```ignore
//! use strand_core::{fdebug, fwarn};
//!
//! fdebug!("switching to '{}'", name);
//! fwarn!("unexpected state: {:?}", state);
//! ```

use std::fmt;
use std::fmt::Write as _;
use std::io::Write as _;
use std::sync::atomic::{AtomicU32, Ordering};

/// Record severity, most to least urgent
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl Level {
    /// Single-character tag used in record prefixes
    fn tag(self) -> char {
        match self {
            Level::Error => 'E',
            Level::Warn => 'W',
            Level::Info => 'I',
            Level::Debug => 'D',
            Level::Trace => 'T',
        }
    }

    /// Parse one verbosity word
    pub fn parse(word: &str) -> Option<Level> {
        match word {
            "error" => Some(Level::Error),
            "warn" => Some(Level::Warn),
            "info" => Some(Level::Info),
            "debug" => Some(Level::Debug),
            "trace" => Some(Level::Trace),
            _ => None,
        }
    }
}

// Config word layout: bit 31 marks the word initialized, bit 3
// requests flushing, bits 0-2 hold the highest enabled level plus one.
// A zero level field silences everything.
const READY: u32 = 1 << 31;
const FLUSH: u32 = 1 << 3;
const LEVEL_MASK: u32 = 0x7;

static CONFIG: AtomicU32 = AtomicU32::new(0);

fn threshold(level: Option<Level>) -> u32 {
    match level {
        Some(level) => level as u32 + 1,
        None => 0,
    }
}

fn config() -> u32 {
    let word = CONFIG.load(Ordering::Relaxed);
    if word & READY != 0 {
        return word;
    }
    let env = std::env::var("STRAND_TRACE").ok();
    let word = READY | parse_spec(env.as_deref());
    CONFIG.store(word, Ordering::Relaxed);
    word
}

fn parse_spec(spec: Option<&str>) -> u32 {
    let mut word = threshold(Some(Level::Warn));
    let spec = match spec {
        Some(spec) => spec,
        None => return word,
    };
    for part in spec.split(',') {
        let part = part.trim().to_ascii_lowercase();
        match part.as_str() {
            "" => {}
            "flush" => word |= FLUSH,
            "off" => word &= !LEVEL_MASK,
            other => {
                if let Some(level) = Level::parse(other) {
                    word = (word & !LEVEL_MASK) | threshold(Some(level));
                }
            }
        }
    }
    word
}

/// Override verbosity; `None` silences all records
pub fn set_verbosity(level: Option<Level>) {
    let flush = CONFIG.load(Ordering::Relaxed) & FLUSH;
    CONFIG.store(READY | flush | threshold(level), Ordering::Relaxed);
}

/// Whether records at `level` are currently emitted
#[inline]
pub fn enabled(level: Level) -> bool {
    (config() & LEVEL_MASK) >= level as u32 + 1
}

/// Format and write one record.
///
/// The line is assembled off to the side first so stderr sees exactly
/// one write per record.
#[doc(hidden)]
pub fn emit(level: Level, args: fmt::Arguments<'_>) {
    let word = config();
    if (word & LEVEL_MASK) < level as u32 + 1 {
        return;
    }

    let thread = std::thread::current();
    let mut line = String::with_capacity(80);
    let _ = writeln!(
        line,
        "strand[{}:{}] {}",
        thread.name().unwrap_or("?"),
        level.tag(),
        args
    );

    let mut err = std::io::stderr().lock();
    let _ = err.write_all(line.as_bytes());
    if word & FLUSH != 0 {
        let _ = err.flush();
    }
}

/// Error level record
#[macro_export]
macro_rules! ferror {
    ($($arg:tt)*) => {
        $crate::trace::emit($crate::trace::Level::Error, format_args!($($arg)*))
    };
}

/// Warning level record
#[macro_export]
macro_rules! fwarn {
    ($($arg:tt)*) => {
        $crate::trace::emit($crate::trace::Level::Warn, format_args!($($arg)*))
    };
}

/// Info level record
#[macro_export]
macro_rules! finfo {
    ($($arg:tt)*) => {
        $crate::trace::emit($crate::trace::Level::Info, format_args!($($arg)*))
    };
}

/// Debug level record
#[macro_export]
macro_rules! fdebug {
    ($($arg:tt)*) => {
        $crate::trace::emit($crate::trace::Level::Debug, format_args!($($arg)*))
    };
}

/// Trace level record (most verbose)
#[macro_export]
macro_rules! ftrace {
    ($($arg:tt)*) => {
        $crate::trace::emit($crate::trace::Level::Trace, format_args!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering() {
        assert!(Level::Error < Level::Warn);
        assert!(Level::Warn < Level::Info);
        assert!(Level::Info < Level::Debug);
        assert!(Level::Debug < Level::Trace);
    }

    #[test]
    fn test_parse_spec() {
        assert_eq!(parse_spec(None) & LEVEL_MASK, threshold(Some(Level::Warn)));
        assert_eq!(parse_spec(Some("debug")) & LEVEL_MASK, threshold(Some(Level::Debug)));
        assert_eq!(parse_spec(Some("off")) & LEVEL_MASK, 0);
        assert_eq!(parse_spec(Some("nonsense")) & LEVEL_MASK, threshold(Some(Level::Warn)));

        let word = parse_spec(Some("trace,flush"));
        assert_eq!(word & LEVEL_MASK, threshold(Some(Level::Trace)));
        assert_ne!(word & FLUSH, 0);

        assert_eq!(parse_spec(Some("off,flush")), FLUSH);
        assert_eq!(parse_spec(Some(" Info , FLUSH ")), threshold(Some(Level::Info)) | FLUSH);
    }

    // One test for the mutable gate: tests share the process-wide
    // config word, so splitting these assertions across tests would
    // race.
    #[test]
    fn test_verbosity_gate_and_macros() {
        set_verbosity(Some(Level::Info));
        assert!(enabled(Level::Error));
        assert!(enabled(Level::Info));
        assert!(!enabled(Level::Debug));

        set_verbosity(None);
        assert!(!enabled(Level::Error));

        ferror!("error {}", "msg");
        fwarn!("warn");
        finfo!("info");
        fdebug!("debug {}", 42);
        ftrace!("trace");
    }
}
