//! Zero-overhead leveled logging for the boot-time memory manager.
//!
//! Mirrors the levels of a kernel logger (ERROR/WARN/INFO/DEBUG/TRACE) but
//! writes through a pluggable [`DebugSink`] instead of a hardcoded UART,
//! since the same crate backs BIOS and EFI loaders that each own a
//! different debug console. `no_logs` strips every call site to nothing;
//! `log_info`/`log_debug`/`log_trace` progressively unlock the noisier
//! levels without assuming which byte-sink the messages end up on.

use core::fmt;

use crate::sync::Mutex;

/// A platform-supplied debug console. Implementors back onto whatever the
/// loader already uses for diagnostics (serial port, EFI `SimpleTextOutput`,
/// a VGA console) — this crate never assumes one directly.
pub trait DebugSink: Sync {
    fn write_str(&self, s: &str);
}

struct NullSink;
impl DebugSink for NullSink {
    fn write_str(&self, _s: &str) {}
}

static NULL_SINK: NullSink = NullSink;
static SINK: Mutex<Option<&'static dyn DebugSink>> = Mutex::new(None);

/// Install the platform's debug sink. Must outlive every subsequent log call.
pub fn set_sink(sink: &'static dyn DebugSink) {
    *SINK.lock() = Some(sink);
}

fn current_sink() -> &'static dyn DebugSink {
    SINK.lock().unwrap_or(&NULL_SINK)
}

#[doc(hidden)]
pub fn emit(args: fmt::Arguments<'_>) {
    struct Writer;
    impl fmt::Write for Writer {
        fn write_str(&mut self, s: &str) -> fmt::Result {
            current_sink().write_str(s);
            Ok(())
        }
    }
    use fmt::Write;
    let _ = Writer.write_fmt(args);
    current_sink().write_str("\n");
}

// ANSI color codes for terminals that support them (QEMU's serial console
// does) — bold red/yellow, green, cyan, magenta, same mapping the teacher
// uses per level.
pub const P_ERROR: &str = "\x1b[1;31m[ERROR]\x1b[0m ";
pub const P_WARN: &str = "\x1b[1;33m[WARN]\x1b[0m  ";
pub const P_INFO: &str = "\x1b[32m[INFO]\x1b[0m  ";
pub const P_DEBUG: &str = "\x1b[36m[DEBUG]\x1b[0m ";
pub const P_TRACE: &str = "\x1b[35m[TRACE]\x1b[0m ";

#[cfg(not(feature = "no_logs"))]
#[macro_export]
macro_rules! kerror {
    ($($arg:tt)*) => {
        $crate::log::emit(format_args!("{}{}", $crate::log::P_ERROR, format_args!($($arg)*)))
    };
}
#[cfg(feature = "no_logs")]
#[macro_export]
macro_rules! kerror {
    ($($arg:tt)*) => {{}};
}

#[cfg(not(feature = "no_logs"))]
#[macro_export]
macro_rules! kwarn {
    ($($arg:tt)*) => {
        $crate::log::emit(format_args!("{}{}", $crate::log::P_WARN, format_args!($($arg)*)))
    };
}
#[cfg(feature = "no_logs")]
#[macro_export]
macro_rules! kwarn {
    ($($arg:tt)*) => {{}};
}

#[cfg(not(feature = "no_logs"))]
#[macro_export]
macro_rules! kinfo {
    ($($arg:tt)*) => {
        $crate::log::emit(format_args!("{}{}", $crate::log::P_INFO, format_args!($($arg)*)))
    };
}
#[cfg(feature = "no_logs")]
#[macro_export]
macro_rules! kinfo {
    ($($arg:tt)*) => {{}};
}

#[cfg(any(feature = "log_trace", feature = "log_debug"))]
#[macro_export]
macro_rules! kdebug {
    ($($arg:tt)*) => {
        $crate::log::emit(format_args!("{}{}", $crate::log::P_DEBUG, format_args!($($arg)*)))
    };
}
#[cfg(not(any(feature = "log_trace", feature = "log_debug")))]
#[macro_export]
macro_rules! kdebug {
    ($($arg:tt)*) => {{}};
}

#[cfg(feature = "log_trace")]
#[macro_export]
macro_rules! ktrace {
    ($($arg:tt)*) => {
        $crate::log::emit(format_args!("{}{}", $crate::log::P_TRACE, format_args!($($arg)*)))
    };
}
#[cfg(not(feature = "log_trace"))]
#[macro_export]
macro_rules! ktrace {
    ($($arg:tt)*) => {{}};
}

/// Prefix-less emission, for building up a line out of several pieces
/// without a level tag on each one.
#[cfg(not(feature = "no_logs"))]
#[macro_export]
macro_rules! klog {
    ($($arg:tt)*) => {
        $crate::log::emit(format_args!($($arg)*))
    };
}
#[cfg(feature = "no_logs")]
#[macro_export]
macro_rules! klog {
    ($($arg:tt)*) => {{}};
}
