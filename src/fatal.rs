//! Fatal-error reporting.
//!
//! Two kinds of conditions are fatal here: programmer bugs (misaligned
//! addresses, double-free, zero-size requests, bad memory types) and
//! resource exhaustion without an opt-in `CAN_FAIL`. Neither returns. A
//! platform may register a [`FatalSink`] to drop into its own shell or UI
//! before halting; with none registered the default is an
//! interrupts-already-disabled halt loop — there is no recovery path and no
//! re-entrancy once one of these fires.
//!
//! Under `#[cfg(test)]` both macros panic instead of halting, so the tests
//! in [`crate::heap`] and [`crate::pmm`] can assert on the fatal paths
//! (double-free, bad-free, zero-size alloc) with `#[should_panic]`.

use core::fmt;

use crate::sync::Mutex;

/// Platform hook invoked before the loader gives up entirely. Implementors
/// may paint a UI window, drop to an interactive shell, or simply return —
/// the caller halts regardless once this returns.
pub trait FatalSink: Sync {
    fn report(&self, kind: &str, args: fmt::Arguments<'_>);
}

static SINK: Mutex<Option<&'static dyn FatalSink>> = Mutex::new(None);

pub fn set_sink(sink: &'static dyn FatalSink) {
    *SINK.lock() = Some(sink);
}

#[cfg(not(test))]
fn current_sink() -> Option<&'static dyn FatalSink> {
    *SINK.lock()
}

#[doc(hidden)]
#[cfg(not(test))]
pub fn halt(kind: &str, args: fmt::Arguments<'_>) -> ! {
    crate::kerror!("{}: {}", kind, args);
    if let Some(sink) = current_sink() {
        sink.report(kind, args);
    }
    loop {
        core::hint::spin_loop();
    }
}

#[doc(hidden)]
#[cfg(test)]
pub fn halt(kind: &str, args: fmt::Arguments<'_>) -> ! {
    panic!("{}: {}", kind, args);
}

/// A programmer bug: misaligned request, double-free, zero-size allocation,
/// unknown memory type. Never returns.
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::fatal::halt("internal error", format_args!($($arg)*))
    };
}

/// Resource exhaustion without `CAN_FAIL`: the PMM has no range satisfying
/// the request. Never returns.
#[macro_export]
macro_rules! boot_error {
    ($($arg:tt)*) => {
        $crate::fatal::halt("boot error", format_args!($($arg)*))
    };
}
