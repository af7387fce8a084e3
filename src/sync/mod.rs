//! Synchronization primitive used by the heap and PMM singletons.
//!
//! Both own a single piece of process-wide state that spec.md §5 requires
//! to stay exclusively owned by the caller, with no re-entrancy from
//! interrupt handlers. A spinning mutex is the right shape: the loader
//! never sleeps, so there is no scheduler to hand control to while waiting,
//! and the lock exists to turn an accidental re-entrant call into a hang
//! rather than silent corruption.

pub use spin::{Mutex, MutexGuard};
