// Synchronization primitive shim.
//
// Under `cfg(loom)`, re-exports from `loom` so the model checker can explore
// every interleaving of the provider and cache-pool critical sections.
// Otherwise, re-exports from `std`.
//
// Every file in the crate imports sync primitives through this module. A
// direct `use std::sync::Mutex` would bypass loom's scheduler.
#![allow(unused_imports, unused_macros)]

// ---------------------------------------------------------------------------
// atomic
// ---------------------------------------------------------------------------
pub(crate) mod atomic {
    #[cfg(loom)]
    pub(crate) use loom::sync::atomic::{AtomicBool, AtomicIsize, AtomicU64, AtomicUsize, Ordering};

    #[cfg(not(loom))]
    pub(crate) use std::sync::atomic::{AtomicBool, AtomicIsize, AtomicU64, AtomicUsize, Ordering};
}

// ---------------------------------------------------------------------------
// sync (Mutex, MutexGuard, Arc)
// ---------------------------------------------------------------------------
#[cfg(loom)]
pub(crate) use loom::sync::{Arc, Mutex, MutexGuard};

#[cfg(not(loom))]
pub(crate) use std::sync::{Arc, Mutex, MutexGuard};

/// Lock a mutex, recovering the guard if a previous holder panicked.
///
/// Only caller-misuse checks panic under these locks, and they fire before
/// any list is touched. Broken bookkeeping aborts instead
/// (`memory::bookkeeping_corrupted`), so a recovered guard never exposes a
/// half-rewritten list.
#[inline]
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// thread
// ---------------------------------------------------------------------------
pub(crate) mod thread {
    #[cfg(loom)]
    pub(crate) use loom::thread::{JoinHandle, spawn, yield_now};

    #[cfg(not(loom))]
    pub(crate) use std::thread::{JoinHandle, spawn, yield_now};
}

// ---------------------------------------------------------------------------
// Barrier. Only std tests use it; loom tests join instead.
// ---------------------------------------------------------------------------
pub(crate) mod barrier {
    #[cfg(not(loom))]
    pub(crate) use std::sync::Barrier;
}

// ---------------------------------------------------------------------------
// OnceLock. Only the real platform VM layer caches values in statics; the
// loom/miri mock returns constants, so no loom shim is needed.
// ---------------------------------------------------------------------------
#[cfg(not(loom))]
pub(crate) use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// Static initialisation helpers
//
// loom atomics are not const-constructible. This macro creates statics that
// work under both loom and std.
// ---------------------------------------------------------------------------

/// Declare a `static` atomic. Under std, uses `const` init. Under loom,
/// uses `loom::lazy_static!` so the value is re-created for each model run.
///
/// Usage: `static_atomic! { [pub] static NAME: Type = init_expr; }`
#[allow(unused_macro_rules)]
macro_rules! static_atomic {
    (pub static $NAME:ident : $Ty:ty = $init:expr ;) => {
        #[cfg(not(loom))]
        pub static $NAME: $Ty = $init;

        #[cfg(loom)]
        loom::lazy_static! {
            pub static ref $NAME: $Ty = $init;
        }
    };
    (static $NAME:ident : $Ty:ty = $init:expr ;) => {
        #[cfg(not(loom))]
        static $NAME: $Ty = $init;

        #[cfg(loom)]
        loom::lazy_static! {
            static ref $NAME: $Ty = $init;
        }
    };
}
pub(crate) use static_atomic;
