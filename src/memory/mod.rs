pub(crate) mod cache_pool;
pub(crate) mod config;
pub(crate) mod fallback;
pub(crate) mod framing;
#[cfg(not(loom))]
pub(crate) mod global;
pub(crate) mod multiplexer;
pub(crate) mod provider;
pub(crate) mod stats;
pub(crate) mod unit_pool;
pub(crate) mod vm;

/// Halt the process: the allocator's own bookkeeping is broken.
///
/// Never unwinds. A panic would poison the pool locks, and the next caller
/// would reopen them over a list already known to be wrong.
#[cold]
#[inline(never)]
pub(crate) fn bookkeeping_corrupted(args: std::fmt::Arguments<'_>) -> ! {
    log::error!("segpool bookkeeping corrupted: {args}");
    std::process::abort()
}

// Tests that assert on the process-wide counters in `stats` take the write
// side; every other test that commits pages takes the read side.
#[cfg(all(test, not(loom)))]
pub static TEST_MUTEX: std::sync::RwLock<()> = std::sync::RwLock::new(());

#[cfg(all(test, not(loom), not(miri)))]
const ABORT_CHILD_ENV: &str = "SEGPOOL_EXPECT_ABORT";

/// Run `body` in a child copy of the test binary and require it to abort.
///
/// `test_path` is the libtest name of the calling test, e.g.
/// `memory::unit_pool::tests::test_cycle_aborts_decommit_scan`. In the child, `body` runs
/// directly; returning from it is a failure seen by the parent.
#[cfg(all(test, not(loom), not(miri)))]
pub(crate) fn assert_aborts(test_path: &str, body: impl FnOnce()) {
    use std::os::unix::process::ExitStatusExt;
    use std::process::{Command, Stdio};

    if std::env::var_os(ABORT_CHILD_ENV).is_some() {
        body();
        return;
    }
    let status = Command::new(std::env::current_exe().unwrap())
        .args([test_path, "--exact", "--nocapture", "--test-threads=1"])
        .env(ABORT_CHILD_ENV, "1")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .unwrap();
    assert_eq!(
        status.signal(),
        Some(libc::SIGABRT),
        "{test_path} was expected to abort, exited with {status}"
    );
}
